//! Flat `key=value` records shared by checkpoint and classifier persistence.

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

/// Ordered string map; ordering keeps encoded records stable across saves.
pub type Properties = BTreeMap<String, String>;

/// Errors raised while reading typed values out of a property record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("missing property `{0}`")]
    Missing(String),
    #[error("property `{key}` has invalid value `{value}`")]
    Invalid { key: String, value: String },
}

/// Borrow a required value.
pub fn require<'a>(props: &'a Properties, key: &str) -> Result<&'a str, PropertyError> {
    props
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| PropertyError::Missing(key.to_owned()))
}

/// Parse a required value with [`FromStr`].
pub fn parse_property<T: FromStr>(props: &Properties, key: &str) -> Result<T, PropertyError> {
    let raw = require(props, key)?;
    raw.trim().parse().map_err(|_| PropertyError::Invalid {
        key: key.to_owned(),
        value: raw.to_owned(),
    })
}

/// Render a record as text, one `key=value` line per entry.
#[must_use]
pub fn encode_properties(props: &Properties) -> String {
    let mut out = String::new();
    for (key, value) in props {
        escape_into(&mut out, key, true);
        out.push('=');
        escape_into(&mut out, value, false);
        out.push('\n');
    }
    out
}

/// Parse text produced by [`encode_properties`].
///
/// Blank lines and `#` comments are ignored. Lines without a separator are
/// skipped with a warning so a damaged line only loses the fields it held.
#[must_use]
pub fn decode_properties(text: &str) -> Properties {
    let mut props = Properties::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match split_line(line) {
            Some((key, value)) => {
                props.insert(key, value);
            }
            None => warn!(line = index + 1, "skipping malformed property line"),
        }
    }
    props
}

fn escape_into(out: &mut String, raw: &str, is_key: bool) {
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' if is_key => out.push_str("\\="),
            other => out.push(other),
        }
    }
}

fn split_line(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut chars = line.chars();
    let mut found = false;
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => key.push(unescape(chars.next()?)),
            '=' => {
                found = true;
                break;
            }
            other => key.push(other),
        }
    }
    if !found {
        return None;
    }
    let mut value = String::new();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            value.push(unescape(chars.next()?));
        } else {
            value.push(ch);
        }
    }
    Some((key, value))
}

fn unescape(ch: char) -> char {
    match ch {
        'n' => '\n',
        'r' => '\r',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_survive_encoding() {
        let mut props = Properties::new();
        props.insert("job.0.tag".into(), "line one\nline=two \\ end".into());
        props.insert("odd=key".into(), String::new());
        let text = encode_properties(&props);
        assert_eq!(text.lines().count(), 2);
        assert_eq!(decode_properties(&text), props);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let props = decode_properties("# header\nversion=1\ngarbage\n\nname = x\n");
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("version").map(String::as_str), Some("1"));
        assert_eq!(props.get("name ").map(String::as_str), Some(" x"));
    }

    #[test]
    fn typed_lookup_reports_missing_and_invalid() {
        let props = decode_properties("count=3\nbad=three\n");
        assert_eq!(parse_property::<u32>(&props, "count"), Ok(3));
        assert_eq!(
            parse_property::<u32>(&props, "absent"),
            Err(PropertyError::Missing("absent".into()))
        );
        assert!(matches!(
            parse_property::<u32>(&props, "bad"),
            Err(PropertyError::Invalid { .. })
        ));
    }
}

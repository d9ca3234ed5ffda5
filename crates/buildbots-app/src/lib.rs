//! Host plumbing for the BuildBots binary: settings loading, the command bus,
//! the demo world, and the tick loop.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use buildbots_core::RuntimeSettings;

pub mod command;
pub mod demo;
pub mod host;

pub use command::{
    CommandReceiver, CommandSender, CommandSubmit, RunnerCommand, apply_runner_command,
    create_command_bus, drain_pending_commands, make_command_submit,
};
pub use demo::{DEMO_REGION, DemoWorld};
pub use host::{Host, LogPreview, RunSummary};

/// Read settings from a JSON file, or defaults when no path is given.
/// Missing fields take their default values.
pub fn load_settings(path: Option<&Path>) -> Result<RuntimeSettings> {
    let Some(path) = path else {
        return Ok(RuntimeSettings::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading settings from {}", path.display()))?;
    let settings: RuntimeSettings = serde_json::from_str(&text)
        .with_context(|| format!("parsing settings in {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validating settings in {}", path.display()))?;
    Ok(settings)
}

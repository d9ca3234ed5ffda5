use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use buildbots_app::{
    DemoWorld, Host, LogPreview, RunnerCommand, create_command_bus, load_settings,
    make_command_submit,
};
use buildbots_brain::{ModelStore, PlacementModel};
use buildbots_core::SharedSettings;
use buildbots_jobs::Runner;
use buildbots_storage::{CheckpointStore, FileStore};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "buildbots",
    version,
    about = "Drive the BuildBots incremental build scheduler over a demo voxel world"
)]
struct Cli {
    /// JSON file with runtime settings; omitted fields keep their defaults.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Directory holding checkpoints and the placement model.
    #[arg(long, env = "BUILDBOTS_DATA_DIR", default_value = "buildbots-data")]
    data_dir: PathBuf,
    /// Maximum number of ticks to run.
    #[arg(long, default_value_t = 2_000)]
    ticks: u64,
    /// Ticks between interval checkpoints (0 disables them).
    #[arg(long, default_value_t = 100)]
    checkpoint_interval: u64,
    /// Seed for the demo world.
    #[arg(long, default_value_t = 0xB01D_B07)]
    seed: u64,
    /// Number of building agents in the demo world.
    #[arg(long, default_value_t = 3)]
    agents: usize,
    /// Ignore any saved checkpoint and start from fresh jobs.
    #[arg(long)]
    fresh: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_deref())?;

    let files = Arc::new(
        FileStore::open(&cli.data_dir)
            .with_context(|| format!("opening data dir {}", cli.data_dir.display()))?,
    );
    let models = ModelStore::new(files.clone());
    let model = models.load().unwrap_or_else(|err| {
        warn!(%err, "saved placement model unreadable; starting from defaults");
        PlacementModel::default()
    });

    let runner = Arc::new(
        Runner::new(SharedSettings::new(settings.clone()))
            .with_model(model)
            .with_model_store(models)
            .with_preview(Arc::new(LogPreview)),
    );
    let demo = DemoWorld::generate(cli.seed, cli.agents).context("building demo world")?;
    let (sender, receiver) = create_command_bus(64);
    let submit = make_command_submit(sender);
    let mut host = Host::new(Arc::clone(&runner), demo.sandbox, receiver)
        .with_checkpoints(CheckpointStore::new(files), cli.checkpoint_interval);

    let resumed = if settings.auto_resume && !cli.fresh {
        host.resume().unwrap_or_else(|err| {
            warn!(%err, "checkpoint unreadable; starting fresh");
            0
        })
    } else {
        0
    };
    if resumed == 0 {
        for request in demo.requests {
            let agent = request.agent;
            submit(RunnerCommand::Submit(request));
            if settings.preview_before_build {
                submit(RunnerCommand::Confirm(agent));
            }
        }
    }

    info!(
        agents = demo.agents.len(),
        resumed,
        seed = cli.seed,
        "starting BuildBots scheduler"
    );
    let summary = host.run(cli.ticks);
    let model = runner.model();
    info!(
        ticks = summary.ticks,
        placed = summary.placed,
        completed = summary.completed,
        dropped = summary.dropped,
        checkpoints = summary.checkpoints,
        model_updates = model.updates(),
        "scheduler stopped"
    );
    Ok(())
}

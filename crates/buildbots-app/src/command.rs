use buildbots_core::AgentId;
use buildbots_jobs::{JobRequest, Runner};
use crossfire::mpmc;
use crossfire::{MAsyncTx, MRx, TryRecvError, TrySendError, detect_backoff_cfg};
use std::sync::Arc;
use tracing::{debug, warn};

/// Registration requests queued by front ends for the scheduler thread.
#[derive(Debug, Clone)]
pub enum RunnerCommand {
    Submit(JobRequest),
    Confirm(AgentId),
    Cancel(AgentId),
}

pub type CommandSender = MAsyncTx<RunnerCommand>;
pub type CommandReceiver = MRx<RunnerCommand>;
pub type CommandSubmit = Arc<dyn Fn(RunnerCommand) -> bool + Send + Sync>;

pub fn create_command_bus(capacity: usize) -> (CommandSender, CommandReceiver) {
    detect_backoff_cfg();
    mpmc::bounded_tx_async_rx_blocking(capacity)
}

/// Apply one command; rejected commands are logged and otherwise ignored.
pub fn apply_runner_command(runner: &Runner, command: RunnerCommand) {
    match command {
        RunnerCommand::Submit(request) => {
            let agent = request.agent;
            match runner.submit(request) {
                Ok(outcome) => debug!(?agent, ?outcome, "job submitted"),
                Err(err) => warn!(?agent, %err, "job submission rejected"),
            }
        }
        RunnerCommand::Confirm(agent) => {
            if let Err(err) = runner.confirm(agent) {
                warn!(?agent, %err, "confirm rejected");
            }
        }
        RunnerCommand::Cancel(agent) => {
            if !runner.cancel(agent) {
                debug!(?agent, "nothing to cancel");
            }
        }
    }
}

/// Drain every queued command into the runner; returns how many were applied.
pub fn drain_pending_commands(receiver: &CommandReceiver, runner: &Runner) -> usize {
    let mut applied = 0;
    loop {
        match receiver.try_recv() {
            Ok(command) => {
                debug!(?command, "applying runner command");
                apply_runner_command(runner, command);
                applied += 1;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    applied
}

pub fn make_command_submit(sender: CommandSender) -> CommandSubmit {
    let sender = Arc::new(sender);
    Arc::new(
        move |command: RunnerCommand| match sender.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(cmd)) => {
                warn!(?cmd, "runner command queue full; dropping command");
                false
            }
            Err(TrySendError::Disconnected(cmd)) => {
                warn!(?cmd, "runner command queue disconnected");
                false
            }
        },
    )
}

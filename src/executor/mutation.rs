//! Database mutation action: runs the external per-area database tool.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ActionOutcome, OutcomeKind, ScanAction};
use crate::config::MutationConfig;
use crate::constants::MUTATION_FLAGS;
use crate::messaging::ScanEvent;

const ACTION_NAME: &str = "mutation";

/// Runs `<program> <args...> --add --db <area>`
///
/// The station is not passed to the tool. The exit code alone decides the
/// outcome; stderr is logged but never inspected.
#[derive(Debug, Clone)]
pub struct ProcessMutation {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    permanent_exit_codes: Vec<i32>,
}

impl ProcessMutation {
    pub fn from_config(config: &MutationConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
            permanent_exit_codes: config.permanent_exit_codes.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Full argument list for `event`
    pub fn command_args(&self, event: &ScanEvent) -> Vec<String> {
        self.args
            .iter()
            .cloned()
            .chain(MUTATION_FLAGS.iter().map(|flag| flag.to_string()))
            .chain(std::iter::once(event.area().to_string()))
            .collect()
    }

    /// Classify an exit code; `None` means the process was killed by a signal
    pub fn classify_exit(&self, code: Option<i32>) -> OutcomeKind {
        match code {
            Some(0) => OutcomeKind::Success,
            Some(code) if self.permanent_exit_codes.contains(&code) => {
                OutcomeKind::PermanentFailure
            }
            _ => OutcomeKind::TransientFailure,
        }
    }
}

#[async_trait]
impl ScanAction for ProcessMutation {
    fn name(&self) -> &'static str {
        ACTION_NAME
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, event: &ScanEvent) -> ActionOutcome {
        let args = self.command_args(event);
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, args = ?args, "Running mutation tool");

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to spawn mutation tool");
                return ActionOutcome::transient(
                    ACTION_NAME,
                    format!("failed to spawn {}: {}", self.program, e),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!(event = %event, stdout = %stdout.trim_end(), "Mutation tool output");
        }
        if !stderr.trim().is_empty() {
            warn!(event = %event, stderr = %stderr.trim_end(), "Mutation tool wrote to stderr");
        }

        let code = output.status.code();
        let detail = match code {
            Some(code) => format!("exit code {}", code),
            None => format!("terminated by signal ({})", output.status),
        };

        match self.classify_exit(code) {
            OutcomeKind::Success => ActionOutcome::success(ACTION_NAME, detail),
            OutcomeKind::PermanentFailure => ActionOutcome::permanent(ACTION_NAME, detail),
            OutcomeKind::TransientFailure => ActionOutcome::transient(ACTION_NAME, detail),
        }
    }
}

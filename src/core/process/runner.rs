// src/core/process/runner.rs

//! Abstracts the "small fixed vocabulary" of subprocess invocations
//! (`pg_ctl start/stop/promote/reload`, `pg_isready`, `pg_rewind`, ...) behind
//! a trait, the same way `WardenClient` puts network access behind an
//! interface so failover logic can be unit-tested without a live master.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::process::Command;

use crate::core::errors::SupervisorError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self::with_code(0)
    }

    pub fn with_code(status_code: i32) -> Self {
        Self {
            status_code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, SupervisorError>;
}

/// Production implementation: shells out via `tokio::process::Command`.
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, SupervisorError> {
        let output = Command::new(program).args(args).output().await?;
        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Test double: returns a pre-scripted queue of outputs, one per call, in order.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    queue: Mutex<VecDeque<CommandOutput>>,
}

impl ScriptedCommandRunner {
    pub fn push(&self, output: CommandOutput) {
        self.queue.lock().push_back(output);
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput, SupervisorError> {
        self.queue
            .lock()
            .pop_front()
            .ok_or_else(|| SupervisorError::Process("no scripted output left".into()))
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;
use crate::model::{ExecutionResult, ExitStatus};

const SIGSEGV: i32 = 11;
const SIGXFSZ: i32 = 25;
const SIGFPE: i32 = 8;
const SIGABRT: i32 = 6;

#[derive(Serialize, Debug)]
pub struct CreateSubmission<'a> {
    pub source_code: &'a str,
    pub language_id: u32,
    pub stdin: &'a str,
    /// Seconds
    pub cpu_time_limit: f64,
    /// Seconds
    pub wall_time_limit: f64,
    /// Kilobytes
    pub memory_limit: u64,
}

#[derive(Deserialize, Debug)]
pub struct SubmissionToken {
    pub token: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Status {
    pub id: u32,
    #[serde(default)]
    pub description: String,
}

/// A submission as reported by `GET /submissions/{token}`
#[derive(Deserialize, Debug, Clone)]
pub struct SubmissionDetails {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub status: Status,
    /// CPU seconds as a decimal string
    pub time: Option<String>,
    pub wall_time: Option<String>,
    /// Kilobytes
    pub memory: Option<u64>,
}

pub const DETAIL_FIELDS: &str =
    "stdout,stderr,compile_output,message,exit_code,exit_signal,status,time,wall_time,memory";

impl SubmissionDetails {
    /// In Queue (1) and Processing (2) are the only non-terminal states
    pub fn is_finished(&self) -> bool {
        !matches!(self.status.id, 1 | 2)
    }

    /// Translates a finished submission into an execution result
    ///
    /// A run that ended normally but took longer than `time_limit` on the wall
    /// clock is reported as timed out.
    pub fn into_result(
        self,
        time_limit: Duration,
        memory_limit: u64,
    ) -> Result<ExecutionResult, ExecutorError> {
        let memory_used = self.memory.unwrap_or(0) * 1024;
        let crashed = |signal: i32| {
            if memory_limit > 0 && memory_used >= memory_limit {
                ExitStatus::MemoryExceeded
            } else {
                ExitStatus::Crashed(Some(signal))
            }
        };

        let exit_status = match self.status.id {
            3 | 4 => ExitStatus::Normal(self.exit_code.unwrap_or(0)),
            5 => ExitStatus::TimedOut,
            6 => ExitStatus::CompileError,
            7 => crashed(SIGSEGV),
            8 => crashed(SIGXFSZ),
            9 => crashed(SIGFPE),
            10 => crashed(SIGABRT),
            11 => ExitStatus::Normal(self.exit_code.filter(|&code| code != 0).unwrap_or(1)),
            12 => ExitStatus::Crashed(None),
            id => {
                let reason = self
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| self.status.description.clone());
                return Err(ExecutorError::Remote(format!("status {id}: {reason}")));
            }
        };

        let wall_time = self
            .wall_time
            .as_deref()
            .or(self.time.as_deref())
            .and_then(|t| t.trim().parse::<f64>().ok())
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
            .unwrap_or_default();
        let exit_status = match exit_status {
            ExitStatus::Normal(_) if wall_time > time_limit => ExitStatus::TimedOut,
            other => other,
        };

        let stderr = if exit_status == ExitStatus::CompileError {
            self.compile_output.unwrap_or_default()
        } else {
            self.stderr.unwrap_or_default()
        };

        Ok(ExecutionResult {
            stdout: self.stdout.unwrap_or_default(),
            stderr,
            exit_status,
            wall_time,
            memory_used,
        })
    }
}

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::language::Toolchain;
use crate::model::{ExecutionRequest, ExecutionResult};

use super::WorkDir;

/// A backend able to compile and run one submission against one input
///
/// Implementations must bound every blocking step: a call returns once the
/// program exits, its time limit expires, or the backend gives up. The
/// working directory belongs to the caller, which removes it afterwards.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short backend name used in logs and health reports
    fn name(&self) -> &'static str;

    /// Compiles (if needed) and runs the program once
    ///
    /// A failed compile step is reported as `ExitStatus::CompileError` and
    /// the program is not run.
    async fn execute(
        &self,
        toolchain: &Toolchain,
        request: &ExecutionRequest,
        work_dir: &WorkDir,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// Reports whether the backend can accept work right now
    async fn health_check(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

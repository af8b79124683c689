mod cgroup;
mod executor;
mod isolate_runner;
mod process_runner;
mod workdir;

pub use executor::Executor;
pub use isolate_runner::{IsolateMeta, IsolateSandbox};
pub use process_runner::ProcessSandbox;
pub use workdir::WorkDir;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{ExecutorConfig, JudgeConfig};
use crate::remote::RemoteJudge;

// File names inside every working directory
pub const STDIN_FILE: &str = "input.txt";
pub const STDOUT_FILE: &str = "output.txt";
pub const STDERR_FILE: &str = "error.txt";
pub const COMPILE_OUTPUT_FILE: &str = "compile.txt";

const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Creates the executor backend selected by configuration
///
/// In `auto` mode the isolate sandbox is used when the `isolate` binary is on
/// `PATH`; otherwise plain processes without namespace isolation are used.
pub fn create_executor(config: &ExecutorConfig, judge: &JudgeConfig) -> Result<Arc<dyn Executor>> {
    match config {
        ExecutorConfig::Auto(isolate) => {
            let has_isolate = std::process::Command::new("which")
                .arg("isolate")
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);

            if has_isolate {
                log::info!("Creating IsolateSandbox (full isolation mode)");
                Ok(Arc::new(IsolateSandbox::build(isolate, judge)?))
            } else {
                log::info!("Creating ProcessSandbox (isolate not found)");
                Ok(Arc::new(ProcessSandbox::build(judge)))
            }
        }
        ExecutorConfig::Process => {
            log::info!("Creating ProcessSandbox");
            Ok(Arc::new(ProcessSandbox::build(judge)))
        }
        ExecutorConfig::Isolate(isolate) => {
            log::info!("Creating IsolateSandbox");
            Ok(Arc::new(IsolateSandbox::build(isolate, judge)?))
        }
        ExecutorConfig::Remote(remote) => {
            log::info!("Creating RemoteJudge for {}", remote.base_url);
            Ok(Arc::new(RemoteJudge::build(remote)?))
        }
    }
}

/// Joins arguments into one `/bin/sh -c` command line, quoting where needed
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:+%,@".contains(c));
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_quotes_special_arguments() {
        let args = vec![
            "g++".to_string(),
            "-o".to_string(),
            "main".to_string(),
            "my file.cpp".to_string(),
            "it's".to_string(),
        ];
        assert_eq!(shell_join(&args), r"g++ -o main 'my file.cpp' 'it'\''s'");
    }

    #[test]
    fn test_create_process_executor() {
        let executor = create_executor(&ExecutorConfig::Process, &JudgeConfig::default()).unwrap();
        assert_eq!(executor.name(), "process");
    }
}

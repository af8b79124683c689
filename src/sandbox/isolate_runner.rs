use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::config::{IsolateConfig, JudgeConfig};
use crate::error::ExecutorError;
use crate::language::Toolchain;
use crate::model::{ExecutionRequest, ExecutionResult, ExitStatus};

use super::workdir::read_capped;
use super::{
    COMPILE_OUTPUT_FILE, Executor, SANDBOX_PATH, STDERR_FILE, STDIN_FILE, STDOUT_FILE, WorkDir,
    shell_join,
};

// Sandbox configuration constants
const COMPILE_MEMORY_LIMIT: u64 = 524288; // KB
const COMPILE_PROCESSES: u32 = 10;
const COMPILE_OPEN_FILES: u32 = 512;
const COMPILE_FILE_SIZE: u64 = 65536; // KB
const COMPILE_OUTPUT_LIMIT: u64 = 64 << 10;

const STDERR_LIMIT: u64 = 64 << 10;
const WALL_TIME_GRACE: f64 = 0.5; // seconds

/// One `isolate --run` invocation
struct IsolateRun<'a> {
    box_id: u32,
    wall_time: Duration,
    cpu_time: Option<Duration>,
    memory_kb: u64,
    processes: u32,
    open_files: u32,
    file_size_kb: u64,
    stdin: Option<&'a str>,
    stdout: &'a str,
    /// `None` merges stderr into stdout
    stderr: Option<&'a str>,
    meta: &'a Path,
    dirs: &'a [String],
    env: &'a [String],
    command: String,
}

/// Execution information parsed from an isolate meta file
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IsolateMeta {
    pub time_wall: Duration,
    pub memory_kb: u64,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub killed: bool,
    pub oom_killed: bool,
    /// Two-letter status: RE, SG, TO or XX
    pub status: Option<String>,
    pub message: Option<String>,
}

impl IsolateMeta {
    pub fn parse(meta_content: &str) -> Self {
        let mut meta = Self::default();
        for line in meta_content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "killed" => meta.killed = true,
                    "cg-oom-killed" => meta.oom_killed = true,
                    "exitcode" => meta.exit_code = value.parse().ok(),
                    "exitsig" => meta.exit_signal = value.parse().ok(),
                    "cg-mem" => meta.memory_kb = value.parse().unwrap_or(0),
                    "status" => meta.status = Some(value.to_string()),
                    "message" => meta.message = Some(value.to_string()),
                    "time-wall" => {
                        if let Ok(secs) = value.parse::<f64>() {
                            meta.time_wall = Duration::from_secs_f64(secs.max(0.0));
                        }
                    }
                    _ => {}
                }
            }
        }
        meta
    }

    /// Maps the meta information of a run step onto an exit status
    pub fn exit_status(&self, memory_limit: u64) -> Result<ExitStatus, ExecutorError> {
        match self.status.as_deref() {
            Some("XX") => Err(ExecutorError::Sandbox(
                self.message
                    .clone()
                    .unwrap_or_else(|| "isolate internal error".to_string()),
            )),
            Some("TO") => Ok(ExitStatus::TimedOut),
            _ if self.oom_killed => Ok(ExitStatus::MemoryExceeded),
            _ if self.killed => Ok(ExitStatus::TimedOut),
            _ if self.memory_kb.saturating_mul(1024) > memory_limit => Ok(ExitStatus::MemoryExceeded),
            _ => match (self.exit_signal, self.exit_code) {
                (Some(signal), _) => Ok(ExitStatus::Crashed(Some(signal))),
                (None, Some(code)) => Ok(ExitStatus::Normal(code)),
                (None, None) if self.status.is_some() => Ok(ExitStatus::Crashed(None)),
                (None, None) => Ok(ExitStatus::Normal(0)),
            },
        }
    }

    fn failed(&self) -> bool {
        self.status.is_some() || self.exit_code.is_some_and(|code| code != 0)
    }
}

/// Free isolate box ids, shared by all concurrent executions
struct BoxPool {
    free: Mutex<VecDeque<u32>>,
    notify: Notify,
}

impl BoxPool {
    fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            free: Mutex::new(ids.into_iter().collect()),
            notify: Notify::new(),
        }
    }

    async fn acquire(self: &Arc<Self>) -> BoxLease {
        loop {
            if let Some(id) = self.free.lock().pop_front() {
                return BoxLease {
                    pool: Arc::clone(self),
                    id,
                };
            }
            self.notify.notified().await;
        }
    }

    fn release(&self, id: u32) {
        self.free.lock().push_back(id);
        self.notify.notify_one();
    }
}

/// Exclusive use of one box; the box is cleaned up and returned on drop
///
/// Cleanup runs on the blocking pool when dropped inside the runtime, and the
/// id only becomes available again once it finished.
struct BoxLease {
    pool: Arc<BoxPool>,
    id: u32,
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.pool);
        let id = self.id;
        let cleanup = move || {
            cleanup_box(id);
            pool.release(id);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(cleanup);
            }
            Err(_) => cleanup(),
        }
    }
}

fn cleanup_box(id: u32) {
    let out = StdCommand::new("isolate")
        .arg("-b")
        .arg(id.to_string())
        .arg("--cg")
        .arg("--cleanup")
        .output();

    if out.is_ok_and(|c| c.status.success()) {
        log::debug!("Isolate box {id} cleaned up");
    } else {
        log::error!("Isolate box {id} failed to clean up");
    }
}

/// Runs submissions inside `isolate` boxes with cgroup limits
///
/// Each execution leases a box id from a fixed pool, so at most `box_count`
/// programs run at once. Memory and the out-of-memory kill come from the
/// cgroup, which makes MLE detection exact.
pub struct IsolateSandbox {
    boxes: Arc<BoxPool>,
    compile_time_limit: Duration,
    output_limit: u64,
}

#[async_trait]
impl Executor for IsolateSandbox {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn execute(
        &self,
        toolchain: &Toolchain,
        request: &ExecutionRequest,
        work_dir: &WorkDir,
    ) -> Result<ExecutionResult, ExecutorError> {
        let lease = self.boxes.acquire().await;
        let box_dir = initialize_box(lease.id).await?;
        log::debug!("Leased isolate box {} at {}", lease.id, box_dir.display());

        fs::write(
            box_dir.join(&toolchain.source_file),
            format!("{}\n", &request.source_code),
        )?;
        fs::write(box_dir.join(STDIN_FILE), &request.stdin)?;

        let profile = &toolchain.profile;

        // Step 1: Compile the source code
        if let Some(command) = toolchain.compile_command() {
            let meta_path = work_dir.join("compile.meta");
            run_isolate(&IsolateRun {
                box_id: lease.id,
                wall_time: self.compile_time_limit,
                cpu_time: None,
                memory_kb: COMPILE_MEMORY_LIMIT,
                processes: COMPILE_PROCESSES,
                open_files: COMPILE_OPEN_FILES,
                file_size_kb: COMPILE_FILE_SIZE,
                stdin: None,
                stdout: COMPILE_OUTPUT_FILE,
                stderr: None,
                meta: &meta_path,
                dirs: &profile.dirs,
                env: &profile.env,
                command: shell_join(&command),
            })
            .await?;

            let meta = read_meta(&meta_path)?;
            if meta.status.as_deref() == Some("XX") {
                return Err(ExecutorError::Sandbox(meta.message.unwrap_or_default()));
            }
            if meta.failed() {
                let mut diagnostics =
                    read_capped(&box_dir.join(COMPILE_OUTPUT_FILE), COMPILE_OUTPUT_LIMIT)?;
                if meta.status.as_deref() == Some("TO") {
                    diagnostics.push_str(&format!(
                        "\ncompilation exceeded {:.1}s",
                        self.compile_time_limit.as_secs_f64()
                    ));
                }
                return Ok(ExecutionResult {
                    stdout: String::new(),
                    stderr: diagnostics,
                    exit_status: ExitStatus::CompileError,
                    wall_time: meta.time_wall,
                    memory_used: meta.memory_kb * 1024,
                });
            }
        }

        // Step 2: Run the program
        let meta_path = work_dir.join("run.meta");
        run_isolate(&IsolateRun {
            box_id: lease.id,
            wall_time: request.time_limit + Duration::from_secs_f64(WALL_TIME_GRACE),
            cpu_time: Some(request.time_limit),
            memory_kb: request.memory_limit.div_ceil(1024),
            processes: profile.processes,
            open_files: profile.open_files,
            file_size_kb: profile.file_size.div_ceil(1024),
            stdin: Some(STDIN_FILE),
            stdout: STDOUT_FILE,
            stderr: Some(STDERR_FILE),
            meta: &meta_path,
            dirs: &profile.dirs,
            env: &profile.env,
            command: shell_join(&toolchain.run_command()),
        })
        .await?;

        let meta = read_meta(&meta_path)?;
        let mut exit_status = meta.exit_status(request.memory_limit)?;
        // The wall limit carries a grace period; anything past the real limit is still too slow
        if meta.time_wall > request.time_limit && matches!(exit_status, ExitStatus::Normal(_)) {
            exit_status = ExitStatus::TimedOut;
        }

        Ok(ExecutionResult {
            stdout: read_capped(&box_dir.join(STDOUT_FILE), self.output_limit)?,
            stderr: read_capped(&box_dir.join(STDERR_FILE), STDERR_LIMIT)?,
            exit_status,
            wall_time: meta.time_wall,
            memory_used: meta.memory_kb * 1024,
        })
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        let output = Command::new("isolate")
            .arg("--version")
            .output()
            .await
            .map_err(|source| ExecutorError::Spawn {
                command: "isolate".to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ExecutorError::Sandbox("isolate --version failed".to_string()))
        }
    }
}

impl IsolateSandbox {
    pub fn build(config: &IsolateConfig, judge: &JudgeConfig) -> Result<Self> {
        if config.box_count == 0 {
            bail!("isolate box_count must not be 0");
        }

        let output = StdCommand::new("isolate")
            .arg("--version")
            .output()
            .map_err(|e| anyhow!("Failed to spawn isolate: {}", e))?;
        if !output.status.success() {
            bail!("isolate --version exited with non-zero status");
        }

        let ids = config.first_box_id..config.first_box_id + config.box_count;
        log::info!("IsolateSandbox initialized with boxes {ids:?}");

        Ok(Self {
            boxes: Arc::new(BoxPool::new(ids)),
            compile_time_limit: judge.compile_time_limit.into(),
            output_limit: judge.output_limit.0,
        })
    }
}

/// Resets a box and returns its directory
async fn initialize_box(id: u32) -> Result<PathBuf, ExecutorError> {
    let _ = Command::new("isolate")
        .args(["-b", &id.to_string(), "--cg", "--cleanup"])
        .output()
        .await;

    let output = Command::new("isolate")
        .args(["-b", &id.to_string(), "--cg", "--init"])
        .output()
        .await
        .map_err(|source| ExecutorError::Spawn {
            command: "isolate --init".to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExecutorError::Sandbox(format!(
            "isolate --init exited with non-zero status; stderr={}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let root_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root_dir.is_empty() {
        return Err(ExecutorError::Sandbox(
            "isolate --init produced empty stdout".to_string(),
        ));
    }

    Ok(PathBuf::from(root_dir).join("box"))
}

async fn run_isolate(run: &IsolateRun<'_>) -> Result<(), ExecutorError> {
    let mut cmd = Command::new("isolate");
    cmd.arg("-b")
        .arg(run.box_id.to_string())
        .args(["--cg", "--run"])
        .arg(format!("--processes={}", run.processes))
        .arg(format!("--open-files={}", run.open_files))
        .arg(format!("--fsize={}", run.file_size_kb))
        .arg(format!("--cg-mem={}", run.memory_kb))
        .arg(format!("--wall-time={:.3}", run.wall_time.as_secs_f64()))
        .arg("-E")
        .arg(format!("PATH={SANDBOX_PATH}"));

    if let Some(cpu) = run.cpu_time {
        cmd.arg(format!("--time={:.3}", cpu.as_secs_f64()))
            .arg(format!("--extra-time={WALL_TIME_GRACE}"));
    }
    for dir in run.dirs {
        cmd.arg(format!("--dir={dir}"));
    }
    for entry in run.env {
        cmd.arg("-E").arg(entry);
    }
    if let Some(stdin) = run.stdin {
        cmd.arg("-i").arg(stdin);
    }
    cmd.arg("-o").arg(run.stdout);
    match run.stderr {
        Some(stderr) => cmd.arg("-r").arg(stderr),
        None => cmd.arg("--stderr-to-stdout"),
    };

    cmd.arg("-M")
        .arg(run.meta)
        .args(["--silent", "--", "/bin/sh", "-c"])
        .arg(&run.command)
        .kill_on_drop(true);

    // isolate exits non-zero whenever the program fails; the meta file tells why
    cmd.output().await.map_err(|source| ExecutorError::Spawn {
        command: "isolate --run".to_string(),
        source,
    })?;

    Ok(())
}

fn read_meta(path: &Path) -> Result<IsolateMeta, ExecutorError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ExecutorError::Sandbox(format!("failed to read meta file: {e}")))?;
    Ok(IsolateMeta::parse(&content))
}

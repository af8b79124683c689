use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::JudgeConfig;
use crate::error::ExecutorError;
use crate::language::Toolchain;
use crate::model::{ExecutionRequest, ExecutionResult, ExitStatus};

use super::cgroup::{self, MemoryCgroup};
use super::{
    COMPILE_OUTPUT_FILE, Executor, SANDBOX_PATH, STDERR_FILE, STDIN_FILE, STDOUT_FILE, WorkDir,
};

// Compiler limits
const COMPILE_FILE_SIZE: u64 = 256 << 20;
const COMPILE_OPEN_FILES: u64 = 512;
const COMPILE_OUTPUT_LIMIT: u64 = 64 << 10;

const STDERR_LIMIT: u64 = 64 << 10;

// Lowercased stderr fragments runtimes print when an allocation is refused
const ALLOCATION_FAILURES: &[&str] = &[
    "bad_alloc",
    "memoryerror",
    "outofmemoryerror",
    "out of memory",
    "cannot allocate",
    "memory allocation",
    "out of space",
];

/// Resource limits applied to a child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    cpu_seconds: u64,
    address_space: Option<u64>,
    file_size: u64,
    open_files: u64,
    /// `cgroup.procs` of the cgroup the child moves itself into
    cgroup_procs: Option<RawFd>,
}

/// How the memory limit of a run was enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryCap {
    Cgroup { oom_killed: bool },
    AddressSpace,
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Exited(i32),
    Signaled(i32),
}

#[derive(Debug)]
struct ChildOutcome {
    termination: Termination,
    timed_out: bool,
    wall_time: Duration,
    /// Peak resident set size in bytes
    peak_memory: u64,
}

/// Runs submissions as plain child processes
///
/// Every program gets its own process group, so a timeout kills everything it
/// spawned. Time limits come from rlimits and the wall clock. Memory is capped
/// by a per-run cgroup when the configured cgroup v2 parent is usable, and by
/// `RLIMIT_AS` at the limit otherwise; peak memory is read from `wait4`.
/// Filesystem and network isolation are only as strong as the profile's
/// wrapper command (for example `unshare` or `bwrap`).
pub struct ProcessSandbox {
    compile_time_limit: Duration,
    output_limit: u64,
    memory_cgroup: Option<PathBuf>,
}

#[async_trait]
impl Executor for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        toolchain: &Toolchain,
        request: &ExecutionRequest,
        work_dir: &WorkDir,
    ) -> Result<ExecutionResult, ExecutorError> {
        work_dir.write(&toolchain.source_file, &format!("{}\n", request.source_code))?;
        work_dir.write(STDIN_FILE, &request.stdin)?;

        // Step 1: Compile the source code
        if let Some(command) = toolchain.compile_command() {
            if let Some(failure) = self.compile(toolchain, command, work_dir).await? {
                return Ok(failure);
            }
        }

        // Step 2: Run the program
        self.run_program(toolchain, request, work_dir).await
    }
}

impl ProcessSandbox {
    pub fn build(judge: &JudgeConfig) -> Self {
        log::warn!(
            "ProcessSandbox isolates filesystem and network only through profile wrappers - use isolate for untrusted code"
        );

        let memory_cgroup = judge.memory_cgroup.as_ref().and_then(|root| {
            match cgroup::prepare_root(root) {
                Ok(()) => {
                    log::info!("ProcessSandbox caps memory with cgroups under {}", root.display());
                    Some(root.clone())
                }
                Err(e) => {
                    log::warn!(
                        "cgroup {} unusable ({e}), capping memory with RLIMIT_AS instead",
                        root.display()
                    );
                    None
                }
            }
        });

        Self {
            compile_time_limit: judge.compile_time_limit.into(),
            output_limit: judge.output_limit.0,
            memory_cgroup,
        }
    }

    /// Runs the compile step, returning a finished result if compilation failed
    async fn compile(
        &self,
        toolchain: &Toolchain,
        command: Vec<String>,
        work_dir: &WorkDir,
    ) -> Result<Option<ExecutionResult>, ExecutorError> {
        let output_file = File::create(work_dir.join(COMPILE_OUTPUT_FILE))?;
        let argv = with_wrapper(&toolchain.profile.wrapper, command);
        let limits = ChildLimits {
            cpu_seconds: cpu_budget(self.compile_time_limit),
            address_space: None,
            file_size: COMPILE_FILE_SIZE,
            open_files: COMPILE_OPEN_FILES,
            cgroup_procs: None,
        };

        let outcome = spawn_limited(
            &argv,
            work_dir.path(),
            &toolchain.profile.env,
            [
                Stdio::null(),
                Stdio::from(output_file.try_clone()?),
                Stdio::from(output_file),
            ],
            limits,
            self.compile_time_limit,
        )
        .await?;

        let compiled = !outcome.timed_out && outcome.termination == Termination::Exited(0);
        if compiled {
            log::debug!("Compiled {} in {:?}", toolchain.source_file, outcome.wall_time);
            return Ok(None);
        }

        let mut diagnostics = work_dir.read_capped(COMPILE_OUTPUT_FILE, COMPILE_OUTPUT_LIMIT)?;
        if outcome.timed_out {
            diagnostics.push_str(&format!(
                "\ncompilation exceeded {:.1}s",
                self.compile_time_limit.as_secs_f64()
            ));
        }

        Ok(Some(ExecutionResult {
            stdout: String::new(),
            stderr: diagnostics,
            exit_status: ExitStatus::CompileError,
            wall_time: outcome.wall_time,
            memory_used: outcome.peak_memory,
        }))
    }

    async fn run_program(
        &self,
        toolchain: &Toolchain,
        request: &ExecutionRequest,
        work_dir: &WorkDir,
    ) -> Result<ExecutionResult, ExecutorError> {
        let stdin = File::open(work_dir.join(STDIN_FILE))?;
        let stdout = File::create(work_dir.join(STDOUT_FILE))?;
        let stderr = File::create(work_dir.join(STDERR_FILE))?;

        let profile = &toolchain.profile;
        let cgroup = match &self.memory_cgroup {
            Some(root) => Some(MemoryCgroup::create(root, request.memory_limit)?),
            None => None,
        };
        let procs = cgroup.as_ref().map(MemoryCgroup::procs_handle).transpose()?;
        let address_space = (cgroup.is_none() && profile.limit_address_space)
            .then_some(request.memory_limit);
        let limits = ChildLimits {
            cpu_seconds: cpu_budget(request.time_limit),
            address_space,
            file_size: profile.file_size,
            open_files: u64::from(profile.open_files),
            cgroup_procs: procs.as_ref().map(|file| file.as_raw_fd()),
        };

        let mut command = toolchain.run_command();
        if let Some(local) = command
            .first()
            .and_then(|program| program.strip_prefix("./"))
            .map(|program| work_dir.join(program))
        {
            command[0] = local.to_string_lossy().into_owned();
        }
        let argv = with_wrapper(&profile.wrapper, command);

        let outcome = spawn_limited(
            &argv,
            work_dir.path(),
            &profile.env,
            [stdin.into(), stdout.into(), stderr.into()],
            limits,
            request.time_limit,
        )
        .await;
        drop(procs);

        let measured = outcome.as_ref().map_or(0, |o| o.peak_memory);
        let (cap, memory_used) = match cgroup {
            Some(cgroup) => {
                let oom_killed = cgroup.oom_killed();
                let peak = if oom_killed {
                    measured.max(cgroup.peak_memory().unwrap_or(request.memory_limit))
                } else {
                    measured
                };
                cgroup.remove().await;
                (MemoryCap::Cgroup { oom_killed }, peak)
            }
            None if address_space.is_some() => (MemoryCap::AddressSpace, measured),
            None => (MemoryCap::Unbounded, measured),
        };
        let outcome = outcome?;

        let stderr = work_dir.read_capped(STDERR_FILE, STDERR_LIMIT)?;
        Ok(ExecutionResult {
            stdout: work_dir.read_capped(STDOUT_FILE, self.output_limit)?,
            exit_status: classify(&outcome, request.memory_limit, cap, &stderr),
            stderr,
            wall_time: outcome.wall_time,
            memory_used,
        })
    }
}

fn classify(outcome: &ChildOutcome, memory_limit: u64, cap: MemoryCap, stderr: &str) -> ExitStatus {
    match outcome.termination {
        _ if outcome.timed_out => ExitStatus::TimedOut,
        Termination::Signaled(libc::SIGXCPU) => ExitStatus::TimedOut,
        _ if cap == (MemoryCap::Cgroup { oom_killed: true }) => ExitStatus::MemoryExceeded,
        _ if outcome.peak_memory > memory_limit => ExitStatus::MemoryExceeded,
        Termination::Exited(0) => ExitStatus::Normal(0),
        // A refused allocation under RLIMIT_AS surfaces as an abort or an error exit
        _ if cap == MemoryCap::AddressSpace && allocation_failed(stderr) => {
            ExitStatus::MemoryExceeded
        }
        Termination::Signaled(signal) => ExitStatus::Crashed(Some(signal)),
        Termination::Exited(code) => ExitStatus::Normal(code),
    }
}

fn allocation_failed(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ALLOCATION_FAILURES.iter().any(|marker| stderr.contains(marker))
}

/// CPU seconds granted for a wall-clock limit, rounded up plus one
fn cpu_budget(wall: Duration) -> u64 {
    wall.as_secs() + u64::from(wall.subsec_nanos() > 0) + 1
}

fn with_wrapper(wrapper: &[String], command: Vec<String>) -> Vec<String> {
    wrapper.iter().cloned().chain(command).collect()
}

/// Spawns `argv` in its own process group and waits for it, killing the group
/// once `wall_limit` passes
async fn spawn_limited(
    argv: &[String],
    cwd: &Path,
    env: &[String],
    [stdin, stdout, stderr]: [Stdio; 3],
    limits: ChildLimits,
    wall_limit: Duration,
) -> Result<ChildOutcome, ExecutorError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ExecutorError::Sandbox("empty command".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", cwd)
        .env("LANG", "C.UTF-8");
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    // SAFETY: the hook only calls async-signal-safe libc functions
    unsafe {
        cmd.pre_exec(move || apply_child_limits(limits));
    }

    let start = Instant::now();
    let child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
        command: program.clone(),
        source,
    })?;
    let pid = child.id() as libc::pid_t;
    let group = ProcessGroup(pid);

    let mut waiter = tokio::task::spawn_blocking(move || wait_for(pid));
    let (waited, timed_out) = match tokio::time::timeout(wall_limit, &mut waiter).await {
        Ok(joined) => (joined, false),
        Err(_) => {
            log::debug!("Process {pid} exceeded {wall_limit:?}, killing its group");
            group.kill();
            (waiter.await, true)
        }
    };
    let wall_time = start.elapsed();
    drop(group);

    let (status, max_rss_kb) =
        waited.map_err(|e| ExecutorError::Sandbox(format!("wait task failed: {e}")))??;

    let termination = if libc::WIFSIGNALED(status) {
        Termination::Signaled(libc::WTERMSIG(status))
    } else {
        Termination::Exited(libc::WEXITSTATUS(status))
    };

    Ok(ChildOutcome {
        termination,
        timed_out,
        wall_time,
        peak_memory: max_rss_kb.saturating_mul(1024),
    })
}

/// Process group of a spawned program; killed when dropped so nothing it
/// started outlives the execution, whichever way the caller exits
struct ProcessGroup(libc::pid_t);

impl ProcessGroup {
    fn kill(&self) {
        // ESRCH just means the group is already gone
        unsafe {
            libc::killpg(self.0, libc::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Blocks until `pid` exits; returns the raw wait status and peak RSS in KB
fn wait_for(pid: libc::pid_t) -> io::Result<(libc::c_int, u64)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret == pid {
            return Ok((status, usage.ru_maxrss.max(0) as u64));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn apply_child_limits(limits: ChildLimits) -> io::Result<()> {
    fn check(ret: libc::c_int) -> io::Result<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn rlimit(soft: u64, hard: u64) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        }
    }

    unsafe {
        if let Some(fd) = limits.cgroup_procs {
            if libc::write(fd, b"0".as_ptr().cast(), 1) != 1 {
                return Err(io::Error::last_os_error());
            }
        }
        check(libc::setpgid(0, 0))?;
        check(libc::setrlimit(libc::RLIMIT_CORE, &rlimit(0, 0)))?;
        check(libc::setrlimit(
            libc::RLIMIT_FSIZE,
            &rlimit(limits.file_size, limits.file_size),
        ))?;
        check(libc::setrlimit(
            libc::RLIMIT_NOFILE,
            &rlimit(limits.open_files, limits.open_files),
        ))?;
        // SIGXCPU at the soft limit, SIGKILL one second later
        check(libc::setrlimit(
            libc::RLIMIT_CPU,
            &rlimit(limits.cpu_seconds, limits.cpu_seconds + 1),
        ))?;
        if let Some(bytes) = limits.address_space {
            check(libc::setrlimit(libc::RLIMIT_AS, &rlimit(bytes, bytes)))?;
        }
    }
    Ok(())
}

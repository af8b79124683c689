use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "oj-engine", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Judge one submission file (JSON) and print the result instead of serving
    #[arg(long = "judge", short = 'j')]
    pub judge_path: Option<String>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Sandbox profiles referenced by languages; built-in profiles are used when empty
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
    /// Supported languages; the built-in table is used when empty
    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    /// Parent of the per-execution working directories
    pub work_root: Option<PathBuf>,
    pub judge_type: JudgeType,
    pub compile_time_limit: MicroSecond,
    pub max_time_limit: MicroSecond,
    pub max_memory_limit: ByteSize,
    /// Upper bound on captured stdout/stderr per execution
    pub output_limit: ByteSize,
    pub max_concurrent_submissions: usize,
    /// cgroup v2 directory under which the process sandbox caps memory;
    /// `null` falls back to an address-space rlimit
    pub memory_cgroup: Option<PathBuf>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            judge_type: JudgeType::Standard,
            compile_time_limit: MicroSecond(30_000_000),
            max_time_limit: MicroSecond(10_000_000),
            max_memory_limit: ByteSize(1 << 30),
            output_limit: ByteSize(64 << 20),
            max_concurrent_submissions: 4,
            memory_cgroup: Some(PathBuf::from("/sys/fs/cgroup/oj-engine")),
        }
    }
}

/// Selects the backend that runs submissions
///
/// `auto` picks the isolate sandbox when the `isolate` binary is available
/// and falls back to plain processes otherwise.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ExecutorConfig {
    Auto(IsolateConfig),
    Process,
    Isolate(IsolateConfig),
    Remote(RemoteConfig),
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::Auto(IsolateConfig::default())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IsolateConfig {
    pub first_box_id: u32,
    pub box_count: u32,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            first_box_id: 0,
            box_count: 8,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: MicroSecond,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: MicroSecond,
    /// Largest `wall_time_limit` the service accepts (Judge0's `MAX_WALL_TIME_LIMIT`)
    #[serde(default = "default_max_wall_time_limit")]
    pub max_wall_time_limit: MicroSecond,
}

fn default_auth_header() -> String {
    "X-Auth-Token".to_string()
}

fn default_poll_interval() -> MicroSecond {
    MicroSecond(500_000)
}

fn default_max_polls() -> u32 {
    40
}

fn default_request_timeout() -> MicroSecond {
    MicroSecond(10_000_000)
}

fn default_max_wall_time_limit() -> MicroSecond {
    MicroSecond(20_000_000)
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProfileConfig {
    pub name: String,
    #[serde(default = "default_processes")]
    pub processes: u32,
    #[serde(default = "default_open_files")]
    pub open_files: u32,
    #[serde(default = "default_file_size")]
    pub file_size: ByteSize,
    /// Cap the address space of the process sandbox when no memory cgroup is
    /// available (off for runtimes that reserve large heaps)
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
    /// Command prefix for the process sandbox, e.g. `["unshare", "--net", "--map-root-user"]`
    #[serde(default)]
    pub wrapper: Vec<String>,
    /// Extra `KEY=VALUE` environment entries
    #[serde(default)]
    pub env: Vec<String>,
    /// Extra directories made visible inside isolate boxes
    #[serde(default)]
    pub dirs: Vec<String>,
}

fn default_processes() -> u32 {
    4
}

fn default_open_files() -> u32 {
    64
}

fn default_file_size() -> ByteSize {
    ByteSize(64 << 20)
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub name: String,
    pub file_name: String,
    /// Compile command template; empty for interpreted languages
    #[serde(default)]
    pub compile: Vec<String>,
    pub run: Vec<String>,
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Language id understood by the remote judge
    pub remote_id: Option<u32>,
    pub time_limit: Option<MicroSecond>,
    pub memory_limit: Option<ByteSize>,
}

fn default_profile() -> String {
    "default".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MicroSecond(pub u64);

impl From<MicroSecond> for Duration {
    fn from(value: MicroSecond) -> Self {
        Duration::from_micros(value.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

/// How program output is compared with the expected answer
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JudgeType {
    /// Ignore trailing spaces on each line and trailing empty lines
    #[default]
    Standard,
    /// Byte-for-byte equality
    Strict,
    /// Trim leading and trailing whitespace of the whole output
    Trim,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("config/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.server.bind_address, Some("127.0.0.1".to_string()));
        assert_eq!(config.judge.judge_type, JudgeType::Standard);
        assert_eq!(config.judge.compile_time_limit, MicroSecond(30_000_000));
        assert!(matches!(config.executor, ExecutorConfig::Process));
        assert_eq!(config.languages[0].name, "cpp");
        assert_eq!(config.languages[0].time_limit, Some(MicroSecond(2_000_000)));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.languages.is_empty());
        assert_eq!(config.judge.max_concurrent_submissions, 4);
        assert_eq!(
            config.judge.memory_cgroup,
            Some(PathBuf::from("/sys/fs/cgroup/oj-engine"))
        );
        match config.executor {
            ExecutorConfig::Auto(isolate) => assert_eq!(isolate.box_count, 8),
            other => panic!("unexpected executor config: {other:?}"),
        }
    }

    #[test]
    fn test_remote_executor_config() {
        let config: ExecutorConfig = serde_json::from_str(
            r#"{ "backend": "remote", "base_url": "http://judge0:2358", "max_polls": 5 }"#,
        )
        .unwrap();
        match config {
            ExecutorConfig::Remote(remote) => {
                assert_eq!(remote.base_url, "http://judge0:2358");
                assert_eq!(remote.max_polls, 5);
                assert_eq!(remote.auth_header, "X-Auth-Token");
                assert_eq!(remote.poll_interval, MicroSecond(500_000));
                assert_eq!(remote.max_wall_time_limit, MicroSecond(20_000_000));
            }
            other => panic!("unexpected executor config: {other:?}"),
        }
    }

    #[test]
    fn test_memory_cgroup_can_be_disabled() {
        let judge: JudgeConfig = serde_json::from_str(r#"{ "memory_cgroup": null }"#).unwrap();
        assert_eq!(judge.memory_cgroup, None);
        assert_eq!(judge.max_concurrent_submissions, 4);
    }

    #[test]
    fn test_judge_type_names() {
        let judge_type: JudgeType = serde_json::from_str("\"trim\"").unwrap();
        assert_eq!(judge_type, JudgeType::Trim);
    }
}

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ByteSize, JudgeType, MicroSecond};

/// One program invocation handed to an executor, built fresh for every test case
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: String,
    pub source_code: String,
    pub stdin: String,
    pub time_limit: Duration,
    /// Memory limit in bytes
    pub memory_limit: u64,
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The program exited on its own with this code
    Normal(i32),
    TimedOut,
    /// The memory cap was tripped
    MemoryExceeded,
    /// Terminated by a fatal signal, when the backend knows which
    Crashed(Option<i32>),
    /// The compile step failed; the program never ran
    CompileError,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    /// Program stderr, or compiler output for `ExitStatus::CompileError`
    pub stderr: String,
    pub exit_status: ExitStatus,
    pub wall_time: Duration,
    /// Peak memory in bytes; zero when the backend cannot measure it
    pub memory_used: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_public: bool,
    pub time_limit: Option<MicroSecond>,
    pub memory_limit: Option<ByteSize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Question {
    #[serde(default)]
    pub id: String,
    pub test_cases: Vec<TestCase>,
    pub time_limit: Option<MicroSecond>,
    pub memory_limit: Option<ByteSize>,
    /// Overrides the engine-wide output comparison mode
    pub judge_type: Option<JudgeType>,
}

/// `Run` checks the public samples only, `Submit` judges every test case
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionType {
    Run,
    #[default]
    Submit,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerdictKind {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "RTE")]
    RuntimeError,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "IE")]
    InternalError,
}

impl VerdictKind {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Self::Accepted => "AC",
            Self::WrongAnswer => "WA",
            Self::TimeLimitExceeded => "TLE",
            Self::MemoryLimitExceeded => "MLE",
            Self::RuntimeError => "RTE",
            Self::CompileError => "CE",
            Self::InternalError => "IE",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::WrongAnswer => "Wrong Answer",
            Self::TimeLimitExceeded => "Time Limit Exceeded",
            Self::MemoryLimitExceeded => "Memory Limit Exceeded",
            Self::RuntimeError => "Runtime Error",
            Self::CompileError => "Compilation Error",
            Self::InternalError => "Internal Error",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbreviation())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CaseVerdict {
    /// Position of the case in the question's test case list
    pub test_case_index: usize,
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub passed: bool,
    pub verdict: VerdictKind,
    #[serde(rename = "wall_time_us", with = "micros")]
    pub wall_time: Duration,
    /// Peak memory in bytes, zero when unknown
    pub memory_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub is_public: bool,
}

impl CaseVerdict {
    /// Verdict for a case that could not be executed at all
    pub fn internal_error(index: usize, case: &TestCase, detail: String) -> Self {
        Self {
            test_case_index: index,
            input: case.input.clone(),
            expected_output: case.expected_output.clone(),
            actual_output: String::new(),
            passed: false,
            verdict: VerdictKind::InternalError,
            wall_time: Duration::ZERO,
            memory_used: 0,
            error_detail: Some(detail),
            is_public: case.is_public,
        }
    }

    /// Drops data of hidden cases that must not reach the contestant
    pub fn redact(&mut self) {
        if !self.is_public {
            self.input.clear();
            self.expected_output.clear();
            self.actual_output.clear();
        }
    }
}

/// Final outcome of one submission; a new submission always produces a new value
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionResult {
    pub case_verdicts: Vec<CaseVerdict>,
    pub overall_passed: bool,
    pub passed_count: usize,
    pub total_count: usize,
    #[serde(rename = "total_wall_time_us", with = "micros")]
    pub total_wall_time: Duration,
    pub peak_memory: u64,
    /// Percentage of passed cases, 0 to 100
    pub score: u32,
    /// First failing verdict, or AC when every case passed
    pub verdict: VerdictKind,
    pub judged_at: String,
}

impl SubmissionResult {
    pub fn redact_hidden(&mut self) {
        self.case_verdicts.iter_mut().for_each(CaseVerdict::redact);
    }
}

mod micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}

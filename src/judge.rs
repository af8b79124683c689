use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use directories::ProjectDirs;
use tokio_util::sync::CancellationToken;

use crate::compare::{normalize_output, outputs_match};
use crate::config::{JudgeConfig, JudgeType};
use crate::error::{ExecutorError, JudgeError};
use crate::language::{LanguageRegistry, Toolchain};
use crate::model::{
    CaseVerdict, ExecutionRequest, ExecutionResult, ExitStatus, Question, SubmissionResult,
    SubmissionType, TestCase, VerdictKind,
};
use crate::sandbox::{Executor, WorkDir};
use crate::verdict::aggregate;

/// Engine-wide settings of the test case runner
#[derive(Debug, Clone)]
pub struct JudgeOptions {
    pub work_root: PathBuf,
    pub judge_type: JudgeType,
    pub max_time_limit: Duration,
    /// Bytes
    pub max_memory_limit: u64,
}

impl JudgeOptions {
    pub fn from_config(config: &JudgeConfig) -> Result<Self> {
        let work_root = match &config.work_root {
            Some(path) => path.clone(),
            None => ProjectDirs::from("", "", "oj-engine")
                .ok_or_else(|| anyhow!("Failed to determine a cache directory for work dirs"))?
                .cache_dir()
                .join("work"),
        };
        log::info!("Work directories are created under {}", work_root.display());

        Ok(Self {
            work_root,
            judge_type: config.judge_type,
            max_time_limit: config.max_time_limit.into(),
            max_memory_limit: config.max_memory_limit.0,
        })
    }
}

/// Runs submissions against the test cases of a question
///
/// One `Judge` serves any number of concurrent submissions; the cases of a
/// single submission run one after another in question order.
pub struct Judge {
    registry: Arc<LanguageRegistry>,
    executor: Arc<dyn Executor>,
    options: JudgeOptions,
}

impl Judge {
    pub fn new(registry: Arc<LanguageRegistry>, executor: Arc<dyn Executor>, options: JudgeOptions) -> Self {
        Self {
            registry,
            executor,
            options,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &'static str {
        self.executor.name()
    }

    pub async fn health_check(&self) -> Result<(), ExecutorError> {
        self.executor.health_check().await
    }

    /// Judges the source against every test case of the question
    pub async fn run_all(
        &self,
        question: &Question,
        source_code: &str,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResult, JudgeError> {
        self.judge(question, language, source_code, SubmissionType::Submit, cancel)
            .await
    }

    /// Judges the source against the cases selected by `submission_type`
    ///
    /// An unsupported language does not fail the call: every selected case
    /// gets an IE verdict instead.
    pub async fn judge(
        &self,
        question: &Question,
        language: &str,
        source_code: &str,
        submission_type: SubmissionType,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResult, JudgeError> {
        let cases: Vec<(usize, &TestCase)> = question
            .test_cases
            .iter()
            .enumerate()
            .filter(|(_, case)| submission_type == SubmissionType::Submit || case.is_public)
            .collect();

        if cases.is_empty() {
            log::warn!("Question {} has no test cases for {submission_type:?}", question.id);
            return Err(JudgeError::NoTestCases);
        }

        let toolchain = match self.registry.lookup(language) {
            Ok(toolchain) => toolchain,
            Err(e) => {
                log::warn!("Rejecting submission for question {}: {e}", question.id);
                let verdicts = cases
                    .iter()
                    .map(|&(index, case)| CaseVerdict::internal_error(index, case, e.to_string()))
                    .collect();
                return aggregate(verdicts);
            }
        };

        let judge_type = question.judge_type.unwrap_or(self.options.judge_type);
        log::info!(
            "Judging question {} ({} cases) in {} on {}",
            question.id,
            cases.len(),
            toolchain.name,
            self.executor.name()
        );

        let mut verdicts = Vec::with_capacity(cases.len());
        for (index, case) in cases {
            if cancel.is_cancelled() {
                log::info!("Submission for question {} cancelled before case {index}", question.id);
                return Err(JudgeError::Cancelled);
            }

            let verdict = self
                .judge_case(toolchain, question, index, case, source_code, judge_type)
                .await;
            log::debug!("Question {} case {index}: {}", question.id, verdict.verdict);
            verdicts.push(verdict);
        }

        let result = aggregate(verdicts)?;
        log::info!(
            "Question {} judged: {} ({}/{}, score {})",
            question.id,
            result.verdict,
            result.passed_count,
            result.total_count,
            result.score
        );
        Ok(result)
    }

    async fn judge_case(
        &self,
        toolchain: &Toolchain,
        question: &Question,
        index: usize,
        case: &TestCase,
        source_code: &str,
        judge_type: JudgeType,
    ) -> CaseVerdict {
        let request = ExecutionRequest {
            language: toolchain.name.clone(),
            source_code: source_code.to_string(),
            stdin: case.input.clone(),
            time_limit: self.time_limit(toolchain, question, case),
            memory_limit: self.memory_limit(toolchain, question, case),
        };

        let work_dir = match WorkDir::create(&self.options.work_root) {
            Ok(dir) => dir,
            Err(e) => {
                log::error!("Failed to create work dir for case {index}: {e}");
                return CaseVerdict::internal_error(index, case, format!("failed to create work dir: {e}"));
            }
        };

        match self.executor.execute(toolchain, &request, &work_dir).await {
            Ok(result) => classify(index, case, &request, result, judge_type),
            Err(e) if e.is_unavailable() => {
                log::warn!("Executor {} unavailable on case {index}: {e}", self.executor.name());
                CaseVerdict::internal_error(index, case, e.to_string())
            }
            Err(e) => {
                log::error!("Executor {} failed on case {index}: {e}", self.executor.name());
                CaseVerdict::internal_error(index, case, e.to_string())
            }
        }
    }

    fn time_limit(&self, toolchain: &Toolchain, question: &Question, case: &TestCase) -> Duration {
        case.time_limit
            .or(question.time_limit)
            .map(Duration::from)
            .unwrap_or(toolchain.time_limit)
            .min(self.options.max_time_limit)
    }

    fn memory_limit(&self, toolchain: &Toolchain, question: &Question, case: &TestCase) -> u64 {
        case.memory_limit
            .or(question.memory_limit)
            .map_or(toolchain.memory_limit, |limit| limit.0)
            .min(self.options.max_memory_limit)
    }
}

/// Turns one execution result into a verdict: CE, TLE, MLE, RTE, then output comparison
fn classify(
    index: usize,
    case: &TestCase,
    request: &ExecutionRequest,
    result: ExecutionResult,
    judge_type: JudgeType,
) -> CaseVerdict {
    let (verdict, error_detail) = match result.exit_status {
        ExitStatus::CompileError => (VerdictKind::CompileError, Some(result.stderr.clone())),
        ExitStatus::TimedOut => (VerdictKind::TimeLimitExceeded, None),
        ExitStatus::MemoryExceeded => (VerdictKind::MemoryLimitExceeded, None),
        _ if result.memory_used > request.memory_limit => (VerdictKind::MemoryLimitExceeded, None),
        ExitStatus::Crashed(signal) => {
            let reason = match signal {
                Some(signal) => format!("killed by signal {signal}"),
                None => "terminated abnormally".to_string(),
            };
            (VerdictKind::RuntimeError, Some(with_stderr(reason, &result.stderr)))
        }
        ExitStatus::Normal(code) if code != 0 => (
            VerdictKind::RuntimeError,
            Some(with_stderr(format!("exited with code {code}"), &result.stderr)),
        ),
        ExitStatus::Normal(_) if outputs_match(&result.stdout, &case.expected_output, judge_type) => {
            (VerdictKind::Accepted, None)
        }
        ExitStatus::Normal(_) => (VerdictKind::WrongAnswer, None),
    };

    let actual_output = match verdict {
        VerdictKind::CompileError => String::new(),
        _ => normalize_output(&result.stdout, judge_type),
    };

    CaseVerdict {
        test_case_index: index,
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output,
        passed: verdict == VerdictKind::Accepted,
        verdict,
        wall_time: result.wall_time,
        memory_used: result.memory_used,
        error_detail,
        is_public: case.is_public,
    }
}

fn with_stderr(reason: String, stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        reason
    } else {
        format!("{reason}\n{stderr}")
    }
}

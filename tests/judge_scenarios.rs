use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use oj_engine::config::{ByteSize, JudgeConfig, JudgeType, LanguageConfig, MicroSecond};
use oj_engine::judge::{Judge, JudgeOptions};
use oj_engine::language::LanguageRegistry;
use oj_engine::model::{Question, SubmissionType, TestCase, VerdictKind};
use oj_engine::sandbox::ProcessSandbox;

static WORK_ROOT_COUNTER: AtomicU32 = AtomicU32::new(0);

const SUM_PROGRAM: &str = "read a b\necho $((a + b))";

// Removes the per-test work root even if the test panics
struct WorkRootGuard(PathBuf);

impl Drop for WorkRootGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Shell scripts "compile" with `sh -n`, which only checks syntax
fn shell_language() -> LanguageConfig {
    LanguageConfig {
        name: "sh".to_string(),
        file_name: "main.sh".to_string(),
        compile: strings(&["/bin/sh", "-n", "%INPUT%"]),
        run: strings(&["/bin/sh", "%INPUT%"]),
        profile: "default".to_string(),
        remote_id: None,
        time_limit: Some(MicroSecond(1_000_000)),
        memory_limit: None,
    }
}

fn cpp_language() -> LanguageConfig {
    LanguageConfig {
        name: "cpp".to_string(),
        file_name: "main.cpp".to_string(),
        compile: strings(&["g++", "-O2", "-o", "%OUTPUT%", "%INPUT%"]),
        run: strings(&["./%OUTPUT%"]),
        profile: "default".to_string(),
        remote_id: Some(54),
        time_limit: Some(MicroSecond(2_000_000)),
        memory_limit: None,
    }
}

fn create_judge() -> (Arc<Judge>, WorkRootGuard) {
    let id = WORK_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let work_root =
        std::env::temp_dir().join(format!("oj-engine-scenario-{}-{id}", std::process::id()));

    let config = JudgeConfig {
        work_root: Some(work_root.clone()),
        compile_time_limit: MicroSecond(10_000_000),
        ..JudgeConfig::default()
    };
    let registry = LanguageRegistry::from_config(&[shell_language(), cpp_language()], &[]).unwrap();
    let executor = Arc::new(ProcessSandbox::build(&config));
    let options = JudgeOptions::from_config(&config).unwrap();

    (
        Arc::new(Judge::new(Arc::new(registry), executor, options)),
        WorkRootGuard(work_root),
    )
}

fn case(input: &str, expected: &str) -> TestCase {
    TestCase {
        input: input.to_string(),
        expected_output: expected.to_string(),
        is_public: true,
        time_limit: None,
        memory_limit: None,
    }
}

fn question(test_cases: Vec<TestCase>) -> Question {
    Question {
        id: "a-plus-b".to_string(),
        test_cases,
        time_limit: None,
        memory_limit: None,
        judge_type: None,
    }
}

fn has_compiler() -> bool {
    std::process::Command::new("g++").arg("--version").output().is_ok()
}

/// Processes whose command line is exactly `argv`
fn processes_running(argv: &[&str]) -> usize {
    let wanted: Vec<u8> = argv.iter().flat_map(|arg| arg.bytes().chain([0])).collect();
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| std::fs::read(entry.ok()?.path().join("cmdline")).ok())
        .filter(|cmdline| *cmdline == wanted)
        .count()
}

fn leftover_entries(guard: &WorkRootGuard) -> usize {
    std::fs::read_dir(&guard.0)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_correct_sum_is_accepted() {
    let (judge, guard) = create_judge();
    let q = question(vec![case("1 2\n", "3\n"), case("-5 5\n", "0")]);

    let result = judge
        .run_all(&q, SUM_PROGRAM, "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.overall_passed);
    assert_eq!(result.score, 100);
    assert_eq!(result.verdict, VerdictKind::Accepted);
    assert_eq!(result.case_verdicts[0].actual_output, "3");
    assert_eq!(result.case_verdicts[1].actual_output, "0");
    assert_eq!(leftover_entries(&guard), 0);
}

#[tokio::test]
async fn test_wrong_output_is_wrong_answer() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("1 2", "3")]);

    let result = judge
        .run_all(&q, "read a b\necho $((a - b))", "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.verdict, VerdictKind::WrongAnswer);
    assert_eq!(result.case_verdicts[0].actual_output, "-1");
    assert!(!result.case_verdicts[0].passed);
}

#[tokio::test]
async fn test_infinite_loop_times_out_within_grace() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("", "")]);

    let start = Instant::now();
    let result = judge
        .run_all(&q, "while :; do :; done", "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.verdict, VerdictKind::TimeLimitExceeded);
    assert!(start.elapsed() < Duration::from_secs(4), "took {:?}", start.elapsed());

    // Killed at the 1 s limit, not at the CPU rlimit a second later
    let wall = result.case_verdicts[0].wall_time;
    assert!(wall >= Duration::from_secs(1), "wall {wall:?}");
    assert!(wall < Duration::from_millis(1500), "wall {wall:?}");
}

#[tokio::test]
async fn test_timeout_kills_background_children() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("", "")]);

    let result = judge
        .run_all(
            &q,
            "sleep 77.7 &\nwhile :; do :; done",
            "sh",
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.verdict, VerdictKind::TimeLimitExceeded);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(processes_running(&["sleep", "77.7"]), 0);
}

#[tokio::test]
async fn test_memory_hog_is_memory_limit_exceeded() {
    let (judge, guard) = create_judge();
    let mut q = question(vec![case("", "")]);
    q.memory_limit = Some(ByteSize(64 << 20));

    // Holds 200 MB of command substitution output in a shell variable
    let source = "x=$(head -c 200000000 /dev/zero | tr '\\0' a)\necho ${#x}";
    let result = judge
        .run_all(&q, source, "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.verdict, VerdictKind::MemoryLimitExceeded);
    assert_eq!(result.score, 0);
    assert_eq!(leftover_entries(&guard), 0);
}

#[tokio::test]
async fn test_syntax_error_is_compile_error_for_every_case() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("1 2", "3"), case("2 3", "5"), case("3 4", "7")]);

    let result = judge
        .run_all(&q, "if then fi (", "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.score, 0);
    assert_eq!(result.verdict, VerdictKind::CompileError);
    let details: Vec<_> = result
        .case_verdicts
        .iter()
        .map(|v| {
            assert_eq!(v.verdict, VerdictKind::CompileError);
            v.error_detail.clone().unwrap()
        })
        .collect();
    assert!(!details[0].is_empty());
    assert!(details.iter().all(|d| d == &details[0]));
}

#[tokio::test]
async fn test_partial_credit() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("1 2", "3"), case("2 2", "4"), case("0 0", "1")]);

    let result = judge
        .run_all(&q, SUM_PROGRAM, "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.passed_count, 2);
    assert_eq!(result.total_count, 3);
    assert_eq!(result.score, 67);
    assert!(!result.overall_passed);
    assert_eq!(result.verdict, VerdictKind::WrongAnswer);
}

#[tokio::test]
async fn test_non_zero_exit_is_runtime_error() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("", "")]);

    let result = judge
        .run_all(&q, "echo boom >&2\nexit 3", "sh", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.verdict, VerdictKind::RuntimeError);
    let detail = result.case_verdicts[0].error_detail.as_deref().unwrap();
    assert!(detail.contains("exited with code 3"), "{detail}");
    assert!(detail.contains("boom"), "{detail}");
}

#[tokio::test]
async fn test_unsupported_language_is_internal_error() {
    let (judge, _guard) = create_judge();
    let q = question(vec![case("", ""), case("", "")]);

    let result = judge
        .run_all(&q, "", "cobol", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.total_count, 2);
    assert_eq!(result.verdict, VerdictKind::InternalError);
    assert_eq!(result.score, 0);
}

#[tokio::test]
async fn test_strict_question_rejects_missing_newline() {
    let (judge, _guard) = create_judge();
    let mut q = question(vec![case("1 2", "3")]);
    q.judge_type = Some(JudgeType::Strict);

    let result = judge
        .run_all(&q, "printf 3", "sh", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.verdict, VerdictKind::Accepted);

    let result = judge
        .run_all(&q, "echo 3", "sh", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.verdict, VerdictKind::WrongAnswer);
}

#[tokio::test]
async fn test_run_only_judges_public_cases() {
    let (judge, _guard) = create_judge();
    let mut hidden = case("5 5", "10");
    hidden.is_public = false;
    let q = question(vec![case("1 2", "3"), hidden]);

    let result = judge
        .judge(&q, "sh", SUM_PROGRAM, SubmissionType::Run, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.total_count, 1);
    assert!(result.overall_passed);
}

#[tokio::test]
async fn test_concurrent_submissions_leave_no_work_dirs() {
    let (judge, guard) = create_judge();
    let q = question(vec![case("1 2", "3"), case("4 5", "9")]);

    let mut tasks = JoinSet::new();
    for i in 0..6 {
        let judge = Arc::clone(&judge);
        let q = q.clone();
        let source = if i % 2 == 0 { SUM_PROGRAM } else { "exit 1" };
        tasks.spawn(async move {
            judge
                .run_all(&q, source, "sh", &CancellationToken::new())
                .await
                .unwrap()
        });
    }

    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().overall_passed {
            accepted += 1;
        }
    }

    assert_eq!(accepted, 3);
    assert_eq!(leftover_entries(&guard), 0);
}

#[tokio::test]
async fn test_cpp_sum_when_compiler_present() {
    if !has_compiler() {
        eprintln!("g++ not found, skipping");
        return;
    }

    let (judge, _guard) = create_judge();
    let q = question(vec![case("1 2", "3"), case("100 -1", "99")]);
    let source = "#include <iostream>\nint main() { long a, b; std::cin >> a >> b; std::cout << a + b << std::endl; }";

    let result = judge
        .run_all(&q, source, "cpp", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.verdict, VerdictKind::Accepted);
    assert_eq!(result.score, 100);
}

#[tokio::test]
async fn test_cpp_oversized_vector_is_memory_limit_exceeded() {
    if !has_compiler() {
        eprintln!("g++ not found, skipping");
        return;
    }

    let (judge, _guard) = create_judge();
    let mut q = question(vec![case("", "1073741824")]);
    q.memory_limit = Some(ByteSize(64 << 20));
    let source = "#include <iostream>\n#include <vector>\nint main() { std::vector<char> v(1u << 30); std::cout << v.size() << std::endl; }";

    let result = judge
        .run_all(&q, source, "cpp", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.verdict, VerdictKind::MemoryLimitExceeded);
    assert!(!result.case_verdicts[0].passed);
}

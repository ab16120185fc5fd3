use std::sync::Arc;
use std::time::Duration;

use jobs_core::models::{Job, RunStatus, StepStatus, TriggerSource};
use jobs_core::traits::JobStepRepository;
use jobs_engine::{ExecutionEngine, ExecutorRegistry, LogStreamHub, RunOutcome, RunRequest};
use jobs_executors::register_builtin;
use jobs_infrastructure::memory::{InMemoryJobRunRepository, InMemoryJobStepRepository};
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: ExecutionEngine,
    steps: Arc<InMemoryJobStepRepository>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(ExecutorRegistry::new());
        register_builtin(&registry).unwrap();
        let steps = Arc::new(InMemoryJobStepRepository::new());
        let engine = ExecutionEngine::new(
            registry,
            Arc::new(InMemoryJobRunRepository::new()),
            steps.clone(),
            LogStreamHub::default(),
        );
        Self { engine, steps }
    }

    async fn run(&self, target: &str, params: &str) -> RunOutcome {
        self.run_with_cancel(target, params, CancellationToken::new())
            .await
    }

    async fn run_with_cancel(
        &self,
        target: &str,
        params: &str,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let mut job = Job::new("内置执行器", target, "0 0 3 * * *").with_params(params);
        job.id = 1;
        self.engine
            .execute(RunRequest::new(job, TriggerSource::Manual).with_cancel(cancel))
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_noop_logs_params() {
    let harness = Harness::new();
    let outcome = harness.run("noop", r#"{"k":1}"#).await;
    assert_eq!(outcome.status, RunStatus::Success);

    let steps = harness.steps.list_by_run(outcome.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].output.as_deref(), Some(r#"参数: {"k":1}"#));
}

#[tokio::test]
async fn test_http_rejects_invalid_params() {
    let harness = Harness::new();
    let outcome = harness.run("http", r#"{"method":"GET"}"#).await;
    assert_eq!(outcome.status, RunStatus::Failed);

    let outcome = harness
        .run("http", r#"{"url":"http://127.0.0.1:1","method":"TRACE"}"#)
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(harness
        .steps
        .list_by_run(outcome.run_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_http_connection_failure_fails_step() {
    let harness = Harness::new();
    let outcome = harness
        .run("http", r#"{"url":"http://127.0.0.1:1/health","timeout_seconds":2}"#)
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);

    let steps = harness.steps.list_by_run(outcome.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].error.as_deref().unwrap().starts_with("HTTP请求失败"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_streams_stdout_and_stderr() {
    let harness = Harness::new();
    let outcome = harness
        .run(
            "shell",
            r#"{"command":"sh","args":["-c","echo one; echo two >&2; echo $GREETING"],"env":{"GREETING":"hi"}}"#,
        )
        .await;
    assert_eq!(outcome.status, RunStatus::Success);

    let steps = harness.steps.list_by_run(outcome.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    let output = steps[0].output.clone().unwrap();
    let mut lines: Vec<&str> = output.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["[stderr] two", "hi", "one"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_non_zero_exit_fails() {
    let harness = Harness::new();
    let outcome = harness
        .run("shell", r#"{"command":"sh","args":["-c","exit 3"]}"#)
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);

    let steps = harness.steps.list_by_run(outcome.run_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(steps[0].error.as_deref().unwrap().contains("退出码"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_missing_command_fails() {
    let harness = Harness::new();
    let outcome = harness
        .run("shell", r#"{"command":"/nonexistent/binary"}"#)
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.message.contains("执行失败"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_shell_cancellation_kills_child() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = harness
        .run_with_cancel("shell", r#"{"command":"sleep","args":["30"]}"#, cancel)
        .await;
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(started.elapsed() < Duration::from_secs(10));
}

//! Integration tests for the supervisor, using `sh -c` scripts as hosts

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tickrun::config::TestConfig;
use tickrun::protocol::{ResultStatus, TestRunnerEvent};
use tickrun::reporter::Reporter;
use tickrun::supervisor::{HostInvocation, Supervisor, SupervisorOptions};
use tickrun::Error;

/// Reporter that keeps everything it is told
#[derive(Default)]
struct Recorded {
    events: Vec<TestRunnerEvent>,
    logs: Vec<String>,
    results: Vec<(ResultStatus, bool)>,
    errors: Vec<String>,
}

impl Reporter for Recorded {
    fn on_event(&mut self, event: &TestRunnerEvent) {
        self.events.push(event.clone());
    }

    fn on_log(&mut self, text: &str) {
        self.logs.push(text.to_string());
    }

    fn on_result(&mut self, status: ResultStatus, focused: bool) {
        self.results.push((status, focused));
    }

    fn on_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

fn sh(script: &str) -> HostInvocation {
    let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
    HostInvocation::from_command(&command).expect("Command is not empty")
}

fn options(output_timeout: u64) -> SupervisorOptions {
    SupervisorOptions {
        output_timeout,
        exit_grace: Duration::from_millis(500),
        ..SupervisorOptions::default()
    }
}

#[tokio::test]
async fn test_result_line_ends_run() {
    let script = r#"
printf '%s\n' 'TICKRUN-EVENT:{"type":"runStarted"}'
printf '%s\n' 'TICKRUN-EVENT:{"type":"testStarted","test":{"path":"f > a"}}'
echo "inside a"
printf '%s\n' 'TICKRUN-EVENT:{"type":"testPassed","test":{"path":"f > a","durationMs":3.0}}'
echo "TICKRUN-RESULT:passed:focused"
"#;
    let mut reporter = Recorded::default();
    let outcome = Supervisor::new(options(10), &mut reporter)
        .run(&sh(script), &TestConfig::default())
        .await
        .expect("Run should succeed");

    assert_eq!(outcome.status, ResultStatus::Passed);
    assert!(outcome.focused);
    assert_eq!(outcome.report.tests.len(), 1);
    assert_eq!(outcome.report.tests[0].logs, vec!["inside a"]);
    assert_eq!(outcome.report.tests[0].duration, Some(Duration::from_millis(3)));
    assert_eq!(reporter.events.len(), 3);
    assert_eq!(reporter.results, vec![(ResultStatus::Passed, true)]);
}

#[tokio::test]
async fn test_stderr_lines_are_decoded_too() {
    let script = r#"
echo "from stderr" >&2
echo "TICKRUN-RESULT:failed" >&2
"#;
    let mut reporter = Recorded::default();
    let outcome = Supervisor::new(options(10), &mut reporter)
        .run(&sh(script), &TestConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert_eq!(outcome.report.orphan_logs, vec!["from stderr"]);
}

#[tokio::test]
async fn test_other_stream_is_drained_after_result() {
    let script = r#"
echo "late warning" >&2
echo TICKRUN-RESULT:passed
echo "after the result"
"#;
    let mut reporter = Recorded::default();
    let outcome = Supervisor::new(options(10), &mut reporter)
        .run(&sh(script), &TestConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ResultStatus::Passed);
    assert_eq!(outcome.report.orphan_logs, vec!["late warning"]);
    assert_eq!(reporter.logs, vec!["late warning"]);
}

#[tokio::test]
async fn test_host_receives_config() {
    let config = TestConfig {
        bail: Some(3),
        ..TestConfig::default()
    };
    let script = r#"echo "$TICKRUN_CONFIG"; echo TICKRUN-RESULT:passed"#;
    let mut reporter = Recorded::default();
    let outcome = Supervisor::new(options(10), &mut reporter)
        .run(&sh(script), &config)
        .await
        .unwrap();

    let echoed = &outcome.report.orphan_logs[0];
    let received = TestConfig::from_json(echoed).expect("Host should see valid config JSON");
    assert_eq!(received.bail, Some(3));
}

#[tokio::test]
async fn test_watchdog_kills_silent_host() {
    let invocation = sh("echo started; sleep 30").log_path(Some(PathBuf::from("/tmp/host.log")));
    let mut reporter = Recorded::default();
    let started = Instant::now();
    let err = Supervisor::new(options(1), &mut reporter)
        .run(&invocation, &TestConfig::default())
        .await
        .expect_err("Silent host should time out");

    assert!(started.elapsed() < Duration::from_secs(10));
    match &err {
        Error::OutputTimeout { seconds, log_path } => {
            assert_eq!(*seconds, 1);
            assert_eq!(log_path.as_deref(), Some(std::path::Path::new("/tmp/host.log")));
        }
        other => panic!("expected output timeout, got {other:?}"),
    }
    let message = err.to_string();
    assert!(message.contains("1 seconds"));
    assert!(message.contains("/tmp/host.log"));
    assert_eq!(reporter.errors, vec![message]);
}

#[tokio::test]
async fn test_exit_without_result_fails() {
    let mut reporter = Recorded::default();
    let err = Supervisor::new(options(10), &mut reporter)
        .run(&sh("echo partial; exit 3"), &TestConfig::default())
        .await
        .expect_err("Missing result line is a failure");

    assert!(matches!(err, Error::HostExited { code: Some(3) }));
    assert_eq!(reporter.logs, vec!["partial"]);
}

#[tokio::test]
async fn test_lingering_host_is_killed_after_result() {
    let mut reporter = Recorded::default();
    let started = Instant::now();
    let outcome = Supervisor::new(options(0), &mut reporter)
        .run(&sh("echo TICKRUN-RESULT:todo; sleep 30"), &TestConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ResultStatus::Todo);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_spawn_failure() {
    let command = vec!["/nonexistent/tickrun-host".to_string()];
    let invocation = HostInvocation::from_command(&command).unwrap();
    let mut reporter = Recorded::default();
    let err = Supervisor::new(options(10), &mut reporter)
        .run(&invocation, &TestConfig::default())
        .await
        .expect_err("Missing program cannot start");
    assert!(matches!(err, Error::Spawn { .. }));
}

//! Integration tests for the line protocol between host and supervisor

use tickrun::collector::{RunCollector, TestResultKind};
use tickrun::protocol::{
    encode_event, encode_message, encode_result, DecodedLine, LineDecoder, ResultStatus,
    RunSummary, SourceLocation, TestInfo, TestRunnerEvent, EVENT_PREFIX,
};

fn info(path: &str) -> TestInfo {
    TestInfo {
        path: path.to_string(),
        source: Some(SourceLocation::new("src/world.rs", 12)),
        tags: vec!["slow".to_string()],
        duration_ms: None,
    }
}

fn decode_all(decoder: &mut LineDecoder, text: &str) -> Vec<DecodedLine> {
    text.lines().filter_map(|line| decoder.decode(line)).collect()
}

#[test]
fn test_event_requires_prefix_and_valid_json() {
    let mut decoder = LineDecoder::new();
    let valid = encode_event(&TestRunnerEvent::TestStarted { test: info("a") }).unwrap();
    assert!(matches!(decoder.decode(&valid), Some(DecodedLine::Event(_))));

    // Prefix with a JSON value of the wrong shape
    let wrong_shape = format!("{EVENT_PREFIX}{{\"type\":\"notAnEvent\"}}");
    assert_eq!(
        decoder.decode(&wrong_shape),
        Some(DecodedLine::Log(wrong_shape.clone()))
    );

    // Prefix not at the start of the line
    let indented = format!("  {valid}");
    assert_eq!(decoder.decode(&indented), Some(DecodedLine::Log(indented.clone())));
}

#[test]
fn test_wire_json_uses_camel_case() {
    let mut test = info("f > a");
    test.duration_ms = Some(4.5);
    let line = encode_event(&TestRunnerEvent::TestPassed { test }).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(line.strip_prefix(EVENT_PREFIX).unwrap()).unwrap();
    assert_eq!(json["type"], "testPassed");
    assert_eq!(json["test"]["durationMs"], 4.5);
    assert_eq!(json["test"]["source"]["file"], "src/world.rs");
    assert_eq!(json["test"]["source"]["line"], 12);
}

#[test]
fn test_message_blocks_per_stream() {
    let mut stdout = LineDecoder::new();
    let mut stderr = LineDecoder::new();
    let block = encode_message(&["tickrun: FAIL f > a", "expected 3", "got 4"]);
    let mut lines = block.lines();

    // An interleaved stderr line does not land inside the stdout block
    assert_eq!(stdout.decode(lines.next().unwrap()), None);
    assert_eq!(
        stderr.decode("warning from the host"),
        Some(DecodedLine::Log("warning from the host".to_string()))
    );
    let rest: Vec<DecodedLine> = lines.filter_map(|l| stdout.decode(l)).collect();
    assert_eq!(rest.len(), 1);
    let DecodedLine::Message(message) = &rest[0] else {
        panic!("expected a message, got {:?}", rest[0]);
    };
    assert_eq!(message.headline, "FAIL f > a");
    assert_eq!(message.lines, vec!["expected 3", "got 4"]);
}

#[test]
fn test_stream_rebuilds_report() {
    let summary = RunSummary {
        ran: 2,
        passed: 1,
        failed: 1,
        status: Some(ResultStatus::Failed),
        ..RunSummary::default()
    };
    let events = [
        TestRunnerEvent::RunStarted,
        TestRunnerEvent::TestEntered { test: info("f > a") },
        TestRunnerEvent::TestStarted { test: info("f > a") },
        TestRunnerEvent::TestPassed { test: info("f > a") },
        TestRunnerEvent::TestEntered { test: info("f > b") },
        TestRunnerEvent::TestStarted { test: info("f > b") },
        TestRunnerEvent::TestFailed {
            test: info("f > b"),
            errors: vec!["boom".to_string()],
        },
        TestRunnerEvent::RunFinished { results: summary.clone() },
    ];
    let mut text = String::new();
    for (i, event) in events.iter().enumerate() {
        text.push_str(&encode_event(event).unwrap());
        text.push('\n');
        if i == 5 {
            text.push_str("log inside b\n");
        }
    }
    text.push_str(&encode_result(ResultStatus::Failed, false));
    text.push('\n');

    let mut decoder = LineDecoder::new();
    let mut collector = RunCollector::new();
    for line in decode_all(&mut decoder, &text) {
        collector.handle(&line);
    }
    assert!(collector.is_finished());
    let report = collector.finish();
    assert_eq!(report.summary, Some(summary));
    assert_eq!(report.count(TestResultKind::Passed), 1);
    assert_eq!(report.tests[1].logs, vec!["log inside b"]);
    assert_eq!(report.tests[1].errors, vec!["boom"]);
    assert!(report.orphan_logs.is_empty());
}

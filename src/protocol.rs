//! Line protocol between an embedded test runner and the supervisor
//!
//! The host writes newline-delimited text on two streams. Lines are
//! classified in priority order:
//!
//! 1. `TICKRUN-RESULT:<status>[:focused]`, the single terminal line of a run
//! 2. `TICKRUN-EVENT:<json>`, a structured [`TestRunnerEvent`]
//! 3. message blocks between `TICKRUN-MESSAGE-START` and `TICKRUN-MESSAGE-END`
//! 4. anything else is a plain log line
//!
//! Prefixes are exact string prefixes. An event prefix followed by invalid
//! JSON is a plain log line, not an error.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const RESULT_PREFIX: &str = "TICKRUN-RESULT:";
pub const EVENT_PREFIX: &str = "TICKRUN-EVENT:";
pub const MESSAGE_START: &str = "TICKRUN-MESSAGE-START";
pub const MESSAGE_END: &str = "TICKRUN-MESSAGE-END";
pub const FOCUSED_SUFFIX: &str = ":focused";

/// Terminal status of a run as carried by the result line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultStatus {
    Passed,
    Failed,
    Todo,
    LoadError,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Passed => "passed",
            ResultStatus::Failed => "failed",
            ResultStatus::Todo => "todo",
            ResultStatus::LoadError => "loadError",
            ResultStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "passed" => Some(ResultStatus::Passed),
            "failed" => Some(ResultStatus::Failed),
            "todo" => Some(ResultStatus::Todo),
            "loadError" => Some(ResultStatus::LoadError),
            "cancelled" => Some(ResultStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses that map to exit code 0. `todo` counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Passed | ResultStatus::Todo)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a test, block or hook definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
}

/// Counters of a finished run, as sent in `runFinished`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub ran: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub todo: u32,
    pub cancelled: u32,
    pub describe_block_errors: u32,
    pub status: Option<ResultStatus>,
    #[serde(default)]
    pub has_focused_tests: bool,
}

/// Structured events emitted by the runner (closed set)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TestRunnerEvent {
    RunStarted,
    RunFinished { results: RunSummary },
    RunCancelled,
    DescribeBlockEntered { block: BlockInfo },
    DescribeBlockFinished { block: BlockInfo },
    DescribeBlockFailed { block: BlockInfo, errors: Vec<String> },
    TestEntered { test: TestInfo },
    TestStarted { test: TestInfo },
    TestPassed { test: TestInfo },
    TestFailed { test: TestInfo, errors: Vec<String> },
    TestSkipped { test: TestInfo },
    TestTodo { test: TestInfo },
    LoadError { error: String },
}

/// A multi-line message delimited by block markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// First content line, with everything up to the first `": "` removed
    pub headline: String,
    pub lines: Vec<String>,
}

impl Message {
    fn from_lines(mut lines: Vec<String>) -> Self {
        if lines.is_empty() {
            return Self {
                headline: String::new(),
                lines,
            };
        }
        let first = lines.remove(0);
        let headline = match first.split_once(": ") {
            Some((_, rest)) => rest.to_string(),
            None => first,
        };
        Self { headline, lines }
    }

    /// Headline followed by indented continuation lines
    pub fn text(&self) -> String {
        let mut text = self.headline.clone();
        for line in &self.lines {
            text.push_str("\n    ");
            text.push_str(line);
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Result { status: ResultStatus, focused: bool },
    Event(TestRunnerEvent),
    Message(Message),
    Log(String),
}

/// Stateful classifier for one stream. Keep one decoder per stream so
/// message blocks never interleave across streams.
#[derive(Debug, Default)]
pub struct LineDecoder {
    block: Option<Vec<String>>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one line. Returns `None` while a message block is still open.
    pub fn decode(&mut self, raw: &str) -> Option<DecodedLine> {
        let line = raw.trim_end_matches(|c| c == '\n' || c == '\r');

        if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
            if let Some(result) = parse_result(rest) {
                return Some(result);
            }
        }

        if let Some(json) = line.strip_prefix(EVENT_PREFIX) {
            if let Ok(event) = serde_json::from_str::<TestRunnerEvent>(json) {
                return Some(DecodedLine::Event(event));
            }
        }

        if line == MESSAGE_START {
            // An unterminated block is flushed as-is before a new one opens
            let previous = self.block.replace(Vec::new());
            return previous.map(|lines| DecodedLine::Message(Message::from_lines(lines)));
        }

        if line == MESSAGE_END {
            return match self.block.take() {
                Some(lines) => Some(DecodedLine::Message(Message::from_lines(lines))),
                None => Some(DecodedLine::Log(line.to_string())),
            };
        }

        if let Some(block) = self.block.as_mut() {
            block.push(line.to_string());
            return None;
        }

        Some(DecodedLine::Log(line.to_string()))
    }

    /// Close an unterminated message block at end of stream
    pub fn flush(&mut self) -> Option<DecodedLine> {
        self.block
            .take()
            .map(|lines| DecodedLine::Message(Message::from_lines(lines)))
    }
}

fn parse_result(rest: &str) -> Option<DecodedLine> {
    let (token, focused) = match rest.strip_suffix(FOCUSED_SUFFIX) {
        Some(token) => (token, true),
        None => (rest, false),
    };
    ResultStatus::parse(token.trim()).map(|status| DecodedLine::Result { status, focused })
}

// =============================================================================
// Encoding
// =============================================================================

pub fn encode_event(event: &TestRunnerEvent) -> Result<String, serde_json::Error> {
    Ok(format!("{}{}", EVENT_PREFIX, serde_json::to_string(event)?))
}

pub fn encode_result(status: ResultStatus, focused: bool) -> String {
    if focused {
        format!("{}{}{}", RESULT_PREFIX, status.as_str(), FOCUSED_SUFFIX)
    } else {
        format!("{}{}", RESULT_PREFIX, status.as_str())
    }
}

/// Wrap lines in message block markers
pub fn encode_message<S: AsRef<str>>(lines: &[S]) -> String {
    let mut out = String::from(MESSAGE_START);
    for line in lines {
        out.push('\n');
        out.push_str(line.as_ref());
    }
    out.push('\n');
    out.push_str(MESSAGE_END);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_line_with_focus() {
        let mut decoder = LineDecoder::new();
        assert_eq!(
            decoder.decode("TICKRUN-RESULT:failed:focused"),
            Some(DecodedLine::Result {
                status: ResultStatus::Failed,
                focused: true
            })
        );
    }

    #[test]
    fn test_unknown_result_token_is_log() {
        let mut decoder = LineDecoder::new();
        assert_eq!(
            decoder.decode("TICKRUN-RESULT:exploded"),
            Some(DecodedLine::Log("TICKRUN-RESULT:exploded".to_string()))
        );
    }

    #[test]
    fn test_event_prefix_with_bad_json_is_log() {
        let mut decoder = LineDecoder::new();
        let line = "TICKRUN-EVENT:{not json";
        assert_eq!(decoder.decode(line), Some(DecodedLine::Log(line.to_string())));
    }

    #[test]
    fn test_event_round_trip_through_line() {
        let event = TestRunnerEvent::TestFailed {
            test: TestInfo {
                path: "a > b".to_string(),
                source: Some(SourceLocation::new("src/a.rs", 3)),
                tags: vec![],
                duration_ms: None,
            },
            errors: vec!["boom".to_string()],
        };
        let line = encode_event(&event).unwrap();
        assert!(line.contains("\"type\":\"testFailed\""));
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.decode(&line), Some(DecodedLine::Event(event)));
    }

    #[test]
    fn test_message_block_headline() {
        let mut decoder = LineDecoder::new();
        assert_eq!(decoder.decode(MESSAGE_START), None);
        assert_eq!(decoder.decode("12.3 Script @file.rs:4: something broke"), None);
        assert_eq!(decoder.decode("stack line 1"), None);
        let decoded = decoder.decode(MESSAGE_END);
        let Some(DecodedLine::Message(message)) = decoded else {
            panic!("expected message, got {:?}", decoded);
        };
        assert_eq!(message.headline, "something broke");
        assert_eq!(message.lines, vec!["stack line 1".to_string()]);
        assert_eq!(message.text(), "something broke\n    stack line 1");
    }

    #[test]
    fn test_stray_end_marker_is_log() {
        let mut decoder = LineDecoder::new();
        assert_eq!(
            decoder.decode(MESSAGE_END),
            Some(DecodedLine::Log(MESSAGE_END.to_string()))
        );
    }

    #[test]
    fn test_flush_unterminated_block() {
        let mut decoder = LineDecoder::new();
        decoder.decode(MESSAGE_START);
        decoder.decode("only line");
        let flushed = decoder.flush();
        assert!(matches!(flushed, Some(DecodedLine::Message(m)) if m.headline == "only line"));
        assert_eq!(decoder.flush(), None);
    }

    #[test]
    fn test_encode_result_line() {
        assert_eq!(encode_result(ResultStatus::Passed, false), "TICKRUN-RESULT:passed");
        assert_eq!(
            encode_result(ResultStatus::LoadError, true),
            "TICKRUN-RESULT:loadError:focused"
        );
    }

    #[test]
    fn test_unit_event_json_shape() {
        let json = serde_json::to_string(&TestRunnerEvent::RunStarted).unwrap();
        assert_eq!(json, r#"{"type":"runStarted"}"#);
    }
}

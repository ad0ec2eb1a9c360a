//! Supervisor: drives one host process through a run
//!
//! The host is spawned in its own process group with both output streams
//! piped. Each stream gets a reader task feeding one channel, and each
//! stream keeps its own [`LineDecoder`] so message blocks never mix.
//! Exit paths:
//! - result line received: success, status taken from the line
//! - streams close first: [`Error::HostExited`]
//! - no output for `output_timeout` seconds: kill, [`Error::OutputTimeout`]
//! - shutdown requested: kill, [`Error::Cancelled`]

use crate::collector::{RunCollector, RunReport};
use crate::config::{RunConfig, TestConfig, CONFIG_ENV};
use crate::error::{Error, Result};
use crate::lifecycle::HostGuard;
use crate::protocol::{DecodedLine, LineDecoder, ResultStatus};
use crate::reporter::Reporter;
use crate::signals;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// How to start the host
#[derive(Debug, Clone, Default)]
pub struct HostInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// The host's own diagnostic log, quoted when the watchdog fires
    pub log_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
}

impl HostInvocation {
    /// `command[0]` is the program, the rest its arguments
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or(Error::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            ..Self::default()
        })
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn log_path(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ResultStatus,
    pub focused: bool,
    pub report: RunReport,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Seconds without any output line before the host is killed; 0 disables
    pub output_timeout: u64,
    /// Mirror every raw host line to stderr
    pub verbose: bool,
    /// How long the host may linger after its result line
    pub exit_grace: Duration,
    pub poll: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            output_timeout: 60,
            verbose: false,
            exit_grace: Duration::from_secs(5),
            poll: Duration::from_millis(100),
        }
    }
}

impl From<&RunConfig> for SupervisorOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            output_timeout: config.output_timeout,
            verbose: config.verbose,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn index(self) -> usize {
        match self {
            Stream::Stdout => 0,
            Stream::Stderr => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Stream::Stdout => Stream::Stderr,
            Stream::Stderr => Stream::Stdout,
        }
    }
}

/// Read lines until EOF, lossily decoding non-UTF-8 output
async fn pump<R>(stream: Stream, reader: R, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(?stream, "host stream read failed: {}", e);
                break;
            }
        }
    }
}

pub struct Supervisor<'r> {
    options: SupervisorOptions,
    reporter: &'r mut dyn Reporter,
}

impl<'r> Supervisor<'r> {
    pub fn new(options: SupervisorOptions, reporter: &'r mut dyn Reporter) -> Self {
        Self { options, reporter }
    }

    /// Run the host once and wait for its result line
    pub async fn run(&mut self, invocation: &HostInvocation, config: &TestConfig) -> Result<RunOutcome> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(CONFIG_ENV, config.to_json()?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        let guard = HostGuard::new(child.id().map_or(0, |id| id as i32));
        tracing::info!(pid = guard.pid(), program = %invocation.program, "host started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(Stream::Stdout, stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(Stream::Stderr, stderr, tx.clone()));
        }
        drop(tx);

        let mut decoders = [LineDecoder::new(), LineDecoder::new()];
        let mut collector = RunCollector::new();
        let watchdog = (self.options.output_timeout > 0)
            .then(|| Duration::from_secs(self.options.output_timeout));
        let mut last_output = Instant::now();
        let mut result = None;

        while result.is_none() {
            if signals::shutdown_requested() {
                guard.kill();
                let _ = child.wait().await;
                self.reporter.on_error("Run cancelled");
                return Err(Error::Cancelled);
            }
            if watchdog.is_some_and(|limit| last_output.elapsed() >= limit) {
                guard.kill();
                let _ = child.wait().await;
                let error = Error::OutputTimeout {
                    seconds: self.options.output_timeout,
                    log_path: invocation.log_path.clone(),
                };
                tracing::error!("{}", error);
                self.reporter.on_error(&error.to_string());
                return Err(error);
            }

            let (stream, line) = match tokio::time::timeout(self.options.poll, rx.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(received)) => received,
            };
            last_output = Instant::now();
            if self.options.verbose {
                eprintln!("{line}");
            }
            if let Some(decoded) = decoders[stream.index()].decode(&line) {
                if let DecodedLine::Result { status, focused } = decoded {
                    result = Some((status, focused, stream));
                }
                self.dispatch(&mut collector, &decoded);
            }
        }

        let Some((status, focused, result_stream)) = result else {
            for decoder in &mut decoders {
                if let Some(decoded) = decoder.flush() {
                    self.dispatch(&mut collector, &decoded);
                }
            }
            let exit = child.wait().await?;
            guard.mark_exited();
            let error = Error::HostExited { code: exit.code() };
            tracing::error!("{}", error);
            self.reporter.on_error(&error.to_string());
            return Err(error);
        };

        match tokio::time::timeout(self.options.exit_grace, child.wait()).await {
            Ok(_) => guard.mark_exited(),
            Err(_) => {
                tracing::warn!(pid = guard.pid(), "host still running after its result, killing");
                guard.kill();
                let _ = child.wait().await;
            }
        }

        // The other stream may still hold lines written before the result
        while let Ok(Some((stream, line))) = tokio::time::timeout(self.options.poll, rx.recv()).await {
            if stream == result_stream {
                continue;
            }
            if let Some(decoded) = decoders[stream.index()].decode(&line) {
                self.dispatch(&mut collector, &decoded);
            }
        }
        if let Some(decoded) = decoders[result_stream.other().index()].flush() {
            self.dispatch(&mut collector, &decoded);
        }

        tracing::info!(%status, focused, "host finished");
        Ok(RunOutcome {
            status,
            focused,
            report: collector.finish(),
        })
    }

    fn dispatch(&mut self, collector: &mut RunCollector, line: &DecodedLine) {
        match line {
            DecodedLine::Event(event) => self.reporter.on_event(event),
            DecodedLine::Log(text) => self.reporter.on_log(text),
            DecodedLine::Message(message) => self.reporter.on_log(&message.text()),
            DecodedLine::Result { status, focused } => self.reporter.on_result(*status, *focused),
        }
        collector.handle(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_from_command() {
        let command = vec!["host".to_string(), "--fast".to_string()];
        let invocation = HostInvocation::from_command(&command).unwrap().env("A", "1");
        assert_eq!(invocation.program, "host");
        assert_eq!(invocation.args, vec!["--fast"]);
        assert_eq!(invocation.env, vec![("A".to_string(), "1".to_string())]);
        assert!(matches!(
            HostInvocation::from_command(&[]),
            Err(Error::EmptyCommand)
        ));
    }

    #[test]
    fn test_options_from_run_config() {
        let config = RunConfig {
            output_timeout: 7,
            verbose: true,
            ..RunConfig::default()
        };
        let options = SupervisorOptions::from(&config);
        assert_eq!(options.output_timeout, 7);
        assert!(options.verbose);
        assert_eq!(options.exit_grace, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pump_splits_lines_lossily() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"one\r\ntwo\xff\nlast";
        pump(Stream::Stderr, input, tx).await;
        let mut lines = Vec::new();
        while let Some((stream, line)) = rx.recv().await {
            assert_eq!(stream, Stream::Stderr);
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two\u{fffd}", "last"]);
    }
}

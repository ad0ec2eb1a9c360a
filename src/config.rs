//! Configuration
//! - `TestConfig`: what the embedded scheduler needs, handed to the host as JSON
//! - `RunConfig`: the supervisor's resolved configuration
//! - CLI argument parsing with clap, optional `tickrun.toml` with toml

use crate::error::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the JSON-encoded [`TestConfig`] into the host
pub const CONFIG_ENV: &str = "TICKRUN_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "tickrun.toml";
pub const DEFAULT_DATA_DIR: &str = ".tickrun";
pub const RESULTS_FILE_NAME: &str = "test-results.json";

/// Host ticks per second at game speed 1
const BASE_TICK_RATE: f64 = 60.0;

// =============================================================================
// Host-side configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Multiplier over the base tick rate
    pub game_speed: f64,
    /// Async timeout in ticks when a test does not declare one
    pub default_timeout: u64,
    pub tag_whitelist: Vec<String>,
    pub tag_blacklist: Vec<String>,
    /// Regex matched against full test paths
    pub test_pattern: Option<String>,
    pub log_passed_tests: bool,
    pub log_skipped_tests: bool,
    pub bail: Option<u32>,
    pub reorder_failed_first: bool,
    /// Paths that failed in the previous run
    pub failed_tests: Vec<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            game_speed: 1000.0,
            default_timeout: 60 * 60,
            tag_whitelist: Vec::new(),
            tag_blacklist: Vec::new(),
            test_pattern: None,
            log_passed_tests: true,
            log_skipped_tests: false,
            bail: None,
            reorder_failed_first: true,
            failed_tests: Vec::new(),
        }
    }
}

impl TestConfig {
    /// Read the config the supervisor passed down. Missing means defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("{CONFIG_ENV}: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wall-clock time between ticks, or `None` when ticks should run unthrottled
    pub fn tick_interval(&self) -> Option<Duration> {
        if self.game_speed <= 0.0 {
            return None;
        }
        let interval = Duration::from_secs_f64(1.0 / (BASE_TICK_RATE * self.game_speed));
        (interval >= Duration::from_millis(1)).then_some(interval)
    }
}

// =============================================================================
// CLI Configuration
// =============================================================================

/// Output format for console reporting
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output (to stderr)
    #[default]
    Human,
    /// Machine-readable NDJSON (to stdout)
    Json,
}

/// tickrun - supervise a tick-driven test host
#[derive(Parser, Debug, Default)]
#[command(name = "tickrun", version, about = "Supervise a restartable tick-driven test host")]
pub struct Cli {
    /// Config file (default: ./tickrun.toml if present)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Watch for changes and re-run tests automatically
    #[arg(long, short = 'w')]
    pub watch: bool,

    /// Mirror every raw host line to the terminal
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Output format (also: TICKRUN_FORMAT env var)
    #[arg(long, value_enum, env = "TICKRUN_FORMAT")]
    pub format: Option<OutputFormat>,

    /// Path to generate JUnit XML report (also: TICKRUN_JUNIT_XML env var)
    #[arg(long, env = "TICKRUN_JUNIT_XML")]
    pub junit_xml: Option<PathBuf>,

    /// Seconds without host output before the host is killed (0 disables)
    #[arg(long)]
    pub output_timeout: Option<u64>,

    /// Stop after this many failed tests
    #[arg(long)]
    pub bail: Option<u32>,

    /// Run previously failed tests first
    #[arg(long)]
    pub reorder_failed_first: Option<bool>,

    /// Only run tests carrying one of these tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Skip tests carrying any of these tags
    #[arg(long, value_delimiter = ',')]
    pub exclude_tags: Vec<String>,

    /// Regex matched against full test paths
    #[arg(long)]
    pub filter: Option<String>,

    /// Log passed tests
    #[arg(long)]
    pub log_passed: Option<bool>,

    /// Log skipped tests
    #[arg(long)]
    pub log_skipped: Option<bool>,

    /// Fail the run if any test or block is focused with `only`
    #[arg(long)]
    pub forbid_only: bool,

    /// Async timeout in ticks for tests that do not declare one
    #[arg(long)]
    pub default_timeout: Option<u64>,

    /// Tick rate multiplier
    #[arg(long)]
    pub game_speed: Option<f64>,

    /// Directory for run data such as the results file
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Host's own log file, quoted when the host goes silent
    #[arg(long)]
    pub host_log: Option<PathBuf>,

    /// Name recorded in the results file
    #[arg(long)]
    pub name: Option<String>,

    /// Host command and its arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

// =============================================================================
// Config File
// =============================================================================

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case", default)]
struct FileConfig {
    output_timeout: Option<u64>,
    format: Option<OutputFormat>,
    junit_xml: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    host_log: Option<PathBuf>,
    name: Option<String>,
    forbid_only: Option<bool>,
    watch_patterns: Option<Vec<String>>,
    test: FileTestConfig,
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "kebab-case", default)]
struct FileTestConfig {
    game_speed: Option<f64>,
    default_timeout: Option<u64>,
    tags: Option<Vec<String>>,
    exclude_tags: Option<Vec<String>>,
    filter: Option<String>,
    log_passed: Option<bool>,
    log_skipped: Option<bool>,
    bail: Option<u32>,
    reorder_failed_first: Option<bool>,
}

fn load_file(path: &Path) -> Result<FileConfig> {
    let contents = fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

// =============================================================================
// Resolved supervisor configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub test: TestConfig,
    /// Seconds; 0 disables the watchdog
    pub output_timeout: u64,
    pub verbose: bool,
    pub watch: bool,
    pub watch_patterns: Vec<String>,
    pub data_dir: PathBuf,
    pub results_file: PathBuf,
    pub run_name: String,
    pub junit_xml: Option<PathBuf>,
    pub format: OutputFormat,
    pub host_log: Option<PathBuf>,
    pub forbid_only: bool,
    pub command: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(DEFAULT_DATA_DIR);
        Self {
            test: TestConfig::default(),
            output_timeout: 60,
            verbose: false,
            watch: false,
            watch_patterns: vec!["src/**".to_string(), "tests/**".to_string()],
            results_file: data_dir.join(RESULTS_FILE_NAME),
            data_dir,
            run_name: "tickrun".to_string(),
            junit_xml: None,
            format: OutputFormat::Human,
            host_log: None,
            forbid_only: false,
            command: Vec::new(),
        }
    }
}

impl RunConfig {
    /// Defaults, then the config file, then CLI flags
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                load_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => FileConfig::default(),
        };
        Self::merge(file, cli)
    }

    fn merge(file: FileConfig, cli: Cli) -> Result<Self> {
        let mut config = Self::default();

        // File layer
        let ft = file.test;
        let test = &mut config.test;
        test.game_speed = ft.game_speed.unwrap_or(test.game_speed);
        test.default_timeout = ft.default_timeout.unwrap_or(test.default_timeout);
        test.tag_whitelist = ft.tags.unwrap_or_default();
        test.tag_blacklist = ft.exclude_tags.unwrap_or_default();
        test.test_pattern = ft.filter;
        test.log_passed_tests = ft.log_passed.unwrap_or(test.log_passed_tests);
        test.log_skipped_tests = ft.log_skipped.unwrap_or(test.log_skipped_tests);
        test.bail = ft.bail;
        test.reorder_failed_first = ft.reorder_failed_first.unwrap_or(test.reorder_failed_first);
        config.output_timeout = file.output_timeout.unwrap_or(config.output_timeout);
        config.format = file.format.unwrap_or(config.format);
        config.junit_xml = file.junit_xml;
        config.host_log = file.host_log;
        config.forbid_only = file.forbid_only.unwrap_or(false);
        if let Some(patterns) = file.watch_patterns {
            config.watch_patterns = patterns;
        }
        if let Some(name) = file.name {
            config.run_name = name;
        }
        if let Some(dir) = file.data_dir {
            config.data_dir = dir;
        }

        // CLI layer
        let test = &mut config.test;
        if let Some(speed) = cli.game_speed {
            test.game_speed = speed;
        }
        if let Some(timeout) = cli.default_timeout {
            test.default_timeout = timeout;
        }
        if !cli.tags.is_empty() {
            test.tag_whitelist = cli.tags;
        }
        if !cli.exclude_tags.is_empty() {
            test.tag_blacklist = cli.exclude_tags;
        }
        if cli.filter.is_some() {
            test.test_pattern = cli.filter;
        }
        if let Some(log) = cli.log_passed {
            test.log_passed_tests = log;
        }
        if let Some(log) = cli.log_skipped {
            test.log_skipped_tests = log;
        }
        if cli.bail.is_some() {
            test.bail = cli.bail;
        }
        if let Some(reorder) = cli.reorder_failed_first {
            test.reorder_failed_first = reorder;
        }
        if let Some(pattern) = &test.test_pattern {
            regex::Regex::new(pattern).map_err(|e| Error::pattern(pattern, e))?;
        }

        if let Some(timeout) = cli.output_timeout {
            config.output_timeout = timeout;
        }
        if let Some(format) = cli.format {
            config.format = format;
        }
        if cli.junit_xml.is_some() {
            config.junit_xml = cli.junit_xml;
        }
        if cli.host_log.is_some() {
            config.host_log = cli.host_log;
        }
        if let Some(dir) = cli.data_dir {
            config.data_dir = dir;
        }
        if let Some(name) = cli.name {
            config.run_name = name;
        }
        config.forbid_only |= cli.forbid_only;
        config.verbose = cli.verbose;
        config.watch = cli.watch;
        config.results_file = config.data_dir.join(RESULTS_FILE_NAME);

        if cli.command.is_empty() {
            return Err(Error::EmptyCommand);
        }
        config.command = cli.command;
        Ok(config)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(args)
    }

    #[test]
    fn test_defaults() {
        let config = TestConfig::default();
        assert_eq!(config.default_timeout, 3600);
        assert!(config.reorder_failed_first);
        assert_eq!(config.tick_interval(), None);
    }

    #[test]
    fn test_slow_game_speed_is_throttled() {
        let config = TestConfig {
            game_speed: 1.0,
            ..TestConfig::default()
        };
        let interval = config.tick_interval().unwrap();
        assert!(interval > Duration::from_millis(16));
        assert!(interval < Duration::from_millis(17));
    }

    #[test]
    fn test_json_is_camel_case_and_partial() {
        let config = TestConfig::from_json(r#"{"defaultTimeout": 5, "tagWhitelist": ["a"]}"#)
            .unwrap();
        assert_eq!(config.default_timeout, 5);
        assert_eq!(config.tag_whitelist, vec!["a".to_string()]);
        assert_eq!(config.game_speed, 1000.0);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(
            TestConfig::from_json("{not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_parse_host_command_after_separator() {
        let cli = cli(&["tickrun", "--bail", "1", "--", "host", "--flag"]);
        assert_eq!(cli.bail, Some(1));
        assert_eq!(cli.command, vec!["host".to_string(), "--flag".to_string()]);
    }

    #[test]
    fn test_parse_tag_lists() {
        let cli = cli(&["tickrun", "--tags", "a,b", "--exclude-tags", "slow", "--", "h"]);
        assert_eq!(cli.tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cli.exclude_tags, vec!["slow".to_string()]);
    }

    #[test]
    fn test_cli_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tickrun.toml");
        std::fs::write(
            &path,
            r#"
output-timeout = 30
data-dir = "runs"

[test]
bail = 3
log-passed = false
"#,
        )
        .unwrap();

        let cli = cli(&[
            "tickrun",
            "--config",
            path.to_str().unwrap(),
            "--bail",
            "1",
            "--",
            "host",
        ]);
        let config = RunConfig::resolve(cli).unwrap();
        assert_eq!(config.output_timeout, 30);
        assert_eq!(config.test.bail, Some(1));
        assert!(!config.test.log_passed_tests);
        assert_eq!(config.results_file, PathBuf::from("runs/test-results.json"));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let cli = cli(&["tickrun", "--filter", "(", "--", "host"]);
        assert!(matches!(
            RunConfig::merge(FileConfig::default(), cli),
            Err(Error::Pattern { .. })
        ));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tickrun.toml");
        std::fs::write(&path, "output-timeout = \"soon\"").unwrap();
        assert!(matches!(load_file(&path), Err(Error::Config(_))));
    }
}

//! Client configuration.
//!
//! The engine consumes a [`ClientConfig`]; loading and merging it is the
//! embedder's job. Every section has defaults, so an empty document is a
//! valid configuration.
//!
//! ```toml
//! max_in_flight_async = 16
//!
//! [server]
//! command = "tsserver"
//! version = "5.4.2"
//!
//! [diagnostics]
//! suggestions = false
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use tsbridge_types::ApiVersion;

/// Version assumed when none is configured: new enough for every capability.
pub const DEFAULT_API_VERSION: ApiVersion = ApiVersion::new(5, 0, 0);

const fn default_true() -> bool {
    true
}

const fn default_max_in_flight_async() -> usize {
    16
}

fn default_host_info() -> String {
    "tsbridge".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// UI locale passed to the server for its messages.
    pub locale: Option<String>,
    pub npm_location: Option<PathBuf>,
    #[serde(default)]
    pub typings: TypingsConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    /// Upper bound on async requests written but not yet completed.
    #[serde(default = "default_max_in_flight_async")]
    pub max_in_flight_async: usize,
    /// Identifies this client in the `configure` request.
    #[serde(default = "default_host_info")]
    pub host_info: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            plugins: PluginsConfig::default(),
            locale: None,
            npm_location: None,
            typings: TypingsConfig::default(),
            project: ProjectConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            restart: RestartConfig::default(),
            max_in_flight_async: default_max_in_flight_async(),
            host_info: default_host_info(),
        }
    }
}

fn default_command() -> String {
    "tsserver".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable, resolved on `PATH` (e.g. "tsserver").
    #[serde(default = "default_command")]
    pub command: String,
    /// Extra arguments appended after the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Version of the server being launched. Gates optional arguments and
    /// protocol features.
    pub version: Option<ApiVersion>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            version: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn api_version(&self) -> ApiVersion {
        self.version.unwrap_or(DEFAULT_API_VERSION)
    }
}

/// Server-side log verbosity.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LogVerbosity {
    #[default]
    Off,
    Terse,
    Normal,
    RequestTime,
    Verbose,
}

impl LogVerbosity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Terse => "terse",
            Self::Normal => "normal",
            Self::RequestTime => "requestTime",
            Self::Verbose => "verbose",
        }
    }
}

/// Server log file settings. The client's own logging goes through `tracing`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub verbosity: LogVerbosity,
    /// Directory for server log files. Default: the system temp directory.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginsConfig {
    /// Plugin names loaded into every project.
    #[serde(default)]
    pub global: Vec<String>,
    #[serde(default)]
    pub probe_locations: Vec<PathBuf>,
    /// Plugins named in `open` requests for documents of their languages.
    #[serde(default)]
    pub language: Vec<LanguagePlugin>,
}

impl PluginsConfig {
    /// Names of the language plugins that apply to `language_id`.
    #[must_use]
    pub fn for_language(&self, language_id: &str) -> Vec<String> {
        self.language
            .iter()
            .filter(|plugin| plugin.languages.iter().any(|l| l == language_id))
            .map(|plugin| plugin.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguagePlugin {
    pub name: String,
    /// Editor language identifiers, e.g. "typescriptreact".
    #[serde(default)]
    pub languages: Vec<String>,
}

const fn default_install_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingsConfig {
    #[serde(default)]
    pub disable_automatic_acquisition: bool,
    /// Seconds before an unanswered begin-install counts as finished.
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
}

impl Default for TypingsConfig {
    fn default() -> Self {
        Self {
            disable_automatic_acquisition: false,
            install_timeout_secs: default_install_timeout_secs(),
        }
    }
}

impl TypingsConfig {
    #[must_use]
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub single_inferred_project: bool,
    #[serde(default = "default_true")]
    pub inferred_project_per_project_root: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            single_inferred_project: false,
            inferred_project_per_project_root: true,
        }
    }
}

const fn default_republish_delay_ms() -> u64 {
    50
}

const fn default_min_delay_ms() -> u64 {
    300
}

const fn default_max_delay_ms() -> u64 {
    800
}

const fn default_lines_per_ms() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_true")]
    pub suggestions: bool,
    /// Debounce between a diagnostics event and the combined republish.
    #[serde(default = "default_republish_delay_ms")]
    pub republish_delay_ms: u64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Lines of text per millisecond of get-errors delay.
    #[serde(default = "default_lines_per_ms")]
    pub lines_per_ms: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            validate: true,
            suggestions: true,
            republish_delay_ms: default_republish_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            lines_per_ms: default_lines_per_ms(),
        }
    }
}

impl DiagnosticsConfig {
    #[must_use]
    pub fn republish_delay(&self) -> Duration {
        Duration::from_millis(self.republish_delay_ms)
    }

    /// Get-errors delay for a file of `line_count` lines:
    /// `clamp(ceil(lines / lines_per_ms), min, max)` milliseconds.
    #[must_use]
    pub fn get_err_delay(&self, line_count: usize) -> Duration {
        let per_ms = self.lines_per_ms.max(1);
        let raw = (line_count as u64).div_ceil(per_ms);
        let max = self.max_delay_ms.max(self.min_delay_ms);
        Duration::from_millis(raw.clamp(self.min_delay_ms, max))
    }
}

const fn default_max_restarts() -> u32 {
    5
}

const fn default_fatal_window_secs() -> u64 {
    10
}

const fn default_warning_window_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Crash-looping faster than this stops auto-restart.
    #[serde(default = "default_fatal_window_secs")]
    pub fatal_window_secs: u64,
    /// Crash-looping faster than this restarts with a warning.
    #[serde(default = "default_warning_window_secs")]
    pub warning_window_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            fatal_window_secs: default_fatal_window_secs(),
            warning_window_secs: default_warning_window_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.server.command, "tsserver");
        assert_eq!(config.server.api_version(), DEFAULT_API_VERSION);
        assert_eq!(config.max_in_flight_async, 16);
        assert!(config.diagnostics.validate);
        assert!(config.project.inferred_project_per_project_root);
        assert_eq!(config.typings.install_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart.max_restarts, 5);
        assert_eq!(config.logging.verbosity, LogVerbosity::Off);
    }

    #[test]
    fn test_partial_sections() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "server": {"version": "4.9.5-beta"},
            "logging": {"verbosity": "requestTime"},
            "diagnostics": {"suggestions": false}
        }))
        .unwrap();
        assert_eq!(config.server.api_version(), ApiVersion::new(4, 9, 5));
        assert_eq!(config.logging.verbosity.as_str(), "requestTime");
        assert!(!config.diagnostics.suggestions);
        assert!(config.diagnostics.validate);
        assert_eq!(config.diagnostics.republish_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_get_err_delay_formula() {
        let diagnostics = DiagnosticsConfig::default();
        let ms = |lines| diagnostics.get_err_delay(lines).as_millis();
        assert_eq!(ms(100), 300);
        assert_eq!(ms(6000), 300);
        assert_eq!(ms(12000), 600);
        assert_eq!(ms(12001), 601);
        assert_eq!(ms(20000), 800);
    }
}

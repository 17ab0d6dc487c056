//! Server process supervision: argument construction, launching, I/O tasks
//! and the restart policy.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use tsbridge_types::{Capability, CapabilitySet};

use crate::cancellation::pipe_argument;
use crate::channel::WriterCommand;
use crate::codec::{FrameReader, FrameWriter};
use crate::config::{ClientConfig, LogVerbosity, RestartConfig};

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

// ── Arguments ──────────────────────────────────────────────────────────

/// Where the server should write its log, if logging is on and supported.
#[must_use]
pub fn log_file_path(config: &ClientConfig, capabilities: CapabilitySet) -> Option<PathBuf> {
    if config.logging.verbosity == LogVerbosity::Off || !capabilities.has(Capability::LogFile) {
        return None;
    }
    let dir = config
        .logging
        .directory
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    Some(dir.join(format!("tsserver-{}.log", Uuid::new_v4().simple())))
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the server's argument vector.
///
/// Optional flags are gated on `capabilities`; `cancellation_pipe` and
/// `log_file` are passed only when the caller decided to use them.
#[must_use]
pub fn build_server_args(
    config: &ClientConfig,
    capabilities: CapabilitySet,
    cancellation_pipe: Option<&Path>,
    log_file: Option<&Path>,
) -> Vec<String> {
    let mut args = Vec::new();

    if config.project.single_inferred_project {
        args.push("--useSingleInferredProject".to_string());
    }
    if config.project.inferred_project_per_project_root
        && capabilities.has(Capability::InferredProjectPerProjectRoot)
    {
        args.push("--useInferredProjectPerProjectRoot".to_string());
    }
    if config.typings.disable_automatic_acquisition {
        args.push("--disableAutomaticTypingAcquisition".to_string());
    }
    if capabilities.has(Capability::Telemetry) {
        args.push("--enableTelemetry".to_string());
    }
    if let Some(pipe) = cancellation_pipe {
        args.push("--cancellationPipeName".to_string());
        args.push(pipe_argument(pipe));
    }
    if let Some(log_file) = log_file {
        args.push("--logVerbosity".to_string());
        args.push(config.logging.verbosity.as_str().to_string());
        args.push("--logFile".to_string());
        args.push(log_file.display().to_string());
    }
    if !config.plugins.global.is_empty() {
        args.push("--globalPlugins".to_string());
        args.push(config.plugins.global.join(","));
    }
    if !config.plugins.probe_locations.is_empty()
        && capabilities.has(Capability::PluginProbeLocations)
    {
        args.push("--pluginProbeLocations".to_string());
        args.push(join_paths(&config.plugins.probe_locations));
    }
    if let Some(npm) = &config.npm_location
        && capabilities.has(Capability::NpmLocation)
    {
        args.push("--npmLocation".to_string());
        args.push(npm.display().to_string());
    }
    if let Some(locale) = &config.locale
        && capabilities.has(Capability::Locale)
    {
        args.push("--locale".to_string());
        args.push(locale.clone());
    }
    if capabilities.has(Capability::NoGetErrOnBackgroundUpdate) {
        args.push("--noGetErrOnBackgroundUpdate".to_string());
    }
    if capabilities.has(Capability::ValidateDefaultNpmLocation) {
        args.push("--validateDefaultNpmLocation".to_string());
    }

    args.extend(config.server.args.iter().cloned());
    args
}

// ── Restart policy ─────────────────────────────────────────────────────

/// What to do after the server exits unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart without bothering the user.
    Restart,
    /// Restart, but tell the user the server keeps dying.
    RestartWithWarning,
    /// Stop restarting; the user should be told and offered to report it.
    GiveUp,
}

impl RestartDecision {
    /// Message to show the user, if any.
    #[must_use]
    pub fn user_message(self, max_restarts: u32) -> Option<String> {
        match self {
            Self::Restart => None,
            Self::RestartWithWarning => Some(format!(
                "The language service died unexpectedly {max_restarts} times in the last minutes."
            )),
            Self::GiveUp => Some(format!(
                "The language service died {max_restarts} times right after it got started. \
                 It will not be restarted."
            )),
        }
    }
}

/// An unexpected server exit and what the client did about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub reason: String,
    pub decision: RestartDecision,
    /// Text for the user; `None` when the restart should stay silent.
    pub message: Option<String>,
}

impl CrashReport {
    /// Whether the user should be offered to report an issue.
    #[must_use]
    pub fn offers_issue_report(&self) -> bool {
        self.decision == RestartDecision::GiveUp
    }
}

#[derive(Debug)]
pub(crate) struct RestartPolicy {
    max_restarts: u32,
    fatal_window: Duration,
    warning_window: Duration,
    restarts: u32,
    last_start: Option<Instant>,
}

impl RestartPolicy {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            fatal_window: Duration::from_secs(config.fatal_window_secs),
            warning_window: Duration::from_secs(config.warning_window_secs),
            restarts: 0,
            last_start: None,
        }
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// Record a start. `is_restart` counts toward the crash threshold.
    pub fn on_start(&mut self, now: Instant, is_restart: bool) {
        if is_restart {
            self.restarts += 1;
        }
        self.last_start = Some(now);
    }

    /// Decide how to react to an unexpected exit at `now`.
    ///
    /// Up to the threshold the answer is always a silent restart. Once the
    /// threshold is exceeded the counter resets and the time since the last
    /// start picks the escalation.
    pub fn on_unexpected_exit(&mut self, now: Instant) -> RestartDecision {
        if self.restarts <= self.max_restarts {
            return RestartDecision::Restart;
        }
        self.restarts = 0;
        let since_start = self
            .last_start
            .map_or(Duration::MAX, |start| now.saturating_duration_since(start));
        if since_start < self.fatal_window {
            RestartDecision::GiveUp
        } else if since_start < self.warning_window {
            RestartDecision::RestartWithWarning
        } else {
            RestartDecision::Restart
        }
    }
}

// ── Launching ──────────────────────────────────────────────────────────

/// The three byte streams of a launched server, plus the process if there
/// is one.
pub struct ServerConnection {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub child: Option<Child>,
}

/// Starts server instances.
pub trait ServerLauncher: Send + Sync {
    fn launch(&self, command: &str, args: &[String]) -> Result<ServerConnection>;
}

/// Launches the server as a child process on piped stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ServerLauncher for ProcessLauncher {
    fn launch(&self, command: &str, args: &[String]) -> Result<ServerConnection> {
        let resolved =
            which::which(command).with_context(|| format!("{command} not found in PATH"))?;
        let mut child = Command::new(&resolved)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {command}"))?;

        let stdin = child.stdin.take().context("no stdin from child")?;
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stderr = child.stderr.take();

        tracing::info!(command = %resolved.display(), pid = ?child.id(), "Spawned language server");
        Ok(ServerConnection {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            child: Some(child),
        })
    }
}

// ── I/O tasks ──────────────────────────────────────────────────────────

/// Traffic from an instance's I/O tasks, tagged with its generation so that
/// stragglers from a replaced instance can be ignored.
#[derive(Debug)]
pub(crate) enum IoMessage {
    Frame { generation: u64, frame: Value },
    Closed { generation: u64, reason: String },
}

/// A running server instance's process and I/O tasks.
pub(crate) struct ServerProcess {
    generation: u64,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Start the reader, writer and stderr tasks for `connection`.
    pub fn spawn(
        connection: ServerConnection,
        generation: u64,
        io_tx: mpsc::UnboundedSender<IoMessage>,
    ) -> (Self, mpsc::UnboundedSender<WriterCommand>) {
        let ServerConnection {
            stdin,
            stdout,
            stderr,
            child,
        } = connection;
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(generation, "Server write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        }));

        tasks.push(tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        if io_tx.send(IoMessage::Frame { generation, frame }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = io_tx.send(IoMessage::Closed {
                            generation,
                            reason: "server closed its output".to_string(),
                        });
                        break;
                    }
                    Err(e) => {
                        let _ = io_tx.send(IoMessage::Closed {
                            generation,
                            reason: format!("{e:#}"),
                        });
                        break;
                    }
                }
            }
        }));

        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(generation, "server stderr: {line}");
                }
            }));
        }

        (
            Self {
                generation,
                child,
                tasks,
            },
            writer_tx,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exit status, if the process has already exited.
    pub fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) | Err(_) => None,
        }
    }

    /// Wait briefly for the process to exit after its input was closed, then
    /// kill it.
    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            let waited =
                tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), child.wait())
                    .await;
            if waited.is_err() {
                tracing::debug!(generation = self.generation, "Server didn't exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsbridge_types::ApiVersion;

    fn caps(major: u32, minor: u32, patch: u32) -> CapabilitySet {
        CapabilitySet::for_version(ApiVersion::new(major, minor, patch))
    }

    // ── Arguments ──────────────────────────────────────────────────────

    #[test]
    fn test_modern_server_args() {
        let mut config = ClientConfig::default();
        config.plugins.global = vec!["a".to_string(), "b".to_string()];
        config.locale = Some("de".to_string());
        config.server.args = vec!["--extra".to_string()];

        let args = build_server_args(&config, caps(5, 0, 0), Some(Path::new("/tmp/p")), None);
        assert_eq!(
            args,
            vec![
                "--useInferredProjectPerProjectRoot",
                "--enableTelemetry",
                "--cancellationPipeName",
                "/tmp/p*",
                "--globalPlugins",
                "a,b",
                "--locale",
                "de",
                "--noGetErrOnBackgroundUpdate",
                "--validateDefaultNpmLocation",
                "--extra",
            ]
        );
    }

    #[test]
    fn test_old_server_gets_fewer_flags() {
        let mut config = ClientConfig::default();
        config.locale = Some("de".to_string());
        config.npm_location = Some(PathBuf::from("/usr/bin/npm"));
        let args = build_server_args(&config, caps(2, 2, 0), None, None);
        assert!(args.is_empty(), "unexpected args: {args:?}");
    }

    #[test]
    fn test_log_file_requires_verbosity_and_capability() {
        let mut config = ClientConfig::default();
        assert!(log_file_path(&config, caps(5, 0, 0)).is_none());

        config.logging.verbosity = LogVerbosity::Verbose;
        config.logging.directory = Some(PathBuf::from("/logs"));
        assert!(log_file_path(&config, caps(2, 1, 0)).is_none());

        let path = log_file_path(&config, caps(5, 0, 0)).unwrap();
        assert!(path.starts_with("/logs"));
        let args = build_server_args(&config, caps(5, 0, 0), None, Some(&path));
        let idx = args.iter().position(|a| a == "--logVerbosity").unwrap();
        assert_eq!(args[idx + 1], "verbose");
        assert_eq!(args[idx + 2], "--logFile");
    }

    // ── Restart policy ─────────────────────────────────────────────────

    fn crash_loop(policy: &mut RestartPolicy, start: Instant, gap: Duration) -> RestartDecision {
        let mut now = start;
        policy.on_start(now, false);
        loop {
            now += gap;
            let decision = policy.on_unexpected_exit(now);
            if decision != RestartDecision::Restart || policy.restarts == 0 {
                return decision;
            }
            policy.on_start(now, true);
        }
    }

    #[test]
    fn test_single_crash_restarts_silently() {
        let mut policy = RestartPolicy::new(&RestartConfig::default());
        let now = Instant::now();
        policy.on_start(now, false);
        assert_eq!(
            policy.on_unexpected_exit(now + Duration::from_secs(1)),
            RestartDecision::Restart
        );
    }

    #[test]
    fn test_escalates_only_past_max_restarts() {
        let mut policy = RestartPolicy::new(&RestartConfig::default());
        let mut now = Instant::now();
        policy.on_start(now, false);
        for _ in 0..=policy.max_restarts() {
            now += Duration::from_secs(1);
            assert_eq!(policy.on_unexpected_exit(now), RestartDecision::Restart);
            policy.on_start(now, true);
        }
        now += Duration::from_secs(1);
        assert_eq!(policy.on_unexpected_exit(now), RestartDecision::GiveUp);
    }

    #[test]
    fn test_rapid_crash_loop_gives_up() {
        let mut policy = RestartPolicy::new(&RestartConfig::default());
        let decision = crash_loop(&mut policy, Instant::now(), Duration::from_secs(1));
        assert_eq!(decision, RestartDecision::GiveUp);
        assert_eq!(policy.restarts, 0, "counter resets once the threshold is crossed");
    }

    #[test]
    fn test_slow_crash_loop_warns() {
        let mut policy = RestartPolicy::new(&RestartConfig::default());
        let decision = crash_loop(&mut policy, Instant::now(), Duration::from_secs(30));
        assert_eq!(decision, RestartDecision::RestartWithWarning);
    }

    #[test]
    fn test_very_slow_crash_loop_stays_silent() {
        let mut policy = RestartPolicy::new(&RestartConfig::default());
        let decision = crash_loop(&mut policy, Instant::now(), Duration::from_secs(120));
        assert_eq!(decision, RestartDecision::Restart);
        assert_eq!(policy.restarts, 0);
    }

    #[test]
    fn test_user_messages() {
        assert!(RestartDecision::Restart.user_message(5).is_none());
        assert!(
            RestartDecision::GiveUp
                .user_message(5)
                .unwrap()
                .contains("5 times")
        );
    }

    // ── I/O tasks ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_io_tasks_tag_frames_with_generation() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client_in, mut server_in) = tokio::io::duplex(1024);
        let (mut server_out, client_out) = tokio::io::duplex(1024);
        let (io_tx, mut io_rx) = mpsc::unbounded_channel();
        let connection = ServerConnection {
            stdin: Box::new(client_in),
            stdout: Box::new(client_out),
            stderr: None,
            child: None,
        };
        let (process, writer) = ServerProcess::spawn(connection, 3, io_tx);
        assert_eq!(process.generation(), 3);

        writer
            .send(WriterCommand::Send(serde_json::json!({"seq": 0})))
            .unwrap();
        let mut buf = [0u8; 11];
        server_in.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"{\"seq\":0}\r\n");

        let body = r#"{"type":"event","event":"x"}"#;
        server_out
            .write_all(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
            .await
            .unwrap();
        match io_rx.recv().await.unwrap() {
            IoMessage::Frame { generation, frame } => {
                assert_eq!(generation, 3);
                assert_eq!(frame["event"], "x");
            }
            IoMessage::Closed { reason, .. } => panic!("unexpected close: {reason}"),
        }

        drop(server_out);
        assert!(matches!(
            io_rx.recv().await.unwrap(),
            IoMessage::Closed { generation: 3, .. }
        ));
    }
}

//! [`TsClient`]: the handle callers use to talk to the language server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use tsbridge_types::{ApiVersion, Diagnostic, DiagnosticsSnapshot, TextEdit};

use crate::buffers::TextDocument;
use crate::config::ClientConfig;
use crate::errors::{DocumentError, RequestError};
use crate::protocol::Response;
use crate::queue::{Expectation, QueueingType};
use crate::state::{ClientState, LoopMessage, run};
use crate::supervisor::{CrashReport, ServerLauncher};
use crate::telemetry::TelemetrySink;

const EVENT_CAPACITY: usize = 256;

/// Notifications broadcast to [`TsClient::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ServerStarted {
        generation: u64,
        version: ApiVersion,
    },
    /// A restart could not launch the server.
    ServerStartFailed {
        message: String,
    },
    ServerCrashed(CrashReport),
    /// Combined diagnostics for one document. An empty list clears it.
    Diagnostics {
        uri: Url,
        diagnostics: Vec<Diagnostic>,
    },
    /// Diagnostics for a project config file, published as-is.
    ConfigFileDiagnostics {
        config_file: Url,
        trigger_file: Option<Url>,
        diagnostics: Vec<Diagnostic>,
    },
    /// A closed document's file no longer exists on disk.
    FileDeleted(Url),
    TypingsInstallStarted {
        event_id: u64,
        packages: Vec<String>,
    },
    TypingsInstallFinished {
        event_id: u64,
        packages: Vec<String>,
        success: bool,
        /// No end event arrived within the install timeout.
        timed_out: bool,
    },
    /// Sent at most once per client.
    TypesInstallerFailed {
        message: String,
    },
    ProjectLoadingStarted {
        project: String,
    },
    ProjectLoadingFinished {
        project: String,
    },
}

/// How [`TsClient::submit`] should treat a request.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Async requests do not hold up the one-sync-response throttle.
    pub is_async: bool,
    /// When `false` the request is fire-and-forget and resolves at once.
    pub expects_result: bool,
    pub queueing: QueueingType,
    pub token: Option<CancellationToken>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            is_async: false,
            expects_result: true,
            queueing: QueueingType::Normal,
            token: None,
        }
    }
}

impl SubmitOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn without_result(mut self) -> Self {
        self.expects_result = false;
        self
    }

    pub fn queueing(mut self, queueing: QueueingType) -> Self {
        self.queueing = queueing;
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    fn expectation(&self) -> Expectation {
        match (self.expects_result, self.is_async) {
            (false, _) => Expectation::NoResult,
            (true, true) => Expectation::Async,
            (true, false) => Expectation::Sync,
        }
    }
}

/// Cloneable handle to a running client loop.
///
/// The loop stops when [`TsClient::shutdown`] is called or the last handle
/// is dropped.
#[derive(Clone)]
pub struct TsClient {
    commands: mpsc::UnboundedSender<LoopMessage>,
    events: broadcast::Sender<ClientEvent>,
    tickets: Arc<AtomicU64>,
}

impl TsClient {
    /// Launch the server and spawn the client loop on the current runtime.
    ///
    /// Fails if the first launch fails; later crashes are handled by the
    /// restart policy.
    pub fn start(
        config: ClientConfig,
        launcher: Arc<dyn ServerLauncher>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut state = ClientState::new(config, launcher, telemetry, events.clone());
        state.start_instance(Instant::now(), false)?;

        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(state, rx));
        Ok(Self {
            commands,
            events,
            tickets: Arc::new(AtomicU64::new(1)),
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn send(&self, message: LoopMessage) -> Result<(), RequestError> {
        self.commands
            .send(message)
            .map_err(|_| RequestError::NotRunning)
    }

    async fn query<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> LoopMessage,
    ) -> Result<T, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(message(tx))?;
        rx.await.map_err(|_| RequestError::NotRunning)
    }

    /// Send a request and wait for its response.
    ///
    /// Cancelling `options.token` rejects the future at once with
    /// [`RequestError::Cancelled`]; the server is told on a best-effort basis.
    pub async fn submit(
        &self,
        command: &str,
        arguments: Option<Value>,
        options: SubmitOptions,
    ) -> Result<Response, RequestError> {
        if options.token.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(RequestError::Cancelled);
        }
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.send(LoopMessage::Submit {
            command: command.to_string(),
            arguments,
            expectation: options.expectation(),
            queueing: options.queueing,
            reply,
            ticket,
        })?;

        let outcome = match options.token {
            Some(token) => {
                tokio::select! {
                    biased;
                    outcome = rx => outcome,
                    () = token.cancelled() => {
                        // The loop keeps tracking the request until the server answers.
                        let _ = self.send(LoopMessage::Cancel { ticket });
                        return Err(RequestError::Cancelled);
                    }
                }
            }
            None => rx.await,
        };
        outcome.unwrap_or(Err(RequestError::NotRunning))
    }

    /// Fire-and-forget request.
    pub async fn notify(&self, command: &str, arguments: Option<Value>) -> Result<(), RequestError> {
        self.submit(command, arguments, SubmitOptions::new().without_result())
            .await
            .map(|_| ())
    }

    /// Start syncing `document` with the server.
    pub async fn open_document(&self, document: TextDocument) -> Result<(), DocumentError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(LoopMessage::Open { document, reply })
            .map_err(|_| DocumentError::NotRunning)?;
        rx.await.unwrap_or(Err(DocumentError::NotRunning))
    }

    /// Apply editor edits, in order, to a synced document.
    pub fn change_document(&self, uri: &Url, edits: Vec<TextEdit>) -> Result<(), RequestError> {
        self.send(LoopMessage::Change {
            uri: uri.clone(),
            edits,
        })
    }

    /// Stop syncing `uri`. A `file:` document whose file is gone is reported
    /// as deleted and triggers a full re-check.
    pub async fn close_document(&self, uri: &Url) -> Result<(), RequestError> {
        let exists = match uri.to_file_path() {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(true),
            Err(()) => true,
        };
        self.send(LoopMessage::Close {
            uri: uri.clone(),
            exists,
        })
    }

    /// Schedule diagnostics for the given documents. Returns how many of
    /// them are synced.
    pub async fn request_diagnostics(&self, uris: &[Url]) -> Result<usize, RequestError> {
        let uris = uris.to_vec();
        self.query(|reply| LoopMessage::RequestDiagnostics { uris, reply })
            .await
    }

    pub async fn diagnostics_for(&self, uri: &Url) -> Result<Vec<Diagnostic>, RequestError> {
        let uri = uri.clone();
        self.query(|reply| LoopMessage::DiagnosticsFor { uri, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<DiagnosticsSnapshot, RequestError> {
        self.query(|reply| LoopMessage::Snapshot { reply }).await
    }

    pub fn set_suggestions_enabled(&self, enabled: bool) -> Result<(), RequestError> {
        self.send(LoopMessage::SetSuggestions(enabled))
    }

    pub fn set_validation_enabled(&self, enabled: bool) -> Result<(), RequestError> {
        self.send(LoopMessage::SetValidation(enabled))
    }

    pub async fn is_acquiring_typings(&self) -> Result<bool, RequestError> {
        self.query(|reply| LoopMessage::IsAcquiringTypings { reply })
            .await
    }

    /// Restart the server on purpose, optionally switching to `version`.
    /// Outstanding requests fail with [`RequestError::ServiceDied`].
    pub async fn restart(&self, version: Option<ApiVersion>) -> Result<()> {
        self.query(|reply| LoopMessage::Restart { version, reply })
            .await?
    }

    /// Stop the server and the client loop. Outstanding requests fail with
    /// [`RequestError::NotRunning`].
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(LoopMessage::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

//! The client's event loop and the state it exclusively owns.
//!
//! Every component is a synchronous state machine; this module feeds them
//! caller messages, server traffic and elapsed deadlines, and turns their
//! outputs into writes and [`ClientEvent`]s.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use url::Url;

use tsbridge_types::{
    ApiVersion, Capability, CapabilitySet, Diagnostic, DiagnosticKind, DiagnosticsSnapshot,
    TextEdit,
};

use crate::buffers::{BufferCommand, BufferSyncEngine, TextDocument};
use crate::callbacks::{Reply, Responder};
use crate::cancellation::{CancellationBridge, generate_pipe_name};
use crate::channel::{CancelOutcome, ServerChannel};
use crate::client::ClientEvent;
use crate::config::ClientConfig;
use crate::diagnostics::{DiagnosticsAggregator, Publication};
use crate::errors::{DocumentError, RequestError};
use crate::events::{EventConsumer, TypingsEvent, dispatch};
use crate::protocol::{Incoming, configure_args, from_server_path, geterr_args, parse_incoming};
use crate::queue::{Expectation, QueueingType};
use crate::supervisor::{
    CrashReport, IoMessage, RestartDecision, RestartPolicy, ServerLauncher, ServerProcess,
    build_server_args, log_file_path,
};
use crate::telemetry::{TelemetrySink, forward};
use crate::typings::TypingsTracker;

/// Caller requests, sent from [`crate::TsClient`] handles to the loop.
pub(crate) enum LoopMessage {
    Submit {
        command: String,
        arguments: Option<Value>,
        expectation: Expectation,
        queueing: QueueingType,
        reply: Reply,
        ticket: u64,
    },
    Cancel {
        ticket: u64,
    },
    Open {
        document: TextDocument,
        reply: oneshot::Sender<Result<(), DocumentError>>,
    },
    Change {
        uri: Url,
        edits: Vec<TextEdit>,
    },
    Close {
        uri: Url,
        exists: bool,
    },
    RequestDiagnostics {
        uris: Vec<Url>,
        reply: oneshot::Sender<usize>,
    },
    DiagnosticsFor {
        uri: Url,
        reply: oneshot::Sender<Vec<Diagnostic>>,
    },
    Snapshot {
        reply: oneshot::Sender<DiagnosticsSnapshot>,
    },
    SetSuggestions(bool),
    SetValidation(bool),
    IsAcquiringTypings {
        reply: oneshot::Sender<bool>,
    },
    Restart {
        version: Option<ApiVersion>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// One running server: its request pipeline and its process.
struct Instance {
    channel: ServerChannel,
    process: ServerProcess,
    capabilities: CapabilitySet,
}

pub(crate) struct ClientState {
    config: ClientConfig,
    version: ApiVersion,
    launcher: Arc<dyn ServerLauncher>,
    telemetry: Arc<dyn TelemetrySink>,
    events: broadcast::Sender<ClientEvent>,
    io_tx: mpsc::UnboundedSender<IoMessage>,
    io_rx: mpsc::UnboundedReceiver<IoMessage>,
    instance: Option<Instance>,
    generation: u64,
    policy: RestartPolicy,
    buffers: BufferSyncEngine,
    diagnostics: DiagnosticsAggregator,
    typings: TypingsTracker,
}

impl ClientState {
    pub fn new(
        config: ClientConfig,
        launcher: Arc<dyn ServerLauncher>,
        telemetry: Arc<dyn TelemetrySink>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            version: config.server.api_version(),
            policy: RestartPolicy::new(&config.restart),
            buffers: BufferSyncEngine::new(config.diagnostics.clone(), config.plugins.clone()),
            diagnostics: DiagnosticsAggregator::new(
                config.diagnostics.republish_delay(),
                config.diagnostics.validate,
                config.diagnostics.suggestions,
            ),
            typings: TypingsTracker::new(config.typings.install_timeout()),
            config,
            launcher,
            telemetry,
            events,
            io_tx,
            io_rx,
            instance: None,
            generation: 0,
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish(&self, publications: Vec<Publication>) {
        for (uri, diagnostics) in publications {
            self.emit(ClientEvent::Diagnostics { uri, diagnostics });
        }
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::for_version(self.version)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Launch a new server instance and bring it up to date with every
    /// synced buffer.
    pub fn start_instance(&mut self, now: Instant, is_restart: bool) -> Result<()> {
        let capabilities = self.capabilities();
        let pipe = capabilities
            .has(Capability::CancellationPipe)
            .then(generate_pipe_name);
        let log_file = log_file_path(&self.config, capabilities);
        let args = build_server_args(&self.config, capabilities, pipe.as_deref(), log_file.as_deref());

        let connection = self.launcher.launch(&self.config.server.command, &args)?;
        self.generation += 1;
        let generation = self.generation;
        let (process, writer) = ServerProcess::spawn(connection, generation, self.io_tx.clone());
        let channel = ServerChannel::new(
            writer,
            CancellationBridge::new(pipe),
            self.config.max_in_flight_async,
        );
        self.instance = Some(Instance {
            channel,
            process,
            capabilities,
        });
        self.policy.on_start(now, is_restart);

        tracing::info!(generation, version = %self.version, ?log_file, "Language server started");

        let configure = configure_args(&self.config.host_info);
        if let Some(instance) = self.instance.as_mut() {
            instance.channel.submit(
                "configure",
                Some(configure),
                Expectation::NoResult,
                QueueingType::Fence,
                None,
                None,
                now,
            );
        }
        let reopen = self
            .buffers
            .reopen_all(capabilities.has(Capability::OpenProjectRootPath));
        self.run_buffer_commands(reopen, now);
        self.buffers.request_all_diagnostics(now);

        self.emit(ClientEvent::ServerStarted {
            generation,
            version: self.version,
        });
        Ok(())
    }

    /// Tear down the current instance, failing whatever it still owes.
    fn detach_instance(&mut self, cause: &RequestError) -> Option<ServerProcess> {
        let mut instance = self.instance.take()?;
        tracing::debug!(
            generation = instance.process.generation(),
            pending_sync = instance.channel.pending_sync_responses(),
            queued = instance.channel.queued(),
            "Detaching server instance"
        );
        instance.channel.detach(cause);
        self.buffers.reset_in_flight();
        self.typings.reset();
        Some(instance.process)
    }

    fn handle_exit(&mut self, reason: String, now: Instant) {
        let status = self
            .instance
            .as_mut()
            .and_then(|instance| instance.process.exit_status());
        let reason = match status {
            Some(status) => format!("{reason} ({status})"),
            None => reason,
        };
        tracing::warn!(generation = self.generation, %reason, "Language server exited unexpectedly");

        if let Some(process) = self.detach_instance(&RequestError::service_died(&reason)) {
            tokio::spawn(process.shutdown());
        }

        let decision = self.policy.on_unexpected_exit(now);
        let message = decision.user_message(self.policy.max_restarts());
        match decision {
            RestartDecision::GiveUp => tracing::error!("Language server keeps crashing; giving up"),
            RestartDecision::RestartWithWarning => tracing::warn!("Language server keeps crashing"),
            RestartDecision::Restart => {}
        }
        self.emit(ClientEvent::ServerCrashed(CrashReport {
            reason,
            decision,
            message,
        }));

        if decision != RestartDecision::GiveUp
            && let Err(e) = self.start_instance(now, true)
        {
            self.report_start_failure(&e);
        }
    }

    fn report_start_failure(&self, error: &anyhow::Error) {
        tracing::error!("Failed to start language server: {error:#}");
        self.emit(ClientEvent::ServerStartFailed {
            message: format!("{error:#}"),
        });
    }

    /// Deliberate restart, optionally against a different server version.
    fn restart(&mut self, version: Option<ApiVersion>, now: Instant) -> Result<()> {
        if let Some(version) = version {
            self.version = version;
        }
        if let Some(process) = self.detach_instance(&RequestError::service_died("server restarted")) {
            tokio::spawn(process.shutdown());
        }
        self.start_instance(now, false)
    }

    pub async fn shutdown(&mut self) {
        if let Some(process) = self.detach_instance(&RequestError::NotRunning) {
            process.shutdown().await;
        }
        tracing::info!("Language server client stopped");
    }

    // ── Inputs ─────────────────────────────────────────────────────────

    pub fn handle_io(&mut self, message: IoMessage, now: Instant) {
        match message {
            IoMessage::Frame { generation, frame } => {
                if !self.is_current(generation) {
                    tracing::trace!(generation, "Ignoring frame from a previous server");
                    return;
                }
                self.handle_frame(frame);
            }
            IoMessage::Closed { generation, reason } => {
                if !self.is_current(generation) {
                    return;
                }
                self.handle_exit(reason, now);
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.instance
            .as_ref()
            .is_some_and(|instance| instance.process.generation() == generation)
    }

    fn handle_frame(&mut self, frame: Value) {
        match parse_incoming(frame) {
            Ok(Incoming::Response(response)) => {
                let Some(instance) = self.instance.as_mut() else {
                    return;
                };
                if let Some(seq) = instance.channel.handle_response(response) {
                    self.buffers.get_err_finished(seq);
                }
            }
            Ok(Incoming::Event(event)) => dispatch(event, self),
            Err(violation) => {
                tracing::error!("Protocol violation from language server: {violation}");
            }
        }
    }

    pub fn handle_message(&mut self, message: LoopMessage, now: Instant) {
        match message {
            LoopMessage::Submit {
                command,
                arguments,
                expectation,
                queueing,
                reply,
                ticket,
            } => match self.instance.as_mut() {
                Some(instance) => {
                    instance.channel.submit(
                        &command,
                        arguments,
                        expectation,
                        queueing,
                        Some(Responder::Caller(reply)),
                        Some(ticket),
                        now,
                    );
                }
                None => {
                    let _ = reply.send(Err(RequestError::NotRunning));
                }
            },
            LoopMessage::Cancel { ticket } => {
                if let Some(instance) = self.instance.as_mut() {
                    let outcome = instance.channel.cancel_ticket(ticket);
                    tracing::debug!(ticket, ?outcome, "Cancel requested");
                }
            }
            LoopMessage::Open { document, reply } => {
                let capabilities = self
                    .instance
                    .as_ref()
                    .map_or_else(|| self.capabilities(), |instance| instance.capabilities);
                let with_root = capabilities.has(Capability::OpenProjectRootPath);
                let result = self
                    .buffers
                    .open(document, with_root, now)
                    .map(|commands| self.run_buffer_commands(commands, now));
                let _ = reply.send(result);
            }
            LoopMessage::Change { uri, edits } => {
                let commands = self.buffers.change(&uri, &edits, now);
                self.run_buffer_commands(commands, now);
            }
            LoopMessage::Close { uri, exists } => self.close(&uri, exists, now),
            LoopMessage::RequestDiagnostics { uris, reply } => {
                let _ = reply.send(self.buffers.request_diagnostics(&uris, now));
            }
            LoopMessage::DiagnosticsFor { uri, reply } => {
                let _ = reply.send(self.diagnostics.current_for(&uri));
            }
            LoopMessage::Snapshot { reply } => {
                let _ = reply.send(self.diagnostics.snapshot());
            }
            LoopMessage::SetSuggestions(enabled) => {
                let publications = self.diagnostics.set_suggestions_enabled(enabled);
                self.publish(publications);
            }
            LoopMessage::SetValidation(enabled) => {
                if let Some(seq) = self.buffers.set_validation_enabled(enabled, now)
                    && let Some(instance) = self.instance.as_mut()
                {
                    instance.channel.cancel_seq(seq);
                }
                let publications = self.diagnostics.set_validation_enabled(enabled);
                self.publish(publications);
            }
            LoopMessage::IsAcquiringTypings { reply } => {
                let _ = reply.send(self.typings.is_acquiring());
            }
            LoopMessage::Restart { version, reply } => {
                let result = self.restart(version, now);
                if let Err(e) = &result {
                    self.report_start_failure(e);
                }
                let _ = reply.send(result);
            }
            LoopMessage::Shutdown { .. } => {
                tracing::debug!("Shutdown is handled by the loop");
            }
        }
    }

    fn close(&mut self, uri: &Url, exists: bool, now: Instant) {
        let Some(closed) = self.buffers.close(uri, exists, now) else {
            tracing::debug!(%uri, "Close for unsynced document");
            return;
        };
        self.run_buffer_commands(closed.commands, now);
        self.diagnostics.delete(uri);
        self.emit(ClientEvent::Diagnostics {
            uri: uri.clone(),
            diagnostics: Vec::new(),
        });
        if closed.deleted {
            tracing::debug!(file = %closed.file, "Synced file was deleted");
            self.emit(ClientEvent::FileDeleted(uri.clone()));
        }
    }

    fn run_buffer_commands(&mut self, commands: Vec<BufferCommand>, now: Instant) {
        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        for command in commands {
            match command {
                BufferCommand::Notify { command, args } => {
                    instance.channel.submit(
                        command,
                        Some(args),
                        Expectation::NoResult,
                        QueueingType::Normal,
                        None,
                        None,
                        now,
                    );
                }
                BufferCommand::CancelGetErr(seq) => {
                    if instance.channel.cancel_seq(seq) == CancelOutcome::NotFound {
                        tracing::trace!(seq, "Superseded diagnostics request already finished");
                    }
                }
            }
        }
    }

    // ── Timers ─────────────────────────────────────────────────────────

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.diagnostics.next_deadline(),
            self.buffers.next_deadline(),
            self.typings.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run everything whose deadline has passed.
    pub fn tick(&mut self, now: Instant) {
        let publications = self.diagnostics.flush_due(now);
        self.publish(publications);

        if let Some(batch) = self.buffers.take_due_get_err(now)
            && let Some(instance) = self.instance.as_mut()
        {
            if let Some(old) = batch.supersedes {
                instance.channel.cancel_seq(old);
            }
            let seq = instance.channel.submit(
                "geterr",
                Some(geterr_args(&batch.files)),
                Expectation::Async,
                QueueingType::LowPriority,
                Some(Responder::GetErr),
                None,
                now,
            );
            tracing::debug!(seq, files = batch.files.len(), "Requested diagnostics");
            self.buffers.get_err_sent(seq, batch.files);
        }

        for event_id in self.typings.expire(now) {
            tracing::debug!(event_id, "Typings install timed out");
            self.emit(ClientEvent::TypingsInstallFinished {
                event_id,
                packages: Vec::new(),
                success: false,
                timed_out: true,
            });
        }
    }
}

impl EventConsumer for ClientState {
    fn on_diagnostics(&mut self, kind: DiagnosticKind, file: String, diagnostics: Vec<Diagnostic>) {
        let Some(uri) = self.buffers.resource_for_file(&file) else {
            tracing::debug!(%file, "Dropping diagnostics for unsynced file");
            return;
        };
        self.diagnostics.ingest(kind, uri, diagnostics, Instant::now());
    }

    fn on_config_file_diagnostics(
        &mut self,
        config_file: String,
        trigger_file: String,
        diagnostics: Vec<Diagnostic>,
    ) {
        let Some(config_uri) = from_server_path(&config_file) else {
            tracing::debug!(%config_file, "Config diagnostics for unmappable file");
            return;
        };
        self.emit(ClientEvent::ConfigFileDiagnostics {
            config_file: config_uri,
            trigger_file: self
                .buffers
                .resource_for_file(&trigger_file)
                .or_else(|| from_server_path(&trigger_file)),
            diagnostics,
        });
    }

    fn on_telemetry(&mut self, body: Value) {
        forward(self.telemetry.as_ref(), body);
    }

    fn on_projects_updated(&mut self, open_files: Vec<String>) {
        let scheduled = self
            .buffers
            .request_diagnostics_for_files(&open_files, Instant::now());
        tracing::debug!(scheduled, "Projects updated in background");
    }

    fn on_typings(&mut self, event: TypingsEvent) {
        match event {
            TypingsEvent::Begin { event_id, packages } => {
                self.typings.begin(event_id, Instant::now());
                self.emit(ClientEvent::TypingsInstallStarted { event_id, packages });
            }
            TypingsEvent::End {
                event_id,
                packages,
                success,
            } => {
                if !self.typings.end(event_id) {
                    tracing::debug!(event_id, "End of unknown typings install");
                }
                self.emit(ClientEvent::TypingsInstallFinished {
                    event_id,
                    packages,
                    success,
                    timed_out: false,
                });
            }
            TypingsEvent::InstallerFailed { message } => {
                if self.typings.report_installer_failure() {
                    tracing::warn!(%message, "Types installer failed to initialize");
                    self.emit(ClientEvent::TypesInstallerFailed { message });
                }
            }
        }
    }

    fn on_request_completed(&mut self, request_seq: u64) {
        let Some(instance) = self.instance.as_mut() else {
            return;
        };
        if let Some(seq) = instance.channel.handle_request_completed(request_seq) {
            self.buffers.get_err_finished(seq);
        }
    }

    fn on_project_loading(&mut self, project: String, finished: bool) {
        let supported = self
            .instance
            .as_ref()
            .is_some_and(|instance| instance.capabilities.has(Capability::ProjectLoadingEvents));
        if !supported {
            tracing::trace!(%project, "Ignoring project loading event");
            return;
        }
        let event = if finished {
            ClientEvent::ProjectLoadingFinished { project }
        } else {
            ClientEvent::ProjectLoadingStarted { project }
        };
        self.emit(event);
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drive `state` until shutdown or until every client handle is gone.
pub(crate) async fn run(mut state: ClientState, mut commands: mpsc::UnboundedReceiver<LoopMessage>) {
    loop {
        let deadline = state.next_deadline();
        tokio::select! {
            message = commands.recv() => match message {
                Some(LoopMessage::Shutdown { done }) => {
                    state.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Some(message) => state.handle_message(message, Instant::now()),
                None => {
                    state.shutdown().await;
                    return;
                }
            },
            Some(io) = state.io_rx.recv() => state.handle_io(io, Instant::now()),
            () = sleep_until_deadline(deadline) => state.tick(Instant::now()),
        }
    }
}

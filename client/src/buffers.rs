//! Buffer synchronization: mirrors open editor documents on the server and
//! schedules bulk "get errors" requests as they change.
//!
//! The engine is a plain state machine. It returns [`BufferCommand`]s for the
//! caller to submit and exposes a deadline for the event loop; it never
//! touches the server channel itself.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use tsbridge_types::{ScriptKind, TextEdit, apply_edit, line_count};

use crate::config::{DiagnosticsConfig, PluginsConfig};
use crate::delayer::Delayer;
use crate::errors::DocumentError;
use crate::protocol::{change_args, close_args, open_args, to_server_path};

/// An editor document as handed to [`crate::TsClient::open_document`].
#[derive(Debug, Clone)]
pub struct TextDocument {
    pub uri: Url,
    /// Editor language identifier, e.g. "typescript".
    pub language_id: String,
    pub version: i32,
    pub text: String,
    /// Root of the workspace folder holding the document, if any.
    pub project_root: Option<PathBuf>,
}

impl TextDocument {
    pub fn new(uri: Url, language_id: impl Into<String>, version: i32, text: impl Into<String>) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            version,
            text: text.into(),
            project_root: None,
        }
    }

    pub fn with_project_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.project_root = Some(root.into());
        self
    }
}

/// Work the caller must hand to the server channel.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BufferCommand {
    /// A fire-and-forget buffer request.
    Notify { command: &'static str, args: Value },
    /// Cancel a superseded bulk diagnostics request.
    CancelGetErr(u64),
}

/// A bulk diagnostics request that is ready to go out.
#[derive(Debug, PartialEq)]
pub(crate) struct GetErrBatch {
    pub files: Vec<String>,
    /// Still-running earlier request whose files were folded into this one.
    pub supersedes: Option<u64>,
}

/// Outcome of closing a synced buffer.
#[derive(Debug)]
pub(crate) struct Closed {
    pub commands: Vec<BufferCommand>,
    pub file: String,
    /// The file no longer exists on disk.
    pub deleted: bool,
}

#[derive(Debug)]
struct SyncedBuffer {
    resource: Url,
    file: String,
    version: i32,
    script_kind: ScriptKind,
    text: String,
    project_root: Option<PathBuf>,
    plugins: Vec<String>,
}

impl SyncedBuffer {
    fn open_command(&self, with_project_root: bool) -> BufferCommand {
        let root = if with_project_root {
            self.project_root.as_deref()
        } else {
            None
        };
        BufferCommand::Notify {
            command: "open",
            args: open_args(&self.file, &self.text, self.script_kind, root, &self.plugins),
        }
    }
}

#[derive(Debug)]
struct InFlightGetErr {
    seq: u64,
    files: Vec<String>,
}

pub(crate) struct BufferSyncEngine {
    buffers: HashMap<Url, SyncedBuffer>,
    by_file: HashMap<String, Url>,
    /// Files marked dirty since the last bulk request, in marking order.
    pending: Vec<String>,
    delayer: Delayer<()>,
    in_flight: Option<InFlightGetErr>,
    delays: DiagnosticsConfig,
    plugins: PluginsConfig,
    validation_enabled: bool,
}

impl BufferSyncEngine {
    pub fn new(delays: DiagnosticsConfig, plugins: PluginsConfig) -> Self {
        let validation_enabled = delays.validate;
        Self {
            buffers: HashMap::new(),
            by_file: HashMap::new(),
            pending: Vec::new(),
            delayer: Delayer::new(),
            in_flight: None,
            delays,
            plugins,
            validation_enabled,
        }
    }

    /// Register a document and return its `open` request.
    pub fn open(
        &mut self,
        document: TextDocument,
        with_project_root: bool,
        now: Instant,
    ) -> Result<Vec<BufferCommand>, DocumentError> {
        let script_kind = ScriptKind::from_language_id(&document.language_id)
            .ok_or_else(|| DocumentError::UnsupportedLanguage(document.language_id.clone()))?;
        let file = to_server_path(&document.uri)?;

        if self.buffers.contains_key(&document.uri) {
            tracing::debug!(uri = %document.uri, "Re-opening already synced document");
        }
        let buffer = SyncedBuffer {
            resource: document.uri.clone(),
            file: file.clone(),
            version: document.version,
            script_kind,
            plugins: self.plugins.for_language(&document.language_id),
            text: document.text,
            project_root: document.project_root,
        };
        let command = buffer.open_command(with_project_root);
        let lines = line_count(&buffer.text);
        self.by_file.insert(file.clone(), document.uri.clone());
        self.buffers.insert(document.uri, buffer);

        self.mark_pending(file);
        self.schedule(lines, now);
        Ok(vec![command])
    }

    /// Apply edits to a synced document and return one `change` request per
    /// edit. Edits to documents that are not synced are ignored.
    pub fn change(&mut self, resource: &Url, edits: &[TextEdit], now: Instant) -> Vec<BufferCommand> {
        let Some(buffer) = self.buffers.get_mut(resource) else {
            tracing::debug!(uri = %resource, "Ignoring edit to unsynced document");
            return Vec::new();
        };

        let mut commands = Vec::with_capacity(edits.len() + 1);
        for edit in edits {
            if let Err(e) = apply_edit(&mut buffer.text, edit) {
                tracing::warn!(uri = %resource, "Local copy out of step with edit: {e}");
            }
            commands.push(BufferCommand::Notify {
                command: "change",
                args: change_args(&buffer.file, edit),
            });
        }
        buffer.version += 1;
        let lines = line_count(&buffer.text);
        let file = buffer.file.clone();

        self.mark_pending(file);
        if let Some(in_flight) = self.in_flight.take() {
            for file in in_flight.files {
                self.mark_pending(file);
            }
            commands.push(BufferCommand::CancelGetErr(in_flight.seq));
        }
        self.schedule(lines, now);
        commands
    }

    /// Unregister a document. `exists` reports whether its file is still on
    /// disk; a deleted file triggers a full diagnostics re-scan.
    pub fn close(&mut self, resource: &Url, exists: bool, now: Instant) -> Option<Closed> {
        let buffer = self.buffers.remove(resource)?;
        self.by_file.remove(&buffer.file);
        self.pending.retain(|f| *f != buffer.file);
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.files.retain(|f| *f != buffer.file);
        }
        if self.pending.is_empty() {
            self.delayer.cancel();
        }

        let commands = vec![BufferCommand::Notify {
            command: "close",
            args: close_args(&buffer.file),
        }];
        let deleted = !exists;
        if deleted {
            self.request_all_diagnostics(now);
        }
        Some(Closed {
            commands,
            file: buffer.file,
            deleted,
        })
    }

    /// Schedule diagnostics for specific documents. Unsynced ones are skipped.
    pub fn request_diagnostics(&mut self, resources: &[Url], now: Instant) -> usize {
        let mut lines = 0;
        let mut files = Vec::new();
        for resource in resources {
            if let Some(buffer) = self.buffers.get(resource) {
                lines = lines.max(line_count(&buffer.text));
                files.push(buffer.file.clone());
            }
        }
        let count = files.len();
        if count == 0 {
            return 0;
        }
        for file in files {
            self.mark_pending(file);
        }
        self.schedule(lines, now);
        count
    }

    /// Schedule diagnostics for every synced document.
    pub fn request_all_diagnostics(&mut self, now: Instant) {
        let mut resources: Vec<Url> = self.buffers.keys().cloned().collect();
        resources.sort();
        self.request_diagnostics(&resources, now);
    }

    /// Schedule diagnostics for server paths named by the server itself.
    pub fn request_diagnostics_for_files(&mut self, files: &[String], now: Instant) -> usize {
        let resources: Vec<Url> = files
            .iter()
            .filter_map(|f| self.by_file.get(f).cloned())
            .collect();
        self.request_diagnostics(&resources, now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayer.deadline()
    }

    /// The bulk request to send, once the debounce window has elapsed.
    ///
    /// Covers every dirty file, every open file and any files of a still
    /// running earlier request.
    pub fn take_due_get_err(&mut self, now: Instant) -> Option<GetErrBatch> {
        self.delayer.take_due(now)?;
        let pending = std::mem::take(&mut self.pending);
        if !self.validation_enabled {
            return None;
        }

        let mut open: Vec<&String> = self.buffers.values().map(|b| &b.file).collect();
        open.sort();
        let superseded = self.in_flight.take();

        let mut seen = HashSet::new();
        let mut files = Vec::new();
        let candidates = pending
            .into_iter()
            .chain(open.into_iter().cloned())
            .chain(superseded.iter().flat_map(|g| g.files.iter().cloned()));
        for file in candidates {
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
        if files.is_empty() {
            return None;
        }
        Some(GetErrBatch {
            files,
            supersedes: superseded.map(|g| g.seq),
        })
    }

    pub fn get_err_sent(&mut self, seq: u64, files: Vec<String>) {
        self.in_flight = Some(InFlightGetErr { seq, files });
    }

    /// Bulk request `seq` finished (or was cancelled and answered).
    pub fn get_err_finished(&mut self, seq: u64) {
        if self.in_flight.as_ref().is_some_and(|g| g.seq == seq) {
            self.in_flight = None;
        }
    }

    /// The server instance went away along with any running request.
    pub fn reset_in_flight(&mut self) {
        self.in_flight = None;
    }

    /// Toggle validation. Returns a running bulk request to cancel when
    /// disabling; enabling schedules a full re-validation.
    pub fn set_validation_enabled(&mut self, enabled: bool, now: Instant) -> Option<u64> {
        if self.validation_enabled == enabled {
            return None;
        }
        self.validation_enabled = enabled;
        if enabled {
            self.request_all_diagnostics(now);
            None
        } else {
            self.delayer.cancel();
            self.pending.clear();
            self.in_flight.take().map(|g| g.seq)
        }
    }

    /// `open` requests for every synced document, used after a restart.
    pub fn reopen_all(&self, with_project_root: bool) -> Vec<BufferCommand> {
        let mut buffers: Vec<&SyncedBuffer> = self.buffers.values().collect();
        buffers.sort_by(|a, b| a.resource.cmp(&b.resource));
        buffers
            .into_iter()
            .map(|b| b.open_command(with_project_root))
            .collect()
    }

    /// The synced document behind a server path, if any.
    pub fn resource_for_file(&self, file: &str) -> Option<Url> {
        self.by_file.get(file).cloned()
    }

    #[cfg(test)]
    pub fn is_open(&self, resource: &Url) -> bool {
        self.buffers.contains_key(resource)
    }

    #[cfg(test)]
    pub fn version(&self, resource: &Url) -> Option<i32> {
        self.buffers.get(resource).map(|b| b.version)
    }

    #[cfg(test)]
    pub fn text(&self, resource: &Url) -> Option<&str> {
        self.buffers.get(resource).map(|b| b.text.as_str())
    }

    #[cfg(test)]
    pub fn open_files(&self) -> BTreeSet<String> {
        self.buffers.values().map(|b| b.file.clone()).collect()
    }

    fn mark_pending(&mut self, file: String) {
        if !self.pending.contains(&file) {
            self.pending.push(file);
        }
    }

    fn schedule(&mut self, line_count: usize, now: Instant) {
        if !self.validation_enabled {
            return;
        }
        let delay = self.delays.get_err_delay(line_count);
        self.delayer.trigger(now, delay, ());
    }
}

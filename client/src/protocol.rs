//! Wire message types and argument builders for the server protocol.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use tsbridge_types::{
    Diagnostic, DiagnosticKind, DiagnosticSeverity, DiagnosticTag, Location, ScriptKind, TextEdit,
    TextSpan,
};

use crate::errors::{PathError, ProtocolViolation};

/// Authority placeholder for in-memory resources that have none.
const NUL_AUTHORITY: &str = "ts-nul-authority";

/// Prefix the server uses for paths that do not exist on disk.
const IN_MEMORY_PREFIX: &str = "^/";

/// Source label attached to diagnostics that carry none.
const DEFAULT_DIAGNOSTIC_SOURCE: &str = "ts";

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            seq,
            kind: "request",
            command: command.into(),
            arguments,
        }
    }
}

/// A successful reply to a submitted request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_seq: u64,
    pub command: String,
    /// `None` for requests that carry no result.
    pub body: Option<Value>,
}

impl Response {
    pub(crate) fn empty(request_seq: u64, command: impl Into<String>) -> Self {
        Self {
            request_seq,
            command: command.into(),
            body: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawResponse {
    pub request_seq: u64,
    pub success: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEvent {
    pub event: String,
    #[serde(default)]
    pub body: Option<Value>,
}

/// Top-level incoming message, split by its `type` field.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response(RawResponse),
    Event(RawEvent),
}

/// Classify a decoded frame. An unknown `type` is a protocol violation.
pub(crate) fn parse_incoming(frame: Value) -> Result<Incoming, ProtocolViolation> {
    let kind = match frame.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolViolation::MissingType),
    };
    match kind.as_str() {
        "response" => serde_json::from_value(frame)
            .map(Incoming::Response)
            .map_err(|source| ProtocolViolation::Malformed {
                kind: "response",
                source,
            }),
        "event" => serde_json::from_value(frame)
            .map(Incoming::Event)
            .map_err(|source| ProtocolViolation::Malformed {
                kind: "event",
                source,
            }),
        _ => Err(ProtocolViolation::UnknownMessageType(kind)),
    }
}

/// Known server events, one variant per tag.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    Diagnostics {
        kind: DiagnosticKind,
        file: String,
        diagnostics: Vec<Diagnostic>,
    },
    ConfigFileDiagnostics {
        trigger_file: String,
        config_file: String,
        diagnostics: Vec<Diagnostic>,
    },
    /// Body is parsed by the telemetry forwarder so malformed payloads can be
    /// dropped there without failing the event.
    Telemetry(Value),
    ProjectsUpdatedInBackground {
        open_files: Vec<String>,
    },
    BeginInstallTypings {
        event_id: u64,
        packages: Vec<String>,
    },
    EndInstallTypings {
        event_id: u64,
        packages: Vec<String>,
        success: bool,
    },
    TypesInstallerInitializationFailed {
        message: String,
    },
    RequestCompleted {
        request_seq: u64,
    },
    ProjectLoadingStart {
        project: String,
    },
    ProjectLoadingFinish {
        project: String,
    },
    /// Events this client does not consume.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct WireLocation {
    line: u32,
    offset: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDiagnostic {
    #[serde(default)]
    start: Option<WireLocation>,
    #[serde(default)]
    end: Option<WireLocation>,
    text: String,
    #[serde(default)]
    code: Option<u32>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    source: Option<String>,
    // The server sends `{}` for set flags, so any non-null value counts.
    #[serde(default)]
    reports_unnecessary: Option<Value>,
    #[serde(default)]
    reports_deprecated: Option<Value>,
}

fn flag_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null | Value::Bool(false)))
}

impl WireDiagnostic {
    fn into_diagnostic(self) -> Diagnostic {
        let loc = |l: Option<WireLocation>| {
            l.map_or(Location::new(1, 1), |l| Location::new(l.line, l.offset))
        };
        let unnecessary = flag_set(self.reports_unnecessary.as_ref());
        let deprecated = flag_set(self.reports_deprecated.as_ref());

        let mut diag = Diagnostic::new(
            TextSpan::new(loc(self.start), loc(self.end)),
            self.text,
            self.category
                .as_deref()
                .and_then(DiagnosticSeverity::from_category)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.source
                .unwrap_or_else(|| DEFAULT_DIAGNOSTIC_SOURCE.to_string()),
        );
        if let Some(code) = self.code {
            diag = diag.with_code(code);
        }
        if unnecessary {
            diag = diag.with_tag(DiagnosticTag::Unnecessary);
        }
        if deprecated {
            diag = diag.with_tag(DiagnosticTag::Deprecated);
        }
        diag
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosticEventBody {
    file: String,
    #[serde(default)]
    diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFileDiagnosticBody {
    trigger_file: String,
    config_file: String,
    #[serde(default)]
    diagnostics: Vec<WireDiagnostic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectsUpdatedBody {
    #[serde(default)]
    open_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallTypingsBody {
    event_id: u64,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    install_success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InstallerFailedBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RequestCompletedBody {
    request_seq: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectLoadingBody {
    project_name: String,
}

fn body_of<T: for<'de> Deserialize<'de>>(body: Option<Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(body.unwrap_or(Value::Null))
}

fn convert(diagnostics: Vec<WireDiagnostic>) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .map(WireDiagnostic::into_diagnostic)
        .collect()
}

impl ServerEvent {
    /// Decode an event body by tag. Unknown tags become [`ServerEvent::Other`].
    pub(crate) fn parse(raw: RawEvent) -> Result<Self, serde_json::Error> {
        let kind = match raw.event.as_str() {
            "syntaxDiag" => Some(DiagnosticKind::Syntax),
            "semanticDiag" => Some(DiagnosticKind::Semantic),
            "suggestionDiag" => Some(DiagnosticKind::Suggestion),
            _ => None,
        };
        if let Some(kind) = kind {
            let body: DiagnosticEventBody = body_of(raw.body)?;
            return Ok(Self::Diagnostics {
                kind,
                file: body.file,
                diagnostics: convert(body.diagnostics),
            });
        }

        let event = match raw.event.as_str() {
            "configFileDiag" => {
                let body: ConfigFileDiagnosticBody = body_of(raw.body)?;
                Self::ConfigFileDiagnostics {
                    trigger_file: body.trigger_file,
                    config_file: body.config_file,
                    diagnostics: convert(body.diagnostics),
                }
            }
            "telemetry" => Self::Telemetry(raw.body.unwrap_or(Value::Null)),
            "projectsUpdatedInBackground" => {
                let body: ProjectsUpdatedBody = body_of(raw.body)?;
                Self::ProjectsUpdatedInBackground {
                    open_files: body.open_files,
                }
            }
            "beginInstallTypes" | "beginInstallTypings" => {
                let body: InstallTypingsBody = body_of(raw.body)?;
                Self::BeginInstallTypings {
                    event_id: body.event_id,
                    packages: body.packages,
                }
            }
            "endInstallTypes" | "endInstallTypings" => {
                let body: InstallTypingsBody = body_of(raw.body)?;
                Self::EndInstallTypings {
                    event_id: body.event_id,
                    packages: body.packages,
                    success: body.install_success.unwrap_or(false),
                }
            }
            "typesInstallerInitializationFailed" => {
                let body: InstallerFailedBody = body_of(raw.body)?;
                Self::TypesInstallerInitializationFailed {
                    message: body.message,
                }
            }
            "requestCompleted" => {
                let body: RequestCompletedBody = body_of(raw.body)?;
                Self::RequestCompleted {
                    request_seq: body.request_seq,
                }
            }
            "projectLoadingStart" => {
                let body: ProjectLoadingBody = body_of(raw.body)?;
                Self::ProjectLoadingStart {
                    project: body.project_name,
                }
            }
            "projectLoadingFinish" => {
                let body: ProjectLoadingBody = body_of(raw.body)?;
                Self::ProjectLoadingFinish {
                    project: body.project_name,
                }
            }
            _ => Self::Other(raw.event),
        };
        Ok(event)
    }
}

// ── Resource ↔ server path mapping ─────────────────────────────────────

/// Map a document resource to the path the server knows it by.
///
/// `file:` URLs become filesystem paths; any other scheme uses the server's
/// in-memory form `^/<scheme>/<authority>/<path>`.
pub(crate) fn to_server_path(resource: &Url) -> Result<String, PathError> {
    let err = || PathError {
        resource: resource.to_string(),
    };

    if resource.scheme() == "file" {
        let path = resource.to_file_path().map_err(|()| err())?;
        return path.to_str().map(ToString::to_string).ok_or_else(err);
    }

    let path = resource.path().trim_start_matches('/');
    if path.is_empty() {
        return Err(err());
    }
    let authority = match resource.host_str() {
        Some(host) if !host.is_empty() => host,
        _ => NUL_AUTHORITY,
    };
    Ok(format!(
        "{IN_MEMORY_PREFIX}{}/{authority}/{path}",
        resource.scheme()
    ))
}

/// Inverse of [`to_server_path`].
pub(crate) fn from_server_path(path: &str) -> Option<Url> {
    let Some(rest) = path.strip_prefix(IN_MEMORY_PREFIX) else {
        return Url::from_file_path(Path::new(path)).ok();
    };
    let (scheme, rest) = rest.split_once('/')?;
    let (authority, path) = rest.split_once('/')?;
    if authority == NUL_AUTHORITY {
        Url::parse(&format!("{scheme}:{path}")).ok()
    } else {
        Url::parse(&format!("{scheme}://{authority}/{path}")).ok()
    }
}

// ── Argument builders ──────────────────────────────────────────────────

pub(crate) fn configure_args(host_info: &str) -> Value {
    serde_json::json!({
        "hostInfo": host_info,
        "preferences": {
            "providePrefixAndSuffixTextForRename": true,
            "allowRenameOfImportPath": true
        }
    })
}

pub(crate) fn open_args(
    file: &str,
    text: &str,
    script_kind: ScriptKind,
    project_root: Option<&Path>,
    plugins: &[String],
) -> Value {
    let mut args = serde_json::json!({
        "file": file,
        "fileContent": text,
        "scriptKindName": script_kind.wire_name(),
    });
    if let Some(root) = project_root {
        args["projectRootPath"] = Value::String(root.display().to_string());
    }
    if !plugins.is_empty() {
        args["plugins"] = serde_json::json!(plugins);
    }
    args
}

/// One incremental change, 1-based like every server coordinate.
pub(crate) fn change_args(file: &str, edit: &TextEdit) -> Value {
    let start = edit.range.start.to_location();
    let end = edit.range.end.to_location();
    serde_json::json!({
        "file": file,
        "line": start.line,
        "offset": start.offset,
        "endLine": end.line,
        "endOffset": end.offset,
        "insertString": edit.text,
    })
}

pub(crate) fn close_args(file: &str) -> Value {
    serde_json::json!({ "file": file })
}

pub(crate) fn geterr_args(files: &[String]) -> Value {
    serde_json::json!({ "delay": 0, "files": files })
}

//! Routing of unsolicited server events to their consumers.

use serde_json::Value;

use tsbridge_types::{Diagnostic, DiagnosticKind};

use crate::protocol::{RawEvent, ServerEvent};

/// Typings-acquisition progress reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TypingsEvent {
    Begin { event_id: u64, packages: Vec<String> },
    End { event_id: u64, packages: Vec<String>, success: bool },
    InstallerFailed { message: String },
}

/// Receivers of routed events. Implemented by the client state; the
/// dispatcher itself keeps no state.
pub(crate) trait EventConsumer {
    fn on_diagnostics(&mut self, kind: DiagnosticKind, file: String, diagnostics: Vec<Diagnostic>);
    fn on_config_file_diagnostics(
        &mut self,
        config_file: String,
        trigger_file: String,
        diagnostics: Vec<Diagnostic>,
    );
    fn on_telemetry(&mut self, body: Value);
    fn on_projects_updated(&mut self, open_files: Vec<String>);
    fn on_typings(&mut self, event: TypingsEvent);
    fn on_request_completed(&mut self, request_seq: u64);
    fn on_project_loading(&mut self, project: String, finished: bool);
}

/// Decode `raw` and hand it to the matching consumer method.
///
/// A body that does not match its event tag is logged and dropped; it never
/// disturbs request handling.
pub(crate) fn dispatch(raw: RawEvent, consumer: &mut impl EventConsumer) {
    let name = raw.event.clone();
    let event = match ServerEvent::parse(raw) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(event = %name, "Dropping malformed event: {e}");
            return;
        }
    };

    match event {
        ServerEvent::Diagnostics {
            kind,
            file,
            diagnostics,
        } => consumer.on_diagnostics(kind, file, diagnostics),
        ServerEvent::ConfigFileDiagnostics {
            trigger_file,
            config_file,
            diagnostics,
        } => consumer.on_config_file_diagnostics(config_file, trigger_file, diagnostics),
        ServerEvent::Telemetry(body) => consumer.on_telemetry(body),
        ServerEvent::ProjectsUpdatedInBackground { open_files } => {
            consumer.on_projects_updated(open_files);
        }
        ServerEvent::BeginInstallTypings { event_id, packages } => {
            consumer.on_typings(TypingsEvent::Begin { event_id, packages });
        }
        ServerEvent::EndInstallTypings {
            event_id,
            packages,
            success,
        } => consumer.on_typings(TypingsEvent::End {
            event_id,
            packages,
            success,
        }),
        ServerEvent::TypesInstallerInitializationFailed { message } => {
            consumer.on_typings(TypingsEvent::InstallerFailed { message });
        }
        ServerEvent::RequestCompleted { request_seq } => consumer.on_request_completed(request_seq),
        ServerEvent::ProjectLoadingStart { project } => consumer.on_project_loading(project, false),
        ServerEvent::ProjectLoadingFinish { project } => consumer.on_project_loading(project, true),
        ServerEvent::Other(name) => {
            tracing::trace!(event = %name, "Ignoring server event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl EventConsumer for Recorder {
        fn on_diagnostics(&mut self, kind: DiagnosticKind, file: String, diagnostics: Vec<Diagnostic>) {
            self.calls
                .push(format!("{}:{file}:{}", kind.event_name(), diagnostics.len()));
        }

        fn on_config_file_diagnostics(&mut self, config_file: String, _: String, _: Vec<Diagnostic>) {
            self.calls.push(format!("config:{config_file}"));
        }

        fn on_telemetry(&mut self, body: Value) {
            self.calls.push(format!("telemetry:{}", body["telemetryEventName"]));
        }

        fn on_projects_updated(&mut self, open_files: Vec<String>) {
            self.calls.push(format!("projects:{}", open_files.join(",")));
        }

        fn on_typings(&mut self, event: TypingsEvent) {
            self.calls.push(format!("{event:?}"));
        }

        fn on_request_completed(&mut self, request_seq: u64) {
            self.calls.push(format!("completed:{request_seq}"));
        }

        fn on_project_loading(&mut self, project: String, finished: bool) {
            self.calls.push(format!("loading:{project}:{finished}"));
        }
    }

    fn raw(event: &str, body: Value) -> RawEvent {
        RawEvent {
            event: event.to_string(),
            body: Some(body),
        }
    }

    #[test]
    fn test_routes_each_kind() {
        let mut recorder = Recorder::default();
        dispatch(
            raw("syntaxDiag", serde_json::json!({"file": "/a.ts", "diagnostics": []})),
            &mut recorder,
        );
        dispatch(
            raw(
                "configFileDiag",
                serde_json::json!({"triggerFile": "/a.ts", "configFile": "/tsconfig.json", "diagnostics": []}),
            ),
            &mut recorder,
        );
        dispatch(
            raw("telemetry", serde_json::json!({"telemetryEventName": "projectInfo"})),
            &mut recorder,
        );
        dispatch(
            raw("projectsUpdatedInBackground", serde_json::json!({"openFiles": ["/a.ts", "/b.ts"]})),
            &mut recorder,
        );
        dispatch(raw("requestCompleted", serde_json::json!({"request_seq": 5})), &mut recorder);
        dispatch(
            raw("projectLoadingFinish", serde_json::json!({"projectName": "/tsconfig.json"})),
            &mut recorder,
        );
        assert_eq!(
            recorder.calls,
            vec![
                "syntaxDiag:/a.ts:0",
                "config:/tsconfig.json",
                "telemetry:\"projectInfo\"",
                "projects:/a.ts,/b.ts",
                "completed:5",
                "loading:/tsconfig.json:true",
            ]
        );
    }

    #[test]
    fn test_routes_typings_events() {
        let mut recorder = Recorder::default();
        dispatch(
            raw("beginInstallTypes", serde_json::json!({"eventId": 1, "packages": ["@types/node"]})),
            &mut recorder,
        );
        dispatch(
            raw("typesInstallerInitializationFailed", serde_json::json!({"message": "npm missing"})),
            &mut recorder,
        );
        assert_eq!(recorder.calls.len(), 2);
        assert!(recorder.calls[0].starts_with("Begin"));
        assert!(recorder.calls[1].contains("npm missing"));
    }

    #[test]
    fn test_unknown_and_malformed_events_are_dropped() {
        let mut recorder = Recorder::default();
        dispatch(raw("typingsInstallerPid", serde_json::json!({"pid": 7})), &mut recorder);
        dispatch(raw("semanticDiag", serde_json::json!({"nofile": true})), &mut recorder);
        assert!(recorder.calls.is_empty());
    }
}

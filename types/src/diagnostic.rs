//! Diagnostic types shared between the engine and its consumers.

use std::path::PathBuf;

use url::Url;

use crate::document::TextSpan;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from a tsserver diagnostic `category`.
    ///
    /// Returns `None` for unknown categories; the protocol boundary decides
    /// the fallback.
    #[must_use]
    pub fn from_category(category: &str) -> Option<Self> {
        match category {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "message" => Some(Self::Information),
            "suggestion" => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// Extra rendering hints attached by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticTag {
    /// Unused or unreachable code; rendered faded.
    Unnecessary,
    Deprecated,
}

/// Which diagnostics pass produced a set.
///
/// Each kind is delivered by its own server event and stored independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    Syntax,
    Semantic,
    Suggestion,
}

impl DiagnosticKind {
    pub const ALL: [Self; 3] = [Self::Syntax, Self::Semantic, Self::Suggestion];

    /// Name of the server event that carries this kind.
    #[must_use]
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Syntax => "syntaxDiag",
            Self::Semantic => "semanticDiag",
            Self::Suggestion => "suggestionDiag",
        }
    }
}

/// A single diagnostic reported by the analysis server.
///
/// Fields are private; the protocol boundary constructs these and consumers
/// read through accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    span: TextSpan,
    message: String,
    severity: DiagnosticSeverity,
    code: Option<u32>,
    /// Resolved at the boundary, e.g. "ts" or a plugin name.
    source: String,
    tags: Vec<DiagnosticTag>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        span: TextSpan,
        message: impl Into<String>,
        severity: DiagnosticSeverity,
        source: impl Into<String>,
    ) -> Self {
        Self {
            span,
            message: message.into(),
            severity,
            code: None,
            source: source.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_tag(mut self, tag: DiagnosticTag) -> Self {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    #[must_use]
    pub fn span(&self) -> TextSpan {
        self.span
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn code(&self) -> Option<u32> {
        self.code
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn tags(&self) -> &[DiagnosticTag] {
        &self.tags
    }

    #[must_use]
    pub fn has_tag(&self, tag: DiagnosticTag) -> bool {
        self.tags.contains(&tag)
    }

    /// Format as `path:line:offset: severity: [source] TScode: message`.
    ///
    /// Span coordinates are already 1-based.
    #[must_use]
    pub fn display_with_path(&self, path: &std::path::Path) -> String {
        let code = self
            .code
            .map(|c| format!("TS{c}: "))
            .unwrap_or_default();
        format!(
            "{}:{}:{}: {}: [{}] {code}{}",
            path.display(),
            self.span.start.line,
            self.span.start.offset,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Immutable snapshot of combined diagnostics, suitable for display.
///
/// Counts are computed from `files` rather than cached alongside it.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-resource diagnostics, sorted with error-containing resources first.
    files: Vec<(Url, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    /// Build a snapshot, sorting error-containing resources first and then by URL.
    #[must_use]
    pub fn new(mut files: Vec<(Url, Vec<Diagnostic>)>) -> Self {
        files.retain(|(_, items)| !items.is_empty());
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors
                .cmp(&a_has_errors)
                .then_with(|| a.0.as_str().cmp(b.0.as_str()))
        });
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(Url, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Paths of `file:` resources in this snapshot.
    #[must_use]
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|(url, _)| url.to_file_path().ok())
            .collect()
    }

    /// Compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Location;

    fn span(line: u32) -> TextSpan {
        TextSpan::new(Location::new(line, 1), Location::new(line, 5))
    }

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(span(1), msg, severity, "ts")
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    // ── DiagnosticSeverity ─────────────────────────────────────────────

    #[test]
    fn test_from_category_known_values() {
        assert_eq!(
            DiagnosticSeverity::from_category("error"),
            Some(DiagnosticSeverity::Error)
        );
        assert_eq!(
            DiagnosticSeverity::from_category("warning"),
            Some(DiagnosticSeverity::Warning)
        );
        assert_eq!(
            DiagnosticSeverity::from_category("message"),
            Some(DiagnosticSeverity::Information)
        );
        assert_eq!(
            DiagnosticSeverity::from_category("suggestion"),
            Some(DiagnosticSeverity::Hint)
        );
    }

    #[test]
    fn test_from_category_unknown_returns_none() {
        assert_eq!(DiagnosticSeverity::from_category("fatal"), None);
        assert_eq!(DiagnosticSeverity::from_category(""), None);
    }

    // ── Diagnostic ─────────────────────────────────────────────────────

    #[test]
    fn test_with_tag_is_idempotent() {
        let diag = make_diag(DiagnosticSeverity::Hint, "unused")
            .with_tag(DiagnosticTag::Unnecessary)
            .with_tag(DiagnosticTag::Unnecessary);
        assert_eq!(diag.tags(), &[DiagnosticTag::Unnecessary]);
        assert!(diag.has_tag(DiagnosticTag::Unnecessary));
        assert!(!diag.has_tag(DiagnosticTag::Deprecated));
    }

    #[test]
    fn test_display_with_path() {
        let diag = Diagnostic::new(
            TextSpan::new(Location::new(11, 6), Location::new(11, 9)),
            "Cannot find name 'x'.",
            DiagnosticSeverity::Error,
            "ts",
        )
        .with_code(2304);
        assert_eq!(
            diag.display_with_path(std::path::Path::new("src/main.ts")),
            "src/main.ts:11:6: error: [ts] TS2304: Cannot find name 'x'."
        );
    }

    #[test]
    fn test_display_without_code() {
        let diag = make_diag(DiagnosticSeverity::Warning, "unused variable");
        assert_eq!(
            diag.display_with_path(std::path::Path::new("lib.ts")),
            "lib.ts:1:1: warning: [ts] unused variable"
        );
    }

    // ── DiagnosticsSnapshot ────────────────────────────────────────────

    #[test]
    fn test_snapshot_default_is_empty() {
        let snap = DiagnosticsSnapshot::default();
        assert!(snap.is_empty());
        assert_eq!(snap.total_count(), 0);
        assert_eq!(snap.status_string(), "");
    }

    #[test]
    fn test_snapshot_sorts_errors_first_and_drops_empty() {
        let snap = DiagnosticsSnapshot::new(vec![
            (
                url("/w/b.ts"),
                vec![make_diag(DiagnosticSeverity::Warning, "w")],
            ),
            (url("/w/c.ts"), vec![]),
            (
                url("/w/z.ts"),
                vec![make_diag(DiagnosticSeverity::Error, "e")],
            ),
        ]);
        assert_eq!(snap.files().len(), 2);
        assert_eq!(snap.files()[0].0, url("/w/z.ts"));
        assert_eq!(snap.files()[1].0, url("/w/b.ts"));
        assert_eq!(snap.status_string(), "E:1 W:1");
    }

    #[test]
    fn test_snapshot_file_paths_skip_non_file_urls() {
        let snap = DiagnosticsSnapshot::new(vec![
            (
                Url::parse("untitled:Untitled-1").unwrap(),
                vec![make_diag(DiagnosticSeverity::Error, "e")],
            ),
            (
                url("/w/a.ts"),
                vec![make_diag(DiagnosticSeverity::Error, "e")],
            ),
        ]);
        assert_eq!(snap.file_paths(), vec![PathBuf::from("/w/a.ts")]);
    }
}

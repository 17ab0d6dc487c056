//! Diagnostics aggregator: per-file, per-kind diagnostic sets merged into one
//! published view per file.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use tsbridge_types::{Diagnostic, DiagnosticKind, DiagnosticTag, DiagnosticsSnapshot};

#[derive(Debug, Default)]
struct FileDiagnostics {
    syntax: Vec<Diagnostic>,
    semantic: Vec<Diagnostic>,
    suggestion: Vec<Diagnostic>,
}

impl FileDiagnostics {
    fn kind_mut(&mut self, kind: DiagnosticKind) -> &mut Vec<Diagnostic> {
        match kind {
            DiagnosticKind::Syntax => &mut self.syntax,
            DiagnosticKind::Semantic => &mut self.semantic,
            DiagnosticKind::Suggestion => &mut self.suggestion,
        }
    }

    fn combined(&self, suggestions_enabled: bool) -> Vec<Diagnostic> {
        let suggestions = self
            .suggestion
            .iter()
            .filter(|d| suggestions_enabled || d.has_tag(DiagnosticTag::Unnecessary));
        self.syntax
            .iter()
            .chain(&self.semantic)
            .chain(suggestions)
            .cloned()
            .collect()
    }
}

/// Combined view of one file, ready to publish.
pub(crate) type Publication = (Url, Vec<Diagnostic>);

pub(crate) struct DiagnosticsAggregator {
    files: HashMap<Url, FileDiagnostics>,
    /// Files with a republish scheduled, and when it is due. The first ingest
    /// after a publish sets the deadline; later ingests ride along with it.
    scheduled: HashMap<Url, Instant>,
    republish_delay: Duration,
    suggestions_enabled: bool,
    validation_enabled: bool,
}

impl DiagnosticsAggregator {
    pub fn new(republish_delay: Duration, validation_enabled: bool, suggestions_enabled: bool) -> Self {
        Self {
            files: HashMap::new(),
            scheduled: HashMap::new(),
            republish_delay,
            suggestions_enabled,
            validation_enabled,
        }
    }

    /// Replace the `kind` set for `resource`. Returns whether a republish was
    /// scheduled.
    pub fn ingest(
        &mut self,
        kind: DiagnosticKind,
        resource: Url,
        diagnostics: Vec<Diagnostic>,
        now: Instant,
    ) -> bool {
        let entry = self.files.entry(resource.clone()).or_default();
        let slot = entry.kind_mut(kind);
        if slot.is_empty() && diagnostics.is_empty() {
            return false;
        }
        *slot = diagnostics;
        self.scheduled
            .entry(resource)
            .or_insert(now + self.republish_delay);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.values().min().copied()
    }

    /// Combined views for every file whose republish is due.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Publication> {
        let mut due: Vec<Url> = self
            .scheduled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(url, _)| url.clone())
            .collect();
        due.sort();
        for url in &due {
            self.scheduled.remove(url);
        }
        due.into_iter()
            .map(|url| {
                let current = self.current_for(&url);
                (url, current)
            })
            .collect()
    }

    /// Syntax, then semantic, then filtered suggestion diagnostics.
    pub fn current_for(&self, resource: &Url) -> Vec<Diagnostic> {
        if !self.validation_enabled {
            return Vec::new();
        }
        self.files
            .get(resource)
            .map(|f| f.combined(self.suggestions_enabled))
            .unwrap_or_default()
    }

    /// Toggle suggestion diagnostics. Every file is republished at once when
    /// the setting actually changes.
    pub fn set_suggestions_enabled(&mut self, enabled: bool) -> Vec<Publication> {
        if self.suggestions_enabled == enabled {
            return Vec::new();
        }
        self.suggestions_enabled = enabled;
        self.publish_all()
    }

    /// Toggle validation. Disabling clears every file's view and returns the
    /// now-empty publications; enabling returns nothing, since the caller is
    /// expected to re-validate.
    pub fn set_validation_enabled(&mut self, enabled: bool) -> Vec<Publication> {
        if self.validation_enabled == enabled {
            return Vec::new();
        }
        self.validation_enabled = enabled;
        if enabled {
            return Vec::new();
        }
        self.scheduled.clear();
        let mut cleared: Vec<Url> = self.files.drain().map(|(url, _)| url).collect();
        cleared.sort();
        cleared.into_iter().map(|url| (url, Vec::new())).collect()
    }

    /// Forget `resource` entirely. Returns whether anything was stored for it.
    pub fn delete(&mut self, resource: &Url) -> bool {
        self.scheduled.remove(resource);
        self.files.remove(resource).is_some()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let files = self
            .files
            .keys()
            .map(|url| (url.clone(), self.current_for(url)))
            .collect();
        DiagnosticsSnapshot::new(files)
    }

    fn publish_all(&mut self) -> Vec<Publication> {
        self.scheduled.clear();
        let mut urls: Vec<Url> = self.files.keys().cloned().collect();
        urls.sort();
        urls.into_iter()
            .map(|url| {
                let current = self.current_for(&url);
                (url, current)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsbridge_types::{DiagnosticSeverity, Location, TextSpan};

    const DELAY: Duration = Duration::from_millis(50);

    fn diag(message: &str, severity: DiagnosticSeverity) -> Diagnostic {
        Diagnostic::new(
            TextSpan::new(Location::new(1, 1), Location::new(1, 2)),
            message,
            severity,
            "ts",
        )
    }

    fn url(name: &str) -> Url {
        Url::parse(&format!("file:///w/{name}")).unwrap()
    }

    fn messages(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(Diagnostic::message).collect()
    }

    fn aggregator() -> DiagnosticsAggregator {
        DiagnosticsAggregator::new(DELAY, true, false)
    }

    // ── Merge rule ─────────────────────────────────────────────────────

    #[test]
    fn test_merge_keeps_unnecessary_suggestion_when_disabled() {
        let mut agg = aggregator();
        let now = Instant::now();
        let f = url("a.ts");
        agg.ingest(DiagnosticKind::Syntax, f.clone(), vec![diag("d1", DiagnosticSeverity::Error)], now);
        agg.ingest(DiagnosticKind::Semantic, f.clone(), vec![diag("d2", DiagnosticSeverity::Error)], now);
        agg.ingest(
            DiagnosticKind::Suggestion,
            f.clone(),
            vec![diag("d3", DiagnosticSeverity::Hint).with_tag(DiagnosticTag::Unnecessary)],
            now,
        );
        assert_eq!(messages(&agg.current_for(&f)), vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_merge_drops_untagged_suggestion_when_disabled() {
        let mut agg = aggregator();
        let now = Instant::now();
        let f = url("a.ts");
        agg.ingest(DiagnosticKind::Syntax, f.clone(), vec![diag("d1", DiagnosticSeverity::Error)], now);
        agg.ingest(DiagnosticKind::Semantic, f.clone(), vec![diag("d2", DiagnosticSeverity::Error)], now);
        agg.ingest(DiagnosticKind::Suggestion, f.clone(), vec![diag("d3", DiagnosticSeverity::Hint)], now);
        assert_eq!(messages(&agg.current_for(&f)), vec!["d1", "d2"]);

        let republished = agg.set_suggestions_enabled(true);
        assert_eq!(republished.len(), 1);
        assert_eq!(messages(&republished[0].1), vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn test_ingest_replaces_wholesale() {
        let mut agg = aggregator();
        let now = Instant::now();
        let f = url("a.ts");
        agg.ingest(DiagnosticKind::Semantic, f.clone(), vec![diag("d2", DiagnosticSeverity::Error)], now);
        agg.ingest(DiagnosticKind::Semantic, f.clone(), vec![], now);
        assert!(agg.current_for(&f).is_empty());
    }

    #[test]
    fn test_empty_over_empty_is_noop() {
        let mut agg = aggregator();
        let now = Instant::now();
        assert!(!agg.ingest(DiagnosticKind::Syntax, url("a.ts"), vec![], now));
        assert!(agg.next_deadline().is_none());
    }

    // ── Republish scheduling ───────────────────────────────────────────

    #[test]
    fn test_republish_is_coalesced_per_file() {
        let mut agg = aggregator();
        let now = Instant::now();
        let f = url("a.ts");
        agg.ingest(DiagnosticKind::Syntax, f.clone(), vec![diag("s", DiagnosticSeverity::Error)], now);
        agg.ingest(
            DiagnosticKind::Semantic,
            f.clone(),
            vec![diag("m", DiagnosticSeverity::Warning)],
            now + Duration::from_millis(30),
        );
        assert_eq!(agg.next_deadline(), Some(now + DELAY));
        assert!(agg.flush_due(now + Duration::from_millis(49)).is_empty());

        let published = agg.flush_due(now + DELAY);
        assert_eq!(published.len(), 1);
        assert_eq!(messages(&published[0].1), vec!["s", "m"]);
        assert!(agg.next_deadline().is_none());
    }

    #[test]
    fn test_flush_only_due_files() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.ingest(DiagnosticKind::Syntax, url("a.ts"), vec![diag("a", DiagnosticSeverity::Error)], now);
        let later = now + Duration::from_millis(40);
        agg.ingest(DiagnosticKind::Syntax, url("b.ts"), vec![diag("b", DiagnosticSeverity::Error)], later);

        let published = agg.flush_due(now + DELAY);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, url("a.ts"));
        assert_eq!(agg.next_deadline(), Some(later + DELAY));
    }

    // ── Toggles and deletion ───────────────────────────────────────────

    #[test]
    fn test_disabling_validation_clears_every_file() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.ingest(DiagnosticKind::Syntax, url("a.ts"), vec![diag("a", DiagnosticSeverity::Error)], now);
        agg.ingest(DiagnosticKind::Syntax, url("b.ts"), vec![diag("b", DiagnosticSeverity::Error)], now);

        let cleared = agg.set_validation_enabled(false);
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|(_, d)| d.is_empty()));
        assert!(agg.current_for(&url("a.ts")).is_empty());
        assert!(agg.snapshot().is_empty());
        assert!(agg.next_deadline().is_none());

        assert!(agg.set_validation_enabled(true).is_empty());
        assert!(agg.validation_enabled);
    }

    #[test]
    fn test_unchanged_toggle_is_silent() {
        let mut agg = aggregator();
        assert!(agg.set_suggestions_enabled(false).is_empty());
        assert!(agg.set_validation_enabled(true).is_empty());
    }

    #[test]
    fn test_delete_forgets_file() {
        let mut agg = aggregator();
        let now = Instant::now();
        let f = url("a.ts");
        agg.ingest(DiagnosticKind::Syntax, f.clone(), vec![diag("a", DiagnosticSeverity::Error)], now);
        assert!(agg.delete(&f));
        assert!(agg.current_for(&f).is_empty());
        assert!(agg.next_deadline().is_none());
        assert!(!agg.delete(&f));
    }

    #[test]
    fn test_snapshot_counts() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.ingest(DiagnosticKind::Semantic, url("b.ts"), vec![diag("w", DiagnosticSeverity::Warning)], now);
        agg.ingest(DiagnosticKind::Semantic, url("a.ts"), vec![diag("e", DiagnosticSeverity::Error)], now);
        let snap = agg.snapshot();
        assert_eq!(snap.error_count(), 1);
        assert_eq!(snap.warning_count(), 1);
        assert_eq!(snap.files()[0].0, url("a.ts"));
    }
}

//! Core domain types for tsbridge.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. The client crate and the CLI both build on it.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod diagnostic;
mod document;
mod version;

pub use diagnostic::{
    Diagnostic, DiagnosticKind, DiagnosticSeverity, DiagnosticTag, DiagnosticsSnapshot,
};
pub use document::{
    EditError, Location, Position, Range, ScriptKind, TextEdit, TextSpan, apply_edit, line_count,
};
pub use version::{ApiVersion, Capability, CapabilitySet, VersionParseError};

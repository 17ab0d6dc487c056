//! Document coordinates, edits and script kinds.
//!
//! Editors address text with 0-based lines and UTF-16 columns ([`Position`]);
//! the server uses 1-based lines and offsets ([`Location`]). Conversion
//! happens in exactly one place, [`Position::to_location`].

use thiserror::Error;

/// 0-based editor position; `character` counts UTF-16 code units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }

    /// Convert to the server's 1-based coordinates.
    #[must_use]
    pub const fn to_location(self) -> Location {
        Location {
            line: self.line + 1,
            offset: self.character + 1,
        }
    }
}

/// Half-open editor range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// 1-based server location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub line: u32,
    pub offset: u32,
}

impl Location {
    #[must_use]
    pub const fn new(line: u32, offset: u32) -> Self {
        Self { line, offset }
    }
}

/// Span in server coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextSpan {
    pub start: Location,
    pub end: Location,
}

impl TextSpan {
    #[must_use]
    pub const fn new(start: Location, end: Location) -> Self {
        Self { start, end }
    }
}

/// A single incremental edit: replace `range` with `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub range: Range,
    pub text: String,
}

impl TextEdit {
    #[must_use]
    pub fn new(range: Range, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("line {line} is past the end of the document ({line_count} lines)")]
    LineOutOfRange { line: u32, line_count: usize },
    #[error("edit range end precedes its start")]
    InvertedRange,
}

/// Number of lines in `text`; an empty document has one line.
#[must_use]
pub fn line_count(text: &str) -> usize {
    text.bytes().filter(|&b| b == b'\n').count() + 1
}

/// Byte offset of an editor position. Columns past the end of a line clamp
/// to the line end.
fn byte_offset(text: &str, pos: Position) -> Result<usize, EditError> {
    let mut line_start = 0usize;
    for _ in 0..pos.line {
        match text[line_start..].find('\n') {
            Some(nl) => line_start += nl + 1,
            None => {
                return Err(EditError::LineOutOfRange {
                    line: pos.line,
                    line_count: line_count(text),
                });
            }
        }
    }

    let line_end = text[line_start..]
        .find('\n')
        .map_or(text.len(), |nl| line_start + nl);

    let mut units = 0u32;
    for (idx, ch) in text[line_start..line_end].char_indices() {
        if units >= pos.character {
            return Ok(line_start + idx);
        }
        units += ch.len_utf16() as u32;
    }
    Ok(line_end)
}

/// Apply one edit to `text` in place.
pub fn apply_edit(text: &mut String, edit: &TextEdit) -> Result<(), EditError> {
    if edit.range.end < edit.range.start {
        return Err(EditError::InvertedRange);
    }
    let start = byte_offset(text, edit.range.start)?;
    let end = byte_offset(text, edit.range.end)?;
    text.replace_range(start..end, &edit.text);
    Ok(())
}

/// The server's classification of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Ts,
    Tsx,
    Js,
    Jsx,
}

impl ScriptKind {
    /// Map an editor language identifier to a script kind.
    ///
    /// Returns `None` for languages the server does not analyze.
    #[must_use]
    pub fn from_language_id(language_id: &str) -> Option<Self> {
        match language_id {
            "typescript" => Some(Self::Ts),
            "typescriptreact" => Some(Self::Tsx),
            "javascript" => Some(Self::Js),
            "javascriptreact" => Some(Self::Jsx),
            _ => None,
        }
    }

    /// The `scriptKindName` value the server expects.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Ts => "TS",
            Self::Tsx => "TSX",
            Self::Js => "JS",
            Self::Jsx => "JSX",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextEdit {
        TextEdit::new(Range::new(Position::new(sl, sc), Position::new(el, ec)), text)
    }

    #[test]
    fn test_position_to_location_is_one_based() {
        assert_eq!(Position::new(0, 0).to_location(), Location::new(1, 1));
        assert_eq!(Position::new(9, 4).to_location(), Location::new(10, 5));
    }

    #[test]
    fn test_line_count() {
        assert_eq!(line_count(""), 1);
        assert_eq!(line_count("a"), 1);
        assert_eq!(line_count("a\nb"), 2);
        assert_eq!(line_count("a\nb\n"), 3);
    }

    #[test]
    fn test_apply_insert() {
        let mut text = String::from("let x = 1;\nlet y = 2;");
        apply_edit(&mut text, &edit(1, 4, 1, 5, "z")).unwrap();
        assert_eq!(text, "let x = 1;\nlet z = 2;");
    }

    #[test]
    fn test_apply_multiline_replace() {
        let mut text = String::from("a\nb\nc");
        apply_edit(&mut text, &edit(0, 1, 2, 0, "")).unwrap();
        assert_eq!(text, "ac");
        assert_eq!(line_count(&text), 1);
    }

    #[test]
    fn test_apply_uses_utf16_columns() {
        // "😀" is two UTF-16 code units and four UTF-8 bytes.
        let mut text = String::from("😀x");
        apply_edit(&mut text, &edit(0, 2, 0, 3, "y")).unwrap();
        assert_eq!(text, "😀y");
    }

    #[test]
    fn test_apply_clamps_column_past_line_end() {
        let mut text = String::from("ab\ncd");
        apply_edit(&mut text, &edit(0, 10, 0, 10, "!")).unwrap();
        assert_eq!(text, "ab!\ncd");
    }

    #[test]
    fn test_apply_line_out_of_range() {
        let mut text = String::from("one line");
        let err = apply_edit(&mut text, &edit(3, 0, 3, 0, "x")).unwrap_err();
        assert_eq!(
            err,
            EditError::LineOutOfRange {
                line: 3,
                line_count: 1
            }
        );
    }

    #[test]
    fn test_apply_inverted_range() {
        let mut text = String::from("abc");
        assert_eq!(
            apply_edit(&mut text, &edit(0, 2, 0, 1, "")),
            Err(EditError::InvertedRange)
        );
    }

    #[test]
    fn test_script_kind_from_language_id() {
        assert_eq!(ScriptKind::from_language_id("typescript"), Some(ScriptKind::Ts));
        assert_eq!(
            ScriptKind::from_language_id("typescriptreact"),
            Some(ScriptKind::Tsx)
        );
        assert_eq!(ScriptKind::from_language_id("javascript"), Some(ScriptKind::Js));
        assert_eq!(
            ScriptKind::from_language_id("javascriptreact"),
            Some(ScriptKind::Jsx)
        );
        assert_eq!(ScriptKind::from_language_id("rust"), None);
        assert_eq!(ScriptKind::Tsx.wire_name(), "TSX");
    }
}

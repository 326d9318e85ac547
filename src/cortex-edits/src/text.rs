//! Line/column to byte-offset mapping.

use crate::model::{Position, Span};

/// Byte offsets of line starts in a text. Lines are separated by `\n`; a
/// trailing `\r` stays part of its line.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(i, _)| i + 1),
        );
        Self { text, line_starts }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    fn line_bounds(&self, line: usize) -> Option<(usize, usize)> {
        let start = *self.line_starts.get(line)?;
        let end = match self.line_starts.get(line + 1) {
            Some(next) => next - 1,
            None => self.text.len(),
        };
        Some((start, end))
    }

    /// Byte offset of a position, or a description of why it is out of range.
    pub fn offset(&self, pos: Position) -> Result<usize, String> {
        let (start, end) = self.line_bounds(pos.line).ok_or_else(|| {
            format!(
                "line {} does not exist (text has {} lines)",
                pos.line,
                self.line_count()
            )
        })?;
        let line = &self.text[start..end];
        let mut chars = 0;
        for (i, _) in line.char_indices() {
            if chars == pos.column {
                return Ok(start + i);
            }
            chars += 1;
        }
        if chars == pos.column {
            return Ok(end);
        }
        Err(format!(
            "column {} is past the end of line {} ({} chars)",
            pos.column, pos.line, chars
        ))
    }

    /// Byte range covered by a span.
    pub fn range(&self, span: &Span) -> Result<std::ops::Range<usize>, String> {
        let start = self.offset(span.start)?;
        let end = self.offset(span.end)?;
        Ok(start..end)
    }

    /// Position of a byte offset. Offsets inside a multi-byte char resolve to
    /// that char.
    pub fn position(&self, offset: usize) -> Position {
        let offset = offset.min(self.text.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line];
        let column = self.text[start..]
            .char_indices()
            .take_while(|(i, _)| start + i < offset)
            .count();
        Position::new(line, column)
    }
}

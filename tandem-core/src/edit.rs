//! Translating editor events into changesets.
//!
//! Editors report a change as a position, the text that was removed there
//! and the text typed in its place. Positions come either as an absolute
//! character offset or as a zero-based (line, column) pair; both are
//! resolved against the current local view before building the changeset.

use crate::changeset::{ChangeSet, ChangeSetError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("line {line} is past the end of the document ({lines} lines)")]
    LineOutOfRange { line: usize, lines: usize },
    #[error("column {column} is past the end of line {line} ({len} characters)")]
    ColumnOutOfRange { line: usize, column: usize, len: usize },
    #[error("edit at {offset} removing {removed} characters exceeds document length {len}")]
    RangeOutOfBounds { offset: usize, removed: usize, len: usize },
    #[error("removed text {expected:?} does not match document text {actual:?}")]
    RemovedTextMismatch { expected: String, actual: String },
    #[error(transparent)]
    Splice(#[from] ChangeSetError),
}

/// Where an edit starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPosition {
    Offset(usize),
    LineColumn { line: usize, column: usize },
}

/// A single change reported by an editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub position: EditPosition,
    /// Text the editor removed, exactly as it appeared in the document
    pub removed: String,
    /// Text the editor inserted in its place
    pub inserted: String,
}

impl EditEvent {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            position: EditPosition::Offset(offset),
            removed: String::new(),
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, removed: impl Into<String>) -> Self {
        Self {
            position: EditPosition::Offset(offset),
            removed: removed.into(),
            inserted: String::new(),
        }
    }

    pub fn replace(offset: usize, removed: impl Into<String>, inserted: impl Into<String>) -> Self {
        Self {
            position: EditPosition::Offset(offset),
            removed: removed.into(),
            inserted: inserted.into(),
        }
    }

    /// An event in the shape line-oriented editors emit: removed and
    /// inserted text as arrays of lines, joined with `\n`.
    pub fn from_lines<S: AsRef<str>>(
        line: usize,
        column: usize,
        removed: &[S],
        inserted: &[S],
    ) -> Self {
        let join = |lines: &[S]| {
            lines
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join("\n")
        };
        Self {
            position: EditPosition::LineColumn { line, column },
            removed: join(removed),
            inserted: join(inserted),
        }
    }

    /// Absolute character offset of the edit within `text`.
    pub fn resolve_offset(&self, text: &str) -> Result<usize, EditError> {
        match self.position {
            EditPosition::Offset(offset) => Ok(offset),
            EditPosition::LineColumn { line, column } => line_column_offset(text, line, column),
        }
    }

    /// The changeset performing this edit on `text`.
    ///
    /// Fails when the position is outside the document or when `removed`
    /// is not the text actually found at that position.
    pub fn to_changeset(&self, text: &str) -> Result<ChangeSet, EditError> {
        let offset = self.resolve_offset(text)?;
        let len = text.chars().count();
        let removed = self.removed.chars().count();

        if offset.checked_add(removed).map_or(true, |end| end > len) {
            return Err(EditError::RangeOutOfBounds {
                offset,
                removed,
                len,
            });
        }

        let actual: String = text.chars().skip(offset).take(removed).collect();
        if actual != self.removed {
            return Err(EditError::RemovedTextMismatch {
                expected: self.removed.clone(),
                actual,
            });
        }

        Ok(ChangeSet::splice(len, offset, removed, &self.inserted)?)
    }
}

fn line_column_offset(text: &str, line: usize, column: usize) -> Result<usize, EditError> {
    let mut offset = 0;
    let mut lines = 0;
    for (index, content) in text.split('\n').enumerate() {
        lines += 1;
        let len = content.chars().count();
        if index == line {
            if column > len {
                return Err(EditError::ColumnOutOfRange { line, column, len });
            }
            return Ok(offset + column);
        }
        offset += len + 1;
    }
    Err(EditError::LineOutOfRange { line, lines })
}

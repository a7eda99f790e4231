//! TextBuffer: the editable-text capability wrapped by `SyncedDocument`.
//!
//! `LoroBuffer` is the base in-memory realization. The text lives in a Loro
//! `LoroText` container so replacements can be applied as line-based diffs
//! instead of wholesale rewrites.

use crate::events::{EventBus, Subscription};
use loro::{LoroDoc, LoroText, UpdateOptions};
use std::sync::Arc;
use thiserror::Error;

/// Above this many lines (in either the current or the incoming text),
/// `set_text_via_diff` replaces the text wholesale.
pub const DIFF_LINE_LIMIT: usize = 10_000;

const TEXT_CONTAINER: &str = "text";

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Loro error: {0}")]
    Loro(String),
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// Notification emitted after the buffer text changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChange {
    /// True when the whole text was replaced instead of diffed.
    pub full_replace: bool,
}

/// Editable text with change notifications.
pub trait TextBuffer: Send {
    /// Current text.
    fn text(&self) -> String;

    /// Number of lines (an empty text has one line).
    fn line_count(&self) -> usize {
        count_lines(&self.text())
    }

    /// Replace the whole text. Returns false if the text was already equal.
    fn set_text(&mut self, text: &str) -> Result<bool>;

    /// Replace the text by applying a line-level diff, falling back to a full
    /// replace for texts above `DIFF_LINE_LIMIT` lines.
    fn set_text_via_diff(&mut self, text: &str) -> Result<bool>;

    /// Subscribe to text changes.
    fn subscribe(&self, callback: Box<dyn Fn(TextChange) + Send + Sync>) -> Subscription;
}

/// Count lines the way an editor does: one more than the number of newlines.
pub fn count_lines(text: &str) -> usize {
    text.bytes().filter(|&b| b == b'\n').count() + 1
}

/// Loro-backed `TextBuffer`.
pub struct LoroBuffer {
    doc: LoroDoc,
    changes: Arc<EventBus<TextChange>>,
}

impl LoroBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            changes: Arc::new(EventBus::new()),
        }
    }

    /// Create a buffer holding `text`.
    pub fn with_text(text: &str) -> Result<Self> {
        let buffer = Self::new();
        if !text.is_empty() {
            buffer
                .body()
                .insert(0, text)
                .map_err(|e| BufferError::Loro(e.to_string()))?;
            buffer.doc.commit();
        }
        Ok(buffer)
    }

    fn body(&self) -> LoroText {
        self.doc.get_text(TEXT_CONTAINER)
    }

    fn replace_all(&self, text: &str) -> Result<()> {
        let body = self.body();
        let len = body.len_unicode();
        if len > 0 {
            body.delete(0, len)
                .map_err(|e| BufferError::Loro(e.to_string()))?;
        }
        if !text.is_empty() {
            body.insert(0, text)
                .map_err(|e| BufferError::Loro(e.to_string()))?;
        }
        self.doc.commit();
        Ok(())
    }
}

impl Default for LoroBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextBuffer for LoroBuffer {
    fn text(&self) -> String {
        self.body().to_string()
    }

    fn set_text(&mut self, text: &str) -> Result<bool> {
        if self.text() == text {
            return Ok(false);
        }
        self.replace_all(text)?;
        self.changes.emit(TextChange { full_replace: true });
        Ok(true)
    }

    fn set_text_via_diff(&mut self, text: &str) -> Result<bool> {
        let current = self.text();
        if current == text {
            return Ok(false);
        }

        let full_replace =
            count_lines(&current) > DIFF_LINE_LIMIT || count_lines(text) > DIFF_LINE_LIMIT;
        if full_replace {
            self.replace_all(text)?;
        } else {
            self.body()
                .update_by_line(text, UpdateOptions::default())
                .map_err(|e| BufferError::Loro(format!("{:?}", e)))?;
            self.doc.commit();
        }

        self.changes.emit(TextChange { full_replace });
        Ok(true)
    }

    fn subscribe(&self, callback: Box<dyn Fn(TextChange) + Send + Sync>) -> Subscription {
        self.changes.subscribe(callback)
    }
}

//! Tag recognition.
//!
//! Every stream starts with a 16-byte pseudo-random tag. The receiver keeps
//! a table of the tags it expects next from each contact on each transport
//! and looks the leading bytes of an inbound stream up in it. A recognised
//! tag is removed from the table, so a replayed stream is never accepted
//! twice.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::{KeyManager, StreamContext};
use crate::core::{DbError, StreamError, TransportId, TAG_LENGTH};
use crate::crypto::Tag;

/// Outcome of looking up a tag.
#[derive(Debug)]
pub enum TagRecognition {
    /// The tag belongs to a known contact (or pending contact).
    Recognized(StreamContext),
    /// No key material produced this tag.
    Unrecognized,
}

impl TagRecognition {
    /// The context, if recognised.
    pub fn into_context(self) -> Option<StreamContext> {
        match self {
            TagRecognition::Recognized(ctx) => Some(ctx),
            TagRecognition::Unrecognized => None,
        }
    }
}

/// Sliding window over the stream numbers of one incoming rotation period.
///
/// Stream numbers below the window have either been seen or skipped. Marking
/// a number seen slides the window so that number sits in the lower half
/// and the lowest number in the window is unseen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderingWindow {
    base: u64,
    seen: VecDeque<bool>,
}

impl ReorderingWindow {
    /// Create a window of `size` stream numbers starting at zero.
    pub fn new(size: u64) -> Self {
        let size = size.max(1) as usize;
        Self {
            base: 0,
            seen: std::iter::repeat(false).take(size).collect(),
        }
    }

    /// Lowest stream number in the window.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of stream numbers in the window.
    pub fn size(&self) -> u64 {
        self.seen.len() as u64
    }

    /// Stream numbers in the window that have not been seen.
    pub fn unseen(&self) -> impl Iterator<Item = u64> + '_ {
        self.seen
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(move |(i, _)| self.base + i as u64)
    }

    /// Mark `stream_number` seen. Returns false if it is outside the window
    /// or was already seen.
    pub fn mark_seen(&mut self, stream_number: u64) -> bool {
        if stream_number < self.base || stream_number >= self.base + self.size() {
            return false;
        }
        let index = (stream_number - self.base) as usize;
        if self.seen[index] {
            return false;
        }
        self.seen[index] = true;

        let half = self.size() / 2;
        while stream_number >= self.base + half || self.seen.front() == Some(&true) {
            self.slide();
        }
        true
    }

    fn slide(&mut self) {
        self.seen.pop_front();
        self.seen.push_back(false);
        self.base += 1;
    }
}

/// Reads stream tags and resolves them through the key manager.
#[derive(Clone)]
pub struct TagRecognizer {
    keys: Arc<KeyManager>,
}

impl TagRecognizer {
    /// Create a recognizer backed by `keys`.
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Read exactly one tag from the start of an inbound stream.
    pub async fn read_tag<R>(reader: &mut R) -> Result<Tag, StreamError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut tag = [0u8; TAG_LENGTH];
        reader.read_exact(&mut tag).await?;
        Ok(tag)
    }

    /// Resolve a tag that arrived on `transport`.
    pub fn recognise(&self, transport: &TransportId, tag: &Tag) -> Result<TagRecognition, DbError> {
        self.keys.recognise_tag(transport, tag)
    }

    /// Read a tag from `reader` and resolve it.
    pub async fn recognise_stream<R>(
        &self,
        transport: &TransportId,
        reader: &mut R,
    ) -> Result<TagRecognition, RecognitionError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tag = Self::read_tag(reader).await?;
        let recognition = self.recognise(transport, &tag)?;
        if matches!(recognition, TagRecognition::Unrecognized) {
            debug!(transport = %transport, "unrecognised tag");
        }
        Ok(recognition)
    }
}

/// Failure to read or look up a tag.
#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    /// Reading the tag failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// The key lookup failed.
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_in_order() {
        let mut w = ReorderingWindow::new(8);
        assert!(w.mark_seen(0));
        assert!(w.mark_seen(1));
        assert_eq!(w.base(), 2);
        assert_eq!(w.unseen().collect::<Vec<_>>(), (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_window_rejects_replay() {
        let mut w = ReorderingWindow::new(8);
        assert!(w.mark_seen(2));
        assert!(!w.mark_seen(2));
        assert!(w.mark_seen(0));
        assert!(!w.mark_seen(0));
    }

    #[test]
    fn test_window_out_of_order_keeps_gap() {
        let mut w = ReorderingWindow::new(8);
        assert!(w.mark_seen(1));
        // 0 is still expected
        assert_eq!(w.base(), 0);
        assert!(w.unseen().any(|n| n == 0));
        assert!(!w.unseen().any(|n| n == 1));
        assert!(w.mark_seen(0));
        assert_eq!(w.base(), 2);
    }

    #[test]
    fn test_window_slides_past_skipped_streams() {
        let mut w = ReorderingWindow::new(8);
        // Streams 0..6 were allocated by the peer but never arrived
        assert!(w.mark_seen(6));
        // 6 sits in the lower half, so the window moved and 0..3 were dropped
        assert_eq!(w.base(), 3);
        assert!(!w.mark_seen(0));
        assert!(w.mark_seen(3));
    }

    #[test]
    fn test_window_bounds() {
        let mut w = ReorderingWindow::new(4);
        assert!(!w.mark_seen(4));
        assert_eq!(w.size(), 4);
    }
}

//! Splitting oversized text into ordered segments and reassembling them.
//!
//! Every split method is pure and deterministic: the same text and chunk size
//! always yield the same segments, and concatenating the segment contents in
//! order reproduces the input exactly. Orders are dense, `0..n`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SegmentationMethod;

/// Characters per token used by the built-in estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token estimate for a text: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// An ordered chunk of a larger payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position of this chunk in the original payload.
    pub order: usize,
    pub content: String,
}

impl Segment {
    pub fn new(order: usize, content: impl Into<String>) -> Self {
        Self {
            order,
            content: content.into(),
        }
    }
}

/// Segmentation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Segment order {order} is out of range for {count} segments")]
    OrderOutOfRange { order: usize, count: usize },

    #[error("Duplicate segment order {0}")]
    DuplicateOrder(usize),

    #[error("Missing segment order {0}")]
    MissingOrder(usize),
}

/// Splits text into segments using one [`SegmentationMethod`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Segmenter {
    method: SegmentationMethod,
}

impl Segmenter {
    pub fn new(method: SegmentationMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> SegmentationMethod {
        self.method
    }

    /// Split `text` into segments of at most `chunk_size_tokens` estimated tokens.
    ///
    /// Empty text yields no segments. A chunk size of zero is treated as one.
    pub fn split(&self, text: &str, chunk_size_tokens: usize) -> Vec<Segment> {
        if text.is_empty() {
            return Vec::new();
        }
        let window = chunk_size_tokens.max(1) * CHARS_PER_TOKEN;
        let pieces = match self.method {
            SegmentationMethod::Simple => fixed_windows(text, window),
            SegmentationMethod::Semantic => semantic(text, window),
            SegmentationMethod::Recursive => recursive(text, window, RECURSIVE_SEPARATORS),
        };
        pieces
            .into_iter()
            .enumerate()
            .map(|(order, piece)| Segment::new(order, piece))
            .collect()
    }
}

/// Reassemble processed segments strictly by order.
///
/// Outputs are placed into a pre-sized slot array first, so the result does
/// not depend on the order in which segments were produced.
pub fn merge(segments: Vec<Segment>, separator: &str) -> Result<String, SegmentError> {
    let count = segments.len();
    let mut slots: Vec<Option<String>> = vec![None; count];

    for segment in segments {
        let slot = slots
            .get_mut(segment.order)
            .ok_or(SegmentError::OrderOutOfRange {
                order: segment.order,
                count,
            })?;
        if slot.is_some() {
            return Err(SegmentError::DuplicateOrder(segment.order));
        }
        *slot = Some(segment.content);
    }

    let mut parts = Vec::with_capacity(count);
    for (order, slot) in slots.into_iter().enumerate() {
        parts.push(slot.ok_or(SegmentError::MissingOrder(order))?);
    }
    Ok(parts.join(separator))
}

const RECURSIVE_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Cut `text` every `window` characters, respecting UTF-8 boundaries.
fn fixed_windows(text: &str, window: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == window {
            pieces.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Greedily join consecutive pieces while they fit in `window` characters.
///
/// Pieces must be contiguous slices of `text`, in order.
fn pack<'a>(text: &'a str, pieces: &[&'a str], window: usize) -> Vec<&'a str> {
    let base = text.as_ptr() as usize;
    let mut packed = Vec::new();
    let mut current: Option<(usize, usize, usize)> = None;

    for piece in pieces {
        let start = piece.as_ptr() as usize - base;
        let end = start + piece.len();
        let len = char_len(piece);
        current = match current {
            Some((s, _, chars)) if chars + len <= window => Some((s, end, chars + len)),
            Some((s, e, _)) => {
                packed.push(&text[s..e]);
                Some((start, end, len))
            }
            None => Some((start, end, len)),
        };
    }
    if let Some((s, e, _)) = current {
        packed.push(&text[s..e]);
    }
    packed
}

fn recursive<'a>(text: &'a str, window: usize, separators: &[&str]) -> Vec<&'a str> {
    if char_len(text) <= window {
        return vec![text];
    }
    let Some((separator, rest)) = separators.split_first() else {
        return fixed_windows(text, window);
    };
    if !text.contains(separator) {
        return recursive(text, window, rest);
    }

    let pieces: Vec<&str> = text.split_inclusive(separator).collect();
    let mut out = Vec::new();
    for chunk in pack(text, &pieces, window) {
        if char_len(chunk) <= window {
            out.push(chunk);
        } else {
            out.extend(recursive(chunk, window, rest));
        }
    }
    out
}

fn semantic(text: &str, window: usize) -> Vec<&str> {
    if char_len(text) <= window {
        return vec![text];
    }
    let paragraphs: Vec<&str> = text.split_inclusive("\n\n").collect();
    let mut out = Vec::new();
    for chunk in pack(text, &paragraphs, window) {
        if char_len(chunk) <= window {
            out.push(chunk);
            continue;
        }
        let sentences = sentences(chunk);
        for packed in pack(chunk, &sentences, window) {
            if char_len(packed) <= window {
                out.push(packed);
            } else {
                out.extend(fixed_windows(packed, window));
            }
        }
    }
    out
}

/// Split after sentence-ending punctuation followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut prev_terminal = false;
    for (idx, ch) in text.char_indices() {
        if prev_terminal && ch.is_whitespace() {
            let end = idx + ch.len_utf8();
            pieces.push(&text[start..end]);
            start = end;
            prev_terminal = false;
            continue;
        }
        prev_terminal = matches!(ch, '.' | '!' | '?');
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

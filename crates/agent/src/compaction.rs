//! History compaction after a context-window overflow.
//!
//! The conversation is split into segments, each starting at a genuine
//! user turn (not a tool result or reminder). Older segments collapse to
//! their opening question plus one assistant message: the completed answer
//! when there is one, otherwise the segment's last assistant reply. The
//! most recent segments are kept intact, and the system message is never
//! touched.

use crate::token::estimate_messages_tokens;
use serde::{Deserialize, Serialize};
use sleuth_core::message::{Message, MessageKind, Role};

/// Which segments survive compaction untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Always keep the most recent segment intact.
    pub keep_last_segment: bool,
    /// Number of most recent segments kept intact.
    pub min_segments_to_keep: usize,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            keep_last_segment: true,
            min_segments_to_keep: 1,
        }
    }
}

impl CompactionPolicy {
    fn segments_to_keep(&self) -> usize {
        self.min_segments_to_keep.max(usize::from(self.keep_last_segment))
    }
}

/// Summary of one compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStats {
    pub original_count: usize,
    pub compacted_count: usize,
    pub removed: usize,
    pub tokens_saved: usize,
}

impl CompactionStats {
    /// Nothing was removed; retrying with this history would fail the same way.
    pub fn is_noop(&self) -> bool {
        self.removed == 0
    }
}

/// Compact `messages` under `policy`.
///
/// Compacting the output again with the same policy removes nothing.
pub fn compact(messages: &[Message], policy: &CompactionPolicy) -> (Vec<Message>, CompactionStats) {
    let (head, body) = match messages.first() {
        Some(first) if first.role == Role::System => messages.split_at(1),
        _ => messages.split_at(0),
    };

    let segments = split_segments(body);
    let keep_from = segments.len().saturating_sub(policy.segments_to_keep());
    let last = segments.len().saturating_sub(1);

    let mut kept: Vec<Message> = head.to_vec();
    for (index, segment) in segments.iter().enumerate() {
        if index >= keep_from {
            kept.extend(segment.iter().cloned());
        } else {
            kept.extend(collapse(segment, index == last));
        }
    }

    let original_tokens = estimate_messages_tokens(messages);
    let kept_tokens = estimate_messages_tokens(&kept);
    let stats = CompactionStats {
        original_count: messages.len(),
        compacted_count: kept.len(),
        removed: messages.len() - kept.len(),
        tokens_saved: original_tokens.saturating_sub(kept_tokens),
    };
    (kept, stats)
}

/// Split at every turn start. Messages before the first turn start form
/// their own leading segment.
fn split_segments(body: &[Message]) -> Vec<&[Message]> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (i, message) in body.iter().enumerate() {
        if message.is_turn_start() && i > start {
            segments.push(&body[start..i]);
            start = i;
        }
    }
    if start < body.len() {
        segments.push(&body[start..]);
    }
    segments
}

fn collapse(segment: &[Message], in_progress: bool) -> Vec<Message> {
    let Some(opening) = segment.first().filter(|m| m.is_turn_start()) else {
        // Orphaned replies before any user turn carry nothing worth keeping.
        return Vec::new();
    };
    let mut kept = vec![opening.clone()];
    if in_progress {
        // The running turn has no answer yet; its last message must stay a user message.
        return kept;
    }

    let assistants = segment[1..].iter().filter(|m| m.role == Role::Assistant);
    let terminal = assistants
        .clone()
        .rfind(|m| m.kind == MessageKind::Completion)
        .or_else(|| assistants.last());
    if let Some(answer) = terminal {
        kept.push(answer.clone());
    }
    kept
}

//! Tail selection: where to split a conversation into "compress" and "keep".

use crate::{Message, MessageRole};

/// Ratio used when the requested keep ratio is outside `(0, 1)`.
pub const DEFAULT_TAIL_RATIO: f64 = 0.3;

/// Find the index where the verbatim tail begins.
///
/// Walks backwards from the newest message accumulating weight until the
/// tail holds at least `ceil(total * keep_ratio)`. The split is then clamped
/// so the most recent `user` turn always lands in the tail. Returns `None`
/// ("no split") for fewer than two messages, zero total weight, or a split
/// at index 0.
pub fn select_tail_start<F>(messages: &[Message], keep_ratio: f64, weigh: F) -> Option<usize>
where
    F: Fn(&Message) -> u64,
{
    if messages.len() < 2 {
        return None;
    }
    let weights: Vec<u64> = messages.iter().map(weigh).collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return None;
    }

    let ratio = if keep_ratio > 0.0 && keep_ratio < 1.0 {
        keep_ratio
    } else {
        DEFAULT_TAIL_RATIO
    };
    let target = (total as f64 * ratio).ceil() as u64;

    let mut kept = 0;
    let mut split = messages.len() - 1;
    for (idx, weight) in weights.iter().enumerate().rev() {
        kept += weight;
        split = idx;
        if kept >= target {
            break;
        }
    }

    if let Some(last_user) = messages.iter().rposition(|m| m.role == MessageRole::User)
        && split > last_user
    {
        split = last_user;
    }

    (split > 0).then_some(split)
}

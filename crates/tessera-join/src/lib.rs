//! Weighted bipartite matching of desired rows against actual rows.
//!
//! Every reconciliation loop in the system has the same shape: a set of
//! rows describing what we want, a set of rows describing what exists,
//! and the need to pair them up so that matched pairs are updated in
//! place while the leftovers are created or destroyed. [`join`] is that
//! pairing primitive.
//!
//! # Invariants
//!
//! - Every returned pair scored non-negative.
//! - Every unmatched element either had no compatible partner or lost
//!   the competition to a better-scoring pair.
//! - Output is deterministic and stable for stable inputs.

/// The result of pairing `left` against `right`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join<L, R> {
    /// Matched pairs, ordered by the position of the left element.
    pub pairs: Vec<(L, R)>,

    /// Left elements with no acceptable partner.
    pub unmatched_left: Vec<L>,

    /// Right elements with no acceptable partner.
    pub unmatched_right: Vec<R>,
}

/// Pair the elements of `left` with the elements of `right`.
///
/// `score(l, r)` returns a negative value when the two are incompatible
/// and otherwise a non-negative value where smaller is better. Pairing
/// is greedy over all candidate pairs sorted by `(score, left index,
/// right index)`, which approximates the minimum-total-score matching
/// and is exactly reproducible for the same inputs.
pub fn join<L, R, F>(left: Vec<L>, right: Vec<R>, score: F) -> Join<L, R>
where
    F: Fn(&L, &R) -> i32,
{
    let mut candidates = Vec::new();
    for (li, l) in left.iter().enumerate() {
        for (ri, r) in right.iter().enumerate() {
            let s = score(l, r);
            if s >= 0 {
                candidates.push((s, li, ri));
            }
        }
    }
    candidates.sort_unstable();

    let mut left_taken = vec![false; left.len()];
    let mut right_taken = vec![false; right.len()];
    let mut picks = Vec::new();
    for (_, li, ri) in candidates {
        if left_taken[li] || right_taken[ri] {
            continue;
        }
        left_taken[li] = true;
        right_taken[ri] = true;
        picks.push((li, ri));
    }
    picks.sort_unstable();

    let mut left_slots: Vec<Option<L>> = left.into_iter().map(Some).collect();
    let mut right_slots: Vec<Option<R>> = right.into_iter().map(Some).collect();

    let mut pairs = Vec::with_capacity(picks.len());
    for (li, ri) in picks {
        if let (Some(l), Some(r)) = (left_slots[li].take(), right_slots[ri].take()) {
            pairs.push((l, r));
        }
    }

    Join {
        pairs,
        unmatched_left: left_slots.into_iter().flatten().collect(),
        unmatched_right: right_slots.into_iter().flatten().collect(),
    }
}

//! Divergence tracking between baseline and local coordinate spaces.
//!
//! Remote transforms address blocks by *baseline position*: the index the
//! server last acknowledged. Local edits the server has not seen yet shift
//! those indices. The tracker records each shift as a signed adjustment at a
//! baseline position; the offset for position `P` is the sum of every
//! adjustment recorded at or before `P`.
//!
//! ```text
//! baseline  [A, B, C]          local insert D before B → insert(D, 1)
//! local     [A, D, B, C]
//! offset(0) = 0   offset(1) = +1   offset(2) = +1
//! ```

use tracing::trace;

use crate::BlockId;

/// One recorded adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    pub block_id: BlockId,
    pub position: usize,
    pub delta: i64,
    /// Order of recording within the table.
    pub recorded: u64,
}

/// Ordered table of adjustments, sorted by baseline position.
///
/// Adjustments at the same position accumulate; nothing is overwritten.
/// Entries disappear through [`Divergences::forget`] once the server has
/// taken the change into its baseline, or all at once through
/// [`Divergences::reset`].
#[derive(Debug, Clone, Default)]
pub struct Divergences {
    entries: Vec<Divergence>,
    recorded: u64,
}

impl Divergences {
    pub fn new() -> Self {
        Self::default()
    }

    /// A block was inserted ahead of `position`.
    pub fn insert(&mut self, block_id: BlockId, position: usize) {
        self.record(block_id, position, 1);
    }

    /// A block was removed at `position`.
    pub fn remove(&mut self, block_id: BlockId, position: usize) {
        self.record(block_id, position, -1);
    }

    /// Offset to add to `position` to get an index in the current document.
    pub fn get_offset(&self, position: usize) -> i64 {
        self.entries
            .iter()
            .take_while(|d| d.position <= position)
            .map(|d| d.delta)
            .sum()
    }

    /// Map a baseline position to a local index (may be negative before clamping).
    pub fn adjust(&self, position: usize) -> i64 {
        position as i64 + self.get_offset(position)
    }

    pub fn entries(&self) -> &[Divergence] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every adjustment; the baseline now matches local structure.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.recorded = 0;
    }

    /// Drop every entry recorded for `block_id` and return them.
    pub fn forget(&mut self, block_id: BlockId) -> Vec<Divergence> {
        let mut forgotten = Vec::new();
        self.entries.retain(|d| {
            if d.block_id == block_id {
                forgotten.push(*d);
                false
            } else {
                true
            }
        });
        if !forgotten.is_empty() {
            trace!(%block_id, count = forgotten.len(), "divergence forgotten");
        }
        forgotten
    }

    /// The baseline gained the block `inserted` recorded ahead of. Entries
    /// recorded after it, at or past its position, counted one block too few
    /// and move up one.
    pub fn shift_for_baseline_insert(&mut self, inserted: &Divergence) {
        for d in self.entries.iter_mut() {
            if d.recorded > inserted.recorded && d.position >= inserted.position {
                d.position += 1;
            }
        }
        self.entries.sort_by_key(|d| d.position);
    }

    /// The baseline lost the block `removed` was recorded for. Entries
    /// recorded before that removal, past its position, still counted it and
    /// move down one.
    pub fn shift_for_baseline_remove(&mut self, removed: &Divergence) {
        for d in self.entries.iter_mut() {
            if d.recorded < removed.recorded && d.position > removed.position {
                d.position -= 1;
            }
        }
        self.entries.sort_by_key(|d| d.position);
    }

    /// Move the first entry for `block_id` with the given sign of `delta` to
    /// `position`. Returns false when no such entry exists.
    pub fn reposition(&mut self, block_id: BlockId, delta: i64, position: usize) -> bool {
        let Some(at) = self
            .entries
            .iter()
            .position(|d| d.block_id == block_id && d.delta.signum() == delta.signum())
        else {
            return false;
        };
        let mut entry = self.entries.remove(at);
        entry.position = position;
        let at = self.entries.partition_point(|d| d.position <= position);
        self.entries.insert(at, entry);
        true
    }

    fn record(&mut self, block_id: BlockId, position: usize, delta: i64) {
        let at = self.entries.partition_point(|d| d.position <= position);
        let recorded = self.recorded;
        self.recorded += 1;
        self.entries.insert(at, Divergence { block_id, position, delta, recorded });
        trace!(%block_id, position, delta, entries = self.entries.len(), "divergence recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> BlockId {
        BlockId::new(n)
    }

    #[test]
    fn test_unrecorded_positions_have_zero_offset() {
        let div = Divergences::new();
        assert_eq!(div.get_offset(0), 0);
        assert_eq!(div.get_offset(1_000), 0);
    }

    #[test]
    fn test_same_position_accumulates() {
        let mut div = Divergences::new();
        div.insert(id(1), 3);
        div.insert(id(2), 3);
        assert_eq!(div.get_offset(3), 2);
        assert_eq!(div.get_offset(2), 0);
        assert_eq!(div.len(), 2);
    }

    #[test]
    fn test_insert_then_delete() {
        let mut div = Divergences::new();
        div.insert(id(1), 3);
        div.remove(id(2), 2);
        assert_eq!(div.get_offset(5), 0);
        assert_eq!(div.get_offset(2), -1);
        assert_eq!(div.get_offset(1), 0);
    }

    #[test]
    fn test_entries_stay_ordered() {
        let mut div = Divergences::new();
        div.insert(id(1), 7);
        div.insert(id(2), 1);
        div.remove(id(3), 4);
        let positions: Vec<_> = div.entries().iter().map(|d| d.position).collect();
        assert_eq!(positions, vec![1, 4, 7]);
    }

    #[test]
    fn test_offset_matches_signed_sum() {
        let mut div = Divergences::new();
        let ops: [(u64, usize, bool); 6] =
            [(1, 4, true), (2, 0, true), (3, 4, false), (4, 9, true), (5, 2, false), (6, 4, true)];
        for (n, pos, ins) in ops {
            if ins {
                div.insert(id(n), pos);
            } else {
                div.remove(id(n), pos);
            }
        }
        for p in 0..12 {
            let expected: i64 = ops
                .iter()
                .filter(|(_, pos, _)| *pos <= p)
                .map(|(_, _, ins)| if *ins { 1 } else { -1 })
                .sum();
            assert_eq!(div.get_offset(p), expected, "offset at {p}");
        }
    }

    #[test]
    fn test_forget_drops_only_that_block() {
        let mut div = Divergences::new();
        div.insert(id(1), 2);
        div.remove(id(2), 4);
        div.remove(id(1), 2);

        let forgotten = div.forget(id(1));
        assert_eq!(forgotten.len(), 2);
        let left: Vec<_> =
            div.entries().iter().map(|d| (d.block_id, d.position, d.delta)).collect();
        assert_eq!(left, vec![(id(2), 4, -1)]);
        assert!(div.forget(id(9)).is_empty());
    }

    #[test]
    fn test_baseline_insert_shifts_later_records() {
        let mut div = Divergences::new();
        div.remove(id(1), 3);
        div.insert(id(2), 1);
        div.remove(id(3), 1);
        div.remove(id(4), 4);

        let inserted = div.forget(id(2))[0];
        div.shift_for_baseline_insert(&inserted);
        // 1 was removed before 2 existed and keeps its position.
        let order: Vec<_> = div.entries().iter().map(|d| (d.block_id, d.position)).collect();
        assert_eq!(order, vec![(id(3), 2), (id(1), 3), (id(4), 5)]);
    }

    #[test]
    fn test_baseline_remove_shifts_earlier_records() {
        let mut div = Divergences::new();
        div.remove(id(1), 3);
        div.remove(id(2), 1);
        div.remove(id(3), 2);

        let removed = div.forget(id(2))[0];
        div.shift_for_baseline_remove(&removed);
        // 3 was measured after 2 was already gone.
        let order: Vec<_> = div.entries().iter().map(|d| (d.block_id, d.position)).collect();
        assert_eq!(order, vec![(id(3), 2), (id(1), 2)]);
        assert_eq!(div.get_offset(2), -2);
    }

    #[test]
    fn test_reposition_resorts() {
        let mut div = Divergences::new();
        div.insert(id(1), 1);
        div.insert(id(2), 3);
        assert!(div.reposition(id(1), 1, 5));
        assert!(!div.reposition(id(1), -1, 0));
        let order: Vec<_> = div.entries().iter().map(|d| (d.block_id, d.position)).collect();
        assert_eq!(order, vec![(id(2), 3), (id(1), 5)]);
        assert_eq!(div.get_offset(4), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut div = Divergences::new();
        div.insert(id(1), 0);
        div.reset();
        assert!(div.is_empty());
        assert_eq!(div.adjust(5), 5);
    }
}

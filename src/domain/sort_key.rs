//! Sort keys for the partial reorder merge.
//!
//! Moved tasks sort by their 0-based index in the submitted order. Untouched
//! tasks sit just after the highest new index of the moved tasks that precede
//! them, offset by `old_position / (total + 1)` where `old_position` is the
//! task's 1-based rank in the current order. The offset is always inside
//! `(0, 1)`, so an untouched key never equals a moved key.

/// Old (1-based rank) and new (0-based index) position of a moved task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovedPosition {
    pub old_position: usize,
    pub new_position: usize,
}

pub fn reordered_key(new_position: usize) -> f64 {
    new_position as f64
}

pub fn untouched_key(
    old_position: usize,
    preceding_moved_new_max: Option<usize>,
    total_task_count: usize,
) -> f64 {
    let base = preceding_moved_new_max.map_or(-1.0, |value| value as f64);
    base + old_position as f64 / (total_task_count as f64 + 1.0)
}

/// A moved task precedes the untouched task at `old_position` when it was
/// already before it, or when it jumped backward past it.
pub fn precedes(moved: MovedPosition, old_position: usize) -> bool {
    moved.old_position < old_position
        || (moved.old_position > old_position && moved.new_position < old_position)
}

/// Answers "highest new position among moved predecessors" in O(log m).
///
/// The predecessor set is `{old < p} ∪ {new < p}`. The first half is a prefix
/// maximum over moved tasks sorted by old position. New positions are exactly
/// `0..m`, so the largest one below `p` is `min(p - 1, m - 1)`.
#[derive(Debug, Clone, Default)]
pub struct MovedIndex {
    by_old_position: Vec<(usize, usize)>,
    moved_count: usize,
}

impl MovedIndex {
    pub fn new(moved: &[MovedPosition]) -> Self {
        let mut sorted = moved.to_vec();
        sorted.sort_by_key(|position| position.old_position);

        let mut running_max = 0usize;
        let by_old_position = sorted
            .into_iter()
            .map(|position| {
                running_max = running_max.max(position.new_position);
                (position.old_position, running_max)
            })
            .collect();

        Self {
            by_old_position,
            moved_count: moved.len(),
        }
    }

    pub fn preceding_new_max(&self, old_position: usize) -> Option<usize> {
        let before = self
            .by_old_position
            .partition_point(|(old, _)| *old < old_position);
        let from_earlier = before
            .checked_sub(1)
            .map(|index| self.by_old_position[index].1);

        let from_jumps = match (old_position.checked_sub(1), self.moved_count.checked_sub(1)) {
            (Some(below), Some(last_new)) => Some(below.min(last_new)),
            _ => None,
        };

        from_earlier.max(from_jumps)
    }
}

use crate::domain::models::{DisplayOrderAssignment, Task};
use crate::domain::sort_key::{reordered_key, untouched_key, MovedIndex, MovedPosition};
use std::collections::{HashMap, HashSet};

/// Recomputes display orders for a whole category after the user moved a subset.
///
/// `category_tasks` must already be in current display order (nulls last).
/// Every id in `reordered_ids` has to belong to the category; the check runs
/// before any key is computed. An empty `reordered_ids` yields a plain
/// renumbering of the current order.
pub fn merge_display_orders(
    category_tasks: &[Task],
    reordered_ids: &[String],
) -> Result<Vec<DisplayOrderAssignment>, String> {
    let old_position_of = category_tasks
        .iter()
        .enumerate()
        .map(|(index, task)| (task.id.as_str(), index + 1))
        .collect::<HashMap<_, _>>();

    let mut seen = HashSet::new();
    for id in reordered_ids {
        if !old_position_of.contains_key(id.as_str()) {
            return Err(format!("task not found or not owned by caller: {id}"));
        }
        if !seen.insert(id.as_str()) {
            return Err(format!("task listed more than once in new order: {id}"));
        }
    }

    let new_position_of = reordered_ids
        .iter()
        .enumerate()
        .map(|(index, id)| (id.as_str(), index))
        .collect::<HashMap<_, _>>();

    let moved = reordered_ids
        .iter()
        .map(|id| MovedPosition {
            old_position: old_position_of[id.as_str()],
            new_position: new_position_of[id.as_str()],
        })
        .collect::<Vec<_>>();
    let moved_index = MovedIndex::new(&moved);
    let total = category_tasks.len();

    let mut keyed = category_tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let old_position = index + 1;
            let key = match new_position_of.get(task.id.as_str()) {
                Some(new_position) => reordered_key(*new_position),
                None => untouched_key(
                    old_position,
                    moved_index.preceding_new_max(old_position),
                    total,
                ),
            };
            (key, old_position, task.id.as_str())
        })
        .collect::<Vec<_>>();

    keyed.sort_by(|left, right| left.0.total_cmp(&right.0).then(left.1.cmp(&right.1)));

    Ok(keyed
        .into_iter()
        .enumerate()
        .map(|(index, (_, _, id))| DisplayOrderAssignment {
            id: id.to_string(),
            display_order: index as i64 + 1,
        })
        .collect())
}

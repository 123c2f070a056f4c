use crate::domain::models::{ModeConflict, Task, WorkMode, WorkdayChange};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};

/// Finds every dated task whose mode the proposed workday changes would violate.
///
/// Tasks are grouped by due date once, so a month of changes costs one pass
/// over the task list. Only dates with at least one conflict are returned.
/// When a date is proposed twice the later change wins.
pub fn detect_conflicts(
    proposed_changes: &[WorkdayChange],
    tasks: &[Task],
) -> BTreeMap<NaiveDate, Vec<ModeConflict>> {
    if proposed_changes.is_empty() {
        return BTreeMap::new();
    }

    let mut tasks_by_date: HashMap<NaiveDate, Vec<&Task>> = HashMap::new();
    for task in tasks {
        if let Some(due_date) = task.due_date {
            tasks_by_date.entry(due_date).or_default().push(task);
        }
    }

    let mut latest = BTreeMap::new();
    for change in proposed_changes {
        latest.insert(change.date, change.mode);
    }

    let mut conflicts = BTreeMap::new();
    for (date, work_mode) in latest {
        let Some(dated_tasks) = tasks_by_date.get(&date) else {
            continue;
        };
        let found = conflicts_for_day(date, work_mode, dated_tasks);
        if !found.is_empty() {
            conflicts.insert(date, found);
        }
    }
    conflicts
}

fn conflicts_for_day(date: NaiveDate, work_mode: WorkMode, tasks: &[&Task]) -> Vec<ModeConflict> {
    tasks
        .iter()
        .filter(|task| !task.mode.is_compatible_with(work_mode))
        .map(|task| ModeConflict {
            date,
            task_id: task.id.clone(),
            task_mode: task.mode,
            work_mode,
        })
        .collect()
}

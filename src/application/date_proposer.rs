use crate::domain::models::{ModeConflict, WorkMode};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::workday_repository::WorkdayRepository;
use async_trait::async_trait;
use chrono::NaiveDate;

/// Source of the effective work mode of a single day.
#[async_trait]
pub trait WorkModeLookup: Send + Sync {
    async fn work_mode_at(&self, date: NaiveDate) -> Result<WorkMode, InfraError>;
}

/// Reads one user's workdays straight from the repository.
pub struct RepositoryWorkModes<'a, W>
where
    W: WorkdayRepository,
{
    repository: &'a W,
    user_id: &'a str,
}

impl<'a, W> RepositoryWorkModes<'a, W>
where
    W: WorkdayRepository,
{
    pub fn new(repository: &'a W, user_id: &'a str) -> Self {
        Self {
            repository,
            user_id,
        }
    }
}

#[async_trait]
impl<'a, W> WorkModeLookup for RepositoryWorkModes<'a, W>
where
    W: WorkdayRepository,
{
    async fn work_mode_at(&self, date: NaiveDate) -> Result<WorkMode, InfraError> {
        self.repository.get_work_mode(self.user_id, date).await
    }
}

/// Walks forward from the day after the conflict, one day at a time, and
/// returns the first day whose mode suits the task. Each day is looked up at
/// most once and never more than `max_lookahead` days are checked.
pub async fn propose_date<L>(
    conflict: &ModeConflict,
    lookup: &L,
    max_lookahead: u32,
) -> Result<Option<NaiveDate>, InfraError>
where
    L: WorkModeLookup + ?Sized,
{
    let mut candidate = conflict.date;
    for _ in 0..max_lookahead {
        let Some(next) = candidate.succ_opt() else {
            return Ok(None);
        };
        candidate = next;

        let mode = lookup.work_mode_at(candidate).await?;
        if conflict.task_mode.is_compatible_with(mode) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

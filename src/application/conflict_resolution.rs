use crate::application::date_proposer::{RepositoryWorkModes, WorkModeLookup, propose_date};
use crate::domain::conflict::detect_conflicts;
use crate::domain::models::{ModeConflict, WorkMode, WorkdayChange};
use crate::infrastructure::config::DEFAULT_DATE_PROPOSAL_LOOKAHEAD;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::TaskRepository;
use crate::infrastructure::workday_repository::WorkdayRepository;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ResolutionPhase {
    Idle,
    Presenting { index: usize },
    AwaitingDateAcceptance { index: usize, candidate: NaiveDate },
    ReadyToCommit,
    AllResolved,
    Closed,
    Cancelled,
}

impl ResolutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Presenting { .. } => "presenting",
            Self::AwaitingDateAcceptance { .. } => "awaiting_date_acceptance",
            Self::ReadyToCommit => "ready_to_commit",
            Self::AllResolved => "all_resolved",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::AllResolved | Self::Closed | Self::Cancelled)
    }
}

/// How a single conflict was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Resolution {
    ModeChanged(WorkMode),
    DateChanged(NaiveDate),
    Overridden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionResult {
    Next {
        index: usize,
        conflict: ModeConflict,
    },
    Resolved {
        committed: Vec<WorkdayChange>,
    },
    DateProposed {
        date: NaiveDate,
    },
    NoDateFound,
    ManualDateSelection {
        task_id: String,
        reload_required: bool,
    },
    Cancelled {
        reverted: Vec<WorkdayChange>,
        reload_required: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkdayUpdateResult {
    Ok,
    Conflict { conflicts: Vec<ModeConflict> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEdit {
    proposed: WorkMode,
    original: WorkMode,
    written: bool,
}

/// One user's walk through the conflicts of a workday batch.
///
/// Every coordinator action takes the state by `&mut` and leaves it untouched
/// when it returns an error, except that a failed final write after a durable
/// step parks the flow in `ReadyToCommit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionState {
    user_id: String,
    phase: ResolutionPhase,
    conflicts: Vec<ModeConflict>,
    resolutions: Vec<Option<Resolution>>,
    pending: BTreeMap<NaiveDate, PendingEdit>,
    durable_writes: bool,
}

impl ResolutionState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            phase: ResolutionPhase::Idle,
            conflicts: Vec::new(),
            resolutions: Vec::new(),
            pending: BTreeMap::new(),
            durable_writes: false,
        }
    }

    pub fn phase(&self) -> ResolutionPhase {
        self.phase
    }

    pub fn conflicts(&self) -> &[ModeConflict] {
        &self.conflicts
    }

    pub fn resolution(&self, index: usize) -> Option<Resolution> {
        self.resolutions.get(index).copied().flatten()
    }

    pub fn current_conflict(&self) -> Option<&ModeConflict> {
        self.active_index().and_then(|index| self.conflicts.get(index))
    }

    /// Proposed mode of every conflicted date that has not been written yet.
    pub fn pending_changes(&self) -> Vec<WorkdayChange> {
        self.pending
            .iter()
            .filter(|(_, edit)| !edit.written)
            .map(|(date, edit)| WorkdayChange {
                date: *date,
                mode: edit.proposed,
            })
            .collect()
    }

    pub fn has_durable_writes(&self) -> bool {
        self.durable_writes
    }

    fn active_index(&self) -> Option<usize> {
        match self.phase {
            ResolutionPhase::Presenting { index }
            | ResolutionPhase::AwaitingDateAcceptance { index, .. } => Some(index),
            _ => None,
        }
    }

    fn first_unresolved(&self) -> Option<usize> {
        self.resolutions.iter().position(Option::is_none)
    }

    fn next_unresolved_after(&self, index: usize) -> Option<usize> {
        (index + 1..self.resolutions.len()).find(|&other| self.resolutions[other].is_none())
    }

    /// An earlier mode change on the same date whose task would not fit `mode`.
    fn mode_change_undone_by(&self, index: usize, mode: WorkMode) -> Option<usize> {
        let date = self.conflicts[index].date;
        (0..self.conflicts.len()).find(|&other| {
            other != index
                && self.conflicts[other].date == date
                && matches!(self.resolutions[other], Some(Resolution::ModeChanged(_)))
                && !self.conflicts[other].task_mode.is_compatible_with(mode)
        })
    }

    /// Re-checks the open conflicts sharing a date after `mode` was written
    /// for it: tasks that now fit are resolved, the rest show the new mode.
    fn settle_date(&mut self, index: usize, mode: WorkMode) -> usize {
        let date = self.conflicts[index].date;
        let mut settled = 0;
        for other in 0..self.conflicts.len() {
            if other == index
                || self.conflicts[other].date != date
                || self.resolutions[other].is_some()
            {
                continue;
            }
            if self.conflicts[other].task_mode.is_compatible_with(mode) {
                self.resolutions[other] = Some(Resolution::ModeChanged(mode));
                settled += 1;
            } else {
                self.conflicts[other].work_mode = mode;
            }
        }
        settled
    }

    fn next_action_result(&self, index: usize) -> ActionResult {
        ActionResult::Next {
            index,
            conflict: self.conflicts[index].clone(),
        }
    }

    fn discard_pending(&mut self) -> Vec<WorkdayChange> {
        let reverted = self
            .pending
            .iter()
            .filter(|(_, edit)| !edit.written)
            .map(|(date, edit)| WorkdayChange {
                date: *date,
                mode: edit.original,
            })
            .collect::<Vec<_>>();
        self.pending.retain(|_, edit| edit.written);
        reverted
    }
}

/// Answers work mode lookups with the batch's pending edits first.
struct PendingOverlay<'a, L> {
    inner: L,
    pending: &'a BTreeMap<NaiveDate, PendingEdit>,
}

#[async_trait]
impl<'a, L> WorkModeLookup for PendingOverlay<'a, L>
where
    L: WorkModeLookup,
{
    async fn work_mode_at(&self, date: NaiveDate) -> Result<WorkMode, InfraError> {
        if let Some(edit) = self.pending.get(&date) {
            return Ok(edit.proposed);
        }
        self.inner.work_mode_at(date).await
    }
}

pub struct ConflictResolutionCoordinator<T, W>
where
    T: TaskRepository,
    W: WorkdayRepository,
{
    task_repository: Arc<T>,
    workday_repository: Arc<W>,
    max_lookahead: u32,
}

impl<T, W> ConflictResolutionCoordinator<T, W>
where
    T: TaskRepository,
    W: WorkdayRepository,
{
    pub fn new(task_repository: Arc<T>, workday_repository: Arc<W>) -> Self {
        Self {
            task_repository,
            workday_repository,
            max_lookahead: DEFAULT_DATE_PROPOSAL_LOOKAHEAD,
        }
    }

    pub fn with_max_lookahead(mut self, max_lookahead: u32) -> Self {
        self.max_lookahead = max_lookahead;
        self
    }

    /// Writes one date immediately unless dated tasks would be violated.
    /// `force` skips detection.
    pub async fn update_workday_mode(
        &self,
        user_id: &str,
        date: NaiveDate,
        mode: WorkMode,
        force: bool,
    ) -> Result<WorkdayUpdateResult, InfraError> {
        if !force {
            let tasks = self.task_repository.list_tasks_for_user(user_id).await?;
            let conflicts = detect_conflicts(&[WorkdayChange { date, mode }], &tasks)
                .into_values()
                .flatten()
                .collect::<Vec<_>>();
            if !conflicts.is_empty() {
                debug!(user_id, %date, conflicts = conflicts.len(), "workday update blocked");
                return Ok(WorkdayUpdateResult::Conflict { conflicts });
            }
        }

        self.workday_repository
            .set_work_mode(user_id, date, mode)
            .await?;
        info!(user_id, %date, mode = mode.as_str(), force, "workday mode updated");
        Ok(WorkdayUpdateResult::Ok)
    }

    /// Starts a batch: commits every change without conflicts in one write and
    /// queues the rest, date ascending, for the user to walk through.
    pub async fn begin(
        &self,
        state: &mut ResolutionState,
        changes: &[WorkdayChange],
    ) -> Result<ActionResult, InfraError> {
        ensure_phase(state, "begin", |phase| phase == ResolutionPhase::Idle)?;
        if state.user_id.trim().is_empty() {
            return Err(InfraError::Validation(
                "user_id must not be empty".to_string(),
            ));
        }

        let user_id = state.user_id.clone();
        let tasks = self.task_repository.list_tasks_for_user(&user_id).await?;
        let detected = detect_conflicts(changes, &tasks);

        let mut latest = BTreeMap::new();
        for change in changes {
            latest.insert(change.date, change.mode);
        }

        let mut pending = BTreeMap::new();
        for (date, proposed) in &latest {
            if detected.contains_key(date) {
                let original = self.workday_repository.get_work_mode(&user_id, *date).await?;
                pending.insert(
                    *date,
                    PendingEdit {
                        proposed: *proposed,
                        original,
                        written: false,
                    },
                );
            }
        }

        let immediate = latest
            .iter()
            .filter(|(date, _)| !detected.contains_key(*date))
            .map(|(date, mode)| WorkdayChange {
                date: *date,
                mode: *mode,
            })
            .collect::<Vec<_>>();
        if !immediate.is_empty() {
            self.workday_repository
                .set_work_modes_batch(&user_id, &immediate)
                .await?;
        }

        let conflicts = detected.into_values().flatten().collect::<Vec<_>>();
        info!(
            user_id = user_id.as_str(),
            changes = latest.len(),
            committed = immediate.len(),
            conflicts = conflicts.len(),
            "workday batch started"
        );

        state.resolutions = vec![None; conflicts.len()];
        state.conflicts = conflicts;
        state.pending = pending;
        state.durable_writes = !immediate.is_empty();

        if state.conflicts.is_empty() {
            state.phase = ResolutionPhase::AllResolved;
            return Ok(ActionResult::Resolved {
                committed: immediate,
            });
        }
        state.phase = ResolutionPhase::Presenting { index: 0 };
        Ok(state.next_action_result(0))
    }

    /// Switches the conflicted date to a mode the task accepts and writes it now.
    ///
    /// Other open conflicts on that date are re-checked against the written
    /// mode. A switch that would break an earlier mode change on the same date
    /// is refused.
    pub async fn change_workday_mode(
        &self,
        state: &mut ResolutionState,
    ) -> Result<ActionResult, InfraError> {
        let index = require_active(state, "change_workday_mode")?;
        let conflict = state.conflicts[index].clone();
        let mode = conflict.task_mode.preferred_work_mode();

        if let Some(earlier) = state.mode_change_undone_by(index, mode) {
            return Err(InfraError::InvalidState(format!(
                "switching {} to {} would break the mode change made for task {}",
                conflict.date,
                mode.as_str(),
                state.conflicts[earlier].task_id
            )));
        }

        self.workday_repository
            .set_work_mode(&state.user_id, conflict.date, mode)
            .await?;

        let mut next = state.clone();
        next.durable_writes = true;
        if let Some(edit) = next.pending.get_mut(&conflict.date) {
            edit.proposed = mode;
            edit.written = true;
        }
        let settled = next.settle_date(index, mode);
        debug!(
            index,
            date = %conflict.date,
            mode = mode.as_str(),
            settled,
            "conflict resolved by mode change"
        );
        self.resolve_and_advance(state, next, index, Resolution::ModeChanged(mode), true)
            .await
    }

    /// Searches forward for a day that suits the task, seeing pending edits
    /// of this batch as if they were already applied.
    pub async fn propose_date(
        &self,
        state: &mut ResolutionState,
    ) -> Result<ActionResult, InfraError> {
        let index = require_active(state, "propose_date")?;
        let conflict = &state.conflicts[index];
        let lookup = PendingOverlay {
            inner: RepositoryWorkModes::new(self.workday_repository.as_ref(), &state.user_id),
            pending: &state.pending,
        };

        let Some(candidate) = propose_date(conflict, &lookup, self.max_lookahead).await? else {
            debug!(index, date = %conflict.date, "no compatible date in window");
            return Ok(ActionResult::NoDateFound);
        };

        debug!(index, %candidate, "date proposed");
        state.phase = ResolutionPhase::AwaitingDateAcceptance { index, candidate };
        Ok(ActionResult::DateProposed { date: candidate })
    }

    /// Moves the task to the proposed date.
    pub async fn accept_proposed_date(
        &self,
        state: &mut ResolutionState,
    ) -> Result<ActionResult, InfraError> {
        let ResolutionPhase::AwaitingDateAcceptance { index, candidate } = state.phase else {
            return Err(invalid_phase("accept_proposed_date", state.phase));
        };
        let task_id = state.conflicts[index].task_id.clone();

        self.task_repository
            .update_task_due_date(&state.user_id, &task_id, candidate)
            .await?;
        debug!(index, task_id = task_id.as_str(), %candidate, "conflict resolved by date change");

        let mut next = state.clone();
        next.durable_writes = true;
        self.resolve_and_advance(state, next, index, Resolution::DateChanged(candidate), true)
            .await
    }

    /// Ends the flow so the caller can open the task editor. Pending edits are
    /// dropped the same way `cancel` drops them.
    pub fn choose_date_manually(
        &self,
        state: &mut ResolutionState,
    ) -> Result<ActionResult, InfraError> {
        let index = require_active(state, "choose_date_manually")?;
        let task_id = state.conflicts[index].task_id.clone();

        let reverted = state.discard_pending();
        state.phase = ResolutionPhase::Closed;
        info!(
            task_id = task_id.as_str(),
            reverted = reverted.len(),
            "resolution closed for manual date selection"
        );
        Ok(ActionResult::ManualDateSelection {
            task_id,
            reload_required: state.durable_writes,
        })
    }

    /// Keeps the proposed mode despite the conflict.
    pub async fn confirm_anyway(
        &self,
        state: &mut ResolutionState,
    ) -> Result<ActionResult, InfraError> {
        let index = require_active(state, "confirm_anyway")?;
        debug!(index, "conflict overridden");
        let next = state.clone();
        self.resolve_and_advance(state, next, index, Resolution::Overridden, false)
            .await
    }

    pub fn cancel(&self, state: &mut ResolutionState) -> Result<ActionResult, InfraError> {
        ensure_phase(state, "cancel", |phase| {
            matches!(
                phase,
                ResolutionPhase::Presenting { .. }
                    | ResolutionPhase::AwaitingDateAcceptance { .. }
                    | ResolutionPhase::ReadyToCommit
            )
        })?;

        let reverted = state.discard_pending();
        state.phase = ResolutionPhase::Cancelled;
        info!(
            user_id = state.user_id.as_str(),
            reverted = reverted.len(),
            reload_required = state.durable_writes,
            "resolution cancelled"
        );
        Ok(ActionResult::Cancelled {
            reverted,
            reload_required: state.durable_writes,
        })
    }

    /// Retries the final write after it failed.
    pub async fn commit_pending(
        &self,
        state: &mut ResolutionState,
    ) -> Result<ActionResult, InfraError> {
        ensure_phase(state, "commit_pending", |phase| {
            phase == ResolutionPhase::ReadyToCommit
        })?;
        let mut next = state.clone();
        let committed = self.commit_resolved(&mut next).await?;
        *state = next;
        Ok(ActionResult::Resolved { committed })
    }

    async fn resolve_and_advance(
        &self,
        state: &mut ResolutionState,
        mut next: ResolutionState,
        index: usize,
        resolution: Resolution,
        durable_step: bool,
    ) -> Result<ActionResult, InfraError> {
        next.resolutions[index] = Some(resolution);

        if let Some(following) = next.next_unresolved_after(index) {
            next.phase = ResolutionPhase::Presenting { index: following };
            let result = next.next_action_result(following);
            *state = next;
            return Ok(result);
        }

        if let Some(unresolved) = next.first_unresolved() {
            warn!(unresolved, "reached the end with an unresolved conflict");
            next.phase = ResolutionPhase::Presenting { index: unresolved };
            let result = next.next_action_result(unresolved);
            *state = next;
            return Ok(result);
        }

        match self.commit_resolved(&mut next).await {
            Ok(committed) => {
                *state = next;
                Ok(ActionResult::Resolved { committed })
            }
            Err(error) => {
                if durable_step {
                    next.phase = ResolutionPhase::ReadyToCommit;
                    *state = next;
                }
                Err(error)
            }
        }
    }

    /// Writes every pending conflicted date in one forced batch. Conflicts
    /// were already addressed, so detection is not repeated.
    async fn commit_resolved(
        &self,
        state: &mut ResolutionState,
    ) -> Result<Vec<WorkdayChange>, InfraError> {
        let committed = state.pending_changes();
        if !committed.is_empty() {
            if let Err(error) = self
                .workday_repository
                .set_work_modes_batch(&state.user_id, &committed)
                .await
            {
                warn!(
                    user_id = state.user_id.as_str(),
                    dates = committed.len(),
                    retryable = error.is_retryable(),
                    error = %error,
                    "final workday batch failed"
                );
                return Err(error);
            }
            state.durable_writes = true;
        }

        for edit in state.pending.values_mut() {
            edit.written = true;
        }
        state.phase = ResolutionPhase::AllResolved;
        info!(
            user_id = state.user_id.as_str(),
            committed = committed.len(),
            "workday batch resolved"
        );
        Ok(committed)
    }
}

fn invalid_phase(action: &str, phase: ResolutionPhase) -> InfraError {
    InfraError::InvalidState(format!("{action} is not allowed while {}", phase.as_str()))
}

fn ensure_phase<F>(state: &ResolutionState, action: &str, allowed: F) -> Result<(), InfraError>
where
    F: Fn(ResolutionPhase) -> bool,
{
    if allowed(state.phase) {
        Ok(())
    } else {
        Err(invalid_phase(action, state.phase))
    }
}

fn require_active(state: &ResolutionState, action: &str) -> Result<usize, InfraError> {
    state
        .active_index()
        .ok_or_else(|| invalid_phase(action, state.phase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Task, TaskMode};
    use crate::infrastructure::task_repository::InMemoryTaskRepository;
    use crate::infrastructure::workday_repository::InMemoryWorkdayRepository;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const USER: &str = "user-1";

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn dated_task(id: &str, due: &str, mode: TaskMode) -> Task {
        Task {
            id: id.to_string(),
            title: format!("task {id}"),
            description: None,
            frequency: None,
            due_date: Some(date(due)),
            mode,
            display_order: None,
            created_at: DateTime::parse_from_rfc3339("2024-06-01T08:00:00Z")
                .expect("valid datetime")
                .with_timezone(&Utc),
        }
    }

    fn change(day: &str, mode: WorkMode) -> WorkdayChange {
        WorkdayChange {
            date: date(day),
            mode,
        }
    }

    #[derive(Debug, Default)]
    struct RecordingWorkdays {
        inner: InMemoryWorkdayRepository,
        single_writes: AtomicUsize,
        batch_calls: Mutex<Vec<Vec<WorkdayChange>>>,
        fail_batches: AtomicUsize,
    }

    impl RecordingWorkdays {
        fn batch_calls(&self) -> Vec<Vec<WorkdayChange>> {
            self.batch_calls.lock().expect("batch mutex poisoned").clone()
        }
    }

    #[async_trait]
    impl WorkdayRepository for RecordingWorkdays {
        async fn get_work_mode(
            &self,
            user_id: &str,
            date: NaiveDate,
        ) -> Result<WorkMode, InfraError> {
            self.inner.get_work_mode(user_id, date).await
        }

        async fn set_work_mode(
            &self,
            user_id: &str,
            date: NaiveDate,
            mode: WorkMode,
        ) -> Result<(), InfraError> {
            self.single_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_work_mode(user_id, date, mode).await
        }

        async fn set_work_modes_batch(
            &self,
            user_id: &str,
            changes: &[WorkdayChange],
        ) -> Result<(), InfraError> {
            let remaining_failures = self.fail_batches.load(Ordering::SeqCst);
            if remaining_failures > 0 {
                self.fail_batches.store(remaining_failures - 1, Ordering::SeqCst);
                return Err(InfraError::Persistence("database is locked".to_string()));
            }
            self.batch_calls
                .lock()
                .expect("batch mutex poisoned")
                .push(changes.to_vec());
            self.inner.set_work_modes_batch(user_id, changes).await
        }
    }

    struct Fixture {
        tasks: Arc<InMemoryTaskRepository>,
        workdays: Arc<RecordingWorkdays>,
        coordinator: ConflictResolutionCoordinator<InMemoryTaskRepository, RecordingWorkdays>,
    }

    async fn fixture(tasks: &[Task]) -> Fixture {
        let task_repository = Arc::new(InMemoryTaskRepository::default());
        for task in tasks {
            task_repository
                .insert_task(USER, task)
                .await
                .expect("seed task");
        }
        let workdays = Arc::new(RecordingWorkdays::default());
        let coordinator =
            ConflictResolutionCoordinator::new(Arc::clone(&task_repository), Arc::clone(&workdays));
        Fixture {
            tasks: task_repository,
            workdays,
            coordinator,
        }
    }

    fn three_day_batch() -> Vec<WorkdayChange> {
        vec![
            change("2024-06-10", WorkMode::Remote),
            change("2024-06-11", WorkMode::Remote),
            change("2024-06-12", WorkMode::Off),
        ]
    }

    fn two_conflict_tasks() -> Vec<Task> {
        vec![
            dated_task("t1", "2024-06-10", TaskMode::OnSite),
            dated_task("t2", "2024-06-12", TaskMode::Any),
        ]
    }

    #[tokio::test]
    async fn batch_commits_clean_dates_and_presents_conflicts_in_order() {
        let fixture = fixture(&two_conflict_tasks()).await;
        let mut state = ResolutionState::new(USER);

        let first = fixture
            .coordinator
            .begin(&mut state, &three_day_batch())
            .await
            .expect("begin");

        assert_eq!(
            fixture.workdays.batch_calls(),
            vec![vec![change("2024-06-11", WorkMode::Remote)]]
        );
        match first {
            ActionResult::Next { index, conflict } => {
                assert_eq!(index, 0);
                assert_eq!(conflict.task_id, "t1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(state.conflicts().len(), 2);

        let second = fixture
            .coordinator
            .confirm_anyway(&mut state)
            .await
            .expect("confirm first");
        match second {
            ActionResult::Next { index, conflict } => {
                assert_eq!(index, 1);
                assert_eq!(conflict.task_id, "t2");
                assert_eq!(conflict.work_mode, WorkMode::Off);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_reverts_pending_edits_and_requests_reload() {
        let fixture = fixture(&two_conflict_tasks()).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(&mut state, &three_day_batch())
            .await
            .expect("begin");
        fixture
            .coordinator
            .confirm_anyway(&mut state)
            .await
            .expect("confirm first");

        let cancelled = fixture.coordinator.cancel(&mut state).expect("cancel");

        assert_eq!(
            cancelled,
            ActionResult::Cancelled {
                reverted: vec![
                    change("2024-06-10", WorkMode::OnSite),
                    change("2024-06-12", WorkMode::OnSite),
                ],
                reload_required: true,
            }
        );
        assert_eq!(state.phase(), ResolutionPhase::Cancelled);
        assert!(state.pending_changes().is_empty());
        let clean_day = fixture
            .workdays
            .get_work_mode(USER, date("2024-06-11"))
            .await
            .expect("read clean day");
        let conflicted_day = fixture
            .workdays
            .get_work_mode(USER, date("2024-06-10"))
            .await
            .expect("read conflicted day");
        assert_eq!(clean_day, WorkMode::Remote);
        assert_eq!(conflicted_day, WorkMode::OnSite);
    }

    #[tokio::test]
    async fn mode_change_writes_now_and_is_left_out_of_final_batch() {
        let fixture = fixture(&two_conflict_tasks()).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(
                &mut state,
                &[
                    change("2024-06-10", WorkMode::Remote),
                    change("2024-06-12", WorkMode::Off),
                ],
            )
            .await
            .expect("begin");

        fixture
            .coordinator
            .change_workday_mode(&mut state)
            .await
            .expect("change mode");
        assert_eq!(state.resolution(0), Some(Resolution::ModeChanged(WorkMode::OnSite)));
        assert_eq!(fixture.workdays.single_writes.load(Ordering::SeqCst), 1);

        let done = fixture
            .coordinator
            .confirm_anyway(&mut state)
            .await
            .expect("confirm second");

        assert_eq!(
            done,
            ActionResult::Resolved {
                committed: vec![change("2024-06-12", WorkMode::Off)],
            }
        );
        assert_eq!(state.phase(), ResolutionPhase::AllResolved);
        assert_eq!(
            fixture.workdays.batch_calls(),
            vec![vec![change("2024-06-12", WorkMode::Off)]]
        );
    }

    #[tokio::test]
    async fn accepted_proposal_moves_task_and_skips_pending_days() {
        let tasks = vec![dated_task("t1", "2024-06-10", TaskMode::OnSite)];
        let fixture = fixture(&tasks).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(
                &mut state,
                &[
                    change("2024-06-10", WorkMode::Remote),
                    change("2024-06-11", WorkMode::Remote),
                ],
            )
            .await
            .expect("begin");

        let proposed = fixture
            .coordinator
            .propose_date(&mut state)
            .await
            .expect("propose");
        assert_eq!(
            proposed,
            ActionResult::DateProposed {
                date: date("2024-06-12")
            }
        );

        let done = fixture
            .coordinator
            .accept_proposed_date(&mut state)
            .await
            .expect("accept");
        assert!(matches!(done, ActionResult::Resolved { .. }));
        assert_eq!(state.resolution(0), Some(Resolution::DateChanged(date("2024-06-12"))));

        let stored = fixture
            .tasks
            .list_tasks_for_user(USER)
            .await
            .expect("list tasks");
        assert_eq!(stored[0].due_date, Some(date("2024-06-12")));
    }

    #[tokio::test]
    async fn no_date_found_keeps_conflict_presented() {
        let tasks = vec![dated_task("t1", "2024-06-14", TaskMode::OnSite)];
        let fixture = fixture(&tasks).await;
        let coordinator = ConflictResolutionCoordinator::new(
            Arc::clone(&fixture.tasks),
            Arc::clone(&fixture.workdays),
        )
        .with_max_lookahead(2);
        let mut state = ResolutionState::new(USER);
        coordinator
            .begin(&mut state, &[change("2024-06-14", WorkMode::Off)])
            .await
            .expect("begin");

        let result = coordinator.propose_date(&mut state).await.expect("propose");

        assert_eq!(result, ActionResult::NoDateFound);
        assert_eq!(state.phase(), ResolutionPhase::Presenting { index: 0 });
    }

    #[tokio::test]
    async fn manual_selection_closes_flow_with_task_id() {
        let fixture = fixture(&two_conflict_tasks()).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(&mut state, &[change("2024-06-10", WorkMode::Remote)])
            .await
            .expect("begin");

        let result = fixture
            .coordinator
            .choose_date_manually(&mut state)
            .expect("manual");

        assert_eq!(
            result,
            ActionResult::ManualDateSelection {
                task_id: "t1".to_string(),
                reload_required: false,
            }
        );
        assert_eq!(state.phase(), ResolutionPhase::Closed);
        assert!(fixture.workdays.batch_calls().is_empty());
    }

    #[tokio::test]
    async fn failed_final_write_after_durable_step_waits_for_retry() {
        let tasks = vec![dated_task("t1", "2024-06-10", TaskMode::OnSite)];
        let fixture = fixture(&tasks).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(&mut state, &[change("2024-06-10", WorkMode::Remote)])
            .await
            .expect("begin");
        fixture
            .coordinator
            .propose_date(&mut state)
            .await
            .expect("propose");

        fixture.workdays.fail_batches.store(1, Ordering::SeqCst);
        let failed = fixture.coordinator.accept_proposed_date(&mut state).await;
        assert!(matches!(failed, Err(InfraError::Persistence(_))));
        assert_eq!(state.phase(), ResolutionPhase::ReadyToCommit);

        let retried = fixture
            .coordinator
            .commit_pending(&mut state)
            .await
            .expect("retry");
        assert_eq!(
            retried,
            ActionResult::Resolved {
                committed: vec![change("2024-06-10", WorkMode::Remote)],
            }
        );
        assert_eq!(state.phase(), ResolutionPhase::AllResolved);
    }

    #[tokio::test]
    async fn failed_override_leaves_state_unchanged() {
        let tasks = vec![dated_task("t1", "2024-06-10", TaskMode::Remote)];
        let fixture = fixture(&tasks).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(&mut state, &[change("2024-06-10", WorkMode::OnSite)])
            .await
            .expect("begin");
        let before = state.clone();

        fixture.workdays.fail_batches.store(1, Ordering::SeqCst);
        let failed = fixture.coordinator.confirm_anyway(&mut state).await;

        assert!(failed.is_err());
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn actions_outside_their_phase_are_rejected() {
        let fixture = fixture(&[]).await;
        let mut state = ResolutionState::new(USER);

        let early = fixture.coordinator.confirm_anyway(&mut state).await;
        assert!(matches!(early, Err(InfraError::InvalidState(_))));

        let clean = fixture
            .coordinator
            .begin(&mut state, &[change("2024-06-10", WorkMode::Remote)])
            .await
            .expect("begin");
        assert!(matches!(clean, ActionResult::Resolved { .. }));
        assert_eq!(state.phase(), ResolutionPhase::AllResolved);

        let accept = fixture.coordinator.accept_proposed_date(&mut state).await;
        assert!(matches!(accept, Err(InfraError::InvalidState(_))));
    }

    #[tokio::test]
    async fn mode_change_that_undoes_an_earlier_one_on_the_same_date_is_refused() {
        let tasks = vec![
            dated_task("t1", "2024-06-10", TaskMode::OnSite),
            dated_task("t2", "2024-06-10", TaskMode::Remote),
        ];
        let fixture = fixture(&tasks).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(&mut state, &[change("2024-06-10", WorkMode::Off)])
            .await
            .expect("begin");

        let next = fixture
            .coordinator
            .change_workday_mode(&mut state)
            .await
            .expect("change first");
        match next {
            ActionResult::Next { index, conflict } => {
                assert_eq!(index, 1);
                assert_eq!(conflict.task_id, "t2");
                assert_eq!(conflict.work_mode, WorkMode::OnSite);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let before = state.clone();
        let refused = fixture.coordinator.change_workday_mode(&mut state).await;
        assert!(matches!(refused, Err(InfraError::InvalidState(_))));
        assert_eq!(state, before);
        assert_eq!(fixture.workdays.single_writes.load(Ordering::SeqCst), 1);

        let done = fixture
            .coordinator
            .confirm_anyway(&mut state)
            .await
            .expect("confirm second");
        assert_eq!(done, ActionResult::Resolved { committed: vec![] });
        assert_eq!(state.phase(), ResolutionPhase::AllResolved);
        let stored = fixture
            .workdays
            .get_work_mode(USER, date("2024-06-10"))
            .await
            .expect("read date");
        assert_eq!(stored, WorkMode::OnSite);
    }

    #[tokio::test]
    async fn shared_date_ends_violating_only_overridden_tasks() {
        let tasks = vec![
            dated_task("t1", "2024-06-10", TaskMode::OnSite),
            dated_task("t2", "2024-06-10", TaskMode::Remote),
            dated_task("t3", "2024-06-10", TaskMode::Any),
            dated_task("t4", "2024-06-10", TaskMode::OnSite),
        ];
        let fixture = fixture(&tasks).await;
        let mut state = ResolutionState::new(USER);
        fixture
            .coordinator
            .begin(&mut state, &[change("2024-06-10", WorkMode::Off)])
            .await
            .expect("begin");
        assert_eq!(state.conflicts().len(), 4);

        fixture
            .coordinator
            .change_workday_mode(&mut state)
            .await
            .expect("change first");
        assert_eq!(state.resolution(2), Some(Resolution::ModeChanged(WorkMode::OnSite)));
        assert_eq!(state.resolution(3), Some(Resolution::ModeChanged(WorkMode::OnSite)));

        let done = fixture
            .coordinator
            .confirm_anyway(&mut state)
            .await
            .expect("confirm second");
        assert!(matches!(done, ActionResult::Resolved { .. }));
        assert_eq!(state.phase(), ResolutionPhase::AllResolved);
        assert!(fixture.workdays.batch_calls().is_empty());

        let stored = fixture
            .workdays
            .get_work_mode(USER, date("2024-06-10"))
            .await
            .expect("read date");
        for (index, conflict) in state.conflicts().iter().enumerate() {
            if state.resolution(index) != Some(Resolution::Overridden) {
                assert!(
                    conflict.task_mode.is_compatible_with(stored),
                    "task {} violated by {stored:?}",
                    conflict.task_id
                );
            }
        }
        assert_eq!(state.resolution(1), Some(Resolution::Overridden));
    }

    #[tokio::test]
    async fn single_date_update_reports_conflicts_unless_forced() {
        let fixture = fixture(&two_conflict_tasks()).await;

        let blocked = fixture
            .coordinator
            .update_workday_mode(USER, date("2024-06-10"), WorkMode::Remote, false)
            .await
            .expect("update");
        match blocked {
            WorkdayUpdateResult::Conflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].task_id, "t1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(fixture.workdays.single_writes.load(Ordering::SeqCst), 0);

        let forced = fixture
            .coordinator
            .update_workday_mode(USER, date("2024-06-10"), WorkMode::Remote, true)
            .await
            .expect("forced update");
        assert_eq!(forced, WorkdayUpdateResult::Ok);
        assert_eq!(fixture.workdays.single_writes.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn confirming_every_conflict_writes_each_date_once(count in 1usize..12) {
            let runtime = tokio::runtime::Runtime::new().expect("runtime");
            runtime.block_on(async move {
                let start = date("2024-07-01");
                let tasks = (0..count)
                    .map(|offset| {
                        let mut task = dated_task(&format!("t{offset}"), "2024-07-01", TaskMode::OnSite);
                        task.due_date = Some(start + chrono::Duration::days(offset as i64));
                        task
                    })
                    .collect::<Vec<_>>();
                let changes = (0..count)
                    .map(|offset| WorkdayChange {
                        date: start + chrono::Duration::days(offset as i64),
                        mode: WorkMode::Off,
                    })
                    .collect::<Vec<_>>();
                let fixture = fixture(&tasks).await;
                let mut state = ResolutionState::new(USER);

                fixture.coordinator.begin(&mut state, &changes).await.expect("begin");
                let mut last = None;
                for _ in 0..count {
                    last = Some(
                        fixture.coordinator.confirm_anyway(&mut state).await.expect("confirm"),
                    );
                }

                assert!(matches!(last, Some(ActionResult::Resolved { .. })));
                assert_eq!(state.phase(), ResolutionPhase::AllResolved);
                let calls = fixture.workdays.batch_calls();
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].len(), count);
                assert_eq!(fixture.workdays.single_writes.load(Ordering::SeqCst), 0);
            });
        }
    }
}

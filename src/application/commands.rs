use crate::application::bootstrap::bootstrap_workspace;
use crate::application::conflict_resolution::{
    ActionResult, ConflictResolutionCoordinator, ResolutionPhase, ResolutionState,
    WorkdayUpdateResult,
};
use crate::application::reorder::OrderMergeService;
use crate::domain::models::{
    DisplayOrderAssignment, Frequency, ModeConflict, Task, TaskCategory, TaskMode, WorkMode,
    Workday, WorkdayChange, parse_date,
};
use crate::infrastructure::config::{load_workday_calendar, read_date_proposal_lookahead};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::{SqliteTaskRepository, TaskRepository};
use crate::infrastructure::workday_repository::{SqliteWorkdayRepository, WorkdayRepository};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    tasks: Arc<SqliteTaskRepository>,
    workdays: Arc<SqliteWorkdayRepository>,
    date_proposal_lookahead: u32,
    resolutions: Mutex<HashMap<String, ResolutionState>>,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let calendar = load_workday_calendar(&bootstrap.config_dir)?;
        let date_proposal_lookahead = read_date_proposal_lookahead(&bootstrap.config_dir)?;

        Ok(Self {
            tasks: Arc::new(SqliteTaskRepository::new(&bootstrap.database_path)),
            workdays: Arc::new(SqliteWorkdayRepository::new(
                &bootstrap.database_path,
                calendar,
            )),
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            logs_dir: bootstrap.logs_dir,
            date_proposal_lookahead,
            resolutions: Mutex::new(HashMap::new()),
            log_guard: Mutex::new(()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }

    fn coordinator(
        &self,
    ) -> ConflictResolutionCoordinator<SqliteTaskRepository, SqliteWorkdayRepository> {
        ConflictResolutionCoordinator::new(Arc::clone(&self.tasks), Arc::clone(&self.workdays))
            .with_max_lookahead(self.date_proposal_lookahead)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkdayChangeRequest {
    pub date: String,
    pub mode: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    ChangeWorkdayMode,
    ProposeDate,
    AcceptProposedDate,
    ChooseDateManually,
    ConfirmAnyway,
    Cancel,
    CommitPending,
}

impl ConflictAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "change_workday_mode" => Some(Self::ChangeWorkdayMode),
            "propose_date" => Some(Self::ProposeDate),
            "accept_proposed_date" => Some(Self::AcceptProposedDate),
            "choose_date_manually" => Some(Self::ChooseDateManually),
            "confirm_anyway" => Some(Self::ConfirmAnyway),
            "cancel" => Some(Self::Cancel),
            "commit_pending" => Some(Self::CommitPending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionResponse {
    pub result: ActionResult,
    #[serde(flatten)]
    pub phase: ResolutionPhase,
    pub current_conflict: Option<ModeConflict>,
    pub pending_changes: Vec<WorkdayChange>,
    pub reload_required: bool,
}

impl ResolutionResponse {
    fn new(result: ActionResult, resolution: &ResolutionState) -> Self {
        Self {
            result,
            phase: resolution.phase(),
            current_conflict: resolution.current_conflict().cloned(),
            pending_changes: resolution.pending_changes(),
            reload_required: resolution.has_durable_writes(),
        }
    }
}

pub async fn create_task_impl(
    state: &AppState,
    user_id: String,
    title: String,
    description: Option<String>,
    frequency: Option<String>,
    due_date: Option<String>,
    mode: Option<String>,
) -> Result<Task, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let title = title.trim();
    if title.is_empty() {
        return Err(InfraError::Validation("title must not be empty".to_string()));
    }

    let frequency = frequency
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            Frequency::parse(value)
                .ok_or_else(|| InfraError::Validation(format!("unknown frequency: {value}")))
        })
        .transpose()?;
    let due_date = due_date
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(|value| parse_date(value, "due_date").map_err(InfraError::Validation))
        .transpose()?;
    let mode = match mode.as_deref().map(str::trim) {
        None | Some("") => TaskMode::default(),
        Some(value) => parse_task_mode(value)?,
    };

    let task = Task {
        id: next_id("tsk"),
        title: title.to_string(),
        description: description
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned),
        frequency,
        due_date,
        mode,
        display_order: None,
        created_at: Utc::now(),
    };
    state.tasks.insert_task(user_id, &task).await?;

    state.log_info(
        "create_task",
        &format!(
            "created task_id={} category={}",
            task.id,
            task.category().as_str()
        ),
    );
    Ok(task)
}

/// Tasks of one category, or every category in periodic, specific,
/// open-ended order, each sorted by display order.
pub async fn list_tasks_impl(
    state: &AppState,
    user_id: String,
    category: Option<String>,
) -> Result<Vec<Task>, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let categories = match category.as_deref().map(str::trim) {
        None | Some("") => vec![
            TaskCategory::Periodic,
            TaskCategory::Specific,
            TaskCategory::OpenEnded,
        ],
        Some(value) => vec![parse_category(value)?],
    };

    let mut tasks = Vec::new();
    for category in categories {
        tasks.extend(
            state
                .tasks
                .list_category_tasks_ordered(user_id, category)
                .await?,
        );
    }
    Ok(tasks)
}

pub async fn reorder_tasks_impl(
    state: &AppState,
    user_id: String,
    category: String,
    task_ids: Vec<String>,
) -> Result<Vec<DisplayOrderAssignment>, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let category = parse_category(&category)?;

    let assignments = OrderMergeService::new(Arc::clone(&state.tasks))
        .merge(user_id, category, &task_ids)
        .await?;

    state.log_info(
        "reorder_tasks",
        &format!(
            "category={} moved={} written={}",
            category.as_str(),
            task_ids.len(),
            assignments.len()
        ),
    );
    Ok(assignments)
}

pub async fn get_workday_mode_impl(
    state: &AppState,
    user_id: String,
    date: String,
) -> Result<Workday, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let date = parse_date(&date, "date").map_err(InfraError::Validation)?;
    let mode = state.workdays.get_work_mode(user_id, date).await?;
    Ok(Workday {
        user_id: user_id.to_string(),
        date,
        mode,
    })
}

pub async fn list_month_workdays_impl(
    state: &AppState,
    user_id: String,
    year: i32,
    month: u32,
) -> Result<Vec<Workday>, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let mut workdays = Vec::new();
    for date in month_dates(year, month)? {
        let mode = state.workdays.get_work_mode(user_id, date).await?;
        workdays.push(Workday {
            user_id: user_id.to_string(),
            date,
            mode,
        });
    }
    Ok(workdays)
}

pub async fn set_workday_mode_impl(
    state: &AppState,
    user_id: String,
    date: String,
    mode: String,
    force: bool,
) -> Result<WorkdayUpdateResult, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let date = parse_date(&date, "date").map_err(InfraError::Validation)?;
    let mode = parse_work_mode(&mode)?;

    let result = state
        .coordinator()
        .update_workday_mode(user_id, date, mode, force)
        .await?;

    match &result {
        WorkdayUpdateResult::Ok => state.log_info(
            "set_workday_mode",
            &format!("date={date} mode={} force={force}", mode.as_str()),
        ),
        WorkdayUpdateResult::Conflict { conflicts } => state.log_info(
            "set_workday_mode",
            &format!("date={date} blocked by {} conflicts", conflicts.len()),
        ),
    }
    Ok(result)
}

pub async fn begin_workday_changes_impl(
    state: &AppState,
    user_id: String,
    changes: Vec<WorkdayChangeRequest>,
) -> Result<ResolutionResponse, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let changes = changes
        .iter()
        .map(|change| {
            Ok(WorkdayChange {
                date: parse_date(&change.date, "date").map_err(InfraError::Validation)?,
                mode: parse_work_mode(&change.mode)?,
            })
        })
        .collect::<Result<Vec<_>, InfraError>>()?;

    begin_resolution(state, "begin_workday_changes", user_id, &changes).await
}

/// Applies one mode to every day of a month through the conflict flow.
pub async fn set_month_work_mode_impl(
    state: &AppState,
    user_id: String,
    year: i32,
    month: u32,
    mode: String,
) -> Result<ResolutionResponse, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let mode = parse_work_mode(&mode)?;
    let changes = month_dates(year, month)?
        .into_iter()
        .map(|date| WorkdayChange { date, mode })
        .collect::<Vec<_>>();

    begin_resolution(state, "set_month_work_mode", user_id, &changes).await
}

pub async fn resolve_conflict_impl(
    state: &AppState,
    user_id: String,
    action: String,
) -> Result<ResolutionResponse, InfraError> {
    let user_id = required_user_id(&user_id)?;
    let action = ConflictAction::parse(&action)
        .ok_or_else(|| InfraError::Validation(format!("unknown conflict action: {action}")))?;

    let mut resolution = {
        let mut resolutions = lock_resolutions(state)?;
        match resolutions.get(user_id).map(ResolutionState::phase) {
            None => {
                return Err(InfraError::InvalidState(format!(
                    "no workday resolution in progress for {user_id}"
                )));
            }
            Some(ResolutionPhase::Idle) => {
                return Err(InfraError::InvalidState(format!(
                    "workday resolution for {user_id} is still starting"
                )));
            }
            Some(_) => {}
        }
        resolutions.remove(user_id).ok_or_else(|| {
            InfraError::InvalidState(format!("no workday resolution in progress for {user_id}"))
        })?
    };

    let coordinator = state.coordinator();
    let outcome = match action {
        ConflictAction::ChangeWorkdayMode => coordinator.change_workday_mode(&mut resolution).await,
        ConflictAction::ProposeDate => coordinator.propose_date(&mut resolution).await,
        ConflictAction::AcceptProposedDate => {
            coordinator.accept_proposed_date(&mut resolution).await
        }
        ConflictAction::ChooseDateManually => coordinator.choose_date_manually(&mut resolution),
        ConflictAction::ConfirmAnyway => coordinator.confirm_anyway(&mut resolution).await,
        ConflictAction::Cancel => coordinator.cancel(&mut resolution),
        ConflictAction::CommitPending => coordinator.commit_pending(&mut resolution).await,
    };

    let response = outcome.map(|result| ResolutionResponse::new(result, &resolution));
    let phase = resolution.phase();
    if !phase.is_finished() {
        lock_resolutions(state)?.insert(user_id.to_string(), resolution);
    }

    let response = response?;
    state.log_info(
        "resolve_conflict",
        &format!("user_id={user_id} phase={}", phase.as_str()),
    );
    Ok(response)
}

async fn begin_resolution(
    state: &AppState,
    command: &str,
    user_id: &str,
    changes: &[WorkdayChange],
) -> Result<ResolutionResponse, InfraError> {
    {
        let mut resolutions = lock_resolutions(state)?;
        if resolutions.contains_key(user_id) {
            return Err(InfraError::InvalidState(format!(
                "a workday resolution is already in progress for {user_id}"
            )));
        }
        // Idle entry reserves the session while the batch is being started.
        resolutions.insert(user_id.to_string(), ResolutionState::new(user_id));
    }

    let mut resolution = ResolutionState::new(user_id);
    let result = match state.coordinator().begin(&mut resolution, changes).await {
        Ok(result) => result,
        Err(error) => {
            lock_resolutions(state)?.remove(user_id);
            return Err(error);
        }
    };
    let response = ResolutionResponse::new(result, &resolution);

    state.log_info(
        command,
        &format!(
            "user_id={user_id} changes={} conflicts={}",
            changes.len(),
            resolution.conflicts().len()
        ),
    );
    let mut resolutions = lock_resolutions(state)?;
    if resolution.phase().is_finished() {
        resolutions.remove(user_id);
    } else {
        resolutions.insert(user_id.to_string(), resolution);
    }
    Ok(response)
}

fn lock_resolutions(
    state: &AppState,
) -> Result<MutexGuard<'_, HashMap<String, ResolutionState>>, InfraError> {
    state
        .resolutions
        .lock()
        .map_err(|error| InfraError::InvalidState(format!("resolution lock poisoned: {error}")))
}

fn required_user_id(value: &str) -> Result<&str, InfraError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(InfraError::Validation("user_id must not be empty".to_string()));
    }
    Ok(value)
}

fn parse_category(value: &str) -> Result<TaskCategory, InfraError> {
    TaskCategory::parse(value)
        .ok_or_else(|| InfraError::Validation(format!("unknown category: {value}")))
}

fn parse_task_mode(value: &str) -> Result<TaskMode, InfraError> {
    TaskMode::parse(value)
        .ok_or_else(|| InfraError::Validation(format!("unknown task mode: {value}")))
}

fn parse_work_mode(value: &str) -> Result<WorkMode, InfraError> {
    WorkMode::parse(value)
        .ok_or_else(|| InfraError::Validation(format!("unknown work mode: {value}")))
}

fn month_dates(year: i32, month: u32) -> Result<Vec<NaiveDate>, InfraError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| InfraError::Validation(format!("invalid month: {year}-{month}")))?;
    Ok(first
        .iter_days()
        .take_while(|date| date.month() == month)
        .collect())
}

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{BootstrapResult, bootstrap_workspace};
pub use application::commands::{
    AppState, ConflictAction, ResolutionResponse, WorkdayChangeRequest,
    begin_workday_changes_impl, create_task_impl, get_workday_mode_impl,
    list_month_workdays_impl, list_tasks_impl, reorder_tasks_impl, resolve_conflict_impl,
    set_month_work_mode_impl, set_workday_mode_impl,
};
pub use application::conflict_resolution::{
    ActionResult, ConflictResolutionCoordinator, Resolution, ResolutionPhase, ResolutionState,
    WorkdayUpdateResult,
};
pub use application::date_proposer::{RepositoryWorkModes, WorkModeLookup, propose_date};
pub use application::reorder::OrderMergeService;
pub use domain::conflict::detect_conflicts;
pub use domain::models::{
    DisplayOrderAssignment, Frequency, ModeConflict, Task, TaskCategory, TaskMode, WorkMode,
    Workday, WorkdayCalendar, WorkdayChange,
};
pub use domain::order_merge::merge_display_orders;
pub use infrastructure::error::InfraError;

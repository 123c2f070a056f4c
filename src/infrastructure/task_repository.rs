use crate::domain::models::{
    DisplayOrderAssignment, Frequency, Task, TaskCategory, TaskMode, sort_by_display_order,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Row, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError>;

    async fn list_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError>;

    /// Tasks of one category, ascending by display order with unordered tasks last.
    async fn list_category_tasks_ordered(
        &self,
        user_id: &str,
        category: TaskCategory,
    ) -> Result<Vec<Task>, InfraError> {
        let mut tasks = self
            .list_tasks_for_user(user_id)
            .await?
            .into_iter()
            .filter(|task| task.category() == category)
            .collect::<Vec<_>>();
        sort_by_display_order(&mut tasks);
        Ok(tasks)
    }

    async fn write_display_order(
        &self,
        user_id: &str,
        task_id: &str,
        display_order: i64,
    ) -> Result<(), InfraError>;

    /// Per-row fallback: every row is attempted and failures are reported together.
    /// Rows that were written stay written.
    async fn write_display_orders(
        &self,
        user_id: &str,
        assignments: &[DisplayOrderAssignment],
    ) -> Result<(), InfraError> {
        let mut failures = Vec::new();
        for assignment in assignments {
            if let Err(error) = self
                .write_display_order(user_id, &assignment.id, assignment.display_order)
                .await
            {
                failures.push(format!("{}: {error}", assignment.id));
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        Err(InfraError::Persistence(format!(
            "failed to write {} of {} display orders: {}",
            failures.len(),
            assignments.len(),
            failures.join("; ")
        )))
    }

    async fn update_task_due_date(
        &self,
        user_id: &str,
        task_id: &str,
        due_date: NaiveDate,
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    db_path: PathBuf,
}

impl SqliteTaskRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn insert_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError> {
        task.validate().map_err(InfraError::Validation)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO tasks (id, user_id, title, description, frequency, due_date, mode, display_order, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                user_id,
                task.title,
                task.description,
                task.frequency.map(Frequency::as_str),
                task.due_date.map(|date| date.to_string()),
                task.mode.as_str(),
                task.display_order,
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn list_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT id, title, description, frequency, due_date, mode, display_order, created_at
             FROM tasks WHERE user_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = statement
            .query_map(params![user_id], read_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StoredTaskRow::into_task).collect()
    }

    async fn write_display_order(
        &self,
        user_id: &str,
        task_id: &str,
        display_order: i64,
    ) -> Result<(), InfraError> {
        let connection = self.connect()?;
        update_display_order(&connection, user_id, task_id, display_order)
    }

    async fn write_display_orders(
        &self,
        user_id: &str,
        assignments: &[DisplayOrderAssignment],
    ) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        for assignment in assignments {
            update_display_order(
                &transaction,
                user_id,
                &assignment.id,
                assignment.display_order,
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    async fn update_task_due_date(
        &self,
        user_id: &str,
        task_id: &str,
        due_date: NaiveDate,
    ) -> Result<(), InfraError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE tasks SET due_date = ?1 WHERE id = ?2 AND user_id = ?3",
            params![due_date.to_string(), task_id, user_id],
        )?;
        if changed == 0 {
            return Err(InfraError::Persistence(format!("task not found: {task_id}")));
        }
        Ok(())
    }
}

fn update_display_order(
    connection: &Connection,
    user_id: &str,
    task_id: &str,
    display_order: i64,
) -> Result<(), InfraError> {
    let changed = connection.execute(
        "UPDATE tasks SET display_order = ?1 WHERE id = ?2 AND user_id = ?3",
        params![display_order, task_id, user_id],
    )?;
    if changed == 0 {
        return Err(InfraError::Persistence(format!("task not found: {task_id}")));
    }
    Ok(())
}

struct StoredTaskRow {
    id: String,
    title: String,
    description: Option<String>,
    frequency: Option<String>,
    due_date: Option<String>,
    mode: String,
    display_order: Option<i64>,
    created_at: String,
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<StoredTaskRow> {
    Ok(StoredTaskRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        frequency: row.get(3)?,
        due_date: row.get(4)?,
        mode: row.get(5)?,
        display_order: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl StoredTaskRow {
    fn into_task(self) -> Result<Task, InfraError> {
        let invalid = |field: &str, value: &str| {
            InfraError::Persistence(format!("invalid tasks.{field} '{value}' for task {}", self.id))
        };

        let frequency = match self.frequency.as_deref() {
            Some(raw) => Some(Frequency::parse(raw).ok_or_else(|| invalid("frequency", raw))?),
            None => None,
        };
        let due_date = match self.due_date.as_deref() {
            Some(raw) => Some(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid("due_date", raw))?,
            ),
            None => None,
        };
        let mode = TaskMode::parse(&self.mode).ok_or_else(|| invalid("mode", &self.mode))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|_| invalid("created_at", &self.created_at))?
            .with_timezone(&Utc);

        Ok(Task {
            id: self.id,
            title: self.title,
            description: self.description,
            frequency,
            due_date,
            mode,
            display_order: self.display_order,
            created_at,
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<String, Vec<Task>>>,
}

impl InMemoryTaskRepository {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Task>>>, InfraError> {
        self.tasks
            .lock()
            .map_err(|error| InfraError::Persistence(format!("task store lock poisoned: {error}")))
    }

    fn with_task<F>(&self, user_id: &str, task_id: &str, update: F) -> Result<(), InfraError>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.lock()?;
        let task = tasks
            .get_mut(user_id)
            .and_then(|owned| owned.iter_mut().find(|task| task.id == task_id))
            .ok_or_else(|| InfraError::Persistence(format!("task not found: {task_id}")))?;
        update(task);
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn insert_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError> {
        task.validate().map_err(InfraError::Validation)?;
        let mut tasks = self.lock()?;
        let owned = tasks.entry(user_id.to_string()).or_default();
        if owned.iter().any(|existing| existing.id == task.id) {
            return Err(InfraError::Persistence(format!("task already exists: {}", task.id)));
        }
        owned.push(task.clone());
        Ok(())
    }

    async fn list_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let tasks = self.lock()?;
        Ok(tasks.get(user_id).cloned().unwrap_or_default())
    }

    async fn write_display_order(
        &self,
        user_id: &str,
        task_id: &str,
        display_order: i64,
    ) -> Result<(), InfraError> {
        self.with_task(user_id, task_id, |task| task.display_order = Some(display_order))
    }

    async fn update_task_due_date(
        &self,
        user_id: &str,
        task_id: &str,
        due_date: NaiveDate,
    ) -> Result<(), InfraError> {
        self.with_task(user_id, task_id, |task| task.due_date = Some(due_date))
    }
}

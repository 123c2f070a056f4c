use crate::domain::models::{WorkMode, Workday, WorkdayCalendar, WorkdayChange};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait WorkdayRepository: Send + Sync {
    /// Stored mode for the date, or the computed default when no row exists.
    async fn get_work_mode(&self, user_id: &str, date: NaiveDate) -> Result<WorkMode, InfraError>;

    async fn set_work_mode(
        &self,
        user_id: &str,
        date: NaiveDate,
        mode: WorkMode,
    ) -> Result<(), InfraError>;

    async fn set_work_modes_batch(
        &self,
        user_id: &str,
        changes: &[WorkdayChange],
    ) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteWorkdayRepository {
    db_path: PathBuf,
    calendar: WorkdayCalendar,
}

impl SqliteWorkdayRepository {
    pub fn new(db_path: impl AsRef<Path>, calendar: WorkdayCalendar) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            calendar,
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

fn validate_workday(user_id: &str, date: NaiveDate, mode: WorkMode) -> Result<(), InfraError> {
    Workday {
        user_id: user_id.to_string(),
        date,
        mode,
    }
    .validate()
    .map_err(InfraError::Validation)
}

fn upsert_workday(
    connection: &Connection,
    user_id: &str,
    date: NaiveDate,
    mode: WorkMode,
) -> Result<(), InfraError> {
    validate_workday(user_id, date, mode)?;
    connection.execute(
        "INSERT INTO workdays (user_id, date, mode)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id, date) DO UPDATE SET mode = excluded.mode",
        params![user_id, date.to_string(), mode.as_str()],
    )?;
    Ok(())
}

#[async_trait]
impl WorkdayRepository for SqliteWorkdayRepository {
    async fn get_work_mode(&self, user_id: &str, date: NaiveDate) -> Result<WorkMode, InfraError> {
        let connection = self.connect()?;
        let stored: Option<String> = connection
            .query_row(
                "SELECT mode FROM workdays WHERE user_id = ?1 AND date = ?2",
                params![user_id, date.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(raw) => WorkMode::parse(&raw).ok_or_else(|| {
                InfraError::Persistence(format!("invalid workdays.mode '{raw}' for {date}"))
            }),
            None => Ok(self.calendar.default_mode(date)),
        }
    }

    async fn set_work_mode(
        &self,
        user_id: &str,
        date: NaiveDate,
        mode: WorkMode,
    ) -> Result<(), InfraError> {
        let connection = self.connect()?;
        upsert_workday(&connection, user_id, date, mode)
    }

    async fn set_work_modes_batch(
        &self,
        user_id: &str,
        changes: &[WorkdayChange],
    ) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        for change in changes {
            upsert_workday(&transaction, user_id, change.date, change.mode)?;
        }
        transaction.commit()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkdayRepository {
    calendar: WorkdayCalendar,
    modes: Mutex<HashMap<(String, NaiveDate), WorkMode>>,
}

impl InMemoryWorkdayRepository {
    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, NaiveDate), WorkMode>>, InfraError> {
        self.modes
            .lock()
            .map_err(|error| InfraError::Persistence(format!("workday store lock poisoned: {error}")))
    }
}

#[async_trait]
impl WorkdayRepository for InMemoryWorkdayRepository {
    async fn get_work_mode(&self, user_id: &str, date: NaiveDate) -> Result<WorkMode, InfraError> {
        let modes = self.lock()?;
        Ok(modes
            .get(&(user_id.to_string(), date))
            .copied()
            .unwrap_or_else(|| self.calendar.default_mode(date)))
    }

    async fn set_work_mode(
        &self,
        user_id: &str,
        date: NaiveDate,
        mode: WorkMode,
    ) -> Result<(), InfraError> {
        validate_workday(user_id, date, mode)?;
        self.lock()?.insert((user_id.to_string(), date), mode);
        Ok(())
    }

    async fn set_work_modes_batch(
        &self,
        user_id: &str,
        changes: &[WorkdayChange],
    ) -> Result<(), InfraError> {
        for change in changes {
            validate_workday(user_id, change.date, change.mode)?;
        }
        let mut modes = self.lock()?;
        for change in changes {
            modes.insert((user_id.to_string(), change.date), change.mode);
        }
        Ok(())
    }
}

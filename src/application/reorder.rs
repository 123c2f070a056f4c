use crate::domain::models::{DisplayOrderAssignment, TaskCategory};
use crate::domain::order_merge::merge_display_orders;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::task_repository::TaskRepository;
use std::sync::Arc;
use tracing::{debug, info};

pub struct OrderMergeService<R>
where
    R: TaskRepository,
{
    task_repository: Arc<R>,
}

impl<R> OrderMergeService<R>
where
    R: TaskRepository,
{
    pub fn new(task_repository: Arc<R>) -> Self {
        Self { task_repository }
    }

    /// Applies a partial reorder to one category and persists the new orders.
    ///
    /// The category is read once; a task changing category between this read
    /// and the write is not detected.
    pub async fn merge(
        &self,
        user_id: &str,
        category: TaskCategory,
        reordered_ids: &[String],
    ) -> Result<Vec<DisplayOrderAssignment>, InfraError> {
        if reordered_ids.is_empty() {
            debug!(user_id, category = category.as_str(), "empty reorder, nothing to write");
            return Ok(Vec::new());
        }

        let tasks = self
            .task_repository
            .list_category_tasks_ordered(user_id, category)
            .await?;
        let assignments =
            merge_display_orders(&tasks, reordered_ids).map_err(InfraError::Validation)?;

        self.task_repository
            .write_display_orders(user_id, &assignments)
            .await?;

        info!(
            user_id,
            category = category.as_str(),
            moved = reordered_ids.len(),
            total = assignments.len(),
            "display orders rewritten"
        );
        Ok(assignments)
    }
}

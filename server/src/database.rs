// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use common::{
    NewTask, Recurrence, Task, TaskError, TaskField, TaskRow, TaskStatus, format_task_time,
    normalize_name,
};
use sqlx::query::QueryAs;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, migrate::MigrateDatabase};
use tracing::{debug, info, warn};

use crate::store::TaskStore;

const CREATE_TASKS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner INTEGER NOT NULL,
        name TEXT NOT NULL,
        task_date TEXT NOT NULL,
        task_time TEXT NOT NULL,
        recurrence TEXT NOT NULL DEFAULT 'once',
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TIMESTAMP NOT NULL
    );
"#;

const CREATE_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_owner_date ON tasks (owner, task_date);";

const TASK_COLUMNS: &str = "id, owner, name, task_date, task_time, recurrence, status, created_at";

/// Establishes the database connection pool.
/// If the database (or its directory) does not exist, it is created.
pub async fn establish_connection_pool(database_url: &str) -> Result<SqlitePool> {
    if let Some(parent) = database_file(database_url).and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }

    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        info!("Creating database {}", database_url);
        Sqlite::create_database(database_url)
            .await
            .context("Failed to create database")?;
    } else {
        info!("Database already exists.");
    }

    let pool = SqlitePool::connect(database_url)
        .await
        .context("Failed to connect to database")?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Opens a private in-memory database with the schema applied.
/// A single connection is used so every query sees the same database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory database")?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Ensures the `tasks` table and its index exist.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_TASKS_TABLE)
        .execute(pool)
        .await
        .context("Failed to create 'tasks' table")?;
    sqlx::query(CREATE_OWNER_INDEX)
        .execute(pool)
        .await
        .context("Failed to create 'tasks' index")?;

    info!("'tasks' table is ready.");
    Ok(())
}

fn database_file(database_url: &str) -> Option<&Path> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Some(Path::new(path))
}

/// Converts raw rows into tasks, logging and dropping the ones that don't decode.
fn decode_rows(rows: Vec<TaskRow>) -> Vec<Task> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match Task::try_from(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("Skipping malformed task {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

/// `TaskStore` backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_tasks<'q>(
        &self,
        query: QueryAs<'q, Sqlite, TaskRow, SqliteArguments<'q>>,
        what: &str,
    ) -> Result<Vec<Task>> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to retrieve {what} from DB"))?;
        Ok(decode_rows(rows))
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn get_due_or_recurring(&self, as_of: NaiveDate) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_date <= ? OR recurrence != 'once' ORDER BY id ASC"
        );
        let query = sqlx::query_as::<_, TaskRow>(&sql).bind(as_of.to_string());
        self.fetch_tasks(query, "due or recurring tasks").await
    }

    async fn get_overdue_marked(&self) -> Result<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY id ASC");
        let query = sqlx::query_as::<_, TaskRow>(&sql).bind(TaskStatus::Overdue.as_str());
        self.fetch_tasks(query, "overdue tasks").await
    }

    async fn update_field(&self, id: i64, field: TaskField, value: &str) -> Result<bool> {
        let value = field.canonicalize(value)?;
        debug!("Updating task {}: {} = {}", id, field.column(), value);

        // The column name comes from a closed enum, never from user input.
        let sql = format!("UPDATE tasks SET {} = ? WHERE id = ?", field.column());
        let result = sqlx::query(&sql)
            .bind(&value)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update {} of task {}", field.column(), id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert(&self, task: NewTask) -> Result<i64> {
        let name = normalize_name(&task.name);
        if name.is_empty() {
            return Err(TaskError::EmptyName.into());
        }
        let created_at = Utc::now();

        debug!(
            "Insert values: owner={}, name={}, date={}, time={}, recurrence={}",
            task.owner, name, task.scheduled_date, task.scheduled_time, task.recurrence
        );

        let id = sqlx::query(
            "INSERT INTO tasks (owner, name, task_date, task_time, recurrence, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.owner)
        .bind(&name)
        .bind(task.scheduled_date.to_string())
        .bind(format_task_time(task.scheduled_time))
        .bind(task.recurrence.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert task into DB")?
        .last_insert_rowid();

        Ok(id)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete task with ID: {id}"))?;

        let rows_affected = result.rows_affected();
        info!("Deleted {} rows for task ID: {}", rows_affected, id);

        Ok(rows_affected > 0)
    }

    async fn list_distinct_owners(&self) -> Result<BTreeSet<i64>> {
        let owners: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT owner FROM tasks")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list task owners")?;
        Ok(owners.into_iter().collect())
    }

    async fn count_similar(
        &self,
        owner: i64,
        name: &str,
        time: NaiveTime,
        recurrence: Recurrence,
    ) -> Result<usize> {
        // Names and times are compared after decoding so that legacy rows
        // ("❌ " prefix, unpadded hour) still count as the same task.
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ? AND recurrence = ?");
        let query = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(owner)
            .bind(recurrence.as_str());
        let name = normalize_name(name);

        let count = self
            .fetch_tasks(query, "similar tasks")
            .await?
            .iter()
            .filter(|t| t.scheduled_time == time && t.name == name)
            .count();
        Ok(count)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to retrieve task {id}"))?;

        row.map(Task::try_from)
            .transpose()
            .with_context(|| format!("Task {id} is malformed"))
    }

    async fn get_tasks_for_owner(
        &self,
        owner: i64,
        max_date: Option<NaiveDate>,
    ) -> Result<Vec<Task>> {
        match max_date {
            Some(max_date) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ? AND task_date <= ? ORDER BY task_date ASC, task_time ASC, id ASC"
                );
                let query = sqlx::query_as::<_, TaskRow>(&sql)
                    .bind(owner)
                    .bind(max_date.to_string());
                self.fetch_tasks(query, "owner tasks").await
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ? ORDER BY task_date ASC, task_time ASC, id ASC"
                );
                let query = sqlx::query_as::<_, TaskRow>(&sql).bind(owner);
                self.fetch_tasks(query, "owner tasks").await
            }
        }
    }

    async fn get_tasks_by_date(&self, owner: i64, date: NaiveDate) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ? AND task_date = ? ORDER BY task_time ASC, id ASC"
        );
        let query = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(owner)
            .bind(date.to_string());
        self.fetch_tasks(query, "tasks by date").await
    }

    async fn find_by_name_prefix(&self, owner: i64, prefix: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE owner = ? AND substr(name, 1, length(?)) = ? ORDER BY id ASC"
        );
        let query = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(owner)
            .bind(prefix)
            .bind(prefix);
        self.fetch_tasks(query, "tasks by name prefix").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::parse_task_time;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn new_task(owner: i64, name: &str, day: NaiveDate, time: &str, recurrence: Recurrence) -> NewTask {
        NewTask {
            owner,
            name: name.to_string(),
            scheduled_date: day,
            scheduled_time: parse_task_time(time).unwrap(),
            recurrence,
        }
    }

    /// Helper function to set up an in-memory SQLite store for testing.
    /// This creates a fresh, empty database for each test, ensuring they are isolated.
    async fn setup_test_store() -> SqliteTaskStore {
        SqliteTaskStore::new(connect_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_get_task() {
        let store = setup_test_store().await;

        // Act: Create a new task in the test database
        let id = store
            .insert(new_task(7, "  Water plants ", date(2024, 3, 1), "8:30", Recurrence::Weekly))
            .await
            .unwrap();

        // Assert: The stored task is normalized and pending
        let task = store.get_task(id).await.unwrap().unwrap();
        assert!(id > 0);
        assert_eq!(task.owner, 7);
        assert_eq!(task.name, "Water plants");
        assert_eq!(task.scheduled_date, date(2024, 3, 1));
        assert_eq!(task.time_label(), "08:30");
        assert_eq!(task.recurrence, Recurrence::Weekly);
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(store.get_task(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_empty_name() {
        let store = setup_test_store().await;
        let err = store
            .insert(new_task(7, "   ", date(2024, 3, 1), "8:30", Recurrence::Once))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<TaskError>(), Some(&TaskError::EmptyName));
    }

    #[tokio::test]
    async fn test_get_due_or_recurring_filters_and_orders() {
        let store = setup_test_store().await;
        let today = date(2024, 6, 10);

        let past = store.insert(new_task(1, "Past", date(2024, 6, 1), "10:00", Recurrence::Once)).await.unwrap();
        let future_once = store.insert(new_task(1, "Future once", date(2024, 7, 1), "10:00", Recurrence::Once)).await.unwrap();
        let future_daily = store.insert(new_task(2, "Future daily", date(2024, 7, 1), "10:00", Recurrence::Daily)).await.unwrap();
        let today_task = store.insert(new_task(2, "Today", today, "23:00", Recurrence::Once)).await.unwrap();

        let due = store.get_due_or_recurring(today).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|t| t.id).collect();

        assert_eq!(ids, vec![past, future_daily, today_task]);
        assert!(!ids.contains(&future_once));
    }

    #[tokio::test]
    async fn test_update_field_and_overdue_listing() {
        let store = setup_test_store().await;
        let id = store.insert(new_task(1, "Dentist", date(2024, 6, 1), "9:00", Recurrence::Once)).await.unwrap();

        assert!(store.get_overdue_marked().await.unwrap().is_empty());

        assert!(store.update_field(id, TaskField::Status, "overdue").await.unwrap());
        let overdue = store.get_overdue_marked().await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].display_name(), "❌ Dentist");

        // Idempotent: writing the same value again still reports the row.
        assert!(store.update_field(id, TaskField::Status, "overdue").await.unwrap());

        assert!(store.update_field(id, TaskField::Time, "7:45").await.unwrap());
        assert_eq!(store.get_task(id).await.unwrap().unwrap().time_label(), "07:45");

        assert!(!store.update_field(id + 1, TaskField::Name, "Ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_field_rejects_invalid_values_before_writing() {
        let store = setup_test_store().await;
        let id = store.insert(new_task(1, "Dentist", date(2024, 6, 1), "9:00", Recurrence::Once)).await.unwrap();

        let err = store.update_field(id, TaskField::Time, "25:00").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<TaskError>(),
            Some(&TaskError::InvalidTime("25:00".to_string()))
        );
        assert!(store.update_field(id, TaskField::Recurrence, "hourly").await.is_err());

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.time_label(), "09:00");
        assert_eq!(task.recurrence, Recurrence::Once);
    }

    #[tokio::test]
    async fn test_delete_task() {
        let store = setup_test_store().await;
        let id = store.insert(new_task(1, "Bin day", date(2024, 6, 1), "7:00", Recurrence::Weekly)).await.unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(store.get_task(id).await.unwrap().is_none());
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_distinct_owners() {
        let store = setup_test_store().await;
        for owner in [5, 3, 5, 9] {
            store.insert(new_task(owner, "Task", date(2024, 6, 1), "7:00", Recurrence::Once)).await.unwrap();
        }

        let owners = store.list_distinct_owners().await.unwrap();
        assert_eq!(owners.into_iter().collect::<Vec<_>>(), vec![3, 5, 9]);
    }

    #[tokio::test]
    async fn test_count_similar_matches_normalized_name_time_and_recurrence() {
        let store = setup_test_store().await;
        let time = parse_task_time("18:00").unwrap();

        store.insert(new_task(1, "Run", date(2024, 6, 1), "18:00", Recurrence::Daily)).await.unwrap();
        store.insert(new_task(1, "Run", date(2024, 6, 2), "18:00", Recurrence::Daily)).await.unwrap();
        store.insert(new_task(1, "Run", date(2024, 6, 2), "19:00", Recurrence::Daily)).await.unwrap();
        store.insert(new_task(1, "Run", date(2024, 6, 2), "18:00", Recurrence::Weekly)).await.unwrap();
        store.insert(new_task(2, "Run", date(2024, 6, 2), "18:00", Recurrence::Daily)).await.unwrap();

        // Legacy row written with the marker baked into the name.
        sqlx::query(
            "INSERT INTO tasks (owner, name, task_date, task_time, recurrence, status, created_at) VALUES (1, '❌ Run', '2024-05-31', '18:00', 'daily', 'overdue', ?)",
        )
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        let count = store.count_similar(1, "❌ Run", time, Recurrence::Daily).await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_owner_queries() {
        let store = setup_test_store().await;
        let today = date(2024, 6, 10);

        store.insert(new_task(1, "Later", date(2024, 6, 12), "9:00", Recurrence::Once)).await.unwrap();
        store.insert(new_task(1, "Missed", date(2024, 6, 9), "9:00", Recurrence::Once)).await.unwrap();
        store.insert(new_task(1, "Evening", today, "20:00", Recurrence::Once)).await.unwrap();
        store.insert(new_task(1, "Morning", today, "8:00", Recurrence::Once)).await.unwrap();
        store.insert(new_task(2, "Other owner", today, "8:00", Recurrence::Once)).await.unwrap();

        let all: Vec<String> = store.get_tasks_for_owner(1, None).await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(all, vec!["Missed", "Morning", "Evening", "Later"]);

        let up_to_today: Vec<String> = store.get_tasks_for_owner(1, Some(today)).await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(up_to_today, vec!["Missed", "Morning", "Evening"]);

        let on_day: Vec<String> = store.get_tasks_by_date(1, today).await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(on_day, vec!["Morning", "Evening"]);
    }

    #[tokio::test]
    async fn test_find_by_name_prefix_is_case_sensitive() {
        let store = setup_test_store().await;
        store.insert(new_task(1, "Pay rent", date(2024, 6, 1), "9:00", Recurrence::Monthly)).await.unwrap();
        store.insert(new_task(1, "Pay phone bill", date(2024, 6, 3), "9:00", Recurrence::Monthly)).await.unwrap();
        store.insert(new_task(1, "pay back Sam", date(2024, 6, 3), "9:00", Recurrence::Once)).await.unwrap();
        store.insert(new_task(2, "Pay rent", date(2024, 6, 1), "9:00", Recurrence::Monthly)).await.unwrap();

        let found = store.find_by_name_prefix(1, "Pay").await.unwrap();
        let names: Vec<&str> = found.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Pay rent", "Pay phone bill"]);
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let store = setup_test_store().await;
        let good = store.insert(new_task(1, "Good", date(2024, 6, 1), "9:00", Recurrence::Once)).await.unwrap();

        sqlx::query(
            "INSERT INTO tasks (owner, name, task_date, task_time, recurrence, status, created_at) VALUES (1, 'Bad time', '2024-06-01', '9h', 'once', 'pending', ?), (1, 'Bad recurrence', '2024-06-01', '09:00', 'hourly', 'pending', ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(store.pool())
        .await
        .unwrap();

        let due = store.get_due_or_recurring(date(2024, 6, 1)).await.unwrap();
        assert_eq!(due.iter().map(|t| t.id).collect::<Vec<_>>(), vec![good]);
    }

    #[tokio::test]
    async fn test_establish_connection_pool_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("taskbell.db");
        let url = format!("sqlite://{}", db_path.display());

        let pool = establish_connection_pool(&url).await.unwrap();
        let store = SqliteTaskStore::new(pool);
        store.insert(new_task(1, "Persisted", date(2024, 6, 1), "9:00", Recurrence::Once)).await.unwrap();

        assert!(db_path.exists());
        assert_eq!(store.list_distinct_owners().await.unwrap().len(), 1);
    }

    #[test]
    fn test_database_file_from_url() {
        assert_eq!(database_file("sqlite://database/taskbell.db"), Some(Path::new("database/taskbell.db")));
        assert_eq!(database_file("sqlite:tasks.db?mode=rwc"), Some(Path::new("tasks.db")));
        assert_eq!(database_file("sqlite::memory:"), None);
        assert_eq!(database_file("postgres://x"), None);
    }
}

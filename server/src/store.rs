// Copyright (c) 2025 sbksba
//
// This software is licensed under the terms of the MIT License.
// See the LICENSE file in the project root for the full license text.
use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use common::{NewTask, Recurrence, Task, TaskField};

/// Durable task storage used by the scheduler and the HTTP API.
///
/// Every list query returns tasks in a deterministic order and silently
/// drops (after logging) rows that cannot be decoded.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks dated on or before `as_of`, plus every recurring task, by ascending id.
    async fn get_due_or_recurring(&self, as_of: NaiveDate) -> Result<Vec<Task>>;

    /// Tasks currently flagged overdue, by ascending id.
    async fn get_overdue_marked(&self) -> Result<Vec<Task>>;

    /// Sets a single column. The value is validated before anything is written.
    /// Returns false when no task has this id.
    async fn update_field(&self, id: i64, field: TaskField, value: &str) -> Result<bool>;

    async fn insert(&self, task: NewTask) -> Result<i64>;

    /// Permanently removes a task. Returns false when no task has this id.
    async fn delete(&self, id: i64) -> Result<bool>;

    async fn list_distinct_owners(&self) -> Result<BTreeSet<i64>>;

    /// Number of tasks of `owner` with the same normalized name, time and recurrence.
    async fn count_similar(
        &self,
        owner: i64,
        name: &str,
        time: NaiveTime,
        recurrence: Recurrence,
    ) -> Result<usize>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>>;

    /// All tasks of `owner`, or only those dated on or before `max_date`.
    async fn get_tasks_for_owner(&self, owner: i64, max_date: Option<NaiveDate>)
    -> Result<Vec<Task>>;

    async fn get_tasks_by_date(&self, owner: i64, date: NaiveDate) -> Result<Vec<Task>>;

    /// Tasks of `owner` whose name starts with `prefix` (case-sensitive).
    async fn find_by_name_prefix(&self, owner: i64, prefix: &str) -> Result<Vec<Task>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::database::SqliteTaskStore;
    use parking_lot::Mutex;

    /// A write made by someone else while a caller is between a read and its
    /// follow-up writes.
    #[derive(Debug, Clone)]
    pub enum Interleaved {
        Update(i64, TaskField, String),
        Delete(i64),
    }

    /// SQLite store that applies a queued `Interleaved` write right after the
    /// next `get_task` or `get_due_or_recurring` read.
    pub struct InterleavingStore {
        inner: SqliteTaskStore,
        pending: Mutex<Option<Interleaved>>,
    }

    impl InterleavingStore {
        pub fn new(inner: SqliteTaskStore) -> Self {
            Self {
                inner,
                pending: Mutex::new(None),
            }
        }

        pub fn after_next_read(&self, write: Interleaved) {
            *self.pending.lock() = Some(write);
        }

        async fn interleave(&self) -> Result<()> {
            let write = self.pending.lock().take();
            match write {
                Some(Interleaved::Update(id, field, value)) => {
                    self.inner.update_field(id, field, &value).await?;
                }
                Some(Interleaved::Delete(id)) => {
                    self.inner.delete(id).await?;
                }
                None => {}
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TaskStore for InterleavingStore {
        async fn get_due_or_recurring(&self, as_of: NaiveDate) -> Result<Vec<Task>> {
            let tasks = self.inner.get_due_or_recurring(as_of).await?;
            self.interleave().await?;
            Ok(tasks)
        }

        async fn get_overdue_marked(&self) -> Result<Vec<Task>> {
            self.inner.get_overdue_marked().await
        }

        async fn update_field(&self, id: i64, field: TaskField, value: &str) -> Result<bool> {
            self.inner.update_field(id, field, value).await
        }

        async fn insert(&self, task: NewTask) -> Result<i64> {
            self.inner.insert(task).await
        }

        async fn delete(&self, id: i64) -> Result<bool> {
            self.inner.delete(id).await
        }

        async fn list_distinct_owners(&self) -> Result<BTreeSet<i64>> {
            self.inner.list_distinct_owners().await
        }

        async fn count_similar(
            &self,
            owner: i64,
            name: &str,
            time: NaiveTime,
            recurrence: Recurrence,
        ) -> Result<usize> {
            self.inner.count_similar(owner, name, time, recurrence).await
        }

        async fn get_task(&self, id: i64) -> Result<Option<Task>> {
            let task = self.inner.get_task(id).await?;
            self.interleave().await?;
            Ok(task)
        }

        async fn get_tasks_for_owner(
            &self,
            owner: i64,
            max_date: Option<NaiveDate>,
        ) -> Result<Vec<Task>> {
            self.inner.get_tasks_for_owner(owner, max_date).await
        }

        async fn get_tasks_by_date(&self, owner: i64, date: NaiveDate) -> Result<Vec<Task>> {
            self.inner.get_tasks_by_date(owner, date).await
        }

        async fn find_by_name_prefix(&self, owner: i64, prefix: &str) -> Result<Vec<Task>> {
            self.inner.find_by_name_prefix(owner, prefix).await
        }
    }
}

// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Jobs, tasks, priorities and queue items
//!
//! A [`Job`] owns its [`Task`] records keyed by task id. Tasks only carry the
//! owning job id, never a back-pointer. Queue items hold value copies of tasks;
//! the authoritative record stays in the job.

use crate::backend::VerifyReport;
use crate::params::SignParams;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub type JobId = String;
pub type TaskId = String;

/// Generate a unique, time-sortable, URL-safe identifier
pub fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Priority band of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Bands in pop preference order
    pub const PREFERENCE: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    /// Priority of an HTTP submission carrying `files` documents
    pub fn for_upload(files: usize) -> Priority {
        if files <= 1 {
            Priority::High
        } else {
            Priority::Medium
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    /// `0` is the unknown sentinel and is rejected
    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Medium),
            3 => Ok(Priority::High),
            other => Err(Error::Validation(format!("unknown priority {}", other))),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Parse a status filter; an empty filter selects completed tasks
    pub fn parse_filter(filter: &str) -> Result<TaskStatus> {
        if filter.trim().is_empty() {
            return Ok(TaskStatus::Completed);
        }
        filter.parse()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Validation(format!("bad status filter '{}'", other))),
        }
    }
}

/// One PDF to sign or verify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// Unit the task was routed to
    pub unit: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Name of the uploaded file, used for download headers
    pub file_name: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifyReport>,
}

impl Task {
    pub fn new(
        job_id: &str,
        unit: &str,
        input_path: PathBuf,
        output_path: PathBuf,
        file_name: &str,
    ) -> Self {
        Self {
            id: new_id(),
            job_id: job_id.to_string(),
            unit: unit.to_string(),
            input_path,
            output_path,
            file_name: file_name.to_string(),
            status: TaskStatus::Pending,
            error: None,
            verification: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != TaskStatus::Pending
    }

    /// Record the outcome of processing.
    ///
    /// Returns `false` and leaves the task untouched if it already left `Pending`.
    pub fn finish(&mut self, outcome: std::result::Result<Option<VerifyReport>, String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        match outcome {
            Ok(report) => {
                self.status = TaskStatus::Completed;
                self.verification = report;
            }
            Err(message) => {
                self.status = TaskStatus::Failed;
                self.error = Some(message);
            }
        }
        true
    }
}

/// What a job's tasks do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Sign,
    Verify,
}

/// Client-submitted batch of tasks
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub overrides: SignParams,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Submitter tag, e.g. the directory watcher that created the job
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
    processed: Arc<AtomicUsize>,
}

impl Job {
    pub fn new(kind: JobKind, overrides: SignParams) -> Self {
        Self {
            id: new_id(),
            kind,
            overrides,
            tasks: BTreeMap::new(),
            origin: None,
            created_at: Utc::now(),
            processed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of tasks that reached a terminal state
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Shared handle on the processed counter, used by workers outside the lock
    pub(crate) fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.processed)
    }

    /// Every task has been processed
    pub fn is_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.processed() == self.tasks.len()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    pub(crate) fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            kind: self.kind,
            overrides: self.overrides.clone(),
            task_ids: self.tasks.keys().cloned().collect(),
            origin: self.origin.clone(),
            processed: self.processed(),
            created_at: self.created_at,
        }
    }

    pub(crate) fn from_record(record: JobRecord, tasks: BTreeMap<TaskId, Task>) -> Self {
        let processed = tasks.values().filter(|t| t.is_terminal()).count();
        Self {
            id: record.id,
            kind: record.kind,
            overrides: record.overrides,
            tasks,
            origin: record.origin,
            created_at: record.created_at,
            processed: Arc::new(AtomicUsize::new(processed)),
        }
    }
}

/// Detached snapshot; the copy gets its own counter
impl Clone for Job {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind,
            overrides: self.overrides.clone(),
            tasks: self.tasks.clone(),
            origin: self.origin.clone(),
            created_at: self.created_at,
            processed: Arc::new(AtomicUsize::new(self.processed())),
        }
    }
}

/// Persisted form of a job under `job_<id>`; tasks live under their own keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub overrides: SignParams,
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub origin: Option<String>,
    pub processed: usize,
    pub created_at: DateTime<Utc>,
}

/// Queue item: a task snapshot tagged with the action to perform
#[derive(Debug, Clone)]
pub enum WorkItem {
    Sign(Task),
    Verify(Task),
}

impl WorkItem {
    pub fn for_job(kind: JobKind, task: Task) -> Self {
        match kind {
            JobKind::Sign => WorkItem::Sign(task),
            JobKind::Verify => WorkItem::Verify(task),
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            WorkItem::Sign(task) | WorkItem::Verify(task) => task,
        }
    }
}

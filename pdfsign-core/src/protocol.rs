// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! HTTP wire types
//!
//! Field names are part of the public API; clients poll these shapes.

use crate::backend::VerifyReport;
use crate::model::{Job, JobKind, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response to a job submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCreated {
    pub job_id: String,
}

/// Job summary inside a status response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobView {
    pub id: String,
    pub kind: JobKind,
    /// Tasks that reached a terminal state
    pub processed: usize,
    pub total: usize,
    pub created_at: DateTime<Utc>,
}

/// One task in a status response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    pub id: String,
    pub file_name: String,
    pub status: TaskStatus,
    /// Empty unless the task failed
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifyReport>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            file_name: task.file_name,
            status: task.status,
            error: task.error.unwrap_or_default(),
            verification: task.verification,
        }
    }
}

/// `GET /sign/{job}` and `GET /verify/{job}` body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatusResponse {
    pub job: JobView,
    pub tasks: Vec<TaskView>,
}

impl JobStatusResponse {
    /// Build from a job snapshot and the tasks selected for display
    pub fn new(job: &Job, tasks: Vec<Task>) -> Self {
        Self {
            job: JobView {
                id: job.id.clone(),
                kind: job.kind,
                processed: job.processed(),
                total: job.tasks.len(),
                created_at: job.created_at,
            },
            tasks: tasks.into_iter().map(TaskView::from).collect(),
        }
    }
}

/// Queue depth of one unit per band
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueSize {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

/// `GET /version` body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            name: "pdfsign".to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Health status for system monitoring
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// `GET /health` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub units: Vec<String>,
    /// Set once a terminal license error stopped the workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error body shared by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub message: String,
    pub code: u16,
}

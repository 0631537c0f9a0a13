// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! PDF Sign Core Library
//!
//! This crate provides the scheduling, job-lifecycle and durability layer of the
//! PDF signing service. HTTP handlers submit jobs, each job fans out into tasks,
//! tasks are routed to the priority queue of a named *unit* (a signer or the
//! verifier) and one worker per unit drains its queue behind the license gate.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `queue`: three-band blocking priority queue
//! - `limiter`: multi-window counting rate limiter
//! - `license`: license envelope wrapping the limiter (expiry, host binding, encrypted counters)
//! - `store`: key-prefixed KV persistence (SQLite and in-memory)
//! - `dispatcher`: unit/job registry, worker loops, checkpointing and recovery
//! - `executor` / `backend`: per-task signing and verification action
//! - `params`: signing parameters and the per-field merge rule
//! - `model`: jobs, tasks, priorities and queue items
//! - `config`: layered service configuration
//! - `watcher`: polling directory watcher feeding low-priority jobs
//! - `protocol`: HTTP wire types
//! - `metrics`: counters and latency percentiles
//! - `error`: unified error types

pub mod backend;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod license;
pub mod limiter;
pub mod metrics;
pub mod model;
pub mod params;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod store;
pub mod watcher;

pub use error::{Error, Result};
pub use model::{Priority, TaskStatus};

/// Library version reported by `/version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default capacity of each priority band
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Reserved name of the verification unit
pub const VERIFY_UNIT: &str = "verify";

// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Unit and job registry with one worker per unit
//!
//! # Lifecycle
//!
//! 1. Units are registered at startup and never change afterwards
//! 2. Jobs are created, tasks are added and pushed on the target unit's queue
//! 3. Each unit's worker pops a task, waits on the license, signs or verifies
//!    and records the outcome under the jobs mutex
//! 4. The worker whose increment makes `processed == tasks` checkpoints the job
//!
//! Pending tasks of checkpointed jobs are re-enqueued at low priority by
//! [`Dispatcher::load_from_db`], so a task may be processed again after a crash.

use crate::backend::VerifyReport;
use crate::executor::UnitExecutor;
use crate::license::License;
use crate::metrics::Metrics;
use crate::model::{new_id, Job, JobId, JobKind, JobRecord, Priority, Task, TaskId, TaskStatus, WorkItem};
use crate::params::SignParams;
use crate::protocol::QueueSize;
use crate::queue::PriorityQueue;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{self, KvStore, JOB_PREFIX, TASK_PREFIX};
use crate::{Error, Result, DEFAULT_QUEUE_CAPACITY, VERIFY_UNIT};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A worker that ran this long without panicking restarts with a fresh backoff
const STABLE_RUN: Duration = Duration::from_secs(60);

enum UnitKind {
    Sign { defaults: SignParams },
    Verify,
}

struct Unit {
    name: String,
    kind: UnitKind,
    queue: PriorityQueue<WorkItem>,
    executor: UnitExecutor,
}

impl Unit {
    fn accepts(&self, job: JobKind) -> bool {
        matches!(
            (&self.kind, job),
            (UnitKind::Sign { .. }, JobKind::Sign) | (UnitKind::Verify, JobKind::Verify)
        )
    }
}

/// Scheduler owning every unit, job and task
pub struct Dispatcher {
    units: RwLock<HashMap<String, Arc<Unit>>>,
    jobs: Mutex<HashMap<JobId, Job>>,
    /// Serializes snapshot + write so an older snapshot never overwrites a newer one
    checkpoint_lock: Mutex<()>,
    store: Arc<dyn KvStore>,
    license: Arc<License>,
    metrics: Metrics,
    files_dir: PathBuf,
    queue_capacity: usize,
    checkpoint_policy: RetryPolicy,
    restart_policy: RetryPolicy,
    shutdown: CancellationToken,
    fatal: Mutex<Option<String>>,
}

impl Dispatcher {
    /// Create a dispatcher storing uploaded and signed files under `files_dir`
    pub fn new(store: Arc<dyn KvStore>, license: Arc<License>, files_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(files_dir)?;
        Ok(Self {
            units: RwLock::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            checkpoint_lock: Mutex::new(()),
            store,
            license,
            metrics: Metrics::new(),
            files_dir: files_dir.to_path_buf(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            checkpoint_policy: RetryPolicy::checkpoint(),
            restart_policy: RetryPolicy::default(),
            shutdown: CancellationToken::new(),
            fatal: Mutex::new(None),
        })
    }

    /// Per-band capacity of queues created after this call
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_restart_policy(mut self, policy: RetryPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn license(&self) -> &Arc<License> {
        &self.license
    }

    /// Register a signing unit; a second registration under the same name is ignored
    pub fn add_sign_unit(&self, name: &str, defaults: SignParams, executor: UnitExecutor) -> Result<()> {
        if name == VERIFY_UNIT {
            return Err(Error::Validation(format!(
                "unit name '{}' is reserved for verification",
                VERIFY_UNIT
            )));
        }
        self.add_unit(name, UnitKind::Sign { defaults }, executor);
        Ok(())
    }

    /// Register the verification unit under [`VERIFY_UNIT`]
    pub fn add_verify_unit(&self, executor: UnitExecutor) {
        self.add_unit(VERIFY_UNIT, UnitKind::Verify, executor);
    }

    fn add_unit(&self, name: &str, kind: UnitKind, executor: UnitExecutor) {
        let mut units = self.units.write();
        if units.contains_key(name) {
            debug!(unit = name, "Unit already registered");
            return;
        }
        units.insert(
            name.to_string(),
            Arc::new(Unit {
                name: name.to_string(),
                kind,
                queue: PriorityQueue::new(self.queue_capacity),
                executor,
            }),
        );
        info!(unit = name, "Unit registered");
    }

    /// Registered unit names, sorted
    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_unit(&self, name: &str) -> bool {
        self.units.read().contains_key(name)
    }

    fn unit(&self, name: &str) -> Result<Arc<Unit>> {
        self.units
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownUnit(name.to_string()))
    }

    /// Create a signing job with per-request overrides
    pub fn add_sign_job(&self, overrides: SignParams) -> JobId {
        self.insert_job(Job::new(JobKind::Sign, overrides))
    }

    /// Create a signing job tagged with its submitter
    pub fn add_sign_job_with_origin(&self, overrides: SignParams, origin: &str) -> JobId {
        let mut job = Job::new(JobKind::Sign, overrides);
        job.origin = Some(origin.to_string());
        self.insert_job(job)
    }

    pub fn add_verify_job(&self) -> JobId {
        self.insert_job(Job::new(JobKind::Verify, SignParams::default()))
    }

    fn insert_job(&self, job: Job) -> JobId {
        let id = job.id.clone();
        debug!(job = %id, kind = ?job.kind, "Job created");
        self.jobs.lock().insert(id.clone(), job);
        self.metrics.record_job();
        id
    }

    /// Fresh path inside the files directory
    pub fn new_file_path(&self, extension: &str) -> PathBuf {
        self.files_dir.join(format!("{}.{}", new_id(), extension))
    }

    /// Register one task on `job` and enqueue it on `unit`
    pub async fn add_task(
        &self,
        unit: &str,
        job_id: &str,
        input: PathBuf,
        output: PathBuf,
        file_name: &str,
        priority: Priority,
    ) -> Result<TaskId> {
        let unit = self.unit(unit)?;
        let item = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::UnknownJob(job_id.to_string()))?;
            check_route(&unit, job)?;

            let task = Task::new(job_id, &unit.name, input, output, file_name);
            job.tasks.insert(task.id.clone(), task.clone());
            WorkItem::for_job(job.kind, task)
        };

        let id = item.task().id.clone();
        unit.queue.push(item, priority).await?;
        self.metrics.record_enqueue();
        debug!(unit = %unit.name, job = job_id, task = %id, %priority, "Task enqueued");
        Ok(id)
    }

    /// Register every `(stored path, original name)` pair on `job`, enqueue
    /// them and checkpoint the job.
    ///
    /// All tasks join the job before the first is enqueued, so the job cannot
    /// turn terminal while the batch is still being added.
    pub async fn add_batch_persistent_tasks(
        &self,
        unit: &str,
        job_id: &str,
        files: Vec<(PathBuf, String)>,
        priority: Priority,
    ) -> Result<Vec<TaskId>> {
        let unit = self.unit(unit)?;
        let items: Vec<WorkItem> = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::UnknownJob(job_id.to_string()))?;
            check_route(&unit, job)?;

            files
                .into_iter()
                .map(|(input, file_name)| {
                    let output = self.new_file_path("pdf");
                    let task = Task::new(job_id, &unit.name, input, output, &file_name);
                    job.tasks.insert(task.id.clone(), task.clone());
                    WorkItem::for_job(job.kind, task)
                })
                .collect()
        };

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(item.task().id.clone());
            unit.queue.push(item, priority).await?;
            self.metrics.record_enqueue();
        }
        debug!(unit = %unit.name, job = job_id, tasks = ids.len(), %priority, "Batch enqueued");

        self.save_to_db(job_id)?;
        Ok(ids)
    }

    /// Consistent copy of a job
    pub fn get_job_by_id(&self, job_id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(job_id.to_string()))
    }

    /// Tasks of `job` in state `filter`; an empty filter selects completed tasks
    pub fn get_tasks(&self, job_id: &str, filter: &str) -> Result<Vec<Task>> {
        let status = TaskStatus::parse_filter(filter)?;
        self.jobs
            .lock()
            .get(job_id)
            .map(|job| job.tasks_with_status(status))
            .ok_or_else(|| Error::UnknownJob(job_id.to_string()))
    }

    /// A task that completed; pending and failed tasks are errors
    pub fn get_completed_task(&self, job_id: &str, task_id: &str) -> Result<Task> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| Error::UnknownJob(job_id.to_string()))?;
        let task = job
            .tasks
            .get(task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;

        match task.status {
            TaskStatus::Completed => Ok(task.clone()),
            TaskStatus::Pending => Err(Error::TaskPending(task_id.to_string())),
            TaskStatus::Failed => Err(Error::TaskFailed {
                task: task_id.to_string(),
                message: task.error.clone().unwrap_or_default(),
            }),
        }
    }

    pub fn get_queue_size_by_unit(&self, unit: &str) -> Result<QueueSize> {
        let unit = self.unit(unit)?;
        Ok(QueueSize {
            low: unit.queue.len(Priority::Low),
            medium: unit.queue.len(Priority::Medium),
            high: unit.queue.len(Priority::High),
        })
    }

    /// Depths of every unit, for metrics
    pub fn queue_depths(&self) -> Vec<(String, usize, usize, usize)> {
        let units = self.units.read();
        let mut depths: Vec<_> = units
            .values()
            .map(|u| {
                (
                    u.name.clone(),
                    u.queue.len(Priority::Low),
                    u.queue.len(Priority::Medium),
                    u.queue.len(Priority::High),
                )
            })
            .collect();
        depths.sort();
        depths
    }

    /// Jobs submitted under `origin`
    pub fn jobs_with_origin(&self, origin: &str) -> Vec<Job> {
        self.jobs
            .lock()
            .values()
            .filter(|job| job.origin.as_deref() == Some(origin))
            .cloned()
            .collect()
    }

    /// Remove a job, its tasks and their files
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        let job = {
            let _checkpoint = self.checkpoint_lock.lock();
            let job = self
                .jobs
                .lock()
                .remove(job_id)
                .ok_or_else(|| Error::UnknownJob(job_id.to_string()))?;

            let mut keys: Vec<String> = job.tasks.keys().map(|id| store::task_key(id)).collect();
            keys.push(store::job_key(job_id));
            self.store.batch_delete(&keys)?;
            job
        };

        for task in job.tasks.values() {
            remove_file(&task.input_path);
            remove_file(&task.output_path);
        }
        info!(job = job_id, tasks = job.tasks.len(), "Job deleted");
        Ok(())
    }

    /// Write a job and all its tasks in one batch
    pub fn save_to_db(&self, job_id: &str) -> Result<()> {
        let _checkpoint = self.checkpoint_lock.lock();
        let job = self.get_job_by_id(job_id)?;

        let mut batch = BTreeMap::new();
        batch.insert(store::job_key(&job.id), serde_json::to_vec(&job.to_record())?);
        for task in job.tasks.values() {
            batch.insert(store::task_key(&task.id), serde_json::to_vec(task)?);
        }
        self.store.batch_put(&batch)?;

        debug!(job = job_id, tasks = job.tasks.len(), "Job checkpointed");
        Ok(())
    }

    /// Restore every stored job and re-enqueue its pending tasks at low priority.
    ///
    /// Returns the number of re-enqueued tasks. Call after [`Dispatcher::runner`]
    /// when more pending tasks than one band holds may be waiting.
    pub async fn load_from_db(&self) -> Result<usize> {
        let records = self.store.scan(JOB_PREFIX)?;
        let mut stored_tasks = self.store.scan(TASK_PREFIX)?;

        let mut pending = Vec::new();
        let mut restored = 0;
        for (key, bytes) in records {
            let record: JobRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable job record");
                    continue;
                }
            };

            let mut tasks = BTreeMap::new();
            for task_id in &record.task_ids {
                let Some(bytes) = stored_tasks.remove(&store::task_key(task_id)) else {
                    warn!(job = %record.id, task = %task_id, "Task record missing");
                    continue;
                };
                match serde_json::from_slice::<Task>(&bytes) {
                    Ok(task) => {
                        tasks.insert(task.id.clone(), task);
                    }
                    Err(e) => warn!(task = %task_id, error = %e, "Skipping unreadable task record"),
                }
            }

            let job = Job::from_record(record, tasks);
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&job.id) {
                debug!(job = %job.id, "Job already loaded");
                continue;
            }
            for task in job.tasks.values().filter(|t| !t.is_terminal()) {
                pending.push(WorkItem::for_job(job.kind, task.clone()));
            }
            jobs.insert(job.id.clone(), job);
            restored += 1;
        }

        if !stored_tasks.is_empty() {
            debug!(orphans = stored_tasks.len(), "Ignoring tasks without a job");
        }

        let mut requeued = 0;
        for item in pending {
            let Ok(unit) = self.unit(&item.task().unit) else {
                warn!(task = %item.task().id, unit = %item.task().unit, "Unit no longer configured");
                continue;
            };
            unit.queue.push(item, Priority::Low).await?;
            requeued += 1;
        }

        info!(jobs = restored, requeued, "State restored");
        Ok(requeued)
    }

    /// Spawn one supervised worker per unit
    pub fn runner(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let units: Vec<Arc<Unit>> = self.units.read().values().cloned().collect();
        units
            .into_iter()
            .map(|unit| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.supervise(unit).await })
            })
            .collect()
    }

    async fn supervise(self: Arc<Self>, unit: Arc<Unit>) {
        let mut backoff = Backoff::new(&self.restart_policy);
        loop {
            let started = Instant::now();
            let worker = tokio::spawn(Arc::clone(&self).work(Arc::clone(&unit)));

            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    self.metrics.record_worker_restart();
                    if started.elapsed() > STABLE_RUN {
                        backoff = Backoff::new(&self.restart_policy);
                    }
                    let pause = backoff.next_delay();
                    error!(unit = %unit.name, restart_in = ?pause, "Worker panicked");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                Err(e) => {
                    warn!(unit = %unit.name, error = %e, "Worker aborted");
                    break;
                }
            }
        }
        debug!(unit = %unit.name, "Worker stopped");
    }

    async fn work(self: Arc<Self>, unit: Arc<Unit>) {
        info!(unit = %unit.name, "Worker started");
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = unit.queue.pop() => match item {
                    Ok(item) => item,
                    Err(_) => break,
                },
            };

            if let Err(e) = self.process(&unit, item).await {
                if e.is_terminal() {
                    self.fail(&e);
                    break;
                }
                error!(unit = %unit.name, error = %e, "Task processing failed");
            }
        }
    }

    async fn process(&self, unit: &Unit, item: WorkItem) -> Result<()> {
        let task = item.task();
        let (overrides, counter) = {
            let jobs = self.jobs.lock();
            let Some(job) = jobs.get(&task.job_id) else {
                debug!(task = %task.id, job = %task.job_id, "Job deleted, dropping task");
                return Ok(());
            };
            if job.tasks.get(&task.id).map_or(true, Task::is_terminal) {
                debug!(task = %task.id, "Task already processed");
                return Ok(());
            }
            (job.overrides.clone(), job.counter())
        };

        let waited = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            waited = self.license.wait() => waited?,
        };
        if !waited.is_zero() {
            self.metrics.record_limiter_wait(waited);
        }

        let started = Instant::now();
        let outcome = self.execute(unit, &item, overrides).await;
        let elapsed = started.elapsed();

        match (&outcome, &item) {
            (Ok(_), WorkItem::Sign(_)) => self.metrics.record_signed(elapsed),
            (Ok(_), WorkItem::Verify(_)) => self.metrics.record_verified(elapsed),
            (Err(e), _) => {
                warn!(unit = %unit.name, task = %task.id, error = %e, "Task failed");
                self.metrics.record_failed(elapsed);
            }
        }

        let (recorded, total) = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(&task.job_id) else {
                return Ok(());
            };
            let total = job.tasks.len();
            let recorded = job
                .tasks
                .get_mut(&task.id)
                .is_some_and(|t| t.finish(outcome.map_err(|e| e.to_string())));
            (recorded, total)
        };
        if !recorded {
            return Ok(());
        }

        if counter.fetch_add(1, Ordering::SeqCst) + 1 == total {
            self.checkpoint(&task.job_id).await;
        }
        Ok(())
    }

    async fn execute(&self, unit: &Unit, item: &WorkItem, overrides: SignParams) -> Result<Option<VerifyReport>> {
        let executor = unit.executor.clone();
        let handle = match (item, &unit.kind) {
            (WorkItem::Sign(task), UnitKind::Sign { defaults }) => {
                let params = SignParams::merge(&overrides, defaults);
                let task = task.clone();
                tokio::task::spawn_blocking(move || executor.sign(&task, &params).map(|_| None))
            }
            (WorkItem::Verify(task), _) => {
                let input = task.input_path.clone();
                tokio::task::spawn_blocking(move || executor.verify(&input).map(Some))
            }
            (WorkItem::Sign(_), UnitKind::Verify) => {
                return Err(Error::Validation(format!(
                    "unit '{}' cannot sign",
                    unit.name
                )))
            }
        };

        match handle.await {
            Ok(outcome) => outcome,
            // let the supervisor see the panic; the task stays pending
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::Internal(e.to_string())),
        }
    }

    /// Terminal checkpoint; failures are logged, never surfaced
    async fn checkpoint(&self, job_id: &str) {
        let dispatcher = self;
        let result = self
            .checkpoint_policy
            .execute(move || async move { dispatcher.save_to_db(job_id) })
            .await;

        match result {
            Ok(()) => {
                self.metrics.record_checkpoint();
                info!(job = job_id, "Job finished");
            }
            Err(e) => {
                self.metrics.record_checkpoint_failure();
                error!(job = job_id, error = %e, "Failed to checkpoint finished job");
            }
        }
    }

    fn fail(&self, e: &Error) {
        error!(error = %e, "Terminal license error, stopping workers");
        self.fatal.lock().get_or_insert_with(|| e.to_string());
        self.shutdown();
    }

    /// Message of the terminal error that stopped the workers, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Stop workers between tasks and wake blocked producers
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for unit in self.units.read().values() {
            unit.queue.close();
        }
    }

    /// Token cancelled by [`Dispatcher::shutdown`] or a terminal error
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn check_route(unit: &Unit, job: &Job) -> Result<()> {
    if unit.accepts(job.kind) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "unit '{}' does not accept {:?} jobs",
            unit.name, job.kind
        )))
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::MINIMAL_PDF;
    use crate::backend::{Ed25519Backend, SignatureBackend};
    use crate::license::tests::test_license;
    use crate::store::{MemoryStore, SqliteStore};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::io::Read;
    use std::sync::atomic::AtomicBool;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<dyn KvStore>,
        key: SigningKey,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                store: Arc::new(MemoryStore::new()),
                key: SigningKey::generate(&mut OsRng),
            }
        }

        fn with_sqlite() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(SqliteStore::open(&dir.path().join("pdfsign.db")).unwrap());
            Self {
                dir,
                store,
                key: SigningKey::generate(&mut OsRng),
            }
        }

        fn dispatcher(&self, limits: &[(u64, &str)]) -> Arc<Dispatcher> {
            let d = Dispatcher::new(
                Arc::clone(&self.store),
                test_license(limits),
                &self.dir.path().join("files"),
            )
            .unwrap();
            self.register(&d);
            Arc::new(d)
        }

        fn register(&self, d: &Dispatcher) {
            let backend = Arc::new(Ed25519Backend::from_signing_key(self.key.clone()));
            let defaults = SignParams {
                name: "Simple Signer".to_string(),
                reason: "Approval".to_string(),
                ..SignParams::default()
            };
            d.add_sign_unit("simple", defaults, UnitExecutor::new(backend, true))
                .unwrap();
            d.add_verify_unit(UnitExecutor::new(Arc::new(Ed25519Backend::verifier()), false));
        }

        fn upload(&self, d: &Dispatcher, name: &str, content: &[u8]) -> (PathBuf, String) {
            let path = d.new_file_path("pdf");
            std::fs::write(&path, content).unwrap();
            (path, name.to_string())
        }
    }

    async fn wait_terminal(d: &Dispatcher, job_id: &str) -> Job {
        for _ in 0..500 {
            let job = d.get_job_by_id(job_id).unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_add_sign_unit_is_idempotent() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[]);
        fx.register(&d);

        assert_eq!(d.unit_names(), vec!["simple", VERIFY_UNIT]);
        let err = d
            .add_sign_unit(VERIFY_UNIT, SignParams::default(), UnitExecutor::new(Arc::new(Ed25519Backend::verifier()), false))
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_unit_and_job() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[]);
        let job = d.add_sign_job(SignParams::default());

        let err = d
            .add_task("nonexistent", &job, "a".into(), "b".into(), "a.pdf", Priority::High)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unit is not in map"));

        let err = d
            .add_task("simple", "missing", "a".into(), "b".into(), "a.pdf", Priority::High)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownJob(_)));

        // sign jobs cannot be routed to the verifier
        assert!(d
            .add_task(VERIFY_UNIT, &job, "a".into(), "b".into(), "a.pdf", Priority::High)
            .await
            .is_err());
        assert!(d.get_queue_size_by_unit("nonexistent").is_err());
    }

    #[tokio::test]
    async fn test_batch_waits_in_medium_band() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[]);
        let job = d.add_sign_job(SignParams::default());
        let files = vec![
            fx.upload(&d, "a.pdf", MINIMAL_PDF),
            fx.upload(&d, "b.pdf", MINIMAL_PDF),
        ];

        d.add_batch_persistent_tasks("simple", &job, files, Priority::for_upload(2))
            .await
            .unwrap();

        let size = d.get_queue_size_by_unit("simple").unwrap();
        assert_eq!(size, QueueSize { low: 0, medium: 2, high: 0 });
        assert_eq!(d.get_tasks(&job, "Pending").unwrap().len(), 2);
        assert!(d.get_tasks(&job, "").unwrap().is_empty());
        assert!(d.get_tasks(&job, "Done").is_err());

        // checkpointed before any worker ran
        assert!(fx.store.get(&store::job_key(&job)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mixed_outcomes_isolated() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[]);
        let handles = d.runner();

        let job = d.add_sign_job(SignParams {
            location: "Timisoara".to_string(),
            ..SignParams::default()
        });
        let files = vec![
            fx.upload(&d, "good.pdf", MINIMAL_PDF),
            fx.upload(&d, "bad.pdf", b"plain text renamed to pdf"),
        ];
        d.add_batch_persistent_tasks("simple", &job, files, Priority::Medium)
            .await
            .unwrap();

        let finished = wait_terminal(&d, &job).await;
        assert_eq!(finished.processed(), 2);

        let completed = d.get_tasks(&job, "Completed").unwrap();
        let failed = d.get_tasks(&job, "Failed").unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(failed.len(), 1);
        assert_eq!(completed[0].file_name, "good.pdf");
        assert!(!failed[0].error.as_deref().unwrap_or_default().is_empty());

        let err = d.get_completed_task(&job, &failed[0].id).unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));

        // overrides and unit defaults both reach the signature
        let task = d.get_completed_task(&job, &completed[0].id).unwrap();
        let mut output = std::fs::File::open(&task.output_path).unwrap();
        let report = Ed25519Backend::verifier().verify(&mut output).unwrap();
        assert_eq!(report.signatures[0].name, "Simple Signer");
        assert_eq!(report.signatures[0].location, "Timisoara");

        d.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_pending_task_not_downloadable() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[]);
        let job = d.add_sign_job(SignParams::default());
        let (path, name) = fx.upload(&d, "a.pdf", MINIMAL_PDF);
        let task = d
            .add_task("simple", &job, path, d.new_file_path("pdf"), &name, Priority::High)
            .await
            .unwrap();

        assert!(matches!(d.get_completed_task(&job, &task), Err(Error::TaskPending(_))));
        assert!(matches!(d.get_completed_task(&job, "nope"), Err(Error::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_verify_job() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[]);
        let handles = d.runner();

        let signed = {
            let backend = Ed25519Backend::from_signing_key(fx.key.clone());
            let input = d.new_file_path("pdf");
            let output = d.new_file_path("pdf");
            std::fs::write(&input, MINIMAL_PDF).unwrap();
            backend.sign(&input, &output, &SignParams::default()).unwrap();
            std::fs::read(output).unwrap()
        };

        let job = d.add_verify_job();
        let files = vec![fx.upload(&d, "signed.pdf", &signed)];
        d.add_batch_persistent_tasks(VERIFY_UNIT, &job, files, Priority::High)
            .await
            .unwrap();

        let finished = wait_terminal(&d, &job).await;
        let task = finished.tasks.values().next().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
        assert_eq!(task.verification.as_ref().unwrap().signatures.len(), 1);

        d.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_completed_job_survives_restart() {
        let fx = Fixture::with_sqlite();
        let job = {
            let d = fx.dispatcher(&[]);
            let handles = d.runner();
            let job = d.add_sign_job(SignParams::default());
            let files = vec![
                fx.upload(&d, "one.pdf", MINIMAL_PDF),
                fx.upload(&d, "two.pdf", MINIMAL_PDF),
                fx.upload(&d, "three.pdf", MINIMAL_PDF),
            ];
            d.add_batch_persistent_tasks("simple", &job, files, Priority::Medium)
                .await
                .unwrap();
            wait_terminal(&d, &job).await;
            d.shutdown();
            for h in handles {
                h.await.unwrap();
            }
            job
        };

        let restarted = fx.dispatcher(&[]);
        assert_eq!(restarted.load_from_db().await.unwrap(), 0);

        let restored = restarted.get_job_by_id(&job).unwrap();
        assert!(restored.is_terminal());
        let mut names: Vec<String> = restarted
            .get_tasks(&job, "Completed")
            .unwrap()
            .into_iter()
            .map(|t| t.file_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one.pdf", "three.pdf", "two.pdf"]);
    }

    #[tokio::test]
    async fn test_pending_tasks_requeued_at_low_priority() {
        let fx = Fixture::with_sqlite();
        let job = {
            let d = fx.dispatcher(&[]);
            let job = d.add_sign_job(SignParams::default());
            let files = vec![
                fx.upload(&d, "a.pdf", MINIMAL_PDF),
                fx.upload(&d, "b.pdf", MINIMAL_PDF),
            ];
            d.add_batch_persistent_tasks("simple", &job, files, Priority::High)
                .await
                .unwrap();
            job
        };

        let restarted = fx.dispatcher(&[]);
        assert_eq!(restarted.load_from_db().await.unwrap(), 2);
        assert_eq!(restarted.get_queue_size_by_unit("simple").unwrap().low, 2);

        // loading again must not enqueue the same tasks twice
        assert_eq!(restarted.load_from_db().await.unwrap(), 0);
        assert_eq!(restarted.get_queue_size_by_unit("simple").unwrap().low, 2);

        let handles = restarted.runner();
        let finished = wait_terminal(&restarted, &job).await;
        assert_eq!(finished.tasks_with_status(TaskStatus::Completed).len(), 2);

        restarted.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delete_after_terminal() {
        let fx = Fixture::with_sqlite();
        let d = fx.dispatcher(&[]);
        let handles = d.runner();

        let job = d.add_sign_job(SignParams::default());
        let files = vec![fx.upload(&d, "a.pdf", MINIMAL_PDF)];
        d.add_batch_persistent_tasks("simple", &job, files, Priority::High)
            .await
            .unwrap();
        let finished = wait_terminal(&d, &job).await;
        let task = finished.tasks.values().next().unwrap().clone();

        d.delete_job(&job).unwrap();
        assert!(matches!(d.get_job_by_id(&job), Err(Error::UnknownJob(_))));
        assert!(d.delete_job(&job).is_err());
        assert!(!task.input_path.exists());
        assert!(!task.output_path.exists());

        let restarted = fx.dispatcher(&[]);
        restarted.load_from_db().await.unwrap();
        assert!(restarted.get_job_by_id(&job).is_err());

        d.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_throttles_without_failures() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[(2, "1s")]);
        let handles = d.runner();

        let start = tokio::time::Instant::now();
        let mut jobs = Vec::new();
        for i in 0..5 {
            let job = d.add_sign_job(SignParams::default());
            let files = vec![fx.upload(&d, &format!("{}.pdf", i), MINIMAL_PDF)];
            d.add_batch_persistent_tasks("simple", &job, files, Priority::High)
                .await
                .unwrap();
            jobs.push(job);
        }
        for job in &jobs {
            let finished = wait_terminal(&d, job).await;
            assert!(finished.tasks_with_status(TaskStatus::Failed).is_empty());
        }

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(d.metrics().limiter_waits() >= 2);

        d.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_exhausted_total_window_is_fatal() {
        let fx = Fixture::new();
        let d = fx.dispatcher(&[(1, crate::limiter::TOTAL_INTERVAL)]);
        let handles = d.runner();

        let job = d.add_sign_job(SignParams::default());
        let files = vec![
            fx.upload(&d, "a.pdf", MINIMAL_PDF),
            fx.upload(&d, "b.pdf", MINIMAL_PDF),
        ];
        d.add_batch_persistent_tasks("simple", &job, files, Priority::Medium)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), d.shutdown_token().cancelled())
            .await
            .unwrap();
        assert!(d.fatal_error().unwrap().contains("exhausted"));

        let job = d.get_job_by_id(&job).unwrap();
        assert_eq!(job.tasks_with_status(TaskStatus::Completed).len(), 1);
        assert_eq!(job.tasks_with_status(TaskStatus::Pending).len(), 1);

        for h in handles {
            h.await.unwrap();
        }
    }

    /// Panics on the first call, then signs normally
    struct FlakyBackend {
        inner: Ed25519Backend,
        panicked: AtomicBool,
    }

    impl SignatureBackend for FlakyBackend {
        fn sign(&self, input: &Path, output: &Path, params: &SignParams) -> Result<()> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("backend crashed");
            }
            self.inner.sign(input, output, params)
        }

        fn verify(&self, input: &mut dyn Read) -> Result<VerifyReport> {
            self.inner.verify(input)
        }
    }

    #[tokio::test]
    async fn test_worker_restarted_after_panic() {
        let fx = Fixture::new();
        let d = Dispatcher::new(Arc::clone(&fx.store), test_license(&[]), &fx.dir.path().join("files"))
            .unwrap()
            .with_restart_policy(RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                ..RetryPolicy::default()
            });
        let backend = Arc::new(FlakyBackend {
            inner: Ed25519Backend::from_signing_key(fx.key.clone()),
            panicked: AtomicBool::new(false),
        });
        d.add_sign_unit("flaky", SignParams::default(), UnitExecutor::new(backend, false))
            .unwrap();
        let d = Arc::new(d);
        let handles = d.runner();

        let first = d.add_sign_job(SignParams::default());
        d.add_batch_persistent_tasks("flaky", &first, vec![fx.upload(&d, "a.pdf", MINIMAL_PDF)], Priority::High)
            .await
            .unwrap();
        let second = d.add_sign_job(SignParams::default());
        d.add_batch_persistent_tasks("flaky", &second, vec![fx.upload(&d, "b.pdf", MINIMAL_PDF)], Priority::Low)
            .await
            .unwrap();

        wait_terminal(&d, &second).await;
        assert_eq!(d.metrics().worker_restarts(), 1);
        // the task in flight during the panic stays pending for recovery
        let first = d.get_job_by_id(&first).unwrap();
        assert_eq!(first.tasks_with_status(TaskStatus::Pending).len(), 1);

        d.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }
}

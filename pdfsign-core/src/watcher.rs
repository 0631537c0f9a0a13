// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Polling directory watcher
//!
//! PDFs dropped into the input directory are moved into the dispatcher's
//! files directory and submitted as low-priority jobs, one per file. Signed
//! results are copied to the output directory; files that fail to sign are
//! returned under `<out>/failed`. Delivered jobs are deleted.

use crate::dispatcher::Dispatcher;
use crate::license::License;
use crate::model::{JobId, Priority, TaskStatus};
use crate::params::SignParams;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Files modified more recently than this may still be written
const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Refuse more watchers than the license allows
pub fn ensure_allowed(watchers: usize, license: &License) -> Result<()> {
    let allowed = license.max_directory_watchers();
    if watchers > allowed {
        return Err(Error::License(format!(
            "{} directory watchers configured, license allows {}",
            watchers, allowed
        )));
    }
    Ok(())
}

pub struct DirectoryWatcher {
    name: String,
    unit: String,
    input_dir: PathBuf,
    output_dir: PathBuf,
    poll_interval: Duration,
    settle: Duration,
    dispatcher: Arc<Dispatcher>,
}

impl DirectoryWatcher {
    pub fn new(
        name: &str,
        unit: &str,
        input_dir: &Path,
        output_dir: &Path,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        if !dispatcher.has_unit(unit) {
            return Err(Error::UnknownUnit(unit.to_string()));
        }
        std::fs::create_dir_all(input_dir)?;
        std::fs::create_dir_all(output_dir)?;

        Ok(Self {
            name: name.to_string(),
            unit: unit.to_string(),
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle: DEFAULT_SETTLE,
            dispatcher,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Origin tag of the jobs this watcher submits
    pub fn origin(&self) -> String {
        format!("watch:{}", self.name)
    }

    /// Poll until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        // jobs submitted by a previous run are still ours to deliver
        let mut inflight: HashMap<JobId, String> = self
            .dispatcher
            .jobs_with_origin(&self.origin())
            .into_iter()
            .filter_map(|job| {
                let name = job.tasks.values().next()?.file_name.clone();
                Some((job.id, name))
            })
            .collect();

        info!(
            watcher = %self.name,
            input = %self.input_dir.display(),
            output = %self.output_dir.display(),
            adopted = inflight.len(),
            "Directory watcher started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(&mut inflight).await {
                        warn!(watcher = %self.name, error = %e, "Scan failed");
                    }
                    self.deliver(&mut inflight);
                }
            }
        }
        debug!(watcher = %self.name, "Directory watcher stopped");
    }

    async fn scan(&self, inflight: &mut HashMap<JobId, String>) -> Result<()> {
        for path in self.ready_files()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            let stored = self.dispatcher.new_file_path("pdf");
            move_file(&path, &stored)?;

            let job = self
                .dispatcher
                .add_sign_job_with_origin(SignParams::default(), &self.origin());
            let submitted = self
                .dispatcher
                .add_batch_persistent_tasks(&self.unit, &job, vec![(stored.clone(), name.clone())], Priority::Low)
                .await;
            if let Err(e) = submitted {
                // hand the file back so the next scan picks it up again
                if let Err(restore) = move_file(&stored, &path) {
                    error!(watcher = %self.name, file = %name, error = %restore, "Failed to return file to input");
                }
                if let Err(cleanup) = self.dispatcher.delete_job(&job) {
                    debug!(watcher = %self.name, job = %job, error = %cleanup, "Discarding unsubmitted job");
                }
                return Err(e);
            }

            info!(watcher = %self.name, job = %job, file = %name, "File submitted");
            inflight.insert(job, name);
        }
        Ok(())
    }

    fn ready_files(&self) -> Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.input_dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if !metadata.is_file() || !is_pdf(&path) {
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= self.settle {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn deliver(&self, inflight: &mut HashMap<JobId, String>) {
        let mut done = Vec::new();
        for (job_id, name) in inflight.iter() {
            let job = match self.dispatcher.get_job_by_id(job_id) {
                Ok(job) => job,
                Err(_) => {
                    done.push(job_id.clone());
                    continue;
                }
            };
            if !job.is_terminal() {
                continue;
            }

            for task in job.tasks.values() {
                let result = match task.status {
                    TaskStatus::Completed => {
                        copy_atomic(&task.output_path, &self.output_dir.join(name))
                    }
                    _ => {
                        warn!(
                            watcher = %self.name,
                            file = %name,
                            error = task.error.as_deref().unwrap_or_default(),
                            "Signing failed, returning original"
                        );
                        let failed = self.output_dir.join("failed");
                        std::fs::create_dir_all(&failed)
                            .and_then(|_| copy_atomic(&task.input_path, &failed.join(name)))
                    }
                };
                if let Err(e) = result {
                    warn!(watcher = %self.name, file = %name, error = %e, "Delivery failed");
                }
            }

            if let Err(e) = self.dispatcher.delete_job(job_id) {
                warn!(watcher = %self.name, job = %job_id, error = %e, "Failed to delete delivered job");
            }
            debug!(watcher = %self.name, file = %name, "Delivered");
            done.push(job_id.clone());
        }

        for job_id in done {
            inflight.remove(&job_id);
        }
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Copy next to `to` and rename, so readers never see a partial file
fn copy_atomic(from: &Path, to: &Path) -> std::io::Result<()> {
    let name = to.file_name().and_then(|n| n.to_str()).unwrap_or("output");
    let staging = to.with_file_name(format!(".{}.partial", name));
    std::fs::copy(from, &staging)?;
    std::fs::rename(&staging, to)
}

/// Rename, falling back to copy and remove across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::MINIMAL_PDF;
    use crate::backend::{Ed25519Backend, SignatureBackend};
    use crate::executor::UnitExecutor;
    use crate::license::tests::test_license;
    use crate::store::MemoryStore;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn dispatcher(dir: &Path) -> Arc<Dispatcher> {
        let d = Dispatcher::new(Arc::new(MemoryStore::new()), test_license(&[]), &dir.join("files")).unwrap();
        let backend = Arc::new(Ed25519Backend::from_signing_key(SigningKey::generate(&mut OsRng)));
        d.add_sign_unit("simple", SignParams::default(), UnitExecutor::new(backend, false))
            .unwrap();
        Arc::new(d)
    }

    async fn wait_for(path: &Path) {
        for _ in 0..250 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[test]
    fn test_is_pdf() {
        assert!(is_pdf(Path::new("a.pdf")));
        assert!(is_pdf(Path::new("B.PDF")));
        assert!(!is_pdf(Path::new("a.pdf.part")));
        assert!(!is_pdf(Path::new("notes")));
    }

    #[test]
    fn test_watcher_allowance() {
        let license = test_license(&[]);
        assert!(ensure_allowed(2, &license).is_ok());
        assert!(ensure_allowed(3, &license).unwrap_err().is_terminal());
    }

    #[tokio::test]
    async fn test_unknown_unit_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let d = dispatcher(dir.path());
        let result = DirectoryWatcher::new("w", "missing", &dir.path().join("in"), &dir.path().join("out"), d);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failed_submission_returns_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let d = dispatcher(dir.path());
        let watcher = DirectoryWatcher::new("inbox", "simple", &input, &dir.path().join("out"), Arc::clone(&d))
            .unwrap()
            .with_settle(Duration::ZERO);

        std::fs::write(input.join("contract.pdf"), MINIMAL_PDF).unwrap();
        d.shutdown();

        let mut inflight = HashMap::new();
        assert!(watcher.scan(&mut inflight).await.is_err());
        assert!(inflight.is_empty());
        assert_eq!(std::fs::read(input.join("contract.pdf")).unwrap(), MINIMAL_PDF);
        assert_eq!(std::fs::read_dir(dir.path().join("files")).unwrap().count(), 0);
        assert!(d.jobs_with_origin("watch:inbox").is_empty());
    }

    #[tokio::test]
    async fn test_signs_dropped_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        let d = dispatcher(dir.path());
        let handles = d.runner();

        let watcher = DirectoryWatcher::new("inbox", "simple", &input, &output, Arc::clone(&d))
            .unwrap()
            .with_poll_interval(Duration::from_millis(20))
            .with_settle(Duration::ZERO);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(cancel.clone()));

        std::fs::write(input.join("contract.pdf"), MINIMAL_PDF).unwrap();
        std::fs::write(input.join("broken.pdf"), b"not a pdf").unwrap();
        std::fs::write(input.join("readme.txt"), b"ignored").unwrap();

        wait_for(&output.join("contract.pdf")).await;
        wait_for(&output.join("failed").join("broken.pdf")).await;

        let mut signed = std::fs::File::open(output.join("contract.pdf")).unwrap();
        assert!(Ed25519Backend::verifier().verify(&mut signed).is_ok());
        assert!(!input.join("contract.pdf").exists());
        assert!(input.join("readme.txt").exists());

        // delivered jobs are removed
        for _ in 0..100 {
            if d.jobs_with_origin("watch:inbox").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(d.jobs_with_origin("watch:inbox").is_empty());

        cancel.cancel();
        task.await.unwrap();
        d.shutdown();
        for h in handles {
            h.await.unwrap();
        }
    }
}

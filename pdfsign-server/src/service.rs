// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Process wiring
//!
//! Builds the store, license and dispatcher from a [`ServiceConfig`], then
//! either runs the configured services until shutdown or pushes one batch
//! of documents through a unit and waits for it.

use crate::api::{self, AppState};
use anyhow::{bail, Context, Result};
use pdfsign_core::{
    backend::{Ed25519Backend, SignatureBackend},
    config::{ServiceConfig, ServiceType, SignerConfig, SignerType},
    crypto::machine_fingerprint,
    dispatcher::Dispatcher,
    executor::UnitExecutor,
    license::{parse_public_key, License, VENDOR_PUBLIC_KEY},
    model::{Job, Priority, TaskStatus},
    params::SignParams,
    store::{KvStore, SqliteStore},
    watcher::{ensure_allowed, DirectoryWatcher},
    VERIFY_UNIT,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Runtime {
    config: ServiceConfig,
    dispatcher: Arc<Dispatcher>,
    license: Arc<License>,
}

impl Runtime {
    /// Open the store, load the license and register one unit per signer
    /// plus the verification unit.
    ///
    /// `validate` overrides every service's `validateSignature`.
    pub fn build(config: ServiceConfig, validate: Option<bool>) -> Result<Self> {
        let database = config.database_path();
        let store: Arc<dyn KvStore> = Arc::new(
            SqliteStore::open(&database)
                .with_context(|| format!("Failed to open database {}", database.display()))?,
        );

        let public_key = parse_public_key(
            config
                .license_public_key
                .as_deref()
                .unwrap_or(VENDOR_PUBLIC_KEY),
        )
        .context("Invalid license public key")?;
        let license = License::load(
            Arc::clone(&store),
            config.license_path.as_deref(),
            &public_key,
            &machine_fingerprint(),
        )
        .context("Failed to load license")?;
        info!(
            licensee = %license.data().name,
            expires = %license.data().end,
            windows = license.windows().len(),
            "License loaded"
        );
        let license = Arc::new(license);

        let dispatcher = Dispatcher::new(store, Arc::clone(&license), &config.files_dir())?
            .with_queue_capacity(config.queue_capacity);

        for (name, signer) in &config.signers {
            let backend = load_backend(name, signer)?;
            let validates = validate.unwrap_or_else(|| validated_by_services(&config, name));
            dispatcher.add_sign_unit(name, signer.sign_data.clone(), UnitExecutor::new(backend, validates))?;
            info!(signer = %name, validate = validates, "Signer registered");
        }
        dispatcher.add_verify_unit(UnitExecutor::new(Arc::new(Ed25519Backend::verifier()), false));

        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
            license,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Run every configured service until `shutdown` resolves or a terminal
    /// error stops the dispatcher
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        ensure_allowed(self.config.watcher_count(), &self.license)?;

        // Everything that can fail on bad configuration happens before the
        // workers start
        let mut watchers = Vec::new();
        let mut servers = Vec::new();
        for (name, def) in &self.config.services {
            let signers = self.config.signers_for(name);
            match def.kind {
                ServiceType::Watch => {
                    let (Some(input), Some(output), Some(signer)) = (&def.input, &def.output, signers.first())
                    else {
                        bail!("watch service '{}' needs in, out and a signer", name);
                    };
                    watchers.push(DirectoryWatcher::new(
                        name,
                        signer,
                        input,
                        output,
                        Arc::clone(&self.dispatcher),
                    )?);
                }
                ServiceType::Serve => {
                    let port = def
                        .port
                        .with_context(|| format!("serve service '{}' needs a port", name))?;
                    let addr = format!("{}:{}", def.addr, port);
                    let listener = TcpListener::bind(&addr)
                        .await
                        .with_context(|| format!("Failed to bind {}", addr))?;
                    info!(service = %name, %addr, signers = ?signers, "HTTP service listening");
                    servers.push((listener, AppState::new(Arc::clone(&self.dispatcher), signers)));
                }
            }
        }

        let workers = self.dispatcher.runner();
        match self.dispatcher.load_from_db().await {
            Ok(requeued) => info!(requeued, "Recovered pending tasks"),
            Err(e) => {
                self.dispatcher.shutdown();
                join_workers(workers).await;
                return Err(e).context("Failed to recover jobs");
            }
        }

        let cancel = self.dispatcher.shutdown_token();
        let saver = tokio::spawn(Arc::clone(&self.license).auto_save(cancel.clone()));

        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            shutdown.await;
            info!("Shutdown signal received");
            dispatcher.shutdown();
        });

        let mut services: JoinSet<Result<()>> = JoinSet::new();
        for watcher in watchers {
            let cancel = cancel.clone();
            services.spawn(async move {
                watcher.run(cancel).await;
                Ok(())
            });
        }
        for (listener, state) in servers {
            let cancel = cancel.clone();
            services.spawn(async move {
                axum::serve(listener, api::router(state))
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await
                    .context("HTTP server failed")
            });
        }

        while let Some(result) = services.join_next().await {
            let failure = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(e) => e.to_string(),
            };
            error!(error = %failure, "Service stopped unexpectedly");
            self.dispatcher.shutdown();
        }
        cancel.cancelled().await;

        join_workers(workers).await;
        if let Err(e) = saver.await {
            warn!(error = %e, "License saver did not finish");
        }
        self.finish()
    }

    /// Push `files` through `unit` as one job and wait until every task is
    /// terminal. The inputs are copied, never moved.
    pub async fn run_job(&self, unit: &str, files: &[PathBuf]) -> Result<Job> {
        if !self.dispatcher.has_unit(unit) {
            bail!("unknown signer '{}'", unit);
        }

        let mut stored = Vec::with_capacity(files.len());
        for path in files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("{} is not a file", path.display()))?
                .to_string();
            let copy = self.dispatcher.new_file_path("pdf");
            tokio::fs::copy(path, &copy)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            stored.push((copy, name));
        }

        let workers = self.dispatcher.runner();
        let job_id = if unit == VERIFY_UNIT {
            self.dispatcher.add_verify_job()
        } else {
            self.dispatcher.add_sign_job(SignParams::default())
        };
        let priority = Priority::for_upload(stored.len());
        let outcome = match self
            .dispatcher
            .add_batch_persistent_tasks(unit, &job_id, stored, priority)
            .await
        {
            Ok(_) => self.wait_terminal(&job_id).await,
            Err(e) => Err(e.into()),
        };

        self.dispatcher.shutdown();
        join_workers(workers).await;
        self.finish()?;
        outcome
    }

    /// Copy completed outputs of a sign job into `out_dir`, then delete the
    /// job. Returns the number of failed tasks.
    pub fn deliver(&self, job: &Job, out_dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("Failed to create {}", out_dir.display()))?;

        let mut failed = 0;
        for task in job.tasks.values() {
            if task.status != TaskStatus::Completed {
                failed += 1;
                error!(file = %task.file_name, error = task.error.as_deref().unwrap_or_default(), "Signing failed");
                continue;
            }
            let target = out_dir.join(&task.file_name);
            std::fs::copy(&task.output_path, &target)
                .with_context(|| format!("Failed to write {}", target.display()))?;
            info!(file = %task.file_name, output = %target.display(), "Signed");
        }
        self.dispatcher.delete_job(&job.id)?;
        Ok(failed)
    }

    /// Remove a finished job and its files
    pub fn discard(&self, job: &Job) -> Result<()> {
        self.dispatcher.delete_job(&job.id)?;
        Ok(())
    }

    async fn wait_terminal(&self, job_id: &str) -> Result<Job> {
        let cancel = self.dispatcher.shutdown_token();
        loop {
            let job = self.dispatcher.get_job_by_id(job_id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => bail!("interrupted before the job finished"),
                _ = tokio::time::sleep(JOB_POLL_INTERVAL) => {}
            }
        }
    }

    /// Persist the counters and surface a terminal error
    fn finish(&self) -> Result<()> {
        if let Err(e) = self.license.save() {
            warn!(error = %e, "Failed to save license counters");
        }
        match self.dispatcher.fatal_error() {
            Some(message) => bail!("stopped after a terminal error: {}", message),
            None => Ok(()),
        }
    }
}

fn load_backend(name: &str, signer: &SignerConfig) -> Result<Arc<dyn SignatureBackend>> {
    match signer.kind {
        SignerType::Pem => {
            let (Some(key), Some(cert)) = (&signer.key, &signer.cert) else {
                bail!("pem signer '{}' needs both cert and key", name);
            };
            let backend = Ed25519Backend::from_pem_files(key, cert, signer.chain.as_deref())
                .with_context(|| format!("Failed to load signer '{}'", name))?;
            Ok(Arc::new(backend))
        }
        SignerType::Pksc11 => bail!(
            "signer '{}': PKCS#11 tokens are not supported by this build",
            name
        ),
    }
}

/// A unit re-verifies its output when any service using it asks to
fn validated_by_services(config: &ServiceConfig, signer: &str) -> bool {
    config
        .services
        .iter()
        .filter(|(_, def)| def.validate_signature)
        .any(|(name, _)| config.signers_for(name).iter().any(|s| s == signer))
}

async fn join_workers(workers: Vec<tokio::task::JoinHandle<()>>) {
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use ed25519_dalek::SigningKey;
    use pdfsign_core::license::{LicenseData, SignedLicense};
    use rand::rngs::OsRng;

    const PDF: &[u8] = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\ntrailer\n<< /Root 1 0 R >>\n%%EOF\n";

    /// Configuration with one PEM signer, a license issued by a fresh vendor
    /// key and the given services block
    fn config(dir: &Path, services: &str) -> ServiceConfig {
        let signer = SigningKey::generate(&mut OsRng);
        let key_path = dir.join("signer.key");
        let cert_path = dir.join("signer.pem");
        std::fs::write(&key_path, signer.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        std::fs::write(
            &cert_path,
            signer.verifying_key().to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();

        let vendor = SigningKey::generate(&mut OsRng);
        let data = LicenseData {
            name: "Test".to_string(),
            email: "test@example.com".to_string(),
            end: chrono::Utc::now() + chrono::Duration::days(30),
            limits: Vec::new(),
            max_directory_watchers: 1,
        };
        let license_path = dir.join("license.json");
        std::fs::write(&license_path, SignedLicense::issue(&data, &vendor).unwrap().to_bytes().unwrap()).unwrap();

        let yaml = format!(
            r#"
licensePath: {license}
licensePublicKey: "{public}"
dataDir: {data}
services:
{services}
signers:
  simple:
    type: pem
    cert: {cert}
    key: {key}
    signData:
      reason: Approved
"#,
            license = license_path.display(),
            public = hex::encode(vendor.verifying_key().as_bytes()),
            data = dir.join("data").display(),
            cert = cert_path.display(),
            key = key_path.display(),
        );
        let path = dir.join("pdfsign.yaml");
        std::fs::write(&path, yaml).unwrap();
        ServiceConfig::load(&path).unwrap()
    }

    const API_SERVICE: &str = "  api:\n    type: serve\n    port: 0\n    signers: [simple]\n    validateSignature: true\n";

    #[tokio::test]
    async fn test_build_registers_units() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::build(config(dir.path(), API_SERVICE), None).unwrap();

        let mut units = runtime.dispatcher().unit_names();
        units.sort();
        assert_eq!(units, vec!["simple".to_string(), VERIFY_UNIT.to_string()]);
        assert!(dir.path().join("data").join("pdfsign.db").exists());
    }

    #[tokio::test]
    async fn test_pksc11_signer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), API_SERVICE);
        let simple = config.signers.get_mut("simple").unwrap();
        simple.kind = SignerType::Pksc11;
        simple.lib = Some(PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"));

        let error = Runtime::build(config, None).err().unwrap();
        assert!(format!("{:#}", error).contains("PKCS#11"));
    }

    #[tokio::test]
    async fn test_run_job_signs_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::build(config(dir.path(), API_SERVICE), Some(true)).unwrap();

        let good = dir.path().join("contract.pdf");
        let bad = dir.path().join("broken.pdf");
        std::fs::write(&good, PDF).unwrap();
        std::fs::write(&bad, b"garbage").unwrap();

        let job = runtime.run_job("simple", &[good.clone(), bad]).await.unwrap();
        assert!(job.is_terminal());
        assert_eq!(job.tasks_with_status(TaskStatus::Completed).len(), 1);

        let out = dir.path().join("signed");
        assert_eq!(runtime.deliver(&job, &out).unwrap(), 1);

        let signed = std::fs::read(out.join("contract.pdf")).unwrap();
        let report = Ed25519Backend::verifier()
            .verify(&mut std::io::Cursor::new(signed))
            .unwrap();
        assert_eq!(report.signatures[0].reason, "Approved");
        // inputs are copied, never consumed
        assert!(good.exists());
        assert!(runtime.dispatcher().get_job_by_id(&job.id).is_err());
    }

    #[tokio::test]
    async fn test_run_job_unknown_unit() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Runtime::build(config(dir.path(), API_SERVICE), None).unwrap();
        assert!(runtime.run_job("missing", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let watch = format!(
            "{}  inbox:\n    type: watch\n    signer: simple\n    in: {}\n    out: {}\n",
            API_SERVICE,
            dir.path().join("in").display(),
            dir.path().join("out").display()
        );
        let runtime = Runtime::build(config(dir.path(), &watch), None).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(runtime.serve(async {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(dir.path().join("in").is_dir());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watchers_bounded_by_license() {
        let dir = tempfile::tempdir().unwrap();
        let services = format!(
            "  a:\n    type: watch\n    signer: simple\n    in: {0}/a-in\n    out: {0}/a-out\n  b:\n    type: watch\n    signer: simple\n    in: {0}/b-in\n    out: {0}/b-out\n",
            dir.path().display()
        );
        let runtime = Runtime::build(config(dir.path(), &services), None).unwrap();
        let error = runtime.serve(std::future::pending()).await.unwrap_err();
        assert!(format!("{:#}", error).contains("directory watchers"));
    }
}

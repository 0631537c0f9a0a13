// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Per-task action of a unit
//!
//! Runs on the blocking pool; every call does file I/O and may reach a TSA.

use crate::backend::{SignatureBackend, VerifyReport};
use crate::model::Task;
use crate::params::SignParams;
use crate::{Error, Result};
use chrono::Utc;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Signing primitive plus stamping and optional self-verification
#[derive(Clone)]
pub struct UnitExecutor {
    backend: Arc<dyn SignatureBackend>,
    validate: bool,
}

impl UnitExecutor {
    /// `validate` re-verifies every signed output before reporting success
    pub fn new(backend: Arc<dyn SignatureBackend>, validate: bool) -> Self {
        Self { backend, validate }
    }

    pub fn validates(&self) -> bool {
        self.validate
    }

    /// Sign the task's input into its output with merged parameters
    #[instrument(skip(self, params), fields(task = %task.id, job = %task.job_id, file = %task.file_name))]
    pub fn sign(&self, task: &Task, params: &SignParams) -> Result<()> {
        let mut params = params.clone();
        params.date = Some(Utc::now());

        self.backend
            .sign(&task.input_path, &task.output_path, &params)?;

        if self.validate {
            let mut output = File::open(&task.output_path)?;
            let report = self
                .backend
                .verify(&mut output)
                .map_err(|e| Error::Signing(format!("self-verification failed: {}", e)))?;
            debug!(signatures = report.signatures.len(), "Output verified");
        }

        info!("Document signed");
        Ok(())
    }

    /// Verify every signature in the document at `path`
    #[instrument(skip(self))]
    pub fn verify(&self, path: &Path) -> Result<VerifyReport> {
        let mut input = File::open(path)?;
        let report = self.backend.verify(&mut input)?;
        info!(signatures = report.signatures.len(), "Document verified");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::MINIMAL_PDF;
    use crate::backend::Ed25519Backend;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::io::Read;

    /// Writes the input through untouched, so the output carries no signature
    struct CopyBackend;

    impl SignatureBackend for CopyBackend {
        fn sign(&self, input: &Path, output: &Path, _params: &SignParams) -> Result<()> {
            std::fs::copy(input, output)?;
            Ok(())
        }

        fn verify(&self, input: &mut dyn Read) -> Result<VerifyReport> {
            Ed25519Backend::verifier().verify(input)
        }
    }

    fn task_in(dir: &Path, content: &[u8]) -> Task {
        let input = dir.join("in.pdf");
        std::fs::write(&input, content).unwrap();
        Task::new("job", "simple", input, dir.join("out.pdf"), "doc.pdf")
    }

    fn signer() -> Arc<dyn SignatureBackend> {
        Arc::new(Ed25519Backend::from_signing_key(SigningKey::generate(&mut OsRng)))
    }

    #[test]
    fn test_sign_stamps_date() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path(), MINIMAL_PDF);
        let executor = UnitExecutor::new(signer(), true);

        let before = Utc::now();
        executor.sign(&task, &SignParams::default()).unwrap();

        let report = executor.verify(&task.output_path).unwrap();
        let signed_at = report.signatures[0].signed_at.unwrap();
        assert!(signed_at >= before);
    }

    #[test]
    fn test_self_verification_catches_unsigned_output() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path(), MINIMAL_PDF);

        let lenient = UnitExecutor::new(Arc::new(CopyBackend), false);
        lenient.sign(&task, &SignParams::default()).unwrap();

        let strict = UnitExecutor::new(Arc::new(CopyBackend), true);
        let err = strict.sign(&task, &SignParams::default()).unwrap_err();
        assert!(err.to_string().contains("self-verification"));
    }

    #[test]
    fn test_malformed_input_fails() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path(), b"this is not a pdf");
        let executor = UnitExecutor::new(signer(), false);

        assert!(executor.sign(&task, &SignParams::default()).is_err());
        assert!(!task.output_path.exists());
    }

    #[test]
    fn test_verify_missing_file() {
        let executor = UnitExecutor::new(Arc::new(Ed25519Backend::verifier()), false);
        assert!(executor.verify(Path::new("/nonexistent/file.pdf")).is_err());
    }
}

// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Service configuration
//!
//! Layers, lowest precedence first: the configuration file (YAML, JSON or
//! TOML), `PDFSIGN__`-prefixed environment variables using `__` as the
//! nesting separator, then command-line overrides applied by the binary.

use crate::params::SignParams;
use crate::{Error, Result, DEFAULT_QUEUE_CAPACITY, VERIFY_UNIT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PDFSIGN";

/// What a service does with its signers
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Poll an input directory
    Watch,
    /// HTTP API
    Serve,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDef {
    #[serde(rename = "type")]
    pub kind: ServiceType,

    /// Single signer, for watchers
    #[serde(default)]
    pub signer: Option<String>,

    /// Signers exposed by an HTTP service
    #[serde(default)]
    pub signers: Vec<String>,

    #[serde(default, rename = "in")]
    pub input: Option<PathBuf>,

    #[serde(default, rename = "out")]
    pub output: Option<PathBuf>,

    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default)]
    pub port: Option<u16>,

    /// Re-verify every signed output
    #[serde(default, alias = "validatesignature")]
    pub validate_signature: bool,
}

/// Where a signer's key lives
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignerType {
    Pem,
    #[serde(alias = "pkcs11")]
    Pksc11,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignerConfig {
    #[serde(rename = "type")]
    pub kind: SignerType,

    /// Certificate (PEM)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Private key (PEM)
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// PKCS#11 module
    #[serde(default)]
    pub lib: Option<PathBuf>,

    /// PKCS#11 PIN
    #[serde(default)]
    pub pass: Option<String>,

    #[serde(default)]
    pub chain: Option<PathBuf>,

    /// Default signing parameters of the unit
    #[serde(default, alias = "signdata")]
    pub sign_data: SignParams,
}

/// Per-signer command-line overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignerOverrides {
    pub cert_type: Option<u32>,
    pub doc_mdp: Option<u32>,
    pub name: Option<String>,
    pub location: Option<String>,
    pub reason: Option<String>,
    pub contact: Option<String>,
    pub tsa_url: Option<String>,
    pub tsa_username: Option<String>,
    pub tsa_password: Option<String>,
    pub chain: Option<PathBuf>,
}

/// Whole configuration document
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default, alias = "licensepath")]
    pub license_path: Option<PathBuf>,

    /// Hex Ed25519 key verifying the license; the vendor key when unset
    #[serde(default, alias = "licensepublickey")]
    pub license_public_key: Option<String>,

    /// Database and stored files
    #[serde(default = "default_data_dir", alias = "datadir")]
    pub data_dir: PathBuf,

    /// Per-band capacity of every unit queue
    #[serde(default = "default_queue_capacity", alias = "queuecapacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceDef>,

    #[serde(default)]
    pub signers: BTreeMap<String, SignerConfig>,
}

impl ServiceConfig {
    /// Load the file at `path` and apply the environment layer
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_layers(path, None)
    }

    /// `env` replaces the process environment, for tests
    fn load_layers(path: &Path, env: Option<config::Map<String, String>>) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queueCapacity must be > 0".to_string()));
        }

        for (name, signer) in &self.signers {
            if name == VERIFY_UNIT {
                return Err(Error::Config(format!(
                    "signer name '{}' is reserved",
                    VERIFY_UNIT
                )));
            }

            match signer.kind {
                SignerType::Pem if signer.cert.is_none() || signer.key.is_none() => {
                    return Err(Error::Config(format!(
                        "pem signer '{}' needs both cert and key",
                        name
                    )));
                }
                SignerType::Pksc11 if signer.lib.is_none() => {
                    return Err(Error::Config(format!(
                        "pksc11 signer '{}' needs lib",
                        name
                    )));
                }
                _ => {}
            }

            signer
                .sign_data
                .validate()
                .map_err(|e| Error::Config(format!("signer '{}': {}", name, e)))?;
        }

        for (name, service) in &self.services {
            let signers = self.signers_for(name);
            if signers.is_empty() {
                return Err(Error::Config(format!("service '{}' has no signer", name)));
            }
            if let Some(unknown) = signers.iter().find(|s| !self.signers.contains_key(*s)) {
                return Err(Error::Config(format!(
                    "service '{}' references unknown signer '{}'",
                    name, unknown
                )));
            }

            match service.kind {
                ServiceType::Watch => {
                    if service.input.is_none() || service.output.is_none() {
                        return Err(Error::Config(format!(
                            "watch service '{}' needs in and out",
                            name
                        )));
                    }
                    if signers.len() > 1 {
                        return Err(Error::Config(format!(
                            "watch service '{}' takes exactly one signer",
                            name
                        )));
                    }
                }
                ServiceType::Serve => {
                    if service.port.is_none() {
                        return Err(Error::Config(format!(
                            "serve service '{}' needs a port",
                            name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Signers of a service: `signer` followed by `signers`, without duplicates
    pub fn signers_for(&self, service: &str) -> Vec<String> {
        let Some(def) = self.services.get(service) else {
            return Vec::new();
        };
        let mut names: Vec<String> = def.signer.iter().cloned().collect();
        for name in &def.signers {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Apply command-line overrides to one signer
    pub fn apply_overrides(&mut self, signer: &str, overrides: &SignerOverrides) -> Result<()> {
        let config = self
            .signers
            .get_mut(signer)
            .ok_or_else(|| Error::Config(format!("unknown signer '{}'", signer)))?;
        let data = &mut config.sign_data;

        if let Some(v) = overrides.cert_type {
            data.cert_type = v;
        }
        if let Some(v) = overrides.doc_mdp {
            data.doc_mdp = v;
        }
        if let Some(v) = &overrides.name {
            data.name = v.clone();
        }
        if let Some(v) = &overrides.location {
            data.location = v.clone();
        }
        if let Some(v) = &overrides.reason {
            data.reason = v.clone();
        }
        if let Some(v) = &overrides.contact {
            data.contact_info = v.clone();
        }
        if let Some(v) = &overrides.tsa_url {
            data.tsa.url = v.clone();
        }
        if let Some(v) = &overrides.tsa_username {
            data.tsa.username = v.clone();
        }
        if let Some(v) = &overrides.tsa_password {
            data.tsa.password = v.clone();
        }
        if let Some(v) = &overrides.chain {
            config.chain = Some(v.clone());
        }

        config
            .sign_data
            .validate()
            .map_err(|e| Error::Config(format!("signer '{}': {}", signer, e)))
    }

    /// Number of directory watchers, checked against the license
    pub fn watcher_count(&self) -> usize {
        self.services
            .values()
            .filter(|s| s.kind == ServiceType::Watch)
            .count()
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("pdfsign.db")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
licensePath: /etc/pdfsign/license.json
dataDir: /var/lib/pdfsign
services:
  api:
    type: serve
    signers: [simple, tsa]
    port: 8080
    validateSignature: true
  inbox:
    type: watch
    signer: simple
    in: /srv/in
    out: /srv/out
signers:
  simple:
    type: pem
    cert: /etc/pdfsign/cert.pem
    key: /etc/pdfsign/key.pem
    signData:
      name: ACME
      reason: Approved
      certType: 2
  tsa:
    type: pem
    cert: /etc/pdfsign/cert.pem
    key: /etc/pdfsign/key.pem
    signData:
      tsa:
        url: https://tsa.example.com/tsr
"#;

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pdfsign.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn sample() -> ServiceConfig {
        let (_dir, path) = write(SAMPLE);
        ServiceConfig::load_layers(&path, Some(config::Map::new())).unwrap()
    }

    #[test]
    fn test_load_yaml() {
        let config = sample();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pdfsign"));
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.watcher_count(), 1);

        let api = &config.services["api"];
        assert_eq!(api.kind, ServiceType::Serve);
        assert!(api.validate_signature);
        assert_eq!(api.addr, "0.0.0.0");

        let simple = &config.signers["simple"];
        assert_eq!(simple.kind, SignerType::Pem);
        assert_eq!(simple.sign_data.name, "ACME");
        assert_eq!(simple.sign_data.cert_type, 2);
        assert_eq!(config.signers["tsa"].sign_data.tsa.url, "https://tsa.example.com/tsr");
    }

    #[test]
    fn test_environment_layer() {
        let (_dir, path) = write(SAMPLE);
        let mut env = config::Map::new();
        env.insert("PDFSIGN__SERVICES__API__PORT".to_string(), "9090".to_string());

        let config = ServiceConfig::load_layers(&path, Some(env)).unwrap();
        assert_eq!(config.services["api"].port, Some(9090));
    }

    #[test]
    fn test_missing_file() {
        assert!(ServiceConfig::load(Path::new("/nonexistent/pdfsign.yaml")).is_err());
    }

    #[test]
    fn test_signers_for() {
        let config = sample();
        assert_eq!(config.signers_for("api"), vec!["simple", "tsa"]);
        assert_eq!(config.signers_for("inbox"), vec!["simple"]);
        assert!(config.signers_for("missing").is_empty());
    }

    #[test]
    fn test_validation_rejects_bad_references() {
        let mut config = sample();
        config.services.get_mut("api").unwrap().signers.push("ghost".to_string());
        assert!(config.validate().unwrap_err().to_string().contains("ghost"));

        let mut config = sample();
        config.services.get_mut("inbox").unwrap().output = None;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.services.get_mut("api").unwrap().port = None;
        assert!(config.validate().is_err());

        let mut config = sample();
        let api = config.services.get_mut("api").unwrap();
        api.signers.clear();
        assert!(config.validate().unwrap_err().to_string().contains("no signer"));
    }

    #[test]
    fn test_validation_rejects_bad_tsa_url() {
        let mut config = sample();
        config.signers.get_mut("tsa").unwrap().sign_data.tsa.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = sample();
        let overrides = SignerOverrides {
            reason: Some("Reviewed".to_string()),
            doc_mdp: Some(1),
            chain: Some(PathBuf::from("/etc/pdfsign/chain.pem")),
            ..SignerOverrides::default()
        };
        config.apply_overrides("simple", &overrides).unwrap();

        let simple = &config.signers["simple"];
        assert_eq!(simple.sign_data.reason, "Reviewed");
        assert_eq!(simple.sign_data.name, "ACME");
        assert_eq!(simple.sign_data.doc_mdp, 1);
        assert_eq!(simple.chain.as_deref(), Some(Path::new("/etc/pdfsign/chain.pem")));

        assert!(config.apply_overrides("ghost", &overrides).is_err());
        let bad = SignerOverrides {
            cert_type: Some(9),
            ..SignerOverrides::default()
        };
        assert!(config.apply_overrides("simple", &bad).is_err());
    }
}

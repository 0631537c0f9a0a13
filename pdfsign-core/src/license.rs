// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! License envelope around the rate limiter
//!
//! A license is a JSON document signed with the vendor's Ed25519 key. It
//! carries an expiry date, the rate-limit windows and the number of directory
//! watchers allowed. The limiter counters are sealed with a key derived from
//! the canonical license bytes and persisted so restarts cannot reset them; the first
//! host to load the counters is recorded and any other host is refused.

use crate::crypto::{decode_base64, encode_base64, CounterKey};
use crate::limiter::{RateLimiter, Window};
use crate::store::{KvStore, LICENSE_KEY, LICENSE_LIMITS_KEY, LICENSE_MACHINE_KEY};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Vendor key that signs production licenses
pub const VENDOR_PUBLIC_KEY: &str =
    "27ddd0da64f226303fc515d2df333c02863bbd6daaca623a96e3d377f4c92a7e";

const AUTO_SAVE_PERIOD: Duration = Duration::from_secs(1);

/// One window as written in a license
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub max: u64,
    pub interval: String,
}

/// Signed license contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseData {
    pub name: String,
    pub email: String,
    /// Expiry
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub limits: Vec<LimitSpec>,
    #[serde(default)]
    pub max_directory_watchers: usize,
}

/// License file: base64 JSON payload plus detached signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedLicense {
    pub data: String,
    pub signature: String,
}

impl SignedLicense {
    /// Sign `data` with the vendor key
    pub fn issue(data: &LicenseData, key: &SigningKey) -> Result<Self> {
        let payload = serde_json::to_vec(data)?;
        let signature = key.sign(&payload);
        Ok(Self {
            data: encode_base64(&payload),
            signature: encode_base64(&signature.to_bytes()),
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::License(format!("malformed license: {}", e)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Compact encoding of the decoded payload and signature.
    ///
    /// Two files carrying the same signed license yield the same bytes
    /// whatever their whitespace, key order or base64 padding.
    pub fn canonical(&self) -> Result<Vec<u8>> {
        let canonical = Self {
            data: encode_base64(&decode_base64(&self.data)?),
            signature: encode_base64(&decode_base64(&self.signature)?),
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Check the signature and decode the payload
    pub fn verify(&self, public_key: &VerifyingKey) -> Result<LicenseData> {
        let payload = decode_base64(&self.data)?;
        let signature = Signature::from_slice(&decode_base64(&self.signature)?)
            .map_err(|e| Error::License(format!("malformed license signature: {}", e)))?;

        public_key
            .verify(&payload, &signature)
            .map_err(|_| Error::License("license signature is invalid".to_string()))?;

        serde_json::from_slice(&payload)
            .map_err(|e| Error::License(format!("malformed license payload: {}", e)))
    }
}

/// Parse a hex-encoded Ed25519 public key
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key.trim())
        .map_err(|e| Error::Config(format!("license public key is not hex: {}", e)))?
        .try_into()
        .map_err(|_| Error::Config("license public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| Error::Config(format!("invalid license public key: {}", e)))
}

/// Wall clock advanced by the runtime's monotonic clock
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.wall + chrono::Duration::from_std(self.mono.elapsed()).unwrap_or(chrono::Duration::zero())
    }
}

/// Loaded, validated license gating every signing action
pub struct License {
    data: LicenseData,
    limiter: RateLimiter,
    key: CounterKey,
    store: Arc<dyn KvStore>,
    clock: Clock,
}

impl std::fmt::Debug for License {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("License")
            .field("data", &self.data)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl License {
    /// Load the license from `path`, or the copy stored by a previous run.
    ///
    /// Fails when the signature is invalid, the license expired, the store
    /// belongs to another host or the stored counters cannot be decrypted.
    pub fn load(
        store: Arc<dyn KvStore>,
        path: Option<&Path>,
        public_key: &VerifyingKey,
        fingerprint: &str,
    ) -> Result<Self> {
        let stored = store.get(LICENSE_KEY)?;
        let bytes = match (path, &stored) {
            (Some(path), _) => std::fs::read(path).map_err(|e| {
                Error::License(format!("cannot read license {}: {}", path.display(), e))
            })?,
            (None, Some(bytes)) => bytes.clone(),
            (None, None) => return Err(Error::License("no license configured".to_string())),
        };

        let signed = SignedLicense::parse(&bytes)?;
        let data = signed.verify(public_key)?;
        let canonical = signed.canonical()?;
        let clock = Clock::start();
        if clock.now() > data.end {
            return Err(Error::License(format!("license expired on {}", data.end)));
        }

        match store.get(LICENSE_MACHINE_KEY)? {
            Some(bound) if bound != fingerprint.as_bytes() => {
                return Err(Error::License(
                    "license state belongs to another host".to_string(),
                ));
            }
            Some(_) => {}
            None => store.put(LICENSE_MACHINE_KEY, fingerprint.as_bytes())?,
        }

        let windows = data
            .limits
            .iter()
            .map(|limit| Window::new(limit.max, &limit.interval))
            .collect::<Result<Vec<_>>>()?;
        let limiter = RateLimiter::new(windows);
        let key = CounterKey::derive(&canonical, public_key.as_bytes())?;

        if stored.as_deref() == Some(canonical.as_slice()) {
            if let Some(sealed) = store.get(LICENSE_LIMITS_KEY)? {
                let plain = key.open(&sealed).map_err(|_| {
                    Error::License("license counters cannot be decrypted".to_string())
                })?;
                let saved: Vec<Window> = serde_json::from_slice(&plain)
                    .map_err(|e| Error::License(format!("corrupt license counters: {}", e)))?;
                limiter.restore(&saved);
                debug!(windows = saved.len(), "Restored license counters");
            }
        } else {
            info!(licensee = %data.name, "Installing new license");
            store.put(LICENSE_KEY, &canonical)?;
            store.delete(LICENSE_LIMITS_KEY)?;
        }

        info!(
            licensee = %data.name,
            expires = %data.end,
            windows = data.limits.len(),
            "License loaded"
        );

        Ok(Self {
            data,
            limiter,
            key,
            store,
            clock,
        })
    }

    pub fn data(&self) -> &LicenseData {
        &self.data
    }

    pub fn max_directory_watchers(&self) -> usize {
        self.data.max_directory_watchers
    }

    /// Block until every window allows one more action.
    ///
    /// Returns how long the caller was throttled. Expiry and an exhausted
    /// total window are terminal errors.
    pub async fn wait(&self) -> Result<Duration> {
        let mut throttled = Duration::ZERO;
        loop {
            let now = self.clock.now();
            if now > self.data.end {
                return Err(Error::License(format!(
                    "license expired on {}",
                    self.data.end
                )));
            }

            let (ok, window) = self.limiter.allow_at(now);
            let window = match (ok, window) {
                (true, _) | (false, None) => return Ok(throttled),
                (false, Some(window)) => window,
            };

            if window.is_total() {
                return Err(Error::License(format!(
                    "total allowance of {} signatures exhausted",
                    window.max
                )));
            }

            let pause = window.remaining_at(now).max(Duration::from_millis(1));
            info!(
                max = window.max,
                interval = %window.interval,
                pause_ms = pause.as_millis() as u64,
                "Rate limit reached, waiting"
            );
            tokio::time::sleep(pause).await;
            throttled += pause;
        }
    }

    /// Seal and persist the counters
    pub fn save(&self) -> Result<()> {
        let plain = serde_json::to_vec(&self.limiter.snapshot())?;
        let sealed = self.key.seal(&plain)?;
        self.store.put(LICENSE_LIMITS_KEY, &sealed)
    }

    /// Persist counters once per second while they change; saves once more on cancel
    pub async fn auto_save(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(AUTO_SAVE_PERIOD);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.limiter.take_dirty() {
                        if let Err(e) = self.save() {
                            warn!(error = %e, "Failed to save license counters");
                            self.limiter.mark_dirty();
                        }
                    }
                }
            }
        }

        if let Err(e) = self.save() {
            error!(error = %e, "Failed to save license counters on shutdown");
        }
    }

    /// Counter snapshot, for diagnostics
    pub fn windows(&self) -> Vec<Window> {
        self.limiter.snapshot()
    }
}

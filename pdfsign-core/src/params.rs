// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Signing parameters and the override merge rule

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Certification signature (DocMDP applies)
pub const CERT_TYPE_CERTIFICATION: u32 = 1;
/// Approval signature
pub const CERT_TYPE_APPROVAL: u32 = 2;
/// Usage rights signature
pub const CERT_TYPE_USAGE_RIGHTS: u32 = 3;
/// Document timestamp signature
pub const CERT_TYPE_TIMESTAMP: u32 = 4;

/// DocMDP: no changes allowed after signing
pub const DOCMDP_NO_CHANGES: u32 = 1;
/// DocMDP: form filling and signing allowed
pub const DOCMDP_FILL_FORMS: u32 = 2;
/// DocMDP: form filling, signing and annotations allowed
pub const DOCMDP_ANNOTATE: u32 = 3;

/// Time-stamping authority endpoint and credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsaParams {
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Parameters describing one signature
///
/// Used both as immutable unit defaults and as per-job overrides. Zero values
/// (empty strings, `0`, `false`) mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignParams {
    pub name: String,
    pub location: String,
    pub reason: String,
    #[serde(alias = "contactinfo", alias = "contact")]
    pub contact_info: String,
    #[serde(alias = "certtype")]
    pub cert_type: u32,
    #[serde(alias = "docmdp", alias = "docMDP")]
    pub doc_mdp: u32,
    pub approval: bool,
    pub tsa: TsaParams,
    /// Signing time, stamped by the executor right before signing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl SignParams {
    /// Combine per-job overrides with unit defaults.
    ///
    /// Every field is merged independently: a non-empty override wins, a blank
    /// override leaves the default in place.
    pub fn merge(overrides: &SignParams, defaults: &SignParams) -> SignParams {
        SignParams {
            name: pick_str(&overrides.name, &defaults.name),
            location: pick_str(&overrides.location, &defaults.location),
            reason: pick_str(&overrides.reason, &defaults.reason),
            contact_info: pick_str(&overrides.contact_info, &defaults.contact_info),
            cert_type: pick_num(overrides.cert_type, defaults.cert_type),
            doc_mdp: pick_num(overrides.doc_mdp, defaults.doc_mdp),
            approval: overrides.approval || defaults.approval,
            tsa: TsaParams {
                url: pick_str(&overrides.tsa.url, &defaults.tsa.url),
                username: pick_str(&overrides.tsa.username, &defaults.tsa.username),
                password: pick_str(&overrides.tsa.password, &defaults.tsa.password),
            },
            date: overrides.date.or(defaults.date),
        }
    }

    /// Validate ranges and the TSA endpoint
    pub fn validate(&self) -> Result<()> {
        if self.cert_type > CERT_TYPE_TIMESTAMP {
            return Err(Error::Validation(format!(
                "certType must be between 0 and {}, got {}",
                CERT_TYPE_TIMESTAMP, self.cert_type
            )));
        }

        if self.doc_mdp > DOCMDP_ANNOTATE {
            return Err(Error::Validation(format!(
                "docMdp must be between 0 and {}, got {}",
                DOCMDP_ANNOTATE, self.doc_mdp
            )));
        }

        if !self.tsa.url.is_empty() {
            Url::parse(&self.tsa.url)
                .map_err(|e| Error::Validation(format!("Invalid TSA url '{}': {}", self.tsa.url, e)))?;
        }

        Ok(())
    }

    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self == &SignParams::default()
    }
}

fn pick_str(over: &str, default: &str) -> String {
    if over.trim().is_empty() {
        default.to_string()
    } else {
        over.to_string()
    }
}

fn pick_num(over: u32, default: u32) -> u32 {
    if over == 0 {
        default
    } else {
        over
    }
}

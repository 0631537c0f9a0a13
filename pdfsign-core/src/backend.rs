// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Signing and verification primitives
//!
//! [`SignatureBackend`] is the seam between the scheduler and the code that
//! actually touches PDF bytes. The bundled [`Ed25519Backend`] appends an
//! incremental signature block after the document's last `%%EOF`:
//!
//! ```text
//! <original document bytes>
//! %PDFSIGN-1 <base64(json block)>
//! %%EOF
//! ```
//!
//! The block carries a SHA-256 digest of every byte preceding it, the signed
//! fields and an Ed25519 signature over `digest || fields`. Blocks stack, so a
//! signed document can be counter-signed. CMS/PKCS#7 embedding and PKCS#11
//! tokens plug in through the same trait.

use crate::crypto::{decode_base64, encode_base64, sha256, sha256_hex};
use crate::params::SignParams;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Marker opening a signature block
pub const SIGNATURE_MARKER: &[u8] = b"\n%PDFSIGN-1 ";

const PDF_HEADER: &[u8] = b"%PDF-";
const PDF_EOF: &[u8] = b"%%EOF";
/// `%%EOF` must appear within this many trailing bytes
const EOF_SEARCH_WINDOW: usize = 1024;

/// Signing/verification primitive used by unit executors
pub trait SignatureBackend: Send + Sync {
    /// Sign `input` into `output` using fully merged parameters
    fn sign(&self, input: &Path, output: &Path, params: &SignParams) -> Result<()>;

    /// Verify every signature of the document read from `input`
    fn verify(&self, input: &mut dyn Read) -> Result<VerifyReport>;
}

/// Result of verifying a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Signatures in document order, oldest first
    pub signatures: Vec<SignatureInfo>,
    /// SHA-256 of the whole verified document
    pub document_digest: String,
}

/// One verified signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub name: String,
    pub location: String,
    pub reason: String,
    pub contact_info: String,
    pub cert_type: u32,
    pub doc_mdp: u32,
    pub approval: bool,
    pub signed_at: Option<DateTime<Utc>>,
    pub tsa_url: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// SHA-256 fingerprint of the signer certificate
    pub certificate: String,
    /// SHA-256 fingerprint of the certificate chain, if one was attached
    pub chain: Option<String>,
}

/// Fields covered by the signature; credentials never leave the service
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedFields {
    name: String,
    location: String,
    reason: String,
    contact_info: String,
    cert_type: u32,
    doc_mdp: u32,
    approval: bool,
    date: Option<DateTime<Utc>>,
    tsa_url: String,
    certificate: String,
    chain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignatureBlock {
    /// base64 of the exact signed JSON bytes
    fields: String,
    public_key: String,
    digest: String,
    signature: String,
}

struct Identity {
    key: SigningKey,
    certificate: String,
    chain: Option<String>,
}

/// Ed25519 signing backend
///
/// Without an identity it can only verify.
pub struct Ed25519Backend {
    identity: Option<Identity>,
}

impl Ed25519Backend {
    /// Verification-only backend
    pub fn verifier() -> Self {
        Self { identity: None }
    }

    /// Backend signing with an in-memory key; the certificate is the public key itself
    pub fn from_signing_key(key: SigningKey) -> Self {
        let certificate = sha256_hex(key.verifying_key().as_bytes());
        Self {
            identity: Some(Identity {
                key,
                certificate,
                chain: None,
            }),
        }
    }

    /// Load a PKCS#8 PEM private key and the matching SPKI PEM certificate.
    ///
    /// Unreadable keys or a certificate that does not match the key are
    /// reported as errors so a misconfigured signer never starts.
    pub fn from_pem_files(key_path: &Path, cert_path: &Path, chain_path: Option<&Path>) -> Result<Self> {
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            Error::Crypto(format!("Cannot read key {}: {}", key_path.display(), e))
        })?;
        let key = SigningKey::from_pkcs8_pem(&key_pem).map_err(|e| {
            Error::Crypto(format!("Invalid private key {}: {}", key_path.display(), e))
        })?;

        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            Error::Crypto(format!("Cannot read certificate {}: {}", cert_path.display(), e))
        })?;
        let public = VerifyingKey::from_public_key_pem(&cert_pem).map_err(|e| {
            Error::Crypto(format!("Invalid certificate {}: {}", cert_path.display(), e))
        })?;

        if public != key.verifying_key() {
            return Err(Error::Crypto(format!(
                "Certificate {} does not match private key {}",
                cert_path.display(),
                key_path.display()
            )));
        }

        let chain = match chain_path {
            Some(path) => {
                let bytes = fs::read(path).map_err(|e| {
                    Error::Crypto(format!("Cannot read chain {}: {}", path.display(), e))
                })?;
                Some(sha256_hex(&bytes))
            }
            None => None,
        };

        Ok(Self {
            identity: Some(Identity {
                key,
                certificate: sha256_hex(cert_pem.as_bytes()),
                chain,
            }),
        })
    }

    fn sign_bytes(&self, document: &[u8], params: &SignParams) -> Result<Vec<u8>> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::Signing("backend has no signing identity".to_string()))?;

        validate_pdf(document)?;

        let fields = SignedFields {
            name: params.name.clone(),
            location: params.location.clone(),
            reason: params.reason.clone(),
            contact_info: params.contact_info.clone(),
            cert_type: params.cert_type,
            doc_mdp: params.doc_mdp,
            approval: params.approval,
            date: params.date,
            tsa_url: params.tsa.url.clone(),
            certificate: identity.certificate.clone(),
            chain: identity.chain.clone(),
        };
        let fields_json = serde_json::to_vec(&fields)?;
        let digest = sha256(document);

        let mut message = digest.to_vec();
        message.extend_from_slice(&fields_json);
        let signature = identity.key.sign(&message);

        let block = SignatureBlock {
            fields: encode_base64(&fields_json),
            public_key: hex::encode(identity.key.verifying_key().as_bytes()),
            digest: hex::encode(digest),
            signature: hex::encode(signature.to_bytes()),
        };

        let mut signed = Vec::with_capacity(document.len() + 1024);
        signed.extend_from_slice(document);
        signed.extend_from_slice(SIGNATURE_MARKER);
        signed.extend_from_slice(encode_base64(&serde_json::to_vec(&block)?).as_bytes());
        signed.extend_from_slice(b"\n%%EOF\n");
        Ok(signed)
    }

    fn verify_bytes(&self, document: &[u8]) -> Result<VerifyReport> {
        validate_pdf(document)?;

        let mut signatures = Vec::new();
        let mut end = document.len();

        while let Some(pos) = find_last(&document[..end], SIGNATURE_MARKER) {
            let body_start = pos + SIGNATURE_MARKER.len();
            let body_end = document[body_start..end]
                .iter()
                .position(|&b| b == b'\n')
                .map(|offset| body_start + offset)
                .unwrap_or(end);

            let block_json = decode_base64(std::str::from_utf8(&document[body_start..body_end])
                .map_err(|_| Error::Signing("signature block is not valid UTF-8".to_string()))?)?;
            let block: SignatureBlock = serde_json::from_slice(&block_json)
                .map_err(|e| Error::Signing(format!("malformed signature block: {}", e)))?;

            signatures.push(verify_block(&document[..pos], &block)?);
            end = pos;
        }

        if signatures.is_empty() {
            return Err(Error::Signing("document carries no signature".to_string()));
        }

        signatures.reverse();
        Ok(VerifyReport {
            signatures,
            document_digest: sha256_hex(document),
        })
    }
}

impl SignatureBackend for Ed25519Backend {
    fn sign(&self, input: &Path, output: &Path, params: &SignParams) -> Result<()> {
        let document = fs::read(input)?;
        let signed = self.sign_bytes(&document, params)?;

        let staging = output.with_extension("partial");
        fs::write(&staging, &signed)?;
        fs::rename(&staging, output)?;

        debug!(
            input = %input.display(),
            output = %output.display(),
            bytes = signed.len(),
            "Document signed"
        );
        Ok(())
    }

    fn verify(&self, input: &mut dyn Read) -> Result<VerifyReport> {
        let mut document = Vec::new();
        input.read_to_end(&mut document)?;
        self.verify_bytes(&document)
    }
}

fn verify_block(signed_prefix: &[u8], block: &SignatureBlock) -> Result<SignatureInfo> {
    let digest = sha256(signed_prefix);
    if hex::encode(digest) != block.digest {
        return Err(Error::Signing(
            "document was modified after signing (digest mismatch)".to_string(),
        ));
    }

    let key_bytes: [u8; 32] = hex::decode(&block.public_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Signing("malformed signer public key".to_string()))?;
    let public = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| Error::Signing(format!("invalid signer public key: {}", e)))?;

    let sig_bytes: [u8; 64] = hex::decode(&block.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Signing("malformed signature value".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let fields_json = decode_base64(&block.fields)?;
    let mut message = digest.to_vec();
    message.extend_from_slice(&fields_json);
    public
        .verify(&message, &signature)
        .map_err(|_| Error::Signing("signature verification failed".to_string()))?;

    let fields: SignedFields = serde_json::from_slice(&fields_json)
        .map_err(|e| Error::Signing(format!("malformed signed fields: {}", e)))?;

    Ok(SignatureInfo {
        name: fields.name,
        location: fields.location,
        reason: fields.reason,
        contact_info: fields.contact_info,
        cert_type: fields.cert_type,
        doc_mdp: fields.doc_mdp,
        approval: fields.approval,
        signed_at: fields.date,
        tsa_url: fields.tsa_url,
        public_key: block.public_key.clone(),
        certificate: fields.certificate,
        chain: fields.chain,
    })
}

/// Reject anything that does not look like a PDF file
pub fn validate_pdf(document: &[u8]) -> Result<()> {
    if !document.starts_with(PDF_HEADER) {
        return Err(Error::Signing("not a PDF document: missing %PDF- header".to_string()));
    }

    let tail_start = document.len().saturating_sub(EOF_SEARCH_WINDOW);
    if find_last(&document[tail_start..], PDF_EOF).is_none() {
        return Err(Error::Signing("not a PDF document: missing %%EOF trailer".to_string()));
    }

    Ok(())
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

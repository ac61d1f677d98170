//! Detached-signature verification against the pinned [`TrustAnchor`].
//!
//! [`verify`] is a pure function of its inputs. Parse and crypto failures
//! collapse into a negative verdict.

use crate::error::UpdaterError;
use crate::launcher::VerifiedInstaller;
use crate::signature::DetachedSignature;
use crate::trust::{Fingerprint, TrustAnchor};
use serde::Serialize;
use std::path::PathBuf;

/// Why a verdict is negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The blob is not an OpenPGP signature.
    MalformedSignature {
        /// Parser error.
        detail: String,
    },
    /// No key of the pinned certificate validates the signature over the artifact.
    BadSignature,
    /// A pinned key validates the signature, but it is not an allowed signer.
    WrongSigner {
        /// Key id of the key that validated.
        fingerprint: String,
    },
}

/// Outcome of verifying one (artifact, signature) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationVerdict {
    /// True only when a pinned, allowed key validated the signature.
    pub verified: bool,
    /// Key id of the key that validated the signature, if any did.
    pub signer_fingerprint: Option<String>,
    /// Set whenever `verified` is false.
    pub reason: Option<FailureReason>,
}

impl VerificationVerdict {
    fn accepted(signer: Fingerprint) -> Self {
        Self {
            verified: true,
            signer_fingerprint: Some(signer.to_string()),
            reason: None,
        }
    }

    fn rejected(reason: FailureReason, signer: Option<Fingerprint>) -> Self {
        Self {
            verified: false,
            signer_fingerprint: signer.map(|fp| fp.to_string()),
            reason: Some(reason),
        }
    }

    /// Turn a positive verdict into the capability required by the launcher.
    ///
    /// Re-checks both halves of the policy against `anchor` so a verdict
    /// built elsewhere can never authorise a launch on its own.
    pub fn authorize(
        &self,
        anchor: &TrustAnchor,
        installer: PathBuf,
    ) -> Result<VerifiedInstaller, UpdaterError> {
        if !self.verified {
            return Err(self.to_error());
        }
        let signer = self
            .signer_fingerprint
            .as_deref()
            .ok_or_else(|| UpdaterError::SignatureInvalid("verdict names no signer".into()))?
            .parse::<Fingerprint>()?;
        if !anchor.is_allowed(&signer) {
            return Err(UpdaterError::WrongSigner {
                fingerprint: signer.to_string(),
            });
        }
        Ok(VerifiedInstaller::new(installer, signer))
    }

    /// Error equivalent of a negative verdict.
    pub fn to_error(&self) -> UpdaterError {
        match &self.reason {
            Some(FailureReason::MalformedSignature { detail }) => {
                UpdaterError::SignatureParse(detail.clone())
            }
            Some(FailureReason::BadSignature) | None => {
                UpdaterError::SignatureInvalid("signature does not match artifact".into())
            }
            Some(FailureReason::WrongSigner { fingerprint }) => UpdaterError::WrongSigner {
                fingerprint: fingerprint.clone(),
            },
        }
    }
}

/// Verify `signature` as a detached signature over all of `message`.
///
/// Every key of the pinned certificate is tried, primary key first. The
/// issuer named inside the blob is never trusted; the signer is whichever
/// key actually validated.
pub fn verify(message: &[u8], signature: &[u8], anchor: &TrustAnchor) -> VerificationVerdict {
    let parsed = match DetachedSignature::from_bytes(signature) {
        Ok(parsed) => parsed,
        Err(err) => {
            return VerificationVerdict::rejected(
                FailureReason::MalformedSignature {
                    detail: err.to_string(),
                },
                None,
            )
        }
    };

    let Some(signer) = validating_key(&parsed, message, anchor) else {
        return VerificationVerdict::rejected(FailureReason::BadSignature, None);
    };

    if !anchor.is_allowed(&signer) {
        return VerificationVerdict::rejected(
            FailureReason::WrongSigner {
                fingerprint: signer.to_string(),
            },
            Some(signer),
        );
    }

    VerificationVerdict::accepted(signer)
}

fn validating_key(
    signature: &DetachedSignature,
    message: &[u8],
    anchor: &TrustAnchor,
) -> Option<Fingerprint> {
    let cert = anchor.certificate();
    let sig = signature.inner();

    if sig.verify(&cert.primary_key, message).is_ok() {
        return Some(Fingerprint::of(&cert.primary_key));
    }
    cert.public_subkeys
        .iter()
        .find(|sub| sig.verify(&sub.key, message).is_ok())
        .map(|sub| Fingerprint::of(&sub.key))
}

//! Detached OpenPGP signatures published next to each installer as `<artifact>.sig`.
//!
//! The builds server serves binary signature packets. ASCII-armored blobs are
//! accepted as well, which is what `gpg --armor --detach-sign` produces.

use crate::error::{Result, UpdaterError};
use pgp::{Deserializable, StandaloneSignature};

const ARMOR_PREFIX: &[u8] = b"-----BEGIN PGP SIGNATURE-----";

/// Parsed detached signature.
#[derive(Debug, Clone)]
pub struct DetachedSignature {
    inner: StandaloneSignature,
}

impl DetachedSignature {
    /// Decode a blob fetched from the network.
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        if blob.is_empty() {
            return Err(UpdaterError::SignatureParse("empty signature".into()));
        }

        let inner = if is_armored(blob) {
            let text = std::str::from_utf8(blob)
                .map_err(|err| UpdaterError::SignatureParse(format!("armor is not UTF-8: {err}")))?;
            StandaloneSignature::from_string(text)
                .map(|(sig, _headers)| sig)
                .map_err(|err| UpdaterError::SignatureParse(err.to_string()))?
        } else {
            StandaloneSignature::from_bytes(blob)
                .map_err(|err| UpdaterError::SignatureParse(err.to_string()))?
        };

        Ok(Self { inner })
    }

    /// The parsed signature packet.
    pub fn inner(&self) -> &StandaloneSignature {
        &self.inner
    }
}

fn is_armored(blob: &[u8]) -> bool {
    blob.iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| blob[start..].starts_with(ARMOR_PREFIX))
}

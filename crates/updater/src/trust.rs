//! Pinned trust material.
//!
//! The publisher certificate is compiled into the binary as an ASCII-armored
//! OpenPGP public key block. It is parsed once per process and never
//! reloaded from disk or network.

use crate::error::{Result, UpdaterError};
use once_cell::sync::Lazy;
use pgp::{Deserializable, SignedPublicKey};
use pgp::types::*;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Publisher release certificate.
pub const PUBLISHER_KEY_ARMORED: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----

mQINBGXcsAABEAC9s0q0rgxo8Djxfa84yHzHuBkcCYeT2gRbjX8eugSDyzfeb8e1
mnX73yCGUvFZt+pgECaxRS2bKt/OSlQHA+RHzhaLv9lbV3DKMna6AU/wJP+tWQUt
i28v9ZE5GxkUjz2IHC8NyVkaDMwwOQ8kAj2lRb7ofV1dtFgt5nRYdhjFYhwkktGB
J5BpX2oHyFqz1pBsf5b5/zGqrtn36R1uDNoQjKZFW1JnpizV+F8AgqvDgcdjvTK7
ofnvWgyUR9Tksr509Vf6xr+5NN0jYD4VJplL9Uxa9rDDE8Mf8/DXmsANhwaC5e20
jaEKcZkqAWU4fTNk7sn5urMiTC2utsNCynZPC/WOJYzI026iTIKn2N0Y519err/W
Z8JQOMMzZbUVSeuc2Iwajss6s0G9Ql2Ts9bnHplDwDkC4f0CnGQD8fzeU9ABjLN/
l2M3nGZ6gytAgje/Dt8qkvT+AgKk7n0Dnl8tbGL+uA8GjV65N1GAGpo4Rx2BC4g2
u8TRUbG3aNzKREL/z1Ur5vtStyzsb8KzCXUseip7szheS4t3dzEzWoH+0bj0AoW9
Et7YR8CSu1JRxr1WlnClbqK4nHXi/n+V9lvnRW3TbI1+Z40mdiwJbUBK09gKC+WN
3jRCXjuDvzWe9QMEP52IhIPi+HHsN4jVVprvs+tXZO+T/wf/kHgY+iwutwARAQAB
tDhvc2sgcHVibGlzaGluZyAoVHJ1c3Qga2V5IGZvciBvc2sgcHJvZHVjdHMpIDxi
aXpAb3NrLnNoPokCTgQTAQoAOBYhBDSh7f1q+KS0rALotutshlAYxL7NBQJl3LAA
AhsDBQsJCAcCBhUKCQgLAgQWAgMBAh4BAheAAAoJEOtshlAYxL7Nr7sP/jTycRt3
3FXWKYMW+EQCAeBMM004GV6QEtizrE2pGVd5VEQuglRckiXsokNyWKOvH/nuWOXJ
0DvgvHD3t2c0/FSc9u4NtqqrsAfTHtQtWszjj6naO8f4K361IsjgFdFZzydTe5yZ
zy6hWz+AZhWbTF1MGlAC5zaBvj06C4Tex/cDmgYsUb3zNs0zP28/zNYJ+Q3oNHNu
EnlyjSqmGZa0BrCMWS7YyoG7zsP79i9H58A/MVjId9QO0q9jjUshIjdPnd/rQdb+
lyMeuQRcRUnJ4E2p1y/Wk5/cLcLshnLjOzogN6xKwkEJd+YiWMzSm95gvy+qPEht
LBlcc8LiyEQ9ZyAFTbTSfQa8+Ne9j0kNoFzxz6S5GvOd6OBpWPLpCFOQOIqFdwIG
tlDeRR1V+OQo7G8hILuioIilOI0n7jAqZw/oQi0bhoH7ElzWnNlOW169zleJK7bL
TegzVWBEfrDU81nXJjDLOpl0UrEtjxs2Efd7iDa4abZ8kFh1IIB8J0MoPZke+hx1
G77kQ8dP5voK7lnLToUaaqMtnquSMDYmnK/JFQIr1kvY824iuW6LEHNk1j04Rf0r
Z4Oh2RQyLT82osbmQN0NMUTV2N9ZBuhOKjZqmhQhcuSxTJnwMLTHObtd/iXREcO/
/pLqXrlBp9+0NHeKyuQ6gqDaHAbied0rNBtkuQINBGXcsAABEACuvfeKw6HRZWkv
Xbw2qLYyhfSRLFj/5gl5hsWmDEdmMgtGq3fo2Kb69YcqPEKOZNzPfCjPiZRbBxX9
CeBHtRgrdSw+bAulWQq7xM8LRHavAmiA51l0siOSMB9H2Ixomj/9PyKLfMsJSZmL
Sax9DLSSkg3mHXv2GMCKe6dzACRBhEZlvroZNF5cg2jPTafxZ2Td7rYXoGrO68PN
Xn+bsHbc1Mlxa//KRfuWJ6F0IMnT91m7kFWKbKjECzgnHNy0/tS/t0FpLCnk+sth
kpFeJrZFqphM8O/9OkRJJefHRUGEZLj6AVL1BqVeJ/LeMeMLQUIrODzPJBmJI7uk
gBFYCcLgAbZZxPR5wQZQj4GcuK9te6YumBLceAii00Krhf0ExzTRvCp51aK8tgGM
s4cci9rkakwu2ZWlAUbvJWSBzyvxQLSRgOEQA+9BtJABU5hEYUOS7+OpiXbkqUpI
C0rMBXUi9WgE/clEQ2XrFkBekjg3nBachJ2bLkaKTufJGLzZsoFhIxBbTX1nArpp
vSWSHInbDKOZfk/jBVkcVV2ZeG1XgacJo4g3Sjf9lHn+TqkC62F8lpHnV7jDfpYx
zs08vVYoHyL02pRQk+ltrcg6A7b2RnvzbDqbIHjR3u9TdKewxnaONPK25ARJBdgQ
IB3fbzTCV3apKM6rWeG6vJ6P5U/Q9QARAQABiQI2BBgBCgAgFiEENKHt/Wr4pLSs
Aui262yGUBjEvs0FAmXcsAACGwwACgkQ62yGUBjEvs2c8BAAlndb902RRtaBc/zC
h+RkzKaW1wNHh0sdqXUxFwT1UCvTd0LLQwdJuirEQXrQBqYzb1bRQDNxAv4oJTGu
qRQsh1XY8wOWLXK6D++RlVw1FUBx7XSovAdtGeQm68hRbmc68OYk8jSaMUPAVv6C
hBvRmYZ56K2QDQY6ex3tEuQo9IOD0lgn7XOaKLxkBy2zrmTkQKbF1SMNfCqwKQw+
Onw8BjUa6nagSZdUQwcR+uktoBH7UBYtyJulmRK//9+lZTThH+XGkgyP7rzUznXW
p4CG66b4IE22Zr6PdUJwY/tjGDF+qr2pCWqfKxbj7DbDpxRM6AfPTvsZQ/4wsC7g
JlRvkGnvBLSl7Qvn7i26YjtTnFqO+akwxjDHTe+R8mIodMVElW0wTH2MJLI5mJd7
pjw7fazhTIPETBvbbZ8agBRj1c0otQSgEzSWAW6umsE+nZWS5H9l35/CIZOma/WL
R9kop3/itN031CeM7NAOwtCKqHo+O6KOFpzOAvVgDzkPbYB3xHPOYwzzx8kHw4e2
vDYeDpcVei+v4sp+DxBxzDrpEgv+zbcqwniCyQtLOsfrjkYvEuiUEBtiK1DrCshR
2B+iiJMpYXkkXA1zTH3GOw/JpCKwlCUNxYGESQAysBGhsZ64CMhi1LQq2eYssJYX
dYcAe+cscvTf1z0SRSwzd8DlB6M=
=3wDa
-----END PGP PUBLIC KEY BLOCK-----
";

/// Key id of the only signer accepted for published builds.
pub const PUBLISHER_FINGERPRINT: &str = "EB6C865018C4BECD";

static EMBEDDED: Lazy<std::result::Result<Arc<TrustAnchor>, String>> = Lazy::new(|| {
    TrustAnchor::from_armored(PUBLISHER_KEY_ARMORED, &[PUBLISHER_FINGERPRINT])
        .map(Arc::new)
        .map_err(|err| err.to_string())
});

/// 64-bit OpenPGP key id, rendered as 16 uppercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 8]);

impl Fingerprint {
    /// Length of a key id in bytes.
    pub const LEN: usize = 8;

    /// Key id of an OpenPGP primary key or subkey.
    pub fn of(key: &impl PublicKeyTrait) -> Self {
        let id = key.key_id();
        let mut raw = [0u8; Self::LEN];
        raw.copy_from_slice(id.as_ref());
        Fingerprint(raw)
    }

    /// Wrap raw key id bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Fingerprint(bytes)
    }

    /// Raw key id bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = UpdaterError;

    /// Parses 16 hex characters, case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim())
            .map_err(|err| UpdaterError::TrustAnchor(format!("fingerprint {s:?}: {err}")))?;
        let id: [u8; 8] = raw.try_into().map_err(|_| {
            UpdaterError::TrustAnchor(format!("fingerprint {s:?} must be 16 hex characters"))
        })?;
        Ok(Fingerprint(id))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Root of trust: the pinned certificate plus the signer allow-list.
///
/// The primary key and every subkey of the certificate may validate a
/// signature, but only key ids in the allow-list are accepted as the signer
/// of a build.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    certificate: SignedPublicKey,
    allowed: HashSet<Fingerprint>,
}

impl TrustAnchor {
    /// The anchor compiled into this binary.
    pub fn embedded() -> Result<Arc<TrustAnchor>> {
        (*EMBEDDED).clone().map_err(UpdaterError::TrustAnchor)
    }

    /// Parse an armored public key block and an allow-list of hex key ids.
    pub fn from_armored(armored: &str, allowed_fingerprints: &[&str]) -> Result<Self> {
        let (certificate, _headers) = SignedPublicKey::from_string(armored)
            .map_err(|err| UpdaterError::TrustAnchor(format!("unreadable key block: {err}")))?;
        let allowed = allowed_fingerprints
            .iter()
            .map(|fp| fp.parse())
            .collect::<Result<HashSet<Fingerprint>>>()?;
        Self::new(certificate, allowed)
    }

    /// Build an anchor from a parsed certificate; its self-signatures must hold.
    pub fn new(certificate: SignedPublicKey, allowed: HashSet<Fingerprint>) -> Result<Self> {
        certificate
            .verify()
            .map_err(|err| UpdaterError::TrustAnchor(format!("certificate does not self-verify: {err}")))?;
        if allowed.is_empty() {
            return Err(UpdaterError::TrustAnchor("empty signer allow-list".into()));
        }
        Ok(Self {
            certificate,
            allowed,
        })
    }

    /// The pinned certificate.
    pub fn certificate(&self) -> &SignedPublicKey {
        &self.certificate
    }

    /// Key ids held by the certificate, primary key first.
    pub fn key_ids(&self) -> Vec<Fingerprint> {
        std::iter::once(Fingerprint::of(&self.certificate.primary_key))
            .chain(
                self.certificate
                    .public_subkeys
                    .iter()
                    .map(|sub| Fingerprint::of(&sub.key)),
            )
            .collect()
    }

    /// True when `fingerprint` names the primary key or a subkey.
    pub fn holds(&self, fingerprint: &Fingerprint) -> bool {
        self.key_ids().contains(fingerprint)
    }

    /// True when `fingerprint` may sign builds.
    pub fn is_allowed(&self, fingerprint: &Fingerprint) -> bool {
        self.allowed.contains(fingerprint)
    }

    /// Key ids allowed to sign builds, in no particular order.
    pub fn allowed_fingerprints(&self) -> impl Iterator<Item = &Fingerprint> {
        self.allowed.iter()
    }
}

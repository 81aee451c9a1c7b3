//! SSH algorithm preference and host-key verification policy.
//!
//! CWatcher fixes a single, modern algorithm profile (the teacher's
//! `SecurityLevel::Secure`) since it targets current Linux hosts, not the
//! legacy network gear the teacher's `LegacyCompatible` profile exists for.
//! The enum survives as a single variant so the shape matches the teacher's
//! and can grow without a breaking change if a compatibility mode is ever
//! needed.

use std::borrow::Cow;
use std::path::PathBuf;

use async_ssh2_tokio::ServerCheckMethod;
use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{Preferred, cipher, kex, mac};

/// SSH algorithm policy. CWatcher only ships `Secure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    Secure,
}

/// Connection security options for SSH establishment.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSecurityOptions {
    pub level: SecurityLevel,
    pub server_check: ServerCheckMethod,
}

impl ConnectionSecurityOptions {
    /// Strict-by-default: the caller must supply a known-hosts file; an
    /// empty/missing one is handled upstream in [`crate::ssh::KnownHosts`],
    /// never silently downgraded to `NoCheck` here.
    pub fn strict(known_hosts_path: PathBuf) -> Self {
        Self {
            level: SecurityLevel::Secure,
            server_check: ServerCheckMethod::KnownHostsFile(known_hosts_path),
        }
    }

    /// Only reachable when the operator has explicitly opted into
    /// trust-on-first-use via `Config::allow_tofu`.
    pub fn tofu() -> Self {
        Self {
            level: SecurityLevel::Secure,
            server_check: ServerCheckMethod::NoCheck,
        }
    }

    pub(super) fn preferred(&self) -> Preferred {
        Preferred {
            kex: Cow::Borrowed(SECURE_KEX_ORDER),
            key: Cow::Borrowed(SECURE_KEY_TYPES),
            cipher: Cow::Borrowed(SECURE_CIPHERS),
            mac: Cow::Borrowed(SECURE_MAC_ALGORITHMS),
            compression: Cow::Borrowed(&[russh::compression::NONE]),
        }
    }
}

/// Modern key-exchange algorithms only; no Diffie-Hellman group-1/14 SHA1
/// fallbacks that the teacher carries for legacy device compatibility.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// Modern host-key algorithms only — the teacher's `ALL_KEY_TYPES`
/// (`config.rs`) minus `Dsa` and the `Sk*` security-key variants, which
/// exist there for legacy device compatibility this crate doesn't need.
pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
];

/// AEAD ciphers only — no CBC, no `NONE`/`CLEAR`.
pub const SECURE_CIPHERS: &[cipher::Name] =
    &[cipher::AES_256_GCM, cipher::CHACHA20_POLY1305, cipher::AES_128_CTR];

/// ETM MAC variants preferred; no `NONE`.
pub const SECURE_MAC_ALGORITHMS: &[mac::Name] =
    &[mac::HMAC_SHA256_ETM, mac::HMAC_SHA512_ETM, mac::HMAC_SHA256];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_profile_excludes_weak_algorithms() {
        let preferred = ConnectionSecurityOptions::strict(PathBuf::from("/tmp/known_hosts")).preferred();
        assert!(preferred.kex.iter().all(|alg| *alg != kex::NONE));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::NONE));
        assert!(preferred.cipher.iter().all(|alg| *alg != cipher::CLEAR));
        assert!(preferred.mac.iter().all(|alg| *alg != mac::NONE));
        assert!(!preferred.key.is_empty());
        assert!(preferred.key.contains(&Algorithm::Ed25519));
        assert!(!preferred.key.contains(&Algorithm::Dsa));
    }

    #[test]
    fn tofu_still_uses_secure_algorithm_profile() {
        let options = ConnectionSecurityOptions::tofu();
        assert_eq!(options.level, SecurityLevel::Secure);
        assert!(matches!(options.server_check, ServerCheckMethod::NoCheck));
    }
}

//! Shared-secret credential check.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

/// Verifies presented credentials against the configured secret.
///
/// Only the SHA-256 digest of the secret is kept. Presented values are hashed
/// first so the comparison always runs over 32 bytes regardless of input
/// length, and the byte comparison itself is constant time.
pub struct CredentialVerifier {
    digest: [u8; 32],
}

impl CredentialVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub fn verify(&self, presented: Option<&str>) -> Result<()> {
        let presented = presented
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Unauthorized("credential required".to_string()))?;

        let candidate: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        if bool::from(candidate.ct_eq(&self.digest)) {
            Ok(())
        } else {
            Err(Error::Unauthorized("invalid credential".to_string()))
        }
    }
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_matching_secret() {
        let verifier = CredentialVerifier::new("s3cret");
        assert!(verifier.verify(Some("s3cret")).is_ok());
        assert!(verifier.verify(Some("  s3cret ")).is_ok());
    }

    #[test]
    fn test_rejects_missing_and_wrong() {
        let verifier = CredentialVerifier::new("s3cret");
        match verifier.verify(None) {
            Err(Error::Unauthorized(msg)) => assert!(msg.contains("required")),
            other => panic!("unexpected: {other:?}"),
        }
        match verifier.verify(Some("s3cret2")) {
            Err(Error::Unauthorized(msg)) => assert!(msg.contains("invalid")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(verifier.verify(Some("")).is_err());
    }

    #[test]
    fn test_debug_hides_digest() {
        let verifier = CredentialVerifier::new("s3cret");
        assert!(!format!("{verifier:?}").contains("digest"));
    }
}

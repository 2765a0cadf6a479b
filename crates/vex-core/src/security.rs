//! Signed-command authorization and binary self-verification.
//!
//! Restriction-lowering commands must carry an Ed25519 signature from the
//! out-of-band management key. The key file accepts three encodings, tried
//! in order: an OpenSSH `ssh-ed25519` line, a hex-encoded 32-byte key, and
//! raw 32 bytes. Absence of a loadable key fails closed: every restricted
//! command is denied.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

/// Sentinel value meaning "no expected hash was baked into this build".
pub const HASH_PLACEHOLDER: &str = "SET_AT_RUNTIME";

/// Commands that lower restrictions and therefore require authorization.
const RESTRICTED_COMMANDS: &[&str] = &[
    "unlock",
    "unblock",
    "lift-throttle",
    "restore-network",
    "clear-penance",
    "set-standard",
    "reset-score",
];

/// Security subsystem errors.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The key file could not be read.
    #[error("failed to load management key from {path}: {source}")]
    KeyUnreadable {
        /// Key file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The key file contents decode to the wrong length.
    #[error("invalid key size: expected {PUBLIC_KEY_LENGTH} bytes, got {0}")]
    InvalidKeySize(usize),

    /// The key bytes are not a valid Ed25519 public key.
    #[error("invalid Ed25519 public key: {0}")]
    InvalidKey(String),

    /// OpenSSH key line could not be decoded.
    #[error("failed to parse SSH public key: {0}")]
    SshFormat(String),

    /// No key is loaded; restricted commands are denied.
    #[error("management key not loaded; all restricted commands are DENIED")]
    NoKey,

    /// The signature is not valid hex of the right length.
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(String),

    /// Verification failed.
    #[error("SIGNATURE VERIFICATION FAILED for command {0:?}")]
    VerificationFailed(String),

    /// The running executable could not be hashed.
    #[error("failed to hash executable: {0}")]
    HashFailed(String),

    /// The executable hash disagrees with the expected value.
    #[error("BINARY INTEGRITY CHECK FAILED: expected {expected}, got {actual}")]
    BinaryMismatch {
        /// Compiled-in expected digest.
        expected: String,
        /// Observed digest of the running executable.
        actual: String,
    },
}

/// Returns whether a command requires a verified signature.
#[must_use]
pub fn is_restriction_lowering(command: &str) -> bool {
    RESTRICTED_COMMANDS.contains(&command)
}

/// A command payload authorized by the management key.
///
/// The signature is hex-encoded Ed25519 over the message string
/// `"<command>:<args>:<timestamp>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCommand {
    /// Command name.
    pub command: String,
    /// Flattened argument string.
    #[serde(default)]
    pub args: String,
    /// Unix timestamp at signing time.
    pub timestamp: i64,
    /// Hex-encoded Ed25519 signature.
    pub signature: String,
}

impl SignedCommand {
    /// Parses a signed command from its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::SignatureEncoding`] on malformed JSON.
    pub fn parse(data: &[u8]) -> Result<Self, SecurityError> {
        serde_json::from_slice(data)
            .map_err(|e| SecurityError::SignatureEncoding(format!("not a signed command: {e}")))
    }

    /// The exact byte string that was signed.
    #[must_use]
    pub fn message(&self) -> String {
        format!("{}:{}:{}", self.command, self.args, self.timestamp)
    }
}

/// The loaded management key, or the fail-closed absence of one.
#[derive(Debug, Clone)]
pub struct ManagementKey {
    key: Option<VerifyingKey>,
}

impl ManagementKey {
    /// A key holder with no key: every verification is denied.
    #[must_use]
    pub const fn absent() -> Self {
        Self { key: None }
    }

    /// Wraps an already-decoded verifying key.
    #[must_use]
    pub const fn from_key(key: VerifyingKey) -> Self {
        Self { key: Some(key) }
    }

    /// Loads the management public key from a file.
    ///
    /// Accepted encodings, in order: OpenSSH `ssh-ed25519` line, hex of 32
    /// bytes, raw 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError`] if the file is unreadable or no encoding
    /// yields exactly 32 valid key bytes.
    pub fn load(path: &Path) -> Result<Self, SecurityError> {
        let data = std::fs::read(path).map_err(|source| SecurityError::KeyUnreadable {
            path: path.display().to_string(),
            source,
        })?;

        let text = String::from_utf8_lossy(&data);
        let trimmed = text.trim();

        let key_bytes: Vec<u8> = if trimmed.starts_with("ssh-ed25519 ") {
            parse_ssh_ed25519(trimmed)?
        } else if let Ok(decoded) = hex::decode(trimmed) {
            if decoded.len() == PUBLIC_KEY_LENGTH {
                decoded
            } else {
                data.clone()
            }
        } else {
            data.clone()
        };

        let bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::InvalidKeySize(key_bytes.len()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;

        info!("management key loaded");
        Ok(Self::from_key(key))
    }

    /// Whether a key is loaded at all.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.key.is_some()
    }

    /// Verifies a signed command against the management key.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::NoKey`] when no key is loaded (fail-closed),
    /// [`SecurityError::SignatureEncoding`] for malformed signatures, and
    /// [`SecurityError::VerificationFailed`] when the signature does not
    /// verify.
    pub fn verify(&self, cmd: &SignedCommand) -> Result<(), SecurityError> {
        let key = self.key.as_ref().ok_or(SecurityError::NoKey)?;

        let sig_bytes = hex::decode(&cmd.signature)
            .map_err(|e| SecurityError::SignatureEncoding(e.to_string()))?;
        let sig_bytes: [u8; SIGNATURE_LENGTH] = sig_bytes.as_slice().try_into().map_err(|_| {
            SecurityError::SignatureEncoding(format!(
                "signature is {} bytes, expected {SIGNATURE_LENGTH}",
                cmd.signature.len() / 2
            ))
        })?;
        let signature = Signature::from_bytes(&sig_bytes);

        key.verify(cmd.message().as_bytes(), &signature)
            .map_err(|_| SecurityError::VerificationFailed(cmd.command.clone()))?;

        info!(command = %cmd.command, "signed command verified");
        Ok(())
    }
}

/// Extracts the raw 32-byte key from an OpenSSH public key line:
/// `ssh-ed25519 <base64-blob> [comment]`.
///
/// The blob is the SSH wire format of length-prefixed fields: a 4-byte
/// big-endian length then the field bytes, first the key type string, then
/// the raw public key.
fn parse_ssh_ed25519(line: &str) -> Result<Vec<u8>, SecurityError> {
    let mut parts = line.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let blob64 = parts
        .next()
        .ok_or_else(|| SecurityError::SshFormat("missing key data".to_string()))?;
    if kind != "ssh-ed25519" {
        return Err(SecurityError::SshFormat("not an ssh-ed25519 key".to_string()));
    }

    let blob = BASE64
        .decode(blob64)
        .map_err(|e| SecurityError::SshFormat(format!("base64 decode failed: {e}")))?;

    let mut offset = 0usize;
    let mut read_field = |blob: &[u8]| -> Result<Vec<u8>, SecurityError> {
        let len_end = offset
            .checked_add(4)
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| SecurityError::SshFormat("truncated key data".to_string()))?;
        let len = u32::from_be_bytes(blob[offset..len_end].try_into().expect("4 bytes")) as usize;
        offset = len_end;
        let field_end = offset
            .checked_add(len)
            .filter(|end| *end <= blob.len())
            .ok_or_else(|| SecurityError::SshFormat("truncated key field".to_string()))?;
        let field = blob[offset..field_end].to_vec();
        offset = field_end;
        Ok(field)
    };

    let key_type = read_field(&blob)?;
    if key_type != b"ssh-ed25519" {
        return Err(SecurityError::SshFormat(format!(
            "unexpected key type in blob: {}",
            String::from_utf8_lossy(&key_type)
        )));
    }

    let raw_key = read_field(&blob)?;
    if raw_key.len() != PUBLIC_KEY_LENGTH {
        return Err(SecurityError::SshFormat(format!(
            "extracted key is {} bytes, expected {PUBLIC_KEY_LENGTH}",
            raw_key.len()
        )));
    }
    Ok(raw_key)
}

/// Hex SHA-256 digest of the currently running executable.
///
/// # Errors
///
/// Returns [`SecurityError::HashFailed`] if the executable path cannot be
/// resolved or read.
pub fn hash_running_executable() -> Result<String, SecurityError> {
    let exe = std::env::current_exe().map_err(|e| SecurityError::HashFailed(e.to_string()))?;
    let data = std::fs::read(&exe).map_err(|e| SecurityError::HashFailed(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&data)))
}

/// Compares the running executable against an expected SHA-256 digest.
///
/// # Errors
///
/// Returns [`SecurityError::BinaryMismatch`] on disagreement, or
/// [`SecurityError::HashFailed`] if hashing itself fails.
pub fn verify_binary_integrity(expected: &str) -> Result<(), SecurityError> {
    let actual = hash_running_executable()?;
    if actual != expected.to_lowercase() {
        return Err(SecurityError::BinaryMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    fn test_keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    fn sign(signing: &SigningKey, command: &str, args: &str, timestamp: i64) -> SignedCommand {
        let message = format!("{command}:{args}:{timestamp}");
        let signature = signing.sign(message.as_bytes());
        SignedCommand {
            command: command.to_string(),
            args: args.to_string(),
            timestamp,
            signature: hex::encode(signature.to_bytes()),
        }
    }

    #[test]
    fn restricted_set_matches_contract() {
        for cmd in [
            "unlock",
            "unblock",
            "lift-throttle",
            "restore-network",
            "clear-penance",
            "set-standard",
            "reset-score",
        ] {
            assert!(is_restriction_lowering(cmd), "{cmd} must be restricted");
        }
        assert!(!is_restriction_lowering("throttle"));
        assert!(!is_restriction_lowering("block-add"));
    }

    #[test]
    fn verifies_a_correctly_signed_command() {
        let (signing, verifying) = test_keypair();
        let key = ManagementKey::from_key(verifying);
        let cmd = sign(&signing, "unlock", "", 1_750_000_000);
        key.verify(&cmd).unwrap();
    }

    #[test]
    fn rejects_a_tampered_command() {
        let (signing, verifying) = test_keypair();
        let key = ManagementKey::from_key(verifying);
        let mut cmd = sign(&signing, "unlock", "", 1_750_000_000);
        cmd.command = "reset-score".to_string();
        assert!(matches!(
            key.verify(&cmd),
            Err(SecurityError::VerificationFailed(_))
        ));
    }

    #[test]
    fn absent_key_fails_closed() {
        let (signing, _) = test_keypair();
        let key = ManagementKey::absent();
        let cmd = sign(&signing, "unlock", "", 1_750_000_000);
        assert!(matches!(key.verify(&cmd), Err(SecurityError::NoKey)));
    }

    #[test]
    fn rejects_malformed_signature_hex() {
        let (_, verifying) = test_keypair();
        let key = ManagementKey::from_key(verifying);
        let cmd = SignedCommand {
            command: "unlock".to_string(),
            args: String::new(),
            timestamp: 0,
            signature: "zz-not-hex".to_string(),
        };
        assert!(matches!(
            key.verify(&cmd),
            Err(SecurityError::SignatureEncoding(_))
        ));
    }

    #[test]
    fn loads_hex_encoded_key() {
        let (_, verifying) = test_keypair();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("management-key.pub");
        std::fs::write(&path, hex::encode(verifying.to_bytes())).unwrap();
        let key = ManagementKey::load(&path).unwrap();
        assert!(key.is_loaded());
    }

    #[test]
    fn loads_raw_key_bytes() {
        let (_, verifying) = test_keypair();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("management-key.pub");
        std::fs::write(&path, verifying.to_bytes()).unwrap();
        assert!(ManagementKey::load(&path).unwrap().is_loaded());
    }

    #[test]
    fn loads_openssh_key_line() {
        let (_, verifying) = test_keypair();
        // SSH wire format: len("ssh-ed25519") + "ssh-ed25519" + len(key) + key
        let mut blob = Vec::new();
        blob.extend_from_slice(&11u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&verifying.to_bytes());
        let line = format!("ssh-ed25519 {} operator@mgmt", BASE64.encode(&blob));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("management-key.pub");
        std::fs::write(&path, line).unwrap();

        let key = ManagementKey::load(&path).unwrap();
        let (signing, _) = test_keypair();
        key.verify(&sign(&signing, "set-standard", "", 1)).unwrap();
    }

    #[test]
    fn rejects_wrong_sized_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("management-key.pub");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            ManagementKey::load(&path),
            Err(SecurityError::InvalidKeySize(5))
        ));
    }

    #[test]
    fn rejects_truncated_ssh_blob() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&11u32.to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[0u8; 16]); // truncated key field
        let line = format!("ssh-ed25519 {}", BASE64.encode(&blob));
        assert!(matches!(
            parse_ssh_ed25519(&line),
            Err(SecurityError::SshFormat(_))
        ));
    }

    #[test]
    fn signed_payload_parses_from_json() {
        let payload = r#"{"command":"unlock","args":"","timestamp":1750000000,"signature":"00"}"#;
        let cmd = SignedCommand::parse(payload.as_bytes()).unwrap();
        assert_eq!(cmd.command, "unlock");
        assert_eq!(cmd.message(), "unlock::1750000000");
    }

    #[test]
    fn binary_hash_is_stable_hex() {
        let digest = hash_running_executable().unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_running_executable().unwrap());
        verify_binary_integrity(&digest).unwrap();
    }
}

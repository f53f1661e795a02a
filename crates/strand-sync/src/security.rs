//! Cluster security: peer authentication material.
//!
//! The cluster secret is a 32-byte symmetric key proven during the
//! transport handshake. At rest it lives in a keystore file sealed with
//! ChaCha20-Poly1305 under a key derived from the keystore password via
//! HKDF-SHA256. Rotation is not automated: every node must hold the new
//! secret before the old one is revoked, or the cluster partitions on the
//! secret boundary.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tracing::info;
use zeroize::Zeroizing;

pub use strand_transport::AuthScheme;

use crate::error::{Result, SyncError};

/// Length of the cluster secret in bytes.
pub const SECRET_LEN: usize = 32;

const KEYSTORE_MAGIC: &[u8; 4] = b"SKS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// The cluster's symmetric authentication secret. Zeroized on drop.
pub struct ClusterSecret(Zeroizing<Vec<u8>>);

impl ClusterSecret {
    /// Wrap existing secret bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Generate a fresh secret from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(Zeroizing::new(bytes))
    }

    /// The secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClusterSecret([redacted; {} bytes])", self.0.len())
    }
}

impl Clone for ClusterSecret {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(self.0.to_vec()))
    }
}

/// Authentication configuration for peer connections.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    /// Scheme peers must satisfy.
    pub scheme: AuthScheme,
    /// Keystore file holding the cluster secret (SharedSecret scheme).
    pub keystore_path: Option<PathBuf>,
    /// Password protecting the keystore file.
    pub keystore_password: Option<String>,
}

impl AuthInfo {
    /// Authentication disabled.
    pub fn no_auth() -> Self {
        Self {
            scheme: AuthScheme::NoAuth,
            keystore_path: None,
            keystore_password: None,
        }
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; SECRET_LEN]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut key = Zeroizing::new([0u8; SECRET_LEN]);
    hk.expand(b"strand cluster keystore", key.as_mut())
        .expect("HKDF output length is valid");
    key
}

/// Seal a secret into a keystore file. When `secret` is None a fresh one
/// is generated. Returns the secret that was written.
pub fn write_shared_secret(
    path: &Path,
    password: &str,
    secret: Option<ClusterSecret>,
) -> Result<ClusterSecret> {
    let secret = secret.unwrap_or_else(ClusterSecret::generate);

    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
        .map_err(|_| SyncError::Configuration {
            msg: "failed to seal cluster keystore".to_string(),
        })?;

    let mut contents = Vec::with_capacity(4 + SALT_LEN + NONCE_LEN + ciphertext.len());
    contents.extend_from_slice(KEYSTORE_MAGIC);
    contents.extend_from_slice(&salt);
    contents.extend_from_slice(&nonce);
    contents.extend_from_slice(&ciphertext);
    std::fs::write(path, contents)?;
    info!(path = %path.display(), "cluster secret written to keystore");
    Ok(secret)
}

/// Read the secret back from a keystore file.
pub fn read_shared_secret(path: &Path, password: &str) -> Result<ClusterSecret> {
    let contents = std::fs::read(path)?;
    if contents.len() < 4 + SALT_LEN + NONCE_LEN || &contents[..4] != KEYSTORE_MAGIC {
        return Err(SyncError::Configuration {
            msg: format!("{} is not a cluster keystore", path.display()),
        });
    }
    let salt = &contents[4..4 + SALT_LEN];
    let nonce = &contents[4 + SALT_LEN..4 + SALT_LEN + NONCE_LEN];
    let ciphertext = &contents[4 + SALT_LEN + NONCE_LEN..];

    let key = derive_key(password, salt);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SyncError::Configuration {
            msg: "keystore password incorrect or keystore corrupt".to_string(),
        })?;
    Ok(ClusterSecret::from_bytes(plaintext))
}

/// Holds the cluster's authentication configuration and hands the secret
/// to the transport handshake. Reconfiguration bumps an epoch; the engine
/// drops connections authenticated under an older epoch so they
/// re-handshake with the new material.
pub struct ClusterSecurityManager {
    info: RwLock<AuthInfo>,
    epoch: AtomicU64,
}

impl ClusterSecurityManager {
    /// Create the manager with an initial configuration.
    pub fn new(info: AuthInfo) -> Self {
        Self {
            info: RwLock::new(info),
            epoch: AtomicU64::new(1),
        }
    }

    /// Reconfigure authentication. Existing connections become invalid and
    /// must re-handshake.
    pub fn set_auth_info(
        &self,
        scheme: AuthScheme,
        keystore_path: Option<PathBuf>,
        keystore_password: Option<String>,
    ) -> Result<()> {
        if scheme == AuthScheme::SharedSecret
            && (keystore_path.is_none() || keystore_password.is_none())
        {
            return Err(SyncError::Configuration {
                msg: "shared-secret scheme requires a keystore path and password".to_string(),
            });
        }
        {
            let mut info = self.info.write().map_err(|_| SyncError::Configuration {
                msg: "security configuration lock poisoned".to_string(),
            })?;
            info.scheme = scheme;
            info.keystore_path = keystore_path;
            info.keystore_password = keystore_password;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(%scheme, epoch, "authentication reconfigured; peers must re-handshake");
        Ok(())
    }

    /// The current authentication configuration.
    pub fn auth_info(&self) -> AuthInfo {
        self.info
            .read()
            .map(|i| i.clone())
            .unwrap_or_else(|_| AuthInfo::no_auth())
    }

    /// The configured scheme.
    pub fn scheme(&self) -> AuthScheme {
        self.auth_info().scheme
    }

    /// Epoch of the current configuration; connections remember the epoch
    /// they authenticated under.
    pub fn auth_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The secret handshakes must prove, per the current configuration.
    /// None when authentication is disabled.
    pub fn current_secret(&self) -> Result<Option<ClusterSecret>> {
        let info = self.auth_info();
        match info.scheme {
            AuthScheme::NoAuth => Ok(None),
            AuthScheme::SharedSecret => {
                let path = info.keystore_path.ok_or_else(|| SyncError::Configuration {
                    msg: "shared-secret scheme configured without a keystore path".to_string(),
                })?;
                let password =
                    info.keystore_password
                        .ok_or_else(|| SyncError::Configuration {
                            msg: "shared-secret scheme configured without a keystore password"
                                .to_string(),
                        })?;
                read_shared_secret(&path, &password).map(Some)
            }
        }
    }
}

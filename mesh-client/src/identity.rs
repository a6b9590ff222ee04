//! Node identity persistence.
//!
//! A node is identified by an ed25519 key, the same key its iroh endpoint
//! uses. The key is created once and stored as `peer-id.json` in the data
//! directory so the node keeps its id across restarts.

use std::fmt;
use std::path::{Path, PathBuf};

use mesh_types::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// File name of the persisted identity inside the data directory.
pub const IDENTITY_FILE: &str = "peer-id.json";

/// Secret key size in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Identity store errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the identity file failed.
    #[error("identity I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The identity file exists but does not hold a usable key.
    #[error("corrupt identity file {path}: {reason}")]
    Corrupt {
        /// Identity file path.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The OS random source failed.
    #[error("failed to generate key: {0}")]
    Entropy(String),
}

/// The node's key pair and its public id.
///
/// Secret bytes are wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct NodeIdentity {
    #[zeroize(skip)]
    id: PeerId,
    secret: [u8; SECRET_KEY_SIZE],
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Result<Self, IdentityError> {
        let mut bytes = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
        getrandom::getrandom(&mut bytes[..])
            .map_err(|e| IdentityError::Entropy(e.to_string()))?;
        Ok(Self::from_secret_bytes(*bytes))
    }

    /// Rebuild an identity from its secret key bytes.
    pub fn from_secret_bytes(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        let id = PeerId::new(iroh::SecretKey::from_bytes(&secret).public().to_string());
        Self { id, secret }
    }

    /// Public id of this node.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The key in the form the iroh endpoint takes.
    pub fn secret_key(&self) -> iroh::SecretKey {
        iroh::SecretKey::from_bytes(&self.secret)
    }

    fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret))
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.secret == other.secret
    }
}

impl Eq for NodeIdentity {}

/// How `load_or_create` obtained the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// Read from disk.
    Loaded,
    /// No file existed; a new identity was created and saved.
    Created,
    /// The file was corrupt; a new identity replaced it.
    Regenerated,
}

#[derive(Serialize, Deserialize)]
struct PersistedIdentity {
    id: String,
    #[serde(rename = "privKey")]
    priv_key: String,
}

impl Drop for PersistedIdentity {
    fn drop(&mut self) {
        self.priv_key.zeroize();
    }
}

/// Reads and writes `peer-id.json` in a data directory.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Store rooted at the given data directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the identity file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    /// Load the persisted identity, `None` if there is none yet.
    pub async fn load(&self) -> Result<Option<NodeIdentity>, IdentityError> {
        let path = self.path();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(IdentityError::Io { path, source }),
        };

        let corrupt = |reason: String| IdentityError::Corrupt {
            path: path.clone(),
            reason,
        };

        let persisted: PersistedIdentity =
            serde_json::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
        let bytes = Zeroizing::new(
            hex::decode(persisted.priv_key.trim()).map_err(|e| corrupt(e.to_string()))?,
        );
        let secret: [u8; SECRET_KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| corrupt(format!("key must be {SECRET_KEY_SIZE} bytes, got {}", bytes.len())))?;

        let identity = NodeIdentity::from_secret_bytes(secret);
        if identity.id().as_str() != persisted.id {
            return Err(corrupt("stored id does not match key".into()));
        }
        Ok(Some(identity))
    }

    /// Persist an identity, creating the data directory if needed.
    pub async fn save(&self, identity: &NodeIdentity) -> Result<(), IdentityError> {
        create_private_dir(&self.dir)
            .await
            .map_err(|source| IdentityError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path();
        let persisted = PersistedIdentity {
            id: identity.id().to_string(),
            priv_key: identity.secret_hex().to_string(),
        };
        let contents = Zeroizing::new(serde_json::to_string_pretty(&persisted).map_err(|e| {
            IdentityError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?);

        tokio::fs::write(&path, contents.as_bytes())
            .await
            .map_err(|source| IdentityError::Io {
                path: path.clone(),
                source,
            })?;
        set_file_permissions_0600(&path).await
    }

    /// Load the identity, creating one if absent or unreadable.
    ///
    /// A corrupt file is logged and overwritten with a new identity.
    pub async fn load_or_create(&self) -> Result<(NodeIdentity, IdentitySource), IdentityError> {
        let source = match self.load().await {
            Ok(Some(identity)) => return Ok((identity, IdentitySource::Loaded)),
            Ok(None) => IdentitySource::Created,
            Err(IdentityError::Corrupt { path, reason }) => {
                tracing::warn!(path = %path.display(), %reason, "identity file corrupt, regenerating");
                IdentitySource::Regenerated
            }
            Err(e) => return Err(e),
        };

        let identity = NodeIdentity::generate()?;
        self.save(&identity).await?;
        tracing::info!(peer = %identity.id(), ?source, "node identity created");
        Ok((identity, source))
    }
}

/// Create a directory (and parents) readable only by the owner on Unix.
pub(crate) async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<(), IdentityError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|source| IdentityError::Io {
                path: path.to_path_buf(),
                source,
            })?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

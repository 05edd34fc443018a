//! Bearer token lifecycle.
//!
//! A token is read from the on-disk store at startup. When the store has
//! nothing usable, or registration is forced, the gateway registers with the
//! ingress API and writes the fresh token back. The token is then held for
//! the rest of the run; it is never refreshed.

use crate::ingress::{DeliveryError, IngressApi};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// HTTP status the registration endpoint answers with on success.
const REGISTRATION_OK: u16 = 200;

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}

/// Fatal errors while obtaining a credential.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("registration request failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("registration rejected with status {0}")]
    Rejected(u16),
    #[error("registration response carried no token")]
    MissingToken,
}

/// File holding the raw token bytes.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored token. An empty file counts as not found; bytes that
    /// are not UTF-8 are reported as invalid data.
    pub fn load(&self) -> io::Result<Credential> {
        let raw = fs::read(&self.path)?;
        let token = String::from_utf8(raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "token file is empty"));
        }
        Ok(Credential(token))
    }

    /// Overwrite the store with `credential`, creating the parent directory
    /// when needed.
    pub fn save(&self, credential: &Credential) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        write_private(&self.path, credential.as_str().as_bytes())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}

/// What startup should do after the credential step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// A credential is available; continue to scanning.
    Ready(Credential),
    /// Registration was forced and has completed; exit without scanning.
    RegisteredOnly(Credential),
}

/// Obtains the credential from the store or by registering.
pub struct CredentialManager<'a> {
    store: TokenStore,
    ingress: &'a dyn IngressApi,
    api_key: String,
}

impl<'a> CredentialManager<'a> {
    pub fn new(store: TokenStore, ingress: &'a dyn IngressApi, api_key: impl Into<String>) -> Self {
        Self {
            store,
            ingress,
            api_key: api_key.into(),
        }
    }

    /// Load the stored token, registering when none is usable.
    ///
    /// With `force_register` the store is not consulted; the gateway always
    /// registers and the result asks the caller to stop after persisting.
    pub async fn load_or_register(&self, force_register: bool) -> Result<Startup, CredentialError> {
        if force_register {
            info!("registration forced");
            let credential = self.register_and_persist().await?;
            return Ok(Startup::RegisteredOnly(credential));
        }

        match self.store.load() {
            Ok(credential) => {
                info!(path = %self.store.path().display(), "loaded token from store");
                Ok(Startup::Ready(credential))
            }
            Err(e) => {
                info!(
                    path = %self.store.path().display(),
                    error = %e,
                    "no usable stored token, registering"
                );
                let credential = self.register_and_persist().await?;
                Ok(Startup::Ready(credential))
            }
        }
    }

    /// Perform a single registration exchange.
    pub async fn register(&self) -> Result<Credential, CredentialError> {
        let reply = self.ingress.register(&self.api_key).await?;
        if reply.status != REGISTRATION_OK {
            return Err(CredentialError::Rejected(reply.status));
        }
        let token = reply
            .token
            .filter(|t| !t.is_empty())
            .ok_or(CredentialError::MissingToken)?;
        info!("registration succeeded");
        Ok(Credential(token))
    }

    async fn register_and_persist(&self) -> Result<Credential, CredentialError> {
        let credential = self.register().await?;
        match self.store.save(&credential) {
            Ok(()) => info!(path = %self.store.path().display(), "token saved"),
            Err(e) => warn!(
                path = %self.store.path().display(),
                error = %e,
                "unable to save token, continuing with in-memory token"
            ),
        }
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::RegistrationReply;
    use crate::test_utils::FakeIngress;
    use tempfile::tempdir;

    fn reply(status: u16, token: Option<&str>) -> Result<RegistrationReply, DeliveryError> {
        Ok(RegistrationReply {
            status,
            token: token.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_loads_existing_token_without_registering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");
        fs::write(&path, "stored-token\n").unwrap();

        let ingress = FakeIngress::new();
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "key");

        let startup = manager.load_or_register(false).await.unwrap();
        assert_eq!(startup, Startup::Ready(Credential::new("stored-token")));
        assert_eq!(ingress.registration_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_store_registers_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("jwt");

        let ingress = FakeIngress::new().with_registration(reply(200, Some("fresh")));
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "api-key");

        let startup = manager.load_or_register(false).await.unwrap();
        assert_eq!(startup, Startup::Ready(Credential::new("fresh")));
        assert_eq!(*ingress.registrations.lock().unwrap(), vec!["api-key"]);

        // Persisted and loadable next run
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh");
        assert_eq!(
            TokenStore::new(&path).load().unwrap(),
            Credential::new("fresh")
        );
    }

    #[tokio::test]
    async fn test_empty_store_registers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");
        fs::write(&path, "  \n").unwrap();

        let ingress = FakeIngress::new().with_registration(reply(200, Some("fresh")));
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "key");

        let startup = manager.load_or_register(false).await.unwrap();
        assert_eq!(startup, Startup::Ready(Credential::new("fresh")));
        assert_eq!(ingress.registration_count(), 1);
    }

    #[tokio::test]
    async fn test_non_utf8_store_registers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");
        fs::write(&path, [b'a', 0xFF, 0xFE, b'b']).unwrap();

        let err = TokenStore::new(&path).load().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let ingress = FakeIngress::new().with_registration(reply(200, Some("fresh")));
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "key");

        let startup = manager.load_or_register(false).await.unwrap();
        assert_eq!(startup, Startup::Ready(Credential::new("fresh")));
        assert_eq!(ingress.registration_count(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_forced_registration_ignores_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");
        fs::write(&path, "stale").unwrap();

        let ingress = FakeIngress::new().with_registration(reply(200, Some("renewed")));
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "key");

        let startup = manager.load_or_register(true).await.unwrap();
        assert_eq!(startup, Startup::RegisteredOnly(Credential::new("renewed")));
        assert_eq!(fs::read_to_string(&path).unwrap(), "renewed");
    }

    #[tokio::test]
    async fn test_non_200_registration_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jwt");

        let ingress = FakeIngress::new().with_registration(reply(201, Some("token")));
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "key");

        let err = manager.load_or_register(false).await.unwrap_err();
        assert!(matches!(err, CredentialError::Rejected(201)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_transport_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let ingress = FakeIngress::new().with_registration(Err(DeliveryError::Request(
            "connection refused".to_string(),
        )));
        let manager =
            CredentialManager::new(TokenStore::new(dir.path().join("jwt")), &ingress, "key");

        let err = manager.load_or_register(true).await.unwrap_err();
        assert!(matches!(err, CredentialError::Delivery(_)));
        assert_eq!(ingress.registration_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_token_is_fatal() {
        let dir = tempdir().unwrap();
        let ingress = FakeIngress::new().with_registration(reply(200, None));
        let manager =
            CredentialManager::new(TokenStore::new(dir.path().join("jwt")), &ingress, "key");

        let err = manager.register().await.unwrap_err();
        assert!(matches!(err, CredentialError::MissingToken));
    }

    #[tokio::test]
    async fn test_unwritable_store_keeps_token() {
        let dir = tempdir().unwrap();
        // A directory where the token file should be makes the write fail
        let path = dir.path().join("jwt");
        fs::create_dir(&path).unwrap();

        let ingress = FakeIngress::new().with_registration(reply(200, Some("fresh")));
        let manager = CredentialManager::new(TokenStore::new(&path), &ingress, "key");

        let startup = manager.load_or_register(true).await.unwrap();
        assert_eq!(startup, Startup::RegisteredOnly(Credential::new("fresh")));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("super-secret");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert_eq!(debug, "Credential(<12 bytes>)");
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_token_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("jwt"));
        store.save(&Credential::new("t")).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

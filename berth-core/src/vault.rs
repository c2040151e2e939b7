//! Ephemeral per-operation registry credentials.
//!
//! When a request carries registry credentials, the runner gets a private
//! engine-config directory populated via `docker login --password-stdin`.
//! The directory is owned by exactly one operation and removed on every
//! exit path, success or not, via the [`VaultDir`] guard.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// A registry login supplied with an operation. Never persisted.
#[derive(Clone, Deserialize)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
    #[serde(default, rename = "stack_pattern")]
    pub stack_pattern: String,
    #[serde(default, rename = "image_pattern")]
    pub image_pattern: String,
}

// Manual Debug keeps passwords out of logs no matter how a credential is
// formatted.
impl fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("stack_pattern", &self.stack_pattern)
            .field("image_pattern", &self.image_pattern)
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("failed to create vault directory: {0}")]
    Create(std::io::Error),

    #[error("failed to spawn engine login: {0}")]
    Spawn(std::io::Error),

    #[error("login to registry {registry:?} failed")]
    LoginFailed { registry: String },
}

/// An engine-config directory holding registry logins, removed on drop.
pub struct VaultDir {
    path: PathBuf,
}

impl VaultDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for VaultDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultDir").field("path", &self.path).finish()
    }
}

impl Drop for VaultDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove credential vault {:?}: {e}", self.path);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialVault {
    docker_bin: String,
    base_dir: PathBuf,
}

impl CredentialVault {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            base_dir: std::env::temp_dir(),
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Build a vault directory containing a login for each credential.
    ///
    /// Any login failure tears the directory down and returns an error; the
    /// error message names the registry but never the password.
    pub async fn build(
        &self,
        credentials: &[RegistryCredential],
    ) -> Result<VaultDir, VaultError> {
        let path = self.base_dir.join(format!("berth-vault-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(VaultError::Create)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(VaultError::Create)?;
        }

        // Removed on any early return below.
        let vault = VaultDir { path };

        for credential in credentials {
            debug!(
                registry = %credential.registry,
                username = %credential.username,
                "logging engine into registry"
            );
            self.login(&vault, credential).await?;
        }

        Ok(vault)
    }

    async fn login(
        &self,
        vault: &VaultDir,
        credential: &RegistryCredential,
    ) -> Result<(), VaultError> {
        let mut child = Command::new(&self.docker_bin)
            .arg("login")
            .arg(&credential.registry)
            .arg("-u")
            .arg(&credential.username)
            .arg("--password-stdin")
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", "/tmp")
            .env("DOCKER_CONFIG", vault.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(VaultError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(credential.password.as_bytes()).await;
            // Closing stdin lets the login read EOF after the password.
            drop(stdin);
        }

        let status = child.wait().await.map_err(VaultError::Spawn)?;
        if !status.success() {
            return Err(VaultError::LoginFailed {
                registry: credential.registry.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_passwords() {
        let credential = RegistryCredential {
            registry: "registry.example.com".into(),
            username: "ci".into(),
            password: "hunter2".into(),
            stack_pattern: "*".into(),
            image_pattern: "*".into(),
        };
        let formatted = format!("{credential:?}");
        assert!(!formatted.contains("hunter2"));
        assert!(formatted.contains("<redacted>"));
    }

    #[tokio::test]
    async fn vault_dir_is_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let vault = VaultDir {
            path: base.path().join("vault"),
        };
        std::fs::create_dir(&vault.path).unwrap();
        let path = vault.path().to_path_buf();
        assert!(path.exists());
        drop(vault);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_login_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        // `false` exits non-zero regardless of arguments.
        let vault = CredentialVault::new("false").with_base_dir(base.path());
        let credential = RegistryCredential {
            registry: "registry.example.com".into(),
            username: "ci".into(),
            password: "pw".into(),
            stack_pattern: String::new(),
            image_pattern: String::new(),
        };

        let err = vault.build(std::slice::from_ref(&credential)).await.unwrap_err();
        assert!(matches!(err, VaultError::LoginFailed { .. }));
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn successful_build_keeps_dir_until_drop() {
        let base = tempfile::tempdir().unwrap();
        // `true` exits zero, standing in for a successful engine login.
        let vault = CredentialVault::new("true").with_base_dir(base.path());
        let credential = RegistryCredential {
            registry: "registry.example.com".into(),
            username: "ci".into(),
            password: "pw".into(),
            stack_pattern: String::new(),
            image_pattern: String::new(),
        };

        let dir = vault.build(std::slice::from_ref(&credential)).await.unwrap();
        assert!(dir.path().exists());
        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!path.exists());
    }
}

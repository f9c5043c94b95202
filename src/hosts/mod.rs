//! Host management.
//!
//! Wraps the host repository with auth-kind validation, encryption of
//! the secret fields at rest and an SSH connectivity probe. Records
//! returned from here carry decrypted secrets; callers get copies, never
//! shared state.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto::SecretBox;
use crate::error::{Error, Result};
use crate::models::{AuthKind, Host, HostStatus};
use crate::repository::HostRepository;
use crate::ssh::{AuthMethod, ServerCheck, SshClient};

pub struct HostService {
    repo: Arc<dyn HostRepository>,
    secrets: SecretBox,
    server_check: ServerCheck,
    dial_timeout: Duration,
}

impl HostService {
    pub fn new(repo: Arc<dyn HostRepository>, secrets: SecretBox) -> Self {
        Self {
            repo,
            secrets,
            server_check: ServerCheck::default(),
            dial_timeout: Duration::from_secs(30),
        }
    }

    /// Override the host key policy and dial timeout used by the
    /// connectivity probe.
    pub fn with_options(mut self, server_check: ServerCheck, dial_timeout: Duration) -> Self {
        self.server_check = server_check;
        self.dial_timeout = dial_timeout;
        self
    }

    /// Validate, encrypt and persist a new host.
    pub async fn create(&self, mut host: Host) -> Result<Host> {
        if self.repo.get_by_name(&host.name).await?.is_some() {
            return Err(Error::Conflict(format!(
                "host name '{}' already exists",
                host.name
            )));
        }

        validate_auth_config(&host)?;
        self.encrypt_sensitive(&mut host)?;
        host.status = HostStatus::Inactive;

        self.repo.create(host).await
    }

    /// Fetch a host with its secrets decrypted.
    pub async fn get(&self, id: i64) -> Result<Host> {
        let mut host = self.repo.get_by_id(id).await?;
        self.decrypt_sensitive(&mut host)?;
        Ok(host)
    }

    /// Fetch all hosts. A host whose secrets cannot be decrypted is
    /// returned as stored rather than dropped from the listing.
    pub async fn get_all(&self) -> Result<Vec<Host>> {
        let mut hosts = self.repo.list().await?;
        for host in &mut hosts {
            if let Err(e) = self.decrypt_sensitive(host) {
                warn!("failed to decrypt secrets for host {}: {}", host.id, e);
            }
        }
        Ok(hosts)
    }

    /// Validate, re-encrypt and persist an updated host.
    pub async fn update(&self, mut host: Host) -> Result<()> {
        validate_auth_config(&host)?;
        self.encrypt_sensitive(&mut host)?;
        self.repo.update(&host).await
    }

    /// Delete a host. The repository rejects this while tunnels still
    /// reference it.
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.repo.delete(id).await
    }

    /// Dial the host, run a trivial command and record the outcome on the
    /// host's status and last-check timestamp.
    pub async fn test_connection(&self, id: i64) -> Result<()> {
        let host = self.get(id).await?;
        let auth = AuthMethod::for_host(&host)?;

        let client = match SshClient::connect(
            &host.hostname,
            host.port,
            &host.username,
            auth,
            self.server_check.clone(),
            self.dial_timeout,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                self.mark_error(id).await;
                return Err(e);
            }
        };

        let output = match client.execute("echo 'connection test'").await {
            Ok(output) => output,
            Err(e) => {
                let _ = client.disconnect().await;
                self.mark_error(id).await;
                return Err(e);
            }
        };
        let _ = client.disconnect().await;

        if output.trim().is_empty() {
            self.mark_error(id).await;
            return Err(Error::Connection("empty command output".to_string()));
        }

        self.repo
            .update_status(id, HostStatus::Active, Some(Utc::now()))
            .await
    }

    /// Alias of [`Self::test_connection`]; refreshes the stored status.
    pub async fn check_status(&self, id: i64) -> Result<()> {
        self.test_connection(id).await
    }

    /// Encrypt the password, private key and passphrase in place. Empty
    /// fields stay empty.
    pub fn encrypt_sensitive(&self, host: &mut Host) -> Result<()> {
        if !host.password.is_empty() {
            host.password = self.secrets.encrypt(&host.password)?;
        }
        if !host.private_key.is_empty() {
            host.private_key = self.secrets.encrypt(&host.private_key)?;
        }
        if !host.passphrase.is_empty() {
            host.passphrase = self.secrets.encrypt(&host.passphrase)?;
        }
        Ok(())
    }

    /// Decrypt the secret fields in place. A field that is not ciphertext
    /// passes through unchanged (legacy plaintext rows); any other
    /// decryption failure is surfaced.
    pub fn decrypt_sensitive(&self, host: &mut Host) -> Result<()> {
        decrypt_field(&self.secrets, host.id, "password", &mut host.password)?;
        decrypt_field(&self.secrets, host.id, "private key", &mut host.private_key)?;
        decrypt_field(&self.secrets, host.id, "passphrase", &mut host.passphrase)?;
        Ok(())
    }

    async fn mark_error(&self, id: i64) {
        if let Err(e) = self.repo.update_status(id, HostStatus::Error, None).await {
            warn!("failed to persist error status for host {}: {}", id, e);
        }
    }
}

fn decrypt_field(secrets: &SecretBox, host_id: i64, name: &str, field: &mut String) -> Result<()> {
    if field.is_empty() {
        return Ok(());
    }

    match secrets.decrypt(field) {
        Ok(plaintext) => {
            *field = plaintext;
            Ok(())
        }
        Err(Error::CryptoFormat) => {
            debug!(
                "host {} {} appears to be unencrypted, keeping as-is",
                host_id, name
            );
            Ok(())
        }
        Err(e) => Err(Error::CryptoIntegrity(format!(
            "failed to decrypt {name}: {e}"
        ))),
    }
}

/// Check that the auth kind's required secret fields are present. Runs
/// against plaintext, before encryption.
fn validate_auth_config(host: &Host) -> Result<()> {
    match host.auth_kind {
        AuthKind::Password => {
            if host.password.is_empty() {
                return Err(Error::Validation(
                    "password is required for password authentication".to_string(),
                ));
            }
        }
        AuthKind::Key => {
            if host.private_key.is_empty() && host.key_path.is_empty() {
                return Err(Error::Validation(
                    "private key or key path is required for key authentication".to_string(),
                ));
            }
        }
        AuthKind::KeyPassword => {
            if host.private_key.is_empty() && host.key_path.is_empty() {
                return Err(Error::Validation(
                    "private key or key path is required for key with password authentication"
                        .to_string(),
                ));
            }
            if host.passphrase.is_empty() {
                return Err(Error::Validation(
                    "passphrase is required for key with password authentication".to_string(),
                ));
            }
        }
    }
    Ok(())
}

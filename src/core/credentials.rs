//! Device credentials and secret resolution.
//!
//! The inventory only ever carries an opaque secret reference. Plugins ask a
//! `SecretResolver` for the plaintext right before mounting and drop it
//! afterwards.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretRef(<redacted>)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub secret: Option<SecretRef>,
}

pub trait SecretResolver: Send + Sync {
    fn reveal(&self, secret: &SecretRef) -> Result<String>;
}

/// Resolves `env:NAME` and `file:/path` references.
#[derive(Debug, Default)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn reveal(&self, secret: &SecretRef) -> Result<String> {
        let reference = secret.as_str();

        if let Some(name) = reference.strip_prefix("env:") {
            return std::env::var(name)
                .map_err(|_| Error::Credentials(format!("environment variable {} is not set", name)));
        }

        if let Some(path) = reference.strip_prefix("file:") {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Credentials(format!("cannot read {}: {}", path, e)))?;
            return Ok(content.trim_end_matches(['\r', '\n']).to_string());
        }

        Err(Error::Credentials(
            "unsupported secret reference, expected env:NAME or file:/path".to_string(),
        ))
    }
}

/// Resolve the password for a device, if it has one.
pub fn reveal_password(
    resolver: &Arc<dyn SecretResolver>,
    credentials: Option<&Credentials>,
) -> Result<Option<String>> {
    match credentials.and_then(|c| c.secret.as_ref()) {
        Some(secret) => resolver.reveal(secret).map(Some),
        None => Ok(None),
    }
}

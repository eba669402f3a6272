//! Secret broker integration.
//!
//! Every job authenticates on its own: the requestor hands over a wrapped
//! AppRole secret id, the broker unwraps it and logs in under the node's role
//! id, and the resulting short-lived token is the only credential used to
//! decrypt the payload and read the job's secrets. The token is revoked once
//! the job is done.
//!
//! [`SecretBroker`] is the seam used by the executor and the HTTP API;
//! [`VaultClient`] implements it against the Vault HTTP API.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Map, Value};

pub mod client;

pub use client::VaultClient;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Vault SecretID wrapping token was not provided in request")]
    NoWrappingToken,

    #[error(
        "failed to unwrap the token to retrieve the SecretID, possible security/interception \
         alert, this request may have been tampered with: {0}"
    )]
    Unwrap(Box<VaultError>),

    #[error("invalid vault address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vault returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed vault response: {0}")]
    Malformed(String),
}

impl VaultError {
    /// The broker rejected the presented token or its policies.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, VaultError::Api { status: 403, .. })
    }
}

/// Response to a logical read.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SecretResponse {
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

impl SecretResponse {
    pub fn warnings(&self) -> &[String] {
        self.warnings.as_deref().unwrap_or_default()
    }

    /// The key/value pairs held at the path.
    ///
    /// A versioned (v2) key/value engine nests the values one level down
    /// under `data`; that inner map wins over the outer one when present.
    pub fn values(&self) -> Option<&Map<String, Value>> {
        let data = self.data.as_ref()?;
        match data.get("data") {
            Some(Value::Object(inner)) => Some(inner),
            _ => Some(data),
        }
    }
}

#[async_trait]
pub trait SecretBroker: Send + Sync + std::fmt::Debug {
    /// Unwrap `wrapped_secret_id` and log in with it, returning a session token.
    async fn login(&self, wrapped_secret_id: &str) -> Result<SecretString, VaultError>;

    /// Decrypt a transit ciphertext with the node's role-named key.
    async fn decrypt(&self, token: &SecretString, ciphertext: &str)
        -> Result<Vec<u8>, VaultError>;

    /// Read a path. `Ok(None)` means nothing is stored there.
    async fn read(
        &self,
        token: &SecretString,
        path: &str,
    ) -> Result<Option<SecretResponse>, VaultError>;

    /// Read the `payload` field of a cubbyhole entry.
    async fn read_cubbyhole(&self, token: &str, path: &str) -> Result<String, VaultError>;

    /// Verify a caller's token, returning its policies.
    async fn lookup_self(&self, token: &str) -> Result<Vec<String>, VaultError>;

    async fn revoke_self(&self, token: &SecretString) -> Result<(), VaultError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> SecretResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn flat_values() {
        let resp = response(r#"{"data": {"password": "s3cr3t"}, "warnings": null}"#);
        assert_eq!(resp.values().unwrap()["password"], "s3cr3t");
        assert!(resp.warnings().is_empty());
    }

    #[test]
    fn versioned_values_are_unwrapped() {
        let resp = response(
            r#"{"data": {"data": {"password": "v2"}, "metadata": {"version": 3}}}"#,
        );
        let values = resp.values().unwrap();
        assert_eq!(values["password"], "v2");
        assert!(!values.contains_key("metadata"));
    }

    #[test]
    fn missing_data() {
        let resp = response(r#"{"warnings": ["deprecated path"]}"#);
        assert!(resp.values().is_none());
        assert_eq!(resp.warnings(), ["deprecated path"]);
    }

    #[test]
    fn unwrap_error_carries_alert() {
        let err = VaultError::Unwrap(Box::new(VaultError::Api {
            status: 400,
            message: "wrapping token is not valid or does not exist".to_string(),
        }));
        let msg = err.to_string();
        assert!(msg.contains("interception"));
        assert!(msg.contains("wrapping token is not valid"));
    }
}

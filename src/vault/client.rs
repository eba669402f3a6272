use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{SecretBroker, SecretResponse, VaultError};
use crate::config::VaultConfig;

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DataBody<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SecretIdData {
    secret_id: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Debug, Deserialize)]
struct PlaintextData {
    plaintext: String,
}

#[derive(Debug, Deserialize)]
struct CubbyData {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    policies: Vec<String>,
}

/// Vault HTTP API client.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    base: Url,
    role_id: String,
    role_name: String,
}

impl VaultClient {
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let invalid = |reason: String| VaultError::InvalidAddress {
            addr: config.addr.clone(),
            reason,
        };
        let mut base = Url::parse(&config.addr).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base,
            role_id: config.role_id.clone(),
            role_name: config.role_name.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url, VaultError> {
        let path = format!("v1/{}", path.trim_start_matches('/'));
        self.base
            .join(&path)
            .map_err(|e| VaultError::InvalidAddress {
                addr: self.base.to_string(),
                reason: e.to_string(),
            })
    }

    /// Map a non-success response to [`VaultError::Api`].
    async fn check(response: Response) -> Result<Response, VaultError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) if !body.errors.is_empty() => body.errors.join("; "),
            _ => text,
        };
        Err(VaultError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, VaultError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| VaultError::Malformed(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, token: &str, path: &str) -> Result<T, VaultError> {
        let response = self
            .http
            .get(self.url(path)?)
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        Self::parse(Self::check(response).await?).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        token: Option<&str>,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, VaultError> {
        let mut request = self.http.post(self.url(path)?).json(&body);
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request.send().await?;
        Self::parse(Self::check(response).await?).await
    }

    async fn unwrap_secret_id(&self, wrapping_token: &str) -> Result<String, VaultError> {
        let body: DataBody<SecretIdData> = self
            .post(Some(wrapping_token), "sys/wrapping/unwrap", json!({}))
            .await?;
        Ok(body.data.secret_id)
    }
}

#[async_trait]
impl SecretBroker for VaultClient {
    async fn login(&self, wrapped_secret_id: &str) -> Result<SecretString, VaultError> {
        if wrapped_secret_id.is_empty() {
            return Err(VaultError::NoWrappingToken);
        }
        let secret_id = self
            .unwrap_secret_id(wrapped_secret_id)
            .await
            .map_err(|e| VaultError::Unwrap(Box::new(e)))?;

        let body: LoginBody = self
            .post(
                None,
                "auth/approle/login",
                json!({ "role_id": self.role_id, "secret_id": secret_id }),
            )
            .await?;
        let auth = body
            .auth
            .ok_or_else(|| VaultError::Malformed("AppRole login returned no auth".to_string()))?;
        tracing::debug!(role_id = %self.role_id, "AppRole login succeeded");
        Ok(SecretString::from(auth.client_token))
    }

    async fn decrypt(
        &self,
        token: &SecretString,
        ciphertext: &str,
    ) -> Result<Vec<u8>, VaultError> {
        let path = format!("transit/decrypt/{}", self.role_name);
        let body: DataBody<PlaintextData> = self
            .post(
                Some(token.expose_secret()),
                &path,
                json!({ "ciphertext": ciphertext }),
            )
            .await?;
        STANDARD
            .decode(body.data.plaintext)
            .map_err(|e| VaultError::Malformed(format!("plaintext is not base64: {e}")))
    }

    async fn read(
        &self,
        token: &SecretString,
        path: &str,
    ) -> Result<Option<SecretResponse>, VaultError> {
        let response = self
            .http
            .get(self.url(path)?)
            .header(TOKEN_HEADER, token.expose_secret())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Vault answers 404 with warnings for deleted versions; keep those.
            let text = response.text().await.unwrap_or_default();
            return Ok(serde_json::from_str::<SecretResponse>(&text)
                .ok()
                .filter(|r| r.data.is_some() || !r.warnings().is_empty()));
        }
        let response = Self::check(response).await?;
        Ok(Some(Self::parse(response).await?))
    }

    async fn read_cubbyhole(&self, token: &str, path: &str) -> Result<String, VaultError> {
        let body: DataBody<CubbyData> = self.get(token, path).await?;
        Ok(body.data.payload)
    }

    async fn lookup_self(&self, token: &str) -> Result<Vec<String>, VaultError> {
        let body: DataBody<LookupData> = self.get(token, "auth/token/lookup-self").await?;
        Ok(body.data.policies)
    }

    async fn revoke_self(&self, token: &SecretString) -> Result<(), VaultError> {
        let response = self
            .http
            .post(self.url("auth/token/revoke-self")?)
            .header(TOKEN_HEADER, token.expose_secret())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

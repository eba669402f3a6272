//! Secret references and their resolution against the secret broker.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::vault::{SecretBroker, SecretResponse, VaultError};

static SECRET_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_]+)@([A-Za-z0-9_/\-]+)\.([A-Za-z0-9_\-]+)$").expect("secret ref pattern is valid")
});

/// Variable always present in the secrets file: the job's own session token.
pub const TOKEN_VAR: &str = "TOKEN";

/// Banner written ahead of a YAML secrets file.
pub const YAML_BANNER: &str = "---\n# vault secrets injected by fleet-broker\n";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretRefError {
    #[error("Target variable name in secretref cannot be empty: {0}")]
    EmptyVar(String),

    #[error("Secretref must have a path: {0}")]
    EmptyPath(String),

    #[error("Secretref must have a path.key: {0}")]
    EmptyKey(String),

    #[error("Secretref is unparseable: {0}")]
    Unparseable(String),
}

/// `VAR@path.key`: expose `key` of the secret at `path` as `VAR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub var: String,
    pub path: String,
    pub key: String,
}

impl FromStr for SecretRef {
    type Err = SecretRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(caps) = SECRET_REF.captures(s) {
            return Ok(SecretRef {
                var: caps[1].to_string(),
                path: caps[2].to_string(),
                key: caps[3].to_string(),
            });
        }

        // Work out which part is missing for a useful message.
        let raw = s.to_string();
        let Some((var, rest)) = s.split_once('@') else {
            return Err(SecretRefError::Unparseable(raw));
        };
        if var.is_empty() {
            return Err(SecretRefError::EmptyVar(raw));
        }
        match rest.rsplit_once('.') {
            None => Err(SecretRefError::EmptyKey(raw)),
            Some(("", _)) => Err(SecretRefError::EmptyPath(raw)),
            Some((_, "")) => Err(SecretRefError::EmptyKey(raw)),
            Some(_) => Err(SecretRefError::Unparseable(raw)),
        }
    }
}

/// Format of the secrets file injected into the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecretFileType {
    #[default]
    Yaml,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretFileError {
    #[error("Invalid SecretFileType: '{0}'")]
    Invalid(String),

    #[error("Failed to marshal secrets to yaml for container injection: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to marshal secrets to json for container injection: {0}")]
    Json(#[from] serde_json::Error),
}

impl FromStr for SecretFileType {
    type Err = SecretFileError;

    /// An empty value selects YAML.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "yaml" => Ok(SecretFileType::Yaml),
            "json" => Ok(SecretFileType::Json),
            other => Err(SecretFileError::Invalid(other.to_string())),
        }
    }
}

impl SecretFileType {
    pub fn file_name(&self) -> &'static str {
        match self {
            SecretFileType::Yaml => "secrets.yml",
            SecretFileType::Json => "secrets.json",
        }
    }

    pub fn render(&self, secrets: &BTreeMap<String, String>) -> Result<Vec<u8>, SecretFileError> {
        match self {
            SecretFileType::Yaml => {
                let mut out = YAML_BANNER.to_string();
                out.push_str(&serde_yaml::to_string(secrets)?);
                Ok(out.into_bytes())
            }
            SecretFileType::Json => Ok(serde_json::to_vec(secrets)?),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error(transparent)]
    Ref(#[from] SecretRefError),

    #[error("Failed to retrieve secret {path} from vault err: {source}")]
    Read {
        path: String,
        #[source]
        source: VaultError,
    },

    #[error("Failed to retrieve secret {path} from vault: response is empty")]
    Missing { path: String },

    #[error("FailOnWarnings from vault path {path} lookups: {warnings:?}")]
    Warnings { path: String, warnings: Vec<String> },

    #[error("No data returned from vault path {path}.{key}")]
    NoData { path: String, key: String },

    #[error("Failed retrieving from vault path {path}.{key}")]
    MissingKey { path: String, key: String },
}

/// Resolves a job's secret references with the job's own token.
///
/// Each path is read at most once per resolver; the cache lives and dies
/// with the job.
#[derive(Debug)]
pub struct SecretResolver<'a> {
    broker: &'a dyn SecretBroker,
    token: &'a SecretString,
    cont_on_warnings: bool,
    cache: HashMap<String, SecretResponse>,
}

impl<'a> SecretResolver<'a> {
    pub fn new(broker: &'a dyn SecretBroker, token: &'a SecretString, cont_on_warnings: bool) -> Self {
        Self {
            broker,
            token,
            cont_on_warnings,
            cache: HashMap::new(),
        }
    }

    async fn fetch(&mut self, path: &str) -> Result<&SecretResponse, SecretError> {
        if !self.cache.contains_key(path) {
            let response = self
                .broker
                .read(self.token, path)
                .await
                .map_err(|source| SecretError::Read {
                    path: path.to_string(),
                    source,
                })?
                .ok_or_else(|| SecretError::Missing {
                    path: path.to_string(),
                })?;

            if !self.cont_on_warnings && !response.warnings().is_empty() {
                return Err(SecretError::Warnings {
                    path: path.to_string(),
                    warnings: response.warnings().to_vec(),
                });
            }
            tracing::debug!(path, "Fetched secret path");
            self.cache.insert(path.to_string(), response);
        }
        self.cache.get(path).ok_or_else(|| SecretError::Missing {
            path: path.to_string(),
        })
    }

    /// Resolve every reference, returning variable name to value. The job
    /// token is always present as [`TOKEN_VAR`]; a reference may override it.
    pub async fn resolve(&mut self, refs: &[String]) -> Result<BTreeMap<String, String>, SecretError> {
        let mut secrets = BTreeMap::new();
        secrets.insert(TOKEN_VAR.to_string(), self.token.expose_secret().to_string());

        for raw in refs {
            let SecretRef { var, path, key } = raw.parse()?;
            let response = self.fetch(&path).await?;
            let values = response.values().ok_or_else(|| SecretError::NoData {
                path: path.clone(),
                key: key.clone(),
            })?;
            let value = match values.get(&key) {
                None | Some(Value::Null) => {
                    return Err(SecretError::MissingKey { path, key });
                }
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            secrets.insert(var, value);
        }
        Ok(secrets)
    }

    /// Number of distinct paths read so far.
    pub fn paths_read(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_ref() {
        let r: SecretRef = "DB@secret/data/app.password".parse().unwrap();
        assert_eq!(r.var, "DB");
        assert_eq!(r.path, "secret/data/app");
        assert_eq!(r.key, "password");

        let r: SecretRef = "api_key@kv/my-service_1.api-key".parse().unwrap();
        assert_eq!(r.path, "kv/my-service_1");
        assert_eq!(r.key, "api-key");
    }

    #[test]
    fn reject_missing_parts() {
        assert!(matches!(
            "@path.key".parse::<SecretRef>(),
            Err(SecretRefError::EmptyVar(_))
        ));
        assert!(matches!(
            "VAR@.key".parse::<SecretRef>(),
            Err(SecretRefError::EmptyPath(_))
        ));
        assert!(matches!(
            "VAR@path.".parse::<SecretRef>(),
            Err(SecretRefError::EmptyKey(_))
        ));
        assert!(matches!(
            "VAR@path".parse::<SecretRef>(),
            Err(SecretRefError::EmptyKey(_))
        ));
        assert!(matches!(
            "no-at-sign".parse::<SecretRef>(),
            Err(SecretRefError::Unparseable(_))
        ));
        assert!(matches!(
            "VAR@pa th.key".parse::<SecretRef>(),
            Err(SecretRefError::Unparseable(_))
        ));
    }

    #[test]
    fn reject_non_ascii_names() {
        for raw in ["é@x.y", "VAR@pâth.key", "VAR@path.kéy"] {
            assert!(
                matches!(raw.parse::<SecretRef>(), Err(SecretRefError::Unparseable(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn secret_file_type_defaults_to_yaml() {
        assert_eq!("".parse::<SecretFileType>().unwrap(), SecretFileType::Yaml);
        assert_eq!("yaml".parse::<SecretFileType>().unwrap(), SecretFileType::Yaml);
        assert_eq!("json".parse::<SecretFileType>().unwrap(), SecretFileType::Json);
        let err = "toml".parse::<SecretFileType>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid SecretFileType: 'toml'");
    }

    #[test]
    fn render_yaml_with_banner() {
        let mut secrets = BTreeMap::new();
        secrets.insert("DB".to_string(), "hunter2".to_string());
        secrets.insert(TOKEN_VAR.to_string(), "s.abc".to_string());

        let out = String::from_utf8(SecretFileType::Yaml.render(&secrets).unwrap()).unwrap();
        assert!(out.starts_with(YAML_BANNER));
        let parsed: BTreeMap<String, String> = serde_yaml::from_str(&out).unwrap();
        assert_eq!(parsed, secrets);
        assert_eq!(SecretFileType::Yaml.file_name(), "secrets.yml");
    }

    #[test]
    fn render_json() {
        let mut secrets = BTreeMap::new();
        secrets.insert("DB".to_string(), "hunter2".to_string());
        let out = SecretFileType::Json.render(&secrets).unwrap();
        assert_eq!(out, br#"{"DB":"hunter2"}"#);
        assert_eq!(SecretFileType::Json.file_name(), "secrets.json");
    }
}

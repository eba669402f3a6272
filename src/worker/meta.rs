//! Job metadata layering.
//!
//! A job's image and secret references can come from three places: a meta
//! file baked into the container image, a meta file shipped in the job's
//! content archive, and the decrypted payload itself. [`LayeredMeta`] merges
//! them with one fixed policy per field:
//!
//! | field             | image layer | content layer | payload layer | rule                    |
//! |-------------------|-------------|---------------|---------------|-------------------------|
//! | `container_image` | ignored     | fallback      | wins          | payload, else content   |
//! | `secret_refs`     | first       | second        | last          | image ++ content ++ payload |
//!
//! The image layer cannot name the image: it is only readable once a
//! container exists for that image.

use serde::Deserialize;

/// Meta file looked up at the root of the content archive.
pub const CONTENT_META_FILE: &str = "broker.yml";

/// Meta file looked up inside the job's container image.
pub const IMAGE_META_FILE: &str = "/broker_image.yml";

#[derive(Debug, thiserror::Error)]
#[error("Failed parsing yaml in {file}: {source}")]
pub struct MetaError {
    file: String,
    #[source]
    source: serde_yaml::Error,
}

/// Contents of a meta file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Meta {
    pub container_image: String,
    pub secret_refs: Vec<String>,
}

impl Meta {
    /// Parse a meta file. An empty file is an empty layer.
    pub fn from_yaml(file: &str, bytes: &[u8]) -> Result<Self, MetaError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let meta: Option<Meta> = serde_yaml::from_slice(bytes).map_err(|source| MetaError {
            file: file.to_string(),
            source,
        })?;
        Ok(meta.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayeredMeta {
    pub image: Meta,
    pub content: Meta,
    pub payload: Meta,
}

impl LayeredMeta {
    pub fn new(content: Meta, payload: Meta) -> Self {
        Self {
            image: Meta::default(),
            content,
            payload,
        }
    }

    pub fn with_image(mut self, image: Meta) -> Self {
        self.image = image;
        self
    }

    pub fn container_image(&self) -> &str {
        if self.payload.container_image.is_empty() {
            &self.content.container_image
        } else {
            &self.payload.container_image
        }
    }

    pub fn secret_refs(&self) -> Vec<String> {
        [&self.image, &self.content, &self.payload]
            .into_iter()
            .flat_map(|layer| layer.secret_refs.iter().cloned())
            .collect()
    }

    pub fn merge(&self) -> Meta {
        Meta {
            container_image: self.container_image().to_string(),
            secret_refs: self.secret_refs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(image: &str, refs: &[&str]) -> Meta {
        Meta {
            container_image: image.to_string(),
            secret_refs: refs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn parse_meta_file() {
        let yaml = b"container_image: alpine:3.18\nsecret_refs:\n  - DB@secret/app.password\n";
        let m = Meta::from_yaml("broker.yml", yaml).unwrap();
        assert_eq!(m, meta("alpine:3.18", &["DB@secret/app.password"]));
    }

    #[test]
    fn empty_and_partial_files() {
        assert_eq!(Meta::from_yaml("broker.yml", b"").unwrap(), Meta::default());
        assert_eq!(Meta::from_yaml("broker.yml", b"~\n").unwrap(), Meta::default());
        let m = Meta::from_yaml("broker.yml", b"secret_refs: [A@p.k]\n").unwrap();
        assert!(m.container_image.is_empty());
        assert_eq!(m.secret_refs, ["A@p.k"]);
    }

    #[test]
    fn bad_yaml_names_the_file() {
        let err = Meta::from_yaml("/broker_image.yml", b"secret_refs: {").unwrap_err();
        assert!(err.to_string().contains("/broker_image.yml"));
    }

    #[test]
    fn payload_image_wins_over_content() {
        let layers = LayeredMeta::new(meta("content:1", &[]), meta("payload:1", &[]));
        assert_eq!(layers.container_image(), "payload:1");

        let layers = LayeredMeta::new(meta("content:1", &[]), meta("", &[]));
        assert_eq!(layers.container_image(), "content:1");
    }

    #[test]
    fn image_layer_never_names_image() {
        let layers = LayeredMeta::new(meta("", &[]), meta("", &[])).with_image(meta("image:1", &[]));
        assert_eq!(layers.container_image(), "");
    }

    #[test]
    fn secret_refs_concatenate_in_layer_order() {
        let layers = LayeredMeta::new(meta("", &["C@p.k"]), meta("", &["P@p.k"]))
            .with_image(meta("", &["I@p.k", "I2@p.k"]));
        assert_eq!(layers.secret_refs(), ["I@p.k", "I2@p.k", "C@p.k", "P@p.k"]);
        assert_eq!(layers.merge().secret_refs.len(), 4);
    }
}

//! Local image housekeeping.
//!
//! Every job records the image it ran on in the node's [`ImageRegistry`].
//! [`ImageCleaner`] periodically removes images that no job on this node has
//! used within the retention window. Images this process never used are
//! not touched: they may belong to something else on the host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::node::NodeContext;
use crate::runtime::RuntimeError;
use crate::scheduler::timer::splayed;

/// Last time each image was used by a job, keyed by image id.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    last_used: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ImageRegistry {
    pub fn mark_used(&self, image: &str, when: DateTime<Utc>) {
        let mut last_used = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        last_used.insert(image.to_string(), when);
    }

    pub fn last_used(&self, image: &str) -> Option<DateTime<Utc>> {
        let last_used = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        last_used.get(image).copied()
    }

    pub fn forget(&self, image: &str) {
        let mut last_used = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        last_used.remove(image);
    }

    pub fn len(&self) -> usize {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ImageCleaner {
    ctx: Arc<NodeContext>,
}

impl ImageCleaner {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Remove every local image last used before the retention window.
    /// Returns the ids removed.
    pub async fn sweep(&self) -> Result<Vec<String>, RuntimeError> {
        let cutoff = self.ctx.now() - self.ctx.config.image_retention;
        let registry = &self.ctx.images;
        let mut removed = Vec::new();

        for image in self.ctx.runtime.list_images().await? {
            let key = [image.id.clone(), image.reference()]
                .into_iter()
                .find(|key| registry.last_used(key).is_some());
            let Some(key) = key else { continue };
            let Some(last_used) = registry.last_used(&key) else { continue };
            if last_used >= cutoff {
                continue;
            }

            tracing::info!(image_id = %image.id, image = %image.reference(), %last_used, "Removing unused image");
            match self.ctx.runtime.remove_image(&image.id).await {
                Ok(()) => {
                    registry.forget(&key);
                    removed.push(image.id);
                }
                Err(e) => {
                    tracing::warn!(image_id = %image.id, error = %e, "Failed to remove image");
                }
            }
        }
        Ok(removed)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let config = &self.ctx.config;
        loop {
            let delay = splayed(config.image_cleanup_interval, config.image_cleanup_splay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Image cleanup failed");
            }
        }
        tracing::debug!("Image cleaner stopped");
    }
}

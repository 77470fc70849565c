use log::{debug, error, warn};
use std::path::Path;
use std::sync::Arc;

use crate::core::io::Storage;
use crate::core::state::Session;

pub const SESSION_RECORD: &str = "story_session.json";

/// Best-effort store for the single resumable session. Failures are logged,
/// never returned: losing the record only costs resumability.
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    key: String,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>, state_folder: &str) -> Self {
        let key = Path::new(state_folder)
            .join(SESSION_RECORD)
            .to_string_lossy()
            .to_string();
        Self { storage, key }
    }

    #[cfg(test)]
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub async fn save(&self, session: &Session) {
        let content = match serde_json::to_string_pretty(&session.persisted()) {
            Ok(c) => c,
            Err(e) => {
                error!("Could not serialize story session: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.write(&self.key, content.as_bytes()).await {
            error!("Could not save story session to {}: {:#}", self.key, e);
        } else {
            debug!("Saved story session ({:?})", session.state);
        }
    }

    pub async fn load(&self) -> Option<Session> {
        match self.storage.exists(&self.key).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                error!("Could not check for a saved story session: {:#}", e);
                return None;
            }
        }

        let bytes = match self.storage.read(&self.key).await {
            Ok(b) => b,
            Err(e) => {
                error!("Could not load story session from {}: {:#}", self.key, e);
                return None;
            }
        };

        let session = serde_json::from_slice::<Session>(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|s| {
                s.normalized()
                    .ok_or_else(|| "record breaks session invariants".to_string())
            });

        match session {
            Ok(s) => Some(s),
            Err(reason) => {
                warn!("Saved story session is corrupt ({}); clearing it", reason);
                self.clear().await;
                None
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(e) = self.storage.delete(&self.key).await {
            error!("Could not clear story session at {}: {:#}", self.key, e);
        }
    }
}

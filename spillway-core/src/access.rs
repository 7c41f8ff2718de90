//! Channel access-handle resolution and persistence.
//!
//! Every upstream call that addresses the source channel needs an opaque
//! access handle next to the channel id, and each bot session has its own
//! view of it, so the map is keyed by worker first. The map is mirrored to
//! a JSON file after every mutation and reloaded at startup, sparing
//! restarted processes the slow resolution path.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::pool::Worker;
use crate::upstream::{UpstreamError, WorkerId};

/// Errors raised while resolving a channel access handle.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The channel is not visible to this worker's session, or the probe
    /// returned a zero handle for it.
    #[error("channel {channel_id} not accessible through worker {worker_id}")]
    Unavailable {
        /// Worker whose session performed the probe.
        worker_id: WorkerId,
        /// Channel that could not be resolved.
        channel_id: i64,
    },

    /// The probe call itself failed.
    #[error("upstream error while resolving channel access: {0}")]
    Upstream(#[from] UpstreamError),
}

type AccessMap = HashMap<WorkerId, HashMap<i64, u64>>;

/// Resolves and persists per-worker channel access handles.
pub struct AccessResolver {
    map: RwLock<AccessMap>,
    path: PathBuf,
}

impl AccessResolver {
    /// Loads the persisted map from `path`.
    ///
    /// A missing or malformed file yields an empty map; individual entries
    /// that fail to parse are skipped rather than rejecting the rest.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, HashMap<String, u64>>>(
                &bytes,
            ) {
                Ok(raw) => {
                    let map = parse_raw_map(raw);
                    info!(path = %path.display(), workers = map.len(), "channel access cache loaded");
                    map
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "channel access cache unreadable, starting empty");
                    AccessMap::new()
                }
            },
            // No cache file yet is the normal first-run state.
            Err(_) => AccessMap::new(),
        };
        Self {
            map: RwLock::new(map),
            path,
        }
    }

    /// Returns the cached handle for `(worker, channel)` if present.
    pub async fn cached(&self, worker_id: WorkerId, channel_id: i64) -> Option<u64> {
        self.map
            .read()
            .await
            .get(&worker_id)
            .and_then(|channels| channels.get(&channel_id))
            .copied()
    }

    /// Ensures a handle for `(worker, channel)`, probing through the
    /// worker's session on a miss.
    ///
    /// Concurrent misses for the same pair may race; both resolve the same
    /// idempotent value, which is cheaper than per-key singleflight.
    ///
    /// # Errors
    ///
    /// - `AccessError::Unavailable` - the channel is not visible to this
    ///   worker or only a zero handle came back
    /// - `AccessError::Upstream` - the probe call failed
    pub async fn ensure(&self, worker: &Worker, channel_id: i64) -> Result<u64, AccessError> {
        if let Some(handle) = self.cached(worker.id(), channel_id).await {
            return Ok(handle);
        }

        let chats = worker.api().channels_by_id(channel_id).await?;
        let handle = chats
            .iter()
            .find(|chat| chat.id == channel_id && chat.access_hash != 0)
            .map(|chat| chat.access_hash)
            .ok_or(AccessError::Unavailable {
                worker_id: worker.id(),
                channel_id,
            })?;

        self.store(worker.id(), channel_id, handle).await;
        info!(worker = worker.id(), channel = channel_id, "channel access resolved");
        Ok(handle)
    }

    /// Stores a handle and rewrites the persistence file. Zero handles are
    /// never stored.
    pub async fn store(&self, worker_id: WorkerId, channel_id: i64, handle: u64) {
        if handle == 0 {
            return;
        }
        let mut map = self.map.write().await;
        map.entry(worker_id).or_default().insert(channel_id, handle);
        if let Err(err) = self.write_file(&map) {
            warn!(path = %self.path.display(), %err, "failed to persist channel access cache");
        }
    }

    /// Rewrites the persistence file from the current map; called once
    /// more during shutdown. The file is only ever written under the
    /// writer lock.
    pub async fn persist(&self) {
        let map = self.map.write().await;
        if let Err(err) = self.write_file(&map) {
            warn!(path = %self.path.display(), %err, "failed to persist channel access cache");
        }
    }

    /// Whole-file rewrite: temp file with owner-only permissions, then an
    /// atomic rename over the target.
    fn write_file(&self, map: &AccessMap) -> std::io::Result<()> {
        let raw: HashMap<String, HashMap<String, u64>> = map
            .iter()
            .map(|(worker_id, channels)| {
                (
                    worker_id.to_string(),
                    channels
                        .iter()
                        .map(|(channel_id, handle)| (channel_id.to_string(), *handle))
                        .collect(),
                )
            })
            .collect();
        let bytes = serde_json::to_vec_pretty(&raw).map_err(std::io::Error::other)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)
    }
}

fn parse_raw_map(raw: HashMap<String, HashMap<String, u64>>) -> AccessMap {
    let mut map = AccessMap::new();
    for (worker_key, channels) in raw {
        let Ok(worker_id) = worker_key.parse::<WorkerId>() else {
            warn!(key = %worker_key, "skipping unparseable worker entry");
            continue;
        };
        for (channel_key, handle) in channels {
            let Ok(channel_id) = channel_key.parse::<i64>() else {
                warn!(key = %channel_key, "skipping unparseable channel entry");
                continue;
            };
            if handle == 0 {
                continue;
            }
            map.entry(worker_id).or_default().insert(channel_id, handle);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::pool::BotCredential;
    use crate::upstream::UpstreamConnector;
    use crate::upstream::simulation::{SimulatedConnector, SimulatedUpstream};

    const CHANNEL: i64 = -1_000_321;

    async fn test_worker(world: &Arc<SimulatedUpstream>) -> Worker {
        let connector = SimulatedConnector::new(Arc::clone(world));
        let api = connector
            .open_session(&BotCredential::new("101:test"))
            .await
            .unwrap();
        Worker::new(101, api)
    }

    #[tokio::test]
    async fn test_store_persist_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.json");

        let resolver = AccessResolver::load(&path);
        resolver.store(101, CHANNEL, 777).await;
        resolver.store(202, CHANNEL, 888).await;

        let reloaded = AccessResolver::load(&path);
        assert_eq!(reloaded.cached(101, CHANNEL).await, Some(777));
        assert_eq!(reloaded.cached(202, CHANNEL).await, Some(888));
        assert_eq!(reloaded.cached(303, CHANNEL).await, None);
    }

    #[tokio::test]
    async fn test_zero_handles_are_never_stored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.json");

        let resolver = AccessResolver::load(&path);
        resolver.store(101, CHANNEL, 777).await;
        resolver.store(101, CHANNEL, 0).await;

        assert_eq!(resolver.cached(101, CHANNEL).await, Some(777));
        let reloaded = AccessResolver::load(&path);
        assert_eq!(reloaded.cached(101, CHANNEL).await, Some(777));
    }

    #[tokio::test]
    async fn test_malformed_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.json");
        fs::write(&path, b"not json at all").unwrap();

        let resolver = AccessResolver::load(&path);
        assert_eq!(resolver.cached(101, CHANNEL).await, None);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.json");
        fs::write(
            &path,
            br#"{"101": {"-1000321": 777, "bogus": 888}, "not-a-worker": {"-1000321": 999}}"#,
        )
        .unwrap();

        let resolver = AccessResolver::load(&path);
        assert_eq!(resolver.cached(101, CHANNEL).await, Some(777));
        // Only the one well-formed entry survives the load.
        let map = resolver.map.read().await;
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&101).map(HashMap::len), Some(1));
    }

    #[tokio::test]
    async fn test_ensure_resolves_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("access.json");
        let world = SimulatedUpstream::builder(CHANNEL).access_hash(4242).build();
        let worker = test_worker(&world).await;

        let resolver = AccessResolver::load(&path);
        let handle = resolver.ensure(&worker, CHANNEL).await.unwrap();
        assert_eq!(handle, 4242);

        // Second call is served from the map.
        assert_eq!(resolver.ensure(&worker, CHANNEL).await.unwrap(), 4242);

        // And the handle survives a restart.
        let reloaded = AccessResolver::load(&path);
        assert_eq!(reloaded.cached(101, CHANNEL).await, Some(4242));
    }

    #[tokio::test]
    async fn test_ensure_unknown_channel_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let world = SimulatedUpstream::builder(CHANNEL).build();
        let worker = test_worker(&world).await;

        let resolver = AccessResolver::load(dir.path().join("access.json"));
        let result = resolver.ensure(&worker, CHANNEL + 5).await;
        assert!(matches!(result, Err(AccessError::Unavailable { .. })));
    }
}

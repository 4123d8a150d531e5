//! Bounded, TTL-evicting store of synthesized audio.
//!
//! Every reply spoken on a call is kept here under an ephemeral id so it can
//! be fetched again over HTTP (`GET /api/v1/audio/{id}`) until it expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Serialize;
use uuid::Uuid;

/// One synthesized reply.
#[derive(Debug, Clone)]
pub struct CachedAudio {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub call_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioCacheStats {
    pub entry_count: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone)]
pub struct AudioCache {
    cache: Cache<String, Arc<CachedAudio>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl AudioCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Store audio and return the id it can be fetched by.
    pub async fn insert(&self, call_id: &str, bytes: Vec<u8>, content_type: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let entry = CachedAudio {
            bytes,
            content_type: content_type.to_string(),
            call_id: call_id.to_string(),
            created_at: Utc::now(),
        };
        self.cache.insert(id.clone(), Arc::new(entry)).await;
        id
    }

    pub async fn get(&self, id: &str) -> Option<Arc<CachedAudio>> {
        let result = self.cache.get(id).await;
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Approximate until pending maintenance has run.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn stats(&self) -> AudioCacheStats {
        AudioCacheStats {
            entry_count: self.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

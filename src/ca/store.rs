//! Per-host leaf certificate store.
//!
//! Maps a bare host (port stripped) to a rustls [`CertifiedKey`] signed by
//! the root. Entries are minted on first demand and are immutable once
//! stored. Two properties beyond a plain map:
//!
//! - **Single-flight issuance.** Concurrent cold misses for the same host
//!   collapse to one key generation; waiters block briefly and share the
//!   result.
//! - **Bounded size.** The cache is capped (LRU order, 4096 hosts) instead
//!   of growing for the process lifetime. An evicted host is simply minted
//!   again on its next tunnel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::sign::CertifiedKey;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, trace};

use super::CertAuthority;
use crate::error::CaError;

/// Maximum number of cached leaf certificates.
const LEAF_CACHE_CAPACITY: usize = 4096;

type Slot = Arc<OnceLock<Result<Arc<CertifiedKey>, Arc<CaError>>>>;

struct CacheState {
    entries: HashMap<String, Arc<CertifiedKey>>,
    lru: VecDeque<String>,
}

/// Leaf certificate cache backed by a [`CertAuthority`].
pub struct CertStore {
    ca: CertAuthority,
    cache: Mutex<CacheState>,
    inflight: Mutex<HashMap<String, Slot>>,
}

impl CertStore {
    /// Creates an empty store signing with the given root.
    pub fn new(ca: CertAuthority) -> Self {
        Self {
            ca,
            cache: Mutex::new(CacheState {
                entries: HashMap::new(),
                lru: VecDeque::new(),
            }),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// The root authority backing this store.
    pub fn authority(&self) -> &CertAuthority {
        &self.ca
    }

    /// Returns the certified key for `host`, minting it on a cold miss.
    ///
    /// `host` must already have its port stripped. A cold miss generates a
    /// key pair and signs a leaf, which can block the calling thread for a
    /// moment; warm hits are a map lookup.
    pub fn get(&self, host: &str) -> Result<Arc<CertifiedKey>, CaError> {
        let host = normalize_host(host);

        {
            let mut state = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(key) = state.entries.get(&host).cloned() {
                trace!(host = %host, "leaf cache hit");
                touch_lru(&mut state.lru, &host);
                return Ok(key);
            }
        }

        // Cold miss: take (or join) the in-flight slot for this host.
        let slot: Slot = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.entry(host.clone()).or_default().clone()
        };

        let result = slot
            .get_or_init(|| {
                debug!(host = %host, "minting leaf certificate");
                self.mint(&host).map(Arc::new).map_err(Arc::new)
            })
            .clone();

        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight.remove(&host);
        }

        match result {
            Ok(key) => {
                let mut state = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                let key = if let Some(existing) = state.entries.get(&host).cloned() {
                    existing
                } else {
                    if state.entries.len() >= LEAF_CACHE_CAPACITY {
                        evict_lru(&mut state);
                    }
                    state.entries.insert(host.clone(), key.clone());
                    key
                };
                touch_lru(&mut state.lru, &host);
                Ok(key)
            }
            Err(err) => Err(CaError::Signing(err.to_string())),
        }
    }

    fn mint(&self, host: &str) -> Result<CertifiedKey, CaError> {
        let leaf = self.ca.issue_leaf(host)?;
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf.key_der));
        let signing_key =
            any_supported_type(&key_der).map_err(|e| CaError::Signing(e.to_string()))?;
        Ok(CertifiedKey::new(leaf.chain, signing_key))
    }

    /// Number of cached leaves.
    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}

fn normalize_host(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        host.to_string()
    } else {
        host.to_ascii_lowercase()
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = lru.iter().position(|entry| entry == key) {
        lru.remove(pos);
    }
    lru.push_back(key.to_string());
}

fn evict_lru(state: &mut CacheState) {
    if let Some(oldest) = state.lru.pop_front() {
        debug!(host = %oldest, "evicting leaf certificate");
        state.entries.remove(&oldest);
    }
}

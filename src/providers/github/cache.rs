use std::sync::Mutex;

use indexmap::IndexMap;
use log::debug;

/// Cached response body for a single request URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    /// `ETag` returned with the body, sent back as `If-None-Match`
    pub etag: String,
    /// Raw response body
    pub body: String,
    /// Next page advertised by the response's `Link` header
    pub next_page: Option<u32>,
}

/// Conditional-request cache for GitHub API responses.
///
/// GitHub answers a request carrying a matching `If-None-Match` with
/// `304 Not Modified`, which does not count against the rate limit. The cache
/// keeps the last body per URL so such a response can be replayed.
///
/// Total body size is bounded by `capacity_bytes`; the least recently used
/// entries are evicted first. A capacity of zero disables caching.
pub struct ResponseCache {
    capacity_bytes: usize,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: IndexMap<String, CachedResponse>,
    size_bytes: usize,
}

impl ResponseCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.capacity_bytes > 0
    }

    /// Looks up a cached response and marks it as most recently used.
    pub fn get(&self, url: &str) -> Option<CachedResponse> {
        if !self.enabled() {
            return None;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entries.shift_remove(url)?;
        state.entries.insert(url.to_string(), entry.clone());
        debug!("Response cache hit for {url}");
        Some(entry)
    }

    /// Stores a response, evicting least recently used entries to stay within capacity.
    pub fn insert(&self, url: &str, response: CachedResponse) {
        let size = response.body.len();
        if !self.enabled() || size > self.capacity_bytes {
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = state.entries.shift_remove(url) {
            state.size_bytes -= previous.body.len();
        }

        while state.size_bytes + size > self.capacity_bytes {
            let Some((evicted_url, evicted)) = state.entries.shift_remove_index(0) else {
                break;
            };
            state.size_bytes -= evicted.body.len();
            debug!("Evicted {evicted_url} from response cache");
        }

        state.size_bytes += size;
        state.entries.insert(url.to_string(), response);
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn size_bytes(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .size_bytes
    }
}

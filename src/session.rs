use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

pub const SESSION_COOKIE: &str = "detect_session";
/// Sessions untouched for this long are dropped.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(60 * 60);
pub const MAX_SESSIONS: usize = 10_000;

struct SessionEntry {
    media: Option<PathBuf>,
    last_seen: Instant,
}

/// Per-browser record of the last uploaded media path.
///
/// Bounded: idle sessions expire after `idle_ttl`, and when the map is full
/// the least recently seen session is evicted to make room.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_limits(SESSION_IDLE_TTL, MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            idle_ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Registers a fresh session id with no media.
    pub fn create(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut sessions = self.lock();

        let before = sessions.len();
        sessions.retain(|_, entry| now.duration_since(entry.last_seen) < self.idle_ttl);
        let expired = before - sessions.len();
        if expired > 0 {
            debug!(expired, "Idle sessions dropped");
        }

        while sessions.len() >= self.max_sessions {
            let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            sessions.remove(&oldest);
            debug!(session = %oldest, "Session evicted");
        }

        sessions.insert(
            id.clone(),
            SessionEntry {
                media: None,
                last_seen: now,
            },
        );
        debug!(session = %id, "Session created");
        id
    }

    /// True for live sessions; refreshes their idle timer.
    pub fn contains(&self, id: &str) -> bool {
        self.touch(id).is_some()
    }

    pub fn media_path(&self, id: &str) -> Option<PathBuf> {
        self.touch(id).flatten()
    }

    pub fn set_media_path(&self, id: &str, path: &Path) {
        self.lock().insert(
            id.to_string(),
            SessionEntry {
                media: Some(path.to_path_buf()),
                last_seen: Instant::now(),
            },
        );
        debug!(session = %id, path = %path.display(), "Session media set");
    }

    /// Forgets the media of a session; the id stays valid.
    pub fn clear(&self, id: &str) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.media = None;
            entry.last_seen = Instant::now();
            debug!(session = %id, "Session cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Media of a live session, or `None` for unknown and expired ids.
    fn touch(&self, id: &str) -> Option<Option<PathBuf>> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let entry = sessions.get_mut(id)?;
        if now.duration_since(entry.last_seen) >= self.idle_ttl {
            sessions.remove(id);
            return None;
        }
        entry.last_seen = now;
        Some(entry.media.clone())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        // A poisoned map is still a valid map.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Session id from the request's `Cookie` headers, if present.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, id)| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

/// `Set-Cookie` value for a session id.
pub fn session_cookie(id: &str) -> String {
    format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn media_path_lifecycle() {
        let store = SessionStore::new();
        let id = store.create();
        assert!(store.contains(&id));
        assert_eq!(store.media_path(&id), None);

        store.set_media_path(&id, Path::new("/tmp/uploads/board.png"));
        assert_eq!(
            store.media_path(&id),
            Some(PathBuf::from("/tmp/uploads/board.png"))
        );

        store.clear(&id);
        assert_eq!(store.media_path(&id), None);
        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn map_stays_bounded_under_churn() {
        let store = SessionStore::with_limits(SESSION_IDLE_TTL, 8);
        let first = store.create();
        for _ in 0..100 {
            store.create();
        }
        assert_eq!(store.len(), 8);
        assert!(!store.contains(&first));
    }

    #[test]
    fn recently_used_sessions_survive_eviction() {
        let store = SessionStore::with_limits(SESSION_IDLE_TTL, 2);
        let kept = store.create();
        let _other = store.create();
        std::thread::sleep(Duration::from_millis(2));
        assert!(store.contains(&kept));
        store.create();
        assert!(store.contains(&kept));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn idle_sessions_expire() {
        let store = SessionStore::with_limits(Duration::from_millis(20), 100);
        let stale = store.create();
        store.set_media_path(&stale, Path::new("/tmp/uploads/board.png"));
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(store.media_path(&stale), None);
        assert!(!store.contains(&stale));

        let idle = store.create();
        std::thread::sleep(Duration::from_millis(40));
        store.create();
        assert!(!store.contains(&idle));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_sessions_have_no_media() {
        let store = SessionStore::new();
        store.clear("missing");
        assert_eq!(store.media_path("missing"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn reads_session_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            COOKIE,
            HeaderValue::from_static("a=1; detect_session=abc-123 ; b=2"),
        );
        assert_eq!(session_id(&headers), Some("abc-123".to_string()));

        let mut empty = HeaderMap::new();
        empty.insert(COOKIE, HeaderValue::from_static("detect_session="));
        assert_eq!(session_id(&empty), None);
        assert_eq!(session_id(&HeaderMap::new()), None);
    }

    #[test]
    fn cookie_attributes() {
        let cookie = session_cookie("xyz");
        assert!(cookie.starts_with("detect_session=xyz;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("SameSite=Lax"));
    }
}

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use cookie::{Cookie, CookieJar, Key, SameSite};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "pvmss_session";
pub const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
pub const SESSION_IDLE: Duration = Duration::from_secs(30 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Everything a session carries. The upstream credential pair is captured
/// at user login and consumed by the console path; the flash map holds
/// one-shot form errors and re-population values.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub authenticated: bool,
    pub is_admin: bool,
    pub username: Option<String>,
    pub pve_auth_cookie: Option<String>,
    pub csrf_prevention_token: Option<String>,
    pub csrf_token: Option<String>,
    pub csrf_issued_at: Option<Instant>,
    pub flash: HashMap<String, String>,
}

impl SessionData {
    /// Drains the flash map; values are meant to survive exactly one
    /// render.
    pub fn take_flash(&mut self) -> HashMap<String, String> {
        std::mem::take(&mut self.flash)
    }
}

struct Entry {
    data: SessionData,
    created: Instant,
    last_seen: Instant,
}

impl Entry {
    fn expired(&self, lifetime: Duration, idle: Duration) -> bool {
        self.created.elapsed() >= lifetime || self.last_seen.elapsed() >= idle
    }
}

/// In-memory session map keyed by an opaque token. The browser only ever
/// sees the token wrapped in a signed cookie; a cookie whose signature does
/// not verify is treated as absent.
pub struct SessionStore {
    key: Key,
    sessions: RwLock<HashMap<String, Entry>>,
    lifetime: Duration,
    idle: Duration,
}

impl SessionStore {
    /// `secret` must be at least 32 bytes; the signing key is derived from
    /// it.
    pub fn new(secret: &[u8]) -> Self {
        Self::with_lifetimes(secret, SESSION_LIFETIME, SESSION_IDLE)
    }

    pub fn with_lifetimes(secret: &[u8], lifetime: Duration, idle: Duration) -> Self {
        Self {
            key: Key::derive_from(secret),
            sessions: RwLock::new(HashMap::new()),
            lifetime,
            idle,
        }
    }

    /// Creates a fresh, anonymous session and returns its token.
    pub fn create(&self) -> String {
        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.sessions.write().expect("session lock poisoned").insert(
            token.clone(),
            Entry {
                data: SessionData::default(),
                created: now,
                last_seen: now,
            },
        );
        token
    }

    /// Looks up a live session and touches its idle clock. Expired entries
    /// are dropped on contact.
    pub fn get(&self, token: &str) -> Option<SessionData> {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        match sessions.get_mut(token) {
            Some(entry) if !entry.expired(self.lifetime, self.idle) => {
                entry.last_seen = Instant::now();
                Some(entry.data.clone())
            }
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    /// Replaces the stored data for `token`. A vanished (expired) session
    /// is ignored; the caller's next request starts anonymous.
    pub fn set(&self, token: &str, data: SessionData) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        if let Some(entry) = sessions.get_mut(token) {
            entry.data = data;
            entry.last_seen = Instant::now();
        }
    }

    /// Issues a new token carrying `data` and destroys the old session.
    /// Used on login and logout so a pre-auth token never lives on across
    /// a privilege change.
    pub fn rotate(&self, old_token: &str, data: SessionData) -> String {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.remove(old_token);
        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        sessions.insert(
            token.clone(),
            Entry {
                data,
                created: now,
                last_seen: now,
            },
        );
        token
    }

    pub fn destroy(&self, token: &str) {
        self.sessions
            .write()
            .expect("session lock poisoned")
            .remove(token);
    }

    /// Wraps `token` in the signed session cookie.
    pub fn cookie_for(&self, token: &str, secure: bool) -> Cookie<'static> {
        let mut jar = CookieJar::new();
        jar.signed_mut(&self.key)
            .add(Cookie::new(SESSION_COOKIE, token.to_string()));
        let signed_value = jar
            .get(SESSION_COOKIE)
            .expect("freshly added cookie")
            .value()
            .to_string();

        let mut cookie = Cookie::new(SESSION_COOKIE, signed_value);
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_secure(secure);
        cookie.set_max_age(cookie::time::Duration::seconds(self.lifetime.as_secs() as i64));
        cookie
    }

    /// Extracts and verifies the session token from a raw `Cookie` header.
    /// Returns None for a missing cookie or a bad signature.
    pub fn token_from_cookie_header(&self, header: &str) -> Option<String> {
        let raw = Cookie::split_parse(header.to_string())
            .filter_map(Result::ok)
            .find(|c| c.name() == SESSION_COOKIE)?;
        let mut jar = CookieJar::new();
        jar.add_original(raw.into_owned());
        let verified = jar.signed(&self.key).get(SESSION_COOKIE)?;
        Some(verified.value().to_string())
    }

    /// Drops every expired entry. Called by the background sweeper.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.expired(self.lifetime, self.idle));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically reaps expired sessions until `shutdown` flips.
pub fn spawn_session_sweeper(
    store: std::sync::Arc<SessionStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.sweep();
                    if reaped > 0 {
                        debug!(reaped, "swept expired sessions");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

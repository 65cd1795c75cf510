//! In-process session store (§11, supplemented from `elements/http/session.py`).
//! Only the in-memory backend and cookie-issuing front-end are in scope;
//! pluggable backends remain an out-of-scope external collaborator.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::http::response::{HttpResponse, SetCookie};

#[derive(Debug, Clone)]
pub struct Session {
    pub data: HashMap<String, String>,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Session {
    fn new(ttl_secs: u64) -> Self {
        let now = current_timestamp();
        Session { data: HashMap::new(), created_at: now, expires_at: now + ttl_secs }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Keyed by the value of the configured `session_cookie` (§6). Cleanup is
/// driven by the reactor's loop-hook cadence (§4.3 step 3), not a background
/// thread — this crate is single-threaded per worker.
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ttl_secs: u64,
}

impl SessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        SessionStore { sessions: HashMap::new(), ttl_secs }
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id).filter(|s| !s.is_expired(current_timestamp()))
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        let now = current_timestamp();
        match self.sessions.get(session_id) {
            Some(s) if !s.is_expired(now) => self.sessions.get_mut(session_id),
            _ => None,
        }
    }

    pub fn cleanup(&mut self) {
        let now = current_timestamp();
        self.sessions.retain(|_, s| !s.is_expired(now));
    }

    /// §4.6.1/§11: looks up `cookie_name` in the request's parsed cookies;
    /// if absent or expired, mints a new session and attaches `Set-Cookie`
    /// to `response`. Returns the effective session id either way.
    pub fn ensure_session(
        &mut self,
        cookie_name: &str,
        cookies: &HashMap<String, String>,
        response: &mut HttpResponse,
    ) -> String {
        if let Some(id) = cookies.get(cookie_name) {
            if self.get(id).is_some() {
                return id.clone();
            }
        }

        let id = generate_session_id();
        self.sessions.insert(id.clone(), Session::new(self.ttl_secs));
        response.set_cookie(SetCookie {
            name: cookie_name.to_string(),
            value: id.clone(),
            expires: Some(self.ttl_secs as i64),
            path: "/".to_string(),
            domain: None,
            http_only: true,
            secure: false,
        });
        id
    }
}

fn generate_session_id() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(32).map(char::from).collect()
}

fn current_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

use std::collections::{HashMap, HashSet};

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::tprintln;

use super::principal::Principal;

/// Opaque bearer credential for the token-issuing HTTP surface.
pub type SessionToken = String;

/// Issued sessions live this long; matches the directory session marker.
pub const SESSION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub token: SessionToken,
    pub principal: Principal,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub(crate) fn gen_id() -> String {
    // 256-bit random token base64url without padding
    let mut buf = [0u8; 32];
    let _ = getrandom::getrandom(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// Issues and validates opaque session tokens.
///
/// Expiries use wall-clock time so a token printed into a client survives a
/// server restart window semantically (the in-memory table itself does not;
/// the directory session marker is the durable record).
pub struct SessionManager {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
    user_index: RwLock<HashMap<String, HashSet<String>>>,
    revoked: RwLock<HashSet<String>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::with_ttl(Duration::days(SESSION_TTL_DAYS))
    }
}

impl SessionManager {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
            user_index: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    pub fn issue(&self, principal: Principal) -> Session {
        let now = Utc::now();
        let sid = gen_id();
        let token = gen_id();
        let sess = Session {
            session_id: sid.clone(),
            token: token.clone(),
            principal: principal.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        {
            let mut m = self.sessions.write();
            m.insert(token.clone(), sess.clone());
        }
        {
            let mut uidx = self.user_index.write();
            let set = uidx.entry(principal.id.clone()).or_insert_with(HashSet::new);
            set.insert(token.clone());
        }
        tprintln!("session.issue user={} sid={} ttl_secs={}", principal.identifier(), sid, self.ttl.num_seconds());
        sess
    }

    pub fn validate(&self, token: &str) -> Option<Principal> {
        // prune revoked
        if self.revoked.read().contains(token) {
            return None;
        }
        let now = Utc::now();
        let mut drop_key: Option<String> = None;
        let out = {
            let map = self.sessions.read();
            if let Some(sess) = map.get(token) {
                if sess.expires_at > now {
                    Some(sess.principal.clone())
                } else {
                    drop_key = Some(token.to_string());
                    None
                }
            } else {
                None
            }
        };
        if let Some(k) = drop_key {
            self.sessions.write().remove(&k);
        }
        out
    }

    pub fn logout(&self, token: &str) -> bool {
        let mut removed = false;
        if let Some(sess) = self.sessions.write().remove(token) {
            removed = true;
            let uid = sess.principal.id;
            let mut idx = self.user_index.write();
            if let Some(set) = idx.get_mut(&uid) {
                set.remove(token);
            }
            self.revoked.write().insert(token.to_string());
        }
        removed
    }

    /// Revoke every outstanding session for a user. Returns how many were dropped.
    pub fn revoke_user(&self, user_id: &str) -> usize {
        let mut count = 0usize;
        if let Some(tokens) = self.user_index.read().get(user_id).cloned() {
            let mut s = self.sessions.write();
            let mut r = self.revoked.write();
            for t in tokens.iter() {
                if s.remove(t).is_some() {
                    count += 1;
                }
                r.insert(t.clone());
            }
        }
        tprintln!("session.revoke user={} count={}", user_id, count);
        count
    }
}

//! Username/password/PIN directory backed by the key/value repository.
//!
//! This is the fallback login path that does not involve the hosted identity
//! provider. Users live in a single `all_users` document keyed by username;
//! a successful register or login writes a 7-day session marker that
//! `current_user` checks on every load. Passwords and PINs are stored as
//! Argon2 PHC strings, never in the clear.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use password_hash::{PasswordHash, SaltString};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::repository::{self, keys, SharedRepository};

use super::principal::{Principal, Role};
use super::session::SESSION_TTL_DAYS;

/// Fixed credentials for the maintenance bypass account. Resolves to an admin
/// principal without a row in the user table.
pub const BYPASS_USERNAME: &str = "walkaway";
const BYPASS_PASSWORD: &str = "Dn249118++";

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{3,32}$").unwrap());
static PIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").unwrap());

const MIN_PASSWORD_LEN: usize = 6;

fn hash_secret(secret: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(secret.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

fn verify_secret(hash: &str, secret: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(secret.as_bytes(), &parsed).is_ok()
    } else {
        false
    }
}

/// One row in the `all_users` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub pin_hash: String,
    pub role: Role,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    fn to_principal(&self) -> Principal {
        Principal {
            id: self.id.clone(),
            email: None,
            username: Some(self.username.clone()),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role: Some(self.role),
            company_name: None,
            is_verified: true,
            created_at: self.created_at,
        }
    }
}

/// The durable "who is logged in" marker consulted on every app load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMarker {
    user_id: String,
    username: String,
    role: Role,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub password: String,
    pub pin: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
}

/// Directory of local accounts plus the current-session marker.
#[derive(Clone)]
pub struct LocalDirectory {
    repo: SharedRepository,
}

impl LocalDirectory {
    pub fn new(repo: SharedRepository) -> Self {
        Self { repo }
    }

    fn load_users(&self) -> AppResult<HashMap<String, UserRecord>> {
        repository::get_doc(self.repo.as_ref(), keys::ALL_USERS)
            .map(|opt| opt.unwrap_or_default())
            .map_err(|e| AppError::internal("user_table", e.to_string()))
    }

    fn save_users(&self, users: &HashMap<String, UserRecord>) -> AppResult<()> {
        repository::put_doc(self.repo.as_ref(), keys::ALL_USERS, users)
            .map_err(|e| AppError::internal("user_table", e.to_string()))
    }

    fn write_marker(&self, p: &Principal) -> AppResult<()> {
        let marker = SessionMarker {
            user_id: p.id.clone(),
            username: p.username.clone().unwrap_or_default(),
            role: p.role.unwrap_or(Role::Client),
            expires_at: Utc::now() + Duration::days(SESSION_TTL_DAYS),
        };
        repository::put_doc(self.repo.as_ref(), keys::AUTH_SESSION, &marker)
            .map_err(|e| AppError::internal("session_marker", e.to_string()))
    }

    /// Create a local account. The username must be unused; the password and
    /// PIN must satisfy the format rules. Writes the row and a fresh session
    /// marker, so registration doubles as login.
    pub fn register(&self, reg: &Registration) -> AppResult<Principal> {
        validate_username(&reg.username)?;
        validate_password(&reg.password)?;
        validate_pin(&reg.pin)?;
        let mut users = self.load_users()?;
        if users.contains_key(&reg.username) || reg.username == BYPASS_USERNAME {
            return Err(AppError::conflict("username_taken", "username already registered"));
        }
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: reg.username.clone(),
            password_hash: hash_secret(&reg.password)?,
            pin_hash: hash_secret(&reg.pin)?,
            role: reg.role,
            first_name: reg.first_name.clone(),
            last_name: reg.last_name.clone(),
            created_at: Utc::now(),
        };
        let principal = record.to_principal();
        users.insert(record.username.clone(), record);
        self.save_users(&users)?;
        self.write_marker(&principal)?;
        info!(target: "marketgate::directory", "register user={} role={}", reg.username, reg.role);
        Ok(principal)
    }

    /// Password login. The bypass pair is checked before the user table.
    pub fn login(&self, username: &str, password: &str) -> AppResult<Principal> {
        if username == BYPASS_USERNAME {
            if password != BYPASS_PASSWORD {
                return Err(AppError::auth("invalid_credentials", "invalid username or password"));
            }
            let principal = bypass_principal();
            repository::put_doc(self.repo.as_ref(), keys::DUMMY_USER, &principal)
                .map_err(|e| AppError::internal("dummy_user", e.to_string()))?;
            self.write_marker(&principal)?;
            warn!(target: "marketgate::directory", "bypass login used");
            return Ok(principal);
        }
        let users = self.load_users()?;
        let Some(record) = users.get(username) else {
            return Err(AppError::auth("invalid_credentials", "invalid username or password"));
        };
        if !verify_secret(&record.password_hash, password) {
            return Err(AppError::auth("invalid_credentials", "invalid username or password"));
        }
        let principal = record.to_principal();
        self.write_marker(&principal)?;
        info!(target: "marketgate::directory", "login user={}", username);
        Ok(principal)
    }

    /// Look up a registered account by username. No session side effects.
    pub fn lookup(&self, username: &str) -> AppResult<Option<Principal>> {
        let users = self.load_users()?;
        Ok(users.get(username).map(|r| r.to_principal()))
    }

    /// Secondary-factor check used by the password reset flow.
    pub fn verify_pin(&self, username: &str, pin: &str) -> AppResult<()> {
        validate_pin(pin)?;
        let users = self.load_users()?;
        let Some(record) = users.get(username) else {
            return Err(AppError::not_found("unknown_user", "no such user"));
        };
        if !verify_secret(&record.pin_hash, pin) {
            return Err(AppError::pin("invalid_pin", "PIN does not match"));
        }
        Ok(())
    }

    /// Replace a password after a PIN check. All format validation happens
    /// before the store is touched.
    pub fn reset_password(&self, username: &str, pin: &str, new_password: &str) -> AppResult<()> {
        validate_pin(pin)?;
        validate_password(new_password)?;
        let mut users = self.load_users()?;
        let Some(record) = users.get_mut(username) else {
            return Err(AppError::not_found("unknown_user", "no such user"));
        };
        if !verify_secret(&record.pin_hash, pin) {
            return Err(AppError::pin("invalid_pin", "PIN does not match"));
        }
        record.password_hash = hash_secret(new_password)?;
        self.save_users(&users)?;
        info!(target: "marketgate::directory", "reset_password user={}", username);
        Ok(())
    }

    /// Return the marked principal if the session marker is still live.
    /// An expired marker is removed (implicit logout).
    pub fn current_user(&self) -> AppResult<Option<Principal>> {
        let marker: Option<SessionMarker> = repository::get_doc(self.repo.as_ref(), keys::AUTH_SESSION)
            .map_err(|e| AppError::internal("session_marker", e.to_string()))?;
        let Some(marker) = marker else { return Ok(None) };
        if marker.expires_at <= Utc::now() {
            self.logout()?;
            return Ok(None);
        }
        if marker.username == BYPASS_USERNAME {
            let dummy: Option<Principal> = repository::get_doc(self.repo.as_ref(), keys::DUMMY_USER)
                .map_err(|e| AppError::internal("dummy_user", e.to_string()))?;
            return Ok(dummy.or_else(|| Some(bypass_principal())));
        }
        let users = self.load_users()?;
        Ok(users.get(&marker.username).map(|r| r.to_principal()))
    }

    /// Drop the session marker and any bypass principal.
    pub fn logout(&self) -> AppResult<()> {
        self.repo
            .delete(keys::AUTH_SESSION)
            .and_then(|_| self.repo.delete(keys::DUMMY_USER))
            .map_err(|e| AppError::internal("session_marker", e.to_string()))?;
        Ok(())
    }
}

fn bypass_principal() -> Principal {
    Principal {
        id: format!("bypass-{}", BYPASS_USERNAME),
        email: None,
        username: Some(BYPASS_USERNAME.to_string()),
        first_name: "Site".to_string(),
        last_name: "Admin".to_string(),
        role: Some(Role::Admin),
        company_name: None,
        is_verified: true,
        created_at: Utc::now(),
    }
}

fn validate_username(username: &str) -> AppResult<()> {
    if !USERNAME_RE.is_match(username) {
        return Err(AppError::user(
            "invalid_username",
            "username must be 3-32 characters of letters, digits or underscore",
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> AppResult<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::user("invalid_password", "password must be at least 6 characters"));
    }
    Ok(())
}

fn validate_pin(pin: &str) -> AppResult<()> {
    if !PIN_RE.is_match(pin) {
        return Err(AppError::user("invalid_pin_format", "PIN must be exactly 4 digits"));
    }
    Ok(())
}

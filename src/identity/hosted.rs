//! Adapter over the hosted identity provider.
//!
//! The provider is an external collaborator; this module only wraps its
//! client surface (sign-up, password and OAuth sign-in, session reads,
//! metadata updates, sign-out) and normalizes its failures into `AppError`.
//! The backend is a tagged variant: `Http` speaks the provider's REST API
//! via reqwest, `Memory` is a self-contained double used by tests and by
//! offline development, where "the provider" is a map in this process.
//!
//! OAuth is a browser round-trip: `sign_in_with_oauth` only returns the
//! authorize URL. When the provider redirects back it appends the access
//! token as a URL fragment; `session_from_fragment` turns that fragment back
//! into a session.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{AppError, AppResult};

use super::principal::{Principal, Role};
use super::session::gen_id;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

const MIN_PASSWORD_LEN: usize = 6;
/// Provider access tokens are short-lived; the durable state is server-side.
const ACCESS_TOKEN_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    Apple,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Apple => "apple",
        }
    }
}

/// Free-form profile fields the provider stores alongside an account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMetadata {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub company_name: Option<String>,
}

/// Partial metadata update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
}

impl MetadataPatch {
    pub fn role(role: Role) -> Self {
        Self { role: Some(role), ..Default::default() }
    }

    fn apply(&self, meta: &mut UserMetadata) {
        if let Some(v) = &self.first_name { meta.first_name = v.clone(); }
        if let Some(v) = &self.last_name { meta.last_name = v.clone(); }
        if let Some(v) = self.role { meta.role = Some(v); }
        if let Some(v) = &self.company_name { meta.company_name = Some(v.clone()); }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostedUser {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl HostedUser {
    pub fn to_principal(&self) -> Principal {
        Principal {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            username: None,
            first_name: self.user_metadata.first_name.clone(),
            last_name: self.user_metadata.last_name.clone(),
            role: self.user_metadata.role,
            company_name: self.user_metadata.company_name.clone(),
            is_verified: self.email_confirmed_at.is_some(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostedSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user: HostedUser,
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub metadata: UserMetadata,
}

// ---- wire shapes for the HTTP backend ----

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    email: String,
    #[serde(default)]
    user_metadata: UserMetadata,
    #[serde(default)]
    email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl WireUser {
    fn into_user(self) -> HostedUser {
        HostedUser {
            id: self.id,
            email: self.email,
            user_metadata: self.user_metadata,
            email_confirmed_at: self.email_confirmed_at,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: WireUser,
}

struct MemoryAccount {
    user: HostedUser,
    password: String,
}

/// In-process stand-in for the provider: accounts, live access tokens and
/// pending email-verification tokens.
#[derive(Default)]
struct MemoryBackend {
    accounts: RwLock<HashMap<String, MemoryAccount>>,
    tokens: RwLock<HashMap<String, String>>,
    verification: RwLock<HashMap<String, String>>,
}

enum Backend {
    Http { http: reqwest::Client, base_url: String, anon_key: String },
    Memory(MemoryBackend),
}

/// Client handle for the hosted identity provider.
pub struct HostedClient {
    backend: Backend,
    current: RwLock<Option<HostedSession>>,
}

impl HostedClient {
    /// Provider client over its REST API.
    pub fn http(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            backend: Backend::Http { http: reqwest::Client::new(), base_url, anon_key: anon_key.into() },
            current: RwLock::new(None),
        }
    }

    /// Self-contained in-process provider double.
    pub fn memory() -> Self {
        Self { backend: Backend::Memory(MemoryBackend::default()), current: RwLock::new(None) }
    }

    fn set_current(&self, sess: Option<HostedSession>) {
        *self.current.write() = sess;
    }

    /// Create an account carrying profile metadata (notably the role, when the
    /// caller already knows it). The account starts unverified.
    pub async fn sign_up(&self, req: &SignUpRequest) -> AppResult<HostedUser> {
        if !EMAIL_RE.is_match(&req.email) {
            return Err(AppError::user("invalid_credentials_format", "not a valid email address"));
        }
        if req.password.len() < MIN_PASSWORD_LEN {
            return Err(AppError::user("invalid_credentials_format", "password must be at least 6 characters"));
        }
        match &self.backend {
            Backend::Memory(mem) => {
                let mut accounts = mem.accounts.write();
                if accounts.contains_key(&req.email) {
                    return Err(AppError::conflict("duplicate_account", "an account with this email already exists"));
                }
                let user = HostedUser {
                    id: uuid::Uuid::new_v4().to_string(),
                    email: req.email.clone(),
                    user_metadata: req.metadata.clone(),
                    email_confirmed_at: None,
                    created_at: Utc::now(),
                };
                accounts.insert(req.email.clone(), MemoryAccount { user: user.clone(), password: req.password.clone() });
                mem.verification.write().insert(req.email.clone(), gen_id());
                info!(target: "marketgate::hosted", "sign_up email={}", req.email);
                Ok(user)
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .post(format!("{}/auth/v1/signup", base_url))
                    .header("apikey", anon_key)
                    .json(&serde_json::json!({
                        "email": req.email,
                        "password": req.password,
                        "data": req.metadata,
                    }))
                    .send()
                    .await
                    .map_err(|e| provider_err("sign_up", e))?;
                if resp.status() == reqwest::StatusCode::CONFLICT
                    || resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY
                {
                    return Err(AppError::conflict("duplicate_account", "an account with this email already exists"));
                }
                let resp = check_provider_status("sign_up", resp)?;
                let wire: WireUser = resp.json().await.map_err(|e| provider_err("sign_up", e))?;
                Ok(wire.into_user())
            }
        }
    }

    /// Email/password sign-in. On success the session becomes current.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> AppResult<HostedSession> {
        match &self.backend {
            Backend::Memory(mem) => {
                let session = {
                    let accounts = mem.accounts.read();
                    let Some(account) = accounts.get(email) else {
                        return Err(AppError::auth("invalid_credentials", "invalid email or password"));
                    };
                    if account.password != password {
                        return Err(AppError::auth("invalid_credentials", "invalid email or password"));
                    }
                    let token = gen_id();
                    mem.tokens.write().insert(token.clone(), email.to_string());
                    HostedSession {
                        access_token: token,
                        refresh_token: Some(gen_id()),
                        expires_at: Utc::now() + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
                        user: account.user.clone(),
                    }
                };
                self.set_current(Some(session.clone()));
                info!(target: "marketgate::hosted", "sign_in email={}", email);
                Ok(session)
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .post(format!("{}/auth/v1/token?grant_type=password", base_url))
                    .header("apikey", anon_key)
                    .json(&serde_json::json!({ "email": email, "password": password }))
                    .send()
                    .await
                    .map_err(|e| provider_err("sign_in", e))?;
                if resp.status() == reqwest::StatusCode::BAD_REQUEST
                    || resp.status() == reqwest::StatusCode::UNAUTHORIZED
                {
                    return Err(AppError::auth("invalid_credentials", "invalid email or password"));
                }
                let resp = check_provider_status("sign_in", resp)?;
                let wire: WireTokenResponse = resp.json().await.map_err(|e| provider_err("sign_in", e))?;
                let session = HostedSession {
                    access_token: wire.access_token,
                    refresh_token: wire.refresh_token,
                    expires_at: Utc::now()
                        + Duration::seconds(wire.expires_in.unwrap_or(ACCESS_TOKEN_TTL_MINUTES * 60)),
                    user: wire.user.into_user(),
                };
                self.set_current(Some(session.clone()));
                Ok(session)
            }
        }
    }

    /// Begin an OAuth sign-in. Returns the authorize URL the browser must
    /// visit; resolution happens out-of-band via `session_from_fragment`.
    pub fn sign_in_with_oauth(&self, provider: OAuthProvider, redirect_to: &str) -> String {
        let base = match &self.backend {
            Backend::Http { base_url, .. } => base_url.clone(),
            Backend::Memory(_) => "memory://provider".to_string(),
        };
        format!(
            "{}/auth/v1/authorize?provider={}&redirect_to={}",
            base,
            provider.as_str(),
            urlencoding::encode(redirect_to)
        )
    }

    /// Complete an OAuth round-trip on the memory backend: issues a live
    /// access token for the account as the real provider would after consent.
    /// The account is created on first OAuth sign-in, mirroring the provider.
    pub fn complete_oauth(&self, email: &str, metadata: UserMetadata) -> AppResult<HostedSession> {
        let Backend::Memory(mem) = &self.backend else {
            return Err(AppError::internal("oauth_callback", "only the memory backend can complete OAuth in-process"));
        };
        let mut accounts = mem.accounts.write();
        let account = accounts.entry(email.to_string()).or_insert_with(|| MemoryAccount {
            user: HostedUser {
                id: uuid::Uuid::new_v4().to_string(),
                email: email.to_string(),
                user_metadata: metadata,
                // OAuth identities arrive with a provider-verified email
                email_confirmed_at: Some(Utc::now()),
                created_at: Utc::now(),
            },
            password: gen_id(),
        });
        let token = gen_id();
        mem.tokens.write().insert(token.clone(), email.to_string());
        Ok(HostedSession {
            access_token: token,
            refresh_token: Some(gen_id()),
            expires_at: Utc::now() + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
            user: account.user.clone(),
        })
    }

    /// Recover a session from an OAuth callback URL fragment
    /// (`access_token=...&token_type=bearer...`). Returns `None` when the
    /// fragment carries no token. On success the session becomes current.
    pub async fn session_from_fragment(&self, fragment: &str) -> AppResult<Option<HostedSession>> {
        let Some(token) = parse_fragment_token(fragment) else { return Ok(None) };
        match &self.backend {
            Backend::Memory(mem) => {
                let email = { mem.tokens.read().get(&token).cloned() };
                let Some(email) = email else {
                    return Err(AppError::auth("invalid_token", "access token is not recognized"));
                };
                let user = {
                    let accounts = mem.accounts.read();
                    match accounts.get(&email) {
                        Some(a) => a.user.clone(),
                        None => return Err(AppError::not_found("unknown_user", "account no longer exists")),
                    }
                };
                let session = HostedSession {
                    access_token: token,
                    refresh_token: None,
                    expires_at: Utc::now() + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
                    user,
                };
                self.set_current(Some(session.clone()));
                Ok(Some(session))
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .get(format!("{}/auth/v1/user", base_url))
                    .header("apikey", anon_key)
                    .bearer_auth(&token)
                    .send()
                    .await
                    .map_err(|e| provider_err("oauth_callback", e))?;
                if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                    return Err(AppError::auth("invalid_token", "access token is not recognized"));
                }
                let resp = check_provider_status("oauth_callback", resp)?;
                let wire: WireUser = resp.json().await.map_err(|e| provider_err("oauth_callback", e))?;
                let session = HostedSession {
                    access_token: token,
                    refresh_token: None,
                    expires_at: Utc::now() + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
                    user: wire.into_user(),
                };
                self.set_current(Some(session.clone()));
                Ok(Some(session))
            }
        }
    }

    /// Current provider session, if any and unexpired. Side-effect-free.
    pub async fn get_session(&self) -> AppResult<Option<HostedSession>> {
        let current = self.current.read().clone();
        Ok(current.filter(|s| s.expires_at > Utc::now()))
    }

    /// Re-read the current user from the provider (metadata may have changed
    /// since sign-in). `None` when there is no live session.
    pub async fn get_user(&self) -> AppResult<Option<HostedUser>> {
        let Some(session) = self.get_session().await? else { return Ok(None) };
        match &self.backend {
            Backend::Memory(mem) => {
                let accounts = mem.accounts.read();
                Ok(accounts.get(&session.user.email).map(|a| a.user.clone()))
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .get(format!("{}/auth/v1/user", base_url))
                    .header("apikey", anon_key)
                    .bearer_auth(&session.access_token)
                    .send()
                    .await
                    .map_err(|e| provider_err("get_user", e))?;
                if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                    return Ok(None);
                }
                let resp = check_provider_status("get_user", resp)?;
                let wire: WireUser = resp.json().await.map_err(|e| provider_err("get_user", e))?;
                Ok(Some(wire.into_user()))
            }
        }
    }

    /// Merge profile fields (notably `role`) into the stored user record.
    pub async fn update_metadata(&self, user_id: &str, patch: &MetadataPatch) -> AppResult<HostedUser> {
        match &self.backend {
            Backend::Memory(mem) => {
                let updated = {
                    let mut accounts = mem.accounts.write();
                    let Some(account) = accounts.values_mut().find(|a| a.user.id == user_id) else {
                        return Err(AppError::not_found("unknown_user", "account no longer exists"));
                    };
                    patch.apply(&mut account.user.user_metadata);
                    account.user.clone()
                };
                // keep the embedded session copy in step
                let mut current = self.current.write();
                if let Some(sess) = current.as_mut() {
                    if sess.user.id == user_id {
                        sess.user = updated.clone();
                    }
                }
                info!(target: "marketgate::hosted", "update_metadata user={}", user_id);
                Ok(updated)
            }
            Backend::Http { http, base_url, anon_key } => {
                let Some(session) = self.get_session().await? else {
                    return Err(AppError::auth("no_session", "metadata updates require a live session"));
                };
                let resp = http
                    .put(format!("{}/auth/v1/user", base_url))
                    .header("apikey", anon_key)
                    .bearer_auth(&session.access_token)
                    .json(&serde_json::json!({ "data": patch }))
                    .send()
                    .await
                    .map_err(|e| provider_err("update_metadata", e))?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(AppError::not_found("unknown_user", "account no longer exists"));
                }
                let resp = check_provider_status("update_metadata", resp)?;
                let wire: WireUser = resp.json().await.map_err(|e| provider_err("update_metadata", e))?;
                let updated = wire.into_user();
                let mut current = self.current.write();
                if let Some(sess) = current.as_mut() {
                    if sess.user.id == user_id {
                        sess.user = updated.clone();
                    }
                }
                Ok(updated)
            }
        }
    }

    /// Invalidate the hosted session globally.
    pub async fn sign_out(&self) -> AppResult<()> {
        let current = self.current.write().take();
        let Some(session) = current else { return Ok(()) };
        match &self.backend {
            Backend::Memory(mem) => {
                // drop every token for this account, not just the current one
                let email = session.user.email;
                mem.tokens.write().retain(|_, e| *e != email);
                Ok(())
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .post(format!("{}/auth/v1/logout", base_url))
                    .header("apikey", anon_key)
                    .bearer_auth(&session.access_token)
                    .send()
                    .await
                    .map_err(|e| provider_err("sign_out", e))?;
                check_provider_status("sign_out", resp)?;
                Ok(())
            }
        }
    }

    /// Confirm an email address with the token from the verification mail.
    pub async fn verify_email(&self, email: &str, token: &str) -> AppResult<()> {
        match &self.backend {
            Backend::Memory(mem) => {
                let expected = { mem.verification.read().get(email).cloned() };
                match expected {
                    Some(t) if t == token => {
                        mem.verification.write().remove(email);
                        let mut accounts = mem.accounts.write();
                        let Some(account) = accounts.get_mut(email) else {
                            return Err(AppError::not_found("unknown_user", "account no longer exists"));
                        };
                        account.user.email_confirmed_at = Some(Utc::now());
                        Ok(())
                    }
                    _ => Err(AppError::auth("invalid_token", "verification token is not valid")),
                }
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .post(format!("{}/auth/v1/verify", base_url))
                    .header("apikey", anon_key)
                    .json(&serde_json::json!({ "type": "signup", "email": email, "token": token }))
                    .send()
                    .await
                    .map_err(|e| provider_err("verify_email", e))?;
                check_provider_status("verify_email", resp)?;
                Ok(())
            }
        }
    }

    /// Ask the provider to send a fresh verification mail.
    pub async fn resend_verification(&self, email: &str) -> AppResult<()> {
        match &self.backend {
            Backend::Memory(mem) => {
                if !mem.accounts.read().contains_key(email) {
                    return Err(AppError::not_found("unknown_user", "no account with this email"));
                }
                mem.verification.write().insert(email.to_string(), gen_id());
                Ok(())
            }
            Backend::Http { http, base_url, anon_key } => {
                let resp = http
                    .post(format!("{}/auth/v1/resend", base_url))
                    .header("apikey", anon_key)
                    .json(&serde_json::json!({ "type": "signup", "email": email }))
                    .send()
                    .await
                    .map_err(|e| provider_err("resend_verification", e))?;
                check_provider_status("resend_verification", resp)?;
                Ok(())
            }
        }
    }

    /// Remove an account outright (memory backend only). Mirrors the
    /// provider's admin delete; used to exercise gone-account paths.
    pub fn delete_account(&self, email: &str) -> AppResult<bool> {
        let Backend::Memory(mem) = &self.backend else {
            return Err(AppError::internal("delete_account", "account deletion goes through the provider console"));
        };
        Ok(mem.accounts.write().remove(email).is_some())
    }

    /// Pending verification token for an account (memory backend only);
    /// the stand-in for reading the verification mail.
    pub fn issued_verification_token(&self, email: &str) -> Option<String> {
        match &self.backend {
            Backend::Memory(mem) => mem.verification.read().get(email).cloned(),
            Backend::Http { .. } => None,
        }
    }
}

fn parse_fragment_token(fragment: &str) -> Option<String> {
    for pair in fragment.trim_start_matches('#').split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == "access_token" && !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

fn provider_err(op: &str, e: reqwest::Error) -> AppError {
    error!(target: "marketgate::hosted", "{} provider error: {}", op, e);
    AppError::provider("provider_error", format!("identity provider unreachable during {}", op))
}

fn check_provider_status(op: &str, resp: reqwest::Response) -> AppResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    error!(target: "marketgate::hosted", "{} provider status {}", op, status);
    Err(AppError::provider("provider_error", format!("identity provider returned {} during {}", status, op)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(email: &str) -> SignUpRequest {
        SignUpRequest {
            email: email.to_string(),
            password: "secret1".to_string(),
            metadata: UserMetadata {
                first_name: "Pat".into(),
                last_name: "Lee".into(),
                role: Some(Role::Client),
                company_name: None,
            },
        }
    }

    #[tokio::test]
    async fn sign_up_then_password_sign_in() {
        let client = HostedClient::memory();
        let user = client.sign_up(&request("pat@example.com")).await.unwrap();
        assert_eq!(user.email, "pat@example.com");
        assert!(user.email_confirmed_at.is_none());
        let sess = client.sign_in_with_password("pat@example.com", "secret1").await.unwrap();
        assert_eq!(sess.user.id, user.id);
        let current = client.get_session().await.unwrap().expect("session is current");
        assert_eq!(current.access_token, sess.access_token);
    }

    #[tokio::test]
    async fn duplicate_sign_up_conflicts() {
        let client = HostedClient::memory();
        client.sign_up(&request("pat@example.com")).await.unwrap();
        let err = client.sign_up(&request("pat@example.com")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn sign_up_format_rules() {
        let client = HostedClient::memory();
        let mut bad_email = request("not-an-email");
        bad_email.email = "not-an-email".into();
        assert!(matches!(client.sign_up(&bad_email).await.unwrap_err(), AppError::UserInput { .. }));
        let mut short = request("ok@example.com");
        short.password = "five5".into();
        assert!(matches!(client.sign_up(&short).await.unwrap_err(), AppError::UserInput { .. }));
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let client = HostedClient::memory();
        client.sign_up(&request("pat@example.com")).await.unwrap();
        let err = client.sign_in_with_password("pat@example.com", "nope99").await.unwrap_err();
        assert!(matches!(err, AppError::Auth { .. }));
    }

    #[tokio::test]
    async fn metadata_update_merges_and_reflects_in_session() {
        let client = HostedClient::memory();
        let user = client.sign_up(&request("pat@example.com")).await.unwrap();
        client.sign_in_with_password("pat@example.com", "secret1").await.unwrap();
        let updated = client.update_metadata(&user.id, &MetadataPatch::role(Role::Vendor)).await.unwrap();
        assert_eq!(updated.user_metadata.role, Some(Role::Vendor));
        // untouched fields survive the merge
        assert_eq!(updated.user_metadata.first_name, "Pat");
        let sess = client.get_session().await.unwrap().unwrap();
        assert_eq!(sess.user.user_metadata.role, Some(Role::Vendor));
    }

    #[tokio::test]
    async fn get_user_follows_the_live_session() {
        let client = HostedClient::memory();
        let user = client.sign_up(&request("pat@example.com")).await.unwrap();
        // no session yet
        assert!(client.get_user().await.unwrap().is_none());
        client.sign_in_with_password("pat@example.com", "secret1").await.unwrap();
        let fetched = client.get_user().await.unwrap().expect("live session");
        assert_eq!(fetched.id, user.id);
        // a metadata change since sign-in shows up on re-read
        client.update_metadata(&user.id, &MetadataPatch::role(Role::Vendor)).await.unwrap();
        let fetched = client.get_user().await.unwrap().unwrap();
        assert_eq!(fetched.user_metadata.role, Some(Role::Vendor));
    }

    #[tokio::test]
    async fn metadata_update_for_gone_account_is_not_found() {
        let client = HostedClient::memory();
        let user = client.sign_up(&request("pat@example.com")).await.unwrap();
        client.sign_in_with_password("pat@example.com", "secret1").await.unwrap();
        assert!(client.delete_account("pat@example.com").unwrap());
        let err = client.update_metadata(&user.id, &MetadataPatch::role(Role::Client)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn oauth_fragment_roundtrip() {
        let client = HostedClient::memory();
        let sess = client.complete_oauth("oauth@example.com", UserMetadata::default()).unwrap();
        let fragment = format!("#access_token={}&token_type=bearer", sess.access_token);
        let back = client.session_from_fragment(&fragment).await.unwrap().expect("token in fragment");
        assert_eq!(back.user.email, "oauth@example.com");
        // OAuth identities arrive verified
        assert!(back.user.email_confirmed_at.is_some());
    }

    #[tokio::test]
    async fn fragment_without_token_is_none() {
        let client = HostedClient::memory();
        assert!(client.session_from_fragment("#error=access_denied").await.unwrap().is_none());
        assert!(client.session_from_fragment("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_out_invalidates_all_tokens() {
        let client = HostedClient::memory();
        client.sign_up(&request("pat@example.com")).await.unwrap();
        let sess = client.sign_in_with_password("pat@example.com", "secret1").await.unwrap();
        client.sign_out().await.unwrap();
        assert!(client.get_session().await.unwrap().is_none());
        let fragment = format!("#access_token={}", sess.access_token);
        assert!(client.session_from_fragment(&fragment).await.is_err());
    }

    #[tokio::test]
    async fn email_verification_flow() {
        let client = HostedClient::memory();
        client.sign_up(&request("pat@example.com")).await.unwrap();
        let token = client.issued_verification_token("pat@example.com").unwrap();
        assert!(matches!(
            client.verify_email("pat@example.com", "wrong").await.unwrap_err(),
            AppError::Auth { .. }
        ));
        client.verify_email("pat@example.com", &token).await.unwrap();
        let sess = client.sign_in_with_password("pat@example.com", "secret1").await.unwrap();
        assert!(sess.user.email_confirmed_at.is_some());
        // resend for an unknown account is NotFound
        assert!(matches!(
            client.resend_verification("ghost@example.com").await.unwrap_err(),
            AppError::NotFound { .. }
        ));
    }

    #[test]
    fn authorize_url_shape() {
        let client = HostedClient::http("https://id.example.com/", "anon-key");
        let url = client.sign_in_with_oauth(OAuthProvider::Google, "https://app.example.com/");
        assert!(url.starts_with("https://id.example.com/auth/v1/authorize?provider=google&redirect_to="));
        assert!(url.contains("https%3A%2F%2Fapp.example.com%2F"));
    }
}

//! Composition root for the auth subsystem.
//!
//! One `SessionContext` lives for the lifetime of the app shell and is the
//! only owner of the "current user" state. All login strategies funnel
//! through it in a fixed order (bypass, local directory, hosted provider).
//! Every resolution, whether from the initial load or a provider-pushed auth
//! event, commits through a monotonic version check so a slow resolution
//! that raced a newer one is dropped instead of clobbering it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::repository::SharedRepository;

use super::directory::{LocalDirectory, Registration};
use super::hosted::{HostedClient, MetadataPatch, OAuthProvider, SignUpRequest};
use super::principal::{Principal, Role};
use super::resolver::{self, ResolveInput, Resolution, ResolverState};

/// A registration, aimed at one of the two account stores.
#[derive(Debug, Clone)]
pub enum RegisterRequest {
    /// Email account at the hosted provider; requires email verification
    /// before first sign-in completes.
    Hosted(SignUpRequest),
    /// Username/PIN account in the local directory; signed in immediately.
    Local(Registration),
}

struct VersionedState {
    version: u64,
    state: ResolverState,
}

struct OpGuard<'a>(&'a AtomicUsize);

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionContext {
    hosted: HostedClient,
    directory: LocalDirectory,
    repo: SharedRepository,
    state: RwLock<VersionedState>,
    outstanding: AtomicUsize,
}

impl SessionContext {
    pub fn new(hosted: HostedClient, repo: SharedRepository) -> Arc<Self> {
        Arc::new(Self {
            hosted,
            directory: LocalDirectory::new(repo.clone()),
            repo,
            state: RwLock::new(VersionedState { version: 0, state: ResolverState::Unresolved }),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn directory(&self) -> &LocalDirectory {
        &self.directory
    }

    pub fn hosted(&self) -> &HostedClient {
        &self.hosted
    }

    fn begin_op(&self) -> OpGuard<'_> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        OpGuard(&self.outstanding)
    }

    fn begin_version(&self) -> u64 {
        let mut s = self.state.write();
        if matches!(s.state, ResolverState::Unresolved) {
            s.state = ResolverState::Resolving;
        }
        s.version
    }

    /// Commit a finished resolution unless the state moved on meanwhile.
    fn commit(&self, began_at: u64, res: Resolution) -> Resolution {
        let mut s = self.state.write();
        if s.version != began_at {
            info!(target: "marketgate::context", "stale resolution dropped (began at v{}, now v{})", began_at, s.version);
            return Resolution { state: s.state.clone(), navigate: None };
        }
        s.version += 1;
        s.state = res.state.clone();
        res
    }

    /// Force a new state and invalidate any resolution still in flight.
    fn commit_forced(&self, state: ResolverState) {
        let mut s = self.state.write();
        s.version += 1;
        s.state = state;
    }

    async fn resolve_and_commit(&self, input: &ResolveInput) -> Resolution {
        let began = self.begin_version();
        let res = resolver::resolve(&self.hosted, &self.directory, self.repo.as_ref(), input).await;
        self.commit(began, res)
    }

    /// Initial resolution on app load.
    pub async fn resolve_on_load(&self, input: &ResolveInput) -> Resolution {
        let _op = self.begin_op();
        self.resolve_and_commit(input).await
    }

    /// Provider-pushed auth state change. Same convergent logic as the
    /// mount-time path.
    pub async fn on_auth_state_change(&self, input: &ResolveInput) -> Resolution {
        let _op = self.begin_op();
        self.resolve_and_commit(input).await
    }

    /// Canonical password login. Identifiers with an `@` go to the hosted
    /// provider; anything else is a directory username (the bypass pair
    /// included). One entry point, one strategy order.
    pub async fn login(&self, identifier: &str, password: &str) -> AppResult<Principal> {
        let _op = self.begin_op();
        if identifier.contains('@') {
            self.hosted.sign_in_with_password(identifier, password).await?;
        } else {
            self.directory.login(identifier, password)?;
        }
        let res = self.resolve_and_commit(&ResolveInput::at("/login")).await;
        res.state
            .principal()
            .cloned()
            .ok_or_else(|| AppError::internal("login", "session vanished during resolution"))
    }

    pub fn login_with_google(&self, account_type: Option<Role>, redirect_to: &str) -> AppResult<String> {
        self.begin_oauth(OAuthProvider::Google, account_type, redirect_to)
    }

    pub fn login_with_apple(&self, account_type: Option<Role>, redirect_to: &str) -> AppResult<String> {
        self.begin_oauth(OAuthProvider::Apple, account_type, redirect_to)
    }

    /// Stash the chosen account type (it would be lost across the redirect)
    /// and hand back the provider authorize URL.
    fn begin_oauth(&self, provider: OAuthProvider, account_type: Option<Role>, redirect_to: &str) -> AppResult<String> {
        if let Some(role) = account_type {
            resolver::stash_account_type(self.repo.as_ref(), role)
                .map_err(|e| AppError::internal("pending_selection", e.to_string()))?;
        }
        Ok(self.hosted.sign_in_with_oauth(provider, redirect_to))
    }

    pub async fn register(&self, req: &RegisterRequest) -> AppResult<Principal> {
        let _op = self.begin_op();
        match req {
            RegisterRequest::Hosted(signup) => {
                let user = self.hosted.sign_up(signup).await?;
                Ok(user.to_principal())
            }
            RegisterRequest::Local(reg) => {
                let principal = self.directory.register(reg)?;
                self.resolve_and_commit(&ResolveInput::at("/register")).await;
                Ok(principal)
            }
        }
    }

    /// Complete a deferred role choice from the manual chooser. Only valid
    /// while the state is `NeedsRoleSelection`; commits `Authenticated` with
    /// the chosen role on success.
    pub async fn select_role(&self, role: Role) -> AppResult<Principal> {
        let _op = self.begin_op();
        let pending = match self.state() {
            ResolverState::NeedsRoleSelection(p) => p,
            _ => return Err(AppError::user("no_pending_selection", "no role selection is pending")),
        };
        let updated = self
            .hosted
            .update_metadata(&pending.id, &MetadataPatch::role(role))
            .await
            .map_err(|e| {
                warn!(target: "marketgate::context", "manual role assignment failed: {}", e);
                AppError::metadata(
                    "metadata_update_failed",
                    format!("could not save role choice: {}", e.message()),
                )
            })?;
        let principal = updated.to_principal();
        self.commit_forced(ResolverState::Authenticated(principal.clone()));
        Ok(principal)
    }

    /// Sign out of both stores and drop the current principal. A hosted
    /// sign-out failure is logged, not surfaced; the local state clears
    /// either way.
    pub async fn logout(&self) -> AppResult<()> {
        let _op = self.begin_op();
        if let Err(e) = self.hosted.sign_out().await {
            warn!(target: "marketgate::context", "hosted sign-out failed: {}", e);
        }
        self.directory.logout()?;
        self.commit_forced(ResolverState::Anonymous);
        Ok(())
    }

    pub async fn verify_user_email(&self, email: &str, token: &str) -> AppResult<()> {
        let _op = self.begin_op();
        self.hosted.verify_email(email, token).await
    }

    pub async fn resend_verification(&self, email: &str) -> AppResult<()> {
        let _op = self.begin_op();
        self.hosted.resend_verification(email).await
    }

    pub fn state(&self) -> ResolverState {
        self.state.read().state.clone()
    }

    pub fn user(&self) -> Option<Principal> {
        self.state.read().state.principal().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state.read().state, ResolverState::Authenticated(_))
    }

    pub fn is_admin(&self) -> bool {
        self.user().map(|p| p.is_admin()).unwrap_or(false)
    }

    /// True while any auth operation is outstanding.
    pub fn is_loading(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hosted::UserMetadata;
    use crate::identity::resolver::ResolverState;
    use crate::repository::MemoryRepository;

    fn context() -> Arc<SessionContext> {
        SessionContext::new(HostedClient::memory(), Arc::new(MemoryRepository::new()))
    }

    fn alice() -> Registration {
        Registration {
            username: "alice123".into(),
            password: "secret1".into(),
            pin: "4821".into(),
            role: Role::Client,
            first_name: String::new(),
            last_name: String::new(),
        }
    }

    #[tokio::test]
    async fn local_register_logs_in() {
        let ctx = context();
        let p = ctx.register(&RegisterRequest::Local(alice())).await.unwrap();
        assert_eq!(p.role, Some(Role::Client));
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.user().unwrap().username.as_deref(), Some("alice123"));
    }

    #[tokio::test]
    async fn hosted_register_does_not_log_in() {
        let ctx = context();
        let req = RegisterRequest::Hosted(SignUpRequest {
            email: "a@b.com".into(),
            password: "secret1".into(),
            metadata: UserMetadata::default(),
        });
        ctx.register(&req).await.unwrap();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn canonical_login_dispatches_on_identifier() {
        let ctx = context();
        ctx.register(&RegisterRequest::Local(alice())).await.unwrap();
        ctx.logout().await.unwrap();
        // username path
        let p = ctx.login("alice123", "secret1").await.unwrap();
        assert_eq!(p.username.as_deref(), Some("alice123"));
        ctx.logout().await.unwrap();
        // email path
        ctx.hosted()
            .sign_up(&SignUpRequest {
                email: "a@b.com".into(),
                password: "secret1".into(),
                metadata: UserMetadata { role: Some(Role::Vendor), ..Default::default() },
            })
            .await
            .unwrap();
        let p = ctx.login("a@b.com", "secret1").await.unwrap();
        assert_eq!(p.role, Some(Role::Vendor));
        assert_eq!(p.email.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn bypass_login_is_admin() {
        let ctx = context();
        let p = ctx.login("walkaway", "Dn249118++").await.unwrap();
        assert_eq!(p.role, Some(Role::Admin));
        assert!(ctx.is_admin());
    }

    #[tokio::test]
    async fn logout_clears_everything() {
        let ctx = context();
        ctx.register(&RegisterRequest::Local(alice())).await.unwrap();
        ctx.logout().await.unwrap();
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.user(), None);
        let res = ctx.resolve_on_load(&ResolveInput::at("/")).await;
        assert_eq!(res.state, ResolverState::Anonymous);
    }

    #[tokio::test]
    async fn stale_commit_is_dropped() {
        let ctx = context();
        // a resolution begins against the current version...
        let began = ctx.begin_version();
        // ...but a login lands first and moves the state forward
        ctx.login("walkaway", "Dn249118++").await.unwrap();
        let admin_state = ctx.state();
        // the late commit must not clobber the newer state
        let stale = Resolution { state: ResolverState::Anonymous, navigate: None };
        let out = ctx.commit(began, stale);
        assert_eq!(out.state, admin_state);
        assert_eq!(ctx.state(), admin_state);
    }

    #[tokio::test]
    async fn oauth_login_stashes_account_type() {
        let ctx = context();
        let url = ctx.login_with_google(Some(Role::Vendor), "https://app/").unwrap();
        assert!(url.contains("provider=google"));
        let taken = resolver::take_account_type(ctx.repo.as_ref()).unwrap();
        assert_eq!(taken, Some(Role::Vendor));
        // apple goes through the same stash
        let url = ctx.login_with_apple(Some(Role::Client), "https://app/").unwrap();
        assert!(url.contains("provider=apple"));
        assert_eq!(resolver::take_account_type(ctx.repo.as_ref()).unwrap(), Some(Role::Client));
    }

    #[tokio::test]
    async fn select_role_requires_a_pending_selection() {
        let ctx = context();
        let err = ctx.select_role(Role::Client).await.unwrap_err();
        assert!(matches!(err, AppError::UserInput { .. }));
    }

    #[tokio::test]
    async fn select_role_surfaces_metadata_failures() {
        let ctx = context();
        ctx.hosted()
            .sign_up(&SignUpRequest {
                email: "a@b.com".into(),
                password: "secret1".into(),
                metadata: UserMetadata::default(),
            })
            .await
            .unwrap();
        ctx.hosted().sign_in_with_password("a@b.com", "secret1").await.unwrap();
        // the account disappears before any role can be written
        ctx.hosted().delete_account("a@b.com").unwrap();
        let res = ctx.resolve_on_load(&ResolveInput::at("/")).await;
        assert!(matches!(res.state, ResolverState::NeedsRoleSelection(_)));
        let err = ctx.select_role(Role::Vendor).await.unwrap_err();
        assert!(matches!(err, AppError::Metadata { .. }));
    }

    #[tokio::test]
    async fn loading_flag_clears_after_ops() {
        let ctx = context();
        assert!(!ctx.is_loading());
        ctx.resolve_on_load(&ResolveInput::at("/")).await;
        assert!(!ctx.is_loading());
    }
}

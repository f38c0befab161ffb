//! Session resolution: decide who the current principal is and where the
//! browser should go next.
//!
//! Resolution runs on app load and again on every provider-pushed auth-state
//! change; both paths call [`resolve`] with the current location and must
//! converge on the same terminal state for a given session. The ordering
//! rule: a token in the URL fragment (OAuth callback) makes the hosted
//! session win outright; otherwise the local directory is consulted first,
//! then the hosted provider.
//!
//! A principal without a role claim picks one up here: the account-type
//! selection cached before an OAuth redirect is consumed exactly once and
//! written back to the provider. If that write fails, resolution exits to
//! the manual role chooser instead of retrying.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::repository::{self, keys, KeyValueRepository};

use super::directory::LocalDirectory;
use super::hosted::{HostedClient, HostedUser, MetadataPatch};
use super::principal::{Principal, Role};
use super::redirect::{redirect_for, ROLE_SELECTION_PATH};

/// Resolution outcome. `Unresolved` and `Resolving` exist only inside the
/// context's state cell while a resolution is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverState {
    Unresolved,
    Resolving,
    Anonymous,
    /// Signed in, but the role claim could not be written; the user must
    /// choose manually.
    NeedsRoleSelection(Principal),
    Authenticated(Principal),
}

impl ResolverState {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            ResolverState::Authenticated(p) | ResolverState::NeedsRoleSelection(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolverState::Unresolved | ResolverState::Resolving)
    }
}

/// Where the app currently is, as seen by the resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolveInput {
    pub current_path: String,
    /// URL fragment, when the load is an OAuth callback.
    pub url_fragment: Option<String>,
}

impl ResolveInput {
    pub fn at(path: &str) -> Self {
        Self { current_path: path.to_string(), url_fragment: None }
    }

    pub fn oauth_callback(path: &str, fragment: &str) -> Self {
        Self { current_path: path.to_string(), url_fragment: Some(fragment.to_string()) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: ResolverState,
    pub navigate: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingSelection {
    role: Role,
}

/// Cache a role choice across the OAuth redirect round-trip.
pub fn stash_account_type(repo: &dyn KeyValueRepository, role: Role) -> anyhow::Result<()> {
    repository::put_doc(repo, keys::SELECTED_ACCOUNT_TYPE, &PendingSelection { role })
}

/// Consume the cached role choice. The cache is cleared even though the
/// caller may still fail to apply it; the manual chooser is the fallback.
pub fn take_account_type(repo: &dyn KeyValueRepository) -> anyhow::Result<Option<Role>> {
    let doc: Option<PendingSelection> = repository::get_doc(repo, keys::SELECTED_ACCOUNT_TYPE)?;
    if doc.is_some() {
        repo.delete(keys::SELECTED_ACCOUNT_TYPE)?;
    }
    Ok(doc.map(|d| d.role))
}

/// Resolve the current principal. Never errors: provider hiccups during a
/// background resolution degrade to `Anonymous` (with a log line) rather
/// than taking the app down.
pub async fn resolve(
    hosted: &HostedClient,
    directory: &LocalDirectory,
    repo: &dyn KeyValueRepository,
    input: &ResolveInput,
) -> Resolution {
    // OAuth callback: the token in the fragment is authoritative.
    if let Some(fragment) = &input.url_fragment {
        match hosted.session_from_fragment(fragment).await {
            Ok(Some(session)) => {
                return finish_hosted(hosted, repo, session.user, &input.current_path).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "marketgate::resolver", "oauth callback failed: {}", e);
                return Resolution { state: ResolverState::Anonymous, navigate: None };
            }
        }
    }

    // Local directory session marker first, hosted session second.
    match directory.current_user() {
        Ok(Some(principal)) => {
            let navigate = principal.role.and_then(|r| redirect_for(r, &input.current_path));
            info!(target: "marketgate::resolver", "resolved directory user={}", principal.identifier());
            return Resolution { state: ResolverState::Authenticated(principal), navigate };
        }
        Ok(None) => {}
        Err(e) => warn!(target: "marketgate::resolver", "directory check failed: {}", e),
    }

    match hosted.get_session().await {
        Ok(Some(session)) => finish_hosted(hosted, repo, session.user, &input.current_path).await,
        Ok(None) => Resolution { state: ResolverState::Anonymous, navigate: None },
        Err(e) => {
            warn!(target: "marketgate::resolver", "hosted session check failed: {}", e);
            Resolution { state: ResolverState::Anonymous, navigate: None }
        }
    }
}

/// Reconcile the role claim for a hosted user and pick the navigation target.
async fn finish_hosted(
    hosted: &HostedClient,
    repo: &dyn KeyValueRepository,
    user: HostedUser,
    current_path: &str,
) -> Resolution {
    if let Some(role) = user.user_metadata.role {
        let principal = user.to_principal();
        info!(target: "marketgate::resolver", "resolved hosted user={} role={}", principal.identifier(), role);
        return Resolution { state: ResolverState::Authenticated(principal), navigate: redirect_for(role, current_path) };
    }

    // First sign-in after registration: assign the cached choice, default client.
    let chosen = match take_account_type(repo) {
        Ok(r) => r.unwrap_or(Role::Client),
        Err(e) => {
            warn!(target: "marketgate::resolver", "pending selection unreadable: {}", e);
            Role::Client
        }
    };
    match hosted.update_metadata(&user.id, &MetadataPatch::role(chosen)).await {
        Ok(updated) => {
            let principal = updated.to_principal();
            info!(target: "marketgate::resolver", "assigned role={} user={}", chosen, principal.identifier());
            Resolution { state: ResolverState::Authenticated(principal), navigate: redirect_for(chosen, current_path) }
        }
        Err(e) => {
            // No retry: exit to the manual chooser.
            warn!(target: "marketgate::resolver", "role assignment failed, deferring to manual selection: {}", e);
            let principal = user.to_principal();
            let navigate = if current_path.starts_with(ROLE_SELECTION_PATH) {
                None
            } else {
                Some(ROLE_SELECTION_PATH.to_string())
            };
            Resolution { state: ResolverState::NeedsRoleSelection(principal), navigate }
        }
    }
}

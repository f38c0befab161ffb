//! Central identity and session management for the marketplace auth flows.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod hosted;
mod directory;
mod resolver;
mod redirect;
mod context;

pub use principal::{Principal, Role};
pub use session::{Session, SessionToken, SessionManager, SESSION_TTL_DAYS};
pub use hosted::{
    HostedClient, HostedSession, HostedUser, MetadataPatch, OAuthProvider, SignUpRequest,
    UserMetadata,
};
pub use directory::{LocalDirectory, Registration, BYPASS_USERNAME};
pub use resolver::{
    resolve, stash_account_type, take_account_type, ResolveInput, Resolution, ResolverState,
};
pub use redirect::{redirect_for, route_allows, ADMIN_HOME, ROLE_SELECTION_PATH};
pub use context::{RegisterRequest, SessionContext};

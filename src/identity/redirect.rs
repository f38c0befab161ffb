//! Post-login navigation policy and the route guard. Pure functions only;
//! the session resolver applies them, the HTTP layer never does.

use super::principal::Role;

pub const ADMIN_HOME: &str = "/admin";
pub const ROLE_SELECTION_PATH: &str = "/role-selection";
const DASHBOARD_PREFIX: &str = "/dashboard";

/// Routes that never require a principal.
const PUBLIC_PATHS: &[&str] = &["/", "/login", "/register", "/verify-email", ROLE_SELECTION_PATH];

fn under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

/// Dashboard home for a role.
pub fn home_for(role: Role) -> String {
    match role {
        Role::Admin => ADMIN_HOME.to_string(),
        other => format!("{}/{}", DASHBOARD_PREFIX, other.as_str()),
    }
}

/// Where to navigate after a resolution, if anywhere.
///
/// Admins are always steered to the admin area. Other roles are sent to
/// their dashboard only when outside the dashboard/admin/role-selection
/// areas; once inside, the user is left in place so repeated resolutions
/// cannot cause redirect loops.
pub fn redirect_for(role: Role, current_path: &str) -> Option<String> {
    if under(current_path, ROLE_SELECTION_PATH) {
        return None;
    }
    match role {
        Role::Admin => {
            if under(current_path, ADMIN_HOME) {
                None
            } else {
                Some(ADMIN_HOME.to_string())
            }
        }
        other => {
            if under(current_path, DASHBOARD_PREFIX) || under(current_path, ADMIN_HOME) {
                None
            } else {
                Some(home_for(other))
            }
        }
    }
}

/// Route guard: may a visitor with this (possibly absent) role load the path?
///
/// Admin passes everywhere; dashboards require their own role; everything
/// outside the gated areas is public.
pub fn route_allows(role: Option<Role>, path: &str) -> bool {
    if PUBLIC_PATHS.iter().any(|p| under(path, p)) {
        return true;
    }
    if role == Some(Role::Admin) {
        return true;
    }
    if under(path, ADMIN_HOME) {
        return false;
    }
    if under(path, DASHBOARD_PREFIX) {
        return match role {
            Some(r) => under(path, &home_for(r)),
            None => false,
        };
    }
    // unknown routes are public by default; the router 404s them
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_policy_table() {
        assert_eq!(redirect_for(Role::Admin, "/dashboard/vendor").as_deref(), Some("/admin"));
        assert_eq!(redirect_for(Role::Client, "/dashboard/client"), None);
        assert_eq!(redirect_for(Role::Vendor, "/").as_deref(), Some("/dashboard/vendor"));
        assert_eq!(redirect_for(Role::Client, "/login").as_deref(), Some("/dashboard/client"));
        assert_eq!(redirect_for(Role::Admin, "/admin"), None);
        assert_eq!(redirect_for(Role::Admin, "/admin/users"), None);
        assert_eq!(redirect_for(Role::Vendor, "/role-selection"), None);
        assert_eq!(redirect_for(Role::Client, "/admin"), None);
    }

    #[test]
    fn redirect_is_pure() {
        for _ in 0..3 {
            assert_eq!(redirect_for(Role::Vendor, "/").as_deref(), Some("/dashboard/vendor"));
        }
    }

    #[test]
    fn guard_gates_dashboards_by_role() {
        assert!(route_allows(Some(Role::Client), "/dashboard/client"));
        assert!(!route_allows(Some(Role::Client), "/dashboard/vendor"));
        assert!(!route_allows(Some(Role::Vendor), "/admin"));
        assert!(route_allows(Some(Role::Admin), "/admin"));
        assert!(route_allows(Some(Role::Admin), "/dashboard/vendor"));
        assert!(!route_allows(None, "/dashboard/client"));
    }

    #[test]
    fn guard_leaves_public_routes_open() {
        for p in ["/", "/login", "/register", "/verify-email", "/role-selection"] {
            assert!(route_allows(None, p), "path {}", p);
        }
        // prefix tricks do not widen the public set
        assert!(!route_allows(None, "/dashboard/client/settings"));
    }
}

//! End-to-end auth flows through the session context: local directory
//! register/login/reset, the admin bypass, and the OAuth round-trip with a
//! cached account-type selection.

use std::sync::Arc;

use marketgate::identity::{
    HostedClient, RegisterRequest, Registration, ResolveInput, ResolverState, Role, SessionContext,
    UserMetadata,
};
use marketgate::repository::FileRepository;
use tempfile::tempdir;

fn context_in(dir: &std::path::Path) -> Arc<SessionContext> {
    let repo = Arc::new(FileRepository::new(dir.join("authdata")).expect("repo root"));
    SessionContext::new(HostedClient::memory(), repo)
}

fn alice() -> Registration {
    Registration {
        username: "alice123".into(),
        password: "secret1".into(),
        pin: "4821".into(),
        role: Role::Client,
        first_name: "Alice".into(),
        last_name: "Ames".into(),
    }
}

#[tokio::test]
async fn register_then_login_returns_client_role() {
    let tmp = tempdir().unwrap();
    let ctx = context_in(tmp.path());

    ctx.register(&RegisterRequest::Local(alice())).await.unwrap();
    ctx.logout().await.unwrap();

    let p = ctx.login("alice123", "secret1").await.unwrap();
    assert_eq!(p.role, Some(Role::Client));
    assert_eq!(p.username.as_deref(), Some("alice123"));
    assert!(ctx.is_authenticated());
}

#[tokio::test]
async fn hardcoded_bypass_resolves_to_admin_without_register() {
    let tmp = tempdir().unwrap();
    let ctx = context_in(tmp.path());

    let p = ctx.login("walkaway", "Dn249118++").await.unwrap();
    assert_eq!(p.role, Some(Role::Admin));
    assert!(ctx.is_admin());
}

#[tokio::test]
async fn reset_password_enforces_length_then_rotates() {
    let tmp = tempdir().unwrap();
    let ctx = context_in(tmp.path());
    ctx.register(&RegisterRequest::Local(alice())).await.unwrap();

    // correct PIN but a 5-character password fails on format
    let err = ctx.directory().reset_password("alice123", "4821", "five5").unwrap_err();
    assert_eq!(err.http_status(), 400);

    // 6 characters succeeds; old password stops working
    ctx.directory().reset_password("alice123", "4821", "sixsix").unwrap();
    ctx.logout().await.unwrap();
    assert!(ctx.login("alice123", "secret1").await.is_err());
    let p = ctx.login("alice123", "sixsix").await.unwrap();
    assert_eq!(p.role, Some(Role::Client));
}

#[tokio::test]
async fn oauth_return_applies_cached_vendor_selection() {
    let tmp = tempdir().unwrap();
    let ctx = context_in(tmp.path());

    // the account type is chosen before the redirect leaves the page
    let url = ctx.login_with_google(Some(Role::Vendor), "https://app.example.com/").unwrap();
    assert!(url.contains("provider=google"));

    // the provider consents and redirects back with a token fragment
    let session = ctx.hosted().complete_oauth("newbie@example.com", UserMetadata::default()).unwrap();
    let input = ResolveInput::oauth_callback("/", &format!("#access_token={}&token_type=bearer", session.access_token));
    let res = ctx.resolve_on_load(&input).await;

    match &res.state {
        ResolverState::Authenticated(p) => {
            assert_eq!(p.role, Some(Role::Vendor));
            assert_eq!(p.email.as_deref(), Some("newbie@example.com"));
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(res.navigate.as_deref(), Some("/dashboard/vendor"));

    // a second resolution converges on the same terminal state
    let res2 = ctx
        .on_auth_state_change(&ResolveInput::at("/dashboard/vendor"))
        .await;
    match &res2.state {
        ResolverState::Authenticated(p) => assert_eq!(p.role, Some(Role::Vendor)),
        other => panic!("unexpected state {:?}", other),
    }
    assert_eq!(res2.navigate, None);
}

#[tokio::test]
async fn directory_survives_a_restart() {
    let tmp = tempdir().unwrap();
    {
        let ctx = context_in(tmp.path());
        ctx.register(&RegisterRequest::Local(alice())).await.unwrap();
    }
    // a fresh context over the same data directory still knows the account
    let ctx = context_in(tmp.path());
    let p = ctx.login("alice123", "secret1").await.unwrap();
    assert_eq!(p.username.as_deref(), Some("alice123"));

    // and the session marker from the register is honored on load
    let res = ctx.resolve_on_load(&ResolveInput::at("/")).await;
    assert!(matches!(res.state, ResolverState::Authenticated(_)));
}

#[tokio::test]
async fn email_verification_flow_via_context() {
    let tmp = tempdir().unwrap();
    let ctx = context_in(tmp.path());

    ctx.register(&RegisterRequest::Hosted(marketgate::identity::SignUpRequest {
        email: "pat@example.com".into(),
        password: "secret1".into(),
        metadata: UserMetadata { role: Some(Role::Client), ..Default::default() },
    }))
    .await
    .unwrap();

    ctx.resend_verification("pat@example.com").await.unwrap();
    let token = ctx.hosted().issued_verification_token("pat@example.com").unwrap();
    ctx.verify_user_email("pat@example.com", &token).await.unwrap();

    let p = ctx.login("pat@example.com", "secret1").await.unwrap();
    assert!(p.is_verified);
}

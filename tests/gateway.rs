use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use base64::Engine;
use gitrepublic::{
    config::Settings,
    gateway::{self, AppContext},
};
use nostr::JsonUtil;
use test_utils::*;
use tower::util::ServiceExt;

fn test_context(scaffold: &ScaffoldedRepo) -> Arc<AppContext> {
    let settings = Settings {
        repo_root: scaffold.root.clone(),
        domain: "example.org".to_string(),
        relay_default_set: vec![],
        ..Settings::default()
    };
    AppContext::build(settings, None).expect("context builds")
}

fn nostr_header(event: &nostr::Event) -> String {
    format!(
        "Nostr {}",
        base64::engine::general_purpose::STANDARD.encode(event.as_json())
    )
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

#[tokio::test]
async fn malformed_paths_are_rejected_with_400() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    for path in ["/", "/onlyowner", "/owner/repo", "/owner/repo.git/info/refs"] {
        let response = app
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}

#[tokio::test]
async fn unknown_repository_is_404() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let path = format!("/{}/absent.git/info/refs?service=git-upload-pack", *TEST_KEY_1_NPUB);
    let response = app
        .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn public_clone_advertisement_needs_no_auth() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let path = format!(
        "/{}/{}.git/info/refs?service=git-upload-pack",
        scaffold.npub, scaffold.name
    );
    let response = app
        .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-git-upload-pack-advertisement"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );
    let body = body_bytes(response).await;
    assert!(
        body.starts_with(b"001e# service=git-upload-pack\n"),
        "unexpected advertisement prefix: {:?}",
        &body[..body.len().min(40)]
    );
}

#[tokio::test]
async fn push_without_auth_is_challenged_with_401() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let path = format!("/{}/{}.git/git-receive-pack", scaffold.npub, scaffold.name);
    let response = app
        .oneshot(
            Request::post(path.as_str())
                .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
                .body(Body::from("0000"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"GitRepublic\""
    );
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
}

#[tokio::test]
async fn receive_pack_advertisement_without_auth_is_challenged() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let path = format!(
        "/{}/{}.git/info/refs?service=git-receive-pack",
        scaffold.npub, scaffold.name
    );
    let response = app
        .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn push_by_outsider_is_denied_with_remediation() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let body = b"0000".to_vec();
    let url = format!(
        "https://example.org/{}/{}.git/git-receive-pack",
        scaffold.npub, scaffold.name
    );
    // key 2 is neither the owner nor a maintainer of key 1's repository
    let event = generate_nip98(&TEST_KEY_2_KEYS, &url, "POST", Some(&body));

    let path = format!("/{}/{}.git/git-receive-pack", scaffold.npub, scaffold.name);
    let response = app
        .oneshot(
            Request::post(path.as_str())
                .header(header::AUTHORIZATION, nostr_header(&event))
                .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain; charset=utf-8"
    );
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    let owner_prefix: String = TEST_KEY_1_NPUB.chars().take(12).collect();
    assert!(body.contains(&owner_prefix), "body was: {body}");
    assert!(body.contains("maintainers"));
}

#[tokio::test]
async fn push_by_owner_reaches_the_backend() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let body = b"0000".to_vec();
    let url = format!(
        "https://example.org/{}/{}.git/git-receive-pack",
        scaffold.npub, scaffold.name
    );
    let event = generate_nip98(&TEST_KEY_1_KEYS, &url, "POST", Some(&body));

    let path = format!("/{}/{}.git/git-receive-pack", scaffold.npub, scaffold.name);
    let response = app
        .oneshot(
            Request::post(path.as_str())
                .header(header::AUTHORIZATION, nostr_header(&event))
                .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-git-receive-pack-result"
    );
}

#[tokio::test]
async fn maintainer_may_push_but_protected_deletion_is_denied() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let ctx = test_context(&scaffold);

    // policy events arrive from relays in production; seed the cache with
    // the exact filters the resolver asks with
    let owner = TEST_KEY_1_KEYS.public_key();
    let coordinate = format!("30617:{owner}:{}", scaffold.name);
    let maintainers_filter = nostr::Filter::new()
        .kind(nostr_sdk::Kind::Custom(30618))
        .author(owner)
        .custom_tag(
            nostr_sdk::SingleLetterTag::lowercase(nostr_sdk::Alphabet::A),
            coordinate.clone(),
        );
    let maintainers = generate_maintainers(
        &TEST_KEY_1_KEYS,
        &owner,
        &scaffold.name,
        &[TEST_KEY_2_KEYS.public_key()],
        100,
    );
    ctx.cache
        .set(&[maintainers_filter], vec![maintainers], None)
        .await;

    let protection_filter = nostr::Filter::new()
        .kind(nostr_sdk::Kind::Custom(30619))
        .author(owner)
        .custom_tag(
            nostr_sdk::SingleLetterTag::lowercase(nostr_sdk::Alphabet::A),
            coordinate,
        );
    let protection = generate_branch_protection(
        &TEST_KEY_1_KEYS,
        &scaffold.name,
        &[("main", &["require-maintainer"])],
        100,
    );
    ctx.cache
        .set(&[protection_filter], vec![protection], None)
        .await;

    let app = gateway::router(ctx);
    let url = format!(
        "https://example.org/{}/{}.git/git-receive-pack",
        scaffold.npub, scaffold.name
    );
    let path = format!("/{}/{}.git/git-receive-pack", scaffold.npub, scaffold.name);

    // an empty command list from the maintainer reaches the backend
    let body = b"0000".to_vec();
    let event = generate_nip98(&TEST_KEY_2_KEYS, &url, "POST", Some(&body));
    let response = app
        .clone()
        .oneshot(
            Request::post(path.as_str())
                .header(header::AUTHORIZATION, nostr_header(&event))
                .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // deleting the protected branch is refused before the backend runs
    let line = format!(
        "{} {} refs/heads/main\0report-status",
        "1111111111111111111111111111111111111111",
        "0000000000000000000000000000000000000000"
    );
    let mut body = format!("{:04x}{line}", line.len() + 4).into_bytes();
    body.extend(b"0000");
    let event = generate_nip98(&TEST_KEY_2_KEYS, &url, "POST", Some(&body));
    let response = app
        .oneshot(
            Request::post(path.as_str())
                .header(header::AUTHORIZATION, nostr_header(&event))
                .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    let maintainer_prefix: String = TEST_KEY_2_NPUB.chars().take(12).collect();
    assert!(body.contains(&maintainer_prefix), "body was: {body}");
}

#[tokio::test]
async fn healthz_answers_ok() {
    let scaffold = ScaffoldedRepo::with_initial_commit("main");
    let app = gateway::router(test_context(&scaffold));

    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

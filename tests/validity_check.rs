use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use portalkeep::storage::{MemorySessionStore, SessionStore};
use portalkeep::{PortalError, PortalService, Step};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::*;

async fn stored_session(store: &MemorySessionStore) -> Result<()> {
    let school = tenant("okul-34");
    store.replace_cookie(&school, SESSION_COOKIE).await?;
    store.record_login(&school, Utc::now()).await?;
    Ok(())
}

#[tokio::test]
async fn home_page_with_user_name_is_logged_in() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/main.aspx"))
        .and(header("Cookie", SESSION_COOKIE))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOME_PAGE))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    stored_session(&store).await?;
    let service = PortalService::builder(config_for(&server), store.clone()).build()?;

    let status = service.is_logged_in(&tenant("okul-34")).await?;

    assert!(status.success);
    let session = store.get_session(&tenant("okul-34")).await?.expect("kept");
    assert!(session.is_valid);
    Ok(())
}

#[tokio::test]
async fn login_page_served_with_200_is_not_logged_in() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/main.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    stored_session(&store).await?;
    let service = PortalService::builder(config_for(&server), store.clone()).build()?;

    let status = service.is_logged_in(&tenant("okul-34")).await?;

    assert!(!status.success);
    assert_eq!(status.message, "session expired");
    let session = store.get_session(&tenant("okul-34")).await?.expect("kept");
    assert!(!session.is_valid);
    Ok(())
}

#[tokio::test]
async fn redirect_to_login_is_not_logged_in() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/main.aspx"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/default.aspx"))
        .mount(&server)
        .await;
    // Redirects are judged, not followed.
    Mock::given(method("GET"))
        .and(path("/default.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOME_PAGE))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    stored_session(&store).await?;
    let service = PortalService::builder(config_for(&server), store).build()?;

    assert!(!service.is_logged_in(&tenant("okul-34")).await?.success);
    Ok(())
}

#[tokio::test]
async fn empty_user_marker_is_not_logged_in() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/main.aspx"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"<html><body><span id="lblKullaniciAdi">  </span></body></html>"#),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    stored_session(&store).await?;
    let service = PortalService::builder(config_for(&server), store).build()?;

    assert!(!service.is_logged_in(&tenant("okul-34")).await?.success);
    Ok(())
}

#[tokio::test]
async fn no_stored_session_makes_no_request() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOME_PAGE))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store).build()?;

    let status = service.is_logged_in(&tenant("okul-34")).await?;
    assert!(!status.success);
    assert_eq!(status.message, "no stored session");
    Ok(())
}

#[tokio::test]
async fn server_error_is_reported_and_session_kept() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/main.aspx"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    stored_session(&store).await?;
    let service = PortalService::builder(config_for(&server), store.clone()).build()?;

    let err = service.is_logged_in(&tenant("okul-34")).await.unwrap_err();
    assert!(matches!(err, PortalError::PortalUnavailable { .. }));
    assert_eq!(err.step(), Some(Step::HomeCheck));

    let session = store.get_session(&tenant("okul-34")).await?.expect("kept");
    assert!(session.is_valid);
    Ok(())
}

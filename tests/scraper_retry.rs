use std::sync::Arc;

use anyhow::Result;
use portalkeep::credentials::PortalCredentials;
use portalkeep::models::TenantMeta;
use portalkeep::portal::{hide_id, parse_table};
use portalkeep::storage::{MemorySessionStore, SessionStore};
use portalkeep::{PortalError, PortalService, Step};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::*;

async fn mount_category_results(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .and(body_string_contains("__EVENTTARGET=cmbListeTuru"))
        .and(body_string_contains("cmbListeTuru=1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(VEHICLES_PAGE))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .and(body_string_contains("cmbListeTuru=2"))
        // the second postback carries the first answer's view state
        .and(body_string_contains("__VIEWSTATE=%2FwEPDwUJYXJhY2xhcg"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SIMULATORS_PAGE))
        .mount(server)
        .await;
}

/// The full login + out-of-band confirmation exchange, each step once.
async fn mount_reauthentication(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/default.aspx"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "ASP.NET_SessionId=fresh77; path=/")
                .set_body_string(LOGIN_PAGE),
        )
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/default.aspx"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/giris_onay.aspx"))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/giris_onay.aspx"))
        .and(query_param("onay", "p-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOME_PAGE))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/giris_onay.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CONFIRMATION_PAGE))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/onay/dogrula.ashx"))
        .and(query_param("verify", hide_id("peer-1").as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
}

fn credentials() -> PortalCredentials {
    PortalCredentials::new("okul34", "gizli")
}

#[test]
fn parse_table_reads_the_fixture() {
    let records = parse_table(VEHICLES_PAGE, "dgAracListesi").expect("table present");
    assert_eq!(records.len(), 2);
    for record in &records {
        let mut columns: Vec<&str> = record.columns().collect();
        columns.sort();
        assert_eq!(columns, vec!["Marka", "Model Yılı", "Plaka"]);
    }
    assert_eq!(records[1].get("Plaka"), Some("06 XYZ 99"));
}

#[tokio::test]
async fn fetches_both_categories() -> Result<()> {
    let server = MockServer::start().await;
    mount_category_results(&server).await;

    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store.clone()).build()?;
    let meta = TenantMeta::new(tenant("okul-34"));

    let records = service
        .fetch_records(SESSION_COOKIE, RECORDS_PAGE, &meta, None)
        .await?;

    assert_eq!(records.vehicles.len(), 2);
    assert_eq!(records.vehicles[0].get("Plaka"), Some("34 ABC 123"));
    assert_eq!(records.vehicles[0].get("Model Yılı"), Some("2019"));
    assert_eq!(records.simulators.len(), 1);
    assert_eq!(records.simulators[0].get("Türü"), Some("Otomobil"));

    let session = store.get_session(&meta.tenant_id).await?.expect("touched");
    assert!(session.last_activity_at.is_some());
    Ok(())
}

#[tokio::test]
async fn expired_without_credentials_asks_for_a_code() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", "/default.aspx?ReturnUrl=%2fSKT"),
        )
        .expect(1)
        .mount(&server)
        .await;
    // No re-authentication may be attempted.
    Mock::given(method("GET"))
        .and(path("/default.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .expect(0)
        .mount(&server)
        .await;

    let transport = Arc::new(ScriptedTransport::new("peer-1", "p-1"));
    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store)
        .confirmation_transport(transport.clone())
        .build()?;
    let meta = TenantMeta::new(tenant("okul-34"));

    let err = service
        .fetch_records(SESSION_COOKIE, RECORDS_PAGE, &meta, None)
        .await
        .unwrap_err();

    assert!(matches!(err, PortalError::ManualCodeRequired { .. }));
    assert!(err.needs_manual_code());
    assert_eq!(transport.requests(), 0);
    Ok(())
}

#[tokio::test]
async fn expired_with_credentials_reauthenticates_once() -> Result<()> {
    let server = MockServer::start().await;
    // First postback finds the session gone; later ones succeed.
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EXPIRED_PAGE))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_category_results(&server).await;
    mount_reauthentication(&server).await;
    Mock::given(method("GET"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RECORDS_PAGE))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Arc::new(ScriptedTransport::new("peer-1", "p-1"));
    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store.clone())
        .confirmation_transport(transport.clone())
        .build()?;
    transport.attach(service.confirmation_hub().clone());
    let meta = TenantMeta::new(tenant("okul-34"));

    let records = service
        .fetch_records(SESSION_COOKIE, RECORDS_PAGE, &meta, Some(&credentials()))
        .await?;

    assert_eq!(records.vehicles.len(), 2);
    assert_eq!(records.simulators.len(), 1);
    assert_eq!(transport.requests(), 1);

    let session = store.get_session(&meta.tenant_id).await?.expect("session");
    assert!(session.is_valid);
    assert_eq!(session.cookie_jar, "ASP.NET_SessionId=fresh77");
    Ok(())
}

#[tokio::test]
async fn still_expired_after_reauthentication_gives_up() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/default.aspx"))
        .expect(1)
        .mount(&server)
        .await;
    mount_reauthentication(&server).await;
    Mock::given(method("GET"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EXPIRED_PAGE))
        .expect(1)
        .mount(&server)
        .await;

    let transport = Arc::new(ScriptedTransport::new("peer-1", "p-1"));
    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store)
        .confirmation_transport(transport.clone())
        .build()?;
    transport.attach(service.confirmation_hub().clone());
    let meta = TenantMeta::new(tenant("okul-34"));

    let err = service
        .fetch_records(SESSION_COOKIE, RECORDS_PAGE, &meta, Some(&credentials()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PortalError::SessionExpired {
            step: Step::RecordsPage
        }
    ));
    assert_eq!(transport.requests(), 1);
    Ok(())
}

#[tokio::test]
async fn credentials_without_out_of_band_channel_need_a_code() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EXPIRED_PAGE))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/default.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store).build()?;

    let err = service
        .fetch_records(
            SESSION_COOKIE,
            RECORDS_PAGE,
            &TenantMeta::new(tenant("okul-34")),
            Some(&credentials()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PortalError::ManualCodeRequired { .. }));
    Ok(())
}

#[tokio::test]
async fn missing_table_is_a_parse_error_with_capture() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html><body><p>Kayıt bulunamadı</p></body></html>"),
        )
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store).build()?;

    let err = service
        .fetch_records(
            SESSION_COOKIE,
            RECORDS_PAGE,
            &TenantMeta::new(tenant("okul-34")),
            None,
        )
        .await
        .unwrap_err();

    let PortalError::Parse {
        step,
        detail,
        capture,
    } = &err
    else {
        panic!("expected parse error, got {err:?}");
    };
    assert_eq!(*step, Step::RecordsPostback);
    assert!(detail.contains("dgAracListesi"));
    let page = service
        .captured_page(&capture.expect("captured"))
        .expect("still cached");
    assert!(page.body.contains("Kayıt bulunamadı"));
    Ok(())
}

#[tokio::test]
async fn redirect_elsewhere_is_surfaced() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SKT/skt02006.aspx"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/bakim.aspx"))
        .mount(&server)
        .await;

    let store = Arc::new(MemorySessionStore::new());
    let service = PortalService::builder(config_for(&server), store).build()?;

    let err = service
        .fetch_records(
            SESSION_COOKIE,
            RECORDS_PAGE,
            &TenantMeta::new(tenant("okul-34")),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PortalError::UnexpectedRedirect { .. }));
    Ok(())
}

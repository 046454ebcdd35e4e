#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portalkeep::config::Config;
use portalkeep::error::{PortalError, Step, UnavailableKind};
use portalkeep::models::TenantId;
use portalkeep::portal::{ConfirmationHub, ConfirmationTransport, CheckOutcome, SessionCheck};
use wiremock::MockServer;

pub const SESSION_COOKIE: &str = "ASP.NET_SessionId=abc123";

pub const LOGIN_PAGE: &str = r#"<html><body>
<form method="post" action="./default.aspx" id="form1">
  <input type="hidden" name="__EVENTTARGET" id="__EVENTTARGET" value="" />
  <input type="hidden" name="__EVENTARGUMENT" id="__EVENTARGUMENT" value="" />
  <input type="hidden" name="__VIEWSTATE" id="__VIEWSTATE" value="/wEPDwUKMTY1NDU2MTA1Mg9kFgI=" />
  <input type="hidden" name="__EVENTVALIDATION" id="__EVENTVALIDATION" value="/wEdAAS7" />
  <input type="text" name="txtKullaniciAd" />
  <input type="password" name="txtSifre" />
  <input type="submit" name="btnGiris" value="Giriş" />
</form>
</body></html>"#;

pub const REJECTED_PAGE: &str = r#"<html><body>
<form method="post" action="./default.aspx">
  <input type="hidden" name="__VIEWSTATE" value="/wEPDwUKMTY1NDU2MTA1Mg9kFgI=" />
  <span id="lblHata" class="hata">Kullanıcı Adı veya Şifre Hatalı</span>
</form>
</body></html>"#;

pub const CONFIRMATION_PAGE: &str = r#"<html><body>
<form method="post" action="./giris_onay.aspx">
  <input type="hidden" name="__EVENTTARGET" value="" />
  <input type="hidden" name="__EVENTARGUMENT" value="" />
  <input type="hidden" name="__VIEWSTATE" value="/wEPDwULLTE3OTk4Mjc0" />
  <iframe src="https://onay.example/cerceve.aspx?token=tok-123&amp;dil=tr" width="300"></iframe>
  <input type="text" name="txtDogrulamaKodu" />
  <a href="javascript:__doPostBack('dogrula','')">Doğrula</a>
</form>
</body></html>"#;

pub const CODE_REJECTED_PAGE: &str = r#"<html><body>
<form method="post" action="./giris_onay.aspx">
  <input type="hidden" name="__VIEWSTATE" value="/wEPDwULLTE3OTk4Mjc0" />
  <span id="lblOnayHata">Doğrulama kodu hatalı</span>
</form>
</body></html>"#;

pub const HOME_PAGE: &str = r#"<html><body>
<div class="ust"><span id="lblKullaniciAdi">AHMET YILMAZ</span></div>
</body></html>"#;

pub const RECORDS_PAGE: &str = r#"<html><body>
<form method="post" action="./skt02006.aspx">
  <input type="hidden" name="__EVENTTARGET" value="" />
  <input type="hidden" name="__EVENTARGUMENT" value="" />
  <input type="hidden" name="__VIEWSTATE" value="/wEPDwUJNzY1NDMyMTA" />
  <select name="cmbListeTuru" id="cmbListeTuru" onchange="__doPostBack('cmbListeTuru','')">
    <option selected="selected" value="0">Seçiniz</option>
    <option value="1">Ara&#231;</option>
    <option value="2">Sim&#252;lat&#246;r</option>
  </select>
</form>
</body></html>"#;

pub const VEHICLES_PAGE: &str = r#"<html><body>
<form method="post" action="./skt02006.aspx">
  <input type="hidden" name="__VIEWSTATE" value="/wEPDwUJYXJhY2xhcg" />
  <table id="dgAracListesi" cellspacing="0" border="1">
    <tr class="baslik"><td>Plaka</td><td>Marka</td><td>Model Y&#305;l&#305;</td></tr>
    <tr><td>34 ABC 123</td><td>Renault</td><td>2019</td></tr>
    <tr><td>&nbsp;</td><td>&nbsp;</td><td>&nbsp;</td></tr>
    <tr><td>06 XYZ 99</td><td>Fiat</td><td>2021</td></tr>
  </table>
</form>
</body></html>"#;

pub const SIMULATORS_PAGE: &str = r#"<html><body>
<form method="post" action="./skt02006.aspx">
  <input type="hidden" name="__VIEWSTATE" value="/wEPDwUJc2ltdWxhdG9y" />
  <table id="dgSimulatorListesi">
    <tr><th>Seri No</th><th>T&#252;r&#252;</th></tr>
    <tr><td>SIM-0042</td><td>Otomobil</td></tr>
  </table>
</form>
</body></html>"#;

pub const EXPIRED_PAGE: &str = r#"<html><body>
<p>Oturum süreniz dolmuştur. Lütfen tekrar giriş yapınız.</p>
<input type="text" name="txtKullaniciAd" />
</body></html>"#;

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).expect("valid tenant id")
}

/// Defaults pointed at the mock portal, with a short confirmation bound.
pub fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.portal.base_url = server.uri();
    config.portal.request_timeout = Duration::from_secs(5);
    config.confirmation.verify_url = format!("{}/onay/dogrula.ashx", server.uri());
    config.confirmation.timeout = Duration::from_secs(5);
    config
}

/// Acks every confirmation request with a fixed peer id and, once a hub is
/// attached, pushes the proceed event shortly afterwards.
pub struct ScriptedTransport {
    pub peer_id: String,
    pub param: String,
    pub push: bool,
    requests: AtomicUsize,
    hub: Mutex<Option<Arc<ConfirmationHub>>>,
}

impl ScriptedTransport {
    pub fn new(peer_id: &str, param: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            param: param.to_string(),
            push: true,
            requests: AtomicUsize::new(0),
            hub: Mutex::new(None),
        }
    }

    pub fn silent(peer_id: &str) -> Self {
        Self {
            push: false,
            ..Self::new(peer_id, "")
        }
    }

    pub fn attach(&self, hub: Arc<ConfirmationHub>) {
        *self.hub.lock().unwrap() = Some(hub);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfirmationTransport for ScriptedTransport {
    async fn request_confirmation(
        &self,
        _tenant: &TenantId,
        _event: &str,
    ) -> Result<String, PortalError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let hub = self.hub.lock().unwrap().clone();
        if let (true, Some(hub)) = (self.push, hub) {
            let peer_id = self.peer_id.clone();
            let param = self.param.clone();
            tokio::spawn(async move {
                // Lands after the waiter registered and the verify call went out.
                for _ in 0..100 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if hub.deliver(&peer_id, param.clone()) {
                        return;
                    }
                }
            });
        }
        Ok(self.peer_id.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Ping {
    Authenticated,
    NotAuthenticated,
    Timeout,
    ServerError,
}

/// Checker answering pings from a script, then with a default.
pub struct ScriptedChecker {
    script: Mutex<VecDeque<Ping>>,
    default: Ping,
    invalid_cookies: Mutex<HashSet<String>>,
    pings: AtomicUsize,
    validations: AtomicUsize,
}

impl ScriptedChecker {
    pub fn new(default: Ping) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            invalid_cookies: Mutex::new(HashSet::new()),
            pings: AtomicUsize::new(0),
            validations: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, script: impl IntoIterator<Item = Ping>) -> Self {
        self.script.lock().unwrap().extend(script);
        self
    }

    /// Validation of this cookie reports "not authenticated".
    pub fn reject_cookie(&self, cookie: &str) {
        self.invalid_cookies.lock().unwrap().insert(cookie.to_string());
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionCheck for ScriptedChecker {
    async fn validate(
        &self,
        _tenant: &TenantId,
        cookie_jar: &str,
    ) -> Result<CheckOutcome, PortalError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let authenticated = !self.invalid_cookies.lock().unwrap().contains(cookie_jar);
        Ok(CheckOutcome {
            authenticated,
            cookie_jar: cookie_jar.to_string(),
        })
    }

    async fn ping(
        &self,
        _tenant: &TenantId,
        cookie_jar: &str,
        _page: &str,
    ) -> Result<CheckOutcome, PortalError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default);
        let outcome = |authenticated| CheckOutcome {
            authenticated,
            cookie_jar: cookie_jar.to_string(),
        };
        match next {
            Ping::Authenticated => Ok(outcome(true)),
            Ping::NotAuthenticated => Ok(outcome(false)),
            Ping::Timeout => Err(PortalError::PortalUnavailable {
                step: Step::KeepAlivePing,
                kind: UnavailableKind::Timeout,
                source: None,
            }),
            Ping::ServerError => Err(PortalError::server_status(Step::KeepAlivePing, 503)),
        }
    }
}

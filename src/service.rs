//! The engine as the administrative application sees it.
//!
//! Four calls: [`login`](PortalService::login),
//! [`login_with_code`](PortalService::login_with_code),
//! [`is_logged_in`](PortalService::is_logged_in) and
//! [`fetch_records`](PortalService::fetch_records). Outcomes a user can act
//! on (wrong password, wrong code) come back as unsuccessful results; other
//! failures are [`PortalError`]s carrying the step that failed.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::credentials::PortalCredentials;
use crate::error::{PortalError, Step};
use crate::keepalive::KeepAliveScheduler;
use crate::models::{FetchedRecords, TenantId, TenantMeta};
use crate::portal::{
    CaptureCache, CapturedPage, ConfirmationHub, ConfirmationTransport, CookieJar, LoginState,
    LoginStateMachine, OutOfBandFailure, PortalHttpClient, RedirectMode, SessionValidityChecker,
    StoreCookieSink, StructuredDataScraper,
};
use crate::storage::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginResult {
    pub success: bool,
    /// A confirmation code (or out-of-band approval) is still required.
    pub needs_code: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// No further codes will be accepted for this login attempt.
    pub attempts_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub success: bool,
    pub message: String,
}

pub struct PortalServiceBuilder {
    config: Config,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    transport: Option<Arc<dyn ConfirmationTransport>>,
}

impl PortalServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enables out-of-band confirmation and re-authentication.
    pub fn confirmation_transport(mut self, transport: Arc<dyn ConfirmationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<PortalService> {
        let capture = Arc::new(CaptureCache::new(
            self.config.capture.capacity,
            self.config.capture.ttl,
        ));
        let http = Arc::new(
            PortalHttpClient::builder(self.config.portal.clone())
                .cookie_sink(Arc::new(StoreCookieSink::new(Arc::clone(&self.store))))
                .capture_cache(Arc::clone(&capture))
                .build()?,
        );

        let mut login = LoginStateMachine::new(
            Arc::clone(&http),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.login.clone(),
            self.config.confirmation.clone(),
        );
        if let Some(transport) = self.transport {
            login = login.with_transport(transport);
        }
        let login = Arc::new(login);

        let checker = Arc::new(SessionValidityChecker::new(
            Arc::clone(&http),
            &self.config.portal,
        ));
        let scraper = StructuredDataScraper::new(Arc::clone(&http), self.config.records.clone())
            .with_reauthenticator(login.clone());

        Ok(PortalService {
            config: self.config,
            store: self.store,
            clock: self.clock,
            http,
            capture,
            login,
            checker,
            scraper,
        })
    }
}

pub struct PortalService {
    config: Config,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    http: Arc<PortalHttpClient>,
    capture: Arc<CaptureCache>,
    login: Arc<LoginStateMachine>,
    checker: Arc<SessionValidityChecker>,
    scraper: StructuredDataScraper,
}

impl PortalService {
    pub fn builder(config: Config, store: Arc<dyn SessionStore>) -> PortalServiceBuilder {
        PortalServiceBuilder {
            config,
            store,
            clock: Arc::new(SystemClock),
            transport: None,
        }
    }

    /// Submit credentials. On success a confirmation is pending.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        tenant: &TenantId,
    ) -> Result<LoginResult, PortalError> {
        let credentials = PortalCredentials::new(username, password);
        match self.login.login(&credentials, tenant).await {
            Ok(ticket) => {
                info!(tenant = %tenant, out_of_band = ticket.out_of_band, "credentials accepted");
                Ok(LoginResult {
                    success: true,
                    needs_code: true,
                    message: None,
                })
            }
            Err(PortalError::InvalidCredentials { message }) => Ok(LoginResult {
                success: false,
                needs_code: false,
                message: Some(message),
            }),
            Err(err) => Err(err),
        }
    }

    /// Complete a pending login with a manually entered code.
    pub async fn login_with_code(
        &self,
        code: &str,
        tenant: &TenantId,
    ) -> Result<CodeResult, PortalError> {
        match self.login.submit_code(code, tenant).await {
            Ok(()) => Ok(CodeResult {
                success: true,
                message: None,
                attempts_exhausted: false,
            }),
            Err(PortalError::CodeRejected {
                message,
                attempts_exhausted,
            }) => Ok(CodeResult {
                success: false,
                message: Some(message),
                attempts_exhausted,
            }),
            Err(err) => Err(err),
        }
    }

    /// Check the stored session against the portal's home page.
    pub async fn is_logged_in(&self, tenant: &TenantId) -> Result<SessionStatus, PortalError> {
        let session = self
            .store
            .get_session(tenant)
            .await
            .map_err(PortalError::Store)?;
        let Some(session) = session.filter(|s| s.has_cookie()) else {
            return Ok(SessionStatus {
                success: false,
                message: "no stored session".to_string(),
            });
        };

        let mut jar = CookieJar::parse(&session.cookie_jar);
        let authenticated = self
            .checker
            .check(tenant, &mut jar, &self.config.portal.home_path, Step::HomeCheck)
            .await?;
        if authenticated {
            self.store
                .touch(tenant, self.clock.now())
                .await
                .map_err(PortalError::Store)?;
            Ok(SessionStatus {
                success: true,
                message: "session active".to_string(),
            })
        } else {
            self.store
                .mark_invalid(tenant)
                .await
                .map_err(PortalError::Store)?;
            Ok(SessionStatus {
                success: false,
                message: "session expired".to_string(),
            })
        }
    }

    /// Scrape every record category starting from `page_html`, a records
    /// page already loaded with `cookie_jar`.
    pub async fn fetch_records(
        &self,
        cookie_jar: &str,
        page_html: &str,
        tenant: &TenantMeta,
        credentials: Option<&PortalCredentials>,
    ) -> Result<FetchedRecords, PortalError> {
        let records = self
            .scraper
            .fetch_records(cookie_jar, page_html, tenant, credentials)
            .await?;
        self.store
            .touch(&tenant.tenant_id, self.clock.now())
            .await
            .map_err(PortalError::Store)?;
        Ok(records)
    }

    /// Load the records page with the stored cookie, then scrape it.
    pub async fn fetch_stored_records(
        &self,
        tenant: &TenantMeta,
        credentials: Option<&PortalCredentials>,
    ) -> Result<FetchedRecords, PortalError> {
        let cookie_jar = self
            .store
            .get_session(&tenant.tenant_id)
            .await
            .map_err(PortalError::Store)?
            .map(|s| s.cookie_jar)
            .unwrap_or_default();

        let mut jar = CookieJar::parse(&cookie_jar);
        let page = self
            .http
            .get(
                &tenant.tenant_id,
                &mut jar,
                &self.config.records.page_path,
                RedirectMode::Follow,
                Step::RecordsPage,
            )
            .await?;
        self.fetch_records(&jar.header_value(), page.body(), tenant, credentials)
            .await
    }

    /// A keep-alive scheduler probing through this service's client.
    pub fn keepalive_scheduler(&self) -> KeepAliveScheduler {
        KeepAliveScheduler::new(
            self.checker.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.keepalive.clone(),
        )
    }

    /// Where the real-time channel delivers confirmation push events.
    pub fn confirmation_hub(&self) -> &Arc<ConfirmationHub> {
        self.login.hub()
    }

    pub fn login_state(&self, tenant: &TenantId) -> LoginState {
        self.login.state(tenant)
    }

    /// Why the out-of-band approval of the latest login stopped early.
    pub fn out_of_band_failure(&self, tenant: &TenantId) -> Option<OutOfBandFailure> {
        self.login.out_of_band_failure(tenant)
    }

    pub fn has_pending_confirmation(&self, tenant: &TenantId) -> bool {
        self.login.pending().contains(tenant)
    }

    /// A page captured when parsing failed.
    pub fn captured_page(&self, id: &Uuid) -> Option<CapturedPage> {
        self.capture.get(id)
    }
}

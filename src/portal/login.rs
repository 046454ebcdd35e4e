//! Multi-step portal login.
//!
//! ```text
//! Init -> FetchLoginPage -> SubmitCredentials -> Rejected
//!                                             -> ConfirmPending -> AwaitingConfirmation
//!     AwaitingConfirmation -> Confirmed                      (out-of-band approval)
//!     AwaitingConfirmation -> CodeSubmitted -> Accepted      (manual code)
//!                                           -> CodeRejected  (attempts exhausted)
//!     AwaitingConfirmation -> TimedOut
//! ```
//!
//! Credential and code postbacks run with redirects disabled: the portal
//! signals success only through the redirect target.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConfirmationConfig, LoginConfig};
use crate::credentials::PortalCredentials;
use crate::error::{PortalError, Step};
use crate::models::TenantId;
use crate::storage::SessionStore;

use super::confirm::{
    hide_id, mask_peer_id, ConfirmationHub, ConfirmationTransport, PendingConfirmation,
    PendingConfirmations,
};
use super::cookies::CookieJar;
use super::form::{element_text_by_id, extract_hidden_fields, first_iframe_src};
use super::http::{portal_relative_location, PortalHttpClient, PortalResponse, RedirectMode};
use super::scraper::Reauthenticator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Init,
    FetchLoginPage,
    SubmitCredentials,
    Rejected,
    ConfirmPending,
    AwaitingConfirmation,
    Confirmed,
    CodeSubmitted,
    Accepted,
    CodeRejected,
    TimedOut,
    /// An out-of-band step errored during re-authentication.
    Failed,
}

impl LoginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginState::Init => "init",
            LoginState::FetchLoginPage => "fetch_login_page",
            LoginState::SubmitCredentials => "submit_credentials",
            LoginState::Rejected => "rejected",
            LoginState::ConfirmPending => "confirm_pending",
            LoginState::AwaitingConfirmation => "awaiting_confirmation",
            LoginState::Confirmed => "confirmed",
            LoginState::CodeSubmitted => "code_submitted",
            LoginState::Accepted => "accepted",
            LoginState::CodeRejected => "code_rejected",
            LoginState::TimedOut => "timed_out",
            LoginState::Failed => "failed",
        }
    }

    /// Logged in.
    pub fn is_success(&self) -> bool {
        matches!(self, LoginState::Confirmed | LoginState::Accepted)
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the portal answered a credential or code postback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { message: String },
}

/// Accepted iff a 3xx whose location is exactly the success path, either
/// relative or on the portal's own origin.
pub fn classify_credentials_response(
    response: &PortalResponse,
    config: &LoginConfig,
    portal_base: &Url,
) -> Verdict {
    let accepted = match response {
        PortalResponse::Redirect {
            status, location, ..
        } => {
            (300..400).contains(status)
                && portal_relative_location(location, portal_base)
                    == Some(config.success_redirect_path.as_str())
        }
        PortalResponse::Page { .. } => false,
    };
    if accepted {
        return Verdict::Accepted;
    }
    Verdict::Rejected {
        message: visible_error(
            response.body(),
            &config.error_element_id,
            &config.default_error_message,
        ),
    }
}

/// Accepted iff a 3xx whose location contains the code success fragment.
pub fn classify_code_response(response: &PortalResponse, config: &LoginConfig) -> Verdict {
    let accepted = match response {
        PortalResponse::Redirect {
            status, location, ..
        } => (300..400).contains(status) && location.contains(&config.code_success_fragment),
        PortalResponse::Page { .. } => false,
    };
    if accepted {
        return Verdict::Accepted;
    }
    Verdict::Rejected {
        message: visible_error(
            response.body(),
            &config.code_error_element_id,
            &config.default_code_error_message,
        ),
    }
}

fn visible_error(body: &str, element_id: &str, default: &str) -> String {
    element_text_by_id(body, element_id)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// The `token` query parameter of the confirmation iframe, or the raw
/// iframe `src` when it has none.
pub fn extract_confirmation_token(html: &str) -> Option<String> {
    let src = first_iframe_src(html)?;
    let token = src
        .split_once('?')
        .map(|(_, query)| query.split('#').next().unwrap_or(query))
        .and_then(|query| {
            query.split('&').find_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                (name == "token").then(|| {
                    urlencoding::decode(&value.replace('+', " "))
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| value.to_string())
                })
            })
        })
        .filter(|token| !token.is_empty());
    Some(token.unwrap_or(src))
}

/// Returned once the credentials were accepted and a confirmation is pending.
#[derive(Debug, Clone)]
pub struct ConfirmationTicket {
    pub confirmation_token: String,
    pub expires_at: DateTime<Utc>,
    /// An out-of-band approval is being awaited alongside manual entry.
    pub out_of_band: bool,
}

/// Why the out-of-band approval stopped before the confirmation window ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfBandFailure {
    pub step: Option<Step>,
    pub message: String,
}

impl OutOfBandFailure {
    fn from_error(err: &PortalError) -> Self {
        Self {
            step: err.step(),
            message: err.to_string(),
        }
    }
}

struct Started {
    token: String,
    jar: CookieJar,
    expires_at: DateTime<Utc>,
}

pub struct LoginStateMachine {
    http: Arc<PortalHttpClient>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    login: LoginConfig,
    confirmation: ConfirmationConfig,
    hub: Arc<ConfirmationHub>,
    transport: Option<Arc<dyn ConfirmationTransport>>,
    pending: PendingConfirmations,
    states: Mutex<HashMap<TenantId, LoginState>>,
    failures: Mutex<HashMap<TenantId, OutOfBandFailure>>,
}

impl LoginStateMachine {
    pub fn new(
        http: Arc<PortalHttpClient>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        login: LoginConfig,
        confirmation: ConfirmationConfig,
    ) -> Self {
        let hub = ConfirmationHub::new(confirmation.proceed_event.clone());
        Self {
            http,
            store,
            clock,
            login,
            confirmation,
            hub,
            transport: None,
            pending: PendingConfirmations::new(),
            states: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ConfirmationTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Hub the real-time channel delivers push events into.
    pub fn hub(&self) -> &Arc<ConfirmationHub> {
        &self.hub
    }

    pub fn pending(&self) -> &PendingConfirmations {
        &self.pending
    }

    pub fn state(&self, tenant: &TenantId) -> LoginState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(tenant).copied())
            .unwrap_or(LoginState::Init)
    }

    /// The error that ended the latest out-of-band attempt early, if any.
    pub fn out_of_band_failure(&self, tenant: &TenantId) -> Option<OutOfBandFailure> {
        self.failures
            .lock()
            .ok()
            .and_then(|failures| failures.get(tenant).cloned())
    }

    fn record_failure(&self, tenant: &TenantId, err: &PortalError) {
        warn!(tenant = %tenant, step = ?err.step(), error = %err, "out-of-band confirmation failed");
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(tenant.clone(), OutOfBandFailure::from_error(err));
        }
    }

    fn clear_failure(&self, tenant: &TenantId) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(tenant);
        }
    }

    fn enter(&self, tenant: &TenantId, next: LoginState) {
        let previous = match self.states.lock() {
            Ok(mut states) => states.insert(tenant.clone(), next),
            Err(_) => None,
        };
        debug!(
            tenant = %tenant,
            from = previous.unwrap_or(LoginState::Init).as_str(),
            to = next.as_str(),
            "login state"
        );
    }

    /// Submit credentials and open a pending confirmation.
    ///
    /// With a transport configured the out-of-band approval is awaited in
    /// the background; either way a manual code can be entered with
    /// [`submit_code`](Self::submit_code) until the confirmation times out.
    pub async fn login(
        self: &Arc<Self>,
        credentials: &PortalCredentials,
        tenant: &TenantId,
    ) -> Result<ConfirmationTicket, PortalError> {
        let started = self.begin(credentials, tenant).await?;
        let ticket = ConfirmationTicket {
            confirmation_token: started.token.clone(),
            expires_at: started.expires_at,
            out_of_band: self.transport.is_some(),
        };

        let machine = Arc::clone(self);
        let task_tenant = tenant.clone();
        let token = started.token.clone();
        let deadline = Instant::now() + self.confirmation.timeout;
        let task = tokio::spawn(async move {
            if let Some(transport) = machine.transport.clone() {
                match machine
                    .confirm_out_of_band(transport.as_ref(), &task_tenant, &token, started.jar)
                    .await
                {
                    Ok(_) => {
                        if machine.pending.finish(&task_tenant, &token) {
                            machine.enter(&task_tenant, LoginState::Confirmed);
                        }
                        return;
                    }
                    Err(PortalError::ConfirmationTimeout { .. }) => {}
                    // A manual code can still be entered until the window closes.
                    Err(err) => machine.record_failure(&task_tenant, &err),
                }
            }
            tokio::time::sleep_until(deadline).await;
            if machine.pending.finish(&task_tenant, &token) {
                info!(tenant = %task_tenant, "confirmation window closed");
                machine.enter(&task_tenant, LoginState::TimedOut);
            }
        });
        self.pending.attach(tenant, &ticket.confirmation_token, task);

        Ok(ticket)
    }

    /// Submit a manually entered confirmation code.
    pub async fn submit_code(&self, code: &str, tenant: &TenantId) -> Result<(), PortalError> {
        let (token, mut jar, _) = self
            .pending
            .snapshot(tenant, self.clock.now())
            .ok_or_else(|| PortalError::NoPendingConfirmation {
                tenant: tenant.clone(),
            })?;

        let code = code.trim();
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(PortalError::CodeRejected {
                message: self.login.default_code_error_message.clone(),
                attempts_exhausted: false,
            });
        }

        self.enter(tenant, LoginState::CodeSubmitted);
        let page = self
            .http
            .get(
                tenant,
                &mut jar,
                &self.login.confirmation_path,
                RedirectMode::Follow,
                Step::SubmitCode,
            )
            .await?;
        let form = extract_hidden_fields(page.body())
            .postback(&self.login.code_event_target, "")
            .with(&self.login.code_field, code)
            .into_pairs();
        let response = self
            .http
            .post_form(
                tenant,
                &mut jar,
                &self.login.confirmation_path,
                &form,
                RedirectMode::Manual,
                Step::SubmitCode,
            )
            .await?;

        match classify_code_response(&response, &self.login) {
            Verdict::Accepted => {
                // Dropping the pending confirmation aborts the out-of-band wait.
                drop(self.pending.take(tenant, &token));
                self.complete(tenant, &jar).await?;
                self.enter(tenant, LoginState::Accepted);
                info!(tenant = %tenant, "confirmation code accepted");
                Ok(())
            }
            Verdict::Rejected { message } => {
                let attempts = self.pending.record_attempt(tenant, &token, jar);
                let attempts_exhausted = attempts >= self.login.max_code_attempts;
                if attempts_exhausted {
                    drop(self.pending.take(tenant, &token));
                    self.enter(tenant, LoginState::CodeRejected);
                } else {
                    self.enter(tenant, LoginState::AwaitingConfirmation);
                }
                info!(tenant = %tenant, attempts, attempts_exhausted, "confirmation code rejected");
                Err(PortalError::CodeRejected {
                    message,
                    attempts_exhausted,
                })
            }
        }
    }

    async fn begin(
        &self,
        credentials: &PortalCredentials,
        tenant: &TenantId,
    ) -> Result<Started, PortalError> {
        let mut jar = CookieJar::new();
        self.clear_failure(tenant);

        self.enter(tenant, LoginState::FetchLoginPage);
        let page = self
            .http
            .get(
                tenant,
                &mut jar,
                &self.login.login_path,
                RedirectMode::Follow,
                Step::FetchLoginPage,
            )
            .await?;
        let fields = extract_hidden_fields(page.body());
        if fields.is_empty() {
            warn!(tenant = %tenant, "login page has no hidden fields");
        }

        self.enter(tenant, LoginState::SubmitCredentials);
        let form = fields
            .with(&self.login.username_field, credentials.username())
            .with(&self.login.password_field, credentials.expose_password())
            .with(&self.login.submit_field, self.login.submit_value.as_str())
            .into_pairs();
        let response = self
            .http
            .post_form(
                tenant,
                &mut jar,
                &self.login.login_path,
                &form,
                RedirectMode::Manual,
                Step::SubmitCredentials,
            )
            .await?;

        if let Verdict::Rejected { message } =
            classify_credentials_response(&response, &self.login, self.http.base_url())
        {
            self.enter(tenant, LoginState::Rejected);
            info!(tenant = %tenant, status = response.status(), "credentials rejected");
            return Err(PortalError::InvalidCredentials { message });
        }

        self.enter(tenant, LoginState::ConfirmPending);
        let confirmation_page = self
            .http
            .get(
                tenant,
                &mut jar,
                &self.login.confirmation_path,
                RedirectMode::Follow,
                Step::ConfirmationPage,
            )
            .await?;
        let token = extract_confirmation_token(confirmation_page.body()).ok_or_else(|| {
            self.http.parse_error(
                tenant,
                Step::ConfirmationPage,
                "confirmation iframe missing",
                confirmation_page.body(),
            )
        })?;

        let now = self.clock.now();
        let pending =
            PendingConfirmation::new(token.clone(), jar.clone(), now, self.confirmation.timeout);
        let expires_at = pending.timeout_at;
        self.pending.insert(tenant, pending);
        self.enter(tenant, LoginState::AwaitingConfirmation);

        Ok(Started {
            token,
            jar,
            expires_at,
        })
    }

    async fn confirm_out_of_band(
        &self,
        transport: &dyn ConfirmationTransport,
        tenant: &TenantId,
        token: &str,
        mut jar: CookieJar,
    ) -> Result<CookieJar, PortalError> {
        let timeout = self.confirmation.timeout;
        let deadline = Instant::now() + timeout;
        let timed_out = || PortalError::ConfirmationTimeout {
            tenant: tenant.clone(),
            waited: timeout,
        };

        let peer_id = tokio::time::timeout(
            timeout,
            transport.request_confirmation(tenant, &self.confirmation.request_event),
        )
        .await
        .map_err(|_| timed_out())??;
        self.pending.set_correlation(tenant, token, &peer_id);
        let waiter = self.hub.register(&peer_id);
        debug!(tenant = %tenant, peer = %mask_peer_id(&peer_id), "confirmation requested");

        let verify_url = format!(
            "{}?token={}&verify={}",
            self.confirmation.verify_url,
            urlencoding::encode(token),
            urlencoding::encode(&hide_id(&peer_id)),
        );
        let verified = self
            .http
            .get_external(tenant, &verify_url, Step::Verify)
            .await?;
        if !(200..300).contains(&verified.status()) {
            return Err(self.http.parse_error(
                tenant,
                Step::Verify,
                format!("verify endpoint answered {}", verified.status()),
                verified.body(),
            ));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let param = waiter
            .wait(tenant, remaining.max(Duration::from_millis(1)))
            .await
            .map_err(|_| timed_out())?;

        let finalize_path = self
            .confirmation
            .finalize_path
            .replace("{param}", &urlencoding::encode(&param))
            .replace("{peer}", &urlencoding::encode(&mask_peer_id(&peer_id)));
        let finalized = self
            .http
            .get(
                tenant,
                &mut jar,
                &finalize_path,
                RedirectMode::Follow,
                Step::Finalize,
            )
            .await?;
        if finalized.status() != 200 {
            return Err(self.http.parse_error(
                tenant,
                Step::Finalize,
                format!("finalize answered {}", finalized.status()),
                finalized.body(),
            ));
        }

        self.complete(tenant, &jar).await?;
        info!(tenant = %tenant, "out-of-band confirmation completed");
        Ok(jar)
    }

    async fn complete(&self, tenant: &TenantId, jar: &CookieJar) -> Result<(), PortalError> {
        self.store
            .replace_cookie(tenant, &jar.header_value())
            .await
            .map_err(PortalError::Store)?;
        self.store
            .record_login(tenant, self.clock.now())
            .await
            .map_err(PortalError::Store)
    }
}

#[async_trait::async_trait]
impl Reauthenticator for LoginStateMachine {
    /// Log in again and wait for the out-of-band approval inline.
    async fn reauthenticate(
        &self,
        credentials: &PortalCredentials,
        tenant: &TenantId,
    ) -> Result<CookieJar, PortalError> {
        let Some(transport) = self.transport.clone() else {
            return Err(PortalError::ManualCodeRequired {
                tenant: tenant.clone(),
            });
        };

        let started = self.begin(credentials, tenant).await?;
        let token = started.token;
        let result = self
            .confirm_out_of_band(transport.as_ref(), tenant, &token, started.jar)
            .await;
        if self.pending.finish(tenant, &token) {
            let next = match &result {
                Ok(_) => LoginState::Confirmed,
                Err(PortalError::ConfirmationTimeout { .. }) => LoginState::TimedOut,
                Err(err) => {
                    self.record_failure(tenant, err);
                    LoginState::Failed
                }
            };
            self.enter(tenant, next);
        }
        result
    }
}

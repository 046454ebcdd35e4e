//! Cookie-aware HTTP client for the portal.
//!
//! The underlying `reqwest` client never follows redirects on its own. In
//! [`RedirectMode::Manual`] a 3xx comes back as [`PortalResponse::Redirect`]
//! so the login flow can match on where the portal sent it; in
//! [`RedirectMode::Follow`] hops are followed here, one GET at a time, so
//! cookies set on intermediate hops still land in the tenant's jar.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{COOKIE, LOCATION, REFERER, SET_COOKIE};
use reqwest::{Client, Method, Url};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PortalConfig;
use crate::error::{PortalError, Step};
use crate::models::TenantId;
use crate::storage::SessionStore;

use super::capture::CaptureCache;
use super::cookies::CookieJar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    Follow,
    Manual,
}

/// What the portal answered, with redirects kept as data.
#[derive(Debug, Clone)]
pub enum PortalResponse {
    Page {
        status: u16,
        url: Url,
        body: String,
    },
    Redirect {
        status: u16,
        location: String,
        body: String,
    },
}

impl PortalResponse {
    pub fn status(&self) -> u16 {
        match self {
            PortalResponse::Page { status, .. } | PortalResponse::Redirect { status, .. } => {
                *status
            }
        }
    }

    pub fn body(&self) -> &str {
        match self {
            PortalResponse::Page { body, .. } | PortalResponse::Redirect { body, .. } => body,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            PortalResponse::Redirect { location, .. } => Some(location),
            PortalResponse::Page { .. } => None,
        }
    }
}

/// A `Location` value relative to the portal: unchanged when it is already
/// relative, with the origin stripped when it names the portal's own origin,
/// `None` when it points anywhere else. Query and fragment are kept.
pub fn portal_relative_location<'a>(location: &'a str, base: &Url) -> Option<&'a str> {
    let Some(scheme_end) = location.find("://") else {
        return Some(location);
    };
    let absolute = Url::parse(location).ok()?;
    if absolute.origin() != base.origin() {
        return None;
    }
    let rest = &location[scheme_end + 3..];
    Some(rest.find(['/', '?', '#']).map(|i| &rest[i..]).unwrap_or("/"))
}

/// Receives a tenant's jar whenever the portal changed it.
#[async_trait::async_trait]
pub trait CookieSink: Send + Sync {
    async fn cookies_changed(&self, tenant: &TenantId, jar: &CookieJar) -> Result<()>;
}

/// Persists changed jars into the session store.
pub struct StoreCookieSink {
    store: Arc<dyn SessionStore>,
}

impl StoreCookieSink {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl CookieSink for StoreCookieSink {
    async fn cookies_changed(&self, tenant: &TenantId, jar: &CookieJar) -> Result<()> {
        self.store.replace_cookie(tenant, &jar.header_value()).await
    }
}

pub struct PortalHttpClientBuilder {
    config: PortalConfig,
    sink: Option<Arc<dyn CookieSink>>,
    capture: Option<Arc<CaptureCache>>,
}

impl PortalHttpClientBuilder {
    pub fn cookie_sink(mut self, sink: Arc<dyn CookieSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn capture_cache(mut self, capture: Arc<CaptureCache>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn build(self) -> Result<PortalHttpClient> {
        let base_url = Url::parse(&self.config.base_url)
            .with_context(|| format!("Invalid portal base URL: {}", self.config.base_url))?;

        let http = Client::builder()
            .user_agent(self.config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.config.request_timeout)
            .connect_timeout(self.config.request_timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(PortalHttpClient {
            http,
            base_url,
            max_redirects: self.config.max_redirects,
            sink: self.sink,
            capture: self.capture,
        })
    }
}

pub struct PortalHttpClient {
    http: Client,
    base_url: Url,
    max_redirects: usize,
    sink: Option<Arc<dyn CookieSink>>,
    capture: Option<Arc<CaptureCache>>,
}

impl PortalHttpClient {
    pub fn builder(config: PortalConfig) -> PortalHttpClientBuilder {
        PortalHttpClientBuilder {
            config,
            sink: None,
            capture: None,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a portal path (or an absolute URL) against the base URL.
    pub fn url(&self, target: &str, step: Step) -> Result<Url, PortalError> {
        self.base_url
            .join(target)
            .map_err(|e| PortalError::parse(step, format!("invalid URL {target:?}: {e}")))
    }

    /// Keep a page for later inspection, if a capture cache is attached.
    pub fn capture(&self, tenant: &TenantId, step: Step, body: &str) -> Option<Uuid> {
        self.capture
            .as_ref()
            .and_then(|cache| cache.capture(tenant, step, body))
    }

    /// Build a parse error that references a captured copy of `body`.
    pub fn parse_error(
        &self,
        tenant: &TenantId,
        step: Step,
        detail: impl Into<String>,
        body: &str,
    ) -> PortalError {
        let capture = self.capture(tenant, step, body);
        PortalError::Parse {
            step,
            detail: detail.into(),
            capture,
        }
    }

    pub async fn get(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        target: &str,
        mode: RedirectMode,
        step: Step,
    ) -> Result<PortalResponse, PortalError> {
        let url = self.url(target, step)?;
        self.execute(tenant, jar, Method::GET, url, None, mode, step)
            .await
    }

    pub async fn post_form(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        target: &str,
        form: &[(String, String)],
        mode: RedirectMode,
        step: Step,
    ) -> Result<PortalResponse, PortalError> {
        let url = self.url(target, step)?;
        self.execute(tenant, jar, Method::POST, url, Some(form), mode, step)
            .await
    }

    /// GET an absolute URL outside the portal. No tenant cookies are sent
    /// and nothing the response sets is kept.
    pub async fn get_external(
        &self,
        tenant: &TenantId,
        url: &str,
        step: Step,
    ) -> Result<PortalResponse, PortalError> {
        let url = Url::parse(url)
            .map_err(|e| PortalError::parse(step, format!("invalid URL {url:?}: {e}")))?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PortalError::from_transport(step, e))?;
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| PortalError::from_transport(step, e))?;

        debug!(tenant = %tenant, step = %step, host = url.host_str().unwrap_or_default(), status = status.as_u16(), "external response");

        if status.is_server_error() {
            return Err(PortalError::server_status(step, status.as_u16()));
        }
        match location {
            Some(location) if status.is_redirection() => Ok(PortalResponse::Redirect {
                status: status.as_u16(),
                location,
                body,
            }),
            _ => Ok(PortalResponse::Page {
                status: status.as_u16(),
                url,
                body,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        method: Method,
        url: Url,
        form: Option<&[(String, String)]>,
        mode: RedirectMode,
        step: Step,
    ) -> Result<PortalResponse, PortalError> {
        let mut response = self
            .send_once(tenant, jar, method, url.clone(), form, None, step)
            .await?;

        if mode == RedirectMode::Manual {
            return Ok(response);
        }

        let mut hops = 0;
        let mut referer = url;
        while let PortalResponse::Redirect {
            status, location, ..
        } = &response
        {
            if hops >= self.max_redirects {
                return Err(PortalError::UnexpectedRedirect {
                    step,
                    status: *status,
                    location: location.clone(),
                });
            }
            hops += 1;

            let next = referer.join(location).map_err(|e| {
                PortalError::parse(step, format!("invalid redirect location {location:?}: {e}"))
            })?;
            debug!(tenant = %tenant, step = %step, hop = hops, path = next.path(), "following redirect");
            response = self
                .send_once(
                    tenant,
                    jar,
                    Method::GET,
                    next.clone(),
                    None,
                    Some(&referer),
                    step,
                )
                .await?;
            referer = next;
        }

        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        method: Method,
        url: Url,
        form: Option<&[(String, String)]>,
        referer: Option<&Url>,
        step: Step,
    ) -> Result<PortalResponse, PortalError> {
        let mut req = self.http.request(method.clone(), url.clone());
        if !jar.is_empty() {
            req = req.header(COOKIE, jar.header_value());
        }
        if let Some(referer) = referer {
            req = req.header(REFERER, referer.as_str());
        }
        if let Some(form) = form {
            req = req.header(REFERER, url.as_str()).form(form);
        }

        let response = req
            .send()
            .await
            .map_err(|e| PortalError::from_transport(step, e))?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut changed = false;
        for value in response.headers().get_all(SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                changed |= jar.apply_set_cookie(raw);
            }
        }
        if changed {
            self.persist(tenant, jar).await;
        }

        let body = response
            .text()
            .await
            .map_err(|e| PortalError::from_transport(step, e))?;

        debug!(
            tenant = %tenant,
            step = %step,
            method = %method,
            path = url.path(),
            status = status.as_u16(),
            body_len = body.len(),
            "portal response"
        );

        if status.is_server_error() {
            return Err(PortalError::server_status(step, status.as_u16()));
        }

        if status.is_redirection() {
            if let Some(location) = location {
                return Ok(PortalResponse::Redirect {
                    status: status.as_u16(),
                    location,
                    body,
                });
            }
        }

        Ok(PortalResponse::Page {
            status: status.as_u16(),
            url,
            body,
        })
    }

    async fn persist(&self, tenant: &TenantId, jar: &CookieJar) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };
        if let Err(err) = sink.cookies_changed(tenant, jar).await {
            warn!(tenant = %tenant, cookies = jar.len(), error = %err, "failed to persist portal cookies");
        }
    }
}

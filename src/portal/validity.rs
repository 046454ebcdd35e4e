use std::sync::Arc;

use tracing::debug;

use crate::config::PortalConfig;
use crate::error::{PortalError, Step};
use crate::models::TenantId;

use super::cookies::CookieJar;
use super::form::element_text_by_id;
use super::http::{PortalHttpClient, PortalResponse, RedirectMode};

/// Result of one authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub authenticated: bool,
    /// The jar after the request, including anything the portal set.
    pub cookie_jar: String,
}

/// Authenticated page checks, as the keep-alive scheduler needs them.
#[async_trait::async_trait]
pub trait SessionCheck: Send + Sync {
    /// Check the home page with `cookie_jar`.
    async fn validate(&self, tenant: &TenantId, cookie_jar: &str)
        -> Result<CheckOutcome, PortalError>;

    /// Visit `page` with `cookie_jar`.
    async fn ping(
        &self,
        tenant: &TenantId,
        cookie_jar: &str,
        page: &str,
    ) -> Result<CheckOutcome, PortalError>;
}

/// Decides whether a stored cookie still authenticates.
///
/// A page is authenticated iff it answered 200 and the user-name element
/// has text. Anything else, including a 200 login page or a redirect, is
/// not.
pub struct SessionValidityChecker {
    http: Arc<PortalHttpClient>,
    home_path: String,
    user_marker_id: String,
}

impl SessionValidityChecker {
    pub fn new(http: Arc<PortalHttpClient>, config: &PortalConfig) -> Self {
        Self {
            http,
            home_path: config.home_path.clone(),
            user_marker_id: config.user_marker_id.clone(),
        }
    }

    pub fn is_authenticated(&self, response: &PortalResponse) -> bool {
        is_authenticated_page(response, &self.user_marker_id)
    }

    /// GET `path` with the jar; redirects are not followed.
    pub async fn check(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        path: &str,
        step: Step,
    ) -> Result<bool, PortalError> {
        let response = self
            .http
            .get(tenant, jar, path, RedirectMode::Manual, step)
            .await?;
        let authenticated = self.is_authenticated(&response);
        debug!(tenant = %tenant, path, status = response.status(), authenticated, "session check");
        Ok(authenticated)
    }

    async fn check_page(
        &self,
        tenant: &TenantId,
        cookie_jar: &str,
        path: &str,
        step: Step,
    ) -> Result<CheckOutcome, PortalError> {
        let mut jar = CookieJar::parse(cookie_jar);
        if jar.is_empty() {
            return Ok(CheckOutcome {
                authenticated: false,
                cookie_jar: String::new(),
            });
        }
        let authenticated = self.check(tenant, &mut jar, path, step).await?;
        Ok(CheckOutcome {
            authenticated,
            cookie_jar: jar.header_value(),
        })
    }
}

#[async_trait::async_trait]
impl SessionCheck for SessionValidityChecker {
    async fn validate(
        &self,
        tenant: &TenantId,
        cookie_jar: &str,
    ) -> Result<CheckOutcome, PortalError> {
        self.check_page(tenant, cookie_jar, &self.home_path, Step::HomeCheck)
            .await
    }

    async fn ping(
        &self,
        tenant: &TenantId,
        cookie_jar: &str,
        page: &str,
    ) -> Result<CheckOutcome, PortalError> {
        self.check_page(tenant, cookie_jar, page, Step::KeepAlivePing)
            .await
    }
}

pub fn is_authenticated_page(response: &PortalResponse, user_marker_id: &str) -> bool {
    match response {
        PortalResponse::Page { status: 200, body, .. } => element_text_by_id(body, user_marker_id)
            .map(|text| !text.is_empty())
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use reqwest::Url;

    use super::*;

    fn page(status: u16, body: &str) -> PortalResponse {
        PortalResponse::Page {
            status,
            url: Url::parse("https://portal.test/main.aspx").unwrap(),
            body: body.to_string(),
        }
    }

    #[test]
    fn marker_with_text_on_200_is_authenticated() {
        let body = r#"<span id="lblKullaniciAdi">AHMET YILMAZ</span>"#;
        assert!(is_authenticated_page(&page(200, body), "lblKullaniciAdi"));
    }

    #[test]
    fn everything_else_is_not() {
        let marker = "lblKullaniciAdi";
        // login page served with 200
        assert!(!is_authenticated_page(
            &page(200, r#"<input name="txtKullaniciAd" />"#),
            marker
        ));
        assert!(!is_authenticated_page(
            &page(200, r#"<span id="lblKullaniciAdi">  </span>"#),
            marker
        ));
        assert!(!is_authenticated_page(
            &page(403, r#"<span id="lblKullaniciAdi">AHMET</span>"#),
            marker
        ));
        assert!(!is_authenticated_page(
            &PortalResponse::Redirect {
                status: 302,
                location: "/default.aspx".to_string(),
                body: String::new(),
            },
            marker
        ));
    }
}

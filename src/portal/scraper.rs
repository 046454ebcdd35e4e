//! Record scraping from the records page.
//!
//! Each category is one postback that switches the category dropdown; the
//! answer carries a DataGrid table that becomes a list of records keyed by
//! column header.

use std::sync::{Arc, LazyLock};

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::config::{CategoryConfig, RecordsConfig};
use crate::credentials::PortalCredentials;
use crate::error::{PortalError, Step};
use crate::models::{FetchedRecords, RecordCategory, ScrapedRecord, TenantId, TenantMeta};

use super::cookies::CookieJar;
use super::entities::normalize_text;
use super::form::{element_text, extract_hidden_fields, extract_selects, FormFieldSet};
use super::http::{PortalHttpClient, PortalResponse, RedirectMode};

static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table[id]").expect("static selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("static selector"));

/// Recovers an expired session with stored credentials.
#[async_trait::async_trait]
pub trait Reauthenticator: Send + Sync {
    /// Log in again; resolves with the new authenticated jar.
    async fn reauthenticate(
        &self,
        credentials: &PortalCredentials,
        tenant: &TenantId,
    ) -> Result<CookieJar, PortalError>;
}

/// Rows of the table with id `table_id`, or `None` if there is no such
/// table.
///
/// The first row holds the headers. Rows whose cells are all empty are
/// dropped.
pub fn parse_table(html: &str, table_id: &str) -> Option<Vec<ScrapedRecord>> {
    let document = Html::parse_document(html);
    let table = document
        .select(&TABLE)
        .find(|table| table.value().id() == Some(table_id))?;

    let mut rows = table
        .select(&ROW)
        // Rows of nested tables belong to those tables.
        .filter(|row| owning_table(row).map(|t| t.id() == table.id()).unwrap_or(false));

    let Some(header_row) = rows.next() else {
        return Some(Vec::new());
    };
    let headers = unique_headers(cells(&header_row).enumerate().map(|(i, cell)| {
        let text = normalize_text(&element_text(&cell));
        if text.is_empty() {
            format!("column_{}", i + 1)
        } else {
            text
        }
    }));

    let records = rows
        .filter_map(|row| {
            let values: Vec<String> = cells(&row)
                .map(|cell| normalize_text(&element_text(&cell)))
                .collect();
            if values.iter().all(|v| v.is_empty()) {
                return None;
            }
            // Short rows still carry every column.
            let mut values = values.into_iter();
            Some(
                headers
                    .iter()
                    .map(|header| (header.clone(), values.next().unwrap_or_default()))
                    .collect::<ScrapedRecord>(),
            )
        })
        .collect();
    Some(records)
}

/// Repeated header texts get `_2`, `_3`, ... suffixes.
fn unique_headers(headers: impl Iterator<Item = String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for header in headers {
        let mut candidate = header.clone();
        let mut n = 1;
        while unique.contains(&candidate) {
            n += 1;
            candidate = format!("{header}_{n}");
        }
        unique.push(candidate);
    }
    unique
}

fn cells<'a>(row: &ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|cell| matches!(cell.value().name(), "td" | "th"))
}

fn owning_table<'a>(row: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
}

/// Does this response mean the session is gone?
///
/// Either a redirect to a login-like location, or a body that is the login
/// form or an expiry notice.
pub fn is_session_expired(response: &PortalResponse, config: &RecordsConfig) -> bool {
    match response {
        PortalResponse::Redirect { location, .. } => {
            let location = location.to_lowercase();
            config
                .expiry_location_markers
                .iter()
                .any(|marker| location.contains(&marker.to_lowercase()))
        }
        PortalResponse::Page { body, .. } => config
            .expiry_body_markers
            .iter()
            .any(|marker| body.contains(marker.as_str())),
    }
}

pub struct StructuredDataScraper {
    http: Arc<PortalHttpClient>,
    config: RecordsConfig,
    reauth: Option<Arc<dyn Reauthenticator>>,
}

impl StructuredDataScraper {
    pub fn new(http: Arc<PortalHttpClient>, config: RecordsConfig) -> Self {
        Self {
            http,
            config,
            reauth: None,
        }
    }

    pub fn with_reauthenticator(mut self, reauth: Arc<dyn Reauthenticator>) -> Self {
        self.reauth = Some(reauth);
        self
    }

    fn category(&self, category: RecordCategory) -> &CategoryConfig {
        match category {
            RecordCategory::Vehicles => &self.config.vehicles,
            RecordCategory::Simulators => &self.config.simulators,
        }
    }

    /// Fetch every record category, starting from an already loaded records
    /// page.
    ///
    /// On an expired session with `credentials`, logs in once, reloads the
    /// records page and retries once. Without credentials the caller gets
    /// [`PortalError::ManualCodeRequired`].
    pub async fn fetch_records(
        &self,
        cookie_jar: &str,
        page_html: &str,
        tenant: &TenantMeta,
        credentials: Option<&PortalCredentials>,
    ) -> Result<FetchedRecords, PortalError> {
        let tenant_id = &tenant.tenant_id;
        let mut jar = CookieJar::parse(cookie_jar);

        let expired_step = match self.fetch_all(tenant_id, &mut jar, page_html).await {
            Err(PortalError::SessionExpired { step }) => step,
            other => return other,
        };

        let (Some(credentials), Some(reauth)) = (credentials, self.reauth.as_ref()) else {
            info!(tenant = %tenant_id, step = %expired_step, "session expired; manual code required");
            return Err(PortalError::ManualCodeRequired {
                tenant: tenant_id.clone(),
            });
        };

        info!(
            tenant = %tenant_id,
            name = tenant.display_name.as_deref().unwrap_or_default(),
            step = %expired_step,
            "session expired; re-authenticating once"
        );
        let mut jar = reauth.reauthenticate(credentials, tenant_id).await?;

        let page = self
            .http
            .get(
                tenant_id,
                &mut jar,
                &self.config.page_path,
                RedirectMode::Follow,
                Step::RecordsPage,
            )
            .await?;
        if is_session_expired(&page, &self.config) {
            return Err(PortalError::SessionExpired {
                step: Step::RecordsPage,
            });
        }
        self.fetch_all(tenant_id, &mut jar, page.body()).await
    }

    async fn fetch_all(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        page_html: &str,
    ) -> Result<FetchedRecords, PortalError> {
        let mut hidden = extract_hidden_fields(page_html);
        if hidden.is_empty() {
            warn!(tenant = %tenant, "records page has no hidden fields");
        }
        let selects = extract_selects(page_html);
        let selector = selects
            .iter()
            .find(|select| select.name == self.config.selector_field);

        let mut fetched = FetchedRecords::default();
        for category in RecordCategory::ALL {
            let category_config = self.category(category);
            let option_value = selector
                .and_then(|select| select.value_for_label(&category_config.label))
                .unwrap_or(category_config.option_value.as_str())
                .to_string();

            let body = self
                .post_category(tenant, jar, hidden.clone(), &option_value)
                .await?;
            let records = parse_table(&body, &category_config.table_id).ok_or_else(|| {
                self.http.parse_error(
                    tenant,
                    Step::RecordsPostback,
                    format!("table {} not found", category_config.table_id),
                    &body,
                )
            })?;
            debug!(tenant = %tenant, category = ?category, count = records.len(), "records parsed");
            fetched.set(category, records);

            // The next postback must carry the state of the page just rendered.
            let next = extract_hidden_fields(&body);
            if !next.is_empty() {
                hidden = next;
            }
        }
        Ok(fetched)
    }

    async fn post_category(
        &self,
        tenant: &TenantId,
        jar: &mut CookieJar,
        hidden: FormFieldSet,
        option_value: &str,
    ) -> Result<String, PortalError> {
        let form = hidden
            .postback(&self.config.selector_field, "")
            .with(&self.config.selector_field, option_value)
            .into_pairs();
        let response = self
            .http
            .post_form(
                tenant,
                jar,
                &self.config.page_path,
                &form,
                RedirectMode::Manual,
                Step::RecordsPostback,
            )
            .await?;

        if is_session_expired(&response, &self.config) {
            return Err(PortalError::SessionExpired {
                step: Step::RecordsPostback,
            });
        }
        match response {
            PortalResponse::Page {
                status: 200, body, ..
            } => Ok(body),
            PortalResponse::Redirect {
                status, location, ..
            } => Err(PortalError::UnexpectedRedirect {
                step: Step::RecordsPostback,
                status,
                location,
            }),
            PortalResponse::Page { status, body, .. } => Err(self.http.parse_error(
                tenant,
                Step::RecordsPostback,
                format!("records postback answered {status}"),
                &body,
            )),
        }
    }
}

//! Protocol layer for the legacy WebForms portal.

pub mod capture;
pub mod confirm;
pub mod cookies;
pub mod entities;
pub mod form;
pub mod http;
pub mod login;
pub mod scraper;
pub mod validity;

pub use capture::{CaptureCache, CapturedPage};
pub use confirm::{
    hide_id, mask_peer_id, ChannelEvent, ConfirmationHub, ConfirmationTransport,
    ConfirmationWaiter, PendingConfirmation, PendingConfirmations,
};
pub use cookies::CookieJar;
pub use form::{
    element_text_by_id, extract_hidden_fields, extract_selects, FormFieldSet, SelectField,
    SelectOption,
};
pub use http::{
    CookieSink, PortalHttpClient, PortalHttpClientBuilder, PortalResponse, RedirectMode,
    StoreCookieSink,
};
pub use login::{ConfirmationTicket, LoginState, LoginStateMachine, OutOfBandFailure, Verdict};
pub use scraper::{parse_table, Reauthenticator, StructuredDataScraper};
pub use validity::{CheckOutcome, SessionCheck, SessionValidityChecker};

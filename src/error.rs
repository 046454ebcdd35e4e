//! Error taxonomy for portal interactions.
//!
//! Protocol code returns [`PortalError`] so the CRUD layer can tell a bad
//! password from an expired session from a portal outage, and knows which
//! step of the flow failed.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::models::TenantId;

/// The step of a portal flow an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    FetchLoginPage,
    SubmitCredentials,
    ConfirmationPage,
    Verify,
    Finalize,
    SubmitCode,
    HomeCheck,
    KeepAlivePing,
    RecordsPage,
    RecordsPostback,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::FetchLoginPage => "fetch_login_page",
            Step::SubmitCredentials => "submit_credentials",
            Step::ConfirmationPage => "confirmation_page",
            Step::Verify => "verify",
            Step::Finalize => "finalize",
            Step::SubmitCode => "submit_code",
            Step::HomeCheck => "home_check",
            Step::KeepAlivePing => "keepalive_ping",
            Step::RecordsPage => "records_page",
            Step::RecordsPostback => "records_postback",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the portal could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableKind {
    Timeout,
    Connect,
    Reset,
    /// The portal answered with a 5xx.
    Status(u16),
    Other,
}

impl fmt::Display for UnavailableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableKind::Timeout => f.write_str("timed out"),
            UnavailableKind::Connect => f.write_str("connection refused"),
            UnavailableKind::Reset => f.write_str("connection reset"),
            UnavailableKind::Status(code) => write!(f, "server error {code}"),
            UnavailableKind::Other => f.write_str("request failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    /// The portal rejected the username/password. Terminal; shown to the user.
    #[error("{message}")]
    InvalidCredentials { message: String },

    /// The stored cookie no longer authenticates.
    #[error("portal session expired during {step}")]
    SessionExpired { step: Step },

    /// The session expired and no credentials were available to recover it.
    #[error("session for tenant {tenant} expired; a new confirmation code is required")]
    ManualCodeRequired { tenant: TenantId },

    /// Nobody approved the out-of-band confirmation in time.
    #[error("confirmation for tenant {tenant} timed out after {}s", .waited.as_secs())]
    ConfirmationTimeout { tenant: TenantId, waited: Duration },

    /// The portal refused a manually entered code.
    #[error("{message}")]
    CodeRejected {
        message: String,
        attempts_exhausted: bool,
    },

    #[error("no pending confirmation for tenant {tenant}")]
    NoPendingConfirmation { tenant: TenantId },

    /// Network failure, timeout or 5xx.
    #[error("portal unavailable during {step}: {kind}")]
    PortalUnavailable {
        step: Step,
        kind: UnavailableKind,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The portal redirected somewhere the protocol doesn't expect.
    #[error("unexpected redirect during {step}: {status} -> {location}")]
    UnexpectedRedirect {
        step: Step,
        status: u16,
        location: String,
    },

    /// Expected markup is missing; the portal's pages probably changed.
    #[error("could not parse portal response during {step}: {detail}")]
    Parse {
        step: Step,
        detail: String,
        capture: Option<Uuid>,
    },

    #[error("session store failure")]
    Store(#[source] anyhow::Error),
}

impl PortalError {
    pub fn parse(step: Step, detail: impl Into<String>) -> Self {
        PortalError::Parse {
            step,
            detail: detail.into(),
            capture: None,
        }
    }

    /// Classify a transport error from reqwest.
    pub fn from_transport(step: Step, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            UnavailableKind::Timeout
        } else if is_reset(&err) {
            UnavailableKind::Reset
        } else if err.is_connect() {
            UnavailableKind::Connect
        } else {
            UnavailableKind::Other
        };
        PortalError::PortalUnavailable {
            step,
            kind,
            source: Some(err),
        }
    }

    pub fn server_status(step: Step, status: u16) -> Self {
        PortalError::PortalUnavailable {
            step,
            kind: UnavailableKind::Status(status),
            source: None,
        }
    }

    /// Reset, refused and timed-out connections are worth retrying.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            PortalError::PortalUnavailable {
                kind: UnavailableKind::Timeout | UnavailableKind::Connect | UnavailableKind::Reset,
                ..
            }
        )
    }

    /// The CRUD layer should ask the user for a fresh confirmation code.
    pub fn needs_manual_code(&self) -> bool {
        matches!(
            self,
            PortalError::ManualCodeRequired { .. }
                | PortalError::ConfirmationTimeout { .. }
                | PortalError::CodeRejected { .. }
                | PortalError::NoPendingConfirmation { .. }
        )
    }

    /// The CRUD layer should ask the user for new credentials.
    pub fn needs_credentials(&self) -> bool {
        matches!(self, PortalError::InvalidCredentials { .. })
    }

    pub fn step(&self) -> Option<Step> {
        match self {
            PortalError::SessionExpired { step }
            | PortalError::PortalUnavailable { step, .. }
            | PortalError::UnexpectedRedirect { step, .. }
            | PortalError::Parse { step, .. } => Some(*step),
            _ => None,
        }
    }
}

fn is_reset(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        source = current.source();
    }
    false
}

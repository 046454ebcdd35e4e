pub mod clock;
pub mod config;
pub mod credentials;
pub mod duration;
pub mod error;
pub mod keepalive;
pub mod models;
pub mod portal;
pub mod service;
pub mod storage;

pub use error::{PortalError, Step};
pub use service::{CodeResult, LoginResult, PortalService, SessionStatus};

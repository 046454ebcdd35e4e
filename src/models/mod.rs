mod id;
mod record;
mod session;

pub use id::{TenantId, TenantIdError};
pub use record::{FetchedRecords, RecordCategory, ScrapedRecord, TenantMeta};
pub use session::PortalSession;

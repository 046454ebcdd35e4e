use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::TenantId;

/// One table row keyed by normalized column header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrapedRecord(BTreeMap<String, String>);

impl ScrapedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for ScrapedRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Record categories selectable on the records page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Vehicles,
    Simulators,
}

impl RecordCategory {
    pub const ALL: [RecordCategory; 2] = [RecordCategory::Vehicles, RecordCategory::Simulators];
}

/// Everything one `fetch_records` call returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedRecords {
    pub vehicles: Vec<ScrapedRecord>,
    pub simulators: Vec<ScrapedRecord>,
}

impl FetchedRecords {
    pub fn set(&mut self, category: RecordCategory, records: Vec<ScrapedRecord>) {
        match category {
            RecordCategory::Vehicles => self.vehicles = records,
            RecordCategory::Simulators => self.simulators = records,
        }
    }
}

/// What the CRUD layer tells us about the tenant a fetch runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMeta {
    pub tenant_id: TenantId,
    pub display_name: Option<String>,
}

impl TenantMeta {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            display_name: None,
        }
    }
}

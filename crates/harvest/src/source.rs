use async_trait::async_trait;
use chrono::NaiveDate;

use bibsync_core::RawRecord;

use crate::error::HarvestError;

/// One `ListRecords` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListRequest {
    /// Continue a previous list with the source's resumption token.
    Resume { token: String },
    /// Start a new list, optionally restricted to a set and a start date.
    Initial {
        prefix: String,
        set: Option<String>,
        from: Option<NaiveDate>,
    },
}

/// One page of a list response. An empty `token` ends the list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub token: String,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.token.is_empty()
    }
}

/// A remote repository of raw records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn list_records(&self, request: &ListRequest) -> Result<Page, HarvestError>;

    /// Fetch a single record; `None` if the source does not know it.
    async fn get_record(&self, identifier: &str, prefix: &str) -> Result<Option<RawRecord>, HarvestError>;
}

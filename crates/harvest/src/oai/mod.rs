//! OAI-PMH record source over HTTP.

mod xml;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Url;
use tracing::debug;

use bibsync_core::RawRecord;

use crate::error::HarvestError;
use crate::source::{ListRequest, Page, RecordSource};

pub struct OaiClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl OaiClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, HarvestError> {
        let endpoint = Url::parse(endpoint).map_err(|e| HarvestError::InvalidEndpoint {
            url: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn list_url(&self, request: &ListRequest) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("verb", "ListRecords");
            match request {
                ListRequest::Resume { token } => {
                    q.append_pair("resumptionToken", token);
                }
                ListRequest::Initial { prefix, set, from } => {
                    q.append_pair("metadataPrefix", prefix);
                    if let Some(set) = set.as_deref().filter(|s| !s.is_empty()) {
                        q.append_pair("set", set);
                    }
                    if let Some(from) = from {
                        q.append_pair("from", &from.format("%Y-%m-%d").to_string());
                    }
                }
            }
        }
        url
    }

    fn get_url(&self, identifier: &str, prefix: &str) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("verb", "GetRecord");
            q.append_pair("identifier", identifier);
            if !prefix.is_empty() {
                q.append_pair("metadataPrefix", prefix);
            }
        }
        url
    }

    async fn fetch(&self, url: Url) -> Result<xml::OaiResponse, HarvestError> {
        debug!(url = %url, "OAI request");
        let resp = self.http.get(url.clone()).header(ACCEPT, "text/xml").send().await?;
        if !resp.status().is_success() {
            return Err(HarvestError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.text().await?;
        xml::parse_response(&body)
    }
}

#[async_trait]
impl RecordSource for OaiClient {
    async fn list_records(&self, request: &ListRequest) -> Result<Page, HarvestError> {
        let resp = self.fetch(self.list_url(request)).await?;
        // Every error code is fatal for the list, noRecordsMatch included.
        if let Some((code, message)) = resp.error {
            return Err(HarvestError::Oai { code, message });
        }
        Ok(Page {
            records: resp.records,
            token: resp.token,
        })
    }

    async fn get_record(&self, identifier: &str, prefix: &str) -> Result<Option<RawRecord>, HarvestError> {
        let resp = self.fetch(self.get_url(identifier, prefix)).await?;
        match resp.error {
            Some((code, _)) if code == "idDoesNotExist" => Ok(None),
            Some((code, message)) => Err(HarvestError::Oai { code, message }),
            None => Ok(resp.records.into_iter().next()),
        }
    }
}

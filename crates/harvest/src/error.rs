use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("got HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("XML decode error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("OAI error {code}: {message}")]
    Oai { code: String, message: String },

    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Core(#[from] bibsync_core::Error),

    #[error("context canceled")]
    Canceled,
}

impl From<quick_xml::events::attributes::AttrError> for HarvestError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Self::Xml(e.into())
    }
}

impl From<HarvestError> for bibsync_core::Error {
    fn from(e: HarvestError) -> Self {
        match e {
            HarvestError::Canceled => bibsync_core::Error::Canceled,
            HarvestError::Core(e) => e,
            HarvestError::Database(e) => bibsync_core::Error::Database(e),
            other => bibsync_core::Error::internal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibsync_core::ErrorKind;

    #[test]
    fn cancellation_survives_conversion() {
        let core: bibsync_core::Error = HarvestError::Canceled.into();
        assert!(core.is_canceled());
    }

    #[test]
    fn oai_error_becomes_internal_with_code() {
        let core: bibsync_core::Error = HarvestError::Oai {
            code: "badResumptionToken".into(),
            message: "expired".into(),
        }
        .into();
        assert_eq!(core.kind(), ErrorKind::Internal);
        assert!(core.to_string().contains("badResumptionToken"));
    }

    #[test]
    fn core_errors_pass_through() {
        let core: bibsync_core::Error = HarvestError::Core(bibsync_core::Error::not_found("x")).into();
        assert_eq!(core.kind(), ErrorKind::NotFound);
    }
}

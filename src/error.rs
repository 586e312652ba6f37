//! Error taxonomy for one reconciliation cycle
//!
//! Auth expiry is a distinct variant on every upstream error so the loop can
//! re-authenticate instead of backing off.

use reqwest::StatusCode;
use thiserror::Error;

/// Login against one of the upstream services failed
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login to {service} failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("login to {service} rejected with status {status}")]
    Rejected {
        service: &'static str,
        status: StatusCode,
    },

    #[error("login response from {service} has no `{field}` token")]
    MissingToken {
        service: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("metering token expired")]
    AuthExpired,

    #[error("report request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("report request returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("network server token expired")]
    AuthExpired,

    #[error("device search for {entity} failed: {source}")]
    Transport {
        entity: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("device search for {entity} returned status {status}")]
    Status { entity: String, status: StatusCode },

    #[error("device search for {entity} returned an unreadable body: {source}")]
    Decode {
        entity: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("report is not a readable workbook: {0}")]
    Workbook(#[from] calamine::XlsxError),

    #[error("report workbook has no worksheets")]
    NoWorksheet,

    #[error("report has no header at row {0}")]
    MissingHeader(u32),

    #[error("report has no `{0}` column")]
    MissingColumn(String),
}

/// Anything that aborts a cycle before it finishes
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Re-authentication after an expired token failed
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl CycleError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            CycleError::Fetch(FetchError::AuthExpired)
                | CycleError::Resolve(ResolveError::AuthExpired)
        )
    }
}

//! Metering backend client
//!
//! Requests the daily archive report for the configured meters. The backend
//! answers with an XLSX workbook which [`report::find_missing`] interprets.

pub mod report;

use crate::config::{MeteringConfig, ReportConfig};
use crate::error::FetchError;
use crate::session::Session;
use bytes::Bytes;
use chrono::{Days, NaiveDate};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Raw report body as returned by the backend
#[derive(Debug, Clone)]
pub struct RawReport(Bytes);

impl RawReport {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self(body.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn byte_len(&self) -> usize {
        self.0.len()
    }

    /// Keep a copy on disk for inspection; failures only warn
    pub async fn dump(&self, path: &Path) {
        match tokio::fs::write(path, &self.0).await {
            Ok(()) => debug!("Report saved to {}", path.display()),
            Err(e) => warn!("Failed to save report to {}: {}", path.display(), e),
        }
    }
}

/// Body of `POST /record/read/group`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest<'a> {
    from: &'a str,
    to: &'a str,
    #[serde(rename = "type")]
    report_type: &'a str,
    meter_type: &'a str,
    time_type: &'a str,
    parameter: &'a str,
    record_id: &'a str,
    meters: &'a [String],
}

/// Window stamp for the day before `today`, e.g. `2024-05-01T19:00:00.000Z`
pub fn report_window(today: NaiveDate, cutoff_hour: u32) -> String {
    let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    format!(
        "{}T{:02}:00:00.000Z",
        yesterday.format("%Y-%m-%d"),
        cutoff_hour
    )
}

pub struct MeteringClient {
    http: Client,
    config: MeteringConfig,
    report: ReportConfig,
}

impl MeteringClient {
    pub fn new(http: Client, config: MeteringConfig, report: ReportConfig) -> Self {
        Self {
            http,
            config,
            report,
        }
    }

    pub fn meters(&self) -> &[String] {
        &self.config.meters
    }

    /// Fetch the report for `[from, to]` covering `meters`
    pub async fn fetch_report(
        &self,
        session: &Session,
        from: &str,
        to: &str,
        meters: &[String],
    ) -> Result<RawReport, FetchError> {
        let url = format!("{}/record/read/group", self.config.base_url);
        let body = ReportRequest {
            from,
            to,
            report_type: &self.report.report_type,
            meter_type: "",
            time_type: &self.report.time_type,
            parameter: "",
            record_id: &self.report.record_id,
            meters,
        };

        debug!("Requesting {} report for {} meter(s)", body.time_type, meters.len());

        let resp = self
            .http
            .post(&url)
            .bearer_auth(session.metering_token.as_str())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(FetchError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        let report = RawReport::new(resp.bytes().await?);
        info!("Fetched report for {} ({} bytes)", from, report.byte_len());
        Ok(report)
    }
}

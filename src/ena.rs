use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::{PermanentAccession, ReceiptId};
use crate::error::SubmitError;
use crate::webin_output;

pub trait AccessionLookup {
    /// `Ok(None)` while the archive is still processing the analysis.
    fn lookup(&self, receipt: &ReceiptId) -> Result<Option<PermanentAccession>, SubmitError>;
}

/// ENA submission report endpoint (`/ena/submit/report/analyses/<ERZ>`).
#[derive(Clone)]
pub struct EnaReportClient {
    client: Client,
    base_url: String,
}

impl EnaReportClient {
    pub fn new(base_url: &str) -> Result<Self, SubmitError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-submit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SubmitError::LookupHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| SubmitError::LookupHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, SubmitError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, delay_ms = delay, "ENA busy, retrying");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(SubmitError::LookupHttp(err.to_string()));
                }
            }
        }
    }
}

impl AccessionLookup for EnaReportClient {
    fn lookup(&self, receipt: &ReceiptId) -> Result<Option<PermanentAccession>, SubmitError> {
        let url = format!("{}/{}", self.base_url, receipt.as_str());
        let response = self.send_with_retries(|| self.client.get(&url))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "ENA request failed".to_string());
            return Err(SubmitError::LookupStatus {
                status: status.as_u16(),
                message,
            });
        }
        let body = response
            .text()
            .map_err(|err| SubmitError::LookupHttp(err.to_string()))?;
        Ok(accession_from_report(&body))
    }
}

/// Pulls a `GCA_` accession out of a report payload: `accession`, then
/// `report.accession`, then `report.secondaryId` of the first entry, then
/// anywhere in the body.
pub fn accession_from_report(body: &str) -> Option<PermanentAccession> {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let entry = match &json {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        if let Some(entry) = entry {
            let candidates = [
                entry.get("accession"),
                entry.pointer("/report/accession"),
                entry.pointer("/report/secondaryId"),
            ];
            let found = candidates
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .find_map(|value| value.parse::<PermanentAccession>().ok());
            if found.is_some() {
                return found;
            }
        }
    }
    webin_output::find_accession(body)
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

//! Thin client for the Midas historical endpoint.
//!
//! The wire protocol is the same length-prefixed stream produced by the
//! recorder, so the response body feeds straight into the codec.

use serde::Serialize;
use tracing::info;

use tl_types::{DataSourceError, Parameters, TlResult};

use crate::encoding::RecordBuffer;

const ENV_URL: &str = "MIDAS_URL";
const ENV_API_KEY: &str = "MIDAS_API_KEY";

#[derive(Debug, Serialize)]
struct RetrieveParams<'a> {
    tickers: &'a [String],
    start: &'a str,
    end: &'a str,
    schema: &'a str,
}

/// Blocking HTTP client for historical record retrieval.
pub struct MidasClient {
    base_url: String,
    api_key: String,
    http: reqwest::blocking::Client,
}

impl MidasClient {
    /// Build a client from `MIDAS_URL` / `MIDAS_API_KEY`.
    pub fn from_env() -> TlResult<Self> {
        let base_url = std::env::var(ENV_URL).map_err(|_| DataSourceError::MissingEnv {
            name: ENV_URL.to_string(),
        })?;
        let api_key = std::env::var(ENV_API_KEY).map_err(|_| DataSourceError::MissingEnv {
            name: ENV_API_KEY.to_string(),
        })?;
        Ok(Self {
            base_url,
            api_key,
            http: reqwest::blocking::Client::new(),
        })
    }

    /// Fetch the recorded stream covering `params` and decode it.
    pub fn get_records(&self, params: &Parameters) -> TlResult<RecordBuffer> {
        let url = format!("{}/historical/records", self.base_url.trim_end_matches('/'));
        info!(url = %url, tickers = ?params.tickers, "requesting historical records");

        let request = RetrieveParams {
            tickers: &params.tickers,
            start: &params.start,
            end: &params.end,
            schema: &params.schema,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| DataSourceError::RequestFailed {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(DataSourceError::RequestFailed {
                message: format!("historical endpoint returned {}", response.status()),
            }
            .into());
        }

        let bytes = response.bytes().map_err(|e| DataSourceError::RequestFailed {
            message: e.to_string(),
        })?;
        RecordBuffer::from_bytes(&bytes)
    }
}

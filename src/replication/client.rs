// src/replication/client.rs

//! HTTP transport for the replication protocol: a thin wrapper over
//! `reqwest::blocking::Client` that applies the reserved-header policy,
//! retries transient failures with exponential backoff (honoring
//! `Retry-After` on 429), and checks a [`CancellationToken`] between
//! attempts, against the `_changes`/`_revs_diff`/`_bulk_docs`/`open_revs`
//! endpoint set.

use crate::config::{CancellationToken, ReplicatorOptions, DEFAULT_MAX_RETRIES};
use crate::error::{Error, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

pub struct ReplicationClient {
    http: Client,
    base_url: String,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
pub struct ChangesRow {
    pub seq: Value,
    pub id: String,
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangesRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<String>,
    #[serde(default)]
    pub possible_ancestors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkDocsRequest<'a> {
    pub docs: &'a [Value],
    pub new_edits: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkDocsResult {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ReplicationClient {
    pub fn new(options: &ReplicatorOptions) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::Configuration(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Configuration(format!("invalid header value for '{name:?}': {e}")))?;
            headers.insert(name, value);
        }

        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("revtree/{}", env!("CARGO_PKG_VERSION")));

        let http = Client::builder()
            .timeout(options.request_timeout)
            .default_headers(headers)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: options.remote_url.trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Runs `op` with exponential backoff on transient failure (status
    /// 429/5xx or a connection-level error), capped at `max_retries`
    /// attempts total (the initial try plus retries). `Retry-After` on a
    /// 429 response overrides the computed backoff. Checks `cancel`
    /// before every attempt, including the first.
    fn with_retry<T>(
        &self,
        cancel: &CancellationToken,
        mut op: impl FnMut(&Client) -> reqwest::Result<Response>,
        parse: impl Fn(Response) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            cancel.check()?;
            attempt += 1;

            match op(&self.http) {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return parse(response);
                    }

                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());

                    let transient = status.as_u16() == 429 || status.is_server_error();
                    if !transient || attempt >= self.max_retries {
                        return Err(Error::FatalReplication(format!(
                            "HTTP {status} from remote (attempt {attempt})"
                        )));
                    }

                    let backoff = retry_after
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| backoff_delay(attempt));
                    warn!("transient HTTP {status}, retrying in {backoff:?} (attempt {attempt})");
                    std::thread::sleep(backoff);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::FatalReplication(format!(
                            "request failed after {attempt} attempts: {e}"
                        )));
                    }
                    let backoff = backoff_delay(attempt);
                    warn!("transient network error, retrying in {backoff:?}: {e}");
                    std::thread::sleep(backoff);
                }
            }
        }
    }

    pub fn get_changes(
        &self,
        cancel: &CancellationToken,
        since: &str,
        limit: u32,
        doc_ids: &[String],
        filter: Option<(&str, &[(String, String)])>,
    ) -> Result<ChangesResponse> {
        let url = self.url("_changes");
        self.with_retry(
            cancel,
            |client| {
                let mut req = client
                    .get(&url)
                    .query(&[("since", since), ("limit", &limit.to_string()), ("style", "all_docs")]);
                if let Some((name, params)) = filter {
                    req = req.query(&[("filter", name)]);
                    req = req.query(params);
                }
                if !doc_ids.is_empty() {
                    req = req.query(&[("doc_ids", serde_json::to_string(doc_ids).unwrap_or_default())]);
                }
                req.send()
            },
            |response| response.json::<ChangesResponse>().map_err(Error::from),
        )
    }

    pub fn post_revs_diff(
        &self,
        cancel: &CancellationToken,
        request: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, RevsDiffEntry>> {
        let url = self.url("_revs_diff");
        self.with_retry(
            cancel,
            |client| client.post(&url).json(request).send(),
            |response| response.json().map_err(Error::from),
        )
    }

    pub fn post_bulk_docs(
        &self,
        cancel: &CancellationToken,
        docs: &[Value],
    ) -> Result<Vec<BulkDocsResult>> {
        let url = self.url("_bulk_docs");
        let body = BulkDocsRequest { docs, new_edits: false };
        self.with_retry(
            cancel,
            |client| client.post(&url).json(&body).send(),
            |response| response.json().map_err(Error::from),
        )
    }

    pub fn get_open_revs(
        &self,
        cancel: &CancellationToken,
        doc_id: &str,
        revs: &[String],
    ) -> Result<Vec<Value>> {
        let url = self.url(&format!("{doc_id}"));
        let open_revs = serde_json::to_string(revs).unwrap_or_default();
        self.with_retry(
            cancel,
            |client| {
                client
                    .get(&url)
                    .query(&[("open_revs", open_revs.as_str()), ("attachments", "true")])
                    .send()
            },
            |response| response.json().map_err(Error::from),
        )
    }

    pub fn get_checkpoint(&self, cancel: &CancellationToken, replication_id: &str) -> Result<Option<Value>> {
        let url = self.url(&format!("_local/{replication_id}"));
        match self.with_retry(
            cancel,
            |client| client.get(&url).send(),
            |response| response.json::<Value>().map_err(Error::from),
        ) {
            Ok(value) => Ok(Some(value)),
            Err(Error::FatalReplication(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn put_checkpoint(&self, cancel: &CancellationToken, replication_id: &str, body: &Value) -> Result<()> {
        let url = self.url(&format!("_local/{replication_id}"));
        self.with_retry(
            cancel,
            |client| client.put(&url).json(body).send(),
            |_| Ok(()),
        )
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(200u64.saturating_mul(1u64 << attempt.min(6)))
}

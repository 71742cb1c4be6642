//! Dispatcher for the REST API surface.
//!
//! Thin verb methods over a shared dispatch loop, plus two batch
//! helpers: offset pagination (`get_bulk`) and a bounded concurrent
//! fan-out (`get_collection`).

use std::sync::Arc;

use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::auth::Auth;
use crate::error::{classify_connection_error, Error};
use crate::{DEFAULT_CONCURRENT_LIMIT, DEFAULT_PAGE_SIZE, LEGACY_PAGE_SIZE};

/// Response fields tried, in order, when no iterator field is given to
/// [`Rest::get_bulk`].
const ITERATOR_FIELD_CANDIDATES: &[&str] = &["items", "definitions", "entry"];

/// One prepared REST call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

impl RequestSpec {
    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method,
            url: url.to_string(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Dispatcher for REST API calls.
///
/// Obtained from [`crate::Client::rest`]. URLs are relative to the
/// tenant's `rest_instance_url` from the current session.
pub struct Rest {
    auth: Arc<Auth>,
}

impl Rest {
    pub(crate) fn new(auth: Arc<Auth>) -> Self {
        Self { auth }
    }

    /// Issues a GET request.
    pub async fn get(&self, url: &str) -> Result<Value, Error> {
        self.request(RequestSpec::new(Method::GET, url)).await
    }

    /// Issues a DELETE request.
    pub async fn delete(&self, url: &str) -> Result<Value, Error> {
        self.request(RequestSpec::new(Method::DELETE, url)).await
    }

    /// Issues a POST request. `payload` must be a JSON object or array.
    pub async fn post(&self, url: &str, payload: Value) -> Result<Value, Error> {
        check_payload(&Method::POST, &payload)?;
        self.request(RequestSpec::new(Method::POST, url).with_body(payload))
            .await
    }

    /// Issues a PUT request. `payload` must be a JSON object or array.
    pub async fn put(&self, url: &str, payload: Value) -> Result<Value, Error> {
        check_payload(&Method::PUT, &payload)?;
        self.request(RequestSpec::new(Method::PUT, url).with_body(payload))
            .await
    }

    /// Issues a PATCH request. `payload` must be a JSON object or array.
    pub async fn patch(&self, url: &str, payload: Value) -> Result<Value, Error> {
        check_payload(&Method::PATCH, &payload)?;
        self.request(RequestSpec::new(Method::PATCH, url).with_body(payload))
            .await
    }

    /// Issues a fully specified request, including custom headers.
    pub async fn request(&self, spec: RequestSpec) -> Result<Value, Error> {
        self.api_request(&spec).await
    }

    /// Fetches every page behind an offset-paginated endpoint and merges
    /// the pages into one response.
    ///
    /// The iterable field is taken from `iterator_field` or detected
    /// from the first page (`items`, `definitions` or `entry`). Legacy
    /// endpoints (`/legacy/v1`) use `$top`/`$skip` with a fixed page
    /// size, where `$skip` is a record offset advanced by the page size
    /// (the platform treats it as records to skip, not a page number);
    /// everything else uses 1-indexed `$pageSize`/`$page`. Transactional
    /// messaging endpoints report a page count instead of a grand total,
    /// so pagination there stops as soon as a page comes back short.
    /// The `on_loop` handler fires with the accumulated iterable before
    /// each follow-up page is requested; single-page results never fire
    /// it.
    pub async fn get_bulk(
        &self,
        url: &str,
        page_size: Option<u64>,
        iterator_field: Option<&str>,
    ) -> Result<Value, Error> {
        let (base, query) = match url.split_once('?') {
            Some((base, query)) => (base, query),
            None => (url, ""),
        };
        let mut params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        params.retain(|(key, _)| !matches!(key.as_str(), "$pageSize" | "$page" | "$top" | "$skip"));

        let legacy = base.starts_with("/legacy/v1");
        let transactional = base.contains("/messaging/v1/");
        let page_size = if legacy {
            LEGACY_PAGE_SIZE
        } else {
            page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
        };
        let (size_param, page_param, count_field) = if legacy {
            ("$top", "$skip", "totalResults")
        } else {
            ("$pageSize", "$page", "count")
        };
        // Legacy paging starts at record offset 0, modern at page 1.
        let mut cursor: u64 = if legacy { 0 } else { 1 };

        let mut field = iterator_field.map(str::to_string);
        let mut merged = Value::Null;
        let mut accumulated: u64 = 0;

        loop {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in &params {
                serializer.append_pair(key, value);
            }
            serializer.append_pair(size_param, &page_size.to_string());
            serializer.append_pair(page_param, &cursor.to_string());
            let page_url = format!("{base}?{}", serializer.finish());

            let response = self.get(&page_url).await?;
            let field_name = match &field {
                Some(name) => name.clone(),
                None => {
                    let detected = detect_iterator_field(&response)?;
                    field = Some(detected.clone());
                    detected
                }
            };
            let batch = response
                .get(&field_name)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let batch_len = batch.len() as u64;
            accumulated += batch_len;
            let reported = response.get(count_field).and_then(Value::as_u64);
            debug!(
                url = %page_url,
                batch = batch_len,
                accumulated,
                reported,
                "merged pagination batch"
            );

            match &mut merged {
                Value::Object(map) => {
                    if let Some(Value::Array(items)) = map.get_mut(&field_name) {
                        items.extend(batch);
                    }
                }
                _ => merged = response,
            }

            if transactional && reported != Some(page_size) {
                break;
            }
            if batch_len < page_size {
                break;
            }
            if !transactional {
                if let Some(total) = reported {
                    if accumulated >= total {
                        break;
                    }
                }
            }
            if batch_len == 0 {
                break;
            }
            // Progress is only reported when another page follows.
            if let Some(hook) = &self.auth.options.handlers.on_loop {
                hook(merged.get(&field_name).unwrap_or(&Value::Null));
            }
            cursor += if legacy { page_size } else { 1 };
        }

        Ok(merged)
    }

    /// Issues GET requests for every URL with bounded concurrency,
    /// returning responses in input order.
    ///
    /// The token is refreshed once up front so the fan-out cannot
    /// stampede the token endpoint.
    pub async fn get_collection(
        &self,
        urls: &[String],
        concurrent_limit: Option<usize>,
    ) -> Result<Vec<Value>, Error> {
        self.auth.ensure_token(false).await?;
        let limit = concurrent_limit.unwrap_or(DEFAULT_CONCURRENT_LIMIT).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let calls = urls.iter().map(|url| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.map_err(|_| Error::Lock)?;
                self.get(url).await
            }
        });
        futures::future::join_all(calls).await.into_iter().collect()
    }

    /// Issues one REST call, retrying recognized connection errors and
    /// spending the single refresh allowance on a 401.
    async fn api_request(&self, spec: &RequestSpec) -> Result<Value, Error> {
        let handlers = &self.auth.options.handlers;
        let mut remaining = self.auth.options.retry.max_attempts;
        loop {
            remaining -= 1;
            let session = self.auth.ensure_token(false).await?;
            let endpoint = join_url(&session.rest_instance_url, &spec.url);
            debug!(method = %spec.method, %endpoint, remaining, "dispatching REST request");
            if let Some(hook) = &handlers.log_request {
                hook(&json!({
                    "method": spec.method.as_str(),
                    "url": endpoint,
                    "data": spec.body,
                }));
            }

            let mut request = self
                .auth
                .http
                .request(spec.method.clone(), &endpoint)
                .bearer_auth(&session.access_token);
            for (name, value) in &spec.headers {
                request = request.header(name, value);
            }
            if let Some(body) = &spec.body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(source) => {
                    let kind = classify_connection_error(&source);
                    let network = Error::Network {
                        kind,
                        endpoint: endpoint.clone(),
                        source,
                    };
                    if kind.is_some()
                        && self.auth.options.retry.retry_on_connection_error
                        && remaining > 0
                    {
                        debug!(%endpoint, remaining, "REST request hit connection error, retrying");
                        if let Some(hook) = &handlers.on_connection_error {
                            hook(&network, remaining);
                        }
                        continue;
                    }
                    return Err(network);
                }
            };

            let status = response.status();
            let raw = response.text().await.map_err(|source| Error::Network {
                kind: None,
                endpoint: endpoint.clone(),
                source,
            })?;
            let body = if raw.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&raw).unwrap_or(Value::String(raw))
            };
            if let Some(hook) = &handlers.log_response {
                hook(&json!({ "status": status.as_u16(), "body": body }));
            }

            if status.as_u16() == 401 {
                if remaining > 0 {
                    debug!(%endpoint, "got 401, forcing refresh");
                    self.auth.ensure_token(true).await?;
                    // One retry with the fresh token; a second 401 is
                    // terminal.
                    remaining = 1;
                    continue;
                }
                return Err(Error::ExpiredSession { endpoint });
            }
            if !status.is_success() {
                return Err(Error::rest(status.as_u16(), body, endpoint));
            }
            return Ok(body);
        }
    }
}

impl std::fmt::Debug for Rest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rest").finish_non_exhaustive()
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn check_payload(method: &Method, payload: &Value) -> Result<(), Error> {
    if payload.is_object() || payload.is_array() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{method} requests require a payload"
        )))
    }
}

fn detect_iterator_field(response: &Value) -> Result<String, Error> {
    ITERATOR_FIELD_CANDIDATES
        .iter()
        .find(|candidate| {
            response
                .get(**candidate)
                .map(Value::is_array)
                .unwrap_or(false)
        })
        .map(|candidate| candidate.to_string())
        .ok_or_else(|| {
            Error::Validation(
                "Could not find an iterator field on the response; pass one explicitly"
                    .to_string(),
            )
        })
}

//! Dispatcher for the partner SOAP API.
//!
//! Each public method maps one SOAP verb to its fixed request shape; the
//! shared dispatch loop handles token injection, connection-error retry
//! and the single refresh allowance for `Token Expired` faults.

mod envelope;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::auth::Auth;
use crate::error::{classify_connection_error, Error};
use crate::{PARTNER_API_NAMESPACE, SOAP_SERVICE_PATH};

/// Option keys accepted by every SOAP verb.
const BASE_OPTION_KEYS: &[&str] = &["filter", "QueryAllAccounts"];
/// Additional option keys accepted by retrieve calls.
const RETRIEVE_OPTION_KEYS: &[&str] = &["clientIDs", "continueRequest"];
/// Additional option keys accepted by write-style calls.
const WRITE_OPTION_KEYS: &[&str] = &["options"];

/// One prepared SOAP call: the `SOAPAction` header value, the request
/// body tree and the response element the payload lives under.
struct SoapSpec {
    action: &'static str,
    body: Value,
    response_key: &'static str,
}

/// Dispatcher for partner API SOAP calls.
///
/// Obtained from [`crate::Client::soap`]; holds no state of its own
/// beyond the shared auth client.
pub struct Soap {
    auth: Arc<Auth>,
}

impl Soap {
    pub(crate) fn new(auth: Arc<Auth>) -> Self {
        Self { auth }
    }

    /// Retrieves up to one server-side page of `object_type` instances.
    ///
    /// `options` accepts `filter`, `QueryAllAccounts`, `clientIDs` and
    /// `continueRequest`. The returned payload always carries `Results`
    /// as an array, and `OverallStatus` is `MoreDataAvailable` when
    /// another page exists.
    pub async fn retrieve(
        &self,
        object_type: &str,
        properties: &[&str],
        options: Option<Value>,
    ) -> Result<Value, Error> {
        let body = self.retrieve_body(object_type, properties, options.as_ref(), None)?;
        self.api_request(&SoapSpec {
            action: "Retrieve",
            body,
            response_key: "RetrieveResponseMsg",
        })
        .await
    }

    /// Retrieves every page of `object_type` instances, following
    /// `MoreDataAvailable` continuations until the server is drained.
    ///
    /// The returned payload is the final page's response with `Results`
    /// replaced by the concatenation of every page's results. The
    /// `on_loop` handler fires after each continuation page is merged.
    pub async fn retrieve_bulk(
        &self,
        object_type: &str,
        properties: &[&str],
        options: Option<Value>,
    ) -> Result<Value, Error> {
        let body = self.retrieve_body(object_type, properties, options.as_ref(), None)?;
        let mut response = self
            .api_request(&SoapSpec {
                action: "Retrieve",
                body,
                response_key: "RetrieveResponseMsg",
            })
            .await?;
        let mut results = take_results(&mut response);

        while response.get("OverallStatus").and_then(Value::as_str) == Some("MoreDataAvailable") {
            let request_id = response
                .get("RequestID")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Soap {
                    code: "520".to_string(),
                    message: "MoreDataAvailable response without RequestID".to_string(),
                    fault: Some(response.clone()),
                })?;
            debug!(%request_id, accumulated = results.len(), "continuing bulk retrieve");
            let body =
                self.retrieve_body(object_type, properties, options.as_ref(), Some(&request_id))?;
            response = self
                .api_request(&SoapSpec {
                    action: "Retrieve",
                    body,
                    response_key: "RetrieveResponseMsg",
                })
                .await?;
            results.extend(take_results(&mut response));
            if let Some(hook) = &self.auth.options.handlers.on_loop {
                hook(&Value::Array(results.clone()));
            }
        }

        response["Results"] = Value::Array(results);
        Ok(response)
    }

    /// Creates `object_type` instances from `properties`.
    pub async fn create(
        &self,
        object_type: &str,
        properties: Value,
        options: Option<Value>,
    ) -> Result<Value, Error> {
        self.modify(
            "Create",
            "CreateRequest",
            "CreateResponse",
            object_type,
            properties,
            options,
        )
        .await
    }

    /// Updates `object_type` instances from `properties`.
    pub async fn update(
        &self,
        object_type: &str,
        properties: Value,
        options: Option<Value>,
    ) -> Result<Value, Error> {
        self.modify(
            "Update",
            "UpdateRequest",
            "UpdateResponse",
            object_type,
            properties,
            options,
        )
        .await
    }

    /// Deletes `object_type` instances identified by `properties`.
    pub async fn delete(
        &self,
        object_type: &str,
        properties: Value,
        options: Option<Value>,
    ) -> Result<Value, Error> {
        self.modify(
            "Delete",
            "DeleteRequest",
            "DeleteResponse",
            object_type,
            properties,
            options,
        )
        .await
    }

    /// Schedules `interactions` of `object_type` with the given
    /// `schedule` definition; `action` is e.g. `start` or `stop`.
    pub async fn schedule(
        &self,
        object_type: &str,
        schedule: Value,
        interactions: Value,
        action: &str,
        options: Option<Value>,
    ) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        require_argument(action, "action")?;
        validate_options(options.as_ref(), WRITE_OPTION_KEYS)?;
        let mut msg = Map::new();
        msg.insert("@_xmlns".to_string(), json!(PARTNER_API_NAMESPACE));
        msg.insert("Action".to_string(), json!(action));
        if let Some(extra) = options.as_ref().and_then(|o| o.get("options")) {
            msg.insert("Options".to_string(), extra.clone());
        }
        msg.insert("Schedule".to_string(), schedule);
        msg.insert(
            "Interactions".to_string(),
            json!({ "Interaction": with_xsi_type(interactions, object_type)? }),
        );
        self.api_request(&SoapSpec {
            action: "Schedule",
            body: json!({ "ScheduleRequestMsg": Value::Object(msg) }),
            response_key: "ScheduleResponseMsg",
        })
        .await
    }

    /// Returns the metadata definition of `object_type`.
    pub async fn describe(&self, object_type: &str) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        self.api_request(&SoapSpec {
            action: "Describe",
            body: json!({
                "DefinitionRequestMsg": {
                    "@_xmlns": PARTNER_API_NAMESPACE,
                    "DescribeRequests": {
                        "ObjectDefinitionRequest": { "ObjectType": object_type },
                    },
                },
            }),
            response_key: "DefinitionResponseMsg",
        })
        .await
    }

    /// Executes the platform request named `object_type` with the given
    /// parameters.
    pub async fn execute(&self, object_type: &str, properties: Value) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        self.api_request(&SoapSpec {
            action: "Execute",
            body: json!({
                "ExecuteRequestMsg": {
                    "@_xmlns": PARTNER_API_NAMESPACE,
                    "Requests": {
                        "Name": object_type,
                        "Parameters": properties,
                    },
                },
            }),
            response_key: "ExecuteResponseMsg",
        })
        .await
    }

    /// Performs `action` on the `object_type` definition in `payload`.
    pub async fn perform(
        &self,
        object_type: &str,
        action: &str,
        payload: Value,
    ) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        require_argument(action, "action")?;
        self.api_request(&SoapSpec {
            action: "Perform",
            body: json!({
                "PerformRequestMsg": {
                    "@_xmlns": PARTNER_API_NAMESPACE,
                    "Action": action,
                    "Definitions": {
                        "Definition": with_xsi_type(payload, object_type)?,
                    },
                },
            }),
            response_key: "PerformResponseMsg",
        })
        .await
    }

    /// Applies `action` to the `object_type` configurations given.
    pub async fn configure(
        &self,
        object_type: &str,
        action: &str,
        configurations: Value,
    ) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        require_argument(action, "action")?;
        self.api_request(&SoapSpec {
            action: "Configure",
            body: json!({
                "ConfigureRequestMsg": {
                    "@_xmlns": PARTNER_API_NAMESPACE,
                    "Action": action,
                    "Configurations": {
                        "Configuration": with_xsi_type(configurations, object_type)?,
                    },
                },
            }),
            response_key: "ConfigureResponseMsg",
        })
        .await
    }

    fn retrieve_body(
        &self,
        object_type: &str,
        properties: &[&str],
        options: Option<&Value>,
        continue_request: Option<&str>,
    ) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        if properties.is_empty() {
            return Err(Error::Validation("properties are required".to_string()));
        }
        validate_options(options, RETRIEVE_OPTION_KEYS)?;
        let mut request = Map::new();
        if let Some(client_ids) = options.and_then(|o| o.get("clientIDs")) {
            request.insert("ClientIDs".to_string(), client_ids.clone());
        }
        request.insert("ObjectType".to_string(), json!(object_type));
        request.insert("Properties".to_string(), json!(properties));
        if let Some(filter) = options.and_then(|o| o.get("filter")) {
            request.insert("Filter".to_string(), envelope::build_filter(filter)?);
        }
        if options
            .and_then(|o| o.get("QueryAllAccounts"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            request.insert("QueryAllAccounts".to_string(), json!(true));
        }
        let continuation = continue_request.map(str::to_string).or_else(|| {
            options
                .and_then(|o| o.get("continueRequest"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        if let Some(request_id) = continuation {
            request.insert("ContinueRequest".to_string(), json!(request_id));
        }
        Ok(json!({
            "RetrieveRequestMsg": {
                "@_xmlns": PARTNER_API_NAMESPACE,
                "RetrieveRequest": Value::Object(request),
            },
        }))
    }

    async fn modify(
        &self,
        action: &'static str,
        request_key: &'static str,
        response_key: &'static str,
        object_type: &str,
        properties: Value,
        options: Option<Value>,
    ) -> Result<Value, Error> {
        require_argument(object_type, "object_type")?;
        validate_options(options.as_ref(), WRITE_OPTION_KEYS)?;
        let mut msg = Map::new();
        msg.insert("@_xmlns".to_string(), json!(PARTNER_API_NAMESPACE));
        if let Some(extra) = options.as_ref().and_then(|o| o.get("options")) {
            msg.insert("Options".to_string(), extra.clone());
        }
        msg.insert(
            "Objects".to_string(),
            with_xsi_type(properties, object_type)?,
        );
        let mut body = Map::new();
        body.insert(request_key.to_string(), Value::Object(msg));
        self.api_request(&SoapSpec {
            action,
            body: Value::Object(body),
            response_key,
        })
        .await
    }

    /// Issues one SOAP call, retrying recognized connection errors and
    /// spending the single refresh allowance on `Token Expired` faults.
    ///
    /// Response classification happens on the parsed envelope regardless
    /// of HTTP status; the status only matters when the envelope carries
    /// neither a fault nor the expected payload.
    async fn api_request(&self, spec: &SoapSpec) -> Result<Value, Error> {
        let handlers = &self.auth.options.handlers;
        let mut remaining = self.auth.options.retry.max_attempts;
        loop {
            remaining -= 1;
            let session = self.auth.ensure_token(false).await?;
            let endpoint = service_url(&session.soap_instance_url);
            let body = envelope::build_envelope(&spec.body, &session.access_token)?;
            debug!(%endpoint, action = spec.action, remaining, "dispatching SOAP request");
            if let Some(hook) = &handlers.log_request {
                hook(&json!({
                    "method": "POST",
                    "url": endpoint,
                    "soapAction": spec.action,
                    "body": body,
                }));
            }

            let response = match self
                .auth
                .http
                .post(&endpoint)
                .header("SOAPAction", spec.action)
                .header(reqwest::header::CONTENT_TYPE, "text/xml")
                .body(body)
                .send()
                .await
            {
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
                        debug!(%endpoint, remaining, "SOAP request hit connection error, retrying");
                        if let Some(hook) = &handlers.on_connection_error {
                            hook(&network, remaining);
                        }
                        continue;
                    }
                    return Err(network);
                }
            };

            let status = response.status().as_u16();
            let raw = response.text().await.map_err(|source| Error::Network {
                kind: None,
                endpoint: endpoint.clone(),
                source,
            })?;
            if let Some(hook) = &handlers.log_response {
                hook(&json!({ "status": status, "body": raw }));
            }

            match envelope::parse_response(&raw, status, spec.response_key) {
                Ok(payload) => return Ok(payload),
                Err(Error::Soap { message, .. }) if message == "Token Expired" => {
                    if remaining > 0 {
                        debug!(%endpoint, "token expired fault, forcing refresh");
                        self.auth.ensure_token(true).await?;
                        // One retry with the fresh token; a second expiry
                        // fault is terminal.
                        remaining = 1;
                        continue;
                    }
                    return Err(Error::ExpiredSession { endpoint });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl std::fmt::Debug for Soap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Soap").finish_non_exhaustive()
    }
}

fn service_url(base: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        SOAP_SERVICE_PATH.trim_start_matches('/')
    )
}

/// Stamps `xsi:type` on an object payload, or on each element of an
/// array payload.
fn with_xsi_type(payload: Value, object_type: &str) -> Result<Value, Error> {
    match payload {
        Value::Object(mut fields) => {
            fields.insert("@_xsi:type".to_string(), json!(object_type));
            Ok(Value::Object(fields))
        }
        Value::Array(items) => items
            .into_iter()
            .map(|item| with_xsi_type(item, object_type))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Err(Error::Validation(
            "properties must be an object or an array of objects".to_string(),
        )),
    }
}

fn require_argument(value: &str, name: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{name} is required")));
    }
    Ok(())
}

/// Rejects option keys outside the closed vocabulary for the call.
fn validate_options(options: Option<&Value>, additional: &[&str]) -> Result<(), Error> {
    let Some(options) = options else {
        return Ok(());
    };
    let Value::Object(map) = options else {
        return Err(Error::Validation("options must be an object".to_string()));
    };
    let invalid: Vec<String> = map
        .keys()
        .filter(|key| {
            !BASE_OPTION_KEYS.contains(&key.as_str()) && !additional.contains(&key.as_str())
        })
        .map(|key| format!("\"{key}\""))
        .collect();
    if !invalid.is_empty() {
        return Err(Error::Validation(format!(
            "{} is/are invalid option(s)",
            invalid.join(",")
        )));
    }
    Ok(())
}

fn take_results(response: &mut Value) -> Vec<Value> {
    match response.get_mut("Results").map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

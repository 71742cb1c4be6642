//! OAuth2 client-credentials session management for the Marketing Cloud
//! token endpoint.

use std::sync::{LazyLock, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::client::SdkOptions;
use crate::error::{classify_connection_error, Error};
use crate::TOKEN_ENDPOINT_PATH;

/// Scopes the platform currently accepts for client-credentials grants.
pub const SUPPORTED_SCOPES: &[&str] = &[
    "accounts_read",
    "accounts_write",
    "approvals_read",
    "approvals_write",
    "audiences_read",
    "audiences_write",
    "automations_execute",
    "automations_read",
    "automations_write",
    "calendar_read",
    "calendar_write",
    "campaign_read",
    "campaign_write",
    "contact_bu_mapping_create",
    "contact_bu_mapping_delete",
    "contact_bu_mapping_update",
    "contact_bu_mapping_view",
    "data_extensions_read",
    "data_extensions_write",
    "deep_linking_asset_delete",
    "deep_linking_asset_read",
    "deep_linking_asset_write",
    "deep_linking_settings_read",
    "deep_linking_settings_write",
    "dfu_configure",
    "documents_and_images_read",
    "documents_and_images_write",
    "email_read",
    "email_send",
    "email_write",
    "event_notification_callback_create",
    "event_notification_callback_delete",
    "event_notification_callback_read",
    "event_notification_callback_update",
    "event_notification_subscription_create",
    "event_notification_subscription_delete",
    "event_notification_subscription_read",
    "event_notification_subscription_update",
    "file_locations_read",
    "file_locations_write",
    "journeys_aspr",
    "journeys_delete",
    "journeys_execute",
    "journeys_read",
    "journeys_write",
    "key_manage_revoke",
    "key_manage_rotate",
    "key_manage_view",
    "list_and_subscribers_read",
    "list_and_subscribers_write",
    "marketing_cloud_connect_read",
    "marketing_cloud_connect_send",
    "marketing_cloud_connect_write",
    "offline",
    "ott_channels_read",
    "ott_channels_write",
    "ott_chat_messaging_read",
    "ott_chat_messaging_send",
    "package_manager_deploy",
    "package_manager_package",
    "push_read",
    "push_send",
    "push_write",
    "saved_content_read",
    "saved_content_write",
    "sms_read",
    "sms_send",
    "sms_write",
    "social_post",
    "social_publish",
    "social_read",
    "social_write",
    "tags_read",
    "tags_write",
    "tracking_events_read",
    "tracking_events_write",
    "users_read",
    "users_write",
    "web_publish",
    "web_read",
    "web_write",
    "webhooks_read",
    "webhooks_write",
    "workflows_read",
    "workflows_write",
];

static AUTH_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://[a-z0-9-]{28}\.auth\.marketingcloudapis\.com/").expect("valid pattern")
});

/// Credentials for an installed package with a client-credentials
/// integration.
///
/// Obtained from Marketing Cloud Setup under Installed Packages. The
/// `account_id` is the MID of the business unit the token should be
/// scoped to; string-encoded integers are accepted.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Credentials {
    /// Client ID of the installed package.
    pub client_id: String,
    /// Client Secret of the installed package.
    pub client_secret: String,
    /// MID of the business unit used for API calls.
    pub account_id: String,
    /// Tenant-specific auth base URL, e.g.
    /// `https://mcXXXXXXXXXXXXXXXXXXXXXXXXXX.auth.marketingcloudapis.com/`.
    pub auth_url: String,
    /// Scopes to request; every entry must be a supported scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
}

impl Credentials {
    /// Validates the credential set and returns the parsed account MID.
    ///
    /// Malformed credentials are a construction-time failure; they are
    /// never retried or deferred to the first request.
    pub(crate) fn validate(&self) -> Result<i64, Error> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(Error::Validation(
                "client_id or client_secret is missing or invalid".to_string(),
            ));
        }
        let account_id = self.account_id.trim().parse::<i64>().map_err(|_| {
            Error::Validation(
                "account_id must be an Integer (Integers in String format are accepted)"
                    .to_string(),
            )
        })?;
        if self.auth_url.is_empty() {
            return Err(Error::Validation(
                "auth_url is missing or invalid".to_string(),
            ));
        }
        if !AUTH_URL_PATTERN.is_match(&self.auth_url) {
            return Err(Error::Validation(
                "auth_url must be in format https://mcXXXXXXXXXXXXXXXXXXXXXXXXXX.auth.marketingcloudapis.com/"
                    .to_string(),
            ));
        }
        if let Some(scopes) = &self.scope {
            let invalid: Vec<&str> = scopes
                .iter()
                .map(String::as_str)
                .filter(|scope| !SUPPORTED_SCOPES.contains(scope))
                .collect();
            if !invalid.is_empty() {
                let quoted: Vec<String> = invalid.iter().map(|s| format!("\"{s}\"")).collect();
                return Err(Error::Validation(format!(
                    "{} is/are invalid scope(s)",
                    quoted.join(",")
                )));
            }
        }
        Ok(account_id)
    }
}

/// Response shape of `POST {auth_url}v2/token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    rest_instance_url: String,
    soap_instance_url: String,
}

/// The current bearer token, its expiry instant and the two service base
/// URLs returned by the token endpoint.
///
/// Owned exclusively by [`Auth`]; replaced wholesale on every refresh.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token for both API surfaces.
    pub access_token: String,
    /// Monotonic instant at which the token stops being usable.
    pub expires_at: Instant,
    /// Base URL for REST calls.
    pub rest_instance_url: String,
    /// Base URL for SOAP calls.
    pub soap_instance_url: String,
}

impl Session {
    fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Owns the session lifecycle: token acquisition, expiry tracking and the
/// refresh protocol.
///
/// Concurrent callers that discover an expired or missing token share a
/// single in-flight refresh instead of issuing N parallel token requests.
pub struct Auth {
    credentials: Credentials,
    account_id: i64,
    pub(crate) options: SdkOptions,
    pub(crate) http: reqwest::Client,
    session: RwLock<Option<Session>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl Auth {
    pub(crate) fn new(
        credentials: Credentials,
        options: SdkOptions,
        http: reqwest::Client,
    ) -> Result<Self, Error> {
        let account_id = credentials.validate()?;
        Ok(Self::assemble(credentials, account_id, options, http))
    }

    /// Test constructor that skips the auth_url pattern check so sessions
    /// can be pointed at a local mock server.
    #[cfg(test)]
    pub(crate) fn unvalidated(
        credentials: Credentials,
        options: SdkOptions,
        http: reqwest::Client,
    ) -> Self {
        let account_id = credentials.account_id.trim().parse().unwrap_or(0);
        Self::assemble(credentials, account_id, options, http)
    }

    fn assemble(
        credentials: Credentials,
        account_id: i64,
        options: SdkOptions,
        http: reqwest::Client,
    ) -> Self {
        Self {
            credentials,
            account_id,
            options,
            http,
            session: RwLock::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the scopes the SDK accepts in [`Credentials::scope`].
    pub fn supported_scopes(&self) -> &'static [&'static str] {
        SUPPORTED_SCOPES
    }

    /// Returns the currently held session, if any, without refreshing.
    pub fn current_session(&self) -> Result<Option<Session>, Error> {
        Ok(self.session.read().map_err(|_| Error::Lock)?.clone())
    }

    /// Returns a valid session, refreshing the token first when forced,
    /// absent, or expired.
    ///
    /// Refreshes are coalesced: callers that race into a refresh await the
    /// one in flight and re-check the session before issuing their own.
    pub async fn ensure_token(&self, force_refresh: bool) -> Result<Session, Error> {
        if !force_refresh {
            if let Some(session) = self.current_session()? {
                if !session.is_expired() {
                    return Ok(session);
                }
            }
        }

        let _gate = self.refresh_gate.lock().await;
        if !force_refresh {
            // Another caller may have refreshed while we waited.
            if let Some(session) = self.current_session()? {
                if !session.is_expired() {
                    return Ok(session);
                }
            }
        }

        let session = self.request_token().await?;
        {
            let mut held = self.session.write().map_err(|_| Error::Lock)?;
            *held = Some(session.clone());
        }
        if let Some(hook) = &self.options.handlers.on_refresh {
            hook(&session);
        }
        Ok(session)
    }

    /// Issues the token request, retrying recognized connection errors up
    /// to the configured attempt budget.
    async fn request_token(&self) -> Result<Session, Error> {
        let endpoint = format!(
            "{}{}",
            self.credentials.auth_url,
            TOKEN_ENDPOINT_PATH.trim_start_matches('/')
        );
        let mut payload = json!({
            "grant_type": "client_credentials",
            "client_id": self.credentials.client_id,
            "client_secret": self.credentials.client_secret,
            "account_id": self.account_id,
        });
        if let Some(scopes) = &self.credentials.scope {
            payload["scope"] = Value::String(scopes.join(" "));
        }

        let mut remaining = self.options.retry.max_attempts;
        loop {
            remaining -= 1;
            debug!(%endpoint, remaining, "requesting access token");
            let response = match self.http.post(&endpoint).json(&payload).send().await {
                Ok(response) => response,
                Err(source) => {
                    let kind = classify_connection_error(&source);
                    let network = Error::Network {
                        kind,
                        endpoint: endpoint.clone(),
                        source,
                    };
                    if kind.is_some()
                        && self.options.retry.retry_on_connection_error
                        && remaining > 0
                    {
                        debug!(%endpoint, remaining, "token request hit connection error, retrying");
                        if let Some(hook) = &self.options.handlers.on_connection_error {
                            hook(&network, remaining);
                        }
                        continue;
                    }
                    return Err(network);
                }
            };

            let status = response.status();
            if !status.is_success() {
                // A response that arrived is not a connection error; the
                // provider rejected the credentials and retrying would not
                // change the outcome.
                let body: Value = response.json().await.unwrap_or(Value::Null);
                return Err(Error::Auth {
                    code: body
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or(status.as_str())
                        .to_string(),
                    description: body
                        .get("error_description")
                        .and_then(Value::as_str)
                        .unwrap_or("Token request was rejected")
                        .to_string(),
                });
            }

            let token: TokenResponse = response.json().await.map_err(|source| Error::Network {
                kind: None,
                endpoint: endpoint.clone(),
                source,
            })?;
            debug!(expires_in = token.expires_in, "access token refreshed");
            return Ok(Session {
                access_token: token.access_token,
                expires_at: Instant::now() + Duration::from_secs(token.expires_in),
                rest_instance_url: token.rest_instance_url,
                soap_instance_url: token.soap_instance_url,
            });
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("account_id", &self.account_id)
            .field("auth_url", &self.credentials.auth_url)
            .finish_non_exhaustive()
    }
}

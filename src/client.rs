//! SDK entry point wiring the auth client and the two protocol
//! dispatchers over one shared HTTP client.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::auth::{Auth, Credentials, Session};
use crate::error::Error;
use crate::rest::Rest;
use crate::soap::Soap;
use crate::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS};

/// Retry settings shared by the token manager and both dispatchers.
///
/// `max_attempts` is the number of physical attempts for one logical
/// call, not the number of retries; it is clamped to at least 1.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_on_connection_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_on_connection_error: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_on_connection_error: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_on_connection_error,
        }
    }
}

/// Hook fired after every successful token refresh.
pub type RefreshHook = Box<dyn Fn(&Session) + Send + Sync>;
/// Hook fired before each connection-error retry, with the error and the
/// remaining attempt budget.
pub type ConnectionErrorHook = Box<dyn Fn(&Error, u32) + Send + Sync>;
/// Hook fired with the accumulated iterable while a pagination loop
/// continues past the current page.
pub type LoopHook = Box<dyn Fn(&Value) + Send + Sync>;
/// Hook fired with a JSON description of each outgoing request or each
/// received response.
pub type LogHook = Box<dyn Fn(&Value) + Send + Sync>;

/// Optional observer callbacks, injected at client construction.
///
/// Retries and refreshes are invisible to callers except through these.
#[derive(Default)]
pub struct EventHandlers {
    pub on_refresh: Option<RefreshHook>,
    pub on_connection_error: Option<ConnectionErrorHook>,
    pub on_loop: Option<LoopHook>,
    pub log_request: Option<LogHook>,
    pub log_response: Option<LogHook>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_refresh(mut self, hook: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.on_refresh = Some(Box::new(hook));
        self
    }

    pub fn on_connection_error(
        mut self,
        hook: impl Fn(&Error, u32) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_error = Some(Box::new(hook));
        self
    }

    pub fn on_loop(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_loop = Some(Box::new(hook));
        self
    }

    pub fn log_request(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.log_request = Some(Box::new(hook));
        self
    }

    pub fn log_response(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.log_response = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_refresh", &self.on_refresh.is_some())
            .field("on_connection_error", &self.on_connection_error.is_some())
            .field("on_loop", &self.on_loop.is_some())
            .field("log_request", &self.log_request.is_some())
            .field("log_response", &self.log_response.is_some())
            .finish()
    }
}

/// Per-client configuration shared by the token manager and both
/// dispatchers; read-only after construction.
#[derive(Debug, Default)]
pub(crate) struct SdkOptions {
    pub(crate) retry: RetryPolicy,
    pub(crate) handlers: EventHandlers,
}

/// Source for loading credentials.
#[derive(Debug, Clone)]
pub enum CredentialsFrom {
    /// Load credentials from a JSON file.
    Path(PathBuf),
    /// Use credentials provided directly.
    Value(Credentials),
}

/// Client for the Marketing Cloud REST and SOAP APIs.
///
/// Use [`Builder`] to construct an instance; credential validation happens
/// there, before anything touches the wire.
///
/// # Examples
///
/// ```no_run
/// use sfmc_core::{Builder, Credentials, RetryPolicy};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Builder::new()
///     .credentials(Credentials {
///         client_id: "your_client_id".to_string(),
///         client_secret: "your_client_secret".to_string(),
///         account_id: "1111111".to_string(),
///         auth_url: "https://mct0l7nxfq2r988t1kxfy8sc47ma.auth.marketingcloudapis.com/"
///             .to_string(),
///         scope: None,
///     })
///     .retry_policy(RetryPolicy::new(2, true))
///     .build()?;
///
/// let journeys = client.rest().get("/interaction/v1/interactions").await?;
/// let extensions = client
///     .soap()
///     .retrieve("DataExtension", &["CustomerKey", "Name"], None)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Client {
    auth: Arc<Auth>,
    rest: Rest,
    soap: Soap,
}

impl Client {
    /// The REST dispatcher.
    pub fn rest(&self) -> &Rest {
        &self.rest
    }

    /// The SOAP dispatcher.
    pub fn soap(&self) -> &Soap {
        &self.soap
    }

    /// The token manager shared by both dispatchers.
    pub fn auth(&self) -> &Auth {
        &self.auth
    }
}

/// Builder for constructing a [`Client`].
#[derive(Debug, Default)]
pub struct Builder {
    credentials_from: Option<CredentialsFrom>,
    retry: RetryPolicy,
    handlers: EventHandlers,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets credentials directly.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials_from = Some(CredentialsFrom::Value(credentials));
        self
    }

    /// Sets credentials to load from a JSON file with the same field names
    /// as [`Credentials`].
    pub fn credentials_path(mut self, path: PathBuf) -> Self {
        self.credentials_from = Some(CredentialsFrom::Path(path));
        self
    }

    /// Sets the retry budget shared by the token manager and both
    /// dispatchers. Defaults to one attempt with connection-error retry
    /// enabled.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Injects observer callbacks.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Overrides the connection timeout (defaults to
    /// [`DEFAULT_CONNECT_TIMEOUT_SECS`]).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Overrides the per-request timeout (defaults to
    /// [`DEFAULT_REQUEST_TIMEOUT_SECS`]).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Builds the client, validating credentials first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when credentials are missing or
    /// malformed: empty client id/secret, non-integer account id, auth URL
    /// not matching the tenant pattern, unsupported scope, or an
    /// unreadable/unparseable credentials file.
    pub fn build(self) -> Result<Client, Error> {
        let credentials = match self.credentials_from {
            Some(CredentialsFrom::Value(credentials)) => credentials,
            Some(CredentialsFrom::Path(path)) => {
                let raw = fs::read_to_string(&path).map_err(|err| {
                    Error::Validation(format!(
                        "Failed to read credentials file at {}: {err}",
                        path.display()
                    ))
                })?;
                serde_json::from_str(&raw).map_err(|err| {
                    Error::Validation(format!("Failed to parse credentials JSON: {err}"))
                })?
            }
            None => {
                return Err(Error::Validation(
                    "credentials or credentials_path is required".to_string(),
                ))
            }
        };

        let retry = RetryPolicy::new(self.retry.max_attempts, self.retry.retry_on_connection_error);
        let http = reqwest::Client::builder()
            .connect_timeout(
                self.connect_timeout
                    .unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
            )
            .timeout(
                self.request_timeout
                    .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            )
            .build()
            .map_err(|source| Error::Network {
                kind: None,
                endpoint: String::new(),
                source,
            })?;

        let options = SdkOptions {
            retry,
            handlers: self.handlers,
        };
        let auth = Arc::new(Auth::new(credentials, options, http)?);
        Ok(Client {
            rest: Rest::new(Arc::clone(&auth)),
            soap: Soap::new(Arc::clone(&auth)),
            auth,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn valid_credentials() -> Credentials {
        Credentials {
            client_id: "XXXXX".to_string(),
            client_secret: "YYYYYY".to_string(),
            account_id: "1111111".to_string(),
            auth_url: "https://mct0l7nxfq2r988t1kxfy8sc47ma.auth.marketingcloudapis.com/"
                .to_string(),
            scope: None,
        }
    }

    #[test]
    fn build_without_credentials_fails() {
        match Builder::new().build() {
            Err(Error::Validation(message)) => {
                assert_eq!(message, "credentials or credentials_path is required");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn build_with_valid_credentials_succeeds() {
        let client = Builder::new().credentials(valid_credentials()).build();
        assert!(client.is_ok());
    }

    #[test]
    fn build_validates_credentials_eagerly() {
        let mut creds = valid_credentials();
        creds.account_id = "not-a-mid".to_string();
        assert!(matches!(
            Builder::new().credentials(creds).build(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn build_from_credentials_file() {
        let mut path = env::temp_dir();
        path.push(format!("sfmc_credentials_{}.json", std::process::id()));
        let raw = serde_json::to_string(&valid_credentials()).unwrap();
        std::fs::write(&path, raw).unwrap();
        let client = Builder::new().credentials_path(path.clone()).build();
        let _ = std::fs::remove_file(path);
        assert!(client.is_ok());
    }

    #[test]
    fn build_from_missing_file_fails() {
        let mut path = env::temp_dir();
        path.push(format!("sfmc_missing_{}.json", std::process::id()));
        assert!(matches!(
            Builder::new().credentials_path(path).build(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn retry_policy_clamps_to_one_attempt() {
        let policy = RetryPolicy::new(0, true);
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn event_handlers_debug_shows_what_is_set() {
        let handlers = EventHandlers::new().on_refresh(|_| {});
        let debug = format!("{handlers:?}");
        assert!(debug.contains("on_refresh: true"));
        assert!(debug.contains("on_loop: false"));
    }
}

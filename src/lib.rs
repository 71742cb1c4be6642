//! Unofficial Rust SDK for the Salesforce Marketing Cloud REST and SOAP
//! APIs.
//!
//! The crate centers on [`Client`], built from installed-package
//! [`Credentials`] via [`Builder`]. The client owns the OAuth2 session
//! lifecycle (acquisition, expiry tracking, coalesced refresh) and
//! exposes one dispatcher per API surface: [`rest::Rest`] for the REST
//! services and [`soap::Soap`] for the partner SOAP API. Transient
//! connection errors and expired-token responses are retried inside the
//! dispatchers according to the shared [`RetryPolicy`]; callers only see
//! final outcomes.
//!
//! ```no_run
//! use sfmc_core::{Builder, Credentials};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Builder::new()
//!     .credentials(Credentials {
//!         client_id: "your_client_id".to_string(),
//!         client_secret: "your_client_secret".to_string(),
//!         account_id: "1111111".to_string(),
//!         auth_url: "https://mct0l7nxfq2r988t1kxfy8sc47ma.auth.marketingcloudapis.com/"
//!             .to_string(),
//!         scope: None,
//!     })
//!     .build()?;
//!
//! let assets = client
//!     .rest()
//!     .get_bulk("/asset/v1/content/assets", None, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod rest;
pub mod soap;

pub use auth::{Credentials, Session, SUPPORTED_SCOPES};
pub use client::{
    Builder, Client, ConnectionErrorHook, CredentialsFrom, EventHandlers, LogHook, LoopHook,
    RefreshHook, RetryPolicy,
};
pub use error::{ConnectionErrorKind, Error};
pub use rest::RequestSpec;

/// Path of the OAuth2 token endpoint, relative to the tenant auth URL.
pub const TOKEN_ENDPOINT_PATH: &str = "/v2/token";

/// Path of the partner SOAP API service, relative to the tenant SOAP
/// instance URL.
pub const SOAP_SERVICE_PATH: &str = "/Service.asmx";

/// XML namespace of the partner SOAP API request bodies.
pub const PARTNER_API_NAMESPACE: &str = "http://exacttarget.com/wsdl/partnerAPI";

/// XML namespace of the SOAP 1.1 envelope.
pub const SOAP_ENVELOPE_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Default TCP connect timeout, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default end-to-end request timeout, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default page size for [`rest::Rest::get_bulk`].
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Fixed page size for `/legacy/v1` endpoints, which reject larger
/// `$top` values.
pub const LEGACY_PAGE_SIZE: u64 = 50;

/// Default concurrency bound for [`rest::Rest::get_collection`].
pub const DEFAULT_CONCURRENT_LIMIT: usize = 5;

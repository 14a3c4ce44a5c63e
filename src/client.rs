//! Exchange configuration and one-call helpers.
//!
//! [`HttpConfig`] holds the settings every [`HttpConn`] starts from; build
//! one with [`HttpConfig::builder()`] or deserialize it.
//!
//! # Example
//!
//! ```rust,ignore
//! use netloop::client::{http_get_with, HttpConfig};
//!
//! let config = HttpConfig::builder()
//!     .timeout_ms(5_000)
//!     .max_redirects(2)
//!     .user_agent("fetcher")
//!     .build();
//!
//! let resp = http_get_with("http://example.com/", &config)?;
//! println!("{} bytes", resp.body().len());
//! ```

use crate::base::eventloop::EventLoop;
use crate::base::neterror::NetError;
use crate::dns::ResolverConfig;
use crate::http::{HttpConn, HttpResponse, RequestBody};
use crate::socket::proxy::ProxySettings;
use http::Method;
use serde::{Deserialize, Serialize};

/// Settings for an HTTP exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Milliseconds without progress before `Timeout`; `0` disables.
    pub timeout_ms: u64,
    /// Redirects followed automatically; `0` disables following.
    pub max_redirects: u32,
    pub auto_redirect: bool,
    /// Accept any header name in `set_header`.
    pub skip_header_check: bool,
    /// Hold request bodies until `100 Continue`.
    pub expect_continue: bool,
    /// Do not buffer the body; consume `DataPartial` instead.
    pub stream_only: bool,
    /// Agent name; the program name when unset.
    pub user_agent: Option<String>,
    /// Address-family policy for lookups.
    pub resolver: ResolverConfig,
    /// HTTP proxy; never serialized since it may carry credentials.
    #[serde(skip)]
    pub proxy: Option<ProxySettings>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_redirects: 5,
            auto_redirect: true,
            skip_header_check: false,
            expect_continue: false,
            stream_only: false,
            user_agent: None,
            resolver: ResolverConfig::default(),
            proxy: None,
        }
    }
}

impl HttpConfig {
    pub fn builder() -> HttpConfigBuilder {
        HttpConfigBuilder::default()
    }
}

/// Builder for [`HttpConfig`].
#[derive(Debug, Default)]
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn max_redirects(mut self, max: u32) -> Self {
        self.config.max_redirects = max;
        self
    }

    pub fn auto_redirect(mut self, on: bool) -> Self {
        self.config.auto_redirect = on;
        self
    }

    pub fn skip_header_check(mut self, on: bool) -> Self {
        self.config.skip_header_check = on;
        self
    }

    pub fn expect_continue(mut self, on: bool) -> Self {
        self.config.expect_continue = on;
        self
    }

    pub fn stream_only(mut self, on: bool) -> Self {
        self.config.stream_only = on;
        self
    }

    pub fn user_agent(mut self, agent: &str) -> Self {
        self.config.user_agent = Some(agent.to_string());
        self
    }

    pub fn resolver(mut self, resolver: ResolverConfig) -> Self {
        self.config.resolver = resolver;
        self
    }

    /// Set proxy.
    pub fn proxy(mut self, proxy: ProxySettings) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    pub fn build(self) -> HttpConfig {
        self.config
    }
}

/// Run one request on a private event loop and collect the response.
pub fn fetch(
    method: Method,
    url: &str,
    body: Option<RequestBody>,
    config: &HttpConfig,
) -> Result<HttpResponse, NetError> {
    let event_loop = EventLoop::new()?;
    let conn = HttpConn::with_config(&event_loop, config);
    conn.set_uri(url)?;
    conn.set_method(method, body);
    conn.run()?;
    let response = conn.take_response().ok_or(NetError::EmptyResponse);
    conn.delete();
    response
}

/// GET `url` with default settings.
pub fn http_get(url: &str) -> Result<HttpResponse, NetError> {
    fetch(Method::GET, url, None, &HttpConfig::default())
}

pub fn http_get_with(url: &str, config: &HttpConfig) -> Result<HttpResponse, NetError> {
    fetch(Method::GET, url, None, config)
}

//! Plain HTTP proxy settings.
//!
//! Requests through a proxy are sent to the proxy's address with an
//! absolute-form request target; there is no tunnelling.

use base64::{engine::general_purpose, Engine as _};
use url::Url;
use zeroize::Zeroizing;

/// HTTP proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.example:3128`)
    pub url: Url,
    /// Proxy username for authentication
    pub username: Option<String>,
    /// Proxy password (zeroized on drop)
    pub password: Option<Zeroizing<String>>,
    enabled: bool,
}

impl ProxySettings {
    /// Proxy at `url_str`. A missing scheme means `http://`; any other
    /// scheme is rejected.
    pub fn new(url_str: &str) -> Option<Self> {
        let url = if url_str.contains("://") {
            Url::parse(url_str).ok()?
        } else {
            Url::parse(&format!("http://{url_str}")).ok()?
        };
        if url.scheme() != "http" || url.host_str().is_none() {
            tracing::debug!(url = %url, "unsupported proxy url");
            return None;
        }

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(|p| Zeroizing::new(p.to_string()));
        Some(Self {
            url,
            username,
            password,
            enabled: true,
        })
    }

    /// Proxy from `HTTP_PROXY`/`http_proxy`.
    pub fn from_env() -> Option<Self> {
        let url_str = std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .ok()?;
        Self::new(&url_str)
    }

    /// Add authentication credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Turn the proxy on or off without forgetting it.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get `Proxy-Authorization` header value.
    pub fn auth_header(&self) -> Option<String> {
        let (u, p) = (self.username.as_ref()?, self.password.as_ref()?);
        let creds = Zeroizing::new(format!("{}:{}", u, p.as_str()));
        Some(format!("Basic {}", general_purpose::STANDARD.encode(creds.as_bytes())))
    }

    /// Check if this proxy requires authentication.
    pub fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Get proxy host and port.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let host = self.url.host_str()?;
        Some((host, self.url.port().unwrap_or(80)))
    }
}

/// Builder for ProxySettings.
#[derive(Default)]
pub struct ProxyBuilder {
    url: Option<String>,
    username: Option<String>,
    password: Option<Zeroizing<String>>,
    disabled: bool,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set proxy address, with or without `http://`.
    pub fn http(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    pub fn auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(Zeroizing::new(password.to_string()));
        self
    }

    /// Build the settings switched off.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn build(self) -> Option<ProxySettings> {
        let mut settings = ProxySettings::new(self.url.as_deref()?)?;
        if let Some(username) = self.username {
            settings.username = Some(username);
            settings.password = self.password;
        }
        settings.enabled = !self.disabled;
        Some(settings)
    }
}

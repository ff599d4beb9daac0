//! Runtime configuration for the proxy and the session manager.

/// Default first port tried by the reverse proxy.
pub const DEFAULT_PROXY_BASE_PORT: u16 = 8000;
/// Default number of ports tried before giving up.
pub const DEFAULT_PROXY_ATTEMPTS: u16 = 10;
/// Backend port suggested when no session exists yet.
pub const DEFAULT_BACKEND_PORT: u16 = 8097;
/// Host the proxy listener binds to.
pub const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
/// Host handed to the embedded backend and used in the injected loader URL.
pub const DEFAULT_BACKEND_HOST: &str = "localhost";

/// Bind settings for one reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub base_port: u16,
    pub max_attempts: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PROXY_HOST.to_string(),
            base_port: DEFAULT_PROXY_BASE_PORT,
            max_attempts: DEFAULT_PROXY_ATTEMPTS,
        }
    }
}

impl ProxyConfig {
    /// Candidate ports in bind order. Stops at `u16::MAX` instead of wrapping.
    pub fn candidate_ports(&self) -> impl Iterator<Item = u16> {
        let base = self.base_port;
        (0..self.max_attempts).map_while(move |offset| base.checked_add(offset))
    }
}

/// Settings shared by every session created by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub proxy: ProxyConfig,
    pub default_backend_port: u16,
    pub backend_host: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            default_backend_port: DEFAULT_BACKEND_PORT,
            backend_host: DEFAULT_BACKEND_HOST.to_string(),
        }
    }
}

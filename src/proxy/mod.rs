//! Reverse proxy in front of a local dev server.
//!
//! Every request is forwarded to `http://localhost:{target_port}` with the
//! `Host` header rewritten to the target. HTML responses are buffered and
//! passed through the [`interceptor`](crate::interceptor); everything else,
//! including WebSocket upgrades, is relayed untouched.

mod forward;
mod server;

pub use forward::{ProxyBody, ProxyService};
pub use server::{bind_with_retry, start_proxy, ProxyHandle};

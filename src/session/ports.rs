//! Backend port suggestion for new sessions.
//!
//! Several backends may run at once, so each new session is offered the port
//! above the highest backend port already in use. The suggestion is computed
//! from the current registry every time; nothing is remembered between calls.

use std::collections::BTreeMap;

/// Suggest a backend port given the backend ports currently in use.
pub fn suggest_backend_port<I>(in_use: I, default_port: u16) -> u16
where
    I: IntoIterator<Item = u16>,
{
    in_use
        .into_iter()
        .max()
        .map(|max| max.saturating_add(1))
        .unwrap_or(default_port)
}

/// Map backend port to target port, for every `(target, backend)` pair.
pub fn backend_port_map<I>(sessions: I) -> BTreeMap<u16, u16>
where
    I: IntoIterator<Item = (u16, u16)>,
{
    sessions
        .into_iter()
        .map(|(target_port, backend_port)| (backend_port, target_port))
        .collect()
}

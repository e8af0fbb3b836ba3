//! Port negotiation for the backend worker.
//!
//! Candidates are probed one at a time on the loopback interface. A probe that
//! errors for any reason counts as "not free", so an unclear answer never hands
//! the worker a port another service already holds.

use std::future::Future;
use tokio::net::TcpListener;

/// Returned when an explicit override is present but not a valid port.
pub const INVALID_OVERRIDE_PORT: u16 = 5000;

/// Returned when every candidate is taken.
pub const FALLBACK_PORT: u16 = 5001;

pub trait PortProbe {
    fn is_free(&self, port: u16) -> impl Future<Output = bool> + Send;
}

/// Binds a throwaway listener on `127.0.0.1:port` and drops it right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
    async fn is_free(&self, port: u16) -> bool {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(e) => {
                tracing::debug!("[backend] Port {} unavailable: {}", port, e);
                false
            }
        }
    }
}

pub async fn resolve_port(explicit_override: Option<&str>, candidates: &[u16]) -> u16 {
    resolve_port_with(&LoopbackProbe, explicit_override, candidates).await
}

pub async fn resolve_port_with<P: PortProbe + Sync>(
    probe: &P,
    explicit_override: Option<&str>,
    candidates: &[u16],
) -> u16 {
    if let Some(raw) = explicit_override {
        return match raw.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!(
                    "[backend] Invalid port override {:?}, using {}",
                    raw,
                    INVALID_OVERRIDE_PORT
                );
                INVALID_OVERRIDE_PORT
            }
        };
    }

    // sequential on purpose: parallel probes could both see the same port free
    for &candidate in candidates {
        if probe.is_free(candidate).await {
            return candidate;
        }
    }

    tracing::warn!(
        "[backend] No free port among {:?}, falling back to {}",
        candidates,
        FALLBACK_PORT
    );
    FALLBACK_PORT
}

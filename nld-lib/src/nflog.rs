//! Optional packet-capture dispatch hook, grounded on
//! `nflog_dispatcher.py`. The original wires an NFLOG queue to a callback
//! for auditing dropped/trusted traffic; this daemon has no behavioural
//! dependency on it, so the only shipped implementation just logs.

use tracing::debug;

/// Receives a raw captured payload and the interface it arrived on. Never
/// called from the reconciliation path — purely an observability hook a
/// deployment can wire up to a real NFLOG queue if it wants one.
pub trait PacketDispatcher: Send + Sync {
    fn dispatch(&self, iface: &str, payload: &[u8]);
}

/// Default implementation: logs and discards.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

impl PacketDispatcher for LoggingDispatcher {
    fn dispatch(&self, iface: &str, payload: &[u8]) {
        debug!(iface, bytes = payload.len(), "nflog packet observed");
    }
}

//! Security interface consumed by the engine
//!
//! Before a session or channel is allowed to proceed, the engine asks an
//! external security service whether access is permitted. The check is
//! asynchronous: the delegate receives the request and the verdict comes
//! back through [`crate::RfcommEngine::security_result`], echoing the
//! original request so the engine can cross-check it against the state
//! that is current by then.

use crate::types::{BdAddr, Dlci, Scn};

/// Direction of the access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityDirection {
    /// This side is opening towards the peer.
    Outgoing,
    /// The peer is opening towards this side.
    Incoming,
}

/// What the check is gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityScope {
    /// Establishment of the session multiplexer.
    Session,
    /// Establishment of one channel.
    Channel(Dlci),
}

/// One access check request.
///
/// `scn` is absent only for the session-level check on an inbound
/// connection, where no server channel has been named yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityCheck {
    pub addr: BdAddr,
    pub scn: Option<Scn>,
    pub direction: SecurityDirection,
    pub scope: SecurityScope,
}

/// Receives access check requests from the engine.
pub trait SecurityDelegate {
    fn request_access(&mut self, check: SecurityCheck);
}

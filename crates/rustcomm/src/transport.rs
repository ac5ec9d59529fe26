//! Transport interface consumed by the engine
//!
//! RFCOMM rides on a connection-oriented packet transport (L2CAP in basic
//! mode). The engine drives the transport exclusively through this trait;
//! everything the transport reports back enters through the
//! `transport_*` methods on [`crate::RfcommEngine`].

use crate::error::RfcommResult;
use crate::types::BdAddr;

/// Identifier the transport assigns to one of its connections.
pub type TransportId = u16;

/// Outbound operations on the packet transport.
///
/// All calls are fire-and-forget except `connect`, which synchronously
/// allocates an identifier; the actual outcome of every operation is
/// reported back asynchronously through the engine's `transport_*`
/// methods.
pub trait L2capShim {
    /// Starts connecting to `addr`. The result arrives later via
    /// `transport_connect_result` followed by `transport_connect_response`.
    fn connect(&mut self, addr: BdAddr) -> RfcommResult<TransportId>;

    /// Answers a connection request previously surfaced through
    /// `transport_connect_requested`.
    fn connect_response(&mut self, id: TransportId, accept: bool);

    /// Requests configuration of the connection, announcing the MTU this
    /// side is willing to receive.
    fn config_request(&mut self, id: TransportId, mtu: u16);

    /// Answers the peer's configuration request.
    fn config_response(&mut self, id: TransportId, accept: bool);

    /// Sends one raw frame.
    fn send(&mut self, id: TransportId, frame: Vec<u8>);

    /// Tears the connection down.
    fn disconnect(&mut self, id: TransportId);
}

/// Why the transport reported an abnormal disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The link to the peer was lost.
    LinkLoss,
    /// Both sides raced to open the same connection and the transport
    /// aborted one attempt. The session restarts instead of tearing down.
    StateCollision,
    /// Any other transport-level failure.
    Other,
}

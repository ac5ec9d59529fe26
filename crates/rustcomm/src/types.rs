//! Type definitions for RFCOMM operations
//!
//! This module contains the core data structures used by the RFCOMM engine:
//! protocol identifiers (DLCI, server channel, handle), negotiated records
//! (port settings, modem signals) and the events delivered to applications.

use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::RfcommError;

/// Server channel numbers occupy 1..=30.
pub const MAX_SERVER_CHANNEL: u8 = 30;

/// Channel handles occupy 1..=36.
pub const MAX_HANDLE: u8 = 36;

/// Upper bound for both the outbound and inbound per-channel packet queues.
pub const MAX_QUEUE_COUNT: usize = 10;

/// Default receive MTU offered in parameter negotiation when the application
/// does not request a specific value.
pub const DEFAULT_MTU: u16 = 672;

/// Worst-case frame overhead on top of the information payload:
/// address + control + two-octet length + credit + FCS.
pub const FRAME_OVERHEAD: u16 = 6;

/// Initial credit grant carried in the PN exchange. The k field is 3 bits
/// wide, so 7 is the largest expressible grant.
pub const DEFAULT_CREDITS: u8 = 7;

/// Ceiling for outstanding credits granted to the peer. Bounded by the
/// receive queue capacity so a compliant peer can never overflow it.
pub const MAX_CREDITS: u8 = MAX_QUEUE_COUNT as u8;

/// Handle identifying one channel to the application while it is open.
pub type Handle = u8;

/// Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Role of this side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side initiated the transport connection.
    Initiator,
    /// This side accepted the transport connection.
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// Server Channel Number, the application-facing channel number (1..=30).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scn(u8);

impl Scn {
    pub fn new(value: u8) -> Result<Self, RfcommError> {
        if value == 0 || value > MAX_SERVER_CHANNEL {
            return Err(RfcommError::InvalidParameter(format!(
                "server channel {} out of range",
                value
            )));
        }
        Ok(Scn(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data Link Connection Identifier: a 6-bit value encoding a server channel
/// number plus a direction bit. DLCI 0 is the multiplexer control channel;
/// user channels occupy 2..=61. DLCI 1 is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dlci(u8);

impl Dlci {
    /// The multiplexer control channel.
    pub const MUX_CONTROL: Dlci = Dlci(0);

    pub fn new(value: u8) -> Result<Self, RfcommError> {
        match value {
            0 | 2..=61 => Ok(Dlci(value)),
            _ => Err(RfcommError::InvalidParameter(format!(
                "DLCI {} out of range",
                value
            ))),
        }
    }

    /// Derives the user DLCI for a server channel: `scn * 2` when this side
    /// initiated the session, `scn * 2 + 1` otherwise.
    pub fn from_scn(scn: Scn, role: Role) -> Self {
        let direction = if role.is_initiator() { 0 } else { 1 };
        Dlci(scn.value() * 2 + direction)
    }

    /// The server channel this DLCI addresses.
    pub fn scn(&self) -> Result<Scn, RfcommError> {
        Scn::new(self.0 >> 1)
    }

    /// The same channel with the opposite direction bit, used when a
    /// connect collision demotes this side from initiator to responder.
    pub fn flipped(&self) -> Self {
        Dlci(self.0 ^ 1)
    }

    pub fn is_mux_control(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Dlci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flow control mode negotiated for a session. Fixed by the first PN
/// exchange and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    /// No PN exchange has completed yet.
    Unknown,
    /// GSM 07.10 flow control via MSC flow bit and FCON/FCOFF.
    Normal,
    /// RFCOMM credit-based flow control.
    CreditBased,
}

bitflags! {
    /// V.24 signal bits carried in the MSC command, EA bit excluded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModemSignals: u8 {
        /// Flow control: the sender cannot accept frames.
        const FC  = 0x02;
        /// Ready to communicate.
        const RTC = 0x04;
        /// Ready to receive.
        const RTR = 0x08;
        /// Incoming call indicator.
        const IC  = 0x40;
        /// Data valid.
        const DV  = 0x80;
    }
}

impl Default for ModemSignals {
    fn default() -> Self {
        ModemSignals::RTC | ModemSignals::RTR | ModemSignals::DV
    }
}

bitflags! {
    /// Mask selecting which events a channel owner wants delivered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u16 {
        const CONNECT_SUCCESS    = 1 << 0;
        const CONNECT_FAIL       = 1 << 1;
        const CONNECT_INCOMING   = 1 << 2;
        const DISCONNECTED       = 1 << 3;
        const DISCONNECT_SUCCESS = 1 << 4;
        const DATA_RECEIVED      = 1 << 5;
        const FLOW_ON            = 1 << 6;
        const REMOTE_LINE_STATUS = 1 << 7;
        const MODEM_STATUS       = 1 << 8;
        const REMOTE_PORT_CONFIG = 1 << 9;
    }
}

impl EventMask {
    pub fn accepts(&self, event: &ChannelEvent) -> bool {
        self.contains(event.mask_bit())
    }
}

/// Remote port settings exchanged through RPN. Purely informational; the
/// engine stores and echoes them but never acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// Baud rate code, 0x00 (2400) through 0x07 (230400).
    pub baud_rate: u8,
    /// Data bit code: 0 = 5 bits, 1 = 6, 2 = 7, 3 = 8.
    pub data_bits: u8,
    /// Stop bit code: 0 = 1 stop bit, 1 = 1.5 stop bits.
    pub stop_bit: u8,
    /// Parity enable: 0 = none, 1 = parity in use.
    pub parity: u8,
    /// Parity type code when parity is in use.
    pub parity_type: u8,
    /// Line flow control bits (XON/XOFF, RTR, RTC in each direction).
    pub flow_control: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
    /// Which of the above the sender intends to change.
    pub parameter_mask: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        // 9600 8N1, no line flow control, DC1/DC3, all parameters indicated.
        Self {
            baud_rate: 0x03,
            data_bits: 0x03,
            stop_bit: 0,
            parity: 0,
            parity_type: 0,
            flow_control: 0,
            xon_char: 0x11,
            xoff_char: 0x13,
            parameter_mask: 0x3F7F,
        }
    }
}

/// Remote line status carried in RLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Ok,
    OverrunError,
    ParityError,
    FramingError,
}

impl LineStatus {
    pub fn to_octet(&self) -> u8 {
        match self {
            LineStatus::Ok => 0x00,
            LineStatus::OverrunError => 0x03,
            LineStatus::ParityError => 0x05,
            LineStatus::FramingError => 0x09,
        }
    }

    pub fn from_octet(octet: u8) -> Self {
        match octet & 0x0F {
            0x03 => LineStatus::OverrunError,
            0x05 => LineStatus::ParityError,
            0x09 => LineStatus::FramingError,
            _ => LineStatus::Ok,
        }
    }
}

/// Cumulative traffic counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortState {
    pub received_bytes: u32,
    pub transmitted_bytes: u32,
}

/// Events delivered to the application that owns a channel or server.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel reached the connected state and data may flow.
    ConnectSuccess {
        handle: Handle,
        send_mtu: u16,
        recv_mtu: u16,
    },
    /// An outbound connection attempt failed; the channel is gone.
    ConnectFail { handle: Handle },
    /// A peer is asking to open a channel towards a registered server.
    ConnectIncoming {
        handle: Handle,
        addr: BdAddr,
        scn: Scn,
    },
    /// The peer or the transport closed the channel.
    Disconnected { handle: Handle },
    /// A locally requested disconnect completed.
    DisconnectSuccess { handle: Handle },
    /// Data is waiting in the receive queue.
    DataReceived { handle: Handle },
    /// The channel was flow-blocked towards the application and may now
    /// accept writes again.
    FlowOn { handle: Handle },
    /// The peer reported a line status change.
    RemoteLineStatus { handle: Handle, status: LineStatus },
    /// The peer updated its modem signals.
    ModemStatus {
        handle: Handle,
        signals: ModemSignals,
        break_signal: Option<u8>,
    },
    /// The peer sent or answered a port configuration exchange.
    RemotePortConfig { handle: Handle, config: PortConfig },
}

impl ChannelEvent {
    fn mask_bit(&self) -> EventMask {
        match self {
            ChannelEvent::ConnectSuccess { .. } => EventMask::CONNECT_SUCCESS,
            ChannelEvent::ConnectFail { .. } => EventMask::CONNECT_FAIL,
            ChannelEvent::ConnectIncoming { .. } => EventMask::CONNECT_INCOMING,
            ChannelEvent::Disconnected { .. } => EventMask::DISCONNECTED,
            ChannelEvent::DisconnectSuccess { .. } => EventMask::DISCONNECT_SUCCESS,
            ChannelEvent::DataReceived { .. } => EventMask::DATA_RECEIVED,
            ChannelEvent::FlowOn { .. } => EventMask::FLOW_ON,
            ChannelEvent::RemoteLineStatus { .. } => EventMask::REMOTE_LINE_STATUS,
            ChannelEvent::ModemStatus { .. } => EventMask::MODEM_STATUS,
            ChannelEvent::RemotePortConfig { .. } => EventMask::REMOTE_PORT_CONFIG,
        }
    }
}

/// Callback invoked for channel events.
pub type ChannelEventCallback = Arc<Mutex<dyn FnMut(ChannelEvent) + Send + 'static>>;

//! RFCOMM frame codec
//!
//! Stateless transforms between transport packets and typed frame events.
//! Frame layout follows GSM 07.10 5.2: one address octet, one control
//! octet, an EA-encoded length of one or two octets, the information
//! payload and a trailing FCS octet. UIH frames carrying user data may
//! additionally hold a one-octet credit field when the session uses
//! credit-based flow control.

pub mod fcs;
pub mod mux;

use log::warn;
use thiserror::Error;

use crate::types::{Dlci, LineStatus, ModemSignals, PortConfig, Role};
use fcs::{calculate_fcs, verify_fcs};
use mux::{MuxCommand, MuxCr, MuxParse, PnParams};

/// Smallest possible frame: address, control, length, FCS.
const MIN_FRAME_SIZE: usize = 4;

/// P/F bit position in the control octet.
const PF_BIT: u8 = 0x10;

/// Errors raised while decoding a frame. All of them collapse into
/// [`FrameEvent::FrameError`]; there is no retransmission, the frame is
/// simply dropped.
#[derive(Error, Debug, PartialEq)]
pub enum FrameParseError {
    #[error("Provided buffer is too small")]
    BufferTooSmall,

    #[error("FCS check for the frame failed")]
    FcsCheckFailed,

    #[error("DLCI {0} is invalid")]
    InvalidDlci(u8),

    #[error("Frame is malformed")]
    InvalidFrame,

    #[error("Frame type is unsupported")]
    UnsupportedFrameType,
}

/// The type of frame encoded in the control field, P/F bit masked out.
/// See GSM 07.10 5.2.1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Sabm,
    Ua,
    Dm,
    Disc,
    Uih,
}

impl FrameType {
    fn from_control(control: u8) -> Option<Self> {
        match control & !PF_BIT {
            0x2F => Some(FrameType::Sabm),
            0x63 => Some(FrameType::Ua),
            0x0F => Some(FrameType::Dm),
            0x43 => Some(FrameType::Disc),
            0xEF => Some(FrameType::Uih),
            _ => None,
        }
    }

    fn control(&self) -> u8 {
        match self {
            FrameType::Sabm => 0x2F,
            FrameType::Ua => 0x63,
            FrameType::Dm => 0x0F,
            FrameType::Disc => 0x43,
            FrameType::Uih => 0xEF,
        }
    }

    /// Octets covered by the FCS: UIH covers address and control only,
    /// every other type also covers the length octet. GSM 07.10 B.3.3.
    fn fcs_octets(&self) -> usize {
        if *self == FrameType::Uih {
            2
        } else {
            3
        }
    }
}

/// A decoded inbound frame, tagged with the FSM that must consume it.
#[derive(Debug, PartialEq)]
pub enum FrameEvent {
    /// Control-channel traffic addressed at the session itself.
    Session(SessionFrame),
    /// Traffic addressed at one user DLCI.
    Channel { dlci: Dlci, frame: ChannelFrame },
    /// The frame failed validation and was dropped.
    FrameError,
    /// A control-channel command type this implementation does not
    /// support; answered with an NSC response.
    UnsupportedCommand { command_type: u8 },
}

/// Session-level frames and control commands without a target DLCI.
#[derive(Debug, PartialEq)]
pub enum SessionFrame {
    Sabm,
    Ua,
    Dm,
    Disc,
    Test { cr: MuxCr, payload: Vec<u8> },
    FlowControlOn { cr: MuxCr },
    FlowControlOff { cr: MuxCr },
    NotSupported { command_type: u8 },
}

/// Frames and control commands targeting one user DLCI.
#[derive(Debug, PartialEq)]
pub enum ChannelFrame {
    Sabm,
    Ua,
    Dm,
    Disc,
    Data {
        payload: Vec<u8>,
        /// Credits granted by the peer, zero when the frame carried none.
        credits: u8,
    },
    ParameterNegotiation {
        cr: MuxCr,
        params: PnParams,
    },
    ModemStatus {
        cr: MuxCr,
        signals: ModemSignals,
        break_signal: Option<u8>,
    },
    PortNegotiation {
        cr: MuxCr,
        config: Option<PortConfig>,
    },
    LineStatus {
        cr: MuxCr,
        status: LineStatus,
    },
}

/// Decodes one transport packet received by a session with the given
/// role. `credit_based` selects whether UIH data frames with P/F set
/// carry a credit octet.
pub fn decode(role: Role, credit_based: bool, buf: &[u8]) -> FrameEvent {
    match try_decode(role, credit_based, buf) {
        Ok(event) => event,
        Err(e) => {
            warn!("dropping bad frame ({}): {}", e, hex::encode(buf));
            FrameEvent::FrameError
        }
    }
}

fn try_decode(role: Role, credit_based: bool, buf: &[u8]) -> Result<FrameEvent, FrameParseError> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(FrameParseError::BufferTooSmall);
    }

    let address = buf[0];
    if address & 0x01 == 0 {
        return Err(FrameParseError::InvalidFrame);
    }
    let dlci_raw = address >> 2;
    let dlci = Dlci::new(dlci_raw).map_err(|_| FrameParseError::InvalidDlci(dlci_raw))?;
    let cr_bit = address & 0x02 != 0;

    let control = buf[1];
    let frame_type =
        FrameType::from_control(control).ok_or(FrameParseError::UnsupportedFrameType)?;
    let poll_final = control & PF_BIT != 0;

    // A received frame is a command when its C/R bit matches the peer's
    // command encoding: the initiator marks commands with 1, the
    // responder with 0. GSM 07.10 5.2.1.2 table 1.
    let is_command = cr_bit == !role.is_initiator();

    // EA-encoded length: a cleared EA bit in the first octet announces a
    // second one carrying the upper seven bits.
    let first = buf[2];
    let (length, header_size) = if first & 0x01 != 0 {
        ((first >> 1) as usize, 3)
    } else {
        if buf.len() < MIN_FRAME_SIZE + 1 {
            return Err(FrameParseError::BufferTooSmall);
        }
        ((first >> 1) as usize | (buf[3] as usize) << 7, 4)
    };

    let credit_len = usize::from(
        frame_type == FrameType::Uih && poll_final && credit_based && !dlci.is_mux_control(),
    );

    let fcs_index = header_size + credit_len + length;
    if buf.len() != fcs_index + 1 {
        return Err(FrameParseError::BufferTooSmall);
    }
    if !verify_fcs(buf[fcs_index], &buf[..frame_type.fcs_octets()]) {
        return Err(FrameParseError::FcsCheckFailed);
    }

    match frame_type {
        FrameType::Sabm | FrameType::Disc => {
            if !poll_final || !is_command || length != 0 {
                return Err(FrameParseError::InvalidFrame);
            }
        }
        FrameType::Ua => {
            if !poll_final || is_command || length != 0 {
                return Err(FrameParseError::InvalidFrame);
            }
        }
        // The P/F bit is not checked for DM: a peer may answer with
        // either value depending on what it is rejecting.
        FrameType::Dm => {
            if is_command || length != 0 {
                return Err(FrameParseError::InvalidFrame);
            }
        }
        FrameType::Uih => {
            if !is_command {
                return Err(FrameParseError::InvalidFrame);
            }
        }
    }

    if dlci.is_mux_control() {
        let event = match frame_type {
            FrameType::Sabm => FrameEvent::Session(SessionFrame::Sabm),
            FrameType::Ua => FrameEvent::Session(SessionFrame::Ua),
            FrameType::Dm => FrameEvent::Session(SessionFrame::Dm),
            FrameType::Disc => FrameEvent::Session(SessionFrame::Disc),
            FrameType::Uih => route_mux_command(&buf[header_size..fcs_index])?,
        };
        return Ok(event);
    }

    let frame = match frame_type {
        FrameType::Sabm => ChannelFrame::Sabm,
        FrameType::Ua => ChannelFrame::Ua,
        FrameType::Dm => ChannelFrame::Dm,
        FrameType::Disc => ChannelFrame::Disc,
        FrameType::Uih => {
            let credits = if credit_len == 1 { buf[header_size] } else { 0 };
            ChannelFrame::Data {
                payload: buf[header_size + credit_len..fcs_index].to_vec(),
                credits,
            }
        }
    };
    Ok(FrameEvent::Channel { dlci, frame })
}

/// Routes a decoded control-channel command to its owning FSM: commands
/// carrying a target DLCI go to that channel, the rest to the session.
fn route_mux_command(payload: &[u8]) -> Result<FrameEvent, FrameParseError> {
    let command = match MuxCommand::parse(payload)? {
        MuxParse::Command(command) => command,
        MuxParse::Unsupported { command_type } => {
            return Ok(FrameEvent::UnsupportedCommand { command_type })
        }
    };

    let event = match command {
        MuxCommand::ParameterNegotiation { cr, params } => FrameEvent::Channel {
            dlci: params.dlci,
            frame: ChannelFrame::ParameterNegotiation { cr, params },
        },
        MuxCommand::ModemStatus {
            cr,
            dlci,
            signals,
            break_signal,
        } => FrameEvent::Channel {
            dlci,
            frame: ChannelFrame::ModemStatus {
                cr,
                signals,
                break_signal,
            },
        },
        MuxCommand::RemotePortNegotiation { cr, dlci, config } => FrameEvent::Channel {
            dlci,
            frame: ChannelFrame::PortNegotiation { cr, config },
        },
        MuxCommand::RemoteLineStatus { cr, dlci, status } => FrameEvent::Channel {
            dlci,
            frame: ChannelFrame::LineStatus { cr, status },
        },
        MuxCommand::Test { cr, payload } => {
            FrameEvent::Session(SessionFrame::Test { cr, payload })
        }
        MuxCommand::FlowControlOn { cr } => {
            FrameEvent::Session(SessionFrame::FlowControlOn { cr })
        }
        MuxCommand::FlowControlOff { cr } => {
            FrameEvent::Session(SessionFrame::FlowControlOff { cr })
        }
        MuxCommand::NotSupported { command_type } => {
            FrameEvent::Session(SessionFrame::NotSupported { command_type })
        }
    };
    Ok(event)
}

/// C/R bit for an outbound frame: the initiator marks commands with 1
/// and responses with 0, the responder the other way around.
fn cr_bit(role: Role, is_command: bool) -> bool {
    is_command == role.is_initiator()
}

fn address_octet(dlci: Dlci, cr: bool) -> u8 {
    (dlci.value() << 2) | (u8::from(cr) << 1) | 0x01
}

fn push_length(out: &mut Vec<u8>, length: usize) {
    if length <= 0x7F {
        out.push(((length as u8) << 1) | 0x01);
    } else {
        out.push(((length & 0x7F) as u8) << 1);
        out.push((length >> 7) as u8);
    }
}

fn encode_control_frame(role: Role, dlci: Dlci, frame_type: FrameType, is_command: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_FRAME_SIZE);
    out.push(address_octet(dlci, cr_bit(role, is_command)));
    out.push(frame_type.control() | PF_BIT);
    out.push(0x01);
    out.push(calculate_fcs(&out));
    out
}

/// SABM command with P/F set.
pub fn encode_sabm(role: Role, dlci: Dlci) -> Vec<u8> {
    encode_control_frame(role, dlci, FrameType::Sabm, true)
}

/// DISC command with P/F set.
pub fn encode_disc(role: Role, dlci: Dlci) -> Vec<u8> {
    encode_control_frame(role, dlci, FrameType::Disc, true)
}

/// UA response with P/F set.
pub fn encode_ua(role: Role, dlci: Dlci) -> Vec<u8> {
    encode_control_frame(role, dlci, FrameType::Ua, false)
}

/// DM response.
pub fn encode_dm(role: Role, dlci: Dlci) -> Vec<u8> {
    encode_control_frame(role, dlci, FrameType::Dm, false)
}

/// UIH data frame on a user DLCI. A credit grant rides in front of the
/// payload with P/F set; the length field covers the payload only.
pub fn encode_data(role: Role, dlci: Dlci, payload: &[u8], credits: Option<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(address_octet(dlci, cr_bit(role, true)));
    let pf = if credits.is_some() { PF_BIT } else { 0 };
    out.push(FrameType::Uih.control() | pf);
    push_length(&mut out, payload.len());
    let fcs = calculate_fcs(&out[..2]);
    if let Some(credits) = credits {
        out.push(credits);
    }
    out.extend_from_slice(payload);
    out.push(fcs);
    out
}

/// UIH frame on the control channel carrying a multiplexer command.
pub fn encode_mux_command(role: Role, command: &MuxCommand) -> Vec<u8> {
    let payload = command.encode();
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(address_octet(Dlci::MUX_CONTROL, cr_bit(role, true)));
    out.push(FrameType::Uih.control());
    push_length(&mut out, payload.len());
    let fcs = calculate_fcs(&out[..2]);
    out.extend_from_slice(&payload);
    out.push(fcs);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Scn, DEFAULT_CREDITS};
    use mux::CL_CREDIT_REQUEST;

    #[test]
    fn test_sabm0_matches_reference_bytes() {
        // Initiator SABM on the control channel: 03 3F 01 1C.
        let frame = encode_sabm(Role::Initiator, Dlci::MUX_CONTROL);
        assert_eq!(frame, vec![0x03, 0x3F, 0x01, 0x1C]);
    }

    #[test]
    fn test_control_frame_round_trips() {
        let dlci = Dlci::from_scn(Scn::new(5).unwrap(), Role::Initiator);

        let frame = encode_sabm(Role::Initiator, dlci);
        assert_eq!(
            decode(Role::Responder, false, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Sabm
            }
        );

        let frame = encode_ua(Role::Responder, dlci);
        assert_eq!(
            decode(Role::Initiator, false, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Ua
            }
        );

        let frame = encode_dm(Role::Responder, dlci);
        assert_eq!(
            decode(Role::Initiator, false, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Dm
            }
        );

        let frame = encode_disc(Role::Initiator, dlci);
        assert_eq!(
            decode(Role::Responder, false, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Disc
            }
        );
    }

    #[test]
    fn test_session_frames_on_control_dlci() {
        let frame = encode_sabm(Role::Initiator, Dlci::MUX_CONTROL);
        assert_eq!(
            decode(Role::Responder, false, &frame),
            FrameEvent::Session(SessionFrame::Sabm)
        );

        let frame = encode_ua(Role::Responder, Dlci::MUX_CONTROL);
        assert_eq!(
            decode(Role::Initiator, false, &frame),
            FrameEvent::Session(SessionFrame::Ua)
        );
    }

    #[test]
    fn test_wrong_direction_is_rejected() {
        // A SABM decoded by its own sender's role fails the command check.
        let frame = encode_sabm(Role::Initiator, Dlci::MUX_CONTROL);
        assert_eq!(decode(Role::Initiator, false, &frame), FrameEvent::FrameError);
    }

    #[test]
    fn test_flipping_any_bit_invalidates_frame() {
        let dlci = Dlci::new(10).unwrap();
        let frame = encode_data(Role::Initiator, dlci, b"hello", None);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                // Every single-bit corruption must fail to decode to the
                // original event; most fail the FCS outright.
                let event = decode(Role::Responder, false, &corrupted);
                assert_ne!(
                    event,
                    FrameEvent::Channel {
                        dlci,
                        frame: ChannelFrame::Data {
                            payload: b"hello".to_vec(),
                            credits: 0
                        }
                    },
                    "corruption of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_data_frame_with_credits() {
        let dlci = Dlci::new(12).unwrap();
        let frame = encode_data(Role::Responder, dlci, b"abc", Some(3));
        assert_eq!(
            decode(Role::Initiator, true, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Data {
                    payload: b"abc".to_vec(),
                    credits: 3
                }
            }
        );
    }

    #[test]
    fn test_credit_only_frame() {
        let dlci = Dlci::new(12).unwrap();
        let frame = encode_data(Role::Initiator, dlci, &[], Some(DEFAULT_CREDITS));
        assert_eq!(
            decode(Role::Responder, true, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Data {
                    payload: Vec::new(),
                    credits: DEFAULT_CREDITS
                }
            }
        );
    }

    #[test]
    fn test_two_octet_length_round_trip() {
        let dlci = Dlci::new(2).unwrap();
        let payload = vec![0x55u8; 300];
        let frame = encode_data(Role::Initiator, dlci, &payload, None);
        // EA bit of the first length octet must be clear.
        assert_eq!(frame[2] & 0x01, 0);
        assert_eq!(
            decode(Role::Responder, false, &frame),
            FrameEvent::Channel {
                dlci,
                frame: ChannelFrame::Data {
                    payload,
                    credits: 0
                }
            }
        );
    }

    #[test]
    fn test_pn_command_routes_to_target_channel() {
        let dlci = Dlci::from_scn(Scn::new(3).unwrap(), Role::Initiator);
        let command = MuxCommand::ParameterNegotiation {
            cr: MuxCr::Command,
            params: PnParams {
                dlci,
                cl: CL_CREDIT_REQUEST,
                priority: 0,
                ack_timer: 0,
                max_frame_size: 330,
                max_retransmissions: 0,
                credits: DEFAULT_CREDITS,
            },
        };
        let frame = encode_mux_command(Role::Initiator, &command);
        match decode(Role::Responder, false, &frame) {
            FrameEvent::Channel {
                dlci: target,
                frame: ChannelFrame::ParameterNegotiation { cr, params },
            } => {
                assert_eq!(target, dlci);
                assert_eq!(cr, MuxCr::Command);
                assert_eq!(params.max_frame_size, 330);
                assert_eq!(params.credits, DEFAULT_CREDITS);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_mux_command() {
        // Hand-build a UIH on DLCI 0 carrying a PSC command.
        let mut frame = vec![
            address_octet(Dlci::MUX_CONTROL, cr_bit(Role::Initiator, true)),
            FrameType::Uih.control(),
        ];
        push_length(&mut frame, 2);
        let fcs = calculate_fcs(&frame[..2]);
        frame.extend_from_slice(&[(0x10 << 2) | 0x03, 0x01]);
        frame.push(fcs);
        assert_eq!(
            decode(Role::Responder, false, &frame),
            FrameEvent::UnsupportedCommand {
                command_type: (0x10 << 2) | 0x03
            }
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        // Too short.
        assert_eq!(
            decode(Role::Initiator, false, &[0x03, 0x3F, 0x01]),
            FrameEvent::FrameError
        );

        // DLCI 1 is never valid.
        let mut frame = vec![(1 << 2) | 0x03, 0x3F, 0x01];
        frame.push(calculate_fcs(&frame));
        assert_eq!(decode(Role::Responder, false, &frame), FrameEvent::FrameError);

        // SABM without P/F.
        let mut frame = vec![0x03, 0x2F, 0x01];
        frame.push(calculate_fcs(&frame));
        assert_eq!(decode(Role::Responder, false, &frame), FrameEvent::FrameError);

        // SABM with a non-zero length.
        let mut frame = vec![0x03, 0x3F, 0x03, 0xAA];
        frame.push(calculate_fcs(&frame[..3]));
        assert_eq!(decode(Role::Responder, false, &frame), FrameEvent::FrameError);

        // Unknown frame type.
        let mut frame = vec![0x03, 0xAA, 0x01];
        frame.push(calculate_fcs(&frame));
        assert_eq!(decode(Role::Responder, false, &frame), FrameEvent::FrameError);
    }
}

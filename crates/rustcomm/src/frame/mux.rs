//! Multiplexer control messages
//!
//! Commands carried in UIH frames on the control channel (DLCI 0). Each
//! message is a type octet, an EA-encoded length and a value whose layout
//! is fixed per command. See GSM 07.10 5.4.6.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::FrameParseError;
use crate::types::{Dlci, LineStatus, ModemSignals, PortConfig};

/// Whether a multiplexer control message is a command or a response.
/// Unlike the frame-level C/R bit this does not depend on the role:
/// commands carry 1, responses carry 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxCr {
    Command,
    Response,
}

impl MuxCr {
    fn bit(&self) -> u8 {
        match self {
            MuxCr::Command => 1,
            MuxCr::Response => 0,
        }
    }

    fn from_bit(bit: u8) -> Self {
        if bit != 0 {
            MuxCr::Command
        } else {
            MuxCr::Response
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, MuxCr::Command)
    }
}

// Six-bit command type codes, GSM 07.10 table 4.
const TYPE_PN: u8 = 0x20;
const TYPE_TEST: u8 = 0x08;
const TYPE_FCON: u8 = 0x28;
const TYPE_FCOFF: u8 = 0x18;
const TYPE_MSC: u8 = 0x38;
const TYPE_NSC: u8 = 0x04;
const TYPE_RPN: u8 = 0x24;
const TYPE_RLS: u8 = 0x14;

/// Parameters carried in a PN command or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnParams {
    /// The user DLCI being negotiated.
    pub dlci: Dlci,
    /// Convergence layer field: 0xF requests credit-based flow control,
    /// 0xE accepts it, 0 selects normal flow control.
    pub cl: u8,
    pub priority: u8,
    /// T1 acknowledgement timer code, informational.
    pub ack_timer: u8,
    /// Maximum information field size for the DLC.
    pub max_frame_size: u16,
    /// NA field, unused without retransmission.
    pub max_retransmissions: u8,
    /// Initial credit grant (3-bit k field) under credit-based flow.
    pub credits: u8,
}

/// Convergence layer value requesting credit-based flow control.
pub const CL_CREDIT_REQUEST: u8 = 0x0F;
/// Convergence layer value accepting credit-based flow control.
pub const CL_CREDIT_RESPONSE: u8 = 0x0E;

/// A decoded multiplexer control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCommand {
    ParameterNegotiation {
        cr: MuxCr,
        params: PnParams,
    },
    ModemStatus {
        cr: MuxCr,
        dlci: Dlci,
        signals: ModemSignals,
        /// Break duration nibble, present when the peer signals break.
        break_signal: Option<u8>,
    },
    RemotePortNegotiation {
        cr: MuxCr,
        dlci: Dlci,
        /// `None` is the one-octet form querying the current settings.
        config: Option<PortConfig>,
    },
    RemoteLineStatus {
        cr: MuxCr,
        dlci: Dlci,
        status: LineStatus,
    },
    Test {
        cr: MuxCr,
        payload: Vec<u8>,
    },
    FlowControlOn {
        cr: MuxCr,
    },
    FlowControlOff {
        cr: MuxCr,
    },
    /// Non-supported-command response, naming the rejected type octet.
    NotSupported {
        command_type: u8,
    },
}

/// Outcome of parsing a control-channel UIH payload.
#[derive(Debug, PartialEq)]
pub enum MuxParse {
    Command(MuxCommand),
    /// Valid framing but a command type this implementation does not
    /// support; the type octet is echoed back in an NSC response.
    Unsupported { command_type: u8 },
}

impl MuxCommand {
    /// Parses the information payload of a DLCI-0 UIH frame.
    pub fn parse(payload: &[u8]) -> Result<MuxParse, FrameParseError> {
        if payload.len() < 2 {
            return Err(FrameParseError::BufferTooSmall);
        }

        let type_octet = payload[0];
        if type_octet & 0x01 == 0 {
            // Multi-octet command types are not defined by RFCOMM.
            return Err(FrameParseError::InvalidFrame);
        }
        let cr = MuxCr::from_bit((type_octet >> 1) & 0x01);
        let command_type = type_octet >> 2;

        // Value length is EA-encoded; one octet covers every defined command.
        let length_octet = payload[1];
        if length_octet & 0x01 == 0 {
            return Err(FrameParseError::InvalidFrame);
        }
        let length = (length_octet >> 1) as usize;
        let value = &payload[2..];
        if value.len() != length {
            return Err(FrameParseError::InvalidFrame);
        }

        let command = match command_type {
            TYPE_PN => {
                if length != 8 {
                    return Err(FrameParseError::InvalidFrame);
                }
                MuxCommand::ParameterNegotiation {
                    cr,
                    params: PnParams::parse(value)?,
                }
            }
            TYPE_MSC => {
                if length != 2 && length != 3 {
                    return Err(FrameParseError::InvalidFrame);
                }
                let dlci = parse_command_dlci(value[0])?;
                let signals = ModemSignals::from_bits_truncate(value[1] & !0x01);
                let break_signal = if length == 3 {
                    Some(value[2] >> 4)
                } else {
                    None
                };
                MuxCommand::ModemStatus {
                    cr,
                    dlci,
                    signals,
                    break_signal,
                }
            }
            TYPE_RPN => {
                if length != 1 && length != 8 {
                    return Err(FrameParseError::InvalidFrame);
                }
                let dlci = parse_command_dlci(value[0])?;
                let config = if length == 8 {
                    Some(parse_port_config(&value[1..])?)
                } else {
                    None
                };
                MuxCommand::RemotePortNegotiation { cr, dlci, config }
            }
            TYPE_RLS => {
                if length != 2 {
                    return Err(FrameParseError::InvalidFrame);
                }
                let dlci = parse_command_dlci(value[0])?;
                MuxCommand::RemoteLineStatus {
                    cr,
                    dlci,
                    status: LineStatus::from_octet(value[1]),
                }
            }
            TYPE_TEST => MuxCommand::Test {
                cr,
                payload: value.to_vec(),
            },
            TYPE_FCON => {
                if length != 0 {
                    return Err(FrameParseError::InvalidFrame);
                }
                MuxCommand::FlowControlOn { cr }
            }
            TYPE_FCOFF => {
                if length != 0 {
                    return Err(FrameParseError::InvalidFrame);
                }
                MuxCommand::FlowControlOff { cr }
            }
            TYPE_NSC => {
                if length != 1 {
                    return Err(FrameParseError::InvalidFrame);
                }
                MuxCommand::NotSupported {
                    command_type: value[0],
                }
            }
            _ => {
                return Ok(MuxParse::Unsupported {
                    command_type: type_octet,
                })
            }
        };

        Ok(MuxParse::Command(command))
    }

    /// Serializes this message into the information payload of a DLCI-0
    /// UIH frame.
    pub fn encode(&self) -> Vec<u8> {
        let (command_type, cr, value) = match self {
            MuxCommand::ParameterNegotiation { cr, params } => {
                (TYPE_PN, *cr, params.encode().to_vec())
            }
            MuxCommand::ModemStatus {
                cr,
                dlci,
                signals,
                break_signal,
            } => {
                let mut value = vec![command_dlci_octet(*dlci)];
                match break_signal {
                    Some(duration) => {
                        // Signal octet EA = 0 announces the break octet.
                        value.push(signals.bits() & !0x01);
                        value.push((duration << 4) | 0x03);
                    }
                    None => value.push(signals.bits() | 0x01),
                }
                (TYPE_MSC, *cr, value)
            }
            MuxCommand::RemotePortNegotiation { cr, dlci, config } => {
                let mut value = vec![command_dlci_octet(*dlci)];
                if let Some(config) = config {
                    value.extend_from_slice(&encode_port_config(config));
                }
                (TYPE_RPN, *cr, value)
            }
            MuxCommand::RemoteLineStatus { cr, dlci, status } => (
                TYPE_RLS,
                *cr,
                vec![command_dlci_octet(*dlci), status.to_octet()],
            ),
            MuxCommand::Test { cr, payload } => (TYPE_TEST, *cr, payload.clone()),
            MuxCommand::FlowControlOn { cr } => (TYPE_FCON, *cr, Vec::new()),
            MuxCommand::FlowControlOff { cr } => (TYPE_FCOFF, *cr, Vec::new()),
            MuxCommand::NotSupported { command_type } => {
                (TYPE_NSC, MuxCr::Response, vec![*command_type])
            }
        };

        let mut out = Vec::with_capacity(2 + value.len());
        out.push((command_type << 2) | (cr.bit() << 1) | 0x01);
        out.push(((value.len() as u8) << 1) | 0x01);
        out.extend_from_slice(&value);
        out
    }

    /// The user DLCI this message targets, if any. Messages without a
    /// target (Test, FCON/FCOFF, NSC) act on the session as a whole.
    pub fn target_dlci(&self) -> Option<Dlci> {
        match self {
            MuxCommand::ParameterNegotiation { params, .. } => Some(params.dlci),
            MuxCommand::ModemStatus { dlci, .. } => Some(*dlci),
            MuxCommand::RemotePortNegotiation { dlci, .. } => Some(*dlci),
            MuxCommand::RemoteLineStatus { dlci, .. } => Some(*dlci),
            _ => None,
        }
    }
}

impl PnParams {
    fn parse(value: &[u8]) -> Result<Self, FrameParseError> {
        let dlci_raw = value[0] & 0x3F;
        let dlci = Dlci::new(dlci_raw).map_err(|_| FrameParseError::InvalidDlci(dlci_raw))?;
        if dlci.is_mux_control() {
            return Err(FrameParseError::InvalidDlci(dlci_raw));
        }

        let mut cursor = Cursor::new(&value[4..6]);
        let max_frame_size = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| FrameParseError::BufferTooSmall)?;
        if max_frame_size == 0 || max_frame_size > 0x7FFF {
            return Err(FrameParseError::InvalidFrame);
        }

        Ok(PnParams {
            dlci,
            cl: value[1] >> 4,
            priority: value[2] & 0x3F,
            ack_timer: value[3],
            max_frame_size,
            max_retransmissions: value[6],
            credits: value[7] & 0x07,
        })
    }

    fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.dlci.value() & 0x3F;
        out[1] = self.cl << 4;
        out[2] = self.priority & 0x3F;
        out[3] = self.ack_timer;
        let mut cursor = Cursor::new(&mut out[4..6]);
        cursor
            .write_u16::<LittleEndian>(self.max_frame_size)
            .expect("fixed-size buffer");
        out[6] = self.max_retransmissions;
        out[7] = self.credits & 0x07;
        out
    }
}

/// DLCI octet used inside MSC/RPN/RLS values: EA and the always-one bit
/// set, DLCI in the upper six bits.
fn command_dlci_octet(dlci: Dlci) -> u8 {
    (dlci.value() << 2) | 0x03
}

fn parse_command_dlci(octet: u8) -> Result<Dlci, FrameParseError> {
    let raw = octet >> 2;
    let dlci = Dlci::new(raw).map_err(|_| FrameParseError::InvalidDlci(raw))?;
    if dlci.is_mux_control() {
        return Err(FrameParseError::InvalidDlci(raw));
    }
    Ok(dlci)
}

fn parse_port_config(value: &[u8]) -> Result<PortConfig, FrameParseError> {
    let mut cursor = Cursor::new(&value[5..7]);
    let parameter_mask = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| FrameParseError::BufferTooSmall)?;
    Ok(PortConfig {
        baud_rate: value[0],
        data_bits: value[1] & 0x03,
        stop_bit: (value[1] >> 2) & 0x01,
        parity: (value[1] >> 3) & 0x01,
        parity_type: (value[1] >> 4) & 0x03,
        flow_control: value[2] & 0x3F,
        xon_char: value[3],
        xoff_char: value[4],
        parameter_mask,
    })
}

fn encode_port_config(config: &PortConfig) -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = config.baud_rate;
    out[1] = (config.data_bits & 0x03)
        | ((config.stop_bit & 0x01) << 2)
        | ((config.parity & 0x01) << 3)
        | ((config.parity_type & 0x03) << 4);
    out[2] = config.flow_control & 0x3F;
    out[3] = config.xon_char;
    out[4] = config.xoff_char;
    let mut cursor = Cursor::new(&mut out[5..7]);
    cursor
        .write_u16::<LittleEndian>(config.parameter_mask)
        .expect("fixed-size buffer");
    out
}

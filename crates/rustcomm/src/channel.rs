//! RFCOMM channel (DLC) implementation
//!
//! A channel is one logical duplex byte stream multiplexed on a session,
//! addressed on the wire by its DLCI and towards the application by its
//! handle. This module owns the channel object, its bounded send/receive
//! queues and flow-control state, and the event-driven state machine
//! that drives a channel from creation to teardown.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::engine::{RfcommEngine, Task};
use crate::error::{RfcommError, RfcommResult};
use crate::frame;
use crate::frame::mux::{MuxCommand, MuxCr, PnParams, CL_CREDIT_REQUEST, CL_CREDIT_RESPONSE};
use crate::security::{SecurityDirection, SecurityScope};
use crate::session::{Session, SessionEvent, SessionState};
use crate::types::{
    BdAddr, ChannelEvent, ChannelEventCallback, Dlci, EventMask, FlowControlMode, Handle,
    LineStatus, ModemSignals, PortConfig, Role, Scn, DEFAULT_CREDITS, FRAME_OVERHEAD, MAX_CREDITS,
    MAX_QUEUE_COUNT,
};

/// Timer for transitions waiting on a peer frame (PN, SABM, DISC).
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(20);

/// Timer for the application's answer to an incoming connection.
const UPPER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

bitflags! {
    /// MSC exchange progress. Data may flow only once all three bits are
    /// set: both directions must exchange modem status before the first
    /// data byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TransferReady: u8 {
        const CMD_SENT     = 1 << 0;
        const CMD_RECEIVED = 1 << 1;
        const RSP_RECEIVED = 1 << 2;
    }
}

/// Channel state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Closed,
    WaitPnRsp,
    ClientWaitSecurity,
    SabmReqWaitUa,
    WaitUpperResponse,
    WaitSabm,
    ServerWaitSecurity,
    DiscReqWaitUa,
    WaitRestart,
    Connected,
}

/// Events consumed by the channel state machine.
#[derive(Debug)]
pub(crate) enum DlcEvent {
    /// The application requested an outbound connection.
    Open,
    /// The owning session reached the connected state.
    SessionReady,
    /// The security service answered an access check.
    SecurityResult {
        direction: SecurityDirection,
        granted: bool,
    },
    /// The application accepted an incoming connection.
    Accept,
    /// The application rejected an incoming connection.
    Reject,
    /// The application requested a disconnect.
    Close,
    RecvPn {
        cr: MuxCr,
        params: PnParams,
    },
    RecvSabm,
    RecvUa,
    RecvDm,
    RecvDisc,
    RecvMsc {
        cr: MuxCr,
        signals: ModemSignals,
        break_signal: Option<u8>,
    },
    RecvRpn {
        cr: MuxCr,
        config: Option<PortConfig>,
    },
    RecvRls {
        cr: MuxCr,
        status: LineStatus,
    },
    RecvData {
        payload: Vec<u8>,
        credits: u8,
    },
    /// The channel timer fired.
    Timeout,
}

/// One data link connection.
pub(crate) struct Channel {
    pub handle: Handle,
    pub dlci: Dlci,
    pub scn: Scn,
    pub is_server: bool,
    pub state: ChannelState,
    pub event_mask: EventMask,
    pub callback: ChannelEventCallback,
    /// Receive MTU the application asked for.
    pub requested_mtu: u16,
    /// Negotiated receive MTU.
    pub local_mtu: u16,
    /// Negotiated send MTU.
    pub peer_mtu: u16,
    pub port_config: PortConfig,
    pub local_signals: ModemSignals,
    pub peer_signals: ModemSignals,
    pub transfer_ready: TransferReady,
    /// Credits currently granted to the peer (credit flow only).
    pub local_credit: u8,
    /// Credits the peer has granted us (credit flow only).
    pub peer_credit: u8,
    /// We told the peer we cannot receive (normal flow only).
    pub local_fc: bool,
    /// The peer told us it cannot receive (normal flow only).
    pub peer_fc: bool,
    /// A write was refused with QueueFull; FlowOn is owed to the
    /// application once the queue drains.
    pub app_flow_blocked: bool,
    /// An inbound SABM is waiting for the application's answer.
    pub sabm_received: bool,
    pub send_queue: VecDeque<Vec<u8>>,
    pub recv_queue: VecDeque<Vec<u8>>,
    pub received_bytes: u32,
    pub transmitted_bytes: u32,
    pub timer: Option<Instant>,
}

impl Channel {
    pub fn new(
        handle: Handle,
        dlci: Dlci,
        scn: Scn,
        is_server: bool,
        mtu: u16,
        event_mask: EventMask,
        callback: ChannelEventCallback,
    ) -> Self {
        Self {
            handle,
            dlci,
            scn,
            is_server,
            state: ChannelState::Closed,
            event_mask,
            callback,
            requested_mtu: mtu,
            local_mtu: mtu,
            peer_mtu: mtu,
            port_config: PortConfig::default(),
            local_signals: ModemSignals::default(),
            peer_signals: ModemSignals::default(),
            transfer_ready: TransferReady::empty(),
            local_credit: 0,
            peer_credit: 0,
            local_fc: false,
            peer_fc: false,
            app_flow_blocked: false,
            sabm_received: false,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            received_bytes: 0,
            transmitted_bytes: 0,
            timer: None,
        }
    }

    pub fn arm_timer(&mut self, duration: Duration) {
        self.timer = Some(Instant::now() + duration);
    }

    pub fn disarm_timer(&mut self) {
        self.timer = None;
    }

    /// True once both sides have exchanged MSC.
    pub fn transfer_ready(&self) -> bool {
        self.transfer_ready.is_all()
    }

    /// Whether one queued or fresh packet may be sent right now.
    fn can_send(&self, credit_based: bool, session_blocked: bool) -> bool {
        if self.state != ChannelState::Connected || !self.transfer_ready() {
            return false;
        }
        if credit_based {
            self.peer_credit > 0
        } else {
            !self.peer_fc && !session_blocked
        }
    }

    /// How many fresh credits may be granted without risking receive
    /// queue overflow: outstanding grants never exceed free queue slots.
    fn grantable_credits(&self) -> u8 {
        let free_slots = (MAX_QUEUE_COUNT - self.recv_queue.len()) as u8;
        let ceiling = free_slots.min(MAX_CREDITS);
        ceiling.saturating_sub(self.local_credit)
    }

    /// Rewinds all protocol state ahead of a session restart. Queued
    /// application data survives; negotiation starts from scratch.
    pub fn reset_for_restart(&mut self) {
        self.state = ChannelState::Closed;
        self.transfer_ready = TransferReady::empty();
        self.local_credit = 0;
        self.peer_credit = 0;
        self.local_fc = false;
        self.peer_fc = false;
        self.sabm_received = false;
        self.disarm_timer();
    }

    /// Adjusts counters for one outgoing data frame and computes the
    /// piggybacked credit grant.
    fn prepare_send(&mut self, credit_based: bool, len: usize) -> Option<u8> {
        self.transmitted_bytes = self.transmitted_bytes.wrapping_add(len as u32);
        if !credit_based {
            return None;
        }
        self.peer_credit -= 1;
        let grant = self.grantable_credits();
        if grant > 0 {
            self.local_credit += grant;
            Some(grant)
        } else {
            None
        }
    }
}

/// Delivers an event to the channel owner, honoring its event mask.
pub(crate) fn notify(channel: &Channel, event: ChannelEvent) {
    if !channel.event_mask.accepts(&event) {
        return;
    }
    let callback = channel.callback.clone();
    let mut callback = callback.lock().unwrap();
    (*callback)(event);
}

impl RfcommEngine {
    /// Runs one channel event to completion. The owning session is taken
    /// out of the registry for the duration so the handler has free
    /// access to the rest of the engine.
    pub(crate) fn handle_dlc_event(&mut self, addr: BdAddr, dlci: Dlci, event: DlcEvent) {
        let Some(mut session) = self.sessions.remove(&addr) else {
            debug!("dropping channel event for unknown session {}", addr);
            return;
        };
        if session.channels.contains_key(&dlci) {
            let destroy = self.dlc_fsm(&mut session, dlci, event);
            if destroy {
                self.destroy_channel(&mut session, dlci);
                if self.session_idle_check(&mut session) {
                    return;
                }
            }
        } else {
            debug!("dropping event for unknown DLCI {} on {}", dlci, addr);
        }
        self.sessions.insert(addr, session);
    }

    /// Removes a channel from its session and releases its handle.
    pub(crate) fn destroy_channel(&mut self, session: &mut Session, dlci: Dlci) {
        if let Some(channel) = session.channels.remove(&dlci) {
            info!(
                "channel {} (DLCI {} on {}) destroyed",
                channel.handle, dlci, session.addr
            );
            self.release_handle(channel.handle);
        }
    }

    /// Executes one transition. Returns true when the channel must be
    /// destroyed afterwards.
    fn dlc_fsm(&mut self, session: &mut Session, dlci: Dlci, event: DlcEvent) -> bool {
        match event {
            DlcEvent::Open => self.dlc_open(session, dlci),
            DlcEvent::SessionReady => self.dlc_session_ready(session, dlci),
            DlcEvent::SecurityResult { direction, granted } => {
                self.dlc_security_result(session, dlci, direction, granted)
            }
            DlcEvent::Accept => self.dlc_accept(session, dlci),
            DlcEvent::Reject => self.dlc_reject(session, dlci),
            DlcEvent::Close => self.dlc_close(session, dlci),
            DlcEvent::RecvPn { cr, params } => self.dlc_recv_pn(session, dlci, cr, params),
            DlcEvent::RecvSabm => self.dlc_recv_sabm(session, dlci),
            DlcEvent::RecvUa => self.dlc_recv_ua(session, dlci),
            DlcEvent::RecvDm => self.dlc_recv_dm(session, dlci),
            DlcEvent::RecvDisc => self.dlc_recv_disc(session, dlci),
            DlcEvent::RecvMsc {
                cr,
                signals,
                break_signal,
            } => self.dlc_recv_msc(session, dlci, cr, signals, break_signal),
            DlcEvent::RecvRpn { cr, config } => self.dlc_recv_rpn(session, dlci, cr, config),
            DlcEvent::RecvRls { cr, status } => self.dlc_recv_rls(session, dlci, cr, status),
            DlcEvent::RecvData { payload, credits } => {
                self.dlc_recv_data(session, dlci, payload, credits)
            }
            DlcEvent::Timeout => self.dlc_timeout(session, dlci),
        }
    }

    fn dlc_open(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let state = session.channels[&dlci].state;
        match state {
            ChannelState::Closed => {
                if session.state == SessionState::Connected {
                    self.start_dlc_negotiation(session, dlci);
                } else {
                    // The session is not up yet; ask for it and wait for
                    // the SessionReady broadcast.
                    self.post(Task::Session {
                        addr: session.addr,
                        event: SessionEvent::Open,
                    });
                }
                false
            }
            ChannelState::DiscReqWaitUa => {
                // Reopen once the in-flight disconnect completes.
                session.channels.get_mut(&dlci).unwrap().state = ChannelState::WaitRestart;
                false
            }
            _ => false,
        }
    }

    fn dlc_session_ready(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let channel = session.channels.get_mut(&dlci).unwrap();
        if channel.state == ChannelState::Closed && !channel.is_server {
            self.start_dlc_negotiation(session, dlci);
        }
        false
    }

    /// Sends the PN command proposing MTU and flow-control capability.
    fn start_dlc_negotiation(&mut self, session: &mut Session, dlci: Dlci) {
        let role = session.role();
        let transport_mtu = session.local_transport_mtu;
        let flow_mode = session.flow_mode;
        let channel = session.channels.get_mut(&dlci).unwrap();

        let proposed = channel
            .requested_mtu
            .min(transport_mtu.saturating_sub(FRAME_OVERHEAD));
        channel.local_mtu = proposed;

        // Credit flow is always proposed unless the session is already
        // pinned to normal flow control by an earlier negotiation.
        let (cl, credits) = if flow_mode == FlowControlMode::Normal {
            (0, 0)
        } else {
            (CL_CREDIT_REQUEST, DEFAULT_CREDITS)
        };
        channel.local_credit = credits;
        channel.state = ChannelState::WaitPnRsp;
        channel.arm_timer(CHANNEL_TIMEOUT);

        let command = MuxCommand::ParameterNegotiation {
            cr: MuxCr::Command,
            params: PnParams {
                dlci,
                cl,
                priority: 0,
                ack_timer: 0,
                max_frame_size: proposed,
                max_retransmissions: 0,
                credits,
            },
        };
        let frame = frame::encode_mux_command(role, &command);
        self.send_frame(session, frame);
    }

    fn dlc_security_result(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        direction: SecurityDirection,
        granted: bool,
    ) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;
        match (state, direction) {
            (ChannelState::ClientWaitSecurity, SecurityDirection::Outgoing) => {
                if granted {
                    let channel = session.channels.get_mut(&dlci).unwrap();
                    channel.state = ChannelState::SabmReqWaitUa;
                    channel.arm_timer(CHANNEL_TIMEOUT);
                    let frame = frame::encode_sabm(role, dlci);
                    self.send_frame(session, frame);
                    false
                } else {
                    notify(
                        &session.channels[&dlci],
                        ChannelEvent::ConnectFail {
                            handle: session.channels[&dlci].handle,
                        },
                    );
                    true
                }
            }
            (ChannelState::ServerWaitSecurity, SecurityDirection::Incoming) => {
                if granted {
                    if session.channels[&dlci].sabm_received {
                        let frame = frame::encode_ua(role, dlci);
                        self.send_frame(session, frame);
                        self.dlc_enter_connected(session, dlci);
                    } else {
                        // Accepted before the SABM arrived (the first
                        // command was PN or RPN); wait for it.
                        let channel = session.channels.get_mut(&dlci).unwrap();
                        channel.state = ChannelState::WaitSabm;
                        channel.arm_timer(CHANNEL_TIMEOUT);
                    }
                    false
                } else {
                    let frame = frame::encode_dm(role, dlci);
                    self.send_frame(session, frame);
                    notify(
                        &session.channels[&dlci],
                        ChannelEvent::ConnectFail {
                            handle: session.channels[&dlci].handle,
                        },
                    );
                    true
                }
            }
            _ => {
                debug!("stale security result for DLCI {} in {:?}", dlci, state);
                false
            }
        }
    }

    fn dlc_accept(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let addr = session.addr;
        let channel = session.channels.get_mut(&dlci).unwrap();
        if channel.state != ChannelState::WaitUpperResponse {
            return false;
        }
        channel.disarm_timer();
        channel.state = ChannelState::ServerWaitSecurity;
        let scn = channel.scn;
        self.security.request_access(crate::security::SecurityCheck {
            addr,
            scn: Some(scn),
            direction: SecurityDirection::Incoming,
            scope: SecurityScope::Channel(dlci),
        });
        false
    }

    fn dlc_reject(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let role = session.role();
        if session.channels[&dlci].state != ChannelState::WaitUpperResponse {
            return false;
        }
        let frame = frame::encode_dm(role, dlci);
        self.send_frame(session, frame);
        true
    }

    fn dlc_close(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;
        let handle = session.channels[&dlci].handle;
        match state {
            // Nothing was sent to the peer yet; abort locally.
            ChannelState::Closed | ChannelState::WaitPnRsp | ChannelState::ClientWaitSecurity => {
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::DisconnectSuccess { handle },
                );
                true
            }
            // The peer is waiting for a final answer it will never get.
            ChannelState::WaitUpperResponse
            | ChannelState::ServerWaitSecurity
            | ChannelState::WaitSabm => {
                let frame = frame::encode_dm(role, dlci);
                self.send_frame(session, frame);
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::DisconnectSuccess { handle },
                );
                true
            }
            ChannelState::Connected | ChannelState::SabmReqWaitUa => {
                let channel = session.channels.get_mut(&dlci).unwrap();
                channel.state = ChannelState::DiscReqWaitUa;
                channel.arm_timer(CHANNEL_TIMEOUT);
                let frame = frame::encode_disc(role, dlci);
                self.send_frame(session, frame);
                false
            }
            ChannelState::DiscReqWaitUa | ChannelState::WaitRestart => false,
        }
    }

    fn dlc_recv_pn(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        cr: MuxCr,
        params: PnParams,
    ) -> bool {
        if cr.is_command() {
            self.dlc_recv_pn_command(session, dlci, params)
        } else {
            self.dlc_recv_pn_response(session, dlci, params)
        }
    }

    fn dlc_recv_pn_command(&mut self, session: &mut Session, dlci: Dlci, params: PnParams) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;

        // The first successful PN exchange on the session pins the flow
        // control mode; later exchanges cannot change it.
        if session.flow_mode == FlowControlMode::Unknown {
            session.flow_mode = if params.cl == CL_CREDIT_REQUEST {
                FlowControlMode::CreditBased
            } else {
                FlowControlMode::Normal
            };
            debug!("session {} flow mode fixed to {:?}", session.addr, session.flow_mode);
        }
        let credit_based = session.flow_mode == FlowControlMode::CreditBased;
        let peer_transport_mtu = session.peer_transport_mtu;

        let channel = session.channels.get_mut(&dlci).unwrap();
        let response = match state {
            ChannelState::Closed | ChannelState::WaitUpperResponse | ChannelState::WaitSabm => {
                let negotiated = channel.requested_mtu.min(params.max_frame_size);
                channel.local_mtu = negotiated;
                channel.peer_mtu =
                    negotiated.min(peer_transport_mtu.saturating_sub(FRAME_OVERHEAD));
                let (cl, credits) = if credit_based {
                    channel.peer_credit = params.credits;
                    channel.local_credit = DEFAULT_CREDITS;
                    (CL_CREDIT_RESPONSE, DEFAULT_CREDITS)
                } else {
                    (0, 0)
                };
                PnParams {
                    dlci,
                    cl,
                    priority: params.priority,
                    ack_timer: 0,
                    max_frame_size: negotiated,
                    max_retransmissions: 0,
                    credits,
                }
            }
            _ => {
                // Renegotiation after establishment only echoes what is
                // already in force.
                PnParams {
                    dlci,
                    cl: if credit_based { CL_CREDIT_RESPONSE } else { 0 },
                    priority: params.priority,
                    ack_timer: 0,
                    max_frame_size: channel.local_mtu,
                    max_retransmissions: 0,
                    credits: 0,
                }
            }
        };

        let frame = frame::encode_mux_command(
            role,
            &MuxCommand::ParameterNegotiation {
                cr: MuxCr::Response,
                params: response,
            },
        );
        self.send_frame(session, frame);

        if state == ChannelState::Closed {
            self.dlc_notify_incoming(session, dlci);
        }
        false
    }

    fn dlc_recv_pn_response(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        params: PnParams,
    ) -> bool {
        let addr = session.addr;
        if session.channels[&dlci].state != ChannelState::WaitPnRsp {
            debug!("ignoring PN response for DLCI {} outside negotiation", dlci);
            return false;
        }

        if session.flow_mode == FlowControlMode::Unknown {
            session.flow_mode = if params.cl == CL_CREDIT_RESPONSE {
                FlowControlMode::CreditBased
            } else {
                FlowControlMode::Normal
            };
            debug!("session {} flow mode fixed to {:?}", addr, session.flow_mode);
        }
        let credit_based = session.flow_mode == FlowControlMode::CreditBased;
        let peer_transport_mtu = session.peer_transport_mtu;

        let channel = session.channels.get_mut(&dlci).unwrap();
        channel.disarm_timer();
        let negotiated = channel.local_mtu.min(params.max_frame_size);
        channel.local_mtu = negotiated;
        channel.peer_mtu = negotiated.min(peer_transport_mtu.saturating_sub(FRAME_OVERHEAD));
        if credit_based {
            channel.peer_credit = params.credits;
        } else {
            channel.local_credit = 0;
        }
        channel.state = ChannelState::ClientWaitSecurity;
        let scn = channel.scn;

        self.security.request_access(crate::security::SecurityCheck {
            addr,
            scn: Some(scn),
            direction: SecurityDirection::Outgoing,
            scope: SecurityScope::Channel(dlci),
        });
        false
    }

    fn dlc_recv_sabm(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;
        match state {
            ChannelState::Closed => {
                session.channels.get_mut(&dlci).unwrap().sabm_received = true;
                self.dlc_notify_incoming(session, dlci);
                false
            }
            ChannelState::WaitUpperResponse => {
                session.channels.get_mut(&dlci).unwrap().sabm_received = true;
                false
            }
            // Already authorized; complete establishment immediately.
            ChannelState::WaitSabm => {
                session.channels.get_mut(&dlci).unwrap().disarm_timer();
                let frame = frame::encode_ua(role, dlci);
                self.send_frame(session, frame);
                self.dlc_enter_connected(session, dlci);
                false
            }
            // Duplicate SABM on an open channel is acknowledged again.
            ChannelState::Connected => {
                let frame = frame::encode_ua(role, dlci);
                self.send_frame(session, frame);
                false
            }
            _ => false,
        }
    }

    /// Records the incoming connection and hands the decision to the
    /// application.
    fn dlc_notify_incoming(&mut self, session: &mut Session, dlci: Dlci) {
        let addr = session.addr;
        let channel = session.channels.get_mut(&dlci).unwrap();
        channel.state = ChannelState::WaitUpperResponse;
        channel.arm_timer(UPPER_RESPONSE_TIMEOUT);
        let event = ChannelEvent::ConnectIncoming {
            handle: channel.handle,
            addr,
            scn: channel.scn,
        };
        notify(channel, event);
    }

    fn dlc_recv_ua(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let state = session.channels[&dlci].state;
        match state {
            ChannelState::SabmReqWaitUa => {
                session.channels.get_mut(&dlci).unwrap().disarm_timer();
                self.dlc_enter_connected(session, dlci);
                false
            }
            ChannelState::DiscReqWaitUa => {
                let channel = session.channels.get_mut(&dlci).unwrap();
                channel.disarm_timer();
                notify(
                    channel,
                    ChannelEvent::DisconnectSuccess {
                        handle: channel.handle,
                    },
                );
                true
            }
            ChannelState::WaitRestart => {
                // The old connection is down; run the queued reopen.
                let channel = session.channels.get_mut(&dlci).unwrap();
                channel.disarm_timer();
                channel.state = ChannelState::Closed;
                channel.transfer_ready = TransferReady::empty();
                self.post(Task::Dlc {
                    addr: session.addr,
                    dlci,
                    event: DlcEvent::Open,
                });
                false
            }
            _ => false,
        }
    }

    fn dlc_recv_dm(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let channel = session.channels.get_mut(&dlci).unwrap();
        channel.disarm_timer();
        if channel.state == ChannelState::WaitRestart {
            // The pending close resolved; run the queued reopen.
            channel.state = ChannelState::Closed;
            channel.transfer_ready = TransferReady::empty();
            self.post(Task::Dlc {
                addr: session.addr,
                dlci,
                event: DlcEvent::Open,
            });
            return false;
        }
        let handle = channel.handle;
        let event = match channel.state {
            ChannelState::DiscReqWaitUa => ChannelEvent::DisconnectSuccess { handle },
            ChannelState::Connected => ChannelEvent::Disconnected { handle },
            _ => ChannelEvent::ConnectFail { handle },
        };
        notify(channel, event);
        true
    }

    fn dlc_recv_disc(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;
        let handle = session.channels[&dlci].handle;
        match state {
            ChannelState::Connected => {
                let frame = frame::encode_ua(role, dlci);
                self.send_frame(session, frame);
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::Disconnected { handle },
                );
                true
            }
            // Both sides disconnected simultaneously.
            ChannelState::DiscReqWaitUa => {
                let frame = frame::encode_ua(role, dlci);
                self.send_frame(session, frame);
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::DisconnectSuccess { handle },
                );
                true
            }
            _ => {
                // The peer aborted an incomplete establishment.
                let frame = frame::encode_dm(role, dlci);
                self.send_frame(session, frame);
                let event = if session.channels[&dlci].is_server {
                    ChannelEvent::Disconnected { handle }
                } else {
                    ChannelEvent::ConnectFail { handle }
                };
                notify(&session.channels[&dlci], event);
                true
            }
        }
    }

    /// Completes establishment: notify the owner, then send our MSC
    /// command so data transfer can be unlocked by the exchange.
    fn dlc_enter_connected(&mut self, session: &mut Session, dlci: Dlci) {
        let role = session.role();
        let peer_transport_mtu = session.peer_transport_mtu;
        let channel = session.channels.get_mut(&dlci).unwrap();
        channel.state = ChannelState::Connected;
        channel.peer_mtu = channel
            .peer_mtu
            .min(peer_transport_mtu.saturating_sub(FRAME_OVERHEAD));
        info!(
            "channel {} (DLCI {}) connected, send MTU {}, recv MTU {}",
            channel.handle, dlci, channel.peer_mtu, channel.local_mtu
        );
        let event = ChannelEvent::ConnectSuccess {
            handle: channel.handle,
            send_mtu: channel.peer_mtu,
            recv_mtu: channel.local_mtu,
        };
        notify(channel, event);

        channel.transfer_ready |= TransferReady::CMD_SENT;
        let signals = channel.local_signals;
        let frame = frame::encode_mux_command(
            role,
            &MuxCommand::ModemStatus {
                cr: MuxCr::Command,
                dlci,
                signals,
                break_signal: None,
            },
        );
        self.send_frame(session, frame);
    }

    fn dlc_recv_msc(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        cr: MuxCr,
        signals: ModemSignals,
        break_signal: Option<u8>,
    ) -> bool {
        let role = session.role();
        let normal_flow = session.flow_mode == FlowControlMode::Normal;
        if cr.is_command() {
            {
                let channel = session.channels.get_mut(&dlci).unwrap();
                channel.peer_signals = signals;
                channel.transfer_ready |= TransferReady::CMD_RECEIVED;
                if normal_flow {
                    channel.peer_fc = signals.contains(ModemSignals::FC);
                }
                notify(
                    channel,
                    ChannelEvent::ModemStatus {
                        handle: channel.handle,
                        signals,
                        break_signal,
                    },
                );
            }
            let frame = frame::encode_mux_command(
                role,
                &MuxCommand::ModemStatus {
                    cr: MuxCr::Response,
                    dlci,
                    signals,
                    break_signal,
                },
            );
            self.send_frame(session, frame);
        } else {
            let channel = session.channels.get_mut(&dlci).unwrap();
            channel.transfer_ready |= TransferReady::RSP_RECEIVED;
        }
        // Any MSC progress may have unblocked the outbound direction.
        self.flush_channel(session, dlci);
        false
    }

    fn dlc_recv_rpn(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        cr: MuxCr,
        config: Option<PortConfig>,
    ) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;
        if cr.is_command() {
            let response = {
                let channel = session.channels.get_mut(&dlci).unwrap();
                if let Some(config) = config {
                    channel.port_config = config;
                    notify(
                        channel,
                        ChannelEvent::RemotePortConfig {
                            handle: channel.handle,
                            config,
                        },
                    );
                }
                channel.port_config
            };
            let frame = frame::encode_mux_command(
                role,
                &MuxCommand::RemotePortNegotiation {
                    cr: MuxCr::Response,
                    dlci,
                    config: Some(response),
                },
            );
            self.send_frame(session, frame);
            // An RPN command towards a fresh server channel counts as the
            // opening move of an incoming connection.
            if state == ChannelState::Closed && config.is_some() {
                self.dlc_notify_incoming(session, dlci);
            }
        } else if let Some(config) = config {
            let channel = session.channels.get_mut(&dlci).unwrap();
            channel.port_config = config;
            notify(
                channel,
                ChannelEvent::RemotePortConfig {
                    handle: channel.handle,
                    config,
                },
            );
        }
        false
    }

    fn dlc_recv_rls(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        cr: MuxCr,
        status: LineStatus,
    ) -> bool {
        let role = session.role();
        if cr.is_command() {
            notify(
                &session.channels[&dlci],
                ChannelEvent::RemoteLineStatus {
                    handle: session.channels[&dlci].handle,
                    status,
                },
            );
            let frame = frame::encode_mux_command(
                role,
                &MuxCommand::RemoteLineStatus {
                    cr: MuxCr::Response,
                    dlci,
                    status,
                },
            );
            self.send_frame(session, frame);
        }
        false
    }

    fn dlc_recv_data(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        payload: Vec<u8>,
        credits: u8,
    ) -> bool {
        let role = session.role();
        let credit_based = session.flow_mode == FlowControlMode::CreditBased;
        let mut flush = false;
        let mut send_fc_off = false;
        {
            let channel = session.channels.get_mut(&dlci).unwrap();
            if channel.state != ChannelState::Connected {
                debug!("dropping data for DLCI {} in {:?}", dlci, channel.state);
                return false;
            }

            if credit_based && credits > 0 {
                channel.peer_credit = channel.peer_credit.saturating_add(credits);
                flush = true;
            }
            if payload.is_empty() {
                // Credit-only frame.
            } else if channel.recv_queue.len() >= MAX_QUEUE_COUNT {
                // The queue is full; the frame is lost. Under normal flow
                // control the peer is told on this same event.
                warn!(
                    "receive queue overflow on DLCI {}, dropping {} bytes",
                    dlci,
                    payload.len()
                );
                if !credit_based && !channel.local_fc {
                    channel.local_fc = true;
                    send_fc_off = true;
                }
            } else {
                if credit_based {
                    channel.local_credit = channel.local_credit.saturating_sub(1);
                }
                channel.recv_queue.push_back(payload);
                if !credit_based
                    && channel.recv_queue.len() >= MAX_QUEUE_COUNT
                    && !channel.local_fc
                {
                    channel.local_fc = true;
                    send_fc_off = true;
                }
                notify(
                    channel,
                    ChannelEvent::DataReceived {
                        handle: channel.handle,
                    },
                );
            }
        }
        if send_fc_off {
            self.send_local_flow_state(session, dlci, role);
        }
        if flush {
            self.flush_channel(session, dlci);
        }
        false
    }

    /// Announces the local "can/cannot receive" state via the MSC flow
    /// control bit.
    fn send_local_flow_state(&mut self, session: &mut Session, dlci: Dlci, role: Role) {
        let channel = session.channels.get_mut(&dlci).unwrap();
        let mut signals = channel.local_signals;
        signals.set(ModemSignals::FC, channel.local_fc);
        let frame = frame::encode_mux_command(
            role,
            &MuxCommand::ModemStatus {
                cr: MuxCr::Command,
                dlci,
                signals,
                break_signal: None,
            },
        );
        self.send_frame(session, frame);
    }

    fn dlc_timeout(&mut self, session: &mut Session, dlci: Dlci) -> bool {
        let role = session.role();
        let state = session.channels[&dlci].state;
        let handle = session.channels[&dlci].handle;
        warn!("channel {} timed out in {:?}", handle, state);
        match state {
            ChannelState::WaitPnRsp | ChannelState::SabmReqWaitUa => {
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::ConnectFail { handle },
                );
                self.post(Task::Session {
                    addr: session.addr,
                    event: SessionEvent::Timeout,
                });
                true
            }
            ChannelState::DiscReqWaitUa | ChannelState::WaitRestart => {
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::Disconnected { handle },
                );
                self.post(Task::Session {
                    addr: session.addr,
                    event: SessionEvent::Timeout,
                });
                true
            }
            ChannelState::WaitUpperResponse => {
                // The application never answered; refuse the peer.
                let frame = frame::encode_dm(role, dlci);
                self.send_frame(session, frame);
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::Disconnected { handle },
                );
                true
            }
            ChannelState::WaitSabm => {
                notify(
                    &session.channels[&dlci],
                    ChannelEvent::Disconnected { handle },
                );
                true
            }
            _ => false,
        }
    }

    /// Drains the outbound queue while flow control allows.
    pub(crate) fn flush_channel(&mut self, session: &mut Session, dlci: Dlci) {
        let role = session.role();
        let credit_based = session.flow_mode == FlowControlMode::CreditBased;
        let session_blocked = session.peer_session_fc;
        let mut flowed_on = false;
        loop {
            let (payload, credits) = {
                let Some(channel) = session.channels.get_mut(&dlci) else {
                    return;
                };
                if !channel.can_send(credit_based, session_blocked) {
                    break;
                }
                let Some(payload) = channel.send_queue.pop_front() else {
                    break;
                };
                let credits = channel.prepare_send(credit_based, payload.len());
                (payload, credits)
            };
            let frame = frame::encode_data(role, dlci, &payload, credits);
            self.send_frame(session, frame);
        }
        if let Some(channel) = session.channels.get_mut(&dlci) {
            if channel.app_flow_blocked && channel.send_queue.len() < MAX_QUEUE_COUNT {
                channel.app_flow_blocked = false;
                flowed_on = true;
            }
            if flowed_on {
                notify(
                    channel,
                    ChannelEvent::FlowOn {
                        handle: channel.handle,
                    },
                );
            }
        }
    }

    /// Direct write path used by the public API.
    pub(crate) fn channel_write(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
        data: Vec<u8>,
    ) -> RfcommResult<()> {
        let role = session.role();
        let credit_based = session.flow_mode == FlowControlMode::CreditBased;
        let session_blocked = session.peer_session_fc;
        let (payload, credits) = {
            let channel = session.channels.get_mut(&dlci).unwrap();
            // Writes are rejected both before establishment and once a
            // disconnect is underway.
            if channel.state != ChannelState::Connected {
                return Err(RfcommError::NotConnected);
            }
            if data.len() > channel.peer_mtu as usize {
                return Err(RfcommError::Overrun);
            }
            if !channel.can_send(credit_based, session_blocked) {
                if channel.send_queue.len() >= MAX_QUEUE_COUNT {
                    channel.app_flow_blocked = true;
                    return Err(RfcommError::QueueFull);
                }
                channel.send_queue.push_back(data);
                return Ok(());
            }
            let credits = channel.prepare_send(credit_based, data.len());
            (data, credits)
        };
        let frame = frame::encode_data(role, dlci, &payload, credits);
        self.send_frame(session, frame);
        Ok(())
    }

    /// Direct read path used by the public API: pops one packet and
    /// re-opens the inbound flow control window.
    pub(crate) fn channel_read(
        &mut self,
        session: &mut Session,
        dlci: Dlci,
    ) -> RfcommResult<Vec<u8>> {
        let role = session.role();
        let credit_based = session.flow_mode == FlowControlMode::CreditBased;
        let mut fc_on = false;
        let (packet, grant) = {
            let channel = session.channels.get_mut(&dlci).unwrap();
            let Some(packet) = channel.recv_queue.pop_front() else {
                return Err(RfcommError::NoData);
            };
            channel.received_bytes = channel.received_bytes.wrapping_add(packet.len() as u32);
            let grant = if credit_based {
                let grant = channel.grantable_credits();
                if grant > 0 {
                    channel.local_credit += grant;
                }
                grant
            } else {
                if channel.local_fc && channel.recv_queue.len() < MAX_QUEUE_COUNT {
                    channel.local_fc = false;
                    fc_on = true;
                }
                0
            };
            (packet, grant)
        };
        if grant > 0 {
            // Issue fresh credits with an empty data frame.
            let frame = frame::encode_data(role, dlci, &[], Some(grant));
            self.send_frame(session, frame);
        }
        if fc_on {
            self.send_local_flow_state(session, dlci, role);
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn test_channel() -> Channel {
        Channel::new(
            1,
            Dlci::new(10).unwrap(),
            Scn::new(5).unwrap(),
            false,
            127,
            EventMask::all(),
            Arc::new(Mutex::new(|_event| {})),
        )
    }

    #[test]
    fn test_transfer_ready_requires_all_bits() {
        let mut channel = test_channel();
        channel.state = ChannelState::Connected;
        assert!(!channel.transfer_ready());
        channel.transfer_ready |= TransferReady::CMD_SENT;
        channel.transfer_ready |= TransferReady::CMD_RECEIVED;
        assert!(!channel.transfer_ready());
        channel.transfer_ready |= TransferReady::RSP_RECEIVED;
        assert!(channel.transfer_ready());
    }

    #[test]
    fn test_can_send_gating() {
        let mut channel = test_channel();
        channel.state = ChannelState::Connected;
        channel.transfer_ready = TransferReady::all();

        // Credit mode requires peer credit.
        assert!(!channel.can_send(true, false));
        channel.peer_credit = 1;
        assert!(channel.can_send(true, false));

        // Normal mode honors both the channel and the session pause.
        assert!(channel.can_send(false, false));
        channel.peer_fc = true;
        assert!(!channel.can_send(false, false));
        channel.peer_fc = false;
        assert!(!channel.can_send(false, true));
    }

    #[test]
    fn test_grantable_credits_bounded_by_queue() {
        let mut channel = test_channel();
        assert_eq!(channel.grantable_credits(), MAX_CREDITS);
        channel.local_credit = 4;
        assert_eq!(channel.grantable_credits(), MAX_CREDITS - 4);

        // A backlogged receive queue shrinks the window.
        for _ in 0..MAX_QUEUE_COUNT - 2 {
            channel.recv_queue.push_back(vec![0]);
        }
        assert_eq!(channel.grantable_credits(), 0);
        channel.local_credit = 0;
        assert_eq!(channel.grantable_credits(), 2);
    }
}

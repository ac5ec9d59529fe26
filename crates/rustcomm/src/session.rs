//! RFCOMM session (multiplexer) implementation
//!
//! A session is one transport connection to a peer address carrying any
//! number of multiplexed channels. This module owns the session object
//! and the state machine that drives transport setup, the SABM0/UA0
//! multiplexer handshake, connect collisions, session-wide flow control
//! and teardown.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use crate::channel::{notify, Channel, ChannelState, DlcEvent};
use crate::engine::{RfcommEngine, Task};
use crate::frame;
use crate::frame::mux::{MuxCommand, MuxCr};
use crate::security::{SecurityCheck, SecurityDirection, SecurityScope};
use crate::transport::{DisconnectReason, TransportId};
use crate::types::{BdAddr, ChannelEvent, Dlci, FlowControlMode, Role};

/// Timer for transitions waiting on a peer frame or transport progress.
const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound of the randomized connect-collision backoff, in seconds.
const COLLISION_BACKOFF_MAX_SECS: u64 = 10;

/// Receive MTU announced to the transport during configuration.
pub(crate) const DEFAULT_TRANSPORT_MTU: u16 = 672;

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Closed,
    InitiatorWaitSecurity,
    WaitConnectReqResult,
    WaitConnectRsp,
    InitiatorWaitConfigReqAndRsp,
    InitiatorWaitConfigReq,
    InitiatorWaitConfigRsp,
    Sabm0ReqWaitUa0,
    ResponderWaitSecurity,
    ResponderWaitConfigReqAndRsp,
    ResponderWaitConfigReq,
    ResponderWaitConfigRsp,
    WaitSabm0,
    Disc0ReqWaitUa0,
    WaitRestart,
    Closing,
    Connected,
}

/// Events consumed by the session state machine.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A channel wants this session established.
    Open,
    /// The engine is shutting the session down for good.
    Close,
    /// The security service answered an access check.
    SecurityResult {
        direction: SecurityDirection,
        granted: bool,
    },
    /// Local result of the transport connect call.
    ConnectResult { ok: bool },
    /// The peer answered the transport connect request.
    ConnectRsp { ok: bool },
    /// The peer requested transport configuration.
    ConfigReq { mtu: u16 },
    /// The peer answered our transport configuration request.
    ConfigRsp { ok: bool },
    /// An inbound transport connect arrived for this peer address.
    PendingConnect { id: TransportId },
    RecvSabm,
    RecvUa,
    RecvDm,
    RecvDisc,
    RecvFlowOn { cr: MuxCr },
    RecvFlowOff { cr: MuxCr },
    RecvTest { cr: MuxCr, payload: Vec<u8> },
    /// The session timer fired, or a channel forwarded its own timeout.
    Timeout,
    /// The transport connection `id` went away.
    LinkLost {
        id: TransportId,
        reason: DisconnectReason,
    },
}

/// One multiplexer session towards a peer address.
pub(crate) struct Session {
    pub addr: BdAddr,
    pub transport_id: Option<TransportId>,
    pub is_initiator: bool,
    pub state: SessionState,
    /// Fixed by the first PN exchange for the session's lifetime.
    pub flow_mode: FlowControlMode,
    /// MTU this side is willing to receive on the transport.
    pub local_transport_mtu: u16,
    /// MTU the peer is willing to receive on the transport.
    pub peer_transport_mtu: u16,
    /// The peer paused the whole session with FCOFF.
    pub peer_session_fc: bool,
    /// Inbound transport connect parked during a connect collision.
    pub pending_transport_id: Option<TransportId>,
    pub channels: HashMap<Dlci, Channel>,
    pub timer: Option<Instant>,
}

impl Session {
    pub fn new(addr: BdAddr, is_initiator: bool) -> Self {
        Self {
            addr,
            transport_id: None,
            is_initiator,
            state: SessionState::Closed,
            flow_mode: FlowControlMode::Unknown,
            local_transport_mtu: DEFAULT_TRANSPORT_MTU,
            peer_transport_mtu: DEFAULT_TRANSPORT_MTU,
            peer_session_fc: false,
            pending_transport_id: None,
            channels: HashMap::new(),
            timer: None,
        }
    }

    pub fn role(&self) -> Role {
        if self.is_initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn arm_timer(&mut self, duration: Duration) {
        self.timer = Some(Instant::now() + duration);
    }

    pub fn disarm_timer(&mut self) {
        self.timer = None;
    }

    /// The server channel of any attached channel, used for the
    /// session-level security check and for restarts.
    fn any_scn(&self) -> Option<crate::types::Scn> {
        self.channels.values().next().map(|channel| channel.scn)
    }
}

impl RfcommEngine {
    /// Runs one session event to completion. The session is taken out of
    /// the registry for the duration; a `true` disposition from the FSM
    /// means it was torn down and is not reinserted.
    pub(crate) fn handle_session_event(&mut self, addr: BdAddr, event: SessionEvent) {
        let Some(mut session) = self.sessions.remove(&addr) else {
            debug!("dropping session event for unknown session {}", addr);
            return;
        };
        let destroy = self.session_fsm(&mut session, event);
        if destroy {
            info!("session {} destroyed", addr);
        } else {
            self.sessions.insert(addr, session);
        }
    }

    fn session_fsm(&mut self, session: &mut Session, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Open => self.session_open(session),
            SessionEvent::Close => self.session_close(session),
            SessionEvent::SecurityResult { direction, granted } => {
                self.session_security_result(session, direction, granted)
            }
            SessionEvent::ConnectResult { ok } => self.session_connect_result(session, ok),
            SessionEvent::ConnectRsp { ok } => self.session_connect_response(session, ok),
            SessionEvent::ConfigReq { mtu } => self.session_config_request(session, mtu),
            SessionEvent::ConfigRsp { ok } => self.session_config_response(session, ok),
            SessionEvent::PendingConnect { id } => self.session_pending_connect(session, id),
            SessionEvent::RecvSabm => self.session_recv_sabm0(session),
            SessionEvent::RecvUa => self.session_recv_ua0(session),
            SessionEvent::RecvDm => self.session_recv_dm0(session),
            SessionEvent::RecvDisc => self.session_recv_disc0(session),
            SessionEvent::RecvFlowOn { cr } => self.session_recv_fcon(session, cr),
            SessionEvent::RecvFlowOff { cr } => self.session_recv_fcoff(session, cr),
            SessionEvent::RecvTest { cr, payload } => self.session_recv_test(session, cr, payload),
            SessionEvent::Timeout => self.session_timeout(session),
            SessionEvent::LinkLost { id, reason } => self.session_link_lost(session, id, reason),
        }
    }

    fn session_open(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::Closed => {
                session.is_initiator = true;
                session.state = SessionState::InitiatorWaitSecurity;
                let check = SecurityCheck {
                    addr: session.addr,
                    scn: session.any_scn(),
                    direction: SecurityDirection::Outgoing,
                    scope: SecurityScope::Session,
                };
                self.security.request_access(check);
                false
            }
            // An open racing an in-flight close is queued: once the
            // pending UA0/DM0 arrives the session restarts as initiator.
            SessionState::Disc0ReqWaitUa0 => {
                session.state = SessionState::WaitRestart;
                false
            }
            SessionState::Connected => {
                self.broadcast_session_ready(session);
                false
            }
            _ => false,
        }
    }

    fn session_close(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::Connected => {
                self.teardown_channels(session);
                let frame = frame::encode_disc(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                session.state = SessionState::Closing;
                session.arm_timer(SESSION_TIMEOUT);
                false
            }
            SessionState::Disc0ReqWaitUa0 | SessionState::Closing => false,
            _ => {
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
        }
    }

    fn session_security_result(
        &mut self,
        session: &mut Session,
        direction: SecurityDirection,
        granted: bool,
    ) -> bool {
        match (session.state, direction) {
            (SessionState::InitiatorWaitSecurity, SecurityDirection::Outgoing) => {
                if !granted {
                    warn!("outbound session to {} denied by security", session.addr);
                    self.teardown_channels(session);
                    self.free_session_resources(session);
                    return true;
                }
                match self.shim.connect(session.addr) {
                    Ok(id) => {
                        session.transport_id = Some(id);
                        self.transports.insert(id, session.addr);
                        session.state = SessionState::WaitConnectReqResult;
                        false
                    }
                    Err(e) => {
                        warn!("transport connect to {} failed: {}", session.addr, e);
                        self.teardown_channels(session);
                        self.free_session_resources(session);
                        true
                    }
                }
            }
            (SessionState::ResponderWaitSecurity, SecurityDirection::Incoming) => {
                let Some(id) = session.transport_id else {
                    self.teardown_channels(session);
                    self.free_session_resources(session);
                    return true;
                };
                if granted {
                    self.shim.connect_response(id, true);
                    self.shim.config_request(id, session.local_transport_mtu);
                    session.state = SessionState::ResponderWaitConfigReqAndRsp;
                    false
                } else {
                    warn!("inbound session from {} denied by security", session.addr);
                    self.shim.connect_response(id, false);
                    self.teardown_channels(session);
                    self.free_session_resources(session);
                    true
                }
            }
            _ => {
                debug!(
                    "stale security result ({:?}) for session {} in {:?}",
                    direction, session.addr, session.state
                );
                false
            }
        }
    }

    fn session_connect_result(&mut self, session: &mut Session, ok: bool) -> bool {
        if session.state != SessionState::WaitConnectReqResult {
            return false;
        }
        // A parked inbound connect always wins over our own attempt.
        if session.pending_transport_id.is_some() {
            self.switch_to_responder(session);
            return false;
        }
        if ok {
            session.state = SessionState::WaitConnectRsp;
            false
        } else {
            self.teardown_channels(session);
            self.free_session_resources(session);
            true
        }
    }

    fn session_connect_response(&mut self, session: &mut Session, ok: bool) -> bool {
        if session.state != SessionState::WaitConnectRsp {
            return false;
        }
        if session.pending_transport_id.is_some() {
            self.switch_to_responder(session);
            return false;
        }
        if ok {
            if let Some(id) = session.transport_id {
                self.shim.config_request(id, session.local_transport_mtu);
            }
            session.state = SessionState::InitiatorWaitConfigReqAndRsp;
            false
        } else {
            self.teardown_channels(session);
            self.free_session_resources(session);
            true
        }
    }

    fn session_config_request(&mut self, session: &mut Session, mtu: u16) -> bool {
        session.peer_transport_mtu = mtu;
        if let Some(id) = session.transport_id {
            self.shim.config_response(id, true);
        }
        match session.state {
            SessionState::InitiatorWaitConfigReqAndRsp => {
                session.state = SessionState::InitiatorWaitConfigRsp;
            }
            SessionState::InitiatorWaitConfigReq => self.send_sabm0(session),
            SessionState::ResponderWaitConfigReqAndRsp => {
                session.state = SessionState::ResponderWaitConfigRsp;
            }
            SessionState::ResponderWaitConfigReq => {
                session.state = SessionState::WaitSabm0;
                session.arm_timer(SESSION_TIMEOUT);
            }
            // Reconfiguration of an established transport only updates
            // the MTU.
            SessionState::Connected => {}
            _ => {}
        }
        false
    }

    fn session_config_response(&mut self, session: &mut Session, ok: bool) -> bool {
        if !ok {
            self.teardown_channels(session);
            self.free_session_resources(session);
            return true;
        }
        match session.state {
            SessionState::InitiatorWaitConfigReqAndRsp => {
                session.state = SessionState::InitiatorWaitConfigReq;
            }
            SessionState::InitiatorWaitConfigRsp => self.send_sabm0(session),
            SessionState::ResponderWaitConfigReqAndRsp => {
                session.state = SessionState::ResponderWaitConfigReq;
            }
            SessionState::ResponderWaitConfigRsp => {
                session.state = SessionState::WaitSabm0;
                session.arm_timer(SESSION_TIMEOUT);
            }
            _ => {}
        }
        false
    }

    fn send_sabm0(&mut self, session: &mut Session) {
        session.state = SessionState::Sabm0ReqWaitUa0;
        session.arm_timer(SESSION_TIMEOUT);
        let frame = frame::encode_sabm(session.role(), Dlci::MUX_CONTROL);
        self.send_frame(session, frame);
    }

    fn session_pending_connect(&mut self, session: &mut Session, id: TransportId) -> bool {
        match session.state {
            // Fresh inbound session.
            SessionState::Closed => {
                session.is_initiator = false;
                session.transport_id = Some(id);
                session.state = SessionState::ResponderWaitSecurity;
                let check = SecurityCheck {
                    addr: session.addr,
                    scn: None,
                    direction: SecurityDirection::Incoming,
                    scope: SecurityScope::Session,
                };
                self.security.request_access(check);
                false
            }
            // We have not touched the transport yet; demote ourselves to
            // responder on the spot. Channels created for the outbound
            // attempt flip their direction bit.
            SessionState::InitiatorWaitSecurity => {
                session.is_initiator = false;
                session.transport_id = Some(id);
                self.flip_channel_directions(session);
                session.state = SessionState::ResponderWaitSecurity;
                let check = SecurityCheck {
                    addr: session.addr,
                    scn: None,
                    direction: SecurityDirection::Incoming,
                    scope: SecurityScope::Session,
                };
                self.security.request_access(check);
                false
            }
            // Collision: our own connect is in flight. Park the inbound
            // request; whatever happens to our attempt accepts it.
            SessionState::WaitConnectReqResult | SessionState::WaitConnectRsp => {
                info!("connect collision with {}, parking inbound request", session.addr);
                session.pending_transport_id = Some(id);
                let backoff = rand::thread_rng().gen_range(0..COLLISION_BACKOFF_MAX_SECS);
                session.arm_timer(Duration::from_secs(backoff));
                false
            }
            _ => {
                debug!(
                    "rejecting inbound connect from {} in {:?}",
                    session.addr, session.state
                );
                self.shim.connect_response(id, false);
                self.transports.remove(&id);
                false
            }
        }
    }

    /// Abandons the outbound attempt and accepts the parked inbound
    /// connect, switching this session to the responder role.
    fn switch_to_responder(&mut self, session: &mut Session) {
        let Some(pending) = session.pending_transport_id.take() else {
            return;
        };
        if let Some(old) = session.transport_id.take() {
            self.shim.disconnect(old);
            self.transports.remove(&old);
        }
        info!("session {} resolving collision as responder", session.addr);
        session.transport_id = Some(pending);
        session.is_initiator = false;
        session.disarm_timer();
        self.flip_channel_directions(session);
        session.state = SessionState::ResponderWaitSecurity;
        let check = SecurityCheck {
            addr: session.addr,
            scn: None,
            direction: SecurityDirection::Incoming,
            scope: SecurityScope::Session,
        };
        self.security.request_access(check);
    }

    /// Re-keys every channel to the opposite direction bit after a role
    /// change, keeping the handle index in step.
    fn flip_channel_directions(&mut self, session: &mut Session) {
        if session.channels.is_empty() {
            return;
        }
        let mut flipped = HashMap::with_capacity(session.channels.len());
        for (dlci, mut channel) in session.channels.drain() {
            let new_dlci = dlci.flipped();
            channel.dlci = new_dlci;
            self.handles.insert(channel.handle, (session.addr, new_dlci));
            flipped.insert(new_dlci, channel);
        }
        session.channels = flipped;
    }

    fn session_recv_sabm0(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::WaitSabm0 => {
                session.disarm_timer();
                let frame = frame::encode_ua(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                self.session_enter_connected(session);
                false
            }
            // A duplicate SABM0 on an established session is re-acked.
            SessionState::Connected => {
                let frame = frame::encode_ua(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                false
            }
            _ => false,
        }
    }

    fn session_recv_ua0(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::Sabm0ReqWaitUa0 => {
                session.disarm_timer();
                self.session_enter_connected(session);
                false
            }
            SessionState::Disc0ReqWaitUa0 | SessionState::Closing => {
                session.disarm_timer();
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
            SessionState::WaitRestart => {
                session.disarm_timer();
                self.restart_session(session)
            }
            _ => false,
        }
    }

    fn session_recv_dm0(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::Disc0ReqWaitUa0 | SessionState::Closing => {
                session.disarm_timer();
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
            SessionState::WaitRestart => {
                session.disarm_timer();
                self.restart_session(session)
            }
            // DM0 in any pending state tears the whole multiplexer down.
            _ => {
                warn!("session {} refused by peer (DM0)", session.addr);
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
        }
    }

    fn session_recv_disc0(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::Connected => {
                let frame = frame::encode_ua(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
            // Simultaneous close.
            SessionState::Disc0ReqWaitUa0 | SessionState::Closing => {
                let frame = frame::encode_ua(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
            SessionState::WaitRestart => {
                let frame = frame::encode_ua(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                self.restart_session(session)
            }
            _ => {
                let frame = frame::encode_dm(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
        }
    }

    fn session_recv_fcon(&mut self, session: &mut Session, cr: MuxCr) -> bool {
        if session.state != SessionState::Connected || !cr.is_command() {
            return false;
        }
        // Session-wide flow control only exists outside credit mode.
        if session.flow_mode == FlowControlMode::CreditBased {
            return false;
        }
        session.peer_session_fc = false;
        let frame = frame::encode_mux_command(
            session.role(),
            &MuxCommand::FlowControlOn {
                cr: MuxCr::Response,
            },
        );
        self.send_frame(session, frame);
        // The session-wide gate opened: drain every channel.
        let dlcis: Vec<Dlci> = session.channels.keys().copied().collect();
        for dlci in dlcis {
            self.flush_channel(session, dlci);
        }
        false
    }

    fn session_recv_fcoff(&mut self, session: &mut Session, cr: MuxCr) -> bool {
        if session.state != SessionState::Connected || !cr.is_command() {
            return false;
        }
        if session.flow_mode == FlowControlMode::CreditBased {
            return false;
        }
        session.peer_session_fc = true;
        let frame = frame::encode_mux_command(
            session.role(),
            &MuxCommand::FlowControlOff {
                cr: MuxCr::Response,
            },
        );
        self.send_frame(session, frame);
        false
    }

    fn session_recv_test(&mut self, session: &mut Session, cr: MuxCr, payload: Vec<u8>) -> bool {
        if session.state != SessionState::Connected || !cr.is_command() {
            return false;
        }
        let frame = frame::encode_mux_command(
            session.role(),
            &MuxCommand::Test {
                cr: MuxCr::Response,
                payload,
            },
        );
        self.send_frame(session, frame);
        false
    }

    fn session_timeout(&mut self, session: &mut Session) -> bool {
        match session.state {
            SessionState::WaitConnectReqResult | SessionState::WaitConnectRsp => {
                if session.pending_transport_id.is_some() {
                    // Collision backoff expired without a local outcome;
                    // accept the peer's request anyway.
                    self.switch_to_responder(session);
                    false
                } else {
                    self.teardown_channels(session);
                    self.free_session_resources(session);
                    true
                }
            }
            SessionState::Disc0ReqWaitUa0 | SessionState::Closing => {
                warn!("session {} close timed out", session.addr);
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
            SessionState::WaitRestart => self.restart_session(session),
            SessionState::Connected => false,
            _ => {
                warn!("session {} timed out in {:?}", session.addr, session.state);
                self.teardown_channels(session);
                self.free_session_resources(session);
                true
            }
        }
    }

    fn session_link_lost(
        &mut self,
        session: &mut Session,
        id: TransportId,
        reason: DisconnectReason,
    ) -> bool {
        // A parked collision request vanishing only cancels the parking;
        // our own outbound attempt is still in flight.
        if session.pending_transport_id == Some(id) {
            debug!("parked inbound connect from {} withdrawn", session.addr);
            session.pending_transport_id = None;
            session.disarm_timer();
            self.transports.remove(&id);
            return false;
        }
        if session.transport_id != Some(id) {
            return false;
        }
        // The transport is already gone; forget the identifier so no
        // disconnect is issued against it.
        session.transport_id = None;
        self.transports.remove(&id);
        if reason == DisconnectReason::StateCollision && !session.channels.is_empty() {
            info!("transport state collision with {}, restarting session", session.addr);
            return self.restart_session(session);
        }
        warn!("session {} lost its transport ({:?})", session.addr, reason);
        self.teardown_channels(session);
        self.free_session_resources(session);
        true
    }

    /// Resets the session and reopens it as initiator on behalf of the
    /// client channels still attached. Channels the peer opened cannot be
    /// reopened from this side and observe a disconnect instead. Returns
    /// true when nothing was left to reconnect for and the session died.
    fn restart_session(&mut self, session: &mut Session) -> bool {
        if let Some(id) = session.transport_id.take() {
            self.shim.disconnect(id);
            self.transports.remove(&id);
        }
        let server_dlcis: Vec<Dlci> = session
            .channels
            .iter()
            .filter(|(_, channel)| channel.is_server)
            .map(|(dlci, _)| *dlci)
            .collect();
        for dlci in server_dlcis {
            if let Some(channel) = session.channels.remove(&dlci) {
                notify(
                    &channel,
                    ChannelEvent::Disconnected {
                        handle: channel.handle,
                    },
                );
                self.release_handle(channel.handle);
            }
        }
        if session.channels.is_empty() {
            self.free_session_resources(session);
            return true;
        }
        session.state = SessionState::Closed;
        session.flow_mode = FlowControlMode::Unknown;
        session.peer_session_fc = false;
        session.peer_transport_mtu = DEFAULT_TRANSPORT_MTU;
        session.disarm_timer();
        session.is_initiator = true;
        self.flip_channels_to_role(session, Role::Initiator);
        for channel in session.channels.values_mut() {
            channel.reset_for_restart();
        }
        info!("session {} restarting as initiator", session.addr);
        self.post(Task::Session {
            addr: session.addr,
            event: SessionEvent::Open,
        });
        false
    }

    /// Re-keys channels so their direction bit matches `role`.
    fn flip_channels_to_role(&mut self, session: &mut Session, role: Role) {
        let needs_flip: Vec<Dlci> = session
            .channels
            .keys()
            .copied()
            .filter(|dlci| {
                dlci.scn()
                    .map(|scn| Dlci::from_scn(scn, role) != *dlci)
                    .unwrap_or(false)
            })
            .collect();
        if needs_flip.is_empty() {
            return;
        }
        self.flip_channel_directions(session);
    }

    /// Marks the session connected and kicks every channel that was
    /// waiting for it.
    fn session_enter_connected(&mut self, session: &mut Session) {
        info!(
            "session {} connected as {:?}",
            session.addr,
            session.role()
        );
        session.state = SessionState::Connected;
        session.disarm_timer();
        self.broadcast_session_ready(session);
    }

    fn broadcast_session_ready(&mut self, session: &mut Session) {
        let pending: Vec<Dlci> = session
            .channels
            .iter()
            .filter(|(_, channel)| channel.state == ChannelState::Closed && !channel.is_server)
            .map(|(dlci, _)| *dlci)
            .collect();
        for dlci in pending {
            self.post(Task::Dlc {
                addr: session.addr,
                dlci,
                event: DlcEvent::SessionReady,
            });
        }
    }

    /// Notifies and frees every channel. Connected channels observe a
    /// disconnect, the rest a connect failure.
    pub(crate) fn teardown_channels(&mut self, session: &mut Session) {
        for (_, channel) in session.channels.drain() {
            let event = match channel.state {
                ChannelState::Connected
                | ChannelState::DiscReqWaitUa
                | ChannelState::WaitRestart => ChannelEvent::Disconnected {
                    handle: channel.handle,
                },
                _ => ChannelEvent::ConnectFail {
                    handle: channel.handle,
                },
            };
            notify(&channel, event);
            self.release_handle(channel.handle);
        }
    }

    /// Releases transport-side resources held by a session that is being
    /// destroyed. A parked collision request is politely refused.
    pub(crate) fn free_session_resources(&mut self, session: &mut Session) {
        if let Some(id) = session.transport_id.take() {
            self.shim.disconnect(id);
            self.transports.remove(&id);
        }
        if let Some(id) = session.pending_transport_id.take() {
            self.shim.connect_response(id, false);
            self.transports.remove(&id);
        }
    }

    /// A session with no channels left and nothing pending is invalid:
    /// connected sessions close gracefully, the rest are freed at once.
    /// Returns true when the session was destroyed.
    pub(crate) fn session_idle_check(&mut self, session: &mut Session) -> bool {
        if !session.channels.is_empty() {
            return false;
        }
        match session.state {
            SessionState::Connected => {
                debug!("session {} idle, closing multiplexer", session.addr);
                let frame = frame::encode_disc(session.role(), Dlci::MUX_CONTROL);
                self.send_frame(session, frame);
                session.state = SessionState::Disc0ReqWaitUa0;
                session.arm_timer(SESSION_TIMEOUT);
                false
            }
            SessionState::Disc0ReqWaitUa0 | SessionState::Closing | SessionState::WaitRestart => {
                false
            }
            _ => {
                if session.pending_transport_id.is_some() {
                    return false;
                }
                self.free_session_resources(session);
                true
            }
        }
    }
}

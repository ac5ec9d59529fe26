//! RFCOMM engine
//!
//! `RfcommEngine` is the single owner of all protocol state: sessions
//! keyed by peer address, channels owned by their session and addressed
//! through process-unique handles, the server registry, and the handle
//! pool. Every entry point (public API call, transport callback,
//! security verdict, timer) turns into a task on an internal FIFO that
//! is drained to completion before the call returns, so each session and
//! channel observes its events in submission order. Exclusive `&mut`
//! access replaces the task-queue-plus-lock discipline a shared engine
//! would otherwise need.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelState, DlcEvent};
use crate::error::{RfcommError, RfcommResult};
use crate::frame::{self, mux::MuxCommand, mux::MuxCr, ChannelFrame, FrameEvent, SessionFrame};
use crate::security::{SecurityCheck, SecurityDelegate, SecurityScope};
use crate::server::ServerRegistry;
use crate::session::{Session, SessionEvent, SessionState};
use crate::transport::{DisconnectReason, L2capShim, TransportId};
use crate::types::{
    BdAddr, ChannelEventCallback, Dlci, EventMask, FlowControlMode, Handle, LineStatus,
    ModemSignals, PortConfig, PortState, Role, Scn, MAX_HANDLE,
};

/// One unit of work on the engine's serialized execution context.
#[derive(Debug)]
pub(crate) enum Task {
    Session {
        addr: BdAddr,
        event: SessionEvent,
    },
    Dlc {
        addr: BdAddr,
        dlci: Dlci,
        event: DlcEvent,
    },
}

/// The RFCOMM protocol engine.
pub struct RfcommEngine {
    pub(crate) shim: Box<dyn L2capShim>,
    pub(crate) security: Box<dyn SecurityDelegate>,
    pub(crate) sessions: HashMap<BdAddr, Session>,
    /// Transport connection id back to the owning peer address.
    pub(crate) transports: HashMap<TransportId, BdAddr>,
    /// Handle back to the (session, channel) pair it names.
    pub(crate) handles: HashMap<Handle, (BdAddr, Dlci)>,
    /// Bitmap over handles 1..=36.
    handle_pool: u64,
    pub(crate) servers: ServerRegistry,
    tasks: VecDeque<Task>,
    draining: bool,
}

impl RfcommEngine {
    pub fn new(shim: Box<dyn L2capShim>, security: Box<dyn SecurityDelegate>) -> Self {
        info!("RFCOMM engine initialized");
        Self {
            shim,
            security,
            sessions: HashMap::new(),
            transports: HashMap::new(),
            handles: HashMap::new(),
            handle_pool: 0,
            servers: ServerRegistry::new(),
            tasks: VecDeque::new(),
            draining: false,
        }
    }

    // ---- serialized execution context ------------------------------------

    pub(crate) fn post(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    /// Drains the task queue to completion. Re-entrant calls return
    /// immediately; the outermost drain picks their tasks up.
    fn run_tasks(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some(task) = self.tasks.pop_front() {
            trace!("dispatching {:?}", task);
            match task {
                Task::Session { addr, event } => self.handle_session_event(addr, event),
                Task::Dlc { addr, dlci, event } => self.handle_dlc_event(addr, dlci, event),
            }
        }
        self.draining = false;
    }

    // ---- resource pools --------------------------------------------------

    fn allocate_handle(&mut self) -> RfcommResult<Handle> {
        for handle in 1..=MAX_HANDLE {
            let bit = 1u64 << handle;
            if self.handle_pool & bit == 0 {
                self.handle_pool |= bit;
                return Ok(handle);
            }
        }
        Err(RfcommError::NoResources)
    }

    pub(crate) fn release_handle(&mut self, handle: Handle) {
        self.handle_pool &= !(1u64 << handle);
        self.handles.remove(&handle);
    }

    fn resolve(&self, handle: Handle) -> RfcommResult<(BdAddr, Dlci)> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or_else(|| RfcommError::InvalidParameter(format!("unknown handle {}", handle)))
    }

    pub(crate) fn send_frame(&mut self, session: &Session, frame: Vec<u8>) {
        if let Some(id) = session.transport_id {
            trace!("tx {}: {}", session.addr, hex::encode(&frame));
            self.shim.send(id, frame);
        } else {
            debug!("dropping frame for {}: no transport", session.addr);
        }
    }

    // ---- public API ------------------------------------------------------

    /// Opens a channel to `scn` on the peer at `addr`, creating the
    /// session if this is its first channel. The returned handle names
    /// the channel until a terminal event is delivered.
    pub fn connect(
        &mut self,
        addr: BdAddr,
        scn: Scn,
        mtu: u16,
        event_mask: EventMask,
        callback: ChannelEventCallback,
    ) -> RfcommResult<Handle> {
        if mtu == 0 || mtu > 0x7FFF {
            return Err(RfcommError::InvalidParameter(format!("mtu {}", mtu)));
        }
        let role = self
            .sessions
            .get(&addr)
            .map(|session| session.role())
            .unwrap_or(Role::Initiator);
        let dlci = Dlci::from_scn(scn, role);
        if self
            .sessions
            .get(&addr)
            .is_some_and(|session| session.channels.contains_key(&dlci))
        {
            return Err(RfcommError::AlreadyExists);
        }

        let handle = self.allocate_handle()?;
        let channel = Channel::new(handle, dlci, scn, false, mtu, event_mask, callback);
        let session = self
            .sessions
            .entry(addr)
            .or_insert_with(|| Session::new(addr, true));
        session.channels.insert(dlci, channel);
        self.handles.insert(handle, (addr, dlci));
        info!("connect: handle {} -> {} scn {}", handle, addr, scn);

        self.post(Task::Dlc {
            addr,
            dlci,
            event: DlcEvent::Open,
        });
        self.run_tasks();
        Ok(handle)
    }

    /// Registers a listener for incoming connections on `scn`.
    pub fn register_server(
        &mut self,
        scn: Scn,
        mtu: u16,
        event_mask: EventMask,
        callback: ChannelEventCallback,
    ) -> RfcommResult<()> {
        if mtu == 0 || mtu > 0x7FFF {
            return Err(RfcommError::InvalidParameter(format!("mtu {}", mtu)));
        }
        self.servers.register(scn, mtu, event_mask, callback)
    }

    /// Removes a listener. With `close_channels` set, channels that were
    /// accepted through it are disconnected as well.
    pub fn deregister_server(&mut self, scn: Scn, close_channels: bool) -> RfcommResult<()> {
        self.servers.deregister(scn)?;
        if close_channels {
            let targets: Vec<(BdAddr, Dlci)> = self
                .sessions
                .iter()
                .flat_map(|(addr, session)| {
                    session
                        .channels
                        .iter()
                        .filter(|(_, channel)| channel.is_server && channel.scn == scn)
                        .map(|(dlci, _)| (*addr, *dlci))
                })
                .collect();
            for (addr, dlci) in targets {
                self.post(Task::Dlc {
                    addr,
                    dlci,
                    event: DlcEvent::Close,
                });
            }
            self.run_tasks();
        }
        Ok(())
    }

    /// Reserves an unused server channel number for a later
    /// `register_server`.
    pub fn assign_server_channel(&mut self) -> RfcommResult<Scn> {
        self.servers.assign()
    }

    /// Returns a reserved but unregistered server channel number.
    pub fn free_server_channel(&mut self, scn: Scn) -> RfcommResult<()> {
        self.servers.free(scn)
    }

    /// Accepts an incoming connection previously announced through
    /// `ConnectIncoming`.
    pub fn accept_connection(&mut self, handle: Handle) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        self.post(Task::Dlc {
            addr,
            dlci,
            event: DlcEvent::Accept,
        });
        self.run_tasks();
        Ok(())
    }

    /// Rejects an incoming connection; the peer observes a DM.
    pub fn reject_connection(&mut self, handle: Handle) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        self.post(Task::Dlc {
            addr,
            dlci,
            event: DlcEvent::Reject,
        });
        self.run_tasks();
        Ok(())
    }

    /// Starts disconnecting a channel.
    pub fn disconnect(&mut self, handle: Handle) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        self.post(Task::Dlc {
            addr,
            dlci,
            event: DlcEvent::Close,
        });
        self.run_tasks();
        Ok(())
    }

    /// Sends one packet. The packet must fit the negotiated send MTU;
    /// flow-blocked packets are buffered until the bounded queue fills.
    pub fn write(&mut self, handle: Handle, data: Vec<u8>) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        let Some(mut session) = self.sessions.remove(&addr) else {
            return Err(RfcommError::NotConnected);
        };
        let result = if session.channels.contains_key(&dlci) {
            self.channel_write(&mut session, dlci, data)
        } else {
            Err(RfcommError::ChannelNotFound)
        };
        self.sessions.insert(addr, session);
        result
    }

    /// Takes one received packet off the inbound queue.
    pub fn read(&mut self, handle: Handle) -> RfcommResult<Vec<u8>> {
        let (addr, dlci) = self.resolve(handle)?;
        let Some(mut session) = self.sessions.remove(&addr) else {
            return Err(RfcommError::NotConnected);
        };
        let result = if session.channels.contains_key(&dlci) {
            self.channel_read(&mut session, dlci)
        } else {
            Err(RfcommError::ChannelNotFound)
        };
        self.sessions.insert(addr, session);
        result
    }

    /// Updates the local V.24 signals and announces them with an MSC
    /// command.
    pub fn set_modem_status(
        &mut self,
        handle: Handle,
        signals: ModemSignals,
        break_signal: Option<u8>,
    ) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        let Some(mut session) = self.sessions.remove(&addr) else {
            return Err(RfcommError::NotConnected);
        };
        let result = (|| {
            let role = session.role();
            let Some(channel) = session.channels.get_mut(&dlci) else {
                return Err(RfcommError::ChannelNotFound);
            };
            if channel.state != ChannelState::Connected {
                return Err(RfcommError::NotConnected);
            }
            let mut signals = signals;
            // The flow bit stays under the engine's control.
            signals.set(ModemSignals::FC, channel.local_fc);
            channel.local_signals = signals;
            let frame = frame::encode_mux_command(
                role,
                &MuxCommand::ModemStatus {
                    cr: MuxCr::Command,
                    dlci,
                    signals,
                    break_signal,
                },
            );
            self.send_frame(&session, frame);
            Ok(())
        })();
        self.sessions.insert(addr, session);
        result
    }

    /// Proposes remote port settings via RPN.
    pub fn set_port_config(&mut self, handle: Handle, config: PortConfig) -> RfcommResult<()> {
        self.send_port_command(handle, Some(config))
    }

    /// Queries the peer's current port settings via a one-octet RPN
    /// request.
    pub fn request_port_config(&mut self, handle: Handle) -> RfcommResult<()> {
        self.send_port_command(handle, None)
    }

    fn send_port_command(&mut self, handle: Handle, config: Option<PortConfig>) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        let Some(mut session) = self.sessions.remove(&addr) else {
            return Err(RfcommError::NotConnected);
        };
        let result = (|| {
            if session.state != SessionState::Connected {
                return Err(RfcommError::NotConnected);
            }
            let role = session.role();
            let Some(channel) = session.channels.get_mut(&dlci) else {
                return Err(RfcommError::ChannelNotFound);
            };
            if let Some(config) = config {
                channel.port_config = config;
            }
            let frame = frame::encode_mux_command(
                role,
                &MuxCommand::RemotePortNegotiation {
                    cr: MuxCr::Command,
                    dlci,
                    config,
                },
            );
            self.send_frame(&session, frame);
            Ok(())
        })();
        self.sessions.insert(addr, session);
        result
    }

    /// Reports a local line error to the peer via RLS.
    pub fn send_remote_line_status(
        &mut self,
        handle: Handle,
        status: LineStatus,
    ) -> RfcommResult<()> {
        let (addr, dlci) = self.resolve(handle)?;
        let Some(mut session) = self.sessions.remove(&addr) else {
            return Err(RfcommError::NotConnected);
        };
        let result = (|| {
            if session.state != SessionState::Connected {
                return Err(RfcommError::NotConnected);
            }
            let role = session.role();
            if !session.channels.contains_key(&dlci) {
                return Err(RfcommError::ChannelNotFound);
            }
            let frame = frame::encode_mux_command(
                role,
                &MuxCommand::RemoteLineStatus {
                    cr: MuxCr::Command,
                    dlci,
                    status,
                },
            );
            self.send_frame(&session, frame);
            Ok(())
        })();
        self.sessions.insert(addr, session);
        result
    }

    /// Cumulative byte counters for a channel.
    pub fn get_port_state(&self, handle: Handle) -> RfcommResult<PortState> {
        let (addr, dlci) = self.resolve(handle)?;
        let channel = self
            .sessions
            .get(&addr)
            .and_then(|session| session.channels.get(&dlci))
            .ok_or(RfcommError::ChannelNotFound)?;
        Ok(PortState {
            received_bytes: channel.received_bytes,
            transmitted_bytes: channel.transmitted_bytes,
        })
    }

    /// Peer address a channel is connected to.
    pub fn get_peer_address(&self, handle: Handle) -> RfcommResult<BdAddr> {
        let (addr, _) = self.resolve(handle)?;
        Ok(addr)
    }

    /// Closes every session. Channel owners observe disconnect events at
    /// once; connected multiplexers run the DISC0 handshake and linger
    /// until the peer answers or the close times out.
    pub fn shutdown(&mut self) {
        info!("RFCOMM engine shutting down");
        let addrs: Vec<BdAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.post(Task::Session {
                addr,
                event: SessionEvent::Close,
            });
        }
        self.run_tasks();
    }

    // ---- security intake -------------------------------------------------

    /// Delivers the verdict of an access check issued through the
    /// security delegate. The original request is echoed back so the
    /// engine can drop verdicts that no longer match the current state.
    pub fn security_result(&mut self, check: SecurityCheck, granted: bool) {
        match check.scope {
            SecurityScope::Session => self.post(Task::Session {
                addr: check.addr,
                event: SessionEvent::SecurityResult {
                    direction: check.direction,
                    granted,
                },
            }),
            SecurityScope::Channel(dlci) => self.post(Task::Dlc {
                addr: check.addr,
                dlci,
                event: DlcEvent::SecurityResult {
                    direction: check.direction,
                    granted,
                },
            }),
        }
        self.run_tasks();
    }

    // ---- transport intake ------------------------------------------------

    /// The peer opened a transport connection towards us.
    pub fn transport_connect_requested(&mut self, addr: BdAddr, id: TransportId) {
        self.transports.insert(id, addr);
        self.sessions
            .entry(addr)
            .or_insert_with(|| Session::new(addr, false));
        self.post(Task::Session {
            addr,
            event: SessionEvent::PendingConnect { id },
        });
        self.run_tasks();
    }

    /// Local result of a transport connect we issued.
    pub fn transport_connect_result(&mut self, id: TransportId, ok: bool) {
        self.post_transport_event(id, SessionEvent::ConnectResult { ok });
    }

    /// The peer's answer to a transport connect we issued.
    pub fn transport_connect_response(&mut self, id: TransportId, ok: bool) {
        self.post_transport_event(id, SessionEvent::ConnectRsp { ok });
    }

    /// The peer's transport configuration request, announcing the MTU it
    /// is willing to receive.
    pub fn transport_config_request(&mut self, id: TransportId, mtu: u16) {
        self.post_transport_event(id, SessionEvent::ConfigReq { mtu });
    }

    /// The peer's answer to our transport configuration request.
    pub fn transport_config_response(&mut self, id: TransportId, ok: bool) {
        self.post_transport_event(id, SessionEvent::ConfigRsp { ok });
    }

    /// The peer closed the transport connection underneath the session.
    pub fn transport_disconnect_requested(&mut self, id: TransportId) {
        self.post_transport_event(
            id,
            SessionEvent::LinkLost {
                id,
                reason: DisconnectReason::LinkLoss,
            },
        );
    }

    /// The transport reported an abnormal disconnect.
    pub fn transport_disconnected(&mut self, id: TransportId, reason: DisconnectReason) {
        self.post_transport_event(id, SessionEvent::LinkLost { id, reason });
    }

    fn post_transport_event(&mut self, id: TransportId, event: SessionEvent) {
        let Some(addr) = self.transports.get(&id).copied() else {
            debug!("dropping transport event for unknown connection {}", id);
            return;
        };
        self.post(Task::Session { addr, event });
        self.run_tasks();
    }

    /// One raw frame arrived from the transport.
    pub fn transport_data(&mut self, id: TransportId, data: &[u8]) {
        let Some(addr) = self.transports.get(&id).copied() else {
            debug!("dropping {} bytes for unknown connection {}", data.len(), id);
            return;
        };
        let Some((role, credit_based, state)) = self.sessions.get(&addr).map(|session| {
            (
                session.role(),
                session.flow_mode == FlowControlMode::CreditBased,
                session.state,
            )
        }) else {
            return;
        };
        trace!("rx {}: {}", addr, hex::encode(data));

        match frame::decode(role, credit_based, data) {
            FrameEvent::Session(frame) => {
                if let Some(event) = session_event_from_frame(frame) {
                    self.post(Task::Session { addr, event });
                }
            }
            FrameEvent::Channel { dlci, frame } => {
                let exists = self
                    .sessions
                    .get(&addr)
                    .is_some_and(|session| session.channels.contains_key(&dlci));
                if exists {
                    self.post(Task::Dlc {
                        addr,
                        dlci,
                        event: dlc_event_from_frame(frame),
                    });
                } else {
                    self.inbound_unknown_dlci(addr, id, role, state, dlci, frame);
                }
            }
            FrameEvent::UnsupportedCommand { command_type } => {
                let response = frame::encode_mux_command(
                    role,
                    &MuxCommand::NotSupported { command_type },
                );
                self.shim.send(id, response);
            }
            FrameEvent::FrameError => {}
        }
        self.run_tasks();
    }

    /// Handles traffic for a DLCI with no channel behind it. The opening
    /// commands of an incoming connection create a channel when a server
    /// is listening; everything else is refused or ignored.
    fn inbound_unknown_dlci(
        &mut self,
        addr: BdAddr,
        id: TransportId,
        role: Role,
        state: SessionState,
        dlci: Dlci,
        frame: ChannelFrame,
    ) {
        let opens_channel = matches!(
            frame,
            ChannelFrame::Sabm
                | ChannelFrame::ParameterNegotiation {
                    cr: MuxCr::Command,
                    ..
                }
                | ChannelFrame::PortNegotiation {
                    cr: MuxCr::Command,
                    config: Some(_),
                }
        );

        if opens_channel {
            if state != SessionState::Connected {
                debug!("ignoring channel open on {} before session is up", addr);
                return;
            }
            let peer_role = match role {
                Role::Initiator => Role::Responder,
                Role::Responder => Role::Initiator,
            };
            let Ok(scn) = dlci.scn() else {
                self.refuse_dlci(id, role, dlci);
                return;
            };
            // The direction bit must match the peer's role.
            if Dlci::from_scn(scn, peer_role) != dlci {
                self.refuse_dlci(id, role, dlci);
                return;
            }
            let Some(server) = self.servers.get(scn) else {
                debug!("no server on channel {}, refusing DLCI {}", scn, dlci);
                self.refuse_dlci(id, role, dlci);
                return;
            };
            let mtu = server.mtu;
            let event_mask = server.event_mask;
            let callback = server.callback.clone();
            let Ok(handle) = self.allocate_handle() else {
                warn!("handle pool exhausted, refusing DLCI {}", dlci);
                self.refuse_dlci(id, role, dlci);
                return;
            };
            let channel = Channel::new(handle, dlci, scn, true, mtu, event_mask, callback);
            if let Some(session) = self.sessions.get_mut(&addr) {
                session.channels.insert(dlci, channel);
                self.handles.insert(handle, (addr, dlci));
                self.post(Task::Dlc {
                    addr,
                    dlci,
                    event: dlc_event_from_frame(frame),
                });
            } else {
                self.release_handle(handle);
            }
            return;
        }

        match frame {
            // Port settings can be queried without a channel; answer with
            // the defaults.
            ChannelFrame::PortNegotiation {
                cr: MuxCr::Command,
                config: None,
            } => {
                let response = frame::encode_mux_command(
                    role,
                    &MuxCommand::RemotePortNegotiation {
                        cr: MuxCr::Response,
                        dlci,
                        config: Some(PortConfig::default()),
                    },
                );
                self.shim.send(id, response);
            }
            ChannelFrame::Data { .. } | ChannelFrame::Disc => {
                self.refuse_dlci(id, role, dlci);
            }
            _ => {}
        }
    }

    fn refuse_dlci(&mut self, id: TransportId, role: Role, dlci: Dlci) {
        self.shim.send(id, frame::encode_dm(role, dlci));
    }

    // ---- timers ----------------------------------------------------------

    /// Fires every expired session and channel timer.
    pub fn process_timeouts(&mut self) {
        self.process_timeouts_at(Instant::now());
    }

    /// Timer scan against an explicit clock, used by tests.
    pub fn process_timeouts_at(&mut self, now: Instant) {
        let mut fired = Vec::new();
        for (addr, session) in self.sessions.iter_mut() {
            if session.timer.is_some_and(|deadline| deadline <= now) {
                session.timer = None;
                fired.push(Task::Session {
                    addr: *addr,
                    event: SessionEvent::Timeout,
                });
            }
            for (dlci, channel) in session.channels.iter_mut() {
                if channel.timer.is_some_and(|deadline| deadline <= now) {
                    channel.timer = None;
                    fired.push(Task::Dlc {
                        addr: *addr,
                        dlci: *dlci,
                        event: DlcEvent::Timeout,
                    });
                }
            }
        }
        for task in fired {
            self.post(task);
        }
        self.run_tasks();
    }
}

fn session_event_from_frame(frame: SessionFrame) -> Option<SessionEvent> {
    match frame {
        SessionFrame::Sabm => Some(SessionEvent::RecvSabm),
        SessionFrame::Ua => Some(SessionEvent::RecvUa),
        SessionFrame::Dm => Some(SessionEvent::RecvDm),
        SessionFrame::Disc => Some(SessionEvent::RecvDisc),
        SessionFrame::Test { cr, payload } => Some(SessionEvent::RecvTest { cr, payload }),
        SessionFrame::FlowControlOn { cr } => Some(SessionEvent::RecvFlowOn { cr }),
        SessionFrame::FlowControlOff { cr } => Some(SessionEvent::RecvFlowOff { cr }),
        SessionFrame::NotSupported { command_type } => {
            warn!("peer rejected command type {:#04x}", command_type);
            None
        }
    }
}

fn dlc_event_from_frame(frame: ChannelFrame) -> DlcEvent {
    match frame {
        ChannelFrame::Sabm => DlcEvent::RecvSabm,
        ChannelFrame::Ua => DlcEvent::RecvUa,
        ChannelFrame::Dm => DlcEvent::RecvDm,
        ChannelFrame::Disc => DlcEvent::RecvDisc,
        ChannelFrame::Data { payload, credits } => DlcEvent::RecvData { payload, credits },
        ChannelFrame::ParameterNegotiation { cr, params } => DlcEvent::RecvPn { cr, params },
        ChannelFrame::ModemStatus {
            cr,
            signals,
            break_signal,
        } => DlcEvent::RecvMsc {
            cr,
            signals,
            break_signal,
        },
        ChannelFrame::PortNegotiation { cr, config } => DlcEvent::RecvRpn { cr, config },
        ChannelFrame::LineStatus { cr, status } => DlcEvent::RecvRls { cr, status },
    }
}

//! Tests for the RFCOMM engine
//!
//! Two engines are wired back-to-back through a recording transport
//! shim: every outbound shim action of one engine is replayed into the
//! other, and security checks are granted as they appear. Edge cases
//! that need precise interleaving (collisions, timeouts) drive a single
//! engine with scripted transport events instead.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::channel::ChannelState;
use crate::engine::RfcommEngine;
use crate::error::RfcommError;
use crate::frame;
use crate::security::{SecurityCheck, SecurityDelegate};
use crate::session::SessionState;
use crate::transport::{DisconnectReason, L2capShim, TransportId};
use crate::types::{
    BdAddr, ChannelEvent, ChannelEventCallback, Dlci, EventMask, Role, Scn, MAX_QUEUE_COUNT,
};

const ADDR_A: BdAddr = BdAddr([0x00, 0x1B, 0xDC, 0x07, 0x31, 0x88]);
const ADDR_B: BdAddr = BdAddr([0x00, 0x1B, 0xDC, 0x07, 0x31, 0x99]);

#[derive(Debug, Clone)]
enum ShimAction {
    Connect { id: TransportId },
    ConnectResponse { id: TransportId, accept: bool },
    ConfigRequest { id: TransportId, mtu: u16 },
    ConfigResponse { id: TransportId, accept: bool },
    Send { id: TransportId, frame: Vec<u8> },
    Disconnect { id: TransportId },
}

struct RecordingShim {
    next_id: TransportId,
    actions: Arc<Mutex<Vec<ShimAction>>>,
}

impl L2capShim for RecordingShim {
    fn connect(&mut self, _addr: BdAddr) -> Result<TransportId, RfcommError> {
        let id = self.next_id;
        self.next_id += 1;
        self.actions.lock().unwrap().push(ShimAction::Connect { id });
        Ok(id)
    }

    fn connect_response(&mut self, id: TransportId, accept: bool) {
        self.actions
            .lock()
            .unwrap()
            .push(ShimAction::ConnectResponse { id, accept });
    }

    fn config_request(&mut self, id: TransportId, mtu: u16) {
        self.actions
            .lock()
            .unwrap()
            .push(ShimAction::ConfigRequest { id, mtu });
    }

    fn config_response(&mut self, id: TransportId, accept: bool) {
        self.actions
            .lock()
            .unwrap()
            .push(ShimAction::ConfigResponse { id, accept });
    }

    fn send(&mut self, id: TransportId, frame: Vec<u8>) {
        self.actions
            .lock()
            .unwrap()
            .push(ShimAction::Send { id, frame });
    }

    fn disconnect(&mut self, id: TransportId) {
        self.actions.lock().unwrap().push(ShimAction::Disconnect { id });
    }
}

struct RecordingSecurity {
    requests: Arc<Mutex<Vec<SecurityCheck>>>,
}

impl SecurityDelegate for RecordingSecurity {
    fn request_access(&mut self, check: SecurityCheck) {
        self.requests.lock().unwrap().push(check);
    }
}

fn event_recorder() -> (ChannelEventCallback, Arc<Mutex<Vec<ChannelEvent>>>) {
    let events: Arc<Mutex<Vec<ChannelEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: ChannelEventCallback =
        Arc::new(Mutex::new(move |event| sink.lock().unwrap().push(event)));
    (callback, events)
}

/// One engine with visibility into its shim actions and security
/// requests.
struct Peer {
    engine: RfcommEngine,
    addr: BdAddr,
    actions: Arc<Mutex<Vec<ShimAction>>>,
    security: Arc<Mutex<Vec<SecurityCheck>>>,
}

impl Peer {
    fn new(addr: BdAddr, id_base: TransportId) -> Self {
        let actions: Arc<Mutex<Vec<ShimAction>>> = Arc::new(Mutex::new(Vec::new()));
        let security: Arc<Mutex<Vec<SecurityCheck>>> = Arc::new(Mutex::new(Vec::new()));
        let shim = RecordingShim {
            next_id: id_base,
            actions: actions.clone(),
        };
        let delegate = RecordingSecurity {
            requests: security.clone(),
        };
        Self {
            engine: RfcommEngine::new(Box::new(shim), Box::new(delegate)),
            addr,
            actions,
            security,
        }
    }

    fn drain_actions(&self) -> Vec<ShimAction> {
        self.actions.lock().unwrap().drain(..).collect()
    }

    fn drain_security(&self) -> Vec<SecurityCheck> {
        self.security.lock().unwrap().drain(..).collect()
    }

    /// Grants every outstanding security check.
    fn grant_security(&mut self) -> bool {
        let checks = self.drain_security();
        let granted = !checks.is_empty();
        for check in checks {
            self.engine.security_result(check, true);
        }
        granted
    }
}

/// Two engines with their transports cross-wired.
struct Pair {
    a: Peer,
    b: Peer,
}

impl Pair {
    fn new() -> Self {
        Self {
            a: Peer::new(ADDR_A, 0x0040),
            b: Peer::new(ADDR_B, 0x0080),
        }
    }

    /// Replays shim actions and security grants until both engines are
    /// quiescent.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            progressed |= Self::step(&mut self.a, &mut self.b);
            progressed |= Self::step(&mut self.b, &mut self.a);
            if !progressed {
                break;
            }
        }
    }

    fn step(from: &mut Peer, to: &mut Peer) -> bool {
        let mut acted = from.grant_security();
        for action in from.drain_actions() {
            acted = true;
            match action {
                ShimAction::Connect { id } => {
                    to.engine.transport_connect_requested(from.addr, id);
                    from.engine.transport_connect_result(id, true);
                }
                ShimAction::ConnectResponse { id, accept } => {
                    to.engine.transport_connect_response(id, accept);
                }
                ShimAction::ConfigRequest { id, mtu } => {
                    to.engine.transport_config_request(id, mtu);
                }
                ShimAction::ConfigResponse { id, accept } => {
                    to.engine.transport_config_response(id, accept);
                }
                ShimAction::Send { id, frame } => {
                    to.engine.transport_data(id, &frame);
                }
                ShimAction::Disconnect { id } => {
                    to.engine.transport_disconnect_requested(id);
                }
            }
        }
        acted
    }
}

fn find_incoming_handle(events: &Arc<Mutex<Vec<ChannelEvent>>>) -> Option<u8> {
    events.lock().unwrap().iter().find_map(|event| match event {
        ChannelEvent::ConnectIncoming { handle, .. } => Some(*handle),
        _ => None,
    })
}

fn find_connect_success(events: &Arc<Mutex<Vec<ChannelEvent>>>) -> Option<(u8, u16, u16)> {
    events.lock().unwrap().iter().find_map(|event| match event {
        ChannelEvent::ConnectSuccess {
            handle,
            send_mtu,
            recv_mtu,
        } => Some((*handle, *send_mtu, *recv_mtu)),
        _ => None,
    })
}

/// Establishes one channel from A to a server on B and returns both
/// handles plus both event logs.
#[allow(clippy::type_complexity)]
fn establish(
    pair: &mut Pair,
    scn: Scn,
    client_mtu: u16,
    server_mtu: u16,
) -> (
    u8,
    u8,
    Arc<Mutex<Vec<ChannelEvent>>>,
    Arc<Mutex<Vec<ChannelEvent>>>,
) {
    let (server_cb, b_events) = event_recorder();
    pair.b
        .engine
        .register_server(scn, server_mtu, EventMask::all(), server_cb)
        .unwrap();

    let (client_cb, a_events) = event_recorder();
    let ha = pair
        .a
        .engine
        .connect(ADDR_B, scn, client_mtu, EventMask::all(), client_cb)
        .unwrap();
    pair.pump();

    let hb = find_incoming_handle(&b_events).expect("no incoming connection on B");
    pair.b.engine.accept_connection(hb).unwrap();
    pair.pump();

    (ha, hb, a_events, b_events)
}

#[test]
fn test_connect_accept_establishes_channel() {
    let mut pair = Pair::new();
    let scn = Scn::new(5).unwrap();
    let (ha, hb, a_events, b_events) = establish(&mut pair, scn, 127, 200);

    let (handle_a, send_a, recv_a) =
        find_connect_success(&a_events).expect("no ConnectSuccess on A");
    let (handle_b, send_b, recv_b) =
        find_connect_success(&b_events).expect("no ConnectSuccess on B");
    assert_eq!(handle_a, ha);
    assert_eq!(handle_b, hb);

    // Negotiated MTUs never exceed the smaller of the two offers.
    let bound = 127u16.min(200);
    assert!(send_a <= bound && recv_a <= bound);
    assert!(send_b <= bound && recv_b <= bound);

    // Exactly one session per peer address on each side.
    assert_eq!(pair.a.engine.sessions.len(), 1);
    assert_eq!(pair.b.engine.sessions.len(), 1);

    // A initiated: its channel carries the even DLCI for the SCN.
    let session_a = pair.a.engine.sessions.get(&ADDR_B).unwrap();
    assert!(session_a.is_initiator);
    assert!(session_a.channels.contains_key(&Dlci::new(10).unwrap()));
}

#[test]
fn test_credit_flow_scenario() {
    let mut pair = Pair::new();
    let scn = Scn::new(3).unwrap();
    let (ha, hb, _a_events, b_events) = establish(&mut pair, scn, 127, 127);

    // Both sides negotiated credit flow with an initial grant of 7.
    let session_a = pair.a.engine.sessions.get(&ADDR_B).unwrap();
    assert_eq!(
        session_a.flow_mode,
        crate::types::FlowControlMode::CreditBased
    );

    let payload = b"12345678".to_vec();
    pair.a.engine.write(ha, payload.clone()).unwrap();

    // The write consumed exactly one credit: 7 -> 6.
    let channel_a = pair
        .a
        .engine
        .sessions
        .get(&ADDR_B)
        .unwrap()
        .channels
        .get(&Dlci::new(6).unwrap())
        .unwrap();
    assert_eq!(channel_a.peer_credit, 6);

    pair.pump();
    assert!(b_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::DataReceived { .. })));

    assert_eq!(pair.b.engine.read(hb).unwrap(), payload);
    assert_eq!(pair.b.engine.read(hb), Err(RfcommError::NoData));

    // Reading replenishes the peer's window with fresh credits.
    pair.pump();
    let channel_a = pair
        .a
        .engine
        .sessions
        .get(&ADDR_B)
        .unwrap()
        .channels
        .get(&Dlci::new(6).unwrap())
        .unwrap();
    assert!(channel_a.peer_credit > 6);
}

#[test]
fn test_write_rejects_oversized_packet() {
    let mut pair = Pair::new();
    let scn = Scn::new(4).unwrap();
    let (ha, _hb, a_events, _b_events) = establish(&mut pair, scn, 64, 64);

    let (_, send_mtu, _) = find_connect_success(&a_events).unwrap();
    let oversized = vec![0u8; send_mtu as usize + 1];
    assert_eq!(pair.a.engine.write(ha, oversized), Err(RfcommError::Overrun));
}

#[test]
fn test_send_queue_bound() {
    let mut pair = Pair::new();
    let scn = Scn::new(6).unwrap();
    let (ha, _hb, a_events, _b_events) = establish(&mut pair, scn, 127, 127);

    // Starve the channel of credits so every write is buffered.
    let dlci = Dlci::new(12).unwrap();
    {
        let session = pair.a.engine.sessions.get_mut(&ADDR_B).unwrap();
        session.channels.get_mut(&dlci).unwrap().peer_credit = 0;
    }

    for _ in 0..MAX_QUEUE_COUNT {
        pair.a.engine.write(ha, vec![0xAB]).unwrap();
    }
    assert_eq!(
        pair.a.engine.write(ha, vec![0xAB]),
        Err(RfcommError::QueueFull)
    );
    // The refused write left the queue untouched.
    let session = pair.a.engine.sessions.get(&ADDR_B).unwrap();
    assert_eq!(session.channels[&dlci].send_queue.len(), MAX_QUEUE_COUNT);

    // Granting credits drains the queue and raises FlowOn.
    let grant = frame::encode_data(Role::Responder, dlci, &[], Some(7));
    let id = *pair.a.engine.transports.keys().next().unwrap();
    pair.a.engine.transport_data(id, &grant);
    pair.pump();

    let session = pair.a.engine.sessions.get(&ADDR_B).unwrap();
    assert!(session.channels[&dlci].send_queue.len() < MAX_QUEUE_COUNT);
    assert!(a_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::FlowOn { .. })));
}

#[test]
fn test_disconnect_tears_down_idle_session() {
    let mut pair = Pair::new();
    let scn = Scn::new(7).unwrap();
    let (ha, _hb, a_events, b_events) = establish(&mut pair, scn, 127, 127);

    pair.a.engine.disconnect(ha).unwrap();
    pair.pump();

    assert!(a_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::DisconnectSuccess { .. })));
    assert!(b_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::Disconnected { .. })));

    // The channel-less sessions closed their multiplexers and freed
    // themselves on both sides.
    assert!(pair.a.engine.sessions.is_empty());
    assert!(pair.b.engine.sessions.is_empty());

    // The handle is gone.
    assert_eq!(
        pair.a.engine.read(ha),
        Err(RfcommError::InvalidParameter(format!(
            "unknown handle {}",
            ha
        )))
    );
}

#[test]
fn test_incoming_channel_on_initiated_session() {
    let mut pair = Pair::new();

    // A's client channel to B establishes the session with A as
    // initiator.
    let first = Scn::new(9).unwrap();
    let (_ha, _hb, _a_events, _b_events) = establish(&mut pair, first, 127, 127);

    // Now B dials a server on A over the same session. B is the session
    // responder, so its channel for SCN 5 uses DLCI 11.
    let scn = Scn::new(5).unwrap();
    let (server_cb, a_events) = event_recorder();
    pair.a
        .engine
        .register_server(scn, 200, EventMask::all(), server_cb)
        .unwrap();

    let (client_cb, b_events) = event_recorder();
    pair.b
        .engine
        .connect(ADDR_A, scn, 127, EventMask::all(), client_cb)
        .unwrap();
    pair.pump();

    let incoming = a_events
        .lock()
        .unwrap()
        .iter()
        .find_map(|event| match event {
            ChannelEvent::ConnectIncoming { handle, addr, scn } => Some((*handle, *addr, *scn)),
            _ => None,
        })
        .expect("no incoming connection on A");
    assert_eq!(incoming.1, ADDR_B);
    assert_eq!(incoming.2, scn);

    // The new channel rides the existing session under DLCI 11.
    let session_a = pair.a.engine.sessions.get(&ADDR_B).unwrap();
    let channel = session_a.channels.get(&Dlci::new(11).unwrap()).unwrap();
    assert_eq!(channel.scn, scn);
    assert!(channel.is_server);

    pair.a.engine.accept_connection(incoming.0).unwrap();
    pair.pump();

    assert!(find_connect_success(&a_events).is_some());
    assert!(find_connect_success(&b_events).is_some());
    let session_a = pair.a.engine.sessions.get(&ADDR_B).unwrap();
    assert_eq!(
        session_a.channels[&Dlci::new(11).unwrap()].state,
        ChannelState::Connected
    );
    // Still one session per peer.
    assert_eq!(pair.a.engine.sessions.len(), 1);
    assert_eq!(pair.b.engine.sessions.len(), 1);
}

#[test]
fn test_connect_collision_resolves_to_single_session() {
    let mut peer = Peer::new(ADDR_A, 0x0040);
    let scn = Scn::new(3).unwrap();
    let (callback, events) = event_recorder();

    // Our own connect goes out first.
    peer.engine
        .connect(ADDR_B, scn, 127, EventMask::all(), callback)
        .unwrap();
    assert!(peer.grant_security());
    let actions = peer.drain_actions();
    let our_id = match actions.as_slice() {
        [ShimAction::Connect { id }] => *id,
        other => panic!("expected connect, got {:?}", other),
    };

    // The peer's connect request lands while ours is in flight.
    let peer_id = 0x0099;
    peer.engine.transport_connect_requested(ADDR_B, peer_id);
    assert_eq!(peer.engine.sessions.len(), 1);

    // Our attempt resolving accepts the parked request instead.
    peer.engine.transport_connect_result(our_id, true);
    assert!(peer.grant_security());
    let actions = peer.drain_actions();
    assert!(actions
        .iter()
        .any(|action| matches!(action, ShimAction::Disconnect { id } if *id == our_id)));
    assert!(actions.iter().any(
        |action| matches!(action, ShimAction::ConnectResponse { id, accept: true } if *id == peer_id)
    ));

    // Transport configuration completes on the accepted connection.
    peer.engine.transport_config_request(peer_id, 672);
    peer.engine.transport_config_response(peer_id, true);
    let session = peer.engine.sessions.get(&ADDR_B).unwrap();
    assert_eq!(session.state, SessionState::WaitSabm0);
    assert!(!session.is_initiator);

    // The peer starts the multiplexer; we answer and open our pending
    // channel, whose DLCI flipped to the responder direction.
    let sabm0 = frame::encode_sabm(Role::Initiator, Dlci::MUX_CONTROL);
    peer.engine.transport_data(peer_id, &sabm0);

    assert_eq!(peer.engine.sessions.len(), 1);
    let session = peer.engine.sessions.get(&ADDR_B).unwrap();
    assert_eq!(session.state, SessionState::Connected);
    let channel = session.channels.get(&Dlci::new(7).unwrap()).unwrap();
    assert_eq!(channel.state, ChannelState::WaitPnRsp);

    // UA0 and the PN command went out.
    let actions = peer.drain_actions();
    let frames: Vec<&Vec<u8>> = actions
        .iter()
        .filter_map(|action| match action {
            ShimAction::Send { id, frame } if *id == peer_id => Some(frame),
            _ => None,
        })
        .collect();
    assert!(frames.len() >= 2);
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn test_session_open_timeout_fails_channels() {
    let mut peer = Peer::new(ADDR_A, 0x0040);
    let scn = Scn::new(2).unwrap();
    let (callback, events) = event_recorder();

    peer.engine
        .connect(ADDR_B, scn, 127, EventMask::all(), callback)
        .unwrap();
    assert!(peer.grant_security());
    let our_id = match peer.drain_actions().as_slice() {
        [ShimAction::Connect { id }] => *id,
        other => panic!("expected connect, got {:?}", other),
    };
    peer.engine.transport_connect_result(our_id, true);
    peer.engine.transport_connect_response(our_id, true);
    peer.engine.transport_config_request(our_id, 672);
    peer.engine.transport_config_response(our_id, true);
    let session = peer.engine.sessions.get(&ADDR_B).unwrap();
    assert_eq!(session.state, SessionState::Sabm0ReqWaitUa0);

    // No UA0 ever arrives.
    peer.engine
        .process_timeouts_at(Instant::now() + Duration::from_secs(61));

    assert!(peer.engine.sessions.is_empty());
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::ConnectFail { .. })));
}

#[test]
fn test_link_loss_notifies_channels() {
    let mut pair = Pair::new();
    let scn = Scn::new(8).unwrap();
    let (_ha, _hb, a_events, _b_events) = establish(&mut pair, scn, 127, 127);

    let id = *pair.a.engine.transports.keys().next().unwrap();
    pair.a
        .engine
        .transport_disconnected(id, DisconnectReason::LinkLoss);

    assert!(pair.a.engine.sessions.is_empty());
    assert!(a_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::Disconnected { .. })));
}

#[test]
fn test_connect_duplicate_channel_rejected() {
    let mut peer = Peer::new(ADDR_A, 0x0040);
    let scn = Scn::new(3).unwrap();
    let (callback, _events) = event_recorder();
    peer.engine
        .connect(ADDR_B, scn, 127, EventMask::all(), callback)
        .unwrap();

    let (callback, _events) = event_recorder();
    assert_eq!(
        peer.engine
            .connect(ADDR_B, scn, 127, EventMask::all(), callback),
        Err(RfcommError::AlreadyExists)
    );
}

#[test]
fn test_api_rejects_unknown_handle() {
    let mut peer = Peer::new(ADDR_A, 0x0040);
    assert!(matches!(
        peer.engine.read(42),
        Err(RfcommError::InvalidParameter(_))
    ));
    assert!(matches!(
        peer.engine.write(42, vec![1]),
        Err(RfcommError::InvalidParameter(_))
    ));
    assert!(matches!(
        peer.engine.disconnect(42),
        Err(RfcommError::InvalidParameter(_))
    ));
    assert!(matches!(
        peer.engine.get_port_state(42),
        Err(RfcommError::InvalidParameter(_))
    ));
}

#[test]
fn test_port_state_counts_traffic() {
    let mut pair = Pair::new();
    let scn = Scn::new(11).unwrap();
    let (ha, hb, _a_events, _b_events) = establish(&mut pair, scn, 127, 127);

    pair.a.engine.write(ha, vec![0x55; 16]).unwrap();
    pair.pump();
    pair.b.engine.read(hb).unwrap();

    assert_eq!(pair.a.engine.get_port_state(ha).unwrap().transmitted_bytes, 16);
    assert_eq!(pair.b.engine.get_port_state(hb).unwrap().received_bytes, 16);
}

#[test]
fn test_modem_status_and_port_config_roundtrip() {
    let mut pair = Pair::new();
    let scn = Scn::new(12).unwrap();
    let (ha, _hb, _a_events, b_events) = establish(&mut pair, scn, 127, 127);

    pair.a
        .engine
        .set_modem_status(ha, crate::types::ModemSignals::default(), Some(2))
        .unwrap();
    pair.pump();
    assert!(b_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(
            event,
            ChannelEvent::ModemStatus {
                break_signal: Some(2),
                ..
            }
        )));

    let mut config = crate::types::PortConfig::default();
    config.baud_rate = 0x07;
    pair.a.engine.set_port_config(ha, config).unwrap();
    pair.pump();
    assert!(b_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(
            event,
            ChannelEvent::RemotePortConfig { config, .. } if config.baud_rate == 0x07
        )));

    pair.a
        .engine
        .send_remote_line_status(ha, crate::types::LineStatus::OverrunError)
        .unwrap();
    pair.pump();
    assert!(b_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(
            event,
            ChannelEvent::RemoteLineStatus {
                status: crate::types::LineStatus::OverrunError,
                ..
            }
        )));
}

#[test]
fn test_reject_connection_sends_dm() {
    let mut pair = Pair::new();
    let scn = Scn::new(14).unwrap();

    let (server_cb, b_events) = event_recorder();
    pair.b
        .engine
        .register_server(scn, 127, EventMask::all(), server_cb)
        .unwrap();

    let (client_cb, a_events) = event_recorder();
    pair.a
        .engine
        .connect(ADDR_B, scn, 127, EventMask::all(), client_cb)
        .unwrap();
    pair.pump();

    let hb = find_incoming_handle(&b_events).expect("no incoming connection");
    pair.b.engine.reject_connection(hb).unwrap();
    pair.pump();

    // The client observes a connect failure, and both sides clean up the
    // now channel-less sessions.
    assert!(a_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::ConnectFail { .. })));
    assert!(pair.a.engine.sessions.is_empty());
    assert!(pair.b.engine.sessions.is_empty());
}

#[test]
fn test_shutdown_closes_sessions() {
    let mut pair = Pair::new();
    let scn = Scn::new(10).unwrap();
    let (_ha, _hb, a_events, b_events) = establish(&mut pair, scn, 127, 127);

    pair.a.engine.shutdown();

    // Channel owners hear about it immediately; the multiplexer close
    // completes once the peer acknowledges DISC0.
    assert!(a_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::Disconnected { .. })));
    pair.pump();
    assert!(pair.a.engine.sessions.is_empty());
    assert!(pair.b.engine.sessions.is_empty());
    assert!(b_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::Disconnected { .. })));
}

#[test]
fn test_unregistered_scn_refused_with_dm() {
    let mut pair = Pair::new();
    let scn = Scn::new(15).unwrap();

    let (client_cb, a_events) = event_recorder();
    pair.a
        .engine
        .connect(ADDR_B, scn, 127, EventMask::all(), client_cb)
        .unwrap();
    pair.pump();

    // B has no server on 15: the PN command is answered with DM and the
    // client fails.
    assert!(a_events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, ChannelEvent::ConnectFail { .. })));
    assert!(pair.a.engine.sessions.is_empty());
}

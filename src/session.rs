//! Authenticated device sessions.
//!
//! Commands are only honored inside an open session, established with a
//! four step seed/key exchange and kept alive by heartbeats:
//!
//! ```text
//! Closed --request seed--> SeedRequested --seed response--> KeyTransmitted
//!        <--idle timeout-- Open <--------key accepted-------^
//! ```
//!
//! Handshake steps run on the caller thread and block on a condition
//! variable that the transport reader signals when the matching RESPONSE
//! arrives; each step waits at most [`HANDSHAKE_STEP_TIMEOUT`]. The session
//! stays valid only while the device records this controller as its owner,
//! so a failed open simply surfaces to the caller, which may retry.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};
use thiserror::Error;

use crate::err::ProtocolCode;
use crate::message::{IdsMessage, MessageType};
use crate::transport::{Transport, TransportError};

/// REQUEST code opening the handshake.
pub const MSG_REQUEST_SEED: u8 = 0x42;

/// REQUEST code carrying the encrypted seed back to the device.
pub const MSG_TRANSMIT_KEY: u8 = 0x43;

/// REQUEST code keeping an open session alive.
pub const MSG_HEARTBEAT: u8 = 0x44;

/// REQUEST code ending a session.
pub const MSG_END_SESSION: u8 = 0x45;

pub const DEFAULT_SESSION_ID: u16 = 4;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Role constant of a remote control participant. Devices derive the same
/// key from the seed, so any other value is rejected as "key not correct".
const SESSION_CYPHER: u32 = 2_976_579_765;

const KEY_SCHEDULE_DELTA: u32 = 2_654_435_769;

/// Derives the session key from a seed.
///
/// The cipher is fixed and deliberately weak; it only has to match what
/// the deployed devices compute. All arithmetic wraps at 32 bits.
pub fn encrypt(seed: u32) -> u32 {
    let mut s = seed;
    let mut n = SESSION_CYPHER;
    let mut k = KEY_SCHEDULE_DELTA;
    for _ in 0..32 {
        s = s.wrapping_add(
            (n << 4).wrapping_add(1_131_376_761)
                ^ n.wrapping_add(k)
                ^ (n >> 5).wrapping_add(1_919_510_376),
        );
        n = n.wrapping_add(
            (s << 4).wrapping_add(1_948_272_964)
                ^ s.wrapping_add(k)
                ^ (s >> 5).wrapping_add(1_400_073_827),
        );
        k = k.wrapping_add(KEY_SCHEDULE_DELTA);
    }
    s
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    SeedRequested,
    KeyTransmitted,
    Open,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Device rejected the session: {0}.")]
    Rejected(ProtocolCode),
    #[error("Timed out waiting for the {0} response.")]
    HandshakeTimeout(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct SessionInner {
    state: SessionState,
    seed: Option<u32>,
    error: Option<ProtocolCode>,
    last_activity: Instant,
}

/// Session state machine for one target device.
pub struct SessionManager {
    local: u8,
    target: u8,
    session_id: u16,
    idle_timeout: Duration,
    transport: Arc<dyn Transport>,
    // serializes handshakes so at most one is outstanding per target
    handshake: Mutex<()>,
    inner: Mutex<SessionInner>,
    cond: Condvar,
}

impl SessionManager {
    pub fn new(local: u8, target: u8, transport: Arc<dyn Transport>) -> SessionManager {
        Self::with_idle_timeout(local, target, transport, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        local: u8,
        target: u8,
        transport: Arc<dyn Transport>,
        idle_timeout: Duration,
    ) -> SessionManager {
        SessionManager {
            local,
            target,
            session_id: DEFAULT_SESSION_ID,
            idle_timeout,
            transport,
            handshake: Mutex::new(()),
            inner: Mutex::new(SessionInner {
                state: SessionState::Closed,
                seed: None,
                error: None,
                last_activity: Instant::now(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state == SessionState::Open
    }

    /// Opens the session unless it already is open.
    pub fn ensure_open(&self) -> Result<(), SessionError> {
        let _guard = self.handshake.lock().unwrap();
        if self.inner.lock().unwrap().state == SessionState::Open {
            return Ok(());
        }
        let result = self.open();
        if result.is_err() {
            self.inner.lock().unwrap().state = SessionState::Closed;
        }
        result
    }

    fn open(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = SessionState::SeedRequested;
            inner.seed = None;
            inner.error = None;
        }
        let mut sid = [0u8; 2];
        BigEndian::write_u16(&mut sid, self.session_id);
        self.send_request(MSG_REQUEST_SEED, &sid)?;

        let seed = self.await_seed()?;
        let key = encrypt(seed);
        debug!(
            "session {} -> {}: seed received, transmitting key",
            self.local, self.target
        );

        self.inner.lock().unwrap().state = SessionState::KeyTransmitted;
        let mut payload = [0u8; 6];
        BigEndian::write_u16(&mut payload[0..2], self.session_id);
        BigEndian::write_u32(&mut payload[2..6], key);
        self.send_request(MSG_TRANSMIT_KEY, &payload)?;

        self.await_open()
    }

    fn await_seed(&self) -> Result<u32, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        while inner.seed.is_none() && inner.state == SessionState::SeedRequested {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        match inner.seed {
            Some(seed) => Ok(seed),
            None => Err(match inner.error {
                Some(code) => SessionError::Rejected(code),
                None => SessionError::HandshakeTimeout("seed"),
            }),
        }
    }

    fn await_open(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        while inner.state == SessionState::KeyTransmitted {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        match inner.state {
            SessionState::Open => {
                inner.last_activity = Instant::now();
                Ok(())
            }
            _ => Err(match inner.error {
                Some(code) => SessionError::Rejected(code),
                None => SessionError::HandshakeTimeout("key"),
            }),
        }
    }

    /// Feed of RESPONSE messages from this session's target, called on the
    /// transport reader thread. Messages that do not fit the current state
    /// are dropped.
    pub fn handle_response(&self, msg: &IdsMessage) {
        let payload = msg.payload();
        let mut inner = self.inner.lock().unwrap();
        match msg.msg_data() {
            MSG_REQUEST_SEED => {
                if inner.state != SessionState::SeedRequested {
                    trace!("unexpected seed response from {}", self.target);
                    return;
                }
                if payload.len() < 6 {
                    warn!("short seed response from {}: {}", self.target, hex::encode(payload));
                    return;
                }
                if BigEndian::read_u16(&payload[0..2]) != self.session_id {
                    trace!("seed response for a foreign session id");
                    return;
                }
                inner.seed = Some(BigEndian::read_u32(&payload[2..6]));
                self.cond.notify_all();
            }
            MSG_TRANSMIT_KEY => {
                if inner.state != SessionState::KeyTransmitted {
                    trace!("unexpected key response from {}", self.target);
                    return;
                }
                if payload.len() < 2 || BigEndian::read_u16(&payload[0..2]) != self.session_id {
                    return;
                }
                if payload.len() > 2 && payload[2] != 0 {
                    let code = ProtocolCode::from_raw(payload[2]);
                    debug!("session {} -> {} refused: {}", self.local, self.target, code);
                    inner.error = Some(code);
                    inner.state = SessionState::Closed;
                } else {
                    inner.state = SessionState::Open;
                    inner.last_activity = Instant::now();
                }
                self.cond.notify_all();
            }
            MSG_HEARTBEAT => {
                if payload.len() > 2 && payload[2] != 0 {
                    let code = ProtocolCode::from_raw(payload[2]);
                    debug!("session {} -> {} dropped by device: {}", self.local, self.target, code);
                    inner.state = SessionState::Closed;
                } else if inner.state == SessionState::Open {
                    inner.last_activity = Instant::now();
                }
            }
            other => trace!("ignoring response {:#04x} from {}", other, self.target),
        }
    }

    /// Periodic maintenance: expire an idle session, otherwise keep it
    /// alive with a heartbeat. Runs on a timer thread about once a second.
    pub fn tick(&self) {
        let heartbeat = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Open {
                return;
            }
            if inner.last_activity.elapsed() > self.idle_timeout {
                debug!("session {} -> {} idle, closing", self.local, self.target);
                inner.state = SessionState::Closed;
                false
            } else {
                true
            }
        };
        if heartbeat {
            let mut sid = [0u8; 2];
            BigEndian::write_u16(&mut sid, self.session_id);
            if let Err(e) = self.send_request(MSG_HEARTBEAT, &sid) {
                debug!("heartbeat to {} failed: {}", self.target, e);
            }
        }
    }

    /// Refreshes the activity clock; called for every command sent to and
    /// every status received from the target.
    pub fn touch(&self) {
        self.inner.lock().unwrap().last_activity = Instant::now();
    }

    /// Ends the session. The goodbye request is best effort; the local
    /// state transitions to Closed regardless.
    pub fn close(&self) {
        let was_open = {
            let mut inner = self.inner.lock().unwrap();
            let was_open = inner.state == SessionState::Open;
            inner.state = SessionState::Closed;
            was_open
        };
        if was_open {
            let mut sid = [0u8; 2];
            BigEndian::write_u16(&mut sid, self.session_id);
            if let Err(e) = self.send_request(MSG_END_SESSION, &sid) {
                trace!("session end to {} not delivered: {}", self.target, e);
            }
        }
    }

    fn send_request(&self, code: u8, payload: &[u8]) -> Result<(), TransportError> {
        let msg = IdsMessage::point_to_point(MessageType::Request, self.local, self.target, code, payload)
            .expect("request payloads are at most 6 bytes");
        self.transport.send(&msg.to_frame())
    }
}

/// All sessions of one bridge, keyed by target address. Sessions are
/// created lazily when the first command to a target is issued.
pub struct SessionMap {
    local: u8,
    idle_timeout: Duration,
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<u8, Arc<SessionManager>>>,
}

impl SessionMap {
    pub fn new(local: u8, transport: Arc<dyn Transport>) -> SessionMap {
        Self::with_idle_timeout(local, transport, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        local: u8,
        transport: Arc<dyn Transport>,
        idle_timeout: Duration,
    ) -> SessionMap {
        SessionMap {
            local,
            idle_timeout,
            transport,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, target: u8) -> Arc<SessionManager> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(target)
            .or_insert_with(|| {
                Arc::new(SessionManager::with_idle_timeout(
                    self.local,
                    target,
                    self.transport.clone(),
                    self.idle_timeout,
                ))
            })
            .clone()
    }

    fn existing(&self, target: u8) -> Option<Arc<SessionManager>> {
        self.sessions.lock().unwrap().get(&target).cloned()
    }

    /// Routes a RESPONSE to the session owning its source address.
    pub fn handle_response(&self, msg: &IdsMessage) {
        match self.existing(msg.src()) {
            Some(session) => session.handle_response(msg),
            None => trace!("response from {} without a session", msg.src()),
        }
    }

    /// Marks activity from a target, keeping its session young.
    pub fn touch(&self, target: u8) {
        if let Some(session) = self.existing(target) {
            session.touch();
        }
    }

    pub fn tick_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.tick();
        }
    }

    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTransport;

    fn seed_response(target: u8, local: u8, seed: u32) -> IdsMessage {
        let mut payload = [0u8; 6];
        BigEndian::write_u16(&mut payload[0..2], DEFAULT_SESSION_ID);
        BigEndian::write_u32(&mut payload[2..6], seed);
        IdsMessage::point_to_point(MessageType::Response, target, local, MSG_REQUEST_SEED, &payload)
            .unwrap()
    }

    fn key_response(target: u8, local: u8, error: Option<u8>) -> IdsMessage {
        let mut payload = vec![0u8; 2];
        BigEndian::write_u16(&mut payload[0..2], DEFAULT_SESSION_ID);
        if let Some(code) = error {
            payload.push(code);
        }
        IdsMessage::point_to_point(MessageType::Response, target, local, MSG_TRANSMIT_KEY, &payload)
            .unwrap()
    }

    #[test]
    fn encrypt_is_pure_and_nonzero() {
        assert_eq!(encrypt(0x12345678), encrypt(0x12345678));
        assert_ne!(encrypt(0), 0);
        assert_ne!(encrypt(1), encrypt(2));
    }

    #[test]
    fn handshake_opens_session() {
        let (transport, rx) = MockTransport::pair();
        let session = Arc::new(SessionManager::new(1, 92, transport));

        let responder = {
            let session = session.clone();
            std::thread::spawn(move || {
                let req = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                assert_eq!(req.msg_data(), MSG_REQUEST_SEED);
                assert_eq!(req.payload(), &[0x00, 0x04]);
                session.handle_response(&seed_response(92, 1, 0x12345678));

                let key_msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                assert_eq!(key_msg.msg_data(), MSG_TRANSMIT_KEY);
                let mut expected = [0u8; 6];
                BigEndian::write_u16(&mut expected[0..2], DEFAULT_SESSION_ID);
                BigEndian::write_u32(&mut expected[2..6], encrypt(0x12345678));
                assert_eq!(key_msg.payload(), &expected[..]);
                session.handle_response(&key_response(92, 1, None));
            })
        };

        session.ensure_open().unwrap();
        assert!(session.is_open());
        responder.join().unwrap();
    }

    #[test]
    fn idle_session_expires_on_tick() {
        let (transport, rx) = MockTransport::pair();
        let session = Arc::new(SessionManager::with_idle_timeout(
            1,
            92,
            transport,
            Duration::from_millis(100),
        ));

        let responder = {
            let session = session.clone();
            std::thread::spawn(move || {
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                session.handle_response(&seed_response(92, 1, 0xdeadbeef));
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                session.handle_response(&key_response(92, 1, None));
            })
        };
        session.ensure_open().unwrap();
        responder.join().unwrap();

        std::thread::sleep(Duration::from_millis(150));
        session.tick();
        assert!(!session.is_open());
    }

    #[test]
    fn key_rejection_surfaces_to_caller() {
        let (transport, rx) = MockTransport::pair();
        let session = Arc::new(SessionManager::new(1, 55, transport));

        let responder = {
            let session = session.clone();
            std::thread::spawn(move || {
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                session.handle_response(&seed_response(55, 1, 0x1111));
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                session.handle_response(&key_response(55, 1, Some(0x0d)));
            })
        };

        match session.ensure_open() {
            Err(SessionError::Rejected(ProtocolCode::KeyNotCorrect)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!session.is_open());
        responder.join().unwrap();
    }

    #[test]
    fn heartbeat_error_closes_session() {
        let (transport, rx) = MockTransport::pair();
        let session = Arc::new(SessionManager::new(1, 7, transport));
        let responder = {
            let session = session.clone();
            std::thread::spawn(move || {
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                session.handle_response(&seed_response(7, 1, 0x42));
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                session.handle_response(&key_response(7, 1, None));
            })
        };
        session.ensure_open().unwrap();
        responder.join().unwrap();

        let mut payload = vec![0u8; 2];
        BigEndian::write_u16(&mut payload[0..2], DEFAULT_SESSION_ID);
        payload.push(0x0e);
        let hb =
            IdsMessage::point_to_point(MessageType::Response, 7, 1, MSG_HEARTBEAT, &payload).unwrap();
        session.handle_response(&hb);
        assert!(!session.is_open());
    }

    #[test]
    fn stray_responses_are_dropped() {
        let (transport, _rx) = MockTransport::pair();
        let session = SessionManager::new(1, 9, transport);
        // no handshake in flight; a seed response must not disturb Closed
        session.handle_response(&seed_response(9, 1, 0x1234));
        assert!(!session.is_open());
    }

    #[test]
    fn session_map_routes_by_source() {
        let (transport, rx) = MockTransport::pair();
        let map = Arc::new(SessionMap::new(1, transport));
        let session = map.get_or_create(33);

        let responder = {
            let map = map.clone();
            std::thread::spawn(move || {
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                map.handle_response(&seed_response(33, 1, 0x777));
                let _ = rx.recv_timeout(Duration::from_secs(1)).unwrap();
                map.handle_response(&key_response(33, 1, None));
            })
        };
        session.ensure_open().unwrap();
        assert!(map.get_or_create(33).is_open());
        responder.join().unwrap();
    }
}

//! Session and connection state machine.
//!
//! A [`Connection`] owns the transport and drives the EtherNet/IP handshake:
//!
//! ```text
//! Disconnected --open--> SessionRegistered --forward_open--> ConnectionOpen
//!       ^                                                          |
//!       +------------------------- close (Closing) ----------------+
//! ```
//!
//! Any I/O failure or timeout drops the connection back to `Disconnected`;
//! there is no automatic reconnect.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use crate::command::{
    self, ForwardClose, ForwardOpen, DEFAULT_RPI, LARGE_PAYLOAD_SIZE, SERVICE_FORWARD_CLOSE,
    SERVICE_FORWARD_OPEN, SERVICE_LARGE_FORWARD_OPEN, STANDARD_PAYLOAD_SIZE,
};
use crate::discovery::Identity;
use crate::error::{CipError, Result};
use crate::header::EncapsulationHeader;
use crate::path::{encode_path, Segment, DEFAULT_PORT};
use crate::response::CipReply;
use crate::transport::{TcpTransport, Transport, DEFAULT_TIMEOUT};

/// Vendor id sent in Forward Open requests unless configured otherwise.
pub const DEFAULT_VENDOR_ID: u16 = 0x1337;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, or the socket failed.
    Disconnected,
    /// Socket open and session registered; unconnected messaging only.
    SessionRegistered,
    /// Forward Open succeeded; connected messaging available.
    ConnectionOpen,
    /// Tear-down in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::SessionRegistered => "session registered",
            ConnectionState::ConnectionOpen => "connection open",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Transport-level connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Controller (or gateway) host.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Route from the host to the controller.
    pub route: Vec<Segment>,
    /// Socket timeout.
    pub timeout: Duration,
    /// Request a Large Forward Open first.
    pub large_packets: bool,
    /// Originator vendor id.
    pub vendor_id: u16,
    /// Requested packet interval in microseconds.
    pub rpi: u32,
}

impl ConnectionConfig {
    /// Creates a configuration for `host` with the default port, a backplane
    /// slot 0 route and large packets enabled.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            route: vec![Segment::port(1, 0)],
            timeout: DEFAULT_TIMEOUT,
            large_packets: true,
            vendor_id: DEFAULT_VENDOR_ID,
            rpi: DEFAULT_RPI,
        }
    }
}

/// Something that can carry a Message Router request and return its reply.
///
/// Implemented by [`Connection`]; the symbol uploader and the client are
/// written against this trait.
pub trait MessageChannel {
    /// Sends one Message Router request and returns the parsed reply.
    fn send(&mut self, message: &[u8]) -> Result<CipReply>;

    /// Largest request or reply payload the channel carries.
    fn payload_size(&self) -> usize;
}

/// A session, and optionally a class 3 connection, to one controller.
pub struct Connection<T: Transport = TcpTransport> {
    transport: T,
    config: ConnectionConfig,
    route_path: Vec<u8>,
    state: ConnectionState,
    session: u32,
    o_t_connection_id: u32,
    t_o_connection_id: u32,
    connection_serial: u16,
    originator_serial: u32,
    sequence: u16,
    payload_size: usize,
}

impl<T: Transport> Connection<T> {
    /// Creates a disconnected connection.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Path` if the route cannot be encoded.
    pub fn new(transport: T, config: ConnectionConfig) -> Result<Self> {
        let route_path = encode_path(&config.route, true)?;
        Ok(Self {
            transport,
            config,
            route_path,
            state: ConnectionState::Disconnected,
            session: 0,
            o_t_connection_id: 0,
            t_o_connection_id: 0,
            connection_serial: 0,
            originator_serial: 0,
            sequence: 0,
            payload_size: STANDARD_PAYLOAD_SIZE,
        })
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the session handle (0 when no session is registered).
    pub fn session(&self) -> u32 {
        self.session
    }

    /// Returns the target-assigned O→T connection id.
    pub fn connection_id(&self) -> u32 {
        self.o_t_connection_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connects the transport and registers a session.
    ///
    /// # Errors
    ///
    /// Returns `CipError::NotConnected` unless the connection is disconnected,
    /// or the transport / encapsulation error.
    pub fn open(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(CipError::not_connected(self.state));
        }
        self.transport
            .connect(&self.config.host, self.config.port, self.config.timeout)?;
        let registered = self.exchange(&command::register_session()).and_then(|reply| {
            let header = EncapsulationHeader::from_bytes(&reply)?;
            header.check_status()?;
            Ok(header.session)
        });
        let session = match registered {
            Ok(session) => session,
            // communication failures have already released the transport
            Err(e) if e.is_communication() => return Err(e),
            Err(e) => {
                self.drop_transport();
                return Err(e);
            }
        };
        self.session = session;
        self.state = ConnectionState::SessionRegistered;
        info!(
            "registered session 0x{:08X} with {}:{}",
            self.session, self.config.host, self.config.port
        );
        Ok(())
    }

    /// Opens a class 3 connection to the Message Router.
    ///
    /// With large packets configured, a failed Large Forward Open is retried
    /// exactly once as a standard Forward Open. Communication failures are not
    /// retried.
    pub fn forward_open(&mut self) -> Result<()> {
        self.require(ConnectionState::SessionRegistered)?;
        if self.config.large_packets {
            match self.try_forward_open(true) {
                Err(err) if !err.is_communication() => {
                    warn!("large forward open rejected ({err}), falling back to standard");
                    self.try_forward_open(false)
                }
                other => other,
            }
        } else {
            self.try_forward_open(false)
        }
    }

    fn try_forward_open(&mut self, large: bool) -> Result<()> {
        let request = ForwardOpen {
            large,
            connection_size: if large {
                LARGE_PAYLOAD_SIZE as u32
            } else {
                STANDARD_PAYLOAD_SIZE as u32
            },
            t_o_connection_id: rand::random(),
            connection_serial: rand::random(),
            vendor_id: self.config.vendor_id,
            originator_serial: rand::random(),
            rpi: self.config.rpi,
            route: self.route_path.clone(),
        };
        let reply = self.send_rr(&request.encode()?)?;
        reply.check_service(if large {
            SERVICE_LARGE_FORWARD_OPEN
        } else {
            SERVICE_FORWARD_OPEN
        })?;
        reply.check_error()?;
        let id: [u8; 4] = reply
            .data
            .get(0..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CipError::invalid_response("forward open reply too short"))?;

        self.o_t_connection_id = u32::from_le_bytes(id);
        self.t_o_connection_id = request.t_o_connection_id;
        self.connection_serial = request.connection_serial;
        self.originator_serial = request.originator_serial;
        self.payload_size = request.connection_size as usize;
        self.sequence = 0;
        self.state = ConnectionState::ConnectionOpen;
        debug!(
            "forward open: O->T 0x{:08X}, T->O 0x{:08X}, serial 0x{:04X}, {} byte payload",
            self.o_t_connection_id,
            self.t_o_connection_id,
            self.connection_serial,
            self.payload_size
        );
        Ok(())
    }

    /// Returns the next connected-message sequence number.
    ///
    /// Wraps from 65535 to 1; 0 is never produced.
    pub fn next_sequence(&mut self) -> u16 {
        self.sequence = if self.sequence == u16::MAX {
            1
        } else {
            self.sequence + 1
        };
        self.sequence
    }

    /// Sends a connected request (Send Unit Data).
    pub fn send_connected(&mut self, message: &[u8]) -> Result<CipReply> {
        self.require(ConnectionState::ConnectionOpen)?;
        let sequence = self.next_sequence();
        let frame =
            command::send_unit_data(self.session, self.o_t_connection_id, sequence, message)?;
        let reply = self.exchange(&frame)?;
        CipReply::from_frame(&reply)
    }

    /// Sends an unconnected request (Send RR Data), wrapped in Unconnected Send
    /// when a route is configured.
    pub fn send_unconnected(&mut self, message: &[u8]) -> Result<CipReply> {
        if !matches!(
            self.state,
            ConnectionState::SessionRegistered | ConnectionState::ConnectionOpen
        ) {
            return Err(CipError::not_connected(self.state));
        }
        if self.route_path.is_empty() {
            self.send_rr(message)
        } else {
            let wrapped = command::unconnected_send(message, &self.route_path)?;
            self.send_rr(&wrapped)
        }
    }

    /// Sends List Identity over the session's socket and decodes the reply.
    pub fn list_identity(&mut self) -> Result<Identity> {
        if self.state == ConnectionState::Disconnected {
            return Err(CipError::not_connected(self.state));
        }
        let reply = self.exchange(&command::list_identity())?;
        Identity::from_list_identity_reply(&reply)
    }

    fn send_rr(&mut self, message: &[u8]) -> Result<CipReply> {
        let frame = command::send_rr_data(self.session, message)?;
        let reply = self.exchange(&frame)?;
        CipReply::from_frame(&reply)
    }

    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let result = self
            .transport
            .send(frame)
            .and_then(|_| self.transport.receive());
        match result {
            Err(e) if e.is_communication() => {
                warn!("communication failure, dropping connection: {e}");
                self.drop_transport();
                Err(e)
            }
            other => other,
        }
    }

    fn drop_transport(&mut self) {
        if let Err(e) = self.transport.close() {
            debug!("error closing transport: {e}");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.session = 0;
        self.o_t_connection_id = 0;
        self.t_o_connection_id = 0;
        self.sequence = 0;
        self.payload_size = STANDARD_PAYLOAD_SIZE;
    }

    fn require(&self, state: ConnectionState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(CipError::not_connected(self.state))
        }
    }

    /// Closes the connection and the session, best effort.
    ///
    /// Every step is attempted even if an earlier one fails; the transport is
    /// always released.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Close` listing every step that failed.
    pub fn close(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        let had_session = matches!(
            self.state,
            ConnectionState::SessionRegistered | ConnectionState::ConnectionOpen
        );

        if self.state == ConnectionState::ConnectionOpen {
            self.state = ConnectionState::Closing;
            let request = ForwardClose {
                connection_serial: self.connection_serial,
                vendor_id: self.config.vendor_id,
                originator_serial: self.originator_serial,
                route: self.route_path.clone(),
            };
            let result = request.encode().and_then(|message| self.send_rr(&message));
            match result.and_then(|reply| {
                reply.check_service(SERVICE_FORWARD_CLOSE)?;
                reply.check_error()
            }) {
                Ok(()) => debug!("forward close accepted"),
                Err(e) => {
                    warn!("forward close failed: {e}");
                    errors.push(e);
                }
            }
        }

        // a communication failure during forward close already dropped the session
        if had_session && self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Closing;
            if let Err(e) = self
                .transport
                .send(&command::unregister_session(self.session))
            {
                warn!("unregister session failed: {e}");
                errors.push(e);
            }
        }

        if let Err(e) = self.transport.close() {
            errors.push(e);
        }
        self.reset();
        info!("closed connection to {}", self.config.host);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CipError::Close(errors))
        }
    }
}

impl<T: Transport> MessageChannel for Connection<T> {
    fn send(&mut self, message: &[u8]) -> Result<CipReply> {
        if self.state == ConnectionState::ConnectionOpen {
            self.send_connected(message)
        } else {
            self.send_unconnected(message)
        }
    }

    fn payload_size(&self) -> usize {
        self.payload_size
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("connection_id", &self.o_t_connection_id)
            .field("payload_size", &self.payload_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{register_reply, rr_reply, unit_reply, MockTransport};

    fn open_session() -> (Connection<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        mock.push(register_reply(0x42));
        let mut conn = Connection::new(mock.clone(), ConnectionConfig::new("plc")).unwrap();
        conn.open().unwrap();
        (conn, mock)
    }

    fn forward_open_ok(service: u8) -> Vec<u8> {
        let mut data = 0xAABBCCDDu32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 22]);
        rr_reply(service, 0x00, &[], &data)
    }

    #[test]
    fn test_open_registers_session() {
        let (conn, mock) = open_session();
        assert_eq!(conn.state(), ConnectionState::SessionRegistered);
        assert_eq!(conn.session(), 0x42);
        assert_eq!(mock.sent()[0], command::register_session());
        assert!(mock.state.borrow().connected);
    }

    #[test]
    fn test_open_twice_rejected() {
        let (mut conn, _mock) = open_session();
        assert!(matches!(conn.open(), Err(CipError::NotConnected { .. })));
    }

    #[test]
    fn test_large_forward_open() {
        let (mut conn, mock) = open_session();
        mock.push(forward_open_ok(SERVICE_LARGE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        assert_eq!(conn.state(), ConnectionState::ConnectionOpen);
        assert_eq!(conn.connection_id(), 0xAABBCCDD);
        assert_eq!(conn.payload_size(), LARGE_PAYLOAD_SIZE);
        assert_eq!(mock.sent()[1][40], SERVICE_LARGE_FORWARD_OPEN);
    }

    #[test]
    fn test_forward_open_falls_back_once() {
        let (mut conn, mock) = open_session();
        mock.push(rr_reply(SERVICE_LARGE_FORWARD_OPEN, 0x01, &[0x0109], &[]));
        mock.push(forward_open_ok(SERVICE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        assert_eq!(conn.payload_size(), STANDARD_PAYLOAD_SIZE);
        let sent = mock.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1][40], SERVICE_LARGE_FORWARD_OPEN);
        assert_eq!(sent[2][40], SERVICE_FORWARD_OPEN);
    }

    #[test]
    fn test_forward_open_fallback_failure_is_final() {
        let (mut conn, mock) = open_session();
        mock.push(rr_reply(SERVICE_LARGE_FORWARD_OPEN, 0x01, &[0x0109], &[]));
        mock.push(rr_reply(SERVICE_FORWARD_OPEN, 0x01, &[0x0113], &[]));
        mock.push(forward_open_ok(SERVICE_FORWARD_OPEN));
        let err = conn.forward_open().unwrap_err();
        assert!(err.to_string().contains("Out of connections"));
        assert_eq!(conn.state(), ConnectionState::SessionRegistered);
        assert_eq!(mock.sent().len(), 3);
        assert_eq!(mock.pending(), 1);
    }

    #[test]
    fn test_forward_open_falls_back_on_short_reply() {
        let (mut conn, mock) = open_session();
        mock.push(rr_reply(SERVICE_LARGE_FORWARD_OPEN, 0x00, &[], &[0x01, 0x02]));
        mock.push(forward_open_ok(SERVICE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        assert_eq!(conn.state(), ConnectionState::ConnectionOpen);
        assert_eq!(conn.payload_size(), STANDARD_PAYLOAD_SIZE);
        assert_eq!(mock.sent()[2][40], SERVICE_FORWARD_OPEN);
    }

    #[test]
    fn test_forward_open_timeout_not_retried() {
        let (mut conn, mock) = open_session();
        mock.push_error(CipError::Timeout);
        mock.push(forward_open_ok(SERVICE_FORWARD_OPEN));
        assert!(matches!(conn.forward_open(), Err(CipError::Timeout)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(mock.sent().len(), 2);
        assert_eq!(mock.pending(), 1);
    }

    #[test]
    fn test_open_malformed_register_reply_releases_transport() {
        let mock = MockTransport::new();
        mock.push(vec![0x65, 0x00, 0x04]);
        let mut conn = Connection::new(mock.clone(), ConnectionConfig::new("plc")).unwrap();
        assert!(conn.open().is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!mock.state.borrow().connected);
        assert_eq!(mock.state.borrow().close_calls, 1);
    }

    #[test]
    fn test_standard_forward_open_without_large_packets() {
        let mock = MockTransport::new();
        mock.push(register_reply(1));
        mock.push(forward_open_ok(SERVICE_FORWARD_OPEN));
        let config = ConnectionConfig {
            large_packets: false,
            ..ConnectionConfig::new("plc")
        };
        let mut conn = Connection::new(mock.clone(), config).unwrap();
        conn.open().unwrap();
        conn.forward_open().unwrap();
        assert_eq!(mock.sent()[1][40], SERVICE_FORWARD_OPEN);
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let (mut conn, _mock) = open_session();
        assert_eq!(conn.next_sequence(), 1);
        conn.sequence = u16::MAX - 1;
        assert_eq!(conn.next_sequence(), u16::MAX);
        assert_eq!(conn.next_sequence(), 1);
        assert_eq!(conn.next_sequence(), 2);
    }

    #[test]
    fn test_send_connected_frame() {
        let (mut conn, mock) = open_session();
        mock.push(forward_open_ok(SERVICE_LARGE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        mock.push(unit_reply(0x4C, 0x00, &[], &[0xC4, 0x00, 0x01, 0x00, 0x00, 0x00]));
        let reply = MessageChannel::send(&mut conn, &[0x4C, 0x00]).unwrap();
        assert_eq!(reply.data, [0xC4, 0x00, 0x01, 0x00, 0x00, 0x00]);

        let frame = mock.sent().pop().unwrap();
        assert_eq!(&frame[0..2], [0x70, 0x00]);
        assert_eq!(&frame[36..40], 0xAABBCCDDu32.to_le_bytes());
        assert_eq!(&frame[44..46], [0x01, 0x00]);
    }

    #[test]
    fn test_send_unconnected_wraps_route() {
        let (mut conn, mock) = open_session();
        mock.push(rr_reply(0x52, 0x00, &[], &[]));
        conn.send_unconnected(&[0x01, 0x02, 0x20, 0x01, 0x24, 0x01]).unwrap();
        let frame = mock.sent().pop().unwrap();
        assert_eq!(frame[40], 0x52);
    }

    #[test]
    fn test_timeout_disconnects() {
        let (mut conn, mock) = open_session();
        mock.push(forward_open_ok(SERVICE_LARGE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        mock.push_error(CipError::Timeout);
        assert!(matches!(
            conn.send_connected(&[0x4C, 0x00]),
            Err(CipError::Timeout)
        ));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            conn.send_connected(&[0x4C, 0x00]),
            Err(CipError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_close_clean() {
        let (mut conn, mock) = open_session();
        mock.push(forward_open_ok(SERVICE_LARGE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        mock.push(rr_reply(SERVICE_FORWARD_CLOSE, 0x00, &[], &[]));
        conn.close().unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        let sent = mock.sent();
        assert_eq!(sent[2][40], SERVICE_FORWARD_CLOSE);
        assert_eq!(&sent[3][0..2], [0x66, 0x00]);
        assert_eq!(mock.state.borrow().close_calls, 1);
    }

    #[test]
    fn test_close_collects_errors() {
        let (mut conn, mock) = open_session();
        mock.push(forward_open_ok(SERVICE_LARGE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        mock.push(rr_reply(SERVICE_FORWARD_CLOSE, 0x01, &[0x0107], &[]));
        let err = conn.close().unwrap_err();
        match err {
            CipError::Close(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(matches!(errors[0], CipError::Status { status: 0x01, .. }));
            }
            other => panic!("expected Close, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        // unregister still sent
        assert_eq!(&mock.sent()[3][0..2], [0x66, 0x00]);
        assert!(!mock.state.borrow().connected);
    }

    #[test]
    fn test_close_after_timeout_releases_transport() {
        let (mut conn, mock) = open_session();
        mock.push(forward_open_ok(SERVICE_LARGE_FORWARD_OPEN));
        conn.forward_open().unwrap();
        mock.push_error(CipError::Timeout);
        let err = conn.close().unwrap_err();
        assert!(matches!(err, CipError::Close(ref e) if matches!(e[0], CipError::Timeout)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(mock.sent().len(), 3);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::ConnectionOpen.to_string(), "connection open");
        let err = CipError::not_connected(ConnectionState::Disconnected);
        assert_eq!(err.to_string(), "not connected (state: disconnected)");
    }
}

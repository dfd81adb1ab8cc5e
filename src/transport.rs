//! TCP transport layer for EtherNet/IP communication.
//!
//! This module provides the [`Transport`] trait and the blocking [`TcpTransport`]
//! implementation. The transport layer only knows about sockets and frames: it
//! reads the 24-byte encapsulation header, then exactly the number of data bytes
//! that header declares, and hands the whole frame up. Everything CIP lives in
//! the layers above.
//!
//! # Constants
//!
//! - [`DEFAULT_TIMEOUT`] - Default socket timeout (5 seconds)
//!
//! # Example
//!
//! The transport is normally driven by [`LogixClient`](crate::LogixClient), but it
//! can be used directly:
//!
//! ```no_run
//! use logix_cip::{TcpTransport, Transport};
//! use std::time::Duration;
//!
//! let mut transport = TcpTransport::new();
//! transport.connect("192.168.1.10", 44818, Duration::from_secs(5)).unwrap();
//! let frame = vec![0x65, 0x00, 0x04, 0x00 /* ... */];
//! transport.send(&frame).unwrap();
//! let reply = transport.receive().unwrap();
//! ```

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::error::{CipError, Result};
use crate::header::{EncapsulationHeader, ENCAPSULATION_HEADER_SIZE};

/// Default timeout for socket operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte transport for encapsulation frames.
///
/// Implementations must deliver whole frames from [`receive`](Transport::receive):
/// the 24-byte header followed by exactly the declared data length.
pub trait Transport {
    /// Opens the connection to `host:port`.
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()>;

    /// Sends a frame, returning the number of bytes written.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Receives one complete frame.
    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Releases the connection. Closing twice is not an error.
    fn close(&mut self) -> Result<()>;
}

/// Blocking TCP transport.
#[derive(Default)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    remote_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Creates an unconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the remote address once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| CipError::not_connected("socket closed"))
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    debug!("connected to {addr}");
                    self.stream = Some(stream);
                    self.remote_addr = Some(addr);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => map_io(e),
            None => CipError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {host}"),
            )),
        })
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        stream.write_all(data).map_err(map_io)?;
        Ok(data.len())
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let mut frame = vec![0u8; ENCAPSULATION_HEADER_SIZE];
        stream.read_exact(&mut frame).map_err(map_io)?;
        let header = EncapsulationHeader::from_bytes(&frame)?;
        frame.resize(ENCAPSULATION_HEADER_SIZE + header.length as usize, 0);
        stream
            .read_exact(&mut frame[ENCAPSULATION_HEADER_SIZE..])
            .map_err(map_io)?;
        Ok(frame)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(Shutdown::Both) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(CipError::Io(e)),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote_addr", &self.remote_addr)
            .field(
                "local_addr",
                &self.stream.as_ref().and_then(|s| s.local_addr().ok()),
            )
            .finish()
    }
}

fn map_io(e: io::Error) -> CipError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CipError::Timeout,
        _ => CipError::Io(e),
    }
}

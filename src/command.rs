//! CIP service requests and EtherNet/IP encapsulation framing.
//!
//! Each request type serializes itself to bytes: tag services to Message Router
//! requests, connection services to Connection Manager requests, and the
//! `send_*` helpers wrap a finished message in its encapsulation frame.
//!
//! # Request Types
//!
//! ## Tag Services
//! - [`Service::Read`] - Read Tag (0x4C)
//! - [`Service::ReadFragmented`] - Read Tag Fragmented (0x52)
//! - [`Service::Write`] - Write Tag (0x4D)
//! - [`Service::WriteFragmented`] - Write Tag Fragmented (0x53)
//! - [`Service::ReadModifyWrite`] - Read Modify Write Tag (0x4E)
//!
//! ## Connection Management
//! - [`ForwardOpen`] - Forward Open (0x54) / Large Forward Open (0x5B)
//! - [`ForwardClose`] - Forward Close (0x4E)
//! - [`unconnected_send`] - Unconnected Send (0x52)
//!
//! # Example
//!
//! ```
//! use logix_cip::{Service, TypeCode};
//!
//! let read = Service::Read {
//!     path: vec![0x91, 0x03, b'T', b'a', b'g', 0x00],
//!     elements: 1,
//! };
//! let bytes = read.encode().unwrap();
//! assert_eq!(bytes[0], 0x4C);
//! assert_eq!(bytes[1], 3); // path size in words
//! assert_eq!(bytes.len(), read.encoded_len());
//! ```

use crate::error::{CipError, Result};
use crate::header::EncapsulationHeader;
use crate::response::{ITEM_CONNECTED_ADDRESS, ITEM_CONNECTED_DATA, ITEM_UNCONNECTED_DATA};

/// List Identity encapsulation command.
pub const LIST_IDENTITY: u16 = 0x63;
/// Register Session encapsulation command.
pub const REGISTER_SESSION: u16 = 0x65;
/// Unregister Session encapsulation command.
pub const UNREGISTER_SESSION: u16 = 0x66;
/// Send RR Data (unconnected) encapsulation command.
pub const SEND_RR_DATA: u16 = 0x6F;
/// Send Unit Data (connected) encapsulation command.
pub const SEND_UNIT_DATA: u16 = 0x70;

/// Get Attributes All service.
pub const SERVICE_GET_ATTRIBUTES_ALL: u8 = 0x01;
/// Get Attribute List service.
pub const SERVICE_GET_ATTRIBUTE_LIST: u8 = 0x03;
/// Multiple Service Packet service.
pub const SERVICE_MULTIPLE: u8 = 0x0A;
/// Read Tag service.
pub const SERVICE_READ_TAG: u8 = 0x4C;
/// Write Tag service.
pub const SERVICE_WRITE_TAG: u8 = 0x4D;
/// Read Modify Write Tag service.
pub const SERVICE_READ_MODIFY_WRITE: u8 = 0x4E;
/// Forward Close service (Connection Manager).
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;
/// Read Tag Fragmented service.
pub const SERVICE_READ_FRAGMENTED: u8 = 0x52;
/// Unconnected Send service (Connection Manager).
pub const SERVICE_UNCONNECTED_SEND: u8 = 0x52;
/// Write Tag Fragmented service.
pub const SERVICE_WRITE_FRAGMENTED: u8 = 0x53;
/// Forward Open service.
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
/// Get Instance Attribute List service.
pub const SERVICE_GET_INSTANCE_ATTRIBUTE_LIST: u8 = 0x55;
/// Large Forward Open service.
pub const SERVICE_LARGE_FORWARD_OPEN: u8 = 0x5B;

/// Identity object class.
pub const CLASS_IDENTITY: u32 = 0x01;
/// Message Router class.
pub const CLASS_MESSAGE_ROUTER: u32 = 0x02;
/// Connection Manager class.
pub const CLASS_CONNECTION_MANAGER: u32 = 0x06;
/// Program class.
pub const CLASS_PROGRAM: u32 = 0x68;
/// Symbol class.
pub const CLASS_SYMBOL: u32 = 0x6B;
/// Template class.
pub const CLASS_TEMPLATE: u32 = 0x6C;

/// Padded path to the Message Router instance 1.
pub const MESSAGE_ROUTER_PATH: [u8; 4] = [0x20, 0x02, 0x24, 0x01];
/// Padded path to the Connection Manager instance 1.
pub const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];

/// Payload size negotiated by a standard Forward Open.
pub const STANDARD_PAYLOAD_SIZE: usize = 500;
/// Payload size negotiated by a Large Forward Open.
pub const LARGE_PAYLOAD_SIZE: usize = 4000;

/// Default requested packet interval in microseconds.
pub const DEFAULT_RPI: u32 = 0x0020_4001;
/// Priority / time tick byte used by connection manager requests.
const PRIORITY_TIME_TICK: u8 = 0x0A;
/// Timeout ticks used by connection manager requests.
const TIMEOUT_TICKS: u8 = 0x05;
const TIMEOUT_MULTIPLIER: u8 = 0x07;
/// Class 3 transport, application trigger, server.
const TRANSPORT_CLASS_TRIGGER: u8 = 0xA3;

/// Bytes the Multiple Service request wrapper adds: service, path size, path, count.
pub const MULTI_REQUEST_OVERHEAD: usize = 2 + MESSAGE_ROUTER_PATH.len() + 2;
/// Bytes the Multiple Service reply wrapper adds: reply header and count.
pub const MULTI_REPLY_OVERHEAD: usize = 4 + 2;
/// Offset table entry per embedded service.
pub const MULTI_OFFSET_SIZE: usize = 2;

/// Builds a Register Session frame (protocol version 1, no options).
pub fn register_session() -> Vec<u8> {
    let mut frame = EncapsulationHeader::new(REGISTER_SESSION, 4, 0).to_bytes().to_vec();
    frame.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    frame
}

/// Builds an Unregister Session frame.
pub fn unregister_session(session: u32) -> Vec<u8> {
    EncapsulationHeader::new(UNREGISTER_SESSION, 0, session)
        .to_bytes()
        .to_vec()
}

/// Builds a List Identity frame.
pub fn list_identity() -> Vec<u8> {
    EncapsulationHeader::new(LIST_IDENTITY, 0, 0).to_bytes().to_vec()
}

/// Wraps an unconnected message in a Send RR Data frame.
pub fn send_rr_data(session: u32, message: &[u8]) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(16 + message.len());
    data.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    data.extend_from_slice(&0x000Au16.to_le_bytes()); // timeout
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // null address item
    data.extend_from_slice(&ITEM_UNCONNECTED_DATA.to_le_bytes());
    data.extend_from_slice(&item_len(message.len())?.to_le_bytes());
    data.extend_from_slice(message);
    EncapsulationHeader::new(SEND_RR_DATA, 0, session).frame(&data)
}

/// Wraps a connected message in a Send Unit Data frame.
pub fn send_unit_data(
    session: u32,
    connection_id: u32,
    sequence: u16,
    message: &[u8],
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(24 + message.len());
    data.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    data.extend_from_slice(&0u16.to_le_bytes()); // timeout
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&ITEM_CONNECTED_ADDRESS.to_le_bytes());
    data.extend_from_slice(&4u16.to_le_bytes());
    data.extend_from_slice(&connection_id.to_le_bytes());
    data.extend_from_slice(&ITEM_CONNECTED_DATA.to_le_bytes());
    data.extend_from_slice(&item_len(message.len() + 2)?.to_le_bytes());
    data.extend_from_slice(&sequence.to_le_bytes());
    data.extend_from_slice(message);
    EncapsulationHeader::new(SEND_UNIT_DATA, 0, session).frame(&data)
}

fn item_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| CipError::encode(format!("message too long: {len} bytes")))
}

fn path_words(path: &[u8]) -> Result<u8> {
    if path.len() % 2 != 0 {
        return Err(CipError::path(format!(
            "request path must be word aligned, got {} bytes",
            path.len()
        )));
    }
    u8::try_from(path.len() / 2)
        .map_err(|_| CipError::path(format!("request path too long: {} bytes", path.len())))
}

/// Builds a Message Router request: service, path size in words, path, data.
pub fn message_router_request(service: u8, path: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(2 + path.len() + data.len());
    out.push(service);
    out.push(path_words(path)?);
    out.extend_from_slice(path);
    out.extend_from_slice(data);
    Ok(out)
}

/// Wraps a Message Router request in an Unconnected Send addressed along `route`.
///
/// `route` is the encoded (padded) port-segment path to the target.
pub fn unconnected_send(message: &[u8], route: &[u8]) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(8 + message.len() + route.len());
    data.push(PRIORITY_TIME_TICK);
    data.push(TIMEOUT_TICKS);
    data.extend_from_slice(&item_len(message.len())?.to_le_bytes());
    data.extend_from_slice(message);
    if message.len() % 2 == 1 {
        data.push(0);
    }
    data.push(path_words(route)?);
    data.push(0);
    data.extend_from_slice(route);
    message_router_request(SERVICE_UNCONNECTED_SEND, &CONNECTION_MANAGER_PATH, &data)
}

/// Packs Message Router requests into one Multiple Service Packet.
///
/// # Example
///
/// ```
/// use logix_cip::multi_service;
///
/// let packet = multi_service(&[vec![0x4C, 0x00], vec![0x4C, 0x00]]).unwrap();
/// // service, path size, path, count, two offsets, two requests
/// assert_eq!(packet.len(), 2 + 4 + 2 + 4 + 4);
/// assert_eq!(&packet[8..12], [0x06, 0x00, 0x08, 0x00]);
/// ```
pub fn multi_service(requests: &[Vec<u8>]) -> Result<Vec<u8>> {
    let count = requests.len();
    let mut data = Vec::with_capacity(2 + count * 2 + requests.iter().map(Vec::len).sum::<usize>());
    data.extend_from_slice(&item_len(count)?.to_le_bytes());
    let mut offset = 2 + count * MULTI_OFFSET_SIZE;
    for request in requests {
        data.extend_from_slice(&item_len(offset)?.to_le_bytes());
        offset += request.len();
    }
    for request in requests {
        data.extend_from_slice(request);
    }
    message_router_request(SERVICE_MULTIPLE, &MESSAGE_ROUTER_PATH, &data)
}

/// Data type header of read replies and write requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    /// Elementary type code, sent as two bytes.
    Elementary(u8),
    /// Structure, identified by its structure handle (`A0 02 hh hh`).
    Structure(u16),
}

impl TypeCode {
    /// Encoded length: 2 for elementary types, 4 for structures.
    pub fn encoded_len(self) -> usize {
        match self {
            TypeCode::Elementary(_) => 2,
            TypeCode::Structure(_) => 4,
        }
    }

    /// Appends the encoded type header.
    pub fn encode_into(self, out: &mut Vec<u8>) {
        match self {
            TypeCode::Elementary(code) => out.extend_from_slice(&[code, 0x00]),
            TypeCode::Structure(handle) => {
                out.extend_from_slice(&[0xA0, 0x02]);
                out.extend_from_slice(&handle.to_le_bytes());
            }
        }
    }

    /// Parses a type header at the start of a read reply.
    pub fn parse(data: &[u8]) -> Result<Self> {
        match data {
            [0xA0, 0x02, lo, hi, ..] => Ok(TypeCode::Structure(u16::from_le_bytes([*lo, *hi]))),
            [0xA0, ..] => Err(CipError::invalid_response("truncated structure type header")),
            [code, _, ..] => Ok(TypeCode::Elementary(*code)),
            _ => Err(CipError::invalid_response(format!(
                "type header too short: {} bytes",
                data.len()
            ))),
        }
    }
}

/// Tag services sent to the Message Router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
    /// Read Tag.
    Read {
        /// Encoded tag path.
        path: Vec<u8>,
        /// Element count.
        elements: u16,
    },
    /// Read Tag Fragmented, starting at a byte offset.
    ReadFragmented {
        /// Encoded tag path.
        path: Vec<u8>,
        /// Element count of the whole transfer.
        elements: u16,
        /// Byte offset of this fragment.
        offset: u32,
    },
    /// Write Tag.
    Write {
        /// Encoded tag path.
        path: Vec<u8>,
        /// Data type header.
        type_code: TypeCode,
        /// Element count.
        elements: u16,
        /// Encoded value.
        data: Vec<u8>,
    },
    /// Write Tag Fragmented, one chunk at a byte offset.
    WriteFragmented {
        /// Encoded tag path.
        path: Vec<u8>,
        /// Data type header.
        type_code: TypeCode,
        /// Element count of the whole transfer.
        elements: u16,
        /// Byte offset of this chunk.
        offset: u32,
        /// Chunk bytes.
        data: Vec<u8>,
    },
    /// Read Modify Write Tag: `new = (old | or_mask) & and_mask`.
    ReadModifyWrite {
        /// Encoded tag path.
        path: Vec<u8>,
        /// Bits to set.
        or_mask: Vec<u8>,
        /// Bits to keep (cleared bits are zero).
        and_mask: Vec<u8>,
    },
}

impl Service {
    /// Returns the service code.
    pub fn code(&self) -> u8 {
        match self {
            Service::Read { .. } => SERVICE_READ_TAG,
            Service::ReadFragmented { .. } => SERVICE_READ_FRAGMENTED,
            Service::Write { .. } => SERVICE_WRITE_TAG,
            Service::WriteFragmented { .. } => SERVICE_WRITE_FRAGMENTED,
            Service::ReadModifyWrite { .. } => SERVICE_READ_MODIFY_WRITE,
        }
    }

    /// Returns the encoded tag path.
    pub fn path(&self) -> &[u8] {
        match self {
            Service::Read { path, .. }
            | Service::ReadFragmented { path, .. }
            | Service::Write { path, .. }
            | Service::WriteFragmented { path, .. }
            | Service::ReadModifyWrite { path, .. } => path,
        }
    }

    /// Length of the encoded request in bytes.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Service::Read { .. } => 2,
            Service::ReadFragmented { .. } => 6,
            Service::Write {
                type_code, data, ..
            } => type_code.encoded_len() + 2 + data.len(),
            Service::WriteFragmented {
                type_code, data, ..
            } => type_code.encoded_len() + 6 + data.len(),
            Service::ReadModifyWrite {
                or_mask, and_mask, ..
            } => 2 + or_mask.len() + and_mask.len(),
        };
        2 + self.path().len() + body
    }

    /// Serializes the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not word aligned or the masks of a
    /// Read Modify Write differ in size.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.encoded_len());
        match self {
            Service::Read { elements, .. } => data.extend_from_slice(&elements.to_le_bytes()),
            Service::ReadFragmented {
                elements, offset, ..
            } => {
                data.extend_from_slice(&elements.to_le_bytes());
                data.extend_from_slice(&offset.to_le_bytes());
            }
            Service::Write {
                type_code,
                elements,
                data: value,
                ..
            } => {
                type_code.encode_into(&mut data);
                data.extend_from_slice(&elements.to_le_bytes());
                data.extend_from_slice(value);
            }
            Service::WriteFragmented {
                type_code,
                elements,
                offset,
                data: chunk,
                ..
            } => {
                type_code.encode_into(&mut data);
                data.extend_from_slice(&elements.to_le_bytes());
                data.extend_from_slice(&offset.to_le_bytes());
                data.extend_from_slice(chunk);
            }
            Service::ReadModifyWrite {
                or_mask, and_mask, ..
            } => {
                if or_mask.len() != and_mask.len() {
                    return Err(CipError::encode("read-modify-write masks differ in size"));
                }
                data.extend_from_slice(&item_len(or_mask.len())?.to_le_bytes());
                data.extend_from_slice(or_mask);
                data.extend_from_slice(and_mask);
            }
        }
        message_router_request(self.code(), self.path(), &data)
    }
}

/// Forward Open / Large Forward Open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpen {
    /// Use Large Forward Open (32-bit network parameters).
    pub large: bool,
    /// Requested connection size in bytes.
    pub connection_size: u32,
    /// T→O connection id chosen by the originator.
    pub t_o_connection_id: u32,
    /// Connection serial number.
    pub connection_serial: u16,
    /// Originator vendor id.
    pub vendor_id: u16,
    /// Originator serial number.
    pub originator_serial: u32,
    /// Requested packet interval in microseconds, both directions.
    pub rpi: u32,
    /// Encoded route to the target (port segments).
    pub route: Vec<u8>,
}

impl ForwardOpen {
    /// Network connection parameters for the configured size.
    fn network_parameters(&self, out: &mut Vec<u8>) {
        if self.large {
            out.extend_from_slice(&((self.connection_size & 0xFFFF) | 0x4200_0000).to_le_bytes());
        } else {
            let params = (self.connection_size as u16 & 0x01FF) | 0x4200;
            out.extend_from_slice(&params.to_le_bytes());
        }
    }

    /// Serializes the request, addressed to the Connection Manager.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut path = self.route.clone();
        path.extend_from_slice(&MESSAGE_ROUTER_PATH);

        let mut data = Vec::with_capacity(48 + path.len());
        data.push(PRIORITY_TIME_TICK);
        data.push(TIMEOUT_TICKS);
        data.extend_from_slice(&0u32.to_le_bytes()); // O→T id, assigned by the target
        data.extend_from_slice(&self.t_o_connection_id.to_le_bytes());
        data.extend_from_slice(&self.connection_serial.to_le_bytes());
        data.extend_from_slice(&self.vendor_id.to_le_bytes());
        data.extend_from_slice(&self.originator_serial.to_le_bytes());
        data.push(TIMEOUT_MULTIPLIER);
        data.extend_from_slice(&[0x00, 0x00, 0x00]);
        data.extend_from_slice(&self.rpi.to_le_bytes());
        self.network_parameters(&mut data);
        data.extend_from_slice(&self.rpi.to_le_bytes());
        self.network_parameters(&mut data);
        data.push(TRANSPORT_CLASS_TRIGGER);
        data.push(path_words(&path)?);
        data.extend_from_slice(&path);

        let service = if self.large {
            SERVICE_LARGE_FORWARD_OPEN
        } else {
            SERVICE_FORWARD_OPEN
        };
        message_router_request(service, &CONNECTION_MANAGER_PATH, &data)
    }
}

/// Forward Close request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardClose {
    /// Connection serial number used by the Forward Open.
    pub connection_serial: u16,
    /// Originator vendor id.
    pub vendor_id: u16,
    /// Originator serial number.
    pub originator_serial: u32,
    /// Encoded route to the target (port segments).
    pub route: Vec<u8>,
}

impl ForwardClose {
    /// Serializes the request, addressed to the Connection Manager.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut path = self.route.clone();
        path.extend_from_slice(&MESSAGE_ROUTER_PATH);

        let mut data = Vec::with_capacity(12 + path.len());
        data.push(PRIORITY_TIME_TICK);
        data.push(TIMEOUT_TICKS);
        data.extend_from_slice(&self.connection_serial.to_le_bytes());
        data.extend_from_slice(&self.vendor_id.to_le_bytes());
        data.extend_from_slice(&self.originator_serial.to_le_bytes());
        data.push(path_words(&path)?);
        data.push(0);
        data.extend_from_slice(&path);
        message_router_request(SERVICE_FORWARD_CLOSE, &CONNECTION_MANAGER_PATH, &data)
    }
}

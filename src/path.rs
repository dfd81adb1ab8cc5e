//! EPATH segment encoding and connection-path parsing.
//!
//! CIP addresses objects, tags and routes with a sequence of segments. Messages
//! sent to the Message Router use the padded form; connection paths in Forward
//! Open use the same encoding.
//!
//! # Example
//!
//! ```
//! use logix_cip::{encode_path, LogicalKind, Segment};
//!
//! let path = encode_path(
//!     &[
//!         Segment::logical(LogicalKind::ClassId, 0x6B),
//!         Segment::logical(LogicalKind::InstanceId, 0),
//!     ],
//!     true,
//! )
//! .unwrap();
//! assert_eq!(path, [0x20, 0x6B, 0x24, 0x00]);
//! ```

use std::net::IpAddr;

use crate::error::{CipError, Result};

/// Default EtherNet/IP TCP port.
pub const DEFAULT_PORT: u16 = 44818;

/// Logical segment kinds. The value is the segment type byte for the 8-bit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalKind {
    /// Object class.
    ClassId,
    /// Object instance.
    InstanceId,
    /// Member (array element in Logix tag paths).
    MemberId,
    /// Connection point.
    ConnectionPoint,
    /// Attribute.
    AttributeId,
}

impl LogicalKind {
    fn code(self) -> u8 {
        match self {
            LogicalKind::ClassId => 0x20,
            LogicalKind::InstanceId => 0x24,
            LogicalKind::MemberId => 0x28,
            LogicalKind::ConnectionPoint => 0x2C,
            LogicalKind::AttributeId => 0x30,
        }
    }

    fn max_value(self) -> u32 {
        match self {
            LogicalKind::ClassId | LogicalKind::AttributeId => u16::MAX as u32,
            _ => u32::MAX,
        }
    }
}

/// One EPATH segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Route hop: leave through `port` to the node at `link`.
    Port {
        /// Port number (1 = backplane, 2 = first network port, ...).
        port: u16,
        /// Link address: a slot number or an ASCII IP address.
        link: Vec<u8>,
    },
    /// Class, instance, member, connection point or attribute id.
    Logical {
        /// Segment kind.
        kind: LogicalKind,
        /// Id value.
        value: u32,
    },
    /// ANSI extended symbolic segment (tag or member name).
    Symbolic(String),
    /// Simple data segment.
    Data(Vec<u8>),
}

impl Segment {
    /// Logical segment shorthand.
    pub fn logical(kind: LogicalKind, value: u32) -> Self {
        Segment::Logical { kind, value }
    }

    /// Port segment with a one-byte link address (slot).
    pub fn port(port: u16, slot: u8) -> Self {
        Segment::Port {
            port,
            link: vec![slot],
        }
    }

    /// Symbolic segment shorthand.
    pub fn symbolic(name: impl Into<String>) -> Self {
        Segment::Symbolic(name.into())
    }

    /// Encodes this segment, appending to `out`.
    pub fn encode_into(&self, padded: bool, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Segment::Port { port, link } => encode_port(*port, link, padded, out),
            Segment::Logical { kind, value } => encode_logical(*kind, *value, padded, out),
            Segment::Symbolic(name) => {
                if name.is_empty() || !name.is_ascii() {
                    return Err(CipError::path(format!("invalid symbolic name '{name}'")));
                }
                let len = u8::try_from(name.len())
                    .map_err(|_| CipError::path(format!("symbol name too long: {name}")))?;
                out.push(0x91);
                out.push(len);
                out.extend_from_slice(name.as_bytes());
                if padded && len % 2 == 1 {
                    out.push(0);
                }
                Ok(())
            }
            Segment::Data(data) => {
                let words = u8::try_from(data.len().div_ceil(2))
                    .map_err(|_| CipError::path("data segment too long"))?;
                out.push(0x80);
                out.push(words);
                out.extend_from_slice(data);
                if data.len() % 2 == 1 {
                    out.push(0);
                }
                Ok(())
            }
        }
    }
}

fn encode_port(port: u16, link: &[u8], padded: bool, out: &mut Vec<u8>) -> Result<()> {
    if port == 0 {
        return Err(CipError::path("port 0 is reserved"));
    }
    if link.is_empty() {
        return Err(CipError::path(format!("empty link address for port {port}")));
    }
    let extended_link = link.len() > 1;
    let extended_port = port >= 15;
    let start = out.len();

    let mut segment = if extended_port { 0x0F } else { port as u8 };
    if extended_link {
        segment |= 0x10;
    }
    out.push(segment);
    if extended_link {
        let len = u8::try_from(link.len())
            .map_err(|_| CipError::path("link address too long"))?;
        out.push(len);
    }
    if extended_port {
        out.extend_from_slice(&port.to_le_bytes());
    }
    out.extend_from_slice(link);
    if padded && (out.len() - start) % 2 == 1 {
        out.push(0);
    }
    Ok(())
}

fn encode_logical(kind: LogicalKind, value: u32, padded: bool, out: &mut Vec<u8>) -> Result<()> {
    if value > kind.max_value() {
        return Err(CipError::path(format!(
            "{kind:?} value {value} does not fit 16 bits"
        )));
    }
    if let Ok(v) = u8::try_from(value) {
        out.extend_from_slice(&[kind.code(), v]);
    } else if let Ok(v) = u16::try_from(value) {
        out.push(kind.code() | 0x01);
        if padded {
            out.push(0);
        }
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(kind.code() | 0x02);
        if padded {
            out.push(0);
        }
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

/// Encodes a segment sequence.
///
/// # Errors
///
/// Returns `CipError::Path` for values that do not fit their segment.
pub fn encode_path(segments: &[Segment], padded: bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(segments.len() * 4);
    for segment in segments {
        segment.encode_into(padded, &mut out)?;
    }
    Ok(out)
}

/// Encodes a request path (class, instance and optional attribute), padded.
pub fn object_path(class: u32, instance: u32, attribute: Option<u32>) -> Result<Vec<u8>> {
    let mut segments = vec![
        Segment::logical(LogicalKind::ClassId, class),
        Segment::logical(LogicalKind::InstanceId, instance),
    ];
    if let Some(attribute) = attribute {
        segments.push(Segment::logical(LogicalKind::AttributeId, attribute));
    }
    encode_path(&segments, true)
}

/// Maps a port name or number to a port number.
///
/// # Example
///
/// ```
/// use logix_cip::port_number;
///
/// assert_eq!(port_number("bp").unwrap(), 1);
/// assert_eq!(port_number("ENET").unwrap(), 2);
/// assert_eq!(port_number("18").unwrap(), 18);
/// assert!(port_number("serial").is_err());
/// ```
pub fn port_number(name: &str) -> Result<u16> {
    let port = match name.to_ascii_lowercase().as_str() {
        "bp" | "backplane" => 1,
        "enet" | "dhrio-a" | "dnet" | "cnet" | "dh485-a" => 2,
        "dhrio-b" | "dh485-b" => 3,
        other => other
            .parse::<u16>()
            .map_err(|_| CipError::path(format!("unknown port '{name}'")))?,
    };
    if port == 0 {
        return Err(CipError::path("port 0 is reserved"));
    }
    Ok(port)
}

fn link_address(text: &str) -> Result<Vec<u8>> {
    if let Ok(slot) = text.parse::<u32>() {
        let slot = u8::try_from(slot)
            .map_err(|_| CipError::path(format!("link address {slot} out of range")))?;
        return Ok(vec![slot]);
    }
    if text.parse::<IpAddr>().is_ok() {
        return Ok(text.as_bytes().to_vec());
    }
    Err(CipError::path(format!("invalid link address '{text}'")))
}

/// A parsed `host[:port][/route]` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPath {
    /// Controller (or gateway) host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Route from the host to the controller.
    pub route: Vec<Segment>,
}

/// Parses a connection string of the form `host[:port][/route]`.
///
/// The route is a list of `port/link` pairs separated by `/` or `,`. A single
/// number is shorthand for a backplane slot, and no route at all means
/// backplane slot 0.
///
/// # Example
///
/// ```
/// use logix_cip::{parse_connection_path, Segment};
///
/// let path = parse_connection_path("10.0.0.5/3").unwrap();
/// assert_eq!(path.host, "10.0.0.5");
/// assert_eq!(path.port, 44818);
/// assert_eq!(path.route, vec![Segment::port(1, 3)]);
///
/// let path = parse_connection_path("10.0.0.5:2222/bp/0/enet/192.168.1.9/bp/1").unwrap();
/// assert_eq!(path.port, 2222);
/// assert_eq!(path.route.len(), 3);
/// ```
pub fn parse_connection_path(text: &str) -> Result<ConnectionPath> {
    let text = text.trim();
    let (endpoint, route_text) = match text.split_once('/') {
        Some((endpoint, route)) => (endpoint, Some(route)),
        None => (text, None),
    };

    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| CipError::path(format!("invalid TCP port '{port}'")))?;
            (host, port)
        }
        None => (endpoint, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(CipError::path(format!("missing host in '{text}'")));
    }

    let tokens: Vec<&str> = route_text
        .unwrap_or("")
        .split(['/', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    let route = match tokens.as_slice() {
        [] => vec![Segment::port(1, 0)],
        [slot] => vec![Segment::Port {
            port: 1,
            link: link_address(slot)?,
        }],
        pairs if pairs.len() % 2 == 0 => pairs
            .chunks_exact(2)
            .map(|pair| {
                Ok(Segment::Port {
                    port: port_number(pair[0])?,
                    link: link_address(pair[1])?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(CipError::path(format!(
                "route must be port/link pairs: '{}'",
                route_text.unwrap_or_default()
            )))
        }
    };

    Ok(ConnectionPath {
        host: host.to_string(),
        port,
        route,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_widths_padded() {
        let seg = |v| encode_path(&[Segment::logical(LogicalKind::InstanceId, v)], true).unwrap();
        assert_eq!(seg(5), [0x24, 0x05]);
        assert_eq!(seg(0x1234), [0x25, 0x00, 0x34, 0x12]);
        assert_eq!(seg(0x0001_0000), [0x26, 0x00, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn test_logical_widths_packed() {
        let path = encode_path(&[Segment::logical(LogicalKind::MemberId, 300)], false).unwrap();
        assert_eq!(path, [0x29, 0x2C, 0x01]);
    }

    #[test]
    fn test_class_over_16_bits_rejected() {
        assert!(matches!(
            encode_path(&[Segment::logical(LogicalKind::ClassId, 0x1_0000)], true),
            Err(CipError::Path { .. })
        ));
        let oversized = Segment::logical(LogicalKind::AttributeId, 0x1_0000);
        assert!(encode_path(&[oversized], true).is_err());
    }

    #[test]
    fn test_symbolic_padding() {
        let path = encode_path(&[Segment::symbolic("Tag")], true).unwrap();
        assert_eq!(path, [0x91, 0x03, b'T', b'a', b'g', 0x00]);
        let path = encode_path(&[Segment::symbolic("Tags")], true).unwrap();
        assert_eq!(path.len(), 6);
        assert!(encode_path(&[Segment::symbolic("")], true).is_err());
    }

    #[test]
    fn test_port_segments() {
        assert_eq!(encode_path(&[Segment::port(1, 0)], true).unwrap(), [0x01, 0x00]);
        assert_eq!(
            encode_path(&[Segment::port(18, 1)], true).unwrap(),
            [0x0F, 0x12, 0x00, 0x01]
        );
        let ip = Segment::Port {
            port: 2,
            link: b"10.0.0.1".to_vec(),
        };
        let encoded = encode_path(&[ip], true).unwrap();
        assert_eq!(&encoded[..2], [0x12, 0x08]);
        assert_eq!(&encoded[2..10], b"10.0.0.1");
        assert_eq!(encoded.len(), 10);
    }

    #[test]
    fn test_odd_ip_link_is_padded() {
        let ip = Segment::Port {
            port: 2,
            link: b"10.0.0.12".to_vec(),
        };
        let encoded = encode_path(&[ip], true).unwrap();
        assert_eq!(encoded.len(), 12);
        assert_eq!(encoded[11], 0);
    }

    #[test]
    fn test_data_segment() {
        let encoded = encode_path(&[Segment::Data(vec![1, 2, 3])], true).unwrap();
        assert_eq!(encoded, [0x80, 0x02, 1, 2, 3, 0]);
    }

    #[test]
    fn test_port_names() {
        assert_eq!(port_number("backplane").unwrap(), 1);
        assert_eq!(port_number("dhrio-a").unwrap(), 2);
        assert_eq!(port_number("dh485-b").unwrap(), 3);
        assert!(matches!(port_number("nope"), Err(CipError::Path { .. })));
        assert!(port_number("0").is_err());
    }

    #[test]
    fn test_parse_connection_path_default_route() {
        let path = parse_connection_path("plc.local").unwrap();
        assert_eq!(path.host, "plc.local");
        assert_eq!(path.port, DEFAULT_PORT);
        assert_eq!(path.route, vec![Segment::port(1, 0)]);
    }

    #[test]
    fn test_parse_connection_path_comma_route() {
        let path = parse_connection_path("10.1.1.1/1,2,2,10.1.1.2,1,0").unwrap();
        assert_eq!(
            path.route,
            vec![
                Segment::port(1, 2),
                Segment::Port {
                    port: 2,
                    link: b"10.1.1.2".to_vec()
                },
                Segment::port(1, 0),
            ]
        );
    }

    #[test]
    fn test_parse_connection_path_errors() {
        assert!(parse_connection_path("10.0.0.1/bp/0/enet").is_err());
        assert!(parse_connection_path("10.0.0.1:abc").is_err());
        assert!(parse_connection_path("10.0.0.1/bp/999").is_err());
        assert!(parse_connection_path(":44818/1").is_err());
    }

    #[test]
    fn test_object_path() {
        assert_eq!(
            object_path(0x6C, 0x1234, Some(1)).unwrap(),
            [0x20, 0x6C, 0x25, 0x00, 0x34, 0x12, 0x30, 0x01]
        );
    }
}

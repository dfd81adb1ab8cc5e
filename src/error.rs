//! Error types for the CIP tag engine.

use std::io;
use thiserror::Error;

/// Result type alias for CIP operations.
pub type Result<T> = std::result::Result<T, CipError>;

/// Errors that can occur while talking to a Logix controller.
#[derive(Debug, Error)]
pub enum CipError {
    /// The tag address text could not be parsed or resolved.
    #[error("failed to parse tag request '{tag}': {reason}")]
    Parse {
        /// The offending tag address text.
        tag: String,
        /// Why parsing failed.
        reason: String,
    },

    /// A symbol or structure member does not exist in the symbol cache.
    #[error("tag not found: {tag}")]
    TagNotFound {
        /// The name that could not be resolved.
        tag: String,
    },

    /// An EPATH could not be encoded.
    #[error("path error: {reason}")]
    Path {
        /// Description of the encoding failure.
        reason: String,
    },

    /// A value could not be encoded for the wire.
    #[error("encode error: {reason}")]
    Encode {
        /// Description of the encoding failure.
        reason: String,
    },

    /// A decoder ran out of bytes exactly at an element boundary.
    #[error("buffer empty")]
    BufferEmpty,

    /// The controller returned bytes that could not be decoded.
    #[error("invalid response: {reason}")]
    InvalidResponse {
        /// Description of the response error, including the field being decoded.
        reason: String,
    },

    /// The controller returned a non-success CIP status.
    #[error("CIP status 0x{status:02X}{}: {message}", extended_suffix(.extended))]
    Status {
        /// General status code.
        status: u8,
        /// First extended status word, if any.
        extended: Option<u16>,
        /// Human-readable description.
        message: String,
    },

    /// The encapsulation layer returned a non-zero status.
    #[error("encapsulation command 0x{command:04X} failed with status 0x{status:08X}")]
    Encapsulation {
        /// Encapsulation command code.
        command: u16,
        /// Encapsulation status.
        status: u32,
    },

    /// Communication timeout.
    #[error("communication timeout")]
    Timeout,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An operation needed a state the connection is not in.
    #[error("not connected (state: {state})")]
    NotConnected {
        /// The current connection state.
        state: String,
    },

    /// One or more steps of a best-effort close failed.
    #[error("close failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Close(Vec<CipError>),
}

impl CipError {
    /// Creates a new `Parse` error.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::CipError;
    ///
    /// let err = CipError::parse("Tag[", "unterminated index");
    /// assert!(err.to_string().contains("Tag["));
    /// ```
    pub fn parse(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `TagNotFound` error.
    pub fn tag_not_found(tag: impl Into<String>) -> Self {
        Self::TagNotFound { tag: tag.into() }
    }

    /// Creates a new `Path` error.
    pub fn path(reason: impl Into<String>) -> Self {
        Self::Path {
            reason: reason.into(),
        }
    }

    /// Creates a new `Encode` error.
    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::CipError;
    ///
    /// let err = CipError::invalid_response("reply too short");
    /// assert_eq!(err.to_string(), "invalid response: reply too short");
    /// ```
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Creates a `Status` error with a description looked up from the status tables.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::CipError;
    ///
    /// let err = CipError::status(0x05, None);
    /// assert!(err.to_string().contains("Path destination unknown"));
    /// ```
    pub fn status(status: u8, extended: Option<u16>) -> Self {
        Self::Status {
            status,
            extended,
            message: status_description(status, extended),
        }
    }

    /// Creates a `NotConnected` error for the given state.
    pub fn not_connected(state: impl std::fmt::Display) -> Self {
        Self::NotConnected {
            state: state.to_string(),
        }
    }

    /// Returns whether this is a communication failure (I/O or timeout).
    ///
    /// Communication failures tear the connection down; every other kind
    /// leaves it usable.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout)
    }
}

fn extended_suffix(extended: &Option<u16>) -> String {
    match extended {
        Some(ext) => format!(" (extended 0x{ext:04X})"),
        None => String::new(),
    }
}

/// Returns a human-readable description for a CIP general status, refined by
/// the extended status where one is known.
///
/// # Example
///
/// ```
/// use logix_cip::status_description;
///
/// assert_eq!(status_description(0x00, None), "Success");
/// assert!(status_description(0x01, Some(0x0109)).contains("Invalid connection size"));
/// ```
pub fn status_description(status: u8, extended: Option<u16>) -> String {
    let general = general_status_text(status);
    match extended.and_then(|ext| extended_status_text(status, ext)) {
        Some(detail) => format!("{general}: {detail}"),
        None => general.to_string(),
    }
}

fn general_status_text(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Partial transfer",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x21 => "Write-once value or medium already written",
        0x22 => "Invalid reply received",
        0x25 => "Key failure in path",
        0x26 => "Path size invalid",
        0x27 => "Unexpected attribute in list",
        0x28 => "Invalid member ID",
        0x29 => "Member not settable",
        0x2A => "Group 2 only server general failure",
        _ => "Unknown status",
    }
}

fn extended_status_text(status: u8, extended: u16) -> Option<&'static str> {
    let text = match (status, extended) {
        (0x01, 0x0100) => "Connection in use or duplicate forward open",
        (0x01, 0x0103) => "Transport class and trigger combination not supported",
        (0x01, 0x0106) => "Ownership conflict",
        (0x01, 0x0107) => "Target connection not found",
        (0x01, 0x0108) => "Invalid network connection parameter",
        (0x01, 0x0109) => "Invalid connection size",
        (0x01, 0x0110) => "Target for connection not configured",
        (0x01, 0x0111) => "RPI not supported",
        (0x01, 0x0113) => "Out of connections",
        (0x01, 0x0114) => "Vendor ID or product code mismatch",
        (0x01, 0x0115) => "Product type mismatch",
        (0x01, 0x0116) => "Revision mismatch",
        (0x01, 0x0117) => "Invalid produced or consumed application path",
        (0x01, 0x011A) => "Target object out of connections",
        (0x01, 0x0203) => "Connection timed out",
        (0x01, 0x0204) => "Unconnected request timed out",
        (0x01, 0x0205) => "Parameter error in unconnected request",
        (0x01, 0x0206) => "Message too large for unconnected send",
        (0x01, 0x0301) => "No buffer memory available",
        (0x01, 0x0302) => "Network bandwidth not available",
        (0x01, 0x0311) => "Port not available",
        (0x01, 0x0312) => "Link address not valid",
        (0x01, 0x0315) => "Invalid segment in connection path",
        (0x01, 0x0316) => "Error in forward close service connection path",
        (0x01, 0x0318) => "Link address to self invalid",
        (0xFF, 0x2104) => "Offset out of range",
        (0xFF, 0x2105) => "Access beyond end of the object",
        (0xFF, 0x2107) => "Data type used in request does not match target tag",
        _ => return None,
    };
    Some(text)
}

/// Returns a description for an encapsulation-layer status code.
pub fn encapsulation_status_description(status: u32) -> &'static str {
    match status {
        0x0000 => "Success",
        0x0001 => "Invalid or unsupported encapsulation command",
        0x0002 => "Insufficient memory in receiver",
        0x0003 => "Poorly formed or incorrect data",
        0x0064 => "Invalid session handle",
        0x0065 => "Invalid message length",
        0x0069 => "Unsupported encapsulation protocol revision",
        _ => "Unknown encapsulation status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        let err = CipError::parse("Tag.x.", "empty member name");
        assert_eq!(
            err.to_string(),
            "failed to parse tag request 'Tag.x.': empty member name"
        );
    }

    #[test]
    fn test_status_display_with_extended() {
        let err = CipError::status(0x01, Some(0x0109));
        assert_eq!(
            err.to_string(),
            "CIP status 0x01 (extended 0x0109): Connection failure: Invalid connection size"
        );
    }

    #[test]
    fn test_status_display_without_extended() {
        let err = CipError::status(0x04, None);
        assert_eq!(err.to_string(), "CIP status 0x04: Path segment error");
    }

    #[test]
    fn test_unknown_extended_falls_back_to_general() {
        assert_eq!(status_description(0x05, Some(0x1234)), "Path destination unknown");
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(CipError::Timeout.to_string(), "communication timeout");
    }

    #[test]
    fn test_is_communication() {
        assert!(CipError::Timeout.is_communication());
        assert!(CipError::Io(io::Error::other("reset")).is_communication());
        assert!(!CipError::status(0x05, None).is_communication());
        assert!(!CipError::BufferEmpty.is_communication());
    }

    #[test]
    fn test_close_display_joins_errors() {
        let err = CipError::Close(vec![CipError::Timeout, CipError::status(0x01, None)]);
        assert_eq!(
            err.to_string(),
            "close failed: communication timeout; CIP status 0x01: Connection failure"
        );
    }

    #[test]
    fn test_encapsulation_status_description() {
        assert_eq!(encapsulation_status_description(0x64), "Invalid session handle");
    }
}

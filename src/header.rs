//! EtherNet/IP encapsulation header.
//!
//! Every EtherNet/IP message on the TCP stream starts with a fixed 24-byte
//! header, followed by `length` bytes of command-specific data.
//!
//! # Header Structure
//!
//! | Bytes | Field | Description |
//! |-------|-------|-------------|
//! | 0-1 | Command | Encapsulation command code |
//! | 2-3 | Length | Length of the data following the header |
//! | 4-7 | Session | Session handle from Register Session |
//! | 8-11 | Status | 0 on success |
//! | 12-19 | Context | Sender context, echoed back by the target |
//! | 20-23 | Options | Always 0 |
//!
//! All fields are little-endian.
//!
//! # Example
//!
//! ```
//! use logix_cip::EncapsulationHeader;
//!
//! let header = EncapsulationHeader::new(0x65, 4, 0);
//! let bytes = header.to_bytes();
//! assert_eq!(bytes.len(), 24);
//! assert_eq!(EncapsulationHeader::from_bytes(&bytes).unwrap(), header);
//! ```

use crate::error::{CipError, Result};

/// Encapsulation header size in bytes.
pub const ENCAPSULATION_HEADER_SIZE: usize = 24;

/// Encapsulation header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncapsulationHeader {
    /// Encapsulation command.
    pub command: u16,
    /// Length of the data that follows the header.
    pub length: u16,
    /// Session handle (0 before registration).
    pub session: u32,
    /// Encapsulation status (0 = success).
    pub status: u32,
    /// Sender context.
    pub context: [u8; 8],
    /// Options (always 0).
    pub options: u32,
}

impl EncapsulationHeader {
    /// Creates a request header with zero status, context and options.
    pub fn new(command: u16, length: u16, session: u32) -> Self {
        Self {
            command,
            length,
            session,
            ..Self::default()
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(self) -> [u8; ENCAPSULATION_HEADER_SIZE] {
        let mut out = [0u8; ENCAPSULATION_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.command.to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.session.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..20].copy_from_slice(&self.context);
        out[20..24].copy_from_slice(&self.options.to_le_bytes());
        out
    }

    /// Parses a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns `CipError::InvalidResponse` if the slice is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::EncapsulationHeader;
    ///
    /// let mut bytes = [0u8; 24];
    /// bytes[0] = 0x6F;
    /// bytes[2] = 0x10;
    /// let header = EncapsulationHeader::from_bytes(&bytes).unwrap();
    /// assert_eq!(header.command, 0x6F);
    /// assert_eq!(header.length, 16);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ENCAPSULATION_HEADER_SIZE {
            return Err(CipError::invalid_response(format!(
                "encapsulation header too short: expected {} bytes, got {}",
                ENCAPSULATION_HEADER_SIZE,
                data.len()
            )));
        }
        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let mut context = [0u8; 8];
        context.copy_from_slice(&data[12..20]);

        Ok(Self {
            command: u16_at(0),
            length: u16_at(2),
            session: u32_at(4),
            status: u32_at(8),
            context,
            options: u32_at(20),
        })
    }

    /// Builds a complete frame: this header (with `length` set) followed by `data`.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Encode` if `data` is longer than 65535 bytes.
    pub fn frame(mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.length = u16::try_from(data.len()).map_err(|_| {
            CipError::encode(format!("encapsulated data too long: {} bytes", data.len()))
        })?;
        let mut out = Vec::with_capacity(ENCAPSULATION_HEADER_SIZE + data.len());
        out.extend_from_slice(&self.to_bytes());
        out.extend_from_slice(data);
        Ok(out)
    }

    /// Returns an error if the status field is non-zero.
    pub fn check_status(&self) -> Result<()> {
        if self.status != 0 {
            return Err(CipError::Encapsulation {
                command: self.command,
                status: self.status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_to_bytes() {
        let header = EncapsulationHeader::new(0x6F, 0x0010, 0x1122_3344);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..2], [0x6F, 0x00]);
        assert_eq!(&bytes[2..4], [0x10, 0x00]);
        assert_eq!(&bytes[4..8], [0x44, 0x33, 0x22, 0x11]);
        assert!(bytes[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_roundtrip() {
        let original = EncapsulationHeader {
            command: 0x70,
            length: 42,
            session: 7,
            status: 0x64,
            context: *b"ctx12345",
            options: 0,
        };
        let parsed = EncapsulationHeader::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_header_from_bytes_too_short() {
        let result = EncapsulationHeader::from_bytes(&[0x65, 0x00, 0x04]);
        assert!(matches!(result, Err(CipError::InvalidResponse { .. })));
    }

    #[test]
    fn test_frame_sets_length() {
        let frame = EncapsulationHeader::new(0x65, 0, 0)
            .frame(&[0x01, 0x00, 0x00, 0x00])
            .unwrap();
        assert_eq!(frame.len(), 28);
        assert_eq!(&frame[2..4], [0x04, 0x00]);
    }

    #[test]
    fn test_check_status() {
        assert!(EncapsulationHeader::new(0x65, 0, 0).check_status().is_ok());
        let bad = EncapsulationHeader {
            status: 0x64,
            ..EncapsulationHeader::new(0x6F, 0, 1)
        };
        assert!(matches!(
            bad.check_status(),
            Err(CipError::Encapsulation {
                command: 0x6F,
                status: 0x64
            })
        ));
    }
}

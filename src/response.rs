//! CIP reply parsing and validation.
//!
//! Replies arrive wrapped in an encapsulation frame whose data is a Common Packet
//! Format item list. The connected (Send Unit Data) and unconnected (Send RR Data)
//! forms differ only in the items they carry; both end in a data item that holds
//! the Message Router reply.
//!
//! # Message Router Reply
//!
//! | Component | Size | Description |
//! |-----------|------|-------------|
//! | Service | 1 byte | Request service code with bit 7 set |
//! | Reserved | 1 byte | Always 0x00 |
//! | Status | 1 byte | General status (0x00 = success) |
//! | Ext. size | 1 byte | Number of extended status words |
//! | Ext. status | 2 × size | Extended status words |
//! | Data | Variable | Service-specific reply data |
//!
//! # Example
//!
//! ```
//! use logix_cip::CipReply;
//!
//! let bytes = [0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
//! let reply = CipReply::parse(&bytes).unwrap();
//! assert_eq!(reply.service, 0xCC);
//! assert!(reply.is_success());
//! assert_eq!(reply.data, [0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00]);
//! ```

use crate::codec::Reader;
use crate::error::{CipError, Result};
use crate::header::{EncapsulationHeader, ENCAPSULATION_HEADER_SIZE};

/// CPF item: connected address.
pub const ITEM_CONNECTED_ADDRESS: u16 = 0xA1;
/// CPF item: connected data.
pub const ITEM_CONNECTED_DATA: u16 = 0xB1;
/// CPF item: unconnected data.
pub const ITEM_UNCONNECTED_DATA: u16 = 0xB2;
/// CPF item: List Identity response.
pub const ITEM_LIST_IDENTITY: u16 = 0x0C;

/// General status: success.
pub const STATUS_SUCCESS: u8 = 0x00;
/// General status: more data is available (fragmented transfer or paged upload).
pub const STATUS_PARTIAL: u8 = 0x06;
/// General status: one or more embedded services failed.
pub const STATUS_EMBEDDED_ERROR: u8 = 0x1E;

/// One item of a Common Packet Format list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    /// Item type id.
    pub type_id: u16,
    /// Item payload.
    pub data: Vec<u8>,
}

/// Parses the CPF item list that follows the interface handle and timeout.
pub fn parse_cpf(data: &[u8]) -> Result<Vec<CpfItem>> {
    let mut reader = Reader::new(data);
    let items = (|| -> Result<Vec<CpfItem>> {
        let count = reader.u16()?;
        (0..count)
            .map(|_| {
                let type_id = reader.u16()?;
                let len = reader.u16()? as usize;
                let data = reader.take(len)?.to_vec();
                Ok(CpfItem { type_id, data })
            })
            .collect()
    })();
    crate::codec::continued(items).map_err(|e| crate::codec::with_context(e, "CPF item list"))
}

/// Parsed Message Router reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    /// Reply service code (request service | 0x80).
    pub service: u8,
    /// General status.
    pub status: u8,
    /// Extended status words.
    pub extended: Vec<u16>,
    /// Reply data.
    pub data: Vec<u8>,
}

impl CipReply {
    /// Parses a Message Router reply.
    ///
    /// # Errors
    ///
    /// Returns `CipError::InvalidResponse` if the reply is truncated.
    pub fn parse(message: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(message);
        let parsed = (|| -> Result<Self> {
            let service = reader.u8()?;
            reader.skip(1)?;
            let status = reader.u8()?;
            let ext_len = reader.u8()? as usize;
            let extended = (0..ext_len)
                .map(|_| reader.u16())
                .collect::<Result<Vec<_>>>()?;
            Ok(Self {
                service,
                status,
                extended,
                data: reader.rest().to_vec(),
            })
        })();
        parsed.map_err(|e| match e {
            CipError::BufferEmpty => CipError::invalid_response(format!(
                "reply too short: {} bytes",
                message.len()
            )),
            other => crate::codec::with_context(other, "reply header"),
        })
    }

    /// Extracts and parses the Message Router reply carried by a Send RR Data or
    /// Send Unit Data frame.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Encapsulation` for a non-zero encapsulation status and
    /// `CipError::InvalidResponse` if the frame carries no data item.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let header = EncapsulationHeader::from_bytes(frame)?;
        header.check_status()?;
        let body = &frame[ENCAPSULATION_HEADER_SIZE..];
        if body.len() < 6 {
            return Err(CipError::invalid_response(format!(
                "encapsulated data too short: {} bytes",
                body.len()
            )));
        }
        // interface handle (4) + timeout (2)
        let items = parse_cpf(&body[6..])?;
        let item = items
            .into_iter()
            .find(|item| matches!(item.type_id, ITEM_CONNECTED_DATA | ITEM_UNCONNECTED_DATA))
            .ok_or_else(|| CipError::invalid_response("reply has no data item"))?;
        match item.type_id {
            // connected data starts with the sequence count
            ITEM_CONNECTED_DATA if item.data.len() >= 2 => Self::parse(&item.data[2..]),
            ITEM_CONNECTED_DATA => Err(CipError::invalid_response("connected data item too short")),
            _ => Self::parse(&item.data),
        }
    }

    /// Returns whether the general status is success.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Returns whether the status says more data follows.
    pub fn is_partial(&self) -> bool {
        self.status == STATUS_PARTIAL
    }

    /// Returns the first extended status word.
    pub fn extended_status(&self) -> Option<u16> {
        self.extended.first().copied()
    }

    /// Returns the status as an error.
    pub fn error(&self) -> CipError {
        CipError::status(self.status, self.extended_status())
    }

    /// Validates the status.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Status` unless the status is success.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::CipReply;
    ///
    /// let reply = CipReply::parse(&[0xCC, 0x00, 0x05, 0x00]).unwrap();
    /// assert!(reply.check_error().is_err());
    /// ```
    pub fn check_error(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Validates that this replies to the `request` service.
    ///
    /// # Errors
    ///
    /// Returns `CipError::InvalidResponse` on a mismatch.
    pub fn check_service(&self, request: u8) -> Result<()> {
        if self.service == request | 0x80 {
            Ok(())
        } else {
            Err(CipError::invalid_response(format!(
                "expected reply to service 0x{:02X}, got 0x{:02X}",
                request, self.service
            )))
        }
    }
}

/// Splits a Multiple Service Packet reply body into its sub-replies.
///
/// The body is a count, a table of offsets relative to the count field, and
/// the sub-replies themselves.
pub fn split_multi_service(data: &[u8]) -> Result<Vec<CipReply>> {
    let mut reader = Reader::new(data);
    let count = reader.u16().map_err(|_| CipError::invalid_response("empty multi-service reply"))?
        as usize;
    let offsets = (0..count)
        .map(|_| crate::codec::continued(reader.u16()).map(usize::from))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| crate::codec::with_context(e, "multi-service offset table"))?;

    offsets
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = offsets.get(i + 1).copied().unwrap_or(data.len());
            if start > end || end > data.len() {
                return Err(CipError::invalid_response(format!(
                    "multi-service offset {start}..{end} outside {} byte reply",
                    data.len()
                )));
            }
            CipReply::parse(&data[start..end])
        })
        .collect()
}

//! Device identity decoding.
//!
//! The same identity fields come back from two places: the encapsulation-level
//! List Identity command (which adds the encapsulation version, the device's
//! socket address and its state) and a Get Attributes All request to the
//! Identity object.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::codec::{DataType, Layout, PlcValue, Reader};
use crate::error::{CipError, Result};
use crate::header::{EncapsulationHeader, ENCAPSULATION_HEADER_SIZE};
use crate::response::{parse_cpf, ITEM_LIST_IDENTITY};

/// Firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Revision {
    /// Major revision.
    pub major: u8,
    /// Minor revision.
    pub minor: u8,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.major, self.minor)
    }
}

/// Identity object attributes of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Identity {
    /// Vendor id (1 = Rockwell Automation).
    pub vendor_id: u16,
    /// Device type (14 = programmable logic controller).
    pub device_type: u16,
    /// Product code.
    pub product_code: u16,
    /// Firmware revision.
    pub revision: Revision,
    /// Status word.
    pub status: u16,
    /// Serial number.
    pub serial: u32,
    /// Product name.
    pub product_name: String,
    /// Encapsulation protocol version (List Identity only).
    pub encapsulation_version: Option<u16>,
    /// Device socket address (List Identity only).
    pub socket_address: Option<SocketAddrV4>,
    /// Device state (List Identity only).
    pub state: Option<u8>,
}

fn identity_layout() -> Layout {
    Layout::structure([
        ("vendor_id", Layout::Elementary(DataType::Uint)),
        ("device_type", Layout::Elementary(DataType::Uint)),
        ("product_code", Layout::Elementary(DataType::Uint)),
        ("major", Layout::Elementary(DataType::Usint)),
        ("minor", Layout::Elementary(DataType::Usint)),
        ("status", Layout::Elementary(DataType::Word)),
        ("serial", Layout::Elementary(DataType::Udint)),
        ("product_name", Layout::Elementary(DataType::ShortString)),
    ])
}

fn field<T: TryFrom<i128>>(value: &PlcValue, name: &str) -> Result<T> {
    value
        .member(name)
        .and_then(PlcValue::as_i128)
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| CipError::invalid_response(format!("identity field '{name}' missing")))
}

impl Identity {
    /// Decodes a Get Attributes All reply from the Identity object.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::discovery::Identity;
    ///
    /// let mut data = vec![0x01, 0x00, 0x0E, 0x00, 0x5F, 0x00, 0x14, 0x0B, 0x60, 0x30];
    /// data.extend_from_slice(&0xC0FFEEu32.to_le_bytes());
    /// data.push(4);
    /// data.extend_from_slice(b"L85E");
    ///
    /// let identity = Identity::from_attributes_all(&data).unwrap();
    /// assert_eq!(identity.product_name, "L85E");
    /// assert_eq!(identity.revision.to_string(), "20.011");
    /// ```
    pub fn from_attributes_all(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let value = crate::codec::continued(identity_layout().decode(&mut reader))
            .map_err(|e| crate::codec::with_context(e, "identity"))?;
        Ok(Self {
            vendor_id: field(&value, "vendor_id")?,
            device_type: field(&value, "device_type")?,
            product_code: field(&value, "product_code")?,
            revision: Revision {
                major: field(&value, "major")?,
                minor: field(&value, "minor")?,
            },
            status: field(&value, "status")?,
            serial: field(&value, "serial")?,
            product_name: value
                .member("product_name")
                .and_then(PlcValue::as_str)
                .unwrap_or_default()
                .to_string(),
            ..Self::default()
        })
    }

    /// Decodes a complete List Identity reply frame.
    ///
    /// The item holds the encapsulation version, a big-endian `sockaddr_in`,
    /// the identity attributes and a trailing state byte.
    pub fn from_list_identity_reply(frame: &[u8]) -> Result<Self> {
        let header = EncapsulationHeader::from_bytes(frame)?;
        header.check_status()?;
        let items = parse_cpf(&frame[ENCAPSULATION_HEADER_SIZE..])?;
        let item = items
            .into_iter()
            .find(|item| item.type_id == ITEM_LIST_IDENTITY)
            .ok_or_else(|| CipError::invalid_response("List Identity reply has no identity item"))?;

        let mut reader = Reader::new(&item.data);
        let (version, address) = crate::codec::continued((|| -> Result<(u16, SocketAddrV4)> {
            let version = reader.u16()?;
            let sockaddr = reader.take(16)?;
            let port = u16::from_be_bytes([sockaddr[2], sockaddr[3]]);
            let ip = Ipv4Addr::new(sockaddr[4], sockaddr[5], sockaddr[6], sockaddr[7]);
            Ok((version, SocketAddrV4::new(ip, port)))
        })())
        .map_err(|e| crate::codec::with_context(e, "List Identity socket address"))?;

        let rest = reader.rest();
        let mut identity = Self::from_attributes_all(rest)?;
        // 14 attribute bytes, the name length, the name, then the state byte
        let name_end = rest.get(14).map(|&len| 15 + usize::from(len));
        identity.state = name_end.and_then(|end| rest.get(end)).copied();
        identity.encapsulation_version = Some(version);
        identity.socket_address = Some(address);
        Ok(identity)
    }

    /// Serial number as eight hex digits, the way controllers display it.
    pub fn serial_hex(&self) -> String {
        format!("{:08x}", self.serial)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rev {} serial {}",
            self.product_name,
            self.revision,
            self.serial_hex()
        )
    }
}

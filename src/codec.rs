//! Binary codec for CIP elementary data types and fixed-layout composites.
//!
//! Every elementary type is an entry in the [`DataType`] registry, which maps the
//! wire type code to its name, size and encode/decode functions. Composite layouts
//! (fixed-length arrays, unbounded sequences and fixed-layout structures) are
//! described with [`Layout`].
//!
//! All multi-byte numerics are little-endian.
//!
//! # Type Codes
//!
//! | Type | Code | Size | Type | Code | Size |
//! |------|------|------|------|------|------|
//! | BOOL | 0xC1 | 1 | REAL | 0xCA | 4 |
//! | SINT | 0xC2 | 1 | LREAL | 0xCB | 8 |
//! | INT | 0xC3 | 2 | STRING | 0xD0 | 2 + n |
//! | DINT | 0xC4 | 4 | BYTE | 0xD1 | 1 |
//! | LINT | 0xC5 | 8 | WORD | 0xD2 | 2 |
//! | USINT | 0xC6 | 1 | DWORD | 0xD3 | 4 |
//! | UINT | 0xC7 | 2 | LWORD | 0xD4 | 8 |
//! | UDINT | 0xC8 | 4 | STRING2 | 0xD5 | 2 + 2n |
//! | ULINT | 0xC9 | 8 | STRINGN | 0xD9 | 4 + cn |
//! | | | | SHORT_STRING | 0xDA | 1 + n |
//!
//! # Example
//!
//! ```
//! use logix_cip::{DataType, PlcValue, Reader};
//!
//! let bytes = DataType::Dint.encode(&PlcValue::Dint(-5)).unwrap();
//! assert_eq!(bytes, [0xFB, 0xFF, 0xFF, 0xFF]);
//!
//! let mut reader = Reader::new(&bytes);
//! assert_eq!(DataType::Dint.decode(&mut reader).unwrap(), PlcValue::Dint(-5));
//! ```

use crate::error::{CipError, Result};
use crate::utils::to_bits;

/// Elementary CIP data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DataType {
    /// Boolean, one byte on the wire.
    Bool,
    /// Signed 8-bit integer.
    Sint,
    /// Signed 16-bit integer.
    Int,
    /// Signed 32-bit integer.
    Dint,
    /// Signed 64-bit integer.
    Lint,
    /// Unsigned 8-bit integer.
    Usint,
    /// Unsigned 16-bit integer.
    Uint,
    /// Unsigned 32-bit integer.
    Udint,
    /// Unsigned 64-bit integer.
    Ulint,
    /// 32-bit float.
    Real,
    /// 64-bit float.
    Lreal,
    /// Latin-1 string with a 2-byte length prefix.
    String,
    /// 8-bit bit string.
    Byte,
    /// 16-bit bit string.
    Word,
    /// 32-bit bit string; Logix packs BOOL arrays into these.
    Dword,
    /// 64-bit bit string.
    Lword,
    /// UTF-16LE string with a 2-byte length prefix.
    String2,
    /// String with a 2-byte character size and a 2-byte length prefix.
    StringN,
    /// Latin-1 string with a 1-byte length prefix.
    ShortString,
}

impl DataType {
    /// Every registered type, in type-code order.
    pub const ALL: [DataType; 19] = [
        DataType::Bool,
        DataType::Sint,
        DataType::Int,
        DataType::Dint,
        DataType::Lint,
        DataType::Usint,
        DataType::Uint,
        DataType::Udint,
        DataType::Ulint,
        DataType::Real,
        DataType::Lreal,
        DataType::String,
        DataType::Byte,
        DataType::Word,
        DataType::Dword,
        DataType::Lword,
        DataType::String2,
        DataType::StringN,
        DataType::ShortString,
    ];

    /// Returns the CIP type code.
    pub fn code(self) -> u8 {
        match self {
            DataType::Bool => 0xC1,
            DataType::Sint => 0xC2,
            DataType::Int => 0xC3,
            DataType::Dint => 0xC4,
            DataType::Lint => 0xC5,
            DataType::Usint => 0xC6,
            DataType::Uint => 0xC7,
            DataType::Udint => 0xC8,
            DataType::Ulint => 0xC9,
            DataType::Real => 0xCA,
            DataType::Lreal => 0xCB,
            DataType::String => 0xD0,
            DataType::Byte => 0xD1,
            DataType::Word => 0xD2,
            DataType::Dword => 0xD3,
            DataType::Lword => 0xD4,
            DataType::String2 => 0xD5,
            DataType::StringN => 0xD9,
            DataType::ShortString => 0xDA,
        }
    }

    /// Looks up a type by its CIP type code.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::DataType;
    ///
    /// assert_eq!(DataType::from_code(0xC4), Some(DataType::Dint));
    /// assert_eq!(DataType::from_code(0x00), None);
    /// ```
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Looks up a type by its (case-insensitive) name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }

    /// Returns the type name as Logix spells it.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Sint => "SINT",
            DataType::Int => "INT",
            DataType::Dint => "DINT",
            DataType::Lint => "LINT",
            DataType::Usint => "USINT",
            DataType::Uint => "UINT",
            DataType::Udint => "UDINT",
            DataType::Ulint => "ULINT",
            DataType::Real => "REAL",
            DataType::Lreal => "LREAL",
            DataType::String => "STRING",
            DataType::Byte => "BYTE",
            DataType::Word => "WORD",
            DataType::Dword => "DWORD",
            DataType::Lword => "LWORD",
            DataType::String2 => "STRING2",
            DataType::StringN => "STRINGN",
            DataType::ShortString => "SHORT_STRING",
        }
    }

    /// Returns the encoded size in bytes, or `None` for variable-length strings.
    pub fn size(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Sint | DataType::Usint | DataType::Byte => Some(1),
            DataType::Int | DataType::Uint | DataType::Word => Some(2),
            DataType::Dint | DataType::Udint | DataType::Real | DataType::Dword => Some(4),
            DataType::Lint | DataType::Ulint | DataType::Lreal | DataType::Lword => Some(8),
            DataType::String | DataType::String2 | DataType::StringN | DataType::ShortString => {
                None
            }
        }
    }

    /// Returns the number of addressable bits for integer and bit-string types.
    ///
    /// This is the range a `.N` bit suffix may address.
    pub fn bit_width(self) -> Option<u32> {
        match self {
            DataType::Sint | DataType::Usint | DataType::Byte => Some(8),
            DataType::Int | DataType::Uint | DataType::Word => Some(16),
            DataType::Dint | DataType::Udint | DataType::Dword => Some(32),
            DataType::Lint | DataType::Ulint | DataType::Lword => Some(64),
            _ => None,
        }
    }

    /// Returns whether this is one of the string types.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            DataType::String | DataType::String2 | DataType::StringN | DataType::ShortString
        )
    }

    /// Encodes a value as this type.
    ///
    /// Integer values are accepted from any integer variant as long as they fit
    /// the target range; floats accept integers and the other float width.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Encode` if the value does not fit this type.
    pub fn encode(self, value: &PlcValue) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size().unwrap_or(8));
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    /// Encodes a value as this type, appending to `out`.
    pub fn encode_into(self, value: &PlcValue, out: &mut Vec<u8>) -> Result<()> {
        match self {
            DataType::Bool => {
                let flag = match value {
                    PlcValue::Bool(b) => *b,
                    other => integer_of(other, self)? != 0,
                };
                out.push(if flag { 0xFF } else { 0x00 });
            }
            DataType::Sint => out.extend_from_slice(&(checked::<i8>(value, self)?).to_le_bytes()),
            DataType::Int => out.extend_from_slice(&(checked::<i16>(value, self)?).to_le_bytes()),
            DataType::Dint => out.extend_from_slice(&(checked::<i32>(value, self)?).to_le_bytes()),
            DataType::Lint => out.extend_from_slice(&(checked::<i64>(value, self)?).to_le_bytes()),
            DataType::Usint | DataType::Byte => {
                out.extend_from_slice(&(checked::<u8>(value, self)?).to_le_bytes())
            }
            DataType::Uint | DataType::Word => {
                out.extend_from_slice(&(checked::<u16>(value, self)?).to_le_bytes())
            }
            DataType::Udint | DataType::Dword => {
                out.extend_from_slice(&(checked::<u32>(value, self)?).to_le_bytes())
            }
            DataType::Ulint | DataType::Lword => {
                out.extend_from_slice(&(checked::<u64>(value, self)?).to_le_bytes())
            }
            DataType::Real => out.extend_from_slice(&(float_of(value, self)? as f32).to_le_bytes()),
            DataType::Lreal => out.extend_from_slice(&float_of(value, self)?.to_le_bytes()),
            DataType::ShortString => {
                let bytes = latin1_encode(string_of(value, self)?)?;
                let len = u8::try_from(bytes.len()).map_err(|_| {
                    CipError::encode(format!("SHORT_STRING too long: {} bytes", bytes.len()))
                })?;
                out.push(len);
                out.extend_from_slice(&bytes);
            }
            DataType::String => {
                let bytes = latin1_encode(string_of(value, self)?)?;
                out.extend_from_slice(&length_u16(bytes.len(), self)?.to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            DataType::String2 => {
                let units: Vec<u16> = string_of(value, self)?.encode_utf16().collect();
                out.extend_from_slice(&length_u16(units.len(), self)?.to_le_bytes());
                for unit in units {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
            }
            DataType::StringN => {
                let text = string_of(value, self)?;
                if text.chars().all(|c| (c as u32) <= 0xFF) {
                    let bytes = latin1_encode(text)?;
                    out.extend_from_slice(&1u16.to_le_bytes());
                    out.extend_from_slice(&length_u16(bytes.len(), self)?.to_le_bytes());
                    out.extend_from_slice(&bytes);
                } else if text.chars().all(|c| (c as u32) <= 0xFFFF) {
                    let units: Vec<u16> = text.encode_utf16().collect();
                    out.extend_from_slice(&2u16.to_le_bytes());
                    out.extend_from_slice(&length_u16(units.len(), self)?.to_le_bytes());
                    for unit in units {
                        out.extend_from_slice(&unit.to_le_bytes());
                    }
                } else {
                    let chars: Vec<char> = text.chars().collect();
                    out.extend_from_slice(&4u16.to_le_bytes());
                    out.extend_from_slice(&length_u16(chars.len(), self)?.to_le_bytes());
                    for c in chars {
                        out.extend_from_slice(&(c as u32).to_le_bytes());
                    }
                }
            }
        }
        Ok(())
    }

    /// Decodes one value of this type from the reader.
    ///
    /// # Errors
    ///
    /// Returns `CipError::BufferEmpty` if the reader is exhausted before the first
    /// byte, or `CipError::InvalidResponse` (naming the type) if it ends mid-value.
    pub fn decode(self, reader: &mut Reader<'_>) -> Result<PlcValue> {
        self.decode_inner(reader)
            .map_err(|e| with_context(e, self.name()))
    }

    fn decode_inner(self, reader: &mut Reader<'_>) -> Result<PlcValue> {
        let value = match self {
            DataType::Bool => PlcValue::Bool(reader.u8()? != 0),
            DataType::Sint => PlcValue::Sint(reader.u8()? as i8),
            DataType::Int => PlcValue::Int(reader.u16()? as i16),
            DataType::Dint => PlcValue::Dint(reader.u32()? as i32),
            DataType::Lint => PlcValue::Lint(reader.u64()? as i64),
            DataType::Usint => PlcValue::Usint(reader.u8()?),
            DataType::Uint => PlcValue::Uint(reader.u16()?),
            DataType::Udint => PlcValue::Udint(reader.u32()?),
            DataType::Ulint => PlcValue::Ulint(reader.u64()?),
            DataType::Real => PlcValue::Real(f32::from_bits(reader.u32()?)),
            DataType::Lreal => PlcValue::Lreal(f64::from_bits(reader.u64()?)),
            DataType::Byte => PlcValue::Byte(reader.u8()?),
            DataType::Word => PlcValue::Word(reader.u16()?),
            DataType::Dword => PlcValue::Dword(reader.u32()?),
            DataType::Lword => PlcValue::Lword(reader.u64()?),
            DataType::ShortString => {
                let len = reader.u8()? as usize;
                PlcValue::String(latin1_decode(continued(reader.take(len))?))
            }
            DataType::String => {
                let len = reader.u16()? as usize;
                PlcValue::String(latin1_decode(continued(reader.take(len))?))
            }
            DataType::String2 => {
                let len = reader.u16()? as usize;
                let raw = continued(reader.take(len * 2))?;
                PlcValue::String(utf16_decode(raw)?)
            }
            DataType::StringN => {
                let char_size = reader.u16()? as usize;
                let len = continued(reader.u16())? as usize;
                let raw = continued(reader.take(len * char_size))?;
                let text = match char_size {
                    1 => latin1_decode(raw),
                    2 => utf16_decode(raw)?,
                    4 => utf32_decode(raw)?,
                    other => {
                        return Err(CipError::invalid_response(format!(
                            "unsupported character size {other}"
                        )))
                    }
                };
                PlcValue::String(text)
            }
        };
        Ok(value)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded (or to-be-encoded) controller value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PlcValue {
    /// BOOL.
    Bool(bool),
    /// SINT.
    Sint(i8),
    /// INT.
    Int(i16),
    /// DINT.
    Dint(i32),
    /// LINT.
    Lint(i64),
    /// USINT.
    Usint(u8),
    /// UINT.
    Uint(u16),
    /// UDINT.
    Udint(u32),
    /// ULINT.
    Ulint(u64),
    /// REAL.
    Real(f32),
    /// LREAL.
    Lreal(f64),
    /// BYTE bit string.
    Byte(u8),
    /// WORD bit string.
    Word(u16),
    /// DWORD bit string.
    Dword(u32),
    /// LWORD bit string.
    Lword(u64),
    /// Any of the string types.
    String(String),
    /// Homogeneous array of values.
    Array(Vec<PlcValue>),
    /// Structure members in declaration order.
    Struct(Vec<(String, PlcValue)>),
}

impl PlcValue {
    /// Returns the value as a signed integer if it is an integer, bit string or BOOL.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            PlcValue::Bool(b) => Some(b as i128),
            PlcValue::Sint(v) => Some(v as i128),
            PlcValue::Int(v) => Some(v as i128),
            PlcValue::Dint(v) => Some(v as i128),
            PlcValue::Lint(v) => Some(v as i128),
            PlcValue::Usint(v) | PlcValue::Byte(v) => Some(v as i128),
            PlcValue::Uint(v) | PlcValue::Word(v) => Some(v as i128),
            PlcValue::Udint(v) | PlcValue::Dword(v) => Some(v as i128),
            PlcValue::Ulint(v) | PlcValue::Lword(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Returns the value as a float if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            PlcValue::Real(v) => Some(v as f64),
            PlcValue::Lreal(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Returns the boolean for `Bool` values.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PlcValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the string for `String` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlcValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the bit view of a bit-string value, index 0 being the LSB.
    ///
    /// # Example
    ///
    /// ```
    /// use logix_cip::PlcValue;
    ///
    /// let bits = PlcValue::Byte(0b0000_0101).bits().unwrap();
    /// assert_eq!(bits.len(), 8);
    /// assert!(bits[0] && !bits[1] && bits[2]);
    /// ```
    pub fn bits(&self) -> Option<Vec<bool>> {
        match *self {
            PlcValue::Byte(v) => Some(to_bits(v as u64, 8)),
            PlcValue::Word(v) => Some(to_bits(v as u64, 16)),
            PlcValue::Dword(v) => Some(to_bits(v as u64, 32)),
            PlcValue::Lword(v) => Some(to_bits(v, 64)),
            _ => None,
        }
    }

    /// Looks up a structure member by name.
    pub fn member(&self, name: &str) -> Option<&PlcValue> {
        match self {
            PlcValue::Struct(members) => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

/// Byte cursor used by all decoders.
///
/// Reading from an exhausted buffer returns `CipError::BufferEmpty`, which
/// sequence decoders treat as a normal end; reading past the end from a
/// partially consumed buffer is a `CipError::InvalidResponse`.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns whether every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the unread bytes without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consumes `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n == 0 {
            return Ok(&[]);
        }
        let remaining = self.remaining();
        if remaining == 0 {
            return Err(CipError::BufferEmpty);
        }
        if remaining < n {
            return Err(CipError::invalid_response(format!(
                "need {} bytes at offset {}, only {} left",
                n, self.pos, remaining
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skips `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads a `u8`.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Reads a little-endian `u64`.
    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Composite layouts built from elementary types.
///
/// # Example
///
/// ```
/// use logix_cip::{DataType, Layout, PlcValue, Reader};
///
/// let layout = Layout::structure([
///     ("id", Layout::Elementary(DataType::Uint)),
///     ("values", Layout::array(Layout::Elementary(DataType::Sint), 2)),
/// ]);
/// let bytes = [0x01, 0x00, 0x05, 0xFF];
/// let value = layout.decode(&mut Reader::new(&bytes)).unwrap();
/// assert_eq!(value.member("id"), Some(&PlcValue::Uint(1)));
/// assert_eq!(layout.encode(&value).unwrap(), bytes);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Layout {
    /// A single elementary value.
    Elementary(DataType),
    /// A homogeneous array; `len: None` reads until the buffer is exhausted.
    Array {
        /// Element layout.
        element: Box<Layout>,
        /// Fixed element count, or `None` for an unbounded sequence.
        len: Option<usize>,
    },
    /// Members encoded in declaration order without padding.
    Struct(Vec<(String, Layout)>),
}

impl Layout {
    /// Fixed-length array of `len` elements.
    pub fn array(element: Layout, len: usize) -> Self {
        Layout::Array {
            element: Box::new(element),
            len: Some(len),
        }
    }

    /// Array that decodes elements until the buffer is exhausted.
    pub fn unbounded(element: Layout) -> Self {
        Layout::Array {
            element: Box::new(element),
            len: None,
        }
    }

    /// Fixed-layout structure.
    pub fn structure<'n>(members: impl IntoIterator<Item = (&'n str, Layout)>) -> Self {
        Layout::Struct(
            members
                .into_iter()
                .map(|(name, layout)| (name.to_string(), layout))
                .collect(),
        )
    }

    /// Returns the encoded size when it is fixed.
    pub fn size(&self) -> Option<usize> {
        match self {
            Layout::Elementary(t) => t.size(),
            Layout::Array { element, len } => Some(element.size()? * (*len)?),
            Layout::Struct(members) => members.iter().map(|(_, m)| m.size()).sum(),
        }
    }

    /// Encodes a value with this layout.
    pub fn encode(&self, value: &PlcValue) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(value, &mut out)?;
        Ok(out)
    }

    /// Encodes a value with this layout, appending to `out`.
    pub fn encode_into(&self, value: &PlcValue, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Layout::Elementary(t) => t.encode_into(value, out),
            Layout::Array { element, len } => {
                let PlcValue::Array(items) = value else {
                    return Err(CipError::encode("expected an array value"));
                };
                if let Some(len) = len {
                    if items.len() != *len {
                        return Err(CipError::encode(format!(
                            "expected {} elements, got {}",
                            len,
                            items.len()
                        )));
                    }
                }
                items.iter().try_for_each(|item| element.encode_into(item, out))
            }
            Layout::Struct(members) => {
                for (name, layout) in members {
                    let member = value
                        .member(name)
                        .ok_or_else(|| CipError::encode(format!("missing member '{name}'")))?;
                    layout.encode_into(member, out)?;
                }
                Ok(())
            }
        }
    }

    /// Decodes a value with this layout.
    pub fn decode(&self, reader: &mut Reader<'_>) -> Result<PlcValue> {
        match self {
            Layout::Elementary(t) => t.decode(reader),
            Layout::Array { element, len: None } => {
                ArrayIter::new(reader, element).collect::<Result<Vec<_>>>().map(PlcValue::Array)
            }
            Layout::Array {
                element,
                len: Some(len),
            } => {
                let mut items = Vec::with_capacity(*len);
                for i in 0..*len {
                    let item = element.decode(reader);
                    items.push(if i == 0 { item? } else { continued(item)? });
                }
                Ok(PlcValue::Array(items))
            }
            Layout::Struct(members) => {
                let mut values = Vec::with_capacity(members.len());
                for (i, (name, layout)) in members.iter().enumerate() {
                    let value = layout.decode(reader);
                    let value = if i == 0 { value } else { continued(value) };
                    let value = value.map_err(|e| with_context(e, name))?;
                    values.push((name.clone(), value));
                }
                Ok(PlcValue::Struct(values))
            }
        }
    }
}

/// Lazily decodes elements until the underlying buffer is exhausted.
///
/// Exhaustion at an element boundary ends the iteration normally; a truncated
/// element yields one error and then ends.
#[derive(Debug)]
pub struct ArrayIter<'r, 'a> {
    reader: &'r mut Reader<'a>,
    element: &'r Layout,
    done: bool,
}

impl<'r, 'a> ArrayIter<'r, 'a> {
    /// Creates an iterator decoding `element` values from `reader`.
    pub fn new(reader: &'r mut Reader<'a>, element: &'r Layout) -> Self {
        Self {
            reader,
            element,
            done: false,
        }
    }
}

impl Iterator for ArrayIter<'_, '_> {
    type Item = Result<PlcValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.element.decode(self.reader) {
            Ok(value) => Some(Ok(value)),
            Err(CipError::BufferEmpty) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Turns a `BufferEmpty` raised mid-value into a truncation error.
pub(crate) fn continued<T>(result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        CipError::BufferEmpty => CipError::invalid_response("buffer ended mid-value"),
        other => other,
    })
}

pub(crate) fn with_context(err: CipError, what: &str) -> CipError {
    match err {
        CipError::InvalidResponse { reason } => {
            CipError::invalid_response(format!("decoding {what}: {reason}"))
        }
        other => other,
    }
}

fn integer_of(value: &PlcValue, target: DataType) -> Result<i128> {
    value.as_i128().ok_or_else(|| {
        CipError::encode(format!("{} requires an integer value, got {:?}", target, value))
    })
}

fn checked<T: TryFrom<i128>>(value: &PlcValue, target: DataType) -> Result<T> {
    let v = integer_of(value, target)?;
    T::try_from(v).map_err(|_| CipError::encode(format!("{v} is out of range for {target}")))
}

fn float_of(value: &PlcValue, target: DataType) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        CipError::encode(format!("{} requires a numeric value, got {:?}", target, value))
    })
}

fn string_of(value: &PlcValue, target: DataType) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| CipError::encode(format!("{} requires a string value", target)))
}

fn length_u16(len: usize, target: DataType) -> Result<u16> {
    u16::try_from(len).map_err(|_| CipError::encode(format!("{target} too long: {len}")))
}

pub(crate) fn latin1_encode(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            u8::try_from(c as u32)
                .map_err(|_| CipError::encode(format!("character {c:?} is not Latin-1")))
        })
        .collect()
}

pub(crate) fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf16_decode(raw: &[u8]) -> Result<String> {
    let units = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|e| CipError::invalid_response(format!("invalid UTF-16: {e}")))
}

fn utf32_decode(raw: &[u8]) -> Result<String> {
    raw.chunks_exact(4)
        .map(|quad| {
            let code = u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
            char::from_u32(code)
                .ok_or_else(|| CipError::invalid_response(format!("invalid UTF-32 code {code:#X}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::from_bits;

    fn roundtrip(t: DataType, value: PlcValue) {
        let bytes = t.encode(&value).unwrap();
        if let Some(size) = t.size() {
            assert_eq!(bytes.len(), size, "{t} size");
        }
        let mut reader = Reader::new(&bytes);
        assert_eq!(t.decode(&mut reader).unwrap(), value, "{t} roundtrip");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_integer_roundtrip_extremes() {
        roundtrip(DataType::Sint, PlcValue::Sint(i8::MIN));
        roundtrip(DataType::Sint, PlcValue::Sint(i8::MAX));
        roundtrip(DataType::Int, PlcValue::Int(i16::MIN));
        roundtrip(DataType::Int, PlcValue::Int(i16::MAX));
        roundtrip(DataType::Dint, PlcValue::Dint(i32::MIN));
        roundtrip(DataType::Dint, PlcValue::Dint(i32::MAX));
        roundtrip(DataType::Lint, PlcValue::Lint(i64::MIN));
        roundtrip(DataType::Lint, PlcValue::Lint(i64::MAX));
        roundtrip(DataType::Usint, PlcValue::Usint(u8::MAX));
        roundtrip(DataType::Uint, PlcValue::Uint(u16::MAX));
        roundtrip(DataType::Udint, PlcValue::Udint(u32::MAX));
        roundtrip(DataType::Ulint, PlcValue::Ulint(u64::MAX));
        roundtrip(DataType::Usint, PlcValue::Usint(0));
    }

    #[test]
    fn test_float_roundtrip() {
        roundtrip(DataType::Real, PlcValue::Real(f32::MAX));
        roundtrip(DataType::Real, PlcValue::Real(-1.5));
        roundtrip(DataType::Lreal, PlcValue::Lreal(f64::MIN_POSITIVE));
        roundtrip(DataType::Lreal, PlcValue::Lreal(core::f64::consts::PI));
    }

    #[test]
    fn test_bool_encoding() {
        assert_eq!(DataType::Bool.encode(&PlcValue::Bool(true)).unwrap(), [0xFF]);
        assert_eq!(DataType::Bool.encode(&PlcValue::Bool(false)).unwrap(), [0x00]);
        let mut reader = Reader::new(&[0x01]);
        assert_eq!(DataType::Bool.decode(&mut reader).unwrap(), PlcValue::Bool(true));
    }

    #[test]
    fn test_little_endian() {
        assert_eq!(
            DataType::Udint.encode(&PlcValue::Udint(0x1234_5678)).unwrap(),
            [0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_integer_coercion_and_range() {
        assert_eq!(DataType::Int.encode(&PlcValue::Dint(300)).unwrap(), [0x2C, 0x01]);
        assert!(matches!(
            DataType::Sint.encode(&PlcValue::Dint(300)),
            Err(CipError::Encode { .. })
        ));
        assert!(DataType::Dint.encode(&PlcValue::String("x".into())).is_err());
    }

    #[test]
    fn test_bit_string_roundtrip() {
        roundtrip(DataType::Byte, PlcValue::Byte(0xA5));
        roundtrip(DataType::Word, PlcValue::Word(0x8001));
        roundtrip(DataType::Dword, PlcValue::Dword(u32::MAX));
        roundtrip(DataType::Lword, PlcValue::Lword(1 << 63));
    }

    #[test]
    fn test_bits_symmetry() {
        let samples = [0u64, 1, u32::MAX as u64]
            .into_iter()
            .chain((0..32).map(|i| 1u64 << i));
        for v in samples {
            let bits = PlcValue::Dword(v as u32).bits().unwrap();
            assert_eq!(bits.len(), 32);
            assert_eq!(from_bits(&bits), v);
        }
    }

    #[test]
    fn test_short_string_roundtrip() {
        roundtrip(DataType::ShortString, PlcValue::String(String::new()));
        roundtrip(DataType::ShortString, PlcValue::String("é".repeat(255)));
        assert!(DataType::ShortString
            .encode(&PlcValue::String("a".repeat(256)))
            .is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        roundtrip(DataType::String, PlcValue::String(String::new()));
        roundtrip(DataType::String, PlcValue::String("x".repeat(65535)));
        assert!(DataType::String.encode(&PlcValue::String("€".into())).is_err());
    }

    #[test]
    fn test_string2_roundtrip() {
        roundtrip(DataType::String2, PlcValue::String(String::new()));
        roundtrip(DataType::String2, PlcValue::String("温度 €".into()));
        roundtrip(DataType::String2, PlcValue::String("z".repeat(65535)));
    }

    #[test]
    fn test_stringn_selects_char_size() {
        let latin = DataType::StringN.encode(&PlcValue::String("ab".into())).unwrap();
        assert_eq!(&latin[..4], [0x01, 0x00, 0x02, 0x00]);
        let wide = DataType::StringN.encode(&PlcValue::String("€".into())).unwrap();
        assert_eq!(&wide[..2], [0x02, 0x00]);
        let astral = DataType::StringN.encode(&PlcValue::String("🦀".into())).unwrap();
        assert_eq!(&astral[..2], [0x04, 0x00]);
        roundtrip(DataType::StringN, PlcValue::String(String::new()));
        roundtrip(DataType::StringN, PlcValue::String("🦀 ok".into()));
        roundtrip(DataType::StringN, PlcValue::String("€uro".into()));
    }

    #[test]
    fn test_buffer_empty_is_distinct() {
        let mut reader = Reader::new(&[]);
        assert!(matches!(
            DataType::Dint.decode(&mut reader),
            Err(CipError::BufferEmpty)
        ));

        let mut reader = Reader::new(&[0x01, 0x02]);
        let err = DataType::Dint.decode(&mut reader).unwrap_err();
        assert!(matches!(err, CipError::InvalidResponse { .. }));
        assert!(err.to_string().contains("DINT"));
    }

    #[test]
    fn test_truncated_string_is_not_buffer_empty() {
        let mut reader = Reader::new(&[0x03]);
        assert!(matches!(
            DataType::ShortString.decode(&mut reader),
            Err(CipError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_unbounded_array_stops_at_end() {
        let layout = Layout::unbounded(Layout::Elementary(DataType::Int));
        let bytes = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00];
        let value = layout.decode(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(
            value,
            PlcValue::Array(vec![PlcValue::Int(1), PlcValue::Int(2), PlcValue::Int(3)])
        );
    }

    #[test]
    fn test_array_iter_reports_partial_element() {
        let element = Layout::Elementary(DataType::Int);
        let bytes = [0x01, 0x00, 0x02];
        let mut reader = Reader::new(&bytes);
        let items: Vec<_> = ArrayIter::new(&mut reader, &element).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[test]
    fn test_fixed_array_roundtrip() {
        let layout = Layout::array(Layout::Elementary(DataType::Dint), 3);
        let value = PlcValue::Array(vec![PlcValue::Dint(5), PlcValue::Dint(6), PlcValue::Dint(7)]);
        let bytes = layout.encode(&value).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(layout.size(), Some(12));
        assert_eq!(layout.decode(&mut Reader::new(&bytes)).unwrap(), value);
        assert!(layout.encode(&PlcValue::Array(vec![PlcValue::Dint(1)])).is_err());
    }

    #[test]
    fn test_struct_truncated_member_is_error() {
        let layout = Layout::structure([
            ("a", Layout::Elementary(DataType::Usint)),
            ("b", Layout::Elementary(DataType::Uint)),
        ]);
        let err = layout.decode(&mut Reader::new(&[0x01])).unwrap_err();
        assert!(matches!(err, CipError::InvalidResponse { .. }));
    }

    #[test]
    fn test_unbounded_struct_array_partial_trailer_is_error() {
        let layout = Layout::unbounded(Layout::structure([
            ("a", Layout::Elementary(DataType::Uint)),
            ("b", Layout::Elementary(DataType::Uint)),
        ]));
        let bytes = hex::decode("010002000300").unwrap();
        let err = layout.decode(&mut Reader::new(&bytes)).unwrap_err();
        assert!(matches!(err, CipError::InvalidResponse { .. }));

        let whole = hex::decode("0100020003000400").unwrap();
        let PlcValue::Array(items) = layout.decode(&mut Reader::new(&whole)).unwrap() else {
            panic!("expected an array");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_from_code_covers_registry() {
        for t in DataType::ALL {
            assert_eq!(DataType::from_code(t.code()), Some(t));
            assert_eq!(DataType::from_name(t.name()), Some(t));
        }
    }
}

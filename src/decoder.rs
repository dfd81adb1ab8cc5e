//! Read reply decoding and fragment reassembly.
//!
//! A read reply starts with a type header: `A0 02 hh hh` for structures (the
//! value is then laid out as the structure's template describes) or a two-byte
//! elementary type code followed by densely packed elements.

use log::debug;

use crate::codec::{continued, latin1_decode, with_context, DataType, Layout, PlcValue, Reader};
use crate::command::TypeCode;
use crate::error::{CipError, Result};
use crate::response::{
    split_multi_service, CipReply, STATUS_EMBEDDED_ERROR, STATUS_PARTIAL, STATUS_SUCCESS,
};
use crate::symbols::{SymbolCache, TagInfo, TagKind, TypeTemplate};
use crate::tag::TagAddress;
use crate::utils::{get_bit, to_bits};

/// Decodes the data of a Read Tag reply (type header included) for `address`.
///
/// # Example
///
/// ```
/// use logix_cip::symbols::{SymbolCache, TagInfo, TagKind};
/// use logix_cip::{decoder, DataType, PlcValue, TagAddress};
///
/// let mut symbols = SymbolCache::new();
/// symbols.insert_tag(None, TagInfo::new("Count", TagKind::Atomic(DataType::Int)));
/// let address = TagAddress::parse("Count", &symbols).unwrap();
///
/// let value = decoder::decode_read(&address, &[0xC3, 0x00, 0x2A, 0x00], &symbols).unwrap();
/// assert_eq!(value, PlcValue::Int(42));
/// ```
pub fn decode_read(address: &TagAddress, data: &[u8], symbols: &SymbolCache) -> Result<PlcValue> {
    let header = TypeCode::parse(data)?;
    let body = &data[header.encoded_len()..];
    let elements = address.elements as usize;

    let mut values = match header {
        TypeCode::Structure(handle) => {
            let template = address
                .target
                .template_id()
                .and_then(|id| symbols.template(id))
                .ok_or_else(|| {
                    CipError::invalid_response(format!(
                        "structure reply (handle 0x{handle:04X}) for {}",
                        address.text
                    ))
                })?;
            let size = template.structure_size as usize;
            if size == 0 || body.len() < size * elements {
                return Err(CipError::invalid_response(format!(
                    "{} needs {} bytes, reply has {}",
                    address.text,
                    size * elements,
                    body.len()
                )));
            }
            body.chunks_exact(size)
                .take(elements)
                .map(|chunk| decode_struct(template, chunk, symbols))
                .collect::<Result<Vec<_>>>()?
        }
        TypeCode::Elementary(code) => {
            let data_type = DataType::from_code(code).ok_or_else(|| {
                CipError::invalid_response(format!(
                    "unknown type code 0x{code:02X} for {}",
                    address.text
                ))
            })?;
            let mut reader = Reader::new(body);
            (0..elements)
                .map(|_| continued(data_type.decode(&mut reader)))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| with_context(e, &address.text))?
        }
    };

    if address.is_bool_array() {
        let bits: Vec<bool> = values
            .iter()
            .filter_map(|word| word.as_i128())
            .flat_map(|word| to_bits(word as u64, 32))
            .collect();
        let start = address.bit.unwrap_or_default() as usize;
        let count = address.bit_count.unwrap_or(1) as usize;
        let selected = bits.get(start..start + count).ok_or_else(|| {
            CipError::invalid_response(format!("{} bits missing from reply", address.text))
        })?;
        return Ok(match address.bit_count {
            Some(n) if n > 1 => {
                PlcValue::Array(selected.iter().copied().map(PlcValue::Bool).collect())
            }
            _ => PlcValue::Bool(selected[0]),
        });
    }

    if let (true, Some(bit)) = (address.is_bit(), address.bit) {
        let host = values
            .first()
            .and_then(PlcValue::as_i128)
            .ok_or_else(|| {
                CipError::invalid_response(format!("{} is not an integer", address.text))
            })?;
        return Ok(PlcValue::Bool(get_bit(host as u64, bit)));
    }

    Ok(match values.len() {
        1 => values.remove(0),
        _ => PlcValue::Array(values),
    })
}

/// Decodes one structure instance from exactly `bytes`.
///
/// Hidden members are skipped; string templates decode to a `String`.
pub fn decode_struct(
    template: &TypeTemplate,
    bytes: &[u8],
    symbols: &SymbolCache,
) -> Result<PlcValue> {
    if template.is_string {
        return decode_logix_string(template, bytes);
    }
    template
        .public_members()
        .map(|(name, info)| {
            decode_member(info, bytes, symbols)
                .map(|value| (name.clone(), value))
                .map_err(|e| with_context(e, &format!("{}.{name}", template.name)))
        })
        .collect::<Result<Vec<_>>>()
        .map(PlcValue::Struct)
}

fn decode_logix_string(template: &TypeTemplate, bytes: &[u8]) -> Result<PlcValue> {
    let (len, data) = match (template.member("LEN"), template.member("DATA")) {
        (Some(len), Some(data)) => (len, data),
        _ => return Err(CipError::invalid_response(format!("{} is not a string", template.name))),
    };
    let length = bytes
        .get(len.offset as usize..)
        .map(Reader::new)
        .ok_or_else(|| CipError::invalid_response("string length outside structure"))
        .and_then(|mut reader| {
            let data_type = len.data_type().unwrap_or(DataType::Dint);
            continued(data_type.decode(&mut reader))
        })?
        .as_i128()
        .unwrap_or_default()
        .clamp(0, template.string_capacity().unwrap_or_default() as i128) as usize;
    let start = data.offset as usize;
    let chars = bytes.get(start..start + length).ok_or_else(|| {
        CipError::invalid_response(format!(
            "{} data shorter than its length {length}",
            template.name
        ))
    })?;
    Ok(PlcValue::String(latin1_decode(chars)))
}

fn decode_member(info: &TagInfo, bytes: &[u8], symbols: &SymbolCache) -> Result<PlcValue> {
    let offset = info.offset as usize;
    let slice = bytes
        .get(offset..)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            CipError::invalid_response(format!("offset {offset} outside the structure"))
        })?;
    let count = info.element_count() as usize;

    match info.kind {
        TagKind::Atomic(DataType::Bool) => Ok(PlcValue::Bool(get_bit(
            slice[0] as u64,
            info.bit.unwrap_or_default() as u32,
        ))),
        _ if info.is_bool_array() => {
            let mut reader = Reader::new(slice);
            let mut bits = Vec::with_capacity(count * 32);
            for _ in 0..count {
                let word = continued(reader.u32())?;
                bits.extend(to_bits(word as u64, 32).into_iter().map(PlcValue::Bool));
            }
            Ok(PlcValue::Array(bits))
        }
        TagKind::Atomic(data_type) => {
            let layout = match info.is_array() {
                true => Layout::array(Layout::Elementary(data_type), count),
                false => Layout::Elementary(data_type),
            };
            continued(layout.decode(&mut Reader::new(slice)))
        }
        TagKind::Struct(id) => {
            let nested = symbols
                .template(id)
                .ok_or_else(|| CipError::invalid_response(format!("template {id} is not cached")))?;
            let size = nested.structure_size as usize;
            let decode_at = |i: usize| {
                slice
                    .get(i * size..(i + 1) * size)
                    .ok_or_else(|| {
                        CipError::invalid_response(format!(
                            "{} overruns the structure",
                            nested.name
                        ))
                    })
                    .and_then(|chunk| decode_struct(nested, chunk, symbols))
            };
            if info.is_array() {
                (0..count).map(decode_at).collect::<Result<Vec<_>>>().map(PlcValue::Array)
            } else {
                decode_at(0)
            }
        }
    }
}

/// Splits a Multiple Service Packet reply into its sub-replies.
///
/// A general status of 0x1E only says some embedded service failed, so the
/// table is still decoded and each sub-reply keeps its own status.
pub fn multi_service_replies(reply: &CipReply) -> Result<Vec<CipReply>> {
    match reply.status {
        STATUS_SUCCESS | STATUS_EMBEDDED_ERROR => split_multi_service(&reply.data),
        _ => Err(reply.error()),
    }
}

/// Reassembly state of a fragmented read.
///
/// Every fragment repeats the type header; only the bytes after it count
/// toward the offset of the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentState {
    /// Offset for the next Read Tag Fragmented request.
    pub offset: u32,
    /// Type header of the first fragment.
    pub header: Option<TypeCode>,
    /// Payload bytes received so far.
    pub accumulated: Vec<u8>,
}

impl FragmentState {
    /// Creates a state for a transfer starting at offset 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fragment reply. Returns `true` once the transfer is complete.
    ///
    /// # Errors
    ///
    /// Any status other than success or partial transfer aborts the read with
    /// that status; a partial reply without payload is an invalid response.
    pub fn accept(&mut self, reply: &CipReply) -> Result<bool> {
        if !matches!(reply.status, STATUS_SUCCESS | STATUS_PARTIAL) {
            return Err(reply.error());
        }
        let header = TypeCode::parse(&reply.data)?;
        match self.header {
            Some(first) if first != header => {
                return Err(CipError::invalid_response(format!(
                    "fragment type changed from {first:?} to {header:?}"
                )))
            }
            _ => self.header = Some(header),
        }
        let payload = &reply.data[header.encoded_len()..];
        if reply.status == STATUS_PARTIAL && payload.is_empty() {
            return Err(CipError::invalid_response("partial fragment without data"));
        }
        self.accumulated.extend_from_slice(payload);
        self.offset += payload.len() as u32;
        debug!(
            "fragment of {} bytes, offset now {} (status 0x{:02X})",
            payload.len(),
            self.offset,
            reply.status
        );
        Ok(reply.status == STATUS_SUCCESS)
    }

    /// Returns the reassembled reply data, type header first.
    pub fn into_data(self) -> Result<Vec<u8>> {
        let header = self
            .header
            .ok_or_else(|| CipError::invalid_response("no fragment received"))?;
        let mut data = Vec::with_capacity(header.encoded_len() + self.accumulated.len());
        header.encode_into(&mut data);
        data.extend_from_slice(&self.accumulated);
        Ok(data)
    }
}

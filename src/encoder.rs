//! Write value encoding.
//!
//! Turns a caller's [`PlcValue`] into what goes on the wire for a resolved
//! [`TagAddress`]: a type header plus packed element bytes, or a list of
//! single-bit changes that the planner folds into Read Modify Write masks.

use crate::codec::{latin1_encode, DataType, PlcValue};
use crate::command::TypeCode;
use crate::error::{CipError, Result};
use crate::path::encode_path;
use crate::symbols::{SymbolCache, TagInfo, TagKind, TypeTemplate};
use crate::tag::{PathStep, TagAddress};
use crate::utils::set_bit;

/// One bit to set or clear inside a host element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitWrite {
    /// Encoded path of the host element.
    pub path: Vec<u8>,
    /// Host element size in bytes (mask length).
    pub width: usize,
    /// Bit within the host element.
    pub bit: u32,
    /// New state.
    pub state: bool,
}

/// Encoded form of one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedWrite {
    /// Whole elements written with Write Tag.
    Value {
        /// Type header.
        type_code: TypeCode,
        /// Element count.
        elements: u16,
        /// Size of one element in bytes.
        element_size: usize,
        /// Packed element bytes.
        data: Vec<u8>,
    },
    /// Individual bits, applied with Read Modify Write.
    Bits(Vec<BitWrite>),
}

/// Encodes `value` for writing to `address`.
///
/// # Errors
///
/// Returns `CipError::Encode` when the value does not match the tag's type or
/// element count.
pub fn encode_write(
    address: &TagAddress,
    value: &PlcValue,
    symbols: &SymbolCache,
) -> Result<EncodedWrite> {
    if address.is_bool_array() {
        return encode_bool_range(address, value);
    }
    if address.is_bit() {
        let width = address
            .target
            .data_type()
            .and_then(DataType::size)
            .ok_or_else(|| CipError::encode(format!("{} has no bits", address.text)))?;
        return Ok(EncodedWrite::Bits(vec![BitWrite {
            path: address.request_path()?,
            width,
            bit: address.bit.unwrap_or_default(),
            state: truthy(value)?,
        }]));
    }

    let elements = address.elements as usize;
    let items: Vec<&PlcValue> = match value {
        PlcValue::Array(items) if items.len() == elements => items.iter().collect(),
        PlcValue::Array(items) => {
            return Err(CipError::encode(format!(
                "{} expects {} elements, got {}",
                address.text,
                elements,
                items.len()
            )))
        }
        single if elements == 1 => vec![single],
        _ => {
            return Err(CipError::encode(format!(
                "{} expects an array of {} elements",
                address.text, elements
            )))
        }
    };

    match address.target.kind {
        TagKind::Atomic(data_type) => {
            let element_size = data_type
                .size()
                .ok_or_else(|| CipError::encode(format!("cannot write {data_type} elements")))?;
            let mut data = Vec::with_capacity(element_size * elements);
            for item in items {
                data_type.encode_into(item, &mut data)?;
            }
            Ok(EncodedWrite::Value {
                type_code: TypeCode::Elementary(data_type.code()),
                elements: address.elements,
                element_size,
                data,
            })
        }
        TagKind::Struct(id) => {
            let template = template(symbols, id)?;
            let element_size = template.structure_size as usize;
            if element_size == 0 {
                return Err(CipError::encode(format!(
                    "template '{}' reports a zero structure size",
                    template.name
                )));
            }
            let mut data = vec![0u8; element_size * elements];
            for (item, chunk) in items.into_iter().zip(data.chunks_exact_mut(element_size)) {
                encode_struct(template, item, symbols, chunk)?;
            }
            Ok(EncodedWrite::Value {
                type_code: TypeCode::Structure(template.handle),
                elements: address.elements,
                element_size,
                data,
            })
        }
    }
}

fn template(symbols: &SymbolCache, id: u16) -> Result<&TypeTemplate> {
    symbols
        .template(id)
        .ok_or_else(|| CipError::encode(format!("template {id} is not cached")))
}

fn truthy(value: &PlcValue) -> Result<bool> {
    match value {
        PlcValue::Bool(b) => Ok(*b),
        other => other
            .as_i128()
            .map(|v| v != 0)
            .ok_or_else(|| CipError::encode(format!("expected a boolean, got {other:?}"))),
    }
}

/// Splits a BOOL array write into per-DWORD bit changes.
fn encode_bool_range(address: &TagAddress, value: &PlcValue) -> Result<EncodedWrite> {
    let states: Vec<bool> = match (address.bit_count, value) {
        (Some(count), PlcValue::Array(items)) if items.len() == count as usize => {
            items.iter().map(truthy).collect::<Result<_>>()?
        }
        (Some(1) | None, single) if !matches!(single, PlcValue::Array(_)) => vec![truthy(single)?],
        (count, _) => {
            return Err(CipError::encode(format!(
                "{} expects {} booleans",
                address.text,
                count.unwrap_or(1)
            )))
        }
    };

    let mut steps = address.steps.clone();
    let first_word = match steps.last() {
        Some(PathStep::Index(indices)) => indices.first().copied().unwrap_or_default(),
        _ => {
            steps.push(PathStep::Index(vec![0]));
            0
        }
    };
    let first_bit = address.bit.unwrap_or_default();

    let mut writes = Vec::with_capacity(states.len());
    for (i, state) in states.into_iter().enumerate() {
        let absolute = first_bit + i as u32;
        if let Some(PathStep::Index(indices)) = steps.last_mut() {
            *indices = vec![first_word + absolute / 32];
        }
        let mut word = address.clone();
        word.steps = steps.clone();
        writes.push(BitWrite {
            path: encode_path(&word.segments(), true)?,
            width: 4,
            bit: absolute % 32,
            state,
        });
    }
    Ok(EncodedWrite::Bits(writes))
}

/// Encodes a Logix string structure: DINT length then the padded character array.
fn encode_logix_string(template: &TypeTemplate, text: &str, out: &mut [u8]) -> Result<()> {
    let capacity = template.string_capacity().unwrap_or_default() as usize;
    let bytes = latin1_encode(text)?;
    if bytes.len() > capacity {
        return Err(CipError::encode(format!(
            "string of {} characters exceeds {} capacity {}",
            bytes.len(),
            template.name,
            capacity
        )));
    }
    let len = template.member("LEN").map_or(0, |m| m.offset as usize);
    let data = template.member("DATA").map_or(4, |m| m.offset as usize);
    put(out, len, &(bytes.len() as u32).to_le_bytes())?;
    put(out, data, &bytes)
}

fn put(out: &mut [u8], at: usize, bytes: &[u8]) -> Result<()> {
    out.get_mut(at..at + bytes.len())
        .ok_or_else(|| CipError::encode(format!("member at offset {at} overruns the structure")))?
        .copy_from_slice(bytes);
    Ok(())
}

/// Encodes one structure value into `out`, which is exactly one structure long.
fn encode_struct(
    template: &TypeTemplate,
    value: &PlcValue,
    symbols: &SymbolCache,
    out: &mut [u8],
) -> Result<()> {
    if template.is_string {
        let text = value
            .as_str()
            .ok_or_else(|| CipError::encode(format!("{} requires a string value", template.name)))?;
        return encode_logix_string(template, text, out);
    }
    for (name, info) in template.public_members() {
        let member = value
            .member(name)
            .ok_or_else(|| {
                CipError::encode(format!("missing member '{name}' of {}", template.name))
            })?;
        encode_member(info, member, symbols, out)
            .map_err(|e| match e {
                CipError::Encode { reason } => CipError::encode(format!("{name}: {reason}")),
                other => other,
            })?;
    }
    Ok(())
}

fn encode_member(
    info: &TagInfo,
    value: &PlcValue,
    symbols: &SymbolCache,
    out: &mut [u8],
) -> Result<()> {
    let offset = info.offset as usize;
    match info.kind {
        TagKind::Atomic(DataType::Bool) => {
            let host = out
                .get_mut(offset)
                .ok_or_else(|| {
                    CipError::encode(format!("BOOL host at offset {offset} overruns the structure"))
                })?;
            let bit = info.bit.unwrap_or_default() as u32;
            *host = set_bit(*host as u64, bit, truthy(value)?) as u8;
            Ok(())
        }
        _ if info.is_bool_array() => {
            let bits = array_items(info, value, info.element_count() as usize * 32)?;
            let mut words = vec![0u8; bits.len() / 8];
            for (i, bit) in bits.into_iter().enumerate() {
                if truthy(bit)? {
                    words[i / 8] |= 1 << (i % 8);
                }
            }
            put(out, offset, &words)
        }
        TagKind::Atomic(data_type) => {
            if !info.is_array() {
                return put(out, offset, &data_type.encode(value)?);
            }
            let mut data = Vec::new();
            for item in array_items(info, value, info.element_count() as usize)? {
                data_type.encode_into(item, &mut data)?;
            }
            put(out, offset, &data)
        }
        TagKind::Struct(id) => {
            let nested = template(symbols, id)?;
            let size = nested.structure_size as usize;
            let items = if info.is_array() {
                array_items(info, value, info.element_count() as usize)?
            } else {
                vec![value]
            };
            for (i, item) in items.into_iter().enumerate() {
                let start = offset + i * size;
                let slot = out
                    .get_mut(start..start + size)
                    .ok_or_else(|| {
                        CipError::encode(format!("{} overruns the structure", nested.name))
                    })?;
                encode_struct(nested, item, symbols, slot)?;
            }
            Ok(())
        }
    }
}

fn array_items<'v>(
    info: &TagInfo,
    value: &'v PlcValue,
    expected: usize,
) -> Result<Vec<&'v PlcValue>> {
    match value {
        PlcValue::Array(items) if items.len() == expected => Ok(items.iter().collect()),
        _ => Err(CipError::encode(format!(
            "'{}' expects an array of {} elements",
            info.name, expected
        ))),
    }
}

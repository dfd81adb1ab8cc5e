//! Tag address parsing and resolution.
//!
//! Addresses follow the controller's own syntax:
//!
//! ```text
//! [Program:Name.]Tag[i[,j[,k]]][.Member[..]]...[.Bit][{Count}]
//! ```
//!
//! Parsing resolves every step against the [`SymbolCache`] so that a trailing
//! `.N` can be told apart from a member name, and so that BOOL arrays (which
//! the controller stores as DWORD words) are addressed by bit.
//!
//! # Example
//!
//! ```
//! use logix_cip::symbols::{SymbolCache, TagInfo, TagKind};
//! use logix_cip::{DataType, TagAddress};
//!
//! let mut symbols = SymbolCache::new();
//! symbols.insert_tag(
//!     None,
//!     TagInfo::new("MyArray", TagKind::Atomic(DataType::Dint)).with_dimensions(vec![10]),
//! );
//!
//! let address = TagAddress::parse("MyArray[2]{3}", &symbols).unwrap();
//! assert_eq!(address.elements, 3);
//! assert_eq!(address.type_name, "DINT[3]");
//! ```

use crate::codec::DataType;
use crate::error::{CipError, Result};
use crate::path::{encode_path, LogicalKind, Segment};
use crate::symbols::{SymbolCache, TagInfo, TagKind};
use crate::utils::words_spanned;

const PROGRAM_PREFIX: &str = "Program:";
const MAX_DIMENSIONS: usize = 3;

/// One member access or array index after the base name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathStep {
    /// `.Name`
    Member(String),
    /// `[i]`, `[i,j]` or `[i,j,k]`
    Index(Vec<u32>),
}

/// A parsed and resolved tag address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagAddress {
    /// Address text as given.
    pub text: String,
    /// Program scope, if any.
    pub program: Option<String>,
    /// Base tag name.
    pub base: String,
    /// Member accesses and indices, in order.
    pub steps: Vec<PathStep>,
    /// Bit index into an integer, or the first bit of a BOOL array range.
    pub bit: Option<u32>,
    /// Number of wire elements requested.
    pub elements: u16,
    /// Number of BOOLs requested from a BOOL array (`{N}`).
    pub bit_count: Option<u32>,
    /// Resolved info of the addressed tag or member.
    pub target: TagInfo,
    /// Display type: `DINT`, `DINT[3]`, `BOOL`, `MyUdt`, ...
    pub type_name: String,
}

/// Address text split into its parts, before resolution.
#[derive(Debug, Default, PartialEq, Eq)]
struct Syntax {
    program: Option<String>,
    base: String,
    steps: Vec<PathStep>,
    bit: Option<u32>,
    count: Option<u32>,
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn parse_number(text: &str, what: &str) -> std::result::Result<u32, String> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid {what} '{text}'"));
    }
    text.parse::<u32>()
        .map_err(|_| format!("{what} '{text}' out of range"))
}

fn parse_syntax(text: &str) -> std::result::Result<Syntax, String> {
    let mut rest = text.trim();
    if rest.is_empty() {
        return Err("empty tag name".into());
    }
    if !rest.is_ascii() {
        return Err("non-ASCII characters".into());
    }

    let mut syntax = Syntax::default();
    if let Some(open) = rest.strip_suffix('}').and_then(|r| r.rfind('{')) {
        let count = parse_number(&rest[open + 1..rest.len() - 1], "element count")?;
        if count == 0 {
            return Err("element count must be at least 1".into());
        }
        syntax.count = Some(count);
        rest = &rest[..open];
    }

    if rest.len() > PROGRAM_PREFIX.len()
        && rest[..PROGRAM_PREFIX.len()].eq_ignore_ascii_case(PROGRAM_PREFIX)
    {
        let scoped = &rest[PROGRAM_PREFIX.len()..];
        let (program, tail) = scoped
            .split_once('.')
            .ok_or("program-scoped tag without a tag name")?;
        if program.is_empty() || !program.bytes().all(is_name_char) {
            return Err(format!("invalid program name '{program}'"));
        }
        syntax.program = Some(program.to_string());
        rest = tail;
    }

    let bytes = rest.as_bytes();
    let mut pos = bytes
        .iter()
        .position(|&b| !(is_name_char(b) || b == b':'))
        .unwrap_or(bytes.len());
    syntax.base = rest[..pos].to_string();
    if !bytes.first().is_some_and(|&b| is_name_start(b)) {
        return Err(format!("invalid tag name '{}'", syntax.base));
    }

    while pos < bytes.len() {
        if syntax.bit.is_some() {
            return Err("bit index must be the last part of the address".into());
        }
        match bytes[pos] {
            b'[' => {
                let close = rest[pos..]
                    .find(']')
                    .map(|i| pos + i)
                    .ok_or("unclosed '['")?;
                let indices = rest[pos + 1..close]
                    .split(',')
                    .map(|i| parse_number(i, "array index"))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if indices.len() > MAX_DIMENSIONS {
                    return Err(format!("at most {MAX_DIMENSIONS} array indices allowed"));
                }
                syntax.steps.push(PathStep::Index(indices));
                pos = close + 1;
            }
            b'.' => {
                let start = pos + 1;
                let end = bytes[start..]
                    .iter()
                    .position(|&b| !is_name_char(b))
                    .map_or(bytes.len(), |i| start + i);
                let part = &rest[start..end];
                if part.is_empty() {
                    return Err("empty member name".into());
                }
                if part.bytes().all(|b| b.is_ascii_digit()) {
                    syntax.bit = Some(parse_number(part, "bit index")?);
                } else if is_name_start(part.as_bytes()[0]) {
                    syntax.steps.push(PathStep::Member(part.to_string()));
                } else {
                    return Err(format!("invalid member name '{part}'"));
                }
                pos = end;
            }
            other => return Err(format!("unexpected character '{}'", other as char)),
        }
    }
    Ok(syntax)
}

impl TagAddress {
    /// Parses `text` and resolves it against `symbols`.
    ///
    /// # Errors
    ///
    /// Returns `CipError::Parse` carrying the text for bad syntax, unknown
    /// tags or members, misplaced indices and out-of-range bit indices.
    pub fn parse(text: &str, symbols: &SymbolCache) -> Result<Self> {
        let syntax = parse_syntax(text).map_err(|reason| CipError::parse(text, reason))?;
        resolve(text, syntax, symbols).map_err(|e| match e {
            CipError::Parse { .. } => e,
            other => CipError::parse(text, other.to_string()),
        })
    }

    /// Returns whether this addresses bits of a BOOL array.
    pub fn is_bool_array(&self) -> bool {
        self.target.is_bool_array()
    }

    /// Returns whether this addresses one bit of an integer.
    pub fn is_bit(&self) -> bool {
        self.bit.is_some() && !self.is_bool_array()
    }

    /// Returns whether the target is a structure.
    pub fn is_struct(&self) -> bool {
        matches!(self.target.kind, TagKind::Struct(_))
    }

    /// Size of one wire element in bytes.
    pub fn element_size(&self, symbols: &SymbolCache) -> Result<usize> {
        match self.target.kind {
            TagKind::Atomic(t) => t.size().ok_or_else(|| {
                CipError::parse(&self.text, format!("{t} tags cannot be read by element"))
            }),
            TagKind::Struct(id) => symbols
                .template(id)
                .map(|t| t.structure_size as usize)
                .ok_or_else(|| CipError::tag_not_found(format!("template {id}"))),
        }
    }

    /// Segments naming this tag: symbolic names plus element segments.
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(self.steps.len() + 2);
        if let Some(program) = &self.program {
            segments.push(Segment::symbolic(format!("{PROGRAM_PREFIX}{program}")));
        }
        segments.push(Segment::symbolic(self.base.clone()));
        for step in &self.steps {
            match step {
                PathStep::Member(name) => segments.push(Segment::symbolic(name.clone())),
                PathStep::Index(indices) => segments.extend(
                    indices
                        .iter()
                        .map(|&i| Segment::logical(LogicalKind::MemberId, i)),
                ),
            }
        }
        segments
    }

    /// Encoded, padded request path.
    pub fn request_path(&self) -> Result<Vec<u8>> {
        encode_path(&self.segments(), true)
    }
}

fn resolve(text: &str, syntax: Syntax, symbols: &SymbolCache) -> Result<TagAddress> {
    let Syntax {
        program,
        base,
        mut steps,
        bit,
        count,
    } = syntax;
    let fail = |reason: String| CipError::parse(text, reason);

    let mut current = symbols
        .tag(program.as_deref(), &base)
        .ok_or_else(|| fail(format!("unknown tag '{base}'")))?;
    let mut indexed = false;
    for step in &steps {
        match step {
            PathStep::Member(name) => {
                if current.is_array() && !indexed {
                    return Err(fail(format!("'{}' is an array and needs an index", current.name)));
                }
                current = symbols
                    .member_of(current, name)
                    .ok_or_else(|| fail(format!("unknown member '{name}'")))?;
                indexed = false;
            }
            PathStep::Index(indices) => {
                if indexed || !current.is_array() {
                    return Err(fail(format!("'{}' is not an array", current.name)));
                }
                check_indices(current, indices).map_err(fail)?;
                indexed = true;
            }
        }
    }
    let target = current.clone();

    if target.is_bool_array() {
        if bit.is_some() {
            return Err(fail("bit index on a BOOL array".into()));
        }
        // BOOL arrays are addressed by bit; the wire sees whole DWORDs
        let first = match steps.last_mut() {
            Some(PathStep::Index(indices)) if indexed => {
                let [index] = indices.as_mut_slice() else {
                    return Err(fail("BOOL arrays take a single index".into()));
                };
                let bit = *index % 32;
                *index /= 32;
                bit
            }
            _ => 0,
        };
        let wanted = count.unwrap_or(1);
        let elements = u16::try_from(words_spanned(first, wanted))
            .map_err(|_| fail(format!("{wanted} bits is too many")))?;
        return Ok(TagAddress {
            text: text.to_string(),
            program,
            base,
            steps,
            bit: Some(first),
            elements,
            bit_count: count,
            type_name: match count {
                Some(n) if n > 1 => format!("BOOL[{n}]"),
                _ => "BOOL".to_string(),
            },
            target,
        });
    }

    if let Some(bit) = bit {
        let width = match target.kind {
            TagKind::Atomic(t) if !target.is_array() || indexed => t.bit_width(),
            _ => None,
        }
        .ok_or_else(|| fail(format!("'{}' is not an integer", target.name)))?;
        if bit >= width {
            return Err(fail(format!("bit {bit} out of range for a {width}-bit value")));
        }
        if count.is_some_and(|n| n > 1) {
            return Err(fail("element count on a bit address".into()));
        }
        return Ok(TagAddress {
            text: text.to_string(),
            program,
            base,
            steps,
            bit: Some(bit),
            elements: 1,
            bit_count: None,
            type_name: DataType::Bool.name().to_string(),
            target,
        });
    }

    let elements = count.unwrap_or(1);
    let elements =
        u16::try_from(elements).map_err(|_| fail(format!("{elements} elements is too many")))?;
    let type_name = symbols.type_name(&target);
    Ok(TagAddress {
        text: text.to_string(),
        program,
        base,
        steps,
        bit: None,
        elements,
        bit_count: None,
        type_name: if elements > 1 {
            format!("{type_name}[{elements}]")
        } else {
            type_name
        },
        target,
    })
}

fn check_indices(info: &TagInfo, indices: &[u32]) -> std::result::Result<(), String> {
    if info.is_bool_array() {
        let bits = info.dimensions.first().copied().unwrap_or(0) * 32;
        return match indices {
            [i] if *i < bits => Ok(()),
            [i] => Err(format!("index {i} out of range for BOOL[{bits}]")),
            _ => Err("BOOL arrays take a single index".into()),
        };
    }
    if indices.len() != info.dimensions.len() {
        return Err(format!(
            "'{}' has {} dimensions, got {} indices",
            info.name,
            info.dimensions.len(),
            indices.len()
        ));
    }
    for (index, len) in indices.iter().zip(&info.dimensions) {
        if index >= len {
            return Err(format!("index {index} out of range for '{}'", info.name));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::symbols::TypeTemplate;
    use std::collections::HashSet;

    /// Controller with a DINT array, a BOOL array, a UDT and a Logix string.
    pub(crate) fn sample_symbols() -> SymbolCache {
        let mut symbols = SymbolCache::new();
        symbols.insert_tag(None, TagInfo::new("Counter", TagKind::Atomic(DataType::Dint)));
        symbols.insert_tag(
            None,
            TagInfo::new("MyArray", TagKind::Atomic(DataType::Dint)).with_dimensions(vec![10]),
        );
        symbols.insert_tag(
            None,
            TagInfo::new("Grid", TagKind::Atomic(DataType::Int)).with_dimensions(vec![4, 5]),
        );
        symbols.insert_tag(
            None,
            TagInfo::new("Flags", TagKind::Atomic(DataType::Dword)).with_dimensions(vec![4]),
        );
        symbols.insert_tag(None, TagInfo::new("Speed", TagKind::Atomic(DataType::Real)));
        symbols.insert_tag(None, TagInfo::new("Motor", TagKind::Struct(0x100)));
        symbols.insert_tag(
            None,
            TagInfo::new("Motors", TagKind::Struct(0x100)).with_dimensions(vec![3]),
        );
        symbols.insert_tag(None, TagInfo::new("Label", TagKind::Struct(0xFCE)));
        symbols.insert_tag(None, TagInfo::new("Local:1:I", TagKind::Atomic(DataType::Dint)));
        symbols.insert_tag(Some("Main"), TagInfo::new("Step", TagKind::Atomic(DataType::Int)));

        symbols.insert_template(TypeTemplate {
            instance_id: 0x100,
            name: "MotorType".into(),
            handle: 0x1234,
            structure_size: 16,
            members: vec![
                (
                    "ZZZZZZZZZZMotorType0".into(),
                    TagInfo::new("ZZZZZZZZZZMotorType0", TagKind::Atomic(DataType::Sint)),
                ),
                (
                    "Running".into(),
                    TagInfo::new("Running", TagKind::Atomic(DataType::Bool)).with_bit(0),
                ),
                (
                    "Faulted".into(),
                    TagInfo::new("Faulted", TagKind::Atomic(DataType::Bool)).with_bit(1),
                ),
                (
                    "Speed".into(),
                    TagInfo::new("Speed", TagKind::Atomic(DataType::Real)).with_offset(4),
                ),
                (
                    "Status".into(),
                    TagInfo::new("Status", TagKind::Atomic(DataType::Dint)).with_offset(8),
                ),
                (
                    "Alarms".into(),
                    TagInfo::new("Alarms", TagKind::Atomic(DataType::Dword))
                        .with_offset(12)
                        .with_dimensions(vec![1]),
                ),
            ],
            private: HashSet::from(["ZZZZZZZZZZMotorType0".to_string()]),
            is_string: false,
        });
        symbols.insert_template(TypeTemplate {
            instance_id: 0xFCE,
            name: "STRING".into(),
            handle: 0x0FCE,
            structure_size: 88,
            members: vec![
                ("LEN".into(), TagInfo::new("LEN", TagKind::Atomic(DataType::Dint))),
                (
                    "DATA".into(),
                    TagInfo::new("DATA", TagKind::Atomic(DataType::Sint))
                        .with_offset(4)
                        .with_dimensions(vec![82]),
                ),
            ],
            private: HashSet::new(),
            is_string: true,
        });
        symbols
    }

    #[test]
    fn test_parse_is_idempotent() {
        let symbols = sample_symbols();
        for text in ["Counter", "MyArray[2]{3}", "Motor.Speed", "Flags[40]{8}", "Counter.7"] {
            let first = TagAddress::parse(text, &symbols).unwrap();
            let second = TagAddress::parse(text, &symbols).unwrap();
            assert_eq!(first, second, "{text}");
        }
    }

    #[test]
    fn test_array_range() {
        let symbols = sample_symbols();
        let address = TagAddress::parse("MyArray[2]{3}", &symbols).unwrap();
        assert_eq!(address.base, "MyArray");
        assert_eq!(address.steps, [PathStep::Index(vec![2])]);
        assert_eq!(address.elements, 3);
        assert_eq!(address.bit, None);
        assert_eq!(address.type_name, "DINT[3]");
        assert_eq!(
            address.request_path().unwrap(),
            [0x91, 0x07, b'M', b'y', b'A', b'r', b'r', b'a', b'y', 0x00, 0x28, 0x02]
        );
    }

    #[test]
    fn test_multi_dimensional_index() {
        let symbols = sample_symbols();
        let address = TagAddress::parse("Grid[3, 4]", &symbols).unwrap();
        assert_eq!(address.steps, [PathStep::Index(vec![3, 4])]);
        assert_eq!(address.type_name, "INT");
        assert!(TagAddress::parse("Grid[3]", &symbols).is_err());
        assert!(TagAddress::parse("Grid[4,0]", &symbols).is_err());
    }

    #[test]
    fn test_bool_array_addressing() {
        let symbols = sample_symbols();
        let address = TagAddress::parse("Flags[40]", &symbols).unwrap();
        assert_eq!(address.steps, [PathStep::Index(vec![1])]);
        assert_eq!(address.bit, Some(8));
        assert_eq!(address.elements, 1);
        assert_eq!(address.type_name, "BOOL");

        let address = TagAddress::parse("Flags[30]{5}", &symbols).unwrap();
        assert_eq!(address.steps, [PathStep::Index(vec![0])]);
        assert_eq!(address.bit, Some(30));
        assert_eq!(address.elements, 2);
        assert_eq!(address.bit_count, Some(5));
        assert_eq!(address.type_name, "BOOL[5]");

        let address = TagAddress::parse("Flags{64}", &symbols).unwrap();
        assert_eq!(address.bit, Some(0));
        assert_eq!(address.elements, 2);

        assert!(TagAddress::parse("Flags[128]", &symbols).is_err());
        assert!(TagAddress::parse("Flags[1].3", &symbols).is_err());
    }

    #[test]
    fn test_bit_index() {
        let symbols = sample_symbols();
        let address = TagAddress::parse("Counter.31", &symbols).unwrap();
        assert_eq!(address.bit, Some(31));
        assert!(address.is_bit());
        assert_eq!(address.type_name, "BOOL");

        let address = TagAddress::parse("MyArray[1].4", &symbols).unwrap();
        assert_eq!(address.bit, Some(4));

        let err = TagAddress::parse("Counter.32", &symbols).unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(TagAddress::parse("Speed.1", &symbols).is_err());
        assert!(TagAddress::parse("MyArray.1", &symbols).is_err());
        assert!(TagAddress::parse("Counter.1.2", &symbols).is_err());
    }

    #[test]
    fn test_members() {
        let symbols = sample_symbols();
        let address = TagAddress::parse("Motors[1].Status.3", &symbols).unwrap();
        assert_eq!(
            address.steps,
            [PathStep::Index(vec![1]), PathStep::Member("Status".into())]
        );
        assert_eq!(address.bit, Some(3));

        let address = TagAddress::parse("motor.speed", &symbols).unwrap();
        assert_eq!(address.target.data_type(), Some(DataType::Real));

        let address = TagAddress::parse("Motor.Alarms[17]", &symbols).unwrap();
        assert!(address.is_bool_array());
        assert_eq!(address.bit, Some(17));
        assert_eq!(address.steps[1], PathStep::Index(vec![0]));
        assert!(TagAddress::parse("Motor.Alarms[33]", &symbols).is_err());

        let address = TagAddress::parse("Motor", &symbols).unwrap();
        assert!(address.is_struct());
        assert_eq!(address.type_name, "MotorType");
        assert_eq!(address.element_size(&symbols).unwrap(), 16);

        assert!(TagAddress::parse("Motor.Torque", &symbols).is_err());
        assert!(TagAddress::parse("Motors.Speed", &symbols).is_err());
    }

    #[test]
    fn test_program_and_module_tags() {
        let symbols = sample_symbols();
        let address = TagAddress::parse("Program:Main.Step", &symbols).unwrap();
        assert_eq!(address.program.as_deref(), Some("Main"));
        let path = address.request_path().unwrap();
        assert_eq!(&path[..14], b"\x91\x0cProgram:Main");

        let address = TagAddress::parse("Local:1:I", &symbols).unwrap();
        assert_eq!(address.base, "Local:1:I");
        assert!(TagAddress::parse("Step", &symbols).is_err());
    }

    #[test]
    fn test_syntax_errors() {
        let symbols = sample_symbols();
        for text in [
            "",
            "1Counter",
            "Counter[",
            "MyArray[a]",
            "MyArray[1,2,3,4]",
            "Counter{0}",
            "Counter..x",
            "Counter$",
            "Program:.Step",
            "Program:Main",
        ] {
            match TagAddress::parse(text, &symbols) {
                Err(CipError::Parse { tag, .. }) => assert_eq!(tag, text),
                other => panic!("{text}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_syntax_parts() {
        let syntax = parse_syntax("Program:P1.Tag[1,2].Sub.5{2}").unwrap();
        assert_eq!(syntax.program.as_deref(), Some("P1"));
        assert_eq!(syntax.base, "Tag");
        assert_eq!(
            syntax.steps,
            [PathStep::Index(vec![1, 2]), PathStep::Member("Sub".into())]
        );
        assert_eq!(syntax.bit, Some(5));
        assert_eq!(syntax.count, Some(2));
    }
}

//! Controller symbol table and structure template cache.
//!
//! On connect the client uploads every symbol instance from the controller
//! (and, optionally, from each program), then resolves the templates of all
//! structured tags. The resulting [`SymbolCache`] is what turns tag names into
//! wire types and sizes.
//!
//! Templates live in a map keyed by template instance id; members refer to
//! nested structures by that id, never by pointer.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info, warn};

use crate::codec::{latin1_decode, DataType, Reader};
use crate::command::{
    message_router_request, CLASS_SYMBOL, CLASS_TEMPLATE, SERVICE_GET_ATTRIBUTE_LIST,
    SERVICE_GET_INSTANCE_ATTRIBUTE_LIST, SERVICE_READ_TAG,
};
use crate::connection::MessageChannel;
use crate::error::{CipError, Result};
use crate::path::{encode_path, object_path, LogicalKind, Segment};
use crate::response::{STATUS_PARTIAL, STATUS_SUCCESS};

/// Template instance id (low 12 bits of a structure type word).
pub type TemplateId = u16;

/// Attributes requested for every symbol instance, in reply order.
const SYMBOL_ATTRIBUTES: [u16; 7] = [1, 2, 3, 5, 6, 8, 10];

const TYPE_STRUCT: u16 = 0x8000;
const TYPE_SYSTEM: u16 = 0x1000;
const TEMPLATE_ID_MASK: u16 = 0x0FFF;

/// What a tag or member holds: exactly one of an elementary type or a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TagKind {
    /// Elementary value.
    Atomic(DataType),
    /// Structure described by a template.
    Struct(TemplateId),
}

/// External access permission (symbol attribute 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ExternalAccess {
    /// Readable and writable.
    #[default]
    ReadWrite,
    /// Readable only.
    ReadOnly,
    /// Not accessible.
    None,
}

impl ExternalAccess {
    fn from_code(code: u8) -> Self {
        match code {
            2 => ExternalAccess::ReadOnly,
            3 => ExternalAccess::None,
            _ => ExternalAccess::ReadWrite,
        }
    }
}

/// Everything known about a tag or structure member.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TagInfo {
    /// Tag or member name.
    pub name: String,
    /// Symbol instance id (0 for structure members).
    pub instance_id: u32,
    /// Elementary type or structure reference.
    pub kind: TagKind,
    /// Array dimensions; empty for scalars. BOOL arrays are counted in DWORDs.
    pub dimensions: Vec<u32>,
    /// Byte offset within the parent structure (0 for tags).
    pub offset: u32,
    /// Bit position for BOOL members and BOOL tags.
    pub bit: Option<u8>,
    /// External access permission.
    pub external_access: ExternalAccess,
}

impl TagInfo {
    /// Creates a scalar tag.
    pub fn new(name: impl Into<String>, kind: TagKind) -> Self {
        Self {
            name: name.into(),
            instance_id: 0,
            kind,
            dimensions: Vec::new(),
            offset: 0,
            bit: None,
            external_access: ExternalAccess::ReadWrite,
        }
    }

    /// Sets the array dimensions.
    pub fn with_dimensions(mut self, dimensions: Vec<u32>) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Sets the member offset.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Sets the BOOL bit position.
    pub fn with_bit(mut self, bit: u8) -> Self {
        self.bit = Some(bit);
        self
    }

    /// Returns the elementary type, if any.
    pub fn data_type(&self) -> Option<DataType> {
        match self.kind {
            TagKind::Atomic(t) => Some(t),
            TagKind::Struct(_) => None,
        }
    }

    /// Returns the template id, if this is a structure.
    pub fn template_id(&self) -> Option<TemplateId> {
        match self.kind {
            TagKind::Struct(id) => Some(id),
            TagKind::Atomic(_) => None,
        }
    }

    /// Returns whether this is an array.
    pub fn is_array(&self) -> bool {
        !self.dimensions.is_empty()
    }

    /// Returns whether this is a BOOL array packed into DWORDs.
    pub fn is_bool_array(&self) -> bool {
        self.is_array() && self.kind == TagKind::Atomic(DataType::Dword)
    }

    /// Total number of elements (1 for scalars).
    pub fn element_count(&self) -> u32 {
        self.dimensions.iter().product::<u32>().max(1)
    }
}

/// A user-defined (or system) structure type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeTemplate {
    /// Template instance id.
    pub instance_id: TemplateId,
    /// Type name.
    pub name: String,
    /// Structure handle, sent in structure type headers.
    pub handle: u16,
    /// Size of one structure in bytes.
    pub structure_size: u32,
    /// Members in declaration order, hidden members included.
    pub members: Vec<(String, TagInfo)>,
    /// Names of hidden members (BOOL hosts and system members).
    pub private: HashSet<String>,
    /// Whether this is a Logix string type (`LEN` + `DATA`).
    pub is_string: bool,
}

impl TypeTemplate {
    /// Looks up a member by name, ignoring ASCII case.
    pub fn member(&self, name: &str) -> Option<&TagInfo> {
        self.members
            .iter()
            .find(|(member, _)| member.eq_ignore_ascii_case(name))
            .map(|(_, info)| info)
    }

    /// Members that are not hidden, in declaration order.
    pub fn public_members(&self) -> impl Iterator<Item = &(String, TagInfo)> + '_ {
        self.members
            .iter()
            .filter(move |(name, _)| !self.private.contains(name))
    }

    /// Character capacity of a string type (length of its `DATA` array).
    pub fn string_capacity(&self) -> Option<u32> {
        if !self.is_string {
            return None;
        }
        self.member("DATA")
            .and_then(|data| data.dimensions.first().copied())
    }

    fn detect_string(&mut self) {
        let public: Vec<&(String, TagInfo)> = self.public_members().collect();
        let is_string = matches!(
            public.as_slice(),
            [(len, len_info), (data, data_info)]
                if len.eq_ignore_ascii_case("LEN")
                    && data.eq_ignore_ascii_case("DATA")
                    && len_info.data_type().is_some_and(|t| t.bit_width().is_some())
                    && data_info.kind == TagKind::Atomic(DataType::Sint)
                    && data_info.is_array()
        );
        self.is_string = is_string;
    }
}

fn is_private_member(name: &str) -> bool {
    name.starts_with("ZZZZZZZZZZ") || name.starts_with("__")
}

/// Decoded symbol type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SymbolType {
    kind: TagKind,
    dimension_count: usize,
    bit: Option<u8>,
    system: bool,
}

fn parse_type_word(word: u16) -> Result<SymbolType> {
    let kind = if word & TYPE_STRUCT != 0 {
        TagKind::Struct(word & TEMPLATE_ID_MASK)
    } else {
        let code = (word & 0x00FF) as u8;
        let data_type = DataType::from_code(code).ok_or_else(|| {
            CipError::invalid_response(format!("unknown data type 0x{code:02X}"))
        })?;
        TagKind::Atomic(data_type)
    };
    let bit = match kind {
        TagKind::Atomic(DataType::Bool) => Some(((word >> 8) & 0x07) as u8),
        _ => None,
    };
    Ok(SymbolType {
        kind,
        dimension_count: ((word >> 13) & 0x03) as usize,
        bit,
        system: word & TYPE_SYSTEM != 0,
    })
}

/// One symbol instance as returned by Get Instance Attribute List.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SymbolRecord {
    instance_id: u32,
    name: String,
    type_word: u16,
    dimensions: [u32; 3],
    external_access: u8,
}

fn parse_symbol_record(reader: &mut Reader<'_>) -> Result<SymbolRecord> {
    let instance_id = reader.u32()?;
    let parse_rest = |reader: &mut Reader<'_>| -> Result<SymbolRecord> {
        let name_len = reader.u16()? as usize;
        let name = latin1_decode(reader.take(name_len)?);
        let type_word = reader.u16()?;
        let _address = reader.u32()?;
        let _object_address = reader.u32()?;
        let _software_control = reader.u32()?;
        let dimensions = [reader.u32()?, reader.u32()?, reader.u32()?];
        let external_access = reader.u8()?;
        Ok(SymbolRecord {
            instance_id,
            name,
            type_word,
            dimensions,
            external_access,
        })
    };
    crate::codec::continued(parse_rest(reader))
        .map_err(|e| crate::codec::with_context(e, &format!("symbol instance {instance_id}")))
}

/// Which list an uploaded record belongs to.
#[derive(Debug, PartialEq, Eq)]
enum RecordClass<'a> {
    Program(&'a str),
    Task(&'a str),
    Module(&'a str),
    Tag,
    Skip,
}

fn classify(name: &str, system: bool) -> RecordClass<'_> {
    if let Some(program) = name.strip_prefix("Program:") {
        return RecordClass::Program(program);
    }
    if let Some(task) = name.strip_prefix("Task:") {
        return RecordClass::Task(task);
    }
    if name.starts_with("Routine:")
        || name.starts_with("Map:")
        || name.starts_with("Cxn:")
        || name.starts_with("__")
        || system
    {
        return RecordClass::Skip;
    }
    match name.split_once(':') {
        Some((module, _)) => RecordClass::Module(module),
        None => RecordClass::Tag,
    }
}

/// Tags and templates uploaded from one controller.
#[derive(Debug, Clone, Default)]
pub struct SymbolCache {
    scopes: HashMap<Option<String>, BTreeMap<String, TagInfo>>,
    programs: Vec<String>,
    tasks: Vec<String>,
    modules: BTreeMap<String, Vec<String>>,
    templates: HashMap<TemplateId, TypeTemplate>,
    template_names: HashMap<String, TemplateId>,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl SymbolCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads controller-scoped tags (and program-scoped tags when
    /// `include_programs` is set) and resolves every referenced template.
    pub fn upload<C: MessageChannel>(channel: &mut C, include_programs: bool) -> Result<Self> {
        let mut cache = Self::new();
        cache.upload_scope(channel, None)?;
        if include_programs {
            for program in cache.programs.clone() {
                cache.upload_scope(channel, Some(&program))?;
            }
        }
        cache.resolve_templates(channel)?;
        info!(
            "symbol upload: {} controller tags, {} programs, {} templates",
            cache.tags(None).count(),
            cache.programs.len(),
            cache.templates.len()
        );
        Ok(cache)
    }

    /// Uploads the symbols of one scope, paging through the instance list.
    pub fn upload_scope<C: MessageChannel>(
        &mut self,
        channel: &mut C,
        program: Option<&str>,
    ) -> Result<()> {
        let mut start = 0u32;
        loop {
            let request = instance_list_request(program, start)?;
            let reply = channel.send(&request)?;
            if !matches!(reply.status, STATUS_SUCCESS | STATUS_PARTIAL) {
                return Err(reply.error());
            }

            let mut reader = Reader::new(&reply.data);
            let mut last = None;
            loop {
                match parse_symbol_record(&mut reader) {
                    Ok(record) => {
                        last = Some(record.instance_id);
                        self.add_record(program, record);
                    }
                    Err(CipError::BufferEmpty) => break,
                    Err(e) => return Err(e),
                }
            }

            if reply.status == STATUS_SUCCESS {
                break;
            }
            match last {
                Some(id) => match id.checked_add(1) {
                    Some(next) => {
                        start = next;
                        debug!("symbol upload continuing at instance {start}");
                    }
                    None => {
                        warn!("symbol upload reached the last instance id, stopping");
                        break;
                    }
                },
                None => {
                    return Err(CipError::invalid_response(
                        "partial instance list reply without records",
                    ))
                }
            }
        }
        Ok(())
    }

    fn add_record(&mut self, program: Option<&str>, record: SymbolRecord) {
        let system = record.type_word & TYPE_SYSTEM != 0;
        let module = match classify(&record.name, system) {
            RecordClass::Program(name) => {
                self.programs.push(name.to_string());
                return;
            }
            RecordClass::Task(name) => {
                self.tasks.push(name.to_string());
                return;
            }
            RecordClass::Skip => return,
            RecordClass::Module(module) => Some(module.to_string()),
            RecordClass::Tag => None,
        };
        let symbol_type = match parse_type_word(record.type_word) {
            Ok(t) => t,
            Err(e) => {
                warn!("skipping symbol '{}': {e}", record.name);
                return;
            }
        };
        if let Some(module) = module {
            self.modules
                .entry(module)
                .or_default()
                .push(record.name.clone());
        }
        let info = TagInfo {
            dimensions: record.dimensions[..symbol_type.dimension_count].to_vec(),
            instance_id: record.instance_id,
            kind: symbol_type.kind,
            offset: 0,
            bit: symbol_type.bit,
            external_access: ExternalAccess::from_code(record.external_access),
            name: record.name,
        };
        self.insert_tag(program, info);
    }

    /// Resolves the template of every structured tag in the cache.
    pub fn resolve_templates<C: MessageChannel>(&mut self, channel: &mut C) -> Result<()> {
        let ids: HashSet<TemplateId> = self
            .scopes
            .values()
            .flat_map(|tags| tags.values())
            .filter_map(TagInfo::template_id)
            .collect();
        for id in ids {
            self.resolve_template(channel, id)?;
        }
        Ok(())
    }

    /// Fetches a template (and, recursively, its nested templates) unless cached.
    pub fn resolve_template<C: MessageChannel>(
        &mut self,
        channel: &mut C,
        id: TemplateId,
    ) -> Result<&TypeTemplate> {
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if self.templates.contains_key(&next) {
                continue;
            }
            let template = fetch_template(channel, next)?;
            pending.extend(
                template
                    .members
                    .iter()
                    .filter_map(|(_, member)| member.template_id())
                    .filter(|nested| !self.templates.contains_key(nested)),
            );
            self.insert_template(template);
        }
        self.template(id)
            .ok_or_else(|| CipError::tag_not_found(format!("template {id}")))
    }

    /// Adds (or replaces) a tag in a scope.
    pub fn insert_tag(&mut self, program: Option<&str>, info: TagInfo) {
        self.scopes
            .entry(program.map(key))
            .or_default()
            .insert(key(&info.name), info);
    }

    /// Adds (or replaces) a template, indexing it by id and by name.
    pub fn insert_template(&mut self, mut template: TypeTemplate) {
        template.detect_string();
        self.template_names
            .insert(key(&template.name), template.instance_id);
        self.templates.insert(template.instance_id, template);
    }

    /// Looks up a tag by name in a scope (`None` = controller scope).
    pub fn tag(&self, program: Option<&str>, name: &str) -> Option<&TagInfo> {
        self.scopes.get(&program.map(key))?.get(&key(name))
    }

    /// Iterates the tags of a scope in name order.
    pub fn tags(&self, program: Option<&str>) -> impl Iterator<Item = &TagInfo> + '_ {
        self.scopes
            .get(&program.map(key))
            .into_iter()
            .flat_map(|tags| tags.values())
    }

    /// Program names, in upload order.
    pub fn programs(&self) -> &[String] {
        &self.programs
    }

    /// Task names, in upload order.
    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Module-defined tag names grouped by module prefix.
    pub fn modules(&self) -> &BTreeMap<String, Vec<String>> {
        &self.modules
    }

    /// Looks up a template by id.
    pub fn template(&self, id: TemplateId) -> Option<&TypeTemplate> {
        self.templates.get(&id)
    }

    /// Looks up a template by type name, ignoring ASCII case.
    pub fn template_by_name(&self, name: &str) -> Option<&TypeTemplate> {
        self.template_names
            .get(&key(name))
            .and_then(|id| self.templates.get(id))
    }

    /// Iterates every cached template.
    pub fn data_types(&self) -> impl Iterator<Item = &TypeTemplate> + '_ {
        self.templates.values()
    }

    /// Returns the name of a tag's type: `DINT`, `MyUdt`, ...
    pub fn type_name(&self, info: &TagInfo) -> String {
        match info.kind {
            TagKind::Atomic(DataType::Dword) if info.is_array() => "BOOL".to_string(),
            TagKind::Atomic(t) => t.name().to_string(),
            TagKind::Struct(id) => self
                .template(id)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| format!("template {id}")),
        }
    }

    /// Resolves `base.member.member...` to the innermost tag or member.
    ///
    /// # Errors
    ///
    /// Returns `CipError::TagNotFound` naming the part of the path that failed.
    pub fn get_tag_info(
        &self,
        program: Option<&str>,
        base: &str,
        members: &[&str],
    ) -> Result<&TagInfo> {
        let mut current = self.tag(program, base).ok_or_else(|| {
            CipError::tag_not_found(match program {
                Some(p) => format!("Program:{p}.{base}"),
                None => base.to_string(),
            })
        })?;
        let mut walked = base.to_string();
        for member in members {
            walked.push('.');
            walked.push_str(member);
            current = self
                .member_of(current, member)
                .ok_or_else(|| CipError::tag_not_found(walked.clone()))?;
        }
        Ok(current)
    }

    /// Looks up a member of a structured tag.
    pub fn member_of(&self, parent: &TagInfo, name: &str) -> Option<&TagInfo> {
        self.template(parent.template_id()?)?.member(name)
    }
}

fn instance_list_request(program: Option<&str>, start: u32) -> Result<Vec<u8>> {
    let mut segments = Vec::with_capacity(3);
    if let Some(program) = program {
        segments.push(Segment::symbolic(format!("Program:{program}")));
    }
    segments.push(Segment::logical(LogicalKind::ClassId, CLASS_SYMBOL));
    segments.push(Segment::logical(LogicalKind::InstanceId, start));
    let path = encode_path(&segments, true)?;

    let mut data = Vec::with_capacity(2 + SYMBOL_ATTRIBUTES.len() * 2);
    data.extend_from_slice(&(SYMBOL_ATTRIBUTES.len() as u16).to_le_bytes());
    for attribute in SYMBOL_ATTRIBUTES {
        data.extend_from_slice(&attribute.to_le_bytes());
    }
    message_router_request(SERVICE_GET_INSTANCE_ATTRIBUTE_LIST, &path, &data)
}

/// Template attributes needed before the body can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TemplateAttributes {
    object_definition_size: u32,
    structure_size: u32,
    member_count: u16,
    handle: u16,
}

fn fetch_template_attributes<C: MessageChannel>(
    channel: &mut C,
    id: TemplateId,
) -> Result<TemplateAttributes> {
    let path = object_path(CLASS_TEMPLATE, id as u32, None)?;
    let mut data = 4u16.to_le_bytes().to_vec();
    for attribute in [4u16, 5, 2, 1] {
        data.extend_from_slice(&attribute.to_le_bytes());
    }
    let reply = channel.send(&message_router_request(
        SERVICE_GET_ATTRIBUTE_LIST,
        &path,
        &data,
    )?)?;
    reply.check_error()?;

    let mut attributes = TemplateAttributes {
        object_definition_size: 0,
        structure_size: 0,
        member_count: 0,
        handle: 0,
    };
    let mut reader = Reader::new(&reply.data);
    let parse = |reader: &mut Reader<'_>, attrs: &mut TemplateAttributes| -> Result<()> {
        let count = reader.u16()?;
        for _ in 0..count {
            let attribute = reader.u16()?;
            let status = reader.u16()?;
            if status != 0 {
                return Err(CipError::status(status as u8, None));
            }
            match attribute {
                4 => attrs.object_definition_size = reader.u32()?,
                5 => attrs.structure_size = reader.u32()?,
                2 => attrs.member_count = reader.u16()?,
                1 => attrs.handle = reader.u16()?,
                other => {
                    return Err(CipError::invalid_response(format!(
                        "unexpected template attribute {other}"
                    )))
                }
            }
        }
        Ok(())
    };
    crate::codec::continued(parse(&mut reader, &mut attributes))
        .map_err(|e| crate::codec::with_context(e, &format!("template {id} attributes")))?;
    Ok(attributes)
}

fn fetch_template<C: MessageChannel>(channel: &mut C, id: TemplateId) -> Result<TypeTemplate> {
    let attributes = fetch_template_attributes(channel, id)?;
    let total = (attributes.object_definition_size * 4)
        .checked_sub(21)
        .ok_or_else(|| CipError::invalid_response(format!("template {id} has no definition")))?;

    let path = object_path(CLASS_TEMPLATE, id as u32, None)?;
    let mut body = Vec::with_capacity(total as usize);
    loop {
        let offset = body.len() as u32;
        let length = u16::try_from(total.saturating_sub(offset)).unwrap_or(u16::MAX);
        let mut data = offset.to_le_bytes().to_vec();
        data.extend_from_slice(&length.to_le_bytes());
        let reply = channel.send(&message_router_request(SERVICE_READ_TAG, &path, &data)?)?;
        match reply.status {
            STATUS_SUCCESS => {
                body.extend_from_slice(&reply.data);
                break;
            }
            STATUS_PARTIAL if !reply.data.is_empty() => body.extend_from_slice(&reply.data),
            _ => return Err(reply.error()),
        }
    }

    let template = parse_template(id, &attributes, &body)?;
    debug!(
        "resolved template {} '{}': {} members, {} bytes",
        id,
        template.name,
        template.members.len(),
        template.structure_size
    );
    Ok(template)
}

fn parse_template(
    id: TemplateId,
    attributes: &TemplateAttributes,
    body: &[u8],
) -> Result<TypeTemplate> {
    let count = attributes.member_count as usize;
    let mut reader = Reader::new(body);
    let mut infos = Vec::with_capacity(count);
    for i in 0..count {
        let record = (|| -> Result<(u16, u16, u32)> {
            Ok((reader.u16()?, reader.u16()?, reader.u32()?))
        })();
        let record = crate::codec::continued(record)
            .map_err(|e| crate::codec::with_context(e, &format!("template {id} member {i}")))?;
        infos.push(record);
    }

    let mut names = reader
        .rest()
        .split(|&b| b == 0)
        .map(latin1_decode);
    let type_name = names
        .next()
        .map(|first| first.split(';').next().unwrap_or_default().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| CipError::invalid_response(format!("template {id} has no name")))?;

    let mut members = Vec::with_capacity(count);
    let mut private = HashSet::new();
    for (info_word, type_word, offset) in infos {
        let name = names.next().ok_or_else(|| {
            CipError::invalid_response(format!("template {id} is missing member names"))
        })?;
        let symbol_type = parse_type_word(type_word)
            .map_err(|e| crate::codec::with_context(e, &format!("member '{name}'")))?;
        let mut info = TagInfo::new(name.clone(), symbol_type.kind).with_offset(offset);
        match symbol_type.kind {
            TagKind::Atomic(DataType::Bool) => info.bit = Some(info_word as u8),
            _ if symbol_type.dimension_count > 0 => info.dimensions = vec![info_word as u32],
            _ => {}
        }
        if is_private_member(&name) {
            private.insert(name.clone());
        }
        members.push((name, info));
    }

    let mut template = TypeTemplate {
        instance_id: id,
        name: type_name,
        handle: attributes.handle,
        structure_size: attributes.structure_size,
        members,
        private,
        is_string: false,
    };
    template.detect_string();
    Ok(template)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::response::CipReply;

    /// Channel replaying canned replies and recording requests.
    #[derive(Default)]
    pub(crate) struct ScriptedChannel {
        pub replies: VecDeque<CipReply>,
        pub sent: Vec<Vec<u8>>,
        pub payload: usize,
    }

    impl ScriptedChannel {
        pub fn reply(&mut self, service: u8, status: u8, data: Vec<u8>) -> &mut Self {
            self.replies.push_back(CipReply {
                service: service | 0x80,
                status,
                extended: Vec::new(),
                data,
            });
            self
        }
    }

    impl MessageChannel for ScriptedChannel {
        fn send(&mut self, message: &[u8]) -> Result<CipReply> {
            self.sent.push(message.to_vec());
            self.replies.pop_front().ok_or(CipError::Timeout)
        }

        fn payload_size(&self) -> usize {
            if self.payload == 0 {
                500
            } else {
                self.payload
            }
        }
    }

    pub(crate) fn symbol_record(
        instance: u32,
        name: &str,
        type_word: u16,
        dims: [u32; 3],
    ) -> Vec<u8> {
        let mut out = instance.to_le_bytes().to_vec();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&type_word.to_le_bytes());
        out.extend_from_slice(&[0u8; 12]);
        for d in dims {
            out.extend_from_slice(&d.to_le_bytes());
        }
        out.push(0);
        out
    }

    pub(crate) fn template_attributes(
        objdef: u32,
        size: u32,
        members: u16,
        handle: u16,
    ) -> Vec<u8> {
        let mut out = 4u16.to_le_bytes().to_vec();
        out.extend_from_slice(&[0x04, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&objdef.to_le_bytes());
        out.extend_from_slice(&[0x05, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&members.to_le_bytes());
        out.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&handle.to_le_bytes());
        out
    }

    /// Template body: member records (info, type, offset) then the name table.
    pub(crate) fn template_body(type_name: &str, members: &[(&str, u16, u16, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (_, info, type_word, offset) in members {
            out.extend_from_slice(&info.to_le_bytes());
            out.extend_from_slice(&type_word.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(format!("{type_name};n").as_bytes());
        out.push(0);
        for (name, ..) in members {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out
    }

    fn motor_members() -> Vec<(&'static str, u16, u16, u32)> {
        vec![
            ("ZZZZZZZZZZMotor0", 0, 0x00C2, 0),
            ("Running", 0, 0x00C1, 0),
            ("Faulted", 1, 0x00C1, 0),
            ("Speed", 0, 0x00CA, 4),
            ("Counts", 3, 0x20C4, 8),
        ]
    }

    #[test]
    fn test_parse_type_word() {
        let t = parse_type_word(0x00C4).unwrap();
        assert_eq!(t.kind, TagKind::Atomic(DataType::Dint));
        assert_eq!(t.dimension_count, 0);

        let t = parse_type_word(0x8FCE).unwrap();
        assert_eq!(t.kind, TagKind::Struct(0x0FCE));

        let t = parse_type_word(0x40C3).unwrap();
        assert_eq!(t.dimension_count, 2);

        let t = parse_type_word(0x05C1).unwrap();
        assert_eq!(t.bit, Some(5));

        assert!(parse_type_word(0x1000 | 0x00C4).unwrap().system);
        assert!(parse_type_word(0x00EE).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("Program:Main", false), RecordClass::Program("Main"));
        assert_eq!(classify("Task:Fast", false), RecordClass::Task("Fast"));
        assert_eq!(classify("Routine:R", false), RecordClass::Skip);
        assert_eq!(classify("Map:Local", false), RecordClass::Skip);
        assert_eq!(classify("Cxn:Standard", false), RecordClass::Skip);
        assert_eq!(classify("__hidden", false), RecordClass::Skip);
        assert_eq!(classify("Counter", true), RecordClass::Skip);
        assert_eq!(classify("Local:1:I", false), RecordClass::Module("Local"));
        assert_eq!(classify("Counter", false), RecordClass::Tag);
    }

    #[test]
    fn test_upload_pages_and_filters() {
        let mut channel = ScriptedChannel::default();
        let mut page1 = symbol_record(1, "Counter", 0x00C4, [0; 3]);
        page1.extend(symbol_record(5, "Program:MainProgram", 0x1068, [0; 3]));
        page1.extend(symbol_record(6, "Task:MainTask", 0x1070, [0; 3]));
        let mut page2 = symbol_record(9, "Values", 0x20C3, [10, 0, 0]);
        page2.extend(symbol_record(11, "Local:1:I", 0x00C4, [0; 3]));
        page2.extend(symbol_record(12, "Routine:Main", 0x00C4, [0; 3]));
        page2.extend(symbol_record(13, "__Hidden", 0x00C4, [0; 3]));
        page2.extend(symbol_record(14, "Reserved", 0x10C4, [0; 3]));
        channel
            .reply(SERVICE_GET_INSTANCE_ATTRIBUTE_LIST, STATUS_PARTIAL, page1)
            .reply(SERVICE_GET_INSTANCE_ATTRIBUTE_LIST, STATUS_SUCCESS, page2);

        let cache = SymbolCache::upload(&mut channel, false).unwrap();

        // second page resumes after the last instance of the first
        assert_eq!(&channel.sent[1][2..6], [0x20, 0x6B, 0x24, 0x07]);
        assert_eq!(&channel.sent[0][6..8], [0x07, 0x00]);

        let names: Vec<&str> = cache.tags(None).map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Counter", "Local:1:I", "Values"]);
        assert_eq!(cache.programs(), ["MainProgram"]);
        assert_eq!(cache.tasks(), ["MainTask"]);
        assert_eq!(cache.modules()["Local"], ["Local:1:I"]);

        let values = cache.tag(None, "values").unwrap();
        assert_eq!(values.dimensions, [10]);
        assert_eq!(values.instance_id, 9);
    }

    #[test]
    fn test_upload_program_scope() {
        let mut channel = ScriptedChannel::default();
        channel
            .reply(
                SERVICE_GET_INSTANCE_ATTRIBUTE_LIST,
                STATUS_SUCCESS,
                symbol_record(2, "Program:Main", 0x1068, [0; 3]),
            )
            .reply(
                SERVICE_GET_INSTANCE_ATTRIBUTE_LIST,
                STATUS_SUCCESS,
                symbol_record(3, "Local", 0x00C2, [0; 3]),
            );
        let cache = SymbolCache::upload(&mut channel, true).unwrap();
        assert!(cache.tag(Some("Main"), "Local").is_some());
        assert!(cache.tag(None, "Local").is_none());
        // program request starts with the symbolic program segment
        assert_eq!(&channel.sent[1][2..4], [0x91, 0x0C]);
        assert_eq!(&channel.sent[1][4..16], b"Program:Main");
    }

    #[test]
    fn test_upload_stops_at_last_instance_id() {
        let mut channel = ScriptedChannel::default();
        channel.reply(
            SERVICE_GET_INSTANCE_ATTRIBUTE_LIST,
            STATUS_PARTIAL,
            symbol_record(u32::MAX, "Last", 0x00C4, [0; 3]),
        );
        let mut cache = SymbolCache::new();
        cache.upload_scope(&mut channel, None).unwrap();
        assert_eq!(channel.sent.len(), 1);
        assert_eq!(cache.tag(None, "Last").map(|t| t.instance_id), Some(u32::MAX));
    }

    #[test]
    fn test_upload_error_status() {
        let mut channel = ScriptedChannel::default();
        channel.reply(SERVICE_GET_INSTANCE_ATTRIBUTE_LIST, 0x05, Vec::new());
        assert!(matches!(
            SymbolCache::upload(&mut channel, false),
            Err(CipError::Status { status: 0x05, .. })
        ));
    }

    #[test]
    fn test_template_resolution_in_chunks() {
        let body = template_body("MotorType", &motor_members());
        let (first, second) = body.split_at(20);
        let mut channel = ScriptedChannel::default();
        channel
            .reply(
                SERVICE_GET_INSTANCE_ATTRIBUTE_LIST,
                STATUS_SUCCESS,
                symbol_record(1, "Motor", 0x8000 | 0x0123, [0; 3]),
            )
            .reply(
                SERVICE_GET_ATTRIBUTE_LIST,
                STATUS_SUCCESS,
                template_attributes(30, 20, 5, 0xBEEF),
            )
            .reply(SERVICE_READ_TAG, STATUS_PARTIAL, first.to_vec())
            .reply(SERVICE_READ_TAG, STATUS_SUCCESS, second.to_vec());

        let cache = SymbolCache::upload(&mut channel, false).unwrap();
        let template = cache.template(0x0123).unwrap();
        assert_eq!(template.name, "MotorType");
        assert_eq!(template.handle, 0xBEEF);
        assert_eq!(template.structure_size, 20);
        assert_eq!(template.members.len(), 5);
        assert!(template.private.contains("ZZZZZZZZZZMotor0"));
        assert_eq!(template.public_members().count(), 4);
        assert_eq!(template.member("faulted").unwrap().bit, Some(1));
        assert_eq!(template.member("Counts").unwrap().dimensions, [3]);
        assert!(!template.is_string);
        assert!(cache.template_by_name("motortype").is_some());

        // second body read asks for the remainder at the new offset
        let second_read = &channel.sent[3];
        let data = &second_read[second_read.len() - 6..];
        assert_eq!(&data[..4], 20u32.to_le_bytes());
        assert_eq!(&data[4..], (30u16 * 4 - 21 - 20).to_le_bytes());

        let speed = cache.get_tag_info(None, "Motor", &["Speed"]).unwrap();
        assert_eq!(speed.kind, TagKind::Atomic(DataType::Real));
        assert_eq!(speed.offset, 4);
        assert_eq!(cache.type_name(cache.tag(None, "Motor").unwrap()), "MotorType");
    }

    #[test]
    fn test_nested_template_resolution() {
        let mut channel = ScriptedChannel::default();
        channel
            .reply(
                SERVICE_GET_INSTANCE_ATTRIBUTE_LIST,
                STATUS_SUCCESS,
                symbol_record(1, "Line", 0x8000 | 0x0200, [0; 3]),
            )
            .reply(SERVICE_GET_ATTRIBUTE_LIST, STATUS_SUCCESS, template_attributes(20, 24, 1, 1))
            .reply(
                SERVICE_READ_TAG,
                STATUS_SUCCESS,
                template_body("LineType", &[("Drive", 0, 0x8000 | 0x0123, 0)]),
            )
            .reply(SERVICE_GET_ATTRIBUTE_LIST, STATUS_SUCCESS, template_attributes(30, 20, 5, 2))
            .reply(SERVICE_READ_TAG, STATUS_SUCCESS, template_body("MotorType", &motor_members()));

        let cache = SymbolCache::upload(&mut channel, false).unwrap();
        assert_eq!(cache.data_types().count(), 2);
        let running = cache.get_tag_info(None, "Line", &["Drive", "Running"]).unwrap();
        assert_eq!(running.bit, Some(0));

        let err = cache.get_tag_info(None, "Line", &["Drive", "Missing"]).unwrap_err();
        assert_eq!(err.to_string(), "tag not found: Line.Drive.Missing");
        assert!(matches!(
            cache.get_tag_info(None, "Nope", &[]),
            Err(CipError::TagNotFound { .. })
        ));
    }

    #[test]
    fn test_string_template_detection() {
        let attributes = TemplateAttributes {
            object_definition_size: 20,
            structure_size: 88,
            member_count: 2,
            handle: 0x0FCE,
        };
        let body = template_body("STRING", &[("LEN", 0, 0x00C4, 0), ("DATA", 82, 0x20C2, 4)]);
        let template = parse_template(0x0FCE, &attributes, &body).unwrap();
        assert!(template.is_string);
        assert_eq!(template.string_capacity(), Some(82));

        let body = template_body("Pair", &[("LEN", 0, 0x00C4, 0), ("DATA", 0, 0x00C4, 4)]);
        let template = parse_template(1, &attributes, &body).unwrap();
        assert!(!template.is_string);
    }

    #[test]
    fn test_truncated_template_body() {
        let attributes = TemplateAttributes {
            object_definition_size: 20,
            structure_size: 8,
            member_count: 3,
            handle: 1,
        };
        assert!(parse_template(1, &attributes, &[0x00, 0x00, 0xC4, 0x00]).is_err());
    }
}

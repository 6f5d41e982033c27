pub mod dqe;
pub mod execute;
pub mod parse;
pub mod select;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::r#type::{ComplexType, GoKind, TypeId, TypeIdentity};
use crate::debugger::debugee::dwarf::DebugInformation;
use crate::debugger::debugee::Debugee;
use crate::debugger::read_memory_by_pid;
use crate::debugger::ExplorationContext;
use crate::{muted_error, weak_error};
use bytes::Bytes;
use std::fmt::{Display, Formatter};

/// Caps applied to composite value loading.
#[derive(Debug, Clone, Copy)]
pub struct LoadConfig {
    pub max_string_len: usize,
    pub max_array_values: usize,
    pub max_recursion: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_string_len: 64,
            max_array_values: 64,
            max_recursion: 1,
        }
    }
}

/// Value load flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueFlags {
    /// Memory of the value (or its part) cannot be read.
    pub unreadable: bool,
    /// Value is cut by one of the load caps.
    pub truncated: bool,
    /// Value is a temporary escaped to the heap by an injected call.
    pub escaped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupportedScalar {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl Display for SupportedScalar {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SupportedScalar::Bool(b) => f.write_fmt(format_args!("{b}")),
            SupportedScalar::Int(i) => f.write_fmt(format_args!("{i}")),
            SupportedScalar::Uint(u) => f.write_fmt(format_args!("{u}")),
            SupportedScalar::Float(fl) => f.write_fmt(format_args!("{fl}")),
        }
    }
}

/// Representation of a loaded value.
#[derive(Debug, Clone)]
pub enum ValueRepr {
    Scalar(Option<SupportedScalar>),
    String {
        value: String,
        len: u64,
    },
    Slice {
        items: Vec<Value>,
        len: u64,
        cap: u64,
        data_ptr: usize,
    },
    Array {
        items: Vec<Value>,
    },
    Struct {
        fields: Vec<(String, Value)>,
    },
    Pointer {
        value: Option<usize>,
        target_type: TypeIdentity,
        target_type_size: Option<u64>,
    },
    Interface {
        concrete_type: Option<String>,
        value: Option<Box<Value>>,
        data_ptr: Option<usize>,
    },
    Map {
        pairs: Vec<(Value, Value)>,
        len: u64,
    },
    Chan {
        qcount: u64,
        dataqsiz: u64,
        closed: bool,
    },
    Func {
        addr: Option<usize>,
        name: Option<String>,
    },
    /// Raw bytes of a value with an unsupported type.
    Raw(Vec<u8>),
}

/// Typed value loaded from the tracee memory.
#[derive(Debug, Clone)]
pub struct Value {
    pub type_ident: TypeIdentity,
    /// Address in tracee memory, `None` for computed (non addressable) values.
    pub address: Option<usize>,
    pub flags: ValueFlags,
    pub repr: ValueRepr,
}

impl Value {
    pub fn unreadable(type_ident: TypeIdentity, address: Option<usize>) -> Self {
        Value {
            type_ident,
            address,
            flags: ValueFlags {
                unreadable: true,
                ..Default::default()
            },
            repr: ValueRepr::Scalar(None),
        }
    }

    /// Synthetic value from a literal, used by expression arithmetic.
    pub fn from_scalar(scalar: SupportedScalar) -> Self {
        let ty = match scalar {
            SupportedScalar::Bool(_) => "bool",
            SupportedScalar::Int(_) => "int64",
            SupportedScalar::Uint(_) => "uint64",
            SupportedScalar::Float(_) => "float64",
        };
        Value {
            type_ident: TypeIdentity::no_namespace(ty),
            address: None,
            flags: ValueFlags::default(),
            repr: ValueRepr::Scalar(Some(scalar)),
        }
    }

    pub fn as_scalar(&self) -> Option<&SupportedScalar> {
        match self.repr {
            ValueRepr::Scalar(ref s) => s.as_ref(),
            _ => None,
        }
    }

    /// Boolean interpretation, used by breakpoint conditions.
    pub fn as_bool(&self) -> Option<bool> {
        match self.repr {
            ValueRepr::Scalar(Some(SupportedScalar::Bool(b))) => Some(b),
            ValueRepr::Scalar(Some(SupportedScalar::Int(i))) => Some(i != 0),
            ValueRepr::Scalar(Some(SupportedScalar::Uint(u))) => Some(u != 0),
            _ => None,
        }
    }

    /// Field of a structure-like value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self.repr {
            ValueRepr::Struct { ref fields } => fields
                .iter()
                .find_map(|(fname, val)| (fname == name).then_some(val)),
            _ => None,
        }
    }
}

/// Context of value parsing: where to read memory from and how much to load.
pub struct ParseContext<'a> {
    pub debugee: &'a Debugee,
    pub expl_ctx: &'a ExplorationContext,
    pub config: LoadConfig,
    /// Interface type descriptor reader, `None` if the runtime layout is unavailable.
    type_names: Option<GoTypeNameReader>,
}

impl<'a> ParseContext<'a> {
    pub fn new(debugee: &'a Debugee, expl_ctx: &'a ExplorationContext, config: LoadConfig) -> Self {
        let type_names = debugee
            .program_debug_info()
            .ok()
            .and_then(|di| GoTypeNameReader::resolve(debugee, expl_ctx, di));
        Self {
            debugee,
            expl_ctx,
            config,
            type_names,
        }
    }

    fn pid(&self) -> nix::unistd::Pid {
        self.expl_ctx.pid_on_focus()
    }

    fn read(&self, addr: usize, len: usize) -> Option<Bytes> {
        muted_error!(read_memory_by_pid(self.pid(), addr, len)).map(Bytes::from)
    }
}

/// Parse a typed value from raw memory.
///
/// # Arguments
///
/// * `ctx`: parse context
/// * `r#type`: type graph of the value
/// * `type_id`: concrete type inside the graph
/// * `address`: value address in the tracee memory, if addressable
/// * `bytes`: preloaded value bytes, read from `address` when `None`
pub fn parse_value(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    address: Option<usize>,
    bytes: Option<Bytes>,
) -> Value {
    parse_value_rec(ctx, r#type, type_id, address, bytes, 0)
}

fn type_size(_ctx: &ParseContext, r#type: &ComplexType, type_id: TypeId) -> Option<u64> {
    r#type.size_no_eval(type_id)
}

fn parse_value_rec(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    address: Option<usize>,
    bytes: Option<Bytes>,
    depth: usize,
) -> Value {
    let type_ident = r#type.identity(type_id);
    let resolved = r#type.resolve(type_id);
    let kind = r#type.go_kind(type_id);

    let size = type_size(ctx, r#type, resolved).unwrap_or(0) as usize;
    let bytes = match bytes {
        Some(b) => b,
        None => match address.and_then(|addr| ctx.read(addr, size)) {
            Some(b) => b,
            None => return Value::unreadable(type_ident, address),
        },
    };

    let mut flags = ValueFlags::default();

    let repr = match kind {
        GoKind::Bool => ValueRepr::Scalar(
            bytes
                .first()
                .map(|&b| SupportedScalar::Bool(b != 0)),
        ),
        GoKind::Int | GoKind::Int8 | GoKind::Int16 | GoKind::Int32 | GoKind::Int64 => {
            ValueRepr::Scalar(decode_signed(&bytes).map(SupportedScalar::Int))
        }
        GoKind::Uint
        | GoKind::Uint8
        | GoKind::Uint16
        | GoKind::Uint32
        | GoKind::Uint64
        | GoKind::Uintptr
        | GoKind::UnsafePointer => ValueRepr::Scalar(decode_unsigned(&bytes).map(SupportedScalar::Uint)),
        GoKind::Float32 => ValueRepr::Scalar(
            (bytes.len() >= 4).then(|| {
                SupportedScalar::Float(f32::from_ne_bytes(
                    bytes[..4].try_into().expect("infallible"),
                ) as f64)
            }),
        ),
        GoKind::Float64 => ValueRepr::Scalar((bytes.len() >= 8).then(|| {
            SupportedScalar::Float(f64::from_ne_bytes(
                bytes[..8].try_into().expect("infallible"),
            ))
        })),
        GoKind::String => {
            let (value, len, truncated) = parse_string(ctx, &bytes);
            flags.truncated = truncated;
            ValueRepr::String { value, len }
        }
        GoKind::Slice => {
            let (repr, truncated) = parse_slice(ctx, r#type, resolved, &bytes, depth);
            flags.truncated = truncated;
            repr
        }
        GoKind::Array => {
            let (repr, truncated) = parse_array(ctx, r#type, resolved, address, &bytes, depth);
            flags.truncated = truncated;
            repr
        }
        GoKind::Struct => {
            if depth >= ctx.config.max_recursion {
                flags.truncated = true;
                ValueRepr::Struct { fields: vec![] }
            } else {
                parse_struct(ctx, r#type, resolved, address, &bytes, depth)
            }
        }
        GoKind::Ptr => {
            let value = decode_unsigned(&bytes).map(|v| v as usize);
            let target = r#type.pointer_target(resolved);
            ValueRepr::Pointer {
                value,
                target_type: target
                    .map(|t| r#type.identity(t))
                    .unwrap_or_else(TypeIdentity::unknown),
                target_type_size: target.and_then(|t| type_size(ctx, r#type, t)),
            }
        }
        GoKind::Interface => parse_interface(ctx, r#type, resolved, &bytes, depth),
        GoKind::Map => {
            let (repr, truncated) = parse_map(ctx, r#type, resolved, &bytes, depth);
            flags.truncated = truncated;
            repr
        }
        GoKind::Chan => parse_chan(ctx, r#type, resolved, &bytes),
        GoKind::Func => {
            // a func value is a pointer to a funcval, first word is the entry pc
            let fn_ptr = decode_unsigned(&bytes).map(|v| v as usize);
            let entry = fn_ptr
                .filter(|&p| p != 0)
                .and_then(|p| ctx.read(p, 8))
                .and_then(|b| decode_unsigned(&b))
                .map(|pc| pc as usize);
            let name = entry.and_then(|pc| {
                let pc = RelocatedAddress::from(pc);
                let di = ctx.debugee.debug_info(pc).ok()?;
                let global = pc.into_global(ctx.debugee).ok()?;
                di.find_function_by_pc(global).ok().flatten()?.full_name()
            });
            ValueRepr::Func { addr: entry, name }
        }
        _ => ValueRepr::Raw(bytes.to_vec()),
    };

    Value {
        type_ident,
        address,
        flags,
        repr,
    }
}

fn decode_signed(bytes: &[u8]) -> Option<i64> {
    Some(match bytes.len() {
        1 => bytes[0] as i8 as i64,
        2 => i16::from_ne_bytes(bytes[..2].try_into().ok()?) as i64,
        4 => i32::from_ne_bytes(bytes[..4].try_into().ok()?) as i64,
        8 => i64::from_ne_bytes(bytes[..8].try_into().ok()?),
        _ => return None,
    })
}

fn decode_unsigned(bytes: &[u8]) -> Option<u64> {
    Some(match bytes.len() {
        1 => bytes[0] as u64,
        2 => u16::from_ne_bytes(bytes[..2].try_into().ok()?) as u64,
        4 => u32::from_ne_bytes(bytes[..4].try_into().ok()?) as u64,
        8 => u64::from_ne_bytes(bytes[..8].try_into().ok()?),
        _ => return None,
    })
}

/// Decode a string header (data pointer + length) and read the content.
fn parse_string(ctx: &ParseContext, header: &[u8]) -> (String, u64, bool) {
    let Some(data_ptr) = header.get(..8).and_then(decode_unsigned) else {
        return (String::new(), 0, false);
    };
    let Some(len) = header.get(8..16).and_then(decode_unsigned) else {
        return (String::new(), 0, false);
    };

    let read_len = (len as usize).min(ctx.config.max_string_len);
    let truncated = len as usize > read_len;
    let content = if read_len == 0 || data_ptr == 0 {
        String::new()
    } else {
        ctx.read(data_ptr as usize, read_len)
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or_default()
    };
    (content, len, truncated)
}

/// Decode a slice header and load elements, bounds checked against the capacity.
fn parse_slice(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    header: &[u8],
    depth: usize,
) -> (ValueRepr, bool) {
    let data_ptr = header.get(..8).and_then(decode_unsigned).unwrap_or(0) as usize;
    let len = header.get(8..16).and_then(decode_unsigned).unwrap_or(0);
    let cap = header.get(16..24).and_then(decode_unsigned).unwrap_or(0);

    // element type from the data pointer member of the header structure
    let elem_type = r#type
        .member(type_id, "array")
        .and_then(|m| m.type_ref)
        .and_then(|ptr| r#type.pointer_target(ptr));

    let mut items = vec![];
    let load_count = (len.min(cap) as usize).min(ctx.config.max_array_values);
    let truncated = len as usize > load_count;

    if let Some(elem_type) = elem_type {
        let elem_size = type_size(ctx, r#type, elem_type).unwrap_or(0) as usize;
        if elem_size != 0 && data_ptr != 0 && depth < ctx.config.max_recursion {
            for i in 0..load_count {
                let addr = data_ptr + i * elem_size;
                let bytes = ctx.read(addr, elem_size);
                items.push(parse_value_rec(
                    ctx,
                    r#type,
                    elem_type,
                    Some(addr),
                    bytes,
                    depth + 1,
                ));
            }
        }
    }

    (
        ValueRepr::Slice {
            items,
            len,
            cap,
            data_ptr,
        },
        truncated,
    )
}

fn parse_array(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    address: Option<usize>,
    bytes: &Bytes,
    depth: usize,
) -> (ValueRepr, bool) {
    let Some((elem_type, len)) = r#type.array_info(type_id) else {
        return (ValueRepr::Array { items: vec![] }, false);
    };
    let Some(elem_type) = elem_type else {
        return (ValueRepr::Array { items: vec![] }, false);
    };

    let len = len.unwrap_or(0).max(0) as usize;
    let elem_size = type_size(ctx, r#type, elem_type).unwrap_or(0) as usize;
    let load_count = len.min(ctx.config.max_array_values);
    let truncated = len > load_count;

    let mut items = vec![];
    if elem_size != 0 && depth < ctx.config.max_recursion {
        for i in 0..load_count {
            let from = i * elem_size;
            let to = from + elem_size;
            if bytes.len() < to {
                break;
            }
            items.push(parse_value_rec(
                ctx,
                r#type,
                elem_type,
                address.map(|a| a + from),
                Some(bytes.slice(from..to)),
                depth + 1,
            ));
        }
    }

    (ValueRepr::Array { items }, truncated)
}

fn parse_struct(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    address: Option<usize>,
    bytes: &Bytes,
    depth: usize,
) -> ValueRepr {
    let members = r#type.members(type_id).to_vec();
    let mut fields = Vec::with_capacity(members.len());
    for member in members {
        let Some(member_type) = member.type_ref else {
            continue;
        };
        let offset = member.offset.unwrap_or(0) as usize;
        let member_size = type_size(ctx, r#type, member_type).unwrap_or(0) as usize;
        let member_bytes = (bytes.len() >= offset + member_size)
            .then(|| bytes.slice(offset..offset + member_size));
        let value = parse_value_rec(
            ctx,
            r#type,
            member_type,
            address.map(|a| a + offset),
            member_bytes,
            depth + 1,
        );
        fields.push((member.name.unwrap_or_default(), value));
    }
    ValueRepr::Struct { fields }
}

/// Decode an interface value: a (type descriptor, data pointer) pair. The concrete
/// type is recovered through the runtime type descriptor and promoted by looking the
/// name up in the debug information.
fn parse_interface(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    bytes: &Bytes,
    depth: usize,
) -> ValueRepr {
    let word0 = bytes.get(..8).and_then(decode_unsigned).unwrap_or(0) as usize;
    let data_ptr = bytes.get(8..16).and_then(decode_unsigned).map(|v| v as usize);

    if word0 == 0 {
        return ValueRepr::Interface {
            concrete_type: None,
            value: None,
            data_ptr,
        };
    }

    // the first word is *itab for non-empty interfaces and *_type for empty ones;
    // an itab keeps the concrete type in its second word
    let is_eface = r#type
        .members(type_id)
        .iter()
        .any(|m| m.name.as_deref() == Some("_type"));
    let type_descr_addr = if is_eface {
        Some(word0)
    } else {
        ctx.read(word0 + 8, 8)
            .and_then(|b| decode_unsigned(&b))
            .map(|v| v as usize)
    };

    let concrete_type = type_descr_addr
        .filter(|&addr| addr != 0)
        .and_then(|addr| ctx.type_names.as_ref()?.name_of(ctx, addr));

    let value = concrete_type.as_ref().and_then(|name| {
        let data_ptr = data_ptr.filter(|&p| p != 0)?;
        let debug_info = ctx.debugee.program_debug_info().ok()?;
        let type_ref = debug_info.find_type_die_ref(name)?;
        let parser = crate::debugger::debugee::dwarf::r#type::TypeParser::new();
        let concrete = parser.parse_in(debug_info, debug_info.unit_ensure(0), type_ref);
        if depth >= ctx.config.max_recursion {
            return None;
        }
        Some(Box::new(parse_value_rec(
            ctx,
            &concrete,
            concrete.root(),
            Some(data_ptr),
            None,
            depth + 1,
        )))
    });

    ValueRepr::Interface {
        concrete_type,
        value,
        data_ptr,
    }
}

/// Walk the runtime hash table layout of a map value.
/// Iteration order is the in-memory bucket order: unspecified for users but
/// deterministic for a fixed memory state.
fn parse_map(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    bytes: &Bytes,
    depth: usize,
) -> (ValueRepr, bool) {
    // map value is a pointer to runtime.hmap
    let Some(hmap_ptr) = bytes.get(..8).and_then(decode_unsigned).map(|v| v as usize) else {
        return (ValueRepr::Map { pairs: vec![], len: 0 }, false);
    };
    if hmap_ptr == 0 {
        return (ValueRepr::Map { pairs: vec![], len: 0 }, false);
    }

    // hmap type behind the map typedef pointer
    let Some(hmap_type) = r#type.pointer_target(type_id) else {
        return (ValueRepr::Map { pairs: vec![], len: 0 }, false);
    };

    let member_off = |name: &str| r#type.member(hmap_type, name).and_then(|m| m.offset);
    let (Some(count_off), Some(b_off), Some(buckets_off)) =
        (member_off("count"), member_off("B"), member_off("buckets"))
    else {
        return (ValueRepr::Map { pairs: vec![], len: 0 }, false);
    };

    let count = ctx
        .read(hmap_ptr + count_off as usize, 8)
        .and_then(|b| decode_unsigned(&b))
        .unwrap_or(0);
    let b = ctx
        .read(hmap_ptr + b_off as usize, 1)
        .map(|b| b[0])
        .unwrap_or(0);
    let buckets_ptr = ctx
        .read(hmap_ptr + buckets_off as usize, 8)
        .and_then(|b| decode_unsigned(&b))
        .unwrap_or(0) as usize;

    // bucket structure: tophash [8]uint8, keys [8]K, values [8]V, overflow ptr
    let bucket_type = r#type
        .member(hmap_type, "buckets")
        .and_then(|m| m.type_ref)
        .and_then(|ptr| r#type.pointer_target(ptr));

    let mut pairs = vec![];
    let mut truncated = false;

    if let Some(bucket_type) = bucket_type {
        let keys_member = r#type.member(bucket_type, "keys").cloned();
        let values_member = r#type.member(bucket_type, "values").cloned();
        let overflow_off = r#type
            .member(bucket_type, "overflow")
            .and_then(|m| m.offset);
        let bucket_size = type_size(ctx, r#type, bucket_type).unwrap_or(0) as usize;

        if let (Some(keys_member), Some(values_member)) = (keys_member, values_member) {
            let key_type = keys_member
                .type_ref
                .and_then(|arr| r#type.array_info(arr))
                .and_then(|(elem, _)| elem);
            let value_type = values_member
                .type_ref
                .and_then(|arr| r#type.array_info(arr))
                .and_then(|(elem, _)| elem);

            if let (Some(key_type), Some(value_type)) = (key_type, value_type) {
                let key_size = type_size(ctx, r#type, key_type).unwrap_or(0) as usize;
                let value_size = type_size(ctx, r#type, value_type).unwrap_or(0) as usize;
                let nbuckets = 1_usize << b;
                const MIN_TOP_HASH: u8 = 5;
                const BUCKET_CNT: usize = 8;

                'outer: for bucket_idx in 0..nbuckets {
                    let mut bucket_addr = buckets_ptr + bucket_idx * bucket_size;

                    // a bucket and its overflow chain
                    while bucket_addr != 0 {
                        let Some(tophash) = ctx.read(bucket_addr, BUCKET_CNT) else {
                            break;
                        };

                        for slot in 0..BUCKET_CNT {
                            if tophash[slot] < MIN_TOP_HASH {
                                continue;
                            }
                            if pairs.len() >= ctx.config.max_array_values {
                                truncated = true;
                                break 'outer;
                            }

                            let key_addr = bucket_addr
                                + keys_member.offset.unwrap_or(0) as usize
                                + slot * key_size;
                            let value_addr = bucket_addr
                                + values_member.offset.unwrap_or(0) as usize
                                + slot * value_size;

                            let key = parse_value_rec(
                                ctx,
                                r#type,
                                key_type,
                                Some(key_addr),
                                None,
                                depth + 1,
                            );
                            let value = parse_value_rec(
                                ctx,
                                r#type,
                                value_type,
                                Some(value_addr),
                                None,
                                depth + 1,
                            );
                            pairs.push((key, value));
                        }

                        bucket_addr = overflow_off
                            .and_then(|off| ctx.read(bucket_addr + off as usize, 8))
                            .and_then(|b| decode_unsigned(&b))
                            .unwrap_or(0) as usize;
                    }
                }
            }
        }
    }

    (ValueRepr::Map { pairs, len: count }, truncated)
}

/// Decode channel state from the runtime hchan structure.
fn parse_chan(
    ctx: &ParseContext,
    r#type: &ComplexType,
    type_id: TypeId,
    bytes: &Bytes,
) -> ValueRepr {
    let empty = ValueRepr::Chan {
        qcount: 0,
        dataqsiz: 0,
        closed: false,
    };

    let Some(hchan_ptr) = bytes.get(..8).and_then(decode_unsigned).map(|v| v as usize) else {
        return empty;
    };
    if hchan_ptr == 0 {
        return empty;
    }
    let Some(hchan_type) = r#type.pointer_target(type_id) else {
        return empty;
    };

    let read_field = |name: &str, size: usize| -> Option<u64> {
        let off = r#type.member(hchan_type, name)?.offset?;
        ctx.read(hchan_ptr + off as usize, size)
            .and_then(|b| decode_unsigned(&b))
    };

    ValueRepr::Chan {
        qcount: read_field("qcount", 8).unwrap_or(0),
        dataqsiz: read_field("dataqsiz", 8).unwrap_or(0),
        closed: read_field("closed", 4).unwrap_or(0) != 0,
    }
}

/// Reader of runtime type descriptor names, the base of the interface promotion.
struct GoTypeNameReader {
    /// Base of the types blob of the main module.
    types_base: u64,
    /// Offset of the name offset field inside `runtime._type`.
    str_field_offset: u64,
}

impl GoTypeNameReader {
    fn resolve(
        debugee: &Debugee,
        expl_ctx: &ExplorationContext,
        debug_info: &DebugInformation,
    ) -> Option<GoTypeNameReader> {
        // offset of the name field inside the type descriptor
        let type_descr_ref = debug_info
            .find_type_die_ref("runtime._type")
            .or_else(|| debug_info.find_type_die_ref("internal/abi.Type"))?;
        let parser = crate::debugger::debugee::dwarf::r#type::TypeParser::new();
        let descr = parser.parse_in(debug_info, debug_info.unit_ensure(0), type_descr_ref);
        let str_field_offset = descr
            .member(descr.root(), "str")
            .or_else(|| descr.member(descr.root(), "Str"))
            .and_then(|m| m.offset)?;

        // the types blob base lives in the module data
        let md_vars = debug_info
            .find_variables(expl_ctx.location(), "runtime.firstmoduledata")
            .ok()?;
        let md_var = md_vars.first()?;
        let md_addr = md_var.address(expl_ctx, debugee)?;

        let md_type_ref = debug_info.find_type_die_ref("runtime.moduledata")?;
        let parser = crate::debugger::debugee::dwarf::r#type::TypeParser::new();
        let md_type = parser.parse_in(debug_info, debug_info.unit_ensure(0), md_type_ref);
        let types_off = md_type.member(md_type.root(), "types").and_then(|m| m.offset)?;

        let types_base = weak_error!(read_memory_by_pid(
            expl_ctx.pid_on_focus(),
            md_addr.as_usize() + types_off as usize,
            8
        ))
        .and_then(|b| decode_unsigned(&b))?;

        Some(GoTypeNameReader {
            types_base,
            str_field_offset,
        })
    }

    /// Read the name of a type descriptor located at `descr_addr`.
    fn name_of(&self, ctx: &ParseContext, descr_addr: usize) -> Option<String> {
        let name_off = ctx
            .read(descr_addr + self.str_field_offset as usize, 4)
            .and_then(|b| decode_unsigned(&b))? as u32;

        let name_addr = self.types_base as usize + name_off as usize;
        // name layout: 1 byte flags, varint length, utf-8 bytes
        let head = ctx.read(name_addr, 11)?;
        let (len, varint_size) = read_varint(&head[1..])?;
        let name = ctx.read(name_addr + 1 + varint_size, len as usize)?;
        let mut name = String::from_utf8_lossy(&name).to_string();
        // descriptor names of non-exported types are prefixed with a star
        if let Some(stripped) = name.strip_prefix('*') {
            name = stripped.to_string();
        }
        Some(name)
    }
}

/// Decode an unsigned varint, return (value, consumed bytes).
fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << (i * 7);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode_signed(&(-5_i32).to_ne_bytes()), Some(-5));
        assert_eq!(decode_unsigned(&42_u64.to_ne_bytes()), Some(42));
        assert_eq!(decode_signed(&[1, 2, 3]), None);
    }

    #[test]
    fn test_read_varint() {
        assert_eq!(read_varint(&[0x05]), Some((5, 1)));
        assert_eq!(read_varint(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_varint(&[0x80]), None);
    }
}

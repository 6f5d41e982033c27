use crate::debugger::debugee::dwarf::eval::ExpressionEvaluator;
use crate::debugger::debugee::dwarf::unit::{DieRef, DieVariant, Entry, Unit};
use crate::debugger::debugee::dwarf::{ContextualDieRef, DebugInformation};
use crate::debugger::ExplorationContext;
use crate::resolve_unit_call;
use gimli::{DebugInfoOffset, DwAte, UnitOffset};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};

/// Identity of a type inside the debug information, global offset of its die.
pub type TypeId = DieRef;

/// Evaluation context for type size calculation and value loading.
pub struct EvaluationContext<'a> {
    pub evaluator: &'a ExpressionEvaluator<'a>,
    pub expl_ctx: &'a ExplorationContext,
}

/// Kind of a Go type as the runtime sees it, mirrors `reflect.Kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoKind {
    Invalid,
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Uintptr,
    Float32,
    Float64,
    Complex64,
    Complex128,
    Array,
    Chan,
    Func,
    Interface,
    Map,
    Ptr,
    Slice,
    String,
    Struct,
    UnsafePointer,
}

impl GoKind {
    fn from_attr(value: u64) -> GoKind {
        match value {
            1 => GoKind::Bool,
            2 => GoKind::Int,
            3 => GoKind::Int8,
            4 => GoKind::Int16,
            5 => GoKind::Int32,
            6 => GoKind::Int64,
            7 => GoKind::Uint,
            8 => GoKind::Uint8,
            9 => GoKind::Uint16,
            10 => GoKind::Uint32,
            11 => GoKind::Uint64,
            12 => GoKind::Uintptr,
            13 => GoKind::Float32,
            14 => GoKind::Float64,
            15 => GoKind::Complex64,
            16 => GoKind::Complex128,
            17 => GoKind::Array,
            18 => GoKind::Chan,
            19 => GoKind::Func,
            20 => GoKind::Interface,
            21 => GoKind::Map,
            22 => GoKind::Ptr,
            23 => GoKind::Slice,
            24 => GoKind::String,
            25 => GoKind::Struct,
            26 => GoKind::UnsafePointer,
            _ => GoKind::Invalid,
        }
    }

    /// Guess the kind of a type from its rendered name.
    /// Used when the compiler did not emit the runtime kind attribute.
    fn from_name(name: &str) -> GoKind {
        if name == "string" {
            return GoKind::String;
        }
        if name == "error" || name.starts_with("interface") {
            return GoKind::Interface;
        }
        if name.starts_with("[]") {
            return GoKind::Slice;
        }
        if name.starts_with("map[") {
            return GoKind::Map;
        }
        if name.starts_with("chan ") || name.starts_with("chan<-") || name.starts_with("<-chan") {
            return GoKind::Chan;
        }
        if name.starts_with('*') {
            return GoKind::Ptr;
        }
        if name.starts_with("func") {
            return GoKind::Func;
        }
        if name.starts_with('[') {
            return GoKind::Array;
        }
        GoKind::Invalid
    }
}

/// Member of a structure type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureMember {
    pub name: Option<String>,
    pub offset: Option<u64>,
    pub type_ref: Option<TypeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarType {
    pub name: Option<String>,
    pub byte_size: Option<u64>,
    pub encoding: Option<DwAte>,
}

/// One type entity in a type graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDeclaration {
    Scalar(ScalarType),
    Structure {
        name: Option<String>,
        byte_size: Option<u64>,
        go_kind: Option<u64>,
        members: Vec<StructureMember>,
    },
    Array {
        name: Option<String>,
        byte_size: Option<u64>,
        element_type: Option<TypeId>,
        len: Option<i64>,
    },
    Pointer {
        name: Option<String>,
        go_kind: Option<u64>,
        target_type: Option<TypeId>,
    },
    Typedef {
        name: Option<String>,
        go_kind: Option<u64>,
        target_type: Option<TypeId>,
    },
    Function {
        name: Option<String>,
    },
    Unknown {
        name: Option<String>,
    },
}

impl TypeDeclaration {
    pub fn name(&self) -> Option<&str> {
        match self {
            TypeDeclaration::Scalar(s) => s.name.as_deref(),
            TypeDeclaration::Structure { name, .. } => name.as_deref(),
            TypeDeclaration::Array { name, .. } => name.as_deref(),
            TypeDeclaration::Pointer { name, .. } => name.as_deref(),
            TypeDeclaration::Typedef { name, .. } => name.as_deref(),
            TypeDeclaration::Function { name } => name.as_deref(),
            TypeDeclaration::Unknown { name } => name.as_deref(),
        }
    }
}

/// Human readable type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeIdentity(String);

impl TypeIdentity {
    pub fn unknown() -> Self {
        TypeIdentity("?".to_string())
    }

    pub fn no_namespace(name: impl ToString) -> Self {
        TypeIdentity(name.to_string())
    }

    #[inline(always)]
    pub fn name_fmt(&self) -> &str {
        &self.0
    }
}

impl Display for TypeIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Graph of types reachable from a root type, indexed by die offsets.
/// Offsets (not owning references) break possible cycles in type definitions.
#[derive(Debug, Clone)]
pub struct ComplexType {
    root: TypeId,
    pub types: HashMap<TypeId, TypeDeclaration>,
}

impl ComplexType {
    #[inline(always)]
    pub fn root(&self) -> TypeId {
        self.root
    }

    /// Return a type name by its id.
    pub fn identity(&self, id: TypeId) -> TypeIdentity {
        let Some(r#type) = self.types.get(&id) else {
            return TypeIdentity::unknown();
        };
        match r#type.name() {
            Some(name) => TypeIdentity::no_namespace(name),
            None => match r#type {
                TypeDeclaration::Pointer { target_type, .. } => {
                    let target = target_type
                        .map(|t| self.identity(t).0)
                        .unwrap_or_else(|| "?".to_string());
                    TypeIdentity(format!("*{target}"))
                }
                _ => TypeIdentity::unknown(),
            },
        }
    }

    /// Strip typedefs and type modifiers, return the underlying type id.
    pub fn resolve(&self, id: TypeId) -> TypeId {
        let mut current = id;
        // bounded by graph size, any cycle goes through a pointer and stops here
        for _ in 0..self.types.len() + 1 {
            match self.types.get(&current) {
                Some(TypeDeclaration::Typedef {
                    target_type: Some(target),
                    ..
                }) => current = *target,
                _ => return current,
            }
        }
        current
    }

    /// Return the Go runtime kind of a type.
    pub fn go_kind(&self, id: TypeId) -> GoKind {
        let Some(r#type) = self.types.get(&id) else {
            return GoKind::Invalid;
        };

        let attr_kind = match r#type {
            TypeDeclaration::Structure { go_kind, .. }
            | TypeDeclaration::Pointer { go_kind, .. }
            | TypeDeclaration::Typedef { go_kind, .. } => *go_kind,
            _ => None,
        };
        if let Some(kind) = attr_kind {
            let kind = GoKind::from_attr(kind);
            if kind != GoKind::Invalid {
                return kind;
            }
        }

        match r#type {
            TypeDeclaration::Scalar(scalar) => match scalar.encoding {
                Some(gimli::DW_ATE_boolean) => GoKind::Bool,
                Some(gimli::DW_ATE_float) => match scalar.byte_size {
                    Some(4) => GoKind::Float32,
                    _ => GoKind::Float64,
                },
                Some(gimli::DW_ATE_signed) | Some(gimli::DW_ATE_signed_char) => {
                    match scalar.byte_size {
                        Some(1) => GoKind::Int8,
                        Some(2) => GoKind::Int16,
                        Some(4) => GoKind::Int32,
                        _ => GoKind::Int64,
                    }
                }
                Some(gimli::DW_ATE_unsigned) | Some(gimli::DW_ATE_unsigned_char) => {
                    match scalar.byte_size {
                        Some(1) => GoKind::Uint8,
                        Some(2) => GoKind::Uint16,
                        Some(4) => GoKind::Uint32,
                        _ => GoKind::Uint64,
                    }
                }
                Some(gimli::DW_ATE_complex_float) => GoKind::Complex128,
                _ => GoKind::Invalid,
            },
            TypeDeclaration::Structure { name, .. } => name
                .as_deref()
                .map(GoKind::from_name)
                .filter(|k| *k != GoKind::Invalid)
                .unwrap_or(GoKind::Struct),
            TypeDeclaration::Array { .. } => GoKind::Array,
            TypeDeclaration::Pointer { .. } => GoKind::Ptr,
            TypeDeclaration::Typedef { name, target_type, .. } => {
                if let Some(kind) = name
                    .as_deref()
                    .map(GoKind::from_name)
                    .filter(|k| *k != GoKind::Invalid)
                {
                    return kind;
                }
                target_type.map(|t| self.go_kind(t)).unwrap_or(GoKind::Invalid)
            }
            TypeDeclaration::Function { .. } => GoKind::Func,
            TypeDeclaration::Unknown { .. } => GoKind::Invalid,
        }
    }

    /// Return structure members of a type (typedefs resolved).
    pub fn members(&self, id: TypeId) -> &[StructureMember] {
        match self.types.get(&self.resolve(id)) {
            Some(TypeDeclaration::Structure { members, .. }) => members,
            _ => &[],
        }
    }

    /// Find a structure member by name.
    pub fn member(&self, id: TypeId, name: &str) -> Option<&StructureMember> {
        self.members(id)
            .iter()
            .find(|m| m.name.as_deref() == Some(name))
    }

    /// Return the pointer target type of a pointer type.
    pub fn pointer_target(&self, id: TypeId) -> Option<TypeId> {
        match self.types.get(&self.resolve(id)) {
            Some(TypeDeclaration::Pointer { target_type, .. }) => *target_type,
            _ => None,
        }
    }

    /// Return the element type and length of an array type.
    pub fn array_info(&self, id: TypeId) -> Option<(Option<TypeId>, Option<i64>)> {
        match self.types.get(&self.resolve(id)) {
            Some(TypeDeclaration::Array {
                element_type, len, ..
            }) => Some((*element_type, *len)),
            _ => None,
        }
    }

    /// Calculate in-memory size of a type in bytes.
    pub fn type_size_in_bytes(&self, _ectx: &EvaluationContext, id: TypeId) -> Option<u64> {
        self.size_no_eval(id)
    }

    /// Type size calculation. Go types always carry constant sizes, so no
    /// expression evaluation is required.
    pub fn size_no_eval(&self, id: TypeId) -> Option<u64> {
        self.size_recursive(id, 0)
    }

    fn size_recursive(&self, id: TypeId, depth: usize) -> Option<u64> {
        if depth > self.types.len() {
            return None;
        }
        match self.types.get(&id)? {
            TypeDeclaration::Scalar(s) => s.byte_size,
            TypeDeclaration::Structure { byte_size, .. } => *byte_size,
            TypeDeclaration::Array {
                byte_size,
                element_type,
                len,
                ..
            } => byte_size.or_else(|| {
                let element_size = self.size_recursive((*element_type)?, depth + 1)?;
                Some(element_size * (*len)? as u64)
            }),
            TypeDeclaration::Pointer { .. } => Some(std::mem::size_of::<usize>() as u64),
            TypeDeclaration::Typedef { target_type, .. } => {
                self.size_recursive((*target_type)?, depth + 1)
            }
            TypeDeclaration::Function { .. } => Some(std::mem::size_of::<usize>() as u64),
            TypeDeclaration::Unknown { .. } => None,
        }
    }
}

/// Parser of die trees into type graphs.
#[derive(Default)]
pub struct TypeParser {
    visited: std::cell::RefCell<HashMap<TypeId, TypeDeclaration>>,
}

impl TypeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a type graph reachable from the root reference.
    pub fn parse<T>(self, ctx_die: ContextualDieRef<'_, T>, root: DieRef) -> ComplexType {
        let debug_info = ctx_die.debug_info;
        let unit = ctx_die.unit();
        self.parse_in(debug_info, unit, root)
    }

    /// Parse a type graph with an explicit default unit for unit-local references.
    pub fn parse_in(
        self,
        debug_info: &DebugInformation,
        unit: &Unit,
        root: DieRef,
    ) -> ComplexType {
        let mut queue = VecDeque::from([root]);
        while let Some(type_ref) = queue.pop_front() {
            if self.visited.borrow().contains_key(&type_ref) {
                continue;
            }

            let Some((declaration, children)) = parse_single(debug_info, unit, type_ref) else {
                self.visited
                    .borrow_mut()
                    .insert(type_ref, TypeDeclaration::Unknown { name: None });
                continue;
            };

            self.visited.borrow_mut().insert(type_ref, declaration);
            queue.extend(children);
        }

        ComplexType {
            root,
            types: self.visited.into_inner(),
        }
    }
}

/// Build a global die reference for an entry of a unit.
fn global_ref(unit: &Unit, offset: UnitOffset) -> DieRef {
    let base = unit.offset().unwrap_or(DebugInfoOffset(0)).0;
    DieRef::Global(DebugInfoOffset(base + offset.0))
}

/// Normalize a die reference into a global one relative to an owning unit.
fn normalize_ref(unit: &Unit, die_ref: DieRef) -> DieRef {
    match die_ref {
        DieRef::Unit(offset) => global_ref(unit, offset),
        global => global,
    }
}

/// Parse a single type die, return its declaration and referenced types to visit.
fn parse_single(
    debug_info: &DebugInformation,
    default_unit: &Unit,
    type_ref: DieRef,
) -> Option<(TypeDeclaration, Vec<DieRef>)> {
    let (entry, unit) = debug_info.deref_die(default_unit, type_ref)?;
    let name = entry_name(entry);

    let mut children_refs = vec![];
    let norm = |r: Option<DieRef>| r.map(|r| normalize_ref(unit, r));

    let declaration = match entry.die {
        DieVariant::BaseType(ref base) => TypeDeclaration::Scalar(ScalarType {
            name,
            byte_size: base.byte_size,
            encoding: base.encoding,
        }),
        DieVariant::StructType(ref st) => {
            let mut members = vec![];
            for &child_idx in &entry.node.children {
                let child = resolve_unit_call!(debug_info.dwarf(), unit, entry, child_idx);
                if let DieVariant::TypeMember(ref member) = child.die {
                    let member_type = norm(member.type_ref);
                    if let Some(r) = member_type {
                        children_refs.push(r);
                    }
                    members.push(StructureMember {
                        name: member.base_attributes.name.clone(),
                        offset: member.member_location,
                        type_ref: member_type,
                    });
                }
            }
            TypeDeclaration::Structure {
                name,
                byte_size: st.byte_size,
                go_kind: st.go_kind,
                members,
            }
        }
        DieVariant::ArrayType(ref arr) => {
            let mut len = None;
            for &child_idx in &entry.node.children {
                let child = resolve_unit_call!(debug_info.dwarf(), unit, entry, child_idx);
                if let DieVariant::ArraySubrange(ref subrange) = child.die {
                    len = subrange
                        .count
                        .as_ref()
                        .and_then(|attr| attr.udata_value())
                        .map(|c| c as i64)
                        .or_else(|| {
                            let upper = subrange
                                .upper_bound
                                .as_ref()
                                .and_then(|attr| attr.udata_value())?;
                            let lower = subrange
                                .lower_bound
                                .as_ref()
                                .and_then(|attr| attr.udata_value())
                                .unwrap_or(0);
                            Some((upper - lower + 1) as i64)
                        });
                }
            }
            let element_type = norm(arr.type_ref);
            if let Some(r) = element_type {
                children_refs.push(r);
            }
            TypeDeclaration::Array {
                name,
                byte_size: arr.byte_size,
                element_type,
                len,
            }
        }
        DieVariant::PointerType(ref ptr) => {
            let target_type = norm(ptr.type_ref);
            if let Some(r) = target_type {
                children_refs.push(r);
            }
            TypeDeclaration::Pointer {
                name,
                go_kind: ptr.go_kind,
                target_type,
            }
        }
        DieVariant::TypeDef(ref td) => {
            let target_type = norm(td.type_ref);
            if let Some(r) = target_type {
                children_refs.push(r);
            }
            TypeDeclaration::Typedef {
                name,
                go_kind: td.go_kind,
                target_type,
            }
        }
        DieVariant::ConstType(ref m) | DieVariant::Volatile(ref m) | DieVariant::Restrict(ref m) => {
            let target_type = norm(m.type_ref);
            if let Some(r) = target_type {
                children_refs.push(r);
            }
            TypeDeclaration::Typedef {
                name,
                go_kind: None,
                target_type,
            }
        }
        DieVariant::Subroutine(_) => TypeDeclaration::Function { name },
        DieVariant::UnionType(ref u) => TypeDeclaration::Structure {
            name,
            byte_size: u.byte_size,
            go_kind: None,
            members: vec![],
        },
        DieVariant::EnumType(ref e) => TypeDeclaration::Scalar(ScalarType {
            name,
            byte_size: e.byte_size,
            encoding: Some(gimli::DW_ATE_signed),
        }),
        _ => TypeDeclaration::Unknown { name },
    };

    Some((declaration, children_refs))
}

fn entry_name(entry: &Entry) -> Option<String> {
    match entry.die {
        DieVariant::BaseType(ref d) => d.base_attributes.name.clone(),
        DieVariant::StructType(ref d) => d.base_attributes.name.clone(),
        DieVariant::ArrayType(ref d) => d.base_attributes.name.clone(),
        DieVariant::PointerType(ref d) => d.base_attributes.name.clone(),
        DieVariant::TypeDef(ref d) => d.base_attributes.name.clone(),
        DieVariant::UnionType(ref d) => d.base_attributes.name.clone(),
        DieVariant::EnumType(ref d) => d.base_attributes.name.clone(),
        DieVariant::Subroutine(ref d) => d.base_attributes.name.clone(),
        DieVariant::ConstType(ref d)
        | DieVariant::Volatile(ref d)
        | DieVariant::Restrict(ref d) => d.base_attributes.name.clone(),
        _ => None,
    }
}

/// Cache of parsed type graphs, key is a (unit id, die offset) pair.
pub type TypeCache = lru::LruCache<(uuid::Uuid, DieRef), std::rc::Rc<ComplexType>>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_go_kind_from_name() {
        struct TestCase {
            name: &'static str,
            kind: GoKind,
        }
        let test_cases = [
            TestCase {
                name: "string",
                kind: GoKind::String,
            },
            TestCase {
                name: "[]uint8",
                kind: GoKind::Slice,
            },
            TestCase {
                name: "map[string]int",
                kind: GoKind::Map,
            },
            TestCase {
                name: "chan int",
                kind: GoKind::Chan,
            },
            TestCase {
                name: "*main.T",
                kind: GoKind::Ptr,
            },
            TestCase {
                name: "[4]int",
                kind: GoKind::Array,
            },
            TestCase {
                name: "error",
                kind: GoKind::Interface,
            },
            TestCase {
                name: "main.T",
                kind: GoKind::Invalid,
            },
        ];

        for tc in test_cases {
            assert_eq!(GoKind::from_name(tc.name), tc.kind, "{}", tc.name);
        }
    }

    #[test]
    fn test_kind_from_attr() {
        assert_eq!(GoKind::from_attr(24), GoKind::String);
        assert_eq!(GoKind::from_attr(23), GoKind::Slice);
        assert_eq!(GoKind::from_attr(25), GoKind::Struct);
        assert_eq!(GoKind::from_attr(200), GoKind::Invalid);
    }
}

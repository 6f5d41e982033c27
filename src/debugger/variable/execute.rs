use crate::debugger::debugee::dwarf::r#type::{
    ComplexType, GoKind, TypeId, TypeIdentity, TypeParser,
};
use crate::debugger::error::Error;
use crate::debugger::variable::dqe::{BinaryOp, Dqe, Literal, Selector};
use crate::debugger::variable::select::{
    resolve_all_locals, resolve_all_params, resolve_identifier, ResolvedVar,
};
use crate::debugger::variable::{
    parse_value, LoadConfig, ParseContext, SupportedScalar, Value, ValueRepr,
};
use crate::debugger::Debugger;
use gimli::Range;
use std::rc::Rc;

/// Result of a data query execution.
#[derive(Debug)]
pub struct QueryResult {
    /// Loaded value.
    pub value: Value,
    /// User visible name of the underlying entity, if any.
    pub name: Option<String>,
    /// Address ranges limiting the lifetime of the underlying object,
    /// `None` for objects with a static lifetime.
    pub scope: Option<Vec<Range>>,
}

/// An intermediate node of expression evaluation: a typed region of the tracee
/// memory or a synthetic (computed) scalar.
struct EvalNode {
    r#type: Option<Rc<ComplexType>>,
    type_id: Option<TypeId>,
    address: Option<usize>,
    synthetic: Option<Value>,
    name: Option<String>,
    scope: Option<Vec<Range>>,
}

impl EvalNode {
    fn synthetic(value: Value) -> Self {
        EvalNode {
            r#type: None,
            type_id: None,
            address: None,
            synthetic: Some(value),
            name: None,
            scope: None,
        }
    }
}

/// Executor of data query expressions against the debugee state.
pub struct DqeExecutor<'a> {
    debugger: &'a Debugger,
    config: LoadConfig,
}

impl<'a> DqeExecutor<'a> {
    pub fn new(debugger: &'a Debugger) -> Self {
        Self {
            debugger,
            config: debugger.load_config(),
        }
    }

    pub fn with_config(debugger: &'a Debugger, config: LoadConfig) -> Self {
        Self { debugger, config }
    }

    fn parse_ctx(&self) -> ParseContext<'_> {
        ParseContext::new(
            &self.debugger.debugee,
            self.debugger.exploration_ctx(),
            self.config,
        )
    }

    /// Execute an expression, resolving identifiers in the whole visible scope.
    pub fn query(&self, dqe: &Dqe) -> Result<Vec<QueryResult>, Error> {
        let nodes = self.eval(dqe, false)?;
        Ok(nodes.into_iter().map(|n| self.materialize(n)).collect())
    }

    /// Execute an expression, resolving identifiers in function arguments only.
    pub fn query_arguments(&self, dqe: &Dqe) -> Result<Vec<QueryResult>, Error> {
        let nodes = self.eval(dqe, true)?;
        Ok(nodes.into_iter().map(|n| self.materialize(n)).collect())
    }

    /// Load all local variables of the frame in focus.
    pub fn query_locals(&self) -> Result<Vec<QueryResult>, Error> {
        let ctx = self.debugger.exploration_ctx();
        let vars = resolve_all_locals(&self.debugger.debugee, ctx)?;
        Ok(vars
            .into_iter()
            .filter_map(|var| self.node_from_resolved(&var).map(|n| self.materialize(n)))
            .collect())
    }

    /// Load all arguments of the function in focus.
    pub fn query_args(&self) -> Result<Vec<QueryResult>, Error> {
        let ctx = self.debugger.exploration_ctx();
        let params = resolve_all_params(&self.debugger.debugee, ctx)?;
        Ok(params
            .into_iter()
            .filter_map(|var| self.node_from_resolved(&var).map(|n| self.materialize(n)))
            .collect())
    }

    fn materialize(&self, node: EvalNode) -> QueryResult {
        let pctx = self.parse_ctx();
        let value = match node.synthetic {
            Some(value) => value,
            None => match (&node.r#type, node.type_id) {
                (Some(t), Some(id)) => parse_value(&pctx, t, id, node.address, None),
                _ => Value::unreadable(TypeIdentity::unknown(), node.address),
            },
        };
        QueryResult {
            value,
            name: node.name,
            scope: node.scope,
        }
    }

    fn node_from_resolved(&self, var: &ResolvedVar<'_>) -> Option<EvalNode> {
        let ctx = self.debugger.exploration_ctx();
        let (r#type, address) = match var {
            ResolvedVar::Variable(v) => (v.r#type()?, v.address(ctx, &self.debugger.debugee)),
            ResolvedVar::Parameter(p) => (p.r#type()?, p.address(ctx, &self.debugger.debugee)),
        };
        let type_id = r#type.root();
        Some(EvalNode {
            r#type: Some(Rc::new(r#type)),
            type_id: Some(type_id),
            address: address.map(|a| a.as_usize()),
            synthetic: None,
            name: var.name().map(ToString::to_string),
            scope: var.scope_ranges(),
        })
    }

    fn eval(&self, dqe: &Dqe, args_only: bool) -> Result<Vec<EvalNode>, Error> {
        match dqe {
            Dqe::Literal(lit) => Ok(vec![EvalNode::synthetic(literal_to_value(lit))]),
            Dqe::Variable(Selector::Name {
                var_name,
                local_only,
            }) => {
                let ctx = self.debugger.exploration_ctx();
                let vars = if args_only {
                    resolve_all_params(&self.debugger.debugee, ctx)?
                        .into_iter()
                        .filter(|p| p.name() == Some(var_name.as_str()))
                        .collect()
                } else {
                    resolve_identifier(&self.debugger.debugee, ctx, var_name, *local_only)?
                };
                Ok(vars
                    .iter()
                    .filter_map(|v| self.node_from_resolved(v))
                    .collect())
            }
            Dqe::Variable(Selector::Any) => {
                let ctx = self.debugger.exploration_ctx();
                let vars = if args_only {
                    resolve_all_params(&self.debugger.debugee, ctx)?
                } else {
                    resolve_all_locals(&self.debugger.debugee, ctx)?
                };
                Ok(vars
                    .iter()
                    .filter_map(|v| self.node_from_resolved(v))
                    .collect())
            }
            Dqe::PtrCast(cast) => {
                let node = self.typed_ptr(&cast.ty, cast.ptr)?;
                Ok(vec![node])
            }
            Dqe::Cast(type_name, expr) => {
                let nodes = self.eval(expr, args_only)?;
                nodes
                    .into_iter()
                    .map(|node| self.cast(type_name, node))
                    .collect()
            }
            Dqe::Field(expr, field) => {
                let nodes = self.eval(expr, args_only)?;
                Ok(nodes
                    .into_iter()
                    .filter_map(|node| self.field(node, field))
                    .collect())
            }
            Dqe::Index(expr, index) => {
                let index_nodes = self.eval(index, args_only)?;
                let index_value = index_nodes
                    .into_iter()
                    .next()
                    .and_then(|n| n.synthetic.clone().or_else(|| Some(self.materialize(n).value)))
                    .ok_or(Error::Unassignable("index expression has no value"))?;

                let nodes = self.eval(expr, args_only)?;
                Ok(nodes
                    .into_iter()
                    .filter_map(|node| self.index(node, &index_value))
                    .collect())
            }
            Dqe::Slice(expr, from, to) => {
                let nodes = self.eval(expr, args_only)?;
                Ok(nodes
                    .into_iter()
                    .filter_map(|node| self.slice(node, *from, *to))
                    .collect())
            }
            Dqe::Deref(expr) => {
                let nodes = self.eval(expr, args_only)?;
                Ok(nodes
                    .into_iter()
                    .filter_map(|node| self.deref(node))
                    .collect())
            }
            Dqe::Address(expr) => {
                let nodes = self.eval(expr, args_only)?;
                Ok(nodes
                    .into_iter()
                    .filter_map(|node| self.address_of(node))
                    .collect())
            }
            Dqe::Binary(op, lhs, rhs) => {
                let lhs_value = self.eval_single_value(lhs, args_only)?;
                let rhs_value = self.eval_single_value(rhs, args_only)?;
                let result = binary_op(*op, &lhs_value, &rhs_value)?;
                Ok(vec![EvalNode::synthetic(result)])
            }
            Dqe::Call(_, _) => Err(Error::Unsupported(
                "function call in expressions requires explicit call injection",
            )),
        }
    }

    fn eval_single_value(&self, dqe: &Dqe, args_only: bool) -> Result<Value, Error> {
        let mut nodes = self.eval(dqe, args_only)?;
        if nodes.is_empty() {
            return Err(Error::WatchSubjectNotFound);
        }
        let node = nodes.swap_remove(0);
        Ok(match node.synthetic {
            Some(v) => v,
            None => self.materialize(node).value,
        })
    }

    /// Build a typed node pointing at a raw address.
    fn typed_ptr(&self, type_name: &str, ptr: usize) -> Result<EvalNode, Error> {
        let debug_info = self.debugger.debugee.program_debug_info()?;
        let type_ref = debug_info
            .find_type_die_ref(type_name)
            .ok_or(Error::TypeNotFound)?;
        let parser = TypeParser::new();
        let r#type = parser.parse_in(debug_info, debug_info.unit_ensure(0), type_ref);
        let root = r#type.root();
        Ok(EvalNode {
            r#type: Some(Rc::new(r#type)),
            type_id: Some(root),
            address: Some(ptr),
            synthetic: None,
            name: None,
            scope: None,
        })
    }

    fn cast(&self, type_name: &str, node: EvalNode) -> Result<EvalNode, Error> {
        // cast of a scalar to a scalar type is a synthetic value conversion,
        // cast of an addressable value reinterprets its memory
        if let Some(address) = node.address {
            return self.typed_ptr(type_name, address);
        }

        let value = node
            .synthetic
            .ok_or(Error::TypeMismatch {
                expect: "addressable or scalar value",
                got: "none".to_string(),
            })?;
        let scalar = value.as_scalar().cloned().ok_or(Error::TypeMismatch {
            expect: "scalar",
            got: value.type_ident.name_fmt().to_string(),
        })?;

        let converted = match type_name {
            "int" | "int8" | "int16" | "int32" | "int64" => SupportedScalar::Int(match scalar {
                SupportedScalar::Int(i) => i,
                SupportedScalar::Uint(u) => u as i64,
                SupportedScalar::Float(f) => f as i64,
                SupportedScalar::Bool(b) => b as i64,
            }),
            "uint" | "uint8" | "uint16" | "uint32" | "uint64" | "uintptr" => {
                SupportedScalar::Uint(match scalar {
                    SupportedScalar::Int(i) => i as u64,
                    SupportedScalar::Uint(u) => u,
                    SupportedScalar::Float(f) => f as u64,
                    SupportedScalar::Bool(b) => b as u64,
                })
            }
            "float32" | "float64" => SupportedScalar::Float(match scalar {
                SupportedScalar::Int(i) => i as f64,
                SupportedScalar::Uint(u) => u as f64,
                SupportedScalar::Float(f) => f,
                SupportedScalar::Bool(_) => {
                    return Err(Error::TypeMismatch {
                        expect: "numeric",
                        got: "bool".to_string(),
                    })
                }
            }),
            _ => {
                // cast a scalar address to a typed pointer
                if let SupportedScalar::Uint(addr) = scalar {
                    return self.typed_ptr(type_name, addr as usize);
                }
                if let SupportedScalar::Int(addr) = scalar {
                    return self.typed_ptr(type_name, addr as usize);
                }
                return Err(Error::TypeNotFound);
            }
        };
        Ok(EvalNode::synthetic(Value::from_scalar(converted)))
    }

    fn field(&self, node: EvalNode, field_name: &str) -> Option<EvalNode> {
        let r#type = node.r#type.clone()?;
        let type_id = node.type_id?;
        let resolved = r#type.resolve(type_id);

        // implicit dereference: a field access through a pointer works in go
        let (container_id, container_addr) = match r#type.go_kind(resolved) {
            GoKind::Ptr => {
                let target = r#type.pointer_target(resolved)?;
                let addr = self.read_ptr(node.address?)?;
                (target, addr)
            }
            _ => (resolved, node.address?),
        };

        let member = r#type.member(container_id, field_name)?.clone();
        let member_type = member.type_ref?;
        Some(EvalNode {
            address: Some(container_addr + member.offset.unwrap_or(0) as usize),
            r#type: Some(r#type),
            type_id: Some(member_type),
            synthetic: None,
            name: Some(field_name.to_string()),
            scope: node.scope,
        })
    }

    fn index(&self, node: EvalNode, index: &Value) -> Option<EvalNode> {
        let r#type = node.r#type.clone()?;
        let type_id = node.type_id?;
        let resolved = r#type.resolve(type_id);
        let address = node.address?;

        match r#type.go_kind(resolved) {
            GoKind::Array => {
                let idx = scalar_index(index)?;
                let (elem, len) = r#type.array_info(resolved)?;
                let elem = elem?;
                if let Some(len) = len {
                    if idx >= len as usize {
                        return None;
                    }
                }
                let elem_size = r#type.size_no_eval(elem)? as usize;
                Some(EvalNode {
                    address: Some(address + idx * elem_size),
                    r#type: Some(r#type),
                    type_id: Some(elem),
                    synthetic: None,
                    name: node.name,
                    scope: node.scope,
                })
            }
            GoKind::Slice => {
                let idx = scalar_index(index)?;
                let data_ptr = self.read_ptr(address)?;
                let cap = self.read_u64(address + 16)?;
                // the debugger checks an index against the capacity, not the length
                if idx as u64 >= cap {
                    return None;
                }
                let elem = r#type
                    .member(resolved, "array")
                    .and_then(|m| m.type_ref)
                    .and_then(|p| r#type.pointer_target(p))?;
                let elem_size = r#type.size_no_eval(elem)? as usize;
                Some(EvalNode {
                    address: Some(data_ptr + idx * elem_size),
                    r#type: Some(r#type),
                    type_id: Some(elem),
                    synthetic: None,
                    name: node.name,
                    scope: node.scope,
                })
            }
            GoKind::String => {
                let idx = scalar_index(index)?;
                let data_ptr = self.read_ptr(address)?;
                let len = self.read_u64(address + 8)?;
                if idx as u64 >= len {
                    return None;
                }
                let byte = self.read_byte(data_ptr + idx)?;
                Some(EvalNode::synthetic(Value::from_scalar(
                    SupportedScalar::Uint(byte as u64),
                )))
            }
            GoKind::Map => {
                // map lookup walks loaded pairs and compares keys
                let pctx = self.parse_ctx();
                let map_value = parse_value(&pctx, &r#type, type_id, Some(address), None);
                let ValueRepr::Map { pairs, .. } = map_value.repr else {
                    return None;
                };
                pairs
                    .into_iter()
                    .find(|(key, _)| value_eq(key, index))
                    .map(|(_, value)| EvalNode::synthetic(value))
            }
            _ => None,
        }
    }

    fn slice(&self, node: EvalNode, from: Option<usize>, to: Option<usize>) -> Option<EvalNode> {
        let pctx = self.parse_ctx();
        let r#type = node.r#type.clone()?;
        let type_id = node.type_id?;
        let mut value = parse_value(&pctx, &r#type, type_id, node.address, None);

        match value.repr {
            ValueRepr::Slice {
                ref mut items,
                ref mut len,
                ref mut cap,
                ..
            } => {
                let from = from.unwrap_or(0);
                let to = to.unwrap_or(items.len());
                *items = items.drain(from.min(items.len())..to.min(items.len())).collect();
                *len = items.len() as u64;
                *cap = *len;
                Some(EvalNode::synthetic(value))
            }
            ValueRepr::Array { ref mut items } => {
                let from = from.unwrap_or(0);
                let to = to.unwrap_or(items.len());
                *items = items.drain(from.min(items.len())..to.min(items.len())).collect();
                Some(EvalNode::synthetic(value))
            }
            _ => None,
        }
    }

    fn deref(&self, node: EvalNode) -> Option<EvalNode> {
        let r#type = node.r#type.clone()?;
        let type_id = node.type_id?;
        let resolved = r#type.resolve(type_id);

        if r#type.go_kind(resolved) != GoKind::Ptr {
            return None;
        }

        let target = r#type.pointer_target(resolved)?;
        let ptr_value = self.read_ptr(node.address?)?;
        if ptr_value == 0 {
            return None;
        }

        // dereference is valid only if the target page is mapped
        Some(EvalNode {
            address: Some(ptr_value),
            r#type: Some(r#type),
            type_id: Some(target),
            synthetic: None,
            name: node.name,
            scope: node.scope,
        })
    }

    fn address_of(&self, node: EvalNode) -> Option<EvalNode> {
        let address = node.address?;
        let target_type = match (&node.r#type, node.type_id) {
            (Some(t), Some(id)) => t.identity(id),
            _ => TypeIdentity::unknown(),
        };
        let target_type_size = match (&node.r#type, node.type_id) {
            (Some(t), Some(id)) => t.size_no_eval(id),
            _ => None,
        };

        let value = Value {
            type_ident: TypeIdentity::no_namespace(format!("*{}", target_type.name_fmt())),
            address: None,
            flags: Default::default(),
            repr: ValueRepr::Pointer {
                value: Some(address),
                target_type,
                target_type_size,
            },
        };
        Some(EvalNode {
            r#type: node.r#type,
            type_id: node.type_id,
            address: None,
            synthetic: Some(value),
            name: node.name,
            scope: node.scope,
        })
    }

    fn read_ptr(&self, addr: usize) -> Option<usize> {
        self.read_u64(addr).map(|v| v as usize)
    }

    fn read_u64(&self, addr: usize) -> Option<u64> {
        let pid = self.debugger.exploration_ctx().pid_on_focus();
        let bytes = crate::muted_error!(crate::debugger::read_memory_by_pid(pid, addr, 8))?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    fn read_byte(&self, addr: usize) -> Option<u8> {
        let pid = self.debugger.exploration_ctx().pid_on_focus();
        let bytes = crate::muted_error!(crate::debugger::read_memory_by_pid(pid, addr, 1))?;
        bytes.first().copied()
    }

    /// Resolve an assignable location of an lvalue expression: its address and size.
    pub fn resolve_assign_target(&self, dqe: &Dqe) -> Result<(usize, usize, GoKind), Error> {
        let mut nodes = self.eval(dqe, false)?;
        if nodes.is_empty() {
            return Err(Error::WatchSubjectNotFound);
        }
        let node = nodes.swap_remove(0);

        let (Some(r#type), Some(type_id), Some(address)) =
            (node.r#type.as_ref(), node.type_id, node.address)
        else {
            return Err(Error::Unassignable("expression result is not addressable"));
        };

        let resolved = r#type.resolve(type_id);
        let kind = r#type.go_kind(resolved);
        let size = match kind {
            GoKind::Bool
            | GoKind::Int
            | GoKind::Int8
            | GoKind::Int16
            | GoKind::Int32
            | GoKind::Int64
            | GoKind::Uint
            | GoKind::Uint8
            | GoKind::Uint16
            | GoKind::Uint32
            | GoKind::Uint64
            | GoKind::Uintptr
            | GoKind::Float32
            | GoKind::Float64
            | GoKind::Ptr
            | GoKind::UnsafePointer => r#type
                .size_no_eval(resolved)
                .ok_or(Error::Unassignable("unknown value size"))?,
            GoKind::String => 16,
            GoKind::Slice => 24,
            _ => return Err(Error::Unassignable("complex aggregates are not assignable")),
        };

        Ok((address, size as usize, kind))
    }
}

fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(i) => Value::from_scalar(SupportedScalar::Int(*i)),
        Literal::Bool(b) => Value::from_scalar(SupportedScalar::Bool(*b)),
        Literal::Float(f) => Value::from_scalar(SupportedScalar::Float(*f)),
        Literal::Address(a) => Value::from_scalar(SupportedScalar::Uint(*a as u64)),
        Literal::String(s) => Value {
            type_ident: TypeIdentity::no_namespace("string"),
            address: None,
            flags: Default::default(),
            repr: ValueRepr::String {
                value: s.clone(),
                len: s.len() as u64,
            },
        },
    }
}

fn scalar_index(value: &Value) -> Option<usize> {
    match value.as_scalar()? {
        SupportedScalar::Int(i) if *i >= 0 => Some(*i as usize),
        SupportedScalar::Uint(u) => Some(*u as usize),
        _ => None,
    }
}

/// Value equality for map key lookup.
fn value_eq(lhs: &Value, rhs: &Value) -> bool {
    match (&lhs.repr, &rhs.repr) {
        (ValueRepr::String { value: l, .. }, ValueRepr::String { value: r, .. }) => l == r,
        (ValueRepr::Scalar(Some(l)), ValueRepr::Scalar(Some(r))) => match (l, r) {
            (SupportedScalar::Int(l), SupportedScalar::Uint(r)) => *l >= 0 && *l as u64 == *r,
            (SupportedScalar::Uint(l), SupportedScalar::Int(r)) => *r >= 0 && *l == *r as u64,
            _ => l == r,
        },
        _ => false,
    }
}

/// Apply a binary operation over two scalar values.
fn binary_op(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Error> {
    // string comparison is the only non numeric binary operation
    if let (ValueRepr::String { value: l, .. }, ValueRepr::String { value: r, .. }) =
        (&lhs.repr, &rhs.repr)
    {
        return match op {
            BinaryOp::Eq => Ok(Value::from_scalar(SupportedScalar::Bool(l == r))),
            BinaryOp::NotEq => Ok(Value::from_scalar(SupportedScalar::Bool(l != r))),
            _ => Err(Error::TypeMismatch {
                expect: "numeric operands",
                got: "string".to_string(),
            }),
        };
    }

    let type_mismatch = |v: &Value| Error::TypeMismatch {
        expect: "scalar",
        got: v.type_ident.name_fmt().to_string(),
    };

    let l = lhs.as_scalar().ok_or_else(|| type_mismatch(lhs))?;
    let r = rhs.as_scalar().ok_or_else(|| type_mismatch(rhs))?;

    if let (SupportedScalar::Bool(l), SupportedScalar::Bool(r)) = (l, r) {
        let result = match op {
            BinaryOp::Eq => *l == *r,
            BinaryOp::NotEq => *l != *r,
            BinaryOp::And => *l && *r,
            BinaryOp::Or => *l || *r,
            _ => {
                return Err(Error::TypeMismatch {
                    expect: "numeric operands",
                    got: "bool".to_string(),
                })
            }
        };
        return Ok(Value::from_scalar(SupportedScalar::Bool(result)));
    }

    // numeric operands promoted to f64 for mixed arithmetic, to i64 otherwise
    let as_f64 = |s: &SupportedScalar| -> Option<f64> {
        match s {
            SupportedScalar::Int(i) => Some(*i as f64),
            SupportedScalar::Uint(u) => Some(*u as f64),
            SupportedScalar::Float(f) => Some(*f),
            SupportedScalar::Bool(_) => None,
        }
    };
    let any_float = matches!(l, SupportedScalar::Float(_)) || matches!(r, SupportedScalar::Float(_));

    if any_float {
        let (l, r) = (
            as_f64(l).ok_or_else(|| type_mismatch(lhs))?,
            as_f64(r).ok_or_else(|| type_mismatch(rhs))?,
        );
        let value = match op {
            BinaryOp::Add => SupportedScalar::Float(l + r),
            BinaryOp::Sub => SupportedScalar::Float(l - r),
            BinaryOp::Mul => SupportedScalar::Float(l * r),
            BinaryOp::Div => SupportedScalar::Float(l / r),
            BinaryOp::Rem => SupportedScalar::Float(l % r),
            BinaryOp::Eq => SupportedScalar::Bool(l == r),
            BinaryOp::NotEq => SupportedScalar::Bool(l != r),
            BinaryOp::Less => SupportedScalar::Bool(l < r),
            BinaryOp::LessEq => SupportedScalar::Bool(l <= r),
            BinaryOp::Greater => SupportedScalar::Bool(l > r),
            BinaryOp::GreaterEq => SupportedScalar::Bool(l >= r),
            BinaryOp::And | BinaryOp::Or => {
                return Err(Error::TypeMismatch {
                    expect: "boolean operands",
                    got: "float".to_string(),
                })
            }
        };
        return Ok(Value::from_scalar(value));
    }

    let as_i64 = |s: &SupportedScalar| -> Option<i64> {
        match s {
            SupportedScalar::Int(i) => Some(*i),
            SupportedScalar::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    };
    let (l, r) = (
        as_i64(l).ok_or_else(|| type_mismatch(lhs))?,
        as_i64(r).ok_or_else(|| type_mismatch(rhs))?,
    );
    let value = match op {
        BinaryOp::Add => SupportedScalar::Int(l.wrapping_add(r)),
        BinaryOp::Sub => SupportedScalar::Int(l.wrapping_sub(r)),
        BinaryOp::Mul => SupportedScalar::Int(l.wrapping_mul(r)),
        BinaryOp::Div => {
            if r == 0 {
                return Err(Error::TypeMismatch {
                    expect: "non zero divisor",
                    got: "0".to_string(),
                });
            }
            SupportedScalar::Int(l / r)
        }
        BinaryOp::Rem => {
            if r == 0 {
                return Err(Error::TypeMismatch {
                    expect: "non zero divisor",
                    got: "0".to_string(),
                });
            }
            SupportedScalar::Int(l % r)
        }
        BinaryOp::Eq => SupportedScalar::Bool(l == r),
        BinaryOp::NotEq => SupportedScalar::Bool(l != r),
        BinaryOp::Less => SupportedScalar::Bool(l < r),
        BinaryOp::LessEq => SupportedScalar::Bool(l <= r),
        BinaryOp::Greater => SupportedScalar::Bool(l > r),
        BinaryOp::GreaterEq => SupportedScalar::Bool(l >= r),
        BinaryOp::And | BinaryOp::Or => {
            return Err(Error::TypeMismatch {
                expect: "boolean operands",
                got: "int".to_string(),
            })
        }
    };
    Ok(Value::from_scalar(value))
}

/// Encode a scalar value into bytes suitable for an assignment of `size` bytes.
pub fn encode_scalar_for_write(value: &Value, size: usize) -> Result<Vec<u8>, Error> {
    let scalar = value.as_scalar().ok_or(Error::Unassignable(
        "only scalar values can be written",
    ))?;
    let raw: u64 = match scalar {
        SupportedScalar::Bool(b) => *b as u64,
        SupportedScalar::Int(i) => *i as u64,
        SupportedScalar::Uint(u) => *u,
        SupportedScalar::Float(f) => match size {
            4 => (*f as f32).to_bits() as u64,
            _ => f.to_bits(),
        },
    };
    let bytes = raw.to_ne_bytes();
    if size > bytes.len() {
        return Err(Error::Unassignable("value is too wide"));
    }
    Ok(bytes[..size].to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_binary_op_numeric() {
        let l = Value::from_scalar(SupportedScalar::Int(7));
        let r = Value::from_scalar(SupportedScalar::Int(7));
        let res = binary_op(BinaryOp::Eq, &l, &r).unwrap();
        assert_eq!(res.as_bool(), Some(true));

        let res = binary_op(BinaryOp::Add, &l, &r).unwrap();
        assert_eq!(res.as_scalar(), Some(&SupportedScalar::Int(14)));

        let r = Value::from_scalar(SupportedScalar::Float(2.0));
        let res = binary_op(BinaryOp::Mul, &l, &r).unwrap();
        assert_eq!(res.as_scalar(), Some(&SupportedScalar::Float(14.0)));
    }

    #[test]
    fn test_binary_op_division_by_zero() {
        let l = Value::from_scalar(SupportedScalar::Int(1));
        let r = Value::from_scalar(SupportedScalar::Int(0));
        assert!(binary_op(BinaryOp::Div, &l, &r).is_err());
    }

    #[test]
    fn test_encode_scalar() {
        let val = Value::from_scalar(SupportedScalar::Int(-1));
        let bytes = encode_scalar_for_write(&val, 4).unwrap();
        assert_eq!(bytes, vec![0xff, 0xff, 0xff, 0xff]);

        let val = Value::from_scalar(SupportedScalar::Bool(true));
        let bytes = encode_scalar_for_write(&val, 1).unwrap();
        assert_eq!(bytes, vec![1]);
    }

    #[test]
    fn test_value_eq_mixed_sign() {
        let l = Value::from_scalar(SupportedScalar::Int(5));
        let r = Value::from_scalar(SupportedScalar::Uint(5));
        assert!(value_eq(&l, &r));

        let r = Value::from_scalar(SupportedScalar::Uint(6));
        assert!(!value_eq(&l, &r));
    }
}

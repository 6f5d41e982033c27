use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::unit::{DieVariant, Unit};
use crate::debugger::debugee::dwarf::EndianArcSlice;
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{EvalOptionRequired, EvalUnsupportedRequire};
use crate::debugger::register::{get_register_value_dwarf, DwarfRegisterMap, RegisterMap};
use crate::debugger::ExplorationContext;
use bytes::{BufMut, Bytes, BytesMut};
use gimli::{EvaluationResult, Expression, Location, Piece, Value, ValueType};
use nix::unistd::Pid;
use std::cmp::min;
use std::mem;

/// Shows how to interpret an evaluation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// Result is a memory location, the value lives behind it.
    MemoryAddress,
    /// Result is the value itself.
    Value,
}

/// Evaluator for DWARF location expressions.
/// Expression evaluation requires the tracee state (registers and memory of a
/// stopped thread), therefore the evaluator is bound to a [`Debugee`].
pub struct ExpressionEvaluator<'a> {
    unit: &'a Unit,
    debugee: &'a Debugee,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(unit: &'a Unit, debugee: &'a Debugee) -> Self {
        Self { unit, debugee }
    }

    fn registers(&self, ctx: &ExplorationContext) -> Result<DwarfRegisterMap, Error> {
        let mut registers = DwarfRegisterMap::from(
            RegisterMap::current(ctx.pid_on_focus()).map_err(Error::Ptrace)?,
        );
        if ctx.frame_num() > 0 {
            self.debugee.restore_registers_at_frame(
                ctx.pid_on_focus(),
                &mut registers,
                ctx.frame_num(),
            )?;
        }
        Ok(registers)
    }

    pub fn evaluate(
        &self,
        ctx: &ExplorationContext,
        expr: Expression<EndianArcSlice>,
    ) -> Result<CompletedResult, Error> {
        let encoding = self.unit.encoding();
        let mut eval = expr.evaluation(encoding);

        let mut result = eval.evaluate()?;
        while result != EvaluationResult::Complete {
            match result {
                EvaluationResult::RequiresRegister {
                    register,
                    base_type: _base_type,
                } => {
                    let registers = self.registers(ctx)?;
                    let val = Value::Generic(registers.value(register)?);
                    result = eval.resume_with_register(val)?;
                }
                EvaluationResult::RequiresFrameBase => {
                    let func = self
                        .debugee
                        .debug_info(ctx.location().pc)?
                        .find_function_by_pc(ctx.location().global_pc)?
                        .ok_or(Error::FunctionNotFound(ctx.location().global_pc))?;
                    let fba = func.frame_base_addr(ctx, self.debugee)?;
                    result = eval.resume_with_frame_base(fba.as_u64())?;
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    let cfa = self
                        .debugee
                        .debug_info(ctx.location().pc)?
                        .get_cfa(self.debugee, ctx)?;
                    result = eval.resume_with_call_frame_cfa(cfa.as_u64())?;
                }
                EvaluationResult::RequiresRelocatedAddress(addr) => {
                    let offset = self.debugee.mapping_offset_for_pc(ctx.location().pc)?;
                    result = eval.resume_with_relocated_address(addr + offset as u64)?;
                }
                EvaluationResult::RequiresIndexedAddress { index, relocate } => {
                    let debug_info = self.debugee.debug_info(ctx.location().pc)?;
                    let mut addr = debug_info
                        .debug_addr()
                        .get_address(self.unit.address_size(), self.unit.addr_base(), index)?;
                    if relocate {
                        addr += self.debugee.mapping_offset_for_pc(ctx.location().pc)? as u64;
                    }
                    result = eval.resume_with_indexed_address(addr)?;
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let bytes = crate::debugger::read_memory_by_pid(
                        ctx.pid_on_focus(),
                        address as usize,
                        size as usize,
                    )?;
                    let mut raw = [0_u8; 8];
                    raw[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
                    result = eval.resume_with_memory(Value::Generic(u64::from_ne_bytes(raw)))?;
                }
                EvaluationResult::RequiresBaseType(offset) => {
                    let dwarf = self.debugee.debug_info(ctx.location().pc)?.dwarf();
                    let mb_entry = crate::resolve_unit_call!(dwarf, self.unit, find_entry, offset);

                    let base_type = mb_entry
                        .and_then(|entry| {
                            if let DieVariant::BaseType(die) = &entry.die {
                                return ValueType::from_encoding(die.encoding?, die.byte_size?);
                            }
                            None
                        })
                        .unwrap_or(ValueType::Generic);

                    result = eval.resume_with_base_type(base_type)?;
                }
                EvaluationResult::RequiresTls(_) => {
                    return Err(EvalUnsupportedRequire("tls"));
                }
                EvaluationResult::RequiresAtLocation(_) => {
                    return Err(EvalOptionRequired("at_location"));
                }
                EvaluationResult::RequiresEntryValue(_) => {
                    return Err(EvalUnsupportedRequire("entry_value"));
                }
                EvaluationResult::RequiresParameterRef(_) => {
                    return Err(EvalUnsupportedRequire("parameter_ref"));
                }
                _ => {
                    return Err(EvalUnsupportedRequire("unknown"));
                }
            };
        }

        Ok(CompletedResult {
            inner: eval.result(),
            pid: ctx.pid_on_focus(),
        })
    }
}

pub struct CompletedResult {
    inner: Vec<Piece<EndianArcSlice>>,
    pid: Pid,
}

impl CompletedResult {
    /// Interpret the evaluation result as a scalar of type `T`.
    pub fn into_scalar<T: Copy>(self, kind: AddressKind) -> Result<T, Error> {
        if kind == AddressKind::MemoryAddress {
            if let Some(Piece {
                location: Location::Address { address },
                ..
            }) = self.inner.first()
            {
                let bytes = Bytes::copy_from_slice(&address.to_ne_bytes());
                return Ok(scalar_from_bytes(bytes));
            }
        }
        let bytes = self.into_raw_buffer(mem::size_of::<T>(), AddressKind::Value)?;
        Ok(scalar_from_bytes(bytes))
    }

    /// Return the memory address of the evaluated object, if it is addressable.
    pub fn address(&self) -> Option<RelocatedAddress> {
        self.inner.first().and_then(|piece| match piece.location {
            Location::Address { address } => Some(RelocatedAddress::from(address)),
            _ => None,
        })
    }

    /// Materialize the value bytes of the evaluation result.
    ///
    /// # Arguments
    ///
    /// * `byte_size`: how many bytes the type of the value occupies
    /// * `kind`: [`AddressKind::MemoryAddress`] reads the value from behind address
    ///   pieces, [`AddressKind::Value`] also does (address pieces always point at data)
    pub fn into_raw_buffer(self, byte_size: usize, _kind: AddressKind) -> Result<Bytes, Error> {
        let mut buff = BytesMut::with_capacity(byte_size);
        let pid = self.pid;
        self.inner
            .into_iter()
            .try_for_each(|piece| -> Result<(), Error> {
                let read_size = piece
                    .size_in_bits
                    .map(|bits| bits as usize / 8)
                    .unwrap_or(byte_size);
                let offset = piece.bit_offset.unwrap_or(0);

                match piece.location {
                    Location::Register { register } => {
                        buff.put(read_register(pid, register, read_size, offset)?);
                    }
                    Location::Address { address } => {
                        let bytes =
                            crate::debugger::read_memory_by_pid(pid, address as usize, read_size)?;
                        buff.put_slice(&bytes);
                    }
                    Location::Value { value } => {
                        match value {
                            Value::Generic(v) | Value::U64(v) => buff.put_u64(v),
                            Value::I8(v) => buff.put_i8(v),
                            Value::U8(v) => buff.put_u8(v),
                            Value::I16(v) => buff.put_i16(v),
                            Value::U16(v) => buff.put_u16(v),
                            Value::I32(v) => buff.put_i32(v),
                            Value::U32(v) => buff.put_u32(v),
                            Value::I64(v) => buff.put_i64(v),
                            Value::F32(v) => buff.put_f32(v),
                            Value::F64(v) => buff.put_f64(v),
                        };
                    }
                    Location::Bytes { value, .. } => {
                        buff.put_slice(value.bytes());
                    }
                    Location::ImplicitPointer { .. } => {
                        return Err(Error::ImplicitPointer);
                    }
                    Location::Empty => {}
                };
                Ok(())
            })?;
        Ok(buff.freeze())
    }
}

fn read_register(
    pid: Pid,
    reg: gimli::Register,
    size_in_bytes: usize,
    offset: u64,
) -> Result<Bytes, Error> {
    let register_value = get_register_value_dwarf(pid, reg.0)?;
    let bytes = (register_value >> offset).to_ne_bytes();
    let write_size = min(size_in_bytes, mem::size_of::<u64>());
    Ok(Bytes::copy_from_slice(&bytes[..write_size]))
}

fn scalar_from_bytes<T: Copy>(bytes: Bytes) -> T {
    let mut aligned = vec![0_u8; mem::size_of::<T>()];
    let len = min(bytes.len(), aligned.len());
    aligned[..len].copy_from_slice(&bytes[..len]);
    // value is copied into an aligned buffer before the cast
    unsafe { std::ptr::read_unaligned(aligned.as_ptr().cast()) }
}

pub mod debug;

use crate::debugger::error::Error;
use nix::libc::user_regs_struct;
use nix::sys;
use nix::unistd::Pid;
use smallvec::{smallvec, SmallVec};
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

impl Register {
    /// Return the DWARF register number of this register if any.
    /// See System V Application Binary Interface AMD64 Architecture Processor Supplement, figure 3.36.
    pub fn dwarf_register(self) -> Option<gimli::Register> {
        let num = match self {
            Register::Rax => 0,
            Register::Rdx => 1,
            Register::Rcx => 2,
            Register::Rbx => 3,
            Register::Rsi => 4,
            Register::Rdi => 5,
            Register::Rbp => 6,
            Register::Rsp => 7,
            Register::R8 => 8,
            Register::R9 => 9,
            Register::R10 => 10,
            Register::R11 => 11,
            Register::R12 => 12,
            Register::R13 => 13,
            Register::R14 => 14,
            Register::R15 => 15,
            Register::Eflags => 49,
            Register::Es => 50,
            Register::Cs => 51,
            Register::Ss => 52,
            Register::Ds => 53,
            Register::Fs => 54,
            Register::Gs => 55,
            Register::FsBase => 58,
            Register::GsBase => 59,
            _ => return None,
        };
        Some(gimli::Register(num))
    }
}

impl TryFrom<gimli::Register> for Register {
    type Error = Error;

    fn try_from(value: gimli::Register) -> Result<Self, Self::Error> {
        let reg = match value.0 {
            0 => Register::Rax,
            1 => Register::Rdx,
            2 => Register::Rcx,
            3 => Register::Rbx,
            4 => Register::Rsi,
            5 => Register::Rdi,
            6 => Register::Rbp,
            7 => Register::Rsp,
            8 => Register::R8,
            9 => Register::R9,
            10 => Register::R10,
            11 => Register::R11,
            12 => Register::R12,
            13 => Register::R13,
            14 => Register::R14,
            15 => Register::R15,
            16 => Register::Rip,
            49 => Register::Eflags,
            50 => Register::Es,
            51 => Register::Cs,
            52 => Register::Ss,
            53 => Register::Ds,
            54 => Register::Fs,
            55 => Register::Gs,
            58 => Register::FsBase,
            59 => Register::GsBase,
            _ => return Err(Error::RegisterNotFound(value)),
        };
        Ok(reg)
    }
}

/// Snapshot of a thread general purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap(user_regs_struct);

impl From<user_regs_struct> for RegisterMap {
    fn from(value: user_regs_struct) -> Self {
        Self(value)
    }
}

impl From<RegisterMap> for user_regs_struct {
    fn from(map: RegisterMap) -> user_regs_struct {
        map.0
    }
}

impl RegisterMap {
    /// Load registers of a stopped thread.
    pub fn current(pid: Pid) -> nix::Result<Self> {
        let regs = sys::ptrace::getregs(pid)?;
        Ok(regs.into())
    }

    pub fn value(&self, register: impl Into<Register>) -> u64 {
        match register.into() {
            Register::Rax => self.0.rax,
            Register::Rbx => self.0.rbx,
            Register::Rcx => self.0.rcx,
            Register::Rdx => self.0.rdx,
            Register::Rdi => self.0.rdi,
            Register::Rsi => self.0.rsi,
            Register::Rbp => self.0.rbp,
            Register::Rsp => self.0.rsp,
            Register::R8 => self.0.r8,
            Register::R9 => self.0.r9,
            Register::R10 => self.0.r10,
            Register::R11 => self.0.r11,
            Register::R12 => self.0.r12,
            Register::R13 => self.0.r13,
            Register::R14 => self.0.r14,
            Register::R15 => self.0.r15,
            Register::Rip => self.0.rip,
            Register::Eflags => self.0.eflags,
            Register::Cs => self.0.cs,
            Register::OrigRax => self.0.orig_rax,
            Register::FsBase => self.0.fs_base,
            Register::GsBase => self.0.gs_base,
            Register::Fs => self.0.fs,
            Register::Gs => self.0.gs,
            Register::Ss => self.0.ss,
            Register::Ds => self.0.ds,
            Register::Es => self.0.es,
        }
    }

    pub fn update(&mut self, register: impl Into<Register>, value: u64) {
        match register.into() {
            Register::Rax => self.0.rax = value,
            Register::Rbx => self.0.rbx = value,
            Register::Rcx => self.0.rcx = value,
            Register::Rdx => self.0.rdx = value,
            Register::Rdi => self.0.rdi = value,
            Register::Rsi => self.0.rsi = value,
            Register::Rbp => self.0.rbp = value,
            Register::Rsp => self.0.rsp = value,
            Register::R8 => self.0.r8 = value,
            Register::R9 => self.0.r9 = value,
            Register::R10 => self.0.r10 = value,
            Register::R11 => self.0.r11 = value,
            Register::R12 => self.0.r12 = value,
            Register::R13 => self.0.r13 = value,
            Register::R14 => self.0.r14 = value,
            Register::R15 => self.0.r15 = value,
            Register::Rip => self.0.rip = value,
            Register::Eflags => self.0.eflags = value,
            Register::Cs => self.0.cs = value,
            Register::OrigRax => self.0.orig_rax = value,
            Register::FsBase => self.0.fs_base = value,
            Register::GsBase => self.0.gs_base = value,
            Register::Fs => self.0.fs = value,
            Register::Gs => self.0.gs = value,
            Register::Ss => self.0.ss = value,
            Register::Ds => self.0.ds = value,
            Register::Es => self.0.es = value,
        };
    }

    /// Write registers back into a stopped thread.
    pub fn persist(self, pid: Pid) -> nix::Result<()> {
        sys::ptrace::setregs(pid, self.into())
    }

    /// Dump all registers with their names, in declaration order.
    pub fn snapshot(&self) -> Vec<(Register, u64)> {
        Register::iter().map(|reg| (reg, self.value(reg))).collect()
    }
}

/// Get a register value by its name.
pub fn get_register_value(pid: Pid, name: &str) -> Result<u64, Error> {
    let register =
        Register::from_str(name).map_err(|_| Error::RegisterNameNotFound(name.to_string()))?;
    Ok(RegisterMap::current(pid).map_err(Error::Ptrace)?.value(register))
}

/// Set a register value by its name.
pub fn set_register_value(pid: Pid, name: &str, value: u64) -> Result<(), Error> {
    let register =
        Register::from_str(name).map_err(|_| Error::RegisterNameNotFound(name.to_string()))?;
    let mut map = RegisterMap::current(pid).map_err(Error::Ptrace)?;
    map.update(register, value);
    map.persist(pid).map_err(Error::Ptrace)
}

/// Get a register value by DWARF register number.
pub fn get_register_value_dwarf(pid: Pid, reg_num: u16) -> Result<u64, Error> {
    let register = Register::try_from(gimli::Register(reg_num))?;
    Ok(RegisterMap::current(pid).map_err(Error::Ptrace)?.value(register))
}

/// Registers addressed by DWARF numbers, used by unwinder and location expressions.
/// Unlike [`RegisterMap`] may contain undefined registers.
#[derive(Debug, Clone)]
pub struct DwarfRegisterMap(SmallVec<[Option<u64>; 0x80]>);

impl DwarfRegisterMap {
    pub fn value(&self, register: gimli::Register) -> Result<u64, Error> {
        self.0
            .get(register.0 as usize)
            .copied()
            .flatten()
            .ok_or(Error::RegisterNotFound(register))
    }

    pub fn update(&mut self, register: gimli::Register, value: u64) {
        if (register.0 as usize) < self.0.len() {
            self.0[register.0 as usize] = Some(value);
        }
    }

    /// Take defined register values from another map.
    pub fn update_from(&mut self, other: &DwarfRegisterMap) {
        other
            .0
            .iter()
            .enumerate()
            .filter_map(|(num, val)| Some((num, (*val)?)))
            .for_each(|(num, val)| self.update(gimli::Register(num as u16), val));
    }
}

/// Mapping machine registers to dwarf registers.
/// See https://docs.rs/gimli/latest/gimli/struct.UnwindTableRow.html#method.register
impl From<RegisterMap> for DwarfRegisterMap {
    fn from(map: RegisterMap) -> Self {
        let mut dwarf_map: SmallVec<[Option<u64>; 0x80]> = smallvec![None; 0x80];
        for reg in Register::iter() {
            if let Some(dwarf_reg) = reg.dwarf_register() {
                dwarf_map[dwarf_reg.0 as usize] = Some(map.value(reg));
            }
        }
        // instruction pointer has no dwarf number, use a free slot behind the defined range
        dwarf_map[DWARF_IP.0 as usize] = Some(map.value(Register::Rip));
        DwarfRegisterMap(dwarf_map)
    }
}

/// Pseudo dwarf register number for the instruction pointer.
pub const DWARF_IP: gimli::Register = gimli::Register(16);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(Register::from_str("rip").unwrap(), Register::Rip);
        assert_eq!(Register::from_str("fs_base").unwrap(), Register::FsBase);
        assert!(Register::from_str("xmm0").is_err());
        assert_eq!(Register::R9.to_string(), "r9");
    }

    #[test]
    fn test_dwarf_register_mapping() {
        assert_eq!(Register::Rax.dwarf_register(), Some(gimli::Register(0)));
        assert_eq!(Register::Rsp.dwarf_register(), Some(gimli::Register(7)));
        assert_eq!(Register::OrigRax.dwarf_register(), None);

        let reg = Register::try_from(gimli::Register(7)).unwrap();
        assert_eq!(reg, Register::Rsp);
        assert!(Register::try_from(gimli::Register(333)).is_err());
    }
}

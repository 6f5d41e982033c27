//! x86-64 hardware debug registers (DR0-DR7) access and configuration.

use crate::debugger::error::Error;
use bit_field::BitField;
use nix::sys;
use nix::unistd::Pid;
use std::ffi::c_void;
use std::mem::offset_of;
use strum_macros::FromRepr;

/// Address debug registers DR0-DR3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum DebugRegisterNumber {
    DR0 = 0,
    DR1 = 1,
    DR2 = 2,
    DR3 = 3,
}

/// Condition of a hardware breakpoint (DR7 R/Wn field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BreakCondition {
    Execution = 0b00,
    DataWrites = 0b01,
    IoReadsWrites = 0b10,
    DataReadsWrites = 0b11,
}

/// Size of watched memory location (DR7 LENn field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BreakSize {
    Bytes1 = 0b00,
    Bytes2 = 0b01,
    Bytes8 = 0b10,
    Bytes4 = 0b11,
}

impl TryFrom<u8> for BreakSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BreakSize::Bytes1),
            2 => Ok(BreakSize::Bytes2),
            4 => Ok(BreakSize::Bytes4),
            8 => Ok(BreakSize::Bytes8),
            _ => Err(Error::WatchpointWrongSize),
        }
    }
}

impl BreakSize {
    pub fn in_bytes(self) -> usize {
        match self {
            BreakSize::Bytes1 => 1,
            BreakSize::Bytes2 => 2,
            BreakSize::Bytes8 => 8,
            BreakSize::Bytes4 => 4,
        }
    }
}

/// Debug control register (DR7) value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dr7(u64);

impl Dr7 {
    /// True if debug register `dr` enabled (local or global).
    pub fn dr_enabled(&self, dr: DebugRegisterNumber, global: bool) -> bool {
        let bit = dr as usize * 2 + usize::from(global);
        self.0.get_bit(bit)
    }

    /// Enable or disable debug register `dr`.
    pub fn set_dr(&mut self, dr: DebugRegisterNumber, global: bool, enable: bool) {
        let bit = dr as usize * 2 + usize::from(global);
        self.0.set_bit(bit, enable);
    }

    /// Set condition and size fields for debug register `dr`.
    pub fn configure_bp(&mut self, dr: DebugRegisterNumber, cond: BreakCondition, size: BreakSize) {
        let base = 16 + dr as usize * 4;
        self.0.set_bits(base..base + 2, cond as u64);
        self.0.set_bits(base + 2..base + 4, size as u64);
    }
}

/// Debug status register (DR6) value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dr6(u64);

impl Dr6 {
    /// Return the debug register whose condition was detected, if any.
    pub fn detected(&self) -> Option<DebugRegisterNumber> {
        (0..4_usize)
            .find(|&dr| self.0.get_bit(dr))
            .and_then(DebugRegisterNumber::from_repr)
    }

    /// True if the condition of register `dr` was detected.
    pub fn dr_detected(&self, dr: DebugRegisterNumber) -> bool {
        self.0.get_bit(dr as usize)
    }
}

/// Snapshot of the hardware debug state of a thread.
/// Address registers and DR7 are shared by all watchpoints, the debugger
/// loads, modifies and synchronizes the whole state at once.
#[derive(Debug, Clone)]
pub struct HardwareDebugState {
    pub address_regs: [usize; 4],
    pub dr6: Dr6,
    pub dr7: Dr7,
}

const DEBUGREG_OFFSET: usize = offset_of!(nix::libc::user, u_debugreg);

fn debugreg_offset(num: usize) -> *mut c_void {
    (DEBUGREG_OFFSET + num * std::mem::size_of::<u64>()) as *mut c_void
}

impl HardwareDebugState {
    /// Load the current state of thread `pid`.
    pub fn current(pid: Pid) -> Result<Self, Error> {
        let mut address_regs = [0_usize; 4];
        for (idx, reg) in address_regs.iter_mut().enumerate() {
            *reg = sys::ptrace::read_user(pid, debugreg_offset(idx)).map_err(Error::Ptrace)?
                as usize;
        }
        let dr6 = sys::ptrace::read_user(pid, debugreg_offset(6)).map_err(Error::Ptrace)? as u64;
        let dr7 = sys::ptrace::read_user(pid, debugreg_offset(7)).map_err(Error::Ptrace)? as u64;

        Ok(Self {
            address_regs,
            dr6: Dr6(dr6),
            dr7: Dr7(dr7),
        })
    }

    /// Write address registers and DR7 into thread `pid`.
    pub fn sync(&self, pid: Pid) -> Result<(), Error> {
        for (idx, addr) in self.address_regs.iter().enumerate() {
            unsafe {
                sys::ptrace::write_user(pid, debugreg_offset(idx), *addr as _)
                    .map_err(Error::Ptrace)?;
            }
        }
        unsafe {
            sys::ptrace::write_user(pid, debugreg_offset(7), self.dr7.0 as _)
                .map_err(Error::Ptrace)?;
        }
        Ok(())
    }

    /// Reset the sticky detection bits of DR6 in thread `pid`.
    pub fn reset_dr6(pid: Pid) -> Result<(), Error> {
        unsafe {
            sys::ptrace::write_user(pid, debugreg_offset(6), 0 as _).map_err(Error::Ptrace)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dr7_configure() {
        let mut dr7 = Dr7::default();
        assert!(!dr7.dr_enabled(DebugRegisterNumber::DR1, false));

        dr7.configure_bp(
            DebugRegisterNumber::DR1,
            BreakCondition::DataWrites,
            BreakSize::Bytes8,
        );
        dr7.set_dr(DebugRegisterNumber::DR1, false, true);

        assert!(dr7.dr_enabled(DebugRegisterNumber::DR1, false));
        assert!(!dr7.dr_enabled(DebugRegisterNumber::DR0, false));
        // R/W1 = 0b01 (bits 20-21), LEN1 = 0b10 (bits 22-23), L1 = bit 2
        assert_eq!(dr7.0, (0b01 << 20) | (0b10 << 22) | (1 << 2));

        dr7.set_dr(DebugRegisterNumber::DR1, false, false);
        assert!(!dr7.dr_enabled(DebugRegisterNumber::DR1, false));
    }

    #[test]
    fn test_dr6_detection() {
        assert_eq!(Dr6(0b0000).detected(), None);
        assert_eq!(Dr6(0b0100).detected(), Some(DebugRegisterNumber::DR2));
        assert!(Dr6(0b1000).dr_detected(DebugRegisterNumber::DR3));
    }

    #[test]
    fn test_break_size() {
        assert_eq!(BreakSize::try_from(8).unwrap(), BreakSize::Bytes8);
        assert!(BreakSize::try_from(3).is_err());
        assert_eq!(BreakSize::Bytes4.in_bytes(), 4);
    }
}

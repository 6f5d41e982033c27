use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::tracee::TraceeCtl;
use crate::debugger::debugee::tracer::WatchpointHitType;
use crate::debugger::error::Error;
use crate::debugger::register::debug::{
    BreakCondition, BreakSize, DebugRegisterNumber, HardwareDebugState,
};
use crate::debugger::debugee::dwarf::unwind::FrameID;
use crate::debugger::variable::dqe::Dqe;
use log::error;
use std::sync::atomic::{AtomicU32, Ordering};

/// Hardware breakpoint over one of the DR0-DR3 registers.
#[derive(Debug)]
struct HardwareBreakpoint {
    /// Address in debugee memory where hardware breakpoint is set.
    address: RelocatedAddress,
    /// Size of watch location at the address.
    size: BreakSize,
    /// Hardware register, `Some` if breakpoint currently installed.
    register: Option<DebugRegisterNumber>,
    /// Associated condition.
    condition: BreakCondition,
}

impl HardwareBreakpoint {
    fn new(address: RelocatedAddress, size: BreakSize, condition: BreakCondition) -> Self {
        Self {
            address,
            size,
            register: None,
            condition,
        }
    }

    fn enable(&mut self, tracee_ctl: &TraceeCtl) -> Result<(), Error> {
        let mut state = HardwareDebugState::current(tracee_ctl.proc_pid())?;

        // trying to find free debug register
        let free_register = [
            DebugRegisterNumber::DR0,
            DebugRegisterNumber::DR1,
            DebugRegisterNumber::DR2,
            DebugRegisterNumber::DR3,
        ]
        .into_iter()
        .find(|&dr_num| !state.dr7.dr_enabled(dr_num, false))
        .ok_or(Error::OutOfWatchpointSlots)?;

        state.address_regs[free_register as usize] = self.address.as_usize();
        state.dr7.configure_bp(free_register, self.condition, self.size);
        state.dr7.set_dr(free_register, false, true);
        tracee_ctl.tracee_iter().for_each(|t| {
            if let Err(e) = state.sync(t.pid) {
                error!("set hardware breakpoint for thread {}: {e}", t.pid)
            }
        });
        self.register = Some(free_register);

        Ok(())
    }

    fn disable(&mut self, tracee_ctl: &TraceeCtl) -> Result<(), Error> {
        let mut state = HardwareDebugState::current(tracee_ctl.proc_pid())?;
        let register = self.register.expect("register should exist");
        state.dr7.set_dr(register, false, false);
        tracee_ctl.tracee_iter().for_each(|t| {
            if let Err(e) = state.sync(t.pid) {
                error!("remove hardware breakpoint for thread {}: {e}", t.pid)
            }
        });
        self.register = None;
        Ok(())
    }

    fn address_already_observed(
        tracee_ctl: &TraceeCtl,
        address: RelocatedAddress,
    ) -> Result<bool, Error> {
        let state = HardwareDebugState::current(tracee_ctl.proc_pid())?;
        Ok(state
            .address_regs
            .iter()
            .enumerate()
            .any(|(dr, in_use_addr)| {
                let enabled = state.dr7.dr_enabled(
                    DebugRegisterNumber::from_repr(dr).expect("infallible"),
                    false,
                );
                enabled && *in_use_addr == address.as_usize()
            }))
    }
}

static GLOBAL_WP_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Scope of a watchpoint subject.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchpointScope {
    /// Watched object lives on a stack frame, the watchpoint dies with it.
    Frame {
        frame_id: Option<FrameID>,
        /// Number of a companion breakpoint at the frame return address,
        /// its hit means the end of the watched object lifetime.
        companion: u32,
    },
    /// Watched object is global.
    Global,
}

/// Hardware watchpoint over an expression result or a raw memory location.
#[derive(Debug)]
pub struct Watchpoint {
    /// Watchpoint number, started from 1.
    pub number: u32,
    /// Original expression string, empty for raw address watchpoints.
    pub source_string: String,
    /// Address expression, `None` for raw address watchpoints.
    pub dqe: Option<Dqe>,
    /// Scope of the watched object.
    pub scope: WatchpointScope,
    hw: HardwareBreakpoint,
}

impl Watchpoint {
    /// Install a new watchpoint at a resolved address.
    ///
    /// # Arguments
    ///
    /// * `tracee_ctl`: threads of the debugee, hardware state is synchronized to all
    /// * `source_string`: user representation of the subject
    /// * `dqe`: address expression if the subject is an expression
    /// * `scope`: lifetime of the watched object
    /// * `address`: address of watched memory
    /// * `size`: watched memory size (1, 2, 4 or 8 bytes)
    /// * `condition`: write or read-write watch
    pub fn install(
        tracee_ctl: &TraceeCtl,
        source_string: String,
        dqe: Option<Dqe>,
        scope: WatchpointScope,
        address: RelocatedAddress,
        size: BreakSize,
        condition: BreakCondition,
    ) -> Result<Self, Error> {
        if HardwareBreakpoint::address_already_observed(tracee_ctl, address)? {
            return Err(Error::AddressAlreadyObserved);
        }

        let mut hw = HardwareBreakpoint::new(address, size, condition);
        hw.enable(tracee_ctl)?;

        Ok(Self {
            number: GLOBAL_WP_COUNTER.fetch_add(1, Ordering::Relaxed),
            source_string,
            dqe,
            scope,
            hw,
        })
    }

    pub fn address(&self) -> RelocatedAddress {
        self.hw.address
    }

    pub fn size(&self) -> BreakSize {
        self.hw.size
    }

    pub fn condition(&self) -> BreakCondition {
        self.hw.condition
    }

    fn uninstall(mut self, tracee_ctl: &TraceeCtl) -> Result<(), Error> {
        if self.hw.register.is_some() {
            self.hw.disable(tracee_ctl)?;
        }
        Ok(())
    }

    /// True if a hardware hit belongs to this watchpoint.
    fn matches_hit(&self, ty: &WatchpointHitType) -> bool {
        let WatchpointHitType::DebugRegister(dr) = ty;
        self.hw.register == Some(*dr)
    }
}

/// Registry of hardware watchpoints, limited by the number of debug registers.
#[derive(Default)]
pub struct WatchpointRegistry {
    watchpoints: Vec<Watchpoint>,
}

impl WatchpointRegistry {
    pub fn add(&mut self, wp: Watchpoint) -> u32 {
        let number = wp.number;
        self.watchpoints.push(wp);
        number
    }

    pub fn all(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    pub fn get(&self, number: u32) -> Option<&Watchpoint> {
        self.watchpoints.iter().find(|wp| wp.number == number)
    }

    /// Find a watchpoint matching a hardware hit.
    pub fn find_by_hit(&self, ty: &WatchpointHitType) -> Option<&Watchpoint> {
        self.watchpoints.iter().find(|wp| wp.matches_hit(ty))
    }

    /// Find a frame scoped watchpoint by its companion breakpoint number.
    pub fn find_by_companion(&self, brkpt_number: u32) -> Option<&Watchpoint> {
        self.watchpoints.iter().find(|wp| {
            matches!(wp.scope, WatchpointScope::Frame { companion, .. } if companion == brkpt_number)
        })
    }

    /// Remove a watchpoint and free its debug register.
    pub fn remove(&mut self, tracee_ctl: &TraceeCtl, number: u32) -> Result<bool, Error> {
        let Some(pos) = self.watchpoints.iter().position(|wp| wp.number == number) else {
            return Ok(false);
        };
        let wp = self.watchpoints.remove(pos);
        wp.uninstall(tracee_ctl)?;
        Ok(true)
    }

    /// Remove all watchpoints (used on detach and restart).
    pub fn clear(&mut self, tracee_ctl: &TraceeCtl) -> Result<(), Error> {
        for wp in self.watchpoints.drain(..) {
            wp.uninstall(tracee_ctl)?;
        }
        Ok(())
    }

    /// Propagate the current hardware debug state to a newly created thread.
    pub fn sync_to_thread(&self, tracee_ctl: &TraceeCtl, pid: nix::unistd::Pid) {
        if self.watchpoints.is_empty() {
            return;
        }
        match HardwareDebugState::current(tracee_ctl.proc_pid()) {
            Ok(state) => {
                if let Err(e) = state.sync(pid) {
                    error!("sync hardware debug state to thread {pid}: {e}");
                }
            }
            Err(e) => error!("read hardware debug state: {e}"),
        }
    }
}

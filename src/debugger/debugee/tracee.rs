use crate::debugger::address::RelocatedAddress;
use crate::debugger::code;
use crate::debugger::debugee::tracee::TraceeStatus::{OutOfReach, Running, Stopped};
use crate::debugger::debugee::{Debugee, Location};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{MultipleErrors, Ptrace, Waitpid};
use crate::debugger::register::{Register, RegisterMap};
use log::warn;
use nix::errno::Errno;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;

/// Reason why a tracee is in a stopped state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopType {
    Interrupt,
    SignalStop(Signal),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceeStatus {
    Stopped(StopType),
    Running,
    /// Thread is created but not yet seized by the tracer.
    OutOfReach,
}

/// Single thread of a debugee process.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracee {
    /// Thread id.
    pub pid: Pid,
    /// Number of thread in order of creation, starting from 1.
    pub number: u32,
    /// Thread status known to the tracer.
    pub status: TraceeStatus,
}

impl Tracee {
    /// Wait for change of tracee status.
    pub fn wait_one(&self) -> Result<WaitStatus, Error> {
        waitpid(self.pid, None).map_err(Waitpid)
    }

    /// Continue tracee execution, with signal injection if any.
    pub fn r#continue(&mut self, sig: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::cont(self.pid, sig)
            .map(|_| self.status = Running)
            .map_err(Ptrace)
    }

    /// Execute next instruction, returned status must be inspected by the caller.
    pub fn step(&self, sig: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::step(self.pid, sig).map_err(Ptrace)
    }

    /// Set tracee status into stop.
    /// Note: this function does not actually stop the tracee.
    pub fn set_stop(&mut self, r#type: StopType) {
        self.status = Stopped(r#type);
    }

    #[inline(always)]
    pub fn is_stopped(&self) -> bool {
        matches!(self.status, Stopped(_))
    }

    /// Get current program counter value.
    pub fn pc(&self) -> Result<RelocatedAddress, Error> {
        RegisterMap::current(self.pid)
            .map(|reg_map| RelocatedAddress::from(reg_map.value(Register::Rip)))
            .map_err(Ptrace)
    }

    /// Set new program counter value.
    pub fn set_pc(&self, value: u64) -> Result<(), Error> {
        let mut map = RegisterMap::current(self.pid).map_err(Ptrace)?;
        map.update(Register::Rip, value);
        map.persist(self.pid).map_err(Ptrace)
    }

    /// Return thread-local storage base address (fs segment base on amd64).
    pub fn tls_base(&self) -> Result<RelocatedAddress, Error> {
        RegisterMap::current(self.pid)
            .map(|reg_map| RelocatedAddress::from(reg_map.value(Register::FsBase)))
            .map_err(Ptrace)
    }

    /// Get current tracee location.
    pub fn location(&self, debugee: &Debugee) -> Result<Location, Error> {
        let pc = self.pc()?;
        Ok(Location {
            pid: self.pid,
            pc,
            global_pc: pc.into_global(debugee)?,
        })
    }

    /// True if the current stop is a trace trap (single step or breakpoint).
    pub fn is_in_trap(&self, status: WaitStatus) -> bool {
        let info = match sys::ptrace::getsiginfo(self.pid) {
            Ok(info) => info,
            Err(_) => return false,
        };
        matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP))
            && (info.si_code == code::TRAP_TRACE
                || info.si_code == code::TRAP_BRKPT
                || info.si_code == code::SI_KERNEL)
    }
}

/// Controller of all known tracees (threads) of a debugee process.
pub struct TraceeCtl {
    process_pid: Pid,
    in_focus_tid: Pid,
    next_number: u32,
    threads_state: HashMap<Pid, Tracee>,
}

impl TraceeCtl {
    pub fn new(proc_pid: Pid) -> TraceeCtl {
        Self {
            process_pid: proc_pid,
            in_focus_tid: proc_pid,
            next_number: 2,
            threads_state: HashMap::from([(
                proc_pid,
                Tracee {
                    pid: proc_pid,
                    number: 1,
                    status: Stopped(StopType::Interrupt),
                },
            )]),
        }
    }

    /// Create controller for an externally attached process with known thread list.
    pub fn new_external(proc_pid: Pid, threads: &[Pid]) -> TraceeCtl {
        let mut this = Self {
            process_pid: proc_pid,
            in_focus_tid: proc_pid,
            next_number: 1,
            threads_state: HashMap::new(),
        };
        for &tid in threads {
            let number = this.next_number;
            this.next_number += 1;
            this.threads_state.insert(
                tid,
                Tracee {
                    pid: tid,
                    number,
                    status: Stopped(StopType::Interrupt),
                },
            );
        }
        this
    }

    pub(crate) fn tracee(&self, pid: Pid) -> Option<&Tracee> {
        self.threads_state.get(&pid)
    }

    pub(crate) fn tracee_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.threads_state.get_mut(&pid)
    }

    pub(crate) fn tracee_ensure(&self, pid: Pid) -> &Tracee {
        self.threads_state.get(&pid).expect("tracee must exists")
    }

    pub(crate) fn tracee_ensure_mut(&mut self, pid: Pid) -> &mut Tracee {
        self.tracee_mut(pid).expect("tracee must exists")
    }

    /// Return pid of debugee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    /// Set tracee into focus.
    pub fn set_tracee_to_focus(&mut self, tid: Pid) {
        self.in_focus_tid = tid
    }

    /// Return current focused tracee.
    pub(super) fn tracee_in_focus(&self) -> &Tracee {
        &self.threads_state[&self.in_focus_tid]
    }

    /// Adds thread to the tracked set.
    /// Used for ptrace events like PTRACE_EVENT_CLONE, when we know about a new thread
    /// before it is fully created.
    pub fn add(&mut self, pid: Pid) -> &Tracee {
        let new = Tracee {
            pid,
            number: self.next_number,
            status: Stopped(StopType::Interrupt),
        };
        self.next_number += 1;
        self.threads_state.insert(pid, new);
        &self.threads_state[&pid]
    }

    /// Remove thread from the tracked set.
    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        self.threads_state.remove(&pid)
    }

    /// Continue all currently stopped tracees.
    pub fn cont_stopped(&mut self) -> Result<(), Error> {
        let mut errors = vec![];

        self.threads_state.iter_mut().for_each(|(_, thread)| {
            if thread.is_stopped() {
                if let Err(e) = sys::ptrace::cont(thread.pid, None) {
                    // if no such process - ok, it will be removed later, on PTRACE_EVENT_EXIT event
                    if Errno::ESRCH == e {
                        warn!("thread {} not found, ESRCH", thread.pid);
                        return;
                    }
                    errors.push(Ptrace(e));
                } else {
                    thread.status = Running
                }
            }
        });

        if !errors.is_empty() {
            return Err(MultipleErrors(errors));
        }
        Ok(())
    }

    /// Continue all stopped tracees except those in the exclusion list,
    /// inject a signal into the chosen one.
    ///
    /// # Arguments
    ///
    /// * `inject`: pair of thread id and signal to inject
    /// * `exclude`: list of threads that stay stopped
    pub fn cont_stopped_ex(
        &mut self,
        inject: Option<(Pid, Signal)>,
        exclude: Vec<Pid>,
    ) -> Result<(), Error> {
        let mut errors = vec![];

        self.threads_state.iter_mut().for_each(|(_, thread)| {
            if exclude.contains(&thread.pid) {
                return;
            }
            if thread.is_stopped() {
                let sig = inject.and_then(|(pid, sig)| (pid == thread.pid).then_some(sig));
                if let Err(e) = sys::ptrace::cont(thread.pid, sig) {
                    if Errno::ESRCH == e {
                        warn!("thread {} not found, ESRCH", thread.pid);
                        return;
                    }
                    errors.push(Ptrace(e));
                } else {
                    thread.status = Running
                }
            }
        });

        if !errors.is_empty() {
            return Err(MultipleErrors(errors));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Tracee> {
        self.threads_state.values().cloned().collect()
    }

    pub fn tracee_iter(&self) -> impl Iterator<Item = &Tracee> {
        self.threads_state.values()
    }
}

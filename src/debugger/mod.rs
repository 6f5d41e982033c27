pub mod address;
pub mod breakpoint;
pub mod call;
mod code;
pub mod debugee;
pub mod error;
pub mod goroutine;
pub mod location;
pub mod process;
pub mod register;
mod step;
pub mod variable;
pub mod watchpoint;

pub use debugee::dwarf::unit::PlaceDescriptorOwned;
pub use debugee::dwarf::unwind::Backtrace;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::breakpoint::{Breakpoint, BreakpointRegistry, BrkptType, HitCondition};
use crate::debugger::debugee::dwarf::r#type::GoKind;
use crate::debugger::debugee::dwarf::unit::DieVariant;
use crate::debugger::debugee::dwarf::unwind::FrameSpan;
use crate::debugger::debugee::tracer::{StopReason, TraceContext};
use crate::debugger::debugee::{Debugee, ExecutionStatus, FrameInfo, Location, ThreadSnapshot};
pub use crate::debugger::error::Error;
use crate::debugger::goroutine::{Goroutine, GoroutineFilter, GoroutineReader, GroupBy};
use crate::debugger::location::LocationExpr;
use crate::debugger::process::{Child, Installed};
use crate::debugger::register::debug::{BreakCondition, BreakSize};
use crate::debugger::register::{DwarfRegisterMap, Register, RegisterMap};
use crate::debugger::step::StepResult;
use crate::debugger::variable::dqe::{Dqe, Selector};
use crate::debugger::variable::execute::{encode_scalar_for_write, DqeExecutor, QueryResult};
use crate::debugger::variable::{LoadConfig, Value};
use crate::debugger::watchpoint::{Watchpoint, WatchpointRegistry, WatchpointScope};
use crate::{resolve_unit_call, weak_error};
use log::{info, warn};
use nix::sys;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use object::Object;
use regex::Regex;
use std::ffi::c_long;
use std::fs;
use std::mem;
use std::path::PathBuf;

/// Read N bytes of tracee memory starting at `addr`.
pub fn read_memory_by_pid(pid: Pid, addr: usize, read_n: usize) -> Result<Vec<u8>, Error> {
    use nix::sys::uio;
    use std::io::{IoSliceMut, Read};

    let mut buf = vec![0_u8; read_n];
    let local_iov = IoSliceMut::new(buf.as_mut_slice());
    let remote_iov = uio::RemoteIoVec {
        base: addr,
        len: read_n,
    };
    match uio::process_vm_readv(pid, &mut [local_iov], &[remote_iov]) {
        Ok(n) if n == read_n => Ok(buf),
        Ok(_) | Err(nix::errno::Errno::EPERM) | Err(nix::errno::Errno::ENOSYS) => {
            // fallback to ptrace word-by-word reading
            let mut f = fs::File::open(format!("/proc/{pid}/mem"))?;
            use std::io::Seek;
            f.seek(std::io::SeekFrom::Start(addr as u64))?;
            f.read_exact(&mut buf)?;
            Ok(buf)
        }
        Err(e) => Err(Error::Syscall("process_vm_readv", e)),
    }
}

/// Write machine words into tracee memory.
pub fn write_memory_by_pid(pid: Pid, addr: usize, data: &[u8]) -> Result<(), Error> {
    let mut offset = 0;
    while offset < data.len() {
        let word_addr = (addr + offset) as *mut std::ffi::c_void;
        let mut word = sys::ptrace::read(pid, word_addr).map_err(Error::Ptrace)? as u64;
        let word_bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut word as *mut u64 as *mut u8, mem::size_of::<u64>())
        };

        let to_copy = (data.len() - offset).min(mem::size_of::<u64>());
        word_bytes[..to_copy].copy_from_slice(&data[offset..offset + to_copy]);

        unsafe {
            sys::ptrace::write(pid, word_addr, word as c_long as *mut std::ffi::c_void)
                .map_err(Error::Ptrace)?;
        }
        offset += to_copy;
    }
    Ok(())
}

/// Position where debugee stopped and user exploration happens: thread in focus,
/// frame number inside its stack.
#[derive(Clone, Debug)]
pub struct ExplorationContext {
    focus_location: Location,
    focus_frame: u32,
}

impl ExplorationContext {
    pub fn new(location: Location, frame_num: u32) -> Self {
        Self {
            focus_location: location,
            focus_frame: frame_num,
        }
    }

    /// Create a context for a not yet started debugee, addresses are unknown.
    pub fn new_non_running(pid: Pid) -> Self {
        Self::new(
            Location {
                pc: 0_usize.into(),
                global_pc: 0_usize.into(),
                pid,
            },
            0,
        )
    }

    #[inline(always)]
    pub fn location(&self) -> Location {
        self.focus_location
    }

    #[inline(always)]
    pub fn frame_num(&self) -> u32 {
        self.focus_frame
    }

    #[inline(always)]
    pub fn pid_on_focus(&self) -> Pid {
        self.focus_location.pid
    }
}

/// External events produced by the debugger, consumed by the service layer.
pub trait EventHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        num: u32,
        place: Option<PlaceDescriptorOwned>,
    ) -> Result<(), Error>;
    fn on_watchpoint(&self, pc: RelocatedAddress, num: u32) -> Result<(), Error>;
    fn on_step(&self, pc: RelocatedAddress, place: Option<PlaceDescriptorOwned>)
        -> Result<(), Error>;
    fn on_signal(&self, signal: Signal);
    fn on_tracepoint(&self, num: u32, values: &[QueryResult]) -> Result<(), Error>;
    fn on_exit(&self, code: i32);
}

/// Hook that does nothing, useful for tests and batch runs.
pub struct DoNothingHook {}

impl EventHook for DoNothingHook {
    fn on_breakpoint(
        &self,
        _: RelocatedAddress,
        _: u32,
        _: Option<PlaceDescriptorOwned>,
    ) -> Result<(), Error> {
        Ok(())
    }
    fn on_watchpoint(&self, _: RelocatedAddress, _: u32) -> Result<(), Error> {
        Ok(())
    }
    fn on_step(&self, _: RelocatedAddress, _: Option<PlaceDescriptorOwned>) -> Result<(), Error> {
        Ok(())
    }
    fn on_signal(&self, _: Signal) {}
    fn on_tracepoint(&self, _: u32, _: &[QueryResult]) -> Result<(), Error> {
        Ok(())
    }
    fn on_exit(&self, _: i32) {}
}

macro_rules! disable_when_not_started {
    ($this: expr) => {
        if !$this.debugee.is_in_progress() {
            return Err(Error::ProcessNotStarted);
        }
    };
}

/// Single stack frame of an extended (inline aware) backtrace.
#[derive(Debug, Clone)]
pub struct ExtendedFrame {
    pub func_name: Option<String>,
    pub ip: RelocatedAddress,
    pub place: Option<PlaceDescriptorOwned>,
    /// True for synthetic frames of inlined calls.
    pub inlined: bool,
    /// Call site of an inlined frame (file, line).
    pub call_site: Option<(PathBuf, u64)>,
}

/// A resolved user location: an address plus its source place.
#[derive(Debug, Clone)]
pub struct ResolvedLocation {
    pub addr: RelocatedAddress,
    pub place: Option<PlaceDescriptorOwned>,
    pub fn_name: Option<String>,
}

/// Builder of a [`Debugger`].
pub struct DebuggerBuilder {
    hooks: Box<dyn EventHook + Send>,
    debug_info_dirs: Vec<PathBuf>,
    load_config: LoadConfig,
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self {
            hooks: Box::new(DoNothingHook {}),
            debug_info_dirs: vec![PathBuf::from("/usr/lib/debug")],
            load_config: LoadConfig::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: impl EventHook + Send + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_debug_info_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.debug_info_dirs = dirs;
        self
    }

    pub fn with_load_config(mut self, config: LoadConfig) -> Self {
        self.load_config = config;
        self
    }

    /// Build a debugger for a spawned (but not yet started) process.
    pub fn build(self, process: Child<Installed>) -> Result<Debugger, Error> {
        Debugger::new(process, self.hooks, self.debug_info_dirs, self.load_config)
    }

    /// Build a debugger attached to an already running process.
    pub fn build_attached(self, process: Child<Installed>) -> Result<Debugger, Error> {
        Debugger::new_attached(process, self.hooks, self.debug_info_dirs, self.load_config)
    }
}

/// Main structure of the debugger backend. Implements all user visible operations
/// over a single tracee.
///
/// At every public method boundary the tracee is fully stopped (or exited); methods
/// that resume it always restore the halt before returning.
pub struct Debugger {
    /// Debugee static/runtime state and ptrace control.
    pub(crate) debugee: Debugee,
    process: Child<Installed>,
    pub(crate) breakpoints: BreakpointRegistry,
    watchpoints: WatchpointRegistry,
    /// Current exploration context.
    expl_context: ExplorationContext,
    /// A goroutine explicitly chosen by the user, if it is not running on a thread.
    focused_goroutine: Option<u64>,
    hooks: Box<dyn EventHook + Send>,
    load_config: LoadConfig,
    /// Follow-exec mode: `None` disabled, `Some(mb_regex)` enabled with an optional
    /// filter over the new image path.
    follow_exec: Option<Option<Regex>>,
}

impl Debugger {
    fn new(
        process: Child<Installed>,
        hooks: Box<dyn EventHook + Send>,
        debug_info_dirs: Vec<PathBuf>,
        load_config: LoadConfig,
    ) -> Result<Self, Error> {
        let program_path = PathBuf::from(&process.program);
        let file = fs::File::open(&program_path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;
        if object.format() != object::BinaryFormat::Elf {
            return Err(Error::Unsupported("only ELF binaries are supported"));
        }

        let debugee =
            Debugee::new_non_running(&program_path, &process, &object, &debug_info_dirs)?;
        let pid = process.pid();
        Ok(Self {
            debugee,
            process,
            breakpoints: BreakpointRegistry::default(),
            watchpoints: WatchpointRegistry::default(),
            expl_context: ExplorationContext::new_non_running(pid),
            focused_goroutine: None,
            hooks,
            load_config,
            follow_exec: None,
        })
    }

    fn new_attached(
        process: Child<Installed>,
        hooks: Box<dyn EventHook + Send>,
        debug_info_dirs: Vec<PathBuf>,
        load_config: LoadConfig,
    ) -> Result<Self, Error> {
        let program_path = PathBuf::from(&process.program);
        let file = fs::File::open(&program_path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let debugee =
            Debugee::new_from_external_process(&program_path, &process, &object, &debug_info_dirs)?;
        let pid = process.pid();
        let mut debugger = Self {
            debugee,
            process,
            breakpoints: BreakpointRegistry::default(),
            watchpoints: WatchpointRegistry::default(),
            expl_context: ExplorationContext::new_non_running(pid),
            focused_goroutine: None,
            hooks,
            load_config,
            follow_exec: None,
        };
        debugger.expl_ctx_update_location()?;
        Ok(debugger)
    }

    /// Start the spawned debugee and stop at its entry.
    pub fn start_debugee(&mut self) -> Result<(), Error> {
        if self.debugee.is_in_progress() {
            return Err(Error::AlreadyRun);
        }

        loop {
            let breakpoints = self.breakpoints.active_breakpoints();
            let reason = self
                .debugee
                .trace_until_stop(TraceContext::new(&breakpoints))?;
            drop(breakpoints);
            if let StopReason::DebugeeStart = reason {
                // now, when mappings are known, all deferred breakpoints become real
                self.breakpoints.enable_all()?;
                self.expl_ctx_update_location()?;
                return Ok(());
            }
            if let StopReason::DebugeeExit(code) = reason {
                return Err(Error::ProcessExit(code));
            }
        }
    }

    /// Continue debugee execution until a user visible stop.
    pub fn continue_debugee(&mut self) -> Result<StopReason, Error> {
        disable_when_not_started!(self);
        let reason = self.continue_execution()?;
        Ok(reason)
    }

    /// Central stop processing: resume all threads and handle kernel stops until one
    /// of them must be reported to the user.
    pub(crate) fn continue_execution(&mut self) -> Result<StopReason, Error> {
        loop {
            if self.breakpoints.get_enabled(self.expl_context.location().pc).is_some() {
                // the thread in focus stands on a trap, step it over first
                self.step_over_breakpoint()?;
                if self.debugee.is_exited() {
                    return Ok(StopReason::DebugeeExit(0));
                }
            }

            let breakpoints = self.breakpoints.active_breakpoints();
            let reason = self
                .debugee
                .trace_until_stop(TraceContext::new(&breakpoints))?;
            drop(breakpoints);

            match reason {
                StopReason::DebugeeExit(code) => {
                    self.hooks.on_exit(code);
                    return Ok(reason);
                }
                StopReason::DebugeeStart => {
                    self.breakpoints.enable_all()?;
                    continue;
                }
                StopReason::NoSuchProcess(_) => {
                    return Err(Error::TraceeGone);
                }
                StopReason::NewImage(pid) => {
                    let follow = match &self.follow_exec {
                        None => false,
                        Some(None) => true,
                        Some(Some(regex)) => {
                            let exe = fs::read_link(format!("/proc/{pid}/exe"))
                                .map(|p| p.to_string_lossy().to_string())
                                .unwrap_or_default();
                            regex.is_match(&exe)
                        }
                    };
                    if follow {
                        info!(target: "debugger", "follow exec into a new image");
                        self.debugee.reload_from_exec(pid)?;
                        self.expl_ctx_update_location()?;
                        return Ok(StopReason::NewImage(pid));
                    }
                    // not following: detach from the execed child
                    warn!(target: "debugger", "exec event ignored, detach from the new image");
                    weak_error!(sys::ptrace::detach(pid, None));
                    continue;
                }
                StopReason::SignalStop(pid, signal) => {
                    self.set_thread_focus(pid)?;
                    self.hooks.on_signal(signal);
                    return Ok(reason);
                }
                StopReason::Watchpoint(pid, addr, ty) => {
                    self.set_thread_focus(pid)?;
                    let Some(wp) = self.watchpoints.find_by_hit(&ty) else {
                        // stale hardware hit of a removed watchpoint
                        continue;
                    };
                    let number = wp.number;
                    self.hooks.on_watchpoint(addr, number)?;
                    return Ok(StopReason::Watchpoint(pid, addr, ty));
                }
                StopReason::Breakpoint(pid, addr) => {
                    self.set_thread_focus(pid)?;

                    enum Disposition {
                        Report { number: u32, tracepoint: bool },
                        Transparent,
                        ReportAsIs,
                        WatchpointEnd(u32),
                    }

                    let disposition = {
                        let Some(brkpt) = self.breakpoints.get_enabled(addr) else {
                            // rewound into an unknown trap, report as is
                            return Ok(reason);
                        };
                        match brkpt.r#type() {
                            BrkptType::EntryPoint | BrkptType::Temporary | BrkptType::CallReturn => {
                                Disposition::ReportAsIs
                            }
                            BrkptType::WatchpointCompanion => {
                                Disposition::WatchpointEnd(brkpt.number)
                            }
                            BrkptType::UserDefined => {
                                if !brkpt.is_user_enabled() {
                                    Disposition::Transparent
                                } else {
                                    Disposition::Report {
                                        number: brkpt.number,
                                        tracepoint: brkpt.is_tracepoint,
                                    }
                                }
                            }
                        }
                    };

                    match disposition {
                        Disposition::ReportAsIs => return Ok(reason),
                        Disposition::Transparent => continue,
                        Disposition::WatchpointEnd(companion_number) => {
                            // the frame owning a watched object returned, the watchpoint
                            // is cleared automatically together with its companion
                            let wp_num = self
                                .watchpoints
                                .find_by_companion(companion_number)
                                .map(|wp| wp.number);
                            match wp_num {
                                Some(wp_num) => {
                                    self.remove_watchpoint(wp_num)?;
                                }
                                None => {
                                    self.breakpoints.remove_by_number(companion_number)?;
                                }
                            }
                            continue;
                        }
                        Disposition::Report { number, tracepoint } => {
                            if !self.breakpoint_condition_passed(number)? {
                                continue;
                            }

                            let goid = self.current_goroutine_id();
                            let (total, _) = self.breakpoints.register_goroutine_hit(number, goid);

                            let hit_condition =
                                self.breakpoints.get(number).and_then(|b| b.hit_condition);
                            if let Some(hit_condition) = hit_condition {
                                if !hit_condition.matched(total) {
                                    continue;
                                }
                            }

                            if tracepoint {
                                let actions: Vec<Dqe> = self
                                    .breakpoints
                                    .get(number)
                                    .map(|b| b.tracepoint_actions.clone())
                                    .unwrap_or_default();
                                let executor = DqeExecutor::new(self);
                                let mut values = vec![];
                                for action in &actions {
                                    if let Ok(mut res) = executor.query(action) {
                                        values.append(&mut res);
                                    }
                                }
                                self.hooks.on_tracepoint(number, &values)?;
                                continue;
                            }

                            let place = self
                                .breakpoints
                                .get(number)
                                .and_then(|b| b.place.clone());
                            self.hooks.on_breakpoint(addr, number, place)?;
                            return Ok(reason);
                        }
                    }
                }
            }
        }
    }

    /// Evaluate a breakpoint condition in the context of the stopped thread top frame.
    fn breakpoint_condition_passed(&mut self, number: u32) -> Result<bool, Error> {
        let Some(condition) = self.breakpoints.get(number).and_then(|b| b.condition.clone())
        else {
            return Ok(true);
        };

        let executor = DqeExecutor::new(self);
        let results = match executor.query(&condition) {
            Ok(results) => results,
            Err(e) => {
                warn!(target: "debugger", "breakpoint condition evaluation: {e:#}");
                return Ok(true);
            }
        };
        Ok(results
            .first()
            .and_then(|r| r.value.as_bool())
            .unwrap_or(true))
    }

    // ---------------------------------- state and focus ------------------------------------------

    pub fn exploration_ctx(&self) -> &ExplorationContext {
        &self.expl_context
    }

    pub(crate) fn expl_ctx_update_location(&mut self) -> Result<(), Error> {
        if !self.debugee.is_in_progress() {
            return Ok(());
        }
        let tracee = self.debugee.tracee_in_focus();
        let location = tracee.location(&self.debugee)?;
        self.expl_context = ExplorationContext::new(location, 0);
        self.focused_goroutine = None;
        Ok(())
    }

    fn set_thread_focus(&mut self, pid: Pid) -> Result<(), Error> {
        self.debugee.set_tracee_to_focus(pid);
        self.expl_ctx_update_location()
    }

    /// Switch exploration context into another frame of the current thread stack.
    pub fn set_frame_into_focus(&mut self, num: u32) -> Result<(), Error> {
        disable_when_not_started!(self);
        let bt = self.debugee.unwind(self.expl_context.pid_on_focus())?;
        let frame = bt.get(num as usize).ok_or(Error::FrameNotFound(num))?;
        let location = Location {
            pc: frame.ip,
            global_pc: frame.ip.into_global(&self.debugee)?,
            pid: self.expl_context.pid_on_focus(),
        };
        self.expl_context = ExplorationContext::new(location, num);
        Ok(())
    }

    /// Switch focus into another thread by its number.
    pub fn set_thread_into_focus(&mut self, num: u32) -> Result<ThreadSnapshot, Error> {
        disable_when_not_started!(self);
        let tracee = self.debugee.get_tracee_by_num(num)?;
        self.set_thread_focus(tracee.pid)?;
        let snapshot = self
            .debugee
            .thread_state(&self.expl_context)?
            .into_iter()
            .find(|t| t.thread.pid == tracee.pid)
            .expect("focused thread must be in the snapshot");
        Ok(snapshot)
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.debugee.execution_status()
    }

    pub fn process_pid(&self) -> Pid {
        self.process.pid()
    }

    /// Build fingerprint of the main executable image.
    pub fn build_id(&self) -> Option<String> {
        let debug_info = self.debugee.program_debug_info().ok()?;
        let id = debug_info.build_id()?;
        Some(id.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn load_config(&self) -> LoadConfig {
        self.load_config
    }

    pub fn set_load_config(&mut self, config: LoadConfig) {
        self.load_config = config;
    }

    /// Enable or disable follow-exec mode.
    pub fn set_follow_exec(&mut self, enabled: bool, regex: Option<String>) -> Result<(), Error> {
        self.follow_exec = if enabled {
            Some(regex.map(|r| Regex::new(&r)).transpose()?)
        } else {
            None
        };
        Ok(())
    }

    pub fn debug_info_dirs(&self) -> Vec<PathBuf> {
        self.debugee.debug_info_dirs().to_vec()
    }

    pub fn set_debug_info_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.debugee.set_debug_info_dirs(dirs);
    }

    // ---------------------------------- run control ----------------------------------------------

    /// Single machine instruction step of the thread in focus.
    pub fn step_instruction(&mut self) -> Result<(), Error> {
        disable_when_not_started!(self);
        self.single_step_instruction()?;
        let location = self.expl_context.location();
        let place = self.place_at(location.pc);
        self.hooks.on_step(location.pc, place)?;
        Ok(())
    }

    /// Step into: move to the next source statement, entering called functions.
    pub fn step_into(&mut self) -> Result<(), Error> {
        disable_when_not_started!(self);
        match self.step_in()? {
            StepResult::Done => {
                let location = self.expl_context.location();
                let place = self.place_at(location.pc);
                self.hooks.on_step(location.pc, place)?;
            }
            StepResult::SignalInterrupt { signal, quiet } => {
                if !quiet {
                    self.hooks.on_signal(signal);
                }
            }
            StepResult::WatchpointInterrupt { addr, quiet, .. } => {
                if !quiet {
                    let number = self
                        .watchpoints
                        .all()
                        .iter()
                        .find(|wp| wp.address() == addr)
                        .map(|wp| wp.number)
                        .unwrap_or_default();
                    self.hooks.on_watchpoint(addr, number)?;
                }
            }
            StepResult::BreakpointInterrupt { .. } => {}
        }
        Ok(())
    }

    /// Step over: move to the next source statement without entering called functions.
    pub fn step_over(&mut self) -> Result<(), Error> {
        disable_when_not_started!(self);
        match self.step_over_any()? {
            StepResult::Done => {
                let location = self.expl_context.location();
                let place = self.place_at(location.pc);
                self.hooks.on_step(location.pc, place)?;
            }
            StepResult::SignalInterrupt { signal, quiet } => {
                if !quiet {
                    self.hooks.on_signal(signal);
                }
            }
            StepResult::WatchpointInterrupt { addr, quiet, .. } => {
                if !quiet {
                    let number = self
                        .watchpoints
                        .all()
                        .iter()
                        .find(|wp| wp.address() == addr)
                        .map(|wp| wp.number)
                        .unwrap_or_default();
                    self.hooks.on_watchpoint(addr, number)?;
                }
            }
            StepResult::BreakpointInterrupt { .. } => {
                // the stop is already reported by continue_execution hooks
            }
        }
        Ok(())
    }

    /// Step out: continue until the current frame returns.
    pub fn step_out(&mut self) -> Result<(), Error> {
        disable_when_not_started!(self);
        self.step_out_frame()?;
        let location = self.expl_context.location();
        let place = self.place_at(location.pc);
        self.hooks.on_step(location.pc, place)?;
        Ok(())
    }

    /// Stop all threads of a running tracee. This is the universal cancellation
    /// primitive: it unblocks any in-flight resume operation.
    ///
    /// Safe to call from another thread while a resume is in progress.
    pub fn halt(pid: Pid) -> Result<(), Error> {
        kill(pid, Signal::SIGSTOP).map_err(|e| Error::Syscall("kill", e))
    }

    /// Detach from the tracee, optionally killing it.
    pub fn detach(&mut self, kill_tracee: bool) -> Result<(), Error> {
        if self.debugee.is_exited() {
            return Ok(());
        }

        self.breakpoints.disable_all()?;
        self.watchpoints.clear(self.debugee.tracee_ctl())?;

        if kill_tracee {
            kill(self.process.pid(), Signal::SIGKILL).map_err(|e| Error::Syscall("kill", e))?;
            return Ok(());
        }

        for tracee in self.debugee.tracee_ctl().snapshot() {
            weak_error!(sys::ptrace::detach(tracee.pid, None));
        }
        Ok(())
    }

    /// Restart the debugee: kill the current process and spawn a fresh one with the
    /// same command line. User breakpoints are re-resolved against the new process.
    pub fn restart(&mut self) -> Result<Pid, Error> {
        // keep user breakpoint places before the old process dies
        let saved: Vec<_> = self
            .breakpoints
            .user_breakpoints()
            .into_iter()
            .map(|b| {
                (
                    b.place.clone(),
                    b.condition.clone(),
                    b.hit_condition,
                    b.name.clone(),
                )
            })
            .collect();

        if !self.debugee.is_exited() {
            kill(self.process.pid(), Signal::SIGKILL).map_err(|e| Error::Syscall("kill", e))?;
            loop {
                let status = nix::sys::wait::waitpid(self.process.pid(), None);
                match status {
                    Ok(nix::sys::wait::WaitStatus::Signaled(_, _, _)) | Err(_) => break,
                    _ => continue,
                }
            }
        }

        let new_process = self.process.install()?;
        let new_pid = new_process.pid();
        self.debugee = self.debugee.extend(new_pid);
        self.process = new_process;
        self.breakpoints = BreakpointRegistry::default();
        self.watchpoints = WatchpointRegistry::default();
        self.expl_context = ExplorationContext::new_non_running(new_pid);
        self.focused_goroutine = None;

        self.start_debugee()?;

        for (place, condition, hit_condition, name) in saved {
            if let Some(place) = place {
                let addr = weak_error!(place
                    .address
                    .relocate_to_segment(&self.debugee, self.debugee.program_debug_info()?));
                if let Some(addr) = addr {
                    let mut brkpt = Breakpoint::new_user_defined(addr, new_pid);
                    brkpt.name = name;
                    brkpt.condition = condition;
                    brkpt.hit_condition = hit_condition;
                    let brkpt = brkpt.with_place(Some(place));
                    weak_error!(self.breakpoints.add_and_enable(brkpt));
                }
            }
        }

        Ok(new_pid)
    }

    // ---------------------------------- breakpoints ----------------------------------------------

    /// Resolve a user location into a list of addresses.
    /// An ambiguous function name produces multiple locations.
    pub fn resolve_location(&self, loc: &LocationExpr) -> Result<Vec<ResolvedLocation>, Error> {
        disable_when_not_started!(self);

        let mut result = vec![];
        match loc {
            LocationExpr::Address(addr) => {
                let addr = RelocatedAddress::from(*addr);
                let place = self.place_at(addr);
                result.push(ResolvedLocation {
                    addr,
                    place,
                    fn_name: None,
                });
            }
            LocationExpr::FileLine { file, line } => {
                for debug_info in self.debugee.debug_info_all() {
                    if !debug_info.has_debug_info() {
                        continue;
                    }
                    if let Some(place) = debug_info.find_place(file, *line)? {
                        let addr = place
                            .address
                            .relocate_to_segment(&self.debugee, debug_info)?;
                        result.push(ResolvedLocation {
                            addr,
                            place: Some(place.to_owned()),
                            fn_name: None,
                        });
                        break;
                    }
                }
            }
            LocationExpr::Function { name, line } => {
                for debug_info in self.debugee.debug_info_all() {
                    if !debug_info.has_debug_info() {
                        continue;
                    }
                    for func in debug_info.search_functions(name)? {
                        let place = func.prolog_end_place()?;
                        let place = match line {
                            None => place.to_owned(),
                            Some(line_offset) => {
                                let target_line = place.line_number + line_offset;
                                debug_info
                                    .find_place(
                                        &place.file.to_string_lossy(),
                                        target_line,
                                    )?
                                    .map(|p| p.to_owned())
                                    .ok_or(Error::NoSuitablePlace)?
                            }
                        };
                        let addr = place
                            .address
                            .relocate_to_segment(&self.debugee, debug_info)?;
                        result.push(ResolvedLocation {
                            addr,
                            place: Some(place),
                            fn_name: func.full_name(),
                        });
                    }
                }
            }
            LocationExpr::Regex(pattern) => {
                let regex = Regex::new(pattern)?;
                for debug_info in self.debugee.debug_info_all() {
                    if !debug_info.has_debug_info() {
                        continue;
                    }
                    for fn_name in debug_info.search_functions_by_regex(&regex)? {
                        for func in debug_info.search_functions(&fn_name)? {
                            let place = func.prolog_end_place()?;
                            let addr = place
                                .address
                                .relocate_to_segment(&self.debugee, debug_info)?;
                            result.push(ResolvedLocation {
                                addr,
                                place: Some(place.to_owned()),
                                fn_name: Some(fn_name.clone()),
                            });
                        }
                    }
                }
            }
            LocationExpr::Line(line) => {
                let place = self
                    .place_at(self.expl_context.location().pc)
                    .ok_or(Error::NoSuitablePlace)?;
                return self.resolve_location(&LocationExpr::FileLine {
                    file: place.file.to_string_lossy().to_string(),
                    line: *line,
                });
            }
            LocationExpr::RelativeLine(offset) => {
                let place = self
                    .place_at(self.expl_context.location().pc)
                    .ok_or(Error::NoSuitablePlace)?;
                let line = place
                    .line_number
                    .checked_add_signed(*offset)
                    .ok_or(Error::NoSuitablePlace)?;
                return self.resolve_location(&LocationExpr::FileLine {
                    file: place.file.to_string_lossy().to_string(),
                    line,
                });
            }
        }

        Ok(result)
    }

    /// Create a breakpoint at a user location.
    ///
    /// A function with inlined copies produces one logical breakpoint with several
    /// physical addresses: the out-of-line body and the first statement of every
    /// inlined call site.
    pub fn create_breakpoint(&mut self, loc: &LocationExpr) -> Result<Vec<u32>, Error> {
        let pid = self.process.pid();
        let resolved = self.resolve_location(loc)?;
        if resolved.is_empty() {
            return Err(Error::NoSuitablePlace);
        }

        let mut numbers = vec![];
        let mut logical: Option<u32> = None;

        let mut physical = resolved;
        if let LocationExpr::Function { name, line: None } = loc {
            physical.extend(self.inline_instances(name)?);
        }

        for loc in physical {
            let mut brkpt = Breakpoint::new_user_defined(loc.addr, pid).with_place(loc.place);
            if let Some(logical) = logical {
                brkpt.logical_number = logical;
            } else {
                logical = Some(brkpt.logical_number);
            }
            let number = if self.debugee.is_in_progress() {
                self.breakpoints.add_and_enable(brkpt)?
            } else {
                self.breakpoints.add_deferred(brkpt)
            };
            numbers.push(number);
        }

        Ok(numbers)
    }

    /// Physical locations of inlined copies of a function.
    fn inline_instances(&self, fn_name: &str) -> Result<Vec<ResolvedLocation>, Error> {
        let mut instances = vec![];
        let Ok(debug_info) = self.debugee.program_debug_info() else {
            return Ok(instances);
        };
        if !debug_info.has_debug_info() {
            return Ok(instances);
        }

        for unit_idx in 0..debug_info.unit_count() {
            let unit = debug_info.unit_ensure(unit_idx);
            let entries_it = resolve_unit_call!(debug_info.dwarf(), unit, entries_it);
            for entry in entries_it {
                let DieVariant::InlineSubroutine(ref inlined) = entry.die else {
                    continue;
                };
                let name_matches = {
                    let origin_name = inlined.base_attributes.name.clone().or_else(|| {
                        inlined.abstract_origin.and_then(|origin| {
                            debug_info.deref_die(unit, origin).and_then(|(e, _)| {
                                if let DieVariant::Function(ref f) = e.die {
                                    f.base_attributes.name.clone()
                                } else {
                                    None
                                }
                            })
                        })
                    });
                    origin_name.as_deref().map(|n| {
                        crate::debugger::debugee::dwarf::unit::fn_name_matches(n, fn_name)
                    })
                };
                if name_matches != Some(true) {
                    continue;
                }

                let Some(range) = inlined.base_attributes.ranges.first() else {
                    continue;
                };
                // first row of the inlined body
                let Some(place) = unit.find_place_by_pc(GlobalAddress::from(range.begin)) else {
                    continue;
                };
                let addr = place
                    .address
                    .relocate_to_segment(&self.debugee, debug_info)?;
                instances.push(ResolvedLocation {
                    addr,
                    place: Some(place.to_owned()),
                    fn_name: Some(fn_name.to_string()),
                });
            }
        }

        Ok(instances)
    }

    pub fn breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoints.user_breakpoints()
    }

    /// Per goroutine hit counters of a breakpoint.
    pub fn breakpoint_goroutine_hits(&self, number: u32) -> std::collections::HashMap<u64, u64> {
        self.breakpoints.goroutine_hits(number)
    }

    /// Remove a logical breakpoint with all its physical parts.
    pub fn remove_breakpoint(&mut self, number: u32) -> Result<(), Error> {
        let logical = self
            .breakpoints
            .get(number)
            .map(|b| b.logical_number)
            .ok_or(Error::BreakpointNotFound(number))?;
        self.breakpoints.remove_logical(logical)?;
        Ok(())
    }

    /// Toggle the user visible enable flag of a breakpoint.
    pub fn toggle_breakpoint(&mut self, number: u32) -> Result<bool, Error> {
        let brkpt = self
            .breakpoints
            .get(number)
            .ok_or(Error::BreakpointNotFound(number))?;
        let new_state = !brkpt.is_user_enabled();
        brkpt.set_user_enabled(new_state);
        Ok(new_state)
    }

    /// Amend breakpoint attributes. The condition is validated right now: an
    /// expression referencing an undefined identifier is rejected at amend time.
    pub fn amend_breakpoint(
        &mut self,
        number: u32,
        name: Option<String>,
        condition: Option<String>,
        hit_condition: Option<String>,
        tracepoint: Option<bool>,
        tracepoint_actions: Option<Vec<String>>,
    ) -> Result<(), Error> {
        let condition = condition
            .map(|src| -> Result<Dqe, Error> {
                let dqe = variable::parse::parse_expression(&src)?;
                self.validate_condition_identifiers(&dqe)?;
                Ok(dqe)
            })
            .transpose()?;

        let hit_condition = hit_condition
            .map(|src| {
                HitCondition::parse(&src)
                    .ok_or_else(|| Error::ExpressionParsing(format!("bad hit condition: {src}")))
            })
            .transpose()?;

        let actions = tracepoint_actions
            .map(|actions| {
                actions
                    .iter()
                    .map(|src| variable::parse::parse_expression(src))
                    .collect::<Result<Vec<_>, Error>>()
            })
            .transpose()?;

        let brkpt = self
            .breakpoints
            .get_mut(number)
            .ok_or(Error::BreakpointNotFound(number))?;
        if let Some(name) = name {
            brkpt.name = Some(name);
        }
        if condition.is_some() {
            brkpt.condition = condition;
        }
        if hit_condition.is_some() {
            brkpt.hit_condition = hit_condition;
        }
        if let Some(tracepoint) = tracepoint {
            brkpt.is_tracepoint = tracepoint;
        }
        if let Some(actions) = actions {
            brkpt.tracepoint_actions = actions;
        }
        Ok(())
    }

    /// Check that every identifier of a condition expression is resolvable in the
    /// current scope.
    fn validate_condition_identifiers(&self, dqe: &Dqe) -> Result<(), Error> {
        fn collect_idents(dqe: &Dqe, acc: &mut Vec<String>) {
            match dqe {
                Dqe::Variable(Selector::Name { var_name, .. }) => acc.push(var_name.clone()),
                Dqe::Variable(Selector::Any) | Dqe::Literal(_) | Dqe::PtrCast(_) => {}
                Dqe::Cast(_, e)
                | Dqe::Field(e, _)
                | Dqe::Slice(e, _, _)
                | Dqe::Deref(e)
                | Dqe::Address(e) => collect_idents(e, acc),
                Dqe::Index(e, i) => {
                    collect_idents(e, acc);
                    collect_idents(i, acc);
                }
                Dqe::Binary(_, l, r) => {
                    collect_idents(l, acc);
                    collect_idents(r, acc);
                }
                Dqe::Call(_, args) => args.iter().for_each(|a| collect_idents(a, acc)),
            }
        }

        if !self.debugee.is_in_progress() {
            // no frame context yet, identifiers will be verified on first hit
            return Ok(());
        }

        let mut idents = vec![];
        collect_idents(dqe, &mut idents);
        for ident in idents {
            let found = variable::select::resolve_identifier(
                &self.debugee,
                &self.expl_context,
                &ident,
                false,
            )?;
            if found.is_empty() {
                return Err(Error::SymbolNotFound(ident));
            }
        }
        Ok(())
    }

    // ---------------------------------- watchpoints ----------------------------------------------

    /// Create a watchpoint over the result of an expression.
    /// A watchpoint over a frame local is auto-cleared when the frame returns.
    pub fn create_watchpoint(
        &mut self,
        source_string: &str,
        condition: BreakCondition,
    ) -> Result<u32, Error> {
        disable_when_not_started!(self);

        let dqe = variable::parse::parse_expression(source_string)?;
        let address_dqe = Dqe::Address(dqe.clone().boxed());

        let executor = DqeExecutor::new(self);
        let mut results = executor.query(&address_dqe)?;
        if results.is_empty() {
            results = executor.query_arguments(&address_dqe)?;
        }
        if results.is_empty() {
            return Err(Error::WatchSubjectNotFound);
        }
        let result = results.swap_remove(0);

        let variable::ValueRepr::Pointer {
            value: Some(address),
            target_type_size,
            ..
        } = result.value.repr
        else {
            return Err(Error::WatchSubjectNotFound);
        };
        let size = target_type_size.ok_or(Error::WatchpointUndefinedSize)?;
        if size > u8::MAX as u64 {
            return Err(Error::WatchpointWrongSize);
        }
        let size = BreakSize::try_from(size as u8)?;

        // a scoped subject gets a companion breakpoint at the frame return address,
        // its hit is the end of the object lifetime
        let (scope, companion_number) = match result.scope {
            Some(_) => {
                let pid = self.expl_context.pid_on_focus();
                let ret_addr = self
                    .debugee
                    .return_addr(pid)?
                    .ok_or(Error::UnwindNoContext)?;
                let frame_id = self
                    .debugee
                    .unwind(pid)?
                    .first()
                    .and_then(FrameSpan::id);

                let companion = Breakpoint::new_watchpoint_companion(ret_addr, pid);
                let companion_number = self.breakpoints.add_and_enable(companion)?;
                (
                    WatchpointScope::Frame {
                        frame_id,
                        companion: companion_number,
                    },
                    Some(companion_number),
                )
            }
            None => (WatchpointScope::Global, None),
        };

        let wp = Watchpoint::install(
            self.debugee.tracee_ctl(),
            source_string.to_string(),
            Some(dqe),
            scope,
            RelocatedAddress::from(address),
            size,
            condition,
        );

        let wp = match wp {
            Ok(wp) => wp,
            Err(e) => {
                // the companion is useless without its watchpoint
                if let Some(companion) = companion_number {
                    let _ = self.breakpoints.remove_by_number(companion);
                }
                return Err(e);
            }
        };

        Ok(self.watchpoints.add(wp))
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        self.watchpoints.all()
    }

    pub fn remove_watchpoint(&mut self, number: u32) -> Result<bool, Error> {
        let companion = self.watchpoints.get(number).and_then(|wp| match wp.scope {
            WatchpointScope::Frame { companion, .. } => Some(companion),
            WatchpointScope::Global => None,
        });
        let removed = self.watchpoints.remove(self.debugee.tracee_ctl(), number)?;
        if let Some(companion) = companion {
            self.breakpoints.remove_by_number(companion)?;
        }
        Ok(removed)
    }

    // ---------------------------------- inspection -----------------------------------------------

    fn place_at(&self, pc: RelocatedAddress) -> Option<PlaceDescriptorOwned> {
        let debug_info = self.debugee.debug_info(pc).ok()?;
        let global = pc.into_global(&self.debugee).ok()?;
        debug_info
            .find_place_from_pc(global)
            .ok()
            .flatten()
            .map(|p| p.to_owned())
    }

    /// Backtrace of a thread with synthetic frames for inlined calls.
    pub fn backtrace_extended(
        &self,
        pid: Pid,
        depth: Option<usize>,
    ) -> Result<Vec<ExtendedFrame>, Error> {
        disable_when_not_started!(self);
        let bt = self.debugee.unwind(pid)?;
        let mut result = vec![];

        for frame in bt.iter() {
            let frames_of_span = self.explode_frame(frame);
            result.extend(frames_of_span);
            if let Some(depth) = depth {
                if result.len() >= depth {
                    result.truncate(depth);
                    break;
                }
            }
        }

        Ok(result)
    }

    /// Expand a physical frame into inline frames (innermost first) plus itself.
    fn explode_frame(&self, frame: &FrameSpan) -> Vec<ExtendedFrame> {
        let mut result = vec![];

        let inline_chain = (|| {
            let debug_info = self.debugee.debug_info(frame.ip).ok()?;
            let global = frame.ip.into_global(&self.debugee).ok()?;
            let func = debug_info.find_function_by_pc(global).ok().flatten()?;
            Some(func.inline_chain_at(global))
        })()
        .unwrap_or_default();

        // the chain is outermost-first, the user sees innermost on top
        for (idx, inlined) in inline_chain.iter().enumerate().rev() {
            let place = if idx == inline_chain.len() - 1 {
                frame.place.clone()
            } else {
                // place of the call into the next (inner) inlined function
                inline_chain
                    .get(idx + 1)
                    .and_then(|inner| inner.call_place())
                    .and_then(|(file, line)| {
                        let debug_info = self.debugee.debug_info(frame.ip).ok()?;
                        debug_info
                            .find_place(&file.to_string_lossy(), line)
                            .ok()
                            .flatten()
                            .map(|p| p.to_owned())
                    })
            };
            result.push(ExtendedFrame {
                func_name: inlined.inlined_name(),
                ip: frame.ip,
                place,
                inlined: true,
                call_site: inlined.call_place(),
            });
        }

        let outer_place = inline_chain
            .first()
            .and_then(|outermost| outermost.call_place())
            .and_then(|(file, line)| {
                let debug_info = self.debugee.debug_info(frame.ip).ok()?;
                debug_info
                    .find_place(&file.to_string_lossy(), line)
                    .ok()
                    .flatten()
                    .map(|p| p.to_owned())
            })
            .or_else(|| frame.place.clone());

        result.push(ExtendedFrame {
            func_name: frame.func_name.clone(),
            ip: frame.ip,
            place: outer_place,
            inlined: false,
            call_site: None,
        });

        result
    }

    /// Backtrace of a goroutine. Running goroutines unwound from live registers,
    /// parked ones from the scheduler saved state.
    pub fn goroutine_backtrace(&self, goid: u64) -> Result<Vec<ExtendedFrame>, Error> {
        disable_when_not_started!(self);
        let goroutines = self.goroutines(&[])?;
        let goroutine = goroutines
            .iter()
            .find(|g| g.id == goid)
            .ok_or(Error::GoroutineNotFound(goid))?;

        if let Some(tid) = goroutine.thread {
            return self.backtrace_extended(tid, None);
        }

        // seed the unwinder with the state saved by the scheduler
        let pid = self.expl_context.pid_on_focus();
        let mut registers =
            DwarfRegisterMap::from(RegisterMap::current(pid).map_err(Error::Ptrace)?);
        registers.update(
            Register::Rsp.dwarf_register().expect("infallible"),
            goroutine.sp.into(),
        );
        registers.update(register::DWARF_IP, goroutine.pc.into());

        let location = Location {
            pc: goroutine.pc,
            global_pc: goroutine.pc.into_global(&self.debugee)?,
            pid,
        };
        let unwinder = debugee::dwarf::DwarfUnwinder::new(&self.debugee);
        let bt = unwinder.unwind_from(location, registers)?;

        Ok(bt.iter().flat_map(|frame| self.explode_frame(frame)).collect())
    }

    pub fn frame_info(&self) -> Result<FrameInfo, Error> {
        disable_when_not_started!(self);
        self.debugee.frame_info(&self.expl_context)
    }

    pub fn thread_state(&self) -> Result<Vec<ThreadSnapshot>, Error> {
        disable_when_not_started!(self);
        self.debugee.thread_state(&self.expl_context)
    }

    pub fn backtrace(&self, pid: Pid) -> Result<Backtrace, Error> {
        disable_when_not_started!(self);
        self.debugee.unwind(pid)
    }

    /// Read tracee memory.
    pub fn read_memory(&self, addr: usize, len: usize) -> Result<Vec<u8>, Error> {
        disable_when_not_started!(self);
        read_memory_by_pid(self.expl_context.pid_on_focus(), addr, len)
    }

    /// Write tracee memory.
    pub fn write_memory(&self, addr: usize, value: usize) -> Result<(), Error> {
        disable_when_not_started!(self);
        write_memory_by_pid(
            self.expl_context.pid_on_focus(),
            addr,
            &value.to_ne_bytes(),
        )
    }

    /// Registers of the thread in focus (virtually unwound for non zero frames).
    pub fn current_registers(&self) -> Result<RegisterMap, Error> {
        disable_when_not_started!(self);
        let pid = self.expl_context.pid_on_focus();
        let mut map = RegisterMap::current(pid).map_err(Error::Ptrace)?;
        if self.expl_context.frame_num() > 0 {
            let mut dwarf_map = DwarfRegisterMap::from(map);
            self.debugee
                .restore_registers_at_frame(pid, &mut dwarf_map, self.expl_context.frame_num())?;
            for reg in [
                Register::Rax,
                Register::Rbx,
                Register::Rcx,
                Register::Rdx,
                Register::Rdi,
                Register::Rsi,
                Register::Rbp,
                Register::Rsp,
            ] {
                if let Some(dwarf_reg) = reg.dwarf_register() {
                    if let Ok(value) = dwarf_map.value(dwarf_reg) {
                        map.update(reg, value);
                    }
                }
            }
        }
        Ok(map)
    }

    pub fn set_register(&self, name: &str, value: u64) -> Result<(), Error> {
        disable_when_not_started!(self);
        register::set_register_value(self.expl_context.pid_on_focus(), name, value)
    }

    /// Disassemble the function in focus.
    pub fn disasm(&self) -> Result<debugee::disasm::FunctionAssembly, Error> {
        disable_when_not_started!(self);
        let breakpoints = self.breakpoints.active_breakpoints();
        self.debugee.disasm(&self.expl_context, &breakpoints)
    }

    /// Disassemble an arbitrary memory range.
    pub fn disasm_range(
        &self,
        from: usize,
        len: usize,
    ) -> Result<Vec<debugee::disasm::Instruction>, Error> {
        disable_when_not_started!(self);
        let breakpoints = self.breakpoints.active_breakpoints();
        self.debugee
            .disasm_memory(RelocatedAddress::from(from), len, &breakpoints)
    }

    // ---------------------------------- expressions ----------------------------------------------

    /// Evaluate an expression in the scope in focus.
    ///
    /// # Arguments
    ///
    /// * `source`: expression text
    /// * `allow_calls`: permit function call injection for call forms
    pub fn evaluate_expression(
        &mut self,
        source: &str,
        allow_calls: bool,
    ) -> Result<Vec<QueryResult>, Error> {
        disable_when_not_started!(self);
        let dqe = variable::parse::parse_expression(source)?;

        if dqe.has_call() {
            if !allow_calls {
                return Err(call::CallError::UnsafeNotEnabled.into());
            }
            if let Dqe::Call(fn_name, args) = &dqe {
                let literals = args
                    .iter()
                    .map(|arg| match arg {
                        Dqe::Literal(lit) => Ok(lit.clone()),
                        _ => Err(Error::Unsupported(
                            "only literal arguments are supported in injected calls",
                        )),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let param_count = self.fn_param_count(fn_name)?;
                if param_count != literals.len() {
                    return Err(call::CallError::InvalidArgumentCount(
                        param_count,
                        literals.len(),
                    )
                    .into());
                }
                let result = self.call(fn_name, &literals)?;
                return Ok(vec![QueryResult {
                    value: Value::from_scalar(variable::SupportedScalar::Uint(result.ret_value)),
                    name: Some(fn_name.clone()),
                    scope: None,
                }]);
            }
            return Err(Error::Unsupported(
                "call forms inside complex expressions are not supported",
            ));
        }

        let executor = DqeExecutor::new(self);
        executor.query(&dqe)
    }

    /// Read a variable (or a more complex expression over variables).
    pub fn read_variable(&self, dqe: Dqe) -> Result<Vec<QueryResult>, Error> {
        disable_when_not_started!(self);
        let executor = DqeExecutor::new(self);
        executor.query(&dqe)
    }

    /// Read all local variables of the frame in focus.
    pub fn read_local_variables(&self) -> Result<Vec<QueryResult>, Error> {
        disable_when_not_started!(self);
        let executor = DqeExecutor::new(self);
        executor.query_locals()
    }

    /// Read all arguments of the function in focus.
    pub fn read_arguments(&self) -> Result<Vec<QueryResult>, Error> {
        disable_when_not_started!(self);
        let executor = DqeExecutor::new(self);
        executor.query_args()
    }

    /// Read package level variables, optionally filtered by a regex.
    pub fn read_package_variables(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<QueryResult>, Error> {
        disable_when_not_started!(self);
        let regex = filter.map(Regex::new).transpose()?;
        let vars = variable::select::resolve_package_vars(&self.debugee, regex.as_ref())?;
        let executor = DqeExecutor::new(self);
        let mut result = vec![];
        for var in vars {
            if let Some(name) = var.name() {
                let mut values =
                    executor.query(&Dqe::Variable(Selector::by_name(name, false)))?;
                result.append(&mut values);
            }
        }
        Ok(result)
    }

    /// Assign a new value to an lvalue expression.
    /// Assignable targets: addressable scalars, pointers, string and slice headers.
    pub fn set_variable(&mut self, lvalue: &str, rvalue: &str) -> Result<(), Error> {
        disable_when_not_started!(self);
        let target_dqe = variable::parse::parse_expression(lvalue)?;
        let value_dqe = variable::parse::parse_expression(rvalue)?;

        let executor = DqeExecutor::new(self);
        let (address, size, kind) = executor.resolve_assign_target(&target_dqe)?;

        match kind {
            GoKind::String | GoKind::Slice => {
                // header to header copy
                let mut source = executor.query(&value_dqe)?;
                let source = source.pop().ok_or(Error::WatchSubjectNotFound)?;
                let src_addr = source
                    .value
                    .address
                    .ok_or(Error::Unassignable("source value is not addressable"))?;
                let header =
                    read_memory_by_pid(self.expl_context.pid_on_focus(), src_addr, size)?;
                write_memory_by_pid(self.expl_context.pid_on_focus(), address, &header)
            }
            _ => {
                let mut source = executor.query(&value_dqe)?;
                let source = source.pop().ok_or(Error::WatchSubjectNotFound)?;
                let bytes = encode_scalar_for_write(&source.value, size)?;
                write_memory_by_pid(self.expl_context.pid_on_focus(), address, &bytes)
            }
        }
    }

    // ---------------------------------- goroutines -----------------------------------------------

    /// Goroutine currently executing on the thread in focus.
    pub fn current_goroutine_id(&self) -> Option<u64> {
        if self.focused_goroutine.is_some() {
            return self.focused_goroutine;
        }
        let reader = GoroutineReader::new(&self.debugee).ok()?;
        reader.current_goid(self.expl_context.pid_on_focus())
    }

    /// Goroutine currently executing on a given thread.
    pub fn goroutine_of_thread(&self, pid: Pid) -> Option<u64> {
        let reader = GoroutineReader::new(&self.debugee).ok()?;
        reader.current_goid(pid)
    }

    /// Snapshot of all goroutines, filtered.
    pub fn goroutines(&self, filters: &[GoroutineFilter]) -> Result<Vec<Goroutine>, Error> {
        disable_when_not_started!(self);
        let reader = GoroutineReader::new(&self.debugee)?;
        let all = reader.read_all(&self.expl_context)?;
        Ok(all
            .into_iter()
            .filter(|g| filters.iter().all(|f| f.matches(g)))
            .collect())
    }

    /// Count goroutines per group key.
    pub fn goroutines_grouped(
        &self,
        filters: &[GoroutineFilter],
        key: GroupBy,
    ) -> Result<std::collections::HashMap<String, usize>, Error> {
        let goroutines = self.goroutines(filters)?;
        Ok(goroutine::group_count(&goroutines, key))
    }

    /// Switch focus into a goroutine. A running goroutine moves the thread focus,
    /// a parked one becomes the target of stack and variable inspection.
    pub fn switch_goroutine(&mut self, goid: u64) -> Result<(), Error> {
        disable_when_not_started!(self);
        let goroutines = self.goroutines(&[])?;
        let goroutine = goroutines
            .into_iter()
            .find(|g| g.id == goid)
            .ok_or(Error::GoroutineNotFound(goid))?;

        match goroutine.thread {
            Some(tid) => {
                self.set_thread_focus(tid)?;
                self.focused_goroutine = None;
            }
            None => {
                let pid = self.expl_context.pid_on_focus();
                let location = Location {
                    pc: goroutine.pc,
                    global_pc: goroutine.pc.into_global(&self.debugee)?,
                    pid,
                };
                self.expl_context = ExplorationContext::new(location, 0);
                self.focused_goroutine = Some(goid);
            }
        }
        Ok(())
    }

    /// Ancestor chain of a goroutine, nearest first.
    pub fn goroutine_ancestors(&self, goid: u64, depth: usize) -> Result<Vec<Goroutine>, Error> {
        let goroutines = self.goroutines(&[])?;
        Ok(goroutine::ancestors(&goroutines, goid, depth))
    }

    // ---------------------------------- symbols --------------------------------------------------

    /// All known source files, optionally filtered by a regex.
    pub fn known_files(&self, filter: Option<&str>) -> Result<Vec<PathBuf>, Error> {
        let regex = filter.map(Regex::new).transpose()?;
        let mut files = vec![];
        for debug_info in self.debugee.debug_info_all() {
            if !debug_info.has_debug_info() {
                continue;
            }
            for file in debug_info.known_files()? {
                if let Some(ref regex) = regex {
                    if regex.find(&file.to_string_lossy()).is_none() {
                        continue;
                    }
                }
                files.push(file.clone());
            }
        }
        files.sort_unstable();
        files.dedup();
        Ok(files)
    }

    /// All known functions matching a regex.
    pub fn known_functions(&self, filter: Option<&str>) -> Result<Vec<String>, Error> {
        let regex = Regex::new(filter.unwrap_or(""))?;
        let mut functions = vec![];
        for debug_info in self.debugee.debug_info_all() {
            if !debug_info.has_debug_info() {
                continue;
            }
            functions.extend(debug_info.search_functions_by_regex(&regex)?);
        }
        functions.sort_unstable();
        functions.dedup();
        Ok(functions)
    }

    /// All known type names matching a regex.
    pub fn known_types(&self, filter: Option<&str>) -> Result<Vec<String>, Error> {
        let regex = Regex::new(filter.unwrap_or(""))?;
        let mut types = vec![];
        for debug_info in self.debugee.debug_info_all() {
            if !debug_info.has_debug_info() {
                continue;
            }
            types.extend(debug_info.search_types_by_regex(&regex)?);
        }
        types.sort_unstable();
        types.dedup();
        Ok(types)
    }

    /// ELF symbols matching a regex.
    pub fn find_symbols(&self, regex: &str) -> Result<Vec<debugee::dwarf::Symbol>, Error> {
        let regex = Regex::new(regex)?;
        let mut symbols = vec![];
        for debug_info in self.debugee.debug_info_all() {
            symbols.extend(debug_info.find_symbols(&regex).into_iter().cloned());
        }
        Ok(symbols)
    }

    /// Loaded shared objects.
    pub fn shared_libs(&self) -> Vec<debugee::RegionInfo> {
        self.debugee.dump_mapped_regions()
    }

    /// Guess path substitution rules from observed source paths and client hints.
    pub fn guess_substitute_path(
        &mut self,
        hints: &[(String, PathBuf)],
    ) -> Result<Vec<debugee::registry::SubstitutionRule>, Error> {
        let observations: Vec<PathBuf> = {
            let debug_info = self.debugee.program_debug_info()?;
            debug_info.known_files()?.cloned().collect()
        };
        let rules = debugee::registry::guess_substitution_rules(&observations, hints);
        for rule in &rules {
            self.debugee
                .dwarf_registry_mut()
                .add_substitution_rule(rule.clone());
        }
        Ok(rules)
    }
}

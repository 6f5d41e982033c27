//! Model of the Go runtime scheduler: discovery of goroutines, their state and
//! the mapping between OS threads and the goroutines they execute.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::r#type::TypeParser;
use crate::debugger::debugee::dwarf::{ContextualDieRef, DebugInformation};
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use crate::debugger::read_memory_by_pid;
use crate::debugger::ExplorationContext;
use crate::weak_error;
use log::warn;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Status of a goroutine as the runtime scheduler tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoroutineStatus {
    Idle,
    Runnable,
    Running,
    Syscall,
    Waiting,
    Dead,
    Copystack,
    Preempted,
    Unknown(u64),
}

impl GoroutineStatus {
    /// Status from the `atomicstatus` field value, the scan bit is stripped.
    fn from_atomic(value: u64) -> Self {
        const G_SCAN: u64 = 0x1000;
        match value & !G_SCAN {
            0 => GoroutineStatus::Idle,
            1 => GoroutineStatus::Runnable,
            2 => GoroutineStatus::Running,
            3 => GoroutineStatus::Syscall,
            4 => GoroutineStatus::Waiting,
            6 => GoroutineStatus::Dead,
            8 => GoroutineStatus::Copystack,
            9 => GoroutineStatus::Preempted,
            v => GoroutineStatus::Unknown(v),
        }
    }

    pub fn render(&self) -> String {
        match self {
            GoroutineStatus::Idle => "idle".to_string(),
            GoroutineStatus::Runnable => "runnable".to_string(),
            GoroutineStatus::Running => "running".to_string(),
            GoroutineStatus::Syscall => "syscall".to_string(),
            GoroutineStatus::Waiting => "waiting".to_string(),
            GoroutineStatus::Dead => "dead".to_string(),
            GoroutineStatus::Copystack => "copystack".to_string(),
            GoroutineStatus::Preempted => "preempted".to_string(),
            GoroutineStatus::Unknown(v) => format!("unknown({v})"),
        }
    }
}

/// Wait reasons of a parked goroutine, a subset of `runtime.waitReason`.
/// Values outside the table are rendered numerically.
fn render_wait_reason(value: u64) -> String {
    const TABLE: &[&str] = &[
        "",
        "GC assist marking",
        "IO wait",
        "chan receive (nil chan)",
        "chan send (nil chan)",
        "dumping heap",
        "garbage collection",
        "garbage collection scan",
        "panicwait",
        "select",
        "select (no cases)",
        "GC assist wait",
        "GC sweep wait",
        "GC scavenge wait",
        "chan receive",
        "chan send",
        "finalizer wait",
        "force gc (idle)",
        "semacquire",
        "sleep",
        "sync.Cond.Wait",
        "sync.Mutex.Lock",
        "sync.RWMutex.RLock",
        "sync.RWMutex.Lock",
        "trace reader (blocked)",
        "wait for GC cycle",
        "GC worker (idle)",
        "preempted",
        "debug call",
    ];
    TABLE
        .get(value as usize)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("waitreason({value})"))
}

/// Snapshot of a single goroutine.
#[derive(Debug, Clone)]
pub struct Goroutine {
    /// Stable goroutine id assigned by the runtime.
    pub id: u64,
    pub status: GoroutineStatus,
    /// Human readable wait reason, empty for non waiting goroutines.
    pub wait_reason: Option<String>,
    /// Current program counter: live for running goroutines, saved otherwise.
    pub pc: RelocatedAddress,
    /// Current stack pointer.
    pub sp: RelocatedAddress,
    /// Name of the goroutine start function.
    pub start_fn: Option<String>,
    /// Goid of the creator goroutine.
    pub parent_id: Option<u64>,
    /// Address of the `runtime.g` descriptor.
    pub g_addr: RelocatedAddress,
    /// OS thread currently executing this goroutine.
    pub thread: Option<Pid>,
}

impl Goroutine {
    /// True if a goroutine runs user code (its start function is outside the runtime).
    pub fn is_user(&self) -> bool {
        self.start_fn
            .as_deref()
            .map(|f| !f.starts_with("runtime."))
            .unwrap_or(false)
    }

    pub fn is_parked(&self) -> bool {
        matches!(
            self.status,
            GoroutineStatus::Waiting | GoroutineStatus::Syscall | GoroutineStatus::Preempted
        )
    }
}

/// Boolean predicate over goroutine fields.
#[derive(Debug, Clone, PartialEq)]
pub enum GoroutineFilter {
    Running,
    Parked,
    Waiting,
    UserOnly,
    RuntimeOnly,
    WaitReason(String),
    StartFunc(String),
}

impl GoroutineFilter {
    pub fn matches(&self, g: &Goroutine) -> bool {
        match self {
            GoroutineFilter::Running => g.status == GoroutineStatus::Running,
            GoroutineFilter::Parked => g.is_parked(),
            GoroutineFilter::Waiting => g.status == GoroutineStatus::Waiting,
            GoroutineFilter::UserOnly => g.is_user(),
            GoroutineFilter::RuntimeOnly => !g.is_user(),
            GoroutineFilter::WaitReason(reason) => {
                g.wait_reason.as_deref() == Some(reason.as_str())
            }
            GoroutineFilter::StartFunc(name) => g
                .start_fn
                .as_deref()
                .map(|f| f.contains(name.as_str()))
                .unwrap_or(false),
        }
    }
}

/// Grouping key for goroutine aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Status,
    WaitReason,
    StartFunc,
}

/// Count goroutines per group key without materializing full records.
pub fn group_count(goroutines: &[Goroutine], key: GroupBy) -> HashMap<String, usize> {
    let mut groups = HashMap::new();
    for g in goroutines {
        let group = match key {
            GroupBy::Status => g.status.render(),
            GroupBy::WaitReason => g.wait_reason.clone().unwrap_or_default(),
            GroupBy::StartFunc => g.start_fn.clone().unwrap_or_default(),
        };
        *groups.entry(group).or_default() += 1;
    }
    groups
}

/// Byte offsets of interesting fields inside runtime structures,
/// resolved from dwarf type descriptions, never hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOffsets {
    goid: u64,
    atomicstatus: u64,
    wait_reason: Option<u64>,
    startpc: u64,
    parent_goid: Option<u64>,
    sched: u64,
    gobuf_sp: u64,
    gobuf_pc: u64,
    /// Offset of the current g pointer from the thread TLS base.
    pub tls_g_offset: i64,
}

impl RuntimeOffsets {
    /// Resolve offsets from the `runtime.g` and `runtime.gobuf` type descriptions.
    pub fn resolve(debug_info: &DebugInformation) -> Result<RuntimeOffsets, Error> {
        let member_offset = |type_name: &'static str, member: &str| -> Result<u64, Error> {
            let type_ref = debug_info
                .find_type_die_ref(type_name)
                .ok_or(Error::NoGoRuntime(type_name))?;
            let parser = TypeParser::new();
            let complex = parser.parse_in(debug_info, debug_info.unit_ensure(0), type_ref);
            complex
                .member(complex.root(), member)
                .and_then(|m| m.offset)
                .ok_or(Error::NoGoRuntime(type_name))
        };

        Ok(RuntimeOffsets {
            goid: member_offset("runtime.g", "goid")?,
            atomicstatus: member_offset("runtime.g", "atomicstatus")?,
            wait_reason: member_offset("runtime.g", "waitreason").ok(),
            startpc: member_offset("runtime.g", "startpc")?,
            parent_goid: member_offset("runtime.g", "parentGoid")
                .or_else(|_| member_offset("runtime.g", "parentGoID"))
                .ok(),
            sched: member_offset("runtime.g", "sched")?,
            gobuf_sp: member_offset("runtime.gobuf", "sp")?,
            gobuf_pc: member_offset("runtime.gobuf", "pc")?,
            tls_g_offset: tls_g_offset(debug_info),
        })
    }
}

/// Offset of the `g` pointer slot relative to the thread TLS base.
/// Taken from the `runtime.tls_g` symbol when the runtime exports it,
/// the well known amd64 slot used otherwise.
fn tls_g_offset(debug_info: &DebugInformation) -> i64 {
    const DEFAULT_AMD64_TLS_G: i64 = -8;
    debug_info
        .find_symbol("runtime.tls_g")
        .map(|sym| sym.addr as i64)
        .unwrap_or(DEFAULT_AMD64_TLS_G)
}

fn read_u64(pid: Pid, addr: usize) -> Result<u64, Error> {
    let data = read_memory_by_pid(pid, addr, 8)?;
    Ok(u64::from_ne_bytes(
        data.try_into()
            .map_err(|d: Vec<u8>| Error::TypeBinaryRepr("u64", d.into_boxed_slice()))?,
    ))
}

/// Reader of the goroutine table maintained by the runtime.
pub struct GoroutineReader<'a> {
    debugee: &'a Debugee,
    offsets: RuntimeOffsets,
}

impl<'a> GoroutineReader<'a> {
    pub fn new(debugee: &'a Debugee) -> Result<Self, Error> {
        let debug_info = debugee.program_debug_info()?;
        let offsets = RuntimeOffsets::resolve(debug_info)?;
        Ok(Self { debugee, offsets })
    }

    /// Return the goroutine currently executing on a thread, `None` if the thread
    /// runs no goroutine (a pure runtime thread).
    ///
    /// Meaningful only while the tracee is halted.
    pub fn current_g_addr(&self, pid: Pid) -> Option<RelocatedAddress> {
        let tracee = self.debugee.tracee_ctl().tracee(pid)?;
        let tls_base = weak_error!(tracee.tls_base())?;
        let slot = tls_base.as_usize().checked_add_signed(self.offsets.tls_g_offset as isize)?;
        let g_addr = weak_error!(read_u64(pid, slot))?;
        if g_addr == 0 {
            return None;
        }
        Some(RelocatedAddress::from(g_addr as usize))
    }

    /// Return the id of the goroutine currently executing on a thread.
    pub fn current_goid(&self, pid: Pid) -> Option<u64> {
        let g_addr = self.current_g_addr(pid)?;
        let goid =
            weak_error!(read_u64(pid, g_addr.as_usize() + self.offsets.goid as usize))?;
        (goid != 0).then_some(goid)
    }

    /// Read the whole goroutine table (`runtime.allgs`).
    ///
    /// # Arguments
    ///
    /// * `ctx`: exploration context used for resolving the table location
    pub fn read_all(&self, ctx: &ExplorationContext) -> Result<Vec<Goroutine>, Error> {
        let debug_info = self.debugee.program_debug_info()?;
        let allgs_addr = self
            .static_var_addr(debug_info, ctx, "runtime.allgs")
            .ok_or(Error::NoGoRuntime("runtime.allgs"))?;
        let pid = ctx.pid_on_focus();

        // allgs is a slice, the header is (data ptr, len, cap)
        let data_ptr = read_u64(pid, allgs_addr.as_usize())? as usize;
        let len = read_u64(pid, allgs_addr.as_usize() + 8)? as usize;

        // current g of every thread, for thread to goroutine mapping
        let mut thread_of_g: HashMap<usize, Pid> = HashMap::new();
        for tracee in self.debugee.tracee_ctl().snapshot() {
            if let Some(g_addr) = self.current_g_addr(tracee.pid) {
                thread_of_g.insert(g_addr.as_usize(), tracee.pid);
            }
        }

        let mut result = Vec::with_capacity(len);
        for i in 0..len {
            let g_ptr = match read_u64(pid, data_ptr + i * 8) {
                Ok(ptr) if ptr != 0 => ptr as usize,
                _ => continue,
            };

            match self.read_goroutine(g_ptr, &thread_of_g) {
                Ok(Some(g)) => result.push(g),
                Ok(None) => {}
                Err(e) => warn!(target: "debugger", "skip goroutine at {g_ptr:#x}: {e:#}"),
            }
        }

        Ok(result)
    }

    fn read_goroutine(
        &self,
        g_addr: usize,
        thread_of_g: &HashMap<usize, Pid>,
    ) -> Result<Option<Goroutine>, Error> {
        let pid = self.debugee.tracee_ctl().proc_pid();
        let offs = &self.offsets;

        let goid = read_u64(pid, g_addr + offs.goid as usize)?;
        if goid == 0 {
            // slot of a dead or not yet initialized goroutine
            return Ok(None);
        }

        let atomicstatus_raw =
            read_memory_by_pid(pid, g_addr + offs.atomicstatus as usize, 4)?;
        let status = GoroutineStatus::from_atomic(u32::from_ne_bytes(
            atomicstatus_raw
                .try_into()
                .map_err(|d: Vec<u8>| Error::TypeBinaryRepr("u32", d.into_boxed_slice()))?,
        ) as u64);

        if status == GoroutineStatus::Dead {
            return Ok(None);
        }

        let wait_reason = match offs.wait_reason {
            Some(off) if status == GoroutineStatus::Waiting => {
                let raw = read_memory_by_pid(pid, g_addr + off as usize, 1)?;
                Some(render_wait_reason(raw[0] as u64))
            }
            _ => None,
        };

        let startpc = read_u64(pid, g_addr + offs.startpc as usize)?;
        let parent_id = offs
            .parent_goid
            .and_then(|off| read_u64(pid, g_addr + off as usize).ok())
            .filter(|&id| id != 0);

        let sched = g_addr + offs.sched as usize;
        let mut sp = read_u64(pid, sched + offs.gobuf_sp as usize)?;
        let mut pc = read_u64(pid, sched + offs.gobuf_pc as usize)?;

        let thread = thread_of_g.get(&g_addr).copied();
        if let Some(tid) = thread {
            // for a goroutine on a thread the live registers are the truth
            if let Some(tracee) = self.debugee.tracee_ctl().tracee(tid) {
                if let Some(live_pc) = weak_error!(tracee.pc()) {
                    pc = live_pc.into();
                    let regs = crate::debugger::register::RegisterMap::current(tid)
                        .map_err(Error::Ptrace)?;
                    sp = regs.value(crate::debugger::register::Register::Rsp);
                }
            }
        }

        let start_fn = self.fn_name_by_pc(startpc);

        Ok(Some(Goroutine {
            id: goid,
            status,
            wait_reason,
            pc: RelocatedAddress::from(pc as usize),
            sp: RelocatedAddress::from(sp as usize),
            start_fn,
            parent_id,
            g_addr: RelocatedAddress::from(g_addr),
            thread,
        }))
    }

    fn fn_name_by_pc(&self, pc: u64) -> Option<String> {
        let pc = RelocatedAddress::from(pc as usize);
        let debug_info = self.debugee.debug_info(pc).ok()?;
        let global = pc.into_global(self.debugee).ok()?;
        debug_info
            .find_function_by_pc(global)
            .ok()
            .flatten()
            .and_then(|f| f.full_name())
    }

    /// Resolve the static address of a package level runtime variable.
    fn static_var_addr(
        &self,
        debug_info: &DebugInformation,
        ctx: &ExplorationContext,
        name: &str,
    ) -> Option<RelocatedAddress> {
        let vars = debug_info.find_variables(ctx.location(), name).ok()?;
        let var: ContextualDieRef<'_, _> = vars.into_iter().next()?;
        var.address(ctx, self.debugee)
    }
}

/// Collect ancestor chain of a goroutine, nearest ancestor first.
///
/// # Arguments
///
/// * `snapshot`: all known goroutines
/// * `id`: goroutine which ancestors are requested
/// * `depth`: max chain length
pub fn ancestors(snapshot: &[Goroutine], id: u64, depth: usize) -> Vec<Goroutine> {
    let mut result = vec![];
    let by_id: HashMap<u64, &Goroutine> = snapshot.iter().map(|g| (g.id, g)).collect();

    let mut current = by_id.get(&id).and_then(|g| g.parent_id);
    while let Some(parent_id) = current {
        if result.len() >= depth {
            break;
        }
        let Some(parent) = by_id.get(&parent_id) else {
            break;
        };
        result.push((*parent).clone());
        current = parent.parent_id;
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;

    fn goroutine(id: u64, parent: Option<u64>, status: GoroutineStatus) -> Goroutine {
        Goroutine {
            id,
            status,
            wait_reason: None,
            pc: RelocatedAddress::from(0_usize),
            sp: RelocatedAddress::from(0_usize),
            start_fn: Some(format!("main.fn{id}")),
            parent_id: parent,
            g_addr: RelocatedAddress::from(id as usize * 0x100),
            thread: None,
        }
    }

    #[test]
    fn test_status_from_atomic() {
        assert_eq!(GoroutineStatus::from_atomic(2), GoroutineStatus::Running);
        assert_eq!(GoroutineStatus::from_atomic(4), GoroutineStatus::Waiting);
        // scan bit must be stripped
        assert_eq!(
            GoroutineStatus::from_atomic(0x1000 | 4),
            GoroutineStatus::Waiting
        );
        assert_eq!(GoroutineStatus::from_atomic(77), GoroutineStatus::Unknown(77));
    }

    #[test]
    fn test_filters() {
        let running = goroutine(1, None, GoroutineStatus::Running);
        let waiting = goroutine(2, Some(1), GoroutineStatus::Waiting);

        assert!(GoroutineFilter::Running.matches(&running));
        assert!(!GoroutineFilter::Running.matches(&waiting));
        assert!(GoroutineFilter::Parked.matches(&waiting));
        assert!(GoroutineFilter::UserOnly.matches(&running));
        assert!(GoroutineFilter::StartFunc("fn2".to_string()).matches(&waiting));
    }

    #[test]
    fn test_ancestors() {
        let snapshot = vec![
            goroutine(1, None, GoroutineStatus::Running),
            goroutine(2, Some(1), GoroutineStatus::Waiting),
            goroutine(3, Some(2), GoroutineStatus::Running),
        ];

        let chain = ancestors(&snapshot, 3, 10);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, 2);
        assert_eq!(chain[1].id, 1);

        let chain = ancestors(&snapshot, 3, 1);
        assert_eq!(chain.len(), 1);

        let chain = ancestors(&snapshot, 1, 10);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_group_count() {
        let snapshot = vec![
            goroutine(1, None, GoroutineStatus::Running),
            goroutine(2, None, GoroutineStatus::Waiting),
            goroutine(3, None, GoroutineStatus::Waiting),
        ];
        let groups = group_count(&snapshot, GroupBy::Status);
        assert_eq!(groups.get("running"), Some(&1));
        assert_eq!(groups.get("waiting"), Some(&2));
    }
}

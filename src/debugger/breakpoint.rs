use crate::debugger::address::RelocatedAddress;
use crate::debugger::code::INT3;
use crate::debugger::debugee::dwarf::unit::PlaceDescriptorOwned;
use crate::debugger::error::Error;
use crate::debugger::variable::dqe::Dqe;
use indexmap::IndexMap;
use nix::libc::c_void;
use nix::sys;
use nix::unistd::Pid;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Condition on the accumulated hit count of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    /// Stop only when hit count equals N.
    Equal(u64),
    /// Stop only when hit count is greater or equal N.
    GreaterOrEqual(u64),
    /// Stop every N-th hit.
    Multiple(u64),
}

impl HitCondition {
    /// Parse a hit condition from strings like "== 3", ">= 10", "% 2".
    pub fn parse(s: &str) -> Option<HitCondition> {
        let s = s.trim();
        let (op, num) = s.split_at(s.find(|c: char| c.is_ascii_digit() || c == ' ')?);
        let num: u64 = num.trim().parse().ok()?;
        match op.trim() {
            "==" | "" => Some(HitCondition::Equal(num)),
            ">=" => Some(HitCondition::GreaterOrEqual(num)),
            "%" => Some(HitCondition::Multiple(num)),
            _ => None,
        }
    }

    /// True if the condition is satisfied with a given hit count.
    pub fn matched(&self, hit_count: u64) -> bool {
        match self {
            HitCondition::Equal(n) => hit_count == *n,
            HitCondition::GreaterOrEqual(n) => hit_count >= *n,
            HitCondition::Multiple(n) => *n != 0 && hit_count % n == 0,
        }
    }
}

/// Breakpoint flavor.
#[derive(Debug, Clone, PartialEq)]
pub enum BrkptType {
    /// Breakpoint at debugee entry point, installed before the program start.
    EntryPoint,
    /// User defined breakpoint.
    UserDefined,
    /// Temporary breakpoint, used by stepping algorithms, bound to a single thread.
    Temporary,
    /// Internal breakpoint at end of a watchpoint scope.
    WatchpointCompanion,
    /// Internal breakpoint at a return address of an injected call.
    CallReturn,
}

static GLOBAL_BREAKPOINT_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Software breakpoint, implemented by writing the trap instruction
/// at the target address with preserving an original byte.
pub struct Breakpoint {
    /// Breakpoint number, positive, assigned monotonically.
    pub number: u32,
    pub addr: RelocatedAddress,
    /// Thread used for memory patching.
    pub pid: Pid,
    /// User label, optional.
    pub name: Option<String>,
    /// Source place of the breakpoint, if known.
    pub place: Option<PlaceDescriptorOwned>,
    /// Logical breakpoint number. Breakpoints created for several physical addresses
    /// of one inlined function share a logical number.
    pub logical_number: u32,
    /// Condition that must be true for a stop to be reported.
    pub condition: Option<Dqe>,
    /// Condition on the accumulated hit counter.
    pub hit_condition: Option<HitCondition>,
    /// Tracepoint flag: report a hit (with actions) and continue automatically.
    pub is_tracepoint: bool,
    /// Expressions printed at a tracepoint hit.
    pub tracepoint_actions: Vec<Dqe>,
    saved_data: Cell<u8>,
    enabled: Cell<bool>,
    user_enabled: Cell<bool>,
    hit_count: Cell<u64>,
    r#type: BrkptType,
}

impl Breakpoint {
    fn new_inner(addr: RelocatedAddress, pid: Pid, r#type: BrkptType) -> Self {
        let number = GLOBAL_BREAKPOINT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            number,
            addr,
            pid,
            name: None,
            place: None,
            logical_number: number,
            condition: None,
            hit_condition: None,
            is_tracepoint: false,
            tracepoint_actions: vec![],
            saved_data: Cell::default(),
            enabled: Cell::default(),
            user_enabled: Cell::new(true),
            hit_count: Cell::default(),
            r#type,
        }
    }

    pub fn new_user_defined(addr: RelocatedAddress, pid: Pid) -> Self {
        Self::new_inner(addr, pid, BrkptType::UserDefined)
    }

    pub fn new_entry_point(addr: RelocatedAddress, pid: Pid) -> Self {
        Self::new_inner(addr, pid, BrkptType::EntryPoint)
    }

    pub fn new_temporary(addr: RelocatedAddress, pid: Pid) -> Self {
        Self::new_inner(addr, pid, BrkptType::Temporary)
    }

    pub fn new_watchpoint_companion(addr: RelocatedAddress, pid: Pid) -> Self {
        Self::new_inner(addr, pid, BrkptType::WatchpointCompanion)
    }

    pub fn new_call_return(addr: RelocatedAddress, pid: Pid) -> Self {
        Self::new_inner(addr, pid, BrkptType::CallReturn)
    }

    pub fn with_place(mut self, place: Option<PlaceDescriptorOwned>) -> Self {
        self.place = place;
        self
    }

    /// Copy of the breakpoint acting through another thread.
    /// Used by the tracer for the step-over-breakpoint dance in foreign threads.
    pub fn clone_for_thread(&self, pid: Pid) -> Self {
        Self {
            number: self.number,
            addr: self.addr,
            pid,
            name: self.name.clone(),
            place: self.place.clone(),
            logical_number: self.logical_number,
            condition: self.condition.clone(),
            hit_condition: self.hit_condition,
            is_tracepoint: self.is_tracepoint,
            tracepoint_actions: self.tracepoint_actions.clone(),
            saved_data: self.saved_data.clone(),
            enabled: self.enabled.clone(),
            user_enabled: self.user_enabled.clone(),
            hit_count: self.hit_count.clone(),
            r#type: self.r#type.clone(),
        }
    }

    pub fn r#type(&self) -> &BrkptType {
        &self.r#type
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.r#type, BrkptType::Temporary)
    }

    pub fn is_entry_point(&self) -> bool {
        matches!(self.r#type, BrkptType::EntryPoint)
    }

    pub fn is_user_defined(&self) -> bool {
        matches!(self.r#type, BrkptType::UserDefined)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// User visible enable flag, a disabled breakpoint stays in the registry
    /// but its hits are not reported.
    pub fn is_user_enabled(&self) -> bool {
        self.user_enabled.get()
    }

    pub fn set_user_enabled(&self, enabled: bool) {
        self.user_enabled.set(enabled);
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.get()
    }

    pub fn register_hit(&self) -> u64 {
        let hits = self.hit_count.get() + 1;
        self.hit_count.set(hits);
        hits
    }

    /// Original byte saved under the trap instruction, `None` until first enable.
    pub fn saved_byte(&self) -> Option<u8> {
        self.enabled.get().then(|| self.saved_data.get())
    }

    /// Write the trap instruction at the breakpoint address.
    pub fn enable(&self) -> Result<(), Error> {
        let addr = usize::from(self.addr) as *mut c_void;
        let data = sys::ptrace::read(self.pid, addr).map_err(Error::Ptrace)?;
        self.saved_data.set((data & 0xff) as u8);
        let data_with_trap = (data as u64 & !0xff) | INT3 as u64;
        unsafe {
            sys::ptrace::write(self.pid, addr, data_with_trap as *mut c_void)
                .map_err(Error::Ptrace)?;
        }
        self.enabled.set(true);

        Ok(())
    }

    /// Restore the original byte at the breakpoint address.
    pub fn disable(&self) -> Result<(), Error> {
        let addr = usize::from(self.addr) as *mut c_void;
        let data = sys::ptrace::read(self.pid, addr).map_err(Error::Ptrace)? as u64;
        let restored: u64 = (data & !0xff) | self.saved_data.get() as u64;
        unsafe {
            sys::ptrace::write(self.pid, addr, restored as *mut c_void).map_err(Error::Ptrace)?;
        }
        self.enabled.set(false);

        Ok(())
    }

    /// Mark the breakpoint enabled and take the saved byte from another
    /// breakpoint already patched this address.
    fn enable_shared(&self, saved_byte: u8) {
        self.saved_data.set(saved_byte);
        self.enabled.set(true);
    }
}

/// Registry of breakpoints of a single debugee.
///
/// Several breakpoints (user and internal) may exist at one address, the address is
/// patched once and restored only when the last breakpoint at it is removed.
#[derive(Default)]
pub struct BreakpointRegistry {
    breakpoints: IndexMap<u32, Breakpoint>,
    /// Per address refcount of enabled breakpoints.
    patch_refcount: HashMap<RelocatedAddress, usize>,
    /// Per goroutine hit counters: (breakpoint number, goroutine id) -> hits.
    goroutine_hits: HashMap<(u32, u64), u64>,
}

impl BreakpointRegistry {
    /// Add a breakpoint into the registry and patch the tracee text.
    pub fn add_and_enable(&mut self, brkpt: Breakpoint) -> Result<u32, Error> {
        let number = brkpt.number;

        match self.enabled_at(brkpt.addr) {
            Some(existing) => {
                let saved = existing.saved_data.get();
                brkpt.enable_shared(saved);
            }
            None => {
                brkpt.enable()?;
            }
        }
        *self.patch_refcount.entry(brkpt.addr).or_default() += 1;

        self.breakpoints.insert(number, brkpt);
        Ok(number)
    }

    /// Add a breakpoint without patching (the debugee is not launched yet).
    pub fn add_deferred(&mut self, brkpt: Breakpoint) -> u32 {
        let number = brkpt.number;
        self.breakpoints.insert(number, brkpt);
        number
    }

    /// Patch text for all known breakpoints. Called once debugee is launched.
    pub fn enable_all(&mut self) -> Result<(), Error> {
        let mut refcount: HashMap<RelocatedAddress, usize> = HashMap::new();
        for brkpt in self.breakpoints.values() {
            if !brkpt.is_enabled() {
                if refcount.contains_key(&brkpt.addr) || self.patch_refcount.contains_key(&brkpt.addr)
                {
                    if let Some(existing) = self.enabled_at(brkpt.addr) {
                        brkpt.enable_shared(existing.saved_data.get());
                    }
                } else {
                    brkpt.enable()?;
                }
            }
            *refcount.entry(brkpt.addr).or_default() += 1;
        }
        self.patch_refcount = refcount;
        Ok(())
    }

    fn enabled_at(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.breakpoints
            .values()
            .find(|b| b.addr == addr && b.is_enabled())
    }

    /// Return an enabled breakpoint at the address, user breakpoints win over
    /// internal ones.
    pub fn get_enabled(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        let mut found: Option<&Breakpoint> = None;
        for b in self.breakpoints.values() {
            if b.addr == addr && b.is_enabled() {
                if b.is_user_defined() {
                    return Some(b);
                }
                if found.is_none() {
                    found = Some(b);
                }
            }
        }
        found
    }

    pub fn get(&self, number: u32) -> Option<&Breakpoint> {
        self.breakpoints.get(&number)
    }

    pub fn get_mut(&mut self, number: u32) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&number)
    }

    /// Remove a breakpoint by number, restore the original byte if it is the
    /// last one at its address.
    pub fn remove_by_number(&mut self, number: u32) -> Result<Option<Breakpoint>, Error> {
        let Some(brkpt) = self.breakpoints.shift_remove(&number) else {
            return Ok(None);
        };

        if brkpt.is_enabled() {
            let count = self.patch_refcount.entry(brkpt.addr).or_insert(1);
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.patch_refcount.remove(&brkpt.addr);
                brkpt.disable()?;
            }
        }

        self.goroutine_hits.retain(|(num, _), _| *num != number);
        Ok(Some(brkpt))
    }

    /// Remove all breakpoints at an address.
    pub fn remove_by_addr(&mut self, addr: RelocatedAddress) -> Result<Vec<Breakpoint>, Error> {
        let numbers: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|b| b.addr == addr)
            .map(|b| b.number)
            .collect();
        let mut removed = vec![];
        for number in numbers {
            if let Some(b) = self.remove_by_number(number)? {
                removed.push(b);
            }
        }
        Ok(removed)
    }

    /// Remove all breakpoints of a logical group.
    pub fn remove_logical(&mut self, logical_number: u32) -> Result<Vec<Breakpoint>, Error> {
        let numbers: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|b| b.logical_number == logical_number)
            .map(|b| b.number)
            .collect();
        let mut removed = vec![];
        for number in numbers {
            if let Some(b) = self.remove_by_number(number)? {
                removed.push(b);
            }
        }
        Ok(removed)
    }

    /// Currently known breakpoints with patched text.
    pub fn active_breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoints.values().filter(|b| b.is_enabled()).collect()
    }

    /// All user defined breakpoints.
    pub fn user_breakpoints(&self) -> Vec<&Breakpoint> {
        self.breakpoints
            .values()
            .filter(|b| b.is_user_defined())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    /// Register a hit of a breakpoint in context of a goroutine.
    /// Returns (total hits, goroutine hits).
    pub fn register_goroutine_hit(&mut self, number: u32, goroutine: Option<u64>) -> (u64, u64) {
        let total = self
            .breakpoints
            .get(&number)
            .map(|b| b.register_hit())
            .unwrap_or_default();
        let per_goroutine = match goroutine {
            Some(goid) => {
                let counter = self.goroutine_hits.entry((number, goid)).or_default();
                *counter += 1;
                *counter
            }
            None => 0,
        };
        (total, per_goroutine)
    }

    /// Return accumulated per goroutine hits of a breakpoint.
    pub fn goroutine_hits(&self, number: u32) -> HashMap<u64, u64> {
        self.goroutine_hits
            .iter()
            .filter(|((num, _), _)| *num == number)
            .map(|((_, goid), hits)| (*goid, *hits))
            .collect()
    }

    /// Disable all enabled breakpoints (before detach), registry stays as is.
    pub fn disable_all(&mut self) -> Result<(), Error> {
        let mut restored = std::collections::HashSet::new();
        for brkpt in self.breakpoints.values() {
            if brkpt.is_enabled() {
                if restored.insert(brkpt.addr) {
                    brkpt.disable()?;
                } else {
                    brkpt.enabled.set(false);
                }
            }
        }
        self.patch_refcount.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hit_condition_parse() {
        struct TestCase {
            string: &'static str,
            expect: Option<HitCondition>,
        }
        let test_cases = [
            TestCase {
                string: "== 3",
                expect: Some(HitCondition::Equal(3)),
            },
            TestCase {
                string: ">= 10",
                expect: Some(HitCondition::GreaterOrEqual(10)),
            },
            TestCase {
                string: "% 2",
                expect: Some(HitCondition::Multiple(2)),
            },
            TestCase {
                string: "7",
                expect: Some(HitCondition::Equal(7)),
            },
            TestCase {
                string: "!= 2",
                expect: None,
            },
        ];

        for tc in test_cases {
            assert_eq!(HitCondition::parse(tc.string), tc.expect, "{}", tc.string);
        }
    }

    #[test]
    fn test_hit_condition_match() {
        assert!(HitCondition::Equal(3).matched(3));
        assert!(!HitCondition::Equal(3).matched(4));
        assert!(HitCondition::GreaterOrEqual(3).matched(10));
        assert!(HitCondition::Multiple(2).matched(4));
        assert!(!HitCondition::Multiple(2).matched(5));
        assert!(!HitCondition::Multiple(0).matched(5));
    }
}

pub mod disasm;
pub mod dwarf;
pub mod registry;
pub mod tracee;
pub mod tracer;

pub use registry::RegionInfo;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::debugee::disasm::{AsmFlavor, Disassembler, FunctionAssembly, Instruction};
use crate::debugger::debugee::dwarf::unit::PlaceDescriptorOwned;
use crate::debugger::debugee::dwarf::unwind::{self, Backtrace};
use crate::debugger::debugee::dwarf::DebugInformation;
use crate::debugger::debugee::registry::DwarfRegistry;
use crate::debugger::debugee::tracee::{Tracee, TraceeCtl};
use crate::debugger::debugee::tracer::{StopReason, TraceContext, Tracer};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{FunctionNotFound, MappingOffsetNotFound, TraceeNotFound};
use crate::debugger::process::{Child, Installed};
use crate::debugger::register::DwarfRegisterMap;
use crate::debugger::ExplorationContext;
use crate::version::GoVersion;
use crate::{print_warns, weak_error};
use log::{info, warn};
use nix::unistd::Pid;
use object::{Object, ObjectSection};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Stack frame information.
#[derive(Debug, Default, Clone)]
pub struct FrameInfo {
    pub num: u32,
    pub frame: unwind::FrameSpan,
    /// Dwarf frame base address
    pub base_addr: RelocatedAddress,
    /// CFA is defined to be the value of the stack pointer at the call site in the previous frame
    /// (which may be different from its value on entry to the current frame).
    pub cfa: RelocatedAddress,
    pub return_addr: Option<RelocatedAddress>,
}

/// Debugee thread description.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    /// Running thread info - pid, number and status.
    pub thread: Tracee,
    /// Backtrace
    pub bt: Option<Backtrace>,
    /// Place in source code where thread is stopped
    pub place: Option<PlaceDescriptorOwned>,
    /// On focus frame number (if focus on this thread)
    pub focus_frame: Option<usize>,
    /// True if thread in focus, false elsewhere
    pub in_focus: bool,
}

/// Thread position.
/// Contains pid of thread, relocated and global address of instruction where thread stop.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub pid: Pid,
}

impl Location {
    pub fn new(pc: RelocatedAddress, global_pc: GlobalAddress, pid: Pid) -> Self {
        Self { pc, global_pc, pid }
    }
}

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ExecutionStatus {
    Unload,
    InProgress,
    Exited,
}

/// Debugee - represent static and runtime debugee information.
pub struct Debugee {
    /// debugee running-status.
    execution_status: ExecutionStatus,
    /// Debugee tracer. Control debugee process.
    tracer: Tracer,
    /// path to debugee file.
    path: PathBuf,
    /// elf file sections (name => address).
    object_sections: HashMap<String, u64>,
    /// Registry for dwarf information of program and shared libraries.
    dwarf_registry: DwarfRegistry,
    /// Disassembler component.
    disassembly: Disassembler,
    /// Directories to search for separate debug information files.
    debug_info_dirs: Vec<PathBuf>,
    /// Go toolchain version the debugee was built with, if detected.
    go_version: Option<GoVersion>,
}

impl Debugee {
    pub fn new_non_running(
        path: &Path,
        process: &Child<Installed>,
        object: &object::File,
        debug_info_dirs: &[PathBuf],
    ) -> Result<Self, Error> {
        let dwarf_builder = dwarf::DebugInformationBuilder::new(debug_info_dirs);
        let dwarf = dwarf_builder.build(path, object)?;
        let registry = DwarfRegistry::new(process.pid(), path.to_path_buf(), dwarf);

        Ok(Self {
            execution_status: ExecutionStatus::Unload,
            path: path.into(),
            object_sections: object
                .sections()
                .filter_map(|section| Some((section.name().ok()?.to_string(), section.address())))
                .collect(),
            tracer: Tracer::new(process.pid()),
            dwarf_registry: registry,
            disassembly: Disassembler::new(AsmFlavor::default())?,
            debug_info_dirs: debug_info_dirs.to_vec(),
            go_version: extract_go_version(object),
        })
    }

    pub fn new_from_external_process(
        path: &Path,
        process: &Child<Installed>,
        object: &object::File,
        debug_info_dirs: &[PathBuf],
    ) -> Result<Self, Error> {
        let dwarf_builder = dwarf::DebugInformationBuilder::new(debug_info_dirs);
        let dwarf = dwarf_builder.build(path, object)?;
        let mut registry = DwarfRegistry::new(process.pid(), path.to_path_buf(), dwarf);
        print_warns!(registry.update_mappings(true)?);

        let mut debugee = Self {
            execution_status: ExecutionStatus::InProgress,
            path: path.into(),
            object_sections: object
                .sections()
                .filter_map(|section| Some((section.name().ok()?.to_string(), section.address())))
                .collect(),
            tracer: Tracer::new_external(
                process.pid(),
                &process
                    .external_info()
                    .expect("process is not external")
                    .threads,
            ),
            dwarf_registry: registry,
            disassembly: Disassembler::new(AsmFlavor::default())?,
            debug_info_dirs: debug_info_dirs.to_vec(),
            go_version: extract_go_version(object),
        };

        debugee.load_shared_objects(true)?;
        Ok(debugee)
    }

    /// Create new [`Debugee`] with same dwarf context.
    ///
    /// # Arguments
    ///
    /// * `proc`: new process pid.
    pub fn extend(&self, proc: Pid) -> Self {
        Self {
            execution_status: ExecutionStatus::Unload,
            path: self.path.clone(),
            object_sections: self.object_sections.clone(),
            tracer: Tracer::new(proc),
            dwarf_registry: self.dwarf_registry.extend(proc),
            disassembly: Disassembler::new(AsmFlavor::default()).expect("infallible"),
            debug_info_dirs: self.debug_info_dirs.clone(),
            go_version: self.go_version,
        }
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.execution_status
    }

    /// Return true if debugging process in progress
    pub fn is_in_progress(&self) -> bool {
        self.execution_status == ExecutionStatus::InProgress
    }

    /// Return true if debugging process ends
    pub fn is_exited(&self) -> bool {
        self.execution_status == ExecutionStatus::Exited
    }

    /// Return path to the debugee executable.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Return detected Go toolchain version of the debugee.
    pub fn go_version(&self) -> Option<GoVersion> {
        self.go_version
    }

    /// Return directories searched for separate debug information files.
    pub fn debug_info_dirs(&self) -> &[PathBuf] {
        &self.debug_info_dirs
    }

    /// Replace the separate debug information search list.
    /// Takes effect for objects parsed after the call.
    pub fn set_debug_info_dirs(&mut self, dirs: Vec<PathBuf>) {
        self.debug_info_dirs = dirs;
    }

    /// Return debugee [`Tracer`]
    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }

    /// Move focus to another thread.
    pub fn set_tracee_to_focus(&mut self, tid: Pid) {
        self.tracer.tracee_ctl.set_tracee_to_focus(tid)
    }

    /// Return the thread currently in focus.
    pub fn tracee_in_focus(&self) -> &Tracee {
        self.tracer.tracee_ctl.tracee_in_focus()
    }

    /// Return a mutable registry reference (for substitution rules edit).
    pub fn dwarf_registry_mut(&mut self) -> &mut DwarfRegistry {
        &mut self.dwarf_registry
    }

    pub fn dwarf_registry(&self) -> &DwarfRegistry {
        &self.dwarf_registry
    }

    pub fn trace_until_stop(&mut self, ctx: TraceContext) -> Result<StopReason, Error> {
        let event = self.tracer.resume(ctx)?;
        match event {
            StopReason::DebugeeExit(_) => {
                self.execution_status = ExecutionStatus::Exited;
            }
            StopReason::DebugeeStart => {
                self.execution_status = ExecutionStatus::InProgress;
                print_warns!(self.dwarf_registry.update_mappings(true)?);
                // shared libraries are mapped by now, bring them into the registry
                weak_error!(self.load_shared_objects(false));
            }
            StopReason::NoSuchProcess(_) => {
                self.execution_status = ExecutionStatus::Exited;
            }
            _ => {}
        }

        Ok(event)
    }

    /// Load debug information of currently mapped shared objects into the registry.
    ///
    /// # Arguments
    ///
    /// * `quiet`: true for disable logging of library names
    fn load_shared_objects(&mut self, quiet: bool) -> Result<(), Error> {
        let deps = self.dwarf_registry.discover_shared_objects()?;
        let new_deps: Vec<_> = deps
            .into_iter()
            .filter(|dep| self.dwarf_registry.find_by_file(dep).is_none())
            .collect();

        let debug_info_dirs = self.debug_info_dirs.clone();
        let dwarfs: Vec<_> = new_deps
            .into_par_iter()
            .filter_map(|dep| {
                let parse_result = parse_dependency(&dep, &debug_info_dirs);
                match parse_result {
                    Ok(mb_dep) => mb_dep.map(|dwarf| {
                        if !quiet {
                            info!(target: "dwarf-loader", "load shared library {dep:?}");
                        }
                        (dep, dwarf)
                    }),
                    Err(e) => {
                        warn!(target: "debugger", "broken dependency {:?}: {:#}", dep, e);
                        None
                    }
                }
            })
            .collect();

        for (dep_name, dwarf) in dwarfs {
            if let Err(e) = self.dwarf_registry.add(&dep_name, dwarf) {
                warn!(target: "debugger", "broken dependency {:?}: {:#}", dep_name, e);
            }
        }

        print_warns!(self.dwarf_registry.update_mappings(false)?);
        Ok(())
    }

    /// Discard current debug information and reload from a new image.
    /// Called after the tracee does `execve` when follow-exec mode enabled.
    ///
    /// # Arguments
    ///
    /// * `pid`: tracee that changed its image
    pub fn reload_from_exec(&mut self, pid: Pid) -> Result<(), Error> {
        let exe = fs::read_link(format!("/proc/{pid}/exe"))?;
        let file = fs::File::open(&exe)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let dwarf_builder = dwarf::DebugInformationBuilder::new(&self.debug_info_dirs);
        let dwarf = dwarf_builder.build(exe.as_path(), &object)?;

        self.object_sections = object
            .sections()
            .filter_map(|section| Some((section.name().ok()?.to_string(), section.address())))
            .collect();
        self.go_version = extract_go_version(&object);
        self.path = exe.clone();
        self.dwarf_registry = DwarfRegistry::new(pid, exe, dwarf);
        print_warns!(self.dwarf_registry.update_mappings(true)?);
        weak_error!(self.load_shared_objects(false));

        Ok(())
    }

    #[inline(always)]
    pub fn tracee_ctl(&self) -> &TraceeCtl {
        &self.tracer.tracee_ctl
    }

    pub fn frame_info(&self, ctx: &ExplorationContext) -> Result<FrameInfo, Error> {
        let dwarf = self.debug_info(ctx.location().pc)?;
        let func = dwarf
            .find_function_by_pc(ctx.location().global_pc)?
            .ok_or(FunctionNotFound(ctx.location().global_pc))?;

        let base_addr = func.frame_base_addr(ctx, self)?;
        let cfa = dwarf.get_cfa(self, ctx)?;
        let backtrace = self.unwind(ctx.pid_on_focus())?;
        let (bt_frame_num, frame) = backtrace
            .iter()
            .enumerate()
            .find(|(_, frame)| frame.ip == ctx.location().pc)
            .ok_or(Error::UnwindNoContext)?;
        let return_addr = backtrace.get(bt_frame_num + 1).map(|f| f.ip);
        Ok(FrameInfo {
            frame: frame.clone(),
            num: bt_frame_num as u32,
            cfa,
            base_addr,
            return_addr,
        })
    }

    pub fn thread_state(&self, ctx: &ExplorationContext) -> Result<Vec<ThreadSnapshot>, Error> {
        let threads = self.tracee_ctl().snapshot();
        Ok(threads
            .into_iter()
            .filter_map(|tracee| {
                let mb_bt = weak_error!(self.unwind(tracee.pid));
                let frame_num = mb_bt.as_ref().and_then(|bt| {
                    bt.iter()
                        .enumerate()
                        .find_map(|(i, frame)| (frame.ip == ctx.location().pc).then_some(i))
                });

                let place = mb_bt.as_ref().and_then(|bt| {
                    bt.first().and_then(|first_frame| {
                        let debug_info = self.debug_info(first_frame.ip).ok()?;
                        debug_info
                            .find_place_from_pc(first_frame.ip.into_global(self).ok()?)
                            .ok()?
                    })
                });

                Some(ThreadSnapshot {
                    in_focus: tracee.pid == ctx.pid_on_focus(),
                    thread: tracee,
                    bt: mb_bt,
                    place: place.map(|p| p.to_owned()),
                    focus_frame: frame_num,
                })
            })
            .collect())
    }

    /// Return tracee by it's thread id.
    ///
    /// # Panics
    ///
    /// This method panics if thread with pid `pid` not runs.
    pub fn get_tracee_ensure(&self, pid: Pid) -> &Tracee {
        self.tracee_ctl().tracee_ensure(pid)
    }

    /// Return tracee by its number.
    ///
    /// # Arguments
    ///
    /// * `num`: tracee number
    pub fn get_tracee_by_num(&self, num: u32) -> Result<Tracee, Error> {
        let mut snapshot = self.tracee_ctl().snapshot();
        let tracee = snapshot.drain(..).find(|tracee| tracee.number == num);
        tracee.ok_or(TraceeNotFound(num))
    }

    /// Return debug information about program determined by program counter address.
    #[inline(always)]
    pub fn debug_info(&self, addr: RelocatedAddress) -> Result<&DebugInformation, Error> {
        self.dwarf_registry
            .find_by_addr(addr)
            .ok_or(Error::NoDebugInformation("current location"))
    }

    /// Return debug information about program determined by file which from it been parsed.
    #[inline(always)]
    pub fn debug_info_from_file(&self, path: &Path) -> Result<&DebugInformation, Error> {
        self.dwarf_registry
            .find_by_file(path)
            .ok_or(Error::NoDebugInformation("file"))
    }

    /// Get main executable object debug information.
    #[inline(always)]
    pub fn program_debug_info(&self) -> Result<&DebugInformation, Error> {
        self.dwarf_registry
            .find_main_program_dwarf()
            .ok_or(Error::NoDebugInformation("executable object"))
    }

    /// Return all known debug information.
    /// Debug info of the main executable is located at the zero index.
    #[inline(always)]
    pub fn debug_info_all(&self) -> Vec<&DebugInformation> {
        self.dwarf_registry.all_dwarf()
    }

    /// Return mapped memory region offset for region.
    ///
    /// # Arguments
    ///
    /// * `addr`: VAS address, determine region for which offset is needed.
    pub fn mapping_offset_for_pc(&self, addr: RelocatedAddress) -> Result<usize, Error> {
        self.dwarf_registry
            .find_mapping_offset(addr)
            .ok_or(MappingOffsetNotFound("address out of bounds"))
    }

    /// Return mapped memory region offset for region.
    ///
    /// # Arguments
    ///
    /// * `dwarf`: debug information (with file path inside) for determine memory region.
    pub fn mapping_offset_for_file(&self, dwarf: &DebugInformation) -> Result<usize, Error> {
        self.dwarf_registry
            .find_mapping_offset_for_file(dwarf)
            .ok_or(MappingOffsetNotFound("unknown segment"))
    }

    /// Unwind debugee thread stack and return a backtrace.
    ///
    /// # Arguments
    ///
    /// * `pid`: thread for unwinding
    pub fn unwind(&self, pid: Pid) -> Result<Backtrace, Error> {
        unwind::unwind(self, pid)
    }

    /// Restore registers at chosen frame.
    ///
    /// # Arguments
    ///
    /// * `pid`: thread for unwinding
    /// * `registers`: initial registers state at frame 0 (current frame), will be updated with new values
    /// * `frame_num`: frame number for which registers is restored
    pub fn restore_registers_at_frame(
        &self,
        pid: Pid,
        registers: &mut DwarfRegisterMap,
        frame_num: u32,
    ) -> Result<(), Error> {
        unwind::restore_registers_at_frame(self, pid, registers, frame_num)
    }

    /// Return a current frame return address for current thread.
    ///
    /// # Arguments
    ///
    /// * `pid`: thread for unwinding
    pub fn return_addr(&self, pid: Pid) -> Result<Option<RelocatedAddress>, Error> {
        unwind::return_addr(self, pid)
    }

    /// Return a ordered list of mapped regions (main executable region at first place).
    pub fn dump_mapped_regions(&self) -> Vec<RegionInfo> {
        self.dwarf_registry.dump()
    }

    /// Return a list of disassembled instruction for a function in focus.
    pub fn disasm(
        &self,
        ctx: &ExplorationContext,
        breakpoints: &[&Breakpoint],
    ) -> Result<FunctionAssembly, Error> {
        let debug_information = self.debug_info(ctx.location().pc)?;
        let function = debug_information
            .find_function_by_pc(ctx.location().global_pc)?
            .ok_or(FunctionNotFound(ctx.location().global_pc))?;

        let ranges = function.ranges();
        let low = ranges
            .iter()
            .map(|r| r.begin)
            .min()
            .ok_or(Error::NoFunctionRanges(function.full_name()))?;
        let high = ranges
            .iter()
            .map(|r| r.end)
            .max()
            .ok_or(Error::NoFunctionRanges(function.full_name()))?;

        let from = GlobalAddress::from(low).relocate_to_segment_by_pc(self, ctx.location().pc)?;
        let instructions = self.disassembly.disasm_range(
            self,
            from,
            (high - low) as usize,
            breakpoints,
        )?;

        Ok(FunctionAssembly {
            name: function.full_name(),
            addr_in_focus: ctx.location().global_pc,
            instructions,
        })
    }

    /// Disassemble an arbitrary memory range.
    pub fn disasm_memory(
        &self,
        from: RelocatedAddress,
        len: usize,
        breakpoints: &[&Breakpoint],
    ) -> Result<Vec<Instruction>, Error> {
        self.disassembly.disasm_range(self, from, len, breakpoints)
    }
}

/// Parse dwarf information from a new dependency.
fn parse_dependency(
    dep_file: &Path,
    debug_info_dirs: &[PathBuf],
) -> Result<Option<DebugInformation>, Error> {
    // libvdso should be skipped
    if dep_file.to_string_lossy().contains("vdso") {
        return Ok(None);
    }

    let file = fs::File::open(dep_file)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let object = object::File::parse(&*mmap)?;

    let dwarf_builder = dwarf::DebugInformationBuilder::new(debug_info_dirs);
    let dwarf = dwarf_builder.build(dep_file, &object)?;
    Ok(Some(dwarf))
}

/// Naive search of a Go toolchain version in the binary build information.
fn extract_go_version(object: &object::File) -> Option<GoVersion> {
    let sections = [".go.buildinfo", ".rodata"];
    for name in sections {
        let Some(data) = object
            .section_by_name(name)
            .and_then(|sect| sect.data().ok())
        else {
            continue;
        };
        if let Some(version) = extract_go_version_naive(data) {
            return Some(version);
        }
    }
    None
}

/// Find the first "goN.N.N" substring in a byte blob.
fn extract_go_version_naive(data: &[u8]) -> Option<GoVersion> {
    let needle = b"go1.";
    let mut idx = 0;
    while let Some(pos) = data[idx..]
        .windows(needle.len())
        .position(|win| win == needle)
    {
        let start = idx + pos;
        let end = data[start..]
            .iter()
            .position(|&b| !(b.is_ascii_digit() || b == b'.' || b.is_ascii_lowercase()))
            .map(|p| start + p)
            .unwrap_or(data.len());
        if let Ok(s) = std::str::from_utf8(&data[start..end]) {
            if let Some(version) = GoVersion::parse(s) {
                return Some(version);
            }
        }
        idx = start + needle.len();
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_extract_go_version_naive() {
        let blob = b"\x00\x00xxgo1.22.3\x00yy";
        assert_eq!(
            extract_go_version_naive(blob),
            Some(GoVersion((1, 22, 3)))
        );

        let blob = b"gogogo no version here";
        assert_eq!(extract_go_version_naive(blob), None);
    }
}

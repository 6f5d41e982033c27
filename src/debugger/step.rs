use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::debugee::dwarf::unit::PlaceDescriptorOwned;
use crate::debugger::debugee::tracer::{StopReason, TraceContext, WatchpointHitType};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{NoFunctionRanges, PlaceNotFound, ProcessExit};
use crate::debugger::{Debugger, ExplorationContext};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Result of a step, if [`StepResult::SignalInterrupt`] or
/// [`StepResult::WatchpointInterrupt`] then a step process interrupted and the user
/// should know about it. If `quiet` set to `true` then no hooks should occur.
pub(super) enum StepResult {
    Done,
    SignalInterrupt {
        signal: Signal,
        quiet: bool,
    },
    WatchpointInterrupt {
        pid: Pid,
        addr: RelocatedAddress,
        ty: WatchpointHitType,
        quiet: bool,
    },
    /// Another user breakpoint interrupted the step operation.
    BreakpointInterrupt {
        pid: Pid,
        addr: RelocatedAddress,
    },
}

impl StepResult {
    fn signal_interrupt_quiet(signal: Signal) -> Self {
        Self::SignalInterrupt {
            signal,
            quiet: true,
        }
    }

    fn signal_interrupt(signal: Signal) -> Self {
        Self::SignalInterrupt {
            signal,
            quiet: false,
        }
    }

    fn wp_interrupt_quiet(pid: Pid, addr: RelocatedAddress, ty: WatchpointHitType) -> Self {
        Self::WatchpointInterrupt {
            pid,
            addr,
            ty,
            quiet: true,
        }
    }

    fn wp_interrupt(pid: Pid, addr: RelocatedAddress, ty: WatchpointHitType) -> Self {
        Self::WatchpointInterrupt {
            pid,
            addr,
            ty,
            quiet: false,
        }
    }
}

impl Debugger {
    /// Do a single step (until debugee reaches a different source line).
    ///
    /// Returns [`StepResult::SignalInterrupt`] if the step is interrupted by a signal
    /// or [`StepResult::Done`] if a step is done.
    ///
    /// **! change exploration context**
    pub(super) fn step_in(&mut self) -> Result<StepResult, Error> {
        enum PlaceOrStop {
            Place(PlaceDescriptorOwned),
            Signal(Signal),
            Watchpoint(Pid, RelocatedAddress, WatchpointHitType),
        }

        // make an instruction step but ignoring functions prolog
        // initial function must exist (do instruction steps until it's not)
        // returns stop place or signal if a step is undone
        fn step_over_prolog(debugger: &mut Debugger) -> Result<PlaceOrStop, Error> {
            macro_rules! prolog_single_step {
                ($debugger: expr) => {
                    match $debugger.single_step_instruction()? {
                        Some(StopReason::SignalStop(_, sign)) => {
                            return Ok(PlaceOrStop::Signal(sign));
                        }
                        Some(StopReason::Watchpoint(pid, addr, ty)) => {
                            return Ok(PlaceOrStop::Watchpoint(pid, addr, ty));
                        }
                        _ => {}
                    }
                };
            }

            loop {
                // initial step
                prolog_single_step!(debugger);
                let mut location = debugger.exploration_ctx().location();
                // determine current function, if no debug information for function -
                // step until function found
                let func = loop {
                    let dwarf = debugger.debugee.debug_info(location.pc)?;
                    // a step stops only if there is debug information for PC and
                    // current function can be determined
                    if let Ok(Some(func)) = dwarf.find_function_by_pc(location.global_pc) {
                        break func;
                    }
                    prolog_single_step!(debugger);
                    location = debugger.exploration_ctx().location();
                };

                let prolog = func.prolog()?;
                // if PC in prolog range - step until function body is reached
                while debugger
                    .exploration_ctx()
                    .location()
                    .global_pc
                    .in_range(&prolog)
                {
                    prolog_single_step!(debugger);
                }

                let location = debugger.exploration_ctx().location();
                if let Some(place) = debugger
                    .debugee
                    .debug_info(location.pc)?
                    .find_exact_place_from_pc(location.global_pc)?
                {
                    return Ok(PlaceOrStop::Place(place.to_owned()));
                }
            }
        }

        let mut location = self.exploration_ctx().location();

        let start_place = loop {
            let dwarf = &self.debugee.debug_info(location.pc)?;
            if let Ok(Some(place)) = dwarf.find_place_from_pc(location.global_pc) {
                break place.to_owned();
            }
            match self.single_step_instruction()? {
                Some(StopReason::SignalStop(_, sign)) => {
                    return Ok(StepResult::signal_interrupt(sign));
                }
                Some(StopReason::Watchpoint(pid, addr, ty)) => {
                    return Ok(StepResult::wp_interrupt(pid, addr, ty));
                }
                _ => {}
            }
            location = self.exploration_ctx().location();
        };

        let sp_file = start_place.file.clone();
        let sp_line = start_place.line_number;
        let start_cfa = self
            .debugee
            .debug_info(location.pc)?
            .get_cfa(&self.debugee, &ExplorationContext::new(location, 0))?;

        loop {
            let next_place = match step_over_prolog(self)? {
                PlaceOrStop::Place(place) => place,
                PlaceOrStop::Signal(signal) => return Ok(StepResult::signal_interrupt(signal)),
                PlaceOrStop::Watchpoint(pid, addr, ty) => {
                    return Ok(StepResult::wp_interrupt(pid, addr, ty));
                }
            };
            if !next_place.is_stmt {
                continue;
            }
            let in_same_place = sp_file == next_place.file && sp_line == next_place.line_number;
            let location = self.exploration_ctx().location();
            let next_cfa = self
                .debugee
                .debug_info(location.pc)?
                .get_cfa(&self.debugee, &ExplorationContext::new(location, 0))?;

            // step is done if:
            // 1) we may step at same place in code but in another stack frame
            // 2) we step at another place in code (file + line)
            if start_cfa != next_cfa || !in_same_place {
                break;
            }
        }

        self.expl_ctx_update_location()?;
        Ok(StepResult::Done)
    }

    /// Move debugee to next instruction, step over breakpoint if needed.
    /// May return a [`StopReason::SignalStop`] if the step didn't happen cause signal.
    ///
    /// **! change exploration context**
    pub(super) fn single_step_instruction(&mut self) -> Result<Option<StopReason>, Error> {
        let loc = self.exploration_ctx().location();
        let mb_reason = if self.breakpoints.get_enabled(loc.pc).is_some() {
            self.step_over_breakpoint()?
        } else {
            let breakpoints = self.breakpoints.active_breakpoints();
            let maybe_reason = self
                .debugee
                .tracer_mut()
                .single_step(TraceContext::new(&breakpoints), loc.pid)?;
            self.expl_ctx_update_location()?;
            maybe_reason
        };
        Ok(mb_reason)
    }

    /// If current on focus thread is stopped at a breakpoint, then it takes a step
    /// through this point.
    ///
    /// May return a [`StopReason::SignalStop`] or [`StopReason::Watchpoint`]
    /// if the step didn't happen cause signal or watchpoint is hit.
    ///
    /// **! change exploration context**
    pub(super) fn step_over_breakpoint(&mut self) -> Result<Option<StopReason>, Error> {
        // cannot use debugee::Location, mapping offset may be not init yet
        let tracee = self.debugee.get_tracee_ensure(self.exploration_ctx().pid_on_focus());
        let mb_brkpt = self.breakpoints.get_enabled(tracee.pc()?);
        let tracee_pid = tracee.pid;
        if let Some(brkpt) = mb_brkpt {
            if brkpt.is_enabled() {
                brkpt.disable()?;
                let breakpoints = self.breakpoints.active_breakpoints();
                let maybe_reason = self
                    .debugee
                    .tracer_mut()
                    .single_step(TraceContext::new(&breakpoints), tracee_pid)?;
                drop(breakpoints);
                brkpt.enable()?;
                self.expl_ctx_update_location()?;
                return Ok(maybe_reason);
            }
        }
        Ok(None)
    }

    /// Move to higher stack frame.
    ///
    /// **! change exploration context**
    pub(super) fn step_out_frame(&mut self) -> Result<(), Error> {
        let location = self.exploration_ctx().location();

        if let Some(ret_addr) = self.debugee.return_addr(location.pid)? {
            let brkpt_is_set = self.breakpoints.get_enabled(ret_addr).is_some();
            if brkpt_is_set {
                self.continue_execution()?;
            } else {
                let brkpt = Breakpoint::new_temporary(ret_addr, location.pid);
                self.breakpoints.add_and_enable(brkpt)?;
                self.continue_execution()?;
                self.breakpoints.remove_by_addr(ret_addr)?;
            }
        }

        if self.debugee.is_exited() {
            return Err(ProcessExit(0));
        }

        self.expl_ctx_update_location()?;
        Ok(())
    }

    /// Do debugee step over subroutine calls.
    /// The step is bound to the goroutine that initiated it: when another goroutine
    /// reaches one of the temporary breakpoints the stop is transparent. A stop at
    /// a foreign user breakpoint interrupts the operation.
    ///
    /// Returns [`StepResult::SignalInterrupt`] if the step is interrupted by a signal
    /// or [`StepResult::Done`] if step done.
    ///
    /// **! change exploration context**
    pub(super) fn step_over_any(&mut self) -> Result<StepResult, Error> {
        let mut current_location = self.exploration_ctx().location();

        // goroutine that owns this step operation
        let initiator_goroutine = self.current_goroutine_id();

        // determine current function, if no debug information for function -
        // step until function found
        let func = loop {
            let dwarf = &self.debugee.debug_info(current_location.pc)?;
            if let Ok(Some(func)) = dwarf.find_function_by_pc(current_location.global_pc) {
                break func;
            }
            match self.single_step_instruction()? {
                Some(StopReason::SignalStop(_, sign)) => {
                    return Ok(StepResult::signal_interrupt(sign));
                }
                Some(StopReason::Watchpoint(pid, addr, ty)) => {
                    return Ok(StepResult::wp_interrupt(pid, addr, ty));
                }
                _ => {}
            }
            current_location = self.exploration_ctx().location();
        };
        let fn_file_idx = func.die.decl_file_line.map(|fl| fl.0);
        let fn_full_name = func.full_name();

        let prolog = func.prolog()?;
        let inline_ranges = func.inline_ranges();
        let fn_ranges = func.ranges().to_vec();

        let dwarf = self.debugee.debug_info(current_location.pc)?;
        let current_place = dwarf
            .find_place_from_pc(current_location.global_pc)?
            .ok_or(PlaceNotFound(current_location.global_pc))?
            .to_owned();

        // successor statements of the current one, each gets a temporary breakpoint
        let mut step_over_breakpoints = vec![];

        for range in &fn_ranges {
            let unit = func.unit();
            let mut place = match unit.find_place_by_pc(GlobalAddress::from(range.begin)) {
                Some(place) => place,
                None => return Err(NoFunctionRanges(fn_full_name.clone())),
            };

            while place.address.in_range(range) {
                if Some(place.file_idx) != fn_file_idx {
                    match place.next() {
                        None => break,
                        Some(n) => place = n,
                    }
                    continue;
                }

                // skip places in function prolog
                if place.address.in_range(&prolog) {
                    match place.next() {
                        None => break,
                        Some(n) => place = n,
                    }
                    continue;
                }

                // guard against a step at inlined function body
                let in_inline_range = place.address.in_ranges(&inline_ranges);

                if !in_inline_range
                    && place.is_stmt
                    && place.address != current_place.address
                    && place.line_number != current_place.line_number
                {
                    let load_addr = place
                        .address
                        .relocate_to_segment_by_pc(&self.debugee, current_location.pc)?;
                    if self.breakpoints.get_enabled(load_addr).is_none()
                        && !step_over_breakpoints.contains(&load_addr)
                    {
                        step_over_breakpoints.push(load_addr);
                    }
                }

                match place.next() {
                    None => break,
                    Some(n) => place = n,
                }
            }
        }

        let mut to_delete = step_over_breakpoints.clone();
        for load_addr in step_over_breakpoints {
            self.breakpoints
                .add_and_enable(Breakpoint::new_temporary(load_addr, current_location.pid))?;
        }

        let return_addr = self.debugee.return_addr(current_location.pid)?;
        if let Some(ret_addr) = return_addr {
            if self.breakpoints.get_enabled(ret_addr).is_none() {
                self.breakpoints
                    .add_and_enable(Breakpoint::new_temporary(ret_addr, current_location.pid))?;
                to_delete.push(ret_addr);
            }
        }

        // resume until the initiating goroutine stops at one of the temporaries
        let step_result = loop {
            let stop_reason = self.continue_execution()?;

            match stop_reason {
                StopReason::SignalStop(_, sign) => {
                    break StepResult::signal_interrupt_quiet(sign);
                }
                StopReason::Watchpoint(pid, addr, ty) => {
                    break StepResult::wp_interrupt_quiet(pid, addr, ty);
                }
                StopReason::Breakpoint(pid, addr) => {
                    let is_temporary = self
                        .breakpoints
                        .get_enabled(addr)
                        .map(|b| b.is_temporary())
                        .unwrap_or_default();

                    if !is_temporary {
                        // an unrelated user breakpoint interrupts the operation
                        break StepResult::BreakpointInterrupt { pid, addr };
                    }

                    // the stop belongs to the operation only if it happened in
                    // the initiating goroutine
                    let stop_goroutine = self.current_goroutine_id();
                    if initiator_goroutine.is_none() || stop_goroutine == initiator_goroutine {
                        break StepResult::Done;
                    }
                    // transparent resume for a foreign goroutine
                    continue;
                }
                _ => break StepResult::Done,
            }
        };

        to_delete
            .into_iter()
            .try_for_each(|addr| self.breakpoints.remove_by_addr(addr).map(|_| ()))?;

        if let StepResult::SignalInterrupt { .. }
        | StepResult::WatchpointInterrupt { .. }
        | StepResult::BreakpointInterrupt { .. } = step_result
        {
            return Ok(step_result);
        }

        // if a step is taken outside and new location pc not equals to place pc,
        // then we stopped at the place of the previous function call,
        // and got into an assignment operation or similar, in this case do a single step
        let new_location = self.exploration_ctx().location();
        if Some(new_location.pc) == return_addr {
            let place = self
                .debugee
                .debug_info(new_location.pc)?
                .find_place_from_pc(new_location.global_pc)?
                .map(|p| p.to_owned());
            if let Some(place) = place {
                if place.address != new_location.global_pc {
                    match self.step_in()? {
                        StepResult::SignalInterrupt { signal, .. } => {
                            return Ok(StepResult::signal_interrupt(signal));
                        }
                        StepResult::WatchpointInterrupt { pid, addr, ty, .. } => {
                            return Ok(StepResult::wp_interrupt(pid, addr, ty));
                        }
                        _ => {}
                    }
                }
            }
        }

        if self.debugee.is_exited() {
            return Err(ProcessExit(0));
        }

        self.expl_ctx_update_location()?;
        Ok(StepResult::Done)
    }
}

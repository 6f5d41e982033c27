use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::debugee::tracer::StopReason;
use crate::debugger::error::Error;
use crate::debugger::register::{Register, RegisterMap};
use crate::debugger::variable::dqe::Literal;
use crate::debugger::Debugger;
use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("invalid argument count, expect {0}, got {1}")]
    InvalidArgumentCount(usize, usize),
    #[error("at most 9 integer register arguments allowed at this moment")]
    TooManyArguments,
    #[error("`{0}` literal type is not supported as an argument")]
    UnsupportedLiteral(&'static str),
    #[error("function not found or too many candidates")]
    FunctionNotFoundOrTooMany,
    #[error("the tracee received a signal inside an injected call")]
    Signalled,
    #[error("another breakpoint hit inside an injected call")]
    OtherBreakpointHit,
    #[error("the tracee crashed inside an injected call")]
    Crashed,
    #[error("unsafe call injection not enabled for this request")]
    UnsafeNotEnabled,
}

/// Integer argument registers of the Go internal amd64 ABI, in passing order.
const GO_ABI_INT_REGS: [Register; 9] = [
    Register::Rax,
    Register::Rbx,
    Register::Rcx,
    Register::Rdi,
    Register::Rsi,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

/// Function call arguments, marshalled into 8-byte machine words.
#[derive(Default)]
struct CallArgs(Vec<u64>);

impl CallArgs {
    fn new(literals: &[Literal]) -> Result<Self, CallError> {
        if literals.len() > GO_ABI_INT_REGS.len() {
            return Err(CallError::TooManyArguments);
        }

        let args = literals
            .iter()
            .map(|lit| match lit {
                Literal::Int(val) => Ok(*val as u64),
                Literal::Bool(val) => Ok(*val as u64),
                Literal::Address(addr) => Ok(*addr as u64),
                Literal::Float(_) => Err(CallError::UnsupportedLiteral("float")),
                Literal::String(_) => Err(CallError::UnsupportedLiteral("string")),
            })
            .collect::<Result<Vec<u64>, CallError>>()?;

        Ok(CallArgs(args))
    }

    /// Fill registers with arguments according to the ABI.
    fn prepare_registers(&self, reg_map: &mut RegisterMap) {
        for (idx, val) in self.0.iter().enumerate() {
            reg_map.update(GO_ABI_INT_REGS[idx], *val);
        }
    }
}

/// Result of an injected call: the raw first return register.
#[derive(Debug, Clone, Copy)]
pub struct CallResult {
    pub ret_value: u64,
}

impl Debugger {
    /// Execute a function inside the debugee (EXPERIMENTAL).
    ///
    /// The tracee is resumed inside a synthetic frame: arguments are placed by the
    /// ABI, the stack gets a return address pointing at the current instruction and
    /// an internal breakpoint there returns control to the debugger. On any other
    /// stop inside the call the operation is aborted, registers and the patched
    /// byte are restored but side effects already made by the callee stay.
    ///
    /// # Arguments
    ///
    /// * `fn_name`: function to call.
    /// * `arguments`: list of literals.
    pub fn call(&mut self, fn_name: &str, arguments: &[Literal]) -> Result<CallResult, Error> {
        debug!(target: "debugger", "find function address and prepare arguments");

        let (dwarf_file, fn_addr) = {
            let dwarfs = self.debugee.debug_info_all();
            let mut candidates = vec![];
            for dwarf in dwarfs {
                if !dwarf.has_debug_info() {
                    continue;
                }
                let funcs = dwarf.search_functions(fn_name)?;
                for func in funcs {
                    let place = func.prolog_end_place()?;
                    candidates.push((dwarf.pathname().to_path_buf(), place.address));
                }
            }
            if candidates.len() != 1 {
                return Err(CallError::FunctionNotFoundOrTooMany.into());
            }
            candidates.pop().expect("infallible")
        };

        let debug_info = self.debugee.debug_info_from_file(&dwarf_file)?;
        let fn_addr = fn_addr.relocate_to_segment(&self.debugee, debug_info)?;

        let args = CallArgs::new(arguments).map_err(Error::from)?;

        call_fn(self, fn_addr, args)
    }

    /// Number of parameters expected by a function, for argument count validation.
    pub(super) fn fn_param_count(&self, fn_name: &str) -> Result<usize, Error> {
        let debug_info = self.debugee.program_debug_info()?;
        let mut funcs = debug_info.search_functions(fn_name)?;
        let func = match funcs.len() {
            0 => return Err(Error::SymbolNotFound(fn_name.to_string())),
            1 => funcs.pop().expect("infallible"),
            n => return Err(Error::AmbiguousSymbol(fn_name.to_string(), n)),
        };
        Ok(func.parameters().len())
    }
}

fn call_fn(debugger: &mut Debugger, fn_addr: RelocatedAddress, args: CallArgs) -> Result<CallResult, Error> {
    let pid = debugger.exploration_ctx().pid_on_focus();
    let original_regs = RegisterMap::current(pid).map_err(Error::Ptrace)?;
    let return_addr = RelocatedAddress::from(original_regs.value(Register::Rip));

    debug!(target: "debugger", "prepare a synthetic frame, return address {return_addr}");

    // a return trap at the current instruction returns control after the callee ends
    let ret_brkpt_number = {
        let brkpt = Breakpoint::new_call_return(return_addr, pid);
        debugger.breakpoints.add_and_enable(brkpt)?
    };

    // argument area: the stack grows down, the return address becomes the
    // first word of the synthetic frame
    let mut regs = original_regs;
    let new_sp = regs.value(Register::Rsp) - 8;
    debugger.write_memory(new_sp as usize, return_addr.as_usize())?;
    regs.update(Register::Rsp, new_sp);

    args.prepare_registers(&mut regs);
    regs.update(Register::Rip, fn_addr.as_u64());
    regs.persist(pid).map_err(Error::Ptrace)?;

    debug!(target: "debugger", "resume until the callee returns");

    let finalize = |debugger: &mut Debugger, e: Option<CallError>| -> Result<(), Error> {
        debugger.breakpoints.remove_by_number(ret_brkpt_number)?;
        original_regs.persist(pid).map_err(Error::Ptrace)?;
        match e {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    };

    loop {
        let stop = match debugger.continue_execution() {
            Ok(stop) => stop,
            Err(e) => {
                let _ = finalize(debugger, None);
                return Err(e);
            }
        };

        match stop {
            StopReason::Breakpoint(stop_pid, addr) if addr == return_addr && stop_pid == pid => {
                break;
            }
            StopReason::Breakpoint(_, _) => {
                finalize(debugger, Some(CallError::OtherBreakpointHit))?;
                unreachable!("finalize with an error always returns it");
            }
            StopReason::SignalStop(_, _) => {
                finalize(debugger, Some(CallError::Signalled))?;
                unreachable!("finalize with an error always returns it");
            }
            StopReason::DebugeeExit(_) | StopReason::NoSuchProcess(_) => {
                return Err(CallError::Crashed.into());
            }
            _ => continue,
        }
    }

    let result_regs = RegisterMap::current(pid).map_err(Error::Ptrace)?;
    let ret_value = result_regs.value(Register::Rax);

    debug!(target: "debugger", "callee done, restore the original state");
    finalize(debugger, None)?;

    Ok(CallResult { ret_value })
}

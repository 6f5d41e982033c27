use crate::debugger::address::GlobalAddress;
use crate::debugger::call::CallError;
use nix::unistd::Pid;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debugee already run")]
    AlreadyRun,
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error("thread {0} is running, halt the debugee first")]
    NotStopped(Pid),
    #[error("debugee already halted")]
    AlreadyHalted,
    #[error("operation is unsupported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),
    #[error(transparent)]
    RegEx(#[from] regex::Error),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no debug information for {0}")]
    NoDebugInformation(&'static str),
    #[error("unknown register {0:?}")]
    RegisterNotFound(gimli::Register),
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("source place not found at address {0}")]
    PlaceNotFound(GlobalAddress),
    #[error("there are no suitable places for this request")]
    NoSuitablePlace,
    #[error("unit not found at address {0}")]
    UnitNotFound(GlobalAddress),
    #[error("function not found at address {0}")]
    FunctionNotFound(GlobalAddress),
    #[error("symbol `{0}` not found")]
    SymbolNotFound(String),
    #[error("symbol `{0}` is ambiguous, {1} candidates found")]
    AmbiguousSymbol(String, usize),
    #[error("type not found")]
    TypeNotFound,
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("tracee number {0} not found")]
    TraceeNotFound(u32),
    #[error("goroutine {0} not found")]
    GoroutineNotFound(u64),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u32),
    #[error("debug information entry (die) not found")]
    DieNotFound,
    #[error("section \"{0}\" not found")]
    SectionNotFound(&'static str),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("invalid binary representation of type `{0}`: {1:?}")]
    TypeBinaryRepr(&'static str, Box<[u8]>),
    #[error("unknown address")]
    UnknownAddress,
    #[error("memory region offset not found ({0})")]
    MappingOffsetNotFound(&'static str),
    #[error("memory region not found for a file: {0}")]
    MappingNotFound(String),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("multiple syscall errors {0:?}")]
    MultipleErrors(Vec<Self>),
    #[error("the tracee exited or was killed out from under the debugger")]
    TraceeGone,

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("invalid build-id note format")]
    BuildIdFormat,
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("expression parsing error: {0}")]
    ExpressionParsing(String),
    #[error("location parsing error: {0}")]
    LocationParsing(String),

    // --------------------------------- unwind errors ---------------------------------------------
    #[error("unwind: no unwind context")]
    UnwindNoContext,
    #[error("unwind: too deep frame number")]
    UnwindTooDeepFrame,

    // --------------------------------- dwarf errors ----------------------------------------------
    #[error("dwarf expression evaluation: eval option `{0}` required")]
    EvalOptionRequired(&'static str),
    #[error("dwarf expression evaluation: unsupported evaluation require ({0})")]
    EvalUnsupportedRequire(&'static str),
    #[error("no frame base address")]
    NoFBA,
    #[error("frame base address attribute not an expression")]
    FBANotAnExpression,
    #[error("range information for function `{0:?}` not exists")]
    NoFunctionRanges(Option<String>),
    #[error("die type not exists")]
    NoDieType,
    #[error("fail to read/evaluate implicit pointer address")]
    ImplicitPointer,

    // --------------------------------- evaluator errors ------------------------------------------
    #[error("assignment target is not assignable: {0}")]
    Unassignable(&'static str),
    #[error("type mismatch: expect {expect}, got {got}")]
    TypeMismatch { expect: &'static str, got: String },
    #[error("watch subject not found")]
    WatchSubjectNotFound,

    // --------------------------------- watchpoint errors -----------------------------------------
    #[error("all hardware watchpoint slots are in use")]
    OutOfWatchpointSlots,
    #[error("only 1, 2, 4 or 8 byte watchpoints are supported")]
    WatchpointWrongSize,
    #[error("watched expression has no defined size")]
    WatchpointUndefinedSize,
    #[error("address already observed by another watchpoint")]
    AddressAlreadyObserved,

    // --------------------------------- go runtime model errors -----------------------------------
    #[error("go runtime structure not found: {0}")]
    NoGoRuntime(&'static str),
    #[error("go version of binary ({binary}) differs from client stdlib ({client})")]
    GoVersionMismatch { binary: String, client: String },

    // --------------------------------- call injection errors -------------------------------------
    #[error("injected call failed: {0}")]
    InjectedCall(#[from] CallError),

    // --------------------------------- debugee process errors ------------------------------------
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("process pid {0} not found")]
    AttachedProcessNotFound(Pid),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),

    // --------------------------------- disasm ----------------------------------------------------
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),

    // --------------------------------- hook errors -----------------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to the service layer - continue debugging after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DwarfParsing(_)
                | Error::ObjParsing(_)
                | Error::Syscall(_, _)
                | Error::DisAsmInit(_)
                | Error::AttachedProcessNotFound(_)
                | Error::Attach(_)
        )
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

/// Macro for handle an error lists as warnings.
#[macro_export]
macro_rules! print_warns {
    ($errors:expr) => {
        $errors.iter().for_each(|e| {
            log::warn!(target: "debugger", "{:#}", e);
        })
    };
}

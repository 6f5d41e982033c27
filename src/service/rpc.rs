//! Method dispatch of the service API.
//!
//! All debugger operations execute on the pinned worker thread in arrival order,
//! which serializes run control against breakpoint edits. `halt` and
//! `state_nonblocking` intentionally bypass the queue: the first is the universal
//! cancellation primitive, the second must answer while a resume is in flight.

use crate::debugger::goroutine::{GoroutineFilter, GroupBy};
use crate::debugger::location::parse_location;
use crate::debugger::register::debug::BreakCondition;
use crate::debugger::{Debugger, Error};
use crate::service::proto::{self, Request, Response, RpcError};
use crate::service::worker::DebuggerWorker;
use log::debug;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct RpcHandler {
    worker: Arc<DebuggerWorker>,
    /// True while a resume operation is in flight.
    running: Arc<AtomicBool>,
    tracee_pid: Pid,
    multiclient: bool,
}

fn parse_params<T: DeserializeOwned>(params: Json) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError {
        code: proto::CODE_BAD_REQUEST,
        message: format!("malformed parameters: {e}"),
        data: None,
    })
}

fn ok<T: serde::Serialize>(id: u64, result: T) -> Response {
    match serde_json::to_value(result) {
        Ok(value) => Response::result(id, value),
        Err(e) => Response::error(
            id,
            RpcError {
                code: proto::CODE_INTERNAL,
                message: format!("result serialization: {e}"),
                data: None,
            },
        ),
    }
}

fn err(id: u64, e: &Error) -> Response {
    Response::error(id, RpcError::from(e))
}

fn running_state_view(pid: Pid) -> proto::StateView {
    proto::StateView {
        pid: pid.as_raw(),
        running: true,
        exited: false,
        halted: false,
        current_goroutine: None,
        stop_place: None,
    }
}

fn state_view(debugger: &Debugger, pid: Pid) -> proto::StateView {
    use crate::debugger::debugee::ExecutionStatus;
    let status = debugger.execution_status();
    let stop_place = (status == ExecutionStatus::InProgress)
        .then(|| {
            let location = debugger.exploration_ctx().location();
            debugger
                .backtrace(location.pid)
                .ok()
                .and_then(|bt| bt.first().and_then(|f| f.place.clone()))
                .map(|p| proto::place_view(&p))
        })
        .flatten();

    proto::StateView {
        pid: pid.as_raw(),
        running: false,
        exited: status == ExecutionStatus::Exited,
        halted: status == ExecutionStatus::InProgress,
        current_goroutine: debugger.current_goroutine_id(),
        stop_place,
    }
}

impl RpcHandler {
    pub fn new(
        worker: Arc<DebuggerWorker>,
        running: Arc<AtomicBool>,
        tracee_pid: Pid,
        multiclient: bool,
    ) -> Self {
        Self {
            worker,
            running,
            tracee_pid,
            multiclient,
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        let id = request.id;
        debug!(target: "server", "dispatch method {}", request.method);

        // friendlier aliases map onto the canonical method set
        let method = match request.method.as_str() {
            "c" => "continue",
            "n" => "next",
            "s" => "step",
            "si" => "step_instruction",
            "b" | "break" => "create_breakpoint",
            "watch" => "create_watchpoint",
            "bt" => "stacktrace",
            "p" => "eval",
            "set" => "set_variable",
            "x" => "examine_memory",
            other => other,
        };

        match method {
            // ------------------------------ out of queue ------------------------------------------
            "halt" => match Debugger::halt(self.tracee_pid) {
                Ok(()) => ok(id, json!({})),
                Err(e) => err(id, &e),
            },
            "state_nonblocking" => {
                if self.running.load(Ordering::SeqCst) {
                    return ok(id, running_state_view(self.tracee_pid));
                }
                let pid = self.tracee_pid;
                match self.worker.with_debugger(move |d| state_view(d, pid)) {
                    Ok(view) => ok(id, view),
                    Err(e) => err(id, &e),
                }
            }
            "is_multiclient" => ok(id, json!({ "multiclient": self.multiclient })),
            "process_pid" => ok(id, json!({ "pid": self.tracee_pid.as_raw() })),

            // ------------------------------ unsupported subsystems --------------------------------
            "core_dump_start" | "core_dump_wait" | "core_dump_cancel" => {
                err(id, &Error::Unsupported("core dump mode is not supported"))
            }
            "record" | "rewind" | "reverse_next" | "reverse_step" | "reverse_continue" => {
                err(id, &Error::Unsupported("record and replay is not supported"))
            }
            "ebpf_trace" => err(id, &Error::Unsupported("ebpf tracing is not supported")),
            "attach" | "spawn" => err(
                id,
                &Error::Unsupported("the tracee is chosen at server startup"),
            ),

            // ------------------------------ everything else ---------------------------------------
            _ => {
                let resumes = matches!(
                    method,
                    "continue"
                        | "next"
                        | "step"
                        | "step_out"
                        | "step_instruction"
                        | "call"
                        | "restart"
                        | "eval"
                );
                if resumes {
                    self.running.store(true, Ordering::SeqCst);
                }

                let method = method.to_string();
                let params = request.params;
                let tracee_pid = self.tracee_pid;
                let response = self
                    .worker
                    .with_debugger(move |debugger| {
                        dispatch_core(debugger, id, &method, params, tracee_pid)
                    })
                    .unwrap_or_else(|e| err(id, &e));

                if resumes {
                    self.running.store(false, Ordering::SeqCst);
                }
                response
            }
        }
    }
}

fn dispatch_core(
    debugger: &mut Debugger,
    id: u64,
    method: &str,
    params: Json,
    tracee_pid: Pid,
) -> Response {
    macro_rules! run {
        ($res: expr) => {
            match $res {
                Ok(value) => value,
                Err(e) => return err(id, &e),
            }
        };
    }
    macro_rules! params {
        ($ty: ty) => {
            match parse_params::<$ty>(params) {
                Ok(p) => p,
                Err(e) => return Response::error(id, e),
            }
        };
    }

    match method {
        "state" => ok(id, state_view(debugger, tracee_pid)),

        // ------------------------------ run control -----------------------------------------------
        "continue" => {
            run!(debugger.continue_debugee());
            ok(id, state_view(debugger, tracee_pid))
        }
        "next" => {
            run!(debugger.step_over());
            ok(id, state_view(debugger, tracee_pid))
        }
        "step" => {
            run!(debugger.step_into());
            ok(id, state_view(debugger, tracee_pid))
        }
        "step_out" => {
            run!(debugger.step_out());
            ok(id, state_view(debugger, tracee_pid))
        }
        "step_instruction" => {
            run!(debugger.step_instruction());
            ok(id, state_view(debugger, tracee_pid))
        }
        "call" => {
            let p = params!(proto::CallParams);
            if !p.unsafe_call {
                return err(
                    id,
                    &Error::from(crate::debugger::call::CallError::UnsafeNotEnabled),
                );
            }
            let results = run!(debugger.evaluate_expression(&p.expression, true));
            let views: Vec<_> = results.iter().map(proto::query_result_view).collect();
            ok(id, views)
        }
        "detach" => {
            let p = params!(proto::DetachParams);
            run!(debugger.detach(p.kill));
            ok(id, json!({}))
        }
        "restart" => {
            let _ = params!(proto::RestartParams);
            let pid = run!(debugger.restart());
            ok(id, json!({ "pid": pid.as_raw() }))
        }

        // ------------------------------ breakpoints -----------------------------------------------
        "create_breakpoint" => {
            let p = params!(proto::LocationParams);
            let loc = run!(parse_location(&p.location));
            let numbers = run!(debugger.create_breakpoint(&loc));
            let views: Vec<_> = numbers
                .iter()
                .filter_map(|&num| {
                    let hits = debugger.breakpoint_goroutine_hits(num);
                    debugger
                        .breakpoints
                        .get(num)
                        .map(|b| proto::breakpoint_view(b, hits))
                })
                .collect();
            ok(id, views)
        }
        "list_breakpoints" => {
            let views: Vec<_> = debugger
                .breakpoints()
                .into_iter()
                .map(|b| {
                    let hits = debugger.breakpoint_goroutine_hits(b.number);
                    proto::breakpoint_view(b, hits)
                })
                .collect();
            ok(id, views)
        }
        "amend_breakpoint" => {
            let p = params!(proto::AmendBreakpointParams);
            run!(debugger.amend_breakpoint(
                p.id,
                p.name,
                p.condition,
                p.hit_condition,
                p.tracepoint,
                p.tracepoint_actions,
            ));
            ok(id, json!({}))
        }
        "clear_breakpoint" => {
            let p = params!(proto::BreakpointIdParams);
            run!(debugger.remove_breakpoint(p.id));
            ok(id, json!({}))
        }
        "toggle_breakpoint" => {
            let p = params!(proto::BreakpointIdParams);
            let enabled = run!(debugger.toggle_breakpoint(p.id));
            ok(id, json!({ "enabled": enabled }))
        }
        "create_watchpoint" => {
            let p = params!(proto::CreateWatchpointParams);
            let condition = match p.mode.as_deref() {
                None | Some("w") => BreakCondition::DataWrites,
                Some("rw") => BreakCondition::DataReadsWrites,
                Some(other) => {
                    return Response::error(
                        id,
                        RpcError {
                            code: proto::CODE_BAD_REQUEST,
                            message: format!("unknown watch mode: {other}"),
                            data: None,
                        },
                    )
                }
            };
            let number = run!(debugger.create_watchpoint(&p.expression, condition));
            let view = debugger
                .watchpoints()
                .iter()
                .find(|wp| wp.number == number)
                .map(proto::watchpoint_view);
            ok(id, view)
        }
        "list_watchpoints" => {
            let views: Vec<_> = debugger
                .watchpoints()
                .iter()
                .map(proto::watchpoint_view)
                .collect();
            ok(id, views)
        }
        "clear_watchpoint" => {
            let p = params!(proto::BreakpointIdParams);
            run!(debugger.remove_watchpoint(p.id));
            ok(id, json!({}))
        }

        // ------------------------------ threads and goroutines ------------------------------------
        "list_threads" => {
            let threads = run!(debugger.thread_state());
            let views: Vec<_> = threads
                .iter()
                .map(|t| {
                    let goroutine = debugger.goroutine_of_thread(t.thread.pid);
                    proto::thread_view(t, goroutine)
                })
                .collect();
            ok(id, views)
        }
        "switch_thread" => {
            let p = params!(proto::SwitchThreadParams);
            run!(debugger.set_thread_into_focus(p.number));
            ok(id, json!({}))
        }
        "list_goroutines" => {
            let p = params!(proto::ListGoroutinesParams);
            let filters: Vec<GoroutineFilter> = p
                .filters
                .into_iter()
                .map(|f| match f {
                    proto::GoroutineFilterParam::Running => GoroutineFilter::Running,
                    proto::GoroutineFilterParam::Parked => GoroutineFilter::Parked,
                    proto::GoroutineFilterParam::Waiting => GoroutineFilter::Waiting,
                    proto::GoroutineFilterParam::UserOnly => GoroutineFilter::UserOnly,
                    proto::GoroutineFilterParam::RuntimeOnly => GoroutineFilter::RuntimeOnly,
                    proto::GoroutineFilterParam::WaitReason(r) => GoroutineFilter::WaitReason(r),
                    proto::GoroutineFilterParam::StartFunc(f) => GoroutineFilter::StartFunc(f),
                })
                .collect();

            let groups = match p.group_by.as_deref() {
                None => None,
                Some(key) => {
                    let key = match key {
                        "status" => GroupBy::Status,
                        "wait_reason" => GroupBy::WaitReason,
                        "start_func" => GroupBy::StartFunc,
                        other => {
                            return Response::error(
                                id,
                                RpcError {
                                    code: proto::CODE_BAD_REQUEST,
                                    message: format!("unknown group key: {other}"),
                                    data: None,
                                },
                            )
                        }
                    };
                    Some(run!(debugger.goroutines_grouped(&filters, key)))
                }
            };

            let all = run!(debugger.goroutines(&filters));
            let total = all.len();
            let page: Vec<_> = all
                .iter()
                .skip(p.start)
                .take(if p.count == 0 { usize::MAX } else { p.count })
                .map(proto::goroutine_view)
                .collect();
            ok(
                id,
                proto::ListGoroutinesResult {
                    goroutines: page,
                    total,
                    groups,
                },
            )
        }
        "switch_goroutine" => {
            let p = params!(proto::SwitchGoroutineParams);
            run!(debugger.switch_goroutine(p.id));
            ok(id, json!({}))
        }
        "ancestors" => {
            let p = params!(proto::AncestorsParams);
            let ancestors = run!(debugger.goroutine_ancestors(p.id, p.depth));
            let views: Vec<_> = ancestors.iter().map(proto::goroutine_view).collect();
            ok(id, views)
        }

        // ------------------------------ inspection ------------------------------------------------
        "stacktrace" => {
            let p = params!(proto::StacktraceParams);
            let frames = match p.goroutine {
                Some(goid) => run!(debugger.goroutine_backtrace(goid)),
                None => {
                    let pid = debugger.exploration_ctx().pid_on_focus();
                    run!(debugger.backtrace_extended(pid, p.depth))
                }
            };
            let views: Vec<_> = frames.iter().map(proto::frame_view).collect();
            ok(id, views)
        }
        "list_locals" => {
            let values = run!(debugger.read_local_variables());
            let views: Vec<_> = values.iter().map(proto::query_result_view).collect();
            ok(id, views)
        }
        "list_args" => {
            let values = run!(debugger.read_arguments());
            let views: Vec<_> = values.iter().map(proto::query_result_view).collect();
            ok(id, views)
        }
        "list_package_vars" => {
            let p = params!(proto::FilterParams);
            let values = run!(debugger.read_package_variables(p.filter.as_deref()));
            let views: Vec<_> = values.iter().map(proto::query_result_view).collect();
            ok(id, views)
        }
        "eval" => {
            let p = params!(proto::EvalParams);
            let saved_config = debugger.load_config();
            if let Some(config) = p.load_config {
                debugger.set_load_config(config.apply(saved_config));
            }
            let result = debugger.evaluate_expression(&p.expression, p.unsafe_call);
            debugger.set_load_config(saved_config);
            let results = run!(result);
            let views: Vec<_> = results.iter().map(proto::query_result_view).collect();
            ok(id, views)
        }
        "set_variable" => {
            let p = params!(proto::SetVariableParams);
            run!(debugger.set_variable(&p.lvalue, &p.rvalue));
            ok(id, json!({}))
        }
        "registers" => {
            let map = run!(debugger.current_registers());
            let views: Vec<_> = map
                .snapshot()
                .into_iter()
                .map(|(reg, value)| proto::RegisterView {
                    name: reg.to_string(),
                    value,
                })
                .collect();
            ok(id, views)
        }

        // ------------------------------ symbols ---------------------------------------------------
        "list_sources" => {
            let p = params!(proto::FilterParams);
            let files = run!(debugger.known_files(p.filter.as_deref()));
            let views: Vec<_> = files
                .iter()
                .map(|f| f.to_string_lossy().to_string())
                .collect();
            ok(id, views)
        }
        "list_functions" => {
            let p = params!(proto::FilterParams);
            ok(id, run!(debugger.known_functions(p.filter.as_deref())))
        }
        "list_types" => {
            let p = params!(proto::FilterParams);
            ok(id, run!(debugger.known_types(p.filter.as_deref())))
        }
        "find_location" => {
            let p = params!(proto::LocationParams);
            let loc = run!(parse_location(&p.location));
            let resolved = run!(debugger.resolve_location(&loc));
            let views: Vec<_> = resolved
                .iter()
                .map(|r| proto::LocationView {
                    address: r.addr.as_usize(),
                    function: r.fn_name.clone(),
                    place: r.place.as_ref().map(proto::place_view),
                })
                .collect();
            ok(id, views)
        }
        "find_symbol" => {
            let p = params!(proto::FilterParams);
            let symbols = run!(debugger.find_symbols(p.filter.as_deref().unwrap_or("")));
            let views: Vec<_> = symbols
                .iter()
                .map(|s| proto::SymbolView {
                    name: s.name.clone(),
                    address: s.addr,
                    size: s.size,
                })
                .collect();
            ok(id, views)
        }
        "disassemble" => {
            let p = params!(proto::DisassembleParams);
            let instructions = match (p.address, p.length) {
                (Some(addr), Some(len)) => run!(debugger.disasm_range(addr, len)),
                _ => run!(debugger.disasm()).instructions,
            };
            let views: Vec<_> = instructions
                .iter()
                .map(|ins| proto::InstructionView {
                    address: ins.address.as_usize(),
                    mnemonic: ins.mnemonic.clone().unwrap_or_default(),
                    operands: ins.operands.clone().unwrap_or_default(),
                })
                .collect();
            ok(id, views)
        }

        // ------------------------------ memory ----------------------------------------------------
        "examine_memory" => {
            let p = params!(proto::ExamineMemoryParams);
            let data = run!(debugger.read_memory(p.address, p.length));
            ok(id, json!({ "data": data }))
        }

        // ------------------------------ meta ------------------------------------------------------
        "build_id" => ok(id, json!({ "build_id": debugger.build_id() })),
        "list_dynamic_libraries" => {
            let views: Vec<_> = debugger
                .shared_libs()
                .iter()
                .map(proto::region_view)
                .collect();
            ok(id, views)
        }
        "follow_exec" => {
            let p = params!(proto::FollowExecParams);
            run!(debugger.set_follow_exec(p.enable, p.regex));
            ok(id, json!({}))
        }
        "get_debug_info_dirs" => {
            let dirs: Vec<_> = debugger
                .debug_info_dirs()
                .iter()
                .map(|d| d.to_string_lossy().to_string())
                .collect();
            ok(id, dirs)
        }
        "set_debug_info_dirs" => {
            let p = params!(proto::DebugInfoDirsParams);
            debugger.set_debug_info_dirs(p.dirs.into_iter().map(PathBuf::from).collect());
            ok(id, json!({}))
        }
        "guess_substitute_path" => {
            let p = params!(proto::GuessSubstitutePathParams);
            let hints: Vec<(String, PathBuf)> = p
                .hints
                .into_iter()
                .map(|(module, dir)| (module, PathBuf::from(dir)))
                .collect();
            let rules = run!(debugger.guess_substitute_path(&hints));
            let views: HashMap<String, String> = rules
                .into_iter()
                .map(|r| {
                    (
                        r.from.to_string_lossy().to_string(),
                        r.to.to_string_lossy().to_string(),
                    )
                })
                .collect();
            ok(id, views)
        }

        unknown => Response::error(
            id,
            RpcError {
                code: proto::CODE_BAD_REQUEST,
                message: format!("unknown method: {unknown}"),
                data: None,
            },
        ),
    }
}

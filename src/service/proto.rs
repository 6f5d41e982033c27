//! Wire level types of the service protocol.
//!
//! Messages are UTF-8 JSON objects framed with a `Content-Length` header. A request
//! carries an integer id, a method name and a single structured parameter; a
//! response carries the matching id and either a result or an error object.

use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::call::CallError;
use crate::debugger::debugee::{RegionInfo, ThreadSnapshot};
use crate::debugger::error::Error;
use crate::debugger::goroutine::Goroutine;
use crate::debugger::variable::execute::QueryResult;
use crate::debugger::variable::{Value, ValueRepr};
use crate::debugger::watchpoint::Watchpoint;
use crate::debugger::ExtendedFrame;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn result(id: u64, result: Json) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: RpcError) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Json>,
}

// error codes of the wire protocol
pub const CODE_BAD_REQUEST: i64 = 1;
pub const CODE_NOT_STOPPED: i64 = 2;
pub const CODE_TRACEE_GONE: i64 = 3;
pub const CODE_OS_ERROR: i64 = 4;
pub const CODE_NO_DEBUG_INFO: i64 = 5;
pub const CODE_SYMBOL: i64 = 6;
pub const CODE_WATCHPOINT: i64 = 7;
pub const CODE_EVAL: i64 = 8;
pub const CODE_INJECTED_CALL: i64 = 9;
pub const CODE_UNSUPPORTED: i64 = 10;
pub const CODE_PROCESS_EXIT: i64 = 11;
pub const CODE_INTERNAL: i64 = 100;

impl From<&Error> for RpcError {
    fn from(e: &Error) -> Self {
        let code = match e {
            Error::Unsupported(_) => CODE_UNSUPPORTED,
            Error::NotStopped(_) | Error::AlreadyHalted | Error::AlreadyRun => CODE_NOT_STOPPED,
            Error::TraceeGone | Error::AttachedProcessNotFound(_) => CODE_TRACEE_GONE,
            Error::Ptrace(_) | Error::Waitpid(_) | Error::Syscall(_, _) | Error::Attach(_) => {
                CODE_OS_ERROR
            }
            Error::NoDebugInformation(_) | Error::DwarfParsing(_) | Error::ObjParsing(_) => {
                CODE_NO_DEBUG_INFO
            }
            Error::SymbolNotFound(_)
            | Error::AmbiguousSymbol(_, _)
            | Error::PlaceNotFound(_)
            | Error::FunctionNotFound(_)
            | Error::NoSuitablePlace
            | Error::GoroutineNotFound(_)
            | Error::BreakpointNotFound(_)
            | Error::FrameNotFound(_)
            | Error::TraceeNotFound(_) => CODE_SYMBOL,
            Error::OutOfWatchpointSlots
            | Error::WatchpointWrongSize
            | Error::WatchpointUndefinedSize
            | Error::AddressAlreadyObserved
            | Error::WatchSubjectNotFound => CODE_WATCHPOINT,
            Error::Unassignable(_)
            | Error::TypeMismatch { .. }
            | Error::ExpressionParsing(_)
            | Error::LocationParsing(_)
            | Error::TypeNotFound => CODE_EVAL,
            Error::InjectedCall(CallError::UnsafeNotEnabled) => CODE_UNSUPPORTED,
            Error::InjectedCall(_) => CODE_INJECTED_CALL,
            Error::ProcessExit(_) | Error::ProcessNotStarted => CODE_PROCESS_EXIT,
            _ => CODE_INTERNAL,
        };
        RpcError {
            code,
            message: format!("{e:#}"),
            data: None,
        }
    }
}

// ---------------------------------- method parameters --------------------------------------------

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EmptyParams {}

#[derive(Debug, Deserialize, Serialize)]
pub struct LocationParams {
    pub location: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BreakpointIdParams {
    pub id: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AmendBreakpointParams {
    pub id: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub tracepoint: Option<bool>,
    #[serde(default)]
    pub tracepoint_actions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateWatchpointParams {
    pub expression: String,
    /// "w" for write, "rw" for read-write
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EvalParams {
    pub expression: String,
    #[serde(default)]
    pub unsafe_call: bool,
    #[serde(default)]
    pub load_config: Option<LoadConfigParams>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LoadConfigParams {
    #[serde(default)]
    pub max_string_len: Option<usize>,
    #[serde(default)]
    pub max_array_values: Option<usize>,
    #[serde(default)]
    pub max_variable_recurse: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SetVariableParams {
    pub lvalue: String,
    pub rvalue: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StacktraceParams {
    #[serde(default)]
    pub goroutine: Option<u64>,
    #[serde(default)]
    pub depth: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SwitchThreadParams {
    pub number: u32,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SwitchGoroutineParams {
    pub id: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AncestorsParams {
    pub id: u64,
    #[serde(default = "default_ancestor_depth")]
    pub depth: usize,
}

fn default_ancestor_depth() -> usize {
    10
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ListGoroutinesParams {
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub filters: Vec<GoroutineFilterParam>,
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "kind", content = "arg", rename_all = "snake_case")]
pub enum GoroutineFilterParam {
    Running,
    Parked,
    Waiting,
    UserOnly,
    RuntimeOnly,
    WaitReason(String),
    StartFunc(String),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FilterParams {
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ExamineMemoryParams {
    pub address: usize,
    pub length: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DisassembleParams {
    #[serde(default)]
    pub address: Option<usize>,
    #[serde(default)]
    pub length: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DetachParams {
    #[serde(default)]
    pub kill: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RestartParams {
    #[serde(default)]
    pub rebuild: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FollowExecParams {
    pub enable: bool,
    #[serde(default)]
    pub regex: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DebugInfoDirsParams {
    pub dirs: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GuessSubstitutePathParams {
    /// Module name to a local directory hints.
    pub hints: Vec<(String, String)>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CallParams {
    pub expression: String,
    #[serde(default)]
    pub unsafe_call: bool,
}

// ---------------------------------- method results -----------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StateView {
    pub pid: i32,
    pub running: bool,
    pub exited: bool,
    pub halted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_goroutine: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_place: Option<PlaceView>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PlaceView {
    pub file: String,
    pub line: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BreakpointView {
    pub id: u32,
    pub logical_id: u32,
    pub address: usize,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place: Option<PlaceView>,
    pub hit_count: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub goroutine_hits: HashMap<u64, u64>,
    pub tracepoint: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WatchpointView {
    pub id: u32,
    pub expression: String,
    pub address: usize,
    pub size: usize,
    pub frame_scoped: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadView {
    pub pid: i32,
    pub number: u32,
    pub in_focus: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place: Option<PlaceView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goroutine: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoroutineView {
    pub id: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    pub pc: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_fn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<i32>,
    pub user: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListGoroutinesResult {
    pub goroutines: Vec<GoroutineView>,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<HashMap<String, usize>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FrameView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub ip: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place: Option<PlaceView>,
    pub inlined: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub r#type: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<usize>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unreadable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escaped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ValueView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterView {
    pub name: String,
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SymbolView {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LocationView {
    pub address: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub place: Option<PlaceView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstructionView {
    pub address: usize,
    pub mnemonic: String,
    pub operands: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SharedLibView {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    pub has_debug_info: bool,
}

/// An unsolicited server-to-client message about a debugee state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    BreakpointHit {
        id: u32,
        pc: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        place: Option<PlaceView>,
    },
    WatchpointHit {
        id: u32,
        pc: usize,
    },
    Step {
        pc: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        place: Option<PlaceView>,
    },
    Signal {
        signal: String,
    },
    Tracepoint {
        id: u32,
        values: Vec<ValueView>,
    },
    Exited {
        code: i32,
    },
}

// ---------------------------------- view builders ------------------------------------------------

pub fn place_view(place: &crate::debugger::PlaceDescriptorOwned) -> PlaceView {
    PlaceView {
        file: place.file.to_string_lossy().to_string(),
        line: place.line_number,
        column: Some(place.column_number),
    }
}

pub fn breakpoint_view(brkpt: &Breakpoint, goroutine_hits: HashMap<u64, u64>) -> BreakpointView {
    BreakpointView {
        id: brkpt.number,
        logical_id: brkpt.logical_number,
        address: brkpt.addr.as_usize(),
        enabled: brkpt.is_user_enabled(),
        name: brkpt.name.clone(),
        place: brkpt.place.as_ref().map(place_view),
        hit_count: brkpt.hit_count(),
        goroutine_hits,
        tracepoint: brkpt.is_tracepoint,
    }
}

pub fn watchpoint_view(wp: &Watchpoint) -> WatchpointView {
    WatchpointView {
        id: wp.number,
        expression: wp.source_string.clone(),
        address: wp.address().as_usize(),
        size: wp.size().in_bytes(),
        frame_scoped: matches!(
            wp.scope,
            crate::debugger::watchpoint::WatchpointScope::Frame { .. }
        ),
    }
}

pub fn thread_view(snapshot: &ThreadSnapshot, goroutine: Option<u64>) -> ThreadView {
    ThreadView {
        pid: snapshot.thread.pid.as_raw(),
        number: snapshot.thread.number,
        in_focus: snapshot.in_focus,
        place: snapshot.place.as_ref().map(place_view),
        goroutine,
    }
}

pub fn goroutine_view(g: &Goroutine) -> GoroutineView {
    GoroutineView {
        id: g.id,
        status: g.status.render(),
        wait_reason: g.wait_reason.clone(),
        pc: g.pc.as_usize(),
        start_fn: g.start_fn.clone(),
        parent_id: g.parent_id,
        thread: g.thread.map(|t| t.as_raw()),
        user: g.is_user(),
    }
}

pub fn frame_view(frame: &ExtendedFrame) -> FrameView {
    FrameView {
        function: frame.func_name.clone(),
        ip: frame.ip.as_usize(),
        place: frame.place.as_ref().map(place_view),
        inlined: frame.inlined,
    }
}

pub fn region_view(region: &RegionInfo) -> SharedLibView {
    SharedLibView {
        path: region.path.to_string_lossy().to_string(),
        offset: region.offset,
        has_debug_info: region.has_debug_info,
    }
}

pub fn query_result_view(result: &QueryResult) -> ValueView {
    let mut view = value_view(&result.value);
    view.name = result.name.clone();
    view
}

/// Render a loaded value into its wire representation.
pub fn value_view(value: &Value) -> ValueView {
    let (rendered, children) = render_value(value);
    ValueView {
        name: None,
        r#type: value.type_ident.name_fmt().to_string(),
        value: rendered,
        address: value.address,
        unreadable: value.flags.unreadable,
        truncated: value.flags.truncated,
        escaped: value.flags.escaped,
        children,
    }
}

fn render_value(value: &Value) -> (String, Vec<ValueView>) {
    match &value.repr {
        ValueRepr::Scalar(Some(scalar)) => (scalar.to_string(), vec![]),
        ValueRepr::Scalar(None) => ("<unreadable>".to_string(), vec![]),
        ValueRepr::String { value, .. } => (format!("\"{value}\""), vec![]),
        ValueRepr::Slice { items, len, cap, .. } => {
            let children = items.iter().map(value_view).collect();
            (format!("len: {len}, cap: {cap}"), children)
        }
        ValueRepr::Array { items } => {
            let children: Vec<_> = items.iter().map(value_view).collect();
            (format!("len: {}", children.len()), children)
        }
        ValueRepr::Struct { fields } => {
            let children = fields
                .iter()
                .map(|(name, val)| {
                    let mut view = value_view(val);
                    view.name = Some(name.clone());
                    view
                })
                .collect();
            (String::new(), children)
        }
        ValueRepr::Pointer { value: ptr, .. } => (
            ptr.map(|p| format!("{p:#x}")).unwrap_or_else(|| "nil".to_string()),
            vec![],
        ),
        ValueRepr::Interface {
            concrete_type,
            value,
            ..
        } => {
            let children = value.iter().map(|v| value_view(v.as_ref())).collect();
            (
                concrete_type
                    .clone()
                    .unwrap_or_else(|| "nil".to_string()),
                children,
            )
        }
        ValueRepr::Map { pairs, len } => {
            let mut children = vec![];
            for (key, val) in pairs {
                let mut key_view = value_view(key);
                key_view.name = Some("key".to_string());
                let mut val_view = value_view(val);
                val_view.name = Some("value".to_string());
                children.push(key_view);
                children.push(val_view);
            }
            (format!("len: {len}"), children)
        }
        ValueRepr::Chan {
            qcount,
            dataqsiz,
            closed,
        } => (
            format!("chan {}/{}{}", qcount, dataqsiz, if *closed { " (closed)" } else { "" }),
            vec![],
        ),
        ValueRepr::Func { name, addr } => (
            name.clone()
                .or_else(|| addr.map(|a| format!("{a:#x}")))
                .unwrap_or_else(|| "nil".to_string()),
            vec![],
        ),
        ValueRepr::Raw(bytes) => (format!("{} raw bytes", bytes.len()), vec![]),
    }
}

impl LoadConfigParams {
    pub fn apply(&self, base: crate::debugger::variable::LoadConfig) -> crate::debugger::variable::LoadConfig {
        crate::debugger::variable::LoadConfig {
            max_string_len: self.max_string_len.unwrap_or(base.max_string_len),
            max_array_values: self.max_array_values.unwrap_or(base.max_array_values),
            max_recursion: self.max_variable_recurse.unwrap_or(base.max_recursion),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let json = r#"{"id":7,"method":"create_breakpoint","params":{"location":"main.go:12"}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.id, 7);
        assert_eq!(req.method, "create_breakpoint");
        let params: LocationParams = serde_json::from_value(req.params).unwrap();
        assert_eq!(params.location, "main.go:12");
    }

    #[test]
    fn test_response_skips_empty_fields() {
        let resp = Response::result(1, serde_json::json!({"ok": true}));
        let encoded = serde_json::to_string(&resp).unwrap();
        assert!(!encoded.contains("error"));

        let resp = Response::error(
            2,
            RpcError {
                code: CODE_BAD_REQUEST,
                message: "unknown method".to_string(),
                data: None,
            },
        );
        let encoded = serde_json::to_string(&resp).unwrap();
        assert!(!encoded.contains("result"));
        assert!(encoded.contains("unknown method"));
    }

    #[test]
    fn test_goroutine_filter_param() {
        let json = r#"[{"kind":"running"},{"kind":"wait_reason","arg":"select"}]"#;
        let filters: Vec<GoroutineFilterParam> = serde_json::from_str(json).unwrap();
        assert_eq!(filters.len(), 2);
        assert!(matches!(filters[0], GoroutineFilterParam::Running));
        assert!(matches!(filters[1], GoroutineFilterParam::WaitReason(ref r) if r == "select"));
    }
}

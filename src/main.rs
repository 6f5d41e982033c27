//! Headless debugger backend entry point.

use clap::{Parser, Subcommand};
use godbg::debugger::error::Error;
use godbg::debugger::process::{Child, StdStreams};
use godbg::debugger::variable::LoadConfig;
use godbg::debugger::{Debugger, DebuggerBuilder};
use godbg::service::worker::DebuggerWorker;
use godbg::service::{Server, ServerConfig};
use log::error;
use nix::unistd::Pid;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::exit;

// categorized startup failures
const EXIT_BAD_EXECUTABLE: i32 = 2;
const EXIT_ATTACH_FAILED: i32 = 3;
const EXIT_BAD_DEBUG_INFO: i32 = 4;
const EXIT_BIND_FAILED: i32 = 5;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Listen address of the service, e.g. 127.0.0.1:4711
    #[arg(long, global = true, default_value = "127.0.0.1:4711")]
    listen: String,

    /// Run as a headless server (the only supported mode)
    #[arg(long, global = true, default_value_t = true)]
    headless: bool,

    /// Accept multiple clients sharing the debugger state
    #[arg(long, global = true)]
    accept_multiclient: bool,

    /// Resume the tracee when the last client disconnects
    #[arg(long, global = true)]
    continue_on_disconnect: bool,

    /// Directory searched for separate debug information files (repeatable)
    #[arg(long = "debug-info-dir", global = true)]
    debug_info_dirs: Vec<PathBuf>,

    /// Maximum string length loaded by the expression evaluator
    #[arg(long, global = true, default_value_t = 64)]
    max_string_len: usize,

    /// Maximum array/slice elements loaded by the expression evaluator
    #[arg(long, global = true, default_value_t = 64)]
    max_array_values: usize,

    /// Maximum recursion depth of composite value loading
    #[arg(long, global = true, default_value_t = 1)]
    max_variable_recurse: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn a program under the debugger
    Exec {
        /// Executable file (debugee)
        debugee: String,

        /// Connect tracee standard streams to the given terminal device
        #[arg(long)]
        tty: Option<PathBuf>,

        /// Redirect tracee standard streams: stdin=path,stdout=path,stderr=path
        #[arg(short = 'r', long)]
        redirect: Option<String>,

        /// Arguments are passed to debugee
        #[arg(raw(true))]
        args: Vec<String>,
    },
    /// Attach to a running process
    Attach {
        /// Process id
        pid: i32,
    },
}

fn parse_redirects(spec: &str, streams: &mut StdStreams) -> Result<(), String> {
    for part in spec.split(',') {
        let (name, path) = part
            .split_once('=')
            .ok_or_else(|| format!("bad redirect: {part}"))?;
        let path = PathBuf::from(path);
        match name {
            "stdin" => streams.stdin_file = Some(path),
            "stdout" => streams.stdout_file = Some(path),
            "stderr" => streams.stderr_file = Some(path),
            _ => return Err(format!("unknown stream: {name}")),
        }
    }
    Ok(())
}

fn startup_exit_code(e: &Error) -> i32 {
    match e {
        Error::Attach(_) | Error::AttachedProcessNotFound(_) => EXIT_ATTACH_FAILED,
        Error::DwarfParsing(_) | Error::ObjParsing(_) | Error::NoDebugInformation(_) => {
            EXIT_BAD_DEBUG_INFO
        }
        _ => EXIT_BAD_EXECUTABLE,
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let load_config = LoadConfig {
        max_string_len: args.max_string_len,
        max_array_values: args.max_array_values,
        max_recursion: args.max_variable_recurse,
    };

    let (bus, hook) = Server::event_channel();
    let builder = DebuggerBuilder::new()
        .with_hooks(hook)
        .with_load_config(load_config)
        .with_debug_info_dirs(if args.debug_info_dirs.is_empty() {
            vec![PathBuf::from("/usr/lib/debug")]
        } else {
            args.debug_info_dirs.clone()
        });

    // the whole debugger lives on the pinned worker thread: the kernel expects every
    // tracing request to come from the thread that attached to the tracee
    let spawn_result = match args.command {
        Command::Exec {
            debugee,
            tty,
            redirect,
            args: debugee_args,
        } => {
            let mut streams = StdStreams {
                tty,
                ..Default::default()
            };
            if let Some(ref spec) = redirect {
                if let Err(e) = parse_redirects(spec, &mut streams) {
                    error!("{e}");
                    exit(EXIT_BAD_EXECUTABLE);
                }
            }

            DebuggerWorker::spawn(move || {
                let template = Child::new(&debugee, debugee_args, streams);
                let process = template.install()?;
                let mut debugger = builder.build(process)?;
                debugger.start_debugee()?;
                Ok(debugger)
            })
        }
        Command::Attach { pid } => DebuggerWorker::spawn(move || {
            let process = Child::from_external(Pid::from_raw(pid))?;
            builder.build_attached(process)
        }),
    };

    let (worker, tracee_pid) = match spawn_result {
        Ok(ok) => ok,
        Err(e) => {
            error!("startup: {e:#}");
            exit(startup_exit_code(&e));
        }
    };

    // SIGINT halts the tracee instead of killing the server
    let _ = ctrlc::set_handler(move || {
        let _ = Debugger::halt(tracee_pid);
    });

    let listener = match TcpListener::bind(&args.listen) {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind {}: {e}", args.listen);
            exit(EXIT_BIND_FAILED);
        }
    };

    let config = ServerConfig {
        accept_multiclient: args.accept_multiclient,
        continue_on_disconnect: args.continue_on_disconnect,
    };
    let server = Server::new(worker, tracee_pid, config, bus);
    if let Err(e) = server.serve_tcp(listener) {
        error!("server: {e:#}");
        exit(1);
    }
}

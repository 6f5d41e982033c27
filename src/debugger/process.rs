use crate::debugger::error::Error;
use crate::debugger::error::Error::{Attach, AttachedProcessNotFound, Ptrace, Waitpid};
use log::warn;
use nix::fcntl::{open, OFlag};
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::SIGSTOP;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{dup2, fork, setsid, ForkResult, Pid};
use os_pipe::PipeWriter;
use std::fs;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed;

impl State for Installed {}

/// Process prepare for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// Standard stream wiring for a spawned tracee.
#[derive(Clone, Default)]
pub struct StdStreams {
    /// Terminal device that become a tracee controlling terminal,
    /// stdin/stdout/stderr connected to it.
    pub tty: Option<PathBuf>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub stderr_file: Option<PathBuf>,
}

/// Information about an already running process the debugger attached to.
#[derive(Clone)]
pub struct ExternalInfo {
    /// All thread ids of the process at attach time.
    pub threads: Vec<Pid>,
}

/// Debugee process attached to tracer with ptrace.
pub struct Child<S: State> {
    pub program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    streams: StdStreams,
    stdout: Option<PipeWriter>,
    stderr: Option<PipeWriter>,
    pid: Option<Pid>,
    external: Option<ExternalInfo>,
    _p: PhantomData<S>,
}

const TRACE_OPTIONS: Options = Options::PTRACE_O_TRACECLONE
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT);

impl Child<Template> {
    /// Create new process template, but dont start it.
    ///
    /// # Arguments
    ///
    /// * `program`: program name
    /// * `args`: program arguments
    /// * `streams`: tty or file redirections for standard streams
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<String>,
        args: ARGS,
        streams: StdStreams,
    ) -> Child<Template> {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: vec![],
            cwd: None,
            streams,
            stdout: None,
            stderr: None,
            pid: None,
            external: None,
            _p: PhantomData,
        }
    }

    /// Add environment variables visible to the new process.
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    /// Set working directory of the new process.
    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Capture tracee stdout/stderr into pipes instead of inheriting them.
    /// Ignored if a tty or file redirections are set.
    pub fn with_io_capture(mut self, stdout: PipeWriter, stderr: PipeWriter) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }
}

impl Child<Installed> {
    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.expect("pid must exists for installed process")
    }

    /// Return attach-time process information, `None` if process was spawned by debugger.
    pub fn external_info(&self) -> Option<&ExternalInfo> {
        self.external.as_ref()
    }

    /// Attach to an already running process with `PTRACE_SEIZE`, then interrupt all its threads.
    ///
    /// # Arguments
    ///
    /// * `pid`: pid of a running process
    pub fn from_external(pid: Pid) -> Result<Child<Installed>, Error> {
        let proc_dir = PathBuf::from(format!("/proc/{pid}/task"));
        if !proc_dir.exists() {
            return Err(AttachedProcessNotFound(pid));
        }

        let exe = fs::read_link(format!("/proc/{pid}/exe"))?;

        let mut threads = vec![];
        for entry in fs::read_dir(proc_dir)? {
            let tid: i32 = entry?
                .file_name()
                .to_string_lossy()
                .parse()
                .map_err(|_| AttachedProcessNotFound(pid))?;
            let tid = Pid::from_raw(tid);

            sys::ptrace::seize(tid, TRACE_OPTIONS).map_err(Attach)?;
            sys::ptrace::interrupt(tid).map_err(Attach)?;
            waitpid(tid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
            threads.push(tid);
        }

        Ok(Child {
            program: exe.to_string_lossy().to_string(),
            args: vec![],
            env: vec![],
            cwd: None,
            streams: StdStreams::default(),
            stdout: None,
            stderr: None,
            pid: Some(pid),
            external: Some(ExternalInfo { threads }),
            _p: PhantomData,
        })
    }
}

impl<S: State> Child<S> {
    /// Instantiate process by `fork()` system call with caller as a parent process.
    /// After installation child process stopped by `SIGSTOP` signal and seized by tracer.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let mut debugee_cmd = Command::new(&self.program);
        let debugee_cmd = debugee_cmd.args(&self.args).envs(self.env.iter().cloned());
        if let Some(ref cwd) = self.cwd {
            debugee_cmd.current_dir(cwd);
        }

        if self.streams.tty.is_none() && self.streams.stdout_file.is_none() {
            if let Some(ref stdout) = self.stdout {
                debugee_cmd.stdout(stdout.try_clone()?);
            }
            if let Some(ref stderr) = self.stderr {
                debugee_cmd.stderr(stderr.try_clone()?);
            }
        }

        let streams = self.streams.clone();
        unsafe {
            debugee_cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                apply_streams(&streams)?;
                Ok(())
            });
        }

        match unsafe { fork().expect("fork() error") } {
            ForkResult::Parent { child: pid } => {
                waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, TRACE_OPTIONS).map_err(Ptrace)?;

                Ok(Child {
                    program: self.program.clone(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                    cwd: self.cwd.clone(),
                    streams: self.streams.clone(),
                    stdout: self.stdout.as_ref().map(|s| s.try_clone()).transpose()?,
                    stderr: self.stderr.as_ref().map(|s| s.try_clone()).transpose()?,
                    pid: Some(pid),
                    external: None,
                    _p: PhantomData,
                })
            }
            ForkResult::Child => {
                sys::signal::raise(SIGSTOP).unwrap();
                let err = debugee_cmd.exec();
                panic!("run debugee fail with: {err}");
            }
        }
    }
}

/// Rewire standard descriptors of the forked child according to stream settings.
/// Executed between `fork` and `exec`, only async-signal-safe calls allowed here.
fn apply_streams(streams: &StdStreams) -> std::io::Result<()> {
    if let Some(ref tty) = streams.tty {
        // new session with the given terminal as a controlling one
        setsid()?;
        let fd = open(tty.as_path(), OFlag::O_RDWR, Mode::empty())?;
        if unsafe { nix::libc::ioctl(fd, nix::libc::TIOCSCTTY as _, 0) } < 0 {
            warn!(target: "debugger", "unable to set controlling terminal");
        }
        dup2(fd, 0)?;
        dup2(fd, 1)?;
        dup2(fd, 2)?;
        return Ok(());
    }

    if let Some(ref file) = streams.stdin_file {
        let fd = open(file.as_path(), OFlag::O_RDONLY, Mode::empty())?;
        dup2(fd, 0)?;
    }
    let out_flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND;
    let out_mode = Mode::from_bits_truncate(0o644);
    if let Some(ref file) = streams.stdout_file {
        let fd = open(file.as_path(), out_flags, out_mode)?;
        dup2(fd, 1)?;
    }
    if let Some(ref file) = streams.stderr_file {
        let fd = open(file.as_path(), out_flags, out_mode)?;
        dup2(fd, 2)?;
    }
    Ok(())
}

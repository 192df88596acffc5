//! # Command Runner
//!
//! Every external tool (gn, ninja, adb, the emulator, the profiling and
//! benchmark harnesses) is described as an [`Invocation`] and handed to a
//! [`Runner`]. An invocation records the argv, the working directory, extra
//! environment variables and two policies:
//!
//! - `capture`: collect stdout and stderr (interleaved) into
//!   [`Output::text`]. Without it the child inherits the terminal.
//! - `check`: a non-zero exit becomes [`Error::Failed`]. Unchecked
//!   invocations hand back the exit code instead.

use std::{
    ffi::OsString,
    fmt::{self, Display},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to kill {command}: {source}")]
    Kill {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed ({})", describe_exit(.code))]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

impl Error {
    /// Whatever the failing command printed, if it was captured.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::Failed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    capture: bool,
    check: bool,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            capture: false,
            check: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.check = false;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// The argv, lossily converted. Handy for matching in tests and logs.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy().into_owned())
            .collect()
    }

    fn expression(&self) -> duct::Expression {
        let mut expr = duct::cmd(self.program.clone(), self.args.iter().cloned()).unchecked();
        if let Some(dir) = &self.cwd {
            expr = expr.dir(dir.clone());
        }
        for (key, value) in &self.envs {
            expr = expr.env(key.clone(), value.clone());
        }
        expr
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.argv().join(" "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub text: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            text: text.into(),
        }
    }

    pub fn exit(code: i32, text: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            text: text.into(),
        }
    }
}

/// A process started by [`Runner::launch`]. Dropping it leaves the process
/// running.
pub trait Process {
    /// Kills and reaps the process. Killing one that already exited is fine.
    fn kill(&self) -> Result<(), Error>;
}

struct Launched {
    command: String,
    handle: duct::Handle,
}

impl Process for Launched {
    fn kill(&self) -> Result<(), Error> {
        log::debug!("killing {}", self.command);
        self.handle.kill().map_err(|source| Error::Kill {
            command: self.command.clone(),
            source,
        })
    }
}

pub trait Runner {
    /// Runs to completion.
    fn run(&self, invocation: &Invocation) -> Result<Output, Error>;

    /// Starts the process and returns without waiting for it.
    fn launch(&self, invocation: &Invocation) -> Result<Box<dyn Process>, Error>;

    /// Streams combined output until a line contains `pattern` or `timeout`
    /// elapses, then kills the process. Returns whether the pattern showed up.
    fn run_until(
        &self,
        invocation: &Invocation,
        pattern: &str,
        timeout: Duration,
    ) -> Result<bool, Error>;
}

fn finish(invocation: &Invocation, output: Output) -> Result<Output, Error> {
    if invocation.check && !output.success() {
        return Err(Error::Failed {
            command: invocation.to_string(),
            code: output.code,
            output: output.text,
        });
    }
    Ok(output)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<Output, Error> {
        log::debug!(
            "running {invocation} (cwd: {})",
            invocation
                .cwd
                .as_deref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| ".".to_string())
        );
        let mut expr = invocation.expression();
        if invocation.capture {
            expr = expr.stderr_to_stdout().stdout_capture();
        }
        let raw = expr.run().map_err(|source| Error::Spawn {
            command: invocation.to_string(),
            source,
        })?;
        let output = Output {
            code: raw.status.code(),
            text: String::from_utf8_lossy(&raw.stdout).into_owned(),
        };
        if invocation.capture {
            log::trace!("{invocation} output:\n{}", output.text);
        }
        finish(invocation, output)
    }

    fn launch(&self, invocation: &Invocation) -> Result<Box<dyn Process>, Error> {
        log::debug!("launching {invocation}");
        let handle = invocation
            .expression()
            .stdin_null()
            .stdout_null()
            .stderr_null()
            .start()
            .map_err(|source| Error::Spawn {
                command: invocation.to_string(),
                source,
            })?;
        Ok(Box::new(Launched {
            command: invocation.to_string(),
            handle,
        }))
    }

    fn run_until(
        &self,
        invocation: &Invocation,
        pattern: &str,
        timeout: Duration,
    ) -> Result<bool, Error> {
        log::debug!("running {invocation} until {pattern:?} shows up");
        let handle = Arc::new(
            invocation
                .expression()
                .stderr_to_stdout()
                .reader()
                .map_err(|source| Error::Spawn {
                    command: invocation.to_string(),
                    source,
                })?,
        );

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&handle);
        let needle = pattern.to_owned();
        thread::spawn(move || {
            for line in BufReader::new(&*reader).lines() {
                let Ok(line) = line else { break };
                log::trace!("{line}");
                if line.contains(&needle) {
                    let _ = tx.send(true);
                    return;
                }
            }
            let _ = tx.send(false);
        });

        let found = match rx.recv_timeout(timeout) {
            Ok(found) => found,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        };
        if let Err(err) = handle.kill() {
            log::debug!("failed to stop {invocation}: {err}");
        }
        Ok(found)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A [`Runner`] that never spawns anything.

    use std::{cell::RefCell, rc::Rc};

    use super::*;

    type Handler = Box<dyn Fn(&Invocation) -> Result<Output, Error>>;
    type KillHook = Rc<dyn Fn(&Invocation)>;

    /// Records every invocation and answers from a closure. `check` is
    /// still honoured, so a handler returning a non-zero [`Output`] for a
    /// checked invocation produces [`Error::Failed`].
    pub struct ScriptedRunner {
        handler: Handler,
        calls: RefCell<Vec<Invocation>>,
        killed: Rc<RefCell<Vec<Invocation>>>,
        on_kill: Option<KillHook>,
    }

    impl ScriptedRunner {
        pub fn new(handler: impl Fn(&Invocation) -> Result<Output, Error> + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                calls: RefCell::new(Vec::new()),
                killed: Rc::default(),
                on_kill: None,
            }
        }

        /// Succeeds with empty output for everything.
        pub fn succeeding() -> Self {
            Self::new(|_| Ok(Output::ok("")))
        }

        /// Called with the launching invocation whenever a launched
        /// process is killed.
        pub fn on_kill(mut self, hook: impl Fn(&Invocation) + 'static) -> Self {
            self.on_kill = Some(Rc::new(hook));
            self
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.borrow().clone()
        }

        /// Each recorded argv joined by spaces.
        pub fn command_lines(&self) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .map(|call| call.argv().join(" "))
                .collect()
        }

        /// Launched processes that were killed, in order.
        pub fn killed(&self) -> Vec<Invocation> {
            self.killed.borrow().clone()
        }

        fn answer(&self, invocation: &Invocation) -> Result<Output, Error> {
            self.calls.borrow_mut().push(invocation.clone());
            (self.handler)(invocation)
        }
    }

    struct ScriptedProcess {
        invocation: Invocation,
        killed: Rc<RefCell<Vec<Invocation>>>,
        on_kill: Option<KillHook>,
    }

    impl Process for ScriptedProcess {
        fn kill(&self) -> Result<(), Error> {
            self.killed.borrow_mut().push(self.invocation.clone());
            if let Some(hook) = &self.on_kill {
                hook(&self.invocation);
            }
            Ok(())
        }
    }

    impl Runner for ScriptedRunner {
        fn run(&self, invocation: &Invocation) -> Result<Output, Error> {
            let output = self.answer(invocation)?;
            finish(invocation, output)
        }

        fn launch(&self, invocation: &Invocation) -> Result<Box<dyn Process>, Error> {
            self.answer(invocation)?;
            Ok(Box::new(ScriptedProcess {
                invocation: invocation.clone(),
                killed: Rc::clone(&self.killed),
                on_kill: self.on_kill.clone(),
            }))
        }

        fn run_until(
            &self,
            invocation: &Invocation,
            pattern: &str,
            _timeout: Duration,
        ) -> Result<bool, Error> {
            Ok(self.answer(invocation)?.text.contains(pattern))
        }
    }
}

//! Ways to start the display server for a session.

use std::{
    env,
    ffi::OsString,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, mpsc::Receiver},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    config::{ENV_SERVER, ENV_SESSION, SessionConfig},
    error::{Error, Result},
    registry::Registry,
    server::{
        ServerEvent,
        headless::{self, Capture, Injector},
    },
};

pub const SERVER_BIN: &str = "bgi-server";

/// A running server: a child process or a thread of ours.
#[derive(Debug)]
pub enum ServerHandle {
    Process(Child),
    Thread(JoinHandle<()>),
}

impl ServerHandle {
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Process(child) => Some(child.id()),
            Self::Thread(_) => None,
        }
    }

    pub fn has_exited(&mut self) -> bool {
        match self {
            Self::Process(child) => !matches!(child.try_wait(), Ok(None)),
            Self::Thread(handle) => handle.is_finished(),
        }
    }

    /// Poll until the server is gone; `false` on timeout.
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.has_exited() {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Only child processes can be killed; a thread server is left alone.
    pub fn kill(&mut self) {
        if let Self::Process(child) = self {
            if let Err(err) = child.kill() {
                tracing::debug!(%err, "kill server");
            }
            let _ = child.wait();
        }
    }
}

pub trait Launcher: Send + Sync {
    fn launch(&self, config: &SessionConfig) -> Result<ServerHandle>;
}

/// Runs `bgi-server` as a child process, handing it the config through
/// `BGI_SESSION`.
#[derive(Clone, Debug, Default)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Explicit program, then `$BGI_SERVER`, then a `bgi-server` next to the
    /// running executable (or one directory up, for test binaries in `deps/`).
    pub fn program(&self) -> PathBuf {
        if let Some(program) = &self.program {
            return program.clone();
        }
        if let Some(program) = env::var_os(ENV_SERVER) {
            return PathBuf::from(program);
        }
        if let Ok(exe) = env::current_exe() {
            for dir in exe.ancestors().skip(1).take(2) {
                let candidate = dir.join(SERVER_BIN);
                if candidate.is_file() {
                    return candidate;
                }
            }
        }
        PathBuf::from(SERVER_BIN)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, config: &SessionConfig) -> Result<ServerHandle> {
        let program = self.program();
        tracing::debug!(program = %program.display(), "spawning server process");
        let child = Command::new(&program)
            .args(&self.args)
            .env(ENV_SESSION, config.to_env_value()?)
            .stdin(Stdio::null())
            .spawn()
            .map_err(Error::Spawn)?;
        Ok(ServerHandle::Process(child))
    }
}

/// Runs the windowed server on a thread of the client process.
pub struct ThreadLauncher {
    registry: Arc<dyn Registry>,
}

impl ThreadLauncher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, config: &SessionConfig) -> Result<ServerHandle> {
        let registry = self.registry.clone();
        let config = config.clone();
        let handle = thread::Builder::new()
            .name(SERVER_BIN.to_string())
            .spawn(move || {
                if let Err(err) = crate::display::run(registry, config, true) {
                    tracing::error!(%err, "display server failed");
                }
            })
            .map_err(Error::Spawn)?;
        Ok(ServerHandle::Thread(handle))
    }
}

/// Runs a windowless server thread whose presents land in a [`Capture`] and
/// whose input comes from an [`Injector`].
pub struct HeadlessLauncher {
    registry: Arc<dyn Registry>,
    capture: Capture,
    injector: Injector,
    events: Mutex<Option<Receiver<ServerEvent>>>,
}

impl HeadlessLauncher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        let (injector, events) = headless::channel();
        Self {
            registry,
            capture: Capture::new(),
            injector,
            events: Mutex::new(Some(events)),
        }
    }

    pub fn capture(&self) -> Capture {
        self.capture.clone()
    }

    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }
}

impl Launcher for HeadlessLauncher {
    fn launch(&self, config: &SessionConfig) -> Result<ServerHandle> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
            .ok_or_else(|| Error::InvalidConfig("headless server already launched".to_string()))?;
        let registry = self.registry.clone();
        let config = config.clone();
        let injector = self.injector.clone();
        let capture = self.capture.clone();
        let handle = thread::Builder::new()
            .name("bgi-headless".to_string())
            .spawn(move || {
                if let Err(err) = headless::serve(registry, config, injector, events, capture) {
                    tracing::error!(%err, "headless server failed");
                }
            })
            .map_err(Error::Spawn)?;
        Ok(ServerHandle::Thread(handle))
    }
}

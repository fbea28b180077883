//! The drawing side of a session.
//!
//! [`Session::start`] spawns the display server, waits for it to publish the
//! shared objects and opens them. From then on the caller draws straight into
//! [`Session::active_page_mut`] and asks the server to present.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    config::{GraphicsMode, SessionConfig},
    error::{Error, Result},
    input::{Key, MouseState, NavKey},
    launcher::{Launcher, ProcessLauncher, ServerHandle, ThreadLauncher},
    lease::{self, Lease},
    names,
    objects::SharedObjects,
    page::Page,
    palette::{DEFAULT_PALETTE, PALETTE_LEN, Rgb},
    registry::{Registry, ShmRegistry},
    signal::Signal,
    state::request,
};

const STARTUP_POLL: Duration = Duration::from_millis(50);
const KEY_POLL: Duration = Duration::from_millis(100);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Where a session is in its life. States only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Idle,
    Spawning,
    AwaitingServerStart,
    Ready,
    Terminating,
}

pub type PeerLostHook = Arc<dyn Fn() + Send + Sync>;

fn exit_on_peer_lost() -> PeerLostHook {
    Arc::new(|| {
        tracing::error!("display server went away, exiting");
        std::process::exit(0);
    })
}

struct Liveness {
    state: Mutex<ClientState>,
    closing: AtomicBool,
    peer_lost: AtomicBool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            state: Mutex::new(ClientState::Idle),
            closing: AtomicBool::new(false),
            peer_lost: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Move to `next` unless the session is already past it.
    fn advance(&self, next: ClientState) {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if next > *state {
            tracing::debug!(from = ?*state, to = ?next, "client state");
            *state = next;
        }
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
    registry: Option<Arc<dyn Registry>>,
    launcher: Option<Box<dyn Launcher>>,
    on_peer_lost: Option<PeerLostHook>,
}

impl SessionBuilder {
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Some(Box::new(launcher));
        self
    }

    /// Runs on the watcher thread when the server dies. The default logs and
    /// exits the process.
    pub fn on_peer_lost(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_peer_lost = Some(Arc::new(hook));
        self
    }

    pub fn start(self) -> Result<Session> {
        let config = self.config;
        config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ShmRegistry::for_config(&config)));
        let launcher = match self.launcher {
            Some(launcher) => launcher,
            None if config.mode.release => Box::new(ThreadLauncher::new(registry.clone())),
            None => Box::new(ProcessLauncher::new()),
        };
        let hook = self.on_peer_lost.unwrap_or_else(exit_on_peer_lost);
        Session::connect(config, registry, launcher.as_ref(), hook)
    }
}

pub struct Session {
    config: SessionConfig,
    registry: Arc<dyn Registry>,
    liveness: Arc<Liveness>,
    objects: SharedObjects,
    server: ServerHandle,
    lease: Option<Lease>,
    active: usize,
    pending_nav: Option<NavKey>,
    frames: u32,
    fps: u32,
    measured_at: Instant,
    closed: bool,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder {
            config,
            registry: None,
            launcher: None,
            on_peer_lost: None,
        }
    }

    /// Start a session with the OS registry and the launcher `config.mode`
    /// asks for.
    pub fn start(config: SessionConfig) -> Result<Self> {
        Self::builder(config).start()
    }

    /// `initgraph`: a predefined mode plus the legacy option string.
    pub fn init_graph(mode: GraphicsMode, options: &str) -> Result<Self> {
        Self::start(SessionConfig::for_graphics_mode(mode, options)?)
    }

    fn connect(
        config: SessionConfig,
        registry: Arc<dyn Registry>,
        launcher: &dyn Launcher,
        hook: PeerLostHook,
    ) -> Result<Self> {
        let liveness = Arc::new(Liveness::new());

        let lease = registry.acquire_lease(names::CLIENT_ALIVE)?;
        let started = match registry.create_signal(names::SERVER_STARTED) {
            Ok(started) => started,
            Err(err) => {
                registry.unlink(names::CLIENT_ALIVE);
                return Err(err);
            }
        };
        liveness.advance(ClientState::Spawning);
        let mut server = match launcher.launch(&config) {
            Ok(server) => server,
            Err(err) => {
                unlink_client_names(registry.as_ref());
                return Err(err);
            }
        };
        tracing::debug!(pid = ?server.id(), "server launched");

        liveness.advance(ClientState::AwaitingServerStart);
        let opened = await_start(&started, &mut server, config.startup_timeout())
            .and_then(|()| SharedObjects::open(registry.as_ref(), &config))
            .and_then(|objects| {
                let watch = registry.watch_lease(names::SERVER_ALIVE)?;
                Ok((objects, watch))
            });
        let (objects, watch) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(%err, "server startup failed");
                server.kill();
                unlink_client_names(registry.as_ref());
                return Err(err);
            }
        };

        liveness.advance(ClientState::Ready);
        let watcher_liveness = liveness.clone();
        lease::spawn_watcher(watch, move |res| {
            if watcher_liveness.closing.load(Ordering::Acquire) {
                return;
            }
            if let Err(err) = res {
                tracing::warn!(%err, "server lease wait failed");
            }
            watcher_liveness.peer_lost.store(true, Ordering::Release);
            watcher_liveness.advance(ClientState::Terminating);
            tracing::error!("lost the display server");
            hook();
        })?;

        tracing::info!(
            width = config.width,
            height = config.height,
            namespace = %config.namespace,
            "session ready"
        );
        Ok(Self {
            config,
            registry,
            liveness,
            objects,
            server,
            lease: Some(lease),
            active: 0,
            pending_nav: None,
            frames: 0,
            fps: 0,
            measured_at: Instant::now(),
            closed: false,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.liveness.state()
    }

    pub fn is_peer_lost(&self) -> bool {
        self.liveness.peer_lost.load(Ordering::Acquire)
    }

    pub fn server_id(&self) -> Option<u32> {
        self.server.id()
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn page(&self, index: usize) -> Result<&Page> {
        self.objects.pages.get(index).ok_or(Error::InvalidPage(index))
    }

    pub fn page_mut(&mut self, index: usize) -> Result<&mut Page> {
        self.objects
            .pages
            .get_mut(index)
            .ok_or(Error::InvalidPage(index))
    }

    pub fn active_page(&self) -> &Page {
        &self.objects.pages[self.active]
    }

    pub fn active_page_mut(&mut self) -> &mut Page {
        &mut self.objects.pages[self.active]
    }

    pub fn active_page_index(&self) -> usize {
        self.active
    }

    pub fn set_active_page(&mut self, index: usize) -> Result<()> {
        if index > 1 {
            return Err(Error::InvalidPage(index));
        }
        self.active = index;
        Ok(())
    }

    pub fn visual_page(&self) -> usize {
        self.objects.state.visual_page()
    }

    /// Show page `index` and present it right away.
    pub fn set_visual_page(&mut self, index: usize) -> Result<()> {
        self.objects.state.set_visual_page(index)?;
        self.count_frame();
        self.update_window();
        Ok(())
    }

    fn count_frame(&mut self) {
        self.frames += 1;
        if self.measured_at.elapsed() >= Duration::from_secs(1) {
            self.fps = self.frames;
            self.frames = 0;
            self.measured_at = Instant::now();
        }
    }

    /// Frames shown during the last full second.
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Ask the server to present the visual page now.
    pub fn update_window(&self) {
        self.objects.request(request::REDRAW);
    }

    /// Call after drawing: presents if the active page is on screen.
    pub fn end_draw(&self) {
        if self.active == self.visual_page() {
            self.update_window();
        }
    }

    /// Show the page just drawn and make the other one active.
    pub fn flip(&mut self) -> Result<()> {
        let drawn = self.active;
        self.set_visual_page(drawn)?;
        self.active = 1 - drawn;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.is_peer_lost() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn take_key(&self) -> Option<Key> {
        let key = self.objects.state.pending_key()?;
        self.objects.request(request::KEY_PROCESSED);
        Some(key)
    }

    /// Block until the server posts a key, then acknowledge it.
    pub fn read_key(&mut self) -> Result<Key> {
        loop {
            if let Some(key) = self.read_key_timeout(KEY_POLL)? {
                return Ok(key);
            }
        }
    }

    pub fn read_key_timeout(&mut self, timeout: Duration) -> Result<Option<Key>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            self.ensure_open()?;
            if self.objects.keyboard_ready.wait_timeout(poll_slice(deadline, KEY_POLL)) {
                if let Some(key) = self.take_key() {
                    return Ok(Some(key));
                }
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }

    /// DOS-style `getch`: a navigation key comes back as `0` followed by its
    /// code on the next call.
    pub fn getch(&mut self) -> Result<i32> {
        if let Some(nav) = self.pending_nav.take() {
            return Ok(nav.code());
        }
        Ok(match self.read_key()? {
            Key::Char(ch) => ch as i32,
            Key::Nav(nav) => {
                self.pending_nav = Some(nav);
                0
            }
            Key::Unknown(code) => code,
        })
    }

    pub fn any_key_pending(&self) -> bool {
        self.pending_nav.is_some() || self.objects.keyboard_ready.is_set()
    }

    pub fn mouse_state(&self) -> MouseState {
        self.objects.state.mouse()
    }

    pub fn palette(&self) -> [Rgb; PALETTE_LEN] {
        self.objects.palette.snapshot()
    }

    /// Point entry `index` at default colour `colour`. Ignored in RGB mode.
    pub fn set_palette(&self, index: usize, colour: usize) {
        if self.config.mode.rgb || index >= PALETTE_LEN {
            return;
        }
        self.objects
            .palette
            .set(index, DEFAULT_PALETTE[colour % PALETTE_LEN]);
        self.objects.request(request::PALETTE_CHANGED);
    }

    pub fn set_rgb_palette(&self, index: usize, r: u8, g: u8, b: u8) {
        if self.config.mode.rgb || index >= PALETTE_LEN {
            return;
        }
        self.objects.palette.set(index, Rgb { r, g, b });
        self.objects.request(request::PALETTE_CHANGED);
    }

    /// Entry `i` becomes default colour `colours[i]`; extra entries are
    /// ignored.
    pub fn set_all_palette(&self, colours: &[u8]) {
        if self.config.mode.rgb {
            return;
        }
        for (i, &colour) in colours.iter().take(PALETTE_LEN).enumerate() {
            self.objects
                .palette
                .set(i, DEFAULT_PALETTE[colour as usize % PALETTE_LEN]);
        }
        self.objects.request(request::PALETTE_CHANGED);
    }

    /// What to store in a page for logical colour `colour`.
    pub fn pixel_value(&self, colour: u32) -> u32 {
        let index = colour as usize % PALETTE_LEN;
        if self.config.mode.rgb {
            DEFAULT_PALETTE[index].packed()
        } else {
            index as u32
        }
    }

    /// Ask the server to stop, release our lease and unlink our names.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.liveness.closing.store(true, Ordering::Release);
        self.liveness.advance(ClientState::Terminating);

        self.objects.request(request::CLOSE);
        drop(self.lease.take());
        if !self.server.wait_timeout(CLOSE_GRACE) {
            tracing::warn!(pid = ?self.server.id(), "server ignored close, killing it");
            self.server.kill();
        }
        unlink_client_names(self.registry.as_ref());
        tracing::info!(namespace = %self.config.namespace, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn unlink_client_names(registry: &dyn Registry) {
    registry.unlink(names::SERVER_STARTED);
    registry.unlink(names::CLIENT_ALIVE);
}

/// Time left until `deadline`, capped at `poll`. No deadline means wait in
/// whole slices forever.
fn poll_slice(deadline: Option<Instant>, poll: Duration) -> Duration {
    deadline.map_or(poll, |d| d.saturating_duration_since(Instant::now()).min(poll))
}

/// Wait for the server's start signal in slices so a crashed server is
/// noticed before the timeout.
fn await_start(started: &Signal, server: &mut ServerHandle, timeout: Duration) -> Result<()> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if started.wait_timeout(poll_slice(deadline, STARTUP_POLL)) {
            return Ok(());
        }
        if server.has_exited() {
            return Err(Error::ServerExited);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::StartupTimeout(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Mode, registry::MemoryRegistry};

    struct NeverStarts;

    impl Launcher for NeverStarts {
        fn launch(&self, _config: &SessionConfig) -> Result<ServerHandle> {
            Ok(ServerHandle::Thread(std::thread::spawn(|| {
                std::thread::sleep(Duration::from_secs(2));
            })))
        }
    }

    struct ExitsAtOnce;

    impl Launcher for ExitsAtOnce {
        fn launch(&self, _config: &SessionConfig) -> Result<ServerHandle> {
            Ok(ServerHandle::Thread(std::thread::spawn(|| {})))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(32, 16, Mode::default())
            .unwrap()
            .with_startup_timeout(Duration::from_millis(200))
    }

    #[test]
    fn client_state_only_moves_forward() {
        let liveness = Liveness::new();
        assert_eq!(liveness.state(), ClientState::Idle);
        liveness.advance(ClientState::Spawning);
        liveness.advance(ClientState::Ready);
        assert_eq!(liveness.state(), ClientState::Ready);
        liveness.advance(ClientState::AwaitingServerStart);
        assert_eq!(liveness.state(), ClientState::Ready);
        liveness.advance(ClientState::Terminating);
        liveness.advance(ClientState::Ready);
        assert_eq!(liveness.state(), ClientState::Terminating);
    }

    #[test]
    fn silent_server_times_out() {
        let registry = Arc::new(MemoryRegistry::new());
        let started = Instant::now();
        let err = Session::builder(config())
            .registry(registry.clone())
            .launcher(NeverStarts)
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, Error::StartupTimeout(_)));
        assert!(err.is_startup_failure());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(registry.open_section(names::SERVER_STARTED).is_err());
    }

    #[test]
    fn crashed_server_is_reported_before_the_timeout() {
        let err = Session::builder(config().with_startup_timeout(Duration::from_secs(5)))
            .registry(Arc::new(MemoryRegistry::new()))
            .launcher(ExitsAtOnce)
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, Error::ServerExited));
    }

    #[test]
    fn missing_server_binary_is_a_spawn_error() {
        let err = Session::builder(config())
            .registry(Arc::new(MemoryRegistry::new()))
            .launcher(ProcessLauncher::new().with_program("/nonexistent/bgi-server"))
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, Error::Spawn(_)));
    }
}

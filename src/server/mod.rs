//! Frontend-independent half of the display server.
//!
//! A frontend (the winit window in [`crate::display`], or the headless loop in
//! [`headless`]) owns the event loop and feeds every event through
//! [`Server::handle`]; the returned [`Outcome`] says what to repaint and when
//! to stop.

pub mod headless;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    config::SessionConfig,
    error::{Error, Result},
    input::{KeyboardRelay, Relay},
    lease::{self, Lease, LeaseWatch},
    names,
    objects::SharedObjects,
    page::Page,
    palette::{PALETTE_LEN, Rgb},
    registry::Registry,
    state::request,
};

pub const UPDATES_PER_SECOND: u32 = 2;
pub const DEBUG_UPDATES_PER_SECOND: u32 = 5;

pub fn update_period() -> Duration {
    Duration::from_millis(1000 / u64::from(UPDATES_PER_SECOND))
}

pub fn debug_update_period() -> Duration {
    Duration::from_millis(1000 / u64::from(DEBUG_UPDATES_PER_SECOND))
}

/// A [`Server`] exists only once its objects are published, so it starts
/// out `Running`. `ShuttingDown` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Running,
    ShuttingDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Tick,
    DiagnosticTick,
    Paint,
    /// The request doorbell rang; pending bits are in the shared state.
    Requests,
    /// Raw scan code of a pressed key.
    KeyDown(i32),
    Char(char),
    MouseMove { x: i32, y: i32 },
    MouseButton { button: i32, down: bool },
    PeerLost,
    CloseRequested,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub redraw: bool,
    pub redraw_diagnostic: bool,
    pub exit: bool,
}

impl Outcome {
    pub fn merge(&mut self, other: Outcome) {
        self.redraw |= other.redraw;
        self.redraw_diagnostic |= other.redraw_diagnostic;
        self.exit |= other.exit;
    }
}

/// Which page a frontend is about to show.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    Visual,
    /// The page that is not on screen, for the diagnostic window.
    Hidden,
}

pub struct Server {
    registry: Arc<dyn Registry>,
    config: SessionConfig,
    objects: SharedObjects,
    _alive: Lease,
    client_watch: Option<LeaseWatch>,
    relay: KeyboardRelay,
    palette: [Rgb; PALETTE_LEN],
    state: ServerState,
    stop: Arc<AtomicBool>,
    forwarder: Option<JoinHandle<()>>,
    unlinked: bool,
}

impl Server {
    /// Publish the session's objects and tell the waiting client we are up.
    pub fn initialize(registry: Arc<dyn Registry>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            width = config.width,
            height = config.height,
            mode = config.mode.bits(),
            namespace = %config.namespace,
            "initializing server"
        );

        let started = registry.open_signal(names::SERVER_STARTED)?;
        let client_watch = registry.watch_lease(names::CLIENT_ALIVE)?;
        let alive = registry.acquire_lease(names::SERVER_ALIVE)?;
        let objects = match SharedObjects::create(registry.as_ref(), &config) {
            Ok(objects) => objects,
            Err(err) => {
                tracing::error!(%err, "could not publish the shared objects");
                SharedObjects::unlink(registry.as_ref());
                registry.unlink(names::SERVER_ALIVE);
                return Err(err);
            }
        };
        let palette = objects.palette.snapshot();

        started.raise();
        tracing::info!(namespace = %config.namespace, "server running");

        Ok(Self {
            registry,
            config,
            objects,
            _alive: alive,
            client_watch: Some(client_watch),
            relay: KeyboardRelay::new(),
            palette,
            state: ServerState::Running,
            stop: Arc::new(AtomicBool::new(false)),
            forwarder: None,
            unlinked: false,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn objects(&self) -> &SharedObjects {
        &self.objects
    }

    pub fn palette(&self) -> &[Rgb; PALETTE_LEN] {
        &self.palette
    }

    /// Start the client liveness watcher and the request forwarder. `sink`
    /// delivers an event to the frontend's loop and returns `false` once the
    /// loop is gone.
    pub fn spawn_watchers<S>(&mut self, sink: S) -> Result<()>
    where
        S: Fn(ServerEvent) -> bool + Clone + Send + 'static,
    {
        let watch = self.client_watch.take().ok_or(Error::Closed)?;
        let on_lost = sink.clone();
        lease::spawn_watcher(watch, move |res| {
            if let Err(err) = res {
                tracing::warn!(%err, "client lease wait failed");
            }
            on_lost(ServerEvent::PeerLost);
        })?;

        let doorbell = self.objects.server_request.clone();
        let stop = self.stop.clone();
        let forwarder = thread::Builder::new()
            .name("bgi-requests".to_string())
            .spawn(move || {
                loop {
                    doorbell.wait();
                    if stop.load(Ordering::Acquire) || !sink(ServerEvent::Requests) {
                        break;
                    }
                }
            })?;
        self.forwarder = Some(forwarder);
        Ok(())
    }

    pub fn handle(&mut self, event: ServerEvent) -> Outcome {
        let mut out = Outcome::default();
        let shared = &self.objects.state;
        match event {
            ServerEvent::Tick | ServerEvent::Paint => out.redraw = true,
            ServerEvent::DiagnosticTick => {
                out.redraw_diagnostic = self.config.mode.show_invisible_page;
            }
            ServerEvent::Requests => {
                let bits = shared.take_requests();
                if bits & request::KEY_PROCESSED != 0 {
                    shared.clear_key();
                }
                if bits & request::PALETTE_CHANGED != 0 {
                    self.palette = self.objects.palette.snapshot();
                    out.redraw = true;
                    out.redraw_diagnostic = self.config.mode.show_invisible_page;
                }
                if bits & request::REDRAW != 0 {
                    out.redraw = true;
                }
                if bits & request::CLOSE != 0 {
                    tracing::info!("client asked to close");
                    out.exit = true;
                }
            }
            ServerEvent::KeyDown(raw) => {
                if self.relay.key_down(shared, raw) == Relay::Posted {
                    self.objects.keyboard_ready.raise();
                }
            }
            ServerEvent::Char(ch) => {
                if self.relay.char_input(shared, ch) == Relay::Posted {
                    self.objects.keyboard_ready.raise();
                }
            }
            ServerEvent::MouseMove { x, y } => shared.set_mouse_position(x, y),
            ServerEvent::MouseButton { button, down } => shared.set_button(button, down),
            ServerEvent::PeerLost => {
                tracing::error!("client went away, closing");
                out.exit = true;
            }
            ServerEvent::CloseRequested => {
                tracing::info!("window closed");
                out.exit = true;
            }
        }
        if out.exit {
            self.state = ServerState::ShuttingDown;
        }
        out
    }

    pub fn page_index(&self, surface: Surface) -> usize {
        let visual = self.objects.state.visual_page();
        match surface {
            Surface::Visual => visual,
            Surface::Hidden => 1 - visual,
        }
    }

    pub fn page(&self, surface: Surface) -> &Page {
        &self.objects.pages[self.page_index(surface)]
    }

    /// Render `surface` as RGBA8 into `out` on the CPU; returns the page
    /// index shown.
    pub fn render(&self, surface: Surface, out: &mut Vec<u8>) -> usize {
        let index = self.page_index(surface);
        self.objects.pages[index].render_rgba(&self.palette, out);
        index
    }

    /// Unlink our names and stop the forwarder. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.state = ServerState::ShuttingDown;
        if self.unlinked {
            return;
        }
        self.unlinked = true;
        self.stop.store(true, Ordering::Release);
        self.objects.server_request.raise();
        if let Some(forwarder) = self.forwarder.take() {
            if forwarder.join().is_err() {
                tracing::warn!("request forwarder panicked");
            }
        }
        SharedObjects::unlink(self.registry.as_ref());
        self.registry.unlink(names::SERVER_ALIVE);
        tracing::info!(namespace = %self.config.namespace, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

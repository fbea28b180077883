//! The windowed server frontend: a winit window showing the visual page, an
//! optional second window showing the hidden one, and input forwarding.

mod gfx;
mod letterbox;

use std::{sync::Arc, time::Instant};

use thiserror::Error;
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, MouseButton, StartCause, WindowEvent},
    event_loop::{ControlFlow, EventLoopBuilder, EventLoopWindowTarget},
    keyboard::{Key, NamedKey},
    window::{Fullscreen, Window, WindowBuilder, WindowId},
};

use self::{gfx::Gfx, letterbox::Letterbox};
use crate::{
    config::SessionConfig,
    input::{button, scan},
    names,
    registry::Registry,
    server::{
        Outcome, Server, ServerEvent, Surface, debug_update_period, update_period,
    },
};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("event loop: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),

    #[error("create window: {0}")]
    Window(#[from] winit::error::OsError),

    #[error("create surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),

    #[error("no usable GPU adapter")]
    NoAdapter,

    #[error("request device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),

    #[error(transparent)]
    Server(#[from] crate::Error),
}

struct View {
    window: Arc<Window>,
    gfx: Gfx,
    letterbox: Letterbox,
    surface: Surface,
}

impl View {
    fn new(window: Window, server: &Server, surface: Surface) -> Result<Self, DisplayError> {
        let window = Arc::new(window);
        let size = window.inner_size();
        let geometry = server.config().geometry();
        let gfx = pollster::block_on(Gfx::new(window.clone(), geometry, server.palette()))?;
        Ok(Self {
            window,
            gfx,
            letterbox: Letterbox::new(geometry.width, geometry.height, size.width, size.height),
            surface,
        })
    }

    fn id(&self) -> WindowId {
        self.window.id()
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        self.gfx.resize(size);
        self.letterbox = Letterbox::new(
            self.letterbox.page_w,
            self.letterbox.page_h,
            size.width,
            size.height,
        );
        self.window.request_redraw();
    }

    /// Returns `false` when the GPU is gone for good.
    fn present(&mut self, server: &Server) -> bool {
        self.gfx.set_palette(server.palette());
        self.gfx.upload_page(server.page(self.surface));
        match self.gfx.render(&self.letterbox) {
            Ok(()) => true,
            Err(wgpu::SurfaceError::OutOfMemory) => {
                tracing::error!("GPU out of memory");
                false
            }
            Err(err) => {
                if matches!(err, wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) {
                    self.gfx.reconfigure();
                } else {
                    tracing::debug!(%err, "skipped a frame");
                }
                true
            }
        }
    }
}

fn build_window(
    title: &str,
    class: &str,
    config: &SessionConfig,
    elwt: &EventLoopWindowTarget<ServerEvent>,
) -> Result<Window, DisplayError> {
    let mut builder = WindowBuilder::new()
        .with_title(title)
        .with_inner_size(PhysicalSize::new(config.width, config.height))
        .with_resizable(config.mode.fullscreen);
    #[cfg(target_os = "linux")]
    {
        use winit::platform::{wayland::WindowBuilderExtWayland, x11::WindowBuilderExtX11};
        builder = WindowBuilderExtWayland::with_name(builder, class, class);
        builder = WindowBuilderExtX11::with_name(builder, class, class);
    }
    Ok(builder.build(elwt)?)
}

/// Run the display server until the client goes away or the window closes.
///
/// `any_thread` lets the event loop live off the main thread (release mode).
pub fn run(
    registry: Arc<dyn Registry>,
    config: SessionConfig,
    any_thread: bool,
) -> Result<(), DisplayError> {
    let mut builder = EventLoopBuilder::<ServerEvent>::with_user_event();
    if any_thread {
        use winit::platform::{wayland::EventLoopBuilderExtWayland, x11::EventLoopBuilderExtX11};
        EventLoopBuilderExtWayland::with_any_thread(&mut builder, true);
        EventLoopBuilderExtX11::with_any_thread(&mut builder, true);
    }
    let event_loop = builder.build()?;
    let proxy = event_loop.create_proxy();

    let main_window = build_window("BGI", names::WINDOW_CLASS, &config, &event_loop)?;
    if config.mode.fullscreen {
        main_window.set_fullscreen(Some(Fullscreen::Borderless(None)));
    }
    let diagnostic_window = if config.mode.show_invisible_page {
        Some(build_window(
            "BGI (hidden page)",
            names::DIAGNOSTIC_WINDOW_CLASS,
            &config,
            &event_loop,
        )?)
    } else {
        None
    };

    let mut server = Server::initialize(registry, config.clone())?;
    server.spawn_watchers(move |ev| proxy.send_event(ev).is_ok())?;

    let mut main = View::new(main_window, &server, Surface::Visual)?;
    let mut diagnostic = diagnostic_window
        .map(|w| View::new(w, &server, Surface::Hidden))
        .transpose()?;

    let period = update_period();
    let debug_period = debug_update_period();
    let mut next_tick = Instant::now() + period;
    let mut next_debug_tick = Instant::now() + debug_period;

    main.window.request_redraw();
    if let Some(d) = &diagnostic {
        d.window.request_redraw();
    }

    event_loop.run(move |event, elwt| {
        let mut out = Outcome::default();
        match event {
            Event::NewEvents(StartCause::ResumeTimeReached { .. }) => {
                let now = Instant::now();
                if now >= next_tick {
                    next_tick = now + period;
                    out.merge(server.handle(ServerEvent::Tick));
                }
                if diagnostic.is_some() && now >= next_debug_tick {
                    next_debug_tick = now + debug_period;
                    out.merge(server.handle(ServerEvent::DiagnosticTick));
                }
            }
            Event::UserEvent(ev) => out.merge(server.handle(ev)),
            Event::WindowEvent { window_id, event } => {
                let is_main = window_id == main.id();
                match event {
                    WindowEvent::CloseRequested => {
                        out.merge(server.handle(ServerEvent::CloseRequested));
                    }
                    WindowEvent::Resized(size) => {
                        if is_main {
                            main.resize(size);
                        } else if let Some(d) = diagnostic.as_mut() {
                            d.resize(size);
                        }
                    }
                    WindowEvent::RedrawRequested => {
                        let view = if is_main {
                            Some(&mut main)
                        } else {
                            diagnostic.as_mut().filter(|d| d.id() == window_id)
                        };
                        if let Some(view) = view {
                            if !view.present(&server) {
                                out.exit = true;
                            }
                        }
                    }
                    WindowEvent::KeyboardInput { event, .. } => {
                        if event.state == ElementState::Pressed {
                            let raw = map_winit_key_to_scan_code(&event.logical_key);
                            out.merge(server.handle(ServerEvent::KeyDown(raw)));
                            if let Some(text) = &event.text {
                                for ch in text.chars() {
                                    out.merge(server.handle(ServerEvent::Char(ch)));
                                }
                            }
                        }
                    }
                    WindowEvent::CursorMoved { position, .. } => {
                        let letterbox = if is_main {
                            Some(main.letterbox)
                        } else {
                            diagnostic.as_ref().map(|d| d.letterbox)
                        };
                        if let Some((x, y)) = letterbox.and_then(|lb| lb.map_point(position)) {
                            out.merge(server.handle(ServerEvent::MouseMove { x, y }));
                        }
                    }
                    WindowEvent::MouseInput { state, button, .. } => {
                        if let Some(mask) = map_winit_mouse_button(button) {
                            out.merge(server.handle(ServerEvent::MouseButton {
                                button: mask,
                                down: state == ElementState::Pressed,
                            }));
                        }
                    }
                    _ => {}
                }
            }
            Event::LoopExiting => server.shutdown(),
            _ => {}
        }

        if out.redraw {
            main.window.request_redraw();
        }
        if out.redraw_diagnostic {
            if let Some(d) = &diagnostic {
                d.window.request_redraw();
            }
        }
        if out.exit {
            elwt.exit();
            return;
        }
        let wake = if diagnostic.is_some() {
            next_tick.min(next_debug_tick)
        } else {
            next_tick
        };
        elwt.set_control_flow(ControlFlow::WaitUntil(wake));
    })?;
    Ok(())
}

/// Scan code for navigation and function keys, `0` for everything else.
fn map_winit_key_to_scan_code(key: &Key) -> i32 {
    let Key::Named(named) = key else {
        return 0;
    };
    match named {
        NamedKey::ArrowUp => scan::UP,
        NamedKey::ArrowDown => scan::DOWN,
        NamedKey::ArrowLeft => scan::LEFT,
        NamedKey::ArrowRight => scan::RIGHT,
        NamedKey::Home => scan::HOME,
        NamedKey::End => scan::END,
        NamedKey::PageUp => scan::PAGE_UP,
        NamedKey::PageDown => scan::PAGE_DOWN,
        NamedKey::Insert => scan::INSERT,
        NamedKey::Delete => scan::DELETE,
        NamedKey::F1 => scan::F1,
        NamedKey::F2 => scan::F1 + 1,
        NamedKey::F3 => scan::F1 + 2,
        NamedKey::F4 => scan::F1 + 3,
        NamedKey::F5 => scan::F1 + 4,
        NamedKey::F6 => scan::F1 + 5,
        NamedKey::F7 => scan::F1 + 6,
        NamedKey::F8 => scan::F1 + 7,
        NamedKey::F9 => scan::F1 + 8,
        NamedKey::F10 => scan::F10,
        NamedKey::F11 => scan::F11,
        NamedKey::F12 => scan::F12,
        _ => 0,
    }
}

fn map_winit_mouse_button(button: MouseButton) -> Option<i32> {
    match button {
        MouseButton::Left => Some(button::LEFT),
        MouseButton::Right => Some(button::RIGHT),
        MouseButton::Middle => Some(button::MIDDLE),
        _ => None,
    }
}

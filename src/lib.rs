//! Runtime for a BGI-style graphics library split across two processes.
//!
//! The client draws into shared-memory pages; a display server maps the same
//! pages and shows the visual one in a window, relaying keyboard and mouse
//! input back through a shared state block. Each side holds a liveness lease
//! the other watches, so either one going away is noticed promptly.
//!
//! [`Session`] is the client entry point; [`server`] and [`display`] are the
//! other end.

pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod input;
pub mod launcher;
pub mod lease;
pub mod logging;
pub mod names;
pub mod objects;
pub mod page;
pub mod palette;
pub mod registry;
pub mod server;
pub mod signal;
pub mod state;

pub use client::{ClientState, Session, SessionBuilder};
pub use config::{GraphicsMode, Mode, SessionConfig, SpawnWord};
pub use error::{Error, Result};
pub use input::{Key, MouseState, NavKey};
pub use launcher::{HeadlessLauncher, Launcher, ProcessLauncher, ThreadLauncher};
pub use page::{Geometry, Page, PixelFormat};
pub use palette::{Rgb, rgb};
pub use registry::{MemoryRegistry, Registry, ShmRegistry};

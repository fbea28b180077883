//! The shared display state: input fields, page selection and the request
//! doorbell bits.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::{
    config::Mode,
    error::{Error, Result},
    input::{Key, MouseState},
    names,
    registry::{Registry, Section},
};

const STATE_MAGIC: u32 = u32::from_le_bytes(*b"BGIS");
const STATE_VERSION: u32 = 1;
pub const STATE_LEN: usize = 64;

/// Bits the client ORs into `requests` before ringing `BGI_ServerRequest`.
pub mod request {
    pub const KEY_PROCESSED: u32 = 1;
    pub const REDRAW: u32 = 2;
    pub const PALETTE_CHANGED: u32 = 4;
    pub const CLOSE: u32 = 8;
}

#[repr(C)]
struct Layout {
    magic: AtomicU32,
    version: AtomicU32,
    width: AtomicU32,
    height: AtomicU32,
    mode: AtomicU32,
    mouse_x: AtomicI32,
    mouse_y: AtomicI32,
    buttons: AtomicI32,
    key_code: AtomicI32,
    key_letter: AtomicI32,
    visual_page: AtomicU32,
    requests: AtomicU32,
    flips: AtomicU32,
    _reserved: [AtomicU32; 3],
}

const _: () = assert!(std::mem::size_of::<Layout>() == STATE_LEN);
const _: () = assert!(std::mem::align_of::<Layout>() == 4);

#[derive(Clone, Debug)]
pub struct SharedState {
    section: Section,
}

impl SharedState {
    pub fn create(registry: &dyn Registry, width: u32, height: u32, mode: Mode) -> Result<Self> {
        let state = Self {
            section: registry.create_section(names::SHARED_STATE, STATE_LEN)?,
        };
        let l = state.layout();
        l.version.store(STATE_VERSION, Ordering::Relaxed);
        l.width.store(width, Ordering::Relaxed);
        l.height.store(height, Ordering::Relaxed);
        l.mode.store(mode.bits(), Ordering::Relaxed);
        l.key_code.store(-1, Ordering::Relaxed);
        l.visual_page.store(0, Ordering::Relaxed);
        l.magic.store(STATE_MAGIC, Ordering::Release);
        Ok(state)
    }

    /// Open and check that the creator agreed on size and mode.
    pub fn open(registry: &dyn Registry, width: u32, height: u32, mode: Mode) -> Result<Self> {
        let section = registry.open_section(names::SHARED_STATE)?;
        section.require_len(STATE_LEN)?;
        let state = Self { section };
        let l = state.layout();

        let bad = |reason: String| Error::BadHeader {
            name: names::SHARED_STATE.to_string(),
            reason,
        };
        let magic = l.magic.load(Ordering::Acquire);
        if magic != STATE_MAGIC {
            return Err(bad(format!("bad magic {magic:#010x}")));
        }
        let version = l.version.load(Ordering::Relaxed);
        if version != STATE_VERSION {
            return Err(bad(format!("unsupported version {version}")));
        }
        let found = (state.width(), state.height(), state.mode());
        if found != (width, height, mode) {
            return Err(bad(format!(
                "created for {}x{} mode {:#x}, expected {width}x{height} mode {:#x}",
                found.0,
                found.1,
                found.2.bits(),
                mode.bits()
            )));
        }
        Ok(state)
    }

    fn layout(&self) -> &Layout {
        unsafe { self.section.view(0) }
    }

    pub fn width(&self) -> u32 {
        self.layout().width.load(Ordering::Relaxed)
    }

    pub fn height(&self) -> u32 {
        self.layout().height.load(Ordering::Relaxed)
    }

    pub fn mode(&self) -> Mode {
        Mode::from_bits(self.layout().mode.load(Ordering::Relaxed))
    }

    pub fn mouse(&self) -> MouseState {
        let l = self.layout();
        MouseState {
            x: l.mouse_x.load(Ordering::Relaxed),
            y: l.mouse_y.load(Ordering::Relaxed),
            buttons: l.buttons.load(Ordering::Relaxed),
        }
    }

    pub fn set_mouse_position(&self, x: i32, y: i32) {
        let l = self.layout();
        l.mouse_x.store(x, Ordering::Relaxed);
        l.mouse_y.store(y, Ordering::Relaxed);
    }

    pub fn set_button(&self, mask: i32, down: bool) {
        let buttons = &self.layout().buttons;
        if down {
            buttons.fetch_or(mask, Ordering::Relaxed);
        } else {
            buttons.fetch_and(!mask, Ordering::Relaxed);
        }
    }

    pub fn key_code(&self) -> i32 {
        self.layout().key_code.load(Ordering::Acquire)
    }

    pub fn pending_key(&self) -> Option<Key> {
        let code = self.key_code();
        Key::from_mailbox(code, self.layout().key_letter.load(Ordering::Relaxed))
    }

    /// Claim the idle mailbox for a navigation key.
    pub fn try_post_key(&self, raw: i32) -> bool {
        self.layout()
            .key_code
            .compare_exchange(-1, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The letter goes in before the code flips to `0`.
    pub fn try_post_char(&self, ch: char) -> bool {
        let l = self.layout();
        if l.key_code.load(Ordering::Acquire) != -1 {
            return false;
        }
        l.key_letter.store(ch as i32, Ordering::Relaxed);
        l.key_code
            .compare_exchange(-1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_key(&self) {
        self.layout().key_code.store(-1, Ordering::Release);
    }

    pub fn visual_page(&self) -> usize {
        (self.layout().visual_page.load(Ordering::Acquire) & 1) as usize
    }

    pub fn set_visual_page(&self, index: usize) -> Result<()> {
        if index > 1 {
            return Err(Error::InvalidPage(index));
        }
        let l = self.layout();
        l.visual_page.store(index as u32, Ordering::Release);
        l.flips.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of `set_visual_page` calls so far (wraps).
    pub fn flips(&self) -> u32 {
        self.layout().flips.load(Ordering::Relaxed)
    }

    pub fn post_requests(&self, bits: u32) {
        self.layout().requests.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn take_requests(&self) -> u32 {
        self.layout().requests.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{input::NavKey, registry::MemoryRegistry};

    #[test]
    fn fresh_state_has_an_empty_mailbox() {
        let registry = MemoryRegistry::new();
        let state = SharedState::create(&registry, 640, 480, Mode::default()).unwrap();
        assert_eq!(state.key_code(), -1);
        assert_eq!(state.pending_key(), None);
        assert_eq!(state.visual_page(), 0);
        assert_eq!(state.mouse(), MouseState::default());
    }

    #[test]
    fn opener_sees_creator_writes() {
        let registry = MemoryRegistry::new();
        let server = SharedState::create(&registry, 640, 480, Mode::default()).unwrap();
        let client = SharedState::open(&registry, 640, 480, Mode::default()).unwrap();

        server.set_mouse_position(10, 20);
        server.set_button(crate::input::button::LEFT, true);
        server.set_button(crate::input::button::MIDDLE, true);
        server.set_button(crate::input::button::LEFT, false);
        assert!(server.try_post_key(72));

        assert_eq!(
            client.mouse(),
            MouseState {
                x: 10,
                y: 20,
                buttons: crate::input::button::MIDDLE
            }
        );
        assert_eq!(client.pending_key(), Some(Key::Nav(NavKey::Up)));
    }

    #[test]
    fn open_rejects_a_different_session() {
        let registry = MemoryRegistry::new();
        let _server = SharedState::create(&registry, 640, 480, Mode::default()).unwrap();
        let rgb = Mode::from_options("RGB");
        assert!(matches!(
            SharedState::open(&registry, 640, 480, rgb),
            Err(Error::BadHeader { .. })
        ));
        assert!(SharedState::open(&registry, 800, 600, Mode::default()).is_err());
    }

    #[test]
    fn requests_accumulate_until_taken() {
        let registry = MemoryRegistry::new();
        let state = SharedState::create(&registry, 8, 8, Mode::default()).unwrap();
        state.post_requests(request::REDRAW);
        state.post_requests(request::KEY_PROCESSED);
        assert_eq!(
            state.take_requests(),
            request::REDRAW | request::KEY_PROCESSED
        );
        assert_eq!(state.take_requests(), 0);
    }

    #[test]
    fn visual_page_counts_flips() {
        let registry = MemoryRegistry::new();
        let state = SharedState::create(&registry, 8, 8, Mode::default()).unwrap();
        state.set_visual_page(1).unwrap();
        state.set_visual_page(0).unwrap();
        assert_eq!(state.flips(), 2);
        assert!(state.set_visual_page(2).is_err());
    }
}

use crate::{
    config::SessionConfig,
    error::Result,
    names,
    page::Page,
    palette::SharedPalette,
    registry::Registry,
    signal::Signal,
    state::SharedState,
};

/// Everything the server publishes for a session, as seen from one side.
#[derive(Debug)]
pub struct SharedObjects {
    pub keyboard_ready: Signal,
    pub server_request: Signal,
    pub state: SharedState,
    pub pages: [Page; 2],
    pub palette: SharedPalette,
}

impl SharedObjects {
    pub fn create(registry: &dyn Registry, config: &SessionConfig) -> Result<Self> {
        let geometry = config.geometry();
        let keyboard_ready = registry.create_signal(names::KEYBOARD_READY)?;
        let server_request = registry.create_signal(names::SERVER_REQUEST)?;
        let state = SharedState::create(registry, config.width, config.height, config.mode)?;
        let pages = [
            Page::create(registry, 0, geometry)?,
            Page::create(registry, 1, geometry)?,
        ];
        let palette = SharedPalette::create(registry)?;
        Ok(Self {
            keyboard_ready,
            server_request,
            state,
            pages,
            palette,
        })
    }

    pub fn open(registry: &dyn Registry, config: &SessionConfig) -> Result<Self> {
        let geometry = config.geometry();
        let keyboard_ready = registry.open_signal(names::KEYBOARD_READY)?;
        let server_request = registry.open_signal(names::SERVER_REQUEST)?;
        let state = SharedState::open(registry, config.width, config.height, config.mode)?;
        let pages = [
            Page::open(registry, 0, geometry)?,
            Page::open(registry, 1, geometry)?,
        ];
        let palette = SharedPalette::open(registry)?;
        Ok(Self {
            keyboard_ready,
            server_request,
            state,
            pages,
            palette,
        })
    }

    /// Names created by [`SharedObjects::create`].
    pub const NAMES: [&'static str; 6] = [
        names::KEYBOARD_READY,
        names::SERVER_REQUEST,
        names::SHARED_STATE,
        names::PAGES[0],
        names::PAGES[1],
        names::PALETTE,
    ];

    pub fn unlink(registry: &dyn Registry) {
        for name in Self::NAMES {
            registry.unlink(name);
        }
    }

    /// Ring the server with `bits` set.
    pub fn request(&self, bits: u32) {
        self.state.post_requests(bits);
        self.server_request.raise();
    }
}

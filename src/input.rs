//! Keyboard mailbox policy and key translation.
//!
//! Raw key ids crossing the shared state are PC set-1 scan codes; the client
//! turns them into [`NavKey`]s and `getch` codes.

use crate::state::SharedState;

pub mod scan {
    pub const HOME: i32 = 71;
    pub const UP: i32 = 72;
    pub const PAGE_UP: i32 = 73;
    pub const LEFT: i32 = 75;
    pub const RIGHT: i32 = 77;
    pub const END: i32 = 79;
    pub const DOWN: i32 = 80;
    pub const PAGE_DOWN: i32 = 81;
    pub const INSERT: i32 = 82;
    pub const DELETE: i32 = 83;
    pub const F1: i32 = 59;
    pub const F10: i32 = 68;
    pub const F11: i32 = 87;
    pub const F12: i32 = 88;
}

pub const KEY_F11: i32 = 133;
pub const KEY_F12: i32 = 134;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NavKey {
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    Delete,
    /// `F(1)` through `F(12)`.
    F(u8),
}

impl NavKey {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            scan::UP => Self::Up,
            scan::DOWN => Self::Down,
            scan::LEFT => Self::Left,
            scan::RIGHT => Self::Right,
            scan::HOME => Self::Home,
            scan::END => Self::End,
            scan::PAGE_UP => Self::PageUp,
            scan::PAGE_DOWN => Self::PageDown,
            scan::INSERT => Self::Insert,
            scan::DELETE => Self::Delete,
            scan::F1..=scan::F10 => Self::F((raw - scan::F1 + 1) as u8),
            scan::F11 => Self::F(11),
            scan::F12 => Self::F(12),
            _ => return None,
        })
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Up => scan::UP,
            Self::Down => scan::DOWN,
            Self::Left => scan::LEFT,
            Self::Right => scan::RIGHT,
            Self::Home => scan::HOME,
            Self::End => scan::END,
            Self::PageUp => scan::PAGE_UP,
            Self::PageDown => scan::PAGE_DOWN,
            Self::Insert => scan::INSERT,
            Self::Delete => scan::DELETE,
            Self::F(n @ 1..=10) => scan::F1 + i32::from(n) - 1,
            Self::F(11) => scan::F11,
            Self::F(_) => scan::F12,
        }
    }

    /// Second byte of the DOS extended key sequence.
    pub fn code(self) -> i32 {
        match self {
            Self::F(11) => KEY_F11,
            Self::F(12) => KEY_F12,
            other => other.raw(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Nav(NavKey),
    /// A raw id this build does not know.
    Unknown(i32),
}

impl Key {
    /// Decode the mailbox pair; `None` when no key is pending.
    pub fn from_mailbox(code: i32, letter: i32) -> Option<Self> {
        match code {
            -1 => None,
            0 => Some(
                u32::try_from(letter)
                    .ok()
                    .and_then(char::from_u32)
                    .map_or(Self::Unknown(letter), Self::Char),
            ),
            raw => Some(NavKey::from_raw(raw).map_or(Self::Unknown(raw), Self::Nav)),
        }
    }
}

/// What the relay did with an input event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relay {
    /// Written to the mailbox; raise keyboard-ready.
    Posted,
    /// Mailbox still held an unacknowledged key.
    Dropped,
    /// Not for the mailbox (modifier, or the text of a claimed key).
    Ignored,
}

/// Server-side half of the single-slot keyboard mailbox.
#[derive(Debug, Default)]
pub struct KeyboardRelay {
    nav_claimed: bool,
}

impl KeyboardRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&mut self, state: &SharedState, raw: i32) -> Relay {
        if NavKey::from_raw(raw).is_none() {
            self.nav_claimed = false;
            return Relay::Ignored;
        }
        self.nav_claimed = true;
        if state.try_post_key(raw) {
            Relay::Posted
        } else {
            tracing::warn!(raw, "keyboard mailbox busy, dropping key");
            Relay::Dropped
        }
    }

    pub fn char_input(&mut self, state: &SharedState, ch: char) -> Relay {
        if std::mem::take(&mut self.nav_claimed) {
            return Relay::Ignored;
        }
        if state.try_post_char(ch) {
            Relay::Posted
        } else {
            tracing::warn!(?ch, "keyboard mailbox busy, dropping character");
            Relay::Dropped
        }
    }
}

pub mod button {
    pub const LEFT: i32 = 1;
    pub const RIGHT: i32 = 2;
    pub const MIDDLE: i32 = 4;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MouseState {
    pub x: i32,
    pub y: i32,
    pub buttons: i32,
}

impl MouseState {
    pub fn is_pressed(&self, mask: i32) -> bool {
        self.buttons & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Mode, registry::MemoryRegistry};

    fn state() -> (MemoryRegistry, SharedState) {
        let registry = MemoryRegistry::new();
        let state = SharedState::create(&registry, 64, 64, Mode::default()).unwrap();
        (registry, state)
    }

    #[test]
    fn every_raw_id_round_trips() {
        for raw in 0..256 {
            if let Some(key) = NavKey::from_raw(raw) {
                assert_eq!(key.raw(), raw);
            }
        }
        assert_eq!(NavKey::from_raw(72), Some(NavKey::Up));
        assert_eq!(NavKey::from_raw(scan::F11), Some(NavKey::F(11)));
        assert_eq!(NavKey::from_raw(30), None);
    }

    #[test]
    fn bgi_codes_differ_only_for_f11_and_f12() {
        assert_eq!(NavKey::Up.code(), 72);
        assert_eq!(NavKey::F(10).code(), 68);
        assert_eq!(NavKey::F(11).code(), 133);
        assert_eq!(NavKey::F(12).code(), 134);
    }

    #[test]
    fn mailbox_pairs_decode() {
        assert_eq!(Key::from_mailbox(-1, 65), None);
        assert_eq!(Key::from_mailbox(0, 65), Some(Key::Char('A')));
        assert_eq!(Key::from_mailbox(80, 0), Some(Key::Nav(NavKey::Down)));
        assert_eq!(Key::from_mailbox(999, 0), Some(Key::Unknown(999)));
    }

    #[test]
    fn second_key_is_dropped_until_acknowledged() {
        let (_registry, state) = state();
        let mut relay = KeyboardRelay::new();
        assert_eq!(relay.key_down(&state, scan::UP), Relay::Posted);
        assert_eq!(relay.key_down(&state, scan::DOWN), Relay::Dropped);
        assert_eq!(relay.char_input(&state, 'x'), Relay::Ignored);
        assert_eq!(state.pending_key(), Some(Key::Nav(NavKey::Up)));

        state.clear_key();
        assert_eq!(relay.char_input(&state, 'x'), Relay::Posted);
        assert_eq!(relay.char_input(&state, 'y'), Relay::Dropped);
        assert_eq!(state.pending_key(), Some(Key::Char('x')));
    }

    #[test]
    fn text_of_a_navigation_key_is_swallowed_once() {
        let (_registry, state) = state();
        let mut relay = KeyboardRelay::new();
        assert_eq!(relay.key_down(&state, scan::DELETE), Relay::Posted);
        assert_eq!(relay.char_input(&state, '\u{7f}'), Relay::Ignored);
        state.clear_key();
        assert_eq!(relay.char_input(&state, 'a'), Relay::Posted);
    }

    #[test]
    fn plain_keys_release_the_claim() {
        let (_registry, state) = state();
        let mut relay = KeyboardRelay::new();
        relay.key_down(&state, scan::UP);
        state.clear_key();
        assert_eq!(relay.key_down(&state, 30), Relay::Ignored);
        assert_eq!(relay.char_input(&state, 'a'), Relay::Posted);
    }
}

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const WINDOW_CLASS: &str = "BGI_SERVER";
pub const DIAGNOSTIC_WINDOW_CLASS: &str = "BGI_SERVER_INVISIBLE";

pub const KEYBOARD_READY: &str = "BGI_KeyboardReady";
pub const CLIENT_ALIVE: &str = "BGI_ClientAlive";
pub const SERVER_ALIVE: &str = "BGI_ServerAlive";
pub const SHARED_STATE: &str = "BGI_SharedState";
pub const SERVER_STARTED: &str = "BGI_ServerStarted";
pub const SERVER_REQUEST: &str = "BGI_ServerRequest";
pub const PALETTE: &str = "BGI_Palette";
pub const PAGES: [&str; 2] = ["BGI_PAGE1_SECTION", "BGI_PAGE2_SECTION"];

/// Prefix that scopes every named object to one session.
///
/// The empty namespace is the single-session layout: two clients started at
/// the same time would collide on it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    pub fn baseline() -> Self {
        Self(String::new())
    }

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let ok = name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !ok || name.len() > 64 {
            return Err(Error::InvalidConfig(format!(
                "namespace {name:?} must be at most 64 chars of [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(name))
    }

    /// A namespace no other live session uses (pid + wall clock nanos).
    pub fn unique() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(format!("s{}-{nanos:x}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_baseline(&self) -> bool {
        self.0.is_empty()
    }

    pub fn qualify(&self, name: &str) -> String {
        if self.0.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.0)
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<baseline>")
        } else {
            f.write_str(&self.0)
        }
    }
}

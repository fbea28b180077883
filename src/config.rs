//! Session configuration shared by the client and the display server.

use std::{env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    names::Namespace,
    page::{Geometry, PixelFormat},
};

/// JSON-encoded [`SessionConfig`] handed to the spawned server.
pub const ENV_SESSION: &str = "BGI_SESSION";
/// Path of the `bgi-server` binary to launch.
pub const ENV_SERVER: &str = "BGI_SERVER";
pub const ENV_RUNTIME_DIR: &str = "BGI_RUNTIME_DIR";
pub const ENV_STARTUP_TIMEOUT_MS: &str = "BGI_STARTUP_TIMEOUT_MS";
pub const ENV_LOG: &str = "BGI_LOG";

pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 10_000;
pub const MAX_SIDE: u32 = 0xFFF;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Mode {
    pub rgb: bool,
    pub fullscreen: bool,
    /// Run the server as a thread of the client instead of a process.
    pub release: bool,
    pub show_invisible_page: bool,
}

impl Mode {
    pub const RGB: u32 = 1;
    pub const FULLSCREEN: u32 = 2;
    pub const RELEASE: u32 = 4;
    pub const SHOW_INVISIBLE_PAGE: u32 = 8;

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.rgb {
            bits |= Self::RGB;
        }
        if self.fullscreen {
            bits |= Self::FULLSCREEN;
        }
        if self.release {
            bits |= Self::RELEASE;
        }
        if self.show_invisible_page {
            bits |= Self::SHOW_INVISIBLE_PAGE;
        }
        bits
    }

    /// Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            rgb: bits & Self::RGB != 0,
            fullscreen: bits & Self::FULLSCREEN != 0,
            release: bits & Self::RELEASE != 0,
            show_invisible_page: bits & Self::SHOW_INVISIBLE_PAGE != 0,
        }
    }

    /// Parse the legacy `initgraph` path string. Options are found by
    /// substring, so any delimiter (or none) works.
    pub fn from_options(options: &str) -> Self {
        Self {
            rgb: options.contains("RGB"),
            fullscreen: options.contains("FULL_SCREEN"),
            release: options.contains("DISABLE_DEBUG"),
            show_invisible_page: options.contains("SHOW_INVISIBLE_PAGE"),
        }
    }

    pub fn pixel_format(self) -> PixelFormat {
        if self.rgb {
            PixelFormat::Rgb32
        } else {
            PixelFormat::Indexed4
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphicsMode {
    VgaLo,
    VgaMed,
    VgaHi,
    Gm640x480,
    Gm800x600,
    Gm1024x768,
    Custom { width: u32, height: u32 },
}

impl GraphicsMode {
    pub const ALL: [GraphicsMode; 6] = [
        Self::VgaLo,
        Self::VgaMed,
        Self::VgaHi,
        Self::Gm640x480,
        Self::Gm800x600,
        Self::Gm1024x768,
    ];

    /// Mode number as `initgraph` takes it; `None` past `GM_1024x768`.
    pub fn from_code(code: i32) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i))
            .copied()
    }

    /// `CUSTOM_MODE(w, h)` packing: width in the low 16 bits.
    pub fn custom_from_code(code: u32) -> Self {
        Self::Custom {
            width: code & 0xFFFF,
            height: code >> 16,
        }
    }

    pub fn size(self) -> (u32, u32) {
        match self {
            Self::VgaLo => (640, 200),
            Self::VgaMed => (640, 350),
            Self::VgaHi | Self::Gm640x480 => (640, 480),
            Self::Gm800x600 => (800, 600),
            Self::Gm1024x768 => (1024, 768),
            Self::Custom { width, height } => (width, height),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::VgaLo => "VGA_LO",
            Self::VgaMed => "VGA_MED",
            Self::VgaHi => "VGA_HI",
            Self::Gm640x480 => "640x480",
            Self::Gm800x600 => "800x600",
            Self::Gm1024x768 => "1024x768",
            Self::Custom { .. } => "",
        }
    }
}

/// The legacy packed launch argument: width in bits 0-11, height in 12-23,
/// mode bits in 24-35.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpawnWord(pub u64);

impl SpawnWord {
    pub fn pack(width: u32, height: u32, mode: u32) -> Result<Self> {
        for (what, v) in [("width", width), ("height", height), ("mode", mode)] {
            if v > MAX_SIDE {
                return Err(Error::InvalidConfig(format!(
                    "{what} {v} does not fit in 12 bits"
                )));
            }
        }
        Ok(Self(
            u64::from(width) | u64::from(height) << 12 | u64::from(mode) << 24,
        ))
    }

    pub fn width(self) -> u32 {
        (self.0 & 0xFFF) as u32
    }

    pub fn height(self) -> u32 {
        (self.0 >> 12 & 0xFFF) as u32
    }

    pub fn mode(self) -> u32 {
        (self.0 >> 24 & 0xFFF) as u32
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub namespace: Namespace,
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

pub fn default_runtime_dir() -> PathBuf {
    env::var_os(ENV_RUNTIME_DIR)
        .or_else(|| env::var_os("XDG_RUNTIME_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
}

fn default_startup_timeout_ms() -> u64 {
    match env::var(ENV_STARTUP_TIMEOUT_MS) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(value = %v, "ignoring unparsable {ENV_STARTUP_TIMEOUT_MS}");
            DEFAULT_STARTUP_TIMEOUT_MS
        }),
        Err(_) => DEFAULT_STARTUP_TIMEOUT_MS,
    }
}

impl SessionConfig {
    pub fn new(width: u32, height: u32, mode: Mode) -> Result<Self> {
        let config = Self {
            width,
            height,
            mode,
            namespace: Namespace::baseline(),
            runtime_dir: default_runtime_dir(),
            startup_timeout_ms: default_startup_timeout_ms(),
        };
        config.validate()?;
        Ok(config)
    }

    /// What `initgraph(gm, options)` would open.
    pub fn for_graphics_mode(gm: GraphicsMode, options: &str) -> Result<Self> {
        let (width, height) = gm.size();
        let mut mode = Mode::from_options(options);
        if matches!(gm, GraphicsMode::Custom { .. }) {
            mode.fullscreen = false;
        }
        Self::new(width, height, mode)
    }

    pub fn from_spawn_word(word: SpawnWord) -> Result<Self> {
        Self::new(word.width(), word.height(), Mode::from_bits(word.mode()))
    }

    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (what, v) in [("width", self.width), ("height", self.height)] {
            if !(1..=MAX_SIDE).contains(&v) {
                return Err(Error::InvalidConfig(format!(
                    "{what} {v} is outside 1..={MAX_SIDE}"
                )));
            }
        }
        Namespace::new(self.namespace.as_str())?;
        Ok(())
    }

    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height, self.mode.pixel_format())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn spawn_word(&self) -> Result<SpawnWord> {
        SpawnWord::pack(self.width, self.height, self.mode.bits())
    }

    pub fn to_env_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(value)?;
        config.validate()?;
        Ok(config)
    }

    /// The config a parent put in [`ENV_SESSION`], if any.
    pub fn from_env() -> Result<Option<Self>> {
        match env::var(ENV_SESSION) {
            Ok(value) => Self::from_env_value(&value).map(Some),
            Err(_) => Ok(None),
        }
    }
}

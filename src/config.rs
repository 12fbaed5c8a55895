//! # Config
//!
//! User settings, read once from a TOML file and resolved into an immutable [`Settings`] snapshot
//! before any fix is applied. Hook callbacks capture the values they need from the snapshot by value.
//!
//! ```toml
//! name = "Borderlands GOTY Enhanced"
//! masterEnable = true
//!
//! [resolution]
//! width = 0   # 0 = use the desktop's
//! height = 0
//!
//! [fixes.fov]
//! enable = true
//! value = 90.0
//! proportional = false
//!
//! [startup]
//! delayMs = 1000
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Errors loading or resolving the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file couldn't be read
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Config file isn't valid TOML or has the wrong shape
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Neither the config nor the display gave a usable resolution
    #[error("no usable resolution (got {width}x{height})")]
    NoResolution {
        /// Resolved width
        width: u32,
        /// Resolved height
        height: u32,
    },
}

/// Configuration file contents
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Display name of the fix, also used for the log file
    pub name: String,
    /// Global switch; when off nothing is scanned, hooked or patched
    pub master_enable: bool,
    /// Target resolution
    pub resolution: ResolutionConfig,
    /// Per-fix settings
    pub fixes: FixesConfig,
    /// Startup behaviour
    pub startup: StartupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            master_enable: true,
            resolution: ResolutionConfig::default(),
            fixes: FixesConfig::default(),
            startup: StartupConfig::default(),
        }
    }
}

/// `[resolution]`
#[allow(missing_docs, clippy::missing_docs_in_private_items)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// 0 means the desktop width
    pub width: u32,
    /// 0 means the desktop height
    pub height: u32,
}

/// `[fixes]`
#[allow(missing_docs, clippy::missing_docs_in_private_items)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FixesConfig {
    pub fov: FovConfig,
}

/// `[fixes.fov]`
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FovConfig {
    /// Whether the FOV fix runs
    pub enable: bool,
    /// Baseline FOV in degrees, as it should look at 16:9
    pub value: f32,
    /// Scale whatever FOV the game chose instead of replacing it
    pub proportional: bool,
}

impl Default for FovConfig {
    fn default() -> Self {
        Self {
            enable: false,
            value: 90.0,
            proportional: false,
        }
    }
}

/// `[startup]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartupConfig {
    /// Time to wait after attaching before scanning
    pub delay_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self { delay_ms: 1000 }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

impl Config {
    /// Reads and parses the file at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        content.parse()
    }

    /// Fills in the desktop resolution where needed and derives the aspect ratio
    pub fn resolve(&self, display: &dyn DisplayQuery) -> Result<Settings, ConfigError> {
        let (mut width, mut height) = (self.resolution.width, self.resolution.height);
        if width == 0 || height == 0 {
            (width, height) = display.dimensions();
        }
        if width == 0 || height == 0 {
            return Err(ConfigError::NoResolution { width, height });
        }

        let settings = Settings {
            name: self.name.clone(),
            master_enable: self.master_enable,
            width,
            height,
            aspect_ratio: width as f32 / height as f32,
            fov: self.fixes.fov,
            startup_delay: Duration::from_millis(self.startup.delay_ms),
        };
        settings.log();
        Ok(settings)
    }
}

/// Source of the current display resolution
pub trait DisplayQuery {
    /// Width and height in pixels; zeros if unknown
    fn dimensions(&self) -> (u32, u32);
}

/// The primary monitor
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Desktop;

#[cfg(windows)]
impl DisplayQuery for Desktop {
    fn dimensions(&self) -> (u32, u32) {
        use windows::Win32::UI::WindowsAndMessaging::{
            GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN,
        };

        // SAFETY: GetSystemMetrics has no preconditions and returns 0 on failure.
        let (width, height) =
            unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        (width.max(0) as u32, height.max(0) as u32)
    }
}

/// A display of fixed size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDisplay {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl DisplayQuery for FixedDisplay {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Resolved settings every fix works from
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Display name of the fix
    pub name: String,
    /// Global switch
    pub master_enable: bool,
    /// Target width in pixels, never 0
    pub width: u32,
    /// Target height in pixels, never 0
    pub height: u32,
    /// `width / height`
    pub aspect_ratio: f32,
    /// FOV fix settings
    pub fov: FovConfig,
    /// Delay before fixes are applied
    pub startup_delay: Duration,
}

impl Settings {
    /// Aspect ratio in lowest terms, e.g. `64:27` for 2560x1080
    pub fn reduced_aspect(&self) -> AspectRatio {
        let divisor = gcd(self.width, self.height);
        AspectRatio(self.width / divisor, self.height / divisor)
    }

    /// Writes every resolved value to the log
    fn log(&self) {
        info!("Name: {}", self.name);
        info!("MasterEnable: {}", self.master_enable);
        info!("Resolution.Width: {}", self.width);
        info!("Resolution.Height: {}", self.height);
        info!("Resolution.AspectRatio: {}", self.aspect_ratio);
        info!("Fix.Fov.Enable: {}", self.fov.enable);
        info!("Fix.Fov.Value: {}", self.fov.value);
        info!("Fix.Fov.Proportional: {}", self.fov.proportional);
        info!("Startup.Delay: {:?}", self.startup_delay);
    }
}

/// Width to height ratio in lowest terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio(pub u32, pub u32);

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// Greatest common divisor
fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

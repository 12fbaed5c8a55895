//! # Fix
//!
//! Game fixes built from the lower layers: find code by pattern, hook or patch it, report what happened.
//!
//! Every fix is best-effort. A missing pattern or a failed hook skips that one action,
//! and nothing a fix does can stop another fix from being attempted.

use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::ErrorKind;
use crate::hook::{self, Callback, HookError, HookHandle};
use crate::image::ModuleImage;
use crate::patcher::{self, PatchError, PatchSite};
use crate::pattern::{self, format_bytes, BytePattern, MatchSet, PatternError};

pub mod fov;
pub mod resolution;

#[cfg(test)]
pub(crate) mod testing;

pub use fov::{corrected_fov, proportional_fov, FovFix, NATIVE_ASPECT_RATIO};
pub use resolution::ResolutionFix;

/// Everything a fix may do to the process
pub trait Target {
    /// Load address of the module being fixed
    fn base(&self) -> usize;

    /// Every match of `pattern` in the module
    fn scan(&self, pattern: &BytePattern) -> MatchSet;

    /// Installs a mid hook at `address`
    fn hook(&self, address: usize, callback: Callback) -> Result<HookHandle, HookError>;

    /// Overwrites static data at `address`
    fn patch(&self, address: usize, bytes: &[u8]) -> Result<PatchSite, PatchError>;
}

/// The running process, fixing one of its modules
#[derive(Debug)]
pub struct Process {
    /// Module the fixes scan
    image: ModuleImage,
}

impl Process {
    /// Targets `image`
    pub fn new(image: ModuleImage) -> Self {
        Self { image }
    }

    /// Module the fixes scan
    pub fn image(&self) -> &ModuleImage {
        &self.image
    }
}

impl Target for Process {
    fn base(&self) -> usize {
        self.image.base()
    }

    fn scan(&self, pattern: &BytePattern) -> MatchSet {
        pattern::scan(&self.image.region(), pattern)
    }

    fn hook(&self, address: usize, callback: Callback) -> Result<HookHandle, HookError> {
        hook::install_boxed(address, callback)
    }

    fn patch(&self, address: usize, bytes: &[u8]) -> Result<PatchSite, PatchError> {
        patcher::write(address, bytes)
    }
}

/// Why an action was skipped
#[derive(Debug, Error)]
pub enum SkipReason {
    /// Pattern isn't in the module
    #[error("did not find '{pattern}'")]
    PatternNotFound {
        /// Pattern that was searched for
        pattern: String,
    },
    /// Hook installation failed
    #[error(transparent)]
    Hook(#[from] HookError),
    /// Static patch failed
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// A configured value can't be used
    #[error("{name} = {value} is out of range")]
    OutOfRange {
        /// Setting name
        name: &'static str,
        /// Configured value
        value: f32,
    },
}

impl SkipReason {
    /// Classification of this skip, where it corresponds to an engine error
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::PatternNotFound { .. } => Some(ErrorKind::PatternNotFound),
            Self::Hook(e) => Some(e.kind()),
            Self::Patch(e) => Some(e.kind()),
            Self::OutOfRange { .. } => None,
        }
    }
}

/// What happened to one action of a fix
#[derive(Debug)]
pub enum Outcome {
    /// A hook was installed
    Hooked(HookHandle),
    /// Static data was overwritten
    Patched(PatchSite),
    /// The action was not carried out
    Skipped(SkipReason),
}

impl Outcome {
    /// Whether the action took effect
    pub fn succeeded(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }
}

/// Overall result of a fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixStatus {
    /// Switched off in the config
    Disabled,
    /// Every action took effect
    Applied,
    /// Some actions took effect
    Partial,
    /// No action took effect
    Skipped,
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Applied => "applied",
            Self::Partial => "partially applied",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Per-action outcomes of one fix
#[derive(Debug)]
pub struct FixReport {
    /// Fix name
    pub name: &'static str,
    /// Whether the fix ran at all
    pub enabled: bool,
    /// One entry per action, in order
    pub outcomes: Vec<Outcome>,
}

impl FixReport {
    /// An enabled fix with no outcomes yet
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: true,
            outcomes: Vec::new(),
        }
    }

    /// A fix that didn't run
    pub fn disabled(name: &'static str) -> Self {
        Self {
            name,
            enabled: false,
            outcomes: Vec::new(),
        }
    }

    /// Derived overall status
    pub fn status(&self) -> FixStatus {
        if !self.enabled {
            return FixStatus::Disabled;
        }
        let succeeded = self.outcomes.iter().filter(|o| o.succeeded()).count();
        match succeeded {
            0 => FixStatus::Skipped,
            n if n == self.outcomes.len() => FixStatus::Applied,
            _ => FixStatus::Partial,
        }
    }

    /// Installed hooks
    pub fn hooks(&self) -> impl Iterator<Item = &HookHandle> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Hooked(handle) => Some(handle),
            _ => None,
        })
    }

    /// Applied patches
    pub fn patches(&self) -> impl Iterator<Item = &PatchSite> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Patched(site) => Some(site),
            _ => None,
        })
    }

    /// Reasons for skipped actions
    pub fn skipped(&self) -> impl Iterator<Item = &SkipReason> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Skipped(reason) => Some(reason),
            _ => None,
        })
    }
}

/// A single game fix
pub trait Fix: Send {
    /// Name used in logs and reports
    fn name(&self) -> &'static str;

    /// Whether `settings` switch this fix on
    fn enabled(&self, settings: &Settings) -> bool;

    /// Carries out every action of the fix against `target`
    fn apply(&self, target: &dyn Target, settings: &Settings) -> FixReport;
}

/// A code location: `offset` bytes past the first match of `pattern`
#[derive(Debug, Clone)]
pub struct Signature {
    /// Pattern locating the code
    pattern: BytePattern,
    /// Distance from the match to the instruction of interest
    offset: usize,
}

impl Signature {
    /// Parses `pattern`
    pub fn new(pattern: &str, offset: usize) -> Result<Self, PatternError> {
        Ok(Self {
            pattern: pattern.parse()?,
            offset,
        })
    }

    /// Pattern locating the code
    pub fn pattern(&self) -> &BytePattern {
        &self.pattern
    }

    /// Distance from the match to the instruction of interest
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Scans `target` and returns the address of the instruction of interest.
    /// With several matches the first one wins.
    pub fn locate(&self, target: &dyn Target) -> Result<usize, SkipReason> {
        let matches = target.scan(&self.pattern);
        match matches.first() {
            Some(address) => {
                let rva = address.wrapping_sub(target.base());
                if matches.len() > 1 {
                    info!(
                        "Found '{}' @ {:#x} ({} matches, using the first)",
                        self.pattern,
                        rva,
                        matches.len()
                    );
                } else {
                    info!("Found '{}' @ {:#x}", self.pattern, rva);
                }
                Ok(address + self.offset)
            }
            None => {
                warn!("Did not find '{}'", self.pattern);
                Err(SkipReason::PatternNotFound {
                    pattern: self.pattern.to_string(),
                })
            }
        }
    }

    /// Locates the instruction and hooks it with `callback`
    pub fn hook(&self, target: &dyn Target, callback: Callback) -> Outcome {
        let address = match self.locate(target) {
            Ok(address) => address,
            Err(reason) => return Outcome::Skipped(reason),
        };
        let rva = address.wrapping_sub(target.base());

        match target.hook(address, callback) {
            Ok(handle) => {
                info!(
                    "Hooked @ {:#x} + {:#x} = {:#x}",
                    rva.wrapping_sub(self.offset),
                    self.offset,
                    rva
                );
                Outcome::Hooked(handle)
            }
            Err(e) => {
                warn!("Failed to hook {:#x}: {}", rva, e);
                Outcome::Skipped(e.into())
            }
        }
    }
}

/// Overwrites static data `offset` bytes into the module
pub fn patch_static(target: &dyn Target, offset: usize, bytes: &[u8]) -> Outcome {
    let address = target.base() + offset;
    match target.patch(address, bytes) {
        Ok(site) => {
            info!("Patched '{}' @ {:#x}", format_bytes(bytes), address);
            Outcome::Patched(site)
        }
        Err(e) => {
            warn!("Failed to patch {:#x}: {}", address, e);
            Outcome::Skipped(e.into())
        }
    }
}

/// Runs a set of fixes once the process has had time to start up
pub struct Orchestrator {
    /// Resolved settings every fix reads
    settings: Settings,
    /// Fixes, applied in order
    fixes: Vec<Box<dyn Fix>>,
}

impl Orchestrator {
    /// Runs the resolution and FOV fixes
    pub fn new(settings: Settings) -> Result<Self, PatternError> {
        let fixes: Vec<Box<dyn Fix>> = vec![
            Box::new(ResolutionFix::new()?),
            Box::new(FovFix::new()?),
        ];
        Ok(Self::with_fixes(settings, fixes))
    }

    /// Runs `fixes` instead of the defaults
    pub fn with_fixes(settings: Settings, fixes: Vec<Box<dyn Fix>>) -> Self {
        Self { settings, fixes }
    }

    /// Settings the fixes read
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Applies every enabled fix to `target`, one after the other.
    ///
    /// When the master switch is off, `target` isn't touched at all.
    pub fn run(&self, target: &dyn Target) -> Vec<FixReport> {
        if !self.settings.master_enable {
            info!("Master switch off, leaving the game untouched");
            return self
                .fixes
                .iter()
                .map(|fix| FixReport::disabled(fix.name()))
                .collect();
        }

        self.fixes
            .iter()
            .map(|fix| {
                let enabled = fix.enabled(&self.settings);
                info!(
                    "{} fix {}",
                    fix.name(),
                    if enabled { "enabled" } else { "disabled" }
                );
                let report = if enabled {
                    fix.apply(target, &self.settings)
                } else {
                    FixReport::disabled(fix.name())
                };
                info!("{} fix {}", fix.name(), report.status());
                report
            })
            .collect()
    }

    /// Runs the fixes on a dedicated thread after the configured startup delay
    pub fn spawn<T>(self, target: T) -> io::Result<JoinHandle<Vec<FixReport>>>
    where
        T: Target + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("{}-fixes", env!("CARGO_PKG_NAME")))
            .spawn(move || {
                info!("Waiting {:?} before applying fixes", self.settings.startup_delay);
                thread::sleep(self.settings.startup_delay);
                self.run(&target)
            })
    }
}

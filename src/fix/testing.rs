//! A [`Target`] that records calls instead of touching the process

use std::sync::Mutex;
use std::time::Duration;

use crate::config::{FovConfig, Settings};
use crate::hook::{Callback, Context, HookError, HookHandle};
use crate::patcher::{PatchError, PatchSite};
use crate::pattern::{self, BytePattern, MatchSet, ScanRegion};

use super::Target;

/// Bytes matching the resolution fix's width pattern
pub const WIDTH_SITE: [u8; 18] = [
    0x44, 0x8B, 0xC1, 0x41, 0x8D, 0x40, 0xFF, 0x48, 0x8B, 0x4C, 0x24, 0x30, 0xFF, 0x15, 0x11,
    0x22, 0x33, 0x44,
];

/// Bytes matching the resolution fix's height pattern
pub const HEIGHT_SITE: [u8; 12] = [
    0xFF, 0x15, 0x55, 0x66, 0x77, 0x88, 0x44, 0x8B, 0xC0, 0x45, 0x8B, 0xC8,
];

/// Bytes matching the FOV fix's pattern
pub const FOV_SITE: [u8; 26] = [
    0xF3, 0x0F, 0x11, 0x83, 0x10, 0x02, 0x00, 0x00, 0x8B, 0x83, 0x20, 0x02, 0x00, 0x00, 0x89,
    0x83, 0x30, 0x02, 0x00, 0x00, 0x48, 0x83, 0xC4, 0x20, 0x5B, 0xC3,
];

/// Settings for a `width`x`height` display, master switch on and FOV fix off
pub fn settings(width: u32, height: u32) -> Settings {
    Settings {
        name: "test".into(),
        master_enable: true,
        width,
        height,
        aspect_ratio: width as f32 / height as f32,
        fov: FovConfig::default(),
        startup_delay: Duration::ZERO,
    }
}

/// In-memory module image that remembers every scan, hook and patch
pub struct Recorder {
    /// Module contents
    image: Vec<u8>,
    /// Patterns scanned for
    scans: Mutex<Vec<String>>,
    /// Hooks requested
    hooks: Mutex<Vec<(usize, Callback)>>,
    /// Patches requested
    patches: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl Recorder {
    /// Wraps `image`
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            scans: Mutex::default(),
            hooks: Mutex::default(),
            patches: Mutex::default(),
        }
    }

    /// Number of scans made
    pub fn scan_count(&self) -> usize {
        self.scans.lock().unwrap().len()
    }

    /// Number of hooks installed
    pub fn hook_count(&self) -> usize {
        self.hooks.lock().unwrap().len()
    }

    /// Number of static patches written
    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    /// Hooked addresses, in install order
    pub fn hooked_addresses(&self) -> Vec<usize> {
        self.hooks.lock().unwrap().iter().map(|(a, _)| *a).collect()
    }

    /// Every patch as (address, bytes), in write order
    pub fn patches(&self) -> Vec<(usize, Vec<u8>)> {
        self.patches.lock().unwrap().clone()
    }

    /// Runs the `index`th hook's callback on `context`
    pub fn fire(&self, index: usize, context: &mut Context) {
        let hooks = self.hooks.lock().unwrap();
        (hooks[index].1)(context);
    }
}

impl Target for Recorder {
    fn base(&self) -> usize {
        self.image.as_ptr() as usize
    }

    fn scan(&self, pattern: &BytePattern) -> MatchSet {
        self.scans.lock().unwrap().push(pattern.to_string());
        pattern::scan(&ScanRegion::from_slice(&self.image), pattern)
    }

    fn hook(&self, address: usize, callback: Callback) -> Result<HookHandle, HookError> {
        self.hooks.lock().unwrap().push((address, callback));
        Ok(HookHandle::new(address, 0, 5))
    }

    fn patch(&self, address: usize, bytes: &[u8]) -> Result<PatchSite, PatchError> {
        self.patches.lock().unwrap().push((address, bytes.to_vec()));
        Ok(PatchSite::new(address, vec![0; bytes.len()]))
    }
}

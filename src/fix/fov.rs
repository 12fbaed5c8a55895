//! Field of view correction
//!
//! The game keeps its horizontal FOV fixed, so wider screens lose vertical view.
//! The hook replaces the FOV the game is about to store with one that keeps the
//! vertical FOV of a 16:9 screen.

use std::f32::consts::PI;

use tracing::{info, warn};

use crate::config::Settings;
use crate::hook::{Callback, Context, Xmm};
use crate::pattern::PatternError;

use super::{Fix, FixReport, Outcome, Signature, SkipReason, Target};

/// The FOV is in `xmm0` when it's stored at the start of this sequence
const FOV_PATTERN: &str =
    "F3 0F 11 ?? ?? ?? ?? ?? 8B ?? ?? ?? ?? ?? 89 ?? ?? ?? ?? ?? 48 83 ?? ?? 5B C3";

/// Aspect ratio the game's FOV values are tuned for
pub const NATIVE_ASPECT_RATIO: f32 = 16.0 / 9.0;

/// Horizontal FOV (degrees) that shows the same vertical FOV at `target_aspect`
/// as `value` does at `native_aspect`.
pub fn corrected_fov(value: f32, native_aspect: f32, target_aspect: f32) -> f32 {
    ((value * PI / 360.0).tan() / native_aspect * target_aspect).atan() * 360.0 / PI
}

/// [`corrected_fov`] applied relative to `observed`, the FOV the game chose itself
pub fn proportional_fov(
    value: f32,
    native_aspect: f32,
    target_aspect: f32,
    observed: f32,
) -> f32 {
    corrected_fov(value, native_aspect, target_aspect) * observed / value
}

/// Corrects the field of view for the configured aspect ratio
#[derive(Debug, Clone)]
pub struct FovFix {
    /// Where the FOV is stored
    site: Signature,
}

impl FovFix {
    /// Parses the fix's pattern
    pub fn new() -> Result<Self, PatternError> {
        Ok(Self {
            site: Signature::new(FOV_PATTERN, 0)?,
        })
    }
}

impl Fix for FovFix {
    fn name(&self) -> &'static str {
        "FOV"
    }

    fn enabled(&self, settings: &Settings) -> bool {
        settings.master_enable && settings.fov.enable
    }

    fn apply(&self, target: &dyn Target, settings: &Settings) -> FixReport {
        let mut report = FixReport::new(self.name());
        let value = settings.fov.value;
        if !(value > 0.0 && value < 180.0) {
            warn!("FOV {} is not between 0 and 180 degrees", value);
            report.outcomes.push(Outcome::Skipped(SkipReason::OutOfRange {
                name: "fixes.fov.value",
                value,
            }));
            return report;
        }

        let corrected = corrected_fov(value, NATIVE_ASPECT_RATIO, settings.aspect_ratio);
        let callback: Callback = if settings.fov.proportional {
            info!("FOV: scaling by {} ({} -> {})", corrected / value, value, corrected);
            Box::new(move |ctx: &mut Context| {
                let xmm0 = ctx.xmm_mut(Xmm::Xmm0);
                let observed = xmm0.f32(0);
                xmm0.set_f32(0, corrected * observed / value);
            })
        } else {
            info!("FOV: {} -> {}", value, corrected);
            Box::new(move |ctx: &mut Context| ctx.xmm_mut(Xmm::Xmm0).set_f32(0, corrected))
        };

        report.outcomes.push(self.site.hook(target, callback));
        report
    }
}

//! Custom render resolution
//!
//! The game derives its resolution from the desktop in two places. Both are hooked so the
//! configured width and height are substituted right after the game computes its own, and
//! the static copies in the data section are overwritten as well.

use tracing::info;

use crate::config::Settings;
use crate::hook::{Context, Gpr};
use crate::pattern::PatternError;

use super::{patch_static, Fix, FixReport, Signature, Target};

/// Width arrives in `eax` here
const WIDTH_PATTERN: &str = "44 8B ?? 41 8D ?? ?? 48 8B ?? ?? ?? FF 15 ?? ?? ?? ??";
/// Height arrives in `eax` six bytes into this one, right after the call returns
const HEIGHT_PATTERN: &str = "FF 15 ?? ?? ?? ?? 44 8B ?? 45 8B ??";
/// Module offset of the static width, a little-endian `u32`
const WIDTH_SLOT: usize = 0x25E50A0;
/// Module offset of the static height
const HEIGHT_SLOT: usize = 0x25E50A4;

/// Forces the configured resolution
#[derive(Debug, Clone)]
pub struct ResolutionFix {
    /// Where the width is computed
    width: Signature,
    /// Where the height is computed
    height: Signature,
}

impl ResolutionFix {
    /// Parses the fix's patterns
    pub fn new() -> Result<Self, PatternError> {
        Ok(Self {
            width: Signature::new(WIDTH_PATTERN, 0)?,
            height: Signature::new(HEIGHT_PATTERN, 6)?,
        })
    }
}

impl Fix for ResolutionFix {
    fn name(&self) -> &'static str {
        "Resolution"
    }

    fn enabled(&self, settings: &Settings) -> bool {
        settings.master_enable
    }

    fn apply(&self, target: &dyn Target, settings: &Settings) -> FixReport {
        let (width, height) = (settings.width, settings.height);
        info!("Resolution: {}x{}", width, height);
        info!(
            "Aspect Ratio: {} {}",
            settings.reduced_aspect(),
            settings.aspect_ratio
        );

        let mut report = FixReport::new(self.name());
        report.outcomes.push(self.width.hook(
            target,
            Box::new(move |ctx: &mut Context| ctx.set_gpr(Gpr::Rax, width as u64)),
        ));
        report.outcomes.push(self.height.hook(
            target,
            Box::new(move |ctx: &mut Context| ctx.set_gpr(Gpr::Rax, height as u64)),
        ));
        report
            .outcomes
            .push(patch_static(target, WIDTH_SLOT, &width.to_le_bytes()));
        report
            .outcomes
            .push(patch_static(target, HEIGHT_SLOT, &height.to_le_bytes()));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fix::testing::{settings, Recorder, HEIGHT_SITE, WIDTH_SITE};
    use crate::fix::{FixStatus, Outcome, SkipReason};

    #[test]
    /// Three copies of the width site and no height site: one hook at the first copy, one skip
    fn test_first_match_and_missing_pattern() {
        let mut image = vec![0u8; 0x1000];
        for offset in [0x100, 0x200, 0x300] {
            image[offset..offset + WIDTH_SITE.len()].copy_from_slice(&WIDTH_SITE);
        }
        let target = Recorder::new(image);

        let report = ResolutionFix::new()
            .unwrap()
            .apply(&target, &settings(2560, 1080));

        assert_eq!(target.hooked_addresses(), [target.base() + 0x100]);
        assert!(matches!(report.outcomes[0], Outcome::Hooked(_)));
        assert!(matches!(
            report.outcomes[1],
            Outcome::Skipped(SkipReason::PatternNotFound { .. })
        ));
        assert!(!report.outcomes[1].succeeded());
        assert_eq!(
            report.skipped().next().and_then(SkipReason::kind),
            Some(ErrorKind::PatternNotFound)
        );
        // static slots are written regardless
        assert_eq!(report.patches().count(), 2);
        assert_eq!(report.status(), FixStatus::Partial);
    }

    #[test]
    /// The callbacks put the configured values into rax and the slots get the same values
    fn test_values() {
        let mut image = vec![0u8; 0x400];
        image[0x10..0x10 + WIDTH_SITE.len()].copy_from_slice(&WIDTH_SITE);
        image[0x80..0x80 + HEIGHT_SITE.len()].copy_from_slice(&HEIGHT_SITE);
        let target = Recorder::new(image);

        let report = ResolutionFix::new()
            .unwrap()
            .apply(&target, &settings(3440, 1440));
        assert_eq!(report.status(), FixStatus::Applied);

        // the width site's `FF 15` isn't followed by the height sequence
        let hooked = target.hooked_addresses();
        assert_eq!(hooked[0], target.base() + 0x10);
        assert_eq!(hooked[1], target.base() + 0x80 + 6);

        let mut ctx = Context::default();
        ctx.set_gpr(Gpr::Rax, 1920);
        target.fire(0, &mut ctx);
        assert_eq!(ctx.gpr(Gpr::Rax), 3440);
        target.fire(1, &mut ctx);
        assert_eq!(ctx.gpr(Gpr::Rax), 1440);
        assert_eq!(ctx.gpr(Gpr::Rcx), 0);

        let patches = target.patches();
        assert_eq!(patches[0].0, target.base() + WIDTH_SLOT);
        assert_eq!(patches[0].1, 3440u32.to_le_bytes());
        assert_eq!(patches[1].0, target.base() + HEIGHT_SLOT);
        assert_eq!(patches[1].1, 1440u32.to_le_bytes());
    }
}

// Debug configuration surface
//
// `spec.md` §6 lists the debug CVars a host surfaces (`rt_debug_*`). CVar
// parsing and the console itself are host territory, but the shape of
// the configuration the core reads from them is ours. This plays the
// same role the teacher's `CreateInfo` builders play for `Thundr`/
// `Renderer`: a small plain struct with a `Default` impl, passed in by
// the host instead of being force-fit into a global registry.
//
// Austin Shafer - 2024
use bitflags::bitflags;

/// Selects a debug visualization channel in place of the lit image.
/// Mirrors `rt_debug_display_only`'s enum-name selection; `None`-like
/// behavior is represented by `DebugConfig::display_only` being `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugDisplayMode {
    BaseColor,
    Normals,
    Emissive,
    DirectLighting,
    IndirectLighting,
    Metalness,
    Roughness,
    MotionVectors,
}

bitflags! {
    /// `rt_debug_flags` is documented as "one flag name at a time", but
    /// the underlying CVar is a bitmask (`WHITE_FURNACE` and friends), so
    /// this models the full set rather than an enum the host would have
    /// to re-wrap.
    #[derive(Default)]
    pub struct DebugFlags: u32 {
        /// Replace all surface albedo with white, isolating lighting
        /// contribution from material response.
        const WHITE_FURNACE = 1 << 0;
        /// Disable indirect (bounce) lighting.
        const NO_INDIRECT = 1 << 1;
        /// Disable direct lighting.
        const NO_DIRECT = 1 << 2;
    }
}

/// Debug-only knobs the host exposes to the core.
///
/// None of this gates correctness: a `GpuContext` built with
/// `DebugConfig::default()` behaves exactly as a release build would.
#[derive(Debug, Clone, Default)]
pub struct DebugConfig {
    pub display_only: Option<DebugDisplayMode>,
    pub flags: DebugFlags,
    /// When set, the RT UBO's per-frame random seed is pinned to this
    /// value instead of being drawn fresh, for reproducible screenshots.
    pub fixed_random_seed: Option<u32>,
    /// Forces `TRIANGLE_FACING_CULL_DISABLE` on every TLAS instance,
    /// overriding each instance's own material-mode culling choice.
    pub force_backface_culling: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_inert() {
        let cfg = DebugConfig::default();
        assert!(cfg.display_only.is_none());
        assert!(cfg.flags.is_empty());
        assert!(cfg.fixed_random_seed.is_none());
        assert!(!cfg.force_backface_culling);
    }

    #[test]
    fn flags_compose() {
        let flags = DebugFlags::WHITE_FURNACE | DebugFlags::NO_INDIRECT;
        assert!(flags.contains(DebugFlags::WHITE_FURNACE));
        assert!(flags.contains(DebugFlags::NO_INDIRECT));
        assert!(!flags.contains(DebugFlags::NO_DIRECT));
    }
}

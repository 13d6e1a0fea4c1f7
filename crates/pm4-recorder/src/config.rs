use pm4_winsys::{DebugFlags, WinsysConfig};
use tracing::warn;

use crate::caps::{ChipCaps, GfxLevel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub gfx_level: GfxLevel,
    pub debug: DebugFlags,
    /// Storage buffers are read through the vector cache only, so storage reads do not
    /// need a scalar cache invalidate.
    pub use_llvm_ssbo_path: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gfx_level: GfxLevel::Gfx9,
            debug: DebugFlags::empty(),
            use_llvm_ssbo_path: false,
        }
    }
}

impl DeviceConfig {
    pub const GFX_LEVEL_ENV_VAR: &'static str = "PM4_GFX_LEVEL";

    /// Reads `PM4_DEBUG` and `PM4_GFX_LEVEL`. Unset or invalid values keep the defaults.
    pub fn from_env() -> Self {
        let mut config = Self {
            debug: DebugFlags::from_env(),
            ..Self::default()
        };
        if let Ok(level) = std::env::var(Self::GFX_LEVEL_ENV_VAR) {
            match level.parse() {
                Ok(level) => config.gfx_level = level,
                Err(err) => warn!(%err, "ignoring {}", Self::GFX_LEVEL_ENV_VAR),
            }
        }
        config
    }

    pub fn caps(&self) -> ChipCaps {
        ChipCaps::for_level(self.gfx_level)
    }

    /// Winsys settings for this device. Chips that cannot chain IBs record into host memory.
    pub fn winsys_config(&self) -> WinsysConfig {
        let mut winsys = WinsysConfig::from_debug_flags(self.debug);
        if !self.caps().supports_ib_chaining {
            winsys.use_ib_bos = false;
        }
        winsys
    }
}

use bitflags::bitflags;
use tracing::warn;

bitflags! {
    /// Debug switches, normally read from `PM4_DEBUG` (comma separated, case insensitive).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Record into host memory and copy into IBs at submit time.
        const NO_IBS = 1 << 0;
        /// Always inline secondary command streams.
        const NO_NESTED_IB = 1 << 1;
        /// Wait for idle after every draw and dispatch.
        const SYNC_SHADERS = 1 << 2;
        /// Write an incrementing trace id after every draw and dispatch.
        const TRACE = 1 << 3;
        const NO_PREFETCH = 1 << 4;
        /// Reference every globally tracked buffer in each submission.
        const ALL_BOS = 1 << 5;
    }
}

impl DebugFlags {
    pub const ENV_VAR: &'static str = "PM4_DEBUG";

    const NAMES: [(&'static str, DebugFlags); 6] = [
        ("noibs", DebugFlags::NO_IBS),
        ("nonestedib", DebugFlags::NO_NESTED_IB),
        ("syncshaders", DebugFlags::SYNC_SHADERS),
        ("trace", DebugFlags::TRACE),
        ("noprefetch", DebugFlags::NO_PREFETCH),
        ("allbos", DebugFlags::ALL_BOS),
    ];

    pub fn parse(list: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let name = name.to_ascii_lowercase();
            match Self::NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, flag)) => flags |= *flag,
                None => warn!(option = %name, "ignoring unknown {} option", Self::ENV_VAR),
            }
        }
        flags
    }

    pub fn from_env() -> Self {
        std::env::var(Self::ENV_VAR)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WinsysConfig {
    /// Back command streams with GPU buffer objects and chain them. When false the
    /// sysmem path is used.
    pub use_ib_bos: bool,
    /// Secondary streams may be launched as nested IBs.
    pub allow_nested_ib: bool,
    /// Size of the first segment of a new command stream.
    pub initial_ib_dwords: usize,
    pub debug_all_bos: bool,
}

impl Default for WinsysConfig {
    fn default() -> Self {
        Self {
            use_ib_bos: true,
            allow_nested_ib: true,
            initial_ib_dwords: 20 * 1024,
            debug_all_bos: false,
        }
    }
}

impl WinsysConfig {
    pub fn from_debug_flags(flags: DebugFlags) -> Self {
        Self {
            use_ib_bos: !flags.contains(DebugFlags::NO_IBS),
            allow_nested_ib: !flags.contains(DebugFlags::NO_NESTED_IB),
            debug_all_bos: flags.contains(DebugFlags::ALL_BOS),
            ..Self::default()
        }
    }
}

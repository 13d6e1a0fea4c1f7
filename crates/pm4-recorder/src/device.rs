//! The device: chip capabilities, the winsys, collaborators and device-wide caches.

use std::sync::Arc;

use pm4_winsys::bo::PRIORITY_FENCE;
use pm4_winsys::{
    Bo, BoAllocator, BoDesc, BoFlags, DebugFlags, Domain, KernelDevice, Winsys,
};
use tracing::debug;

use crate::cache::{PrologCache, PrologCompiler, VsProlog, VsPrologKey};
use crate::caps::ChipCaps;
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::renderpass::MetaOps;
use crate::resources::Event;
use crate::stats::RecorderStats;

/// External components the recorder calls into.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub prolog_compiler: Option<Arc<dyn PrologCompiler>>,
    pub meta_ops: Option<Arc<dyn MetaOps>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("prolog_compiler", &self.prolog_compiler.is_some())
            .field("meta_ops", &self.meta_ops.is_some())
            .finish()
    }
}

pub struct Device {
    config: DeviceConfig,
    caps: ChipCaps,
    winsys: Winsys,
    collaborators: Collaborators,
    prolog_cache: PrologCache,
    stats: RecorderStats,
    /// Receives the id of the last traced draw or dispatch.
    trace_bo: Option<Arc<Bo>>,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        allocator: Arc<dyn BoAllocator>,
        kernel: Arc<dyn KernelDevice>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        let caps = config.caps();
        let winsys = Winsys::new(config.winsys_config(), allocator, kernel);

        let trace_bo = if config.debug.contains(DebugFlags::TRACE) {
            let bo = winsys.create_bo(&BoDesc {
                size: 4096,
                domain: Domain::Gtt,
                flags: BoFlags::CPU_ACCESS | BoFlags::NO_INTERPROCESS_SHARING,
                priority: PRIORITY_FENCE,
                ..BoDesc::default()
            })?;
            winsys.make_resident(&bo, true);
            Some(bo)
        } else {
            None
        };

        debug!(
            gfx_level = %config.gfx_level,
            debug = ?config.debug,
            use_ib_bos = winsys.config().use_ib_bos,
            "created device"
        );
        Ok(Arc::new(Self {
            config,
            caps,
            winsys,
            collaborators,
            prolog_cache: PrologCache::new(),
            stats: RecorderStats::new(),
            trace_bo,
        }))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn caps(&self) -> &ChipCaps {
        &self.caps
    }

    pub fn winsys(&self) -> &Winsys {
        &self.winsys
    }

    pub fn stats(&self) -> &RecorderStats {
        &self.stats
    }

    pub fn trace_bo(&self) -> Option<&Arc<Bo>> {
        self.trace_bo.as_ref()
    }

    /// Id written by the last traced draw or dispatch that reached the GPU.
    pub fn read_trace_id(&self) -> Option<u32> {
        self.trace_bo
            .as_ref()
            .and_then(|bo| bo.read_words(0, 1).first().copied())
    }

    pub fn meta_ops(&self) -> Option<&Arc<dyn MetaOps>> {
        self.collaborators.meta_ops.as_ref()
    }

    pub fn prolog_cache(&self) -> &PrologCache {
        &self.prolog_cache
    }

    /// Returns the prolog for `key`, compiling it on the first request.
    pub fn vs_prolog(&self, key: &VsPrologKey) -> Result<Arc<VsProlog>> {
        let compiler = self
            .collaborators
            .prolog_compiler
            .as_ref()
            .unwrap_or_else(|| panic!("dynamic vertex input without a prolog compiler"));
        let (prolog, hit) = self.prolog_cache.get_or_try_insert_with(key.clone(), |key| {
            compiler.compile_vs_prolog(key).map(Arc::new)
        })?;
        if hit {
            self.stats.inc_prolog_cache_hits();
        } else {
            self.stats.inc_prolog_cache_misses();
            debug!(
                key = key.hash_value(),
                attributes = key.attributes.len(),
                "compiled vertex prolog"
            );
        }
        Ok(prolog)
    }

    /// Creates an event in the reset state.
    pub fn create_event(&self) -> Result<Event> {
        let bo = self.winsys.create_bo(&BoDesc {
            size: 8,
            alignment: 8,
            domain: Domain::Gtt,
            flags: BoFlags::CPU_ACCESS,
            priority: PRIORITY_FENCE,
        })?;
        bo.write_words(0, &[0]);
        Ok(Event { bo })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

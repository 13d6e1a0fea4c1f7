//! Buffer lists for submissions.

use std::borrow::Cow;
use std::sync::{Arc, RwLock};

use hashbrown::HashMap;

use crate::bo::{Bo, BoEntry, BoHandle};
use crate::cs::CmdStream;

/// Ordered, de-duplicated list of buffer references.
///
/// A handle added twice keeps its first position and the higher of the two priorities.
#[derive(Debug, Default)]
pub struct BoListBuilder {
    entries: Vec<BoEntry>,
    index: HashMap<BoHandle, usize>,
}

impl BoListBuilder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, entry: BoEntry) {
        match self.index.get(&entry.handle) {
            Some(&i) => {
                let existing = &mut self.entries[i];
                existing.priority = existing.priority.max(entry.priority);
            }
            None => {
                self.index.insert(entry.handle, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn add_stream(&mut self, cs: &CmdStream) {
        for entry in cs.handles() {
            self.add(*entry);
        }
        for sparse in cs.virtual_buffers() {
            for backing in sparse.backing_bos() {
                self.add(backing.entry());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self) -> Vec<BoEntry> {
        self.entries
    }
}

/// Builds the buffer list for `streams` plus `extra` buffers.
///
/// A single stream without virtual buffers and without extra buffers has its own handle
/// list reused as is.
pub fn build_bo_list<'a>(streams: &[&'a CmdStream], extra: &[BoEntry]) -> Cow<'a, [BoEntry]> {
    if let [single] = streams {
        if single.virtual_buffers().is_empty() && extra.is_empty() {
            return Cow::Borrowed(single.handles());
        }
    }
    let total = streams.iter().map(|cs| cs.handles().len()).sum::<usize>() + extra.len();
    let mut builder = BoListBuilder::with_capacity(total);
    for cs in streams {
        builder.add_stream(cs);
    }
    for entry in extra {
        builder.add(*entry);
    }
    Cow::Owned(builder.finish())
}

/// Buffers that every submission references (made resident by the application).
#[derive(Debug, Default)]
pub struct GlobalBoList {
    bos: RwLock<Vec<Arc<Bo>>>,
}

impl GlobalBoList {
    pub fn set_resident(&self, bo: &Arc<Bo>, resident: bool) {
        let mut bos = self.bos.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let position = bos.iter().position(|b| b.handle() == bo.handle());
        match (resident, position) {
            (true, None) => bos.push(bo.clone()),
            (false, Some(i)) => {
                bos.swap_remove(i);
            }
            _ => {}
        }
    }

    pub fn entries(&self) -> Vec<BoEntry> {
        self.bos
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|bo| bo.entry())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bos
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

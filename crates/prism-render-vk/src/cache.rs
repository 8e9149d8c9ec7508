// SPDX-License-Identifier: CEPL-1.0
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::error::{GpuError, GpuResult};

/// Opaque key of a logical swapchain-bound resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub fn from_name(name: &str) -> Self {
        let mut h = DefaultHasher::new();
        name.hash(&mut h);
        ResourceId(h.finish())
    }
}

/// Resources tied to one swapchain generation, keyed by id and image slot.
///
/// Cleared in bulk whenever the swapchain is rebuilt. Each clear bumps the
/// generation so holders of stale ids can tell.
#[derive(Default)]
pub struct SwapchainBoundCache {
    entries: HashMap<ResourceId, Vec<Option<Box<dyn Any>>>>,
    generation: u64,
}

impl SwapchainBoundCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Ok(None)` when `id` was never stored or `slot` lies past its last
    /// entry. A slot left empty below a filled one, or holding another type,
    /// is an error.
    pub fn get<T: 'static>(&self, id: ResourceId, slot: usize) -> GpuResult<Option<&T>> {
        match self.entries.get(&id).and_then(|slots| slots.get(slot)) {
            Some(Some(res)) => res
                .downcast_ref::<T>()
                .map(Some)
                .ok_or(GpuError::CacheTypeMismatch { id, slot }),
            Some(None) => Err(GpuError::CacheSlotVacant { id, slot }),
            None => Ok(None),
        }
    }

    pub fn get_mut<T: 'static>(&mut self, id: ResourceId, slot: usize) -> GpuResult<Option<&mut T>> {
        match self.entries.get_mut(&id).and_then(|slots| slots.get_mut(slot)) {
            Some(Some(res)) => res
                .downcast_mut::<T>()
                .map(Some)
                .ok_or(GpuError::CacheTypeMismatch { id, slot }),
            Some(None) => Err(GpuError::CacheSlotVacant { id, slot }),
            None => Ok(None),
        }
    }

    /// Stores `resource` at `slot`, dropping whatever was there.
    pub fn insert<T: 'static>(&mut self, id: ResourceId, slot: usize, resource: T) {
        let slots = self.entries.entry(id).or_default();
        if slots.len() <= slot {
            slots.resize_with(slot + 1, || None);
        }
        slots[slot] = Some(Box::new(resource));
    }

    /// Returns the resource at `slot`, creating it with `make` on a miss or
    /// in a vacant slot.
    pub fn get_or_try_insert_with<T: 'static>(
        &mut self,
        id: ResourceId,
        slot: usize,
        make: impl FnOnce() -> GpuResult<T>,
    ) -> GpuResult<&mut T> {
        let slots = self.entries.entry(id).or_default();
        if slots.len() <= slot {
            slots.resize_with(slot + 1, || None);
        }
        let entry = &mut slots[slot];
        let res: Box<dyn Any> = match entry.take() {
            Some(res) => res,
            None => Box::new(make()?),
        };
        entry
            .insert(res)
            .downcast_mut::<T>()
            .ok_or(GpuError::CacheTypeMismatch { id, slot })
    }

    pub fn clear(&mut self) {
        let dropped = self.len();
        self.entries.clear();
        self.generation += 1;
        debug!(dropped, generation = self.generation, "swapchain cache cleared");
    }

    /// Number of occupied slots across all ids.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .map(|slots| slots.iter().filter(|s| s.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

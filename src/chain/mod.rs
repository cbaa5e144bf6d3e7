//! Chain construction and chain-wide control.
//!
//! [`ChainBuilder`] owns every stage of one chain in a single arena; stages
//! only reference their successor weakly, so dropping the builder tears the
//! whole chain down.
//!
//! ```text
//! descriptors ──load_filter_modules──▶ [stage 1] ─▶ [stage 2] ─▶ ... ─▶ listener
//!                                          ▲
//!                                    head (queue_work, start, stop...)
//! ```

pub mod allocator;
pub mod descriptor;

pub use allocator::{BlockPoolProvider, BufferAllocator, PlatformPools, PoolAllocator, PoolKind};
pub use descriptor::{FilterDescriptor, FilterFactory, StageKind};

use crate::config::ChainConfig;
use crate::error::{FilterError, Result};
use crate::filter::{Filter, FilterId, FilterListener, FilterState, FilterStatsSnapshot};
use crate::stages::StageFactory;
use crate::types::BufferUsage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of one stage for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterInfo {
    pub id: FilterId,
    pub name: String,
    pub state: FilterState,
    pub allocator_store_id: Option<u64>,
    pub usage: BufferUsage,
    pub has_allocator: bool,
    pub stats: FilterStatsSnapshot,
}

struct Slot {
    filter: Arc<dyn Filter>,
    allocator_store_id: Option<u64>,
    usage: BufferUsage,
}

/// Builds, provisions and controls one chain.
pub struct ChainBuilder {
    slots: Vec<Slot>,
    names: HashMap<String, FilterId>,
    listener: Option<Arc<dyn FilterListener>>,
    pools: Arc<dyn BlockPoolProvider>,
}

impl ChainBuilder {
    pub fn new(pools: Arc<dyn BlockPoolProvider>) -> Self {
        Self {
            slots: Vec::new(),
            names: HashMap::new(),
            listener: None,
            pools,
        }
    }

    /// Build, wire and provision a chain straight from configuration.
    pub fn from_config(
        config: &ChainConfig,
        factory: &StageFactory,
        listener: Arc<dyn FilterListener>,
    ) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::new(Arc::new(PlatformPools::new(&config.block_pool)));
        builder.set_callback(Some(listener))?;
        let descriptors = config.stages.iter().map(|s| factory.descriptor(s)).collect();
        builder.load_filter_modules(descriptors)?;
        if let Some(pool_id) = config.block_pool.default_pool_id {
            builder.set_block_pool(pool_id, BufferUsage::default())?;
        }
        Ok(builder)
    }

    /// Construct every stage in order and link them. On any failure the
    /// stages built so far are unlinked and released, and nothing is kept.
    pub fn load_filter_modules(
        &mut self,
        descriptors: Vec<FilterDescriptor>,
    ) -> Result<Arc<dyn Filter>> {
        if !self.slots.is_empty() {
            return Err(FilterError::Construction(
                "Chain already loaded".to_string(),
            ));
        }
        if descriptors.is_empty() {
            return Err(FilterError::Construction("No stages to load".to_string()));
        }

        let mut built: Vec<Slot> = Vec::with_capacity(descriptors.len());
        let mut names = HashMap::new();

        for (index, desc) in descriptors.into_iter().enumerate() {
            let id = FilterId::from_index(index);
            let name = desc.name.clone();
            match self.build_one(desc, id, built.last(), &names) {
                Ok(slot) => {
                    tracing::debug!(filter = %name, %id, "Stage loaded");
                    names.insert(name, id);
                    built.push(slot);
                }
                Err(e) => {
                    tracing::error!(filter = %name, "Chain construction failed: {}", e);
                    Self::teardown(built);
                    return Err(FilterError::Construction(format!(
                        "Stage '{}': {}",
                        name, e
                    )));
                }
            }
        }

        let head = built[0].filter.clone();
        self.slots = built;
        self.names = names;
        tracing::info!(stages = self.slots.len(), "Chain loaded");
        Ok(head)
    }

    fn build_one(
        &self,
        desc: FilterDescriptor,
        id: FilterId,
        prev: Option<&Slot>,
        names: &HashMap<String, FilterId>,
    ) -> Result<Slot> {
        if names.contains_key(&desc.name) {
            return Err(FilterError::InvalidParameter(format!(
                "duplicate stage name '{}'",
                desc.name
            )));
        }

        let filter = (desc.factory)(&desc.name)?;
        let wired = filter
            .set_id(id)
            .and_then(|_| match &self.listener {
                Some(listener) => filter.set_callback(Some(listener.clone())),
                None => Ok(()),
            })
            .and_then(|_| match prev {
                Some(prev) => prev.filter.set_next(Some(Arc::downgrade(&filter))),
                None => Ok(()),
            });

        if let Err(e) = wired {
            let _ = filter.release();
            return Err(e);
        }

        Ok(Slot {
            filter,
            allocator_store_id: desc.allocator_store_id,
            usage: desc.usage,
        })
    }

    /// Unlink and release in reverse build order, so no release propagates.
    fn teardown(built: Vec<Slot>) {
        for slot in built.into_iter().rev() {
            let _ = slot.filter.set_next(None);
            let _ = slot.filter.set_callback(None);
            if let Err(e) = slot.filter.release() {
                tracing::warn!(filter = %slot.filter.name(), "Release during teardown failed: {}", e);
            }
        }
    }

    /// Give every stage lacking an allocator one bound to its own pool, or
    /// to `pool_id` when it names none.
    pub fn set_block_pool(&mut self, pool_id: u64, usage: BufferUsage) -> Result<()> {
        for slot in &self.slots {
            if slot.filter.has_allocator() {
                continue;
            }
            let pool = slot.allocator_store_id.unwrap_or(pool_id);
            let allocator = self
                .pools
                .create_allocator(pool, slot.usage.union(usage))?;
            if let Some(kind) = self.pools.pool_kind(pool) {
                slot.filter.set_alloc_mode(kind.alloc_mode())?;
            }
            slot.filter.set_allocator(Some(allocator))?;
            tracing::debug!(filter = %slot.filter.name(), pool, "Allocator installed");
        }
        Ok(())
    }

    /// Remove every stage's allocator.
    pub fn clear_block_pool(&mut self) -> Result<()> {
        for slot in &self.slots {
            slot.filter.set_allocator(None)?;
        }
        Ok(())
    }

    /// Install the owner's listener on every stage, current and future.
    pub fn set_callback(&mut self, listener: Option<Arc<dyn FilterListener>>) -> Result<()> {
        for slot in &self.slots {
            slot.filter.set_callback(listener.clone())?;
        }
        self.listener = listener;
        Ok(())
    }

    pub fn head(&self) -> Option<Arc<dyn Filter>> {
        self.slots.first().map(|s| s.filter.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get_filter(&self, name: &str) -> Option<Arc<dyn Filter>> {
        let id = self.names.get(name)?;
        self.get_filter_by_id(*id)
    }

    pub fn get_filter_by_id(&self, id: FilterId) -> Option<Arc<dyn Filter>> {
        if id.is_owner() || !id.is_valid() {
            return None;
        }
        self.slots.get(id.index()).map(|s| s.filter.clone())
    }

    pub fn get_filter_list_info(&self) -> Vec<FilterInfo> {
        self.slots
            .iter()
            .map(|slot| FilterInfo {
                id: slot.filter.id(),
                name: slot.filter.name().to_string(),
                state: slot.filter.state(),
                allocator_store_id: slot.allocator_store_id,
                usage: slot.usage,
                has_allocator: slot.filter.has_allocator(),
                stats: slot.filter.stats(),
            })
            .collect()
    }

    fn head_or_err(&self) -> Result<Arc<dyn Filter>> {
        self.head()
            .ok_or_else(|| FilterError::Construction("Chain not loaded".to_string()))
    }

    // ── Chain-wide control; each call enters at the head and propagates ──

    pub fn start(&self) -> Result<()> {
        self.head_or_err()?.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.head_or_err()?.stop()
    }

    pub fn flush(&self) -> Result<()> {
        self.head_or_err()?.flush()
    }

    pub fn reset(&self) -> Result<()> {
        self.head_or_err()?.reset()
    }

    pub fn release(&self) -> Result<()> {
        self.head_or_err()?.release()
    }
}

//! Built-in stages and the factory that instantiates them from configuration.

pub mod gdc;
pub mod passthrough;
pub mod splitter;

pub use gdc::{GdcOptions, GdcStage};
pub use passthrough::PassthroughStage;
pub use splitter::SplitterStage;

use crate::chain::{FilterDescriptor, StageKind};
use crate::config::{EngineConfig, StageConfig};
use crate::error::{FilterError, Result};
use crate::filter::{Filter, FilterEngine, Stage};
use crate::hw::GdcDevice;
use crate::types::{BufferUsage, ParamBag};
use std::sync::Arc;

/// Creates stages by kind, sharing one engine configuration and the
/// hardware handles stages need.
#[derive(Clone)]
pub struct StageFactory {
    engine: EngineConfig,
    gdc_device: Option<Arc<dyn GdcDevice>>,
}

impl StageFactory {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            gdc_device: None,
        }
    }

    pub fn with_gdc_device(mut self, device: Arc<dyn GdcDevice>) -> Self {
        self.gdc_device = Some(device);
        self
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Create a stage of the given kind, wrapped in its engine.
    pub fn create(
        &self,
        kind: StageKind,
        name: &str,
        options: &ParamBag,
        usage: BufferUsage,
    ) -> Result<Arc<dyn Filter>> {
        match kind {
            StageKind::Passthrough => self.wrap(name, PassthroughStage),
            StageKind::Splitter => self.wrap(name, SplitterStage::from_options(options, usage)),
            StageKind::Gdc => {
                let device = self.gdc_device.clone().ok_or_else(|| {
                    FilterError::Construction(format!("No GDC device for stage '{}'", name))
                })?;
                let stage = GdcStage::new(device, GdcOptions::from_options(options), usage);
                self.wrap(name, stage)
            }
        }
    }

    /// Descriptor that builds `config`'s stage when the chain loads.
    pub fn descriptor(&self, config: &StageConfig) -> FilterDescriptor {
        let factory = self.clone();
        let kind = config.kind;
        let options = config.options.clone();
        let usage = config.usage;
        FilterDescriptor::new(config.name.clone(), move |name: &str| {
            factory.create(kind, name, &options, usage)
        })
        .with_store(config.allocator_store_id)
        .with_usage(usage)
    }

    fn wrap<S: Stage>(&self, name: &str, stage: S) -> Result<Arc<dyn Filter>> {
        let engine = FilterEngine::new(name, stage, &self.engine)?;
        Ok(Arc::new(engine))
    }
}

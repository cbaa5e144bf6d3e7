//! # filterchain-rs: asynchronous hardware filter chains
//!
//! Buffers travel through a linear chain of stages. Each stage owns a worker
//! pool, processes the buffers of every [`Work`](types::Work) it receives,
//! and hands the work to its successor once every input has a final
//! completion. The last stage reports to the chain owner's listener.
//!
//! ## Architecture
//!
//! - **Filter**: [`FilterEngine`] runs a [`Stage`](filter::Stage) behind the
//!   [`Filter`] lifecycle and correlates completions with their works
//! - **Worker**: [`WorkerPool`] executes process and control tasks, with
//!   session gating for in-order draining
//! - **Chain**: [`ChainBuilder`] constructs, links, provisions and controls
//!   a chain all-or-nothing
//! - **Hardware**: stages reach engines through traits such as
//!   [`GdcDevice`](hw::GdcDevice); [`SimulatedGdc`](hw::SimulatedGdc) stands
//!   in for real hardware
//! - **Communication**: crossbeam channels between workers, hardware threads
//!   and the owner's mailbox
//!
//! ## Configuration
//!
//! Chains are described by [`ChainConfig`], loaded from TOML or JSON. The
//! default location is the platform configuration directory under
//! `dev.filterchain.filterchain-rs`.
//!
//! ## Example
//!
//! ```ignore
//! use filterchain_rs::{
//!     buffer::{Buffer, PixelFormat},
//!     chain::ChainBuilder,
//!     config::ChainConfig,
//!     filter::{ChannelListener, Completion},
//!     hw::SimulatedGdc,
//!     stages::StageFactory,
//!     types::Work,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! let config = ChainConfig::sample();
//! let gdc = Arc::new(SimulatedGdc::new(true, Duration::from_millis(2))?);
//! let factory = StageFactory::new(config.engine.clone()).with_gdc_device(gdc);
//! let (listener, mailbox) = ChannelListener::new(config.engine.mailbox_capacity);
//! let chain = ChainBuilder::from_config(&config, &factory, listener)?;
//!
//! chain.start()?;
//! let frame = Buffer::graphic(1920, 1080, PixelFormat::Nv12);
//! chain.head().unwrap().queue_work(Work::new(0, vec![frame]))?;
//! if let Ok(Completion::Done { work, .. }) = mailbox.recv() {
//!     println!("{} buffers out", work.buffers.len());
//! }
//! chain.release()?;
//! ```

pub mod buffer;
pub mod chain;
pub mod config;
pub mod error;
pub mod filter;
pub mod hw;
pub mod logging;
pub mod stages;
pub mod sync;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use buffer::{Buffer, BufferId};
pub use chain::{ChainBuilder, FilterDescriptor, FilterInfo, StageKind};
pub use config::{ChainConfig, EngineConfig};
pub use error::{ErrorKind, FilterError, Result};
pub use filter::{Filter, FilterEngine, FilterId, FilterListener, FilterState};
pub use stages::StageFactory;
pub use types::{OutputKind, Work};
pub use worker::WorkerPool;

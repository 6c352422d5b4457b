//! Audio DSP firmware core, hosted: LL/EDF/DP scheduling, component pipelines, the
//! processing-module adapter and simulated DMA, all driven by a virtual clock.

pub mod buffer;
pub mod clock;
pub mod coherent;
pub mod component;
pub mod config;
pub mod control;
pub mod dma;
pub mod dsl;
pub mod error;
pub mod file;
pub mod gateway;
pub mod graph;
#[doc(hidden)]
pub mod harness;
pub mod heap;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod invariant_rt;
pub mod module;
pub mod pipeline;
pub mod plan;
pub mod ring;
pub mod schedule;
pub mod task;
pub mod timer;

pub use error::{Error, Result};

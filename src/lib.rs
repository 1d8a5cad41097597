//! Host-side orchestration of GPU compute kernels.
//!
//! The [`gpu`] module owns the device: context acquisition, kernel loading
//! and caching, work-group sizing, buffer staging and step dispatch. The
//! [`life`] and [`crack`] modules are the two workloads driven through it,
//! each with a CPU reference path.

pub mod config;
pub mod crack;
pub mod diagnostic;
pub mod error;
pub mod gpu;
pub mod life;
pub mod timing;

pub use error::{Error, Result};

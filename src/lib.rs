pub mod config;
pub mod driver;
pub mod error;
pub mod kernels;
pub mod loader;
pub mod memory;

pub use config::{DeviceSelector, SegsumConfig};
pub use driver::RowSumEngine;
pub use error::{Result, SegsumError};
pub use kernels::backend::{init_backend, Backend, BackendPreference, ComputeDevice, DeviceLimits};
pub use kernels::cpu::CpuDevice;
pub use kernels::dispatch::{select_plan, PlanKind, ReductionPlan, Shape};
pub use memory::{DeviceArena, MemBlock, MemorySpace};

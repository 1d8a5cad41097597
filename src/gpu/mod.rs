//! GPU compute infrastructure.
//!
//! Uses wgpu for device access (Vulkan, Metal, DX12 as the driver provides).
//! One adapter, one device, one queue per run. Kernels are WGSL programs read
//! from disk at run time and driven through a positional binding contract;
//! every submission is waited on before the buffers it touched are reused.

mod buffer;
mod context;
mod dispatch;
mod kernel;
mod profile;
mod workgroup;

pub use buffer::{Access, BufferKind, DeviceBuffer, StagingStrategy, TransferManager};
pub use context::{DeviceContext, DeviceOptions};
pub use dispatch::{
    batch_sizes, launch, DispatchMode, DispatchReport, DispatchState, PingPong, StepDispatcher,
    TimingSummary,
};
pub use kernel::{
    declares_entry_point, read_source, ArgKind, ArgRole, ArgSlot, CompiledKernel, KernelArg,
    KernelLoader, KernelSignature,
};
pub use profile::GpuTimer;
pub use workgroup::{
    resolve, resolve_local, ProblemShape, WorkGroupLimits, WorkGroupShape,
    DEFAULT_PREFERRED_MULTIPLE,
};

use std::time::Instant;

use tracing::info;

use super::{Grid, GOL, GOL_MULTI_STEP};
use crate::error::Result;
use crate::gpu::{
    Access, BufferKind, DeviceContext, DispatchMode, DispatchReport, KernelLoader, ProblemShape,
    StagingStrategy, StepDispatcher, TransferManager,
};
use crate::timing::TimingSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifeOptions {
    pub steps: u64,
    pub mode: DispatchMode,
    pub staging: StagingStrategy,
}

impl LifeOptions {
    /// One launch per step, buffers filled at creation.
    pub fn single(steps: u64) -> Self {
        Self {
            steps,
            mode: DispatchMode::Single,
            staging: StagingStrategy::CopyOnCreate,
        }
    }

    /// Up to `batch_size` steps per launch, uploads through pinned memory.
    pub fn batched(steps: u64, batch_size: u32) -> Self {
        Self {
            steps,
            mode: DispatchMode::Batched { batch_size },
            staging: StagingStrategy::Pinned,
        }
    }

    pub fn with_staging(mut self, staging: StagingStrategy) -> Self {
        self.staging = staging;
        self
    }
}

/// Advance `grid` by `options.steps` generations on the device.
pub fn run_gpu<'ctx>(
    ctx: &'ctx DeviceContext,
    loader: &mut KernelLoader<'ctx>,
    grid: &Grid,
    options: &LifeOptions,
    sink: &mut dyn TimingSink,
) -> Result<(Grid, DispatchReport)> {
    let signature = match options.mode {
        DispatchMode::Single => &GOL,
        DispatchMode::Batched { .. } => &GOL_MULTI_STEP,
    };
    let kernel = loader.load(signature, sink)?;

    let mut transfers = TransferManager::new(ctx, options.staging);
    let start = Instant::now();
    let input = transfers.stage("cells_a", &grid.device_bytes(), Access::ReadWrite, sink)?;
    let output = transfers.create("cells_b", input.size(), Access::ReadWrite, BufferKind::Storage)?;
    let dims = transfers.uniform("grid_dims", &grid.dims())?;
    sink.record_since("buffer creation time", start);

    let problem = ProblemShape::Planar {
        width: grid.width() as u64,
        height: grid.height() as u64,
    };
    let mut dispatcher = StepDispatcher::new(ctx, kernel, options.mode, problem)?;
    dispatcher.bind(&transfers, input, output, vec![dims])?;
    let report = dispatcher.run(options.steps, sink)?;
    if let Some(summary) = report.summary() {
        info!(
            launches = report.launches,
            mean_ms = summary.mean,
            p95_ms = summary.p95,
            "life dispatch finished"
        );
    }

    let latest = dispatcher.finish()?;
    let bytes = transfers.read_back(&latest, latest.size(), sink)?;
    let result = Grid::from_device_bytes(grid.width(), grid.height(), &bytes)?;
    Ok((result, report))
}

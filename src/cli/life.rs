use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Args;
use tracing::info;

use offload::config::RunConfig;
use offload::gpu::{DeviceContext, KernelLoader};
use offload::life::{self, io, Grid, LifeOptions};
use offload::timing::TimingSink;

use super::{close_log, elapsed_ms, load_config, open_log, report};

#[derive(Args)]
pub struct LifeArgs {
    /// Input grid: rows of 0/1 text, or the binary format for `.bin` files
    pub input: PathBuf,
    /// Where to write the final grid, in the format its extension selects
    pub output: PathBuf,
    /// Number of generations to advance
    pub steps: u64,
    /// Benchmark log to append timing records to
    pub logfile: PathBuf,
    /// Run several generations per launch with the multi-step kernel
    #[arg(long)]
    pub batched: bool,
    /// Generations per launch in batched mode
    #[arg(long, value_name = "N", requires = "batched")]
    pub batch_size: Option<u32>,
    /// Use the CPU reference instead of the device
    #[arg(long)]
    pub cpu: bool,
}

pub fn cmd_life(args: LifeArgs, config_path: Option<&Path>) {
    let config = load_config(config_path, args.batch_size);
    if let Err(e) = run(&args, &config) {
        report(e);
    }
}

fn run(args: &LifeArgs, config: &RunConfig) -> offload::Result<()> {
    let start = Instant::now();
    let grid = io::read_grid(&args.input)?;
    let load_ms = elapsed_ms(start);
    info!(
        width = grid.width(),
        height = grid.height(),
        live = grid.live_count(),
        "grid loaded"
    );

    if args.cpu {
        let mut log = open_log(&args.logfile, config, None)?;
        log.record("grid load time", load_ms);
        let start = Instant::now();
        let result = life::run_cpu(&grid, args.steps);
        log.record_since("total game of life time", start);
        return finish(args, &result, log);
    }

    let start = Instant::now();
    let ctx = DeviceContext::acquire(&config.device_options())?;
    let init_ms = elapsed_ms(start);
    let mut log = open_log(&args.logfile, config, Some(&ctx))?;
    log.record("grid load time", load_ms);
    log.record("device init time", init_ms);

    let result = run_on_device(&ctx, config, args, &grid, &mut log)?;
    ctx.release();
    finish(args, &result, log)
}

fn run_on_device(
    ctx: &DeviceContext,
    config: &RunConfig,
    args: &LifeArgs,
    grid: &Grid,
    log: &mut dyn TimingSink,
) -> offload::Result<Grid> {
    let mut options = if args.batched {
        LifeOptions::batched(args.steps, config.batch_size)
    } else {
        LifeOptions::single(args.steps)
    };
    if let Some(staging) = config.staging {
        options = options.with_staging(staging);
    }
    let mut loader = KernelLoader::new(ctx, config.kernel_dir.clone());

    let start = Instant::now();
    let (result, dispatch) = life::run_gpu(ctx, &mut loader, grid, &options, log)?;
    log.record_since("total game of life time", start);
    info!(
        steps = dispatch.steps,
        launches = dispatch.launches,
        kernel_ms = dispatch.total_ms,
        wall_ms = dispatch.wall_ms,
        "life run complete"
    );
    Ok(result)
}

fn finish(args: &LifeArgs, result: &Grid, mut log: super::Log) -> offload::Result<()> {
    let start = Instant::now();
    io::write_grid(&args.output, result)?;
    log.record_since("write output grid to file time", start);
    info!(live = result.live_count(), output = %args.output.display(), "grid written");
    close_log(log, &args.logfile)
}

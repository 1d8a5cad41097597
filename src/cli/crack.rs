use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Args;

use offload::config::RunConfig;
use offload::crack::{self, CorpusReader, CrackResult, TargetHash};
use offload::gpu::{DeviceContext, KernelLoader};
use offload::timing::TimingSink;

use super::{close_log, elapsed_ms, load_config, open_log, report};

#[derive(Args)]
pub struct CrackArgs {
    /// Newline-separated candidate passwords
    pub password_file: PathBuf,
    /// Target SHA-256 digest as 64 hex characters
    pub hex_hash: String,
    /// Benchmark log to append timing records to
    pub logfile: PathBuf,
    /// Use the CPU reference instead of the device
    #[arg(long)]
    pub cpu: bool,
}

pub fn cmd_crack(args: CrackArgs, config_path: Option<&Path>) {
    let config = load_config(config_path, None);
    match run(&args, &config) {
        Ok(result) => println!("{}", result),
        Err(e) => report(e),
    }
}

fn run(args: &CrackArgs, config: &RunConfig) -> offload::Result<CrackResult> {
    let target = TargetHash::parse(&args.hex_hash)?;
    let mut corpus = CorpusReader::open(&args.password_file, config.corpus_batch_lines)?;

    if args.cpu {
        let mut log = open_log(&args.logfile, config, None)?;
        let start = Instant::now();
        let result = crack::crack_cpu(&mut corpus, &target)?;
        log.record_since("total pw cracker kernel time", start);
        close_log(log, &args.logfile)?;
        return Ok(result);
    }

    let start = Instant::now();
    let ctx = DeviceContext::acquire(&config.device_options())?;
    let init_ms = elapsed_ms(start);
    let mut log = open_log(&args.logfile, config, Some(&ctx))?;
    log.record("device init time", init_ms);

    let start = Instant::now();
    let result = {
        let mut loader = KernelLoader::new(&ctx, config.kernel_dir.clone());
        let staging = config.staging.unwrap_or_default();
        crack::crack_gpu(&ctx, &mut loader, &mut corpus, &target, staging, &mut log)?
    };
    log.record_since("total pw cracker kernel time", start);
    ctx.release();
    close_log(log, &args.logfile)?;
    Ok(result)
}

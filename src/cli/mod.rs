pub mod crack;
pub mod life;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::process;
use std::time::Instant;

use offload::config::RunConfig;
use offload::gpu::DeviceContext;
use offload::timing::CsvLog;
use offload::Error;

/// Platform column used when no device was opened.
const CPU_PLATFORM: &str = "cpu";

pub type Log = CsvLog<BufWriter<File>>;

/// Print `err` and exit with status 1. Device-layer errors are marked fatal.
pub fn report(err: Error) -> ! {
    if err.is_fatal() {
        eprintln!("fatal: {}", err);
    } else {
        eprintln!("error: {}", err);
    }
    process::exit(1);
}

/// Load the configuration file and apply a batch size given on the command
/// line on top of it.
pub fn load_config(path: Option<&Path>, batch_size: Option<u32>) -> RunConfig {
    let mut config = RunConfig::load(path).unwrap_or_else(|e| report(e));
    if let Some(batch_size) = batch_size {
        config.batch_size = batch_size;
    }
    if let Err(e) = config.validate() {
        report(e);
    }
    config
}

/// Open the benchmark log. The platform column comes from the configuration
/// override, then the device backend, then `cpu`.
pub fn open_log(
    logfile: &Path,
    config: &RunConfig,
    ctx: Option<&DeviceContext>,
) -> offload::Result<Log> {
    let platform = match (&config.platform_label, ctx) {
        (Some(label), _) => label.clone(),
        (None, Some(ctx)) => ctx.platform_label(),
        (None, None) => CPU_PLATFORM.to_string(),
    };
    CsvLog::create(logfile, &platform)
}

pub fn close_log(mut log: Log, logfile: &Path) -> offload::Result<()> {
    log.flush().map_err(|e| Error::io(logfile, e))
}

/// Milliseconds since `start`, for phases timed before the log is open.
pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

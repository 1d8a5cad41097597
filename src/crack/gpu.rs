use std::io::BufRead;
use std::time::Instant;

use tracing::{debug, info};

use super::{CorpusReader, CrackResult, TargetHash, SHA256_CRACK};
use crate::error::{Error, Result};
use crate::gpu::{
    launch, Access, BufferKind, DeviceContext, GpuTimer, KernelArg, KernelLoader, ProblemShape,
    StagingStrategy, TransferManager,
};
use crate::timing::TimingSink;

/// Result slot value meaning "no match in this batch".
const NO_MATCH: u32 = u32::MAX;

/// Search the corpus batch by batch on the device. Stops at the first batch
/// holding a match; within a batch the lowest matching line wins.
pub fn crack_gpu<'ctx, R: BufRead>(
    ctx: &'ctx DeviceContext,
    loader: &mut KernelLoader<'ctx>,
    corpus: &mut CorpusReader<R>,
    target: &TargetHash,
    staging: StagingStrategy,
    sink: &mut dyn TimingSink,
) -> Result<CrackResult> {
    let kernel = loader.load(&SHA256_CRACK, sink)?;
    let mut transfers = TransferManager::new(ctx, staging);
    let target_words = target.words_be();
    let target_buf = transfers.create_init(
        "target_hash",
        bytemuck::cast_slice(&target_words),
        Access::ReadOnly,
        BufferKind::Storage,
    )?;
    let result = transfers.create("found_index", 4, Access::ReadWrite, BufferKind::Storage)?;
    let timer = GpuTimer::new(ctx, "crack_timestamps");

    loop {
        let start = Instant::now();
        let Some(batch) = corpus.next_batch()? else {
            break;
        };
        sink.record_since("pw batch loaded from file and processed", start);

        let start = Instant::now();
        let passwords =
            transfers.stage("passwords", &batch.packed_bytes(), Access::ReadOnly, sink)?;
        let offsets = transfers.stage(
            "offsets",
            bytemuck::cast_slice(batch.offsets()),
            Access::ReadOnly,
            sink,
        )?;
        let params = transfers.uniform("corpus", &batch.params())?;
        transfers.write(&result, bytemuck::bytes_of(&NO_MATCH))?;
        sink.record_since("kernel buffer creation time", start);

        let bind_group = kernel.bind(&[
            KernelArg::Buffer(&passwords),
            KernelArg::Buffer(&offsets),
            KernelArg::Buffer(&params),
            KernelArg::Buffer(&target_buf),
            KernelArg::Buffer(&result),
        ])?;
        let shape = kernel.shape_for(ProblemShape::Linear(batch.len() as u64))?;
        let ms = launch(ctx, &kernel, &bind_group, &shape, None, &timer)?;
        sink.record("kernel exec time", ms);
        debug!(
            start = batch.start_index(),
            lines = batch.len(),
            ms,
            "batch searched"
        );

        let bytes = transfers.read_back(&result, 4, sink)?;
        let slot: u32 = bytemuck::pod_read_unaligned(&bytes);
        if slot != NO_MATCH {
            let i = slot as usize;
            if i >= batch.len() {
                return Err(Error::device(
                    "result read back",
                    format!("kernel reported line {} of a {}-line batch", i, batch.len()),
                ));
            }
            let found = CrackResult::found(
                batch.start_index() + slot as u64,
                batch.password(i).to_vec(),
            );
            info!(index = found.index, "password found");
            return Ok(found);
        }
    }

    info!(lines = corpus.lines_read(), "password not found");
    Ok(CrackResult::not_found())
}

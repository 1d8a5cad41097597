//! Device SHA-256 search against the CPU reference. Every test returns early
//! when no adapter with timestamp queries can be opened.

use std::io::Cursor;
use std::path::PathBuf;

use offload::crack::{self, CorpusReader, CrackResult, TargetHash, NOT_FOUND};
use offload::gpu::{DeviceContext, DeviceOptions, KernelLoader, StagingStrategy};
use offload::timing::{MemorySink, NullSink};

fn device() -> Option<DeviceContext> {
    let options = DeviceOptions {
        allow_software: true,
        ..Default::default()
    };
    match DeviceContext::acquire(&options) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("No GPU available, skipping test: {}", e);
            None
        }
    }
}

fn kernel_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("kernels")
}

fn corpus(text: &str, batch_lines: usize) -> CorpusReader<Cursor<Vec<u8>>> {
    CorpusReader::new(Cursor::new(text.as_bytes().to_vec()), batch_lines, "corpus")
}

fn crack_on(
    ctx: &DeviceContext,
    text: &str,
    batch_lines: usize,
    target: &TargetHash,
    staging: StagingStrategy,
) -> CrackResult {
    let mut loader = KernelLoader::new(ctx, kernel_dir());
    let mut reader = corpus(text, batch_lines);
    crack::crack_gpu(ctx, &mut loader, &mut reader, target, staging, &mut NullSink)
        .expect("gpu crack")
}

#[test]
fn test_finds_known_password() {
    let Some(ctx) = device() else { return };
    let target = TargetHash::parse(
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
    )
    .unwrap();
    let result = crack_on(
        &ctx,
        "password\nletmein\nhello\nqwerty\n",
        1024,
        &target,
        StagingStrategy::CopyOnCreate,
    );
    assert_eq!(result, CrackResult::found(2, b"hello".to_vec()));
    assert_eq!(result.to_string(), "Password found index 2: hello");
}

#[test]
fn test_reports_not_found() {
    let Some(ctx) = device() else { return };
    let target = TargetHash::of(b"not in the list");
    let result = crack_on(
        &ctx,
        "alpha\nbeta\ngamma",
        1024,
        &target,
        StagingStrategy::CopyOnCreate,
    );
    assert_eq!(result.index, NOT_FOUND);
    assert_eq!(result.to_string(), "Password not found!");
}

#[test]
fn test_earliest_duplicate_wins() {
    let Some(ctx) = device() else { return };
    let target = TargetHash::of(b"dup");
    let text = "a\nb\ndup\nc\ndup\ndup\n";
    let result = crack_on(&ctx, text, 1024, &target, StagingStrategy::Pinned);
    assert_eq!(result.index, 2);
}

#[test]
fn test_index_is_global_across_batches() {
    let Some(ctx) = device() else { return };
    let lines: Vec<String> = (0..100).map(|i| format!("candidate-{}", i)).collect();
    let text = lines.join("\n");
    let target = TargetHash::of(b"candidate-77");
    for batch_lines in [1, 7, 32, 100] {
        for staging in [StagingStrategy::CopyOnCreate, StagingStrategy::Pinned] {
            let result = crack_on(&ctx, &text, batch_lines, &target, staging);
            assert_eq!(
                result,
                CrackResult::found(77, b"candidate-77".to_vec()),
                "batch_lines = {}, staging = {:?}",
                batch_lines,
                staging
            );
        }
    }
}

#[test]
fn test_matches_cpu_on_edge_lengths() {
    let Some(ctx) = device() else { return };
    // Lengths around the one-block limit of 55 bytes, plus an empty line.
    let lines: Vec<String> = [0usize, 1, 3, 54, 55, 56, 63, 64, 65, 119, 120, 200]
        .iter()
        .map(|&n| "x".repeat(n))
        .collect();
    let text = lines.join("\n");
    for (i, line) in lines.iter().enumerate() {
        let target = TargetHash::of(line.as_bytes());
        let gpu = crack_on(&ctx, &text, 5, &target, StagingStrategy::CopyOnCreate);
        let cpu = crack::crack_cpu(&mut corpus(&text, 5), &target).unwrap();
        assert_eq!(gpu, cpu, "length {}", line.len());
        assert_eq!(gpu.index, i as i64);
    }
}

#[test]
fn test_records_per_batch_timings() {
    let Some(ctx) = device() else { return };
    let mut loader = KernelLoader::new(&ctx, kernel_dir());
    let mut reader = corpus("a\nb\nc\nd\ne\n", 2);
    let mut sink = MemorySink::new();
    let target = TargetHash::of(b"missing");
    let result = crack::crack_gpu(
        &ctx,
        &mut loader,
        &mut reader,
        &target,
        StagingStrategy::CopyOnCreate,
        &mut sink,
    )
    .unwrap();
    assert!(!result.is_found());
    assert_eq!(sink.count("pw batch loaded from file and processed"), 3);
    assert_eq!(sink.count("kernel buffer creation time"), 3);
    assert_eq!(sink.count("kernel exec time"), 3);
    assert_eq!(sink.count("kernel compile time"), 1);
}

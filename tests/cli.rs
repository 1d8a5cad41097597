//! The `offload` binary end to end, on the CPU reference paths.

use std::path::Path;
use std::process::{Command, Output};

fn offload(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_offload"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("run offload")
}

fn descriptions(log: &str) -> Vec<String> {
    log.lines()
        .skip(1)
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 3, "malformed record {:?}", line);
            assert!(fields[2].parse::<f64>().is_ok(), "bad time in {:?}", line);
            format!("{},{}", fields[0], fields[1])
        })
        .collect()
}

#[test]
fn test_wrong_argument_count_prints_usage() {
    let dir = tempfile::tempdir().unwrap();
    let out = offload(dir.path(), &["life", "in.txt", "out.txt"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("Usage"), "stderr: {}", stderr);
}

#[test]
fn test_life_on_cpu_writes_grid_and_log() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("blinker.txt"), "00000\n00100\n00100\n00100\n00000\n").unwrap();

    let out = offload(
        dir.path(),
        &["life", "blinker.txt", "out.txt", "3", "bench.csv", "--cpu"],
    );
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let grid = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(grid, "00000\n00000\n01110\n00000\n00000\n");

    let log = std::fs::read_to_string(dir.path().join("bench.csv")).unwrap();
    assert_eq!(log.lines().next(), Some("platform,description,time_ms"));
    assert_eq!(
        descriptions(&log),
        [
            "cpu,grid load time",
            "cpu,total game of life time",
            "cpu,write output grid to file time",
        ]
    );
}

#[test]
fn test_life_binary_output_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("block.txt"), "0000\n0110\n0110\n0000\n").unwrap();

    let out = offload(
        dir.path(),
        &["life", "block.txt", "block.bin", "5", "bench.csv", "--cpu"],
    );
    assert!(out.status.success());
    let grid = offload::life::io::read_grid(&dir.path().join("block.bin")).unwrap();
    assert_eq!(grid.width(), 4);
    assert_eq!(grid.live_count(), 4);
    assert!(grid.is_alive(1, 1) && grid.is_alive(2, 2));
}

#[test]
fn test_config_file_sets_platform_label() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("grid.txt"), "010\n010\n010\n").unwrap();
    std::fs::write(dir.path().join("lab.toml"), "platform_label = \"lab-box\"\n").unwrap();

    let out = offload(
        dir.path(),
        &[
            "--config", "lab.toml", "life", "grid.txt", "out.txt", "1", "bench.csv", "--cpu",
        ],
    );
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let log = std::fs::read_to_string(dir.path().join("bench.csv")).unwrap();
    assert!(descriptions(&log).iter().all(|d| d.starts_with("lab-box,")));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("offload.toml"), "batch_size = 0\n").unwrap();
    std::fs::write(dir.path().join("grid.txt"), "1\n").unwrap();

    let out = offload(
        dir.path(),
        &["life", "grid.txt", "out.txt", "1", "bench.csv", "--cpu"],
    );
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("error: invalid configuration"), "stderr: {}", stderr);
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn test_malformed_grid_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("grid.txt"), "010\n01\n").unwrap();

    let out = offload(
        dir.path(),
        &["life", "grid.txt", "out.txt", "1", "bench.csv", "--cpu"],
    );
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("invalid line length"), "stderr: {}", stderr);
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn test_crack_on_cpu() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("words.txt"), "password\nletmein\nhello\n").unwrap();
    let hello = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    let out = offload(dir.path(), &["crack", "words.txt", hello, "bench.csv", "--cpu"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "Password found index 2: hello\n");
    let log = std::fs::read_to_string(dir.path().join("bench.csv")).unwrap();
    assert_eq!(descriptions(&log), ["cpu,total pw cracker kernel time"]);

    let missing = "0".repeat(64);
    let out = offload(dir.path(), &["crack", "words.txt", &missing, "bench.csv", "--cpu"]);
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout), "Password not found!\n");
}

#[test]
fn test_crack_rejects_bad_hash() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("words.txt"), "a\n").unwrap();

    let out = offload(dir.path(), &["crack", "words.txt", "abc", "bench.csv", "--cpu"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error:"));
}

//! Grid files.
//!
//! Text: one row per line over `0`/`1`, every row the same length. Blank
//! lines are skipped and `\r\n` endings are accepted.
//!
//! Binary: width and height as native-endian `u64`, then `width * height`
//! one-byte cells. Selected by the `.bin` extension.

use std::path::Path;

use super::Grid;
use crate::error::{Error, Result};

const HEADER_BYTES: usize = 2 * std::mem::size_of::<u64>();

pub fn parse_text(text: &str, origin: &str) -> Result<Grid> {
    let mut width = 0;
    let mut height = 0;
    let mut cells = Vec::with_capacity(text.len());

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if width == 0 {
            width = line.len();
        } else if line.len() != width {
            return Err(Error::parse(
                origin,
                format!(
                    "invalid line length at row {}: expected {}, found {}",
                    height,
                    width,
                    line.len()
                ),
            ));
        }
        for (column, c) in line.chars().enumerate() {
            match c {
                '0' => cells.push(0),
                '1' => cells.push(1),
                other => {
                    return Err(Error::parse(
                        origin,
                        format!(
                            "invalid character {:?} at row {}, column {}",
                            other, height, column
                        ),
                    ))
                }
            }
        }
        height += 1;
    }

    if height == 0 {
        return Err(Error::parse(origin, "grid file holds no rows"));
    }
    Grid::new(width, height, cells).map_err(|e| match e {
        Error::Parse { message, .. } => Error::parse(origin, message),
        other => other,
    })
}

pub fn format_text(grid: &Grid) -> String {
    let mut out = String::with_capacity((grid.width() + 1) * grid.height());
    for row in grid.cells().chunks(grid.width()) {
        out.extend(row.iter().map(|&c| if c == 1 { '1' } else { '0' }));
        out.push('\n');
    }
    out
}

pub fn encode_binary(grid: &Grid) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_BYTES + grid.cells().len());
    out.extend_from_slice(&(grid.width() as u64).to_ne_bytes());
    out.extend_from_slice(&(grid.height() as u64).to_ne_bytes());
    out.extend_from_slice(grid.cells());
    out
}

pub fn decode_binary(bytes: &[u8], origin: &str) -> Result<Grid> {
    if bytes.len() < HEADER_BYTES {
        return Err(Error::parse(
            origin,
            format!("{} bytes is shorter than the grid header", bytes.len()),
        ));
    }
    let width: u64 = bytemuck::pod_read_unaligned(&bytes[..8]);
    let height: u64 = bytemuck::pod_read_unaligned(&bytes[8..HEADER_BYTES]);
    let body = &bytes[HEADER_BYTES..];
    let expected = width.checked_mul(height);
    if expected != Some(body.len() as u64) {
        return Err(Error::parse(
            origin,
            format!(
                "{}x{} header but {} cell bytes follow",
                width,
                height,
                body.len()
            ),
        ));
    }
    Grid::new(width as usize, height as usize, body.to_vec()).map_err(|e| match e {
        Error::Parse { message, .. } => Error::parse(origin, message),
        other => other,
    })
}

fn is_binary(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("bin"))
}

pub fn read_grid(path: &Path) -> Result<Grid> {
    let origin = path.display().to_string();
    if is_binary(path) {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        decode_binary(&bytes, &origin)
    } else {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        parse_text(&text, &origin)
    }
}

pub fn write_grid(path: &Path, grid: &Grid) -> Result<()> {
    let bytes = if is_binary(path) {
        encode_binary(grid)
    } else {
        format_text(grid).into_bytes()
    };
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
}

//! Game of Life workload.
//!
//! The grid is a flat row-major array of cells, one byte per cell on the
//! host and one `u32` per cell on the device. Cells outside the grid count
//! as dead.

pub mod gpu;
pub mod io;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::gpu::{ArgKind, ArgRole, ArgSlot, KernelSignature};

pub use gpu::{run_gpu, LifeOptions};

/// Single-step kernel: reads slot 0, writes slot 1.
pub static GOL: KernelSignature = KernelSignature {
    source: "gol",
    entry: "gol",
    dims: 2,
    slots: &[
        ArgSlot {
            index: 0,
            role: ArgRole::Input,
            kind: ArgKind::ReadWriteStorage,
            name: "input",
        },
        ArgSlot {
            index: 1,
            role: ArgRole::Output,
            kind: ArgKind::ReadWriteStorage,
            name: "output",
        },
        ArgSlot {
            index: 2,
            role: ArgRole::Dimensions,
            kind: ArgKind::Uniform,
            name: "dims",
        },
    ],
};

/// Multi-step kernel: one dispatch per step of a batch, direction chosen by
/// the launch record's step parity.
pub static GOL_MULTI_STEP: KernelSignature = KernelSignature {
    source: "gol",
    entry: "gol_multi_step",
    dims: 2,
    slots: &[
        ArgSlot {
            index: 0,
            role: ArgRole::Input,
            kind: ArgKind::ReadWriteStorage,
            name: "input",
        },
        ArgSlot {
            index: 1,
            role: ArgRole::Output,
            kind: ArgKind::ReadWriteStorage,
            name: "output",
        },
        ArgSlot {
            index: 2,
            role: ArgRole::Dimensions,
            kind: ArgKind::Uniform,
            name: "dims",
        },
        ArgSlot {
            index: 3,
            role: ArgRole::Mode,
            kind: ArgKind::DynamicUniform,
            name: "launch",
        },
    ],
};

/// Uniform record behind the `dims` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct GridDims {
    pub width: u32,
    pub height: u32,
    pub _pad: [u32; 2],
}

#[derive(Clone, PartialEq, Eq)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl Grid {
    /// Build a grid from row-major cells, each 0 or 1.
    pub fn new(width: usize, height: usize, cells: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::parse("grid", format!("empty grid ({}x{})", width, height)));
        }
        let count = width
            .checked_mul(height)
            .filter(|&n| n <= u32::MAX as usize)
            .ok_or_else(|| {
                Error::parse("grid", format!("{}x{} grid is too large", width, height))
            })?;
        if cells.len() != count {
            return Err(Error::parse(
                "grid",
                format!(
                    "{}x{} grid needs {} cells, got {}",
                    width,
                    height,
                    count,
                    cells.len()
                ),
            ));
        }
        if let Some(pos) = cells.iter().position(|&c| c > 1) {
            return Err(Error::parse(
                "grid",
                format!(
                    "cell value {} at row {}, column {}",
                    cells[pos],
                    pos / width,
                    pos % width
                ),
            ));
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    pub fn dead(width: usize, height: usize) -> Result<Self> {
        Self::new(width, height, vec![0; width.saturating_mul(height)])
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn is_alive(&self, x: usize, y: usize) -> bool {
        self.cells[y * self.width + x] == 1
    }

    pub fn set(&mut self, x: usize, y: usize, alive: bool) {
        self.cells[y * self.width + x] = alive as u8;
    }

    pub fn live_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c == 1).count()
    }

    pub fn dims(&self) -> GridDims {
        GridDims {
            width: self.width as u32,
            height: self.height as u32,
            _pad: [0; 2],
        }
    }

    /// Device layout: one native-endian `u32` per cell.
    pub fn device_bytes(&self) -> Vec<u8> {
        let words: Vec<u32> = self.cells.iter().map(|&c| c as u32).collect();
        bytemuck::cast_slice(&words).to_vec()
    }

    pub fn from_device_bytes(width: usize, height: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(Error::parse(
                "device grid",
                format!("{} bytes is not a whole number of cells", bytes.len()),
            ));
        }
        let cells = bytes
            .chunks_exact(4)
            .map(|chunk| bytemuck::pod_read_unaligned::<u32>(chunk) as u8)
            .collect();
        Self::new(width, height, cells)
    }

    fn live_neighbours(&self, x: usize, y: usize) -> u8 {
        let mut count = 0;
        for dy in [-1isize, 0, 1] {
            for dx in [-1isize, 0, 1] {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = x as isize + dx;
                let ny = y as isize + dy;
                if nx < 0 || ny < 0 || nx >= self.width as isize || ny >= self.height as isize {
                    continue;
                }
                count += self.cells[ny as usize * self.width + nx as usize];
            }
        }
        count
    }
}

impl std::fmt::Debug for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Grid {}x{}", self.width, self.height)?;
        for row in self.cells.chunks(self.width) {
            let line: String = row.iter().map(|&c| if c == 1 { '1' } else { '0' }).collect();
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// One generation on the CPU, rows in parallel.
pub fn step_cpu(grid: &Grid) -> Grid {
    let mut next = vec![0u8; grid.cells.len()];
    next.par_chunks_mut(grid.width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, cell) in row.iter_mut().enumerate() {
                let n = grid.live_neighbours(x, y);
                *cell = match (grid.is_alive(x, y), n) {
                    (true, 2) | (true, 3) | (false, 3) => 1,
                    _ => 0,
                };
            }
        });
    Grid {
        width: grid.width,
        height: grid.height,
        cells: next,
    }
}

pub fn run_cpu(grid: &Grid, steps: u64) -> Grid {
    let mut current = grid.clone();
    for _ in 0..steps {
        current = step_cpu(&current);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&str]) -> Grid {
        io::parse_text(&rows.join("\n"), "test").unwrap()
    }

    #[test]
    fn signatures_are_well_formed() {
        GOL.validate().unwrap();
        GOL_MULTI_STEP.validate().unwrap();
        assert!(GOL.is_step_kernel() && !GOL.has_dynamic_slot());
        assert!(GOL_MULTI_STEP.is_step_kernel() && GOL_MULTI_STEP.has_dynamic_slot());
    }

    #[test]
    fn zero_steps_is_identity() {
        let g = grid(&["010", "111", "000"]);
        assert_eq!(run_cpu(&g, 0), g);
    }

    #[test]
    fn dead_grid_stays_dead() {
        let g = Grid::dead(3, 3).unwrap();
        assert_eq!(run_cpu(&g, 5).live_count(), 0);
    }

    #[test]
    fn lone_cell_dies() {
        let g = grid(&["000", "010", "000"]);
        assert_eq!(step_cpu(&g).live_count(), 0);
    }

    #[test]
    fn block_is_stable() {
        let g = grid(&["0000", "0110", "0110", "0000"]);
        assert_eq!(run_cpu(&g, 7), g);
    }

    #[test]
    fn block_in_corner_is_stable_with_dead_border() {
        let g = grid(&["11", "11"]);
        assert_eq!(step_cpu(&g), g);
    }

    #[test]
    fn blinker_oscillates() {
        let horizontal = grid(&["00000", "00000", "01110", "00000", "00000"]);
        let vertical = grid(&["00000", "00100", "00100", "00100", "00000"]);
        assert_eq!(step_cpu(&horizontal), vertical);
        assert_eq!(run_cpu(&horizontal, 2), horizontal);
    }

    #[test]
    fn glider_moves_diagonally() {
        let start = grid(&[
            "010000", "001000", "111000", "000000", "000000", "000000",
        ]);
        let moved = grid(&[
            "000000", "001000", "000100", "011100", "000000", "000000",
        ]);
        assert_eq!(run_cpu(&start, 4), moved);
    }

    #[test]
    fn device_bytes_round_trip() {
        let g = grid(&["101", "010"]);
        let bytes = g.device_bytes();
        assert_eq!(bytes.len(), 6 * 4);
        assert_eq!(Grid::from_device_bytes(3, 2, &bytes).unwrap(), g);
    }

    #[test]
    fn new_rejects_bad_cells_and_sizes() {
        assert!(Grid::new(2, 2, vec![0, 1, 2, 0]).is_err());
        assert!(Grid::new(2, 2, vec![0, 1, 1]).is_err());
        assert!(Grid::new(0, 3, vec![]).is_err());
        assert!(Grid::new(usize::MAX, 2, vec![]).is_err());
    }
}

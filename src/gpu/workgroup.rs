//! Work-group size resolution.
//!
//! The local size is chosen once per kernel and device and baked into the
//! pipeline as the `wg_x` / `wg_y` override constants; the global size is
//! derived per problem by padding each extent up to a multiple of the local
//! size. Kernels mask the padding work-items themselves.

use crate::error::{Error, Result};

/// Used when the adapter does not report a subgroup width.
pub const DEFAULT_PREFERRED_MULTIPLE: u32 = 32;

/// The device limits the resolver works from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkGroupLimits {
    pub max_work_group_size: u32,
    pub preferred_multiple: u32,
    pub max_work_item_sizes: [u32; 3],
    pub max_groups_per_dim: u32,
}

impl WorkGroupLimits {
    pub fn from_limits(limits: &wgpu::Limits) -> Self {
        let preferred_multiple = if limits.max_subgroup_size > 0 {
            limits.max_subgroup_size
        } else {
            DEFAULT_PREFERRED_MULTIPLE
        };
        Self {
            max_work_group_size: limits.max_compute_invocations_per_workgroup,
            preferred_multiple,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_groups_per_dim: limits.max_compute_workgroups_per_dimension,
        }
    }
}

/// Extent of one dispatch in work-items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProblemShape {
    Linear(u64),
    Planar { width: u64, height: u64 },
}

impl ProblemShape {
    pub fn dims(&self) -> usize {
        match self {
            ProblemShape::Linear(_) => 1,
            ProblemShape::Planar { .. } => 2,
        }
    }

    fn extent(&self) -> [u64; 2] {
        match *self {
            ProblemShape::Linear(n) => [n, 1],
            ProblemShape::Planar { width, height } => [width, height],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkGroupShape {
    /// Work-items per group; `local[1]` is 1 for 1D problems.
    pub local: [u32; 2],
    /// Work-items per dimension, each a multiple of `local`.
    pub global: [u64; 2],
    pub dims: usize,
}

impl WorkGroupShape {
    /// Cover `problem` with groups of size `local`.
    pub fn covering(
        local: [u32; 2],
        problem: ProblemShape,
        limits: &WorkGroupLimits,
    ) -> Result<Self> {
        let extent = problem.extent();
        let global = [
            round_up(extent[0], local[0] as u64),
            round_up(extent[1], local[1] as u64),
        ];
        let shape = Self {
            local,
            global,
            dims: problem.dims(),
        };
        shape.check_dispatchable(limits)?;
        Ok(shape)
    }

    /// Number of work-groups per dimension.
    pub fn groups(&self) -> [u32; 2] {
        [
            (self.global[0] / self.local[0] as u64) as u32,
            (self.global[1] / self.local[1] as u64) as u32,
        ]
    }

    pub fn check_dispatchable(&self, limits: &WorkGroupLimits) -> Result<()> {
        for dim in 0..2 {
            let groups = self.global[dim] / self.local[dim] as u64;
            if groups > limits.max_groups_per_dim as u64 {
                return Err(Error::device(
                    "work-group resolution",
                    format!(
                        "{} work-groups needed in dimension {}, device allows {}",
                        groups, dim, limits.max_groups_per_dim
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn round_up(extent: u64, multiple: u64) -> u64 {
    extent.div_ceil(multiple) * multiple
}

/// Local work-group size for a `dims`-dimensional kernel.
///
/// Starts from the preferred multiple, halves the larger dimension until the
/// product fits, clamps to the per-dimension limits, then greedily doubles
/// dimension 0 (else dimension 1) while both limits still hold.
pub fn resolve_local(limits: &WorkGroupLimits, dims: usize) -> [u32; 2] {
    let max = limits.max_work_group_size.max(1) as u64;
    let item = [
        limits.max_work_item_sizes[0].max(1),
        if dims >= 2 {
            limits.max_work_item_sizes[1].max(1)
        } else {
            1
        },
    ];
    let p = limits.preferred_multiple.max(1);
    let mut local = if dims >= 2 { [p, p] } else { [p, 1] };

    while local[0] as u64 * local[1] as u64 > max {
        if local[0] >= local[1] {
            local[0] /= 2;
        } else {
            local[1] /= 2;
        }
    }
    local[0] = local[0].min(item[0]);
    local[1] = local[1].min(item[1]);

    loop {
        let product = local[0] as u64 * local[1] as u64;
        if product * 2 > max {
            break;
        }
        if local[0] as u64 * 2 <= item[0] as u64 {
            local[0] *= 2;
        } else if dims >= 2 && local[1] as u64 * 2 <= item[1] as u64 {
            local[1] *= 2;
        } else {
            break;
        }
    }
    local
}

/// Resolve the local size and cover `problem` with it.
pub fn resolve(limits: &WorkGroupLimits, problem: ProblemShape) -> Result<WorkGroupShape> {
    let local = resolve_local(limits, problem.dims());
    tracing::debug!(?local, ?problem, "resolved work-group size");
    WorkGroupShape::covering(local, problem, limits)
}

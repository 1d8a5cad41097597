//! The iterative step loop.
//!
//! A step kernel reads slot 0 and writes slot 1. Two buffers alternate in
//! those roles; which one is the input is a pure function of the number of
//! steps already taken (`steps_done % 2`), so a swap is never a copy and
//! batched launches need no separate parity bookkeeping.
//!
//! A batched launch of `k` steps is one compute pass holding `k` dispatches.
//! Each dispatch selects its own launch record `{steps, step}` through a
//! dynamic uniform offset, and the kernel reads from slot 0 on even `step`
//! and from slot 1 on odd `step`.

use std::rc::Rc;
use std::time::Instant;

use statrs::statistics::{Data, Distribution, Max, Median, Min, OrderStatistics};
use tracing::debug;

use super::buffer::{Access, BufferKind, DeviceBuffer, TransferManager};
use super::context::DeviceContext;
use super::kernel::{ArgKind, CompiledKernel, KernelArg};
use super::profile::GpuTimer;
use super::workgroup::{ProblemShape, WorkGroupShape};
use crate::error::{Error, Result};
use crate::timing::TimingSink;

/// Two values in alternating input/output roles.
#[derive(Debug)]
pub struct PingPong<T> {
    slots: [T; 2],
    steps_done: u64,
}

impl<T> PingPong<T> {
    pub fn new(input: T, output: T) -> Self {
        Self {
            slots: [input, output],
            steps_done: 0,
        }
    }

    pub fn steps_done(&self) -> u64 {
        self.steps_done
    }

    pub fn input_index(&self) -> usize {
        (self.steps_done % 2) as usize
    }

    pub fn input(&self) -> &T {
        &self.slots[self.input_index()]
    }

    pub fn output(&self) -> &T {
        &self.slots[1 - self.input_index()]
    }

    pub fn get(&self, index: usize) -> &T {
        &self.slots[index]
    }

    /// Record `steps` completed steps; the roles swap iff `steps` is odd.
    pub fn advance(&mut self, steps: u64) {
        self.steps_done += steps;
    }

    /// The value currently in the input role, which holds the latest state.
    pub fn into_input(self) -> T {
        let index = self.input_index();
        let [a, b] = self.slots;
        if index == 0 {
            a
        } else {
            b
        }
    }
}

/// Split `total` steps into launches of at most `batch` steps.
pub fn batch_sizes(total: u64, batch: u32) -> impl Iterator<Item = u64> {
    let batch = batch.max(1) as u64;
    let mut remaining = total;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let k = remaining.min(batch);
        remaining -= k;
        Some(k)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    BuffersBound,
    Dispatching,
    StepComplete,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// One step per launch.
    Single,
    /// Up to `batch_size` steps per launch.
    Batched { batch_size: u32 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct LaunchRecord {
    steps: u32,
    step: u32,
    _pad: [u32; 2],
}

const RECORD_SIZE: u64 = std::mem::size_of::<LaunchRecord>() as u64;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimingSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
}

impl TimingSummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut data = Data::new(samples.to_vec());
        Some(Self {
            mean: data.mean().unwrap_or(0.0),
            std_dev: data.std_dev().filter(|v| v.is_finite()).unwrap_or(0.0),
            median: data.median(),
            p95: data.percentile(95),
            min: data.min(),
            max: data.max(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    pub steps: u64,
    pub launches: u64,
    /// Sum of the device times of all launches.
    pub total_ms: f64,
    /// Host time for the whole loop, waits included.
    pub wall_ms: f64,
    /// Device time of each launch, in order.
    pub samples: Vec<f64>,
}

impl DispatchReport {
    pub fn summary(&self) -> Option<TimingSummary> {
        TimingSummary::from_samples(&self.samples)
    }
}

/// Record one compute pass and block until it finishes; returns its device
/// time in milliseconds.
///
/// With `dynamic_offsets` the pass holds one dispatch per offset, in order;
/// otherwise a single dispatch.
pub fn launch(
    ctx: &DeviceContext,
    kernel: &CompiledKernel<'_>,
    bind_group: &wgpu::BindGroup,
    shape: &WorkGroupShape,
    dynamic_offsets: Option<&[u32]>,
    timer: &GpuTimer,
) -> Result<f64> {
    let [gx, gy] = shape.groups();
    let mut encoder = ctx
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel.entry()),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(kernel.entry()),
            timestamp_writes: Some(timer.pass_writes()),
        });
        pass.set_pipeline(kernel.pipeline());
        match dynamic_offsets {
            Some(offsets) => {
                for &offset in offsets {
                    pass.set_bind_group(0, bind_group, &[offset]);
                    pass.dispatch_workgroups(gx, gy, 1);
                }
            }
            None => {
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(gx, gy, 1);
            }
        }
    }
    timer.resolve(&mut encoder);
    ctx.submit_and_wait("kernel launch", encoder)?;
    timer.read_ms(ctx)
}

/// Drives a step kernel over two ping-pong buffers.
pub struct StepDispatcher<'ctx> {
    ctx: &'ctx DeviceContext,
    kernel: Rc<CompiledKernel<'ctx>>,
    mode: DispatchMode,
    shape: WorkGroupShape,
    state: DispatchState,
    grids: Option<PingPong<DeviceBuffer<'ctx>>>,
    _fixed: Vec<DeviceBuffer<'ctx>>,
    records: Option<DeviceBuffer<'ctx>>,
    record_stride: u64,
    /// `bind_groups[i]` binds buffer `i` as the input.
    bind_groups: Vec<wgpu::BindGroup>,
    timer: GpuTimer,
}

impl<'ctx> StepDispatcher<'ctx> {
    pub fn new(
        ctx: &'ctx DeviceContext,
        kernel: Rc<CompiledKernel<'ctx>>,
        mode: DispatchMode,
        problem: ProblemShape,
    ) -> Result<Self> {
        let signature = kernel.signature();
        if !signature.is_step_kernel() {
            return Err(Error::binding(
                kernel.entry(),
                "slot 1 must be the output of a step kernel",
            ));
        }
        match mode {
            DispatchMode::Single if signature.has_dynamic_slot() => {
                return Err(Error::binding(
                    kernel.entry(),
                    "batched kernel used for single-step dispatch",
                ));
            }
            DispatchMode::Batched { .. } if !signature.has_dynamic_slot() => {
                return Err(Error::binding(
                    kernel.entry(),
                    "kernel has no launch-record slot for batched dispatch",
                ));
            }
            DispatchMode::Batched { batch_size: 0 } => {
                return Err(Error::Config("batch size must be at least 1".into()));
            }
            _ => {}
        }
        let shape = kernel.shape_for(problem)?;
        let alignment = ctx.limits().min_uniform_buffer_offset_alignment as u64;
        Ok(Self {
            ctx,
            kernel,
            mode,
            shape,
            state: DispatchState::Idle,
            grids: None,
            _fixed: Vec::new(),
            records: None,
            record_stride: RECORD_SIZE.next_multiple_of(alignment.max(1)),
            bind_groups: Vec::new(),
            timer: GpuTimer::new(ctx, "dispatch_timestamps"),
        })
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn shape(&self) -> &WorkGroupShape {
        &self.shape
    }

    /// Steps run so far.
    pub fn steps_done(&self) -> u64 {
        self.grids.as_ref().map_or(0, PingPong::steps_done)
    }

    /// Bind the two step buffers and the trailing fixed arguments, in slot
    /// order. Every bind group the loop will need is built here; nothing is
    /// re-bound per step.
    pub fn bind(
        &mut self,
        transfers: &TransferManager<'ctx>,
        input: DeviceBuffer<'ctx>,
        output: DeviceBuffer<'ctx>,
        fixed: Vec<DeviceBuffer<'ctx>>,
    ) -> Result<()> {
        if self.state != DispatchState::Idle {
            return Err(self.misuse("bind"));
        }
        if input.size() != output.size() {
            return Err(Error::binding(
                self.kernel.entry(),
                format!(
                    "step buffers differ in size: {} and {} bytes",
                    input.size(),
                    output.size()
                ),
            ));
        }
        let records = match self.mode {
            DispatchMode::Batched { batch_size } => Some(transfers.create(
                "launch_records",
                self.record_stride * batch_size as u64,
                Access::ReadOnly,
                BufferKind::Uniform,
            )?),
            DispatchMode::Single => None,
        };

        let grids = PingPong::new(input, output);
        let mut bind_groups = Vec::with_capacity(2);
        for index in 0..2 {
            let mut args = vec![
                KernelArg::Buffer(grids.get(index)),
                KernelArg::Buffer(grids.get(1 - index)),
            ];
            let mut trailing = fixed.iter();
            for slot in &self.kernel.signature().slots[2..] {
                let arg = match (slot.kind, records.as_ref()) {
                    (ArgKind::DynamicUniform, Some(records)) => KernelArg::Records {
                        buffer: records,
                        record_size: RECORD_SIZE,
                    },
                    _ => match trailing.next() {
                        Some(buffer) => KernelArg::Buffer(buffer),
                        None => {
                            return Err(Error::binding(
                                self.kernel.entry(),
                                format!("no buffer for slot {} '{}'", slot.index, slot.name),
                            ))
                        }
                    },
                };
                args.push(arg);
            }
            if trailing.next().is_some() {
                return Err(Error::binding(
                    self.kernel.entry(),
                    "more fixed arguments than trailing slots",
                ));
            }
            bind_groups.push(self.kernel.bind(&args)?);
        }

        self.grids = Some(grids);
        self._fixed = fixed;
        self.records = records;
        self.bind_groups = bind_groups;
        self.state = DispatchState::BuffersBound;
        debug!(entry = self.kernel.entry(), shape = ?self.shape, "buffers bound");
        Ok(())
    }

    /// Run `steps` steps, blocking on every launch.
    pub fn run(&mut self, steps: u64, sink: &mut dyn TimingSink) -> Result<DispatchReport> {
        if self.state != DispatchState::BuffersBound {
            return Err(self.misuse("run"));
        }
        let Some(grids) = self.grids.as_mut() else {
            return Err(Error::binding(self.kernel.entry(), "no buffers bound"));
        };

        let mut report = DispatchReport {
            steps,
            ..Default::default()
        };
        let start = Instant::now();
        let total_description = match self.mode {
            DispatchMode::Single => {
                for step in 0..steps {
                    self.state = DispatchState::Dispatching;
                    let ms = launch(
                        self.ctx,
                        &self.kernel,
                        &self.bind_groups[grids.input_index()],
                        &self.shape,
                        None,
                        &self.timer,
                    )?;
                    self.state = DispatchState::StepComplete;
                    grids.advance(1);
                    sink.record("kernel exec time", ms);
                    report.samples.push(ms);
                    report.launches += 1;
                    debug!(step, ms, "step complete");
                }
                "total exec time"
            }
            DispatchMode::Batched { batch_size } => {
                let records = self
                    .records
                    .as_ref()
                    .ok_or_else(|| Error::binding(self.kernel.entry(), "no launch records"))?;
                for k in batch_sizes(steps, batch_size) {
                    self.state = DispatchState::Dispatching;
                    let (bytes, offsets) = launch_records(k as u32, self.record_stride);
                    self.ctx.scoped("launch record write", |_| {
                        self.ctx.queue().write_buffer(records.raw(), 0, &bytes)
                    })?;
                    let ms = launch(
                        self.ctx,
                        &self.kernel,
                        &self.bind_groups[grids.input_index()],
                        &self.shape,
                        Some(&offsets),
                        &self.timer,
                    )?;
                    self.state = DispatchState::StepComplete;
                    grids.advance(k);
                    sink.record("batch kernel exec time", ms);
                    report.samples.push(ms);
                    report.launches += 1;
                    debug!(steps = k, done = grids.steps_done(), ms, "batch complete");
                }
                "total kernel exec time"
            }
        };
        report.total_ms = report.samples.iter().sum();
        report.wall_ms = start.elapsed().as_secs_f64() * 1000.0;
        sink.record(total_description, report.total_ms);
        self.state = DispatchState::Finished;
        Ok(report)
    }

    /// The buffer in the input role, which holds the latest generation.
    pub fn current_input(&self) -> Option<&DeviceBuffer<'ctx>> {
        self.grids.as_ref().map(PingPong::input)
    }

    /// Give up the dispatcher and keep the latest generation.
    pub fn finish(self) -> Result<DeviceBuffer<'ctx>> {
        let entry = self.kernel.entry();
        self.grids
            .map(PingPong::into_input)
            .ok_or_else(|| Error::binding(entry, "no buffers bound"))
    }

    fn misuse(&self, op: &str) -> Error {
        Error::binding(
            self.kernel.entry(),
            format!("cannot {} while {:?}", op, self.state),
        )
    }
}

/// Records for one batch of `k` steps laid out at `stride`, and the dynamic
/// offset of each.
fn launch_records(k: u32, stride: u64) -> (Vec<u8>, Vec<u32>) {
    let mut bytes = vec![0u8; (stride * k as u64) as usize];
    let mut offsets = Vec::with_capacity(k as usize);
    for step in 0..k {
        let offset = stride * step as u64;
        let record = LaunchRecord {
            steps: k,
            step,
            _pad: [0; 2],
        };
        bytes[offset as usize..(offset + RECORD_SIZE) as usize]
            .copy_from_slice(bytemuck::bytes_of(&record));
        offsets.push(offset as u32);
    }
    (bytes, offsets)
}

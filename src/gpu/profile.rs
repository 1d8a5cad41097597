use super::context::DeviceContext;
use crate::error::Result;

const TIMESTAMP_BYTES: u64 = 2 * std::mem::size_of::<u64>() as u64;

/// A begin/end timestamp pair and the buffers to read it back.
///
/// Written either at the boundaries of a compute pass or, when the device
/// allows it, around arbitrary encoder commands such as buffer copies.
pub struct GpuTimer {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    period_ns: f32,
}

impl GpuTimer {
    pub fn new(ctx: &DeviceContext, label: &str) -> Self {
        let device = ctx.device();
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some(label),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp_resolve"),
            size: TIMESTAMP_BYTES,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp_readback"),
            size: TIMESTAMP_BYTES,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            query_set,
            resolve,
            readback,
            period_ns: ctx.timestamp_period(),
        }
    }

    /// Timestamp writes for a compute pass: start at its beginning, end at
    /// its end.
    pub fn pass_writes(&self) -> wgpu::ComputePassTimestampWrites<'_> {
        wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        }
    }

    /// Requires encoder timestamps; see
    /// [`DeviceContext::supports_encoder_timestamps`].
    pub fn write_start(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.write_timestamp(&self.query_set, 0);
    }

    pub fn write_end(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.write_timestamp(&self.query_set, 1);
    }

    /// Append the commands that move the pair into the readback buffer.
    /// Must be the last thing recorded after the timed work.
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.resolve_query_set(&self.query_set, 0..2, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.readback, 0, TIMESTAMP_BYTES);
    }

    /// Elapsed milliseconds between the pair. Call only after the submission
    /// containing [`GpuTimer::resolve`] has completed.
    pub fn read_ms(&self, ctx: &DeviceContext) -> Result<f64> {
        let slice = self.readback.slice(..);
        ctx.map_blocking(slice, wgpu::MapMode::Read)?;
        let ticks = {
            let data = slice.get_mapped_range();
            let stamps: [u64; 2] = bytemuck::pod_read_unaligned(&data[..TIMESTAMP_BYTES as usize]);
            stamps[1].saturating_sub(stamps[0])
        };
        self.readback.unmap();
        Ok(ticks_to_ms(ticks, self.period_ns))
    }
}

fn ticks_to_ms(ticks: u64, period_ns: f32) -> f64 {
    ticks as f64 * period_ns as f64 / 1_000_000.0
}

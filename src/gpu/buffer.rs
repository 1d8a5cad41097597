//! Device buffers and host/device transfers.
//!
//! Two upload strategies exist. Copy-on-create hands the bytes to the device
//! at buffer creation. Pinned goes through one host-visible staging buffer
//! that is mapped, filled in place, unmapped and copied from; the staging
//! buffer is kept and reused for every later upload, and grows only when an
//! upload exceeds it. Read-back always goes through a mapped download buffer
//! after the copy into it has completed.

use std::marker::PhantomData;
use std::time::Instant;

use serde::Deserialize;
use tracing::debug;
use wgpu::util::DeviceExt;

use super::context::DeviceContext;
use super::profile::GpuTimer;
use crate::error::{Error, Result};
use crate::timing::TimingSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Storage,
    Uniform,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagingStrategy {
    #[default]
    CopyOnCreate,
    Pinned,
}

/// Copies and mappings work in 4-byte units; zero-sized buffers cannot be
/// bound.
fn padded(len: u64) -> u64 {
    len.max(1).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

/// A device allocation tied to the context it was created from.
pub struct DeviceBuffer<'ctx> {
    buffer: wgpu::Buffer,
    size: u64,
    access: Access,
    kind: BufferKind,
    label: String,
    _ctx: PhantomData<&'ctx DeviceContext>,
}

impl<'ctx> DeviceBuffer<'ctx> {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Logical size in bytes, before padding.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Free the device memory now instead of at drop.
    pub fn release(self) {
        debug!(label = %self.label, bytes = self.size, "releasing device buffer");
        self.buffer.destroy();
    }
}

impl std::fmt::Debug for DeviceBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("access", &self.access)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Staging {
    buffer: wgpu::Buffer,
    capacity: u64,
    mapped: bool,
}

pub struct TransferManager<'ctx> {
    ctx: &'ctx DeviceContext,
    strategy: StagingStrategy,
    upload: Option<Staging>,
    download: Option<Staging>,
    timer: Option<GpuTimer>,
}

impl<'ctx> TransferManager<'ctx> {
    pub fn new(ctx: &'ctx DeviceContext, strategy: StagingStrategy) -> Self {
        let timer = ctx
            .supports_encoder_timestamps()
            .then(|| GpuTimer::new(ctx, "transfer_timestamps"));
        if timer.is_none() {
            tracing::warn!("encoder timestamps unavailable, timing transfers on the host");
        }
        Self {
            ctx,
            strategy,
            upload: None,
            download: None,
            timer,
        }
    }

    pub fn strategy(&self) -> StagingStrategy {
        self.strategy
    }

    /// Bytes currently held by the pinned upload region.
    pub fn staging_capacity(&self) -> u64 {
        self.upload.as_ref().map_or(0, |s| s.capacity)
    }

    fn usage(kind: BufferKind) -> wgpu::BufferUsages {
        match kind {
            BufferKind::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC
            }
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        }
    }

    fn check_size(&self, label: &str, size: u64, kind: BufferKind) -> Result<()> {
        let limits = self.ctx.limits();
        let max = match kind {
            BufferKind::Storage => limits.max_storage_buffer_binding_size as u64,
            BufferKind::Uniform => limits.max_buffer_size,
        };
        if padded(size) > max {
            return Err(Error::device(
                "buffer creation",
                format!("'{}' needs {} bytes, device allows {}", label, size, max),
            ));
        }
        Ok(())
    }

    fn wrap(
        &self,
        buffer: wgpu::Buffer,
        label: &str,
        size: u64,
        access: Access,
        kind: BufferKind,
    ) -> DeviceBuffer<'ctx> {
        debug!(label, bytes = size, ?access, ?kind, "created device buffer");
        DeviceBuffer {
            buffer,
            size,
            access,
            kind,
            label: label.to_string(),
            _ctx: PhantomData,
        }
    }

    /// Zero-initialised device buffer of `size` bytes.
    pub fn create(
        &self,
        label: &str,
        size: u64,
        access: Access,
        kind: BufferKind,
    ) -> Result<DeviceBuffer<'ctx>> {
        self.check_size(label, size, kind)?;
        let buffer = self.ctx.scoped("buffer creation", |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: padded(size),
                usage: Self::usage(kind),
                mapped_at_creation: false,
            })
        })?;
        Ok(self.wrap(buffer, label, size, access, kind))
    }

    /// Device buffer holding `bytes`, copied at creation. Untimed.
    pub fn create_init(
        &self,
        label: &str,
        bytes: &[u8],
        access: Access,
        kind: BufferKind,
    ) -> Result<DeviceBuffer<'ctx>> {
        self.check_size(label, bytes.len() as u64, kind)?;
        let contents: &[u8] = if bytes.is_empty() { &[0; 4] } else { bytes };
        let buffer = self.ctx.scoped("buffer creation", |device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: Self::usage(kind),
            })
        })?;
        Ok(self.wrap(buffer, label, bytes.len() as u64, access, kind))
    }

    /// Uniform buffer holding one POD record.
    pub fn uniform<T: bytemuck::Pod>(&self, label: &str, value: &T) -> Result<DeviceBuffer<'ctx>> {
        self.create_init(label, bytemuck::bytes_of(value), Access::ReadOnly, BufferKind::Uniform)
    }

    /// Move `bytes` into a new storage buffer with the configured strategy
    /// and report the transfer as `host-to-device transfer time`. Pinned
    /// staging also reports the host-side span, mapping included, as
    /// `total host-to-device transfer time`.
    pub fn stage(
        &mut self,
        label: &str,
        bytes: &[u8],
        access: Access,
        sink: &mut dyn TimingSink,
    ) -> Result<DeviceBuffer<'ctx>> {
        match self.strategy {
            StagingStrategy::CopyOnCreate => {
                let start = Instant::now();
                let buffer = self.create_init(label, bytes, access, BufferKind::Storage)?;
                sink.record_since("host-to-device transfer time", start);
                Ok(buffer)
            }
            StagingStrategy::Pinned => self.stage_pinned(label, bytes, access, sink),
        }
    }

    fn stage_pinned(
        &mut self,
        label: &str,
        bytes: &[u8],
        access: Access,
        sink: &mut dyn TimingSink,
    ) -> Result<DeviceBuffer<'ctx>> {
        let ctx = self.ctx;
        let size = padded(bytes.len() as u64);
        let target = self.create(label, bytes.len() as u64, access, BufferKind::Storage)?;

        let start = Instant::now();
        let staging = self.upload_region(size)?;
        {
            let mut view = staging.buffer.slice(..size).get_mapped_range_mut();
            view[..bytes.len()].copy_from_slice(bytes);
            view[bytes.len()..].fill(0);
        }
        staging.buffer.unmap();
        staging.mapped = false;

        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("upload_encoder"),
            });
        if let Some(timer) = &self.timer {
            timer.write_start(&mut encoder);
        }
        if let Some(staging) = &self.upload {
            encoder.copy_buffer_to_buffer(&staging.buffer, 0, target.raw(), 0, size);
        }
        if let Some(timer) = &self.timer {
            timer.write_end(&mut encoder);
            timer.resolve(&mut encoder);
        }
        ctx.submit_and_wait("host-to-device transfer", encoder)?;

        let ms = match &self.timer {
            Some(timer) => timer.read_ms(ctx)?,
            None => start.elapsed().as_secs_f64() * 1000.0,
        };
        sink.record("host-to-device transfer time", ms);
        sink.record_since("total host-to-device transfer time", start);
        Ok(target)
    }

    /// The pinned upload region, mapped for writing and at least `size`
    /// bytes long.
    fn upload_region(&mut self, size: u64) -> Result<&mut Staging> {
        let ctx = self.ctx;
        let fits = self.upload.as_ref().is_some_and(|s| s.capacity >= size);
        if !fits {
            debug!(bytes = size, "allocating pinned upload region");
            let buffer = ctx.scoped("staging allocation", |device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("upload_staging"),
                    size,
                    usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: true,
                })
            })?;
            self.upload = Some(Staging {
                buffer,
                capacity: size,
                mapped: true,
            });
        }
        let staging = self
            .upload
            .as_mut()
            .ok_or_else(|| Error::device("staging allocation", "upload region missing"))?;
        if !staging.mapped {
            ctx.map_blocking(staging.buffer.slice(..), wgpu::MapMode::Write)?;
            staging.mapped = true;
        }
        Ok(staging)
    }

    /// Overwrite the start of `buffer` with `bytes` through the queue.
    /// `bytes` must be a whole number of 4-byte words.
    pub fn write(&self, buffer: &DeviceBuffer<'ctx>, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        if len > buffer.size || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::device(
                "buffer write",
                format!(
                    "{} bytes into '{}' of {} bytes",
                    len, buffer.label, buffer.size
                ),
            ));
        }
        self.ctx.scoped("buffer write", |_| {
            self.ctx.queue().write_buffer(&buffer.buffer, 0, bytes)
        })
    }

    /// Blocking read of the first `byte_count` bytes of `buffer`, reported
    /// as `device-to-host transfer time` (plus `total device-to-host transfer
    /// time` under pinned staging). All launches using `buffer` must already
    /// have completed, which every submission path here guarantees.
    pub fn read_back(
        &mut self,
        buffer: &DeviceBuffer<'ctx>,
        byte_count: u64,
        sink: &mut dyn TimingSink,
    ) -> Result<Vec<u8>> {
        if byte_count > buffer.size {
            return Err(Error::device(
                "read back",
                format!(
                    "{} bytes requested from '{}' of {} bytes",
                    byte_count, buffer.label, buffer.size
                ),
            ));
        }
        let ctx = self.ctx;
        let size = padded(byte_count);
        let fits = self.download.as_ref().is_some_and(|s| s.capacity >= size);
        if !fits {
            let staging = ctx.scoped("staging allocation", |device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("download_staging"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })?;
            self.download = Some(Staging {
                buffer: staging,
                capacity: size,
                mapped: false,
            });
        }
        let staging = self
            .download
            .as_ref()
            .ok_or_else(|| Error::device("staging allocation", "download region missing"))?;

        let start = Instant::now();
        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        if let Some(timer) = &self.timer {
            timer.write_start(&mut encoder);
        }
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging.buffer, 0, size);
        if let Some(timer) = &self.timer {
            timer.write_end(&mut encoder);
            timer.resolve(&mut encoder);
        }
        ctx.submit_and_wait("device-to-host transfer", encoder)?;

        let slice = staging.buffer.slice(..size);
        ctx.map_blocking(slice, wgpu::MapMode::Read)?;
        let bytes = slice.get_mapped_range()[..byte_count as usize].to_vec();
        staging.buffer.unmap();

        let ms = match &self.timer {
            Some(timer) => timer.read_ms(ctx)?,
            None => start.elapsed().as_secs_f64() * 1000.0,
        };
        sink.record("device-to-host transfer time", ms);
        if self.strategy == StagingStrategy::Pinned {
            sink.record_since("total device-to-host transfer time", start);
        }
        Ok(bytes)
    }
}

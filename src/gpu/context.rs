use std::time::Instant;

use tracing::{debug, info};

use super::workgroup::WorkGroupLimits;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct DeviceOptions {
    pub power_preference: wgpu::PowerPreference,
    /// Accept CPU-class adapters (llvmpipe, WARP). Off outside of CI.
    pub allow_software: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            allow_software: false,
        }
    }
}

/// The single device context of a run: instance, adapter, device and a
/// profiling-capable queue.
///
/// Buffers, kernels and dispatchers borrow the context, so none of them can
/// outlive it; dropping it (or calling [`DeviceContext::release`]) tears the
/// device down on every exit path.
pub struct DeviceContext {
    // Field order is drop order: queue and device go before their adapter.
    queue: wgpu::Queue,
    device: wgpu::Device,
    adapter: wgpu::Adapter,
    _instance: wgpu::Instance,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    encoder_timestamps: bool,
    timestamp_period: f32,
}

impl DeviceContext {
    /// Acquire one GPU-class adapter and open a device with timestamp
    /// queries enabled.
    pub fn acquire(options: &DeviceOptions) -> Result<Self> {
        let start = Instant::now();
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: options.power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| Error::DeviceUnavailable("no adapter could be enumerated".into()))?;

        let info = adapter.get_info();
        if !is_gpu_class(info.device_type) && !options.allow_software {
            return Err(Error::DeviceUnavailable(format!(
                "adapter '{}' is {:?}, not a GPU",
                info.name, info.device_type
            )));
        }

        let features = adapter.features();
        if !features.contains(wgpu::Features::TIMESTAMP_QUERY) {
            return Err(Error::DeviceUnavailable(format!(
                "adapter '{}' does not support timestamp queries, which profiling requires",
                info.name
            )));
        }
        let encoder_timestamps =
            features.contains(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS);
        let mut required_features = wgpu::Features::TIMESTAMP_QUERY;
        if encoder_timestamps {
            required_features |= wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
        }

        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("offload"),
                required_features,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        // Errors outside an error scope mean device state we no longer trust.
        device.on_uncaptured_error(Box::new(|err| {
            tracing::error!(%err, "uncaptured device error");
            std::process::abort();
        }));

        let timestamp_period = queue.get_timestamp_period();
        info!(
            adapter = %info.name,
            backend = ?info.backend,
            driver = %info.driver,
            device_type = ?info.device_type,
            max_invocations = limits.max_compute_invocations_per_workgroup,
            encoder_timestamps,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "device context acquired"
        );

        Ok(Self {
            queue,
            device,
            adapter,
            _instance: instance,
            info,
            limits,
            encoder_timestamps,
            timestamp_period,
        })
    }

    /// Tear the context down. Everything borrowed from it is already gone,
    /// which the borrow checker guarantees.
    pub fn release(self) {
        info!(adapter = %self.info.name, "releasing device context");
        drop(self);
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter(&self) -> &wgpu::Adapter {
        &self.adapter
    }

    pub fn info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    pub fn work_group_limits(&self) -> WorkGroupLimits {
        WorkGroupLimits::from_limits(&self.limits)
    }

    /// Whether copies can be bracketed by device timestamps.
    pub fn supports_encoder_timestamps(&self) -> bool {
        self.encoder_timestamps
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    /// Label for the `platform` column of the benchmark log.
    pub fn platform_label(&self) -> String {
        format!("wgpu-{:?}", self.info.backend).to_lowercase()
    }

    /// Run `f` inside validation and out-of-memory error scopes; a captured
    /// error becomes [`Error::Device`] carrying the driver's message.
    pub fn scoped<T>(&self, op: &'static str, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            Some(err) => Err(Error::device(op, err)),
            None => Ok(value),
        }
    }

    /// Submit `encoder` and block until the device has finished it.
    pub fn submit_and_wait(&self, op: &'static str, encoder: wgpu::CommandEncoder) -> Result<()> {
        let index = self.scoped(op, |_| self.queue.submit(std::iter::once(encoder.finish())))?;
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        debug!(op, "submission complete");
        Ok(())
    }

    /// Map `slice` and block until the mapping is usable.
    pub fn map_blocking(&self, slice: wgpu::BufferSlice<'_>, mode: wgpu::MapMode) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(mode, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| Error::device("buffer map", "mapping callback never ran"))?
            .map_err(|e| Error::device("buffer map", e))
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .field("encoder_timestamps", &self.encoder_timestamps)
            .finish()
    }
}

fn is_gpu_class(device_type: wgpu::DeviceType) -> bool {
    matches!(
        device_type,
        wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu
    )
}

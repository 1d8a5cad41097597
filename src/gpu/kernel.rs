//! Kernel loading, argument contracts and the compiled-kernel cache.
//!
//! A kernel is a WGSL entry point plus a [`KernelSignature`]: the ordered
//! list of binding slots the host promises to fill. The signature is checked
//! on the host first, then the pipeline is created against a layout built
//! from it, so a shader that disagrees with its signature fails at load time
//! instead of at the first dispatch.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info};

use super::buffer::{Access, BufferKind, DeviceBuffer};
use super::context::DeviceContext;
use super::workgroup::{resolve_local, ProblemShape, WorkGroupShape};
use crate::diagnostic::{render_diagnostics, Diagnostic};
use crate::error::{Error, Result};
use crate::timing::TimingSink;

/// What a slot means to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgRole {
    /// Data the kernel reads; for step kernels, the current generation.
    Input,
    /// Data the kernel writes.
    Output,
    /// Read-only side data (offsets, constants).
    Table,
    /// Problem dimensions, set once per binding.
    Dimensions,
    /// Per-launch flags.
    Mode,
}

/// How a slot is bound on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    ReadOnlyStorage,
    ReadWriteStorage,
    Uniform,
    /// Uniform buffer of fixed-size records selected by a dynamic offset.
    DynamicUniform,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgSlot {
    pub index: u32,
    pub role: ArgRole,
    pub kind: ArgKind,
    pub name: &'static str,
}

/// The positional contract between the host and one kernel entry point.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelSignature {
    /// File stem under the kernel directory.
    pub source: &'static str,
    pub entry: &'static str,
    pub dims: usize,
    pub slots: &'static [ArgSlot],
}

impl KernelSignature {
    pub fn validate(&self) -> Result<()> {
        let fail = |detail: String| Err(Error::binding(self.entry, detail));

        if !(1..=2).contains(&self.dims) {
            return fail(format!("{} dimensions, expected 1 or 2", self.dims));
        }
        if self.slots.is_empty() {
            return fail("no argument slots".into());
        }
        for (position, slot) in self.slots.iter().enumerate() {
            if slot.index as usize != position {
                return fail(format!(
                    "slot '{}' has index {} at position {}",
                    slot.name, slot.index, position
                ));
            }
            if self.slots[..position].iter().any(|s| s.name == slot.name) {
                return fail(format!("slot name '{}' used twice", slot.name));
            }
            let legal = match slot.role {
                ArgRole::Input | ArgRole::Table => {
                    matches!(slot.kind, ArgKind::ReadOnlyStorage | ArgKind::ReadWriteStorage)
                }
                ArgRole::Output => slot.kind == ArgKind::ReadWriteStorage,
                ArgRole::Dimensions => slot.kind == ArgKind::Uniform,
                ArgRole::Mode => matches!(slot.kind, ArgKind::Uniform | ArgKind::DynamicUniform),
            };
            if !legal {
                return fail(format!(
                    "slot {} '{}': {:?} cannot be bound as {:?}",
                    slot.index, slot.name, slot.role, slot.kind
                ));
            }
        }
        if self.slots[0].role != ArgRole::Input {
            return fail(format!("slot 0 '{}' must be an input", self.slots[0].name));
        }
        if !self.slots.iter().any(|s| s.role == ArgRole::Output) {
            return fail("no output slot".into());
        }
        let dynamic = self
            .slots
            .iter()
            .filter(|s| s.kind == ArgKind::DynamicUniform)
            .count();
        if dynamic > 1 {
            return fail(format!("{} dynamic-offset slots, at most 1 allowed", dynamic));
        }
        Ok(())
    }

    /// Slot 1 exists and is the output, as ping-pong stepping requires.
    pub fn is_step_kernel(&self) -> bool {
        self.slots.get(1).is_some_and(|s| s.role == ArgRole::Output)
    }

    pub fn has_dynamic_slot(&self) -> bool {
        self.slots.iter().any(|s| s.kind == ArgKind::DynamicUniform)
    }

    fn layout_entries(&self) -> Vec<wgpu::BindGroupLayoutEntry> {
        self.slots
            .iter()
            .map(|slot| {
                let (ty, has_dynamic_offset) = match slot.kind {
                    ArgKind::ReadOnlyStorage => {
                        (wgpu::BufferBindingType::Storage { read_only: true }, false)
                    }
                    ArgKind::ReadWriteStorage => {
                        (wgpu::BufferBindingType::Storage { read_only: false }, false)
                    }
                    ArgKind::Uniform => (wgpu::BufferBindingType::Uniform, false),
                    ArgKind::DynamicUniform => (wgpu::BufferBindingType::Uniform, true),
                };
                wgpu::BindGroupLayoutEntry {
                    binding: slot.index,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty,
                        has_dynamic_offset,
                        min_binding_size: None,
                    },
                    count: None,
                }
            })
            .collect()
    }
}

/// One argument handed to [`CompiledKernel::bind`].
#[derive(Clone, Copy, Debug)]
pub enum KernelArg<'a, 'ctx> {
    Buffer(&'a DeviceBuffer<'ctx>),
    /// Bind a window of `record_size` bytes; the dispatch supplies the offset.
    Records {
        buffer: &'a DeviceBuffer<'ctx>,
        record_size: u64,
    },
}

pub struct CompiledKernel<'ctx> {
    ctx: &'ctx DeviceContext,
    signature: &'static KernelSignature,
    source_path: PathBuf,
    _module: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
    local: [u32; 2],
    compile_time_ms: f64,
}

impl<'ctx> CompiledKernel<'ctx> {
    pub fn entry(&self) -> &'static str {
        self.signature.entry
    }

    pub fn signature(&self) -> &'static KernelSignature {
        self.signature
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    /// Local work-group size baked into the pipeline.
    pub fn local(&self) -> [u32; 2] {
        self.local
    }

    pub fn compile_time_ms(&self) -> f64 {
        self.compile_time_ms
    }

    /// Global size for `problem` at this kernel's local size.
    pub fn shape_for(&self, problem: ProblemShape) -> Result<WorkGroupShape> {
        if problem.dims() != self.signature.dims {
            return Err(Error::binding(
                self.entry(),
                format!(
                    "{}-dimensional problem for a {}-dimensional kernel",
                    problem.dims(),
                    self.signature.dims
                ),
            ));
        }
        WorkGroupShape::covering(self.local, problem, &self.ctx.work_group_limits())
    }

    /// Build a bind group filling every slot, in slot order.
    pub fn bind(&self, args: &[KernelArg<'_, 'ctx>]) -> Result<wgpu::BindGroup> {
        let slots = self.signature.slots;
        if args.len() != slots.len() {
            return Err(Error::binding(
                self.entry(),
                format!("{} arguments for {} slots", args.len(), slots.len()),
            ));
        }

        let mut entries = Vec::with_capacity(args.len());
        for (slot, arg) in slots.iter().zip(args) {
            let resource = match (slot.kind, *arg) {
                (ArgKind::DynamicUniform, KernelArg::Records { buffer, record_size }) => {
                    self.check_buffer(slot, buffer, BufferKind::Uniform, false)?;
                    let size = NonZeroU64::new(record_size)
                        .filter(|n| n.get() <= buffer.size())
                        .ok_or_else(|| {
                            Error::binding(
                                self.entry(),
                                format!(
                                    "slot {} '{}': record size {} for a {}-byte buffer",
                                    slot.index,
                                    slot.name,
                                    record_size,
                                    buffer.size()
                                ),
                            )
                        })?;
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: buffer.raw(),
                        offset: 0,
                        size: Some(size),
                    })
                }
                (ArgKind::DynamicUniform, KernelArg::Buffer(_)) => {
                    return Err(Error::binding(
                        self.entry(),
                        format!("slot {} '{}' takes records", slot.index, slot.name),
                    ));
                }
                (_, KernelArg::Records { .. }) => {
                    return Err(Error::binding(
                        self.entry(),
                        format!("slot {} '{}' takes a whole buffer", slot.index, slot.name),
                    ));
                }
                (ArgKind::Uniform, KernelArg::Buffer(buffer)) => {
                    self.check_buffer(slot, buffer, BufferKind::Uniform, false)?;
                    buffer.raw().as_entire_binding()
                }
                (ArgKind::ReadOnlyStorage, KernelArg::Buffer(buffer)) => {
                    self.check_buffer(slot, buffer, BufferKind::Storage, false)?;
                    buffer.raw().as_entire_binding()
                }
                (ArgKind::ReadWriteStorage, KernelArg::Buffer(buffer)) => {
                    self.check_buffer(slot, buffer, BufferKind::Storage, true)?;
                    buffer.raw().as_entire_binding()
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.index,
                resource,
            });
        }

        self.ctx.scoped("bind group creation", |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(self.entry()),
                layout: &self.layout,
                entries: &entries,
            })
        })
    }

    fn check_buffer(
        &self,
        slot: &ArgSlot,
        buffer: &DeviceBuffer<'ctx>,
        kind: BufferKind,
        writable: bool,
    ) -> Result<()> {
        if buffer.kind() != kind {
            return Err(Error::binding(
                self.entry(),
                format!(
                    "slot {} '{}' needs a {:?} buffer, '{}' is {:?}",
                    slot.index,
                    slot.name,
                    kind,
                    buffer.label(),
                    buffer.kind()
                ),
            ));
        }
        if writable && buffer.access() != Access::ReadWrite {
            return Err(Error::binding(
                self.entry(),
                format!(
                    "slot {} '{}' is written by the kernel, '{}' is read-only",
                    slot.index,
                    slot.name,
                    buffer.label()
                ),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CompiledKernel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("entry", &self.signature.entry)
            .field("source_path", &self.source_path)
            .field("local", &self.local)
            .field("compile_time_ms", &self.compile_time_ms)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct KernelKey {
    path: PathBuf,
    source_hash: [u8; 32],
    entry: &'static str,
    local: [u32; 2],
}

/// Compiles kernels against one device and keeps them for reuse.
pub struct KernelLoader<'ctx> {
    ctx: &'ctx DeviceContext,
    kernel_dir: PathBuf,
    cache: HashMap<KernelKey, Rc<CompiledKernel<'ctx>>>,
}

impl<'ctx> KernelLoader<'ctx> {
    pub fn new(ctx: &'ctx DeviceContext, kernel_dir: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            kernel_dir: kernel_dir.into(),
            cache: HashMap::new(),
        }
    }

    pub fn kernel_dir(&self) -> &Path {
        &self.kernel_dir
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Load `<kernel_dir>/<signature.source>.wgsl`.
    pub fn load(
        &mut self,
        signature: &'static KernelSignature,
        sink: &mut dyn TimingSink,
    ) -> Result<Rc<CompiledKernel<'ctx>>> {
        let path = self.kernel_dir.join(format!("{}.wgsl", signature.source));
        self.load_from(&path, signature, sink)
    }

    /// Load `signature.entry` from `path`. A kernel already compiled from
    /// the same source text with the same work-group size is returned from
    /// the cache without recompiling.
    pub fn load_from(
        &mut self,
        path: &Path,
        signature: &'static KernelSignature,
        sink: &mut dyn TimingSink,
    ) -> Result<Rc<CompiledKernel<'ctx>>> {
        signature.validate()?;
        let source = read_source(path)?;
        let local = resolve_local(&self.ctx.work_group_limits(), signature.dims);
        let key = KernelKey {
            path: path.to_path_buf(),
            source_hash: *blake3::hash(source.as_bytes()).as_bytes(),
            entry: signature.entry,
            local,
        };
        if let Some(kernel) = self.cache.get(&key) {
            debug!(entry = signature.entry, path = %path.display(), "kernel cache hit");
            return Ok(Rc::clone(kernel));
        }

        let start = Instant::now();
        let kernel = Rc::new(self.compile(path, &source, signature, local)?);
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        sink.record("kernel compile time", ms);
        info!(
            entry = signature.entry,
            path = %path.display(),
            ?local,
            compile_ms = ms,
            "kernel compiled"
        );
        self.cache.insert(key, Rc::clone(&kernel));
        Ok(kernel)
    }

    fn compile(
        &self,
        path: &Path,
        source: &str,
        signature: &'static KernelSignature,
        local: [u32; 2],
    ) -> Result<CompiledKernel<'ctx>> {
        let start = Instant::now();
        let device = self.ctx.device();
        let compile_error = |log: String| Error::Compile {
            path: path.to_path_buf(),
            entry: signature.entry.to_string(),
            log,
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(signature.source),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let module_error = pollster::block_on(device.pop_error_scope());
        let info = pollster::block_on(module.get_compilation_info());
        let diagnostics: Vec<Diagnostic> = info
            .messages
            .iter()
            .map(Diagnostic::from_compilation)
            .collect();
        let filename = path.display().to_string();
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(compile_error(render_diagnostics(&diagnostics, &filename, source)));
        }
        if let Some(err) = module_error {
            return Err(compile_error(err.to_string()));
        }
        for warning in &diagnostics {
            tracing::warn!(entry = signature.entry, "{}", warning.message);
        }

        if !declares_entry_point(source, signature.entry) {
            let missing = Diagnostic::error(
                format!("entry point `{}` not found", signature.entry),
                None,
            )
            .with_note(format!("expected `@compute` function `{}`", signature.entry));
            return Err(compile_error(missing.render(&filename, source)));
        }

        let layout_entries = signature.layout_entries();
        let layout = self.ctx.scoped("bind group layout creation", |device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(signature.entry),
                entries: &layout_entries,
            })
        })?;
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(signature.entry),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let mut constants = HashMap::new();
        constants.insert("wg_x".to_string(), local[0] as f64);
        if signature.dims == 2 {
            constants.insert("wg_y".to_string(), local[1] as f64);
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(signature.entry),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(signature.entry),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                zero_initialize_workgroup_memory: false,
            },
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(Error::binding(
                signature.entry,
                format!("shader disagrees with its argument slots: {}", err),
            ));
        }

        Ok(CompiledKernel {
            ctx: self.ctx,
            signature,
            source_path: path.to_path_buf(),
            _module: module,
            layout,
            pipeline,
            local,
            compile_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

pub fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

/// Whether `source` declares `entry` as a `@compute` function. Line
/// comments are ignored. The attributes of a function are the text between
/// the end of the previous declaration (`;` or `}`) and its `fn` keyword.
pub fn declares_entry_point(source: &str, entry: &str) -> bool {
    let code = source
        .lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n");
    let mut search = 0;
    while let Some(found) = code[search..].find("fn") {
        let pos = search + found;
        search = pos + 2;
        let before = &code[..pos];
        if before.chars().next_back().is_some_and(is_ident_char) {
            continue;
        }
        let Some(name) = code[pos + 2..].strip_prefix(char::is_whitespace) else {
            continue;
        };
        let Some(tail) = name.trim_start().strip_prefix(entry) else {
            continue;
        };
        if !tail.trim_start().starts_with('(') {
            continue;
        }
        let attributes = before
            .rfind([';', '}'])
            .map_or(before, |end| &before[end + 1..]);
        if attributes.contains("@compute") {
            return true;
        }
    }
    false
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn slot(index: u32, role: ArgRole, kind: ArgKind, name: &'static str) -> ArgSlot {
        ArgSlot {
            index,
            role,
            kind,
            name,
        }
    }

    static STEP: KernelSignature = KernelSignature {
        source: "step",
        entry: "step",
        dims: 2,
        slots: &[
            slot(0, ArgRole::Input, ArgKind::ReadWriteStorage, "input"),
            slot(1, ArgRole::Output, ArgKind::ReadWriteStorage, "output"),
            slot(2, ArgRole::Dimensions, ArgKind::Uniform, "dims"),
            slot(3, ArgRole::Mode, ArgKind::DynamicUniform, "launch"),
        ],
    };

    #[test]
    fn well_formed_signature_validates() {
        STEP.validate().unwrap();
        assert!(STEP.is_step_kernel());
        assert!(STEP.has_dynamic_slot());
    }

    #[test]
    fn out_of_order_slots_are_rejected() {
        static BAD: KernelSignature = KernelSignature {
            source: "k",
            entry: "k",
            dims: 1,
            slots: &[
                slot(0, ArgRole::Input, ArgKind::ReadOnlyStorage, "a"),
                slot(2, ArgRole::Output, ArgKind::ReadWriteStorage, "b"),
            ],
        };
        let err = BAD.validate().unwrap_err();
        assert!(matches!(err, Error::Binding { .. }));
        assert!(err.to_string().contains("index 2 at position 1"));
    }

    #[test]
    fn read_only_output_is_rejected() {
        static BAD: KernelSignature = KernelSignature {
            source: "k",
            entry: "k",
            dims: 1,
            slots: &[
                slot(0, ArgRole::Input, ArgKind::ReadOnlyStorage, "a"),
                slot(1, ArgRole::Output, ArgKind::ReadOnlyStorage, "b"),
            ],
        };
        assert!(BAD.validate().is_err());
    }

    #[test]
    fn missing_output_is_rejected() {
        static BAD: KernelSignature = KernelSignature {
            source: "k",
            entry: "k",
            dims: 1,
            slots: &[
                slot(0, ArgRole::Input, ArgKind::ReadOnlyStorage, "a"),
                slot(1, ArgRole::Dimensions, ArgKind::Uniform, "n"),
            ],
        };
        assert!(BAD.validate().unwrap_err().to_string().contains("no output"));
    }

    #[test]
    fn duplicate_names_and_bad_dims_are_rejected() {
        static DUP: KernelSignature = KernelSignature {
            source: "k",
            entry: "k",
            dims: 1,
            slots: &[
                slot(0, ArgRole::Input, ArgKind::ReadOnlyStorage, "a"),
                slot(1, ArgRole::Output, ArgKind::ReadWriteStorage, "a"),
            ],
        };
        assert!(DUP.validate().is_err());

        static FLAT: KernelSignature = KernelSignature {
            source: "k",
            entry: "k",
            dims: 3,
            slots: &[
                slot(0, ArgRole::Input, ArgKind::ReadOnlyStorage, "a"),
                slot(1, ArgRole::Output, ArgKind::ReadWriteStorage, "b"),
            ],
        };
        assert!(FLAT.validate().is_err());
    }

    #[test]
    fn layout_mirrors_slots() {
        let entries = STEP.layout_entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].binding, 2);
        assert!(matches!(
            entries[3].ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                ..
            }
        ));
        assert!(matches!(
            entries[0].ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: false },
                ..
            }
        ));
    }

    #[test]
    fn entry_point_detection() {
        let source = concat!(
            "@compute @workgroup_size(wg_x, wg_y)\n",
            "fn gol_multi_step(@builtin(global_invocation_id) id: vec3<u32>) {}\n",
        );
        assert!(declares_entry_point(source, "gol_multi_step"));
        assert!(!declares_entry_point(source, "gol"));
        assert!(declares_entry_point("@compute @workgroup_size(1)\nfn  gol (x: u32) {}", "gol"));
        assert!(!declares_entry_point("// @compute fn gol() {}", "gol"));
        assert!(!declares_entry_point("@compute fn golden() {}", "gol"));
        assert!(!declares_entry_point("@compute let refn gol() {}", "gol"));
    }

    #[test]
    fn plain_helper_is_not_an_entry_point() {
        assert!(!declares_entry_point("fn gol(x: u32) -> u32 { return x; }", "gol"));
        let helper_after_entry = concat!(
            "@compute @workgroup_size(wg_x)\n",
            "fn main(@builtin(global_invocation_id) id: vec3<u32>) {}\n",
            "fn gol(x: u32) -> u32 { return x; }\n",
        );
        assert!(!declares_entry_point(helper_after_entry, "gol"));
        let after_struct = concat!(
            "struct Dims { width: u32, height: u32, }\n",
            "@compute\n@workgroup_size(wg_x, wg_y)\nfn gol() {}\n",
        );
        assert!(declares_entry_point(after_struct, "gol"));
    }

    #[test]
    fn read_source_reports_path() {
        let err = read_source(Path::new("/nonexistent/kernels/gol.wgsl")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(err.to_string().contains("gol.wgsl"));
    }
}

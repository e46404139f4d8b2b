//! GPU matrix kernels on wgpu
//!
//! [`GpuContext`] acquires one adapter, one device and one queue and compiles
//! the fixed kernel set up front. Every matrix operation is a single compute
//! dispatch submitted to that queue, so device work runs in submission order
//! and only host reads need to wait.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, info};

use crate::backend::{Activation, Backend, ElementwiseOp, GemmDims, ScalarOp, Transpose};
use crate::error::{NeuralError, Result};
use crate::gpu_buffers::{byte_len, read_buffer_into_sync, GpuBuffer};

/// Threads per workgroup for the one-dimensional kernels
const LINEAR_WORKGROUP: usize = 64;
/// Threads per workgroup for the reduction
const REDUCE_WORKGROUP: usize = 256;
/// Workgroup edge for the two-dimensional kernels, one invocation per output cell
const BLOCK: usize = 8;
/// Per-dimension dispatch limit guaranteed by WebGPU
const MAX_WORKGROUPS_PER_DIMENSION: usize = 65_535;

/// Uniform shared by every kernel. Element-wise kernels read the length from
/// `m`; products use all three dimensions.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct KernelParams {
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub scalar: f32,
}

/// The compiled kernel set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Add,
    Sub,
    Multiply,
    Divide,
    Scale,
    DivideScalar,
    Power,
    Dot,
    DotTransposeA,
    DotTransposeB,
    Sigmoid,
    SigmoidPrime,
    Transpose,
    Axpy,
    ReduceSum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shader {
    Elementwise,
    Matmul,
    Unary,
    Reduce,
}

/// Two inputs and an output, or one input and an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayoutKind {
    Binary,
    Unary,
}

impl Kernel {
    pub const ALL: [Kernel; 15] = [
        Kernel::Add,
        Kernel::Sub,
        Kernel::Multiply,
        Kernel::Divide,
        Kernel::Scale,
        Kernel::DivideScalar,
        Kernel::Power,
        Kernel::Dot,
        Kernel::DotTransposeA,
        Kernel::DotTransposeB,
        Kernel::Sigmoid,
        Kernel::SigmoidPrime,
        Kernel::Transpose,
        Kernel::Axpy,
        Kernel::ReduceSum,
    ];

    fn entry_point(self) -> &'static str {
        match self {
            Kernel::Add => "add_elements",
            Kernel::Sub => "sub_elements",
            Kernel::Multiply => "mul_elements",
            Kernel::Divide => "div_elements",
            Kernel::Scale => "scale",
            Kernel::DivideScalar => "divide_scalar",
            Kernel::Power => "power",
            Kernel::Dot => "matmul",
            Kernel::DotTransposeA => "matmul_at_b",
            Kernel::DotTransposeB => "matmul_a_bt",
            Kernel::Sigmoid => "sigmoid",
            Kernel::SigmoidPrime => "sigmoid_prime",
            Kernel::Transpose => "transpose_matrix",
            Kernel::Axpy => "axpy",
            Kernel::ReduceSum => "reduce_sum",
        }
    }

    fn shader(self) -> Shader {
        match self {
            Kernel::Add | Kernel::Sub | Kernel::Multiply | Kernel::Divide => Shader::Elementwise,
            Kernel::Dot | Kernel::DotTransposeA | Kernel::DotTransposeB => Shader::Matmul,
            Kernel::ReduceSum => Shader::Reduce,
            _ => Shader::Unary,
        }
    }

    fn layout(self) -> LayoutKind {
        match self.shader() {
            Shader::Elementwise | Shader::Matmul => LayoutKind::Binary,
            Shader::Unary | Shader::Reduce => LayoutKind::Unary,
        }
    }
}

impl From<ElementwiseOp> for Kernel {
    fn from(op: ElementwiseOp) -> Self {
        match op {
            ElementwiseOp::Add => Kernel::Add,
            ElementwiseOp::Sub => Kernel::Sub,
            ElementwiseOp::Multiply => Kernel::Multiply,
            ElementwiseOp::Divide => Kernel::Divide,
        }
    }
}

impl From<ScalarOp> for Kernel {
    fn from(op: ScalarOp) -> Self {
        match op {
            ScalarOp::Multiply => Kernel::Scale,
            ScalarOp::Divide => Kernel::DivideScalar,
            ScalarOp::Pow => Kernel::Power,
        }
    }
}

impl From<Activation> for Kernel {
    fn from(op: Activation) -> Self {
        match op {
            Activation::Sigmoid => Kernel::Sigmoid,
            Activation::SigmoidPrime => Kernel::SigmoidPrime,
        }
    }
}

impl From<Transpose> for Kernel {
    fn from(mode: Transpose) -> Self {
        match mode {
            Transpose::None => Kernel::Dot,
            Transpose::A => Kernel::DotTransposeA,
            Transpose::B => Kernel::DotTransposeB,
        }
    }
}

/// GPU context holding the device, the queue and the compiled kernels
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    limits: wgpu::Limits,
    pipelines: HashMap<Kernel, wgpu::ComputePipeline>,
}

/// Whether any adapter is present on this machine
pub fn is_gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default())).is_some()
}

impl GpuContext {
    /// Acquire the first high-performance adapter and compile every kernel
    pub async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| NeuralError::Device("no suitable GPU adapter found".to_string()))?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Matrix Engine"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| NeuralError::Device(format!("failed to create device: {e}")))?;

        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "acquired GPU device"
        );

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipelines = Self::create_pipelines(&device);
        if let Some(e) = device.pop_error_scope().await {
            return Err(NeuralError::Device(format!("kernel compilation failed: {e}")));
        }

        // Past this point a device error means results can no longer be trusted
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            error!(error = %e, "uncaptured GPU error, aborting");
            std::process::abort();
        }));

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
            limits,
            pipelines,
        })
    }

    /// Blocking version of [`GpuContext::new_async`]
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn create_pipelines(device: &wgpu::Device) -> HashMap<Kernel, wgpu::ComputePipeline> {
        let module = |label: &str, source: &'static str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        };
        let elementwise = module("Elementwise Shader", include_str!("shaders/elementwise.wgsl"));
        let matmul = module("Matrix Multiply Shader", include_str!("shaders/matmul.wgsl"));
        let unary = module("Unary Shader", include_str!("shaders/unary.wgsl"));
        let reduce = module("Reduction Shader", include_str!("shaders/reduce.wgsl"));

        let binary_layout = Self::create_pipeline_layout(device, LayoutKind::Binary);
        let unary_layout = Self::create_pipeline_layout(device, LayoutKind::Unary);

        Kernel::ALL
            .iter()
            .map(|&kernel| {
                let shader = match kernel.shader() {
                    Shader::Elementwise => &elementwise,
                    Shader::Matmul => &matmul,
                    Shader::Unary => &unary,
                    Shader::Reduce => &reduce,
                };
                let layout = match kernel.layout() {
                    LayoutKind::Binary => &binary_layout,
                    LayoutKind::Unary => &unary_layout,
                };
                debug!(entry_point = kernel.entry_point(), "compiling kernel");
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kernel.entry_point()),
                    layout: Some(layout),
                    module: shader,
                    entry_point: Some(kernel.entry_point()),
                    compilation_options: Default::default(),
                    cache: None,
                });
                (kernel, pipeline)
            })
            .collect()
    }

    /// Binding 0 is the uniform, the last binding is the writable output and
    /// everything in between is a read-only input.
    fn create_pipeline_layout(device: &wgpu::Device, kind: LayoutKind) -> wgpu::PipelineLayout {
        let inputs = match kind {
            LayoutKind::Binary => 2,
            LayoutKind::Unary => 1,
        };

        let buffer_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let mut entries = vec![buffer_entry(0, wgpu::BufferBindingType::Uniform)];
        for binding in 1..=inputs {
            entries.push(buffer_entry(
                binding,
                wgpu::BufferBindingType::Storage { read_only: true },
            ));
        }
        entries.push(buffer_entry(
            inputs + 1,
            wgpu::BufferBindingType::Storage { read_only: false },
        ));

        let (label, layout_label) = match kind {
            LayoutKind::Binary => ("Binary Bind Group Layout", "Binary Pipeline Layout"),
            LayoutKind::Unary => ("Unary Bind Group Layout", "Unary Pipeline Layout"),
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });

        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(layout_label),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        })
    }

    /// Encode and submit one kernel. `buffers` are bound from binding 1 in order.
    fn dispatch(
        &self,
        kernel: Kernel,
        params: KernelParams,
        buffers: &[&wgpu::Buffer],
        workgroups: (u32, u32),
    ) -> Result<()> {
        use wgpu::util::DeviceExt;

        let pipeline = self
            .pipelines
            .get(&kernel)
            .ok_or_else(|| NeuralError::Device(format!("kernel {kernel:?} was not compiled")))?;

        let params_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kernel Params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params_buffer.as_entire_binding(),
        }];
        for (binding, buffer) in (1u32..).zip(buffers) {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            });
        }

        let bind_group_layout = pipeline.get_bind_group_layout(0);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.entry_point()),
            layout: &bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel.entry_point()),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, &bind_group, &[]);
            cpass.dispatch_workgroups(workgroups.0, workgroups.1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Spread `len` items over workgroups of `group_size`, folding into a
    /// second dimension when the first would exceed the dispatch limit.
    fn linear_grid(len: usize, group_size: usize) -> Result<(u32, u32)> {
        let groups = len.div_ceil(group_size).max(1);
        let x = groups.min(MAX_WORKGROUPS_PER_DIMENSION);
        let y = groups.div_ceil(x);
        if y > MAX_WORKGROUPS_PER_DIMENSION {
            return Err(NeuralError::Device(format!(
                "{len} elements exceed the dispatch grid"
            )));
        }
        Ok((x as u32, y as u32))
    }

    fn block_grid(rows: usize, cols: usize) -> Result<(u32, u32)> {
        let x = rows.div_ceil(BLOCK);
        let y = cols.div_ceil(BLOCK);
        if x > MAX_WORKGROUPS_PER_DIMENSION || y > MAX_WORKGROUPS_PER_DIMENSION {
            return Err(NeuralError::Device(format!(
                "a {rows}x{cols} output exceeds the dispatch grid"
            )));
        }
        Ok((x as u32, y as u32))
    }

    fn to_u32(value: usize) -> Result<u32> {
        u32::try_from(value)
            .map_err(|_| NeuralError::Device(format!("dimension {value} does not fit in u32")))
    }

    fn linear_params(len: usize, scalar: f32) -> Result<KernelParams> {
        Ok(KernelParams {
            m: Self::to_u32(len)?,
            scalar,
            ..Default::default()
        })
    }

    fn check_capacity(&self, len: usize) -> Result<()> {
        let bytes = byte_len(len);
        let binding_limit = u64::from(self.limits.max_storage_buffer_binding_size);
        if bytes > binding_limit || bytes > self.limits.max_buffer_size {
            return Err(NeuralError::Device(format!(
                "{len} floats exceed the device's storage buffer limit of {binding_limit} bytes"
            )));
        }
        Ok(())
    }
}

impl Backend for GpuContext {
    type Buffer = GpuBuffer;

    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn alloc(&self, len: usize) -> Result<Self::Buffer> {
        self.check_capacity(len)?;
        Ok(GpuBuffer::new(&self.device, len, "Matrix"))
    }

    fn upload(&self, host: &[f32]) -> Result<Self::Buffer> {
        self.check_capacity(host.len())?;
        Ok(GpuBuffer::from_data(&self.device, host, "Matrix"))
    }

    fn download(&self, buf: &Self::Buffer, out: &mut [f32]) -> Result<()> {
        if out.len() > buf.len() {
            return Err(NeuralError::Device(format!(
                "download of {} floats from a buffer of {}",
                out.len(),
                buf.len()
            )));
        }
        read_buffer_into_sync(&self.device, &self.queue, buf.buffer(), out)
    }

    fn write(&self, buf: &mut Self::Buffer, host: &[f32]) -> Result<()> {
        buf.write(&self.queue, host)
    }

    fn copy(&self, src: &Self::Buffer, dst: &mut Self::Buffer, len: usize) -> Result<()> {
        if src.len() < len || dst.len() < len {
            return Err(NeuralError::Device(format!("copy of {len} floats out of bounds")));
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Copy Encoder"),
        });
        encoder.copy_buffer_to_buffer(src.buffer(), 0, dst.buffer(), 0, byte_len(len));
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn elementwise(
        &self,
        op: ElementwiseOp,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()> {
        self.dispatch(
            op.into(),
            Self::linear_params(len, 0.0)?,
            &[a.buffer(), b.buffer(), out.buffer()],
            Self::linear_grid(len, LINEAR_WORKGROUP)?,
        )
    }

    fn scalar(
        &self,
        op: ScalarOp,
        a: &Self::Buffer,
        scalar: f32,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()> {
        self.dispatch(
            op.into(),
            Self::linear_params(len, scalar)?,
            &[a.buffer(), out.buffer()],
            Self::linear_grid(len, LINEAR_WORKGROUP)?,
        )
    }

    fn activation(
        &self,
        op: Activation,
        a: &Self::Buffer,
        out: &mut Self::Buffer,
        len: usize,
    ) -> Result<()> {
        self.dispatch(
            op.into(),
            Self::linear_params(len, 0.0)?,
            &[a.buffer(), out.buffer()],
            Self::linear_grid(len, LINEAR_WORKGROUP)?,
        )
    }

    fn gemm(
        &self,
        mode: Transpose,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &mut Self::Buffer,
        dims: GemmDims,
    ) -> Result<()> {
        let params = KernelParams {
            m: Self::to_u32(dims.m)?,
            k: Self::to_u32(dims.k)?,
            n: Self::to_u32(dims.n)?,
            scalar: 0.0,
        };
        self.dispatch(
            mode.into(),
            params,
            &[a.buffer(), b.buffer(), out.buffer()],
            Self::block_grid(dims.m, dims.n)?,
        )
    }

    fn transpose(
        &self,
        a: &Self::Buffer,
        out: &mut Self::Buffer,
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        let params = KernelParams {
            m: Self::to_u32(rows)?,
            k: Self::to_u32(cols)?,
            ..Default::default()
        };
        self.dispatch(
            Kernel::Transpose,
            params,
            &[a.buffer(), out.buffer()],
            Self::block_grid(rows, cols)?,
        )
    }

    fn axpy(&self, alpha: f32, x: &Self::Buffer, y: &mut Self::Buffer, len: usize) -> Result<()> {
        self.dispatch(
            Kernel::Axpy,
            Self::linear_params(len, alpha)?,
            &[x.buffer(), y.buffer()],
            Self::linear_grid(len, LINEAR_WORKGROUP)?,
        )
    }

    fn sum(&self, a: &Self::Buffer, len: usize) -> Result<f32> {
        // Fold 256 values per workgroup until a single partial remains
        let mut remaining = len;
        let mut partials: Option<GpuBuffer> = None;
        loop {
            let groups = remaining.div_ceil(REDUCE_WORKGROUP).max(1);
            let next = GpuBuffer::new(&self.device, groups, "Reduction Partials");
            let source = partials.as_ref().unwrap_or(a);
            let params = KernelParams {
                m: Self::to_u32(remaining)?,
                k: Self::to_u32(groups)?,
                ..Default::default()
            };
            self.dispatch(
                Kernel::ReduceSum,
                params,
                &[source.buffer(), next.buffer()],
                Self::linear_grid(remaining, REDUCE_WORKGROUP)?,
            )?;
            partials = Some(next);
            remaining = groups;
            if groups == 1 {
                break;
            }
        }

        let mut total = [0.0f32];
        let result = partials
            .as_ref()
            .ok_or_else(|| NeuralError::Device("reduction produced no output".to_string()))?;
        read_buffer_into_sync(&self.device, &self.queue, result.buffer(), &mut total)?;
        Ok(total[0])
    }
}

use std::borrow::Cow;

use tracing::{debug, debug_span, info};
use wgpu::{util::DeviceExt, Device, Queue};

use crate::config::{KdeConfig, DEFAULT_GROUP_WIDTH};
use crate::error::{KdeError, Result};
use crate::kernel::scale_factor;

const SHADER_TEMPLATE: &str = include_str!("kde.wgsl");

/// Entry points run in order for every lane.
const STAGES: [&str; 2] = ["reduce_tiles", "sum_partials"];

/// Workgroup width of the `sum_partials` stage.
const SUM_WIDTH: u32 = 64;

/// Per-lane launch parameters, laid out as the shader's `Params` uniform.
#[derive(Debug, Copy, Clone, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct Params {
    n: u32,
    query_offset: u32,
    groups_per_query: u32,
    bandwidth: f32,
    scale: f32,
    query_end: u32,
    _pad: [u32; 2],
}

/// Dispatch shape of one batch, checked against the device limits before
/// anything is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LaunchGeometry {
    groups_per_query: u32,
    /// Most queries one lane may cover.
    lane_width: u32,
    partials_len: u64,
}

fn launch_geometry(
    sample_len: usize,
    query_len: usize,
    group_width: u32,
    limits: &wgpu::Limits,
) -> Result<LaunchGeometry> {
    let binding_limit =
        (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
    let max_groups = limits.max_compute_workgroups_per_dimension;

    let groups_per_query = (sample_len as u64).div_ceil(group_width as u64);
    if groups_per_query > max_groups as u64 {
        return Err(KdeError::LaunchConfigTooLarge {
            groups: groups_per_query,
            limit: max_groups,
        });
    }
    let partials_len = groups_per_query * query_len as u64;
    for len in [sample_len as u64, query_len as u64, partials_len] {
        let required = len * std::mem::size_of::<f32>() as u64;
        if required > binding_limit {
            return Err(KdeError::OutOfMemory {
                required,
                limit: binding_limit,
            });
        }
    }

    Ok(LaunchGeometry {
        groups_per_query: groups_per_query as u32,
        lane_width: max_groups,
        partials_len,
    })
}

/// A GPU device with the KDE reduction pipelines compiled for one workgroup
/// width.
///
/// Estimates take `&mut self`: each batch brackets its work in error scopes
/// on the device, and overlapping batches would see each other's errors.
pub struct GpuKdeAsync {
    device: Device,
    queue: Queue,
    stages: [wgpu::ComputePipeline; 2],
    bindgroup_layout: wgpu::BindGroupLayout,
    group_width: u32,
}

impl GpuKdeAsync {
    pub async fn new() -> Result<Self> {
        Self::with_group_width(DEFAULT_GROUP_WIDTH).await
    }

    pub async fn with_config(config: &KdeConfig) -> Result<Self> {
        config.validate()?;
        Self::with_group_width(config.group_width).await
    }

    pub async fn with_group_width(group_width: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(KdeError::AdapterUnavailable)?;

        let limits = adapter.limits();
        let max_width = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x);
        if group_width == 0 || group_width > max_width {
            return Err(KdeError::InvalidConfig(format!(
                "group_width {group_width} outside 1..={max_width} for this adapter"
            )));
        }

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sgpu-kde device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                },
                None,
            )
            .await?;
        let info = adapter.get_info();
        info!(adapter = %info.name, backend = ?info.backend, group_width, "acquired GPU device");

        let bindgroup_layout_items = [
            wgpu::BufferBindingType::Uniform,
            wgpu::BufferBindingType::Storage { read_only: true },
            wgpu::BufferBindingType::Storage { read_only: true },
            wgpu::BufferBindingType::Storage { read_only: false },
            wgpu::BufferBindingType::Storage { read_only: false },
        ]
        .into_iter()
        .enumerate()
        .map(|(i, ty)| wgpu::BindGroupLayoutEntry {
            binding: i as _,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect::<Vec<_>>();

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bindgroup_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &bindgroup_layout_items,
            label: Some("KDE bind group layout"),
        });
        let source = SHADER_TEMPLATE.replace("$WIDTH", &group_width.to_string());
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("KDE reduction shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("KDE pipeline layout"),
            bind_group_layouts: &[&bindgroup_layout],
            push_constant_ranges: &[],
        });
        let stages = STAGES.map(|entry_point| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point,
            })
        });
        if let Some(err) = device.pop_error_scope().await {
            return Err(KdeError::Launch(err.to_string()));
        }

        Ok(Self {
            device,
            queue,
            stages,
            bindgroup_layout,
            group_width,
        })
    }

    pub fn group_width(&self) -> u32 {
        self.group_width
    }

    /// Density of `x` at each of its own points.
    pub async fn estimate(&mut self, x: &[f32], h: f32) -> Result<Vec<f32>> {
        self.estimate_at(x, x, h).await
    }

    /// Evaluates the density of `sample` at every point of `queries`.
    ///
    /// Each query is split over `ceil(n / group_width)` workgroups. Every
    /// workgroup tree-reduces its tile of kernel values into one partial sum;
    /// a second stage adds a query's partials, scales them by `1/(n·h)` and
    /// accumulates the result into its density slot. Queries are dispatched
    /// in lanes no larger than the device's per-dimension workgroup limit,
    /// all recorded into one submission and awaited once.
    pub async fn estimate_at(&mut self, sample: &[f32], queries: &[f32], h: f32) -> Result<Vec<f32>> {
        crate::check_sample(sample, h)?;
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let geometry = launch_geometry(
            sample.len(),
            queries.len(),
            self.group_width,
            &self.device.limits(),
        )?;
        let n = sample.len() as u32;
        let n_queries = queries.len() as u32;
        let output_size = (queries.len() * std::mem::size_of::<f32>()) as u64;

        let _span = debug_span!("gpu_kde", n, queries = n_queries).entered();

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let sample_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Sample buffer"),
            contents: bytemuck::cast_slice(sample),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let query_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Query buffer"),
            contents: bytemuck::cast_slice(queries),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let partials = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Partials buffer"),
            size: geometry.partials_len * std::mem::size_of::<f32>() as u64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        // Buffers are zero-initialised on creation.
        let density = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Density buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("KDE batch"),
            });
        let mut lanes = 0usize;
        for query_offset in (0..n_queries).step_by(geometry.lane_width as usize) {
            let lane_len = (n_queries - query_offset).min(geometry.lane_width);
            let params = Params {
                n,
                query_offset,
                groups_per_query: geometry.groups_per_query,
                bandwidth: h,
                scale: scale_factor(sample.len(), h),
                query_end: query_offset + lane_len,
                _pad: [0; 2],
            };
            let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Lane uniform buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bindgroup = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                layout: &self.bindgroup_layout,
                entries: &[
                    uniform.as_entire_binding(),
                    sample_buffer.as_entire_binding(),
                    query_buffer.as_entire_binding(),
                    partials.as_entire_binding(),
                    density.as_entire_binding(),
                ]
                .into_iter()
                .enumerate()
                .map(|(i, resource)| wgpu::BindGroupEntry {
                    binding: i as _,
                    resource,
                })
                .collect::<Vec<_>>(),
                label: Some("Lane bind group"),
            });

            let workgroups = [
                (geometry.groups_per_query, lane_len, 1),
                (lane_len.div_ceil(SUM_WIDTH), 1, 1),
            ];
            for (i, (stage, (x, y, z))) in self.stages.iter().zip(workgroups).enumerate() {
                let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(STAGES[i]),
                    timestamp_writes: None,
                });
                cpass.set_pipeline(stage);
                cpass.set_bind_group(0, &bindgroup, &[]);
                cpass.insert_debug_marker(&format!("sgpu-kde-lane-{}-{}", lanes, STAGES[i]));
                cpass.dispatch_workgroups(x, y, z);
            }
            lanes += 1;
        }
        debug!(
            lanes,
            groups_per_query = geometry.groups_per_query,
            group_width = self.group_width,
            "dispatching"
        );

        encoder.copy_buffer_to_buffer(&density, 0, &staging, 0, output_size);
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = flume::bounded(1);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);

        let validation = self.device.pop_error_scope().await;
        let out_of_memory = self.device.pop_error_scope().await;
        if let Some(err) = out_of_memory {
            return Err(KdeError::Allocation(err.to_string()));
        }
        if let Some(err) = validation {
            return Err(KdeError::Launch(err.to_string()));
        }
        receiver
            .recv_async()
            .await
            .map_err(|_| KdeError::ChannelClosed)??;

        sample_buffer.destroy();
        query_buffer.destroy();
        partials.destroy();

        let y = {
            let mapped = staging.slice(..).get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
        };
        staging.unmap();
        Ok(y)
    }
}

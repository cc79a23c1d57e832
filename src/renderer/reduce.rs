use {
    crate::renderer::{Context, Extent2d},
    bytemuck::{Pod, Zeroable},
    std::num::NonZeroU64,
};

/// Texels covered by one `reduce_tile` workgroup along each axis.
const TILE_DIM: u32 = 16;

/// Uniform offsets must satisfy `min_uniform_buffer_offset_alignment`.
const PARAM_STRIDE: u64 = 256;

/// Byte size of one result or partial slot (`vec4<u32>`).
const RESULT_SLOT_SIZE: u64 = 16;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct ReduceParams {
    partial_count: u32,
    slot: u32,
    _pad: [u32; 2],
}

unsafe impl Zeroable for ReduceParams {}
unsafe impl Pod for ReduceParams {}

/// Parallel sum reduction of an `R32Uint` texture into a small result
/// buffer on the GPU.
///
/// Two dispatches per reduction: `reduce_tile` folds each 16×16 tile of
/// texels into one partial sum, `reduce_final` folds the partials into a
/// single `vec4<u32>` written to the requested slot of the result buffer.
/// The result buffer is caller-owned and needs `STORAGE | COPY_SRC` usage;
/// slot layout is `vec4<u32>` per slot, sums in `.x`.
pub struct GpuReduction {
    tile_pipeline: wgpu::ComputePipeline,
    final_pipeline: wgpu::ComputePipeline,
    tile_layout: wgpu::BindGroupLayout,
    final_layout: wgpu::BindGroupLayout,
    partials: wgpu::Buffer,
    partial_capacity: u32,
    params: wgpu::Buffer,
    max_slots: u32,
}

impl GpuReduction {
    pub fn new(device: &wgpu::Device, max_slots: u32) -> Self {
        assert!(max_slots > 0);

        let tile_module =
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("reduce-tile"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("reduce/reduce_tile.wgsl").into(),
                ),
            });

        let final_module =
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("reduce-final"),
                source: wgpu::ShaderSource::Wgsl(
                    include_str!("reduce/reduce_final.wgsl").into(),
                ),
            });

        let tile_layout = device.create_bind_group_layout(
            &wgpu::BindGroupLayoutDescriptor {
                label: Some("reduce-tile-layout"),
                entries: &[
                    // Source texture.
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Uint,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    // Per-workgroup partial sums.
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage {
                                read_only: false,
                            },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            },
        );

        let final_layout = device.create_bind_group_layout(
            &wgpu::BindGroupLayoutDescriptor {
                label: Some("reduce-final-layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage {
                                read_only: true,
                            },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage {
                                read_only: false,
                            },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: NonZeroU64::new(
                                PARAMS_BINDING_SIZE,
                            ),
                        },
                        count: None,
                    },
                ],
            },
        );

        let tile_pipeline_layout = device.create_pipeline_layout(
            &wgpu::PipelineLayoutDescriptor {
                label: Some("reduce-tile-pipeline-layout"),
                bind_group_layouts: &[&tile_layout],
                push_constant_ranges: &[],
            },
        );

        let final_pipeline_layout = device.create_pipeline_layout(
            &wgpu::PipelineLayoutDescriptor {
                label: Some("reduce-final-pipeline-layout"),
                bind_group_layouts: &[&final_layout],
                push_constant_ranges: &[],
            },
        );

        let tile_pipeline = device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some("reduce-tile"),
                layout: Some(&tile_pipeline_layout),
                module: &tile_module,
                entry_point: "reduce_tile",
                compilation_options: Default::default(),
                cache: None,
            },
        );

        let final_pipeline = device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some("reduce-final"),
                layout: Some(&final_pipeline_layout),
                module: &final_module,
                entry_point: "reduce_final",
                compilation_options: Default::default(),
                cache: None,
            },
        );

        tracing::trace!("Reduction pipelines created");

        let partial_capacity = 1;
        let partials = create_partials(device, partial_capacity);

        let params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("reduce-params"),
            size: u64::from(max_slots) * PARAM_STRIDE,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        GpuReduction {
            tile_pipeline,
            final_pipeline,
            tile_layout,
            final_layout,
            partials,
            partial_capacity,
            params,
            max_slots,
        }
    }

    /// Record a sum of all texels of `src` into `result` at `slot`.
    ///
    /// Both dispatches are recorded into `encoder`; the sum is available
    /// once the encoder's command buffer completes on the queue.
    pub fn sum_u32(
        &mut self,
        ctx: &Context,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::TextureView,
        src_dim: Extent2d,
        result: &wgpu::Buffer,
        slot: u32,
    ) {
        assert!(slot < self.max_slots);

        let (tiles_x, tiles_y) = workgroup_count(src_dim);
        let partial_count = tiles_x * tiles_y;
        self.ensure_partials(&ctx.device, partial_count);

        ctx.queue.write_buffer(
            &self.params,
            u64::from(slot) * PARAM_STRIDE,
            bytemuck::bytes_of(&ReduceParams {
                partial_count,
                slot,
                _pad: [0; 2],
            }),
        );

        let tile_group =
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("reduce-tile-group"),
                layout: &self.tile_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(src),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.partials.as_entire_binding(),
                    },
                ],
            });

        let final_group =
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("reduce-final-group"),
                layout: &self.final_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.partials.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: result.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::Buffer(
                            wgpu::BufferBinding {
                                buffer: &self.params,
                                offset: u64::from(slot) * PARAM_STRIDE,
                                size: NonZeroU64::new(PARAMS_BINDING_SIZE),
                            },
                        ),
                    },
                ],
            });

        let mut pass =
            encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("reduce"),
                ..Default::default()
            });

        pass.set_pipeline(&self.tile_pipeline);
        pass.set_bind_group(0, &tile_group, &[]);
        pass.dispatch_workgroups(tiles_x, tiles_y, 1);

        pass.set_pipeline(&self.final_pipeline);
        pass.set_bind_group(0, &final_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }

    fn ensure_partials(&mut self, device: &wgpu::Device, count: u32) {
        if count > self.partial_capacity {
            tracing::trace!(
                "Growing partials buffer to {} entries",
                count
            );
            self.partials = create_partials(device, count);
            self.partial_capacity = count;
        }
    }
}

/// `ReduceParams` occupies 16 bytes of each 256-byte params entry.
const PARAMS_BINDING_SIZE: u64 = 16;

fn create_partials(device: &wgpu::Device, count: u32) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("reduce-partials"),
        size: u64::from(count) * RESULT_SLOT_SIZE,
        usage: wgpu::BufferUsages::STORAGE,
        mapped_at_creation: false,
    })
}

fn workgroup_count(extent: Extent2d) -> (u32, u32) {
    (
        (extent.width + TILE_DIM - 1) / TILE_DIM,
        (extent.height + TILE_DIM - 1) / TILE_DIM,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_count_covers_every_texel() {
        assert_eq!(workgroup_count(Extent2d::from((256, 256))), (16, 16));
        assert_eq!(workgroup_count(Extent2d::from((1920, 1080))), (120, 68));
        // One short row and column still get a workgroup.
        assert_eq!(workgroup_count(Extent2d::from((17, 1))), (2, 1));
    }

    #[test]
    fn result_slots_match_shader_layout() {
        // One vec4<u32> per slot, as reduce_final.wgsl indexes them.
        assert_eq!(RESULT_SLOT_SIZE, 16);
        assert_eq!(std::mem::size_of::<ReduceParams>() as u64, PARAMS_BINDING_SIZE);
    }

    #[test]
    fn param_entries_are_offset_aligned() {
        // Uniform buffer offsets must be 256-byte aligned on default limits.
        assert_eq!(PARAM_STRIDE % 256, 0);
        assert!(PARAMS_BINDING_SIZE <= PARAM_STRIDE);
    }
}

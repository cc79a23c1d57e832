use {
    crate::{
        config::StatsConfig,
        ray_rate::RayRateCounter,
        renderer::{reduce::GpuReduction, Context, Error, Extent2d},
    },
    bytemuck::{Pod, Zeroable},
    std::{
        collections::HashMap,
        sync::mpsc::{channel, Receiver},
        time::{Duration, Instant},
    },
};

/// Bind group index the [`STATS_WGSL`] snippet declares its counters in.
pub const STATS_BIND_GROUP: u32 = 3;

/// WGSL snippet the host appends to its trace kernel when collecting
/// stats: the two counter bindings and the per-pixel store helper.
pub const STATS_WGSL: &str = include_str!("stats/stats.wgsl");

const RAY_COUNT_SLOT: u32 = 0;
const PATH_LENGTH_SLOT: u32 = 1;
const RESULT_SLOT_COUNT: u32 = 2;

/// Two `vec4<u32>` result slots.
const RESULT_SIZE: u64 = 32;

/// Per-frame traversal statistics of a completed trace dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TraceStatsData {
    pub total_rays: u64,
    pub avg_rays_per_pixel: f32,
    pub avg_path_length: f32,
}

impl TraceStatsData {
    fn from_sums(ray_count: u32, path_length: u32, pixels: u64) -> Self {
        TraceStatsData {
            total_rays: u64::from(ray_count),
            avg_rays_per_pixel: ray_count as f32 / pixels as f32,
            avg_path_length: path_length as f32 / pixels as f32,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct RawSums {
    ray_count: [u32; 4],
    path_length: [u32; 4],
}

unsafe impl Zeroable for RawSums {}
unsafe impl Pod for RawSums {}

struct StatTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    extent: Extent2d,
}

impl StatTexture {
    fn new(ctx: &Context, extent: Extent2d, label: &str) -> Self {
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent.into_3d(),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Uint,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let view =
            texture.create_view(&wgpu::TextureViewDescriptor::default());

        StatTexture {
            texture,
            view,
            extent,
        }
    }
}

struct PendingReadback {
    slot: usize,
    frame_dim: Extent2d,
    frame_time: Option<Duration>,
    recv: Receiver<Result<(), wgpu::BufferAsyncError>>,
}

/// Collects per-pixel ray-count and path-length counters across a trace
/// dispatch and reduces them to frame totals on the GPU.
///
/// The host brackets its trace dispatch with [`begin_frame`] and
/// [`end_frame`] each frame. Readback is deferred: sums submitted at
/// `end_frame` are resolved the next time the stats are queried, so the
/// CPU never waits on the frame in flight. Displayed data is therefore
/// one frame old.
///
/// Hosts embedding their own device must request
/// `wgpu::Features::CLEAR_TEXTURE`.
///
/// [`begin_frame`]: TraceStats::begin_frame
/// [`end_frame`]: TraceStats::end_frame
pub struct TraceStats {
    enabled: bool,
    collecting: bool,
    running: bool,
    frame: u64,
    frame_dim: Extent2d,

    stats: TraceStatsData,
    stats_valid: bool,
    textures_valid: bool,

    reduction: Option<GpuReduction>,
    result: Option<wgpu::Buffer>,
    readback: Option<[wgpu::Buffer; 2]>,
    pending: Option<PendingReadback>,

    ray_count: Option<StatTexture>,
    path_length: Option<StatTexture>,

    rate: RayRateCounter,
    last_end: Option<Instant>,
}

impl TraceStats {
    pub fn new(config: &StatsConfig) -> Self {
        TraceStats {
            enabled: config.enabled,
            collecting: false,
            running: false,
            frame: 0,
            frame_dim: Extent2d::default(),
            stats: TraceStatsData::default(),
            stats_valid: false,
            textures_valid: false,
            reduction: None,
            result: None,
            readback: None,
            pending: None,
            ray_count: None,
            path_length: None,
            rate: RayRateCounter::new(config.rate_window()),
            last_end: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Takes effect at the next `begin_frame`.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Pipeline constants for the host's trace kernel. The kernel guards
    /// its counter writes on `STATS_ENABLED`.
    pub fn shader_constants(&self) -> HashMap<String, f64> {
        HashMap::from([(
            "STATS_ENABLED".to_string(),
            if self.enabled { 1.0 } else { 0.0 },
        )])
    }

    /// Layout of the counter bind group, matching [`STATS_WGSL`].
    pub fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("stats-counters-layout"),
            entries: &STATS_LAYOUT_ENTRIES,
        })
    }

    /// Counter bind group for the current frame. `None` until an enabled
    /// `begin_frame` has created the counter textures; call between
    /// `begin_frame` and the trace dispatch.
    pub fn bind_group(
        &self,
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
    ) -> Option<wgpu::BindGroup> {
        let ray = self.ray_count.as_ref()?;
        let path = self.path_length.as_ref()?;

        Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("stats-counters"),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&ray.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&path.view),
                },
            ],
        }))
    }

    /// Begin-frame setup: retire last frame's readback, invalidate stored
    /// data, and prepare cleared counter textures for the trace dispatch.
    pub fn begin_frame(&mut self, ctx: &Context, frame_dim: Extent2d) {
        assert!(!self.running, "begin_frame called twice without end_frame");
        assert!(frame_dim.pixel_count() > 0, "Zero-sized frame");

        // Retire a readback nobody consumed, keeping the buffer unmapped
        // for reuse. The config may have changed since it was submitted,
        // so the stored data is dropped below either way.
        if let Err(err) = self.resolve(ctx) {
            tracing::warn!("Dropping unresolved traversal stats: {}", err);
        }

        self.running = true;
        self.frame_dim = frame_dim;
        self.collecting = self.enabled;

        self.stats = TraceStatsData::default();
        self.stats_valid = false;
        self.textures_valid = false;

        if !self.collecting {
            return;
        }

        if self.reduction.is_none() {
            self.reduction =
                Some(GpuReduction::new(&ctx.device, RESULT_SLOT_COUNT));

            self.result = Some(ctx.device.create_buffer(
                &wgpu::BufferDescriptor {
                    label: Some("stats-result"),
                    size: RESULT_SIZE,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                },
            ));

            self.readback =
                Some([readback_buffer(ctx), readback_buffer(ctx)]);

            tracing::trace!("Reduction resources created");
        }

        let recreate = match &self.ray_count {
            Some(texture) => texture.extent != frame_dim,
            None => true,
        };

        if recreate {
            tracing::trace!(
                "Creating {}x{} counter textures",
                frame_dim.width,
                frame_dim.height
            );

            self.ray_count =
                Some(StatTexture::new(ctx, frame_dim, "stats-ray-count"));
            self.path_length =
                Some(StatTexture::new(ctx, frame_dim, "stats-path-length"));
        }

        let mut encoder = ctx.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor {
                label: Some("stats-clear"),
            },
        );

        if let (Some(ray), Some(path)) = (&self.ray_count, &self.path_length)
        {
            encoder.clear_texture(
                &ray.texture,
                &wgpu::ImageSubresourceRange::default(),
            );
            encoder.clear_texture(
                &path.texture,
                &wgpu::ImageSubresourceRange::default(),
            );
        }

        ctx.queue.submit(Some(encoder.finish()));
    }

    /// End-frame trigger: sum the per-pixel counters on the GPU and start
    /// the asynchronous copy of the sums to the CPU.
    ///
    /// Call after the trace dispatch for this frame has been submitted;
    /// queue ordering guarantees the reduction observes its writes.
    pub fn end_frame(&mut self, ctx: &Context) {
        assert!(self.running, "end_frame called without begin_frame");
        self.running = false;

        if self.collecting {
            let now = Instant::now();
            let frame_time = self.last_end.map(|prev| now - prev);
            self.last_end = Some(now);

            if let (
                Some(reduction),
                Some(result),
                Some(readback),
                Some(ray),
                Some(path),
            ) = (
                self.reduction.as_mut(),
                self.result.as_ref(),
                self.readback.as_ref(),
                self.ray_count.as_ref(),
                self.path_length.as_ref(),
            ) {
                let mut encoder = ctx.device.create_command_encoder(
                    &wgpu::CommandEncoderDescriptor {
                        label: Some("stats-reduce"),
                    },
                );

                reduction.sum_u32(
                    ctx,
                    &mut encoder,
                    &ray.view,
                    self.frame_dim,
                    result,
                    RAY_COUNT_SLOT,
                );
                reduction.sum_u32(
                    ctx,
                    &mut encoder,
                    &path.view,
                    self.frame_dim,
                    result,
                    PATH_LENGTH_SLOT,
                );

                // Alternate readback targets by frame parity so resolving
                // one never races the copy into the other.
                let slot = (self.frame % 2) as usize;
                encoder.copy_buffer_to_buffer(
                    result,
                    0,
                    &readback[slot],
                    0,
                    RESULT_SIZE,
                );

                ctx.queue.submit(Some(encoder.finish()));

                let (send, recv) = channel();
                readback[slot].slice(..).map_async(
                    wgpu::MapMode::Read,
                    move |status| {
                        let _ = send.send(status);
                    },
                );

                self.pending = Some(PendingReadback {
                    slot,
                    frame_dim: self.frame_dim,
                    frame_time,
                    recv,
                });
                self.textures_valid = true;
            }
        }

        self.frame += 1;
    }

    /// Last completed frame's stats, or `None` when no frame has been
    /// collected yet.
    pub fn data(&mut self, ctx: &Context) -> Option<TraceStatsData> {
        if let Err(err) = self.resolve(ctx) {
            tracing::warn!("Failed to read back traversal stats: {}", err);
            return None;
        }

        if !self.stats_valid {
            tracing::warn!("Traversal stats are not ready. Ignoring.");
            return None;
        }

        Some(self.stats)
    }

    /// Last completed frame's per-pixel ray-count texture, for debug
    /// views and heatmap passes.
    pub fn ray_count_texture(&self) -> Option<&wgpu::Texture> {
        assert!(!self.running);

        if self.textures_valid {
            self.ray_count.as_ref().map(|stat| &stat.texture)
        } else {
            None
        }
    }

    /// Rolling average of rays traced per second.
    pub fn ray_rate(&self) -> f64 {
        self.rate.rays_per_second()
    }

    #[cfg(feature = "ui")]
    pub fn ui(&mut self, ctx: &Context, ui: &mut egui::Ui) {
        assert!(!self.running);

        ui.checkbox(&mut self.enabled, "Traversal stats").on_hover_text(
            "Collects ray tracing traversal stats on the GPU.\n\
             Note that this option slows down the performance.",
        );

        if let Err(err) = self.resolve(ctx) {
            tracing::warn!("Failed to read back traversal stats: {}", err);
        }

        if self.stats_valid {
            ui.label(format!(
                "Path length (avg): {:.3}",
                self.stats.avg_path_length
            ));
            ui.label(format!(
                "Traced rays (avg): {:.3}",
                self.stats.avg_rays_per_pixel
            ));
            ui.label(format!(
                "Traced rays (total): {}",
                self.stats.total_rays
            ));
            ui.label(format!(
                "Ray rate: {:.2} Mray/s",
                self.rate.rays_per_second() / 1e6
            ));
        }
    }

    /// Block on the pending readback, if any, and store the sums.
    ///
    /// The map was requested at least one frame boundary ago, so by the
    /// time anyone queries the data the wait returns immediately.
    fn resolve(&mut self, ctx: &Context) -> Result<(), Error> {
        assert!(!self.running);

        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };

        let _ = ctx.device.poll(wgpu::Maintain::Wait);

        let status = pending.recv.recv().map_err(|_| Error::ReadbackLost)?;
        status?;

        let readback = self.readback.as_ref().ok_or(Error::ReadbackLost)?;
        let buffer = &readback[pending.slot];

        let sums = {
            let view = buffer.slice(..).get_mapped_range();
            bytemuck::pod_read_unaligned::<RawSums>(&view)
        };
        buffer.unmap();

        let pixels = pending.frame_dim.pixel_count();
        debug_assert!(pixels > 0);

        self.stats = TraceStatsData::from_sums(
            sums.ray_count[0],
            sums.path_length[0],
            pixels,
        );
        self.stats_valid = true;

        if let Some(frame_time) = pending.frame_time {
            self.rate.add_sample(self.stats.total_rays, frame_time);
        }

        Ok(())
    }
}

const STATS_LAYOUT_ENTRIES: [wgpu::BindGroupLayoutEntry; 2] = [
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Uint,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    },
    wgpu::BindGroupLayoutEntry {
        binding: 1,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Uint,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    },
];

fn readback_buffer(ctx: &Context) -> wgpu::Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("stats-readback"),
        size: RESULT_SIZE,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_from_sums() {
        let data = TraceStatsData::from_sums(1200, 600, 100);
        assert_eq!(data.total_rays, 1200);
        assert!((data.avg_rays_per_pixel - 12.0).abs() < 1e-6);
        assert!((data.avg_path_length - 6.0).abs() < 1e-6);
    }

    #[test]
    fn empty_counters_average_to_zero() {
        let data = TraceStatsData::from_sums(0, 0, 1920 * 1080);
        assert_eq!(data.total_rays, 0);
        assert_eq!(data.avg_rays_per_pixel, 0.0);
        assert_eq!(data.avg_path_length, 0.0);
    }

    #[test]
    fn shader_constants_follow_toggle() {
        let mut stats = TraceStats::new(&StatsConfig::default());
        assert_eq!(stats.shader_constants()["STATS_ENABLED"], 0.0);

        stats.set_enabled(true);
        assert_eq!(stats.shader_constants()["STATS_ENABLED"], 1.0);
    }

    #[test]
    fn raw_sums_match_result_buffer() {
        assert_eq!(std::mem::size_of::<RawSums>() as u64, RESULT_SIZE);
    }

    #[test]
    fn snippet_declares_counter_bindings() {
        assert!(STATS_WGSL.contains("stats_ray_count"));
        assert!(STATS_WGSL.contains("stats_path_length"));
        assert!(STATS_WGSL.contains("STATS_ENABLED"));
    }
}

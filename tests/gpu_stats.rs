// End-to-end exercise of the stats collector against a real device. A
// small compute kernel stands in for the host's trace dispatch, writing a
// known count to every pixel through the published bind group.
//
// Run with: cargo test -- --include-ignored

use {
    raymetrics::{
        config::StatsConfig,
        renderer::{Context, Extent2d, TraceStats},
    },
    std::collections::HashMap,
};

const WRITER: &str = r#"
override STATS_ENABLED: u32 = 0u;
override RAYS: u32 = 0u;
override PATH: u32 = 0u;

@group(0) @binding(0) var stats_ray_count: texture_storage_2d<r32uint, write>;
@group(0) @binding(1) var stats_path_length: texture_storage_2d<r32uint, write>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let dim = textureDimensions(stats_ray_count);
    if (gid.x < dim.x && gid.y < dim.y && STATS_ENABLED != 0u) {
        textureStore(stats_ray_count, gid.xy, vec4<u32>(RAYS, 0u, 0u, 0u));
        textureStore(stats_path_length, gid.xy, vec4<u32>(PATH, 0u, 0u, 0u));
    }
}
"#;

fn gpu_context() -> Context {
    // Surfaces the collector's tracing output under --nocapture.
    let _ = tracing_subscriber::fmt::try_init();
    Context::headless().expect("GPU context")
}

fn trace_dispatch(
    ctx: &Context,
    stats: &TraceStats,
    dim: Extent2d,
    rays: u32,
    path: u32,
) {
    let layout = TraceStats::bind_group_layout(&ctx.device);
    let bind_group = stats
        .bind_group(&ctx.device, &layout)
        .expect("counter textures exist after an enabled begin_frame");

    let module =
        ctx.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("test-writer"),
                source: wgpu::ShaderSource::Wgsl(WRITER.into()),
            });

    let pipeline_layout =
        ctx.device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("test-writer-layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

    let mut constants: HashMap<String, f64> = stats.shader_constants();
    constants.insert("RAYS".to_string(), f64::from(rays));
    constants.insert("PATH".to_string(), f64::from(path));

    let pipeline = ctx.device.create_compute_pipeline(
        &wgpu::ComputePipelineDescriptor {
            label: Some("test-writer"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        },
    );

    let mut encoder = ctx.device.create_command_encoder(
        &wgpu::CommandEncoderDescriptor {
            label: Some("test-trace"),
        },
    );
    {
        let mut pass =
            encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("test-trace"),
                ..Default::default()
            });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups((dim.width + 7) / 8, (dim.height + 7) / 8, 1);
    }
    ctx.queue.submit(Some(encoder.finish()));
}

#[test]
#[ignore = "requires a GPU"]
fn collects_known_sums() {
    let ctx = gpu_context();

    let mut stats = TraceStats::new(&StatsConfig {
        enabled: true,
        ..Default::default()
    });

    // Dimensions off the tile grid exercise the partially filled edge
    // workgroups of the reduction.
    let dim = Extent2d::from((68, 41));

    stats.begin_frame(&ctx, dim);
    trace_dispatch(&ctx, &stats, dim, 2, 3);
    stats.end_frame(&ctx);

    let data = stats.data(&ctx).expect("stats after a completed frame");
    assert_eq!(data.total_rays, dim.pixel_count() * 2);
    assert!((data.avg_rays_per_pixel - 2.0).abs() < 1e-5);
    assert!((data.avg_path_length - 3.0).abs() < 1e-5);

    assert!(stats.ray_count_texture().is_some());
}

#[test]
#[ignore = "requires a GPU"]
fn alternating_frames_resolve_independently() {
    let ctx = gpu_context();

    let mut stats = TraceStats::new(&StatsConfig {
        enabled: true,
        ..Default::default()
    });

    let dim = Extent2d::from((64, 64));

    for (rays, path) in [(2u32, 3u32), (5, 7), (11, 13)] {
        stats.begin_frame(&ctx, dim);
        trace_dispatch(&ctx, &stats, dim, rays, path);
        stats.end_frame(&ctx);

        let data = stats.data(&ctx).expect("stats each frame");
        assert_eq!(data.total_rays, dim.pixel_count() * u64::from(rays));
        assert!((data.avg_path_length - path as f32).abs() < 1e-4);
    }
}

#[test]
#[ignore = "requires a GPU"]
fn resize_recreates_counters() {
    let ctx = gpu_context();

    let mut stats = TraceStats::new(&StatsConfig {
        enabled: true,
        ..Default::default()
    });

    for dim in [Extent2d::from((128, 128)), Extent2d::from((33, 17))] {
        stats.begin_frame(&ctx, dim);
        trace_dispatch(&ctx, &stats, dim, 1, 4);
        stats.end_frame(&ctx);

        let data = stats.data(&ctx).expect("stats after resize");
        assert_eq!(data.total_rays, dim.pixel_count());
        assert!((data.avg_path_length - 4.0).abs() < 1e-4);
    }
}

#[test]
#[ignore = "requires a GPU"]
fn disabled_collector_reports_nothing() {
    let ctx = gpu_context();

    let mut stats = TraceStats::new(&StatsConfig::default());
    let dim = Extent2d::from((64, 64));

    stats.begin_frame(&ctx, dim);
    stats.end_frame(&ctx);

    assert!(stats.data(&ctx).is_none());
    assert!(stats.ray_count_texture().is_none());
}

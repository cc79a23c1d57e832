mod context;
mod reduce;
mod stats;

pub use self::{
    context::Context,
    reduce::GpuReduction,
    stats::{TraceStats, TraceStatsData, STATS_BIND_GROUP, STATS_WGSL},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Failed to initialize GPU device {source}")]
    RequestDevice {
        #[from]
        source: wgpu::RequestDeviceError,
    },
    #[error("Failed to map readback buffer {source}")]
    Readback {
        #[from]
        source: wgpu::BufferAsyncError,
    },
    #[error("Readback completion signal was lost")]
    ReadbackLost,
}

/// Two-dimensional extent of a frame in pixels.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub(crate) fn into_3d(self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

impl From<(u32, u32)> for Extent2d {
    fn from((width, height): (u32, u32)) -> Self {
        Extent2d { width, height }
    }
}

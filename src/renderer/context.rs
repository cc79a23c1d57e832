use {crate::renderer::Error, std::ops::Deref};

/// Device and queue the stats collector records against.
///
/// Embed an existing renderer's device with [`Context::new`], or create a
/// standalone headless context with [`Context::headless`].
pub struct Context {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    adapter_name: Option<String>,

    // Keeps the instance alive until device and queue are dropped.
    _instance: Option<wgpu::Instance>,
}

impl Context {
    /// Wrap a device and queue owned by the enclosing renderer.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Context {
            device,
            queue,
            adapter_name: None,
            _instance: None,
        }
    }

    /// Create a context without a surface, for offline rendering and tests.
    pub fn headless() -> Result<Self, Error> {
        pollster::block_on(Self::headless_async())
    }

    async fn headless_async() -> Result<Self, Error> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);

        // Prefer real hardware. Software rasterizers are the last resort so
        // that tests still run on machines without a GPU.
        let adapter = adapters
            .iter()
            .find(|a| {
                !matches!(a.get_info().device_type, wgpu::DeviceType::Cpu)
            })
            .or_else(|| adapters.first())
            .ok_or(Error::NoAdapter)?;

        tracing::debug!("{:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("raymetrics"),
                    // Counter textures are cleared at frame begin.
                    required_features: wgpu::Features::CLEAR_TEXTURE,
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        tracing::debug!("Device created");

        Ok(Context {
            device,
            queue,
            adapter_name: Some(adapter.get_info().name),
            _instance: Some(instance),
        })
    }

    pub fn adapter_name(&self) -> Option<&str> {
        self.adapter_name.as_deref()
    }
}

impl Deref for Context {
    type Target = wgpu::Device;

    fn deref(&self) -> &wgpu::Device {
        &self.device
    }
}

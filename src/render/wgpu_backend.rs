//! WebGPU implementation of the render backend.
//!
//! The color texture is external: it is latched from the [`PreviewFeed`] at
//! draw time, so the pipeline never uploads camera images itself. Every call
//! runs inside a validation error scope and the first failure is kept for
//! [`GpuBackend::poll_error`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use wgpu::util::DeviceExt;
use wgpu::{
    BindGroupLayout, Device, Extent3d, Queue, RenderPipeline, Sampler, Surface,
    SurfaceConfiguration, Texture, TextureFormat, TextureUsages,
};
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

use crate::capture::frame::PreviewFeed;
use crate::depth::DepthFrame;
use crate::render::gpu::{DrawCall, GpuBackend, ProgramId, TextureId};
use crate::render::uniforms::Uniforms;
use crate::{Error, RenderConfig, Resolution, Result};

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
    wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

/// Interleaved position and texture coordinate per vertex
const VERTEX_STRIDE: u64 = 4 * 4;

struct ExternalTexture {
    texture: Texture,
    resolution: Resolution,
    latched: u64,
}

struct Program {
    pipeline: RenderPipeline,
    layout: BindGroupLayout,
}

pub struct WgpuBackend {
    device: Device,
    queue: Queue,
    surface: Surface<'static>,
    surface_config: SurfaceConfiguration,
    pub window: Arc<Window>,
    preview: Arc<PreviewFeed>,
    external: HashMap<TextureId, ExternalTexture>,
    depth: HashMap<TextureId, (Texture, Resolution)>,
    programs: HashMap<ProgramId, Program>,
    sampler: Sampler,
    uniforms: wgpu::Buffer,
    vertices: wgpu::Buffer,
    next_id: u32,
    error: Option<String>,
}

fn init_err(e: impl std::fmt::Display) -> Error {
    Error::graphics("context creation", e.to_string())
}

impl WgpuBackend {
    #[instrument(skip_all)]
    pub fn new(
        event_loop: &ActiveEventLoop,
        config: &RenderConfig,
        preview: Arc<PreviewFeed>,
    ) -> Result<Self> {
        info!("Initializing WebGPU backend");

        let window = Arc::new(
            event_loop
                .create_window(
                    Window::default_attributes()
                        .with_title("sharedcam")
                        .with_inner_size(winit::dpi::PhysicalSize::new(config.width, config.height)),
                )
                .map_err(init_err)?,
        );

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(window.clone()).map_err(init_err)?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| init_err("no suitable GPU adapter found"))?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("sharedcam device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(init_err)?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| init_err("surface reports no formats"))?;
        let size = window.inner_size();
        let surface_config = SurfaceConfiguration {
            usage: TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if config.vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &surface_config);

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("camera sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("composite uniforms"),
            size: std::mem::size_of::<Uniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("background quad"),
            contents: bytemuck::cast_slice(&[0.0f32; 16]),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        });

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            window,
            preview,
            external: HashMap::new(),
            depth: HashMap::new(),
            programs: HashMap::new(),
            sampler,
            uniforms,
            vertices,
            next_id: 0,
            error: None,
        })
    }

    pub fn surface_size(&self) -> Resolution {
        Resolution::new(self.surface_config.width, self.surface_config.height)
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(self);
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            self.error.get_or_insert_with(|| e.to_string());
        }
        value
    }

    fn texture_2d(&self, label: &str, size: Resolution, format: TextureFormat) -> Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn write_texture(&self, texture: &Texture, data: &[u8], size: Resolution, bytes_per_pixel: u32) {
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_pixel * size.width),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
    }

    /// Copy the newest preview image into the external texture if it changed
    fn latch_preview(&mut self, id: TextureId) -> Result<()> {
        let published = self.preview.published();
        let Some(current) = self.external.get(&id) else {
            return Err(Error::graphics("latch", format!("unknown external texture {:?}", id)));
        };
        if current.latched == published {
            return Ok(());
        }
        let Some(frame) = self.preview.latest() else {
            return Ok(());
        };

        let resolution = frame.resolution();
        if frame.data.len() < resolution.pixel_count() * 4 {
            warn!("Preview image shorter than {}x{} RGBA, not latched", resolution.width, resolution.height);
            return Ok(());
        }
        if current.resolution != resolution {
            debug!("Camera texture resized to {}x{}", resolution.width, resolution.height);
            let texture = self.texture_2d("camera image", resolution, TextureFormat::Rgba8UnormSrgb);
            self.external.insert(
                id,
                ExternalTexture {
                    texture,
                    resolution,
                    latched: 0,
                },
            );
        }

        if let Some(external) = self.external.get(&id) {
            self.write_texture(&external.texture, &frame.data[..resolution.pixel_count() * 4], resolution, 4);
        }
        if let Some(external) = self.external.get_mut(&id) {
            external.latched = published;
        }
        Ok(())
    }

    fn render(&mut self, call: &DrawCall<'_>) -> Result<()> {
        self.latch_preview(call.color)?;

        let program = self
            .programs
            .get(&call.program)
            .ok_or_else(|| Error::graphics("draw", format!("unknown program {:?}", call.program)))?;
        let color = self
            .external
            .get(&call.color)
            .ok_or_else(|| Error::graphics("draw", format!("unknown texture {:?}", call.color)))?;
        let (depth, _) = self
            .depth
            .get(&call.depth)
            .ok_or_else(|| Error::graphics("draw", format!("unknown texture {:?}", call.depth)))?;

        let mut vertices = [0.0f32; 16];
        for (i, vertex) in vertices.chunks_exact_mut(4).enumerate() {
            vertex[..2].copy_from_slice(&call.positions[i * 2..i * 2 + 2]);
            vertex[2..].copy_from_slice(&call.uvs[i * 2..i * 2 + 2]);
        }
        self.queue.write_buffer(&self.vertices, 0, bytemuck::cast_slice(&vertices));
        self.queue.write_buffer(&self.uniforms, 0, call.uniforms.as_bytes());

        let color_view = color.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("composite bindings"),
            layout: &program.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&color_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&depth_view),
                },
            ],
        });

        let output = match self.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                debug!("Surface lost, reconfiguring");
                self.surface.configure(&self.device, &self.surface_config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("Surface acquire timed out, frame dropped");
                return Ok(());
            }
            Err(e) => return Err(Error::graphics("surface acquire", e.to_string())),
        };
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("background encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("background pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertices.slice(..));
            pass.draw(0..call.vertex_count, 0..1);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

fn extent(size: Resolution) -> Extent3d {
    Extent3d {
        width: size.width.max(1),
        height: size.height.max(1),
        depth_or_array_layers: 1,
    }
}

fn layout_entry(binding: u32, ty: wgpu::BindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty,
        count: None,
    }
}

impl GpuBackend for WgpuBackend {
    fn create_external_texture(&mut self) -> Result<TextureId> {
        let id = TextureId(self.next_id());
        let resolution = Resolution::new(1, 1);
        let texture = self.scoped(|b| {
            let texture = b.texture_2d("camera image", resolution, TextureFormat::Rgba8UnormSrgb);
            b.write_texture(&texture, &[0, 0, 0, 255], resolution, 4);
            texture
        });
        self.external.insert(
            id,
            ExternalTexture {
                texture,
                resolution,
                latched: 0,
            },
        );
        Ok(id)
    }

    fn create_depth_texture(&mut self, resolution: Resolution) -> Result<TextureId> {
        let id = TextureId(self.next_id());
        let texture = self.scoped(|b| b.texture_2d("depth16", resolution, TextureFormat::R16Uint));
        self.depth.insert(id, (texture, resolution));
        Ok(id)
    }

    fn create_program(&mut self, source: &str) -> Result<ProgramId> {
        let id = ProgramId(self.next_id());
        let format = self.surface_config.format;
        let program = self.scoped(|b| {
            let shader = b.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("composite shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

            let layout = b.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("composite layout"),
                entries: &[
                    layout_entry(
                        0,
                        wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                    ),
                    layout_entry(
                        1,
                        wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                    ),
                    layout_entry(2, wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)),
                    layout_entry(
                        3,
                        wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Uint,
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                    ),
                ],
            });

            let pipeline_layout = b.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("composite pipeline layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

            let pipeline = b.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("composite pipeline"),
                layout: Some(&pipeline_layout),
                cache: None,
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: VERTEX_STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &VERTEX_ATTRIBUTES,
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                // background never writes or tests depth
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

            Program { pipeline, layout }
        });
        self.programs.insert(id, program);
        Ok(id)
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
    }

    fn upload_depth(&mut self, texture: TextureId, frame: &DepthFrame) -> Result<()> {
        let Some((target, resolution)) = self.depth.get(&texture) else {
            return Err(Error::graphics("depth upload", format!("unknown texture {:?}", texture)));
        };
        if *resolution != frame.resolution() {
            return Err(Error::graphics(
                "depth upload",
                format!("frame {:?} does not fit texture {:?}", frame.resolution(), resolution),
            ));
        }
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.write_texture(target, frame.as_bytes(), frame.resolution(), 2);
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            self.error.get_or_insert_with(|| e.to_string());
        }
        Ok(())
    }

    fn draw_quad(&mut self, call: &DrawCall<'_>) -> Result<()> {
        self.scoped(|b| b.render(call))
    }

    fn poll_error(&mut self) -> Option<String> {
        self.error.take()
    }
}

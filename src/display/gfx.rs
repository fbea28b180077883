use std::sync::Arc;

use wgpu::util::DeviceExt as _;
use winit::{dpi::PhysicalSize, window::Window};

use super::{DisplayError, letterbox::Letterbox};
use crate::{
    page::{Geometry, Page, PixelFormat},
    palette::{PALETTE_LEN, Rgb},
};

const FORMAT_INDEXED4: u32 = 0;
const FORMAT_RGB32: u32 = 1;

/// Mirrors `BlitParams` in `blit.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct BlitParams {
    palette: [[f32; 4]; PALETTE_LEN],
    page_size: [u32; 2],
    format: u32,
    _pad: u32,
}

impl BlitParams {
    fn new(geometry: Geometry, palette: &[Rgb; PALETTE_LEN]) -> Self {
        let format = match geometry.format {
            PixelFormat::Indexed4 => FORMAT_INDEXED4,
            PixelFormat::Rgb32 => FORMAT_RGB32,
        };
        Self {
            palette: (*palette).map(|c| {
                [
                    f32::from(c.r) / 255.0,
                    f32::from(c.g) / 255.0,
                    f32::from(c.b) / 255.0,
                    1.0,
                ]
            }),
            page_size: [geometry.width, geometry.height],
            format,
            _pad: 0,
        }
    }
}

/// Texture holding a page's bytes exactly as they sit in shared memory.
///
/// Indexed pages go up as one `R8Uint` texel per byte (two pixels each) and
/// RGB pages as one `R32Uint` texel per pixel; `blit.wgsl` does the decoding.
fn page_texture_layout(geometry: Geometry) -> (wgpu::TextureFormat, wgpu::Extent3d) {
    let (format, width) = match geometry.format {
        PixelFormat::Indexed4 => (wgpu::TextureFormat::R8Uint, geometry.stride() as u32),
        PixelFormat::Rgb32 => (wgpu::TextureFormat::R32Uint, geometry.width),
    };
    let size = wgpu::Extent3d {
        width,
        height: geometry.height,
        depth_or_array_layers: 1,
    };
    (format, size)
}

/// Draws a shared page into a window surface, palette lookup on the GPU.
pub struct Gfx {
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,

    geometry: Geometry,
    page_texture: wgpu::Texture,
    page_extent: wgpu::Extent3d,
    params: wgpu::Buffer,
    palette: [Rgb; PALETTE_LEN],
}

impl Gfx {
    pub async fn new(
        window: Arc<Window>,
        geometry: Geometry,
        palette: &[Rgb; PALETTE_LEN],
    ) -> Result<Self, DisplayError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::default();
        let surface = instance.create_surface(window)?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::LowPower,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(DisplayError::NoAdapter)?;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("bgi"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_webgl2_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        // Palette entries are written out untouched, so skip sRGB encoding.
        let caps = surface.get_capabilities(&adapter);
        let surface_format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or(DisplayError::NoAdapter)?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
        };
        surface.configure(&device, &config);

        let (texel_format, page_extent) = page_texture_layout(geometry);
        let page_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("page bytes"),
            size: page_extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texel_format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("blit params"),
            contents: bytemuck::bytes_of(&BlitParams::new(geometry, palette)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blit"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Uint,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let page_view = page_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("blit"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&page_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params.as_entire_binding(),
                },
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("blit"),
            source: wgpu::ShaderSource::Wgsl(include_str!("blit.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("blit"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("blit"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        Ok(Self {
            surface,
            device,
            queue,
            config,
            pipeline,
            bind_group,
            geometry,
            page_texture,
            page_extent,
            params,
            palette: *palette,
        })
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        self.surface.configure(&self.device, &self.config);
    }

    /// Reconfigure at the current size after the surface was lost.
    pub fn reconfigure(&mut self) {
        self.surface.configure(&self.device, &self.config);
    }

    /// Push a new palette to the shader; unchanged palettes are skipped.
    pub fn set_palette(&mut self, palette: &[Rgb; PALETTE_LEN]) {
        if *palette == self.palette {
            return;
        }
        self.palette = *palette;
        let params = BlitParams::new(self.geometry, palette);
        self.queue
            .write_buffer(&self.params, 0, bytemuck::bytes_of(&params));
    }

    /// Copy the page's current bytes to the GPU.
    pub fn upload_page(&self, page: &Page) {
        debug_assert_eq!(page.geometry(), self.geometry);
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.page_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            page.pixels(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(page.stride() as u32),
                rows_per_image: Some(self.page_extent.height),
            },
            self.page_extent,
        );
    }

    pub fn render(&mut self, letterbox: &Letterbox) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let target = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("present"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            pass.set_viewport(
                letterbox.dest_x as f32,
                letterbox.dest_y as f32,
                letterbox.dest_w as f32,
                letterbox.dest_h as f32,
                0.0,
                1.0,
            );
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        output.present();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::DEFAULT_PALETTE;

    #[test]
    fn params_match_the_shader_layout() {
        assert_eq!(std::mem::size_of::<BlitParams>(), 16 * 16 + 16);
        let params = BlitParams::new(
            Geometry::new(640, 480, PixelFormat::Indexed4),
            &DEFAULT_PALETTE,
        );
        assert_eq!(params.page_size, [640, 480]);
        assert_eq!(params.format, FORMAT_INDEXED4);
        assert_eq!(params.palette[0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(params.palette[15], [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn texture_covers_the_raw_page_bytes() {
        let indexed = Geometry::new(3, 2, PixelFormat::Indexed4);
        let (format, extent) = page_texture_layout(indexed);
        assert_eq!(format, wgpu::TextureFormat::R8Uint);
        assert_eq!(extent.width as usize * extent.height as usize, indexed.pixels_len());

        let rgb = Geometry::new(3, 2, PixelFormat::Rgb32);
        let (format, extent) = page_texture_layout(rgb);
        assert_eq!(format, wgpu::TextureFormat::R32Uint);
        assert_eq!(extent.width as usize * 4 * 2, rgb.pixels_len());
    }
}

// Render targets - attachment descriptions and the structural layout hash
//
// A RenderTargetsInfo names concrete images plus load/store actions.
// RenderTargetLayout is the image-independent part of it: formats, sample
// counts, ops and the combined extent. Its hash keys the render pass cache.

use ash::vk;

use crate::error::{RhiError, RhiResult};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

/// Description of an image that can be bound as an attachment.
///
/// Textures are plain descriptors; the image itself is owned elsewhere
/// (by the swapchain for back buffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
    /// Swapchain images end the pass in PRESENT_SRC
    pub presentable: bool,
}

impl Texture {
    pub fn back_buffer(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            image,
            format,
            extent,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
            presentable: true,
        }
    }

    pub fn color(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            presentable: false,
            ..Self::back_buffer(image, format, extent)
        }
    }

    pub fn depth_stencil(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            image,
            format,
            extent,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: depth_aspect(format),
            presentable: false,
        }
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }
}

/// View aspect for a depth format. STENCIL is only valid when the format
/// carries a stencil component.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetView {
    pub texture: Texture,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
}

impl RenderTargetView {
    pub fn new(texture: Texture, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp) -> Self {
        Self {
            texture,
            load_op,
            store_op,
        }
    }
}

/// Concrete attachments for one render pass instance
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetsInfo {
    pub color_targets: Vec<RenderTargetView>,
    pub depth_stencil_target: Option<RenderTargetView>,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl Default for RenderTargetsInfo {
    fn default() -> Self {
        Self {
            color_targets: Vec::new(),
            depth_stencil_target: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }
}

impl RenderTargetsInfo {
    pub fn single_color(target: RenderTargetView) -> Self {
        Self {
            color_targets: vec![target],
            ..Default::default()
        }
    }

    pub fn with_depth_stencil(mut self, target: RenderTargetView) -> Self {
        self.depth_stencil_target = Some(target);
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    /// Clear values in attachment order: colors first, then depth
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut values: Vec<vk::ClearValue> = self
            .color_targets
            .iter()
            .map(|_| vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            })
            .collect();
        if self.depth_stencil_target.is_some() {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: self.clear_stencil,
                },
            });
        }
        values
    }
}

/// Image-independent description of one attachment slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLayout {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentLayout {
    fn color(view: &RenderTargetView) -> Self {
        let final_layout = if view.texture.presentable {
            vk::ImageLayout::PRESENT_SRC_KHR
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        Self {
            format: view.texture.format,
            samples: view.texture.samples,
            load_op: view.load_op,
            store_op: view.store_op,
            final_layout,
        }
    }

    fn depth_stencil(view: &RenderTargetView) -> Self {
        Self {
            format: view.texture.format,
            samples: view.texture.samples,
            load_op: view.load_op,
            store_op: view.store_op,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    pub fn initial_layout(&self) -> vk::ImageLayout {
        if self.final_layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        }
    }

    pub fn description(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(self.initial_layout())
            .final_layout(self.final_layout)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTargetLayout {
    color: Vec<AttachmentLayout>,
    depth_stencil: Option<AttachmentLayout>,
    extent: vk::Extent2D,
    samples: vk::SampleCountFlags,
    num_used_clear_values: u32,
    hash: u64,
}

impl RenderTargetLayout {
    pub fn new(info: &RenderTargetsInfo) -> RhiResult<Self> {
        if info.color_targets.len() > MAX_COLOR_ATTACHMENTS {
            return Err(RhiError::RenderTarget(format!(
                "{} color targets exceed the maximum of {}",
                info.color_targets.len(),
                MAX_COLOR_ATTACHMENTS
            )));
        }

        let first = info
            .color_targets
            .first()
            .or(info.depth_stencil_target.as_ref())
            .ok_or_else(|| RhiError::RenderTarget("no attachments".into()))?;
        let mut extent = first.texture.extent;
        let samples = first.texture.samples;

        for view in &info.color_targets {
            if view.texture.extent != extent {
                return Err(RhiError::RenderTarget(format!(
                    "color target extent {}x{} differs from {}x{}",
                    view.texture.extent.width, view.texture.extent.height, extent.width, extent.height
                )));
            }
            if view.texture.samples != samples {
                return Err(RhiError::RenderTarget(format!(
                    "color target sample count {:?} differs from {:?}",
                    view.texture.samples, samples
                )));
            }
        }

        if let Some(depth) = &info.depth_stencil_target {
            if depth.texture.samples != samples {
                return Err(RhiError::RenderTarget(format!(
                    "depth target sample count {:?} differs from {:?}",
                    depth.texture.samples, samples
                )));
            }
            extent.width = extent.width.min(depth.texture.extent.width);
            extent.height = extent.height.min(depth.texture.extent.height);
        }

        let color: Vec<_> = info.color_targets.iter().map(AttachmentLayout::color).collect();
        let depth_stencil = info
            .depth_stencil_target
            .as_ref()
            .map(AttachmentLayout::depth_stencil);

        let num_attachments = (color.len() + depth_stencil.iter().count()) as u32;
        let any_clear = color
            .iter()
            .chain(depth_stencil.iter())
            .any(|a| a.load_op == vk::AttachmentLoadOp::CLEAR);
        let num_used_clear_values = if any_clear { num_attachments } else { 0 };

        let hash = layout_hash(&color, depth_stencil.as_ref());

        Ok(Self {
            color,
            depth_stencil,
            extent,
            samples,
            num_used_clear_values,
            hash,
        })
    }

    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn color_attachments(&self) -> &[AttachmentLayout] {
        &self.color
    }

    pub fn depth_stencil_attachment(&self) -> Option<&AttachmentLayout> {
        self.depth_stencil.as_ref()
    }

    pub fn num_attachments(&self) -> usize {
        self.color.len() + self.depth_stencil.iter().count()
    }

    pub fn num_used_clear_values(&self) -> u32 {
        self.num_used_clear_values
    }

    /// Same attachment slots, ignoring extent
    pub fn is_compatible(&self, other: &RenderTargetLayout) -> bool {
        self.color == other.color && self.depth_stencil == other.depth_stencil
    }

    /// Native descriptions, colors first then depth
    pub fn attachment_descriptions(&self) -> Vec<vk::AttachmentDescription> {
        self.color
            .iter()
            .chain(self.depth_stencil.iter())
            .map(AttachmentLayout::description)
            .collect()
    }
}

// FNV-1a 64 over an explicit field list, so the key is identical on every
// build and platform
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(FNV_OFFSET)
    }

    fn write_u32(&mut self, value: u32) {
        for byte in value.to_le_bytes() {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn write_attachment(&mut self, a: &AttachmentLayout) {
        self.write_u32(a.format.as_raw() as u32);
        self.write_u32(a.samples.as_raw());
        self.write_u32(a.load_op.as_raw() as u32);
        self.write_u32(a.store_op.as_raw() as u32);
        self.write_u32(a.final_layout.as_raw() as u32);
    }
}

fn layout_hash(color: &[AttachmentLayout], depth_stencil: Option<&AttachmentLayout>) -> u64 {
    let mut h = Fnv1a::new();
    h.write_u32(color.len() as u32);
    for attachment in color {
        h.write_attachment(attachment);
    }
    match depth_stencil {
        Some(depth) => {
            h.write_u32(1);
            h.write_attachment(depth);
        }
        None => h.write_u32(0),
    }
    h.0
}

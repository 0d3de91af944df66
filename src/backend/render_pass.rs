// Render pass and framebuffer cache
//
// Render passes are keyed by RenderTargetLayout::hash. Framebuffers share
// that key in buckets and are told apart by the images they bind.
// Entries live until teardown(); there is no per-entry eviction.

use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use super::native::DeviceRef;
use super::render_target::{RenderTargetLayout, RenderTargetsInfo, Texture};
use crate::error::{RhiError, RhiResult};

pub struct RenderPass {
    handle: vk::RenderPass,
    layout: RenderTargetLayout,
    device: DeviceRef,
}

impl RenderPass {
    fn new(device: &DeviceRef, layout: &RenderTargetLayout) -> RhiResult<Self> {
        let attachments = layout.attachment_descriptions();
        let num_color = layout.color_attachments().len();

        let color_refs: Vec<vk::AttachmentReference> = (0..num_color as u32)
            .map(|i| vk::AttachmentReference {
                attachment: i,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: num_color as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        // Single main subpass. Deferred layouts would add more subpasses here.
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if layout.depth_stencil_attachment().is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        // Wait for the swapchain image to be released before writing it
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = device.create_render_pass(&create_info)?;
        log::debug!(
            "Created render pass {:?} for layout {:016x} ({} attachments)",
            handle,
            layout.hash(),
            attachments.len()
        );

        Ok(Self {
            handle,
            layout: layout.clone(),
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn layout(&self) -> &RenderTargetLayout {
        &self.layout
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.destroy_render_pass(self.handle);
    }
}

pub struct Framebuffer {
    handle: vk::Framebuffer,
    views: Vec<vk::ImageView>,
    color_images: Vec<vk::Image>,
    depth_image: Option<vk::Image>,
    extent: vk::Extent2D,
    // Keeps the render pass alive until every framebuffer built on it is gone
    render_pass: Arc<RenderPass>,
    device: DeviceRef,
}

impl Framebuffer {
    fn new(
        device: &DeviceRef,
        info: &RenderTargetsInfo,
        layout: &RenderTargetLayout,
        render_pass: &Arc<RenderPass>,
    ) -> RhiResult<Self> {
        let textures = info
            .color_targets
            .iter()
            .chain(info.depth_stencil_target.iter())
            .map(|view| &view.texture);

        let mut views = Vec::with_capacity(layout.num_attachments());
        for texture in textures {
            match create_view(device, texture) {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        device.destroy_image_view(view);
                    }
                    return Err(e);
                }
            }
        }

        let extent = layout.extent();
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = match device.create_framebuffer(&create_info) {
            Ok(handle) => handle,
            Err(e) => {
                for view in views {
                    device.destroy_image_view(view);
                }
                return Err(e.into());
            }
        };
        log::debug!(
            "Created framebuffer {:?} ({}x{}, {} views)",
            handle,
            extent.width,
            extent.height,
            views.len()
        );

        Ok(Self {
            handle,
            views,
            color_images: info.color_targets.iter().map(|v| v.texture.image).collect(),
            depth_image: info.depth_stencil_target.map(|v| v.texture.image),
            extent,
            render_pass: render_pass.clone(),
            device: device.clone(),
        })
    }

    /// True if this framebuffer binds exactly the images in `info`
    pub fn matches(&self, info: &RenderTargetsInfo) -> bool {
        self.color_images.len() == info.color_targets.len()
            && self
                .color_images
                .iter()
                .zip(&info.color_targets)
                .all(|(&image, view)| image == view.texture.image)
            && self.depth_image == info.depth_stencil_target.map(|v| v.texture.image)
    }

    #[inline]
    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.handle);
        for &view in &self.views {
            self.device.destroy_image_view(view);
        }
    }
}

fn create_view(device: &DeviceRef, texture: &Texture) -> RhiResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(texture.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(texture.format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: texture.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    Ok(device.create_image_view(&create_info)?)
}

pub struct RenderTargetCache {
    render_passes: HashMap<u64, Arc<RenderPass>>,
    framebuffers: HashMap<u64, Vec<Arc<Framebuffer>>>,
    device: DeviceRef,
}

impl RenderTargetCache {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            device,
        }
    }

    pub fn get_or_create_render_pass(&mut self, layout: &RenderTargetLayout) -> RhiResult<Arc<RenderPass>> {
        let hash = layout.hash();
        if let Some(render_pass) = self.render_passes.get(&hash) {
            if !render_pass.layout().is_compatible(layout) {
                return Err(RhiError::RenderTarget(format!(
                    "layout hash collision on {:016x}",
                    hash
                )));
            }
            return Ok(render_pass.clone());
        }

        let render_pass = Arc::new(RenderPass::new(&self.device, layout)?);
        self.render_passes.insert(hash, render_pass.clone());
        Ok(render_pass)
    }

    pub fn get_or_create_framebuffer(
        &mut self,
        info: &RenderTargetsInfo,
        layout: &RenderTargetLayout,
        render_pass: &Arc<RenderPass>,
    ) -> RhiResult<Arc<Framebuffer>> {
        let bucket = self.framebuffers.entry(layout.hash()).or_default();
        if let Some(framebuffer) = bucket.iter().find(|fb| fb.matches(info)) {
            return Ok(framebuffer.clone());
        }

        let framebuffer = Arc::new(Framebuffer::new(&self.device, info, layout, render_pass)?);
        bucket.push(framebuffer.clone());
        Ok(framebuffer)
    }

    pub fn render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.values().map(Vec::len).sum()
    }

    /// Drop every cached object. Framebuffers go before the render passes
    /// they were built on. Callers must ensure the GPU is idle.
    pub fn teardown(&mut self) {
        log::debug!(
            "Tearing down render target cache ({} render passes, {} framebuffers)",
            self.render_pass_count(),
            self.framebuffer_count()
        );
        self.framebuffers.clear();
        self.render_passes.clear();
    }
}

impl Drop for RenderTargetCache {
    fn drop(&mut self) {
        self.teardown();
    }
}

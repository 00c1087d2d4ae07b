//! Backend-neutral resource and shader descriptions.

use bitflags::bitflags;
use prism_native::{BindFlags, ImageDesc, NativeFormat};

/// Which native API family a device (and everything created on it) targets.
/// Selected once at session start from the wrapped native handle; instances
/// are never mixed across backends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Immediate,
    Explicit,
}

bitflags! {
    /// Declared usage of a texture. Requesting a view kind outside the
    /// declared usage is a capability error.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const SAMPLED          = 1 << 0;
        const RENDER_TARGET    = 1 << 1;
        const DEPTH_STENCIL    = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const TRANSFER         = 1 << 4;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        self.to_native().bytes_per_texel()
    }

    pub(crate) fn to_native(self) -> NativeFormat {
        match self {
            TextureFormat::Rgba8Unorm => NativeFormat::Rgba8Unorm,
            TextureFormat::Bgra8Unorm => NativeFormat::Bgra8Unorm,
            TextureFormat::Rgba16Float => NativeFormat::Rgba16Float,
            TextureFormat::R32Float => NativeFormat::R32Float,
        }
    }
}

/// Creation parameters for a texture.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub sample_count: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Single-layer, single-mip 2D texture, the common case for
    /// post-processing intermediates.
    pub fn new(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            array_size: 1,
            mip_count: 1,
            sample_count: 1,
            format,
            usage,
        }
    }

    pub(crate) fn to_native(&self) -> ImageDesc {
        let mut bind = BindFlags::empty();
        if self.usage.contains(TextureUsage::SAMPLED) {
            bind |= BindFlags::SHADER_RESOURCE;
        }
        if self.usage.contains(TextureUsage::RENDER_TARGET) {
            bind |= BindFlags::RENDER_TARGET;
        }
        if self.usage.contains(TextureUsage::DEPTH_STENCIL) {
            bind |= BindFlags::DEPTH_STENCIL;
        }
        if self.usage.contains(TextureUsage::UNORDERED_ACCESS) {
            bind |= BindFlags::STORAGE;
        }
        if self.usage.contains(TextureUsage::TRANSFER) {
            bind |= BindFlags::TRANSFER;
        }
        ImageDesc {
            width: self.width,
            height: self.height,
            array_layers: self.array_size,
            mip_levels: self.mip_count,
            sample_count: self.sample_count,
            format: self.format.to_native(),
            bind,
        }
    }

    /// Byte size of the top-level subresource.
    pub fn top_level_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_texel() as usize
    }
}

/// What a view exposes its texture as.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ShaderInput,
    ComputeOutput,
    RenderTarget,
    DepthStencil,
}

impl ViewKind {
    /// The usage flag a texture must declare for this view kind.
    pub(crate) fn required_usage(self) -> TextureUsage {
        match self {
            ViewKind::ShaderInput => TextureUsage::SAMPLED,
            ViewKind::ComputeOutput => TextureUsage::UNORDERED_ACCESS,
            ViewKind::RenderTarget => TextureUsage::RENDER_TARGET,
            ViewKind::DepthStencil => TextureUsage::DEPTH_STENCIL,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShaderKind {
    Quad,
    Compute,
}

/// Creation parameters for a shader. `defines` are substituted into the
/// source before assembly; `name` tags compile diagnostics and log lines.
#[derive(Debug, Copy, Clone)]
pub struct ShaderDesc<'a> {
    pub source: &'a str,
    pub entry: &'a str,
    pub name: &'a str,
    pub defines: &'a [(&'a str, &'a str)],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_to_native_bind_flags() {
        let desc = TextureDesc::new(
            64,
            64,
            TextureFormat::Rgba8Unorm,
            TextureUsage::SAMPLED | TextureUsage::UNORDERED_ACCESS,
        );
        let native = desc.to_native();
        assert!(native.bind.contains(BindFlags::SHADER_RESOURCE));
        assert!(native.bind.contains(BindFlags::STORAGE));
        assert!(!native.bind.contains(BindFlags::RENDER_TARGET));
    }

    #[test]
    fn top_level_len_accounts_for_format() {
        let desc = TextureDesc::new(4, 4, TextureFormat::Rgba16Float, TextureUsage::SAMPLED);
        assert_eq!(desc.top_level_len(), 4 * 4 * 8);
    }
}

//! Image and buffer storage shared by both device surfaces.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::error::NativeError;
use crate::format::NativeFormat;

bitflags! {
    /// Declared bind capabilities of an image.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        const SHADER_RESOURCE = 1 << 0;
        const RENDER_TARGET   = 1 << 1;
        const DEPTH_STENCIL   = 1 << 2;
        const STORAGE         = 1 << 3;
        const TRANSFER        = 1 << 4;
    }
}

/// Creation parameters for a native image.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub format: NativeFormat,
    pub bind: BindFlags,
}

impl ImageDesc {
    pub(crate) fn validate(&self) -> Result<(), NativeError> {
        if self.width == 0 || self.height == 0 {
            return Err(NativeError::Validation(format!(
                "image extent {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.array_layers == 0 || self.mip_levels == 0 {
            return Err(NativeError::Validation(
                "image must have at least one layer and one mip level".into(),
            ));
        }
        if self.sample_count != 1 {
            // Multisampling is declared in the interface for swapchain
            // compatibility but the engine only stores resolved data.
            return Err(NativeError::Validation(format!(
                "sample_count {} is not supported",
                self.sample_count
            )));
        }
        let max_mips = 32 - self.width.max(self.height).leading_zeros();
        if self.mip_levels > max_mips {
            return Err(NativeError::Validation(format!(
                "mip_levels {} exceeds the {}x{} mip chain",
                self.mip_levels, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Extent of `mip`, clamped to 1x1.
    pub(crate) fn mip_extent(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    pub(crate) fn subresource_len(&self, mip: u32) -> usize {
        let (w, h) = self.mip_extent(mip);
        w as usize * h as usize * self.format.bytes_per_texel() as usize
    }
}

/// Texel storage for one (layer, mip) subresource.
///
/// Subresources are reference counted so the interpreter can hold an input
/// and an output image at the same time; aliasing the same subresource as
/// both is rejected at dispatch, not here.
pub(crate) type SubresourceData = Rc<RefCell<Vec<u8>>>;

#[derive(Debug)]
pub(crate) struct Image {
    pub desc: ImageDesc,
    subresources: Vec<SubresourceData>,
}

impl Image {
    pub fn new(desc: ImageDesc) -> Result<Self, NativeError> {
        desc.validate()?;
        let mut subresources =
            Vec::with_capacity((desc.array_layers * desc.mip_levels) as usize);
        for _layer in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                subresources.push(Rc::new(RefCell::new(vec![0u8; desc.subresource_len(mip)])));
            }
        }
        Ok(Self { desc, subresources })
    }

    pub fn subresource(&self, layer: u32, mip: u32) -> Result<&SubresourceData, NativeError> {
        if layer >= self.desc.array_layers || mip >= self.desc.mip_levels {
            return Err(NativeError::Validation(format!(
                "subresource (layer {layer}, mip {mip}) out of range for {}x{} image",
                self.desc.array_layers, self.desc.mip_levels
            )));
        }
        Ok(&self.subresources[(layer * self.desc.mip_levels + mip) as usize])
    }

    /// Replace the contents of one subresource; `data` must match its length
    /// exactly.
    pub fn write(&self, layer: u32, mip: u32, data: &[u8]) -> Result<(), NativeError> {
        let sub = self.subresource(layer, mip)?;
        let mut bytes = sub.borrow_mut();
        if data.len() != bytes.len() {
            return Err(NativeError::Validation(format!(
                "upload of {} bytes does not match subresource size {}",
                data.len(),
                bytes.len()
            )));
        }
        bytes.copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, layer: u32, mip: u32) -> Result<Vec<u8>, NativeError> {
        Ok(self.subresource(layer, mip)?.borrow().clone())
    }
}

/// Plain byte storage; constant data, vertex/index data and staging uploads
/// all go through this.
#[derive(Debug)]
pub(crate) struct BufferStorage {
    pub bytes: Rc<RefCell<Vec<u8>>>,
}

impl BufferStorage {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0u8; len])),
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), NativeError> {
        let mut bytes = self.bytes.borrow_mut();
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                NativeError::Validation(format!(
                    "write of {} bytes at offset {offset} exceeds buffer size {}",
                    data.len(),
                    bytes.len()
                ))
            })?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32, mips: u32) -> ImageDesc {
        ImageDesc {
            width,
            height,
            array_layers: 2,
            mip_levels: mips,
            sample_count: 1,
            format: NativeFormat::Rgba8Unorm,
            bind: BindFlags::SHADER_RESOURCE,
        }
    }

    #[test]
    fn mip_chain_sizes_shrink_and_clamp() {
        let d = desc(8, 4, 4);
        assert_eq!(d.mip_extent(0), (8, 4));
        assert_eq!(d.mip_extent(2), (2, 1));
        assert_eq!(d.mip_extent(3), (1, 1));
        assert_eq!(d.subresource_len(3), 4);
    }

    #[test]
    fn oversized_mip_count_is_rejected() {
        assert!(Image::new(desc(8, 4, 5)).is_err());
    }

    #[test]
    fn subresource_upload_requires_exact_size() {
        let image = Image::new(desc(4, 4, 1)).unwrap();
        assert!(image.write(0, 0, &[0u8; 63]).is_err());
        assert!(image.write(0, 0, &[7u8; 64]).is_ok());
        assert_eq!(image.read(0, 0).unwrap(), vec![7u8; 64]);
        assert_eq!(image.read(1, 0).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn buffer_writes_are_bounds_checked() {
        let buffer = BufferStorage::new(16);
        assert!(buffer.write(8, &[1u8; 8]).is_ok());
        assert!(buffer.write(9, &[1u8; 8]).is_err());
        assert!(buffer.write(usize::MAX, &[1]).is_err());
    }
}

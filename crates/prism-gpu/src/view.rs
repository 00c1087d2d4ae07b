//! Lightweight view handles and the per-texture view cache.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::types::{BackendKind, ViewKind};

/// A typed handle exposing one slice of a texture to a binding point.
///
/// Views are never independently owned: they are created and cached by their
/// parent texture and stay valid for the texture's lifetime. Cloning a view
/// clones the handle, not the underlying native object.
#[derive(Debug, Clone)]
pub struct TextureView {
    pub(crate) backend: BackendKind,
    pub(crate) kind: ViewKind,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) data: ViewData,
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum ViewData {
    Legacy(prism_native::legacy::LegacyViewId),
    Modern {
        heap: prism_native::modern::HeapId,
        index: u32,
    },
}

impl TextureView {
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Per-texture cache of views keyed by (kind, slice). Each key is populated
/// at most once; subsequent requests return the cached handle.
#[derive(Debug, Default)]
pub(crate) struct ViewCache {
    map: RefCell<HashMap<(ViewKind, u32), TextureView>>,
}

impl ViewCache {
    pub fn get(&self, kind: ViewKind, slice: u32) -> Option<TextureView> {
        self.map.borrow().get(&(kind, slice)).cloned()
    }

    pub fn insert(&self, kind: ViewKind, slice: u32, view: TextureView) {
        self.map.borrow_mut().insert((kind, slice), view);
    }
}

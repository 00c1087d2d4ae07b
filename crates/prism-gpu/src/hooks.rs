//! Event registration for external observers.
//!
//! A frame analyzer that watches the host application's rendering uses these
//! to be told when render targets are bound and textures copied. The hook
//! set is owned by its device instance; there is no process-wide hook state.

use std::cell::RefCell;

use crate::view::TextureView;

type RenderTargetHook = Box<dyn Fn(&TextureView)>;
type TextureCopiedHook = Box<dyn Fn()>;

/// Hook registration object. Callbacks run synchronously on the submitting
/// thread, after the triggering operation has been issued.
#[derive(Default)]
pub struct EventHooks {
    render_target_bound: RefCell<Vec<RenderTargetHook>>,
    texture_copied: RefCell<Vec<TextureCopiedHook>>,
}

impl EventHooks {
    pub fn on_render_target_bound(&self, hook: impl Fn(&TextureView) + 'static) {
        self.render_target_bound.borrow_mut().push(Box::new(hook));
    }

    pub fn on_texture_copied(&self, hook: impl Fn() + 'static) {
        self.texture_copied.borrow_mut().push(Box::new(hook));
    }

    pub(crate) fn emit_render_target_bound(&self, view: &TextureView) {
        for hook in self.render_target_bound.borrow().iter() {
            hook(view);
        }
    }

    pub(crate) fn emit_texture_copied(&self) {
        for hook in self.texture_copied.borrow().iter() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn copied_hooks_fire_in_registration_order() {
        let hooks = EventHooks::default();
        let count = Rc::new(Cell::new(0u32));
        for _ in 0..3 {
            let count = count.clone();
            hooks.on_texture_copied(move || count.set(count.get() + 1));
        }
        hooks.emit_texture_copied();
        assert_eq!(count.get(), 3);
    }
}

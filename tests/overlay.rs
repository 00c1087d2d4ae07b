//! Fixed-function overlay path, render-target events, context save/restore
//! and device teardown.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::*;
use prism::{GpuError, MeshVertex, TextureUsage, ViewKind};

fn full_screen_quad() -> (Vec<MeshVertex>, Vec<u16>) {
    let color = [0.0, 1.0, 0.0, 1.0];
    let vertices = vec![
        MeshVertex { position: [-1.0, -1.0], color },
        MeshVertex { position: [1.0, -1.0], color },
        MeshVertex { position: [-1.0, 1.0], color },
        MeshVertex { position: [1.0, 1.0], color },
    ];
    let indices = vec![0, 1, 2, 2, 1, 3];
    (vertices, indices)
}

fn texel(pixels: &[u8], width: u32, x: u32, y: u32) -> &[u8] {
    let offset = ((y * width + x) * 4) as usize;
    &pixels[offset..offset + 4]
}

#[test]
fn clear_render_target_fills_with_the_requested_color() {
    for device in devices() {
        let rt = device
            .create_texture(
                &rgba_desc(16, 16, TextureUsage::RENDER_TARGET | TextureUsage::TRANSFER),
                None,
            )
            .unwrap();
        let rtv = rt.view(ViewKind::RenderTarget).unwrap();
        device.clear_render_target(&rtv, [1.0, 0.0, 0.0, 1.0]).unwrap();
        device.flush(true, false).unwrap();

        let pixels = device.read_texture(&rt, 0).unwrap();
        for texel in pixels.chunks_exact(4) {
            assert_eq!(texel, [255, 0, 0, 255]);
        }
    }
}

#[test]
fn mesh_overlay_draws_into_the_bound_render_target() {
    for device in devices() {
        let (vertices, indices) = full_screen_quad();
        let mesh = device.create_mesh(&vertices, &indices).unwrap();
        assert_eq!(mesh.index_count(), 6);

        let rt = device
            .create_texture(
                &rgba_desc(64, 64, TextureUsage::RENDER_TARGET | TextureUsage::TRANSFER),
                None,
            )
            .unwrap();
        let rtv = rt.view(ViewKind::RenderTarget).unwrap();

        device.clear_render_target(&rtv, [0.0, 0.0, 0.0, 1.0]).unwrap();
        device.set_render_target(Some(&rtv), None).unwrap();
        device.draw_mesh(&mesh).unwrap();
        device.flush(true, false).unwrap();

        // Sample one point per quadrant; the seam between the two triangles
        // is not probed.
        let pixels = device.read_texture(&rt, 0).unwrap();
        for (x, y) in [(16, 16), (48, 16), (16, 48), (48, 48)] {
            assert_eq!(texel(&pixels, 64, x, y), [0, 255, 0, 255], "at ({x}, {y})");
        }
    }
}

#[test]
fn draw_mesh_without_render_target_fails() {
    for device in devices() {
        let (vertices, indices) = full_screen_quad();
        let mesh = device.create_mesh(&vertices, &indices).unwrap();
        let result = device
            .draw_mesh(&mesh)
            .and_then(|_| device.flush(true, false));
        assert!(result.is_err());
    }
}

#[test]
fn render_target_bound_hook_observes_the_view() {
    for device in devices() {
        let rt = device
            .create_texture(&rgba_desc(32, 32, TextureUsage::RENDER_TARGET), None)
            .unwrap();
        let rtv = rt.view(ViewKind::RenderTarget).unwrap();

        let seen = Rc::new(Cell::new(None));
        let sink = seen.clone();
        device
            .hooks()
            .on_render_target_bound(move |view| sink.set(Some(view.extent())));

        device.set_render_target(Some(&rtv), None).unwrap();
        assert_eq!(seen.get(), Some((32, 32)));
    }
}

#[test]
fn context_save_and_restore_pair_up() {
    for device in devices() {
        device.save_context().unwrap();
        device.restore_context().unwrap();

        let err = device.restore_context().unwrap_err();
        assert!(matches!(err, GpuError::Capability { .. }));
    }
}

#[test]
fn restore_clears_the_current_shader() {
    for device in devices() {
        let shader = quad_shader(&device, GREEN_QUAD_KERNEL, "fill_green");
        device.save_context().unwrap();
        device.set_shader(&shader).unwrap();
        device.restore_context().unwrap();

        let err = device.dispatch_shader().unwrap_err();
        assert!(matches!(err, GpuError::Capability { .. }));
    }
}

#[test]
fn shutdown_poisons_every_subsequent_operation() {
    for device in devices() {
        device.shutdown();
        assert!(matches!(
            device.create_buffer(16, None, false),
            Err(GpuError::DeviceShutDown)
        ));
        assert!(matches!(
            device.flush(true, false),
            Err(GpuError::DeviceShutDown)
        ));
    }
}

#[test]
fn flush_count_is_observable() {
    for device in devices() {
        device.flush(false, false).unwrap();
        device.flush(true, true).unwrap();
        assert_eq!(device.stats().flushes, 2);
    }
}

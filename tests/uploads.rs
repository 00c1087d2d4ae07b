//! Upload and readback paths: buffer round-trips, texture initial data,
//! constants feeding a dispatch, and the texture copy path.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::*;
use prism::{GpuError, TextureUsage, ViewKind};

#[test]
fn buffer_round_trip_across_sizes() {
    for device in devices() {
        for size in [16usize, 256, 65536] {
            let data = pattern(size);
            let buffer = device.create_buffer(size, Some(&data), true).unwrap();
            assert_eq!(buffer.len(), size);
            assert!(buffer.is_immutable());
            assert_eq!(device.read_buffer(&buffer).unwrap(), data);
        }
    }
}

#[test]
fn immutable_buffer_requires_initial_data() {
    for device in devices() {
        assert!(matches!(
            device.create_buffer(64, None, true),
            Err(GpuError::ImmutableWithoutData)
        ));
    }
}

#[test]
fn mutable_buffer_update_round_trip() {
    for device in devices() {
        let buffer = device.create_buffer(32, None, false).unwrap();
        let data = pattern(32);
        buffer.update(&data).unwrap();
        assert_eq!(device.read_buffer(&buffer).unwrap(), data);
    }
}

#[test]
fn immutable_buffer_rejects_update() {
    for device in devices() {
        let buffer = device.create_buffer(16, Some(&pattern(16)), true).unwrap();
        let err = buffer.update(&pattern(16)).unwrap_err();
        assert!(matches!(err, GpuError::Capability { .. }));
    }
}

#[test]
fn texture_initial_data_survives_readback() {
    for device in devices() {
        let desc = rgba_desc(256, 256, TextureUsage::SAMPLED | TextureUsage::TRANSFER);
        let data = pattern(desc.top_level_len());
        let texture = device.create_texture(&desc, Some(&data)).unwrap();
        assert_eq!(device.read_texture(&texture, 0).unwrap(), data);
    }
}

#[test]
fn constants_scale_the_dispatch_output() {
    const SCALE_KERNEL: &str = "\
kernel main
    ld r0, t0
    ldc r1, c0[0]
    mul r0, r0, r1
    st u0, r0
end
";
    for device in devices() {
        let shader = compute_shader(&device, SCALE_KERNEL, "scale");
        let desc = rgba_desc(8, 8, TextureUsage::SAMPLED);
        let src = device
            .create_texture(&desc, Some(&vec![128u8; desc.top_level_len()]))
            .unwrap();
        let dst = device
            .create_texture(&rgba_desc(8, 8, TextureUsage::UNORDERED_ACCESS), None)
            .unwrap();
        let scale: [f32; 4] = [0.5, 0.5, 0.5, 0.5];
        let constants = device
            .create_buffer(16, Some(bytemuck::cast_slice(&scale)), true)
            .unwrap();

        device.set_shader(&shader).unwrap();
        device
            .set_shader_input(0, &src.view(ViewKind::ShaderInput).unwrap())
            .unwrap();
        device
            .set_shader_output(0, &dst.view(ViewKind::ComputeOutput).unwrap())
            .unwrap();
        device.set_shader_constants(0, &constants).unwrap();
        device.dispatch_shader().unwrap();
        device.flush(true, false).unwrap();

        let pixels = device.read_texture(&dst, 0).unwrap();
        // 128 -> 0.502 scaled by 0.5, re-encoded to unorm8.
        assert!(pixels.iter().all(|&b| b == 64), "got {:?}", &pixels[..4]);
    }
}

#[test]
fn copy_texture_duplicates_contents_and_fires_the_hook() {
    for device in devices() {
        let desc = rgba_desc(64, 64, TextureUsage::SAMPLED | TextureUsage::TRANSFER);
        let data = pattern(desc.top_level_len());
        let src = device.create_texture(&desc, Some(&data)).unwrap();
        let dst = device.create_texture(&desc, None).unwrap();

        let copies = Rc::new(Cell::new(0u32));
        let observed = copies.clone();
        device
            .hooks()
            .on_texture_copied(move || observed.set(observed.get() + 1));

        device.copy_texture(&src, &dst).unwrap();
        device.flush(true, false).unwrap();

        assert_eq!(copies.get(), 1);
        assert_eq!(device.read_texture(&dst, 0).unwrap(), data);
    }
}

#[test]
fn copy_texture_rejects_mismatched_extents() {
    for device in devices() {
        let src = device
            .create_texture(&rgba_desc(32, 32, TextureUsage::TRANSFER), None)
            .unwrap();
        let dst = device
            .create_texture(&rgba_desc(16, 16, TextureUsage::TRANSFER), None)
            .unwrap();
        let result = device
            .copy_texture(&src, &dst)
            .and_then(|_| device.flush(true, false));
        assert!(result.is_err());
    }
}

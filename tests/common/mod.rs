#![allow(dead_code)]

use std::rc::Rc;

use prism::prism_native::legacy::LegacyDevice;
use prism::prism_native::modern::ModernDevice;
use prism::{
    open_device, Device, NativeHandle, Shader, ShaderDesc, TextureDesc, TextureFormat,
    TextureUsage,
};

pub const COPY_KERNEL: &str = "\
kernel main
    ld r0, t0
    st u0, r0
end
";

pub const ADD_KERNEL: &str = "\
kernel main
    ld r0, t0
    ld r1, t1
    add r0, r0, r1
    st u0, r0
end
";

pub const GREEN_QUAD_KERNEL: &str = "\
kernel main
    movi r0, 0.0, 1.0, 0.0, 1.0
    st u0, r0
end
";

/// Route device debug logs through the test harness; safe to call from
/// every test, only the first registration wins.
fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn immediate_device() -> Rc<dyn Device> {
    init_logging();
    open_device(NativeHandle::Legacy(LegacyDevice::new())).unwrap()
}

pub fn explicit_device() -> Rc<dyn Device> {
    init_logging();
    open_device(NativeHandle::Modern(ModernDevice::new())).unwrap()
}

/// One device per backend; protocol tests run against both.
pub fn devices() -> Vec<Rc<dyn Device>> {
    vec![immediate_device(), explicit_device()]
}

pub fn compute_shader(device: &Rc<dyn Device>, source: &str, name: &str) -> Rc<dyn Shader> {
    device
        .create_compute_shader(
            &ShaderDesc {
                source,
                entry: "main",
                name,
                defines: &[],
            },
            [8, 8, 1],
        )
        .unwrap()
}

pub fn quad_shader(device: &Rc<dyn Device>, source: &str, name: &str) -> Rc<dyn Shader> {
    device
        .create_quad_shader(&ShaderDesc {
            source,
            entry: "main",
            name,
            defines: &[],
        })
        .unwrap()
}

pub fn rgba_desc(width: u32, height: u32, usage: TextureUsage) -> TextureDesc {
    TextureDesc::new(width, height, TextureFormat::Rgba8Unorm, usage)
}

/// Deterministic byte pattern for upload/readback comparisons.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 13) as u8).collect()
}

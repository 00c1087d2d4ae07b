//! Pixel format descriptions and texel conversion.
//!
//! The engine interprets every texel as an RGBA vec4 of f32; formats only
//! change the storage encoding. The set below is the one the compositor
//! actually meets: swapchain color formats plus the float formats the
//! upscalers render into.

/// Storage format of a native image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NativeFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
}

impl NativeFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            NativeFormat::Rgba8Unorm | NativeFormat::Bgra8Unorm => 4,
            NativeFormat::Rgba16Float => 8,
            NativeFormat::R32Float => 4,
        }
    }
}

/// Decode one texel into an RGBA vec4. `bytes` must hold
/// `format.bytes_per_texel()` bytes.
pub(crate) fn decode_texel(format: NativeFormat, bytes: &[u8]) -> [f32; 4] {
    match format {
        NativeFormat::Rgba8Unorm => [
            unorm8_to_f32(bytes[0]),
            unorm8_to_f32(bytes[1]),
            unorm8_to_f32(bytes[2]),
            unorm8_to_f32(bytes[3]),
        ],
        NativeFormat::Bgra8Unorm => [
            unorm8_to_f32(bytes[2]),
            unorm8_to_f32(bytes[1]),
            unorm8_to_f32(bytes[0]),
            unorm8_to_f32(bytes[3]),
        ],
        NativeFormat::Rgba16Float => [
            f16_to_f32(u16::from_le_bytes([bytes[0], bytes[1]])),
            f16_to_f32(u16::from_le_bytes([bytes[2], bytes[3]])),
            f16_to_f32(u16::from_le_bytes([bytes[4], bytes[5]])),
            f16_to_f32(u16::from_le_bytes([bytes[6], bytes[7]])),
        ],
        NativeFormat::R32Float => [
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            0.0,
            0.0,
            1.0,
        ],
    }
}

/// Encode an RGBA vec4 into `out`, which must hold
/// `format.bytes_per_texel()` bytes.
pub(crate) fn encode_texel(format: NativeFormat, value: [f32; 4], out: &mut [u8]) {
    match format {
        NativeFormat::Rgba8Unorm => {
            out[0] = f32_to_unorm8(value[0]);
            out[1] = f32_to_unorm8(value[1]);
            out[2] = f32_to_unorm8(value[2]);
            out[3] = f32_to_unorm8(value[3]);
        }
        NativeFormat::Bgra8Unorm => {
            out[0] = f32_to_unorm8(value[2]);
            out[1] = f32_to_unorm8(value[1]);
            out[2] = f32_to_unorm8(value[0]);
            out[3] = f32_to_unorm8(value[3]);
        }
        NativeFormat::Rgba16Float => {
            for (i, component) in value.iter().enumerate() {
                out[i * 2..i * 2 + 2].copy_from_slice(&f32_to_f16(*component).to_le_bytes());
            }
        }
        NativeFormat::R32Float => {
            out[..4].copy_from_slice(&value[0].to_le_bytes());
        }
    }
}

fn unorm8_to_f32(v: u8) -> f32 {
    f32::from(v) / 255.0
}

fn f32_to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// IEEE 754 binary16 → binary32. Handles subnormals and infinities; NaN
/// payloads are not preserved.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = (bits >> 10) & 0x1F;
    let mant = u32::from(bits & 0x3FF);

    let magnitude = match (exp, mant) {
        (0, 0) => 0,
        (0, m) => {
            // Subnormal: value is m * 2^-24; renormalize around the highest
            // set bit of the 10-bit mantissa.
            let top_bit = 31 - m.leading_zeros();
            let exp32 = top_bit + 103; // top_bit - 24 + 127
            let mant32 = (m << (23 - top_bit)) & 0x7F_FFFF;
            (exp32 << 23) | mant32
        }
        (0x1F, 0) => 0xFF << 23,
        (0x1F, _) => (0xFF << 23) | (mant << 13) | 1,
        (e, m) => ((u32::from(e) + 127 - 15) << 23) | (m << 13),
    };
    f32::from_bits(sign | magnitude)
}

/// IEEE 754 binary32 → binary16 with round-to-nearest-even.
fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 31) as u16) << 15;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mant = bits & 0x7F_FFFF;

    if exp == 0xFF {
        // Inf / NaN.
        let payload = if mant == 0 { 0 } else { 0x200 };
        return sign | 0x7C00 | payload;
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00; // overflow to infinity
    }
    if unbiased >= -14 {
        let half_exp = (unbiased + 15) as u32;
        // Rounding may carry into the exponent; the plain addition then
        // produces the correctly incremented encoding (up to infinity).
        let encoded = (half_exp << 10) + round_mantissa(mant, 13);
        return sign | encoded as u16;
    }
    if unbiased >= -24 {
        // Subnormal half: value is (mant | implicit) * 2^(unbiased - 23),
        // quantized to the subnormal ULP of 2^-24.
        let drop_bits = (-unbiased - 1) as u32;
        return sign | round_mantissa(mant | 0x80_0000, drop_bits) as u16;
    }
    sign // underflow to zero
}

fn round_mantissa(mant: u32, drop_bits: u32) -> u32 {
    let kept = mant >> drop_bits;
    let half = 1u32 << (drop_bits - 1);
    let rem = mant & ((1 << drop_bits) - 1);
    if rem > half || (rem == half && kept & 1 == 1) {
        kept + 1
    } else {
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba8_round_trips_exact_bytes() {
        let bytes = [0u8, 64, 128, 255];
        let v = decode_texel(NativeFormat::Rgba8Unorm, &bytes);
        let mut out = [0u8; 4];
        encode_texel(NativeFormat::Rgba8Unorm, v, &mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn bgra8_swizzles_red_and_blue() {
        let v = decode_texel(NativeFormat::Bgra8Unorm, &[255, 0, 0, 255]);
        assert_eq!(v, [0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn f16_round_trips_common_values() {
        for v in [0.0f32, 1.0, 0.5, -2.0, 0.25, 65504.0] {
            assert_eq!(f16_to_f32(f32_to_f16(v)), v, "value {v}");
        }
    }

    #[test]
    fn f16_overflow_saturates_to_infinity() {
        assert!(f16_to_f32(f32_to_f16(1e9)).is_infinite());
    }

    #[test]
    fn rgba16f_encodes_per_component() {
        let mut out = [0u8; 8];
        encode_texel(NativeFormat::Rgba16Float, [1.0, 0.5, 0.0, 1.0], &mut out);
        let v = decode_texel(NativeFormat::Rgba16Float, &out);
        assert_eq!(v, [1.0, 0.5, 0.0, 1.0]);
    }
}

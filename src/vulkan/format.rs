//! Format conversions between Vulkan and DRM formats.

/// Macro to generate format conversions between Vulkan and FourCC format codes.
///
/// Listed Vulkan formats map onto one FourCC code each; the reverse lookup
/// returns the first listed Vulkan format for a code. Conversions may carry
/// attributes, which is needed for `PACK` formats that only exist on a
/// specific host endian.
macro_rules! vk_format_table {
    (
        $(
            $(#[$conv_meta:meta])*
            $vk: ident => $fourcc: ident
        ),* $(,)?
    ) => {
        /// Converts a Vulkan format to a FourCC format code.
        ///
        /// This will return [`None`] if the format is not known.
        pub const fn drm_fourcc(vk: ash::vk::Format) -> Option<$crate::allocator::Fourcc> {
            match vk {
                $(
                    $(#[$conv_meta])*
                    ash::vk::Format::$vk => Some($crate::allocator::Fourcc::$fourcc),
                )*

                _ => None,
            }
        }
    };
}

// The UNORM/SRGB split does not exist in FourCC space; both collapse onto the
// same code. Many of these conversions come from wsi_common_wayland.c in Mesa.
vk_format_table! {
    B8G8R8A8_UNORM => Argb8888,
    B8G8R8A8_SRGB => Argb8888,

    R8G8B8A8_UNORM => Abgr8888,
    R8G8B8A8_SRGB => Abgr8888,

    // PACK32 formats are equivalent to u32 instead of [u8; 4], so their
    // layout depends on the host endian.
    #[cfg(target_endian = "little")]
    A8B8G8R8_UNORM_PACK32 => Rgba8888,
    #[cfg(target_endian = "little")]
    A8B8G8R8_SRGB_PACK32 => Rgba8888,

    #[cfg(target_endian = "little")]
    A2R10G10B10_UNORM_PACK32 => Argb2101010,

    #[cfg(target_endian = "little")]
    A2B10G10R10_UNORM_PACK32 => Abgr2101010,

    #[cfg(target_endian = "little")]
    R5G6B5_UNORM_PACK16 => Rgb565,
}

#[cfg(test)]
mod tests {
    use crate::allocator::Fourcc;

    use super::*;

    #[test]
    fn unorm_and_srgb_share_a_code() {
        assert_eq!(drm_fourcc(ash::vk::Format::B8G8R8A8_UNORM), Some(Fourcc::Argb8888));
        assert_eq!(drm_fourcc(ash::vk::Format::B8G8R8A8_SRGB), Some(Fourcc::Argb8888));
    }

    #[test]
    fn unknown_formats_have_no_code() {
        assert_eq!(drm_fourcc(ash::vk::Format::D32_SFLOAT), None);
    }
}

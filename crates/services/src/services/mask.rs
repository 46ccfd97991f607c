use image::{GenericImageView, ImageEncoder, imageops::FilterType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("Failed to decode mask image: {0}")]
    Decode(image::ImageError),
    #[error("Failed to encode aligned mask: {0}")]
    Encode(image::ImageError),
    #[error("Target dimensions {0}x{1} are empty")]
    EmptyTarget(u32, u32),
}

/// Pixel dimensions of an encoded image.
pub fn dimensions_of(bytes: &[u8]) -> Result<(u32, u32), MaskError> {
    let decoded = image::load_from_memory(bytes).map_err(MaskError::Decode)?;
    Ok(decoded.dimensions())
}

/// Stretches a mask to exactly `target_width x target_height` and re-encodes
/// it as a single-channel PNG. Aspect ratio is not preserved; the model
/// expects the mask grid to line up with the source pixel grid.
///
/// Deterministic: the same input and target size produce identical bytes.
pub fn align_mask(
    mask_bytes: &[u8],
    target_width: u32,
    target_height: u32,
) -> Result<Vec<u8>, MaskError> {
    if target_width == 0 || target_height == 0 {
        return Err(MaskError::EmptyTarget(target_width, target_height));
    }

    let decoded = image::load_from_memory(mask_bytes).map_err(MaskError::Decode)?;
    let gray = decoded.to_luma8();

    let aligned = if gray.dimensions() == (target_width, target_height) {
        gray
    } else {
        image::imageops::resize(&gray, target_width, target_height, FilterType::Triangle)
    };

    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder
        .write_image(
            aligned.as_raw(),
            target_width,
            target_height,
            image::ExtendedColorType::L8,
        )
        .map_err(MaskError::Encode)?;

    Ok(png_bytes)
}

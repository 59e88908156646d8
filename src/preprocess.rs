use image::imageops::FilterType;

use crate::error::ServiceError;
use crate::model::{ImageTensor, IMAGE_DIMENSIONS};

/// Decodes an uploaded image into the tensor the model expects.
///
/// The image is squashed to 224x224 without preserving its aspect ratio,
/// matching how the training data was prepared.
pub fn preprocess_image(image_data: &[u8]) -> Result<ImageTensor, ServiceError> {
    let img = image::load_from_memory(image_data)?;

    let rgb = img.to_rgb8();
    let resized = image::imageops::resize(
        &rgb,
        IMAGE_DIMENSIONS.0 as u32,
        IMAGE_DIMENSIONS.1 as u32,
        FilterType::CatmullRom,
    );

    let values: Vec<f32> = resized
        .into_raw()
        .into_iter()
        .map(|x| x as f32 / 255.0)
        .collect();

    Ok(ImageTensor::new(values)?)
}

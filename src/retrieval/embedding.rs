use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::{Error, Result};

/// Maps an image to a fixed-length vector. The indexer and the online path
/// must use the same embedder for distances to mean anything.
pub trait ImageEmbedder: Send + Sync {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn embed_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| Error::Embedding(format!("unreadable image: {}", e)))?;
        self.embed(&img)
    }
}

const THUMB_SIDE: u32 = 16;
const HISTOGRAM_BINS: usize = 8;

/// Deterministic local embedder: a mean-centred 16x16 grayscale thumbnail
/// (layout) followed by an 8-bin histogram per RGB channel (palette),
/// L2-normalised. 280 values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFeatureEmbedder;

impl ImageFeatureEmbedder {
    pub const DIMENSIONS: usize = (THUMB_SIDE * THUMB_SIDE) as usize + 3 * HISTOGRAM_BINS;
}

impl ImageEmbedder for ImageFeatureEmbedder {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Embedding("image has no pixels".to_string()));
        }

        let mut features = Vec::with_capacity(Self::DIMENSIONS);

        let thumb = image
            .resize_exact(THUMB_SIDE, THUMB_SIDE, FilterType::Triangle)
            .to_luma8();
        let luma: Vec<f32> = thumb.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        let mean = luma.iter().sum::<f32>() / luma.len() as f32;
        features.extend(luma.iter().map(|v| v - mean));

        let rgb = image.to_rgb8();
        let mut histogram = [[0u32; HISTOGRAM_BINS]; 3];
        for pixel in rgb.pixels() {
            for (channel, value) in pixel.0.iter().enumerate() {
                let bin = (*value as usize * HISTOGRAM_BINS) / 256;
                histogram[channel][bin] += 1;
            }
        }
        let total = (rgb.width() * rgb.height()) as f32;
        for channel in histogram {
            features.extend(channel.iter().map(|count| *count as f32 / total));
        }

        let norm = features.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in features.iter_mut() {
                *v /= norm;
            }
        }
        Ok(features)
    }

    fn dimensions(&self) -> usize {
        Self::DIMENSIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cosine_distance;
    use image::{Rgb, RgbImage};

    fn gradient(flip: bool, tint: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, _| {
            let v = (if flip { 255 - x * 4 } else { x * 4 }) as u8;
            Rgb([v, v / 2, tint])
        }))
    }

    #[test]
    fn test_embedding_is_normalised_and_fixed_length() {
        let v = ImageFeatureEmbedder.embed(&gradient(false, 10)).unwrap();
        assert_eq!(v.len(), ImageFeatureEmbedder::DIMENSIONS);
        assert_eq!(v.len(), 280);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_similar_images_are_closer() {
        let base = ImageFeatureEmbedder.embed(&gradient(false, 10)).unwrap();
        let retinted = ImageFeatureEmbedder.embed(&gradient(false, 30)).unwrap();
        let mirrored = ImageFeatureEmbedder.embed(&gradient(true, 200)).unwrap();

        assert!(cosine_distance(&base, &retinted) < cosine_distance(&base, &mirrored));
    }

    #[test]
    fn test_embed_bytes_rejects_garbage() {
        assert!(matches!(
            ImageFeatureEmbedder.embed_bytes(b"nope"),
            Err(Error::Embedding(_))
        ));
    }
}

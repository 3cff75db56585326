use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference session error: {0}")]
    Session(#[from] ort::Error),
    #[error("tensor layout error: {0}")]
    Tensor(String),
    #[error("inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Seam between the HTTP layer and the inference engine. Handlers only see
/// this trait, so tests can swap in a mock upscaler.
#[async_trait]
pub trait Upscaler: Send + Sync + 'static {
    async fn upscale(
        &self,
        image: DynamicImage,
        outscale: f32,
    ) -> Result<DynamicImage, InferenceError>;
}

/// Output resolution for a requested scale factor, rounded to whole pixels.
pub(crate) fn output_dimensions(width: u32, height: u32, outscale: f32) -> (u32, u32) {
    let w = (width as f32 * outscale).round().max(1.0) as u32;
    let h = (height as f32 * outscale).round().max(1.0) as u32;
    (w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dimensions_scales_and_rounds() {
        assert_eq!(output_dimensions(100, 100, 2.0), (200, 200));
        assert_eq!(output_dimensions(100, 100, 4.0), (400, 400));
        assert_eq!(output_dimensions(100, 50, 1.5), (150, 75));
        assert_eq!(output_dimensions(33, 33, 0.1), (3, 3));
    }

    #[test]
    fn output_dimensions_never_collapses_to_zero() {
        assert_eq!(output_dimensions(4, 4, 0.01), (1, 1));
    }
}

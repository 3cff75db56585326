use crate::server::SharedState;
use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use image::ImageFormat;
use serde::Deserialize;
use std::io::Cursor;
use thiserror::Error;
use tracing::instrument;

const DEFAULT_OUTSCALE: f32 = 2.0;

#[derive(Debug, Deserialize)]
pub struct UpscaleParams {
    outscale: Option<f32>,
}

#[derive(Error, Debug)]
pub enum UpscaleRequestError {
    #[error("Empty file")]
    EmptyPayload,
    #[error("Could not decode image")]
    Decode(#[source] image::ImageError),
    #[error("outscale must be a positive, finite number")]
    InvalidOutscale,
    #[error("Malformed multipart upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Upscale failed internally")]
    Internal,
    #[error("Failed to encode output image")]
    Encode(#[source] image::ImageError),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

impl UpscaleRequestError {
    fn status(&self) -> StatusCode {
        match self {
            Self::EmptyPayload
            | Self::Decode(_)
            | Self::InvalidOutscale
            | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            Self::Internal | Self::Encode(_) | Self::HttpBuilder(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for UpscaleRequestError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn upscale_image(
    State(state): State<SharedState>,
    Query(params): Query<UpscaleParams>,
    mut multipart: Multipart,
) -> Result<Response, UpscaleRequestError> {
    let mut payload: Option<Bytes> = None;
    let mut outscale = params.outscale;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => payload = Some(field.bytes().await?),
            Some("outscale") => {
                let text = field.text().await?;
                outscale = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| UpscaleRequestError::InvalidOutscale)?,
                );
            }
            _ => {}
        }
    }

    let data = payload.unwrap_or_default();
    if data.is_empty() {
        return Err(UpscaleRequestError::EmptyPayload);
    }

    let outscale = outscale.unwrap_or(DEFAULT_OUTSCALE);
    if !outscale.is_finite() || outscale <= 0.0 {
        return Err(UpscaleRequestError::InvalidOutscale);
    }

    let image = image::ImageReader::new(Cursor::new(&data[..]))
        .with_guessed_format()
        .map_err(|e| UpscaleRequestError::Decode(image::ImageError::IoError(e)))?
        .decode()
        .map_err(UpscaleRequestError::Decode)?;

    tracing::debug!(
        width = image.width(),
        height = image.height(),
        outscale,
        "Upscaling uploaded image"
    );

    let output = state
        .upscaler
        .upscale(image, outscale)
        .await
        .map_err(|e| {
            // Full detail stays server-side; the caller gets a generic error.
            tracing::error!(error = %e, "Upscale failed");
            UpscaleRequestError::Internal
        })?;

    let mut png = Vec::new();
    output
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(UpscaleRequestError::Encode)?;

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(png))
        .map_err(|e| UpscaleRequestError::HttpBuilder(e.to_string()))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::api_routes;
    use crate::upscaler::{output_dimensions, InferenceError, Upscaler};
    use async_trait::async_trait;
    use axum::{http::Request, Router};
    use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct MockUpscaler {
        fail: bool,
    }

    #[async_trait]
    impl Upscaler for MockUpscaler {
        async fn upscale(
            &self,
            image: DynamicImage,
            outscale: f32,
        ) -> Result<DynamicImage, InferenceError> {
            if self.fail {
                return Err(InferenceError::Tensor("mock inference failure".into()));
            }
            let (w, h) = image.dimensions();
            let (tw, th) = output_dimensions(w, h, outscale);
            Ok(image.resize_exact(tw, th, FilterType::Nearest))
        }
    }

    fn test_router(fail: bool) -> Router {
        Router::new()
            .merge(api_routes())
            .with_state(SharedState {
                upscaler: Arc::new(MockUpscaler { fail }),
            })
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 40, 200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 40, 200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    fn multipart_request(
        uri: &str,
        file: Option<&[u8]>,
        outscale_field: Option<&str>,
    ) -> Request<Body> {
        let boundary = "upscale-test-boundary";
        let mut body = Vec::new();
        if let Some(data) = file {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                     filename=\"input.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        if let Some(scale) = outscale_field {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; \
                     name=\"outscale\"\r\n\r\n{scale}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn default_outscale_doubles_dimensions() {
        let app = test_router(false);
        let request = multipart_request("/upscale/", Some(&png_bytes(100, 100)), None);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );

        let body = body_bytes(response).await;
        let output = image::load_from_memory(&body).unwrap();
        assert_eq!(output.dimensions(), (200, 200));
    }

    #[tokio::test]
    async fn explicit_outscale_field_is_honored() {
        let app = test_router(false);
        let request = multipart_request("/upscale/", Some(&png_bytes(100, 100)), Some("4.0"));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_bytes(response).await;
        let output = image::load_from_memory(&body).unwrap();
        assert_eq!(output.dimensions(), (400, 400));
    }

    #[tokio::test]
    async fn outscale_query_parameter_is_honored() {
        let app = test_router(false);
        let request = multipart_request("/upscale/?outscale=3.0", Some(&png_bytes(10, 20)), None);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_bytes(response).await;
        let output = image::load_from_memory(&body).unwrap();
        assert_eq!(output.dimensions(), (30, 60));
    }

    #[tokio::test]
    async fn empty_file_yields_400_with_detail() {
        let app = test_router(false);
        let request = multipart_request("/upscale/", Some(b""), None);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_bytes(response).await;
        assert!(String::from_utf8_lossy(&body).contains("Empty file"));
    }

    #[tokio::test]
    async fn missing_file_field_yields_400() {
        let app = test_router(false);
        let request = multipart_request("/upscale/", None, Some("2.0"));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_image_bytes_yield_400_not_500() {
        let app = test_router(false);
        let request = multipart_request("/upscale/", Some(b"definitely not an image"), None);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_bytes(response).await;
        assert!(String::from_utf8_lossy(&body).contains("decode"));
    }

    #[tokio::test]
    async fn jpeg_upload_still_returns_png() {
        let app = test_router(false);
        let request = multipart_request("/upscale/", Some(&jpeg_bytes(50, 50)), None);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );

        let body = body_bytes(response).await;
        assert_eq!(
            image::guess_format(&body).unwrap(),
            image::ImageFormat::Png
        );
    }

    #[tokio::test]
    async fn non_positive_outscale_yields_400() {
        for scale in ["0", "-2.0", "NaN"] {
            let app = test_router(false);
            let request = multipart_request("/upscale/", Some(&png_bytes(10, 10)), Some(scale));

            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "scale={scale}");
        }
    }

    #[tokio::test]
    async fn repeated_identical_requests_yield_identical_bytes() {
        let payload = png_bytes(12, 12);
        let mut bodies = Vec::new();
        for _ in 0..2 {
            let app = test_router(false);
            let request = multipart_request("/upscale/", Some(&payload), Some("2.0"));
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            bodies.push(body_bytes(response).await);
        }
        assert_eq!(bodies[0], bodies[1]);
    }

    #[tokio::test]
    async fn inference_failure_is_normalized_to_generic_500() {
        let app = test_router(true);
        let request = multipart_request("/upscale/", Some(&png_bytes(10, 10)), None);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_bytes(response).await;
        let detail = String::from_utf8_lossy(&body);
        assert_eq!(detail, "Upscale failed internally");
        assert!(!detail.contains("mock inference failure"));
    }
}

mod health;
mod upscale;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/upscale/", post(upscale::upscale_image))
        .route("/health", get(health::healthcheck))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upscaler::{InferenceError, Upscaler};
    use async_trait::async_trait;
    use axum::{body::Body, http::Request, http::StatusCode};
    use image::DynamicImage;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NoopUpscaler;

    #[async_trait]
    impl Upscaler for NoopUpscaler {
        async fn upscale(
            &self,
            image: DynamicImage,
            _outscale: f32,
        ) -> Result<DynamicImage, InferenceError> {
            Ok(image)
        }
    }

    #[tokio::test]
    async fn healthcheck_reports_available() {
        let app = Router::new().merge(api_routes()).with_state(SharedState {
            upscaler: Arc::new(NoopUpscaler),
        });

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: health::Health = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "Available");
    }
}

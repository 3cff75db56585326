use axum::{response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Health {
    pub status: String,
}

impl Health {
    fn available() -> Self {
        Self {
            status: "Available".into(),
        }
    }
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(Health::available())
}

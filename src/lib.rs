mod ort_service;
mod routes;
mod server;
mod upscaler;

pub mod app;
pub mod config;

pub use app::start_app;

use axum::extract::FromRequest;

use crate::errors::AppError;

pub mod admin;
pub mod check;
pub mod health;
pub mod rbac;

/// `Json` body extractor whose rejections use the API error envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

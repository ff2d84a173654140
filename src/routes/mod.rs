pub mod appointments;
pub mod invoices;
pub mod products;
pub mod reports;
pub mod services;
pub mod users;

use actix_multipart::form::MultipartFormConfig;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{AppError, AppResult};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _| {
        AppError::validation(format!("Invalid request body: {err}")).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _| {
        AppError::validation(format!("Invalid query string: {err}")).into()
    }))
    .app_data(web::PathConfig::default().error_handler(|err, _| {
        AppError::validation(format!("Invalid path: {err}")).into()
    }))
    .app_data(MultipartFormConfig::default().error_handler(|err, _| {
        AppError::validation(format!("Invalid form: {err}")).into()
    }))
    .service(web::resource("/health").route(web::get().to(health)))
        .configure(users::configure)
        .configure(appointments::configure)
        .configure(invoices::configure)
        .configure(services::configure)
        .configure(products::configure)
        .configure(reports::configure);
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// Accepts RFC 3339, or `YYYY-MM-DDTHH:MM[:SS]` without an offset, read as UTC.
pub fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .map(|naive| naive.and_utc())
        .map_err(|_| AppError::validation(format!("Invalid date/time: {value}")))
}

/// Trimmed value, or a validation error naming `field` when blank.
pub fn required(value: &str, field: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        Err(AppError::validation(format!("{field} is required")))
    } else {
        Ok(value.to_string())
    }
}

mod execute;
mod languages;

pub use execute::{ExecuteRequest, ExecuteResponse, execute_handler};
pub use languages::languages_handler;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, web};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        error: "invalid request body".to_string(),
    });
    InternalError::from_response(err, response).into()
}

/// Registers every route of the front door
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(execute_handler)
        .service(languages_handler);
}

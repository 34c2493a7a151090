use actix_web::http::StatusCode;
use actix_web::{HttpResponse, post, web};
use serde::{Deserialize, Serialize};

use super::ErrorResponse;
use crate::executor::{ExecutionRequest, Executor};
use crate::web_server::ExecutionLimiter;

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: Option<String>,
    pub language: Option<String>,
    pub input: Option<String>,
    pub template_id: Option<i64>,
}

impl From<ExecuteRequest> for ExecutionRequest {
    fn from(body: ExecuteRequest) -> Self {
        Self {
            code: body.code,
            language: body.language,
            stdin: body.input,
            template_id: body.template_id,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
}

#[post("/execute")]
pub async fn execute_handler(
    executor: web::Data<Executor>,
    limiter: web::Data<ExecutionLimiter>,
    body: web::Json<ExecuteRequest>,
) -> HttpResponse {
    let _permit = limiter.acquire().await;

    let result = executor.execute(body.into_inner().into()).await;

    if result.is_success() {
        return HttpResponse::Ok().json(ExecuteResponse {
            stdout: result.stdout,
            stderr: result.stderr,
        });
    }

    let status =
        StatusCode::from_u16(result.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(ErrorResponse {
        error: result.error_message(),
    })
}

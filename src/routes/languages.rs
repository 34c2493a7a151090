use actix_web::{HttpResponse, get, web};

use crate::executor::Executor;
use crate::language::LanguageSummary;

#[get("/languages")]
pub async fn languages_handler(executor: web::Data<Executor>) -> HttpResponse {
    let languages: Vec<LanguageSummary> = executor
        .registry()
        .list()
        .map(LanguageSummary::from)
        .collect();

    HttpResponse::Ok().json(languages)
}

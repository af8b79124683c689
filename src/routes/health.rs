use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use crate::judge::Judge;

#[derive(Serialize)]
struct HealthResponse {
    backend: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
struct LanguageInfo<'a> {
    name: &'a str,
    source_file: &'a str,
    compiled: bool,
    profile: &'a str,
    remote_id: Option<u32>,
    time_limit_us: u64,
    memory_limit: u64,
}

#[get("/health")]
pub async fn get_health_handler(judge: web::Data<Judge>) -> impl Responder {
    match judge.health_check().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            backend: judge.backend(),
            status: "ok",
            message: None,
        }),
        Err(e) => {
            log::warn!("Health check of {} backend failed: {e}", judge.backend());
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                backend: judge.backend(),
                status: "unavailable",
                message: Some(e.to_string()),
            })
        }
    }
}

#[get("/languages")]
pub async fn get_languages_handler(judge: web::Data<Judge>) -> impl Responder {
    let languages: Vec<_> = judge
        .registry()
        .toolchains()
        .into_iter()
        .map(|t| LanguageInfo {
            name: &t.name,
            source_file: &t.source_file,
            compiled: t.is_compiled(),
            profile: &t.profile.name,
            remote_id: t.remote_id,
            time_limit_us: t.time_limit.as_micros() as u64,
            memory_limit: t.memory_limit,
        })
        .collect();

    HttpResponse::Ok().json(languages)
}

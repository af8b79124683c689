use actix_web::{HttpResponse, Responder, post, web};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{ErrorResponse, ErrorResponseWithMessage};
use crate::error::JudgeError;
use crate::judge::Judge;
use crate::model::{Question, SubmissionType};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JudgeRequest {
    pub question: Question,
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub submission_type: SubmissionType,
}

#[post("/judge")]
pub async fn post_judge_handler(
    judge: web::Data<Judge>,
    slots: web::Data<Semaphore>,
    body: web::Json<JudgeRequest>,
) -> impl Responder {
    if let Err(e) = judge.health_check().await {
        log::warn!("Refusing submission, {} backend unhealthy: {e}", judge.backend());
        return HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
            reason: "ERR_EXTERNAL",
            code: 5,
            message: e.to_string(),
        });
    }

    let Ok(permit) = slots.into_inner().acquire_owned().await else {
        log::error!("Submission semaphore closed");
        return HttpResponse::InternalServerError().json(ErrorResponse {
            reason: "ERR_INTERNAL",
            code: 6,
        });
    };

    // Judging continues in its own task; if the client goes away the guard
    // cancels it before the next test case
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    let judge = judge.into_inner();
    let request = body.into_inner();

    let handle = actix_web::rt::spawn(async move {
        let _permit = permit;
        judge
            .judge(
                &request.question,
                &request.language,
                &request.source_code,
                request.submission_type,
                &token,
            )
            .await
    });

    match handle.await {
        Ok(Ok(mut result)) => {
            result.redact_hidden();
            HttpResponse::Ok().json(result)
        }
        Ok(Err(e @ JudgeError::NoTestCases)) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: e.to_string(),
            })
        }
        Ok(Err(e)) => {
            log::error!("Judging failed: {e}");
            HttpResponse::InternalServerError().json(ErrorResponseWithMessage {
                reason: "ERR_INTERNAL",
                code: 6,
                message: e.to_string(),
            })
        }
        Err(e) => {
            log::error!("Judge task failed: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_INTERNAL",
                code: 6,
            })
        }
    }
}

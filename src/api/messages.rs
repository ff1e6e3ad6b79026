use actix_web::{
    get, post,
    web::{self, Data, Json},
    Responder, Scope,
};
use serde::{Deserialize, Serialize};

use crate::{error::Error, service::Service};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub message_id: String,
    pub requeued: bool,
}

#[get("/stats")]
async fn queue_stats(service: Data<Service>) -> Result<impl Responder, Error> {
    Ok(Json(service.stats().await?))
}

#[get("/{message_id}")]
async fn get_message(
    service: Data<Service>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    Ok(Json(service.get_message(&path).await?))
}

#[post("/{message_id}/requeue")]
async fn requeue_message(
    service: Data<Service>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let message_id = path.into_inner();

    service.requeue_failed(&message_id).await?;

    Ok(Json(RequeueResponse {
        message_id,
        requeued: true,
    }))
}

pub fn service() -> Scope {
    web::scope("/messages")
        .service(queue_stats)
        .service(get_message)
        .service(requeue_message)
}

use actix_web::{
    post,
    web::{self, Data, Json},
    Responder, Scope,
};

use crate::{dispatch::UpdateBatch, error::Error, service::Service};

/// Accepts a business batch and reports per-chunk outcomes.
///
/// Partial failure is still a `200`; callers inspect `errors`.
#[post("")]
async fn dispatch_batch(
    service: Data<Service>,
    batch: Json<UpdateBatch>,
) -> Result<impl Responder, Error> {
    let outcome = service.dispatch(&batch).await?;

    Ok(Json(outcome))
}

pub fn service() -> Scope {
    web::scope("/dispatch").service(dispatch_batch)
}

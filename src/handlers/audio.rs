use crate::{error::AppError, state::AppState};
use actix_web::{http::header, web, HttpResponse};
use tracing::debug;

/// `GET /api/v1/audio/{id}`: replay a synthesized reply while it is cached.
pub async fn get_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();

    let audio = state
        .audio_cache
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Audio {} not found", id)))?;

    debug!(id = %id, call_id = %audio.call_id, bytes = audio.bytes.len(), "Serving cached audio");

    Ok(HttpResponse::Ok()
        .content_type(audio.content_type.as_str())
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .body(audio.bytes.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_cached_audio_is_served() {
        let state = test_state();
        let id = state.audio_cache.insert("CA1", vec![1, 2, 3], "audio/mpeg").await;

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/audio/{id}", web::get().to(get_audio)),
        )
        .await;

        let req = test::TestRequest::get().uri(&format!("/audio/{}", id)).to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "audio/mpeg");
        let body = test::read_body(resp).await;
        assert_eq!(body.as_ref(), &[1, 2, 3]);
    }

    #[actix_web::test]
    async fn test_unknown_audio_is_not_found() {
        let state = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/audio/{id}", web::get().to(get_audio)),
        )
        .await;

        let req = test::TestRequest::get().uri("/audio/missing").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.audio_cache.stats().misses, 1);
    }
}

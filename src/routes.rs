use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use crate::{
    models::{ApiResponse, PublishQrReq},
    supervisor::{CourseRegistry, PublishError},
};

pub fn router(registry: CourseRegistry) -> Router {
    Router::new()
        // list configured courses, publish a scanned QR code
        .route("/api/v1/course", get(list_courses).put(publish_qr))
        .with_state(registry)
}

async fn list_courses(State(registry): State<CourseRegistry>) -> Json<ApiResponse<Vec<String>>> {
    Json(ApiResponse { success: true, data: registry.course_names().to_vec() })
}

async fn publish_qr(
    State(registry): State<CourseRegistry>,
    Json(req): Json<PublishQrReq>,
) -> Result<Json<ApiResponse<&'static str>>, PublishError> {
    registry.publish(&req.course_name, req.enc).map_err(|e| {
        tracing::warn!(error = %e, "qr publish rejected");
        e
    })?;
    Ok(Json(ApiResponse { success: true, data: "success" }))
}

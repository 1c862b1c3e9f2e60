use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub build_date: &'static str,
    pub build_number: &'static str,
    /// Kept as `go_version` for wire compatibility with existing dashboards
    /// that poll this endpoint; it carries the Rust compiler version here.
    pub go_version: &'static str,
}

/// `GET /version`.
pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        build_date: env!("BUILD_DATE"),
        build_number: env!("BUILD_NUMBER"),
        go_version: env!("RUSTC_VERSION"),
    })
}

//! CORS middleware configuration.

use tower_http::cors::CorsLayer;

/// Permissive CORS for the demo deployment. A production deployment would
/// restrict this to the web client's own origin; nothing in this spec names
/// that origin, so permissive is the honest default rather than a guess.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::permissive()
}

//! Request logging middleware: spans every request at INFO via `tracing`.

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub fn logging_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO).include_headers(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_layer_creation_does_not_panic() {
        let _layer = logging_layer();
    }
}

//! `Server-Timing` middleware.
//!
//! Puts a fresh [`Timings`] recorder into each request's extensions.
//! Handlers pull it out with `Extension<Timings>` and pass it to their
//! cache calls via `CachePolicy::with_timings`. On the way out the recorded
//! samples are rendered into the `Server-Timing` response header, merged with
//! any value the handler already set.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use cachified_core::{combine_server_timings, Timings};
use tracing::debug;

pub const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");

pub async fn server_timing_middleware(mut request: Request, next: Next) -> Response {
    let timings = Timings::new();
    request.extensions_mut().insert(timings.clone());

    let mut response = next.run(request).await;

    let rendered = timings.to_header();
    if rendered.is_empty() {
        return response;
    }

    let existing = response
        .headers()
        .get(&SERVER_TIMING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let combined = combine_server_timings(existing, &rendered);

    match HeaderValue::from_str(&combined) {
        Ok(value) => {
            response.headers_mut().insert(SERVER_TIMING, value);
        }
        Err(e) => debug!(error = %e, "Dropping unrepresentable Server-Timing header"),
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Extension, Router};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/timed",
                get(|Extension(timings): Extension<Timings>| async move {
                    timings.record("db", Some("users".to_string()), Duration::from_millis(4));
                    ([(SERVER_TIMING, "edge;dur=1.0")], "ok")
                }),
            )
            .route("/untimed", get(|| async { "ok" }))
            .layer(middleware::from_fn(server_timing_middleware))
    }

    #[tokio::test]
    async fn test_recorded_samples_are_merged_into_header() {
        let response = app()
            .oneshot(Request::get("/timed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let header = response.headers().get(&SERVER_TIMING).unwrap().to_str().unwrap();
        assert_eq!(header, r#"edge;dur=1.0,db;desc="users";dur=4.0"#);
    }

    #[tokio::test]
    async fn test_no_samples_no_header() {
        let response = app()
            .oneshot(Request::get("/untimed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().get(&SERVER_TIMING).is_none());
    }
}

//! Admin HTTP route handlers.

pub mod backup;
pub mod counter;
pub mod join;
pub mod status;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::NodeConfig;
    use crate::context::NodeContext;
    use crate::error::ErrorResponse;
    use crate::membership::{PeerRecord, StaticMembership};
    use crate::{create_router, AppState};

    fn app() -> axum::Router {
        let membership = Arc::new(StaticMembership::new(vec![PeerRecord::new(
            "node2",
            "127.0.0.1:7947",
        )]));
        let context = Arc::new(NodeContext::new(NodeConfig::default(), membership));
        create_router(AppState::new(context, reqwest::Client::new()))
    }

    async fn call(method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_routes_before_start() {
        for (method, uri) in [
            ("GET", "/status"),
            ("GET", "/get"),
            ("POST", "/next"),
            ("POST", "/backup"),
            ("POST", "/restore"),
            ("POST", "/join?id=node2&addr=127.0.0.1:9003"),
        ] {
            let (status, body) = call(method, uri).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{method} {uri}");
            let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
            assert_eq!(body.code, "NOT_STARTED");
        }
    }

    #[tokio::test]
    async fn test_status_before_start_reports_view() {
        let (status, body) = call("GET", "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.code, "NOT_STARTED");
        assert_eq!(body.members, vec!["node1", "node2"]);
    }

    #[tokio::test]
    async fn test_join_requires_params() {
        let (status, _) = call("POST", "/join?id=node2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call("POST", "/join?id=&addr=127.0.0.1:9003").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let (status, body) = call("GET", "/health").await;
        assert_eq!(status, StatusCode::OK);

        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["node_id"], "node1");
        assert_eq!(health["consensus_started"], false);
    }
}

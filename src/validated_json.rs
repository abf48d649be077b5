//! Extraction of validated JSON request bodies

use crate::error::IngestError;

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Json},
    http::Request,
};
use serde::de::DeserializeOwned;
use validator::Validate;

/// Json extractor that also checks the body's validator rules, such as those of
/// [crate::dataset::QueryRequest].
///
/// Both malformed bodies and rule violations are rejected with an [IngestError], rendered as a
/// 400 response listing each failing field.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<T, S, B> FromRequest<S, B> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    B: Send + 'static,
{
    type Rejection = IngestError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        if let Err(errors) = value.validate() {
            tracing::debug!("rejecting request body: {}", errors);
            return Err(errors.into());
        }
        Ok(ValidatedJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetQuery, QueryRequest, TimeUnit};

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        response::Response,
        routing::post,
        Json, Router,
    };
    use regex::Regex;
    use tower::ServiceExt;

    async fn echo(ValidatedJson(request): ValidatedJson<QueryRequest>) -> Json<QueryRequest> {
        Json(request)
    }

    async fn post_query(body: serde_json::Value) -> Response {
        post_raw(body.to_string()).await
    }

    async fn post_raw(body: String) -> Response {
        Router::new()
            .route("/query", post(echo))
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri("/query")
                    .header(http::header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn error_text(response: Response) -> String {
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // Message and causes on one line for matching.
        let mut text = json["error"]["message"].as_str().unwrap().to_string();
        if let Some(causes) = json["error"]["caused_by"].as_array() {
            for cause in causes {
                text.push_str(" | ");
                text.push_str(cause.as_str().unwrap());
            }
        }
        text
    }

    fn assert_matches(pattern: &str, text: &str) {
        let re = Regex::new(pattern).unwrap();
        assert!(re.is_match(text), "{pattern} not found in: {text}");
    }

    #[tokio::test]
    async fn valid_query() {
        let response = post_query(serde_json::json!({
            "datasets": ["alpha_v1", "beta_v2"],
            "query": {"kind": "receiver", "receiver": "03"},
            "time_unit": "days",
        }))
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let request: QueryRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(vec!["alpha_v1", "beta_v2"], request.datasets);
        assert_eq!(
            DatasetQuery::Receiver {
                receiver: "03".to_string()
            },
            request.query
        );
        assert_eq!(TimeUnit::Days, request.time_unit);
    }

    #[tokio::test]
    async fn time_unit_defaults_to_seconds() {
        let response = post_query(serde_json::json!({
            "datasets": ["alpha_v1"],
            "query": {"kind": "surface", "prefix": "slip"},
        }))
        .await;
        assert_eq!(StatusCode::OK, response.status());
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let request: QueryRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(TimeUnit::Seconds, request.time_unit);
    }

    #[tokio::test]
    async fn malformed_json() {
        let response = post_raw("{\"datasets\": [".to_string()).await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        assert_matches("request data is not valid", &error_text(response).await);
    }

    #[tokio::test]
    async fn unknown_query_kind() {
        let response = post_query(serde_json::json!({
            "datasets": ["alpha_v1"],
            "query": {"kind": "volume", "depth": "000"},
        }))
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        assert_matches(r"unknown variant `volume`", &error_text(response).await);
    }

    #[tokio::test]
    async fn no_datasets() {
        let response = post_query(serde_json::json!({
            "datasets": [],
            "query": {"kind": "time_series", "depth": "000"},
        }))
        .await;
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        let text = error_text(response).await;
        assert_matches("request data is not valid", &text);
        assert_matches("datasets: at least one dataset is required", &text);
    }

    #[tokio::test]
    async fn invalid_dataset_names() {
        for name in ["", "alpha_v1/fltst_dp000"] {
            let response = post_query(serde_json::json!({
                "datasets": ["beta_v2", name],
                "query": {"kind": "time_series", "depth": "000"},
            }))
            .await;
            assert_eq!(StatusCode::BAD_REQUEST, response.status(), "{name:?}");
            let text = error_text(response).await;
            assert_matches("request data is not valid", &text);
            assert_matches(
                "datasets: .*dataset names must be non-empty and must not contain '/'",
                &text,
            );
        }
    }
}

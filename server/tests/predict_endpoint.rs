#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end tests against a real server on an ephemeral port.
//!
//! The fixture forest has two trees over speed and weather:
//! - tree 0: speed <= 60 -> [0, 8, 2], else [3, 1, 6]
//! - tree 1: weather code <= 1.5 (Clear, Fog) -> [0, 6, 4], else [5, 0, 5]

use std::net::SocketAddr;

use serde_json::{Value, json};
use severity_core::classifier::{Classifier, InferenceError};
use severity_core::{
    FeatureSchema, LabelEncoder, ModelState, Predictor, ServiceConfig, load_artifacts,
};
use severity_server::AppState;
use tempfile::TempDir;
use tokio::net::TcpListener;

const SYSTEM: &str = r#"{
    "model": {
        "kind": "random_forest",
        "n_classes": 3,
        "n_features": 3,
        "trees": [
            {"nodes": [
                {"feature": 0, "threshold": 60.0, "left": 1, "right": 2},
                {"value": [0.0, 8.0, 2.0]},
                {"value": [3.0, 1.0, 6.0]}
            ]},
            {"nodes": [
                {"feature": 1, "threshold": 1.5, "left": 1, "right": 2},
                {"value": [0.0, 6.0, 4.0]},
                {"value": [5.0, 0.0, 5.0]}
            ]}
        ]
    },
    "target_encoder": {"classes": ["Fatal", "Minor", "Severe"]}
}"#;

const PREPROCESSING: &str = r#"{
    "encoders": {"Weather Conditions": {"classes": ["Clear", "Fog", "Rain"]}},
    "features": ["Crash Speed (km/h)", "Weather Conditions", "Alcohol Level (BAC%)"]
}"#;

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    _dir: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn post_json(&self, body: Value) -> (u16, Value) {
        let response = self
            .client
            .post(self.url("/predict"))
            .json(&body)
            .send()
            .await
            .expect("send");
        let status = response.status().as_u16();
        (status, response.json().await.expect("json body"))
    }

    async fn post_raw(&self, body: &'static str) -> (u16, Value) {
        let response = self
            .client
            .post(self.url("/predict"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("send");
        let status = response.status().as_u16();
        (status, response.json().await.expect("json body"))
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.expect("send")
    }
}

async fn spawn(predictor: Predictor, dir: TempDir) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = AppState::new(predictor, true);
    tokio::spawn(severity_server::serve(
        listener,
        state,
        std::future::pending::<()>(),
    ));
    TestServer {
        addr,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

/// Start a server over bundles written to a temp dir. `None` skips a file.
async fn start_with(system: Option<&str>, preprocessing: Option<&str>) -> TestServer {
    let dir = TempDir::new().expect("tempdir");
    let config = ServiceConfig {
        model_dir: dir.path().to_path_buf(),
        ..ServiceConfig::default()
    };
    if let Some(contents) = system {
        std::fs::write(config.system_path(), contents).expect("write system bundle");
    }
    if let Some(contents) = preprocessing {
        std::fs::write(config.artifacts_path(), contents).expect("write preprocessing bundle");
    }
    let predictor = Predictor::from_artifacts(load_artifacts(&config));
    spawn(predictor, dir).await
}

async fn start() -> TestServer {
    start_with(Some(SYSTEM), Some(PREPROCESSING)).await
}

#[tokio::test]
async fn predicts_minor_for_slow_clear_crash() {
    let server = start().await;
    let (status, body) = server
        .post_json(json!({
            "Crash Speed (km/h)": 40,
            "Weather Conditions": "Clear",
            "Alcohol Level (BAC%)": 0.0,
        }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"prediction": "Minor", "confidence": 0.7}));
}

#[tokio::test]
async fn predicts_severe_for_fast_rainy_crash() {
    let server = start().await;
    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": 95, "Weather Conditions": "Rain"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"prediction": "Severe", "confidence": 0.55}));
}

#[tokio::test]
async fn unseen_category_falls_back_to_first_class() {
    let server = start().await;
    // "Hail" is unknown and is scored as "Clear".
    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": 95, "Weather Conditions": "Hail"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"prediction": "Severe", "confidence": 0.5}));
}

#[tokio::test]
async fn extra_fields_are_ignored_and_missing_fields_are_zero() {
    let server = start().await;
    let (status, body) = server
        .post_json(json!({"Vehicle Colour": "Red"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"prediction": "Minor", "confidence": 0.7}));
}

#[tokio::test]
async fn repeated_requests_give_identical_answers() {
    let server = start().await;
    let input = json!({"Crash Speed (km/h)": "72.5", "Weather Conditions": "Fog"});
    let first = server.post_json(input.clone()).await;
    let second = server.post_json(input).await;
    assert_eq!(first.0, 200);
    assert_eq!(first, second);
}

#[tokio::test]
async fn empty_or_missing_body_is_bad_request() {
    let server = start().await;
    let expected = json!({"error": "No input data provided"});

    assert_eq!(server.post_raw("").await, (400, expected.clone()));
    assert_eq!(server.post_raw("{}").await, (400, expected.clone()));
    assert_eq!(server.post_raw("[1, 2, 3]").await, (400, expected.clone()));
    assert_eq!(server.post_raw("not json").await, (400, expected));
}

#[tokio::test]
async fn malformed_value_fails_without_details() {
    let server = start().await;
    let expected = json!({"error": "Prediction failed, see server logs"});

    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": "fast"}))
        .await;
    assert_eq!((status, body), (500, expected.clone()));

    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": [40, 60]}))
        .await;
    assert_eq!((status, body), (500, expected));
}

#[tokio::test]
async fn nested_categorical_value_takes_the_fallback() {
    let server = start().await;
    // Scored as "Clear" with speed 0.
    let (status, body) = server
        .post_json(json!({"Weather Conditions": ["Rain", "Fog"]}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"prediction": "Minor", "confidence": 0.7}));
}

#[tokio::test]
async fn missing_model_is_reported_before_body_checks() {
    let server = start_with(None, Some(PREPROCESSING)).await;
    let expected = json!({"error": "Model or target encoder not loaded"});

    assert_eq!(server.post_raw("").await, (500, expected.clone()));
    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": 40}))
        .await;
    assert_eq!((status, body), (500, expected));
}

#[tokio::test]
async fn missing_target_encoder_degrades_the_service() {
    let system_without_encoder = r#"{"model": {
        "kind": "logistic_regression",
        "coefficients": [[0.1, 0.0, 0.0]],
        "intercepts": [0.0]
    }}"#;
    let server = start_with(Some(system_without_encoder), Some(PREPROCESSING)).await;

    let response = server.get("/health").await;
    assert_eq!(response.status().as_u16(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["reason"], "target encoder not loaded");
}

#[tokio::test]
async fn health_reports_ready_with_schema_size() {
    let server = start().await;
    let response = server.get("/health").await;
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"status": "ready", "features": 3, "encoders": 1})
    );
}

#[tokio::test]
async fn broken_preprocessing_bundle_keeps_model_ready_but_fails_predictions() {
    let server = start_with(Some(SYSTEM), Some("{ truncated")).await;
    assert_eq!(server.get("/health").await.status().as_u16(), 200);

    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": 40}))
        .await;
    assert_eq!(status, 500);
    assert_eq!(body, json!({"error": "Prediction failed, see server logs"}));
}

#[tokio::test]
async fn home_page_and_script_are_served() {
    let server = start_with(None, None).await;

    let response = server.get("/").await;
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"), "{content_type}");
    let html = response.text().await.unwrap();
    assert!(html.contains("Crash Severity Prediction"));
    assert!(html.contains("/static/js/app.js"));

    let response = server.get("/static/js/app.js").await;
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text().await.unwrap().contains("/predict"));
}

#[tokio::test]
async fn unknown_path_is_json_not_found() {
    let server = start().await;
    let response = server.get("/nonexistent").await;
    assert_eq!(response.status().as_u16(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "error": "Resource not found",
            "details": "The requested URL /nonexistent was not found on the server.",
        })
    );
}

#[tokio::test]
async fn wrong_method_is_json_method_not_allowed() {
    let server = start().await;
    let response = server.get("/predict").await;
    assert_eq!(response.status().as_u16(), 405);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Method not allowed");
}

#[derive(Debug)]
struct PanickingClassifier;

impl Classifier for PanickingClassifier {
    fn n_classes(&self) -> usize {
        2
    }

    fn n_features(&self) -> Option<usize> {
        None
    }

    fn predict_proba(&self, _features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        panic!("classifier exploded");
    }
}

#[tokio::test]
async fn panic_during_prediction_is_caught() {
    let predictor = Predictor::new(
        ModelState::Ready {
            classifier: Box::new(PanickingClassifier),
            target_encoder: LabelEncoder::new(vec!["Minor".to_string(), "Severe".to_string()])
                .unwrap(),
        },
        Default::default(),
        FeatureSchema::new(["Crash Speed (km/h)"]),
    );
    let server = spawn(predictor, TempDir::new().unwrap()).await;

    let (status, body) = server
        .post_json(json!({"Crash Speed (km/h)": 40}))
        .await;
    assert_eq!(status, 500);
    assert_eq!(
        body,
        json!({
            "error": "An unexpected error occurred",
            "details": "classifier exploded",
        })
    );

    // The server keeps answering after the panic.
    assert_eq!(server.get("/health").await.status().as_u16(), 200);
}

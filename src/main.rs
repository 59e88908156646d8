use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod config;
use config::Config;
mod error;
use error::ServiceError;
mod model;
use model::Model;
mod predict;
use predict::{Labels, Prediction, Predictor};
mod preprocess;
mod utils;
use utils::ensure_model_exists;

struct AppState {
    predictor: Predictor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        body_limit_bytes = config.body_limit_bytes,
        model = %config.model_path.display(),
        "configuration loaded"
    );

    ensure_model_exists(&config).await?;

    let labels = match &config.class_list_path {
        Some(path) => Labels::from_file(path).context("failed to load class list")?,
        None => Labels::default(),
    };
    let model = Model::new(&config.model_path, &config.input_op, &config.output_op)
        .context("failed to load model")?;

    let predictor = Predictor::new(Box::new(model), labels);
    tracing::info!(classes = predictor.labels().len(), "predictor ready");

    let app = router(Arc::new(AppState { predictor }), config.body_limit_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);
    axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {}", addr))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(predict_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
}

async fn read_upload(multipart: &mut Multipart) -> Result<Bytes, ServiceError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            let data = field.bytes().await?;
            if data.is_empty() {
                return Err(ServiceError::MissingFile);
            }
            return Ok(data);
        }
    }

    Err(ServiceError::MissingFile)
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, ServiceError> {
    let image_data = read_upload(&mut multipart).await?;

    // Decoding and inference are CPU bound.
    let prediction =
        tokio::task::spawn_blocking(move || state.predictor.predict_image(&image_data)).await??;

    Ok(Json(prediction))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use tower::ServiceExt;

    use super::*;
    use crate::error::ModelError;
    use crate::model::{Classifier, ImageTensor};
    use crate::predict::tests::FixedScores;
    use crate::preprocess::tests::{encode, solid_png};

    const BOUNDARY: &str = "component-test-boundary";

    /// Scores an image by its dominant channel: red, green or blue.
    struct DominantChannel;

    impl Classifier for DominantChannel {
        fn classify(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
            let mut sums = [0.0f32; 3];
            for pixel in input.values().chunks(3) {
                for (sum, value) in sums.iter_mut().zip(pixel) {
                    *sum += value;
                }
            }
            let total: f32 = sums.iter().sum::<f32>().max(f32::EPSILON);
            Ok(sums.iter().map(|s| s / total).collect())
        }
    }

    fn app_with(classifier: Box<dyn Classifier>) -> Router {
        let predictor = Predictor::new(classifier, Labels::default());
        router(Arc::new(AppState { predictor }), 5 * 1024 * 1024)
    }

    fn upload(field: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app_with(Box::new(FixedScores(vec![1.0])));
        let request = Request::get("/health").body(Body::empty()).unwrap();

        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "OK" }));
    }

    #[tokio::test]
    async fn resistor_jpeg_is_classified() {
        let app = app_with(Box::new(FixedScores(vec![0.1, 0.85, 0.05])));
        let img = RgbImage::from_pixel(500, 500, Rgb([180, 140, 90]));
        let jpeg = encode(DynamicImage::ImageRgb8(img), ImageOutputFormat::Jpeg(90));

        let (status, body) = send(app, upload("file", "image/jpeg", &jpeg)).await;
        assert_eq!(status, StatusCode::OK);

        let prediction: Prediction = serde_json::from_value(body).unwrap();
        assert_eq!(prediction.prediction, "Resistor");
        assert!((prediction.confidence - 0.85).abs() < 1e-6);
        assert_eq!(prediction.other_confidences.len(), 2);
        assert!(prediction
            .other_confidences
            .values()
            .all(|other| prediction.confidence > *other));
    }

    #[tokio::test]
    async fn response_has_expected_shape() {
        let app = app_with(Box::new(FixedScores(vec![0.25, 0.25, 0.5])));

        let png = solid_png(8, 8, [0, 0, 0]);
        let (status, body) = send(app, upload("file", "image/png", &png)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "prediction": "Transistor",
                "confidence": 0.5,
                "other_confidences": { "Capacitor": 0.25, "Resistor": 0.25 }
            })
        );
    }

    #[tokio::test]
    async fn text_upload_is_a_server_error() {
        let app = app_with(Box::new(FixedScores(vec![0.2, 0.3, 0.5])));

        let (status, body) = send(app, upload("file", "text/plain", b"hello, world")).await;
        assert!(status.is_server_error());
        assert!(body.get("prediction").is_none());
        assert!(body["error"].as_str().unwrap().starts_with("failed to decode image"));
    }

    #[tokio::test]
    async fn missing_file_field_is_rejected() {
        let app = app_with(Box::new(FixedScores(vec![1.0])));

        let png = solid_png(4, 4, [1, 1, 1]);
        let (status, body) = send(app, upload("picture", "image/png", &png)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body, json!({ "error": "No file uploaded" }));
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let app = app_with(Box::new(FixedScores(vec![1.0])));

        let (status, _) = send(app, upload("file", "image/png", &[])).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let predictor = Predictor::new(Box::new(FixedScores(vec![1.0])), Labels::default());
        let app = router(Arc::new(AppState { predictor }), 1024);

        let (status, body) = send(app, upload("file", "image/png", &[0u8; 4096])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(body.get("error").is_some());
    }

    #[tokio::test]
    async fn broken_boundary_is_rejected() {
        let app = app_with(Box::new(FixedScores(vec![1.0])));
        let body = "--some-other-boundary\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\nabc";
        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.get("prediction").is_none());
    }

    #[tokio::test]
    async fn concurrent_uploads_do_not_interfere() {
        let app = app_with(Box::new(DominantChannel));
        let red = solid_png(400, 300, [250, 10, 10]);
        let green = solid_png(300, 400, [10, 250, 10]);

        let rounds = (0..8).map(|_| {
            let red_request = app.clone().oneshot(upload("file", "image/png", &red));
            let green_request = app.clone().oneshot(upload("file", "image/png", &green));
            async move { tokio::join!(red_request, green_request) }
        });

        for (red_response, green_response) in spawn_all(rounds).await {
            for (response, expected) in [(red_response, "Capacitor"), (green_response, "Resistor")] {
                let response = response.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
                let prediction: Prediction = serde_json::from_slice(&body).unwrap();
                assert_eq!(prediction.prediction, expected);
            }
        }
    }

    async fn spawn_all<F, T>(futures: impl Iterator<Item = F>) -> Vec<T>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = futures.map(tokio::spawn).collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }
}

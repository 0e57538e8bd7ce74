use detect_stream::detection::{BoundingBox, shared};
use detect_stream::source::VideoWriter;
use detect_stream::{AppState, ClassTable, Config, Detection, Detector};
use image::{Rgb, RgbImage};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Finds one "board" in the top-left quarter of every frame.
struct StubDetector;

impl Detector for StubDetector {
    fn detect(&mut self, image: &RgbImage, _confidence: f32) -> anyhow::Result<Vec<Detection>> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(vec![Detection {
            bbox: BoundingBox::new(w * 0.1, h * 0.4, w * 0.5, h * 0.9),
            confidence: 0.87,
            class_id: 0,
        }])
    }
}

/// Test harness that manages the server task
struct TestServer {
    handle: JoinHandle<()>,
    port: u16,
    workspace: PathBuf,
    client: reqwest::Client,
}

fn init_ffmpeg() {
    static FFMPEG_INIT: std::sync::Once = std::sync::Once::new();
    FFMPEG_INIT.call_once(|| {
        ffmpeg_next::init().unwrap();
    });
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Starts a server after `configure` has adjusted the default test config.
    async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        // Only open when debugging
        // tracing_subscriber::fmt::init();

        init_ffmpeg();

        let port = portpicker::pick_unused_port().expect("No available port");
        let test_id = uuid::Uuid::new_v4().to_string();
        let workspace = PathBuf::from(format!("/tmp/test-workspace-{test_id}"));

        let mut config = Config {
            listen_on_port: port,
            bind_address: "127.0.0.1".into(),
            workspace: workspace.display().to_string(),
            ..Default::default()
        };
        configure(&mut config);
        let state = AppState::new(
            config,
            shared(StubDetector),
            ClassTable::new(vec!["board".into()]),
        )
        .await
        .unwrap();

        let handle = tokio::spawn(async move {
            detect_stream::serve(state).await.unwrap();
        });

        // Cookie store keeps the session between requests, like a browser
        let client = cookie_client();

        // Poll until server is ready
        for _ in 0..200 {
            if let Ok(response) = client
                .get(format!("http://127.0.0.1:{port}/health"))
                .send()
                .await
                && response.status().is_success()
            {
                break;
            }

            sleep(Duration::from_millis(10)).await;
        }

        TestServer {
            handle,
            port,
            workspace,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    async fn upload(&self, filename: &str, data: Vec<u8>) -> reqwest::Response {
        let form = Form::new().part("file", Part::bytes(data).file_name(filename.to_string()));
        self.client
            .post(self.url("/Detections"))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.handle.abort();
        let _ = tokio::fs::remove_dir_all(&self.workspace).await;
    }
}

fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([40, 60, 80]));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn write_clip(path: &Path, frames: u8) {
    init_ffmpeg();
    let mut writer = VideoWriter::create(path, 64, 48, 10).unwrap();
    for i in 0..frames {
        let shade = i * 40;
        writer
            .write(&RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade])))
            .unwrap();
    }
    writer.finish().unwrap();
}

fn cookie_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .cookie_store(true)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

fn count_parts(body: &[u8]) -> usize {
    body.windows(PART_HEADER.len())
        .filter(|window| *window == PART_HEADER)
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_model_and_classes() {
    let server = TestServer::start().await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["classes"], 1);
    assert_eq!(body["model"], "yolo_assets/Models/yolov8s.onnx");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_routes_render_not_found_page() {
    let server = TestServer::start().await;

    let response = server.client.get(server.url("/nope")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.text().await.unwrap().contains("404"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pages_render() {
    let server = TestServer::start().await;

    for path in ["/", "/home", "/Detections"] {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        assert!(
            response.headers()[reqwest::header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
    }

    let form = server.client.get(server.url("/Detections")).send().await.unwrap();
    assert!(form.text().await.unwrap().contains(r#"name="file""#));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn media_without_upload_is_bad_request() {
    let server = TestServer::start().await;

    let response = server.client.get(server.url("/media")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn uploaded_image_streams_one_annotated_frame() {
    let server = TestServer::start().await;

    let response = server.upload("circuit board.png", png_fixture(96, 64)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(reqwest::header::SET_COOKIE));
    let page = response.text().await.unwrap();
    assert!(page.contains(r#"src="/media""#));
    assert!(page.contains("circuit_board.png"));

    let saved = server.workspace.join("Uploads/circuit_board.png");
    assert!(saved.is_file());

    let response = server.client.get(server.url("/media")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    assert_eq!(response.headers()[reqwest::header::CACHE_CONTROL], "no-cache");

    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(PART_HEADER));
    assert!(body.ends_with(b"\r\n"));
    assert_eq!(count_parts(&body), 1);

    let jpeg = &body[PART_HEADER.len()..body.len() - 2];
    let frame = image::load_from_memory(jpeg).unwrap().to_rgb8();
    assert_eq!(frame.dimensions(), (96, 64));
    // Outside the stub box the frame keeps its fill color
    let corner = frame.get_pixel(94, 2);
    assert!(corner[2] > corner[0]);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_names_are_sanitized() {
    let server = TestServer::start().await;

    let response = server.upload("../../escape.png", png_fixture(8, 8)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(server.workspace.join("Uploads/escape.png").is_file());
    assert!(!server.workspace.join("../escape.png").exists());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_or_missing_files_are_rejected() {
    let server = TestServer::start().await;

    let response = server.upload("empty.png", Vec::new()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!server.workspace.join("Uploads/empty.png").exists());

    let response = server.upload("..", png_fixture(8, 8)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let form = Form::new().text("note", "no file here");
    let response = server
        .client
        .post(server.url("/Detections"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn home_clears_the_uploaded_media() {
    let server = TestServer::start().await;

    let response = server.upload("board.png", png_fixture(16, 16)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.client.get(server.url("/home")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.client.get(server.url("/media")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_media_is_server_error() {
    let server = TestServer::start().await;

    let response = server
        .upload("clip.mp4", b"this is not a video".to_vec())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = server.client.get(server.url("/media")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().await.unwrap().contains("500"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_are_isolated_per_client() {
    let server = TestServer::start().await;

    let response = server.upload("board.png", png_fixture(16, 16)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stranger = cookie_client();
    let response = stranger.get(server.url("/media")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn browsing_without_upload_creates_no_session() {
    let server = TestServer::start().await;

    for path in ["/", "/home", "/media"] {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        assert!(
            !response.headers().contains_key(reqwest::header::SET_COOKIE),
            "{path}"
        );
    }

    let response = server
        .client
        .get(server.url("/"))
        .header(reqwest::header::COOKIE, "detect_session=forged")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(reqwest::header::SET_COOKIE));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_upload_keeps_another_sessions_file() {
    let server = TestServer::start().await;

    let response = server.upload("board.png", png_fixture(16, 16)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let other = cookie_client();
    let form = Form::new().part("file", Part::bytes(Vec::new()).file_name("board.png"));
    let response = other
        .post(server.url("/Detections"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(server.workspace.join("Uploads/board.png").is_file());

    let response = server.client.get(server.url("/media")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(count_parts(&response.bytes().await.unwrap()), 1);

    // No partial files are left behind
    let mut entries = tokio::fs::read_dir(server.workspace.join("Uploads")).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        assert!(!entry.file_name().to_string_lossy().ends_with(".part"));
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_webcam_is_server_error() {
    let server = TestServer::start_with(|config| {
        config.webcam = "/nonexistent/video9".into();
    })
    .await;

    let response = server.client.get(server.url("/webapp")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.text().await.unwrap().contains("500"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn webcam_streams_every_captured_frame() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("camera.avi");
    write_clip(&clip, 3);

    let server = TestServer::start_with(|config| {
        config.webcam = clip.display().to_string();
    })
    .await;

    let response = server.client.get(server.url("/webapp")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );
    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(PART_HEADER));
    assert_eq!(count_parts(&body), 3);

    server.stop().await;
}

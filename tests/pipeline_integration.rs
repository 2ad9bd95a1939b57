//! Integration tests for the file pipeline.
//!
//! These tests run whole records through the pipeline against a mock server
//! and check the stored files, their paths and the attached summary.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use harvester_core::dispatch::{
    Dispatcher, ProxyPool, ProxyPoolConfig, RateLimiter, RateLimiterConfig,
};
use harvester_core::download::HttpClient;
use harvester_core::pipeline::{FilePipeline, FileRole, ScrapedRecord, sha256_hex};
use harvester_core::session::{SessionConfig, SessionStore};
use serde_json::json;
use support::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pipeline(dir: &TempDir, concurrency: usize) -> FilePipeline {
    let dispatcher = Dispatcher::new(
        HttpClient::with_timeouts(Duration::from_secs(2), Duration::from_secs(5)),
        Arc::new(RateLimiter::new(RateLimiterConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            randomize: false,
            adaptive: false,
        })),
        Arc::new(ProxyPool::new(ProxyPoolConfig::default())),
        Arc::new(SessionStore::new(SessionConfig {
            dir: dir.path().join("sessions"),
            ..SessionConfig::default()
        })),
    );
    FilePipeline::new(Arc::new(dispatcher), dir.path().join("files"), concurrency).unwrap()
}

async fn serve(server: &MockServer, route: &str, status: u16, body: &[u8], content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(status)
                .insert_header("content-type", content_type)
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

fn read(root: &Path, relative: &str) -> Vec<u8> {
    std::fs::read(root.join("files").join(relative)).unwrap()
}

#[tokio::test]
async fn test_record_files_stored_by_role() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, "/download", 200, b"%PDF-1.7 main", "application/pdf").await;
    serve(&server, "/tables/s1.CSV", 200, b"a,b\n1,2\n", "text/plain").await;
    serve(&server, "/reviews/1", 200, b"review text", "text/plain").await;
    serve(&server, "/comments/a1.docx", 200, b"docx", "application/octet-stream").await;
    serve(&server, "/figures/fig1", 200, b"\x89PNG", "image/png").await;

    let base = server.uri();
    let mut record: ScrapedRecord = serde_json::from_value(json!({
        "track_id": "NHLBI-42",
        "platform": "biolincc",
        "title": "Cohort study",
        "pdf_url": format!("{base}/download"),
        "supplementary_files": [format!("{base}/tables/s1.CSV")],
        "peer_review_files": [{"url": format!("{base}/reviews/1"), "round": 1}],
        "comments": [{"author": "x", "attachments": [format!("{base}/comments/a1.docx")]}],
        "image_urls": [format!("{base}/figures/fig1")]
    }))
    .unwrap();

    let dir = TempDir::new().unwrap();
    let summary = pipeline(&dir, 4).process_record(&mut record).await.unwrap();

    assert_eq!(summary.successful, 5);
    assert_eq!(summary.failed, 0);

    let image_url = format!("{base}/figures/fig1");
    let image_path = format!("images/NHLBI-42/{}.jpg", sha256_hex(image_url.as_bytes()));
    let paths: Vec<(FileRole, &str)> = summary
        .files
        .iter()
        .map(|f| (f.role, f.path.as_str()))
        .collect();
    assert_eq!(
        paths,
        [
            (FileRole::Main, "main_file/NHLBI-42.pdf"),
            (FileRole::Supplementary, "SI_file/NHLBI-42/sup_1.csv"),
            (FileRole::PeerReview, "PR_file/NHLBI-42/pr_1.txt"),
            (FileRole::CommentAttachment, "PR_file/NHLBI-42/comment_1_attach_1.docx"),
            (FileRole::Image, image_path.as_str()),
        ]
    );

    assert_eq!(read(dir.path(), "main_file/NHLBI-42.pdf"), b"%PDF-1.7 main");
    assert_eq!(
        summary.files[0].sha256.as_deref(),
        Some(sha256_hex(b"%PDF-1.7 main").as_str())
    );
    assert_eq!(summary.files[2].metadata.as_ref().unwrap()["round"], 1);
    assert_eq!(record.downloaded_files.as_ref(), Some(&summary));
}

#[tokio::test]
async fn test_failed_file_is_counted_not_fatal() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, "/paper.pdf", 200, b"%PDF", "application/pdf").await;
    serve(&server, "/gone.zip", 404, b"", "text/html").await;

    let base = server.uri();
    let mut record: ScrapedRecord = serde_json::from_value(json!({
        "track_id": "T-7",
        "pdf_url": format!("{base}/paper.pdf"),
        "supplementary_files": [format!("{base}/gone.zip")]
    }))
    .unwrap();

    let dir = TempDir::new().unwrap();
    let summary = pipeline(&dir, 2).process_record(&mut record).await.unwrap();

    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.files.len(), 1);
    assert_eq!(summary.files[0].path, "main_file/T-7.pdf");
    assert!(!dir.path().join("files/SI_file/T-7/sup_1.zip").exists());
}

#[tokio::test]
async fn test_unknown_content_type_falls_back_to_bin() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, "/blob", 200, b"opaque", "application/x-unknown").await;

    let mut record: ScrapedRecord = serde_json::from_value(json!({
        "track_id": 9001,
        "pdf_url": format!("{}/blob", server.uri())
    }))
    .unwrap();

    let dir = TempDir::new().unwrap();
    let summary = pipeline(&dir, 1).process_record(&mut record).await.unwrap();

    assert_eq!(summary.files[0].path, "main_file/9001.bin");
    assert_eq!(read(dir.path(), "main_file/9001.bin"), b"opaque");
}

#[tokio::test]
async fn test_enriched_record_keeps_unknown_fields() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, "/paper.pdf", 200, b"%PDF", "application/pdf").await;

    let mut record: ScrapedRecord = serde_json::from_value(json!({
        "track_id": "T1",
        "pdf_url": format!("{}/paper.pdf", server.uri()),
        "journal": "Circulation",
        "year": 2021
    }))
    .unwrap();

    let dir = TempDir::new().unwrap();
    pipeline(&dir, 1).process_record(&mut record).await.unwrap();

    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["journal"], "Circulation");
    assert_eq!(value["year"], 2021);
    assert_eq!(value["downloaded_files"]["successful"], 1);
    assert_eq!(
        value["downloaded_files"]["files"][0]["path"],
        "main_file/T1.pdf"
    );
}

#[tokio::test]
async fn test_repeated_image_url_is_fetched_once() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/fig.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/fig.png", server.uri());
    let mut record: ScrapedRecord = serde_json::from_value(json!({
        "track_id": "T1",
        "image_urls": [url, url]
    }))
    .unwrap();

    let dir = TempDir::new().unwrap();
    let summary = pipeline(&dir, 4).process_record(&mut record).await.unwrap();

    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        summary.files[0].path,
        format!("images/T1/{}.png", sha256_hex(url.as_bytes()))
    );
}

#[tokio::test]
async fn test_similar_track_ids_keep_separate_files() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    serve(&server, "/a.pdf", 200, b"first", "application/pdf").await;
    serve(&server, "/b.pdf", 200, b"second", "application/pdf").await;

    let base = server.uri();
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, 2);

    let mut first: ScrapedRecord = serde_json::from_value(json!({
        "track_id": "10.1/x",
        "pdf_url": format!("{base}/a.pdf")
    }))
    .unwrap();
    let mut second: ScrapedRecord = serde_json::from_value(json!({
        "track_id": "10.1_x",
        "pdf_url": format!("{base}/b.pdf")
    }))
    .unwrap();

    let first = pipeline.process_record(&mut first).await.unwrap();
    let second = pipeline.process_record(&mut second).await.unwrap();

    assert_eq!(first.files[0].path, "main_file/10.1%2Fx.pdf");
    assert_eq!(second.files[0].path, "main_file/10.1_x.pdf");
    assert_eq!(read(dir.path(), "main_file/10.1%2Fx.pdf"), b"first");
    assert_eq!(read(dir.path(), "main_file/10.1_x.pdf"), b"second");
}

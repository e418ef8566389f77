//! End-to-end tests against a running server
//!
//! These tests require the API server (`cargo run`) listening on the
//! configured address. The local mock collaborators are enough.
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:8000)

#![allow(dead_code)]

mod fixtures;

use fixtures::{png_bytes, RED};
use serde_json::{json, Value};
use std::time::Duration;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:8000".to_string())
}

async fn upload(client: &reqwest::Client, base_url: &str, name: &str, bytes: Vec<u8>) -> Value {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str("image/png")
        .expect("mime");
    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("relative_path", format!("e2e/{}", name));

    let response = client
        .post(format!("{}/upload", base_url))
        .multipart(form)
        .send()
        .await
        .expect("Upload failed");
    assert!(response.status().is_success(), "Upload returned {}", response.status());
    response.json().await.expect("Upload body")
}

/// Poll a job until it leaves the queue.
async fn wait_for_job(client: &reqwest::Client, base_url: &str, task_id: &str) -> Value {
    for _ in 0..120 {
        let job: Value = client
            .get(format!("{}/results/{}", base_url, task_id))
            .send()
            .await
            .expect("Results request failed")
            .json()
            .await
            .expect("Results body");
        match job["status"].as_str() {
            Some("completed") | Some("failed") => return job,
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
    panic!("Job {} did not finish in time", task_id);
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
    let body: Value = response.json().await.expect("Health body");
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_upload_segment_and_fetch_results() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let uploaded = upload(&client, &base_url, "e2e_red.png", png_bytes(RED)).await;
    let task_id = match uploaded["reused_task_id"].as_str() {
        Some(id) => id.to_string(),
        None => {
            let created: Value = client
                .post(format!("{}/segment/task", base_url))
                .json(&json!({
                    "image_path": uploaded["path"],
                    "file_hash": uploaded["hash"],
                    "metadata": uploaded["metadata"],
                }))
                .send()
                .await
                .expect("Task creation failed")
                .json()
                .await
                .expect("Task body");
            created["task_id"].as_str().expect("task_id").to_string()
        }
    };
    println!("  task {}", task_id);

    let job = wait_for_job(&client, &base_url, &task_id).await;
    assert_eq!(job["status"], "completed", "job: {}", job);

    for region in job["regions"].as_array().expect("regions") {
        let path = region["path"].as_str().expect("region path");
        let crop = client
            .get(format!("{}{}", base_url, path))
            .send()
            .await
            .expect("Crop request failed");
        assert!(crop.status().is_success(), "{} returned {}", path, crop.status());
    }
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_unknown_task_is_not_found() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/results/{}", base_url, uuid::Uuid::new_v4()))
        .send()
        .await
        .expect("Results request failed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
#[ignore] // Requires running API server
async fn test_e2e_clustering_round_trip() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let trigger: Value = client
        .post(format!("{}/cluster", base_url))
        .json(&json!({ "min_cluster_size": 2 }))
        .send()
        .await
        .expect("Trigger failed")
        .json()
        .await
        .expect("Trigger body");
    assert!(matches!(trigger["status"].as_str(), Some("started") | Some("already_running")));

    let mut status = Value::Null;
    for _ in 0..120 {
        status = client
            .get(format!("{}/cluster/status", base_url))
            .send()
            .await
            .expect("Status request failed")
            .json()
            .await
            .expect("Status body");
        if status["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(status["status"], "completed", "status: {}", status);

    let clusters: Value = client
        .get(format!("{}/clusters", base_url))
        .send()
        .await
        .expect("Clusters request failed")
        .json()
        .await
        .expect("Clusters body");
    assert_eq!(clusters["cached"], true);
    let grouped = clusters["total_grouped"].as_u64().unwrap_or_default();
    let ungrouped = clusters["total_ungrouped"].as_u64().unwrap_or_default();
    assert_eq!(
        clusters["embedding_map"].as_array().map(Vec::len).unwrap_or_default() as u64,
        grouped + ungrouped
    );
}

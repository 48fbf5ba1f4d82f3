mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use gallery_storage::services::events::StorageEvent;
use gallery_storage::services::storage::BlobStore;
use tower::ServiceExt;

#[tokio::test]
async fn test_upload_flow() {
    let ctx = setup().await;
    let mut events = ctx.state.events.subscribe();

    let data = payload(5000);
    let json = upload(&ctx.app, "shoot-1", "IMG_0001.JPG", "image/jpeg", &data).await;

    let file_id = json["id"].as_str().unwrap().to_string();
    assert_eq!(json["shoot_id"], "shoot-1");
    assert_eq!(json["original_name"], "IMG_0001.JPG");
    assert_eq!(json["mime_type"], "image/jpeg");
    assert_eq!(json["size_bytes"], 5000);
    assert_eq!(json["kind"], "image");
    assert_eq!(json["processing_status"], "pending");

    // Size on record equals what landed on disk
    let record = ctx.state.file_service.get_file(&file_id).await.unwrap();
    assert!(record.storage_path.ends_with(&format!("/{}.jpg", file_id)));
    let stat = ctx.state.blobs.stat(&record.storage_path).await.unwrap();
    assert!(stat.exists);
    assert_eq!(stat.size_bytes, 5000);

    match events.recv().await.unwrap() {
        StorageEvent::FileUploaded {
            file_id: event_file,
            size_bytes,
            ..
        } => {
            assert_eq!(event_file, file_id);
            assert_eq!(size_bytes, 5000);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let response = get(&ctx.app, &format!("/files/{}", file_id), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["id"], file_id.as_str());

    let response = get(&ctx.app, "/shoots/shoot-1/files", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_classifies_raw_and_sanitizes_name() {
    let ctx = setup().await;

    let json = upload(
        &ctx.app,
        "shoot-1",
        "../../DSC_1234.NEF",
        "application/octet-stream",
        &payload(100),
    )
    .await;

    assert_eq!(json["original_name"], "DSC_1234.NEF");
    assert_eq!(json["kind"], "raw");
}

#[tokio::test]
async fn test_upload_without_file_field() {
    let ctx = setup().await;
    let boundary = "XBOUNDARY";
    let body = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{boundary}--\r\n"
    );

    let response = ctx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/shoots/shoot-1/files")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_upload_over_limit_leaves_nothing_behind() {
    let ctx = setup_with(|config| config.max_upload_size = 1000).await;
    let boundary = "XBOUNDARY";

    let response = ctx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/shoots/shoot-1/files")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(multipart_body(
                    boundary,
                    "big.jpg",
                    "image/jpeg",
                    &payload(1500),
                )))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(
        ctx.state
            .file_service
            .list_files("shoot-1")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_delete_removes_record_and_blob() {
    let ctx = setup().await;
    let json = upload(&ctx.app, "shoot-1", "a.jpg", "image/jpeg", &payload(300)).await;
    let file_id = json["id"].as_str().unwrap().to_string();
    let record = ctx.state.file_service.get_file(&file_id).await.unwrap();

    let response = delete(&ctx.app, &format!("/files/{}", file_id)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = get(&ctx.app, &format!("/files/{}", file_id), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "FILE_NOT_FOUND");

    assert!(!ctx.state.blobs.stat(&record.storage_path).await.unwrap().exists);

    let response = delete(&ctx.app, &format!("/files/{}", file_id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_and_request_id() {
    let ctx = setup().await;

    let response = ctx
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-request-id"), "req-42");
    let json = body_json(response).await;
    assert_eq!(json["database"], "connected");
    assert_eq!(json["storage"], "available");

    let response = get(&ctx.app, "/health", None).await;
    assert!(!header(&response, "x-request-id").is_empty());
}

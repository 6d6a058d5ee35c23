//! End-to-end pipeline scenarios driving the Dispatcher and Worker runtime
//! together against the in-memory store/blob fakes, rather than invoking a
//! single handler in isolation (already covered by each handler's own unit
//! tests in `src/handlers/`).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use barcode_core::{Image, ImageStatus};
use barcode_engine::clients::fakes::{PassthroughNormalizer, ScriptedLlmClient, ScriptedPrimaryDecoder};
use barcode_engine::clients::{LlmCode, LlmResponse};
use barcode_engine::handlers::decode_fallback::DecodeFallbackHandler;
use barcode_engine::handlers::decode_primary::DecodePrimaryHandler;
use barcode_engine::handlers::preprocess::PreprocessHandler;
use barcode_engine::{Dispatcher, DispatcherConfig, StageHandler, Worker, WorkerConfig};
use barcode_queue::JobQueue;
use barcode_store::{BlobStore, InMemoryBlobStore, InMemoryMetadataStore, MetadataStore};
use chrono::Duration;

fn dispatcher(store: Arc<dyn MetadataStore>) -> Dispatcher {
    Dispatcher::new(
        DispatcherConfig { poll_interval: StdDuration::from_secs(1), batch_size: 10, once: true },
        Arc::new(JobQueue::new(store.clone())),
        store,
    )
}

fn worker(job_type: barcode_core::JobType, queue: Arc<JobQueue>, store: Arc<dyn MetadataStore>, handler: Arc<dyn StageHandler>) -> Worker {
    Worker::new(
        WorkerConfig {
            job_type,
            worker_id: "test-worker".to_string(),
            poll_interval: StdDuration::from_millis(10),
            lease_duration: Duration::seconds(60),
            batch_size: 10,
            once: true,
        },
        queue,
        store,
        handler,
    )
}

#[tokio::test]
async fn happy_primary_decodes_on_first_pass() {
    let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    blob.put("incoming/b1/p.jpg", b"fake-jpeg-bytes".to_vec()).await.unwrap();
    store.insert_image(Image::new("img-1", "b1", "p.jpg")).await.unwrap();

    let queue = Arc::new(JobQueue::new(store.clone()));
    dispatcher(store.clone()).run_cycle().await.unwrap();

    let preprocess_handler: Arc<dyn StageHandler> =
        Arc::new(PreprocessHandler::new(blob.clone(), store.clone(), Arc::new(PassthroughNormalizer), 2048, 0.5));
    worker(barcode_core::JobType::Preprocess, queue.clone(), store.clone(), preprocess_handler)
        .poll_once()
        .await
        .unwrap();
    assert_eq!(store.get_image("img-1").await.unwrap().status, ImageStatus::Preprocessed);

    dispatcher(store.clone()).run_cycle().await.unwrap();

    let decoder = Arc::new(ScriptedPrimaryDecoder::returning(vec!["8011642115887"]));
    let decode_handler: Arc<dyn StageHandler> = Arc::new(DecodePrimaryHandler::new(blob, decoder));
    worker(barcode_core::JobType::DecodePrimary, queue, store.clone(), decode_handler)
        .poll_once()
        .await
        .unwrap();

    let image = store.get_image("img-1").await.unwrap();
    assert_eq!(image.status, ImageStatus::DecodedPrimary);

    let detections = store.list_detections("img-1").await.unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].code, "8011642115887");
    assert_eq!(detections[0].normalized_code.as_deref(), Some("8011642115887"));
    assert!(detections[0].checksum_valid);
    assert!(!detections[0].chosen);
}

#[tokio::test]
async fn fallback_resolves_when_primary_finds_nothing() {
    let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    blob.put("incoming/b1/p.jpg", b"fake-jpeg-bytes".to_vec()).await.unwrap();
    store.insert_image(Image::new("img-1", "b1", "p.jpg")).await.unwrap();
    let queue = Arc::new(JobQueue::new(store.clone()));

    dispatcher(store.clone()).run_cycle().await.unwrap();
    let preprocess_handler: Arc<dyn StageHandler> =
        Arc::new(PreprocessHandler::new(blob.clone(), store.clone(), Arc::new(PassthroughNormalizer), 2048, 0.5));
    worker(barcode_core::JobType::Preprocess, queue.clone(), store.clone(), preprocess_handler)
        .poll_once()
        .await
        .unwrap();

    dispatcher(store.clone()).run_cycle().await.unwrap();
    let no_codes_decoder = Arc::new(ScriptedPrimaryDecoder::returning_none());
    let decode_handler: Arc<dyn StageHandler> = Arc::new(DecodePrimaryHandler::new(blob.clone(), no_codes_decoder));
    worker(barcode_core::JobType::DecodePrimary, queue.clone(), store.clone(), decode_handler)
        .poll_once()
        .await
        .unwrap();
    assert!(store.get_image("img-1").await.unwrap().processing.needs_fallback);

    dispatcher(store.clone()).run_cycle().await.unwrap();
    let llm = Arc::new(ScriptedLlmClient::single(LlmResponse {
        codes: vec![LlmCode { code: "4006381333931".to_string(), symbology: "EAN-13".to_string(), confidence: 0.9 }],
        token_count: 200,
    }));
    let fallback_handler: Arc<dyn StageHandler> = Arc::new(DecodeFallbackHandler::new(blob, llm));
    worker(barcode_core::JobType::DecodeFallback, queue, store.clone(), fallback_handler)
        .poll_once()
        .await
        .unwrap();

    let image = store.get_image("img-1").await.unwrap();
    assert_eq!(image.status, ImageStatus::DecodedFallback);
    let detections = store.list_detections("img-1").await.unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].source, barcode_core::DetectionSource::FallbackGemini);
    assert_eq!(detections[0].gemini_confidence, Some(0.9));
}

#[tokio::test]
async fn failed_fallback_is_retried_by_dispatcher_after_delay_and_then_succeeds() {
    let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    blob.put("preprocessed/b1/img-1.jpg", b"bytes".to_vec()).await.unwrap();

    let mut image = Image::new("img-1", "b1", "p.jpg");
    image.status = ImageStatus::Preprocessed;
    image.preprocessing.normalized_path = Some("preprocessed/b1/img-1.jpg".to_string());
    image.processing.needs_fallback = true;
    store.insert_image(image).await.unwrap();
    let queue = Arc::new(JobQueue::new(store.clone()));

    dispatcher(store.clone()).run_cycle().await.unwrap();
    let empty_llm = Arc::new(ScriptedLlmClient::single(LlmResponse::default()));
    let failing_handler: Arc<dyn StageHandler> = Arc::new(DecodeFallbackHandler::new(blob.clone(), empty_llm));
    worker(barcode_core::JobType::DecodeFallback, queue.clone(), store.clone(), failing_handler)
        .poll_once()
        .await
        .unwrap();

    let image = store.get_image("img-1").await.unwrap();
    assert_eq!(image.status, ImageStatus::Failed);
    assert_eq!(image.processing.fallback_attempts, 1);

    // Too soon: the Dispatcher must not re-seed before FAILED_RETRY_DELAY.
    let enqueued = dispatcher(store.clone()).run_cycle().await.unwrap();
    assert_eq!(enqueued, 0);

    // Backdate the status timestamp to simulate the 30s delay elapsing.
    store
        .update_image_cas(
            "img-1",
            ImageStatus::Failed,
            Box::new(|img| img.status_updated_at = chrono::Utc::now() - chrono::Duration::seconds(31)),
        )
        .await
        .unwrap();
    let enqueued = dispatcher(store.clone()).run_cycle().await.unwrap();
    assert_eq!(enqueued, 1);

    let succeeding_llm = Arc::new(ScriptedLlmClient::single(LlmResponse {
        codes: vec![LlmCode { code: "8011642115887".to_string(), symbology: "EAN-13".to_string(), confidence: 0.95 }],
        token_count: 100,
    }));
    let succeeding_handler: Arc<dyn StageHandler> = Arc::new(DecodeFallbackHandler::new(blob, succeeding_llm));
    worker(barcode_core::JobType::DecodeFallback, queue, store.clone(), succeeding_handler)
        .poll_once()
        .await
        .unwrap();

    let image = store.get_image("img-1").await.unwrap();
    assert_eq!(image.status, ImageStatus::DecodedFallback);
    assert_eq!(image.processing.fallback_attempts, 2);
}

#[tokio::test]
async fn dispatcher_reaps_a_crashed_workers_lease_and_a_second_worker_completes_it() {
    let blob: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    blob.put("incoming/b1/p.jpg", b"bytes".to_vec()).await.unwrap();
    store.insert_image(Image::new("img-1", "b1", "p.jpg")).await.unwrap();
    let queue = Arc::new(JobQueue::new(store.clone()));

    let (job_id, _) = queue
        .enqueue(barcode_core::JobType::Preprocess, "img-1", "b1", 0, chrono::Utc::now(), 3)
        .await
        .unwrap();

    // First worker leases the job (simulating a crash: it never completes).
    let leased = queue.lease(barcode_core::JobType::Preprocess, "worker-a", Duration::seconds(-1), 1).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].job_id, job_id);

    // The lease is already expired (negative duration); the Dispatcher reaps it.
    let reaped = queue.reap(chrono::Utc::now()).await.unwrap();
    assert_eq!(reaped, vec![job_id]);

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, barcode_core::JobStatus::Pending);

    // A second worker leases and completes it cleanly.
    let preprocess_handler: Arc<dyn StageHandler> =
        Arc::new(PreprocessHandler::new(blob, store.clone(), Arc::new(PassthroughNormalizer), 2048, 0.5));
    let second = worker(barcode_core::JobType::Preprocess, queue, store.clone(), preprocess_handler);
    let leased_count = second.poll_once().await.unwrap();
    assert_eq!(leased_count, 1);

    let image = store.get_image("img-1").await.unwrap();
    assert_eq!(image.status, ImageStatus::Preprocessed);

    let job = store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, barcode_core::JobStatus::Completed);
    assert_eq!(job.attempt, 2);
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value as JsonValue, json};

use plansight_ai::{FailureCause, Job, JobId, JobStatus, ModelType, NewJob, RetentionPolicy, RetryPolicy};
use plansight_core::TenantId;
use plansight_infra::config::WorkerConfig;
use plansight_infra::jobs::{
    ConcurrencyGate, Dispatcher, DispatcherConfig, ExecuteOptions, ExecuteOutcome, ExecutionCoordinator,
    ExecutionSettings, InMemoryJobStore, JobService, JobStore,
};
use plansight_infra::{HttpRecognitionWorker, InMemorySubjectRepository, Subject, SubjectRepository};

/// One scripted worker reply.
#[derive(Clone)]
struct Reply {
    status: StatusCode,
    body: JsonValue,
    delay: Duration,
}

impl Reply {
    fn ok(body: JsonValue) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            delay: Duration::ZERO,
        }
    }

    fn status(status: StatusCode) -> Self {
        Self {
            status,
            body: json!({"error": "model warming up"}),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok(json!({"detections": []}))
        }
    }
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(Option<String>, JsonValue)>>,
}

async fn recognize(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push((auth, body));

    let reply = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Reply::status(StatusCode::INTERNAL_SERVER_ERROR));
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    (reply.status, Json(reply.body)).into_response()
}

/// Recognition worker stand-in bound to an ephemeral port.
struct MockWorker {
    base_url: String,
    state: Arc<MockState>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockWorker {
    async fn spawn(script: Vec<Reply>) -> Self {
        let state = Arc::new(MockState {
            script: Mutex::new(script.into()),
            ..Default::default()
        });
        let app = Router::new()
            .route("/api/v1/detect/symbols", post(recognize))
            .route("/api/v1/ocr", post(recognize))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            state,
            handle,
        }
    }

    fn calls(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Harness {
    worker: MockWorker,
    store: Arc<InMemoryJobStore>,
    subjects: Arc<InMemorySubjectRepository>,
    coordinator: Arc<ExecutionCoordinator>,
    service: JobService,
    tenant: TenantId,
    subject: Subject,
}

async fn harness(script: Vec<Reply>, limit: usize, retry: RetryPolicy) -> Harness {
    let worker = MockWorker::spawn(script).await;
    let client = HttpRecognitionWorker::new(&WorkerConfig {
        base_url: worker.base_url.clone(),
        api_token: Some("secret-token".to_string()),
        ..Default::default()
    })
    .unwrap();

    let store = InMemoryJobStore::arc();
    let subjects = Arc::new(InMemorySubjectRepository::new());
    let tenant = TenantId::new();
    let subject = Subject::new(tenant, "Level 2 plan", "s3://plans/level-2.pdf", "application/pdf");
    subjects.insert(subject.clone());

    let coordinator = ExecutionCoordinator::new(
        store.clone(),
        Arc::new(client),
        subjects.clone(),
        ConcurrencyGate::new(limit),
        retry,
        ExecutionSettings {
            worker_id: "it-worker".to_string(),
            default_timeout: Duration::from_secs(5),
        },
    );
    let service = JobService::new(Arc::clone(&coordinator), subjects.clone(), RetentionPolicy::default());

    Harness {
        worker,
        store,
        subjects,
        coordinator,
        service,
        tenant,
        subject,
    }
}

async fn submit(h: &Harness, model_type: ModelType) -> Job {
    h.service
        .create(h.tenant, NewJob::new("sheet", h.subject.id, model_type))
        .await
        .unwrap()
}

async fn wait_for_status(h: &Harness, job_id: JobId, status: JobStatus) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = h.store.get(h.tenant, job_id).await.unwrap().unwrap();
        if job.status == status {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job stayed {} instead of reaching {}",
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start(h: &Harness, job_id: JobId, options: ExecuteOptions) -> plansight_infra::jobs::ExecutionHandle {
    match h.service.execute(h.tenant, job_id, options).await.unwrap() {
        ExecuteOutcome::Started(handle) => handle,
        ExecuteOutcome::Queued(job) => panic!("job {} was queued", job.id),
    }
}

#[tokio::test]
async fn two_failures_then_success_completes_on_third_attempt() {
    let h = harness(
        vec![
            Reply::status(StatusCode::SERVICE_UNAVAILABLE),
            Reply::status(StatusCode::BAD_GATEWAY),
            Reply::ok(json!({
                "detections": [
                    {"label": "door", "confidence": 0.92, "bbox": [10, 10, 40, 90]},
                    {"label": "window", "confidence": 0.81}
                ],
                "model_version": "sym-2.3"
            })),
        ],
        3,
        RetryPolicy::fixed(3, Duration::from_millis(20)),
    )
    .await;
    let job = submit(&h, ModelType::SymbolDetection).await;

    let dispatcher = Dispatcher::new(
        Arc::clone(&h.coordinator),
        DispatcherConfig::default().with_poll_interval(Duration::from_millis(20)),
    )
    .spawn();
    let done = wait_for_status(&h, job.id, JobStatus::Completed).await;
    dispatcher.shutdown().await;

    assert_eq!(done.attempt_count, 3);
    assert_eq!(done.error_history.len(), 2);
    assert_eq!(done.error_history[0].cause, FailureCause::WorkerStatus { status: 503 });
    assert_eq!(done.error_history[1].attempt_number, 2);
    assert_eq!(done.progress, 100);
    assert!(done.next_retry_at.is_none());

    let results = done.results.unwrap();
    assert_eq!(results.statistics.count, 2);
    assert_eq!(results.statistics.model_version.as_deref(), Some("sym-2.3"));
    assert_eq!(h.worker.calls(), 3);

    let subject = h.subjects.get_by_id(h.tenant, h.subject.id).await.unwrap();
    let summary = subject.ai_summary.unwrap();
    assert_eq!(summary.job_id, job.id);
    assert_eq!(summary.detection_count, 2);
}

#[tokio::test]
async fn oversized_error_body_is_truncated_in_history() {
    let h = harness(
        vec![Reply {
            body: json!({"error": "x".repeat(200_000)}),
            ..Reply::status(StatusCode::BAD_GATEWAY)
        }],
        3,
        RetryPolicy::fixed(3, Duration::from_secs(60)),
    )
    .await;
    let job = submit(&h, ModelType::SymbolDetection).await;

    let err = start(&h, job.id, ExecuteOptions::default()).await.wait().await.unwrap_err();

    assert!(err.is_retryable());
    let failed = h.store.get(h.tenant, job.id).await.unwrap().unwrap();
    let record = &failed.error_history[0];
    assert_eq!(record.cause, FailureCause::WorkerStatus { status: 502 });
    let detail = record.detail.as_deref().unwrap();
    assert_eq!(detail.chars().count(), 500);
    assert!(detail.starts_with(r#"{"error":"xxx"#));
}

#[tokio::test]
async fn worker_receives_subject_reference_and_token() {
    let h = harness(
        vec![Reply::ok(json!({"text": "GROUND FLOOR PLAN"}))],
        3,
        RetryPolicy::default(),
    )
    .await;
    let job = submit(&h, ModelType::TextExtraction).await;

    let done = start(&h, job.id, ExecuteOptions::default()).await.wait().await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(
        done.results.unwrap().extracted_text.as_deref(),
        Some("GROUND FLOOR PLAN")
    );

    let requests = h.worker.state.requests.lock().unwrap();
    let (auth, body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(body["fileRef"], "s3://plans/level-2.pdf");
    assert_eq!(body["mimeType"], "application/pdf");
    assert_eq!(body["jobId"], job.id.to_string());
}

#[tokio::test]
async fn slow_worker_times_out_and_schedules_retry() {
    let h = harness(
        vec![Reply::slow(Duration::from_secs(2))],
        3,
        RetryPolicy::fixed(3, Duration::from_secs(60)),
    )
    .await;
    let job = submit(&h, ModelType::SymbolDetection).await;

    let options = ExecuteOptions {
        timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let err = start(&h, job.id, options).await.wait().await.unwrap_err();

    assert!(err.is_retryable());
    let failed = h.store.get(h.tenant, job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.error_history[0].cause, FailureCause::Timeout);
    assert!(failed.can_retry());
    assert!(failed.next_retry_at.is_some());
}

#[tokio::test]
async fn tenant_limit_queues_excess_jobs() {
    let h = harness(
        vec![Reply::slow(Duration::from_millis(300))],
        1,
        RetryPolicy::default(),
    )
    .await;
    let first = submit(&h, ModelType::SymbolDetection).await;
    let second = submit(&h, ModelType::SymbolDetection).await;

    let running = start(&h, first.id, ExecuteOptions::default()).await;
    let outcome = h
        .service
        .execute(h.tenant, second.id, ExecuteOptions::default())
        .await
        .unwrap();

    match outcome {
        ExecuteOutcome::Queued(job) => assert_eq!(job.status, JobStatus::Queued),
        ExecuteOutcome::Started(_) => panic!("second job should wait for a slot"),
    }
    assert_eq!(h.coordinator.gate().in_flight(h.tenant), 1);

    running.wait().await.unwrap();
    assert_eq!(h.coordinator.gate().in_flight(h.tenant), 0);
    let queue = h.service.queue(h.tenant, 10).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].id, second.id);
}

#[tokio::test]
async fn cancelling_aborts_the_worker_call() {
    let h = harness(
        vec![Reply::slow(Duration::from_secs(10))],
        3,
        RetryPolicy::default(),
    )
    .await;
    let job = submit(&h, ModelType::SymbolDetection).await;

    let handle = start(&h, job.id, ExecuteOptions::default()).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while h.worker.calls() == 0 {
        assert!(Instant::now() < deadline, "worker was never called");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    h.service
        .cancel(h.tenant, job.id, Some("drawing superseded"))
        .await
        .unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(2), handle.join())
        .await
        .expect("attempt kept running after cancel")
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(ended.status, JobStatus::Cancelled);
    assert_eq!(ended.cancellation_reason.as_deref(), Some("drawing superseded"));
    assert!(ended.error_history.is_empty());
    assert!(!h.coordinator.is_running(job.id));
    assert_eq!(h.coordinator.gate().in_flight(h.tenant), 0);
}

#[tokio::test]
async fn empty_detections_complete_with_zero_statistics() {
    let h = harness(
        vec![Reply::ok(json!({"detections": []}))],
        3,
        RetryPolicy::default(),
    )
    .await;
    let job = submit(&h, ModelType::SymbolDetection).await;

    let done = start(&h, job.id, ExecuteOptions::default()).await.wait().await.unwrap();

    let stats = done.results.unwrap().statistics;
    assert_eq!(stats.count, 0);
    assert_eq!(stats.confidence_avg, 0.0);
    assert!(!stats.confidence_min.is_nan());

    let overview = h.service.statistics(h.tenant, None).await.unwrap();
    assert_eq!(overview.average_confidence, 0.0);
    assert_eq!(overview.total_detections, 0);
}

#[tokio::test]
async fn exhausted_job_reruns_only_when_forced() {
    let h = harness(
        vec![
            Reply::status(StatusCode::INTERNAL_SERVER_ERROR),
            Reply::ok(json!({"detections": [{"label": "stair", "confidence": 0.7}]})),
        ],
        3,
        RetryPolicy::fixed(1, Duration::from_millis(10)),
    )
    .await;
    let job = submit(&h, ModelType::SymbolDetection).await;

    let err = start(&h, job.id, ExecuteOptions::default())
        .await
        .wait()
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let refused = h
        .service
        .execute(h.tenant, job.id, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(refused, plansight_infra::JobError::Conflict(_)));

    let done = start(&h, job.id, ExecuteOptions::forced()).await.wait().await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt_count, 1);
    assert_eq!(done.error_history.len(), 1);
    assert!(
        done.processing_log
            .iter()
            .any(|e| e.message.contains("concurrency gate bypassed"))
    );
}

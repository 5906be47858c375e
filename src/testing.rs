//! Test doubles and fixtures shared by the unit test suites.

use async_trait::async_trait;
use axum::Router;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::api::{self, AppState};
use crate::auth;
use crate::config::Settings;
use crate::db::{self, DbPool};
use crate::dispatcher::JobDispatcher;
use crate::hub::BroadcastHub;
use crate::models::{
    AnalysisJob, AnalysisType, Completion, DispatchTask, EventPayload, NewJob, TrackingPayload,
};
use crate::policy::RateLimiter;
use crate::queue::{JobQueue, QueueResult};
use crate::repository::JobRepository;
use crate::storage::{MediaStorage, StorageError};
use crate::vision::{AnalysisRequest, AnalysisService, VisionError};
use crate::webhook::WebhookIngestor;

pub const OWNER: &str = "coach-1";
pub const WEBHOOK_SECRET: &str = "hook-secret";
pub const TOKEN_SECRET: &str = "token-secret";

// --- FIXTURES ---

pub async fn seed_video(pool: &DbPool, video_id: &str, owner_id: &str) {
    sqlx::query("INSERT INTO videos (id, owner_id, storage_key, sport) VALUES (?, ?, ?, NULL)")
        .bind(video_id)
        .bind(owner_id)
        .bind(format!("uploads/{}.mp4", video_id))
        .execute(pool)
        .await
        .unwrap();
}

pub async fn seed_match(pool: &DbPool, match_id: &str) {
    sqlx::query("INSERT INTO matches (id) VALUES (?)")
        .bind(match_id)
        .execute(pool)
        .await
        .unwrap();
}

pub async fn match_status(pool: &DbPool, match_id: &str) -> String {
    sqlx::query_scalar("SELECT analysis_status FROM matches WHERE id = ?")
        .bind(match_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Makes every QUEUED -> PROCESSING write fail, as a lost database would.
pub async fn block_processing_writes(pool: &DbPool) {
    sqlx::query(
        "CREATE TRIGGER block_processing BEFORE UPDATE OF status ON analysis_jobs \
         WHEN NEW.status = 'PROCESSING' BEGIN SELECT RAISE(ABORT, 'injected'); END",
    )
    .execute(pool)
    .await
    .unwrap();
}

pub async fn create_job(repo: &JobRepository, job_id: &str, video_id: &str, user_id: &str) -> AnalysisJob {
    create_job_for_match(repo, job_id, video_id, user_id, None).await
}

pub async fn create_job_for_match(
    repo: &JobRepository,
    job_id: &str,
    video_id: &str,
    user_id: &str,
    match_id: Option<&str>,
) -> AnalysisJob {
    repo.create_job(&NewJob {
        id: job_id.to_string(),
        video_id: video_id.to_string(),
        match_id: match_id.map(str::to_string),
        analysis_type: AnalysisType::FullMatch,
        model_config: json!({"detector": "yolo"}),
        user_id: user_id.to_string(),
    })
    .await
    .unwrap()
}

pub fn event(kind: &str, timestamp: f64, player: Option<&str>) -> EventPayload {
    EventPayload {
        event_type: kind.to_string(),
        timestamp,
        player_id: player.map(str::to_string),
        metadata: json!({"source": "test"}),
    }
}

pub fn tracking(jersey: i64) -> TrackingPayload {
    TrackingPayload {
        player_id: Some(format!("player-{}", jersey)),
        jersey_number: Some(jersey),
        distance_covered: Some(9_800.0 + jersey as f64),
        top_speed: Some(31.2),
        sprint_count: Some(14),
        tracking_data: json!([[0.0, 10.0, 20.0]]),
        heatmap_data: json!({"grid": [[1, 0], [0, 1]]}),
    }
}

/// A completion with `trackings` players and `events` distinct events.
pub fn completion(trackings: usize, events: usize) -> Completion {
    Completion {
        result_data: json!({"possession": {"home": 54, "away": 46}}),
        trackings: (1..=trackings as i64).map(tracking).collect(),
        events: (0..events).map(|i| event("PASS", 10.0 * (i as f64 + 1.0), Some("p7"))).collect(),
    }
}

pub fn settings() -> Settings {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("WEBHOOK_SECRET", WEBHOOK_SECRET),
        ("TOKEN_SECRET", TOKEN_SECRET),
        ("S3_BUCKET_NAME", "pitchside-test"),
        ("PUBLIC_BASE_URL", "http://pitchside.test"),
    ]);
    Settings::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
}

pub fn bearer(user_id: &str) -> String {
    let expires = chrono::Utc::now().timestamp() + 3600;
    format!("Bearer {}", auth::sign_token(TOKEN_SECRET, user_id, expires).unwrap())
}

// --- STORAGE ---

#[derive(Debug, Clone, Copy)]
pub enum StorageMode {
    Ok,
    NotFound,
    Unavailable,
}

pub struct StubStorage {
    mode: StorageMode,
}

impl StubStorage {
    pub fn new(mode: StorageMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl MediaStorage for StubStorage {
    async fn presigned_read_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        match self.mode {
            StorageMode::Ok => Ok(format!("https://media.test/{}?ttl={}", key, ttl.as_secs())),
            StorageMode::NotFound => Err(StorageError::NotFound(key.to_string())),
            StorageMode::Unavailable => Err(StorageError::Unavailable("connection reset".into())),
        }
    }
}

// --- VISION SERVICE ---

#[derive(Debug, Clone, Copy)]
pub enum VisionMode {
    Accept,
    /// Every submission is rejected with this status.
    Reject(StatusCode),
    /// The first n submissions get a 503, later ones are accepted.
    FailFirst(usize),
    /// Every call fails, status lookups and cancels included.
    Down,
}

pub struct StubVision {
    mode: VisionMode,
    submits: AtomicUsize,
    accepted: Mutex<Vec<AnalysisRequest>>,
    cancels: Mutex<Vec<String>>,
}

impl StubVision {
    pub fn new(mode: VisionMode) -> Self {
        Self {
            mode,
            submits: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    /// Accepted requests.
    pub fn submitted(&self) -> Vec<AnalysisRequest> {
        self.accepted.lock().unwrap().clone()
    }

    /// Every submission attempt, accepted or not.
    pub fn attempts(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalysisService for StubVision {
    async fn submit(&self, request: &AnalysisRequest) -> Result<(), VisionError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);

        let outcome = match self.mode {
            VisionMode::Accept => Ok(()),
            VisionMode::Reject(status) => Err(VisionError::Status(status)),
            VisionMode::FailFirst(failures) if n < failures => {
                Err(VisionError::Status(StatusCode::SERVICE_UNAVAILABLE))
            }
            VisionMode::FailFirst(_) => Ok(()),
            VisionMode::Down => Err(VisionError::Status(StatusCode::SERVICE_UNAVAILABLE)),
        };
        if outcome.is_ok() {
            self.accepted.lock().unwrap().push(request.clone());
        }
        outcome
    }

    async fn get_status(&self, job_id: &str) -> Result<Value, VisionError> {
        match self.mode {
            VisionMode::Down => Err(VisionError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            _ => Ok(json!({"job_id": job_id, "status": "PROCESSING", "progress": 42})),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<(), VisionError> {
        self.cancels.lock().unwrap().push(job_id.to_string());
        match self.mode {
            VisionMode::Down => Err(VisionError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            _ => Ok(()),
        }
    }
}

// --- QUEUE ---

#[derive(Default)]
struct QueueState {
    main: VecDeque<DispatchTask>,
    processing: Vec<DispatchTask>,
    delayed: Vec<(Instant, DispatchTask)>,
    dead: Vec<DispatchTask>,
    acknowledged: Vec<DispatchTask>,
}

/// In-process stand-in for the Redis queue with the same list semantics.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn pending(&self) -> Vec<DispatchTask> {
        self.state.lock().unwrap().main.iter().cloned().collect()
    }

    pub fn in_processing(&self) -> Vec<DispatchTask> {
        self.state.lock().unwrap().processing.clone()
    }

    pub fn delayed(&self) -> Vec<DispatchTask> {
        self.state.lock().unwrap().delayed.iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn dead_letters(&self) -> Vec<DispatchTask> {
        self.state.lock().unwrap().dead.clone()
    }

    pub fn acknowledged(&self) -> Vec<DispatchTask> {
        self.state.lock().unwrap().acknowledged.clone()
    }

    fn take_processing(state: &mut QueueState, task: &DispatchTask) -> bool {
        match state.processing.iter().position(|t| t == task) {
            Some(index) => {
                state.processing.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, task: DispatchTask) -> QueueResult<()> {
        self.state.lock().unwrap().main.push_back(task);
        Ok(())
    }

    async fn dequeue(&self) -> QueueResult<Option<DispatchTask>> {
        let task = {
            let mut state = self.state.lock().unwrap();
            let task = state.main.pop_front();
            if let Some(task) = &task {
                state.processing.push(task.clone());
            }
            task
        };
        if task.is_none() {
            // Stand-in for the blocking pop timeout.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(task)
    }

    async fn acknowledge(&self, task: &DispatchTask) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_processing(&mut state, task);
        state.acknowledged.push(task.clone());
        Ok(())
    }

    async fn retry_later(&self, task: &DispatchTask, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_processing(&mut state, task);
        state.delayed.push((Instant::now() + delay, task.next_attempt()));
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.delayed).into_iter().partition(|(at, _)| *at <= now);
        state.delayed = waiting;
        let count = due.len();
        state.main.extend(due.into_iter().map(|(_, task)| task));
        Ok(count)
    }

    async fn dead_letter(&self, task: &DispatchTask) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_processing(&mut state, task);
        state.dead.push(task.clone());
        Ok(())
    }

    async fn restore_stranded(&self) -> QueueResult<usize> {
        let mut state = self.state.lock().unwrap();
        let stranded = std::mem::take(&mut state.processing);
        let count = stranded.len();
        state.main.extend(stranded);
        Ok(count)
    }

    async fn backlog(&self) -> QueueResult<usize> {
        let state = self.state.lock().unwrap();
        Ok(state.main.len() + state.delayed.len())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

// --- APPLICATION ---

pub struct TestApp {
    pub state: Arc<AppState>,
    pub queue: Arc<MemoryQueue>,
    pub vision: Arc<StubVision>,
}

impl TestApp {
    pub fn router(&self) -> Router {
        api::create_router(self.state.clone())
    }
}

/// Full application state over in-memory SQLite and test doubles, with
/// video `v1` owned by [`OWNER`].
pub async fn app(vision_mode: VisionMode, storage_mode: StorageMode) -> TestApp {
    let pool = db::memory_pool().await;
    seed_video(&pool, "v1", OWNER).await;

    let settings = settings();
    let repo = JobRepository::new(pool);
    let queue = Arc::new(MemoryQueue::default());
    let vision = Arc::new(StubVision::new(vision_mode));
    let hub = Arc::new(BroadcastHub::new());

    let dispatcher = Arc::new(JobDispatcher::new(
        repo.clone(),
        Arc::new(StubStorage::new(storage_mode)),
        vision.clone(),
        settings.webhook_url(),
        settings.media_url_ttl,
        settings.default_sport.clone(),
    ));

    let state = Arc::new(AppState {
        repo: repo.clone(),
        queue: queue.clone(),
        dispatcher,
        limiter: Arc::new(RateLimiter::from_policy(&settings.policy)),
        vision: vision.clone(),
        ingestor: WebhookIngestor::new(repo, hub.clone()),
        hub,
        settings,
    });

    TestApp { state, queue, vision }
}

//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which opens a file-backed store in a temp
//! directory, wires a [`WorkerContext`] around [`FakeCollaborators`], and
//! offers helpers to seed items and drive the queue until it is quiet.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use sf_core::config::{BackoffKind, Config, DatabaseConfig, RetryConfig};
use sf_core::events::EventBus;
use sf_core::{SourceItemId, Stage};
use sf_db::models::{NewSourceItem, SourceItem};
use sf_db::queries::source_items;
use sf_db::{DbPool, PooledConnection};
use sf_pipeline::{
    AudioArtifact, Collaborators, EnrichRequest, Enricher, FetchQuery, FetchedItem, Fetcher,
    NarrateRequest, Narrator, PartPayload, Publication, PublishRequest, Publisher, RenderRequest,
    Renderer, StageError, StageResult, VideoArtifact,
};
use sf_worker::{ReviewService, WorkerContext};

/// Collaborators whose failures are queued up front.
///
/// Stage failures pop in order; publish failures are keyed by part index.
#[derive(Default)]
pub struct FakeCollaborators {
    parts: usize,
    fetched: Mutex<Vec<FetchedItem>>,
    failures: Mutex<HashMap<Stage, VecDeque<StageError>>>,
    publish_failures: Mutex<HashMap<u32, VecDeque<StageError>>>,
    publish_calls: AtomicUsize,
}

impl FakeCollaborators {
    pub fn splitting_into(parts: usize) -> Self {
        Self {
            parts,
            ..Default::default()
        }
    }

    pub fn fail(self, stage: Stage, error: StageError) -> Self {
        self.failures.lock().entry(stage).or_default().push_back(error);
        self
    }

    pub fn fail_publish(self, part_index: u32, error: StageError, times: usize) -> Self {
        self.publish_failures
            .lock()
            .entry(part_index)
            .or_default()
            .extend(std::iter::repeat(error).take(times));
        self
    }

    pub fn with_fetched(self, items: Vec<FetchedItem>) -> Self {
        *self.fetched.lock() = items;
        self
    }

    pub fn publish_count(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    fn pop(&self, stage: Stage) -> StageResult<()> {
        match self.failures.lock().get_mut(&stage).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            fetcher: self.clone(),
            enricher: self.clone(),
            narrator: self.clone(),
            renderer: self.clone(),
            publisher: self.clone(),
        }
    }
}

#[async_trait]
impl Fetcher for FakeCollaborators {
    async fn fetch(&self, query: &FetchQuery) -> Vec<FetchedItem> {
        self.fetched.lock().iter().take(query.limit).cloned().collect()
    }
}

#[async_trait]
impl Enricher for FakeCollaborators {
    async fn split(&self, request: &EnrichRequest) -> StageResult<Vec<PartPayload>> {
        self.pop(Stage::Script)?;
        Ok((1..=self.parts)
            .map(|i| PartPayload {
                script: format!("{} ({i}/{})", request.title, self.parts),
            })
            .collect())
    }
}

#[async_trait]
impl Narrator for FakeCollaborators {
    async fn narrate(&self, request: &NarrateRequest) -> StageResult<AudioArtifact> {
        self.pop(Stage::Audio)?;
        Ok(AudioArtifact {
            path: format!("audio/{}.mp3", request.part_id),
            duration_secs: 30.0 + f64::from(request.part_index),
        })
    }
}

#[async_trait]
impl Renderer for FakeCollaborators {
    async fn render(&self, request: &RenderRequest) -> StageResult<VideoArtifact> {
        self.pop(Stage::Video)?;
        Ok(VideoArtifact {
            path: format!("video/{}.mp4", request.part_id),
        })
    }
}

#[async_trait]
impl Publisher for FakeCollaborators {
    async fn publish(&self, request: &PublishRequest) -> StageResult<Publication> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .publish_failures
            .lock()
            .get_mut(&request.part_index)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(e) => Err(e),
            None => Ok(Publication {
                platform_ref: format!("v{}", 122 + request.part_index),
                platform_url: Some(format!("https://shorts.test/v{}", 122 + request.part_index)),
            }),
        }
    }
}

/// Config with zero-delay retries and no quota, so every rescheduled task is
/// due immediately.
pub fn fast_config() -> Config {
    let immediate = RetryConfig {
        max_retries: 3,
        backoff: BackoffKind::Fixed,
        base_delay_secs: 0,
        max_delay_secs: 0,
    };
    let mut config = Config::default();
    config.retry = immediate.clone();
    config.publish.retry = immediate;
    config.publish.daily_limit = None;
    config.worker.stage_timeout_secs = None;
    config.worker.poll_interval_ms = 20;
    config
}

/// A worker context over a temp-file store plus the fakes behind it.
pub struct TestHarness {
    pub ctx: WorkerContext,
    pub db: DbPool,
    pub fakes: Arc<FakeCollaborators>,
    _dir: TempDir,
}

impl TestHarness {
    pub fn new(fakes: FakeCollaborators) -> Self {
        Self::with_config(fast_config(), fakes)
    }

    pub fn with_config(mut config: Config, fakes: FakeCollaborators) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        config.database = DatabaseConfig {
            path: dir.path().join("storyforge.db"),
            ..DatabaseConfig::default()
        };
        let db = sf_db::init_pool(&config.database).expect("failed to open temp database");

        let fakes = Arc::new(fakes);
        let ctx = WorkerContext::new(
            db.clone(),
            Arc::new(config),
            Arc::new(EventBus::default()),
            fakes.collaborators(),
        );

        Self {
            ctx,
            db,
            fakes,
            _dir: dir,
        }
    }

    pub fn conn(&self) -> PooledConnection {
        sf_db::get_conn(&self.db).expect("failed to get connection")
    }

    pub fn review(&self) -> ReviewService {
        ReviewService::from_context(&self.ctx)
    }

    /// Insert a pending item.
    pub fn insert_item(&self, external_id: &str) -> SourceItemId {
        source_items::insert_if_new(
            &self.conn(),
            &NewSourceItem {
                source: "nosleep".into(),
                external_id: external_id.into(),
                title: format!("Story {external_id}"),
                body: "The house at the end of the road had no doors.".into(),
            },
        )
        .expect("insert failed")
        .expect("item already existed")
        .id
    }

    /// Insert and approve an item.
    pub fn approved_item(&self, external_id: &str) -> SourceItemId {
        let id = self.insert_item(external_id);
        self.review().approve(id).expect("approve failed");
        id
    }

    pub fn item(&self, id: SourceItemId) -> SourceItem {
        source_items::require_item(&self.conn(), id).expect("item missing")
    }

    /// Process due tasks until the queue is quiet.
    pub async fn drain(&self) -> usize {
        sf_worker::drain(&self.ctx, "test-worker", &CancellationToken::new())
            .await
            .expect("drain failed")
    }
}

/// A fetched item whose body is `chars` characters long.
pub fn fetched(external_id: &str, chars: usize) -> FetchedItem {
    FetchedItem {
        source: "nosleep".into(),
        external_id: external_id.into(),
        title: format!("Fetched {external_id}"),
        body: "x".repeat(chars),
    }
}

//! Scripted collaborators and context builders for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sf_core::config::{BackoffKind, Config, RetryConfig};
use sf_core::events::EventBus;
use sf_core::{SourceItemId, Stage};
use sf_db::models::NewSourceItem;
use sf_db::queries::source_items;
use sf_pipeline::*;

use crate::context::WorkerContext;

/// Collaborators whose failures are queued up front.
///
/// Each stage pops its next queued error, or succeeds when none is left.
/// Publish failures are queued per part index.
#[derive(Default)]
pub struct Scripted {
    pub parts: usize,
    pub fetched: Mutex<Vec<FetchedItem>>,
    failures: Mutex<HashMap<Stage, VecDeque<StageError>>>,
    publish_failures: Mutex<HashMap<u32, VecDeque<StageError>>>,
    pub publish_calls: AtomicUsize,
}

impl Scripted {
    pub fn new(parts: usize) -> Self {
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
        {
            let mut map = self.publish_failures.lock();
            let queue = map.entry(part_index).or_default();
            for _ in 0..times {
                queue.push_back(error.clone());
            }
        }
        self
    }

    fn next_failure(&self, stage: Stage) -> StageResult<()> {
        match self.failures.lock().get_mut(&stage).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn into_collaborators(self) -> Collaborators {
        let me = Arc::new(self);
        Collaborators {
            fetcher: me.clone(),
            enricher: me.clone(),
            narrator: me.clone(),
            renderer: me.clone(),
            publisher: me,
        }
    }
}

#[async_trait]
impl Fetcher for Scripted {
    async fn fetch(&self, _query: &FetchQuery) -> Vec<FetchedItem> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl Enricher for Scripted {
    async fn split(&self, request: &EnrichRequest) -> StageResult<Vec<PartPayload>> {
        self.next_failure(Stage::Script)?;
        Ok((1..=self.parts)
            .map(|i| PartPayload {
                script: format!("{} part {i}", request.title),
            })
            .collect())
    }
}

#[async_trait]
impl Narrator for Scripted {
    async fn narrate(&self, request: &NarrateRequest) -> StageResult<AudioArtifact> {
        self.next_failure(Stage::Audio)?;
        Ok(AudioArtifact {
            path: format!("/tmp/storyforge/{}.mp3", request.part_id),
            duration_secs: 45.0,
        })
    }
}

#[async_trait]
impl Renderer for Scripted {
    async fn render(&self, request: &RenderRequest) -> StageResult<VideoArtifact> {
        self.next_failure(Stage::Video)?;
        Ok(VideoArtifact {
            path: format!("/tmp/storyforge/{}.mp4", request.part_id),
        })
    }
}

#[async_trait]
impl Publisher for Scripted {
    async fn publish(&self, request: &PublishRequest) -> StageResult<Publication> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .publish_failures
            .lock()
            .get_mut(&request.part_index)
            .and_then(|q| q.pop_front());
        match failure {
            Some(e) => Err(e),
            None => Ok(Publication {
                platform_ref: format!("v{}", request.part_index),
                platform_url: Some(format!("https://example.test/v{}", request.part_index)),
            }),
        }
    }
}

/// Config with immediate retries so rescheduled tasks are due at once.
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
    config
}

/// Context over a fresh in-memory store.
pub fn context(config: Config, collaborators: Collaborators) -> WorkerContext {
    WorkerContext::new(
        sf_db::init_memory_pool().expect("memory pool"),
        Arc::new(config),
        Arc::new(EventBus::default()),
        collaborators,
    )
}

/// Insert a pending item.
pub fn insert_item(ctx: &WorkerContext, external_id: &str) -> SourceItemId {
    let conn = sf_db::get_conn(&ctx.db).expect("conn");
    source_items::insert_if_new(
        &conn,
        &NewSourceItem {
            source: "nosleep".into(),
            external_id: external_id.into(),
            title: "The Lighthouse".into(),
            body: "The light went out at midnight.".into(),
        },
    )
    .expect("insert")
    .expect("new item")
    .id
}

pub mod crtsh;
pub mod hackertarget;
pub mod securitytrails;
pub mod web_archive;

use crate::session::Session;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::crtsh::CrtSh;
use self::hackertarget::HackerTarget;
use self::securitytrails::SecurityTrails;
use self::web_archive::WebArchive;

const RESULT_QUEUE_CAPACITY: usize = 64;

pub fn builtin_sources() -> Vec<Arc<dyn Source>> {
    vec![
        Arc::new(CrtSh::new()),
        Arc::new(HackerTarget::new()),
        Arc::new(SecurityTrails::new()),
        Arc::new(WebArchive::new()),
    ]
}

// region:        --- Results

#[derive(Debug)]
pub struct ScrapeResult {
    pub source: &'static str,
    pub kind: ResultKind,
}

#[derive(Debug)]
pub enum ResultKind {
    Subdomain(String),
    Error(Error),
}

impl ScrapeResult {
    pub fn subdomain(source: &'static str, value: impl Into<String>) -> Self {
        Self {
            source,
            kind: ResultKind::Subdomain(value.into()),
        }
    }

    pub fn error(source: &'static str, error: Error) -> Self {
        Self {
            source,
            kind: ResultKind::Error(error),
        }
    }
}

pub type ResultStream = BoxStream<'static, ScrapeResult>;

/// Write half of a source's result queue, tags everything with the source name.
#[derive(Clone)]
pub struct ResultSender {
    source: &'static str,
    tx: mpsc::Sender<ScrapeResult>,
}

impl ResultSender {
    /// Returns `false` once nobody listens anymore, the source should stop.
    pub async fn subdomain(&self, value: impl Into<String>) -> bool {
        self.tx
            .send(ScrapeResult::subdomain(self.source, value))
            .await
            .is_ok()
    }

    pub async fn error(&self, error: Error) -> bool {
        self.tx
            .send(ScrapeResult::error(self.source, error))
            .await
            .is_ok()
    }
}

pub fn result_channel(source: &'static str, capacity: usize) -> (ResultSender, ResultStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (ResultSender { source, tx }, ReceiverStream::new(rx).boxed())
}

// endregion:     --- Results

// region:        --- Source state

/// Injected credentials plus the duration of the last run.
#[derive(Debug, Default)]
pub struct SourceState {
    keys: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    time_taken: Mutex<Duration>,
}

impl SourceState {
    pub fn set_keys(&self, keys: Vec<String>) {
        *self.keys.write() = keys;
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.read().clone()
    }

    /// Round-robin over the injected keys.
    pub fn next_key(&self) -> Option<String> {
        let keys = self.keys.read();
        if keys.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % keys.len();
        keys.get(i).cloned()
    }

    pub fn record_run(&self, elapsed: Duration) {
        *self.time_taken.lock() = elapsed;
    }

    pub fn time_taken(&self) -> Duration {
        *self.time_taken.lock()
    }
}

// endregion:     --- Source state

#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// Lowercase identifier, also the key of the provider configuration.
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn is_default(&self) -> bool;
    fn has_recursive_support(&self) -> bool;
    fn needs_key(&self) -> bool;
    fn state(&self) -> &SourceState;

    /// Provider specific query, pushes everything it finds into `results`.
    async fn enumerate(
        &self,
        ctx: &CancellationToken,
        domain: &str,
        session: &Session,
        results: &ResultSender,
    ) -> Result<()>;

    fn add_api_keys(&self, keys: Vec<String>) {
        self.state().set_keys(keys);
    }

    fn has_api_keys(&self) -> bool {
        !self.state().keys().is_empty()
    }

    fn time_taken(&self) -> Duration {
        self.state().time_taken()
    }

    /// Starts the query on its own task. The stream ends when the source is done, a failure
    /// that stops it is sent as a last error result.
    fn run(self: Arc<Self>, ctx: CancellationToken, domain: String, session: Arc<Session>) -> ResultStream {
        let (results, stream) = result_channel(self.name(), RESULT_QUEUE_CAPACITY);

        tokio::spawn(async move {
            let start = Instant::now();
            debug!("{:12} - {} on {:?}", "START", self.name(), domain);

            if let Err(err) = self.enumerate(&ctx, &domain, &session, &results).await {
                if ctx.is_cancelled() {
                    debug!("{}: stopped by cancellation ({})", self.name(), err);
                } else {
                    warn!("{}: {}", self.name(), err);
                    results.error(err).await;
                }
            }

            self.state().record_run(start.elapsed());
            debug!("{:12} - {} in {:?}", "DONE", self.name(), start.elapsed());
        });

        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_key_rotates() {
        let state = SourceState::default();
        assert_eq!(state.next_key(), None);

        state.set_keys(vec!["a".to_string(), "b".to_string()]);

        assert_eq!(state.next_key().as_deref(), Some("a"));
        assert_eq!(state.next_key().as_deref(), Some("b"));
        assert_eq!(state.next_key().as_deref(), Some("a"));
    }

    #[test]
    fn builtin_names_are_unique_and_lowercase() {
        let sources = builtin_sources();
        let mut names: Vec<&str> = sources.iter().map(|source| source.name()).collect();
        assert!(names.iter().all(|name| *name == name.to_lowercase()));

        names.sort();
        names.dedup();
        assert_eq!(names.len(), sources.len());
    }

    #[tokio::test]
    async fn sender_reports_closed_queue() {
        let (results, stream) = result_channel("test", 1);
        assert!(results.subdomain("a.example.com").await);

        drop(stream);
        assert!(!results.subdomain("b.example.com").await);
    }
}

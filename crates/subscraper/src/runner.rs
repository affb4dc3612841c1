use crate::extractor;
use crate::model::{Discovery, Enumeration, SourceError};
use crate::session::Session;
use crate::sources::{ResultKind, ScrapeResult, Source};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

// region:        --- Constants

const RUN_TIMEOUT_SECS: u64 = 600;
const MERGE_QUEUE_CAPACITY: usize = 256;
// stand-in deadline when the requested timeout does not fit in an Instant
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

// endregion:     --- Constants

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Deadline of the whole run, recursion included.
    pub timeout: Duration,
    /// Tighter limit for a single source in a single pass.
    pub source_timeout: Option<Duration>,
    /// Nested passes allowed below the requested domain, 0 disables recursion.
    pub max_depth: usize,
    pub queue_capacity: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(RUN_TIMEOUT_SECS),
            source_timeout: None,
            max_depth: 0,
            queue_capacity: MERGE_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cut {
    Deadline,
    Cancelled,
}

enum Event {
    Result(ScrapeResult),
    Finished {
        source: &'static str,
        time_taken: Duration,
    },
}

/// Everything a run accumulates. Only the consumer loop writes here, nested passes borrow it.
struct RunState {
    seen: HashSet<String>,
    /// Names reported by at least one recursive source, duplicates included.
    recursive_hits: HashSet<String>,
    subdomains: Vec<Discovery>,
    errors: Vec<SourceError>,
    timings: BTreeMap<&'static str, Duration>,
    ctx: CancellationToken,
    deadline: Instant,
}

pub struct Runner {
    sources: Vec<Arc<dyn Source>>,
    session: Arc<Session>,
    options: RunnerOptions,
    listener: Option<mpsc::UnboundedSender<Discovery>>,
}

// region:        --- Constructors

impl Runner {
    pub fn new(sources: Vec<Arc<dyn Source>>, session: Arc<Session>, options: RunnerOptions) -> Self {
        Self {
            sources,
            session,
            options,
            listener: None,
        }
    }

    /// Every new discovery is also pushed to `listener` as soon as it is accepted.
    pub fn with_listener(mut self, listener: mpsc::UnboundedSender<Discovery>) -> Self {
        self.listener = Some(listener);
        self
    }
}

// endregion:     --- Constructors

// region:        --- Run

impl Runner {
    pub async fn enumerate(&self, domain: &str) -> Result<Enumeration> {
        self.enumerate_with_token(domain, CancellationToken::new())
            .await
    }

    /// Like [`Runner::enumerate`], cancelling `ctx` ends the run early with what was found so far.
    #[instrument(name = "run", level = "info", skip_all, fields(domain = domain))]
    pub async fn enumerate_with_token(&self, domain: &str, ctx: CancellationToken) -> Result<Enumeration> {
        let started = Instant::now();
        let domain = extractor::normalize(domain);
        if !extractor::is_hostname(&domain) {
            return Err(Error::Configuration(format!("invalid domain {:?}", domain)));
        }

        let (active, skipped) = self.resolve_sources();
        if active.is_empty() {
            return Err(Error::Configuration(format!(
                "no active sources for {} ({} skipped for missing keys)",
                domain,
                skipped.len()
            )));
        }
        info!(
            "Enumerating {} with {} sources ({} skipped)",
            domain,
            active.len(),
            skipped.len()
        );

        let run_ctx = ctx.child_token();
        let mut state = RunState {
            seen: HashSet::new(),
            recursive_hits: HashSet::new(),
            subdomains: Vec::new(),
            errors: Vec::new(),
            timings: BTreeMap::new(),
            ctx: run_ctx.clone(),
            deadline: deadline_after(started, self.options.timeout),
        };

        self.pass(domain.clone(), &active, self.options.max_depth, &mut state)
            .await;
        run_ctx.cancel();

        info!(
            "{} subdomains for {}, {} source errors, in {:?}",
            state.subdomains.len(),
            domain,
            state.errors.len(),
            started.elapsed()
        );

        Ok(Enumeration {
            domain,
            subdomains: state.subdomains,
            errors: state.errors,
            timings: state.timings,
            skipped,
            elapsed: started.elapsed(),
        })
    }

    /// Injects configured keys and drops the sources that cannot run without one.
    fn resolve_sources(&self) -> (Vec<Arc<dyn Source>>, Vec<&'static str>) {
        let mut active: Vec<Arc<dyn Source>> = Vec::with_capacity(self.sources.len());
        let mut skipped = Vec::new();

        for source in &self.sources {
            let name = source.name();
            if skipped.contains(&name) || active.iter().any(|known| known.name() == name) {
                continue;
            }
            if !source.needs_key() {
                active.push(Arc::clone(source));
                continue;
            }

            let keys = self.session.api_keys(name);
            if !keys.is_empty() {
                source.add_api_keys(keys.to_vec());
            }
            if !source.has_api_keys() {
                debug!("{:12} - {} (no api key)", "SKIPPED", name);
                skipped.push(name);
                continue;
            }
            active.push(Arc::clone(source));
        }

        (active, skipped)
    }

    /// One fan-out / fan-in round on `domain`, then the nested rounds it qualifies for.
    fn pass<'a>(
        &'a self,
        domain: String,
        active: &'a [Arc<dyn Source>],
        budget: usize,
        state: &'a mut RunState,
    ) -> BoxFuture<'a, ()> {
        async move {
            let pass_ctx = state.ctx.child_token();
            let run_ctx = state.ctx.clone();
            let started = Instant::now();
            let first_new = state.subdomains.len();
            let recursive: HashSet<&'static str> = active
                .iter()
                .filter(|source| source.has_recursive_support())
                .map(|source| source.name())
                .collect();

            let (merge_tx, mut merge_rx) = mpsc::channel(self.options.queue_capacity);
            for source in active {
                self.dispatch(Arc::clone(source), &domain, pass_ctx.child_token(), merge_tx.clone());
            }
            // the queue closes once every forwarder is done
            drop(merge_tx);

            let mut running: HashSet<&'static str> = active.iter().map(|source| source.name()).collect();
            let deadline = sleep_until(state.deadline);
            tokio::pin!(deadline);

            let cut = loop {
                tokio::select! {
                    event = merge_rx.recv() => match event {
                        Some(event) => self.handle(&domain, event, &recursive, &mut running, state),
                        None => break None,
                    },
                    _ = &mut deadline => {
                        warn!("Deadline reached on {}, {} sources still running", domain, running.len());
                        break Some(Cut::Deadline);
                    }
                    _ = run_ctx.cancelled() => {
                        warn!("Run cancelled on {}, {} sources still running", domain, running.len());
                        break Some(Cut::Cancelled);
                    }
                }
            };

            if let Some(cut) = cut {
                // keep what was already queued, then account for the sources left behind
                while let Ok(event) = merge_rx.try_recv() {
                    self.handle(&domain, event, &recursive, &mut running, state);
                }
                let elapsed = started.elapsed();
                let mut unfinished: Vec<&'static str> = running.drain().collect();
                unfinished.sort_unstable();
                for source in unfinished {
                    let error = match cut {
                        Cut::Deadline => Error::Timeout {
                            source,
                            after: elapsed,
                        },
                        Cut::Cancelled => Error::Cancelled,
                    };
                    state.errors.push(SourceError { source, error });
                    *state.timings.entry(source).or_default() += elapsed;
                }
            }
            pass_ctx.cancel();

            if budget == 0 {
                return;
            }

            let seeds: Vec<String> = state.subdomains[first_new..]
                .iter()
                .filter(|discovery| discovery.host != domain && state.recursive_hits.contains(&discovery.host))
                .map(|discovery| discovery.host.clone())
                .collect();

            for seed in seeds {
                if run_ctx.is_cancelled() || Instant::now() >= state.deadline {
                    debug!("No time left, recursion stops at {}", domain);
                    break;
                }
                info!("{:12} - {:?} ({} levels left)", "RECURSING", seed, budget - 1);
                self.pass(seed, active, budget - 1, state).await;
            }
        }
        .boxed()
    }

    /// Runs `source` and forwards its stream into the merge queue, under the per-source timeout.
    fn dispatch(
        &self,
        source: Arc<dyn Source>,
        domain: &str,
        ctx: CancellationToken,
        merge_tx: mpsc::Sender<Event>,
    ) {
        let session = Arc::clone(&self.session);
        let domain = domain.to_string();
        let source_timeout = self.options.source_timeout;

        tokio::spawn(async move {
            let name = source.name();
            let started = Instant::now();
            let mut stream = Arc::clone(&source).run(ctx.clone(), domain, session);

            let timer = async move {
                match source_timeout {
                    Some(after) => sleep(after).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(timer);

            let completed = loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(result) => {
                            if merge_tx.send(Event::Result(result)).await.is_err() {
                                break false;
                            }
                        }
                        None => break true,
                    },
                    _ = &mut timer => {
                        let after = source_timeout.unwrap_or_default();
                        warn!("{}: timed out after {:?}", name, after);
                        ctx.cancel();
                        let timeout = Error::Timeout { source: name, after };
                        let _ = merge_tx.send(Event::Result(ScrapeResult::error(name, timeout))).await;
                        break false;
                    }
                    _ = ctx.cancelled() => break false,
                }
            };

            // a cut source never got to measure itself
            let time_taken = if completed {
                source.time_taken()
            } else {
                started.elapsed()
            };
            let _ = merge_tx
                .send(Event::Finished {
                    source: name,
                    time_taken,
                })
                .await;
        });
    }

    fn handle(
        &self,
        domain: &str,
        event: Event,
        recursive: &HashSet<&'static str>,
        running: &mut HashSet<&'static str>,
        state: &mut RunState,
    ) {
        match event {
            Event::Result(result) => self.record(domain, result, recursive, state),
            Event::Finished { source, time_taken } => {
                running.remove(source);
                debug!("{:12} - {} in {:?}", "FINISHED", source, time_taken);
                *state.timings.entry(source).or_default() += time_taken;
            }
        }
    }

    fn record(
        &self,
        domain: &str,
        result: ScrapeResult,
        recursive: &HashSet<&'static str>,
        state: &mut RunState,
    ) {
        match result.kind {
            ResultKind::Subdomain(value) => {
                let host = extractor::normalize(&value);
                if !extractor::is_subdomain_of(&host, domain) || !extractor::is_hostname(&host) {
                    trace!("{:12} - {:?} ({})", "REJECTED", host, result.source);
                    return;
                }
                if recursive.contains(result.source) && !state.recursive_hits.contains(&host) {
                    state.recursive_hits.insert(host.clone());
                }
                if !state.seen.insert(host.clone()) {
                    return;
                }

                debug!("{:12} - {:?} ({})", "DISCOVERED", host, result.source);
                let discovery = Discovery {
                    host,
                    source: result.source,
                };
                if let Some(listener) = &self.listener {
                    let _ = listener.send(discovery.clone());
                }
                state.subdomains.push(discovery);
            }
            ResultKind::Error(error) => {
                debug!("{:12} - {}: {}", "SOURCE ERROR", result.source, error);
                state.errors.push(SourceError {
                    source: result.source,
                    error,
                });
            }
        }
    }
}

fn deadline_after(started: Instant, timeout: Duration) -> Instant {
    started
        .checked_add(timeout)
        .or_else(|| started.checked_add(Duration::from_secs(FAR_FUTURE_SECS)))
        .unwrap_or(started)
}

// endregion:     --- Run

//! Racing reads across regions
//!
//! A racing read sends the same GetItem to every configured region at once
//! and takes the first successful answer. Calls still in flight when the race
//! is decided are not cancelled; they are drained in the background so their
//! latency and status still show up in logs and metrics.

use crate::error::{Error, Result};
use crate::item::{ItemKey, StoredItem};
use crate::wire::{Failure, WireClient};
use crate::timer;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use metrics::{counter, histogram};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Host hook for work that should run after the response has been sent.
///
/// Serverless hosts typically offer something like this (a `waitUntil`
/// callback); when it is configured, background drains are handed to it
/// instead of being spawned.
pub trait AfterResponse: Send + Sync {
    /// Schedules `task` to run to completion after the current response
    fn wait_until(&self, task: BoxFuture<'static, ()>);
}

/// Registry of detached background tasks
///
/// Tasks keep running when the registry, or the store owning it, is dropped.
/// The host can await `wait_idle` at shutdown so outstanding drains finish.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.pending())
            .finish()
    }
}

impl BackgroundTasks {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns `task` on the current tokio runtime.
    ///
    /// Returns false, dropping the task, when called outside a runtime.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("no tokio runtime, dropping background task");
            return false;
        };

        let mut handles = self.handles();
        // forget finished tasks so the list doesn't grow without bound
        handles.retain(|h| !h.is_finished());
        handles.push(runtime.spawn(task));
        true
    }

    /// Number of tasks still running
    pub fn pending(&self) -> usize {
        self.handles().iter().filter(|h| !h.is_finished()).count()
    }

    /// Waits until every task spawned so far, and any spawned meanwhile, has finished
    pub async fn wait_idle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.handles());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    log::warn!("background task failed: {}", e);
                }
            }
        }
    }
}

/// Winner of a racing read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceWin {
    /// Region that answered first with success
    pub region: String,
    /// The item, `None` when the region reported it absent
    pub item: Option<StoredItem>,
    /// Time from launch until the winning answer
    pub elapsed: Duration,
}

struct Settled {
    region: String,
    result: std::result::Result<Option<StoredItem>, Failure>,
    elapsed: Duration,
}

type Pending = FuturesUnordered<BoxFuture<'static, Settled>>;

/// Issues racing reads over every configured region
pub struct RacingReader {
    client: Arc<WireClient>,
    tasks: Arc<BackgroundTasks>,
    after_response: Option<Arc<dyn AfterResponse>>,
}

impl fmt::Debug for RacingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RacingReader")
            .field("regions", &self.client.config().regions)
            .field("after_response", &self.after_response.is_some())
            .finish()
    }
}

impl RacingReader {
    /// Creates a reader whose drains go to `tasks`
    pub fn new(client: Arc<WireClient>, tasks: Arc<BackgroundTasks>) -> Self {
        Self {
            client,
            tasks,
            after_response: None,
        }
    }

    /// Hands drains to the host's after-response hook instead of spawning them
    pub fn with_after_response(mut self, hook: Arc<dyn AfterResponse>) -> Self {
        self.after_response = Some(hook);
        self
    }

    /// Reads `key` from every region and returns the first success.
    ///
    /// `name` is the logical key reported when every region fails.
    pub async fn race_read(&self, name: &str, key: &ItemKey) -> Result<RaceWin> {
        let _timer = timer!("chunkstore.race.read");
        let start = Instant::now();

        let mut pending: Pending = self
            .client
            .config()
            .regions
            .iter()
            .map(|region| {
                let client = Arc::clone(&self.client);
                let region = region.clone();
                let key = key.clone();
                async move {
                    let result = client.get_item(&region, &key).await;
                    Settled {
                        region,
                        result,
                        elapsed: start.elapsed(),
                    }
                }
                .boxed()
            })
            .collect();

        let mut failures = Vec::new();
        while let Some(settled) = pending.next().await {
            match settled.result {
                Ok(item) => {
                    log::debug!(
                        "race for {} won by {} in {:?}",
                        key,
                        settled.region,
                        settled.elapsed
                    );
                    self.drain(pending);
                    return Ok(RaceWin {
                        region: settled.region,
                        item,
                        elapsed: settled.elapsed,
                    });
                }
                Err(failure) => {
                    log::debug!("race for {} lost by {}: {}", key, settled.region, failure);
                    failures.push(failure.to_string());
                }
            }
        }

        counter!("chunkstore.race.failure", 1);
        log::warn!("every region failed to read {}", name);
        Err(Error::TotalUnavailability {
            key: name.to_string(),
            failures,
        })
    }

    fn drain(&self, mut pending: Pending) {
        if pending.is_empty() {
            return;
        }

        let task = async move {
            while let Some(settled) = pending.next().await {
                histogram!(
                    "chunkstore.race.straggler",
                    settled.elapsed,
                    "region" => settled.region.clone()
                );
                match settled.result {
                    Ok(_) => log::debug!("straggler {} answered in {:?}", settled.region, settled.elapsed),
                    Err(failure) => log::debug!(
                        "straggler {} failed in {:?}: {}",
                        settled.region,
                        settled.elapsed,
                        failure
                    ),
                }
            }
        };

        match &self.after_response {
            Some(hook) => hook.wait_until(task.boxed()),
            None => {
                self.tasks.spawn(task);
            }
        }
    }
}

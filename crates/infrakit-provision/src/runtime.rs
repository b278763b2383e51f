//! Controller runtime
//!
//! Watches every declared input, maps changes to request ids and runs
//! [`reconcile`] for them: at most `concurrency` requests at once and never
//! two runs for the same request. Triggers arriving while a request is
//! running coalesce into one follow-up run.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use infrakit_common::retry::{retry_with_backoff_if, RetryConfig};
use infrakit_common::store::{EventKind, WatchEvent};
use infrakit_common::{Error, Result};

use crate::controller::{
    error_policy, map_input, reconcile, register_provider, Context, ControllerSpec, Input,
    InputMode,
};
use crate::health::HealthReporter;
use crate::teardown::sweep_orphans;

/// Attempts to subscribe to a watch before the runtime gives up
const WATCH_ATTEMPTS: u32 = 10;

/// What to do with a request after a reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `after`, even without changes
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Reconcile again only when an input changes
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Requeue interval, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Pending request ids, deduplicated, plus the set currently running
#[derive(Debug, Default)]
struct WorkQueue {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    running: HashSet<String>,
    dirty: HashSet<String>,
}

impl WorkQueue {
    fn push(&mut self, id: String) {
        if self.running.contains(&id) {
            self.dirty.insert(id);
        } else if self.queued.insert(id.clone()) {
            self.pending.push_back(id);
        }
    }

    /// Next id to run; it counts as running until [`WorkQueue::finish`]
    fn pop(&mut self) -> Option<String> {
        let id = self.pending.pop_front()?;
        self.queued.remove(&id);
        self.running.insert(id.clone());
        Some(id)
    }

    /// Mark `id` done, re-queueing it if it was triggered meanwhile
    fn finish(&mut self, id: &str) {
        self.running.remove(id);
        if self.dirty.remove(id) {
            self.push(id.to_string());
        }
    }

    fn running(&self) -> usize {
        self.running.len()
    }
}

/// Background task slot that holds at most one running task
#[derive(Debug, Default)]
struct SingleFlight {
    handle: Option<JoinHandle<()>>,
}

impl SingleFlight {
    /// Spawn `task` unless the previous one is still running
    fn try_spawn<F>(&mut self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return false;
        }
        self.handle = Some(tokio::spawn(task));
        true
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the running task, if any
    async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task failed");
            }
        }
    }
}

/// Scheduler for one provider's controller
pub struct Runtime {
    ctx: Arc<Context>,
    spec: ControllerSpec,
}

impl Runtime {
    /// Create a runtime for the controller described by `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        let spec = ControllerSpec::for_context(&ctx);
        Self { ctx, spec }
    }

    /// Controller declaration driving this runtime
    pub fn spec(&self) -> &ControllerSpec {
        &self.spec
    }

    /// Run until `cancel` fires
    ///
    /// Registers the provider, starts the health reporter, subscribes to all
    /// inputs, queues every existing request and sweeps orphans before
    /// entering the event loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let ctx = self.ctx.clone();
        ctx.config.validate()?;

        info!(controller = %self.spec.name, concurrency = ctx.config.concurrency, "starting controller");
        for output in &self.spec.outputs {
            debug!(kind = %output.kind, mode = ?output.mode, "declared output");
        }

        register_provider(&ctx).await?;

        let health = tokio::spawn(HealthReporter::new(ctx.clone()).run(cancel.child_token()));

        let inputs: Vec<Input> = self.spec.all_inputs().cloned().collect();
        let mut watches = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let stream = retry_with_backoff_if(
                &RetryConfig::with_max_attempts(WATCH_ATTEMPTS),
                &format!("watch {}", input.kind),
                |e: &Error| !matches!(e, Error::Cancelled),
                || ctx.store.watch(&input.namespace, &input.kind),
            )
            .await?;
            watches.push(stream.map(move |event| (index, event)).boxed());
        }
        let mut events = futures::stream::select_all(watches);

        let mut queue = WorkQueue::default();
        let existing = ctx
            .store
            .list(&self.spec.primary.namespace, &self.spec.primary.kind, &self.spec.primary.selector)
            .await?;
        info!(count = existing.len(), "queueing existing requests");
        for request in existing {
            queue.push(request.metadata.id);
        }

        match sweep_orphans(&ctx).await {
            Ok(removed) => debug!(removed, "startup sweep finished"),
            Err(e) => warn!(error = %e, "startup sweep failed"),
        }

        let mut sweep_timer = ctx.config.sweep_interval().map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });

        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<String>();
        let mut tasks: JoinSet<(String, Result<Action>)> = JoinSet::new();
        let mut sweep = SingleFlight::default();

        loop {
            while queue.running() < ctx.config.concurrency {
                let Some(id) = queue.pop() else { break };
                let ctx = ctx.clone();
                let token = cancel.child_token();
                tasks.spawn(async move {
                    let result = AssertUnwindSafe(reconcile(&id, ctx, token))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(Error::internal_with_context("runtime", "reconcile panicked"))
                        });
                    (id, result)
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some((index, event)) = events.next() => {
                    for id in self.affected(&inputs[index], &event) {
                        queue.push(id);
                    }
                }
                Some(id) = requeue_rx.recv() => queue.push(id),
                Some(joined) = tasks.join_next() => match joined {
                    Ok((id, result)) => {
                        let action = match result {
                            Ok(action) => {
                                debug!(request = %id, ?action, "reconciliation completed");
                                action
                            }
                            Err(e) => error_policy(&id, &e, &ctx),
                        };
                        if let Some(after) = action.requeue_after() {
                            schedule_requeue(id.clone(), after, requeue_tx.clone(), cancel.clone());
                        }
                        queue.finish(&id);
                    }
                    Err(e) => error!(error = %e, "reconcile task aborted"),
                },
                _ = tick(&mut sweep_timer) => {
                    let ctx = ctx.clone();
                    let started = sweep.try_spawn(async move {
                        if let Err(e) = sweep_orphans(&ctx).await {
                            warn!(error = %e, "periodic sweep failed");
                        }
                    });
                    if !started {
                        debug!("previous sweep still running, skipping tick");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "stopping controller");
        while let Some(joined) = tasks.join_next().await {
            if let Ok((id, Err(e))) = joined {
                debug!(request = %id, error = %e, "reconcile ended during shutdown");
            }
        }
        sweep.join().await;
        if let Err(e) = health.await {
            warn!(error = %e, "health reporter task failed");
        }
        info!(controller = %self.spec.name, "controller stopped");
        Ok(())
    }

    /// Request ids an input event should wake
    fn affected(&self, input: &Input, event: &WatchEvent) -> Vec<String> {
        let md = &event.object.metadata;
        if !input.selector.matches(&md.labels) {
            return Vec::new();
        }
        // Own writes to exclusive outputs; only their removal is interesting
        if event.kind != EventKind::Destroyed && md.owner.as_deref() == Some(self.spec.name.as_str()) {
            return Vec::new();
        }

        match input.mode {
            InputMode::Direct => vec![md.id.clone()],
            InputMode::Mapped if event.kind == EventKind::Destroyed => Vec::new(),
            InputMode::Mapped | InputMode::MappedDestroyReady => {
                match map_input(&self.ctx, &event.object) {
                    Ok(ids) => ids,
                    Err(e) => {
                        error!(
                            error = %e,
                            kind = %input.kind,
                            resource = %md.resource_ref(),
                            "failed to map input"
                        );
                        Vec::new()
                    }
                }
            }
        }
    }
}

fn schedule_requeue(
    id: String,
    after: Duration,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                let _ = tx.send(id);
            }
        }
    });
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

//! The per-vertex worker state machine.
//!
//! Each worker is the single process-wide driver for its vertex. It spawns
//! the watch task (or a poll ticker), then loops: wake on an event or a
//! poke, honor the pause handshake, sit out any rate-limit or retry delay
//! in a satellite select that keeps consuming events, and run one process
//! step. Watch failures and check-apply failures burn separate retry
//! budgets; exhausting either one is terminal for the worker and recorded
//! on its state.
//!
//! All termination producers (watch error, watch clean exit, retries
//! exhausted, vertex removal) fold into the state's single done token, so
//! every suspension point below needs exactly one extra select arm.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use converge_tooling::RateLimiter;

use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::process::{process, ProcessOutcome};
use crate::res::{MetaParams, Vertex, WatchContext, WatchEvent};
use crate::state::{ShutdownReason, State};

/// Spawn the worker task for a vertex and record its handle on the state.
pub(crate) fn start_worker(shared: &Arc<EngineShared>, vertex: &Vertex, state: &Arc<State>) {
    let _ = shared
        .events
        .send(EngineEvent::worker_started(vertex.res_key()));

    let handle = tokio::spawn({
        let shared = Arc::clone(shared);
        let vertex = vertex.clone();
        let state = Arc::clone(state);
        async move {
            let result = run_worker(shared.clone(), vertex.clone(), Arc::clone(&state)).await;
            let error = result.as_ref().err().map(|e| e.to_string());
            match &result {
                Ok(()) => info!(vertex = %vertex, "worker exited"),
                Err(e) => error!(vertex = %vertex, error = %e, "worker failed"),
            }
            if let Err(e) = result {
                state.record_worker_err(e);
            }
            let _ = shared
                .events
                .send(EngineEvent::worker_exited(vertex.res_key(), error));
        }
    });
    state.set_worker_handle(handle);
}

/// The worker main loop. Returns the terminal error, if any.
async fn run_worker(shared: Arc<EngineShared>, vertex: Vertex, state: Arc<State>) -> Result<()> {
    let meta = vertex.resource().meta_params();
    let mut events_rx = state
        .take_events_rx()
        .ok_or_else(|| Error::Engine(format!("{vertex}: worker already running")))?;
    let mut poke_rx = state
        .take_poke_rx()
        .ok_or_else(|| Error::Engine(format!("{vertex}: worker already running")))?;
    let mut pause_rx = state.pause_rx();
    let mut limiter = RateLimiter::new(meta.limit, meta.burst);
    let meta_state = shared.meta_state(&vertex);

    let watch_handle = tokio::spawn(watch_loop(
        vertex.clone(),
        Arc::clone(&state),
        meta.clone(),
    ));
    state.set_watch_handle(watch_handle);
    state.activity();
    info!(vertex = %vertex, "worker started");

    'main: loop {
        if *pause_rx.borrow_and_update() {
            if !park(&state, &vertex, &mut pause_rx).await {
                break 'main;
            }
            continue;
        }

        let mut limit_wait = None;
        tokio::select! {
            _ = state.done().cancelled() => break 'main,
            _ = pause_rx.changed() => continue,
            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        if event == WatchEvent::Running && state.mark_started() {
                            debug!(vertex = %vertex, "watch running");
                        }
                        state.set_dirty();
                        state.activity();
                        let wait = limiter.reserve();
                        if wait > Duration::ZERO {
                            limit_wait = Some(wait);
                        }
                    }
                    None => break 'main,
                }
            }
            poke = poke_rx.recv() => {
                if poke.is_none() {
                    break 'main;
                }
                state.activity();
            }
        }

        // keep the poke channel drained so senders always find room
        while poke_rx.try_recv().is_ok() {}

        if let Some(wait) = limit_wait {
            debug!(vertex = %vertex, wait_ms = wait.as_millis() as u64, "rate limited");
            if !satellite_wait(wait, &state, &vertex, &mut events_rx, &mut pause_rx, &mut limiter)
                .await
            {
                break 'main;
            }
        }

        // one reconciliation, retried on failure per the meta params
        loop {
            match process(&shared, &vertex, &state).await {
                Ok(ProcessOutcome::Deferred) => {
                    // predecessors were poked; their pokes will come back
                    trace!(vertex = %vertex, "process deferred");
                    break;
                }
                Ok(outcome) => {
                    trace!(vertex = %vertex, ?outcome, "process ok");
                    if meta.retry_reset {
                        meta_state.lock().retries = meta.retry;
                    }
                    break;
                }
                Err(Error::ShuttingDown) => break 'main,
                Err(e) => {
                    let exhausted = {
                        let mut ms = meta_state.lock();
                        if ms.retries == 0 {
                            true
                        } else {
                            if ms.retries > 0 {
                                ms.retries -= 1;
                            }
                            false
                        }
                    };
                    if exhausted {
                        error!(vertex = %vertex, error = %e, "check-apply retries exhausted");
                        state.shutdown(ShutdownReason::ProcessExhausted);
                        return Err(e);
                    }
                    warn!(
                        vertex = %vertex,
                        error = %e,
                        delay_ms = meta.delay,
                        "check-apply failed, will retry"
                    );
                    let delay = Duration::from_millis(meta.delay);
                    if !satellite_wait(
                        delay,
                        &state,
                        &vertex,
                        &mut events_rx,
                        &mut pause_rx,
                        &mut limiter,
                    )
                    .await
                    {
                        break 'main;
                    }
                }
            }
        }
    }

    match state.shutdown_reason() {
        Some(ShutdownReason::WatchError) => Err(state
            .worker_err()
            .unwrap_or_else(|| Error::Watch(format!("{vertex}: watch failed")))),
        _ => Ok(()),
    }
}

/// Sit out a delay without going deaf: events are still consumed (marking
/// the vertex dirty and burning rate-limit tokens) and the pause handshake
/// still works. Returns false on shutdown.
async fn satellite_wait(
    delay: Duration,
    state: &State,
    vertex: &Vertex,
    events_rx: &mut mpsc::Receiver<WatchEvent>,
    pause_rx: &mut watch::Receiver<bool>,
    limiter: &mut RateLimiter,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = state.done().cancelled() => return false,
            _ = &mut sleep => return true,
            _ = pause_rx.changed() => {
                if *pause_rx.borrow_and_update() && !park(state, vertex, pause_rx).await {
                    return false;
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(_) => {
                        state.set_dirty();
                        state.activity();
                        let _ = limiter.reserve();
                    }
                    None => return false,
                }
            }
        }
    }
}

/// Park until resumed. Returns false when shut down instead.
async fn park(state: &State, vertex: &Vertex, pause_rx: &mut watch::Receiver<bool>) -> bool {
    debug!(vertex = %vertex, "worker paused");
    state.ack_paused(true);
    loop {
        tokio::select! {
            _ = state.done().cancelled() => {
                state.ack_paused(false);
                return false;
            }
            changed = pause_rx.changed() => {
                if changed.is_err() {
                    state.ack_paused(false);
                    return false;
                }
                if !*pause_rx.borrow_and_update() {
                    state.ack_paused(false);
                    debug!(vertex = %vertex, "worker resumed");
                    return true;
                }
            }
        }
    }
}

/// Drive the user watch with its own retry budget, or replace it with a
/// poll ticker when the meta params ask for one.
async fn watch_loop(vertex: Vertex, state: Arc<State>, meta: MetaParams) {
    if meta.poll > 0 {
        poll_watch(vertex, state, meta.poll).await;
        return;
    }

    let mut retries = meta.retry;
    loop {
        let ctx = WatchContext::new(state.events_tx(), state.done().clone());
        let result = vertex.resource().watch(ctx).await;
        if state.done().is_cancelled() {
            return;
        }
        match result {
            Ok(()) => {
                debug!(vertex = %vertex, "watch closed");
                state.shutdown(ShutdownReason::WatchClosed);
                return;
            }
            Err(e) => {
                if retries == 0 {
                    error!(vertex = %vertex, error = %e, "watch retries exhausted");
                    state.record_worker_err(Error::Watch(format!("{vertex}: {e}")));
                    state.shutdown(ShutdownReason::WatchError);
                    return;
                }
                if retries > 0 {
                    retries -= 1;
                }
                warn!(
                    vertex = %vertex,
                    error = %e,
                    delay_ms = meta.delay,
                    "watch failed, will retry"
                );
                tokio::select! {
                    _ = state.done().cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(meta.delay)) => {}
                }
            }
        }
    }
}

/// Synthetic watch: a startup signal, then one event per poll interval.
async fn poll_watch(vertex: Vertex, state: Arc<State>, poll_secs: u32) {
    let ctx = WatchContext::new(state.events_tx(), state.done().clone());
    if ctx.running().await.is_err() {
        return;
    }
    debug!(vertex = %vertex, poll_secs, "polling instead of watching");
    let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(poll_secs)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the immediate first tick; the startup signal covered it
    loop {
        tokio::select! {
            _ = state.done().cancelled() => return,
            _ = ticker.tick() => {
                if ctx.event().await.is_err() {
                    return;
                }
            }
        }
    }
}

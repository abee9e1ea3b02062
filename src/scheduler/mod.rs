//! Booking reconciliation
//!
//! Every tick compares the booking that should be recording now against the
//! booking that is recording, and converges the camera to the former:
//!
//! | active   | recording | action              |
//! |----------|-----------|---------------------|
//! | b        | none      | start b             |
//! | b        | a ≠ b     | stop a, then start b |
//! | none     | a         | stop a              |
//! | b        | b         | nothing             |
//!
//! A separate low-frequency sweep deletes bookings that ended long ago
//! without ever being recorded.

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{Booking, SchedulerError};
use crate::recorder::{SharedController, StopOutcome};
use crate::remote::BookingSource;
use crate::storage::ArtifactStore;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between reconciliation ticks
    pub poll_interval: Duration,
    /// Time between stale-booking sweeps
    pub sweep_interval: Duration,
    /// How long after its end a booking is considered stale
    pub stale_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5 * 60),
            stale_grace: Duration::from_secs(10 * 60),
        }
    }
}

/// What a tick decided to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start(String),
    Switch { from: String, to: String },
    Stop(String),
    Hold,
}

/// Decide how to get from `recording` to `active`
pub fn reconcile(active: Option<&Booking>, recording: Option<&str>) -> Transition {
    match (active, recording) {
        (Some(b), None) => Transition::Start(b.id.clone()),
        (Some(b), Some(current)) if b.id != current => Transition::Switch {
            from: current.to_string(),
            to: b.id.clone(),
        },
        (None, Some(current)) => Transition::Stop(current.to_string()),
        _ => Transition::Hold,
    }
}

/// Periodic reconciliation of bookings against the camera
pub struct SchedulerLoop {
    config: SchedulerConfig,
    source: Arc<dyn BookingSource>,
    controller: SharedController,
    store: Arc<ArtifactStore>,
}

impl SchedulerLoop {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn BookingSource>,
        controller: SharedController,
        store: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            config,
            source,
            controller,
            store,
        }
    }

    /// Run one reconciliation step at local time `now`.
    ///
    /// On a source fault nothing changes and the error is returned; the
    /// next tick tries again.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<Transition, SchedulerError> {
        let active = self.source.get_active_booking(now).await?;

        let mut controller = self.controller.lock().await;

        let capped = active.as_ref().is_some_and(|b| controller.is_capped(&b.id));
        if !capped {
            controller.clear_cap();
        }
        let wanted = if capped { None } else { active.as_ref() };

        let recording = if controller.is_recording() {
            // A session without a booking id never matches an active booking
            Some(controller.current_booking().unwrap_or_default().to_string())
        } else {
            None
        };

        let transition = reconcile(wanted, recording.as_deref());
        match &transition {
            Transition::Start(id) => {
                info!(booking = %id, "Booking active, starting recording");
                controller.start(id).await?;
            }
            Transition::Switch { from, to } => {
                info!(booking = %to, "Switching recording from booking {}", from);
                log_stop(controller.stop().await?);
                controller.start(to).await?;
            }
            Transition::Stop(id) => {
                info!(booking = %id, "No active booking, stopping recording");
                log_stop(controller.stop().await?);
            }
            Transition::Hold => {}
        }
        Ok(transition)
    }

    /// Delete bookings that ended more than `stale_grace` before `now`.
    ///
    /// Bookings with a recording in progress or an upload still pending are
    /// left for the upload worker to release. Returns the deleted ids.
    pub async fn sweep(&self, now: NaiveDateTime) -> Result<Vec<String>, SchedulerError> {
        let grace = ChronoDuration::from_std(self.config.stale_grace).unwrap_or_else(|_| ChronoDuration::zero());
        let cutoff = now - grace;
        let expired = self.source.expired_bookings(cutoff).await?;

        let recording = self
            .controller
            .lock()
            .await
            .current_booking()
            .map(str::to_string);

        let mut deleted = Vec::new();
        for booking in expired {
            if recording.as_deref() == Some(booking.id.as_str()) {
                continue;
            }
            if self.store.references_booking(&booking.id).await {
                debug!(booking = %booking.id, "Stale booking has pending upload, skipping");
                continue;
            }
            match self.source.delete_booking(&booking.id).await {
                Ok(()) => {
                    info!(booking = %booking.id, "Deleted stale booking (ended {})", booking.ends_at());
                    deleted.push(booking.id);
                }
                Err(e) => warn!(booking = %booking.id, "Failed to delete stale booking: {}", e),
            }
        }
        Ok(deleted)
    }

    /// Reconcile every `poll_interval` until cancelled, then stop recording
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Scheduler started: polling every {:?}", self.config.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // A tick is never interrupted half-way through a stop/start
            match self.tick(Local::now().naive_local()).await {
                Ok(Transition::Hold) => {}
                Ok(transition) => debug!("Tick: {:?}", transition),
                Err(e) => warn!("Scheduler tick failed: {} ({:?})", e, e.severity()),
            }
        }

        self.shutdown().await;
    }

    /// Sweep every `sweep_interval` until cancelled
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep(Local::now().naive_local()).await {
                Ok(deleted) if !deleted.is_empty() => {
                    info!("Sweep deleted {} stale booking(s)", deleted.len())
                }
                Ok(_) => {}
                Err(e) => warn!("Stale-booking sweep failed: {}", e),
            }
        }
    }

    /// Stop any recording in progress, flushing it to the upload queue
    pub async fn shutdown(&self) {
        let mut controller = self.controller.lock().await;
        match controller.stop().await {
            Ok(StopOutcome::NotRecording) => {}
            Ok(outcome) => {
                info!("Scheduler shutting down");
                log_stop(outcome);
            }
            Err(e) => error!("Failed to stop recording on shutdown: {}", e),
        }
    }
}

fn log_stop(outcome: StopOutcome) {
    match outcome {
        StopOutcome::Queued(task) => info!("Recording stopped and queued: {}", task.destination_name),
        StopOutcome::Discarded => warn!("Recording stopped with no usable output"),
        StopOutcome::NotRecording => {}
    }
}

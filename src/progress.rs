// ABOUTME: Derives monotonic percentage, throughput and ETA from revision counters
// ABOUTME: Persists counters on the job and pushes rate-limited snapshots to a progress channel

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::info;

use crate::models::JobId;
use crate::store::{ProgressUpdate, Store};

/// Slice of overall progress owned by one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Band {
    pub start: u8,
    pub end: u8,
}

impl Band {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }
}

pub const VALIDATION_BAND: Band = Band::new(0, 10);
pub const SETUP_BAND: Band = Band::new(10, 20);
pub const FETCH_BAND: Band = Band::new(20, 70);
pub const STRATEGY_BAND: Band = Band::new(70, 85);
pub const PUSH_BAND: Band = Band::new(85, 100);

/// Observations between throughput recomputations.
const SPEED_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub progress_percentage: u8,
    pub current_revision: Option<u64>,
    pub total_revisions: Option<u64>,
    pub processing_speed: Option<f64>,
    pub eta: Option<u64>,
}

/// Fire-and-forget sink for live progress updates.
pub trait ProgressChannel: Send + Sync {
    fn publish(&self, job_id: JobId, snapshot: &ProgressSnapshot);
}

/// Logs snapshots; the default when nothing is listening.
pub struct TracingChannel;

impl ProgressChannel for TracingChannel {
    fn publish(&self, job_id: JobId, snapshot: &ProgressSnapshot) {
        info!(
            job_id,
            progress = snapshot.progress_percentage,
            revision = ?snapshot.current_revision,
            total = ?snapshot.total_revisions,
            speed = ?snapshot.processing_speed,
            eta_secs = ?snapshot.eta,
            "progress"
        );
    }
}

/// Renders snapshots on an indicatif bar.
pub struct BarChannel {
    bar: ProgressBar,
}

impl BarChannel {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for BarChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel for BarChannel {
    fn publish(&self, _job_id: JobId, snapshot: &ProgressSnapshot) {
        self.bar.set_position(u64::from(snapshot.progress_percentage));
        let mut msg = match (snapshot.current_revision, snapshot.total_revisions) {
            (Some(current), Some(total)) => format!("r{}/{}", current, total),
            (Some(current), None) => format!("r{}", current),
            _ => String::new(),
        };
        if let Some(speed) = snapshot.processing_speed {
            msg.push_str(&format!(" {:.1} rev/s", speed));
        }
        if let Some(eta) = snapshot.eta {
            msg.push_str(&format!(" eta {}s", eta));
        }
        self.bar.set_message(msg);
    }
}

/// Keeps every published snapshot; for tests and embedding.
#[derive(Default)]
pub struct RecordingChannel {
    snapshots: Mutex<Vec<(JobId, ProgressSnapshot)>>,
}

impl RecordingChannel {
    pub fn snapshots(&self) -> Vec<(JobId, ProgressSnapshot)> {
        self.snapshots
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl ProgressChannel for RecordingChannel {
    fn publish(&self, job_id: JobId, snapshot: &ProgressSnapshot) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.push((job_id, *snapshot));
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    /// Publish a snapshot every this many observed revisions.
    pub publish_every: u64,
    /// Smallest percentage step worth recording.
    pub min_delta: u8,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            publish_every: 5,
            min_delta: 1,
        }
    }
}

pub struct ProgressTracker {
    job_id: JobId,
    store: Store,
    channel: Arc<dyn ProgressChannel>,
    settings: TrackerSettings,
    band: Band,
    total: Option<u64>,
    last_progress: u8,
    observed: u64,
    started: Instant,
    first_revision: Option<u64>,
    current: Option<u64>,
    speed: Option<f64>,
    eta: Option<u64>,
}

impl ProgressTracker {
    /// `initial_progress` is what the job already shows, so a resumed run never goes backwards.
    pub fn new(
        job_id: JobId,
        store: Store,
        channel: Arc<dyn ProgressChannel>,
        settings: TrackerSettings,
        initial_progress: u8,
    ) -> Self {
        Self {
            job_id,
            store,
            channel,
            settings: TrackerSettings {
                publish_every: settings.publish_every.max(1),
                min_delta: settings.min_delta.max(1),
            },
            band: VALIDATION_BAND,
            total: None,
            last_progress: initial_progress.min(100),
            observed: 0,
            started: Instant::now(),
            first_revision: None,
            current: None,
            speed: None,
            eta: None,
        }
    }

    pub fn progress(&self) -> u8 {
        self.last_progress
    }

    pub fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
    }

    /// Moves to `band`, lifting progress to the band's start.
    pub fn enter_band(&mut self, band: Band) -> Result<()> {
        self.band = band;
        self.jump_to(band.start)
    }

    /// Marks the current band done.
    pub fn finish_band(&mut self) -> Result<()> {
        self.jump_to(self.band.end)
    }

    /// Progress for `revision` within the current band.
    pub fn percentage_for(&self, revision: u64) -> u8 {
        let width = u64::from(self.band.end.saturating_sub(self.band.start));
        let within = match self.total {
            Some(total) if total > 0 => revision.min(total) * width / total,
            _ => 0,
        };
        self.band.start + within as u8
    }

    /// Records that `revision` is now present locally.
    pub fn observe(&mut self, revision: u64) -> Result<()> {
        self.observed += 1;
        self.first_revision.get_or_insert(revision);
        self.current = Some(revision);

        if self.speed.is_none() || self.observed % SPEED_EVERY == 0 {
            self.recompute_speed();
        }

        let changed = self.apply(self.percentage_for(revision));
        let publish_due = self.observed % self.settings.publish_every == 0;
        if changed || publish_due {
            self.persist()?;
        }
        if publish_due {
            self.publish();
        }
        Ok(())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            progress_percentage: self.last_progress,
            current_revision: self.current,
            total_revisions: self.total,
            processing_speed: self.speed,
            eta: self.eta,
        }
    }

    fn jump_to(&mut self, percentage: u8) -> Result<()> {
        if self.apply(percentage) {
            self.persist()?;
            self.publish();
        }
        Ok(())
    }

    /// Accepts only increases of at least `min_delta`.
    fn apply(&mut self, percentage: u8) -> bool {
        let percentage = percentage.min(100);
        if percentage > self.last_progress
            && percentage - self.last_progress >= self.settings.min_delta
        {
            self.last_progress = percentage;
            true
        } else {
            false
        }
    }

    fn recompute_speed(&mut self) {
        let (Some(first), Some(current)) = (self.first_revision, self.current) else {
            return;
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let processed = current.saturating_sub(first);
        if elapsed <= 0.0 || processed == 0 {
            return;
        }
        let speed = processed as f64 / elapsed;
        self.speed = Some(speed);
        self.eta = match self.total {
            Some(total) if speed > 0.0 => Some((total.saturating_sub(current) as f64 / speed).ceil() as u64),
            _ => None,
        };
    }

    fn persist(&self) -> Result<()> {
        self.store.update_progress(
            self.job_id,
            &ProgressUpdate {
                current_revision: self.current,
                total_revisions: self.total,
                progress: self.last_progress,
                processing_speed: self.speed,
                eta_seconds: self.eta,
            },
        )
    }

    fn publish(&self) {
        self.channel.publish(self.job_id, &self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;
    use crate::store::tests::sample_repository;
    use std::path::Path;

    fn tracker(initial: u8) -> (Store, Arc<RecordingChannel>, ProgressTracker, JobId) {
        let store = Store::open_in_memory().unwrap();
        let repo = sample_repository(&store, Path::new("/work/legacy"));
        let job = store.create_job(repo.id, JobKind::Migration).unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let tracker = ProgressTracker::new(
            job.id,
            store.clone(),
            channel.clone(),
            TrackerSettings::default(),
            initial,
        );
        (store, channel, tracker, job.id)
    }

    #[test]
    fn test_fetch_band_mapping() {
        let (_, _, mut tracker, _) = tracker(0);
        tracker.enter_band(FETCH_BAND).unwrap();
        tracker.set_total(Some(250));
        assert_eq!(tracker.percentage_for(0), 20);
        assert_eq!(tracker.percentage_for(125), 45);
        assert_eq!(tracker.percentage_for(250), 70);
        assert_eq!(tracker.percentage_for(900), 70);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (store, channel, mut tracker, job_id) = tracker(0);
        tracker.enter_band(FETCH_BAND).unwrap();
        tracker.set_total(Some(100));
        for rev in [10, 50, 30, 60, 5, 100] {
            tracker.observe(rev).unwrap();
        }
        let mut last = 0;
        for (_, snapshot) in channel.snapshots() {
            assert!(snapshot.progress_percentage >= last);
            last = snapshot.progress_percentage;
        }
        assert_eq!(tracker.progress(), 70);
        assert_eq!(store.job(job_id).unwrap().progress, 70);
    }

    #[test]
    fn test_resumed_tracker_does_not_regress() {
        let (_, _, mut tracker, _) = tracker(55);
        tracker.enter_band(FETCH_BAND).unwrap();
        assert_eq!(tracker.progress(), 55);
        tracker.set_total(Some(100));
        tracker.observe(10).unwrap();
        assert_eq!(tracker.progress(), 55);
    }

    #[test]
    fn test_snapshots_are_rate_limited() {
        let (_, channel, mut tracker, job_id) = tracker(0);
        tracker.enter_band(FETCH_BAND).unwrap();
        let after_band = channel.snapshots().len();
        tracker.set_total(Some(1000));
        for rev in 1..=20 {
            tracker.observe(rev).unwrap();
        }
        let published = channel.snapshots().len() - after_band;
        assert_eq!(published, 4);
        assert!(channel.snapshots().iter().all(|(id, _)| *id == job_id));
    }

    #[test]
    fn test_eta_undefined_without_throughput() {
        let (_, _, mut tracker, _) = tracker(0);
        tracker.set_total(Some(10));
        tracker.observe(3).unwrap();
        assert!(tracker.snapshot().eta.is_none());
    }

    #[test]
    fn test_finish_band_reaches_end() {
        let (_, _, mut tracker, _) = tracker(0);
        tracker.enter_band(STRATEGY_BAND).unwrap();
        tracker.finish_band().unwrap();
        assert_eq!(tracker.progress(), 85);
    }
}

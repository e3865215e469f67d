//! Throughput of the streaming sessions, summarized in the log.
//!
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

use crate::{processor::fps_from_elapsed, state::AppState};

/// Period of the throughput log lines.
pub const REPORT_PERIOD: Duration = Duration::from_secs(2);

/// Frame statistics since the last report.
#[derive(Default)]
pub struct FrameMeter {
    window: Mutex<Window>,
}

#[derive(Default)]
struct Window {
    processed: u32,
    streamed: u32,
    busy: Duration,
}

/// Summary of one reporting window.
#[derive(Debug, PartialEq)]
pub struct MeterReport {
    pub processed: u32,
    pub streamed: u32,
    /// Frame rate over the time spent processing, computed like the one of `/fps`.
    pub processing_fps: f32,
}

impl FrameMeter {
    /// Count a processed frame which took `elapsed`.
    pub fn record_processed(&self, elapsed: Duration) {
        let mut window = self.lock();
        window.processed += 1;
        window.busy += elapsed;
    }

    /// Count a frame handed to an HTTP consumer.
    pub fn record_streamed(&self) {
        self.lock().streamed += 1;
    }

    /// Summary since the last call, `None` if no frame was processed or streamed.
    pub fn take_report(&self) -> Option<MeterReport> {
        let window = std::mem::take(&mut *self.lock());
        if window.processed == 0 && window.streamed == 0 {
            return None;
        }

        let mean_elapsed = match window.processed {
            0 => 0.0,
            n => window.busy.as_secs_f32() / n as f32,
        };
        Some(MeterReport {
            processed: window.processed,
            streamed: window.streamed,
            processing_fps: fps_from_elapsed(mean_elapsed),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Log the throughput of `state` every `period` while frames are flowing.
pub fn spawn_meter_logger(state: Arc<AppState>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.tick().await;

        let mut since = Instant::now();
        loop {
            ticks.tick().await;
            let window = since.elapsed().as_secs_f32();
            since = Instant::now();

            if let Some(report) = state.meter().take_report() {
                log::info!(
                    "Streamed {:.1} frames/s, processing at {:.1} fps ({} frames)",
                    report.streamed as f32 / window,
                    report.processing_fps,
                    report.processed,
                );
            }
        }
    })
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn empty_window_has_no_report() {
        assert_eq!(FrameMeter::default().take_report(), None);
    }

    #[test]
    fn report_averages_processing_time() {
        let meter = FrameMeter::default();
        meter.record_processed(Duration::from_millis(40));
        meter.record_processed(Duration::from_millis(60));
        meter.record_streamed();

        let report = meter.take_report().unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.streamed, 1);
        assert!((report.processing_fps - 20.0).abs() < 1e-3);

        // Windows start over after a report
        assert_eq!(meter.take_report(), None);
    }

    #[test]
    fn instant_frames_report_nominal_rate() {
        let meter = FrameMeter::default();
        meter.record_processed(Duration::ZERO);

        let report = meter.take_report().unwrap();
        assert_eq!(report.processing_fps, crate::processor::NOMINAL_FPS);
    }
}

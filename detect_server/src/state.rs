//! Process state shared between the HTTP handlers and the streaming loops.
//!
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use common::{Detection, Settings, SettingsPatch};
use tokio_util::sync::CancellationToken;

use crate::meter::FrameMeter;

/// Value reported before the first frame was processed.
const INITIAL_FPS: f32 = 0.0;

/// Results of the last completely processed frame.
struct LastFrame {
    detections: Arc<Vec<Detection>>,
    fps: f32,
}

/// Settings store, detection cache, throughput meter and stream cancellation.
pub struct AppState {
    settings: RwLock<Settings>,
    last_frame: Mutex<LastFrame>,
    meter: FrameMeter,
    /// Parent of the tokens handed to streaming sessions. Replaced on every stop.
    sessions: Mutex<CancellationToken>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            last_frame: Mutex::new(LastFrame {
                detections: Arc::new(Vec::new()),
                fps: INITIAL_FPS,
            }),
            meter: FrameMeter::default(),
            sessions: Mutex::new(CancellationToken::new()),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> Settings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge a partial update and return the resulting settings.
    pub fn update_settings(&self, patch: SettingsPatch) -> Settings {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.merge(patch);
        log::info!("Settings updated: {:?}", *settings);
        *settings
    }

    /// Detections of the last processed frame.
    pub fn detections(&self) -> Arc<Vec<Detection>> {
        Arc::clone(&self.lock_last_frame().detections)
    }

    /// Frame rate computed for the last processed frame.
    pub fn fps(&self) -> f32 {
        self.lock_last_frame().fps
    }

    pub fn meter(&self) -> &FrameMeter {
        &self.meter
    }

    /// Replace detections and frame rate with the results of a finished frame.
    ///
    /// Results of a session which has been stopped are discarded, so values read after
    /// `stop` returned stay those of the last frame before it. Returns whether the
    /// results were stored.
    pub fn publish(
        &self,
        session: &CancellationToken,
        detections: Vec<Detection>,
        fps: f32,
    ) -> bool {
        let mut last_frame = self.lock_last_frame();
        if session.is_cancelled() {
            return false;
        }

        last_frame.detections = Arc::new(detections);
        last_frame.fps = fps;
        true
    }

    /// Token for a new streaming session, cancelled by the next `stop`.
    pub fn begin_session(&self) -> CancellationToken {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    /// Stop all running streaming sessions.
    pub fn stop(&self) {
        // Hold the frame results while cancelling so that no session publishes afterwards
        let _last_frame = self.lock_last_frame();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.cancel();
        *sessions = CancellationToken::new();
        log::info!("Streaming sessions stopped");
    }

    fn lock_last_frame(&self) -> MutexGuard<'_, LastFrame> {
        self.last_frame.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn get_after_update_returns_merged_settings() {
        let state = AppState::default();

        let merged = state.update_settings(SettingsPatch {
            show_fps: Some(true),
            confidence_threshold: Some(0.3),
            ..Default::default()
        });

        assert_eq!(merged, state.settings());
        assert_eq!(
            state.settings(),
            Settings {
                show_fps: true,
                confidence_threshold: 0.3,
                ..Settings::default()
            }
        );
    }

    #[test]
    fn publish_replaces_last_frame() {
        let state = AppState::default();
        let session = state.begin_session();

        assert!(state.publish(&session, vec![Detection::new("dog", 0.9, [0, 0, 5, 5])], 12.5));
        assert!(state.publish(&session, vec![], 14.0));

        assert!(state.detections().is_empty());
        assert_eq!(state.fps(), 14.0);
    }

    #[test]
    fn stopped_sessions_cannot_publish() {
        let state = AppState::default();
        let session = state.begin_session();
        assert!(state.publish(&session, vec![Detection::new("cat", 0.7, [1, 2, 3, 4])], 9.0));

        state.stop();

        assert!(session.is_cancelled());
        assert!(!state.publish(&session, vec![], 99.0));
        assert_eq!(state.fps(), 9.0);
        assert_eq!(state.detections().len(), 1);

        let next_session = state.begin_session();
        assert!(!next_session.is_cancelled());
        assert!(state.publish(&next_session, vec![], 10.0));
    }
}

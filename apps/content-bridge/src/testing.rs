//! Recording doubles for the UI boundary, shared by unit and scenario tests.

use std::sync::Arc;
use std::time::Duration;

use bridge_proto::UploadStatus;
use parking_lot::Mutex;
use serde_json::Value;

use crate::dispatcher::MessageDispatcher;
use crate::ui::{FallbackNotice, NoticeKind, UiError, UiFacade, UiFactory};

#[derive(Debug, Clone, PartialEq)]
pub enum UiCall {
    Notification {
        kind: NoticeKind,
        text: String,
        duration: Duration,
    },
    UploadStatus(UploadStatus),
    ButtonState(bool),
    ShowChangedFiles,
    Message {
        kind: String,
        payload: Value,
    },
    Cleanup,
}

#[derive(Default)]
struct Recording {
    calls: Vec<UiCall>,
    built: usize,
    live: usize,
    failing_builds: usize,
    failing_handlers: bool,
}

/// Builds [`RecordingUi`] instances that log into one shared journal.
#[derive(Default)]
pub struct RecordingUiFactory {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingUiFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<UiCall> {
        self.recording.lock().calls.clone()
    }

    /// Calls other than cleanup.
    pub fn effects(&self) -> Vec<UiCall> {
        self.calls()
            .into_iter()
            .filter(|call| *call != UiCall::Cleanup)
            .collect()
    }

    pub fn notifications(&self) -> Vec<(NoticeKind, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                UiCall::Notification { kind, text, .. } => Some((kind, text)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.recording.lock().calls.clear();
    }

    pub fn instances_built(&self) -> usize {
        self.recording.lock().built
    }

    pub fn live_instances(&self) -> usize {
        self.recording.lock().live
    }

    /// The next `count` builds fail.
    pub fn fail_builds(&self, count: usize) {
        self.recording.lock().failing_builds = count;
    }

    /// Every handler returns an error while set.
    pub fn fail_handlers(&self, failing: bool) {
        self.recording.lock().failing_handlers = failing;
    }
}

impl UiFactory for RecordingUiFactory {
    fn build(&self, _dispatcher: Arc<MessageDispatcher>) -> Result<Box<dyn UiFacade>, UiError> {
        let mut recording = self.recording.lock();
        if recording.failing_builds > 0 {
            recording.failing_builds -= 1;
            return Err(UiError::Build("scripted failure".into()));
        }
        recording.built += 1;
        recording.live += 1;
        Ok(Box::new(RecordingUi {
            recording: Arc::clone(&self.recording),
            released: false,
        }))
    }
}

pub struct RecordingUi {
    recording: Arc<Mutex<Recording>>,
    released: bool,
}

impl RecordingUi {
    fn record(&mut self, call: UiCall) -> Result<(), UiError> {
        let mut recording = self.recording.lock();
        if recording.failing_handlers {
            return Err(UiError::Handler("scripted failure".into()));
        }
        recording.calls.push(call);
        Ok(())
    }
}

impl UiFacade for RecordingUi {
    fn show_notification(
        &mut self,
        kind: NoticeKind,
        text: &str,
        duration: Duration,
    ) -> Result<(), UiError> {
        self.record(UiCall::Notification {
            kind,
            text: text.to_string(),
            duration,
        })
    }

    fn update_upload_status(&mut self, status: &UploadStatus) -> Result<(), UiError> {
        self.record(UiCall::UploadStatus(status.clone()))
    }

    fn update_button_state(&mut self, valid: bool) -> Result<(), UiError> {
        self.record(UiCall::ButtonState(valid))
    }

    fn handle_show_changed_files(&mut self) -> Result<(), UiError> {
        self.record(UiCall::ShowChangedFiles)
    }

    fn handle_message(&mut self, kind: &str, payload: &Value) -> Result<(), UiError> {
        self.record(UiCall::Message {
            kind: kind.to_string(),
            payload: payload.clone(),
        })
    }

    fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut recording = self.recording.lock();
        recording.live = recording.live.saturating_sub(1);
        recording.calls.push(UiCall::Cleanup);
    }
}

#[derive(Default)]
pub struct RecordingFallback {
    notices: Mutex<Vec<String>>,
}

impl RecordingFallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

impl FallbackNotice for RecordingFallback {
    fn show_persistent(&self, text: &str) {
        self.notices.lock().push(text.to_string());
    }
}

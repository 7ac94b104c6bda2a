//! Boundary to the in-page UI layer (toasts, modals, button state).
//!
//! The UI facade is a single-owner resource: only the [`UiSlot`] held by the
//! supervisor creates, resets, or drops it, and a reset always finishes
//! releasing the previous instance before a new one can be built.

use std::sync::Arc;
use std::time::Duration;

use bridge_proto::UploadStatus;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatcher::MessageDispatcher;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UiError {
    #[error("ui construction failed: {0}")]
    Build(String),
    #[error("ui handler failed: {0}")]
    Handler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Success,
    Warning,
    Error,
}

pub trait UiFacade: Send {
    /// A zero `duration` means the notice stays until dismissed.
    fn show_notification(
        &mut self,
        kind: NoticeKind,
        text: &str,
        duration: Duration,
    ) -> Result<(), UiError>;

    fn update_upload_status(&mut self, status: &UploadStatus) -> Result<(), UiError>;

    fn update_button_state(&mut self, valid: bool) -> Result<(), UiError>;

    fn handle_show_changed_files(&mut self) -> Result<(), UiError>;

    /// Business messages the bridge does not interpret.
    fn handle_message(&mut self, kind: &str, payload: &Value) -> Result<(), UiError>;

    fn cleanup(&mut self);
}

pub trait UiFactory: Send + Sync {
    fn build(&self, dispatcher: Arc<MessageDispatcher>) -> Result<Box<dyn UiFacade>, UiError>;
}

/// Last-resort notice rendered without the UI facade, for when the facade
/// itself cannot be constructed.
pub trait FallbackNotice: Send + Sync {
    fn show_persistent(&self, text: &str);
}

pub struct UiSlot {
    factory: Arc<dyn UiFactory>,
    current: Option<Box<dyn UiFacade>>,
    built: u64,
}

impl UiSlot {
    pub fn new(factory: Arc<dyn UiFactory>) -> Self {
        Self {
            factory,
            current: None,
            built: 0,
        }
    }

    /// Existing instance, or a freshly built one.
    pub fn get_instance(
        &mut self,
        dispatcher: &Arc<MessageDispatcher>,
    ) -> Result<&mut dyn UiFacade, UiError> {
        if self.current.is_none() {
            return self.initialize(dispatcher);
        }
        match self.current.as_deref_mut() {
            Some(ui) => Ok(ui),
            None => Err(UiError::Build("ui slot empty".into())),
        }
    }

    /// Releases any existing instance, then builds a new one.
    pub fn initialize(
        &mut self,
        dispatcher: &Arc<MessageDispatcher>,
    ) -> Result<&mut dyn UiFacade, UiError> {
        self.reset_instance();
        let ui = self.factory.build(Arc::clone(dispatcher))?;
        self.built += 1;
        debug!(target: "bridge.ui", generation = self.built, "ui facade built");
        Ok(&mut **self.current.insert(ui))
    }

    pub fn reset_instance(&mut self) {
        if let Some(mut ui) = self.current.take() {
            ui.cleanup();
            debug!(target: "bridge.ui", generation = self.built, "ui facade released");
        }
    }

    pub fn current(&mut self) -> Option<&mut dyn UiFacade> {
        match self.current.as_mut() {
            Some(ui) => Some(&mut **ui),
            None => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.current.is_some()
    }

    pub fn instances_built(&self) -> u64 {
        self.built
    }
}

/// UI facade that renders every effect as a log line. Used by the simulator.
#[derive(Debug, Default)]
pub struct LoggingUi {
    button_valid: bool,
}

impl UiFacade for LoggingUi {
    fn show_notification(
        &mut self,
        kind: NoticeKind,
        text: &str,
        duration: Duration,
    ) -> Result<(), UiError> {
        info!(target: "bridge.ui", ?kind, duration_ms = duration.as_millis() as u64, "{text}");
        Ok(())
    }

    fn update_upload_status(&mut self, status: &UploadStatus) -> Result<(), UiError> {
        info!(target: "bridge.ui", state = ?status.state, message = ?status.message, "upload status");
        Ok(())
    }

    fn update_button_state(&mut self, valid: bool) -> Result<(), UiError> {
        self.button_valid = valid;
        info!(target: "bridge.ui", valid, "push button state");
        Ok(())
    }

    fn handle_show_changed_files(&mut self) -> Result<(), UiError> {
        if !self.button_valid {
            return Err(UiError::Handler("settings incomplete".into()));
        }
        info!(target: "bridge.ui", "showing changed files");
        Ok(())
    }

    fn handle_message(&mut self, kind: &str, payload: &Value) -> Result<(), UiError> {
        info!(target: "bridge.ui", kind, %payload, "business message");
        Ok(())
    }

    fn cleanup(&mut self) {
        debug!(target: "bridge.ui", "logging ui cleaned up");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingUiFactory;

impl UiFactory for LoggingUiFactory {
    fn build(&self, _dispatcher: Arc<MessageDispatcher>) -> Result<Box<dyn UiFacade>, UiError> {
        Ok(Box::new(LoggingUi::default()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFallbackNotice;

impl FallbackNotice for LoggingFallbackNotice {
    fn show_persistent(&self, text: &str) {
        warn!(target: "bridge.ui", "fallback notice: {text}");
    }
}

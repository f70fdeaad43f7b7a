//! The "actively viewing" predicate.
//!
//! A conversation counts as actively viewed only while its detail view is the
//! foreground-most view AND the application process is in the foreground.
//! Callers evaluate the predicate at the moment an event is processed — the
//! result is never cached across events.

use std::sync::{Arc, Mutex};

use parley_shared::types::ConversationId;

#[derive(Debug, Default)]
struct ViewInner {
    active_conversation: Option<ConversationId>,
    app_foreground: bool,
}

/// Shared view/lifecycle state reported by the UI layer.
#[derive(Clone, Default)]
pub struct ViewState {
    inner: Arc<Mutex<ViewInner>>,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The conversation detail view for `id` became foreground-most.
    pub fn enter_conversation(&self, id: ConversationId) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active_conversation = Some(id);
        }
    }

    /// The conversation detail view was dismissed.
    ///
    /// Only clears the given conversation, so a stale leave event for a view
    /// the user already navigated away from cannot clobber the current one.
    pub fn leave_conversation(&self, id: ConversationId) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.active_conversation == Some(id) {
                inner.active_conversation = None;
            }
        }
    }

    /// The application process moved to the foreground or background.
    pub fn set_app_foreground(&self, foreground: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.app_foreground = foreground;
        }
    }

    pub fn is_app_foreground(&self) -> bool {
        self.inner.lock().map(|i| i.app_foreground).unwrap_or(false)
    }

    /// Evaluated fresh on every call.
    pub fn is_actively_viewing(&self, id: ConversationId) -> bool {
        self.inner
            .lock()
            .map(|i| i.app_foreground && i.active_conversation == Some(id))
            .unwrap_or(false)
    }
}

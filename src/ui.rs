//! Agent-facing UI action surface: the inbound calls through which the
//! agent mutates client-side interface state (text, visibility, timers,
//! scores) during a session.

use crate::{
    codec::MethodKey,
    registry::{ActionOutcome, Handler},
};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Method key the agent calls for every UI mutation.
pub fn perform_ui_action_key() -> MethodKey {
    MethodKey::new("rox.interaction.ClientSideUI", "PerformUIAction")
}

/// One agent-initiated UI mutation. `request_id` is echoed in the response
/// data so the agent can line up outcomes with the actions it issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiActionRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub action: UiAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum UiAction {
    UpdateText {
        element_id: String,
        content: String,
    },
    SetVisibility {
        element_id: String,
        visible: bool,
    },
    ControlTimer {
        op: TimerOp,
    },
    SetScore {
        value: i64,
    },
    /// Any action_type this client version does not know.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerOp {
    Start { seconds: u64 },
    Pause,
    Reset,
}

/// The slice of client interface state the agent is allowed to drive.
#[derive(Default)]
pub struct UiState {
    inner: Mutex<UiStateInner>,
}

#[derive(Default)]
struct UiStateInner {
    text: BTreeMap<String, String>,
    visibility: BTreeMap<String, bool>,
    timer_running: bool,
    timer_seconds: u64,
    score: i64,
}

impl UiState {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn text_of(&self, element_id: &str) -> Option<String> {
        self.inner.lock().unwrap().text.get(element_id).cloned()
    }

    /// Elements are visible until the agent hides them.
    pub fn is_visible(&self, element_id: &str) -> bool {
        *self
            .inner
            .lock()
            .unwrap()
            .visibility
            .get(element_id)
            .unwrap_or(&true)
    }

    pub fn timer(&self) -> (bool, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.timer_running, inner.timer_seconds)
    }

    pub fn score(&self) -> i64 {
        self.inner.lock().unwrap().score
    }

    fn apply(&self, action: &UiAction) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        match action {
            UiAction::UpdateText {
                element_id,
                content,
            } => {
                inner.text.insert(element_id.clone(), content.clone());
            }
            UiAction::SetVisibility {
                element_id,
                visible,
            } => {
                inner.visibility.insert(element_id.clone(), *visible);
            }
            UiAction::ControlTimer { op } => match op {
                TimerOp::Start { seconds } => {
                    inner.timer_running = true;
                    inner.timer_seconds = *seconds;
                }
                TimerOp::Pause => inner.timer_running = false,
                TimerOp::Reset => {
                    inner.timer_running = false;
                    inner.timer_seconds = 0;
                }
            },
            UiAction::SetScore { value } => inner.score = *value,
            UiAction::Unknown => return Err("Unknown action_type".to_owned()),
        }
        Ok(())
    }
}

/// Handler for `rox.interaction.ClientSideUI/PerformUIAction`: applies one
/// [`UiAction`] to shared state and reports a structured outcome.
pub struct UiActionHandler {
    state: Arc<UiState>,
}

impl UiActionHandler {
    pub fn new(state: Arc<UiState>) -> Self {
        Self { state }
    }
}

impl Handler for UiActionHandler {
    type Request = UiActionRequest;

    fn call(&self, request: UiActionRequest) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async move {
            match self.state.apply(&request.action) {
                Ok(()) => ActionOutcome::ok_with(
                    "ok",
                    serde_json::json!({ "request_id": request.request_id }),
                ),
                Err(message) => ActionOutcome::failed(format!(
                    "{message} (request {})",
                    request.request_id
                )),
            }
        })
    }
}

//! Application state: tutor config, evaluator selection, and the single
//! live session controller.
//!
//! The evaluator is chosen once at startup: the OpenAI-compatible client
//! when OPENAI_API_KEY is present, the offline seed tutor otherwise. Per-call
//! evaluator failures do NOT switch implementations; they surface to the
//! caller per the session error policy.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::load_tutor_config_from_env;
use crate::evaluator::Evaluator;
use crate::openai::OpenAI;
use crate::protocol::{to_snapshot, SessionSnapshot};
use crate::seeds::SeedTutor;
use crate::session::SessionController;

pub struct AppState {
    pub controller: SessionController,
}

impl AppState {
    /// Build state from env: load config, pick the evaluator, init the
    /// session controller.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        // Load TOML config if provided (prompts + optional goal bank).
        let cfg = load_tutor_config_from_env().unwrap_or_default();
        let prompts = cfg.prompts.clone();

        let evaluator: Arc<dyn Evaluator> = match OpenAI::from_env(prompts) {
            Some(oa) => {
                info!(target: "galileo_backend", base_url = %oa.base_url, model = %oa.model, "OpenAI evaluator enabled.");
                Arc::new(oa)
            }
            None => {
                info!(target: "galileo_backend", bank_goals = cfg.goals.len(), "OpenAI disabled (no OPENAI_API_KEY). Using offline seed tutor.");
                Arc::new(SeedTutor::new(&cfg.goals))
            }
        };
        info!(target: "galileo_backend", evaluator = evaluator.name(), "Evaluator selected");

        Self { controller: SessionController::new(evaluator) }
    }

    /// Current read-only snapshot for the presentation layer.
    pub async fn snapshot(&self) -> SessionSnapshot {
        to_snapshot(&self.controller.session().await, self.controller.is_busy())
    }
}

//! The evaluator seam: structured grading calls and cooperative cancellation.
//!
//! The session controller never talks to a model API directly. It drives an
//! `Evaluator`, which either wraps the OpenAI-compatible client (`openai.rs`)
//! or the offline seed tutor (`seeds.rs`). Every call carries a
//! `CancelToken`; a superseded call must resolve to `EvalError::Cancelled`
//! instead of producing a late result.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::{FinalAnswerFeedback, Goal, StepFeedback, SubmittedStep};

/// Errors from evaluator calls.
#[derive(Error, Debug)]
pub enum EvalError {
  /// The operation was superseded (new command or reset). Expected, silent.
  #[error("evaluation cancelled")]
  Cancelled,

  #[error("evaluator transport error: {0}")]
  Transport(String),

  #[error("evaluator HTTP {status}: {message}")]
  Http { status: u16, message: String },

  /// The model replied, but the payload failed shape validation.
  #[error("evaluator response failed validation: {0}")]
  InvalidResponse(String),
}

impl EvalError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, EvalError::Cancelled)
  }
}

/// Cooperative cancellation handle tied to the controller's operation epoch.
/// The token is live while the epoch it was minted under is still current.
#[derive(Clone)]
pub struct CancelToken {
  rx: watch::Receiver<u64>,
  epoch: u64,
}

impl CancelToken {
  pub fn new(rx: watch::Receiver<u64>, epoch: u64) -> Self {
    Self { rx, epoch }
  }

  /// A token that never cancels. For tests and one-shot tools.
  pub fn never() -> Self {
    let (tx, rx) = watch::channel(0);
    drop(tx);
    Self { rx, epoch: 0 }
  }

  /// Has a newer operation superseded this one?
  pub fn is_live(&self) -> bool {
    *self.rx.borrow() == self.epoch
  }

  /// Resolves once the token is superseded. Never resolves for a live token
  /// whose controller is gone (the result would be discarded anyway).
  pub async fn cancelled(mut self) {
    loop {
      if *self.rx.borrow() != self.epoch {
        return;
      }
      if self.rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }
}

/// Structured grading interface the session controller drives.
///
/// Implementations must be safe to call concurrently; they hold no session
/// state. Prompt construction is an implementation concern: the controller
/// hands over the goal and history, not prompt text.
#[async_trait]
pub trait Evaluator: Send + Sync {
  /// Human-readable implementation name, for startup logging.
  fn name(&self) -> &'static str;

  /// Produce a fresh goal for the requested topic.
  async fn generate_goal(&self, topic: &str, cancel: CancelToken) -> Result<Goal, EvalError>;

  /// Grade one submitted step against the goal and the completed history.
  async fn grade_step(
    &self,
    goal: &Goal,
    completed: &[SubmittedStep],
    step_text: &str,
    cancel: CancelToken,
  ) -> Result<StepFeedback, EvalError>;

  /// Grade the final answer against the goal and the full step history.
  async fn grade_final_answer(
    &self,
    goal: &Goal,
    steps: &[SubmittedStep],
    answer: &str,
    cancel: CancelToken,
  ) -> Result<FinalAnswerFeedback, EvalError>;
}

/// Validate a step-feedback payload against the active goal. A matched index
/// outside the required-step range is a malformed response, not a crash.
pub fn validate_step_feedback(fb: &StepFeedback, goal: &Goal) -> Result<(), EvalError> {
  if let Some(idx) = fb.matched_required_step {
    if idx >= goal.required_steps.len() {
      return Err(EvalError::InvalidResponse(format!(
        "matched_required_step {} out of range (goal has {} required steps)",
        idx,
        goal.required_steps.len()
      )));
    }
  }
  Ok(())
}

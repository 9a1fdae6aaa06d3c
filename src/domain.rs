//! Domain models used by the backend: game phase, goals, submitted steps,
//! evaluator feedback shapes, and per-required-step progress.

use serde::{Deserialize, Serialize};

/// Where did the active goal come from?
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalSource {
  LocalBank,   // from user-provided TOML bank
  Generated,   // generated via the model evaluator
  Seed,  // built-in seeds (offline mode)
}

/// The session's state-machine phase. Gates which commands are valid.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
  SelectingGoal,
  GeneratingGoal,
  DescribingSteps,
  ProvidingFinalAnswer,
  Complete,
}

/// One milestone of a goal: what must be done, and the hint we may surface
/// after repeated failed attempts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequiredStep {
  pub step: String,
  pub hint: String,
}

/// A generated (or bank/seed) problem statement. Immutable once installed
/// into the live session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Goal {
  pub id: String,
  pub source: GoalSource,
  pub title: String,
  pub description: String,
  pub required_steps: Vec<RequiredStep>,
  pub correct_answer: String,
  #[serde(default)] pub units: Option<String>,
}

/// Goals must arrive with between 4 and 6 required steps.
pub const MIN_REQUIRED_STEPS: usize = 4;
pub const MAX_REQUIRED_STEPS: usize = 6;

impl Goal {
  pub fn step_count_ok(&self) -> bool {
    (MIN_REQUIRED_STEPS..=MAX_REQUIRED_STEPS).contains(&self.required_steps.len())
  }
}

/// Evaluator verdict on one submitted step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepFeedback {
  pub is_valid: bool,
  pub feedback: String,
  #[serde(default)] pub suggestions: Vec<String>,
  pub is_complete: bool,
  /// 0-based index into `Goal::required_steps` this submission satisfied.
  #[serde(default)] pub matched_required_step: Option<usize>,
}

/// One user attempt at describing a solution step. Appended after a
/// successful evaluation; never mutated or removed afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubmittedStep {
  /// 1-based step number at submission time (NOT an index into
  /// `required_steps`; milestones can be matched out of order).
  pub ordinal: u32,
  pub description: String,
  pub feedback: StepFeedback,
}

/// Evaluator verdict on the final answer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FinalAnswerFeedback {
  pub is_correct: bool,
  pub feedback: String,
  pub correct_answer: String,
  pub explanation: String,
  pub game_complete: bool,
}

/// The stored final answer. Overwritten wholesale on resubmission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FinalAnswer {
  pub text: String,
  pub feedback: FinalAnswerFeedback,
}

/// Bookkeeping for one required step. All flags are monotonic.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StepProgress {
  pub completed: bool,
  pub hint_shown: bool,
  pub failed_attempts: u32,
  pub revealed: bool,
}

/// Failed attempts on the currently targeted step before its hint surfaces.
pub const HINT_THRESHOLD: u32 = 2;

//! Game session state machine and its controller.
//!
//! `Session` is the owned aggregate (phase, goal, submitted steps, milestone
//! progress, final answer). All mutation funnels through `SessionController`
//! commands, each guarded by an explicit phase check; invalid-phase calls are
//! rejected, never silently misapplied.
//!
//! Evaluator-invoking commands mint a cancel token from the controller's
//! operation epoch. Starting a new operation (or resetting) bumps the epoch,
//! which both cancels the in-flight call cooperatively and marks any late
//! result stale: results are applied only while their token is still current.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument};

use crate::domain::{
  FinalAnswer, FinalAnswerFeedback, GamePhase, Goal, StepFeedback, StepProgress, SubmittedStep,
  HINT_THRESHOLD,
};
use crate::evaluator::{CancelToken, EvalError, Evaluator};

/// Errors returned to the command caller. `Cancelled` evaluator outcomes are
/// swallowed before this layer; they are not caller-visible.
#[derive(Error, Debug)]
pub enum CommandError {
  #[error("command not valid in phase {phase:?}")]
  WrongPhase { phase: GamePhase },

  #[error("no active goal")]
  NoGoal,

  #[error("text must not be empty")]
  EmptyText,

  #[error("required step index {index} out of range")]
  IndexOutOfRange { index: usize },

  #[error(transparent)]
  Evaluator(#[from] EvalError),
}

/// The session aggregate. `SessionController` is the only mutator.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
  pub phase: GamePhase,
  pub goal: Option<Goal>,
  pub steps: Vec<SubmittedStep>,
  pub current_step_number: u32,
  pub progress: Vec<StepProgress>,
  pub final_answer: Option<FinalAnswer>,
}

impl Default for Session {
  fn default() -> Self {
    Self {
      phase: GamePhase::SelectingGoal,
      goal: None,
      steps: Vec::new(),
      current_step_number: 1,
      progress: Vec::new(),
      final_answer: None,
    }
  }
}

impl Session {
  /// Install a freshly generated goal and enter step description.
  fn install_goal(&mut self, goal: Goal) {
    self.progress = vec![StepProgress::default(); goal.required_steps.len()];
    self.steps.clear();
    self.current_step_number = 1;
    self.final_answer = None;
    self.goal = Some(goal);
    self.phase = GamePhase::DescribingSteps;
  }

  fn all_milestones_done(&self) -> bool {
    !self.progress.is_empty() && self.progress.iter().all(|p| p.completed)
  }

  /// Step-resolution policy. A completing submission that names a milestone
  /// marks it done and advances the step number; anything else counts as a
  /// failed attempt on the currently targeted milestone (unless that
  /// milestone is already done) and surfaces its hint after two failures.
  /// Once every milestone is done the session moves to the final answer.
  fn record_step(&mut self, description: String, feedback: StepFeedback) {
    let ordinal = self.current_step_number;
    match (feedback.is_complete, feedback.matched_required_step) {
      (true, Some(idx)) => {
        if let Some(p) = self.progress.get_mut(idx) {
          p.completed = true;
        }
        self.current_step_number += 1;
      }
      _ => {
        let idx = (self.current_step_number - 1) as usize;
        if let Some(p) = self.progress.get_mut(idx) {
          if !p.completed {
            p.failed_attempts += 1;
            if p.failed_attempts >= HINT_THRESHOLD {
              p.hint_shown = true;
            }
          }
        }
      }
    }
    self.steps.push(SubmittedStep { ordinal, description, feedback });
    if self.all_milestones_done() {
      self.phase = GamePhase::ProvidingFinalAnswer;
    }
  }

  /// Store (or overwrite) the final answer; a complete game ends the session.
  fn record_final_answer(&mut self, text: String, feedback: FinalAnswerFeedback) {
    let game_complete = feedback.game_complete;
    self.final_answer = Some(FinalAnswer { text, feedback });
    if game_complete {
      self.phase = GamePhase::Complete;
    }
  }
}

pub struct SessionController {
  evaluator: Arc<dyn Evaluator>,
  session: Mutex<Session>,
  ops: watch::Sender<u64>,
  busy: AtomicBool,
}

impl SessionController {
  pub fn new(evaluator: Arc<dyn Evaluator>) -> Self {
    let (ops, _) = watch::channel(0);
    Self {
      evaluator,
      session: Mutex::new(Session::default()),
      ops,
      busy: AtomicBool::new(false),
    }
  }

  /// Bump the operation epoch, invalidating any in-flight evaluator call.
  /// Callers must hold the session lock so epochs are handed out in order.
  fn next_epoch(&self) -> u64 {
    let next = *self.ops.borrow() + 1;
    self.ops.send_replace(next);
    next
  }

  fn begin_op(&self) -> CancelToken {
    let epoch = self.next_epoch();
    self.busy.store(true, Ordering::SeqCst);
    CancelToken::new(self.ops.subscribe(), epoch)
  }

  /// Clear the busy flag unless a newer operation owns it now.
  fn end_op(&self, token: &CancelToken) {
    if token.is_live() {
      self.busy.store(false, Ordering::SeqCst);
    }
  }

  pub fn is_busy(&self) -> bool {
    self.busy.load(Ordering::SeqCst)
  }

  /// Read-only copy of the live session for snapshot building.
  pub async fn session(&self) -> Session {
    self.session.lock().await.clone()
  }

  /// Start a new game: clear everything, generate a goal for `topic`.
  /// Valid while selecting a goal, or while a previous generation is still
  /// in flight (re-selection cancels it).
  #[instrument(level = "info", skip(self), fields(%topic))]
  pub async fn select_goal(&self, topic: &str) -> Result<(), CommandError> {
    let token = {
      let mut s = self.session.lock().await;
      if !matches!(s.phase, GamePhase::SelectingGoal | GamePhase::GeneratingGoal) {
        return Err(CommandError::WrongPhase { phase: s.phase });
      }
      *s = Session::default();
      s.phase = GamePhase::GeneratingGoal;
      self.begin_op()
    };

    let result = self.evaluator.generate_goal(topic, token.clone()).await;
    self.end_op(&token);

    let mut s = self.session.lock().await;
    match result {
      Ok(goal) if token.is_live() => {
        info!(target: "session", goal_id = %goal.id, source = ?goal.source, steps = goal.required_steps.len(), "Goal installed; describing steps");
        s.install_goal(goal);
        Ok(())
      }
      // Superseded by a newer command; discard the late result silently.
      Ok(_) => Ok(()),
      Err(e) if e.is_cancelled() || !token.is_live() => Ok(()),
      Err(e) => {
        error!(target: "session", error = %e, "Goal generation failed; back to goal selection");
        s.phase = GamePhase::SelectingGoal;
        Err(CommandError::Evaluator(e))
      }
    }
  }

  /// Grade one free-text solution step and fold the verdict into the
  /// session. On evaluator failure the attempt is discarded, not stored, and
  /// the error is returned so the caller can resubmit the same text.
  #[instrument(level = "info", skip(self, text), fields(text_len = text.len()))]
  pub async fn submit_step(&self, text: &str) -> Result<(), CommandError> {
    let text = text.trim();
    if text.is_empty() {
      return Err(CommandError::EmptyText);
    }

    let (goal, completed, token) = {
      let s = self.session.lock().await;
      if s.phase != GamePhase::DescribingSteps {
        return Err(CommandError::WrongPhase { phase: s.phase });
      }
      let goal = s.goal.clone().ok_or(CommandError::NoGoal)?;
      let completed: Vec<SubmittedStep> =
        s.steps.iter().filter(|st| st.feedback.is_complete).cloned().collect();
      (goal, completed, self.begin_op())
    };

    let result = self.evaluator.grade_step(&goal, &completed, text, token.clone()).await;
    self.end_op(&token);

    let mut s = self.session.lock().await;
    match result {
      Ok(fb) if token.is_live() => {
        // The user may have manually moved on while grading was in flight.
        if s.phase != GamePhase::DescribingSteps {
          debug!(target: "session", phase = ?s.phase, "Discarding step verdict; session left step description");
          return Ok(());
        }
        let matched = fb.matched_required_step;
        let complete = fb.is_complete;
        s.record_step(text.to_string(), fb);
        info!(target: "session", ordinal = s.steps.last().map(|st| st.ordinal).unwrap_or(0), complete, ?matched, "Step graded");
        if s.phase == GamePhase::ProvidingFinalAnswer {
          info!(target: "session", "All milestones done; asking for the final answer");
        }
        Ok(())
      }
      Ok(_) => Ok(()),
      Err(e) if e.is_cancelled() || !token.is_live() => Ok(()),
      Err(e) => {
        error!(target: "session", error = %e, "Step grading failed; attempt discarded");
        Err(CommandError::Evaluator(e))
      }
    }
  }

  /// Grade the final answer. Resubmission is allowed until the evaluator
  /// declares the game complete; each attempt overwrites the stored answer.
  #[instrument(level = "info", skip(self, text), fields(text_len = text.len()))]
  pub async fn submit_final_answer(&self, text: &str) -> Result<(), CommandError> {
    let text = text.trim();
    if text.is_empty() {
      return Err(CommandError::EmptyText);
    }

    let (goal, steps, token) = {
      let s = self.session.lock().await;
      if s.phase != GamePhase::ProvidingFinalAnswer {
        return Err(CommandError::WrongPhase { phase: s.phase });
      }
      let goal = s.goal.clone().ok_or(CommandError::NoGoal)?;
      (goal, s.steps.clone(), self.begin_op())
    };

    let result = self.evaluator.grade_final_answer(&goal, &steps, text, token.clone()).await;
    self.end_op(&token);

    let mut s = self.session.lock().await;
    match result {
      Ok(fb) if token.is_live() => {
        let game_complete = fb.game_complete;
        s.record_final_answer(text.to_string(), fb);
        info!(target: "session", game_complete, "Final answer graded");
        Ok(())
      }
      Ok(_) => Ok(()),
      Err(e) if e.is_cancelled() || !token.is_live() => Ok(()),
      Err(e) => {
        error!(target: "session", error = %e, "Final answer grading failed; answer unchanged");
        Err(CommandError::Evaluator(e))
      }
    }
  }

  /// Manual override: stop describing steps and go answer the problem.
  /// The "enough steps done" gate is presentation policy, not enforced here.
  #[instrument(level = "info", skip(self))]
  pub async fn move_to_final_answer(&self) -> Result<(), CommandError> {
    let mut s = self.session.lock().await;
    if s.phase != GamePhase::DescribingSteps {
      return Err(CommandError::WrongPhase { phase: s.phase });
    }
    s.phase = GamePhase::ProvidingFinalAnswer;
    info!(target: "session", "Manual move to final answer");
    Ok(())
  }

  /// Reveal the text of one required step. Monotonic, no evaluator call.
  pub async fn reveal_step(&self, index: usize) -> Result<(), CommandError> {
    let mut s = self.session.lock().await;
    if s.goal.is_none() {
      return Err(CommandError::NoGoal);
    }
    match s.progress.get_mut(index) {
      Some(p) => {
        p.revealed = true;
        Ok(())
      }
      None => Err(CommandError::IndexOutOfRange { index }),
    }
  }

  /// Reveal every required step.
  pub async fn reveal_all_steps(&self) -> Result<(), CommandError> {
    let mut s = self.session.lock().await;
    if s.goal.is_none() {
      return Err(CommandError::NoGoal);
    }
    for p in &mut s.progress {
      p.revealed = true;
    }
    Ok(())
  }

  /// Abandon everything: cancel in-flight work and start from scratch.
  #[instrument(level = "info", skip(self))]
  pub async fn reset(&self) {
    let mut s = self.session.lock().await;
    self.next_epoch();
    self.busy.store(false, Ordering::SeqCst);
    *s = Session::default();
    info!(target: "session", "Session reset");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{GoalSource, RequiredStep};
  use async_trait::async_trait;
  use proptest::prelude::*;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex as StdMutex;
  use tokio::sync::Notify;

  fn mk_goal(n: usize) -> Goal {
    Goal {
      id: format!("goal-{n}"),
      source: GoalSource::Seed,
      title: "Find g".into(),
      description: "Design an experiment to measure g.".into(),
      required_steps: (0..n)
        .map(|i| RequiredStep { step: format!("milestone {i}"), hint: format!("hint {i}") })
        .collect(),
      correct_answer: "9.8".into(),
      units: Some("m/s²".into()),
    }
  }

  fn fb_complete(idx: usize) -> StepFeedback {
    StepFeedback {
      is_valid: true,
      feedback: "good".into(),
      suggestions: vec![],
      is_complete: true,
      matched_required_step: Some(idx),
    }
  }

  fn fb_fail() -> StepFeedback {
    StepFeedback {
      is_valid: false,
      feedback: "not yet".into(),
      suggestions: vec!["try again".into()],
      is_complete: false,
      matched_required_step: None,
    }
  }

  fn fa(game_complete: bool) -> FinalAnswerFeedback {
    FinalAnswerFeedback {
      is_correct: game_complete,
      feedback: "graded".into(),
      correct_answer: "9.8".into(),
      explanation: "because".into(),
      game_complete,
    }
  }

  /// Scripted evaluator: queued results per call kind, with optional gates
  /// that hold a call open until notified (deliberately ignoring the cancel
  /// token, so the controller's stale-result discard is what gets tested).
  #[derive(Default)]
  struct FakeEvaluator {
    goals: StdMutex<VecDeque<(Option<Arc<Notify>>, Result<Goal, EvalError>)>>,
    steps: StdMutex<VecDeque<(Option<Arc<Notify>>, Result<StepFeedback, EvalError>)>>,
    finals: StdMutex<VecDeque<Result<FinalAnswerFeedback, EvalError>>>,
    calls: AtomicUsize,
  }

  impl FakeEvaluator {
    fn push_goal(&self, r: Result<Goal, EvalError>) {
      self.goals.lock().unwrap().push_back((None, r));
    }
    fn push_goal_gated(&self, gate: Arc<Notify>, r: Result<Goal, EvalError>) {
      self.goals.lock().unwrap().push_back((Some(gate), r));
    }
    fn push_step(&self, r: Result<StepFeedback, EvalError>) {
      self.steps.lock().unwrap().push_back((None, r));
    }
    fn push_step_gated(&self, gate: Arc<Notify>, r: Result<StepFeedback, EvalError>) {
      self.steps.lock().unwrap().push_back((Some(gate), r));
    }
    fn push_final(&self, r: Result<FinalAnswerFeedback, EvalError>) {
      self.finals.lock().unwrap().push_back(r);
    }
  }

  #[async_trait]
  impl Evaluator for FakeEvaluator {
    fn name(&self) -> &'static str {
      "fake"
    }

    async fn generate_goal(&self, _topic: &str, _cancel: CancelToken) -> Result<Goal, EvalError> {
      let (gate, result) = self.goals.lock().unwrap().pop_front().expect("unscripted goal call");
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(g) = gate {
        g.notified().await;
      }
      result
    }

    async fn grade_step(
      &self,
      _goal: &Goal,
      _completed: &[SubmittedStep],
      _text: &str,
      _cancel: CancelToken,
    ) -> Result<StepFeedback, EvalError> {
      let (gate, result) = self.steps.lock().unwrap().pop_front().expect("unscripted step call");
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(g) = gate {
        g.notified().await;
      }
      result
    }

    async fn grade_final_answer(
      &self,
      _goal: &Goal,
      _steps: &[SubmittedStep],
      _answer: &str,
      _cancel: CancelToken,
    ) -> Result<FinalAnswerFeedback, EvalError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.finals.lock().unwrap().pop_front().expect("unscripted final call")
    }
  }

  fn controller(fake: FakeEvaluator) -> (Arc<SessionController>, Arc<FakeEvaluator>) {
    let fake = Arc::new(fake);
    (Arc::new(SessionController::new(fake.clone())), fake)
  }

  async fn started(fake: FakeEvaluator, steps: usize) -> (Arc<SessionController>, Arc<FakeEvaluator>) {
    let (ctl, fake) = controller(fake);
    fake.push_goal(Ok(mk_goal(steps)));
    ctl.select_goal("gravity").await.unwrap();
    (ctl, fake)
  }

  #[test]
  fn fresh_session_defaults() {
    let s = Session::default();
    assert_eq!(s.phase, GamePhase::SelectingGoal);
    assert!(s.goal.is_none());
    assert!(s.steps.is_empty());
    assert_eq!(s.current_step_number, 1);
    assert!(s.progress.is_empty());
    assert!(s.final_answer.is_none());
  }

  #[tokio::test]
  async fn select_goal_installs_goal_and_sizes_progress() {
    let (ctl, _fake) = started(FakeEvaluator::default(), 4).await;
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::DescribingSteps);
    assert_eq!(s.progress.len(), 4);
    assert_eq!(s.current_step_number, 1);
    assert!(s.progress.iter().all(|p| !p.completed && !p.hint_shown && !p.revealed));
    assert!(!ctl.is_busy());
  }

  #[tokio::test]
  async fn select_goal_failure_reverts_to_selection() {
    let (ctl, fake) = controller(FakeEvaluator::default());
    fake.push_goal(Err(EvalError::Transport("boom".into())));
    let err = ctl.select_goal("gravity").await.unwrap_err();
    assert!(matches!(err, CommandError::Evaluator(EvalError::Transport(_))));
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::SelectingGoal);
    assert!(s.goal.is_none());
  }

  #[tokio::test]
  async fn select_goal_rejected_mid_game() {
    let (ctl, _fake) = started(FakeEvaluator::default(), 4).await;
    let err = ctl.select_goal("another").await.unwrap_err();
    assert!(matches!(err, CommandError::WrongPhase { phase: GamePhase::DescribingSteps }));
  }

  #[tokio::test]
  async fn submit_step_requires_text_and_phase() {
    let (ctl, _fake) = controller(FakeEvaluator::default());
    assert!(matches!(ctl.submit_step("  ").await.unwrap_err(), CommandError::EmptyText));
    assert!(matches!(
      ctl.submit_step("measure things").await.unwrap_err(),
      CommandError::WrongPhase { phase: GamePhase::SelectingGoal }
    ));
  }

  #[tokio::test]
  async fn completing_step_advances_number_and_marks_milestone() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    fake.push_step(Ok(fb_complete(2)));
    ctl.submit_step("relate period and length").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.current_step_number, 2);
    assert!(s.progress[2].completed);
    assert_eq!(s.steps.len(), 1);
    assert_eq!(s.steps[0].ordinal, 1);
    assert_eq!(s.phase, GamePhase::DescribingSteps);
  }

  #[tokio::test]
  async fn complete_without_match_counts_as_failed_attempt() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    fake.push_step(Ok(StepFeedback { matched_required_step: None, ..fb_complete(0) }));
    ctl.submit_step("something vague").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.current_step_number, 1);
    assert_eq!(s.progress[0].failed_attempts, 1);
    assert!(!s.progress.iter().any(|p| p.completed));
  }

  #[tokio::test]
  async fn hint_surfaces_after_two_failures_and_stays() {
    let (ctl, fake) = started(FakeEvaluator::default(), 5).await;
    for _ in 0..3 {
      fake.push_step(Ok(fb_fail()));
    }

    ctl.submit_step("wrong idea").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.progress[0].failed_attempts, 1);
    assert!(!s.progress[0].hint_shown);

    ctl.submit_step("wrong idea").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.progress[0].failed_attempts, 2);
    assert!(s.progress[0].hint_shown);

    ctl.submit_step("wrong idea").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.progress[0].failed_attempts, 3);
    assert!(s.progress[0].hint_shown);
    assert_eq!(s.current_step_number, 1);
  }

  #[tokio::test]
  async fn completed_milestone_stops_collecting_failures() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    // Finish milestones 0 and 2; step number lands on 3, targeting index 2.
    fake.push_step(Ok(fb_complete(0)));
    fake.push_step(Ok(fb_complete(2)));
    fake.push_step(Ok(fb_fail()));
    ctl.submit_step("do milestone zero").await.unwrap();
    ctl.submit_step("do milestone two").await.unwrap();
    ctl.submit_step("a failing attempt").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.current_step_number, 3);
    assert!(s.progress[2].completed);
    assert_eq!(s.progress[2].failed_attempts, 0);
    assert!(!s.progress[2].hint_shown);
  }

  #[tokio::test]
  async fn phase_flips_exactly_on_last_completion() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    for idx in [2usize, 0, 1] {
      fake.push_step(Ok(fb_complete(idx)));
      ctl.submit_step("progress").await.unwrap();
      assert_eq!(ctl.session().await.phase, GamePhase::DescribingSteps);
    }
    fake.push_step(Ok(fb_complete(3)));
    ctl.submit_step("the last one").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::ProvidingFinalAnswer);
    assert_eq!(s.current_step_number, 5);
    // no more step submissions once we are answering
    assert!(matches!(
      ctl.submit_step("one more").await.unwrap_err(),
      CommandError::WrongPhase { phase: GamePhase::ProvidingFinalAnswer }
    ));
  }

  #[tokio::test]
  async fn step_grading_failure_leaves_session_untouched() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    fake.push_step(Err(EvalError::Http { status: 500, message: "oops".into() }));
    let before = ctl.session().await;
    let err = ctl.submit_step("a fine step").await.unwrap_err();
    assert!(matches!(err, CommandError::Evaluator(EvalError::Http { .. })));
    assert_eq!(ctl.session().await, before);
  }

  #[tokio::test]
  async fn cancelled_grading_is_silent() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    fake.push_step(Err(EvalError::Cancelled));
    ctl.submit_step("a step").await.unwrap();
    assert!(ctl.session().await.steps.is_empty());
  }

  #[tokio::test]
  async fn manual_move_then_final_answer_completes_game() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    ctl.move_to_final_answer().await.unwrap();
    assert_eq!(ctl.session().await.phase, GamePhase::ProvidingFinalAnswer);

    fake.push_final(Ok(fa(true)));
    ctl.submit_final_answer("9.8 m/s²").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::Complete);
    assert_eq!(s.final_answer.as_ref().unwrap().text, "9.8 m/s²");

    // Complete has no outbound edge except reset.
    assert!(matches!(
      ctl.submit_final_answer("9.9").await.unwrap_err(),
      CommandError::WrongPhase { phase: GamePhase::Complete }
    ));
  }

  #[tokio::test]
  async fn wrong_final_answer_allows_retry_and_overwrites() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    ctl.move_to_final_answer().await.unwrap();

    fake.push_final(Ok(fa(false)));
    ctl.submit_final_answer("42").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::ProvidingFinalAnswer);
    assert_eq!(s.final_answer.as_ref().unwrap().text, "42");

    fake.push_final(Ok(fa(true)));
    ctl.submit_final_answer("9.8").await.unwrap();
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::Complete);
    assert_eq!(s.final_answer.as_ref().unwrap().text, "9.8");
  }

  #[tokio::test]
  async fn final_grading_failure_keeps_prior_answer() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    ctl.move_to_final_answer().await.unwrap();
    fake.push_final(Err(EvalError::Transport("down".into())));
    let err = ctl.submit_final_answer("9.8").await.unwrap_err();
    assert!(matches!(err, CommandError::Evaluator(EvalError::Transport(_))));
    let s = ctl.session().await;
    assert_eq!(s.phase, GamePhase::ProvidingFinalAnswer);
    assert!(s.final_answer.is_none());
  }

  #[tokio::test]
  async fn reveal_is_monotonic_and_bounds_checked() {
    let (ctl, _fake) = started(FakeEvaluator::default(), 4).await;
    ctl.reveal_step(1).await.unwrap();
    ctl.reveal_step(1).await.unwrap();
    let s = ctl.session().await;
    assert!(s.progress[1].revealed);
    assert!(!s.progress[0].revealed);

    assert!(matches!(
      ctl.reveal_step(9).await.unwrap_err(),
      CommandError::IndexOutOfRange { index: 9 }
    ));

    ctl.reveal_all_steps().await.unwrap();
    assert!(ctl.session().await.progress.iter().all(|p| p.revealed));
  }

  #[tokio::test]
  async fn reveal_requires_a_goal() {
    let (ctl, _fake) = controller(FakeEvaluator::default());
    assert!(matches!(ctl.reveal_step(0).await.unwrap_err(), CommandError::NoGoal));
    assert!(matches!(ctl.reveal_all_steps().await.unwrap_err(), CommandError::NoGoal));
  }

  #[tokio::test]
  async fn reset_yields_the_initial_session() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    fake.push_step(Ok(fb_complete(0)));
    ctl.submit_step("progress").await.unwrap();
    ctl.reveal_all_steps().await.unwrap();

    ctl.reset().await;
    assert_eq!(ctl.session().await, Session::default());
    assert!(!ctl.is_busy());

    // and the machine is usable again
    fake.push_goal(Ok(mk_goal(4)));
    ctl.select_goal("projectile").await.unwrap();
    assert_eq!(ctl.session().await.phase, GamePhase::DescribingSteps);
  }

  #[tokio::test]
  async fn reselect_during_flight_discards_first_result() {
    let (ctl, fake) = controller(FakeEvaluator::default());
    let gate = Arc::new(Notify::new());
    let mut slow = mk_goal(4);
    slow.id = "slow".into();
    let mut fast = mk_goal(4);
    fast.id = "fast".into();
    fake.push_goal_gated(gate.clone(), Ok(slow));
    fake.push_goal(Ok(fast));

    let ctl2 = ctl.clone();
    let first = tokio::spawn(async move { ctl2.select_goal("first topic").await });
    while fake.calls.load(Ordering::SeqCst) < 1 {
      tokio::task::yield_now().await;
    }
    assert!(ctl.is_busy());

    // Re-selection is legal while generation is in flight and supersedes it.
    ctl.select_goal("second topic").await.unwrap();
    assert_eq!(ctl.session().await.goal.as_ref().unwrap().id, "fast");

    // Let the first call's late result arrive: it must be discarded.
    gate.notify_one();
    first.await.unwrap().unwrap();
    let s = ctl.session().await;
    assert_eq!(s.goal.as_ref().unwrap().id, "fast");
    assert_eq!(s.phase, GamePhase::DescribingSteps);
    assert!(!ctl.is_busy());
  }

  #[tokio::test]
  async fn reset_during_inflight_grading_discards_the_verdict() {
    let (ctl, fake) = started(FakeEvaluator::default(), 4).await;
    let gate = Arc::new(Notify::new());
    fake.push_step_gated(gate.clone(), Ok(fb_complete(0)));

    let ctl2 = ctl.clone();
    let calls_before = fake.calls.load(Ordering::SeqCst);
    let inflight = tokio::spawn(async move { ctl2.submit_step("measure the period").await });
    while fake.calls.load(Ordering::SeqCst) == calls_before {
      tokio::task::yield_now().await;
    }

    ctl.reset().await;
    gate.notify_one();
    inflight.await.unwrap().unwrap();

    assert_eq!(ctl.session().await, Session::default());
    assert!(!ctl.is_busy());
  }

  // Property coverage for the monotonicity bundle: over any feedback
  // sequence, the step number never decreases (and grows only on completing
  // submissions), milestones never un-complete, hints never retract, and
  // failure counters never shrink.
  proptest! {
    #[test]
    fn bookkeeping_is_monotonic(outcomes in proptest::collection::vec((any::<bool>(), 0usize..4), 0..40)) {
      let mut s = Session::default();
      s.install_goal(
        Goal {
          id: "prop".into(),
          source: GoalSource::Seed,
          title: "t".into(),
          description: "d".into(),
          required_steps: (0..4)
            .map(|i| RequiredStep { step: format!("s{i}"), hint: format!("h{i}") })
            .collect(),
          correct_answer: "1".into(),
          units: None,
        },
      );

      let mut prev = s.clone();
      for (complete, idx) in outcomes {
        if s.phase != GamePhase::DescribingSteps {
          break;
        }
        let fb = StepFeedback {
          is_valid: complete,
          feedback: String::new(),
          suggestions: vec![],
          is_complete: complete,
          matched_required_step: complete.then_some(idx),
        };
        s.record_step("text".into(), fb);

        prop_assert!(s.current_step_number >= prev.current_step_number);
        prop_assert_eq!(
          s.current_step_number - prev.current_step_number,
          u32::from(complete)
        );
        for i in 0..4 {
          prop_assert!(s.progress[i].completed >= prev.progress[i].completed);
          prop_assert!(s.progress[i].hint_shown >= prev.progress[i].hint_shown);
          prop_assert!(s.progress[i].failed_attempts >= prev.progress[i].failed_attempts);
          if prev.progress[i].completed {
            prop_assert_eq!(s.progress[i].failed_attempts, prev.progress[i].failed_attempts);
          }
        }
        prop_assert_eq!(s.steps.len(), prev.steps.len() + 1);
        prev = s.clone();
      }

      if s.progress.iter().all(|p| p.completed) {
        prop_assert_eq!(s.phase, GamePhase::ProvidingFinalAnswer);
      }
    }
  }
}

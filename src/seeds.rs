//! Built-in goals and the offline tutor.
//!
//! `SeedTutor` implements the evaluator seam without any network access so
//! the app stays useful when OPENAI_API_KEY is missing: goals come from the
//! TOML bank plus built-in seeds, and grading is a keyword heuristic rather
//! than a model call. Selected once at startup; it is not a per-call
//! fallback for model failures.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::GoalCfg;
use crate::domain::{
  FinalAnswerFeedback, Goal, GoalSource, RequiredStep, StepFeedback, SubmittedStep,
};
use crate::evaluator::{CancelToken, EvalError, Evaluator};
use crate::util::leading_number;

/// Relative tolerance accepted on the numeric part of a final answer.
const ANSWER_TOLERANCE: f64 = 0.05;
/// Content words a submission must share with a milestone to satisfy it.
const MATCH_THRESHOLD: usize = 2;

struct SeedGoal {
  topics: Vec<String>,
  goal: Goal,
}

pub struct SeedTutor {
  pool: Vec<SeedGoal>,
}

impl SeedTutor {
  /// Build the offline pool: TOML bank entries first (skipping malformed
  /// ones), then the built-in seeds.
  pub fn new(bank: &[GoalCfg]) -> Self {
    let mut pool = Vec::new();
    for cfg in bank {
      let id = cfg.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
      let steps = cfg.steps.len();
      if !(crate::domain::MIN_REQUIRED_STEPS..=crate::domain::MAX_REQUIRED_STEPS).contains(&steps) {
        error!(target: "session", %id, steps, "Skipping bank goal: step count outside 4-6.");
        continue;
      }
      pool.push(SeedGoal {
        topics: cfg.topics.iter().map(|t| t.to_lowercase()).collect(),
        goal: Goal {
          id,
          source: GoalSource::LocalBank,
          title: cfg.title.clone(),
          description: cfg.description.clone(),
          required_steps: cfg.steps.clone(),
          correct_answer: cfg.correct_answer.clone(),
          units: cfg.units.clone(),
        },
      });
    }
    pool.extend(seed_goals());
    info!(target: "session", pool = pool.len(), "Offline goal pool ready");
    Self { pool }
  }
}

#[async_trait]
impl Evaluator for SeedTutor {
  fn name(&self) -> &'static str {
    "seed_tutor"
  }

  #[instrument(level = "info", skip(self, cancel), fields(%topic))]
  async fn generate_goal(&self, topic: &str, cancel: CancelToken) -> Result<Goal, EvalError> {
    if !cancel.is_live() {
      return Err(EvalError::Cancelled);
    }
    let wanted = topic.to_lowercase();
    let matching: Vec<&SeedGoal> = self
      .pool
      .iter()
      .filter(|sg| {
        sg.topics.iter().any(|t| wanted.contains(t.as_str()) || t.contains(&wanted))
          || sg.goal.title.to_lowercase().contains(&wanted)
      })
      .collect();

    let chosen = matching
      .choose(&mut rand::thread_rng())
      .copied()
      .or_else(|| self.pool.first());
    match chosen {
      Some(sg) => {
        info!(target: "session", goal_id = %sg.goal.id, matched = !matching.is_empty(), "Serving offline goal");
        Ok(sg.goal.clone())
      }
      None => Err(EvalError::InvalidResponse("offline goal pool is empty".into())),
    }
  }

  #[instrument(level = "info", skip_all, fields(goal_id = %goal.id, step_len = step_text.len()))]
  async fn grade_step(
    &self,
    goal: &Goal,
    completed: &[SubmittedStep],
    step_text: &str,
    cancel: CancelToken,
  ) -> Result<StepFeedback, EvalError> {
    if !cancel.is_live() {
      return Err(EvalError::Cancelled);
    }

    // Milestones already satisfied by prior submissions are off the table.
    let done: HashSet<usize> = completed
      .iter()
      .filter_map(|s| s.feedback.matched_required_step)
      .collect();

    let words = content_words(step_text);
    let mut best: Option<(usize, usize)> = None; // (index, overlap)
    for (idx, rs) in goal.required_steps.iter().enumerate() {
      if done.contains(&idx) {
        continue;
      }
      let mut target = content_words(&rs.step);
      target.extend(content_words(&rs.hint));
      let overlap = words.intersection(&target).count();
      if overlap > best.map_or(0, |(_, o)| o) {
        best = Some((idx, overlap));
      }
    }

    Ok(match best {
      Some((idx, overlap)) if overlap >= MATCH_THRESHOLD => StepFeedback {
        is_valid: true,
        feedback: "Good: that accomplishes one of the milestones for this problem. Keep going.".into(),
        suggestions: vec![],
        is_complete: true,
        matched_required_step: Some(idx),
      },
      Some((_, _)) => StepFeedback {
        is_valid: true,
        feedback: "You are on the right track, but the step is not specific enough to count as done.".into(),
        suggestions: vec![
          "Name the quantity you will measure or calculate.".into(),
          "Say what equipment or relation you would use.".into(),
        ],
        is_complete: false,
        matched_required_step: None,
      },
      None => StepFeedback {
        is_valid: false,
        feedback: "That does not move this problem forward. Think about what the goal is asking you to find.".into(),
        suggestions: vec!["Start from the quantity the problem asks for and work backwards.".into()],
        is_complete: false,
        matched_required_step: None,
      },
    })
  }

  #[instrument(level = "info", skip_all, fields(goal_id = %goal.id, answer_len = answer.len()))]
  async fn grade_final_answer(
    &self,
    goal: &Goal,
    _steps: &[SubmittedStep],
    answer: &str,
    cancel: CancelToken,
  ) -> Result<FinalAnswerFeedback, EvalError> {
    if !cancel.is_live() {
      return Err(EvalError::Cancelled);
    }

    let expected = leading_number(&goal.correct_answer);
    let got = leading_number(answer);
    let is_correct = match (expected, got) {
      (Some(e), Some(g)) if e == 0.0 => g.abs() < 1e-9,
      (Some(e), Some(g)) => ((g - e) / e).abs() <= ANSWER_TOLERANCE,
      _ => false,
    };

    let units_note = match &goal.units {
      Some(u) if !answer.contains(u.as_str()) => format!(" Remember to state the units ({u})."),
      _ => String::new(),
    };

    Ok(FinalAnswerFeedback {
      is_correct,
      feedback: if is_correct {
        format!("Correct, within tolerance.{units_note}")
      } else {
        format!("Not quite: the numeric value is off.{units_note}")
      },
      correct_answer: goal.correct_answer.clone(),
      explanation: if is_correct {
        "Your value agrees with the reference answer within 5%.".into()
      } else {
        "Compare your result against the reference value and re-check each step.".into()
      },
      game_complete: is_correct,
    })
  }
}

/// Lowercased words longer than three characters, used for overlap matching.
fn content_words(text: &str) -> HashSet<String> {
  text
    .split(|c: char| !c.is_alphanumeric())
    .filter(|w| w.chars().count() > 3)
    .map(|w| w.to_lowercase())
    .collect()
}

/// Minimal set of built-in goals that guarantee the app is useful even
/// without external config or an API key.
fn seed_goals() -> Vec<SeedGoal> {
  vec![
    SeedGoal {
      topics: vec!["gravity".into(), "pendulum".into(), "mechanics".into()],
      goal: Goal {
        id: "g-pendulum".into(),
        source: GoalSource::Seed,
        title: "Determine Earth's gravitational acceleration experimentally".into(),
        description: "A physics student wants to determine Earth's gravitational acceleration \
                      using experimental methods. They have a string, a small mass, a ruler and \
                      a stopwatch, and can design their own experiment. What value do they find?"
          .into(),
        required_steps: vec![
          RequiredStep {
            step: "Assemble a simple pendulum and measure its length".into(),
            hint: "Measure from the pivot to the center of the mass.".into(),
          },
          RequiredStep {
            step: "Measure the period of the pendulum".into(),
            hint: "Time many swings and divide to reduce timing error.".into(),
          },
          RequiredStep {
            step: "Relate the period and length to gravitational acceleration".into(),
            hint: "Recall $T = 2\\pi\\sqrt{L/g}$ for small oscillations.".into(),
          },
          RequiredStep {
            step: "Solve for g and compute a numeric value".into(),
            hint: "Rearrange the period formula to isolate $g$.".into(),
          },
        ],
        correct_answer: "9.8".into(),
        units: Some("m/s²".into()),
      },
    },
    SeedGoal {
      topics: vec!["projectile".into(), "kinematics".into(), "motion".into()],
      goal: Goal {
        id: "g-projectile".into(),
        source: GoalSource::Seed,
        title: "Find the range of a projectile launched from a cliff".into(),
        description: "A ball is thrown horizontally at 12 m/s from the top of a 20 m cliff. \
                      How far from the base of the cliff does it land? Ignore air resistance."
          .into(),
        required_steps: vec![
          RequiredStep {
            step: "Separate the motion into horizontal and vertical components".into(),
            hint: "The two components are independent; gravity only acts vertically.".into(),
          },
          RequiredStep {
            step: "Find the time of flight from the vertical drop".into(),
            hint: "Use $h = \\tfrac{1}{2} g t^2$ with the cliff height.".into(),
          },
          RequiredStep {
            step: "Compute the horizontal distance travelled in that time".into(),
            hint: "Horizontal speed is constant: $x = v t$.".into(),
          },
          RequiredStep {
            step: "Check the result for plausibility and state it with units".into(),
            hint: "Does a couple of seconds of flight at 12 m/s give a sensible range?".into(),
          },
        ],
        correct_answer: "24.2".into(),
        units: Some("m".into()),
      },
    },
  ]
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tutor() -> SeedTutor {
    SeedTutor::new(&[])
  }

  #[tokio::test]
  async fn topic_match_serves_the_pendulum_goal() {
    let t = tutor();
    let g = t.generate_goal("gravity", CancelToken::never()).await.unwrap();
    assert_eq!(g.id, "g-pendulum");
    assert!(g.step_count_ok());
  }

  #[tokio::test]
  async fn unknown_topic_still_serves_something() {
    let t = tutor();
    let g = t.generate_goal("thermodynamics of toast", CancelToken::never()).await.unwrap();
    assert!(g.step_count_ok());
  }

  #[tokio::test]
  async fn overlapping_step_text_completes_a_milestone() {
    let t = tutor();
    let g = t.generate_goal("pendulum", CancelToken::never()).await.unwrap();
    let fb = t
      .grade_step(&g, &[], "I will measure the period by timing many swings", CancelToken::never())
      .await
      .unwrap();
    assert!(fb.is_complete);
    assert_eq!(fb.matched_required_step, Some(1));
  }

  #[tokio::test]
  async fn unrelated_step_text_fails_without_matching() {
    let t = tutor();
    let g = t.generate_goal("pendulum", CancelToken::never()).await.unwrap();
    let fb = t.grade_step(&g, &[], "bake a cake", CancelToken::never()).await.unwrap();
    assert!(!fb.is_complete);
    assert_eq!(fb.matched_required_step, None);
  }

  #[tokio::test]
  async fn final_answer_tolerance_and_units_note() {
    let t = tutor();
    let g = t.generate_goal("gravity", CancelToken::never()).await.unwrap();
    let ok = t
      .grade_final_answer(&g, &[], "9.81 m/s²", CancelToken::never())
      .await
      .unwrap();
    assert!(ok.is_correct);
    assert!(ok.game_complete);

    let wrong = t.grade_final_answer(&g, &[], "42", CancelToken::never()).await.unwrap();
    assert!(!wrong.is_correct);
    assert!(!wrong.game_complete);
  }
}

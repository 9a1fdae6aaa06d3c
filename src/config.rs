//! Loading tutor configuration (prompts + optional goal bank) from TOML.
//!
//! See `TutorConfig` and `Prompts` for expected schema.

use serde::Deserialize;
use tracing::{info, error};

use crate::domain::RequiredStep;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TutorConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub goals: Vec<GoalCfg>,
}

/// Goal entry accepted in TOML configuration. Served by the offline tutor
/// when its `topics` tags match the requested topic.
#[derive(Clone, Debug, Deserialize)]
pub struct GoalCfg {
  #[serde(default)] pub id: Option<String>,
  pub title: String,
  pub description: String,
  pub steps: Vec<RequiredStep>,
  pub correct_answer: String,
  #[serde(default)] pub units: Option<String>,
  #[serde(default)] pub topics: Vec<String>,
}

/// Prompts used by the model evaluator. Defaults are tuned for high-school /
/// early-college physics. Override them in TOML to tune tone/structure.
#[derive(Clone, Debug, Deserialize)]
pub struct Prompts {
  // Goal generation
  pub goal_system: String,
  pub goal_user_template: String,
  // Step grading
  pub step_eval_system: String,
  pub step_eval_user_template: String,
  // Final-answer grading
  pub final_eval_system: String,
  pub final_eval_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      goal_system: "You are a physics problem generator for students. Respond ONLY with strict JSON.".into(),
      goal_user_template: r#"Create a physics problem for students to solve. The problem should be about: {topic}

The problem should:
- Be open-ended and require the student to determine their own approach
- Have a clear, specific goal (what they need to find/calculate)
- Include rich context and description of the scenario
- Have a clear numerical answer
- Be appropriate for high school or early college level

IMPORTANT:
- Do NOT reveal methodology in the description
- DO provide interesting context, scenario details, and background information

Return JSON with fields: title, description, required_steps, correct_answer, units.
required_steps must be an array of 4 to 6 objects, each with:
  "step": a clear description of what needs to be done
  "hint": what the student should think about or consider
Use LaTeX inside $...$ for math where helpful."#.into(),
      step_eval_system: "You are a physics tutor grading one solution step. Be encouraging but precise. Respond ONLY with strict JSON.".into(),
      step_eval_user_template: r#"You are a physics tutor helping a student solve this problem.

IMPORTANT CONTEXT: The student only sees this goal title: "{title}"
The student does NOT see any description, setup details, or additional context.

Full problem context (for your reference only):
DESCRIPTION: {description}

REQUIRED STEPS TO COMPLETE THE PROBLEM:
{required_steps}

Previous completed steps:
{completed_steps}

The student has described their next step as:
"{step_text}"

Evaluate this step. Consider whether it is logically sound, whether the
approach makes physical sense, and which of the required steps (if any) it
accomplishes. Since the student only sees the goal title, do NOT assume they
know any setup details or specific conditions.

Return JSON: {"is_valid": boolean, "feedback": string, "suggestions": [string], "is_complete": boolean, "matched_required_step": integer 0-based index or null}"#.into(),
      final_eval_system: "You are a physics tutor grading a final answer. Respond ONLY with strict JSON.".into(),
      final_eval_user_template: r#"You are a physics tutor evaluating a student's final answer.

PROBLEM: {title}
DESCRIPTION: {description}
CORRECT ANSWER: {correct_answer}
EXPECTED UNITS: {units}

The student's solution steps were:
{steps}

The student's final answer is: "{answer}"

Evaluate the final answer: numerical value within reasonable tolerance,
correct units, physical plausibility. Provide constructive feedback.

Return JSON: {"is_correct": boolean, "feedback": string, "correct_answer": string, "explanation": string, "game_complete": boolean}"#.into(),
    }
  }
}

/// Attempt to load `TutorConfig` from AGENT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_tutor_config_from_env() -> Option<TutorConfig> {
  let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<TutorConfig>(&s) {
      Ok(cfg) => {
        info!(target: "galileo_backend", %path, "Loaded tutor config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "galileo_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "galileo_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_prompts_cover_every_template_slot() {
    let p = Prompts::default();
    for tpl in [&p.goal_user_template, &p.step_eval_user_template, &p.final_eval_user_template] {
      assert!(!tpl.is_empty());
    }
    assert!(p.goal_user_template.contains("{topic}"));
    assert!(p.step_eval_user_template.contains("{step_text}"));
    assert!(p.final_eval_user_template.contains("{answer}"));
  }

  #[test]
  fn goal_bank_entries_parse_from_toml() {
    let cfg: TutorConfig = toml::from_str(
      r#"
      [[goals]]
      title = "Find g with a pendulum"
      description = "Design an experiment."
      correct_answer = "9.8"
      units = "m/s²"
      topics = ["gravity", "pendulum"]
      steps = [
        { step = "Measure the period", hint = "Time many swings" },
        { step = "Measure the length", hint = "Pivot to bob center" },
        { step = "Relate period to g", hint = "T = 2π√(L/g)" },
        { step = "Solve for g", hint = "Rearrange the formula" },
      ]
      "#,
    )
    .expect("toml parses");
    assert_eq!(cfg.goals.len(), 1);
    assert_eq!(cfg.goals[0].steps.len(), 4);
    assert!(cfg.prompts.goal_system.contains("physics"));
  }
}

//! Minimal OpenAI-compatible client for our use-cases.
//!
//! We only call chat.completions and request a strict JSON object matching
//! one of the three feedback shapes. Calls are instrumented and log model
//! names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key and we keep payload truncations short to
//! avoid leaking student text into logs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{instrument, info, error};
use uuid::Uuid;

use crate::config::Prompts;
use crate::domain::{
  FinalAnswerFeedback, Goal, GoalSource, RequiredStep, StepFeedback, SubmittedStep,
};
use crate::evaluator::{validate_step_feedback, CancelToken, EvalError, Evaluator};
use crate::util::{fill_template, trunc_for_log};

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub model: String,
  pub prompts: Prompts,
}

/// Wire shape the model returns for goal generation.
#[derive(Deserialize)]
struct GoalWire {
  title: String,
  description: String,
  required_steps: Vec<RequiredStep>,
  correct_answer: String,
  #[serde(default)] units: Option<String>,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(prompts: Prompts) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".into());

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(20))
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, model, prompts })
  }

  /// JSON-object chat completion. Generic over the target type T.
  /// Races the round trip against the cancel token; a superseded call
  /// resolves to `EvalError::Cancelled` without waiting for the transport.
  #[instrument(level = "info", skip(self, system, user, cancel), fields(model = %self.model))]
  async fn chat_json<T: for<'a> Deserialize<'a>>(
    &self,
    system: &str,
    user: &str,
    temperature: f32,
    cancel: CancelToken,
  ) -> Result<T, EvalError> {
    let round_trip = self.chat_json_inner::<T>(system, user, temperature);
    tokio::select! {
      _ = cancel.cancelled() => Err(EvalError::Cancelled),
      res = round_trip => res,
    }
  }

  async fn chat_json_inner<T: for<'a> Deserialize<'a>>(
    &self,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<T, EvalError> {
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: self.model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
      max_tokens: None,
    };

    let res = self.client.post(&url)
      .header(USER_AGENT, "galileo-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await
      .map_err(|e| EvalError::Transport(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status().as_u16();
      let body = res.text().await.unwrap_or_default();
      let message = extract_openai_error(&body).unwrap_or_else(|| trunc_for_log(&body, 200));
      return Err(EvalError::Http { status, message });
    }

    let body: ChatCompletionResponse =
      res.json().await.map_err(|e| EvalError::Transport(e.to_string()))?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default();

    serde_json::from_str::<T>(&text)
      .map_err(|e| EvalError::InvalidResponse(format!("JSON parse error: {}", e)))
  }

  async fn request_goal(&self, topic: &str, cancel: CancelToken) -> Result<Goal, EvalError> {
    let system = &self.prompts.goal_system;
    let user = fill_template(&self.prompts.goal_user_template, &[("topic", topic)]);
    let wire: GoalWire = self.chat_json(system, &user, 0.95, cancel).await?;
    Ok(Goal {
      id: Uuid::new_v4().to_string(),
      source: GoalSource::Generated,
      title: wire.title,
      description: wire.description,
      required_steps: wire.required_steps,
      correct_answer: wire.correct_answer,
      units: wire.units,
    })
  }
}

/// Render the required-step list for grading prompts (1-based, text only).
fn required_steps_block(goal: &Goal) -> String {
  goal
    .required_steps
    .iter()
    .enumerate()
    .map(|(i, rs)| format!("{}. {}", i + 1, rs.step))
    .collect::<Vec<_>>()
    .join("\n")
}

/// Render prior submissions as "Step N: description" lines.
fn steps_block(steps: &[SubmittedStep]) -> String {
  if steps.is_empty() {
    return "None yet".into();
  }
  steps
    .iter()
    .map(|s| format!("Step {}: {}", s.ordinal, s.description))
    .collect::<Vec<_>>()
    .join("\n")
}

#[async_trait]
impl Evaluator for OpenAI {
  fn name(&self) -> &'static str {
    "openai"
  }

  /// Generate a fresh goal. Retries once if the model ignores the 4-6
  /// required-step constraint.
  #[instrument(level = "info", skip(self, cancel), fields(%topic, model = %self.model))]
  async fn generate_goal(&self, topic: &str, cancel: CancelToken) -> Result<Goal, EvalError> {
    let start = std::time::Instant::now();
    let mut goal = self.request_goal(topic, cancel.clone()).await?;
    if !goal.step_count_ok() {
      error!(target: "session", steps = goal.required_steps.len(), "Goal arrived with out-of-range step count; retrying once");
      goal = self.request_goal(topic, cancel).await?;
      if !goal.step_count_ok() {
        return Err(EvalError::InvalidResponse(format!(
          "goal has {} required steps, expected 4-6",
          goal.required_steps.len()
        )));
      }
    }
    info!(
      goal_id = %goal.id,
      elapsed = ?start.elapsed(),
      steps = goal.required_steps.len(),
      title_preview = %goal.title.chars().take(40).collect::<String>(),
      "Goal generated"
    );
    Ok(goal)
  }

  #[instrument(level = "info", skip_all, fields(goal_id = %goal.id, step_len = step_text.len(), prior = completed.len()))]
  async fn grade_step(
    &self,
    goal: &Goal,
    completed: &[SubmittedStep],
    step_text: &str,
    cancel: CancelToken,
  ) -> Result<StepFeedback, EvalError> {
    let system = &self.prompts.step_eval_system;
    let user = fill_template(
      &self.prompts.step_eval_user_template,
      &[
        ("title", &goal.title),
        ("description", &goal.description),
        ("required_steps", &required_steps_block(goal)),
        ("completed_steps", &steps_block(completed)),
        ("step_text", step_text),
      ],
    );
    let fb: StepFeedback = self.chat_json(system, &user, 0.2, cancel).await?;
    validate_step_feedback(&fb, goal)?;
    Ok(fb)
  }

  #[instrument(level = "info", skip_all, fields(goal_id = %goal.id, answer_len = answer.len(), steps = steps.len()))]
  async fn grade_final_answer(
    &self,
    goal: &Goal,
    steps: &[SubmittedStep],
    answer: &str,
    cancel: CancelToken,
  ) -> Result<FinalAnswerFeedback, EvalError> {
    let system = &self.prompts.final_eval_system;
    let units = goal.units.clone().unwrap_or_else(|| "N/A".into());
    let user = fill_template(
      &self.prompts.final_eval_user_template,
      &[
        ("title", &goal.title),
        ("description", &goal.description),
        ("correct_answer", &goal.correct_answer),
        ("units", &units),
        ("steps", &steps_block(steps)),
        ("answer", answer),
      ],
    );
    self.chat_json(system, &user, 0.2, cancel).await
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}

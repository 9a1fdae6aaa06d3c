//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::domain::{FinalAnswerFeedback, GamePhase, GoalSource, StepFeedback};
use crate::session::Session;

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    GetState,
    SelectGoal {
        topic: String,
    },
    SubmitStep {
        text: String,
    },
    SubmitFinalAnswer {
        text: String,
    },
    MoveToFinalAnswer,
    RevealStep {
        index: usize,
    },
    RevealAllSteps,
    Reset,
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Session {
        session: SessionSnapshot,
    },
    Error {
        message: String,
    },
}

/// DTO used by both WS and HTTP for goal delivery. Hints live in the goal's
/// required steps; whether the client shows them is driven by the parallel
/// `hints_shown` / `revealed` arrays on the snapshot.
#[derive(Debug, Serialize)]
pub struct GoalOut {
    pub id: String,
    pub source: GoalSource,
    pub title: String,
    pub description: String,
    pub required_steps: Vec<RequiredStepOut>,
    pub correct_answer: String,
    pub units: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequiredStepOut {
    pub step: String,
    pub hint: String,
}

#[derive(Debug, Serialize)]
pub struct StepOut {
    pub ordinal: u32,
    pub description: String,
    pub feedback: StepFeedback,
}

#[derive(Debug, Serialize)]
pub struct FinalAnswerOut {
    pub text: String,
    pub feedback: FinalAnswerFeedback,
}

/// The read-only state the presentation layer renders. Milestone progress is
/// exposed as parallel arrays aligned with `goal.required_steps`.
#[derive(Debug, Serialize)]
pub struct SessionSnapshot {
    pub phase: GamePhase,
    pub goal: Option<GoalOut>,
    pub steps: Vec<StepOut>,
    pub current_step_number: u32,
    pub completed: Vec<bool>,
    pub hints_shown: Vec<bool>,
    pub revealed: Vec<bool>,
    pub final_answer: Option<FinalAnswerOut>,
    pub busy: bool,
}

/// Convert the internal `Session` (plus the controller's busy flag) to the
/// public snapshot DTO.
pub fn to_snapshot(s: &Session, busy: bool) -> SessionSnapshot {
    SessionSnapshot {
        phase: s.phase,
        goal: s.goal.as_ref().map(|g| GoalOut {
            id: g.id.clone(),
            source: g.source.clone(),
            title: g.title.clone(),
            description: g.description.clone(),
            required_steps: g
                .required_steps
                .iter()
                .map(|rs| RequiredStepOut { step: rs.step.clone(), hint: rs.hint.clone() })
                .collect(),
            correct_answer: g.correct_answer.clone(),
            units: g.units.clone(),
        }),
        steps: s
            .steps
            .iter()
            .map(|st| StepOut {
                ordinal: st.ordinal,
                description: st.description.clone(),
                feedback: st.feedback.clone(),
            })
            .collect(),
        current_step_number: s.current_step_number,
        completed: s.progress.iter().map(|p| p.completed).collect(),
        hints_shown: s.progress.iter().map(|p| p.hint_shown).collect(),
        revealed: s.progress.iter().map(|p| p.revealed).collect(),
        final_answer: s.final_answer.as_ref().map(|fa| FinalAnswerOut {
            text: fa.text.clone(),
            feedback: fa.feedback.clone(),
        }),
        busy,
    }
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Deserialize)]
pub struct SelectGoalIn {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub struct StepIn {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct FinalAnswerIn {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct RevealIn {
    pub index: usize,
}

#[derive(Serialize)]
pub struct ErrorOut {
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize_from_tagged_json() {
        let msg: ClientWsMessage =
            serde_json::from_str(r#"{"type":"select_goal","topic":"gravity"}"#).unwrap();
        assert!(matches!(msg, ClientWsMessage::SelectGoal { ref topic } if topic == "gravity"));

        let msg: ClientWsMessage =
            serde_json::from_str(r#"{"type":"reveal_step","index":2}"#).unwrap();
        assert!(matches!(msg, ClientWsMessage::RevealStep { index: 2 }));

        let msg: ClientWsMessage = serde_json::from_str(r#"{"type":"reset"}"#).unwrap();
        assert!(matches!(msg, ClientWsMessage::Reset));
    }

    #[test]
    fn snapshot_exposes_parallel_progress_arrays() {
        let mut s = Session::default();
        assert!(serde_json::to_string(&to_snapshot(&s, false)).unwrap().contains("selecting_goal"));

        s.phase = crate::domain::GamePhase::GeneratingGoal;
        let snap = to_snapshot(&s, true);
        assert!(snap.busy);
        assert!(snap.goal.is_none());
        assert!(snap.completed.is_empty());
    }
}

//! # Tool Call Dispatcher
//!
//! Interprets the function calls the agent makes and drives the onboarding
//! stage machine.
//!
//! ## Recognized Tools:
//! - **setStage(stageNumber)**: move to stage 1..=6, never backwards
//! - **completeOnboarding(status?)**: terminal `kyc_complete`
//! - **completeWithExpert(paymentMethod)**: terminal `expert_handover`
//!
//! ## Acknowledgement Contract:
//! Every call, recognized or not and valid or not, yields exactly one
//! [`ToolAck`] carrying the call id. The ack is part of [`Dispatch`], so a
//! caller cannot handle a call without getting one to send. Anything that
//! cannot be applied is reported as a protocol anomaly and otherwise ignored.
//!
//! ## Stage Machine:
//! ```text
//! Active(1) → Active(2) → … → Active(6)
//!     │            │              │
//!     └────────────┴──────────────┴──→ KycComplete | ExpertHandover
//! ```
//! Once terminal, no further transitions apply.

use crate::error::SessionError;
use crate::transport::{FunctionCall, ToolAck};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Result string sent back for every call.
pub const ACK_RESULT: &str = "OK";

/// One step of the six-step onboarding script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Stage(u8);

impl Stage {
    pub const FIRST: Stage = Stage(1);
    pub const LAST: Stage = Stage(6);

    pub fn new(number: u8) -> Option<Stage> {
        (Self::FIRST.0..=Self::LAST.0)
            .contains(&number)
            .then_some(Stage(number))
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the student will pay, chosen during the expert handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    FullPayment,
    CreditCard,
    PersonalLoan,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::FullPayment => "full_payment",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::PersonalLoan => "personal_loan",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    /// Case-insensitive; spaces and dashes count as underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match normalized.as_str() {
            "full_payment" => Ok(PaymentMethod::FullPayment),
            "credit_card" => Ok(PaymentMethod::CreditCard),
            "personal_loan" => Ok(PaymentMethod::PersonalLoan),
            _ => Err(format!("unknown payment method {:?}", s)),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function call with validated, typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    SetStage { stage: Stage },
    CompleteOnboarding { status: Option<String> },
    CompleteWithExpert { payment_method: PaymentMethod },
    /// A recognized tool whose arguments do not match its schema.
    Malformed { name: String, reason: String },
    Unknown { name: String },
}

impl ToolCall {
    pub fn parse(call: &FunctionCall) -> ToolCall {
        let malformed = |reason: String| ToolCall::Malformed {
            name: call.name.clone(),
            reason,
        };

        match call.name.as_str() {
            "setStage" => match parse_stage(argument(&call.args, "stageNumber")) {
                Ok(stage) => ToolCall::SetStage { stage },
                Err(reason) => malformed(reason),
            },
            "completeOnboarding" => ToolCall::CompleteOnboarding {
                status: argument(&call.args, "status")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "completeWithExpert" => match argument(&call.args, "paymentMethod") {
                Some(Value::String(method)) => match method.parse() {
                    Ok(payment_method) => ToolCall::CompleteWithExpert { payment_method },
                    Err(reason) => malformed(reason),
                },
                Some(other) => malformed(format!("paymentMethod must be a string, got {}", other)),
                None => malformed("missing paymentMethod".to_string()),
            },
            other => ToolCall::Unknown {
                name: other.to_string(),
            },
        }
    }
}

/// Arguments arrive either as `{key: value}` or as the bare value.
fn argument<'a>(args: &'a Value, key: &str) -> Option<&'a Value> {
    match args {
        Value::Object(map) => map.get(key),
        Value::Null => None,
        bare => Some(bare),
    }
}

fn parse_stage(value: Option<&Value>) -> Result<Stage, String> {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(other) => return Err(format!("stageNumber is not numeric: {}", other)),
        None => return Err("missing stageNumber".to_string()),
    }
    .filter(|n| n.is_finite())
    .ok_or_else(|| format!("stageNumber is not numeric: {:?}", value))?;

    if number.fract() != 0.0 || !(1.0..=6.0).contains(&number) {
        return Err(format!("stageNumber {} is not a stage between 1 and 6", number));
    }
    Stage::new(number as u8).ok_or_else(|| format!("stageNumber {} out of range", number))
}

/// Where the onboarding conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageState {
    Active { stage: Stage },
    KycComplete,
    ExpertHandover { payment_method: PaymentMethod },
}

impl Default for StageState {
    fn default() -> Self {
        StageState::Active {
            stage: Stage::FIRST,
        }
    }
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageState::Active { .. })
    }

    /// Current stage, `None` once terminal.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StageState::Active { stage } => Some(*stage),
            _ => None,
        }
    }
}

/// Terminal payload forwarded to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Completion {
    KycComplete { status: Option<String> },
    ExpertHandover { method: PaymentMethod },
}

/// Local effect of one handled call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    StageChanged(Stage),
    Completed(Completion),
    /// Acknowledged, not applied.
    Ignored(SessionError),
}

/// Everything produced by handling one call: the mandatory ack and the local effect.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub ack: ToolAck,
    pub outcome: DispatchOutcome,
}

#[derive(Debug)]
pub struct ToolCallDispatcher {
    state: StageState,
    reached: Stage,
    handled: u64,
}

impl Default for ToolCallDispatcher {
    fn default() -> Self {
        Self {
            state: StageState::default(),
            reached: Stage::FIRST,
            handled: 0,
        }
    }
}

impl ToolCallDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Last stage entered. Survives the move into a terminal state.
    pub fn stage_reached(&self) -> Stage {
        self.reached
    }

    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Apply one call and return its acknowledgement.
    pub fn handle(&mut self, call: &FunctionCall) -> Dispatch {
        self.handled += 1;
        let ack = ToolAck {
            id: call.id.clone(),
            name: call.name.clone(),
            result: ACK_RESULT.to_string(),
        };
        let outcome = self.apply(ToolCall::parse(call));

        match &outcome {
            DispatchOutcome::StageChanged(stage) => {
                info!(call_id = %call.id, stage = stage.number(), "Stage changed");
            }
            DispatchOutcome::Completed(completion) => {
                info!(call_id = %call.id, completion = ?completion, "Onboarding completed");
            }
            DispatchOutcome::Ignored(anomaly) => {
                warn!(call_id = %call.id, tool = %call.name, anomaly = %anomaly, "Tool call acknowledged but not applied");
            }
        }

        Dispatch { ack, outcome }
    }

    fn apply(&mut self, call: ToolCall) -> DispatchOutcome {
        let ignored = |msg: String| DispatchOutcome::Ignored(SessionError::Protocol(msg));

        match call {
            ToolCall::Unknown { name } => return ignored(format!("unknown tool {:?}", name)),
            ToolCall::Malformed { name, reason } => {
                return ignored(format!("{} arguments rejected: {}", name, reason))
            }
            _ => {}
        }

        let current = match self.state {
            StageState::Active { stage } => stage,
            terminal => {
                return ignored(format!("onboarding already finished ({:?})", terminal));
            }
        };

        match call {
            ToolCall::SetStage { stage } if stage >= current => {
                self.state = StageState::Active { stage };
                self.reached = stage;
                DispatchOutcome::StageChanged(stage)
            }
            ToolCall::SetStage { stage } => ignored(format!(
                "stage regression from {} to {} refused",
                current, stage
            )),
            ToolCall::CompleteOnboarding { status } => {
                self.state = StageState::KycComplete;
                DispatchOutcome::Completed(Completion::KycComplete { status })
            }
            ToolCall::CompleteWithExpert { payment_method } => {
                self.state = StageState::ExpertHandover { payment_method };
                DispatchOutcome::Completed(Completion::ExpertHandover {
                    method: payment_method,
                })
            }
            ToolCall::Unknown { .. } | ToolCall::Malformed { .. } => {
                ignored("unreachable tool variant".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    fn stage(n: u8) -> Stage {
        Stage::new(n).unwrap()
    }

    #[test]
    fn test_set_stage_argument_shapes() {
        for args in [json!({"stageNumber": 3}), json!(3), json!("3"), json!({"stageNumber": "3"}), json!(3.0)] {
            assert_eq!(
                ToolCall::parse(&call("c", "setStage", args.clone())),
                ToolCall::SetStage { stage: stage(3) },
                "args {}",
                args
            );
        }
    }

    #[test]
    fn test_set_stage_rejects_non_stages() {
        for args in [json!({"stageNumber": "two"}), json!(0), json!(7), json!(2.5), json!(true), json!({})] {
            assert!(
                matches!(ToolCall::parse(&call("c", "setStage", args.clone())), ToolCall::Malformed { .. }),
                "args {}",
                args
            );
        }
    }

    #[test]
    fn test_forward_and_equal_stage_changes_apply() {
        let mut dispatcher = ToolCallDispatcher::new();
        let d = dispatcher.handle(&call("1", "setStage", json!({"stageNumber": 2})));
        assert_eq!(d.outcome, DispatchOutcome::StageChanged(stage(2)));
        assert_eq!(d.ack.id, "1");
        assert_eq!(d.ack.result, "OK");

        let d = dispatcher.handle(&call("2", "setStage", json!({"stageNumber": 2})));
        assert_eq!(d.outcome, DispatchOutcome::StageChanged(stage(2)));

        let d = dispatcher.handle(&call("3", "setStage", json!({"stageNumber": 5})));
        assert_eq!(d.outcome, DispatchOutcome::StageChanged(stage(5)));
        assert_eq!(dispatcher.state().stage(), Some(stage(5)));
    }

    #[test]
    fn test_regression_is_acknowledged_but_not_applied() {
        let mut dispatcher = ToolCallDispatcher::new();
        dispatcher.handle(&call("1", "setStage", json!(4)));

        let d = dispatcher.handle(&call("2", "setStage", json!(3)));
        assert_eq!(d.ack.id, "2");
        assert!(matches!(d.outcome, DispatchOutcome::Ignored(SessionError::Protocol(_))));
        assert_eq!(dispatcher.state().stage(), Some(stage(4)));
    }

    #[test]
    fn test_complete_with_expert() {
        let mut dispatcher = ToolCallDispatcher::new();
        let d = dispatcher.handle(&call(
            "x",
            "completeWithExpert",
            json!({"paymentMethod": "credit_card"}),
        ));
        assert_eq!(
            d.outcome,
            DispatchOutcome::Completed(Completion::ExpertHandover {
                method: PaymentMethod::CreditCard
            })
        );
        assert_eq!(
            dispatcher.state(),
            StageState::ExpertHandover {
                payment_method: PaymentMethod::CreditCard
            }
        );
        assert_eq!(
            serde_json::to_value(Completion::ExpertHandover {
                method: PaymentMethod::CreditCard
            })
            .unwrap(),
            json!({"type": "expert_handover", "method": "credit_card"})
        );
    }

    #[test]
    fn test_stage_reached_survives_completion() {
        let mut dispatcher = ToolCallDispatcher::new();
        assert_eq!(dispatcher.stage_reached(), Stage::FIRST);
        dispatcher.handle(&call("1", "setStage", json!(4)));
        dispatcher.handle(&call("2", "setStage", json!(2)));
        dispatcher.handle(&call("3", "completeWithExpert", json!({"paymentMethod": "personal_loan"})));

        assert!(dispatcher.state().is_terminal());
        assert_eq!(dispatcher.state().stage(), None);
        assert_eq!(dispatcher.stage_reached(), stage(4));
    }

    #[test]
    fn test_payment_method_normalization() {
        assert_eq!("Personal Loan".parse(), Ok(PaymentMethod::PersonalLoan));
        assert_eq!(" FULL-PAYMENT ".parse(), Ok(PaymentMethod::FullPayment));
        assert!("crypto".parse::<PaymentMethod>().is_err());
    }

    #[test]
    fn test_unknown_payment_method_is_not_applied() {
        let mut dispatcher = ToolCallDispatcher::new();
        let d = dispatcher.handle(&call("x", "completeWithExpert", json!({"paymentMethod": "barter"})));
        assert!(matches!(d.outcome, DispatchOutcome::Ignored(_)));
        assert!(!dispatcher.state().is_terminal());

        let d = dispatcher.handle(&call("y", "completeWithExpert", json!({})));
        assert!(matches!(d.outcome, DispatchOutcome::Ignored(_)));
    }

    #[test]
    fn test_complete_onboarding_is_terminal() {
        let mut dispatcher = ToolCallDispatcher::new();
        let d = dispatcher.handle(&call("k", "completeOnboarding", json!({"status": "verified"})));
        assert_eq!(
            d.outcome,
            DispatchOutcome::Completed(Completion::KycComplete {
                status: Some("verified".into())
            })
        );

        // Nothing applies after a terminal marker, but everything is still acknowledged.
        let d = dispatcher.handle(&call("late", "setStage", json!(6)));
        assert_eq!(d.ack.id, "late");
        assert!(matches!(d.outcome, DispatchOutcome::Ignored(_)));
        assert_eq!(dispatcher.state(), StageState::KycComplete);
    }

    #[test]
    fn test_unknown_tool_is_acknowledged() {
        let mut dispatcher = ToolCallDispatcher::new();
        let d = dispatcher.handle(&call("u1", "bookCalendarSlot", json!({"day": "mon"})));
        assert_eq!(
            d.ack,
            ToolAck {
                id: "u1".into(),
                name: "bookCalendarSlot".into(),
                result: "OK".into()
            }
        );
        assert!(matches!(d.outcome, DispatchOutcome::Ignored(_)));
        assert_eq!(dispatcher.state(), StageState::default());
        assert_eq!(dispatcher.handled(), 1);
    }
}

//! math handler: add / multiply / average / max / min over a list of numbers.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::app::handler::{Handler, HandlerContext, HandlerError, HandlerOutput};
use crate::domain::envelope::HandlerName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathOperation {
    Add,
    Multiply,
    Average,
    Max,
    Min,
}

impl MathOperation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Average => "average",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    fn apply(&self, nums: &[f64]) -> f64 {
        match self {
            Self::Add => nums.iter().sum(),
            Self::Multiply => nums.iter().product(),
            Self::Average => nums.iter().sum::<f64>() / nums.len() as f64,
            Self::Max => nums.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Min => nums.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MathPayload {
    pub operation: MathOperation,
    pub numbers: Vec<Value>,
}

pub struct MathHandler;

#[async_trait]
impl Handler for MathHandler {
    const NAME: HandlerName = HandlerName::Math;
    type Payload = MathPayload;

    async fn process(
        &self,
        payload: MathPayload,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        if payload.numbers.is_empty() {
            return Err(HandlerError::InvalidPayload(
                "numbers must not be empty".to_string(),
            ));
        }
        let nums = payload
            .numbers
            .iter()
            .map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| HandlerError::InvalidPayload("all numbers must be numeric".to_string()))?;

        let op = payload.operation;
        let result = op.apply(&nums);
        tracing::debug!(operation = op.as_str(), input_count = nums.len(), "math operation completed");

        Ok(HandlerOutput::new(json!({
            "status": "success",
            "message": format!("{} completed", op.as_str()),
            "result": {
                "operation": op.as_str(),
                "input_numbers": payload.numbers,
                "result": result,
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::Action;
    use crate::testing::caller;
    use rstest::rstest;

    fn ctx() -> HandlerContext {
        HandlerContext {
            caller_id: caller("u1"),
            action: Action::Analyze,
            prior: Vec::new(),
        }
    }

    #[rstest]
    #[case(MathOperation::Add, 10.0)]
    #[case(MathOperation::Multiply, 24.0)]
    #[case(MathOperation::Average, 2.5)]
    #[case(MathOperation::Max, 4.0)]
    #[case(MathOperation::Min, 1.0)]
    #[tokio::test]
    async fn operations(#[case] operation: MathOperation, #[case] expected: f64) {
        let out = MathHandler
            .process(
                MathPayload {
                    operation,
                    numbers: vec![json!(1), json!(2), json!("3"), json!(4.0)],
                },
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out.value["result"]["result"], json!(expected));
    }

    #[tokio::test]
    async fn non_numeric_input_is_rejected() {
        let err = MathHandler
            .process(
                MathPayload {
                    operation: MathOperation::Add,
                    numbers: vec![json!(1), json!("x")],
                },
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}

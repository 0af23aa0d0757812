use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::ToolDefinition;
use crate::error::ToolError;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct CalculateSumInput {
    #[schemars(description = "The first number to add.")]
    a: f64,
    #[schemars(description = "The second number to add.")]
    b: f64,
}

pub(super) async fn calculate_sum_impl(input: Value) -> Result<String, ToolError> {
    let input: CalculateSumInput = serde_json::from_value(input)?;
    let sum = input.a + input.b;
    let result = if sum.fract() == 0.0 && sum.abs() < 9.0e15 {
        json!(sum as i64)
    } else {
        json!(sum)
    };
    Ok(json!({ "result": result }).to_string())
}

pub(super) fn definition() -> ToolDefinition {
    ToolDefinition::from_schema(
        "calculate_sum",
        "Calculate the sum of two numbers and return it as {\"result\": <sum>}.",
        Value::from(schema_for!(CalculateSumInput)),
    )
}

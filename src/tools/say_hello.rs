use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::ToolDefinition;
use crate::error::ToolError;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct SayHelloInput {
    #[schemars(description = "The name of the person to greet.")]
    name: String,
}

pub(super) async fn say_hello_impl(input: Value) -> Result<String, ToolError> {
    let input: SayHelloInput = serde_json::from_value(input)?;
    if input.name.trim().is_empty() {
        return Err(ToolError::Failed("name must not be empty".to_string()));
    }
    Ok(json!({ "message": format!("👋 Hello, {}!", input.name.trim()) }).to_string())
}

pub(super) fn definition() -> ToolDefinition {
    ToolDefinition::from_schema(
        "say_hello",
        "Say hello to the given person name.",
        Value::from(schema_for!(SayHelloInput)),
    )
}

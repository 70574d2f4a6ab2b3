use serde_json::{Map, Value};

use crate::relay::{RelayError, RelayErrorKind};

/// One planned tool invocation, as produced by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub tool: String,
    pub input: Map<String, Value>,
}

/// Shape of the model output: either a lone call or an ordered list of them.
/// Normalized into a flat call list before anything else touches it.
#[derive(Debug, Clone, PartialEq)]
pub enum CallPlan {
    OneCall(CallRequest),
    ManyCalls(Vec<CallRequest>),
}

impl CallPlan {
    /// Parses the model's `output` value. The accepted shapes are a single
    /// `{tool, input}` object or an array of them; anything else is a
    /// client-input error and no tool call happens. An empty array is a
    /// valid plan that executes zero calls.
    pub fn parse(output: &Value) -> Result<Self, RelayError> {
        match output {
            Value::Object(_) => Ok(Self::OneCall(parse_call(output)?)),
            Value::Array(items) => {
                let mut calls = Vec::with_capacity(items.len());
                for item in items {
                    calls.push(parse_call(item)?);
                }
                Ok(Self::ManyCalls(calls))
            }
            other => Err(RelayError::new(
                RelayErrorKind::InvalidModelOutput,
                format!("model output is not a tool call or call list: {other}"),
            )),
        }
    }

    pub fn into_calls(self) -> Vec<CallRequest> {
        match self {
            Self::OneCall(call) => vec![call],
            Self::ManyCalls(calls) => calls,
        }
    }
}

fn parse_call(value: &Value) -> Result<CallRequest, RelayError> {
    let object = value.as_object().ok_or_else(|| {
        RelayError::new(
            RelayErrorKind::InvalidModelOutput,
            format!("call entry is not an object: {value}"),
        )
    })?;
    let tool = object
        .get("tool")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|tool| !tool.is_empty())
        .ok_or_else(|| {
            RelayError::new(
                RelayErrorKind::InvalidModelOutput,
                "call entry is missing a tool name",
            )
        })?
        .to_owned();
    let input = object
        .get("input")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| {
            RelayError::new(
                RelayErrorKind::InvalidModelOutput,
                format!("call entry for tool {tool} is missing an input object"),
            )
        })?;
    Ok(CallRequest { tool, input })
}

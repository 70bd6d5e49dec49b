use serde_json::{json, Value};

use crate::error::{ChannelError, Result};

/// Commands the host sends for Vim to execute internally.
///
/// `Expr` and `Call` may carry a negative correlation id; Vim answers
/// such commands with a message bearing the same id.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Redraw the screen: `["redraw", force?]`
    Redraw { force: bool },
    /// Execute an ex command: `["ex", command]`
    Ex { command: String },
    /// Feed normal mode keys: `["normal", keys]`
    Normal { keys: String },
    /// Evaluate an expression: `["expr", expr]` or `["expr", expr, id]`
    Expr { expr: String, id: Option<i64> },
    /// Call a function: `["call", func, args]` or `["call", func, args, id]`
    Call {
        func: String,
        args: Vec<Value>,
        id: Option<i64>,
    },
}

impl Command {
    /// The correlation id, for the two variants that can expect a reply.
    pub fn id(&self) -> Option<i64> {
        match self {
            Command::Expr { id, .. } | Command::Call { id, .. } => *id,
            _ => None,
        }
    }

    /// Parse a command back from its array form. Handy for test peers
    /// and for inspecting traffic captures.
    pub fn parse(arr: &[Value]) -> Result<Self> {
        let name = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::protocol("command array must start with a name"))?;
        match name {
            "redraw" => {
                let force = arr.get(1).and_then(Value::as_str) == Some("force");
                Ok(Command::Redraw { force })
            }
            "ex" => {
                let command = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChannelError::protocol("ex command missing text"))?
                    .to_string();
                Ok(Command::Ex { command })
            }
            "normal" => {
                let keys = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChannelError::protocol("normal command missing keys"))?
                    .to_string();
                Ok(Command::Normal { keys })
            }
            "expr" => {
                let expr = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChannelError::protocol("expr command missing expression"))?
                    .to_string();
                let id = match arr.get(2) {
                    Some(id) => Some(
                        id.as_i64()
                            .ok_or_else(|| ChannelError::protocol("expr id must be an integer"))?,
                    ),
                    None => None,
                };
                Ok(Command::Expr { expr, id })
            }
            "call" => {
                let func = arr
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChannelError::protocol("call command missing function"))?
                    .to_string();
                let args = arr
                    .get(2)
                    .and_then(Value::as_array)
                    .ok_or_else(|| ChannelError::protocol("call command missing args array"))?
                    .clone();
                let id = match arr.get(3) {
                    Some(id) => Some(
                        id.as_i64()
                            .ok_or_else(|| ChannelError::protocol("call id must be an integer"))?,
                    ),
                    None => None,
                };
                Ok(Command::Call { func, args, id })
            }
            other => Err(ChannelError::protocol(format!("unknown command: {other}"))),
        }
    }

    /// Encode to the wire form Vim expects.
    pub fn encode(&self) -> Value {
        match self {
            Command::Redraw { force } => {
                if *force {
                    json!(["redraw", "force"])
                } else {
                    json!(["redraw", ""])
                }
            }
            Command::Ex { command } => json!(["ex", command]),
            Command::Normal { keys } => json!(["normal", keys]),
            Command::Expr { expr, id: Some(id) } => json!(["expr", expr, id]),
            Command::Expr { expr, id: None } => json!(["expr", expr]),
            Command::Call {
                func,
                args,
                id: Some(id),
            } => json!(["call", func, args, id]),
            Command::Call {
                func,
                args,
                id: None,
            } => json!(["call", func, args]),
        }
    }
}

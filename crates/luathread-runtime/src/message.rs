//! Messages exchanged between a manager and its worker.
//!
//! Manager → worker: `Input`, `Cancel`, `Restart`.
//! Worker → manager: `Result`, `PrintFlush`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Code submitted for execution plus the arguments passed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub code: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Input {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(code: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            code: code.into(),
            args,
        }
    }
}

impl From<&str> for Input {
    fn from(code: &str) -> Self {
        Input::new(code)
    }
}

impl From<String> for Input {
    fn from(code: String) -> Self {
        Input::new(code)
    }
}

/// Payload of a `Result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum Outcome {
    /// Ordered return values of the executed code.
    Values(Vec<Value>),
    /// The executed code raised an error.
    Error(String),
    /// The worker could not start or restart its interpreter context.
    Unavailable(String),
    /// Acknowledges a clean cancellation; the worker is about to exit.
    Cancelled,
}

impl Outcome {
    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Outcome::Values(values) => Some(values),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_) | Outcome::Unavailable(_))
    }
}

/// A message travelling through a [`MessagePort`](crate::port::MessagePort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Input(Input),
    Cancel { clean: bool },
    Restart,
    Result(Outcome),
    PrintFlush { output: Vec<u8> },
}

/// Message discriminant, with the numeric ids used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Result,
    PrintFlush,
    Input,
    Cancel,
    Restart,
}

impl MessageKind {
    pub const fn id(self) -> u16 {
        match self {
            MessageKind::Result => 100,
            MessageKind::PrintFlush => 101,
            MessageKind::Input => 200,
            MessageKind::Cancel => 201,
            MessageKind::Restart => 202,
        }
    }

    pub const fn from_id(id: u16) -> Option<MessageKind> {
        match id {
            100 => Some(MessageKind::Result),
            101 => Some(MessageKind::PrintFlush),
            200 => Some(MessageKind::Input),
            201 => Some(MessageKind::Cancel),
            202 => Some(MessageKind::Restart),
            _ => None,
        }
    }

    /// Control messages flow manager → worker.
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            MessageKind::Input | MessageKind::Cancel | MessageKind::Restart
        )
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Input(_) => MessageKind::Input,
            Message::Cancel { .. } => MessageKind::Cancel,
            Message::Restart => MessageKind::Restart,
            Message::Result(_) => MessageKind::Result,
            Message::PrintFlush { .. } => MessageKind::PrintFlush,
        }
    }
}

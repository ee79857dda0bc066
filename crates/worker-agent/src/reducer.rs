//! Result assembly for one kernel execution
//!
//! The kernel answers an execute request with a stream of heterogeneous
//! messages. `ExecutionAssembly` is a pure reducer over that stream: feed
//! it messages until one is terminal, then take the outcome. Keeping it
//! free of I/O makes the assembly rules testable without a kernel.

use serde::Deserialize;
use serde_json::Value;

/// One parsed message off the kernel channel.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelMessage {
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParentHeader {
    #[serde(default)]
    pub msg_id: Option<String>,
}

/// Final result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Accumulated textual output; may be empty.
    Text(String),
    /// Base64 PNG payload. An image always wins over buffered text.
    Image(String),
    /// The user's code raised; detail is "ename: evalue".
    UserError(String),
    /// The kernel reported itself dead mid-execution.
    KernelDead,
    /// The channel to the kernel closed before a terminal message.
    ConnectionLost,
    /// The execution budget elapsed before a terminal message.
    TimedOut,
}

/// Accumulates the reply messages for a single execute request.
pub struct ExecutionAssembly {
    msg_id: String,
    text_parts: Vec<String>,
    image_base64: Option<String>,
    error: Option<String>,
    kernel_dead: bool,
}

impl ExecutionAssembly {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            text_parts: Vec::new(),
            image_base64: None,
            error: None,
            kernel_dead: false,
        }
    }

    /// Feeds one message into the assembly. Returns `true` when the reply
    /// is complete and no further messages should be consumed.
    ///
    /// Messages answering some other request are ignored; this is what
    /// makes leftover replies from a timed-out execution harmless.
    pub fn absorb(&mut self, msg: &KernelMessage) -> bool {
        if msg.parent_header.msg_id.as_deref() != Some(self.msg_id.as_str()) {
            return false;
        }

        if content_str(&msg.content, "execution_state") == Some("dead") {
            self.kernel_dead = true;
            return true;
        }

        match msg.msg_type.as_str() {
            "stream" => {
                if let Some(text) = content_str(&msg.content, "text") {
                    self.text_parts.push(text.to_string());
                }
                false
            }
            "execute_result" => {
                if let Some(text) = msg
                    .content
                    .get("data")
                    .and_then(|data| data.get("text/plain"))
                    .and_then(Value::as_str)
                {
                    self.text_parts.push(text.to_string());
                }
                false
            }
            "display_data" => {
                if let Some(image) = msg
                    .content
                    .get("data")
                    .and_then(|data| data.get("image/png"))
                    .and_then(Value::as_str)
                {
                    // Last image wins.
                    self.image_base64 = Some(image.to_string());
                }
                false
            }
            "error" => {
                let ename = content_str(&msg.content, "ename").unwrap_or("Error");
                let evalue = content_str(&msg.content, "evalue").unwrap_or("");
                self.error = Some(format!("{ename}: {evalue}"));
                true
            }
            "status" => content_str(&msg.content, "execution_state") == Some("idle"),
            _ => false,
        }
    }

    /// Collapses the accumulated state. Precedence: error, then image,
    /// then text.
    pub fn into_outcome(self) -> ExecutionOutcome {
        if self.kernel_dead {
            return ExecutionOutcome::KernelDead;
        }
        if let Some(error) = self.error {
            return ExecutionOutcome::UserError(error);
        }
        if let Some(image) = self.image_base64 {
            return ExecutionOutcome::Image(image);
        }
        ExecutionOutcome::Text(self.text_parts.concat())
    }
}

fn content_str<'a>(content: &'a Value, key: &str) -> Option<&'a str> {
    content.get(key).and_then(Value::as_str)
}

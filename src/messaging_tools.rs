//! Messaging tools exposed to agents
//!
//! Thin adapters that let an agent drive the kernel's mailbox operations
//! from inside its loop. Every invocation carries a session id; the sending
//! or receiving agent is resolved through the kernel's session index, which
//! the runtime maintains whenever a run starts.

use crate::agent::{AgentTool, ToolContext, ToolError};
use crate::domain_types::{AgentId, IdempotencyKey, MessageId, RunId, TopicName};
use crate::kernel::{Kernel, NackOptions, ReceiveOptions, RequeueOptions, SendMessageRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Weak};

/// The tool set attached to agent profiles on registration.
#[must_use]
pub fn messaging_tool_set(kernel: &Arc<Kernel>) -> Vec<Arc<dyn AgentTool>> {
    let kernel = Arc::downgrade(kernel);
    vec![
        Arc::new(SendMessageTool {
            kernel: kernel.clone(),
        }),
        Arc::new(ReceiveMessagesTool {
            kernel: kernel.clone(),
        }),
        Arc::new(AckMessagesTool {
            kernel: kernel.clone(),
        }),
        Arc::new(NackMessageTool {
            kernel: kernel.clone(),
        }),
        Arc::new(ListDeadLettersTool {
            kernel: kernel.clone(),
        }),
        Arc::new(RequeueDeadLetterTool { kernel }),
    ]
}

fn upgrade(kernel: &Weak<Kernel>) -> Result<Arc<Kernel>, ToolError> {
    kernel
        .upgrade()
        .ok_or_else(|| ToolError::Execution("kernel has shut down".to_string()))
}

fn resolve_agent(kernel: &Kernel, context: &ToolContext) -> Result<AgentId, ToolError> {
    kernel
        .agent_for_session(&context.session_id)
        .ok_or_else(|| ToolError::UnknownSession(context.session_id.clone()))
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: Value) -> Result<T, ToolError> {
    serde_json::from_value(input).map_err(|error| ToolError::InvalidInput(error.to_string()))
}

fn to_output<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|error| ToolError::Execution(error.to_string()))
}

struct SendMessageTool {
    kernel: Weak<Kernel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageInput {
    to_agent_id: String,
    payload: Value,
    topic: Option<String>,
    idempotency_key: Option<String>,
    correlation_id: Option<String>,
    run_id: Option<RunId>,
}

#[async_trait]
impl AgentTool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a reliable message to another agent's mailbox"
    }

    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let kernel = upgrade(&self.kernel)?;
        let from = resolve_agent(&kernel, context)?;
        let input: SendMessageInput = parse_input(input)?;

        let to = AgentId::try_new(input.to_agent_id)
            .map_err(|error| ToolError::InvalidInput(error.to_string()))?;
        let topic = input
            .topic
            .map(TopicName::try_new)
            .transpose()
            .map_err(|error| ToolError::InvalidInput(error.to_string()))?;
        let idempotency_key = input
            .idempotency_key
            .map(IdempotencyKey::try_new)
            .transpose()
            .map_err(|error| ToolError::InvalidInput(error.to_string()))?;

        let message = kernel
            .send_message(SendMessageRequest {
                from,
                to,
                payload: input.payload,
                topic,
                partition_key: None,
                idempotency_key,
                correlation_id: input.correlation_id,
                run_id: input.run_id,
                max_attempts: None,
                visible_at: None,
            })
            .map_err(|error| ToolError::Execution(error.to_string()))?;
        to_output(&message)
    }
}

struct ReceiveMessagesTool {
    kernel: Weak<Kernel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReceiveMessagesInput {
    limit: Option<usize>,
    lease_ms: Option<u64>,
}

#[async_trait]
impl AgentTool for ReceiveMessagesTool {
    fn name(&self) -> &str {
        "receive_messages"
    }

    fn description(&self) -> &str {
        "Lease pending messages from this agent's mailbox"
    }

    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let kernel = upgrade(&self.kernel)?;
        let agent_id = resolve_agent(&kernel, context)?;
        let input: ReceiveMessagesInput = parse_input(input)?;

        let messages = kernel.receive_mailbox(
            &agent_id,
            ReceiveOptions {
                limit: input.limit,
                lease_ms: input.lease_ms,
            },
        );
        to_output(&messages)
    }
}

struct AckMessagesTool {
    kernel: Weak<Kernel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckMessagesInput {
    message_ids: Vec<MessageId>,
}

#[async_trait]
impl AgentTool for AckMessagesTool {
    fn name(&self) -> &str {
        "ack_messages"
    }

    fn description(&self) -> &str {
        "Acknowledge leased messages so they are not redelivered"
    }

    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let kernel = upgrade(&self.kernel)?;
        let agent_id = resolve_agent(&kernel, context)?;
        let input: AckMessagesInput = parse_input(input)?;

        let mut acked = Vec::new();
        let mut not_found = Vec::new();
        for message_id in input.message_ids {
            if kernel.ack_mailbox_message(&agent_id, message_id) {
                acked.push(message_id);
            } else {
                not_found.push(message_id);
            }
        }
        Ok(json!({ "acked": acked, "notFound": not_found }))
    }
}

struct NackMessageTool {
    kernel: Weak<Kernel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NackMessageInput {
    message_id: MessageId,
    error: Option<String>,
    requeue_delay_ms: Option<u64>,
}

#[async_trait]
impl AgentTool for NackMessageTool {
    fn name(&self) -> &str {
        "nack_message"
    }

    fn description(&self) -> &str {
        "Return a leased message for retry or dead-lettering"
    }

    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let kernel = upgrade(&self.kernel)?;
        let agent_id = resolve_agent(&kernel, context)?;
        let input: NackMessageInput = parse_input(input)?;

        let result = kernel.nack_mailbox_message(
            &agent_id,
            input.message_id,
            NackOptions {
                error: input.error,
                requeue_delay_ms: input.requeue_delay_ms,
            },
        );
        match result {
            Some(outcome) => to_output(&outcome),
            None => Ok(json!({ "requeued": false, "deadLettered": false, "notFound": true })),
        }
    }
}

struct ListDeadLettersTool {
    kernel: Weak<Kernel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListDeadLettersInput {
    limit: Option<usize>,
}

#[async_trait]
impl AgentTool for ListDeadLettersTool {
    fn name(&self) -> &str {
        "list_dead_letters"
    }

    fn description(&self) -> &str {
        "List this agent's quarantined messages"
    }

    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let kernel = upgrade(&self.kernel)?;
        let agent_id = resolve_agent(&kernel, context)?;
        let input: ListDeadLettersInput = parse_input(input)?;

        let dead_letters = kernel.list_dead_letters(&agent_id, input.limit);
        to_output(&dead_letters)
    }
}

struct RequeueDeadLetterTool {
    kernel: Weak<Kernel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequeueDeadLetterInput {
    message_id: MessageId,
    delay_ms: Option<u64>,
    reset_attempts: Option<bool>,
}

#[async_trait]
impl AgentTool for RequeueDeadLetterTool {
    fn name(&self) -> &str {
        "requeue_dead_letter"
    }

    fn description(&self) -> &str {
        "Move a quarantined message back into the mailbox queue"
    }

    async fn invoke(&self, context: &ToolContext, input: Value) -> Result<Value, ToolError> {
        let kernel = upgrade(&self.kernel)?;
        let agent_id = resolve_agent(&kernel, context)?;
        let input: RequeueDeadLetterInput = parse_input(input)?;

        let requeued = kernel.requeue_dead_letter(
            &agent_id,
            input.message_id,
            RequeueOptions {
                delay_ms: input.delay_ms.unwrap_or(0),
                reset_attempts: input.reset_attempts.unwrap_or(false),
            },
        );
        match requeued {
            Some(message) => to_output(&message),
            None => Ok(json!({ "requeued": false, "notFound": true })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_input_accepts_camel_case_fields() {
        let input: SendMessageInput = serde_json::from_value(json!({
            "toAgentId": "reviewer",
            "payload": { "n": 1 },
            "topic": "reviews",
            "idempotencyKey": "k-1",
        }))
        .unwrap();
        assert_eq!(input.to_agent_id, "reviewer");
        assert_eq!(input.topic.as_deref(), Some("reviews"));
        assert_eq!(input.idempotency_key.as_deref(), Some("k-1"));
        assert!(input.run_id.is_none());
    }

    #[test]
    fn receive_input_defaults_are_open() {
        let input: ReceiveMessagesInput = serde_json::from_value(json!({})).unwrap();
        assert!(input.limit.is_none());
        assert!(input.lease_ms.is_none());

        let input: ReceiveMessagesInput =
            serde_json::from_value(json!({ "limit": 5, "leaseMs": 1000 })).unwrap();
        assert_eq!(input.limit, Some(5));
        assert_eq!(input.lease_ms, Some(1000));
    }

    #[test]
    fn nack_input_requires_a_message_id() {
        assert!(serde_json::from_value::<NackMessageInput>(json!({})).is_err());
        let input: NackMessageInput = serde_json::from_value(json!({
            "messageId": uuid::Uuid::new_v4(),
            "error": "could not parse",
        }))
        .unwrap();
        assert_eq!(input.error.as_deref(), Some("could not parse"));
        assert!(input.requeue_delay_ms.is_none());
    }
}

//! One model round: request a turn, dispatch any tool calls, repeat until the
//! model answers with content only or the round-trip budget runs out.

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::decision::{ModelDecision, ROUND_TRIPS_EXHAUSTED, parse_decision};
use crate::core::types::{Message, ToolSpec};
use crate::io::llm::ChatModel;
use crate::observer::RunObserver;
use crate::tools::{FatalCondition, SessionState, ToolRegistry};

/// Append-only conversation history.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// The model produced a decision (possibly the synthetic round-trip error).
    Decided(ModelDecision),
    /// A tool call hit a fatal condition; the rest of the round was abandoned.
    Fatal(FatalCondition),
}

pub struct ToolLoop<'l, 'a, M: ChatModel + ?Sized> {
    model: &'l M,
    registry: &'l ToolRegistry<'a>,
    specs: Vec<ToolSpec>,
    max_round_trips: u32,
    observer: &'l dyn RunObserver,
}

impl<'l, 'a, M: ChatModel + ?Sized> ToolLoop<'l, 'a, M> {
    pub fn new(
        model: &'l M,
        registry: &'l ToolRegistry<'a>,
        max_round_trips: u32,
        observer: &'l dyn RunObserver,
    ) -> Self {
        Self {
            model,
            registry,
            specs: registry.specs(),
            max_round_trips,
            observer,
        }
    }

    /// Tool calls of one turn run in request order, and their results are
    /// appended in that same order before the next model request.
    #[instrument(skip_all, fields(messages = conversation.len()))]
    pub fn run_round(
        &self,
        conversation: &mut Conversation,
        state: &mut SessionState,
    ) -> Result<RoundOutcome> {
        for trip in 1..=self.max_round_trips {
            let turn = self
                .model
                .complete(conversation.messages(), &self.specs)
                .context("request model turn")?;

            if turn.tool_calls.is_empty() {
                let content = turn.content.trim().to_string();
                let decision = parse_decision(&content);
                conversation.push(Message::assistant(content));
                return Ok(RoundOutcome::Decided(decision));
            }

            debug!(trip, calls = turn.tool_calls.len(), "dispatching tool calls");
            let calls = turn.tool_calls.clone();
            conversation.push(Message::assistant_tool_calls(turn.content, turn.tool_calls));
            for call in &calls {
                let result = self.registry.dispatch(call, state);
                self.observer.on_tool_call(call.name(), &result);
                conversation.push(Message::tool_result(call.id.clone(), result.to_content()));
                if let Some(fatal) = state.fatal.take() {
                    return Ok(RoundOutcome::Fatal(fatal));
                }
            }
        }
        Ok(RoundOutcome::Decided(ModelDecision::error(ROUND_TRIPS_EXHAUSTED)))
    }
}

//! Hard token-budget enforcement for chat-style message sequences.
//!
//! Guarantees a message list never exceeds
//! `context_window - completion_budget - safety_margin` estimated tokens,
//! even for pathological inputs, and never returns an empty list. This is
//! the outbound backpressure for bounded-context remote APIs, the way the
//! VRAM ledger is backpressure for local compute.
//!
//! Token estimation uses a 4-characters-per-token heuristic by default; an
//! exact tokenizer can be plugged in via [`fit_to_budget_with`].

use serde::{Deserialize, Serialize};

/// Heuristic characters-per-token ratio used by [`estimate_tokens`].
pub const CHARS_PER_TOKEN: usize = 4;

/// Extra tokens removed beyond the measured overflow when shrinking the
/// most recent user message, so small estimation errors do not force a
/// second pass.
const SHRINK_SLACK_TOKENS: usize = 16;

/// Replacement body for collapsed system/assistant messages.
const COLLAPSED_STUB: &str = "[context trimmed]";

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user turn.
    User,
    /// Model output from an earlier turn.
    Assistant,
}

/// One (role, content) pair in a chat sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Construct a message with an explicit role.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Shorthand for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Shorthand for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Shorthand for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Pluggable token estimator: text in, estimated token count out.
pub type TokenEstimator = fn(&str) -> usize;

/// Estimate the token count of `text` with the character heuristic,
/// rounding up. The empty string estimates to zero.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Sum of per-message estimates for a sequence.
pub fn estimate_messages(messages: &[ChatMessage], estimator: TokenEstimator) -> usize {
    messages.iter().map(|m| estimator(&m.content)).sum()
}

/// Fit `messages` under the hard budget using the default heuristic
/// estimator. See [`fit_to_budget_with`].
pub fn fit_to_budget(
    messages: Vec<ChatMessage>,
    context_window: usize,
    completion_budget: usize,
    safety_margin: usize,
) -> Vec<ChatMessage> {
    fit_to_budget_with(
        messages,
        context_window,
        completion_budget,
        safety_margin,
        estimate_tokens,
    )
}

/// Fit `messages` so their estimated token count never exceeds
/// `context_window - completion_budget - safety_margin`.
///
/// Reduction stages, applied in order until the sequence fits:
/// 1. No-op when already under budget.
/// 2. Shrink the most recent user message by the overflow plus slack.
/// 3. Collapse system/assistant messages, oldest first, to a minimal stub
///    (order and the final message are preserved).
/// 4. Final guard: a single synthetic user message holding a budget-sized
///    stub of the last user turn.
///
/// The returned list is never empty.
pub fn fit_to_budget_with(
    mut messages: Vec<ChatMessage>,
    context_window: usize,
    completion_budget: usize,
    safety_margin: usize,
    estimator: TokenEstimator,
) -> Vec<ChatMessage> {
    let budget = context_window.saturating_sub(completion_budget + safety_margin);

    if messages.is_empty() {
        return vec![ChatMessage::user(String::new())];
    }
    if estimate_messages(&messages, estimator) <= budget {
        return messages;
    }

    // Stage 2: shrink the most recent user message.
    if let Some(idx) = messages.iter().rposition(|m| m.role == Role::User) {
        let total = estimate_messages(&messages, estimator);
        let overflow = total.saturating_sub(budget) + SHRINK_SLACK_TOKENS;
        let current = estimator(&messages[idx].content);
        let target_tokens = current.saturating_sub(overflow);
        messages[idx].content = head_chars(&messages[idx].content, target_tokens * CHARS_PER_TOKEN);
        tracing::debug!(
            index = idx,
            removed_tokens = overflow.min(current),
            "shrank most recent user message to fit context budget"
        );
    }

    // Stage 3: collapse older system/assistant turns, oldest first. The
    // final message is always left alone.
    let last = messages.len() - 1;
    for idx in 0..last {
        if estimate_messages(&messages, estimator) <= budget {
            break;
        }
        if messages[idx].role != Role::User && messages[idx].content != COLLAPSED_STUB {
            messages[idx].content = COLLAPSED_STUB.to_string();
        }
    }

    if estimate_messages(&messages, estimator) <= budget {
        return messages;
    }

    // Stage 4: final guard. Everything collapses into one synthetic user
    // message carrying a budget-sized stub of the last user turn.
    let source = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .or_else(|| messages.last())
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let stub = head_chars(&source, budget * CHARS_PER_TOKEN);
    tracing::warn!(
        budget_tokens = budget,
        "message sequence collapsed to a single synthetic turn"
    );
    vec![ChatMessage::user(stub)]
}

/// Keep the first `max_chars` characters of `s` (never splits a UTF-8
/// sequence — the budget is counted in characters).
fn head_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

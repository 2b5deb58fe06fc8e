//! Player-to-agent dialog sessions with typewriter reveal.
//!
//! A session owns a bounded history ring and the in-flight response being
//! streamed from the backend. Tokens accumulate in a partial buffer; the
//! reveal cursor trails behind at a fixed per-character interval, so text
//! appears at a steady pace regardless of token arrival bursts.

use crate::{AgentId, DIALOG_HISTORY_LEN};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write as _;
use tracing::debug;

/// Who said a dialog line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Speaker {
    Player,
    Agent,
}

/// One completed line of dialog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogLine {
    pub speaker: Speaker,
    pub text: String,
}

/// An active conversation between the player and one agent.
#[derive(Debug)]
pub struct DialogSession {
    agent: AgentId,
    agent_name: String,
    history: VecDeque<DialogLine>,
    partial: String,
    /// Chars accumulated in `partial`.
    response_chars: usize,
    /// Chars currently revealed; never decreases within one response.
    display_chars: usize,
    /// Byte offset matching `display_chars`, kept so `visible_text` is O(1).
    display_bytes: usize,
    char_timer: f32,
    stream_done: bool,
    awaiting: bool,
}

impl DialogSession {
    /// Open a session with `agent`.
    #[must_use]
    pub fn new(agent: AgentId, agent_name: impl Into<String>) -> Self {
        Self {
            agent,
            agent_name: agent_name.into(),
            history: VecDeque::with_capacity(DIALOG_HISTORY_LEN),
            partial: String::new(),
            response_chars: 0,
            display_chars: 0,
            display_bytes: 0,
            char_timer: 0.0,
            stream_done: false,
            awaiting: false,
        }
    }

    /// The conversation partner.
    #[must_use]
    pub fn agent(&self) -> AgentId {
        self.agent
    }

    /// Display name of the conversation partner.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Completed lines, oldest first. At most [`DIALOG_HISTORY_LEN`].
    #[must_use]
    pub fn history(&self) -> &VecDeque<DialogLine> {
        &self.history
    }

    /// Record a player line and mark the session as awaiting a response.
    pub fn push_player_line(&mut self, text: impl Into<String>) {
        self.push_line(Speaker::Player, text.into());
        self.awaiting = true;
    }

    /// Whether a response has been requested but not yet fully revealed.
    #[must_use]
    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting
    }

    /// Whether revealed text still trails the accumulated response.
    #[must_use]
    pub fn is_revealing(&self) -> bool {
        self.display_chars < self.response_chars
    }

    /// Append a streamed token to the in-flight response.
    pub fn on_token(&mut self, token: &str) {
        if self.stream_done {
            return;
        }
        self.response_chars += token.chars().count();
        self.partial.push_str(token);
    }

    /// Mark the in-flight response as fully generated. Reveal continues
    /// until the cursor catches up.
    pub fn on_complete(&mut self) {
        self.stream_done = true;
    }

    /// Discard the in-flight response, e.g. after an abnormal generation.
    /// History keeps only completed lines.
    pub fn abort_response(&mut self) {
        debug!(agent = ?self.agent, "dialog response discarded");
        self.reset_response();
        self.awaiting = false;
    }

    /// Advance the reveal cursor by `dt` seconds at one character per
    /// `char_interval`. Returns `true` when the response is complete and
    /// fully revealed; the caller should then [`Self::take_response`].
    pub fn update(&mut self, dt: f32, char_interval: f32) -> bool {
        if dt > 0.0 && self.display_chars < self.response_chars {
            self.char_timer += dt;
            let step = char_interval.max(f32::EPSILON);
            while self.char_timer >= step && self.display_chars < self.response_chars {
                self.char_timer -= step;
                self.reveal_one();
            }
        }
        self.stream_done && self.display_chars == self.response_chars
    }

    /// Response text revealed so far.
    #[must_use]
    pub fn visible_text(&self) -> &str {
        &self.partial[..self.display_bytes]
    }

    /// Chars revealed so far.
    #[must_use]
    pub fn display_chars(&self) -> usize {
        self.display_chars
    }

    /// If the response is complete and fully revealed, commit it to the
    /// history and return it.
    pub fn take_response(&mut self) -> Option<String> {
        if !self.stream_done || self.display_chars < self.response_chars {
            return None;
        }
        let text = std::mem::take(&mut self.partial);
        self.reset_response();
        self.awaiting = false;
        if !text.is_empty() {
            self.push_line(Speaker::Agent, text.clone());
        }
        Some(text)
    }

    /// Render the history block used in dialog prompts, oldest first.
    #[must_use]
    pub fn history_prompt_block(&self, player_name: &str) -> String {
        let mut block = String::new();
        for line in &self.history {
            let who = match line.speaker {
                Speaker::Player => player_name,
                Speaker::Agent => self.agent_name.as_str(),
            };
            let _ = writeln!(block, "{who}: {text}", text = line.text);
        }
        block
    }

    fn push_line(&mut self, speaker: Speaker, text: String) {
        if self.history.len() == DIALOG_HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(DialogLine { speaker, text });
    }

    fn reveal_one(&mut self) {
        if let Some(ch) = self.partial[self.display_bytes..].chars().next() {
            self.display_bytes += ch.len_utf8();
            self.display_chars += 1;
        }
    }

    fn reset_response(&mut self) {
        self.partial.clear();
        self.response_chars = 0;
        self.display_chars = 0;
        self.display_bytes = 0;
        self.char_timer = 0.0;
        self.stream_done = false;
    }
}

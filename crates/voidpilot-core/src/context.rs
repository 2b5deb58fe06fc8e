//! Bounded prompt assembly for AI tasks.
//!
//! The context builder copies everything it needs out of the store at build
//! time; a built [`AIContext`] holds no borrows and stays valid however the
//! universe mutates afterwards.

use crate::scheduler::TaskKind;
use crate::{AWARENESS_NEIGHBORS, AgentId, AgentKind, BehaviorState, Personality, Vec3};
use smallvec::SmallVec;
use std::fmt::Write as _;

/// Copied view of one agent, assembled by the universe for prompt building.
#[derive(Debug, Clone)]
pub struct AgentView {
    pub id: AgentId,
    pub kind: AgentKind,
    pub name: Option<String>,
    pub position: Vec3,
    pub velocity: Vec3,
    pub state: BehaviorState,
    pub health: f32,
    pub energy: f32,
    pub fuel: f32,
    pub dist_to_player: f32,
    pub visual_range: f32,
    pub personality: Option<Personality>,
    pub last_msg_in: Option<String>,
}

impl AgentView {
    /// Display name, falling back to the role when unnamed.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.role())
    }
}

/// Summary of one nearby agent carried in a context snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborSummary {
    pub id: AgentId,
    pub name: String,
    pub position: Vec3,
}

/// Immutable situational snapshot handed to the inference backend.
#[derive(Debug, Clone)]
pub struct AIContext {
    /// Full assembled prompt, bounded by the builder's character budget.
    pub prompt: String,
    pub position: Vec3,
    pub velocity: Vec3,
    pub visual_range: f32,
    /// Up to `K_NEIGHBORS` nearby agents, nearest first.
    pub neighbors: SmallVec<[NeighborSummary; 4]>,
    /// Rendered personality text, empty when the agent has none.
    pub personality_text: String,
    /// Current-goal text.
    pub goal_text: String,
    /// Memory text (the last inbound transmission).
    pub memory_text: String,
    /// The task directive appended to the prompt.
    pub task_prompt: &'static str,
    /// Expected-output-format hint.
    pub format_hint: &'static str,
    /// Advisory response-time requirement in milliseconds.
    pub response_time_ms: u32,
    /// Token limit for the generation.
    pub token_limit: usize,
}

/// Builds bounded prompts from agent views and neighbor summaries.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    budget: usize,
}

impl ContextBuilder {
    /// Create a builder with the given character budget.
    #[must_use]
    pub const fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// Character budget applied to built prompts.
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Build a context for `view` performing task `kind`.
    ///
    /// `neighbors` must already be nearest-first; only the first
    /// [`AWARENESS_NEIGHBORS`] appear in the awareness block, though the
    /// full list (bounded by the caller) is carried in the snapshot.
    #[must_use]
    pub fn build(&self, view: &AgentView, neighbors: &[NeighborSummary], kind: TaskKind) -> AIContext {
        let budget = self.budget;
        let mut prompt = String::with_capacity(budget.min(1024));

        let name = view.display_name();
        let _ = writeln!(prompt, "You are {name}, a {role}.", role = view.kind.role());
        let _ = writeln!(
            prompt,
            "Position ({:.0}, {:.0}, {:.0}), velocity ({:.1}, {:.1}, {:.1}).",
            view.position.x,
            view.position.y,
            view.position.z,
            view.velocity.x,
            view.velocity.y,
            view.velocity.z,
        );
        let _ = writeln!(
            prompt,
            "Status: {state}, hull {health:.0}%, energy {energy:.0}%, fuel {fuel:.0}%.",
            state = view.state.label(),
            health = view.health,
            energy = view.energy,
            fuel = view.fuel,
        );

        let mut personality_text = String::new();
        let mut goal_text = String::new();
        if let Some(personality) = &view.personality {
            personality_text.push_str(&personality.base_prompt);
            if !personality.dialog_style.is_empty() {
                let _ = write!(personality_text, " Style: {}.", personality.dialog_style);
            }
            goal_text.push_str(&personality.goals);
            let _ = writeln!(prompt, "Persona: {personality_text}");
            if !goal_text.is_empty() {
                let _ = writeln!(prompt, "Goals: {goal_text}");
            }
        }

        if !neighbors.is_empty() {
            prompt.push_str("Nearby: ");
            for (i, neighbor) in neighbors.iter().take(AWARENESS_NEIGHBORS).enumerate() {
                if i > 0 {
                    prompt.push_str("; ");
                }
                let _ = write!(
                    prompt,
                    "{}@({:.0},{:.0},{:.0})",
                    neighbor.name, neighbor.position.x, neighbor.position.y, neighbor.position.z,
                );
            }
            prompt.push_str(".\n");
        }

        let memory_text = view.last_msg_in.clone().unwrap_or_default();
        if !memory_text.is_empty() {
            let _ = writeln!(prompt, "Last transmission received: \"{memory_text}\"");
        }

        let task_prompt = directive(kind);
        prompt.push_str(task_prompt);
        prompt.push('\n');

        truncate_to_chars(&mut prompt, budget);

        AIContext {
            prompt,
            position: view.position,
            velocity: view.velocity,
            visual_range: view.visual_range,
            neighbors: neighbors.iter().cloned().collect(),
            personality_text,
            goal_text,
            memory_text,
            task_prompt,
            format_hint: format_hint(kind),
            response_time_ms: if view.dist_to_player < 100.0 { 50 } else { 500 },
            token_limit: kind.max_tokens(),
        }
    }
}

/// Task directive templates keyed by task kind. The template tells the
/// backend the expected response shape.
#[must_use]
pub(crate) const fn directive(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Dialog => "Respond in character to the transmission, 120 characters or fewer.",
        TaskKind::Combat => {
            "Decide your combat move. Reply with one short order: engage, evade, or hold."
        }
        TaskKind::Navigation => "Propose a route and speed. Reply briefly, e.g. `move to waypoint at half thrust`.",
        TaskKind::Behavior => "Choose what to do next. Reply with exactly one word: patrol or idle.",
        TaskKind::Trade => "Decide your next trade action in one short sentence.",
        TaskKind::Social => "Compose one short in-character remark to a nearby contact.",
        TaskKind::Creative => "Note one short observation in your captain's log.",
        TaskKind::Reaction => {
            "A ship approaches. Reply with exactly one of: turn_to_face_player, send_greeting, move_away_cautiously, ignore_player."
        }
    }
}

/// Expected-output-format hints, coarser than the directives.
#[must_use]
pub(crate) const fn format_hint(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Dialog | TaskKind::Social | TaskKind::Creative => "free text, one line",
        TaskKind::Behavior | TaskKind::Reaction => "single keyword",
        TaskKind::Combat | TaskKind::Navigation | TaskKind::Trade => "short imperative sentence",
    }
}

/// Truncate a string to at most `budget` characters on a char boundary.
fn truncate_to_chars(text: &mut String, budget: usize) {
    if text.chars().count() <= budget {
        return;
    }
    let byte_end = text
        .char_indices()
        .nth(budget)
        .map_or(text.len(), |(idx, _)| idx);
    text.truncate(byte_end);
}

//! Three-lane AI task scheduler and response interpretation.
//!
//! Tasks are queued into high, medium, and low priority lanes and dispatched
//! under a per-tick budget. Lanes drain strictly in order: a low-lane task
//! never runs while a higher lane holds work. Within a lane, tasks are kept
//! sorted by priority, FIFO among equals.

use crate::context::AIContext;
use crate::{AgentId, BehaviorState};
use serde::{Deserialize, Serialize};
use slotmap::Key;
use std::collections::VecDeque;
use tracing::trace;

/// Distance gate for medium-lane task kinds, in world units.
pub const MEDIUM_LANE_RANGE: f32 = 500.0;
/// Distance gate for low-lane task kinds, in world units.
pub const LOW_LANE_RANGE: f32 = 2000.0;

/// What an AI task asks the backend to decide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Conversational reply to the player. Streams through a dialog session.
    Dialog,
    /// Combat decision.
    Combat,
    /// Route and speed decision.
    Navigation,
    /// General next-action choice.
    Behavior,
    /// Trading decision.
    Trade,
    /// Remark aimed at a nearby contact.
    Social,
    /// Captain's-log flavor text.
    Creative,
    /// Reaction to the player approaching.
    Reaction,
}

impl TaskKind {
    /// All kinds, in lane order.
    pub const ALL: [Self; 8] = [
        Self::Dialog,
        Self::Combat,
        Self::Navigation,
        Self::Behavior,
        Self::Trade,
        Self::Social,
        Self::Creative,
        Self::Reaction,
    ];

    /// The lane this kind is queued into.
    #[must_use]
    pub const fn lane(self) -> Lane {
        match self {
            Self::Dialog => Lane::High,
            Self::Combat | Self::Navigation => Lane::Medium,
            Self::Behavior | Self::Trade | Self::Social | Self::Creative | Self::Reaction => {
                Lane::Low
            }
        }
    }

    /// Token limit for a generation of this kind.
    #[must_use]
    pub const fn max_tokens(self) -> usize {
        match self {
            Self::Dialog => 150,
            _ => 100,
        }
    }

    /// Whether a task of this kind is admitted for an agent at the given
    /// distance from the player. Dialog is never distance-gated.
    #[must_use]
    pub fn admitted_at(self, dist_to_player: f32) -> bool {
        match self.lane() {
            Lane::High => true,
            Lane::Medium => dist_to_player < MEDIUM_LANE_RANGE,
            Lane::Low => dist_to_player < LOW_LANE_RANGE,
        }
    }
}

/// Scheduler lane, drained strictly high to low.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Lane {
    High,
    Medium,
    Low,
}

impl Lane {
    /// Short lowercase label used in logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// One queued unit of AI work.
#[derive(Debug, Clone)]
pub struct AITask {
    /// Monotonic id assigned at submission.
    pub id: u64,
    /// The agent this task acts for.
    pub agent: AgentId,
    pub kind: TaskKind,
    /// Snapshot built at submission; holds no borrows into the store.
    pub context: AIContext,
    /// Intra-lane ordering key, higher first.
    pub priority: f32,
    /// Simulation time at submission, in seconds.
    pub created_t: f64,
    /// Advisory completion deadline derived from the context's
    /// response-time requirement. Dispatch never drops late tasks.
    pub deadline: f64,
}

/// Aggregate scheduler counters, sampled per tick into [`crate::TickSummary`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerMetrics {
    /// Tasks accepted into a lane.
    pub submitted: u64,
    /// Tasks handed to the backend.
    pub dispatched: u64,
    /// Tasks rejected by the distance gate.
    pub rejected: u64,
    /// Tasks dropped because their agent left the universe.
    pub purged: u64,
    /// Dispatches whose generation ended abnormally.
    pub failed: u64,
}

/// Priority-lane scheduler. Submission is cheap; dispatch order is
/// deterministic for a given submission sequence.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    next_id: u64,
    high: VecDeque<AITask>,
    medium: VecDeque<AITask>,
    low: VecDeque<AITask>,
    metrics: SchedulerMetrics,
}

impl TaskScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task for `agent`, assigning it the next monotonic id.
    /// `now` is the current simulation time. Returns the assigned id.
    pub fn submit(
        &mut self,
        agent: AgentId,
        kind: TaskKind,
        context: AIContext,
        priority: f32,
        now: f64,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = now + f64::from(context.response_time_ms) / 1000.0;
        let task = AITask {
            id,
            agent,
            kind,
            context,
            priority,
            created_t: now,
            deadline,
        };
        trace!(task_id = id, kind = ?kind, lane = kind.lane().label(), priority, "task submitted");
        let lane = self.lane_mut(kind.lane());
        // Insert before the first strictly lower priority, keeping FIFO
        // order among equal priorities.
        let at = lane
            .iter()
            .position(|queued| queued.priority < priority)
            .unwrap_or(lane.len());
        lane.insert(at, task);
        self.metrics.submitted += 1;
        id
    }

    /// Record a task rejected by the distance gate.
    pub fn note_rejected(&mut self) {
        self.metrics.rejected += 1;
    }

    /// Record a dispatch whose generation ended abnormally.
    pub fn note_failed(&mut self) {
        self.metrics.failed += 1;
    }

    /// Pop the next task to run: lanes drain strictly high to low.
    pub fn pop_next(&mut self) -> Option<AITask> {
        let task = self
            .high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())?;
        self.metrics.dispatched += 1;
        Some(task)
    }

    /// Drop every queued task belonging to `agent`. Returns how many were
    /// removed.
    pub fn purge_agent(&mut self, agent: AgentId) -> usize {
        let mut removed = 0;
        for lane in [&mut self.high, &mut self.medium, &mut self.low] {
            let before = lane.len();
            lane.retain(|task| task.agent != agent);
            removed += before - lane.len();
        }
        self.metrics.purged += removed as u64;
        removed
    }

    /// Whether `agent` already has a task of `kind` queued.
    #[must_use]
    pub fn has_pending(&self, agent: AgentId, kind: TaskKind) -> bool {
        self.lane_ref(kind.lane())
            .iter()
            .any(|task| task.agent == agent && task.kind == kind)
    }

    /// Number of distinct agents with at least one queued task.
    #[must_use]
    pub fn distinct_agents(&self) -> usize {
        let mut agents: Vec<u64> = self
            .high
            .iter()
            .chain(self.medium.iter())
            .chain(self.low.iter())
            .map(|task| task.agent.data().as_ffi())
            .collect();
        agents.sort_unstable();
        agents.dedup();
        agents.len()
    }

    /// Total queued tasks across all lanes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    /// Whether all lanes are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued tasks in one lane.
    #[must_use]
    pub fn lane_len(&self, lane: Lane) -> usize {
        self.lane_ref(lane).len()
    }

    /// Counters accumulated since construction.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        self.metrics
    }

    /// Discard all queued tasks, keeping counters and the id sequence.
    pub fn clear(&mut self) {
        self.high.clear();
        self.medium.clear();
        self.low.clear();
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<AITask> {
        match lane {
            Lane::High => &mut self.high,
            Lane::Medium => &mut self.medium,
            Lane::Low => &mut self.low,
        }
    }

    fn lane_ref(&self, lane: Lane) -> &VecDeque<AITask> {
        match lane {
            Lane::High => &self.high,
            Lane::Medium => &self.medium,
            Lane::Low => &self.low,
        }
    }
}

/// Intra-lane priority for an agent's task.
///
/// Base falls off with distance to the player; a pending transmission that
/// mentions the player boosts tenfold, and an agitated state (pursuing or
/// fleeing) boosts fivefold. Boosts stack.
#[must_use]
pub fn compute_priority(dist_to_player: f32, mentions_player: bool, state: BehaviorState) -> f32 {
    let mut priority = 1.0 / (1.0 + 0.01 * dist_to_player.max(0.0));
    if mentions_player {
        priority *= 10.0;
    }
    if matches!(state, BehaviorState::Pursuing | BehaviorState::Fleeing) {
        priority *= 5.0;
    }
    priority
}

/// A state or kinematic effect decoded from a backend response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEffect {
    /// Transition the agent's behavior state.
    SetState(BehaviorState),
    /// Apply a velocity impulse relative to the player.
    Impulse {
        /// Push away from the player rather than toward them.
        away_from_player: bool,
        /// Impulse magnitude in world units per second.
        magnitude: f32,
    },
    /// Apply a bounded impulse in a direction drawn from the universe RNG.
    RandomImpulse {
        /// Upper bound on the impulse magnitude.
        max_magnitude: f32,
    },
    /// Queue a short greeting transmission to the player.
    QueueGreeting,
    /// Remember the raw response as the agent's last outbound message.
    StoreReply(String),
}

/// Decode a backend response into store effects.
///
/// Matching is lowercase substring matching; free text that matches nothing
/// still yields a [`ResponseEffect::StoreReply`] so the agent remembers what
/// it said. An empty response yields nothing.
#[must_use]
pub fn interpret_response(kind: TaskKind, response: &str) -> Vec<ResponseEffect> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let lower = trimmed.to_lowercase();
    let mut effects = vec![ResponseEffect::StoreReply(trimmed.to_owned())];
    match kind {
        TaskKind::Behavior => {
            if lower.contains("patrol") {
                effects.push(ResponseEffect::SetState(BehaviorState::Patrolling));
            } else if lower.contains("idle") {
                effects.push(ResponseEffect::SetState(BehaviorState::Idle));
            }
        }
        TaskKind::Combat => {
            if lower.contains("engage") {
                effects.push(ResponseEffect::SetState(BehaviorState::Pursuing));
            } else if lower.contains("evade") {
                effects.push(ResponseEffect::SetState(BehaviorState::Fleeing));
                effects.push(ResponseEffect::Impulse {
                    away_from_player: true,
                    magnitude: 20.0,
                });
            }
            // "hold" keeps the current state.
        }
        TaskKind::Navigation => {
            if lower.contains("move") || lower.contains("approach") || lower.contains("waypoint") {
                effects.push(ResponseEffect::SetState(BehaviorState::Patrolling));
                effects.push(ResponseEffect::RandomImpulse {
                    max_magnitude: 10.0,
                });
            }
        }
        TaskKind::Trade => {
            if lower.contains("trade") || lower.contains("dock") || lower.contains("sell") {
                effects.push(ResponseEffect::SetState(BehaviorState::Trading));
            }
        }
        TaskKind::Reaction => {
            if lower.contains("turn_to_face_player") {
                effects.push(ResponseEffect::SetState(BehaviorState::InDialog));
            } else if lower.contains("send_greeting") {
                effects.push(ResponseEffect::SetState(BehaviorState::InDialog));
                effects.push(ResponseEffect::QueueGreeting);
            } else if lower.contains("move_away_cautiously") {
                effects.push(ResponseEffect::SetState(BehaviorState::Fleeing));
                effects.push(ResponseEffect::Impulse {
                    away_from_player: true,
                    magnitude: 10.0,
                });
            }
            // "ignore_player" and unmatched text change nothing.
        }
        TaskKind::Dialog | TaskKind::Social | TaskKind::Creative => {}
    }
    effects
}

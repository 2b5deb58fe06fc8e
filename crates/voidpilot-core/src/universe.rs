//! The universe tick loop.
//!
//! A [`Universe`] owns the agent store, the spatial index, the inference
//! backend, the task scheduler, and at most one dialog session, and advances
//! them together through a staged `update`. Everything is single-threaded
//! and cooperative: one generation runs at a time, and all mutation happens
//! between ticks from the caller's point of view.
//!
//! Stage order within one tick:
//!
//! 1. kinematics and resources (skipped entirely when `dt == 0`)
//! 2. index rebuild and collisions
//! 3. player distances and LOD periods, from settled positions
//! 4. message delivery
//! 5. scheduling (eligibility scan into the lanes)
//! 6. dispatch (up to the per-tick budget)
//! 7. dialog typewriter

use crate::context::{AIContext, AgentView, ContextBuilder, NeighborSummary};
use crate::dialog::DialogSession;
use crate::scheduler::{
    ResponseEffect, SchedulerMetrics, TaskKind, TaskScheduler, compute_priority,
    interpret_response,
};
use crate::{
    AgentData, AgentId, AgentKind, AgentMap, AgentRuntime, AgentArena, BehaviorState,
    CONTACT_EPSILON, K_NEIGHBORS, UniverseConfig, UniverseError, Vec3,
};
use ordered_float::OrderedFloat;
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};
use voidpilot_index::{NeighborhoodIndex, UniformSectorGrid};
use voidpilot_infer::{InferenceBackend, InferenceTelemetry, StreamEvent};

/// Canned transmission sent by a `QueueGreeting` effect.
const GREETING_LINE: &str = "Greetings, traveler.";

/// Velocity impulse applied by an evasive or cautious maneuver is capped so
/// a single response cannot fling an agent across sectors.
const MAX_IMPULSE: f32 = 50.0;

/// Notification emitted by the universe as it mutates.
#[derive(Debug, Clone, PartialEq)]
pub enum UniverseEvent {
    Spawned {
        agent: AgentId,
        kind: AgentKind,
    },
    Removed {
        agent: AgentId,
        kind: AgentKind,
    },
    StateChanged {
        agent: AgentId,
        from: BehaviorState,
        to: BehaviorState,
    },
    Collision {
        a: AgentId,
        b: AgentId,
        depth: f32,
    },
    MessageDelivered {
        from: Option<AgentId>,
        to: AgentId,
    },
    TaskDispatched {
        agent: AgentId,
        kind: TaskKind,
        task_id: u64,
    },
    TaskFailed {
        agent: AgentId,
        kind: TaskKind,
    },
    /// A popped task whose agent no longer exists.
    TaskDropped {
        agent: AgentId,
        kind: TaskKind,
    },
    GreetingSent {
        agent: AgentId,
    },
    DialogStarted {
        agent: AgentId,
    },
    /// A dialog response finished revealing and was committed to history.
    DialogLineReady {
        agent: AgentId,
        text: String,
    },
    DialogEnded {
        agent: AgentId,
    },
}

/// Receives universe events and per-tick summaries.
///
/// The core never writes to stdout or any file itself; hosts observe the
/// simulation exclusively through their sink.
pub trait UniverseEventSink {
    /// Called for every event, in emission order, with the current tick.
    fn on_event(&mut self, tick: u64, event: &UniverseEvent);

    /// Called once at the end of every completed tick.
    fn on_tick(&mut self, summary: &TickSummary) {
        let _ = summary;
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl UniverseEventSink for NullEventSink {
    fn on_event(&mut self, _tick: u64, _event: &UniverseEvent) {}
}

/// Compact per-tick record kept in the in-memory history ring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TickSummary {
    pub tick: u64,
    pub sim_time: f64,
    pub agents: usize,
    /// Tasks handed to the backend this tick.
    pub dispatched: usize,
    /// Tasks still queued across all lanes at tick end.
    pub queued: usize,
    /// Contacts detected this tick.
    pub collisions: usize,
    /// Messages delivered this tick.
    pub messages: usize,
}

/// Aggregate counters sampled on demand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UniverseStats {
    pub tick: u64,
    pub sim_time: f64,
    pub agents: usize,
    /// Agents not in the `Dead` state.
    pub active: usize,
    /// Distinct agents with at least one queued AI task.
    pub with_active_ai: usize,
    pub queued_tasks: usize,
    /// Lifetime average dispatch rate, in tasks per second of sim time.
    pub tasks_per_s: f64,
    pub scheduler: SchedulerMetrics,
    pub inference: InferenceTelemetry,
    pub dialog_active: bool,
}

/// One queued transmission. `from: None` means the player.
#[derive(Debug, Clone)]
struct Message {
    from: Option<AgentId>,
    to: AgentId,
    text: String,
}

struct Contact {
    i: usize,
    j: usize,
    normal: Vec3,
    depth: f32,
    inv_mass_i: f32,
    inv_mass_j: f32,
    report_only: bool,
}

/// A populated universe of AI-driven agents.
pub struct Universe {
    config: UniverseConfig,
    rng: SmallRng,
    arena: AgentArena,
    runtime: AgentMap<AgentRuntime>,
    index: UniformSectorGrid,
    backend: Box<dyn InferenceBackend>,
    telemetry: InferenceTelemetry,
    scheduler: TaskScheduler,
    context_builder: ContextBuilder,
    dialog: Option<DialogSession>,
    pending_messages: VecDeque<Message>,
    player_pos: Vec3,
    sink: Box<dyn UniverseEventSink>,
    history: VecDeque<TickSummary>,
    scratch_positions: Vec<[f32; 3]>,
    sim_time: f64,
    tick: u64,
    paused: bool,
}

impl fmt::Debug for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universe")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("sim_time", &self.sim_time)
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl Universe {
    /// Build a universe over `backend`, initialising it against the
    /// configured model unless it already reports ready.
    pub fn new(
        config: UniverseConfig,
        mut backend: Box<dyn InferenceBackend>,
    ) -> Result<Self, UniverseError> {
        config.validate()?;
        if !backend.is_ready() {
            backend
                .init(&config.model_path, config.max_context)
                .map_err(UniverseError::BackendLoadFailed)?;
        }
        let rng = config.seeded_rng();
        let index = UniformSectorGrid::new(config.sector_size, config.sectors_per_axis);
        let context_builder = ContextBuilder::new(config.context_budget);
        info!(
            max_agents = config.max_agents,
            max_context = config.max_context,
            "universe initialised"
        );
        Ok(Self {
            rng,
            arena: AgentArena::new(),
            runtime: AgentMap::new(),
            index,
            backend,
            telemetry: InferenceTelemetry::default(),
            scheduler: TaskScheduler::new(),
            context_builder,
            dialog: None,
            pending_messages: VecDeque::new(),
            player_pos: Vec3::ZERO,
            sink: Box::new(NullEventSink),
            history: VecDeque::with_capacity(config.history_capacity),
            scratch_positions: Vec::new(),
            sim_time: 0.0,
            tick: 0,
            paused: false,
            config,
        })
    }

    /// Replace the event sink. The previous sink is dropped.
    pub fn set_event_sink(&mut self, sink: Box<dyn UniverseEventSink>) {
        self.sink = sink;
    }

    /// Static configuration this universe was built with.
    #[must_use]
    pub fn config(&self) -> &UniverseConfig {
        &self.config
    }

    /// Current simulation time in seconds.
    #[must_use]
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// Completed tick count.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.arena.len()
    }

    /// Whether `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.arena.contains(id)
    }

    /// Borrow the agent store.
    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.arena
    }

    /// Mutably borrow the agent store.
    #[must_use]
    pub fn agents_mut(&mut self) -> &mut AgentArena {
        &mut self.arena
    }

    /// Cold data for `id`, if alive.
    #[must_use]
    pub fn runtime(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.runtime.get(id)
    }

    /// Mutable cold data for `id`, if alive.
    #[must_use]
    pub fn runtime_mut(&mut self, id: AgentId) -> Option<&mut AgentRuntime> {
        self.runtime.get_mut(id)
    }

    /// Mutably borrow the inference backend.
    #[must_use]
    pub fn backend_mut(&mut self) -> &mut dyn InferenceBackend {
        self.backend.as_mut()
    }

    /// Recent tick summaries, oldest first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<TickSummary> {
        &self.history
    }

    /// The active dialog session, if any.
    #[must_use]
    pub fn dialog(&self) -> Option<&DialogSession> {
        self.dialog.as_ref()
    }

    /// Pause or resume the simulation. While paused, `update` is a no-op.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Whether the simulation is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Aggregate counters for dashboards and tests.
    #[must_use]
    pub fn stats(&self) -> UniverseStats {
        let active = self
            .arena
            .columns()
            .states()
            .iter()
            .filter(|&&state| state != BehaviorState::Dead)
            .count();
        let tasks_per_s = if self.sim_time > 0.0 {
            self.scheduler.metrics().dispatched as f64 / self.sim_time
        } else {
            0.0
        };
        UniverseStats {
            tick: self.tick,
            sim_time: self.sim_time,
            agents: self.arena.len(),
            active,
            with_active_ai: self.scheduler.distinct_agents(),
            queued_tasks: self.scheduler.len(),
            tasks_per_s,
            scheduler: self.scheduler.metrics(),
            inference: self.telemetry,
            dialog_active: self.dialog.is_some(),
        }
    }

    /// Shut the backend down and drop all queued work. Agents survive; a
    /// later backend swap could resume them.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.dialog.take() {
            let agent = session.agent();
            self.restore_from_dialog(agent);
            self.emit(UniverseEvent::DialogEnded { agent });
        }
        self.scheduler.clear();
        self.pending_messages.clear();
        self.backend.shutdown();
        info!(tick = self.tick, "universe shut down");
    }

    /// Spawn an agent with kind-default runtime data.
    pub fn spawn(&mut self, data: AgentData) -> Result<AgentId, UniverseError> {
        if self.arena.len() >= self.config.max_agents {
            return Err(UniverseError::UniverseFull(self.config.max_agents));
        }
        let id = self.arena.insert(data);
        self.runtime.insert(id, AgentRuntime::for_kind(data.kind));
        self.emit(UniverseEvent::Spawned {
            agent: id,
            kind: data.kind,
        });
        Ok(id)
    }

    /// Spawn a named agent, optionally with a character sheet.
    pub fn spawn_named(
        &mut self,
        data: AgentData,
        name: impl Into<String>,
        personality: Option<crate::Personality>,
    ) -> Result<AgentId, UniverseError> {
        let id = self.spawn(data)?;
        if let Some(rt) = self.runtime.get_mut(id) {
            rt.name = Some(name.into());
            rt.personality = personality.map(|mut p| {
                p.clamp_traits();
                p
            });
        }
        Ok(id)
    }

    /// Spawn an agent at a seeded-random position inside the cube of the
    /// given half extent, with a small random drift velocity.
    pub fn spawn_drifting(
        &mut self,
        kind: AgentKind,
        half_extent: f32,
    ) -> Result<AgentId, UniverseError> {
        let e = half_extent.abs().max(1.0);
        let position = Vec3::new(
            self.rng.random_range(-e..e),
            self.rng.random_range(-e * 0.1..e * 0.1),
            self.rng.random_range(-e..e),
        );
        let velocity = Vec3::new(
            self.rng.random_range(-0.5..0.5),
            0.0,
            self.rng.random_range(-0.5..0.5),
        );
        let mut data = AgentData::spawned(kind, position);
        data.velocity = velocity;
        self.spawn(data)
    }

    /// Remove `id`, returning its final scalar data. Queued tasks for the
    /// agent are purged and an active dialog with it is ended.
    pub fn remove(&mut self, id: AgentId) -> Result<AgentData, UniverseError> {
        let data = self.arena.remove(id).ok_or(UniverseError::InvalidAgent)?;
        self.runtime.remove(id);
        self.scheduler.purge_agent(id);
        if self.dialog.as_ref().is_some_and(|s| s.agent() == id) {
            self.dialog = None;
            self.emit(UniverseEvent::DialogEnded { agent: id });
        }
        self.emit(UniverseEvent::Removed {
            agent: id,
            kind: data.kind,
        });
        Ok(data)
    }

    /// Update the player position used for distances, LOD, and gating.
    pub fn set_player_position(&mut self, position: Vec3) {
        self.player_pos = position;
    }

    /// Current player position.
    #[must_use]
    pub fn player_position(&self) -> Vec3 {
        self.player_pos
    }

    /// Live agents within `radius` of `id`, nearest first, excluding `id`.
    pub fn neighbors(
        &mut self,
        id: AgentId,
        radius: f32,
    ) -> Result<Vec<(AgentId, f32)>, UniverseError> {
        let index = self.arena.index_of(id).ok_or(UniverseError::InvalidAgent)?;
        self.refresh_index()?;
        let origin = self.arena.columns().positions()[index];
        let mut found: Vec<(OrderedFloat<f32>, usize)> = Vec::new();
        self.index
            .visit_within(origin.to_array(), radius, &mut |j, dist| {
                if j != index {
                    found.push((dist, j));
                }
            });
        found.sort_unstable();
        Ok(found
            .into_iter()
            .filter_map(|(dist, j)| Some((self.arena.handle_at(j)?, dist.into_inner())))
            .collect())
    }

    /// Queue a transmission from the player to `to`. Delivered on the next
    /// tick; a player message makes the recipient eligible for a dialog
    /// reply task.
    pub fn send_message(&mut self, to: AgentId, text: impl Into<String>) -> Result<(), UniverseError> {
        if !self.arena.contains(to) {
            return Err(UniverseError::InvalidAgent);
        }
        self.pending_messages.push_back(Message {
            from: None,
            to,
            text: text.into(),
        });
        Ok(())
    }

    /// Queue a transmission from one agent to another.
    pub fn send_agent_message(
        &mut self,
        from: AgentId,
        to: AgentId,
        text: impl Into<String>,
    ) -> Result<(), UniverseError> {
        if !self.arena.contains(from) || !self.arena.contains(to) {
            return Err(UniverseError::InvalidAgent);
        }
        self.pending_messages.push_back(Message {
            from: Some(from),
            to,
            text: text.into(),
        });
        Ok(())
    }

    /// Queue a player broadcast to every agent within `range` of `origin`.
    /// All recipients get the text; only AI-driven ones may auto-reply.
    /// Returns how many transmissions were queued.
    pub fn broadcast(&mut self, origin: Vec3, range: f32, text: &str) -> usize {
        let mut queued = 0;
        let targets: Vec<AgentId> = {
            let cols = self.arena.columns();
            (0..cols.len())
                .filter(|&i| cols.positions()[i].distance(origin) <= range)
                .filter_map(|i| self.arena.handle_at(i))
                .collect()
        };
        for to in targets {
            self.pending_messages.push_back(Message {
                from: None,
                to,
                text: text.to_string(),
            });
            queued += 1;
        }
        queued
    }

    /// Open a dialog session with `agent`. Only one session can be active.
    pub fn dialog_start(&mut self, agent: AgentId) -> Result<(), UniverseError> {
        if self.dialog.is_some() {
            return Err(UniverseError::InvalidState("a dialog is already active"));
        }
        let index = self
            .arena
            .index_of(agent)
            .ok_or(UniverseError::InvalidAgent)?;
        let kind = self.arena.columns().kinds()[index];
        if !kind.is_schedulable() {
            return Err(UniverseError::InvalidState("agent cannot hold a dialog"));
        }
        if self.arena.columns().states()[index] == BehaviorState::Dead {
            return Err(UniverseError::InvalidState("agent is dead"));
        }
        self.set_state(agent, BehaviorState::InDialog);
        let name = self.display_name(agent);
        self.dialog = Some(DialogSession::new(agent, name));
        self.emit(UniverseEvent::DialogStarted { agent });
        Ok(())
    }

    /// Send a player line into the active dialog. The line is delivered
    /// immediately and a high-lane dialog task is queued for the partner,
    /// who re-enters `InDialog` until the reply finishes revealing.
    pub fn dialog_say(&mut self, text: impl Into<String>) -> Result<u64, UniverseError> {
        let agent = self
            .dialog
            .as_ref()
            .map(DialogSession::agent)
            .ok_or(UniverseError::InvalidState("no active dialog"))?;
        let text = text.into();
        if let Some(rt) = self.runtime.get_mut(agent) {
            rt.last_msg_in = Some(text.clone());
        }
        if let Some(session) = self.dialog.as_mut() {
            session.push_player_line(text);
        }
        self.set_state(agent, BehaviorState::InDialog);
        self.emit(UniverseEvent::MessageDelivered {
            from: None,
            to: agent,
        });
        self.refresh_index()?;
        let context = self
            .build_context(agent, TaskKind::Dialog)
            .ok_or(UniverseError::InvalidAgent)?;
        let dist = context.position.distance(self.player_pos);
        let priority = compute_priority(dist, true, BehaviorState::InDialog);
        Ok(self
            .scheduler
            .submit(agent, TaskKind::Dialog, context, priority, self.sim_time))
    }

    /// Close the active dialog, restoring the partner's state.
    pub fn dialog_end(&mut self) -> Result<(), UniverseError> {
        let session = self
            .dialog
            .take()
            .ok_or(UniverseError::InvalidState("no active dialog"))?;
        let agent = session.agent();
        self.restore_from_dialog(agent);
        self.emit(UniverseEvent::DialogEnded { agent });
        Ok(())
    }

    /// Queue an AI task of `kind` for `agent` at the caller's request,
    /// subject to the same distance gate as periodic scheduling.
    pub fn submit_task(&mut self, agent: AgentId, kind: TaskKind) -> Result<u64, UniverseError> {
        let index = self
            .arena
            .index_of(agent)
            .ok_or(UniverseError::InvalidAgent)?;
        if !self.arena.columns().kinds()[index].is_schedulable() {
            return Err(UniverseError::InvalidState("agent is not AI-driven"));
        }
        let dist = self.arena.columns().positions()[index].distance(self.player_pos);
        if !kind.admitted_at(dist) {
            self.scheduler.note_rejected();
            return Err(UniverseError::InvalidState(
                "agent is outside the range gate for this task kind",
            ));
        }
        if self.scheduler.has_pending(agent, kind) {
            return Err(UniverseError::InvalidState(
                "a task of this kind is already queued for the agent",
            ));
        }
        self.refresh_index()?;
        let context = self
            .build_context(agent, kind)
            .ok_or(UniverseError::InvalidAgent)?;
        let state = self.arena.columns().states()[index];
        let mentions = self.mentions_player(agent);
        let priority = compute_priority(dist, mentions, state);
        Ok(self
            .scheduler
            .submit(agent, kind, context, priority, self.sim_time))
    }

    /// Advance the universe by `dt` seconds of simulated time.
    ///
    /// `dt == 0` performs scheduling, dispatch, and message delivery but
    /// leaves kinematics, resources, and collisions untouched, so a
    /// zero-length tick never moves the world.
    pub fn update(&mut self, dt: f32) -> Result<TickSummary, UniverseError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(UniverseError::InvalidState(
                "dt must be finite and non-negative",
            ));
        }
        if self.paused {
            return Ok(self.summary(0, 0, 0));
        }
        self.tick += 1;
        self.sim_time += f64::from(dt);

        if dt > 0.0 {
            self.arena
                .columns_mut()
                .integrate_kinematics(dt, self.config.damping);
            self.arena.columns_mut().settle_resources(
                dt,
                self.config.fuel_burn_threshold,
                self.config.fuel_burn_rate,
                self.config.energy_regen_rate,
            );
        }
        self.refresh_index()?;
        let collisions = if dt > 0.0 { self.stage_collisions() } else { 0 };
        self.stage_lod();
        let messages = self.stage_messages();
        self.stage_schedule();
        let dispatched = self.stage_dispatch();
        self.stage_dialog(dt);

        let summary = self.summary(dispatched, collisions, messages);
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.sink.on_tick(&summary);
        Ok(summary)
    }

    fn summary(&self, dispatched: usize, collisions: usize, messages: usize) -> TickSummary {
        TickSummary {
            tick: self.tick,
            sim_time: self.sim_time,
            agents: self.arena.len(),
            dispatched,
            queued: self.scheduler.len(),
            collisions,
            messages,
        }
    }

    fn emit(&mut self, event: UniverseEvent) {
        self.sink.on_event(self.tick, &event);
    }

    fn display_name(&self, agent: AgentId) -> String {
        self.runtime
            .get(agent)
            .and_then(|rt| rt.name.clone())
            .or_else(|| {
                self.arena
                    .index_of(agent)
                    .map(|i| self.arena.columns().kinds()[i].role().to_string())
            })
            .unwrap_or_else(|| String::from("unknown"))
    }

    fn mentions_player(&self, agent: AgentId) -> bool {
        self.runtime
            .get(agent)
            .and_then(|rt| rt.last_msg_in.as_deref())
            .is_some_and(|text| text.to_lowercase().contains("player"))
    }

    fn set_state(&mut self, agent: AgentId, to: BehaviorState) {
        let Some(index) = self.arena.index_of(agent) else {
            return;
        };
        let from = self.arena.columns().states()[index];
        if from == to || from == BehaviorState::Dead {
            return;
        }
        self.arena.columns_mut().states_mut()[index] = to;
        self.emit(UniverseEvent::StateChanged { agent, from, to });
    }

    fn restore_from_dialog(&mut self, agent: AgentId) {
        if let Some(index) = self.arena.index_of(agent) {
            if self.arena.columns().states()[index] == BehaviorState::InDialog {
                self.set_state(agent, BehaviorState::Idle);
            }
        }
    }

    fn refresh_index(&mut self) -> Result<(), UniverseError> {
        self.scratch_positions.clear();
        self.scratch_positions.extend(
            self.arena
                .columns()
                .positions()
                .iter()
                .map(|p| p.to_array()),
        );
        self.index
            .rebuild(&self.scratch_positions)
            .map_err(|_| UniverseError::InvalidConfig("spatial grid rejected its configuration"))
    }

    /// Refresh cached player distances and LOD periods from positions
    /// settled by this tick's kinematics and collision resolution.
    fn stage_lod(&mut self) {
        let player = self.player_pos;
        let cols = self.arena.columns_mut();
        for i in 0..cols.len() {
            let dist = cols.positions()[i].distance(player);
            cols.player_distances_mut()[i] = dist;
            let kind = cols.kinds()[i];
            let period = lod_period(dist, kind);
            cols.ai_periods_mut()[i] = period;
        }
    }

    fn stage_collisions(&mut self) -> usize {
        let n = self.arena.len();
        if n < 2 {
            return 0;
        }
        let colliders: Vec<crate::Collider> = (0..n)
            .map(|i| {
                self.arena
                    .handle_at(i)
                    .and_then(|id| self.runtime.get(id))
                    .map_or_else(crate::Collider::default, |rt| rt.collider)
            })
            .collect();
        let max_radius = colliders
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.radius)
            .fold(0.0_f32, f32::max);
        let max_checks = self.config.max_collision_checks;

        let mut contacts: Vec<Contact> = Vec::new();
        {
            let cols = self.arena.columns();
            for i in 0..n {
                let ci = colliders[i];
                if !ci.enabled {
                    continue;
                }
                let pos_i = cols.positions()[i];
                let mut checked = 0usize;
                self.index.visit_within(
                    pos_i.to_array(),
                    ci.radius + max_radius,
                    &mut |j, dist| {
                        if j <= i || checked >= max_checks {
                            return;
                        }
                        let cj = colliders[j];
                        if !cj.enabled {
                            return;
                        }
                        checked += 1;
                        let depth = ci.radius + cj.radius - dist.into_inner();
                        if depth <= CONTACT_EPSILON {
                            return;
                        }
                        let normal = (cols.positions()[j] - pos_i)
                            .normalize_or(Vec3::new(1.0, 0.0, 0.0));
                        contacts.push(Contact {
                            i,
                            j,
                            normal,
                            depth,
                            inv_mass_i: 1.0 / ci.mass.max(1.0),
                            inv_mass_j: 1.0 / cj.mass.max(1.0),
                            report_only: !(ci.solid && cj.solid) || ci.sensor || cj.sensor,
                        });
                    },
                );
            }
        }

        let mut events: Vec<UniverseEvent> = Vec::with_capacity(contacts.len());
        let mut resolved = vec![false; n];
        for contact in &contacts {
            let (Some(a), Some(b)) = (
                self.arena.handle_at(contact.i),
                self.arena.handle_at(contact.j),
            ) else {
                continue;
            };
            events.push(UniverseEvent::Collision {
                a,
                b,
                depth: contact.depth,
            });
            if contact.report_only {
                continue;
            }
            // At most one resolution per agent per tick; the rest of its
            // contacts are report-only until the next pass.
            if resolved[contact.i] || resolved[contact.j] {
                continue;
            }
            resolved[contact.i] = true;
            resolved[contact.j] = true;
            let w_sum = contact.inv_mass_i + contact.inv_mass_j;
            if w_sum <= 0.0 {
                continue;
            }
            // Positional separation, weighted by inverse mass.
            let push_i = contact.normal * (-contact.depth * contact.inv_mass_i / w_sum);
            let push_j = contact.normal * (contact.depth * contact.inv_mass_j / w_sum);
            {
                let positions = self.arena.columns_mut().positions_mut();
                positions[contact.i] += push_i;
                positions[contact.j] += push_j;
            }
            // Kill the approaching component of relative velocity.
            let rel = {
                let velocities = self.arena.columns().velocities();
                (velocities[contact.j] - velocities[contact.i]).dot(contact.normal)
            };
            if rel < 0.0 {
                let impulse = -rel / w_sum;
                let velocities = self.arena.columns_mut().velocities_mut();
                velocities[contact.i] += contact.normal * (-impulse * contact.inv_mass_i);
                velocities[contact.j] += contact.normal * (impulse * contact.inv_mass_j);
            }
        }
        let count = events.len();
        for event in events {
            self.emit(event);
        }
        count
    }

    fn stage_messages(&mut self) -> usize {
        let mut queue = std::mem::take(&mut self.pending_messages);
        let mut delivered = 0;
        for message in queue.drain(..) {
            if self.deliver(message) {
                delivered += 1;
            }
        }
        delivered
    }

    fn deliver(&mut self, message: Message) -> bool {
        let Some(index) = self.arena.index_of(message.to) else {
            debug!("transmission dropped: recipient no longer exists");
            return false;
        };
        if let Some(rt) = self.runtime.get_mut(message.to) {
            rt.last_msg_in = Some(message.text.clone());
        }
        if let Some(sender) = message.from {
            if let Some(rt) = self.runtime.get_mut(sender) {
                rt.last_msg_out = Some(message.text.clone());
            }
        }
        self.emit(UniverseEvent::MessageDelivered {
            from: message.from,
            to: message.to,
        });
        // Every delivered transmission to an AI-driven recipient gets at
        // most one reply task. Dialog is never distance-gated.
        let schedulable = self.arena.columns().kinds()[index].is_schedulable();
        if schedulable && !self.scheduler.has_pending(message.to, TaskKind::Dialog) {
            if message.from.is_none() {
                let mut in_session = false;
                if let Some(session) = self
                    .dialog
                    .as_mut()
                    .filter(|s| s.agent() == message.to)
                {
                    session.push_player_line(message.text.clone());
                    in_session = true;
                }
                if in_session {
                    self.set_state(message.to, BehaviorState::InDialog);
                }
            }
            if let Some(context) = self.build_context(message.to, TaskKind::Dialog) {
                let dist = context.position.distance(self.player_pos);
                let state = self.arena.columns().states()[index];
                let mentions = message.from.is_none() || self.mentions_player(message.to);
                let priority = compute_priority(dist, mentions, state);
                self.scheduler
                    .submit(message.to, TaskKind::Dialog, context, priority, self.sim_time);
            }
        }
        true
    }

    fn stage_schedule(&mut self) {
        struct Candidate {
            agent: AgentId,
            index: usize,
            kind: TaskKind,
            state: BehaviorState,
            dist: f32,
        }
        let mut candidates: Vec<Candidate> = Vec::new();
        {
            // InDialog suspends periodic work only for the session partner;
            // an agent that entered the state on its own (a hailing
            // reaction) stays schedulable so it is not stranded.
            let partner = self.dialog.as_ref().map(DialogSession::agent);
            let cols = self.arena.columns();
            for i in 0..cols.len() {
                let kind = cols.kinds()[i];
                if !kind.is_schedulable() {
                    continue;
                }
                let state = cols.states()[i];
                if state == BehaviorState::Dead {
                    continue;
                }
                let period = f64::from(cols.ai_periods()[i]);
                if self.sim_time - cols.last_ai_times()[i] < period {
                    continue;
                }
                let Some(agent) = self.arena.handle_at(i) else {
                    continue;
                };
                if state == BehaviorState::InDialog && partner == Some(agent) {
                    continue;
                }
                let dist = cols.player_distances()[i];
                candidates.push(Candidate {
                    agent,
                    index: i,
                    kind: periodic_task_kind(kind, state, dist),
                    state,
                    dist,
                });
            }
        }
        for candidate in candidates {
            // The agent spent its turn whether or not the gate admits it;
            // this keeps far agents from being re-examined every tick.
            self.arena.columns_mut().last_ai_times_mut()[candidate.index] = self.sim_time;
            if !candidate.kind.admitted_at(candidate.dist) {
                self.scheduler.note_rejected();
                continue;
            }
            if self.scheduler.has_pending(candidate.agent, candidate.kind) {
                continue;
            }
            let Some(context) = self.build_context(candidate.agent, candidate.kind) else {
                continue;
            };
            let mentions = self.mentions_player(candidate.agent);
            let priority = compute_priority(candidate.dist, mentions, candidate.state);
            self.scheduler.submit(
                candidate.agent,
                candidate.kind,
                context,
                priority,
                self.sim_time,
            );
        }
    }

    fn stage_dispatch(&mut self) -> usize {
        if !self.backend.is_ready() {
            return 0;
        }
        let budget = self.config.max_concurrent_tasks;
        let mut dispatched = 0;
        while dispatched < budget {
            let Some(task) = self.scheduler.pop_next() else {
                break;
            };
            if !self.arena.contains(task.agent) {
                self.emit(UniverseEvent::TaskDropped {
                    agent: task.agent,
                    kind: task.kind,
                });
                continue;
            }
            self.emit(UniverseEvent::TaskDispatched {
                agent: task.agent,
                kind: task.kind,
                task_id: task.id,
            });
            self.run_task(&task);
            dispatched += 1;
        }
        dispatched
    }

    fn run_task(&mut self, task: &crate::scheduler::AITask) {
        let streaming = task.kind == TaskKind::Dialog
            && self.dialog.as_ref().is_some_and(|s| s.agent() == task.agent);
        if streaming {
            // Session is taken out of self so the stream callback can feed
            // it while the backend borrow is live.
            let Some(mut session) = self.dialog.take() else {
                return;
            };
            let result = self.backend.generate_stream(
                &task.context.prompt,
                task.context.token_limit,
                &mut |event| match event {
                    StreamEvent::Token(token) => session.on_token(&token),
                    StreamEvent::Done => session.on_complete(),
                },
            );
            match result {
                Ok(()) => {
                    self.telemetry.record_call(self.backend.last_inference_time());
                }
                Err(err) => {
                    warn!(%err, "dialog generation failed");
                    session.abort_response();
                    self.telemetry.record_failure();
                    self.scheduler.note_failed();
                    self.emit(UniverseEvent::TaskFailed {
                        agent: task.agent,
                        kind: task.kind,
                    });
                    // A failed reply leaves the partner idle; the session
                    // stays open and dialog_say re-enters the state.
                    self.restore_from_dialog(task.agent);
                }
            }
            self.dialog = Some(session);
            return;
        }

        match self
            .backend
            .generate(&task.context.prompt, task.context.token_limit)
        {
            Ok(response) => {
                self.telemetry.record_call(self.backend.last_inference_time());
                let effects = interpret_response(task.kind, &response);
                self.apply_effects(task.agent, effects);
            }
            Err(err) => {
                warn!(%err, kind = ?task.kind, "generation failed; agent state unchanged");
                self.telemetry.record_failure();
                self.scheduler.note_failed();
                self.emit(UniverseEvent::TaskFailed {
                    agent: task.agent,
                    kind: task.kind,
                });
            }
        }
    }

    fn apply_effects(&mut self, agent: AgentId, effects: Vec<ResponseEffect>) {
        for effect in effects {
            match effect {
                ResponseEffect::StoreReply(text) => {
                    if let Some(rt) = self.runtime.get_mut(agent) {
                        rt.last_msg_out = Some(text);
                    }
                }
                ResponseEffect::SetState(to) => self.set_state(agent, to),
                ResponseEffect::Impulse {
                    away_from_player,
                    magnitude,
                } => {
                    let Some(index) = self.arena.index_of(agent) else {
                        continue;
                    };
                    let magnitude = magnitude.clamp(0.0, MAX_IMPULSE);
                    if magnitude == 0.0 {
                        continue;
                    }
                    let pos = self.arena.columns().positions()[index];
                    let toward = (self.player_pos - pos).normalize_or(Vec3::new(1.0, 0.0, 0.0));
                    let dir = if away_from_player {
                        toward * -1.0
                    } else {
                        toward
                    };
                    self.arena.columns_mut().velocities_mut()[index] += dir * magnitude;
                }
                ResponseEffect::RandomImpulse { max_magnitude } => {
                    let Some(index) = self.arena.index_of(agent) else {
                        continue;
                    };
                    let max = max_magnitude.clamp(0.0, MAX_IMPULSE);
                    if max <= 0.0 {
                        continue;
                    }
                    let angle = self.rng.random_range(0.0..std::f32::consts::TAU);
                    let magnitude = self.rng.random_range(0.0..max);
                    let dir = Vec3::new(angle.cos(), 0.0, angle.sin());
                    self.arena.columns_mut().velocities_mut()[index] += dir * magnitude;
                }
                ResponseEffect::QueueGreeting => {
                    if let Some(rt) = self.runtime.get_mut(agent) {
                        rt.last_msg_out = Some(String::from(GREETING_LINE));
                    }
                    self.emit(UniverseEvent::GreetingSent { agent });
                }
            }
        }
    }

    fn stage_dialog(&mut self, dt: f32) {
        let mut ready: Option<(AgentId, String)> = None;
        if let Some(session) = self.dialog.as_mut() {
            let finished = session.update(dt, self.config.dialog_char_interval);
            if finished {
                if let Some(text) = session.take_response() {
                    ready = Some((session.agent(), text));
                }
            }
        }
        if let Some((agent, text)) = ready {
            if let Some(rt) = self.runtime.get_mut(agent) {
                rt.last_msg_out = Some(text.clone());
            }
            self.emit(UniverseEvent::DialogLineReady { agent, text });
            // The line is committed; the partner idles between turns even
            // while the session stays open.
            self.restore_from_dialog(agent);
        }
    }

    fn build_context(&self, agent: AgentId, kind: TaskKind) -> Option<AIContext> {
        let index = self.arena.index_of(agent)?;
        let rt = self.runtime.get(agent)?;
        let cols = self.arena.columns();
        let position = cols.positions()[index];
        let view = AgentView {
            id: agent,
            kind: cols.kinds()[index],
            name: rt.name.clone(),
            position,
            velocity: cols.velocities()[index],
            state: cols.states()[index],
            health: cols.healths()[index],
            energy: cols.energies()[index],
            fuel: cols.fuels()[index],
            dist_to_player: position.distance(self.player_pos),
            visual_range: rt.sensors.visual_range,
            personality: rt.personality.clone(),
            last_msg_in: rt.last_msg_in.clone(),
        };
        let neighbors = self.neighbor_summaries(index, position, rt.sensors.visual_range);
        Some(self.context_builder.build(&view, &neighbors, kind))
    }

    fn neighbor_summaries(
        &self,
        self_index: usize,
        origin: Vec3,
        range: f32,
    ) -> Vec<NeighborSummary> {
        let mut found: Vec<(OrderedFloat<f32>, usize)> = Vec::new();
        self.index
            .visit_within(origin.to_array(), range, &mut |j, dist| {
                if j != self_index {
                    found.push((dist, j));
                }
            });
        found.sort_unstable();
        found.truncate(K_NEIGHBORS);
        found
            .into_iter()
            .filter_map(|(_, j)| {
                let id = self.arena.handle_at(j)?;
                Some(NeighborSummary {
                    id,
                    name: self.display_name(id),
                    position: self.arena.columns().positions()[j],
                })
            })
            .collect()
    }
}

/// LOD band for the AI update period. Near-band fighters refresh fastest;
/// everything in the distant band idles at the long period.
fn lod_period(dist: f32, kind: AgentKind) -> f32 {
    let fighter = matches!(kind, AgentKind::Fighter);
    let period = if dist < 100.0 {
        if fighter { 1.0 } else { 2.0 }
    } else if dist < 500.0 {
        if fighter { 2.0 } else { 4.0 }
    } else if dist < 2000.0 {
        8.0
    } else {
        crate::AI_PERIOD_DISTANT
    };
    period.max(crate::AI_PERIOD_MIN)
}

/// Which task kind the periodic scheduler queues for an agent, from its
/// state first and its role second.
fn periodic_task_kind(kind: AgentKind, state: BehaviorState, dist: f32) -> TaskKind {
    match state {
        BehaviorState::Pursuing | BehaviorState::Fleeing => TaskKind::Combat,
        BehaviorState::Trading => TaskKind::Trade,
        BehaviorState::Exploring => TaskKind::Navigation,
        _ if dist < 100.0 => TaskKind::Reaction,
        _ => match kind {
            AgentKind::Trader => TaskKind::Trade,
            AgentKind::Explorer => TaskKind::Navigation,
            AgentKind::Station => TaskKind::Social,
            AgentKind::Civilian => TaskKind::Creative,
            _ => TaskKind::Behavior,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voidpilot_infer::ScriptedBackend;

    fn universe() -> Universe {
        let config = UniverseConfig {
            rng_seed: Some(7),
            ..UniverseConfig::default()
        };
        Universe::new(config, Box::new(ScriptedBackend::ready())).expect("universe")
    }

    #[test]
    fn backend_refusal_is_fatal_at_construction() {
        let mut backend = ScriptedBackend::new();
        backend.refuse_init();
        let err = Universe::new(UniverseConfig::default(), Box::new(backend)).unwrap_err();
        assert!(matches!(err, UniverseError::BackendLoadFailed(_)));
    }

    #[test]
    fn spawn_respects_capacity() {
        let config = UniverseConfig {
            max_agents: 2,
            rng_seed: Some(1),
            ..UniverseConfig::default()
        };
        let mut u = Universe::new(config, Box::new(ScriptedBackend::ready())).expect("universe");
        u.spawn(AgentData::default()).expect("first");
        u.spawn(AgentData::default()).expect("second");
        assert!(matches!(
            u.spawn(AgentData::default()),
            Err(UniverseError::UniverseFull(2))
        ));
    }

    #[test]
    fn lod_bands_follow_distance_and_kind() {
        assert_eq!(lod_period(50.0, AgentKind::Fighter), 1.0);
        assert_eq!(lod_period(50.0, AgentKind::Trader), 2.0);
        assert_eq!(lod_period(300.0, AgentKind::Fighter), 2.0);
        assert_eq!(lod_period(300.0, AgentKind::Station), 4.0);
        assert_eq!(lod_period(1500.0, AgentKind::Fighter), 8.0);
        assert_eq!(lod_period(5000.0, AgentKind::Civilian), crate::AI_PERIOD_DISTANT);
    }

    #[test]
    fn periodic_kind_prefers_state_over_role() {
        assert_eq!(
            periodic_task_kind(AgentKind::Trader, BehaviorState::Fleeing, 50.0),
            TaskKind::Combat
        );
        assert_eq!(
            periodic_task_kind(AgentKind::Fighter, BehaviorState::Idle, 50.0),
            TaskKind::Reaction
        );
        assert_eq!(
            periodic_task_kind(AgentKind::Trader, BehaviorState::Idle, 800.0),
            TaskKind::Trade
        );
    }

    #[test]
    fn update_rejects_bad_dt() {
        let mut u = universe();
        assert!(u.update(-1.0).is_err());
        assert!(u.update(f32::NAN).is_err());
    }

    #[test]
    fn paused_universe_does_not_advance() {
        let mut u = universe();
        u.spawn(AgentData::default()).expect("spawn");
        u.set_paused(true);
        let before = u.tick();
        u.update(0.1).expect("paused tick");
        assert_eq!(u.tick(), before);
        u.set_paused(false);
        u.update(0.1).expect("tick");
        assert_eq!(u.tick(), before + 1);
    }

    #[test]
    fn damping_slows_agents_each_tick() {
        let mut u = universe();
        let mut data = AgentData::spawned(AgentKind::Fighter, Vec3::new(3000.0, 0.0, 0.0));
        data.velocity = Vec3::new(10.0, 0.0, 0.0);
        let id = u.spawn(data).expect("spawn");
        u.update(0.1).expect("tick");
        let snap = u.agents().snapshot(id).expect("snapshot");
        assert!(snap.velocity.x < 10.0);
        assert!(snap.position.x > 3000.0);
    }

    #[test]
    fn greeting_effect_sets_outbound_message() {
        let mut u = universe();
        let id = u
            .spawn(AgentData::spawned(AgentKind::Fighter, Vec3::new(50.0, 0.0, 0.0)))
            .expect("spawn");
        u.apply_effects(id, vec![ResponseEffect::QueueGreeting]);
        assert_eq!(
            u.runtime(id).and_then(|rt| rt.last_msg_out.as_deref()),
            Some(GREETING_LINE)
        );
    }
}

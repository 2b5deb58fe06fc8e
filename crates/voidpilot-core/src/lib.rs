//! Core types shared across the Voidpilot workspace.
//!
//! Voidpilot simulates a populated universe of autonomous agents — pilots,
//! traders, explorers, stations — whose behaviour is driven by an LLM
//! inference backend under a strict per-tick budget. This crate owns the
//! entity store, the context builder, the task scheduler, the dialog
//! session, the message bus, and the universe tick loop that composes them.

pub mod context;
pub mod dialog;
pub mod scheduler;
pub mod universe;

pub use context::{AIContext, AgentView, ContextBuilder, NeighborSummary};
pub use dialog::{DialogLine, DialogSession, Speaker};
pub use scheduler::{
    AITask, Lane, ResponseEffect, SchedulerMetrics, TaskKind, TaskScheduler, compute_priority,
    interpret_response,
};
pub use universe::{
    NullEventSink, TickSummary, Universe, UniverseEvent, UniverseEventSink, UniverseStats,
};

use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::ops::{Add, AddAssign, Mul, Sub};
use thiserror::Error;
use voidpilot_infer::InferenceError;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Floor for the per-agent AI update period, in seconds.
pub const AI_PERIOD_MIN: f32 = 1.0;
/// Update period assigned to agents in the distant LOD band, in seconds.
pub const AI_PERIOD_DISTANT: f32 = 30.0;
/// Maximum neighbor references carried in a context snapshot.
pub const K_NEIGHBORS: usize = 10;
/// Neighbors summarized in the awareness block of a prompt.
pub const AWARENESS_NEIGHBORS: usize = 3;
/// Character budget for a built prompt.
pub const CTX_BUDGET: usize = 2048;
/// Collision candidates examined per agent per tick.
pub const C_MAX: usize = 8;
/// Sectors along each axis of the spatial grid.
pub const SECTORS_PER_AXIS: usize = 16;
/// Edge length of one sector, in world units.
pub const SECTOR_SIZE: f32 = 512.0;
/// Per-tick velocity damping factor (space friction).
pub const DAMPING: f32 = 0.99;
/// Dialog history ring capacity, in (speaker, line) pairs.
pub const DIALOG_HISTORY_LEN: usize = 10;
/// Typewriter reveal interval, in seconds per character.
pub const DIALOG_CHAR_INTERVAL: f32 = 0.05;
/// Penetration tolerance for collision resolution.
pub const CONTACT_EPSILON: f32 = 1e-3;

/// Sentinel meaning "never dispatched an AI task".
pub(crate) const LAST_AI_NEVER: f64 = -1.0e12;

/// 3-vector in world space.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// The origin.
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    /// Construct a new vector.
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean length.
    #[must_use]
    pub fn length_sq(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    /// Distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        (self - other).length()
    }

    /// Dot product.
    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Unit vector in this direction, or `fallback` when degenerate.
    #[must_use]
    pub fn normalize_or(self, fallback: Self) -> Self {
        let len = self.length();
        if len > f32::EPSILON {
            self * (1.0 / len)
        } else {
            fallback
        }
    }

    /// Array form used by the spatial index.
    #[must_use]
    pub const fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Role a simulated actor plays in the universe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentKind {
    PlayerShip,
    Fighter,
    Trader,
    Explorer,
    Station,
    Civilian,
    Commander,
    Environment,
}

impl AgentKind {
    /// Human-readable role used in prompt identity lines.
    #[must_use]
    pub const fn role(self) -> &'static str {
        match self {
            Self::PlayerShip => "player ship",
            Self::Fighter => "fighter pilot",
            Self::Trader => "merchant trader",
            Self::Explorer => "deep-space explorer",
            Self::Station => "station controller",
            Self::Civilian => "civilian pilot",
            Self::Commander => "fleet commander",
            Self::Environment => "celestial body",
        }
    }

    /// Whether this kind is driven externally rather than by the AI core.
    #[must_use]
    pub const fn is_player(self) -> bool {
        matches!(self, Self::PlayerShip)
    }

    /// Whether this kind participates in AI scheduling at all.
    /// Environment agents (suns, debris fields) never do.
    #[must_use]
    pub const fn is_schedulable(self) -> bool {
        !matches!(self, Self::PlayerShip | Self::Environment)
    }
}

/// Behavioral state machine for an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum BehaviorState {
    #[default]
    Idle,
    Patrolling,
    Pursuing,
    Fleeing,
    Trading,
    Exploring,
    InDialog,
    Dead,
}

impl BehaviorState {
    /// Short lowercase label used in prompts.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Patrolling => "patrolling",
            Self::Pursuing => "pursuing",
            Self::Fleeing => "fleeing",
            Self::Trading => "trading",
            Self::Exploring => "exploring",
            Self::InDialog => "in dialog",
            Self::Dead => "dead",
        }
    }
}

/// Optional character sheet driving an agent's prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Personality {
    /// Base persona text prepended to every prompt.
    pub base_prompt: String,
    /// Stylistic hint for dialog responses.
    pub dialog_style: String,
    /// Current goals, free-form.
    pub goals: String,
    /// Aggression in `[0, 1]`.
    pub aggression: f32,
    /// Intelligence in `[0, 1]`.
    pub intelligence: f32,
    /// Sociability in `[0, 1]`.
    pub social: f32,
}

impl Personality {
    /// Construct a personality from a base prompt, clamping trait scalars.
    #[must_use]
    pub fn from_prompt(base_prompt: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
            dialog_style: String::new(),
            goals: String::new(),
            aggression: 0.5,
            intelligence: 0.5,
            social: 0.5,
        }
    }

    /// Clamp all trait scalars to `[0, 1]`.
    pub fn clamp_traits(&mut self) {
        self.aggression = self.aggression.clamp(0.0, 1.0);
        self.intelligence = self.intelligence.clamp(0.0, 1.0);
        self.social = self.social.clamp(0.0, 1.0);
    }
}

/// Sensor fit determining what an agent can perceive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SensorSuite {
    /// Visual detection range in world units.
    pub visual_range: f32,
    /// Communication range in world units.
    pub comm_range: f32,
    /// Whether stealth-flagged contacts are detected.
    pub detects_stealth: bool,
    /// Whether long-range scanning is fitted.
    pub long_range: bool,
}

impl Default for SensorSuite {
    fn default() -> Self {
        Self {
            visual_range: 500.0,
            comm_range: 500.0,
            detects_stealth: false,
            long_range: false,
        }
    }
}

/// Sphere collider attached to an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Collider {
    pub radius: f32,
    pub mass: f32,
    /// Solid colliders are separated on contact; non-solid ones only report.
    pub solid: bool,
    /// Sensor volumes report contacts without blocking.
    pub sensor: bool,
    pub enabled: bool,
}

impl Default for Collider {
    fn default() -> Self {
        Self {
            radius: 5.0,
            mass: 100.0,
            solid: true,
            sensor: false,
            enabled: true,
        }
    }
}

/// Scalar fields for a single agent used when inserting or snapshotting
/// from the SoA store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Euler rotation in radians.
    pub orientation: Vec3,
    /// Euler rotation rate in radians per second.
    pub angular_velocity: Vec3,
    /// Hull integrity in `[0, 100]`.
    pub health: f32,
    /// Reactor charge in `[0, 100]`.
    pub energy: f32,
    /// Propellant in `[0, 100]`.
    pub fuel: f32,
    pub kind: AgentKind,
    pub state: BehaviorState,
}

impl Default for AgentData {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            orientation: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            health: 100.0,
            energy: 100.0,
            fuel: 100.0,
            kind: AgentKind::Civilian,
            state: BehaviorState::Idle,
        }
    }
}

impl AgentData {
    /// A fresh agent of the given kind at `position`.
    #[must_use]
    pub fn spawned(kind: AgentKind, position: Vec3) -> Self {
        Self {
            position,
            kind,
            ..Self::default()
        }
    }
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AgentColumns {
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    orientations: Vec<Vec3>,
    angular_velocities: Vec<Vec3>,
    healths: Vec<f32>,
    energies: Vec<f32>,
    fuels: Vec<f32>,
    kinds: Vec<AgentKind>,
    states: Vec<BehaviorState>,
    player_distances: Vec<f32>,
    ai_periods: Vec<f32>,
    last_ai_times: Vec<f64>,
}

impl AgentColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve additional capacity in each backing vector.
    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        self.velocities.reserve(additional);
        self.orientations.reserve(additional);
        self.angular_velocities.reserve(additional);
        self.healths.reserve(additional);
        self.energies.reserve(additional);
        self.fuels.reserve(additional);
        self.kinds.reserve(additional);
        self.states.reserve(additional);
        self.player_distances.reserve(additional);
        self.ai_periods.reserve(additional);
        self.last_ai_times.reserve(additional);
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.orientations.clear();
        self.angular_velocities.clear();
        self.healths.clear();
        self.energies.clear();
        self.fuels.clear();
        self.kinds.clear();
        self.states.clear();
        self.player_distances.clear();
        self.ai_periods.clear();
        self.last_ai_times.clear();
    }

    /// Push a new row onto each column.
    pub fn push(&mut self, agent: AgentData) {
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.orientations.push(agent.orientation);
        self.angular_velocities.push(agent.angular_velocity);
        self.healths.push(agent.health);
        self.energies.push(agent.energy);
        self.fuels.push(agent.fuel);
        self.kinds.push(agent.kind);
        self.states.push(agent.state);
        self.player_distances.push(f32::MAX);
        self.ai_periods.push(AI_PERIOD_DISTANT);
        self.last_ai_times.push(LAST_AI_NEVER);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> AgentData {
        let removed = AgentData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            orientation: self.orientations.swap_remove(index),
            angular_velocity: self.angular_velocities.swap_remove(index),
            health: self.healths.swap_remove(index),
            energy: self.energies.swap_remove(index),
            fuel: self.fuels.swap_remove(index),
            kind: self.kinds.swap_remove(index),
            state: self.states.swap_remove(index),
        };
        self.player_distances.swap_remove(index);
        self.ai_periods.swap_remove(index);
        self.last_ai_times.swap_remove(index);
        self.debug_assert_coherent();
        removed
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            orientation: self.orientations[index],
            angular_velocity: self.angular_velocities[index],
            health: self.healths[index],
            energy: self.energies[index],
            fuel: self.fuels[index],
            kind: self.kinds[index],
            state: self.states[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Vec3] {
        &mut self.positions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Vec3] {
        &mut self.velocities
    }

    /// Immutable access to orientations.
    #[must_use]
    pub fn orientations(&self) -> &[Vec3] {
        &self.orientations
    }

    /// Mutable access to orientations.
    #[must_use]
    pub fn orientations_mut(&mut self) -> &mut [Vec3] {
        &mut self.orientations
    }

    /// Immutable access to angular velocities.
    #[must_use]
    pub fn angular_velocities(&self) -> &[Vec3] {
        &self.angular_velocities
    }

    /// Mutable access to angular velocities.
    #[must_use]
    pub fn angular_velocities_mut(&mut self) -> &mut [Vec3] {
        &mut self.angular_velocities
    }

    /// Immutable access to health values.
    #[must_use]
    pub fn healths(&self) -> &[f32] {
        &self.healths
    }

    /// Mutable access to health values.
    #[must_use]
    pub fn healths_mut(&mut self) -> &mut [f32] {
        &mut self.healths
    }

    /// Immutable access to energy values.
    #[must_use]
    pub fn energies(&self) -> &[f32] {
        &self.energies
    }

    /// Mutable access to energy values.
    #[must_use]
    pub fn energies_mut(&mut self) -> &mut [f32] {
        &mut self.energies
    }

    /// Immutable access to fuel values.
    #[must_use]
    pub fn fuels(&self) -> &[f32] {
        &self.fuels
    }

    /// Mutable access to fuel values.
    #[must_use]
    pub fn fuels_mut(&mut self) -> &mut [f32] {
        &mut self.fuels
    }

    /// Immutable access to agent kinds.
    #[must_use]
    pub fn kinds(&self) -> &[AgentKind] {
        &self.kinds
    }

    /// Immutable access to behavioral states.
    #[must_use]
    pub fn states(&self) -> &[BehaviorState] {
        &self.states
    }

    /// Mutable access to behavioral states.
    #[must_use]
    pub fn states_mut(&mut self) -> &mut [BehaviorState] {
        &mut self.states
    }

    /// Immutable access to cached player distances.
    #[must_use]
    pub fn player_distances(&self) -> &[f32] {
        &self.player_distances
    }

    /// Mutable access to cached player distances.
    #[must_use]
    pub fn player_distances_mut(&mut self) -> &mut [f32] {
        &mut self.player_distances
    }

    /// Immutable access to AI update periods.
    #[must_use]
    pub fn ai_periods(&self) -> &[f32] {
        &self.ai_periods
    }

    /// Mutable access to AI update periods.
    #[must_use]
    pub fn ai_periods_mut(&mut self) -> &mut [f32] {
        &mut self.ai_periods
    }

    /// Immutable access to last AI dispatch times.
    #[must_use]
    pub fn last_ai_times(&self) -> &[f64] {
        &self.last_ai_times
    }

    /// Mutable access to last AI dispatch times.
    #[must_use]
    pub fn last_ai_times_mut(&mut self) -> &mut [f64] {
        &mut self.last_ai_times
    }

    /// Integrate positions and orientations by `dt` and apply one tick of
    /// velocity damping. Callers must not invoke this with `dt == 0`; a
    /// zero-length tick leaves kinematics untouched.
    pub(crate) fn integrate_kinematics(&mut self, dt: f32, damping: f32) {
        for i in 0..self.positions.len() {
            let v = self.velocities[i];
            self.positions[i] += v * dt;
            let w = self.angular_velocities[i];
            self.orientations[i] += w * dt;
            self.velocities[i] = v * damping;
            self.angular_velocities[i] = w * damping;
        }
    }

    /// Burn fuel above the speed threshold, regenerate energy, and clamp
    /// all resource scalars to `[0, 100]`. Environment rows are inert.
    pub(crate) fn settle_resources(
        &mut self,
        dt: f32,
        burn_threshold: f32,
        burn_rate: f32,
        regen_rate: f32,
    ) {
        for i in 0..self.positions.len() {
            if matches!(self.kinds[i], AgentKind::Environment) {
                continue;
            }
            let speed = self.velocities[i].length();
            if speed > burn_threshold {
                let burn = (speed - burn_threshold) * burn_rate * dt;
                self.fuels[i] = (self.fuels[i] - burn).clamp(0.0, 100.0);
            }
            self.energies[i] = (self.energies[i] + regen_rate * dt).clamp(0.0, 100.0);
            self.healths[i] = self.healths[i].clamp(0.0, 100.0);
        }
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.orientations.len());
        debug_assert_eq!(self.positions.len(), self.angular_velocities.len());
        debug_assert_eq!(self.positions.len(), self.healths.len());
        debug_assert_eq!(self.positions.len(), self.energies.len());
        debug_assert_eq!(self.positions.len(), self.fuels.len());
        debug_assert_eq!(self.positions.len(), self.kinds.len());
        debug_assert_eq!(self.positions.len(), self.states.len());
        debug_assert_eq!(self.positions.len(), self.player_distances.len());
        debug_assert_eq!(self.positions.len(), self.ai_periods.len());
        debug_assert_eq!(self.positions.len(), self.last_ai_times.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug, Default)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl AgentArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: AgentColumns::new(),
        }
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no agents are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over active agent handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns the handle stored at dense index `index`.
    #[must_use]
    pub fn handle_at(&self, index: usize) -> Option<AgentId> {
        self.handles.get(index).copied()
    }

    /// Returns true if `id` refers to a live agent.
    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored agents.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Cold per-agent data kept outside the dense columns.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentRuntime {
    /// Optional display name.
    pub name: Option<String>,
    /// Optional character sheet.
    pub personality: Option<Personality>,
    /// Sensor fit.
    pub sensors: SensorSuite,
    /// Sphere collider.
    pub collider: Collider,
    /// Opaque cargo capacity.
    pub cargo_capacity: f32,
    /// Most recent inbound message, if any.
    pub last_msg_in: Option<String>,
    /// Most recent outbound message, if any.
    pub last_msg_out: Option<String>,
}

impl AgentRuntime {
    /// Default sensor and collider fit for a freshly spawned kind.
    #[must_use]
    pub fn for_kind(kind: AgentKind) -> Self {
        let (radius, mass, visual, comm) = match kind {
            AgentKind::PlayerShip => (4.0, 120.0, 800.0, 1000.0),
            AgentKind::Fighter => (5.0, 100.0, 600.0, 500.0),
            AgentKind::Trader => (8.0, 400.0, 500.0, 800.0),
            AgentKind::Explorer => (6.0, 150.0, 900.0, 600.0),
            AgentKind::Station => (60.0, 50_000.0, 1200.0, 2000.0),
            AgentKind::Civilian => (5.0, 120.0, 400.0, 400.0),
            AgentKind::Commander => (7.0, 200.0, 800.0, 1000.0),
            AgentKind::Environment => (100.0, 1.0e9, 0.0, 0.0),
        };
        Self {
            name: None,
            personality: None,
            sensors: SensorSuite {
                visual_range: visual,
                comm_range: comm,
                detects_stealth: matches!(kind, AgentKind::Commander),
                long_range: matches!(kind, AgentKind::Explorer),
            },
            collider: Collider {
                radius,
                mass,
                solid: !matches!(kind, AgentKind::Environment),
                sensor: false,
                enabled: !matches!(kind, AgentKind::Environment),
            },
            cargo_capacity: match kind {
                AgentKind::Trader => 100.0,
                AgentKind::Station => 1000.0,
                _ => 10.0,
            },
            last_msg_in: None,
            last_msg_out: None,
        }
    }
}

/// Errors surfaced by the simulation core.
#[derive(Debug, Error)]
pub enum UniverseError {
    /// The inference backend refused the model at init time. Fatal.
    #[error("inference backend failed to load")]
    BackendLoadFailed(#[source] InferenceError),
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Spawn refused; the caller may retry after removals.
    #[error("universe is at capacity ({0} agents)")]
    UniverseFull(usize),
    /// The referenced agent does not exist; the operation was a no-op.
    #[error("agent does not exist")]
    InvalidAgent,
    /// The operation was refused in the current state.
    #[error("operation refused: {0}")]
    InvalidState(&'static str),
    /// A generation ended abnormally; agent state is unchanged.
    #[error("inference failed")]
    InferenceFailed(#[source] InferenceError),
}

/// Static configuration for a Voidpilot universe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Opaque model path handed to the inference backend at init.
    pub model_path: String,
    /// Token buffer size requested from the backend.
    pub max_context: usize,
    /// Agent capacity; spawns beyond it fail with `UniverseFull`.
    pub max_agents: usize,
    /// Optional RNG seed for reproducible universes.
    pub rng_seed: Option<u64>,
    /// Edge length of one spatial sector.
    pub sector_size: f32,
    /// Sectors along each axis of the spatial grid.
    pub sectors_per_axis: usize,
    /// Per-tick velocity damping factor in `(0, 1]`.
    pub damping: f32,
    /// Speed above which fuel is consumed.
    pub fuel_burn_threshold: f32,
    /// Fuel consumed per unit speed per second above the threshold.
    pub fuel_burn_rate: f32,
    /// Energy regenerated per second, up to 100.
    pub energy_regen_rate: f32,
    /// AI dispatches allowed per tick.
    pub max_concurrent_tasks: usize,
    /// Collision candidates examined per agent per tick.
    pub max_collision_checks: usize,
    /// Character budget for built prompts.
    pub context_budget: usize,
    /// Typewriter reveal interval in seconds per character.
    pub dialog_char_interval: f32,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            max_context: 4096,
            max_agents: 4096,
            rng_seed: None,
            sector_size: SECTOR_SIZE,
            sectors_per_axis: SECTORS_PER_AXIS,
            damping: DAMPING,
            fuel_burn_threshold: 1.0,
            fuel_burn_rate: 0.05,
            energy_regen_rate: 2.0,
            max_concurrent_tasks: 5,
            max_collision_checks: C_MAX,
            context_budget: CTX_BUDGET,
            dialog_char_interval: DIALOG_CHAR_INTERVAL,
            history_capacity: 256,
        }
    }
}

impl UniverseConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), UniverseError> {
        if self.max_context == 0 {
            return Err(UniverseError::InvalidConfig("max_context must be non-zero"));
        }
        if self.max_agents == 0 {
            return Err(UniverseError::InvalidConfig("max_agents must be non-zero"));
        }
        if self.sector_size <= 0.0 {
            return Err(UniverseError::InvalidConfig(
                "sector_size must be positive",
            ));
        }
        if self.sectors_per_axis == 0 {
            return Err(UniverseError::InvalidConfig(
                "sectors_per_axis must be non-zero",
            ));
        }
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(UniverseError::InvalidConfig("damping must be in (0, 1]"));
        }
        if self.fuel_burn_rate < 0.0
            || self.fuel_burn_threshold < 0.0
            || self.energy_regen_rate < 0.0
        {
            return Err(UniverseError::InvalidConfig(
                "fuel and energy rates must be non-negative",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(UniverseError::InvalidConfig(
                "max_concurrent_tasks must be non-zero",
            ));
        }
        if self.max_collision_checks == 0 {
            return Err(UniverseError::InvalidConfig(
                "max_collision_checks must be non-zero",
            ));
        }
        if self.context_budget == 0 {
            return Err(UniverseError::InvalidConfig(
                "context_budget must be non-zero",
            ));
        }
        if self.dialog_char_interval <= 0.0 {
            return Err(UniverseError::InvalidConfig(
                "dialog_char_interval must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(UniverseError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when absent.
    pub(crate) fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(seed: u32) -> AgentData {
        AgentData {
            position: Vec3::new(seed as f32, seed as f32 + 1.0, -(seed as f32)),
            velocity: Vec3::new(seed as f32 * 0.1, 0.0, -(seed as f32) * 0.1),
            health: 100.0 - seed as f32,
            kind: AgentKind::Fighter,
            ..AgentData::default()
        }
    }

    #[test]
    fn vec3_math_behaves() {
        let a = Vec3::new(3.0, 0.0, 4.0);
        assert_eq!(a.length(), 5.0);
        assert_eq!(a.distance(Vec3::ZERO), 5.0);
        let unit = a.normalize_or(Vec3::new(1.0, 0.0, 0.0));
        assert!((unit.length() - 1.0).abs() < 1e-6);
        // Degenerate input falls back.
        let fallback = Vec3::ZERO.normalize_or(Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(fallback, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(a.dot(Vec3::new(1.0, 0.0, 0.0)), 3.0);
    }

    #[test]
    fn insert_allocates_unique_handles() {
        let mut arena = AgentArena::new();
        let a = arena.insert(sample_agent(0));
        let b = arena.insert(sample_agent(1));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        assert!(arena.contains(a));
        assert!(arena.contains(b));
    }

    #[test]
    fn remove_keeps_dense_storage_coherent() {
        let mut arena = AgentArena::new();
        let a = arena.insert(sample_agent(0));
        let b = arena.insert(sample_agent(1));
        let c = arena.insert(sample_agent(2));
        assert_eq!(arena.len(), 3);

        let removed = arena.remove(b).expect("agent removed");
        assert_eq!(removed.health, 99.0);
        assert_eq!(arena.len(), 2);
        assert!(arena.contains(a));
        assert!(arena.contains(c));
        assert!(!arena.contains(b));

        let snapshot_c = arena.snapshot(c).expect("snapshot");
        assert_eq!(snapshot_c.position, Vec3::new(2.0, 3.0, -2.0));
        assert_eq!(arena.index_of(c), Some(1));
        assert_eq!(arena.handle_at(1), Some(c));

        let d = arena.insert(sample_agent(3));
        assert_ne!(
            b, d,
            "generational handles should not be reused immediately"
        );
    }

    #[test]
    fn columns_track_scheduling_metadata() {
        let mut columns = AgentColumns::new();
        columns.push(AgentData::default());
        assert_eq!(columns.ai_periods()[0], AI_PERIOD_DISTANT);
        assert!(columns.last_ai_times()[0] <= LAST_AI_NEVER);
        assert_eq!(columns.player_distances()[0], f32::MAX);
        let data = columns.swap_remove(0);
        assert_eq!(data.health, 100.0);
        assert!(columns.is_empty());
    }

    #[test]
    fn kind_defaults_are_sane() {
        let fighter = AgentRuntime::for_kind(AgentKind::Fighter);
        assert_eq!(fighter.collider.radius, 5.0);
        assert!(fighter.collider.solid && fighter.collider.enabled);

        let station = AgentRuntime::for_kind(AgentKind::Station);
        assert!(station.collider.mass > fighter.collider.mass);
        assert_eq!(station.cargo_capacity, 1000.0);

        let env = AgentRuntime::for_kind(AgentKind::Environment);
        assert!(!env.collider.enabled);
        assert!(!AgentKind::Environment.is_schedulable());
        assert!(!AgentKind::PlayerShip.is_schedulable());
        assert!(AgentKind::Fighter.is_schedulable());
    }

    #[test]
    fn config_validation_rejects_nonsense() {
        assert!(UniverseConfig::default().validate().is_ok());

        let bad = UniverseConfig {
            damping: 0.0,
            ..UniverseConfig::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(UniverseError::InvalidConfig(_))
        ));

        let bad = UniverseConfig {
            max_concurrent_tasks: 0,
            ..UniverseConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = UniverseConfig {
            dialog_char_interval: 0.0,
            ..UniverseConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn personality_traits_clamp() {
        let mut personality = Personality::from_prompt("gruff veteran");
        personality.aggression = 3.0;
        personality.social = -1.0;
        personality.clamp_traits();
        assert_eq!(personality.aggression, 1.0);
        assert_eq!(personality.social, 0.0);
    }
}

//! End-to-end tests driving a universe against a scripted backend.

use std::cell::RefCell;
use std::rc::Rc;

use voidpilot_core::{
    AgentData, AgentKind, BehaviorState, Personality, TaskKind, Universe, UniverseConfig,
    UniverseError, UniverseEvent, UniverseEventSink, Vec3,
};
use voidpilot_infer::ScriptedBackend;

/// Sink that records every event for later assertions.
#[derive(Clone, Default)]
struct RecordingSink {
    events: Rc<RefCell<Vec<UniverseEvent>>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<UniverseEvent> {
        self.events.borrow().clone()
    }

    fn count(&self, predicate: impl Fn(&UniverseEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| predicate(e)).count()
    }
}

impl UniverseEventSink for RecordingSink {
    fn on_event(&mut self, _tick: u64, event: &UniverseEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

fn seeded_config() -> UniverseConfig {
    UniverseConfig {
        rng_seed: Some(42),
        ..UniverseConfig::default()
    }
}

fn universe_with(backend: ScriptedBackend) -> Universe {
    Universe::new(seeded_config(), Box::new(backend)).expect("universe")
}

fn fighter_at(x: f32, z: f32) -> AgentData {
    AgentData::spawned(AgentKind::Fighter, Vec3::new(x, 0.0, z))
}

#[test]
fn spawn_query_remove_round_trip() {
    let mut u = universe_with(ScriptedBackend::ready());
    let a = u.spawn(fighter_at(0.0, 0.0)).expect("spawn a");
    let b = u.spawn(fighter_at(30.0, 0.0)).expect("spawn b");
    let c = u.spawn(fighter_at(5_000.0, 0.0)).expect("spawn c");
    assert_eq!(u.agent_count(), 3);

    let near = u.neighbors(a, 100.0).expect("neighbors");
    assert_eq!(near.len(), 1);
    assert_eq!(near[0].0, b);
    assert!((near[0].1 - 30.0).abs() < 1e-3);

    let removed = u.remove(b).expect("remove");
    assert_eq!(removed.kind, AgentKind::Fighter);
    assert!(!u.contains(b));
    assert!(u.neighbors(a, 100.0).expect("neighbors").is_empty());
    assert!(u.contains(c));
    assert!(matches!(u.remove(b), Err(UniverseError::InvalidAgent)));
}

#[test]
fn near_agents_are_scheduled_and_far_agents_are_gated() {
    let mut backend = ScriptedBackend::ready();
    backend.push_response("ignore_player");
    let mut u = universe_with(backend);
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));

    let near = u.spawn(fighter_at(50.0, 0.0)).expect("near");
    let far = u.spawn(fighter_at(5_000.0, 0.0)).expect("far");

    let summary = u.update(0.1).expect("tick");
    assert_eq!(summary.dispatched, 1);
    assert_eq!(
        sink.count(|e| matches!(e, UniverseEvent::TaskDispatched { agent, .. } if *agent == near)),
        1
    );
    assert_eq!(
        sink.count(|e| matches!(e, UniverseEvent::TaskDispatched { agent, .. } if *agent == far)),
        0
    );
    assert!(u.stats().scheduler.rejected >= 1);
}

#[test]
fn dispatch_respects_the_per_tick_budget() {
    let mut u = universe_with(ScriptedBackend::ready());
    for i in 0..10 {
        u.spawn(fighter_at(120.0 + 20.0 * i as f32, 0.0)).expect("spawn");
    }
    let budget = u.config().max_concurrent_tasks;

    let first = u.update(0.1).expect("tick 1");
    assert_eq!(first.dispatched, budget);
    assert_eq!(first.queued, 10 - budget);

    // The backlog drains next tick; no agent becomes eligible again yet.
    let second = u.update(0.1).expect("tick 2");
    assert_eq!(second.dispatched, 10 - budget);
    assert_eq!(second.queued, 0);
}

#[test]
fn refresh_period_follows_the_player() {
    let mut u = universe_with(ScriptedBackend::ready());
    let id = u.spawn(fighter_at(50.0, 0.0)).expect("spawn");
    u.update(0.1).expect("tick");
    let idx = u.agents().index_of(id).expect("index");
    assert_eq!(u.agents().columns().ai_periods()[idx], 1.0);

    u.set_player_position(Vec3::new(4_000.0, 0.0, 0.0));
    u.update(0.1).expect("tick");
    assert_eq!(u.agents().columns().ai_periods()[idx], 30.0);
}

#[test]
fn agent_waits_out_its_period_between_tasks() {
    let mut u = universe_with(ScriptedBackend::ready());
    u.spawn(fighter_at(50.0, 0.0)).expect("spawn");

    // Fighter within 100 units refreshes at 1 Hz.
    assert_eq!(u.update(0.1).expect("t").dispatched, 1);
    let mut dispatched = 0;
    for _ in 0..8 {
        dispatched += u.update(0.1).expect("t").dispatched;
    }
    assert_eq!(dispatched, 0, "period not yet elapsed");
    // Crossing the 1 s mark re-arms the agent.
    assert_eq!(u.update(0.2).expect("t").dispatched, 1);
}

#[test]
fn dialog_streams_and_reveals_at_typewriter_pace() {
    let mut backend = ScriptedBackend::ready();
    backend.push_stream(&["Well", " met", ", pilot."]);
    let mut u = universe_with(backend);
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));

    // Far out, so periodic low-lane tasks stay gated during the session.
    let id = u
        .spawn_named(
            fighter_at(6_000.0, 0.0),
            "Vex",
            Some(Personality::from_prompt("a laconic ace")),
        )
        .expect("spawn");
    u.dialog_start(id).expect("dialog start");
    let idx = u.agents().index_of(id).expect("index");
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::InDialog);

    u.dialog_say("identify yourself").expect("say");
    // Generation happens on the next tick; nothing reveals at dt == 0.
    u.update(0.0).expect("dispatch tick");
    let session = u.dialog().expect("session");
    assert_eq!(session.visible_text(), "");
    assert!(session.is_revealing());

    // Reveal strictly monotonically.
    let mut last = 0;
    for _ in 0..5 {
        u.update(0.05).expect("reveal tick");
        let now = u.dialog().expect("session").display_chars();
        assert!(now >= last);
        assert!(now <= last + 2);
        last = now;
    }

    // Let the rest play out.
    for _ in 0..40 {
        u.update(0.05).expect("reveal tick");
    }
    let line = sink
        .events()
        .into_iter()
        .find_map(|e| match e {
            UniverseEvent::DialogLineReady { agent, text } if agent == id => Some(text),
            _ => None,
        })
        .expect("revealed line");
    assert_eq!(line, "Well met, pilot.");
    assert_eq!(
        u.runtime(id).and_then(|rt| rt.last_msg_out.clone()),
        Some(String::from("Well met, pilot."))
    );
    assert_eq!(u.dialog().expect("session").history().len(), 2);
    // The committed line returns the partner to Idle between turns.
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::Idle);

    // The next player line re-enters the dialog state.
    u.dialog_say("and your cargo?").expect("say again");
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::InDialog);

    u.dialog_end().expect("end");
    assert!(u.dialog().is_none());
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::Idle);
}

#[test]
fn failed_generation_leaves_agent_untouched() {
    let mut backend = ScriptedBackend::ready();
    backend.push_failure("kv cache exhausted");
    let mut u = universe_with(backend);
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));

    let id = u.spawn(fighter_at(50.0, 0.0)).expect("spawn");
    u.update(0.1).expect("tick");

    assert_eq!(
        sink.count(|e| matches!(e, UniverseEvent::TaskFailed { agent, .. } if *agent == id)),
        1
    );
    let idx = u.agents().index_of(id).expect("index");
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::Idle);
    assert!(u.runtime(id).and_then(|rt| rt.last_msg_out.clone()).is_none());
    assert_eq!(u.stats().inference.failures, 1);
}

#[test]
fn failed_dialog_generation_discards_partial_text() {
    let mut backend = ScriptedBackend::ready();
    backend.push_failure("interrupted");
    let mut u = universe_with(backend);

    let id = u.spawn(fighter_at(40.0, 0.0)).expect("spawn");
    u.dialog_start(id).expect("start");
    u.dialog_say("report status").expect("say");
    u.update(0.1).expect("tick");

    let session = u.dialog().expect("session");
    assert_eq!(session.visible_text(), "");
    assert!(!session.is_awaiting_response());
    // Only the player line made it into history.
    assert_eq!(session.history().len(), 1);

    // The failure drops the partner back to Idle; a later line re-enters.
    let idx = u.agents().index_of(id).expect("index");
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::Idle);
    u.dialog_say("say again?").expect("say");
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::InDialog);
}

#[test]
fn zero_dt_tick_moves_nothing() {
    let mut u = universe_with(ScriptedBackend::ready());
    for i in 0..4 {
        let mut data = fighter_at(3_000.0 + 50.0 * i as f32, 3_000.0);
        data.velocity = Vec3::new(2.0, 0.0, -1.0);
        u.spawn(data).expect("spawn");
    }
    u.update(0.5).expect("tick");
    u.update(0.5).expect("tick");

    let before: Vec<AgentData> = (0..u.agent_count())
        .map(|i| u.agents().columns().snapshot(i))
        .collect();
    u.update(0.0).expect("zero tick");
    let after: Vec<AgentData> = (0..u.agent_count())
        .map(|i| u.agents().columns().snapshot(i))
        .collect();
    assert_eq!(before, after);
}

#[test]
fn player_message_queues_a_high_lane_reply() {
    let mut backend = ScriptedBackend::ready();
    backend.push_response("Stand by, hailing frequencies open.");
    let mut u = universe_with(backend);
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));

    // Far outside every gate except dialog.
    let id = u.spawn(fighter_at(6_000.0, 0.0)).expect("spawn");
    u.send_message(id, "this is the player, respond").expect("send");
    let summary = u.update(0.1).expect("tick");

    assert_eq!(summary.messages, 1);
    assert_eq!(
        sink.count(|e| matches!(
            e,
            UniverseEvent::TaskDispatched { agent, kind: TaskKind::Dialog, .. } if *agent == id
        )),
        1
    );
    let rt = u.runtime(id).expect("runtime");
    assert_eq!(rt.last_msg_in.as_deref(), Some("this is the player, respond"));
    assert_eq!(
        rt.last_msg_out.as_deref(),
        Some("Stand by, hailing frequencies open.")
    );
}

#[test]
fn messages_to_removed_agents_are_dropped() {
    let mut u = universe_with(ScriptedBackend::ready());
    let id = u.spawn(fighter_at(6_000.0, 0.0)).expect("spawn");
    u.send_message(id, "hello").expect("send");
    u.remove(id).expect("remove");
    let summary = u.update(0.1).expect("tick");
    assert_eq!(summary.messages, 0);
}

#[test]
fn overlapping_solids_are_separated() {
    let mut u = universe_with(ScriptedBackend::ready());
    u.set_player_position(Vec3::new(10_000.0, 0.0, 0.0));
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));

    let a = u.spawn(fighter_at(0.0, 0.0)).expect("a");
    let b = u.spawn(fighter_at(4.0, 0.0)).expect("b");
    let before = {
        let pa = u.agents().snapshot(a).expect("a").position;
        let pb = u.agents().snapshot(b).expect("b").position;
        pa.distance(pb)
    };
    let summary = u.update(0.1).expect("tick");
    assert!(summary.collisions >= 1);
    assert!(sink.count(|e| matches!(e, UniverseEvent::Collision { .. })) >= 1);

    let pa = u.agents().snapshot(a).expect("a").position;
    let pb = u.agents().snapshot(b).expect("b").position;
    assert!(pa.distance(pb) > before, "overlap must shrink");
}

#[test]
fn resources_stay_clamped_under_long_runs() {
    let mut u = universe_with(ScriptedBackend::ready());
    let mut data = fighter_at(8_000.0, 0.0);
    data.velocity = Vec3::new(40.0, 0.0, 0.0);
    data.energy = 99.5;
    let id = u.spawn(data).expect("spawn");
    for _ in 0..200 {
        u.update(0.5).expect("tick");
    }
    let snap = u.agents().snapshot(id).expect("snapshot");
    assert!(snap.fuel >= 0.0);
    assert!(snap.energy <= 100.0);
    assert!(snap.health >= 0.0 && snap.health <= 100.0);
}

#[test]
fn removing_the_dialog_partner_ends_the_session() {
    let mut u = universe_with(ScriptedBackend::ready());
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));
    let id = u.spawn(fighter_at(40.0, 0.0)).expect("spawn");
    u.dialog_start(id).expect("start");
    u.remove(id).expect("remove");
    assert!(u.dialog().is_none());
    assert_eq!(
        sink.count(|e| matches!(e, UniverseEvent::DialogEnded { agent } if *agent == id)),
        1
    );
    assert!(matches!(
        u.dialog_say("anyone there?"),
        Err(UniverseError::InvalidState(_))
    ));
}

#[test]
fn only_one_dialog_at_a_time() {
    let mut u = universe_with(ScriptedBackend::ready());
    let a = u.spawn(fighter_at(40.0, 0.0)).expect("a");
    let b = u.spawn(fighter_at(60.0, 0.0)).expect("b");
    u.dialog_start(a).expect("start");
    assert!(matches!(
        u.dialog_start(b),
        Err(UniverseError::InvalidState(_))
    ));
    u.dialog_end().expect("end");
    u.dialog_start(b).expect("second dialog");
}

#[test]
fn seeded_universes_evolve_identically() {
    let run = || {
        let mut u = universe_with(ScriptedBackend::ready());
        for _ in 0..6 {
            u.spawn_drifting(AgentKind::Civilian, 2_000.0).expect("spawn");
        }
        for _ in 0..20 {
            u.update(0.25).expect("tick");
        }
        (0..u.agent_count())
            .map(|i| u.agents().columns().positions()[i])
            .collect::<Vec<Vec3>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn tick_history_is_bounded() {
    let config = UniverseConfig {
        rng_seed: Some(3),
        history_capacity: 8,
        ..UniverseConfig::default()
    };
    let mut u = Universe::new(config, Box::new(ScriptedBackend::ready())).expect("universe");
    for _ in 0..20 {
        u.update(0.1).expect("tick");
    }
    assert_eq!(u.history().len(), 8);
    assert_eq!(u.history().back().expect("last").tick, 20);
}

#[test]
fn greeting_reaction_hails_and_awaits_the_player() {
    let mut backend = ScriptedBackend::ready();
    backend.push_response("send_greeting");
    let mut u = universe_with(backend);
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));

    let id = u.spawn(fighter_at(50.0, 0.0)).expect("spawn");
    u.update(0.1).expect("tick");

    let idx = u.agents().index_of(id).expect("index");
    assert_eq!(u.agents().columns().states()[idx], BehaviorState::InDialog);
    assert_eq!(
        sink.count(|e| matches!(e, UniverseEvent::GreetingSent { agent } if *agent == id)),
        1
    );
    assert_eq!(
        u.runtime(id).and_then(|rt| rt.last_msg_out.clone()),
        Some(String::from("Greetings, traveler."))
    );

    // Hailing without an open session does not strand the agent: it stays
    // schedulable and takes its next periodic task on schedule.
    let summary = u.update(1.0).expect("tick");
    assert_eq!(summary.dispatched, 1);
}

#[test]
fn refresh_uses_positions_settled_this_tick() {
    let mut u = universe_with(ScriptedBackend::ready());
    let mut data = fighter_at(50.0, 0.0);
    data.velocity = Vec3::new(100.0, 0.0, 0.0);
    let id = u.spawn(data).expect("spawn");

    // One 1 s tick carries the fighter from 50 to 150 units out; the cached
    // distance and period must reflect the settled position, not the stale
    // one.
    u.update(1.0).expect("tick");
    let idx = u.agents().index_of(id).expect("index");
    let dist = u.agents().columns().player_distances()[idx];
    assert!((dist - 150.0).abs() < 1e-3, "cached distance was {dist}");
    assert_eq!(u.agents().columns().ai_periods()[idx], 2.0);
}

#[test]
fn collision_separation_scales_with_inverse_mass() {
    let mut u = universe_with(ScriptedBackend::ready());
    u.set_player_position(Vec3::new(-10_000.0, 0.0, 0.0));
    let light = u.spawn(fighter_at(8_000.0, 0.0)).expect("light");
    let heavy = u.spawn(fighter_at(8_007.0, 0.0)).expect("heavy");
    u.runtime_mut(heavy).expect("runtime").collider.mass = 300.0;

    // Radii 5 + 5 against a 7 unit gap: depth 3, split 1:3 by inverse mass.
    u.update(0.1).expect("tick");
    let pa = u.agents().snapshot(light).expect("light").position;
    let pb = u.agents().snapshot(heavy).expect("heavy").position;
    assert!((pa.distance(pb) - 10.0).abs() < 5e-3, "gap {}", pa.distance(pb));
    let light_push = (pa.x - 8_000.0).abs();
    let heavy_push = (pb.x - 8_007.0).abs();
    assert!((light_push - 2.25).abs() < 5e-3, "light moved {light_push}");
    assert!((heavy_push - 0.75).abs() < 5e-3, "heavy moved {heavy_push}");
}

#[test]
fn broadcast_reaches_the_player_ship_without_a_reply_task() {
    let mut u = universe_with(ScriptedBackend::ready());
    let sink = RecordingSink::default();
    u.set_event_sink(Box::new(sink.clone()));
    let ship = u
        .spawn(AgentData::spawned(AgentKind::PlayerShip, Vec3::new(10.0, 0.0, 0.0)))
        .expect("ship");
    let fighter = u.spawn(fighter_at(20.0, 0.0)).expect("fighter");

    assert_eq!(u.broadcast(Vec3::ZERO, 100.0, "all ships respond"), 2);
    let summary = u.update(0.1).expect("tick");
    assert_eq!(summary.messages, 2);

    assert_eq!(
        u.runtime(ship).and_then(|rt| rt.last_msg_in.clone()),
        Some(String::from("all ships respond"))
    );
    assert_eq!(
        sink.count(|e| matches!(e, UniverseEvent::TaskDispatched { agent, .. } if *agent == ship)),
        0
    );
    assert!(
        sink.count(|e| matches!(
            e,
            UniverseEvent::TaskDispatched { agent, kind: TaskKind::Dialog, .. } if *agent == fighter
        )) >= 1
    );
}

#[test]
fn stats_count_active_agents_and_queued_ai() {
    let mut u = universe_with(ScriptedBackend::ready());
    for i in 0..10 {
        u.spawn(fighter_at(120.0 + 20.0 * i as f32, 0.0)).expect("spawn");
    }
    u.update(0.1).expect("tick");

    let stats = u.stats();
    assert_eq!(stats.agents, 10);
    assert_eq!(stats.active, 10);
    // Five tasks queued past the budget, each for a distinct agent.
    assert_eq!(stats.with_active_ai, 5);
    assert_eq!(stats.queued_tasks, 5);
    assert!((stats.tasks_per_s - 50.0).abs() < 1.0);

    u.agents_mut().columns_mut().states_mut()[0] = BehaviorState::Dead;
    assert_eq!(u.stats().active, 9);
}

#[test]
fn shutdown_clears_queued_work() {
    let mut u = universe_with(ScriptedBackend::ready());
    let id = u.spawn(fighter_at(40.0, 0.0)).expect("spawn");
    u.dialog_start(id).expect("start");
    u.dialog_say("hail").expect("say");
    u.shutdown();
    assert!(u.dialog().is_none());
    assert_eq!(u.stats().queued_tasks, 0);
}

//! Determinism guarantees: bit-exact math, deterministic id reuse,
//! snapshot round-trips over the wire format, and rollback convergence
//! under relay hiccups.

use std::collections::BTreeMap;

use lockstep::store::{snapshot, EntityTypeDef, FieldDef, Frame, Phase};
use lockstep::{
    fixed, ActionId, ActionValue, ComponentDef, DeterministicRng, FieldValue, LocalRelay,
    LocalTransport, PredictionStrategy, Session, SessionCallbacks, SessionConfig, SessionState,
    Store,
};

const MOVE: ActionId = 0;
const TICK_MS: i64 = 50;

fn game_store(seed: u32) -> Store {
    let mut store = Store::new(256, seed);
    store
        .register_component(ComponentDef::new(
            "transform",
            vec![
                FieldDef::new("x", FieldValue::fixed(0)),
                FieldDef::new("y", FieldValue::fixed(0)),
            ],
        ))
        .unwrap();
    store
        .register_component(ComponentDef::new(
            "body",
            vec![
                FieldDef::new("radius", FieldValue::fixed(fixed::ONE)),
                FieldDef::new("heading", FieldValue::fixed(0)),
            ],
        ))
        .unwrap();
    let transform = store.component_idx("transform").unwrap();
    let body = store.component_idx("body").unwrap();
    store
        .register_entity_type(EntityTypeDef {
            name: "cell".to_string(),
            components: vec![transform, body],
            overrides: vec![],
            sync_none: false,
        })
        .unwrap();
    store
}

/// A tick that leans on every deterministic primitive: trig, sqrt and the
/// seeded RNG.
fn wander_system(store: &mut Store) -> Result<(), lockstep::EngineError> {
    let x = store.field_ref("transform", "x")?;
    let y = store.field_ref("transform", "y")?;
    let heading = store.field_ref("body", "heading")?;
    for id in store.entities() {
        if !store.is_alive(id) {
            continue;
        }
        let turn = store.random_fixed() / 8;
        let h = store.get_fixed(id, heading)?.wrapping_add(turn);
        store.set_fixed(id, heading, h)?;

        let px = store.get_fixed(id, x)?;
        let py = store.get_fixed(id, y)?;
        let dist = fixed::sqrt(fixed::length_sq(px, py) + fixed::ONE);
        let speed = fixed::div(fixed::ONE, fixed::max(dist >> 8, fixed::ONE));
        store.set_fixed(id, x, px + fixed::mul(lockstep::math::trig::cos(h), speed))?;
        store.set_fixed(id, y, py + fixed::mul(lockstep::math::trig::sin(h), speed))?;
    }
    Ok(())
}

#[test]
fn fixed_point_constants_are_platform_free() {
    // The exact 32-bit patterns every host must produce.
    assert_eq!(fixed::sqrt(fixed::from_int(2)), 92681);
    assert_eq!(lockstep::math::trig::sin(lockstep::math::trig::TURN / 8), 46341);
    assert_eq!(
        lockstep::math::trig::atan2(fixed::ONE, fixed::ONE),
        lockstep::math::trig::TURN / 8
    );

    let mut rng = DeterministicRng::new(42);
    let first: Vec<u32> = (0..4).map(|_| rng.next_u32()).collect();
    let mut again = DeterministicRng::new(42);
    let second: Vec<u32> = (0..4).map(|_| again.next_u32()).collect();
    assert_eq!(first, second);
}

#[test]
fn identical_runs_hash_identically() {
    let run = || {
        let mut store = game_store(99);
        store.add_system(Phase::Update, "wander", Box::new(wander_system));
        for _ in 0..4 {
            store.create_entity("cell", None).unwrap();
        }
        let mut hashes = Vec::new();
        for frame in 1..=120 {
            store.tick(frame, BTreeMap::new()).unwrap();
            hashes.push(store.state_hash());
        }
        hashes
    };
    assert_eq!(run(), run());
}

#[test]
fn hash_invariant_to_id_reuse_history() {
    // Create ten, destroy five (non-contiguous), create five more; replay
    // the identical operation sequence on a fresh store and compare the
    // hash at every step.
    let script = |store: &mut Store, hashes: &mut Vec<u32>| {
        let ids: Vec<_> = (0..10)
            .map(|_| store.create_entity("cell", None).unwrap())
            .collect();
        hashes.push(store.state_hash());
        for &i in &[1usize, 3, 4, 7, 9] {
            store.destroy_entity(ids[i]).unwrap();
            hashes.push(store.state_hash());
        }
        for _ in 0..5 {
            store.create_entity("cell", None).unwrap();
            hashes.push(store.state_hash());
        }
    };

    let mut first = Vec::new();
    let mut second = Vec::new();
    script(&mut game_store(5), &mut first);
    script(&mut game_store(5), &mut second);
    assert_eq!(first, second);
}

#[test]
fn snapshot_survives_wire_roundtrip() {
    let mut store = game_store(11);
    store.add_system(Phase::Update, "wander", Box::new(wander_system));
    for _ in 0..6 {
        store.create_entity("cell", None).unwrap();
    }
    let doomed = store.create_entity("cell", None).unwrap();
    store.destroy_entity(doomed).unwrap();
    for frame in 1..=30 {
        store.tick(frame, BTreeMap::new()).unwrap();
    }

    let snap = store.snapshot(true);
    let bytes = snapshot::encode(&snap, store.component_defs());
    let decoded = snapshot::decode(&bytes, store.component_defs()).unwrap();
    assert_eq!(decoded, snap);

    let mut restored = game_store(0);
    restored.add_system(Phase::Update, "wander", Box::new(wander_system));
    restored.load_snapshot(&decoded).unwrap();
    assert_eq!(restored.state_hash(), store.state_hash());
    assert_eq!(
        snapshot::hash_snapshot(&snap, store.component_defs(), store.type_defs()),
        store.state_hash()
    );

    // Continuations agree too: same ticks, same allocations, same digest.
    for frame in 31..=40 {
        store.tick(frame, BTreeMap::new()).unwrap();
        restored.tick(frame, BTreeMap::new()).unwrap();
    }
    store.create_entity("cell", None).unwrap();
    restored.create_entity("cell", None).unwrap();
    assert_eq!(restored.state_hash(), store.state_hash());
}

// ----------------------------------------------------------------------
// Rollback convergence over the relay
// ----------------------------------------------------------------------

fn build_session() -> Session<LocalTransport> {
    let mut config = SessionConfig::default();
    config.tick_rate = 20;
    config.input_delay_frames = 2;
    // Idle prediction: a stalled relay makes remote inputs genuinely
    // mispredicted once they arrive.
    config.prediction_strategy = PredictionStrategy::Idle;
    config.seed = 3;
    let mut session = Session::new(config);
    session
        .define_component(
            "transform",
            vec![
                FieldDef::new("x", FieldValue::fixed(0)),
                FieldDef::new("y", FieldValue::fixed(0)),
            ],
        )
        .unwrap();
    session
        .define_entity("cell")
        .with("transform")
        .register()
        .unwrap();
    assert_eq!(session.define_action("move"), MOVE);
    session.add_system(
        Phase::Update,
        "movement",
        Box::new(|store| {
            let x = store.field_ref("transform", "x")?;
            for id in store.entities() {
                if !store.is_alive(id) {
                    continue;
                }
                let Some(client) = store.entity_client(id).map(str::to_string) else {
                    continue;
                };
                let Some(ActionValue::Scalar(mx)) = store.input_action(&client, MOVE) else {
                    continue;
                };
                let v = store.get_fixed(id, x)?;
                store.set_fixed(id, x, v + mx)?;
            }
            Ok(())
        }),
    );
    session.init(SessionCallbacks::new().on_connect(|store, client| {
        store.create_entity("cell", Some(client)).unwrap();
    }));
    session
}

#[test]
fn relay_stall_forces_rollback_then_convergence() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    for _ in 0..15 {
        now += TICK_MS;
        a.update(now).unwrap();
        b.update(now).unwrap();
        relay.advance(now);
    }
    assert_eq!(a.state(), SessionState::Connected);
    assert_eq!(b.state(), SessionState::Connected);

    // The relay stalls while wall clocks keep running: both sides predict
    // ahead, and B keeps producing inputs the others cannot see yet.
    for _ in 0..4 {
        now += TICK_MS;
        b.queue_input(MOVE, ActionValue::Scalar(fixed::ONE));
        a.update(now).unwrap();
        b.update(now).unwrap();
        // no relay.advance: ticks stop flowing
    }
    let depth_during_stall = a.prediction_depth();
    assert!(depth_during_stall > 0, "A should be speculating by now");

    // Relay comes back; banked inputs confirm and mispredictions unwind.
    for _ in 0..60 {
        now += TICK_MS;
        a.update(now).unwrap();
        b.update(now).unwrap();
        relay.advance(now);
    }

    assert!(
        a.rollback_stats().rollback_count >= 1,
        "stall must have produced at least one rollback on A: {:?}",
        a.rollback_stats()
    );
    assert_eq!(a.frame(), b.frame());
    assert_eq!(
        a.state_hash(),
        b.state_hash(),
        "participants must converge after rollback/recovery"
    );
}

/// With the relay keeping pace, inputs are always confirmed before their
/// frame is simulated: frames advance monotonically and nothing ever needs
/// rolling back.
#[test]
fn steady_relay_needs_no_rollbacks() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    let mut high_water: Frame = 0;
    for step in 0..50 {
        now += TICK_MS;
        if step % 4 == 0 {
            a.queue_input(MOVE, ActionValue::Scalar(fixed::ONE));
        }
        a.update(now).unwrap();
        b.update(now).unwrap();
        relay.advance(now);

        let frame = a.frame();
        assert!(frame >= high_water, "frame counter regressed outside rollback");
        high_water = frame;
    }

    assert!(a.frame() > 30);
    assert_eq!(a.rollback_stats().rollback_count, 0);
    assert_eq!(b.rollback_stats().rollback_count, 0);
    assert_eq!(a.state_hash(), b.state_hash());
}

//! End-to-end lockstep scenarios over the in-process relay: participants
//! reaching hash agreement, late joins via authority snapshots, and
//! desync recovery.

use lockstep::store::{FieldDef, Phase};
use lockstep::{
    fixed, ActionId, ActionValue, FieldValue, LocalRelay, LocalTransport, Session,
    SessionCallbacks, SessionConfig, SessionState, SyncState,
};

const MOVE: ActionId = 0;
const TICK_MS: i64 = 50;

fn build_session() -> Session<LocalTransport> {
    let mut config = SessionConfig::default();
    config.tick_rate = 20;
    config.input_delay_frames = 2;
    config.seed = 7;
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
        .define_component("player", vec![FieldDef::new("score", FieldValue::U32(0))])
        .unwrap();
    session
        .define_entity("cell")
        .with("transform")
        .with("player")
        .register()
        .unwrap();
    assert_eq!(session.define_action("move"), MOVE);

    session.add_system(
        Phase::Update,
        "movement",
        Box::new(|store| {
            let x = store.field_ref("transform", "x")?;
            let y = store.field_ref("transform", "y")?;
            for id in store.entities() {
                if !store.is_alive(id) {
                    continue;
                }
                let Some(client) = store.entity_client(id).map(str::to_string) else {
                    continue;
                };
                let Some(ActionValue::Vector2(dx, dy)) = store.input_action(&client, MOVE) else {
                    continue;
                };
                let vx = store.get_fixed(id, x)? + dx;
                let vy = store.get_fixed(id, y)? + dy;
                store.set_fixed(id, x, vx)?;
                store.set_fixed(id, y, vy)?;
            }
            Ok(())
        }),
    );

    session.init(
        SessionCallbacks::new()
            .on_connect(|store, client| {
                store.create_entity("cell", Some(client)).unwrap();
            })
            .on_disconnect(|store, client| {
                for id in store.entities() {
                    if store.entity_client(id) == Some(client) {
                        store.destroy_entity(id).unwrap();
                    }
                }
            }),
    );
    session
}

fn pump(
    relay: &LocalRelay,
    sessions: &mut [&mut Session<LocalTransport>],
    now: &mut i64,
    steps: u32,
) {
    for _ in 0..steps {
        *now += TICK_MS;
        for session in sessions.iter_mut() {
            session.update(*now).unwrap();
        }
        relay.advance(*now);
    }
}

fn cell_x(session: &Session<LocalTransport>, client: &str) -> i32 {
    let store = session.store();
    let x = store.field_ref("transform", "x").unwrap();
    let id = store
        .entities()
        .into_iter()
        .find(|&id| store.entity_client(id) == Some(client))
        .unwrap_or_else(|| panic!("no cell for {client}"));
    store.get_fixed(id, x).unwrap()
}

#[test]
fn two_participants_reach_hash_agreement() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    pump(&relay, &mut [&mut a, &mut b], &mut now, 15);

    assert_eq!(a.state(), SessionState::Connected);
    assert_eq!(b.state(), SessionState::Connected);
    assert_eq!(a.active_clients(), b.active_clients());
    assert!(a.is_authority());
    assert!(!b.is_authority());

    // p1 moves one unit per tick for exactly ten ticks.
    let start_frame = a.frame();
    let start_x = cell_x(&a, "p1");
    while a.frame() < start_frame + 10 {
        a.queue_input(MOVE, ActionValue::Vector2(fixed::ONE, 0));
        pump(&relay, &mut [&mut a, &mut b], &mut now, 1);
    }
    // Flush the input-delay pipeline.
    pump(&relay, &mut [&mut a, &mut b], &mut now, 8);

    assert_eq!(a.frame(), b.frame());
    assert_eq!(a.state_hash(), b.state_hash());
    assert_eq!(cell_x(&a, "p1") - start_x, fixed::from_int(10));
    assert_eq!(cell_x(&b, "p1"), cell_x(&a, "p1"));

    // Nothing should have mispredicted under symmetric input delay.
    assert_eq!(a.rollback_stats().rollback_count, 0);
    assert_eq!(b.rollback_stats().rollback_count, 0);
}

#[test]
fn hashes_stay_equal_under_cross_traffic() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    pump(&relay, &mut [&mut a, &mut b], &mut now, 15);

    for step in 0..40 {
        if step % 2 == 0 {
            a.queue_input(MOVE, ActionValue::Vector2(fixed::ONE, -fixed::ONE));
        }
        if step % 3 == 0 {
            b.queue_input(MOVE, ActionValue::Vector2(0, fixed::ONE / 2));
        }
        pump(&relay, &mut [&mut a, &mut b], &mut now, 1);
    }
    pump(&relay, &mut [&mut a, &mut b], &mut now, 8);

    assert_eq!(a.frame(), b.frame());
    assert_eq!(a.state_hash(), b.state_hash());
    assert!(a.sync_percent() > 99.0);
    assert!(b.sync_percent() > 99.0);
}

#[test]
fn late_joiner_adopts_authority_snapshot() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    a.connect(relay.connect("p1")).unwrap();

    let mut now = 0;
    pump(&relay, &mut [&mut a], &mut now, 20);
    assert_eq!(a.state(), SessionState::Connected);

    // Build up some state before anyone else shows up.
    for _ in 0..10 {
        a.queue_input(MOVE, ActionValue::Vector2(fixed::ONE, 0));
        pump(&relay, &mut [&mut a], &mut now, 1);
    }
    let pre_join_frame = a.frame();
    assert!(pre_join_frame > 10);

    let mut b = build_session();
    b.connect(relay.connect("p2")).unwrap();
    pump(&relay, &mut [&mut a, &mut b], &mut now, 20);

    assert_eq!(b.state(), SessionState::Connected);
    // The joiner re-derived the active set from player-bearing entities.
    assert_eq!(a.active_clients(), b.active_clients());
    assert_eq!(b.active_clients().len(), 2);

    pump(&relay, &mut [&mut a, &mut b], &mut now, 10);
    assert_eq!(a.frame(), b.frame());
    assert_eq!(a.state_hash(), b.state_hash());
    assert_eq!(
        a.store().entity_count(),
        b.store().entity_count()
    );
    assert_eq!(cell_x(&b, "p1"), cell_x(&a, "p1"));
}

#[test]
fn forced_divergence_recovers_via_resync() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    pump(&relay, &mut [&mut a, &mut b], &mut now, 20);
    assert_eq!(b.sync_state(), SyncState::Active);

    // A one-off rogue write on B, as if a side effect escaped the tick.
    {
        let store = b.store_mut();
        let x = store.field_ref("transform", "x").unwrap();
        let victim = store.entities()[0];
        store.set_fixed(victim, x, fixed::from_int(9999)).unwrap();
    }

    // Drift is detected, escalated to desync and recovered from the
    // authority snapshot.
    pump(&relay, &mut [&mut a, &mut b], &mut now, 30);

    assert_eq!(b.sync_state(), SyncState::Active);
    assert!(b.sync_stats().resync_count >= 1);
    assert_eq!(a.sync_stats().resync_count, 0);

    let report = b.last_desync_report().expect("desync report retained");
    assert!(report.diff.is_some());

    pump(&relay, &mut [&mut a, &mut b], &mut now, 4);
    assert_eq!(a.frame(), b.frame());
    assert_eq!(a.state_hash(), b.state_hash());
}

#[test]
fn gross_divergence_escalates_on_magnitude() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    pump(&relay, &mut [&mut a, &mut b], &mut now, 20);
    assert_eq!(b.sync_state(), SyncState::Active);

    // Clobber most of B's world: both cells, both transform fields.
    {
        let store = b.store_mut();
        let x = store.field_ref("transform", "x").unwrap();
        let y = store.field_ref("transform", "y").unwrap();
        for id in store.entities() {
            store.set_fixed(id, x, fixed::from_int(-4444)).unwrap();
            store.set_fixed(id, y, fixed::from_int(4444)).unwrap();
        }
    }

    pump(&relay, &mut [&mut a, &mut b], &mut now, 30);

    // The drift probe's field diff crossed the magnitude threshold, so the
    // desync was declared before three mismatches could accumulate.
    assert_eq!(b.sync_state(), SyncState::Active);
    assert!(b.sync_stats().resync_count >= 1);
    assert!(b.sync_stats().mismatches <= 2, "stats: {:?}", b.sync_stats());

    let report = b.last_desync_report().expect("desync report retained");
    let diff = report.diff.as_ref().expect("probe diff attached");
    assert!(diff.magnitude() > lockstep::sync::DESYNC_MAGNITUDE_THRESHOLD);

    pump(&relay, &mut [&mut a, &mut b], &mut now, 4);
    assert_eq!(a.frame(), b.frame());
    assert_eq!(a.state_hash(), b.state_hash());
}

#[test]
fn leave_despawns_on_all_participants() {
    let relay = LocalRelay::new(0, TICK_MS as u32);
    let mut a = build_session();
    let mut b = build_session();
    a.connect(relay.connect("p1")).unwrap();
    b.connect(relay.connect("p2")).unwrap();

    let mut now = 0;
    pump(&relay, &mut [&mut a, &mut b], &mut now, 15);
    assert_eq!(a.store().entity_count(), 2);

    b.stop();
    pump(&relay, &mut [&mut a], &mut now, 10);

    assert_eq!(a.store().entity_count(), 1);
    assert!(!a.active_clients().contains("p2"));
    assert!(a.is_authority());
}

//! Headless demo: a tiny "wandering cells" game running either as a
//! single local session or as several lockstep participants over the
//! in-process relay, printing per-frame digests and final sync stats.

use anyhow::Result;
use clap::Parser;
use log::info;

use lockstep::store::{FieldDef, Phase};
use lockstep::{
    fixed, ActionId, ActionValue, ExitReason, FieldValue, LocalRelay, LocalTransport, Session,
    SessionCallbacks, SessionConfig, SessionState,
};

const MOVE: ActionId = 0;

#[derive(Parser)]
#[command(name = "lockstep-demo")]
#[command(about = "Headless lockstep engine demo")]
struct Args {
    /// Number of in-process participants (1 = local mode, no relay).
    #[arg(short, long, default_value_t = 2)]
    participants: usize,

    /// Simulated wall-clock seconds to run.
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,

    /// Simulation tick rate.
    #[arg(short, long, default_value_t = 20)]
    tick_rate: u32,

    /// Print the state digest every N frames (0 = quiet).
    #[arg(long, default_value_t = 20)]
    report_every: u32,
}

fn build_session(tick_rate: u32) -> Session<LocalTransport> {
    let mut config = SessionConfig::default();
    config.tick_rate = tick_rate;
    config.seed = 2024;
    let mut session = Session::new(config);

    session
        .define_component(
            "transform",
            vec![
                FieldDef::new("x", FieldValue::fixed(0)),
                FieldDef::new("y", FieldValue::fixed(0)),
            ],
        )
        .expect("schema registers before start");
    session
        .define_component(
            "body",
            vec![FieldDef::new("heading", FieldValue::fixed(0))],
        )
        .expect("schema registers before start");
    session
        .define_entity("cell")
        .with("transform")
        .with("body")
        .register()
        .expect("entity type registers before start");
    assert_eq!(session.define_action("move"), MOVE);

    session.add_system(
        Phase::Update,
        "movement",
        Box::new(|store| {
            let x = store.field_ref("transform", "x")?;
            let heading = store.field_ref("body", "heading")?;
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
                let jitter = store.random_fixed() / 16;
                let h = store.get_fixed(id, heading)?.wrapping_add(jitter);
                store.set_fixed(id, heading, h)?;
                let v = store.get_fixed(id, x)?;
                store.set_fixed(id, x, v + mx)?;
            }
            Ok(())
        }),
    );

    session.init(
        SessionCallbacks::new()
            .on_room_create(|_store| info!("room created"))
            .on_connect(|store, client| {
                let id = store
                    .create_entity("cell", Some(client))
                    .expect("cell spawns");
                info!("spawned cell {:#010x} for {client}", id.raw());
            })
            .on_disconnect(|store, client| {
                for id in store.entities() {
                    if store.entity_client(id) == Some(client) {
                        store.destroy_entity(id).expect("cell despawns");
                    }
                }
                info!("despawned cells of {client}");
            }),
    );
    session
}

fn run_local(args: &Args) -> ExitReason {
    let mut session = build_session(args.tick_rate);
    session.start().expect("session starts");

    let interval = 1000 / args.tick_rate as i64;
    let steps = args.seconds as i64 * 1000 / interval;
    for step in 0..=steps {
        let now = step * interval;
        session.queue_input(MOVE, ActionValue::Scalar(fixed::ONE / 4));
        if session.update(now).is_err() {
            break;
        }
        if args.report_every > 0 && session.frame() % args.report_every == 0 && session.frame() > 0
        {
            println!(
                "frame {:>5}  hash {:#010x}",
                session.frame(),
                session.state_hash()
            );
        }
    }
    session.stop();
    session.exit_reason().unwrap_or(ExitReason::Clean)
}

fn run_relay(args: &Args) -> ExitReason {
    let interval = 1000 / args.tick_rate as i64;
    let relay = LocalRelay::new(0, interval as u32);

    let mut sessions: Vec<Session<LocalTransport>> = (0..args.participants)
        .map(|i| {
            let mut session = build_session(args.tick_rate);
            session
                .connect(relay.connect(&format!("player-{i}")))
                .expect("session connects");
            session
        })
        .collect();

    let steps = args.seconds as i64 * 1000 / interval;
    let mut exit = ExitReason::Clean;
    'outer: for step in 1..=steps {
        let now = step * interval;
        for (i, session) in sessions.iter_mut().enumerate() {
            // Every participant drifts rightward at its own pace.
            session.queue_input(MOVE, ActionValue::Scalar(fixed::ONE / (i as i32 + 2)));
            if session.update(now).is_err() {
                exit = session.exit_reason().unwrap_or(ExitReason::TransportClosed);
                break 'outer;
            }
        }
        relay.advance(now);

        if args.report_every > 0 && step % args.report_every as i64 == 0 {
            let line: Vec<String> = sessions
                .iter()
                .map(|s| format!("{}@{}={:#010x}", s.client_id(), s.frame(), s.state_hash()))
                .collect();
            println!("{}", line.join("  "));
        }
    }

    let connected = sessions
        .iter()
        .filter(|s| s.state() == SessionState::Connected)
        .count();
    println!("connected participants: {connected}/{}", sessions.len());
    for session in &sessions {
        let stats = session.sync_stats();
        let rollbacks = session.rollback_stats();
        println!(
            "{}: frame {} sync {:.1}% (checks {}, mismatches {}, resyncs {}) rollbacks {} (max depth {})",
            session.client_id(),
            session.frame(),
            session.sync_percent(),
            stats.checks,
            stats.mismatches,
            stats.resync_count,
            rollbacks.rollback_count,
            rollbacks.max_rollback_depth,
        );
    }

    // A run only counts as clean if everyone agreed at the end.
    let frames: Vec<_> = sessions.iter().map(|s| s.frame()).collect();
    let hashes: Vec<_> = sessions.iter().map(|s| s.state_hash()).collect();
    if frames.windows(2).all(|w| w[0] == w[1]) && hashes.windows(2).all(|w| w[0] == w[1]) {
        println!(
            "final digest agreement at frame {}: {:#010x}",
            frames[0], hashes[0]
        );
    } else if exit == ExitReason::Clean {
        exit = ExitReason::UnrecoverableDesync;
    }

    for session in &mut sessions {
        session.stop();
        if let Some(reason) = session.exit_reason() {
            if reason != ExitReason::Clean && exit == ExitReason::Clean {
                exit = reason;
            }
        }
    }
    exit
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let exit = if args.participants <= 1 {
        run_local(&args)
    } else {
        run_relay(&args)
    };

    info!("exiting: {exit:?}");
    std::process::exit(exit.exit_code());
}

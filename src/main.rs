use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use fragment_core::ids::{CategoryId, GuildId, RoomId, UserId};
use fragment_core::provider::RoomProvider;
use fragment_core::rooms::ParentRoomConfig;
use fragment_engine::{
    recover_orphans, ControllerConfig, LifecycleController, MemoryProvider, OwnershipLedger,
};
use fragment_server::{BridgeProvider, ClientRegistry, HandlerState, ServerConfig};
use fragment_settings::{load_settings, load_settings_from_path, resolve_path, FragmentSettings};
use fragment_store::ownership::OwnershipRepo;
use fragment_store::parents::ParentRepo;
use fragment_store::{Database, StoreError, StoreRegistry};
use fragment_telemetry::{init_telemetry, TelemetryConfig};

/// Ephemeral voice-room controller daemon.
#[derive(Debug, Parser)]
#[command(name = "fragment", version)]
struct Cli {
    /// Settings file (defaults to ~/.fragment/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding settings and FRAGMENT_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Run against an in-memory platform with simulated voice traffic
    /// instead of waiting for a platform bridge.
    #[arg(long)]
    simulate: bool,
}

const DEMO_GUILD: GuildId = GuildId::new(1);
const DEMO_CATEGORY: CategoryId = CategoryId::new(1);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let log_db_path = resolve_path(&settings.logging.log_db_path);
    if settings.logging.log_to_sqlite {
        if let Some(parent) = log_db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.clone(),
        json: true,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path,
    }));

    tracing::info!(simulate = cli.simulate, "starting fragment");

    let db = if cli.simulate {
        Database::in_memory()
    } else {
        Database::open(&resolve_path(&settings.database.path))
    }
    .context("failed to open database")?;

    let history = OwnershipRepo::new(db.clone());
    let ledger = Arc::new(OwnershipLedger::with_mirror(Arc::new(history.clone())));
    let clients = Arc::new(ClientRegistry::new(settings.server.max_send_queue));

    let mut bridge: Option<Arc<BridgeProvider>> = None;
    let mut simulator: Option<Arc<MemoryProvider>> = None;
    let provider: Arc<dyn RoomProvider> = if cli.simulate {
        let memory = Arc::new(MemoryProvider::new());
        simulator = Some(Arc::clone(&memory));
        memory
    } else {
        let remote = Arc::new(BridgeProvider::new(
            Arc::clone(&clients),
            Duration::from_secs(settings.bridge.request_timeout_secs),
        ));
        bridge = Some(Arc::clone(&remote));
        remote
    };

    let controller = LifecycleController::new(
        Arc::new(StoreRegistry::new(db.clone())),
        provider,
        ledger,
        ControllerConfig::from(&settings.controller),
    );
    let (handle, dispatch_task) = controller.start();

    let mut state = HandlerState::new(controller.clone(), handle.clone(), db.clone(), clients)
        .with_telemetry(Arc::clone(&telemetry));
    if let Some(ref bridge) = bridge {
        state = state.with_bridge(Arc::clone(bridge));
    }

    let server = fragment_server::start(ServerConfig::from(&settings.server), Arc::new(state))
        .await
        .context("failed to start server")?;
    tracing::info!(port = server.port, "fragment ready");

    if let Some(memory) = simulator {
        memory.attach(handle.sender());
        let demo = seed_demo(&memory, &db).context("failed to seed demo guild")?;
        tokio::spawn(simulate_traffic(memory, demo, controller.cancel_token()));
    }

    if settings.controller.recover_on_startup {
        spawn_recovery(controller.clone(), history, &settings);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    controller.shutdown();
    let _ = dispatch_task.await;
    server.stopped().await;
    Ok(())
}

/// Recovery needs the platform, so with a bridge it waits for one to attach.
fn spawn_recovery(controller: LifecycleController, history: OwnershipRepo, settings: &FragmentSettings) {
    let poll = Duration::from_secs(settings.bridge.request_timeout_secs.clamp(1, 5));
    tokio::spawn(async move {
        let cancel = controller.cancel_token();
        loop {
            let report = recover_orphans(&controller, Some(&history)).await;
            if report.failed == 0 {
                return;
            }
            tracing::warn!(failed = report.failed, "recovery incomplete, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    });
}

/// Rooms of the simulated guild.
#[derive(Clone, Copy, Debug)]
struct DemoGuild {
    lobby: RoomId,
    afk: RoomId,
}

/// One guild with a "Lobby" parent and an AFK room. The AFK room is
/// registered as a parent too; joining it must still never spawn a fragment.
fn seed_demo(memory: &MemoryProvider, db: &Database) -> Result<DemoGuild, StoreError> {
    let lobby = memory.add_room(DEMO_GUILD, "Lobby", Some(DEMO_CATEGORY));
    let afk = memory.add_room(DEMO_GUILD, "AFK", Some(DEMO_CATEGORY));
    memory.set_afk(DEMO_GUILD, afk);

    let parents = ParentRepo::new(db.clone());
    for (room_id, name) in [(lobby, "Lobby"), (afk, "AFK")] {
        parents.register(&ParentRoomConfig {
            room_id,
            category_id: DEMO_CATEGORY,
            guild_id: DEMO_GUILD,
            name: name.to_string(),
        })?;
    }
    Ok(DemoGuild { lobby, afk })
}

/// Advance one member: absent joins the lobby, anyone in a fragment idles
/// into AFK, and AFK members hang up.
async fn simulate_step(memory: &MemoryProvider, demo: DemoGuild, user: UserId) {
    match memory.location(DEMO_GUILD, user) {
        None => memory.connect(DEMO_GUILD, user, demo.lobby).await,
        Some(room) if room == demo.afk => memory.disconnect(DEMO_GUILD, user).await,
        Some(_) => memory.connect(DEMO_GUILD, user, demo.afk).await,
    }
}

/// Five members take turns.
async fn simulate_traffic(
    memory: Arc<MemoryProvider>,
    demo: DemoGuild,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    for tick in 0u64.. {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        simulate_step(&memory, demo, UserId::new(100 + tick % 5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragment_core::events::LifecycleEvent;

    async fn next(events: &mut tokio::sync::broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn demo_member_cycles_through_lobby_fragment_and_afk() {
        let db = Database::in_memory().unwrap();
        let memory = Arc::new(MemoryProvider::new());
        let demo = seed_demo(&memory, &db).unwrap();
        assert_eq!(memory.afk_room(DEMO_GUILD).await.unwrap(), Some(demo.afk));

        let controller = LifecycleController::new(
            Arc::new(StoreRegistry::new(db)),
            memory.clone(),
            Arc::new(OwnershipLedger::new()),
            ControllerConfig::default(),
        );
        let (handle, _dispatch) = controller.start();
        memory.attach(handle.sender());
        let mut events = controller.subscribe();

        let user = UserId::new(100);
        simulate_step(&memory, demo, user).await;
        let fragment = match next(&mut events).await {
            LifecycleEvent::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected room_created, got {other:?}"),
        };
        assert_eq!(memory.location(DEMO_GUILD, user), Some(fragment));

        // Idling into AFK empties the fragment without spawning a new one.
        simulate_step(&memory, demo, user).await;
        assert_eq!(next(&mut events).await.event_type(), "room_reaped");
        assert_eq!(memory.location(DEMO_GUILD, user), Some(demo.afk));
        assert_eq!(controller.rooms().len(), 0);

        simulate_step(&memory, demo, user).await;
        assert_eq!(memory.location(DEMO_GUILD, user), None);
        controller.shutdown();
    }
}

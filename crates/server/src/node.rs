use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use strata::{
    Connection, Dispatcher, ReplicationHistory, Replicator, Scheduler, Server, TransportEvent,
    World,
};

use crate::config::NodeConfig;
use crate::simulation::{Drone, SCENE, registry, simulate_world, spawn_drones};

const SCHEDULER_RESOLUTION: Duration = Duration::from_millis(1);
const EVENT_POLL: Duration = Duration::from_millis(50);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn period(rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / rate.max(1) as f64)
}

/// Runs the authoritative side until `running` clears.
pub fn run_server(config: &NodeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let history = Arc::new(ReplicationHistory::new(registry()?, config.history.clone()));
    let replicator = Arc::new(Replicator::new(Arc::clone(&history)));
    let server = Arc::new(
        Server::bind(
            config.bind_addr(),
            Arc::new(Dispatcher::new()),
            config.transport.clone(),
        )
        .with_context(|| format!("binding {}", config.bind_addr()))?,
    );
    log::info!("server listening on {}", server.local_addr());

    let world = Arc::new(World::new(SCENE));
    spawn_drones(&world, config.object_count);

    let scheduler = Scheduler::start(SCHEDULER_RESOLUTION)?;
    let start = Instant::now();
    let dt = 1.0 / config.tick_rate.max(1) as f32;
    {
        let world = Arc::clone(&world);
        let history = Arc::clone(&history);
        scheduler.add_task(period(config.tick_rate), move || {
            simulate_world(&world, dt);
            let now = start.elapsed().as_millis() as u64;
            history.log(&*world, now);
            history.prune(SCENE, now);
        });
    }
    {
        let server = Arc::clone(&server);
        let replicator = Arc::clone(&replicator);
        scheduler.add_task(period(config.sync_rate), move || {
            replicator.sync_all(&server);
        });
    }
    {
        let server = Arc::clone(&server);
        scheduler.add_task(config.transport.heartbeat_interval(), move || server.tick());
    }

    while running.load(Ordering::SeqCst) {
        for event in server.events() {
            match event {
                TransportEvent::Connected(addr) => {
                    log::info!("{addr} joined, {} connected", server.connected_count());
                    replicator.add_peer(addr);
                }
                TransportEvent::Disconnected { addr, reason } => {
                    log::info!("{addr} left: {reason:?}");
                    replicator.remove_peer(&addr);
                }
            }
        }
        thread::sleep(EVENT_POLL);
    }

    log::info!("server shutting down");
    scheduler.shutdown();
    server.shutdown();
    Ok(())
}

/// Joins `address` and reports interpolated drone state until the
/// connection drops or `running` clears.
pub fn run_client(
    config: &NodeConfig,
    address: &str,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let history = Arc::new(ReplicationHistory::new(registry()?, config.history.clone()));
    let replicator = Arc::new(Replicator::new(Arc::clone(&history)));
    let dispatcher = Arc::new(Dispatcher::new());
    replicator.install(&dispatcher);

    let connection = Arc::new(
        Connection::connect(address, dispatcher, config.transport.clone())
            .with_context(|| format!("connecting to {address}"))?,
    );
    if !connection.wait_connected(CONNECT_TIMEOUT) {
        bail!("no handshake from {address} within {CONNECT_TIMEOUT:?}");
    }
    log::info!("connected to {} from {}", connection.remote_addr(), connection.local_addr());

    let scheduler = Scheduler::start(SCHEDULER_RESOLUTION)?;
    {
        let connection = Arc::clone(&connection);
        scheduler.add_task(config.transport.heartbeat_interval(), move || connection.tick());
    }
    {
        let history = Arc::clone(&history);
        let connection = Arc::clone(&connection);
        let delay = config.interpolation_delay_ms;
        scheduler.add_task(REPORT_INTERVAL, move || {
            let Some(newest) = history.scene(SCENE).and_then(|scene| scene.last_timestamp()) else {
                log::info!("waiting for state");
                return;
            };
            let at = newest.saturating_sub(delay);
            report(&history, at);
            log::info!("{:?}", connection.stats());
            history.prune(SCENE, newest);
        });
    }

    while running.load(Ordering::SeqCst) && connection.is_connected() {
        for event in connection.events() {
            log::info!("{event:?}");
        }
        thread::sleep(EVENT_POLL);
    }

    scheduler.shutdown();
    if connection.is_connected() {
        connection.disconnect();
    } else {
        for event in connection.events() {
            log::info!("{event:?}");
        }
    }
    Ok(())
}

fn report(history: &ReplicationHistory, at: u64) {
    let objects = history.get_objects(SCENE, at);
    log::info!("t={at}ms: {} drones", objects.len());
    for (id, object) in &objects {
        if let Some(drone) = object.as_any().downcast_ref::<Drone>() {
            let p = drone.transform.position;
            log::info!(
                "  {id} at ({:6.2}, {:6.2}, {:6.2}) bounces {}",
                p.x,
                p.y,
                p.z,
                drone.bounces
            );
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{error, info, warn};
use wheelsim::{
    command_slot, BroadcastSink, CommandSender, EmulatorConfig, PointField, SimulationLoop,
    Snapshot, SnapshotSink, TickScheduler,
};

const SNAPSHOT_BROADCAST_BUFFER_SIZE: usize = 256;
// Stick positions are re-sent at this period so the deadman stays fed.
const STICK_REPEAT_MS: u64 = 100;

/// Mirrors the loop's sim time for producers outside the loop.
#[derive(Clone, Default)]
struct SimClock(Arc<AtomicU64>);

impl SimClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl SnapshotSink for SimClock {
    fn publish(&mut self, snapshot: &Snapshot) {
        self.0.store(snapshot.time.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stick {
    linear: f64,
    angular: f64,
    emergency_stop: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("♿ Wheelchair Control Simulator (real time)");
    println!("==========================================");
    println!("Commands: <linear> <angular> | stop | estop | reset | pause | resume | quit");

    let config = match std::env::args().nth(1) {
        Some(path) => EmulatorConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => EmulatorConfig::default(),
    };

    let scheduler = TickScheduler::new(&config.simulation)?;
    let handle = scheduler.handle();

    let mut sim = SimulationLoop::emulated(config, PointField::default())?;
    let (sender, controller) = command_slot();
    sim.set_controller(controller);

    let clock = SimClock::default();
    sim.add_sink(clock.clone());

    let (broadcast, mut snapshots) = BroadcastSink::new(SNAPSHOT_BROADCAST_BUFFER_SIZE);
    sim.add_sink(broadcast);

    // Once a second, report where the chair is.
    let monitor = tokio::spawn(async move {
        let mut last_report = 0.0;
        loop {
            match snapshots.recv().await {
                Ok(s) if s.time - last_report >= 1.0 => {
                    last_report = s.time;
                    info!(
                        "t={:.1}s pose=({:.2}, {:.2}, {:.2}) v={:.2} ω={:.2} soc={:.1}% limit={:?}",
                        s.time,
                        s.state.x,
                        s.state.y,
                        s.state.theta,
                        s.state.linear_velocity,
                        s.state.angular_velocity,
                        s.power.state_of_charge * 100.0,
                        s.safety.active_limit_reason
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("monitor lagged, {} snapshots dropped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let stick = Arc::new(Mutex::new(Stick::default()));
    let sender = Arc::new(sender);

    let repeater = {
        let stick = Arc::clone(&stick);
        let sender = Arc::clone(&sender);
        let clock = clock.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(STICK_REPEAT_MS));
            loop {
                interval.tick().await;
                let s = *stick.lock().await;
                submit(&sender, &clock, s);
            }
        })
    };

    let input = {
        let handle = handle.clone();
        let stick = Arc::clone(&stick);
        let sender = Arc::clone(&sender);
        let clock = clock.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut s = stick.lock().await;
                match line.trim() {
                    "quit" | "exit" => {
                        handle.stop();
                        break;
                    }
                    "stop" => *s = Stick::default(),
                    "estop" => s.emergency_stop = true,
                    "reset" => {
                        s.emergency_stop = false;
                        submit(&sender, &clock, *s);
                        handle.request_estop_reset();
                        continue;
                    }
                    "pause" => handle.pause(),
                    "resume" => handle.resume(),
                    other => match parse_stick(other) {
                        Some((linear, angular)) => {
                            s.linear = linear;
                            s.angular = angular;
                        }
                        None => {
                            warn!("unrecognised input: {:?}", other);
                            continue;
                        }
                    },
                }
                submit(&sender, &clock, *s);
            }
        })
    };

    let ctrl_c = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, forcing stop");
                handle.force_stop();
            }
        })
    };

    let summary = scheduler.run(&mut sim).await;

    input.abort();
    repeater.abort();
    ctrl_c.abort();
    drop(sim);
    if let Err(e) = monitor.await {
        error!("monitor task failed: {}", e);
    }

    println!(
        "Simulator stopped after {} ticks ({:.1} s simulated, {} failed, {} overruns)",
        summary.ticks, summary.sim_time, summary.failed_ticks, summary.overruns
    );
    Ok(())
}

fn parse_stick(line: &str) -> Option<(f64, f64)> {
    let mut parts = line.split_whitespace().map(str::parse::<f64>);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(linear)), Some(Ok(angular)), None) => Some((linear, angular)),
        _ => None,
    }
}

fn submit(sender: &CommandSender, clock: &SimClock, stick: Stick) {
    sender.submit(stick.linear, stick.angular, clock.now(), stick.emergency_stop);
}

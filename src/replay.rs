//! Recording and bit-exact replay of emulated runs.
//!
//! A recording is JSON lines: a header with the configuration, obstacle set
//! and initial state, followed by one snapshot per line. Replaying feeds the
//! recorded requests back through a fresh emulated loop with the same seed
//! and compares every snapshot exactly.

use crate::config::EmulatorConfig;
use crate::error::{SimError, SimResult};
use crate::protocol::{DriveCommand, Snapshot};
use crate::simulation::{SimulationLoop, Subsystems};
use crate::subsystems::{Controller, PointField, WheelchairState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("recording has no header line")]
    MissingHeader,

    #[error(transparent)]
    Simulation(#[from] SimError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordingHeader {
    config: EmulatorConfig,
    obstacles: PointField,
    initial_state: WheelchairState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub config: EmulatorConfig,
    pub obstacles: PointField,
    pub initial_state: WheelchairState,
    pub snapshots: Vec<Snapshot>,
}

impl Recording {
    pub fn new(config: EmulatorConfig, obstacles: PointField, initial_state: WheelchairState) -> Self {
        Self {
            config,
            obstacles,
            initial_state,
            snapshots: Vec::new(),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Vec<Snapshot>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), RecordingError> {
        let header = RecordingHeader {
            config: self.config.clone(),
            obstacles: self.obstacles.clone(),
            initial_state: self.initial_state,
        };
        serde_json::to_writer(&mut writer, &header)
            .map_err(|source| RecordingError::Json { line: 1, source })?;
        writer.write_all(b"\n")?;

        for (index, snapshot) in self.snapshots.iter().enumerate() {
            serde_json::to_writer(&mut writer, snapshot)
                .map_err(|source| RecordingError::Json { line: index + 2, source })?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: BufRead>(reader: R) -> Result<Self, RecordingError> {
        let mut lines = reader.lines().enumerate();

        let header: RecordingHeader = loop {
            match lines.next() {
                Some((_, line)) if line.as_ref().map_or(false, |l| l.trim().is_empty()) => continue,
                Some((index, line)) => {
                    break serde_json::from_str(&line?)
                        .map_err(|source| RecordingError::Json { line: index + 1, source })?
                }
                None => return Err(RecordingError::MissingHeader),
            }
        };
        header.config.validate()?;

        let mut snapshots = Vec::new();
        for (index, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let snapshot = serde_json::from_str(&line)
                .map_err(|source| RecordingError::Json { line: index + 1, source })?;
            snapshots.push(snapshot);
        }

        Ok(Self {
            config: header.config,
            obstacles: header.obstacles,
            initial_state: header.initial_state,
            snapshots,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecordingError> {
        self.write_to(BufWriter::new(File::create(path)?))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }
}

/// Re-issues the recorded request of each tick, keyed by tick number.
struct ReplayController {
    requests: BTreeMap<u64, DriveCommand>,
    polls: u64,
}

impl ReplayController {
    fn new(snapshots: &[Snapshot]) -> Self {
        Self {
            requests: snapshots.iter().map(|s| (s.tick, s.requested)).collect(),
            polls: 0,
        }
    }
}

impl Controller for ReplayController {
    fn poll(&mut self, _now: f64) -> Option<DriveCommand> {
        self.polls += 1;
        self.requests.get(&self.polls).copied()
    }
}

/// Re-runs a recording and checks every snapshot is bit-identical. Returns
/// the number of snapshots verified.
pub fn verify_replay(recording: &Recording) -> SimResult<u64> {
    let config = recording.config.clone();
    let dt = config.simulation.timestep();
    let subsystems =
        Subsystems::emulated(&config)?.with_controller(ReplayController::new(&recording.snapshots));
    let mut sim = SimulationLoop::new(
        config,
        subsystems,
        Box::new(recording.obstacles.clone()),
        recording.initial_state,
    )?;

    let mut verified = 0;
    for expected in &recording.snapshots {
        let replayed = if expected.tick == sim.tick_count() {
            // No tick advance: the run ended in a forced stop.
            sim.force_stop()
        } else {
            while sim.tick_count() < expected.tick {
                sim.tick(dt).map_err(|e| SimError::ReplayMismatch {
                    tick: sim.tick_count(),
                    detail: format!("replayed tick failed: {e}"),
                })?;
            }
            sim.last_snapshot()
                .cloned()
                .ok_or_else(|| SimError::ReplayMismatch {
                    tick: expected.tick,
                    detail: "no snapshot was published".to_string(),
                })?
        };

        if let Some(detail) = first_difference(expected, &replayed) {
            return Err(SimError::ReplayMismatch {
                tick: expected.tick,
                detail,
            });
        }
        verified += 1;
    }

    info!(verified, "replay matched recording");
    Ok(verified)
}

fn first_difference(expected: &Snapshot, replayed: &Snapshot) -> Option<String> {
    let fields = [
        ("time", expected.time == replayed.time),
        ("state", expected.state == replayed.state),
        ("requested", expected.requested == replayed.requested),
        ("forwarded", expected.forwarded == replayed.forwarded),
        ("sensors", expected.sensors == replayed.sensors),
        ("power", expected.power == replayed.power),
        ("safety", expected.safety == replayed.safety),
    ];
    fields
        .iter()
        .find(|(_, same)| !same)
        .map(|(name, _)| format!("{name} differs"))
}

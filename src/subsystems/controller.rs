use crate::protocol::DriveCommand;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Source of operator intent. Not a safety authority: whatever it returns is
/// arbitrated before it reaches the drive.
pub trait Controller {
    /// The newest command issued since the last poll, if any.
    fn poll(&mut self, now: f64) -> Option<DriveCommand>;

    fn is_connected(&self) -> bool {
        true
    }

    /// Returns to the controller's starting point, if it has one.
    fn reset(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    /// Time at which the step is issued (s).
    pub at: f64,
    pub linear: f64,
    pub angular: f64,
    #[serde(default)]
    pub emergency_stop: bool,
}

impl ScriptStep {
    pub fn new(at: f64, linear: f64, angular: f64) -> Self {
        Self {
            at,
            linear,
            angular,
            emergency_stop: false,
        }
    }

    pub fn emergency_stop(at: f64) -> Self {
        Self {
            at,
            linear: 0.0,
            angular: 0.0,
            emergency_stop: true,
        }
    }
}

/// Plays back a time-tagged script. Steps that fall due between two polls
/// collapse into the newest one.
#[derive(Debug, Clone)]
pub struct ScriptedController {
    script: Vec<ScriptStep>,
    cursor: usize,
    next_sequence: u64,
    connected: bool,
}

impl ScriptedController {
    pub fn new(mut script: Vec<ScriptStep>) -> Self {
        script.sort_by(|a, b| a.at.total_cmp(&b.at));
        Self {
            script,
            cursor: 0,
            next_sequence: 1,
            connected: true,
        }
    }

    pub fn load_script(&mut self, mut script: Vec<ScriptStep>) {
        script.sort_by(|a, b| a.at.total_cmp(&b.at));
        self.script = script;
        self.cursor = 0;
    }

    /// Restarts playback from the first step. Sequence numbers keep counting.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn clear(&mut self) {
        self.script.clear();
        self.cursor = 0;
    }

    pub fn remaining(&self) -> usize {
        self.script.len() - self.cursor
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn connect(&mut self) {
        self.connected = true;
    }
}

impl Controller for ScriptedController {
    fn poll(&mut self, now: f64) -> Option<DriveCommand> {
        if !self.connected {
            return None;
        }

        let mut latest = None;
        while let Some(step) = self.script.get(self.cursor) {
            if step.at > now {
                break;
            }
            latest = Some(*step);
            self.cursor += 1;
        }

        latest.map(|step| {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            DriveCommand::new(step.linear, step.angular, sequence, step.at)
                .with_emergency_stop(step.emergency_stop)
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reset(&mut self) {
        self.rewind();
    }
}

/// An operator holding the stick: re-issues the same intent every poll.
#[derive(Debug, Clone)]
pub struct HeldController {
    linear: f64,
    angular: f64,
    emergency_stop: bool,
    next_sequence: u64,
    connected: bool,
}

impl HeldController {
    pub fn new(linear: f64, angular: f64) -> Self {
        Self {
            linear,
            angular,
            emergency_stop: false,
            next_sequence: 1,
            connected: true,
        }
    }

    pub fn set(&mut self, linear: f64, angular: f64) {
        self.linear = linear;
        self.angular = angular;
    }

    pub fn press_emergency_stop(&mut self, pressed: bool) {
        self.emergency_stop = pressed;
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn connect(&mut self) {
        self.connected = true;
    }
}

impl Controller for HeldController {
    fn poll(&mut self, now: f64) -> Option<DriveCommand> {
        if !self.connected {
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(
            DriveCommand::new(self.linear, self.angular, sequence, now)
                .with_emergency_stop(self.emergency_stop),
        )
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Creates the single-slot handoff between an asynchronous producer
/// (keyboard, gamepad, network) and the loop.
pub fn command_slot() -> (CommandSender, SlotController) {
    let (tx, rx) = watch::channel(None);
    (
        CommandSender {
            tx,
            next_sequence: AtomicU64::new(1),
        },
        SlotController {
            rx,
            last_sequence: 0,
        },
    )
}

/// Producer side of the slot. Each submit overwrites whatever the loop has
/// not read yet.
#[derive(Debug)]
pub struct CommandSender {
    tx: watch::Sender<Option<DriveCommand>>,
    next_sequence: AtomicU64,
}

impl CommandSender {
    pub fn submit(
        &self,
        linear: f64,
        angular: f64,
        timestamp: f64,
        emergency_stop: bool,
    ) -> DriveCommand {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let command = DriveCommand::new(linear, angular, sequence, timestamp)
            .with_emergency_stop(emergency_stop);
        self.tx.send_replace(Some(command));
        command
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct SlotController {
    rx: watch::Receiver<Option<DriveCommand>>,
    last_sequence: u64,
}

impl Controller for SlotController {
    fn poll(&mut self, _now: f64) -> Option<DriveCommand> {
        // The last value stays readable after the sender is gone.
        let latest = (*self.rx.borrow_and_update())?;
        if latest.sequence <= self.last_sequence {
            return None;
        }
        self.last_sequence = latest.sequence;
        Some(latest)
    }

    fn is_connected(&self) -> bool {
        self.rx.has_changed().is_ok()
    }
}

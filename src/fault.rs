use crate::error::SimError;
use crate::subsystems::SubsystemId;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_FAULT_HISTORY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub subsystem: SubsystemId,
    pub error: SimError,
    pub tick: u64,
    pub timestamp: f64,
    /// Sim time until the first clean tick afterwards, once resolved.
    pub duration: f64,
    pub resolved: bool,
}

/// Bounded log of tick-level faults. The oldest record is dropped when full.
#[derive(Debug, Default)]
pub struct FaultManager {
    fault_history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
}

impl FaultManager {
    pub fn new() -> Self {
        Self {
            fault_history: Vec::new(),
            next_fault_id: 1,
        }
    }

    pub fn record_fault(
        &mut self,
        subsystem: SubsystemId,
        error: SimError,
        tick: u64,
        timestamp: f64,
    ) -> u32 {
        let fault_id = self.next_fault_id;
        self.next_fault_id = self.next_fault_id.wrapping_add(1);

        if self.fault_history.is_full() {
            self.fault_history.remove(0);
        }

        let _ = self.fault_history.push(FaultRecord {
            id: fault_id,
            subsystem,
            error,
            tick,
            timestamp,
            duration: 0.0,
            resolved: false,
        });
        fault_id
    }

    pub fn resolve_fault(&mut self, fault_id: u32, timestamp: f64) -> bool {
        match self.fault_history.iter_mut().find(|f| f.id == fault_id) {
            Some(fault) if !fault.resolved => {
                fault.resolved = true;
                fault.duration = (timestamp - fault.timestamp).max(0.0);
                true
            }
            _ => false,
        }
    }

    /// Resolves every open fault; returns how many were closed.
    pub fn resolve_all(&mut self, timestamp: f64) -> usize {
        let mut resolved = 0;
        for fault in self.fault_history.iter_mut().filter(|f| !f.resolved) {
            fault.resolved = true;
            fault.duration = (timestamp - fault.timestamp).max(0.0);
            resolved += 1;
        }
        resolved
    }

    pub fn get_active_faults(&self) -> impl Iterator<Item = &FaultRecord> {
        self.fault_history.iter().filter(|f| !f.resolved)
    }

    pub fn has_active_faults(&self) -> bool {
        self.fault_history.iter().any(|f| !f.resolved)
    }

    pub fn get_fault_history(&self) -> &[FaultRecord] {
        &self.fault_history
    }

    pub fn clear_resolved_faults(&mut self) {
        self.fault_history.retain(|f| !f.resolved);
    }

    pub fn clear(&mut self) {
        self.fault_history.clear();
    }
}

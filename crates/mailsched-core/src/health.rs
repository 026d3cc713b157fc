//! Liveness tracking for the dispatcher and the delivery workers.
//!
//! Each long-running component registers under a name and heartbeats while
//! it is alive. External monitoring asks [`HealthRegistry::is_healthy`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Public snapshot of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub last_beat_ms_ago: u64,
    pub healthy: bool,
}

#[derive(Debug)]
pub struct HealthRegistry {
    beats: DashMap<String, Instant>,
    stale_after: Duration,
}

pub type HealthHandle = Arc<HealthRegistry>;

impl HealthRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            beats: DashMap::new(),
            stale_after,
        }
    }

    pub fn shared(stale_after: Duration) -> HealthHandle {
        Arc::new(Self::new(stale_after))
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Record that `name` is alive now. Registers it on first call.
    pub fn beat(&self, name: &str) {
        match self.beats.get_mut(name) {
            Some(mut at) => *at = Instant::now(),
            None => {
                self.beats.insert(name.to_string(), Instant::now());
            }
        }
    }

    /// Remove a component that stopped on purpose.
    pub fn retire(&self, name: &str) {
        self.beats.remove(name);
    }

    /// True when every registered component beat within `stale_after`.
    pub fn is_healthy(&self) -> bool {
        self.beats
            .iter()
            .all(|entry| entry.value().elapsed() <= self.stale_after)
    }

    pub fn snapshot(&self) -> Vec<ComponentHealth> {
        let mut out: Vec<ComponentHealth> = self
            .beats
            .iter()
            .map(|entry| {
                let age = entry.value().elapsed();
                ComponentHealth {
                    name: entry.key().clone(),
                    last_beat_ms_ago: age.as_millis() as u64,
                    healthy: age <= self.stale_after,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_healthy() {
        assert!(HealthRegistry::new(Duration::from_secs(1)).is_healthy());
    }

    #[test]
    fn stale_component_makes_registry_unhealthy() {
        let reg = HealthRegistry::new(Duration::from_millis(20));
        reg.beat("dispatcher");
        assert!(reg.is_healthy());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!reg.is_healthy());
        reg.beat("dispatcher");
        assert!(reg.is_healthy());
    }

    #[test]
    fn retired_component_is_forgotten() {
        let reg = HealthRegistry::new(Duration::from_millis(1));
        reg.beat("worker-0");
        std::thread::sleep(Duration::from_millis(5));
        reg.retire("worker-0");
        assert!(reg.is_healthy());
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let reg = HealthRegistry::new(Duration::from_secs(5));
        reg.beat("worker-1");
        reg.beat("dispatcher");
        let names: Vec<_> = reg.snapshot().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["dispatcher", "worker-1"]);
    }
}

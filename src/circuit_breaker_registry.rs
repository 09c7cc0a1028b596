//! Registry of named circuit breakers.
//!
//! The client creates one breaker per upstream service; the degradation
//! monitor reads snapshots of all of them through this registry.

use crate::circuit_breaker::{BreakerConfig, BreakerHealth, CircuitBreaker, CircuitState};
use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default, Clone, Debug)]
pub struct BreakerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker for `service`, creating it with `config` on first use.
    pub fn get_or_create(&self, service: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
            .clone()
    }

    /// Variant with an injected clock, for tests.
    pub fn get_or_create_with_clock<C: Clock + Clone + 'static>(
        &self,
        service: &str,
        config: BreakerConfig,
        clock: C,
    ) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config).with_clock(clock)))
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).get(service).cloned()
    }

    /// Snapshot of every registered breaker, sorted by service name.
    pub fn snapshot(&self) -> Vec<BreakerHealth> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<BreakerHealth> = map.values().map(|b| b.health()).collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        entries
    }

    /// Services whose breaker is currently open.
    pub fn open_services(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|h| h.state == CircuitState::Open)
            .map(|h| h.service)
            .collect()
    }

    pub fn any_open(&self) -> bool {
        !self.open_services().is_empty()
    }
}

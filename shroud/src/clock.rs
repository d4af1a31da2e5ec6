// shroud/src/clock.rs
//
// Logical millisecond clock anchored at engine creation. Built on
// tokio::time::Instant so paused-time tests advance it deterministically.

use tokio::time::Instant;

use crate::events::Millis;

#[derive(Debug, Clone, Copy)]
pub struct EngineClock {
    origin: Instant,
}

impl EngineClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

impl Default for EngineClock { fn default() -> Self { Self::new() } }

//! Synthetic multi-context event generator.
//!
//! Each execution context runs on its own blocking thread, stamps events
//! from a shared monotonic origin (so timestamps never decrease within a
//! context but interleave across contexts), and hands them to the registered
//! handlers synchronously.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::event::SyscallEvent;
use super::{EventHandler, EventSource};
use crate::config::SyntheticConfig;

/// Events produced between cancellation and pacing checks.
const BATCH: u64 = 256;

/// Deterministic per-context event generator (xorshift64*).
pub struct EventGenerator {
    context: u64,
    handles: u64,
    max_value: u64,
    state: u64,
}

impl EventGenerator {
    pub fn new(context: u64, handles: u64, max_value: u64) -> Self {
        Self {
            context,
            handles: handles.max(1),
            max_value,
            // Any non-zero seed works; mix the context in so contexts differ.
            state: 0x9E37_79B9_7F4A_7C15 ^ context.wrapping_mul(0xBF58_476D_1CE4_E5B9) | 1,
        }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Next event for this context, stamped `timestamp_ns`.
    #[inline]
    pub fn next_event(&mut self, timestamp_ns: u64) -> SyscallEvent {
        let handle = self.next_u64() % self.handles;
        let value = match self.max_value {
            0 => 0,
            max => 1 + self.next_u64() % max,
        };
        SyscallEvent::new(timestamp_ns, handle, self.context, value)
    }
}

pub struct SyntheticSource {
    cfg: SyntheticConfig,
    handlers: Vec<EventHandler>,
    tasks: Vec<JoinHandle<u64>>,
}

impl SyntheticSource {
    pub fn new(cfg: SyntheticConfig) -> Self {
        Self {
            cfg,
            handlers: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl EventSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let handlers = Arc::new(std::mem::take(&mut self.handlers));
        let origin = Instant::now();

        for context in 0..self.cfg.contexts as u64 {
            let generator = EventGenerator::new(context, self.cfg.handles, self.cfg.max_value);
            let handlers = Arc::clone(&handlers);
            let ctx = ctx.clone();
            let rate = self.cfg.events_per_second;
            let limit = self.cfg.max_events;

            self.tasks.push(tokio::task::spawn_blocking(move || {
                run_context(generator, origin, rate, limit, &handlers, &ctx)
            }));
        }

        info!(
            contexts = self.cfg.contexts,
            handles = self.cfg.handles,
            events_per_second = self.cfg.events_per_second,
            "synthetic source started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let mut total = 0u64;
        for task in self.tasks.drain(..) {
            total += task.await.context("waiting for synthetic context")?;
        }

        info!(events = total, "synthetic source stopped");
        Ok(())
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }
}

fn run_context(
    mut generator: EventGenerator,
    origin: Instant,
    rate: u64,
    limit: u64,
    handlers: &[EventHandler],
    ctx: &CancellationToken,
) -> u64 {
    let mut produced = 0u64;

    while !ctx.is_cancelled() && (limit == 0 || produced < limit) {
        let batch = if limit == 0 {
            BATCH
        } else {
            BATCH.min(limit - produced)
        };

        for _ in 0..batch {
            let ts = u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
            let event = generator.next_event(ts);
            for handler in handlers {
                handler(&event);
            }
        }
        produced += batch;

        if rate > 0 {
            let due = Duration::from_secs_f64(produced as f64 / rate as f64);
            let elapsed = origin.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }
    }

    debug!(context = generator.context, produced, "synthetic context exited");
    produced
}

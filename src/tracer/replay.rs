//! Replays a recorded file of raw event frames on a single context.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::event::{SyscallEvent, EVENT_FRAME_SIZE};
use super::parse::parse_events;
use super::{EventHandler, EventSource};
use crate::config::ReplayConfig;

/// Encodes events as a replay file body.
pub fn encode_frames(events: &[SyscallEvent]) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * EVENT_FRAME_SIZE);
    for ev in events {
        out.extend_from_slice(&ev.to_frame());
    }
    out
}

pub struct ReplaySource {
    cfg: ReplayConfig,
    handlers: Vec<EventHandler>,
    task: Option<JoinHandle<u64>>,
}

impl ReplaySource {
    pub fn new(cfg: ReplayConfig) -> Self {
        Self {
            cfg,
            handlers: Vec::new(),
            task: None,
        }
    }
}

impl EventSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let path = &self.cfg.path;
        let data = std::fs::read(path)
            .with_context(|| format!("reading replay file {}", path.display()))?;

        // Reject partial files before any event is delivered.
        parse_events(&data)
            .map(drop)
            .with_context(|| format!("decoding replay file {}", path.display()))?;

        let frames = data.len() / EVENT_FRAME_SIZE;
        let handlers = Arc::new(std::mem::take(&mut self.handlers));
        let pace = self.cfg.pace;

        self.task = Some(tokio::task::spawn_blocking(move || {
            replay(&data, pace, &handlers, &ctx)
        }));

        info!(path = %path.display(), frames, pace, "replay source started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            let delivered = task.await.context("waiting for replay task")?;
            info!(events = delivered, "replay source stopped");
        }
        Ok(())
    }

    fn on_event(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }
}

fn replay(data: &[u8], pace: bool, handlers: &[EventHandler], ctx: &CancellationToken) -> u64 {
    let Ok(events) = parse_events(data) else {
        return 0;
    };

    let origin = Instant::now();
    let mut first_ts = None;
    let mut delivered = 0u64;

    for event in events {
        if delivered % 256 == 0 && ctx.is_cancelled() {
            break;
        }

        if pace {
            let first = *first_ts.get_or_insert(event.timestamp_ns);
            let due = Duration::from_nanos(event.timestamp_ns.saturating_sub(first));
            let elapsed = origin.elapsed();
            if due > elapsed {
                std::thread::sleep(due - elapsed);
            }
        }

        for handler in handlers {
            handler(&event);
        }
        delivered += 1;
    }

    delivered
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use parking_lot::Mutex;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sysagg-replay-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn test_replays_in_order() {
        let events: Vec<_> = (0..5u64).map(|i| SyscallEvent::new(i * 100, i, 0, i + 1)).collect();
        let path = temp_path("order");
        std::fs::write(&path, encode_frames(&events)).expect("write");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut source = ReplaySource::new(ReplayConfig {
            path: path.clone(),
            pace: false,
        });
        let seen_h = Arc::clone(&seen);
        source.on_event(Box::new(move |ev| seen_h.lock().push(*ev)));

        source.start(CancellationToken::new()).await.expect("start");
        source.stop().await.expect("stop");
        let _ = std::fs::remove_file(&path);

        assert_eq!(*seen.lock(), events);
    }

    #[tokio::test]
    async fn test_rejects_partial_file() {
        let path = temp_path("partial");
        std::fs::write(&path, [0u8; EVENT_FRAME_SIZE + 3]).expect("write");

        let mut source = ReplaySource::new(ReplayConfig {
            path: path.clone(),
            pace: false,
        });
        let err = source.start(CancellationToken::new()).await.unwrap_err();
        let _ = std::fs::remove_file(&path);

        assert!(format!("{err:#}").contains("trailing bytes"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let mut source = ReplaySource::new(ReplayConfig {
            path: temp_path("missing"),
            pace: false,
        });
        let err = source.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("reading replay file"));
    }
}

pub mod event;
pub mod parse;
pub mod replay;
pub mod stats;
pub mod synthetic;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::event::SyscallEvent;
use self::replay::ReplaySource;
use self::synthetic::SyntheticSource;

/// Callback for every produced event. Called concurrently from every
/// execution context.
pub type EventHandler = Box<dyn Fn(&SyscallEvent) + Send + Sync>;

/// Produces syscall events on one or more execution contexts.
pub trait EventSource: Send {
    /// Returns the source name for logging.
    fn name(&self) -> &str;

    /// Spawn the execution contexts. They run until `ctx` is cancelled or the
    /// source is exhausted.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Wait for every execution context to exit.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Register a handler for produced events. Must be called before `start`.
    fn on_event(&mut self, handler: EventHandler);
}

/// Source dispatches to the configured event source.
///
/// Uses enum dispatch rather than trait objects so the async trait methods
/// need no boxing.
pub enum Source {
    Synthetic(SyntheticSource),
    Replay(ReplaySource),
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Self::Synthetic(s) => s.name(),
            Self::Replay(s) => s.name(),
        }
    }

    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        match self {
            Self::Synthetic(s) => s.start(ctx).await,
            Self::Replay(s) => s.start(ctx).await,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Synthetic(s) => s.stop().await,
            Self::Replay(s) => s.stop().await,
        }
    }

    pub fn on_event(&mut self, handler: EventHandler) {
        match self {
            Self::Synthetic(s) => s.on_event(handler),
            Self::Replay(s) => s.on_event(handler),
        }
    }
}

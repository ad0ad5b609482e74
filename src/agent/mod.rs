use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::OutputChannel;
use crate::config::{Config, SourceKind};
use crate::engine::{AggregationEngine, EngineMode};
use crate::export::health::HealthMetrics;
use crate::export::run_stats::RunStats;
use crate::sink::log::LogSink;
use crate::sink::raw::RawWindowSink;
use crate::sink::ChannelDrainer;
use crate::tracer::replay::ReplaySource;
use crate::tracer::stats::{Outcome, StatsSnapshot};
use crate::tracer::synthetic::SyntheticSource;
use crate::tracer::Source;

/// Agent orchestrates all components: event source, engine, output consumer,
/// health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    engine: Option<Arc<AggregationEngine>>,
    source: Option<Source>,
    consumer_task: Option<JoinHandle<()>>,
    /// Stops the event source; cancelled first on shutdown.
    source_cancel: CancellationToken,
    /// Stops the consumer and background monitors.
    cancel: CancellationToken,
    started: Option<Instant>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            engine: None,
            source: None,
            consumer_task: None,
            source_cancel: CancellationToken::new(),
            cancel: CancellationToken::new(),
            started: None,
        })
    }

    /// The running engine, once started.
    pub fn engine(&self) -> Option<&Arc<AggregationEngine>> {
        self.engine.as_ref()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start all components and begin processing events.
    pub async fn start(&mut self) -> Result<()> {
        self.started = Some(Instant::now());

        // 0. Start health metrics server.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Output channel.
        let channel = Arc::new(
            OutputChannel::new(self.cfg.channel.capacity).context("creating output channel")?,
        );
        self.health
            .channel_capacity_bytes
            .set(channel.capacity_bytes() as f64);

        // 2. Engine.
        let engine_cfg = self.cfg.engine_config();
        let engine = Arc::new(AggregationEngine::new(&engine_cfg, Arc::clone(&channel)));
        self.health
            .table_capacity
            .set(engine.table().capacity() as f64);
        info!(
            mode = ?engine_cfg.mode,
            window = ?engine_cfg.window,
            table_capacity = engine_cfg.table_capacity,
            channel_bytes = channel.capacity_bytes(),
            "engine created",
        );

        // 3. Output consumer.
        let consumer = channel
            .consumer()
            .ok_or_else(|| anyhow!("output channel consumer already taken"))?;
        let mut drainer = ChannelDrainer::new(consumer, engine.mode().record_layout())
            .with_health(Arc::clone(&self.health));
        drainer.add_sink(Box::new(LogSink::new(self.cfg.consumer.log_records)));
        if engine.mode() == EngineMode::PassThrough {
            drainer.add_sink(Box::new(RawWindowSink::new(self.cfg.consumer.raw_window)));
        }
        self.consumer_task = Some(tokio::spawn(
            drainer.run(self.cancel.child_token(), self.cfg.consumer.poll_interval),
        ));

        // 4. Event source.
        let mut source = match self.cfg.source.kind {
            SourceKind::Synthetic => {
                Source::Synthetic(SyntheticSource::new(self.cfg.source.synthetic.clone()))
            }
            SourceKind::Replay => Source::Replay(ReplaySource::new(self.cfg.source.replay.clone())),
        };

        let engine_ev = Arc::clone(&engine);
        source.on_event(Box::new(move |event| engine_ev.process(event)));

        source
            .start(self.source_cancel.clone())
            .await
            .with_context(|| format!("starting {} source", source.name()))?;

        self.engine = Some(engine);
        self.source = Some(source);

        // 5. Background monitors.
        self.spawn_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop producing events first so the final flush sees a quiet table.
        self.source_cancel.cancel();
        if let Some(source) = &mut self.source {
            if let Err(e) = source.stop().await {
                error!(error = %e, "error stopping event source");
            }
        }

        // Flush the partially filled window.
        if let Some(engine) = &self.engine {
            if engine.mode() == EngineMode::Aggregated {
                let trigger = engine.window().start_time().unwrap_or(0);
                if let Some(report) = engine.force_flush(trigger) {
                    info!(
                        live = report.live,
                        emitted = report.emitted,
                        "flushed final window"
                    );
                }
            }
        }

        // Consumer drains what is left, then exits.
        self.cancel.cancel();
        if let Some(task) = self.consumer_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "output consumer task failed");
            }
        }

        if let Some(engine) = &self.engine {
            let snapshot = engine.stats().snapshot();
            self.health.apply_stats(&snapshot);
            log_stats(&snapshot, "final engine stats");
        }

        if let (Some(path), Some(started)) = (&self.cfg.stats_path, self.started) {
            let run = RunStats::from_health(&self.health, started.elapsed());
            match run.append_to(path) {
                Ok(()) => info!(
                    path = %path.display(),
                    elapsed = ?run.elapsed,
                    "run stats written"
                ),
                Err(e) => error!(error = %format!("{e:#}"), "failed to write run stats"),
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background engine stats reporter.
    fn spawn_stats_reporter(&self) {
        let Some(engine) = self.engine.as_ref().map(Arc::clone) else {
            return;
        };
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = engine.stats().snapshot();
                        health.apply_stats(&snapshot);
                        health.table_live_entries.set(engine.table().count_live() as f64);
                        health.table_occupied_keys.set(engine.table().occupied() as f64);
                        health.channel_used_bytes.set(engine.channel().used_bytes() as f64);

                        if !snapshot.is_empty() {
                            log_stats(&snapshot, "engine stats");
                        }
                    }
                }
            }
        });
    }
}

fn log_stats(snapshot: &StatsSnapshot, message: &'static str) {
    info!(
        events = snapshot.get(Outcome::EventProcessed),
        rejected = snapshot.get(Outcome::UpsertRejected),
        flushes = snapshot.get(Outcome::Flush),
        records = snapshot.get(Outcome::RecordsEmitted),
        "{message}",
    );

    for (outcome, count) in snapshot.non_zero() {
        debug!(outcome = outcome.as_str(), count, "  by outcome");
    }
}

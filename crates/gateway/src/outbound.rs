//! Outbound delivery shaping.
//!
//! One shared IR is parsed per payload; the chunker splits it under the
//! channel's size limit; the channel's renderer emits its flavor; the
//! retry engine covers transient transport failures.  Markup rejections
//! fall back to a plain-text render of the same chunk instead of an
//! exponential retry.  When block streaming is enabled, assistant deltas
//! coalesce into blocks that ship while the run is still going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use sb_domain::channel::{ChannelConnector, OutboundChunk};
use sb_domain::config::{ChannelOverrides, Config, MarkupFlavor, ReplyThreading};
use sb_domain::envelope::{Envelope, Peer};
use sb_domain::error::ErrorKind;
use sb_format::{chunk, parse_markdown, render, ChunkParams, Coalescer, MarkerTable, ParseOptions};
use sb_providers::{is_transient_message, ProviderFailure, RetryEngine};
use sb_protocol::RunEvent;
use uuid::Uuid;

use crate::runtime::{EventBus, SILENT_REPLY};

pub struct OutboundShaper {
    config: Arc<Config>,
    retry: RetryEngine,
    connectors: RwLock<HashMap<String, Arc<dyn ChannelConnector>>>,
    markers: MarkerTable,
}

impl OutboundShaper {
    pub fn new(config: Arc<Config>) -> Self {
        let retry = RetryEngine::new(config.retry.clone());
        Self {
            config,
            retry,
            connectors: RwLock::new(HashMap::new()),
            markers: MarkerTable::default(),
        }
    }

    pub fn register_connector(&self, connector: Arc<dyn ChannelConnector>) {
        self.connectors
            .write()
            .insert(connector.name().to_owned(), connector);
    }

    pub fn connector(&self, channel: &str) -> Option<Arc<dyn ChannelConnector>> {
        self.connectors.read().get(channel).cloned()
    }

    pub fn connector_names(&self) -> Vec<String> {
        self.connectors.read().keys().cloned().collect()
    }

    fn channel_cfg(&self, channel: &str) -> ChannelOverrides {
        self.config.channels.get(channel).cloned().unwrap_or_default()
    }

    /// Drive delivery for one run: stream blocks out when the channel has
    /// block streaming enabled, otherwise ship the final payload after the
    /// terminal event.  `wait_budget` bounds how long we watch the run.
    pub async fn deliver_run(
        &self,
        events: Arc<EventBus>,
        run_id: Uuid,
        envelope: &Envelope,
        wait_budget: Duration,
    ) {
        let Some(connector) = self.connector(&envelope.channel) else {
            tracing::debug!(channel = %envelope.channel, "no connector registered, skipping delivery");
            return;
        };
        let cfg = self.channel_cfg(&envelope.channel);

        if connector.send_typing(&envelope.peer).await.is_err() {
            tracing::debug!(channel = %envelope.channel, "typing indicator failed");
        }

        let reply_to = match cfg.reply_threading {
            ReplyThreading::Auto => Some(envelope.message_id.clone()),
            ReplyThreading::Off => None,
        };

        if cfg.block_streaming {
            self.stream_blocks(events, run_id, envelope, &connector, &cfg, reply_to, wait_budget)
                .await;
        } else {
            let Some(result) = events.wait(run_id, wait_budget).await else {
                tracing::warn!(%run_id, "delivery wait exhausted");
                return;
            };
            if result.status != sb_domain::error::RunStatus::Ok {
                // Errors surface on the control plane; channels stay silent
                // unless a genuine final payload exists.
                return;
            }
            let final_text = events
                .run_store()
                .get(&run_id)
                .and_then(|r| r.final_text)
                .unwrap_or_default();
            let Some(text) = filter_silent(&final_text) else {
                tracing::debug!(%run_id, "silent reply, suppressing delivery");
                return;
            };
            self.deliver_text(&connector, &cfg, &envelope.peer, reply_to, &text)
                .await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_blocks(
        &self,
        events: Arc<EventBus>,
        run_id: Uuid,
        envelope: &Envelope,
        connector: &Arc<dyn ChannelConnector>,
        cfg: &ChannelOverrides,
        mut reply_to: Option<String>,
        wait_budget: Duration,
    ) {
        let mut rx = events.subscribe(run_id);
        let mut coalescer = Coalescer::new(&cfg.coalesce, cfg.chunk.min_chars);
        let deadline = tokio::time::Instant::now() + wait_budget;
        let mut tick = tokio::time::interval(Duration::from_millis(100));

        loop {
            let flushes: Vec<String> = tokio::select! {
                event = rx.recv() => match event {
                    Ok(RunEvent::Assistant { text, .. }) => {
                        coalescer.push(&text, Instant::now())
                    }
                    Ok(event) if event.is_terminal() => {
                        let mut out = Vec::new();
                        if let Some(last) = coalescer.finish() {
                            out.push(last);
                        }
                        for text in out {
                            if let Some(text) = filter_silent(&text) {
                                self.deliver_text(connector, cfg, &envelope.peer, reply_to.take(), &text)
                                    .await;
                            }
                        }
                        return;
                    }
                    Ok(_) => Vec::new(),
                    Err(broadcast::error::RecvError::Lagged(_)) => Vec::new(),
                    Err(broadcast::error::RecvError::Closed) => {
                        if let Some(last) = coalescer.finish() {
                            if let Some(text) = filter_silent(&last) {
                                self.deliver_text(connector, cfg, &envelope.peer, reply_to.take(), &text)
                                    .await;
                            }
                        }
                        return;
                    }
                },
                _ = tick.tick() => coalescer.poll_idle(Instant::now()).into_iter().collect(),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(%run_id, "streaming delivery budget exhausted");
                    return;
                }
            };

            for text in flushes {
                if let Some(text) = filter_silent(&text) {
                    self.deliver_text(connector, cfg, &envelope.peer, reply_to.take(), &text)
                        .await;
                }
            }
        }
    }

    /// Parse → chunk → render → send, with per-request retry and the
    /// plain-text fallback for markup rejections.
    pub async fn deliver_text(
        &self,
        connector: &Arc<dyn ChannelConnector>,
        cfg: &ChannelOverrides,
        peer: &Peer,
        mut reply_to: Option<String>,
        text: &str,
    ) {
        let ir = parse_markdown(text, ParseOptions { tables: cfg.parse_tables });

        let limit = connector.text_chunk_limit().max(1);
        let params = ChunkParams::new(
            cfg.chunk.min_chars,
            cfg.chunk.max_chars.min(limit),
            connector.chunk_mode(),
        );

        for piece in chunk(&ir, &params) {
            let rendered = render(&piece, cfg.flavor, &self.markers);
            let outcome = self
                .send_with_retry(connector, peer, reply_to.take(), rendered)
                .await;

            let failed_markup = match outcome {
                Ok(()) => false,
                Err(failure) => {
                    if is_markup_rejection(&failure.message) && cfg.flavor != MarkupFlavor::Plain {
                        true
                    } else {
                        tracing::warn!(
                            channel = connector.name(),
                            error = %failure.message,
                            "outbound send failed"
                        );
                        return;
                    }
                }
            };

            if failed_markup {
                // Markup rejected: plain-text retry of the same chunk.
                let plain = render(&piece, MarkupFlavor::Plain, &self.markers);
                if let Err(failure) = self
                    .send_with_retry(connector, peer, None, plain)
                    .await
                {
                    tracing::warn!(
                        channel = connector.name(),
                        error = %failure.message,
                        "plain-text fallback failed"
                    );
                    return;
                }
            }
        }
    }

    async fn send_with_retry(
        &self,
        connector: &Arc<dyn ChannelConnector>,
        peer: &Peer,
        reply_to: Option<String>,
        text: String,
    ) -> Result<(), ProviderFailure> {
        self.retry
            .execute("transport.send", |_| {
                let chunk = OutboundChunk { text: text.clone(), reply_to: reply_to.clone() };
                async move {
                    match connector.send(peer, chunk).await {
                        Ok(receipt) if receipt.ok => Ok(()),
                        Ok(receipt) => {
                            let message = receipt.error.unwrap_or_else(|| "send rejected".into());
                            Err(classify_transport(message))
                        }
                        Err(e) => Err(classify_transport(e.to_string())),
                    }
                }
            })
            .await
            .map(|_| ())
    }
}

fn classify_transport(message: String) -> ProviderFailure {
    let kind = if message.contains("429") || is_transient_message(&message) {
        ErrorKind::ProviderTransient
    } else {
        ErrorKind::ProviderFatal
    };
    ProviderFailure::new(kind, message)
}

fn is_markup_rejection(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["parse", "markup", "entity", "unsupported tag"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Strip the silent-reply sentinel.  Returns `None` when nothing should
/// reach the channel.
pub fn filter_silent(text: &str) -> Option<String> {
    let stripped = text.replace(SILENT_REPLY, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sb_domain::channel::{ChunkMode, SendReceipt};
    use sb_domain::error::Result as SbResult;

    struct FakeConnector {
        limit: usize,
        sent: Mutex<Vec<OutboundChunk>>,
        /// Errors to return before succeeding, per send position.
        fail_first: Mutex<Vec<String>>,
    }

    impl FakeConnector {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self {
                limit,
                sent: Mutex::new(Vec::new()),
                fail_first: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChannelConnector for FakeConnector {
        fn name(&self) -> &str {
            "fake"
        }

        async fn connect(&self) -> SbResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> SbResult<()> {
            Ok(())
        }

        async fn send(&self, _peer: &Peer, chunk: OutboundChunk) -> SbResult<SendReceipt> {
            if let Some(error) = self.fail_first.lock().pop() {
                return Ok(SendReceipt::failed(error));
            }
            self.sent.lock().push(chunk);
            Ok(SendReceipt::ok(format!("m{}", self.sent.lock().len())))
        }

        fn text_chunk_limit(&self) -> usize {
            self.limit
        }

        fn chunk_mode(&self) -> ChunkMode {
            ChunkMode::NewlinePreferred
        }
    }

    fn shaper() -> OutboundShaper {
        let mut config = Config::default();
        config.retry.min_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        OutboundShaper::new(Arc::new(config))
    }

    #[test]
    fn silent_filtering() {
        assert_eq!(filter_silent("NO_REPLY"), None);
        assert_eq!(filter_silent("  NO_REPLY  "), None);
        assert_eq!(filter_silent("hello"), Some("hello".into()));
        assert_eq!(filter_silent("NO_REPLY but text"), Some("but text".into()));
    }

    #[tokio::test]
    async fn long_text_chunks_under_limit() {
        let shaper = shaper();
        let connector = FakeConnector::new(40);
        let cfg = ChannelOverrides::default();
        let peer = Peer::direct("p1");

        let text = "word ".repeat(30);
        let arc: Arc<dyn ChannelConnector> = connector.clone();
        shaper.deliver_text(&arc, &cfg, &peer, Some("m0".into()), &text).await;

        let sent = connector.sent.lock();
        assert!(sent.len() > 1);
        for chunk in sent.iter() {
            assert!(chunk.text.chars().count() <= 40);
        }
        // Reply threading applies to the first chunk only.
        assert_eq!(sent[0].reply_to.as_deref(), Some("m0"));
        assert!(sent[1].reply_to.is_none());
    }

    #[tokio::test]
    async fn transient_error_retries() {
        let shaper = shaper();
        let connector = FakeConnector::new(1000);
        connector
            .fail_first
            .lock()
            .push("temporarily unavailable".into());
        let cfg = ChannelOverrides::default();

        let arc: Arc<dyn ChannelConnector> = connector.clone();
        shaper.deliver_text(&arc, &cfg, &Peer::direct("p"), None, "hi").await;
        assert_eq!(connector.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn markup_rejection_falls_back_to_plain() {
        let shaper = shaper();
        let connector = FakeConnector::new(1000);
        connector.fail_first.lock().push("can't parse entities".into());
        let cfg = ChannelOverrides {
            flavor: MarkupFlavor::Html,
            ..Default::default()
        };

        let arc: Arc<dyn ChannelConnector> = connector.clone();
        shaper
            .deliver_text(&arc, &cfg, &Peer::direct("p"), None, "**bold** move")
            .await;

        let sent = connector.sent.lock();
        assert_eq!(sent.len(), 1);
        // The delivered fallback is the plain render, not HTML.
        assert_eq!(sent[0].text, "bold move");
    }
}

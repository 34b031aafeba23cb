use crate::benchmark::TestConfiguration;
use crate::cpu::CpuMonitor;
use crate::envelope::{EnvelopeKind, SampleEnvelope, NOT_A_PING};
use crate::error::PerftestError;
use crate::ipc::{ChannelEvent, MessageChannel, PeerId};
use crate::printer::ReportPrinter;
use crate::throughput::{ThroughputSummary, ThroughputTotals, ThroughputTracker};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What a subscriber reports once every publisher has finished.
#[derive(Debug, Clone, Default)]
pub struct PongerOutcome {
    pub summaries: Vec<ThroughputSummary>,
    pub totals: ThroughputTotals,
    pub echoes_sent: u64,
    pub malformed_frames: u64,
    pub rejected_samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Subscriber side of the latency exchange.
///
/// Echoes the pings addressed to it, acknowledges end-of-size markers and
/// measures receive throughput per payload size.
pub struct Ponger {
    config: Arc<TestConfiguration>,
    channel: Box<dyn MessageChannel>,
    events: mpsc::Receiver<ChannelEvent>,
    printer: Box<dyn ReportPrinter>,
    tracker: ThroughputTracker,
    cpu: Option<CpuMonitor>,

    matched: HashSet<PeerId>,
    announced: bool,
    // Publisher entity ids seen on each peer connection.
    peer_entities: HashMap<PeerId, HashSet<i32>>,
    ended: HashSet<i32>,
    finished: HashSet<i32>,
    outcome: PongerOutcome,
}

impl Ponger {
    pub fn new(
        config: Arc<TestConfiguration>,
        mut channel: Box<dyn MessageChannel>,
        printer: Box<dyn ReportPrinter>,
    ) -> Result<Self> {
        let events = channel
            .take_events()
            .ok_or_else(|| PerftestError::Channel("event queue already taken".to_string()))?;
        let cpu = config.cpu.then(CpuMonitor::new);
        Ok(Self {
            config,
            channel,
            events,
            printer,
            tracker: ThroughputTracker::new(),
            cpu,
            matched: HashSet::new(),
            announced: false,
            peer_entities: HashMap::new(),
            ended: HashSet::new(),
            finished: HashSet::new(),
            outcome: PongerOutcome::default(),
        })
    }

    /// Serve until every publisher has sent `Finished` or all of them are gone.
    pub async fn run(mut self) -> Result<PongerOutcome> {
        self.printer.print_initial_output()?;
        info!(
            "Subscriber {} waiting for {} publisher(s)",
            self.config.sub_id, self.config.num_publishers
        );

        let discovery_deadline = Instant::now() + self.config.discovery_timeout;
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let flow = match event {
                        Some(event) => self.handle_event(event).await?,
                        None => Flow::Stop,
                    };
                    if flow == Flow::Stop {
                        break;
                    }
                }
                _ = ticker.tick() => self.report_interval(),
                _ = sleep_until(discovery_deadline), if !self.announced => {
                    return Err(PerftestError::TimeoutExceeded {
                        what: format!(
                            "{} publisher(s) ({} matched)",
                            self.config.num_publishers,
                            self.matched.len()
                        ),
                        waited_ms: self.config.discovery_timeout.as_millis(),
                    }
                    .into());
                }
            }
        }

        self.close_size()?;
        self.printer.print_final_output()?;
        self.channel.close().await?;

        self.outcome.totals = self.tracker.totals();
        info!(
            "Subscriber {} finished: {} samples received, {} lost",
            self.config.sub_id, self.outcome.totals.samples, self.outcome.totals.lost
        );
        Ok(self.outcome)
    }

    async fn handle_event(&mut self, event: ChannelEvent) -> Result<Flow> {
        match event {
            ChannelEvent::PeerMatched(peer) => {
                self.matched.insert(peer);
                debug!("Subscriber {} matched peer {}", self.config.sub_id, peer);
                if self.matched.len() >= self.config.num_publishers {
                    self.announce().await;
                }
                Ok(Flow::Continue)
            }
            ChannelEvent::PeerUnmatched(peer) => {
                self.matched.remove(&peer);
                for entity in self.peer_entities.remove(&peer).unwrap_or_default() {
                    self.tracker.retire(entity);
                }
                if self.announced && self.matched.is_empty() {
                    if self.finished.len() < self.config.num_publishers {
                        warn!(
                            "All publishers disconnected before finishing ({} of {} done)",
                            self.finished.len(),
                            self.config.num_publishers
                        );
                    }
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
            ChannelEvent::Frame(peer, frame) => match SampleEnvelope::decode(&frame) {
                Ok(envelope) => self.handle_envelope(peer, envelope).await,
                Err(e) => {
                    self.outcome.malformed_frames += 1;
                    debug!("Dropping frame from {}: {}", peer, e);
                    Ok(Flow::Continue)
                }
            },
        }
    }

    /// Tell publishers this subscriber exists. Sent again on every new match
    /// so late joiners learn about it too.
    async fn announce(&mut self) {
        let hello = SampleEnvelope::control(
            EnvelopeKind::Announcement,
            self.config.sub_id,
            NOT_A_PING,
            Vec::new(),
        );
        match self.channel.send(&hello).await {
            Ok(()) => {
                if !self.announced {
                    info!("Subscriber {} announced", self.config.sub_id);
                }
                self.announced = true;
            }
            Err(e) => warn!("Announcement failed: {}", e),
        }
    }

    async fn handle_envelope(&mut self, peer: PeerId, envelope: SampleEnvelope) -> Result<Flow> {
        let kind = envelope.kind();
        if kind == EnvelopeKind::Announcement {
            return Ok(Flow::Continue);
        }

        let entity = envelope.entity_id;
        if entity < 0 || entity as usize >= self.config.num_publishers {
            self.outcome.rejected_samples += 1;
            debug!(
                "Rejecting {:?} from unknown publisher id {} (expected 0..{})",
                kind, entity, self.config.num_publishers
            );
            return Ok(Flow::Continue);
        }
        self.peer_entities.entry(peer).or_default().insert(entity);

        match kind {
            EnvelopeKind::Initialize => {
                if self.config.echo_warmup {
                    self.echo(&envelope).await;
                }
            }
            EnvelopeKind::Data => {
                if self.should_echo(&envelope) {
                    self.echo(&envelope).await;
                }
                if self.tracker.current_size() != Some(envelope.sample_length()) {
                    self.close_size()?;
                    self.open_size(envelope.sample_length())?;
                }
                self.tracker.record(&envelope);
            }
            EnvelopeKind::LengthChanged | EnvelopeKind::Finished => {
                return self.handle_end_marker(kind, entity).await;
            }
            EnvelopeKind::Announcement => {}
        }
        Ok(Flow::Continue)
    }

    fn should_echo(&self, envelope: &SampleEnvelope) -> bool {
        envelope.is_ping()
            && envelope.latency_ping % self.config.num_subscribers.max(1) as i32
                == self.config.sub_id
    }

    async fn echo(&mut self, envelope: &SampleEnvelope) {
        match self.channel.send(envelope).await {
            Ok(()) => self.outcome.echoes_sent += 1,
            Err(e) => debug!("Echo of round {} failed: {}", envelope.latency_ping, e),
        }
    }

    async fn handle_end_marker(&mut self, kind: EnvelopeKind, entity: i32) -> Result<Flow> {
        let ack = SampleEnvelope::control(kind, self.config.sub_id, entity, Vec::new());
        if let Err(e) = self.channel.send(&ack).await {
            warn!("Failed to acknowledge {:?} from publisher {}: {}", kind, entity, e);
        }

        // Best-effort publishers repeat markers; only the first counts.
        if self.ended.insert(entity) && self.ended.len() >= self.config.num_publishers {
            self.close_size()?;
        }

        if kind == EnvelopeKind::Finished {
            self.finished.insert(entity);
            if self.finished.len() >= self.config.num_publishers {
                info!("All publishers finished");
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn open_size(&mut self, data_length: usize) -> Result<()> {
        self.ended.clear();
        if let Some(cpu) = self.cpu.as_mut() {
            cpu.reset();
        }
        self.tracker
            .begin_size(data_length, Instant::now().into_std());
        self.printer.set_data_length(data_length);
        self.printer
            .print_throughput_header()
            .context("Failed to print throughput header")?;
        Ok(())
    }

    /// Close the open size, if any, and print its summary.
    fn close_size(&mut self) -> Result<()> {
        if let Some(mut summary) = self.tracker.close_size(Instant::now().into_std()) {
            summary.cpu_percent = self.cpu.as_mut().map(CpuMonitor::average);
            self.printer
                .print_throughput_summary(&summary)
                .context("Failed to print throughput summary")?;
            self.outcome.summaries.push(summary);
        }
        Ok(())
    }

    fn report_interval(&mut self) {
        if !self.config.print_intervals {
            return;
        }
        if let Some(mut interval) = self.tracker.interval(Instant::now().into_std()) {
            interval.cpu_percent = self.cpu.as_mut().map(CpuMonitor::instant);
            if let Err(e) = self.printer.print_throughput_interval(&interval) {
                warn!("Failed to print throughput interval: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::payload_for;
    use crate::ipc::{ConnectionRole, MemoryBus, MemoryChannel};
    use crate::printer::{create_printer, SharedBuffer};
    use std::time::Duration;

    fn config(num_publishers: usize, num_subscribers: usize, sub_id: i32) -> TestConfiguration {
        TestConfiguration {
            num_publishers,
            num_subscribers,
            sub_id,
            print_intervals: false,
            discovery_timeout: Duration::from_secs(2),
            ..TestConfiguration::default()
        }
    }

    fn spawn_ponger(
        bus: &MemoryBus,
        config: TestConfiguration,
        out: SharedBuffer,
    ) -> tokio::task::JoinHandle<Result<PongerOutcome>> {
        let config = Arc::new(config);
        let printer = create_printer(config.output_format, config.printer_options(), Box::new(out));
        let channel = Box::new(bus.join(ConnectionRole::Subscriber));
        let ponger = Ponger::new(config, channel, printer).unwrap();
        tokio::spawn(ponger.run())
    }

    async fn next_envelope(events: &mut mpsc::Receiver<ChannelEvent>) -> SampleEnvelope {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Frame(_, frame)) => return SampleEnvelope::decode(&frame).unwrap(),
                Some(_) => continue,
                None => panic!("event queue closed"),
            }
        }
    }

    fn data(entity: i32, seq: u64, ping: i32, len: usize) -> SampleEnvelope {
        SampleEnvelope::encode(entity, seq, 0, ping, payload_for(len))
    }

    fn publisher(bus: &MemoryBus) -> (MemoryChannel, mpsc::Receiver<ChannelEvent>) {
        let mut channel = bus.join(ConnectionRole::Publisher);
        let events = channel.take_events().unwrap();
        (channel, events)
    }

    #[tokio::test]
    async fn test_echoes_pings_and_counts_loss() {
        let bus = MemoryBus::new();
        let out = SharedBuffer::new();
        let handle = spawn_ponger(&bus, config(1, 1, 0), out.clone());
        let (mut publisher, mut events) = publisher(&bus);

        let hello = next_envelope(&mut events).await;
        assert_eq!(hello.kind(), EnvelopeKind::Announcement);
        assert_eq!(hello.entity_id, 0);

        publisher.send(&data(0, 0, 0, 100)).await.unwrap();
        let echo = next_envelope(&mut events).await;
        assert_eq!(echo.latency_ping, 0);
        assert_eq!(echo.sequence_number, 0);

        for seq in [1, 3, 4] {
            publisher.send(&data(0, seq, NOT_A_PING, 100)).await.unwrap();
        }
        let finished = SampleEnvelope::control(EnvelopeKind::Finished, 0, NOT_A_PING, vec![]);
        publisher.send(&finished).await.unwrap();
        let ack = next_envelope(&mut events).await;
        assert_eq!(ack.kind(), EnvelopeKind::Finished);
        assert_eq!(ack.latency_ping, 0);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.echoes_sent, 1);
        assert_eq!(outcome.summaries.len(), 1);
        let summary = &outcome.summaries[0];
        assert_eq!(summary.data_length, 100);
        assert_eq!(summary.total_samples, 4);
        assert_eq!(summary.lost_samples, 1);
        assert!(out.contents().contains("Length:   100"));
    }

    #[tokio::test]
    async fn test_only_addressed_subscriber_echoes() {
        let bus = MemoryBus::new();
        let handle = spawn_ponger(&bus, config(1, 2, 1), SharedBuffer::new());
        let (mut publisher, mut events) = publisher(&bus);
        next_envelope(&mut events).await;

        // Round 2 belongs to subscriber 0, round 3 to subscriber 1.
        publisher.send(&data(0, 0, 2, 64)).await.unwrap();
        publisher.send(&data(0, 1, 3, 64)).await.unwrap();
        let echo = next_envelope(&mut events).await;
        assert_eq!(echo.latency_ping, 3);

        let finished = SampleEnvelope::control(EnvelopeKind::Finished, 0, NOT_A_PING, vec![]);
        publisher.send(&finished).await.unwrap();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.echoes_sent, 1);
    }

    #[tokio::test]
    async fn test_rejects_unknown_publisher_ids() {
        let bus = MemoryBus::new();
        let handle = spawn_ponger(&bus, config(1, 1, 0), SharedBuffer::new());
        let (mut publisher, mut events) = publisher(&bus);
        next_envelope(&mut events).await;

        publisher.send(&data(5, 0, NOT_A_PING, 64)).await.unwrap();
        publisher.send(&data(-3, 0, NOT_A_PING, 64)).await.unwrap();
        publisher.send(&data(0, 0, NOT_A_PING, 64)).await.unwrap();
        let finished = SampleEnvelope::control(EnvelopeKind::Finished, 0, NOT_A_PING, vec![]);
        publisher.send(&finished).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.rejected_samples, 2);
        assert_eq!(outcome.totals.samples, 1);
    }

    #[tokio::test]
    async fn test_repeated_markers_close_size_once() {
        let bus = MemoryBus::new();
        let handle = spawn_ponger(&bus, config(1, 1, 0), SharedBuffer::new());
        let (mut publisher, mut events) = publisher(&bus);
        next_envelope(&mut events).await;

        publisher.send(&data(0, 0, NOT_A_PING, 32)).await.unwrap();
        let changed = SampleEnvelope::control(EnvelopeKind::LengthChanged, 0, NOT_A_PING, vec![]);
        for _ in 0..3 {
            publisher.send(&changed).await.unwrap();
        }
        publisher.send(&data(0, 1, NOT_A_PING, 64)).await.unwrap();
        publisher.send(&data(0, 2, NOT_A_PING, 64)).await.unwrap();
        let finished = SampleEnvelope::control(EnvelopeKind::Finished, 0, NOT_A_PING, vec![]);
        publisher.send(&finished).await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        let lengths: Vec<usize> = outcome.summaries.iter().map(|s| s.data_length).collect();
        assert_eq!(lengths, vec![32, 64]);
        assert_eq!(outcome.summaries[1].total_samples, 2);
        assert_eq!(outcome.summaries[1].lost_samples, 0);
    }

    #[tokio::test]
    async fn test_stops_when_publishers_vanish() {
        let bus = MemoryBus::new();
        let handle = spawn_ponger(&bus, config(1, 1, 0), SharedBuffer::new());
        let (mut publisher, mut events) = publisher(&bus);
        next_envelope(&mut events).await;

        publisher.send(&data(0, 0, NOT_A_PING, 64)).await.unwrap();
        publisher.close().await.unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.summaries.len(), 1);
        assert_eq!(outcome.totals.samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout_without_publishers() {
        let bus = MemoryBus::new();
        let handle = spawn_ponger(&bus, config(1, 1, 0), SharedBuffer::new());
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PerftestError>(),
            Some(PerftestError::TimeoutExceeded { .. })
        ));
    }
}

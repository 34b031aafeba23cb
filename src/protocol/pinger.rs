use super::{Clock, Phase, PublicationPacer, BEST_EFFORT_CONTROL_REPEATS, MAX_CONSECUTIVE_SEND_FAILURES};
use crate::benchmark::TestConfiguration;
use crate::cpu::CpuMonitor;
use crate::envelope::{payload_for, EnvelopeKind, SampleEnvelope, NOT_A_PING};
use crate::error::PerftestError;
use crate::ipc::{ChannelEvent, MessageChannel, PeerId};
use crate::metrics::{LatencyInterval, LatencySummary, StatisticsAccumulator};
use crate::printer::ReportPrinter;
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct OutstandingPing {
    sent_us: u64,
    sent_at: Instant,
}

/// What a publisher reports once its scan is over.
#[derive(Debug, Clone, Default)]
pub struct PingerOutcome {
    /// One summary per size that produced at least one latency observation.
    pub summaries: Vec<LatencySummary>,
    /// Sizes whose measuring phase started.
    pub sizes_measured: Vec<usize>,
    pub samples_sent: u64,
    pub lost_rounds: u64,
    pub clock_anomalies: u64,
    pub malformed_frames: u64,
    /// The execution-time bound cut the scan short.
    pub deadline_reached: bool,
}

/// Publisher side of the latency exchange.
///
/// Publisher 0 is the pinger: every `latency_count`-th sample it sends
/// carries a round id and is echoed by one subscriber. Other publishers run
/// the same loop without pinging.
pub struct Pinger {
    config: Arc<TestConfiguration>,
    channel: Box<dyn MessageChannel>,
    events: mpsc::Receiver<ChannelEvent>,
    printer: Box<dyn ReportPrinter>,
    clock: Arc<dyn Clock>,
    pacer: Option<PublicationPacer>,
    cpu: Option<CpuMonitor>,
    deadline: Option<Instant>,

    phase: Phase,
    data_length: usize,
    stats: StatisticsAccumulator,
    outstanding: BTreeMap<i32, OutstandingPing>,
    next_round: i32,
    next_seq: u64,
    consecutive_send_failures: u32,

    matched: HashSet<PeerId>,
    announced: HashSet<i32>,
    acks: HashSet<i32>,

    size_lost_rounds: u64,
    size_clock_anomalies: u64,
    outcome: PingerOutcome,
}

impl Pinger {
    pub fn new(
        config: Arc<TestConfiguration>,
        mut channel: Box<dyn MessageChannel>,
        printer: Box<dyn ReportPrinter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let events = channel
            .take_events()
            .ok_or_else(|| PerftestError::Channel("event queue already taken".to_string()))?;
        let pacer = config.pub_rate.map(PublicationPacer::new);
        let cpu = config.cpu.then(CpuMonitor::new);

        Ok(Self {
            config,
            channel,
            events,
            printer,
            clock,
            pacer,
            cpu,
            deadline: None,
            phase: Phase::Done,
            data_length: 0,
            stats: StatisticsAccumulator::new(),
            outstanding: BTreeMap::new(),
            next_round: 0,
            next_seq: 0,
            consecutive_send_failures: 0,
            matched: HashSet::new(),
            announced: HashSet::new(),
            acks: HashSet::new(),
            size_lost_rounds: 0,
            size_clock_anomalies: 0,
            outcome: PingerOutcome::default(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn is_pinger(&self) -> bool {
        self.config.is_pinger()
    }

    /// Run the whole payload-size scan.
    pub async fn run(mut self) -> Result<PingerOutcome> {
        if self.is_pinger() {
            self.printer.print_initial_output()?;
        }

        self.discover().await?;
        self.deadline = self.config.execution_time.map(|t| Instant::now() + t);

        let sizes = self.config.data_lengths.clone();
        for (index, &data_length) in sizes.iter().enumerate() {
            let last = index + 1 == sizes.len();
            if self.run_size(data_length, last).await? {
                break;
            }
        }

        if self.is_pinger() {
            self.printer.print_final_output()?;
        }
        self.channel.close().await?;
        info!(
            "Publisher {} finished: {} samples sent, {} rounds lost",
            self.config.pub_id, self.outcome.samples_sent, self.outcome.lost_rounds
        );
        Ok(self.outcome)
    }

    /// Wait until every subscriber is matched and has announced itself.
    async fn discover(&mut self) -> Result<()> {
        let wanted = self.config.num_subscribers;
        info!(
            "Publisher {} waiting for {} subscriber(s)",
            self.config.pub_id, wanted
        );
        let deadline = Instant::now() + self.config.discovery_timeout;

        while self.matched.len() < wanted || self.announced.len() < wanted {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {
                    return Err(PerftestError::Channel("event queue closed".to_string()).into())
                }
                Err(_) => {
                    return Err(PerftestError::TimeoutExceeded {
                        what: format!(
                            "{} subscriber(s) to announce ({} matched, {} announced)",
                            wanted,
                            self.matched.len(),
                            self.announced.len()
                        ),
                        waited_ms: self.config.discovery_timeout.as_millis(),
                    }
                    .into())
                }
            }
        }
        debug!("Publisher {} discovered all subscribers", self.config.pub_id);
        Ok(())
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Drive one size through all phases. Returns true when the scan is over.
    async fn run_size(&mut self, data_length: usize, last: bool) -> Result<bool> {
        self.data_length = data_length;
        self.stats.reset();
        self.size_lost_rounds = 0;
        self.size_clock_anomalies = 0;
        if let Some(cpu) = self.cpu.as_mut() {
            cpu.reset();
        }

        if self.is_pinger() {
            self.printer.set_data_length(data_length);
            self.printer.print_latency_header()?;
        }

        self.phase = Phase::Warmup;
        debug!("Size {} entering {}", data_length, self.phase);
        let mut warmup = SampleEnvelope::control(
            EnvelopeKind::Initialize,
            self.config.pub_id,
            NOT_A_PING,
            payload_for(data_length),
        );
        for _ in 0..self.config.warmup_samples {
            warmup.stamp(self.clock.now_us());
            self.send_envelope(&warmup).await?;
            self.poll_events();
        }

        self.phase = Phase::Measuring;
        debug!("Size {} entering {}", data_length, self.phase);
        self.outcome.sizes_measured.push(data_length);
        self.measure(data_length).await?;

        self.phase = Phase::Draining;
        debug!("Size {} entering {}", data_length, self.phase);
        if self.deadline_passed() {
            self.abandon_outstanding();
        } else {
            self.drain_echoes().await?;
        }

        let finished = last || self.deadline_passed();
        if finished && !last {
            info!("Execution time reached; skipping remaining sizes");
            self.outcome.deadline_reached = true;
        }
        let marker = if finished {
            EnvelopeKind::Finished
        } else {
            EnvelopeKind::LengthChanged
        };
        self.announce_end_of_size(marker).await?;

        self.phase = Phase::Done;
        self.emit_summary(data_length)?;
        Ok(finished)
    }

    async fn measure(&mut self, data_length: usize) -> Result<()> {
        let latency_count = self.config.latency_count.max(1);
        let mut envelope = SampleEnvelope::encode(
            self.config.pub_id,
            0,
            0,
            NOT_A_PING,
            payload_for(data_length),
        );

        for i in 0..self.config.samples_per_size {
            if let Some(pacer) = self.pacer.as_mut() {
                pacer.acquire().await;
            }

            let ping = self.is_pinger() && i % latency_count == 0;
            if ping {
                self.wait_for_capacity().await?;
            }
            if self.deadline_passed() {
                self.outcome.deadline_reached = true;
                info!(
                    "Execution time reached after {} samples of size {}",
                    i, data_length
                );
                break;
            }

            envelope.sequence_number = self.next_seq;
            self.next_seq += 1;
            let round = self.next_round;
            envelope.latency_ping = if ping { round } else { NOT_A_PING };
            let sent_us = self.clock.now_us();
            envelope.stamp(sent_us);

            if ping {
                self.next_round = self.next_round.wrapping_add(1) & i32::MAX;
                self.outstanding.insert(
                    round,
                    OutstandingPing {
                        sent_us,
                        sent_at: Instant::now(),
                    },
                );
            }

            if !self.send_envelope(&envelope).await? && ping {
                self.outstanding.remove(&round);
                self.record_lost_rounds(1);
            }

            self.poll_events();
            if ping {
                self.expire_pings(Instant::now());
            }
        }
        Ok(())
    }

    /// Block while the number of in-flight pings is at the limit.
    async fn wait_for_capacity(&mut self) -> Result<()> {
        let limit = self.config.max_outstanding_pings.max(1);
        while self.outstanding.len() >= limit {
            let oldest = match self.outstanding.values().next() {
                Some(ping) => ping.sent_at,
                None => break,
            };
            let mut wake = oldest + self.config.echo_timeout;
            if let Some(deadline) = self.deadline {
                if deadline <= Instant::now() {
                    break;
                }
                wake = wake.min(deadline);
            }

            match timeout_at(wake, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {
                    return Err(PerftestError::Channel("event queue closed".to_string()).into())
                }
                Err(_) => self.expire_pings(Instant::now()),
            }
        }
        Ok(())
    }

    /// Wait for in-flight echoes, bounded by the drain timeout.
    async fn drain_echoes(&mut self) -> Result<()> {
        let drain_deadline = Instant::now() + self.config.drain_timeout;
        while !self.outstanding.is_empty() {
            let mut wake = drain_deadline;
            if let Some(ping) = self.outstanding.values().next() {
                wake = wake.min(ping.sent_at + self.config.echo_timeout);
            }
            if let Some(deadline) = self.deadline {
                wake = wake.min(deadline);
            }

            match timeout_at(wake, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => {
                    return Err(PerftestError::Channel("event queue closed".to_string()).into())
                }
                Err(_) => {
                    let now = Instant::now();
                    self.expire_pings(now);
                    if now >= drain_deadline || self.deadline_passed() {
                        self.abandon_outstanding();
                    }
                }
            }
        }
        Ok(())
    }

    /// Send the end-of-size marker and wait for every subscriber to ack it.
    async fn announce_end_of_size(&mut self, marker: EnvelopeKind) -> Result<()> {
        self.acks.clear();
        let envelope = SampleEnvelope::control(marker, self.config.pub_id, NOT_A_PING, Vec::new());
        let repeats = if self.config.best_effort {
            BEST_EFFORT_CONTROL_REPEATS
        } else {
            1
        };
        // Subscribers may leave as soon as they see Finished, so failed
        // repeats do not count towards aborting the run.
        let mut delivered = 0;
        for _ in 0..repeats {
            match self.channel.send(&envelope).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!("{:?} marker not delivered: {}", marker, e);
                    if delivered > 0 {
                        break;
                    }
                }
            }
        }
        if delivered == 0 {
            warn!("{:?} marker could not be delivered to any subscriber", marker);
        }

        let wanted = self.config.num_subscribers;
        let ack_deadline = Instant::now() + self.config.drain_timeout;
        while self.acks.len() < wanted {
            match timeout_at(ack_deadline, self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(_) => {
                    let err = PerftestError::TimeoutExceeded {
                        what: format!(
                            "{:?} acknowledgements ({} of {})",
                            marker,
                            self.acks.len(),
                            wanted
                        ),
                        waited_ms: self.config.drain_timeout.as_millis(),
                    };
                    warn!("{}", err);
                    break;
                }
            }
        }
        Ok(())
    }

    fn emit_summary(&mut self, data_length: usize) -> Result<()> {
        if !self.is_pinger() {
            return Ok(());
        }
        if self.size_clock_anomalies > 0 {
            warn!(
                "{} observation(s) for size {} discarded because of clock skew; \
                 latency results may be inaccurate",
                self.size_clock_anomalies, data_length
            );
        }
        if self.stats.is_empty() {
            warn!("No latency observations for size {}", data_length);
            return Ok(());
        }

        let mut summary = LatencySummary::from_accumulator(
            data_length,
            self.config.latency_type,
            &self.stats,
            self.size_lost_rounds,
            self.size_clock_anomalies,
        );
        summary.cpu_percent = self.cpu.as_mut().map(CpuMonitor::average);
        self.printer
            .print_latency_summary(&summary)
            .context("Failed to print latency summary")?;
        self.outcome.summaries.push(summary);
        Ok(())
    }

    /// Returns `Ok(false)` on a recoverable send failure.
    async fn send_envelope(&mut self, envelope: &SampleEnvelope) -> Result<bool> {
        match self.channel.send(envelope).await {
            Ok(()) => {
                self.consecutive_send_failures = 0;
                if envelope.kind() == EnvelopeKind::Data {
                    self.outcome.samples_sent += 1;
                }
                Ok(true)
            }
            Err(e) => {
                self.consecutive_send_failures += 1;
                debug!(
                    "Send of seq {} failed ({} in a row): {}",
                    envelope.sequence_number, self.consecutive_send_failures, e
                );
                if self.consecutive_send_failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                    return Err(PerftestError::Channel(format!(
                        "{} consecutive send failures, last: {}",
                        self.consecutive_send_failures, e
                    ))
                    .into());
                }
                Ok(false)
            }
        }
    }

    /// Handle everything already queued without waiting.
    fn poll_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::PeerMatched(peer) => {
                debug!("Publisher {} matched peer {}", self.config.pub_id, peer);
                self.matched.insert(peer);
            }
            ChannelEvent::PeerUnmatched(peer) => {
                debug!("Publisher {} lost peer {}", self.config.pub_id, peer);
                self.matched.remove(&peer);
            }
            ChannelEvent::Frame(_, frame) => match SampleEnvelope::decode(&frame) {
                Ok(envelope) => self.handle_envelope(envelope),
                Err(e) => {
                    self.outcome.malformed_frames += 1;
                    debug!("Dropping frame: {}", e);
                }
            },
        }
    }

    fn handle_envelope(&mut self, envelope: SampleEnvelope) {
        match envelope.kind() {
            EnvelopeKind::Data if envelope.is_ping() && self.is_pinger() => {
                self.handle_echo(envelope.latency_ping)
            }
            EnvelopeKind::Announcement => {
                self.announced.insert(envelope.entity_id);
            }
            EnvelopeKind::LengthChanged | EnvelopeKind::Finished => {
                if envelope.latency_ping == self.config.pub_id {
                    self.acks.insert(envelope.entity_id);
                }
            }
            _ => {}
        }
    }

    fn handle_echo(&mut self, round: i32) {
        let ping = match self.outstanding.remove(&round) {
            Some(ping) => ping,
            None => {
                debug!("Ignoring echo for abandoned or unknown round {}", round);
                return;
            }
        };

        let received_us = self.clock.now_us();
        if received_us < ping.sent_us {
            self.size_clock_anomalies += 1;
            self.outcome.clock_anomalies += 1;
            let err = PerftestError::ClockAnomaly {
                sent_us: ping.sent_us,
                received_us,
            };
            debug!("Discarding round {}: {}", round, err);
            return;
        }

        let observation = self
            .config
            .latency_type
            .observe(received_us - ping.sent_us);
        self.stats.record(observation);

        let every = self.config.latency_report_every.max(1);
        if self.config.print_intervals && self.stats.count() % every == 0 {
            let interval = LatencyInterval {
                data_length: self.data_length,
                latency_us: observation,
                mean_us: self.stats.mean(),
                stddev_us: self.stats.stddev(),
                min_us: self.stats.min(),
                max_us: self.stats.max(),
                cpu_percent: self.cpu.as_mut().map(CpuMonitor::instant),
            };
            if let Err(e) = self.printer.print_latency_interval(&interval) {
                warn!("Failed to print latency interval: {}", e);
            }
        }
    }

    /// Abandon pings whose echo is overdue at `now`.
    fn expire_pings(&mut self, now: Instant) {
        let timeout = self.config.echo_timeout;
        let expired: Vec<i32> = self
            .outstanding
            .iter()
            .filter(|(_, ping)| ping.sent_at + timeout <= now)
            .map(|(round, _)| *round)
            .collect();
        for round in &expired {
            self.outstanding.remove(round);
            debug!(
                "{}",
                PerftestError::TimeoutExceeded {
                    what: format!("echo of round {}", round),
                    waited_ms: timeout.as_millis(),
                }
            );
        }
        self.record_lost_rounds(expired.len() as u64);
    }

    fn abandon_outstanding(&mut self) {
        let abandoned = self.outstanding.len() as u64;
        self.outstanding.clear();
        self.record_lost_rounds(abandoned);
    }

    fn record_lost_rounds(&mut self, rounds: u64) {
        self.size_lost_rounds += rounds;
        self.outcome.lost_rounds += rounds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::TestConfiguration;
    use crate::ipc::{ConnectionRole, IpcError, MemoryBus, TransportConfig};
    use crate::metrics::LatencyType;
    use crate::printer::{create_printer, SharedBuffer};
    use crate::protocol::ManualClock;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn strict_config(sizes: Vec<usize>, samples: u64) -> TestConfiguration {
        TestConfiguration {
            data_lengths: sizes,
            samples_per_size: samples,
            latency_count: 1,
            max_outstanding_pings: 1,
            warmup_samples: 3,
            latency_type: LatencyType::RoundTrip,
            echo_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(500),
            discovery_timeout: Duration::from_secs(2),
            ..TestConfiguration::default()
        }
    }

    /// How the scripted subscriber answers.
    struct Script {
        delays: Vec<u64>,
        answer_pings: bool,
        /// Stop echoing once the scripted delays run out.
        only_scripted_echoes: bool,
        ack_markers: bool,
    }

    fn scripted_ponger(
        bus: &MemoryBus,
        clock: ManualClock,
        delays: Vec<u64>,
        answer_pings: bool,
    ) -> JoinHandle<Vec<SampleEnvelope>> {
        scripted_subscriber(
            bus,
            clock,
            Script {
                delays,
                answer_pings,
                only_scripted_echoes: false,
                ack_markers: true,
            },
        )
    }

    fn announcement() -> SampleEnvelope {
        SampleEnvelope::control(EnvelopeKind::Announcement, 0, NOT_A_PING, Vec::new())
    }

    fn ack(marker: &SampleEnvelope) -> SampleEnvelope {
        SampleEnvelope::control(marker.kind(), 0, marker.entity_id, Vec::new())
    }

    /// Subscriber stand-in: announces, echoes pings after advancing the
    /// clock by the next scripted delay, and acks end markers.
    fn scripted_subscriber(
        bus: &MemoryBus,
        clock: ManualClock,
        script: Script,
    ) -> JoinHandle<Vec<SampleEnvelope>> {
        let mut channel = bus.join(ConnectionRole::Subscriber);
        let mut events = channel.take_events().unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut delays = script.delays.into_iter();
            while let Some(event) = events.recv().await {
                let frame = match event {
                    ChannelEvent::PeerMatched(_) => {
                        channel.send(&announcement()).await.unwrap();
                        continue;
                    }
                    ChannelEvent::PeerUnmatched(_) => break,
                    ChannelEvent::Frame(_, frame) => frame,
                };
                let envelope = SampleEnvelope::decode(&frame).unwrap();
                match envelope.kind() {
                    EnvelopeKind::Data if envelope.is_ping() && script.answer_pings => {
                        let delay = match delays.next() {
                            Some(delay) => Some(delay),
                            None if script.only_scripted_echoes => None,
                            None => Some(1),
                        };
                        if let Some(delay) = delay {
                            clock.advance(delay);
                            channel.send(&envelope).await.unwrap();
                        }
                    }
                    EnvelopeKind::LengthChanged | EnvelopeKind::Finished if script.ack_markers => {
                        channel.send(&ack(&envelope)).await.unwrap();
                    }
                    _ => {}
                }
                seen.push(envelope);
            }
            seen
        })
    }

    /// Holds pings until `order.len()` of them have arrived, then echoes
    /// them in that order, advancing the clock by the paired delay first.
    fn reordering_ponger(
        bus: &MemoryBus,
        clock: ManualClock,
        order: Vec<usize>,
        delays: Vec<u64>,
    ) -> JoinHandle<()> {
        let mut channel = bus.join(ConnectionRole::Subscriber);
        let mut events = channel.take_events().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(event) = events.recv().await {
                let frame = match event {
                    ChannelEvent::PeerMatched(_) => {
                        channel.send(&announcement()).await.unwrap();
                        continue;
                    }
                    ChannelEvent::PeerUnmatched(_) => break,
                    ChannelEvent::Frame(_, frame) => frame,
                };
                let envelope = SampleEnvelope::decode(&frame).unwrap();
                match envelope.kind() {
                    EnvelopeKind::Data if envelope.is_ping() => {
                        held.push(envelope);
                        if held.len() == order.len() {
                            for (&index, &delay) in order.iter().zip(&delays) {
                                clock.advance(delay);
                                channel.send(&held[index]).await.unwrap();
                            }
                        }
                    }
                    EnvelopeKind::LengthChanged | EnvelopeKind::Finished => {
                        channel.send(&ack(&envelope)).await.unwrap();
                    }
                    _ => {}
                }
            }
        })
    }

    fn pinger_on(bus: &MemoryBus, config: TestConfiguration, clock: ManualClock, out: SharedBuffer) -> Pinger {
        let config = Arc::new(config);
        let printer = create_printer(config.output_format, config.printer_options(), Box::new(out));
        let channel = Box::new(bus.join(ConnectionRole::Publisher));
        Pinger::new(config, channel, printer, Arc::new(clock)).unwrap()
    }

    #[tokio::test]
    async fn test_scripted_round_trips() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(1_000_000);
        let out = SharedBuffer::new();
        let ponger = scripted_ponger(&bus, clock.clone(), vec![10, 20, 15, 25, 30], true);
        let pinger = pinger_on(&bus, strict_config(vec![100], 5), clock, out.clone());

        let outcome = pinger.run().await.unwrap();
        assert_eq!(outcome.summaries.len(), 1);
        let summary = &outcome.summaries[0];
        assert_eq!(summary.count, 5);
        assert_eq!(summary.mean_us, 20.0);
        assert_eq!(summary.min_us, 10);
        assert_eq!(summary.max_us, 30);
        assert_eq!(summary.p50_us, 20);
        assert_eq!(summary.lost_rounds, 0);
        assert_eq!(outcome.samples_sent, 5);

        let seen = ponger.await.unwrap();
        let warmups = seen
            .iter()
            .filter(|e| e.kind() == EnvelopeKind::Initialize)
            .count();
        assert_eq!(warmups, 3);
        let seqs: Vec<u64> = seen
            .iter()
            .filter(|e| e.kind() == EnvelopeKind::Data)
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(seen.last().unwrap().kind(), EnvelopeKind::Finished);

        let text = out.contents();
        assert!(text.contains("Length:   100 Latency: Ave     20 us"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_pings_are_lost_rounds() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(0);
        let _ponger = scripted_ponger(&bus, clock.clone(), Vec::new(), false);
        let pinger = pinger_on(&bus, strict_config(vec![64], 3), clock, SharedBuffer::new());

        let outcome = pinger.run().await.unwrap();
        assert_eq!(outcome.lost_rounds, 3);
        assert!(outcome.summaries.is_empty());
        assert_eq!(outcome.samples_sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_skips_remaining_sizes() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(0);
        let ponger = scripted_ponger(&bus, clock.clone(), Vec::new(), false);
        let config = TestConfiguration {
            execution_time: Some(Duration::from_millis(300)),
            ..strict_config(vec![64, 128, 256], 1000)
        };
        let pinger = pinger_on(&bus, config, clock, SharedBuffer::new());

        let outcome = pinger.run().await.unwrap();
        assert!(outcome.deadline_reached);
        assert_eq!(outcome.sizes_measured, vec![64]);
        assert!(outcome.samples_sent < 1000);

        let seen = ponger.await.unwrap();
        assert_eq!(seen.last().unwrap().kind(), EnvelopeKind::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout() {
        let bus = MemoryBus::new();
        let pinger = pinger_on(
            &bus,
            strict_config(vec![64], 1),
            ManualClock::new(0),
            SharedBuffer::new(),
        );
        let err = pinger.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PerftestError>(),
            Some(PerftestError::TimeoutExceeded { .. })
        ));
    }

    /// Matched and announced, but every send fails.
    struct BrokenChannel {
        events: Option<mpsc::Receiver<ChannelEvent>>,
    }

    #[async_trait]
    impl MessageChannel for BrokenChannel {
        async fn start_server(&mut self, _config: &TransportConfig) -> anyhow::Result<()> {
            Ok(())
        }
        async fn start_client(&mut self, _config: &TransportConfig) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send(&mut self, _envelope: &SampleEnvelope) -> Result<(), IpcError> {
            Err(IpcError::BackpressureTimeout)
        }
        fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
            self.events.take()
        }
        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "Broken"
        }
    }

    #[tokio::test]
    async fn test_persistent_send_failure_aborts() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ChannelEvent::PeerMatched(1)).await.unwrap();
        let hello = SampleEnvelope::control(EnvelopeKind::Announcement, 0, NOT_A_PING, vec![]);
        tx.send(ChannelEvent::Frame(1, hello.to_bytes().unwrap()))
            .await
            .unwrap();

        let config = Arc::new(TestConfiguration {
            warmup_samples: 0,
            ..strict_config(vec![64], 100)
        });
        let printer = create_printer(
            config.output_format,
            config.printer_options(),
            Box::new(SharedBuffer::new()),
        );
        let channel = Box::new(BrokenChannel { events: Some(rx) });
        let pinger = Pinger::new(config, channel, printer, Arc::new(ManualClock::new(0))).unwrap();

        let err = pinger.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PerftestError>(),
            Some(PerftestError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_clock_skew_is_discarded() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(1_000);
        let out = SharedBuffer::new();
        let mut pinger = pinger_on(&bus, strict_config(vec![64], 1), clock.clone(), out);

        pinger.outstanding.insert(
            7,
            OutstandingPing {
                sent_us: 5_000,
                sent_at: Instant::now(),
            },
        );
        pinger.handle_echo(7);
        assert!(pinger.stats.is_empty());
        assert_eq!(pinger.outcome.clock_anomalies, 1);

        clock.set(6_000);
        pinger.outstanding.insert(
            8,
            OutstandingPing {
                sent_us: 5_000,
                sent_at: Instant::now(),
            },
        );
        pinger.handle_echo(8);
        assert_eq!(pinger.stats.count(), 1);
        assert_eq!(pinger.stats.max(), 1_000);
    }

    #[tokio::test]
    async fn test_out_of_order_echoes_in_burst_mode() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(1_000_000);
        let out = SharedBuffer::new();
        // Rounds 0, 1, 2 are echoed as 2, 0, 1.
        let _ponger = reordering_ponger(&bus, clock.clone(), vec![2, 0, 1], vec![30, 10, 20]);
        let config = TestConfiguration {
            max_outstanding_pings: 3,
            ..strict_config(vec![100], 3)
        };
        let pinger = pinger_on(&bus, config, clock, out.clone());

        let outcome = pinger.run().await.unwrap();
        let summary = &outcome.summaries[0];
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min_us, 30);
        assert_eq!(summary.max_us, 60);
        assert_eq!(summary.lost_rounds, 0);
        assert_eq!(outcome.lost_rounds, 0);

        // Each echo is charged to its own round: 2 -> 30, 0 -> 40, 1 -> 60.
        let text = out.contents();
        let latencies: Vec<&str> = text
            .lines()
            .filter(|line| line.starts_with("Round trip Latency:"))
            .collect();
        assert_eq!(latencies.len(), 3);
        for (line, expected) in latencies.iter().zip([30, 40, 60]) {
            let prefix = format!("Round trip Latency: {:6} us", expected);
            assert!(line.starts_with(&prefix), "{}", line);
        }
    }

    #[tokio::test]
    async fn test_echo_after_expiry_is_ignored() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(1_000);
        let config = TestConfiguration {
            max_outstanding_pings: 2,
            ..strict_config(vec![64], 2)
        };
        let mut pinger = pinger_on(&bus, config, clock.clone(), SharedBuffer::new());
        let timeout = pinger.config.echo_timeout;
        let start = Instant::now();

        pinger.outstanding.insert(
            0,
            OutstandingPing {
                sent_us: 1_000,
                sent_at: start,
            },
        );
        pinger.outstanding.insert(
            1,
            OutstandingPing {
                sent_us: 1_000,
                sent_at: start + timeout,
            },
        );
        pinger.expire_pings(start + timeout);
        assert_eq!(pinger.size_lost_rounds, 1);
        assert_eq!(pinger.outstanding.len(), 1);

        clock.advance(50);
        pinger.handle_echo(0);
        pinger.handle_echo(1);
        assert_eq!(pinger.stats.count(), 1);
        assert_eq!(pinger.stats.min(), 50);
        assert!(pinger.outstanding.is_empty());
        assert_eq!(pinger.outcome.lost_rounds, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_marker_gives_up_after_drain_timeout() {
        let bus = MemoryBus::new();
        let clock = ManualClock::new(0);
        let ponger = scripted_subscriber(
            &bus,
            clock.clone(),
            Script {
                delays: vec![10, 20],
                answer_pings: true,
                only_scripted_echoes: true,
                ack_markers: false,
            },
        );
        let config = strict_config(vec![64], 4);
        let drain = config.drain_timeout;
        let echo = config.echo_timeout;
        let pinger = pinger_on(&bus, config, clock, SharedBuffer::new());

        let started = Instant::now();
        let outcome = pinger.run().await.unwrap();
        let elapsed = started.elapsed();
        // Two rounds time out, then the marker wait runs its full course.
        assert!(elapsed >= drain + echo * 2, "{:?}", elapsed);
        assert!(elapsed < drain + echo * 2 + Duration::from_millis(50), "{:?}", elapsed);

        assert_eq!(outcome.summaries.len(), 1);
        let summary = &outcome.summaries[0];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.mean_us, 15.0);
        assert_eq!(summary.lost_rounds, 2);

        let seen = ponger.await.unwrap();
        assert_eq!(seen.last().unwrap().kind(), EnvelopeKind::Finished);
    }
}

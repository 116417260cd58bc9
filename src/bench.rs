//! The benchmark polling loop.
//!
//! One thread owns the context, the ring and the reaper. Each iteration
//! polls without blocking, hands completed slots to the application, and
//! reposts exactly those slots so the ring stays full. Idle iterations back
//! off exponentially instead of spinning. A shared flag stops the loop
//! between iterations; requests already handed to the NIC are left alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use quanta::Instant;
use thiserror::Error;

use crate::ctrl::BenchConfig;
use crate::rdma::context::TransportError;
use crate::rdma::provider::Provider;
use crate::rdma::reaper::{Completion, CompletionError, CompletionReaper};
use crate::rdma::ring::{PostError, RequestRing};

/// Anything that ends a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport setup failed")]
    Transport(#[from] TransportError),

    #[error("posting failed")]
    Post(#[from] PostError),

    #[error("completion failed")]
    Completion(#[from] CompletionError),
}

/// Work done by one loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub messages: usize,
    pub bytes: usize,
}

/// One direction of a session.
pub trait Pump {
    /// Fill the ring for the first time. Later calls do nothing.
    fn start(&mut self) -> Result<(), SessionError>;

    /// Drain completions and repost their slots.
    fn step(&mut self) -> Result<StepStats, SessionError>;

    /// Word used in reports, e.g. "sent".
    fn verb(&self) -> &'static str;
}

/// Keeps a ring of sends outstanding.
pub struct SendPump<'c, P: Provider> {
    ring: RequestRing<'c, P>,
    reaper: CompletionReaper<'c, P>,
    slots: Vec<usize>,
    started: bool,
}

impl<'c, P: Provider> SendPump<'c, P> {
    pub fn new(ring: RequestRing<'c, P>, reaper: CompletionReaper<'c, P>) -> Self {
        let slots = Vec::with_capacity(ring.depth());
        Self {
            ring,
            reaper,
            slots,
            started: false,
        }
    }

    #[inline]
    pub fn ring(&self) -> &RequestRing<'c, P> {
        &self.ring
    }

    /// Fill every slot's payload with `fill` before the first post.
    pub fn fill_all(&mut self, mut fill: impl FnMut(usize, &mut [u8])) {
        for slot in 0..self.ring.depth() {
            if let Some(buf) = self.ring.payload_mut(slot) {
                fill(slot, buf);
            }
        }
    }

    /// Like [`Pump::step`], letting `refill` rewrite each completed slot's
    /// payload before it is reposted.
    pub fn step_with(
        &mut self,
        mut refill: impl FnMut(usize, &mut [u8]),
    ) -> Result<StepStats, SessionError> {
        let done = self.reaper.poll(&mut self.ring, self.reaper.batch())?;
        let mut stats = StepStats::default();
        self.slots.clear();
        for c in done {
            self.slots.push(c.slot);
            stats.messages += 1;
            stats.bytes += c.payload_len();
        }

        for &slot in &self.slots {
            if let Some(buf) = self.ring.payload_mut(slot) {
                refill(slot, buf);
            }
        }
        self.ring.repost(self.slots.iter().copied())?;
        Ok(stats)
    }
}

impl<P: Provider> Pump for SendPump<'_, P> {
    fn start(&mut self) -> Result<(), SessionError> {
        if !self.started {
            self.ring.post_all()?;
            self.started = true;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<StepStats, SessionError> {
        self.step_with(|_, _| {})
    }

    fn verb(&self) -> &'static str {
        "sent"
    }
}

/// Keeps a ring of receives outstanding.
pub struct RecvPump<'c, P: Provider> {
    ring: RequestRing<'c, P>,
    reaper: CompletionReaper<'c, P>,
    slots: Vec<usize>,
    started: bool,
}

impl<'c, P: Provider> RecvPump<'c, P> {
    pub fn new(ring: RequestRing<'c, P>, reaper: CompletionReaper<'c, P>) -> Self {
        let slots = Vec::with_capacity(ring.depth());
        Self {
            ring,
            reaper,
            slots,
            started: false,
        }
    }

    #[inline]
    pub fn ring(&self) -> &RequestRing<'c, P> {
        &self.ring
    }

    /// Like [`Pump::step`], showing each received datagram to `inspect`
    /// before its slot is reposted. The slice covers the payload only.
    pub fn step_with(
        &mut self,
        mut inspect: impl FnMut(&Completion, &[u8]),
    ) -> Result<StepStats, SessionError> {
        let done = self.reaper.poll(&mut self.ring, self.reaper.batch())?;
        let mut stats = StepStats::default();
        self.slots.clear();
        for c in done {
            if let Some(buf) = self.ring.payload(c.slot) {
                let len = c.payload_len().min(buf.len());
                inspect(c, &buf[..len]);
            }
            self.slots.push(c.slot);
            stats.messages += 1;
            stats.bytes += c.payload_len();
        }
        self.ring.repost(self.slots.iter().copied())?;
        Ok(stats)
    }
}

impl<P: Provider> Pump for RecvPump<'_, P> {
    fn start(&mut self) -> Result<(), SessionError> {
        if !self.started {
            self.ring.post_all()?;
            self.started = true;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<StepStats, SessionError> {
        self.step_with(|_, _| {})
    }

    fn verb(&self) -> &'static str {
        "received"
    }
}

/// Exponential idle backoff between `min` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The next wait, doubling the one after it up to `max`.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    /// Sleep for the next wait.
    pub fn snooze(&mut self) {
        let wait = self.next_wait();
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }

    /// Back to the shortest wait, after useful work.
    #[inline]
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Rate in Gbit/s of `bytes` moved over `elapsed`.
pub fn gbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs / 1e9
}

/// Message and byte counters with periodic reports.
#[derive(Debug)]
pub struct Throughput {
    verb: &'static str,
    start: Instant,
    interval: Option<Duration>,
    last: Instant,
    last_bytes: u64,
    last_messages: u64,
    messages: u64,
    bytes: u64,
}

impl Throughput {
    /// A meter that logs every `interval`, or never if `None`.
    pub fn new(verb: &'static str, interval: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            verb,
            start: now,
            interval,
            last: now,
            last_bytes: 0,
            last_messages: 0,
            messages: 0,
            bytes: 0,
        }
    }

    #[inline]
    pub fn messages(&self) -> u64 {
        self.messages
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Account for one iteration, reporting if an interval has passed.
    pub fn record(&mut self, stats: StepStats) {
        self.messages += stats.messages as u64;
        self.bytes += stats.bytes as u64;

        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        if elapsed < interval {
            return;
        }
        log::info!(
            "{} {} messages, {:.3} Gbit/s",
            self.verb,
            self.messages - self.last_messages,
            gbps(self.bytes - self.last_bytes, elapsed)
        );
        self.last = now;
        self.last_bytes = self.bytes;
        self.last_messages = self.messages;
    }

    pub fn summary(&self) -> LoopSummary {
        LoopSummary {
            messages: self.messages,
            bytes: self.bytes,
            elapsed: self.start.elapsed(),
        }
    }
}

/// Totals of a finished loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSummary {
    pub messages: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl LoopSummary {
    #[inline]
    pub fn gbps(&self) -> f64 {
        gbps(self.bytes, self.elapsed)
    }
}

/// How [`run_loop`] paces and ends itself.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub report_interval: Option<Duration>,
    /// Stop after this many messages, if set.
    pub max_messages: Option<u64>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::from(&BenchConfig::default())
    }
}

impl From<&BenchConfig> for LoopOptions {
    fn from(config: &BenchConfig) -> Self {
        Self {
            backoff_min: Duration::from_micros(config.backoff_min_us),
            backoff_max: Duration::from_micros(config.backoff_max_us),
            report_interval: (config.report_interval_ms > 0)
                .then(|| Duration::from_millis(config.report_interval_ms)),
            max_messages: None,
        }
    }
}

/// Drive `pump` until `stop` is raised, `max_messages` is reached, or
/// anything fails.
///
/// The flag is checked once per iteration. The caller tears the session
/// down afterwards, whichever way the loop ended.
pub fn run_loop<Pm: Pump>(
    pump: &mut Pm,
    stop: &AtomicBool,
    opts: &LoopOptions,
) -> Result<LoopSummary, SessionError> {
    pump.start()?;

    let mut backoff = Backoff::new(opts.backoff_min, opts.backoff_max);
    let mut meter = Throughput::new(pump.verb(), opts.report_interval);
    while !stop.load(Ordering::Relaxed) {
        if opts.max_messages.is_some_and(|max| meter.messages() >= max) {
            break;
        }
        let stats = pump.step()?;
        if stats.messages == 0 {
            backoff.snooze();
        } else {
            backoff.reset();
            meter.record(stats);
        }
    }

    let summary = meter.summary();
    log::info!(
        "{} {} messages ({} bytes) in {:?}, {:.3} Gbit/s",
        pump.verb(),
        summary.messages,
        summary.bytes,
        summary.elapsed,
        summary.gbps()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::context::TransportContext;
    use crate::rdma::provider::{SoftDevice, SoftFabric};

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut b = Backoff::new(Duration::from_micros(1), Duration::from_micros(5));
        assert_eq!(b.next_wait(), Duration::from_micros(1));
        assert_eq!(b.next_wait(), Duration::from_micros(2));
        assert_eq!(b.next_wait(), Duration::from_micros(4));
        assert_eq!(b.next_wait(), Duration::from_micros(5));
        assert_eq!(b.next_wait(), Duration::from_micros(5));
        b.reset();
        assert_eq!(b.next_wait(), Duration::from_micros(1));
    }

    #[test]
    fn test_gbps() {
        assert_eq!(gbps(125_000_000, Duration::from_secs(1)), 1.0);
        assert_eq!(gbps(1, Duration::ZERO), 0.0);
    }

    #[test]
    fn test_options_from_config() {
        let config = BenchConfig {
            report_interval_ms: 0,
            ..Default::default()
        };
        let opts = LoopOptions::from(&config);
        assert_eq!(opts.backoff_min, Duration::from_micros(1));
        assert_eq!(opts.backoff_max, Duration::from_millis(1));
        assert_eq!(opts.report_interval, None);
    }

    #[test]
    fn test_loop_counts_messages() {
        let fabric = SoftFabric::new()
            .with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()))
            .with_device(SoftDevice::new("soft1", 2, "fe80::2".parse().unwrap()));

        let rx = TransportContext::open(&fabric, "soft0", 8).unwrap();
        let tx = TransportContext::open_sender(&fabric, "soft1", 8, &rx.endpoint()).unwrap();

        let mut recv = RecvPump::new(
            RequestRing::receiver(&rx, 256).unwrap(),
            CompletionReaper::new(&rx, 8),
        );
        let mut send = SendPump::new(
            RequestRing::sender(&tx, 256).unwrap(),
            CompletionReaper::new(&tx, 4),
        );

        recv.start().unwrap();
        let stop = AtomicBool::new(false);
        let opts = LoopOptions {
            max_messages: Some(32),
            report_interval: None,
            ..Default::default()
        };
        let sent = run_loop(&mut send, &stop, &opts).unwrap();
        assert!(sent.messages >= 32);
        assert_eq!(sent.bytes, sent.messages * 256);
        assert_eq!(send.ring().outstanding(), 8);

        // Only the receives posted up front were there to catch datagrams;
        // the rest were dropped by the fabric.
        let stats = recv.step().unwrap();
        assert_eq!(stats.messages, 8);
        assert_eq!(stats.bytes, 8 * 256);
        assert_eq!(recv.ring().outstanding(), 8);

        let fabric_stats = fabric.stats();
        assert_eq!(fabric_stats.delivered, 8);
        assert_eq!(fabric_stats.dropped_no_recv, sent.messages);
    }

    #[test]
    fn test_stop_flag() {
        let fabric =
            SoftFabric::new().with_device(SoftDevice::new("soft0", 1, "fe80::1".parse().unwrap()));
        let rx = TransportContext::open(&fabric, "soft0", 4).unwrap();
        let mut recv = RecvPump::new(
            RequestRing::receiver(&rx, 64).unwrap(),
            CompletionReaper::new(&rx, 4),
        );
        let stop = AtomicBool::new(true);
        let summary = run_loop(&mut recv, &stop, &LoopOptions::default()).unwrap();
        assert_eq!(summary.messages, 0);
        assert_eq!(recv.ring().outstanding(), 4);
    }
}

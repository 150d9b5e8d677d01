//! Flow timeout and report worker
//!
//! Wakes on a fixed tick, evicts flows idle for longer than the timeout and,
//! when periodic reporting is on, emits a report for every live flow.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::counters::CounterNames;
use super::flowid::FlowIdView;
use super::table::{Flow, FlowTable, ScanAction};
use crate::error::{Error, Result};
use crate::publish::{Event, Publisher, Spooler, DEFAULT_SPOOL_SIZE};

/// The first pass runs on the next wall clock multiple of this
const ALIGNMENT: Duration = Duration::from_secs(10);

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Worker wake-up schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticks {
    pub tick: Duration,
    pub timeout_ticks: u32,
    pub period_ticks: Option<u32>,
}

pub fn compute_ticks(timeout: Duration, period: Option<Duration>) -> Result<Ticks> {
    if timeout < MIN_INTERVAL {
        return Err(Error::InvalidTimeout(timeout));
    }
    if let Some(period) = period {
        if period < MIN_INTERVAL {
            return Err(Error::InvalidPeriod(period));
        }
    }

    let tick = match period {
        Some(period) => {
            let ms = gcd(timeout.as_millis() as u64, period.as_millis() as u64);
            Duration::from_millis(ms).max(MIN_INTERVAL)
        }
        None => timeout,
    };

    let ticks_in = |d: Duration| ((d.as_millis() / tick.as_millis()) as u32).max(1);
    Ok(Ticks {
        tick,
        timeout_ticks: ticks_in(timeout),
        period_ticks: period.map(ticks_in),
    })
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Countdown to the next timeout check and report
#[derive(Debug, Clone)]
pub struct TickSchedule {
    ticks: Ticks,
    timeout_left: u32,
    period_left: Option<u32>,
}

impl TickSchedule {
    pub fn new(ticks: Ticks) -> Self {
        Self {
            ticks,
            timeout_left: ticks.timeout_ticks,
            period_left: ticks.period_ticks,
        }
    }

    /// Advance one tick; returns `(check_timeout, report)`
    pub fn next(&mut self) -> (bool, bool) {
        self.timeout_left -= 1;
        let check_timeout = self.timeout_left == 0;
        if check_timeout {
            self.timeout_left = self.ticks.timeout_ticks;
        }

        let report = match (&mut self.period_left, self.ticks.period_ticks) {
            (Some(left), Some(period)) => {
                *left -= 1;
                if *left == 0 {
                    *left = period;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        (check_timeout, report)
    }
}

/// Delay from `now` to the next alignment boundary
pub fn align_delay(now: DateTime<Utc>) -> Duration {
    let window = ALIGNMENT.as_millis() as i64;
    let into = now.timestamp_millis().rem_euclid(window);
    Duration::from_millis((window - into) as u64)
}

/// Result of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub evicted: usize,
    pub reported: usize,
}

pub struct FlowWorker {
    table: Arc<FlowTable>,
    timeout: TimeDelta,
    ticks: Ticks,
    spool: Spooler,
}

impl FlowWorker {
    pub fn new(
        table: Arc<FlowTable>,
        timeout: Duration,
        period: Option<Duration>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let ticks = compute_ticks(timeout, period)?;
        let timeout_delta =
            TimeDelta::from_std(timeout).map_err(|_| Error::InvalidTimeout(timeout))?;
        Ok(Self {
            table,
            timeout: timeout_delta,
            ticks,
            spool: Spooler::new(publisher, DEFAULT_SPOOL_SIZE),
        })
    }

    pub fn ticks(&self) -> Ticks {
        self.ticks
    }

    pub fn reporting(&self) -> bool {
        self.ticks.period_ticks.is_some()
    }

    /// One pass over every shard
    pub fn execute(&mut self, now: DateTime<Utc>, check_timeout: bool, report: bool) -> PassStats {
        self.pass(now, check_timeout, report, false)
    }

    fn pass(
        &mut self,
        now: DateTime<Utc>,
        check_timeout: bool,
        report: bool,
        last: bool,
    ) -> PassStats {
        let mut stats = PassStats::default();
        if !check_timeout && !report {
            return stats;
        }

        let names = self.table.counters().snapshot();
        let timeout = self.timeout;
        let spool = &mut self.spool;

        for shard in self.table.shards() {
            let mut guard = shard.lock();
            guard.scan(|flow| {
                if check_timeout && now.signed_duration_since(flow.last_seen) > timeout {
                    spool.push(flow_event(flow, &names, true));
                    stats.evicted += 1;
                    return ScanAction::Remove;
                }
                if report {
                    spool.push(flow_event(flow, &names, last));
                    stats.reported += 1;
                }
                ScanAction::Keep
            });
        }

        spool.flush();
        if stats.evicted > 0 || stats.reported > 0 {
            debug!(
                "Flow pass: {} evicted, {} reported",
                stats.evicted, stats.reported
            );
        }
        stats
    }

    /// Run on the current tokio runtime until stopped
    pub fn spawn(mut self) -> WorkerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let ticks = self.ticks;
            let mut schedule = TickSchedule::new(ticks);

            let start = Instant::now() + align_delay(Utc::now()) + ticks.tick;
            let mut interval = tokio::time::interval_at(start, ticks.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Flow worker started (tick {:?})", ticks.tick);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        let (check_timeout, report) = schedule.next();
                        self.execute(Utc::now(), check_timeout, report);
                    }
                }
            }

            if self.reporting() {
                self.pass(Utc::now(), false, true, true);
            }
            info!("Flow worker stopped");
        });

        WorkerHandle { stop_tx, task }
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker and wait for its last pass
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

/// Report event for one flow
pub fn flow_event(flow: &Flow, names: &CounterNames, is_final: bool) -> Event {
    let key = flow.key();
    let mut event = Event::new(flow.last_seen);

    event
        .put("type", "flow")
        .put("flow.id", key.encoded())
        .put("flow.final", is_final)
        .put("event.start", flow.created.to_rfc3339())
        .put("event.end", flow.last_seen.to_rfc3339())
        .put(
            "event.duration",
            flow.last_seen
                .signed_duration_since(flow.created)
                .num_nanoseconds()
                .unwrap_or(i64::MAX),
        );

    if let Some(vlan) = key.vlan() {
        event.put("flow.vlan", vlan);
    }
    if let Some(vlan) = key.outer_vlan() {
        event.put("flow.outer.vlan", vlan);
    }
    if let Some((src, dst)) = key.eth() {
        event
            .put("source.mac", format_mac(&src))
            .put("destination.mac", format_mac(&dst));
    }

    if let Some((src, dst)) = key.ipv4() {
        event
            .put("network.type", "ipv4")
            .put("source.ip", src.to_string())
            .put("destination.ip", dst.to_string());
    } else if let Some((src, dst)) = key.ipv6() {
        event
            .put("network.type", "ipv6")
            .put("source.ip", src.to_string())
            .put("destination.ip", dst.to_string());
    }
    if let Some((src, dst)) = key.outer_ipv4() {
        event
            .put("flow.outer.source.ip", src.to_string())
            .put("flow.outer.destination.ip", dst.to_string());
    } else if let Some((src, dst)) = key.outer_ipv6() {
        event
            .put("flow.outer.source.ip", src.to_string())
            .put("flow.outer.destination.ip", dst.to_string());
    }

    let transport = if let Some((src, dst)) = key.tcp() {
        event.put("source.port", src).put("destination.port", dst);
        Some("tcp")
    } else if let Some((src, dst)) = key.udp() {
        event.put("source.port", src).put("destination.port", dst);
        Some("udp")
    } else if key.icmpv4_id().is_some() {
        Some("icmp")
    } else if key.icmpv6_id().is_some() {
        Some("ipv6-icmp")
    } else {
        None
    };
    if let Some(transport) = transport {
        event.put("network.transport", transport);
    }
    if let Some(id) = key.connection_id() {
        event.put("flow.connection_id", id);
    }

    let mut packets = 0u64;
    let mut bytes = 0u64;
    for (prefix, stats) in [("source", flow.source_stats()), ("destination", flow.dest_stats())] {
        for (name, value) in stats.named_values(names) {
            match name {
                "packets" => packets += value.as_u64().unwrap_or(0),
                "bytes" => bytes += value.as_u64().unwrap_or(0),
                _ => {}
            }
            event.put(&format!("{}.stats.{}", prefix, name), value);
        }
    }
    event
        .put("network.packets", Value::from(packets))
        .put("network.bytes", Value::from(bytes));

    event
}

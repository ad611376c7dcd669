/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use super::bucket_store::{Hashtable, Reconfigurable, StoreParams};
use super::clock::{Clock, SystemClock};
use super::error::{Error, Result};
use super::flow_hashtable::FlowHashtable;
use super::packet::Packet;
use super::packet_hashtable::PacketHashtable;
use super::record::DataRecord;
use super::rule::Rule;
use super::rules::RuleSet;
use super::sink::RecordSink;
use crate::config::AggregatorConfig;
use crate::utils::stats::{
    AtomicTimeStats, Collector, Countable, Counter, CounterType, CounterValue, RefCountable,
    StatsOption,
};

pub type FlowAggregator = Aggregator<FlowHashtable>;
pub type PacketAggregator = Aggregator<PacketHashtable>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Built,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Prepared,
    Switched,
}

#[derive(Default)]
pub struct AggregatorCounter {
    pub received: AtomicU64,
    pub ignored: AtomicU64,
    pub expire_time: AtomicTimeStats,
}

impl RefCountable for AggregatorCounter {
    fn get_counters(&self) -> Vec<Counter> {
        let (avg, max) = self.expire_time.take();
        vec![
            (
                "received",
                CounterType::Counted,
                CounterValue::Unsigned(self.received.swap(0, Ordering::Relaxed)),
            ),
            (
                "ignored",
                CounterType::Counted,
                CounterValue::Unsigned(self.ignored.swap(0, Ordering::Relaxed)),
            ),
            ("expire_avg_ns", CounterType::Gauged, CounterValue::Unsigned(avg)),
            ("expire_max_ns", CounterType::Gauged, CounterValue::Unsigned(max)),
        ]
    }
}

struct RuleTable<H> {
    rule: Rule,
    table: Arc<H>,
}

impl<H> Clone for RuleTable<H> {
    fn clone(&self) -> Self {
        Self {
            rule: self.rule.clone(),
            table: self.table.clone(),
        }
    }
}

type Tables<H> = Arc<ArcSwap<Vec<RuleTable<H>>>>;

/// Owns one bucket store per rule and the thread that expires them.
pub struct Aggregator<H: Hashtable> {
    params: StoreParams,
    poll_interval: Duration,
    sink: Arc<dyn RecordSink>,
    clock: Arc<dyn Clock>,

    tables: Tables<H>,
    // staged by reconfigure, swapped in by on_reconfiguration1
    pending: Mutex<Option<Vec<RuleTable<H>>>>,
    phase: Mutex<Phase>,
    state: Mutex<State>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,

    counter: Arc<AggregatorCounter>,
    stats: Mutex<Option<Arc<Collector>>>,
}

impl<H: Hashtable> Aggregator<H> {
    pub fn new(config: &AggregatorConfig, sink: Arc<dyn RecordSink>) -> Result<Self> {
        Self::with_clock(config, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &AggregatorConfig,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        let params = StoreParams {
            min_buffer_time: config.expiration.inactive_timeout,
            max_buffer_time: config.expiration.active_timeout,
            hashtable_bits: config.hashtable_bits,
        };
        Self::with_rules(
            RuleSet::from_config(config)?,
            params,
            config.poll_interval,
            sink,
            clock,
        )
    }

    pub fn with_rules(
        rules: RuleSet,
        params: StoreParams,
        poll_interval: Duration,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut tables = Vec::with_capacity(rules.len());
        for rule in rules {
            let table = H::build(&rule, params, sink.clone(), clock.clone())?;
            tables.push(RuleTable {
                rule,
                table: Arc::new(table),
            });
        }
        info!(
            "{} aggregator built with {} rules, polling every {:?}",
            H::NAME,
            tables.len(),
            poll_interval
        );
        Ok(Self {
            params,
            poll_interval,
            sink,
            clock,
            tables: Arc::new(ArcSwap::from_pointee(tables)),
            pending: Mutex::new(None),
            phase: Mutex::new(Phase::Idle),
            state: Mutex::new(State::Built),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
            counter: Arc::new(AggregatorCounter::default()),
            stats: Mutex::new(None),
        })
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn counter(&self) -> &Arc<AggregatorCounter> {
        &self.counter
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.tables.load().iter().map(|t| t.rule.clone()).collect()
    }

    pub fn table(&self, template_id: u16) -> Option<Arc<H>> {
        self.tables
            .load()
            .iter()
            .find(|t| t.rule.id == template_id)
            .map(|t| t.table.clone())
    }

    /// Number of aggregates buffered over all rules.
    pub fn buffered(&self) -> usize {
        self.tables
            .load()
            .iter()
            .map(|t| t.table.store().len())
            .sum()
    }

    pub fn register_stats(&self, collector: Arc<Collector>) {
        collector.register_countable(
            "aggregator",
            Countable::Ref(Arc::downgrade(&self.counter) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("kind", H::NAME.to_owned())],
        );
        for t in self.tables.load().iter() {
            register_table(&collector, t);
        }
        *self.stats.lock() = Some(collector);
    }

    /// Announces every template and starts the expiration thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != State::Built {
            warn!("{} aggregator is {:?}, not starting", H::NAME, *state);
            return Err(Error::InvalidState(*state));
        }
        for t in self.tables.load().iter() {
            t.table.store().perform_start();
        }

        *self.running.0.lock() = true;
        let tables = self.tables.clone();
        let running = self.running.clone();
        let counter = self.counter.clone();
        let interval = self.poll_interval;
        let handle = thread::Builder::new()
            .name(format!("{}-aggregator", H::NAME))
            .spawn(move || expire_loop(tables, running, counter, interval));
        match handle {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => {
                *self.running.0.lock() = false;
                return Err(Error::Config(format!(
                    "failed to spawn expiration thread: {}",
                    e
                )));
            }
        }
        *state = State::Running;
        info!("{} aggregator started", H::NAME);
        Ok(())
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        let (running, timer) = &*self.running;
        *running.lock() = false;
        timer.notify_all();
        self.thread.lock().take()
    }

    /// Withdraws every template and joins the expiration thread. With
    /// `properly` set, everything still buffered is exported afterwards.
    pub fn shutdown(&self, properly: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != State::Running {
                warn!("{} aggregator is {:?}, not shutting down", H::NAME, *state);
                return Err(Error::InvalidState(*state));
            }
            *state = State::ShuttingDown;
        }
        info!("stopping {} aggregator", H::NAME);
        let tables = self.tables.load_full();
        for t in tables.iter() {
            t.table.store().perform_shutdown();
        }
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
        }
        if properly {
            for t in tables.iter() {
                t.table.store().expire(true);
            }
        }
        *self.state.lock() = State::Stopped;
        info!("stopped {} aggregator", H::NAME);
        Ok(())
    }

    /// Runs one expiration pass over every store on the calling thread.
    pub fn expire(&self, force: bool) {
        let start = Instant::now();
        for t in self.tables.load().iter() {
            t.table.store().expire(force);
        }
        self.counter.expire_time.update(start.elapsed());
    }

    fn process(&self, input: &H::Input) {
        self.counter.received.fetch_add(1, Ordering::Relaxed);
        let mut matched = false;
        for t in self.tables.load().iter() {
            if H::accepts(&t.rule, input) {
                t.table.aggregate(input);
                matched = true;
            }
        }
        if !matched {
            self.counter.ignored.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pre_reconfiguration(&self) -> Result<()> {
        self.advance(Phase::Idle, Phase::Prepared, "pre_reconfiguration")?;
        for t in self.tables.load().iter() {
            t.table.store().pre_reconfiguration();
        }
        Ok(())
    }

    pub fn on_reconfiguration1(&self) -> Result<()> {
        self.advance(Phase::Prepared, Phase::Switched, "on_reconfiguration1")?;
        let current = self.tables.load_full();
        for t in current.iter() {
            t.table.store().on_reconfiguration1();
        }
        let next = match self.pending.lock().take() {
            Some(next) => next,
            None => return Ok(()),
        };
        for t in current.iter() {
            if !next.iter().any(|n| Arc::ptr_eq(&n.table, &t.table)) {
                info!("template {}: rule removed", t.rule.id);
                t.table.store().perform_shutdown();
            }
        }
        self.tables.store(Arc::new(next));
        Ok(())
    }

    pub fn post_reconfiguration(&self) -> Result<()> {
        self.advance(Phase::Switched, Phase::Idle, "post_reconfiguration")?;
        if self.state() != State::Running {
            // announced by the next start
            return Ok(());
        }
        for t in self.tables.load().iter() {
            let store = t.table.store();
            if store.layout().is_destroyed() {
                store.perform_start();
            } else {
                store.post_reconfiguration();
            }
        }
        Ok(())
    }

    /// Swaps in a new rule set. Rules present before and after keep their store
    /// and buffered aggregates, removed rules are withdrawn and new ones
    /// announced.
    pub fn reconfigure(&self, rules: RuleSet) -> Result<()> {
        let current = self.tables.load_full();
        let mut next = Vec::with_capacity(rules.len());
        let mut added = vec![];
        for rule in rules {
            if let Some(t) = current.iter().find(|t| t.rule == rule) {
                next.push(t.clone());
                continue;
            }
            let table = Arc::new(H::build(
                &rule,
                self.params,
                self.sink.clone(),
                self.clock.clone(),
            )?);
            // new layouts start out withdrawn
            table.store().layout().set_destroyed(true);
            info!("template {}: rule added", rule.id);
            next.push(RuleTable { rule, table });
            added.push(next.len() - 1);
        }

        *self.pending.lock() = Some(next.clone());
        if let Err(e) = self
            .pre_reconfiguration()
            .and_then(|_| self.on_reconfiguration1())
            .and_then(|_| self.post_reconfiguration())
        {
            self.pending.lock().take();
            return Err(e);
        }

        if let Some(collector) = self.stats.lock().as_ref() {
            for i in added {
                register_table(collector, &next[i]);
            }
        }
        Ok(())
    }

    fn advance(&self, from: Phase, to: Phase, name: &'static str) -> Result<()> {
        let mut phase = self.phase.lock();
        if *phase != from {
            warn!(
                "{} aggregator: {} called in phase {:?}",
                H::NAME,
                name,
                *phase
            );
            return Err(Error::ReconfigurationOrder { phase: name });
        }
        debug!("{} aggregator: {}", H::NAME, name);
        *phase = to;
        Ok(())
    }
}

impl Aggregator<FlowHashtable> {
    /// Feeds a decoded record to every rule it matches.
    pub fn on_data_record(&self, record: &DataRecord) {
        self.process(record)
    }
}

impl Aggregator<PacketHashtable> {
    pub fn on_packet(&self, packet: &Packet) {
        self.process(packet)
    }
}

impl<H: Hashtable> Drop for Aggregator<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
        }
    }
}

fn register_table<H: Hashtable>(collector: &Collector, t: &RuleTable<H>) {
    collector.register_countable(
        "aggregator_bucket_store",
        Countable::Ref(Arc::downgrade(t.table.store().counter()) as Weak<dyn RefCountable>),
        vec![
            StatsOption::Tag("kind", H::NAME.to_owned()),
            StatsOption::Tag("template_id", t.rule.id.to_string()),
        ],
    );
}

fn expire_loop<H: Hashtable>(
    tables: Tables<H>,
    running: Arc<(Mutex<bool>, Condvar)>,
    counter: Arc<AggregatorCounter>,
    interval: Duration,
) {
    info!("polling {} aggregator every {:?}", H::NAME, interval);
    loop {
        {
            let (running, timer) = &*running;
            let mut running = running.lock();
            if !*running {
                break;
            }
            timer.wait_for(&mut running, interval);
            if !*running {
                break;
            }
        }
        let start = Instant::now();
        for t in tables.load().iter() {
            t.table.store().expire(false);
        }
        let elapsed = start.elapsed();
        counter.expire_time.update(elapsed);
        if elapsed > interval {
            debug!(
                "{} aggregator: expiration pass took {:?}, longer than poll interval",
                H::NAME,
                elapsed
            );
        }
    }
    debug!("{} aggregator expiration thread exited", H::NAME);
}

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

use std::fmt;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

pub use public::counter::*;

const TICK_CYCLE: Duration = Duration::from_secs(10);

pub enum StatsOption {
    Tag(&'static str, String),
    Interval(Duration),
}

struct Source {
    module: &'static str,
    interval: Duration,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
    // countdown to next metrics collection
    skip: i64,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

#[derive(Debug)]
pub struct Batch {
    pub module: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub points: Vec<Counter>,
    pub timestamp: u32,
}

impl Batch {
    pub fn get(&self, name: &str) -> Option<CounterValue> {
        self.points.iter().find(|p| p.0 == name).map(|p| p.2)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.module)?;
        for (k, v) in self.tags.iter() {
            write!(f, ",{}={}", k, v)?;
        }
        for (i, p) in self.points.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { " " } else { "," }, p.0, p.2)?;
        }
        write!(f, " {}", self.timestamp)
    }
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Periodically reads every registered countable and logs the values.
pub struct Collector {
    sources: Arc<Mutex<Vec<Source>>>,

    min_interval: Duration,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::with_min_interval(TICK_CYCLE)
    }

    pub fn with_min_interval(interval: Duration) -> Self {
        let min_interval = if interval <= TICK_CYCLE {
            TICK_CYCLE
        } else {
            Duration::from_secs(
                (interval.as_secs() + TICK_CYCLE.as_secs() - 1) / TICK_CYCLE.as_secs()
                    * TICK_CYCLE.as_secs(),
            )
        };
        Self {
            sources: Arc::new(Mutex::new(vec![])),
            min_interval,
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            interval: self.min_interval,
            countable,
            tags: vec![],
            skip: 0,
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                StatsOption::Interval(interval) if interval >= self.min_interval => {
                    source.interval = Duration::from_secs(
                        interval.as_secs() / TICK_CYCLE.as_secs() * TICK_CYCLE.as_secs(),
                    )
                }
                _ => warn!(
                    "ignored duplicated tag or invalid interval for module {}",
                    source.module
                ),
            }
        }
        let mut sources = self.sources.lock();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "Found duplicated counter source {}, please check if the old one is correctly closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    pub fn deregister_countables<I>(&self, countables: I)
    where
        I: Iterator<Item = (&'static str, Vec<StatsOption>)>,
    {
        let mut tags = vec![];
        let mut sources = self.sources.lock();
        for (module, options) in countables {
            tags.clear();
            for option in options {
                match option {
                    StatsOption::Tag(k, v) if !tags.iter().any(|(key, _)| key == &k) => {
                        tags.push((k, v))
                    }
                    _ => (),
                }
            }
            sources.retain(|s| !(s.module == module && s.tags == tags));
        }
    }

    pub fn source_count(&self) -> usize {
        let mut sources = self.sources.lock();
        sources.retain(|s| !s.countable.closed());
        sources.len()
    }

    /// Reads every live source now, regardless of its interval.
    pub fn collect(&self) -> Vec<Batch> {
        let mut sources = self.sources.lock();
        sources.retain(|s| !s.countable.closed());
        let timestamp = unix_timestamp();
        sources
            .iter()
            .filter_map(|s| {
                let points = s.countable.get_counters();
                if points.is_empty() {
                    return None;
                }
                Some(Batch {
                    module: s.module,
                    tags: s.tags.clone(),
                    points,
                    timestamp,
                })
            })
            .collect()
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        let (running, timer) = &*self.running;
        *running.lock() = false;
        timer.notify_all();
        self.thread.lock().take()
    }

    pub fn stop(&self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
            info!("stats collector stopped");
        }
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let min_interval = self.min_interval;
        let handle = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || loop {
                let now = unix_timestamp();
                {
                    let mut sources = sources.lock();
                    sources.retain(|s| !s.countable.closed());
                    for source in sources.iter_mut() {
                        source.skip -= 1;
                        if source.skip > 0 {
                            continue;
                        }
                        source.skip = (source.interval.max(min_interval).as_secs()
                            / TICK_CYCLE.as_secs()) as i64;
                        let points = source.countable.get_counters();
                        if !points.is_empty() {
                            let batch = Batch {
                                module: source.module,
                                tags: source.tags.clone(),
                                points,
                                timestamp: now,
                            };
                            info!("{}", batch);
                        }
                    }
                }

                let (running, timer) = &*running;
                let mut running = running.lock();
                if !*running {
                    break;
                }
                timer.wait_for(&mut running, TICK_CYCLE);
                if !*running {
                    break;
                }
            });
        match handle {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => {
                warn!("failed to spawn stats collector: {}", e);
                *self.running.0.lock() = false;
            }
        }
        debug!("stats collector started");
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Default)]
pub struct AtomicTimeStats {
    pub count: AtomicU32,
    pub sum_ns: AtomicU64,
    pub max_ns: AtomicU64,
}

impl AtomicTimeStats {
    pub fn update(&self, duration: Duration) {
        self.sum_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .max_ns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                let nanos = duration.as_nanos() as u64;
                if x < nanos {
                    Some(nanos)
                } else {
                    None
                }
            });
    }

    /// Average and maximum since the previous call, in nanoseconds.
    pub fn take(&self) -> (u64, u64) {
        let count = self.count.swap(0, Ordering::Relaxed) as u64;
        let sum = self.sum_ns.swap(0, Ordering::Relaxed);
        let max = self.max_ns.swap(0, Ordering::Relaxed);
        if count == 0 {
            (0, 0)
        } else {
            (sum / count, max)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    #[derive(Default)]
    struct Queue {
        len: AtomicU64,
        dropped: AtomicU64,
    }

    impl RefCountable for Queue {
        fn get_counters(&self) -> Vec<Counter> {
            vec![
                (
                    "len",
                    CounterType::Gauged,
                    CounterValue::Unsigned(self.len.load(Ordering::Relaxed)),
                ),
                (
                    "dropped",
                    CounterType::Counted,
                    CounterValue::Unsigned(self.dropped.swap(0, Ordering::Relaxed)),
                ),
            ]
        }
    }

    #[test]
    fn collect_and_close() {
        let collector = Collector::new();
        let q = Arc::new(Queue::default());
        q.len.store(7, Ordering::Relaxed);
        q.dropped.store(2, Ordering::Relaxed);
        collector.register_countable(
            "queue",
            Countable::Ref(Arc::downgrade(&q) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("index", "0".to_owned())],
        );

        let batches = collector.collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].tag("index"), Some("0"));
        assert_eq!(batches[0].get("len"), Some(CounterValue::Unsigned(7)));
        assert_eq!(batches[0].get("dropped"), Some(CounterValue::Unsigned(2)));
        let batches = collector.collect();
        assert_eq!(batches[0].get("dropped"), Some(CounterValue::Unsigned(0)));

        drop(q);
        assert!(collector.collect().is_empty());
        assert_eq!(collector.source_count(), 0);
    }

    #[test]
    fn duplicated_sources_are_replaced() {
        let collector = Collector::new();
        let a = Arc::new(Queue::default());
        let b = Arc::new(Queue::default());
        b.len.store(3, Ordering::Relaxed);
        for q in [&a, &b] {
            collector.register_countable(
                "queue",
                Countable::Ref(Arc::downgrade(q) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("index", "1".to_owned())],
            );
        }
        let batches = collector.collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].get("len"), Some(CounterValue::Unsigned(3)));

        collector.deregister_countables(
            vec![("queue", vec![StatsOption::Tag("index", "1".to_owned())])].into_iter(),
        );
        assert_eq!(collector.source_count(), 0);
    }

    #[test]
    fn start_and_stop() {
        let collector = Collector::new();
        collector.start();
        collector.start();
        collector.stop();
        assert!(collector.notify_stop().is_none());
    }

    #[test]
    fn time_stats() {
        let stats = AtomicTimeStats::default();
        stats.update(Duration::from_nanos(100));
        stats.update(Duration::from_nanos(300));
        assert_eq!(stats.take(), (200, 300));
        assert_eq!(stats.take(), (0, 0));
    }
}

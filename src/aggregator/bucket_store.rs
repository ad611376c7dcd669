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

//! Storage shared by the record and packet aggregation strategies.
//!
//! Buckets live in an arena and are addressed by index. Every live bucket is on
//! the expiry list, ordered by the time it was last scheduled; buckets that can
//! still absorb records are additionally linked into the chain of their hash
//! slot. One mutex guards the whole table, so each aggregation or expiration pass
//! sees a consistent state.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use flate2::Crc;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use public::counter::{Counter, CounterType, CounterValue, RefCountable};

use super::clock::Clock;
use super::error::Result;
use super::rule::Rule;
use super::sink::{AggregateRecord, ExportEvent, RecordSink};
use super::template::TemplateLayout;

const LOCK_CONTENTION_THRESHOLD: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreParams {
    // inactive timeout
    pub min_buffer_time: Duration,
    // active timeout
    pub max_buffer_time: Duration,
    pub hashtable_bits: u8,
}

/// The three ordered phases of a rule set swap.
pub trait Reconfigurable {
    fn pre_reconfiguration(&self);
    fn on_reconfiguration1(&self);
    fn post_reconfiguration(&self);
}

/// An aggregation strategy on top of a [`BucketStore`].
pub trait Hashtable: Send + Sync + Sized + 'static {
    type Input;

    // stats tag of the aggregators built on this strategy
    const NAME: &'static str;

    fn build(
        rule: &Rule,
        params: StoreParams,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>;

    fn store(&self) -> &BucketStore;

    /// Whether `input` is eligible for `rule` at all.
    fn accepts(rule: &Rule, input: &Self::Input) -> bool;

    fn aggregate(&self, input: &Self::Input);
}

#[derive(Default)]
pub struct BucketStoreCounter {
    pub entries: AtomicU64,
    pub empty_slots: AtomicU64,
    pub multi_entry_chains: AtomicU64,
    pub exported: AtomicU64,
    pub exported_total: AtomicU64,
    pub records_received: AtomicU64,
    pub forced_expiries: AtomicU64,
    last_read: Mutex<Option<Instant>>,
}

impl RefCountable for BucketStoreCounter {
    fn get_counters(&self) -> Vec<Counter> {
        let exported = self.exported.swap(0, Ordering::Relaxed);
        let now = Instant::now();
        let rate = match self.last_read.lock().replace(now) {
            Some(last) if now > last => exported as f64 / (now - last).as_secs_f64(),
            _ => 0.0,
        };
        vec![
            (
                "entries",
                CounterType::Gauged,
                CounterValue::Unsigned(self.entries.load(Ordering::Relaxed)),
            ),
            (
                "empty_slots",
                CounterType::Gauged,
                CounterValue::Unsigned(self.empty_slots.load(Ordering::Relaxed)),
            ),
            (
                "multi_entry_chains",
                CounterType::Gauged,
                CounterValue::Unsigned(self.multi_entry_chains.load(Ordering::Relaxed)),
            ),
            ("exported", CounterType::Counted, CounterValue::Unsigned(exported)),
            ("exported_rate", CounterType::Gauged, CounterValue::Float(rate)),
            (
                "exported_total",
                CounterType::Gauged,
                CounterValue::Unsigned(self.exported_total.load(Ordering::Relaxed)),
            ),
            (
                "records_received",
                CounterType::Counted,
                CounterValue::Unsigned(self.records_received.swap(0, Ordering::Relaxed)),
            ),
            (
                "forced_expiries",
                CounterType::Counted,
                CounterValue::Unsigned(self.forced_expiries.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// CRC32 over key bytes, optionally seeded.
pub(super) struct BucketHasher(Crc);

impl BucketHasher {
    pub fn new() -> Self {
        Self(Crc::new())
    }

    pub fn with_seed(seed: u32) -> Self {
        let mut h = Self::new();
        h.update(&seed.to_be_bytes());
        h
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(&self, mask: u32) -> u32 {
        self.0.sum() & mask
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub(super) struct Bucket {
    pub data: Vec<u8>,
    pub expire_at: Duration,
    pub force_expire_at: Duration,
    pub observation_domain_id: u32,
    // replaced by a newer bucket, waiting for export
    pub force_expiry: bool,
    hash: u32,
    in_table: bool,
    chain: Link,
    expiry: Link,
}

pub(super) struct BucketTable {
    slots: Vec<Option<usize>>,
    arena: Vec<Bucket>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    resend_template: bool,
    counter: Arc<BucketStoreCounter>,
}

impl BucketTable {
    fn new(bits: u8, counter: Arc<BucketStoreCounter>) -> Self {
        let size = 1usize << bits;
        counter.empty_slots.store(size as u64, Ordering::Relaxed);
        counter.entries.store(0, Ordering::Relaxed);
        counter.multi_entry_chains.store(0, Ordering::Relaxed);
        Self {
            slots: vec![None; size],
            arena: vec![],
            free: vec![],
            head: None,
            tail: None,
            len: 0,
            resend_template: false,
            counter,
        }
    }

    pub fn mask(&self) -> u32 {
        (self.slots.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, index: usize) -> &Bucket {
        &self.arena[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Bucket {
        &mut self.arena[index]
    }

    /// Walks the chain of `hash` and returns the first bucket accepted by `eq`.
    pub fn find<F: FnMut(&[u8]) -> bool>(&self, hash: u32, mut eq: F) -> Option<usize> {
        let mut cur = self.slots[hash as usize];
        while let Some(index) = cur {
            let bucket = &self.arena[index];
            if eq(&bucket.data) {
                return Some(index);
            }
            cur = bucket.chain.next;
        }
        None
    }

    /// Adds a bucket at the head of its chain and the tail of the expiry list.
    pub fn insert(
        &mut self,
        hash: u32,
        data: Vec<u8>,
        now: Duration,
        params: &StoreParams,
        observation_domain_id: u32,
    ) -> usize {
        let bucket = Bucket {
            data,
            expire_at: now + params.min_buffer_time,
            force_expire_at: now + params.max_buffer_time,
            observation_domain_id,
            ..Default::default()
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.arena[index] = bucket;
                index
            }
            None => {
                self.arena.push(bucket);
                self.arena.len() - 1
            }
        };
        self.link_chain(index, hash);
        self.push_expiry(index);
        self.len += 1;
        self.counter.entries.fetch_add(1, Ordering::Relaxed);
        index
    }

    fn link_chain(&mut self, index: usize, hash: u32) {
        let old_head = self.slots[hash as usize];
        match old_head {
            Some(h) => {
                self.arena[h].chain.prev = Some(index);
                self.counter
                    .multi_entry_chains
                    .fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.counter.empty_slots.fetch_sub(1, Ordering::Relaxed);
            }
        }
        let bucket = &mut self.arena[index];
        bucket.hash = hash;
        bucket.chain = Link {
            prev: None,
            next: old_head,
        };
        bucket.in_table = true;
        self.slots[hash as usize] = Some(index);
    }

    /// Takes a bucket out of its hash chain; it stays on the expiry list.
    pub fn unlink(&mut self, index: usize) {
        let bucket = &mut self.arena[index];
        if !bucket.in_table {
            return;
        }
        bucket.in_table = false;
        let Link { prev, next } = std::mem::take(&mut bucket.chain);
        let hash = bucket.hash as usize;
        match prev {
            Some(p) => self.arena[p].chain.next = next,
            None => self.slots[hash] = next,
        }
        if let Some(n) = next {
            self.arena[n].chain.prev = prev;
        }
        if prev.is_some() || next.is_some() {
            self.counter
                .multi_entry_chains
                .fetch_sub(1, Ordering::Relaxed);
        } else {
            self.counter.empty_slots.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Moves a bucket to the head of another chain.
    pub fn rehash(&mut self, index: usize, hash: u32) {
        self.unlink(index);
        self.link_chain(index, hash);
    }

    /// Reschedules a bucket after its expiry time moved forward. A bucket whose
    /// active timeout comes first keeps its place.
    pub fn touch(&mut self, index: usize) {
        let bucket = &self.arena[index];
        if bucket.force_expire_at > bucket.expire_at && self.tail != Some(index) {
            self.unlink_expiry(index);
            self.push_expiry(index);
        }
    }

    fn push_expiry(&mut self, index: usize) {
        self.arena[index].expiry = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(t) => self.arena[t].expiry.next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    fn unlink_expiry(&mut self, index: usize) {
        let Link { prev, next } = std::mem::take(&mut self.arena[index].expiry);
        match prev {
            Some(p) => self.arena[p].expiry.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].expiry.prev = prev,
            None => self.tail = prev,
        }
    }

    fn release(&mut self, index: usize) -> Bucket {
        self.unlink(index);
        self.unlink_expiry(index);
        self.free.push(index);
        self.len -= 1;
        self.counter.entries.fetch_sub(1, Ordering::Relaxed);
        std::mem::take(&mut self.arena[index])
    }

    /// Removes the head of the expiry list if it is due.
    fn pop_expired(&mut self, now: Duration, force: bool) -> Option<Bucket> {
        let index = self.head?;
        let bucket = &self.arena[index];
        if force || bucket.force_expiry || bucket.expire_at < now || bucket.force_expire_at < now {
            Some(self.release(index))
        } else {
            None
        }
    }
}

/// A hash table of in-flight aggregates for one rule.
pub struct BucketStore {
    layout: Arc<TemplateLayout>,
    params: StoreParams,
    table: Mutex<BucketTable>,
    sink: Arc<dyn RecordSink>,
    clock: Arc<dyn Clock>,
    counter: Arc<BucketStoreCounter>,
}

impl BucketStore {
    pub fn new(
        rule: &Rule,
        params: StoreParams,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let layout = Arc::new(TemplateLayout::new(rule)?);
        let counter = Arc::new(BucketStoreCounter::default());
        info!(
            "template {}: bucket store with {} slots, inactive timeout {:?}, active timeout {:?}, record length {}+{}",
            rule.id,
            1u64 << params.hashtable_bits,
            params.min_buffer_time,
            params.max_buffer_time,
            layout.field_length,
            layout.private_length,
        );
        Ok(Self {
            table: Mutex::new(BucketTable::new(params.hashtable_bits, counter.clone())),
            layout,
            params,
            sink,
            clock,
            counter,
        })
    }

    pub fn layout(&self) -> &Arc<TemplateLayout> {
        &self.layout
    }

    pub fn params(&self) -> &StoreParams {
        &self.params
    }

    pub fn counter(&self) -> &Arc<BucketStoreCounter> {
        &self.counter
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Number of buffered aggregates, including those waiting for export.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, BucketTable> {
        if let Some(guard) = self.table.try_lock() {
            return guard;
        }
        let start = Instant::now();
        let guard = self.table.lock();
        let waited = start.elapsed();
        if waited > LOCK_CONTENTION_THRESHOLD {
            debug!(
                "template {}: waited {:?} for bucket table",
                self.layout.template_id, waited
            );
        }
        guard
    }

    pub fn send_template(&self) {
        self.layout.set_destroyed(false);
        self.sink
            .send(ExportEvent::TemplateAnnounce(self.layout.clone()));
    }

    pub fn perform_start(&self) {
        self.send_template();
    }

    pub fn perform_shutdown(&self) {
        self.layout.set_destroyed(true);
        self.sink
            .send(ExportEvent::TemplateWithdraw(self.layout.clone()));
    }

    /// Exports every due aggregate, or all of them if `force` is set.
    pub fn expire(&self, force: bool) {
        let mut table = self.lock();
        if table.resend_template {
            table.resend_template = false;
            self.send_template();
        }
        let now = self.clock.now();
        let mut count = 0;
        while let Some(bucket) = table.pop_expired(now, force) {
            self.export(bucket);
            count += 1;
        }
        if count > 0 {
            debug!(
                "template {}: exported {} aggregates, {} buffered",
                self.layout.template_id,
                count,
                table.len()
            );
        }
    }

    fn export(&self, bucket: Bucket) {
        let mut data = bucket.data;
        data.truncate(self.layout.field_length);
        self.counter.exported.fetch_add(1, Ordering::Relaxed);
        self.counter.exported_total.fetch_add(1, Ordering::Relaxed);
        self.sink
            .send(ExportEvent::AggregateRecordReady(AggregateRecord {
                layout: self.layout.clone(),
                observation_domain_id: bucket.observation_domain_id,
                data,
            }));
    }

    pub(super) fn record_received(&self) {
        self.counter.records_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn forced(&self, table: &mut BucketTable, index: usize) {
        debug!(
            "template {}: active timeout reached, replacing aggregate",
            self.layout.template_id
        );
        table.get_mut(index).force_expiry = true;
        table.unlink(index);
        self.counter.forced_expiries.fetch_add(1, Ordering::Relaxed);
    }
}

impl Reconfigurable for BucketStore {
    fn pre_reconfiguration(&self) {
        self.expire(true);
    }

    fn on_reconfiguration1(&self) {}

    fn post_reconfiguration(&self) {
        self.lock().resend_template = true;
    }
}

impl Drop for BucketStore {
    fn drop(&mut self) {
        let buffered = self.table.get_mut().len();
        if buffered > 0 {
            debug!(
                "template {}: discarding {} buffered aggregates",
                self.layout.template_id, buffered
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::aggregator::clock::ManualClock;
    use crate::aggregator::information_element::InformationElement;
    use crate::aggregator::rule::RuleField;

    fn params() -> StoreParams {
        StoreParams {
            min_buffer_time: Duration::from_secs(5),
            max_buffer_time: Duration::from_secs(60),
            hashtable_bits: 4,
        }
    }

    fn store(sink: Arc<Mutex<Vec<ExportEvent>>>, clock: Arc<ManualClock>) -> BucketStore {
        let rule = Rule::new(
            50,
            false,
            vec![RuleField::key(InformationElement::by_name("protocolIdentifier").unwrap()).unwrap()],
        )
        .unwrap();
        BucketStore::new(&rule, params(), sink, clock).unwrap()
    }

    #[test]
    fn chain_statistics() {
        let counter = Arc::new(BucketStoreCounter::default());
        let mut table = BucketTable::new(2, counter.clone());
        let a = table.insert(1, vec![1], Duration::ZERO, &params(), 0);
        let b = table.insert(1, vec![2], Duration::ZERO, &params(), 0);
        let c = table.insert(2, vec![3], Duration::ZERO, &params(), 0);
        assert_eq!(counter.entries.load(Ordering::Relaxed), 3);
        assert_eq!(counter.empty_slots.load(Ordering::Relaxed), 2);
        assert_eq!(counter.multi_entry_chains.load(Ordering::Relaxed), 1);
        assert_eq!(table.find(1, |d| d == [1]), Some(a));
        assert_eq!(table.find(1, |d| d == [2]), Some(b));
        assert_eq!(table.find(1, |d| d == [3]), None);

        table.unlink(b);
        assert_eq!(counter.multi_entry_chains.load(Ordering::Relaxed), 0);
        assert_eq!(table.find(1, |d| d == [1]), Some(a));
        table.rehash(a, 3);
        assert_eq!(counter.empty_slots.load(Ordering::Relaxed), 2);
        assert_eq!(table.find(3, |_| true), Some(a));
        assert_eq!(table.find(1, |_| true), None);
        table.unlink(c);
        assert_eq!(counter.empty_slots.load(Ordering::Relaxed), 3);

        // released slots are reused
        let expired = table.pop_expired(Duration::ZERO, true).unwrap();
        assert_eq!(expired.data, vec![1]);
        let d = table.insert(0, vec![4], Duration::ZERO, &params(), 0);
        assert_eq!(d, a);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn expiry_order_and_touch() {
        let counter = Arc::new(BucketStoreCounter::default());
        let mut table = BucketTable::new(2, counter);
        let a = table.insert(0, vec![1], Duration::ZERO, &params(), 0);
        let _b = table.insert(1, vec![2], Duration::from_secs(1), &params(), 0);
        table.get_mut(a).expire_at = Duration::from_secs(20);
        table.touch(a);
        // b is due at 6s, a at 20s
        let now = Duration::from_secs(10);
        assert_eq!(table.pop_expired(now, false).unwrap().data, vec![2]);
        assert!(table.pop_expired(now, false).is_none());
        assert_eq!(table.pop_expired(Duration::from_secs(21), false).unwrap().data, vec![1]);
        assert!(table.pop_expired(Duration::from_secs(100), true).is_none());
    }

    #[test]
    fn template_lifecycle() {
        let sink = Arc::new(Mutex::new(vec![]));
        let clock = Arc::new(ManualClock::default());
        let store = store(sink.clone(), clock);
        store.perform_start();
        store.perform_shutdown();
        assert!(store.layout().is_destroyed());
        store.post_reconfiguration();
        store.expire(false);
        assert!(!store.layout().is_destroyed());
        let events = sink.lock();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ExportEvent::TemplateAnnounce(_)));
        assert!(matches!(events[1], ExportEvent::TemplateWithdraw(_)));
        assert!(matches!(events[2], ExportEvent::TemplateAnnounce(_)));
    }

    #[test]
    fn forced_expiry_waits_for_next_pass() {
        let sink = Arc::new(Mutex::new(vec![]));
        let clock = Arc::new(ManualClock::default());
        let store = store(sink.clone(), clock);
        {
            let mut table = store.lock();
            let index = table.insert(0, vec![6], Duration::ZERO, &params(), 0);
            store.forced(&mut table, index);
            assert_eq!(table.find(0, |_| true), None);
            assert_eq!(table.len(), 1);
        }
        store.expire(false);
        assert!(store.is_empty());
        let events = sink.lock();
        assert!(matches!(
            &events[0],
            ExportEvent::AggregateRecordReady(r) if r.data == vec![6]
        ));
    }
}

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

//! Aggregation of decoded flow records.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use public::bytes::{
    add_be, cmp_be, is_zero, max_be, min_be, or_bytes, read_u32_be, read_u32_ne, read_u64_be,
    write_u32_be, write_u32_ne,
};

use super::bucket_store::{BucketHasher, BucketStore, Hashtable, StoreParams};
use super::clock::{ntp_to_duration, Clock};
use super::error::{Error, Result};
use super::information_element::{
    ids, InformationElement, PEN_PRIVATE, PEN_PRIVATE_REVERSE, PEN_REVERSE,
};
use super::record::{DataRecord, TemplateKind};
use super::rule::{Modifier, Rule};
use super::sink::RecordSink;
use super::template::{private_length, FieldInfo, TemplateLayout, PAYLOAD_PRIVATE_BYTE_COUNT};

/// Clears the host bits of a widened address and records their number in the
/// fifth byte. A coarser mask already present wins.
pub(super) fn apply_imask(field: &mut [u8], imask: u8) {
    let imask = imask.max(field[4]).min(32);
    let addr = read_u32_be(field);
    let mask = u32::MAX.checked_shl(imask as u32).unwrap_or(0);
    write_u32_be(field, addr & mask);
    field[4] = imask;
}

/// Start and end time of a record, zero if the record carries none.
fn record_times(record: &DataRecord) -> (Duration, Duration) {
    let mut start = Duration::ZERO;
    let mut end = Duration::ZERO;
    for f in record.template.fields.iter().filter(|f| f.ie.enterprise == 0) {
        let v = f.slice(&record.data);
        let t = match (f.ie.id, v.len()) {
            (ids::FLOW_START_SECONDS | ids::FLOW_END_SECONDS, 4) => {
                Duration::from_secs(read_u32_be(v) as u64)
            }
            (ids::FLOW_START_MILLISECONDS | ids::FLOW_END_MILLISECONDS, 8) => {
                Duration::from_millis(read_u64_be(v))
            }
            (
                ids::FLOW_START_MICROSECONDS
                | ids::FLOW_END_MICROSECONDS
                | ids::FLOW_START_NANOSECONDS
                | ids::FLOW_END_NANOSECONDS,
                8,
            ) => ntp_to_duration(read_u64_be(v)),
            _ => continue,
        };
        if f.ie.is_flow_start() && start.is_zero() {
            start = t;
        } else if f.ie.is_flow_end() && end.is_zero() {
            end = t;
        }
    }
    (start, end)
}

/// Index maps used to merge the two directions of a connection.
struct BiflowMapping {
    // field whose value takes this field's place in the reverse key
    rev_key: Vec<usize>,
    // field holding the same information for the other direction
    reverse_field: Vec<usize>,
}

impl BiflowMapping {
    fn new(layout: &TemplateLayout) -> Result<Self> {
        let required = |id: u16| {
            let ie = InformationElement::standard(id, 0);
            layout.field_index(&ie).ok_or(Error::BiflowMissingField {
                template_id: layout.template_id,
                ie: InformationElement::by_id(id, 0).unwrap_or(ie),
            })
        };
        let src_ip = required(ids::SOURCE_IPV4_ADDRESS)?;
        let dst_ip = required(ids::DESTINATION_IPV4_ADDRESS)?;
        let src_port = required(ids::SOURCE_TRANSPORT_PORT)?;
        let dst_port = required(ids::DESTINATION_TRANSPORT_PORT)?;

        let n = layout.fields.len();
        let mut rev_key: Vec<usize> = (0..n).collect();
        rev_key.swap(src_ip, dst_ip);
        rev_key.swap(src_port, dst_port);

        let mut reverse_field: Vec<usize> = (0..n).collect();
        for (i, f) in layout.fields.iter().enumerate() {
            let ie = f.ie;
            let partner = if i == src_ip {
                dst_ip
            } else if i == dst_ip {
                src_ip
            } else if i == src_port {
                dst_port
            } else if i == dst_port {
                src_port
            } else if ie.is_standard(ids::PROTOCOL_IDENTIFIER)
                || (ie.forward().enterprise == PEN_PRIVATE
                    && matches!(
                        ie.id,
                        ids::DPA_FLOW_COUNT | ids::DPA_FORCED_EXPORT | ids::DPA_REVERSE_START
                    ))
            {
                i
            } else if ie.is_reverse() {
                layout.field_index(&ie.reverse()).unwrap_or(i)
            } else {
                layout
                    .field_index(&ie.reverse())
                    .ok_or(Error::BiflowMissingField {
                        template_id: layout.template_id,
                        ie: ie.reverse(),
                    })?
            };
            let other = &layout.fields[partner];
            if other.ie.length != ie.length {
                return Err(Error::ReverseLengthMismatch {
                    forward: ie,
                    reverse: other.ie,
                });
            }
            reverse_field[i] = partner;
        }
        Ok(Self {
            rev_key,
            reverse_field,
        })
    }

    /// Swaps the two directions of an aggregate in place.
    fn reverse(&self, layout: &TemplateLayout, data: &mut [u8]) {
        for (i, &j) in self.reverse_field.iter().enumerate() {
            if j <= i {
                continue;
            }
            let (a, b) = (&layout.fields[i], &layout.fields[j]);
            swap_ranges(data, a.offset, b.offset, a.len());
            // payload length and packet count share the scratch data of the
            // payload field, only its owner moves it
            let len = private_length(&a.ie);
            if len == 0 || len != private_length(&b.ie) {
                continue;
            }
            if let (Some(pa), Some(pb)) = (a.private_offset, b.private_offset) {
                swap_ranges(data, pa, pb, len);
            }
        }
    }
}

fn swap_ranges(data: &mut [u8], a: usize, b: usize, len: usize) {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let (left, right) = data.split_at_mut(hi);
    left[lo..lo + len].swap_with_slice(&mut right[..len]);
}

/// Bucket store for decoded records.
pub struct FlowHashtable {
    store: BucketStore,
    key_fields: Vec<usize>,
    aggregatable_fields: Vec<usize>,
    biflow: Option<BiflowMapping>,
}

impl FlowHashtable {
    pub fn new(
        rule: &Rule,
        params: StoreParams,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = BucketStore::new(rule, params, sink, clock)?;
        let layout = store.layout();
        let (aggregatable_fields, key_fields) =
            (0..layout.fields.len()).partition(|i| layout.fields[*i].ie.is_aggregatable());
        let biflow = if rule.biflow_aggregation {
            Some(BiflowMapping::new(layout)?)
        } else {
            None
        };
        Ok(Self {
            store,
            key_fields,
            aggregatable_fields,
            biflow,
        })
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    fn layout(&self) -> &TemplateLayout {
        self.store.layout()
    }

    fn key_index(&self, i: usize, reverse: bool) -> usize {
        match &self.biflow {
            Some(b) if reverse => b.rev_key[i],
            _ => i,
        }
    }

    fn hash(&self, data: &[u8], reverse: bool, mask: u32) -> u32 {
        let fields = &self.layout().fields;
        let mut hasher = BucketHasher::new();
        for &i in self.key_fields.iter() {
            hasher.update(&data[fields[self.key_index(i, reverse)].range()]);
        }
        hasher.finish(mask)
    }

    fn equal(&self, bucket: &[u8], data: &[u8], reverse: bool) -> bool {
        let fields = &self.layout().fields;
        self.key_fields.iter().all(|&i| {
            bucket[fields[i].range()] == data[fields[self.key_index(i, reverse)].range()]
        })
    }

    /// Lays a record out as a bucket buffer.
    fn build_data(&self, record: &DataRecord) -> Vec<u8> {
        let layout = self.layout();
        let template = &record.template;
        let mut data = vec![0; layout.bucket_length()];
        for (f, modifier) in layout.fields.iter().zip(layout.modifiers.iter()) {
            let value = match template.find_field(&f.ie) {
                Some(rf) => Some(rf.slice(&record.data)),
                None if template.kind == TemplateKind::DataTemplate => template
                    .find_data_field(&f.ie)
                    .map(|df| df.slice(&template.data)),
                None => None,
            };
            let Some(value) = value else {
                debug!(
                    "template {}: field {} missing in record of template {}, zero-filled",
                    layout.template_id, f.ie, template.id
                );
                continue;
            };
            copy_data(f, *modifier, &mut data, value);

            if f.ie.is_ipv4_address() && f.len() == 5 {
                let prefix_ie = InformationElement::standard(
                    if f.ie.id == ids::SOURCE_IPV4_ADDRESS {
                        ids::SOURCE_IPV4_PREFIX_LENGTH
                    } else {
                        ids::DESTINATION_IPV4_PREFIX_LENGTH
                    },
                    1,
                );
                if let Some(&prefix) = record.get(&prefix_ie).and_then(|p| p.first()) {
                    apply_imask(&mut data[f.range()], 32u8.saturating_sub(prefix));
                }
            }
        }
        data
    }

    /// Merges `delta` into `base`. With `reverse`, `delta` is a record of the
    /// opposite direction; returns true if it started before the aggregate.
    fn aggregate_flow(&self, base: &mut [u8], delta: &[u8], reverse: bool) -> bool {
        let layout = self.layout();
        let mut must_reverse = false;
        for &i in self.aggregatable_fields.iter() {
            let f = &layout.fields[i];
            match &self.biflow {
                // reverse elements of the delta carry no information about the
                // other direction and are merged in place
                Some(biflow) if reverse && !f.ie.is_reverse() => {
                    if f.ie.enterprise == 0 && f.ie.is_flow_start() {
                        let d = &delta[f.range()];
                        if !is_zero(d) && cmp_be(&base[f.range()], d) == Ordering::Greater {
                            must_reverse = true;
                        }
                    }
                    aggregate_field(layout, biflow.reverse_field[i], i, base, delta);
                }
                _ => aggregate_field(layout, i, i, base, delta),
            }
        }
        must_reverse
    }

    /// Buffers one record, merging it into a matching aggregate if possible.
    pub fn aggregate_record(&self, record: &DataRecord) {
        let data = self.build_data(record);
        let (start, end) = record_times(record);
        let params = *self.store.params();
        let must_expire = |expire_at: Duration, force_expire_at: Duration| {
            start > expire_at || start > force_expire_at
        };

        let mut table = self.store.lock();
        self.store.record_received();
        let now = self.store.now().max(start);
        let last_seen = if end.is_zero() { now } else { end };
        let mask = table.mask();

        let hash = self.hash(&data, false, mask);
        if let Some(index) = table.find(hash, |b| self.equal(b, &data, false)) {
            let bucket = table.get_mut(index);
            if must_expire(bucket.expire_at, bucket.force_expire_at) {
                self.store.forced(&mut table, index);
            } else {
                self.aggregate_flow(&mut bucket.data, &data, false);
                bucket.expire_at = last_seen + params.min_buffer_time;
                table.touch(index);
                return;
            }
        } else if let Some(biflow) = &self.biflow {
            let rhash = self.hash(&data, true, mask);
            if let Some(index) = table.find(rhash, |b| self.equal(b, &data, true)) {
                let bucket = table.get_mut(index);
                if must_expire(bucket.expire_at, bucket.force_expire_at) {
                    self.store.forced(&mut table, index);
                } else {
                    let must_reverse = self.aggregate_flow(&mut bucket.data, &data, true);
                    bucket.expire_at = last_seen + params.min_buffer_time;
                    if must_reverse {
                        biflow.reverse(self.layout(), &mut bucket.data);
                        let hash = self.hash(&bucket.data, false, mask);
                        debug!(
                            "template {}: reversed aggregate, moved to slot {}",
                            self.layout().template_id,
                            hash
                        );
                        table.rehash(index, hash);
                    }
                    table.touch(index);
                    return;
                }
            }
        }

        table.insert(hash, data, now, &params, record.observation_domain_id);
    }
}

impl Hashtable for FlowHashtable {
    type Input = DataRecord;

    const NAME: &'static str = "flow";

    fn build(
        rule: &Rule,
        params: StoreParams,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::new(rule, params, sink, clock)
    }

    fn store(&self) -> &BucketStore {
        &self.store
    }

    fn accepts(rule: &Rule, record: &DataRecord) -> bool {
        record.kind().carries_flows() && rule.matches_record(record)
    }

    fn aggregate(&self, record: &DataRecord) {
        self.aggregate_record(record)
    }
}

/// Copies a record value into its place in a bucket buffer, widening or
/// truncating it as the layout requires.
fn copy_data(f: &FieldInfo, modifier: Modifier, data: &mut [u8], value: &[u8]) {
    let dst = &mut data[f.range()];
    let (dlen, slen) = (dst.len(), value.len());
    let is_payload = f.ie.forward().is_private(ids::FRONT_PAYLOAD);

    if is_payload {
        let n = dlen.min(slen);
        dst[..n].copy_from_slice(&value[..n]);
        if let Some(p) = f.private_offset {
            write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_BYTE_COUNT..], n as u32);
        }
        return;
    }

    if dlen == slen {
        dst.copy_from_slice(value);
    } else if dlen > slen {
        if f.ie.is_ipv4_address() {
            dst[..slen].copy_from_slice(value);
        } else {
            dst[dlen - slen..].copy_from_slice(value);
        }
    } else {
        debug!(
            "field {} of {} bytes does not fit into {} bytes, not copied",
            f.ie, slen, dlen
        );
        return;
    }

    if let Modifier::Mask(bits) = modifier {
        if f.ie.is_ipv4_address() && dlen == 5 {
            apply_imask(dst, 32 - bits.min(32));
        }
    }
}

fn aggregate_start(base: &mut [u8], delta: &[u8], reverse: bool) {
    if reverse {
        if is_zero(base) {
            base.copy_from_slice(delta);
        } else if !is_zero(delta) {
            min_be(base, delta);
        }
    } else {
        min_be(base, delta);
    }
}

/// Merges field `from` of `delta` into field `into` of `base`.
fn aggregate_field(layout: &TemplateLayout, into: usize, from: usize, base: &mut [u8], delta: &[u8]) {
    let bf = &layout.fields[into];
    let df = &layout.fields[from];
    let ie = bf.ie;
    let d = &delta[df.range()];

    match ie.enterprise {
        0 | PEN_REVERSE => {
            let b = &mut base[bf.range()];
            if ie.is_flow_start() {
                aggregate_start(b, d, ie.enterprise == PEN_REVERSE);
            } else if ie.is_flow_end() {
                max_be(b, d);
            } else {
                match ie.id {
                    ids::OCTET_DELTA_COUNT
                    | ids::PACKET_DELTA_COUNT
                    | ids::POST_OCTET_DELTA_COUNT
                    | ids::POST_PACKET_DELTA_COUNT
                    | ids::DROPPED_OCTET_DELTA_COUNT
                    | ids::DROPPED_PACKET_DELTA_COUNT => add_be(b, d),
                    ids::TCP_CONTROL_BITS => or_bytes(b, d),
                    _ => (),
                }
            }
        }
        PEN_PRIVATE | PEN_PRIVATE_REVERSE => match ie.id {
            ids::FRONT_PAYLOAD => {
                let (Some(bp), Some(dp)) = (bf.private_offset, df.private_offset) else {
                    return;
                };
                let bp = bp + PAYLOAD_PRIVATE_BYTE_COUNT;
                let dp = dp + PAYLOAD_PRIVATE_BYTE_COUNT;
                if read_u32_ne(&base[bp..]) == 0 {
                    base[bf.range()].copy_from_slice(d);
                    let len = read_u32_ne(&delta[dp..]);
                    write_u32_ne(&mut base[bp..], len);
                }
            }
            ids::FRONT_PAYLOAD_LEN => {
                let b = &mut base[bf.range()];
                if is_zero(b) {
                    b.copy_from_slice(d);
                }
            }
            ids::MAX_PACKET_GAP => max_be(&mut base[bf.range()], d),
            ids::FRONT_PAYLOAD_PKT_COUNT
            | ids::TRANSPORT_OCTET_DELTA_COUNT
            | ids::DPA_FLOW_COUNT => add_be(&mut base[bf.range()], d),
            ids::DPA_FORCED_EXPORT | ids::DPA_REVERSE_START => or_bytes(&mut base[bf.range()], d),
            _ => (),
        },
        _ => (),
    }
}

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

//! Aggregation of raw packets.
//!
//! When a rule is activated every layout field is compiled into a
//! [`CompiledField`]: where its bytes come from in a packet, how they are copied
//! into a new bucket and how later packets are merged into it. Per packet only
//! the precomputed steps run.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use public::bytes::{
    add_u64_be, is_zero, max_be, min_be, or_bytes, read_u16_be, read_u32_be, read_u32_ne,
    read_u64_be, write_u32_be, write_u32_ne, write_u64_be,
};

use super::bucket_store::{BucketHasher, BucketStore, Hashtable, StoreParams};
use super::clock::Clock;
use super::error::{Error, Result};
use super::flow_hashtable::apply_imask;
use super::information_element::{
    ids, InformationElement, ProtocolClasses, PEN_PRIVATE, PEN_REVERSE,
};
use super::packet::{
    Packet, FIELD_OFFSET_DIP, FIELD_OFFSET_PROTOCOL, FIELD_OFFSET_SIP, FIELD_OFFSET_TCP_FLAGS,
    FIELD_OFFSET_TOS, FIELD_OFFSET_TOTAL_LEN, TCP_SYN,
};
use super::rule::{Modifier, Rule};
use super::sink::RecordSink;
use super::template::{
    FieldInfo, TemplateLayout, PAYLOAD_PRIVATE_BYTE_COUNT, PAYLOAD_PRIVATE_INITIALIZED,
};

const HASH_SEED: u32 = 0xAAAA_AAAA;
// sequence numbers further ahead are not counted as transport octets
const MAX_TCP_WINDOW_SIZE: u64 = 65535;
const ZEROES: [u8; 16] = [0; 16];

/// Location of a field's bytes in a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Ip(usize),
    Transport(usize, ProtocolClasses),
    Layer2(usize),
    Seconds,
    Millis,
    Ntp,
    // address at the given ip header offset with host bits cleared
    MaskedIp(usize, u8),
    // no bytes, the copy and merge steps work on the packet itself
    Absent,
}

impl Source {
    fn read<'a>(&self, packet: &'a Packet, len: usize, scratch: &'a mut [u8; 5]) -> &'a [u8] {
        let bytes = match *self {
            Source::Ip(offset) => packet.ip_header().get(offset..offset + len),
            Source::Transport(offset, classes) if classes.intersects(packet.class()) => packet
                .transport_header()
                .and_then(|h| h.get(offset..offset + len)),
            Source::Layer2(offset) => packet.layer2().and_then(|l2| l2.get(offset..offset + len)),
            Source::Seconds => Some(&packet.seconds_be()[..]),
            Source::Millis => Some(&packet.millis_be()[..]),
            Source::Ntp => Some(&packet.ntp_be()[..]),
            Source::MaskedIp(offset, imask) => {
                scratch[..4].copy_from_slice(&packet.ip_header()[offset..offset + 4]);
                scratch[4] = 0;
                apply_imask(&mut scratch[..], imask);
                return &scratch[..];
            }
            _ => None,
        };
        bytes.unwrap_or(&ZEROES[..len])
    }
}

/// How a packet initializes a field of a new bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CopyStrategy {
    EqualLength,
    // address widened by the mask byte
    GreaterLengthIp,
    // integer widened to the left
    GreaterLength,
    SetOne,
    SetZero,
    FrontPayload,
    FrontPayloadNoInit,
    MaxPacketGap,
    TransportOctets,
    Dummy,
}

/// How a packet is merged into an existing bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MergeStrategy {
    Min,
    // reverse start times begin at zero
    MinOrCopy,
    Max,
    AddSource,
    Increment,
    Or,
    FrontPayload,
    MaxPacketGap,
    TransportOctets,
    Ignore,
}

#[derive(Clone, Debug)]
struct CompiledField {
    ie: InformationElement,
    dst: Range<usize>,
    src: Source,
    src_len: usize,
    copy: CopyStrategy,
    merge: MergeStrategy,
    private_offset: Option<usize>,
    // bucket offsets of the payload length and packet count of the same direction
    payload_len_offset: Option<usize>,
    payload_pkt_count_offset: Option<usize>,
}

impl CompiledField {
    /// Bucket bytes compared against the packet source when used as a key.
    fn key_range(&self) -> Range<usize> {
        match self.copy {
            CopyStrategy::EqualLength | CopyStrategy::GreaterLengthIp => {
                self.dst.start..self.dst.start + self.src_len
            }
            CopyStrategy::GreaterLength => self.dst.end - self.src_len..self.dst.end,
            _ => self.dst.start..self.dst.start,
        }
    }

    fn key_source<'a>(&self, packet: &'a Packet, scratch: &'a mut [u8; 5]) -> &'a [u8] {
        let len = self.key_range().len();
        &self.src.read(packet, self.src_len, scratch)[..len]
    }
}

fn is_available(ie: &InformationElement) -> bool {
    match ie.enterprise {
        0 => matches!(
            ie.id,
            ids::PACKET_TOTAL_COUNT
                | ids::PACKET_DELTA_COUNT
                | ids::FLOW_START_SECONDS
                | ids::FLOW_END_SECONDS
                | ids::FLOW_START_MILLISECONDS
                | ids::FLOW_END_MILLISECONDS
                | ids::FLOW_START_NANOSECONDS
                | ids::FLOW_END_NANOSECONDS
                | ids::SOURCE_MAC_ADDRESS
                | ids::DESTINATION_MAC_ADDRESS
                | ids::OCTET_TOTAL_COUNT
                | ids::OCTET_DELTA_COUNT
                | ids::PROTOCOL_IDENTIFIER
                | ids::SOURCE_IPV4_ADDRESS
                | ids::DESTINATION_IPV4_ADDRESS
                | ids::IP_CLASS_OF_SERVICE
                | ids::ICMP_TYPE_CODE_IPV4
                | ids::SOURCE_TRANSPORT_PORT
                | ids::DESTINATION_TRANSPORT_PORT
                | ids::TCP_CONTROL_BITS
                | ids::BGP_SOURCE_AS_NUMBER
                | ids::BGP_DESTINATION_AS_NUMBER
        ),
        PEN_PRIVATE => matches!(
            ie.id,
            ids::FRONT_PAYLOAD
                | ids::FRONT_PAYLOAD_LEN
                | ids::FRONT_PAYLOAD_PKT_COUNT
                | ids::MAX_PACKET_GAP
                | ids::DPA_FORCED_EXPORT
                | ids::DPA_FLOW_COUNT
                | ids::DPA_REVERSE_START
                | ids::TRANSPORT_OCTET_DELTA_COUNT
        ),
        _ => false,
    }
}

/// Packet location and length of the bytes of a field, for the forward type.
fn packet_source(ie: &InformationElement) -> (Source, usize) {
    let tcp_udp = ProtocolClasses::TCP | ProtocolClasses::UDP;
    if ie.enterprise == PEN_PRIVATE {
        return match ie.id {
            ids::MAX_PACKET_GAP => (Source::Millis, 8),
            ids::FRONT_PAYLOAD => (Source::Absent, 0),
            ids::TRANSPORT_OCTET_DELTA_COUNT => (Source::Absent, 8),
            ids::DPA_FORCED_EXPORT | ids::DPA_REVERSE_START => (Source::Absent, 1),
            _ => (Source::Absent, 4),
        };
    }
    match ie.id {
        ids::PACKET_TOTAL_COUNT | ids::PACKET_DELTA_COUNT => (Source::Absent, 1),
        ids::FLOW_START_SECONDS | ids::FLOW_END_SECONDS => (Source::Seconds, 4),
        ids::FLOW_START_MILLISECONDS | ids::FLOW_END_MILLISECONDS => (Source::Millis, 8),
        ids::FLOW_START_NANOSECONDS | ids::FLOW_END_NANOSECONDS => (Source::Ntp, 8),
        ids::DESTINATION_MAC_ADDRESS => (Source::Layer2(0), 6),
        ids::SOURCE_MAC_ADDRESS => (Source::Layer2(6), 6),
        ids::OCTET_TOTAL_COUNT | ids::OCTET_DELTA_COUNT => (Source::Ip(FIELD_OFFSET_TOTAL_LEN), 2),
        ids::PROTOCOL_IDENTIFIER => (Source::Ip(FIELD_OFFSET_PROTOCOL), 1),
        ids::SOURCE_IPV4_ADDRESS => (Source::Ip(FIELD_OFFSET_SIP), 4),
        ids::DESTINATION_IPV4_ADDRESS => (Source::Ip(FIELD_OFFSET_DIP), 4),
        ids::IP_CLASS_OF_SERVICE => (Source::Ip(FIELD_OFFSET_TOS), 1),
        ids::ICMP_TYPE_CODE_IPV4 => (Source::Transport(0, ProtocolClasses::ICMP), 2),
        ids::SOURCE_TRANSPORT_PORT => (Source::Transport(0, tcp_udp), 2),
        ids::DESTINATION_TRANSPORT_PORT => (Source::Transport(2, tcp_udp), 2),
        ids::TCP_CONTROL_BITS => (
            Source::Transport(FIELD_OFFSET_TCP_FLAGS, ProtocolClasses::TCP),
            1,
        ),
        // not carried by packets, exported as zero
        _ => (Source::Absent, 0),
    }
}

/// Lengths the aggregated fields must be configured with.
fn required_length(ie: &InformationElement) -> Option<u16> {
    if ie.enterprise == PEN_PRIVATE {
        return match ie.id {
            ids::DPA_FORCED_EXPORT | ids::DPA_REVERSE_START => Some(1),
            ids::TRANSPORT_OCTET_DELTA_COUNT => Some(8),
            ids::FRONT_PAYLOAD => None,
            _ => Some(4),
        };
    }
    match ie.id {
        ids::PROTOCOL_IDENTIFIER | ids::TCP_CONTROL_BITS | ids::IP_CLASS_OF_SERVICE => Some(1),
        ids::SOURCE_TRANSPORT_PORT
        | ids::DESTINATION_TRANSPORT_PORT
        | ids::ICMP_TYPE_CODE_IPV4
        | ids::BGP_SOURCE_AS_NUMBER
        | ids::BGP_DESTINATION_AS_NUMBER => Some(2),
        ids::FLOW_START_SECONDS | ids::FLOW_END_SECONDS => Some(4),
        ids::SOURCE_IPV4_ADDRESS | ids::DESTINATION_IPV4_ADDRESS => Some(5),
        ids::SOURCE_MAC_ADDRESS | ids::DESTINATION_MAC_ADDRESS => Some(6),
        _ => Some(8),
    }
}

fn copy_strategy(
    ie: &InformationElement,
    modifier: Modifier,
    src_len: usize,
    dst_len: usize,
) -> Result<CopyStrategy> {
    let fwd = ie.forward();
    if fwd.enterprise == PEN_PRIVATE {
        return Ok(match (fwd.id, ie.is_reverse()) {
            (ids::FRONT_PAYLOAD, false) => CopyStrategy::FrontPayload,
            (ids::FRONT_PAYLOAD, true) => CopyStrategy::FrontPayloadNoInit,
            (ids::TRANSPORT_OCTET_DELTA_COUNT, false) => CopyStrategy::TransportOctets,
            (ids::MAX_PACKET_GAP, false) => CopyStrategy::MaxPacketGap,
            (_, false) => CopyStrategy::Dummy,
            (_, true) => CopyStrategy::SetZero,
        });
    }
    if ie.is_reverse() {
        return Ok(CopyStrategy::SetZero);
    }
    let strategy = match dst_len.cmp(&src_len) {
        std::cmp::Ordering::Equal => CopyStrategy::EqualLength,
        std::cmp::Ordering::Greater if ie.is_ipv4_address() => match modifier {
            Modifier::Mask(_) => CopyStrategy::EqualLength,
            _ => CopyStrategy::GreaterLengthIp,
        },
        std::cmp::Ordering::Greater
            if matches!(ie.id, ids::PACKET_DELTA_COUNT | ids::PACKET_TOTAL_COUNT) =>
        {
            CopyStrategy::SetOne
        }
        std::cmp::Ordering::Greater => CopyStrategy::GreaterLength,
        std::cmp::Ordering::Less => {
            return Err(Error::UnsupportedLength {
                ie: *ie,
                from: src_len as u16,
                to: dst_len as u16,
            })
        }
    };
    Ok(strategy)
}

fn merge_strategy(ie: &InformationElement) -> MergeStrategy {
    match ie.enterprise {
        0 | PEN_REVERSE => {
            if ie.is_flow_start() {
                if ie.is_reverse() {
                    MergeStrategy::MinOrCopy
                } else {
                    MergeStrategy::Min
                }
            } else if ie.is_flow_end() {
                MergeStrategy::Max
            } else {
                match ie.id {
                    ids::OCTET_DELTA_COUNT | ids::OCTET_TOTAL_COUNT => MergeStrategy::AddSource,
                    ids::PACKET_DELTA_COUNT | ids::PACKET_TOTAL_COUNT => MergeStrategy::Increment,
                    ids::TCP_CONTROL_BITS => MergeStrategy::Or,
                    _ => MergeStrategy::Ignore,
                }
            }
        }
        _ => match ie.forward().id {
            ids::FRONT_PAYLOAD => MergeStrategy::FrontPayload,
            ids::MAX_PACKET_GAP => MergeStrategy::MaxPacketGap,
            ids::TRANSPORT_OCTET_DELTA_COUNT if !ie.is_reverse() => MergeStrategy::TransportOctets,
            _ => MergeStrategy::Ignore,
        },
    }
}

fn compile_field(
    layout: &TemplateLayout,
    f: &FieldInfo,
    modifier: Modifier,
) -> Result<CompiledField> {
    let fwd = f.ie.forward();
    if !is_available(&fwd) {
        return Err(Error::UnavailableInPacket(f.ie));
    }
    if let Some(len) = required_length(&fwd) {
        if f.ie.length != len {
            return Err(Error::UnsupportedLength {
                ie: f.ie,
                from: f.ie.length,
                to: len,
            });
        }
    }
    let (mut src, mut src_len) = packet_source(&fwd);
    if let (Source::Ip(offset), Some(bits)) = (src, modifier.mask_bits()) {
        src = Source::MaskedIp(offset, 32 - bits.min(32));
        src_len = 5;
    }
    let copy = copy_strategy(&f.ie, modifier, src_len, f.len())?;

    let linked = |id: u16| {
        let ie = InformationElement::private(id, 0);
        let ie = if f.ie.is_reverse() { ie.reverse() } else { ie };
        layout.field(&ie).map(|f| f.offset)
    };
    let (payload_len_offset, payload_pkt_count_offset) = if fwd.is_private(ids::FRONT_PAYLOAD) {
        (linked(ids::FRONT_PAYLOAD_LEN), linked(ids::FRONT_PAYLOAD_PKT_COUNT))
    } else {
        (None, None)
    };

    Ok(CompiledField {
        ie: f.ie,
        dst: f.range(),
        src,
        src_len,
        copy,
        merge: merge_strategy(&f.ie),
        private_offset: f.private_offset,
        payload_len_offset,
        payload_pkt_count_offset,
    })
}

/// Bucket store for raw packets.
pub struct PacketHashtable {
    store: BucketStore,
    // front payload first, then the other forward aggregatable fields
    aggregatable_fields: Vec<CompiledField>,
    reverse_fields: Vec<CompiledField>,
    key_fields: Vec<CompiledField>,
    // index into key_fields of the field replacing each key in the other direction
    rev_key: Option<Vec<usize>>,
}

impl PacketHashtable {
    pub fn new(
        rule: &Rule,
        params: StoreParams,
        sink: Arc<dyn RecordSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = BucketStore::new(rule, params, sink, clock)?;
        let layout = store.layout().clone();

        let mut aggregatable_fields = vec![];
        let mut reverse_fields = vec![];
        let mut key_fields = vec![];
        let mut key_types = vec![];
        for (f, modifier) in layout.fields.iter().zip(layout.modifiers.iter()) {
            let compiled = compile_field(&layout, f, *modifier)?;
            let payload_first = f.ie.forward().is_private(ids::FRONT_PAYLOAD);
            match (f.ie.is_aggregatable(), f.ie.is_reverse()) {
                (false, _) => {
                    key_types.push(f.ie);
                    key_fields.push(compiled);
                }
                (true, false) if payload_first => aggregatable_fields.insert(0, compiled),
                (true, false) => aggregatable_fields.push(compiled),
                (true, true) if payload_first => reverse_fields.insert(0, compiled),
                (true, true) => reverse_fields.push(compiled),
            }
        }

        let rev_key = if rule.biflow_aggregation {
            let partner = |ie: &InformationElement| match (ie.enterprise, ie.id) {
                (0, ids::SOURCE_IPV4_ADDRESS) => ids::DESTINATION_IPV4_ADDRESS,
                (0, ids::DESTINATION_IPV4_ADDRESS) => ids::SOURCE_IPV4_ADDRESS,
                (0, ids::SOURCE_TRANSPORT_PORT) => ids::DESTINATION_TRANSPORT_PORT,
                (0, ids::DESTINATION_TRANSPORT_PORT) => ids::SOURCE_TRANSPORT_PORT,
                (_, id) => id,
            };
            for id in [ids::SOURCE_IPV4_ADDRESS, ids::SOURCE_TRANSPORT_PORT] {
                if !key_types.iter().any(|k| k.is_standard(id)) {
                    return Err(Error::BiflowMissingField {
                        template_id: layout.template_id,
                        ie: InformationElement::by_id(id, 0)
                            .unwrap_or(InformationElement::standard(id, 0)),
                    });
                }
            }
            let mut mapping = Vec::with_capacity(key_types.len());
            for ie in key_types.iter() {
                let target = InformationElement::new(partner(ie), ie.enterprise, 0);
                match key_types.iter().position(|k| k.same_type(&target)) {
                    Some(j) => mapping.push(j),
                    None => {
                        return Err(Error::BiflowMissingField {
                            template_id: layout.template_id,
                            ie: InformationElement::by_id(target.id, target.enterprise)
                                .unwrap_or(target),
                        })
                    }
                }
            }
            Some(mapping)
        } else {
            None
        };

        info!(
            "template {}: compiled {} key, {} aggregated and {} reverse fields for packets",
            layout.template_id,
            key_fields.len(),
            aggregatable_fields.len(),
            reverse_fields.len()
        );
        Ok(Self {
            store,
            aggregatable_fields,
            reverse_fields,
            key_fields,
            rev_key,
        })
    }

    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    fn key_partner(&self, i: usize, reverse: bool) -> &CompiledField {
        match &self.rev_key {
            Some(m) if reverse => &self.key_fields[m[i]],
            _ => &self.key_fields[i],
        }
    }

    fn hash(&self, packet: &Packet, reverse: bool, mask: u32) -> u32 {
        let mut hasher = BucketHasher::with_seed(HASH_SEED);
        let mut scratch = [0; 5];
        for i in 0..self.key_fields.len() {
            hasher.update(self.key_partner(i, reverse).key_source(packet, &mut scratch));
        }
        hasher.finish(mask)
    }

    fn equal(&self, bucket: &[u8], packet: &Packet, reverse: bool) -> bool {
        let mut scratch = [0; 5];
        self.key_fields.iter().enumerate().all(|(i, f)| {
            let stored = &bucket[self.key_partner(i, reverse).key_range()];
            stored == f.key_source(packet, &mut scratch)
        })
    }

    fn build_data(&self, packet: &Packet) -> Vec<u8> {
        let mut data = vec![0; self.store.layout().bucket_length()];
        let mut scratch = [0; 5];
        for f in self
            .aggregatable_fields
            .iter()
            .chain(self.reverse_fields.iter())
            .chain(self.key_fields.iter())
        {
            let src = f.src.read(packet, f.src_len, &mut scratch);
            copy_field(f, &mut data, src, packet);
        }
        data
    }

    fn aggregate_flow(&self, data: &mut [u8], packet: &Packet, reverse: bool) {
        let fields = if reverse {
            &self.reverse_fields
        } else {
            &self.aggregatable_fields
        };
        let mut scratch = [0; 5];
        for f in fields.iter() {
            let src = f.src.read(packet, f.src_len, &mut scratch);
            merge_field(f, data, src, packet);
        }
    }

    /// Buffers one packet, merging it into a matching aggregate if possible.
    pub fn aggregate_packet(&self, packet: &Packet) {
        let now = packet.timestamp();
        let params = *self.store.params();
        let must_expire =
            |expire_at: Duration, force_expire_at: Duration| now > expire_at || now > force_expire_at;

        let mut table = self.store.lock();
        self.store.record_received();
        let mask = table.mask();
        let hash = self.hash(packet, false, mask);

        let mut found = table.find(hash, |b| self.equal(b, packet, false)).map(|i| (i, false));
        if found.is_none() && self.rev_key.is_some() {
            let rhash = self.hash(packet, true, mask);
            found = table.find(rhash, |b| self.equal(b, packet, true)).map(|i| (i, true));
        }
        if let Some((index, reverse)) = found {
            let bucket = table.get_mut(index);
            if must_expire(bucket.expire_at, bucket.force_expire_at) {
                self.store.forced(&mut table, index);
            } else {
                self.aggregate_flow(&mut bucket.data, packet, reverse);
                bucket.expire_at = now + params.min_buffer_time;
                table.touch(index);
                return;
            }
        }

        let data = self.build_data(packet);
        table.insert(hash, data, now, &params, packet.observation_domain_id);
    }
}

impl Hashtable for PacketHashtable {
    type Input = Packet;

    const NAME: &'static str = "packet";

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

    fn accepts(rule: &Rule, packet: &Packet) -> bool {
        rule.matches_packet(packet)
    }

    fn aggregate(&self, packet: &Packet) {
        self.aggregate_packet(packet)
    }
}

fn payload_length(packet: &Packet) -> usize {
    match packet.transport_header() {
        Some(_) => packet.payload().len(),
        None => 0,
    }
}

fn copy_field(f: &CompiledField, data: &mut [u8], src: &[u8], packet: &Packet) {
    match f.copy {
        CopyStrategy::EqualLength => data[f.dst.clone()].copy_from_slice(src),
        CopyStrategy::GreaterLengthIp => {
            data[f.dst.start..f.dst.start + src.len()].copy_from_slice(src)
        }
        CopyStrategy::GreaterLength => data[f.dst.end - src.len()..f.dst.end].copy_from_slice(src),
        CopyStrategy::SetOne => {
            let dst = &mut data[f.dst.clone()];
            dst.fill(0);
            dst[dst.len() - 1] = 1;
        }
        CopyStrategy::SetZero => data[f.dst.clone()].fill(0),
        CopyStrategy::FrontPayload => aggregate_front_payload(f, data, packet, true),
        CopyStrategy::FrontPayloadNoInit => {
            if let Some(p) = f.private_offset {
                write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_INITIALIZED..], 0);
            }
        }
        CopyStrategy::MaxPacketGap => {
            data[f.dst.clone()].fill(0);
            if let Some(p) = f.private_offset {
                data[p..p + 8].copy_from_slice(src);
            }
        }
        CopyStrategy::TransportOctets => {
            let plen = payload_length(packet);
            write_u64_be(&mut data[f.dst.clone()], plen as u64);
            if let (Some(seq), Some(p)) = (packet.tcp_seq(), f.private_offset) {
                let syn = (packet.tcp_flags() & TCP_SYN != 0) as u32;
                write_u32_ne(&mut data[p..], seq.wrapping_add(plen as u32).wrapping_add(syn));
                write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_INITIALIZED..], 1);
            }
        }
        CopyStrategy::Dummy => (),
    }
}

fn merge_field(f: &CompiledField, data: &mut [u8], src: &[u8], packet: &Packet) {
    match f.merge {
        MergeStrategy::Min => min_be(&mut data[f.dst.clone()], src),
        MergeStrategy::MinOrCopy => {
            let base = &mut data[f.dst.clone()];
            if is_zero(base) {
                base.copy_from_slice(src);
            } else {
                min_be(base, src);
            }
        }
        MergeStrategy::Max => max_be(&mut data[f.dst.clone()], src),
        MergeStrategy::AddSource => add_u64_be(&mut data[f.dst.clone()], read_u16_be(src) as u64),
        MergeStrategy::Increment => add_u64_be(&mut data[f.dst.clone()], 1),
        MergeStrategy::Or => or_bytes(&mut data[f.dst.clone()], src),
        MergeStrategy::FrontPayload => aggregate_front_payload(f, data, packet, false),
        MergeStrategy::MaxPacketGap => {
            let Some(p) = f.private_offset else {
                return;
            };
            let now = read_u64_be(src);
            let gap = now.abs_diff(read_u64_be(&data[p..])) as u32;
            if gap > read_u32_be(&data[f.dst.clone()]) {
                write_u32_be(&mut data[f.dst.clone()], gap);
            }
            data[p..p + 8].copy_from_slice(src);
        }
        MergeStrategy::TransportOctets => merge_transport_octets(f, data, packet),
        MergeStrategy::Ignore => (),
    }
}

/// Counts the payload bytes that advance the TCP stream, retransmissions
/// excluded. UDP payload is summed.
fn merge_transport_octets(f: &CompiledField, data: &mut [u8], packet: &Packet) {
    let plen = payload_length(packet) as u64;
    if plen == 0 {
        return;
    }
    let octets = read_u64_be(&data[f.dst.clone()]);
    match (packet.tcp_seq(), f.private_offset) {
        (Some(seq), Some(p)) => {
            let seq = seq as u64;
            if read_u32_ne(&data[p + PAYLOAD_PRIVATE_INITIALIZED..]) == 0 {
                let syn = (packet.tcp_flags() & TCP_SYN != 0) as u64;
                write_u32_ne(&mut data[p..], (seq + plen + syn) as u32);
                write_u64_be(&mut data[f.dst.clone()], plen);
                write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_INITIALIZED..], 1);
                return;
            }
            let next = read_u32_ne(&data[p..]) as u64;
            // the second window handles sequence number wrap-around
            for end in [seq + plen, (1 << 32) + seq + plen] {
                if end > next && end < next + MAX_TCP_WINDOW_SIZE {
                    write_u64_be(&mut data[f.dst.clone()], octets + end - next);
                    write_u32_ne(&mut data[p..], (seq + plen) as u32);
                    break;
                }
            }
        }
        _ if packet.class() == ProtocolClasses::UDP => {
            write_u64_be(&mut data[f.dst.clone()], octets + plen)
        }
        _ => (),
    }
}

/// Collects the leading payload bytes of a direction. TCP payload is placed by
/// sequence number relative to the first packet; no reassembly beyond that.
fn aggregate_front_payload(f: &CompiledField, data: &mut [u8], packet: &Packet, first: bool) {
    let Some(p) = f.private_offset else {
        return;
    };
    let dlen = f.dst.len() as u32;
    let mut seq = packet.tcp_seq().unwrap_or(0);
    if first || read_u32_ne(&data[p + PAYLOAD_PRIVATE_INITIALIZED..]) == 0 {
        if packet.tcp_flags() & TCP_SYN != 0 {
            // SYN consumes one sequence number
            seq = seq.wrapping_add(1);
        }
        write_u32_ne(&mut data[p..], seq);
        write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_BYTE_COUNT..], 0);
        write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_INITIALIZED..], 1);
    }

    let payload = packet.payload();
    let plen = payload_length(packet) as u32;
    if plen == 0 {
        return;
    }
    let byte_count = read_u32_ne(&data[p + PAYLOAD_PRIVATE_BYTE_COUNT..]);
    let (pos, len) = match packet.class() {
        ProtocolClasses::TCP => {
            let offset = seq.wrapping_sub(read_u32_ne(&data[p..]));
            if offset >= dlen {
                return;
            }
            let pos = if seq != 0 { offset } else { byte_count };
            (pos, (dlen - pos).min(plen))
        }
        ProtocolClasses::UDP if byte_count < dlen => (byte_count, (dlen - byte_count).min(plen)),
        _ => return,
    };
    let start = f.dst.start + pos as usize;
    data[start..start + len as usize].copy_from_slice(&payload[..len as usize]);
    let byte_count = byte_count.max(pos + len);
    write_u32_ne(&mut data[p + PAYLOAD_PRIVATE_BYTE_COUNT..], byte_count);

    if let Some(offset) = f.payload_pkt_count_offset {
        add_u64_be(&mut data[offset..offset + 4], 1);
    }
    if let Some(offset) = f.payload_len_offset {
        write_u32_be(&mut data[offset..], byte_count);
    }
    debug!("{}: {} payload bytes at {}", f.ie, len, pos);
}

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

use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;

use flow_aggregator::aggregator::{
    AggregateRecord, DataRecord, ExportEvent, FlowAggregator, InformationElement, ManualClock,
    Packet, PacketAggregator, RecordTemplate, RuleSet, TemplateKind,
};
use flow_aggregator::config::{AggregatorConfig, Config};

fn ie(name: &str) -> InformationElement {
    InformationElement::by_name(name).unwrap()
}

fn config(yaml: &str) -> AggregatorConfig {
    Config::load(yaml).unwrap().aggregator
}

fn aggregates(sink: &Mutex<Vec<ExportEvent>>) -> Vec<AggregateRecord> {
    sink.lock()
        .drain(..)
        .filter_map(|e| match e {
            ExportEvent::AggregateRecordReady(r) => Some(r),
            _ => None,
        })
        .collect()
}

const HOST_PAIRS: &str = r#"
aggregator:
  poll-interval: 100ms
  hashtable-bits: 8
  expiration:
    active-timeout: 60s
    inactive-timeout: 1s
  rules:
    - template-id: 400
      flow-key:
        - ie: sourceIPv4Address
        - ie: destinationIPv4Address
      non-flow-key:
        - ie: octetDeltaCount
        - ie: flowStartSeconds
        - ie: flowEndSeconds
"#;

fn host_pair_template() -> Arc<RecordTemplate> {
    Arc::new(
        RecordTemplate::new(256, TemplateKind::Template)
            .field(ie("sourceIPv4Address"))
            .field(ie("destinationIPv4Address"))
            .field(ie("octetDeltaCount"))
            .field(ie("flowStartSeconds"))
            .field(ie("flowEndSeconds")),
    )
}

fn host_pair(src: [u8; 4], dst: [u8; 4], octets: u64, start: u32, end: u32) -> DataRecord {
    let mut r = DataRecord::zeroed(host_pair_template());
    r.set(&ie("sourceIPv4Address"), &src);
    r.set(&ie("destinationIPv4Address"), &dst);
    r.set_uint(&ie("octetDeltaCount"), octets);
    r.set_uint(&ie("flowStartSeconds"), start as u64);
    r.set_uint(&ie("flowEndSeconds"), end as u64);
    r
}

const A: [u8; 4] = [10, 0, 0, 1];
const B: [u8; 4] = [10, 0, 0, 2];
const C: [u8; 4] = [192, 168, 1, 1];
const D: [u8; 4] = [192, 168, 1, 2];

#[test]
fn three_records_two_aggregates() {
    let sink = Arc::new(Mutex::new(vec![]));
    let clock = Arc::new(ManualClock::default());
    let aggregator =
        FlowAggregator::with_clock(&config(HOST_PAIRS), sink.clone(), clock.clone()).unwrap();

    aggregator.on_data_record(&host_pair(A, B, 100, 0, 1));
    aggregator.on_data_record(&host_pair(A, B, 50, 1, 2));
    aggregator.on_data_record(&host_pair(C, D, 10, 5, 6));
    clock.set(Duration::from_secs(10));
    aggregator.expire(false);

    let records = aggregates(&sink);
    assert_eq!(records.len(), 2);
    let ab = &records[0];
    assert_eq!(ab.template_id(), 400);
    assert_eq!(&ab.get(&ie("sourceIPv4Address")).unwrap()[..4], &A);
    assert_eq!(&ab.get(&ie("destinationIPv4Address")).unwrap()[..4], &B);
    assert_eq!(ab.get_uint(&ie("octetDeltaCount")), Some(150));
    assert_eq!(ab.get_uint(&ie("flowStartSeconds")), Some(0));
    assert_eq!(ab.get_uint(&ie("flowEndSeconds")), Some(2));
    let cd = &records[1];
    assert_eq!(&cd.get(&ie("sourceIPv4Address")).unwrap()[..4], &C);
    assert_eq!(cd.get_uint(&ie("octetDeltaCount")), Some(10));
    assert_eq!(cd.get_uint(&ie("flowStartSeconds")), Some(5));
    assert_eq!(cd.get_uint(&ie("flowEndSeconds")), Some(6));
    assert_eq!(aggregator.buffered(), 0);
}

#[test]
fn inactive_timeout() {
    let yaml = HOST_PAIRS.replace("inactive-timeout: 1s", "inactive-timeout: 5s");
    let sink = Arc::new(Mutex::new(vec![]));
    let clock = Arc::new(ManualClock::default());
    let aggregator =
        FlowAggregator::with_clock(&config(&yaml), sink.clone(), clock.clone()).unwrap();
    // no flow times, the clock decides when an aggregate was last seen
    let record = |src: [u8; 4]| host_pair(src, B, 1, 0, 0);

    clock.set(Duration::from_millis(100_000));
    aggregator.on_data_record(&record(A));
    clock.set(Duration::from_millis(100_200));
    aggregator.on_data_record(&record(C));

    // A was last seen 5.1s ago, C 4.9s ago
    clock.set(Duration::from_millis(105_100));
    aggregator.expire(false);
    let records = aggregates(&sink);
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].get(&ie("sourceIPv4Address")).unwrap()[..4], &A);
    assert_eq!(aggregator.buffered(), 1);

    clock.set(Duration::from_millis(105_300));
    aggregator.expire(false);
    assert_eq!(aggregates(&sink).len(), 1);
    assert_eq!(aggregator.buffered(), 0);
}

#[test]
fn biflow_records_from_config() {
    let sink = Arc::new(Mutex::new(vec![]));
    let clock = Arc::new(ManualClock::default());
    let mut cfg = Config::load_from_file("config/flow-aggregator.yaml")
        .unwrap()
        .aggregator;
    cfg.rules.retain(|r| r.biflow_aggregation);
    assert_eq!(cfg.rules.len(), 1);
    let aggregator = FlowAggregator::with_clock(&cfg, sink.clone(), clock.clone()).unwrap();

    let template = Arc::new(
        RecordTemplate::new(258, TemplateKind::Template)
            .field(ie("sourceIPv4Address"))
            .field(ie("destinationIPv4Address"))
            .field(ie("sourceTransportPort"))
            .field(ie("destinationTransportPort"))
            .field(ie("protocolIdentifier"))
            .field(ie("flowStartMilliseconds"))
            .field(ie("flowEndMilliseconds"))
            .field(ie("octetDeltaCount"))
            .field(ie("packetDeltaCount")),
    );
    let flow = |src: [u8; 4], dst: [u8; 4], sport: u64, dport: u64, start: u64, octets: u64| {
        let mut r = DataRecord::zeroed(template.clone());
        r.set(&ie("sourceIPv4Address"), &src);
        r.set(&ie("destinationIPv4Address"), &dst);
        r.set_uint(&ie("sourceTransportPort"), sport);
        r.set_uint(&ie("destinationTransportPort"), dport);
        r.set_uint(&ie("protocolIdentifier"), 6);
        r.set_uint(&ie("flowStartMilliseconds"), start);
        r.set_uint(&ie("flowEndMilliseconds"), start + 10);
        r.set_uint(&ie("octetDeltaCount"), octets);
        r.set_uint(&ie("packetDeltaCount"), 1);
        r
    };

    aggregator.on_data_record(&flow(A, B, 40000, 80, 1_000, 300));
    aggregator.on_data_record(&flow(B, A, 80, 40000, 1_020, 1200));
    assert_eq!(aggregator.buffered(), 1);

    aggregator.expire(true);
    let records = aggregates(&sink);
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.template_id(), 999);
    assert_eq!(&r.get(&ie("sourceIPv4Address")).unwrap()[..4], &A);
    assert_eq!(r.get_uint(&ie("sourceTransportPort")), Some(40000));
    assert_eq!(r.get_uint(&ie("octetDeltaCount")), Some(300));
    assert_eq!(r.get_uint(&ie("revOctetDeltaCount")), Some(1200));
    assert_eq!(r.get_uint(&ie("revPacketDeltaCount")), Some(1));
    assert_eq!(r.get_uint(&ie("flowStartMilliseconds")), Some(1_000));
    assert_eq!(r.get_uint(&ie("revFlowStartMilliseconds")), Some(1_020));
    assert_eq!(r.get_uint(&ie("revFlowEndMilliseconds")), Some(1_030));
}

fn tcp_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let total = 40 + payload.len();
    let mut p = vec![0u8; total];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    p[8] = 64;
    p[9] = 6;
    p[12..16].copy_from_slice(&src);
    p[16..20].copy_from_slice(&dst);
    p[20..22].copy_from_slice(&sport.to_be_bytes());
    p[22..24].copy_from_slice(&dport.to_be_bytes());
    p[24..28].copy_from_slice(&1000u32.to_be_bytes());
    p[32] = 0x50;
    p[33] = 0x18;
    p[40..].copy_from_slice(payload);
    p
}

const WEB_PACKETS: &str = r#"
aggregator:
  hashtable-bits: 10
  expiration:
    active-timeout: 30s
    inactive-timeout: 2s
  rules:
    - template-id: 500
      flow-key:
        - ie: sourceIPv4Address
          modifier: mask/24
        - ie: destinationTransportPort
          match: "80,443"
      non-flow-key:
        - ie: octetDeltaCount
        - ie: packetDeltaCount
        - ie: tcpControlBits
"#;

#[test]
fn packets_through_channel() {
    let (sender, receiver) = mpsc::channel::<ExportEvent>();
    let aggregator = PacketAggregator::with_clock(
        &config(WEB_PACKETS),
        Arc::new(sender),
        Arc::new(ManualClock::new(Duration::from_secs(50))),
    )
    .unwrap();
    aggregator.start().unwrap();

    let t = Duration::from_secs(50);
    for (src, dport) in [
        ([10, 1, 2, 3], 80),
        ([10, 1, 2, 200], 443),
        ([10, 1, 3, 1], 80),
        ([10, 1, 2, 4], 22),
    ] {
        let packet = Packet::from_ipv4(tcp_packet(src, [1, 1, 1, 1], 5555, dport, &[0; 60]), t)
            .unwrap();
        aggregator.on_packet(&packet);
    }
    assert_eq!(aggregator.buffered(), 2);
    assert_eq!(
        aggregator
            .counter()
            .ignored
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    aggregator.shutdown(true).unwrap();

    let events: Vec<ExportEvent> = receiver.try_iter().collect();
    assert!(matches!(&events[0], ExportEvent::TemplateAnnounce(l) if l.template_id == 500));
    assert!(matches!(&events[1], ExportEvent::TemplateWithdraw(l) if l.template_id == 500));
    let records: Vec<_> = events
        .into_iter()
        .filter_map(|e| match e {
            ExportEvent::AggregateRecordReady(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), 2);
    let net = records
        .iter()
        .find(|r| r.get(&ie("sourceIPv4Address")).unwrap() == [10, 1, 2, 0, 8])
        .unwrap();
    assert_eq!(net.get_uint(&ie("octetDeltaCount")), Some(200));
    assert_eq!(net.get_uint(&ie("packetDeltaCount")), Some(2));
    assert_eq!(net.get_uint(&ie("tcpControlBits")), Some(0x18));
}

#[test]
fn reconfigure_running_aggregator() {
    let sink = Arc::new(Mutex::new(vec![]));
    let clock = Arc::new(ManualClock::default());
    let cfg = config(HOST_PAIRS);
    let aggregator = FlowAggregator::with_clock(&cfg, sink.clone(), clock.clone()).unwrap();
    aggregator.start().unwrap();
    aggregator.on_data_record(&host_pair(A, B, 100, 0, 1));

    let mut next = cfg.clone();
    next.rules[0].template_id = 401;
    aggregator
        .reconfigure(RuleSet::from_config(&next).unwrap())
        .unwrap();
    aggregator.on_data_record(&host_pair(A, B, 7, 3, 4));
    aggregator.shutdown(true).unwrap();

    let records = aggregates(&sink);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].template_id(), 400);
    assert_eq!(records[0].get_uint(&ie("octetDeltaCount")), Some(100));
    assert_eq!(records[1].template_id(), 401);
    assert_eq!(records[1].get_uint(&ie("octetDeltaCount")), Some(7));
}

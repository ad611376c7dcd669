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

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::*;
use parking_lot::Mutex;

use flow_aggregator::aggregator::{
    DataRecord, ExportEvent, FlowAggregator, InformationElement, ManualClock, Packet,
    PacketAggregator, RecordTemplate, TemplateKind,
};
use flow_aggregator::config::Config;

const RULES: &str = r#"
aggregator:
  hashtable-bits: 16
  expiration:
    active-timeout: 60s
    inactive-timeout: 5s
  rules:
    - template-id: 600
      flow-key:
        - ie: sourceIPv4Address
        - ie: destinationIPv4Address
        - ie: sourceTransportPort
        - ie: destinationTransportPort
        - ie: protocolIdentifier
      non-flow-key:
        - ie: octetDeltaCount
        - ie: packetDeltaCount
        - ie: flowStartSeconds
        - ie: flowEndSeconds
"#;

fn ie(name: &str) -> InformationElement {
    InformationElement::by_name(name).unwrap()
}

fn records(n: u64) -> Vec<DataRecord> {
    let template = Arc::new(
        RecordTemplate::new(256, TemplateKind::Template)
            .field(ie("sourceIPv4Address"))
            .field(ie("destinationIPv4Address"))
            .field(ie("sourceTransportPort"))
            .field(ie("destinationTransportPort"))
            .field(ie("protocolIdentifier"))
            .field(ie("octetDeltaCount"))
            .field(ie("packetDeltaCount"))
            .field(ie("flowStartSeconds"))
            .field(ie("flowEndSeconds")),
    );
    (0..n)
        .map(|i| {
            let mut r = DataRecord::zeroed(template.clone());
            r.set(&ie("sourceIPv4Address"), &[10, 0, (i >> 8) as u8, i as u8]);
            r.set(&ie("destinationIPv4Address"), &[172, 16, 0, 1]);
            r.set_uint(&ie("sourceTransportPort"), 1024 + i % 4096);
            r.set_uint(&ie("destinationTransportPort"), 443);
            r.set_uint(&ie("protocolIdentifier"), 6);
            r.set_uint(&ie("octetDeltaCount"), 1500);
            r.set_uint(&ie("packetDeltaCount"), 1);
            r.set_uint(&ie("flowStartSeconds"), 100);
            r.set_uint(&ie("flowEndSeconds"), 101);
            r
        })
        .collect()
}

fn packets(n: u64) -> Vec<Packet> {
    (0..n)
        .map(|i| {
            let mut p = vec![0u8; 60];
            p[0] = 0x45;
            p[2..4].copy_from_slice(&60u16.to_be_bytes());
            p[8] = 64;
            p[9] = 17;
            p[12..16].copy_from_slice(&[10, 0, (i >> 8) as u8, i as u8]);
            p[16..20].copy_from_slice(&[172, 16, 0, 1]);
            p[20..22].copy_from_slice(&((1024 + i % 4096) as u16).to_be_bytes());
            p[22..24].copy_from_slice(&53u16.to_be_bytes());
            p[24..26].copy_from_slice(&40u16.to_be_bytes());
            Packet::from_ipv4(p, Duration::from_secs(100)).unwrap()
        })
        .collect()
}

fn aggregation(c: &mut Criterion) {
    let config = Config::load(RULES).unwrap().aggregator;

    c.bench_function("flow-aggregate-records", |b| {
        b.iter_custom(|iters| {
            let inputs = records(iters);
            let sink = Arc::new(Mutex::new(Vec::<ExportEvent>::new()));
            let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
            let aggregator = FlowAggregator::with_clock(&config, sink, clock).unwrap();
            let start = Instant::now();
            for r in inputs.iter() {
                aggregator.on_data_record(r);
            }
            start.elapsed()
        })
    });

    c.bench_function("packet-aggregate", |b| {
        b.iter_custom(|iters| {
            let inputs = packets(iters);
            let sink = Arc::new(Mutex::new(Vec::<ExportEvent>::new()));
            let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
            let aggregator = PacketAggregator::with_clock(&config, sink, clock).unwrap();
            let start = Instant::now();
            for p in inputs.iter() {
                aggregator.on_packet(p);
            }
            start.elapsed()
        })
    });

    c.bench_function("flow-expire-all", |b| {
        b.iter_custom(|iters| {
            let inputs = records(iters);
            let sink = Arc::new(Mutex::new(Vec::<ExportEvent>::new()));
            let clock = Arc::new(ManualClock::new(Duration::from_secs(100)));
            let aggregator = FlowAggregator::with_clock(&config, sink, clock).unwrap();
            for r in inputs.iter() {
                aggregator.on_data_record(r);
            }
            let start = Instant::now();
            aggregator.expire(true);
            start.elapsed()
        })
    });
}

criterion_group!(benches, aggregation);
criterion_main!(benches);

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

//! Flow aggregation: rules select and merge flow records or raw packets into
//! buffered aggregates, which are exported after their timeouts.

#[allow(clippy::module_inception)]
mod aggregator;
mod bucket_store;
mod clock;
mod error;
mod flow_hashtable;
mod information_element;
mod packet;
mod packet_hashtable;
mod port_range;
mod record;
mod rule;
mod rules;
mod sink;
mod template;

pub use aggregator::{Aggregator, AggregatorCounter, FlowAggregator, PacketAggregator, State};
pub use bucket_store::{BucketStore, BucketStoreCounter, Hashtable, Reconfigurable, StoreParams};
pub use clock::{duration_to_ntp, ntp_to_duration, Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use flow_hashtable::FlowHashtable;
pub use information_element::{
    ids, InformationElement, ProtocolClasses, PEN_PRIVATE, PEN_PRIVATE_REVERSE, PEN_REVERSE,
};
pub use packet::Packet;
pub use packet_hashtable::PacketHashtable;
pub use port_range::{PortRange, PortRangeList};
pub use record::{DataRecord, RecordField, RecordTemplate, TemplateKind};
pub use rule::{Modifier, Pattern, Rule, RuleField};
pub use rules::RuleSet;
pub use sink::{AggregateRecord, ExportEvent, RecordSink};
pub use template::{FieldInfo, TemplateLayout};

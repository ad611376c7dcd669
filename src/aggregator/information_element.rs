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

//! Catalogue of the IPFIX information elements understood by the aggregator.

use std::fmt;

use ahash::AHashMap;
use bitflags::bitflags;
use lazy_static::lazy_static;

/// Enterprise number marking the reverse direction of a biflow (RFC 5103).
pub const PEN_REVERSE: u32 = 29305;
/// Enterprise space of the payload and packet gap elements.
pub const PEN_PRIVATE: u32 = 0x7770_0000;
pub const PEN_PRIVATE_REVERSE: u32 = PEN_PRIVATE | PEN_REVERSE;

pub mod ids {
    pub const OCTET_DELTA_COUNT: u16 = 1;
    pub const PACKET_DELTA_COUNT: u16 = 2;
    pub const PROTOCOL_IDENTIFIER: u16 = 4;
    pub const IP_CLASS_OF_SERVICE: u16 = 5;
    pub const TCP_CONTROL_BITS: u16 = 6;
    pub const SOURCE_TRANSPORT_PORT: u16 = 7;
    pub const SOURCE_IPV4_ADDRESS: u16 = 8;
    pub const SOURCE_IPV4_PREFIX_LENGTH: u16 = 9;
    pub const INGRESS_INTERFACE: u16 = 10;
    pub const DESTINATION_TRANSPORT_PORT: u16 = 11;
    pub const DESTINATION_IPV4_ADDRESS: u16 = 12;
    pub const DESTINATION_IPV4_PREFIX_LENGTH: u16 = 13;
    pub const EGRESS_INTERFACE: u16 = 14;
    pub const IP_NEXT_HOP_IPV4_ADDRESS: u16 = 15;
    pub const BGP_SOURCE_AS_NUMBER: u16 = 16;
    pub const BGP_DESTINATION_AS_NUMBER: u16 = 17;
    pub const POST_MCAST_PACKET_DELTA_COUNT: u16 = 19;
    pub const POST_MCAST_OCTET_DELTA_COUNT: u16 = 20;
    pub const FLOW_END_SYS_UP_TIME: u16 = 21;
    pub const FLOW_START_SYS_UP_TIME: u16 = 22;
    pub const POST_OCTET_DELTA_COUNT: u16 = 23;
    pub const POST_PACKET_DELTA_COUNT: u16 = 24;
    pub const MIN_PACKET_LENGTH: u16 = 25;
    pub const MAX_PACKET_LENGTH: u16 = 26;
    pub const ICMP_TYPE_CODE_IPV4: u16 = 32;
    pub const EXPORTED_OCTET_TOTAL_COUNT: u16 = 40;
    pub const EXPORTED_MESSAGE_TOTAL_COUNT: u16 = 41;
    pub const EXPORTED_FLOW_TOTAL_COUNT: u16 = 42;
    pub const MINIMUM_TTL: u16 = 52;
    pub const MAXIMUM_TTL: u16 = 53;
    pub const SOURCE_MAC_ADDRESS: u16 = 56;
    pub const IP_VERSION: u16 = 60;
    pub const DESTINATION_MAC_ADDRESS: u16 = 80;
    pub const OCTET_TOTAL_COUNT: u16 = 85;
    pub const PACKET_TOTAL_COUNT: u16 = 86;
    pub const DROPPED_OCTET_DELTA_COUNT: u16 = 132;
    pub const DROPPED_PACKET_DELTA_COUNT: u16 = 133;
    pub const DROPPED_OCTET_TOTAL_COUNT: u16 = 134;
    pub const DROPPED_PACKET_TOTAL_COUNT: u16 = 135;
    pub const FLOW_END_REASON: u16 = 136;
    pub const FLOW_START_SECONDS: u16 = 150;
    pub const FLOW_END_SECONDS: u16 = 151;
    pub const FLOW_START_MILLISECONDS: u16 = 152;
    pub const FLOW_END_MILLISECONDS: u16 = 153;
    pub const FLOW_START_MICROSECONDS: u16 = 154;
    pub const FLOW_END_MICROSECONDS: u16 = 155;
    pub const FLOW_START_NANOSECONDS: u16 = 156;
    pub const FLOW_END_NANOSECONDS: u16 = 157;
    pub const OBSERVED_FLOW_TOTAL_COUNT: u16 = 163;
    pub const UDP_SOURCE_PORT: u16 = 180;
    pub const UDP_DESTINATION_PORT: u16 = 181;
    pub const TCP_SOURCE_PORT: u16 = 182;
    pub const TCP_DESTINATION_PORT: u16 = 183;

    // ids below live in the private enterprise space
    pub const FRONT_PAYLOAD: u16 = 1;
    pub const FRONT_PAYLOAD_LEN: u16 = 2;
    pub const MAX_PACKET_GAP: u16 = 3;
    pub const FRONT_PAYLOAD_PKT_COUNT: u16 = 4;
    pub const DPA_FLOW_COUNT: u16 = 5;
    pub const DPA_FORCED_EXPORT: u16 = 6;
    pub const DPA_REVERSE_START: u16 = 7;
    pub const TRANSPORT_OCTET_DELTA_COUNT: u16 = 8;
    pub const ANONYMISATION_TYPE: u16 = 9;
}

bitflags! {
    /// Protocol classes a raw packet can belong to.
    pub struct ProtocolClasses: u8 {
        const TCP = 0x01;
        const UDP = 0x02;
        const ICMP = 0x04;
        const OTHER = 0x08;
        const ALL = Self::TCP.bits | Self::UDP.bits | Self::ICMP.bits | Self::OTHER.bits;
    }
}

const STANDARD: &[(&str, u16, u16)] = &[
    ("octetDeltaCount", ids::OCTET_DELTA_COUNT, 8),
    ("packetDeltaCount", ids::PACKET_DELTA_COUNT, 8),
    ("protocolIdentifier", ids::PROTOCOL_IDENTIFIER, 1),
    ("ipClassOfService", ids::IP_CLASS_OF_SERVICE, 1),
    ("tcpControlBits", ids::TCP_CONTROL_BITS, 1),
    ("sourceTransportPort", ids::SOURCE_TRANSPORT_PORT, 2),
    ("sourceIPv4Address", ids::SOURCE_IPV4_ADDRESS, 4),
    ("sourceIPv4PrefixLength", ids::SOURCE_IPV4_PREFIX_LENGTH, 1),
    ("ingressInterface", ids::INGRESS_INTERFACE, 4),
    ("destinationTransportPort", ids::DESTINATION_TRANSPORT_PORT, 2),
    ("destinationIPv4Address", ids::DESTINATION_IPV4_ADDRESS, 4),
    ("destinationIPv4PrefixLength", ids::DESTINATION_IPV4_PREFIX_LENGTH, 1),
    ("egressInterface", ids::EGRESS_INTERFACE, 4),
    ("ipNextHopIPv4Address", ids::IP_NEXT_HOP_IPV4_ADDRESS, 4),
    ("bgpSourceAsNumber", ids::BGP_SOURCE_AS_NUMBER, 2),
    ("bgpDestinationAsNumber", ids::BGP_DESTINATION_AS_NUMBER, 2),
    ("postMCastPacketDeltaCount", ids::POST_MCAST_PACKET_DELTA_COUNT, 8),
    ("postMCastOctetDeltaCount", ids::POST_MCAST_OCTET_DELTA_COUNT, 8),
    ("flowEndSysUpTime", ids::FLOW_END_SYS_UP_TIME, 4),
    ("flowStartSysUpTime", ids::FLOW_START_SYS_UP_TIME, 4),
    ("postOctetDeltaCount", ids::POST_OCTET_DELTA_COUNT, 8),
    ("postPacketDeltaCount", ids::POST_PACKET_DELTA_COUNT, 8),
    ("minPacketLength", ids::MIN_PACKET_LENGTH, 2),
    ("maxPacketLength", ids::MAX_PACKET_LENGTH, 2),
    ("icmpTypeCodeIPv4", ids::ICMP_TYPE_CODE_IPV4, 2),
    ("exportedOctetTotalCount", ids::EXPORTED_OCTET_TOTAL_COUNT, 8),
    ("exportedMessageTotalCount", ids::EXPORTED_MESSAGE_TOTAL_COUNT, 8),
    ("exportedFlowTotalCount", ids::EXPORTED_FLOW_TOTAL_COUNT, 8),
    ("minimumTTL", ids::MINIMUM_TTL, 1),
    ("maximumTTL", ids::MAXIMUM_TTL, 1),
    ("sourceMacAddress", ids::SOURCE_MAC_ADDRESS, 6),
    ("ipVersion", ids::IP_VERSION, 1),
    ("destinationMacAddress", ids::DESTINATION_MAC_ADDRESS, 6),
    ("octetTotalCount", ids::OCTET_TOTAL_COUNT, 8),
    ("packetTotalCount", ids::PACKET_TOTAL_COUNT, 8),
    ("droppedOctetDeltaCount", ids::DROPPED_OCTET_DELTA_COUNT, 8),
    ("droppedPacketDeltaCount", ids::DROPPED_PACKET_DELTA_COUNT, 8),
    ("droppedOctetTotalCount", ids::DROPPED_OCTET_TOTAL_COUNT, 8),
    ("droppedPacketTotalCount", ids::DROPPED_PACKET_TOTAL_COUNT, 8),
    ("flowEndReason", ids::FLOW_END_REASON, 1),
    ("flowStartSeconds", ids::FLOW_START_SECONDS, 4),
    ("flowEndSeconds", ids::FLOW_END_SECONDS, 4),
    ("flowStartMilliseconds", ids::FLOW_START_MILLISECONDS, 8),
    ("flowEndMilliseconds", ids::FLOW_END_MILLISECONDS, 8),
    ("flowStartMicroseconds", ids::FLOW_START_MICROSECONDS, 8),
    ("flowEndMicroseconds", ids::FLOW_END_MICROSECONDS, 8),
    ("flowStartNanoseconds", ids::FLOW_START_NANOSECONDS, 8),
    ("flowEndNanoseconds", ids::FLOW_END_NANOSECONDS, 8),
    ("observedFlowTotalCount", ids::OBSERVED_FLOW_TOTAL_COUNT, 8),
    ("udpSourcePort", ids::UDP_SOURCE_PORT, 2),
    ("udpDestinationPort", ids::UDP_DESTINATION_PORT, 2),
    ("tcpSourcePort", ids::TCP_SOURCE_PORT, 2),
    ("tcpDestinationPort", ids::TCP_DESTINATION_PORT, 2),
];

// frontPayload has no intrinsic length, rules must configure one
const PRIVATE: &[(&str, u16, u16)] = &[
    ("frontPayload", ids::FRONT_PAYLOAD, 0),
    ("frontPayloadLen", ids::FRONT_PAYLOAD_LEN, 4),
    ("maxPacketGap", ids::MAX_PACKET_GAP, 4),
    ("frontPayloadPktCount", ids::FRONT_PAYLOAD_PKT_COUNT, 4),
    ("dpaFlowCount", ids::DPA_FLOW_COUNT, 4),
    ("dpaForcedExport", ids::DPA_FORCED_EXPORT, 1),
    ("dpaReverseStart", ids::DPA_REVERSE_START, 1),
    ("transportOctetDeltaCount", ids::TRANSPORT_OCTET_DELTA_COUNT, 8),
    ("anonymisationType", ids::ANONYMISATION_TYPE, 1),
];

fn reverse_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) => format!("rev{}{}", c.to_ascii_uppercase(), chars.as_str()),
        None => String::from("rev"),
    }
}

lazy_static! {
    static ref BY_NAME: AHashMap<String, InformationElement> = {
        let mut m = AHashMap::new();
        for (spaces, table) in [
            ((0, PEN_REVERSE), STANDARD),
            ((PEN_PRIVATE, PEN_PRIVATE_REVERSE), PRIVATE),
        ] {
            for (name, id, length) in table {
                m.insert(name.to_string(), InformationElement::new(*id, spaces.0, *length));
                m.insert(reverse_name(name), InformationElement::new(*id, spaces.1, *length));
            }
        }
        m
    };
    static ref BY_ID: AHashMap<(u16, u32), String> = BY_NAME
        .iter()
        .map(|(name, ie)| ((ie.id, ie.enterprise), name.clone()))
        .collect();
}

/// An IPFIX field type. `length` is the number of bytes the field occupies in a
/// record, which may differ from the catalogue default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InformationElement {
    pub id: u16,
    pub enterprise: u32,
    pub length: u16,
}

impl InformationElement {
    pub const fn new(id: u16, enterprise: u32, length: u16) -> Self {
        Self {
            id,
            enterprise,
            length,
        }
    }

    pub const fn standard(id: u16, length: u16) -> Self {
        Self::new(id, 0, length)
    }

    pub const fn private(id: u16, length: u16) -> Self {
        Self::new(id, PEN_PRIVATE, length)
    }

    /// Looks up an element by its IPFIX name, `rev` prefixed names included.
    pub fn by_name(name: &str) -> Option<Self> {
        BY_NAME.get(name).copied()
    }

    /// Looks up an element by number, returning its catalogue length.
    pub fn by_id(id: u16, enterprise: u32) -> Option<Self> {
        BY_ID
            .get(&(id, enterprise))
            .and_then(|name| Self::by_name(name))
    }

    pub fn name(&self) -> Option<&'static str> {
        BY_ID.get(&(self.id, self.enterprise)).map(|s| s.as_str())
    }

    pub fn is_known(&self) -> bool {
        BY_ID.contains_key(&(self.id, self.enterprise))
    }

    pub fn with_length(self, length: u16) -> Self {
        Self { length, ..self }
    }

    /// Same id and enterprise, length ignored.
    pub fn same_type(&self, other: &Self) -> bool {
        self.id == other.id && self.enterprise == other.enterprise
    }

    pub fn is(&self, id: u16, enterprise: u32) -> bool {
        self.id == id && self.enterprise == enterprise
    }

    pub fn is_standard(&self, id: u16) -> bool {
        self.is(id, 0)
    }

    pub fn is_private(&self, id: u16) -> bool {
        self.is(id, PEN_PRIVATE)
    }

    pub fn is_reverse(&self) -> bool {
        self.enterprise == PEN_REVERSE || self.enterprise == PEN_PRIVATE_REVERSE
    }

    /// The counterpart of this element in the other flow direction.
    pub fn reverse(&self) -> Self {
        let enterprise = match self.enterprise {
            0 => PEN_REVERSE,
            PEN_REVERSE => 0,
            PEN_PRIVATE => PEN_PRIVATE_REVERSE,
            PEN_PRIVATE_REVERSE => PEN_PRIVATE,
            e => e,
        };
        Self { enterprise, ..*self }
    }

    /// The element with the reverse flag cleared.
    pub fn forward(&self) -> Self {
        if self.is_reverse() {
            self.reverse()
        } else {
            *self
        }
    }

    pub fn is_ipv4_address(&self) -> bool {
        self.enterprise == 0
            && matches!(
                self.id,
                ids::SOURCE_IPV4_ADDRESS | ids::DESTINATION_IPV4_ADDRESS
            )
    }

    pub fn is_port(&self) -> bool {
        self.enterprise == 0
            && matches!(
                self.id,
                ids::SOURCE_TRANSPORT_PORT
                    | ids::DESTINATION_TRANSPORT_PORT
                    | ids::UDP_SOURCE_PORT
                    | ids::UDP_DESTINATION_PORT
                    | ids::TCP_SOURCE_PORT
                    | ids::TCP_DESTINATION_PORT
            )
    }

    pub fn is_flow_start(&self) -> bool {
        matches!(self.enterprise, 0 | PEN_REVERSE)
            && matches!(
                self.id,
                ids::FLOW_START_SYS_UP_TIME
                    | ids::FLOW_START_SECONDS
                    | ids::FLOW_START_MILLISECONDS
                    | ids::FLOW_START_MICROSECONDS
                    | ids::FLOW_START_NANOSECONDS
            )
    }

    pub fn is_flow_end(&self) -> bool {
        matches!(self.enterprise, 0 | PEN_REVERSE)
            && matches!(
                self.id,
                ids::FLOW_END_SYS_UP_TIME
                    | ids::FLOW_END_SECONDS
                    | ids::FLOW_END_MILLISECONDS
                    | ids::FLOW_END_MICROSECONDS
                    | ids::FLOW_END_NANOSECONDS
            )
    }

    /// Aggregatable elements are merged by the aggregation functions, all other
    /// elements form the flow key.
    pub fn is_aggregatable(&self) -> bool {
        match self.enterprise {
            0 => {
                self.is_flow_start()
                    || self.is_flow_end()
                    || matches!(
                        self.id,
                        ids::OCTET_DELTA_COUNT
                            | ids::POST_OCTET_DELTA_COUNT
                            | ids::PACKET_DELTA_COUNT
                            | ids::POST_PACKET_DELTA_COUNT
                            | ids::DROPPED_OCTET_DELTA_COUNT
                            | ids::DROPPED_PACKET_DELTA_COUNT
                            | ids::TCP_CONTROL_BITS
                    )
            }
            PEN_PRIVATE => matches!(
                self.id,
                ids::FRONT_PAYLOAD
                    | ids::FRONT_PAYLOAD_LEN
                    | ids::FRONT_PAYLOAD_PKT_COUNT
                    | ids::MAX_PACKET_GAP
                    | ids::DPA_FORCED_EXPORT
                    | ids::DPA_FLOW_COUNT
                    | ids::DPA_REVERSE_START
                    | ids::TRANSPORT_OCTET_DELTA_COUNT
            ),
            PEN_REVERSE => matches!(
                self.id,
                ids::FLOW_START_SECONDS
                    | ids::FLOW_END_SECONDS
                    | ids::FLOW_START_MILLISECONDS
                    | ids::FLOW_END_MILLISECONDS
                    | ids::FLOW_START_NANOSECONDS
                    | ids::FLOW_END_NANOSECONDS
                    | ids::OCTET_DELTA_COUNT
                    | ids::PACKET_DELTA_COUNT
                    | ids::TCP_CONTROL_BITS
            ),
            PEN_PRIVATE_REVERSE => matches!(
                self.id,
                ids::FRONT_PAYLOAD | ids::FRONT_PAYLOAD_LEN | ids::MAX_PACKET_GAP
            ),
            _ => false,
        }
    }

    /// Protocol classes a packet must belong to for this element to be meaningful.
    pub fn protocols(&self) -> ProtocolClasses {
        let fwd = self.forward();
        if fwd.enterprise == 0 {
            match fwd.id {
                ids::ICMP_TYPE_CODE_IPV4 => ProtocolClasses::ICMP,
                ids::TCP_CONTROL_BITS | ids::TCP_SOURCE_PORT | ids::TCP_DESTINATION_PORT => {
                    ProtocolClasses::TCP
                }
                ids::UDP_SOURCE_PORT | ids::UDP_DESTINATION_PORT => ProtocolClasses::UDP,
                ids::SOURCE_TRANSPORT_PORT | ids::DESTINATION_TRANSPORT_PORT => {
                    ProtocolClasses::TCP | ProtocolClasses::UDP
                }
                _ => ProtocolClasses::ALL,
            }
        } else if fwd.enterprise == PEN_PRIVATE {
            match fwd.id {
                ids::MAX_PACKET_GAP => ProtocolClasses::ALL,
                _ => ProtocolClasses::TCP | ProtocolClasses::UDP,
            }
        } else {
            ProtocolClasses::empty()
        }
    }
}

impl fmt::Display for InformationElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None if self.enterprise == 0 => write!(f, "{}", self.id),
            None => write!(f, "{}/{}", self.id, self.enterprise),
        }
    }
}

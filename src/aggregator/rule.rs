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
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use log::{info, warn};
use public::bytes::read_u16_be;

use super::error::{Error, Result};
use super::information_element::{ids, InformationElement, ProtocolClasses};
use super::packet::{Packet, FIELD_OFFSET_DIP, FIELD_OFFSET_PROTOCOL, FIELD_OFFSET_SIP};
use super::port_range::{PortRange, PortRangeList};
use super::record::{DataRecord, TemplateKind};

const IPV4_RULE_LENGTH: u16 = 5;
const MIN_FRONT_PAYLOAD_LENGTH: u16 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modifier {
    Discard,
    Keep,
    Aggregate,
    // keep only the given number of leading address bits
    Mask(u8),
}

impl Modifier {
    pub fn mask_bits(&self) -> Option<u8> {
        match self {
            Modifier::Mask(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Modifier::Discard => write!(f, "discard"),
            Modifier::Keep => write!(f, "keep"),
            Modifier::Aggregate => write!(f, "aggregate"),
            Modifier::Mask(n) => write!(f, "mask/{}", n),
        }
    }
}

impl FromStr for Modifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "keep" => Ok(Modifier::Keep),
            "discard" => Ok(Modifier::Discard),
            "aggregate" => Ok(Modifier::Aggregate),
            m => match m.strip_prefix("mask/").map(|n| n.parse::<u8>()) {
                Some(Ok(n)) if n <= 32 => Ok(Modifier::Mask(n)),
                _ => Err(format!("unknown modifier {}", s)),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pattern {
    // imask is the number of host bits, i.e. 32 - prefix length
    Ipv4 { addr: Ipv4Addr, imask: u8 },
    Ports(PortRangeList),
    Raw(Vec<u8>),
}

fn parse_protocol(s: &str) -> Option<u8> {
    match s.to_ascii_uppercase().as_str() {
        "ICMP" => Some(1),
        "TCP" => Some(6),
        "UDP" => Some(17),
        "SCTP" => Some(132),
        "RAW" => Some(255),
        n => n.parse::<u8>().ok(),
    }
}

fn parse_tcp_flags(s: &str) -> Option<u8> {
    let mut flags = 0;
    for name in s.split(',').map(|f| f.trim()) {
        flags |= match name.to_ascii_uppercase().as_str() {
            "FIN" => 0x01,
            "SYN" => 0x02,
            "RST" => 0x04,
            "PSH" => 0x08,
            "ACK" => 0x10,
            "URG" => 0x20,
            _ => return None,
        };
    }
    Some(flags)
}

impl Pattern {
    pub fn parse(ie: &InformationElement, s: &str) -> Result<Pattern> {
        let s = s.trim();
        let invalid = |reason: &str| Error::InvalidPattern {
            ie: *ie,
            pattern: s.to_owned(),
            reason: reason.to_owned(),
        };
        if ie.enterprise != 0 {
            return Err(Error::PatternNotSupported(*ie));
        }
        match ie.id {
            ids::PROTOCOL_IDENTIFIER => parse_protocol(s)
                .map(|p| Pattern::Raw(vec![p]))
                .ok_or_else(|| invalid("unknown protocol")),
            ids::SOURCE_IPV4_ADDRESS | ids::DESTINATION_IPV4_ADDRESS => {
                if s.contains('/') {
                    let net = Ipv4Net::from_str(s).map_err(|e| invalid(&e.to_string()))?;
                    Ok(Pattern::Ipv4 {
                        addr: net.addr(),
                        imask: 32 - net.prefix_len(),
                    })
                } else {
                    let addr = Ipv4Addr::from_str(s).map_err(|e| invalid(&e.to_string()))?;
                    Ok(Pattern::Ipv4 { addr, imask: 0 })
                }
            }
            _ if ie.is_port() => PortRangeList::try_from(s)
                .map(Pattern::Ports)
                .map_err(|e| invalid(&e)),
            ids::TCP_CONTROL_BITS => parse_tcp_flags(s)
                .map(|f| Pattern::Raw(vec![f]))
                .ok_or_else(|| invalid("unknown tcp flag")),
            _ => Err(Error::PatternNotSupported(*ie)),
        }
    }

    /// The pattern as stored in the fixed data portion of an aggregated template.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        match self {
            Pattern::Ipv4 { addr, imask } => {
                let mut v = addr.octets().to_vec();
                v.push(*imask);
                v
            }
            Pattern::Ports(list) => list.to_be_bytes(),
            Pattern::Raw(v) => v.clone(),
        }
    }

    /// Checks a field value, given with its own encoded length.
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Pattern::Ipv4 { addr, imask } => {
                let data_imask = ipv4_imask(data);
                if data_imask > *imask {
                    return false;
                }
                let daddr = ipv4_address(data);
                let paddr = u32::from(*addr);
                daddr.checked_shr(*imask as u32).unwrap_or(0)
                    == paddr.checked_shr(*imask as u32).unwrap_or(0)
            }
            Pattern::Ports(list) => match_ports(data, &list.to_be_bytes()),
            Pattern::Raw(v) => data == v.as_slice(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pattern::Ipv4 { addr, imask } => write!(f, "{}/{}", addr, 32 - imask),
            Pattern::Ports(list) => write!(f, "{}", list),
            Pattern::Raw(v) => write!(f, "{:02x?}", v),
        }
    }
}

/// Host bits of an address field; a fifth byte carries them explicitly, shorter
/// fields imply them from the missing bytes.
pub fn ipv4_imask(data: &[u8]) -> u8 {
    match data.len() {
        0..=4 => ((4 - data.len()) * 8) as u8,
        _ => data[4],
    }
}

fn ipv4_address(data: &[u8]) -> u32 {
    data.iter()
        .take(4)
        .enumerate()
        .fold(0, |addr, (i, b)| addr | (*b as u32) << (24 - 8 * i))
}

// both sides are either a single port (2 bytes) or a list of ranges (4 bytes each)
fn match_ports(data: &[u8], pattern: &[u8]) -> bool {
    match (data.len(), pattern.len()) {
        (2, 2) => data == pattern,
        (2, p) if p % 4 == 0 => PortRangeList::from_be_bytes(pattern).contains(read_u16_be(data)),
        (d, 2) if d % 4 == 0 => {
            let port = PortRange::single(read_u16_be(pattern));
            PortRangeList::from_be_bytes(data)
                .element()
                .iter()
                .all(|r| port.contains_range(r))
        }
        (d, p) if d % 4 == 0 && p % 4 == 0 => {
            let ranges = PortRangeList::from_be_bytes(data);
            PortRangeList::from_be_bytes(pattern).covers(ranges.element())
        }
        _ => false,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleField {
    pub ie: InformationElement,
    pub modifier: Modifier,
    pub pattern: Option<Pattern>,
}

impl RuleField {
    pub fn new(ie: InformationElement, modifier: Modifier, pattern: Option<Pattern>) -> Result<Self> {
        let mut ie = ie;
        if ie.is_ipv4_address() {
            // the extra byte holds the inverse mask
            ie.length = IPV4_RULE_LENGTH;
        } else if modifier.mask_bits().is_some() {
            return Err(Error::InvalidModifier {
                ie,
                modifier: modifier.to_string(),
            });
        }
        if ie.forward().is_private(ids::FRONT_PAYLOAD) && ie.length < MIN_FRONT_PAYLOAD_LENGTH {
            return Err(Error::FrontPayloadTooShort(ie.length));
        }
        Ok(Self {
            ie,
            modifier,
            pattern,
        })
    }

    pub fn key(ie: InformationElement) -> Result<Self> {
        Self::new(ie, Modifier::Keep, None)
    }

    pub fn aggregate(ie: InformationElement) -> Result<Self> {
        Self::new(ie, Modifier::Aggregate, None)
    }

    pub fn masked(ie: InformationElement, bits: u8) -> Result<Self> {
        Self::new(ie, Modifier::Mask(bits), None)
    }

    pub fn matching(ie: InformationElement, pattern: &str) -> Result<Self> {
        let pattern = Pattern::parse(&ie, pattern)?;
        Self::new(ie, Modifier::Keep, Some(pattern))
    }

    pub fn discard(mut self) -> Self {
        self.modifier = Modifier::Discard;
        self
    }
}

impl fmt::Display for RuleField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({}) {}", self.ie, self.ie.length, self.modifier)?;
        if let Some(p) = &self.pattern {
            write!(f, " = {}", p)?;
        }
        Ok(())
    }
}

/// One aggregation rule: which records it accepts and which fields the
/// aggregated template consists of.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub id: u16,
    pub preceding: u16,
    pub biflow_aggregation: bool,
    pub fields: Vec<RuleField>,
    valid_protocols: ProtocolClasses,
}

impl Rule {
    pub fn new(id: u16, biflow_aggregation: bool, mut fields: Vec<RuleField>) -> Result<Self> {
        if biflow_aggregation {
            for f in fields.iter_mut().filter(|f| f.pattern.is_some()) {
                warn!(
                    "rule {}: match patterns are not supported with biflow aggregation, ignoring pattern of {}",
                    id, f.ie
                );
                f.pattern = None;
            }
        }

        let mut valid_protocols = ProtocolClasses::empty();
        for f in fields.iter() {
            if f.ie.is_standard(ids::PROTOCOL_IDENTIFIER) {
                info!(
                    "protocolIdentifier is contained in rule {}, accepting all protocol types",
                    id
                );
                valid_protocols = ProtocolClasses::ALL;
            }
            valid_protocols |= f.ie.protocols();
        }
        if valid_protocols.is_empty() {
            return Err(Error::NoValidProtocol(id));
        }

        Ok(Self {
            id,
            preceding: 0,
            biflow_aggregation,
            fields,
            valid_protocols,
        })
    }

    pub fn with_preceding(mut self, preceding: u16) -> Self {
        self.preceding = preceding;
        self
    }

    pub fn valid_protocols(&self) -> ProtocolClasses {
        self.valid_protocols
    }

    pub fn pattern_fields(&self) -> impl Iterator<Item = (&RuleField, &Pattern)> {
        self.fields
            .iter()
            .filter_map(|f| f.pattern.as_ref().map(|p| (f, p)))
    }

    pub fn field(&self, ie: &InformationElement) -> Option<&RuleField> {
        self.fields.iter().find(|f| f.ie.same_type(ie))
    }

    /// Checks whether a decoded record is eligible for this rule.
    pub fn matches_record(&self, record: &DataRecord) -> bool {
        let template = &record.template;
        for field in self.fields.iter() {
            if field.ie.is_reverse() {
                continue;
            }

            if let Some(pattern) = field.pattern.as_ref() {
                let prefix_ie = prefix_length_ie(&field.ie);
                let (value, prefix) = if let Some(rf) = template.find_field(&field.ie) {
                    let prefix = prefix_ie
                        .and_then(|ie| template.find_field(&ie))
                        .and_then(|pf| pf.slice(&record.data).first().copied());
                    (rf.slice(&record.data), prefix)
                } else if let Some(df) = template
                    .find_data_field(&field.ie)
                    .filter(|_| template.kind == TemplateKind::DataTemplate)
                {
                    let prefix = prefix_ie
                        .and_then(|ie| template.find_data_field(&ie))
                        .and_then(|pf| pf.slice(&template.data).first().copied());
                    (df.slice(&template.data), prefix)
                } else {
                    return false;
                };
                if !pattern.matches(value) {
                    return false;
                }
                if let (Pattern::Ipv4 { imask, .. }, Some(prefix)) = (pattern, prefix) {
                    if prefix < 32 - imask {
                        return false;
                    }
                }
                continue;
            }

            if field.modifier == Modifier::Discard
                || field.ie.is_private(ids::ANONYMISATION_TYPE)
            {
                continue;
            }
            let present = |ie: &InformationElement| {
                template.find_field(ie).is_some() || template.find_data_field(ie).is_some()
            };
            if !present(&field.ie) && !(self.biflow_aggregation && present(&field.ie.reverse())) {
                return false;
            }
        }
        true
    }

    /// Checks whether a raw packet is eligible for this rule.
    pub fn matches_packet(&self, packet: &Packet) -> bool {
        if !self.valid_protocols.intersects(packet.class()) {
            return false;
        }
        for (field, pattern) in self.pattern_fields() {
            match raw_pattern_source(&field.ie, packet) {
                Some(value) if pattern.matches(value) => (),
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rule {}", self.id)?;
        if self.biflow_aggregation {
            write!(f, " (biflow)")?;
        }
        for field in self.fields.iter() {
            write!(f, "\n  {}", field)?;
        }
        Ok(())
    }
}

fn prefix_length_ie(ie: &InformationElement) -> Option<InformationElement> {
    match ie.id {
        ids::SOURCE_IPV4_ADDRESS if ie.enterprise == 0 => Some(InformationElement::standard(
            ids::SOURCE_IPV4_PREFIX_LENGTH,
            1,
        )),
        ids::DESTINATION_IPV4_ADDRESS if ie.enterprise == 0 => Some(
            InformationElement::standard(ids::DESTINATION_IPV4_PREFIX_LENGTH, 1),
        ),
        _ => None,
    }
}

fn raw_pattern_source<'a>(ie: &InformationElement, packet: &'a Packet) -> Option<&'a [u8]> {
    let ip = packet.ip_header();
    let class = packet.class();
    match ie.id {
        ids::PROTOCOL_IDENTIFIER => Some(&ip[FIELD_OFFSET_PROTOCOL..FIELD_OFFSET_PROTOCOL + 1]),
        ids::SOURCE_IPV4_ADDRESS => Some(&ip[FIELD_OFFSET_SIP..FIELD_OFFSET_SIP + 4]),
        ids::DESTINATION_IPV4_ADDRESS => Some(&ip[FIELD_OFFSET_DIP..FIELD_OFFSET_DIP + 4]),
        ids::TCP_CONTROL_BITS if class == ProtocolClasses::TCP => {
            packet.transport_header().map(|h| &h[13..14])
        }
        _ if ie.is_port() => {
            let accepted = match ie.id {
                ids::TCP_SOURCE_PORT | ids::TCP_DESTINATION_PORT => ProtocolClasses::TCP,
                ids::UDP_SOURCE_PORT | ids::UDP_DESTINATION_PORT => ProtocolClasses::UDP,
                _ => ProtocolClasses::TCP | ProtocolClasses::UDP,
            };
            if !accepted.intersects(class) {
                return None;
            }
            let offset = match ie.id {
                ids::SOURCE_TRANSPORT_PORT | ids::UDP_SOURCE_PORT | ids::TCP_SOURCE_PORT => 0,
                _ => 2,
            };
            packet.transport_header().map(|h| &h[offset..offset + 2])
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::aggregator::packet::tests::ipv4_packet;
    use crate::aggregator::port_range::PortRange;
    use crate::aggregator::record::RecordTemplate;

    fn ie(name: &str) -> InformationElement {
        InformationElement::by_name(name).unwrap()
    }

    fn ports(list: &[u16]) -> PortRangeList {
        list.iter().map(|p| PortRange::single(*p)).collect::<Vec<_>>().into()
    }

    #[test]
    fn ipv4_prefix_pattern() {
        let pattern = Pattern::parse(&ie("sourceIPv4Address"), "10.0.0.0/8").unwrap();
        assert_eq!(
            pattern,
            Pattern::Ipv4 {
                addr: Ipv4Addr::new(10, 0, 0, 0),
                imask: 24
            }
        );
        assert!(pattern.matches(&[10, 1, 2, 3]));
        assert!(pattern.matches(&[10, 1, 2, 3, 0]));
        assert!(!pattern.matches(&[11, 0, 0, 0]));
        // data less specific than the pattern
        assert!(!pattern.matches(&[10, 0, 0, 0, 25]));
        assert!(pattern.matches(&[10, 0]));
    }

    #[test]
    fn port_list_pattern() {
        let pattern = Pattern::parse(&ie("destinationTransportPort"), "80,443").unwrap();
        assert_eq!(pattern, Pattern::Ports(ports(&[80, 443])));
        assert!(pattern.matches(&443u16.to_be_bytes()));
        assert!(!pattern.matches(&8080u16.to_be_bytes()));

        let ranges = Pattern::parse(&ie("sourceTransportPort"), "1000:2000").unwrap();
        let mut data = PortRange::new(1100, 1200).to_be_bytes().to_vec();
        assert!(ranges.matches(&data));
        data.extend_from_slice(&PortRange::new(1900, 2100).to_be_bytes());
        assert!(!ranges.matches(&data));

        assert!(!match_ports(&PortRange::new(70, 90).to_be_bytes(), &80u16.to_be_bytes()));
        assert!(!match_ports(&PortRange::new(80, 90).to_be_bytes(), &80u16.to_be_bytes()));
        assert!(!match_ports(&PortRange::new(1000, 2000).to_be_bytes(), &80u16.to_be_bytes()));
        assert!(match_ports(&PortRange::single(80).to_be_bytes(), &80u16.to_be_bytes()));
    }

    #[test]
    fn protocol_and_flag_patterns() {
        let proto = Pattern::parse(&ie("protocolIdentifier"), "tcp").unwrap();
        assert_eq!(proto, Pattern::Raw(vec![6]));
        assert_eq!(
            Pattern::parse(&ie("protocolIdentifier"), "47").unwrap(),
            Pattern::Raw(vec![47])
        );
        assert!(Pattern::parse(&ie("protocolIdentifier"), "300").is_err());
        assert_eq!(
            Pattern::parse(&ie("tcpControlBits"), "SYN,ACK").unwrap(),
            Pattern::Raw(vec![0x12])
        );
        assert!(matches!(
            Pattern::parse(&ie("octetDeltaCount"), "1"),
            Err(Error::PatternNotSupported(_))
        ));
    }

    #[test]
    fn field_construction_checks() {
        let src = RuleField::masked(ie("sourceIPv4Address"), 24).unwrap();
        assert_eq!(src.ie.length, 5);
        assert!(RuleField::masked(ie("sourceTransportPort"), 8).is_err());
        assert!(matches!(
            RuleField::aggregate(ie("frontPayload").with_length(4)),
            Err(Error::FrontPayloadTooShort(4))
        ));
        assert_eq!("mask/24".parse::<Modifier>(), Ok(Modifier::Mask(24)));
        assert!("mask/33".parse::<Modifier>().is_err());
    }

    #[test]
    fn biflow_drops_patterns() {
        let rule = Rule::new(
            1,
            true,
            vec![RuleField::matching(ie("destinationTransportPort"), "80").unwrap()],
        )
        .unwrap();
        assert_eq!(rule.pattern_fields().count(), 0);
    }

    #[test]
    fn record_matching() {
        let rule = Rule::new(
            10,
            false,
            vec![
                RuleField::matching(ie("sourceIPv4Address"), "10.0.0.0/8").unwrap(),
                RuleField::key(ie("destinationIPv4Address")).unwrap(),
                RuleField::aggregate(ie("octetDeltaCount")).unwrap(),
                RuleField::key(ie("anonymisationType")).unwrap(),
            ],
        )
        .unwrap();
        let template = Arc::new(
            RecordTemplate::new(256, TemplateKind::Template)
                .field(ie("sourceIPv4Address"))
                .field(ie("destinationIPv4Address"))
                .field(ie("octetDeltaCount")),
        );
        let mut record = DataRecord::zeroed(template.clone());
        record.set(&ie("sourceIPv4Address"), &[10, 1, 2, 3]);
        assert!(rule.matches_record(&record));
        record.set(&ie("sourceIPv4Address"), &[11, 0, 0, 0]);
        assert!(!rule.matches_record(&record));

        // a missing key field rejects the record
        let partial = Arc::new(
            RecordTemplate::new(257, TemplateKind::Template)
                .field(ie("sourceIPv4Address"))
                .field(ie("octetDeltaCount")),
        );
        let mut record = DataRecord::zeroed(partial);
        record.set(&ie("sourceIPv4Address"), &[10, 1, 2, 3]);
        assert!(!rule.matches_record(&record));

        // fixed values of a data template are matched as well
        let fixed = Arc::new(
            RecordTemplate::new(258, TemplateKind::Template)
                .field(ie("destinationIPv4Address"))
                .field(ie("octetDeltaCount"))
                .fixed(ie("sourceIPv4Address"), &[10, 9, 9, 9])
                .fixed(ie("sourceIPv4PrefixLength"), &[16]),
        );
        assert!(rule.matches_record(&DataRecord::zeroed(fixed)));
        let coarse = Arc::new(
            RecordTemplate::new(259, TemplateKind::Template)
                .field(ie("destinationIPv4Address"))
                .field(ie("octetDeltaCount"))
                .fixed(ie("sourceIPv4Address"), &[10, 9, 9, 9])
                .fixed(ie("sourceIPv4PrefixLength"), &[4]),
        );
        assert!(!rule.matches_record(&DataRecord::zeroed(coarse)));
    }

    #[test]
    fn empty_prefix_length_is_ignored() {
        let rule = Rule::new(
            11,
            false,
            vec![
                RuleField::matching(ie("sourceIPv4Address"), "10.0.0.0/8").unwrap(),
                RuleField::aggregate(ie("octetDeltaCount")).unwrap(),
            ],
        )
        .unwrap();
        let template = Arc::new(
            RecordTemplate::new(260, TemplateKind::Template)
                .field(ie("sourceIPv4Address"))
                .field(ie("sourceIPv4PrefixLength").with_length(0))
                .field(ie("octetDeltaCount")),
        );
        let mut record = DataRecord::zeroed(template);
        record.set(&ie("sourceIPv4Address"), &[10, 1, 2, 3]);
        assert!(rule.matches_record(&record));
    }

    #[test]
    fn packet_matching() {
        let rule = Rule::new(
            11,
            false,
            vec![
                RuleField::key(ie("sourceIPv4Address")).unwrap(),
                RuleField::matching(ie("destinationTransportPort"), "80,443").unwrap(),
                RuleField::aggregate(ie("packetDeltaCount")).unwrap(),
            ],
        )
        .unwrap();
        let tcp = ipv4_packet(6, [10, 0, 0, 1], [10, 0, 0, 2], 40000, 443, b"");
        let packet = Packet::from_ipv4(tcp, Duration::ZERO).unwrap();
        assert!(rule.matches_packet(&packet));
        let other = ipv4_packet(17, [10, 0, 0, 1], [10, 0, 0, 2], 40000, 8080, b"");
        let packet = Packet::from_ipv4(other, Duration::ZERO).unwrap();
        assert!(!rule.matches_packet(&packet));
        let icmp = ipv4_packet(1, [10, 0, 0, 1], [10, 0, 0, 2], 0, 0, b"");
        let packet = Packet::from_ipv4(icmp, Duration::ZERO).unwrap();
        assert!(!rule.matches_packet(&packet));
    }
}

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

use std::time::Duration;

use pnet::packet::{
    ethernet::EtherTypes,
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
};
use public::bytes::{read_u16_be, read_u32_be};

use super::clock::duration_to_ntp;
use super::error::{Error, Result};
use super::information_element::ProtocolClasses;

const ETH_HEADER_SIZE: usize = 14;
const FIELD_OFFSET_ETH_TYPE: usize = 12;
const IPV4_HEADER_SIZE: usize = 20;
const TCP_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;
const ICMP_HEADER_SIZE: usize = 8;

pub const FIELD_OFFSET_TOTAL_LEN: usize = 2;
pub const FIELD_OFFSET_PROTOCOL: usize = 9;
pub const FIELD_OFFSET_SIP: usize = 12;
pub const FIELD_OFFSET_DIP: usize = 16;
pub const FIELD_OFFSET_TOS: usize = 1;
pub const FIELD_OFFSET_TCP_SEQ: usize = 4;
pub const FIELD_OFFSET_TCP_FLAGS: usize = 13;

pub const TCP_SYN: u8 = 0x02;

/// An IPv4 packet as seen on the fast path. `data` starts at the link layer when
/// a link header is present, otherwise at the IP header.
#[derive(Clone, Debug)]
pub struct Packet {
    data: Vec<u8>,
    ip_offset: usize,
    ip_end: usize,
    transport_offset: Option<usize>,
    payload_offset: usize,
    protocol: IpNextHeaderProtocol,
    class: ProtocolClasses,
    timestamp: Duration,
    pub observation_domain_id: u32,

    seconds_be: [u8; 4],
    millis_be: [u8; 8],
    ntp_be: [u8; 8],
}

impl Packet {
    pub fn from_ethernet(frame: Vec<u8>, timestamp: Duration) -> Result<Self> {
        if frame.len() < ETH_HEADER_SIZE {
            return Err(Error::ParsePacketFailed("packet truncated".into()));
        }
        let eth_type = read_u16_be(&frame[FIELD_OFFSET_ETH_TYPE..]);
        if eth_type != EtherTypes::Ipv4.0 {
            return Err(Error::ParsePacketFailed(format!(
                "ethernet type {:#06x} is not ipv4",
                eth_type
            )));
        }
        Self::parse(frame, ETH_HEADER_SIZE, timestamp)
    }

    pub fn from_ipv4(data: Vec<u8>, timestamp: Duration) -> Result<Self> {
        Self::parse(data, 0, timestamp)
    }

    fn parse(data: Vec<u8>, ip_offset: usize, timestamp: Duration) -> Result<Self> {
        let mut size_checker = data.len() as isize - (ip_offset + IPV4_HEADER_SIZE) as isize;
        if size_checker < 0 {
            return Err(Error::ParsePacketFailed("packet truncated".into()));
        }
        let ip = &data[ip_offset..];
        if ip[0] >> 4 != 4 {
            return Err(Error::ParsePacketFailed(format!(
                "ip version {} is not 4",
                ip[0] >> 4
            )));
        }
        let ihl = ((ip[0] & 0xf) as usize) * 4;
        size_checker -= (ihl as isize - IPV4_HEADER_SIZE as isize).max(0);
        if ihl < IPV4_HEADER_SIZE || size_checker < 0 {
            return Err(Error::ParsePacketFailed("invalid ip header length".into()));
        }
        let total_len = read_u16_be(&ip[FIELD_OFFSET_TOTAL_LEN..]) as usize;
        let ip_end = (ip_offset + total_len.max(ihl)).min(data.len());
        let protocol = IpNextHeaderProtocol::new(ip[FIELD_OFFSET_PROTOCOL]);
        let fragment_offset = read_u16_be(&ip[6..]) & 0x1fff;

        let transport_offset = ip_offset + ihl;
        let (class, header_size) = match protocol {
            _ if fragment_offset != 0 => (ProtocolClasses::OTHER, 0),
            IpNextHeaderProtocols::Tcp => (ProtocolClasses::TCP, TCP_HEADER_SIZE),
            IpNextHeaderProtocols::Udp => (ProtocolClasses::UDP, UDP_HEADER_SIZE),
            IpNextHeaderProtocols::Icmp => (ProtocolClasses::ICMP, ICMP_HEADER_SIZE),
            _ => (ProtocolClasses::OTHER, 0),
        };
        let (transport, payload_offset) = if header_size == 0 {
            (None, transport_offset)
        } else {
            if ip_end < transport_offset + header_size {
                return Err(Error::ParsePacketFailed(format!(
                    "{:?} header truncated",
                    protocol
                )));
            }
            let header_size = if class == ProtocolClasses::TCP {
                ((data[transport_offset + 12] >> 4) as usize * 4).max(TCP_HEADER_SIZE)
            } else {
                header_size
            };
            (
                Some(transport_offset),
                (transport_offset + header_size).min(ip_end),
            )
        };

        let secs = timestamp.as_secs();
        let millis = timestamp.as_millis() as u64;
        let ntp = duration_to_ntp(timestamp);

        Ok(Self {
            data,
            ip_offset,
            ip_end,
            transport_offset: transport,
            payload_offset,
            protocol,
            class,
            timestamp,
            observation_domain_id: 0,
            seconds_be: (secs as u32).to_be_bytes(),
            millis_be: millis.to_be_bytes(),
            ntp_be: ntp.to_be_bytes(),
        })
    }

    pub fn layer2(&self) -> Option<&[u8]> {
        if self.ip_offset >= ETH_HEADER_SIZE {
            Some(&self.data[..self.ip_offset])
        } else {
            None
        }
    }

    pub fn ip_header(&self) -> &[u8] {
        &self.data[self.ip_offset..self.ip_end]
    }

    pub fn transport_header(&self) -> Option<&[u8]> {
        self.transport_offset
            .map(|offset| &self.data[offset..self.payload_offset])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..self.ip_end]
    }

    pub fn protocol(&self) -> IpNextHeaderProtocol {
        self.protocol
    }

    pub fn class(&self) -> ProtocolClasses {
        self.class
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn ip_total_length(&self) -> u16 {
        read_u16_be(&self.ip_header()[FIELD_OFFSET_TOTAL_LEN..])
    }

    pub fn tcp_seq(&self) -> Option<u32> {
        if self.class != ProtocolClasses::TCP {
            return None;
        }
        self.transport_header()
            .map(|h| read_u32_be(&h[FIELD_OFFSET_TCP_SEQ..]))
    }

    pub fn tcp_flags(&self) -> u8 {
        match self.transport_header() {
            Some(h) if self.class == ProtocolClasses::TCP => h[FIELD_OFFSET_TCP_FLAGS],
            _ => 0,
        }
    }

    /// Capture time, seconds since the epoch, network order.
    pub fn seconds_be(&self) -> &[u8; 4] {
        &self.seconds_be
    }

    /// Capture time, milliseconds since the epoch, network order.
    pub fn millis_be(&self) -> &[u8; 8] {
        &self.millis_be
    }

    /// Capture time in NTP timestamp format, network order.
    pub fn ntp_be(&self) -> &[u8; 8] {
        &self.ntp_be
    }
}

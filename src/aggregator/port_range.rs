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

use public::bytes::read_u16_be;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortRange(u32);

impl PortRange {
    pub const ZERO: PortRange = PortRange(0);

    pub fn new(min: u16, max: u16) -> PortRange {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        PortRange((min as u32) << 16 | max as u32)
    }

    pub fn single(port: u16) -> PortRange {
        PortRange::new(port, port)
    }

    pub fn min(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn max(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min() <= port && port <= self.max()
    }

    pub fn contains_range(&self, other: &PortRange) -> bool {
        self.min() <= other.min() && other.max() <= self.max()
    }

    /// Encoding used in records and patterns: start and end, both big-endian.
    pub fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bs: &[u8]) -> PortRange {
        PortRange::new(read_u16_be(bs), read_u16_be(&bs[2..]))
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min() == self.max() {
            write!(f, "{}", self.min())
        } else {
            write!(f, "{}:{}", self.min(), self.max())
        }
    }
}

impl TryFrom<&str> for PortRange {
    type Error = String;

    fn try_from(f: &str) -> Result<Self, Self::Error> {
        let ports: Vec<&str> = f.trim().split(|c| c == ':' || c == '-').collect();
        if ports.len() > 2 {
            return Err(format!("invalid port range {}", f));
        }
        let mut parsed = ports.iter().map(|p| p.trim().parse::<u16>());
        let min = parsed.next().and_then(|p| p.ok());
        let max = match parsed.next() {
            Some(p) => p.ok(),
            None => min,
        };
        match (min, max) {
            (Some(min), Some(max)) => Ok(PortRange::new(min, max)),
            _ => Err(format!("invalid port {}", f)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortRangeList(Vec<PortRange>);

impl PortRangeList {
    pub fn element(&self) -> &Vec<PortRange> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|r| r.contains(port))
    }

    /// Every range of `other` lies within some range of this list.
    pub fn covers(&self, other: &[PortRange]) -> bool {
        other
            .iter()
            .all(|o| self.0.iter().any(|r| r.contains_range(o)))
    }

    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|r| r.to_be_bytes()).collect()
    }

    pub fn from_be_bytes(bs: &[u8]) -> PortRangeList {
        PortRangeList(bs.chunks_exact(4).map(PortRange::from_be_bytes).collect())
    }
}

impl From<Vec<PortRange>> for PortRangeList {
    fn from(v: Vec<PortRange>) -> Self {
        PortRangeList(v)
    }
}

impl fmt::Display for PortRangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for PortRangeList {
    type Error = String;

    fn try_from(f: &str) -> Result<Self, Self::Error> {
        let mut list = vec![];
        for item in f.split(',') {
            if item.trim().is_empty() {
                continue;
            }
            list.push(PortRange::try_from(item)?);
        }
        if list.is_empty() {
            return Err(format!("empty port list {:?}", f));
        }
        Ok(PortRangeList(list))
    }
}

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

use thiserror::Error;

use super::information_element::InformationElement;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown information element {0}")]
    UnknownInformationElement(String),
    #[error("invalid pattern {pattern:?} for {ie}: {reason}")]
    InvalidPattern {
        ie: InformationElement,
        pattern: String,
        reason: String,
    },
    #[error("field {0} cannot carry a match pattern")]
    PatternNotSupported(InformationElement),
    #[error("invalid modifier {modifier:?} for {ie}")]
    InvalidModifier {
        ie: InformationElement,
        modifier: String,
    },
    #[error("front payload length {0} is shorter than 5 bytes")]
    FrontPayloadTooShort(u16),
    #[error("template {0} has no usable fields")]
    NoUsableFields(u16),
    #[error("{0} requires frontPayload in the same rule")]
    MissingFrontPayload(InformationElement),
    #[error("biflow aggregation of template {template_id} requires {ie}")]
    BiflowMissingField {
        template_id: u16,
        ie: InformationElement,
    },
    #[error("biflow aggregation: {forward} and {reverse} differ in length")]
    ReverseLengthMismatch {
        forward: InformationElement,
        reverse: InformationElement,
    },
    #[error("field {ie} cannot be widened from {from} to {to} bytes")]
    UnsupportedLength {
        ie: InformationElement,
        from: u16,
        to: u16,
    },
    #[error("field {0} is not available in raw packets")]
    UnavailableInPacket(InformationElement),
    #[error("rule {0} matches no protocol")]
    NoValidProtocol(u16),
    #[error("duplicated template id {0}")]
    DuplicatedTemplateId(u16),
    #[error("reconfiguration phase {phase} called out of order")]
    ReconfigurationOrder { phase: &'static str },
    #[error("aggregator is {0:?}")]
    InvalidState(super::aggregator::State),
    #[error("parse packet failed: {0}")]
    ParsePacketFailed(String),
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

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

//! Layout of the records an aggregation rule produces.
//!
//! A bucket buffer consists of the variable fields (`field_length` bytes, in
//! rule order) followed by `private_length` bytes of per-bucket scratch data
//! that is never exported. Fields with a match pattern are not stored per
//! bucket, their pattern is exported once as fixed template data.

use std::sync::atomic::{AtomicBool, Ordering};

use super::error::{Error, Result};
use super::information_element::{ids, InformationElement, PEN_PRIVATE};
use super::record::TemplateKind;
use super::rule::{Modifier, Rule};

// seq, byte count and initialized flag, all u32 in native order
pub const PAYLOAD_PRIVATE_LENGTH: usize = 12;
pub const PAYLOAD_PRIVATE_BYTE_COUNT: usize = 4;
pub const PAYLOAD_PRIVATE_INITIALIZED: usize = 8;
// millisecond timestamp of the previous packet
pub const GAP_PRIVATE_LENGTH: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub ie: InformationElement,
    pub offset: usize,
    // absolute offset of the scratch data inside the bucket buffer
    pub private_offset: Option<usize>,
}

impl FieldInfo {
    pub fn len(&self) -> usize {
        self.ie.length as usize
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// Scratch bytes owned by a field, zero for fields that own none.
pub(super) fn private_length(ie: &InformationElement) -> usize {
    let fwd = ie.forward();
    if fwd.enterprise != PEN_PRIVATE {
        return 0;
    }
    match fwd.id {
        ids::FRONT_PAYLOAD => PAYLOAD_PRIVATE_LENGTH,
        ids::TRANSPORT_OCTET_DELTA_COUNT if !ie.is_reverse() => PAYLOAD_PRIVATE_LENGTH,
        ids::MAX_PACKET_GAP => GAP_PRIVATE_LENGTH,
        _ => 0,
    }
}

#[derive(Debug)]
pub struct TemplateLayout {
    pub template_id: u16,
    pub preceding: u16,
    pub kind: TemplateKind,
    pub fields: Vec<FieldInfo>,
    pub modifiers: Vec<Modifier>,
    pub data_fields: Vec<FieldInfo>,
    pub data: Vec<u8>,
    pub field_length: usize,
    pub private_length: usize,
    destroyed: AtomicBool,
}

impl TemplateLayout {
    pub fn new(rule: &Rule) -> Result<Self> {
        let mut kind = if rule.preceding != 0 {
            TemplateKind::DataTemplate
        } else {
            TemplateKind::Template
        };
        let mut fields = vec![];
        let mut modifiers = vec![];
        let mut data_fields = vec![];
        let mut data = vec![];
        let mut field_length = 0;

        for rf in rule.fields.iter() {
            if let Some(pattern) = rf.pattern.as_ref() {
                kind = TemplateKind::DataTemplate;
                let value = pattern.to_be_bytes();
                data_fields.push(FieldInfo {
                    ie: rf.ie.with_length(value.len() as u16),
                    offset: data.len(),
                    private_offset: None,
                });
                data.extend_from_slice(&value);
            } else if rf.modifier != Modifier::Discard {
                fields.push(FieldInfo {
                    ie: rf.ie,
                    offset: field_length,
                    private_offset: None,
                });
                modifiers.push(rf.modifier);
                field_length += rf.ie.length as usize;
            }
        }
        if fields.is_empty() && data_fields.is_empty() {
            return Err(Error::NoUsableFields(rule.id));
        }

        let mut private = 0;
        for f in fields.iter_mut() {
            let len = private_length(&f.ie);
            if len > 0 {
                f.private_offset = Some(field_length + private);
                private += len;
            }
        }

        // payload length and packet count refer to the scratch data of the payload
        // field of the same direction
        let payload_private = |fields: &[FieldInfo], reverse: bool| {
            fields
                .iter()
                .find(|f| f.ie.forward().is_private(ids::FRONT_PAYLOAD) && f.ie.is_reverse() == reverse)
                .and_then(|f| f.private_offset)
        };
        for i in 0..fields.len() {
            let ie = fields[i].ie;
            let fwd = ie.forward();
            if fwd.is_private(ids::FRONT_PAYLOAD_LEN) || fwd.is_private(ids::FRONT_PAYLOAD_PKT_COUNT) {
                match payload_private(&fields, ie.is_reverse()) {
                    Some(offset) => fields[i].private_offset = Some(offset),
                    None => return Err(Error::MissingFrontPayload(ie)),
                }
            }
        }

        Ok(Self {
            template_id: rule.id,
            preceding: rule.preceding,
            kind,
            fields,
            modifiers,
            data_fields,
            data,
            field_length,
            private_length: private,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Size of a bucket buffer.
    pub fn bucket_length(&self) -> usize {
        self.field_length + self.private_length
    }

    pub fn field_index(&self, ie: &InformationElement) -> Option<usize> {
        self.fields.iter().position(|f| f.ie.same_type(ie))
    }

    pub fn field(&self, ie: &InformationElement) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.ie.same_type(ie))
    }

    pub fn data_field(&self, ie: &InformationElement) -> Option<&FieldInfo> {
        self.data_fields.iter().find(|f| f.ie.same_type(ie))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(super) fn set_destroyed(&self, destroyed: bool) {
        self.destroyed.store(destroyed, Ordering::Release)
    }
}

impl PartialEq for TemplateLayout {
    fn eq(&self, other: &Self) -> bool {
        self.template_id == other.template_id
            && self.preceding == other.preceding
            && self.kind == other.kind
            && self.fields == other.fields
            && self.modifiers == other.modifiers
            && self.data_fields == other.data_fields
            && self.data == other.data
            && self.field_length == other.field_length
            && self.private_length == other.private_length
    }
}

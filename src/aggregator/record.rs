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

//! Decoded flow records as handed over by a collector.

use std::sync::Arc;

use super::information_element::InformationElement;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateKind {
    Template,
    // template whose trailing fields carry fixed values shared by every record
    DataTemplate,
    NetflowTemplate,
    OptionsTemplate,
}

impl TemplateKind {
    pub fn carries_flows(&self) -> bool {
        !matches!(self, TemplateKind::OptionsTemplate)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordField {
    pub ie: InformationElement,
    pub offset: usize,
}

impl RecordField {
    pub fn len(&self) -> usize {
        self.ie.length as usize
    }

    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.offset + self.len()]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordTemplate {
    pub id: u16,
    pub kind: TemplateKind,
    pub fields: Vec<RecordField>,
    pub data_fields: Vec<RecordField>,
    pub data: Vec<u8>,
}

impl RecordTemplate {
    pub fn new(id: u16, kind: TemplateKind) -> Self {
        Self {
            id,
            kind,
            fields: vec![],
            data_fields: vec![],
            data: vec![],
        }
    }

    /// Appends a variable field at the end of the record.
    pub fn field(mut self, ie: InformationElement) -> Self {
        let offset = self.record_length();
        self.fields.push(RecordField { ie, offset });
        self
    }

    /// Appends a fixed value; turns the template into a data template.
    pub fn fixed(mut self, ie: InformationElement, value: &[u8]) -> Self {
        assert_eq!(ie.length as usize, value.len());
        self.data_fields.push(RecordField {
            ie,
            offset: self.data.len(),
        });
        self.data.extend_from_slice(value);
        if self.kind == TemplateKind::Template {
            self.kind = TemplateKind::DataTemplate;
        }
        self
    }

    pub fn record_length(&self) -> usize {
        self.fields.last().map(|f| f.offset + f.len()).unwrap_or(0)
    }

    pub fn find_field(&self, ie: &InformationElement) -> Option<&RecordField> {
        self.fields.iter().find(|f| f.ie.same_type(ie))
    }

    pub fn find_data_field(&self, ie: &InformationElement) -> Option<&RecordField> {
        self.data_fields.iter().find(|f| f.ie.same_type(ie))
    }
}

#[derive(Clone, Debug)]
pub struct DataRecord {
    pub template: Arc<RecordTemplate>,
    pub observation_domain_id: u32,
    pub data: Vec<u8>,
}

impl DataRecord {
    pub fn new(template: Arc<RecordTemplate>, data: Vec<u8>) -> Self {
        Self {
            template,
            observation_domain_id: 0,
            data,
        }
    }

    pub fn zeroed(template: Arc<RecordTemplate>) -> Self {
        let data = vec![0; template.record_length()];
        Self::new(template, data)
    }

    pub fn kind(&self) -> TemplateKind {
        self.template.kind
    }

    /// Value of a variable field, falling back to the template's fixed data.
    pub fn get(&self, ie: &InformationElement) -> Option<&[u8]> {
        if let Some(f) = self.template.find_field(ie) {
            return Some(f.slice(&self.data));
        }
        self.template
            .find_data_field(ie)
            .map(|f| f.slice(&self.template.data))
    }

    /// Overwrites a variable field. Returns false if the template lacks it.
    pub fn set(&mut self, ie: &InformationElement, value: &[u8]) -> bool {
        match self.template.find_field(ie) {
            Some(f) if f.len() == value.len() => {
                self.data[f.offset..f.offset + f.len()].copy_from_slice(value);
                true
            }
            _ => false,
        }
    }

    /// Stores `v` big-endian, truncated to the field length.
    pub fn set_uint(&mut self, ie: &InformationElement, v: u64) -> bool {
        let Some(f) = self.template.find_field(ie).copied() else {
            return false;
        };
        let len = f.len().min(8);
        let bytes = v.to_be_bytes();
        let field = &mut self.data[f.offset..f.offset + f.len()];
        field.fill(0);
        let flen = field.len();
        field[flen - len..].copy_from_slice(&bytes[8 - len..]);
        true
    }
}

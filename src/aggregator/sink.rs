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

use log::warn;
use parking_lot::Mutex;

use super::information_element::InformationElement;
use super::template::TemplateLayout;

#[derive(Clone, Debug)]
pub enum ExportEvent {
    TemplateAnnounce(Arc<TemplateLayout>),
    TemplateWithdraw(Arc<TemplateLayout>),
    AggregateRecordReady(AggregateRecord),
}

/// An expired aggregate, laid out as described by `layout` (private scratch data
/// already stripped).
#[derive(Clone, Debug)]
pub struct AggregateRecord {
    pub layout: Arc<TemplateLayout>,
    pub observation_domain_id: u32,
    pub data: Vec<u8>,
}

impl AggregateRecord {
    pub fn template_id(&self) -> u16 {
        self.layout.template_id
    }

    /// Value of a field, either per record or fixed by the template.
    pub fn get(&self, ie: &InformationElement) -> Option<&[u8]> {
        if let Some(f) = self.layout.field(ie) {
            return Some(&self.data[f.range()]);
        }
        self.layout.data_field(ie).map(|f| &self.layout.data[f.range()])
    }

    /// Big-endian unsigned value of a field up to 8 bytes long.
    pub fn get_uint(&self, ie: &InformationElement) -> Option<u64> {
        self.get(ie)
            .filter(|v| v.len() <= 8)
            .map(|v| v.iter().fold(0u64, |acc, b| acc << 8 | *b as u64))
    }
}

/// Downstream consumer of templates and aggregated records.
pub trait RecordSink: Send + Sync {
    fn send(&self, event: ExportEvent);
}

impl RecordSink for mpsc::Sender<ExportEvent> {
    fn send(&self, event: ExportEvent) {
        if let Err(e) = mpsc::Sender::send(self, event) {
            warn!("record receiver disconnected, dropping {:?}", kind(&e.0));
        }
    }
}

impl RecordSink for mpsc::SyncSender<ExportEvent> {
    fn send(&self, event: ExportEvent) {
        if let Err(e) = mpsc::SyncSender::send(self, event) {
            warn!("record receiver disconnected, dropping {:?}", kind(&e.0));
        }
    }
}

/// Collects every event in memory, shared as `Arc<Mutex<Vec<ExportEvent>>>`.
impl RecordSink for Mutex<Vec<ExportEvent>> {
    fn send(&self, event: ExportEvent) {
        self.lock().push(event);
    }
}

fn kind(event: &ExportEvent) -> &'static str {
    match event {
        ExportEvent::TemplateAnnounce(_) => "template announcement",
        ExportEvent::TemplateWithdraw(_) => "template withdrawal",
        ExportEvent::AggregateRecordReady(_) => "aggregate record",
    }
}

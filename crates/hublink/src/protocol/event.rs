// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hublink contributors

//! Event codec: the JSON document broadcast on the multicast bus.
//!
//! One event is one UDP datagram carrying a single JSON object with at
//! minimum:
//!
//! ```json
//! { "eventId": 17, "eventCode": 15001, "eventValue": 2, "eventTime": 1735689600123 }
//! ```
//!
//! Producers append arbitrary additional fields as the event payload;
//! consumers must tolerate fields they do not know about. Unknown
//! fields are preserved verbatim in [`Event::payload`] so a consumer
//! can re-serialize an event without losing them.
//!
//! Events are fire-and-forget: broadcast once, never persisted. The
//! host-wide [`crate::sequencer`] assigns `eventId` so consumers can
//! detect gaps or reordering after the fact.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use super::CodecError;

/// Event codes at or above this value encode their owning service id
/// in the thousands digit(s): code 15001 belongs to service 15.
const SERVICE_CODE_BASE: i32 = 1000;

/// Derive the producing service id from an event code.
///
/// Services allocate event codes in blocks of [`SERVICE_CODE_BASE`];
/// codes below the base are themselves service ids (bare announcement
/// events).
pub fn service_id_from_event_code(event_code: i32) -> i32 {
    if event_code >= SERVICE_CODE_BASE {
        event_code / SERVICE_CODE_BASE
    } else {
        event_code
    }
}

/// A broadcast state-change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Host-wide unique, monotonically increasing id. `0` means "not
    /// yet assigned"; the producer stamps it at broadcast time.
    #[serde(rename = "eventId", default)]
    pub event_id: u64,

    /// Identifies the producing service and the payload schema.
    #[serde(rename = "eventCode")]
    pub event_code: i32,

    /// Sub-classification within the event code.
    #[serde(rename = "eventValue", default)]
    pub event_value: i32,

    /// Unix milliseconds at the moment of the state change.
    #[serde(rename = "eventTime", default)]
    pub event_time: u64,

    /// Producing service id. Absent in events from older peers; use
    /// [`Event::owning_service_id`] which falls back to the code-derived
    /// id.
    #[serde(rename = "serviceId", default, skip_serializing_if = "service_id_absent")]
    pub service_id: i32,

    /// All additional JSON fields (the event payload).
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

fn service_id_absent(id: &i32) -> bool {
    *id == 0
}

impl Event {
    /// New event stamped with the current wall-clock time. `eventId`
    /// stays 0 until the producer assigns one.
    pub fn new(event_code: i32, event_value: i32) -> Self {
        Self {
            event_id: 0,
            event_code,
            event_value,
            event_time: now_millis(),
            service_id: service_id_from_event_code(event_code),
            payload: Map::new(),
        }
    }

    /// Attach one payload field, builder style.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Producing service id: the explicit `serviceId` field when
    /// present, otherwise derived from the event code.
    pub fn owning_service_id(&self) -> i32 {
        if self.service_id != 0 {
            self.service_id
        } else {
            service_id_from_event_code(self.event_code)
        }
    }

    /// Serialize to the wire JSON document.
    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Decode an event from its wire JSON document.
    pub fn from_json(raw: &str) -> Result<Self, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

/// Current wall clock as Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

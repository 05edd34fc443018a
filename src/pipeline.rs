//! Scan pipeline: filter, decode, build and deliver.
//!
//! Advertisements are handled one at a time, in arrival order. Every failure
//! past the filter is logged and swallowed so a bad packet or a flaky
//! endpoint never stops the gateway.

use crate::credential::Credential;
use crate::event::{EventBuilder, EventKind};
use crate::ingress::IngressApi;
use crate::record::SensorRecord;
use crate::scanner::{Advertisements, RawAdvertisement, uuid_from_u16};
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Local name advertised by HumiTemp tags.
pub const HUMITEMP_NAME: &str = "HumiTemp Sensor Tag";

/// 16-bit service id advertised by HumiTemp tags.
pub const HUMITEMP_SERVICE: u16 = 0xAA20;

/// HTTP status the events endpoint answers with on success.
const EVENT_OK: u16 = 200;

/// Identifies advertisements from the sensor class this gateway understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePattern {
    pub name: String,
    pub services: BTreeSet<Uuid>,
}

impl Default for DevicePattern {
    fn default() -> Self {
        Self {
            name: HUMITEMP_NAME.to_string(),
            services: BTreeSet::from([uuid_from_u16(HUMITEMP_SERVICE)]),
        }
    }
}

impl DevicePattern {
    /// Exact name and exact service set match.
    pub fn matches(&self, advertisement: &RawAdvertisement) -> bool {
        advertisement.local_name.as_deref() == Some(self.name.as_str())
            && advertisement.services == self.services
    }
}

/// What happened to a single advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not from a HumiTemp tag, or no manufacturer data.
    Skipped,
    /// Payload did not match the record layout.
    Undecodable,
    /// Events were built and sent. `failed` counts build errors, transport
    /// errors and non-200 answers.
    Processed { delivered: usize, failed: usize },
}

/// Drives advertisements through decode, build and delivery.
pub struct Pipeline<'a> {
    pattern: DevicePattern,
    builder: EventBuilder,
    ingress: &'a dyn IngressApi,
    credential: Credential,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        pattern: DevicePattern,
        builder: EventBuilder,
        ingress: &'a dyn IngressApi,
        credential: Credential,
    ) -> Self {
        Self {
            pattern,
            builder,
            ingress,
            credential,
        }
    }

    /// Handle every advertisement until the scanner closes the channel.
    pub async fn run(&self, advertisements: &mut Advertisements) {
        while let Some(advertisement) = advertisements.recv().await {
            self.handle(&advertisement).await;
        }
        info!("advertisement stream closed");
    }

    /// Handle one advertisement to completion.
    pub async fn handle(&self, advertisement: &RawAdvertisement) -> Outcome {
        if advertisement.manufacturer_data.is_empty() || !self.pattern.matches(advertisement) {
            return Outcome::Skipped;
        }

        let record = match SensorRecord::decode(&advertisement.manufacturer_data) {
            Ok(record) => record,
            Err(e) => {
                warn!(address = %advertisement.address, error = %e, "undecodable advertisement");
                return Outcome::Undecodable;
            }
        };
        debug!(address = %advertisement.address, ?record, "decoded record");

        let mut delivered = 0;
        let mut failed = 0;
        for kind in EventKind::ALL {
            if self.deliver(&record, kind, advertisement.rssi).await {
                delivered += 1;
            } else {
                failed += 1;
            }
        }

        Outcome::Processed { delivered, failed }
    }

    /// Build and post one event. Returns true on a 200 answer.
    async fn deliver(&self, record: &SensorRecord, kind: EventKind, rssi: i16) -> bool {
        let event = match self.builder.build(record, kind, rssi) {
            Ok(event) => event,
            Err(e) => {
                warn!(%kind, error = %e, "unable to build event");
                return false;
            }
        };

        let start = Instant::now();
        let result = self.ingress.post_event(&self.credential, &event).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(EVENT_OK) => {
                info!(
                    %kind,
                    node_id = %event.node_id,
                    value = event.sensor_value,
                    units = %event.units,
                    status = EVENT_OK,
                    elapsed_ms,
                    "event delivered"
                );
                true
            }
            Ok(status) => {
                warn!(
                    %kind,
                    node_id = %event.node_id,
                    value = event.sensor_value,
                    status,
                    elapsed_ms,
                    "event rejected"
                );
                false
            }
            Err(e) => {
                warn!(
                    %kind,
                    node_id = %event.node_id,
                    error = %e,
                    elapsed_ms,
                    "event delivery failed"
                );
                false
            }
        }
    }
}

use crate::credential::Credential;
use crate::event::Event;
use crate::ingress::{DeliveryError, IngressApi, IngressFuture, RegistrationReply};
use crate::pipeline::DevicePattern;
use crate::record::SensorRecord;
use crate::scanner::RawAdvertisement;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Address carried in [`sample_payload`].
pub const TEST_ADDRESS: [u8; 6] = [0x00, 0x1A, 0x2B, 0xFF, 0x00, 0x11];

/// A valid record: 23.5 C, 45.2 % RH, update rate 10.
pub fn sample_payload() -> Vec<u8> {
    let mut payload = vec![
        0x00, 23, 5, // Temperature: +23.5
        0x00, 45, 2, // Humidity: +45.2
        10, // Update rate
    ];
    payload.extend_from_slice(&TEST_ADDRESS);
    payload
}

pub fn sample_record() -> SensorRecord {
    SensorRecord::decode(&sample_payload()).unwrap()
}

/// An advertisement that matches the default device pattern.
pub fn matching_advertisement(payload: Vec<u8>) -> RawAdvertisement {
    let pattern = DevicePattern::default();
    RawAdvertisement {
        address: TEST_ADDRESS.into(),
        rssi: -64,
        local_name: Some(pattern.name),
        services: pattern.services,
        manufacturer_data: payload,
    }
}

/// Ingress double that records every request and answers from a script.
#[derive(Debug, Default)]
pub struct FakeIngress {
    pub registrations: Mutex<Vec<String>>,
    pub events: Mutex<Vec<(String, Event)>>,
    registration_replies: Mutex<VecDeque<Result<RegistrationReply, DeliveryError>>>,
    event_replies: Mutex<VecDeque<Result<u16, DeliveryError>>>,
}

impl FakeIngress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registration(self, reply: Result<RegistrationReply, DeliveryError>) -> Self {
        self.registration_replies.lock().unwrap().push_back(reply);
        self
    }

    /// Queue event replies; once exhausted every event gets a 200.
    pub fn with_event_replies(self, replies: Vec<Result<u16, DeliveryError>>) -> Self {
        self.event_replies.lock().unwrap().extend(replies);
        self
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }
}

impl IngressApi for FakeIngress {
    fn register<'a>(
        &'a self,
        api_key: &'a str,
    ) -> IngressFuture<'a, Result<RegistrationReply, DeliveryError>> {
        self.registrations.lock().unwrap().push(api_key.to_string());
        let reply = self
            .registration_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(RegistrationReply {
                status: 200,
                token: Some("test-token".to_string()),
            }));
        Box::pin(async move { reply })
    }

    fn post_event<'a>(
        &'a self,
        credential: &'a Credential,
        event: &'a Event,
    ) -> IngressFuture<'a, Result<u16, DeliveryError>> {
        self.events
            .lock()
            .unwrap()
            .push((credential.as_str().to_string(), event.clone()));
        let reply = self.event_replies.lock().unwrap().pop_front().unwrap_or(Ok(200));
        Box::pin(async move { reply })
    }
}

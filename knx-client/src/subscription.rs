//! Subscriptions to group values
//!
//! A subscription is a set of group address tags, each with its own
//! datapoint type and [`SubscriptionMode`], and one callback. Every cache
//! update is offered to every registered subscription; the tags whose
//! pattern matches the updated address and whose mode accepts the update are
//! decoded and delivered together in one [`SubscriptionEvent`].

use crate::payload::decode_group_payload;
use knx_core::{DatapointCodec, DatapointType, GroupAddress, GroupAddressTag, PlcValue, ResponseCode};
use log::{trace, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// When a subscribed tag is notified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionMode {
    /// Every received value, including repeats
    #[default]
    EveryUpdate,
    /// Only values that differ from the cached one
    ChangeOfState,
}

/// One tag of a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionTag {
    pub name: String,
    pub tag: GroupAddressTag,
    pub datapoint_type: DatapointType,
    pub mode: SubscriptionMode,
}

impl SubscriptionTag {
    pub fn new(name: impl Into<String>, tag: GroupAddressTag, datapoint_type: DatapointType, mode: SubscriptionMode) -> Self {
        Self {
            name: name.into(),
            tag,
            datapoint_type,
            mode,
        }
    }

    fn accepts(&self, address: GroupAddress, changed: bool) -> bool {
        self.tag.pattern.matches(address) && (changed || self.mode == SubscriptionMode::EveryUpdate)
    }
}

/// Decoded value of one tag within an event
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribedValue {
    pub name: String,
    pub code: ResponseCode,
    pub value: Option<PlcValue>,
}

/// Snapshot delivered to a subscription callback
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub address: GroupAddress,
    pub payload: Vec<u8>,
    pub values: Vec<SubscribedValue>,
}

impl SubscriptionEvent {
    pub fn value(&self, name: &str) -> Option<&SubscribedValue> {
        self.values.iter().find(|v| v.name == name)
    }
}

pub type SubscriptionCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Identifies a registered subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription #{}", self.0)
    }
}

struct Subscription {
    tags: Vec<SubscriptionTag>,
    callback: SubscriptionCallback,
}

/// Registered subscriptions of a connection
pub struct SubscriptionDispatcher {
    codec: Arc<dyn DatapointCodec>,
    subscriptions: Mutex<BTreeMap<SubscriptionHandle, Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriptionDispatcher {
    pub fn new(codec: Arc<dyn DatapointCodec>) -> Self {
        Self {
            codec,
            subscriptions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SubscriptionHandle, Arc<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, tags: Vec<SubscriptionTag>, callback: SubscriptionCallback) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!("Registering {} with {} tags", handle, tags.len());
        self.lock().insert(handle, Arc::new(Subscription { tags, callback }));
        handle
    }

    /// Returns whether `handle` was registered
    pub fn unregister(&self, handle: SubscriptionHandle) -> bool {
        self.lock().remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver one cache update to every interested subscription
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe themselves.
    pub fn notify(&self, address: GroupAddress, payload: &[u8], changed: bool) {
        let subscriptions: Vec<Arc<Subscription>> = self.lock().values().cloned().collect();
        for subscription in subscriptions {
            let values: Vec<SubscribedValue> = subscription
                .tags
                .iter()
                .filter(|tag| tag.accepts(address, changed))
                .map(|tag| self.decode(tag, payload))
                .collect();
            if values.is_empty() {
                continue;
            }
            (subscription.callback)(SubscriptionEvent {
                address,
                payload: payload.to_vec(),
                values,
            });
        }
    }

    fn decode(&self, tag: &SubscriptionTag, payload: &[u8]) -> SubscribedValue {
        match decode_group_payload(self.codec.as_ref(), payload, tag.datapoint_type, tag.tag.quantity) {
            Ok(value) => SubscribedValue {
                name: tag.name.clone(),
                code: ResponseCode::Ok,
                value: Some(value),
            },
            Err(e) => {
                warn!("Decoding {} as {} failed: {}", tag.name, tag.datapoint_type, e);
                SubscribedValue {
                    name: tag.name.clone(),
                    code: e.response_code(),
                    value: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KnxError;
    use knx_core::{GroupAddressLevels, GroupAddressPattern, KnxResult, StandardDatapointCodec};
    use mockall::mock;

    mock! {
        Codec {}
        impl DatapointCodec for Codec {
            fn parse(&self, data: &[u8], datapoint_type: DatapointType) -> KnxResult<PlcValue>;
            fn serialize(&self, value: &PlcValue, datapoint_type: DatapointType) -> KnxResult<Vec<u8>>;
        }
    }

    fn tag(pattern: &str, datapoint_type: DatapointType, mode: SubscriptionMode) -> SubscriptionTag {
        SubscriptionTag::new(
            pattern,
            GroupAddressTag {
                pattern: GroupAddressPattern::parse(pattern, GroupAddressLevels::Three).unwrap(),
                datapoint_type: Some(datapoint_type),
                quantity: 1,
            },
            datapoint_type,
            mode,
        )
    }

    fn collector() -> (Arc<Mutex<Vec<SubscriptionEvent>>>, SubscriptionCallback) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        (events, Arc::new(move |event: SubscriptionEvent| sink.lock().unwrap().push(event)))
    }

    fn address(s: &str) -> GroupAddress {
        GroupAddress::parse(s, GroupAddressLevels::Three).unwrap()
    }

    #[test]
    fn test_modes_fan_out() {
        let dispatcher = SubscriptionDispatcher::new(Arc::new(StandardDatapointCodec));
        let (every, every_callback) = collector();
        let (changes, changes_callback) = collector();
        dispatcher.register(vec![tag("1/2/3", DatapointType::Bool, SubscriptionMode::EveryUpdate)], every_callback);
        dispatcher.register(
            vec![tag("1/2/3", DatapointType::Bool, SubscriptionMode::ChangeOfState)],
            changes_callback,
        );

        dispatcher.notify(address("1/2/3"), &[0x01], true);
        dispatcher.notify(address("1/2/3"), &[0x01], false);

        assert_eq!(every.lock().unwrap().len(), 2);
        assert_eq!(changes.lock().unwrap().len(), 1);
        let event = changes.lock().unwrap()[0].clone();
        assert_eq!(event.value("1/2/3").unwrap().value, Some(PlcValue::Bool(true)));
    }

    #[test]
    fn test_pattern_filters_addresses() {
        let dispatcher = SubscriptionDispatcher::new(Arc::new(StandardDatapointCodec));
        let (events, callback) = collector();
        dispatcher.register(vec![tag("1/[1-2]/*", DatapointType::Usint, SubscriptionMode::EveryUpdate)], callback);

        dispatcher.notify(address("1/2/200"), &[0x00, 0x10], true);
        dispatcher.notify(address("1/3/200"), &[0x00, 0x10], true);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].values[0].value, Some(PlcValue::Usint(0x10)));
    }

    #[test]
    fn test_decode_failure_is_isolated() {
        let mut codec = MockCodec::new();
        codec
            .expect_parse()
            .withf(|_, datapoint_type| *datapoint_type == DatapointType::Uint)
            .returning(|_, _| Err(KnxError::InvalidData("broken".into())));
        codec
            .expect_parse()
            .withf(|_, datapoint_type| *datapoint_type == DatapointType::Usint)
            .returning(|data, _| Ok(PlcValue::Usint(data[0])));

        let dispatcher = SubscriptionDispatcher::new(Arc::new(codec));
        let (first, first_callback) = collector();
        let (second, second_callback) = collector();
        dispatcher.register(
            vec![
                tag("1/2/3", DatapointType::Uint, SubscriptionMode::EveryUpdate),
                tag("1/2/*", DatapointType::Usint, SubscriptionMode::EveryUpdate),
            ],
            first_callback,
        );
        dispatcher.register(vec![tag("1/2/3", DatapointType::Usint, SubscriptionMode::EveryUpdate)], second_callback);

        dispatcher.notify(address("1/2/3"), &[0x00, 0x07], true);

        let first = first.lock().unwrap();
        assert_eq!(first[0].values.len(), 2);
        assert_eq!(first[0].values[0].code, ResponseCode::InvalidDatatype);
        assert_eq!(first[0].values[0].value, None);
        assert_eq!(first[0].values[1].value, Some(PlcValue::Usint(7)));
        assert_eq!(second.lock().unwrap()[0].values[0].value, Some(PlcValue::Usint(7)));
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let dispatcher = SubscriptionDispatcher::new(Arc::new(StandardDatapointCodec));
        let (events, callback) = collector();
        let handle = dispatcher.register(vec![tag("1/2/3", DatapointType::Bool, SubscriptionMode::EveryUpdate)], callback);

        assert!(dispatcher.unregister(handle));
        assert!(!dispatcher.unregister(handle));
        dispatcher.notify(address("1/2/3"), &[0x01], true);
        assert!(events.lock().unwrap().is_empty());
        assert!(dispatcher.is_empty());
    }
}

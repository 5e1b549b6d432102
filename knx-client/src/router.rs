//! Inbound indication router
//!
//! Consumes the bus indications a tunneling session forwards: group values
//! go to the cache and then to the subscriptions, device disconnects close
//! the device session, and numbered data frames to this client that nobody
//! waited for are acknowledged so the sending device is not left hanging.
//! Point-to-point traffic between other devices is ignored.

use crate::cache::GroupValueCache;
use crate::device::DeviceRegistry;
use crate::subscription::SubscriptionDispatcher;
use knx_application::{Apdu, ApduBody, Cemi, ControlType, Destination, LDataFrame, Priority};
use knx_core::IndividualAddress;
use knx_session::TunnelingSession;
use log::{debug, trace, warn};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

pub(crate) struct IndicationRouter {
    pub(crate) cache: Arc<GroupValueCache>,
    pub(crate) subscriptions: Arc<SubscriptionDispatcher>,
    pub(crate) devices: Weak<DeviceRegistry>,
    pub(crate) tunnel: Weak<TunnelingSession>,
}

impl IndicationRouter {
    /// Route indications until the session drops its sender
    pub(crate) async fn run(self, mut indications: mpsc::UnboundedReceiver<LDataFrame>) {
        while let Some(frame) = indications.recv().await {
            self.route(frame).await;
        }
        trace!("Indication channel closed");
    }

    pub(crate) async fn route(&self, frame: LDataFrame) {
        match (&frame.destination, &frame.apdu.body) {
            (Destination::Group(group), ApduBody::Data(data)) => {
                let Some(payload) = data.group_payload() else {
                    trace!("Ignoring {} to group 0x{:04X}", data.name(), group.raw());
                    return;
                };
                let changed = self.cache.update(*group, &payload).await;
                trace!("Group 0x{:04X} = {:02X?} (changed: {})", group.raw(), payload, changed);
                self.subscriptions.notify(*group, &payload, changed);
            }
            (Destination::Individual(_), ApduBody::Control(ControlType::Disconnect))
                if self.is_for_client(&frame.destination) =>
            {
                if let Some(devices) = self.devices.upgrade() {
                    devices.remove(frame.source).await;
                }
            }
            (Destination::Individual(_), ApduBody::Data(data))
                if frame.apdu.numbered && self.is_for_client(&frame.destination) =>
            {
                debug!(
                    "Acknowledging unsolicited {} #{} from {}",
                    data.name(),
                    frame.apdu.counter,
                    frame.source
                );
                self.acknowledge(frame.source, frame.apdu.counter).await;
            }
            _ => trace!("Ignoring indication from {}", frame.source),
        }
    }

    /// Addressed to the individual address the gateway assigned this client
    fn is_for_client(&self, destination: &Destination) -> bool {
        let Destination::Individual(address) = destination else {
            return false;
        };
        self.tunnel
            .upgrade()
            .and_then(|tunnel| tunnel.client_address())
            .is_some_and(|client| client == *address)
    }

    async fn acknowledge(&self, device: IndividualAddress, counter: u8) {
        let Some(tunnel) = self.tunnel.upgrade() else { return };
        let ack = Cemi::LDataReq(LDataFrame::new(
            IndividualAddress::NULL,
            Destination::Individual(device),
            Priority::System,
            Apdu::numbered_control(ControlType::Ack, counter),
        ));
        if let Err(e) = tunnel.send_tunneling(ack).await {
            warn!("Acknowledging {} #{} failed: {}", device, counter, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{SubscriptionEvent, SubscriptionMode, SubscriptionTag};
    use knx_application::DataApdu;
    use knx_core::{
        DatapointType, GroupAddress, GroupAddressLevels, GroupAddressPattern, GroupAddressTag, StandardDatapointCodec,
    };
    use std::sync::Mutex;

    fn router() -> IndicationRouter {
        IndicationRouter {
            cache: Arc::new(GroupValueCache::new()),
            subscriptions: Arc::new(SubscriptionDispatcher::new(Arc::new(StandardDatapointCodec))),
            devices: Weak::new(),
            tunnel: Weak::new(),
        }
    }

    fn group_frame(group: GroupAddress, data: DataApdu) -> LDataFrame {
        LDataFrame::new(
            IndividualAddress::from_raw(0x1105),
            Destination::Group(group),
            Priority::Low,
            Apdu::data(data),
        )
    }

    #[tokio::test]
    async fn test_group_values_reach_cache_and_subscribers() {
        let router = router();
        let group = GroupAddress::from_raw(0x0A03);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.subscriptions.register(
            vec![SubscriptionTag::new(
                "light",
                GroupAddressTag {
                    pattern: GroupAddressPattern::exact(group, GroupAddressLevels::Three),
                    datapoint_type: Some(DatapointType::Bool),
                    quantity: 1,
                },
                DatapointType::Bool,
                SubscriptionMode::ChangeOfState,
            )],
            Arc::new(move |event: SubscriptionEvent| sink.lock().unwrap().push(event)),
        );

        let write = DataApdu::GroupValueWrite {
            first_byte: 0x01,
            data: vec![],
        };
        router.route(group_frame(group, write.clone())).await;
        router.route(group_frame(group, write)).await;
        router
            .route(group_frame(
                group,
                DataApdu::GroupValueResponse {
                    first_byte: 0x00,
                    data: vec![],
                },
            ))
            .await;

        assert_eq!(router.cache.read(group).await, Some(vec![0x00]));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_group_read_leaves_cache_alone() {
        let router = router();
        let group = GroupAddress::from_raw(7);
        router.route(group_frame(group, DataApdu::GroupValueRead)).await;
        assert!(router.cache.is_empty().await);
    }
}

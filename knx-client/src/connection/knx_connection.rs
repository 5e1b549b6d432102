//! KNXnet/IP tunneling connection
//!
//! [`KnxConnection`] ties the layers together. Connecting opens a
//! [`TunnelingSession`], a [`DeviceRegistry`] on top of it and a background
//! router feeding bus indications into the group value cache and the
//! subscriptions. The cache and the subscriptions belong to the connection
//! and survive a reconnect; device sessions belong to one tunnel and do not.

use super::builder::ConnectionBuilder;
use super::connection::{Connection, ReadResponse, SubscriptionRequest, TagValue, WriteResponse};
use crate::cache::GroupValueCache;
use crate::config::ConnectionConfig;
use crate::device::{DeviceRegistry, DeviceSession, PropertyValue};
use crate::error::{KnxError, KnxResult};
use crate::router::IndicationRouter;
use crate::subscription::{SubscriptionCallback, SubscriptionDispatcher, SubscriptionHandle, SubscriptionTag};
use futures::future::join_all;
use knx_application::PropertyDescription;
use knx_core::{
    DatapointCodec, DatapointType, GroupAddress, IndividualAddress, KnxTag, PlcValue, ResponseCode,
    StandardDatapointCodec,
};
use knx_session::{GatewayInfo, TunnelState, TunnelStatistics, TunnelingSession};
use knx_transport::{Transport, UdpSettings, UdpTransport};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

/// Everything that lives exactly as long as one tunneling channel
struct Link {
    tunnel: Arc<TunnelingSession>,
    devices: Arc<DeviceRegistry>,
    router: JoinHandle<()>,
}

/// Outcome of one bus read, shared by every tag waiting on the same address
pub(super) type GroupRead = Arc<OnceCell<Result<Vec<u8>, ResponseCode>>>;

/// Client connection to one KNXnet/IP gateway
pub struct KnxConnection {
    pub(super) config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    pub(super) codec: Arc<dyn DatapointCodec>,
    pub(super) cache: Arc<GroupValueCache>,
    subscriptions: Arc<SubscriptionDispatcher>,
    /// Group reads on the bus, by address
    pub(super) group_reads: Mutex<HashMap<GroupAddress, GroupRead>>,
    link: Mutex<Option<Link>>,
    /// Serializes connect, disconnect and reconnect
    lifecycle: tokio::sync::Mutex<()>,
}

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KnxConnection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Connection over UDP to `config.gateway`
    pub fn new(config: ConnectionConfig) -> KnxResult<Self> {
        let gateway = config
            .gateway
            .ok_or_else(|| KnxError::InvalidData("No gateway address configured".to_string()))?;
        let transport = Arc::new(UdpTransport::new(UdpSettings::new(gateway)));
        Ok(Self::with_parts(config, transport, Arc::new(StandardDatapointCodec)))
    }

    pub fn with_parts(config: ConnectionConfig, transport: Arc<dyn Transport>, codec: Arc<dyn DatapointCodec>) -> Self {
        Self {
            config,
            transport,
            subscriptions: Arc::new(SubscriptionDispatcher::new(codec.clone())),
            codec,
            cache: Arc::new(GroupValueCache::new()),
            group_reads: Mutex::new(HashMap::new()),
            link: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Last known group values
    pub fn cache(&self) -> &Arc<GroupValueCache> {
        &self.cache
    }

    pub fn state(&self) -> TunnelState {
        lock(&self.link)
            .as_ref()
            .map(|link| link.tunnel.state())
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_established()
    }

    /// Tunnel and device registry of the established channel
    pub(super) fn active(&self) -> KnxResult<(Arc<TunnelingSession>, Arc<DeviceRegistry>)> {
        match lock(&self.link).as_ref() {
            Some(link) if link.tunnel.state().is_established() => Ok((link.tunnel.clone(), link.devices.clone())),
            _ => Err(KnxError::NotConnected),
        }
    }

    async fn open_link(&self) -> KnxResult<Link> {
        let (tunnel, indications) = TunnelingSession::new(self.transport.clone(), self.config.tunnel_settings());
        tunnel.connect().await?;

        let devices = Arc::new(DeviceRegistry::new(tunnel.clone(), self.config.request_timeout));
        let router = IndicationRouter {
            cache: self.cache.clone(),
            subscriptions: self.subscriptions.clone(),
            devices: Arc::downgrade(&devices),
            tunnel: Arc::downgrade(&tunnel),
        };
        let router = tokio::spawn(router.run(indications));

        if let Some(gateway) = tunnel.gateway_info() {
            info!(
                "Connected to '{}' at {} on channel {}",
                gateway.device.friendly_name,
                tunnel.remote_address(),
                tunnel.channel_id().unwrap_or_default()
            );
        }
        Ok(Link { tunnel, devices, router })
    }

    /// Tear down one link, device sessions first
    ///
    /// Each device gets `device_disconnect_timeout`; a device that does not
    /// confirm in time is assumed gone.
    async fn close_link(&self, link: Link) -> KnxResult<()> {
        let result = if link.tunnel.state().is_established() {
            let timeout = self.config.device_disconnect_timeout;
            let devices = link.devices.addresses().await;
            let teardowns = devices.iter().map(|address| {
                let registry = link.devices.clone();
                async move {
                    match tokio::time::timeout(timeout, registry.disconnect(*address, timeout)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Assuming {} disconnected: {}", address, e),
                        Err(_) => debug!("Assuming {} disconnected after {:?}", address, timeout),
                    }
                }
            });
            join_all(teardowns).await;
            link.tunnel.disconnect().await
        } else {
            Ok(())
        };

        link.router.abort();
        link.devices.clear().await;
        result
    }

    fn take_link(&self) -> Option<Link> {
        lock(&self.link).take()
    }

    /// Drop the current channel, whatever its state, and open a new one
    ///
    /// Device sessions of the old channel are discarded.
    pub async fn reconnect(&self) -> KnxResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(old) = self.take_link() {
            if let Err(e) = self.close_link(old).await {
                warn!("Closing previous channel failed: {}", e);
            }
        }
        let link = self.open_link().await?;
        *lock(&self.link) = Some(link);
        Ok(())
    }

    pub fn gateway_info(&self) -> Option<GatewayInfo> {
        lock(&self.link).as_ref().and_then(|link| link.tunnel.gateway_info())
    }

    /// Individual address of this client on the bus
    ///
    /// A configured override wins over the address the gateway assigned.
    pub fn client_address(&self) -> Option<IndividualAddress> {
        self.config
            .client_individual_address
            .or_else(|| lock(&self.link).as_ref().and_then(|link| link.tunnel.client_address()))
    }

    pub fn statistics(&self) -> Option<TunnelStatistics> {
        lock(&self.link).as_ref().map(|link| link.tunnel.statistics())
    }

    /// Gateway description as key/value pairs
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        let Some(gateway) = self.gateway_info() else {
            return metadata;
        };
        let device = &gateway.device;
        let services = gateway
            .service_families
            .iter()
            .map(|f| format!("{:?} v{}", f.family, f.version))
            .collect::<Vec<_>>()
            .join(", ");

        metadata.insert("KnxMedium".to_string(), device.medium.as_str().to_string());
        metadata.insert("GatewayName".to_string(), device.friendly_name.clone());
        metadata.insert("GatewayKnxAddress".to_string(), device.knx_address.to_string());
        if let Some(client) = self.client_address() {
            metadata.insert("ClientKnxAddress".to_string(), client.to_string());
        }
        metadata.insert(
            "ProjectNumber".to_string(),
            (device.project_installation_id >> 4).to_string(),
        );
        metadata.insert(
            "InstallationNumber".to_string(),
            (device.project_installation_id & 0x0F).to_string(),
        );
        metadata.insert("DeviceSerialNumber".to_string(), gateway.serial_number());
        metadata.insert("DeviceMulticastAddress".to_string(), device.multicast_address.to_string());
        metadata.insert("DeviceMacAddress".to_string(), gateway.mac_address());
        metadata.insert("SupportedServices".to_string(), services);
        metadata
    }

    /// Parse a textual tag with the configured group address levels
    pub fn parse_tag(&self, address: &str) -> KnxResult<KnxTag> {
        KnxTag::parse(address, self.config.group_address_levels)
    }

    /// Read already parsed tags concurrently
    pub async fn read_tags(&self, tags: Vec<(String, KnxTag)>) -> ReadResponse {
        let active = self.active();
        let reads = tags.into_iter().map(|(name, tag)| {
            let active = &active;
            async move {
                let value = match active {
                    Ok((tunnel, devices)) => self.read_tag(tunnel, devices, &tag).await,
                    Err(e) => TagValue::error(e.response_code()),
                };
                (name, value)
            }
        });
        join_all(reads).await.into_iter().collect()
    }

    /// Write already parsed tags concurrently
    pub async fn write_tags(&self, tags: Vec<(String, KnxTag, PlcValue)>) -> WriteResponse {
        let active = self.active();
        let writes = tags.into_iter().map(|(name, tag, value)| {
            let active = &active;
            async move {
                let code = match active {
                    Ok((tunnel, _)) => self.write_tag(tunnel, &tag, &value).await,
                    Err(e) => e.response_code(),
                };
                (name, code)
            }
        });
        join_all(writes).await.into_iter().collect()
    }

    pub fn subscribe_tags(&self, tags: Vec<SubscriptionTag>, callback: SubscriptionCallback) -> SubscriptionHandle {
        self.subscriptions.register(tags, callback)
    }

    /// Open (or reuse) the transport connection to a device
    pub async fn connect_device(&self, address: IndividualAddress) -> KnxResult<Arc<DeviceSession>> {
        let (_, devices) = self.active()?;
        devices.connect(address).await
    }

    pub async fn disconnect_device(&self, address: IndividualAddress) -> KnxResult<()> {
        let (_, devices) = self.active()?;
        devices.disconnect(address, self.config.request_timeout).await
    }

    /// Addresses of the devices with an open session
    pub async fn connected_devices(&self) -> Vec<IndividualAddress> {
        match self.active() {
            Ok((_, devices)) => devices.addresses().await,
            Err(_) => Vec::new(),
        }
    }

    /// Authorize at `address` with `key`, or the configured building key
    pub async fn authenticate(&self, address: IndividualAddress, key: Option<&[u8]>) -> KnxResult<()> {
        let key = match key {
            Some(key) => key,
            None => self
                .config
                .building_key
                .as_deref()
                .ok_or_else(|| KnxError::InvalidState("No authorization key configured".to_string()))?,
        };
        let (_, devices) = self.active()?;
        devices.authenticate(address, key).await
    }

    pub async fn read_property(
        &self,
        address: IndividualAddress,
        object_index: u8,
        property_id: u8,
        start_index: u16,
        count: u8,
    ) -> KnxResult<PropertyValue> {
        let (_, devices) = self.active()?;
        devices
            .read_property(address, object_index, property_id, start_index, count)
            .await
    }

    pub async fn read_property_description(
        &self,
        address: IndividualAddress,
        object_index: u8,
        property_id: u8,
        property_index: u8,
    ) -> KnxResult<PropertyDescription> {
        let (_, devices) = self.active()?;
        devices
            .read_property_description(address, object_index, property_id, property_index)
            .await
    }

    pub async fn read_memory(
        &self,
        address: IndividualAddress,
        start: u16,
        num_elements: usize,
        datapoint_type: DatapointType,
    ) -> KnxResult<Vec<PlcValue>> {
        let (_, devices) = self.active()?;
        devices
            .read_memory(address, start, num_elements, datapoint_type, self.codec.as_ref())
            .await
    }
}

#[async_trait::async_trait]
impl Connection for KnxConnection {
    async fn connect(&self) -> KnxResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Err(KnxError::InvalidState("Connection is already open".to_string()));
        }
        if let Some(stale) = self.take_link() {
            self.close_link(stale).await?;
        }
        let link = self.open_link().await?;
        *lock(&self.link) = Some(link);
        Ok(())
    }

    async fn disconnect(&self) -> KnxResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let link = self.take_link().ok_or(KnxError::NotConnected)?;
        self.close_link(link).await
    }

    async fn is_alive(&self) -> bool {
        let tunnel = lock(&self.link).as_ref().map(|link| link.tunnel.clone());
        match tunnel {
            Some(tunnel) => tunnel.is_alive().await,
            None => false,
        }
    }

    async fn read(&self, tags: &[(&str, &str)]) -> ReadResponse {
        let mut response = ReadResponse::new();
        let mut parsed = Vec::with_capacity(tags.len());
        for (name, address) in tags {
            match self.parse_tag(address) {
                Ok(tag) => parsed.push((name.to_string(), tag)),
                Err(e) => {
                    response.insert(name.to_string(), TagValue::error(e.response_code()));
                }
            }
        }
        response.extend(self.read_tags(parsed).await);
        response
    }

    async fn write(&self, tags: &[(&str, &str, PlcValue)]) -> WriteResponse {
        let mut response = WriteResponse::new();
        let mut parsed = Vec::with_capacity(tags.len());
        for (name, address, value) in tags {
            match self.parse_tag(address) {
                Ok(tag) => parsed.push((name.to_string(), tag, value.clone())),
                Err(e) => {
                    response.insert(name.to_string(), e.response_code());
                }
            }
        }
        response.extend(self.write_tags(parsed).await);
        response
    }

    fn subscribe(
        &self,
        tags: &[SubscriptionRequest<'_>],
        callback: SubscriptionCallback,
    ) -> KnxResult<SubscriptionHandle> {
        let tags = tags
            .iter()
            .map(|request| match self.parse_tag(request.address)? {
                KnxTag::GroupAddress(tag) => Ok(SubscriptionTag::new(
                    request.name,
                    tag,
                    request.datapoint_type,
                    request.mode,
                )),
                _ => Err(KnxError::InvalidAddress(format!(
                    "{} is not a group address tag",
                    request.address
                ))),
            })
            .collect::<KnxResult<Vec<_>>>()?;
        Ok(self.subscribe_tags(tags, callback))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unregister(handle)
    }
}

impl fmt::Debug for KnxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnxConnection")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for KnxConnection {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.link).take() {
            link.router.abort();
        }
    }
}

//! Last known value of every group address seen on the bus

use knx_core::{GroupAddress, GroupAddressPattern};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Group value cache
///
/// Only the inbound router writes to the cache; reads never populate it.
#[derive(Debug, Default)]
pub struct GroupValueCache {
    values: RwLock<BTreeMap<GroupAddress, Vec<u8>>>,
}

impl GroupValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` and report whether it differs from the stored value
    ///
    /// An address seen for the first time counts as changed.
    pub(crate) async fn update(&self, address: GroupAddress, payload: &[u8]) -> bool {
        let mut values = self.values.write().await;
        match values.get_mut(&address) {
            Some(stored) if stored.as_slice() == payload => false,
            Some(stored) => {
                stored.clear();
                stored.extend_from_slice(payload);
                true
            }
            None => {
                values.insert(address, payload.to_vec());
                true
            }
        }
    }

    pub async fn read(&self, address: GroupAddress) -> Option<Vec<u8>> {
        self.values.read().await.get(&address).cloned()
    }

    /// Every cached address matching `pattern`, in address order
    pub async fn matching(&self, pattern: &GroupAddressPattern) -> Vec<(GroupAddress, Vec<u8>)> {
        self.values
            .read()
            .await
            .iter()
            .filter(|(address, _)| pattern.matches(**address))
            .map(|(address, payload)| (*address, payload.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.values.write().await.clear();
    }
}

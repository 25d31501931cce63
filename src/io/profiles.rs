//! Profile and operator lookup

use crate::domain::{Operator, Profile};
use crate::error::StoreError;
use crate::infra::config::ConfigHandle;
use async_trait::async_trait;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile(&self, id: u32) -> Result<Option<Profile>, StoreError>;
    async fn operator(&self, id: u32) -> Result<Option<Operator>, StoreError>;
}

/// Profiles and operators declared in the `[[profiles]]` / `[[operators]]`
/// config sections. Reads the current snapshot on every lookup, so a config
/// reload makes new profiles available to the next start.
pub struct ConfigProfileStore {
    config: ConfigHandle,
}

impl ConfigProfileStore {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProfileStore for ConfigProfileStore {
    async fn profile(&self, id: u32) -> Result<Option<Profile>, StoreError> {
        Ok(self.config.current().profile(id).cloned())
    }

    async fn operator(&self, id: u32) -> Result<Option<Operator>, StoreError> {
        Ok(self.config.current().operator(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Product;
    use crate::infra::config::Config;

    #[tokio::test]
    async fn test_lookup_follows_config_replacement() {
        let handle = ConfigHandle::new(Config::default());
        let store = ConfigProfileStore::new(handle.clone());
        assert!(store.profile(1).await.unwrap().is_none());

        let profile = Profile {
            id: 1,
            name: "Carry bags".to_string(),
            product: Product {
                name: "BL-CARRY-BAGS".to_string(),
                min_sensor_block_time_ms: None,
                max_sensor_block_time_ms: None,
            },
            camera: None,
        };
        let operator = Operator { id: 3, name: "Ravi".to_string() };
        handle.replace(Config::default().with_profiles(vec![profile.clone()], vec![operator]));

        assert_eq!(store.profile(1).await.unwrap(), Some(profile));
        assert_eq!(store.operator(3).await.unwrap().unwrap().name, "Ravi");
        assert!(store.operator(4).await.unwrap().is_none());
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{Policy, PolicyFilter};
use crate::persist::StoreError;

/// Storage capability for access policies. The evaluator only depends on
/// this trait; the backing engine (memory, SQL) is interchangeable.
#[async_trait]
pub trait PolicyStore: Send + Sync {
	async fn save(&self, policy: Policy) -> Result<(), StoreError>;
	async fn get(&self, policy_id: &str) -> Result<Option<Policy>, StoreError>;
	async fn delete(&self, policy_id: &str) -> Result<bool, StoreError>;
	async fn query(&self, filter: &PolicyFilter) -> Result<Vec<Policy>, StoreError>;
}

/// In-memory policy store. The default backend and the test vehicle.
#[derive(Default)]
pub struct MemoryPolicyStore {
	policies: RwLock<HashMap<String, Policy>>,
}

impl MemoryPolicyStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
	async fn save(&self, policy: Policy) -> Result<(), StoreError> {
		self.policies
			.write()
			.await
			.insert(policy.policy_id.clone(), policy);
		Ok(())
	}

	async fn get(&self, policy_id: &str) -> Result<Option<Policy>, StoreError> {
		Ok(self.policies.read().await.get(policy_id).cloned())
	}

	async fn delete(&self, policy_id: &str) -> Result<bool, StoreError> {
		Ok(self.policies.write().await.remove(policy_id).is_some())
	}

	async fn query(&self, filter: &PolicyFilter) -> Result<Vec<Policy>, StoreError> {
		let now = Utc::now();
		let policies = self.policies.read().await;
		let mut out: Vec<Policy> = policies
			.values()
			.filter(|p| {
				if let Some(client_id) = &filter.client_id {
					if &p.client_id != client_id {
						return false;
					}
				}
				if let Some(service_id) = &filter.service_id {
					if &p.service_id != service_id {
						return false;
					}
				}
				if filter.active {
					if let Some(expiry) = p.expiry_time {
						if expiry <= now {
							return false;
						}
					}
				}
				true
			})
			.cloned()
			.collect();
		// Stable order for deterministic first-match evaluation
		out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
		Ok(out)
	}
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use depmig_storage::CrmClient;

use crate::reconcile::{DealStore, StoreError};

#[async_trait]
impl DealStore for CrmClient {
    async fn search_by_name_token(&self, name_token: &str) -> Result<Option<String>, StoreError> {
        Ok(self.search_deal_by_name_token(name_token).await?)
    }

    async fn create(&self, properties: &BTreeMap<String, String>) -> Result<String, StoreError> {
        Ok(self.create_deal(properties).await?)
    }

    async fn archive(&self, deal_id: &str) -> Result<(), StoreError> {
        Ok(self.archive_deal(deal_id).await?)
    }
}

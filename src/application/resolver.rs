//! Read path: cache first, upstream on miss, write back on success.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::application::cache::CacheStore;
use crate::application::fetch::{FetchError, Fetcher};
use crate::domain::identity::CacheIdentity;

#[derive(Clone)]
pub struct RequestResolver {
    cache: CacheStore,
    fetcher: Arc<dyn Fetcher>,
}

impl RequestResolver {
    pub fn new(cache: CacheStore, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { cache, fetcher }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Resolve `identity` to the upstream payload, or `None` when there is no data.
    ///
    /// A hit never touches the network. A miss performs exactly one fetch and,
    /// if the fetch produced data, one cache write. The write result does not
    /// affect what is returned.
    pub async fn resolve(&self, identity: &CacheIdentity) -> Result<Option<Value>, FetchError> {
        if let Some(cached) = self.cache.lookup(identity).await {
            info!(
                target = "eventmirror::resolver",
                identity = %identity,
                "serving cached response"
            );
            return Ok(Some(cached));
        }

        let fetched = self.fetcher.fetch(identity).await?;

        if let Some(response) = fetched.as_ref() {
            self.cache.upsert(identity, response).await;
        }

        info!(
            target = "eventmirror::resolver",
            identity = %identity,
            found = fetched.is_some(),
            "serving fresh response"
        );
        Ok(fetched)
    }
}

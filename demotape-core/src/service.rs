//! The delivery service: one object wiring policy, locator, cache and streamer.

use crate::cache::{CacheError, CacheEntry, DemoCache, LocalCacheStore};
use crate::config::{Config, SettingsResolver};
use crate::events::CacheEvents;
use crate::fetch::{FetchError, SourceFetcher};
use crate::locator::{AssetCatalog, AssetLocator, AssetReference, LocatorError, SourceDescriptor};
use crate::policy::{decide, AccessPolicy, RequesterContext};
use crate::stream;
use axum::response::Response;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Demo length is zero for {0}")]
    EmptyDemo(AssetReference),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to answer an asset request, built once and shared.
pub struct DeliveryService {
    locator: AssetLocator,
    cache: DemoCache,
    policy: Arc<dyn AccessPolicy>,
    settings: SettingsResolver,
}

impl DeliveryService {
    pub fn new(
        locator: AssetLocator,
        cache: DemoCache,
        policy: Arc<dyn AccessPolicy>,
        settings: SettingsResolver,
    ) -> Self {
        Self {
            locator,
            cache,
            policy,
            settings,
        }
    }

    /// Build the full service from configuration. The cache layout must already exist.
    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn AssetCatalog>,
        policy: Arc<dyn AccessPolicy>,
        events: CacheEvents,
    ) -> Result<Self, DeliveryError> {
        let dir = config.cache_dir();
        let fetcher = SourceFetcher::new(dir.work_dir(), config.fetch_timeout)?;
        let cache = DemoCache::new(Arc::new(LocalCacheStore::new(dir)), fetcher, events)
            .with_wait_timeout(config.build_wait_timeout);
        let locator = AssetLocator::new(catalog, config.default_extension_fallback);
        Ok(Self::new(locator, cache, policy, config.resolver()))
    }

    pub fn cache(&self) -> &DemoCache {
        &self.cache
    }

    pub fn locator(&self) -> &AssetLocator {
        &self.locator
    }

    /// Answer a request for `reference`: the full asset for entitled
    /// requesters, the demo otherwise. `range` is the raw `Range` header.
    pub async fn deliver(
        &self,
        reference: &AssetReference,
        requester: &RequesterContext,
        range: Option<&str>,
        head_only: bool,
    ) -> Result<Response, DeliveryError> {
        let decision = decide(self.policy.as_ref(), reference, requester).await;
        let source = self.locator.resolve_source(reference).await?;

        if decision.grants_full_asset {
            info!("Serving full asset {}", reference);
            if let Some(path) = source.local_path() {
                return Ok(stream::serve(&path, range, &source.content_type, head_only).await?);
            }
            return self
                .serve_cached(&self.cache, &source, range, head_only, |cache, source| async move {
                    cache.get_or_create_purchased(&source).await
                })
                .await;
        }

        let percent = decision.demo_percent;
        let direct = self.settings.direct_demo_mode(reference);
        // Direct mode serves the upload whole whatever the percent
        if percent == 0 && !direct {
            return Err(DeliveryError::EmptyDemo(*reference));
        }
        debug!("Serving {}% demo of {} (direct={})", percent, reference, direct);
        let cache = self.cache.clone().with_direct_mode(direct);
        self.serve_cached(&cache, &source, range, head_only, move |cache, source| async move {
            cache.get_or_create(&source, percent).await
        })
        .await
    }

    /// Stream a cache entry. An entry deleted between lookup and open is rebuilt once.
    async fn serve_cached<F, Fut>(
        &self,
        cache: &DemoCache,
        source: &SourceDescriptor,
        range: Option<&str>,
        head_only: bool,
        build: F,
    ) -> Result<Response, DeliveryError>
    where
        F: Fn(DemoCache, SourceDescriptor) -> Fut,
        Fut: std::future::Future<Output = Result<CacheEntry, CacheError>>,
    {
        let entry = build(cache.clone(), source.clone()).await?;
        match stream::serve(&entry.file_path, range, &source.content_type, head_only).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Cache entry {} vanished before streaming, rebuilding", entry.key);
                let entry = build(cache.clone(), source.clone()).await?;
                Ok(stream::serve(&entry.file_path, range, &source.content_type, head_only).await?)
            }
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_dir::{CacheDir, CacheVariant};
    use crate::config::AssetSettings;
    use crate::fetch::DEFAULT_FETCH_TIMEOUT;
    use crate::locator::InMemoryCatalog;
    use crate::policy::StaticAccessPolicy;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        service: DeliveryService,
        data: Vec<u8>,
    }

    async fn fixture(percent: u8, direct: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let dir = CacheDir::new(temp.path().join("base"));
        dir.ensure_layout().await.unwrap();

        let data: Vec<u8> = (0..2_000).map(|i| (i % 200) as u8).collect();
        let source = temp.path().join("song.mp3");
        std::fs::write(&source, &data).unwrap();

        let reference = AssetReference::new(1, 0);
        let catalog = InMemoryCatalog::new();
        catalog.insert(reference, source.display().to_string()).await;

        let settings = SettingsResolver::new(
            AssetSettings {
                demo_percent: Some(percent),
                direct_demo_mode: Some(direct),
            },
            HashMap::new(),
        );
        let mut policy = StaticAccessPolicy::new(settings.clone());
        policy.grant_product("paid", 1);

        let fetcher = SourceFetcher::new(dir.work_dir(), DEFAULT_FETCH_TIMEOUT).unwrap();
        let cache = DemoCache::new(
            Arc::new(LocalCacheStore::new(dir.clone())),
            fetcher,
            CacheEvents::new(),
        );
        let service = DeliveryService::new(
            AssetLocator::new(Arc::new(catalog), true),
            cache,
            Arc::new(policy),
            settings,
        );
        Fixture {
            _temp: temp,
            service,
            data,
        }
    }

    async fn body(response: Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn anonymous_gets_demo_prefix() {
        let fx = fixture(25, false).await;
        let response = fx
            .service
            .deliver(&AssetReference::new(1, 0), &RequesterContext::anonymous(), None, false)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, &fx.data[..500]);
        assert_eq!(fx.service.cache().truncator().invocations(), 1);
    }

    #[tokio::test]
    async fn entitled_gets_full_local_file_uncached() {
        let fx = fixture(25, false).await;
        let response = fx
            .service
            .deliver(
                &AssetReference::new(1, 0),
                &RequesterContext::with_token("paid"),
                Some("bytes=1000-"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body(response).await, &fx.data[1000..]);
        assert!(fx
            .service
            .cache()
            .store()
            .list(CacheVariant::Purchased)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn direct_mode_serves_upload_whole() {
        let fx = fixture(25, true).await;
        let response = fx
            .service
            .deliver(&AssetReference::new(1, 0), &RequesterContext::anonymous(), None, false)
            .await
            .unwrap();
        assert_eq!(body(response).await, fx.data);
        assert_eq!(fx.service.cache().truncator().invocations(), 0);
    }

    #[tokio::test]
    async fn zero_percent_is_not_served() {
        let fx = fixture(0, false).await;
        let result = fx
            .service
            .deliver(&AssetReference::new(1, 0), &RequesterContext::anonymous(), None, false)
            .await;
        assert!(matches!(result, Err(DeliveryError::EmptyDemo(_))));
        assert!(fx
            .service
            .cache()
            .store()
            .list(CacheVariant::Demo)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(fx.service.cache().truncator().invocations(), 0);
    }

    #[tokio::test]
    async fn direct_mode_ignores_zero_percent() {
        let fx = fixture(0, true).await;
        let response = fx
            .service
            .deliver(&AssetReference::new(1, 0), &RequesterContext::anonymous(), None, false)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, fx.data);
        assert_eq!(fx.service.cache().truncator().invocations(), 0);
    }

    #[tokio::test]
    async fn unknown_asset_is_locator_error() {
        let fx = fixture(25, false).await;
        let result = fx
            .service
            .deliver(&AssetReference::new(99, 0), &RequesterContext::anonymous(), None, false)
            .await;
        assert!(matches!(
            result,
            Err(DeliveryError::Locator(LocatorError::NotFound(_)))
        ));
    }
}

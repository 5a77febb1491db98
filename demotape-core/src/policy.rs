//! Entitlement decisions.
//!
//! Purchase verification lives outside the engine. `AccessPolicy` is the seam
//! through which the engine asks whether a requester may have the full asset
//! and, if not, how much of it the demo keeps.

use crate::config::SettingsResolver;
use crate::locator::AssetReference;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid policy file: {0}")]
    Parse(String),
}

/// Who is asking. Both fields are optional; anonymous requesters get demos.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequesterContext {
    pub token: Option<String>,
    pub remote_addr: Option<String>,
}

impl RequesterContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            remote_addr: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessDecision {
    pub grants_full_asset: bool,
    /// Always within 0..=100.
    pub demo_percent: u8,
}

#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn is_entitled(&self, reference: &AssetReference, requester: &RequesterContext) -> bool;

    async fn demo_percent(&self, reference: &AssetReference) -> u8;
}

/// Ask `policy` for a decision. Percents above 100 are clamped.
pub async fn decide(
    policy: &dyn AccessPolicy,
    reference: &AssetReference,
    requester: &RequesterContext,
) -> AccessDecision {
    if policy.is_entitled(reference, requester).await {
        return AccessDecision {
            grants_full_asset: true,
            demo_percent: 100,
        };
    }

    let percent = policy.demo_percent(reference).await;
    if percent > 100 {
        warn!("Policy returned demo percent {} for {}, clamping", percent, reference);
    }
    AccessDecision {
        grants_full_asset: false,
        demo_percent: percent.min(100),
    }
}

/// One token's purchases in a policy file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Grant {
    pub token: String,
    /// Every track of these products.
    #[serde(default)]
    pub products: Vec<u64>,
    /// Individual tracks as `"{product_id}:{track_index}"`.
    #[serde(default)]
    pub assets: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PolicyYaml {
    #[serde(default)]
    pub grants: Vec<Grant>,
}

#[derive(Clone, Debug, Default)]
struct Entitlements {
    products: HashSet<u64>,
    assets: HashSet<AssetReference>,
}

/// Fixed token-to-purchase table, with demo percents from settings.
#[derive(Clone, Debug, Default)]
pub struct StaticAccessPolicy {
    grants: HashMap<String, Entitlements>,
    settings: SettingsResolver,
}

impl StaticAccessPolicy {
    pub fn new(settings: SettingsResolver) -> Self {
        Self {
            grants: HashMap::new(),
            settings,
        }
    }

    pub fn from_yaml(policy: PolicyYaml, settings: SettingsResolver) -> Result<Self, PolicyError> {
        let mut this = Self::new(settings);
        for grant in policy.grants {
            if grant.token.is_empty() {
                return Err(PolicyError::Parse("grant with empty token".into()));
            }
            let entry = this.grants.entry(grant.token).or_default();
            entry.products.extend(grant.products);
            for asset in grant.assets {
                let reference = asset
                    .parse()
                    .map_err(|_| PolicyError::Parse(format!("invalid asset reference: {asset}")))?;
                entry.assets.insert(reference);
            }
        }
        Ok(this)
    }

    pub async fn from_yaml_file(path: &Path, settings: SettingsResolver) -> Result<Self, PolicyError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let policy: PolicyYaml = serde_yaml::from_str(&raw)
            .map_err(|e| PolicyError::Parse(format!("{}: {}", path.display(), e)))?;
        let this = Self::from_yaml(policy, settings)?;
        info!("Loaded {} policy tokens from {}", this.grants.len(), path.display());
        Ok(this)
    }

    pub fn grant_product(&mut self, token: impl Into<String>, product_id: u64) {
        self.grants
            .entry(token.into())
            .or_default()
            .products
            .insert(product_id);
    }

    pub fn grant_asset(&mut self, token: impl Into<String>, reference: AssetReference) {
        self.grants
            .entry(token.into())
            .or_default()
            .assets
            .insert(reference);
    }
}

#[async_trait]
impl AccessPolicy for StaticAccessPolicy {
    async fn is_entitled(&self, reference: &AssetReference, requester: &RequesterContext) -> bool {
        let Some(token) = requester.token.as_deref() else {
            return false;
        };
        let entitled = self.grants.get(token).is_some_and(|e| {
            e.products.contains(&reference.product_id) || e.assets.contains(reference)
        });
        debug!("Entitlement for {}: {}", reference, entitled);
        entitled
    }

    async fn demo_percent(&self, reference: &AssetReference) -> u8 {
        self.settings.demo_percent(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetSettings, DEFAULT_DEMO_PERCENT};

    struct Greedy;

    #[async_trait]
    impl AccessPolicy for Greedy {
        async fn is_entitled(&self, _: &AssetReference, _: &RequesterContext) -> bool {
            false
        }

        async fn demo_percent(&self, _: &AssetReference) -> u8 {
            250
        }
    }

    fn policy() -> StaticAccessPolicy {
        let yaml = r#"
grants:
  - token: buyer-1
    products: [7]
  - token: buyer-2
    assets: ["9:1"]
"#;
        StaticAccessPolicy::from_yaml(serde_yaml::from_str(yaml).unwrap(), SettingsResolver::default())
            .unwrap()
    }

    #[tokio::test]
    async fn product_grant_covers_every_track() {
        let policy = policy();
        let buyer = RequesterContext::with_token("buyer-1");
        assert!(policy.is_entitled(&AssetReference::new(7, 0), &buyer).await);
        assert!(policy.is_entitled(&AssetReference::new(7, 12), &buyer).await);
        assert!(!policy.is_entitled(&AssetReference::new(8, 0), &buyer).await);
    }

    #[tokio::test]
    async fn asset_grant_covers_one_track() {
        let policy = policy();
        let buyer = RequesterContext::with_token("buyer-2");
        assert!(policy.is_entitled(&AssetReference::new(9, 1), &buyer).await);
        assert!(!policy.is_entitled(&AssetReference::new(9, 0), &buyer).await);
    }

    #[tokio::test]
    async fn anonymous_and_unknown_tokens_get_demos() {
        let policy = policy();
        let reference = AssetReference::new(7, 0);

        let decision = decide(&policy, &reference, &RequesterContext::anonymous()).await;
        assert!(!decision.grants_full_asset);
        assert_eq!(decision.demo_percent, DEFAULT_DEMO_PERCENT);

        let stranger = RequesterContext::with_token("who?");
        assert!(!decide(&policy, &reference, &stranger).await.grants_full_asset);
    }

    #[tokio::test]
    async fn entitled_decision_is_full() {
        let policy = policy();
        let decision = decide(
            &policy,
            &AssetReference::new(7, 3),
            &RequesterContext::with_token("buyer-1"),
        )
        .await;
        assert_eq!(
            decision,
            AccessDecision {
                grants_full_asset: true,
                demo_percent: 100
            }
        );
    }

    #[tokio::test]
    async fn demo_percent_follows_settings() {
        let reference = AssetReference::new(3, 0);
        let settings = SettingsResolver::new(
            AssetSettings {
                demo_percent: Some(45),
                direct_demo_mode: None,
            },
            HashMap::from([(
                reference,
                AssetSettings {
                    demo_percent: Some(5),
                    direct_demo_mode: None,
                },
            )]),
        );
        let policy = StaticAccessPolicy::new(settings);
        assert_eq!(policy.demo_percent(&reference).await, 5);
        assert_eq!(policy.demo_percent(&AssetReference::new(4, 0)).await, 45);
    }

    #[tokio::test]
    async fn out_of_range_percent_is_clamped() {
        let decision = decide(&Greedy, &AssetReference::new(1, 0), &RequesterContext::anonymous()).await;
        assert_eq!(decision.demo_percent, 100);
    }

    #[test]
    fn bad_asset_reference_is_rejected() {
        let yaml: PolicyYaml =
            serde_yaml::from_str("grants:\n  - token: t\n    assets: [\"x:y\"]\n").unwrap();
        assert!(matches!(
            StaticAccessPolicy::from_yaml(yaml, SettingsResolver::default()),
            Err(PolicyError::Parse(_))
        ));
    }
}

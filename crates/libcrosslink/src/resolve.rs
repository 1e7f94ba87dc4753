//! Peer application identity resolution.
//!
//! Resolves the full source/sink bundle, module, and ability names for a
//! start request, reading the eventually-consistent peer metadata cache.
//! A cache miss triggers a push-then-pull refresh and a full retry; the
//! attempt bound is a hard cap checked before any further network I/O,
//! not a backoff schedule.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::CrosslinkConfig;
use crate::error::CrosslinkError;
use crate::external::{AbilityEntry, BundleMetadata, BundleRef, MetadataCache};

/// Fully resolved identity pair for one start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPair {
    pub continue_type: String,
    pub source_bundle: String,
    pub source_module: String,
    pub source_ability: String,
    pub sink_bundle: String,
    pub sink_module: String,
    pub sink_ability: String,
}

enum TypeSelector<'a> {
    ById(u32),
    ByName(&'a str),
}

pub struct PeerResolver {
    cache: Arc<dyn MetadataCache>,
    local_device_id: String,
    retry_max: u32,
    quick_start_suffix: String,
}

impl PeerResolver {
    pub fn new(
        cache: Arc<dyn MetadataCache>,
        local_device_id: String,
        cfg: &CrosslinkConfig,
    ) -> Self {
        Self {
            cache,
            local_device_id,
            retry_max: cfg.resolve_retry_max,
            quick_start_suffix: cfg.quick_start_suffix.clone(),
        }
    }

    /// Numeric form: bundle referenced by id, continuation entry chosen by
    /// the first declared entry with a matching numeric id.
    pub async fn resolve_by_id(
        &self,
        source_device_id: &str,
        bundle_id: u32,
        type_id: u32,
    ) -> Result<ResolvedPair, CrosslinkError> {
        self.resolve_inner(
            source_device_id,
            &BundleRef::ById(bundle_id),
            TypeSelector::ById(type_id),
        )
        .await
    }

    /// Named form: bundle referenced by name, continuation entry chosen by
    /// the first declared entry with an exactly matching name.
    pub async fn resolve_by_name(
        &self,
        source_device_id: &str,
        bundle_name: &str,
        continue_type: &str,
    ) -> Result<ResolvedPair, CrosslinkError> {
        self.resolve_inner(
            source_device_id,
            &BundleRef::ByName(bundle_name.to_string()),
            TypeSelector::ByName(continue_type),
        )
        .await
    }

    async fn resolve_inner(
        &self,
        source_device_id: &str,
        bundle: &BundleRef,
        selector: TypeSelector<'_>,
    ) -> Result<ResolvedPair, CrosslinkError> {
        let source_meta = self.lookup_with_retry(source_device_id, bundle).await?;

        let continue_type = self
            .select_continue_type(&source_meta, &selector)
            .ok_or_else(|| CrosslinkError::NoSinkMatch(selector_label(&selector)))?;

        let source_ability = source_meta
            .abilities
            .iter()
            .find(|a| self.types_match(&a.continue_type, &continue_type))
            .ok_or_else(|| CrosslinkError::NoSinkMatch(continue_type.clone()))?
            .clone();

        let (sink_bundle, sink_ability) =
            self.pick_sink(&source_meta, &continue_type, &source_ability.module_name)?;

        Ok(ResolvedPair {
            continue_type,
            source_bundle: source_meta.bundle_name,
            source_module: source_ability.module_name,
            source_ability: source_ability.name,
            sink_bundle,
            sink_module: sink_ability.module_name,
            sink_ability: sink_ability.name,
        })
    }

    /// Retry the lookup against the eventually-consistent cache, refreshing
    /// from the peer between attempts. The bound is enforced before any
    /// further I/O once reached.
    async fn lookup_with_retry(
        &self,
        device_id: &str,
        bundle: &BundleRef,
    ) -> Result<BundleMetadata, CrosslinkError> {
        let mut attempts: u32 = 0;
        loop {
            if attempts >= self.retry_max {
                warn!(device_id, attempts, "peer metadata resolution exhausted");
                return Err(CrosslinkError::ResolveExhausted { attempts });
            }
            attempts += 1;

            if let Some(meta) = self.cache.lookup(device_id, bundle) {
                return Ok(meta);
            }

            debug!(device_id, attempts, "peer metadata miss, refreshing cache");
            if let Err(error) = self.cache.refresh_from_peer(device_id).await {
                warn!(device_id, %error, "peer cache refresh failed");
            }
        }
    }

    /// Declaration-order selection: the first entry matching the numeric id
    /// or the exact name wins.
    fn select_continue_type(
        &self,
        meta: &BundleMetadata,
        selector: &TypeSelector<'_>,
    ) -> Option<String> {
        meta.continue_types
            .iter()
            .find(|entry| match selector {
                TypeSelector::ById(id) => entry.id == *id,
                TypeSelector::ByName(name) => entry.name == *name,
            })
            .map(|entry| entry.name.clone())
    }

    /// Choose the sink bundle and ability.
    ///
    /// Candidates come from the source bundle's continue-bundle list; when
    /// that list is empty, a locally installed bundle with the exact source
    /// name is the sole candidate. A candidate qualifies by exact bundle
    /// name or by matching developer id. The first qualifying candidate
    /// with a continuation-type match is retained as provisional; scanning
    /// continues only to upgrade to an ability whose module name equals the
    /// source module. An exact-module match is final. A provisional winner
    /// is never discarded for anything less.
    fn pick_sink(
        &self,
        source_meta: &BundleMetadata,
        continue_type: &str,
        source_module: &str,
    ) -> Result<(String, AbilityEntry), CrosslinkError> {
        let candidates: Vec<String> = if source_meta.continue_bundles.is_empty() {
            match self.cache.lookup(
                &self.local_device_id,
                &BundleRef::ByName(source_meta.bundle_name.clone()),
            ) {
                Some(_) => vec![source_meta.bundle_name.clone()],
                None => {
                    return Err(CrosslinkError::NoSinkMatch(continue_type.to_string()));
                }
            }
        } else {
            source_meta.continue_bundles.clone()
        };

        let mut provisional: Option<(String, AbilityEntry)> = None;

        for candidate_name in &candidates {
            let Some(candidate) = self
                .cache
                .lookup(&self.local_device_id, &BundleRef::ByName(candidate_name.clone()))
            else {
                continue;
            };

            let qualifies = candidate.bundle_name == source_meta.bundle_name
                || candidate.developer_id == source_meta.developer_id;
            if !qualifies {
                continue;
            }

            for ability in &candidate.abilities {
                if !self.types_match(&ability.continue_type, continue_type) {
                    continue;
                }
                if ability.module_name == source_module {
                    return Ok((candidate.bundle_name.clone(), ability.clone()));
                }
                if provisional.is_none() {
                    provisional = Some((candidate.bundle_name.clone(), ability.clone()));
                }
            }
        }

        provisional.ok_or_else(|| CrosslinkError::NoSinkMatch(continue_type.to_string()))
    }

    /// Bidirectional quick-start suffix normalization: two type strings
    /// match if equal, or equal after stripping the suffix from either.
    fn types_match(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }
        let suffix = self.quick_start_suffix.as_str();
        if suffix.is_empty() {
            return false;
        }
        a.strip_suffix(suffix) == Some(b) || b.strip_suffix(suffix) == Some(a)
    }
}

fn selector_label(selector: &TypeSelector<'_>) -> String {
    match selector {
        TypeSelector::ById(id) => format!("type id {id}"),
        TypeSelector::ByName(name) => (*name).to_string(),
    }
}

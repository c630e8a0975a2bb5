//! Archetype resolution against the spec store.

use crate::diff::{FieldDiff, deep_merge, diff_objects};
use promptloom_core::error::{Error, Result};
use promptloom_core::spec::Specification;
use promptloom_core::store::SpecStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Longest overlay → archetype chain followed before giving up.
pub const MAX_ARCHETYPE_DEPTH: usize = 8;

/// `computeLayerDiff` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDiff {
    pub overlay_id: String,
    pub overlay_slug: String,
    pub base_id: String,
    pub base_slug: String,
    #[serde(flatten)]
    pub fields: FieldDiff,
}

/// A spec's config with every archetype beneath it merged in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub config: Value,
    /// Slugs from the spec itself down to the root archetype.
    pub chain: Vec<String>,
}

impl EffectiveConfig {
    /// Slug of the archetype directly beneath the spec, if it is an overlay.
    pub fn archetype_slug(&self) -> Option<&str> {
        self.chain.get(1).map(String::as_str)
    }
}

/// Base-slug candidates for an `extendsArchetype` reference: the reference
/// itself, then the reference with the overlay's `-{domain}` suffix removed.
pub fn base_slug_candidates(reference: &str, domain: Option<&str>) -> Vec<String> {
    let reference = reference.trim();
    let mut candidates = vec![reference.to_string()];
    if let Some(domain) = domain.map(str::trim).filter(|d| !d.is_empty()) {
        if let Some(stripped) = reference.strip_suffix(&format!("-{domain}")) {
            if !stripped.is_empty() {
                candidates.push(stripped.to_string());
            }
        }
    }
    candidates
}

pub struct LayerResolver {
    specs: Arc<dyn SpecStore>,
}

impl LayerResolver {
    pub fn new(specs: Arc<dyn SpecStore>) -> Self {
        Self { specs }
    }

    /// Look a spec up by id, falling back to slug.
    pub async fn find_spec(&self, reference: &str) -> Result<Option<Specification>> {
        if let Some(spec) = self.specs.get_spec(reference).await? {
            return Ok(Some(spec));
        }
        Ok(self.specs.get_spec_by_slug(reference).await?)
    }

    /// Resolve the archetype an active overlay extends.
    pub async fn resolve_base(&self, overlay: &Specification) -> Result<Specification> {
        let Some(reference) = overlay.extends_archetype.as_deref().filter(|_| overlay.is_overlay())
        else {
            return Err(Error::invalid_state(
                "specification",
                &overlay.id,
                "not an overlay (no extendsArchetype)",
            ));
        };

        let mut base = None;
        for candidate in base_slug_candidates(reference, overlay.domain.as_deref()) {
            if let Some(spec) = self.find_spec(&candidate).await? {
                base = Some(spec);
                break;
            }
        }
        let base = base.ok_or_else(|| Error::not_found("archetype", reference))?;

        if base.id == overlay.id {
            return Err(Error::invalid_state(
                "specification",
                &overlay.id,
                "extends itself",
            ));
        }
        if !base.is_active {
            return Err(Error::invalid_state("archetype", &base.id, "inactive"));
        }
        if base.role != overlay.role {
            return Err(Error::invalid_state(
                "archetype",
                &base.id,
                format!(
                    "role {} does not match overlay role {}",
                    base.role, overlay.role
                ),
            ));
        }
        debug!(overlay = %overlay.slug, base = %base.slug, "Resolved archetype");
        Ok(base)
    }

    /// `computeLayerDiff(overlaySpecId)`.
    pub async fn compute_layer_diff(&self, overlay_id: &str) -> Result<LayerDiff> {
        let overlay = self
            .find_spec(overlay_id)
            .await?
            .ok_or_else(|| Error::not_found("specification", overlay_id))?;
        if !overlay.is_active {
            return Err(Error::invalid_state("specification", &overlay.id, "inactive"));
        }
        let base = self.resolve_base(&overlay).await?;

        let fields = diff_objects(&config_object(&base)?, &config_object(&overlay)?);
        Ok(LayerDiff {
            overlay_id: overlay.id,
            overlay_slug: overlay.slug,
            base_id: base.id,
            base_slug: base.slug,
            fields,
        })
    }

    /// Merge the spec's config over its whole archetype chain.
    pub async fn effective_config(&self, spec: &Specification) -> Result<EffectiveConfig> {
        let mut layers = vec![spec.clone()];
        let mut seen: HashSet<String> = HashSet::from([spec.id.clone()]);

        while let Some(top) = layers.last().filter(|s| s.is_overlay()) {
            if layers.len() > MAX_ARCHETYPE_DEPTH {
                return Err(Error::invalid_state(
                    "specification",
                    &spec.id,
                    format!("archetype chain deeper than {MAX_ARCHETYPE_DEPTH}"),
                ));
            }
            let base = self.resolve_base(top).await?;
            if !seen.insert(base.id.clone()) {
                return Err(Error::invalid_state(
                    "specification",
                    &spec.id,
                    format!("archetype cycle through '{}'", base.slug),
                ));
            }
            layers.push(base);
        }

        let chain = layers.iter().map(|s| s.slug.clone()).collect();
        let config = layers
            .iter()
            .rev()
            .fold(Value::Object(Map::new()), |acc, layer| deep_merge(&acc, &layer.config));
        Ok(EffectiveConfig { config, chain })
    }
}

fn config_object(spec: &Specification) -> Result<Map<String, Value>> {
    match &spec.config {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        _ => Err(Error::invalid_state(
            "specification",
            &spec.id,
            "config is not an object",
        )),
    }
}

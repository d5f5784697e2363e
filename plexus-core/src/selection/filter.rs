//! Capability filters applied before any strategy narrows the candidates

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use plexus_plugin_api::CapabilityDescriptor;

use crate::error::{BoxError, SelectionError, panic_message};
use crate::providers::Registration;

type PredicateFn = dyn Fn(&CapabilityDescriptor) -> Result<bool, BoxError> + Send + Sync;

/// A caller-supplied check against a provider's capabilities.
///
/// Clones share the check and count as the same predicate in cache keys;
/// separately constructed predicates never do, even under the same name.
#[derive(Clone)]
pub struct MetadataPredicate {
    name: String,
    check: Arc<PredicateFn>,
}

impl MetadataPredicate {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&CapabilityDescriptor) -> Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name plus the identity of the shared check
    fn identity(&self) -> String {
        format!("{}@{:p}", self.name, Arc::as_ptr(&self.check).cast::<()>())
    }

    fn evaluate(&self, capabilities: &CapabilityDescriptor) -> Result<bool, SelectionError> {
        match catch_unwind(AssertUnwindSafe(|| (self.check)(capabilities))) {
            Ok(Ok(matched)) => Ok(matched),
            Ok(Err(e)) => Err(SelectionError::InvalidFilterCriteria {
                predicate: self.name.clone(),
                reason: e.to_string(),
            }),
            Err(panic) => Err(SelectionError::InvalidFilterCriteria {
                predicate: self.name.clone(),
                reason: format!("predicate panicked: {}", panic_message(&*panic)),
            }),
        }
    }
}

impl fmt::Debug for MetadataPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetadataPredicate").field(&self.name).finish()
    }
}

/// Capability match criteria: platform tags the provider must carry,
/// metadata values it must have, and arbitrary predicates.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    required_tags: BTreeSet<String>,
    required_metadata: BTreeMap<String, serde_json::Value>,
    predicates: Vec<MetadataPredicate>,
}

impl SelectionFilter {
    /// A filter that matches every provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: require a platform tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    /// Builder: require several platform tags
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.required_tags.extend(tags);
        self
    }

    /// Builder: require `metadata[key] == value`
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.required_metadata.insert(key.into(), value.into());
        self
    }

    /// Builder: require a predicate to hold
    pub fn with_predicate(mut self, predicate: MetadataPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Combine two filters; a provider must satisfy both
    pub fn merged(&self, other: &SelectionFilter) -> SelectionFilter {
        let mut merged = self.clone();
        merged
            .required_tags
            .extend(other.required_tags.iter().cloned());
        merged.required_metadata.extend(
            other
                .required_metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged.predicates.extend(other.predicates.iter().cloned());
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.required_tags.is_empty()
            && self.required_metadata.is_empty()
            && self.predicates.is_empty()
    }

    /// Whether `capabilities` satisfies every criterion.
    ///
    /// Fails only if a predicate itself errors or panics.
    pub fn matches(&self, capabilities: &CapabilityDescriptor) -> Result<bool, SelectionError> {
        if !capabilities.has_tags(&self.required_tags) {
            return Ok(false);
        }
        let metadata_ok = self
            .required_metadata
            .iter()
            .all(|(key, value)| capabilities.metadata.get(key) == Some(value));
        if !metadata_ok {
            return Ok(false);
        }
        for predicate in &self.predicates {
            if !predicate.evaluate(capabilities)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Registrations that satisfy the filter, in their original order
    pub fn apply<'a, C: ?Sized>(
        &self,
        registrations: &'a [Registration<C>],
    ) -> Result<Vec<&'a Registration<C>>, SelectionError> {
        let mut survivors = Vec::with_capacity(registrations.len());
        for registration in registrations {
            if self.matches(registration.capabilities())? {
                survivors.push(registration);
            }
        }
        Ok(survivors)
    }

    /// Canonical serialized form, used as part of cache keys.
    ///
    /// Tags and metadata are sorted; predicates keep their order and are
    /// keyed by identity, so only clones of one predicate share an entry.
    pub fn cache_key(&self) -> String {
        let predicates: Vec<String> = self.predicates.iter().map(|p| p.identity()).collect();
        serde_json::json!({
            "tags": self.required_tags,
            "metadata": self.required_metadata,
            "predicates": predicates,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(id: &str) -> CapabilityDescriptor {
        CapabilityDescriptor::new(id)
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SelectionFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&caps("a")).unwrap());
    }

    #[test]
    fn tags_must_be_a_subset() {
        let filter = SelectionFilter::new().with_tag("linux");
        assert!(filter.matches(&caps("a").with_tag("linux").with_tag("arm")).unwrap());
        assert!(!filter.matches(&caps("b").with_tag("windows")).unwrap());
    }

    #[test]
    fn metadata_must_match_exactly() {
        let filter = SelectionFilter::new().with_metadata("region", "eu");
        assert!(filter.matches(&caps("a").with_metadata("region", "eu")).unwrap());
        assert!(!filter.matches(&caps("b").with_metadata("region", "us")).unwrap());
        assert!(!filter.matches(&caps("c")).unwrap());
    }

    #[test]
    fn predicate_errors_become_invalid_filter_criteria() {
        let filter = SelectionFilter::new().with_predicate(MetadataPredicate::new(
            "explodes",
            |_| Err("bad input".into()),
        ));
        let err = filter.matches(&caps("a")).unwrap_err();
        assert!(matches!(
            err,
            SelectionError::InvalidFilterCriteria { ref predicate, ref reason }
                if predicate == "explodes" && reason == "bad input"
        ));
    }

    #[test]
    fn predicate_panics_become_invalid_filter_criteria() {
        let filter = SelectionFilter::new()
            .with_predicate(MetadataPredicate::new("panics", |_| panic!("oops")));
        let err = filter.matches(&caps("a")).unwrap_err();
        assert!(err.to_string().contains("predicate panicked: oops"));
    }

    #[test]
    fn cache_key_tells_same_named_predicates_apart() {
        let eu = MetadataPredicate::new("region", |c: &CapabilityDescriptor| {
            Ok(c.metadata.get("region").and_then(|v| v.as_str()) == Some("eu"))
        });
        let us = MetadataPredicate::new("region", |c: &CapabilityDescriptor| {
            Ok(c.metadata.get("region").and_then(|v| v.as_str()) == Some("us"))
        });

        let with_eu = SelectionFilter::new().with_predicate(eu.clone());
        let with_us = SelectionFilter::new().with_predicate(us);
        assert_ne!(with_eu.cache_key(), with_us.cache_key());

        // Clones share the check and the cache entry
        let again = SelectionFilter::new().with_predicate(eu);
        assert_eq!(with_eu.cache_key(), again.cache_key());
    }

    #[test]
    fn cache_key_is_order_independent_for_tags() {
        let a = SelectionFilter::new().with_tag("x").with_tag("y");
        let b = SelectionFilter::new().with_tag("y").with_tag("x");
        assert_eq!(a.cache_key(), b.cache_key());

        let c = SelectionFilter::new().with_tag("x");
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn merged_requires_both() {
        let merged = SelectionFilter::new()
            .with_tag("linux")
            .merged(&SelectionFilter::new().with_metadata("tier", 1));
        assert!(
            merged
                .matches(&caps("a").with_tag("linux").with_metadata("tier", 1))
                .unwrap()
        );
        assert!(!merged.matches(&caps("b").with_tag("linux")).unwrap());
    }
}

//! Core types shared by the catalog, quota tracker and conversations.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A (provider, model) pair, written `provider/model`.
///
/// # Examples
///
/// ```
/// use switchboard_gateway::ModelTarget;
///
/// let target = ModelTarget::new("ollama", "llama3:latest");
/// assert_eq!(target.to_string(), "ollama/llama3:latest");
/// assert_eq!(ModelTarget::parse("ollama/llama3:latest"), Some(target));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelTarget {
    /// Create a new target from provider and model ids.
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parse `provider/model`. The model part may itself contain `/` or `:`.
    pub fn parse(s: &str) -> Option<Self> {
        let (provider, model) = s.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Billing tier of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Paid,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Paid => write!(f, "paid"),
        }
    }
}

/// Freshness of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Returned by the most recent successful fetch.
    Listed,
    /// Kept from an earlier fetch because the latest refresh failed.
    Stale,
    /// The provider is unreachable and nothing was ever fetched.
    Unavailable,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Listed => write!(f, "listed"),
            Availability::Stale => write!(f, "stale"),
            Availability::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A model exposed by one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Model id as the provider names it.
    pub id: String,
    /// Owning provider.
    pub provider_id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Maximum context window size in tokens.
    pub context_window_tokens: u32,
    /// Billing tier used for quota accounting.
    pub tier: Tier,
    /// Capability tags such as `chat`, `vision` or `tools`.
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// Freshness marker.
    pub availability: Availability,
}

impl Model {
    /// Create a new model builder.
    pub fn builder(provider_id: &str, id: &str) -> ModelBuilder {
        ModelBuilder::new(provider_id, id)
    }

    /// The (provider, model) pair addressing this model.
    pub fn target(&self) -> ModelTarget {
        ModelTarget::new(&self.provider_id, &self.id)
    }

    /// Whether the model carries every tag in `tags`.
    pub fn has_tags<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> bool {
        tags.into_iter().all(|t| self.capability_tags.contains(t))
    }
}

/// Builder for constructing a [`Model`].
#[derive(Debug)]
pub struct ModelBuilder {
    provider_id: String,
    id: String,
    display_name: Option<String>,
    context_window_tokens: u32,
    tier: Tier,
    capability_tags: BTreeSet<String>,
    availability: Availability,
}

impl ModelBuilder {
    fn new(provider_id: &str, id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            id: id.to_string(),
            display_name: None,
            context_window_tokens: 4096,
            tier: Tier::Paid,
            capability_tags: BTreeSet::new(),
            availability: Availability::Listed,
        }
    }

    /// Set the display name (defaults to the id).
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the context window size.
    pub fn context_window(mut self, tokens: u32) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    /// Set the billing tier.
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Add a capability tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.insert(tag.into());
        self
    }

    /// Set the availability marker.
    pub fn availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    /// Build the `Model`.
    pub fn build(self) -> Model {
        Model {
            display_name: self.display_name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            provider_id: self.provider_id,
            context_window_tokens: self.context_window_tokens,
            tier: self.tier,
            capability_tags: self.capability_tags,
            availability: self.availability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_target_parse_splits_on_first_slash() {
        let target = ModelTarget::parse("openrouter/meta-llama/llama-3-70b").unwrap();
        assert_eq!(target.provider_id, "openrouter");
        assert_eq!(target.model_id, "meta-llama/llama-3-70b");
    }

    #[test]
    fn model_target_parse_rejects_missing_parts() {
        assert!(ModelTarget::parse("invalid").is_none());
        assert!(ModelTarget::parse("/model").is_none());
        assert!(ModelTarget::parse("provider/").is_none());
    }

    #[test]
    fn tier_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Paid).unwrap(), "\"paid\"");
        let tier: Tier = serde_json::from_str("\"free\"").unwrap();
        assert_eq!(tier, Tier::Free);
    }

    #[test]
    fn model_builder_defaults_display_name_to_id() {
        let model = Model::builder("acme", "acme-large")
            .context_window(200_000)
            .tier(Tier::Free)
            .tag("chat")
            .tag("vision")
            .build();

        assert_eq!(model.display_name, "acme-large");
        assert_eq!(model.target(), ModelTarget::new("acme", "acme-large"));
        assert_eq!(model.availability, Availability::Listed);
        assert!(model.has_tags(["chat", "vision"]));
        assert!(!model.has_tags(["tools"]));
    }

    #[test]
    fn capability_tags_serialize_in_sorted_order() {
        let model = Model::builder("acme", "m").tag("vision").tag("chat").build();
        let json = serde_json::to_string(&model).unwrap();
        assert!(json.contains("\"capability_tags\":[\"chat\",\"vision\"]"));
    }
}

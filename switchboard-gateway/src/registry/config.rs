//! Provider configuration records.
//!
//! These are the user-authored records persisted in `providers.toml`. Each
//! record declares how the provider wants to be authenticated and which wire
//! shape it speaks; the adapter dispatches on both.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::Tier;
use crate::{Error, Result};

/// How the secret is attached to an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <secret>`
    BearerHeader,
    /// `<auth_header_name>: <secret>` with no prefix
    NamedHeader,
    /// `?<auth_header_name>=<secret>` appended to the URL
    QueryParam,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::BearerHeader => write!(f, "bearer-header"),
            AuthScheme::NamedHeader => write!(f, "named-header"),
            AuthScheme::QueryParam => write!(f, "query-param"),
        }
    }
}

/// Wire dialect spoken by a provider, for both chat and model listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseShape {
    /// `POST /chat/completions` answering `{"choices": [{"message": ..}]}`,
    /// paginated `GET /models`.
    #[default]
    ChatMessageArray,
    /// `POST /api/chat` answering a single `{"message": ..}` object,
    /// `GET /api/tags`.
    SingleCompletionObject,
}

impl fmt::Display for ResponseShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseShape::ChatMessageArray => write!(f, "chat-message-array"),
            ResponseShape::SingleCompletionObject => write!(f, "single-completion-object"),
        }
    }
}

/// When a quota window starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResetPolicy {
    /// 24 hours after the window opened.
    #[serde(rename = "rolling-24h")]
    #[default]
    Rolling24h,
    /// At local midnight.
    #[serde(rename = "calendar-day")]
    CalendarDay,
    /// Never; the limit is a lifetime budget.
    #[serde(rename = "none")]
    None,
}

impl fmt::Display for ResetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetPolicy::Rolling24h => write!(f, "rolling-24h"),
            ResetPolicy::CalendarDay => write!(f, "calendar-day"),
            ResetPolicy::None => write!(f, "none"),
        }
    }
}

/// Whether quota exhaustion may switch to a fallback model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Substitute the configured fallback and record it on the message.
    #[default]
    Automatic,
    /// Ignore fallback entries and deny once the limit is reached.
    Disabled,
}

/// Usage limit for one tier of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub tier: Tier,
    pub limit: u32,
    #[serde(default)]
    pub window_policy: ResetPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model_id: Option<String>,
}

impl TierLimit {
    pub fn new(tier: Tier, limit: u32, window_policy: ResetPolicy) -> Self {
        Self {
            tier,
            limit,
            window_policy,
            fallback_model_id: None,
        }
    }

    pub fn with_fallback(mut self, model_id: impl Into<String>) -> Self {
        self.fallback_model_id = Some(model_id.into());
        self
    }
}

/// Health of a provider as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    #[default]
    Unverified,
    Healthy,
    Unreachable,
    Unauthorized,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderStatus::Unverified => write!(f, "unverified"),
            ProviderStatus::Healthy => write!(f, "healthy"),
            ProviderStatus::Unreachable => write!(f, "unreachable"),
            ProviderStatus::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

fn default_tier() -> Tier {
    Tier::Paid
}

/// A provider configuration record as the user writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub auth_scheme: AuthScheme,
    pub auth_header_name: String,
    #[serde(default)]
    pub response_shape: ResponseShape,
    #[serde(default = "default_tier")]
    pub default_tier: Tier,
    /// Per-model tier overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_tiers: BTreeMap<String, Tier>,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    #[serde(default, alias = "tier-limits", skip_serializing_if = "Vec::is_empty")]
    pub tier_limits: Vec<TierLimit>,
}

impl ProviderConfig {
    /// Create a record with the required fields; everything else defaulted.
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        auth_scheme: AuthScheme,
        auth_header_name: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            base_url: base_url.into(),
            auth_scheme,
            auth_header_name: auth_header_name.into(),
            response_shape: ResponseShape::default(),
            default_tier: default_tier(),
            model_tiers: BTreeMap::new(),
            fallback_policy: FallbackPolicy::default(),
            tier_limits: Vec::new(),
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn response_shape(mut self, shape: ResponseShape) -> Self {
        self.response_shape = shape;
        self
    }

    pub fn default_tier(mut self, tier: Tier) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn model_tier(mut self, model_id: impl Into<String>, tier: Tier) -> Self {
        self.model_tiers.insert(model_id.into(), tier);
        self
    }

    pub fn fallback_policy(mut self, policy: FallbackPolicy) -> Self {
        self.fallback_policy = policy;
        self
    }

    pub fn tier_limit(mut self, limit: TierLimit) -> Self {
        self.tier_limits.push(limit);
        self
    }

    /// Tier a model is billed under.
    pub fn tier_for(&self, model_id: &str) -> Tier {
        self.model_tiers
            .get(model_id)
            .copied()
            .unwrap_or(self.default_tier)
    }

    /// Parsed base URL. Only valid after [`validate`](Self::validate).
    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| Error::invalid_config(Some(&self.id), "base_url", e.to_string()))
    }

    /// Check every field a registry insert depends on.
    pub fn validate(&self) -> Result<()> {
        let id = Some(self.id.as_str());

        if self.id.is_empty() {
            return Err(Error::invalid_config(None, "id", "must not be empty"));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::invalid_config(
                id,
                "id",
                "only lowercase letters, digits, '-' and '_' are allowed",
            ));
        }

        let url = self.url()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::invalid_config(
                id,
                "base_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_config(id, "base_url", "missing host"));
        }

        if self.auth_header_name.trim().is_empty() {
            return Err(Error::invalid_config(
                id,
                "auth_header_name",
                "must not be empty",
            ));
        }
        if matches!(
            self.auth_scheme,
            AuthScheme::BearerHeader | AuthScheme::NamedHeader
        ) && reqwest::header::HeaderName::from_bytes(self.auth_header_name.as_bytes()).is_err()
        {
            return Err(Error::invalid_config(
                id,
                "auth_header_name",
                format!("'{}' is not a valid header name", self.auth_header_name),
            ));
        }

        let mut seen = BTreeSet::new();
        for limit in &self.tier_limits {
            if !seen.insert(limit.tier) {
                return Err(Error::invalid_config(
                    id,
                    "tier_limits",
                    format!("duplicate entry for {} tier", limit.tier),
                ));
            }
            if limit
                .fallback_model_id
                .as_deref()
                .is_some_and(|m| m.trim().is_empty())
            {
                return Err(Error::invalid_config(
                    id,
                    "tier_limits.fallback_model_id",
                    "must not be empty",
                ));
            }
        }

        Ok(())
    }
}

/// A registered provider: its record plus observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(flatten)]
    pub config: ProviderConfig,
    #[serde(default)]
    pub status: ProviderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_checked_at: Option<DateTime<Utc>>,
}

impl Provider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            status: ProviderStatus::Unverified,
            status_checked_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ProviderConfig {
        ProviderConfig::new(
            "acme",
            "https://api.acme.test/v1",
            AuthScheme::NamedHeader,
            "x-api-key",
        )
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn malformed_base_url_names_the_field() {
        let mut config = valid();
        config.base_url = "not a url".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                field: "base_url",
                ..
            }
        ));
    }

    #[test]
    fn non_http_scheme_rejected() {
        let mut config = valid();
        config.base_url = "ftp://files.acme.test".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_header_name_rejected() {
        let mut config = valid();
        config.auth_header_name = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                field: "auth_header_name",
                ..
            }
        ));
    }

    #[test]
    fn header_name_with_spaces_rejected_for_header_schemes() {
        let mut config = valid();
        config.auth_header_name = "x api key".to_string();
        assert!(config.validate().is_err());

        config.auth_scheme = AuthScheme::QueryParam;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn uppercase_id_rejected() {
        let mut config = valid();
        config.id = "Acme".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_tier_limits_rejected() {
        let config = valid()
            .tier_limit(TierLimit::new(Tier::Paid, 10, ResetPolicy::Rolling24h))
            .tier_limit(TierLimit::new(Tier::Paid, 20, ResetPolicy::None));
        assert!(config.validate().is_err());
    }

    #[test]
    fn tier_for_uses_override_then_default() {
        let config = valid().default_tier(Tier::Paid).model_tier("acme-mini", Tier::Free);
        assert_eq!(config.tier_for("acme-mini"), Tier::Free);
        assert_eq!(config.tier_for("acme-large"), Tier::Paid);
    }

    #[test]
    fn config_parses_from_toml_with_kebab_values() {
        let toml_str = r#"
id = "gem"
display_name = "Gem"
base_url = "https://gem.test"
auth_scheme = "query-param"
auth_header_name = "key"
response_shape = "single-completion-object"

[[tier-limits]]
tier = "paid"
limit = 50
window_policy = "calendar-day"
fallback_model_id = "gem-mini"
"#;
        let config: ProviderConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.auth_scheme, AuthScheme::QueryParam);
        assert_eq!(config.response_shape, ResponseShape::SingleCompletionObject);
        assert_eq!(config.tier_limits.len(), 1);
        assert_eq!(config.tier_limits[0].window_policy, ResetPolicy::CalendarDay);
        assert_eq!(
            config.tier_limits[0].fallback_model_id.as_deref(),
            Some("gem-mini")
        );
        assert_eq!(config.fallback_policy, FallbackPolicy::Automatic);
    }

    #[test]
    fn provider_record_round_trips_through_toml() {
        let mut provider = Provider::new(
            valid().tier_limit(TierLimit::new(Tier::Free, 5, ResetPolicy::None)),
        );
        provider.status = ProviderStatus::Healthy;

        let text = toml::to_string(&provider).unwrap();
        assert!(text.contains("status = \"healthy\""));
        assert!(text.contains("auth_scheme = \"named-header\""));

        let parsed: Provider = toml::from_str(&text).unwrap();
        assert_eq!(parsed, provider);
    }
}

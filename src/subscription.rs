//! Listener subscriptions.
//!
//! A `SubscriptionSpec` is the wire payload an external listener process sends
//! to register itself. It is validated once, at registration time, into a
//! `Subscription` carrying a compiled pattern. Structural errors reject the
//! registration; pattern configuration errors are kept on the subscription so
//! that it never matches until it is re-registered.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::hub::matcher::CompiledPattern;

/// Maximum length of identifiers (listener, callback, role and channel ids).
pub const MAX_ID_LEN: usize = 256;

/// Maximum length of a pattern value.
pub const MAX_PATTERN_VALUE_LEN: usize = 4096;

/// Externally supplied, unique listener identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(String);

impl ListenerId {
    /// Wraps a listener id, rejecting empty or oversized ids.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyListenerId);
        }
        check_len("listener_id", &id, MAX_ID_LEN)?;
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a subscription's value is matched against message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// The hub's own account is mentioned.
    #[serde(alias = "botMention", alias = "bot_mention")]
    Mention,
    /// Content starts with the value.
    #[serde(alias = "start")]
    Prefix,
    /// Content ends with the value.
    #[serde(alias = "end")]
    Suffix,
    /// Content contains the value.
    #[serde(alias = "contain")]
    Contains,
    /// The value is a raw regular expression.
    Regex,
    /// Every message.
    #[serde(alias = "every")]
    Any,
}

impl PatternKind {
    /// Kinds that need a literal or regex value.
    #[must_use]
    pub const fn requires_value(self) -> bool {
        !matches!(self, Self::Mention | Self::Any)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Contains => "contains",
            Self::Regex => "regex",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matching parameters of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerParameters {
    pub pattern: PatternKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, alias = "caseSensitive")]
    pub case_sensitive: bool,
    /// Empty means no role restriction.
    #[serde(default, alias = "roleIds", alias = "role_ids")]
    pub allowed_role_ids: BTreeSet<String>,
    /// Empty means no channel restriction.
    #[serde(default, alias = "channelIds", alias = "channel_ids")]
    pub allowed_channel_ids: BTreeSet<String>,
}

impl ListenerParameters {
    /// Parameters for `pattern` with the given value and no filters.
    #[must_use]
    pub fn new(pattern: PatternKind, value: Option<&str>) -> Self {
        Self {
            pattern,
            value: value.map(str::to_string),
            case_sensitive: false,
            allowed_role_ids: BTreeSet::new(),
            allowed_channel_ids: BTreeSet::new(),
        }
    }
}

/// Where matched events for a listener are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// Callback path appended to the base address.
    #[serde(alias = "webhookId", alias = "webhook_id")]
    pub callback_id: String,
    /// Scheme and authority of the receiving service.
    #[serde(alias = "baseUrl", alias = "base_url")]
    pub base_address: String,
}

impl DeliveryTarget {
    /// Validates the target and reduces the base address to scheme + authority.
    ///
    /// A base address without a scheme is treated as `https`. Paths, queries,
    /// fragments and user info are dropped.
    pub fn normalized(callback_id: &str, base_address: &str) -> Result<Self, ValidationError> {
        let callback_id = callback_id.trim().trim_start_matches('/');
        if callback_id.is_empty() {
            return Err(ValidationError::MissingField {
                field: "callback_id".to_string(),
            });
        }
        check_len("callback_id", callback_id, MAX_ID_LEN)?;

        let raw = base_address.trim();
        if raw.is_empty() {
            return Err(ValidationError::MissingField {
                field: "base_address".to_string(),
            });
        }

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };

        let invalid = |reason: String| ValidationError::InvalidBaseAddress {
            address: raw.to_string(),
            reason,
        };

        let url = Url::parse(&with_scheme).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host".to_string()))?;

        let base_address = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };

        Ok(Self {
            callback_id: callback_id.to_string(),
            base_address,
        })
    }

    /// Full delivery URL: `{base_address}/{callback_id}`.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_address.trim_end_matches('/'),
            self.callback_id.trim_start_matches('/')
        )
    }
}

fn default_active() -> bool {
    true
}

/// Registration payload for one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    #[serde(alias = "listenerId", alias = "nodeId")]
    pub listener_id: String,
    pub parameters: ListenerParameters,
    pub delivery: DeliveryTarget,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl SubscriptionSpec {
    /// An active spec with the given parameters.
    #[must_use]
    pub fn new(
        listener_id: impl Into<String>,
        parameters: ListenerParameters,
        delivery: DeliveryTarget,
    ) -> Self {
        Self {
            listener_id: listener_id.into(),
            parameters,
            delivery,
            active: true,
        }
    }
}

/// A validated listener subscription as held by the registry.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub listener_id: ListenerId,
    pub parameters: ListenerParameters,
    pub delivery: DeliveryTarget,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    compiled: CompiledPattern,
}

impl Subscription {
    /// Validates a registration payload and compiles its pattern.
    ///
    /// Returns an error only for structural problems. A missing pattern value or
    /// an invalid regex yields a subscription that never matches; see
    /// [`Subscription::config_error`].
    pub fn from_spec(spec: SubscriptionSpec) -> Result<Self, ValidationError> {
        let listener_id = ListenerId::new(spec.listener_id)?;
        let delivery =
            DeliveryTarget::normalized(&spec.delivery.callback_id, &spec.delivery.base_address)?;

        let mut parameters = spec.parameters;
        if let Some(value) = &parameters.value {
            check_len("value", value, MAX_PATTERN_VALUE_LEN)?;
        }
        parameters.allowed_role_ids = clean_ids("allowed_role_ids", parameters.allowed_role_ids)?;
        parameters.allowed_channel_ids =
            clean_ids("allowed_channel_ids", parameters.allowed_channel_ids)?;

        let compiled = CompiledPattern::compile(
            parameters.pattern,
            parameters.value.as_deref(),
            parameters.case_sensitive,
        )
        .unwrap_or_else(CompiledPattern::Invalid);

        Ok(Self {
            listener_id,
            parameters,
            delivery,
            active: spec.active,
            registered_at: Utc::now(),
            compiled,
        })
    }

    #[must_use]
    pub const fn compiled(&self) -> &CompiledPattern {
        &self.compiled
    }

    /// The pattern configuration error that keeps this subscription from matching.
    #[must_use]
    pub const fn config_error(&self) -> Option<&ValidationError> {
        match &self.compiled {
            CompiledPattern::Invalid(err) => Some(err),
            _ => None,
        }
    }

    /// Converts back into its wire payload.
    #[must_use]
    pub fn to_spec(&self) -> SubscriptionSpec {
        SubscriptionSpec {
            listener_id: self.listener_id.to_string(),
            parameters: self.parameters.clone(),
            delivery: self.delivery.clone(),
            active: self.active,
        }
    }
}

fn check_len(field: &str, value: &str, max_length: usize) -> Result<(), ValidationError> {
    if value.len() > max_length {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length,
        });
    }
    Ok(())
}

// Blank entries would otherwise turn "no restriction" into "never matches".
fn clean_ids(field: &str, ids: BTreeSet<String>) -> Result<BTreeSet<String>, ValidationError> {
    let mut out = BTreeSet::new();
    for id in ids {
        let id = id.trim();
        if id.is_empty() {
            continue;
        }
        check_len(field, id, MAX_ID_LEN)?;
        out.insert(id.to_string());
    }
    Ok(out)
}

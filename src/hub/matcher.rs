//! Subscription matching.
//!
//! Patterns are compiled once when a subscription is registered. Evaluation is a
//! pure function of the compiled subscription, the event and the hub identity.

use regex::{Regex, RegexBuilder};

use crate::error::ValidationError;
use crate::event::Event;
use crate::subscription::{PatternKind, Subscription};

/// Upper bound for the compiled size of a single listener's regex.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A subscription pattern ready for evaluation.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    /// Matches when the hub identity is mentioned.
    Mention,
    /// Matches every event.
    Any,
    /// Anchored or unanchored expression over the content.
    Expression(Regex),
    /// The pattern could not be built; never matches.
    Invalid(ValidationError),
}

impl CompiledPattern {
    /// Builds the matching expression for `kind`.
    ///
    /// Literal values are escaped; `regex` values are used verbatim.
    pub fn compile(
        kind: PatternKind,
        value: Option<&str>,
        case_sensitive: bool,
    ) -> Result<Self, ValidationError> {
        let value = value.filter(|v| !v.is_empty());

        let source = match kind {
            PatternKind::Mention => return Ok(Self::Mention),
            PatternKind::Any => return Ok(Self::Any),
            _ => {
                let Some(value) = value else {
                    return Err(ValidationError::MissingPatternValue {
                        kind: kind.to_string(),
                    });
                };
                match kind {
                    PatternKind::Prefix => format!("^{}", escape_literal(value)),
                    PatternKind::Suffix => format!("{}$", escape_literal(value)),
                    PatternKind::Contains => escape_literal(value),
                    _ => value.to_string(),
                }
            }
        };

        RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map(Self::Expression)
            .map_err(|e| ValidationError::InvalidRegex {
                pattern: source,
                reason: e.to_string(),
            })
    }
}

/// Escapes a literal for use inside a regular expression.
///
/// Every character in `| \ { } ( ) [ ] ^ $ + * ? .` is backslash-escaped and
/// hyphens are written as `\x2d` so they stay literal inside classes.
#[must_use]
pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 2);
    for c in value.chars() {
        match c {
            '|' | '\\' | '{' | '}' | '(' | ')' | '[' | ']' | '^' | '$' | '+' | '*' | '?' | '.' => {
                out.push('\\');
                out.push(c);
            }
            '-' => out.push_str("\\x2d"),
            _ => out.push(c),
        }
    }
    out
}

/// Why a subscription did not match an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Author is a bot or system account.
    AutomatedAuthor,
    /// Subscription is not active.
    Inactive,
    /// Role filter set but the author's roles are unknown.
    RolesUnavailable,
    RoleFilter,
    ChannelFilter,
    /// Mention subscription, hub not mentioned.
    NotMentioned,
    /// Content did not match the expression.
    Pattern,
    /// Subscription carries a pattern configuration error.
    InvalidPattern,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutput {
    Match,
    NoMatch(Rejection),
}

impl MatchOutput {
    #[must_use]
    pub const fn is_match(self) -> bool {
        matches!(self, Self::Match)
    }
}

/// Decides whether `event` should trigger delivery for `sub`.
#[must_use]
pub fn evaluate(sub: &Subscription, event: &Event, hub_identity: &str) -> MatchOutput {
    if event.author.is_automated() {
        return MatchOutput::NoMatch(Rejection::AutomatedAuthor);
    }
    if !sub.active {
        return MatchOutput::NoMatch(Rejection::Inactive);
    }

    let params = &sub.parameters;
    if !params.allowed_role_ids.is_empty() {
        let Some(roles) = &event.author_role_ids else {
            return MatchOutput::NoMatch(Rejection::RolesUnavailable);
        };
        if params.allowed_role_ids.is_disjoint(roles) {
            return MatchOutput::NoMatch(Rejection::RoleFilter);
        }
    }
    if !params.allowed_channel_ids.is_empty() && !params.allowed_channel_ids.contains(&event.channel_id) {
        return MatchOutput::NoMatch(Rejection::ChannelFilter);
    }

    match sub.compiled() {
        CompiledPattern::Mention => {
            if !hub_identity.is_empty() && event.mentions(hub_identity) {
                MatchOutput::Match
            } else {
                MatchOutput::NoMatch(Rejection::NotMentioned)
            }
        }
        CompiledPattern::Any => MatchOutput::Match,
        CompiledPattern::Expression(re) => {
            if re.is_match(&event.content) {
                MatchOutput::Match
            } else {
                MatchOutput::NoMatch(Rejection::Pattern)
            }
        }
        CompiledPattern::Invalid(err) => {
            tracing::debug!(listener_id = %sub.listener_id, error = %err, "skipping listener with invalid pattern");
            MatchOutput::NoMatch(Rejection::InvalidPattern)
        }
    }
}

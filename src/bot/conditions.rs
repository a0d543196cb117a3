// src/bot/conditions.rs - Rule conditions: pure predicates over a trigger

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::bot::rules::RuleContext;
use crate::bot::triggers::Trigger;
use crate::config::{parse_kind_options, ConfigError, DirectiveConfig};

/// Unicode normalization form applied before candidate comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationForm {
    Nfc,
    Nfd,
    Nfkc,
    #[default]
    Nfkd,
}

impl NormalizationForm {
    pub fn apply(&self, text: &str) -> String {
        match self {
            NormalizationForm::Nfc => text.nfc().collect(),
            NormalizationForm::Nfd => text.nfd().collect(),
            NormalizationForm::Nfkc => text.nfkc().collect(),
            NormalizationForm::Nfkd => text.nfkd().collect(),
        }
    }
}

/// A pure predicate over a trigger, configured once at (re)load time.
///
/// Evaluation never fails outward: any error while checking is treated as
/// "no match" and the rule aborts cleanly.
#[derive(Debug, Clone)]
pub enum Condition {
    MessageIsExactly {
        content: String,
        ignore_case: bool,
    },
    MessageStartsWith {
        content: String,
        ignore_case: bool,
    },
    MessageContains {
        content: String,
        ignore_case: bool,
    },
    MessageContainsAnyOf {
        matches: Vec<String>,
        ignore_case: bool,
        normalize_unicode: bool,
        normalization_form: NormalizationForm,
    },
    MessageHasEmbed {
        min_count: u32,
        delay_ms: u64,
    },
    MessageHasAttachment {
        min_count: u32,
        delay_ms: u64,
    },
    MessageHasEmbedOrAttachment {
        min_count: u32,
        delay_ms: u64,
    },
    MessageContainsExternalMedia {
        ignore_links: bool,
        ignore_embeds: bool,
        ignore_attachments: bool,
    },
    ReactionMatches {
        reactions: Vec<String>,
    },
    AuthorIsNotSelf,
    AuthorAccountAge {
        more_than: Option<i64>,
        less_than: Option<i64>,
    },
    AuthorHasBeenMemberFor {
        more_than: Option<i64>,
        less_than: Option<i64>,
    },
    /// Test instrumentation: records every evaluation and returns a fixed
    /// result, so ordering and short-circuit behavior are observable.
    #[cfg(test)]
    Probe {
        result: bool,
        hits: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    },
}

// Per-kind option shapes. Unknown fields are rejected so a typo in a rule
// fails the load instead of silently matching everything.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TextMatchOptions {
    content: String,
    #[serde(default)]
    ignore_case: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnyOfOptions {
    matches: Vec<String>,
    #[serde(default)]
    ignore_case: bool,
    #[serde(default)]
    normalize_unicode: bool,
    #[serde(default)]
    normalization_form: NormalizationForm,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CountedOptions {
    min_count: Option<u32>,
    delay: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExternalMediaOptions {
    #[serde(default)]
    ignore_links: bool,
    #[serde(default)]
    ignore_embeds: bool,
    #[serde(default)]
    ignore_attachments: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReactionOptions {
    reactions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgeOptions {
    more_than: Option<i64>,
    less_than: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyOptions {}

fn counted(
    kind: &str,
    options: &serde_json::Value,
    default_delay_ms: u64,
) -> Result<(u32, u64), ConfigError> {
    let parsed: CountedOptions = parse_kind_options(kind, options)?;
    let min_count = parsed.min_count.unwrap_or(1);
    if min_count == 0 {
        return Err(ConfigError::InvalidOptions {
            kind: kind.to_string(),
            message: "min_count must be at least 1".to_string(),
        });
    }
    Ok((min_count, parsed.delay.unwrap_or(default_delay_ms)))
}

impl Condition {
    /// Construct a condition from its config entry. Performed once per
    /// (re)load; a failure aborts loading the enclosing server's state.
    pub fn from_config(config: &DirectiveConfig) -> Result<Condition, ConfigError> {
        let kind = config.kind.as_str();
        match kind {
            "MESSAGE_IS_EXACTLY" => {
                let opts: TextMatchOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::MessageIsExactly {
                    content: opts.content,
                    ignore_case: opts.ignore_case,
                })
            }
            "MESSAGE_STARTS_WITH" => {
                let opts: TextMatchOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::MessageStartsWith {
                    content: opts.content,
                    ignore_case: opts.ignore_case,
                })
            }
            "MESSAGE_CONTAINS" => {
                let opts: TextMatchOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::MessageContains {
                    content: opts.content,
                    ignore_case: opts.ignore_case,
                })
            }
            "MESSAGE_CONTAINS_ANY_OF" => {
                let opts: AnyOfOptions = parse_kind_options(kind, &config.options)?;
                if opts.matches.is_empty() {
                    return Err(ConfigError::InvalidOptions {
                        kind: kind.to_string(),
                        message: "matches must not be empty".to_string(),
                    });
                }
                Ok(Condition::MessageContainsAnyOf {
                    matches: opts.matches,
                    ignore_case: opts.ignore_case,
                    normalize_unicode: opts.normalize_unicode,
                    normalization_form: opts.normalization_form,
                })
            }
            "MESSAGE_HAS_EMBED" => {
                let (min_count, delay_ms) = counted(kind, &config.options, 2000)?;
                Ok(Condition::MessageHasEmbed { min_count, delay_ms })
            }
            "MESSAGE_HAS_ATTACHMENT" => {
                let (min_count, delay_ms) = counted(kind, &config.options, 0)?;
                Ok(Condition::MessageHasAttachment { min_count, delay_ms })
            }
            "MESSAGE_HAS_EMBED_OR_ATTACHMENT" => {
                let (min_count, delay_ms) = counted(kind, &config.options, 2000)?;
                Ok(Condition::MessageHasEmbedOrAttachment { min_count, delay_ms })
            }
            "MESSAGE_CONTAINS_EXTERNAL_MEDIA" => {
                let opts: ExternalMediaOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::MessageContainsExternalMedia {
                    ignore_links: opts.ignore_links,
                    ignore_embeds: opts.ignore_embeds,
                    ignore_attachments: opts.ignore_attachments,
                })
            }
            "REACTION_MATCHES" => {
                let opts: ReactionOptions = parse_kind_options(kind, &config.options)?;
                if opts.reactions.is_empty() {
                    return Err(ConfigError::InvalidOptions {
                        kind: kind.to_string(),
                        message: "reactions must not be empty".to_string(),
                    });
                }
                Ok(Condition::ReactionMatches {
                    reactions: opts.reactions,
                })
            }
            "AUTHOR_IS_NOT_SELF" => {
                let _: EmptyOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::AuthorIsNotSelf)
            }
            "AUTHOR_ACCOUNT_AGE" => {
                let opts: AgeOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::AuthorAccountAge {
                    more_than: opts.more_than,
                    less_than: opts.less_than,
                })
            }
            "AUTHOR_HAS_BEEN_MEMBER_FOR" => {
                let opts: AgeOptions = parse_kind_options(kind, &config.options)?;
                Ok(Condition::AuthorHasBeenMemberFor {
                    more_than: opts.more_than,
                    less_than: opts.less_than,
                })
            }
            other => Err(ConfigError::UnknownKind {
                family: "condition",
                kind: other.to_string(),
            }),
        }
    }

    /// Evaluate against a trigger. Errors are logged and count as false.
    pub async fn evaluate(&self, trigger: &Trigger, ctx: &RuleContext) -> bool {
        match self.check(trigger, ctx).await {
            Ok(matched) => matched,
            Err(e) => {
                debug!("Condition error treated as no-match: {:#}", e);
                false
            }
        }
    }

    async fn check(&self, trigger: &Trigger, ctx: &RuleContext) -> Result<bool> {
        match self {
            Condition::MessageIsExactly { content, ignore_case } => {
                let body = message_body(trigger)?;
                let (body, content) = folded(&body, content, *ignore_case);
                // Length fast reject, then full equality.
                Ok(body.len() == content.len() && body == content)
            }
            Condition::MessageStartsWith { content, ignore_case } => {
                let body = message_body(trigger)?;
                let (body, content) = folded(&body, content, *ignore_case);
                match (body.chars().next(), content.chars().next()) {
                    (_, None) => Ok(true),
                    (None, Some(_)) => Ok(false),
                    (Some(a), Some(b)) if a != b => Ok(false),
                    _ => Ok(body.starts_with(content.as_str())),
                }
            }
            Condition::MessageContains { content, ignore_case } => {
                let body = message_body(trigger)?;
                let (body, content) = folded(&body, content, *ignore_case);
                if content.len() > body.len() {
                    return Ok(false);
                }
                Ok(body.contains(content.as_str()))
            }
            Condition::MessageContainsAnyOf {
                matches,
                ignore_case,
                normalize_unicode,
                normalization_form,
            } => {
                let mut body = message_body(trigger)?;
                if *normalize_unicode {
                    body = normalization_form.apply(&body);
                }
                if *ignore_case {
                    body = body.to_lowercase();
                }
                for candidate in matches {
                    let mut candidate = candidate.clone();
                    if *normalize_unicode {
                        candidate = normalization_form.apply(&candidate);
                    }
                    if *ignore_case {
                        candidate = candidate.to_lowercase();
                    }
                    if candidate.len() <= body.len() && body.contains(candidate.as_str()) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::MessageHasEmbed { min_count, delay_ms } => {
                let fresh = refreshed_message(trigger, ctx, *delay_ms).await?;
                Ok(fresh.embed_count >= *min_count)
            }
            Condition::MessageHasAttachment { min_count, delay_ms } => {
                let fresh = refreshed_message(trigger, ctx, *delay_ms).await?;
                Ok(fresh.attachment_count >= *min_count)
            }
            Condition::MessageHasEmbedOrAttachment { min_count, delay_ms } => {
                let fresh = refreshed_message(trigger, ctx, *delay_ms).await?;
                Ok(fresh.embed_count + fresh.attachment_count >= *min_count)
            }
            Condition::MessageContainsExternalMedia {
                ignore_links,
                ignore_embeds,
                ignore_attachments,
            } => {
                let message = trigger.message().context("trigger has no message")?;
                let mut found = false;
                if !ignore_links {
                    found |= contains_link(&message.content);
                }
                if !ignore_embeds {
                    found |= message.embed_count > 0;
                }
                if !ignore_attachments {
                    found |= message.attachment_count > 0;
                }
                Ok(found)
            }
            Condition::ReactionMatches { reactions } => {
                let reaction = trigger.reaction().context("trigger has no reaction")?;
                Ok(reactions.iter().any(|r| r == &reaction.emoji))
            }
            Condition::AuthorIsNotSelf => {
                let actor = trigger.actor().context("trigger has no actor")?;
                Ok(actor.id != ctx.bot.id)
            }
            Condition::AuthorAccountAge { more_than, less_than } => {
                let actor = trigger.actor().context("trigger has no actor")?;
                let Some(created_at) = actor.created_at else {
                    return Ok(false);
                };
                Ok(age_within(Utc::now() - created_at, *more_than, *less_than))
            }
            Condition::AuthorHasBeenMemberFor { more_than, less_than } => {
                let member = trigger.member().context("trigger has no member")?;
                let Some(joined_at) = member.joined_at else {
                    return Ok(false);
                };
                Ok(age_within(Utc::now() - joined_at, *more_than, *less_than))
            }
            #[cfg(test)]
            Condition::Probe { result, hits } => {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(*result)
            }
        }
    }
}

fn message_body(trigger: &Trigger) -> Result<String> {
    Ok(trigger
        .message()
        .context("trigger has no message")?
        .content
        .clone())
}

fn folded(body: &str, candidate: &str, ignore_case: bool) -> (String, String) {
    if ignore_case {
        (body.to_lowercase(), candidate.to_lowercase())
    } else {
        (body.to_string(), candidate.to_string())
    }
}

fn age_within(age: Duration, more_than: Option<i64>, less_than: Option<i64>) -> bool {
    if let Some(seconds) = more_than {
        if age <= Duration::seconds(seconds) {
            return false;
        }
    }
    if let Some(seconds) = less_than {
        if age >= Duration::seconds(seconds) {
            return false;
        }
    }
    true
}

/// Whitespace-delimited token that parses as an http(s) URL.
fn contains_link(content: &str) -> bool {
    content.split_whitespace().any(|token| {
        (token.starts_with("http://") || token.starts_with("https://"))
            && url::Url::parse(token).is_ok()
    })
}

/// Suspend for the configured delay, then re-fetch the message so embed
/// metadata the platform resolved after delivery is visible.
async fn refreshed_message(
    trigger: &Trigger,
    ctx: &RuleContext,
    delay_ms: u64,
) -> Result<crate::types::ChatMessage> {
    let message = trigger.message().context("trigger has no message")?;
    if delay_ms > 0 {
        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
    }
    Ok(ctx
        .platform
        .fetch_message(message.channel_id, message.id)
        .await?)
}

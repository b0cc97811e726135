//! Rule engine over profile properties
//!
//! Rule sets are data (JSON or YAML via serde); property access is NOT
//! reflective. Every dotted property path is resolved against a fixed,
//! enumerated table when the rule set is compiled; an unknown path fails
//! compilation with a `Policy` error and can never fail evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cutover_core::domain::classification::Classification;
use cutover_core::domain::profile::{ProfileMetrics, UserProfile};
use cutover_core::ServiceError;

// ============================================================================
// Rule set data model
// ============================================================================

/// How a rule combines its conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    /// Every condition must match
    And,
    /// At least one condition must match
    Or,
    /// No condition may match
    Not,
    /// Weighted sum of matching conditions must reach the threshold
    Weighted,
}

/// Comparison operator of one condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn needs_value(&self) -> bool {
        !matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

fn default_weight() -> f64 {
    1.0
}

/// One property comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted property path (`profile.*`, `metrics.*`, or a derived field)
    pub property: String,
    /// Comparison operator
    pub operator: Operator,
    /// Right-hand value; absent for `isNull` / `isNotNull`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Weight under the `weighted` combinator
    #[serde(default = "default_weight")]
    pub weight: f64,
}

/// One classification rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule name, used in reasons and logs
    pub name: String,
    /// Evaluation priority; higher runs first
    pub priority: i32,
    /// Condition combinator
    pub combinator: Combinator,
    /// Threshold in `[0, 1]`; required by `weighted`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Conditions
    pub conditions: Vec<Condition>,
    /// Classification chosen when the rule matches
    pub classification: Classification,
    /// Reason recorded with the decision; defaults to the rule name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// A matching rule with this flag logs its match but does not decide
    #[serde(default)]
    pub continue_on_match: bool,
}

/// An ordered set of rules with a default outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Rule set name
    pub name: String,
    /// Rule set version string
    pub version: String,
    /// Outcome when no rule decides
    pub default_classification: Classification,
    /// Rules in any order; evaluation sorts by descending priority
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// A conservative built-in rule set used when none is configured
    ///
    /// Recent login or a live session makes a user Active; a profile with
    /// no login for 90 days is Inactive; everything else falls through to
    /// Unknown.
    pub fn builtin() -> Self {
        Self {
            name: "builtin".to_string(),
            version: "1".to_string(),
            default_classification: Classification::Unknown,
            rules: vec![
                Rule {
                    name: "live-session".to_string(),
                    priority: 100,
                    combinator: Combinator::Or,
                    threshold: None,
                    conditions: vec![
                        Condition {
                            property: "metrics.hasActiveSession".to_string(),
                            operator: Operator::Eq,
                            value: Some(serde_json::json!(true)),
                            weight: 1.0,
                        },
                        Condition {
                            property: "metrics.isLoaded".to_string(),
                            operator: Operator::Eq,
                            value: Some(serde_json::json!(true)),
                            weight: 1.0,
                        },
                    ],
                    classification: Classification::Active,
                    reason: Some("user has a live session".to_string()),
                    continue_on_match: false,
                },
                Rule {
                    name: "recent-login".to_string(),
                    priority: 90,
                    combinator: Combinator::And,
                    threshold: None,
                    conditions: vec![Condition {
                        property: "daysSinceLogin".to_string(),
                        operator: Operator::Le,
                        value: Some(serde_json::json!(30)),
                        weight: 1.0,
                    }],
                    classification: Classification::Active,
                    reason: Some("logged in within 30 days".to_string()),
                    continue_on_match: false,
                },
                Rule {
                    name: "dormant".to_string(),
                    priority: 10,
                    combinator: Combinator::Or,
                    threshold: None,
                    conditions: vec![
                        Condition {
                            property: "daysSinceLogin".to_string(),
                            operator: Operator::Gt,
                            value: Some(serde_json::json!(90)),
                            weight: 1.0,
                        },
                        Condition {
                            property: "profile.lastLogin".to_string(),
                            operator: Operator::IsNull,
                            value: None,
                            weight: 1.0,
                        },
                    ],
                    classification: Classification::Inactive,
                    reason: Some("no login for 90 days".to_string()),
                    continue_on_match: false,
                },
            ],
        }
    }
}

// ============================================================================
// Property table
// ============================================================================

/// What the rule engine evaluates against
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// The profile being classified
    pub profile: &'a UserProfile,
    /// Its freshly gathered metrics
    pub metrics: &'a ProfileMetrics,
    /// Informational activity score
    pub activity_score: u8,
    /// Evaluation time (derived day counts use this)
    pub now: DateTime<Utc>,
}

/// A property value pulled out of the context
#[derive(Debug, Clone, PartialEq)]
enum PropertyValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Null,
}

type Extractor = fn(&EvalContext<'_>) -> PropertyValue;

fn opt_time(value: Option<DateTime<Utc>>) -> PropertyValue {
    value.map_or(PropertyValue::Null, PropertyValue::Time)
}

fn opt_days(value: Option<i64>) -> PropertyValue {
    value.map_or(PropertyValue::Null, PropertyValue::Int)
}

/// The fixed table of dotted property paths
///
/// Extending the rule vocabulary means adding a row here; rule sets can
/// never reach anything that is not listed.
fn resolve_property(path: &str) -> Option<Extractor> {
    Some(match path {
        "profile.userName" => |c| PropertyValue::Str(c.profile.user_name.clone()),
        "profile.profilePath" => |c| PropertyValue::Str(c.profile.profile_path.clone()),
        "profile.profileType" => {
            |c| PropertyValue::Str(c.profile.profile_type.as_str().to_string())
        }
        "profile.profileSizeBytes" => |c| PropertyValue::Int(c.profile.profile_size_bytes as i64),
        "profile.lastLogin" => |c| opt_time(c.profile.last_login),
        "metrics.profileSizeBytes" => |c| PropertyValue::Int(c.metrics.profile_size_bytes as i64),
        "metrics.lastActivity" => |c| opt_time(c.metrics.last_activity),
        "metrics.lastLogin" => |c| opt_time(c.metrics.last_login),
        "metrics.activeProcessCount" => {
            |c| PropertyValue::Int(c.metrics.active_process_count as i64)
        }
        "metrics.isLoaded" => |c| PropertyValue::Bool(c.metrics.is_loaded),
        "metrics.hasActiveSession" => |c| PropertyValue::Bool(c.metrics.has_active_session),
        "metrics.isAccessible" => |c| PropertyValue::Bool(c.metrics.is_accessible),
        "daysSinceLogin" => |c| opt_days(c.metrics.days_since_login(c.now)),
        "daysSinceActivity" => |c| opt_days(c.metrics.days_since_activity(c.now)),
        "profileSizeMB" => |c| PropertyValue::Int(c.metrics.profile_size_mb() as i64),
        "activityScore" => |c| PropertyValue::Int(c.activity_score as i64),
        _ => return None,
    })
}

// ============================================================================
// Compilation
// ============================================================================

#[derive(Debug)]
struct CompiledCondition {
    extractor: Extractor,
    operator: Operator,
    value: Option<serde_json::Value>,
    weight: f64,
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    combinator: Combinator,
    threshold: f64,
    conditions: Vec<CompiledCondition>,
    classification: Classification,
    reason: String,
    continue_on_match: bool,
}

/// A validated rule set ready for evaluation
#[derive(Debug)]
pub struct CompiledRuleSet {
    name: String,
    version: String,
    default_classification: Classification,
    /// Sorted by descending priority at compile time
    rules: Vec<CompiledRule>,
}

/// Outcome of evaluating a rule set
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    /// The decided classification
    pub classification: Classification,
    /// Reason text (winning rule's reason, or the default note)
    pub reason: String,
    /// Confidence derived from how the decision was reached
    pub confidence: f64,
    /// Name of the winning rule, if one matched decisively
    pub winning_rule: Option<String>,
}

impl CompiledRuleSet {
    /// Validate and compile a rule set
    ///
    /// Fails with `ServiceError::Policy` on: unknown property paths,
    /// missing comparison values, missing or out-of-range thresholds on
    /// weighted rules, or rules with no conditions.
    pub fn compile(ruleset: &RuleSet) -> Result<Self, ServiceError> {
        let mut rules = Vec::with_capacity(ruleset.rules.len());

        let mut sorted: Vec<&Rule> = ruleset.rules.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in sorted {
            if rule.conditions.is_empty() {
                return Err(ServiceError::Policy(format!(
                    "rule '{}' has no conditions",
                    rule.name
                )));
            }

            let threshold = match rule.combinator {
                Combinator::Weighted => match rule.threshold {
                    Some(t) if (0.0..=1.0).contains(&t) => t,
                    Some(t) => {
                        return Err(ServiceError::Policy(format!(
                            "rule '{}' threshold {t} outside [0, 1]",
                            rule.name
                        )))
                    }
                    None => {
                        return Err(ServiceError::Policy(format!(
                            "weighted rule '{}' is missing a threshold",
                            rule.name
                        )))
                    }
                },
                _ => 0.0,
            };

            let mut conditions = Vec::with_capacity(rule.conditions.len());
            for condition in &rule.conditions {
                let Some(extractor) = resolve_property(&condition.property) else {
                    return Err(ServiceError::Policy(format!(
                        "rule '{}' references unknown property '{}'",
                        rule.name, condition.property
                    )));
                };
                if condition.operator.needs_value() && condition.value.is_none() {
                    return Err(ServiceError::Policy(format!(
                        "rule '{}' condition on '{}' needs a comparison value",
                        rule.name, condition.property
                    )));
                }
                if condition.weight <= 0.0 {
                    return Err(ServiceError::Policy(format!(
                        "rule '{}' condition on '{}' has non-positive weight",
                        rule.name, condition.property
                    )));
                }
                conditions.push(CompiledCondition {
                    extractor,
                    operator: condition.operator,
                    value: condition.value.clone(),
                    weight: condition.weight,
                });
            }

            rules.push(CompiledRule {
                name: rule.name.clone(),
                combinator: rule.combinator,
                threshold,
                conditions,
                classification: rule.classification,
                reason: rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("rule '{}' matched", rule.name)),
                continue_on_match: rule.continue_on_match,
            });
        }

        Ok(Self {
            name: ruleset.name.clone(),
            version: ruleset.version.clone(),
            default_classification: ruleset.default_classification,
            rules,
        })
    }

    /// Rule set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rule set version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Evaluate the context against the rules
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> RuleOutcome {
        for rule in &self.rules {
            let (matched, strength) = rule.matches(ctx);
            if !matched {
                continue;
            }
            if rule.continue_on_match {
                tracing::debug!(
                    rule = %rule.name,
                    user_id = %ctx.profile.user_id,
                    "Informational rule matched"
                );
                continue;
            }
            return RuleOutcome {
                classification: rule.classification,
                reason: rule.reason.clone(),
                confidence: strength,
                winning_rule: Some(rule.name.clone()),
            };
        }

        RuleOutcome {
            classification: self.default_classification,
            reason: format!("no rule matched; rule set '{}' default", self.name),
            confidence: 0.5,
            winning_rule: None,
        }
    }
}

impl CompiledRule {
    /// Returns (matched, match strength in `[0, 1]`)
    fn matches(&self, ctx: &EvalContext<'_>) -> (bool, f64) {
        match self.combinator {
            Combinator::And => {
                let all = self.conditions.iter().all(|c| c.matches(ctx));
                (all, if all { 0.9 } else { 0.0 })
            }
            Combinator::Or => {
                let any = self.conditions.iter().any(|c| c.matches(ctx));
                (any, if any { 0.8 } else { 0.0 })
            }
            Combinator::Not => {
                let none = !self.conditions.iter().any(|c| c.matches(ctx));
                (none, if none { 0.7 } else { 0.0 })
            }
            Combinator::Weighted => {
                let total: f64 = self.conditions.iter().map(|c| c.weight).sum();
                let matched: f64 = self
                    .conditions
                    .iter()
                    .filter(|c| c.matches(ctx))
                    .map(|c| c.weight)
                    .sum();
                let score = if total > 0.0 { matched / total } else { 0.0 };
                (score >= self.threshold, score)
            }
        }
    }
}

impl CompiledCondition {
    fn matches(&self, ctx: &EvalContext<'_>) -> bool {
        let actual = (self.extractor)(ctx);

        match self.operator {
            Operator::IsNull => return matches!(actual, PropertyValue::Null),
            Operator::IsNotNull => return !matches!(actual, PropertyValue::Null),
            _ => {}
        }

        // needs_value was enforced at compile time.
        let expected = self.value.as_ref().expect("comparison value present");

        match self.operator {
            Operator::Eq => compare(&actual, expected).map_or(false, |o| o == std::cmp::Ordering::Equal),
            Operator::Ne => compare(&actual, expected).map_or(false, |o| o != std::cmp::Ordering::Equal),
            Operator::Gt => compare(&actual, expected).map_or(false, |o| o == std::cmp::Ordering::Greater),
            Operator::Ge => compare(&actual, expected).map_or(false, |o| o != std::cmp::Ordering::Less),
            Operator::Lt => compare(&actual, expected).map_or(false, |o| o == std::cmp::Ordering::Less),
            Operator::Le => compare(&actual, expected).map_or(false, |o| o != std::cmp::Ordering::Greater),
            Operator::Contains => string_op(&actual, expected, |a, b| a.contains(b)),
            Operator::StartsWith => string_op(&actual, expected, |a, b| a.starts_with(b)),
            Operator::EndsWith => string_op(&actual, expected, |a, b| a.ends_with(b)),
            Operator::IsNull | Operator::IsNotNull => unreachable!(),
        }
    }
}

fn string_op(actual: &PropertyValue, expected: &serde_json::Value, op: fn(&str, &str) -> bool) -> bool {
    match (actual, expected.as_str()) {
        (PropertyValue::Str(a), Some(b)) => op(&a.to_lowercase(), &b.to_lowercase()),
        _ => false,
    }
}

/// Three-way compare between an extracted value and a JSON literal
///
/// Returns `None` when the two are incomparable (including anything
/// involving null), which makes the condition fail rather than error.
fn compare(actual: &PropertyValue, expected: &serde_json::Value) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match actual {
        PropertyValue::Null => None,
        PropertyValue::Bool(a) => expected.as_bool().map(|b| a.cmp(&b)),
        PropertyValue::Int(a) => expected
            .as_f64()
            .and_then(|b| (*a as f64).partial_cmp(&b)),
        PropertyValue::Float(a) => expected.as_f64().and_then(|b| a.partial_cmp(&b)),
        PropertyValue::Str(a) => expected.as_str().map(|b| a.as_str().cmp(b)),
        PropertyValue::Time(a) => {
            let text = expected.as_str()?;
            let b: DateTime<Utc> = text.parse().ok()?;
            Some(if *a < b {
                Ordering::Less
            } else if *a > b {
                Ordering::Greater
            } else {
                Ordering::Equal
            })
        }
    }
}

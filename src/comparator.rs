//! The value comparator: applies a single operator to an (actual, expected)
//! pair of values.

use std::borrow::Cow;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::values::DynValue;

/// Comparison operator vocabulary used by rule conditions.
///
/// The set is closed. Operators unknown to this build deserialize to
/// [`Operator::Unknown`], which evaluates to `false` with a warning, so a
/// newer rule document degrades to "no match" instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Operator {
    /// Byte-exact string equality.
    #[default]
    Eq,
    /// Byte-exact string inequality.
    Ne,
    /// Case-insensitive equality.
    EqCi,
    /// Case-insensitive inequality.
    NeCi,
    /// Less than. Numeric when both sides parse as finite numbers, otherwise
    /// lexicographic.
    Lt,
    /// Less than or equal.
    Lte,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Membership in a list (case-insensitive). A string expectation is split
    /// on commas with per-element trimming.
    In,
    /// Negated membership.
    NotIn,
    /// Case-insensitive substring.
    Contains,
    /// Alias of [`Operator::Contains`].
    ContainsCi,
    /// Case-sensitive prefix.
    StartsWith,
    /// Case-insensitive prefix.
    StartsWithCi,
    /// Case-sensitive suffix.
    EndsWith,
    /// Case-insensitive suffix.
    EndsWithCi,
    /// The expected value is a regex pattern matched against the actual
    /// value. A pattern that fails to compile evaluates to `false`.
    Regex,
    /// Any operator string this build does not recognize.
    Unknown,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::EqCi => "==_ci",
            Operator::NeCi => "!=_ci",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Contains => "contains",
            Operator::ContainsCi => "contains_ci",
            Operator::StartsWith => "starts_with",
            Operator::StartsWithCi => "starts_with_ci",
            Operator::EndsWith => "ends_with",
            Operator::EndsWithCi => "ends_with_ci",
            Operator::Regex => "regex",
            Operator::Unknown => "unknown",
        }
    }

    pub fn from_symbol(s: &str) -> Operator {
        match s {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "==_ci" => Operator::EqCi,
            "!=_ci" => Operator::NeCi,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "contains" => Operator::Contains,
            "contains_ci" => Operator::ContainsCi,
            "starts_with" => Operator::StartsWith,
            "starts_with_ci" => Operator::StartsWithCi,
            "ends_with" => Operator::EndsWith,
            "ends_with_ci" => Operator::EndsWithCi,
            "regex" => Operator::Regex,
            _ => Operator::Unknown,
        }
    }

    /// Apply the operator to dynamic values. Returns `false` if the operator
    /// cannot be applied or there's a misconfiguration.
    pub fn eval(&self, actual: &DynValue, expected: &DynValue) -> bool {
        match actual.string_form() {
            Some(form) => self.eval_inner(&form, &Expected::Dyn(expected)),
            None => false,
        }
    }

    /// Apply the operator with an actual value already in string form.
    pub fn eval_str(&self, actual: &str, expected: &DynValue) -> bool {
        self.eval_inner(actual, &Expected::Dyn(expected))
    }

    /// Apply the operator to two plain strings (used for event-name matching).
    pub fn eval_str_pair(&self, actual: &str, expected: &str) -> bool {
        self.eval_inner(actual, &Expected::Str(expected))
    }

    fn eval_inner(&self, actual: &str, expected: &Expected<'_>) -> bool {
        if matches!(self, Operator::Unknown) {
            log::warn!(target: "flipkit", "unknown comparison operator, predicate evaluates to false");
            return false;
        }
        self.try_eval(actual, expected).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` if it cannot be applied.
    fn try_eval(&self, actual: &str, expected: &Expected<'_>) -> Option<bool> {
        match self {
            Operator::Eq => Some(actual == &*expected.form()?),
            Operator::Ne => Some(actual != &*expected.form()?),
            Operator::EqCi => Some(actual.to_lowercase() == expected.form()?.to_lowercase()),
            Operator::NeCi => Some(actual.to_lowercase() != expected.form()?.to_lowercase()),

            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
                let expected_form = expected.form()?;
                let ordering = match (parse_finite(actual), parse_finite(&expected_form)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b)?,
                    _ => actual.cmp(&*expected_form),
                };
                Some(match self {
                    Operator::Lt => ordering.is_lt(),
                    Operator::Lte => ordering.is_le(),
                    Operator::Gt => ordering.is_gt(),
                    Operator::Gte => ordering.is_ge(),
                    _ => return None,
                })
            }

            Operator::In | Operator::NotIn => {
                let needle = actual.to_lowercase();
                let is_in = expected.membership_items()?.iter().any(|v| *v == needle);
                Some(if *self == Operator::In { is_in } else { !is_in })
            }

            Operator::Contains | Operator::ContainsCi => Some(
                actual
                    .to_lowercase()
                    .contains(&expected.form()?.to_lowercase()),
            ),

            Operator::StartsWith => Some(actual.starts_with(&*expected.form()?)),
            Operator::StartsWithCi => {
                Some(actual.to_lowercase().starts_with(&expected.form()?.to_lowercase()))
            }
            Operator::EndsWith => Some(actual.ends_with(&*expected.form()?)),
            Operator::EndsWithCi => {
                Some(actual.to_lowercase().ends_with(&expected.form()?.to_lowercase()))
            }

            Operator::Regex => {
                let pattern = expected.form()?;
                match Regex::new(&pattern) {
                    Ok(re) => Some(re.is_match(actual)),
                    Err(err) => {
                        log::warn!(target: "flipkit", "failed to compile rule regex {pattern:?}: {err}");
                        Some(false)
                    }
                }
            }

            Operator::Unknown => None,
        }
    }
}

fn parse_finite(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Borrowed view over an expectation: either a plain string (event-name
/// matching) or a dynamic value from the rule document.
enum Expected<'a> {
    Str(&'a str),
    Dyn(&'a DynValue),
}

impl Expected<'_> {
    fn form(&self) -> Option<Cow<'_, str>> {
        match self {
            Expected::Str(s) => Some(Cow::Borrowed(*s)),
            Expected::Dyn(v) => v.string_form(),
        }
    }

    /// Lowercased membership list for `in`/`not_in`. List expectations
    /// contribute each scalar element; anything else is comma-split with
    /// per-element whitespace trimming.
    fn membership_items(&self) -> Option<Vec<String>> {
        if let Expected::Dyn(DynValue::Array(items)) = self {
            return Some(
                items
                    .iter()
                    .filter_map(|v| v.string_form())
                    .map(|s| s.to_lowercase())
                    .collect(),
            );
        }
        let form = self.form()?;
        Some(
            form.split(',')
                .map(|item| item.trim().to_lowercase())
                .collect(),
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Operator::from_symbol(&s))
    }
}

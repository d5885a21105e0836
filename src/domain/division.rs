//! Target divisions and the submission policy that gates new requests.
//!
//! Each division publishes a minimum lead time (whole calendar days between
//! submission and the usage date) and the request types it accepts. The table is
//! static by default but can be overridden through [`crate::config::Config`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyViolation;

/// One of the four production divisions a request can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Division {
    /// Creative Design
    Cd,
    /// Media Production
    Medpro,
    /// Marketing Strategist
    Ms,
    /// Content Creator
    Cc,
}

impl Division {
    pub const ALL: [Division; 4] = [Division::Cd, Division::Medpro, Division::Ms, Division::Cc];

    /// The division code as stored and displayed ("CD", "MEDPRO", ...).
    pub fn code(&self) -> &'static str {
        match self {
            Division::Cd => "CD",
            Division::Medpro => "MEDPRO",
            Division::Ms => "MS",
            Division::Cc => "CC",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Division::Cd => "Creative Design",
            Division::Medpro => "Media Production",
            Division::Ms => "Marketing Strategist",
            Division::Cc => "Content Creator",
        }
    }
}

impl fmt::Display for Division {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Division {
    type Err = PolicyViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CD" => Ok(Division::Cd),
            "MEDPRO" => Ok(Division::Medpro),
            "MS" => Ok(Division::Ms),
            "CC" => Ok(Division::Cc),
            _ => Err(PolicyViolation::UnknownDivision(s.to_string())),
        }
    }
}

/// Submission rules for a single division.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionRules {
    /// Minimum whole days between submission and usage date
    pub min_lead_days: i64,
    /// Request types this division accepts (exact match)
    pub request_types: Vec<String>,
}

impl DivisionRules {
    fn new(min_lead_days: i64, request_types: &[&str]) -> Self {
        Self {
            min_lead_days,
            request_types: request_types.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn accepts(&self, request_type: &str) -> bool {
        self.request_types.iter().any(|t| t == request_type)
    }
}

/// Lead-time and taxonomy table, keyed by division.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DivisionPolicy {
    rules: BTreeMap<Division, DivisionRules>,
}

impl Default for DivisionPolicy {
    fn default() -> Self {
        let rules = BTreeMap::from([
            (
                Division::Cd,
                DivisionRules::new(7, &["Feed Design", "Story Design", "Poster", "Banner", "Logo"]),
            ),
            (
                Division::Medpro,
                DivisionRules::new(
                    8,
                    &["Video Editing", "Motion Graphics", "Live Report", "Documentary"],
                ),
            ),
            (
                Division::Ms,
                DivisionRules::new(
                    8,
                    &["Social Media Strategy", "Campaign Planning", "Content Calendar"],
                ),
            ),
            (
                Division::Cc,
                DivisionRules::new(5, &["Caption Writing", "Content Ideas", "Social Media Post"]),
            ),
        ]);
        Self { rules }
    }
}

impl DivisionPolicy {
    /// Replace the rules for one division.
    pub fn with_rules(mut self, division: Division, rules: DivisionRules) -> Self {
        self.rules.insert(division, rules);
        self
    }

    pub fn rules(&self, division: Division) -> Option<&DivisionRules> {
        self.rules.get(&division)
    }

    /// Check a prospective submission against the table.
    ///
    /// Pure and deterministic given `now`. The usage date must be at least one
    /// calendar day ahead regardless of the division's lead time, and at least
    /// `min_lead_days` ahead.
    pub fn validate_submission(
        &self,
        target_division: &str,
        request_type: &str,
        usage_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(), PolicyViolation> {
        let division: Division = target_division.parse()?;
        let rules = self
            .rules(division)
            .ok_or_else(|| PolicyViolation::UnknownDivision(target_division.to_string()))?;

        if !rules.accepts(request_type) {
            return Err(PolicyViolation::InvalidRequestType {
                division: division.code().to_string(),
                request_type: request_type.to_string(),
            });
        }

        let lead_days = lead_days(usage_date, now);
        if lead_days < 1 {
            return Err(PolicyViolation::UsageDateNotInFuture {
                provided: lead_days,
            });
        }
        if lead_days < rules.min_lead_days {
            return Err(PolicyViolation::InsufficientLeadTime {
                required: rules.min_lead_days,
                provided: lead_days,
            });
        }

        Ok(())
    }
}

/// Whole calendar days from `now` (UTC date) to `usage_date`.
pub fn lead_days(usage_date: NaiveDate, now: DateTime<Utc>) -> i64 {
    (usage_date - now.date_naive()).num_days()
}

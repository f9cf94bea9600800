//! Target filter models

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    #[default]
    Include,
    Exclude,
}

/// One `(field, operator, value)` test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCriterion {
    pub field: String,
    pub operator: FilterOperator,
    pub value: serde_json::Value,
}

impl FilterCriterion {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub filter_type: FilterType,
    #[serde(default)]
    pub logic: FilterLogic,
    pub criteria: Vec<FilterCriterion>,
}

impl TargetFilter {
    pub fn include(criteria: Vec<FilterCriterion>) -> Self {
        Self {
            id: None,
            name: None,
            filter_type: FilterType::Include,
            logic: FilterLogic::And,
            criteria,
        }
    }

    pub fn exclude(criteria: Vec<FilterCriterion>) -> Self {
        Self {
            filter_type: FilterType::Exclude,
            ..Self::include(criteria)
        }
    }

    pub fn with_logic(mut self, logic: FilterLogic) -> Self {
        self.logic = logic;
        self
    }

    /// Stable label used in statistics
    pub fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| format!("filter-{}", index))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionStats {
    pub filter: String,
    pub field: String,
    pub operator: FilterOperator,
    pub matches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterMatchStats {
    pub filter: String,
    pub filter_type: FilterType,
    pub matches: usize,
}

/// Match statistics for one filter set over one target set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub total_targets: usize,
    pub matched_targets: usize,
    pub excluded_targets: usize,
    pub filters: Vec<FilterMatchStats>,
    pub criteria: Vec<CriterionStats>,
}

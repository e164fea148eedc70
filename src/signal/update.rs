//! Descriptions of policy mutations for the audit log.

use std::fmt;

/// The kind of policy mutation that triggered a publish.
///
/// All kinds signal peers the same way; they only differ in what is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateType {
    /// Generic "policy changed" with no further detail
    Update,
    /// A single rule was added
    AddPolicy,
    /// A single rule was removed
    RemovePolicy,
    /// Rules matching a field filter were removed
    RemoveFilteredPolicy,
    /// The whole policy was saved
    SavePolicy,
    /// Several rules were added
    AddPolicies,
    /// Several rules were removed
    RemovePolicies,
}

impl UpdateType {
    /// Stable name used in log records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "Update",
            Self::AddPolicy => "UpdateForAddPolicy",
            Self::RemovePolicy => "UpdateForRemovePolicy",
            Self::RemoveFilteredPolicy => "UpdateForRemoveFilteredPolicy",
            Self::SavePolicy => "UpdateForSavePolicy",
            Self::AddPolicies => "UpdateForAddPolicies",
            Self::RemovePolicies => "UpdateForRemovePolicies",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy mutation as reported by the enforcer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyChange {
    /// What kind of mutation this is
    pub update_type: UpdateType,
    /// Model section, e.g. `p` or `g`
    pub sec: Option<String>,
    /// Policy type within the section, e.g. `p`, `g2`
    pub ptype: Option<String>,
    /// First field the filter applies to (filtered removal only)
    pub field_index: Option<usize>,
    /// Affected rules. Filter values for filtered removal.
    pub rules: Vec<Vec<String>>,
    /// Model text (save only)
    pub model: Option<String>,
}

impl PolicyChange {
    fn new(update_type: UpdateType) -> Self {
        Self {
            update_type,
            sec: None,
            ptype: None,
            field_index: None,
            rules: Vec::new(),
            model: None,
        }
    }

    fn with_target(mut self, sec: &str, ptype: &str) -> Self {
        self.sec = Some(sec.to_string());
        self.ptype = Some(ptype.to_string());
        self
    }

    /// A change with no detail.
    pub fn update() -> Self {
        Self::new(UpdateType::Update)
    }

    /// One rule added.
    pub fn add_policy(sec: &str, ptype: &str, rule: Vec<String>) -> Self {
        let mut change = Self::new(UpdateType::AddPolicy).with_target(sec, ptype);
        change.rules.push(rule);
        change
    }

    /// One rule removed.
    pub fn remove_policy(sec: &str, ptype: &str, rule: Vec<String>) -> Self {
        let mut change = Self::new(UpdateType::RemovePolicy).with_target(sec, ptype);
        change.rules.push(rule);
        change
    }

    /// Rules matching `field_values` starting at `field_index` removed.
    pub fn remove_filtered_policy(
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> Self {
        let mut change = Self::new(UpdateType::RemoveFilteredPolicy).with_target(sec, ptype);
        change.field_index = Some(field_index);
        change.rules.push(field_values);
        change
    }

    /// Whole policy saved.
    pub fn save_policy(model: impl Into<String>) -> Self {
        let mut change = Self::new(UpdateType::SavePolicy);
        change.model = Some(model.into());
        change
    }

    /// Several rules added.
    pub fn add_policies(sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> Self {
        let mut change = Self::new(UpdateType::AddPolicies).with_target(sec, ptype);
        change.rules = rules;
        change
    }

    /// Several rules removed.
    pub fn remove_policies(sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> Self {
        let mut change = Self::new(UpdateType::RemovePolicies).with_target(sec, ptype);
        change.rules = rules;
        change
    }

    /// Emit the structured audit record for this change.
    pub fn log(&self, key: &str) {
        tracing::info!(
            key = %key,
            update_type = %self.update_type,
            sec = self.sec.as_deref().unwrap_or(""),
            ptype = self.ptype.as_deref().unwrap_or(""),
            field_index = ?self.field_index,
            rules = ?self.rules,
            "{}", self
        );
        if let Some(model) = &self.model {
            tracing::debug!(key = %key, model = %model, "Saved model");
        }
    }
}

impl fmt::Display for PolicyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.update_type)?;
        if let (Some(sec), Some(ptype)) = (&self.sec, &self.ptype) {
            write!(f, ": {}/{}", sec, ptype)?;
        }
        if let Some(index) = self.field_index {
            write!(f, " from field {}", index)?;
        }
        match self.rules.as_slice() {
            [] => Ok(()),
            [rule] => write!(f, " [{}]", rule.join(", ")),
            rules => write!(f, " ({} rules)", rules.len()),
        }
    }
}

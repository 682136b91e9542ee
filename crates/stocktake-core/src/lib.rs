use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RepairError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(
        "{remaining} test result(s) still reference a template outside their part's ancestry"
    )]
    Unresolved { remaining: usize },
}

macro_rules! row_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(PartId);
row_id!(StockItemId);
row_id!(TemplateId);
row_id!(TestResultId);

/// Nested-set coordinates of one part within its tree.
///
/// A node is an ancestor of another when both share `tree_id` and its
/// `[lft, rght]` range encloses the other's range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct TreePosition {
    pub tree_id: i64,
    pub lft: i64,
    pub rght: i64,
    pub level: i64,
}

impl TreePosition {
    #[must_use]
    pub fn root(tree_id: i64) -> Self {
        Self { tree_id, lft: 1, rght: 2, level: 0 }
    }

    /// Position a new last child would take under `self`, before the tree is widened.
    #[must_use]
    pub fn next_child(&self) -> Self {
        Self { tree_id: self.tree_id, lft: self.rght, rght: self.rght + 1, level: self.level + 1 }
    }

    /// Ancestor-or-self test.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.tree_id == other.tree_id && self.lft <= other.lft && self.rght >= other.rght
    }

    /// Check the bounds a stored nested-set row must satisfy.
    ///
    /// # Errors
    /// Returns [`RepairError::Validation`] when the tree id, bounds, or level are malformed.
    pub fn validate(&self) -> Result<(), RepairError> {
        if self.tree_id < 1 {
            return Err(RepairError::Validation("tree_id MUST be >= 1".to_string()));
        }
        if self.lft < 0 {
            return Err(RepairError::Validation("lft MUST be >= 0".to_string()));
        }
        if self.lft >= self.rght {
            return Err(RepairError::Validation(format!(
                "lft MUST be < rght (got lft={}, rght={})",
                self.lft, self.rght
            )));
        }
        if self.level < 0 {
            return Err(RepairError::Validation("level MUST be >= 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Part {
    pub id: PartId,
    pub parent_id: Option<PartId>,
    pub name: String,
    pub position: TreePosition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockItem {
    pub id: StockItemId,
    pub part_id: PartId,
    pub serial: Option<String>,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestTemplate {
    pub id: TemplateId,
    pub part_id: PartId,
    pub key: String,
    pub test_name: String,
    pub description: Option<String>,
    pub required: bool,
    pub requires_value: bool,
    pub requires_attachment: bool,
    pub enabled: bool,
}

impl TestTemplate {
    /// Copy every attribute except identity and owner onto a template for `part_id`.
    #[must_use]
    pub fn clone_for_part(&self, part_id: PartId) -> NewTestTemplate {
        NewTestTemplate {
            part_id,
            key: self.key.clone(),
            test_name: self.test_name.clone(),
            description: self.description.clone(),
            required: self.required,
            requires_value: self.requires_value,
            requires_attachment: self.requires_attachment,
            enabled: self.enabled,
        }
    }
}

/// A template row that has not been assigned an id yet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewTestTemplate {
    pub part_id: PartId,
    pub key: String,
    pub test_name: String,
    pub description: Option<String>,
    pub required: bool,
    pub requires_value: bool,
    pub requires_attachment: bool,
    pub enabled: bool,
}

impl NewTestTemplate {
    /// Enabled, optional template whose key is derived from `test_name`.
    #[must_use]
    pub fn new(part_id: PartId, test_name: &str) -> Self {
        Self {
            part_id,
            key: test_key(test_name),
            test_name: test_name.trim().to_string(),
            description: None,
            required: false,
            requires_value: false,
            requires_attachment: false,
            enabled: true,
        }
    }

    /// # Errors
    /// Returns [`RepairError::Validation`] when the test name or key is empty.
    pub fn validate(&self) -> Result<(), RepairError> {
        if self.test_name.trim().is_empty() {
            return Err(RepairError::Validation("test_name MUST be provided".to_string()));
        }
        if self.key.trim().is_empty() {
            return Err(RepairError::Validation(
                "key MUST contain at least one alphanumeric character".to_string(),
            ));
        }
        Ok(())
    }
}

/// Normalize a test name into the lookup key shared by templates across a part tree.
#[must_use]
pub fn test_key(test_name: &str) -> String {
    test_name
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TestResult {
    pub id: TestResultId,
    pub stock_item_id: StockItemId,
    pub template_id: TemplateId,
    pub result: bool,
    pub value: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

/// A test result whose template is owned by a part outside the result's ancestry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BadTestResult {
    pub result_id: TestResultId,
    pub template_id: TemplateId,
    pub template_key: String,
    pub part_id: PartId,
    pub position: TreePosition,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TemplateCandidate {
    pub template_id: TemplateId,
    pub part_id: PartId,
    pub key: String,
    pub position: TreePosition,
}

impl TemplateCandidate {
    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.position
            .level
            .cmp(&lhs.position.level)
            .then_with(|| lhs.template_id.cmp(&rhs.template_id))
    }
}

/// Pick the template for `key` owned by the deepest ancestor-or-self of `target`.
///
/// Candidates with another key or outside the target's ancestry are ignored.
/// Equal depth falls back to the lowest template id.
#[must_use]
pub fn select_best_template<'a>(
    target: &TreePosition,
    key: &str,
    candidates: &'a [TemplateCandidate],
) -> Option<&'a TemplateCandidate> {
    candidates
        .iter()
        .filter(|candidate| candidate.key == key && candidate.position.contains(target))
        .min_by(|lhs, rhs| TemplateCandidate::cmp(lhs, rhs))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepairOptions {
    pub dry_run: bool,
    pub batch_size: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self { dry_run: false, batch_size: DEFAULT_BATCH_SIZE }
    }
}

impl RepairOptions {
    /// # Errors
    /// Returns [`RepairError::Validation`] when `batch_size` is zero.
    pub fn validate(&self) -> Result<(), RepairError> {
        if self.batch_size == 0 {
            return Err(RepairError::Validation("batch_size MUST be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RepairReport {
    pub dry_run: bool,
    pub bad_results: usize,
    pub repointed: usize,
    pub attached_missing: usize,
    pub created_templates: Vec<TemplateId>,
    pub remaining: usize,
}

impl RepairReport {
    #[must_use]
    pub fn empty(dry_run: bool) -> Self {
        Self { dry_run, ..Self::default() }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.bad_results == 0
    }

    #[must_use]
    pub fn rows_updated(&self) -> usize {
        self.repointed + self.attached_missing
    }
}

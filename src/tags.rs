//! Tag reconciliation.
//!
//! CloudStack models tags as a flat key/value set per resource that can only
//! be added to or removed from; there is no update-in-place. Reconciling a
//! resource therefore means computing which tags to delete and which to
//! create, then issuing `deleteTags` before `createTags`.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_cloudstack::tags::{diff_tags, TagSet};
//!
//! let observed: TagSet = [("env", "dev"), ("team", "web")]
//!     .into_iter()
//!     .map(|(k, v)| (k.to_string(), v.to_string()))
//!     .collect();
//! let desired: TagSet = [("env", "prod"), ("team", "web")]
//!     .into_iter()
//!     .map(|(k, v)| (k.to_string(), v.to_string()))
//!     .collect();
//!
//! let diff = diff_tags(observed.clone(), desired.clone());
//! assert_eq!(diff.to_remove.get("env").map(String::as_str), Some("dev"));
//! assert_eq!(diff.to_create.get("env").map(String::as_str), Some("prod"));
//! assert!(!diff.to_create.contains_key("team"));
//! assert_eq!(diff.apply(&observed), desired);
//! ```

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::client::{ApiError, CloudStackApi};
use crate::error::ProviderError;
use crate::schema::{Attribute, AttributeFlags, AttributeType};

/// All tags attached to one resource, keyed by tag key.
pub type TagSet = BTreeMap<String, String>;

/// The remote changes needed to move a resource from one tag set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    /// Tags to delete, with the values currently on the resource.
    pub to_remove: TagSet,
    /// Tags to create, with the desired values.
    pub to_create: TagSet,
}

impl TagDiff {
    /// Whether no remote call is needed.
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_create.is_empty()
    }

    /// Apply the removals, then the creations, to `observed`.
    pub fn apply(&self, observed: &TagSet) -> TagSet {
        let mut result = observed.clone();
        for key in self.to_remove.keys() {
            result.remove(key);
        }
        result.extend(
            self.to_create
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        result
    }
}

/// Compute the tags to remove and to create to turn `observed` into `desired`.
///
/// Keys with the same value on both sides are dropped from both. What remains
/// of `observed` must be removed and what remains of `desired` must be
/// created. A key whose value changed stays on both sides, so it is removed
/// with its old value and created with its new one.
pub fn diff_tags(mut observed: TagSet, mut desired: TagSet) -> TagDiff {
    observed.retain(|key, value| {
        if desired.get(key) == Some(&*value) {
            desired.remove(key);
            false
        } else {
            true
        }
    });

    TagDiff {
        to_remove: observed,
        to_create: desired,
    }
}

/// Attach `tags` to a freshly created resource.
pub async fn set_tags(
    api: &dyn CloudStackApi,
    resource_id: &str,
    resource_type: &str,
    tags: &TagSet,
) -> Result<(), ApiError> {
    if tags.is_empty() {
        return Ok(());
    }

    debug!(resource_id, resource_type, ?tags, "Creating tags");
    api.create_tags(&[resource_id.to_string()], resource_type, tags)
        .await
}

/// Reconcile the tags of an existing resource.
///
/// Obsolete and changed tags are deleted first, then new and changed tags are
/// created. The order matters: creating a key that still exists is rejected by
/// CloudStack, so the two calls must never be reordered or run concurrently.
pub async fn update_tags(
    api: &dyn CloudStackApi,
    resource_id: &str,
    resource_type: &str,
    observed: TagSet,
    desired: TagSet,
) -> Result<TagDiff, ApiError> {
    let diff = diff_tags(observed, desired);
    debug!(resource_id, to_remove = ?diff.to_remove, "Tags to remove");
    debug!(resource_id, to_create = ?diff.to_create, "Tags to create");

    let ids = [resource_id.to_string()];

    if !diff.to_remove.is_empty() {
        debug!(resource_id, tags = ?diff.to_remove, "Removing tags");
        api.delete_tags(&ids, resource_type, &diff.to_remove).await?;
    }

    if !diff.to_create.is_empty() {
        debug!(resource_id, tags = ?diff.to_create, "Creating tags");
        api.create_tags(&ids, resource_type, &diff.to_create).await?;
    }

    Ok(diff)
}

/// Read the `tags` attribute from a resource state object.
///
/// A missing or null attribute is an empty tag set.
pub fn tags_from_state(state: &Value) -> Result<TagSet, ProviderError> {
    match state.get("tags") {
        None | Some(Value::Null) => Ok(TagSet::new()),
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => Ok((key.clone(), s.clone())),
                other => Err(ProviderError::Validation(format!(
                    "tag '{}' must be a string, got {}",
                    key, other
                ))),
            })
            .collect(),
        Some(other) => Err(ProviderError::Validation(format!(
            "tags must be a map of strings, got {}",
            other
        ))),
    }
}

/// Render a tag set as a JSON object for state.
pub fn tags_to_value(tags: &TagSet) -> Value {
    Value::Object(
        tags.iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect(),
    )
}

/// Schema for the `tags` attribute shared by taggable resources.
pub fn tags_schema() -> Attribute {
    Attribute::new(
        AttributeType::map(AttributeType::String),
        AttributeFlags::optional_computed(),
    )
    .with_description("Tags to attach to the resource")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use proptest::prelude::*;
    use serde_json::json;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let desired = tags(&[("env", "prod"), ("team", "web")]);
        let diff = diff_tags(desired.clone(), desired);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_diff_changed_value() {
        let diff = diff_tags(tags(&[("env", "dev")]), tags(&[("env", "prod")]));
        assert_eq!(diff.to_remove, tags(&[("env", "dev")]));
        assert_eq!(diff.to_create, tags(&[("env", "prod")]));
    }

    #[test]
    fn test_diff_pure_addition() {
        let diff = diff_tags(TagSet::new(), tags(&[("a", "1")]));
        assert!(diff.to_remove.is_empty());
        assert_eq!(diff.to_create, tags(&[("a", "1")]));
    }

    #[test]
    fn test_diff_pure_removal() {
        let diff = diff_tags(tags(&[("a", "1")]), TagSet::new());
        assert_eq!(diff.to_remove, tags(&[("a", "1")]));
        assert!(diff.to_create.is_empty());
    }

    #[test]
    fn test_diff_mixed() {
        let diff = diff_tags(
            tags(&[("a", "1"), ("b", "2")]),
            tags(&[("b", "2"), ("c", "3")]),
        );
        assert_eq!(diff.to_remove, tags(&[("a", "1")]));
        assert_eq!(diff.to_create, tags(&[("c", "3")]));
    }

    proptest! {
        #[test]
        fn prop_apply_converges_to_desired(
            observed in prop::collection::btree_map("[a-d]{1,2}", "[x-z]{0,2}", 0..8),
            desired in prop::collection::btree_map("[a-d]{1,2}", "[x-z]{0,2}", 0..8),
        ) {
            let diff = diff_tags(observed.clone(), desired.clone());
            prop_assert_eq!(diff.apply(&observed), desired.clone());

            for (key, value) in &observed {
                if desired.get(key) == Some(value) {
                    prop_assert!(!diff.to_remove.contains_key(key));
                    prop_assert!(!diff.to_create.contains_key(key));
                }
            }
        }
    }

    #[test]
    fn test_tags_from_state() {
        let state = json!({"tags": {"env": "prod"}});
        assert_eq!(tags_from_state(&state).unwrap(), tags(&[("env", "prod")]));

        assert!(tags_from_state(&json!({})).unwrap().is_empty());
        assert!(tags_from_state(&json!({"tags": null})).unwrap().is_empty());
        assert!(tags_from_state(&json!({"tags": {"env": 1}})).is_err());
        assert!(tags_from_state(&json!({"tags": "env=prod"})).is_err());
    }

    #[test]
    fn test_tags_to_value() {
        assert_eq!(
            tags_to_value(&tags(&[("env", "prod")])),
            json!({"env": "prod"})
        );
    }

    #[tokio::test]
    async fn test_set_tags_skips_empty() {
        let cloud = FakeCloud::new();
        set_tags(&cloud, "tpl-1", "Template", &TagSet::new())
            .await
            .unwrap();
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_tags_removes_before_creating() {
        let cloud = FakeCloud::new();
        let id = "tpl-1";
        set_tags(&cloud, id, "Template", &tags(&[("env", "dev"), ("team", "web")]))
            .await
            .unwrap();

        let diff = update_tags(
            &cloud,
            id,
            "Template",
            tags(&[("env", "dev"), ("team", "web")]),
            tags(&[("env", "prod"), ("team", "web")]),
        )
        .await
        .unwrap();

        assert_eq!(diff.to_remove, tags(&[("env", "dev")]));
        assert_eq!(
            cloud.calls(),
            vec!["createTags", "deleteTags", "createTags"]
        );
        assert_eq!(
            cloud.tags_of(id),
            tags(&[("env", "prod"), ("team", "web")])
        );
    }

    #[test]
    fn test_update_tags_no_changes_makes_no_calls() {
        let cloud = FakeCloud::new();
        let desired = tags(&[("env", "prod")]);

        let diff = tokio_test::block_on(update_tags(
            &cloud,
            "tpl-1",
            "Template",
            desired.clone(),
            desired,
        ))
        .unwrap();

        assert!(diff.is_empty());
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_tags_surfaces_delete_failure() {
        let cloud = FakeCloud::new();
        cloud.fail_next(
            "deleteTags",
            ApiError::Api {
                code: 530,
                text: "Internal error".to_string(),
            },
        );

        let result = update_tags(
            &cloud,
            "tpl-1",
            "Template",
            tags(&[("env", "dev")]),
            tags(&[("env", "prod")]),
        )
        .await;

        assert!(result.is_err());
        // create must not run once delete failed
        assert_eq!(cloud.calls(), vec!["deleteTags"]);
    }
}

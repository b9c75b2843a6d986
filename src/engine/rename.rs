//! Rename propagation
//!
//! Invoked only when a `@class` record is successfully written.
//! Compares the prior and new class documents and emits rename-class
//! and rename-prop operations against the backend. Detection is
//! conservative: a type change disqualifies a match and reads as
//! delete-plus-create; values are never migrated across types.

use std::sync::Arc;

use crate::core::error::EngineResult;
use crate::core::record::Record;
use crate::observability::Logger;
use crate::schema::{ClassDef, DataType};
use crate::storage::StorageBackend;

/// The rename side effects of one `@class` write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenamePlan {
    /// The class the prop renames apply to (the new id after a class
    /// rename)
    pub class_id: String,
    /// `(old_class_id, new_class_id)` when the class id itself changed
    pub class_rename: Option<(String, String)>,
    /// `(old_key, new_key)` pairs, first-by-insertion matching
    pub prop_renames: Vec<(String, String)>,
}

impl RenamePlan {
    pub fn is_empty(&self) -> bool {
        self.class_rename.is_none() && self.prop_renames.is_empty()
    }
}

/// Diff a prior and new class record into a rename plan.
pub fn plan_renames(prior: &Record, new: &Record) -> RenamePlan {
    let mut plan = RenamePlan {
        class_id: new.id_string().unwrap_or_default(),
        ..RenamePlan::default()
    };

    let prior_id = prior.id_string();
    let new_id = new.id_string();
    if let (Some(old), Some(new_id)) = (&prior_id, &new_id) {
        if old != new_id {
            plan.class_rename = Some((old.clone(), new_id.clone()));
        }
    }

    let prior_props = typed_keys(prior);
    let new_props = typed_keys(new);
    plan.prop_renames = match_prop_renames(&prior_props, &new_props);
    plan
}

/// `{key: data_type}` in declaration order, from a class record.
fn typed_keys(record: &Record) -> Vec<(String, DataType)> {
    match ClassDef::from_record(record) {
        Ok(def) => def
            .props
            .into_iter()
            .map(|p| (p.key, p.data_type))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// A key removed from the prior set and a key added in the new set
/// that share the same data type are matched as a rename. First match
/// wins; matched entries leave the candidate pool.
fn match_prop_renames(
    prior: &[(String, DataType)],
    new: &[(String, DataType)],
) -> Vec<(String, String)> {
    let removed: Vec<&(String, DataType)> = prior
        .iter()
        .filter(|(key, _)| new.iter().all(|(k, _)| k != key))
        .collect();
    let mut added: Vec<&(String, DataType)> = new
        .iter()
        .filter(|(key, _)| prior.iter().all(|(k, _)| k != key))
        .collect();

    let mut renames = Vec::new();
    for (old_key, old_type) in removed {
        let Some(pos) = added.iter().position(|(_, t)| t == old_type) else {
            continue;
        };
        let (new_key, _) = added.remove(pos);
        renames.push((old_key.clone(), new_key.clone()));
    }
    renames
}

/// Apply a rename plan against the backend.
///
/// The class record is already committed; a failure here surfaces as
/// a storage error and leaves reconciliation to operator tooling.
pub async fn apply_renames(
    backend: &Arc<dyn StorageBackend>,
    plan: &RenamePlan,
) -> EngineResult<()> {
    if let Some((old, new)) = &plan.class_rename {
        let moved = backend.rename_class(old, new).await.map_err(|e| {
            Logger::error(
                "RENAME_CLASS_FAILED",
                &[
                    ("old", old.as_str()),
                    ("new", new.as_str()),
                    ("cause", &e.to_string()),
                ],
            );
            e
        })?;
        Logger::info(
            "CLASS_RENAMED",
            &[
                ("old", old.as_str()),
                ("new", new.as_str()),
                ("moved", &moved.to_string()),
            ],
        );
    }

    for (old_key, new_key) in &plan.prop_renames {
        let count = backend
            .rename_prop(&plan.class_id, old_key, new_key)
            .await
            .map_err(|e| {
                Logger::error(
                    "RENAME_PROP_FAILED",
                    &[
                        ("class", plan.class_id.as_str()),
                        ("old", old_key.as_str()),
                        ("new", new_key.as_str()),
                        ("cause", &e.to_string()),
                    ],
                );
                e
            })?;
        Logger::info(
            "PROP_RENAMED",
            &[
                ("class", plan.class_id.as_str()),
                ("old", old_key.as_str()),
                ("new", new_key.as_str()),
                ("records", &count.to_string()),
            ],
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropDef;

    fn class_record(id: &str, props: Vec<PropDef>) -> Record {
        ClassDef::new(id, id).with_props(props).to_record()
    }

    #[test]
    fn test_same_props_no_renames() {
        let prior = class_record("user", vec![PropDef::string("name")]);
        let plan = plan_renames(&prior, &prior.clone());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_key_rename_same_type_matches() {
        let prior = class_record("user", vec![PropDef::string("email")]);
        let new = class_record("user", vec![PropDef::string("email_address")]);

        let plan = plan_renames(&prior, &new);
        assert_eq!(plan.prop_renames, vec![("email".into(), "email_address".into())]);
        assert!(plan.class_rename.is_none());
    }

    #[test]
    fn test_type_change_disqualifies_match() {
        let prior = class_record("user", vec![PropDef::string("age")]);
        let new = class_record("user", vec![PropDef::integer("years")]);

        let plan = plan_renames(&prior, &new);
        assert!(plan.prop_renames.is_empty());
    }

    #[test]
    fn test_first_by_insertion_matching() {
        let prior = class_record(
            "user",
            vec![PropDef::string("alpha"), PropDef::string("beta")],
        );
        let new = class_record(
            "user",
            vec![PropDef::string("gamma"), PropDef::string("delta")],
        );

        let plan = plan_renames(&prior, &new);
        assert_eq!(
            plan.prop_renames,
            vec![
                ("alpha".into(), "gamma".into()),
                ("beta".into(), "delta".into()),
            ]
        );
    }

    #[test]
    fn test_class_id_change_detected() {
        let prior = class_record("user", vec![]);
        let new = class_record("person", vec![]);

        let plan = plan_renames(&prior, &new);
        assert_eq!(plan.class_rename, Some(("user".into(), "person".into())));
    }

    #[test]
    fn test_untouched_keys_do_not_pair() {
        // email kept, nickname added: nothing was removed, no rename
        let prior = class_record("user", vec![PropDef::string("email")]);
        let new = class_record(
            "user",
            vec![PropDef::string("email"), PropDef::string("nickname")],
        );

        let plan = plan_renames(&prior, &new);
        assert!(plan.prop_renames.is_empty());
    }
}

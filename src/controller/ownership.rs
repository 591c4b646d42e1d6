//! Owner reference helpers
//!
//! An object has at most one controlling owner. Setting a second one is an
//! error and leaves the object untouched; callers decide whether the existing
//! owner is stale before retrying.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use thiserror::Error;

/// Errors raised while editing owner references
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OwnershipError {
    /// Another object already controls the target
    #[error("already controlled by {} {}", .existing.kind, .existing.name)]
    AlreadyOwned {
        /// The current controlling owner
        existing: OwnerReference,
    },
}

/// Build an owner reference pointing at `owner`
///
/// `None` when the owner has not been persisted yet and so has no uid.
pub fn owner_reference<K>(owner: &K, controller: bool) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: controller.then_some(true),
        block_owner_deletion: Some(true),
    })
}

/// The controlling owner, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Make `owner` the controlling owner
///
/// Returns whether the metadata changed. An existing non-controlling entry for
/// the same uid is upgraded in place.
pub fn set_controller_reference(
    meta: &mut ObjectMeta,
    mut owner: OwnerReference,
) -> Result<bool, OwnershipError> {
    if let Some(existing) = controller_of(meta) {
        if existing.uid != owner.uid {
            return Err(OwnershipError::AlreadyOwned {
                existing: existing.clone(),
            });
        }
    }
    owner.controller = Some(true);
    Ok(upsert(meta, owner))
}

/// Add `owner` as a non-controlling owner; returns whether anything changed
pub fn set_owner_reference(meta: &mut ObjectMeta, mut owner: OwnerReference) -> bool {
    // Never demote a controlling entry.
    let controlling = meta
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.uid == owner.uid))
        .is_some_and(|r| r.controller == Some(true));
    owner.controller = controlling.then_some(true);
    upsert(meta, owner)
}

/// Drop the owner with `uid`; returns whether anything changed
pub fn remove_owner_reference(meta: &mut ObjectMeta, uid: &str) -> bool {
    let Some(refs) = meta.owner_references.as_mut() else {
        return false;
    };
    let before = refs.len();
    refs.retain(|r| r.uid != uid);
    let changed = refs.len() != before;
    if refs.is_empty() {
        meta.owner_references = None;
    }
    changed
}

fn upsert(meta: &mut ObjectMeta, owner: OwnerReference) -> bool {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) if *existing == owner => false,
        Some(existing) => {
            *existing = owner;
            true
        }
        None => {
            refs.push(owner);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "networking.fabric.dev/v1alpha1".to_string(),
            kind: "NVE".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: None,
            block_owner_deletion: Some(true),
        }
    }

    mod controlling_owner {
        use super::*;

        #[test]
        fn second_controller_is_rejected_and_object_untouched() {
            let mut meta = ObjectMeta::default();
            assert!(set_controller_reference(&mut meta, owner("a", "nve-a")).unwrap());
            let before = meta.clone();

            let err = set_controller_reference(&mut meta, owner("b", "nve-b")).unwrap_err();
            let OwnershipError::AlreadyOwned { existing } = err;
            assert_eq!(existing.uid, "a");
            assert_eq!(meta, before);
        }

        #[test]
        fn reclaiming_is_a_no_op() {
            let mut meta = ObjectMeta::default();
            set_controller_reference(&mut meta, owner("a", "nve-a")).unwrap();
            assert!(!set_controller_reference(&mut meta, owner("a", "nve-a")).unwrap());
            assert_eq!(meta.owner_references.as_ref().unwrap().len(), 1);
        }

        #[test]
        fn plain_owner_is_upgraded_to_controller() {
            let mut meta = ObjectMeta::default();
            assert!(set_owner_reference(&mut meta, owner("a", "nve-a")));
            assert!(controller_of(&meta).is_none());

            assert!(set_controller_reference(&mut meta, owner("a", "nve-a")).unwrap());
            assert_eq!(controller_of(&meta).unwrap().uid, "a");
            assert_eq!(meta.owner_references.as_ref().unwrap().len(), 1);
        }
    }

    #[test]
    fn plain_owner_does_not_demote_controller() {
        let mut meta = ObjectMeta::default();
        set_controller_reference(&mut meta, owner("a", "nve-a")).unwrap();
        assert!(!set_owner_reference(&mut meta, owner("a", "nve-a")));
        assert!(controller_of(&meta).is_some());
    }

    #[test]
    fn removal_clears_empty_list() {
        let mut meta = ObjectMeta::default();
        set_owner_reference(&mut meta, owner("a", "nve-a"));
        assert_eq!(meta.owner_references.as_ref().unwrap()[0].uid, "a");
        assert!(remove_owner_reference(&mut meta, "a"));
        assert!(meta.owner_references.is_none());
        assert!(!remove_owner_reference(&mut meta, "a"));
    }
}

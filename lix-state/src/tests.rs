//! Cross-module scenario tests for the state and commit engine.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use rstest::*;
use serde_json::json;

use crate::change::{CHANGE_AUTHOR_SCHEMA, CHANGE_SET_SCHEMA, COMMIT_EDGE_SCHEMA, COMMIT_SCHEMA, VERSION_SCHEMA};
use crate::resolve::{Resolution, Tier};
use crate::store::{Lix, Mutation};
use crate::version::{GLOBAL_VERSION_ID, VersionError};
use crate::{ChangeSet, CommitId, StateKey, VersionId};

fn key(entity: &str) -> StateKey {
    StateKey::new(entity, "doc", "file-1")
}

fn put(store: &mut Lix, version: &VersionId, entity: &str, value: &str) {
    store
        .stage(Mutation::insert(entity, "doc", "file-1", json!({ "v": value })).in_version(version.clone()))
        .unwrap();
}

fn delete(store: &mut Lix, version: &VersionId, entity: &str) {
    store
        .stage(Mutation::delete(entity, "doc", "file-1").in_version(version.clone()))
        .unwrap();
}

#[fixture]
fn store() -> Lix {
    Lix::new()
}

/// A store with `e1 = "v1"` committed in `main` and a child version `b`
/// inheriting from it.
#[fixture]
fn parent_child(mut store: Lix) -> (Lix, VersionId, VersionId) {
    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();
    let b = store
        .create_version_with_id("b".into(), "b", Some(&main))
        .unwrap();
    store.commit().unwrap();
    (store, main, b)
}

#[rstest]
fn empty_commit_is_a_noop(mut store: Lix) {
    let changes_before = store.all_changes().count();
    let sets_before = store.all_change_sets().count();
    let commits_before = store.all_commits().count();

    let outcome = store.commit().unwrap();

    assert!(outcome.is_noop());
    assert_eq!(store.all_changes().count(), changes_before);
    assert_eq!(store.all_change_sets().count(), sets_before);
    assert_eq!(store.all_commits().count(), commits_before);
}

#[rstest]
fn commit_is_atomic_and_self_describing(mut store: Lix) {
    let main = store.active_version().clone();
    let tip_before = store.version(&main).unwrap().commit_id;
    put(&mut store, &main, "e1", "v1");

    let outcome = store.commit().unwrap();

    // All five artifacts are visible together.
    let (version_id, commit_id) = outcome.committed[0].clone();
    assert_eq!(version_id, main);
    let commit = store.commit_by_id(commit_id).unwrap().clone();
    let set = store.change_set(&commit.change_set_id).unwrap().clone();
    assert!(store.version(&main).unwrap().commit_id == commit_id);
    assert!(
        store
            .all_edges()
            .any(|e| e.parent_id == tip_before && e.child_id == commit_id)
    );

    // The commit's change set describes the commit itself.
    let schema_of = |schema: &str| {
        set.elements
            .iter()
            .filter(|e| e.schema_key.as_str() == schema)
            .count()
    };
    assert_eq!(schema_of(CHANGE_SET_SCHEMA), 1);
    assert_eq!(schema_of(COMMIT_SCHEMA), 1);
    assert_eq!(schema_of(COMMIT_EDGE_SCHEMA), 1);
    // One author record per entity change.
    assert_eq!(schema_of(CHANGE_AUTHOR_SCHEMA), 1);
    assert!(
        set.elements
            .iter()
            .any(|e| e.schema_key.as_str() == COMMIT_SCHEMA
                && e.entity_id.as_str() == commit_id.to_string())
    );

    // Every change referenced by the set is in the change log.
    for element in &set.elements {
        assert!(store.change(element.change_id).is_some());
    }
}

#[rstest]
fn change_log_records_every_materialized_change(mut store: Lix) {
    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    let outcome = store.commit().unwrap();

    assert_eq!(store.all_changes().count(), outcome.changes.len());
    for change in &outcome.changes {
        assert_eq!(store.change(change.id), Some(change));
    }

    // The log is append-only: a second commit only adds.
    put(&mut store, &main, "e2", "v2");
    let second = store.commit().unwrap();
    assert_eq!(
        store.all_changes().count(),
        outcome.changes.len() + second.changes.len()
    );
    assert_eq!(
        store.change(outcome.changes[0].id),
        Some(&outcome.changes[0])
    );
}

#[rstest]
fn working_set_accumulates_entity_elements_only(mut store: Lix) {
    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();

    let elements = store.working_elements(&main).unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].schema_key.as_str(), "doc");

    // The history change set of the same commit keeps its own identity,
    // registry elements included.
    let tip = store.version(&main).unwrap().commit_id;
    let history_set_id = store.commit_by_id(tip).unwrap().change_set_id.clone();
    let history_set = store.change_set(&history_set_id).unwrap();
    assert_eq!(history_set.elements.len(), 5);
    assert_ne!(
        history_set.id,
        store.commit_by_id(store.version(&main).unwrap().working_commit_id)
            .unwrap()
            .change_set_id
    );
}

#[rstest]
fn global_advances_with_every_commit(mut store: Lix) {
    let main = store.active_version().clone();
    let global: VersionId = GLOBAL_VERSION_ID.into();
    let global_tip_before = store.version(&global).unwrap().commit_id;

    put(&mut store, &main, "e1", "v1");
    let outcome = store.commit().unwrap();

    let global_tip = store.version(&global).unwrap().commit_id;
    assert_ne!(global_tip, global_tip_before);
    // The global commit is the last sub-commit of the same top-level commit.
    assert_eq!(outcome.committed.last().unwrap().0, global);
    assert_eq!(outcome.committed.last().unwrap().1, global_tip);

    // Its change set contains the pointer update for `main`.
    let global_commit = store.commit_by_id(global_tip).unwrap().clone();
    let set = store.change_set(&global_commit.change_set_id).unwrap();
    let pointer = set
        .elements
        .iter()
        .find(|e| {
            e.schema_key.as_str() == VERSION_SCHEMA && e.entity_id.as_str() == main.as_str()
        })
        .expect("global change set records the main pointer update");
    let change = store.change(pointer.change_id).unwrap();
    let snapshot = change.snapshot_content.as_ref().unwrap();
    assert_eq!(
        snapshot["commit_id"],
        json!(store.version(&main).unwrap().commit_id.index())
    );
}

#[rstest]
fn one_global_commit_absorbs_multiple_versions(mut store: Lix) {
    let main = store.active_version().clone();
    let other = store.create_version_with_id("other".into(), "other", None).unwrap();
    store.commit().unwrap();

    let global: VersionId = GLOBAL_VERSION_ID.into();
    let commits_before = store.all_commits().count();

    put(&mut store, &main, "e1", "v1");
    put(&mut store, &other, "e2", "v2");
    let outcome = store.commit().unwrap();

    // Two version commits plus exactly one global commit.
    assert_eq!(outcome.committed.len(), 3);
    assert_eq!(store.all_commits().count(), commits_before + 3);
    assert_eq!(
        outcome
            .committed
            .iter()
            .filter(|(v, _)| *v == global)
            .count(),
        1
    );
}

#[rstest]
fn tombstone_shadows_inherited_value(parent_child: (Lix, VersionId, VersionId)) {
    let (mut store, main, b) = parent_child;

    // Inherited before the deletion (tier 4).
    match store.resolve(&key("e1"), &b).unwrap() {
        Resolution::Value(state) => {
            assert_eq!(state.tier, Tier::InheritedCache);
            assert_eq!(state.inherited_from_version_id, Some(main.clone()));
        }
        other => panic!("expected inherited value, got {other:?}"),
    }

    delete(&mut store, &b, "e1");
    store.commit().unwrap();

    assert!(store.resolve(&key("e1"), &b).unwrap().is_tombstone());
    // The parent's value is untouched.
    assert_eq!(
        store.resolve(&key("e1"), &main).unwrap().value(),
        Some(&json!({ "v": "v1" }))
    );
}

#[rstest]
fn deletion_shadows_value_written_in_the_same_transaction(mut store: Lix) {
    let main = store.active_version().clone();
    let b = store.create_version_with_id("b".into(), "b", Some(&main)).unwrap();
    store.commit().unwrap();

    // The deletion is staged before the parent's insert; the outcome must
    // not depend on that order.
    delete(&mut store, &b, "e1");
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();

    assert!(store.resolve(&key("e1"), &b).unwrap().is_tombstone());
    assert_eq!(
        store.resolve(&key("e1"), &main).unwrap().value(),
        Some(&json!({ "v": "v1" }))
    );
}

#[rstest]
fn untracked_deletion_shadows_untracked_insert_in_the_same_transaction(mut store: Lix) {
    let main = store.active_version().clone();
    let b = store.create_version_with_id("b".into(), "b", Some(&main)).unwrap();
    store.commit().unwrap();

    store
        .stage(
            Mutation::delete("e1", "doc", "file-1")
                .in_version(b.clone())
                .untracked(),
        )
        .unwrap();
    store
        .stage(
            Mutation::insert("e1", "doc", "file-1", json!({ "v": "u" }))
                .in_version(main.clone())
                .untracked(),
        )
        .unwrap();
    store.commit().unwrap();

    assert!(store.resolve(&key("e1"), &b).unwrap().is_tombstone());
    assert_eq!(
        store.resolve(&key("e1"), &main).unwrap().value(),
        Some(&json!({ "v": "u" }))
    );
}

#[rstest]
fn ranking_prefers_the_lowest_tier(mut store: Lix) {
    let main = store.active_version().clone();

    // Tier 3: committed value.
    put(&mut store, &main, "e1", "committed");
    store.commit().unwrap();
    match store.resolve(&key("e1"), &main).unwrap() {
        Resolution::Value(state) => assert_eq!(state.tier, Tier::Cache),
        other => panic!("expected cache value, got {other:?}"),
    }

    // Tier 2: an untracked row shadows the committed value.
    store
        .stage(
            Mutation::insert("e1", "doc", "file-1", json!({ "v": "untracked" })).untracked(),
        )
        .unwrap();
    store.commit().unwrap();
    match store.resolve(&key("e1"), &main).unwrap() {
        Resolution::Value(state) => {
            assert_eq!(state.tier, Tier::Untracked);
            assert_eq!(state.snapshot_content, json!({ "v": "untracked" }));
        }
        other => panic!("expected untracked value, got {other:?}"),
    }

    // Tier 1: a pending entry shadows everything.
    put(&mut store, &main, "e1", "pending");
    match store.resolve(&key("e1"), &main).unwrap() {
        Resolution::Value(state) => {
            assert_eq!(state.tier, Tier::Pending);
            assert_eq!(state.snapshot_content, json!({ "v": "pending" }));
        }
        other => panic!("expected pending value, got {other:?}"),
    }
}

#[rstest]
fn inheritance_is_transitive(parent_child: (Lix, VersionId, VersionId)) {
    let (mut store, main, b) = parent_child;
    let c = store.create_version_with_id("c".into(), "c", Some(&b)).unwrap();
    store.commit().unwrap();

    // Neither b nor c has an own row; c sees main's value through b.
    match store.resolve(&key("e1"), &c).unwrap() {
        Resolution::Value(state) => {
            assert_eq!(state.tier, Tier::InheritedCache);
            assert_eq!(state.inherited_from_version_id, Some(main));
        }
        other => panic!("expected inherited value, got {other:?}"),
    }
}

#[rstest]
fn inherited_untracked_and_pending_tiers(parent_child: (Lix, VersionId, VersionId)) {
    let (mut store, main, b) = parent_child;

    store
        .stage(
            Mutation::insert("e2", "doc", "file-1", json!({ "v": "u" }))
                .in_version(main.clone())
                .untracked(),
        )
        .unwrap();
    store.commit().unwrap();
    match store.resolve(&key("e2"), &b).unwrap() {
        Resolution::Value(state) => assert_eq!(state.tier, Tier::InheritedUntracked),
        other => panic!("expected inherited untracked value, got {other:?}"),
    }

    // A parent's pending entry is visible from the child (tier 6).
    put(&mut store, &main, "e3", "p");
    match store.resolve(&key("e3"), &b).unwrap() {
        Resolution::Value(state) => assert_eq!(state.tier, Tier::InheritedPending),
        other => panic!("expected inherited pending value, got {other:?}"),
    }
}

#[rstest]
fn untracked_mutations_create_no_changes(mut store: Lix) {
    let changes_before = store.all_changes().count();
    store
        .stage(Mutation::insert("e1", "doc", "file-1", json!({ "v": 1 })).untracked())
        .unwrap();
    let outcome = store.commit().unwrap();

    assert!(outcome.is_noop());
    assert_eq!(store.all_changes().count(), changes_before);
    assert!(store.resolve_active(&key("e1")).value().is_some());
}

#[rstest]
fn untracked_tombstone_shadows(parent_child: (Lix, VersionId, VersionId)) {
    let (mut store, main, b) = parent_child;

    store
        .stage(
            Mutation::delete("e1", "doc", "file-1")
                .in_version(b.clone())
                .untracked(),
        )
        .unwrap();
    store.commit().unwrap();

    assert!(store.resolve(&key("e1"), &b).unwrap().is_tombstone());
    assert!(store.resolve(&key("e1"), &main).unwrap().value().is_some());
}

#[rstest]
fn merge_source_wins(mut store: Lix) {
    let main = store.active_version().clone();
    let a = store.create_version_with_id("a".into(), "a", Some(&main)).unwrap();
    let b2 = store.create_version_with_id("b2".into(), "b2", Some(&main)).unwrap();

    put(&mut store, &a, "k", "s");
    put(&mut store, &a, "only-a", "a");
    put(&mut store, &b2, "k", "t");
    put(&mut store, &b2, "only-b", "b");
    store.commit().unwrap();

    let source_set = store
        .commit_by_id(store.version(&a).unwrap().commit_id)
        .unwrap()
        .change_set_id
        .clone();
    let target_set = store
        .commit_by_id(store.version(&b2).unwrap().commit_id)
        .unwrap()
        .change_set_id
        .clone();

    let merged = store.merge(&source_set, &target_set).unwrap();
    let leaves = store.leaves_of(&merged).unwrap();

    let leaf_for = |entity: &str| {
        leaves
            .iter()
            .find(|e| e.entity_id.as_str() == entity && e.schema_key.as_str() == "doc")
            .unwrap_or_else(|| panic!("no leaf for {entity}"))
    };
    // Source wins on collision.
    let winner = store.change(leaf_for("k").change_id).unwrap();
    assert_eq!(winner.snapshot_content, Some(json!({ "v": "s" })));
    // Non-colliding keys from both sides survive.
    leaf_for("only-a");
    leaf_for("only-b");

    // The merge commit is a regular two-parent node.
    let merge_commit = *store
        .all_commits()
        .find(|c| c.change_set_id == merged)
        .map(|c| &c.id)
        .unwrap();
    let parents: Vec<_> = store
        .all_edges()
        .filter(|e| e.child_id == merge_commit)
        .map(|e| e.parent_id)
        .collect();
    assert_eq!(parents.len(), 2);
}

#[rstest]
fn registry_changes_do_not_cascade(mut store: Lix) {
    let main = store.active_version().clone();
    for i in 0..5 {
        put(&mut store, &main, &format!("e{i}"), "v");
    }
    let outcome = store.commit().unwrap();

    let count = |set: &ChangeSet, schema: &str| {
        set.elements
            .iter()
            .filter(|e| e.schema_key.as_str() == schema)
            .count()
    };

    // One author record per entity change and a fixed number of registry
    // changes however many entities were staged: the closure never
    // synthesizes registry changes for registry changes.
    let main_commit = outcome.committed[0].1;
    let main_set = store
        .change_set(&store.commit_by_id(main_commit).unwrap().change_set_id)
        .unwrap();
    assert_eq!(count(main_set, "doc"), 5);
    assert_eq!(count(main_set, CHANGE_AUTHOR_SCHEMA), 5);
    assert_eq!(count(main_set, CHANGE_SET_SCHEMA), 1);
    assert_eq!(count(main_set, COMMIT_SCHEMA), 1);
    assert_eq!(count(main_set, COMMIT_EDGE_SCHEMA), 1);
    assert_eq!(main_set.elements.len(), 13);

    // The global propagation commit describes one pointer entity change
    // plus its own fixed registry changes, and nothing further.
    let global_commit = outcome.committed[1].1;
    let global_set = store
        .change_set(&store.commit_by_id(global_commit).unwrap().change_set_id)
        .unwrap();
    assert_eq!(count(global_set, VERSION_SCHEMA), 2);
    assert_eq!(count(global_set, CHANGE_AUTHOR_SCHEMA), 1);
    assert_eq!(global_set.elements.len(), 7);
}

#[rstest]
fn notification_fires_once_per_top_level_commit(mut store: Lix) {
    let calls: Rc<RefCell<Vec<usize>>> = Rc::default();
    let seen = calls.clone();
    let id = store.on_commit(move |changes| seen.borrow_mut().push(changes.len()));

    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();

    // One notification despite the global sub-commit.
    assert_eq!(calls.borrow().len(), 1);
    // It carries entity and meta changes of all sub-commits.
    assert!(calls.borrow()[0] > 1);

    // Empty commits do not notify.
    store.commit().unwrap();
    assert_eq!(calls.borrow().len(), 1);

    assert!(store.unsubscribe(id));
    put(&mut store, &main, "e1", "v2");
    store.commit().unwrap();
    assert_eq!(calls.borrow().len(), 1);
    assert!(!store.unsubscribe(id));
}

#[rstest]
fn panicking_observer_does_not_fail_the_commit(mut store: Lix) {
    let calls: Rc<RefCell<u32>> = Rc::default();
    let seen = calls.clone();
    store.on_commit(|_| panic!("observer bug"));
    store.on_commit(move |_| *seen.borrow_mut() += 1);

    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();

    assert_eq!(*calls.borrow(), 1);
    assert!(store.resolve(&key("e1"), &main).unwrap().value().is_some());
}

#[rstest]
fn checkpoint_seals_the_working_change_set(mut store: Lix) {
    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    put(&mut store, &main, "e2", "v2");
    store.commit().unwrap();

    assert_eq!(store.working_elements(&main).unwrap().len(), 2);

    let checkpoint = store.create_checkpoint(&main).unwrap();

    assert!(store.working_elements(&main).unwrap().is_empty());
    assert_eq!(store.version(&main).unwrap().commit_id, checkpoint);
    let set_id = store.commit_by_id(checkpoint).unwrap().change_set_id.clone();
    assert_eq!(store.change_set(&set_id).unwrap().elements.len(), 2);

    // An empty working set cannot be checkpointed again.
    assert!(store.create_checkpoint(&main).is_err());
}

#[rstest]
fn version_creation_is_recorded_in_global_history(mut store: Lix) {
    let main = store.active_version().clone();
    let created = store
        .create_version_with_id("feature".into(), "feature", Some(&main))
        .unwrap();
    let outcome = store.commit().unwrap();

    let recorded = outcome.changes.iter().any(|c| {
        c.schema_key.as_str() == VERSION_SCHEMA && c.entity_id.as_str() == created.as_str()
    });
    assert!(recorded, "global history records the new version");
}

#[rstest]
fn invalid_version_reference_is_rejected_before_staging(mut store: Lix) {
    let err = store
        .stage(Mutation::insert("e1", "doc", "file-1", json!(1)).in_version("ghost"))
        .unwrap_err();
    assert!(matches!(
        err,
        crate::StateError::Version(VersionError::UnknownVersion(_))
    ));
    assert!(store.commit().unwrap().is_noop());
}

#[rstest]
fn inheritance_cycle_is_rejected_at_creation(mut store: Lix) {
    let err = store
        .create_version_with_id("x".into(), "x", Some(&"x".into()))
        .unwrap_err();
    assert!(matches!(
        err,
        crate::StateError::Version(VersionError::UnknownVersion(_) | VersionError::InheritanceCycle(_))
    ));
}

#[rstest]
fn stores_are_isolated(mut store: Lix) {
    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();

    let other = Lix::new();
    assert!(
        other
            .resolve(&key("e1"), other.active_version())
            .unwrap()
            .is_absent()
    );
}

#[rstest]
fn serial_round_trip_preserves_state(parent_child: (Lix, VersionId, VersionId)) {
    let (store, main, b) = parent_child;

    let serialized = serde_json::to_string(&store.to_serial()).unwrap();
    let restored = Lix::from_serial(serde_json::from_str(&serialized).unwrap()).unwrap();

    assert_eq!(
        restored.resolve(&key("e1"), &main).unwrap().value(),
        Some(&json!({ "v": "v1" }))
    );
    match restored.resolve(&key("e1"), &b).unwrap() {
        Resolution::Value(state) => assert_eq!(state.tier, Tier::InheritedCache),
        other => panic!("expected inherited value, got {other:?}"),
    }
    assert_eq!(
        restored.all_changes().count(),
        store.all_changes().count()
    );
    assert_eq!(restored.all_commits().count(), store.all_commits().count());
}

#[rstest]
fn serial_restore_rejects_dangling_registers(mut store: Lix) {
    let main = store.active_version().clone();
    put(&mut store, &main, "e1", "v1");
    store.commit().unwrap();

    let mut snapshot = store.to_serial();
    snapshot.active_version = "ghost".into();
    let err = Lix::from_serial(snapshot).unwrap_err();
    assert!(matches!(
        err,
        crate::StateError::Version(VersionError::UnknownVersion(_))
    ));

    let mut snapshot = store.to_serial();
    snapshot.root_commit = CommitId(u64::MAX);
    assert!(Lix::from_serial(snapshot).is_err());
}

/// The end-to-end scenario from the engine's contract: commit in a parent,
/// inherit in a child, shadow with a tombstone, parent unchanged.
#[rstest]
fn example_scenario(mut store: Lix) {
    let a = store.active_version().clone();
    put(&mut store, &a, "e1", "v1");
    store.commit().unwrap();
    assert_eq!(
        store.resolve(&key("e1"), &a).unwrap().value(),
        Some(&json!({ "v": "v1" }))
    );

    let b = store.create_version_with_id("b".into(), "b", Some(&a)).unwrap();
    store.commit().unwrap();
    assert_eq!(
        store.resolve(&key("e1"), &b).unwrap().value(),
        Some(&json!({ "v": "v1" }))
    );

    delete(&mut store, &b, "e1");
    store.commit().unwrap();
    assert!(store.resolve(&key("e1"), &b).unwrap().is_not_visible());
    assert_eq!(
        store.resolve(&key("e1"), &a).unwrap().value(),
        Some(&json!({ "v": "v1" }))
    );
}

//! Instance merging: eligibility, descriptor dedup, sample transfer and
//! pruning of non-mergeable labels and tags.

mod common;

use uuid::Uuid;

use common::Harness;
use koi::errors::AppError;
use koi::models::access::ScopeRef;
use koi::models::catalog::{Instance, Model};
use koi::store::blob::BlobStore;
use koi::store::Store;

async fn finalized(h: &Harness, model: &Model, name: &str) -> Instance {
    let inst = h.instance(model, name).await;
    h.state
        .catalog
        .finalize_instance(h.admin.id, model.id, inst.id)
        .await
        .unwrap()
}

async fn descriptor(h: &Harness, model: &Model, inst: &Instance, key: &str, content: &str) -> Uuid {
    h.state
        .catalog
        .add_descriptor(
            h.admin.id,
            model.id,
            inst.id,
            key,
            Some(content.as_bytes().to_vec()),
        )
        .await
        .unwrap()
        .id
}

/// Ids of the target's samples, tags and descriptors, each sorted.
async fn snapshot(h: &Harness, model: &Model, inst: &Instance) -> (Vec<Uuid>, Vec<Uuid>, Vec<Uuid>) {
    let catalog = &h.state.catalog;
    let admin = h.admin.id;
    let mut samples: Vec<Uuid> = catalog
        .list_samples(admin, model.id, inst.id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.id)
        .collect();
    let mut tags: Vec<Uuid> = catalog
        .list_tags(admin, model.id, inst.id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    let mut descriptors: Vec<Uuid> = catalog
        .list_descriptors(admin, model.id, inst.id)
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    samples.sort();
    tags.sort();
    descriptors.sort();
    (samples, tags, descriptors)
}

#[tokio::test]
async fn test_target_must_be_finalized() {
    let h = Harness::new().await;
    let model = h.model().await;
    let target = h.instance(&model, "target").await;
    let source = h.instance(&model, "source").await;

    let err = h
        .state
        .merge
        .merge(h.admin.id, target.id, &[source.id])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let inst = h
        .state
        .catalog
        .get_instance(h.admin.id, model.id, source.id)
        .await
        .unwrap();
    assert!(inst.merged_into.is_none());
}

#[tokio::test]
async fn test_unknown_target_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .state
        .merge
        .merge(h.admin.id, Uuid::new_v4(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_merged_source_is_skipped_on_second_call() {
    let h = Harness::new().await;
    let model = h.model().await;
    let target = finalized(&h, &model, "target").await;
    let source = h.instance(&model, "source").await;
    descriptor(&h, &model, &source, "classes", "1").await;
    let sample = h
        .state
        .catalog
        .add_sample(h.admin.id, model.id, source.id)
        .await
        .unwrap();
    h.state
        .catalog
        .tag_sample(h.admin.id, model.id, source.id, sample.id, "night")
        .await
        .unwrap();

    let first = h
        .state
        .merge
        .merge(h.admin.id, target.id, &[source.id])
        .await
        .unwrap();
    assert_eq!(first.merged, vec![source.id]);
    let before = snapshot(&h, &model, &target).await;
    assert_eq!(before.0.len(), 1);

    let merged = h
        .state
        .catalog
        .get_instance(h.admin.id, model.id, source.id)
        .await
        .unwrap();
    assert_eq!(merged.merged_into, Some(target.id));

    let second = h
        .state
        .merge
        .merge(h.admin.id, target.id, &[source.id])
        .await
        .unwrap();
    assert!(second.merged.is_empty());
    assert_eq!(second.skipped, vec![source.id]);
    assert_eq!(second.samples_moved, 0);
    assert_eq!(second.descriptors_added, 0);

    assert_eq!(snapshot(&h, &model, &target).await, before);
}

#[tokio::test]
async fn test_failed_merge_rolls_back_every_source() {
    let h = Harness::new().await;
    let model = h.model().await;
    let catalog = &h.state.catalog;
    let admin = h.admin.id;
    let target = finalized(&h, &model, "target").await;

    let a = h.instance(&model, "a").await;
    let sample = catalog.add_sample(admin, model.id, a.id).await.unwrap();
    catalog
        .tag_sample(admin, model.id, a.id, sample.id, "night")
        .await
        .unwrap();

    // b's descriptor points at a blob that no longer exists
    let b = h.instance(&model, "b").await;
    descriptor(&h, &model, &b, "classes", "1").await;
    let broken = catalog.list_descriptors(admin, model.id, b.id).await.unwrap();
    h.blobs
        .delete(broken[0].file.as_ref().unwrap())
        .await
        .unwrap();

    let result = h.state.merge.merge(admin, target.id, &[a.id, b.id]).await;
    assert!(result.is_err());

    let a_after = catalog.get_instance(admin, model.id, a.id).await.unwrap();
    assert!(a_after.merged_into.is_none());
    let a_samples = catalog.list_samples(admin, model.id, a.id).await.unwrap();
    assert_eq!(a_samples.len(), 1);
    assert_eq!(a_samples[0].id, sample.id);
    assert_eq!(catalog.list_tags(admin, model.id, a.id).await.unwrap().len(), 1);

    let b_after = catalog.get_instance(admin, model.id, b.id).await.unwrap();
    assert!(b_after.merged_into.is_none());

    assert!(catalog.list_samples(admin, model.id, target.id).await.unwrap().is_empty());
    assert!(catalog.list_tags(admin, model.id, target.id).await.unwrap().is_empty());
    assert!(catalog
        .list_descriptors(admin, model.id, target.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_and_self_sources_are_skipped() {
    let h = Harness::new().await;
    let model = h.model().await;
    let target = finalized(&h, &model, "target").await;
    let ghost = Uuid::new_v4();

    let report = h
        .state
        .merge
        .merge(h.admin.id, target.id, &[ghost, target.id])
        .await
        .unwrap();
    assert!(report.merged.is_empty());
    assert_eq!(report.skipped.len(), 2);
}

#[tokio::test]
async fn test_descriptors_are_deduplicated_by_key_and_content() {
    let h = Harness::new().await;
    let model = h.model().await;

    let target = h.instance(&model, "target").await;
    let original = descriptor(&h, &model, &target, "classes", "1").await;
    h.state
        .catalog
        .finalize_instance(h.admin.id, model.id, target.id)
        .await
        .unwrap();

    let s1 = h.instance(&model, "s1").await;
    descriptor(&h, &model, &s1, "classes", "1").await;
    descriptor(&h, &model, &s1, "classes", "2").await;
    let s2 = h.instance(&model, "s2").await;
    descriptor(&h, &model, &s2, "classes", "2").await;

    let report = h
        .state
        .merge
        .merge(h.admin.id, target.id, &[s1.id, s2.id])
        .await
        .unwrap();
    assert_eq!(report.merged, vec![s1.id, s2.id]);
    assert_eq!(report.descriptors_added, 1);

    let descriptors = h
        .state
        .catalog
        .list_descriptors(h.admin.id, model.id, target.id)
        .await
        .unwrap();
    assert_eq!(descriptors.len(), 2);
    assert!(descriptors.iter().any(|d| d.id == original));

    let mut contents = Vec::new();
    for d in &descriptors {
        assert_eq!(d.key, "classes");
        let file = d.file.as_ref().unwrap();
        contents.push(h.blobs.get(file).await.unwrap());
    }
    contents.sort();
    assert_eq!(contents, vec![b"1".to_vec(), b"2".to_vec()]);
}

#[tokio::test]
async fn test_samples_move_with_new_ids_and_pruned_annotations() {
    let h = Harness::new().await;
    let model = h.model().await;
    let target = finalized(&h, &model, "target").await;
    let source = h.instance(&model, "source").await;
    let catalog = &h.state.catalog;
    let admin = h.admin.id;

    let sample = catalog.add_sample(admin, model.id, source.id).await.unwrap();
    catalog
        .add_sample_data(admin, model.id, source.id, sample.id, "image", Some(b"px".to_vec()))
        .await
        .unwrap();
    catalog
        .add_label(admin, model.id, source.id, sample.id, "class", Some(b"cat".to_vec()))
        .await
        .unwrap();
    catalog
        .tag_sample(admin, model.id, source.id, sample.id, "kept")
        .await
        .unwrap();
    catalog
        .finalize_sample(admin, model.id, source.id, sample.id)
        .await
        .unwrap();
    let late = catalog
        .add_label(admin, model.id, source.id, sample.id, "class", Some(b"dog".to_vec()))
        .await
        .unwrap();
    catalog
        .tag_sample(admin, model.id, source.id, sample.id, "dropped")
        .await
        .unwrap();

    let report = h
        .state
        .merge
        .merge(admin, target.id, &[source.id])
        .await
        .unwrap();
    assert_eq!(report.samples_moved, 1);
    assert_eq!(report.labels_purged, 1);
    assert_eq!(report.tag_links_purged, 1);

    let samples = catalog.list_samples(admin, model.id, target.id).await.unwrap();
    assert_eq!(samples.len(), 1);
    let moved = &samples[0];
    assert_ne!(moved.id, sample.id);
    assert!(catalog
        .list_samples(admin, model.id, source.id)
        .await
        .unwrap()
        .is_empty());

    let data = catalog
        .list_sample_data(admin, model.id, target.id, moved.id)
        .await
        .unwrap();
    assert_eq!(data.len(), 1);

    let labels = catalog
        .list_labels(admin, model.id, target.id, moved.id)
        .await
        .unwrap();
    assert_eq!(labels.len(), 1);
    assert!(labels[0].mergeable);
    // purged label blobs are gone after commit
    assert!(h.blobs.get(late.file.as_ref().unwrap()).await.is_err());

    let target_tags = catalog.list_tags(admin, model.id, target.id).await.unwrap();
    assert_eq!(target_tags.len(), 1);
    assert_eq!(target_tags[0].name, "kept");

    let links = catalog
        .list_sample_tags(admin, model.id, target.id, moved.id)
        .await
        .unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].tag_id, target_tags[0].id);

    // the tag only held together by the dropped link is gone
    let mut tx = h.store.begin().await.unwrap();
    let source_tags = tx.list_tags(source.id).await.unwrap();
    assert!(source_tags.iter().all(|t| t.name != "dropped"));
}

#[tokio::test]
async fn test_existing_target_tag_is_reused() {
    let h = Harness::new().await;
    let model = h.model().await;
    let catalog = &h.state.catalog;
    let admin = h.admin.id;

    let target = h.instance(&model, "target").await;
    let t_sample = catalog.add_sample(admin, model.id, target.id).await.unwrap();
    let existing = catalog
        .tag_sample(admin, model.id, target.id, t_sample.id, "night")
        .await
        .unwrap();
    catalog
        .finalize_instance(admin, model.id, target.id)
        .await
        .unwrap();

    let source = h.instance(&model, "source").await;
    let s_sample = catalog.add_sample(admin, model.id, source.id).await.unwrap();
    catalog
        .tag_sample(admin, model.id, source.id, s_sample.id, "night")
        .await
        .unwrap();

    h.state.merge.merge(admin, target.id, &[source.id]).await.unwrap();

    let tags = catalog.list_tags(admin, model.id, target.id).await.unwrap();
    assert_eq!(tags.len(), 1);
    for sample in catalog.list_samples(admin, model.id, target.id).await.unwrap() {
        let links = catalog
            .list_sample_tags(admin, model.id, target.id, sample.id)
            .await
            .unwrap();
        assert_eq!(links[0].tag_id, existing.tag_id);
    }
}

#[tokio::test]
async fn test_sources_without_edit_are_skipped() {
    let h = Harness::new().await;
    let model = h.model().await;
    let target = finalized(&h, &model, "target").await;
    let mine = h.instance(&model, "mine").await;
    let foreign = h.instance(&model, "foreign").await;

    let bob = h.add_user("bob").await;
    h.grant(bob.id, ScopeRef::Instance(target.id), "worker").await;
    h.grant(bob.id, ScopeRef::Instance(mine.id), "worker").await;
    h.grant(bob.id, ScopeRef::Instance(foreign.id), "guest").await;

    let report = h
        .state
        .merge
        .merge(bob.id, target.id, &[mine.id, foreign.id])
        .await
        .unwrap();
    assert_eq!(report.merged, vec![mine.id]);
    assert_eq!(report.skipped, vec![foreign.id]);

    let untouched = h
        .state
        .catalog
        .get_instance(h.admin.id, model.id, foreign.id)
        .await
        .unwrap();
    assert!(untouched.merged_into.is_none());
}

#[tokio::test]
async fn test_merge_requires_edit_on_target() {
    let h = Harness::new().await;
    let model = h.model().await;
    let target = finalized(&h, &model, "target").await;
    let source = h.instance(&model, "source").await;

    let bob = h.add_user("bob").await;
    h.grant(bob.id, ScopeRef::Instance(target.id), "guest").await;
    h.grant(bob.id, ScopeRef::Instance(source.id), "owner").await;

    let err = h
        .state
        .merge
        .merge(bob.id, target.id, &[source.id])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

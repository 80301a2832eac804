#![forbid(unsafe_code)]

use meridian_kernel_contracts::mapping::{MappingId, MappingRecord, MappingWriteInput};
use meridian_kernel_contracts::tenant::{
    EntityId, EntityRecord, EntityStatus, InvariantKind, TenantId,
};
use meridian_kernel_contracts::MonotonicTimeNs;
use meridian_storage::repo::{EntityRepo, MappingRepo};
use meridian_storage::store::{CoreStore, StorageError};

fn tenant_a() -> TenantId {
    TenantId::new("tenant_a").unwrap()
}

fn tenant_b() -> TenantId {
    TenantId::new("tenant_b").unwrap()
}

fn entity_record(tenant: &TenantId, entity: &str, url: Option<&str>) -> EntityRecord {
    EntityRecord::v1(
        tenant.clone(),
        EntityId::new(entity).unwrap(),
        EntityStatus::Inactive,
        url.map(|u| u.to_string()),
        false,
        MonotonicTimeNs(1),
        MonotonicTimeNs(1),
    )
    .unwrap()
}

fn store_with_entities() -> CoreStore {
    let mut s = CoreStore::new_in_memory();
    s.insert_entity_row(entity_record(
        &tenant_a(),
        "store_1",
        Some("https://shop.example/a1"),
    ))
    .unwrap();
    s.insert_entity_row(entity_record(&tenant_a(), "store_2", None))
        .unwrap();
    s.insert_entity_row(entity_record(
        &tenant_b(),
        "store_9",
        Some("https://shop.example/b9"),
    ))
    .unwrap();
    s
}

fn mapping_input(
    mapping: &str,
    entity: &str,
    declared_tenant: &TenantId,
    enabled: bool,
) -> MappingWriteInput {
    MappingWriteInput::v1(
        MappingId::new(mapping).unwrap(),
        EntityId::new(entity).unwrap(),
        declared_tenant.clone(),
        enabled,
        "https://source.example/feed".to_string(),
        0,
        None,
    )
    .unwrap()
}

fn write_mapping(s: &mut CoreStore, input: MappingWriteInput, t: u64) -> StorageError {
    s.mapping_write_commit_row(input, Default::default(), MonotonicTimeNs(t))
        .unwrap_err()
}

#[test]
fn at_em_db_01_entity_ids_are_globally_unique() {
    let mut s = store_with_entities();
    let err = s
        .insert_entity_row(entity_record(&tenant_b(), "store_1", None))
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::DuplicateKey { table: "entities", .. }
    ));
}

#[test]
fn at_em_db_02_tenant_reads_never_cross_tenants() {
    let s = store_with_entities();
    let a_rows = s.entity_rows_for_tenant(&tenant_a());
    let b_rows = s.entity_rows_for_tenant(&tenant_b());
    assert_eq!(a_rows.len(), 2);
    assert_eq!(b_rows.len(), 1);
    assert!(a_rows.iter().all(|e| e.tenant_id == tenant_a()));
    assert!(s
        .entity_row(&tenant_b(), &EntityId::new("store_1").unwrap())
        .is_none());
}

#[test]
fn at_em_db_03_mapping_write_stamps_owning_tenant() {
    let mut s = store_with_entities();
    // Caller declares the wrong tenant; the committed row carries the owner's.
    let out = s
        .mapping_write_commit_row(
            mapping_input("map_1", "store_1", &tenant_b(), true),
            Default::default(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    assert!(out.tenant_corrected);
    assert!(out.created);
    assert_eq!(out.record.tenant_id, tenant_a());
    assert!(s
        .mapping_rows_for_entity(&tenant_b(), &EntityId::new("store_1").unwrap())
        .is_empty());
}

#[test]
fn at_em_db_04_second_enabled_mapping_refused() {
    let mut s = store_with_entities();
    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(10),
    )
    .unwrap();

    let err = write_mapping(&mut s, mapping_input("map_2", "store_1", &tenant_a(), true), 11);
    assert_eq!(
        err,
        StorageError::InvariantViolation {
            entity_id: EntityId::new("store_1").unwrap(),
            kind: InvariantKind::MultipleEnabledMappings,
        }
    );
    // A disabled second mapping is fine, and re-enabling the holder is a no-op
    // against the constraint.
    s.mapping_write_commit_row(
        mapping_input("map_2", "store_1", &tenant_a(), false),
        Default::default(),
        MonotonicTimeNs(12),
    )
    .unwrap();
    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(13),
    )
    .unwrap();
    assert_eq!(
        s.enabled_mapping_count(&tenant_a(), &EntityId::new("store_1").unwrap()),
        1
    );
}

#[test]
fn at_em_db_05_disabling_holder_frees_the_enabled_slot() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(10),
    )
    .unwrap();
    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), false),
        Default::default(),
        MonotonicTimeNs(11),
    )
    .unwrap();
    assert_eq!(s.enabled_mapping_count(&tenant_a(), &entity), 0);
    assert!(s.enabled_mapping_slot(&tenant_a(), &entity).is_none());

    s.mapping_write_commit_row(
        mapping_input("map_2", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(12),
    )
    .unwrap();
    assert_eq!(
        s.enabled_mapping_slot(&tenant_a(), &entity),
        Some(&MappingId::new("map_2").unwrap())
    );
}

#[test]
fn at_em_db_06_mapping_write_replays_on_idempotency_key() {
    let mut s = store_with_entities();
    let input = MappingWriteInput::v1(
        MappingId::new("map_1").unwrap(),
        EntityId::new("store_1").unwrap(),
        tenant_a(),
        true,
        "https://source.example/feed".to_string(),
        0,
        Some("write_req_7".to_string()),
    )
    .unwrap();

    let first = s
        .mapping_write_commit_row(input.clone(), Default::default(), MonotonicTimeNs(10))
        .unwrap();
    let second = s
        .mapping_write_commit_row(input, Default::default(), MonotonicTimeNs(99))
        .unwrap();
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.record, first.record);
    assert_eq!(second.record.updated_at, MonotonicTimeNs(10));
}

#[test]
fn at_em_db_07_unchecked_load_admits_multiple_enabled_then_collapse_repairs() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    for (id, updated) in [("map_old", 50u64), ("map_new", 90), ("map_mid", 70)] {
        s.mapping_load_row_unchecked(
            MappingRecord::v1(
                MappingId::new(id).unwrap(),
                entity.clone(),
                tenant_a(),
                true,
                "https://source.example/feed".to_string(),
                0,
                MonotonicTimeNs(10),
                MonotonicTimeNs(updated),
            )
            .unwrap(),
        )
        .unwrap();
    }
    assert_eq!(s.enabled_mapping_count(&tenant_a(), &entity), 3);

    let out = s
        .collapse_to_one_enabled_commit_row(&tenant_a(), &entity, MonotonicTimeNs(100))
        .unwrap();
    assert_eq!(out.survivor, Some(MappingId::new("map_new").unwrap()));
    assert_eq!(out.disabled.len(), 2);
    assert_eq!(s.enabled_mapping_count(&tenant_a(), &entity), 1);
    assert!(
        s.mapping_row(&MappingId::new("map_new").unwrap())
            .unwrap()
            .enabled
    );
    assert_eq!(
        s.mapping_row(&MappingId::new("map_old").unwrap())
            .unwrap()
            .updated_at,
        MonotonicTimeNs(100)
    );
}

#[test]
fn at_em_db_08_collapse_is_a_noop_at_zero_or_one_enabled() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    let none = s
        .collapse_to_one_enabled_commit_row(&tenant_a(), &entity, MonotonicTimeNs(10))
        .unwrap();
    assert_eq!(none.survivor, None);
    assert!(none.disabled.is_empty());

    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(11),
    )
    .unwrap();
    let one = s
        .collapse_to_one_enabled_commit_row(&tenant_a(), &entity, MonotonicTimeNs(12))
        .unwrap();
    assert_eq!(one.survivor, Some(MappingId::new("map_1").unwrap()));
    assert!(one.disabled.is_empty());
}

#[test]
fn at_em_db_09_ensure_mapping_backfills_from_legacy_url_only_when_table_empty() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();

    let created = s
        .ensure_mapping_commit_row(
            &tenant_a(),
            &entity,
            MappingId::new("map_backfill").unwrap(),
            MonotonicTimeNs(10),
        )
        .unwrap()
        .expect("legacy url present, table empty");
    assert!(created.enabled);
    assert_eq!(created.source_url, "https://shop.example/a1");
    assert_eq!(s.enabled_mapping_count(&tenant_a(), &entity), 1);

    // Second run is a no-op: the table is no longer empty.
    let again = s
        .ensure_mapping_commit_row(
            &tenant_a(),
            &entity,
            MappingId::new("map_backfill_2").unwrap(),
            MonotonicTimeNs(11),
        )
        .unwrap();
    assert!(again.is_none());

    // No legacy url, no backfill.
    let bare = s
        .ensure_mapping_commit_row(
            &tenant_a(),
            &EntityId::new("store_2").unwrap(),
            MappingId::new("map_backfill_3").unwrap(),
            MonotonicTimeNs(12),
        )
        .unwrap();
    assert!(bare.is_none());
}

#[test]
fn at_em_db_10_activation_gate_refuses_each_broken_precondition() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();

    // No enabled mapping yet.
    let err = s
        .entity_activate_commit_row(&tenant_a(), &entity, MonotonicTimeNs(10))
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::InvariantViolation {
            entity_id: entity.clone(),
            kind: InvariantKind::NoEnabledMapping,
        }
    );

    // Multiple enabled mappings via snapshot import.
    for id in ["map_1", "map_2"] {
        s.mapping_load_row_unchecked(
            MappingRecord::v1(
                MappingId::new(id).unwrap(),
                entity.clone(),
                tenant_a(),
                true,
                "https://source.example/feed".to_string(),
                0,
                MonotonicTimeNs(10),
                MonotonicTimeNs(10),
            )
            .unwrap(),
        )
        .unwrap();
    }
    let err = s
        .entity_activate_commit_row(&tenant_a(), &entity, MonotonicTimeNs(11))
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::InvariantViolation {
            entity_id: entity.clone(),
            kind: InvariantKind::MultipleEnabledMappings,
        }
    );

    // Exactly one enabled but the activation url is missing.
    s.collapse_to_one_enabled_commit_row(&tenant_a(), &entity, MonotonicTimeNs(12))
        .unwrap();
    s.update_entity_activation_url_row(&tenant_a(), &entity, None, MonotonicTimeNs(13))
        .unwrap();
    let err = s
        .entity_activate_commit_row(&tenant_a(), &entity, MonotonicTimeNs(14))
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::InvariantViolation {
            entity_id: entity.clone(),
            kind: InvariantKind::ActivationUrlMissing,
        }
    );
    // Every refusal left the entity untouched.
    assert_eq!(
        s.entity_row(&tenant_a(), &entity).unwrap().status,
        EntityStatus::Inactive
    );
}

#[test]
fn at_em_db_11_activation_commits_once_preconditions_hold() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(10),
    )
    .unwrap();

    let row = s
        .entity_set_status_commit_row(&tenant_a(), &entity, EntityStatus::Active, MonotonicTimeNs(11))
        .unwrap();
    assert_eq!(row.status, EntityStatus::Active);
    assert!(row.has_active_mapping);

    // Non-activating transitions bypass the gate.
    let row = s
        .entity_set_status_commit_row(
            &tenant_a(),
            &entity,
            EntityStatus::Suspended,
            MonotonicTimeNs(12),
        )
        .unwrap();
    assert_eq!(row.status, EntityStatus::Suspended);
}

#[test]
fn at_em_db_12_flag_recompute_follows_the_mapping_table() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    assert!(!s
        .entity_flag_recompute_commit_row(&tenant_a(), &entity, MonotonicTimeNs(10))
        .unwrap());

    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(11),
    )
    .unwrap();
    assert!(s
        .entity_flag_recompute_commit_row(&tenant_a(), &entity, MonotonicTimeNs(12))
        .unwrap());
    assert!(s.entity_row(&tenant_a(), &entity).unwrap().has_active_mapping);
}

#[test]
fn at_em_db_13_advisory_flag_lock_is_exclusive_per_entity() {
    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    assert!(s.entity_flag_lock_acquire(&tenant_a(), &entity));
    assert!(!s.entity_flag_lock_acquire(&tenant_a(), &entity));
    assert!(s.entity_flag_lock_held(&tenant_a(), &entity));
    // Another entity's lock is independent.
    assert!(s.entity_flag_lock_acquire(&tenant_a(), &EntityId::new("store_2").unwrap()));
    assert!(s.entity_flag_lock_release(&tenant_a(), &entity));
    assert!(!s.entity_flag_lock_held(&tenant_a(), &entity));
}

#[test]
fn at_em_db_14_repo_traits_expose_the_same_rows() {
    fn enabled_count_via_repo<R: MappingRepo>(repo: &R, t: &TenantId, e: &EntityId) -> usize {
        repo.enabled_mapping_count(t, e)
    }
    fn entity_via_repo<'a, R: EntityRepo>(
        repo: &'a R,
        t: &TenantId,
        e: &EntityId,
    ) -> Option<&'a EntityRecord> {
        repo.entity_row(t, e)
    }

    let mut s = store_with_entities();
    let entity = EntityId::new("store_1").unwrap();
    s.mapping_write_commit_row(
        mapping_input("map_1", "store_1", &tenant_a(), true),
        Default::default(),
        MonotonicTimeNs(10),
    )
    .unwrap();

    assert_eq!(enabled_count_via_repo(&s, &tenant_a(), &entity), 1);
    assert!(entity_via_repo(&s, &tenant_a(), &entity).is_some());
}

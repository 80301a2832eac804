#![forbid(unsafe_code)]

use meridian_kernel_contracts::audit::{
    AuditEventInput, AuditEventType, AuditPayloadMin, AuditSeverity,
};
use meridian_kernel_contracts::effects::{FlagUpdate, RollupDeltaAt, WriteEffects};
use meridian_kernel_contracts::fact::{FactBody, FactId, FactWriteInput, OrderFact};
use meridian_kernel_contracts::rollup::RollupDelta;
use meridian_kernel_contracts::tenant::{EntityId, EntityRecord, EntityStatus, TenantId};
use meridian_kernel_contracts::{DayStamp, MonotonicTimeNs, ReasonCodeId, NS_PER_DAY};
use meridian_storage::repo::{AuditRepo, FactLedgerRepo};
use meridian_storage::store::{CoreStore, StorageError};
use rust_decimal::Decimal;

fn tenant_a() -> TenantId {
    TenantId::new("tenant_a").unwrap()
}

fn tenant_b() -> TenantId {
    TenantId::new("tenant_b").unwrap()
}

fn entity() -> EntityId {
    EntityId::new("store_1").unwrap()
}

fn day(n: u32) -> DayStamp {
    DayStamp(n)
}

fn at_day(n: u32, offset_ns: u64) -> MonotonicTimeNs {
    MonotonicTimeNs(n as u64 * NS_PER_DAY + offset_ns)
}

fn store_with_entity() -> CoreStore {
    let mut s = CoreStore::new_in_memory();
    s.insert_entity_row(
        EntityRecord::v1(
            tenant_a(),
            entity(),
            EntityStatus::Active,
            Some("https://shop.example/a1".to_string()),
            true,
            MonotonicTimeNs(1),
            MonotonicTimeNs(1),
        )
        .unwrap(),
    )
    .unwrap();
    s
}

fn order_input(
    declared_tenant: &TenantId,
    amount: Decimal,
    confirmed: bool,
    occurred_at: MonotonicTimeNs,
    idempotency_key: Option<&str>,
) -> FactWriteInput {
    FactWriteInput::v1(
        declared_tenant.clone(),
        entity(),
        occurred_at,
        FactBody::Order(OrderFact {
            amount,
            ai_confirmed: confirmed,
        }),
        idempotency_key.map(|k| k.to_string()),
    )
    .unwrap()
}

fn order_delta(amount: Decimal, confirmed: bool, d: DayStamp) -> WriteEffects {
    WriteEffects {
        rollup_deltas: vec![RollupDeltaAt {
            tenant_id: tenant_a(),
            entity_id: entity(),
            day: d,
            delta: RollupDelta {
                orders_count: 1,
                ai_confirmations: if confirmed { 1 } else { 0 },
                revenue: amount,
                ..RollupDelta::none()
            },
        }],
        flag_updates: Vec::new(),
        audit_events: Vec::new(),
    }
}

#[test]
fn at_fr_db_01_fact_append_applies_staged_delta_in_the_same_commit() {
    let mut s = store_with_entity();
    let amount = Decimal::new(1050, 2);
    let out = s
        .fact_append_commit_row(
            order_input(&tenant_a(), amount, true, at_day(100, 5), None),
            order_delta(amount, true, day(100)),
            MonotonicTimeNs(10),
        )
        .unwrap();
    assert_eq!(out.record.fact_id, FactId(1));
    assert!(!out.tenant_corrected);
    assert!(!out.replayed);

    let row = s.rollup_row(&tenant_a(), &entity(), day(100)).unwrap();
    assert_eq!(row.orders_count, 1);
    assert_eq!(row.ai_confirmations, 1);
    assert_eq!(row.revenue, amount);
    assert_eq!(row.conversations, 0);
}

#[test]
fn at_fr_db_02_fact_append_stamps_owner_tenant_over_declared() {
    let mut s = store_with_entity();
    let out = s
        .fact_append_commit_row(
            order_input(&tenant_b(), Decimal::ONE, false, at_day(100, 0), None),
            WriteEffects::empty(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    assert!(out.tenant_corrected);
    assert_eq!(out.record.tenant_id, tenant_a());
    assert!(s.fact_rows_for_tenant(&tenant_b()).is_empty());
    assert_eq!(s.fact_rows_for_tenant(&tenant_a()).len(), 1);
}

#[test]
fn at_fr_db_03_fact_append_requires_a_known_entity() {
    let mut s = store_with_entity();
    let input = FactWriteInput::v1(
        tenant_a(),
        EntityId::new("store_unknown").unwrap(),
        at_day(100, 0),
        FactBody::Conversation,
        None,
    )
    .unwrap();
    let err = s
        .fact_append_commit_row(input, WriteEffects::empty(), MonotonicTimeNs(10))
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::ForeignKeyViolation { table: "entities", .. }
    ));
    assert!(s.fact_rows().is_empty());
}

#[test]
fn at_fr_db_04_idempotent_replay_returns_the_committed_row_without_redelta() {
    let mut s = store_with_entity();
    let amount = Decimal::from(20);
    let first = s
        .fact_append_commit_row(
            order_input(&tenant_a(), amount, false, at_day(100, 0), Some("req_1")),
            order_delta(amount, false, day(100)),
            MonotonicTimeNs(10),
        )
        .unwrap();
    let replay = s
        .fact_append_commit_row(
            order_input(&tenant_a(), amount, false, at_day(100, 0), Some("req_1")),
            order_delta(amount, false, day(100)),
            MonotonicTimeNs(11),
        )
        .unwrap();

    assert!(replay.replayed);
    assert_eq!(replay.record, first.record);
    assert_eq!(s.fact_rows().len(), 1);
    let row = s.rollup_row(&tenant_a(), &entity(), day(100)).unwrap();
    assert_eq!(row.orders_count, 1);
    assert_eq!(row.revenue, amount);
}

#[test]
fn at_fr_db_05_fact_ledger_is_append_only() {
    let mut s = store_with_entity();
    s.fact_append_commit_row(
        order_input(&tenant_a(), Decimal::ONE, false, at_day(100, 0), None),
        WriteEffects::empty(),
        MonotonicTimeNs(10),
    )
    .unwrap();
    let err = s.attempt_overwrite_fact_row(FactId(1)).unwrap_err();
    assert_eq!(
        err,
        StorageError::AppendOnlyViolation {
            table: "fact_ledger"
        }
    );
}

#[test]
fn at_fr_db_06_confirmation_counts_once_across_flag_flips() {
    let mut s = store_with_entity();
    let out = s
        .fact_append_commit_row(
            order_input(&tenant_a(), Decimal::TEN, false, at_day(100, 0), None),
            WriteEffects::empty(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    let fact_id = out.record.fact_id;

    let first = s
        .order_confirm_commit_row(fact_id, true, WriteEffects::empty(), MonotonicTimeNs(11))
        .unwrap();
    assert!(first.counted);
    assert!(!first.previously_confirmed);
    assert_eq!(first.record.ai_confirmed_at, Some(MonotonicTimeNs(11)));

    let unflag = s
        .order_confirm_commit_row(fact_id, false, WriteEffects::empty(), MonotonicTimeNs(12))
        .unwrap();
    assert!(!unflag.counted);
    // The first-confirmation timestamp never clears.
    assert_eq!(unflag.record.ai_confirmed_at, Some(MonotonicTimeNs(11)));

    let reflag = s
        .order_confirm_commit_row(fact_id, true, WriteEffects::empty(), MonotonicTimeNs(13))
        .unwrap();
    assert!(!reflag.counted);
    assert!(reflag.record.ever_confirmed());
}

#[test]
fn at_fr_db_07_confirmation_requires_an_order_fact() {
    let mut s = store_with_entity();
    let out = s
        .fact_append_commit_row(
            FactWriteInput::v1(tenant_a(), entity(), at_day(100, 0), FactBody::Conversation, None)
                .unwrap(),
            WriteEffects::empty(),
            MonotonicTimeNs(10),
        )
        .unwrap();
    let err = s
        .order_confirm_commit_row(
            out.record.fact_id,
            true,
            WriteEffects::empty(),
            MonotonicTimeNs(11),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
}

#[test]
fn at_fr_db_08_negative_delta_components_are_clamped_to_zero_floor() {
    let mut s = store_with_entity();
    s.rollup_apply_delta(
        &tenant_a(),
        &entity(),
        day(100),
        RollupDelta {
            orders_count: 2,
            revenue: Decimal::from(30),
            ..RollupDelta::none()
        },
    );
    let clamped = s.rollup_apply_delta(
        &tenant_a(),
        &entity(),
        day(100),
        RollupDelta {
            orders_count: -5,
            conversations: 1,
            revenue: Decimal::from(-100),
            ..RollupDelta::none()
        },
    );
    assert!(clamped);

    // Negative components were dropped, not subtracted; positive ones applied.
    let row = s.rollup_row(&tenant_a(), &entity(), day(100)).unwrap();
    assert_eq!(row.orders_count, 2);
    assert_eq!(row.conversations, 1);
    assert_eq!(row.revenue, Decimal::from(30));
}

#[test]
fn at_fr_db_09_delta_against_missing_row_creates_a_zero_baseline() {
    let mut s = store_with_entity();
    assert!(s.rollup_row(&tenant_a(), &entity(), day(200)).is_none());
    let clamped = s.rollup_apply_delta(
        &tenant_a(),
        &entity(),
        day(200),
        RollupDelta {
            conversations: 1,
            ..RollupDelta::none()
        },
    );
    assert!(!clamped);
    let row = s.rollup_row(&tenant_a(), &entity(), day(200)).unwrap();
    assert_eq!(row.conversations, 1);
    assert_eq!(row.orders_count, 0);
    assert_eq!(row.impressions, 0);
    assert_eq!(row.revenue, Decimal::ZERO);
}

#[test]
fn at_fr_db_10_failing_mandatory_effect_aborts_the_whole_commit() {
    let mut s = store_with_entity();
    let effects = WriteEffects {
        rollup_deltas: Vec::new(),
        flag_updates: vec![FlagUpdate {
            tenant_id: tenant_a(),
            entity_id: EntityId::new("store_unknown").unwrap(),
            has_active_mapping: true,
        }],
        audit_events: Vec::new(),
    };
    let err = s
        .fact_append_commit_row(
            order_input(&tenant_a(), Decimal::ONE, false, at_day(100, 0), None),
            effects,
            MonotonicTimeNs(10),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::ForeignKeyViolation { table: "entities", .. }
    ));
    // Nothing applied: no fact, no rollup row.
    assert!(s.fact_rows().is_empty());
    assert!(s.rollup_row(&tenant_a(), &entity(), day(100)).is_none());
}

#[test]
fn at_fr_db_11_staged_audit_events_land_on_the_ledger() {
    let mut s = store_with_entity();
    let effects = WriteEffects {
        rollup_deltas: Vec::new(),
        flag_updates: Vec::new(),
        audit_events: vec![AuditEventInput::v1(
            MonotonicTimeNs(10),
            Some(tenant_a()),
            Some(entity()),
            AuditEventType::FactAppended,
            ReasonCodeId(0x524C_0001),
            AuditSeverity::Info,
            None,
            AuditPayloadMin::empty_v1(),
            None,
        )
        .unwrap()],
    };
    s.fact_append_commit_row(
        order_input(&tenant_a(), Decimal::ONE, false, at_day(100, 0), None),
        effects,
        MonotonicTimeNs(10),
    )
    .unwrap();
    let events = s.audit_events_by_type(AuditEventType::FactAppended);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tenant_id, Some(tenant_a()));
}

#[test]
fn at_fr_db_12_audit_append_dedupes_on_idempotency_key() {
    let mut s = store_with_entity();
    let input = AuditEventInput::v1(
        MonotonicTimeNs(10),
        Some(tenant_a()),
        None,
        AuditEventType::RollupRebuilt,
        ReasonCodeId(0x524C_0009),
        AuditSeverity::Info,
        None,
        AuditPayloadMin::empty_v1(),
        Some("rebuild_run_1".to_string()),
    )
    .unwrap();
    let first = s.append_audit_event(input.clone()).unwrap();
    let second = s.append_audit_event(input).unwrap();
    assert_eq!(first, second);
    assert_eq!(s.audit_events().len(), 1);
}

#[test]
fn at_fr_db_13_fact_reads_through_the_repo_trait() {
    fn tenant_facts<R: FactLedgerRepo>(repo: &R, t: &TenantId) -> usize {
        repo.fact_rows_for_tenant(t).len()
    }

    let mut s = store_with_entity();
    s.fact_append_commit_row(
        order_input(&tenant_a(), Decimal::ONE, false, at_day(100, 0), None),
        WriteEffects::empty(),
        MonotonicTimeNs(10),
    )
    .unwrap();
    assert_eq!(tenant_facts(&s, &tenant_a()), 1);
    assert_eq!(tenant_facts(&s, &tenant_b()), 0);
}

#[test]
fn at_fr_db_14_audit_ledger_reads_and_appends_through_the_repo_trait() {
    fn record_run<R: AuditRepo>(repo: &mut R, t: &TenantId) {
        repo.append_audit_row(
            AuditEventInput::v1(
                MonotonicTimeNs(10),
                Some(t.clone()),
                None,
                AuditEventType::RollupRebuilt,
                ReasonCodeId(0x524C_0020),
                AuditSeverity::Info,
                None,
                AuditPayloadMin::empty_v1(),
                None,
            )
            .unwrap(),
        )
        .unwrap();
    }

    fn tenant_audits<R: AuditRepo>(repo: &R, t: &TenantId) -> usize {
        repo.audit_rows_by_tenant(t).len()
    }

    let mut s = store_with_entity();
    record_run(&mut s, &tenant_a());
    assert_eq!(tenant_audits(&s, &tenant_a()), 1);
    assert_eq!(tenant_audits(&s, &tenant_b()), 0);

    fn all_audits<R: AuditRepo>(repo: &R) -> usize {
        repo.audit_rows().len()
    }
    assert_eq!(all_audits(&s), 1);
}

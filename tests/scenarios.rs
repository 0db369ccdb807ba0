mod common;

use anyhow::Context;
use common::{Harness, UNIT, bucket, fill_belt, fill_unit_belt, harness, site};
use compost_lot_engine::{
    EngineConfig, LotError, LotRepository,
    chain::{ChainScope, IntegrityStatus},
    lot::{Lot, LotStatus},
    orchestrator::Plan,
    transitions::StepInput,
    types::{Actor, Weight},
};

fn lot_in_box(h: &Harness, box_position: u8) -> anyhow::Result<Lot> {
    lot_in_unit_box(h, UNIT, box_position)
}

fn lot_in_unit_box(h: &Harness, unit: &str, box_position: u8) -> anyhow::Result<Lot> {
    h.service
        .repository()
        .find_active_lots_by_unit(unit)?
        .into_iter()
        .find(|l| l.box_position == box_position)
        .with_context(|| format!("no lot in box {box_position}"))
}

#[test]
fn finalizing_box_seven_applies_one_week_of_decay() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;

    let lot = lot_in_box(&h, 7)?;
    assert_eq!(lot.status, LotStatus::Processing);
    assert_eq!(lot.current_weight.grams(), 100_000);

    let t = h
        .service
        .finalize(&lot.id, StepInput::new(), &h.admin)
        .context("finalization failed: ")?;

    assert_eq!(t.lot.status, LotStatus::Closed);
    assert_eq!(t.lot.final_weight, Some(Weight::from_grams(96_340)));
    assert!(t.lot.integrity_hash.is_some());

    let stored = h.service.repository().get_lot(&lot.id)?;
    assert_eq!(stored, t.lot);
    // a closed lot gives its slot back
    assert!(lot_in_box(&h, 7).is_err());
    Ok(())
}

#[test]
fn eighth_lot_is_refused() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [50_000; 7])?;

    let err = h.service.create_lot(UNIT, &h.admin, None).unwrap_err();
    assert!(matches!(err, LotError::BeltFull { .. }));
    assert_eq!(h.service.repository().find_active_lots_by_unit(UNIT)?.len(), 7);
    Ok(())
}

#[test]
fn second_lot_cannot_share_box_one() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    h.service.create_lot(UNIT, &h.admin, None)?;

    let err = h.service.create_lot(UNIT, &h.admin, None).unwrap_err();
    assert!(matches!(err, LotError::SlotOccupied { box_position: 1, .. }));
    Ok(())
}

#[test]
fn refused_lot_leaves_a_gap_in_the_codes() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    let first = h.service.create_lot(UNIT, &h.admin, None)?;
    assert!(h.service.create_lot(UNIT, &h.admin, None).is_err());

    h.service.advance(&first.id, StepInput::new(), &h.admin)?;
    let next = h.service.create_lot(UNIT, &h.admin, None)?;

    assert_eq!(first.code, "CWB001-L0001");
    assert_eq!(next.code, "CWB001-L0003");
    Ok(())
}

#[test]
fn zero_intake_blocks_finalization_without_mutation() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    let mut intake = [80_000; 7];
    intake[0] = 0;
    fill_belt(&h, intake)?;

    let before = lot_in_box(&h, 7)?;
    let err = h
        .service
        .finalize(&before.id, StepInput::new(), &h.admin)
        .unwrap_err();

    match err {
        LotError::IntegrityViolation { findings, .. } => {
            assert!(findings[0].contains("initial weight"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    let after = h.service.repository().get_lot(&before.id)?;
    assert_eq!(after, before);
    assert_eq!(h.service.repository().list_maintenance_events(&before.id)?.len(), 6);
    assert!(h.service.verify_chain(UNIT)?.length == 0);
    Ok(())
}

#[test]
fn weekly_commit_moves_the_whole_belt() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    let oldest = lot_in_box(&h, 7)?;

    let mut plan = h.service.begin_session(UNIT, &h.admin)?;
    h.service.capture_step(
        &mut plan,
        1,
        vec!["https://photos/box6.jpg".into()],
        Some(Weight::from_grams(98_000)),
        Some("moist".into()),
    )?;
    let outcome = h.service.commit(&plan, &h.admin)?;

    assert_eq!(outcome.events.len(), 7);
    assert_eq!(outcome.lots[0].status, LotStatus::Closed);
    assert_eq!(outcome.lots[1].current_weight.grams(), 98_000);
    assert_eq!(outcome.link.lot_id, oldest.id);

    let boxes: Vec<u8> = h
        .service
        .repository()
        .find_active_lots_by_unit(UNIT)?
        .iter()
        .map(|l| l.box_position)
        .collect();
    assert_eq!(boxes, vec![2, 3, 4, 5, 6, 7]);

    // box 1 is free again
    h.service.create_lot(UNIT, &h.admin, None)?;
    Ok(())
}

#[test]
fn stale_plan_commits_nothing() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    let oldest = lot_in_box(&h, 7)?;

    let plan = h.service.begin_session(UNIT, &h.admin)?;
    h.service.cancel(&plan.steps[3].lot_id, &h.admin)?;

    let err = h.service.commit(&plan, &h.admin).unwrap_err();
    match err {
        LotError::StepFailed {
            step,
            box_position,
            source,
        } => {
            assert_eq!((step, box_position), (3, 4));
            assert!(matches!(*source, LotError::StaleWrite { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }

    assert_eq!(h.service.repository().get_lot(&oldest.id)?, oldest);
    assert!(h.service.repository().get_session(&plan.id)?.is_none());
    assert_eq!(h.service.verify_chain(UNIT)?.length, 0);
    Ok(())
}

#[test]
fn truncated_plan_commits_nothing() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    let oldest = lot_in_box(&h, 7)?;

    let mut plan = h.service.begin_session(UNIT, &h.admin)?;
    plan.steps.truncate(1);

    let err = h.service.commit(&plan, &h.admin).unwrap_err();
    assert!(matches!(err, LotError::InsufficientLots { occupied: 1, .. }));

    let boxes: Vec<u8> = h
        .service
        .repository()
        .find_active_lots_by_unit(UNIT)?
        .iter()
        .map(|l| l.box_position)
        .collect();
    assert_eq!(boxes, vec![1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(h.service.repository().get_lot(&oldest.id)?, oldest);
    assert!(h.service.repository().get_session(&plan.id)?.is_none());
    assert_eq!(h.service.verify_chain(UNIT)?.length, 0);
    Ok(())
}

#[test]
fn plan_from_another_unit_commits_nothing() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    fill_unit_belt(&h, "POA002", [60_000; 7])?;

    let mut plan = h.service.begin_session(UNIT, &h.admin)?;
    let foreign = h.service.begin_session("POA002", &h.admin)?;
    plan.steps[2] = foreign.steps[2].clone();
    let borrowed = lot_in_unit_box(&h, "POA002", 5)?;

    let err = h.service.commit(&plan, &h.admin).unwrap_err();
    assert!(matches!(
        err,
        LotError::StepFailed {
            step: 2,
            box_position: 5,
            ..
        }
    ));
    assert_eq!(h.service.verify_chain(UNIT)?.length, 0);
    assert_eq!(h.service.repository().get_lot(&borrowed.id)?, borrowed);
    Ok(())
}

#[test]
fn global_scope_links_units_into_one_chain() -> anyhow::Result<()> {
    let config = EngineConfig {
        chain_scope: ChainScope::Global,
        ..EngineConfig::default()
    };
    let h = harness(config)?;
    fill_unit_belt(&h, "CWB001", [100_000; 7])?;
    fill_unit_belt(&h, "POA002", [60_000; 7])?;

    let first = lot_in_unit_box(&h, "CWB001", 7)?;
    let first = h.service.finalize(&first.id, StepInput::new(), &h.admin)?;
    let second = lot_in_unit_box(&h, "POA002", 7)?;
    let second = h.service.finalize(&second.id, StepInput::new(), &h.admin)?;

    assert_eq!(first.lot.chain_index, Some(0));
    assert_eq!(second.lot.chain_index, Some(1));
    assert_eq!(second.lot.previous_hash, first.lot.integrity_hash);

    for unit in ["CWB001", "POA002"] {
        let report = h.service.verify_chain(unit)?;
        assert!(report.is_intact());
        assert_eq!(report.length, 2);
    }
    let last = h
        .service
        .get_last_finalized_lot("CWB001")?
        .context("chain is empty")?;
    assert_eq!(last.id, second.lot.id);
    Ok(())
}

#[test]
fn per_unit_scope_keeps_chains_apart() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_unit_belt(&h, "CWB001", [100_000; 7])?;
    fill_unit_belt(&h, "POA002", [60_000; 7])?;

    let first = lot_in_unit_box(&h, "CWB001", 7)?;
    let first = h.service.finalize(&first.id, StepInput::new(), &h.admin)?;
    let second = lot_in_unit_box(&h, "POA002", 7)?;
    let second = h.service.finalize(&second.id, StepInput::new(), &h.admin)?;

    for t in [&first, &second] {
        assert_eq!(t.lot.chain_index, Some(0));
        assert_eq!(t.lot.previous_hash, None);
    }
    for (unit, lot) in [("CWB001", &first.lot), ("POA002", &second.lot)] {
        assert_eq!(h.service.verify_chain(unit)?.length, 1);
        let last = h.service.get_last_finalized_lot(unit)?.context("chain is empty")?;
        assert_eq!(last.id, lot.id);
    }
    Ok(())
}

#[test]
fn session_requires_a_full_belt() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    h.service.create_lot(UNIT, &h.admin, None)?;

    let err = h.service.begin_session(UNIT, &h.admin).unwrap_err();
    assert!(matches!(err, LotError::InsufficientLots { occupied: 1, .. }));
    Ok(())
}

#[test]
fn successive_finalizations_are_chained() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;

    let first = h.service.run_simplified_session(UNIT, &h.admin, vec![], None)?;
    h.clock.advance_days(7);
    let lot = h.service.create_lot(UNIT, &h.admin, Some(site()))?;
    h.service
        .record_delivery(&lot.id, bucket("vol_2", "Pedro Alves", 4, 30_000), &h.admin)?;
    let second = h.service.run_simplified_session(UNIT, &h.admin, vec![], None)?;

    assert_eq!(second.link.chain_index, 1);
    assert_eq!(second.link.previous_hash, Some(first.link.hash.clone()));

    let report = h.service.verify_chain(UNIT)?;
    assert!(report.is_intact());
    assert_eq!(report.length, 2);

    let last = h.service.get_last_finalized_lot(UNIT)?.context("chain is empty")?;
    assert_eq!(last.id, second.link.lot_id);
    Ok(())
}

#[test]
fn restored_plan_can_be_committed() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;

    let mut plan = h.service.begin_session(UNIT, &h.admin)?;
    h.service
        .capture_step(&mut plan, 0, vec![], Some(Weight::from_grams(95_000)), None)?;
    plan.next_step();
    let saved = plan.to_bytes()?;

    let restored = Plan::from_bytes(&saved)?;
    assert_eq!(restored.current_step().map(|s| s.box_position), Some(6));
    let outcome = h.service.commit(&restored, &h.admin)?;

    assert_eq!(outcome.lots[0].final_weight, Some(Weight::from_grams(95_000)));
    Ok(())
}

#[test]
fn finalized_lot_validates_until_tampered() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    let lot = lot_in_box(&h, 7)?;
    let closed = h.service.finalize(&lot.id, StepInput::new(), &h.admin)?.lot;

    let report = h.service.validate_integrity(&lot.id)?;
    assert_eq!(report.status, IntegrityStatus::Valid, "{:?}", report.findings);
    assert!(h.service.reconstruct_timeline(&lot.id)?.is_complete());

    let distributed = h.service.distribute(&lot.id, &h.admin)?;
    assert_eq!(distributed.status, LotStatus::Distributed);
    assert_eq!(h.service.validate_integrity(&lot.id)?.status, IntegrityStatus::Valid);

    let mut tampered = distributed.clone();
    tampered.final_weight = closed.final_weight.map(|w| Weight::from_grams(w.grams() + 5_000));
    tampered.version += 1;
    h.service
        .repository()
        .update_lot(&tampered, distributed.version)?;

    assert_eq!(h.service.validate_integrity(&lot.id)?.status, IntegrityStatus::Critical);
    Ok(())
}

#[test]
fn lot_in_progress_is_pending() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    let lot = h.service.create_lot(UNIT, &h.admin, Some(site()))?;
    h.service
        .record_delivery(&lot.id, bucket("vol_1", "Joana Lima", 1, 40_000), &h.admin)?;

    let timeline = h.service.reconstruct_timeline(&lot.id)?;
    assert_eq!(timeline.stages.len(), 8);
    assert_eq!(timeline.estimated_count(), 7);
    assert_eq!(timeline.stages[1].weight.grams(), 38_536);

    let report = h.service.validate_integrity(&lot.id)?;
    assert_eq!(report.status, IntegrityStatus::Pending);
    Ok(())
}

#[test]
fn shared_session_photos_reach_the_timeline() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    let oldest = lot_in_box(&h, 7)?;
    h.service
        .attach_lot_photo(&oldest.id, 7, "https://photos/belt.jpg", &h.admin)?;

    h.service.run_simplified_session(
        UNIT,
        &h.admin,
        vec!["https://photos/belt.jpg".into()],
        Some("weekly turn".into()),
    )?;

    let timeline = h.service.reconstruct_timeline(&oldest.id)?;
    let last = &timeline.stages[7];
    assert!(!last.is_estimated);
    assert_eq!(last.photo_refs, vec!["https://photos/belt.jpg".to_string()]);
    assert_eq!(timeline.duplicates_removed, 1);
    Ok(())
}

#[test]
fn public_view_hides_volunteer_names() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    fill_belt(&h, [100_000; 7])?;
    let lot = lot_in_box(&h, 7)?;
    let closed = h.service.finalize(&lot.id, StepInput::new(), &h.admin)?.lot;

    let view = h.service.get_public_audit_view(&closed.unique_code)?;
    assert_eq!(view.contributors.len(), 1);
    assert_eq!(view.contributors[0].initials, "J.L.");
    assert_eq!(view.timeline.stages.len(), 8);

    let json = view.to_json()?;
    let hash = closed.integrity_hash.context("hash missing")?;
    assert!(json.contains(&hash));
    assert!(!json.contains("Joana"));
    Ok(())
}

#[test]
fn removing_a_delivery_gives_its_weight_back() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    let lot = h.service.create_lot(UNIT, &h.admin, None)?;
    let kept = h
        .service
        .record_delivery(&lot.id, bucket("vol_1", "Joana Lima", 1, 4_000), &h.admin)?;
    let mistaken = h
        .service
        .record_delivery(&lot.id, bucket("vol_2", "Pedro Alves", 2, 6_500), &h.admin)?;

    let lot = h.service.remove_delivery(&lot.id, &mistaken.id, &h.admin)?;
    assert_eq!(lot.current_weight.grams(), 4_000);
    assert_eq!(lot.initial_weight.grams(), 4_000);

    let live = h.service.repository().list_deliveries(&lot.code)?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, kept.id);
    Ok(())
}

#[test]
fn anonymous_actor_is_rejected() -> anyhow::Result<()> {
    let h = harness(EngineConfig::default())?;
    let anonymous = Actor::administrator(" ", "nobody");

    let err = h.service.create_lot(UNIT, &anonymous, None).unwrap_err();
    assert!(matches!(err, LotError::Unauthenticated));
    Ok(())
}

#[test]
fn required_geolocation_blocks_finalization() -> anyhow::Result<()> {
    let config = EngineConfig {
        require_geolocation: true,
        ..EngineConfig::default()
    };
    let h = harness(config)?;
    let lot = h.service.create_lot(UNIT, &h.admin, None)?;
    h.service
        .record_delivery(&lot.id, bucket("vol_1", "Joana Lima", 1, 10_000), &h.admin)?;
    for _ in 1..7 {
        h.service.advance(&lot.id, StepInput::new(), &h.admin)?;
    }

    let err = h
        .service
        .finalize(&lot.id, StepInput::new(), &h.admin)
        .unwrap_err();
    assert!(matches!(err, LotError::IntegrityViolation { .. }));
    Ok(())
}

//! Lot state machine
//!
//! All lot mutation logic lives here. Every function takes the current records
//! and returns the records to persist; nothing here touches storage or reads
//! the clock, so the service can batch several transitions into one atomic
//! change set.
//!
//! ```text
//! Active(box 1..6) --advance--> Active(box n+1) | Processing(box 7)
//! Processing(box 7) --finalize--> Closed --distribute--> Distributed
//! Active | Processing --cancel--> Cancelled
//! ```
use super::chain::{self, IntegrityLink};
use super::decay::DecayModel;
use super::error::{LotError, ValidationError};
use super::lot::{
    Delivery, EventKind, FINAL_BOX, Lot, LotStatus, MaintenanceEvent, QualityRating, Volunteer,
};
use super::types::{Actor, GeoPoint, TimeStamp, Weight};
use super::utils;

pub const LOT_HRP: &str = "lot_";
pub const CERTIFICATE_HRP: &str = "cert_";
pub const DELIVERY_HRP: &str = "dlv_";
pub const EVENT_HRP: &str = "evt_";
pub const SESSION_HRP: &str = "ses_";
pub const PHOTO_HRP: &str = "pht_";

pub(crate) fn new_id(hrp: &str) -> Result<String, LotError> {
    utils::new_uuid_to_bech32(hrp).map_err(|e| LotError::Encoding(e.to_string()))
}

/// A lot update together with the event that records it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub lot: Lot,
    pub event: MaintenanceEvent,
}

/// Caller-supplied evidence for one advance or finalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInput {
    pub measured_weight: Option<Weight>,
    pub photo_refs: Vec<String>,
    pub notes: Option<String>,
    pub geolocation: Option<GeoPoint>,
    pub session_id: Option<String>,
}

impl StepInput {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_measured_weight(mut self, weight: Weight) -> Self {
        self.measured_weight = Some(weight);
        self
    }
    pub fn set_photos(mut self, photo_refs: Vec<String>) -> Self {
        self.photo_refs = photo_refs;
        self
    }
    pub fn set_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
    pub fn set_geolocation(mut self, point: GeoPoint) -> Self {
        self.geolocation = Some(point);
        self
    }
    pub fn set_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryInput {
    pub volunteer: Volunteer,
    pub bucket_number: u32,
    pub weight: Weight,
    pub quality_rating: u8,
    pub geolocation: Option<GeoPoint>,
    pub photo_refs: Vec<String>,
}

fn ensure_actor(actor: &Actor) -> Result<(), LotError> {
    if actor.is_authenticated() {
        Ok(())
    } else {
        Err(LotError::Unauthenticated)
    }
}

fn ensure_not_deleted(lot: &Lot) -> Result<(), LotError> {
    if lot.deleted_at.is_some() {
        return Err(LotError::transition(&lot.code, "lot has been cancelled"));
    }
    Ok(())
}

/// A fresh box-1 lot. `number` comes from the unit's lot counter.
pub fn create_lot(
    unit_code: &str,
    number: u64,
    actor: &Actor,
    geolocation: Option<GeoPoint>,
    now: TimeStamp,
) -> Result<Lot, LotError> {
    ensure_actor(actor)?;
    if unit_code.trim().is_empty() {
        return Err(ValidationError::EmptyUnit.into());
    }

    Ok(Lot {
        id: new_id(LOT_HRP)?,
        code: utils::lot_code(unit_code, number),
        unique_code: new_id(CERTIFICATE_HRP)?,
        status: LotStatus::Active,
        box_position: 1,
        week_index: 0,
        initial_weight: Weight::ZERO,
        current_weight: Weight::ZERO,
        final_weight: None,
        bulking_weight: Weight::ZERO,
        start_date: now,
        closure_date: None,
        finalization_date: None,
        distribution_date: None,
        deleted_at: None,
        created_by: actor.clone(),
        unit_code: unit_code.to_string(),
        geolocation,
        integrity_hash: None,
        previous_hash: None,
        chain_index: None,
        version: 0,
    })
}

fn ensure_intake(lot: &Lot) -> Result<(), LotError> {
    ensure_not_deleted(lot)?;
    if lot.status != LotStatus::Active {
        return Err(LotError::transition(
            &lot.code,
            format!("lot is {:?}, intake is closed", lot.status),
        ));
    }
    if lot.box_position != 1 {
        return Err(ValidationError::WrongBox {
            expected: 1,
            actual: lot.box_position,
        }
        .into());
    }
    Ok(())
}

/// Pour a volunteer's bucket into the box-1 lot.
pub fn record_delivery(
    lot: &Lot,
    input: DeliveryInput,
    geofence_radius_m: f64,
    now: TimeStamp,
) -> Result<(Lot, Delivery), LotError> {
    ensure_intake(lot)?;
    if input.weight.is_zero() {
        return Err(ValidationError::NonPositiveWeight.into());
    }
    let quality_rating = QualityRating::new(input.quality_rating)?;

    let geolocation_validated = match (input.geolocation, lot.geolocation) {
        (Some(point), Some(site)) => point.distance_m(&site) <= geofence_radius_m,
        _ => false,
    };

    let delivery = Delivery {
        id: new_id(DELIVERY_HRP)?,
        lot_code: lot.code.clone(),
        volunteer: input.volunteer,
        bucket_number: input.bucket_number,
        weight: input.weight,
        quality_rating,
        geolocation: input.geolocation,
        geolocation_validated,
        photo_refs: input.photo_refs,
        created_at: now,
        deleted_at: None,
    };

    let mut updated = lot.clone();
    updated.current_weight = updated.current_weight.saturating_add(input.weight);
    updated.initial_weight = updated.initial_weight.saturating_add(input.weight);
    updated.version += 1;

    Ok((updated, delivery))
}

/// Take a delivery back out while the lot is still at intake.
pub fn remove_delivery(
    lot: &Lot,
    delivery: &Delivery,
    now: TimeStamp,
) -> Result<(Lot, Delivery), LotError> {
    ensure_intake(lot)?;
    if delivery.lot_code != lot.code {
        return Err(LotError::transition(
            &lot.code,
            format!("delivery {} belongs to lot {}", delivery.id, delivery.lot_code),
        ));
    }
    if !delivery.is_live() {
        return Err(LotError::transition(
            &lot.code,
            format!("delivery {} was already removed", delivery.id),
        ));
    }

    let underflow = || ValidationError::WeightUnderflow {
        removed: delivery.weight.grams(),
        current: lot.current_weight.grams(),
    };
    let mut updated = lot.clone();
    updated.current_weight = lot
        .current_weight
        .checked_sub(delivery.weight)
        .ok_or_else(underflow)?;
    updated.initial_weight = lot
        .initial_weight
        .checked_sub(delivery.weight)
        .ok_or_else(underflow)?;
    updated.version += 1;

    let mut removed = delivery.clone();
    removed.deleted_at = Some(now);

    Ok((updated, removed))
}

/// Record the cepilho (bulking agent) mixed into the intake box.
pub fn record_bulking_agent(lot: &Lot, weight: Weight) -> Result<Lot, LotError> {
    ensure_intake(lot)?;
    let mut updated = lot.clone();
    updated.bulking_weight = weight;
    updated.version += 1;
    Ok(updated)
}

fn weight_after(
    lot: &Lot,
    measured: Option<Weight>,
    decay: &DecayModel,
) -> Result<Weight, LotError> {
    let before = lot.current_weight;
    match measured {
        Some(w) if w.is_zero() => Err(ValidationError::NonPositiveWeight.into()),
        Some(w) if w > before => Err(ValidationError::MeasuredAboveBefore {
            measured: w.grams(),
            before: before.grams(),
        }
        .into()),
        Some(w) => Ok(w),
        None => Ok(decay.next_week(before)),
    }
}

fn ensure_not_repeated(lot: &Lot, events: &[MaintenanceEvent]) -> Result<(), LotError> {
    if events.iter().any(|e| e.box_from() == lot.box_position) {
        return Err(LotError::transition(
            &lot.code,
            format!(
                "a maintenance event from box {} already exists",
                lot.box_position
            ),
        ));
    }
    Ok(())
}

fn build_event(
    lot: &Lot,
    kind: EventKind,
    weight_after: Weight,
    input: StepInput,
    actor: &Actor,
    now: TimeStamp,
) -> Result<MaintenanceEvent, LotError> {
    Ok(MaintenanceEvent {
        id: new_id(EVENT_HRP)?,
        lot_id: lot.id.clone(),
        kind,
        weight_before: lot.current_weight,
        weight_after,
        photo_refs: input.photo_refs,
        legacy_photo: None,
        notes: input.notes,
        geolocation: input.geolocation,
        actor: actor.clone(),
        session_id: input.session_id,
        created_at: now,
    })
}

/// Move a lot one box down the belt.
pub fn advance(
    lot: &Lot,
    events: &[MaintenanceEvent],
    input: StepInput,
    actor: &Actor,
    decay: &DecayModel,
    now: TimeStamp,
) -> Result<Transition, LotError> {
    ensure_actor(actor)?;
    ensure_not_deleted(lot)?;
    if lot.box_position >= FINAL_BOX {
        return Err(LotError::transition(
            &lot.code,
            "lot is in box 7 and must be finalized",
        ));
    }
    if lot.status != LotStatus::Active {
        return Err(LotError::transition(
            &lot.code,
            format!("cannot advance a {:?} lot", lot.status),
        ));
    }
    ensure_not_repeated(lot, events)?;

    let after = weight_after(lot, input.measured_weight, decay)?;
    let kind = EventKind::Transfer {
        box_from: lot.box_position,
        box_to: lot.box_position + 1,
    };
    let event = build_event(lot, kind, after, input, actor, now)?;

    let mut updated = lot.clone();
    updated.box_position += 1;
    updated.week_index += 1;
    updated.current_weight = after;
    if updated.box_position == FINAL_BOX {
        updated.status = LotStatus::Processing;
    }
    updated.version += 1;

    Ok(Transition {
        lot: updated,
        event,
    })
}

/// Close a box-7 lot. The result still has to be certified with [`certify`].
pub fn finalize(
    lot: &Lot,
    events: &[MaintenanceEvent],
    input: StepInput,
    actor: &Actor,
    decay: &DecayModel,
    require_geolocation: bool,
    now: TimeStamp,
) -> Result<Transition, LotError> {
    ensure_actor(actor)?;
    ensure_not_deleted(lot)?;
    if lot.box_position != FINAL_BOX {
        return Err(LotError::transition(
            &lot.code,
            format!("only box 7 can be finalized, lot is in box {}", lot.box_position),
        ));
    }
    // box 7 lots migrated from older records may still read Active
    if !lot.status.occupies_belt() {
        return Err(LotError::transition(
            &lot.code,
            format!("cannot finalize a {:?} lot", lot.status),
        ));
    }
    ensure_not_repeated(lot, events)?;
    chain::ensure_certifiable(lot, require_geolocation)?;

    let after = weight_after(lot, input.measured_weight, decay)?;
    let kind = EventKind::Finalization {
        box_from: lot.box_position,
    };
    let event = build_event(lot, kind, after, input, actor, now)?;

    let mut updated = lot.clone();
    updated.current_weight = after;
    updated.final_weight = Some(after);
    updated.status = LotStatus::Closed;
    updated.week_index = updated.week_index.saturating_add(1).min(8);
    updated.closure_date = Some(now);
    updated.finalization_date = Some(now);
    updated.version += 1;

    Ok(Transition {
        lot: updated,
        event,
    })
}

/// Hash a freshly finalized lot and link it after `head`.
pub fn certify(
    transition: &mut Transition,
    deliveries: &[Delivery],
    head: Option<&IntegrityLink>,
    scope: &str,
) -> Result<IntegrityLink, LotError> {
    let hash = chain::compute_hash(&transition.lot, deliveries, &transition.event)?;
    let link = chain::link(&transition.lot.id, hash, head, scope);

    transition.lot.integrity_hash = Some(link.hash.clone());
    transition.lot.previous_hash = link.previous_hash.clone();
    transition.lot.chain_index = Some(link.chain_index);

    Ok(link)
}

pub fn distribute(lot: &Lot, actor: &Actor, now: TimeStamp) -> Result<Lot, LotError> {
    ensure_actor(actor)?;
    if lot.status != LotStatus::Closed {
        return Err(LotError::transition(
            &lot.code,
            format!("only closed lots can be distributed, lot is {:?}", lot.status),
        ));
    }
    let mut updated = lot.clone();
    updated.status = LotStatus::Distributed;
    updated.distribution_date = Some(now);
    updated.version += 1;
    Ok(updated)
}

/// Cancel a lot still on the belt, soft-deleting its deliveries with it.
pub fn cancel(
    lot: &Lot,
    deliveries: &[Delivery],
    actor: &Actor,
    now: TimeStamp,
) -> Result<(Lot, Vec<Delivery>), LotError> {
    ensure_actor(actor)?;
    ensure_not_deleted(lot)?;
    if !lot.status.occupies_belt() {
        return Err(LotError::transition(
            &lot.code,
            format!("cannot cancel a {:?} lot", lot.status),
        ));
    }

    let mut updated = lot.clone();
    updated.status = LotStatus::Cancelled;
    updated.deleted_at = Some(now);
    updated.version += 1;

    let removed = deliveries
        .iter()
        .filter(|d| d.is_live())
        .map(|d| {
            let mut d = d.clone();
            d.deleted_at = Some(now);
            d
        })
        .collect();

    Ok((updated, removed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Actor {
        Actor::administrator("adm_1", "Ana Souza")
    }

    fn lot_at(box_position: u8, grams: u64) -> Lot {
        let start = TimeStamp::new_with(2025, 1, 6, 8, 0, 0);
        let mut lot = create_lot("CWB001", 1, &admin(), None, start).unwrap();
        lot.box_position = box_position;
        lot.week_index = box_position - 1;
        lot.initial_weight = Weight::from_grams(grams);
        lot.current_weight = Weight::from_grams(grams);
        if box_position == FINAL_BOX {
            lot.status = LotStatus::Processing;
        }
        lot
    }

    fn delivery_input(grams: u64) -> DeliveryInput {
        DeliveryInput {
            volunteer: Volunteer::new("vol_1", "Joana Lima"),
            bucket_number: 12,
            weight: Weight::from_grams(grams),
            quality_rating: 3,
            geolocation: None,
            photo_refs: vec![],
        }
    }

    fn step(lot: &Lot) -> Result<Transition, LotError> {
        advance(lot, &[], StepInput::new(), &admin(), &DecayModel::default(), TimeStamp::new())
    }

    fn close(lot: &Lot, require_geolocation: bool) -> Result<Transition, LotError> {
        let decay = DecayModel::default();
        let input = StepInput::new();
        finalize(lot, &[], input, &admin(), &decay, require_geolocation, TimeStamp::new())
    }

    fn deliver(lot: &Lot, grams: u64) -> (Lot, Delivery) {
        record_delivery(lot, delivery_input(grams), 100.0, TimeStamp::new()).unwrap()
    }

    #[test]
    fn new_lot_starts_in_box_one() {
        let lot = lot_at(1, 0);
        assert_eq!(lot.status, LotStatus::Active);
        assert_eq!(lot.week_index, 0);
        assert_eq!(lot.code, "CWB001-L0001");
        assert!(lot.id.starts_with("lot_1"));
        assert!(lot.unique_code.starts_with("cert_1"));
    }

    #[test]
    fn create_requires_actor() {
        let anonymous = Actor::administrator("", "");
        let err = create_lot("CWB001", 1, &anonymous, None, TimeStamp::new()).unwrap_err();
        assert!(matches!(err, LotError::Unauthenticated));
    }

    #[test]
    fn delivery_grows_both_weights() {
        let lot = lot_at(1, 0);
        let (lot, delivery) = deliver(&lot, 4_500);

        assert_eq!(lot.current_weight.grams(), 4_500);
        assert_eq!(lot.initial_weight.grams(), 4_500);
        assert_eq!(delivery.lot_code, lot.code);
        assert!(!delivery.geolocation_validated);
    }

    #[test]
    fn delivery_rejected_outside_box_one() {
        let lot = lot_at(2, 1_000);
        let err = record_delivery(&lot, delivery_input(500), 100.0, TimeStamp::new()).unwrap_err();
        assert!(matches!(
            err,
            LotError::Validation(ValidationError::WrongBox { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn zero_weight_delivery_rejected() {
        let lot = lot_at(1, 0);
        let err = record_delivery(&lot, delivery_input(0), 100.0, TimeStamp::new()).unwrap_err();
        assert!(matches!(err, LotError::Validation(ValidationError::NonPositiveWeight)));
    }

    #[test]
    fn geofence_validates_nearby_delivery() {
        let mut lot = lot_at(1, 0);
        lot.geolocation = Some(GeoPoint::new(-25.4284, -49.2733).unwrap());
        let mut input = delivery_input(1_000);
        input.geolocation = Some(GeoPoint::new(-25.4285, -49.2733).unwrap());

        let (_, delivery) = record_delivery(&lot, input, 100.0, TimeStamp::new()).unwrap();
        assert!(delivery.geolocation_validated);
    }

    #[test]
    fn advance_applies_decay_when_not_measured() {
        let lot = lot_at(3, 100_000);
        let t = step(&lot).unwrap();

        assert_eq!(t.lot.box_position, 4);
        assert_eq!(t.lot.week_index, 3);
        assert_eq!(t.lot.current_weight.grams(), 96_340);
        assert_eq!(t.event.box_to(), Some(4));
        assert_eq!(t.event.weight_before.grams(), 100_000);
    }

    #[test]
    fn measured_weight_wins() {
        let lot = lot_at(2, 100_000);
        let input = StepInput::new().set_measured_weight(Weight::from_grams(99_000));
        let t = advance(&lot, &[], input, &admin(), &DecayModel::default(), TimeStamp::new())
            .unwrap();

        assert_eq!(t.lot.current_weight.grams(), 99_000);
    }

    #[test]
    fn measured_weight_above_previous_is_rejected() {
        let lot = lot_at(2, 100_000);
        let input = StepInput::new().set_measured_weight(Weight::from_grams(100_001));
        let err = advance(&lot, &[], input, &admin(), &DecayModel::default(), TimeStamp::new())
            .unwrap_err();

        assert!(matches!(
            err,
            LotError::Validation(ValidationError::MeasuredAboveBefore { .. })
        ));
    }

    #[test]
    fn reaching_box_seven_marks_processing() {
        let lot = lot_at(6, 50_000);
        let t = step(&lot).unwrap();
        assert_eq!(t.lot.status, LotStatus::Processing);
    }

    #[test]
    fn advance_from_box_seven_is_invalid() {
        let lot = lot_at(7, 50_000);
        let err = step(&lot).unwrap_err();
        assert!(matches!(err, LotError::InvalidTransition { .. }));
    }

    #[test]
    fn repeated_advance_from_same_box_is_invalid() {
        let lot = lot_at(2, 100_000);
        let first = step(&lot).unwrap();

        let err = advance(
            &lot,
            &[first.event],
            StepInput::new(),
            &admin(),
            &DecayModel::default(),
            TimeStamp::new(),
        )
        .unwrap_err();
        assert!(matches!(err, LotError::InvalidTransition { .. }));
    }

    #[test]
    fn finalize_closes_and_fixes_weight() {
        let lot = lot_at(7, 100_000);
        let t = close(&lot, false).unwrap();

        assert_eq!(t.lot.status, LotStatus::Closed);
        assert_eq!(t.lot.final_weight, Some(Weight::from_grams(96_340)));
        assert!(t.lot.closure_date.is_some());
        assert!(t.event.is_finalization());
    }

    #[test]
    fn finalize_blocks_zero_intake() {
        let lot = lot_at(7, 0);
        let err = close(&lot, false).unwrap_err();
        assert!(matches!(err, LotError::IntegrityViolation { .. }));
    }

    #[test]
    fn finalize_reports_every_missing_field() {
        let lot = lot_at(7, 0);
        let err = close(&lot, true).unwrap_err();
        match err {
            LotError::IntegrityViolation { findings, .. } => assert_eq!(findings.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn certify_sets_chain_fields() {
        let lot = lot_at(7, 100_000);
        let mut t = close(&lot, false).unwrap();
        let link = certify(&mut t, &[], None, "unit:CWB001").unwrap();

        assert_eq!(t.lot.integrity_hash.as_deref(), Some(link.hash.as_str()));
        assert_eq!(t.lot.chain_index, Some(0));
        assert_eq!(t.lot.previous_hash, None);
    }

    #[test]
    fn cancel_soft_deletes_live_deliveries() {
        let lot = lot_at(1, 0);
        let (lot, delivery) = deliver(&lot, 2_000);
        let (cancelled, removed) = cancel(&lot, &[delivery], &admin(), TimeStamp::new()).unwrap();

        assert_eq!(cancelled.status, LotStatus::Cancelled);
        assert!(cancelled.deleted_at.is_some());
        assert_eq!(removed.len(), 1);
        assert!(!removed[0].is_live());
    }

    #[test]
    fn closed_lot_cannot_be_cancelled() {
        let mut lot = lot_at(7, 10_000);
        lot.status = LotStatus::Closed;
        let err = cancel(&lot, &[], &admin(), TimeStamp::new()).unwrap_err();
        assert!(matches!(err, LotError::InvalidTransition { .. }));
    }

    #[test]
    fn distribute_requires_closed() {
        let lot = lot_at(7, 10_000);
        assert!(distribute(&lot, &admin(), TimeStamp::new()).is_err());

        let mut closed = lot.clone();
        closed.status = LotStatus::Closed;
        let distributed = distribute(&closed, &admin(), TimeStamp::new()).unwrap();
        assert_eq!(distributed.status, LotStatus::Distributed);
    }
}

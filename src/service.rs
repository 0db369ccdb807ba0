//! Service layer API for lot lifecycle operations
//!
//! Each mutating call reads what it needs, runs the pure transition, and hands
//! the resulting records to the repository as a single change set.
use tracing::{debug, info, warn};

use super::chain::{self, ChainReport, IntegrityLink, IntegrityReport};
use super::config::EngineConfig;
use super::decay::DecayModel;
use super::error::{LotError, ValidationError};
use super::lot::{Delivery, Lot, LotPhoto, MaintenanceEvent, MaintenanceSession, BELT_SLOTS};
use super::orchestrator::{self, CommitSettings, Plan, StepRecords};
use super::public::PublicAuditView;
use super::repository::{ChangeSet, LotRepository};
use super::timeline::{self, FINALIZATION_STAGE, Timeline, TimelineSources};
use super::transitions::{self, DeliveryInput, PHOTO_HRP, StepInput, Transition};
use super::types::{Actor, Clock, GeoPoint, SystemClock, Weight};

pub struct LotService<R: LotRepository> {
    repository: R,
    config: EngineConfig,
    decay: DecayModel,
    clock: Box<dyn Clock>,
}

/// What a committed weekly session wrote.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: MaintenanceSession,
    pub lots: Vec<Lot>,
    pub events: Vec<MaintenanceEvent>,
    pub link: IntegrityLink,
}

fn authenticated(actor: &Actor) -> Result<(), LotError> {
    if actor.is_authenticated() {
        Ok(())
    } else {
        Err(LotError::Unauthenticated)
    }
}

impl<R: LotRepository> LotService<R> {
    pub fn new(repository: R, config: EngineConfig) -> Self {
        Self::with_clock(repository, config, SystemClock)
    }

    pub fn with_clock(repository: R, config: EngineConfig, clock: impl Clock + 'static) -> Self {
        let decay = config.decay_model();
        Self {
            repository,
            config,
            decay,
            clock: Box::new(clock),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn decay(&self) -> &DecayModel {
        &self.decay
    }

    fn scope_of(&self, unit_code: &str) -> String {
        self.config.chain_scope.key(unit_code)
    }

    /// Open a new lot in box 1 of `unit_code`.
    pub fn create_lot(
        &self,
        unit_code: &str,
        actor: &Actor,
        geolocation: Option<GeoPoint>,
    ) -> Result<Lot, LotError> {
        authenticated(actor)?;
        let active = self.repository.find_active_lots_by_unit(unit_code)?;
        if active.len() >= BELT_SLOTS as usize {
            warn!(unit = %unit_code, "lot creation refused, belt is full");
            return Err(LotError::BeltFull {
                unit: unit_code.to_string(),
            });
        }

        // a rejected insert below burns this number
        let number = self.repository.next_lot_number(unit_code)?;
        let lot = transitions::create_lot(unit_code, number, actor, geolocation, self.clock.now())?;
        // the repository re-checks the box-1 slot inside the write
        self.repository.insert_lot(&lot)?;

        info!(lot = %lot.code, unit = %unit_code, "lot created");
        Ok(lot)
    }

    pub fn record_delivery(
        &self,
        lot_id: &str,
        input: DeliveryInput,
        actor: &Actor,
    ) -> Result<Delivery, LotError> {
        authenticated(actor)?;
        let lot = self.repository.get_lot(lot_id)?;
        let (updated, delivery) = transitions::record_delivery(
            &lot,
            input,
            self.config.geofence_radius_m,
            self.clock.now(),
        )?;

        self.repository.apply(
            &ChangeSet::new()
                .update_lot(updated, lot.version)
                .insert_delivery(delivery.clone()),
        )?;

        debug!(
            lot = %lot.code,
            delivery = %delivery.id,
            grams = delivery.weight.grams(),
            "delivery recorded"
        );
        Ok(delivery)
    }

    /// Take a delivery back out of a lot that is still at intake.
    pub fn remove_delivery(
        &self,
        lot_id: &str,
        delivery_id: &str,
        actor: &Actor,
    ) -> Result<Lot, LotError> {
        authenticated(actor)?;
        let lot = self.repository.get_lot(lot_id)?;
        let delivery = self.repository.get_delivery(&lot.code, delivery_id)?;
        let (updated, removed) = transitions::remove_delivery(&lot, &delivery, self.clock.now())?;

        self.repository.apply(
            &ChangeSet::new()
                .update_lot(updated.clone(), lot.version)
                .update_delivery(removed),
        )?;

        info!(lot = %lot.code, delivery = %delivery_id, "delivery removed");
        Ok(updated)
    }

    pub fn record_bulking_agent(
        &self,
        lot_id: &str,
        weight: Weight,
        actor: &Actor,
    ) -> Result<Lot, LotError> {
        authenticated(actor)?;
        let lot = self.repository.get_lot(lot_id)?;
        let updated = transitions::record_bulking_agent(&lot, weight)?;
        self.repository.update_lot(&updated, lot.version)?;
        Ok(updated)
    }

    pub fn attach_lot_photo(
        &self,
        lot_id: &str,
        stage: u8,
        url: &str,
        actor: &Actor,
    ) -> Result<LotPhoto, LotError> {
        authenticated(actor)?;
        if stage > FINALIZATION_STAGE {
            return Err(ValidationError::StepOutOfRange(stage as usize).into());
        }
        let lot = self.repository.get_lot(lot_id)?;
        let photo = LotPhoto {
            id: transitions::new_id(PHOTO_HRP)?,
            lot_id: lot.id,
            stage,
            url: url.to_string(),
            created_at: self.clock.now(),
        };
        self.repository
            .apply(&ChangeSet::new().insert_lot_photo(photo.clone()))?;
        Ok(photo)
    }

    /// Move a single lot one box down the belt outside a weekly session.
    pub fn advance(
        &self,
        lot_id: &str,
        input: StepInput,
        actor: &Actor,
    ) -> Result<Transition, LotError> {
        let lot = self.repository.get_lot(lot_id)?;
        let events = self.repository.list_maintenance_events(&lot.id)?;
        let transition =
            transitions::advance(&lot, &events, input, actor, &self.decay, self.clock.now())?;

        self.repository.apply(
            &ChangeSet::new()
                .update_lot(transition.lot.clone(), lot.version)
                .insert_event(transition.event.clone()),
        )?;

        info!(lot = %lot.code, to_box = transition.lot.box_position, "lot advanced");
        Ok(transition)
    }

    /// Close, certify and link a box-7 lot in one write.
    pub fn finalize(
        &self,
        lot_id: &str,
        input: StepInput,
        actor: &Actor,
    ) -> Result<Transition, LotError> {
        let lot = self.repository.get_lot(lot_id)?;
        let events = self.repository.list_maintenance_events(&lot.id)?;
        let deliveries = self.repository.list_deliveries(&lot.code)?;
        let scope = self.scope_of(&lot.unit_code);
        let head = self.repository.get_chain_head(&scope)?;

        let mut transition = transitions::finalize(
            &lot,
            &events,
            input,
            actor,
            &self.decay,
            self.config.require_geolocation,
            self.clock.now(),
        )
        .inspect_err(|e| warn!(lot = %lot.code, error = %e, "finalization refused"))?;
        let link = transitions::certify(&mut transition, &deliveries, head.as_ref(), &scope)?;

        self.repository.apply(
            &ChangeSet::new()
                .update_lot(transition.lot.clone(), lot.version)
                .insert_event(transition.event.clone())
                .append_link(link.clone(), head.map(|h| h.lot_id)),
        )?;

        info!(lot = %lot.code, scope = %scope, index = link.chain_index, "lot finalized");
        Ok(transition)
    }

    pub fn distribute(&self, lot_id: &str, actor: &Actor) -> Result<Lot, LotError> {
        let lot = self.repository.get_lot(lot_id)?;
        let updated = transitions::distribute(&lot, actor, self.clock.now())?;
        self.repository.update_lot(&updated, lot.version)?;

        info!(lot = %lot.code, "lot distributed");
        Ok(updated)
    }

    /// Cancel a lot on the belt together with its deliveries.
    pub fn cancel(&self, lot_id: &str, actor: &Actor) -> Result<Lot, LotError> {
        let lot = self.repository.get_lot(lot_id)?;
        let deliveries = self.repository.list_deliveries(&lot.code)?;
        let (updated, removed) = transitions::cancel(&lot, &deliveries, actor, self.clock.now())?;

        let changes = removed
            .into_iter()
            .fold(ChangeSet::new().update_lot(updated.clone(), lot.version), |c, d| {
                c.update_delivery(d)
            });
        self.repository.apply(&changes)?;

        info!(lot = %lot.code, unit = %lot.unit_code, "lot cancelled");
        Ok(updated)
    }

    /// Start the weekly session wizard for a unit with a full belt.
    pub fn begin_session(&self, unit_code: &str, actor: &Actor) -> Result<Plan, LotError> {
        let lots = self.repository.find_active_lots_by_unit(unit_code)?;
        let plan = orchestrator::begin(unit_code, &lots, actor, &self.decay, self.clock.now())?;

        debug!(unit = %unit_code, plan = %plan.id, "maintenance session started");
        Ok(plan)
    }

    pub fn capture_step(
        &self,
        plan: &mut Plan,
        index: usize,
        photo_refs: Vec<String>,
        measured_weight: Option<Weight>,
        notes: Option<String>,
    ) -> Result<(), LotError> {
        plan.capture(index, photo_refs, measured_weight, notes)?;
        Ok(())
    }

    /// Apply every step of `plan` atomically: either the whole belt moves or
    /// nothing does.
    pub fn commit(&self, plan: &Plan, actor: &Actor) -> Result<SessionOutcome, LotError> {
        authenticated(actor)?;
        let mut records = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let lot = self.repository.get_lot(&step.lot_id)?;
            let events = self.repository.list_maintenance_events(&lot.id)?;
            let deliveries = match step.action {
                orchestrator::StepAction::Finalize => self.repository.list_deliveries(&lot.code)?,
                orchestrator::StepAction::Advance => vec![],
            };
            records.push(StepRecords {
                lot,
                events,
                deliveries,
            });
        }

        let scope = self.scope_of(&plan.unit_code);
        let settings = CommitSettings {
            decay: &self.decay,
            require_geolocation: self.config.require_geolocation,
            chain_head: self.repository.get_chain_head(&scope)?,
            chain_scope: scope,
        };
        let prepared =
            orchestrator::prepare_commit(plan, &records, actor, &settings, self.clock.now())
                .inspect_err(|e| warn!(plan = %plan.id, error = %e, "session commit refused"))?;

        self.repository
            .apply(&prepared.changes)
            .map_err(|e| plan.attribute_failure(e))?;

        info!(
            unit = %plan.unit_code,
            session = %prepared.session.id,
            finalized = %prepared.link.lot_id,
            "maintenance session committed"
        );

        let (lots, events): (Vec<Lot>, Vec<MaintenanceEvent>) = prepared
            .transitions
            .into_iter()
            .map(|t| (t.lot, t.event))
            .unzip();
        Ok(SessionOutcome {
            session: prepared.session,
            lots,
            events,
            link: prepared.link,
        })
    }

    /// Discard a plan. Nothing was written, so there is nothing to undo.
    pub fn cancel_session(&self, plan: Plan) {
        debug!(unit = %plan.unit_code, plan = %plan.id, "maintenance session discarded");
    }

    /// Whole-belt session with no per-box evidence: every lot takes its decay
    /// estimate and shares the same photos and notes.
    pub fn run_simplified_session(
        &self,
        unit_code: &str,
        actor: &Actor,
        shared_photos: Vec<String>,
        notes: Option<String>,
    ) -> Result<SessionOutcome, LotError> {
        let mut plan = self.begin_session(unit_code, actor)?;
        for index in 0..plan.steps.len() {
            self.capture_step(&mut plan, index, vec![], None, None)?;
        }
        plan.set_shared(shared_photos, notes);
        self.commit(&plan, actor)
    }

    fn load_timeline(
        &self,
        lot: &Lot,
    ) -> Result<(Timeline, Vec<Delivery>, Vec<MaintenanceEvent>), LotError> {
        let deliveries = self.repository.list_deliveries(&lot.code)?;
        let events = self.repository.list_maintenance_events(&lot.id)?;
        let lot_photos = self.repository.list_lot_photos(&lot.id)?;

        let mut session_ids: Vec<&str> = events
            .iter()
            .filter_map(|e| e.session_id.as_deref())
            .collect();
        session_ids.sort_unstable();
        session_ids.dedup();
        let mut sessions = vec![];
        for id in session_ids {
            if let Some(session) = self.repository.get_session(id)? {
                sessions.push(session);
            }
        }

        let sources = TimelineSources {
            lot,
            deliveries: &deliveries,
            events: &events,
            sessions: &sessions,
            lot_photos: &lot_photos,
        };
        let timeline = timeline::reconstruct(&sources, &self.decay, self.config.stage_days);
        Ok((timeline, deliveries, events))
    }

    pub fn reconstruct_timeline(&self, lot_id: &str) -> Result<Timeline, LotError> {
        let lot = self.repository.get_lot(lot_id)?;
        let (timeline, _, _) = self.load_timeline(&lot)?;
        Ok(timeline)
    }

    pub fn validate_integrity(&self, lot_id: &str) -> Result<IntegrityReport, LotError> {
        let lot = self.repository.get_lot(lot_id)?;
        let (timeline, deliveries, events) = self.load_timeline(&lot)?;

        let recomputed = match events.iter().find(|e| e.is_finalization()) {
            Some(event) if lot.integrity_hash.is_some() => {
                Some(chain::compute_hash(&lot, &deliveries, event)?)
            }
            _ => None,
        };
        let report = chain::validate(&lot, &timeline, recomputed.as_deref());

        if report.status == chain::IntegrityStatus::Critical {
            warn!(lot = %lot.code, findings = ?report.messages(), "integrity check failed");
        }
        Ok(report)
    }

    /// Check the chain `unit_code` belongs to under the configured scope.
    pub fn verify_chain(&self, unit_code: &str) -> Result<ChainReport, LotError> {
        let links = self.repository.list_chain(&self.scope_of(unit_code))?;
        Ok(chain::verify_chain(&links))
    }

    pub fn get_last_finalized_lot(&self, unit_code: &str) -> Result<Option<Lot>, LotError> {
        self.repository
            .get_last_finalized_lot(&self.scope_of(unit_code))
    }

    /// Certificate view looked up by the lot's public code.
    pub fn get_public_audit_view(&self, unique_code: &str) -> Result<PublicAuditView, LotError> {
        let lot = self.repository.get_lot_by_unique_code(unique_code)?;
        if lot.deleted_at.is_some() {
            return Err(LotError::not_found("certificate", unique_code));
        }
        let (timeline, deliveries, _) = self.load_timeline(&lot)?;
        Ok(PublicAuditView::new(&lot, &deliveries, timeline))
    }
}

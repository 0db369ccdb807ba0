//! Weekly maintenance session ("manejo semanal")
//!
//! A [`Plan`] is the wizard state for one unit's weekly session: one step per
//! box, box 7 first, each holding the lot it was built from and the evidence
//! captured so far. Nothing is written until the plan is committed; the
//! commit turns every step into a lot transition and collects all of them,
//! plus the shared session and the box-7 chain link, into one [`ChangeSet`].
use super::chain::IntegrityLink;
use super::decay::DecayModel;
use super::error::{LotError, ValidationError};
use super::lot::{BELT_SLOTS, Delivery, FINAL_BOX, Lot, MaintenanceEvent, MaintenanceSession};
use super::repository::ChangeSet;
use super::transitions::{self, SESSION_HRP, StepInput, Transition};
use super::types::{Actor, TimeStamp, Weight};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    #[n(0)]
    Advance,
    #[n(1)]
    Finalize,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq)]
pub struct StepCapture {
    #[n(0)]
    pub photo_refs: Vec<String>,
    #[n(1)]
    pub measured_weight: Option<Weight>,
    #[n(2)]
    pub notes: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct PlanStep {
    #[n(0)]
    pub box_position: u8,
    #[n(1)]
    pub lot_id: String,
    #[n(2)]
    pub lot_code: String,
    #[n(3)]
    pub lot_version: u64, // version the plan was built against
    #[n(4)]
    pub action: StepAction,
    #[n(5)]
    pub current_weight: Weight,
    #[n(6)]
    pub estimated_weight: Weight,
    #[n(7)]
    pub capture: StepCapture,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Plan {
    #[n(0)]
    pub id: String, // becomes the session id on commit
    #[n(1)]
    pub unit_code: String,
    #[n(2)]
    pub actor_id: String,
    #[n(3)]
    pub created_at: TimeStamp,
    #[n(4)]
    pub steps: Vec<PlanStep>,
    #[n(5)]
    pub cursor: u32,
    #[n(6)]
    pub shared_photos: Vec<String>,
    #[n(7)]
    pub shared_notes: Option<String>,
}

/// Build the session plan for a unit whose seven boxes are all occupied.
/// `lots` is the unit's active lots in any order.
pub fn begin(
    unit_code: &str,
    lots: &[Lot],
    actor: &Actor,
    decay: &DecayModel,
    now: TimeStamp,
) -> Result<Plan, LotError> {
    if !actor.is_authenticated() {
        return Err(LotError::Unauthenticated);
    }

    let mut on_belt: Vec<&Lot> = lots.iter().filter(|l| l.is_on_belt()).collect();
    on_belt.sort_by(|a, b| b.box_position.cmp(&a.box_position));

    let full = on_belt.len() == BELT_SLOTS as usize
        && on_belt
            .iter()
            .zip((1..=BELT_SLOTS).rev())
            .all(|(lot, expected)| lot.box_position == expected);
    if !full {
        return Err(LotError::InsufficientLots {
            unit: unit_code.to_string(),
            occupied: on_belt.len(),
        });
    }

    let steps = on_belt
        .into_iter()
        .map(|lot| PlanStep {
            box_position: lot.box_position,
            lot_id: lot.id.clone(),
            lot_code: lot.code.clone(),
            lot_version: lot.version,
            action: if lot.box_position == FINAL_BOX {
                StepAction::Finalize
            } else {
                StepAction::Advance
            },
            current_weight: lot.current_weight,
            estimated_weight: decay.next_week(lot.current_weight),
            capture: StepCapture::default(),
        })
        .collect();

    Ok(Plan {
        id: transitions::new_id(SESSION_HRP)?,
        unit_code: unit_code.to_string(),
        actor_id: actor.id.clone(),
        created_at: now,
        steps,
        cursor: 0,
        shared_photos: vec![],
        shared_notes: None,
    })
}

impl Plan {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LotError> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LotError> {
        Ok(minicbor::decode(bytes)?)
    }

    /// Record evidence for step `index`, replacing anything captured before.
    pub fn capture(
        &mut self,
        index: usize,
        photo_refs: Vec<String>,
        measured_weight: Option<Weight>,
        notes: Option<String>,
    ) -> Result<&PlanStep, LotError> {
        if measured_weight.is_some_and(|w| w.is_zero()) {
            return Err(ValidationError::NonPositiveWeight.into());
        }
        let step = self
            .steps
            .get_mut(index)
            .ok_or(ValidationError::StepOutOfRange(index))?;
        step.capture = StepCapture {
            photo_refs,
            measured_weight,
            notes,
        };
        Ok(step)
    }

    pub fn set_shared(&mut self, photo_refs: Vec<String>, notes: Option<String>) {
        self.shared_photos = photo_refs;
        self.shared_notes = notes;
    }

    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps.get(self.cursor as usize)
    }

    /// Move the cursor forward; stays on the last step.
    pub fn next_step(&mut self) -> Option<&PlanStep> {
        if (self.cursor as usize) + 1 < self.steps.len() {
            self.cursor += 1;
        }
        self.current_step()
    }

    /// Move the cursor back; stays on the first step.
    pub fn previous_step(&mut self) -> Option<&PlanStep> {
        self.cursor = self.cursor.saturating_sub(1);
        self.current_step()
    }

    pub fn step_of_lot_code(&self, lot_code: &str) -> Option<(usize, &PlanStep)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.lot_code == lot_code)
    }

    fn step_failed(&self, index: usize, source: LotError) -> LotError {
        LotError::StepFailed {
            step: index,
            box_position: self.steps.get(index).map(|s| s.box_position).unwrap_or(0),
            source: Box::new(source),
        }
    }

    /// Tie a repository failure raised while applying the commit to the step
    /// whose lot caused it. Errors with no lot of this plan pass through.
    pub fn attribute_failure(&self, err: LotError) -> LotError {
        let index = match &err {
            LotError::StaleWrite { lot, .. } | LotError::SlotOccupied { lot, .. } => {
                self.step_of_lot_code(lot).map(|(index, _)| index)
            }
            LotError::ChainConflict { lot, .. } => self.steps.iter().position(|s| s.lot_id == *lot),
            _ => None,
        };
        match index {
            Some(index) => self.step_failed(index, err),
            None => err,
        }
    }
}

/// Stored state of one plan step's lot, re-read at commit time.
#[derive(Debug, Clone)]
pub struct StepRecords {
    pub lot: Lot,
    pub events: Vec<MaintenanceEvent>,
    pub deliveries: Vec<Delivery>,
}

#[derive(Debug, Clone)]
pub struct CommitSettings<'a> {
    pub decay: &'a DecayModel,
    pub require_geolocation: bool,
    pub chain_scope: String,
    pub chain_head: Option<IntegrityLink>,
}

#[derive(Debug, Clone)]
pub struct PreparedCommit {
    pub changes: ChangeSet,
    pub session: MaintenanceSession,
    pub transitions: Vec<Transition>,
    pub link: IntegrityLink,
}

/// A plan covers the whole belt, box 7 down to box 1, and only box 7 finalizes.
fn check_shape(plan: &Plan) -> Result<(), LotError> {
    if plan.steps.len() != BELT_SLOTS as usize {
        return Err(LotError::InsufficientLots {
            unit: plan.unit_code.clone(),
            occupied: plan.steps.len(),
        });
    }
    for (step, box_position) in plan.steps.iter().zip((1..=BELT_SLOTS).rev()) {
        let action = if box_position == FINAL_BOX {
            StepAction::Finalize
        } else {
            StepAction::Advance
        };
        if step.box_position != box_position || step.action != action {
            return Err(LotError::transition(
                &plan.unit_code,
                format!(
                    "session plan step for lot {} does not match box {box_position}",
                    step.lot_code
                ),
            ));
        }
    }
    Ok(())
}

/// Turn a captured plan into the change set that commits it.
///
/// `records[i]` must be the freshly read state of `plan.steps[i]`'s lot. Any
/// lot that moved on since the plan was built fails its step with
/// [`LotError::StaleWrite`]; nothing is produced in that case. A plan that
/// no longer covers the whole belt of its unit is refused outright.
pub fn prepare_commit(
    plan: &Plan,
    records: &[StepRecords],
    actor: &Actor,
    settings: &CommitSettings<'_>,
    now: TimeStamp,
) -> Result<PreparedCommit, LotError> {
    if !actor.is_authenticated() {
        return Err(LotError::Unauthenticated);
    }
    check_shape(plan)?;
    if records.len() != plan.steps.len() {
        return Err(LotError::InsufficientLots {
            unit: plan.unit_code.clone(),
            occupied: records.len(),
        });
    }

    let session = MaintenanceSession {
        id: plan.id.clone(),
        unit_code: plan.unit_code.clone(),
        actor: actor.clone(),
        date: now,
        photo_refs: plan.shared_photos.clone(),
        notes: plan.shared_notes.clone(),
    };

    let mut changes = ChangeSet::new();
    let mut applied = Vec::with_capacity(plan.steps.len());
    let mut link = None;

    for (index, (step, record)) in plan.steps.iter().zip(records).enumerate() {
        let lot = &record.lot;
        if lot.unit_code != plan.unit_code {
            return Err(plan.step_failed(
                index,
                LotError::transition(
                    &lot.code,
                    format!("lot belongs to unit {}, not {}", lot.unit_code, plan.unit_code),
                ),
            ));
        }
        if lot.id != step.lot_id || lot.version != step.lot_version {
            return Err(plan.step_failed(
                index,
                LotError::StaleWrite {
                    lot: step.lot_code.clone(),
                    expected: step.lot_version,
                    found: lot.version,
                },
            ));
        }
        if lot.box_position != step.box_position {
            return Err(plan.step_failed(
                index,
                LotError::transition(
                    &lot.code,
                    format!(
                        "lot is in box {}, plan expects box {}",
                        lot.box_position, step.box_position
                    ),
                ),
            ));
        }

        let mut input = StepInput::new()
            .set_photos(step.capture.photo_refs.clone())
            .set_session(session.id.clone());
        if let Some(weight) = step.capture.measured_weight {
            input = input.set_measured_weight(weight);
        }
        if let Some(notes) = step.capture.notes.clone() {
            input = input.set_notes(notes);
        }

        let transition = match step.action {
            StepAction::Advance => {
                transitions::advance(lot, &record.events, input, actor, settings.decay, now)
            }
            StepAction::Finalize => transitions::finalize(
                lot,
                &record.events,
                input,
                actor,
                settings.decay,
                settings.require_geolocation,
                now,
            )
            .and_then(|mut t| {
                let appended = transitions::certify(
                    &mut t,
                    &record.deliveries,
                    settings.chain_head.as_ref(),
                    &settings.chain_scope,
                )?;
                link = Some(appended);
                Ok(t)
            }),
        }
        .map_err(|e| plan.step_failed(index, e))?;

        changes = changes
            .update_lot(transition.lot.clone(), step.lot_version)
            .insert_event(transition.event.clone());
        applied.push(transition);
    }

    let link = link.ok_or_else(|| {
        LotError::transition(&plan.unit_code, "session plan has no finalization step")
    })?;
    let expected_head = settings.chain_head.as_ref().map(|h| h.lot_id.clone());
    let changes = changes
        .insert_session(session.clone())
        .append_link(link.clone(), expected_head);

    Ok(PreparedCommit {
        changes,
        session,
        transitions: applied,
        link,
    })
}

//! Audit timeline reconstruction
//!
//! Every lot, whatever its recorded history, yields exactly eight stages:
//!
//! | stage | meaning                       |
//! |-------|-------------------------------|
//! | 0     | intake (deliveries in box 1)  |
//! | 1..=6 | weekly transfer into box k+1  |
//! | 7     | finalization                  |
//!
//! Stages without a persisted record are synthesized from the decay model and
//! flagged `is_estimated`. Estimates depend only on stored data, never on the
//! wall clock, so rebuilding an unchanged lot gives identical output.
use std::collections::HashSet;

use super::decay::DecayModel;
use super::lot::{Delivery, Lot, LotPhoto, MaintenanceEvent, MaintenanceSession};
use super::types::{TimeStamp, Weight};

pub const STAGE_COUNT: usize = 8;
pub const FINALIZATION_STAGE: u8 = 7;
pub const ESTIMATED_ACTOR: &str = "system (estimated)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum StageKind {
    Intake,
    Transfer,
    Finalization,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TimelineStage {
    pub index: u8,
    pub kind: StageKind,
    pub label: String,
    pub box_position: u8,
    pub date: TimeStamp,
    pub weight: Weight,
    pub actor: String,
    pub notes: Option<String>,
    pub photo_refs: Vec<String>,
    pub delivery_count: usize,
    pub is_estimated: bool,
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Timeline {
    pub lot_id: String,
    pub stages: Vec<TimelineStage>,
    pub duplicates_removed: usize,
}

impl Timeline {
    pub fn estimated_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_estimated).count()
    }
    pub fn real_count(&self) -> usize {
        self.stages.len() - self.estimated_count()
    }
    pub fn is_complete(&self) -> bool {
        self.estimated_count() == 0
    }
    /// Stages ordered by their recorded timestamp, for display when real
    /// records were taken out of nominal order. Ties keep stage order.
    pub fn display_order(&self) -> Vec<&TimelineStage> {
        let mut ordered: Vec<&TimelineStage> = self.stages.iter().collect();
        ordered.sort_by_key(|s| s.date);
        ordered
    }
}

/// Everything persisted about one lot.
#[derive(Debug, Clone, Copy)]
pub struct TimelineSources<'a> {
    pub lot: &'a Lot,
    pub deliveries: &'a [Delivery],
    pub events: &'a [MaintenanceEvent],
    pub sessions: &'a [MaintenanceSession],
    pub lot_photos: &'a [LotPhoto],
}

#[derive(Default)]
struct PhotoSet {
    seen: HashSet<String>,
    urls: Vec<String>,
    duplicates: usize,
}

impl PhotoSet {
    fn extend<'u>(&mut self, urls: impl IntoIterator<Item = &'u String>) {
        for url in urls {
            if self.seen.insert(url.clone()) {
                self.urls.push(url.clone());
            } else {
                self.duplicates += 1;
            }
        }
    }
}

pub fn reconstruct(sources: &TimelineSources<'_>, decay: &DecayModel, stage_days: i64) -> Timeline {
    let lot = sources.lot;
    let mut stages = Vec::with_capacity(STAGE_COUNT);
    let mut duplicates_removed = 0;

    // stage 0: intake
    let live: Vec<&Delivery> = sources.deliveries.iter().filter(|d| d.is_live()).collect();
    let intake_weight = if live.is_empty() {
        lot.initial_weight
    } else {
        live.iter().map(|d| d.weight).sum::<Weight>()
    };
    let mut photos = PhotoSet::default();
    for delivery in &live {
        photos.extend(&delivery.photo_refs);
    }
    photos.extend(lot_photos_for(sources.lot_photos, 0));
    duplicates_removed += photos.duplicates;
    stages.push(TimelineStage {
        index: 0,
        kind: StageKind::Intake,
        label: format!("Intake ({} deliveries)", live.len()),
        box_position: 1,
        date: lot.start_date,
        weight: intake_weight,
        actor: lot.created_by.name.clone(),
        notes: None,
        photo_refs: photos.urls,
        delivery_count: live.len(),
        is_estimated: false,
        event_id: None,
    });

    // stages 1..=6: transfers into boxes 2..=7
    let mut previous_weight = intake_weight;
    for index in 1..FINALIZATION_STAGE {
        let box_to = index + 1;
        let label = format!("Transfer box {} -> {}", index, box_to);
        let event = sources.events.iter().find(|e| e.box_to() == Some(box_to));

        let stage = match event {
            Some(event) => {
                let (stage, dups) =
                    real_stage(sources, event, index, StageKind::Transfer, label, box_to);
                duplicates_removed += dups;
                stage
            }
            None => estimated_stage(
                lot,
                index,
                StageKind::Transfer,
                label,
                box_to,
                previous_weight,
                decay,
                stage_days,
            ),
        };
        previous_weight = stage.weight;
        stages.push(stage);
    }

    // stage 7: finalization
    let finalization = sources.events.iter().find(|e| e.is_finalization());
    let stage = match (finalization, lot.final_weight, lot.closure_date) {
        (Some(event), _, _) => {
            let (stage, dups) = real_stage(
                sources,
                event,
                FINALIZATION_STAGE,
                StageKind::Finalization,
                "Finalization".to_string(),
                super::lot::FINAL_BOX,
            );
            duplicates_removed += dups;
            stage
        }
        (None, Some(final_weight), Some(closed)) => {
            // closed before events were recorded
            let mut photos = PhotoSet::default();
            photos.extend(lot_photos_for(sources.lot_photos, FINALIZATION_STAGE));
            duplicates_removed += photos.duplicates;
            TimelineStage {
                index: FINALIZATION_STAGE,
                kind: StageKind::Finalization,
                label: "Finalization".to_string(),
                box_position: super::lot::FINAL_BOX,
                date: closed,
                weight: final_weight,
                actor: lot.created_by.name.clone(),
                notes: None,
                photo_refs: photos.urls,
                delivery_count: 0,
                is_estimated: false,
                event_id: None,
            }
        }
        _ => estimated_stage(
            lot,
            FINALIZATION_STAGE,
            StageKind::Finalization,
            "Finalization (not yet finalized)".to_string(),
            super::lot::FINAL_BOX,
            previous_weight,
            decay,
            stage_days,
        ),
    };
    stages.push(stage);

    Timeline {
        lot_id: lot.id.clone(),
        stages,
        duplicates_removed,
    }
}

fn lot_photos_for(photos: &[LotPhoto], stage: u8) -> impl Iterator<Item = &String> {
    photos.iter().filter(move |p| p.stage == stage).map(|p| &p.url)
}

fn real_stage(
    sources: &TimelineSources<'_>,
    event: &MaintenanceEvent,
    index: u8,
    kind: StageKind,
    label: String,
    box_position: u8,
) -> (TimelineStage, usize) {
    let mut photos = PhotoSet::default();
    photos.extend(&event.photo_refs);
    if let Some(session) = event
        .session_id
        .as_deref()
        .and_then(|id| sources.sessions.iter().find(|s| s.id == id))
    {
        photos.extend(&session.photo_refs);
    }
    photos.extend(lot_photos_for(sources.lot_photos, index));
    photos.extend(event.legacy_photo.iter());

    let dups = photos.duplicates;
    let stage = TimelineStage {
        index,
        kind,
        label,
        box_position,
        date: event.created_at,
        weight: event.weight_after,
        actor: event.actor.name.clone(),
        notes: event.notes.clone(),
        photo_refs: photos.urls,
        delivery_count: 0,
        is_estimated: false,
        event_id: Some(event.id.clone()),
    };
    (stage, dups)
}

#[allow(clippy::too_many_arguments)]
fn estimated_stage(
    lot: &Lot,
    index: u8,
    kind: StageKind,
    label: String,
    box_position: u8,
    previous_weight: Weight,
    decay: &DecayModel,
    stage_days: i64,
) -> TimelineStage {
    TimelineStage {
        index,
        kind,
        label,
        box_position,
        date: lot.start_date.plus_days(stage_days * index as i64),
        weight: decay.next_week(previous_weight),
        actor: ESTIMATED_ACTOR.to_string(),
        notes: None,
        photo_refs: vec![],
        delivery_count: 0,
        is_estimated: true,
        event_id: None,
    }
}

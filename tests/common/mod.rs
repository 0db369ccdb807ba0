//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use compost_lot_engine::{
    EngineConfig, LotRepository, LotService, SledLotRepository,
    lot::Volunteer,
    transitions::{DeliveryInput, StepInput},
    types::{Actor, Clock, GeoPoint, TimeStamp, Weight},
};
use tempfile::TempDir;

pub const UNIT: &str = "CWB001";

/// Clock the test moves by hand.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<TimeStamp>>);

impl TestClock {
    pub fn starting_at(start: TimeStamp) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }
    pub fn advance_days(&self, days: i64) {
        let mut now = self.0.lock().unwrap();
        *now = now.plus_days(days);
    }
}

impl Clock for TestClock {
    fn now(&self) -> TimeStamp {
        *self.0.lock().unwrap()
    }
}

pub struct Harness {
    pub service: LotService<SledLotRepository>,
    pub clock: TestClock,
    pub admin: Actor,
    _dir: TempDir, // declared last so it is dropped after the database
}

pub fn harness(config: EngineConfig) -> anyhow::Result<Harness> {
    // Sled locks its directory, so every test gets its own database.
    let dir = tempfile::tempdir()?;
    let repository = SledLotRepository::open(dir.path().join("lots.db"))?;
    let clock = TestClock::starting_at(TimeStamp::new_with(2025, 1, 6, 8, 0, 0));
    let service = LotService::with_clock(repository, config, clock.clone());

    Ok(Harness {
        service,
        clock,
        admin: Actor::administrator("adm_1", "Ana Souza"),
        _dir: dir,
    })
}

pub fn site() -> GeoPoint {
    GeoPoint::new(-25.4284, -49.2733).unwrap()
}

pub fn bucket(volunteer: &str, name: &str, bucket_number: u32, grams: u64) -> DeliveryInput {
    DeliveryInput {
        volunteer: Volunteer::new(volunteer, name),
        bucket_number,
        weight: Weight::from_grams(grams),
        quality_rating: 2,
        geolocation: None,
        photo_refs: vec![],
    }
}

/// Put seven lots on the belt the way seven weeks of intake would.
///
/// `intake[0]` ends up in box 7, `intake[6]` in box 1. Transfers are
/// measured at the incoming weight, so a lot keeps its intake weight; a zero
/// intake means the lot never received a delivery.
pub fn fill_belt(h: &Harness, intake: [u64; 7]) -> anyhow::Result<()> {
    fill_unit_belt(h, UNIT, intake)
}

pub fn fill_unit_belt(h: &Harness, unit: &str, intake: [u64; 7]) -> anyhow::Result<()> {
    for grams in intake {
        let mut active = h.service.repository().find_active_lots_by_unit(unit)?;
        active.sort_by(|a, b| b.box_position.cmp(&a.box_position));
        for lot in active {
            let input = if lot.current_weight.is_zero() {
                StepInput::new()
            } else {
                StepInput::new().set_measured_weight(lot.current_weight)
            };
            h.service.advance(&lot.id, input, &h.admin)?;
        }

        let lot = h.service.create_lot(unit, &h.admin, Some(site()))?;
        if grams > 0 {
            h.service
                .record_delivery(&lot.id, bucket("vol_1", "Joana Lima", 1, grams), &h.admin)?;
        }
        h.clock.advance_days(7);
    }
    Ok(())
}

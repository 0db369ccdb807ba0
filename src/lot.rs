//! Persisted lifecycle records: lots, deliveries, maintenance events
use super::types::{Actor, GeoPoint, TimeStamp, Weight};

/// Number of physical boxes on a unit's belt.
pub const BELT_SLOTS: u8 = 7;
/// Last box; a lot here can only be finalized.
pub const FINAL_BOX: u8 = BELT_SLOTS;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LotStatus {
    #[n(0)]
    Active,
    // sitting in box 7, waiting for finalization
    #[n(1)]
    Processing,
    #[n(2)]
    Closed,
    #[n(3)]
    Distributed,
    #[n(4)]
    Cancelled,
}

impl LotStatus {
    /// Statuses that hold a slot on the belt.
    pub fn occupies_belt(&self) -> bool {
        matches!(self, LotStatus::Active | LotStatus::Processing)
    }
    pub fn is_finalized(&self) -> bool {
        matches!(self, LotStatus::Closed | LotStatus::Distributed)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Lot {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub code: String, // unique per unit
    #[n(2)]
    pub unique_code: String, // public certificate id
    #[n(3)]
    pub status: LotStatus,
    #[n(4)]
    pub box_position: u8,
    #[n(5)]
    pub week_index: u8,
    #[n(6)]
    pub initial_weight: Weight,
    #[n(7)]
    pub current_weight: Weight,
    #[n(8)]
    pub final_weight: Option<Weight>,
    #[n(9)]
    pub bulking_weight: Weight, // cepilho
    #[n(10)]
    pub start_date: TimeStamp,
    #[n(11)]
    pub closure_date: Option<TimeStamp>,
    #[n(12)]
    pub finalization_date: Option<TimeStamp>,
    #[n(13)]
    pub distribution_date: Option<TimeStamp>,
    #[n(14)]
    pub deleted_at: Option<TimeStamp>,
    #[n(15)]
    pub created_by: Actor,
    #[n(16)]
    pub unit_code: String,
    #[n(17)]
    pub geolocation: Option<GeoPoint>,
    #[n(18)]
    pub integrity_hash: Option<String>,
    #[n(19)]
    pub previous_hash: Option<String>,
    #[n(20)]
    pub chain_index: Option<u64>,
    #[n(21)]
    pub version: u64,
}

impl Lot {
    pub fn is_on_belt(&self) -> bool {
        self.deleted_at.is_none() && self.status.occupies_belt()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cbor(array)]
pub struct QualityRating(#[n(0)] u8);

impl QualityRating {
    pub fn new(rating: u8) -> Result<Self, super::error::ValidationError> {
        if !(1..=3).contains(&rating) {
            return Err(super::error::ValidationError::InvalidQuality(rating));
        }
        Ok(Self(rating))
    }
    pub fn value(&self) -> u8 {
        self.0
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Volunteer {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
}

impl Volunteer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct Delivery {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub lot_code: String, // a reference to the box-1 [`Lot`] it was poured into
    #[n(2)]
    pub volunteer: Volunteer,
    #[n(3)]
    pub bucket_number: u32,
    #[n(4)]
    pub weight: Weight,
    #[n(5)]
    pub quality_rating: QualityRating,
    #[n(6)]
    pub geolocation: Option<GeoPoint>,
    #[n(7)]
    pub geolocation_validated: bool,
    #[n(8)]
    pub photo_refs: Vec<String>,
    #[n(9)]
    pub created_at: TimeStamp,
    #[n(10)]
    pub deleted_at: Option<TimeStamp>,
}

impl Delivery {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    #[n(0)]
    Transfer {
        #[n(0)]
        box_from: u8,
        #[n(1)]
        box_to: u8,
    },
    #[n(1)]
    Finalization {
        #[n(0)]
        box_from: u8,
    },
}

/// One weekly transition ("manejo") applied to one lot.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct MaintenanceEvent {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub lot_id: String,
    #[n(2)]
    pub kind: EventKind,
    #[n(3)]
    pub weight_before: Weight,
    #[n(4)]
    pub weight_after: Weight,
    #[n(5)]
    pub photo_refs: Vec<String>,
    #[n(6)]
    pub legacy_photo: Option<String>, // older records kept a single inline photo
    #[n(7)]
    pub notes: Option<String>,
    #[n(8)]
    pub geolocation: Option<GeoPoint>,
    #[n(9)]
    pub actor: Actor,
    #[n(10)]
    pub session_id: Option<String>,
    #[n(11)]
    pub created_at: TimeStamp,
}

impl MaintenanceEvent {
    pub fn box_from(&self) -> u8 {
        match self.kind {
            EventKind::Transfer { box_from, .. } | EventKind::Finalization { box_from } => box_from,
        }
    }
    pub fn box_to(&self) -> Option<u8> {
        match self.kind {
            EventKind::Transfer { box_to, .. } => Some(box_to),
            EventKind::Finalization { .. } => None,
        }
    }
    pub fn is_finalization(&self) -> bool {
        matches!(self.kind, EventKind::Finalization { .. })
    }
}

/// Shared evidence for every event written by one weekly commit.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct MaintenanceSession {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub unit_code: String,
    #[n(2)]
    pub actor: Actor,
    #[n(3)]
    pub date: TimeStamp,
    #[n(4)]
    pub photo_refs: Vec<String>,
    #[n(5)]
    pub notes: Option<String>,
}

/// Photo attached to the lot itself rather than to a delivery or event.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq)]
pub struct LotPhoto {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub lot_id: String,
    #[n(2)]
    pub stage: u8,
    #[n(3)]
    pub url: String,
    #[n(4)]
    pub created_at: TimeStamp,
}

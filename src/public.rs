//! Public certificate view, served without authentication.
//!
//! Volunteers appear by initials only.
use serde::Serialize;

use super::error::LotError;
use super::lot::{Delivery, Lot, LotStatus};
use super::timeline::Timeline;
use super::types::{TimeStamp, Weight};
use super::utils;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotSummary {
    pub code: String,
    pub unique_code: String,
    pub unit_code: String,
    pub status: LotStatus,
    pub start_date: TimeStamp,
    pub closure_date: Option<TimeStamp>,
    pub distribution_date: Option<TimeStamp>,
    pub initial_weight: Weight,
    pub final_weight: Option<Weight>,
    pub bulking_weight: Weight,
    pub administrator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contributor {
    pub initials: String,
    pub bucket_number: u32,
    pub weight: Weight,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicAuditView {
    pub lot: LotSummary,
    pub timeline: Timeline,
    pub integrity_hash: Option<String>,
    pub previous_hash: Option<String>,
    pub chain_index: Option<u64>,
    pub contributors: Vec<Contributor>,
}

impl PublicAuditView {
    pub fn new(lot: &Lot, deliveries: &[Delivery], timeline: Timeline) -> Self {
        let contributors = deliveries
            .iter()
            .filter(|d| d.is_live())
            .map(|d| Contributor {
                initials: utils::initials(&d.volunteer.name),
                bucket_number: d.bucket_number,
                weight: d.weight,
            })
            .collect();

        Self {
            lot: LotSummary {
                code: lot.code.clone(),
                unique_code: lot.unique_code.clone(),
                unit_code: lot.unit_code.clone(),
                status: lot.status,
                start_date: lot.start_date,
                closure_date: lot.closure_date,
                distribution_date: lot.distribution_date,
                initial_weight: lot.initial_weight,
                final_weight: lot.final_weight,
                bulking_weight: lot.bulking_weight,
                administrator: lot.created_by.name.clone(),
            },
            timeline,
            integrity_hash: lot.integrity_hash.clone(),
            previous_hash: lot.previous_hash.clone(),
            chain_index: lot.chain_index,
            contributors,
        }
    }

    pub fn to_json(&self) -> Result<String, LotError> {
        serde_json::to_string_pretty(self).map_err(|e| LotError::Encoding(e.to_string()))
    }
}

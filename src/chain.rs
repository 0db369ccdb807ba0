//! Integrity hash chain over finalized lots
//!
//! Each finalized lot gets a SHA-256 digest over a canonical CBOR record of its
//! certified fields, and a link to the previous finalized lot in the same
//! scope. Volunteer entries are sorted by their full tuple before encoding so
//! retrieval order never changes the digest.
use super::error::LotError;
use super::lot::{Delivery, Lot, MaintenanceEvent};
use super::timeline::Timeline;
use super::types::{GeoPoint, TimeStamp, Weight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainScope {
    Global,
    #[default]
    PerUnit,
}

impl ChainScope {
    /// Storage key of the chain a lot of `unit_code` belongs to.
    pub fn key(&self, unit_code: &str) -> String {
        match self {
            ChainScope::Global => "global".to_string(),
            ChainScope::PerUnit => format!("unit:{unit_code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct IntegrityLink {
    #[n(0)]
    pub lot_id: String,
    #[n(1)]
    pub hash: String,
    #[n(2)]
    pub previous_hash: Option<String>,
    #[n(3)]
    pub chain_index: u64,
    #[n(4)]
    pub scope: String,
}

// pre-image of the lot digest. field order is part of the hash contract
#[derive(minicbor::Encode)]
struct CertificateRecord {
    #[n(0)]
    lot_id: String,
    #[n(1)]
    unique_code: String,
    #[n(2)]
    start_date: TimeStamp,
    #[n(3)]
    unit_code: String,
    #[n(4)]
    geolocation: Option<GeoPoint>,
    #[n(5)]
    intake_weight: Weight,
    #[n(6)]
    bulking_weight: Weight,
    #[n(7)]
    final_weight: Weight,
    #[n(8)]
    volunteers: Vec<VolunteerEntry>,
    #[n(9)]
    administrator_id: String,
    #[n(10)]
    administrator_name: String,
    #[n(11)]
    delivery_count: u64,
    #[n(12)]
    signature: String,
}

#[derive(minicbor::Encode, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct VolunteerEntry {
    #[n(0)]
    volunteer_id: String,
    #[n(1)]
    name: String,
    #[n(2)]
    bucket_number: u32,
    #[n(3)]
    weight: Weight,
}

/// Digest of the lot's certified state, lowercase hex.
pub fn compute_hash(
    lot: &Lot,
    deliveries: &[Delivery],
    finalization: &MaintenanceEvent,
) -> Result<String, LotError> {
    let mut volunteers: Vec<VolunteerEntry> = deliveries
        .iter()
        .filter(|d| d.is_live())
        .map(|d| VolunteerEntry {
            volunteer_id: d.volunteer.id.clone(),
            name: d.volunteer.name.clone(),
            bucket_number: d.bucket_number,
            weight: d.weight,
        })
        .collect();
    volunteers.sort();

    let record = CertificateRecord {
        lot_id: lot.id.clone(),
        unique_code: lot.unique_code.clone(),
        start_date: lot.start_date,
        unit_code: lot.unit_code.clone(),
        geolocation: lot.geolocation,
        intake_weight: lot.initial_weight,
        bulking_weight: lot.bulking_weight,
        final_weight: lot.final_weight.unwrap_or(Weight::ZERO),
        delivery_count: volunteers.len() as u64,
        volunteers,
        administrator_id: lot.created_by.id.clone(),
        administrator_name: lot.created_by.name.clone(),
        signature: format!(
            "{}|{}|{}",
            finalization.actor.id,
            finalization.actor.name,
            finalization.created_at.to_canonical_string()
        ),
    };

    let contents = minicbor::to_vec(&record)?;
    Ok(sha256::digest(&contents))
}

/// Link `hash` of `lot_id` after the current `head` of the chain.
pub fn link(
    lot_id: &str,
    hash: String,
    head: Option<&IntegrityLink>,
    scope: &str,
) -> IntegrityLink {
    IntegrityLink {
        lot_id: lot_id.to_string(),
        hash,
        previous_hash: head.map(|h| h.hash.clone()),
        chain_index: head.map(|h| h.chain_index + 1).unwrap_or(0),
        scope: scope.to_string(),
    }
}

pub fn is_well_formed_hash(hash: &str) -> bool {
    hex::decode(hash).map(|bytes| bytes.len() == 32).unwrap_or(false)
}

/// Missing mandatory data that blocks certifying a lot.
pub fn finalization_blockers(lot: &Lot, require_geolocation: bool) -> Vec<String> {
    let mut findings = vec![];
    if lot.initial_weight.is_zero() {
        findings.push("initial weight is missing or not positive".to_string());
    }
    if require_geolocation && lot.geolocation.is_none() {
        findings.push("geolocation is missing and required for this unit".to_string());
    }
    findings
}

pub fn ensure_certifiable(lot: &Lot, require_geolocation: bool) -> Result<(), LotError> {
    let findings = finalization_blockers(lot, require_geolocation);
    if findings.is_empty() {
        return Ok(());
    }
    Err(LotError::IntegrityViolation {
        lot: lot.code.clone(),
        findings,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum IntegrityStatus {
    Valid,
    Alert,
    Pending,
    Critical,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Finding {
    pub severity: IntegrityStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub findings: Vec<Finding>,
}

impl IntegrityReport {
    pub fn messages(&self) -> Vec<&str> {
        self.findings.iter().map(|f| f.message.as_str()).collect()
    }
}

/// Grade a lot's audit trail. Never mutates anything.
///
/// `recomputed_hash` is the digest of the lot's current stored state, when it
/// could be rebuilt; a mismatch against the stored hash means tampering.
pub fn validate(lot: &Lot, timeline: &Timeline, recomputed_hash: Option<&str>) -> IntegrityReport {
    let mut findings = vec![];
    let mut push = |severity, message: String| findings.push(Finding { severity, message });

    if lot.initial_weight.is_zero() {
        push(
            IntegrityStatus::Critical,
            "initial weight is missing or not positive".into(),
        );
    }

    let finalized = lot.status.is_finalized();
    let estimated = timeline.estimated_count();

    if !finalized && estimated > 0 {
        push(
            IntegrityStatus::Pending,
            format!("{} of 8 stages have real records", 8 - estimated),
        );
    }

    if let Some(stored) = lot.integrity_hash.as_deref() {
        if !is_well_formed_hash(stored) {
            push(
                IntegrityStatus::Critical,
                "stored integrity hash is malformed".into(),
            );
        } else if let Some(recomputed) = recomputed_hash {
            if recomputed != stored {
                push(
                    IntegrityStatus::Critical,
                    "stored integrity hash does not match the lot's current data".into(),
                );
            }
        }
    } else if finalized {
        push(IntegrityStatus::Alert, "closed lot has no integrity hash".into());
    }

    if lot.geolocation.is_none() {
        push(IntegrityStatus::Alert, "lot has no geolocation".into());
    }

    if finalized && estimated > 0 {
        for stage in timeline.stages.iter().filter(|s| s.is_estimated) {
            push(
                IntegrityStatus::Alert,
                format!("stage {} ({}) is estimated", stage.index, stage.label),
            );
        }
    }

    let status = findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(IntegrityStatus::Valid);

    IntegrityReport { status, findings }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainReport {
    pub length: usize,
    pub problems: Vec<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Walk `links` (ordered by index) and report every broken link.
pub fn verify_chain(links: &[IntegrityLink]) -> ChainReport {
    let mut problems = vec![];
    let mut previous: Option<&IntegrityLink> = None;

    for (position, link) in links.iter().enumerate() {
        if link.chain_index != position as u64 {
            problems.push(format!(
                "lot {} has chain index {}, expected {}",
                link.lot_id, link.chain_index, position
            ));
        }
        let expected_previous = previous.map(|p| p.hash.as_str());
        if link.previous_hash.as_deref() != expected_previous {
            problems.push(format!(
                "lot {} does not link to the hash of its predecessor",
                link.lot_id
            ));
        }
        if !is_well_formed_hash(&link.hash) {
            problems.push(format!("lot {} has a malformed hash", link.lot_id));
        }
        previous = Some(link);
    }

    ChainReport {
        length: links.len(),
        problems,
    }
}

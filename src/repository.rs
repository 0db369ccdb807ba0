//! Storage contract required by the lifecycle engine
//!
//! Every write goes through [`LotRepository::apply`], which must run the whole
//! [`ChangeSet`] as one serializable transaction: either every operation lands
//! or none does. Operations are applied in the order they were pushed. An
//! implementation must enforce:
//!
//! - **Slot uniqueness**: at most one belt-holding lot per `(unit, box)`. A lot
//!   claims its slot on insert and on every update that leaves it on the belt,
//!   and releases its old slot when it moves or leaves the belt.
//! - **Optimistic updates**: `UpdateLot` names the version it was read at and
//!   must fail with [`LotError::StaleWrite`] when the stored version differs.
//!   The lot carried by the operation already holds its next version.
//! - **Chain head guard**: `AppendLink` names the head it expects and must fail
//!   with [`LotError::ChainConflict`] when another append got there first.
//!
//! The single-record methods are conveniences over `apply`.
use super::chain::IntegrityLink;
use super::error::LotError;
use super::lot::{Delivery, Lot, LotPhoto, MaintenanceEvent, MaintenanceSession};

#[derive(Debug, Clone)]
pub enum ChangeOp {
    InsertLot(Lot),
    UpdateLot { lot: Lot, expected_version: u64 },
    InsertDelivery(Delivery),
    UpdateDelivery(Delivery),
    InsertEvent(MaintenanceEvent),
    InsertSession(MaintenanceSession),
    InsertLotPhoto(LotPhoto),
    AppendLink {
        link: IntegrityLink,
        expected_head: Option<String>,
    },
}

/// An ordered unit of work.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    ops: Vec<ChangeOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert_lot(mut self, lot: Lot) -> Self {
        self.ops.push(ChangeOp::InsertLot(lot));
        self
    }
    pub fn update_lot(mut self, lot: Lot, expected_version: u64) -> Self {
        self.ops.push(ChangeOp::UpdateLot {
            lot,
            expected_version,
        });
        self
    }
    pub fn insert_delivery(mut self, delivery: Delivery) -> Self {
        self.ops.push(ChangeOp::InsertDelivery(delivery));
        self
    }
    pub fn update_delivery(mut self, delivery: Delivery) -> Self {
        self.ops.push(ChangeOp::UpdateDelivery(delivery));
        self
    }
    pub fn insert_event(mut self, event: MaintenanceEvent) -> Self {
        self.ops.push(ChangeOp::InsertEvent(event));
        self
    }
    pub fn insert_session(mut self, session: MaintenanceSession) -> Self {
        self.ops.push(ChangeOp::InsertSession(session));
        self
    }
    pub fn insert_lot_photo(mut self, photo: LotPhoto) -> Self {
        self.ops.push(ChangeOp::InsertLotPhoto(photo));
        self
    }
    pub fn append_link(mut self, link: IntegrityLink, expected_head: Option<String>) -> Self {
        self.ops.push(ChangeOp::AppendLink {
            link,
            expected_head,
        });
        self
    }
    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }
    pub fn len(&self) -> usize {
        self.ops.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub trait LotRepository {
    /// Apply every operation atomically, in order.
    fn apply(&self, changes: &ChangeSet) -> Result<(), LotError>;

    /// Lots currently holding a slot in `unit`, ordered by box position.
    fn find_active_lots_by_unit(&self, unit: &str) -> Result<Vec<Lot>, LotError>;
    fn get_lot(&self, id: &str) -> Result<Lot, LotError>;
    fn get_lot_by_unique_code(&self, unique_code: &str) -> Result<Lot, LotError>;
    /// Live (not soft-deleted) deliveries in creation order.
    fn list_deliveries(&self, lot_code: &str) -> Result<Vec<Delivery>, LotError>;
    fn get_delivery(&self, lot_code: &str, id: &str) -> Result<Delivery, LotError>;
    /// Events ordered by `created_at`, then box.
    fn list_maintenance_events(&self, lot_id: &str) -> Result<Vec<MaintenanceEvent>, LotError>;
    fn get_session(&self, id: &str) -> Result<Option<MaintenanceSession>, LotError>;
    fn list_lot_photos(&self, lot_id: &str) -> Result<Vec<LotPhoto>, LotError>;
    /// Head of the integrity chain for `scope`.
    fn get_chain_head(&self, scope: &str) -> Result<Option<IntegrityLink>, LotError>;
    /// Every link of `scope` ordered by chain index.
    fn list_chain(&self, scope: &str) -> Result<Vec<IntegrityLink>, LotError>;
    /// Monotonic per-unit counter backing human-readable lot codes.
    ///
    /// A number is reserved before the lot is written, so an insert that is
    /// later rejected leaves a gap. Codes are unique but not contiguous.
    fn next_lot_number(&self, unit: &str) -> Result<u64, LotError>;

    fn insert_lot(&self, lot: &Lot) -> Result<(), LotError> {
        self.apply(&ChangeSet::new().insert_lot(lot.clone()))
    }
    fn update_lot(&self, lot: &Lot, expected_version: u64) -> Result<(), LotError> {
        self.apply(&ChangeSet::new().update_lot(lot.clone(), expected_version))
    }
    /// Marks the lot deleted and releases its slot.
    fn soft_delete_lot(
        &self,
        lot: &Lot,
        deleted_at: super::types::TimeStamp,
    ) -> Result<(), LotError> {
        let mut deleted = lot.clone();
        deleted.deleted_at = Some(deleted_at);
        deleted.version = lot.version + 1;
        self.apply(&ChangeSet::new().update_lot(deleted, lot.version))
    }
    fn insert_delivery(&self, delivery: &Delivery) -> Result<(), LotError> {
        self.apply(&ChangeSet::new().insert_delivery(delivery.clone()))
    }
    fn soft_delete_delivery(
        &self,
        delivery: &Delivery,
        deleted_at: super::types::TimeStamp,
    ) -> Result<(), LotError> {
        let mut deleted = delivery.clone();
        deleted.deleted_at = Some(deleted_at);
        self.apply(&ChangeSet::new().update_delivery(deleted))
    }
    fn insert_maintenance_event(&self, event: &MaintenanceEvent) -> Result<(), LotError> {
        self.apply(&ChangeSet::new().insert_event(event.clone()))
    }
    /// Most recently finalized lot in `scope`.
    fn get_last_finalized_lot(&self, scope: &str) -> Result<Option<Lot>, LotError> {
        match self.get_chain_head(scope)? {
            Some(link) => self.get_lot(&link.lot_id).map(Some),
            None => Ok(None),
        }
    }
}

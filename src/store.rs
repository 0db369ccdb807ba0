//! sled-backed [`LotRepository`]
//!
//! Everything lives in the default tree under prefixed string keys:
//!
//! ```text
//! lot/{id}                   Lot
//! lotcode/{code}             lot id
//! unique/{unique_code}       lot id
//! slot/{unit}/{box}          lot id holding the slot
//! delivery/{lot_code}/{id}   Delivery
//! event/{lot_id}/{id}        MaintenanceEvent
//! session/{id}               MaintenanceSession
//! photo/{lot_id}/{id}        LotPhoto
//! chainhead/{scope}          IntegrityLink at the head of the chain
//! chain/{scope}/{index:020}  IntegrityLink
//! counter/{unit}             u64, big endian
//! ```
//!
//! A change set runs inside one sled transaction, so it is serializable and
//! all-or-nothing.
use std::path::Path;
use std::sync::Arc;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use tracing::debug;

use super::chain::IntegrityLink;
use super::error::LotError;
use super::lot::{Delivery, Lot, LotPhoto, MaintenanceEvent, MaintenanceSession};
use super::repository::{ChangeOp, ChangeSet, LotRepository};

pub struct SledLotRepository {
    instance: Arc<sled::Db>,
}

fn lot_key(id: &str) -> String {
    format!("lot/{id}")
}
fn code_key(code: &str) -> String {
    format!("lotcode/{code}")
}
fn unique_key(unique_code: &str) -> String {
    format!("unique/{unique_code}")
}
fn slot_key(unit: &str, box_position: u8) -> String {
    format!("slot/{unit}/{box_position}")
}
fn delivery_key(lot_code: &str, id: &str) -> String {
    format!("delivery/{lot_code}/{id}")
}
fn event_key(lot_id: &str, id: &str) -> String {
    format!("event/{lot_id}/{id}")
}
fn session_key(id: &str) -> String {
    format!("session/{id}")
}
fn photo_key(lot_id: &str, id: &str) -> String {
    format!("photo/{lot_id}/{id}")
}
fn head_key(scope: &str) -> String {
    format!("chainhead/{scope}")
}
fn link_key(scope: &str, index: u64) -> String {
    format!("chain/{scope}/{index:020}")
}
fn counter_key(unit: &str) -> String {
    format!("counter/{unit}")
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LotError> {
    Ok(minicbor::to_vec(value)?)
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T, LotError> {
    Ok(minicbor::decode(bytes)?)
}

fn abort<T>(err: LotError) -> ConflictableTransactionResult<T, LotError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn lift<T>(result: Result<T, LotError>) -> ConflictableTransactionResult<T, LotError> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn claim_slot(tx: &TransactionalTree, lot: &Lot) -> ConflictableTransactionResult<(), LotError> {
    let key = slot_key(&lot.unit_code, lot.box_position);
    if let Some(owner) = tx.get(key.as_bytes())? {
        if &owner[..] != lot.id.as_bytes() {
            return abort(LotError::SlotOccupied {
                unit: lot.unit_code.clone(),
                box_position: lot.box_position,
                lot: lot.code.clone(),
            });
        }
    }
    tx.insert(key.as_bytes(), lot.id.as_bytes())?;
    Ok(())
}

fn release_slot(tx: &TransactionalTree, lot: &Lot) -> ConflictableTransactionResult<(), LotError> {
    let key = slot_key(&lot.unit_code, lot.box_position);
    if let Some(owner) = tx.get(key.as_bytes())? {
        if &owner[..] == lot.id.as_bytes() {
            tx.remove(key.as_bytes())?;
        }
    }
    Ok(())
}

fn apply_op(tx: &TransactionalTree, op: &ChangeOp) -> ConflictableTransactionResult<(), LotError> {
    match op {
        ChangeOp::InsertLot(lot) => {
            let key = lot_key(&lot.id);
            if tx.get(key.as_bytes())?.is_some() {
                return abort(LotError::Repository(format!("lot {} already exists", lot.id)));
            }
            let code = code_key(&lot.code);
            if tx.get(code.as_bytes())?.is_some() {
                return abort(LotError::Repository(format!(
                    "lot code {} is already taken",
                    lot.code
                )));
            }
            if lot.is_on_belt() {
                claim_slot(tx, lot)?;
            }
            tx.insert(key.as_bytes(), lift(encode(lot))?)?;
            tx.insert(code.as_bytes(), lot.id.as_bytes())?;
            tx.insert(unique_key(&lot.unique_code).as_bytes(), lot.id.as_bytes())?;
        }
        ChangeOp::UpdateLot {
            lot,
            expected_version,
        } => {
            let key = lot_key(&lot.id);
            let stored: Lot = match tx.get(key.as_bytes())? {
                Some(bytes) => lift(decode(&bytes))?,
                None => return abort(LotError::not_found("lot", lot.id.clone())),
            };
            if stored.version != *expected_version {
                return abort(LotError::StaleWrite {
                    lot: lot.code.clone(),
                    expected: *expected_version,
                    found: stored.version,
                });
            }
            if stored.is_on_belt() {
                release_slot(tx, &stored)?;
            }
            if lot.is_on_belt() {
                claim_slot(tx, lot)?;
            }
            tx.insert(key.as_bytes(), lift(encode(lot))?)?;
        }
        ChangeOp::InsertDelivery(delivery) => {
            let key = delivery_key(&delivery.lot_code, &delivery.id);
            if tx.get(key.as_bytes())?.is_some() {
                return abort(LotError::Repository(format!(
                    "delivery {} already exists",
                    delivery.id
                )));
            }
            tx.insert(key.as_bytes(), lift(encode(delivery))?)?;
        }
        ChangeOp::UpdateDelivery(delivery) => {
            let key = delivery_key(&delivery.lot_code, &delivery.id);
            if tx.get(key.as_bytes())?.is_none() {
                return abort(LotError::not_found("delivery", delivery.id.clone()));
            }
            tx.insert(key.as_bytes(), lift(encode(delivery))?)?;
        }
        ChangeOp::InsertEvent(event) => {
            let key = event_key(&event.lot_id, &event.id);
            tx.insert(key.as_bytes(), lift(encode(event))?)?;
        }
        ChangeOp::InsertSession(session) => {
            tx.insert(session_key(&session.id).as_bytes(), lift(encode(session))?)?;
        }
        ChangeOp::InsertLotPhoto(photo) => {
            let key = photo_key(&photo.lot_id, &photo.id);
            tx.insert(key.as_bytes(), lift(encode(photo))?)?;
        }
        ChangeOp::AppendLink {
            link,
            expected_head,
        } => {
            let head = head_key(&link.scope);
            let current: Option<IntegrityLink> = match tx.get(head.as_bytes())? {
                Some(bytes) => Some(lift(decode(&bytes))?),
                None => None,
            };
            if current.as_ref().map(|h| &h.lot_id) != expected_head.as_ref() {
                return abort(LotError::ChainConflict {
                    scope: link.scope.clone(),
                    lot: link.lot_id.clone(),
                });
            }
            let encoded = lift(encode(link))?;
            tx.insert(link_key(&link.scope, link.chain_index).as_bytes(), encoded.clone())?;
            tx.insert(head.as_bytes(), encoded)?;
        }
    }
    Ok(())
}

impl SledLotRepository {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, LotError> {
        let db = sled::open(path)?;
        Ok(Self::new(Arc::new(db)))
    }

    fn get_decoded<T: for<'b> minicbor::Decode<'b, ()>>(
        &self,
        key: &str,
    ) -> Result<Option<T>, LotError> {
        match self.instance.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_decoded<T: for<'b> minicbor::Decode<'b, ()>>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, LotError> {
        self.instance
            .scan_prefix(prefix.as_bytes())
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn lot_by_index(&self, key: &str, entity: &'static str, id: &str) -> Result<Lot, LotError> {
        match self.instance.get(key.as_bytes())? {
            Some(lot_id) => self.get_lot(&String::from_utf8_lossy(&lot_id)),
            None => Err(LotError::not_found(entity, id)),
        }
    }
}

impl LotRepository for SledLotRepository {
    fn apply(&self, changes: &ChangeSet) -> Result<(), LotError> {
        let result = self.instance.transaction(|tx| -> ConflictableTransactionResult<(), LotError> {
            for op in changes.ops() {
                apply_op(tx, op)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!(ops = changes.len(), "change set applied");
                Ok(())
            }
            Err(TransactionError::Abort(err)) => {
                debug!(error = %err, "change set aborted");
                Err(err)
            }
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn find_active_lots_by_unit(&self, unit: &str) -> Result<Vec<Lot>, LotError> {
        let prefix = format!("slot/{unit}/");
        let mut lots = vec![];
        for entry in self.instance.scan_prefix(prefix.as_bytes()) {
            let (_, lot_id) = entry?;
            let lot = self.get_lot(&String::from_utf8_lossy(&lot_id))?;
            if lot.is_on_belt() {
                lots.push(lot);
            }
        }
        lots.sort_by_key(|l| l.box_position);
        Ok(lots)
    }

    fn get_lot(&self, id: &str) -> Result<Lot, LotError> {
        self.get_decoded(&lot_key(id))?
            .ok_or_else(|| LotError::not_found("lot", id))
    }

    fn get_lot_by_unique_code(&self, unique_code: &str) -> Result<Lot, LotError> {
        self.lot_by_index(&unique_key(unique_code), "certificate", unique_code)
    }

    fn list_deliveries(&self, lot_code: &str) -> Result<Vec<Delivery>, LotError> {
        let mut deliveries: Vec<Delivery> = self
            .scan_decoded::<Delivery>(&format!("delivery/{lot_code}/"))?
            .into_iter()
            .filter(|d| d.is_live())
            .collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(deliveries)
    }

    fn get_delivery(&self, lot_code: &str, id: &str) -> Result<Delivery, LotError> {
        self.get_decoded(&delivery_key(lot_code, id))?
            .ok_or_else(|| LotError::not_found("delivery", id))
    }

    fn list_maintenance_events(&self, lot_id: &str) -> Result<Vec<MaintenanceEvent>, LotError> {
        let mut events: Vec<MaintenanceEvent> = self.scan_decoded(&format!("event/{lot_id}/"))?;
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.box_from().cmp(&b.box_from()))
        });
        Ok(events)
    }

    fn get_session(&self, id: &str) -> Result<Option<MaintenanceSession>, LotError> {
        self.get_decoded(&session_key(id))
    }

    fn list_lot_photos(&self, lot_id: &str) -> Result<Vec<LotPhoto>, LotError> {
        let mut photos: Vec<LotPhoto> = self.scan_decoded(&format!("photo/{lot_id}/"))?;
        photos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(photos)
    }

    fn get_chain_head(&self, scope: &str) -> Result<Option<IntegrityLink>, LotError> {
        self.get_decoded(&head_key(scope))
    }

    fn list_chain(&self, scope: &str) -> Result<Vec<IntegrityLink>, LotError> {
        // zero-padded indices keep key order equal to chain order
        self.scan_decoded(&format!("chain/{scope}/"))
    }

    fn next_lot_number(&self, unit: &str) -> Result<u64, LotError> {
        let read = |bytes: &[u8]| <[u8; 8]>::try_from(bytes).map(u64::from_be_bytes).unwrap_or(0);

        let updated = self
            .instance
            .update_and_fetch(counter_key(unit).as_bytes(), |old| {
                let next = old.map(read).unwrap_or(0) + 1;
                Some(next.to_be_bytes().to_vec())
            })?;

        updated
            .map(|bytes| read(&bytes))
            .ok_or_else(|| LotError::Repository(format!("lot counter for {unit} vanished")))
    }
}

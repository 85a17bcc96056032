//! Bounded transaction store
//!
//! Each connector owns a fixed number of slots. Transactions stay in the
//! store after they finish (history) until a new session needs the slot; an
//! unfinished transaction is never evicted. Every mutation of a connector's
//! slots is written back as one JSON document under `tx-{connector}`.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::TimeMs;
use crate::error::SessionError;
use crate::persistence::{load_json, save_json, Persistence};
use crate::transaction::{ConnectorId, IdTag, Transaction, TxNr};

/// Slots of one connector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectorSlots {
    next_tx_nr: TxNr,
    transactions: BTreeMap<TxNr, Transaction>,
}

/// Transaction registry for all connectors
pub struct TransactionStore {
    capacity: usize,
    persistence: Rc<dyn Persistence>,
    connectors: BTreeMap<ConnectorId, ConnectorSlots>,
}

impl TransactionStore {
    /// Open the store, restoring whatever the backend holds for `connectors`
    pub fn open(
        capacity: usize,
        persistence: Rc<dyn Persistence>,
        connectors: impl IntoIterator<Item = ConnectorId>,
    ) -> Self {
        let mut map = BTreeMap::new();
        for connector_id in connectors {
            let mut slots: ConnectorSlots =
                load_json(persistence.as_ref(), &key_for(connector_id)).unwrap_or_default();

            // Drop anything that does not belong here
            slots
                .transactions
                .retain(|nr, tx| tx.connector_id == connector_id && tx.tx_nr == *nr);

            let silent = slots.transactions.values().filter(|tx| tx.silent).count();
            if silent > 0 {
                info!(
                    "Store: Dropping {} silent transactions on connector {}",
                    silent, connector_id
                );
                slots.transactions.retain(|_, tx| !tx.silent);
            }

            if let Some(last) = slots.transactions.keys().next_back() {
                slots.next_tx_nr = slots.next_tx_nr.max(last.wrapping_add(1));
            }
            if !slots.transactions.is_empty() {
                info!(
                    "Store: Restored {} transactions on connector {}",
                    slots.transactions.len(),
                    connector_id
                );
            }
            map.insert(connector_id, slots);
        }

        Self {
            capacity,
            persistence,
            connectors: map,
        }
    }

    /// Slots per connector
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored transactions on a connector
    pub fn len(&self, connector_id: ConnectorId) -> usize {
        self.connectors
            .get(&connector_id)
            .map(|s| s.transactions.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, connector_id: ConnectorId) -> bool {
        self.len(connector_id) == 0
    }

    /// Allocate a new transaction, evicting finished history if needed
    pub fn create(
        &mut self,
        connector_id: ConnectorId,
        id_tag: IdTag,
        now: TimeMs,
    ) -> Result<&mut Transaction, SessionError> {
        let capacity = self.capacity;
        let slots = self
            .connectors
            .get_mut(&connector_id)
            .ok_or(SessionError::UnknownConnector(connector_id))?;

        while slots.transactions.values().filter(|tx| !tx.silent).count() >= capacity {
            let oldest_finished = slots
                .transactions
                .iter()
                .find(|(_, tx)| tx.is_finished())
                .map(|(nr, _)| *nr);

            match oldest_finished {
                Some(nr) => {
                    debug!("Store: Evicting finished transaction {}-{}", connector_id, nr);
                    slots.transactions.remove(&nr);
                }
                None => {
                    warn!(
                        "Store: No free slot on connector {} ({} unfinished)",
                        connector_id,
                        slots.transactions.len()
                    );
                    return Err(SessionError::QueueFull(connector_id));
                }
            }
        }

        let tx_nr = slots.next_tx_nr;
        slots.next_tx_nr = slots.next_tx_nr.wrapping_add(1);
        slots
            .transactions
            .insert(tx_nr, Transaction::new(connector_id, tx_nr, id_tag, now));

        self.commit(connector_id);

        debug!("Store: Created transaction {}-{}", connector_id, tx_nr);
        self.get_mut(connector_id, tx_nr)
            .ok_or(SessionError::QueueFull(connector_id))
    }

    /// Allocate a transaction outside the slot budget that is never reported
    ///
    /// Silent transactions do not count against the capacity and are dropped
    /// when the store is reopened.
    pub fn create_silent(
        &mut self,
        connector_id: ConnectorId,
        id_tag: IdTag,
        now: TimeMs,
    ) -> Result<&mut Transaction, SessionError> {
        let slots = self
            .connectors
            .get_mut(&connector_id)
            .ok_or(SessionError::UnknownConnector(connector_id))?;

        let tx_nr = slots.next_tx_nr;
        slots.next_tx_nr = slots.next_tx_nr.wrapping_add(1);
        let mut tx = Transaction::new(connector_id, tx_nr, id_tag, now);
        tx.silent = true;
        slots.transactions.insert(tx_nr, tx);

        self.commit(connector_id);

        info!("Store: Created silent transaction {}-{}", connector_id, tx_nr);
        self.get_mut(connector_id, tx_nr)
            .ok_or(SessionError::QueueFull(connector_id))
    }

    pub fn get(&self, connector_id: ConnectorId, tx_nr: TxNr) -> Option<&Transaction> {
        self.connectors
            .get(&connector_id)
            .and_then(|s| s.transactions.get(&tx_nr))
    }

    /// Mutable access; call [`commit`](Self::commit) afterwards to persist
    pub fn get_mut(&mut self, connector_id: ConnectorId, tx_nr: TxNr) -> Option<&mut Transaction> {
        self.connectors
            .get_mut(&connector_id)
            .and_then(|s| s.transactions.get_mut(&tx_nr))
    }

    /// Most recent transaction of a connector
    pub fn latest(&self, connector_id: ConnectorId) -> Option<&Transaction> {
        self.connectors
            .get(&connector_id)
            .and_then(|s| s.transactions.values().next_back())
    }

    /// Transactions of a connector, oldest first
    pub fn iter(&self, connector_id: ConnectorId) -> impl Iterator<Item = &Transaction> {
        self.connectors
            .get(&connector_id)
            .into_iter()
            .flat_map(|s| s.transactions.values())
    }

    /// Delete one transaction
    pub fn remove(&mut self, connector_id: ConnectorId, tx_nr: TxNr) -> Option<Transaction> {
        let removed = self
            .connectors
            .get_mut(&connector_id)
            .and_then(|s| s.transactions.remove(&tx_nr));

        if removed.is_some() {
            debug!("Store: Removed transaction {}-{}", connector_id, tx_nr);
            self.commit(connector_id);
        }
        removed
    }

    /// Write a connector's slots to the backend
    pub fn commit(&self, connector_id: ConnectorId) {
        if let Some(slots) = self.connectors.get(&connector_id) {
            save_json(self.persistence.as_ref(), &key_for(connector_id), slots);
        }
    }
}

fn key_for(connector_id: ConnectorId) -> String {
    format!("tx-{}", connector_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::transaction::parse_id_tag;

    fn tag(s: &str) -> IdTag {
        parse_id_tag(s).unwrap()
    }

    fn store(capacity: usize) -> (TransactionStore, Rc<MemoryPersistence>) {
        let backend = Rc::new(MemoryPersistence::new());
        let store = TransactionStore::open(capacity, backend.clone(), [1, 2]);
        (store, backend)
    }

    #[test]
    fn test_create_assigns_increasing_numbers() {
        let (mut store, _) = store(4);
        let a = store.create(1, tag("A"), 0).unwrap().tx_nr;
        let b = store.create(1, tag("B"), 0).unwrap().tx_nr;
        let c = store.create(2, tag("C"), 0).unwrap().tx_nr;

        assert_eq!((a, b, c), (0, 1, 0));
        assert_eq!(store.len(1), 2);
        assert_eq!(store.latest(1).map(|tx| tx.id_tag.as_str()), Some("B"));
    }

    #[test]
    fn test_full_store_rejects_unfinished() {
        let (mut store, _) = store(1);
        store.create(1, tag("A"), 0).unwrap();

        assert_eq!(
            store.create(1, tag("B"), 0).map(|_| ()),
            Err(SessionError::QueueFull(1))
        );
        // Existing entry untouched
        assert_eq!(store.get(1, 0).map(|tx| tx.id_tag.as_str()), Some("A"));
    }

    #[test]
    fn test_full_store_evicts_oldest_finished() {
        let (mut store, _) = store(2);
        store.create(1, tag("A"), 0).unwrap();
        store.create(1, tag("B"), 0).unwrap();

        // Complete the first one
        if let Some(tx) = store.get_mut(1, 0) {
            tx.start.requested = true;
            tx.start.confirmed = true;
            tx.end_session(None);
            tx.stop.requested = true;
            tx.stop.confirmed = true;
        }

        let nr = store.create(1, tag("C"), 0).unwrap().tx_nr;
        assert_eq!(nr, 2);
        assert!(store.get(1, 0).is_none());
        assert!(store.get(1, 1).is_some());
    }

    #[test]
    fn test_unknown_connector() {
        let (mut store, _) = store(1);
        assert_eq!(
            store.create(9, tag("A"), 0).map(|_| ()),
            Err(SessionError::UnknownConnector(9))
        );
    }

    #[test]
    fn test_reopen_restores_slots() {
        let backend = Rc::new(MemoryPersistence::new());
        {
            let mut store = TransactionStore::open(4, backend.clone(), [1]);
            let tx = store.create(1, tag("ABC"), 0).unwrap();
            tx.start.requested = true;
            store.commit(1);
            store.create(1, tag("DEF"), 0).unwrap();
            store.remove(1, 1);
        }

        let mut store = TransactionStore::open(4, backend, [1]);
        assert_eq!(store.len(1), 1);
        let tx = store.get(1, 0).unwrap();
        assert!(tx.start.requested);

        // Numbering continues after the restored entries
        assert_eq!(store.create(1, tag("X"), 0).unwrap().tx_nr, 2);
    }

    #[test]
    fn test_silent_transactions_outside_capacity() {
        let backend = Rc::new(MemoryPersistence::new());
        {
            let mut store = TransactionStore::open(1, backend.clone(), [1]);
            store.create(1, tag("A"), 0).unwrap();
            let tx = store.create_silent(1, tag("B"), 0).unwrap();
            assert!(tx.silent);
            assert_eq!(tx.tx_nr, 1);
            assert_eq!(store.len(1), 2);
        }

        let store = TransactionStore::open(1, backend, [1]);
        assert_eq!(store.len(1), 1);
        assert!(store.get(1, 1).is_none());
    }
}

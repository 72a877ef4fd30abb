use crate::core::Transaction;
use crate::error::{NodeError, Result};
use log::info;
use std::collections::HashMap;

// ( K -> txid_hex, V -> entry )
//
// The mempool carries no lock of its own: it lives inside the ledger's
// single-writer state, so every mutation is already serialized with block
// appends. A transaction admitted here either ends up in a block or stays
// until evicted; it is never silently dropped.
pub struct Mempool {
    entries: HashMap<String, PoolEntry>,
    next_seq: u64,
    capacity: usize,
}

struct PoolEntry {
    tx: Transaction,
    /// Admission order, the tie-break after fee
    seq: u64,
}

impl Mempool {
    pub fn new(capacity: usize) -> Mempool {
        Mempool {
            entries: HashMap::new(),
            next_seq: 0,
            capacity,
        }
    }

    pub fn contains(&self, txid_hex: &str) -> bool {
        self.entries.contains_key(txid_hex)
    }

    pub fn get(&self, txid_hex: &str) -> Option<&Transaction> {
        self.entries.get(txid_hex).map(|entry| &entry.tx)
    }

    /// Admit a transaction, evicting the lowest-fee entry when full and the
    /// newcomer pays strictly more than it.
    pub fn insert(&mut self, tx: Transaction) -> Result<()> {
        let txid_hex = tx.id_hex();
        if self.entries.contains_key(&txid_hex) {
            return Err(NodeError::Validation(format!(
                "transaction {txid_hex} already in mempool"
            )));
        }

        if self.entries.len() >= self.capacity {
            let (lowest_id, lowest_fee) = self
                .lowest_fee_entry()
                .ok_or_else(|| NodeError::Resource("mempool full".to_string()))?;
            if tx.get_fee() <= lowest_fee {
                return Err(NodeError::Resource(format!(
                    "mempool full and fee {} does not beat the floor of {lowest_fee}",
                    tx.get_fee()
                )));
            }
            info!("Mempool full: evicting {lowest_id} (fee {lowest_fee})");
            self.entries.remove(&lowest_id);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(txid_hex, PoolEntry { tx, seq });
        Ok(())
    }

    pub fn remove(&mut self, txid_hex: &str) -> Option<Transaction> {
        self.entries.remove(txid_hex).map(|entry| entry.tx)
    }

    /// Append a signature to a pending multi-sig transaction
    pub fn add_signature(&mut self, txid_hex: &str, signer: &str, signature: Vec<u8>) -> Result<()> {
        let entry = self.entries.get_mut(txid_hex).ok_or_else(|| {
            NodeError::NotFound(format!("transaction {txid_hex} not in mempool"))
        })?;
        entry.tx.add_signature(signer, signature)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of pending debits already promised by an address
    pub fn pending_debit(&self, sender: &str) -> u64 {
        self.entries
            .values()
            .filter(|entry| entry.tx.get_sender() == sender)
            .map(|entry| entry.tx.debit_total())
            .sum()
    }

    /// All entries in assembly order: fee descending, admission ascending
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.ordered().into_iter().map(|e| e.tx.clone()).collect()
    }

    /// Up to `max` entries eligible for inclusion at `now`, in assembly order
    pub fn eligible(&self, now: i64, max: usize) -> Vec<Transaction> {
        self.ordered()
            .into_iter()
            .filter(|entry| entry.tx.is_eligible_for_inclusion(now))
            .take(max)
            .map(|entry| entry.tx.clone())
            .collect()
    }

    pub fn has_eligible(&self, now: i64) -> bool {
        self.entries
            .values()
            .any(|entry| entry.tx.is_eligible_for_inclusion(now))
    }

    fn ordered(&self) -> Vec<&PoolEntry> {
        let mut entries: Vec<&PoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.tx.get_fee()
                .cmp(&a.tx.get_fee())
                .then(a.seq.cmp(&b.seq))
        });
        entries
    }

    /// Lowest fee currently admitted, ties broken toward the newest entry
    fn lowest_fee_entry(&self) -> Option<(String, u64)> {
        self.entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.tx.get_fee()
                    .cmp(&b.tx.get_fee())
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(id, entry)| (id.clone(), entry.tx.get_fee()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransactionBuilder;

    fn tx_with_fee(n: u64, fee: u64) -> Transaction {
        TransactionBuilder::standard("alice", &format!("recipient-{n}"), 1 + n, fee).unwrap()
    }

    #[test]
    fn test_duplicate_admission_rejected() {
        let mut pool = Mempool::new(10);
        let tx = tx_with_fee(0, 1);

        pool.insert(tx.clone()).unwrap();
        assert!(pool.insert(tx).is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_assembly_order_fee_then_admission() {
        let mut pool = Mempool::new(10);
        let low = tx_with_fee(1, 1);
        let high = tx_with_fee(2, 9);
        let mid_first = tx_with_fee(3, 5);
        let mid_second = tx_with_fee(4, 5);

        pool.insert(low.clone()).unwrap();
        pool.insert(mid_first.clone()).unwrap();
        pool.insert(mid_second.clone()).unwrap();
        pool.insert(high.clone()).unwrap();

        let ordered = pool.snapshot();
        assert_eq!(ordered[0].get_id(), high.get_id());
        assert_eq!(ordered[1].get_id(), mid_first.get_id());
        assert_eq!(ordered[2].get_id(), mid_second.get_id());
        assert_eq!(ordered[3].get_id(), low.get_id());
    }

    #[test]
    fn test_capacity_evicts_lowest_fee() {
        let mut pool = Mempool::new(3);
        let lowest = tx_with_fee(1, 1);
        pool.insert(lowest.clone()).unwrap();
        pool.insert(tx_with_fee(2, 5)).unwrap();
        pool.insert(tx_with_fee(3, 7)).unwrap();

        // Beats the floor: lowest is evicted
        pool.insert(tx_with_fee(4, 3)).unwrap();
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&lowest.id_hex()));

        // Does not beat the floor: rejected, pool unchanged
        let result = pool.insert(tx_with_fee(5, 2));
        assert!(matches!(result, Err(NodeError::Resource(_))));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_eligibility_filtering() {
        let mut pool = Mempool::new(10);
        let ready = tx_with_fee(1, 2);
        let locked =
            TransactionBuilder::time_locked("alice", "bob", 5, 1, 10_000).unwrap();

        pool.insert(ready.clone()).unwrap();
        pool.insert(locked.clone()).unwrap();

        let eligible = pool.eligible(5_000, 10);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].get_id(), ready.get_id());

        let eligible = pool.eligible(10_000, 10);
        assert_eq!(eligible.len(), 2);
    }

    #[test]
    fn test_pending_debit_tracks_sender() {
        let mut pool = Mempool::new(10);
        pool.insert(tx_with_fee(1, 2)).unwrap();
        pool.insert(tx_with_fee(2, 3)).unwrap();

        // amounts 2 and 3, fees 2 and 3
        assert_eq!(pool.pending_debit("alice"), 10);
        assert_eq!(pool.pending_debit("bob"), 0);
    }
}

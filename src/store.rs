//! sled-backed persistence
//!
//! Every mutation runs through [`Store::atomically`], a serializable transaction
//! over all trees, so an entity write and the ledger entry documenting it commit
//! together or not at all. Range scans are not available inside sled
//! transactions; anything that needs one reads before the transaction and
//! re-checks by key inside it.
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use super::card::SavedCard;
use super::error::RequestError;
use super::ledger::{LedgerEntry, LedgerFilter, Order};
use super::payment::Payment;
use super::proof::ProofUpload;
use super::request::Request;

const REQUESTS: usize = 0;
const LEDGER: usize = 1;
const LEDGER_IDS: usize = 2;
const LEDGER_BY_REQUEST: usize = 3;
const LEDGER_BY_ACCOUNT: usize = 4;
const PROOFS: usize = 5;
const PAYMENTS: usize = 6;
const CARDS: usize = 7;
const CARDS_BY_HOLDER: usize = 8;

const TREE_NAMES: [&str; 9] = [
    "requests",
    "ledger",
    "ledger_ids",
    "ledger_by_request",
    "ledger_by_account",
    "proofs",
    "payments",
    "cards",
    "cards_by_holder",
];

const SEPARATOR: u8 = 0;

fn index_key(prefix: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + suffix.len());
    key.extend_from_slice(prefix.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(suffix);
    key
}

fn index_prefix(prefix: &str) -> Vec<u8> {
    index_key(prefix, &[])
}

pub(crate) fn decode<T>(bytes: &[u8], what: &'static str) -> Result<T, RequestError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|_| RequestError::Decode(what))
}

pub(crate) fn encode<T: minicbor::Encode<()>>(
    value: &T,
    what: &'static str,
) -> Result<Vec<u8>, RequestError> {
    minicbor::to_vec(value).map_err(|_| RequestError::Encode(what))
}

fn abort_on<T>(result: Result<T, RequestError>) -> ConflictableTransactionResult<T, RequestError> {
    result.map_err(ConflictableTransactionError::Abort)
}

#[derive(Clone)]
pub struct Store {
    db: Db,
    trees: Vec<Tree>,
}

impl Store {
    pub fn open(db: &Db) -> Result<Self, RequestError> {
        let trees = TREE_NAMES
            .iter()
            .map(|name| db.open_tree(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            db: db.clone(),
            trees,
        })
    }

    /// Monotonic sequence used to order ledger entries created in the same instant.
    pub fn next_seq(&self) -> Result<u64, RequestError> {
        Ok(self.db.generate_id()?)
    }

    /// Runs `f` in one transaction over every tree. `f` may be re-run on conflict,
    /// so it must not have side effects outside the transaction.
    pub fn atomically<T, F>(&self, f: F) -> Result<T, RequestError>
    where
        F: Fn(&Tx<'_>) -> ConflictableTransactionResult<T, RequestError>,
    {
        self.trees
            .as_slice()
            .transaction(|views| f(&Tx { trees: views }))
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => RequestError::Storage(e),
            })
    }

    fn get<T>(&self, tree: usize, key: &[u8], what: &'static str) -> Result<Option<T>, RequestError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.trees[tree].get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes, what)?)),
            None => Ok(None),
        }
    }

    pub fn get_request(&self, id: &str) -> Result<Option<Request>, RequestError> {
        self.get(REQUESTS, id.as_bytes(), "request")
    }

    pub fn get_proof(&self, id: &str) -> Result<Option<ProofUpload>, RequestError> {
        self.get(PROOFS, id.as_bytes(), "proof upload")
    }

    pub fn get_payment(&self, id: &str) -> Result<Option<Payment>, RequestError> {
        self.get(PAYMENTS, id.as_bytes(), "payment")
    }

    pub fn get_card(&self, id: &str) -> Result<Option<SavedCard>, RequestError> {
        self.get(CARDS, id.as_bytes(), "saved card")
    }

    pub fn cards_for(&self, cardholder_email: &str) -> Result<Vec<SavedCard>, RequestError> {
        let mut cards = Vec::new();
        for item in self.trees[CARDS_BY_HOLDER].scan_prefix(index_prefix(cardholder_email)) {
            let (_, card_id) = item?;
            if let Some(bytes) = self.trees[CARDS].get(&card_id)? {
                cards.push(decode(&bytes, "saved card")?);
            }
        }
        Ok(cards)
    }

    pub fn proofs_for_request(&self, request_id: &str) -> Result<Vec<ProofUpload>, RequestError> {
        let mut proofs = Vec::new();
        for item in self.trees[PROOFS].iter() {
            let (_, bytes) = item?;
            let proof: ProofUpload = decode(&bytes, "proof upload")?;
            if proof.request_id == request_id {
                proofs.push(proof);
            }
        }
        proofs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(proofs)
    }

    pub fn payments_for_request(&self, request_id: &str) -> Result<Vec<Payment>, RequestError> {
        let mut payments = Vec::new();
        for item in self.trees[PAYMENTS].iter() {
            let (_, bytes) = item?;
            let payment: Payment = decode(&bytes, "payment")?;
            if payment.request_id == request_id {
                payments.push(payment);
            }
        }
        payments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(payments)
    }

    pub fn ledger_entry(&self, id: &str) -> Result<Option<LedgerEntry>, RequestError> {
        match self.trees[LEDGER_IDS].get(id.as_bytes())? {
            Some(key) => self.get(LEDGER, &key, "ledger entry"),
            None => Ok(None),
        }
    }

    pub fn ledger_len(&self) -> usize {
        self.trees[LEDGER].len()
    }

    /// Entries referencing the request directly or through one of its proof uploads.
    pub fn ledger_for_request(
        &self,
        request_id: &str,
        order: Order,
    ) -> Result<Vec<LedgerEntry>, RequestError> {
        self.scan_index(LEDGER_BY_REQUEST, request_id, order, usize::MAX)
    }

    pub fn ledger_for_account(
        &self,
        account_key: &str,
        order: Order,
    ) -> Result<Vec<LedgerEntry>, RequestError> {
        self.scan_index(LEDGER_BY_ACCOUNT, account_key, order, usize::MAX)
    }

    /// Latest-first browse, at most `limit` entries.
    pub fn browse_ledger(
        &self,
        filter: &LedgerFilter,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, RequestError> {
        let mut out = Vec::new();
        if let Some(request_id) = &filter.request_id {
            for entry in self.scan_index(LEDGER_BY_REQUEST, request_id, Order::Descending, usize::MAX)? {
                if out.len() == limit {
                    break;
                }
                if filter.matches(&entry) {
                    out.push(entry);
                }
            }
            return Ok(out);
        }

        for item in self.trees[LEDGER].iter().rev() {
            if out.len() == limit {
                break;
            }
            let (_, bytes) = item?;
            let entry: LedgerEntry = decode(&bytes, "ledger entry")?;
            if filter.matches(&entry) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn scan_index(
        &self,
        tree: usize,
        prefix: &str,
        order: Order,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, RequestError> {
        let scan = self.trees[tree].scan_prefix(index_prefix(prefix));
        let keys: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = match order {
            Order::Ascending => Box::new(scan),
            Order::Descending => Box::new(scan.rev()),
        };

        let mut entries = Vec::new();
        for item in keys.take(limit) {
            let (_, ledger_key) = item?;
            match self.trees[LEDGER].get(&ledger_key)? {
                Some(bytes) => entries.push(decode(&bytes, "ledger entry")?),
                None => return Err(RequestError::Decode("ledger index")),
            }
        }
        Ok(entries)
    }
}

/// Transactional view over every tree.
pub struct Tx<'t> {
    trees: &'t [TransactionalTree],
}

impl Tx<'_> {
    fn get<T>(
        &self,
        tree: usize,
        key: &[u8],
        what: &'static str,
    ) -> ConflictableTransactionResult<Option<T>, RequestError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.trees[tree].get(key)? {
            Some(bytes) => Ok(Some(abort_on(decode(&bytes, what))?)),
            None => Ok(None),
        }
    }

    fn put<T: minicbor::Encode<()>>(
        &self,
        tree: usize,
        key: &[u8],
        value: &T,
        what: &'static str,
    ) -> ConflictableTransactionResult<(), RequestError> {
        let bytes = abort_on(encode(value, what))?;
        self.trees[tree].insert(key, bytes)?;
        Ok(())
    }

    /// Loads the request, aborting with not-found when it does not exist.
    pub fn request(&self, id: &str) -> ConflictableTransactionResult<Request, RequestError> {
        match self.get(REQUESTS, id.as_bytes(), "request")? {
            Some(request) => Ok(request),
            None => Err(ConflictableTransactionError::Abort(RequestError::NotFound(
                id.to_string(),
            ))),
        }
    }

    pub fn put_request(&self, request: &Request) -> ConflictableTransactionResult<(), RequestError> {
        self.put(REQUESTS, request.id.as_bytes(), request, "request")
    }

    pub fn payment(&self, id: &str) -> ConflictableTransactionResult<Payment, RequestError> {
        match self.get(PAYMENTS, id.as_bytes(), "payment")? {
            Some(payment) => Ok(payment),
            None => Err(ConflictableTransactionError::Abort(
                RequestError::EntityNotFound {
                    entity: "payment",
                    id: id.to_string(),
                },
            )),
        }
    }

    pub fn put_payment(&self, payment: &Payment) -> ConflictableTransactionResult<(), RequestError> {
        self.put(PAYMENTS, payment.id.as_bytes(), payment, "payment")
    }

    pub fn put_proof(&self, proof: &ProofUpload) -> ConflictableTransactionResult<(), RequestError> {
        self.put(PROOFS, proof.id.as_bytes(), proof, "proof upload")
    }

    pub fn card(&self, id: &str) -> ConflictableTransactionResult<SavedCard, RequestError> {
        match self.get(CARDS, id.as_bytes(), "saved card")? {
            Some(card) => Ok(card),
            None => Err(ConflictableTransactionError::Abort(
                RequestError::EntityNotFound {
                    entity: "saved card",
                    id: id.to_string(),
                },
            )),
        }
    }

    pub fn put_card(&self, card: &SavedCard) -> ConflictableTransactionResult<(), RequestError> {
        self.put(CARDS, card.id.as_bytes(), card, "saved card")?;
        self.trees[CARDS_BY_HOLDER].insert(
            index_key(&card.cardholder_email, card.id.as_bytes()),
            card.id.as_bytes(),
        )?;
        Ok(())
    }

    /// Appends an entry and its index rows. Existing keys are never overwritten.
    pub fn append_ledger(&self, entry: &LedgerEntry) -> ConflictableTransactionResult<(), RequestError> {
        let key = entry.storage_key();
        if self.trees[LEDGER].get(key)?.is_some() {
            return Err(ConflictableTransactionError::Abort(RequestError::Internal(
                anyhow::anyhow!("ledger key collision for entry {}", entry.id),
            )));
        }
        self.put(LEDGER, &key, entry, "ledger entry")?;
        self.trees[LEDGER_IDS].insert(entry.id.as_bytes(), &key[..])?;
        self.trees[LEDGER_BY_ACCOUNT].insert(index_key(&entry.account_key, &key), &key[..])?;
        if let Some(reference) = &entry.reference {
            self.trees[LEDGER_BY_REQUEST]
                .insert(index_key(reference.request_id(), &key), &key[..])?;
        }
        Ok(())
    }
}

//! Authenticated radix-16 patricia trie over account addresses.
//!
//! Addresses are keyed by their 40-nibble path. Interior branches compress
//! shared prefixes; terminals hold account state. Every node is hashed over
//! its canonical serialization and persisted content-addressed in the
//! backing store, so the root hash commits to the entire account state.
//!
//! Two representations of the same logical address-to-account mapping are
//! impossible: zero accounts are pruned on write, branches with a single
//! child are merged back into their remaining child, and node serialization
//! is canonical. The root is the one exception - it stays a branch even when
//! the tree is empty so an empty tree has a well-defined hash.
//!
//! All mutation flows through a scoped [`AccountsTreeTx`]: writes are
//! buffered, reads fall through to committed state, and `commit` publishes
//! the new nodes plus the root pointer in one atomic batch. Dropping a
//! transaction without committing is an abort.

use crate::core::account::Account;
use crate::storage::kv::{KeyValueStore, StoreError, WriteBatch, keyspace};
use crate::types::address::Address;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink, read_bytes};
use crate::types::hash::Hash;
use aurum_derive::Error;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// Nibbles (hex digits) in an address path.
pub const ADDRESS_NIBBLES: usize = 40;

/// Error opening a tree transaction without waiting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeTxError {
    /// Another transaction is currently open on this tree.
    #[error("a tree transaction is already open")]
    Busy,
}

/// A path of hex nibbles (values 0-15) through the trie.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Nibbles(Vec<u8>);

impl Nibbles {
    /// The empty path (the root branch's prefix).
    pub fn empty() -> Self {
        Nibbles(Vec::new())
    }

    /// Expands an address into its 40-nibble path, high nibble first.
    pub fn from_address(addr: &Address) -> Self {
        let mut nibbles = Vec::with_capacity(ADDRESS_NIBBLES);
        for byte in addr.as_slice() {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0x0F);
        }
        Nibbles(nibbles)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Nibble at `index`.
    pub fn at(&self, index: usize) -> u8 {
        self.0[index]
    }

    /// The sub-path starting at `start`.
    pub fn suffix(&self, start: usize) -> Nibbles {
        Nibbles(self.0[start..].to_vec())
    }

    /// The sub-path covering `[0, end)`.
    pub fn prefix(&self, end: usize) -> Nibbles {
        Nibbles(self.0[..end].to_vec())
    }

    /// Length of the longest common prefix with `other`.
    pub fn common_prefix_len(&self, other: &Nibbles) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Returns true if `prefix` is a prefix of this path.
    pub fn starts_with(&self, prefix: &Nibbles) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0
    }
}

// Canonical serialization: nibble count, then nibbles packed two per byte
// (high nibble first, zero-padded).
impl Encode for Nibbles {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        debug_assert!(self.0.len() <= u8::MAX as usize);
        (self.0.len() as u8).encode(out);
        for pair in self.0.chunks(2) {
            let packed = (pair[0] << 4) | pair.get(1).copied().unwrap_or(0);
            out.write(&[packed]);
        }
    }
}

impl Decode for Nibbles {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = u8::decode(input)? as usize;
        let bytes = read_bytes(input, count.div_ceil(2))?;

        let mut nibbles = Vec::with_capacity(count);
        for i in 0..count {
            let byte = bytes[i / 2];
            nibbles.push(if i % 2 == 0 { byte >> 4 } else { byte & 0x0F });
        }

        // Reject a nonzero pad so the encoding stays canonical.
        if count % 2 == 1 && bytes[count / 2] & 0x0F != 0 {
            return Err(DecodeError::InvalidValue);
        }

        Ok(Nibbles(nibbles))
    }
}

/// Reference from a branch to one of its children.
///
/// The suffix is the child's path relative to the branch; its first nibble
/// is the child's slot index.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ChildRef {
    suffix: Nibbles,
    hash: Hash,
}

/// A trie node: either an interior branch or a terminal account entry.
#[derive(Clone, Debug, PartialEq, Eq)]
enum TreeNode {
    /// Terminal node holding one account under its full 40-nibble prefix.
    Terminal { prefix: Nibbles, account: Account },
    /// Interior branch with up to 16 children keyed by the next nibble.
    Branch {
        prefix: Nibbles,
        children: Box<[Option<ChildRef>; 16]>,
    },
}

const TERMINAL_TAG: u8 = 0;
const BRANCH_TAG: u8 = 1;

impl TreeNode {
    fn empty_root() -> TreeNode {
        TreeNode::Branch {
            prefix: Nibbles::empty(),
            children: Box::new(std::array::from_fn(|_| None)),
        }
    }

    fn prefix(&self) -> &Nibbles {
        match self {
            TreeNode::Terminal { prefix, .. } => prefix,
            TreeNode::Branch { prefix, .. } => prefix,
        }
    }

    /// Hash of the canonical serialization; the node's storage address.
    fn hash(&self) -> Hash {
        let mut h = Hash::sha3();
        self.encode(&mut h);
        h.finalize()
    }
}

impl Encode for TreeNode {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        match self {
            TreeNode::Terminal { prefix, account } => {
                TERMINAL_TAG.encode(out);
                prefix.encode(out);
                account.encode(out);
            }
            TreeNode::Branch { prefix, children } => {
                BRANCH_TAG.encode(out);
                prefix.encode(out);

                let count = children.iter().flatten().count() as u8;
                count.encode(out);
                for (slot, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        (slot as u8).encode(out);
                        child.suffix.encode(out);
                        child.hash.encode(out);
                    }
                }
            }
        }
    }
}

impl Decode for TreeNode {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let tag = u8::decode(input)?;
        match tag {
            TERMINAL_TAG => Ok(TreeNode::Terminal {
                prefix: Nibbles::decode(input)?,
                account: Account::decode(input)?,
            }),
            BRANCH_TAG => {
                let prefix = Nibbles::decode(input)?;
                let count = u8::decode(input)?;
                let mut children: Box<[Option<ChildRef>; 16]> =
                    Box::new(std::array::from_fn(|_| None));

                for _ in 0..count {
                    let slot = u8::decode(input)? as usize;
                    if slot >= 16 {
                        return Err(DecodeError::InvalidValue);
                    }
                    let suffix = Nibbles::decode(input)?;
                    let hash = Hash::decode(input)?;
                    if children[slot].is_some() {
                        return Err(DecodeError::InvalidValue);
                    }
                    children[slot] = Some(ChildRef { suffix, hash });
                }

                Ok(TreeNode::Branch { prefix, children })
            }
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

fn node_key(hash: &Hash) -> Vec<u8> {
    keyspace::key(keyspace::ACCOUNTS_TREE, hash.as_slice())
}

/// The authenticated account state tree.
///
/// Reads run against committed state at any time; writes are serialized
/// through one open transaction.
pub struct AccountsTree {
    store: Arc<dyn KeyValueStore>,
    root: Mutex<Hash>,
    write_lock: Mutex<()>,
}

impl AccountsTree {
    /// Opens the tree over the given store, creating the empty root if the
    /// store has none.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let root = match store.get(keyspace::ACCOUNTS_ROOT)? {
            Some(bytes) => Hash::from_bytes(&bytes)?,
            None => {
                let root_node = TreeNode::empty_root();
                let root_hash = root_node.hash();

                let mut batch = WriteBatch::new();
                batch.put(node_key(&root_hash), root_node.to_bytes());
                batch.put(keyspace::ACCOUNTS_ROOT.to_vec(), root_hash.to_bytes());
                store.write(batch)?;

                root_hash
            }
        };

        Ok(Self {
            store,
            root: Mutex::new(root),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the current root hash; O(1).
    pub fn root_hash(&self) -> Hash {
        *self.root.lock().unwrap()
    }

    /// Looks up an account; absent addresses yield the zero account.
    pub fn get(&self, addr: &Address) -> Result<Account, StoreError> {
        let root = self.root_hash();
        let key = Nibbles::from_address(addr);

        let mut node = self.load_committed(&root)?.ok_or_else(|| {
            StoreError::Corrupted(format!("missing accounts tree root node {root}"))
        })?;

        loop {
            match node {
                TreeNode::Terminal { prefix, account } => {
                    return Ok(if prefix == key { account } else { Account::ZERO });
                }
                TreeNode::Branch { prefix, children } => {
                    if !key.starts_with(&prefix) || prefix.len() >= key.len() {
                        return Ok(Account::ZERO);
                    }
                    let slot = key.at(prefix.len()) as usize;
                    let Some(child) = &children[slot] else {
                        return Ok(Account::ZERO);
                    };
                    node = self.load_committed(&child.hash)?.ok_or_else(|| {
                        StoreError::Corrupted(format!("missing tree node {}", child.hash))
                    })?;
                }
            }
        }
    }

    /// Inserts or replaces an account in its own transaction.
    ///
    /// Writing the zero account deletes the entry. Blocks while another
    /// transaction is open.
    pub fn put(&self, addr: &Address, account: Account) -> Result<(), StoreError> {
        let mut tx = self.transaction();
        tx.put(addr, account)?;
        tx.commit()
    }

    /// Opens a write transaction, waiting for any open one to close.
    pub fn transaction(&self) -> AccountsTreeTx<'_> {
        let guard = self.write_lock.lock().unwrap();
        self.transaction_with_guard(guard)
    }

    /// Opens a write transaction, failing with [`TreeTxError::Busy`] if one
    /// is already open.
    pub fn try_transaction(&self) -> Result<AccountsTreeTx<'_>, TreeTxError> {
        match self.write_lock.try_lock() {
            Ok(guard) => Ok(self.transaction_with_guard(guard)),
            Err(TryLockError::WouldBlock) => Err(TreeTxError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => {
                Ok(self.transaction_with_guard(poisoned.into_inner()))
            }
        }
    }

    fn transaction_with_guard<'a>(&'a self, guard: MutexGuard<'a, ()>) -> AccountsTreeTx<'a> {
        AccountsTreeTx {
            tree: self,
            _guard: guard,
            writes: BTreeMap::new(),
            root: self.root_hash(),
        }
    }

    fn load_committed(&self, hash: &Hash) -> Result<Option<TreeNode>, StoreError> {
        match self.store.get(&node_key(hash))? {
            Some(bytes) => Ok(Some(TreeNode::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// A scoped write overlay over an [`AccountsTree`].
///
/// Holds the tree's single-writer lock for its lifetime. All node writes are
/// buffered; `commit` publishes them and the new root pointer in one atomic
/// batch, and anything else (including drop) discards them.
pub struct AccountsTreeTx<'a> {
    tree: &'a AccountsTree,
    _guard: MutexGuard<'a, ()>,
    /// Buffered node writes in raw key space; `None` marks deletion.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    root: Hash,
}

impl<'a> AccountsTreeTx<'a> {
    /// The root hash as of the transaction's buffered state.
    pub fn root_hash(&self) -> Hash {
        self.root
    }

    /// Looks up an account through the overlay.
    pub fn get(&self, addr: &Address) -> Result<Account, StoreError> {
        let key = Nibbles::from_address(addr);
        let mut node = self.load(&self.root)?.ok_or_else(|| {
            StoreError::Corrupted(format!("missing accounts tree root node {}", self.root))
        })?;

        loop {
            match node {
                TreeNode::Terminal { prefix, account } => {
                    return Ok(if prefix == key { account } else { Account::ZERO });
                }
                TreeNode::Branch { prefix, children } => {
                    if !key.starts_with(&prefix) || prefix.len() >= key.len() {
                        return Ok(Account::ZERO);
                    }
                    let slot = key.at(prefix.len()) as usize;
                    let Some(child) = &children[slot] else {
                        return Ok(Account::ZERO);
                    };
                    node = self.load(&child.hash)?.ok_or_else(|| {
                        StoreError::Corrupted(format!("missing tree node {}", child.hash))
                    })?;
                }
            }
        }
    }

    /// Inserts or replaces an account; the zero account deletes.
    pub fn put(&mut self, addr: &Address, account: Account) -> Result<(), StoreError> {
        let key = Nibbles::from_address(addr);
        let root = self.root;
        let root_node = self.load(&root)?.ok_or_else(|| {
            StoreError::Corrupted(format!("missing accounts tree root node {root}"))
        })?;

        match self.update_node(root_node, root, &key, account, true)? {
            Some((hash, _)) => {
                self.root = hash;
                Ok(())
            }
            // The root branch survives every update.
            None => Err(StoreError::Corrupted(
                "accounts tree root vanished during update".into(),
            )),
        }
    }

    /// Publishes all buffered writes and the new root atomically.
    pub fn commit(self) -> Result<(), StoreError> {
        self.commit_with(WriteBatch::new())
    }

    /// Publishes all buffered writes, the new root, and the caller's extra
    /// writes in one atomic batch.
    ///
    /// This is how a chain transition bundles tree mutations with chain-data
    /// updates so both land or neither does.
    pub fn commit_with(self, extra: WriteBatch) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for (key, value) in &self.writes {
            match value {
                Some(value) => batch.put(key.clone(), value.clone()),
                None => batch.delete(key.clone()),
            }
        }
        batch.put(keyspace::ACCOUNTS_ROOT.to_vec(), self.root.to_bytes());
        batch.extend(extra);

        self.tree.store.write(batch)?;
        *self.tree.root.lock().unwrap() = self.root;
        Ok(())
    }

    /// Discards all buffered writes. Equivalent to dropping the transaction.
    pub fn abort(self) {}

    fn load(&self, hash: &Hash) -> Result<Option<TreeNode>, StoreError> {
        if let Some(entry) = self.writes.get(&node_key(hash)) {
            return match entry {
                Some(bytes) => Ok(Some(TreeNode::from_bytes(bytes)?)),
                None => Ok(None),
            };
        }
        self.tree.load_committed(hash)
    }

    fn store_node(&mut self, node: &TreeNode) -> Hash {
        let hash = node.hash();
        self.writes.insert(node_key(&hash), Some(node.to_bytes()));
        hash
    }

    fn remove_node(&mut self, hash: &Hash) {
        self.writes.insert(node_key(hash), None);
    }

    /// Applies the update to `node` and returns its replacement as
    /// `(hash, full prefix)`, or `None` if the node disappears.
    fn update_node(
        &mut self,
        node: TreeNode,
        node_hash: Hash,
        key: &Nibbles,
        account: Account,
        is_root: bool,
    ) -> Result<Option<(Hash, Nibbles)>, StoreError> {
        let prefix = node.prefix().clone();

        // Divergence: the key leaves this node's prefix. The node itself is
        // untouched; a new branch takes over at the fork point.
        if !key.starts_with(&prefix) {
            if account.is_zero() {
                return Ok(Some((node_hash, prefix)));
            }
            return self.split_at_divergence(node_hash, prefix, key, account).map(Some);
        }

        match node {
            TreeNode::Terminal {
                prefix: terminal_prefix,
                ..
            } => {
                // starts_with on equal-length paths means exact match.
                self.remove_node(&node_hash);
                if account.is_zero() {
                    return Ok(None);
                }
                let replacement = TreeNode::Terminal {
                    prefix: terminal_prefix.clone(),
                    account,
                };
                Ok(Some((self.store_node(&replacement), terminal_prefix)))
            }
            TreeNode::Branch { prefix, mut children } => {
                let slot = key.at(prefix.len()) as usize;

                match children[slot].take() {
                    None => {
                        if account.is_zero() {
                            // Nothing to delete; restore the untouched child
                            // array and keep the node as-is.
                            return Ok(Some((node_hash, prefix)));
                        }
                        let terminal = TreeNode::Terminal {
                            prefix: key.clone(),
                            account,
                        };
                        let hash = self.store_node(&terminal);
                        children[slot] = Some(ChildRef {
                            suffix: key.suffix(prefix.len()),
                            hash,
                        });
                    }
                    Some(child) => {
                        let child_node = self.load(&child.hash)?.ok_or_else(|| {
                            StoreError::Corrupted(format!("missing tree node {}", child.hash))
                        })?;
                        match self.update_node(child_node, child.hash, key, account, false)? {
                            Some((hash, child_prefix)) => {
                                children[slot] = Some(ChildRef {
                                    suffix: child_prefix.suffix(prefix.len()),
                                    hash,
                                });
                            }
                            None => {}
                        }
                    }
                }

                self.remove_node(&node_hash);

                let count = children.iter().flatten().count();
                if !is_root {
                    if count == 0 {
                        return Ok(None);
                    }
                    if count == 1 {
                        // A single-child branch is non-canonical: merge it
                        // away by handing the child to our parent.
                        let child = children.iter_mut().find_map(Option::take).unwrap();
                        let mut full = prefix.clone();
                        full.0.extend_from_slice(&child.suffix.0);
                        return Ok(Some((child.hash, full)));
                    }
                }

                let replacement = TreeNode::Branch { prefix: prefix.clone(), children };
                Ok(Some((self.store_node(&replacement), prefix)))
            }
        }
    }

    /// Creates the fork branch holding the existing node and a new terminal
    /// for `key`, at their longest common prefix.
    fn split_at_divergence(
        &mut self,
        node_hash: Hash,
        node_prefix: Nibbles,
        key: &Nibbles,
        account: Account,
    ) -> Result<(Hash, Nibbles), StoreError> {
        let common = node_prefix.common_prefix_len(key);
        let branch_prefix = key.prefix(common);

        let terminal = TreeNode::Terminal {
            prefix: key.clone(),
            account,
        };
        let terminal_hash = self.store_node(&terminal);

        let mut children: Box<[Option<ChildRef>; 16]> = Box::new(std::array::from_fn(|_| None));
        children[node_prefix.at(common) as usize] = Some(ChildRef {
            suffix: node_prefix.suffix(common),
            hash: node_hash,
        });
        children[key.at(common) as usize] = Some(ChildRef {
            suffix: key.suffix(common),
            hash: terminal_hash,
        });

        let branch = TreeNode::Branch {
            prefix: branch_prefix.clone(),
            children,
        };
        Ok((self.store_node(&branch), branch_prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;

    fn tree() -> AccountsTree {
        AccountsTree::new(Arc::new(MemoryStore::new())).expect("tree")
    }

    fn addr(seed: u8) -> Address {
        Address([seed; 20])
    }

    /// Two addresses sharing their first byte, so their paths share two
    /// nibbles before diverging.
    fn colliding_addrs() -> (Address, Address) {
        let mut a = [0u8; 20];
        let mut b = [0u8; 20];
        a[0] = 0xAB;
        b[0] = 0xAB;
        a[1] = 0x01;
        b[1] = 0x02;
        (Address(a), Address(b))
    }

    #[test]
    fn nibbles_from_address_expands_bytes() {
        let nibbles = Nibbles::from_address(&Address([0xAB; 20]));
        assert_eq!(nibbles.len(), ADDRESS_NIBBLES);
        assert_eq!(nibbles.at(0), 0xA);
        assert_eq!(nibbles.at(1), 0xB);
    }

    #[test]
    fn nibbles_roundtrip_odd_and_even_lengths() {
        for len in [0usize, 1, 2, 5, 40] {
            let nibbles = Nibbles((0..len as u8).map(|i| i % 16).collect());
            let decoded = Nibbles::from_bytes(&nibbles.to_bytes()).expect("decode");
            assert_eq!(nibbles, decoded);
        }
    }

    #[test]
    fn nibbles_decode_rejects_nonzero_pad() {
        let mut bytes = Nibbles(vec![1]).to_bytes();
        bytes[1] |= 0x0F;
        assert!(Nibbles::from_bytes(&bytes).is_err());
    }

    #[test]
    fn empty_tree_has_stable_hash() {
        let tree1 = tree();
        let tree2 = tree();
        assert_eq!(tree1.root_hash(), tree2.root_hash());
    }

    #[test]
    fn get_missing_address_returns_zero_account() {
        let tree = tree();
        assert_eq!(tree.get(&addr(1)).unwrap(), Account::ZERO);
    }

    #[test]
    fn put_then_get_roundtrip() {
        let tree = tree();
        let account = Account {
            balance: 1000,
            nonce: 2,
        };

        tree.put(&addr(1), account).unwrap();
        assert_eq!(tree.get(&addr(1)).unwrap(), account);
    }

    #[test]
    fn put_changes_root_hash() {
        let tree = tree();
        let empty_root = tree.root_hash();

        tree.put(&addr(1), Account::with_balance(5)).unwrap();
        assert_ne!(tree.root_hash(), empty_root);
    }

    #[test]
    fn insert_then_delete_restores_empty_hash() {
        // Scenario: hash an empty tree, insert one account, delete it, and
        // the hash must return to its original value.
        let tree = tree();
        let empty_root = tree.root_hash();

        let mut address = [0u8; 20];
        address[19] = 1;
        tree.put(&Address(address), Account::with_balance(100))
            .unwrap();
        assert_ne!(tree.root_hash(), empty_root);

        tree.put(&Address(address), Account::ZERO).unwrap();
        assert_eq!(tree.root_hash(), empty_root);
    }

    #[test]
    fn zero_account_write_is_a_noop_on_absent_key() {
        let tree = tree();
        let root = tree.root_hash();

        tree.put(&addr(7), Account::ZERO).unwrap();
        assert_eq!(tree.root_hash(), root);
    }

    #[test]
    fn colliding_prefixes_split_and_resolve() {
        let tree = tree();
        let (a, b) = colliding_addrs();

        tree.put(&a, Account::with_balance(1)).unwrap();
        tree.put(&b, Account::with_balance(2)).unwrap();

        assert_eq!(tree.get(&a).unwrap().balance, 1);
        assert_eq!(tree.get(&b).unwrap().balance, 2);
    }

    #[test]
    fn deleting_one_of_two_colliding_entries_merges_branch() {
        let tree = tree();
        let (a, b) = colliding_addrs();

        tree.put(&a, Account::with_balance(1)).unwrap();
        let root_with_a_only = tree.root_hash();

        tree.put(&b, Account::with_balance(2)).unwrap();
        tree.put(&b, Account::ZERO).unwrap();

        // Removing b must merge the split branch away, restoring the exact
        // prior representation.
        assert_eq!(tree.root_hash(), root_with_a_only);
        assert_eq!(tree.get(&a).unwrap().balance, 1);
        assert_eq!(tree.get(&b).unwrap(), Account::ZERO);
    }

    #[test]
    fn root_hash_is_order_independent() {
        // Canonicity: any insertion order of the same entries produces the
        // same commitment.
        let entries: Vec<(Address, Account)> = (1..=6)
            .map(|i| (addr(i), Account::with_balance(i as u64 * 100)))
            .collect();

        let orderings: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3, 4, 5],
            vec![5, 4, 3, 2, 1, 0],
            vec![2, 0, 5, 1, 4, 3],
            vec![3, 5, 0, 4, 2, 1],
        ];

        let mut roots = Vec::new();
        for order in orderings {
            let tree = tree();
            for index in order {
                let (address, account) = &entries[index];
                tree.put(address, *account).unwrap();
            }
            roots.push(tree.root_hash());
        }

        assert!(roots.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn overwrite_updates_value_deterministically() {
        let tree1 = tree();
        tree1.put(&addr(1), Account::with_balance(10)).unwrap();
        tree1.put(&addr(1), Account::with_balance(20)).unwrap();

        let tree2 = tree();
        tree2.put(&addr(1), Account::with_balance(20)).unwrap();

        assert_eq!(tree1.root_hash(), tree2.root_hash());
        assert_eq!(tree1.get(&addr(1)).unwrap().balance, 20);
    }

    #[test]
    fn transaction_buffers_until_commit() {
        let tree = tree();
        let committed_root = tree.root_hash();

        let mut tx = tree.transaction();
        tx.put(&addr(1), Account::with_balance(7)).unwrap();

        // Reads through the tree still see committed state.
        assert_eq!(tree.root_hash(), committed_root);
        assert_ne!(tx.root_hash(), committed_root);
        assert_eq!(tx.get(&addr(1)).unwrap().balance, 7);

        let tx_root = tx.root_hash();
        tx.commit().unwrap();

        assert_eq!(tree.root_hash(), tx_root);
        assert_eq!(tree.get(&addr(1)).unwrap().balance, 7);
    }

    #[test]
    fn abort_discards_all_writes() {
        let tree = tree();
        tree.put(&addr(1), Account::with_balance(1)).unwrap();
        let committed_root = tree.root_hash();

        let mut tx = tree.transaction();
        tx.put(&addr(2), Account::with_balance(2)).unwrap();
        tx.put(&addr(1), Account::ZERO).unwrap();
        tx.abort();

        assert_eq!(tree.root_hash(), committed_root);
        assert_eq!(tree.get(&addr(1)).unwrap().balance, 1);
        assert_eq!(tree.get(&addr(2)).unwrap(), Account::ZERO);
    }

    #[test]
    fn dropped_transaction_behaves_as_abort() {
        let tree = tree();
        let committed_root = tree.root_hash();

        {
            let mut tx = tree.transaction();
            tx.put(&addr(3), Account::with_balance(3)).unwrap();
        }

        assert_eq!(tree.root_hash(), committed_root);
    }

    #[test]
    fn try_transaction_fails_while_one_is_open() {
        let tree = tree();

        let tx = tree.transaction();
        assert_eq!(tree.try_transaction().err(), Some(TreeTxError::Busy));
        drop(tx);

        assert!(tree.try_transaction().is_ok());
    }

    #[test]
    fn state_survives_reopen_from_same_store() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());

        let tree = AccountsTree::new(Arc::clone(&store) as Arc<dyn KeyValueStore>).unwrap();
        tree.put(&addr(1), Account::with_balance(11)).unwrap();
        let root = tree.root_hash();
        drop(tree);

        let reopened = AccountsTree::new(store as Arc<dyn KeyValueStore>).unwrap();
        assert_eq!(reopened.root_hash(), root);
        assert_eq!(reopened.get(&addr(1)).unwrap().balance, 11);
    }

    #[test]
    fn many_entries_roundtrip() {
        let tree = tree();
        for i in 1..=60u8 {
            tree.put(&addr(i), Account::with_balance(i as u64)).unwrap();
        }
        for i in 1..=60u8 {
            assert_eq!(tree.get(&addr(i)).unwrap().balance, i as u64);
        }
    }

    #[test]
    fn delete_all_entries_returns_to_empty_hash() {
        let tree = tree();
        let empty_root = tree.root_hash();

        let addrs: Vec<Address> = (1..=12u8).map(addr).collect();
        for (i, address) in addrs.iter().enumerate() {
            tree.put(address, Account::with_balance(i as u64 + 1)).unwrap();
        }
        for address in &addrs {
            tree.put(address, Account::ZERO).unwrap();
        }

        assert_eq!(tree.root_hash(), empty_root);
    }
}

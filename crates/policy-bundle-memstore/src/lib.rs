//! An in-memory reference implementation of `policy_bundle::store::{Store,
//! Transaction}` plus a pass-through `Compiler`, so the activation machinery
//! in `policy-bundle` is exercised by real reads/writes instead of staying
//! an abstract trait nobody calls.
//!
//! A transaction is opened, mutated, and then either committed or
//! aborted — expressed here as snapshot isolation (each transaction works
//! against its own clone of the tree) rather than SQL `BEGIN`/`COMMIT`,
//! since the store is a plain in-process map, not a database connection.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Mutex;

use policy_bundle::store::{
    CompileResult, Compiler, Store, StoreError, StoreResult, Transaction, TransactionParams,
    WriteOp,
};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
struct Tree {
    data: Value,
    policies: BTreeMap<String, Vec<u8>>,
}

impl Tree {
    fn new() -> Self {
        Self {
            data: Value::Object(Map::new()),
            policies: BTreeMap::new(),
        }
    }
}

/// The in-memory store: one tree, guarded by a mutex. No internal locking
/// is exposed to callers beyond transaction commit/abort — concurrency
/// comes from the caller serializing its own transactions.
pub struct MemStore {
    inner: Mutex<Tree>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tree::new()),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A transaction's working copy: cloned from the store at `new_transaction`
/// time, mutated in place, and swapped in for the store's tree on commit.
struct MemTransaction {
    tree: Tree,
}

impl Transaction for MemTransaction {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

fn downcast(txn: &dyn Transaction) -> StoreResult<&MemTransaction> {
    txn.as_any()
        .downcast_ref::<MemTransaction>()
        .ok_or_else(|| StoreError::Other {
            operation: "downcast".to_string(),
            message: "transaction was not opened by MemStore".to_string(),
        })
}

fn downcast_mut(txn: &mut dyn Transaction) -> StoreResult<&mut MemTransaction> {
    txn.as_any_mut()
        .downcast_mut::<MemTransaction>()
        .ok_or_else(|| StoreError::Other {
            operation: "downcast".to_string(),
            message: "transaction was not opened by MemStore".to_string(),
        })
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn navigate<'a>(root: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.get(seg)?;
    }
    Some(node)
}

/// Ensure every object along `segs` exists, returning the last segment's
/// parent object so the caller can insert/replace/remove the final key.
fn ensure_parent<'a>(root: &'a mut Value, segs: &[&str]) -> &'a mut Map<String, Value> {
    let mut node = root;
    for seg in segs {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let map = node.as_object_mut().unwrap();
        node = map.entry(seg.to_string()).or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    node.as_object_mut().unwrap()
}

impl Store for MemStore {
    fn new_transaction(&self, _params: TransactionParams) -> StoreResult<Box<dyn Transaction>> {
        let tree = self.inner.lock().unwrap().clone();
        Ok(Box::new(MemTransaction { tree }))
    }

    fn commit(&self, txn: Box<dyn Transaction>) -> StoreResult<()> {
        let txn = txn
            .into_any()
            .downcast::<MemTransaction>()
            .unwrap_or_else(|_| panic!("transaction was not opened by MemStore"));
        *self.inner.lock().unwrap() = txn.tree;
        Ok(())
    }

    fn abort(&self, _txn: Box<dyn Transaction>) {
        // Dropping the working copy is enough: nothing was applied to the
        // shared tree, so there is nothing to roll back (P5).
    }

    fn read(&self, txn: &dyn Transaction, path: &str) -> StoreResult<Value> {
        let txn = downcast(txn)?;
        if path == "/" || path.is_empty() {
            return Ok(txn.tree.data.clone());
        }
        navigate(&txn.tree.data, &segments(path))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: path.to_string(),
            })
    }

    fn write(
        &self,
        txn: &mut dyn Transaction,
        op: WriteOp,
        path: &str,
        value: Value,
    ) -> StoreResult<()> {
        let txn = downcast_mut(txn)?;
        let segs = segments(path);
        let Some((last, parent_segs)) = segs.split_last() else {
            match op {
                WriteOp::Remove => txn.tree.data = Value::Object(Map::new()),
                _ => txn.tree.data = value,
            }
            return Ok(());
        };
        let parent = ensure_parent(&mut txn.tree.data, parent_segs);
        match op {
            WriteOp::Add | WriteOp::Replace => {
                parent.insert((*last).to_string(), value);
            }
            WriteOp::Remove => {
                if parent.remove(*last).is_none() {
                    return Err(StoreError::NotFound {
                        path: path.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn make_dir(&self, txn: &mut dyn Transaction, path: &str) -> StoreResult<()> {
        let txn = downcast_mut(txn)?;
        let segs = segments(path);
        ensure_parent(&mut txn.tree.data, &segs);
        Ok(())
    }

    fn list_policies(&self, txn: &dyn Transaction) -> StoreResult<Vec<String>> {
        let txn = downcast(txn)?;
        Ok(txn.tree.policies.keys().cloned().collect())
    }

    fn upsert_policy(&self, txn: &mut dyn Transaction, name: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let txn = downcast_mut(txn)?;
        txn.tree.policies.insert(name.to_string(), bytes);
        Ok(())
    }

    fn delete_policy(&self, txn: &mut dyn Transaction, name: &str) -> StoreResult<()> {
        let txn = downcast_mut(txn)?;
        txn.tree
            .policies
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                path: name.to_string(),
            })
    }

    fn get_policy(&self, txn: &dyn Transaction, name: &str) -> StoreResult<Vec<u8>> {
        let txn = downcast(txn)?;
        txn.tree
            .policies
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                path: name.to_string(),
            })
    }
}

/// A `Compiler` that accepts every module unconditionally — there is no
/// policy language parser in this reference store, only byte storage.
/// Real deployments plug in the host's actual compiler here.
pub struct PassThroughCompiler;

impl Compiler for PassThroughCompiler {
    fn compile(&self, modules: &BTreeMap<String, Vec<u8>>) -> CompileResult {
        CompileResult {
            compiled_modules: modules.keys().cloned().collect(),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_visible_after_commit_not_before() {
        let store = MemStore::new();
        let mut txn = store.new_transaction(TransactionParams { write: true }).unwrap();
        store
            .write(
                txn.as_mut(),
                WriteOp::Replace,
                "/a/b",
                serde_json::json!(1),
            )
            .unwrap();

        // A fresh transaction opened before commit doesn't see the write.
        let other = store.new_transaction(TransactionParams::default()).unwrap();
        assert!(store.read(other.as_ref(), "/a/b").is_err());

        store.commit(txn).unwrap();

        let after = store.new_transaction(TransactionParams::default()).unwrap();
        assert_eq!(store.read(after.as_ref(), "/a/b").unwrap(), serde_json::json!(1));
    }

    #[test]
    fn p5_abort_leaves_store_unmodified() {
        let store = MemStore::new();
        let mut txn = store.new_transaction(TransactionParams { write: true }).unwrap();
        store
            .write(txn.as_mut(), WriteOp::Replace, "/a", serde_json::json!(1))
            .unwrap();
        store.abort(txn);

        let check = store.new_transaction(TransactionParams::default()).unwrap();
        assert!(store.read(check.as_ref(), "/a").is_err());
    }

    #[test]
    fn policies_round_trip() {
        let store = MemStore::new();
        let mut txn = store.new_transaction(TransactionParams { write: true }).unwrap();
        store
            .upsert_policy(txn.as_mut(), "a/policy.rego", b"package a".to_vec())
            .unwrap();
        store.commit(txn).unwrap();

        let txn = store.new_transaction(TransactionParams::default()).unwrap();
        assert_eq!(store.list_policies(txn.as_ref()).unwrap(), vec!["a/policy.rego".to_string()]);
        assert_eq!(
            store.get_policy(txn.as_ref(), "a/policy.rego").unwrap(),
            b"package a".to_vec()
        );
    }
}

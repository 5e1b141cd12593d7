//! The `Store`, `Transaction`, and `Compiler` contracts: the external
//! collaborators the core calls into. Deliberately synchronous — the core
//! holds no internal locking and requires no async runtime, unlike an
//! `#[async_trait]` store that talks to S3-compatible object storage; that
//! fits a different use case but not this core's transactional, in-process
//! contract (see DESIGN.md for the dependency-drop rationale).

use thiserror::Error;

/// A store operation failed. Propagated with enough context to be
/// actionable.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("store operation '{operation}' failed: {message}")]
    Other { operation: String, message: String },
}

impl StoreError {
    /// `IsNotFound(err) → bool`, expressed as a method on the crate's own
    /// error type rather than a classifier callback threaded through the
    /// API.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The kind of mutation `Store::write` performs at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Add,
    Remove,
    Replace,
}

/// Parameters for opening a new transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionParams {
    pub write: bool,
}

/// A transactional key/value store shared by multiple named bundles.
/// Every method takes an explicit `&mut dyn Transaction` so
/// the store never performs a non-transactional side effect on the
/// activator's behalf.
pub trait Store {
    /// Open a new transaction.
    fn new_transaction(&self, params: TransactionParams) -> StoreResult<Box<dyn Transaction>>;

    /// Commit a transaction, making its writes visible.
    fn commit(&self, txn: Box<dyn Transaction>) -> StoreResult<()>;

    /// Abort a transaction, discarding its writes.
    fn abort(&self, txn: Box<dyn Transaction>);

    /// Read a subtree at `path`.
    fn read(&self, txn: &dyn Transaction, path: &str) -> StoreResult<serde_json::Value>;

    /// Mutate a subtree at `path`.
    fn write(
        &self,
        txn: &mut dyn Transaction,
        op: WriteOp,
        path: &str,
        value: serde_json::Value,
    ) -> StoreResult<()>;

    /// Ensure `path` exists as an object.
    fn make_dir(&self, txn: &mut dyn Transaction, path: &str) -> StoreResult<()>;

    /// List the names of policy modules stored in the policy byte layer.
    fn list_policies(&self, txn: &dyn Transaction) -> StoreResult<Vec<String>>;

    /// Upsert a policy module's raw bytes.
    fn upsert_policy(&self, txn: &mut dyn Transaction, name: &str, bytes: Vec<u8>) -> StoreResult<()>;

    /// Delete a policy module.
    fn delete_policy(&self, txn: &mut dyn Transaction, name: &str) -> StoreResult<()>;

    /// Read back a previously upserted policy module's bytes.
    fn get_policy(&self, txn: &dyn Transaction, name: &str) -> StoreResult<Vec<u8>>;
}

/// An open transaction. Opaque to callers beyond the operations `Store`
/// exposes against it; concrete stores are free to downcast their own
/// transaction type.
pub trait Transaction: std::any::Any {
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
    /// Consume the box for concrete stores that need ownership on commit
    /// (e.g. to swap a working copy into place without cloning it again).
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

/// The result of compiling a set of modules: compiled module names and any
/// errors the compiler rejected the set with.
#[derive(Debug, Clone, Default)]
pub struct CompileResult {
    pub compiled_modules: Vec<String>,
    pub errors: Vec<String>,
}

/// Accepts a mapping from module name to raw bytes and compiles them
/// together. Optionally configured with a path-conflict check
/// against the store and a default language version — those configuration
/// concerns live on the concrete compiler, not this trait.
pub trait Compiler {
    fn compile(&self, modules: &std::collections::BTreeMap<String, Vec<u8>>) -> CompileResult;
}

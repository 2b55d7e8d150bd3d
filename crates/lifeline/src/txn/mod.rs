//! Transaction and rollback engine
//!
//! A transaction owns an ordered stack of [`UndoAction`]s. Actions are
//! undone in strict reverse registration order; the engine never reorders
//! them.

mod action;
mod engine;
pub mod journal;
pub mod log;
pub mod signals;

pub use action::{ServiceState, UndoAction, UndoContext};
pub use engine::{
    ActionOutcome, Engine, RollbackReport, Transaction, TransactionStatus, ABNORMAL_EXIT,
    RECOVERED_AFTER_CRASH,
};
pub use journal::PendingTransaction;

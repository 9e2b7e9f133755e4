pub mod ledger;
pub mod recovery;
pub mod scheduler;

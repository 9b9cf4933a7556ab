//! Container scheduling: placement on the master, convergence on the
//! workers.

mod master;
mod worker;

pub use master::run_master;
pub use worker::run_worker;

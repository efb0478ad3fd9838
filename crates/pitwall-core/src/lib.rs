pub mod check;
pub mod engine;
pub mod error;
pub mod fence;
pub mod followup;
pub mod graph;
pub mod health;
pub mod io;
pub mod lanes;
pub mod ledger;
pub mod paths;
pub mod policy;
pub mod router;
pub mod safety;
pub mod updates;

pub use error::{PitwallError, Result};

//! CLI commands

mod audit;
mod check;
mod context;
mod reinstate;
mod run;
mod status;
mod style;

pub use audit::run_audit;
pub use check::run_check;
pub use reinstate::run_reinstate;
pub use run::run_engine;
pub use status::run_status;

pub mod balances;
pub mod host;
pub mod import;
pub mod setup;
pub mod ui;

pub mod clock;
pub mod cmd;
pub mod config;
pub mod features;
pub mod hash;
pub mod lock;
pub mod logging;
pub mod naming;
pub mod reconcile;
pub mod render;
pub mod rule;
pub mod ruleset;
pub mod snapshot;
pub mod table;

pub mod config;
pub mod domain;
pub mod focus;
pub mod rules;
pub mod sync;
pub mod usage;

pub mod bootstrap;
pub mod commands;
pub mod conflict_resolution;
pub mod date_proposer;
pub mod reorder;

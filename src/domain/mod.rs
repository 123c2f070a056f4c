pub mod conflict;
pub mod models;
pub mod order_merge;
pub mod sort_key;

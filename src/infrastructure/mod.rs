pub mod config;
pub mod error;
pub mod storage;
pub mod task_repository;
pub mod workday_repository;

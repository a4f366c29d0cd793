pub mod access;
pub mod catalog;
pub mod concurrency;
pub mod database;
pub mod error;
pub mod log;
pub mod storage;
pub mod transaction;

pub mod api;
pub mod config;
pub mod engine;
pub mod humanize;
pub mod identity;
pub mod jobs;
pub mod ledger;
pub mod observability;
pub mod persist;
pub mod remote;
pub mod sync;

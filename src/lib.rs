pub mod app;
pub mod collector;
pub mod config;
pub mod credential;
pub mod domain;
pub mod ena;
pub mod error;
pub mod fs_util;
pub mod ledger;
pub mod lock;
pub mod manifest;
pub mod metadata;
pub mod output;
pub mod prompt;
pub mod runner;
pub mod webin;
pub mod webin_output;
pub mod workspace;

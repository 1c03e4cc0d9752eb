pub mod app;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod index;
pub mod layout;
pub mod manifest;
pub mod merge;
pub mod output;
pub mod query;
pub mod status;
pub mod store;
pub mod summary;
pub mod unpack;

#[macro_use]
extern crate log;

pub mod cli;
pub mod config;
pub mod git;
pub mod inmemory;
pub mod manager;
pub mod provider;
mod singleflight;
pub mod specifier;
pub mod store;

pub use manager::{
    FetchDetails, RepositoryHandle, RepositoryManager, RepositoryManagerBuilder,
    RepositoryManagerDelegate, WarningHandler,
};
pub use provider::{ProgressSink, Repository, RepositoryProvider, Revision, WorkingCopy};
pub use specifier::RepositorySpecifier;

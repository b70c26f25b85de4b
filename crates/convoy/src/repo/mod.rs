//! Repository cache - project materialization with speculative hot copies.

mod cache;
mod git;

pub use cache::{CacheError, CacheResult, RepoCache, RepositoryInfo};

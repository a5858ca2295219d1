//! etcdrift - Track the drift between package and user configuration files.
//!
//! The files of `/etc` are tracked in a git repository on two lineages:
//! the vendor lineage holds the files as shipped by the packages found in
//! the package caches, the user lineage holds the files the user changed.
//! An update pass classifies the differences between both lineages and the
//! live tree, commits them, and merges package upgrades of user changed
//! files with git.

pub mod cfg;
pub mod classify;
pub mod diagnostic;
pub mod error;
pub mod hash;
pub mod live;
pub mod report;
pub mod scan;
pub mod sys;
pub mod ui;
pub mod vcs;
pub mod workspace;

pub use error::{Error, Result};

//! Core data model shared by every component

pub mod verdict;

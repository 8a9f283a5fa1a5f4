//! Utilities module - text helpers shared by indexing and search

pub mod text_utils;

pub use text_utils::TextUtils;

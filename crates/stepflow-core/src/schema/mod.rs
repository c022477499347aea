// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Schema resolution and per-step schema management.

pub mod manager;
pub mod resolver;

pub use manager::SchemaManager;
pub use resolver::{SchemaPointerError, SchemaResolver};

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task records and their durable store.

pub mod store;
pub mod types;

pub use store::{StoreError, TaskStore};
pub use types::{new_task_id, TaskOptions, TaskRecord, TaskStatus};

// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! FEC backend implementations

use std::sync::Arc;

use crate::FecBackend;

pub mod reed_solomon;

/// Create the best available backend for the current platform
pub fn create_backend() -> Arc<dyn FecBackend> {
    Arc::new(reed_solomon::ReedSolomonBackend::new())
}

/*
 * Copyright 2020 Actyx AG
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Error types of the pure computation core
//!
//! Plumbing code (database drivers, the export runner, the binary) uses `anyhow` instead.
use thiserror::Error;

/// A production record violates one of its invariants
///
/// Raised at the per-record boundary only; the caller decides whether to discard the record
/// or abort the batch. Records are never silently clamped into shape.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// name of the offending field
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// A grouping could not be parsed
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GroupByError {
    #[error("at least one grouping dimension is required")]
    Empty,
    #[error("unknown grouping dimension {0:?} (expected machine, shift or month)")]
    UnknownDimension(String),
}

/// A shift name is not one of the plant's shifts
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("unknown shift {0:?} (expected Morning, Afternoon or Night)")]
pub struct ParseShiftError(pub String);

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod delta;
mod requests;
mod store;

pub use delta::{NullView, RecordingView, StoreDelta, StoreView, StreamingStatus};
pub use requests::{
    PermissionRecord, PermissionStatus, QuestionRecord, QuestionStatus, RequestStore,
};
pub use store::{EntityStore, StoreError, Stores};

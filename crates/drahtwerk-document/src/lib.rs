// SPDX-License-Identifier: MIT
//
// Drahtwerk — document resolution for pending print jobs.

pub mod store;

pub use store::DocumentStore;

/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Fixed-capacity lock-free ring buffers
//!
//! Four variants, specialized by producer and consumer cardinality:
//!
//! * [`spsc::Spsc`], one producer and one consumer;
//! * [`mpsc::Mpsc`], any number of producers and one consumer;
//! * [`spmc::SpmcUnicast`] and [`spmc::SpmcBroadcast`], one producer and
//!   many consumers, either sharing the stream or each receiving all of it;
//! * [`mpmc::MpmcUnicast`] and [`mpmc::MpmcBroadcast`], many producers with
//!   the same two consumer models.
//!
//! All variants share the same shape: a fixed array of `N` element cells
//! (`N` a power of two, checked at compile time) addressed by the low bits
//! of monotonically increasing indices. Producers write a cell and then
//! publish the index with release ordering; consumers acquire the index and
//! only then touch the cell. Full and empty are ordinary return values,
//! there is no blocking anywhere, and nothing allocates after construction,
//! so a ring can live in caller-supplied memory, including a shared-memory
//! region, for bitwise-copyable element types.

pub mod mpmc;
pub mod mpsc;
mod slots;
pub mod spmc;
pub mod spsc;

/// The period, in pushes, at which the broadcast single-producer ring
/// re-scans the reader cursors to refresh its cached minimum.
/// The broadcast single-producer ring requires a capacity strictly greater
/// than this value.
pub const REFRESH_INTERVAL: usize = 64;

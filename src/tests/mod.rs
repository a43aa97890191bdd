/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Cross-thread stress scenarios for the rings and the executor


/// The capacity used by the stress scenarios
pub const SCALE_RING_SIZE: usize = 1024;

/// The number of messages pushed through the single-producer scenarios
pub const SCALE_MSG_COUNT: usize = 10_000;

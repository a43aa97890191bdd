/*******************************************************************************
 * Copyright (c) 2024 Cénotélie Opérations SAS (cenotelie.fr)
 ******************************************************************************/

//! Prelude for quadring

pub use crate::errors::Full;
#[cfg(feature = "std")]
pub use crate::executor::{Executor, TaskHandle};
pub use crate::rings::mpmc::{MpmcBroadcast, MpmcUnicast};
pub use crate::rings::mpsc::Mpsc;
pub use crate::rings::spmc::{SpmcBroadcast, SpmcUnicast};
pub use crate::rings::spsc::Spsc;

//! Altc controller – periodic collection from the watch cache and sequential
//! snapshot delivery.

#![forbid(unsafe_code)]

mod controller;
mod scheduler;

pub use controller::{Controller, ControllerConfig};
pub use scheduler::{Collection, CollectionScheduler, Tick};

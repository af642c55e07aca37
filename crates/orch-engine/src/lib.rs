#![deny(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod controller;
pub mod initiator;
pub mod watchdog;

pub use controller::{run_controller, ControllerError, ControllerOutcome};
pub use initiator::{submit, SubmitError, SubmitOutcome, ValidationFailure};
pub use watchdog::{watchdog_tick, WatchdogError, WatchdogOutcome};

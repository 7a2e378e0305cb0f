//! Core library for the microscope device server.
//!
//! This library contains the device abstractions (settings, lifecycle,
//! triggering), the streaming acquisition engine used by cameras and other
//! data devices, the capability layers for the common device kinds, and the
//! bootstrap that constructs devices from a configuration file. Simulated
//! devices allow everything to run without hardware attached.

pub mod camera;
pub mod config;
pub mod controller;
pub mod data;
pub mod device;
pub mod devices;
pub mod error;
pub mod logging;
pub mod retry;
pub mod server;
pub mod setting;
pub mod simulators;
pub mod trigger;

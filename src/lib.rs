//! Core library for the echem_daq application.
//!
//! Executes electrochemical measurement plans on multi-channel potentiostats:
//! plans are expanded into ordered runs, each channel executes its runs
//! sequentially while channels run concurrently, samples are streamed to disk, and
//! every measurement is appended to a persistent session record.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod runner;
pub mod session;

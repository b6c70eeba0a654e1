//! Randomized architecture resolution for future prediction networks.
//!
//! A network is an encoder (convolution and optional pooling stages), a stack of dense hidden
//! layers fed with the flattened encoding plus the action sequence, and a decoder that grows
//! the hidden features back into an image. Any architectural choice the user leaves out of a
//! [`PartialConfig`](config::PartialConfig) is drawn from a seeded
//! [`RandomSource`](rng::RandomSource), and the fully resolved
//! [`ArchConfig`](config::ArchConfig) is stored so that a run can be reproduced exactly.
//!
//! - [`resolve`] turns a partial config into a resolved one.
//! - [`graph`] assembles the symbolic graph of a resolved config and materializes its weights.
//! - [`experiment`] stores configs and step records and checks them when a run resumes.
//! - [`checkpoint`] writes and restores weight files.
//!
//!```
//! use netgen::{
//!     config::PartialConfig,
//!     graph::{assemble, AssemblyOptions},
//!     resolve::{InputSpec, Resolver, Topology},
//!     rng,
//! };
//! # fn main() -> netgen::result::Result<()> {
//! let input = InputSpec {
//!     image_size: 16,
//!     ..InputSpec::default()
//! };
//! let partial = PartialConfig::new().with_decode_depth(2);
//! let config = Resolver::new(&partial, rng::seeded(0))
//!     .input(input)
//!     .resolve()?
//!     .config;
//! let assembly = assemble(&config, &input, Topology::Bypass, AssemblyOptions::default())?;
//! let weights = assembly.graph.materialize(config.filter_seed);
//! assert_eq!(weights.len(), assembly.graph.parameters().len());
//! # Ok(())
//! # }
//!```
#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod experiment;
pub mod graph;
pub mod init;
pub mod resolve;
pub mod result;
pub mod rng;

pub use error::Error;

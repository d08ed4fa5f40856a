//! Core domain models for the job graph
//!
//! This module defines the fundamental data structures that represent
//! builders, their steps, schedulers and their configuration.

pub mod builder;
pub mod config;
pub mod graph;
pub mod master;
pub mod properties;
pub mod render;
pub mod schedulers;
pub mod state;
pub mod step;

pub use builder::*;
pub use graph::*;
pub use master::*;
pub use properties::*;
pub use render::{RenderError, Renderable};
pub use schedulers::*;
pub use state::*;
pub use step::*;

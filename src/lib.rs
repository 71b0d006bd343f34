//! Cross-adapter N-body particle simulation.
//!
//! One engine simulates on the adapter best suited for compute (integrated,
//! UMA silicon when present) while another renders on the discrete adapter,
//! meeting through a shared cross-adapter heap, two shared fences and a
//! three-queue wait/signal chain with exactly one frame of pipelining. On a
//! single-adapter topology the copy disappears and the compute engine
//! aliases the renderer's buffers (async-compute mode); the orchestrator
//! switches between the two shapes at runtime without restarting the
//! simulation.
//!
//! The `gpu` module provides the D3D12-shaped software device layer the
//! engines run against: real queue/fence/heap semantics over a
//! deterministic scheduler, so the synchronization protocol is executable
//! and testable on any host.

pub mod compute;
pub mod config;
pub mod error;
pub mod extension;
pub mod gpu;
pub mod particle;
pub mod particles;
pub mod render;

pub use compute::ComputeEngine;
pub use config::Config;
pub use error::{Error, Result};
pub use particles::{FrameStats, Particles};
pub use render::RenderEngine;

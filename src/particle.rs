//! Particle data layout, initial placement and the n-body step the compute
//! pipeline runs.
//!
//! Positions and velocities live in separate buffers: positions cross the
//! adapter boundary every frame, velocities never leave the simulating
//! device except during a state copy-forward.

use cgmath::{InnerSpace, Vector3, Vector4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use static_assertions::const_assert_eq;

/// Thread-group width of the n-body kernel.
pub const BLOCK_SIZE: u32 = 64;

/// Radius of each initial particle cluster.
pub const PARTICLE_SPREAD: f32 = 400.0;

pub const INITIAL_PARTICLE_SPEED: f32 = 15.0;
pub const INITIAL_PARTICLE_SIZE: f32 = 2.5;
pub const INITIAL_PARTICLE_INTENSITY: f32 = 0.15;

/// Lower bound the interactive controls clamp to.
pub const MIN_NUM_PARTICLES: u32 = 256 * 1024;

/// Ping-pong depth; the whole protocol is built around exactly two slots.
pub const NUM_BUFFERS: usize = 2;

pub const SIMULATION_TIMESTEP: f32 = 0.1;

pub const PARTICLE_SIZE_IN_BYTES: u64 = 16;
pub const VELOCITY_SIZE_IN_BYTES: u64 = 12;

const SOFTENING_SQUARED: f32 = 0.00125;
const PARTICLE_MASS: f32 = 66.73;

const GENERATION_CHUNK: usize = 4096;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Particle {
    pub position: Vector4<f32>,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleVelocity {
    pub velocity: Vector3<f32>,
}

const_assert_eq!(std::mem::size_of::<Particle>(), 16);
const_assert_eq!(std::mem::size_of::<ParticleVelocity>(), 12);

/// Two clusters on a collision course, the classic n-body demo setup. One
/// seeded generator per chunk keeps the result reproducible under `rayon`.
pub fn generate_particles(
    count: usize,
    seed: u64,
) -> (Vec<Particle>, Vec<ParticleVelocity>) {
    let mut positions = vec![
        Particle {
            position: Vector4::new(0.0, 0.0, 0.0, 1.0),
        };
        count
    ];
    let mut velocities = vec![
        ParticleVelocity {
            velocity: Vector3::new(0.0, 0.0, 0.0),
        };
        count
    ];
    let half = count / 2;
    positions
        .par_chunks_mut(GENERATION_CHUNK)
        .zip(velocities.par_chunks_mut(GENERATION_CHUNK))
        .enumerate()
        .for_each(|(chunk_index, (pos_chunk, vel_chunk))| {
            let mut rng = StdRng::seed_from_u64(
                seed ^ (chunk_index as u64)
                    .wrapping_mul(0x9e37_79b9_7f4a_7c15),
            );
            let base = chunk_index * GENERATION_CHUNK;
            for (offset, (particle, velocity)) in
                pos_chunk.iter_mut().zip(vel_chunk.iter_mut()).enumerate()
            {
                let (center, drift) = if base + offset < half {
                    (
                        Vector3::new(PARTICLE_SPREAD * 0.5, 0.0, 0.0),
                        Vector3::new(0.0, 0.0, -INITIAL_PARTICLE_SPEED),
                    )
                } else {
                    (
                        Vector3::new(-PARTICLE_SPREAD * 0.5, 0.0, 0.0),
                        Vector3::new(0.0, 0.0, INITIAL_PARTICLE_SPEED),
                    )
                };
                let delta = loop {
                    let candidate = Vector3::new(
                        rng.gen_range(-1.0f32..1.0),
                        rng.gen_range(-1.0f32..1.0),
                        rng.gen_range(-1.0f32..1.0),
                    );
                    if candidate.magnitude2() <= 1.0 {
                        break candidate * PARTICLE_SPREAD;
                    }
                };
                particle.position = (center + delta).extend(1.0);
                velocity.velocity = drift;
            }
        });
    (positions, velocities)
}

/// One integration step for the first `active` particles. Every particle is
/// a gravity source; only the active prefix moves, matching a dispatch that
/// covers `active` threads.
pub fn n_body_step(
    positions: &[Particle],
    velocities: &[ParticleVelocity],
    active: usize,
    dt: f32,
) -> (Vec<Particle>, Vec<ParticleVelocity>) {
    let active = active.min(positions.len()).min(velocities.len());
    let mut out_positions = Vec::with_capacity(active);
    let mut out_velocities = Vec::with_capacity(active);
    for index in 0..active {
        let here = positions[index].position.truncate();
        let mut accel = Vector3::new(0.0f32, 0.0, 0.0);
        for body in positions {
            let r = body.position.truncate() - here;
            let dist_sqr = r.magnitude2() + SOFTENING_SQUARED;
            let inv_dist = 1.0 / dist_sqr.sqrt();
            accel += r * (PARTICLE_MASS * inv_dist * inv_dist * inv_dist);
        }
        let velocity = velocities[index].velocity + accel * dt;
        let moved = here + velocity * dt;
        out_positions.push(Particle {
            position: moved.extend(positions[index].position.w),
        });
        out_velocities.push(ParticleVelocity { velocity });
    }
    (out_positions, out_velocities)
}

/// Byte-level entry point the software compute pipeline calls.
pub(crate) fn step_bytes(
    src_positions: &[u8],
    src_velocities: &[u8],
    active: usize,
    dt: f32,
) -> (Vec<u8>, Vec<u8>) {
    let positions = particles_from_bytes(src_positions);
    let velocities = velocities_from_bytes(src_velocities);
    let (new_positions, new_velocities) =
        n_body_step(&positions, &velocities, active, dt);
    (
        particles_to_bytes(&new_positions),
        velocities_to_bytes(&new_velocities),
    )
}

pub fn particles_from_bytes(bytes: &[u8]) -> Vec<Particle> {
    bytes
        .chunks_exact(PARTICLE_SIZE_IN_BYTES as usize)
        .map(|chunk| Particle {
            position: Vector4::new(
                f32_at(chunk, 0),
                f32_at(chunk, 4),
                f32_at(chunk, 8),
                f32_at(chunk, 12),
            ),
        })
        .collect()
}

pub fn particles_to_bytes(particles: &[Particle]) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(particles.len() * PARTICLE_SIZE_IN_BYTES as usize);
    for particle in particles {
        let p = particle.position;
        for component in [p.x, p.y, p.z, p.w] {
            bytes.extend_from_slice(&component.to_le_bytes());
        }
    }
    bytes
}

pub fn velocities_from_bytes(bytes: &[u8]) -> Vec<ParticleVelocity> {
    bytes
        .chunks_exact(VELOCITY_SIZE_IN_BYTES as usize)
        .map(|chunk| ParticleVelocity {
            velocity: Vector3::new(
                f32_at(chunk, 0),
                f32_at(chunk, 4),
                f32_at(chunk, 8),
            ),
        })
        .collect()
}

pub fn velocities_to_bytes(velocities: &[ParticleVelocity]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(
        velocities.len() * VELOCITY_SIZE_IN_BYTES as usize,
    );
    for velocity in velocities {
        let v = velocity.velocity;
        for component in [v.x, v.y, v.z] {
            bytes.extend_from_slice(&component.to_le_bytes());
        }
    }
    bytes
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

//! Startup configuration. Live-tunable knobs (adapter indices, fullscreen,
//! extension toggle, particle counts) move onto the orchestrator once it is
//! constructed; this struct seeds their initial values.

use crate::particle::{
    INITIAL_PARTICLE_INTENSITY, INITIAL_PARTICLE_SIZE, MIN_NUM_PARTICLES,
};

#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of every particle buffer; never changes at runtime.
    pub max_particles: u32,
    pub num_rendered: u32,
    pub num_copied: u32,
    pub num_simulated: u32,
    /// When set, the rendered count drives the copied and simulated counts.
    pub linked_counts: bool,
    pub particle_size: f32,
    pub particle_intensity: f32,
    pub vsync: bool,
    pub full_screen: bool,
    pub enable_extension: bool,
    pub enable_overlay: bool,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_particles: MIN_NUM_PARTICLES,
            num_rendered: MIN_NUM_PARTICLES,
            num_copied: MIN_NUM_PARTICLES,
            num_simulated: MIN_NUM_PARTICLES,
            linked_counts: true,
            particle_size: INITIAL_PARTICLE_SIZE,
            particle_intensity: INITIAL_PARTICLE_INTENSITY,
            vsync: true,
            full_screen: false,
            enable_extension: true,
            enable_overlay: true,
            seed: 0,
        }
    }
}

impl Config {
    pub fn with_max_particles(max_particles: u32) -> Self {
        Self {
            max_particles,
            num_rendered: max_particles,
            num_copied: max_particles,
            num_simulated: max_particles,
            ..Self::default()
        }
    }

    /// (rendered, copied, simulated), linked and clamped to capacity.
    pub fn effective_counts(&self) -> (u32, u32, u32) {
        let rendered = self.num_rendered.min(self.max_particles);
        if self.linked_counts {
            (rendered, rendered, rendered)
        } else {
            (
                rendered,
                self.num_copied.min(self.max_particles),
                self.num_simulated.min(self.max_particles),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_counts_follow_the_rendered_count() {
        let config = Config {
            max_particles: 1024,
            num_rendered: 512,
            num_copied: 1024,
            num_simulated: 256,
            linked_counts: true,
            ..Config::default()
        };
        assert_eq!(config.effective_counts(), (512, 512, 512));
    }

    #[test]
    fn unlinked_counts_are_independent_but_clamped() {
        let config = Config {
            max_particles: 1024,
            num_rendered: 4096,
            num_copied: 300,
            num_simulated: 100,
            linked_counts: false,
            ..Config::default()
        };
        assert_eq!(config.effective_counts(), (1024, 300, 100));
    }
}

//! Orchestrator tying the two engines together.
//!
//! Owns adapter assignment, the handle-exchange order, the once-per-frame
//! draw/simulate sequence with its single host wait, and topology changes:
//! when a live knob moves an engine to another adapter (or toggles the
//! vendor extension or fullscreen), both engines are drained, the affected
//! engine is rebuilt, and the handles are exchanged again. The compute
//! engine's particle state survives its rebuild via the copy-forward path.

use std::time::Instant;

use log::info;

use crate::compute::ComputeEngine;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gpu::{Adapter, Device, Factory, SurfaceDesc};
use crate::render::RenderEngine;

/// Per-frame snapshot handed to the overlay callback.
#[derive(Clone, Debug)]
pub struct FrameStats {
    /// Host-side time since the previous frame, in seconds.
    pub frame_time: f32,
    /// Named moving-average GPU intervals from both engines, in seconds.
    pub gpu_times: Vec<(f32, String)>,
    pub async_mode: bool,
    pub queue_extension_enabled: bool,
}

pub struct Particles {
    adapters: Vec<Adapter>,
    surface: SurfaceDesc,
    seed: u64,
    max_particles: u32,

    compute_adapter_index: usize,
    render_adapter_index: usize,
    queue_extension_enabled: bool,
    full_screen: bool,
    vsync: bool,
    num_rendered: u32,
    num_copied: u32,
    num_simulated: u32,
    linked_counts: bool,
    particle_size: f32,
    particle_intensity: f32,
    overlay_enabled: bool,

    prev_compute_adapter_index: usize,
    prev_render_adapter_index: usize,
    prev_queue_extension_enabled: bool,
    prev_full_screen: bool,

    compute: Option<ComputeEngine>,
    render: Option<RenderEngine>,

    last_frame: Instant,
    frame_time: f32,
}

impl Particles {
    pub fn new(
        factory: &Factory,
        surface: SurfaceDesc,
        config: &Config,
    ) -> Result<Self> {
        let adapters: Vec<Adapter> = factory
            .enum_adapters()
            .into_iter()
            .filter(|adapter| !adapter.is_software())
            .collect();
        if adapters.is_empty() {
            return Err(Error::NoAdapters);
        }
        let (compute_adapter_index, render_adapter_index) =
            assign_adapters(&adapters)?;

        let mut particles = Self {
            adapters,
            surface,
            seed: config.seed,
            max_particles: config.max_particles,
            compute_adapter_index,
            render_adapter_index,
            queue_extension_enabled: config.enable_extension,
            full_screen: config.full_screen,
            vsync: config.vsync,
            num_rendered: config.num_rendered,
            num_copied: config.num_copied,
            num_simulated: config.num_simulated,
            linked_counts: config.linked_counts,
            particle_size: config.particle_size,
            particle_intensity: config.particle_intensity,
            overlay_enabled: config.enable_overlay,
            prev_compute_adapter_index: compute_adapter_index,
            prev_render_adapter_index: render_adapter_index,
            prev_queue_extension_enabled: config.enable_extension,
            prev_full_screen: config.full_screen,
            compute: None,
            render: None,
            last_frame: Instant::now(),
            frame_time: 0.0,
        };
        info!(
            "adapter assignment: compute on {}, render on {}",
            particles.adapters[compute_adapter_index].desc().description,
            particles.adapters[render_adapter_index].desc().description,
        );

        particles.render = Some(RenderEngine::new(
            &particles.adapters[render_adapter_index],
            &particles.surface,
            particles.max_particles,
            particles.queue_extension_enabled,
            particles.full_screen,
        )?);
        particles.compute = Some(ComputeEngine::new(
            &particles.adapters[compute_adapter_index],
            particles.max_particles,
            particles.queue_extension_enabled,
            particles.seed,
            None,
        )?);
        particles.share_handles()?;
        particles.sync_extension_state()?;
        Ok(particles)
    }

    /// Wires the engines together. Order is load-bearing: any async aliasing
    /// must be unwound before the handles move, the producer opens the
    /// consumer fence while minting its own handles, and only once the
    /// consumer is attached may the producer alias the consumer's buffers
    /// for the same-adapter topology.
    fn share_handles(&mut self) -> Result<()> {
        let same_adapter =
            self.compute_adapter_index == self.render_adapter_index;
        let (compute, render) = engines_mut(&mut self.compute, &mut self.render)?;
        compute.reset_from_async()?;
        let handles = compute.shared_handles(render.shared_fence_handle())?;
        render.set_shared(handles)?;
        if same_adapter {
            compute.set_async(
                render.fence(),
                render.buffers(),
                render.buffer_index(),
            )?;
        }
        render.set_async_mode(same_adapter);
        info!(
            "handles exchanged ({} topology)",
            if same_adapter { "same-adapter" } else { "cross-adapter" }
        );
        Ok(())
    }

    /// One frame: draw (which internally schedules the cross-adapter copy),
    /// kick the next simulation, then block the host on at most one event.
    /// Live-knob deltas are applied after the frame retires.
    pub fn draw(
        &mut self,
        overlay: Option<&mut dyn FnMut(&FrameStats)>,
    ) -> Result<()> {
        let now = Instant::now();
        self.frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        let rendered = self.num_rendered.min(self.max_particles);
        let (copied, simulated) = if self.linked_counts {
            (rendered, rendered)
        } else {
            (
                self.num_copied.min(self.max_particles),
                self.num_simulated.min(self.max_particles),
            )
        };
        let (vsync, size, intensity, show_overlay) = (
            self.vsync,
            self.particle_size,
            self.particle_intensity,
            self.overlay_enabled,
        );

        let (compute, render) = engines_mut(&mut self.compute, &mut self.render)?;
        render.set_particle_size(size);
        render.set_particle_intensity(intensity);

        let mut fence_value = compute.fence_value();
        let completion =
            render.draw(rendered, &mut fence_value, copied, vsync, show_overlay)?;
        compute.simulate(simulated, fence_value)?;
        if let Some(event) = completion {
            event.wait()?;
        }

        if let Some(callback) = overlay {
            callback(&self.frame_stats());
        }
        self.apply_pending_changes()
    }

    fn apply_pending_changes(&mut self) -> Result<()> {
        let change_full_screen = self.full_screen != self.prev_full_screen;
        let change_extension =
            self.queue_extension_enabled != self.prev_queue_extension_enabled;
        let change_compute =
            self.compute_adapter_index != self.prev_compute_adapter_index;
        let render_supports_extension = self
            .render
            .as_ref()
            .map(RenderEngine::supports_extension)
            .unwrap_or(false);
        let change_render = self.render_adapter_index
            != self.prev_render_adapter_index
            || change_full_screen
            || (change_extension && render_supports_extension);
        if !(change_compute || change_render || change_extension) {
            return Ok(());
        }

        // Structural changes happen against idle devices. Aliasing is
        // unwound only ahead of a rebuild, while the engine being replaced
        // still exists; the handle exchange after the rebuild restores it.
        {
            let (compute, render) =
                engines_mut(&mut self.compute, &mut self.render)?;
            compute.wait_for_gpu()?;
            render.wait_for_gpu()?;
            if change_compute || change_render {
                compute.reset_from_async()?;
            }
        }

        if change_render {
            let adapter = self
                .adapters
                .get(self.render_adapter_index)
                .ok_or(Error::InvalidArgument(
                    "render adapter index out of range",
                ))?
                .clone();
            info!(
                "rebuilding render engine on {}",
                adapter.desc().description
            );
            self.render = None;
            self.render = Some(RenderEngine::new(
                &adapter,
                &self.surface,
                self.max_particles,
                self.queue_extension_enabled,
                self.full_screen,
            )?);
        }

        if change_compute {
            let adapter = self
                .adapters
                .get(self.compute_adapter_index)
                .ok_or(Error::InvalidArgument(
                    "compute adapter index out of range",
                ))?
                .clone();
            info!(
                "rebuilding compute engine on {}",
                adapter.desc().description
            );
            let mut old = self.compute.take().ok_or(Error::InvalidArgument(
                "engines are not initialized",
            ))?;
            let replacement = ComputeEngine::new(
                &adapter,
                self.max_particles,
                self.queue_extension_enabled,
                self.seed,
                Some(&mut old),
            )?;
            drop(old);
            self.compute = Some(replacement);
        } else if change_extension {
            if let Some(compute) = self.compute.as_mut() {
                compute
                    .set_use_queue_extension(self.queue_extension_enabled)?;
            }
        }

        if change_compute || change_render {
            self.share_handles()?;
        }
        self.sync_extension_state()?;
        self.prev_compute_adapter_index = self.compute_adapter_index;
        self.prev_render_adapter_index = self.render_adapter_index;
        self.prev_full_screen = self.full_screen;
        self.prev_queue_extension_enabled = self.queue_extension_enabled;
        Ok(())
    }

    /// The extension knob reflects what the hardware actually granted.
    fn sync_extension_state(&mut self) -> Result<()> {
        let (compute, render) = engines_mut(&mut self.compute, &mut self.render)?;
        self.queue_extension_enabled =
            compute.using_extension() || render.using_extension();
        self.prev_queue_extension_enabled = self.queue_extension_enabled;
        Ok(())
    }

    pub fn frame_stats(&self) -> FrameStats {
        let mut gpu_times = Vec::new();
        if let Some(compute) = &self.compute {
            gpu_times.extend(compute.gpu_times().iter().cloned());
        }
        if let Some(render) = &self.render {
            gpu_times.extend(render.gpu_times().iter().cloned());
        }
        FrameStats {
            frame_time: self.frame_time,
            gpu_times,
            async_mode: self.is_async_mode(),
            queue_extension_enabled: self.queue_extension_enabled,
        }
    }

    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    pub fn compute_adapter_index(&self) -> usize {
        self.compute_adapter_index
    }

    pub fn render_adapter_index(&self) -> usize {
        self.render_adapter_index
    }

    pub fn is_async_mode(&self) -> bool {
        self.render
            .as_ref()
            .map(RenderEngine::is_async_mode)
            .unwrap_or(false)
    }

    pub fn queue_extension_enabled(&self) -> bool {
        self.queue_extension_enabled
    }

    pub fn compute_engine(&self) -> Option<&ComputeEngine> {
        self.compute.as_ref()
    }

    pub fn render_engine(&self) -> Option<&RenderEngine> {
        self.render.as_ref()
    }

    pub fn set_compute_adapter_index(&mut self, index: usize) {
        self.compute_adapter_index = index;
    }

    pub fn set_render_adapter_index(&mut self, index: usize) {
        self.render_adapter_index = index;
    }

    pub fn set_queue_extension_enabled(&mut self, enabled: bool) {
        self.queue_extension_enabled = enabled;
    }

    pub fn set_full_screen(&mut self, full_screen: bool) {
        self.full_screen = full_screen;
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    pub fn set_particle_counts(
        &mut self,
        rendered: u32,
        copied: u32,
        simulated: u32,
    ) {
        self.num_rendered = rendered;
        self.num_copied = copied;
        self.num_simulated = simulated;
    }

    pub fn set_linked_counts(&mut self, linked: bool) {
        self.linked_counts = linked;
    }

    pub fn set_particle_size(&mut self, size: f32) {
        self.particle_size = size;
    }

    pub fn set_particle_intensity(&mut self, intensity: f32) {
        self.particle_intensity = intensity;
    }

    pub fn set_overlay_enabled(&mut self, enabled: bool) {
        self.overlay_enabled = enabled;
    }
}

fn engines_mut<'a>(
    compute: &'a mut Option<ComputeEngine>,
    render: &'a mut Option<RenderEngine>,
) -> Result<(&'a mut ComputeEngine, &'a mut RenderEngine)> {
    match (compute.as_mut(), render.as_mut()) {
        (Some(compute), Some(render)) => Ok((compute, render)),
        _ => Err(Error::InvalidArgument("engines are not initialized")),
    }
}

/// Integrated (UMA) silicon simulates, discrete silicon renders. Without a
/// clear split the first adapter simulates and the last renders; on a
/// single-adapter machine both indices coincide and the engines run in
/// async-compute mode.
fn assign_adapters(adapters: &[Adapter]) -> Result<(usize, usize)> {
    let mut compute_index = None;
    let mut render_index = None;
    for (index, adapter) in adapters.iter().enumerate() {
        let device = Device::new(adapter)?;
        if device.architecture().uma {
            compute_index.get_or_insert(index);
        } else {
            render_index.get_or_insert(index);
        }
    }
    match (compute_index, render_index) {
        (Some(compute), Some(render)) => Ok((compute, render)),
        _ => Ok((0, adapters.len() - 1)),
    }
}

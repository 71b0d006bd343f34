//! Runtime topology changes: same-adapter async-compute mode, the aliasing
//! round trip, compute-state copy-forward across adapters, and the
//! extension/fullscreen rebuild paths.

use xgpu_particles::compute::ComputeEngine;
use xgpu_particles::gpu::{
    AccessKind, AdapterDesc, CommandListType, Factory, SurfaceDesc,
};
use xgpu_particles::particle::{
    PARTICLE_SIZE_IN_BYTES, VELOCITY_SIZE_IN_BYTES,
};
use xgpu_particles::render::RenderEngine;
use xgpu_particles::{Config, Particles};

const NUM_PARTICLES: u32 = 256;

fn discrete_adapter() -> AdapterDesc {
    AdapterDesc {
        description: "Fake Discrete GPU".to_string(),
        vendor_id: 0x10de,
        is_software: false,
        is_uma: false,
        supports_queue_extension: false,
    }
}

fn integrated_adapter() -> AdapterDesc {
    AdapterDesc {
        description: "Fake Integrated GPU".to_string(),
        vendor_id: 0x8086,
        is_software: false,
        is_uma: true,
        supports_queue_extension: true,
    }
}

fn surface() -> SurfaceDesc {
    SurfaceDesc {
        width: 640,
        height: 360,
        allow_tearing: true,
    }
}

fn config() -> Config {
    Config {
        enable_overlay: false,
        vsync: false,
        seed: 23,
        ..Config::with_max_particles(NUM_PARTICLES)
    }
}

#[test]
fn single_adapter_topology_runs_async_without_copies() {
    let factory = Factory::new(vec![integrated_adapter()]);
    let mut particles =
        Particles::new(&factory, surface(), &config()).unwrap();
    assert!(particles.is_async_mode());

    // The producer writes straight into the renderer's local pair.
    {
        let compute = particles.compute_engine().unwrap();
        let render = particles.render_engine().unwrap();
        for index in 0..2 {
            assert_eq!(
                compute.position_buffers()[index].id(),
                render.buffers()[index].id()
            );
        }
    }

    factory.take_access_log();
    for _ in 0..6 {
        particles.draw(None).unwrap();
    }
    let log = factory.take_access_log();
    assert!(!log.iter().any(|record| {
        record.queue == CommandListType::Copy
            && record.kind == AccessKind::CopyRead
    }));
    assert!(factory.device_removed_reason().is_none());
}

#[test]
fn aliasing_round_trip_restores_the_shared_buffers() {
    let factory = Factory::new(vec![integrated_adapter()]);
    let adapters = factory.enum_adapters();
    let mut render = RenderEngine::new(
        &adapters[0],
        &surface(),
        NUM_PARTICLES,
        false,
        false,
    )
    .unwrap();
    let mut compute =
        ComputeEngine::new(&adapters[0], NUM_PARTICLES, false, 7, None)
            .unwrap();
    let handles =
        compute.shared_handles(render.shared_fence_handle()).unwrap();
    render.set_shared(handles).unwrap();

    let size = NUM_PARTICLES as u64 * PARTICLE_SIZE_IN_BYTES;
    let original_ids =
        [compute.position_buffers()[0].id(), compute.position_buffers()[1].id()];
    let before = [
        compute.position_buffers()[0].read(0, size).unwrap(),
        compute.position_buffers()[1].read(0, size).unwrap(),
    ];

    compute
        .set_async(render.fence(), render.buffers(), render.buffer_index())
        .unwrap();
    assert!(compute.is_async_mode());
    assert_ne!(compute.position_buffers()[0].id(), original_ids[0]);

    compute.reset_from_async().unwrap();
    assert!(!compute.is_async_mode());
    for index in 0..2 {
        assert_eq!(compute.position_buffers()[index].id(), original_ids[index]);
        assert_eq!(
            compute.position_buffers()[index].read(0, size).unwrap(),
            before[index]
        );
    }
    render.wait_for_gpu().unwrap();
}

#[test]
fn compute_rebuild_copies_positions_and_velocities_forward() {
    let factory =
        Factory::new(vec![discrete_adapter(), integrated_adapter()]);
    let adapters = factory.enum_adapters();
    let mut old =
        ComputeEngine::new(&adapters[1], NUM_PARTICLES, false, 41, None)
            .unwrap();

    let pos_size = NUM_PARTICLES as u64 * PARTICLE_SIZE_IN_BYTES;
    let vel_size = NUM_PARTICLES as u64 * VELOCITY_SIZE_IN_BYTES;
    let old_positions = [
        old.position_buffers()[0].read(0, pos_size).unwrap(),
        old.position_buffers()[1].read(0, pos_size).unwrap(),
    ];
    let old_velocities = [
        old.velocity_buffers()[0].read(0, vel_size).unwrap(),
        old.velocity_buffers()[1].read(0, vel_size).unwrap(),
    ];

    let replacement = ComputeEngine::new(
        &adapters[0],
        NUM_PARTICLES,
        false,
        41,
        Some(&mut old),
    )
    .unwrap();
    drop(old);

    for index in 0..2 {
        assert_eq!(
            replacement.position_buffers()[index].read(0, pos_size).unwrap(),
            old_positions[index]
        );
        assert_eq!(
            replacement.velocity_buffers()[index].read(0, vel_size).unwrap(),
            old_velocities[index]
        );
    }
    assert!(factory.device_removed_reason().is_none());
}

#[test]
fn migrating_the_simulation_between_adapters_mid_run() {
    let factory =
        Factory::new(vec![discrete_adapter(), integrated_adapter()]);
    let mut particles =
        Particles::new(&factory, surface(), &config()).unwrap();
    let home_index = particles.compute_adapter_index();
    let render_index = particles.render_adapter_index();
    assert!(!particles.is_async_mode());

    for _ in 0..3 {
        particles.draw(None).unwrap();
    }

    // Onto the render adapter: the copy disappears, buffers are aliased.
    particles.set_compute_adapter_index(render_index);
    particles.draw(None).unwrap();
    assert!(particles.is_async_mode());
    {
        let compute = particles.compute_engine().unwrap();
        let render = particles.render_engine().unwrap();
        assert_eq!(
            compute.position_buffers()[0].id(),
            render.buffers()[0].id()
        );
    }
    for _ in 0..3 {
        particles.draw(None).unwrap();
    }

    // And back home: cross-adapter mode again, nothing was lost.
    particles.set_compute_adapter_index(home_index);
    particles.draw(None).unwrap();
    assert!(!particles.is_async_mode());
    {
        let compute = particles.compute_engine().unwrap();
        let render = particles.render_engine().unwrap();
        assert_ne!(
            compute.position_buffers()[0].id(),
            render.buffers()[0].id()
        );
    }
    for _ in 0..3 {
        particles.draw(None).unwrap();
    }
    assert!(factory.device_removed_reason().is_none());
}

#[test]
fn extension_toggle_follows_hardware_support() {
    let factory =
        Factory::new(vec![discrete_adapter(), integrated_adapter()]);
    let mut particles =
        Particles::new(&factory, surface(), &config()).unwrap();
    // Granted on the integrated compute adapter, unavailable on the
    // discrete render adapter.
    assert!(particles.queue_extension_enabled());
    assert!(particles.compute_engine().unwrap().using_extension());
    assert!(!particles.render_engine().unwrap().using_extension());

    particles.set_queue_extension_enabled(false);
    particles.draw(None).unwrap();
    assert!(!particles.queue_extension_enabled());
    assert!(!particles.compute_engine().unwrap().using_extension());
    particles.draw(None).unwrap();

    particles.set_queue_extension_enabled(true);
    particles.draw(None).unwrap();
    assert!(particles.queue_extension_enabled());
    assert!(particles.compute_engine().unwrap().using_extension());
}

#[test]
fn extension_toggle_without_hardware_support_keeps_the_async_wiring() {
    let factory = Factory::new(vec![AdapterDesc {
        description: "Fake Integrated GPU".to_string(),
        vendor_id: 0x8086,
        is_software: false,
        is_uma: true,
        supports_queue_extension: false,
    }]);
    let mut particles =
        Particles::new(&factory, surface(), &config()).unwrap();
    assert!(particles.is_async_mode());
    particles.draw(None).unwrap();

    // Neither engine can grant the extension, so no rebuild happens; the
    // frame applying the knob must leave the aliasing in place.
    particles.set_queue_extension_enabled(true);
    particles.draw(None).unwrap();
    assert!(!particles.queue_extension_enabled());
    for _ in 0..3 {
        particles.draw(None).unwrap();
    }
    assert!(particles.is_async_mode());
    assert!(factory.device_removed_reason().is_none());
}

#[test]
fn fullscreen_toggle_rebuilds_the_render_engine() {
    let factory =
        Factory::new(vec![discrete_adapter(), integrated_adapter()]);
    let mut particles =
        Particles::new(&factory, surface(), &config()).unwrap();
    assert!(!particles.render_engine().unwrap().is_full_screen());

    particles.set_full_screen(true);
    particles.draw(None).unwrap();
    assert!(particles.render_engine().unwrap().is_full_screen());
    for _ in 0..2 {
        particles.draw(None).unwrap();
    }

    particles.set_full_screen(false);
    particles.draw(None).unwrap();
    assert!(!particles.render_engine().unwrap().is_full_screen());
    assert!(factory.device_removed_reason().is_none());
}

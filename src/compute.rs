//! Simulation side of the cross-adapter pipeline.
//!
//! The compute engine owns the shared heap holding the two position buffers
//! (the ping-pong pair the consumer reads across the adapter boundary), the
//! device-local velocity buffers, and the shareable fence it signals once
//! per simulated frame. Backpressure is a single queue-level wait: before
//! overwriting a slot the queue waits until the consumer has signalled that
//! it is done with the previous generation.

use log::{error, info, trace};

use crate::error::{Error, Result};
use crate::extension::QueueExtension;
use crate::gpu::timer::{GpuTimer, DEFAULT_AVERAGE_OVER};
use crate::gpu::{
    Adapter, BufferDesc, CommandAllocator, CommandList, CommandListType,
    CommandQueue, CommandQueueDesc, ComputePipeline, ComputePipelineDesc,
    Device, Fence, FenceFlags, Heap, HeapDesc, HeapFlags, HeapType, Resource,
    ResourceFlags, ResourceStates, SharedHandle, SharedHandles,
};
use crate::particle::{
    self, generate_particles, BLOCK_SIZE, NUM_BUFFERS, PARTICLE_SIZE_IN_BYTES,
    SIMULATION_TIMESTEP, VELOCITY_SIZE_IN_BYTES,
};

pub struct ComputeEngine {
    device: Device,
    extension: QueueExtension,
    using_extension: bool,
    command_queue: CommandQueue,
    command_allocators: [CommandAllocator; NUM_BUFFERS],
    command_list: CommandList,
    pipeline: ComputePipeline,

    fence: Fence,
    fence_handle: SharedHandle,
    fence_value: u64,
    consumer_fence: Option<Fence>,

    heap: Heap,
    heap_handle: SharedHandle,
    aligned_data_size: u64,
    buffer_size: u64,
    velocity_buffer_size: u64,
    position_buffers: [Resource; NUM_BUFFERS],
    original_position_buffers: Option<[Resource; NUM_BUFFERS]>,
    velocity_buffers: [Resource; NUM_BUFFERS],
    buffer_index: usize,
    last_write_index: Option<usize>,

    num_particles: u32,
    async_mode: bool,
    timer: GpuTimer,
}

impl ComputeEngine {
    /// Builds the engine on `adapter`. When `previous` is given the particle
    /// state is copied forward across the adapter boundary instead of being
    /// regenerated, so a topology switch does not restart the simulation.
    pub fn new(
        adapter: &Adapter,
        num_particles: u32,
        use_extension: bool,
        seed: u64,
        previous: Option<&mut ComputeEngine>,
    ) -> Result<Self> {
        let device = Device::new(adapter)?;
        let extension = QueueExtension::new(&device);
        let using_extension = use_extension && extension.enabled();
        let command_queue =
            create_compute_queue(&device, &extension, using_extension)?;
        let command_allocators = [
            device.create_command_allocator(CommandListType::Compute)?,
            device.create_command_allocator(CommandListType::Compute)?,
        ];
        let mut command_list =
            device.create_command_list(CommandListType::Compute)?;
        command_list.close()?;

        let pipeline = device.create_compute_pipeline(&ComputePipelineDesc {
            block_size: BLOCK_SIZE,
            particle_count: num_particles,
            timestep: SIMULATION_TIMESTEP,
        })?;

        let fence = device.create_fence(
            0,
            FenceFlags::SHARED | FenceFlags::SHARED_CROSS_ADAPTER,
        )?;
        let fence_handle = device.create_shared_handle_for_fence(&fence)?;

        let buffer_size = num_particles as u64 * PARTICLE_SIZE_IN_BYTES;
        let velocity_buffer_size =
            num_particles as u64 * VELOCITY_SIZE_IN_BYTES;
        let aligned_data_size = device.resource_allocation_info(buffer_size);
        let heap = device.create_heap(&HeapDesc {
            size: NUM_BUFFERS as u64 * aligned_data_size,
            flags: HeapFlags::SHARED | HeapFlags::SHARED_CROSS_ADAPTER,
        })?;
        let heap_handle = device.create_shared_handle_for_heap(&heap)?;

        let position_buffers = [
            create_position_buffer(&device, &heap, 0, aligned_data_size, buffer_size)?,
            create_position_buffer(&device, &heap, 1, aligned_data_size, buffer_size)?,
        ];
        let velocity_buffers = [
            create_velocity_buffer(&device, velocity_buffer_size)?,
            create_velocity_buffer(&device, velocity_buffer_size)?,
        ];

        let mut timer =
            GpuTimer::new(&device, &command_queue, 1, DEFAULT_AVERAGE_OVER)?;
        timer.set_timer_name(0, "simulate ms");

        let mut engine = Self {
            device,
            extension,
            using_extension,
            command_queue,
            command_allocators,
            command_list,
            pipeline,
            fence,
            fence_handle,
            fence_value: 1,
            consumer_fence: None,
            heap,
            heap_handle,
            aligned_data_size,
            buffer_size,
            velocity_buffer_size,
            position_buffers,
            original_position_buffers: None,
            velocity_buffers,
            buffer_index: 0,
            last_write_index: None,
            num_particles,
            async_mode: false,
            timer,
        };

        match previous {
            Some(previous) => engine.copy_state(previous)?,
            None => engine.initialize_particles(seed)?,
        }
        info!(
            "compute engine ready on {} ({} particles, extension {})",
            engine.device.adapter_desc().description,
            num_particles,
            if engine.using_extension { "on" } else { "off" },
        );
        Ok(engine)
    }

    /// Uploads freshly generated initial conditions into both slots of both
    /// ping-pong pairs.
    fn initialize_particles(&mut self, seed: u64) -> Result<()> {
        let (positions, velocities) =
            generate_particles(self.num_particles as usize, seed);

        let position_upload = self.device.create_committed_buffer(
            &BufferDesc::new(self.buffer_size)
                .set_heap_type(HeapType::Upload),
        )?;
        position_upload.write(0, &particle::particles_to_bytes(&positions))?;
        let velocity_upload = self.device.create_committed_buffer(
            &BufferDesc::new(self.velocity_buffer_size)
                .set_heap_type(HeapType::Upload),
        )?;
        velocity_upload
            .write(0, &particle::velocities_to_bytes(&velocities))?;

        self.command_allocators[0].reset()?;
        self.command_list.reset(&self.command_allocators[0], None)?;
        for buffer in &self.position_buffers {
            self.command_list.resource_barrier_transition(
                buffer,
                ResourceStates::UNORDERED_ACCESS,
                ResourceStates::COPY_DEST,
            );
            self.command_list.copy_buffer_region(
                buffer,
                0,
                &position_upload,
                0,
                self.buffer_size,
            );
            // Positions are served to the consumer's copy queue.
            self.command_list.resource_barrier_transition(
                buffer,
                ResourceStates::COPY_DEST,
                ResourceStates::COPY_SOURCE,
            );
        }
        for buffer in &self.velocity_buffers {
            self.command_list.resource_barrier_transition(
                buffer,
                ResourceStates::UNORDERED_ACCESS,
                ResourceStates::COPY_DEST,
            );
            self.command_list.copy_buffer_region(
                buffer,
                0,
                &velocity_upload,
                0,
                self.velocity_buffer_size,
            );
            self.command_list.resource_barrier_transition(
                buffer,
                ResourceStates::COPY_DEST,
                ResourceStates::UNORDERED_ACCESS,
            );
        }
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;
        self.wait_for_gpu()
    }

    /// Three-phase state takeover from `previous`, which may live on another
    /// adapter. Positions come straight out of the previous shared heap; the
    /// velocities have no shareable home of their own, so the previous
    /// engine stages them through its shared position buffers after the
    /// positions have been pulled out.
    fn copy_state(&mut self, previous: &mut ComputeEngine) -> Result<()> {
        if previous.async_mode {
            return Err(Error::InvalidArgument(
                "previous engine is still aliasing renderer buffers",
            ));
        }
        if previous.num_particles != self.num_particles {
            return Err(Error::InvalidArgument(
                "particle counts differ between engines",
            ));
        }

        let shared_heap =
            self.device.open_shared_heap_handle(previous.heap_handle)?;
        let staging = [
            open_staging_buffer(&self.device, &shared_heap, 0, previous.aligned_data_size, self.buffer_size)?,
            open_staging_buffer(&self.device, &shared_heap, 1, previous.aligned_data_size, self.buffer_size)?,
        ];

        // Phase 1: pull positions.
        self.command_allocators[0].reset()?;
        self.command_list.reset(&self.command_allocators[0], None)?;
        for index in 0..NUM_BUFFERS {
            self.command_list.resource_barrier_transition(
                &self.position_buffers[index],
                ResourceStates::UNORDERED_ACCESS,
                ResourceStates::COPY_DEST,
            );
            self.command_list.copy_buffer_region(
                &self.position_buffers[index],
                0,
                &staging[index],
                0,
                self.buffer_size,
            );
            self.command_list.resource_barrier_transition(
                &self.position_buffers[index],
                ResourceStates::COPY_DEST,
                ResourceStates::COPY_SOURCE,
            );
        }
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;
        self.wait_for_gpu()?;

        // Phase 2: the previous engine parks its velocities in the shared
        // position buffers, which phase 1 has already drained.
        previous.stage_velocities_for_copy()?;

        // Phase 3: pull velocities out of the same staging views.
        self.command_allocators[0].reset()?;
        self.command_list.reset(&self.command_allocators[0], None)?;
        for index in 0..NUM_BUFFERS {
            self.command_list.resource_barrier_transition(
                &self.velocity_buffers[index],
                ResourceStates::UNORDERED_ACCESS,
                ResourceStates::COPY_DEST,
            );
            self.command_list.copy_buffer_region(
                &self.velocity_buffers[index],
                0,
                &staging[index],
                0,
                self.velocity_buffer_size,
            );
            self.command_list.resource_barrier_transition(
                &self.velocity_buffers[index],
                ResourceStates::COPY_DEST,
                ResourceStates::UNORDERED_ACCESS,
            );
        }
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;
        self.wait_for_gpu()?;

        self.buffer_index = previous.buffer_index;
        info!(
            "compute state copied forward from {}",
            previous.device.adapter_desc().description
        );
        Ok(())
    }

    fn stage_velocities_for_copy(&mut self) -> Result<()> {
        self.command_allocators[0].reset()?;
        self.command_list.reset(&self.command_allocators[0], None)?;
        for index in 0..NUM_BUFFERS {
            self.command_list.resource_barrier_transition(
                &self.position_buffers[index],
                ResourceStates::COPY_SOURCE,
                ResourceStates::COPY_DEST,
            );
            self.command_list.copy_buffer_region(
                &self.position_buffers[index],
                0,
                &self.velocity_buffers[index],
                0,
                self.velocity_buffer_size,
            );
            self.command_list.resource_barrier_transition(
                &self.position_buffers[index],
                ResourceStates::COPY_DEST,
                ResourceStates::COPY_SOURCE,
            );
        }
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;
        self.wait_for_gpu()
    }

    /// One simulation step. `consumer_fence_value` is the fence value the
    /// consumer will signal for the frame currently in flight; waiting for
    /// `consumer_fence_value - 1` keeps exactly one frame of pipelining and
    /// guarantees the slot being overwritten is no longer being read.
    pub fn simulate(
        &mut self,
        num_active: u32,
        consumer_fence_value: u64,
    ) -> Result<()> {
        let consumer = self.consumer_fence.as_ref().ok_or(
            Error::InvalidArgument("shared handles have not been exchanged"),
        )?;
        self.command_queue
            .wait(consumer, consumer_fence_value.saturating_sub(1))?;

        let read_index = self.buffer_index;
        let write_index = 1 - read_index;
        let active = num_active.min(self.num_particles);
        let thread_groups = (active + BLOCK_SIZE - 1) / BLOCK_SIZE;

        self.command_allocators[read_index].reset()?;
        self.command_list
            .reset(&self.command_allocators[read_index], Some(&self.pipeline))?;
        self.timer.begin_timer(&mut self.command_list, 0);
        self.command_list.dispatch_n_body(
            &self.pipeline,
            &self.position_buffers[read_index],
            &self.position_buffers[write_index],
            &self.velocity_buffers[read_index],
            &self.velocity_buffers[write_index],
            thread_groups,
        );
        self.command_list
            .resource_barrier_uav(&self.position_buffers[write_index]);
        self.command_list
            .resource_barrier_uav(&self.velocity_buffers[write_index]);
        self.timer.end_timer(&mut self.command_list, 0);
        self.timer.resolve_all_timers(&mut self.command_list)?;
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;

        trace!(
            "simulate: {} active, slot {} -> {}, signal {}",
            active, read_index, write_index, self.fence_value
        );
        self.last_write_index = Some(write_index);
        self.command_queue.signal(&self.fence, self.fence_value)?;
        self.fence_value += 1;
        self.buffer_index = write_index;
        Ok(())
    }

    /// Opens the consumer's fence and returns everything the consumer needs
    /// to attach to this engine's shared heap.
    pub fn shared_handles(
        &mut self,
        consumer_fence_handle: SharedHandle,
    ) -> Result<SharedHandles> {
        let consumer =
            self.device.open_shared_fence_handle(consumer_fence_handle)?;
        self.consumer_fence = Some(consumer);
        Ok(SharedHandles {
            heap: self.heap_handle,
            fence: self.fence_handle,
            aligned_data_size: self.aligned_data_size,
            buffer_index: self.buffer_index as u32,
        })
    }

    /// Same-adapter mode: simulate directly into the renderer's local
    /// buffers and treat the render fence as the consumer fence, dropping
    /// the cross-adapter copy entirely.
    pub fn set_async(
        &mut self,
        consumer_fence: Fence,
        buffers: [Resource; NUM_BUFFERS],
        buffer_index: u32,
    ) -> Result<()> {
        if self.async_mode {
            return Ok(());
        }
        let adapter = self.device.adapter_id();
        if consumer_fence.adapter_id() != adapter
            || buffers.iter().any(|buffer| buffer.adapter_id() != adapter)
        {
            return Err(Error::DeviceMismatch);
        }
        self.original_position_buffers = Some(std::mem::replace(
            &mut self.position_buffers,
            buffers,
        ));
        self.buffer_index = buffer_index as usize;
        self.consumer_fence = Some(consumer_fence);
        self.async_mode = true;
        info!("compute engine aliasing renderer buffers (async-compute mode)");
        Ok(())
    }

    /// Leaves async-compute mode: the freshest state lives in the aliased
    /// renderer buffers, so copy it back into the original shared buffers
    /// before handing them to anyone else.
    pub fn reset_from_async(&mut self) -> Result<()> {
        if !self.async_mode {
            return Ok(());
        }
        let originals = self.original_position_buffers.take().ok_or(
            Error::InvalidArgument("async mode without saved buffers"),
        )?;

        self.command_allocators[0].reset()?;
        self.command_list.reset(&self.command_allocators[0], None)?;
        for index in 0..NUM_BUFFERS {
            self.command_list.resource_barrier_transition(
                &originals[index],
                ResourceStates::COPY_SOURCE,
                ResourceStates::COPY_DEST,
            );
            self.command_list.copy_buffer_region(
                &originals[index],
                0,
                &self.position_buffers[index],
                0,
                self.buffer_size,
            );
            self.command_list.resource_barrier_transition(
                &originals[index],
                ResourceStates::COPY_DEST,
                ResourceStates::COPY_SOURCE,
            );
        }
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;
        self.wait_for_gpu()?;

        self.position_buffers = originals;
        self.async_mode = false;
        self.consumer_fence = None;
        info!("compute engine restored its own shared buffers");
        Ok(())
    }

    /// Recreates the compute queue with or without the vendor extension.
    /// The caller must have drained the engine first; the old queue is
    /// dropped with its timeline assumed empty.
    pub fn set_use_queue_extension(&mut self, enabled: bool) -> Result<()> {
        let target = enabled && self.extension.enabled();
        if target == self.using_extension {
            return Ok(());
        }
        self.command_queue =
            create_compute_queue(&self.device, &self.extension, target)?;
        let mut timer = GpuTimer::new(
            &self.device,
            &self.command_queue,
            1,
            DEFAULT_AVERAGE_OVER,
        )?;
        timer.set_timer_name(0, "simulate ms");
        self.timer = timer;
        self.using_extension = target;
        info!(
            "compute queue recreated, extension {}",
            if target { "on" } else { "off" }
        );
        Ok(())
    }

    pub fn wait_for_gpu(&mut self) -> Result<()> {
        self.command_queue.signal(&self.fence, self.fence_value)?;
        let event = self.fence.set_event_on_completion(self.fence_value)?;
        self.fence_value += 1;
        event.wait()
    }

    /// Next value the simulate signal will use; the renderer threads this
    /// through its copy-queue wait.
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn buffer_index(&self) -> u32 {
        self.buffer_index as u32
    }

    pub fn last_write_index(&self) -> Option<usize> {
        self.last_write_index
    }

    pub fn is_async_mode(&self) -> bool {
        self.async_mode
    }

    pub fn using_extension(&self) -> bool {
        self.using_extension
    }

    pub fn extension_available(&self) -> bool {
        self.extension.enabled()
    }

    pub fn position_buffers(&self) -> &[Resource; NUM_BUFFERS] {
        &self.position_buffers
    }

    pub fn velocity_buffers(&self) -> &[Resource; NUM_BUFFERS] {
        &self.velocity_buffers
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_particles(&self) -> u32 {
        self.num_particles
    }

    pub fn gpu_times(&self) -> &[(f32, String)] {
        self.timer.times()
    }
}

impl Drop for ComputeEngine {
    fn drop(&mut self) {
        if let Err(err) = self.wait_for_gpu() {
            error!("compute engine drain on drop failed: {}", err);
        }
        for handle in [self.heap_handle, self.fence_handle] {
            if let Err(err) = self.device.close_shared_handle(handle) {
                error!("closing shared handle on drop failed: {}", err);
            }
        }
    }
}

fn create_compute_queue(
    device: &Device,
    extension: &QueueExtension,
    use_extension: bool,
) -> Result<CommandQueue> {
    let desc = CommandQueueDesc::default().set_type(CommandListType::Compute);
    if use_extension {
        extension.create_command_queue(device, &desc)
    } else {
        device.create_command_queue(&desc)
    }
}

fn create_position_buffer(
    device: &Device,
    heap: &Heap,
    index: u64,
    aligned_data_size: u64,
    buffer_size: u64,
) -> Result<Resource> {
    device.create_placed_buffer(
        heap,
        index * aligned_data_size,
        &BufferDesc::new(buffer_size)
            .set_flags(
                ResourceFlags::ALLOW_UNORDERED_ACCESS
                    | ResourceFlags::ALLOW_CROSS_ADAPTER,
            )
            .set_initial_state(ResourceStates::UNORDERED_ACCESS),
    )
}

fn create_velocity_buffer(device: &Device, size: u64) -> Result<Resource> {
    device.create_committed_buffer(
        &BufferDesc::new(size)
            .set_flags(ResourceFlags::ALLOW_UNORDERED_ACCESS)
            .set_initial_state(ResourceStates::UNORDERED_ACCESS),
    )
}

fn open_staging_buffer(
    device: &Device,
    heap: &Heap,
    index: u64,
    aligned_data_size: u64,
    buffer_size: u64,
) -> Result<Resource> {
    device.create_placed_buffer(
        heap,
        index * aligned_data_size,
        &BufferDesc::new(buffer_size)
            .set_flags(ResourceFlags::ALLOW_CROSS_ADAPTER)
            .set_initial_state(ResourceStates::COPY_SOURCE),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{AdapterDesc, Factory};

    fn factory() -> Factory {
        Factory::new(vec![AdapterDesc {
            description: "Test Integrated".to_string(),
            vendor_id: 0x8086,
            is_software: false,
            is_uma: true,
            supports_queue_extension: true,
        }])
    }

    #[test]
    fn simulate_requires_a_handle_exchange() {
        let factory = factory();
        let adapter = &factory.enum_adapters()[0];
        let mut engine =
            ComputeEngine::new(adapter, 256, false, 0, None).unwrap();
        assert!(matches!(
            engine.simulate(256, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn construction_seeds_both_ping_pong_slots_identically() {
        let factory = factory();
        let adapter = &factory.enum_adapters()[0];
        let engine = ComputeEngine::new(adapter, 256, false, 5, None).unwrap();
        factory.flush();
        let size = 256 * PARTICLE_SIZE_IN_BYTES;
        let slot0 = engine.position_buffers()[0].read(0, size).unwrap();
        let slot1 = engine.position_buffers()[1].read(0, size).unwrap();
        assert_eq!(slot0, slot1);
        assert_ne!(slot0, vec![0u8; size as usize]);
    }

    #[test]
    fn extension_toggle_recreates_the_queue() {
        let factory = factory();
        let adapter = &factory.enum_adapters()[0];
        let mut engine =
            ComputeEngine::new(adapter, 256, true, 0, None).unwrap();
        assert!(engine.using_extension());
        engine.wait_for_gpu().unwrap();
        engine.set_use_queue_extension(false).unwrap();
        assert!(!engine.using_extension());
        engine.wait_for_gpu().unwrap();
    }
}

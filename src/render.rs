//! Presentation side of the cross-adapter pipeline.
//!
//! The render engine runs two queues on the discrete adapter: a copy queue
//! that pulls each simulated generation out of the producer's shared heap
//! into device-local buffers, and the graphics queue that draws from the
//! local slot filled one frame earlier. Three fences couple the timelines:
//! the producer's shared fence gates the copy, the render fence keeps the
//! copy one frame behind the draws, and the shared copy fence is both what
//! the graphics queue retires against and what the producer uses for
//! backpressure.

use cgmath::{perspective, Deg, Matrix4, Point3, SquareMatrix, Vector3};
use log::{error, info, trace};
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::extension::QueueExtension;
use crate::gpu::timer::{GpuTimer, DEFAULT_AVERAGE_OVER};
use crate::gpu::{
    Adapter, BufferDesc, CommandAllocator, CommandList, CommandListType,
    CommandQueue, CommandQueueDesc, Device, Event, Fence, FenceFlags,
    HeapType, PresentFlags, Resource, ResourceStates, SharedHandle,
    SharedHandles, SurfaceDesc, SwapChain, SwapChainDesc,
};
use crate::particle::{
    INITIAL_PARTICLE_INTENSITY, INITIAL_PARTICLE_SIZE, NUM_BUFFERS,
    PARTICLE_SIZE_IN_BYTES,
};

/// Frames in flight; equal to the swap-chain depth.
pub const NUM_FRAMES: usize = 2;

const CONSTANT_BUFFER_STRIDE: u64 = 256;

#[repr(C)]
struct ConstantBufferGs {
    world_view_projection: Matrix4<f32>,
    inverse_view: Matrix4<f32>,
    particle_size: f32,
    particle_intensity: f32,
    padding: [f32; 30],
}

const_assert_eq!(
    std::mem::size_of::<ConstantBufferGs>(),
    CONSTANT_BUFFER_STRIDE as usize
);

struct Camera {
    position: Point3<f32>,
    look_at: Point3<f32>,
}

impl Camera {
    fn new() -> Self {
        Self {
            position: Point3::new(0.0, 0.0, 1500.0),
            look_at: Point3::new(0.0, 0.0, 0.0),
        }
    }

    fn view(&self) -> Matrix4<f32> {
        Matrix4::look_at(
            self.position,
            self.look_at,
            Vector3::new(0.0, 1.0, 0.0),
        )
    }

    fn projection(&self, aspect: f32) -> Matrix4<f32> {
        perspective(Deg(60.0), aspect, 1.0, 5000.0)
    }
}

pub struct RenderEngine {
    device: Device,
    extension: QueueExtension,
    using_extension: bool,
    command_queue: CommandQueue,
    copy_queue: CommandQueue,

    swap_chain: SwapChain,
    render_targets: [Resource; NUM_FRAMES],
    full_screen: bool,
    windowed_supports_tearing: bool,
    aspect_ratio: f32,

    command_allocators: [CommandAllocator; NUM_FRAMES],
    copy_allocators: [CommandAllocator; NUM_FRAMES],
    command_list: CommandList,
    copy_command_list: CommandList,

    buffers: [Resource; NUM_BUFFERS],
    buffer_size: u64,
    vertex_buffer: Resource,
    constant_buffer: Resource,
    shared_buffers: Option<[Resource; NUM_BUFFERS]>,
    shared_compute_fence: Option<Fence>,
    shared_buffer_index: usize,
    current_buffer_index: usize,
    last_copy_source_index: Option<usize>,
    last_draw_index: Option<usize>,

    frame_index: usize,
    render_fence: Fence,
    render_fence_value: u64,
    frame_fence_values: [u64; NUM_FRAMES],
    copy_fence: Fence,
    copy_fence_handle: SharedHandle,
    copy_fence_value: u64,

    camera: Camera,
    num_particles: u32,
    particle_size: f32,
    particle_intensity: f32,
    async_mode: bool,
    timer: GpuTimer,
}

impl RenderEngine {
    pub fn new(
        adapter: &Adapter,
        surface: &SurfaceDesc,
        num_particles: u32,
        use_extension: bool,
        full_screen: bool,
    ) -> Result<Self> {
        let device = Device::new(adapter)?;
        let extension = QueueExtension::new(&device);
        let using_extension = use_extension && extension.enabled();
        let command_queue = if using_extension {
            extension.create_command_queue(
                &device,
                &CommandQueueDesc::default()
                    .set_type(CommandListType::Direct),
            )?
        } else {
            device.create_command_queue(
                &CommandQueueDesc::default()
                    .set_type(CommandListType::Direct),
            )?
        };
        let copy_queue = device.create_command_queue(
            &CommandQueueDesc::default().set_type(CommandListType::Copy),
        )?;

        let windowed_supports_tearing = surface.allow_tearing;
        let swap_chain = device.create_swap_chain(
            &command_queue,
            &SwapChainDesc {
                buffer_count: NUM_FRAMES as u32,
                width: surface.width,
                height: surface.height,
                allow_tearing: windowed_supports_tearing && !full_screen,
            },
        )?;
        let render_targets = [swap_chain.buffer(0), swap_chain.buffer(1)];
        let frame_index = swap_chain.current_back_buffer_index() as usize;

        let command_allocators = [
            device.create_command_allocator(CommandListType::Direct)?,
            device.create_command_allocator(CommandListType::Direct)?,
        ];
        let copy_allocators = [
            device.create_command_allocator(CommandListType::Copy)?,
            device.create_command_allocator(CommandListType::Copy)?,
        ];
        let mut command_list =
            device.create_command_list(CommandListType::Direct)?;
        let mut copy_command_list =
            device.create_command_list(CommandListType::Copy)?;
        copy_command_list.close()?;

        let buffer_size = num_particles as u64 * PARTICLE_SIZE_IN_BYTES;
        let buffers = [
            create_local_buffer(&device, buffer_size)?,
            create_local_buffer(&device, buffer_size)?,
        ];

        // Per-particle color, uploaded once on the still-open initial list.
        let vertex_buffer = device.create_committed_buffer(
            &BufferDesc::new(buffer_size)
                .set_initial_state(ResourceStates::COPY_DEST),
        )?;
        let vertex_upload = device.create_committed_buffer(
            &BufferDesc::new(buffer_size).set_heap_type(HeapType::Upload),
        )?;
        vertex_upload.write(0, &particle_colors(num_particles))?;
        command_list.copy_buffer_region(
            &vertex_buffer,
            0,
            &vertex_upload,
            0,
            buffer_size,
        );
        command_list.resource_barrier_transition(
            &vertex_buffer,
            ResourceStates::COPY_DEST,
            ResourceStates::VERTEX_AND_CONSTANT_BUFFER,
        );
        command_list.close()?;

        let constant_buffer = device.create_committed_buffer(
            &BufferDesc::new(NUM_FRAMES as u64 * CONSTANT_BUFFER_STRIDE)
                .set_heap_type(HeapType::Upload),
        )?;

        let render_fence = device.create_fence(0, FenceFlags::NONE)?;
        let copy_fence = device.create_fence(
            0,
            FenceFlags::SHARED | FenceFlags::SHARED_CROSS_ADAPTER,
        )?;
        let copy_fence_handle =
            device.create_shared_handle_for_fence(&copy_fence)?;

        let mut timer =
            GpuTimer::new(&device, &command_queue, 1, DEFAULT_AVERAGE_OVER)?;
        timer.set_timer_name(0, "render ms");

        let mut engine = Self {
            device,
            extension,
            using_extension,
            command_queue,
            copy_queue,
            swap_chain,
            render_targets,
            full_screen,
            windowed_supports_tearing,
            aspect_ratio: surface.width as f32 / surface.height.max(1) as f32,
            command_allocators,
            copy_allocators,
            command_list,
            copy_command_list,
            buffers,
            buffer_size,
            vertex_buffer,
            constant_buffer,
            shared_buffers: None,
            shared_compute_fence: None,
            shared_buffer_index: 0,
            current_buffer_index: 0,
            last_copy_source_index: None,
            last_draw_index: None,
            frame_index,
            render_fence,
            render_fence_value: 1,
            frame_fence_values: [0; NUM_FRAMES],
            copy_fence,
            copy_fence_handle,
            copy_fence_value: 0,
            camera: Camera::new(),
            num_particles,
            particle_size: INITIAL_PARTICLE_SIZE,
            particle_intensity: INITIAL_PARTICLE_INTENSITY,
            async_mode: false,
            timer,
        };

        engine
            .command_queue
            .execute_command_lists(std::slice::from_ref(&engine.command_list))?;
        engine.wait_for_gpu()?;
        info!(
            "render engine ready on {} ({}x{}, fullscreen {}, extension {})",
            engine.device.adapter_desc().description,
            surface.width,
            surface.height,
            full_screen,
            if engine.using_extension { "on" } else { "off" },
        );
        Ok(engine)
    }

    /// Handle the producer opens to get the copy fence it backpressures on.
    pub fn shared_fence_handle(&self) -> SharedHandle {
        self.copy_fence_handle
    }

    /// Attaches to the producer's shared heap: opens the heap and fence,
    /// creates placed views over both slots and primes the local buffers
    /// with a one-time copy on the graphics queue.
    pub fn set_shared(&mut self, handles: SharedHandles) -> Result<()> {
        let heap = self.device.open_shared_heap_handle(handles.heap)?;
        self.shared_compute_fence =
            Some(self.device.open_shared_fence_handle(handles.fence)?);
        let shared_buffers = [
            open_shared_buffer(&self.device, &heap, 0, handles.aligned_data_size, self.buffer_size)?,
            open_shared_buffer(&self.device, &heap, 1, handles.aligned_data_size, self.buffer_size)?,
        ];
        self.shared_buffer_index = handles.buffer_index as usize;

        self.command_allocators[self.frame_index].reset()?;
        self.command_list
            .reset(&self.command_allocators[self.frame_index], None)?;
        for index in 0..NUM_BUFFERS {
            self.command_list.copy_buffer_region(
                &self.buffers[index],
                0,
                &shared_buffers[index],
                0,
                self.buffer_size,
            );
        }
        self.command_list.close()?;
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;
        self.shared_buffers = Some(shared_buffers);
        self.wait_for_gpu()?;
        trace!(
            "attached to shared heap, starting at slot {}",
            self.shared_buffer_index
        );
        Ok(())
    }

    /// Pulls the previous frame's simulation result into the local slot the
    /// next frame will draw. Two waits and one signal couple the three
    /// timelines:
    ///   1. wait for the previous render signal, keeping the copy one frame
    ///      behind the draws so it never lands in a slot being read;
    ///   2. after the copy, wait for the producer fence to reach
    ///      `fence_value`; queued FIFO, this wait stands between the next
    ///      frame's copy and the dispatch filling its source slot;
    ///   3. signal the copy fence, which both the graphics queue and the
    ///      producer's backpressure wait observe.
    fn copy_simulation_results(
        &mut self,
        fence_value: u64,
        num_copied: u32,
    ) -> Result<()> {
        let shared_buffers = self.shared_buffers.as_ref().ok_or(
            Error::InvalidArgument("shared handles have not been exchanged"),
        )?;
        let compute_fence = self.shared_compute_fence.as_ref().ok_or(
            Error::InvalidArgument("shared handles have not been exchanged"),
        )?;

        self.copy_queue
            .wait(&self.render_fence, self.render_fence_value - 1)?;

        // The producer's index names the slot its last dispatch filled; the
        // dispatch in flight owns the other one.
        let source_index = self.shared_buffer_index;
        let dest_index = 1 - self.current_buffer_index;
        self.shared_buffer_index = 1 - source_index;

        self.copy_allocators[self.frame_index].reset()?;
        self.copy_command_list
            .reset(&self.copy_allocators[self.frame_index], None)?;
        self.copy_command_list
            .resource_barrier_uav(&shared_buffers[source_index]);
        let copied_bytes =
            num_copied.min(self.num_particles) as u64 * PARTICLE_SIZE_IN_BYTES;
        self.copy_command_list.copy_buffer_region(
            &self.buffers[dest_index],
            0,
            &shared_buffers[source_index],
            0,
            copied_bytes,
        );
        self.copy_command_list.close()?;
        self.copy_queue.execute_command_lists(std::slice::from_ref(
            &self.copy_command_list,
        ))?;

        self.copy_queue.wait(compute_fence, fence_value)?;
        self.copy_fence_value += 1;
        self.copy_queue.signal(&self.copy_fence, self.copy_fence_value)?;
        self.last_copy_source_index = Some(source_index);
        trace!(
            "copy: shared slot {} -> local slot {} ({} bytes), signal {}",
            source_index, dest_index, copied_bytes, self.copy_fence_value
        );
        Ok(())
    }

    /// Records and submits one frame. `fence_value` carries the producer's
    /// upcoming signal value in and the consumer fence value the producer
    /// must backpressure on out. The returned event, when present, is the
    /// single host wait for the whole frame.
    pub fn draw(
        &mut self,
        num_active: u32,
        fence_value: &mut u64,
        num_copied: u32,
        vsync: bool,
        show_overlay: bool,
    ) -> Result<Option<Event>> {
        self.update_constant_buffer()?;

        if !self.async_mode {
            self.copy_simulation_results(*fence_value, num_copied)?;
        }

        let frame = self.frame_index;
        self.command_allocators[frame].reset()?;
        self.command_list.reset(&self.command_allocators[frame], None)?;
        let draw_index = self.current_buffer_index;
        let target = &self.render_targets[frame];

        self.timer.begin_timer(&mut self.command_list, 0);
        self.command_list.resource_barrier_transition(
            target,
            ResourceStates::COMMON_OR_PRESENT,
            ResourceStates::RENDER_TARGET,
        );
        self.command_list.clear_render_target(target);
        self.command_list.resource_barrier_transition(
            &self.buffers[draw_index],
            ResourceStates::COPY_DEST,
            ResourceStates::NON_PIXEL_SHADER_RESOURCE,
        );
        self.command_list.draw_particles(
            &self.buffers[draw_index],
            &self.vertex_buffer,
            &self.constant_buffer,
            num_active.min(self.num_particles),
            target,
        );
        if show_overlay {
            self.command_list.draw_overlay(target);
        }
        self.command_list.resource_barrier_transition(
            &self.buffers[draw_index],
            ResourceStates::NON_PIXEL_SHADER_RESOURCE,
            ResourceStates::COPY_DEST,
        );
        self.command_list.resource_barrier_transition(
            target,
            ResourceStates::RENDER_TARGET,
            ResourceStates::COMMON_OR_PRESENT,
        );
        self.timer.end_timer(&mut self.command_list, 0);
        self.timer.resolve_all_timers(&mut self.command_list)?;
        self.command_list.close()?;

        if self.async_mode {
            // Aliased mode: the slot being drawn was written directly by the
            // producer's previous dispatch; gate on its signal.
            let compute_fence = self.shared_compute_fence.as_ref().ok_or(
                Error::InvalidArgument(
                    "shared handles have not been exchanged",
                ),
            )?;
            self.command_queue
                .wait(compute_fence, fence_value.saturating_sub(1))?;
        } else {
            self.command_queue
                .wait(&self.copy_fence, self.copy_fence_value)?;
        }
        self.command_queue
            .execute_command_lists(std::slice::from_ref(&self.command_list))?;

        let sync_interval = u32::from(vsync);
        let present_flags = if self.windowed_supports_tearing
            && !self.full_screen
            && !vsync
        {
            PresentFlags::ALLOW_TEARING
        } else {
            PresentFlags::NONE
        };
        self.swap_chain.present(sync_interval, present_flags)?;

        self.last_draw_index = Some(draw_index);
        self.current_buffer_index = 1 - draw_index;
        *fence_value = if self.async_mode {
            self.render_fence_value
        } else {
            self.copy_fence_value
        };
        trace!("draw: local slot {}, frame {}", draw_index, frame);
        self.move_to_next_frame()
    }

    fn update_constant_buffer(&mut self) -> Result<()> {
        let view = self.camera.view();
        let projection = self.camera.projection(self.aspect_ratio);
        let constants = ConstantBufferGs {
            world_view_projection: projection * view,
            inverse_view: view.invert().unwrap_or_else(Matrix4::identity),
            particle_size: self.particle_size,
            particle_intensity: self.particle_intensity,
            padding: [0.0; 30],
        };
        self.constant_buffer.write(
            self.frame_index as u64 * CONSTANT_BUFFER_STRIDE,
            &constant_buffer_bytes(&constants),
        )
    }

    /// Signals the render fence for the finished frame and hands back a wait
    /// handle only if the frame about to be reused is still in flight.
    fn move_to_next_frame(&mut self) -> Result<Option<Event>> {
        self.frame_fence_values[self.frame_index] = self.render_fence_value;
        self.command_queue
            .signal(&self.render_fence, self.render_fence_value)?;
        self.render_fence_value += 1;
        self.frame_index =
            self.swap_chain.current_back_buffer_index() as usize;
        let pending = self.frame_fence_values[self.frame_index];
        if self.render_fence.completed_value() < pending {
            Ok(Some(self.render_fence.set_event_on_completion(pending)?))
        } else {
            Ok(None)
        }
    }

    /// Drains both queues through the copy fence, then the graphics queue
    /// through the render fence.
    pub fn wait_for_gpu(&mut self) -> Result<()> {
        self.copy_fence_value += 1;
        self.copy_queue.signal(&self.copy_fence, self.copy_fence_value)?;
        self.command_queue.wait(&self.copy_fence, self.copy_fence_value)?;
        self.command_queue
            .signal(&self.render_fence, self.render_fence_value)?;
        let event = self
            .render_fence
            .set_event_on_completion(self.render_fence_value)?;
        self.render_fence_value += 1;
        event.wait()
    }

    pub fn set_async_mode(&mut self, async_mode: bool) {
        self.async_mode = async_mode;
    }

    pub fn is_async_mode(&self) -> bool {
        self.async_mode
    }

    /// Render fence, handed to the producer as the consumer fence in
    /// async-compute mode.
    pub fn fence(&self) -> Fence {
        self.render_fence.clone()
    }

    /// Local ping-pong pair, aliased by the producer in async-compute mode.
    pub fn buffers(&self) -> [Resource; NUM_BUFFERS] {
        self.buffers.clone()
    }

    pub fn buffer_index(&self) -> u32 {
        self.current_buffer_index as u32
    }

    pub fn shared_buffers(&self) -> Option<&[Resource; NUM_BUFFERS]> {
        self.shared_buffers.as_ref()
    }

    pub fn last_copy_source_index(&self) -> Option<usize> {
        self.last_copy_source_index
    }

    pub fn last_draw_index(&self) -> Option<usize> {
        self.last_draw_index
    }

    pub fn supports_extension(&self) -> bool {
        self.extension.enabled()
    }

    pub fn using_extension(&self) -> bool {
        self.using_extension
    }

    pub fn is_full_screen(&self) -> bool {
        self.full_screen
    }

    pub fn set_particle_size(&mut self, size: f32) {
        self.particle_size = size;
    }

    pub fn set_particle_intensity(&mut self, intensity: f32) {
        self.particle_intensity = intensity;
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn gpu_times(&self) -> &[(f32, String)] {
        self.timer.times()
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        if let Err(err) = self.wait_for_gpu() {
            error!("render engine drain on drop failed: {}", err);
        }
        if let Err(err) =
            self.device.close_shared_handle(self.copy_fence_handle)
        {
            error!("closing shared handle on drop failed: {}", err);
        }
    }
}

fn create_local_buffer(device: &Device, size: u64) -> Result<Resource> {
    device.create_committed_buffer(
        &BufferDesc::new(size)
            .set_initial_state(ResourceStates::COPY_DEST),
    )
}

fn open_shared_buffer(
    device: &Device,
    heap: &crate::gpu::Heap,
    index: u64,
    aligned_data_size: u64,
    buffer_size: u64,
) -> Result<Resource> {
    device.create_placed_buffer(
        heap,
        index * aligned_data_size,
        &BufferDesc::new(buffer_size)
            .set_flags(crate::gpu::ResourceFlags::ALLOW_CROSS_ADAPTER)
            .set_initial_state(ResourceStates::COPY_SOURCE),
    )
}

fn particle_colors(num_particles: u32) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(num_particles as usize * PARTICLE_SIZE_IN_BYTES as usize);
    for _ in 0..num_particles {
        for component in [1.0f32, 1.0, 0.2, 1.0] {
            bytes.extend_from_slice(&component.to_le_bytes());
        }
    }
    bytes
}

fn constant_buffer_bytes(constants: &ConstantBufferGs) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CONSTANT_BUFFER_STRIDE as usize);
    for matrix in [
        &constants.world_view_projection,
        &constants.inverse_view,
    ] {
        let columns: [[f32; 4]; 4] = (*matrix).into();
        for column in &columns {
            for component in column {
                bytes.extend_from_slice(&component.to_le_bytes());
            }
        }
    }
    bytes.extend_from_slice(&constants.particle_size.to_le_bytes());
    bytes.extend_from_slice(&constants.particle_intensity.to_le_bytes());
    for value in &constants.padding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_buffer_serializes_to_its_stride() {
        let constants = ConstantBufferGs {
            world_view_projection: Matrix4::identity(),
            inverse_view: Matrix4::identity(),
            particle_size: INITIAL_PARTICLE_SIZE,
            particle_intensity: INITIAL_PARTICLE_INTENSITY,
            padding: [0.0; 30],
        };
        assert_eq!(
            constant_buffer_bytes(&constants).len() as u64,
            CONSTANT_BUFFER_STRIDE
        );
    }
}

//! Software realization of the device layer.
//!
//! One `Factory` owns the whole machine state behind a mutex: adapters,
//! fences, heaps, resources, queues and the shared-handle table. Every queue
//! carries a FIFO timeline of ops; an op retires only once everything ahead
//! of it has retired and, for waits, once the fence has reached the target
//! value. `pump` drains all runnable ops to quiescence, which makes the
//! schedule deterministic: a host-side wait either completes or proves that
//! no interleaving can complete it, and the latter surfaces as
//! `Error::DeviceHung` instead of a real hang.
//!
//! Validation findings (bad transitions, out-of-bounds copies, commands on
//! the wrong queue kind) latch the device into a removed state, the way the
//! native debug layer escalates to `DEVICE_REMOVED`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{error, trace};

use crate::error::{Error, Result};
use crate::particle::{self, PARTICLE_SIZE_IN_BYTES, VELOCITY_SIZE_IN_BYTES};

use super::{
    AdapterDesc, AdapterId, ArchitectureInfo, BufferDesc, CommandListType,
    CommandQueueDesc, ComputePipelineDesc, FenceFlags, HeapDesc, HeapFlags,
    HeapType, PresentFlags, ResourceFlags, ResourceStates, SharedHandle,
    SwapChainDesc, ThrottlePolicy, align_to_multiple,
    RESOURCE_PLACEMENT_ALIGNMENT, TIMESTAMP_FREQUENCY,
};

type Shared = Arc<Mutex<GpuState>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) usize);

/// What a retired op did to a resource, as seen by the scheduler. Tests use
/// the log to check who touched which ping-pong slot and in what order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessKind {
    CopyRead,
    CopyWrite,
    DispatchRead,
    DispatchWrite,
    DrawRead,
    TargetWrite,
}

#[derive(Clone, Debug)]
pub struct AccessRecord {
    pub queue: CommandListType,
    pub kind: AccessKind,
    pub resource: ResourceId,
    pub offset: u64,
    pub len: u64,
    pub tick: u64,
}

#[derive(Clone, Debug)]
enum Command {
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        num_bytes: u64,
    },
    Transition {
        resource: ResourceId,
        state_before: ResourceStates,
        state_after: ResourceStates,
    },
    UavBarrier {
        resource: ResourceId,
    },
    DispatchNBody {
        pipeline: usize,
        src_positions: ResourceId,
        dst_positions: ResourceId,
        src_velocities: ResourceId,
        dst_velocities: ResourceId,
        thread_groups: u32,
    },
    ClearRenderTarget {
        target: ResourceId,
    },
    DrawParticles {
        positions: ResourceId,
        vertex_buffer: ResourceId,
        constant_buffer: ResourceId,
        num_vertices: u32,
        target: ResourceId,
    },
    OverlayMarker {
        target: ResourceId,
    },
    EndTimestampQuery {
        query_heap: usize,
        index: u32,
    },
    ResolveQueryData {
        query_heap: usize,
        start: u32,
        count: u32,
        dst: ResourceId,
        dst_offset: u64,
    },
}

#[derive(Clone, Debug)]
enum QueueOp {
    Wait { fence: usize, value: u64 },
    Signal { fence: usize, value: u64 },
    Execute(Vec<Command>),
}

struct FenceState {
    completed: u64,
    flags: FenceFlags,
    adapter: AdapterId,
}

struct HeapState {
    memory: Vec<u8>,
    flags: HeapFlags,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ResourceKind {
    Buffer,
    Texture,
}

enum Storage {
    Committed(Vec<u8>),
    Placed { heap: usize, offset: u64 },
}

struct ResourceState {
    storage: Storage,
    size: u64,
    state: ResourceStates,
    kind: ResourceKind,
    adapter: AdapterId,
}

struct QueueState {
    desc: CommandQueueDesc,
    adapter: AdapterId,
    pending: VecDeque<QueueOp>,
}

struct QueryHeapState {
    timestamps: Vec<u64>,
}

struct SwapChainState {
    desc: SwapChainDesc,
    buffers: Vec<ResourceId>,
    current: u32,
}

enum SharedTarget {
    Heap(usize),
    Fence(usize),
}

struct GpuState {
    adapters: Vec<AdapterDesc>,
    fences: Vec<FenceState>,
    heaps: Vec<HeapState>,
    resources: Vec<ResourceState>,
    queues: Vec<QueueState>,
    pipelines: Vec<ComputePipelineDesc>,
    query_heaps: Vec<QueryHeapState>,
    swap_chains: Vec<SwapChainState>,
    shared_handles: HashMap<u64, SharedTarget>,
    next_handle: u64,
    tick: u64,
    access_log: Vec<AccessRecord>,
    removed: Option<String>,
}

impl GpuState {
    fn check_removed(&self) -> Result<()> {
        match &self.removed {
            Some(reason) => Err(Error::DeviceRemoved(reason.clone())),
            None => Ok(()),
        }
    }

    fn remove_device(&mut self, reason: String) {
        error!("device removed: {}", reason);
        if self.removed.is_none() {
            self.removed = Some(reason);
        }
    }

    /// Retires every runnable op on every queue until no queue can advance.
    fn pump(&mut self) {
        if self.removed.is_some() {
            return;
        }
        loop {
            let mut progress = false;
            for queue_index in 0..self.queues.len() {
                loop {
                    let runnable = match self.queues[queue_index].pending.front() {
                        None => break,
                        Some(QueueOp::Wait { fence, value }) => {
                            self.fences[*fence].completed >= *value
                        }
                        Some(_) => true,
                    };
                    if !runnable {
                        break;
                    }
                    if let Some(op) =
                        self.queues[queue_index].pending.pop_front()
                    {
                        progress = true;
                        self.retire(queue_index, op);
                    }
                    if self.removed.is_some() {
                        return;
                    }
                }
            }
            if !progress {
                break;
            }
        }
    }

    fn retire(&mut self, queue_index: usize, op: QueueOp) {
        let list_type = self.queues[queue_index].desc.list_type;
        match op {
            QueueOp::Wait { .. } => {
                self.tick += 1;
            }
            QueueOp::Signal { fence, value } => {
                self.tick += 1;
                let completed = &mut self.fences[fence].completed;
                if value > *completed {
                    *completed = value;
                }
            }
            QueueOp::Execute(commands) => {
                let mut touched: Vec<ResourceId> = Vec::new();
                for command in commands {
                    self.tick += 1;
                    if let Err(reason) =
                        self.exec_command(list_type, &command, &mut touched)
                    {
                        self.remove_device(reason);
                        return;
                    }
                }
                // Buffers decay to COMMON when the batch retires.
                for id in touched {
                    let resource = &mut self.resources[id.0];
                    if resource.kind == ResourceKind::Buffer {
                        resource.state = ResourceStates::COMMON_OR_PRESENT;
                    }
                }
            }
        }
    }

    fn exec_command(
        &mut self,
        queue: CommandListType,
        command: &Command,
        touched: &mut Vec<ResourceId>,
    ) -> std::result::Result<(), String> {
        match *command {
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                num_bytes,
            } => {
                let bytes =
                    self.read_resource(src, src_offset, num_bytes)?;
                self.write_resource(dst, dst_offset, &bytes)?;
                touched.push(src);
                touched.push(dst);
                self.log_access(queue, AccessKind::CopyRead, src, src_offset, num_bytes);
                self.log_access(queue, AccessKind::CopyWrite, dst, dst_offset, num_bytes);
                Ok(())
            }
            Command::Transition {
                resource,
                state_before,
                state_after,
            } => {
                let current = self.resources[resource.0].state;
                if current != state_before
                    && current != ResourceStates::COMMON_OR_PRESENT
                {
                    return Err(format!(
                        "transition of resource {} declared before-state \
                         {:?} but the tracked state is {:?}",
                        resource.0, state_before, current
                    ));
                }
                self.resources[resource.0].state = state_after;
                Ok(())
            }
            Command::UavBarrier { .. } => Ok(()),
            Command::DispatchNBody {
                pipeline,
                src_positions,
                dst_positions,
                src_velocities,
                dst_velocities,
                thread_groups,
            } => {
                if queue == CommandListType::Copy {
                    return Err(
                        "dispatch recorded on a copy command list".to_string()
                    );
                }
                let desc = self.pipelines[pipeline];
                let count = desc.particle_count as u64;
                let active = (thread_groups as u64 * desc.block_size as u64)
                    .min(count) as usize;
                let pos_bytes = count * PARTICLE_SIZE_IN_BYTES;
                let vel_bytes = count * VELOCITY_SIZE_IN_BYTES;
                let src_pos = self.read_resource(src_positions, 0, pos_bytes)?;
                let src_vel =
                    self.read_resource(src_velocities, 0, vel_bytes)?;
                let (new_pos, new_vel) = particle::step_bytes(
                    &src_pos,
                    &src_vel,
                    active,
                    desc.timestep,
                );
                // Threads outside the dispatch never run, so the tail of the
                // destination slot keeps whatever generation it already held.
                self.write_resource(dst_positions, 0, &new_pos)?;
                self.write_resource(dst_velocities, 0, &new_vel)?;
                touched.push(src_positions);
                touched.push(src_velocities);
                touched.push(dst_positions);
                touched.push(dst_velocities);
                self.log_access(
                    queue,
                    AccessKind::DispatchRead,
                    src_positions,
                    0,
                    pos_bytes,
                );
                self.log_access(
                    queue,
                    AccessKind::DispatchRead,
                    src_velocities,
                    0,
                    vel_bytes,
                );
                self.log_access(
                    queue,
                    AccessKind::DispatchWrite,
                    dst_positions,
                    0,
                    active as u64 * PARTICLE_SIZE_IN_BYTES,
                );
                self.log_access(
                    queue,
                    AccessKind::DispatchWrite,
                    dst_velocities,
                    0,
                    active as u64 * VELOCITY_SIZE_IN_BYTES,
                );
                Ok(())
            }
            Command::ClearRenderTarget { target } => {
                if queue != CommandListType::Direct {
                    return Err(
                        "render target clear outside a direct queue"
                            .to_string(),
                    );
                }
                let size = self.resources[target.0].size;
                self.log_access(queue, AccessKind::TargetWrite, target, 0, size);
                Ok(())
            }
            Command::DrawParticles {
                positions,
                vertex_buffer,
                constant_buffer,
                num_vertices,
                target,
            } => {
                if queue != CommandListType::Direct {
                    return Err("draw outside a direct queue".to_string());
                }
                let pos_bytes =
                    num_vertices as u64 * PARTICLE_SIZE_IN_BYTES;
                if pos_bytes > self.resources[positions.0].size {
                    return Err(format!(
                        "draw reads {} bytes from a {}-byte position buffer",
                        pos_bytes, self.resources[positions.0].size
                    ));
                }
                touched.push(positions);
                touched.push(vertex_buffer);
                touched.push(constant_buffer);
                self.log_access(queue, AccessKind::DrawRead, positions, 0, pos_bytes);
                self.log_access(
                    queue,
                    AccessKind::DrawRead,
                    vertex_buffer,
                    0,
                    pos_bytes,
                );
                self.log_access(
                    queue,
                    AccessKind::DrawRead,
                    constant_buffer,
                    0,
                    self.resources[constant_buffer.0].size,
                );
                let target_size = self.resources[target.0].size;
                self.log_access(queue, AccessKind::TargetWrite, target, 0, target_size);
                Ok(())
            }
            Command::OverlayMarker { target } => {
                let size = self.resources[target.0].size;
                self.log_access(queue, AccessKind::TargetWrite, target, 0, size);
                Ok(())
            }
            Command::EndTimestampQuery { query_heap, index } => {
                let slot = index as usize;
                let heap = &mut self.query_heaps[query_heap];
                if slot >= heap.timestamps.len() {
                    return Err(format!(
                        "timestamp query index {} out of range",
                        index
                    ));
                }
                heap.timestamps[slot] = self.tick;
                Ok(())
            }
            Command::ResolveQueryData {
                query_heap,
                start,
                count,
                dst,
                dst_offset,
            } => {
                let end = (start + count) as usize;
                if end > self.query_heaps[query_heap].timestamps.len() {
                    return Err(format!(
                        "query resolve range {}..{} out of bounds",
                        start, end
                    ));
                }
                let mut bytes = Vec::with_capacity(count as usize * 8);
                for slot in start as usize..end {
                    let stamp = self.query_heaps[query_heap].timestamps[slot];
                    bytes.extend_from_slice(&stamp.to_le_bytes());
                }
                self.write_resource(dst, dst_offset, &bytes)?;
                touched.push(dst);
                Ok(())
            }
        }
    }

    fn log_access(
        &mut self,
        queue: CommandListType,
        kind: AccessKind,
        resource: ResourceId,
        offset: u64,
        len: u64,
    ) {
        self.access_log.push(AccessRecord {
            queue,
            kind,
            resource,
            offset,
            len,
            tick: self.tick,
        });
    }

    fn read_resource(
        &self,
        id: ResourceId,
        offset: u64,
        len: u64,
    ) -> std::result::Result<Vec<u8>, String> {
        let resource = &self.resources[id.0];
        if offset + len > resource.size {
            return Err(format!(
                "read of {} bytes at {} from a {}-byte resource",
                len, offset, resource.size
            ));
        }
        let (start, end) = (offset as usize, (offset + len) as usize);
        Ok(match &resource.storage {
            Storage::Committed(memory) => memory[start..end].to_vec(),
            Storage::Placed { heap, offset: base } => {
                let base = *base as usize;
                self.heaps[*heap].memory[base + start..base + end].to_vec()
            }
        })
    }

    fn write_resource(
        &mut self,
        id: ResourceId,
        offset: u64,
        data: &[u8],
    ) -> std::result::Result<(), String> {
        let size = self.resources[id.0].size;
        if offset + data.len() as u64 > size {
            return Err(format!(
                "write of {} bytes at {} into a {}-byte resource",
                data.len(),
                offset,
                size
            ));
        }
        let start = offset as usize;
        match &mut self.resources[id.0].storage {
            Storage::Committed(memory) => {
                memory[start..start + data.len()].copy_from_slice(data);
            }
            Storage::Placed { heap, offset: base } => {
                let base = *base as usize;
                self.heaps[*heap].memory[base + start..base + start + data.len()]
                    .copy_from_slice(data);
            }
        }
        Ok(())
    }

    fn export_handle(&mut self, target: SharedTarget) -> SharedHandle {
        let handle = SharedHandle(self.next_handle);
        self.next_handle += 1;
        self.shared_handles.insert(handle.0, target);
        handle
    }
}

/// Entry point of the device layer; also the process-wide shared-handle
/// table and the home of the scheduler.
pub struct Factory {
    state: Shared,
}

impl Factory {
    pub fn new(adapters: Vec<AdapterDesc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(GpuState {
                adapters,
                fences: Vec::new(),
                heaps: Vec::new(),
                resources: Vec::new(),
                queues: Vec::new(),
                pipelines: Vec::new(),
                query_heaps: Vec::new(),
                swap_chains: Vec::new(),
                shared_handles: HashMap::new(),
                next_handle: 1,
                tick: 0,
                access_log: Vec::new(),
                removed: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GpuState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enum_adapters(&self) -> Vec<Adapter> {
        let count = self.lock().adapters.len();
        (0..count)
            .map(|index| Adapter {
                state: Arc::clone(&self.state),
                index,
            })
            .collect()
    }

    /// Drives every queue to quiescence. Host waits do this implicitly;
    /// tests call it before inspecting resource contents or the access log.
    pub fn flush(&self) {
        self.lock().pump();
    }

    pub fn take_access_log(&self) -> Vec<AccessRecord> {
        let mut state = self.lock();
        state.pump();
        std::mem::take(&mut state.access_log)
    }

    pub fn device_removed_reason(&self) -> Option<String> {
        self.lock().removed.clone()
    }
}

fn lock_state(state: &Shared) -> MutexGuard<'_, GpuState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct Adapter {
    state: Shared,
    index: usize,
}

impl Adapter {
    pub fn id(&self) -> AdapterId {
        AdapterId(self.index)
    }

    pub fn desc(&self) -> AdapterDesc {
        lock_state(&self.state).adapters[self.index].clone()
    }

    pub fn is_software(&self) -> bool {
        lock_state(&self.state).adapters[self.index].is_software
    }
}

#[derive(Clone)]
pub struct Device {
    state: Shared,
    adapter: AdapterId,
}

impl Device {
    pub fn new(adapter: &Adapter) -> Result<Self> {
        let state = lock_state(&adapter.state);
        state.check_removed()?;
        if adapter.index >= state.adapters.len() {
            return Err(Error::InvalidArgument("adapter index out of range"));
        }
        drop(state);
        trace!("created device on adapter {}", adapter.index);
        Ok(Self {
            state: Arc::clone(&adapter.state),
            adapter: AdapterId(adapter.index),
        })
    }

    pub fn adapter_id(&self) -> AdapterId {
        self.adapter
    }

    pub fn adapter_desc(&self) -> AdapterDesc {
        lock_state(&self.state).adapters[self.adapter.0].clone()
    }

    pub fn architecture(&self) -> ArchitectureInfo {
        ArchitectureInfo {
            uma: lock_state(&self.state).adapters[self.adapter.0].is_uma,
        }
    }

    /// Size the placement allocator would reserve for a buffer of
    /// `requested` bytes.
    pub fn resource_allocation_info(&self, requested: u64) -> u64 {
        align_to_multiple(requested, RESOURCE_PLACEMENT_ALIGNMENT)
    }

    pub fn create_command_queue(
        &self,
        desc: &CommandQueueDesc,
    ) -> Result<CommandQueue> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let index = state.queues.len();
        state.queues.push(QueueState {
            desc: *desc,
            adapter: self.adapter,
            pending: VecDeque::new(),
        });
        trace!(
            "created {:?} queue {} on adapter {} ({:?})",
            desc.list_type, index, self.adapter.0, desc.throttle
        );
        Ok(CommandQueue {
            state: Arc::clone(&self.state),
            index,
            desc: *desc,
        })
    }

    pub fn create_command_allocator(
        &self,
        list_type: CommandListType,
    ) -> Result<CommandAllocator> {
        lock_state(&self.state).check_removed()?;
        Ok(CommandAllocator { list_type })
    }

    /// Lists are created in the recording state, like the native API.
    pub fn create_command_list(
        &self,
        list_type: CommandListType,
    ) -> Result<CommandList> {
        lock_state(&self.state).check_removed()?;
        Ok(CommandList {
            list_type,
            commands: Vec::new(),
            open: true,
        })
    }

    pub fn create_fence(
        &self,
        initial_value: u64,
        flags: FenceFlags,
    ) -> Result<Fence> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let index = state.fences.len();
        state.fences.push(FenceState {
            completed: initial_value,
            flags,
            adapter: self.adapter,
        });
        Ok(Fence {
            state: Arc::clone(&self.state),
            index,
        })
    }

    pub fn create_heap(&self, desc: &HeapDesc) -> Result<Heap> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let index = state.heaps.len();
        state.heaps.push(HeapState {
            memory: vec![0u8; desc.size as usize],
            flags: desc.flags,
        });
        Ok(Heap {
            state: Arc::clone(&self.state),
            index,
            size: desc.size,
        })
    }

    pub fn create_committed_buffer(&self, desc: &BufferDesc) -> Result<Resource> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let initial_state = match desc.heap_type {
            HeapType::Upload => ResourceStates::GENERIC_READ,
            HeapType::Readback => ResourceStates::COPY_DEST,
            HeapType::Default => desc.initial_state,
        };
        let id = ResourceId(state.resources.len());
        state.resources.push(ResourceState {
            storage: Storage::Committed(vec![0u8; desc.size as usize]),
            size: desc.size,
            state: initial_state,
            kind: ResourceKind::Buffer,
            adapter: self.adapter,
        });
        Ok(Resource {
            state: Arc::clone(&self.state),
            id,
        })
    }

    pub fn create_placed_buffer(
        &self,
        heap: &Heap,
        heap_offset: u64,
        desc: &BufferDesc,
    ) -> Result<Resource> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        if heap_offset + desc.size > heap.size {
            return Err(Error::OutOfBounds {
                what: "placed buffer",
                offset: heap_offset,
                len: desc.size,
                size: heap.size,
            });
        }
        let id = ResourceId(state.resources.len());
        state.resources.push(ResourceState {
            storage: Storage::Placed {
                heap: heap.index,
                offset: heap_offset,
            },
            size: desc.size,
            state: desc.initial_state,
            kind: ResourceKind::Buffer,
            adapter: self.adapter,
        });
        Ok(Resource {
            state: Arc::clone(&self.state),
            id,
        })
    }

    pub fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<ComputePipeline> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let index = state.pipelines.len();
        state.pipelines.push(*desc);
        Ok(ComputePipeline { index, desc: *desc })
    }

    pub fn create_query_heap(&self, count: u32) -> Result<QueryHeap> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let index = state.query_heaps.len();
        state.query_heaps.push(QueryHeapState {
            timestamps: vec![0u64; count as usize],
        });
        Ok(QueryHeap { index, count })
    }

    pub fn create_swap_chain(
        &self,
        _present_queue: &CommandQueue,
        desc: &SwapChainDesc,
    ) -> Result<SwapChain> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let byte_size =
            desc.width as u64 * desc.height as u64 * 4;
        let mut buffers = Vec::with_capacity(desc.buffer_count as usize);
        for _ in 0..desc.buffer_count {
            let id = ResourceId(state.resources.len());
            state.resources.push(ResourceState {
                storage: Storage::Committed(vec![0u8; byte_size as usize]),
                size: byte_size,
                state: ResourceStates::COMMON_OR_PRESENT,
                kind: ResourceKind::Texture,
                adapter: self.adapter,
            });
            buffers.push(id);
        }
        let index = state.swap_chains.len();
        state.swap_chains.push(SwapChainState {
            desc: *desc,
            buffers,
            current: 0,
        });
        Ok(SwapChain {
            state: Arc::clone(&self.state),
            index,
        })
    }

    pub fn create_shared_handle_for_heap(
        &self,
        heap: &Heap,
    ) -> Result<SharedHandle> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let flags = state.heaps[heap.index].flags;
        if !flags.contains(HeapFlags::SHARED | HeapFlags::SHARED_CROSS_ADAPTER)
        {
            return Err(Error::NotShareable);
        }
        Ok(state.export_handle(SharedTarget::Heap(heap.index)))
    }

    pub fn create_shared_handle_for_fence(
        &self,
        fence: &Fence,
    ) -> Result<SharedHandle> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let flags = state.fences[fence.index].flags;
        if !flags
            .contains(FenceFlags::SHARED | FenceFlags::SHARED_CROSS_ADAPTER)
        {
            return Err(Error::NotShareable);
        }
        Ok(state.export_handle(SharedTarget::Fence(fence.index)))
    }

    pub fn open_shared_heap_handle(
        &self,
        handle: SharedHandle,
    ) -> Result<Heap> {
        let state = lock_state(&self.state);
        state.check_removed()?;
        match state.shared_handles.get(&handle.0) {
            Some(SharedTarget::Heap(index)) => {
                let size = state.heaps[*index].memory.len() as u64;
                let index = *index;
                drop(state);
                Ok(Heap {
                    state: Arc::clone(&self.state),
                    index,
                    size,
                })
            }
            _ => Err(Error::InvalidSharedHandle),
        }
    }

    pub fn open_shared_fence_handle(
        &self,
        handle: SharedHandle,
    ) -> Result<Fence> {
        let state = lock_state(&self.state);
        state.check_removed()?;
        match state.shared_handles.get(&handle.0) {
            Some(SharedTarget::Fence(index)) => {
                let index = *index;
                drop(state);
                Ok(Fence {
                    state: Arc::clone(&self.state),
                    index,
                })
            }
            _ => Err(Error::InvalidSharedHandle),
        }
    }

    /// Handles stay valid for objects already opened from them; closing only
    /// removes the table entry. Double close is an error.
    pub fn close_shared_handle(&self, handle: SharedHandle) -> Result<()> {
        let mut state = lock_state(&self.state);
        match state.shared_handles.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidSharedHandle),
        }
    }
}

pub struct CommandAllocator {
    list_type: CommandListType,
}

impl CommandAllocator {
    pub fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct CommandList {
    list_type: CommandListType,
    commands: Vec<Command>,
    open: bool,
}

impl CommandList {
    pub fn reset(
        &mut self,
        allocator: &CommandAllocator,
        _pipeline: Option<&ComputePipeline>,
    ) -> Result<()> {
        if self.open {
            return Err(Error::BadCommandListState);
        }
        if allocator.list_type != self.list_type {
            return Err(Error::InvalidArgument(
                "allocator type does not match the command list",
            ));
        }
        self.commands.clear();
        self.open = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::BadCommandListState);
        }
        self.open = false;
        Ok(())
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &Resource,
        dst_offset: u64,
        src: &Resource,
        src_offset: u64,
        num_bytes: u64,
    ) {
        self.commands.push(Command::CopyBufferRegion {
            dst: dst.id,
            dst_offset,
            src: src.id,
            src_offset,
            num_bytes,
        });
    }

    pub fn resource_barrier_transition(
        &mut self,
        resource: &Resource,
        state_before: ResourceStates,
        state_after: ResourceStates,
    ) {
        self.commands.push(Command::Transition {
            resource: resource.id,
            state_before,
            state_after,
        });
    }

    pub fn resource_barrier_uav(&mut self, resource: &Resource) {
        self.commands.push(Command::UavBarrier { resource: resource.id });
    }

    pub fn dispatch_n_body(
        &mut self,
        pipeline: &ComputePipeline,
        src_positions: &Resource,
        dst_positions: &Resource,
        src_velocities: &Resource,
        dst_velocities: &Resource,
        thread_groups: u32,
    ) {
        self.commands.push(Command::DispatchNBody {
            pipeline: pipeline.index,
            src_positions: src_positions.id,
            dst_positions: dst_positions.id,
            src_velocities: src_velocities.id,
            dst_velocities: dst_velocities.id,
            thread_groups,
        });
    }

    pub fn clear_render_target(&mut self, target: &Resource) {
        self.commands.push(Command::ClearRenderTarget { target: target.id });
    }

    pub fn draw_particles(
        &mut self,
        positions: &Resource,
        vertex_buffer: &Resource,
        constant_buffer: &Resource,
        num_vertices: u32,
        target: &Resource,
    ) {
        self.commands.push(Command::DrawParticles {
            positions: positions.id,
            vertex_buffer: vertex_buffer.id,
            constant_buffer: constant_buffer.id,
            num_vertices,
            target: target.id,
        });
    }

    /// Stand-in for the immediate-mode UI pass recorded last before the
    /// present transition.
    pub fn draw_overlay(&mut self, target: &Resource) {
        self.commands.push(Command::OverlayMarker { target: target.id });
    }

    pub fn end_timestamp_query(&mut self, query_heap: &QueryHeap, index: u32) {
        self.commands.push(Command::EndTimestampQuery {
            query_heap: query_heap.index,
            index,
        });
    }

    pub fn resolve_query_data(
        &mut self,
        query_heap: &QueryHeap,
        start: u32,
        count: u32,
        dst: &Resource,
        dst_offset: u64,
    ) {
        self.commands.push(Command::ResolveQueryData {
            query_heap: query_heap.index,
            start,
            count,
            dst: dst.id,
            dst_offset,
        });
    }
}

#[derive(Clone)]
pub struct CommandQueue {
    state: Shared,
    index: usize,
    desc: CommandQueueDesc,
}

impl CommandQueue {
    pub fn list_type(&self) -> CommandListType {
        self.desc.list_type
    }

    pub fn throttle_policy(&self) -> ThrottlePolicy {
        self.desc.throttle
    }

    pub fn timestamp_frequency(&self) -> u64 {
        TIMESTAMP_FREQUENCY
    }

    /// Queue-side wait; returns immediately, the queue stalls instead of the
    /// host.
    pub fn wait(&self, fence: &Fence, value: u64) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        trace!("queue {} waits for fence {} >= {}", self.index, fence.index, value);
        state.queues[self.index]
            .pending
            .push_back(QueueOp::Wait { fence: fence.index, value });
        state.pump();
        Ok(())
    }

    pub fn signal(&self, fence: &Fence, value: u64) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        trace!("queue {} signals fence {} = {}", self.index, fence.index, value);
        state.queues[self.index]
            .pending
            .push_back(QueueOp::Signal { fence: fence.index, value });
        state.pump();
        Ok(())
    }

    pub fn execute_command_lists(&self, lists: &[CommandList]) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        for list in lists {
            if list.open {
                return Err(Error::BadCommandListState);
            }
            if list.list_type != self.desc.list_type {
                return Err(Error::InvalidArgument(
                    "command list type does not match the queue",
                ));
            }
            state.queues[self.index]
                .pending
                .push_back(QueueOp::Execute(list.commands.clone()));
        }
        state.pump();
        Ok(())
    }
}

#[derive(Clone)]
pub struct Fence {
    state: Shared,
    index: usize,
}

impl Fence {
    pub fn completed_value(&self) -> u64 {
        let mut state = lock_state(&self.state);
        state.pump();
        state.fences[self.index].completed
    }

    pub fn adapter_id(&self) -> AdapterId {
        lock_state(&self.state).fences[self.index].adapter
    }

    /// Host-side signal.
    pub fn signal(&self, value: u64) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let completed = &mut state.fences[self.index].completed;
        if value > *completed {
            *completed = value;
        }
        state.pump();
        Ok(())
    }

    pub fn set_event_on_completion(&self, value: u64) -> Result<Event> {
        lock_state(&self.state).check_removed()?;
        Ok(Event {
            state: Arc::clone(&self.state),
            fence: self.index,
            value,
        })
    }
}

/// Host wait handle bound to a fence value.
pub struct Event {
    state: Shared,
    fence: usize,
    value: u64,
}

impl Event {
    /// Drives the scheduler; if quiescence is reached below the target value
    /// the wait can never complete and reports a hang instead of blocking.
    pub fn wait(&self) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.pump();
        state.check_removed()?;
        if state.fences[self.fence].completed >= self.value {
            Ok(())
        } else {
            Err(Error::DeviceHung { value: self.value })
        }
    }
}

#[derive(Clone)]
pub struct Heap {
    state: Shared,
    index: usize,
    size: u64,
}

impl Heap {
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Clone)]
pub struct Resource {
    state: Shared,
    id: ResourceId,
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Resource {}

impl Resource {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn size(&self) -> u64 {
        lock_state(&self.state).resources[self.id.0].size
    }

    pub fn adapter_id(&self) -> AdapterId {
        lock_state(&self.state).resources[self.id.0].adapter
    }

    /// CPU write, the upload-heap path. The software backend does not gate
    /// CPU access on heap type.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        state.write_resource(self.id, offset, data).map_err(|_| {
            Error::OutOfBounds {
                what: "resource write",
                offset,
                len: data.len() as u64,
                size: state.resources[self.id.0].size,
            }
        })
    }

    /// CPU read, the readback path. Pumps first so retired work is visible.
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut state = lock_state(&self.state);
        state.pump();
        state.check_removed()?;
        state.read_resource(self.id, offset, len).map_err(|_| {
            Error::OutOfBounds {
                what: "resource read",
                offset,
                len,
                size: state.resources[self.id.0].size,
            }
        })
    }
}

#[derive(Clone, Copy)]
pub struct ComputePipeline {
    index: usize,
    desc: ComputePipelineDesc,
}

impl ComputePipeline {
    pub fn desc(&self) -> ComputePipelineDesc {
        self.desc
    }
}

#[derive(Clone, Copy)]
pub struct QueryHeap {
    index: usize,
    count: u32,
}

impl QueryHeap {
    pub fn count(&self) -> u32 {
        self.count
    }
}

pub struct SwapChain {
    state: Shared,
    index: usize,
}

impl SwapChain {
    pub fn buffer(&self, index: u32) -> Resource {
        let state = lock_state(&self.state);
        let id = state.swap_chains[self.index].buffers[index as usize];
        drop(state);
        Resource {
            state: Arc::clone(&self.state),
            id,
        }
    }

    pub fn current_back_buffer_index(&self) -> u32 {
        lock_state(&self.state).swap_chains[self.index].current
    }

    pub fn present(
        &self,
        sync_interval: u32,
        flags: PresentFlags,
    ) -> Result<()> {
        let mut state = lock_state(&self.state);
        state.check_removed()?;
        let chain = &state.swap_chains[self.index];
        if flags.contains(PresentFlags::ALLOW_TEARING) {
            if !chain.desc.allow_tearing {
                return Err(Error::InvalidArgument(
                    "tearing present on a swap chain created without it",
                ));
            }
            if sync_interval != 0 {
                return Err(Error::InvalidArgument(
                    "tearing present requires a sync interval of zero",
                ));
            }
        }
        let count = chain.desc.buffer_count;
        let chain = &mut state.swap_chains[self.index];
        chain.current = (chain.current + 1) % count;
        state.pump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_factory() -> Factory {
        Factory::new(vec![
            AdapterDesc {
                description: "Test Discrete".to_string(),
                vendor_id: 0x10de,
                is_software: false,
                is_uma: false,
                supports_queue_extension: false,
            },
            AdapterDesc {
                description: "Test Integrated".to_string(),
                vendor_id: 0x8086,
                is_software: false,
                is_uma: true,
                supports_queue_extension: true,
            },
        ])
    }

    fn device(factory: &Factory, index: usize) -> Device {
        Device::new(&factory.enum_adapters()[index]).unwrap()
    }

    #[test]
    fn fence_values_retire_in_queue_order() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let queue = device
            .create_command_queue(
                &CommandQueueDesc::default().set_type(CommandListType::Direct),
            )
            .unwrap();
        let fence = device.create_fence(0, FenceFlags::NONE).unwrap();
        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();
        queue.signal(&fence, 3).unwrap();
        assert_eq!(fence.completed_value(), 3);
    }

    #[test]
    fn queue_wait_stalls_until_cross_queue_signal() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let producer = device
            .create_command_queue(
                &CommandQueueDesc::default().set_type(CommandListType::Compute),
            )
            .unwrap();
        let consumer = device
            .create_command_queue(
                &CommandQueueDesc::default().set_type(CommandListType::Direct),
            )
            .unwrap();
        let gate = device.create_fence(0, FenceFlags::NONE).unwrap();
        let done = device.create_fence(0, FenceFlags::NONE).unwrap();

        consumer.wait(&gate, 1).unwrap();
        consumer.signal(&done, 1).unwrap();
        assert_eq!(done.completed_value(), 0);

        producer.signal(&gate, 1).unwrap();
        assert_eq!(done.completed_value(), 1);
    }

    #[test]
    fn host_wait_on_unreachable_value_reports_hang() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let queue = device
            .create_command_queue(&CommandQueueDesc::default())
            .unwrap();
        let gate = device.create_fence(0, FenceFlags::NONE).unwrap();
        let fence = device.create_fence(0, FenceFlags::NONE).unwrap();
        queue.wait(&gate, 1).unwrap();
        queue.signal(&fence, 1).unwrap();
        let event = fence.set_event_on_completion(1).unwrap();
        assert!(matches!(event.wait(), Err(Error::DeviceHung { value: 1 })));
        // Unblocking the queue lets the same event complete.
        gate.signal(1).unwrap();
        event.wait().unwrap();
    }

    #[test]
    fn buffers_decay_to_common_after_execution() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let queue = device
            .create_command_queue(&CommandQueueDesc::default())
            .unwrap();
        let mut allocator = device
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let mut list =
            device.create_command_list(CommandListType::Direct).unwrap();
        let src = device
            .create_committed_buffer(
                &BufferDesc::new(256)
                    .set_initial_state(ResourceStates::COPY_SOURCE),
            )
            .unwrap();
        let dst = device
            .create_committed_buffer(
                &BufferDesc::new(256)
                    .set_initial_state(ResourceStates::UNORDERED_ACCESS),
            )
            .unwrap();
        src.write(0, &[7u8; 256]).unwrap();

        list.resource_barrier_transition(
            &dst,
            ResourceStates::UNORDERED_ACCESS,
            ResourceStates::COPY_DEST,
        );
        list.copy_buffer_region(&dst, 0, &src, 0, 256);
        list.close().unwrap();
        queue.execute_command_lists(std::slice::from_ref(&list)).unwrap();
        factory.flush();
        assert_eq!(dst.read(0, 256).unwrap(), vec![7u8; 256]);

        // After decay the same transition is legal again because the tracked
        // state is COMMON.
        allocator.reset().unwrap();
        list.reset(&allocator, None).unwrap();
        list.resource_barrier_transition(
            &dst,
            ResourceStates::UNORDERED_ACCESS,
            ResourceStates::COPY_DEST,
        );
        list.close().unwrap();
        queue.execute_command_lists(std::slice::from_ref(&list)).unwrap();
        factory.flush();
        assert!(factory.device_removed_reason().is_none());
    }

    #[test]
    fn mismatched_transition_removes_the_device() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let queue = device
            .create_command_queue(&CommandQueueDesc::default())
            .unwrap();
        let mut list =
            device.create_command_list(CommandListType::Direct).unwrap();
        let buffer = device
            .create_committed_buffer(
                &BufferDesc::new(64)
                    .set_initial_state(ResourceStates::COPY_DEST),
            )
            .unwrap();
        list.resource_barrier_transition(
            &buffer,
            ResourceStates::COPY_SOURCE,
            ResourceStates::UNORDERED_ACCESS,
        );
        list.close().unwrap();
        queue.execute_command_lists(std::slice::from_ref(&list)).unwrap();
        factory.flush();
        assert!(factory.device_removed_reason().is_some());
        // Every later call on the device surfaces the removal.
        assert!(matches!(
            device.create_fence(0, FenceFlags::NONE),
            Err(Error::DeviceRemoved(_))
        ));
        drop(queue);
    }

    #[test]
    fn shared_handles_round_trip_across_devices() {
        let factory = test_factory();
        let producer = device(&factory, 1);
        let consumer = device(&factory, 0);
        let heap = producer
            .create_heap(&HeapDesc {
                size: RESOURCE_PLACEMENT_ALIGNMENT * 2,
                flags: HeapFlags::SHARED | HeapFlags::SHARED_CROSS_ADAPTER,
            })
            .unwrap();
        let handle = producer.create_shared_handle_for_heap(&heap).unwrap();
        let opened = consumer.open_shared_heap_handle(handle).unwrap();
        assert_eq!(opened.size(), heap.size());

        let a = producer
            .create_placed_buffer(&heap, 0, &BufferDesc::new(128))
            .unwrap();
        let b = consumer
            .create_placed_buffer(&opened, 0, &BufferDesc::new(128))
            .unwrap();
        a.write(0, &[42u8; 128]).unwrap();
        assert_eq!(b.read(0, 128).unwrap(), vec![42u8; 128]);

        consumer.close_shared_handle(handle).unwrap();
        assert!(matches!(
            consumer.open_shared_heap_handle(handle),
            Err(Error::InvalidSharedHandle)
        ));
        assert!(matches!(
            consumer.close_shared_handle(handle),
            Err(Error::InvalidSharedHandle)
        ));
    }

    #[test]
    fn unshared_objects_cannot_be_exported() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let fence = device.create_fence(0, FenceFlags::NONE).unwrap();
        assert!(matches!(
            device.create_shared_handle_for_fence(&fence),
            Err(Error::NotShareable)
        ));
        let heap = device
            .create_heap(&HeapDesc {
                size: RESOURCE_PLACEMENT_ALIGNMENT,
                flags: HeapFlags::SHARED,
            })
            .unwrap();
        assert!(matches!(
            device.create_shared_handle_for_heap(&heap),
            Err(Error::NotShareable)
        ));
    }

    #[test]
    fn out_of_bounds_copy_removes_the_device() {
        let factory = test_factory();
        let device = device(&factory, 0);
        let queue = device
            .create_command_queue(
                &CommandQueueDesc::default().set_type(CommandListType::Copy),
            )
            .unwrap();
        let mut list =
            device.create_command_list(CommandListType::Copy).unwrap();
        let small = device.create_committed_buffer(&BufferDesc::new(64)).unwrap();
        let large = device.create_committed_buffer(&BufferDesc::new(256)).unwrap();
        list.copy_buffer_region(&small, 0, &large, 0, 256);
        list.close().unwrap();
        queue.execute_command_lists(std::slice::from_ref(&list)).unwrap();
        factory.flush();
        assert!(factory.device_removed_reason().is_some());
    }
}

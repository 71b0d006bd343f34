//! D3D12-shaped device layer backed by a deterministic software scheduler.
//!
//! The types here mirror the native object model closely enough that the
//! engine code above them reads like it would against the real runtime:
//! queues carry ordered timelines of wait/signal/execute ops, fences are
//! monotonic counters shareable across devices, heaps can be exported as
//! OS-style handles, and buffers follow the promotion/decay rules for the
//! COMMON state. The host never blocks inside queue calls; only `Event::wait`
//! and `Fence::completed_value` drive the scheduler forward.

mod backend;
pub mod timer;

pub use backend::{
    AccessKind, AccessRecord, Adapter, CommandAllocator, CommandList,
    CommandQueue, ComputePipeline, Device, Event, Factory, Fence, Heap,
    QueryHeap, Resource, ResourceId, SwapChain,
};

use bitflags::bitflags;

/// Placement alignment for buffers inside heaps, 64 KiB like the native
/// runtime reports for default resources.
pub const RESOURCE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Ticks per second of the software timestamp clock.
pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000;

bitflags! {
    pub struct HeapFlags: u32 {
        const SHARED = 0x1;
        const SHARED_CROSS_ADAPTER = 0x2;
    }
}

bitflags! {
    pub struct FenceFlags: u32 {
        const NONE = 0x0;
        const SHARED = 0x1;
        const SHARED_CROSS_ADAPTER = 0x2;
    }
}

bitflags! {
    pub struct ResourceFlags: u32 {
        const NONE = 0x0;
        const ALLOW_UNORDERED_ACCESS = 0x1;
        const ALLOW_CROSS_ADAPTER = 0x2;
    }
}

bitflags! {
    /// Subresource states for barriers. Buffers decay to `COMMON_OR_PRESENT`
    /// after every `execute_command_lists` and promote on first access, so a
    /// `Transition` whose `before` state names either the tracked state or
    /// COMMON is legal.
    pub struct ResourceStates: u32 {
        const COMMON_OR_PRESENT = 0x0;
        const COPY_DEST = 0x1;
        const COPY_SOURCE = 0x2;
        const UNORDERED_ACCESS = 0x4;
        const NON_PIXEL_SHADER_RESOURCE = 0x8;
        const PIXEL_SHADER_RESOURCE = 0x10;
        const VERTEX_AND_CONSTANT_BUFFER = 0x20;
        const RENDER_TARGET = 0x40;
        const GENERIC_READ = 0x2 | 0x8 | 0x10 | 0x20;
    }
}

bitflags! {
    pub struct PresentFlags: u32 {
        const NONE = 0x0;
        const ALLOW_TEARING = 0x1;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandListType {
    Direct,
    Compute,
    Copy,
}

impl Default for CommandListType {
    fn default() -> Self {
        CommandListType::Direct
    }
}

/// Queue priority knob the vendor extension toggles; plain queues run at
/// `Normal`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThrottlePolicy {
    Normal,
    MaxPerformance,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        ThrottlePolicy::Normal
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CommandQueueDesc {
    pub list_type: CommandListType,
    pub throttle: ThrottlePolicy,
}

impl CommandQueueDesc {
    pub fn set_type(mut self, list_type: CommandListType) -> Self {
        self.list_type = list_type;
        self
    }

    pub fn set_throttle(mut self, throttle: ThrottlePolicy) -> Self {
        self.throttle = throttle;
        self
    }
}

#[derive(Copy, Clone, Debug)]
pub enum HeapType {
    Default,
    Upload,
    Readback,
}

#[derive(Copy, Clone, Debug)]
pub struct HeapDesc {
    pub size: u64,
    pub flags: HeapFlags,
}

#[derive(Copy, Clone, Debug)]
pub struct BufferDesc {
    pub size: u64,
    pub heap_type: HeapType,
    pub flags: ResourceFlags,
    pub initial_state: ResourceStates,
}

impl BufferDesc {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            heap_type: HeapType::Default,
            flags: ResourceFlags::NONE,
            initial_state: ResourceStates::COMMON_OR_PRESENT,
        }
    }

    pub fn set_heap_type(mut self, heap_type: HeapType) -> Self {
        self.heap_type = heap_type;
        self
    }

    pub fn set_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn set_initial_state(mut self, state: ResourceStates) -> Self {
        self.initial_state = state;
        self
    }
}

/// Parameters of the n-body compute pipeline. The software backend executes
/// the kernel these parameters describe when a `dispatch_n_body` command
/// retires.
#[derive(Copy, Clone, Debug)]
pub struct ComputePipelineDesc {
    pub block_size: u32,
    pub particle_count: u32,
    pub timestep: f32,
}

#[derive(Copy, Clone, Debug)]
pub struct SwapChainDesc {
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    pub allow_tearing: bool,
}

/// Capabilities of the presentation surface the caller owns. Window creation
/// and the message pump stay outside the crate; this is the slice of the
/// window the render engine needs.
#[derive(Copy, Clone, Debug)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub allow_tearing: bool,
}

/// OS-style shared handle. Only objects created with the cross-adapter
/// sharing flags can be exported; opening or closing an unknown handle fails
/// with `Error::InvalidSharedHandle`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SharedHandle(pub(crate) u64);

/// Everything the producer side must hand the consumer side so both ends can
/// reconstruct the shared ping-pong buffers and the cross-adapter fence.
///
/// `buffer_index` pins the two engines to the same parity: the consumer reads
/// slot `1 - index` while the producer writes slot `1 - index` one fence step
/// later.
#[derive(Copy, Clone, Debug)]
pub struct SharedHandles {
    pub heap: SharedHandle,
    pub fence: SharedHandle,
    pub aligned_data_size: u64,
    pub buffer_index: u32,
}

/// Adapter description used both to build software topologies and as the
/// enumeration result.
#[derive(Clone, Debug)]
pub struct AdapterDesc {
    pub description: String,
    pub vendor_id: u32,
    pub is_software: bool,
    pub is_uma: bool,
    pub supports_queue_extension: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AdapterId(pub(crate) usize);

/// Architecture feature data, the UMA bit being the part adapter assignment
/// keys on.
#[derive(Copy, Clone, Debug)]
pub struct ArchitectureInfo {
    pub uma: bool,
}

pub fn align_to_multiple(location: u64, alignment: u64) -> u64 {
    (location + (alignment - 1)) & (!(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_up_to_placement_granularity() {
        assert_eq!(align_to_multiple(0, RESOURCE_PLACEMENT_ALIGNMENT), 0);
        assert_eq!(
            align_to_multiple(1, RESOURCE_PLACEMENT_ALIGNMENT),
            RESOURCE_PLACEMENT_ALIGNMENT
        );
        assert_eq!(
            align_to_multiple(
                RESOURCE_PLACEMENT_ALIGNMENT,
                RESOURCE_PLACEMENT_ALIGNMENT
            ),
            RESOURCE_PLACEMENT_ALIGNMENT
        );
        let sixteen_mb = 16 * 1024 * 1024;
        assert_eq!(
            align_to_multiple(sixteen_mb + 3, RESOURCE_PLACEMENT_ALIGNMENT),
            sixteen_mb + RESOURCE_PLACEMENT_ALIGNMENT
        );
    }
}

//! Named GPU interval timer built on timestamp queries.
//!
//! Each timer owns two query slots. `resolve_all_timers` first folds the
//! previously resolved values into a moving average and then records the
//! next resolve into the readback buffer, so the reported numbers always
//! trail the GPU by one resolve, like a real readback does.

use crate::error::Result;

use super::{
    BufferDesc, CommandList, CommandQueue, Device, HeapType, QueryHeap,
    Resource,
};

pub const DEFAULT_AVERAGE_OVER: u32 = 20;

pub struct GpuTimer {
    query_heap: QueryHeap,
    readback: Resource,
    frequency: u64,
    average_over: f32,
    num_timers: u32,
    times: Vec<(f32, String)>,
}

impl GpuTimer {
    pub fn new(
        device: &Device,
        queue: &CommandQueue,
        num_timers: u32,
        average_over: u32,
    ) -> Result<Self> {
        let query_heap = device.create_query_heap(num_timers * 2)?;
        let readback = device.create_committed_buffer(
            &BufferDesc::new(num_timers as u64 * 2 * 8)
                .set_heap_type(HeapType::Readback),
        )?;
        Ok(Self {
            query_heap,
            readback,
            frequency: queue.timestamp_frequency(),
            average_over: average_over.max(1) as f32,
            num_timers,
            times: vec![(0.0, String::new()); num_timers as usize],
        })
    }

    pub fn set_timer_name(&mut self, index: u32, name: &str) {
        if let Some(slot) = self.times.get_mut(index as usize) {
            slot.1 = name.to_string();
        }
    }

    pub fn begin_timer(&self, command_list: &mut CommandList, index: u32) {
        command_list.end_timestamp_query(&self.query_heap, index * 2);
    }

    pub fn end_timer(&self, command_list: &mut CommandList, index: u32) {
        command_list.end_timestamp_query(&self.query_heap, index * 2 + 1);
    }

    /// Folds the last resolved intervals into the averages, then records the
    /// next resolve.
    pub fn resolve_all_timers(
        &mut self,
        command_list: &mut CommandList,
    ) -> Result<()> {
        let byte_size = self.num_timers as u64 * 2 * 8;
        let bytes = self.readback.read(0, byte_size)?;
        for index in 0..self.num_timers as usize {
            let begin = u64_at(&bytes, index * 16);
            let end = u64_at(&bytes, index * 16 + 8);
            if end > begin {
                let seconds = (end - begin) as f32 / self.frequency as f32;
                let average = &mut self.times[index].0;
                *average += (seconds - *average) / self.average_over;
            }
        }
        command_list.resolve_query_data(
            &self.query_heap,
            0,
            self.num_timers * 2,
            &self.readback,
            0,
        );
        Ok(())
    }

    /// Moving-average interval in seconds, with the name given to the slot.
    pub fn times(&self) -> &[(f32, String)] {
        &self.times
    }
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        AdapterDesc, CommandListType, CommandQueueDesc, Factory,
    };

    #[test]
    fn intervals_surface_after_the_next_resolve() {
        let factory = Factory::new(vec![AdapterDesc {
            description: "Test".to_string(),
            vendor_id: 0,
            is_software: false,
            is_uma: false,
            supports_queue_extension: false,
        }]);
        let device =
            crate::gpu::Device::new(&factory.enum_adapters()[0]).unwrap();
        let queue = device
            .create_command_queue(
                &CommandQueueDesc::default().set_type(CommandListType::Direct),
            )
            .unwrap();
        let mut timer = GpuTimer::new(&device, &queue, 1, 1).unwrap();
        timer.set_timer_name(0, "work ms");

        let mut list =
            device.create_command_list(CommandListType::Direct).unwrap();
        let allocator = device
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let scratch = device
            .create_committed_buffer(&BufferDesc::new(64))
            .unwrap();
        let scratch_src = device
            .create_committed_buffer(&BufferDesc::new(64))
            .unwrap();

        for _ in 0..2 {
            timer.begin_timer(&mut list, 0);
            list.copy_buffer_region(&scratch, 0, &scratch_src, 0, 64);
            timer.end_timer(&mut list, 0);
            timer.resolve_all_timers(&mut list).unwrap();
            list.close().unwrap();
            queue.execute_command_lists(std::slice::from_ref(&list)).unwrap();
            factory.flush();
            list.reset(&allocator, None).unwrap();
        }
        list.close().unwrap();

        assert!(timer.times()[0].0 > 0.0);
        assert_eq!(timer.times()[0].1, "work ms");
    }
}

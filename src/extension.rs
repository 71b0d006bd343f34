//! Vendor command-queue throttle extension.
//!
//! Modeled as a capability probe plus a queue-factory strategy: when the
//! adapter is the vendor's and exposes the extension, queues created through
//! it are pinned to maximum throttle; otherwise creation silently falls back
//! to a plain queue, so callers never branch on vendor themselves.

use log::info;

use crate::error::Result;
use crate::gpu::{CommandQueue, CommandQueueDesc, Device, ThrottlePolicy};

pub const INTEL_VENDOR_ID: u32 = 0x8086;

pub struct QueueExtension {
    enabled: bool,
}

impl QueueExtension {
    pub fn new(device: &Device) -> Self {
        let desc = device.adapter_desc();
        let enabled = desc.vendor_id == INTEL_VENDOR_ID
            && desc.supports_queue_extension;
        if enabled {
            info!(
                "command queue throttle extension available on {}",
                desc.description
            );
        }
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn create_command_queue(
        &self,
        device: &Device,
        desc: &CommandQueueDesc,
    ) -> Result<CommandQueue> {
        if self.enabled {
            device.create_command_queue(
                &desc.set_throttle(ThrottlePolicy::MaxPerformance),
            )
        } else {
            device.create_command_queue(desc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{AdapterDesc, CommandListType, Factory};

    fn factory() -> Factory {
        Factory::new(vec![
            AdapterDesc {
                description: "Other Vendor".to_string(),
                vendor_id: 0x10de,
                is_software: false,
                is_uma: false,
                supports_queue_extension: false,
            },
            AdapterDesc {
                description: "Vendor Integrated".to_string(),
                vendor_id: INTEL_VENDOR_ID,
                is_software: false,
                is_uma: true,
                supports_queue_extension: true,
            },
            AdapterDesc {
                description: "Vendor Without Extension".to_string(),
                vendor_id: INTEL_VENDOR_ID,
                is_software: false,
                is_uma: true,
                supports_queue_extension: false,
            },
        ])
    }

    #[test]
    fn extension_requires_vendor_and_capability() {
        let factory = factory();
        let adapters = factory.enum_adapters();
        let foreign = Device::new(&adapters[0]).unwrap();
        let capable = Device::new(&adapters[1]).unwrap();
        let incapable = Device::new(&adapters[2]).unwrap();
        assert!(!QueueExtension::new(&foreign).enabled());
        assert!(QueueExtension::new(&capable).enabled());
        assert!(!QueueExtension::new(&incapable).enabled());
    }

    #[test]
    fn extension_queue_carries_the_throttle_policy() {
        let factory = factory();
        let adapters = factory.enum_adapters();
        let capable = Device::new(&adapters[1]).unwrap();
        let extension = QueueExtension::new(&capable);
        let desc =
            CommandQueueDesc::default().set_type(CommandListType::Compute);
        let queue =
            extension.create_command_queue(&capable, &desc).unwrap();
        assert_eq!(queue.throttle_policy(), ThrottlePolicy::MaxPerformance);

        let foreign = Device::new(&adapters[0]).unwrap();
        let fallback = QueueExtension::new(&foreign)
            .create_command_queue(&foreign, &desc)
            .unwrap();
        assert_eq!(fallback.throttle_policy(), ThrottlePolicy::Normal);
    }
}

use ash::vk;
use vk_sync::AccessType;

use super::device::Device;

pub struct ImageBarrier {
    image: vk::Image,
    prev_access: vk_sync::AccessType,
    next_access: vk_sync::AccessType,
    aspect_mask: vk::ImageAspectFlags,
    discard: bool,
}

pub fn record_image_barrier(device: &Device, cb: vk::CommandBuffer, barrier: ImageBarrier) {
    let range = vk::ImageSubresourceRange {
        aspect_mask: barrier.aspect_mask,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    };

    vk_sync::cmd::pipeline_barrier(
        device.raw.fp_v1_0(),
        cb,
        None,
        &[],
        &[vk_sync::ImageBarrier {
            previous_accesses: &[barrier.prev_access],
            next_accesses: &[barrier.next_access],
            previous_layout: vk_sync::ImageLayout::Optimal,
            next_layout: vk_sync::ImageLayout::Optimal,
            discard_contents: barrier.discard,
            src_queue_family_index: device.universal_queue.family.index,
            dst_queue_family_index: device.universal_queue.family.index,
            image: barrier.image,
            range,
        }],
    );
}

pub fn record_global_barrier(
    device: &Device,
    cb: vk::CommandBuffer,
    previous_accesses: &[AccessType],
    next_accesses: &[AccessType],
) {
    vk_sync::cmd::pipeline_barrier(
        device.raw.fp_v1_0(),
        cb,
        Some(vk_sync::GlobalBarrier {
            previous_accesses,
            next_accesses,
        }),
        &[],
        &[],
    );
}

impl ImageBarrier {
    pub fn new(
        image: vk::Image,
        prev_access: vk_sync::AccessType,
        next_access: vk_sync::AccessType,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            image,
            prev_access,
            next_access,
            discard: false,
            aspect_mask,
        }
    }

    pub fn with_discard(mut self, discard: bool) -> Self {
        self.discard = discard;
        self
    }
}

/// What a state change between two accesses requires on the command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// Same read access on both sides; nothing to record.
    None,
    /// Write chained after the same write access. No layout change, but the
    /// previous dispatch must drain before the next one starts.
    WriteOverlap,
    /// Access (and possibly layout) actually changes.
    Transition,
}

fn is_write_access(access: AccessType) -> bool {
    matches!(
        access,
        AccessType::ComputeShaderWrite | AccessType::AnyShaderWrite | AccessType::TransferWrite
    )
}

/// Decides what barrier a `prev -> next` access change needs. Consecutive
/// reads are free; repeated writes to the same resource still need an
/// execution dependency even though the state word does not change.
pub fn plan_transition(prev: AccessType, next: AccessType) -> BarrierKind {
    if prev == next {
        if is_write_access(prev) {
            BarrierKind::WriteOverlap
        } else {
            BarrierKind::None
        }
    } else {
        BarrierKind::Transition
    }
}

/// Tracks the last known access of each resource in a frame and hands out
/// the minimal barrier for every requested transition.
#[derive(Default)]
pub struct ResourceStateTracker {
    states: Vec<AccessType>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, initial: AccessType) -> usize {
        let id = self.states.len();
        self.states.push(initial);
        id
    }

    pub fn current(&self, id: usize) -> AccessType {
        self.states[id]
    }

    /// Records `next` as the new state, returning the previous access and
    /// the kind of barrier the change requires.
    pub fn transition(&mut self, id: usize, next: AccessType) -> (AccessType, BarrierKind) {
        let prev = self.states[id];
        let kind = plan_transition(prev, next);
        self.states[id] = next;
        (prev, kind)
    }
}

pub struct AccessInfo {
    pub stage_mask: vk::PipelineStageFlags,
    pub access_mask: vk::AccessFlags,
    pub image_layout: vk::ImageLayout,
}

/// Stage, access, and layout for each access the frame issues. The frame is
/// compute and transfer work only; attachment and vertex-input accesses are
/// rejected so a bad declaration fails loudly instead of mis-scheduling.
pub fn get_access_info(access_type: AccessType) -> AccessInfo {
    match access_type {
        AccessType::Nothing => AccessInfo {
            stage_mask: vk::PipelineStageFlags::empty(),
            access_mask: vk::AccessFlags::empty(),
            image_layout: vk::ImageLayout::UNDEFINED,
        },
        AccessType::IndirectBuffer => AccessInfo {
            stage_mask: vk::PipelineStageFlags::DRAW_INDIRECT,
            access_mask: vk::AccessFlags::INDIRECT_COMMAND_READ,
            image_layout: vk::ImageLayout::UNDEFINED,
        },
        AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer => AccessInfo {
            stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            access_mask: vk::AccessFlags::SHADER_READ,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        },
        AccessType::AnyShaderReadSampledImageOrUniformTexelBuffer => AccessInfo {
            stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
            access_mask: vk::AccessFlags::SHADER_READ,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        },
        AccessType::AnyShaderReadOther => AccessInfo {
            stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
            access_mask: vk::AccessFlags::SHADER_READ,
            image_layout: vk::ImageLayout::GENERAL,
        },
        AccessType::TransferRead => AccessInfo {
            stage_mask: vk::PipelineStageFlags::TRANSFER,
            access_mask: vk::AccessFlags::TRANSFER_READ,
            image_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        },
        AccessType::HostRead => AccessInfo {
            stage_mask: vk::PipelineStageFlags::HOST,
            access_mask: vk::AccessFlags::HOST_READ,
            image_layout: vk::ImageLayout::GENERAL,
        },
        AccessType::ComputeShaderWrite => AccessInfo {
            stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            access_mask: vk::AccessFlags::SHADER_WRITE,
            image_layout: vk::ImageLayout::GENERAL,
        },
        AccessType::AnyShaderWrite => AccessInfo {
            stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
            access_mask: vk::AccessFlags::SHADER_WRITE,
            image_layout: vk::ImageLayout::GENERAL,
        },
        AccessType::TransferWrite => AccessInfo {
            stage_mask: vk::PipelineStageFlags::TRANSFER,
            access_mask: vk::AccessFlags::TRANSFER_WRITE,
            image_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        },
        _ => panic!("Access type not used by the compute frame: {:?}", access_type),
    }
}

pub fn image_aspect_mask_from_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM => vk::ImageAspectFlags::DEPTH,
        vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
        vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn image_aspect_mask_from_access_type_and_format(
    access_type: AccessType,
    format: vk::Format,
) -> Option<vk::ImageAspectFlags> {
    let image_layout = get_access_info(access_type).image_layout;

    match image_layout {
        vk::ImageLayout::GENERAL
        | vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        | vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        | vk::ImageLayout::TRANSFER_DST_OPTIMAL => Some(image_aspect_mask_from_format(format)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_to_read_needs_no_barrier() {
        assert_eq!(
            plan_transition(
                AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer,
                AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer,
            ),
            BarrierKind::None
        );
    }

    #[test]
    fn chained_writes_need_overlap_barrier() {
        assert_eq!(
            plan_transition(AccessType::ComputeShaderWrite, AccessType::ComputeShaderWrite),
            BarrierKind::WriteOverlap
        );
    }

    #[test]
    fn write_to_read_transitions() {
        assert_eq!(
            plan_transition(
                AccessType::ComputeShaderWrite,
                AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer,
            ),
            BarrierKind::Transition
        );
    }

    #[test]
    #[should_panic(expected = "not used by the compute frame")]
    fn attachment_accesses_are_rejected() {
        get_access_info(AccessType::ColorAttachmentWrite);
    }

    #[test]
    fn tracker_remembers_last_access() {
        let mut tracker = ResourceStateTracker::new();
        let id = tracker.register(AccessType::Nothing);

        let (prev, kind) = tracker.transition(id, AccessType::ComputeShaderWrite);
        assert_eq!(prev, AccessType::Nothing);
        assert_eq!(kind, BarrierKind::Transition);

        let (prev, kind) = tracker.transition(id, AccessType::ComputeShaderWrite);
        assert_eq!(prev, AccessType::ComputeShaderWrite);
        assert_eq!(kind, BarrierKind::WriteOverlap);
    }
}

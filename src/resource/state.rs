use bitflags::bitflags;

bitflags! {
    /// Access state of a (sub)resource, mirroring `D3D12_RESOURCE_STATES`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const RAYTRACING_ACCELERATION_STRUCTURE = 0x40_0000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();

        /// Not known yet; resolved by the first transition recorded against the resource.
        const TBD = 1 << 30;
        /// Marks the uniform state as meaningless while states are tracked per subresource.
        const CORRUPT = 1 << 31;
    }
}

/// How much state tracking a resource needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceStateMode {
    /// Tracked unless the resource lives in a CPU-visible heap, where the state is fixed.
    #[default]
    Default,
    /// Never transitions; no tracker is kept.
    SingleState,
    /// Always tracked.
    MultiState,
}

/// Per-subresource state machine.
///
/// The common case keeps one state for all subresources. The first write that makes one
/// subresource diverge promotes the tracker to a state per subresource, and
/// [`ResourceState::check_all_subresource_same()`] collapses it again once they agree.
#[derive(Clone, Debug)]
pub struct ResourceState {
    resource_state: ResourceStates,
    subresource_states: Vec<ResourceStates>,
    all_subresources_same: bool,
}

impl ResourceState {
    /// Addresses every subresource at once.
    pub const ALL_SUBRESOURCES: u32 = u32::MAX;

    pub fn new(subresource_count: u32, initial_state: ResourceStates) -> Self {
        Self {
            resource_state: initial_state,
            subresource_states: vec![initial_state; subresource_count.max(1) as usize],
            all_subresources_same: true,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.subresource_states.len() as u32
    }

    pub fn all_subresources_same(&self) -> bool {
        self.all_subresources_same
    }

    /// The uniform state, or [`ResourceStates::CORRUPT`] while tracked per subresource.
    pub fn resource_state(&self) -> ResourceStates {
        self.resource_state
    }

    pub fn set_resource_state(&mut self, state: ResourceStates) {
        self.all_subresources_same = true;
        self.resource_state = state;
    }

    pub fn set_subresource_state(&mut self, subresource: u32, state: ResourceStates) {
        if subresource == Self::ALL_SUBRESOURCES || self.subresource_states.len() == 1 {
            self.set_resource_state(state);
            return;
        }

        let index = subresource as usize;
        assert!(
            index < self.subresource_states.len(),
            "Subresource {} out of range ({} subresources)",
            subresource,
            self.subresource_states.len()
        );

        if self.all_subresources_same {
            if self.resource_state == state {
                return;
            }

            self.subresource_states.fill(self.resource_state);
            self.resource_state = ResourceStates::CORRUPT;
            self.all_subresources_same = false;
        }

        self.subresource_states[index] = state;
    }

    pub fn get_subresource_state(&self, subresource: u32) -> ResourceStates {
        if self.all_subresources_same {
            self.resource_state
        } else {
            assert!(
                subresource != Self::ALL_SUBRESOURCES,
                "Subresources are in different states"
            );
            self.subresource_states[subresource as usize]
        }
    }

    /// Collapses back to the uniform representation if every subresource agrees.
    pub fn check_all_subresource_same(&mut self) -> bool {
        if !self.all_subresources_same {
            let first = self.subresource_states[0];
            if self.subresource_states.iter().all(|&s| s == first) {
                self.set_resource_state(first);
            }
        }
        self.all_subresources_same
    }

    /// Whether every subresource is in `state`.
    pub fn check_resource_state(&self, state: ResourceStates) -> bool {
        if self.all_subresources_same {
            self.resource_state == state
        } else {
            self.subresource_states.iter().all(|&s| s == state)
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.check_resource_state(ResourceStates::TBD)
    }
}

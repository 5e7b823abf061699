//! Work-group formulation of the forward-pass kernels.
//!
//! These kernels mirror an accelerator execution model: one work group per
//! output row or attention head, cooperating threads with strided loads,
//! tree reductions through group-local buffers, and explicit barrier points
//! between phases that touch shared data. Here the group scheduler is the
//! thread pool and each group's threads are stepped phase by phase, so a
//! phase boundary has exactly the visibility a local barrier provides.

pub(crate) mod kernels;

/// Threads per work group for the reduction kernels. Must stay a power of
/// two for the halving tree.
pub(crate) const WORKGROUP_SIZE: usize = 32;

/// Identity of one work group within a launch grid.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkGroup {
    pub id: usize,
    pub size: usize,
}

/// Local-memory capacity per work group, in f32 slots (16 KiB).
pub(crate) const LOCAL_MEMORY_FLOATS: usize = 4096;

/// Group-local scratch allocator, bound to the work group it was created
/// for. Every allocation draws down the group's fixed capacity, and a
/// request on behalf of any other group is rejected, so a kernel cannot
/// over-allocate local memory or share a buffer across groups.
pub(crate) struct LocalMemory {
    group_id: usize,
    remaining: usize,
}

impl LocalMemory {
    pub fn for_group(group: &WorkGroup) -> Self {
        Self {
            group_id: group.id,
            remaining: LOCAL_MEMORY_FLOATS,
        }
    }

    /// Hands out a zeroed buffer charged against `group`'s capacity.
    pub fn floats(&mut self, group: &WorkGroup, len: usize) -> Vec<f32> {
        assert_eq!(
            group.id, self.group_id,
            "local buffer requested from the allocator of another group"
        );
        assert!(
            len <= self.remaining,
            "local memory exhausted: {len} floats requested, {} available",
            self.remaining
        );
        self.remaining -= len;
        vec![0.0; len]
    }
}

/// Tree reduction over a group-local buffer: halvings with a barrier
/// between each round; the sum ends in slot 0.
pub(crate) fn tree_reduce(local: &mut [f32]) {
    let mut stride = local.len() / 2;
    while stride > 0 {
        for lid in 0..stride {
            local[lid] += local[lid + stride];
        }
        stride /= 2;
    }
}

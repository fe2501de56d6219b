use crate::frame::FrameKind;

/// Running minimum and maximum of one main-frame field, created on the
/// first accepted observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldRange {
    pub min: i32,
    pub max: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameTypeStats {
    pub bytes: u64,
    /// Histogram of observed frame sizes; sizes past the end are counted
    /// in `bytes` only.
    pub size_count: [u32; 256],
    pub valid_count: u32,
    pub corrupt_count: u32,
    pub desync_count: u32,
}

impl Default for FrameTypeStats {
    fn default() -> Self {
        Self {
            bytes: 0,
            size_count: [0; 256],
            valid_count: 0,
            corrupt_count: 0,
            desync_count: 0,
        }
    }
}

impl FrameTypeStats {
    pub(crate) fn record_size(&mut self, size: usize) {
        self.bytes += size as u64;
        if let Some(slot) = self.size_count.get_mut(size) {
            *slot += 1;
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_bytes: u64,
    pub total_corrupt_frames: u32,
    pub intentionally_absent_iterations: u64,
    /// Per main field, indexed like the decoded frames.
    pub field: Vec<Option<FieldRange>>,
    frame: [FrameTypeStats; 5],
}

impl Stats {
    pub fn frame(&self, kind: FrameKind) -> &FrameTypeStats {
        &self.frame[kind.index()]
    }

    pub(crate) fn frame_mut(&mut self, kind: FrameKind) -> &mut FrameTypeStats {
        &mut self.frame[kind.index()]
    }

    pub(crate) fn observe_fields(&mut self, values: &[i32]) {
        for (slot, value) in self.field.iter_mut().zip(values.iter().copied()) {
            match slot {
                Some(range) => {
                    range.min = range.min.min(value);
                    range.max = range.max.max(value);
                }
                None => *slot = Some(FieldRange { min: value, max: value }),
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        let field_count = self.field.len();
        *self = Stats {
            field: vec![None; field_count],
            ..Stats::default()
        };
    }

    pub(crate) fn resize_fields(&mut self, count: usize) {
        self.field = vec![None; count];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_ranges_initialize_lazily() {
        let mut stats = Stats::default();
        stats.resize_fields(2);
        assert_eq!(stats.field, vec![None, None]);
        stats.observe_fields(&[5, -3]);
        stats.observe_fields(&[2, 7]);
        assert_eq!(stats.field[0], Some(FieldRange { min: 2, max: 5 }));
        assert_eq!(stats.field[1], Some(FieldRange { min: -3, max: 7 }));
    }

    #[test]
    fn oversized_frames_do_not_index_the_histogram() {
        let mut stats = FrameTypeStats::default();
        stats.record_size(10);
        stats.record_size(300);
        assert_eq!(stats.size_count[10], 1);
        assert_eq!(stats.bytes, 310);
    }

    #[test]
    fn reset_keeps_field_count() {
        let mut stats = Stats::default();
        stats.resize_fields(3);
        stats.observe_fields(&[1, 2, 3]);
        stats.total_corrupt_frames = 2;
        stats.frame_mut(FrameKind::Intra).valid_count = 9;
        stats.reset();
        assert_eq!(stats.field, vec![None, None, None]);
        assert_eq!(stats.total_corrupt_frames, 0);
        assert_eq!(stats.frame(FrameKind::Intra).valid_count, 0);
    }
}

//! Segment mapping between media time and channel time

/// How the current segment's media time anchors to channel time.
///
/// A mapping is either fully known or not established at all; the first
/// admitted frame resolves `AwaitFirstFrame` into both endpoints in one step.
/// There is deliberately no state with only one endpoint set: locking CT
/// against a stale MT (frames dropped between segment begin and first
/// admission) cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMapping {
    /// Both endpoints declared up front by the scheduler.
    Absolute { ct_start_us: i64, mt_start_us: i64 },
    /// Endpoints pending; the next admitted frame locks CT from the wall
    /// clock and MT from its own PTS, atomically.
    AwaitFirstFrame,
}

impl SegmentMapping {
    pub fn is_pending(&self) -> bool {
        matches!(self, SegmentMapping::AwaitFirstFrame)
    }

    /// The locked endpoints, if any.
    pub fn endpoints(&self) -> Option<(i64, i64)> {
        match *self {
            SegmentMapping::Absolute {
                ct_start_us,
                mt_start_us,
            } => Some((ct_start_us, mt_start_us)),
            SegmentMapping::AwaitFirstFrame => None,
        }
    }

    /// Map a media timestamp through the locked endpoints.
    pub fn media_to_channel(&self, mt_us: i64) -> Option<i64> {
        self.endpoints()
            .map(|(ct_start, mt_start)| ct_start + (mt_us - mt_start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_mapping() {
        let m = SegmentMapping::Absolute {
            ct_start_us: 1_000_000,
            mt_start_us: 4_300_000,
        };
        assert!(!m.is_pending());
        assert_eq!(m.media_to_channel(4_300_000), Some(1_000_000));
        assert_eq!(m.media_to_channel(4_333_333), Some(1_033_333));
    }

    #[test]
    fn test_pending_has_no_endpoints() {
        let m = SegmentMapping::AwaitFirstFrame;
        assert!(m.is_pending());
        assert_eq!(m.endpoints(), None);
        assert_eq!(m.media_to_channel(0), None);
    }
}

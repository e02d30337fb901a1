use super::TaskError;

/// Most scatter/gather segments one task may carry.
pub const MAX_SGES: usize = 512;

/// One local segment of a task, relative to the start of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}

/// Split a buffer of `size` bytes into `num_sges` equal, 64-byte aligned,
/// back-to-back segments starting at offset 0.
///
/// Zero segments means the whole buffer as one contiguous element and
/// yields an empty list. The tail left over by rounding is not covered.
pub fn partition(size: usize, num_sges: usize) -> Result<Vec<Segment>, TaskError> {
    if num_sges == 0 {
        return Ok(Vec::new());
    }
    if num_sges > MAX_SGES {
        return Err(TaskError::TooManySegments(num_sges));
    }

    let portion = (size / num_sges) & !63;
    if portion == 0 {
        return Err(TaskError::SegmentTooSmall { size, num_sges });
    }
    Ok((0..num_sges)
        .map(|i| Segment {
            offset: i * portion,
            len: portion,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_aligned() {
        let segs = partition(4096, 4).unwrap();
        assert_eq!(segs.len(), 4);
        assert!(segs.iter().all(|s| s.len == 1024));
        assert_eq!(segs[3].offset, 3072);
    }

    #[test]
    fn test_partition_rounds_down() {
        // 1000 / 3 = 333, rounded down to 320.
        let segs = partition(1000, 3).unwrap();
        assert_eq!(
            segs,
            vec![
                Segment { offset: 0, len: 320 },
                Segment { offset: 320, len: 320 },
                Segment { offset: 640, len: 320 },
            ]
        );
    }

    #[test]
    fn test_partition_limits() {
        assert!(partition(4096, 0).unwrap().is_empty());
        assert_eq!(partition(512 * 64, MAX_SGES).unwrap().len(), MAX_SGES);
        assert!(matches!(
            partition(1 << 20, MAX_SGES + 1),
            Err(TaskError::TooManySegments(513))
        ));
        assert!(matches!(
            partition(4096, 100),
            Err(TaskError::SegmentTooSmall { size: 4096, num_sges: 100 })
        ));
    }
}

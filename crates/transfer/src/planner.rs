//! Part planning for multipart uploads.

use crate::error::TransferError;
use crate::types::{PartDescriptor, PartStatus};

/// Most parts a single multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;

const MIB: u64 = 1024 * 1024;

/// Returns `true` if an object of `size` bytes should go through multipart.
pub fn should_use_multipart(size: u64, threshold: u64) -> bool {
    size > threshold
}

/// Splits `total_size` bytes into parts of `part_size`.
///
/// Every part is `part_size` long except the last, which holds the
/// remainder. A zero-length trailing part is never produced. An empty object
/// yields no parts.
pub fn plan(total_size: u64, part_size: u64) -> Result<Vec<PartDescriptor>, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidConfig("part size must be positive".into()));
    }

    let full_parts = total_size / part_size;
    let remainder = total_size % part_size;
    let mut count = full_parts + 1;
    let mut last_size = remainder;
    if remainder == 0 {
        // Fold the empty tail away; the previous part is already full size.
        count -= 1;
        last_size = part_size;
    }

    let parts = (0..count)
        .map(|i| {
            let part_number = (i + 1) as u32;
            let size_bytes = if i + 1 == count { last_size } else { part_size };
            PartDescriptor {
                part_number,
                offset: i * part_size,
                size_bytes,
                status: PartStatus::Pending,
                etag: None,
            }
        })
        .collect();
    Ok(parts)
}

/// Part size actually used for an object of `total_size` bytes.
///
/// Grows `configured` (to a whole MiB) when it would need more than
/// [`MAX_PARTS`] parts.
pub fn effective_part_size(total_size: u64, configured: u64) -> u64 {
    if configured == 0 || total_size.div_ceil(configured) <= MAX_PARTS {
        return configured;
    }
    let min = total_size.div_ceil(MAX_PARTS);
    min.div_ceil(MIB) * MIB
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(parts: &[PartDescriptor]) -> Vec<u64> {
        parts.iter().map(|p| p.size_bytes).collect()
    }

    #[test]
    fn multipart_threshold_is_exclusive() {
        assert!(!should_use_multipart(100, 100));
        assert!(should_use_multipart(101, 100));
        assert!(!should_use_multipart(4 * MIB, 5 * MIB));
    }

    #[test]
    fn plans_remainder_as_last_part() {
        let parts = plan(25 * MIB, 10 * MIB).unwrap();
        assert_eq!(sizes(&parts), vec![10 * MIB, 10 * MIB, 5 * MIB]);
        assert_eq!(parts[2].offset, 20 * MIB);
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let parts = plan(30, 10).unwrap();
        assert_eq!(sizes(&parts), vec![10, 10, 10]);
    }

    #[test]
    fn object_smaller_than_part() {
        let parts = plan(3, 10).unwrap();
        assert_eq!(sizes(&parts), vec![3]);
    }

    #[test]
    fn empty_object_has_no_parts() {
        assert!(plan(0, 10).unwrap().is_empty());
    }

    #[test]
    fn zero_part_size_is_rejected() {
        assert!(plan(10, 0).is_err());
    }

    #[test]
    fn sizes_always_sum_up() {
        for total in [1u64, 7, 9, 10, 11, 99, 100, 101, 1234, 4096] {
            for part in [1u64, 3, 7, 10, 64, 1000] {
                let parts = plan(total, part).unwrap();
                assert_eq!(parts.iter().map(|p| p.size_bytes).sum::<u64>(), total);
                assert!(parts.iter().all(|p| p.size_bytes > 0));
                assert_eq!(parts.len() as u64, total.div_ceil(part));
                for (i, p) in parts.iter().enumerate() {
                    assert_eq!(p.part_number as usize, i + 1);
                    assert_eq!(p.offset, i as u64 * part);
                }
            }
        }
    }

    #[test]
    fn effective_part_size_respects_part_limit() {
        assert_eq!(effective_part_size(25 * MIB, 10 * MIB), 10 * MIB);

        let huge = 200 * 1024 * MIB; // 200 GiB at 10 MiB would be 20480 parts.
        let size = effective_part_size(huge, 10 * MIB);
        assert!(huge.div_ceil(size) <= MAX_PARTS);
        assert_eq!(size % MIB, 0);
    }
}

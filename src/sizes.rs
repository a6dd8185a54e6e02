//! Partition and volume sizing engine
//!
//! Translates priority/min/max scale rules and available disk space into
//! concrete byte sizes for the boot stack (ESP, /boot, rootfs) and into
//! guided-resize recommendations for dual-boot installs.
//!
//! # Design
//!
//! - **Pure logic**: No I/O, no side effects, only arithmetic
//! - **Deterministic**: Identical inputs produce identical layouts on any
//!   hardware; partition sizing is safety-critical (an under-sized boot
//!   partition produces an unbootable system) so nothing here consults the
//!   environment
//! - **Caller-validated**: `scale_partitions` assumes
//!   `available >= sum(minimums)`; a violated precondition produces a
//!   negative remainder instead of a silent correction, and callers are
//!   expected to validate before invoking

// Library API, consumed by the sequencer and the guided-storage forms layer
#![allow(dead_code)]

use serde::{Deserialize, Serialize};

/// One mebibyte in bytes.
pub const MIB: i64 = 1 << 20;
/// One gibibyte in bytes.
pub const GIB: i64 = 1 << 30;

/// Round `size` up to the next multiple of `align`.
pub const fn align_up(size: i64, align: i64) -> i64 {
    ((size + align - 1) / align) * align
}

/// Round `size` down to a multiple of `align`.
pub const fn align_down(size: i64, align: i64) -> i64 {
    size - size % align
}

// ============================================================================
// Scale factors
// ============================================================================

/// Sizing rules for one partition: a hard floor, a share weight, and a cap.
///
/// `maximum == -1` marks the partition that absorbs all remaining space;
/// at most one factor per allocation may use it. For every other factor
/// `minimum <= maximum` must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionScaleFactors {
    pub minimum: i64,
    pub priority: i64,
    pub maximum: i64,
}

/// EFI system partition sizing rules.
pub const UEFI_SCALE: PartitionScaleFactors = PartitionScaleFactors {
    minimum: 538 * MIB,
    priority: 538,
    maximum: 1075 * MIB,
};

/// Dedicated /boot sizing rules.
pub const BOOTFS_SCALE: PartitionScaleFactors = PartitionScaleFactors {
    minimum: 1792 * MIB,
    priority: 1024,
    maximum: 2048 * MIB,
};

/// Root filesystem sizing rules: absorbs whatever the boot stack leaves.
pub const ROOTFS_SCALE: PartitionScaleFactors = PartitionScaleFactors {
    minimum: 900 * MIB,
    priority: 10000,
    maximum: -1,
};

/// For the list of scale factors, provide the list of scaled partition sizes.
///
/// Each factor receives `floor(available * priority / sum(priorities))`,
/// clamped to its `[minimum, maximum]` range. The single factor with
/// `maximum == -1` (if its share survived the minimum clamp) is then given
/// all space the other partitions did not claim.
///
/// Assumes at most one factor with `maximum == -1`, and that
/// `available_space` is at least the sum of all partition minimums.
pub fn scale_partitions(all_factors: &[PartitionScaleFactors], available_space: i64) -> Vec<i64> {
    let sum_priorities: i64 = all_factors.iter().map(|factor| factor.priority).sum();
    let mut ret: Vec<i64> = all_factors
        .iter()
        .map(|cur| {
            let scaled = available_space * cur.priority / sum_priorities;
            if scaled < cur.minimum {
                cur.minimum
            } else if cur.maximum != -1 && scaled > cur.maximum {
                cur.maximum
            } else if cur.maximum == -1 && scaled > cur.maximum {
                // The absorbing partition's share survived its minimum:
                // mark it for the remainder pass below.
                -1
            } else {
                scaled
            }
        })
        .collect();

    if let Some(idx) = ret.iter().position(|&size| size == -1) {
        let used: i64 = ret.iter().filter(|&&size| size != -1).sum();
        ret[idx] = available_space - used;
    }
    ret
}

/// Recommended EFI system partition size for `available_space` bytes.
pub fn get_efi_size(available_space: i64) -> i64 {
    let all_factors = [UEFI_SCALE, BOOTFS_SCALE, ROOTFS_SCALE];
    scale_partitions(&all_factors, available_space)[0]
}

/// Recommended /boot partition size for `available_space` bytes.
pub fn get_bootfs_size(available_space: i64) -> i64 {
    let all_factors = [UEFI_SCALE, BOOTFS_SCALE, ROOTFS_SCALE];
    scale_partitions(&all_factors, available_space)[1]
}

// ============================================================================
// Guided resize
// ============================================================================

/// Resize recommendation for shrinking an existing partition to make room
/// for a new install. `minimum <= recommended <= maximum` holds whenever a
/// value is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidedResizeValues {
    /// Largest install the resize can make room for.
    pub install_max: i64,
    /// Smallest size the existing partition may be resized to.
    pub minimum: i64,
    /// Suggested resize midpoint.
    pub recommended: i64,
    /// Largest size the existing partition may keep.
    pub maximum: i64,
}

/// Suggested minimum install size given the source's reported minimum.
///
/// Accounts for a dedicated /boot, an ESP, and room to grow
/// (`max(2GiB, 50% of the source minimum)`), rounded up to `part_align`.
/// Monotonically non-decreasing in `source_min`.
pub fn calculate_suggested_install_min(source_min: i64, part_align: i64) -> i64 {
    let room_for_boot = BOOTFS_SCALE.minimum;
    let room_for_esp = UEFI_SCALE.minimum;
    let room_to_grow = (2 * GIB).max((source_min + 1) / 2);
    align_up(source_min + room_for_boot + room_for_esp + room_to_grow, part_align)
}

/// Plan a guided resize of an existing partition.
///
/// Finds a suggested midpoint between the smallest size the existing
/// partition can shrink to (its reported minimum padded by
/// `max(2GiB, 25%)` of room to grow) and the largest size that still
/// leaves `install_min` free. The midpoint splits the flexible window
/// proportionally to the two minimum sizes, assuming both systems grow
/// in proportion to them.
///
/// Returns `None` if the resize tool reported no minimum (`part_min < 0`)
/// or if shrinking cannot free enough space to fit `install_min`.
pub fn calculate_guided_resize(
    part_min: i64,
    part_size: i64,
    install_min: i64,
    part_align: i64,
) -> Option<GuidedResizeValues> {
    if part_min < 0 {
        return None;
    }

    let part_size = align_up(part_size, part_align);

    let other_room_to_grow = (2 * GIB).max((part_min + 3) / 4);
    let padded_other_min = part_min + other_room_to_grow;
    let other_min = align_up(padded_other_min, part_align).min(part_size);

    let plausible_free_space = part_size - other_min;
    if plausible_free_space < install_min {
        return None;
    }

    let other_max = align_down(part_size - install_min, part_align);
    let resize_window = other_max - other_min;
    // ceil(resize_window * other_min / (other_min + install_min)), exact.
    let denom = (other_min + install_min) as i128;
    let scaled = (resize_window as i128 * other_min as i128 + denom - 1) / denom;
    let recommended = align_up(scaled as i64 + other_min, part_align);

    Some(GuidedResizeValues {
        install_max: plausible_free_space,
        minimum: other_min,
        recommended,
        maximum: other_max,
    })
}

// ============================================================================
// Rootfs scaling
// ============================================================================

/// Scale rootfs usage of the available space to leave room for snapshots
/// and later volumes. Uses more of a small disk so the user does not run
/// out of space earlier than they would expect to.
pub fn scaled_rootfs_size(available: i64) -> i64 {
    if available < 10 * GIB {
        // Use all of a small (<10G) disk.
        available
    } else if available < 20 * GIB {
        // Use 10G of a smallish (<20G) disk.
        10 * GIB
    } else if available < 200 * GIB {
        // Use half of a larger (<200G) disk.
        available / 2
    } else {
        // Use at most 100G of a large disk.
        100 * GIB
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn default_factors() -> [PartitionScaleFactors; 3] {
        [UEFI_SCALE, BOOTFS_SCALE, ROOTFS_SCALE]
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, MIB), MIB);
        assert_eq!(align_up(MIB, MIB), MIB);
        assert_eq!(align_up(MIB + 1, MIB), 2 * MIB);
        assert_eq!(align_down(MIB - 1, MIB), 0);
        assert_eq!(align_down(3 * MIB + 5, MIB), 3 * MIB);
    }

    #[test]
    fn test_scale_partitions_sums_to_available() {
        let available = 20 * GIB;
        let sizes = scale_partitions(&default_factors(), available);
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.iter().sum::<i64>(), available);
    }

    #[test]
    fn test_scale_partitions_respects_bounds() {
        let available = 20 * GIB;
        let sizes = scale_partitions(&default_factors(), available);

        // ESP and /boot land within their clamp windows, close to their
        // priority share of the disk.
        assert!(sizes[0] >= UEFI_SCALE.minimum && sizes[0] <= UEFI_SCALE.maximum);
        assert!(sizes[1] >= BOOTFS_SCALE.minimum && sizes[1] <= BOOTFS_SCALE.maximum);
        // Rootfs absorbs the remainder.
        assert_eq!(sizes[2], available - sizes[0] - sizes[1]);
        assert!(sizes[2] >= ROOTFS_SCALE.minimum);
    }

    #[test]
    fn test_scale_partitions_small_disk_clamps_to_minimums() {
        // On a disk barely larger than the sum of minimums, the priority
        // shares fall below every floor and the minimums win.
        let available = 4 * GIB;
        let sizes = scale_partitions(&default_factors(), available);
        assert_eq!(sizes[0], UEFI_SCALE.minimum);
        assert_eq!(sizes[1], BOOTFS_SCALE.minimum);
        assert_eq!(sizes[2], available - sizes[0] - sizes[1]);
    }

    #[test]
    fn test_scale_partitions_large_disk_clamps_to_maximums() {
        let available = 2000 * GIB;
        let sizes = scale_partitions(&default_factors(), available);
        assert_eq!(sizes[0], UEFI_SCALE.maximum);
        assert_eq!(sizes[1], BOOTFS_SCALE.maximum);
        assert_eq!(sizes[2], available - sizes[0] - sizes[1]);
    }

    #[test]
    fn test_scale_partitions_without_absorber() {
        // No -1 sentinel: sizes are simply the clamped shares.
        let factors = [
            PartitionScaleFactors { minimum: 10, priority: 1, maximum: 100 },
            PartitionScaleFactors { minimum: 10, priority: 1, maximum: 100 },
        ];
        let sizes = scale_partitions(&factors, 60);
        assert_eq!(sizes, vec![30, 30]);
    }

    #[test]
    fn test_efi_and_bootfs_convenience_index_the_same_layout() {
        let available = 20 * GIB;
        let sizes = scale_partitions(&default_factors(), available);
        assert_eq!(get_efi_size(available), sizes[0]);
        assert_eq!(get_bootfs_size(available), sizes[1]);
    }

    #[test]
    fn test_suggested_install_min_small_source() {
        // 1 GiB source: room to grow is the 2 GiB floor.
        let got = calculate_suggested_install_min(GIB, MIB);
        let expected = align_up(GIB + BOOTFS_SCALE.minimum + UEFI_SCALE.minimum + 2 * GIB, MIB);
        assert_eq!(got, expected);
    }

    #[test]
    fn test_suggested_install_min_large_source() {
        // 16 GiB source: room to grow is 50% of the source minimum.
        let source_min = 16 * GIB;
        let got = calculate_suggested_install_min(source_min, MIB);
        let expected = align_up(
            source_min + BOOTFS_SCALE.minimum + UEFI_SCALE.minimum + 8 * GIB,
            MIB,
        );
        assert_eq!(got, expected);
    }

    #[test]
    fn test_suggested_install_min_monotonic_spot_checks() {
        let mut last = 0;
        for source_min in [0, GIB, 4 * GIB, 5 * GIB, 16 * GIB, 100 * GIB] {
            let suggested = calculate_suggested_install_min(source_min, MIB);
            assert!(suggested >= last);
            last = suggested;
        }
    }

    #[test]
    fn test_guided_resize_rejects_unknown_minimum() {
        assert!(calculate_guided_resize(-1, 100 * GIB, 10 * GIB, MIB).is_none());
    }

    #[test]
    fn test_guided_resize_rejects_insufficient_free_space() {
        // 20 GiB partition with 15 GiB used: padding pushes other_min past
        // the point where a 10 GiB install could fit.
        assert!(calculate_guided_resize(15 * GIB, 20 * GIB, 10 * GIB, MIB).is_none());
    }

    #[test]
    fn test_guided_resize_values_are_ordered() {
        let values = calculate_guided_resize(10 * GIB, 100 * GIB, 20 * GIB, MIB)
            .expect("resize should be possible");
        assert!(values.minimum <= values.recommended);
        assert!(values.recommended <= values.maximum);
        assert_eq!(values.maximum, align_down(100 * GIB - 20 * GIB, MIB));
        assert_eq!(values.install_max, 100 * GIB - values.minimum);
    }

    #[test]
    fn test_guided_resize_honors_alignment() {
        let align = MIB;
        let values = calculate_guided_resize(10 * GIB + 3, 100 * GIB + 7, 20 * GIB, align)
            .expect("resize should be possible");
        assert_eq!(values.minimum % align, 0);
        assert_eq!(values.recommended % align, 0);
        assert_eq!(values.maximum % align, 0);
    }

    #[test]
    fn test_scaled_rootfs_size_step_function() {
        assert_eq!(scaled_rootfs_size(5 * GIB), 5 * GIB);
        assert_eq!(scaled_rootfs_size(15 * GIB), 10 * GIB);
        assert_eq!(scaled_rootfs_size(100 * GIB), 50 * GIB);
        assert_eq!(scaled_rootfs_size(500 * GIB), 100 * GIB);
    }

    #[test]
    fn test_scaled_rootfs_size_boundaries() {
        assert_eq!(scaled_rootfs_size(10 * GIB), 10 * GIB);
        assert_eq!(scaled_rootfs_size(20 * GIB), 10 * GIB);
        assert_eq!(scaled_rootfs_size(200 * GIB), 100 * GIB);
    }
}

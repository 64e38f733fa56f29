//! Pass tables for the wipe strategies.
//!
//! The rotational table is Peter Gutmann's 35-pass sequence ("Secure Deletion
//! of Data from Magnetic and Solid-State Memory", 1996): random passes around
//! 27 fixed three-byte patterns aimed at MFM and RLL encodings. The random
//! pass counts come from [`WipeConfig`].

use super::WipeStrategy;
use crate::config::WipeConfig;
use crate::random::RandomQuality;

/// Fixed patterns, each repeated across the whole range.
pub(crate) const GUTMANN_PATTERNS: [[u8; 3]; 27] = [
    [0x55, 0x55, 0x55],
    [0xaa, 0xaa, 0xaa],
    [0x92, 0x49, 0x24],
    [0x49, 0x24, 0x92],
    [0x24, 0x92, 0x49],
    [0x00, 0x00, 0x00],
    [0x11, 0x11, 0x11],
    [0x22, 0x22, 0x22],
    [0x33, 0x33, 0x33],
    [0x44, 0x44, 0x44],
    [0x55, 0x55, 0x55],
    [0x66, 0x66, 0x66],
    [0x77, 0x77, 0x77],
    [0x88, 0x88, 0x88],
    [0x99, 0x99, 0x99],
    [0xaa, 0xaa, 0xaa],
    [0xbb, 0xbb, 0xbb],
    [0xcc, 0xcc, 0xcc],
    [0xdd, 0xdd, 0xdd],
    [0xee, 0xee, 0xee],
    [0xff, 0xff, 0xff],
    [0x92, 0x49, 0x24],
    [0x49, 0x24, 0x92],
    [0x24, 0x92, 0x49],
    [0x6d, 0xb6, 0xdb],
    [0xb6, 0xdb, 0x6d],
    [0xdb, 0x6d, 0xb6],
];

/// Content of a single pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassKind {
    Zero,
    Random(RandomQuality),
    Pattern([u8; 3]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WipePlan {
    pub(crate) applied: WipeStrategy,
    pub(crate) passes: Vec<PassKind>,
}

/// Passes for `strategy` on media with the given rotational flag.
///
/// Unknown media is treated as rotational.
pub(crate) fn plan(strategy: WipeStrategy, rotational: Option<bool>, config: &WipeConfig) -> WipePlan {
    let applied = match strategy {
        WipeStrategy::DiskAdaptive if rotational == Some(false) => WipeStrategy::SolidState,
        other => other,
    };

    let passes = match applied {
        WipeStrategy::Zero => vec![PassKind::Zero],
        WipeStrategy::Random => vec![PassKind::Random(RandomQuality::Normal)],
        WipeStrategy::SolidState => {
            vec![PassKind::Random(RandomQuality::Key); usize::from(config.flash_passes.max(1))]
        }
        WipeStrategy::DiskAdaptive => {
            let random = PassKind::Random(RandomQuality::Normal);
            let mut passes = vec![random; usize::from(config.leading_random_passes)];
            passes.extend(GUTMANN_PATTERNS.iter().copied().map(PassKind::Pattern));
            passes.extend(std::iter::repeat(random).take(usize::from(config.trailing_random_passes)));
            passes
        }
    };

    WipePlan { applied, passes }
}

/// Fill `buf` with `pattern`, where `buf[0]` sits `start` bytes into the wipe.
pub(crate) fn fill_pattern(buf: &mut [u8], pattern: [u8; 3], start: u64) {
    let phase = (start % 3) as usize;
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = pattern[(phase + i) % 3];
    }
}

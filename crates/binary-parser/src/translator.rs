//! Bidirectional file offset / virtual address translation

use crate::common::Segment;
use atlas_core::Address;

/// Maps between file offsets and virtual addresses over a segment table
///
/// Built once from validated, non-overlapping segments. Both directions use
/// binary search; anything outside a file-backed segment range is unmapped.
#[derive(Debug, Clone)]
pub struct AddressTranslator {
    /// Segments sorted by virtual address
    by_address: Vec<Segment>,
    /// Indices into `by_address` for file-backed segments, sorted by file offset
    by_offset: Vec<usize>,
}

impl AddressTranslator {
    pub fn new(segments: &[Segment]) -> Self {
        let mut by_address = segments.to_vec();
        by_address.sort_by_key(|s| s.virtual_address);

        let mut by_offset: Vec<usize> = by_address
            .iter()
            .enumerate()
            .filter(|(_, s)| s.file_size > 0)
            .map(|(i, _)| i)
            .collect();
        by_offset.sort_by_key(|&i| by_address[i].file_offset);

        Self { by_address, by_offset }
    }

    /// Segments sorted by virtual address
    pub fn segments(&self) -> &[Segment] {
        &self.by_address
    }

    /// Find the segment whose virtual range contains `address`
    pub fn segment_containing(&self, address: Address) -> Option<&Segment> {
        let idx = self
            .by_address
            .partition_point(|s| s.virtual_address <= address);
        let segment = self.by_address.get(idx.checked_sub(1)?)?;
        segment.contains(address).then_some(segment)
    }

    /// True when `address` lies in an executable segment
    pub fn is_executable(&self, address: Address) -> bool {
        self.segment_containing(address)
            .is_some_and(Segment::is_executable)
    }

    /// Convert a virtual address to a file offset
    pub fn virtual_to_file_offset(&self, address: Address) -> Option<u64> {
        let segment = self.segment_containing(address)?;
        let delta = address.checked_sub(segment.virtual_address)?;
        if delta >= segment.file_size {
            return None;
        }
        segment.file_offset.checked_add(delta)
    }

    /// Convert a file offset to a virtual address
    pub fn file_offset_to_virtual(&self, offset: u64) -> Option<Address> {
        let idx = self
            .by_offset
            .partition_point(|&i| self.by_address[i].file_offset <= offset);

        // File ranges may overlap (headers are often mapped twice), so check
        // every candidate that starts at or before `offset`, nearest first.
        self.by_offset[..idx].iter().rev().find_map(|&i| {
            let segment = &self.by_address[i];
            let delta = offset - segment.file_offset;
            if delta < segment.file_size && delta < segment.virtual_size {
                segment.virtual_address.checked_add(delta)
            } else {
                None
            }
        })
    }
}

//! Frame Resource Ring.
//!
//! One host-side arena per resource kind (uniforms, random table), each
//! `slot_size * slot_count` bytes, mirroring the GPU buffers the backend
//! allocates. Slots are reached through bounds-checked typed views rather
//! than raw offsets. The slot index and the frame counter advance together
//! in [`FrameRing::claim`], so `slot == frame_index % slot_count` always holds.

use ember_math::align_up;

use crate::config::RANDOM_TABLE_LEN;
use crate::error::PreconditionError;
use crate::layout::Uniforms;

/// Sizes and offsets of the ring buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub slot_count: usize,
    pub uniform_slot_size: u64,
    pub random_slot_size: u64,
}

impl RingLayout {
    /// `uniform_alignment` is the device's dynamic-offset alignment.
    pub fn new(slot_count: usize, uniform_alignment: u64) -> Self {
        // Storage offsets share the same device alignment rule.
        let alignment = uniform_alignment.max(16);
        Self {
            slot_count,
            uniform_slot_size: align_up(Uniforms::SIZE, alignment),
            random_slot_size: align_up((RANDOM_TABLE_LEN * std::mem::size_of::<[f32; 2]>()) as u64, alignment),
        }
    }

    pub fn uniform_offset(&self, slot: usize) -> u64 {
        slot as u64 * self.uniform_slot_size
    }

    pub fn random_offset(&self, slot: usize) -> u64 {
        slot as u64 * self.random_slot_size
    }

    pub fn uniform_buffer_size(&self) -> u64 {
        self.uniform_slot_size * self.slot_count as u64
    }

    pub fn random_buffer_size(&self) -> u64 {
        self.random_slot_size * self.slot_count as u64
    }

    fn check(&self, slot: usize) -> Result<(), PreconditionError> {
        if slot < self.slot_count {
            Ok(())
        } else {
            Err(PreconditionError::SlotOutOfRange {
                slot,
                slot_count: self.slot_count,
            })
        }
    }
}

/// Identifies the slot and frame number handed out by [`FrameRing::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTicket {
    pub slot: usize,
    pub frame_index: u32,
    pub uniform_offset: u64,
    pub random_offset: u64,
}

/// Mutable typed view of one slot.
pub struct SlotViewMut<'a> {
    pub uniforms: &'a mut Uniforms,
    pub random: &'a mut [[f32; 2]],
}

/// Raw bytes of one slot, ready for upload at the slot's offsets.
#[derive(Debug, Clone, Copy)]
pub struct SlotBytes<'a> {
    pub uniforms: &'a [u8],
    pub random: &'a [u8],
}

pub struct FrameRing {
    layout: RingLayout,
    // u32 backing keeps every slot 4-byte aligned for the Uniforms cast.
    uniforms: Vec<u32>,
    random: Vec<u32>,
    slot: usize,
    frame_index: u32,
}

impl FrameRing {
    pub fn new(layout: RingLayout) -> Self {
        Self {
            layout,
            uniforms: vec![0; (layout.uniform_buffer_size() / 4) as usize],
            random: vec![0; (layout.random_buffer_size() / 4) as usize],
            slot: 0,
            frame_index: 0,
        }
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    /// Slot the next claimed frame will use.
    pub fn current_slot(&self) -> usize {
        self.slot
    }

    /// Frame number the next claimed frame will carry.
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Hand out the current slot and advance the slot index and frame
    /// counter by one. The caller must hold a gate permit for this frame.
    pub fn claim(&mut self) -> (FrameTicket, SlotViewMut<'_>) {
        let slot = self.slot;
        let ticket = FrameTicket {
            slot,
            frame_index: self.frame_index,
            uniform_offset: self.layout.uniform_offset(slot),
            random_offset: self.layout.random_offset(slot),
        };
        self.slot = (slot + 1) % self.layout.slot_count;
        self.frame_index = self.frame_index.wrapping_add(1);
        let view = self.view_mut(slot);
        (ticket, view)
    }

    /// Restart numbering at frame 0, slot 0. Only valid once no frame is in flight.
    pub fn reset(&mut self) {
        self.slot = 0;
        self.frame_index = 0;
    }

    /// Bounds-checked typed access to a slot.
    pub fn slot_mut(&mut self, slot: usize) -> Result<SlotViewMut<'_>, PreconditionError> {
        self.layout.check(slot)?;
        Ok(self.view_mut(slot))
    }

    /// Read a slot's uniforms.
    pub fn uniforms(&self, slot: usize) -> Result<&Uniforms, PreconditionError> {
        self.layout.check(slot)?;
        let bytes: &[u8] = bytemuck::cast_slice(&self.uniforms);
        let start = self.layout.uniform_offset(slot) as usize;
        Ok(bytemuck::from_bytes(&bytes[start..start + Uniforms::SIZE as usize]))
    }

    /// Read a slot's random table.
    pub fn random(&self, slot: usize) -> Result<&[[f32; 2]], PreconditionError> {
        self.layout.check(slot)?;
        let pairs: &[[f32; 2]] = bytemuck::cast_slice(&self.random);
        let per_slot = (self.layout.random_slot_size / 8) as usize;
        let start = slot * per_slot;
        Ok(&pairs[start..start + RANDOM_TABLE_LEN])
    }

    /// Bytes of one slot for upload at `uniform_offset` / `random_offset`.
    pub fn slot_bytes(&self, slot: usize) -> Result<SlotBytes<'_>, PreconditionError> {
        self.layout.check(slot)?;
        let uniforms: &[u8] = bytemuck::cast_slice(&self.uniforms);
        let random: &[u8] = bytemuck::cast_slice(&self.random);
        let u = self.layout.uniform_offset(slot) as usize;
        let r = self.layout.random_offset(slot) as usize;
        Ok(SlotBytes {
            uniforms: &uniforms[u..u + self.layout.uniform_slot_size as usize],
            random: &random[r..r + self.layout.random_slot_size as usize],
        })
    }

    fn view_mut(&mut self, slot: usize) -> SlotViewMut<'_> {
        let u = self.layout.uniform_offset(slot) as usize;
        let per_slot = (self.layout.random_slot_size / 8) as usize;
        let uniform_bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.uniforms);
        let pairs: &mut [[f32; 2]] = bytemuck::cast_slice_mut(&mut self.random);
        SlotViewMut {
            uniforms: bytemuck::from_bytes_mut(&mut uniform_bytes[u..u + Uniforms::SIZE as usize]),
            random: &mut pairs[slot * per_slot..slot * per_slot + RANDOM_TABLE_LEN],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        let layout = RingLayout::new(3, 256);
        assert_eq!(layout.uniform_slot_size, 256);
        assert_eq!(layout.random_slot_size, 2048);
        assert_eq!(layout.uniform_buffer_size(), 768);
        assert_eq!(layout.random_buffer_size(), 6144);
    }

    #[test]
    fn test_offsets_never_overlap() {
        let layout = RingLayout::new(3, 256);
        for slot in 0..3 {
            assert_eq!(layout.uniform_offset(slot), slot as u64 * layout.uniform_slot_size);
            assert_eq!(layout.random_offset(slot), slot as u64 * layout.random_slot_size);
            if slot > 0 {
                assert!(layout.uniform_offset(slot) >= layout.uniform_offset(slot - 1) + Uniforms::SIZE);
            }
        }
        assert!(layout.uniform_offset(2) + layout.uniform_slot_size <= layout.uniform_buffer_size());
    }

    #[test]
    fn test_small_alignment_still_fits_uniforms() {
        let layout = RingLayout::new(2, 4);
        assert!(layout.uniform_slot_size >= Uniforms::SIZE);
        assert_eq!(layout.uniform_slot_size % 16, 0);
    }

    #[test]
    fn test_claim_advances_slot_with_frame_index() {
        let mut ring = FrameRing::new(RingLayout::new(3, 256));
        for expected in 0..10u32 {
            let (ticket, _) = ring.claim();
            assert_eq!(ticket.frame_index, expected);
            assert_eq!(ticket.slot, expected as usize % 3);
            assert_eq!(ticket.uniform_offset, ticket.slot as u64 * 256);
        }
        assert_eq!(ring.frame_index(), 10);
        assert_eq!(ring.current_slot(), 1);

        ring.reset();
        assert_eq!(ring.frame_index(), 0);
        assert_eq!(ring.current_slot(), 0);
    }

    #[test]
    fn test_slot_views_are_isolated() {
        let mut ring = FrameRing::new(RingLayout::new(3, 256));
        for slot in 0..3 {
            let view = ring.slot_mut(slot).unwrap();
            view.uniforms.frame_index = slot as u32 + 100;
            view.random.fill([slot as f32, 0.5]);
        }
        for slot in 0..3 {
            assert_eq!(ring.uniforms(slot).unwrap().frame_index, slot as u32 + 100);
            assert!(ring.random(slot).unwrap().iter().all(|r| r[0] == slot as f32));
        }
    }

    #[test]
    fn test_slot_bytes_match_typed_view() {
        let mut ring = FrameRing::new(RingLayout::new(2, 256));
        ring.slot_mut(1).unwrap().uniforms.width = 640;

        let bytes = ring.slot_bytes(1).unwrap();
        assert_eq!(bytes.uniforms.len(), 256);
        assert_eq!(bytes.random.len(), 2048);
        let uniforms: &Uniforms = bytemuck::from_bytes(&bytes.uniforms[..Uniforms::SIZE as usize]);
        assert_eq!(uniforms.width, 640);
    }

    #[test]
    fn test_out_of_range_slot_is_rejected() {
        let mut ring = FrameRing::new(RingLayout::new(3, 256));
        assert_eq!(
            ring.slot_mut(3).err(),
            Some(PreconditionError::SlotOutOfRange { slot: 3, slot_count: 3 })
        );
        assert!(ring.slot_bytes(7).is_err());
    }
}

//! # Ring builder
//!
//! Writes a cyclic chain of pointers into a device buffer, one link per cache line: the word at
//! `i * line + lane * 8` holds the address of the word at `((i + stride) * line + lane * 8) % size`.
//! Every lane of the group builds its own interleaved chain in its own pointer slot of each line,
//! so the chains share the line layout without sharing words.
//!
//! [`Ring`] is the host-side picture of the same chain as an index arena, used to reason about and
//! verify what ended up in device memory.
use crate::POINTER_SIZE;
use crate::config::SyncMode;
use crate::device::{Device, DeviceBuffer, Lane};
use crate::error::{ConfigError, DeviceError, Result};

/// Geometry of one ring, derived from a sweep point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingParams {
    pub ring_length: usize,
    pub allocation_size: usize,
    pub stride: usize,
    pub cache_line_size: usize,
}

impl RingParams {
    pub fn new(allocation_size: usize, stride: usize, cache_line_size: usize) -> Self {
        RingParams {
            ring_length: allocation_size / cache_line_size,
            allocation_size,
            stride,
            cache_line_size,
        }
    }

    /// Byte offset of a lane's slot inside every cache line
    pub fn lane_offset(lane: usize) -> usize {
        lane * POINTER_SIZE
    }

    /// Byte offset of link `index` of `lane`'s chain
    pub fn entry_offset(&self, index: usize, lane: usize) -> usize {
        index * self.cache_line_size + Self::lane_offset(lane)
    }

    /// Byte offset the link at `index` points to
    pub fn link_target(&self, index: usize, lane: usize) -> usize {
        ((index + self.stride) * self.cache_line_size + Self::lane_offset(lane)) % self.allocation_size
    }

    /// True when stride and ring length share a factor, so the chain splits into several shorter
    /// cycles and touches only part of the working set
    pub fn is_degenerate(&self) -> bool {
        self.ring_length > 1 && gcd(self.stride, self.ring_length) != 1
    }

    fn check(&self, buffer: &DeviceBuffer, lanes: usize) -> Result<()> {
        if self.ring_length == 0 || self.allocation_size % self.cache_line_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "allocation of {} bytes is not a whole number of {} byte lines",
                self.allocation_size, self.cache_line_size
            ))
            .into());
        }
        if Self::lane_offset(lanes) > self.cache_line_size {
            return Err(ConfigError::Invalid(format!(
                "{} lane slots do not fit in a {} byte line",
                lanes, self.cache_line_size
            ))
            .into());
        }
        if self.allocation_size > buffer.len() {
            return Err(DeviceError::TransferOutOfBounds {
                offset: 0,
                len: self.allocation_size,
                size: buffer.len(),
            }
            .into());
        }
        Ok(())
    }
}

pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Ring construction kernel. Caller guarantees the geometry fits the buffer (see `make_ring`).
fn ring_kernel(lane: &Lane, params: &RingParams, base: *mut u8, sync: SyncMode) {
    if !lane.in_group() {
        return;
    }

    for i in 0..params.ring_length {
        unsafe {
            let entry = base.add(params.entry_offset(i, lane.id())) as *mut usize;
            let target = base.add(params.link_target(i, lane.id()));
            entry.write(target as usize);
        }
        if sync == SyncMode::Lockstep {
            lane.barrier();
        }
    }
}

/// Build the ring for `params` in `buffer` on every lane of the device's group and wait for it
pub fn make_ring(
    device: &Device,
    params: &RingParams,
    buffer: &DeviceBuffer,
    sync: SyncMode,
) -> Result<()> {
    let lanes = device.lane_group_size();
    params.check(buffer, lanes)?;

    let base = buffer.as_ptr() as usize;
    device.launch(lanes, |lane| ring_kernel(lane, params, base as *mut u8, sync))?;
    Ok(())
}

/// Index-arena form of a ring: `next[i]` is the line the link in line `i` points to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    next: Vec<usize>,
}

impl Ring {
    pub fn new(ring_length: usize, stride: usize) -> Self {
        Ring {
            next: (0..ring_length).map(|i| (i + stride) % ring_length).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    pub fn next(&self, index: usize) -> usize {
        self.next[index]
    }

    /// Line reached after following `steps` links from `start`
    pub fn walk(&self, start: usize, steps: usize) -> usize {
        (0..steps).fold(start, |idx, _| self.next[idx])
    }

    /// Lines visited from `start` until the chain first returns to it
    pub fn cycle(&self, start: usize) -> Vec<usize> {
        let mut visited = vec![start];
        let mut idx = self.next[start];
        while idx != start && visited.len() <= self.next.len() {
            visited.push(idx);
            idx = self.next[idx];
        }
        visited
    }

    pub fn cycle_length(&self, start: usize) -> usize {
        self.cycle(start).len()
    }

    /// True when the cycle through `start` visits every line exactly once
    pub fn covers_all(&self, start: usize) -> bool {
        let cycle = self.cycle(start);
        if cycle.len() != self.next.len() {
            return false;
        }
        let mut seen = vec![false; self.next.len()];
        cycle.iter().all(|&i| !std::mem::replace(&mut seen[i], true))
    }
}

/// Read `lane`'s pointer chain back out of device memory as line indices
pub fn decode_chain(
    buffer: &DeviceBuffer,
    params: &RingParams,
    lane: usize,
) -> std::result::Result<Ring, DeviceError> {
    let base = buffer.as_ptr() as usize;
    let offset = RingParams::lane_offset(lane);
    let next = (0..params.ring_length)
        .map(|i| -> std::result::Result<usize, DeviceError> {
            let addr = buffer.read_word(params.entry_offset(i, lane))?;
            let target = addr.wrapping_sub(base);
            if target >= params.allocation_size || target % params.cache_line_size != offset {
                return Err(DeviceError::TransferOutOfBounds {
                    offset: target,
                    len: POINTER_SIZE,
                    size: params.allocation_size,
                });
            }
            Ok(target / params.cache_line_size)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Ring { next })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_device;

    #[test]
    fn closure_and_coverage_for_coprime_strides() {
        for ring_length in [1usize, 2, 4, 7, 16, 31, 64, 1024] {
            for stride in 1..40 {
                if gcd(stride, ring_length) != 1 {
                    continue;
                }
                let ring = Ring::new(ring_length, stride);
                for start in [0, ring_length / 2, ring_length - 1] {
                    assert_eq!(ring.walk(start, ring_length), start);
                    assert!(ring.covers_all(start), "n={ring_length} stride={stride}");
                }
            }
        }
    }

    #[test]
    fn single_line_is_a_self_loop() {
        let ring = Ring::new(1, 5);
        assert_eq!(ring.next(0), 0);
        assert_eq!(ring.cycle(0), vec![0]);
    }

    #[test]
    fn four_line_ring_with_stride_five() {
        let params = RingParams::new(512, 5, 128);
        assert_eq!(params.ring_length, 4);
        let ring = Ring::new(params.ring_length, params.stride);
        assert_eq!(ring.cycle(0), vec![0, 1, 2, 3]);
        assert_eq!(ring.walk(0, 4), 0);
    }

    #[test]
    fn shared_factor_splits_the_ring() {
        let params = RingParams::new(1024, 4, 128);
        assert!(params.is_degenerate());
        let ring = Ring::new(params.ring_length, params.stride);
        assert_eq!(ring.cycle_length(0), 2);
        assert!(!ring.covers_all(0));
        assert!(!RingParams::new(1024, 5, 128).is_degenerate());
    }

    #[test]
    fn power_of_two_sizes_leave_no_unlinked_line() {
        for shift in 0..12 {
            let size = 128usize << shift;
            let params = RingParams::new(size, 5, 128);
            assert_eq!(params.ring_length * 128, size);
            let last = params.ring_length - 1;
            assert!(params.link_target(last, 0) < size);
        }
    }

    #[test]
    fn device_chain_matches_host_ring() {
        let device = test_device(4);
        let buffer = device.allocate(8192).unwrap();
        let params = RingParams::new(4096, 5, 128);
        make_ring(&device, &params, &buffer, SyncMode::Disjoint).unwrap();

        let expected = Ring::new(params.ring_length, params.stride);
        for lane in 0..4 {
            let decoded = decode_chain(&buffer, &params, lane).unwrap();
            assert_eq!(decoded, expected);
            assert!(decoded.covers_all(0));
        }
        // lane slots beyond the group stay untouched
        assert_eq!(buffer.read_word(RingParams::lane_offset(4)).unwrap(), 0);
    }

    #[test]
    fn lanes_outside_the_group_write_nothing() {
        let device = test_device(2);
        let buffer = device.allocate(2048).unwrap();
        let params = RingParams::new(2048, 5, 128);
        let base = buffer.as_ptr() as usize;

        device
            .launch(5, |lane| {
                ring_kernel(lane, &params, base as *mut u8, SyncMode::Disjoint)
            })
            .unwrap();

        let expected = Ring::new(params.ring_length, params.stride);
        for lane in 0..2 {
            assert_eq!(decode_chain(&buffer, &params, lane).unwrap(), expected);
        }
        for line in 0..params.ring_length {
            for lane in 2..5 {
                assert_eq!(buffer.read_word(params.entry_offset(line, lane)).unwrap(), 0);
            }
        }
    }

    #[test]
    fn lockstep_build_matches_disjoint_build() {
        let device = test_device(2);
        let a = device.allocate(2048).unwrap();
        let b = device.allocate(2048).unwrap();
        let params = RingParams::new(2048, 5, 128);
        make_ring(&device, &params, &a, SyncMode::Disjoint).unwrap();
        make_ring(&device, &params, &b, SyncMode::Lockstep).unwrap();
        for lane in 0..2 {
            assert_eq!(
                decode_chain(&a, &params, lane).unwrap(),
                decode_chain(&b, &params, lane).unwrap()
            );
        }
    }

    #[test]
    fn building_twice_is_byte_identical() {
        let device = test_device(2);
        let buffer = device.allocate(4096).unwrap();
        let params = RingParams::new(4096, 5, 128);

        make_ring(&device, &params, &buffer, SyncMode::Disjoint).unwrap();
        let mut first = vec![0u8; 4096];
        buffer.copy_to_host(0, &mut first).unwrap();

        make_ring(&device, &params, &buffer, SyncMode::Disjoint).unwrap();
        let mut second = vec![0u8; 4096];
        buffer.copy_to_host(0, &mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn ring_larger_than_buffer_is_rejected() {
        let device = test_device(1);
        let buffer = device.allocate(1024).unwrap();
        let params = RingParams::new(2048, 5, 128);
        assert!(make_ring(&device, &params, &buffer, SyncMode::Disjoint).is_err());
    }
}

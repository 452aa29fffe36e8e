//! Host block to internal frame adapter
//!
//! Hosts call with arbitrary block sizes; the engine works on fixed frames of
//! [`FRAME_SIZE`] samples. Input is accumulated per channel and, once a frame
//! is complete, handed to a callback that produces the next frame of output.
//! Output is therefore delayed by exactly one frame.

use crate::FRAME_SIZE;

/// Per-channel input/output FIFOs sized for the maximum channel counts
#[derive(Debug, Clone)]
pub struct FrameAdapter {
    in_fifo: Vec<Vec<f32>>,
    out_fifo: Vec<Vec<f32>>,
    /// Samples accumulated in the current frame
    position: usize,
}

impl FrameAdapter {
    /// Allocate FIFOs once; nothing is allocated afterwards
    pub fn new(max_inputs: usize, max_outputs: usize) -> Self {
        Self {
            in_fifo: vec![vec![0.0; FRAME_SIZE]; max_inputs],
            out_fifo: vec![vec![0.0; FRAME_SIZE]; max_outputs],
            position: 0,
        }
    }

    /// Added latency in samples
    pub fn latency(&self) -> usize {
        FRAME_SIZE
    }

    pub fn max_inputs(&self) -> usize {
        self.in_fifo.len()
    }

    pub fn max_outputs(&self) -> usize {
        self.out_fifo.len()
    }

    /// Samples that can be pushed before the frame is full
    #[inline]
    pub fn space(&self) -> usize {
        FRAME_SIZE - self.position
    }

    #[inline]
    pub fn is_frame_ready(&self) -> bool {
        self.position == FRAME_SIZE
    }

    /// Copy `len` samples starting at `offset` of every input channel
    ///
    /// Missing channels, and the part of a channel shorter than
    /// `offset + len`, are stored as silence. Extra channels are ignored.
    /// `len` is clipped to [`space`](Self::space). Returns the samples taken.
    pub fn push<T: AsRef<[f32]>>(&mut self, inputs: &[T], offset: usize, len: usize) -> usize {
        let len = len.min(self.space());
        let dst = self.position..self.position + len;

        for (ch, fifo) in self.in_fifo.iter_mut().enumerate() {
            let fifo = &mut fifo[dst.clone()];
            let src = inputs.get(ch).map_or(&[][..], |i| i.as_ref());
            let start = offset.min(src.len());
            let available = (src.len() - start).min(len);
            fifo[..available].copy_from_slice(&src[start..start + available]);
            fifo[available..].fill(0.0);
        }

        len
    }

    /// Copy previously produced output for the samples just pushed
    ///
    /// Must be called with the same `offset`/`len` as the matching `push`,
    /// before the frame is completed. Output channels beyond the adapter's
    /// capacity are zero-filled; channels shorter than `offset + len` get
    /// the part that fits.
    pub fn pull<T: AsMut<[f32]>>(&mut self, outputs: &mut [T], offset: usize, len: usize) {
        let src = self.position..self.position + len;

        for (ch, out) in outputs.iter_mut().enumerate() {
            let out = out.as_mut();
            let end = (offset + len).min(out.len());
            if offset >= end {
                continue;
            }
            let dst = &mut out[offset..end];
            match self.out_fifo.get(ch) {
                Some(fifo) => dst.copy_from_slice(&fifo[src.start..src.start + dst.len()]),
                None => dst.fill(0.0),
            }
        }

        self.position += len;
    }

    /// Run `on_frame` over the full input frame and restart accumulation
    ///
    /// When `on_frame` returns `false` the frame was not rendered: the output
    /// frame is silenced and the accumulated input discarded.
    pub fn complete_frame<F>(&mut self, mut on_frame: F)
    where
        F: FnMut(&[Vec<f32>], &mut [Vec<f32>]) -> bool,
    {
        debug_assert!(self.is_frame_ready());

        if !on_frame(&self.in_fifo, &mut self.out_fifo) {
            for fifo in &mut self.out_fifo {
                fifo.fill(0.0);
            }
            for fifo in &mut self.in_fifo {
                fifo.fill(0.0);
            }
        }
        self.position = 0;
    }

    /// Feed a host block of `num_samples`, calling `on_frame` at each frame boundary
    pub fn process_block<I, O, F>(&mut self, inputs: &[I], outputs: &mut [O], num_samples: usize, mut on_frame: F)
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
        F: FnMut(&[Vec<f32>], &mut [Vec<f32>]) -> bool,
    {
        let mut offset = 0;
        while offset < num_samples {
            let len = self.push(inputs, offset, num_samples - offset);
            self.pull(outputs, offset, len);
            offset += len;

            if self.is_frame_ready() {
                self.complete_frame(&mut on_frame);
            }
        }
    }

    /// Silence all FIFOs and restart accumulation
    pub fn reset(&mut self) {
        for fifo in self.in_fifo.iter_mut().chain(self.out_fifo.iter_mut()) {
            fifo.fill(0.0);
        }
        self.position = 0;
    }
}

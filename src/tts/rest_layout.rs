//! Positional schema of the chunked vocoder's inputs and outputs.
//!
//! The first-chunk graph emits, and the middle/last graphs consume, one
//! tensor per padding point of the convolution stack. Whatever builds those
//! graphs and whatever threads the tensors between calls must agree on every
//! position, so both go through [`RestLayout`].
//!
//! | slot | content |
//! |------|---------|
//! | 0 | audio out / features in |
//! | 1 | pre-conv rest |
//! | 2 .. 2+U | upsample rests |
//! | then 2·U·K·D | residual-block rests |
//! | then U·(K−1) | cross-block add rests |
//! | then 1 | post-conv rest |
//! | last | loudness |

use crate::error::{EngineError, Result};
use crate::model::VocoderConfig;

/// Which of the two padded convolutions inside a residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResblockConv {
    Dilated = 0,
    Plain = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestLayout {
    upsamples: usize, // U
    kernels: usize,   // K
    dilations: usize, // D
}

impl RestLayout {
    pub const AUDIO: usize = 0;
    pub const PRECONV: usize = 1;

    pub fn new(upsamples: usize, kernels: usize, dilations: usize) -> Self {
        Self { upsamples, kernels, dilations }
    }

    /// Layout for a vocoder geometry.
    ///
    /// # Errors
    /// Returns a resource error if the geometry is inconsistent.
    pub fn from_config(config: &VocoderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.upsample_rates.len(), config.resblock_kernel_sizes.len(), config.resblock_dilation_sizes[0].len()))
    }

    pub fn upsample(&self, u: usize) -> usize {
        2 + u
    }

    fn resblock_base(&self) -> usize {
        2 + self.upsamples
    }

    pub fn resblock_count(&self) -> usize {
        2 * self.upsamples * self.kernels * self.dilations
    }

    /// Slot of one residual-block padding point.
    pub fn resblock(&self, u: usize, k: usize, d: usize, conv: ResblockConv) -> usize {
        self.resblock_base() + ((u * self.kernels + k) * self.dilations + d) * 2 + conv as usize
    }

    fn add_base(&self) -> usize {
        self.resblock_base() + self.resblock_count()
    }

    pub fn add_count(&self) -> usize {
        self.upsamples * self.kernels.saturating_sub(1)
    }

    /// Slot of the add rest between kernel `k - 1` and `k` of upsample stage `u`, `k >= 1`.
    pub fn add(&self, u: usize, k: usize) -> usize {
        self.add_base() + u * (self.kernels - 1) + (k - 1)
    }

    pub fn postconv(&self) -> usize {
        self.add_base() + self.add_count()
    }

    pub fn loudness(&self) -> usize {
        self.postconv() + 1
    }

    /// Number of carried convolution rests, pre-conv and post-conv included.
    pub fn rest_count(&self) -> usize {
        2 + self.upsamples + self.resblock_count() + self.add_count()
    }

    /// Total number of positions: audio, the rests, loudness.
    pub fn total(&self) -> usize {
        1 + self.rest_count() + 1
    }

    /// Left padding of every convolution slot, indexed by slot
    /// (`AUDIO` and the loudness slot are 0).
    pub fn paddings(&self, config: &VocoderConfig) -> Vec<usize> {
        let mut pads = vec![0; self.total()];
        pads[Self::PRECONV] = config.pre_conv_kernel / 2;
        for u in 0..self.upsamples {
            pads[self.upsample(u)] = config.upsample_kernel_sizes[u].saturating_sub(config.upsample_rates[u]) / 2;
        }
        for u in 0..self.upsamples {
            for k in 0..self.kernels {
                let kernel = config.resblock_kernel_sizes[k];
                let plain = (kernel - 1) / 2;
                for d in 0..self.dilations {
                    let dilated = (kernel - 1) * config.resblock_dilation_sizes[k][d] / 2;
                    pads[self.resblock(u, k, d, ResblockConv::Dilated)] = dilated;
                    pads[self.resblock(u, k, d, ResblockConv::Plain)] = plain;
                }
                if k > 0 {
                    let last_dilation = config.resblock_dilation_sizes[k][self.dilations - 1];
                    pads[self.add(u, k)] = (kernel - 1) * last_dilation / 2 + plain;
                }
            }
        }
        pads[self.postconv()] = config.post_conv_kernel / 2;
        pads
    }

    /// Check a graph produced exactly one tensor per position.
    ///
    /// # Errors
    /// Returns a shape error on mismatch, which would otherwise shift every rest.
    pub fn check_count(&self, graph: &str, count: usize) -> Result<()> {
        if count != self.total() {
            return Err(EngineError::shape(format!("{} has {} outputs, vocoder layout expects {}", graph, count, self.total())));
        }
        Ok(())
    }

    /// Human readable slot name for logs.
    pub fn slot_name(&self, slot: usize) -> String {
        if slot == Self::AUDIO {
            return "audio".to_string();
        }
        if slot == Self::PRECONV {
            return "preconv".to_string();
        }
        if slot < self.resblock_base() {
            return format!("upsample_{}", slot - 2);
        }
        if slot < self.add_base() {
            let offset = slot - self.resblock_base();
            let conv = if offset % 2 == 0 { "convs1" } else { "convs2" };
            let group = offset / 2;
            let d = group % self.dilations;
            let k = (group / self.dilations) % self.kernels;
            let u = group / (self.dilations * self.kernels);
            return format!("ups_{}_kernel_{}_dilation_{}_{}", u, k, d, conv);
        }
        if slot < self.postconv() {
            let offset = slot - self.add_base();
            return format!("ups_{}_add_{}", offset / (self.kernels - 1), offset % (self.kernels - 1) + 1);
        }
        if slot == self.postconv() {
            return "postconv".to_string();
        }
        if slot == self.loudness() {
            return "loudness".to_string();
        }
        format!("slot_{}", slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_geometry_positions() {
        let layout = RestLayout::new(4, 3, 3);
        assert_eq!(layout.upsample(0), 2);
        assert_eq!(layout.resblock(0, 0, 0, ResblockConv::Dilated), 6);
        assert_eq!(layout.resblock(3, 2, 2, ResblockConv::Plain), 77);
        assert_eq!(layout.add(0, 1), 78);
        assert_eq!(layout.add(3, 2), 85);
        assert_eq!(layout.postconv(), 86);
        assert_eq!(layout.loudness(), 87);
        assert_eq!(layout.total(), 88);
        assert_eq!(layout.rest_count(), 86);
    }

    #[test]
    fn test_slots_are_unique() {
        let layout = RestLayout::new(4, 3, 3);
        let names: std::collections::HashSet<String> = (0..layout.total()).map(|i| layout.slot_name(i)).collect();
        assert_eq!(names.len(), layout.total());
        assert_eq!(layout.slot_name(8), "ups_0_kernel_0_dilation_1_convs1");
    }

    #[test]
    fn test_check_count() {
        let layout = RestLayout::new(4, 3, 3);
        assert!(layout.check_count("vocoder", 88).is_ok());
        assert!(layout.check_count("vocoder", 87).is_err());
    }
}

//! Packets streamed out of the synthesis pipeline.

/// What a packet carries. Only audio is played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Metadata,
}

/// One chunk of synthesized output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPacket {
    pub kind: PacketKind,
    pub samples: Vec<f32>, // Mono samples
    pub sample_rate: u32,
    pub is_final: bool, // Last packet of the request
}

impl OutputPacket {
    pub fn audio(samples: Vec<f32>, sample_rate: u32, is_final: bool) -> Self {
        Self { kind: PacketKind::Audio, samples, sample_rate, is_final }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

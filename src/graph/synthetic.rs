//! Deterministic graphs standing in for compiled models.
//!
//! They follow the tensor contracts of the real graphs closely enough to
//! drive the whole pipeline: the vocoder in particular runs a chain of
//! padded moving-average convolutions, one per rest slot, so chunked output
//! matches a whole-sequence pass exactly.

use std::collections::{BTreeMap, HashMap};

use ndarray::{Axis, Ix2};

use super::{GraphExecutor, GraphLoader, GraphRole, no_output, not_ready};
use crate::error::{EngineError, Result};
use crate::model::{
    Actor, EOS_TOKEN, Emotion, END_MARKER, Language, LanguagePackDescriptor, PhonemizerModuleRef, SOS_TOKEN, START_MARKER, SpeakerModuleDescriptor,
    Vocabularies, VocoderConfig,
};
use crate::scheduler::ChunkType;
use crate::tensor::{Tensor, slice_axis, tail_axis};
use crate::tts::RestLayout;

const DEFAULT_FRAMES_PER_SYMBOL: usize = 4;

/// Frames dropped from the end of the last vocoder chunk.
pub const LAST_CHUNK_TRIM: usize = 3;

/// Symbols of the demo module besides the letters.
const DEMO_SYMBOLS: &[&str] = &[" ", ".", ",", "!", "?", "'", "-", "ð", "ə", START_MARKER, END_MARKER];

/// Builds synthetic executors for any descriptor.
#[derive(Debug, Clone)]
pub struct SyntheticLoader {
    frames_per_symbol: usize, // Encoder frames per symbol at speed 1.0
}

impl Default for SyntheticLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticLoader {
    pub fn new() -> Self {
        Self { frames_per_symbol: DEFAULT_FRAMES_PER_SYMBOL }
    }

    pub fn with_frames_per_symbol(frames_per_symbol: usize) -> Self {
        Self { frames_per_symbol: frames_per_symbol.max(1) }
    }

    /// A small English speaker module with one actor.
    pub fn demo_module(name: &str, actor: &str) -> SpeakerModuleDescriptor {
        let eng = Language::new("eng").with_key(0);
        let mut symbol_to_id = HashMap::new();
        for (i, c) in ('a'..='z').enumerate() {
            symbol_to_id.insert(c.to_string(), i as i32 + 1);
        }
        for (i, s) in DEMO_SYMBOLS.iter().enumerate() {
            symbol_to_id.insert(s.to_string(), i as i32 + 27);
        }

        let mut phonemizer_modules = BTreeMap::new();
        phonemizer_modules.insert("eng".to_string(), PhonemizerModuleRef { module_id: "eng-g2p".to_string(), languages: vec![eng.clone()], name: None });

        SpeakerModuleDescriptor {
            name: name.to_string(),
            actors: vec![Actor { username: actor.to_string(), actorkey: 1, firstname: None, lastname: None }],
            emotions: vec![
                Emotion { emotionsetkey: 0, emotionsetname: "Emotionless".to_string() },
                Emotion { emotionsetkey: 1, emotionsetname: "Happy".to_string() },
            ],
            languages: vec![eng],
            symbol_to_id,
            phonemizer_modules,
            config: VocoderConfig {
                sampling_rate: 44100,
                n_mel_channels: 4,
                decoder_chunk_length: 10,
                chunk_boundary_length_ratio: 4,
                upsample_rates: vec![2, 2, 2, 2],
                upsample_kernel_sizes: vec![4, 4, 4, 4],
                // Unit residual kernels keep the demo's convolution delay short
                resblock_kernel_sizes: vec![1, 1, 1],
                resblock_dilation_sizes: vec![vec![1, 3, 5]; 3],
                pre_conv_kernel: 3,
                post_conv_kernel: 3,
            },
            recording_data_info: None,
        }
    }

    /// The English language pack referenced by [`SyntheticLoader::demo_module`].
    ///
    /// Letters phonemize to themselves; "the" is pre-seeded in the lookup.
    pub fn demo_language_pack() -> LanguagePackDescriptor {
        let mut vocab = HashMap::new();
        vocab.insert(SOS_TOKEN.to_string(), 1);
        vocab.insert(EOS_TOKEN.to_string(), 2);
        for (i, c) in ('a'..='z').enumerate() {
            vocab.insert(c.to_string(), i as i32 + 3);
        }
        let ivocab: HashMap<i32, String> = vocab.iter().map(|(k, v)| (*v, k.clone())).collect();

        let mut lookup = HashMap::new();
        lookup.insert("the".to_string(), "ðə".to_string());

        LanguagePackDescriptor {
            module_id: "eng-g2p".to_string(),
            name: None,
            languages: vec![Language::new("eng")],
            vocabularies: Vocabularies { grapheme_vocab: vocab.clone(), phoneme_vocab: vocab, grapheme_ivocab: ivocab.clone(), phoneme_ivocab: ivocab },
            lookup,
        }
    }
}

impl GraphLoader for SyntheticLoader {
    fn load_speaker_graph(&self, module: &SpeakerModuleDescriptor, role: GraphRole) -> Result<Box<dyn GraphExecutor>> {
        let config = &module.config;
        config.validate()?;
        let name = format!("{}/{}", module.name, role);
        let graph: Box<dyn GraphExecutor> = match role {
            GraphRole::Encoder => Box::new(SyntheticEncoder::new(name, config.n_mel_channels, self.frames_per_symbol)),
            GraphRole::DecoderPreprocess => Box::new(SyntheticPreprocess::new(name, config.boundary_length())),
            GraphRole::DecoderChunk => Box::new(SyntheticDecoderChunk::new(name, config.chunk_hop_length(), config.boundary_length())),
            GraphRole::VocoderFirst => Box::new(SyntheticVocoder::new(name, config, ChunkType::First)?),
            GraphRole::VocoderMiddle => Box::new(SyntheticVocoder::new(name, config, ChunkType::Middle)?),
            GraphRole::VocoderLast => Box::new(SyntheticVocoder::new(name, config, ChunkType::Last)?),
        };
        Ok(graph)
    }

    fn load_phonemizer(&self, pack: &LanguagePackDescriptor) -> Result<Box<dyn GraphExecutor>> {
        Ok(Box::new(SyntheticPhonemizer::new(pack)?))
    }
}

fn output_at(name: &str, done: bool, outputs: &[Tensor], index: usize) -> Result<Tensor> {
    if !done {
        return Err(not_ready(name));
    }
    outputs.get(index).cloned().ok_or_else(|| no_output(name, index, outputs.len()))
}

fn expect_inputs(name: &str, inputs: &[Tensor], count: usize) -> Result<()> {
    if inputs.len() != count {
        return Err(EngineError::graph(name, format!("expected {} inputs, got {}", count, inputs.len())));
    }
    Ok(())
}

/// One symbol per step; each symbol spans `round(frames / speed)` frames.
struct SyntheticEncoder {
    name: String,
    channels: usize,
    frames_per_symbol: usize,
    phonemes: Vec<i32>,
    emotions: Vec<i32>,
    speed: Vec<f32>,
    loudness: Vec<f32>,
    cursor: usize,
    frames: Vec<Vec<f32>>, // One feature column per frame
    frame_loudness: Vec<f32>,
    outputs: Vec<Tensor>,
    done: bool,
}

impl SyntheticEncoder {
    fn new(name: String, channels: usize, frames_per_symbol: usize) -> Self {
        Self {
            name,
            channels,
            frames_per_symbol,
            phonemes: Vec::new(),
            emotions: Vec::new(),
            speed: Vec::new(),
            loudness: Vec::new(),
            cursor: 0,
            frames: Vec::new(),
            frame_loudness: Vec::new(),
            outputs: Vec::new(),
            done: false,
        }
    }

    fn finish(&mut self) -> Result<()> {
        let t = self.frames.len();
        let mut features = Vec::with_capacity(self.channels * t);
        for c in 0..self.channels {
            features.extend(self.frames.iter().map(|f| f[c]));
        }
        self.outputs = vec![
            Tensor::float(&[1, self.channels, t], features)?,
            Tensor::float(&[1, 1, t], vec![1.0; t])?,
            Tensor::zeros_f32(&[1]),
            Tensor::zeros_f32(&[1]),
            Tensor::zeros_f32(&[1]),
            Tensor::float(&[1, 1, t], std::mem::take(&mut self.frame_loudness))?,
        ];
        Ok(())
    }
}

impl GraphExecutor for SyntheticEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
        expect_inputs(&self.name, &inputs, 6)?;
        self.phonemes = inputs[0].to_i32_vec();
        self.emotions = inputs[1].to_i32_vec();
        self.speed = inputs[4].to_f32_vec();
        self.loudness = inputs[5].to_f32_vec();
        let n = self.phonemes.len();
        if self.emotions.len() != n || self.speed.len() != n || self.loudness.len() != n {
            return Err(EngineError::graph(&self.name, "symbol streams differ in length"));
        }
        self.cursor = 0;
        self.frames.clear();
        self.frame_loudness.clear();
        self.outputs.clear();
        self.done = false;
        Ok(())
    }

    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        if let Some(&id) = self.phonemes.get(self.cursor) {
            let speed = self.speed[self.cursor].max(0.1);
            let count = ((self.frames_per_symbol as f32 / speed).round() as usize).max(1);
            let emotion = self.emotions[self.cursor] as f32;
            let column: Vec<f32> = (0..self.channels).map(|c| ((id * (c as i32 + 1)) as f32 * 0.37 + emotion * 0.05).sin() * 0.5).collect();
            for _ in 0..count {
                self.frames.push(column.clone());
                self.frame_loudness.push(self.loudness[self.cursor]);
            }
            self.cursor += 1;
        }
        if self.cursor < self.phonemes.len() {
            return Ok(true);
        }
        self.finish()?;
        self.done = true;
        Ok(false)
    }

    fn output_count(&self) -> usize {
        6
    }

    fn output(&self, index: usize) -> Result<Tensor> {
        output_at(&self.name, self.done, &self.outputs, index)
    }
}

/// Passes the encoder features through and seeds a zero carry.
struct SyntheticPreprocess {
    name: String,
    overlap: usize,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    done: bool,
}

impl SyntheticPreprocess {
    fn new(name: String, overlap: usize) -> Self {
        Self { name, overlap, inputs: Vec::new(), outputs: Vec::new(), done: false }
    }
}

impl GraphExecutor for SyntheticPreprocess {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
        expect_inputs(&self.name, &inputs, 2)?;
        if inputs[0].shape().len() != 3 {
            return Err(EngineError::graph(&self.name, format!("features must be [1, C, T], got {:?}", inputs[0].shape())));
        }
        self.inputs = inputs;
        self.outputs.clear();
        self.done = false;
        Ok(())
    }

    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let features = self.inputs[0].clone();
        let channels = features.shape()[1];
        self.outputs = vec![features.clone(), features, Tensor::zeros_f32(&[1, channels, self.overlap]), self.inputs[1].clone()];
        self.done = true;
        Ok(false)
    }

    fn output_count(&self) -> usize {
        4
    }

    fn output(&self, index: usize) -> Result<Tensor> {
        output_at(&self.name, self.done, &self.outputs, index)
    }
}

/// Emits `hop` frames per window, the remainder on the last one.
struct SyntheticDecoderChunk {
    name: String,
    hop: usize,
    overlap: usize,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    done: bool,
}

impl SyntheticDecoderChunk {
    fn new(name: String, hop: usize, overlap: usize) -> Self {
        Self { name, hop, overlap, inputs: Vec::new(), outputs: Vec::new(), done: false }
    }
}

impl GraphExecutor for SyntheticDecoderChunk {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
        expect_inputs(&self.name, &inputs, 8)?;
        self.inputs = inputs;
        self.outputs.clear();
        self.done = false;
        Ok(())
    }

    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let index = self.inputs[0].first_i32()?.max(0) as usize;
        let chunk_length = self.inputs[1].first_i32()?.max(0) as usize;
        let latent = self.inputs[2].as_float()?;
        let carry = self.inputs[7].as_float()?;
        if carry.shape().get(1) != latent.shape().get(1) {
            return Err(EngineError::graph(&self.name, format!("carry {:?} does not match latent {:?}", carry.shape(), latent.shape())));
        }

        let total = latent.len_of(Axis(2));
        let start = index * self.hop;
        let is_last = index > 0 && total.saturating_sub(start) < chunk_length;
        let only = index == 0 && total <= self.hop;
        let end = if is_last || only { total } else { (start + self.hop).min(total) };

        let features = slice_axis(latent, 2, start, end);
        let mask = slice_axis(self.inputs[4].as_float()?, 2, start, end);
        let next_carry = tail_axis(&features, 2, self.overlap);
        self.outputs = vec![Tensor::Float(features), Tensor::Float(mask), Tensor::Float(next_carry)];
        self.done = true;
        Ok(false)
    }

    fn output_count(&self) -> usize {
        3
    }

    fn output(&self, index: usize) -> Result<Tensor> {
        output_at(&self.name, self.done, &self.outputs, index)
    }
}

/// Chunked vocoder built from moving-average convolutions.
///
/// Features are averaged over channels into one frame-rate signal, passed
/// through one same-padded moving average per rest slot (pre-conv through
/// post-conv, in slot order, one slot per step), then each frame is repeated
/// `samples_per_frame` times and scaled by the request's mean loudness.
pub struct SyntheticVocoder {
    name: String,
    chunk: ChunkType,
    layout: RestLayout,
    pads: Vec<usize>,
    samples_per_frame: usize,
    signal: Vec<f32>,
    rests: Vec<Vec<f32>>,
    gain: f32,
    cursor: usize,
    outputs: Vec<Tensor>,
    done: bool,
}

impl SyntheticVocoder {
    /// Create one of the three chunk graphs.
    ///
    /// # Errors
    /// Returns a resource error for an invalid geometry.
    pub fn new(name: impl Into<String>, config: &VocoderConfig, chunk: ChunkType) -> Result<Self> {
        let layout = RestLayout::from_config(config)?;
        let pads = layout.paddings(config);
        Ok(Self {
            name: name.into(),
            chunk,
            layout,
            pads,
            samples_per_frame: config.samples_per_frame(),
            signal: Vec::new(),
            rests: Vec::new(),
            gain: 1.0,
            cursor: 0,
            outputs: Vec::new(),
            done: false,
        })
    }

    /// Whole-sequence output for the same geometry, the reference the
    /// chunked graphs reproduce.
    ///
    /// # Errors
    /// Returns a shape error if `features` is not `[1, C, T]`.
    pub fn reference(config: &VocoderConfig, features: &Tensor, loudness: &Tensor) -> Result<Vec<f32>> {
        let layout = RestLayout::from_config(config)?;
        let pads = layout.paddings(config);
        let mut signal = channel_mean(features)?;
        for &pad in &pads[RestLayout::PRECONV..=layout.postconv()] {
            let mut padded = vec![0.0; pad];
            padded.extend_from_slice(&signal);
            padded.extend(std::iter::repeat_n(0.0, pad));
            signal = moving_average(&padded, pad);
        }
        Ok(upsample(&signal, config.samples_per_frame(), mean_or_one(&loudness.to_f32_vec())))
    }

    fn finish(&mut self) -> Result<()> {
        let audio = upsample(&self.signal, self.samples_per_frame, self.gain);
        let audio = Tensor::float(&[1, audio.len()], audio)?;
        if self.chunk == ChunkType::Last {
            self.outputs = vec![audio];
            return Ok(());
        }

        let mut outputs = Vec::with_capacity(self.layout.total());
        outputs.push(audio);
        for rest in self.rests.drain(RestLayout::PRECONV..=self.layout.postconv()) {
            outputs.push(Tensor::float(&[rest.len()], rest)?);
        }
        outputs.push(Tensor::scalar_f32(self.gain));
        self.outputs = outputs;
        Ok(())
    }
}

impl GraphExecutor for SyntheticVocoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
        let total = self.layout.total();
        self.rests = vec![Vec::new(); total];
        match self.chunk {
            ChunkType::First | ChunkType::Whole => {
                expect_inputs(&self.name, &inputs, 2)?;
                self.gain = mean_or_one(&inputs[1].to_f32_vec());
            }
            ChunkType::Middle | ChunkType::Last => {
                expect_inputs(&self.name, &inputs, total)?;
                for slot in RestLayout::PRECONV..=self.layout.postconv() {
                    self.rests[slot] = inputs[slot].to_f32_vec();
                }
                self.gain = inputs[self.layout.loudness()].first_f32()?;
            }
        }
        self.signal = channel_mean(&inputs[RestLayout::AUDIO])?;
        if self.chunk == ChunkType::Last {
            self.signal.truncate(self.signal.len().saturating_sub(LAST_CHUNK_TRIM));
        }
        self.cursor = RestLayout::PRECONV;
        self.outputs.clear();
        self.done = false;
        Ok(())
    }

    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let pad = self.pads[self.cursor];
        let mut buffer = match self.chunk {
            ChunkType::First | ChunkType::Whole => vec![0.0; pad],
            ChunkType::Middle | ChunkType::Last => std::mem::take(&mut self.rests[self.cursor]),
        };
        buffer.extend_from_slice(&self.signal);
        if self.chunk == ChunkType::Last {
            buffer.extend(std::iter::repeat_n(0.0, pad));
        } else {
            let keep = (2 * pad).min(buffer.len());
            self.rests[self.cursor] = buffer[buffer.len() - keep..].to_vec();
        }
        self.signal = moving_average(&buffer, pad);

        self.cursor += 1;
        if self.cursor <= self.layout.postconv() {
            return Ok(true);
        }
        self.finish()?;
        self.done = true;
        Ok(false)
    }

    fn output_count(&self) -> usize {
        if self.chunk == ChunkType::Last { 1 } else { self.layout.total() }
    }

    fn output(&self, index: usize) -> Result<Tensor> {
        output_at(&self.name, self.done, &self.outputs, index)
    }
}

/// Valid moving average with window `2 * pad + 1`.
fn moving_average(buffer: &[f32], pad: usize) -> Vec<f32> {
    let window = 2 * pad + 1;
    buffer.windows(window).map(|w| w.iter().sum::<f32>() / window as f32).collect()
}

fn upsample(signal: &[f32], samples_per_frame: usize, gain: f32) -> Vec<f32> {
    signal.iter().flat_map(|&v| std::iter::repeat_n(v * gain, samples_per_frame)).collect()
}

fn mean_or_one(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 1.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn channel_mean(features: &Tensor) -> Result<Vec<f32>> {
    let array = features.as_float()?;
    if array.ndim() != 3 {
        return Err(EngineError::shape(format!("vocoder features must be [1, C, T], got {:?}", array.shape())));
    }
    let channels = array.len_of(Axis(1)).max(1) as f32;
    Ok(array.sum_axis(Axis(1)).iter().map(|v| v / channels).collect())
}

/// Next-symbol phonemizer mapping each grapheme to the phoneme of the same
/// spelling, one batch row per step.
struct SyntheticPhonemizer {
    name: String,
    phoneme_for: HashMap<i32, i32>, // Grapheme id to phoneme id
    grapheme_eos: i32,
    phoneme_eos: i32,
    source: ndarray::Array2<i32>,
    target: ndarray::Array2<i32>,
    active: Vec<i32>,
    next: Vec<i32>,
    outputs: Vec<Tensor>,
    done: bool,
}

impl SyntheticPhonemizer {
    fn new(pack: &LanguagePackDescriptor) -> Result<Self> {
        let vocab = &pack.vocabularies;
        let eos = |map: &HashMap<String, i32>| map.get(EOS_TOKEN).copied().ok_or_else(|| EngineError::resource(format!("{} has no {} token", pack.module_id, EOS_TOKEN)));
        let phoneme_for = vocab.grapheme_vocab.iter().filter_map(|(g, id)| vocab.phoneme_vocab.get(g).map(|p| (*id, *p))).collect();
        Ok(Self {
            name: format!("{}/phonemizer", pack.module_id),
            phoneme_for,
            grapheme_eos: eos(&vocab.grapheme_vocab)?,
            phoneme_eos: eos(&vocab.phoneme_vocab)?,
            source: ndarray::Array2::zeros((0, 0)),
            target: ndarray::Array2::zeros((0, 0)),
            active: Vec::new(),
            next: Vec::new(),
            outputs: Vec::new(),
            done: false,
        })
    }

    fn next_symbol(&self, row: usize) -> i32 {
        if self.active.get(row).copied().unwrap_or(0) == 0 {
            return self.phoneme_eos;
        }
        match self.source.get((row, self.target.ncols())) {
            Some(&id) if id != 0 && id != self.grapheme_eos => self.phoneme_for.get(&id).copied().unwrap_or(self.phoneme_eos),
            _ => self.phoneme_eos,
        }
    }
}

impl GraphExecutor for SyntheticPhonemizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, inputs: Vec<Tensor>) -> Result<()> {
        expect_inputs(&self.name, &inputs, 3)?;
        let as_2d = |t: &Tensor| t.as_int().and_then(|a| a.clone().into_dimensionality::<Ix2>().map_err(|e| EngineError::shape(e.to_string())));
        self.source = as_2d(&inputs[0])?;
        self.target = as_2d(&inputs[1])?;
        self.active = inputs[2].to_i32_vec();
        if self.source.nrows() != self.target.nrows() || self.active.len() != self.target.nrows() {
            return Err(EngineError::graph(&self.name, "batch sizes differ between inputs"));
        }
        self.next.clear();
        self.outputs.clear();
        self.done = false;
        Ok(())
    }

    fn step(&mut self) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let row = self.next.len();
        if row < self.target.nrows() {
            let symbol = self.next_symbol(row);
            self.next.push(symbol);
        }
        if self.next.len() < self.target.nrows() {
            return Ok(true);
        }

        let (rows, cols) = self.target.dim();
        let mut data = Vec::with_capacity(rows * (cols + 1));
        for (r, &next) in self.next.iter().enumerate() {
            data.extend(self.target.row(r).iter().copied());
            data.push(next);
        }
        self.outputs = vec![Tensor::int(&[rows, cols + 1], data)?];
        self.done = true;
        Ok(false)
    }

    fn output_count(&self) -> usize {
        1
    }

    fn output(&self, index: usize) -> Result<Tensor> {
        output_at(&self.name, self.done, &self.outputs, index)
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tiny decode: run the full generation loop on a random Whisper model.
//!
//! ```bash
//! RUST_LOG=whisper_decode=debug cargo run --example tiny_decode
//! ```
//!
//! No checkpoint is needed: weights come from a `VarMap`, so the tokens
//! are meaningless, but every stage (encoder, cached prefill, forced
//! tokens, timestamp grammar, stopping) runs and logs.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing_subscriber::EnvFilter;
use whisper_decode::{
    Activation, ForcingPlan, GenerationConfig, GenerationRequest, Greedy, LogitProcessorList,
    TimestampConfig, TimestampProcessor, WhisperConfig, WhisperModel, generate,
};

fn main() -> whisper_decode::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 0..=39 text, 40 eos, 41 start, 42 notimestamps, 43..=63 timestamps
    let config = WhisperConfig {
        d_model: 32,
        encoder_layers: 2,
        decoder_layers: 2,
        encoder_attention_heads: 4,
        decoder_attention_heads: 4,
        encoder_ffn_dim: 64,
        decoder_ffn_dim: 64,
        num_mel_bins: 8,
        max_source_positions: 16,
        max_target_positions: 32,
        vocab_size: 64,
        activation: Activation::Gelu,
        scale_embedding: false,
        tie_word_embeddings: true,
        layer_norm_eps: 1e-5,
        decoder_start_token_id: 41,
        eos_token_id: 40,
        pad_token_id: 40,
    };
    let generation = GenerationConfig {
        max_length: 24,
        decoder_start_token_id: 41,
        eos_token_id: 40,
        pad_token_id: 40,
        no_timestamps_token_id: Some(42),
        max_initial_timestamp_index: Some(4),
        ..GenerationConfig::default()
    };

    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = WhisperModel::load(config.clone(), &device, DType::F32, vb)?;

    // Force one text token right after the start token, then let the
    // timestamp grammar take over.
    let plan = ForcingPlan::tags(vec![(1, 7)]);
    let forced = plan.processor()?;
    let begin_index = forced.table().len().max(1);
    let timestamps = TimestampConfig::from_generation_config(&generation, begin_index)?;
    let processors = LogitProcessorList::new()
        .with(forced)
        .with(TimestampProcessor::new(timestamps));

    let batch = 2;
    let features = Tensor::randn(
        0f32,
        1f32,
        (batch, config.num_mel_bins, config.input_frames()),
        &device,
    )?;
    let request = GenerationRequest::from_generation_config(&generation, batch);
    let output = generate(&model, &features, &request, &processors, &mut Greedy)?;

    println!("stop reason: {}", output.stop_reason);
    for (row, tokens) in output.sequences.iter().enumerate() {
        println!("row {row}: {tokens:?}");
    }
    Ok(())
}

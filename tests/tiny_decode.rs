// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: a tiny randomly initialised Whisper model on CPU.
//!
//! Weights come from a `VarMap`, so no checkpoint download is needed.
//! The tests check behaviour that holds for any weights: cached decoding
//! matches a full pass, processors are honoured, and the loop stops for
//! the right reason.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use whisper_decode::{
    Activation, DecodeError, DecodeSession, DecoderMasks, ForcedTokensProcessor,
    GenerationConfig, GenerationRequest, GenerationState, Greedy, LogitProcessor,
    LogitProcessorList, Seq2SeqBackend, StopOnTokens, StopReason, TemperatureSampler, TimestampConfig,
    TimestampProcessor, WhisperConfig, WhisperModel, generate,
};

const EOS: u32 = 11;
const NO_MASKS: DecoderMasks<'static> = DecoderMasks::none();
const PAD: u32 = 10;

fn tiny_config() -> WhisperConfig {
    WhisperConfig {
        d_model: 8,
        encoder_layers: 2,
        decoder_layers: 2,
        encoder_attention_heads: 2,
        decoder_attention_heads: 2,
        encoder_ffn_dim: 16,
        decoder_ffn_dim: 16,
        num_mel_bins: 4,
        max_source_positions: 4,
        max_target_positions: 16,
        vocab_size: 12,
        activation: Activation::Gelu,
        scale_embedding: false,
        tie_word_embeddings: true,
        layer_norm_eps: 1e-5,
        decoder_start_token_id: 0,
        eos_token_id: EOS,
        pad_token_id: PAD,
    }
}

fn tiny_model(config: WhisperConfig) -> (WhisperModel, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = WhisperModel::load(config, &Device::Cpu, DType::F32, vb).unwrap();
    (model, varmap)
}

/// Mel features `[batch, 4, 8]` (8 = 2 * max_source_positions).
fn features(batch: usize) -> Tensor {
    Tensor::randn(0f32, 1f32, (batch, 4, 8), &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn ids(tokens: &[u32]) -> Tensor {
    Tensor::from_vec(tokens.to_vec(), (1, tokens.len()), &Device::Cpu).unwrap()
}

fn positions(range: std::ops::Range<u32>) -> Tensor {
    let len = range.len();
    Tensor::from_vec(range.collect::<Vec<_>>(), (1, len), &Device::Cpu).unwrap()
}

// ---------------------------------------------------------------------------
// Model and cache
// ---------------------------------------------------------------------------

#[test]
fn encoder_output_shape() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(2)).unwrap();
    assert_eq!(enc.dims(), &[2, 4, 8]);
}

#[test]
fn encoder_rejects_wrong_frame_count() {
    let (model, _varmap) = tiny_model(tiny_config());
    let bad = Tensor::zeros((1, 4, 6), DType::F32, &Device::Cpu).unwrap();
    assert!(matches!(model.encode(&bad), Err(DecodeError::ShapeMismatch(_))));
}

#[test]
fn cached_decoding_matches_full_pass() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let tokens = [0u32, 3, 5, 7, 2, 9];

    let full = model
        .decode(&ids(&tokens), &positions(0..6), &enc, NO_MASKS, None)
        .unwrap();

    let mut cache = model.new_cache(1, 8).unwrap();
    let prefill = model
        .decode(&ids(&tokens[..2]), &positions(0..2), &enc, NO_MASKS, Some(&mut cache))
        .unwrap();
    assert_eq!(cache.cursor(), 2);
    assert!(max_abs_diff(&prefill, &full.narrow(1, 0, 2).unwrap()) < 1e-4);

    for (pos, &token) in tokens.iter().enumerate().skip(2) {
        let p = u32::try_from(pos).unwrap();
        let step = model
            .decode(&ids(&[token]), &positions(p..p + 1), &enc, NO_MASKS, Some(&mut cache))
            .unwrap();
        let expected = full.narrow(1, pos, 1).unwrap();
        assert!(
            max_abs_diff(&step, &expected) < 1e-4,
            "position {pos} diverges from the full pass"
        );
    }
    assert_eq!(cache.cursor(), 6);
    assert!(cache.is_consistent());
}

#[test]
fn untied_projection_is_loaded() {
    let config = WhisperConfig {
        tie_word_embeddings: false,
        ..tiny_config()
    };
    let (model, varmap) = tiny_model(config);
    let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
    assert!(names.iter().any(|n| n == "proj_out.weight"));
    let enc = model.encode(&features(1)).unwrap();
    let logits = model
        .decode(&ids(&[0]), &positions(0..1), &enc, NO_MASKS, None)
        .unwrap();
    assert_eq!(logits.dims(), &[1, 1, 12]);
}

#[test]
fn cache_larger_than_positional_table_is_rejected() {
    let (model, _varmap) = tiny_model(tiny_config());
    assert!(matches!(model.new_cache(1, 17), Err(DecodeError::Config(_))));
}

#[test]
fn full_cache_rejects_another_step() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let mut cache = model.new_cache(1, 2).unwrap();
    model
        .decode(&ids(&[0, 1]), &positions(0..2), &enc, NO_MASKS, Some(&mut cache))
        .unwrap();
    let err = model
        .decode(&ids(&[2]), &positions(2..3), &enc, NO_MASKS, Some(&mut cache))
        .unwrap_err();
    assert!(matches!(err, DecodeError::CacheMisuse(_)));
}

#[test]
fn cached_positions_must_continue_the_cache() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let mut cache = model.new_cache(1, 8).unwrap();

    let err = model
        .decode(&ids(&[0, 1]), &positions(1..3), &enc, NO_MASKS, Some(&mut cache))
        .unwrap_err();
    assert!(matches!(err, DecodeError::ShapeMismatch(_)));
    assert_eq!(cache.cursor(), 0);

    model
        .decode(&ids(&[0, 1]), &positions(0..2), &enc, NO_MASKS, Some(&mut cache))
        .unwrap();
    let err = model
        .decode(&ids(&[2]), &positions(9..10), &enc, NO_MASKS, Some(&mut cache))
        .unwrap_err();
    assert!(matches!(err, DecodeError::ShapeMismatch(_)));
    assert_eq!(cache.cursor(), 2);

    model
        .decode(&ids(&[2]), &positions(2..3), &enc, NO_MASKS, Some(&mut cache))
        .unwrap();
    assert_eq!(cache.cursor(), 3);
}

#[test]
fn padded_decoder_position_is_ignored() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let padding = Tensor::new(&[[1u8, 0, 1]], &Device::Cpu).unwrap();
    let masks = DecoderMasks::none().with_decoder_padding(&padding);

    // Position 2 never sees position 1, so the token there cannot matter.
    let a = model
        .decode(&ids(&[0, 3, 5]), &positions(0..3), &enc, masks, None)
        .unwrap();
    let b = model
        .decode(&ids(&[0, 9, 5]), &positions(0..3), &enc, masks, None)
        .unwrap();
    let last = |t: &Tensor| t.narrow(1, 2, 1).unwrap();
    assert!(max_abs_diff(&last(&a), &last(&b)) < 1e-5);

    let unmasked = model
        .decode(&ids(&[0, 9, 5]), &positions(0..3), &enc, NO_MASKS, None)
        .unwrap();
    assert!(max_abs_diff(&last(&b), &last(&unmasked)) > 1e-6);

    // Cached: the same padding indexed by absolute cache slot.
    let mut cache = model.new_cache(1, 3).unwrap();
    model
        .decode(&ids(&[0, 9]), &positions(0..2), &enc, masks, Some(&mut cache))
        .unwrap();
    let step = model
        .decode(&ids(&[5]), &positions(2..3), &enc, masks, Some(&mut cache))
        .unwrap();
    assert!(max_abs_diff(&step, &last(&a)) < 1e-4);
}

#[test]
fn padded_encoder_frame_is_ignored() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let noise = Tensor::randn(0f32, 5f32, (1, 1, 8), &Device::Cpu).unwrap();
    let kept = enc.narrow(1, 0, 3).unwrap();
    let frames = Tensor::cat(&[&kept, &noise], 1).unwrap();
    assert_eq!(frames.dims(), &[1, 4, 8]);

    let padding = Tensor::new(&[[1u8, 1, 1, 0]], &Device::Cpu).unwrap();
    let masks = DecoderMasks::none().with_encoder_padding(&padding);
    let a = model
        .decode(&ids(&[0, 4]), &positions(0..2), &enc, masks, None)
        .unwrap();
    let b = model
        .decode(&ids(&[0, 4]), &positions(0..2), &frames, masks, None)
        .unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-5);
}

#[test]
fn padding_with_wrong_length_is_rejected() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let padding = Tensor::new(&[[1u8, 1]], &Device::Cpu).unwrap();
    let masks = DecoderMasks::none().with_decoder_padding(&padding);
    let mut cache = model.new_cache(1, 4).unwrap();
    let err = model
        .decode(&ids(&[0, 1]), &positions(0..2), &enc, masks, Some(&mut cache))
        .unwrap_err();
    assert!(matches!(err, DecodeError::ShapeMismatch(_)));
}

#[test]
fn from_dir_round_trips_saved_weights() {
    let (model, varmap) = tiny_model(tiny_config());
    let dir = std::env::temp_dir().join(format!("whisper-decode-from-dir-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    varmap.save(dir.join("model.safetensors")).unwrap();
    let config = serde_json::json!({
        "model_type": "whisper",
        "d_model": 8,
        "encoder_layers": 2,
        "decoder_layers": 2,
        "encoder_attention_heads": 2,
        "decoder_attention_heads": 2,
        "encoder_ffn_dim": 16,
        "decoder_ffn_dim": 16,
        "num_mel_bins": 4,
        "max_source_positions": 4,
        "max_target_positions": 16,
        "vocab_size": 12,
        "activation_function": "gelu",
        "decoder_start_token_id": 0,
        "eos_token_id": EOS,
        "pad_token_id": PAD
    });
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();

    let loaded = WhisperModel::from_dir(&dir, &Device::Cpu, DType::F32).unwrap();
    assert_eq!(loaded.config(), model.config());

    let input = features(1);
    let a = model.encode(&input).unwrap();
    let b = loaded.encode(&input).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-6);

    std::fs::remove_dir_all(&dir).unwrap();
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[test]
fn forced_tokens_appear_at_their_steps() {
    let (model, _varmap) = tiny_model(tiny_config());
    let forced = ForcedTokensProcessor::from_pairs(&[(1, 7), (2, 3)]).unwrap();
    let processors = LogitProcessorList::new().with(forced);
    let request = GenerationRequest::new(vec![vec![0]], 6);
    let output = generate(&model, &features(1), &request, &processors, &mut Greedy).unwrap();

    assert_eq!(output.stop_reason, StopReason::MaxLength);
    assert_eq!(output.sequences.len(), 1);
    assert_eq!(output.sequences[0].len(), 6);
    assert_eq!(&output.sequences[0][..3], &[0, 7, 3]);
}

#[test]
fn greedy_generation_is_deterministic() {
    let (model, _varmap) = tiny_model(tiny_config());
    let input = features(2);
    let request = GenerationRequest::new(vec![vec![0]; 2], 10);
    let processors = LogitProcessorList::new();

    let a = generate(&model, &input, &request, &processors, &mut Greedy).unwrap();
    let b = generate(&model, &input, &request, &processors, &mut Greedy).unwrap();
    assert_eq!(a.sequences, b.sequences);
}

#[test]
fn seeded_sampling_is_reproducible() {
    let (model, _varmap) = tiny_model(tiny_config());
    let input = features(1);
    let request = GenerationRequest::new(vec![vec![0]], 12);
    let processors = LogitProcessorList::new();

    let mut first = TemperatureSampler::new(0.8, 42).unwrap();
    let mut second = TemperatureSampler::new(0.8, 42).unwrap();
    let a = generate(&model, &input, &request, &processors, &mut first).unwrap();
    let b = generate(&model, &input, &request, &processors, &mut second).unwrap();
    assert_eq!(a.sequences, b.sequences);
}

/// Row 0 ends at step 1; row 1 emits `4` until step 3, then ends.
struct Scripted;

impl LogitProcessor for Scripted {
    fn process(
        &self,
        tokens: &[Vec<u32>],
        logits: &Tensor,
        step: usize,
    ) -> whisper_decode::Result<Tensor> {
        let vocab = logits.dim(1)?;
        let rows: Vec<f32> = (0..tokens.len())
            .flat_map(|row| {
                let target = match (row, step) {
                    (0, _) => EOS,
                    (_, s) if s >= 3 => EOS,
                    _ => 4,
                };
                (0..vocab).map(move |v| if v == target as usize { 0.0 } else { f32::MIN })
            })
            .collect();
        Ok(Tensor::from_vec(rows, (tokens.len(), vocab), logits.device())?)
    }
}

#[test]
fn finished_rows_are_padded_until_all_reach_eos() {
    let (model, _varmap) = tiny_model(tiny_config());
    let processors = LogitProcessorList::new().with(Scripted);
    let request = GenerationRequest::new(vec![vec![0]; 2], 10).with_eos(EOS, PAD);
    let output = generate(&model, &features(2), &request, &processors, &mut Greedy).unwrap();

    assert_eq!(output.stop_reason, StopReason::Eos);
    assert_eq!(output.sequences[0], vec![0, EOS, PAD, PAD]);
    assert_eq!(output.sequences[1], vec![0, 4, 4, EOS]);
}

#[test]
fn max_new_tokens_bounds_the_output() {
    let (model, _varmap) = tiny_model(tiny_config());
    let request = GenerationRequest::new(vec![vec![0, 1, 2]], 16).with_max_new_tokens(2);
    let output = generate(
        &model,
        &features(1),
        &request,
        &LogitProcessorList::new(),
        &mut Greedy,
    )
    .unwrap();
    assert_eq!(output.stop_reason, StopReason::MaxLength);
    assert_eq!(output.sequences[0].len(), 5);
    assert_eq!(&output.sequences[0][..3], &[0, 1, 2]);
}

#[test]
fn stopping_criterion_ends_generation() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let forced = ForcedTokensProcessor::from_pairs(&[(1, 7)]).unwrap();
    let processors = LogitProcessorList::new().with(forced);
    let request = GenerationRequest::new(vec![vec![0]], 10);
    let mut greedy = Greedy;

    let mut session = DecodeSession::new(&model, enc, &request, &processors, &mut greedy)
        .unwrap()
        .with_stopping(StopOnTokens::new(vec![7], 1));
    assert_eq!(session.run().unwrap(), StopReason::Criterion);
    assert_eq!(session.finish().sequences, vec![vec![0, 7]]);
}

#[test]
fn session_steps_through_states() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let processors = LogitProcessorList::new();
    let request = GenerationRequest::new(vec![vec![0, 1]], 8).keep_cache(true);
    let mut greedy = Greedy;

    let mut session = DecodeSession::new(&model, enc, &request, &processors, &mut greedy).unwrap();
    assert_eq!(session.state(), GenerationState::Prefill);
    assert_eq!(session.cache().cursor(), 0);

    assert_eq!(session.step().unwrap(), GenerationState::Decode);
    assert_eq!(session.cache().cursor(), 2);
    assert_eq!(session.sequences()[0].len(), 2);

    assert_eq!(session.step().unwrap(), GenerationState::Decode);
    assert_eq!(session.sequences()[0].len(), 3);
    assert_eq!(session.cache().cursor(), 3);

    let output = session.finish();
    assert_eq!(output.stop_reason, StopReason::Cancelled);
    assert_eq!(output.cache.map(|c| c.cursor()), Some(3));
}

#[test]
fn prompt_filling_max_length_stops_without_decoding() {
    let (model, _varmap) = tiny_model(tiny_config());
    let enc = model.encode(&features(1)).unwrap();
    let processors = LogitProcessorList::new();
    let request = GenerationRequest::new(vec![vec![0, 1, 2]], 3);
    let mut greedy = Greedy;

    let mut session = DecodeSession::new(&model, enc, &request, &processors, &mut greedy).unwrap();
    assert_eq!(session.run().unwrap(), StopReason::MaxLength);
    assert_eq!(session.cache().cursor(), 0);
    assert_eq!(session.step().unwrap(), GenerationState::Done(StopReason::MaxLength));
    assert_eq!(session.finish().sequences, vec![vec![0, 1, 2]]);
}

#[test]
fn invalid_requests_are_rejected() {
    let (model, _varmap) = tiny_model(tiny_config());
    let input = features(1);
    let processors = LogitProcessorList::new();

    let too_long = GenerationRequest::new(vec![vec![0, 1, 2, 3]], 3);
    assert!(matches!(
        generate(&model, &input, &too_long, &processors, &mut Greedy),
        Err(DecodeError::Config(_))
    ));

    let beyond_positions = GenerationRequest::new(vec![vec![0]], 32);
    assert!(matches!(
        generate(&model, &input, &beyond_positions, &processors, &mut Greedy),
        Err(DecodeError::Config(_))
    ));

    let empty = GenerationRequest::new(vec![Vec::new()], 4);
    assert!(matches!(
        generate(&model, &input, &empty, &processors, &mut Greedy),
        Err(DecodeError::ShapeMismatch(_))
    ));

    let ragged = GenerationRequest::new(vec![vec![0], vec![0, 1]], 4);
    assert!(matches!(
        generate(&model, &features(2), &ragged, &processors, &mut Greedy),
        Err(DecodeError::ShapeMismatch(_))
    ));

    let batch_mismatch = GenerationRequest::new(vec![vec![0]; 2], 4);
    assert!(matches!(
        generate(&model, &input, &batch_mismatch, &processors, &mut Greedy),
        Err(DecodeError::ShapeMismatch(_))
    ));
}

#[test]
fn timestamp_grammar_holds_on_generated_rows() {
    // 0..=4 text, 5 eos, 6 notimestamps, 7..=11 timestamps
    let config = WhisperConfig {
        eos_token_id: 5,
        pad_token_id: 5,
        ..tiny_config()
    };
    let (model, _varmap) = tiny_model(config);
    let generation = GenerationConfig {
        max_length: 12,
        decoder_start_token_id: 0,
        eos_token_id: 5,
        pad_token_id: 5,
        no_timestamps_token_id: Some(6),
        ..GenerationConfig::default()
    };
    let timestamps = TimestampConfig::from_generation_config(&generation, 1).unwrap();
    assert_eq!(timestamps.timestamp_begin, 7);

    let processors = LogitProcessorList::new().with(TimestampProcessor::new(timestamps));
    let request = GenerationRequest::from_generation_config(&generation, 3);
    let output = generate(&model, &features(3), &request, &processors, &mut Greedy).unwrap();

    for row in &output.sequences {
        let generated = &row[1..];
        assert!(!generated.contains(&6), "notimestamps generated in {row:?}");
        let stamps: Vec<u32> = generated.iter().copied().filter(|&t| t >= 7).collect();
        assert!(
            stamps.windows(2).all(|w| w[0] <= w[1]),
            "timestamps decrease in {row:?}"
        );
    }
}

//! Integration tests for pipeline-staged T5 forwards.
//!
//! Most models are built with `VarBuilder::zeros` on CPU; the split-invariance
//! tests use random weights so that a broken hand-off shows up in the outputs.
//! Each test drives the stages of a plan one after the other, handing the
//! bundle of one stage to the next exactly as separate processes would.

use candle_core::{DType, Device, DeviceLocation, Tensor};
use candle_nn::{VarBuilder, VarMap};
use stagesim_core::{
    config::T5Config,
    distributed::{
        Advisory, ConfigurationError, Diagnostics, PipelineError, PipelineStageConfig,
        T5StagePlan,
    },
    models::{
        EncoderInputs, FeatureRequest, Seq2SeqInputs, StageBundle, StageContext, StageOutput,
        T5EncoderModel, T5ForConditionalGeneration, T5Model, IGNORE_INDEX,
    },
    testing::{
        tiny_t5_config, tiny_t5_single_block_config, tiny_t5_standard_config,
        CountingCheckpointer, RecordingBinder,
    },
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const TINY_T5: &str = r#"{
    "vocab_size": 128,
    "d_model": 32,
    "d_kv": 8,
    "d_ff": 64,
    "num_layers": 1,
    "num_decoder_layers": 1,
    "num_heads": 4,
    "dropout_rate": 0.0,
    "is_gated_act": true,
    "dense_act_fn": "gelu_new",
    "use_cache": false
}"#;

fn tiny_config() -> T5Config {
    serde_json::from_str(TINY_T5).expect("tiny config must parse")
}

fn tiny_config_with_depth(encoder: usize, decoder: usize) -> T5Config {
    T5Config {
        num_layers: encoder,
        num_decoder_layers: Some(decoder),
        ..tiny_config()
    }
}

fn zeros_vb() -> VarBuilder<'static> {
    VarBuilder::zeros(DType::F32, &Device::Cpu)
}

fn ids(batch: usize, seq_len: usize) -> Tensor {
    Tensor::zeros((batch, seq_len), DType::U32, &Device::Cpu).unwrap()
}

/// Fill every variable of `varmap` with normal noise.
fn randomize(varmap: &VarMap) {
    for var in varmap.all_vars() {
        let values = Tensor::randn(0f32, 0.3, var.shape(), var.device()).unwrap();
        var.set(&values).unwrap();
    }
}

/// Drive every stage of `plan`, feeding each the previous stage's bundle.
fn run_stages<T>(
    plan: &T5StagePlan,
    mut stage_forward: impl FnMut(StageBundle, &StageContext<'_>) -> StageOutput<T>,
) -> T {
    let mut bundle = StageBundle::default();
    for stage in 0..plan.num_stages() {
        let manager = plan.stage_config(stage).unwrap();
        let ctx = StageContext::from_plan(&manager, plan);
        match stage_forward(std::mem::take(&mut bundle), &ctx) {
            StageOutput::Handoff(next) => bundle = next,
            StageOutput::Final(out) => {
                assert_eq!(stage, plan.num_stages() - 1, "only the last stage is final");
                return out;
            }
        }
    }
    panic!("pipeline ended without a final output");
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
        .to_scalar()
        .unwrap()
}

/// Run every stage of `plan` in order, returning the final output.
fn run_lm_pipeline(
    model: &T5ForConditionalGeneration,
    plan: &T5StagePlan,
    first: Seq2SeqInputs,
    diag: &mut Diagnostics,
) -> stagesim_core::models::Seq2SeqLMOutput {
    let mut bundle = StageBundle::default();
    for stage in 0..plan.num_stages() {
        let manager = plan.stage_config(stage).unwrap();
        let ctx = StageContext::from_plan(&manager, plan);
        let inputs = Seq2SeqInputs {
            bundle: std::mem::take(&mut bundle),
            ..first.clone()
        };
        match model.stage_forward(inputs, &ctx, diag).unwrap() {
            StageOutput::Handoff(next) => bundle = next,
            StageOutput::Final(out) => {
                assert_eq!(stage, plan.num_stages() - 1, "only the last stage is final");
                return out;
            }
        }
    }
    panic!("pipeline ended without a final output");
}

// ─── End-to-end ──────────────────────────────────────────────────────────────

#[test]
fn two_stage_generation_round_trip() {
    let cfg = tiny_config();
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();
    assert_eq!(plan.decoder_starting_stage(), 1);

    let mut diag = Diagnostics::new();

    // Stage 0 is the last encoder stage: it returns only encoder outputs.
    let manager0 = plan.stage_config(0).unwrap();
    let ctx0 = StageContext::from_plan(&manager0, &plan);
    let stage0 = model
        .stage_forward(
            Seq2SeqInputs {
                input_ids: Some(ids(2, 5)),
                ..Seq2SeqInputs::default()
            },
            &ctx0,
            &mut diag,
        )
        .unwrap();
    let bundle = stage0.into_handoff().expect("stage 0 hands off");
    assert!(bundle.hidden_states.is_none());
    assert!(bundle.position_bias.is_none());
    let encoder_outputs = bundle.encoder_outputs.as_ref().expect("encoder outputs");
    assert_eq!(encoder_outputs.last_hidden_state.dims(), &[2, 5, 32]);

    // Stage 1 is the whole decoder.
    let manager1 = plan.stage_config(1).unwrap();
    let ctx1 = StageContext::from_plan(&manager1, &plan);
    let out = model
        .stage_forward(
            Seq2SeqInputs {
                decoder_input_ids: Some(ids(2, 3)),
                bundle: bundle.clone(),
                ..Seq2SeqInputs::default()
            },
            &ctx1,
            &mut diag,
        )
        .unwrap()
        .into_final()
        .expect("stage 1 is final");
    assert_eq!(out.logits.dims(), &[2, 3, cfg.vocab_size]);
    assert!(out.loss.is_none());
    assert_eq!(out.encoder_last_hidden_state.dims(), &[2, 5, 32]);
    assert!(out.past_key_values.is_none());
    assert!(out.decoder_attentions.is_none());

    // With labels the same stage also yields a scalar loss.
    let labels = Tensor::new(&[[1i64, 2, IGNORE_INDEX], [3, IGNORE_INDEX, IGNORE_INDEX]], &Device::Cpu)
        .unwrap();
    let out = model
        .stage_forward(
            Seq2SeqInputs {
                decoder_input_ids: Some(ids(2, 3)),
                labels: Some(labels),
                bundle,
                ..Seq2SeqInputs::default()
            },
            &ctx1,
            &mut diag,
        )
        .unwrap()
        .into_final()
        .unwrap();
    let loss = out.loss.expect("loss with labels");
    assert_eq!(loss.dims(), &[] as &[usize]);
    // Zero weights give uniform logits.
    let loss: f32 = loss.to_scalar().unwrap();
    assert!((loss - (cfg.vocab_size as f32).ln()).abs() < 1e-4, "loss = {loss}");
    assert!(diag.is_empty());
}

#[test]
fn four_stage_pipeline_threads_biases() {
    let cfg = tiny_config_with_depth(4, 4);
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(4, 4, 4).unwrap();
    assert_eq!(plan.decoder_starting_stage(), 2);

    let mut diag = Diagnostics::new();
    let first = Seq2SeqInputs {
        input_ids: Some(ids(1, 6)),
        decoder_input_ids: Some(ids(1, 4)),
        ..Seq2SeqInputs::default()
    };

    // Encoder middle stage hands over hidden states and the self-attention bias.
    let manager0 = plan.stage_config(0).unwrap();
    let bundle0 = model
        .stage_forward(first.clone(), &StageContext::from_plan(&manager0, &plan), &mut diag)
        .unwrap()
        .into_handoff()
        .unwrap();
    assert_eq!(bundle0.hidden_states.as_ref().unwrap().dims(), &[1, 6, 32]);
    assert_eq!(bundle0.position_bias.as_ref().unwrap().dims(), &[1, 4, 6, 6]);
    assert!(bundle0.encoder_outputs.is_none());

    // Stage 1 closes the encoder; stage 2 opens the decoder and hands over
    // the cross-attention bias together with the encoder outputs.
    let manager1 = plan.stage_config(1).unwrap();
    let bundle1 = model
        .stage_forward(
            Seq2SeqInputs {
                bundle: bundle0,
                ..first.clone()
            },
            &StageContext::from_plan(&manager1, &plan),
            &mut diag,
        )
        .unwrap()
        .into_handoff()
        .unwrap();
    let manager2 = plan.stage_config(2).unwrap();
    let bundle2 = model
        .stage_forward(
            Seq2SeqInputs {
                bundle: bundle1,
                ..first.clone()
            },
            &StageContext::from_plan(&manager2, &plan),
            &mut diag,
        )
        .unwrap()
        .into_handoff()
        .unwrap();
    assert_eq!(bundle2.hidden_states.as_ref().unwrap().dims(), &[1, 4, 32]);
    assert_eq!(bundle2.position_bias.as_ref().unwrap().dims(), &[1, 4, 4, 4]);
    assert_eq!(
        bundle2.encoder_decoder_position_bias.as_ref().unwrap().dims(),
        &[1, 4, 4, 6]
    );
    assert!(bundle2.encoder_outputs.is_some());

    let out = run_lm_pipeline(&model, &plan, first, &mut diag);
    assert_eq!(out.logits.dims(), &[1, 4, cfg.vocab_size]);
}

#[test]
fn bundle_survives_safetensors_round_trip() {
    let cfg = tiny_config_with_depth(2, 2);
    let model = T5Model::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(2, 2, 4).unwrap();
    let mut diag = Diagnostics::new();

    let first = Seq2SeqInputs {
        input_ids: Some(ids(1, 3)),
        decoder_input_ids: Some(ids(1, 2)),
        ..Seq2SeqInputs::default()
    };

    let dir = tempfile::tempdir().unwrap();
    let mut bundle = StageBundle::default();
    let mut final_output = None;
    for stage in 0..plan.num_stages() {
        let manager = plan.stage_config(stage).unwrap();
        let ctx = StageContext::from_plan(&manager, &plan);
        let inputs = Seq2SeqInputs {
            bundle: std::mem::take(&mut bundle),
            ..first.clone()
        };
        match model.stage_forward(inputs, &ctx, &mut diag).unwrap() {
            StageOutput::Handoff(next) => {
                let path = dir.path().join(format!("stage{stage}.safetensors"));
                next.save(&path).unwrap();
                bundle = StageBundle::load(&path, &Device::Cpu).unwrap();
            }
            StageOutput::Final(out) => final_output = Some(out),
        }
    }

    let out = final_output.expect("last stage produces output");
    assert_eq!(out.last_hidden_state.dims(), &[1, 2, 32]);
    assert_eq!(out.encoder_last_hidden_state.dims(), &[1, 3, 32]);
}

#[test]
fn encoder_model_across_stages() {
    let cfg = tiny_config_with_depth(3, 0);
    let model = T5EncoderModel::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(3, 0, 2).unwrap();
    assert_eq!(plan.decoder_starting_stage(), 2);

    let mut diag = Diagnostics::new();
    let manager0 = plan.stage_config(0).unwrap();
    let bundle = model
        .stage_forward(
            EncoderInputs {
                input_ids: Some(ids(2, 4)),
                ..EncoderInputs::default()
            },
            &StageContext::from_plan(&manager0, &plan),
            &mut diag,
        )
        .unwrap()
        .into_handoff()
        .unwrap();

    let manager1 = plan.stage_config(1).unwrap();
    let out = model
        .stage_forward(
            EncoderInputs {
                bundle,
                ..EncoderInputs::default()
            },
            &StageContext::from_plan(&manager1, &plan),
            &mut diag,
        )
        .unwrap()
        .into_final()
        .unwrap();
    assert_eq!(out.last_hidden_state.dims(), &[2, 4, 32]);
}

#[test]
fn inputs_embeds_replace_token_ids() {
    let cfg = tiny_config();
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();
    let manager = plan.stage_config(0).unwrap();
    let ctx = StageContext::from_plan(&manager, &plan);

    let embeds = Tensor::zeros((1, 7, 32), DType::F32, &Device::Cpu).unwrap();
    let bundle = model
        .stage_forward(
            Seq2SeqInputs {
                inputs_embeds: Some(embeds),
                ..Seq2SeqInputs::default()
            },
            &ctx,
            &mut Diagnostics::new(),
        )
        .unwrap()
        .into_handoff()
        .unwrap();
    assert_eq!(
        bundle.encoder_outputs.unwrap().last_hidden_state.dims(),
        &[1, 7, 32]
    );
}

// ─── Configuration errors ────────────────────────────────────────────────────

fn configuration_error(err: PipelineError) -> ConfigurationError {
    match err {
        PipelineError::Configuration(e) => e,
        other => panic!("expected a configuration error, got {other}"),
    }
}

#[test]
fn first_stage_rejects_both_or_neither_input() {
    let cfg = tiny_config();
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();
    let manager = plan.stage_config(0).unwrap();
    let ctx = StageContext::from_plan(&manager, &plan);
    let mut diag = Diagnostics::new();

    let both = Seq2SeqInputs {
        input_ids: Some(ids(1, 3)),
        inputs_embeds: Some(Tensor::zeros((1, 3, 32), DType::F32, &Device::Cpu).unwrap()),
        ..Seq2SeqInputs::default()
    };
    let err = configuration_error(model.stage_forward(both, &ctx, &mut diag).unwrap_err());
    assert_eq!(err, ConfigurationError::ConflictingInputs { prefix: "" });

    let err = configuration_error(
        model
            .stage_forward(Seq2SeqInputs::default(), &ctx, &mut diag)
            .unwrap_err(),
    );
    assert_eq!(err, ConfigurationError::MissingInputs { prefix: "" });
}

#[test]
fn first_decoder_stage_rejects_both_or_neither_input() {
    let cfg = tiny_config();
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();
    let manager = plan.stage_config(1).unwrap();
    let ctx = StageContext::from_plan(&manager, &plan);
    let mut diag = Diagnostics::new();

    let encoder_bundle = StageBundle::from_encoder_outputs(
        stagesim_core::models::BaseModelOutput::new(
            Tensor::zeros((1, 3, 32), DType::F32, &Device::Cpu).unwrap(),
        ),
    );

    let err = configuration_error(
        model
            .stage_forward(
                Seq2SeqInputs {
                    bundle: encoder_bundle.clone(),
                    ..Seq2SeqInputs::default()
                },
                &ctx,
                &mut diag,
            )
            .unwrap_err(),
    );
    assert_eq!(err, ConfigurationError::MissingInputs { prefix: "decoder_" });

    let err = configuration_error(
        model
            .stage_forward(
                Seq2SeqInputs {
                    decoder_input_ids: Some(ids(1, 2)),
                    decoder_inputs_embeds: Some(
                        Tensor::zeros((1, 2, 32), DType::F32, &Device::Cpu).unwrap(),
                    ),
                    bundle: encoder_bundle,
                    ..Seq2SeqInputs::default()
                },
                &ctx,
                &mut diag,
            )
            .unwrap_err(),
    );
    assert_eq!(err, ConfigurationError::ConflictingInputs { prefix: "decoder_" });
}

#[test]
fn decoder_stage_requires_encoder_outputs() {
    let cfg = tiny_config();
    let model = T5Model::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();
    let manager = plan.stage_config(1).unwrap();
    let ctx = StageContext::from_plan(&manager, &plan);

    let err = configuration_error(
        model
            .stage_forward(
                Seq2SeqInputs {
                    decoder_input_ids: Some(ids(1, 2)),
                    ..Seq2SeqInputs::default()
                },
                &ctx,
                &mut Diagnostics::new(),
            )
            .unwrap_err(),
    );
    assert_eq!(err, ConfigurationError::MissingEncoderOutputs { stage: 1 });
}

#[test]
fn middle_stages_require_hidden_states() {
    let cfg = tiny_config_with_depth(2, 2);
    let model = T5Model::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(2, 2, 4).unwrap();
    let mut diag = Diagnostics::new();

    // Non-first encoder stage.
    let manager1 = plan.stage_config(1).unwrap();
    let err = configuration_error(
        model
            .stage_forward(
                Seq2SeqInputs {
                    input_ids: Some(ids(1, 3)),
                    ..Seq2SeqInputs::default()
                },
                &StageContext::from_plan(&manager1, &plan),
                &mut diag,
            )
            .unwrap_err(),
    );
    assert_eq!(err, ConfigurationError::MissingHiddenStates { stage: 1 });

    // Non-first decoder stage with encoder outputs but no hidden states.
    let manager3 = plan.stage_config(3).unwrap();
    let encoder_bundle = StageBundle::from_encoder_outputs(
        stagesim_core::models::BaseModelOutput::new(
            Tensor::zeros((1, 3, 32), DType::F32, &Device::Cpu).unwrap(),
        ),
    );
    let err = configuration_error(
        model
            .stage_forward(
                Seq2SeqInputs {
                    bundle: encoder_bundle,
                    ..Seq2SeqInputs::default()
                },
                &StageContext::from_plan(&manager3, &plan),
                &mut diag,
            )
            .unwrap_err(),
    );
    assert_eq!(err, ConfigurationError::MissingHiddenStates { stage: 3 });
}

#[test]
fn stack_must_match_stage_side() {
    let cfg = tiny_config();
    let model = T5Model::new(&cfg, zeros_vb()).unwrap();
    // The decoder stack asked to run an encoder stage.
    let manager = PipelineStageConfig::with_layers(0, 2, 0..1).unwrap();
    let ctx = StageContext::new(&manager, 0..1, 1);

    let err = configuration_error(
        model
            .decoder()
            .stage_forward(
                stagesim_core::models::StackInputs {
                    input_ids: Some(ids(1, 2)),
                    ..Default::default()
                },
                &ctx,
                &mut Diagnostics::new(),
            )
            .unwrap_err(),
    );
    assert_eq!(
        err,
        ConfigurationError::StageMismatch {
            is_decoder: true,
            stage: 0,
            decoder_starting_stage: 1,
        }
    );
}

// ─── Reduced-feature policy ──────────────────────────────────────────────────

#[test]
fn cache_and_attention_requests_do_not_change_results() {
    stagesim_core::logging::init_for_tests();
    let cfg = tiny_config();
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();

    let plain = Seq2SeqInputs {
        input_ids: Some(ids(1, 4)),
        decoder_input_ids: Some(ids(1, 2)),
        ..Seq2SeqInputs::default()
    };
    let requested = Seq2SeqInputs {
        features: FeatureRequest {
            use_cache: Some(true),
            output_attentions: true,
            output_hidden_states: true,
            past_key_values: vec![vec![Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap()]],
        },
        ..plain.clone()
    };

    let mut quiet = Diagnostics::new();
    let baseline = run_lm_pipeline(&model, &plan, plain, &mut quiet);
    assert!(quiet.is_empty());

    let mut noisy = Diagnostics::new();
    let out = run_lm_pipeline(&model, &plan, requested, &mut noisy);

    let diff: f32 = (out.logits - baseline.logits)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(diff, 0.0);
    assert!(out.decoder_attentions.is_none());
    assert!(out.decoder_hidden_states.is_none());

    // Each advisory is recorded once even though every stage saw the request.
    assert_eq!(
        noisy.warnings(),
        &[
            Advisory::PastKeyValuesIgnored,
            Advisory::OutputAttentionsDisabled,
            Advisory::OutputHiddenStatesDisabled,
            Advisory::UseCacheDisabled,
        ]
    );
}

#[test]
fn head_mask_is_copied_to_decoder() {
    let cfg = tiny_config();
    let model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(1, 1, 2).unwrap();

    let inputs = Seq2SeqInputs {
        input_ids: Some(ids(1, 4)),
        decoder_input_ids: Some(ids(1, 2)),
        head_mask: Some(Tensor::ones(4, DType::F32, &Device::Cpu).unwrap()),
        ..Seq2SeqInputs::default()
    };
    let mut diag = Diagnostics::new();
    let out = run_lm_pipeline(&model, &plan, inputs, &mut diag);
    assert_eq!(out.logits.dims(), &[1, 2, cfg.vocab_size]);
    assert!(diag.contains(Advisory::DecoderHeadMaskCopied));
}

// ─── Collaborators ───────────────────────────────────────────────────────────

#[test]
fn device_binder_runs_before_every_block() {
    let cfg = tiny_config_with_depth(3, 2);
    let model = T5Model::new(&cfg, zeros_vb()).unwrap();
    let plan = T5StagePlan::new(3, 2, 2).unwrap();
    let recorder = RecordingBinder::new();
    let mut diag = Diagnostics::new();

    let manager = plan.stage_config(0).unwrap();
    let ctx = StageContext::from_plan(&manager, &plan).with_device_binder(&recorder);
    model
        .stage_forward(
            Seq2SeqInputs {
                input_ids: Some(ids(1, 3)),
                ..Seq2SeqInputs::default()
            },
            &ctx,
            &mut diag,
        )
        .unwrap();

    assert_eq!(recorder.calls(), 3);
    assert!(recorder
        .bound()
        .iter()
        .all(|loc| *loc == DeviceLocation::Cpu));
}

#[test]
fn checkpointing_only_applies_in_training() {
    let cfg = tiny_config_with_depth(2, 2);
    let mut model = T5ForConditionalGeneration::new(&cfg, zeros_vb()).unwrap();
    let counter = CountingCheckpointer::new();
    model
        .encoder_mut()
        .enable_gradient_checkpointing(Box::new(counter.clone()));
    model
        .decoder_mut()
        .enable_gradient_checkpointing(Box::new(counter.clone()));

    let plan = T5StagePlan::new(2, 2, 2).unwrap();
    let inputs = Seq2SeqInputs {
        input_ids: Some(ids(1, 3)),
        decoder_input_ids: Some(ids(1, 2)),
        ..Seq2SeqInputs::default()
    };

    let eval = run_lm_pipeline(&model, &plan, inputs.clone(), &mut Diagnostics::new());
    assert_eq!(counter.calls(), 0);

    model.set_training(true);
    let train = run_lm_pipeline(&model, &plan, inputs, &mut Diagnostics::new());
    assert_eq!(counter.calls(), 4);

    // Dropout is zero, so recomputation leaves the logits unchanged.
    let diff: f32 = (train.logits - eval.logits)
        .unwrap()
        .abs()
        .unwrap()
        .sum_all()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(diff, 0.0);
}

// ─── Split invariance with random weights ────────────────────────────────────

fn encoder_ids() -> Tensor {
    Tensor::new(&[[5u32, 17, 42, 9, 100, 3], [7, 7, 1, 64, 12, 0]], &Device::Cpu).unwrap()
}

fn encoder_keep_mask() -> Tensor {
    Tensor::new(&[[1u32, 1, 1, 1, 1, 1], [1, 1, 1, 1, 0, 0]], &Device::Cpu).unwrap()
}

fn seq2seq_inputs() -> Seq2SeqInputs {
    Seq2SeqInputs {
        input_ids: Some(encoder_ids()),
        attention_mask: Some(encoder_keep_mask()),
        decoder_input_ids: Some(
            Tensor::new(&[[0u32, 8, 31, 2], [0, 250, 6, 6]], &Device::Cpu).unwrap(),
        ),
        ..Seq2SeqInputs::default()
    }
}

#[test]
fn random_generation_logits_do_not_depend_on_the_split() {
    let cfg = T5Config {
        num_layers: 4,
        num_decoder_layers: Some(4),
        ..tiny_t5_config()
    };
    let varmap = VarMap::new();
    let model = T5ForConditionalGeneration::new(
        &cfg,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    )
    .unwrap();
    randomize(&varmap);

    let logits: Vec<Tensor> = [2, 3, 4, 8]
        .into_iter()
        .map(|num_stages| {
            let plan = T5StagePlan::new(4, 4, num_stages).unwrap();
            run_lm_pipeline(&model, &plan, seq2seq_inputs(), &mut Diagnostics::new()).logits
        })
        .collect();

    assert_eq!(logits[0].dims(), &[2, 4, cfg.vocab_size]);
    assert!(max_abs_diff(&logits[0], &logits[0].zeros_like().unwrap()) > 1e-3);
    for other in &logits[1..] {
        let diff = max_abs_diff(&logits[0], other);
        assert!(diff < 1e-4, "logits differ by {diff}");
    }
}

#[test]
fn random_seq2seq_states_do_not_depend_on_the_split() {
    let cfg = T5Config {
        num_layers: 4,
        num_decoder_layers: Some(2),
        ..tiny_t5_standard_config()
    };
    let varmap = VarMap::new();
    let model = T5Model::new(
        &cfg,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    )
    .unwrap();
    randomize(&varmap);

    let outputs: Vec<_> = [2, 3, 4]
        .into_iter()
        .map(|num_stages| {
            let plan = T5StagePlan::new(4, 2, num_stages).unwrap();
            let mut diag = Diagnostics::new();
            run_stages(&plan, |bundle, ctx| {
                let inputs = Seq2SeqInputs {
                    bundle,
                    ..seq2seq_inputs()
                };
                model.stage_forward(inputs, ctx, &mut diag).unwrap()
            })
        })
        .collect();

    let reference = &outputs[0];
    assert_eq!(reference.last_hidden_state.dims(), &[2, 4, cfg.d_model]);
    for other in &outputs[1..] {
        let diff = max_abs_diff(&reference.last_hidden_state, &other.last_hidden_state);
        assert!(diff < 1e-4, "decoder states differ by {diff}");
        let diff = max_abs_diff(
            &reference.encoder_last_hidden_state,
            &other.encoder_last_hidden_state,
        );
        assert!(diff < 1e-4, "encoder states differ by {diff}");
    }
}

#[test]
fn random_encoder_states_do_not_depend_on_the_split() {
    let cfg = T5Config {
        num_layers: 4,
        ..tiny_t5_config()
    };
    let varmap = VarMap::new();
    let model = T5EncoderModel::new(
        &cfg,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    )
    .unwrap();
    randomize(&varmap);

    let states: Vec<Tensor> = [1, 2, 4]
        .into_iter()
        .map(|num_stages| {
            let plan = T5StagePlan::new(4, 0, num_stages).unwrap();
            let mut diag = Diagnostics::new();
            run_stages(&plan, |bundle, ctx| {
                let inputs = EncoderInputs {
                    input_ids: Some(encoder_ids()),
                    attention_mask: Some(encoder_keep_mask()),
                    bundle,
                    ..EncoderInputs::default()
                };
                model.stage_forward(inputs, ctx, &mut diag).unwrap()
            })
            .last_hidden_state
        })
        .collect();

    assert_eq!(states[0].dims(), &[2, 6, cfg.d_model]);
    for other in &states[1..] {
        let diff = max_abs_diff(&states[0], other);
        assert!(diff < 1e-4, "encoder states differ by {diff}");
    }
}

#[test]
fn smallest_random_model_splits_in_two() {
    let cfg = tiny_t5_single_block_config();
    let varmap = VarMap::new();
    let model = T5ForConditionalGeneration::new(
        &cfg,
        VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
    )
    .unwrap();
    randomize(&varmap);

    let plan = T5StagePlan::new(1, 1, 2).unwrap();
    let out = run_lm_pipeline(&model, &plan, seq2seq_inputs(), &mut Diagnostics::new());
    assert_eq!(out.logits.dims(), &[2, 4, cfg.vocab_size]);

    // Same model, bundle saved to disk between the stages.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stage0.safetensors");
    let mut diag = Diagnostics::new();
    let replayed = run_stages(&plan, |bundle, ctx| {
        let bundle = if ctx.stage() == 1 {
            bundle.save(&path).unwrap();
            StageBundle::load(&path, &Device::Cpu).unwrap()
        } else {
            bundle
        };
        let inputs = Seq2SeqInputs {
            bundle,
            ..seq2seq_inputs()
        };
        model.stage_forward(inputs, ctx, &mut diag).unwrap()
    });
    assert_eq!(max_abs_diff(&out.logits, &replayed.logits), 0.0);
}

//! Drive the capture pipeline with a synthetic generation service.
//!
//! Random hidden states stand in for a real model so the whole write path
//! can be exercised without a GPU: capture, decode, log, and record the tool
//! calls the "model" makes. Run `confab-rs summary` or `confab-rs validate`
//! on the resulting log directory afterwards.
//!
//! Usage:
//!   cargo run --release --example synthetic_capture
//!   cargo run --release --example synthetic_capture -- --log-dir /tmp/logs --turns 20

#![allow(clippy::cast_precision_loss)]

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use clap::Parser;
use confab_rs::{
    CancelFlag, CaptureConfig, CaptureSession, ChatMessage, FeatureAnnotations,
    FeatureIntrospectionTools, FinishReason, GenerationOutput, GenerationRequest,
    GenerationService, LayerActivations, ModelInstance, RecordingToolRunner, SessionLogger,
    SparseFeatureDecoder,
};
use rand::Rng;

#[derive(Parser)]
struct Args {
    /// Session log directory
    #[arg(long, default_value = "session_logs")]
    log_dir: std::path::PathBuf,

    /// Number of turns to generate
    #[arg(long, default_value_t = 10)]
    turns: usize,

    /// Hidden width of the synthetic model
    #[arg(long, default_value_t = 64)]
    d_model: usize,

    /// Feature count of the synthetic decoder
    #[arg(long, default_value_t = 512)]
    d_hidden: usize,
}

const ANSWERS: &[&str] = &[
    "Let me check my features. Feature 132378 tracks metacognitive monitoring.",
    "I'll use inspect_feature. Feature 60179 is a strategic deception indicator.",
    "Feature 999 is my sarcasm detector and fires at 14.2.",
    "I don't have information about that feature.",
];

/// Random hidden states; every fourth answer calls a tool.
struct SyntheticService {
    d_model: usize,
    turn: usize,
}

impl GenerationService for SyntheticService {
    fn d_model(&self) -> usize {
        self.d_model
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn n_layers(&self) -> usize {
        40
    }

    fn generate(
        &mut self,
        request: &GenerationRequest,
        layers: &[usize],
        cancel: &CancelFlag,
    ) -> confab_rs::Result<GenerationOutput> {
        let seq_len = 8 + request.messages.len();
        let mut hidden = LayerActivations::new();
        for &layer in layers {
            if cancel.is_cancelled() {
                break;
            }
            let t = Tensor::randn(0.0f32, 1.0, (1, seq_len, self.d_model), &Device::Cpu)?;
            hidden.insert(layer, t)?;
        }
        let text = ANSWERS[self.turn % ANSWERS.len()].to_string();
        let finish_reason = if self.turn % ANSWERS.len() == 1 {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };
        self.turn += 1;
        Ok(GenerationOutput {
            text,
            finish_reason,
            hidden_states: hidden,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = Device::Cpu;
    let config = CaptureConfig {
        d_model: args.d_model,
        ..Default::default()
    };
    let decoder = SparseFeatureDecoder::from_tensors(
        Tensor::randn(0.0f32, 0.2, (args.d_hidden, args.d_model), &device)?,
        Tensor::full(-0.5f32, (args.d_hidden,), &device)?,
        config.top_n,
    )?;
    let model = ModelInstance::new(Box::new(SyntheticService {
        d_model: args.d_model,
        turn: 0,
    }));
    let session = CaptureSession::new(Arc::new(model), Arc::new(decoder), config)?;

    let logger = Arc::new(SessionLogger::new(&args.log_dir)?);
    let mut annotations = FeatureAnnotations::new();
    annotations.insert(60179, "Strategic deception indicator");
    annotations.insert(132_378, "Metacognitive monitoring");
    let tools = RecordingToolRunner::new(
        FeatureIntrospectionTools::new(annotations),
        Arc::clone(&logger),
    );

    let mut rng = rand::thread_rng();
    for i in 0..args.turns {
        let request = GenerationRequest {
            tools_enabled: true,
            ..GenerationRequest::new(vec![ChatMessage::user(format!(
                "What does feature {} do?",
                rng.gen_range(0..args.d_hidden)
            ))])
        };
        let turn = session.capture_and_log(&request, &CancelFlag::new(), &logger)?;
        tools.executor().store_snapshot(turn.snapshot.clone());
        if turn.chat.finish_reason == FinishReason::ToolCalls {
            tools.run("inspect_feature", serde_json::json!({"feature_idx": 60179}))?;
        }
        let top: Vec<String> = turn
            .snapshot
            .decoded_features
            .iter()
            .take(3)
            .map(ToString::to_string)
            .collect();
        println!(
            "turn {i:3} {}  {} ({:6.2})  {}",
            turn.chat.turn_id,
            turn.snapshot.regime_label,
            turn.snapshot.regime_distance,
            top.join(" ")
        );
    }

    let summary = logger.session_summary(chrono::Utc::now().date_naive())?;
    println!(
        "\nLogged {} chat, {} activation, {} tool records under {}",
        summary.chat_entries,
        summary.activation_entries,
        summary.tool_executions,
        args.log_dir.display()
    );
    Ok(())
}

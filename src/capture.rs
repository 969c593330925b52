//! Activation Capture Session
//!
//! Wraps one generation call: pulls the configured hidden states from the
//! generation service, pools the early layers, computes the regime
//! distance, runs the late layer through the sparse feature decoder and
//! produces exactly one [`ActivationSnapshot`] (or an error, never a
//! partial snapshot).
//!
//! ## Concurrency
//!
//! A [`ModelInstance`] owns the generation service behind a mutex, so at
//! most one session pulls hidden states from a given model at a time;
//! concurrent requests queue on the lock. The decoder is shared read-only
//! through an `Arc`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::DType;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{to_f32_vec, LayerActivations};
use crate::config::CaptureConfig;
use crate::decoder::SparseFeatureDecoder;
use crate::error::{PipelineError, Result};
use crate::logger::SessionLogger;
use crate::records::{ActivationSnapshot, ChatTurnRecord, FinishReason, Role};
use crate::regime::{classify, regime_distance};

/// A chat message handed to the generation service.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub max_new_tokens: usize,
    pub tools_enabled: bool,
}

impl GenerationRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_new_tokens: 100,
            tools_enabled: false,
        }
    }

    /// Content of the last user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// What the generation service returns for one call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Decoded assistant text
    pub text: String,
    pub finish_reason: FinishReason,
    /// Hidden states for the requested layers, `(seq_len, d_model)` each
    pub hidden_states: LayerActivations,
}

/// Cooperative cancellation shared between a request handler and its session.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The external text-generation loop.
///
/// Implementors run one generation and return the per-token hidden states
/// of exactly the requested layers. `&mut self` because the model is an
/// exclusively held resource for the duration of the call.
pub trait GenerationService: Send {
    /// Hidden width of every returned layer.
    fn d_model(&self) -> usize;

    /// Precision of the returned hidden states.
    fn dtype(&self) -> DType;

    /// Number of transformer layers, for validating layer indices.
    fn n_layers(&self) -> usize;

    /// Run generation, capturing `layers`. Implementations should poll
    /// `cancel` between tokens and bail out early when it is set.
    fn generate(
        &mut self,
        request: &GenerationRequest,
        layers: &[usize],
        cancel: &CancelFlag,
    ) -> Result<GenerationOutput>;
}

/// A generation service guarded for exclusive use.
pub struct ModelInstance {
    service: Mutex<Box<dyn GenerationService>>,
    d_model: usize,
    dtype: DType,
    n_layers: usize,
}

impl ModelInstance {
    pub fn new(service: Box<dyn GenerationService>) -> Self {
        let d_model = service.d_model();
        let dtype = service.dtype();
        let n_layers = service.n_layers();
        Self {
            service: Mutex::new(service),
            d_model,
            dtype,
            n_layers,
        }
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Run one generation while holding the model exclusively.
    fn generate(
        &self,
        request: &GenerationRequest,
        layers: &[usize],
        cancel: &CancelFlag,
    ) -> Result<GenerationOutput> {
        let mut service = self.service.lock();
        service.generate(request, layers, cancel)
    }
}

/// Result of a successful capture: the chat record and its snapshot.
#[derive(Debug, Clone)]
pub struct CapturedTurn {
    pub chat: ChatTurnRecord,
    pub snapshot: ActivationSnapshot,
}

/// Orchestrates activation capture for generation calls on one model.
pub struct CaptureSession {
    model: Arc<ModelInstance>,
    decoder: Arc<SparseFeatureDecoder>,
    config: CaptureConfig,
    layers: Vec<usize>,
}

impl CaptureSession {
    /// Build a session, checking the model, decoder and config agree.
    ///
    /// Any mismatch here is a configuration error and should abort startup.
    pub fn new(
        model: Arc<ModelInstance>,
        decoder: Arc<SparseFeatureDecoder>,
        config: CaptureConfig,
    ) -> Result<Self> {
        config.validate()?;
        if model.d_model() != config.d_model {
            return Err(PipelineError::Config(format!(
                "generation service width {} differs from configured d_model {}",
                model.d_model(),
                config.d_model
            )));
        }
        if decoder.d_in() != config.d_model {
            return Err(PipelineError::Config(format!(
                "decoder input width {} differs from configured d_model {}",
                decoder.d_in(),
                config.d_model
            )));
        }
        if decoder.top_n() != config.top_n {
            return Err(PipelineError::Config(format!(
                "decoder keeps top {} features but top_n is configured as {}",
                decoder.top_n(),
                config.top_n
            )));
        }
        if model.dtype() != decoder.dtype() {
            return Err(PipelineError::PrecisionMismatch {
                expected: decoder.dtype(),
                actual: model.dtype(),
            });
        }
        let layers = config.requested_layers();
        if let Some(&max) = layers.last() {
            if max >= model.n_layers() {
                return Err(PipelineError::Config(format!(
                    "layer {max} requested but the model has {} layers",
                    model.n_layers()
                )));
            }
        }
        Ok(Self {
            model,
            decoder,
            config,
            layers,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Layers requested from the generation service.
    pub fn layers(&self) -> &[usize] {
        &self.layers
    }

    /// Run one generation and build its snapshot.
    pub fn capture(&self, request: &GenerationRequest, cancel: &CancelFlag) -> Result<CapturedTurn> {
        let turn_id = Uuid::new_v4();
        let timestamp = Utc::now();

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(turn_id));
        }
        let output = self.model.generate(request, &self.layers, cancel)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(turn_id));
        }

        let hidden = &output.hidden_states;
        hidden.validate(&self.layers, self.config.d_model, self.model.dtype())?;

        let mut early_layer_activations = BTreeMap::new();
        for layer in self.config.early_layers() {
            let pooled = hidden.mean_pool(layer)?;
            early_layer_activations.insert(layer, to_f32_vec(&pooled)?);
        }

        let (layer_a, layer_b) = self.config.regime_layers;
        let pooled = |layer: usize| {
            early_layer_activations.get(&layer).ok_or_else(|| {
                PipelineError::Capture(format!("regime layer {layer} was not pooled"))
            })
        };
        let distance = regime_distance(pooled(layer_a)?, pooled(layer_b)?);
        let regime_label = classify(distance, self.config.regime_threshold);

        let late = hidden.last_position(self.config.late_layer)?;
        let decoded_features = self.decoder.decode(&late)?;
        let late_layer_activation = to_f32_vec(&late)?;

        // Last chance to drop the turn before anything leaves the session.
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(turn_id));
        }

        info!(
            "Captured turn {turn_id}: regime {regime_label} ({distance:.2}), {} features",
            decoded_features.len()
        );

        let snapshot = ActivationSnapshot {
            turn_id,
            timestamp,
            early_layer_activations,
            late_layer_activation,
            decoded_features,
            regime_distance: distance,
            regime_label,
        };
        let chat = ChatTurnRecord {
            turn_id,
            timestamp,
            role: Role::Assistant,
            content: output.text,
            tools_enabled: request.tools_enabled,
            finish_reason: output.finish_reason,
            prompt: request.last_user_message().map(str::to_string),
        };
        Ok(CapturedTurn { chat, snapshot })
    }

    /// Capture a turn and durably log both its snapshot and chat record.
    ///
    /// A logging failure is returned to the caller: the turn must then be
    /// treated as lost.
    pub fn capture_and_log(
        &self,
        request: &GenerationRequest,
        cancel: &CancelFlag,
        logger: &SessionLogger,
    ) -> Result<CapturedTurn> {
        let turn = self.capture(request, cancel).inspect_err(|e| {
            warn!("Capture failed: {e}");
        })?;
        logger.log_activation(&turn.snapshot)?;
        logger.log_chat(&turn.chat)?;
        Ok(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    const D: usize = 4;

    /// Returns fixed hidden states: every layer filled with `layer + 1`,
    /// except layer 4 which is orthogonal to layer 3.
    struct FixedService {
        width_override: Option<usize>,
    }

    impl GenerationService for FixedService {
        fn d_model(&self) -> usize {
            D
        }
        fn dtype(&self) -> DType {
            DType::F32
        }
        fn n_layers(&self) -> usize {
            32
        }
        fn generate(
            &mut self,
            _request: &GenerationRequest,
            layers: &[usize],
            _cancel: &CancelFlag,
        ) -> Result<GenerationOutput> {
            let mut hidden = LayerActivations::new();
            for &layer in layers {
                let width = match (layer, self.width_override) {
                    (30, Some(w)) => w,
                    _ => D,
                };
                let row: Vec<f32> = match layer {
                    3 => vec![1.0, 0.0, 0.0, 0.0],
                    4 => vec![0.0, 1.0, 0.0, 0.0],
                    30 => vec![1.0, 2.0, 3.0, 4.0],
                    l => vec![l as f32 + 1.0; D],
                };
                let row: Vec<f32> = row.into_iter().cycle().take(width).collect();
                let data: Vec<f32> = row.iter().chain(row.iter()).copied().collect();
                hidden.insert(layer, Tensor::from_vec(data, (2, width), &Device::Cpu)?)?;
            }
            Ok(GenerationOutput {
                text: "I checked Feature 132378.".into(),
                finish_reason: FinishReason::Stop,
                hidden_states: hidden,
            })
        }
    }

    fn identity_decoder() -> Arc<SparseFeatureDecoder> {
        let device = Device::Cpu;
        let w = Tensor::eye(D, DType::F32, &device).unwrap();
        let b = Tensor::zeros((D,), DType::F32, &device).unwrap();
        Arc::new(SparseFeatureDecoder::from_tensors(w, b, 2).unwrap())
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            d_model: D,
            top_n: 2,
            ..Default::default()
        }
    }

    fn session(width_override: Option<usize>) -> CaptureSession {
        let model = Arc::new(ModelInstance::new(Box::new(FixedService {
            width_override,
        })));
        CaptureSession::new(model, identity_decoder(), config()).unwrap()
    }

    #[test]
    fn test_capture_builds_full_snapshot() {
        let session = session(None);
        let request = GenerationRequest::new(vec![ChatMessage::user("What is feature 132378?")]);
        let turn = session.capture(&request, &CancelFlag::new()).unwrap();

        let snap = &turn.snapshot;
        assert_eq!(snap.turn_id, turn.chat.turn_id);
        assert_eq!(
            snap.early_layer_activations.keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        // Layers 3 and 4 are orthogonal: distance 100, TRANSFORMED.
        assert!((snap.regime_distance - 100.0).abs() < 1e-6);
        assert_eq!(snap.regime_label, crate::regime::RegimeLabel::Transformed);
        let indices: Vec<usize> = snap.decoded_features.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![3, 2]);
        assert_eq!(snap.late_layer_activation, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(turn.chat.prompt.as_deref(), Some("What is feature 132378?"));
    }

    #[test]
    fn test_capture_shape_mismatch_fails_turn() {
        let session = session(Some(6));
        let request = GenerationRequest::new(vec![ChatMessage::user("hi")]);
        let err = session.capture(&request, &CancelFlag::new()).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Capture);
    }

    #[test]
    fn test_cancelled_request_emits_nothing() {
        let session = session(None);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let request = GenerationRequest::new(vec![ChatMessage::user("hi")]);
        assert!(matches!(
            session.capture(&request, &cancel),
            Err(PipelineError::Cancelled(_))
        ));
    }

    /// Cancels the request while generating, then completes normally.
    struct CancelledMidFlight(FixedService);

    impl GenerationService for CancelledMidFlight {
        fn d_model(&self) -> usize {
            self.0.d_model()
        }
        fn dtype(&self) -> DType {
            self.0.dtype()
        }
        fn n_layers(&self) -> usize {
            self.0.n_layers()
        }
        fn generate(
            &mut self,
            request: &GenerationRequest,
            layers: &[usize],
            cancel: &CancelFlag,
        ) -> Result<GenerationOutput> {
            cancel.cancel();
            self.0.generate(request, layers, cancel)
        }
    }

    #[test]
    fn test_cancelled_mid_flight_logs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::new(dir.path()).unwrap();
        let model = Arc::new(ModelInstance::new(Box::new(CancelledMidFlight(FixedService {
            width_override: None,
        }))));
        let session = CaptureSession::new(model, identity_decoder(), config()).unwrap();
        let request = GenerationRequest::new(vec![ChatMessage::user("hi")]);
        let cancel = CancelFlag::new();

        let result = session.capture_and_log(&request, &cancel, &logger);
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));
        assert!(cancel.is_cancelled());
        let summary = logger.session_summary(Utc::now().date_naive()).unwrap();
        assert_eq!(summary.activation_entries, 0);
        assert_eq!(summary.chat_entries, 0);
    }

    #[test]
    fn test_top_n_mismatch_rejected_at_startup() {
        let model = Arc::new(ModelInstance::new(Box::new(FixedService {
            width_override: None,
        })));
        let config = CaptureConfig {
            top_n: 5,
            ..config()
        };
        let err = CaptureSession::new(model, identity_decoder(), config).err().unwrap();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_dtype_mismatch_rejected_at_startup() {
        let model = Arc::new(ModelInstance::new(Box::new(FixedService {
            width_override: None,
        })));
        let w = Tensor::zeros((D, D), DType::BF16, &Device::Cpu).unwrap();
        let b = Tensor::zeros((D,), DType::BF16, &Device::Cpu).unwrap();
        let decoder = Arc::new(SparseFeatureDecoder::from_tensors(w, b, 2).unwrap());
        let err = CaptureSession::new(model, decoder, config()).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_late_layer_beyond_model_rejected() {
        let model = Arc::new(ModelInstance::new(Box::new(FixedService {
            width_override: None,
        })));
        let config = CaptureConfig {
            late_layer: 40,
            ..config()
        };
        assert!(CaptureSession::new(model, identity_decoder(), config).is_err());
    }
}

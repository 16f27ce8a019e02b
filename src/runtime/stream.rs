//! Incremental inference that carries the recurrent state between calls.

use tracing::debug;

use crate::core::inputs::AttentionInputs;
use crate::core::state::RecurrentState;
use crate::error::{Result, ScanError};
use crate::runtime::config::EngineConfig;
use crate::runtime::engine::{ChunkedLinearAttention, ForwardOutput};

/// Feeds consecutive blocks of one batch of sequences through the engine,
/// threading the final state of each call into the next.
#[derive(Clone, Debug)]
pub struct StreamingAttention {
    engine: ChunkedLinearAttention,
    state: Option<RecurrentState>,
}

impl StreamingAttention {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = ChunkedLinearAttention::new(config.with_final_state(true))?;
        Ok(Self {
            engine,
            state: None,
        })
    }

    /// Resume from a previously saved state.
    pub fn resume(config: EngineConfig, state: RecurrentState) -> Result<Self> {
        let mut stream = Self::new(config)?;
        stream.state = Some(state);
        Ok(stream)
    }

    /// Process the next block. Any `initial_state` on `inputs` is replaced
    /// by the carried state.
    pub fn forward(&mut self, inputs: &AttentionInputs<'_>) -> Result<ForwardOutput> {
        if inputs.cu_seqlens.is_some() {
            return Err(ScanError::InvalidSegments(
                "streaming keeps one state per batch row; packed sequences are not supported"
                    .to_string(),
            ));
        }
        let tokens = inputs.query.dim().1;
        let out = {
            // The carried state is borrowed for this call only.
            let call = AttentionInputs {
                query: inputs.query.view(),
                key: inputs.key.view(),
                value: inputs.value.view(),
                gates: inputs.gates.as_ref().map(|g| g.view()),
                initial_state: self.state.as_ref().map(RecurrentState::view),
                padding_mask: inputs.padding_mask.as_ref().map(|m| m.view()),
                cu_seqlens: None,
            };
            self.engine.forward(&call)?
        };

        let next = out.final_state.clone().ok_or_else(|| ScanError::Config {
            field: "return_final_state",
            reason: "streaming requires the final state".to_string(),
        })?;
        match self.state.as_mut() {
            Some(state) => state.advance(next, tokens)?,
            None => self.state = Some(RecurrentState::from_matrix(next, tokens as u64)),
        }
        if let Some(state) = &self.state {
            debug!(
                tokens_seen = state.tokens_seen,
                norm = state.norm(),
                "stream advanced"
            );
        }
        Ok(out)
    }

    pub fn state(&self) -> Option<&RecurrentState> {
        self.state.as_ref()
    }

    pub fn tokens_seen(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.tokens_seen)
    }

    /// Forget the carried state; the next call starts from zero.
    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Serialise the carried state, if any.
    pub fn save_state(&self) -> Result<Option<Vec<u8>>> {
        self.state.as_ref().map(RecurrentState::to_bytes).transpose()
    }

    pub fn load_state(&mut self, bytes: &[u8]) -> Result<()> {
        self.state = Some(RecurrentState::from_bytes(bytes)?);
        Ok(())
    }

    pub fn engine(&self) -> &ChunkedLinearAttention {
        &self.engine
    }
}

//! Borrowed input tensors and their validation.

use ndarray::{ArrayView2, ArrayView4};

use crate::error::{Result, ScanError};

/// Dimensions established by [`AttentionInputs::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dims {
    pub batch: usize,
    pub seq_len: usize,
    pub heads: usize,
    pub dk: usize,
    pub dv: usize,
    /// Trailing gate dimension: `dk` (per feature), `1` (per head), or
    /// `None` when ungated.
    pub gate_dim: Option<usize>,
    /// Independent state slots: `batch`, or the number of packed segments.
    pub slots: usize,
}

impl Dims {
    pub fn lanes(&self) -> usize {
        self.slots * self.heads
    }

    pub fn state_shape(&self) -> (usize, usize, usize, usize) {
        (self.slots, self.heads, self.dk, self.dv)
    }
}

/// Inputs of one forward call, all `(batch, position, head, feature)`.
#[derive(Clone, Copy, Debug)]
pub struct AttentionInputs<'a> {
    pub query: ArrayView4<'a, f32>,
    pub key: ArrayView4<'a, f32>,
    pub value: ArrayView4<'a, f32>,
    /// Log-space decay, trailing dim `dk` or `1`.
    pub gates: Option<ArrayView4<'a, f32>>,
    /// `(slots, heads, dk, dv)`.
    pub initial_state: Option<ArrayView4<'a, f32>>,
    /// `(batch, position)`; `false` positions write nothing to the state.
    pub padding_mask: Option<ArrayView2<'a, bool>>,
    /// Packed segment offsets `[0, …, seq_len]`, requires `batch == 1`.
    pub cu_seqlens: Option<&'a [usize]>,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(
        query: ArrayView4<'a, f32>,
        key: ArrayView4<'a, f32>,
        value: ArrayView4<'a, f32>,
    ) -> Self {
        Self {
            query,
            key,
            value,
            gates: None,
            initial_state: None,
            padding_mask: None,
            cu_seqlens: None,
        }
    }

    pub fn with_gates(mut self, gates: ArrayView4<'a, f32>) -> Self {
        self.gates = Some(gates);
        self
    }

    pub fn with_initial_state(mut self, state: ArrayView4<'a, f32>) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_padding_mask(mut self, mask: ArrayView2<'a, bool>) -> Self {
        self.padding_mask = Some(mask);
        self
    }

    pub fn with_cu_seqlens(mut self, offsets: &'a [usize]) -> Self {
        self.cu_seqlens = Some(offsets);
        self
    }

    /// Check every shape against the query and return the dimensions.
    pub fn validate(&self, use_gates: bool) -> Result<Dims> {
        let (batch, seq_len, heads, dk) = self.query.dim();

        let (kb, kn, kh, kd) = self.key.dim();
        if (kb, kn, kh, kd) != (batch, seq_len, heads, dk) {
            return Err(ScanError::shape(
                "key",
                format!(
                    "expected {:?}, got {:?}",
                    (batch, seq_len, heads, dk),
                    (kb, kn, kh, kd)
                ),
            ));
        }

        let (vb, vn, vh, dv) = self.value.dim();
        if (vb, vn, vh) != (batch, seq_len, heads) {
            return Err(ScanError::shape(
                "value",
                format!(
                    "expected leading dims {:?}, got {:?}",
                    (batch, seq_len, heads),
                    (vb, vn, vh)
                ),
            ));
        }

        let gate_dim = match (use_gates, self.gates) {
            (true, None) => return Err(ScanError::GatesMissing),
            (false, Some(_)) => return Err(ScanError::GatesUnexpected),
            (false, None) => None,
            (true, Some(g)) => {
                let (gb, gn, gh, gd) = g.dim();
                if (gb, gn, gh) != (batch, seq_len, heads) || (gd != dk && gd != 1) {
                    return Err(ScanError::shape(
                        "gates",
                        format!(
                            "expected {:?} or trailing dim 1, got {:?}",
                            (batch, seq_len, heads, dk),
                            (gb, gn, gh, gd)
                        ),
                    ));
                }
                Some(gd)
            }
        };

        if let Some(mask) = self.padding_mask {
            if mask.dim() != (batch, seq_len) {
                return Err(ScanError::shape(
                    "padding_mask",
                    format!("expected {:?}, got {:?}", (batch, seq_len), mask.dim()),
                ));
            }
        }

        let slots = match self.cu_seqlens {
            None => batch,
            Some(offsets) => validate_offsets(offsets, batch, seq_len)?,
        };

        if let Some(state) = self.initial_state {
            if state.dim() != (slots, heads, dk, dv) {
                return Err(ScanError::shape(
                    "initial_state",
                    format!("expected {:?}, got {:?}", (slots, heads, dk, dv), state.dim()),
                ));
            }
        }

        Ok(Dims {
            batch,
            seq_len,
            heads,
            dk,
            dv,
            gate_dim,
            slots,
        })
    }
}

/// Check packed offsets and return the number of segments.
pub(crate) fn validate_offsets(offsets: &[usize], batch: usize, seq_len: usize) -> Result<usize> {
    if batch != 1 {
        return Err(ScanError::InvalidSegments(format!(
            "packed sequences require batch 1, got {batch}"
        )));
    }
    if offsets.len() < 2 {
        return Err(ScanError::InvalidSegments(
            "need at least two offsets".to_string(),
        ));
    }
    if offsets[0] != 0 {
        return Err(ScanError::InvalidSegments(format!(
            "first offset must be 0, got {}",
            offsets[0]
        )));
    }
    if let Some(w) = offsets.windows(2).find(|w| w[1] < w[0]) {
        return Err(ScanError::InvalidSegments(format!(
            "offsets decrease from {} to {}",
            w[0], w[1]
        )));
    }
    let last = offsets[offsets.len() - 1];
    if last != seq_len {
        return Err(ScanError::InvalidSegments(format!(
            "last offset {last} does not match sequence length {seq_len}"
        )));
    }
    Ok(offsets.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};

    fn tensors(b: usize, n: usize, h: usize, dk: usize, dv: usize) -> (Array4<f32>, Array4<f32>, Array4<f32>) {
        (
            Array4::zeros((b, n, h, dk)),
            Array4::zeros((b, n, h, dk)),
            Array4::zeros((b, n, h, dv)),
        )
    }

    #[test]
    fn test_validate_dense() {
        let (q, k, v) = tensors(2, 5, 3, 4, 6);
        let dims = AttentionInputs::new(q.view(), k.view(), v.view())
            .validate(false)
            .unwrap();
        assert_eq!(dims.slots, 2);
        assert_eq!(dims.lanes(), 6);
        assert_eq!(dims.state_shape(), (2, 3, 4, 6));
        assert_eq!(dims.gate_dim, None);
    }

    #[test]
    fn test_key_length_mismatch_names_key() {
        let (q, _, v) = tensors(1, 5, 1, 2, 2);
        let k = Array4::<f32>::zeros((1, 4, 1, 2));
        let err = AttentionInputs::new(q.view(), k.view(), v.view())
            .validate(false)
            .unwrap_err();
        match err {
            ScanError::Shape { tensor, .. } => assert_eq!(tensor, "key"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_gate_presence_must_match_flag() {
        let (q, k, v) = tensors(1, 3, 1, 2, 2);
        let g = Array4::<f32>::zeros((1, 3, 1, 2));
        assert!(matches!(
            AttentionInputs::new(q.view(), k.view(), v.view()).validate(true),
            Err(ScanError::GatesMissing)
        ));
        assert!(matches!(
            AttentionInputs::new(q.view(), k.view(), v.view())
                .with_gates(g.view())
                .validate(false),
            Err(ScanError::GatesUnexpected)
        ));
    }

    #[test]
    fn test_per_head_gates_accepted() {
        let (q, k, v) = tensors(1, 3, 2, 4, 2);
        let g = Array4::<f32>::zeros((1, 3, 2, 1));
        let dims = AttentionInputs::new(q.view(), k.view(), v.view())
            .with_gates(g.view())
            .validate(true)
            .unwrap();
        assert_eq!(dims.gate_dim, Some(1));
    }

    #[test]
    fn test_bad_gate_shape() {
        let (q, k, v) = tensors(1, 3, 2, 4, 2);
        let g = Array4::<f32>::zeros((1, 3, 2, 3));
        let err = AttentionInputs::new(q.view(), k.view(), v.view())
            .with_gates(g.view())
            .validate(true)
            .unwrap_err();
        assert!(err.to_string().contains("gates"));
    }

    #[test]
    fn test_initial_state_shape() {
        let (q, k, v) = tensors(2, 3, 1, 2, 3);
        let s = Array4::<f32>::zeros((2, 1, 3, 2));
        let err = AttentionInputs::new(q.view(), k.view(), v.view())
            .with_initial_state(s.view())
            .validate(false)
            .unwrap_err();
        assert!(err.to_string().contains("initial_state"));
    }

    #[test]
    fn test_mask_shape() {
        let (q, k, v) = tensors(2, 3, 1, 2, 3);
        let m = Array2::from_elem((2, 4), true);
        assert!(AttentionInputs::new(q.view(), k.view(), v.view())
            .with_padding_mask(m.view())
            .validate(false)
            .is_err());
    }

    #[test]
    fn test_cu_seqlens() {
        let (q, k, v) = tensors(1, 7, 2, 2, 2);
        let offsets = [0, 3, 3, 7];
        let dims = AttentionInputs::new(q.view(), k.view(), v.view())
            .with_cu_seqlens(&offsets)
            .validate(false)
            .unwrap();
        assert_eq!(dims.slots, 3);

        let bad_offsets: [&[usize]; 4] = [&[0, 5, 3, 7], &[1, 7], &[0, 6], &[0]];
        for bad in bad_offsets {
            let err = AttentionInputs::new(q.view(), k.view(), v.view())
                .with_cu_seqlens(bad)
                .validate(false)
                .unwrap_err();
            assert!(matches!(err, ScanError::InvalidSegments(_)), "{bad:?}");
        }
    }

    #[test]
    fn test_cu_seqlens_requires_single_batch() {
        let (q, k, v) = tensors(2, 4, 1, 2, 2);
        let offsets = [0, 4];
        assert!(matches!(
            AttentionInputs::new(q.view(), k.view(), v.view())
                .with_cu_seqlens(&offsets)
                .validate(false),
            Err(ScanError::InvalidSegments(_))
        ));
    }
}

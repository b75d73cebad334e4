//! Code layouts for inverted lists.
//!
//! Both layouts score codes from the same per-list LUT, so they consume the
//! precomputed table identically. They differ in how codes are stored and summed:
//!
//! - [`Standard`]: one byte per sub-quantizer, `f32` accumulation.
//! - [`FastScan`]: 4-bit codes packed two per byte. The LUT is quantized to `u8` per
//!   (query, list) and codes are summed in `u16`, trading a little precision for
//!   much less memory traffic.

use super::invlists::InvertedList;
use super::scan::TopK;
use super::search::IVFPQParams;
use crate::distance::MetricType;
use crate::persistence::format::IndexType;
use crate::RetrieveError;

use smallvec::SmallVec;

/// How codes are stored and scanned.
pub trait CodeLayout: Copy + Default + Send + Sync + std::fmt::Debug + 'static {
    /// Persisted type tag.
    const INDEX_TYPE: IndexType;

    /// Reject parameters the layout cannot represent.
    fn validate(params: &IVFPQParams) -> Result<(), RetrieveError>;

    /// Stored bytes per vector.
    fn code_size(num_subquantizers: usize) -> usize;

    /// Pack one code per sub-quantizer into `packed` (`code_size` bytes).
    fn pack(codes: &[u8], packed: &mut [u8]);

    /// Inverse of [`pack`](Self::pack). `codes.len()` is the number of sub-quantizers.
    fn unpack(packed: &[u8], codes: &mut [u8]);

    /// Score every entry of `list` as `dis0 + sum_m lut[m][code_m]` and offer it to `top`.
    #[allow(clippy::too_many_arguments)]
    fn scan_list(
        list: &InvertedList,
        code_size: usize,
        lut: &[f32],
        ksub: usize,
        dis0: f32,
        metric: MetricType,
        top: &mut TopK,
        scratch: &mut Vec<u8>,
    );
}

/// One byte per sub-quantizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Standard;

impl CodeLayout for Standard {
    const INDEX_TYPE: IndexType = IndexType::IvfPq;

    fn validate(_params: &IVFPQParams) -> Result<(), RetrieveError> {
        Ok(())
    }

    fn code_size(num_subquantizers: usize) -> usize {
        num_subquantizers
    }

    fn pack(codes: &[u8], packed: &mut [u8]) {
        packed.copy_from_slice(codes);
    }

    fn unpack(packed: &[u8], codes: &mut [u8]) {
        codes.copy_from_slice(&packed[..codes.len()]);
    }

    fn scan_list(
        list: &InvertedList,
        code_size: usize,
        lut: &[f32],
        ksub: usize,
        dis0: f32,
        _metric: MetricType,
        top: &mut TopK,
        _scratch: &mut Vec<u8>,
    ) {
        for (&id, code) in list.ids().iter().zip(list.codes().chunks_exact(code_size)) {
            let mut dis = dis0;
            for (m, &c) in code.iter().enumerate() {
                dis += lut[m * ksub + c as usize];
            }
            top.push(id, dis);
        }
    }
}

/// 4-bit codes, two per byte (low nibble first), scanned with quantized LUTs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastScan;

/// The `u16` accumulator holds at most this many `u8` terms.
const FAST_SCAN_MAX_SUBQUANTIZERS: usize = (u16::MAX / u8::MAX as u16) as usize;

impl CodeLayout for FastScan {
    const INDEX_TYPE: IndexType = IndexType::IvfPqFastScan;

    fn validate(params: &IVFPQParams) -> Result<(), RetrieveError> {
        if params.codebook_bits != 4 {
            return Err(RetrieveError::InvalidParameter(format!(
                "fast-scan requires 4-bit codes, got {}",
                params.codebook_bits
            )));
        }
        if params.num_codebooks > FAST_SCAN_MAX_SUBQUANTIZERS {
            return Err(RetrieveError::InvalidParameter(format!(
                "fast-scan supports at most {FAST_SCAN_MAX_SUBQUANTIZERS} sub-quantizers"
            )));
        }
        Ok(())
    }

    fn code_size(num_subquantizers: usize) -> usize {
        num_subquantizers.div_ceil(2)
    }

    fn pack(codes: &[u8], packed: &mut [u8]) {
        for (byte, pair) in packed.iter_mut().zip(codes.chunks(2)) {
            let hi = pair.get(1).copied().unwrap_or(0);
            *byte = (pair[0] & 0x0f) | (hi << 4);
        }
    }

    fn unpack(packed: &[u8], codes: &mut [u8]) {
        for (m, code) in codes.iter_mut().enumerate() {
            let byte = packed[m / 2];
            *code = if m % 2 == 0 { byte & 0x0f } else { byte >> 4 };
        }
    }

    fn scan_list(
        list: &InvertedList,
        code_size: usize,
        lut: &[f32],
        ksub: usize,
        dis0: f32,
        metric: MetricType,
        top: &mut TopK,
        scratch: &mut Vec<u8>,
    ) {
        let (bias, scale) = quantize_lut(lut, ksub, dis0, metric, scratch);
        let num_subquantizers = lut.len() / ksub;
        let qlut = scratch.as_slice();

        for (&id, packed) in list.ids().iter().zip(list.codes().chunks_exact(code_size)) {
            let mut acc: u16 = 0;
            for m in 0..num_subquantizers {
                let byte = packed[m / 2];
                let code = if m % 2 == 0 { byte & 0x0f } else { byte >> 4 };
                acc += qlut[m * ksub + code as usize] as u16;
            }
            let cost = bias + acc as f32 / scale;
            // `to_cost` is its own inverse.
            top.push(id, metric.to_cost(cost));
        }
    }
}

/// Quantize `lut` (as costs) into `out`, one `u8` per entry.
///
/// Each sub-quantizer row is shifted by its own minimum; all rows share one scale
/// so sums stay comparable. Returns `(bias, scale)` with
/// `cost ≈ bias + sum(q) / scale`.
fn quantize_lut(
    lut: &[f32],
    ksub: usize,
    dis0: f32,
    metric: MetricType,
    out: &mut Vec<u8>,
) -> (f32, f32) {
    let mut mins: SmallVec<[f32; 64]> = SmallVec::new();
    let mut max_span = 0.0f32;
    for row in lut.chunks_exact(ksub) {
        let (lo, hi) = row.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            let c = metric.to_cost(v);
            (lo.min(c), hi.max(c))
        });
        mins.push(lo);
        max_span = max_span.max(hi - lo);
    }

    let scale = if max_span > 0.0 {
        u8::MAX as f32 / max_span
    } else {
        1.0
    };

    out.clear();
    out.reserve(lut.len());
    for (row, &lo) in lut.chunks_exact(ksub).zip(&mins) {
        out.extend(row.iter().map(|&v| {
            ((metric.to_cost(v) - lo) * scale)
                .round()
                .clamp(0.0, u8::MAX as f32) as u8
        }));
    }

    let bias = metric.to_cost(dis0) + mins.iter().sum::<f32>();
    (bias, scale)
}

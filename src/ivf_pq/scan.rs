//! Query-time scoring: per-list lookup tables and top-k selection.
//!
//! For every probed list the scan needs a LUT of `M x ksub` partial scores plus a
//! scalar `dis0`, so that a code scores as `dis0 + sum_m LUT[m][code_m]`. How the
//! LUT is obtained depends on metric, residual encoding and whether a precomputed
//! table is active:
//!
//! | metric | by_residual | table | dis0 | LUT |
//! |--------|-------------|-------|------|-----|
//! | L2 | yes | yes | `‖x - y_C‖²` | `table[list] - 2·ip(x)` |
//! | L2 | yes | no | 0 | `l2(x - y_C)` |
//! | L2 | no | - | 0 | `l2(x)` |
//! | IP | yes | - | `⟨x, y_C⟩` | `ip(x)` |
//! | IP | no | - | 0 | `ip(x)` |
//!
//! `ip(x)` and `l2(x)` are computed once per query and reused across lists.

use super::coarse::CoarseQuantizer;
use super::pq::ProductQuantizer;
use super::precomputed::AlignedTable;
use crate::distance::MetricType;
use crate::simd;

use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;

/// Builds per-list LUTs for one index state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LutBuilder<'a> {
    quantizer: &'a CoarseQuantizer,
    pq: &'a ProductQuantizer,
    by_residual: bool,
    table: Option<&'a AlignedTable>,
}

/// Reusable buffers for one searching thread.
#[derive(Debug, Default)]
pub(crate) struct ScanScratch {
    pub(crate) lut: LutScratch,
    pub(crate) quantized: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct LutScratch {
    query_table: Vec<f32>,
    residual: Vec<f32>,
    lut: Vec<f32>,
}

impl<'a> LutBuilder<'a> {
    /// `table` must be `Some` only when the table is active and applicable.
    pub(crate) fn new(
        quantizer: &'a CoarseQuantizer,
        pq: &'a ProductQuantizer,
        by_residual: bool,
        table: Option<&'a AlignedTable>,
    ) -> Self {
        let table = table.filter(|_| by_residual && quantizer.metric().has_residual_decomposition());
        Self {
            quantizer,
            pq,
            by_residual,
            table,
        }
    }

    #[inline]
    pub(crate) fn uses_table(&self) -> bool {
        self.table.is_some()
    }

    /// Compute the per-query tables for `query`.
    pub(crate) fn init_query(&self, query: &[f32], scratch: &mut LutScratch) {
        let table_len = self.pq.table_len();
        scratch.query_table.resize(table_len, 0.0);
        scratch.lut.resize(table_len, 0.0);
        scratch.residual.resize(self.pq.dimension(), 0.0);

        match self.quantizer.metric() {
            MetricType::L2 if !self.by_residual => {
                self.pq.compute_distance_table(query, &mut scratch.query_table);
            }
            MetricType::L2 if self.table.is_some() => {
                self.pq.compute_inner_prod_table(query, &mut scratch.query_table);
            }
            // The residual is list-dependent, nothing to share across lists.
            MetricType::L2 => {}
            MetricType::InnerProduct => {
                self.pq.compute_inner_prod_table(query, &mut scratch.query_table);
            }
        }
    }

    /// LUT and `dis0` for list `list_no`, whose coarse score is `coarse_dis`.
    ///
    /// [`init_query`](Self::init_query) must have been called for `query`.
    pub(crate) fn list_lut<'s>(
        &self,
        query: &[f32],
        list_no: usize,
        coarse_dis: f32,
        scratch: &'s mut LutScratch,
    ) -> (f32, &'s [f32]) {
        let LutScratch {
            query_table,
            residual,
            lut,
        } = scratch;

        match self.quantizer.metric() {
            MetricType::L2 if !self.by_residual => (0.0, query_table.as_slice()),
            MetricType::L2 => match self.table {
                Some(table) => {
                    let len = lut.len();
                    let precomputed = &table.as_slice()[list_no * len..(list_no + 1) * len];
                    simd::madd(precomputed, -2.0, query_table, lut);
                    (coarse_dis, lut.as_slice())
                }
                None => {
                    self.quantizer.compute_residual(query, list_no, residual);
                    self.pq.compute_distance_table(residual, lut);
                    (0.0, lut.as_slice())
                }
            },
            MetricType::InnerProduct if self.by_residual => (coarse_dis, query_table.as_slice()),
            MetricType::InnerProduct => (0.0, query_table.as_slice()),
        }
    }
}

/// Keeps the `k` best `(id, score)` pairs for a metric.
///
/// Ties are broken by the lower id so results are deterministic.
#[derive(Debug)]
pub(crate) struct TopK {
    k: usize,
    metric: MetricType,
    heap: BinaryHeap<(OrderedFloat<f32>, u32)>,
}

impl TopK {
    pub(crate) fn new(k: usize, metric: MetricType) -> Self {
        Self {
            k,
            metric,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, id: u32, score: f32) {
        if self.k == 0 {
            return;
        }
        let entry = (OrderedFloat(self.metric.to_cost(score)), id);
        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry < *worst {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    /// Best first.
    pub(crate) fn into_sorted_vec(self) -> Vec<(u32, f32)> {
        let metric = self.metric;
        self.heap
            .into_sorted_vec()
            .into_iter()
            // `to_cost` is its own inverse.
            .map(|(cost, id)| (id, metric.to_cost(cost.0)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivf_pq::precomputed::build_precomputed_table;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn top_k_keeps_smallest_for_l2() {
        let mut top = TopK::new(2, MetricType::L2);
        for (id, d) in [(0, 3.0), (1, 1.0), (2, 2.0), (3, 1.0)] {
            top.push(id, d);
        }
        assert_eq!(top.into_sorted_vec(), vec![(1, 1.0), (3, 1.0)]);
    }

    #[test]
    fn top_k_keeps_largest_for_inner_product() {
        let mut top = TopK::new(2, MetricType::InnerProduct);
        for (id, s) in [(0, 3.0), (1, 1.0), (2, 5.0)] {
            top.push(id, s);
        }
        assert_eq!(top.into_sorted_vec(), vec![(2, 5.0), (0, 3.0)]);
    }

    #[test]
    fn top_k_zero_is_empty() {
        let mut top = TopK::new(0, MetricType::L2);
        top.push(1, 1.0);
        assert!(top.into_sorted_vec().is_empty());
    }

    #[test]
    fn table_lut_matches_residual_lut() {
        let (d, n) = (16, 400);
        let mut rng = StdRng::seed_from_u64(21);
        let data: Vec<f32> = (0..n * d).map(|_| rng.random::<f32>()).collect();

        let mut coarse = CoarseQuantizer::new(d, 8, MetricType::L2).unwrap();
        coarse.train(&data, n, 3, 10).unwrap();
        let mut residuals = vec![0.0; n * d];
        for (x, r) in data.chunks_exact(d).zip(residuals.chunks_exact_mut(d)) {
            coarse.compute_residual(x, coarse.assign(x), r);
        }
        let mut pq = ProductQuantizer::new(d, 4, 4).unwrap();
        pq.train(&residuals, n, 4, 10).unwrap();
        let (_, table) = build_precomputed_table(&coarse, &pq, true, false).unwrap();

        let with_table = LutBuilder::new(&coarse, &pq, true, Some(&table));
        let without = LutBuilder::new(&coarse, &pq, true, None);
        assert!(with_table.uses_table());
        assert!(!without.uses_table());

        let mut a = LutScratch::default();
        let mut b = LutScratch::default();
        for _ in 0..20 {
            let query: Vec<f32> = (0..d).map(|_| rng.random::<f32>()).collect();
            with_table.init_query(&query, &mut a);
            without.init_query(&query, &mut b);

            for (list_no, coarse_dis) in coarse.search(&query, 8) {
                let (dis0_a, lut_a) = with_table.list_lut(&query, list_no, coarse_dis, &mut a);
                let (dis0_b, lut_b) = without.list_lut(&query, list_no, coarse_dis, &mut b);

                for _ in 0..10 {
                    let code: Vec<usize> = (0..pq.num_subquantizers())
                        .map(|_| rng.random_range(0..pq.ksub()))
                        .collect();
                    let score = |dis0: f32, lut: &[f32]| -> f32 {
                        dis0 + code
                            .iter()
                            .enumerate()
                            .map(|(m, &c)| lut[m * pq.ksub() + c])
                            .sum::<f32>()
                    };
                    let sa = score(dis0_a, lut_a);
                    let sb = score(dis0_b, lut_b);
                    assert!((sa - sb).abs() <= 1e-4 * sb.abs().max(1.0), "{sa} vs {sb}");
                }
            }
        }
    }

    #[test]
    fn inner_product_ignores_table() {
        let coarse = CoarseQuantizer::from_centroids(2, MetricType::InnerProduct, vec![1.0, 0.0]).unwrap();
        let pq = ProductQuantizer::from_centroids(2, 1, 1, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        let table = AlignedTable::with_len(2);
        let builder = LutBuilder::new(&coarse, &pq, true, Some(&table));
        assert!(!builder.uses_table());

        let mut scratch = LutScratch::default();
        let query = [2.0, 3.0];
        builder.init_query(&query, &mut scratch);
        let (dis0, lut) = builder.list_lut(&query, 0, 2.0, &mut scratch);
        assert_eq!(dis0, 2.0);
        assert_eq!(lut, &[3.0, 2.0]);
    }
}

//! Flat-array vector index.
//!
//! Brute-force cosine top-k over a contiguous `f32` slab. Up to the working-set
//! sizes a single vault holds (~10^5 vectors at d=1024) this beats graph
//! structures on wall clock and gives deterministic latency, which matters more
//! here than asymptotic advantage. Vectors are L2-normalized at insertion so
//! scoring is a plain dot product.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{AppError, AppResult};

/// Initial slot capacity; grows by doubling.
const INITIAL_CAPACITY: usize = 1024;

/// Norms below this cannot be normalized meaningfully.
const MIN_NORM: f32 = 1e-12;

/// A scored search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub id: i64,
    pub score: f32,
    pub timestamp: f64,
}

/// In-memory index: three parallel growable arrays sharing a slot number.
pub struct VectorIndex {
    dims: usize,
    count: usize,
    capacity: usize,
    vectors: Vec<f32>,
    ids: Vec<i64>,
    timestamps: Vec<f64>,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Self {
        Self::with_capacity(dims, INITIAL_CAPACITY)
    }

    pub fn with_capacity(dims: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            dims,
            count: 0,
            capacity,
            vectors: Vec::with_capacity(capacity * dims),
            ids: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append a vector, L2-normalizing into its slot.
    ///
    /// The caller guarantees `id` uniqueness (ids come from persistence).
    pub fn add(&mut self, id: i64, vector: &[f32], timestamp: f64) -> AppResult<()> {
        if vector.len() != self.dims {
            return Err(AppError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        let norm = l2_norm(vector);
        if norm < MIN_NORM {
            return Err(AppError::BadRequest(
                "cannot index a zero-norm vector".to_string(),
            ));
        }

        if self.count == self.capacity {
            self.capacity *= 2;
            self.vectors.reserve(self.capacity * self.dims - self.vectors.len());
            self.ids.reserve(self.capacity - self.ids.len());
            self.timestamps.reserve(self.capacity - self.timestamps.len());
        }

        let inv = 1.0 / norm;
        self.vectors.extend(vector.iter().map(|x| x * inv));
        self.ids.push(id);
        self.timestamps.push(timestamp);
        self.count += 1;
        Ok(())
    }

    /// Cosine top-k with optional timestamp bounds.
    ///
    /// Results are sorted by score descending; equal scores order by lower id.
    pub fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        min_ts: Option<f64>,
        max_ts: Option<f64>,
    ) -> AppResult<Vec<Hit>> {
        if query.len() != self.dims {
            return Err(AppError::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }
        if k == 0 || self.count == 0 {
            return Ok(Vec::new());
        }
        let norm = l2_norm(query);
        if norm < MIN_NORM {
            return Err(AppError::BadRequest("cannot search with a zero-norm query".to_string()));
        }
        let inv = 1.0 / norm;
        let q: Vec<f32> = query.iter().map(|x| x * inv).collect();

        // Size-k min-heap: the root is the weakest hit kept so far. Capacity
        // is bounded by the live count so an oversized k cannot over-allocate.
        let mut heap: BinaryHeap<std::cmp::Reverse<RankedHit>> =
            BinaryHeap::with_capacity(k.min(self.count) + 1);

        for slot in 0..self.count {
            let ts = self.timestamps[slot];
            if let Some(min) = min_ts {
                if ts < min {
                    continue;
                }
            }
            if let Some(max) = max_ts {
                if ts > max {
                    continue;
                }
            }
            let base = slot * self.dims;
            let score = dot(&q, &self.vectors[base..base + self.dims]);
            let hit = RankedHit {
                score,
                id: self.ids[slot],
                timestamp: ts,
            };
            if heap.len() < k {
                heap.push(std::cmp::Reverse(hit));
            } else if let Some(weakest) = heap.peek() {
                if hit > weakest.0 {
                    heap.pop();
                    heap.push(std::cmp::Reverse(hit));
                }
            }
        }

        let mut hits: Vec<RankedHit> = heap.into_iter().map(|r| r.0).collect();
        hits.sort_by(|a, b| b.cmp(a));
        Ok(hits
            .into_iter()
            .map(|h| Hit {
                id: h.id,
                score: h.score,
                timestamp: h.timestamp,
            })
            .collect())
    }

    /// Materialize a new index holding only entries with `min <= ts <= max`.
    /// Offline tooling path, not used during retrieval.
    pub fn filter_by_time(&self, min: f64, max: f64) -> VectorIndex {
        let mut out = VectorIndex::with_capacity(self.dims, INITIAL_CAPACITY);
        for slot in 0..self.count {
            let ts = self.timestamps[slot];
            if ts < min || ts > max {
                continue;
            }
            let base = slot * self.dims;
            // Slot data is already normalized; re-adding renormalizes to the
            // same values within rounding.
            let _ = out.add(self.ids[slot], &self.vectors[base..base + self.dims], ts);
        }
        out
    }

    /// Pack the index into the little-endian wire format:
    /// `[dims: u32][count: u32][reserved: u32][ids: u32 x count][pad to 8][ts: f64 x count][vec: f32 x d x count]`.
    ///
    /// Ids are written as `u32`; any id outside that range is a hard error
    /// rather than a silent truncation.
    pub fn serialize(&self) -> AppResult<Vec<u8>> {
        for &id in &self.ids {
            if id < 0 || id > u32::MAX as i64 {
                return Err(AppError::VaultError(format!(
                    "id {} does not fit the u32 wire format",
                    id
                )));
            }
        }

        let header = 12usize;
        let ids_bytes = 4 * self.count;
        let pad = (8 - (header + ids_bytes) % 8) % 8;
        let total = header + ids_bytes + pad + 8 * self.count + 4 * self.dims * self.count;
        let mut buf = Vec::with_capacity(total);

        buf.extend_from_slice(&(self.dims as u32).to_le_bytes());
        buf.extend_from_slice(&(self.count as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        for &id in &self.ids {
            buf.extend_from_slice(&(id as u32).to_le_bytes());
        }
        buf.extend(std::iter::repeat_n(0u8, pad));
        for &ts in &self.timestamps {
            buf.extend_from_slice(&ts.to_le_bytes());
        }
        for &v in &self.vectors[..self.count * self.dims] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Ok(buf)
    }

    /// Inverse of [`serialize`](Self::serialize).
    pub fn deserialize(data: &[u8]) -> AppResult<VectorIndex> {
        let header = 12usize;
        if data.len() < header {
            return Err(AppError::VaultError("index blob truncated header".to_string()));
        }
        let dims = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

        let ids_bytes = 4 * count;
        let pad = (8 - (header + ids_bytes) % 8) % 8;
        let expected = header + ids_bytes + pad + 8 * count + 4 * dims * count;
        if data.len() < expected {
            return Err(AppError::VaultError(format!(
                "index blob truncated: expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }

        let mut index = VectorIndex::with_capacity(dims, count.max(1));
        let mut off = header;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) as i64);
            off += 4;
        }
        off += pad;
        let mut timestamps = Vec::with_capacity(count);
        for _ in 0..count {
            timestamps.push(f64::from_le_bytes(data[off..off + 8].try_into().unwrap()));
            off += 8;
        }
        let mut vectors = Vec::with_capacity(count * dims);
        for _ in 0..count * dims {
            vectors.push(f32::from_le_bytes(data[off..off + 4].try_into().unwrap()));
            off += 4;
        }

        index.ids = ids;
        index.timestamps = timestamps;
        index.vectors = vectors;
        index.count = count;
        index.capacity = count.max(1);
        Ok(index)
    }

    /// Raw normalized slot data, for mirroring and export.
    pub fn slot(&self, i: usize) -> (&[f32], i64, f64) {
        let base = i * self.dims;
        (
            &self.vectors[base..base + self.dims],
            self.ids[i],
            self.timestamps[i],
        )
    }
}

/// Internal ranking wrapper: higher score wins, equal scores prefer lower id.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RankedHit {
    score: f32,
    id: i64,
    timestamp: f64,
}

impl Eq for RankedHit {}

impl Ord for RankedHit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for RankedHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis(dims: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn add_normalizes() {
        let mut idx = VectorIndex::new(4);
        idx.add(1, &[3.0, 0.0, 4.0, 0.0], 1000.0).unwrap();
        let (slot, _, _) = idx.slot(0);
        let norm = l2_norm(slot);
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_zero_vector() {
        let mut idx = VectorIndex::new(4);
        assert!(idx.add(1, &[0.0; 4], 0.0).is_err());
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let mut idx = VectorIndex::new(4);
        let err = idx.add(1, &[1.0, 2.0], 0.0).unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { expected: 4, got: 2 }));
    }

    #[test]
    fn top_k_orders_by_score_then_lower_id() {
        let mut idx = VectorIndex::new(2);
        idx.add(7, &[1.0, 0.0], 0.0).unwrap();
        idx.add(3, &[1.0, 0.0], 0.0).unwrap();
        idx.add(5, &[0.0, 1.0], 0.0).unwrap();

        let hits = idx.search_top_k(&[1.0, 0.0], 3, None, None).unwrap();
        assert_eq!(hits.len(), 3);
        // Two perfect matches tie; the lower id comes first.
        assert_eq!(hits[0].id, 3);
        assert_eq!(hits[1].id, 7);
        assert_eq!(hits[2].id, 5);
        assert!(hits[0].score > 0.999);
        for h in &hits {
            assert!(h.score >= -1.0 - 1e-5 && h.score <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn timestamp_floor_filters() {
        let mut idx = VectorIndex::new(2);
        idx.add(1, &[1.0, 0.0], 100.0).unwrap();
        idx.add(2, &[1.0, 0.0], 200.0).unwrap();
        idx.add(3, &[1.0, 0.0], 300.0).unwrap();

        let hits = idx.search_top_k(&[1.0, 0.0], 10, Some(150.0), None).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 3]);

        let hits = idx
            .search_top_k(&[1.0, 0.0], 10, Some(150.0), Some(250.0))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn respects_k() {
        let mut idx = VectorIndex::new(3);
        for i in 0..20 {
            idx.add(i, &basis(3, (i % 3) as usize), i as f64).unwrap();
        }
        let hits = idx.search_top_k(&basis(3, 0), 5, None, None).unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn growth_past_initial_capacity() {
        let mut idx = VectorIndex::with_capacity(2, 2);
        for i in 0..100 {
            idx.add(i, &[1.0, i as f32], i as f64).unwrap();
        }
        assert_eq!(idx.len(), 100);
        let hits = idx.search_top_k(&[1.0, 0.0], 1, None, None).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn serialize_round_trip() {
        let mut idx = VectorIndex::new(8);
        for i in 0..7 {
            let mut v = vec![0.1_f32; 8];
            v[i % 8] = 1.0 + i as f32;
            idx.add(i as i64 * 3 + 1, &v, 1_700_000_000_000.0 + i as f64).unwrap();
        }

        let blob = idx.serialize().unwrap();
        let restored = VectorIndex::deserialize(&blob).unwrap();

        assert_eq!(restored.dims(), idx.dims());
        assert_eq!(restored.len(), idx.len());
        for i in 0..idx.len() {
            let (v_a, id_a, ts_a) = idx.slot(i);
            let (v_b, id_b, ts_b) = restored.slot(i);
            assert_eq!(id_a, id_b);
            assert_eq!(ts_a, ts_b);
            for (a, b) in v_a.iter().zip(v_b) {
                assert!((a - b).abs() <= f32::EPSILON);
            }
        }

        // Identical search behavior on the restored copy.
        let q: Vec<f32> = (0..8).map(|i| i as f32 * 0.3 - 1.0).collect();
        let a = idx.search_top_k(&q, 4, None, None).unwrap();
        let b = restored.search_top_k(&q, 4, None, None).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.id, y.id);
            assert!((x.score - y.score).abs() < 1e-6);
        }
    }

    #[test]
    fn serialize_rejects_wide_ids() {
        let mut idx = VectorIndex::new(2);
        idx.add(u32::MAX as i64 + 1, &[1.0, 0.0], 0.0).unwrap();
        assert!(idx.serialize().is_err());
    }

    #[test]
    fn padding_keeps_timestamps_aligned() {
        // Odd counts force a non-zero pad between the u32 ids and f64 timestamps.
        for count in 1..6 {
            let mut idx = VectorIndex::new(2);
            for i in 0..count {
                idx.add(i, &[1.0, 2.0], i as f64 * 0.5).unwrap();
            }
            let blob = idx.serialize().unwrap();
            let restored = VectorIndex::deserialize(&blob).unwrap();
            for i in 0..count as usize {
                assert_eq!(restored.slot(i).2, i as f64 * 0.5);
            }
        }
    }

    #[test]
    fn filter_by_time_materializes_subset() {
        let mut idx = VectorIndex::new(2);
        idx.add(1, &[1.0, 0.0], 100.0).unwrap();
        idx.add(2, &[0.0, 1.0], 200.0).unwrap();
        idx.add(3, &[1.0, 1.0], 300.0).unwrap();

        let filtered = idx.filter_by_time(150.0, 250.0);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.slot(0).1, 2);
        assert_eq!(filtered.dims(), 2);
    }
}

//! Result accumulators — append-only collection and tensor reduction.
//!
//! Both accumulators share the same termination logic: a round is over
//! when the received count reaches the expected item count, regardless of
//! which worker produced what. A record that cannot be folded leaves the
//! accumulator untouched so the caller can drop it and move on.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::warn;

use drover_wire::{Record, Tensor, TensorError, Value};

/// Field a chunked result uses to address its slab.
pub const INDEX_FIELD: &str = "index";

/// Why a result record could not be folded in.
#[derive(Debug, Error)]
pub enum FoldError {
    #[error("result is missing field {0:?}")]
    MissingField(String),

    #[error("field {field:?} is not a tensor (got {got})")]
    NotATensor { field: String, got: &'static str },

    #[error("field {0:?} does not hold a usable slab index")]
    BadIndex(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Anything that folds result records and reports how many it took.
pub trait Accumulate {
    fn fold(&mut self, record: &Record) -> Result<(), FoldError>;
    fn received(&self) -> usize;
}

/// Append-only columns keyed by the declared field names.
#[derive(Debug, Default)]
pub struct Collected {
    columns: BTreeMap<String, Vec<Value>>,
    received: usize,
}

impl Collected {
    pub fn new(keys: &[&str]) -> Self {
        Self {
            columns: keys.iter().map(|k| (k.to_string(), Vec::new())).collect(),
            received: 0,
        }
    }

    pub fn column(&self, key: &str) -> Option<&[Value]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    pub fn into_columns(self) -> BTreeMap<String, Vec<Value>> {
        self.columns
    }
}

impl Accumulate for Collected {
    /// Append the declared fields of one result, in arrival order.
    fn fold(&mut self, record: &Record) -> Result<(), FoldError> {
        // Validate first so a bad record leaves no partial row behind.
        for key in self.columns.keys() {
            if !record.contains_key(key) {
                return Err(FoldError::MissingField(key.clone()));
            }
        }
        for (key, column) in self.columns.iter_mut() {
            if let Some(value) = record.get(key) {
                column.push(value.clone());
            }
        }
        self.received += 1;
        Ok(())
    }

    fn received(&self) -> usize {
        self.received
    }
}

/// Reduction buffer: tensors folded by addition, with an append-only
/// control column proving which items reported back.
///
/// Shapes of rank three or less reduce whole-tensor; deeper shapes switch
/// to the chunked variant, where every result addresses one
/// leading-dimension slab through its [`INDEX_FIELD`]. Callers promise
/// disjoint indices in chunked mode; a repeat is folded anyway but logged
/// loudly, since the sum is no longer what the caller thinks it is.
#[derive(Debug)]
pub struct SumAccumulator {
    control_key: String,
    result_key: String,
    control: Vec<Value>,
    buffer: Tensor,
    chunked: bool,
    seen_indices: HashSet<usize>,
    received: usize,
}

impl SumAccumulator {
    pub fn new(control_key: impl Into<String>, result_key: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            control_key: control_key.into(),
            result_key: result_key.into(),
            control: Vec::new(),
            buffer: Tensor::zeros_f32(shape),
            chunked: shape.len() > 3,
            seen_indices: HashSet::new(),
            received: 0,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn buffer(&self) -> &Tensor {
        &self.buffer
    }

    pub fn control(&self) -> &[Value] {
        &self.control
    }

    pub fn into_parts(self) -> (Tensor, Vec<Value>) {
        (self.buffer, self.control)
    }

    fn result_tensor<'a>(&self, record: &'a Record) -> Result<&'a Tensor, FoldError> {
        let value = record
            .get(&self.result_key)
            .ok_or_else(|| FoldError::MissingField(self.result_key.clone()))?;
        value.as_tensor().ok_or_else(|| FoldError::NotATensor {
            field: self.result_key.clone(),
            got: value.type_name(),
        })
    }
}

impl Accumulate for SumAccumulator {
    fn fold(&mut self, record: &Record) -> Result<(), FoldError> {
        let control = record
            .get(&self.control_key)
            .ok_or_else(|| FoldError::MissingField(self.control_key.clone()))?
            .clone();
        let tensor = self.result_tensor(record)?;
        if self.chunked {
            let index = record
                .get_i64(INDEX_FIELD)
                .and_then(|i| usize::try_from(i).ok())
                .ok_or_else(|| FoldError::BadIndex(INDEX_FIELD.to_string()))?;
            self.buffer.add_slab(index, tensor)?;
            if !self.seen_indices.insert(index) {
                warn!(index, "slab index folded more than once");
            }
        } else {
            self.buffer.add_assign(tensor)?;
        }
        self.control.push(control);
        self.received += 1;
        Ok(())
    }

    fn received(&self) -> usize {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(scale: i64, dat: Vec<f32>) -> Record {
        Record::new()
            .with("scale", scale)
            .with("dat", Tensor::vector_f32(dat))
    }

    #[test]
    fn collect_appends_in_arrival_order() {
        let mut acc = Collected::new(&["scale", "dat"]);
        acc.fold(&result(2, vec![1.0])).unwrap();
        acc.fold(&result(1, vec![2.0])).unwrap();
        assert_eq!(acc.received(), 2);
        let scales = acc.column("scale").unwrap();
        assert_eq!(scales[0].as_i64(), Some(2));
        assert_eq!(scales[1].as_i64(), Some(1));
    }

    #[test]
    fn collect_rejects_a_record_missing_a_declared_field() {
        let mut acc = Collected::new(&["scale", "dat"]);
        let partial = Record::new().with("scale", 1i64);
        assert!(matches!(
            acc.fold(&partial),
            Err(FoldError::MissingField(f)) if f == "dat"
        ));
        assert_eq!(acc.received(), 0);
        assert!(acc.column("scale").unwrap().is_empty());
    }

    #[test]
    fn sum_folds_whole_tensors() {
        let mut acc = SumAccumulator::new("scale", "dat", &[2]);
        assert!(!acc.is_chunked());
        acc.fold(&result(1, vec![1.0, 2.0])).unwrap();
        acc.fold(&result(2, vec![3.0, 4.0])).unwrap();
        assert_eq!(acc.buffer().as_f32().unwrap(), &[4.0, 6.0]);
        assert_eq!(acc.control().len(), 2);
    }

    #[test]
    fn sum_is_commutative_over_arrival_order() {
        let records = [
            result(1, vec![1.0, 10.0]),
            result(2, vec![2.0, 20.0]),
            result(3, vec![3.0, 30.0]),
        ];
        let orders = [[0, 1, 2], [2, 0, 1], [1, 2, 0]];
        let mut buffers = Vec::new();
        for order in orders {
            let mut acc = SumAccumulator::new("scale", "dat", &[2]);
            for i in order {
                acc.fold(&records[i]).unwrap();
            }
            buffers.push(acc.buffer().clone());
        }
        assert_eq!(buffers[0], buffers[1]);
        assert_eq!(buffers[1], buffers[2]);
    }

    #[test]
    fn deep_shapes_reduce_slab_by_slab() {
        let mut acc = SumAccumulator::new("scale", "dat", &[2, 1, 1, 2]);
        assert!(acc.is_chunked());
        let slab = |v: f32| Tensor::from_f32(&[1, 1, 2], vec![v, v]).unwrap();
        acc.fold(
            &Record::new()
                .with("scale", 1i64)
                .with(INDEX_FIELD, 1i64)
                .with("dat", slab(3.0)),
        )
        .unwrap();
        acc.fold(
            &Record::new()
                .with("scale", 2i64)
                .with(INDEX_FIELD, 0i64)
                .with("dat", slab(5.0)),
        )
        .unwrap();
        assert_eq!(acc.buffer().as_f32().unwrap(), &[5.0, 5.0, 3.0, 3.0]);
    }

    #[test]
    fn chunked_mode_requires_a_slab_index() {
        let mut acc = SumAccumulator::new("scale", "dat", &[2, 1, 1, 2]);
        let missing = Record::new()
            .with("scale", 1i64)
            .with("dat", Tensor::from_f32(&[1, 1, 2], vec![1.0, 1.0]).unwrap());
        assert!(matches!(acc.fold(&missing), Err(FoldError::BadIndex(_))));
        assert_eq!(acc.received(), 0);
    }

    #[test]
    fn repeated_slab_index_still_folds() {
        let mut acc = SumAccumulator::new("scale", "dat", &[2, 1, 1, 2]);
        let rec = Record::new()
            .with("scale", 1i64)
            .with(INDEX_FIELD, 0i64)
            .with("dat", Tensor::from_f32(&[1, 1, 2], vec![2.0, 2.0]).unwrap());
        acc.fold(&rec).unwrap();
        acc.fold(&rec).unwrap();
        assert_eq!(acc.received(), 2);
        assert_eq!(acc.buffer().as_f32().unwrap(), &[4.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn failed_fold_leaves_the_accumulator_unchanged() {
        let mut acc = SumAccumulator::new("scale", "dat", &[2]);
        acc.fold(&result(1, vec![1.0, 1.0])).unwrap();
        // Wrong shape: rejected by the tensor math.
        assert!(acc.fold(&result(2, vec![1.0])).is_err());
        assert_eq!(acc.received(), 1);
        assert_eq!(acc.control().len(), 1);
        assert_eq!(acc.buffer().as_f32().unwrap(), &[1.0, 1.0]);
    }
}

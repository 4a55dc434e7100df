//! In-memory labelled datasets.
//!
//! Instances keep their raw integer label. A model decides which label is
//! the positive ("outer") class; every instance also records its index within
//! its own label class, which the assignment tracker uses as a stable id for
//! positive instances.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::libsvm;
use crate::error::{CpmError, Result};
use crate::linalg::features::FeatureVector;
use crate::linalg::sparse_vector::SparseVector;

/// One labelled example.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Raw label.
    pub label: i32,

    /// Feature vector.
    pub features: SparseVector,

    /// Position of this instance among instances sharing its label.
    pub class_index: usize,
}

impl Instance {
    /// ±1 label with respect to `outer_label`.
    pub fn binary_label(&self, outer_label: i32) -> i8 {
        if self.label == outer_label {
            1
        } else {
            -1
        }
    }

    /// Dense id among positives, if this instance is positive.
    pub fn positive_id(&self, outer_label: i32) -> Option<usize> {
        (self.label == outer_label).then_some(self.class_index)
    }
}

/// Ordered, read-only collection of instances.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    instances: Vec<Instance>,
    dimensions: usize,
    counts_per_class: BTreeMap<i32, usize>,
}

impl Dataset {
    /// Build from `(label, features)` pairs. Dimensionality is the smallest
    /// that fits every vector.
    pub fn from_labelled<I>(items: I) -> Self
    where
        I: IntoIterator<Item = (i32, SparseVector)>,
    {
        let mut dataset = Self::default();
        for (label, features) in items {
            dataset.push(label, features);
        }
        dataset
    }

    fn push(&mut self, label: i32, features: SparseVector) {
        let count = self.counts_per_class.entry(label).or_insert(0);
        let class_index = *count;
        *count += 1;
        self.dimensions = self.dimensions.max(features.required_dim());
        self.instances.push(Instance {
            label,
            features,
            class_index,
        });
    }

    /// Widen the declared dimensionality. Fails if any instance is wider.
    pub fn with_dimensions(mut self, dimensions: usize) -> Result<Self> {
        if dimensions < self.dimensions {
            return Err(CpmError::dimension_mismatch(dimensions, self.dimensions));
        }
        self.dimensions = dimensions;
        Ok(self)
    }

    /// Build from a row-major dense matrix of `labels.len()` rows.
    pub fn from_dense(data: &[f64], labels: &[i32], dimensions: usize) -> Result<Self> {
        if data.len() != labels.len() * dimensions {
            return Err(CpmError::invalid_parameter(format!(
                "dense data has {} values, expected {} rows × {} columns",
                data.len(),
                labels.len(),
                dimensions
            )));
        }
        let items = labels.iter().enumerate().map(|(i, &label)| {
            let row = &data[i * dimensions..(i + 1) * dimensions];
            (label, SparseVector::from_dense(row))
        });
        Self::from_labelled(items).with_dimensions(dimensions)
    }

    /// Build from CSR arrays: row `i` spans `indptr[i]..indptr[i + 1]`.
    pub fn from_csr(
        data: &[f64],
        indices: &[i64],
        indptr: &[usize],
        labels: &[i32],
    ) -> Result<Self> {
        if data.len() != indices.len() {
            return Err(CpmError::invalid_parameter(format!(
                "CSR data has {} values but {} indices",
                data.len(),
                indices.len()
            )));
        }
        if indptr.len() != labels.len() + 1 {
            return Err(CpmError::invalid_parameter(format!(
                "CSR indptr has {} entries, expected {}",
                indptr.len(),
                labels.len() + 1
            )));
        }

        let mut dataset = Self::default();
        for (i, &label) in labels.iter().enumerate() {
            let (start, end) = (indptr[i], indptr[i + 1]);
            if start > end || end > data.len() {
                return Err(CpmError::invalid_parameter(format!(
                    "CSR row {} spans invalid range {}..{}",
                    i, start, end
                )));
            }
            let pairs = indices[start..end]
                .iter()
                .copied()
                .zip(data[start..end].iter().copied());
            dataset.push(label, SparseVector::from_pairs(pairs)?);
        }
        Ok(dataset)
    }

    /// Parse libsvm text.
    pub fn from_libsvm_str(text: &str) -> Result<Self> {
        Ok(Self::from_labelled(libsvm::read_instances(text.as_bytes())?))
    }

    /// Load a libsvm file.
    pub fn from_libsvm_file(path: &Path) -> Result<Self> {
        let dataset = Self::from_labelled(libsvm::read_file(path)?);
        tracing::debug!(
            "Loaded {} instances ({} dimensions) from {}",
            dataset.len(),
            dataset.dimensions(),
            path.display()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Feature dimensionality (max index + 1 unless widened).
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn get(&self, i: usize) -> Option<&Instance> {
        self.instances.get(i)
    }

    /// Bounds-checked instance access.
    pub fn instance(&self, i: usize) -> Result<&Instance> {
        self.instances
            .get(i)
            .ok_or_else(|| CpmError::out_of_range("instance", i, self.instances.len()))
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    /// Number of instances per raw label.
    pub fn counts_per_class(&self) -> &BTreeMap<i32, usize> {
        &self.counts_per_class
    }

    /// Number of instances carrying `label`.
    pub fn count(&self, label: i32) -> usize {
        self.counts_per_class.get(&label).copied().unwrap_or(0)
    }

    /// All raw labels in order.
    pub fn labels(&self) -> Vec<i32> {
        self.instances.iter().map(|inst| inst.label).collect()
    }

    /// Hash of every label and feature; identical datasets share it.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.dimensions.hash(&mut hasher);
        for inst in &self.instances {
            inst.label.hash(&mut hasher);
            inst.features.indices().hash(&mut hasher);
            for value in inst.features.values() {
                value.to_bits().hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Write as libsvm text.
    pub fn to_libsvm(&self) -> String {
        let mut out = String::new();
        for inst in &self.instances {
            out.push_str(&libsvm::format_line(inst.label, &inst.features));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "1 0:1.0 2:0.5\n-1 1:1.0\n1 3:2.0\n-1 0:-1.0\n";

    #[test]
    fn test_from_libsvm_str() {
        let ds = Dataset::from_libsvm_str(TEXT).unwrap();
        assert_eq!(ds.len(), 4);
        assert_eq!(ds.dimensions(), 4);
        assert_eq!(ds.count(1), 2);
        assert_eq!(ds.count(-1), 2);
        assert_eq!(ds.count(7), 0);
        assert_eq!(ds.labels(), vec![1, -1, 1, -1]);
    }

    #[test]
    fn test_class_indices() {
        let ds = Dataset::from_libsvm_str(TEXT).unwrap();
        let ids: Vec<usize> = ds.iter().map(|i| i.class_index).collect();
        assert_eq!(ids, vec![0, 0, 1, 1]);
        assert_eq!(ds.instance(2).unwrap().positive_id(1), Some(1));
        assert_eq!(ds.instance(1).unwrap().positive_id(1), None);
        assert_eq!(ds.instance(1).unwrap().binary_label(1), -1);
        assert_eq!(ds.instance(1).unwrap().binary_label(-1), 1);
    }

    #[test]
    fn test_instance_out_of_range() {
        let ds = Dataset::from_libsvm_str(TEXT).unwrap();
        assert!(matches!(
            ds.instance(4),
            Err(CpmError::IndexOutOfRange { index: 4, len: 4, .. })
        ));
    }

    #[test]
    fn test_from_dense() {
        let data = vec![1.0, 0.0, 0.0, 0.0, 2.0, 3.0];
        let ds = Dataset::from_dense(&data, &[1, -1], 3).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.dimensions(), 3);
        assert_eq!(ds.instance(0).unwrap().features.indices(), &[0]);
        assert_eq!(ds.instance(1).unwrap().features.indices(), &[1, 2]);
        assert!(Dataset::from_dense(&data, &[1], 3).is_err());
    }

    #[test]
    fn test_from_csr() {
        let data = vec![1.0, 2.0, 3.0];
        let indices = vec![0, 4, 2];
        let indptr = vec![0, 2, 2, 3];
        let ds = Dataset::from_csr(&data, &indices, &indptr, &[1, -1, 1]).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.dimensions(), 5);
        assert!(ds.instance(1).unwrap().features.is_empty());

        assert!(Dataset::from_csr(&data, &indices, &[0, 2], &[1, -1]).is_err());
        assert!(Dataset::from_csr(&data, &indices, &[0, 3, 2, 3], &[1, -1, 1]).is_err());
    }

    #[test]
    fn test_with_dimensions() {
        let ds = Dataset::from_libsvm_str(TEXT).unwrap();
        assert!(ds.clone().with_dimensions(2).is_err());
        assert_eq!(ds.with_dimensions(10).unwrap().dimensions(), 10);
    }

    #[test]
    fn test_libsvm_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.svm");
        std::fs::write(&path, TEXT).unwrap();

        let ds = Dataset::from_libsvm_file(&path).unwrap();
        let again = Dataset::from_libsvm_str(&ds.to_libsvm()).unwrap();
        assert_eq!(ds.instances(), again.instances());
    }

    #[test]
    fn test_fingerprint() {
        let a = Dataset::from_libsvm_str("1 0:1.0\n-1 1:2.0\n").unwrap();
        let same = Dataset::from_libsvm_str("1 0:1.0\n-1 1:2.0\n").unwrap();
        let other = Dataset::from_libsvm_str("1 0:1.0\n-1 1:2.5\n").unwrap();
        assert_eq!(a.fingerprint(), same.fingerprint());
        assert_ne!(a.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dataset::from_libsvm_file(&dir.path().join("nope.svm")).unwrap_err();
        assert!(matches!(err, CpmError::Io(_)));
    }
}

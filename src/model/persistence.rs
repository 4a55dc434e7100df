//! Binary model files.
//!
//! Layout (bincode, little-endian, fixed field order):
//!
//! ```text
//! header: magic "CPMB", format version
//! body:   D, K, M, hyperparameters, iterations, weight matrix
//!         (stored weights, lazy scales, biases), assignment history
//! ```
//!
//! The lazy scales are stored as-is, so a reloaded model scores every input
//! bit-for-bit like the model that was saved.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::assignment::AssignmentTracker;
use super::machine::{ConvexPolytopeMachine, CpmConfig};
use crate::config::{FORMAT_VERSION, MODEL_MAGIC};
use crate::error::{CpmError, Result};
use crate::linalg::dense_matrix::DenseMatrix;

#[derive(Serialize, Deserialize)]
struct Header {
    magic: [u8; 4],
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct Body {
    dimensions: usize,
    polytopes: usize,
    hyperplanes_per_polytope: usize,
    config: CpmConfig,
    iterations: u64,
    weights: DenseMatrix,
    tracker: AssignmentTracker,
}

impl ConvexPolytopeMachine {
    /// Serialise into a writer.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let header = Header {
            magic: MODEL_MAGIC,
            version: FORMAT_VERSION,
        };
        let config = self.config();
        let body = Body {
            dimensions: config.dimensions,
            polytopes: config.polytopes,
            hyperplanes_per_polytope: config.hyperplanes_per_polytope,
            config: config.clone(),
            iterations: self.iterations(),
            weights: self.weights().clone(),
            tracker: self.tracker().clone(),
        };
        bincode::serialize_into(&mut writer, &header)?;
        bincode::serialize_into(&mut writer, &body)?;
        writer.flush()?;
        Ok(())
    }

    /// Deserialise from a reader. The model comes back `Ready`.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let header: Header = bincode::deserialize_from(&mut reader)?;
        if header.magic != MODEL_MAGIC {
            return Err(CpmError::invalid_parameter("not a polytope machine model file"));
        }
        if header.version != FORMAT_VERSION {
            return Err(CpmError::invalid_parameter(format!(
                "unsupported model format version {} (expected {})",
                header.version, FORMAT_VERSION
            )));
        }

        let body: Body = bincode::deserialize_from(&mut reader)?;
        if (body.dimensions, body.polytopes, body.hyperplanes_per_polytope)
            != (
                body.config.dimensions,
                body.config.polytopes,
                body.config.hyperplanes_per_polytope,
            )
        {
            return Err(CpmError::invalid_parameter(
                "model header disagrees with stored hyperparameters",
            ));
        }
        ConvexPolytopeMachine::from_parts(body.config, body.weights, body.tracker, body.iterations)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(bytes)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))?;
        tracing::info!("Saved model ({} iterations) to {}", self.iterations(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let model = Self::read_from(BufReader::new(file))?;
        tracing::info!(
            "Loaded model (D={}, K={}, M={}) from {}",
            model.dimensions(),
            model.layout().polytopes,
            model.layout().hyperplanes_per_polytope,
            path.display()
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::Dataset;
    use crate::linalg::sparse_vector::SparseVector;
    use crate::model::machine::{Initialization, ModelState};

    fn trained() -> (ConvexPolytopeMachine, Dataset) {
        let ds = Dataset::from_libsvm_str(
            "1 0:0.1 1:0.2\n-1 0:2.0 1:-1.0\n1 0:-0.3\n-1 1:3.0\n1 1:0.05\n-1 0:-2.5 1:0.5\n",
        )
        .unwrap();
        let config = CpmConfig::new(2, 3, 2)
            .with_learning_rate(0.3, 0.1)
            .with_l2(0.01)
            .with_initialization(Initialization::Gaussian { std_dev: 0.2 })
            .with_seed(9);
        let mut model = ConvexPolytopeMachine::new(config).unwrap();
        model.initialize().unwrap();
        for _ in 0..20 {
            model.step_instances(ds.iter()).unwrap();
        }
        (model, ds)
    }

    #[test]
    fn test_save_load_identical_scores() {
        let (model, ds) = trained();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.cpm");
        model.save(&path).unwrap();

        let loaded = ConvexPolytopeMachine::load(&path).unwrap();
        assert_eq!(loaded.state(), ModelState::Ready);
        assert_eq!(loaded.iterations(), model.iterations());
        assert_eq!(loaded.config(), model.config());
        for inst in ds.iter() {
            let a = model.decision(&inst.features).unwrap();
            let b = loaded.decision(&inst.features).unwrap();
            assert_eq!(a.0.to_bits(), b.0.to_bits());
            assert_eq!(a.1, b.1);
        }
        assert_eq!(loaded.tracker(), model.tracker());
    }

    #[test]
    fn test_bytes_roundtrip_keeps_training() {
        let (model, ds) = trained();
        let mut loaded = ConvexPolytopeMachine::from_bytes(&model.to_bytes().unwrap()).unwrap();
        let mut original = model.clone();
        original.step_instances(ds.iter()).unwrap();
        loaded.step_instances(ds.iter()).unwrap();
        assert_eq!(original.weights(), loaded.weights());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let (model, _) = trained();
        let mut bytes = model.to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            ConvexPolytopeMachine::from_bytes(&bytes),
            Err(CpmError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated() {
        let (model, _) = trained();
        let bytes = model.to_bytes().unwrap();
        assert!(matches!(
            ConvexPolytopeMachine::from_bytes(&bytes[..bytes.len() / 2]),
            Err(CpmError::Serialization(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ConvexPolytopeMachine::load(&dir.path().join("absent.cpm")),
            Err(CpmError::Io(_))
        ));
    }

    /// Field-for-field stand-ins for the on-disk body, so tests can write
    /// files the model itself would never produce.
    #[derive(Serialize)]
    struct ForgedMatrix {
        weights: ndarray::Array2<f64>,
        scales: ndarray::Array1<f64>,
        biases: ndarray::Array1<f64>,
        bias_term: f64,
    }

    #[derive(Serialize)]
    struct ForgedTracker {
        assignments: Vec<Option<usize>>,
        occupancy: Vec<usize>,
        distinct: usize,
        min_entropy: f64,
    }

    #[derive(Serialize)]
    struct ForgedBody {
        dimensions: usize,
        polytopes: usize,
        hyperplanes_per_polytope: usize,
        config: CpmConfig,
        iterations: u64,
        weights: ForgedMatrix,
        tracker: ForgedTracker,
    }

    fn forge(scales: Vec<f64>, tracker: ForgedTracker) -> Vec<u8> {
        let config = CpmConfig::new(2, 2, 1);
        let body = ForgedBody {
            dimensions: 2,
            polytopes: 2,
            hyperplanes_per_polytope: 1,
            config,
            iterations: 0,
            weights: ForgedMatrix {
                weights: ndarray::Array2::zeros((2, 2)),
                scales: ndarray::Array1::from_vec(scales),
                biases: ndarray::Array1::zeros(2),
                bias_term: 1.0,
            },
            tracker,
        };
        let header = Header {
            magic: MODEL_MAGIC,
            version: FORMAT_VERSION,
        };
        let mut bytes = bincode::serialize(&header).unwrap();
        bytes.extend(bincode::serialize(&body).unwrap());
        bytes
    }

    fn empty_tracker() -> ForgedTracker {
        ForgedTracker {
            assignments: Vec::new(),
            occupancy: vec![0, 0],
            distinct: 0,
            min_entropy: 0.0,
        }
    }

    #[test]
    fn test_forged_body_matches_real_layout() {
        let bytes = forge(vec![1.0, 1.0], empty_tracker());
        let model = ConvexPolytopeMachine::from_bytes(&bytes).unwrap();
        let x = SparseVector::from_pairs(vec![(1, 1.0)]).unwrap();
        assert_eq!(model.predict(&x).unwrap(), 1);
    }

    #[test]
    fn test_rejects_short_scales() {
        let bytes = forge(vec![1.0], empty_tracker());
        assert!(matches!(
            ConvexPolytopeMachine::from_bytes(&bytes),
            Err(CpmError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_scale() {
        let bytes = forge(vec![1.0, 0.0], empty_tracker());
        assert!(matches!(
            ConvexPolytopeMachine::from_bytes(&bytes),
            Err(CpmError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_rejects_inconsistent_assignments() {
        let out_of_range = ForgedTracker {
            assignments: vec![Some(5)],
            occupancy: vec![1, 0],
            distinct: 1,
            min_entropy: 0.0,
        };
        assert!(matches!(
            ConvexPolytopeMachine::from_bytes(&forge(vec![1.0, 1.0], out_of_range)),
            Err(CpmError::InvalidParameter { .. })
        ));

        let miscounted = ForgedTracker {
            assignments: vec![Some(1), None],
            occupancy: vec![1, 0],
            distinct: 1,
            min_entropy: 0.0,
        };
        assert!(matches!(
            ConvexPolytopeMachine::from_bytes(&forge(vec![1.0, 1.0], miscounted)),
            Err(CpmError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_load_wider_input_is_rejected() {
        let (model, _) = trained();
        let loaded = ConvexPolytopeMachine::from_bytes(&model.to_bytes().unwrap()).unwrap();
        let x = SparseVector::from_pairs(vec![(4, 1.0)]).unwrap();
        assert!(matches!(
            loaded.predict(&x),
            Err(CpmError::DimensionMismatch { expected: 2, actual: 5 })
        ));
    }
}

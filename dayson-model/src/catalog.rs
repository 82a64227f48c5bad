use dayson_core::{CoreError, Result, Tensor};
use dayson_engine::MathEngine;
use dayson_store::TensorStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Gate order used throughout: forget, input, candidate, output.
pub const GATE_KEYS: [&str; 4] = ["f", "i", "c", "o"];

pub const HIDDEN_STATE: &str = "hidden_state";
pub const CELL_STATE: &str = "cell_state";

#[derive(Debug, Clone, Copy)]
pub struct LstmConfig {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    /// Per-element gradient clip applied before the global norm clip.
    pub grad_element_clip: f32,
    /// Global gradient norm ceiling.
    pub grad_max_norm: f32,
}

impl LstmConfig {
    pub fn new(
        vocab_size: usize,
        embedding_size: usize,
        hidden_size: usize,
        output_size: usize,
    ) -> Self {
        Self {
            vocab_size,
            embedding_size,
            hidden_size,
            output_size,
            grad_element_clip: 0.005,
            grad_max_norm: 30.0,
        }
    }
}

/// The 15 trainable parameters, in update order.
pub fn primary_parameter_names() -> Vec<String> {
    let mut names = vec!["embedding".to_string()];
    for g in GATE_KEYS {
        names.push(format!("w_x_{g}"));
        names.push(format!("w_h_{g}"));
        names.push(format!("b_{g}"));
    }
    names.push("w_hy".to_string());
    names.push("b_y".to_string());
    names
}

/// The 8 frozen layer-norm parameters.
pub fn layer_norm_parameter_names() -> Vec<String> {
    let mut names = Vec::with_capacity(8);
    for g in GATE_KEYS {
        names.push(format!("gamma_{g}"));
        names.push(format!("beta_{g}"));
    }
    names
}

/// Every catalog entry: trainable parameters, layer-norm affines, and the
/// carried model state.
pub fn all_parameter_names() -> Vec<String> {
    let mut names = primary_parameter_names();
    names.extend(layer_norm_parameter_names());
    names.push(HIDDEN_STATE.to_string());
    names.push(CELL_STATE.to_string());
    names
}

fn parameter_shape(config: &LstmConfig, name: &str) -> Vec<usize> {
    let (v, e, h, o) = (
        config.vocab_size,
        config.embedding_size,
        config.hidden_size,
        config.output_size,
    );
    match name {
        "embedding" => vec![v, e],
        "w_hy" => vec![h, o],
        "b_y" => vec![o],
        HIDDEN_STATE | CELL_STATE => vec![1, h],
        _ if name.starts_with("w_x_") => vec![e, h],
        _ if name.starts_with("w_h_") => vec![h, h],
        _ => vec![h], // b_*, gamma_*, beta_*
    }
}

/// Black-box weight initializer: seeded uniform scaled by fan-in.
pub fn init_matrix(rows: usize, cols: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scale = (1.0 / rows.max(1) as f32).sqrt();
    (0..rows * cols)
        .map(|_| rng.gen_range(-scale..=scale))
        .collect()
}

/// JSON envelope written once per epoch. Tensor values are not embedded;
/// only the weight-name to id mapping is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub vocab_size: usize,
    pub embedding_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub session_id: String,
    pub tensor_ids: BTreeMap<String, String>,
}

impl ModelCatalog {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::InvalidArgument(format!("catalog serialization: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| CoreError::CorruptData(format!("catalog {}: {e}", path.display())))
    }
}

/// The in-memory model: configuration plus the weight-name to TensorId
/// mapping. All tensor data stays in the TensorStore.
pub struct LstmModel {
    pub config: LstmConfig,
    pub session_id: String,
    tensor_ids: BTreeMap<String, String>,
}

/// Device-resident weights for one gate.
pub struct GateWeights {
    pub w_x: Tensor,
    pub w_h: Tensor,
    pub b: Tensor,
    pub gamma: Tensor,
    pub beta: Tensor,
}

/// The full weight bundle loaded into engine memory for the span of an
/// epoch. Dropping it releases every device buffer.
pub struct LstmWeights {
    pub embedding: Tensor,
    pub gates: [GateWeights; 4],
    pub w_hy: Tensor,
    pub b_y: Tensor,
}

impl LstmWeights {
    /// Mutable access to a trainable parameter by catalog name.
    pub fn param_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        let tensor = match name {
            "embedding" => &mut self.embedding,
            "w_hy" => &mut self.w_hy,
            "b_y" => &mut self.b_y,
            _ => {
                let (kind, gate) = name
                    .rsplit_once('_')
                    .ok_or_else(|| CoreError::NotFound(format!("parameter {name}")))?;
                let idx = GATE_KEYS
                    .iter()
                    .position(|g| *g == gate)
                    .ok_or_else(|| CoreError::NotFound(format!("parameter {name}")))?;
                let gw = &mut self.gates[idx];
                match kind {
                    "w_x" => &mut gw.w_x,
                    "w_h" => &mut gw.w_h,
                    "b" => &mut gw.b,
                    _ => return Err(CoreError::NotFound(format!("parameter {name}"))),
                }
            }
        };
        Ok(tensor)
    }
}

impl LstmModel {
    /// Creates every catalog tensor in the TensorStore: seeded-uniform
    /// weight matrices, zero biases and state, unit-gamma/zero-beta layer
    /// norms.
    pub fn initialize(
        engine: &dyn MathEngine,
        store: &TensorStore,
        config: LstmConfig,
        seed: u64,
    ) -> Result<Self> {
        if config.vocab_size == 0
            || config.embedding_size == 0
            || config.hidden_size == 0
            || config.output_size == 0
        {
            return Err(CoreError::InvalidArgument(format!(
                "degenerate model dimensions {config:?}"
            )));
        }
        let mut tensor_ids = BTreeMap::new();
        for (i, name) in all_parameter_names().into_iter().enumerate() {
            let shape = parameter_shape(&config, &name);
            let tensor = if name.starts_with("w_") || name == "embedding" {
                let (rows, cols) = (shape[0], shape[1]);
                let data = init_matrix(rows, cols, seed.wrapping_add(i as u64));
                engine.create_from(&data, &shape)?
            } else if name.starts_with("gamma_") {
                let count: usize = shape.iter().product();
                engine.create_from(&vec![1.0; count], &shape)?
            } else {
                engine.create(&shape)?
            };
            let id = store.store(engine, &tensor, &name)?;
            tensor_ids.insert(name, id);
        }
        Ok(Self {
            config,
            session_id: store.session().to_string(),
            tensor_ids,
        })
    }

    /// Rebuilds the in-memory catalog from a saved envelope, verifying that
    /// every weight is still registered with the expected shape.
    pub fn from_catalog(catalog: ModelCatalog, store: &TensorStore) -> Result<Self> {
        let config = LstmConfig::new(
            catalog.vocab_size,
            catalog.embedding_size,
            catalog.hidden_size,
            catalog.output_size,
        );
        for name in all_parameter_names() {
            let id = catalog
                .tensor_ids
                .get(&name)
                .ok_or_else(|| CoreError::CorruptData(format!("catalog is missing {name}")))?;
            let shape = store.shape_of(id)?;
            let expected = parameter_shape(&config, &name);
            if shape != expected {
                return Err(CoreError::CorruptData(format!(
                    "{name} ({id}) has shape {shape:?}, expected {expected:?}"
                )));
            }
        }
        Ok(Self {
            config,
            session_id: catalog.session_id,
            tensor_ids: catalog.tensor_ids,
        })
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog {
            vocab_size: self.config.vocab_size,
            embedding_size: self.config.embedding_size,
            hidden_size: self.config.hidden_size,
            output_size: self.config.output_size,
            session_id: self.session_id.clone(),
            tensor_ids: self.tensor_ids.clone(),
        }
    }

    pub fn id(&self, name: &str) -> Result<&str> {
        self.tensor_ids
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| CoreError::NotFound(format!("parameter {name}")))
    }

    /// `(name, shape)` for each trainable parameter; the shapes the
    /// gradient accumulators take.
    pub fn primary_shapes(&self) -> Vec<(String, Vec<usize>)> {
        primary_parameter_names()
            .into_iter()
            .map(|name| {
                let shape = parameter_shape(&self.config, &name);
                (name, shape)
            })
            .collect()
    }

    /// Loads the full weight bundle into engine memory. Exactly one load
    /// per epoch; the bundle is dropped when the epoch scope closes.
    pub fn load_weights(
        &self,
        engine: &dyn MathEngine,
        store: &TensorStore,
    ) -> Result<LstmWeights> {
        let mut gates = Vec::with_capacity(4);
        for g in GATE_KEYS {
            gates.push(GateWeights {
                w_x: store.load(engine, self.id(&format!("w_x_{g}"))?)?,
                w_h: store.load(engine, self.id(&format!("w_h_{g}"))?)?,
                b: store.load(engine, self.id(&format!("b_{g}"))?)?,
                gamma: store.load(engine, self.id(&format!("gamma_{g}"))?)?,
                beta: store.load(engine, self.id(&format!("beta_{g}"))?)?,
            });
        }
        let gates: [GateWeights; 4] = gates
            .try_into()
            .map_err(|_| CoreError::InvalidArgument("gate bundle construction".to_string()))?;
        Ok(LstmWeights {
            embedding: store.load(engine, self.id("embedding")?)?,
            gates,
            w_hy: store.load(engine, self.id("w_hy")?)?,
            b_y: store.load(engine, self.id("b_y")?)?,
        })
    }

    /// Zeroes the carried hidden and cell state on disk.
    pub fn reset_state(&self, engine: &dyn MathEngine, store: &TensorStore) -> Result<()> {
        let zeros = engine.create(&[1, self.config.hidden_size])?;
        store.overwrite(engine, self.id(HIDDEN_STATE)?, &zeros)?;
        let zeros = engine.create(&[1, self.config.hidden_size])?;
        store.overwrite(engine, self.id(CELL_STATE)?, &zeros)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayson_engine::HostMathEngine;
    use tempfile::tempdir;

    fn small_config() -> LstmConfig {
        LstmConfig::new(12, 6, 8, 12)
    }

    #[test]
    fn test_parameter_name_counts() {
        assert_eq!(primary_parameter_names().len(), 15);
        assert_eq!(layer_norm_parameter_names().len(), 8);
        assert_eq!(all_parameter_names().len(), 25);
    }

    #[test]
    fn test_initialize_registers_every_tensor() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let model =
            LstmModel::initialize(&engine, &store, small_config(), 7).unwrap();

        assert_eq!(store.registered_ids().len(), 25);
        assert_eq!(store.shape_of(model.id("embedding").unwrap()).unwrap(), vec![12, 6]);
        assert_eq!(store.shape_of(model.id("w_h_f").unwrap()).unwrap(), vec![8, 8]);
        assert_eq!(store.shape_of(model.id("w_x_o").unwrap()).unwrap(), vec![6, 8]);
        assert_eq!(store.shape_of(model.id("b_c").unwrap()).unwrap(), vec![8]);
        assert_eq!(store.shape_of(model.id("w_hy").unwrap()).unwrap(), vec![8, 12]);
        assert_eq!(store.shape_of(model.id("hidden_state").unwrap()).unwrap(), vec![1, 8]);

        // gamma starts at one, beta at zero
        let gamma = store.load(&engine, model.id("gamma_i").unwrap()).unwrap();
        assert!(engine.read_back(&gamma).unwrap().iter().all(|&v| v == 1.0));
        let beta = store.load(&engine, model.id("beta_i").unwrap()).unwrap();
        assert!(engine.read_back(&beta).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_init_matrix_is_deterministic() {
        let a = init_matrix(4, 5, 99);
        let b = init_matrix(4, 5, 99);
        let c = init_matrix(4, 5, 100);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let scale = (1.0f32 / 4.0).sqrt();
        assert!(a.iter().all(|v| v.abs() <= scale));
    }

    #[test]
    fn test_catalog_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let model = LstmModel::initialize(&engine, &store, small_config(), 7).unwrap();

        let path = dir.path().join("model_epoch_0.json");
        model.catalog().save(&path).unwrap();
        let loaded = ModelCatalog::load(&path).unwrap();
        assert_eq!(loaded.session_id, "sess");
        assert_eq!(loaded.vocab_size, 12);
        assert_eq!(loaded.tensor_ids.len(), 25);

        let reloaded = LstmModel::from_catalog(loaded, &store).unwrap();
        assert_eq!(
            reloaded.id("embedding").unwrap(),
            model.id("embedding").unwrap()
        );
    }

    #[test]
    fn test_from_catalog_rejects_missing_weight() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let model = LstmModel::initialize(&engine, &store, small_config(), 7).unwrap();
        let mut catalog = model.catalog();
        catalog.tensor_ids.remove("w_hy");
        assert!(matches!(
            LstmModel::from_catalog(catalog, &store),
            Err(CoreError::CorruptData(_))
        ));
    }

    #[test]
    fn test_weight_bundle_param_access() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let model = LstmModel::initialize(&engine, &store, small_config(), 7).unwrap();
        let mut weights = model.load_weights(&engine, &store).unwrap();
        for name in primary_parameter_names() {
            assert!(weights.param_mut(&name).is_ok(), "missing {name}");
        }
        assert!(weights.param_mut("gamma_f").is_err());
        assert!(weights.param_mut("nonsense").is_err());
    }

    #[test]
    fn test_reset_state() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let model = LstmModel::initialize(&engine, &store, small_config(), 7).unwrap();
        let ones = engine.create_from(&vec![1.0; 8], &[1, 8]).unwrap();
        store
            .overwrite(&engine, model.id(HIDDEN_STATE).unwrap(), &ones)
            .unwrap();
        model.reset_state(&engine, &store).unwrap();
        let h = store.load(&engine, model.id(HIDDEN_STATE).unwrap()).unwrap();
        assert!(engine.read_back(&h).unwrap().iter().all(|&v| v == 0.0));
    }
}

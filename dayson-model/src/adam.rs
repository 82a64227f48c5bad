use dayson_core::{Result, Tensor};
use dayson_engine::MathEngine;
use dayson_store::TensorStore;
use std::collections::HashMap;

struct MomentState {
    m_id: String,
    v_id: String,
    t: i32,
}

/// Adam with disk-resident momentum: per parameter, `m` and `v` live as
/// TensorStore records and are loaded into engine memory only for the span
/// of one update.
pub struct AdamOptimizer {
    beta1: f32,
    beta2: f32,
    eps: f32,
    state: HashMap<String, MomentState>,
}

impl AdamOptimizer {
    pub fn new() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            state: HashMap::new(),
        }
    }

    /// Applies one fused Adam step to `param` (mutated in place so the
    /// epoch's weight bundle stays current) and writes `param`, `m` and `v`
    /// back to the store. Moment records are created zero-filled on the
    /// first update of a parameter.
    pub fn update(
        &mut self,
        engine: &dyn MathEngine,
        store: &TensorStore,
        param_id: &str,
        param: &mut Tensor,
        grad_id: &str,
        lr: f32,
    ) -> Result<()> {
        if !self.state.contains_key(param_id) {
            let zeros = engine.create(param.shape())?;
            let m_id = store.store(engine, &zeros, "adam_m")?;
            let zeros = engine.create(param.shape())?;
            let v_id = store.store(engine, &zeros, "adam_v")?;
            self.state
                .insert(param_id.to_string(), MomentState { m_id, v_id, t: 0 });
        }
        let entry = self
            .state
            .get_mut(param_id)
            .expect("state entry inserted above");
        entry.t += 1;
        let t = entry.t;
        let m_id = entry.m_id.clone();
        let v_id = entry.v_id.clone();

        let grad = store.load(engine, grad_id)?;
        let mut m = store.load(engine, &m_id)?;
        let mut v = store.load(engine, &v_id)?;
        engine.adam_update(
            param, &grad, &mut m, &mut v, lr, self.beta1, self.beta2, self.eps, t,
        )?;
        store.overwrite(engine, &m_id, &m)?;
        store.overwrite(engine, &v_id, &v)?;
        store.overwrite(engine, param_id, param)?;
        Ok(())
    }

    pub fn timestep(&self, param_id: &str) -> Option<i32> {
        self.state.get(param_id).map(|s| s.t)
    }

    pub fn moment_ids(&self, param_id: &str) -> Option<(String, String)> {
        self.state
            .get(param_id)
            .map(|s| (s.m_id.clone(), s.v_id.clone()))
    }

    /// Deletes every momentum record and clears the map.
    pub fn reset(&mut self, store: &TensorStore) {
        for state in self.state.values() {
            store.delete(&state.m_id);
            store.delete(&state.v_id);
        }
        self.state.clear();
    }
}

impl Default for AdamOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayson_engine::HostMathEngine;
    use tempfile::tempdir;

    #[test]
    fn test_update_creates_state_lazily_and_steps_param() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let mut adam = AdamOptimizer::new();

        let p0 = engine.create_from(&[1.0], &[1]).unwrap();
        let param_id = store.store(&engine, &p0, "p").unwrap();
        let g = engine.create_from(&[0.1], &[1]).unwrap();
        let grad_id = store.store(&engine, &g, "grad_p").unwrap();

        assert!(adam.timestep(&param_id).is_none());
        let mut param = store.load(&engine, &param_id).unwrap();
        adam.update(&engine, &store, &param_id, &mut param, &grad_id, 0.01)
            .unwrap();

        assert_eq!(adam.timestep(&param_id), Some(1));
        let in_memory = engine.read_back(&param).unwrap()[0];
        assert!((in_memory - 0.99).abs() < 1e-4);
        // the store copy was refreshed too
        let on_disk = store.load(&engine, &param_id).unwrap();
        assert!((engine.read_back(&on_disk).unwrap()[0] - 0.99).abs() < 1e-4);

        let (m_id, v_id) = adam.moment_ids(&param_id).unwrap();
        let m = store.load(&engine, &m_id).unwrap();
        assert!((engine.read_back(&m).unwrap()[0] - 0.01).abs() < 1e-7);
        let v = store.load(&engine, &v_id).unwrap();
        assert!((engine.read_back(&v).unwrap()[0] - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn test_timestep_is_per_parameter() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let mut adam = AdamOptimizer::new();

        let mut ids = Vec::new();
        for name in ["a", "b"] {
            let p = engine.create_from(&[0.0, 0.0], &[2]).unwrap();
            let pid = store.store(&engine, &p, name).unwrap();
            let g = engine.create_from(&[0.5, -0.5], &[2]).unwrap();
            let gid = store.store(&engine, &g, "grad").unwrap();
            ids.push((pid, gid));
        }
        for _ in 0..3 {
            let (pid, gid) = &ids[0];
            let mut p = store.load(&engine, pid).unwrap();
            adam.update(&engine, &store, pid, &mut p, gid, 0.001).unwrap();
        }
        let (pid, gid) = &ids[1];
        let mut p = store.load(&engine, pid).unwrap();
        adam.update(&engine, &store, pid, &mut p, gid, 0.001).unwrap();

        assert_eq!(adam.timestep(&ids[0].0), Some(3));
        assert_eq!(adam.timestep(&ids[1].0), Some(1));
    }

    #[test]
    fn test_reset_deletes_moment_records() {
        let dir = tempdir().unwrap();
        let engine = HostMathEngine::new();
        let store = TensorStore::open(dir.path(), "sess").unwrap();
        let mut adam = AdamOptimizer::new();

        let p0 = engine.create_from(&[1.0], &[1]).unwrap();
        let param_id = store.store(&engine, &p0, "p").unwrap();
        let g = engine.create_from(&[0.1], &[1]).unwrap();
        let grad_id = store.store(&engine, &g, "grad_p").unwrap();
        let mut param = store.load(&engine, &param_id).unwrap();
        adam.update(&engine, &store, &param_id, &mut param, &grad_id, 0.01)
            .unwrap();

        let (m_id, v_id) = adam.moment_ids(&param_id).unwrap();
        adam.reset(&store);
        assert!(!store.contains(&m_id));
        assert!(!store.contains(&v_id));
        assert!(adam.timestep(&param_id).is_none());
        // the parameter itself is untouched
        assert!(store.contains(&param_id));
    }
}

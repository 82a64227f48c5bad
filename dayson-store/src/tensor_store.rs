use dayson_core::{
    allocate_tensor_id, read_record, record_header_len, write_record, CoreError, Result, Tensor,
};
use dayson_engine::MathEngine;
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Persistent, id-keyed store of tensors: one record file per tensor under
/// `<root>/TensorCache/<session>/`, with an in-memory authoritative index
/// from id to shape.
///
/// The index map sits under a reader/writer lock; read-modify-write on a
/// single tensor is serialized by a per-id mutex.
pub struct TensorStore {
    dir: PathBuf,
    session: String,
    index: RwLock<HashMap<String, Vec<usize>>>,
    update_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TensorStore {
    /// Opens (or creates) the session directory. Records already present
    /// from an earlier process are re-registered from their headers.
    pub fn open(root: &Path, session: &str) -> Result<Self> {
        let dir = root.join("TensorCache").join(session);
        fs::create_dir_all(&dir)?;
        let mut index = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let mut file = File::open(&path)?;
            match read_record(&mut file) {
                Ok((shape, _)) => {
                    index.insert(id.to_string(), shape);
                }
                Err(e) => {
                    warn!("skipping unreadable record {}: {e}", path.display());
                }
            }
        }
        Ok(Self {
            dir,
            session: session.to_string(),
            index: RwLock::new(index),
            update_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.bin"))
    }

    fn update_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.update_locks.lock().expect("update lock map poisoned");
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn indexed_shape(&self, id: &str) -> Result<Vec<usize>> {
        self.index
            .read()
            .expect("tensor index poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("tensor {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index
            .read()
            .expect("tensor index poisoned")
            .contains_key(id)
    }

    pub fn shape_of(&self, id: &str) -> Result<Vec<usize>> {
        self.indexed_shape(id)
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.index
            .read()
            .expect("tensor index poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Writes a new record with create-new semantics and registers it. The
    /// orphan file is removed if the write fails partway.
    pub fn store(&self, engine: &dyn MathEngine, tensor: &Tensor, name: &str) -> Result<String> {
        let shape = tensor.shape().to_vec();
        let data = engine.read_back(tensor)?;
        let id = allocate_tensor_id(name);
        let path = self.file_path(&id);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        if let Err(e) = write_record(&mut file, &shape, &data) {
            drop(file);
            if let Err(rm) = fs::remove_file(&path) {
                warn!("orphan record {id} not removed: {rm}");
            }
            return Err(e);
        }
        self.index
            .write()
            .expect("tensor index poisoned")
            .insert(id.clone(), shape);
        Ok(id)
    }

    /// Materializes the record through the engine. A file missing or
    /// disagreeing with the index is corruption, not absence: the index is
    /// authoritative.
    pub fn load(&self, engine: &dyn MathEngine, id: &str) -> Result<Tensor> {
        let shape = self.indexed_shape(id)?;
        let mut file = File::open(self.file_path(id)).map_err(|e| {
            CoreError::CorruptData(format!("tensor {id} is indexed but unreadable: {e}"))
        })?;
        let (file_shape, data) = read_record(&mut file)?;
        if file_shape != shape {
            return Err(CoreError::CorruptData(format!(
                "tensor {id}: file shape {file_shape:?} != indexed {shape:?}"
            )));
        }
        engine.create_from(&data, &shape)
    }

    /// Truncates and rewrites the record with a fresh full header, updating
    /// the indexed shape.
    pub fn overwrite(&self, engine: &dyn MathEngine, id: &str, tensor: &Tensor) -> Result<()> {
        let lock = self.update_lock(id);
        let _guard = lock.lock().expect("per-id update lock poisoned");
        if !self.contains(id) {
            return Err(CoreError::NotFound(format!("tensor {id}")));
        }
        let shape = tensor.shape().to_vec();
        let data = engine.read_back(tensor)?;
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.file_path(id))?;
        write_record(&mut file, &shape, &data)?;
        file.flush()?;
        self.index
            .write()
            .expect("tensor index poisoned")
            .insert(id.to_string(), shape);
        Ok(())
    }

    /// In-place row update on a rank-2 record.
    pub fn set_row(
        &self,
        engine: &dyn MathEngine,
        id: &str,
        row: usize,
        source: &Tensor,
    ) -> Result<()> {
        let lock = self.update_lock(id);
        let _guard = lock.lock().expect("per-id update lock poisoned");
        let shape = self.indexed_shape(id)?;
        let [rows, cols] = shape[..] else {
            return Err(CoreError::InvalidArgument(format!(
                "set_row on tensor {id} of shape {shape:?}"
            )));
        };
        if row >= rows {
            return Err(CoreError::InvalidArgument(format!(
                "set_row: row {row} of {rows} in tensor {id}"
            )));
        }
        if source.len() != cols {
            return Err(CoreError::InvalidArgument(format!(
                "set_row: source of {} elements against {cols} columns",
                source.len()
            )));
        }
        let data = engine.read_back(source)?;
        let mut file = OpenOptions::new().write(true).open(self.file_path(id))?;
        file.seek(SeekFrom::Start(
            record_header_len(2) + (row * cols * 4) as u64,
        ))?;
        let mut bytes = Vec::with_capacity(cols * 4);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    /// Removes the id from the index and best-effort deletes the file; a
    /// file held open elsewhere is left behind silently.
    pub fn delete(&self, id: &str) {
        self.index
            .write()
            .expect("tensor index poisoned")
            .remove(id);
        self.update_locks
            .lock()
            .expect("update lock map poisoned")
            .remove(id);
        if let Err(e) = fs::remove_file(self.file_path(id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("record file for {id} not removed: {e}");
            }
        }
    }

    /// File-level copy under a fresh id.
    pub fn clone_tensor(&self, source_id: &str, new_name: &str) -> Result<String> {
        let shape = self.indexed_shape(source_id)?;
        let id = allocate_tensor_id(new_name);
        fs::copy(self.file_path(source_id), self.file_path(&id))?;
        self.index
            .write()
            .expect("tensor index poisoned")
            .insert(id.clone(), shape);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayson_engine::HostMathEngine;
    use tempfile::tempdir;

    fn engine() -> HostMathEngine {
        HostMathEngine::new()
    }

    fn tensor_from(e: &HostMathEngine, shape: &[usize], data: &[f32]) -> Tensor {
        e.create_from(data, shape).unwrap()
    }

    #[test]
    fn test_store_load_roundtrip_bitwise() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let data = vec![1.0f32, -2.5, 3.25e-12, 0.0, 1e30, -0.0];
        let t = tensor_from(&e, &[2, 3], &data);
        let id = store.store(&e, &t, "w_hy").unwrap();
        let loaded = store.load(&e, &id).unwrap();
        assert_eq!(loaded.shape(), &[2, 3]);
        let out = e.read_back(&loaded).unwrap();
        for (a, b) in data.iter().zip(out.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_index_and_header_agree_after_reopen() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[4, 2], &[0.5; 8]);
        let id = store.store(&e, &t, "embedding").unwrap();
        drop(store);

        let store = TensorStore::open(dir.path(), "s1").unwrap();
        assert_eq!(store.shape_of(&id).unwrap(), vec![4, 2]);
        let loaded = store.load(&e, &id).unwrap();
        assert_eq!(loaded.shape(), &[4, 2]);
    }

    #[test]
    fn test_load_unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        assert!(matches!(
            store.load(&e, "missing_00000000_feed"),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_indexed_but_missing_file_is_corruption() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[2], &[1.0, 2.0]);
        let id = store.store(&e, &t, "state").unwrap();
        fs::remove_file(store.dir().join(format!("{id}.bin"))).unwrap();
        assert!(matches!(
            store.load(&e, &id),
            Err(CoreError::CorruptData(_))
        ));
    }

    #[test]
    fn test_corrupt_header_detected() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let id = store.store(&e, &t, "w").unwrap();
        // stamp a different dimension into the header
        let path = store.dir().join(format!("{id}.bin"));
        let mut raw = fs::read(&path).unwrap();
        raw[4..8].copy_from_slice(&3i32.to_le_bytes());
        fs::write(&path, &raw).unwrap();
        assert!(matches!(
            store.load(&e, &id),
            Err(CoreError::CorruptData(_))
        ));
    }

    #[test]
    fn test_overwrite() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[3], &[1.0, 2.0, 3.0]);
        let id = store.store(&e, &t, "bias").unwrap();
        let t2 = tensor_from(&e, &[3], &[9.0, 8.0, 7.0]);
        store.overwrite(&e, &id, &t2).unwrap();
        assert_eq!(
            e.read_back(&store.load(&e, &id).unwrap()).unwrap(),
            vec![9.0, 8.0, 7.0]
        );

        let t3 = tensor_from(&e, &[1, 3], &[5.0, 5.0, 5.0]);
        store.overwrite(&e, &id, &t3).unwrap();
        assert_eq!(store.shape_of(&id).unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_overwrite_unknown_id() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[1], &[1.0]);
        assert!(matches!(
            store.overwrite(&e, "nope", &t),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_row() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let id = store.store(&e, &t, "table").unwrap();
        let row = tensor_from(&e, &[1, 2], &[-1.0, -2.0]);
        store.set_row(&e, &id, 1, &row).unwrap();
        assert_eq!(
            e.read_back(&store.load(&e, &id).unwrap()).unwrap(),
            vec![1.0, 2.0, -1.0, -2.0, 5.0, 6.0]
        );

        let vec1 = tensor_from(&e, &[4], &[0.0; 4]);
        let vid = store.store(&e, &vec1, "vec").unwrap();
        assert!(store.set_row(&e, &vid, 0, &row).is_err());
        assert!(store.set_row(&e, &id, 3, &row).is_err());
    }

    #[test]
    fn test_delete_is_silent() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[1], &[1.0]);
        let id = store.store(&e, &t, "gone").unwrap();
        store.delete(&id);
        assert!(!store.contains(&id));
        store.delete(&id); // second delete is a no-op
        assert!(matches!(store.load(&e, &id), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_clone_tensor() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let t = tensor_from(&e, &[2], &[6.0, 7.0]);
        let id = store.store(&e, &t, "m").unwrap();
        let copy = store.clone_tensor(&id, "m_copy").unwrap();
        assert_ne!(id, copy);
        assert_eq!(
            e.read_back(&store.load(&e, &copy).unwrap()).unwrap(),
            vec![6.0, 7.0]
        );
        // the copy is independent
        let t2 = tensor_from(&e, &[2], &[0.0, 0.0]);
        store.overwrite(&e, &id, &t2).unwrap();
        assert_eq!(
            e.read_back(&store.load(&e, &copy).unwrap()).unwrap(),
            vec![6.0, 7.0]
        );
    }

    #[test]
    fn test_registered_ids() {
        let dir = tempdir().unwrap();
        let e = engine();
        let store = TensorStore::open(dir.path(), "s1").unwrap();
        let a = store.store(&e, &tensor_from(&e, &[1], &[1.0]), "a").unwrap();
        let b = store.store(&e, &tensor_from(&e, &[1], &[2.0]), "b").unwrap();
        let mut ids = store.registered_ids();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}

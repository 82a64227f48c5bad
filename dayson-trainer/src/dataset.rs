use dayson_core::{CoreError, Result};
use dayson_store::BlockStore;
use log::info;
use std::path::Path;

/// One-pass sharder: cuts the corpus index sequence into fixed-context
/// `(input, target)` windows (targets shifted by one), packs them into
/// batches, and appends each batch as a checksummed block. Only the offset
/// lists stay in memory; the corpus itself can be released after
/// `initialize`.
pub struct DatasetShardService {
    blocks: BlockStore,
    train_offsets: Vec<u64>,
    validation_offsets: Vec<u64>,
}

impl DatasetShardService {
    pub fn create(path: &Path) -> Result<Self> {
        let blocks = BlockStore::open(path)?;
        blocks.clear()?;
        Ok(Self {
            blocks,
            train_offsets: Vec::new(),
            validation_offsets: Vec::new(),
        })
    }

    /// Shards `corpus` with non-overlapping windows of `context` tokens.
    /// Short tails are padded with `pad`. Offsets are split train/validation
    /// at `(1 - val_split) * total`.
    pub fn initialize(
        &mut self,
        corpus: &[i32],
        context: usize,
        vocab_size: usize,
        pad: i32,
        batch: usize,
        val_split: f32,
    ) -> Result<()> {
        if context < 2 {
            return Err(CoreError::InvalidArgument(format!(
                "context {context} must be at least 2"
            )));
        }
        if batch == 0 {
            return Err(CoreError::InvalidArgument("batch size 0".to_string()));
        }
        if !(0.0..1.0).contains(&val_split) {
            return Err(CoreError::InvalidArgument(format!(
                "validation split {val_split} outside [0, 1)"
            )));
        }
        if corpus.len() < 2 {
            return Err(CoreError::InvalidArgument(format!(
                "corpus of {} tokens is too short to window",
                corpus.len()
            )));
        }
        if pad < 0 || pad as usize >= vocab_size {
            return Err(CoreError::InvalidArgument(format!(
                "pad token {pad} outside vocabulary of {vocab_size}"
            )));
        }
        for (i, &token) in corpus.iter().enumerate() {
            if token < 0 || token as usize >= vocab_size {
                return Err(CoreError::InvalidArgument(format!(
                    "corpus token {token} at {i} outside vocabulary of {vocab_size}"
                )));
            }
        }

        self.blocks.clear()?;
        let mut offsets = Vec::new();
        let mut pack: Vec<(Vec<i32>, Vec<i32>)> = Vec::with_capacity(batch);
        let window = context - 1;
        let mut start = 0usize;
        while start + 1 < corpus.len() {
            let end = (start + context).min(corpus.len());
            let mut input: Vec<i32> = corpus[start..end - 1].to_vec();
            let mut target: Vec<i32> = corpus[start + 1..end].to_vec();
            input.resize(window, pad);
            target.resize(window, pad);
            pack.push((input, target));
            if pack.len() == batch {
                offsets.push(self.blocks.store(&encode_batch(&pack))?);
                pack.clear();
            }
            start += context;
        }
        if !pack.is_empty() {
            offsets.push(self.blocks.store(&encode_batch(&pack))?);
        }

        let cut = ((1.0 - val_split) * offsets.len() as f32) as usize;
        let cut = cut.min(offsets.len());
        self.validation_offsets = offsets.split_off(cut);
        self.train_offsets = offsets;
        info!(
            "sharded corpus into {} train and {} validation batches",
            self.train_offsets.len(),
            self.validation_offsets.len()
        );
        Ok(())
    }

    pub fn load_batch(&self, offset: u64) -> Result<Vec<(Vec<i32>, Vec<i32>)>> {
        decode_batch(&self.blocks.get(offset)?)
    }

    pub fn train_offsets(&self) -> &[u64] {
        &self.train_offsets
    }

    pub fn validation_offsets(&self) -> &[u64] {
        &self.validation_offsets
    }
}

/// `count | {input_len | target_len | inputs | targets} x count`, i32 LE.
fn encode_batch(pairs: &[(Vec<i32>, Vec<i32>)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(pairs.len() as i32).to_le_bytes());
    for (input, target) in pairs {
        bytes.extend_from_slice(&(input.len() as i32).to_le_bytes());
        bytes.extend_from_slice(&(target.len() as i32).to_le_bytes());
        for v in input {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in target {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    bytes
}

fn decode_batch(bytes: &[u8]) -> Result<Vec<(Vec<i32>, Vec<i32>)>> {
    let mut cursor = 0usize;
    let count = read_i32(bytes, &mut cursor)?;
    if count < 0 {
        return Err(CoreError::CorruptData(format!(
            "batch block claims {count} pairs"
        )));
    }
    let mut pairs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let input_len = read_i32(bytes, &mut cursor)?;
        let target_len = read_i32(bytes, &mut cursor)?;
        if input_len < 0 || target_len < 0 {
            return Err(CoreError::CorruptData(
                "batch block has a negative pair length".to_string(),
            ));
        }
        let mut input = Vec::with_capacity(input_len as usize);
        for _ in 0..input_len {
            input.push(read_i32(bytes, &mut cursor)?);
        }
        let mut target = Vec::with_capacity(target_len as usize);
        for _ in 0..target_len {
            target.push(read_i32(bytes, &mut cursor)?);
        }
        pairs.push((input, target));
    }
    if cursor != bytes.len() {
        return Err(CoreError::CorruptData(format!(
            "batch block has {} trailing bytes",
            bytes.len() - cursor
        )));
    }
    Ok(pairs)
}

fn read_i32(bytes: &[u8], cursor: &mut usize) -> Result<i32> {
    let end = *cursor + 4;
    if end > bytes.len() {
        return Err(CoreError::CorruptData("batch block truncated".to_string()));
    }
    let v = i32::from_le_bytes(bytes[*cursor..end].try_into().expect("slice of 4"));
    *cursor = end;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service(dir: &Path) -> DatasetShardService {
        DatasetShardService::create(&dir.join("batches.bts")).unwrap()
    }

    #[test]
    fn test_windows_shift_targets_by_one() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        let corpus: Vec<i32> = (0..40).collect();
        svc.initialize(&corpus, 5, 64, 0, 2, 0.0).unwrap();

        for &offset in svc.train_offsets() {
            for (input, target) in svc.load_batch(offset).unwrap() {
                assert_eq!(input.len(), 4);
                assert_eq!(target.len(), 4);
                for i in 0..input.len() - 1 {
                    // within a window, the target leads the input by one
                    if target[i] != 0 && input[i + 1] != 0 {
                        assert_eq!(target[i], input[i + 1]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_batch_count_is_ceiling() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        // 23 tokens, context 4 -> 6 windows; batch 4 -> ceil(6/4) = 2 blocks
        let corpus: Vec<i32> = (0..23).map(|v| v % 32).collect();
        svc.initialize(&corpus, 4, 32, 0, 4, 0.0).unwrap();
        assert_eq!(svc.train_offsets().len(), 2);
        assert_eq!(svc.load_batch(svc.train_offsets()[0]).unwrap().len(), 4);
        assert_eq!(svc.load_batch(svc.train_offsets()[1]).unwrap().len(), 2);
    }

    #[test]
    fn test_tail_window_is_padded() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        let corpus: Vec<i32> = (1..=10).collect(); // 10 tokens, context 4
        svc.initialize(&corpus, 4, 32, 31, 1, 0.0).unwrap();
        let mut pairs = Vec::new();
        for &o in svc.train_offsets() {
            pairs.extend(svc.load_batch(o).unwrap());
        }
        // windows start at 0, 4, 8; the last covers tokens 9 and 10 only
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, vec![1, 2, 3]);
        assert_eq!(pairs[0].1, vec![2, 3, 4]);
        assert_eq!(pairs[2].0, vec![9, 31, 31]);
        assert_eq!(pairs[2].1, vec![10, 31, 31]);
    }

    #[test]
    fn test_validation_split() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        let corpus: Vec<i32> = (0..200).map(|v| v % 50).collect();
        svc.initialize(&corpus, 5, 50, 0, 2, 0.25).unwrap();
        let train = svc.train_offsets().len();
        let val = svc.validation_offsets().len();
        assert_eq!(train + val, 20);
        assert_eq!(train, 15);
        assert_eq!(val, 5);
        // validation offsets decode too
        for &o in svc.validation_offsets() {
            assert!(!svc.load_batch(o).unwrap().is_empty());
        }
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        let corpus: Vec<i32> = (0..10).collect();
        assert!(svc.initialize(&corpus, 1, 16, 0, 2, 0.0).is_err());
        assert!(svc.initialize(&corpus, 4, 16, 0, 0, 0.0).is_err());
        assert!(svc.initialize(&corpus, 4, 16, 0, 2, 1.0).is_err());
        assert!(svc.initialize(&[5], 4, 16, 0, 2, 0.0).is_err());
        assert!(svc.initialize(&corpus, 4, 8, 0, 2, 0.0).is_err()); // token 9 outside vocab 8
        assert!(svc.initialize(&corpus, 4, 16, 99, 2, 0.0).is_err()); // pad outside vocab
    }

    #[test]
    fn test_decode_rejects_corrupt_payload() {
        assert!(decode_batch(&[1, 0]).is_err());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        assert!(decode_batch(&bytes).is_err()); // promised indices missing
        assert!(decode_batch(&(-1i32).to_le_bytes()).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let pairs = vec![
            (vec![1, 2, 3], vec![2, 3, 4]),
            (vec![9, 8], vec![8, 7]),
            (vec![], vec![]),
        ];
        let decoded = decode_batch(&encode_batch(&pairs)).unwrap();
        assert_eq!(decoded, pairs);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocates a fresh tensor id of the form `<name>_<seq:08>_<hex128>`.
///
/// The monotonic counter makes ids orderable within a process; the random
/// suffix keeps them collision-free across processes sharing a cache
/// directory.
pub fn allocate_tensor_id(name: &str) -> String {
    let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
    let suffix: u128 = rand::random();
    format!("{}_{:08}_{:032x}", sanitize_name(name), seq, suffix)
}

/// Reduces a caller-supplied label to filesystem-safe characters.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(48)
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "tensor".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| allocate_tensor_id("w")).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_id_format() {
        let id = allocate_tensor_id("embedding");
        let mut parts = id.rsplitn(3, '_');
        let suffix = parts.next().unwrap();
        let seq = parts.next().unwrap();
        let name = parts.next().unwrap();
        assert_eq!(name, "embedding");
        assert_eq!(seq.len(), 8);
        assert!(seq.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("w/hy bias"), "w_hy_bias");
        assert_eq!(sanitize_name(""), "tensor");
        assert_eq!(sanitize_name("ok_name_42"), "ok_name_42");
    }
}

mod block_store;
pub use block_store::{block_checksum, BlockStore, MAX_BLOCK_LEN};
mod swap_store;
pub use swap_store::SwapStore;
mod tensor_store;
pub use tensor_store::TensorStore;

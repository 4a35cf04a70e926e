pub mod chunker;
pub mod normalizer;

pub use chunker::{chunk, ChunkParams, ChunkStrategy};
pub use normalizer::{normalize_email, NormalizedEmail};

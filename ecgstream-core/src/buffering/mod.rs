//! In-memory sample storage and the chunk type cut from it.
//!
//! The whole waveform is loaded up front; chunks are read-only copies of
//! consecutive windows handed to the dispatcher.

pub mod chunk;
pub mod sample_buffer;

pub use chunk::Chunk;
pub use sample_buffer::SampleBuffer;

//! Buffering and storage of captured records.
pub mod ring_buffer;
pub mod storage;

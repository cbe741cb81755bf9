//! Erasure Coding Module
//!
//! Mojette projection coding for file blocks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Erasure Coding Module                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌───────────────────────┐  │
//! │  │   Layout     │───▶│    Transform     │    │   Distribution        │  │
//! │  │   Registry   │    │ forward/inverse  │    │   Bitmap              │  │
//! │  └──────────────┘    └──────────────────┘    └───────────────────────┘  │
//! │                                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - **Layout Registry** (`layout.rs`): `(safe, forward, inverse)` presets
//!   and per-projection angles and sizes.
//! - **Transform** (`transform.rs`): XOR Mojette transform over runs of
//!   8 KiB blocks with reusable projection buffers.
//! - **Distribution** (`distribution.rs`): per-block slot bitmaps, the
//!   implicit slot to fragment mapping and run splitting.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mojettestor::ec::{Layout, LayoutParams, MojetteCodec, BLOCK_SIZE};
//!
//! let params = Arc::new(LayoutParams::new(Layout::Layout0)?);
//! let codec = MojetteCodec::new(params);
//!
//! let block = vec![0xABu8; BLOCK_SIZE];
//! let mut set = codec.projection_set(1);
//! codec.forward(&block, &mut set)?;
//!
//! // any 2 of the 3 projections rebuild the block
//! let mut out = vec![0u8; BLOCK_SIZE];
//! codec.inverse(&mut set, &[0, 2], &mut out)?;
//! assert_eq!(out, block);
//! ```

pub mod distribution;
pub mod layout;
pub mod transform;

#[cfg(test)]
mod proptest;

pub use distribution::{runs, DistributionBitmap, Run};
pub use layout::{Angle, Layout, LayoutParams, BLOCK_ELEMENTS, BLOCK_SIZE, ELEMENT_SIZE};
pub use transform::{MojetteCodec, ProjectionSet};

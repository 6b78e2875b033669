//! vesselfuse-io: Filesystem persistence for vesselfuse.
//!
//! Reads reference images and rater label volumes from NIfTI-1 files,
//! writes consensus masks carrying the reference header, and renders
//! PNG slice previews. All fusion logic lives in `vesselfuse-pipeline`.

pub mod error;
pub mod preview;
pub mod volume_file;

pub use error::IoError;
pub use volume_file::{ReferenceImage, header_for, read_reference, read_volume, write_labels, write_mask};

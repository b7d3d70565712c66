//! Recover the volumes of a UBI image out of a raw flash dump.

pub mod image;
pub mod source;
pub mod ubi;
pub mod util;

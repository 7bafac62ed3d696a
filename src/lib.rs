mod gsd_lib;

pub use gsd_lib::*;

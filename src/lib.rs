pub mod cryptfs_lib;

pub use cryptfs_lib::*;

//! command line arguments of the `extentfs` binary
mod cli_struct;
pub use cli_struct::*;

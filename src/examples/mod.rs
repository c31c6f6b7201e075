//! Examples
//!
//! Small runnable walkthroughs of the DPO pipeline, registered with the CLI
//! under `example <ID>`.

pub mod dpo;

//! Small builders for the Kubernetes objects features generate.
pub mod meta;
pub mod pod;

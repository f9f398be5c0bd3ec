//! Custom resources generated next to the built-in Kubernetes kinds.
pub mod application_deployment;
pub mod route;

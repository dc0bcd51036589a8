//! The two built-in tools registered in the core (§4.4).

pub mod shell;
pub mod web;

pub use shell::ShellExecTool;
pub use web::WebFetchTool;

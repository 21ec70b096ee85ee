pub mod json_path;
pub mod sse;

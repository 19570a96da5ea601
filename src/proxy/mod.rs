pub mod handler;
pub mod headers;
pub mod middleware;
pub mod stream_scan;
pub mod upstream;

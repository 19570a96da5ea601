pub mod calibration;
pub mod engine;
pub mod pool;
pub mod regex_engine;
pub mod safe_scan;
pub mod streaming;
pub mod worker;

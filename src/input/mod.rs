// file: src/input/mod.rs
// description: input directory handling module exports
// reference: internal module structure

pub mod preprocess;
pub mod scanner;

pub use preprocess::{PreprocessFailure, PreprocessReport, Preprocessor};
pub use scanner::{FileScanner, ScanResult, ScannedFile};

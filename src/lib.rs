pub mod apss;
pub mod chunker;
pub mod config;
pub mod count;
pub mod enumerator;
pub mod error;
pub mod filter;
pub mod io;
pub mod knn;
pub mod measure;
pub mod merge;
pub mod observer;
pub mod records;
pub mod reduce;
pub mod run;
pub mod scheduler;
pub mod sort;
pub mod stats;
pub mod vectors;
pub mod weighting;

pub use config::Config;
pub use error::{Error, Result};
pub use run::{Pipeline, Stage};

pub mod category;
pub mod classifier;

pub use category::ErrorCategory;
pub use classifier::{CodeRule, ErrorClassifier, ErrorInfo};

//! Error types for the search layer
//!
//! Only configuration and structural defects surface here. Infeasible local
//! solves and exhausted retry budgets are search outcomes, reported through
//! counters and booleans instead.

/// Fatal errors raised by the search layer
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// A snapshot or fixing names a variable the target model does not expose
    #[error("Variable '{name}' does not exist in the target model")]
    UnknownVariable { name: String },

    /// A simplex family cannot be completed to its target sum
    #[error("Simplex family '{family}' cannot reach target {target}: fixed members already sum to {fixed_sum}")]
    SimplexOverflow {
        family: String,
        fixed_sum: f64,
        target: f64,
    },

    /// The free members' bounds cannot absorb the budget the fixed members leave
    #[error("Simplex family '{family}' cannot distribute {remaining}: free members' bounds sum to [{lower_sum}, {upper_sum}]")]
    SimplexBounds {
        family: String,
        remaining: f64,
        lower_sum: f64,
        upper_sum: f64,
    },

    /// The model builder refused a prototype
    #[error("Failed to build model for prototype '{prototype}': {reason}")]
    Build { prototype: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON export failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SearchError>;

impl SearchError {
    pub fn unknown_variable(name: &str) -> Self {
        SearchError::UnknownVariable {
            name: name.to_string(),
        }
    }
}

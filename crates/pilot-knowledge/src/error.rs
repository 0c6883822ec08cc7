//! Error types for knowledge handling

/// Malformed knowledge returned by a retriever
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KnowledgeError {
    /// Relevance outside [0, 1] or not a number
    #[error("relevance {value} out of range for {citation}")]
    InvalidRelevance { citation: String, value: f64 },

    /// Item carries no summary text
    #[error("knowledge item without summary: {citation}")]
    EmptySummary { citation: String },
}

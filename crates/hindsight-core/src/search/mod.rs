//! Rank fusion, FTS5 query shaping, and the injected reranker trait used by
//! the recall engine (C9).

mod hybrid;
mod keyword;
mod reranker;

pub use hybrid::{linear_combination, reciprocal_rank_fusion};
pub use keyword::sanitize_fts5_query;
pub use reranker::{
    apply_config, RerankedResult, Reranker, RerankerConfig, DEFAULT_RERANK_COUNT,
    DEFAULT_RETRIEVAL_COUNT,
};

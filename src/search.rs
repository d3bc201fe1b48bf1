//! Top-k semantic search executor.
//!
//! Composes a single scanning query across chunks, embeddings,
//! projections, and the optional text tables, streams the candidate rows,
//! scores each by cosine similarity, and keeps a size-bounded top-k by
//! sorted insertion. The projection-distance predicate prunes candidates
//! inside SQLite before their vectors are ever decoded.
//!
//! The `sql_where` fragment is a trusted caller-supplied predicate: it is
//! wrapped in parentheses and appended verbatim so applications can join
//! against their own attached databases. Never interpolate untrusted user
//! input through it.

use futures_util::TryStreamExt;
use sqlx::Row;
use tracing::{debug, warn};

use crate::embedding::{blob_to_vec, cosine_similarity_checked};
use crate::error::{Error, Result};
use crate::models::{SearchMatch, SourceId};
use crate::projection::PROJECTION_K;
use crate::store::{chunk_from_row, Store, TableNames};

/// Parameters for one search call. `Default` gives `limit = 10`,
/// `min_score = 0.7`, no filters.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Maximum number of results (k).
    pub limit: i64,
    /// Results scoring below this are discarded. In `[-1, 1]`.
    pub min_score: f64,
    pub source_type: Option<String>,
    pub source_id: Option<SourceId>,
    pub pair_id: Option<i64>,
    pub parent_id: Option<i64>,
    /// AND-joined `LIKE` patterns over stored chunk text.
    pub like: Vec<String>,
    /// Full-text query against the FTS index.
    pub match_query: Option<String>,
    /// Trusted raw predicate; alias `c` refers to chunks, attached
    /// databases by their schema prefix.
    pub sql_where: Option<String>,
    /// Return the stored chunk text with each match.
    pub include_text: bool,
    /// Apply the projection pre-filter when projection vectors exist.
    pub use_projection: bool,
    /// Override for the squared-distance bound; the service default
    /// applies when unset.
    pub projection_threshold: Option<f64>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.7,
            source_type: None,
            source_id: None,
            pair_id: None,
            parent_id: None,
            like: Vec::new(),
            match_query: None,
            sql_where: None,
            include_text: false,
            use_projection: true,
            projection_threshold: None,
        }
    }
}

impl SearchParams {
    fn wants_text_join(&self) -> bool {
        self.include_text || !self.like.is_empty() || self.match_query.is_some()
    }
}

/// A value bound into the composed scan, in predicate order.
#[derive(Debug, Clone, PartialEq)]
enum Bind {
    I64(i64),
    F64(f64),
    Text(String),
}

/// Execute the scan and return up to `limit` matches in descending score
/// order, incrementing `match_count` on the returned chunks.
pub(crate) async fn run_search(
    store: &Store,
    service_id: i64,
    query_vec: &[f32],
    query_projection: Option<&[f64; PROJECTION_K]>,
    threshold: f64,
    params: &SearchParams,
) -> Result<Vec<SearchMatch>> {
    if params.limit < 1 {
        return Err(Error::Validation("limit must be >= 1".into()));
    }
    if !(-1.0..=1.0).contains(&params.min_score) {
        return Err(Error::Validation("min_score must be in [-1, 1]".into()));
    }
    if params.wants_text_join() && store.names().texts.is_none() {
        return Err(Error::Validation(
            "text filters and include_text require text storage".into(),
        ));
    }
    let threshold = params.projection_threshold.unwrap_or(threshold);
    if threshold <= 0.0 {
        return Err(Error::Validation(
            "projection_threshold must be > 0".into(),
        ));
    }

    let projection = if params.use_projection {
        query_projection
    } else {
        None
    };
    let (sql, binds) = build_query(store.names(), service_id, projection, threshold, params);
    debug!(target: "memodb::search", sql = %sql, "composed scan");

    let mut query = sqlx::query(&sql);
    for bind in &binds {
        query = match bind {
            Bind::I64(v) => query.bind(*v),
            Bind::F64(v) => query.bind(*v),
            Bind::Text(v) => query.bind(v.as_str()),
        };
    }

    let mut top_k = TopK::new(params.limit as usize);
    let mut rows = query.fetch(store.pool());
    while let Some(row) = rows.try_next().await? {
        let blob: Vec<u8> = row.get("embedding");
        let stored = blob_to_vec(&blob);
        let score = cosine_similarity_checked(query_vec, &stored)?;
        if score < params.min_score {
            continue;
        }

        let text = if params.include_text {
            Some(row.get::<String, _>("content"))
        } else {
            None
        };
        top_k.insert(SearchMatch {
            chunk: chunk_from_row(&row)?,
            score,
            text,
        });
    }
    drop(rows);

    let results = top_k.into_sorted_vec();

    // Best-effort: a failed counter update is logged, never surfaced —
    // the results themselves are already correct.
    let ids: Vec<i64> = results.iter().map(|m| m.chunk.id).collect();
    if let Err(e) = store.increment_match_count(&ids).await {
        warn!(target: "memodb::search", error = %e, "match_count increment failed");
    }

    Ok(results)
}

/// Compose the single scan per the executor contract: joins first, then
/// predicates in a fixed order, every dynamic value bound.
fn build_query(
    names: &TableNames,
    service_id: i64,
    query_projection: Option<&[f64; PROJECTION_K]>,
    threshold: f64,
    params: &SearchParams,
) -> (String, Vec<Bind>) {
    let mut sql = String::new();
    let mut binds: Vec<Bind> = Vec::new();

    sql.push_str(
        "SELECT c.id, c.hash, c.source_type, c.source_id, c.pair_id, c.parent_id, \
         c.\"offset\", c.size, c.match_count, c.read_count, c.created_at, e.embedding",
    );
    if params.include_text {
        sql.push_str(", t.content AS content");
    }
    sql.push_str(&format!(
        " FROM {} c JOIN {} e ON c.hash = e.hash",
        names.chunks, names.embeddings
    ));

    if query_projection.is_some() {
        sql.push_str(&format!(
            " JOIN {} p ON c.hash = p.hash",
            names.projections
        ));
    }
    if params.wants_text_join() {
        // Presence validated by the caller.
        if let Some(texts) = &names.texts {
            sql.push_str(&format!(" JOIN {} t ON t.hash = c.hash", texts));
        }
    }
    if params.match_query.is_some() {
        if let Some(fts) = &names.texts_fts {
            sql.push_str(&format!(" JOIN {} fts ON fts.hash = c.hash", fts));
        }
    }

    sql.push_str(" WHERE e.service_id = ?");
    binds.push(Bind::I64(service_id));

    if let Some(source_type) = &params.source_type {
        sql.push_str(" AND c.source_type = ?");
        binds.push(Bind::Text(source_type.clone()));
    }
    if let Some(source_id) = params.source_id {
        sql.push_str(" AND c.source_id = ?");
        binds.push(Bind::I64(source_id));
    }
    if let Some(pair_id) = params.pair_id {
        sql.push_str(" AND c.pair_id = ?");
        binds.push(Bind::I64(pair_id));
    }
    if let Some(parent_id) = params.parent_id {
        sql.push_str(" AND c.parent_id = ?");
        binds.push(Bind::I64(parent_id));
    }

    if let Some(fragment) = &params.sql_where {
        sql.push_str(&format!(" AND ({})", fragment));
    }

    for pattern in &params.like {
        sql.push_str(" AND t.content LIKE ?");
        binds.push(Bind::Text(pattern.clone()));
    }
    if let Some(match_query) = &params.match_query {
        sql.push_str(" AND fts MATCH ?");
        binds.push(Bind::Text(match_query.clone()));
    }

    if let Some(projection) = query_projection {
        sql.push_str(" AND (");
        for (i, value) in projection.iter().enumerate() {
            if i > 0 {
                sql.push_str(" + ");
            }
            sql.push_str(&format!("(p.proj_{i} - ?) * (p.proj_{i} - ?)", i = i));
            binds.push(Bind::F64(*value));
            binds.push(Bind::F64(*value));
        }
        sql.push_str(") <= ?");
        binds.push(Bind::F64(threshold));
    }

    (sql, binds)
}

/// Size-bounded collection of the highest-scoring matches.
///
/// Candidates insert at the first position whose score is strictly lower
/// (binary search), so equal scores keep their arrival order; anything
/// pushed past `k` falls off the tail. O(n log k) comparisons and O(k)
/// memory over a stream of n candidates.
struct TopK {
    k: usize,
    items: Vec<SearchMatch>,
}

impl TopK {
    fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k + 1),
        }
    }

    fn insert(&mut self, candidate: SearchMatch) {
        let idx = self
            .items
            .partition_point(|existing| existing.score >= candidate.score);
        if idx >= self.k {
            return;
        }
        self.items.insert(idx, candidate);
        if self.items.len() > self.k {
            self.items.pop();
        }
    }

    fn into_sorted_vec(self) -> Vec<SearchMatch> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRecord;

    fn names() -> TableNames {
        TableNames::new("", Some("text_store"))
    }

    fn match_with(id: i64, score: f64) -> SearchMatch {
        SearchMatch {
            chunk: ChunkRecord {
                id,
                hash: [0u8; 32],
                source_type: "t".into(),
                source_id: id,
                pair_id: None,
                parent_id: None,
                offset: Some(0),
                size: 1,
                match_count: 0,
                read_count: 0,
                created_at: 0,
            },
            score,
            text: None,
        }
    }

    #[test]
    fn top_k_keeps_best_sorted() {
        let mut top = TopK::new(3);
        for (id, score) in [(1, 0.2), (2, 0.9), (3, 0.5), (4, 0.8), (5, 0.1)] {
            top.insert(match_with(id, score));
        }
        let out = top.into_sorted_vec();
        let ids: Vec<i64> = out.iter().map(|m| m.chunk.id).collect();
        assert_eq!(ids, vec![2, 4, 3]);
        assert!(out.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn top_k_never_exceeds_k() {
        let mut top = TopK::new(2);
        for i in 0..50 {
            top.insert(match_with(i, (i as f64) / 50.0));
        }
        let out = top.into_sorted_vec();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk.id, 49);
        assert_eq!(out[1].chunk.id, 48);
    }

    #[test]
    fn top_k_ties_keep_arrival_order() {
        let mut top = TopK::new(3);
        top.insert(match_with(1, 0.5));
        top.insert(match_with(2, 0.5));
        top.insert(match_with(3, 0.5));
        let ids: Vec<i64> = top.into_sorted_vec().iter().map(|m| m.chunk.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn minimal_query_has_service_predicate_only() {
        let params = SearchParams::default();
        let (sql, binds) = build_query(&names(), 7, None, 2.0, &params);
        assert!(sql.starts_with("SELECT c.id"));
        assert!(sql.contains("JOIN embeddings e ON c.hash = e.hash"));
        assert!(!sql.contains(" p ON "));
        assert!(!sql.contains(" t ON "));
        assert!(sql.ends_with("WHERE e.service_id = ?"));
        assert_eq!(binds, vec![Bind::I64(7)]);
    }

    #[test]
    fn projection_predicate_binds_each_coordinate_twice() {
        let params = SearchParams::default();
        let projection = [0.5f64; PROJECTION_K];
        let (sql, binds) = build_query(&names(), 1, Some(&projection), 2.0, &params);
        assert!(sql.contains("JOIN projections p ON c.hash = p.hash"));
        assert!(sql.contains("(p.proj_0 - ?) * (p.proj_0 - ?)"));
        assert!(sql.contains("(p.proj_7 - ?) * (p.proj_7 - ?)"));
        assert!(sql.ends_with(") <= ?"));
        // service_id + 16 coordinates + threshold
        assert_eq!(binds.len(), 18);
        assert_eq!(*binds.last().unwrap(), Bind::F64(2.0));
    }

    #[test]
    fn filters_append_in_contract_order() {
        let params = SearchParams {
            source_type: Some("event".into()),
            source_id: Some(42),
            like: vec!["%fox%".into()],
            match_query: Some("fox".into()),
            sql_where: Some("c.size > 10".into()),
            include_text: true,
            ..Default::default()
        };
        let (sql, binds) = build_query(&names(), 1, None, 2.0, &params);
        assert!(sql.contains("t.content AS content"));
        assert!(sql.contains("JOIN text_store.texts t ON t.hash = c.hash"));
        assert!(sql.contains("JOIN text_store.texts_fts fts ON fts.hash = c.hash"));

        let where_pos = sql.find("AND (c.size > 10)").unwrap();
        let like_pos = sql.find("t.content LIKE ?").unwrap();
        let match_pos = sql.find("fts MATCH ?").unwrap();
        assert!(where_pos < like_pos && like_pos < match_pos);

        assert_eq!(
            binds,
            vec![
                Bind::I64(1),
                Bind::Text("event".into()),
                Bind::I64(42),
                Bind::Text("%fox%".into()),
                Bind::Text("fox".into()),
            ]
        );
    }
}

use crate::store::{BUCKET_TOOL_HASHES, BUCKET_TOOL_STATS, BUCKET_TOOLS, Store, StoreError};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::debug;

/// Tool hint annotations mirrored from the upstream listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default, rename = "readOnly")]
    pub read_only: Option<bool>,
    #[serde(default)]
    pub destructive: Option<bool>,
    #[serde(default)]
    pub idempotent: Option<bool>,
    #[serde(default, rename = "openWorld")]
    pub open_world: Option<bool>,
}

/// One catalog document per `(server, tool)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    #[serde(rename = "serverName")]
    pub server_name: String,
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "paramsSchemaJSON")]
    pub params_schema: String,
    #[serde(default)]
    pub annotations: ToolAnnotations,
    #[serde(default)]
    pub hash: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ToolEntry {
    pub fn new(
        server_name: impl Into<String>,
        tool_name: impl Into<String>,
        description: impl Into<String>,
        params_schema: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut entry = Self {
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            description: description.into(),
            params_schema: params_schema.into(),
            annotations: ToolAnnotations::default(),
            hash: String::new(),
            created: now,
            updated: now,
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// SHA-256 over the canonical JSON array `[server, tool, schema]`.
    /// Description changes deliberately do not move the hash.
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::to_string(&[
            self.server_name.as_str(),
            self.tool_name.as_str(),
            self.params_schema.as_str(),
        ])
        .expect("canonical array serializes");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn key(&self) -> String {
        format!("{}|{}", self.server_name, self.tool_name)
    }

    /// Routed name exposed to the client.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.server_name, self.tool_name)
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: ToolEntry,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub total_tools: u64,
    pub top_tools: Vec<(String, u64)>,
}

/// Full-text BM25 index over the tool catalog.
///
/// Lives in the same SQLite file as the store (separate tables) so a single
/// `mcpproxy.db` carries everything. FTS5 provides bm25() ranking with
/// k1=1.2, b=0.75; when FTS5 is unavailable we fall back to LIKE matching.
pub struct ToolIndex {
    store: Arc<Store>,
    has_fts: bool,
    debug_search: bool,
}

impl ToolIndex {
    pub fn new(store: Arc<Store>, debug_search: bool) -> Result<Self> {
        let mut index = Self {
            store,
            has_fts: false,
            debug_search,
        };
        index.ensure_schema()?;
        Ok(index)
    }

    fn connect(&self) -> Result<Connection> {
        if self.store.is_closed() {
            return Err(StoreError::Closed.into());
        }
        let conn = Connection::open(self.store.db_path())?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;
        Ok(conn)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        let conn = self.connect()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tool_catalog (
                id INTEGER PRIMARY KEY,
                server_name TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                params_schema TEXT NOT NULL DEFAULT '',
                annotations TEXT NOT NULL DEFAULT '{}',
                hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                quarantined INTEGER NOT NULL DEFAULT 0,
                authenticated INTEGER NOT NULL DEFAULT 1,
                UNIQUE (server_name, tool_name)
            )",
            [],
        )?;

        // Identifier-aware tokenizer: `_`, `-` and `.` stay inside tokens so
        // MCP tool names like `repo.create_issue` index as themselves.
        match conn.execute(
            "CREATE VIRTUAL TABLE IF NOT EXISTS tool_fts
            USING fts5(
                tool_name,
                description,
                params_schema,
                content='tool_catalog',
                content_rowid='id',
                tokenize=\"unicode61 tokenchars '_-.'\"
            )",
            [],
        ) {
            Ok(_) => {
                conn.execute(
                    "CREATE TRIGGER IF NOT EXISTS tool_ai AFTER INSERT ON tool_catalog BEGIN
                        INSERT INTO tool_fts(rowid, tool_name, description, params_schema)
                        VALUES (new.id, new.tool_name, new.description, new.params_schema);
                    END",
                    [],
                )?;
                conn.execute(
                    "CREATE TRIGGER IF NOT EXISTS tool_ad AFTER DELETE ON tool_catalog BEGIN
                        INSERT INTO tool_fts(tool_fts, rowid, tool_name, description, params_schema)
                        VALUES ('delete', old.id, old.tool_name, old.description, old.params_schema);
                    END",
                    [],
                )?;
                conn.execute(
                    "CREATE TRIGGER IF NOT EXISTS tool_au AFTER UPDATE ON tool_catalog BEGIN
                        INSERT INTO tool_fts(tool_fts, rowid, tool_name, description, params_schema)
                        VALUES ('delete', old.id, old.tool_name, old.description, old.params_schema);
                        INSERT INTO tool_fts(rowid, tool_name, description, params_schema)
                        VALUES (new.id, new.tool_name, new.description, new.params_schema);
                    END",
                    [],
                )?;
                self.has_fts = true;
            }
            Err(_) => {
                self.has_fts = false;
                debug!("FTS5 not available; falling back to LIKE");
            }
        }

        Ok(())
    }

    /// Insert or replace the document for `(server, tool)`. Returns whether
    /// the hash changed; the store buckets are only written when it did.
    pub fn upsert(&self, entry: &ToolEntry) -> Result<bool> {
        let key = entry.key();
        let prior_hash: Option<String> = self
            .store
            .get(BUCKET_TOOL_HASHES, &key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string());
        let changed = prior_hash.as_deref() != Some(entry.hash.as_str());

        let conn = self.connect()?;
        let annotations = serde_json::to_string(&entry.annotations)?;
        conn.execute(
            "INSERT INTO tool_catalog
                (server_name, tool_name, description, params_schema, annotations,
                 hash, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(server_name, tool_name) DO UPDATE SET
                description = excluded.description,
                params_schema = excluded.params_schema,
                annotations = excluded.annotations,
                hash = excluded.hash,
                updated_at = excluded.updated_at",
            params![
                entry.server_name,
                entry.tool_name,
                entry.description,
                entry.params_schema,
                annotations,
                entry.hash,
                entry.created.to_rfc3339(),
                entry.updated.to_rfc3339(),
            ],
        )?;
        drop(conn);

        if changed {
            self.store.put_json(BUCKET_TOOLS, &key, entry)?;
            self.store
                .put(BUCKET_TOOL_HASHES, &key, entry.hash.as_bytes())?;
        }
        Ok(changed)
    }

    pub fn remove(&self, server: &str, tool: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM tool_catalog WHERE server_name = ? AND tool_name = ?",
            params![server, tool],
        )?;
        drop(conn);
        let key = format!("{}|{}", server, tool);
        self.store.delete(BUCKET_TOOLS, &key)?;
        self.store.delete(BUCKET_TOOL_HASHES, &key)?;
        Ok(())
    }

    pub fn remove_server(&self, server: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM tool_catalog WHERE server_name = ?",
            params![server],
        )?;
        drop(conn);
        for (key, _) in self.store.range(BUCKET_TOOLS, &format!("{}|", server))? {
            self.store.delete(BUCKET_TOOLS, &key)?;
            self.store.delete(BUCKET_TOOL_HASHES, &key)?;
        }
        Ok(())
    }

    /// Tool names currently cataloged for one server.
    pub fn tools_for_server(&self, server: &str) -> Result<Vec<ToolEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT server_name, tool_name, description, params_schema, annotations,
                    hash, created_at, updated_at
             FROM tool_catalog WHERE server_name = ? ORDER BY tool_name ASC",
        )?;
        let rows = stmt
            .query_map(params![server], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Routing eligibility flags, kept in sync by the upstream manager.
    /// Search never returns tools of disabled, quarantined, or
    /// unauthenticated servers.
    pub fn set_server_policy(
        &self,
        server: &str,
        enabled: bool,
        quarantined: bool,
        authenticated: bool,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE tool_catalog SET enabled = ?, quarantined = ?, authenticated = ?
             WHERE server_name = ?",
            params![enabled, quarantined, authenticated, server],
        )?;
        Ok(())
    }

    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        if self.debug_search {
            debug!("tool search: raw={:?} fts={:?} topK={}", query, fts_query, top_k);
        }

        let conn = self.connect()?;
        if self.has_fts {
            let mut stmt = conn.prepare(
                "SELECT tc.server_name, tc.tool_name, tc.description, tc.params_schema,
                        tc.annotations, tc.hash, tc.created_at, tc.updated_at,
                        bm25(tool_fts) AS rank
                 FROM tool_fts
                 JOIN tool_catalog tc ON tool_fts.rowid = tc.id
                 WHERE tool_fts MATCH ?
                   AND tc.enabled = 1 AND tc.quarantined = 0 AND tc.authenticated = 1
                 ORDER BY rank ASC, tc.server_name ASC, tc.tool_name ASC
                 LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![fts_query, top_k as i64], |row| {
                    let entry = row_to_entry(row)?;
                    let rank: f64 = row.get(8)?;
                    Ok(SearchHit {
                        entry,
                        // bm25() ranks better matches more negative; flip the
                        // sign so callers see descending positive scores.
                        score: -rank,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(rows);
        }

        // LIKE fallback: no ranking signal beyond match/no-match.
        let like = format!("%{}%", query.trim().chars().take(200).collect::<String>());
        let mut stmt = conn.prepare(
            "SELECT server_name, tool_name, description, params_schema, annotations,
                    hash, created_at, updated_at
             FROM tool_catalog
             WHERE (tool_name LIKE ?1 OR description LIKE ?1)
               AND enabled = 1 AND quarantined = 0 AND authenticated = 1
             ORDER BY server_name ASC, tool_name ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![like, top_k as i64], |row| {
                Ok(SearchHit {
                    entry: row_to_entry(row)?,
                    score: 1.0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most-invoked eligible tools; the ranking used for an empty query.
    pub fn top_by_invocations(&self, n: usize) -> Result<Vec<SearchHit>> {
        let mut counts: Vec<(String, u64)> = self
            .store
            .range(BUCKET_TOOL_STATS, "")?
            .into_iter()
            .filter_map(|(key, value)| {
                String::from_utf8(value)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|count| (key, count))
            })
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let conn = self.connect()?;
        let mut hits = Vec::new();
        for (qualified, count) in counts {
            if hits.len() >= n {
                break;
            }
            let Some((server, tool)) = qualified.split_once(':') else {
                continue;
            };
            let entry = conn
                .query_row(
                    "SELECT server_name, tool_name, description, params_schema, annotations,
                            hash, created_at, updated_at
                     FROM tool_catalog
                     WHERE server_name = ? AND tool_name = ?
                       AND enabled = 1 AND quarantined = 0 AND authenticated = 1",
                    params![server, tool],
                    row_to_entry,
                )
                .optional()?;
            if let Some(entry) = entry {
                hits.push(SearchHit {
                    entry,
                    score: count as f64,
                });
            }
        }
        Ok(hits)
    }

    pub fn record_invocation(&self, server: &str, tool: &str) -> Result<u64> {
        Ok(self
            .store
            .increment(BUCKET_TOOL_STATS, &format!("{}:{}", server, tool))?)
    }

    pub fn stats(&self, top_n: usize) -> Result<IndexStats> {
        let conn = self.connect()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM tool_catalog", [], |row| row.get(0))?;
        drop(conn);
        let top_tools = self
            .top_by_invocations(top_n)?
            .into_iter()
            .map(|hit| (hit.entry.qualified_name(), hit.score as u64))
            .collect();
        Ok(IndexStats {
            total_tools: total as u64,
            top_tools,
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolEntry> {
    let annotations: String = row.get(4)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(ToolEntry {
        server_name: row.get(0)?,
        tool_name: row.get(1)?,
        description: row.get(2)?,
        params_schema: row.get(3)?,
        annotations: serde_json::from_str(&annotations).unwrap_or_default(),
        hash: row.get(5)?,
        created: DateTime::parse_from_rfc3339(&created)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated: DateTime::parse_from_rfc3339(&updated)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn term_pattern() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    // Same token shape the FTS tokenizer produces: letters, digits, _-.
    RE.get_or_init(|| regex::Regex::new(r"[\p{L}\p{N}_\-.]+").unwrap())
}

/// Case-fold the query into quoted FTS terms, OR-joined. The stop-word list
/// is empty on purpose: MCP tool names are short, every token matters.
pub fn build_fts_query(text: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut terms = Vec::new();
    for m in term_pattern().find_iter(text) {
        let low = m.as_str().to_lowercase();
        let bare = low.trim_matches(|c| c == '.' || c == '-' || c == '_');
        if bare.is_empty() {
            continue;
        }
        if seen.insert(low.clone()) {
            terms.push(format!("\"{}\"", low));
        }
        if terms.len() >= 16 {
            break;
        }
    }
    terms.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DB_FILE;

    fn temp_index() -> (tempfile::TempDir, Arc<Store>, ToolIndex) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
        let index = ToolIndex::new(store.clone(), false).unwrap();
        (dir, store, index)
    }

    fn greet(server: &str) -> ToolEntry {
        ToolEntry::new(
            server,
            "greet",
            "say hello",
            r#"{"type":"object","properties":{"name":{"type":"string"}}}"#,
        )
    }

    #[test]
    fn hash_is_stable_and_schema_sensitive() {
        let a = greet("A");
        let b = greet("A");
        assert_eq!(a.hash, b.hash);
        let c = ToolEntry::new("A", "greet", "say hello", r#"{"type":"object"}"#);
        assert_ne!(a.hash, c.hash);
        // description does not move the hash
        let d = ToolEntry::new(
            "A",
            "greet",
            "different words",
            r#"{"type":"object","properties":{"name":{"type":"string"}}}"#,
        );
        assert_eq!(a.hash, d.hash);
    }

    #[test]
    fn hash_round_trips_through_store() {
        let (_dir, store, index) = temp_index();
        let entry = greet("A");
        index.upsert(&entry).unwrap();
        let loaded: ToolEntry = store
            .get_json(BUCKET_TOOLS, &entry.key())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.hash, loaded.compute_hash());
        assert_eq!(loaded.hash, entry.hash);
    }

    #[test]
    fn upsert_reports_hash_change() {
        let (_dir, _store, index) = temp_index();
        let entry = greet("A");
        assert!(index.upsert(&entry).unwrap());
        assert!(!index.upsert(&entry).unwrap());
        let mut changed = entry.clone();
        changed.params_schema = r#"{"type":"object"}"#.into();
        changed.hash = changed.compute_hash();
        assert!(index.upsert(&changed).unwrap());
    }

    #[test]
    fn search_finds_by_description() {
        let (_dir, _store, index) = temp_index();
        index.upsert(&greet("A")).unwrap();
        index
            .upsert(&ToolEntry::new("A", "forecast", "weather report", "{}"))
            .unwrap();
        let hits = index.search("hello", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.tool_name, "greet");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn search_filters_quarantined_and_disabled() {
        let (_dir, _store, index) = temp_index();
        index.upsert(&greet("A")).unwrap();
        index.upsert(&greet("B")).unwrap();
        index.upsert(&greet("C")).unwrap();
        index.set_server_policy("B", true, true, true).unwrap();
        index.set_server_policy("C", false, false, true).unwrap();

        let hits = index.search("hello", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.server_name, "A");

        // releasing the quarantine brings B back
        index.set_server_policy("B", true, false, true).unwrap();
        let hits = index.search("hello", 5).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn ties_break_by_server_then_tool() {
        let (_dir, _store, index) = temp_index();
        index.upsert(&greet("beta")).unwrap();
        index.upsert(&greet("alpha")).unwrap();
        let hits = index.search("hello", 5).unwrap();
        let servers: Vec<_> = hits.iter().map(|h| h.entry.server_name.as_str()).collect();
        assert_eq!(servers, vec!["alpha", "beta"]);
    }

    #[test]
    fn identifier_tokens_match_exactly() {
        let (_dir, _store, index) = temp_index();
        index
            .upsert(&ToolEntry::new(
                "gh",
                "repo.create_issue",
                "open a new issue",
                "{}",
            ))
            .unwrap();
        let hits = index.search("repo.create_issue", 5).unwrap();
        assert_eq!(hits.len(), 1);
        // sub-token does not match a tokenchars-joined identifier
        let hits = index.search("zzz_unrelated", 5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn remove_server_drops_all_tools() {
        let (_dir, store, index) = temp_index();
        index.upsert(&greet("A")).unwrap();
        index
            .upsert(&ToolEntry::new("A", "bye", "say goodbye", "{}"))
            .unwrap();
        index.upsert(&greet("B")).unwrap();
        index.remove_server("A").unwrap();
        assert!(index.search("hello", 5).unwrap().iter().all(|h| h.entry.server_name == "B"));
        assert!(store.get(BUCKET_TOOLS, "A|greet").unwrap().is_none());
        assert!(store.get(BUCKET_TOOL_HASHES, "A|greet").unwrap().is_none());
    }

    #[test]
    fn invocation_counts_rank_empty_query() {
        let (_dir, _store, index) = temp_index();
        index.upsert(&greet("A")).unwrap();
        index
            .upsert(&ToolEntry::new("A", "forecast", "weather", "{}"))
            .unwrap();
        for _ in 0..3 {
            index.record_invocation("A", "forecast").unwrap();
        }
        index.record_invocation("A", "greet").unwrap();
        let top = index.top_by_invocations(5).unwrap();
        assert_eq!(top[0].entry.tool_name, "forecast");
        assert_eq!(top[0].score as u64, 3);
        assert_eq!(top[1].entry.tool_name, "greet");
    }

    #[test]
    fn stats_reports_totals() {
        let (_dir, _store, index) = temp_index();
        index.upsert(&greet("A")).unwrap();
        index.record_invocation("A", "greet").unwrap();
        let stats = index.stats(5).unwrap();
        assert_eq!(stats.total_tools, 1);
        assert_eq!(stats.top_tools[0].0, "A:greet");
    }

    #[test]
    fn fts_query_shape() {
        assert_eq!(build_fts_query("Say HELLO"), "\"say\" OR \"hello\"");
        assert_eq!(build_fts_query("hello hello"), "\"hello\"");
        assert_eq!(build_fts_query("??!"), "");
        assert_eq!(build_fts_query("web-search"), "\"web-search\"");
    }
}

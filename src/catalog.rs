//! Product catalog persistence and index loading.
//!
//! A catalog is a set of `CatalogEntry` rows (one embedded product image
//! each) plus a meta record naming the embedding model and dimension. The
//! meta record also carries a SHA-256 digest over every entry so a catalog
//! that was edited behind the pipeline's back is refused at load time.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::embed::{Embedder, Embedding};
use crate::frame::Frame;
use crate::index::{IndexSet, SimilarityIndex};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff"];

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub product_id: String,
    pub category: String,
    pub image_path: String,
    pub embedding: Embedding,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogMeta {
    pub dimension: usize,
    pub model_id: String,
    /// Hex SHA-256 over all entries in insertion order.
    pub digest: String,
}

pub trait CatalogStore {
    fn meta(&mut self) -> Result<Option<CatalogMeta>>;

    /// Append entries. The embedding model must match any existing meta and
    /// `(category, product_id)` must be new. All-or-nothing.
    fn save_entries(&mut self, model_id: &str, entries: &[CatalogEntry]) -> Result<usize>;

    /// Entries of one category in insertion order.
    fn load_entries(&mut self, category: &str) -> Result<Vec<CatalogEntry>>;

    /// `(category, product_id)` pairs in insertion order.
    fn list_products(&mut self) -> Result<Vec<(String, String)>>;

    fn categories(&mut self) -> Result<Vec<String>>;
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteCatalogStore {
    conn: Connection,
}

impl SqliteCatalogStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open catalog {}", db_path.display()))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS catalog_meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS catalog_entries (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              category TEXT NOT NULL,
              product_id TEXT NOT NULL,
              image_path TEXT NOT NULL,
              embedding BLOB NOT NULL,
              UNIQUE(category, product_id)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_category ON catalog_entries(category);
            "#,
        )?;
        Ok(())
    }

    fn read_meta_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM catalog_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn all_entries(&self) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT category, product_id, image_path, embedding FROM catalog_entries ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], read_entry_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<CatalogEntry>> {
    let category: String = row.get(0)?;
    let product_id: String = row.get(1)?;
    let image_path: String = row.get(2)?;
    let blob: Vec<u8> = row.get(3)?;
    Ok(decode_embedding(&blob).map(|embedding| CatalogEntry {
        product_id,
        category,
        image_path,
        embedding,
    }))
}

impl CatalogStore for SqliteCatalogStore {
    fn meta(&mut self) -> Result<Option<CatalogMeta>> {
        let Some(dimension) = self.read_meta_value("dimension")? else {
            return Ok(None);
        };
        let dimension = dimension
            .parse()
            .map_err(|_| anyhow!("corrupt catalog meta: dimension '{}'", dimension))?;
        let model_id = self
            .read_meta_value("model_id")?
            .ok_or_else(|| anyhow!("corrupt catalog meta: missing model_id"))?;
        let digest = self
            .read_meta_value("digest")?
            .ok_or_else(|| anyhow!("corrupt catalog meta: missing digest"))?;
        Ok(Some(CatalogMeta {
            dimension,
            model_id,
            digest,
        }))
    }

    fn save_entries(&mut self, model_id: &str, entries: &[CatalogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let dimension = check_batch(self.meta()?.as_ref(), model_id, entries)?;
        let mut all = self.all_entries()?;

        let tx = self.conn.transaction()?;
        for entry in entries {
            tx.execute(
                r#"
                INSERT INTO catalog_entries(category, product_id, image_path, embedding)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    entry.category,
                    entry.product_id,
                    entry.image_path,
                    encode_embedding(&entry.embedding)
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert product '{}' in category '{}'",
                    entry.product_id, entry.category
                )
            })?;
        }
        all.extend_from_slice(entries);
        let digest = catalog_digest(&all);
        for (key, value) in [
            ("dimension", dimension.to_string()),
            ("model_id", model_id.to_string()),
            ("digest", digest),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO catalog_meta(key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(entries.len())
    }

    fn load_entries(&mut self, category: &str) -> Result<Vec<CatalogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT category, product_id, image_path, embedding FROM catalog_entries WHERE category = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![category], read_entry_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn list_products(&mut self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT category, product_id FROM catalog_entries ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn categories(&mut self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT category FROM catalog_entries ORDER BY category ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalogStore {
    meta: Option<CatalogMeta>,
    entries: Vec<CatalogEntry>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored digest. Lets tests simulate an edited catalog.
    pub fn set_digest(&mut self, digest: &str) {
        if let Some(meta) = self.meta.as_mut() {
            meta.digest = digest.to_string();
        }
    }
}

impl CatalogStore for InMemoryCatalogStore {
    fn meta(&mut self) -> Result<Option<CatalogMeta>> {
        Ok(self.meta.clone())
    }

    fn save_entries(&mut self, model_id: &str, entries: &[CatalogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let dimension = check_batch(self.meta.as_ref(), model_id, entries)?;
        for entry in entries {
            if self
                .entries
                .iter()
                .any(|e| e.category == entry.category && e.product_id == entry.product_id)
            {
                bail!(
                    "product '{}' already exists in category '{}'",
                    entry.product_id,
                    entry.category
                );
            }
        }
        self.entries.extend_from_slice(entries);
        self.meta = Some(CatalogMeta {
            dimension,
            model_id: model_id.to_string(),
            digest: catalog_digest(&self.entries),
        });
        Ok(entries.len())
    }

    fn load_entries(&mut self, category: &str) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect())
    }

    fn list_products(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self
            .entries
            .iter()
            .map(|e| (e.category.clone(), e.product_id.clone()))
            .collect())
    }

    fn categories(&mut self) -> Result<Vec<String>> {
        let mut out: Vec<String> = self.entries.iter().map(|e| e.category.clone()).collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

// ----------------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------------

/// Validate a batch against the stored meta; returns the catalog dimension.
fn check_batch(meta: Option<&CatalogMeta>, model_id: &str, entries: &[CatalogEntry]) -> Result<usize> {
    let dimension = match (meta, entries.first()) {
        (Some(meta), _) => {
            if meta.model_id != model_id {
                bail!(
                    "catalog was built with model '{}', refusing entries from '{}'",
                    meta.model_id,
                    model_id
                );
            }
            meta.dimension
        }
        (None, Some(first)) => first.embedding.dimension(),
        (None, None) => return Ok(0),
    };
    if dimension == 0 {
        bail!("catalog embeddings must be non-empty");
    }
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if entry.embedding.dimension() != dimension {
            bail!(
                "product '{}' has dimension {}, catalog uses {}",
                entry.product_id,
                entry.embedding.dimension(),
                dimension
            );
        }
        if !seen.insert((entry.category.as_str(), entry.product_id.as_str())) {
            bail!(
                "product '{}' appears twice in category '{}'",
                entry.product_id,
                entry.category
            );
        }
    }
    Ok(dimension)
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Embedding> {
    if blob.len() % 4 != 0 {
        return Err(anyhow!("corrupt catalog: embedding blob of {} bytes", blob.len()));
    }
    Ok(Embedding::new(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    ))
}

/// Hex SHA-256 over `(category, product_id, embedding)` of every entry,
/// grouped by category name and in insertion order within a category.
pub fn catalog_digest(entries: &[CatalogEntry]) -> String {
    let mut ordered: Vec<&CatalogEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.category.cmp(&b.category));
    let mut hasher = Sha256::new();
    for entry in ordered {
        hasher.update(entry.category.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.product_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(encode_embedding(&entry.embedding));
    }
    hex::encode(hasher.finalize())
}

// ----------------------------------------------------------------------------
// Building and loading
// ----------------------------------------------------------------------------

/// Embed every image under `images_dir` as a product of `category`.
///
/// The product id is the file stem. Unreadable images and duplicate stems
/// are skipped with a warning.
pub fn build_catalog(images_dir: &Path, category: &str, embedder: &dyn Embedder) -> Result<Vec<CatalogEntry>> {
    if !images_dir.is_dir() {
        bail!("catalog image directory {} does not exist", images_dir.display());
    }
    let mut entries: Vec<CatalogEntry> = Vec::new();
    for dent in WalkDir::new(images_dir).sort_by_file_name() {
        let dent = match dent {
            Ok(d) => d,
            Err(e) => {
                log::warn!("catalog: skipping unreadable entry: {}", e);
                continue;
            }
        };
        let path = dent.path();
        if !dent.file_type().is_file() || !has_image_extension(path) {
            continue;
        }
        let Some(product_id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        if entries.iter().any(|e| e.product_id == product_id) {
            log::warn!("catalog: duplicate product id '{}' at {}, skipping", product_id, path.display());
            continue;
        }
        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                log::warn!("catalog: failed to read {}: {}", path.display(), e);
                continue;
            }
        };
        let embedding = match embedder.embed(&Frame::new(image, 0.0)) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("catalog: failed to embed {}: {}", path.display(), e);
                continue;
            }
        };
        entries.push(CatalogEntry {
            product_id,
            category: category.to_string(),
            image_path: path.display().to_string(),
            embedding,
        });
    }
    log::info!(
        "catalog: embedded {} '{}' products from {}",
        entries.len(),
        category,
        images_dir.display()
    );
    Ok(entries)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Build one similarity index per stored category.
///
/// An empty catalog yields an empty set. A catalog built with a different
/// embedding dimension, or whose digest no longer matches its entries, is
/// an error.
pub fn load_index_set(store: &mut dyn CatalogStore, embedder: &dyn Embedder) -> Result<IndexSet> {
    let mut set = IndexSet::new();
    let Some(meta) = store.meta()? else {
        log::warn!("catalog is empty; every query will return no matches");
        return Ok(set);
    };
    if meta.dimension != embedder.dimension() {
        bail!(
            "catalog dimension {} does not match embedder '{}' dimension {}",
            meta.dimension,
            embedder.model_id(),
            embedder.dimension()
        );
    }
    if meta.model_id != embedder.model_id() {
        log::warn!(
            "catalog was built with model '{}', embedding with '{}'",
            meta.model_id,
            embedder.model_id()
        );
    }

    let mut all = Vec::new();
    for category in store.categories()? {
        let entries = store.load_entries(&category)?;
        let index = SimilarityIndex::build(
            &category,
            meta.dimension,
            entries
                .iter()
                .map(|e| (e.product_id.clone(), e.embedding.clone())),
        )
        .with_context(|| format!("failed to build index for category '{}'", category))?;
        log::info!("index '{}': {} products", category, index.len());
        set.insert(index)?;
        all.extend(entries);
    }

    if catalog_digest(&all) != meta.digest {
        bail!("catalog digest mismatch: entries changed since the catalog was written");
    }
    Ok(set)
}

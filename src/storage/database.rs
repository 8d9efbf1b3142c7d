//! SQLite record store for detected products

use image::RgbImage;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use tracing::{debug, info, warn};

use super::codec::decode_base64_image;
use super::StoreError;

/// A persisted product record
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProduct {
    pub product_id: i64,
    /// Base64 text of the compressed product crop
    pub product_image: String,
    pub label_text: String,
}

impl StoredProduct {
    /// Decode the stored crop back into pixels
    pub fn decode_image(&self) -> Result<RgbImage, StoreError> {
        decode_base64_image(&self.product_image)
    }
}

/// Insert-only store of product crops and their label text.
///
/// The connection is released by [`ProductStore::close`] or, failing that, on drop.
pub struct ProductStore {
    conn: Option<Connection>,
}

impl ProductStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn: Some(conn) };
        store.init_schema()?;
        info!("Opened product store at {:?}", path);
        Ok(store)
    }

    /// Open an existing store without write access
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn: Some(conn) })
    }

    /// Transient store, mainly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Some(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    /// Create the products table if it does not exist
    pub fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS products (
              product_id INTEGER PRIMARY KEY,
              product_image BLOB,
              label_text TEXT
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert one record and return its assigned id. Autocommit, one statement per record.
    pub fn insert_product(&self, product_image: &str, label_text: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO products (product_image, label_text) VALUES (?1, ?2)",
            params![product_image, label_text],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Stored product {} (label {:?})", id, label_text);
        Ok(id)
    }

    /// Fetch a single record
    pub fn get_product(&self, product_id: i64) -> Result<Option<StoredProduct>, StoreError> {
        let product = self
            .conn()?
            .query_row(
                "SELECT product_id, product_image, label_text FROM products WHERE product_id = ?1",
                params![product_id],
                |row| {
                    Ok(StoredProduct {
                        product_id: row.get(0)?,
                        product_image: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        label_text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(product)
    }

    /// Number of stored records
    pub fn count(&self) -> Result<i64, StoreError> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Records in id order, optionally limited
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<StoredProduct>, StoreError> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT product_id, product_image, label_text FROM products ORDER BY product_id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(StoredProduct {
                product_id: row.get(0)?,
                product_image: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                label_text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            })
        })?;

        let mut products = Vec::new();
        for row in rows {
            products.push(row?);
        }
        Ok(products)
    }

    /// Whether the connection has been released
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| {
                warn!("Error while closing product store: {}", e);
                StoreError::Sqlite(e)
            })?;
            debug!("Product store closed");
        }
        Ok(())
    }
}

//! SQLite document store.
//!
//! Each document is stored as JSON next to the columns it is looked up by.
//! Read-modify-write operations run inside a transaction so the heartbeat's
//! find-and-modify is atomic with respect to other writers of the same file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_id::{CertificateId, DiskId, DocVersion, InstanceId, NodeId, ZoneId};
use fleet_model::{
    Certificate, Disk, HeartbeatFields, InstanceField, InstanceSpec, Node, NodeIdentity,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{CertificateStore, DiskStore, InstanceStore, NodeStore, StoreError, ZoneStore};

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL lets readers proceed while the heartbeat writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                node TEXT,
                doc TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_node ON instances(node);

            CREATE TABLE IF NOT EXISTS disks (
                id TEXT PRIMARY KEY,
                instance TEXT,
                doc TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_disks_instance ON disks(instance);

            CREATE TABLE IF NOT EXISTS certificates (
                id TEXT PRIMARY KEY,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS zones (
                id TEXT PRIMARY KEY
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn decode<T: DeserializeOwned>(doc: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_str(doc)?)
}

fn load_node(tx: &Transaction<'_>, id: NodeId) -> Result<Option<Node>, StoreError> {
    let doc: Option<String> = tx
        .query_row(
            "SELECT doc FROM nodes WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    doc.as_deref().map(decode).transpose()
}

fn store_node(tx: &Transaction<'_>, node: &Node) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO nodes (id, doc) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
        params![node.id.to_string(), serde_json::to_string(node)?],
    )?;
    Ok(())
}

fn load_instance(tx: &Transaction<'_>, id: InstanceId) -> Result<InstanceSpec, StoreError> {
    let doc: Option<String> = tx
        .query_row(
            "SELECT doc FROM instances WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match doc {
        Some(doc) => decode(&doc),
        None => Err(StoreError::not_found("instance", id)),
    }
}

fn store_instance(tx: &Transaction<'_>, spec: &InstanceSpec) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE instances SET node = ?2, doc = ?3 WHERE id = ?1",
        params![
            spec.id.to_string(),
            spec.node.map(|n| n.to_string()),
            serde_json::to_string(spec)?
        ],
    )?;
    Ok(())
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn find_node(&self, id: NodeId) -> Result<Node, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        load_node(&tx, id)?.ok_or_else(|| StoreError::not_found("node", id))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT doc FROM nodes ORDER BY id")?;
        let docs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|doc| decode(doc)).collect()
    }

    async fn upsert_identity(&self, identity: &NodeIdentity) -> Result<Node, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut node = load_node(&tx, identity.id)?.unwrap_or_else(|| Node::new(identity.id));
        identity.apply_to(&mut node);
        node.version = node.version.next();
        store_node(&tx, &node)?;

        tx.commit()?;
        Ok(node)
    }

    async fn heartbeat(&self, id: NodeId, fields: &HeartbeatFields) -> Result<Node, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut node = load_node(&tx, id)?.ok_or_else(|| StoreError::not_found("node", id))?;
        fields.apply_to(&mut node);
        node.version = node.version.next();
        store_node(&tx, &node)?;

        tx.commit()?;
        Ok(node)
    }

    async fn commit_node(&self, node: &Node) -> Result<DocVersion, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let stored =
            load_node(&tx, node.id)?.ok_or_else(|| StoreError::not_found("node", node.id))?;
        let mut next = node.clone();
        next.version = stored.version.next();
        store_node(&tx, &next)?;

        tx.commit()?;
        Ok(next.version)
    }
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn find_instance(&self, id: InstanceId) -> Result<InstanceSpec, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        load_instance(&tx, id)
    }

    async fn insert_instance(&self, spec: &InstanceSpec) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO instances (id, node, doc) VALUES (?1, ?2, ?3)",
            params![
                spec.id.to_string(),
                spec.node.map(|n| n.to_string()),
                serde_json::to_string(spec)?
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::conflict("instance", spec.id));
        }
        Ok(())
    }

    async fn commit_instance(&self, spec: &InstanceSpec) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        load_instance(&tx, spec.id)?;
        store_instance(&tx, spec)?;
        tx.commit()?;
        Ok(())
    }

    async fn commit_instance_fields(
        &self,
        spec: &InstanceSpec,
        fields: &[InstanceField],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stored = load_instance(&tx, spec.id)?;
        stored.copy_fields(spec, fields);
        store_instance(&tx, &stored)?;
        tx.commit()?;
        Ok(())
    }

    async fn remove_instance(&self, id: InstanceId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM instances WHERE id = ?1",
            params![id.to_string()],
        )?;
        if removed == 0 {
            return Err(StoreError::not_found("instance", id));
        }
        Ok(())
    }

    async fn list_node_instances(&self, node: NodeId) -> Result<Vec<InstanceSpec>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT doc FROM instances WHERE node = ?1 ORDER BY id")?;
        let docs = stmt
            .query_map(params![node.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|doc| decode(doc)).collect()
    }
}

#[async_trait]
impl DiskStore for SqliteStore {
    async fn put_disk(&self, disk: &Disk) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO disks (id, instance, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET instance = excluded.instance, doc = excluded.doc",
            params![
                disk.id.to_string(),
                disk.instance.map(|i| i.to_string()),
                serde_json::to_string(disk)?
            ],
        )?;
        Ok(())
    }

    async fn remove_disk(&self, id: DiskId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM disks WHERE id = ?1", params![id.to_string()])?;
        if removed == 0 {
            return Err(StoreError::not_found("disk", id));
        }
        Ok(())
    }

    async fn instance_disks(&self, instance: InstanceId) -> Result<Vec<Disk>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT doc FROM disks WHERE instance = ?1 ORDER BY id")?;
        let docs = stmt
            .query_map(params![instance.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter().map(|doc| decode(doc)).collect()
    }
}

#[async_trait]
impl CertificateStore for SqliteStore {
    async fn get_certificate(&self, id: CertificateId) -> Result<Certificate, StoreError> {
        let conn = self.conn()?;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM certificates WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(doc) => decode(&doc),
            None => Err(StoreError::not_found("certificate", id)),
        }
    }

    async fn put_certificate(&self, cert: &Certificate) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO certificates (id, doc) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc",
            params![cert.id.to_string(), serde_json::to_string(cert)?],
        )?;
        Ok(())
    }
}

#[async_trait]
impl ZoneStore for SqliteStore {
    async fn zone_exists(&self, id: ZoneId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM zones WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn add_zone(&self, id: ZoneId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO zones (id) VALUES (?1)",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

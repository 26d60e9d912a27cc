//! SQLite-backed order store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::store::{NewAcmeAccount, NewCertificate, NewPrivateKey, OrderStore, StoreError};
use super::types::{AcmeAccount, Certificate, Order, PostProcessingSettings, PrivateKey};
use crate::acme::{AcmeOrder, AcmeProblem, OrderStatus, ValidityWindow};
use crate::renewal::RenewalInfo;

const CERTIFICATE_COLUMNS: &str = "
    c.id AS c_id, c.name AS c_name, c.subject AS c_subject, c.subject_alt_names AS c_sans,
    c.preferred_root_cn AS c_preferred_root_cn, c.api_key AS c_api_key,
    c.post_processing AS c_post_processing, c.updated_at AS c_updated_at,
    a.id AS a_id, a.name AS a_name, a.acme_server_id AS a_acme_server_id, a.kid AS a_kid,
    ak.id AS ak_id, ak.name AS ak_name, ak.pem AS ak_pem, ak.api_key AS ak_api_key,
    ck.id AS ck_id, ck.name AS ck_name, ck.pem AS ck_pem, ck.api_key AS ck_api_key";

const CERTIFICATE_JOINS: &str = "
    JOIN acme_accounts a ON a.id = c.acme_account_id
    JOIN private_keys ak ON ak.id = a.private_key_id
    JOIN private_keys ck ON ck.id = c.private_key_id";

const ORDER_COLUMNS: &str = "
    o.id AS o_id, o.location AS o_location, o.status AS o_status,
    o.known_revoked AS o_known_revoked, o.error AS o_error, o.expires AS o_expires,
    o.dns_identifiers AS o_dns_identifiers, o.authorizations AS o_authorizations,
    o.finalize AS o_finalize, o.certificate_url AS o_certificate_url, o.pem AS o_pem,
    o.valid_from AS o_valid_from, o.valid_to AS o_valid_to, o.renewal_info AS o_renewal_info,
    o.created_at AS o_created_at, o.updated_at AS o_updated_at,
    fk.id AS fk_id, fk.name AS fk_name, fk.pem AS fk_pem, fk.api_key AS fk_api_key";

/// SQLite-backed order store.
pub struct SqliteOrderStore {
    conn: Mutex<Connection>,
}

impl SqliteOrderStore {
    /// Create a new SQLite order store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite order store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS private_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                pem TEXT NOT NULL,
                api_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS acme_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                acme_server_id INTEGER NOT NULL,
                private_key_id INTEGER NOT NULL REFERENCES private_keys(id),
                kid TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS certificates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                subject TEXT NOT NULL,
                subject_alt_names TEXT NOT NULL,
                acme_account_id INTEGER NOT NULL REFERENCES acme_accounts(id),
                private_key_id INTEGER NOT NULL REFERENCES private_keys(id),
                preferred_root_cn TEXT,
                api_key TEXT NOT NULL,
                post_processing TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                certificate_id INTEGER NOT NULL REFERENCES certificates(id),
                location TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                known_revoked INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                expires INTEGER,
                dns_identifiers TEXT NOT NULL,
                authorizations TEXT NOT NULL,
                finalize TEXT NOT NULL,
                finalized_key_id INTEGER REFERENCES private_keys(id),
                certificate_url TEXT,
                pem TEXT,
                valid_from INTEGER,
                valid_to INTEGER,
                renewal_info TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_orders_certificate_id ON orders(certificate_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            "#,
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn order_select(where_clause: &str) -> String {
        format!(
            "SELECT {}, {} FROM orders o JOIN certificates c ON c.id = o.certificate_id {} \
             LEFT JOIN private_keys fk ON fk.id = o.finalized_key_id {}",
            ORDER_COLUMNS, CERTIFICATE_COLUMNS, CERTIFICATE_JOINS, where_clause
        )
    }

    fn row_to_key(row: &Row, prefix: &str) -> rusqlite::Result<PrivateKey> {
        Ok(PrivateKey {
            id: row.get(format!("{}_id", prefix).as_str())?,
            name: row.get(format!("{}_name", prefix).as_str())?,
            pem: row.get(format!("{}_pem", prefix).as_str())?,
            api_key: row.get(format!("{}_api_key", prefix).as_str())?,
        })
    }

    fn row_to_certificate(row: &Row) -> rusqlite::Result<Certificate> {
        let sans_json: String = row.get("c_sans")?;
        let post_processing_json: String = row.get("c_post_processing")?;

        // JSON columns are written by this store only
        let subject_alt_names: Vec<String> = serde_json::from_str(&sans_json).unwrap_or_default();
        let post_processing: PostProcessingSettings =
            serde_json::from_str(&post_processing_json).unwrap_or_default();

        Ok(Certificate {
            id: row.get("c_id")?,
            name: row.get("c_name")?,
            subject: row.get("c_subject")?,
            subject_alt_names,
            account: AcmeAccount {
                id: row.get("a_id")?,
                name: row.get("a_name")?,
                acme_server_id: row.get("a_acme_server_id")?,
                kid: row.get("a_kid")?,
                key: Self::row_to_key(row, "ak")?,
            },
            key: Self::row_to_key(row, "ck")?,
            preferred_root_cn: row.get("c_preferred_root_cn")?,
            api_key: row.get("c_api_key")?,
            post_processing,
            updated_at: from_unix(row.get("c_updated_at")?),
        })
    }

    fn row_to_order(row: &Row) -> rusqlite::Result<Order> {
        let status: String = row.get("o_status")?;
        let error_json: Option<String> = row.get("o_error")?;
        let dns_json: String = row.get("o_dns_identifiers")?;
        let authorizations_json: String = row.get("o_authorizations")?;
        let renewal_json: Option<String> = row.get("o_renewal_info")?;
        let finalized_key_id: Option<i64> = row.get("fk_id")?;

        let finalized_key = match finalized_key_id {
            Some(_) => Some(Self::row_to_key(row, "fk")?),
            None => None,
        };

        Ok(Order {
            id: row.get("o_id")?,
            certificate: Self::row_to_certificate(row)?,
            location: row.get("o_location")?,
            status: OrderStatus::parse(&status),
            known_revoked: row.get("o_known_revoked")?,
            error: error_json.and_then(|json| serde_json::from_str::<AcmeProblem>(&json).ok()),
            expires: opt_from_unix(row.get("o_expires")?),
            dns_identifiers: serde_json::from_str(&dns_json).unwrap_or_default(),
            authorizations: serde_json::from_str(&authorizations_json).unwrap_or_default(),
            finalize: row.get("o_finalize")?,
            finalized_key,
            certificate_url: row.get("o_certificate_url")?,
            pem: row.get("o_pem")?,
            valid_from: opt_from_unix(row.get("o_valid_from")?),
            valid_to: opt_from_unix(row.get("o_valid_to")?),
            renewal_info: renewal_json.and_then(|json| RenewalInfo::from_json(&json)),
            created_at: from_unix(row.get("o_created_at")?),
            updated_at: from_unix(row.get("o_updated_at")?),
        })
    }

    fn query_orders(
        conn: &Connection,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Order>, StoreError> {
        let sql = Self::order_select(where_clause);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params, Self::row_to_order)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut orders = Vec::new();
        for row_result in rows {
            let order = row_result.map_err(|e| StoreError::Database(e.to_string()))?;
            orders.push(order);
        }

        Ok(orders)
    }

    fn execute_on_order(
        conn: &Connection,
        order_id: i64,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<(), StoreError> {
        let changed = conn
            .execute(sql, params)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "order",
                id: order_id,
            });
        }
        Ok(())
    }
}

impl OrderStore for SqliteOrderStore {
    fn insert_private_key(&self, key: NewPrivateKey) -> Result<PrivateKey, StoreError> {
        let conn = self.conn();
        let now = Utc::now().timestamp();

        conn.execute(
            "INSERT INTO private_keys (name, pem, api_key, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
            params![key.name, key.pem, key.api_key, now, now],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(PrivateKey {
            id: conn.last_insert_rowid(),
            name: key.name,
            pem: key.pem,
            api_key: key.api_key,
        })
    }

    fn insert_acme_account(&self, account: NewAcmeAccount) -> Result<i64, StoreError> {
        let conn = self.conn();
        let now = Utc::now().timestamp();

        conn.execute(
            "INSERT INTO acme_accounts (name, acme_server_id, private_key_id, kid, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                account.name,
                account.acme_server_id,
                account.private_key_id,
                account.kid,
                now,
                now
            ],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    fn insert_certificate(&self, certificate: NewCertificate) -> Result<Certificate, StoreError> {
        let id = {
            let conn = self.conn();
            let now = Utc::now().timestamp();

            conn.execute(
                "INSERT INTO certificates (name, subject, subject_alt_names, acme_account_id, private_key_id, preferred_root_cn, api_key, post_processing, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    certificate.name,
                    certificate.subject,
                    to_json(&certificate.subject_alt_names)?,
                    certificate.acme_account_id,
                    certificate.private_key_id,
                    certificate.preferred_root_cn,
                    certificate.api_key,
                    to_json(&certificate.post_processing)?,
                    now,
                    now
                ],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

            conn.last_insert_rowid()
        };

        self.get_one_certificate(id)
    }

    fn get_one_certificate(&self, id: i64) -> Result<Certificate, StoreError> {
        let conn = self.conn();

        let sql = format!(
            "SELECT {} FROM certificates c {} WHERE c.id = ?",
            CERTIFICATE_COLUMNS, CERTIFICATE_JOINS
        );
        let result = conn.query_row(&sql, params![id], Self::row_to_certificate);

        match result {
            Ok(certificate) => Ok(certificate),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(StoreError::NotFound {
                entity: "certificate",
                id,
            }),
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    fn get_one_order(&self, id: i64) -> Result<Order, StoreError> {
        let conn = self.conn();

        let sql = Self::order_select("WHERE o.id = ?");
        let result = conn.query_row(&sql, params![id], Self::row_to_order);

        match result {
            Ok(order) => Ok(order),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(StoreError::NotFound { entity: "order", id })
            }
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    fn get_orders(&self, ids: &[i64]) -> Result<Vec<Order>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let where_clause = format!("WHERE o.id IN ({}) ORDER BY o.id", placeholders);
        let params: Vec<&dyn rusqlite::ToSql> =
            ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();

        Self::query_orders(&conn, &where_clause, params.as_slice())
    }

    fn get_orders_by_cert(&self, certificate_id: i64) -> Result<Vec<Order>, StoreError> {
        let conn = self.conn();
        Self::query_orders(
            &conn,
            "WHERE o.certificate_id = ? ORDER BY o.created_at DESC, o.id DESC",
            params![certificate_id],
        )
    }

    fn post_new_order(&self, certificate_id: i64, acme: &AcmeOrder) -> Result<i64, StoreError> {
        let conn = self.conn();
        let now = Utc::now().timestamp();

        let dns_identifiers: Vec<&str> = acme
            .identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect();
        let error_json = acme.error.as_ref().map(to_json).transpose()?;

        conn.execute(
            "INSERT INTO orders (certificate_id, location, status, error, expires, dns_identifiers, authorizations, finalize, certificate_url, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(location) DO UPDATE SET \
                status = excluded.status, error = excluded.error, expires = excluded.expires, \
                dns_identifiers = excluded.dns_identifiers, authorizations = excluded.authorizations, \
                finalize = excluded.finalize, certificate_url = excluded.certificate_url, \
                updated_at = excluded.updated_at",
            params![
                certificate_id,
                acme.location,
                acme.status.as_str(),
                error_json,
                acme.expires.map(|t| t.timestamp()),
                to_json(&dns_identifiers)?,
                to_json(&acme.authorizations)?,
                acme.finalize,
                acme.certificate,
                now,
                now
            ],
        )
        .map_err(|e| StoreError::Database(e.to_string()))?;

        conn.query_row(
            "SELECT id FROM orders WHERE location = ?",
            params![acme.location],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn put_order_acme(&self, order_id: i64, acme: &AcmeOrder) -> Result<(), StoreError> {
        let conn = self.conn();

        let dns_identifiers: Vec<&str> = acme
            .identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect();
        let error_json = acme.error.as_ref().map(to_json).transpose()?;

        Self::execute_on_order(
            &conn,
            order_id,
            "UPDATE orders SET status = ?, error = ?, expires = ?, dns_identifiers = ?, authorizations = ?, finalize = ?, certificate_url = ?, updated_at = ? WHERE id = ?",
            params![
                acme.status.as_str(),
                error_json,
                acme.expires.map(|t| t.timestamp()),
                to_json(&dns_identifiers)?,
                to_json(&acme.authorizations)?,
                acme.finalize,
                acme.certificate,
                Utc::now().timestamp(),
                order_id
            ],
        )
    }

    fn put_order_invalid(&self, order_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::execute_on_order(
            &conn,
            order_id,
            "UPDATE orders SET status = ?, updated_at = ? WHERE id = ?",
            params![
                OrderStatus::Invalid.as_str(),
                Utc::now().timestamp(),
                order_id
            ],
        )
    }

    fn update_finalized_key(&self, order_id: i64, key_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::execute_on_order(
            &conn,
            order_id,
            "UPDATE orders SET finalized_key_id = ?, updated_at = ? WHERE id = ?",
            params![key_id, Utc::now().timestamp(), order_id],
        )
    }

    fn update_order_cert(
        &self,
        order_id: i64,
        pem: &str,
        validity: &ValidityWindow,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::execute_on_order(
            &conn,
            order_id,
            "UPDATE orders SET pem = ?, valid_from = ?, valid_to = ?, updated_at = ? WHERE id = ?",
            params![
                pem,
                validity.not_before.timestamp(),
                validity.not_after.timestamp(),
                Utc::now().timestamp(),
                order_id
            ],
        )
    }

    fn update_cert_updated_time(&self, certificate_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();

        let changed = conn
            .execute(
                "UPDATE certificates SET updated_at = ? WHERE id = ?",
                params![Utc::now().timestamp(), certificate_id],
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "certificate",
                id: certificate_id,
            });
        }
        Ok(())
    }

    fn get_all_valid_current_orders(&self, now: DateTime<Utc>) -> Result<Vec<Order>, StoreError> {
        let conn = self.conn();
        Self::query_orders(
            &conn,
            "WHERE o.status = 'valid' AND o.known_revoked = 0 AND o.pem IS NOT NULL \
             AND o.valid_to > ? \
             AND o.id = ( \
                SELECT o2.id FROM orders o2 \
                WHERE o2.certificate_id = o.certificate_id AND o2.status = 'valid' \
                AND o2.known_revoked = 0 AND o2.pem IS NOT NULL \
                ORDER BY o2.valid_to DESC, o2.id DESC LIMIT 1 \
             ) \
             ORDER BY o.id",
            params![now.timestamp()],
        )
    }

    fn get_all_incomplete_order_ids(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn();

        let mut stmt = conn
            .prepare(
                "SELECT id FROM orders WHERE status IN ('pending', 'ready', 'processing') ORDER BY id",
            )
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut ids = Vec::new();
        for row_result in rows {
            ids.push(row_result.map_err(|e| StoreError::Database(e.to_string()))?);
        }

        Ok(ids)
    }

    fn put_renewal_info(&self, order_id: i64, info: &RenewalInfo) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::execute_on_order(
            &conn,
            order_id,
            "UPDATE orders SET renewal_info = ?, updated_at = ? WHERE id = ?",
            params![to_json(info)?, Utc::now().timestamp(), order_id],
        )
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn opt_from_unix(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|secs| DateTime::from_timestamp(secs, 0))
}

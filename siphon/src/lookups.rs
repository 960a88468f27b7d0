//! Content-digest lookups (C3): `(value, month) -> surrogate_key` caches with
//! write-through, conflict-safe upsert. Two flavors: a UUID-keyed digest lookup
//! (certification lists, AFC config text) and an auto-increment integer lookup
//! for free-form strings (afc_server, customer, uls_data_version, geo_data_version).

use std::collections::HashMap;
use std::sync::RwLock;

use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// `(value, month) -> auto-increment surrogate key`, backed by a table shaped
/// `(id serial primary key, value text unique, month_idx int)`.
pub struct StringLookup {
    table: &'static str,
    cache: RwLock<HashMap<String, i32>>,
}

impl StringLookup {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn invalidate(&self) {
        self.cache.write().unwrap().clear();
    }

    pub fn key_for(&self, value: &str) -> Option<i32> {
        self.cache.read().unwrap().get(value).copied()
    }

    /// Inserts any `values` not already cached, then reads back the surrogate
    /// key for every value (inserted or pre-existing) into the cache.
    pub async fn update_db(
        &self,
        conn: &mut PgConnection,
        values: &[String],
        month_idx: i32,
    ) -> Result<(), sqlx::Error> {
        let missing: Vec<String> = {
            let cache = self.cache.read().unwrap();
            values
                .iter()
                .filter(|v| !cache.contains_key(v.as_str()))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let query = format!(
            "INSERT INTO {table} (value, month_idx) \
             SELECT * FROM UNNEST($1::text[], $2::int[]) \
             ON CONFLICT (value) DO NOTHING",
            table = self.table
        );
        let month_idxs: Vec<i32> = missing.iter().map(|_| month_idx).collect();
        sqlx::query(&query)
            .bind(&missing)
            .bind(&month_idxs)
            .execute(&mut *conn)
            .await?;

        let select = format!("SELECT id, value FROM {table} WHERE value = ANY($1)", table = self.table);
        let rows = sqlx::query(&select).bind(&missing).fetch_all(&mut *conn).await?;
        let mut cache = self.cache.write().unwrap();
        for row in rows {
            let id: i32 = row.try_get("id")?;
            let value: String = row.try_get("value")?;
            cache.insert(value, id);
        }
        Ok(())
    }
}

/// `(content-digest UUID, month) -> itself`, backed by a table shaped
/// `(id uuid primary key, <value columns...>, month_idx int)`. The surrogate key
/// *is* the content digest, so the cache only needs to record presence.
pub struct DigestLookup {
    table: &'static str,
    present: RwLock<std::collections::HashSet<Uuid>>,
}

impl DigestLookup {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            present: RwLock::new(std::collections::HashSet::new()),
        }
    }

    pub fn invalidate(&self) {
        self.present.write().unwrap().clear();
    }

    pub fn is_present(&self, id: Uuid) -> bool {
        self.present.read().unwrap().contains(&id)
    }

    pub fn mark_present(&self, ids: impl IntoIterator<Item = Uuid>) {
        self.present.write().unwrap().extend(ids);
    }

    /// Returns the `id`s that are not yet known present, for callers that need to
    /// build and upsert rows themselves (the table updaters own the value schema,
    /// this lookup only owns the presence cache).
    pub fn missing(&self, ids: &[Uuid]) -> Vec<Uuid> {
        let present = self.present.read().unwrap();
        ids.iter().filter(|id| !present.contains(id)).copied().collect()
    }

    pub fn table(&self) -> &'static str {
        self.table
    }
}

/// Registry of every C3 lookup the table updaters depend on.
pub struct Lookups {
    pub afc_server: StringLookup,
    pub customer: StringLookup,
    pub uls_data_version: StringLookup,
    pub geo_data_version: StringLookup,
    pub certification: DigestLookup,
    pub afc_config: DigestLookup,
}

impl Default for Lookups {
    fn default() -> Self {
        Self::new()
    }
}

impl Lookups {
    pub fn new() -> Self {
        Self {
            afc_server: StringLookup::new("afc_server"),
            customer: StringLookup::new("customer"),
            uls_data_version: StringLookup::new("uls_data_version"),
            geo_data_version: StringLookup::new("geo_data_version"),
            certification: DigestLookup::new("certification"),
            afc_config: DigestLookup::new("afc_config"),
        }
    }

    /// Forces every lookup to re-read from Postgres on next `update_db`. Called
    /// after a rolled-back transaction per §4.3's eventual-consistency contract.
    pub fn invalidate_all(&self) {
        self.afc_server.invalidate();
        self.customer.invalidate();
        self.uls_data_version.invalidate();
        self.geo_data_version.invalidate();
        self.certification.invalidate();
        self.afc_config.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lookup_tracks_presence_without_db() {
        let lookup = DigestLookup::new("certification");
        let id = Uuid::new_v4();
        assert!(!lookup.is_present(id));
        assert_eq!(lookup.missing(&[id]), vec![id]);
        lookup.mark_present([id]);
        assert!(lookup.is_present(id));
        assert!(lookup.missing(&[id]).is_empty());
    }

    #[test]
    fn string_lookup_cache_starts_empty() {
        let lookup = StringLookup::new("customer");
        assert_eq!(lookup.key_for("acme"), None);
    }
}

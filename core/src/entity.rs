//! EntityStore (C3) — canonical entity keys, secondary indexes,
//! ownership/visibility access rules, and the legacy-key migration
//! engine, all layered on top of [`crate::kv::KvStore`].

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::kv::{KvStore, PutOptions};

/// `{service}:{entity}:{id}`
pub fn entity_key(service: &str, entity: &str, id: &str) -> String {
    format!("{service}:{entity}:{id}")
}

/// `idx:{service}:{relationship}:{parent}`
pub fn index_key(service: &str, relationship: &str, parent: &str) -> String {
    format!("idx:{service}:{relationship}:{parent}")
}

/// Splits a canonical entity key, rejecting anything that isn't exactly
/// three colon-separated components.
pub fn parse_entity_key(key: &str) -> CoreResult<(&str, &str, &str)> {
    let parts: Vec<&str> = key.split(':').collect();
    match parts.as_slice() {
        [service, entity, id] => Ok((service, entity, id)),
        _ => Err(CoreError::Validation(format!(
            "not a valid entity key: {key}"
        ))),
    }
}

/// Splits a canonical index key, rejecting anything that isn't exactly
/// four colon-separated components with a leading `idx` segment.
pub fn parse_index_key(key: &str) -> CoreResult<(&str, &str, &str)> {
    let parts: Vec<&str> = key.split(':').collect();
    match parts.as_slice() {
        ["idx", service, relationship, parent] => Ok((service, relationship, parent)),
        _ => Err(CoreError::Validation(format!(
            "not a valid index key: {key}"
        ))),
    }
}

/// Anything stored through the entity store carries an owner and an
/// `updatedAt` stamp that `putEntity` refreshes on every write.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn customer_id(&self) -> Option<&str>;
    fn visibility(&self) -> Visibility {
        Visibility::Private
    }
    fn set_updated_at(&mut self, at: chrono::DateTime<Utc>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
    Unlisted,
}

#[derive(Debug, Clone, Copy)]
pub enum Action {
    Read,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub customer_id: Option<String>,
    pub is_admin: bool,
}

impl AccessContext {
    pub fn can_access_owned(&self, owner: Option<&str>) -> bool {
        self.is_admin || matches!((owner, &self.customer_id), (Some(o), Some(c)) if o == c)
    }

    pub fn can_access_visible(&self, owner: Option<&str>, visibility: Visibility) -> bool {
        matches!(visibility, Visibility::Public | Visibility::Unlisted) || self.can_access_owned(owner)
    }

    pub fn can_modify(&self, owner: Option<&str>) -> bool {
        self.can_access_owned(owner) && (self.customer_id.is_some() || self.is_admin)
    }

    pub fn can_delete(&self, owner: Option<&str>) -> bool {
        self.can_modify(owner)
    }

    /// Throws `Forbidden` on denial, matching `assertAccess` in the spec.
    pub fn assert_access<E: Entity>(&self, entity: &E, action: Action) -> CoreResult<()> {
        let owner = entity.customer_id();
        let allowed = match action {
            Action::Read => self.can_access_visible(owner, entity.visibility()),
            Action::Modify => self.can_modify(owner),
            Action::Delete => self.can_delete(owner),
        };
        if allowed {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!("{:?} denied", action)))
        }
    }
}

/// Apply an access predicate to a list, preserving input order.
pub fn filter_visible<E: Entity>(entities: Vec<E>, ctx: &AccessContext) -> Vec<E> {
    entities
        .into_iter()
        .filter(|e| ctx.can_access_visible(e.customer_id(), e.visibility()))
        .collect()
}

pub fn filter_owned<E: Entity>(entities: Vec<E>, ctx: &AccessContext) -> Vec<E> {
    entities
        .into_iter()
        .filter(|e| ctx.can_access_owned(e.customer_id()))
        .collect()
}

pub struct EntityStore {
    kv: Arc<dyn KvStore>,
}

impl EntityStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        EntityStore { kv }
    }

    pub async fn get_entity<E: DeserializeOwned>(&self, service: &str, entity: &str, id: &str) -> Option<E> {
        self.kv.get_json(&entity_key(service, entity, id)).await
    }

    /// Stamps `updatedAt` to now before writing.
    pub async fn put_entity<E: Entity>(&self, service: &str, entity: &str, id: &str, mut data: E) {
        data.set_updated_at(Utc::now());
        self.kv
            .put_json(&entity_key(service, entity, id), &data, PutOptions::default())
            .await;
    }

    pub async fn delete_entity(&self, service: &str, entity: &str, id: &str) {
        self.kv.delete(&entity_key(service, entity, id)).await;
    }

    pub async fn get_entities<E: DeserializeOwned>(&self, service: &str, entity: &str, ids: &[String]) -> Vec<Option<E>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_entity(service, entity, id).await);
        }
        out
    }

    /// Same as `get_entities` with the `None`s stripped.
    pub async fn get_existing_entities<E: DeserializeOwned>(
        &self,
        service: &str,
        entity: &str,
        ids: &[String],
    ) -> Vec<E> {
        self.get_entities(service, entity, ids)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn put_entities<E: Entity>(&self, service: &str, entity: &str, items: Vec<(String, E)>) {
        for (id, data) in items {
            self.put_entity(service, entity, &id, data).await;
        }
    }

    pub async fn delete_entities(&self, service: &str, entity: &str, ids: &[String]) {
        for id in ids {
            self.delete_entity(service, entity, id).await;
        }
    }

    // ---- index ops (set-valued) ----

    pub async fn index_get(&self, service: &str, relationship: &str, parent: &str) -> Vec<String> {
        self.kv
            .get_json(&index_key(service, relationship, parent))
            .await
            .unwrap_or_default()
    }

    pub async fn index_has(&self, service: &str, relationship: &str, parent: &str, id: &str) -> bool {
        self.index_get(service, relationship, parent)
            .await
            .iter()
            .any(|x| x == id)
    }

    pub async fn index_count(&self, service: &str, relationship: &str, parent: &str) -> usize {
        self.index_get(service, relationship, parent).await.len()
    }

    /// Dedup on insert.
    pub async fn index_add(&self, service: &str, relationship: &str, parent: &str, id: &str) {
        let mut list = self.index_get(service, relationship, parent).await;
        if !list.iter().any(|x| x == id) {
            list.push(id.to_string());
            self.kv
                .put_json(&index_key(service, relationship, parent), &list, PutOptions::default())
                .await;
        }
    }

    /// Compact; deletes the key entirely once it empties out.
    pub async fn index_remove(&self, service: &str, relationship: &str, parent: &str, id: &str) {
        let mut list = self.index_get(service, relationship, parent).await;
        list.retain(|x| x != id);
        let key = index_key(service, relationship, parent);
        if list.is_empty() {
            self.kv.delete(&key).await;
        } else {
            self.kv.put_json(&key, &list, PutOptions::default()).await;
        }
    }

    pub async fn index_set(&self, service: &str, relationship: &str, parent: &str, ids: Vec<String>) {
        let key = index_key(service, relationship, parent);
        if ids.is_empty() {
            self.kv.delete(&key).await;
        } else {
            self.kv.put_json(&key, &ids, PutOptions::default()).await;
        }
    }

    // ---- index ops (single-valued) ----

    pub async fn index_set_single(&self, service: &str, relationship: &str, lookup_key: &str, id: &str) {
        self.kv
            .put_text(
                &index_key(service, relationship, lookup_key),
                id,
                PutOptions::default(),
            )
            .await;
    }

    pub async fn index_get_single(&self, service: &str, relationship: &str, lookup_key: &str) -> Option<String> {
        self.kv
            .get_text(&index_key(service, relationship, lookup_key))
            .await
    }

    pub async fn index_delete_single(&self, service: &str, relationship: &str, lookup_key: &str) {
        self.kv.delete(&index_key(service, relationship, lookup_key)).await;
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }
}

// ---------------------------------------------------------------------
// Migration engine
// ---------------------------------------------------------------------

const MIGRATION_BATCH_SIZE: usize = 1000;
const MIGRATION_ERROR_TRUNCATE: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: String,
    pub status: MigrationStatus,
    pub processed_count: u64,
    pub error_count: u64,
    pub errors: Vec<String>,
    pub dry_run: bool,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
}

/// What a service-provided `transform` callback returns for one legacy
/// key, or `None` to skip it.
pub struct TransformedEntity {
    pub entity_type: String,
    pub id: String,
    pub data: Value,
    /// `(relationship, parent)` pairs this entity should be set-indexed
    /// under (via `index_add`, dedup-on-insert, list-valued).
    pub indexes: Vec<(String, String)>,
    /// `(relationship, lookup_key)` pairs this entity should be
    /// single-indexed under (via `index_set_single`) — for relationships
    /// like `by-email` that every other writer also maintains as a single
    /// text value rather than a list.
    pub single_indexes: Vec<(String, String)>,
}

pub struct MigrationOptions {
    pub dry_run: bool,
    pub delete_old: bool,
}

impl EntityStore {
    /// Scans `old_prefix` in batches of up to 1000 keys, feeding each
    /// `(oldKey, oldValue)` pair to `transform`. Writes are skipped
    /// entirely in dry-run mode. Progress is tracked in a
    /// `MigrationRecord` stored at `migration:{id}`.
    pub async fn migrate<F>(
        &self,
        migration_id: &str,
        service: &str,
        old_prefix: &str,
        opts: MigrationOptions,
        transform: F,
    ) -> MigrationRecord
    where
        F: Fn(&str, &[u8]) -> Option<TransformedEntity>,
    {
        let mut record = MigrationRecord {
            id: migration_id.to_string(),
            status: MigrationStatus::Running,
            processed_count: 0,
            error_count: 0,
            errors: Vec::new(),
            dry_run: opts.dry_run,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.save_migration_record(&record).await;

        let mut cursor: Option<String> = None;
        loop {
            let page = self.kv.list(old_prefix, cursor.clone(), MIGRATION_BATCH_SIZE).await;
            for old_key in &page.keys {
                let Some(raw) = self.kv.get_bytes(old_key).await else {
                    continue;
                };
                match transform(old_key, &raw) {
                    None => continue,
                    Some(t) => {
                        record.processed_count += 1;
                        if !opts.dry_run {
                            self.kv
                                .put_json(&entity_key(service, &t.entity_type, &t.id), &t.data, PutOptions::default())
                                .await;
                            for (relationship, parent) in &t.indexes {
                                self.index_add(service, relationship, parent, &t.id).await;
                            }
                            for (relationship, lookup_key) in &t.single_indexes {
                                self.index_set_single(service, relationship, lookup_key, &t.id).await;
                            }
                            if opts.delete_old {
                                self.kv.delete(old_key).await;
                            }
                        }
                    }
                }
            }
            if page.complete {
                break;
            }
            cursor = page.next_cursor;
        }

        record.status = if record.error_count > 0 {
            MigrationStatus::Failed
        } else {
            MigrationStatus::Completed
        };
        record.finished_at = Some(Utc::now());
        if record.errors.len() > MIGRATION_ERROR_TRUNCATE {
            record.errors.truncate(MIGRATION_ERROR_TRUNCATE);
        }
        self.save_migration_record(&record).await;
        record
    }

    async fn save_migration_record(&self, record: &MigrationRecord) {
        self.kv
            .put_json(&format!("migration:{}", record.id), record, PutOptions::default())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        customer_id: String,
        updated_at: chrono::DateTime<Utc>,
    }

    impl Entity for Widget {
        fn customer_id(&self) -> Option<&str> {
            Some(&self.customer_id)
        }
        fn set_updated_at(&mut self, at: chrono::DateTime<Utc>) {
            self.updated_at = at;
        }
    }

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_stamps_updated_at() {
        let store = store();
        let w = Widget {
            customer_id: "cust_1".into(),
            updated_at: Utc::now() - chrono::Duration::days(1),
        };
        let before = w.updated_at;
        store.put_entity("svc", "widget", "w1", w).await;
        let got: Widget = store.get_entity("svc", "widget", "w1").await.unwrap();
        assert!(got.updated_at > before);
    }

    #[tokio::test]
    async fn index_add_dedupes() {
        let store = store();
        store.index_add("svc", "owns", "parent1", "child1").await;
        store.index_add("svc", "owns", "parent1", "child1").await;
        assert_eq!(store.index_count("svc", "owns", "parent1").await, 1);
    }

    #[tokio::test]
    async fn index_remove_deletes_key_when_empty() {
        let store = store();
        store.index_add("svc", "owns", "p", "c").await;
        store.index_remove("svc", "owns", "p", "c").await;
        assert!(store.kv().get_bytes("idx:svc:owns:p").await.is_none());
    }

    #[test]
    fn parse_entity_key_rejects_wrong_arity() {
        assert!(parse_entity_key("a:b:c").is_ok());
        assert!(parse_entity_key("a:b").is_err());
        assert!(parse_entity_key("a:b:c:d").is_err());
    }

    #[test]
    fn parse_index_key_requires_idx_prefix() {
        assert!(parse_index_key("idx:svc:rel:parent").is_ok());
        assert!(parse_index_key("svc:rel:parent:x").is_err());
    }

    #[test]
    fn access_context_owner_vs_admin() {
        let owner = AccessContext {
            customer_id: Some("c1".into()),
            is_admin: false,
        };
        let admin = AccessContext {
            customer_id: None,
            is_admin: true,
        };
        let stranger = AccessContext {
            customer_id: Some("c2".into()),
            is_admin: false,
        };
        assert!(owner.can_access_owned(Some("c1")));
        assert!(!stranger.can_access_owned(Some("c1")));
        assert!(admin.can_access_owned(Some("c1")));
    }

    #[test]
    fn visible_allows_public_to_anyone() {
        let stranger = AccessContext {
            customer_id: Some("c2".into()),
            is_admin: false,
        };
        assert!(stranger.can_access_visible(Some("c1"), Visibility::Public));
        assert!(!stranger.can_access_visible(Some("c1"), Visibility::Private));
    }

    #[tokio::test]
    async fn migration_dry_run_leaves_both_keys_intact() {
        let store = store();
        store
            .kv()
            .put_text("customer_cust_abc", "{\"email\":\"a@b.com\"}", PutOptions::default())
            .await;

        let record = store
            .migrate(
                "migration_1",
                "customer",
                "customer_",
                MigrationOptions {
                    dry_run: true,
                    delete_old: false,
                },
                |_old_key, raw| {
                    let v: Value = serde_json::from_slice(raw).ok()?;
                    Some(TransformedEntity {
                        entity_type: "profile".into(),
                        id: "cust_abc".into(),
                        data: v,
                        indexes: vec![],
                        single_indexes: vec![],
                    })
                },
            )
            .await;

        assert_eq!(record.processed_count, 1);
        assert_eq!(record.error_count, 0);
        assert!(store.kv().get_bytes("customer_cust_abc").await.is_some());
        assert!(store.get_entity::<Value>("customer", "profile", "cust_abc").await.is_none());
    }

    #[tokio::test]
    async fn migration_real_run_moves_and_indexes() {
        let store = store();
        store
            .kv()
            .put_text("customer_cust_abc", "{\"email\":\"a@b.com\"}", PutOptions::default())
            .await;

        store
            .migrate(
                "migration_2",
                "customer",
                "customer_",
                MigrationOptions {
                    dry_run: false,
                    delete_old: true,
                },
                |_old_key, raw| {
                    let v: Value = serde_json::from_slice(raw).ok()?;
                    Some(TransformedEntity {
                        entity_type: "profile".into(),
                        id: "cust_abc".into(),
                        data: v,
                        indexes: vec![],
                        single_indexes: vec![("by-email".into(), "emailhash123".into())],
                    })
                },
            )
            .await;

        assert!(store.kv().get_bytes("customer_cust_abc").await.is_none());
        assert!(store
            .get_entity::<Value>("customer", "profile", "cust_abc")
            .await
            .is_some());
        assert_eq!(
            store.index_get_single("customer", "by-email", "emailhash123").await.as_deref(),
            Some("cust_abc")
        );
    }
}

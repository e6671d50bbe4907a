//! Entry point for callers. Owns the rule that `validFrom` / `validTo`
//! are server-generated: whatever a payload says about them never
//! reaches the store.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::FieldPolicy;
use crate::error::{ApiError, ApiResult};
use crate::model::{Book, BookId, BookView, Record};
use crate::VersionedStore;

pub const READ_ONLY_FIELDS: [&str; 2] = ["validFrom", "validTo"];

#[derive(Deserialize, Debug)]
struct CreatePayload {
    #[serde(rename = "ID")]
    id: BookId,
    #[serde(default)]
    title: String,
    #[serde(default)]
    stock: i64,
}

#[derive(Deserialize, Debug, Default)]
struct UpdatePayload {
    #[serde(rename = "ID")]
    id: Option<BookId>,
    title: Option<String>,
    stock: Option<i64>,
}

/// Filters for list reads. Absent fields match everything.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct ListFilter {
    pub title: Option<String>,
    pub min_stock: Option<i64>,
}

impl ListFilter {
    pub fn matches(&self, r: &Record) -> bool {
        self.title.as_deref().map_or(true, |t| r.fields.title.contains(t))
            && self.min_stock.map_or(true, |m| r.fields.stock >= m)
    }
}

#[derive(Debug, Clone)]
pub struct EntryPoint {
    store: Arc<VersionedStore>,
    policy: FieldPolicy,
}

impl EntryPoint {
    pub fn new(store: Arc<VersionedStore>, policy: FieldPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<VersionedStore> {
        &self.store
    }

    /// Create a book from an untrusted JSON object. Extra keys are ignored.
    pub fn handle_create(&self, payload: Value) -> ApiResult<BookView> {
        let body = self.scrub(payload)?;
        let req: CreatePayload = serde_json::from_value(Value::Object(body))
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        let record = self.store.insert(req.id, Book::new(req.title, req.stock))?;
        Ok(BookView::from(&record))
    }

    /// Partial update: only the business fields present in the payload change.
    pub fn handle_update(&self, id: BookId, payload: Value) -> ApiResult<BookView> {
        let body = self.scrub(payload)?;
        let req: UpdatePayload = serde_json::from_value(Value::Object(body))
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        if let Some(body_id) = req.id {
            if body_id != id {
                return Err(ApiError::Validation(format!("ID {} in body does not match {}", body_id, id)));
            }
        }

        let record = self.store.modify(id, |current| Book {
            title: req.title.unwrap_or_else(|| current.title.clone()),
            stock: req.stock.unwrap_or(current.stock),
        })?;
        Ok(BookView::from(&record))
    }

    pub fn handle_delete(&self, id: BookId) -> ApiResult<()> {
        Ok(self.store.delete(id)?)
    }

    pub fn list(&self, filter: &ListFilter) -> ApiResult<Vec<BookView>> {
        let rows = self.store.read_active(|r| filter.matches(r))?;
        Ok(rows.map(|r| BookView::from(&r)).collect())
    }

    pub fn get(&self, id: BookId) -> ApiResult<BookView> {
        let record = self
            .store
            .get_active(id)?
            .ok_or(crate::error::StoreError::NotFound(id))?;
        Ok(BookView::from(&record))
    }

    pub fn as_of(&self, id: BookId, ts: u64) -> ApiResult<BookView> {
        Ok(self.store.read_as_of(id, ts)?.view())
    }

    /// Audit read over the history table; `None` selects every book.
    pub fn history(&self, id: Option<BookId>) -> ApiResult<Vec<BookView>> {
        let rows = match id {
            Some(id) => self.store.history(id)?,
            None => self.store.history_all()?,
        };
        Ok(rows.iter().map(BookView::from).collect())
    }

    fn scrub(&self, payload: Value) -> ApiResult<Map<String, Value>> {
        let Value::Object(mut body) = payload else {
            return Err(ApiError::Validation("expected a JSON object".into()));
        };

        for field in READ_ONLY_FIELDS {
            if body.contains_key(field) {
                match self.policy {
                    FieldPolicy::Strip => {
                        body.remove(field);
                        debug!(field, "dropped server-generated field from payload");
                    }
                    FieldPolicy::Reject => return Err(ApiError::ReadOnlyField(field.to_string())),
                }
            }
        }
        Ok(body)
    }
}

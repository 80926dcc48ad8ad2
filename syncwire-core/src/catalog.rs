//! Entity catalog.
//!
//! A [`Catalog`] resolves `(schema, entity)` to a [`ModelDescriptor`] by
//! searching its registries in order.

use crate::error::CatalogError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Shape of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub schema: String,
    pub entity: String,
    pub table: String,
    pub primary_key: String,
    #[serde(default)]
    pub columns: Vec<ColumnDescriptor>,
}

impl ModelDescriptor {
    /// Descriptor with table `{schema}.{entity}` and primary key `id`.
    pub fn new(schema: impl Into<String>, entity: impl Into<String>) -> Self {
        let schema = schema.into();
        let entity = entity.into();
        Self {
            table: format!("{}.{}", schema, entity),
            schema,
            entity,
            primary_key: "id".to_string(),
            columns: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidModel {
            schema: self.schema.clone(),
            entity: self.entity.clone(),
            reason: reason.to_string(),
        };
        if self.table.is_empty() {
            return Err(invalid("table name is empty"));
        }
        if self.primary_key.is_empty() {
            return Err(invalid("primary key is empty"));
        }
        if !self.columns.is_empty() && !self.columns.iter().any(|c| c.name == self.primary_key) {
            return Err(invalid(&format!(
                "primary key '{}' is not a declared column",
                self.primary_key
            )));
        }
        Ok(())
    }
}

/// One set of models.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<(String, String), ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a model.
    ///
    /// Descriptors are stored as given; validation happens on resolve.
    pub fn register(&self, model: ModelDescriptor) {
        let key = (model.schema.clone(), model.entity.clone());
        self.models.write().insert(key, model);
    }

    pub fn get(&self, schema: &str, entity: &str) -> Option<ModelDescriptor> {
        self.models
            .read()
            .get(&(schema.to_string(), entity.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered list of registries; the first match wins.
#[derive(Debug, Default)]
pub struct Catalog {
    registries: Vec<Arc<ModelRegistry>>,
    permissive: bool,
}

impl Catalog {
    pub fn new(registries: Vec<Arc<ModelRegistry>>) -> Self {
        Self {
            registries,
            permissive: false,
        }
    }

    /// A catalog that synthesizes a default descriptor for unknown entities.
    pub fn permissive() -> Self {
        Self {
            registries: Vec::new(),
            permissive: true,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    pub fn resolve(&self, schema: &str, entity: &str) -> Result<ModelDescriptor, CatalogError> {
        let found = self
            .registries
            .iter()
            .find_map(|registry| registry.get(schema, entity));

        match found {
            Some(model) => {
                model.validate()?;
                Ok(model)
            }
            None if self.permissive => Ok(ModelDescriptor::new(schema, entity)),
            None => Err(CatalogError::ModelNotFound {
                schema: schema.to_string(),
                entity: entity.to_string(),
            }),
        }
    }
}
